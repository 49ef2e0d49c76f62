use std::path::Path;

use anyhow::{Context, Result};
use log::LevelFilter;
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};

const LOG_PATTERN: &str = "[{d(%Y-%m-%dT%H:%M:%SZ)(utc)}]{h({l})}: {M} - {m}{n}";

/// Routes the `log` macros to the console and, when configured, to a plain
/// text file using the same format.
///
/// Safe to call more than once; only the first initialization wins.
pub(crate) fn init(log_file: Option<&Path>) -> Result<()> {
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let mut config = Config::builder().appender(Appender::builder().build("console", Box::new(console)));
    let mut root = Root::builder().appender("console");

    if let Some(path) = log_file {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(path)
            .with_context(|| format!("unable to open log file {}", path.display()))?;
        config = config.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    let config = config
        .build(root.build(LevelFilter::Debug))
        .context("invalid logging configuration")?;

    // A second init means a sink is already in place; keep it.
    let _ = log4rs::init_config(config);
    Ok(())
}
