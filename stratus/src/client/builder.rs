use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Result};

use crate::{connection::ConnectionHandler, logging};

use super::DeviceClient;

const DEFAULT_LOOP_TIME: Duration = Duration::from_secs(5);
const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_THREAD_COUNT: usize = 3;

/// Connection settings, frozen once [`DeviceClientBuilder::build`] runs.
#[derive(Debug, Clone)]
pub(crate) struct ClientConfig {
    /// Device identity; doubles as MQTT client id and username.
    pub(crate) app_key: String,
    /// MQTT password.
    pub(crate) cloud_token: String,
    pub(crate) cloud_host: String,
    pub(crate) cloud_port: u16,
    /// When set, MQTT and HTTP both use TLS verified against this bundle.
    pub(crate) ca_bundle_file: Option<PathBuf>,
    /// Parent of the `upload/` and `download/` directories.
    pub(crate) runtime_dir: PathBuf,
    pub(crate) log_file: Option<PathBuf>,
    /// Granularity of the transport loop: MQTT pump slice, timeout sweep
    /// interval, and worker poll timeout.
    pub(crate) loop_time: Duration,
    /// How long a request may wait for its reply before it is swept.
    pub(crate) message_timeout: Duration,
    pub(crate) thread_count: usize,
}

/// A builder for [`DeviceClient`] configuring the connection to the platform.
pub struct DeviceClientBuilder {
    app_key: String,
    cloud_token: String,
    cloud_host: String,
    cloud_port: u16,
    ca_bundle_file: Option<PathBuf>,
    runtime_dir: PathBuf,
    log_file: Option<PathBuf>,
    loop_time: Duration,
    message_timeout: Duration,
    thread_count: usize,
}

impl DeviceClientBuilder {
    /// Creates a builder with the required connection identity:
    ///
    /// * `app_key`: the device identity; used as the MQTT client id and
    ///   username.
    /// * `cloud_token`: the credential paired with the key.
    /// * `cloud_host`/`cloud_port`: the platform broker endpoint.
    pub fn new(
        app_key: impl Into<String>,
        cloud_token: impl Into<String>,
        cloud_host: impl Into<String>,
        cloud_port: u16,
    ) -> Self {
        DeviceClientBuilder {
            app_key: app_key.into(),
            cloud_token: cloud_token.into(),
            cloud_host: cloud_host.into(),
            cloud_port,
            ca_bundle_file: None,
            runtime_dir: PathBuf::from("."),
            log_file: None,
            loop_time: DEFAULT_LOOP_TIME,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            thread_count: DEFAULT_THREAD_COUNT,
        }
    }

    /// Verify the broker and the file endpoints against this CA bundle and
    /// talk TLS (1.2 or newer) to both.
    pub fn with_ca_bundle(mut self, path: impl AsRef<Path>) -> Self {
        self.ca_bundle_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Directory holding `upload/` and `download/`. Defaults to the current
    /// directory.
    pub fn with_runtime_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.runtime_dir = path.as_ref().to_path_buf();
        self
    }

    /// Copy the console log into this file as well.
    pub fn with_log_file(mut self, path: impl AsRef<Path>) -> Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Transport loop granularity. Defaults to 5 seconds.
    pub fn with_loop_time(mut self, loop_time: Duration) -> Self {
        self.loop_time = loop_time;
        self
    }

    /// How long to wait for a command reply before giving up on it.
    /// Defaults to 15 seconds.
    pub fn with_message_timeout(mut self, message_timeout: Duration) -> Self {
        self.message_timeout = message_timeout;
        self
    }

    /// Number of worker threads executing actions, transfers, and publish
    /// drains. Defaults to 3; must be at least 1.
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Validates the configuration and builds the client. The connection is
    /// not opened yet; call [`DeviceClient::connect`] for that.
    pub fn build(self) -> Result<DeviceClient> {
        if self.app_key.is_empty() || self.cloud_token.is_empty() {
            bail!("Missing key or cloud token from configuration");
        }
        if self.thread_count == 0 {
            bail!("At least one worker thread is required");
        }
        if self.loop_time.is_zero() {
            bail!("The loop time must be non-zero");
        }

        let config = ClientConfig {
            app_key: self.app_key,
            cloud_token: self.cloud_token,
            cloud_host: self.cloud_host,
            cloud_port: self.cloud_port,
            ca_bundle_file: self.ca_bundle_file,
            runtime_dir: self.runtime_dir,
            log_file: self.log_file,
            loop_time: self.loop_time,
            message_timeout: self.message_timeout,
            thread_count: self.thread_count,
        };

        logging::init(config.log_file.as_deref())?;

        log::debug!("Config: key {:?}", config.app_key);
        log::debug!("Config: host {}:{}", config.cloud_host, config.cloud_port);
        log::debug!("Config: runtime dir {}", config.runtime_dir.display());
        log::debug!(
            "Config: loop time {:?}, message timeout {:?}, {} workers",
            config.loop_time,
            config.message_timeout,
            config.thread_count
        );

        let connection = ConnectionHandler::new(config)?;
        Ok(DeviceClient::from_connection(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_rejects_missing_credentials() {
        assert!(DeviceClientBuilder::new("", "token", "host", 1883)
            .build()
            .is_err());
        assert!(DeviceClientBuilder::new("key", "", "host", 1883)
            .build()
            .is_err());
    }

    #[test]
    fn build_rejects_empty_worker_pool() {
        let builder =
            DeviceClientBuilder::new("key", "token", "host", 1883).with_thread_count(0);
        assert!(builder.build().is_err());
    }

    #[test]
    fn build_accepts_a_minimal_configuration() {
        let client = DeviceClientBuilder::new("key", "token", "host", 1883)
            .with_loop_time(Duration::from_secs(1))
            .build()
            .unwrap();
        assert!(!client.is_connected());
    }
}
