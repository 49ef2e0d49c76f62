use std::thread::{self, JoinHandle};

/// Joins a thread, logging instead of propagating a panic payload.
pub(crate) fn join(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("<unnamed>").to_owned();
    if handle.thread().id() == thread::current().id() {
        log::warn!("Thread `{name}` cannot join itself, detaching");
        return;
    }
    log::trace!("Joining thread `{name}`");
    if let Err(cause) = handle.join() {
        let message = cause
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_owned())
            .or_else(|| cause.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic payload is not a string".to_owned());
        log::error!("Thread `{name}` failed with panic: {message}");
    }
}

/// Drains and joins a set of worker handles.
pub(crate) fn join_all(handles: &mut Vec<JoinHandle<()>>) {
    for handle in handles.drain(..) {
        join(handle);
    }
}
