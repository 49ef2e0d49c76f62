use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::publication::Publication;

use super::worker::Work;

/// FIFO of pending outbound data points. Unbounded; enqueue never blocks.
pub(crate) struct PublishQueue {
    tx: Sender<Publication>,
    rx: Receiver<Publication>,
}

impl PublishQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        PublishQueue { tx, rx }
    }

    pub(crate) fn enqueue(&self, publication: Publication) {
        // Both channel ends live as long as the queue, so a send cannot fail.
        let _ = self.tx.send(publication);
    }

    /// Takes everything queued at the time of the call, in enqueue order.
    pub(crate) fn drain(&self) -> Vec<Publication> {
        self.rx.try_iter().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Typed work items consumed by the worker pool.
pub(crate) struct WorkQueue {
    tx: Sender<Work>,
    rx: Receiver<Work>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        WorkQueue { tx, rx }
    }

    pub(crate) fn push(&self, work: Work) {
        let _ = self.tx.send(work);
    }

    /// Blocks one worker for up to `timeout` waiting for an item.
    pub(crate) fn pop(&self, timeout: Duration) -> Option<Work> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
