use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::{protocol, status::Status, transfer::FileTransfer};

/// An outbound command awaiting its reply.
#[derive(Debug, Clone)]
pub(crate) struct OutMessage {
    pub(crate) command: protocol::Request,
    pub(crate) description: String,
    pub(crate) transfer: Option<Arc<FileTransfer>>,
    pub(crate) sent_at: DateTime<Utc>,
    pub(crate) out_id: String,
}

impl OutMessage {
    pub(crate) fn new(command: protocol::Request, description: impl Into<String>) -> Self {
        OutMessage {
            command,
            description: description.into(),
            transfer: None,
            sent_at: Utc::now(),
            out_id: String::new(),
        }
    }

    pub(crate) fn with_transfer(
        command: protocol::Request,
        description: impl Into<String>,
        transfer: Arc<FileTransfer>,
    ) -> Self {
        OutMessage {
            transfer: Some(transfer),
            ..OutMessage::new(command, description)
        }
    }
}

/// Outstanding requests, keyed by `(topic#, command#)`.
///
/// The owning lock also covers the topic counter: a topic number is
/// allocated, published, and registered without releasing it, so a reply can
/// never observe a half-registered envelope.
pub(crate) struct ReplyTracker {
    pending: HashMap<String, HashMap<String, OutMessage>>,
    topic_counter: u32,
    no_reply: Vec<(String, String)>,
    pending_count: watch::Sender<usize>,
}

impl ReplyTracker {
    pub(crate) fn new() -> Self {
        let (pending_count, _) = watch::channel(0);
        ReplyTracker {
            pending: HashMap::new(),
            topic_counter: 1,
            no_reply: Vec::new(),
            pending_count,
        }
    }

    /// Next unused topic number as a zero-padded 4-digit string. Numbers are
    /// handed out monotonically, skipping any still awaiting replies.
    pub(crate) fn next_topic(&mut self) -> String {
        loop {
            let topic_num = format!("{:0>4}", self.topic_counter);
            self.topic_counter = self.topic_counter.wrapping_add(1);
            if !self.contains_topic(&topic_num) {
                return topic_num;
            }
        }
    }

    /// Registers a sent message under its `out_id` (`topic#-command#`).
    pub(crate) fn add(&mut self, message: OutMessage) {
        let Some((topic_num, command_num)) = message.out_id.split_once('-') else {
            log::error!("Dropping tracked message with malformed id {:?}", message.out_id);
            return;
        };
        self.pending
            .entry(topic_num.to_owned())
            .or_default()
            .insert(command_num.to_owned(), message);
        self.publish_len();
    }

    /// Removes and returns the message a reply corresponds to.
    pub(crate) fn pop(&mut self, topic_num: &str, command_num: &str) -> Option<OutMessage> {
        let commands = self.pending.get_mut(topic_num)?;
        let message = commands.remove(command_num);
        if commands.is_empty() {
            self.pending.remove(topic_num);
        }
        if message.is_some() {
            self.publish_len();
        }
        message
    }

    /// Drops every message older than `max_age`, marking attached transfers
    /// as timed out and remembering the loss for the end-of-session log.
    /// Returns `(out_id, description)` of each expired message.
    pub(crate) fn sweep(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<(String, String)> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut expired = Vec::new();

        self.pending.retain(|_, commands| {
            commands.retain(|_, message| {
                if now - message.sent_at <= max_age {
                    return true;
                }
                if let Some(transfer) = &message.transfer {
                    transfer.set_status(Status::TimedOut);
                }
                expired.push((message.out_id.clone(), message.description.clone()));
                false
            });
            !commands.is_empty()
        });

        if !expired.is_empty() {
            self.no_reply.extend(expired.iter().cloned());
            self.publish_len();
        }
        expired
    }

    pub(crate) fn contains_topic(&self, topic_num: &str) -> bool {
        self.pending.contains_key(topic_num)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.values().map(HashMap::len).sum()
    }

    /// Messages that never received a reply, flushed at disconnect.
    pub(crate) fn drain_no_reply(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.no_reply)
    }

    /// Watch mirror of [`ReplyTracker::len`] for disconnect waiters.
    pub(crate) fn subscribe_len(&self) -> watch::Receiver<usize> {
        self.pending_count.subscribe()
    }

    fn publish_len(&self) {
        self.pending_count.send_replace(self.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(out_id: &str) -> OutMessage {
        let mut message = OutMessage::new(protocol::mailbox_check(), format!("test {out_id}"));
        message.out_id = out_id.to_owned();
        message
    }

    #[test]
    fn topics_are_monotonic_and_skip_pending() {
        let mut tracker = ReplyTracker::new();
        assert_eq!(tracker.next_topic(), "0001");
        assert_eq!(tracker.next_topic(), "0002");

        tracker.add(message("0003-1"));
        assert_eq!(tracker.next_topic(), "0004");
    }

    #[test]
    fn pop_returns_each_message_exactly_once() {
        let mut tracker = ReplyTracker::new();
        tracker.add(message("0001-1"));
        tracker.add(message("0001-2"));
        assert_eq!(tracker.len(), 2);
        assert!(tracker.contains_topic("0001"));

        assert!(tracker.pop("0001", "1").is_some());
        assert!(tracker.pop("0001", "1").is_none());
        assert!(tracker.pop("0002", "1").is_none());

        assert!(tracker.pop("0001", "2").is_some());
        assert_eq!(tracker.len(), 0);
        assert!(!tracker.contains_topic("0001"));
    }

    #[test]
    fn sweep_expires_only_old_messages() {
        let mut tracker = ReplyTracker::new();
        let now = Utc::now();

        let mut old = message("0001-1");
        old.sent_at = now - chrono::Duration::seconds(30);
        tracker.add(old);

        let mut fresh = message("0002-1");
        fresh.sent_at = now - chrono::Duration::seconds(1);
        tracker.add(fresh);

        let expired = tracker.sweep(now, Duration::from_secs(15));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "0001-1");
        assert_eq!(tracker.len(), 1);

        let no_reply = tracker.drain_no_reply();
        assert_eq!(no_reply.len(), 1);
        assert_eq!(no_reply[0].0, "0001-1");
        assert!(tracker.drain_no_reply().is_empty());
    }

    #[test]
    fn sweep_times_out_attached_transfers() {
        let mut tracker = ReplyTracker::new();
        let transfer = Arc::new(FileTransfer::new("a.bin"));
        let mut msg = OutMessage::with_transfer(
            protocol::file_get("thing", "a.bin"),
            "Download a.bin",
            transfer.clone(),
        );
        msg.out_id = "0001-1".into();
        msg.sent_at = Utc::now() - chrono::Duration::seconds(60);
        tracker.add(msg);

        tracker.sweep(Utc::now(), Duration::from_secs(2));
        assert_eq!(transfer.status(), Some(Status::TimedOut));
    }

    #[test]
    fn len_watch_tracks_mutations() {
        let mut tracker = ReplyTracker::new();
        let watch = tracker.subscribe_len();

        tracker.add(message("0001-1"));
        assert_eq!(*watch.borrow(), 1);

        tracker.pop("0001", "1");
        assert_eq!(*watch.borrow(), 0);
    }
}
