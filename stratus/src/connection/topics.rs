pub(crate) const REPLY_PREFIX: &str = "reply/";
pub(crate) const NOTIFY_PREFIX: &str = "notify/";
pub(crate) const MAILBOX_ACTIVITY: &str = "mailbox_activity";

/// Topic filters covering everything the platform addresses to the device.
pub(crate) const SUBSCRIPTIONS: [&str; 3] = ["reply/#", "notify/#", "replyz/#"];

/// Outbound request envelopes are published here, one topic per envelope.
pub(crate) fn api_topic(topic_num: &str) -> String {
    format!("api/{topic_num}")
}
