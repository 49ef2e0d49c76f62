//! Wire codec for the command/reply protocol.
//!
//! An outbound envelope is one MQTT payload carrying 1..N commands, keyed by
//! their one-based index as a string. Replies arrive on `reply/<topic#>` with
//! the same keying.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::Status;

/// Timestamp format accepted by the platform (UTC, second resolution).
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub(crate) fn cloud_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIME_FORMAT).to_string()
}

/// Command names understood by the platform.
pub(crate) mod ops {
    pub(crate) const PROPERTY_PUBLISH: &str = "property.publish";
    pub(crate) const ATTRIBUTE_PUBLISH: &str = "attribute.publish";
    pub(crate) const ALARM_PUBLISH: &str = "alarm.publish";
    pub(crate) const LOCATION_PUBLISH: &str = "location.publish";
    pub(crate) const LOG_PUBLISH: &str = "log.publish";
    pub(crate) const FILE_GET: &str = "file.get";
    pub(crate) const FILE_PUT: &str = "file.put";
    pub(crate) const MAILBOX_CHECK: &str = "mailbox.check";
    pub(crate) const MAILBOX_ACK: &str = "mailbox.ack";
    /// Mail command requesting a local action execution.
    pub(crate) const METHOD_EXEC: &str = "method.exec";
}

/// A single command inside an outbound envelope.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Request {
    pub(crate) command: &'static str,
    pub(crate) params: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PropertyParams<'a> {
    thing_key: &'a str,
    key: &'a str,
    value: f64,
    ts: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttributeParams<'a> {
    thing_key: &'a str,
    key: &'a str,
    value: &'a str,
    ts: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AlarmParams<'a> {
    thing_key: &'a str,
    key: &'a str,
    state: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg: Option<&'a str>,
    ts: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocationParams<'a> {
    thing_key: &'a str,
    lat: f64,
    lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fix_acc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fix_type: Option<&'a str>,
    ts: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogParams<'a> {
    thing_key: &'a str,
    msg: &'a str,
    ts: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileParams<'a> {
    thing_key: &'a str,
    file_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MailboxCheckParams {
    auto_complete: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MailboxAckParams<'a> {
    id: &'a str,
    error_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

fn request(command: &'static str, params: impl Serialize) -> Request {
    Request {
        command,
        // The param structs above serialize infallibly.
        params: serde_json::to_value(params).unwrap_or(Value::Null),
    }
}

pub(crate) fn property_publish(thing_key: &str, key: &str, value: f64, at: DateTime<Utc>) -> Request {
    request(
        ops::PROPERTY_PUBLISH,
        PropertyParams {
            thing_key,
            key,
            value,
            ts: cloud_timestamp(at),
        },
    )
}

pub(crate) fn attribute_publish(thing_key: &str, key: &str, value: &str, at: DateTime<Utc>) -> Request {
    request(
        ops::ATTRIBUTE_PUBLISH,
        AttributeParams {
            thing_key,
            key,
            value,
            ts: cloud_timestamp(at),
        },
    )
}

pub(crate) fn alarm_publish(
    thing_key: &str,
    key: &str,
    state: i32,
    msg: Option<&str>,
    at: DateTime<Utc>,
) -> Request {
    request(
        ops::ALARM_PUBLISH,
        AlarmParams {
            thing_key,
            key,
            state,
            msg,
            ts: cloud_timestamp(at),
        },
    )
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn location_publish(
    thing_key: &str,
    lat: f64,
    lng: f64,
    heading: Option<f64>,
    altitude: Option<f64>,
    speed: Option<f64>,
    fix_acc: Option<f64>,
    fix_type: Option<&str>,
    at: DateTime<Utc>,
) -> Request {
    request(
        ops::LOCATION_PUBLISH,
        LocationParams {
            thing_key,
            lat,
            lng,
            heading,
            altitude,
            speed,
            fix_acc,
            fix_type,
            ts: cloud_timestamp(at),
        },
    )
}

pub(crate) fn log_publish(thing_key: &str, msg: &str, at: DateTime<Utc>) -> Request {
    request(
        ops::LOG_PUBLISH,
        LogParams {
            thing_key,
            msg,
            ts: cloud_timestamp(at),
        },
    )
}

pub(crate) fn file_get(thing_key: &str, file_name: &str) -> Request {
    request(ops::FILE_GET, FileParams { thing_key, file_name })
}

pub(crate) fn file_put(thing_key: &str, file_name: &str) -> Request {
    request(ops::FILE_PUT, FileParams { thing_key, file_name })
}

pub(crate) fn mailbox_check() -> Request {
    request(
        ops::MAILBOX_CHECK,
        MailboxCheckParams {
            auto_complete: false,
        },
    )
}

pub(crate) fn mailbox_ack(
    mail_id: &str,
    error_code: i32,
    error_message: Option<&str>,
    params: Option<Value>,
) -> Request {
    request(
        ops::MAILBOX_ACK,
        MailboxAckParams {
            id: mail_id,
            error_code,
            error_message,
            params,
        },
    )
}

/// Serializes 1..N commands into one envelope payload, indexed "1".."N".
pub(crate) fn encode_envelope(commands: &[Request]) -> Result<String> {
    let mut envelope = serde_json::Map::with_capacity(commands.len());
    for (index, command) in commands.iter().enumerate() {
        envelope.insert(
            (index + 1).to_string(),
            serde_json::to_value(command).context("unable to serialize command")?,
        );
    }
    Ok(Value::Object(envelope).to_string())
}

/// One reply inside a `reply/<topic#>` envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Reply {
    pub(crate) success: bool,
    #[serde(default)]
    pub(crate) params: Value,
    #[serde(default)]
    pub(crate) error_messages: Vec<String>,
}

/// Splits a reply envelope into `(command#, reply)` pairs in command order.
pub(crate) fn decode_reply_envelope(payload: &Value) -> Result<Vec<(String, Reply)>> {
    let entries = payload
        .as_object()
        .context("reply envelope is not a JSON object")?;

    let mut replies = Vec::with_capacity(entries.len());
    for (command_num, value) in entries {
        let reply: Reply = serde_json::from_value(value.clone())
            .with_context(|| format!("malformed reply for command {command_num}"))?;
        replies.push((command_num.clone(), reply));
    }
    replies.sort_by_key(|(num, _)| num.parse::<u32>().unwrap_or(u32::MAX));
    Ok(replies)
}

/// Reply params of a successful `file.get`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileGetReply {
    pub(crate) file_id: String,
    pub(crate) crc32: u32,
}

/// Reply params of a successful `file.put`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FilePutReply {
    pub(crate) file_id: String,
}

/// Reply params of a successful `mailbox.check`.
#[derive(Debug, Deserialize)]
pub(crate) struct MailboxReply {
    #[serde(default)]
    pub(crate) messages: Vec<Mail>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Mail {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) command: String,
    #[serde(default)]
    pub(crate) params: Value,
}

/// Params of a `method.exec` mail.
#[derive(Debug, Deserialize)]
pub(crate) struct MethodExec {
    pub(crate) method: String,
    #[serde(default)]
    pub(crate) params: Value,
}

/// Maps a status to the wire-level error code carried in `mailbox.ack`.
///
/// Success is 0; every other status maps to a distinct negative code so the
/// mapping is bijective over the taxonomy.
pub(crate) fn wire_error_code(status: Status) -> i32 {
    match status {
        Status::Success => 0,
        other => -(other as i32),
    }
}

/// Inverse of [`wire_error_code`]. Returns `None` for unknown codes.
pub(crate) fn status_from_wire(code: i32) -> Option<Status> {
    Status::ALL
        .into_iter()
        .find(|status| wire_error_code(*status) == code)
}
