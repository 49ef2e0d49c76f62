//! The worker pool and the handlers it drives.
//!
//! Workers are plain OS threads so that action callbacks and file transfers
//! may block freely. A handler failure is logged and the worker moves on; a
//! worker only exits when the connection is gone.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;

use crate::{
    client::DeviceClient,
    protocol::{self, ops},
    publication::Publication,
    status::Status,
    transfer::FileTransfer,
};

use super::{
    registry::{ActionContext, ActionRequest},
    topics,
    tracker::OutMessage,
    ConnectionHandler,
};

/// A unit of work queued for the pool.
pub(crate) enum Work {
    /// Decode and dispatch an inbound frame.
    Message(InboundMessage),
    /// Drain the publish queue into one envelope.
    Publish,
    /// Execute a mailbox action and acknowledge it.
    Action(ActionRequest),
    /// Run an accepted cloud-to-device transfer.
    Download(Arc<FileTransfer>),
    /// Run an accepted device-to-cloud transfer.
    Upload(Arc<FileTransfer>),
}

#[derive(Debug)]
pub(crate) struct InboundMessage {
    pub(crate) topic: String,
    pub(crate) payload: Value,
}

pub(crate) fn work_loop(handler: &Arc<ConnectionHandler>) {
    while handler.is_connected() {
        let Some(work) = handler.work_queue.pop(handler.config().loop_time) else {
            continue;
        };
        match catch_unwind(AssertUnwindSafe(|| handler.handle_work(work))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => log::error!("Work item failed: {error:#}"),
            Err(_) => log::error!("Work handler panicked"),
        }
    }
    log::debug!("Worker is stopping");
}

impl ConnectionHandler {
    fn handle_work(self: &Arc<Self>, work: Work) -> Result<()> {
        match work {
            Work::Message(message) => self.handle_message(message),
            Work::Publish => self.handle_publish(),
            Work::Action(request) => self.handle_action(request),
            Work::Download(transfer) => {
                let status = self.exchange.download(&transfer);
                transfer.set_status(status);
                Ok(())
            }
            Work::Upload(transfer) => {
                let status = self.exchange.upload(&transfer);
                transfer.set_status(status);
                Ok(())
            }
        }
    }

    pub(crate) fn handle_message(self: &Arc<Self>, message: InboundMessage) -> Result<()> {
        if let Some(name) = message.topic.strip_prefix(topics::NOTIFY_PREFIX) {
            if name == topics::MAILBOX_ACTIVITY {
                log::info!("Received notification of mailbox activity");
                let check = OutMessage::new(protocol::mailbox_check(), "Mailbox Check");
                self.send(vec![check]);
            } else {
                log::warn!("Ignoring unknown notification {name:?}");
            }
            Ok(())
        } else if let Some(topic_num) = message.topic.strip_prefix(topics::REPLY_PREFIX) {
            self.handle_replies(topic_num, &message.payload)
        } else {
            log::warn!("Ignoring message on unexpected topic {:?}", message.topic);
            Ok(())
        }
    }

    fn handle_replies(self: &Arc<Self>, topic_num: &str, payload: &Value) -> Result<()> {
        let replies = protocol::decode_reply_envelope(payload)
            .with_context(|| format!("bad reply envelope on reply/{topic_num}"))?;

        for (command_num, reply) in replies {
            let sent = {
                let mut tracker = self.tracker.lock().expect("reply tracker lock poisoned");
                tracker.pop(topic_num, &command_num)
            };
            let Some(sent) = sent else {
                log::error!("Received reply for unknown message {topic_num}-{command_num}");
                continue;
            };

            if reply.success {
                log::info!(
                    "Received success for {topic_num}-{command_num} - {}",
                    sent.description
                );
            } else {
                log::error!(
                    "Received failure for {topic_num}-{command_num} - {}",
                    sent.description
                );
                log::error!(".... {:?}", reply.error_messages);
            }

            match sent.command.command {
                ops::FILE_GET => self.on_file_get_reply(sent, reply),
                ops::FILE_PUT => self.on_file_put_reply(sent, reply),
                ops::MAILBOX_CHECK => self.on_mailbox_reply(reply),
                _ => {}
            }
        }
        Ok(())
    }

    fn on_file_get_reply(&self, sent: OutMessage, reply: protocol::Reply) {
        let Some(transfer) = sent.transfer else {
            return;
        };
        if !reply.success {
            transfer.set_status(Status::Failure);
            return;
        }
        match serde_json::from_value::<protocol::FileGetReply>(reply.params) {
            Ok(accepted) => {
                transfer.set_remote(accepted.file_id, Some(accepted.crc32));
                self.work_queue.push(Work::Download(transfer));
            }
            Err(error) => {
                log::error!("Malformed file.get reply: {error}");
                transfer.set_status(Status::ParseError);
            }
        }
    }

    fn on_file_put_reply(&self, sent: OutMessage, reply: protocol::Reply) {
        let Some(transfer) = sent.transfer else {
            return;
        };
        if !reply.success {
            transfer.set_status(Status::Failure);
            return;
        }
        match serde_json::from_value::<protocol::FilePutReply>(reply.params) {
            Ok(accepted) => {
                transfer.set_remote(accepted.file_id, None);
                self.work_queue.push(Work::Upload(transfer));
            }
            Err(error) => {
                log::error!("Malformed file.put reply: {error}");
                transfer.set_status(Status::ParseError);
            }
        }
    }

    fn on_mailbox_reply(&self, reply: protocol::Reply) {
        if !reply.success {
            return;
        }
        let mailbox: protocol::MailboxReply = match serde_json::from_value(reply.params) {
            Ok(mailbox) => mailbox,
            Err(error) => {
                log::error!("Malformed mailbox.check reply: {error}");
                return;
            }
        };

        for mail in mailbox.messages {
            if mail.command != ops::METHOD_EXEC {
                continue;
            }
            match serde_json::from_value::<protocol::MethodExec>(mail.params) {
                Ok(exec) => self.work_queue.push(Work::Action(ActionRequest {
                    request_id: mail.id,
                    name: exec.method,
                    params: exec.params,
                })),
                Err(error) => log::error!("Malformed method.exec mail {:?}: {error}", mail.id),
            }
        }
    }

    /// Drains whatever is queued right now into a single envelope, preserving
    /// enqueue order.
    pub(crate) fn handle_publish(self: &Arc<Self>) -> Result<()> {
        let pending = self.publish_queue.drain();
        if pending.is_empty() {
            return Ok(());
        }

        let thing_key = &self.config().app_key;
        let mut messages = Vec::with_capacity(pending.len());
        for publication in pending {
            let description = publication.describe();
            let command = match publication {
                Publication::Telemetry {
                    name,
                    value,
                    timestamp,
                } => protocol::property_publish(
                    thing_key,
                    &name,
                    value,
                    timestamp.unwrap_or_else(Utc::now),
                ),
                Publication::Attribute {
                    name,
                    value,
                    timestamp,
                } => protocol::attribute_publish(
                    thing_key,
                    &name,
                    &value,
                    timestamp.unwrap_or_else(Utc::now),
                ),
                Publication::Alarm {
                    name,
                    state,
                    message,
                    timestamp,
                } => protocol::alarm_publish(
                    thing_key,
                    &name,
                    state,
                    message.as_deref(),
                    timestamp.unwrap_or_else(Utc::now),
                ),
                Publication::Location {
                    latitude,
                    longitude,
                    heading,
                    altitude,
                    speed,
                    accuracy,
                    fix_type,
                    timestamp,
                } => protocol::location_publish(
                    thing_key,
                    latitude,
                    longitude,
                    heading,
                    altitude,
                    speed,
                    accuracy,
                    fix_type.as_deref(),
                    timestamp.unwrap_or_else(Utc::now),
                ),
                Publication::Log { message, timestamp } => {
                    protocol::log_publish(thing_key, &message, timestamp.unwrap_or_else(Utc::now))
                }
            };
            messages.push(OutMessage::new(command, description));
        }

        self.send(messages);
        Ok(())
    }

    /// Executes an action request and acknowledges the outcome to the cloud.
    pub(crate) fn handle_action(self: &Arc<Self>, request: ActionRequest) -> Result<()> {
        let prepared = {
            let registry = self.registry.read().expect("action registry lock poisoned");
            registry.prepare(&request.name)
        };

        let ctx = ActionContext {
            client: DeviceClient::from_connection(self.clone()),
            user_data: prepared.as_ref().and_then(|(_, data)| data.clone()),
            request,
        };

        let result = match prepared {
            Some((kind, _)) => kind.execute(&ctx),
            None => {
                log::error!("Action {:?} execution failed", ctx.request.name);
                (
                    Status::NotFound,
                    format!("action {:?} is not registered", ctx.request.name),
                )
                    .into()
            }
        };

        let mut description = format!(
            "Action Complete {:?} result : {}({})",
            ctx.request.name, result.status as u8, result.status
        );
        if let Some(message) = &result.message {
            description.push_str(&format!(" {message:?}"));
        }
        if let Some(params) = &result.params {
            description.push_str(&format!(" {params}"));
        }

        let ack = OutMessage::new(
            protocol::mailbox_ack(
                &ctx.request.request_id,
                protocol::wire_error_code(result.status),
                result.message.as_deref(),
                result.params,
            ),
            description,
        );

        let status = self.send(vec![ack]);
        if status != Status::Success {
            log::error!(
                "Failed to acknowledge action {:?} ({})",
                ctx.request.name,
                status
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::connection::registry::ActionResult;
    use crate::connection::testing::{connected_handler, tracked};

    use super::*;

    fn inbound(topic: &str, payload: Value) -> InboundMessage {
        let _ = env_logger::builder().is_test(true).try_init();
        InboundMessage {
            topic: topic.to_owned(),
            payload,
        }
    }

    #[test]
    fn mailbox_notification_triggers_one_check() {
        let dir = tempdir().unwrap();
        let (handler, _connection) = connected_handler(dir.path());

        handler
            .handle_message(inbound("notify/mailbox_activity", json!({})))
            .unwrap();

        let check = tracked(&handler, "0001", "1").unwrap();
        assert_eq!(check.command.command, ops::MAILBOX_CHECK);
        assert_eq!(check.command.params, json!({"autoComplete": false}));
        assert!(tracked(&handler, "0002", "1").is_none());
    }

    #[test]
    fn unknown_reply_is_dropped() {
        let dir = tempdir().unwrap();
        let (handler, _connection) = connected_handler(dir.path());

        handler
            .handle_message(inbound("reply/0042", json!({"1": {"success": true}})))
            .unwrap();
    }

    #[test]
    fn registered_action_is_executed_and_acknowledged() {
        let dir = tempdir().unwrap();
        let (handler, _connection) = connected_handler(dir.path());

        handler.action_register_callback(
            "echo",
            Arc::new(|_ctx: &ActionContext| {
                ActionResult::from((Status::Success, "ok", json!({"r": 1})))
            }),
            None,
        );

        // A mailbox.check is in flight on topic 0001.
        let check = OutMessage::new(protocol::mailbox_check(), "Mailbox Check");
        assert_eq!(handler.send(vec![check]), Status::Success);

        handler
            .handle_message(inbound(
                "reply/0001",
                json!({
                    "1": {
                        "success": true,
                        "params": {
                            "messages": [{
                                "id": "m1",
                                "command": "method.exec",
                                "params": {"method": "echo", "params": {}},
                            }],
                        },
                    },
                }),
            ))
            .unwrap();

        // The reply fans out into one action work item; run it.
        let Some(Work::Action(request)) = handler.work_queue.pop(Duration::from_millis(10)) else {
            panic!("expected an action work item");
        };
        assert_eq!(request.request_id, "m1");
        handler.handle_action(request).unwrap();

        let ack = tracked(&handler, "0002", "1").unwrap();
        assert_eq!(ack.command.command, ops::MAILBOX_ACK);
        assert_eq!(
            ack.command.params,
            json!({"id": "m1", "errorCode": 0, "errorMessage": "ok", "params": {"r": 1}})
        );
    }

    #[test]
    fn unregistered_action_is_acknowledged_as_not_found() {
        let dir = tempdir().unwrap();
        let (handler, _connection) = connected_handler(dir.path());

        handler
            .handle_action(ActionRequest {
                request_id: "m9".into(),
                name: "ghost".into(),
                params: json!({}),
            })
            .unwrap();

        let ack = tracked(&handler, "0001", "1").unwrap();
        assert_eq!(ack.command.command, ops::MAILBOX_ACK);
        assert_eq!(ack.command.params["id"], "m9");
        assert_eq!(
            ack.command.params["errorCode"],
            json!(protocol::wire_error_code(Status::NotFound))
        );
    }

    #[test]
    fn panicking_callback_is_acknowledged_as_failure() {
        let dir = tempdir().unwrap();
        let (handler, _connection) = connected_handler(dir.path());

        handler.action_register_callback(
            "explode",
            Arc::new(|_ctx: &ActionContext| panic!("boom")),
            None,
        );

        handler
            .handle_action(ActionRequest {
                request_id: "m2".into(),
                name: "explode".into(),
                params: json!({}),
            })
            .unwrap();

        let ack = tracked(&handler, "0001", "1").unwrap();
        assert_eq!(
            ack.command.params["errorCode"],
            json!(protocol::wire_error_code(Status::Failure))
        );
    }

    #[test]
    fn publish_drain_coalesces_into_one_envelope() {
        let dir = tempdir().unwrap();
        let (handler, _connection) = connected_handler(dir.path());
        let at = chrono::Utc.with_ymd_and_hms(2023, 4, 5, 6, 7, 8).unwrap();

        for (name, value) in [("t1", 1.5), ("t2", 2.5), ("t3", 3.5)] {
            handler.queue_publish(Publication::Telemetry {
                name: name.into(),
                value,
                timestamp: Some(at),
            });
        }
        handler.handle_publish().unwrap();

        for (command_num, name, value) in [("1", "t1", 1.5), ("2", "t2", 2.5), ("3", "t3", 3.5)] {
            let message = tracked(&handler, "0001", command_num).unwrap();
            assert_eq!(message.command.command, ops::PROPERTY_PUBLISH);
            assert_eq!(
                message.command.params,
                json!({
                    "thingKey": "thing",
                    "key": name,
                    "value": value,
                    "ts": "2023-04-05T06:07:08Z",
                })
            );
        }
        // All three went out on one topic; nothing else was allocated.
        assert!(tracked(&handler, "0002", "1").is_none());
    }

    #[test]
    fn file_get_reply_schedules_a_download() {
        let dir = tempdir().unwrap();
        let (handler, _connection) = connected_handler(dir.path());

        let transfer = Arc::new(FileTransfer::new("a.bin"));
        let message = OutMessage::with_transfer(
            protocol::file_get("thing", "a.bin"),
            "Download a.bin",
            transfer.clone(),
        );
        handler.send(vec![message]);

        handler
            .handle_message(inbound(
                "reply/0001",
                json!({"1": {"success": true, "params": {"fileId": "F1", "crc32": 3735928559u32}}}),
            ))
            .unwrap();

        assert_eq!(transfer.file_id().as_deref(), Some("F1"));
        assert_eq!(transfer.checksum(), Some(0xDEAD_BEEF));
        assert!(matches!(
            handler.work_queue.pop(Duration::from_millis(10)),
            Some(Work::Download(_))
        ));
    }

    #[test]
    fn failed_file_get_reply_fails_the_transfer() {
        let dir = tempdir().unwrap();
        let (handler, _connection) = connected_handler(dir.path());

        let transfer = Arc::new(FileTransfer::new("a.bin"));
        let message = OutMessage::with_transfer(
            protocol::file_get("thing", "a.bin"),
            "Download a.bin",
            transfer.clone(),
        );
        handler.send(vec![message]);

        handler
            .handle_message(inbound(
                "reply/0001",
                json!({"1": {"success": false, "errorMessages": ["no such file"]}}),
            ))
            .unwrap();

        assert_eq!(transfer.status(), Some(Status::Failure));
        assert!(handler.work_queue.is_empty());
    }

    #[test]
    fn accepted_download_flows_from_reply_to_disk() {
        let body: Vec<u8> = (0..128u8).collect();
        let checksum = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&body);
            hasher.finalize()
        };

        let mut server = mockito::Server::new();
        server
            .mock("GET", "/file/F1")
            .with_status(200)
            .with_body(body.clone())
            .create();

        let dir = tempdir().unwrap();
        let download_dir = dir.path().join(crate::transfer::DOWNLOAD_DIR);
        std::fs::create_dir(&download_dir).unwrap();

        let (handler, _connection) =
            crate::connection::testing::connected_handler_with_host(dir.path(), &server.host_with_port());

        // Non-blocking request puts the file.get on topic 0001.
        assert_eq!(
            handler.request_download("a.bin", false, Duration::ZERO),
            Status::Success
        );

        handler
            .handle_message(inbound(
                "reply/0001",
                json!({"1": {"success": true, "params": {"fileId": "F1", "crc32": checksum}}}),
            ))
            .unwrap();

        let Some(work @ Work::Download(_)) = handler.work_queue.pop(Duration::from_millis(10))
        else {
            panic!("expected a download work item");
        };
        handler.handle_work(work).unwrap();

        assert_eq!(std::fs::read(download_dir.join("a.bin")).unwrap(), body);
    }
}
