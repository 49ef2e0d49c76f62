//! The engine behind [`DeviceClient`]: owns the MQTT session, the reply
//! tracker, the worker pool, and the queues connecting them.
//!
//! [`DeviceClient`]: crate::DeviceClient

use std::{
    any::Any,
    fs,
    sync::{Arc, Mutex, RwLock},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Utc;
use rumqttc::{AsyncClient, MqttOptions, QoS, SubscribeFilter, TlsConfiguration, Transport};
use tokio::{runtime::Runtime, sync::watch};
use tokio_util::sync::CancellationToken;

use crate::{
    client::builder::ClientConfig,
    protocol,
    publication::Publication,
    status::Status,
    transfer::{self, http, FileExchange, FileTransfer},
    utils,
};

pub(crate) mod eventloop;
pub(crate) mod queue;
pub(crate) mod registry;
pub(crate) mod topics;
pub(crate) mod tracker;
pub(crate) mod worker;

use eventloop::TransportLoop;
use queue::{PublishQueue, WorkQueue};
use registry::{ActionKind, ActionRegistry};
use tracker::{OutMessage, ReplyTracker};

/// Connection lifecycle. Only the transport loop and connect/disconnect
/// mutate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

struct MqttSession {
    client: AsyncClient,
    cancellation: CancellationToken,
}

pub(crate) struct ConnectionHandler {
    config: ClientConfig,
    runtime: Runtime,
    state: watch::Sender<SessionState>,
    tracker: Mutex<ReplyTracker>,
    pending_len: watch::Receiver<usize>,
    registry: RwLock<ActionRegistry>,
    publish_queue: PublishQueue,
    work_queue: WorkQueue,
    exchange: FileExchange,
    session: Mutex<Option<MqttSession>>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionHandler {
    pub(crate) fn new(config: ClientConfig) -> Result<Arc<Self>> {
        // One worker thread is enough: the MQTT loop runs on its own OS
        // thread via `block_on`, the runtime only has to drive timers and
        // wake-ups for blocking waiters.
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .context("Unable to build tokio runtime")?;

        let exchange = FileExchange::new(
            &config.cloud_host,
            config.ca_bundle_file.as_deref(),
            &config.runtime_dir,
        )?;

        let tracker = ReplyTracker::new();
        let pending_len = tracker.subscribe_len();
        let (state, _) = watch::channel(SessionState::Disconnected);

        Ok(Arc::new(ConnectionHandler {
            config,
            runtime,
            state,
            tracker: Mutex::new(tracker),
            pending_len,
            registry: RwLock::new(ActionRegistry::default()),
            publish_queue: PublishQueue::new(),
            work_queue: WorkQueue::new(),
            exchange,
            session: Mutex::new(None),
            loop_thread: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn queue_work(&self, work: worker::Work) {
        self.work_queue.push(work);
    }

    pub(crate) fn publish_queue_is_empty(&self) -> bool {
        self.publish_queue.is_empty()
    }

    // Lifecycle
    // ================================================================================

    pub(crate) fn is_connected(&self) -> bool {
        *self.state.borrow() == SessionState::Connected
    }

    fn session_active(&self) -> bool {
        *self.state.borrow() != SessionState::Disconnected
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// Starts the MQTT session and waits up to `timeout` (zero means forever)
    /// for the broker to accept the connection.
    pub(crate) fn connect(self: &Arc<Self>, timeout: Duration) -> Status {
        if self.config.cloud_host.is_empty() || self.config.cloud_port == 0 {
            log::error!("Missing host or port from configuration");
            return Status::BadParameter;
        }
        if *self.state.borrow() != SessionState::Disconnected {
            log::error!("Connect attempted while a session is already active");
            return Status::Failure;
        }
        self.set_state(SessionState::Connecting);

        let mut options = MqttOptions::new(
            &self.config.app_key,
            &self.config.cloud_host,
            self.config.cloud_port,
        );
        options.set_credentials(&self.config.app_key, &self.config.cloud_token);
        options.set_keep_alive(Duration::from_secs(60));

        if let Some(bundle) = &self.config.ca_bundle_file {
            let connector = match http::tls_connector(bundle) {
                Ok(connector) => connector,
                Err(error) => {
                    log::error!("Unable to configure TLS: {error:#}");
                    self.set_state(SessionState::Disconnected);
                    return Status::Failure;
                }
            };
            options.set_transport(Transport::Tls(TlsConfiguration::NativeConnector(connector)));
        }

        let (client, connection) = AsyncClient::new(options, 10);

        let filters = topics::SUBSCRIPTIONS
            .iter()
            .map(|path| SubscribeFilter::new((*path).to_owned(), QoS::AtLeastOnce))
            .collect::<Vec<_>>();
        if let Err(error) = client.try_subscribe_many(filters) {
            log::warn!("Unable to queue subscriptions: {error}");
        }

        let cancellation = CancellationToken::new();
        *self.session.lock().expect("session lock poisoned") = Some(MqttSession {
            client,
            cancellation: cancellation.clone(),
        });

        log::info!("Connecting...");
        let transport = TransportLoop::new(self.clone(), connection, cancellation);
        let handle = self.runtime.handle().clone();
        let loop_thread = thread::Builder::new()
            .name("stratus-mqtt".into())
            .spawn(move || handle.block_on(transport.run()))
            .expect("Unable to spawn MQTT thread");
        *self.loop_thread.lock().expect("loop thread lock poisoned") = Some(loop_thread);

        match self.wait_state(timeout, |state| *state != SessionState::Connecting) {
            Some(SessionState::Connected) => Status::Success,
            Some(_) => {
                log::error!("Failed to connect");
                self.abort_session();
                Status::Failure
            }
            None => {
                log::error!("Connection timed out");
                self.abort_session();
                Status::TimedOut
            }
        }
    }

    /// Shuts the session down. Optionally waits for outstanding replies
    /// first, then closes MQTT, drains leftover work, and joins the loop
    /// thread. Always reports success.
    pub(crate) fn disconnect(&self, wait_for_replies: bool, timeout: Duration) -> Status {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        if wait_for_replies {
            log::info!("Waiting for replies...");
            let mut pending = self.pending_len.clone();
            self.block_on_deadline(deadline, async move {
                let _ = pending.wait_for(|len| *len == 0).await;
            });
        }

        log::info!("Disconnecting...");
        let session = self.session.lock().expect("session lock poisoned").take();
        if let Some(session) = session {
            if session.client.try_disconnect().is_err() {
                // The request queue is gone, the loop is already dead or dying.
                session.cancellation.cancel();
            }

            let mut state = self.state.subscribe();
            let reached = self.block_on_deadline(deadline, async move {
                state
                    .wait_for(|state| *state == SessionState::Disconnected)
                    .await
                    .is_ok()
            });
            if reached != Some(true) {
                session.cancellation.cancel();
            }
        }

        // Give workers a chance to finish what was queued before shutdown.
        self.block_on_deadline(deadline, async {
            while !self.work_queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        self.set_state(SessionState::Disconnected);
        self.join_loop_thread();
        Status::Success
    }

    fn abort_session(&self) {
        if let Some(session) = self.session.lock().expect("session lock poisoned").take() {
            session.cancellation.cancel();
        }
        self.join_loop_thread();
        self.set_state(SessionState::Disconnected);
    }

    fn join_loop_thread(&self) {
        let thread = self
            .loop_thread
            .lock()
            .expect("loop thread lock poisoned")
            .take();
        if let Some(thread) = thread {
            utils::thread::join(thread);
        }
    }

    pub(crate) fn spawn_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock().expect("worker lock poisoned");
        for index in 0..self.config.thread_count {
            let handler = self.clone();
            let worker = thread::Builder::new()
                .name(format!("stratus-worker-{index}"))
                .spawn(move || worker::work_loop(&handler))
                .expect("Unable to spawn worker thread");
            workers.push(worker);
        }
        log::debug!("Started {} worker threads", workers.len());
    }

    pub(crate) fn join_workers(&self) {
        let mut workers = self.workers.lock().expect("worker lock poisoned");
        utils::thread::join_all(&mut workers);
    }

    // Outbound traffic
    // ================================================================================

    /// Publishes one envelope carrying all `messages` and registers every
    /// command in the reply tracker.
    ///
    /// The tracker lock is held across topic allocation, publish, and
    /// registration: a reply can never arrive for an envelope that is not
    /// fully tracked yet.
    pub(crate) fn send(&self, messages: Vec<OutMessage>) -> Status {
        if messages.is_empty() {
            return Status::Success;
        }

        let commands: Vec<protocol::Request> =
            messages.iter().map(|message| message.command.clone()).collect();
        let payload = match protocol::encode_envelope(&commands) {
            Ok(payload) => payload,
            Err(error) => {
                log::error!("Unable to serialize request envelope: {error:#}");
                return Status::ParseError;
            }
        };

        let client = match &*self.session.lock().expect("session lock poisoned") {
            Some(session) => session.client.clone(),
            None => {
                log::error!("Cannot send, no MQTT session");
                return Status::NotInitialized;
            }
        };

        let mut tracker = self.tracker.lock().expect("reply tracker lock poisoned");
        let topic_num = tracker.next_topic();

        if let Err(error) =
            client.try_publish(topics::api_topic(&topic_num), QoS::AtLeastOnce, false, payload)
        {
            log::error!("Failed to publish on api/{topic_num}: {error}");
            return Status::Failure;
        }

        let now = Utc::now();
        for (index, mut message) in messages.into_iter().enumerate() {
            message.sent_at = now;
            message.out_id = format!("{topic_num}-{}", index + 1);
            log::info!("Sending {} - {}", message.out_id, message.description);
            log::debug!(".... {:?}", message.command);
            tracker.add(message);
        }
        Status::Success
    }

    /// Queues a data point for the next publish drain. Works while
    /// disconnected; the queue is drained once a session is up.
    pub(crate) fn queue_publish(&self, mut publication: Publication) -> Status {
        publication.stamp(Utc::now());
        self.publish_queue.enqueue(publication);
        Status::Success
    }

    // Actions
    // ================================================================================

    pub(crate) fn action_register_callback(
        &self,
        name: &str,
        callback: registry::ActionCallback,
        user_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Status {
        self.register(name, ActionKind::Callback(callback), user_data)
    }

    pub(crate) fn action_register_command(&self, name: &str, argv: Vec<String>) -> Status {
        self.register(name, ActionKind::Command(argv), None)
    }

    fn register(
        &self,
        name: &str,
        kind: ActionKind,
        user_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Status {
        let mut registry = self.registry.write().expect("action registry lock poisoned");
        match registry.add(name, kind, user_data) {
            Ok(()) => {
                log::info!("Registered action {name:?}");
                Status::Success
            }
            Err(error) => {
                log::error!("Failed to register action. {error}");
                Status::Exists
            }
        }
    }

    pub(crate) fn action_deregister(&self, name: &str) -> Status {
        let mut registry = self.registry.write().expect("action registry lock poisoned");
        match registry.remove(name) {
            Ok(()) => Status::Success,
            Err(error) => {
                log::error!("{error}");
                Status::NotFound
            }
        }
    }

    // File transfers
    // ================================================================================

    /// Negotiates a cloud-to-device transfer. With `blocking`, waits until
    /// the transfer reaches a terminal status or `timeout` expires.
    pub(crate) fn request_download(
        self: &Arc<Self>,
        file_name: &str,
        blocking: bool,
        timeout: Duration,
    ) -> Status {
        log::info!("Request download of {file_name}");
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        let transfer = Arc::new(FileTransfer::new(file_name));
        let message = OutMessage::with_transfer(
            protocol::file_get(&self.config.app_key, file_name),
            format!("Download {file_name}"),
            transfer.clone(),
        );

        let status = self.send(vec![message]);
        if status != Status::Success || !blocking {
            return status;
        }

        let mut result = transfer.subscribe();
        let outcome = self.block_on_deadline(deadline, async move {
            result.wait_for(|status| status.is_some()).await.ok().and_then(|s| *s)
        });
        outcome.flatten().unwrap_or(Status::TimedOut)
    }

    /// Negotiates device-to-cloud transfers for every file in `upload/`
    /// matching `pattern`. A file with CRC32 zero fails the whole batch and
    /// stops further requests.
    pub(crate) fn request_upload(
        self: &Arc<Self>,
        pattern: &str,
        blocking: bool,
        timeout: Duration,
    ) -> Status {
        log::info!("Request upload of {pattern}");
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        let upload_dir = self.config.runtime_dir.join(transfer::UPLOAD_DIR);
        if !upload_dir.is_dir() {
            log::error!(
                "Cannot find upload directory {:?}. Upload cancelled.",
                upload_dir
            );
            return Status::NotFound;
        }

        let matcher = match glob::Pattern::new(pattern) {
            Ok(matcher) => matcher,
            Err(error) => {
                log::error!("Invalid upload filter {pattern:?}: {error}");
                return Status::BadParameter;
            }
        };

        let entries = match fs::read_dir(&upload_dir) {
            Ok(entries) => entries,
            Err(error) => {
                log::error!("Unable to list {:?}: {error}", upload_dir);
                return Status::IoError;
            }
        };

        let mut status = Status::Success;
        let mut transfers = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !matcher.matches(name) {
                continue;
            }

            let checksum = match transfer::file_crc32(&path) {
                Ok(checksum) => checksum,
                Err(error) => {
                    log::error!(
                        "Upload request failed. Failed to retrieve checksum for {name:?}: {error}"
                    );
                    status = Status::FileOpenFailed;
                    break;
                }
            };
            if checksum == 0 {
                log::error!("Upload request failed. Failed to retrieve checksum for {name:?}.");
                status = Status::Failure;
                break;
            }

            let transfer = Arc::new(FileTransfer::new(name));
            let message = OutMessage::with_transfer(
                protocol::file_put(&self.config.app_key, name),
                format!("Upload {name}"),
                transfer.clone(),
            );
            status = self.send(vec![message]);
            transfers.push(transfer);
        }

        if !blocking || status != Status::Success || transfers.is_empty() {
            return status;
        }

        // All transfers share the one deadline; losing the connection ends
        // the wait early.
        for transfer in transfers {
            let mut result = transfer.subscribe();
            let mut state = self.state.subscribe();
            let completed = self.block_on_deadline(deadline, async move {
                tokio::select! {
                    outcome = result.wait_for(|status| status.is_some()) => outcome.is_ok(),
                    _ = state.wait_for(|state| *state != SessionState::Connected) => false,
                }
            });
            if completed != Some(true) {
                return Status::TimedOut;
            }
        }
        Status::Success
    }

    // Timeouts and shutdown bookkeeping
    // ================================================================================

    /// One sweep of the reply tracker; called from the transport loop tick.
    pub(crate) fn sweep_timeouts(&self) {
        let expired = {
            let mut tracker = self.tracker.lock().expect("reply tracker lock poisoned");
            tracker.sweep(Utc::now(), self.config.message_timeout)
        };
        if expired.is_empty() {
            return;
        }
        log::error!("Message(s) timed out:");
        for (_, description) in &expired {
            log::error!(".... {description}");
        }
    }

    /// Logs every message that never received a reply. Called when the
    /// transport loop exits.
    pub(crate) fn flush_no_reply(&self) {
        let no_reply = {
            let mut tracker = self.tracker.lock().expect("reply tracker lock poisoned");
            tracker.drain_no_reply()
        };
        if no_reply.is_empty() {
            return;
        }
        log::error!("These messages never received a reply:");
        for (out_id, description) in &no_reply {
            log::error!(".... {out_id} - {description}");
        }
    }

    // Blocking waits
    // ================================================================================

    /// Runs a future to completion, bounded by an optional deadline. `None`
    /// means the deadline passed before the future finished.
    fn block_on_deadline<F: std::future::Future>(
        &self,
        deadline: Option<Instant>,
        future: F,
    ) -> Option<F::Output> {
        match deadline {
            None => Some(self.runtime.block_on(future)),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return None;
                }
                self.runtime
                    .block_on(async { tokio::time::timeout(remaining, future).await.ok() })
            }
        }
    }

    fn wait_state(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&SessionState) -> bool + Send,
    ) -> Option<SessionState> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut state = self.state.subscribe();
        self.block_on_deadline(deadline, async move {
            state.wait_for(predicate).await.ok().map(|state| *state)
        })
        .flatten()
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        log::debug!("Connection handler is being dropped");

        // The MQTT and worker threads run on this handler's runtime. Fields
        // drop in declaration order, so the threads must be stopped and
        // joined here, before the runtime goes away under them.
        self.abort_session();
        self.join_workers();

        log::debug!("Connection handler is dropped");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use super::*;

    /// Handler with an installed MQTT session that is never polled; rumqttc
    /// buffers published requests, so handler-level flows run without a
    /// broker. The returned event loop must stay alive for the session's
    /// request channel to accept messages.
    pub(crate) fn connected_handler(
        runtime_dir: &Path,
    ) -> (Arc<ConnectionHandler>, rumqttc::EventLoop) {
        connected_handler_with_host(runtime_dir, "localhost")
    }

    /// Same as [`connected_handler`], with the file endpoint host under test
    /// control.
    pub(crate) fn connected_handler_with_host(
        runtime_dir: &Path,
        cloud_host: &str,
    ) -> (Arc<ConnectionHandler>, rumqttc::EventLoop) {
        let config = ClientConfig {
            app_key: "thing".into(),
            cloud_token: "secret".into(),
            cloud_host: cloud_host.into(),
            cloud_port: 1883,
            ca_bundle_file: None,
            runtime_dir: runtime_dir.to_owned(),
            log_file: None,
            loop_time: Duration::from_millis(100),
            message_timeout: Duration::from_secs(2),
            thread_count: 1,
        };
        let handler = ConnectionHandler::new(config).unwrap();

        let options = MqttOptions::new("thing", "localhost", 1883);
        let (client, connection) = AsyncClient::new(options, 32);
        *handler.session.lock().unwrap() = Some(MqttSession {
            client,
            cancellation: CancellationToken::new(),
        });
        handler.set_state(SessionState::Connected);
        (handler, connection)
    }

    /// Pops the tracked message registered under `out_id`.
    pub(crate) fn tracked(handler: &ConnectionHandler, topic_num: &str, command_num: &str) -> Option<OutMessage> {
        handler.tracker.lock().unwrap().pop(topic_num, command_num)
    }
}
