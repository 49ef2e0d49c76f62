use std::sync::Arc;

use rumqttc::{ConnectReturnCode, ConnectionError, Event, Outgoing, Packet};
use tokio::{select, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{worker::InboundMessage, worker::Work, ConnectionHandler, SessionState};

/// Drives the MQTT connection: pumps the rumqttc event loop, sweeps reply
/// timeouts once per `loop_time`, and turns inbound frames into work items.
///
/// Runs on the dedicated MQTT thread while the session is connecting or
/// connected.
pub(crate) struct TransportLoop {
    handler: Arc<ConnectionHandler>,
    connection: rumqttc::EventLoop,
    cancellation: CancellationToken,
}

impl TransportLoop {
    pub(crate) fn new(
        handler: Arc<ConnectionHandler>,
        connection: rumqttc::EventLoop,
        cancellation: CancellationToken,
    ) -> Self {
        TransportLoop {
            handler,
            connection,
            cancellation,
        }
    }

    pub(crate) async fn run(mut self) {
        log::debug!("Transport loop is starting");

        let mut tick = tokio::time::interval(self.handler.config().loop_time);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = self.cancellation.cancelled() => {
                    log::debug!("Stopping MQTT because of cancellation");
                    self.handler.set_state(SessionState::Disconnected);
                    break;
                }
                _ = tick.tick() => self.on_tick(),
                notification = self.connection.poll() => {
                    if !self.process_notification(notification) {
                        break;
                    }
                }
            }

            if !self.handler.session_active() {
                break;
            }
        }

        // Workers exit on their next state check; reclaim them before
        // reporting what never got answered.
        self.handler.join_workers();
        self.handler.flush_no_reply();
        log::debug!("Transport loop has finished");
    }

    fn on_tick(&self) {
        self.handler.sweep_timeouts();
        if !self.handler.publish_queue_is_empty() {
            self.handler.queue_work(Work::Publish);
        }
    }

    fn process_notification(&self, notification: Result<Event, ConnectionError>) -> bool {
        match notification {
            Ok(Event::Incoming(packet)) => self.process_incoming(packet),
            Ok(Event::Outgoing(packet)) => self.process_outgoing(packet),
            Err(error) => {
                log::error!("MQTT connection error: {error}");
                self.handler.set_state(SessionState::Disconnected);
                false
            }
        }
    }

    fn process_incoming(&self, packet: Packet) -> bool {
        log::trace!("Received = {packet:?}");
        match packet {
            Packet::ConnAck(ack) => {
                if ack.code == ConnectReturnCode::Success {
                    log::info!("MQTT connected");
                    self.handler.set_state(SessionState::Connected);
                    self.handler.spawn_workers();
                    true
                } else {
                    log::error!("MQTT connection refused: {:?}", ack.code);
                    self.handler.set_state(SessionState::Disconnected);
                    false
                }
            }
            Packet::Publish(publish) => {
                log::debug!("Received message on topic {:?}", publish.topic);
                match serde_json::from_slice(&publish.payload) {
                    Ok(payload) => self.handler.queue_work(Work::Message(InboundMessage {
                        topic: publish.topic,
                        payload,
                    })),
                    Err(error) => {
                        log::error!("Unable to parse message on {:?}: {error}", publish.topic)
                    }
                }
                true
            }
            Packet::SubAck(ack) => {
                log::debug!("Subscribed to {} topics", ack.return_codes.len());
                true
            }
            _ => true,
        }
    }

    fn process_outgoing(&self, packet: Outgoing) -> bool {
        log::trace!("Sending = {packet:?}");
        if matches!(packet, Outgoing::Disconnect) {
            log::info!("MQTT disconnected");
            self.handler.set_state(SessionState::Disconnected);
            return false;
        }
        true
    }
}
