//! This crate contains the Device SDK for the Stratus IoT Platform.
//!
//! The SDK keeps a persistent MQTT session to the platform and layers a
//! command/reply protocol on top of it: telemetry, attributes, alarms,
//! locations, and logs go out in batched envelopes; the cloud invokes
//! registered actions through the device mailbox; file transfers are
//! negotiated over the command channel and executed over HTTP(S) with
//! checksum verification.
//!
//! Start with [`DeviceClientBuilder`].

mod client;
mod connection;
mod logging;
mod protocol;
mod publication;
mod status;
mod transfer;

pub(crate) mod utils;

pub use client::{DeviceClient, DeviceClientBuilder};
pub use connection::registry::{ActionContext, ActionRequest, ActionResult};
pub use publication::Publication;
pub use status::Status;
