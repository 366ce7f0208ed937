//! WebSocket transport for the remotedrop client.
//!
//! Maintains one duplex channel to the configured server, delivers inbound
//! frames in on-wire order, emits a periodic application-level `ping`, and
//! reconnects automatically (bounded attempts) after unsolicited
//! disconnects.

mod client;
mod pumps;
mod reconnection;
mod types;

pub use client::WsTransport;
pub use types::{
    ConnectionState, FrameSink, ReconnectPolicy, TransportError, TransportEvent,
};
