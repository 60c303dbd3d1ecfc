//! Bridge between an inbound and an outbound broker connection
//!
//! - [`OutboundEventLoop`] owns the outbound connection, keeps its heartbeats
//!   serviced and accepts publish requests from any task or thread.
//! - [`InboundBridge`] consumes the inbound queue one item at a time and hands
//!   each item to the publisher before settling it.
//! - [`Relay`] wires both together from a [`Config`](heartbridge_core::config::Config)
//!   and runs the shutdown cascade.

pub mod consumer;
pub mod error;
pub mod publisher;
pub mod relay;

pub use consumer::{DeliveryOutcome, InboundBridge, RelayStats};
pub use error::{RelayError, Result};
pub use publisher::{current_loop, LoopId, OutboundContext, OutboundEventLoop, PumpMode};
pub use relay::Relay;
