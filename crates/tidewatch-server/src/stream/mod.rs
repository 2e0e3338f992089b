//! The event stream engine.
//!
//! A [`StreamHub`] owns the [`ConnectionRegistry`] of open connections, the
//! live poller's [`StreamCheckpoint`] and a bounded pool for replay
//! sessions. Each connection is a [`Subscriber`] with a bounded outbound
//! queue drained by its own writer task.
//!
//! A subscribe request runs a replay session: history newer than the
//! client's `last_seen` cursor, then whatever the live poller broadcast in
//! the meantime, then a `subscription_confirmed` frame, after which the
//! poller delivers to the connection directly. Every event frame passes the
//! subscriber's id gate, so each connection sees strictly increasing ids
//! without duplicates.

mod checkpoint;
mod error;
mod hub;
mod poller;
pub mod protocol;
mod registry;
mod replay;
mod subscriber;

pub use checkpoint::StreamCheckpoint;
pub use error::StreamError;
pub use hub::{StreamHub, StreamSettings};
pub use registry::ConnectionRegistry;
pub use replay::HISTORY_FAILED;
pub use subscriber::{DeliveryError, Phase, Subscriber};
