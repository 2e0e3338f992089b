//! The system event log.
//!
//! Producers (vault and policy lifecycle handlers) append events; the stream
//! engine reads them back in two ways: the live poller asks for everything
//! newer than its checkpoint, and replay sessions ask for everything newer
//! than a subscriber's `last_seen` cursor.
//!
//! Events get a strictly increasing `id` from the database. Their
//! `created_at` timestamps come from the producer's clock, so two events can
//! share a timestamp and a later id can carry an earlier timestamp. Readers
//! that need a total order should use `id`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tidewatch_events::{EventLog, NewSystemEvent, SqliteEventLog};
//! use tidewatch_types::SystemEventKind;
//!
//! let log = SqliteEventLog::new(pool);
//! let id = log.append(
//!     &NewSystemEvent::now(SystemEventKind::VaultDeleted).with_public_key("02ab..."),
//! )?;
//! let newer = log.events_after(checkpoint)?;
//! ```

mod error;
mod event;
mod log;
mod store;

pub use error::EventLogError;
pub use event::{from_epoch_micros, NewSystemEvent, SystemEvent};
pub use log::{EventLog, SqliteEventLog};
pub use store::{append_event, query_events, query_events_after, EventFilter};
