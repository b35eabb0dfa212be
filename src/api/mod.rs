//! Application-facing hooks and the engine container.

use std::sync::Arc;

use crate::message::{Message, Payload};
use crate::network::MessageSink;
use crate::process::DbrbHandle;
use crate::shard::ShardedDbrbHandle;
use crate::view::ViewData;

/// Outcome of the application vetting a received payload. `Invalid` and
/// `Neutral` both cause the Prepare carrying the payload to be dropped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid,
    Neutral,
}

/// Operating mode the embedding application can impose on the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DbrbMode {
    Running,
    /// Prepare, Commit and Reconfig processing is suspended.
    LimitedProcessing,
}

/// Handed the payload once the broadcast primitive commits; invoked at most
/// once per payload per process.
pub type DeliverCallback = Box<dyn FnMut(Payload) + Send>;

/// Application-level vetting of a received payload.
pub type ValidationCallback = Box<dyn Fn(&Payload) -> ValidationResult + Send>;

/// Queries the mode the application wants the engine to run in.
pub type GetDbrbModeCallback = Box<dyn Fn() -> DbrbMode + Send>;

/// Front of whichever engine this node runs. The flat and the sharded
/// engine are exclusive per process; the mode is fixed at startup by the
/// configured shard size, and switching requires constructing a new
/// container.
#[derive(Clone)]
pub enum DbrbContainer {
    Flat(DbrbHandle),
    Sharded(ShardedDbrbHandle),
}

impl DbrbContainer {
    pub fn sharding_enabled(&self) -> bool {
        matches!(self, DbrbContainer::Sharded(_))
    }

    /// Broadcast `payload`. The flat engine always addresses its current
    /// view; the sharded engine builds its tree over `recipients`.
    pub fn broadcast(&self, payload: Payload, recipients: ViewData) {
        match self {
            DbrbContainer::Flat(handle) => handle.broadcast(payload),
            DbrbContainer::Sharded(handle) => handle.broadcast(payload, recipients),
        }
    }

    pub fn process_message(&self, message: Message) {
        match self {
            DbrbContainer::Flat(handle) => handle.process_message(message),
            DbrbContainer::Sharded(handle) => handle.process_message(message),
        }
    }

    /// Refetch the membership and renew the registration when required.
    pub fn update_view(&self, now: u64) {
        match self {
            DbrbContainer::Flat(handle) => handle.update_view(now),
            DbrbContainer::Sharded(handle) => handle.update_view(now),
        }
    }

    pub fn clear_data(&self) {
        match self {
            DbrbContainer::Flat(handle) => handle.clear_broadcast_data(),
            DbrbContainer::Sharded(handle) => handle.clear_data(),
        }
    }

    /// Request to leave the system; only the flat engine reconfigures.
    pub fn leave(&self) {
        match self {
            DbrbContainer::Flat(handle) => handle.leave(),
            DbrbContainer::Sharded(_) => {
                log::warn!("leave is not supported by the sharded engine");
            }
        }
    }

    /// The sink inbound dispatch posts verified messages to.
    pub fn message_sink(&self) -> Arc<dyn MessageSink> {
        match self {
            DbrbContainer::Flat(handle) => Arc::new(handle.clone()),
            DbrbContainer::Sharded(handle) => Arc::new(handle.clone()),
        }
    }
}
