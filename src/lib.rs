//! # DBRB
//!
//! Dynamic Byzantine Reliable Broadcast: delivers payloads from an
//! initiating process to a quorum of processes in a membership that changes
//! over time, while tolerating up to a third of any installed view being
//! Byzantine.
//!
//! The crate provides three tightly coupled pieces:
//!
//! * the broadcast state machine — per-payload progression through
//!   Prepare → Acknowledged → Commit → Deliver, with quorum tracking and
//!   certificate assembly over Ed25519 signatures;
//! * the view-reconfiguration protocol — the Reconfig / Propose / Converged
//!   / Install / StateUpdate cascade that lets a dynamic process set agree
//!   on a monotonic sequence of views and carry per-process state across
//!   transitions;
//! * the sharded broadcast variant — a balanced k-ary tree overlay that
//!   bounds fan-out, where each process only talks to its parent, siblings
//!   and children.
//!
//! Everything outside the protocol — connections, node discovery, the
//! registered process set, anchoring of install messages — is consumed
//! through narrow traits ([`membership_api::ViewFetcher`],
//! [`membership_api::TransactionSender`], [`transport::ConnectionPool`]) so
//! the crate embeds into an existing node without owning its networking.
//!
//! A process engine is single-threaded by construction: all protocol state
//! is mutated only from the engine's run loop, fed by a command channel.
//! Handles post and return immediately, so no mutexes guard protocol state.

pub use crate::core::builder::{DbrbNode, DbrbStarter, StartError};
pub use crate::core::shutdown::ShutdownHandle;

pub mod dbrb_api {
    pub use crate::api::{
        DbrbContainer, DbrbMode, DeliverCallback, GetDbrbModeCallback, ValidationCallback,
        ValidationResult,
    };
    pub use crate::process::{DbrbHandle, OutboundPacket};
    pub use crate::shard::ShardedDbrbHandle;
}

pub mod crypto {
    pub use crate::utilities::crypto::{
        ed25519::verify, Keypair, KeyPairError, ProcessId, Signature,
    };
}

pub mod membership_api {
    pub use crate::membership::{
        MembershipChange, MembershipError, MembershipState, PendingChanges, TransactionSender,
        ViewFetcher,
    };
}

pub mod transport {
    pub use crate::network::{
        ConnectError, ConnectionPool, InboundDispatcher, MessageSender, MessageSink, PacketWriter,
    };
}

pub mod configuration {
    pub use crate::config::{Configuration, ConfigurationError, DbrbConfig, NodeConfig};
}

pub mod wire {
    pub use crate::message::{
        codec, AcknowledgedMessage, Certificate, CommitMessage, ConfirmDeliverMessage,
        ConvergedMessage, DeliverMessage, InstallMessage, InstallMessageData, Message, PacketType,
        Payload, PrepareMessage, ProcessState, ProposeMessage, ReconfigConfirmMessage,
        ReconfigMessage, ShardAcknowledgedMessage, ShardCommitMessage, ShardDeliverMessage,
        ShardPrepareMessage, StateUpdateMessage,
    };
    pub use crate::utilities::encoding::CodecError;
    pub use crate::utilities::hash::HashType;
}

pub mod views {
    pub use crate::view::{Sequence, TreeView, View, ViewData};
}

pub mod sharding {
    pub use crate::shard::{create_shard, create_tree_view, DoubleShard, TreeError};
}

mod api;
mod config;
mod core;
pub mod logging;
mod membership;
mod message;
mod network;
mod process;
mod quorum;
mod shard;
mod signing;
mod utilities;
mod view;
