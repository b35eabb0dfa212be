//! Per-payload state of the sharded broadcast.

use std::collections::BTreeMap;

use crate::utilities::crypto::ProcessId;
use crate::message::{Certificate, Payload};
use crate::shard::DoubleShard;
use crate::view::{TreeView, View};

/// Deliver certificate owed to one neighbour. The certificate is sent only
/// once the neighbour asked for it (via Commit) and the expected quorum has
/// been reached on this side of the tree.
#[derive(Clone, Debug, Default)]
pub(crate) struct DeliverCertificateState {
    pub(crate) requested: bool,
    pub(crate) quorum_collected: bool,
    pub(crate) certificate: Certificate,
}

impl DeliverCertificateState {
    pub(crate) fn new(certificate: Certificate) -> Self {
        Self {
            requested: false,
            quorum_collected: false,
            certificate,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ShardBroadcastData {
    pub(crate) payload: Option<Payload>,

    /// When the payload was first observed locally, in milliseconds.
    pub(crate) begin: u64,

    /// Root of the broadcast tree.
    pub(crate) broadcaster: ProcessId,

    /// Membership of the whole broadcast.
    pub(crate) broadcast_view: View,

    /// This process plus the subtrees of its children.
    pub(crate) sub_tree_view: View,

    /// The tree ordering the broadcast runs on.
    pub(crate) tree: TreeView,

    /// This process' place in the tree.
    pub(crate) shard: DoubleShard,

    pub(crate) network_quorum_size: usize,
    pub(crate) parent_shard_quorum_size: usize,
    pub(crate) child_shard_quorum_size: usize,

    /// Acknowledge signatures aggregated from this process' subtree.
    pub(crate) acknowledge_certificate: Certificate,
    pub(crate) acknowledged: bool,

    pub(crate) commit_message_sent: bool,

    /// Deliver signatures collected from the parent side of the tree.
    pub(crate) parent_shard_deliver_certificate: Certificate,
    /// Deliver signatures collected from this process' own subtree.
    pub(crate) child_shard_deliver_certificate: Certificate,

    /// Deliver certificates owed to children (parent-shard side).
    pub(crate) parent_shard_deliver_recipients: BTreeMap<ProcessId, DeliverCertificateState>,
    /// Deliver certificates owed to the parent and siblings (child-shard side).
    pub(crate) child_shard_deliver_recipients: BTreeMap<ProcessId, DeliverCertificateState>,

    pub(crate) delivered: bool,
}
