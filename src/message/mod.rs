//! The closed set of messages exchanged by DBRB processes.
//!
//! Messages form a tagged union over [`PacketType`]; dispatch is a single
//! exhaustive match on the tag. The wire layout lives in [`codec`].

use std::collections::BTreeMap;
use std::fmt::Display;

use bytes::Bytes;

use crate::utilities::crypto::{ProcessId, Signature};
use crate::membership::{MembershipChange, PendingChanges};
use crate::utilities::hash::{HashType, Sha3Hasher};
use crate::view::{Sequence, TreeView, View};

pub mod codec;

/// Opaque application bytes moved by the broadcast primitive.
pub type Payload = Bytes;

/// Quorum-sized proof that a payload was witnessed under a specific view.
/// Keyed by signer to enforce uniqueness; iteration order is canonical.
pub type Certificate = BTreeMap<ProcessId, Signature>;

/// Wire discriminator of each message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    Prepare = 1,
    Acknowledged = 2,
    Commit = 3,
    Deliver = 4,
    ConfirmDeliver = 5,
    Reconfig = 6,
    ReconfigConfirm = 7,
    Propose = 8,
    Converged = 9,
    Install = 10,
    StateUpdate = 11,
    ShardPrepare = 12,
    ShardAcknowledged = 13,
    ShardCommit = 14,
    ShardDeliver = 15,
}

impl PacketType {
    pub(crate) fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(PacketType::Prepare),
            2 => Some(PacketType::Acknowledged),
            3 => Some(PacketType::Commit),
            4 => Some(PacketType::Deliver),
            5 => Some(PacketType::ConfirmDeliver),
            6 => Some(PacketType::Reconfig),
            7 => Some(PacketType::ReconfigConfirm),
            8 => Some(PacketType::Propose),
            9 => Some(PacketType::Converged),
            10 => Some(PacketType::Install),
            11 => Some(PacketType::StateUpdate),
            12 => Some(PacketType::ShardPrepare),
            13 => Some(PacketType::ShardAcknowledged),
            14 => Some(PacketType::ShardCommit),
            15 => Some(PacketType::ShardDeliver),
            _ => None,
        }
    }
}

impl Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// Messages related to the BROADCAST operation.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrepareMessage {
    pub sender: ProcessId,
    /// Payload to be broadcast.
    pub payload: Payload,
    /// Current view of the system from the perspective of the sender.
    pub view: View,
    /// Bootstrap set of the sender; receivers use it for the
    /// deliver-confirmation cross check.
    pub bootstrap_view: View,
}

impl PrepareMessage {
    pub fn payload_hash(&self) -> HashType {
        Sha3Hasher::digest_buffers(&[&self.payload])
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcknowledgedMessage {
    pub sender: ProcessId,
    pub payload_hash: HashType,
    pub view: View,
    /// Signature over the payload bound to `view`, formed by the sender.
    pub payload_signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitMessage {
    pub sender: ProcessId,
    pub payload_hash: HashType,
    /// Acknowledged-quorum certificate for the payload.
    pub certificate: Certificate,
    /// View in which the certificate was sealed.
    pub certificate_view: View,
    /// Current view of the system from the perspective of the sender.
    pub current_view: View,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliverMessage {
    pub sender: ProcessId,
    pub payload_hash: HashType,
    pub view: View,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmDeliverMessage {
    pub sender: ProcessId,
    pub payload_hash: HashType,
    pub view: View,
}

// Messages related to JOIN and LEAVE operations.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconfigMessage {
    pub sender: ProcessId,
    /// Process the change is about.
    pub process_id: ProcessId,
    pub change: MembershipChange,
    /// Current view from the perspective of the sender; it does not yet
    /// include the requested change.
    pub view: View,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconfigConfirmMessage {
    pub sender: ProcessId,
    /// View the confirmation is bound to.
    pub view: View,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposeMessage {
    pub sender: ProcessId,
    /// Proposed sequence of successor views.
    pub proposed_sequence: Sequence,
    /// View to be replaced by the proposed sequence.
    pub replaced_view: View,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvergedMessage {
    pub sender: ProcessId,
    pub converged_sequence: Sequence,
    pub replaced_view: View,
    /// Signature over the (replaced view, converged sequence) pair; these
    /// are what an Install message collects as its certificate.
    pub signature: Signature,
}

impl ConvergedMessage {
    /// Digest every converged signature covers.
    pub(crate) fn signed_digest(replaced_view: &View, converged_sequence: &Sequence) -> HashType {
        let mut buffers: Vec<Bytes> = vec![replaced_view.packed()];
        for view in converged_sequence.data() {
            buffers.push(view.packed());
        }
        let borrowed: Vec<&[u8]> = buffers.iter().map(|b| b.as_ref()).collect();
        Sha3Hasher::digest_buffers(&borrowed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallMessage {
    pub sender: ProcessId,
    /// View being retired by this transition.
    pub replaced_view: View,
    /// The ordered sequence of successor views. A leave produces a successor
    /// smaller than the replaced view, so the replaced view is carried
    /// separately instead of being prepended to this sequence.
    pub converged_sequence: Sequence,
    /// Converged signatures of at least a replaced-view quorum of processes.
    pub converged_signatures: Certificate,
}

/// An Install message's semantic content in unwrapped form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallMessageData {
    pub replaced_view: View,
    pub converged_sequence: Sequence,
    pub most_recent_view: View,
}

impl InstallMessage {
    /// Unwraps the carried views, if well-formed.
    pub fn try_get_message_data(&self) -> Option<InstallMessageData> {
        let most_recent_view = self.converged_sequence.maybe_most_recent()?.clone();
        if self.replaced_view.is_empty() {
            return None;
        }
        Some(InstallMessageData {
            replaced_view: self.replaced_view.clone(),
            converged_sequence: self.converged_sequence.clone(),
            most_recent_view,
        })
    }
}

/// Per-process snapshot transferred across view transitions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessState {
    /// Prepare message whose payload this process has committed to
    /// acknowledge, if any.
    pub acknowledgeable: Option<PrepareMessage>,
    /// A second, conflicting Prepare message seen from the same sender.
    pub conflicting: Option<PrepareMessage>,
    /// Stored Commit message with a valid certificate, if any.
    pub stored: Option<CommitMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateUpdateMessage {
    pub sender: ProcessId,
    pub state: ProcessState,
    /// The replaced view the state refers to.
    pub view: View,
    pub pending_changes: PendingChanges,
}

// Messages of the sharded (tree-organised) broadcast variant.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardPrepareMessage {
    pub sender: ProcessId,
    pub payload: Payload,
    /// The full broadcast tree; index 0 is the broadcaster.
    pub tree_view: TreeView,
    /// The broadcaster's signature over (type, tree view, payload).
    pub broadcaster_signature: Signature,
}

impl ShardPrepareMessage {
    pub fn payload_hash(&self) -> HashType {
        Sha3Hasher::digest_buffers(&[&self.payload])
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardAcknowledgedMessage {
    pub sender: ProcessId,
    pub payload_hash: HashType,
    /// Merged acknowledge signatures of the sender's subtree.
    pub certificate: Certificate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardCommitMessage {
    pub sender: ProcessId,
    pub payload_hash: HashType,
    /// Network-quorum-sized acknowledge certificate.
    pub certificate: Certificate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardDeliverMessage {
    pub sender: ProcessId,
    pub payload_hash: HashType,
    /// Deliver signatures collected on the sender's side of the tree.
    pub certificate: Certificate,
}

/// Every message a DBRB process can receive. The set is fixed by the
/// protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Prepare(PrepareMessage),
    Acknowledged(AcknowledgedMessage),
    Commit(CommitMessage),
    Deliver(DeliverMessage),
    ConfirmDeliver(ConfirmDeliverMessage),
    Reconfig(ReconfigMessage),
    ReconfigConfirm(ReconfigConfirmMessage),
    Propose(ProposeMessage),
    Converged(ConvergedMessage),
    Install(InstallMessage),
    StateUpdate(StateUpdateMessage),
    ShardPrepare(ShardPrepareMessage),
    ShardAcknowledged(ShardAcknowledgedMessage),
    ShardCommit(ShardCommitMessage),
    ShardDeliver(ShardDeliverMessage),
}

impl Message {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Message::Prepare(_) => PacketType::Prepare,
            Message::Acknowledged(_) => PacketType::Acknowledged,
            Message::Commit(_) => PacketType::Commit,
            Message::Deliver(_) => PacketType::Deliver,
            Message::ConfirmDeliver(_) => PacketType::ConfirmDeliver,
            Message::Reconfig(_) => PacketType::Reconfig,
            Message::ReconfigConfirm(_) => PacketType::ReconfigConfirm,
            Message::Propose(_) => PacketType::Propose,
            Message::Converged(_) => PacketType::Converged,
            Message::Install(_) => PacketType::Install,
            Message::StateUpdate(_) => PacketType::StateUpdate,
            Message::ShardPrepare(_) => PacketType::ShardPrepare,
            Message::ShardAcknowledged(_) => PacketType::ShardAcknowledged,
            Message::ShardCommit(_) => PacketType::ShardCommit,
            Message::ShardDeliver(_) => PacketType::ShardDeliver,
        }
    }

    pub fn sender(&self) -> ProcessId {
        match self {
            Message::Prepare(message) => message.sender,
            Message::Acknowledged(message) => message.sender,
            Message::Commit(message) => message.sender,
            Message::Deliver(message) => message.sender,
            Message::ConfirmDeliver(message) => message.sender,
            Message::Reconfig(message) => message.sender,
            Message::ReconfigConfirm(message) => message.sender,
            Message::Propose(message) => message.sender,
            Message::Converged(message) => message.sender,
            Message::Install(message) => message.sender,
            Message::StateUpdate(message) => message.sender,
            Message::ShardPrepare(message) => message.sender,
            Message::ShardAcknowledged(message) => message.sender,
            Message::ShardCommit(message) => message.sender,
            Message::ShardDeliver(message) => message.sender,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::view::test::view_of;

    use super::*;

    #[test]
    fn test_install_message_data_unwrapping() {
        let converged_sequence =
            Sequence::from_views(vec![view_of(&[1, 2, 3]), view_of(&[1, 2, 3, 4])]).unwrap();
        let install = InstallMessage {
            sender: ProcessId::default(),
            replaced_view: view_of(&[1, 2]),
            converged_sequence,
            converged_signatures: Certificate::new(),
        };

        let data = install.try_get_message_data().unwrap();
        assert_eq!(view_of(&[1, 2]), data.replaced_view);
        assert_eq!(2, data.converged_sequence.len());
        assert_eq!(view_of(&[1, 2, 3, 4]), data.most_recent_view);
    }

    #[test]
    fn test_install_message_requires_replaced_and_successor_views() {
        let install = InstallMessage {
            sender: ProcessId::default(),
            replaced_view: view_of(&[1, 2]),
            converged_sequence: Sequence::default(),
            converged_signatures: Certificate::new(),
        };
        assert!(install.try_get_message_data().is_none());

        let install = InstallMessage {
            sender: ProcessId::default(),
            replaced_view: View::default(),
            converged_sequence: Sequence::from_views(vec![view_of(&[1])]).unwrap(),
            converged_signatures: Certificate::new(),
        };
        assert!(install.try_get_message_data().is_none());
    }

    #[test]
    fn test_install_message_supports_leave_transitions() {
        // A leave shrinks the membership, so the successor view is smaller
        // than the replaced one.
        let install = InstallMessage {
            sender: ProcessId::default(),
            replaced_view: view_of(&[1, 2, 3, 4]),
            converged_sequence: Sequence::from_views(vec![view_of(&[1, 3, 4])]).unwrap(),
            converged_signatures: Certificate::new(),
        };

        let data = install.try_get_message_data().unwrap();
        assert_eq!(view_of(&[1, 3, 4]), data.most_recent_view);
    }
}
