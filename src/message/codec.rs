//! Wire layout of DBRB packets.
//!
//! Every packet shares the envelope `u32 size ‖ u16 type ‖ signature ‖
//! sender ‖ payload`; the sender signature covers the whole envelope minus
//! the signature field. Integers are little-endian. Views, sequences and
//! certificates are length-prefixed with canonical (ascending) entry order
//! so that message hashes are reproducible across implementations.

use bytes::{BufMut, Bytes, BytesMut};

use crate::utilities::crypto::{ed25519, Keypair, ProcessId, Signature};
use crate::membership::{MembershipChange, PendingChanges};
use crate::message::{
    AcknowledgedMessage, Certificate, CommitMessage, ConfirmDeliverMessage, ConvergedMessage,
    DeliverMessage, InstallMessage, Message, PacketType, Payload, PrepareMessage, ProcessState,
    ProposeMessage, ReconfigConfirmMessage, ReconfigMessage, ShardAcknowledgedMessage,
    ShardCommitMessage, ShardDeliverMessage, ShardPrepareMessage, StateUpdateMessage,
};
use crate::utilities::encoding::{
    read_array, read_bytes, read_u16, read_u32, read_u8, CodecError, CodecResult,
};
use crate::utilities::hash::{DbrbHasher, HashType, Sha3Hasher};
use crate::view::{Sequence, TreeView, View};

const ENVELOPE_HEADER_SIZE: usize = 4 + 2;
const SIGNATURE_SIZE: usize = 64;
const PROCESS_ID_SIZE: usize = 32;

/// A decoded packet: the message plus the envelope signature it arrived
/// under. The signature is verified off-strand before dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedPacket {
    pub message: Message,
    pub sender_signature: Signature,
}

/// Encodes `message` into a signed network packet.
pub fn encode(message: &Message, keypair: &Keypair) -> Bytes {
    let payload = encode_payload(message);
    let sender = message.sender();
    let size = (ENVELOPE_HEADER_SIZE + SIGNATURE_SIZE + PROCESS_ID_SIZE + payload.len()) as u32;

    let digest = envelope_digest_parts(size, message.packet_type() as u16, &sender, &payload);
    let signature = keypair.sign(digest.as_bytes());

    let mut packet = BytesMut::with_capacity(size as usize);
    packet.put_u32_le(size);
    packet.put_u16_le(message.packet_type() as u16);
    packet.put_slice(signature.as_bytes());
    packet.put_slice(sender.as_bytes());
    packet.put_slice(&payload);
    packet.freeze()
}

/// Decodes a packet. Does not verify the sender signature; use
/// [`verify_sender_signature`] on the raw bytes afterwards.
pub fn decode(packet: Bytes) -> CodecResult<DecodedPacket> {
    let mut buf = packet.clone();

    let size = read_u32(&mut buf)? as usize;
    if size != packet.len() {
        return Err(CodecError::InvalidField("size"));
    }
    let raw_type = read_u16(&mut buf)?;
    let packet_type =
        PacketType::from_u16(raw_type).ok_or(CodecError::UnknownMessageType(raw_type))?;
    let sender_signature = Signature::new(read_array::<SIGNATURE_SIZE>(&mut buf)?);
    let sender = ProcessId::new(read_array::<PROCESS_ID_SIZE>(&mut buf)?);

    let message = decode_payload(packet_type, sender, &mut buf)?;
    if !buf.is_empty() {
        return Err(CodecError::TrailingBytes);
    }

    Ok(DecodedPacket {
        message,
        sender_signature,
    })
}

/// Checks the envelope signature of `packet` against its declared sender.
pub fn verify_sender_signature(packet: &[u8], decoded: &DecodedPacket) -> bool {
    if packet.len() < ENVELOPE_HEADER_SIZE + SIGNATURE_SIZE {
        return false;
    }
    let mut hasher = Sha3Hasher::default();
    hasher.update(&packet[..ENVELOPE_HEADER_SIZE]);
    hasher.update(&packet[ENVELOPE_HEADER_SIZE + SIGNATURE_SIZE..]);
    let digest = hasher.finish();

    ed25519::verify(
        &decoded.message.sender(),
        &digest,
        &decoded.sender_signature,
    )
}

fn envelope_digest_parts(
    size: u32,
    packet_type: u16,
    sender: &ProcessId,
    payload: &[u8],
) -> HashType {
    Sha3Hasher::digest_buffers(&[
        &size.to_le_bytes(),
        &packet_type.to_le_bytes(),
        sender.as_bytes(),
        payload,
    ])
}

// Payload encoders.

fn encode_payload(message: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    match message {
        Message::Prepare(message) => {
            put_payload(&mut buf, &message.payload);
            message.view.pack_into(&mut buf);
            message.bootstrap_view.pack_into(&mut buf);
        }
        Message::Acknowledged(message) => {
            put_hash(&mut buf, &message.payload_hash);
            message.view.pack_into(&mut buf);
            buf.put_slice(message.payload_signature.as_bytes());
        }
        Message::Commit(message) => {
            put_hash(&mut buf, &message.payload_hash);
            put_certificate(&mut buf, &message.certificate);
            message.certificate_view.pack_into(&mut buf);
            message.current_view.pack_into(&mut buf);
        }
        Message::Deliver(message) => {
            put_hash(&mut buf, &message.payload_hash);
            message.view.pack_into(&mut buf);
        }
        Message::ConfirmDeliver(message) => {
            put_hash(&mut buf, &message.payload_hash);
            message.view.pack_into(&mut buf);
        }
        Message::Reconfig(message) => {
            buf.put_slice(message.process_id.as_bytes());
            buf.put_u8(message.change.as_u8());
            message.view.pack_into(&mut buf);
        }
        Message::ReconfigConfirm(message) => {
            message.view.pack_into(&mut buf);
        }
        Message::Propose(message) => {
            message.replaced_view.pack_into(&mut buf);
            put_sequence(&mut buf, &message.proposed_sequence);
        }
        Message::Converged(message) => {
            message.replaced_view.pack_into(&mut buf);
            put_sequence(&mut buf, &message.converged_sequence);
            buf.put_slice(message.signature.as_bytes());
        }
        Message::Install(message) => {
            message.replaced_view.pack_into(&mut buf);
            put_sequence(&mut buf, &message.converged_sequence);
            put_certificate(&mut buf, &message.converged_signatures);
        }
        Message::StateUpdate(message) => {
            put_process_state(&mut buf, &message.state);
            message.view.pack_into(&mut buf);
            put_pending_changes(&mut buf, &message.pending_changes);
        }
        Message::ShardPrepare(message) => {
            put_payload(&mut buf, &message.payload);
            put_tree_view(&mut buf, &message.tree_view);
            buf.put_slice(message.broadcaster_signature.as_bytes());
        }
        Message::ShardAcknowledged(message) => {
            put_hash(&mut buf, &message.payload_hash);
            put_certificate(&mut buf, &message.certificate);
        }
        Message::ShardCommit(message) => {
            put_hash(&mut buf, &message.payload_hash);
            put_certificate(&mut buf, &message.certificate);
        }
        Message::ShardDeliver(message) => {
            put_hash(&mut buf, &message.payload_hash);
            put_certificate(&mut buf, &message.certificate);
        }
    }
    buf.freeze()
}

fn decode_payload(
    packet_type: PacketType,
    sender: ProcessId,
    buf: &mut Bytes,
) -> CodecResult<Message> {
    let message = match packet_type {
        PacketType::Prepare => Message::Prepare(PrepareMessage {
            sender,
            payload: read_payload(buf)?,
            view: read_view(buf)?,
            bootstrap_view: read_view(buf)?,
        }),
        PacketType::Acknowledged => Message::Acknowledged(AcknowledgedMessage {
            sender,
            payload_hash: read_hash(buf)?,
            view: read_view(buf)?,
            payload_signature: read_signature(buf)?,
        }),
        PacketType::Commit => Message::Commit(CommitMessage {
            sender,
            payload_hash: read_hash(buf)?,
            certificate: read_certificate(buf)?,
            certificate_view: read_view(buf)?,
            current_view: read_view(buf)?,
        }),
        PacketType::Deliver => Message::Deliver(DeliverMessage {
            sender,
            payload_hash: read_hash(buf)?,
            view: read_view(buf)?,
        }),
        PacketType::ConfirmDeliver => Message::ConfirmDeliver(ConfirmDeliverMessage {
            sender,
            payload_hash: read_hash(buf)?,
            view: read_view(buf)?,
        }),
        PacketType::Reconfig => Message::Reconfig(ReconfigMessage {
            sender,
            process_id: ProcessId::new(read_array::<PROCESS_ID_SIZE>(buf)?),
            change: MembershipChange::from_u8(read_u8(buf)?)
                .ok_or(CodecError::InvalidField("membership change"))?,
            view: read_view(buf)?,
        }),
        PacketType::ReconfigConfirm => Message::ReconfigConfirm(ReconfigConfirmMessage {
            sender,
            view: read_view(buf)?,
        }),
        PacketType::Propose => Message::Propose(ProposeMessage {
            sender,
            replaced_view: read_view(buf)?,
            proposed_sequence: read_sequence(buf)?,
        }),
        PacketType::Converged => Message::Converged(ConvergedMessage {
            sender,
            replaced_view: read_view(buf)?,
            converged_sequence: read_sequence(buf)?,
            signature: read_signature(buf)?,
        }),
        PacketType::Install => Message::Install(InstallMessage {
            sender,
            replaced_view: read_view(buf)?,
            converged_sequence: read_sequence(buf)?,
            converged_signatures: read_certificate(buf)?,
        }),
        PacketType::StateUpdate => Message::StateUpdate(StateUpdateMessage {
            sender,
            state: read_process_state(buf)?,
            view: read_view(buf)?,
            pending_changes: read_pending_changes(buf)?,
        }),
        PacketType::ShardPrepare => Message::ShardPrepare(ShardPrepareMessage {
            sender,
            payload: read_payload(buf)?,
            tree_view: read_tree_view(buf)?,
            broadcaster_signature: read_signature(buf)?,
        }),
        PacketType::ShardAcknowledged => Message::ShardAcknowledged(ShardAcknowledgedMessage {
            sender,
            payload_hash: read_hash(buf)?,
            certificate: read_certificate(buf)?,
        }),
        PacketType::ShardCommit => Message::ShardCommit(ShardCommitMessage {
            sender,
            payload_hash: read_hash(buf)?,
            certificate: read_certificate(buf)?,
        }),
        PacketType::ShardDeliver => Message::ShardDeliver(ShardDeliverMessage {
            sender,
            payload_hash: read_hash(buf)?,
            certificate: read_certificate(buf)?,
        }),
    };
    Ok(message)
}

// Field primitives.

fn put_payload(buf: &mut BytesMut, payload: &Payload) {
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

fn read_payload(buf: &mut Bytes) -> CodecResult<Payload> {
    let len = read_u32(buf)? as usize;
    read_bytes(buf, len)
}

fn put_hash(buf: &mut BytesMut, hash: &HashType) {
    buf.put_slice(hash.as_bytes());
}

fn read_hash(buf: &mut Bytes) -> CodecResult<HashType> {
    Ok(HashType::new(read_array::<32>(buf)?))
}

fn read_signature(buf: &mut Bytes) -> CodecResult<Signature> {
    Ok(Signature::new(read_array::<SIGNATURE_SIZE>(buf)?))
}

fn read_view(buf: &mut Bytes) -> CodecResult<View> {
    let count = read_u32(buf)? as usize;
    let mut view = View::default();
    for _ in 0..count {
        view.insert(ProcessId::new(read_array::<PROCESS_ID_SIZE>(buf)?));
    }
    Ok(view)
}

fn put_sequence(buf: &mut BytesMut, sequence: &Sequence) {
    buf.put_u32_le(sequence.len() as u32);
    for view in sequence.data() {
        view.pack_into(buf);
    }
}

fn read_sequence(buf: &mut Bytes) -> CodecResult<Sequence> {
    let count = read_u32(buf)? as usize;
    let mut views = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        views.push(read_view(buf)?);
    }
    Sequence::from_views(views).ok_or(CodecError::InvalidField("sequence"))
}

fn put_certificate(buf: &mut BytesMut, certificate: &Certificate) {
    buf.put_u32_le(certificate.len() as u32);
    for (id, signature) in certificate {
        buf.put_slice(id.as_bytes());
        buf.put_slice(signature.as_bytes());
    }
}

fn read_certificate(buf: &mut Bytes) -> CodecResult<Certificate> {
    let count = read_u32(buf)? as usize;
    let mut certificate = Certificate::new();
    for _ in 0..count {
        let id = ProcessId::new(read_array::<PROCESS_ID_SIZE>(buf)?);
        let signature = read_signature(buf)?;
        certificate.insert(id, signature);
    }
    Ok(certificate)
}

fn put_tree_view(buf: &mut BytesMut, tree_view: &TreeView) {
    buf.put_u32_le(tree_view.len() as u32);
    for id in tree_view {
        buf.put_slice(id.as_bytes());
    }
}

fn read_tree_view(buf: &mut Bytes) -> CodecResult<TreeView> {
    let count = read_u32(buf)? as usize;
    let mut tree_view = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        tree_view.push(ProcessId::new(read_array::<PROCESS_ID_SIZE>(buf)?));
    }
    Ok(tree_view)
}

fn put_pending_changes(buf: &mut BytesMut, changes: &PendingChanges) {
    buf.put_u32_le(changes.len() as u32);
    for (id, change) in changes.iter() {
        buf.put_slice(id.as_bytes());
        buf.put_u8(change.as_u8());
    }
}

fn read_pending_changes(buf: &mut Bytes) -> CodecResult<PendingChanges> {
    let count = read_u32(buf)? as usize;
    let mut changes = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let id = ProcessId::new(read_array::<PROCESS_ID_SIZE>(buf)?);
        let change = MembershipChange::from_u8(read_u8(buf)?)
            .ok_or(CodecError::InvalidField("membership change"))?;
        changes.push((id, change));
    }
    Ok(changes.into_iter().collect())
}

fn put_prepare(buf: &mut BytesMut, message: &PrepareMessage) {
    buf.put_slice(message.sender.as_bytes());
    put_payload(buf, &message.payload);
    message.view.pack_into(buf);
    message.bootstrap_view.pack_into(buf);
}

fn read_prepare(buf: &mut Bytes) -> CodecResult<PrepareMessage> {
    Ok(PrepareMessage {
        sender: ProcessId::new(read_array::<PROCESS_ID_SIZE>(buf)?),
        payload: read_payload(buf)?,
        view: read_view(buf)?,
        bootstrap_view: read_view(buf)?,
    })
}

fn put_commit(buf: &mut BytesMut, message: &CommitMessage) {
    buf.put_slice(message.sender.as_bytes());
    put_hash(buf, &message.payload_hash);
    put_certificate(buf, &message.certificate);
    message.certificate_view.pack_into(buf);
    message.current_view.pack_into(buf);
}

fn read_commit(buf: &mut Bytes) -> CodecResult<CommitMessage> {
    Ok(CommitMessage {
        sender: ProcessId::new(read_array::<PROCESS_ID_SIZE>(buf)?),
        payload_hash: read_hash(buf)?,
        certificate: read_certificate(buf)?,
        certificate_view: read_view(buf)?,
        current_view: read_view(buf)?,
    })
}

fn put_process_state(buf: &mut BytesMut, state: &ProcessState) {
    put_optional(buf, state.acknowledgeable.as_ref(), put_prepare);
    put_optional(buf, state.conflicting.as_ref(), put_prepare);
    put_optional(buf, state.stored.as_ref(), put_commit);
}

fn read_process_state(buf: &mut Bytes) -> CodecResult<ProcessState> {
    Ok(ProcessState {
        acknowledgeable: read_optional(buf, read_prepare)?,
        conflicting: read_optional(buf, read_prepare)?,
        stored: read_optional(buf, read_commit)?,
    })
}

fn put_optional<T>(buf: &mut BytesMut, value: Option<&T>, put: fn(&mut BytesMut, &T)) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put(buf, value);
        }
        None => buf.put_u8(0),
    }
}

fn read_optional<T>(
    buf: &mut Bytes,
    read: fn(&mut Bytes) -> CodecResult<T>,
) -> CodecResult<Option<T>> {
    match read_u8(buf)? {
        0 => Ok(None),
        1 => Ok(Some(read(buf)?)),
        _ => Err(CodecError::InvalidField("optional flag")),
    }
}
