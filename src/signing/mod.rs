//! Payload-bound signatures.
//!
//! Two disciplines exist: flat-mode signatures bind a payload to the view it
//! is acknowledged under, sharded-mode signatures additionally bind the
//! message type and the full tree view, so that sharded and flat
//! certificates can never be conflated.

use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use lru::LruCache;

use crate::utilities::crypto::{ed25519, Keypair, ProcessId, Signature};
use crate::message::{PacketType, Payload};
use crate::utilities::hash::{HashType, Sha3Hasher};
use crate::view::{TreeView, View};

const VERIFIED_CACHE_SIZE: usize = 1000;

/// Signs payloads with this process' keypair and verifies other processes'
/// payload signatures, deduplicating repeated verifications of the same
/// certificate entries.
pub(crate) struct PayloadSigner {
    signing_keypair: Arc<Keypair>,
    /// Signatures already verified successfully.
    verified: LruCache<HashType, ()>,
}

impl PayloadSigner {
    pub(crate) fn new(keypair: Arc<Keypair>) -> Self {
        Self {
            signing_keypair: keypair,
            verified: LruCache::new(NonZeroUsize::new(VERIFIED_CACHE_SIZE).unwrap()),
        }
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.signing_keypair
    }

    /// Signature over a payload bound to `view`.
    pub(crate) fn sign_payload(&self, payload: &Payload, view: &View) -> Signature {
        let digest = payload_digest(payload, view);
        self.signing_keypair.sign(digest.as_bytes())
    }

    /// Verifies a flat-mode payload signature.
    pub(crate) fn verify_payload(
        &mut self,
        signer: &ProcessId,
        payload: &Payload,
        view: &View,
        signature: &Signature,
    ) -> bool {
        self.verify_digest(signer, payload_digest(payload, view), signature)
    }

    /// Signature over a payload bound to `packet_type` and the tree view.
    pub(crate) fn sign_shard_payload(
        &self,
        packet_type: PacketType,
        payload: &Payload,
        tree_view: &TreeView,
    ) -> Signature {
        let digest = shard_payload_digest(packet_type, payload, tree_view);
        self.signing_keypair.sign(digest.as_bytes())
    }

    /// Verifies a sharded-mode payload signature.
    pub(crate) fn verify_shard_payload(
        &mut self,
        signer: &ProcessId,
        packet_type: PacketType,
        payload: &Payload,
        tree_view: &TreeView,
        signature: &Signature,
    ) -> bool {
        self.verify_digest(
            signer,
            shard_payload_digest(packet_type, payload, tree_view),
            signature,
        )
    }

    /// Signs an arbitrary protocol digest, e.g. a converged pair.
    pub(crate) fn sign_digest(&self, digest: &HashType) -> Signature {
        self.signing_keypair.sign(digest.as_bytes())
    }

    fn verify_digest(
        &mut self,
        signer: &ProcessId,
        digest: HashType,
        signature: &Signature,
    ) -> bool {
        let cache_key =
            Sha3Hasher::digest_buffers(&[digest.as_bytes(), signer.as_bytes(), signature.as_bytes()]);
        if self.verified.get(&cache_key).is_some() {
            log::trace!("signature of {signer} already verified");
            return true;
        }

        if ed25519::verify(signer, digest.as_bytes(), signature) {
            self.verified.put(cache_key, ());
            true
        } else {
            false
        }
    }
}

/// Digest of a flat-mode payload signature: `SHA3-256(payload ‖ packed view)`.
pub(crate) fn payload_digest(payload: &Payload, view: &View) -> HashType {
    Sha3Hasher::digest_buffers(&[payload, &view.packed()])
}

/// Digest of a sharded-mode payload signature:
/// `SHA3-256(u32 type ‖ packed tree view ‖ payload)`.
pub(crate) fn shard_payload_digest(
    packet_type: PacketType,
    payload: &Payload,
    tree_view: &TreeView,
) -> HashType {
    let mut prefix = BytesMut::with_capacity(8 + tree_view.len() * 32);
    prefix.put_u32_le(packet_type as u16 as u32);
    prefix.put_u32_le(tree_view.len() as u32);
    for id in tree_view {
        prefix.put_slice(id.as_bytes());
    }
    Sha3Hasher::digest_buffers(&[&prefix, payload])
}

/// Verifies an arbitrary protocol digest without the cache.
pub(crate) fn verify_digest(signer: &ProcessId, digest: &HashType, signature: &Signature) -> bool {
    ed25519::verify(signer, digest.as_bytes(), signature)
}
