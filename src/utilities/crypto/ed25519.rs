//! Uses the `ed25519-zebra` crate to implement signing and signature verification.
use ed25519_zebra::{SigningKey, VerificationKey};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::utilities::crypto::{KeyPairError, ProcessId, Signature};

pub struct Keypair {
    signing_key: SigningKey,
    verification_key: VerificationKey,
}

impl Keypair {
    /// Generates a fresh keypair. A seed makes generation deterministic,
    /// which tests rely on.
    pub fn generate(seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut seed_bytes = [0u8; 32];
        rng.fill_bytes(&mut seed_bytes);
        let signing_key = SigningKey::from(seed_bytes);
        let verification_key = VerificationKey::from(&signing_key);
        Keypair {
            signing_key,
            verification_key,
        }
    }

    pub fn from_private_key_hex(hex: &str) -> Result<Self, KeyPairError> {
        let bytes = array_bytes::hex2bytes(hex).map_err(|err| {
            log::error!("Error decoding hex: {:?}", err);
            KeyPairError::PrivateKey("Hex decoding error".into())
        })?;
        let signing_key = SigningKey::try_from(&bytes[..]).map_err(|err| {
            log::error!("Error decoding private key: {:?}", err);
            KeyPairError::PrivateKey("Private key decoding error".into())
        })?;
        let verification_key = VerificationKey::from(&signing_key);
        Ok(Keypair {
            signing_key,
            verification_key,
        })
    }

    pub fn private_key_to_hex(&self) -> String {
        array_bytes::bytes2hex("", self.signing_key.as_ref())
    }

    /// Identity of the process owning this keypair.
    pub fn process_id(&self) -> ProcessId {
        ProcessId(self.verification_key.into())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).into())
    }
}

/// Verifies `signature` over `message` under the key behind `signer`.
pub fn verify(signer: &ProcessId, message: &[u8], signature: &Signature) -> bool {
    let Ok(verification_key) = VerificationKey::try_from(&signer.0[..]) else {
        return false;
    };
    verification_key
        .verify(&ed25519_zebra::Signature::from(signature.0), message)
        .is_ok()
}
