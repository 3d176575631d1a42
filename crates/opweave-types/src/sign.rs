//! Ed25519 signing wrappers.
//!
//! Thin newtypes over `ed25519-dalek` so the rest of the workspace never
//! touches the raw curve types. A [`Keypair`] carries the [`Id`] derived
//! from its public key at generation time; that id is what appears in
//! `creator_id` and master-signature lists.

use crate::id::Id;
use crate::time::Timestamp;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

/// A verifying key, serializable for persistence in member/master records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PubKey(VerifyingKey);

impl PubKey {
    /// Verify `sig` over `msg`.
    pub fn verify(&self, msg: &[u8], sig: &Sig) -> bool {
        self.0.verify(msg, &sig.0).is_ok()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// A detached ed25519 signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sig(Signature);

/// A signing identity: secret key plus the id derived from its public key.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
    id: Id,
}

impl Keypair {
    /// Generate a fresh identity stamped with the current time.
    pub fn generate() -> Self {
        Self::generate_at(Timestamp::now())
    }

    /// Generate with an explicit creation time (deterministic tests).
    pub fn generate_at(ts: Timestamp) -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let id = Id::generate(signing.verifying_key().as_bytes(), ts);
        Keypair { signing, id }
    }

    /// The identity's id, used as `creator_id` and as a signer id.
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn public(&self) -> PubKey {
        PubKey(self.signing.verifying_key())
    }

    /// Sign a message (in practice: an oplog content hash).
    pub fn sign(&self, msg: &[u8]) -> Sig {
        Sig(self.signing.sign(msg))
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", self.id.short())
    }
}
