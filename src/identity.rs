use std::fmt::{self, Debug, Formatter};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{DhtError, Result};
use crate::node_id::NodeId;

/// The Ed25519 key pair of the local node together with the `NodeId` derived from it.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    id: NodeId,
}

impl Identity {
    /// Generates a fresh key pair from the operating system's entropy source. The node id is the
    /// public key truncated to its first 20 bytes.
    pub fn generate() -> Result<Self> {
        let mut secret = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut secret)
            .map_err(|err| DhtError::Entropy(err.to_string()))?;
        Ok(Identity::from_secret_key_bytes(&secret))
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let id = NodeId::from_public_key(&signing_key.verifying_key().to_bytes());
        Identity { signing_key, id }
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verifies `signature` over `message` against a raw public key.
    pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &Signature) -> bool {
        match VerifyingKey::from_bytes(public_key) {
            Ok(key) => key.verify(message, signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Identity").field("id", &self.id).finish()
    }
}
