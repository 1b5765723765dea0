//! Server Ed25519 identity.
//!
//! The server id is the base58 encoding of the Ed25519 verifying key, so
//! any peer can check a signature knowing only the claimed id. The key
//! pair lives in the OS secret store (or a key file when the deployment
//! has no keyring daemon) and is generated on first start.

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

const SERVICE: &str = "zajel-server";
const ACCOUNT: &str = "identity";

/// The server's signing identity.
pub struct ServerIdentity {
    signing: SigningKey,
    server_id: String,
}

impl ServerIdentity {
    fn from_signing(signing: SigningKey) -> Self {
        let server_id = bs58::encode(signing.verifying_key().as_bytes()).into_string();
        Self { signing, server_id }
    }

    /// Load the identity from the OS secret store, generating and
    /// persisting a fresh key pair on first run.
    pub fn load_or_create() -> Result<Self> {
        let entry = keyring::Entry::new(SERVICE, ACCOUNT)?;
        match entry.get_password() {
            Ok(stored) => {
                let bytes = hex::decode(&stored).context("stored identity key is corrupt")?;
                let secret: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("stored identity key is corrupt"))?;
                Ok(Self::from_signing(SigningKey::from_bytes(&secret)))
            }
            Err(keyring::Error::NoEntry) => {
                let signing = SigningKey::generate(&mut OsRng);
                entry.set_password(&hex::encode(signing.to_bytes()))?;
                Ok(Self::from_signing(signing))
            }
            Err(e) => Err(e).context("secret store unavailable"),
        }
    }

    /// Load the identity from a key file, generating it on first run.
    /// For deployments without a keyring daemon.
    pub fn load_or_create_file(path: &str) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(stored) => {
                let bytes =
                    hex::decode(stored.trim()).context("identity key file is corrupt")?;
                let secret: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("identity key file is corrupt"))?;
                Ok(Self::from_signing(SigningKey::from_bytes(&secret)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let signing = SigningKey::generate(&mut OsRng);
                std::fs::write(path, hex::encode(signing.to_bytes()))
                    .with_context(|| format!("writing identity key to {path}"))?;
                Ok(Self::from_signing(signing))
            }
            Err(e) => Err(e).with_context(|| format!("reading identity key from {path}")),
        }
    }

    /// Fresh throwaway identity (tests, ephemeral nodes).
    pub fn ephemeral() -> Self {
        Self::from_signing(SigningKey::generate(&mut OsRng))
    }

    /// Base58 of the verifying key — the server's federation identity.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Base58 verifying key (same as the server id).
    pub fn public_key_b58(&self) -> String {
        self.server_id.clone()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

/// Verify a signature against a base58 server id.
pub fn verify(server_id: &str, message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = bs58::decode(server_id).into_vec() else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}
