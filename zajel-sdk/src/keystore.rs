//! OS secret-store persistence for long-lived key material.
//!
//! The identity key pair and group sender keys live in the platform
//! keyring (Keychain, Secret Service, Credential Manager), never on the
//! server and never in plain files. Keys are stored hex-encoded under the
//! `zajel` service:
//!
//! - identity key pair → account `identity`
//! - sender keys → account `group:{groupId}:sender:{deviceId}`

use keyring::Entry;

use crate::session::IdentityKeyPair;

const SERVICE: &str = "zajel";
const IDENTITY_ACCOUNT: &str = "identity";

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("secret store unavailable: {0}")]
    Store(#[from] keyring::Error),
    #[error("stored key material is corrupt")]
    Corrupt,
}

/// Handle to this device's keyring entries.
pub struct Keystore;

impl Keystore {
    fn entry(account: &str) -> Result<Entry, KeystoreError> {
        Ok(Entry::new(SERVICE, account)?)
    }

    fn sender_account(group_id: &str, device_id: &str) -> String {
        format!("group:{group_id}:sender:{device_id}")
    }

    /// Load the identity key pair, or generate and persist a fresh one on
    /// first run.
    pub fn load_or_create_identity() -> Result<IdentityKeyPair, KeystoreError> {
        let entry = Self::entry(IDENTITY_ACCOUNT)?;
        match entry.get_password() {
            Ok(stored) => {
                let bytes = hex::decode(&stored).map_err(|_| KeystoreError::Corrupt)?;
                let secret: [u8; 32] = bytes.try_into().map_err(|_| KeystoreError::Corrupt)?;
                Ok(IdentityKeyPair::from_secret(secret))
            }
            Err(keyring::Error::NoEntry) => {
                let pair = IdentityKeyPair::generate();
                entry.set_password(&hex::encode(pair.secret_bytes()))?;
                Ok(pair)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a sender key for `(group, device)`.
    pub fn store_sender_key(
        group_id: &str,
        device_id: &str,
        key: &[u8; 32],
    ) -> Result<(), KeystoreError> {
        let entry = Self::entry(&Self::sender_account(group_id, device_id))?;
        entry.set_password(&hex::encode(key))?;
        Ok(())
    }

    /// Load a sender key, `None` if absent.
    pub fn load_sender_key(
        group_id: &str,
        device_id: &str,
    ) -> Result<Option<[u8; 32]>, KeystoreError> {
        let entry = Self::entry(&Self::sender_account(group_id, device_id))?;
        match entry.get_password() {
            Ok(stored) => {
                let bytes = hex::decode(&stored).map_err(|_| KeystoreError::Corrupt)?;
                let key: [u8; 32] = bytes.try_into().map_err(|_| KeystoreError::Corrupt)?;
                Ok(Some(key))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a sender key. Required before encrypting anything after a
    /// member departs.
    pub fn delete_sender_key(group_id: &str, device_id: &str) -> Result<(), KeystoreError> {
        let entry = Self::entry(&Self::sender_account(group_id, device_id))?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
