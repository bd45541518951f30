//! Private key custody.

use crate::{DigitalSignatureWithKey, IdentityError, KeyPair, PartyAndCertificate, PublicKey, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use tally_types::PartyName;

/// Holds the node's legal key and every confidential key it has minted.
#[derive(Debug)]
pub struct KeyManagementService {
    legal_identity: PartyAndCertificate,
    keys: RwLock<HashMap<PublicKey, KeyPair>>,
}

impl KeyManagementService {
    /// Creates a key store around the node's legal keypair.
    pub fn new(name: PartyName, legal_key: KeyPair) -> Result<Self> {
        let legal_identity = PartyAndCertificate::self_signed(name, &legal_key)?;
        let mut keys = HashMap::new();
        keys.insert(legal_key.public_key(), legal_key);
        Ok(Self {
            legal_identity,
            keys: RwLock::new(keys),
        })
    }

    /// The node's well-known identity.
    pub fn legal_identity(&self) -> &PartyAndCertificate {
        &self.legal_identity
    }

    /// Generates a fresh key and a certificate for it issued by the legal key.
    pub fn fresh_key_and_cert(&self) -> Result<PartyAndCertificate> {
        let fresh = KeyPair::generate();
        let legal_key = *self.legal_identity.owning_key();
        let mut keys = self.keys.write();
        let issuer = keys
            .get(&legal_key)
            .ok_or_else(|| IdentityError::UnknownKey(legal_key.short_id()))?;
        let identity = self
            .legal_identity
            .issue_confidential(fresh.public_key(), issuer)?;
        tracing::debug!(
            party = %self.legal_identity.name(),
            key = %fresh.public_key().short_id(),
            "Minted confidential identity"
        );
        keys.insert(fresh.public_key(), fresh);
        Ok(identity)
    }

    /// Signs `data` with the private key for `key`.
    pub fn sign(&self, data: &[u8], key: &PublicKey) -> Result<DigitalSignatureWithKey> {
        let keys = self.keys.read();
        let keypair = keys
            .get(key)
            .ok_or_else(|| IdentityError::UnknownKey(key.short_id()))?;
        Ok(DigitalSignatureWithKey {
            by: *key,
            bytes: keypair.sign(data),
        })
    }

    /// Signs `data` with the legal key.
    pub fn sign_as_legal(&self, data: &[u8]) -> Result<DigitalSignatureWithKey> {
        self.sign(data, self.legal_identity.owning_key())
    }

    /// Returns true if this node holds the private key for `key`.
    pub fn owns(&self, key: &PublicKey) -> bool {
        self.keys.read().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kms() -> KeyManagementService {
        KeyManagementService::new(PartyName::new("O=Alice").unwrap(), KeyPair::generate()).unwrap()
    }

    #[test]
    fn test_fresh_keys_are_distinct_and_owned() {
        let kms = kms();
        let a = kms.fresh_key_and_cert().unwrap();
        let b = kms.fresh_key_and_cert().unwrap();
        assert_ne!(a.owning_key(), b.owning_key());
        assert!(kms.owns(a.owning_key()));
        assert!(kms.owns(b.owning_key()));
    }

    #[test]
    fn test_sign_with_fresh_key() {
        let kms = kms();
        let fresh = kms.fresh_key_and_cert().unwrap();
        let signed = kms.sign(b"data", fresh.owning_key()).unwrap();
        assert!(signed.verify(b"data").is_ok());
    }

    #[test]
    fn test_sign_with_unknown_key_fails() {
        let kms = kms();
        let foreign = KeyPair::generate().public_key();
        assert!(matches!(
            kms.sign(b"data", &foreign),
            Err(IdentityError::UnknownKey(_))
        ));
    }
}
