//! Ed25519 key pairs, public keys and signatures.

use crate::{IdentityError, Result};
use ed25519_consensus::{SigningKey, VerificationKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An Ed25519 keypair for signing.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generates a new random keypair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::new(OsRng),
        }
    }

    /// Creates a keypair from a 32-byte secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is not 32 bytes long.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidSecretKey)?;
        Ok(Self {
            signing_key: SigningKey::from(secret),
        })
    }

    /// Decodes a keypair from a hex-encoded secret.
    pub fn from_secret_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|_| IdentityError::InvalidSecretKey)?;
        Self::from_secret_bytes(&bytes)
    }

    /// Returns the secret bytes.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Returns the public key for this keypair.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verification_key().to_bytes())
    }

    /// Signs a message.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// An Ed25519 public key.
///
/// Always holds a valid curve point; construction from bytes is checked.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// The length of a public key in bytes.
    pub const LEN: usize = 32;

    /// Creates a public key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not represent a valid public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            IdentityError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                Self::LEN,
                bytes.len()
            ))
        })?;
        VerificationKey::try_from(arr)
            .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
        Ok(Self(arr))
    }

    /// Decodes a hex-encoded public key.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Returns the raw bytes of this public key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns a short identifier (first 8 bytes as hex).
    #[must_use]
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Verifies a signature against a message.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidSignature`] if the signature does not verify.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = VerificationKey::try_from(self.0)
            .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
        let sig = ed25519_consensus::Signature::from(signature.0);
        key.verify(&sig, message)
            .map_err(|_| IdentityError::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short_id())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// The length of a signature in bytes.
    pub const LEN: usize = 64;

    /// Creates a signature from raw bytes.
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 64];
        hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// A signature together with the key that made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignatureWithKey {
    /// The signing key.
    pub by: PublicKey,
    /// The signature bytes.
    pub bytes: Signature,
}

impl DigitalSignatureWithKey {
    /// Verifies the signature over `message` against the embedded key.
    pub fn verify(&self, message: &[u8]) -> Result<()> {
        self.by.verify(message, &self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"payload");
        assert!(keypair.public_key().verify(b"payload", &signature).is_ok());
        assert!(matches!(
            keypair.public_key().verify(b"other", &signature),
            Err(IdentityError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = KeyPair::generate();
        let other = KeyPair::generate();
        let signature = signer.sign(b"payload");
        assert!(other.public_key().verify(b"payload", &signature).is_err());
    }

    #[test]
    fn test_keypair_from_secret() {
        let keypair = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&keypair.secret_bytes()).unwrap();
        assert_eq!(restored.public_key(), keypair.public_key());
        assert!(KeyPair::from_secret_bytes(&[1u8; 31]).is_err());
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let key = KeyPair::generate().public_key();
        let json = serde_json::to_string(&key).unwrap();
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(PublicKey::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_signature_with_key() {
        let keypair = KeyPair::generate();
        let signed = DigitalSignatureWithKey {
            by: keypair.public_key(),
            bytes: keypair.sign(b"tx"),
        };
        let json = serde_json::to_string(&signed).unwrap();
        let back: DigitalSignatureWithKey = serde_json::from_str(&json).unwrap();
        assert!(back.verify(b"tx").is_ok());
    }
}
