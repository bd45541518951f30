//! Identity certificates and the party types built from them.

use crate::{IdentityError, KeyPair, PublicKey, Result, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;
use tally_types::{canonical_bytes, PartyName};

/// Domain separator mixed into every certificate signature.
const CERTIFICATE_DOMAIN: &[u8] = b"_TALLY_CERT";

/// A single link in a certificate chain: `issuer_key` vouches that
/// `subject_key` speaks for `subject`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCertificate {
    /// The legal name the key acts for.
    pub subject: PartyName,
    /// The certified key.
    pub subject_key: PublicKey,
    /// The key that issued this certificate.
    pub issuer_key: PublicKey,
    /// Signature by `issuer_key` over the certificate body.
    pub signature: Signature,
}

#[derive(Serialize)]
struct CertificateBody<'a> {
    subject: &'a PartyName,
    subject_key: &'a PublicKey,
    issuer_key: &'a PublicKey,
}

impl IdentityCertificate {
    /// Issues a certificate for `subject_key`, signed by `issuer`.
    pub fn issue(subject: PartyName, subject_key: PublicKey, issuer: &KeyPair) -> Result<Self> {
        let issuer_key = issuer.public_key();
        let body = Self::body_bytes(&subject, &subject_key, &issuer_key)?;
        Ok(Self {
            signature: issuer.sign(&body),
            subject,
            subject_key,
            issuer_key,
        })
    }

    /// Returns true if the certificate is signed by its own subject key.
    pub fn is_self_signed(&self) -> bool {
        self.subject_key == self.issuer_key
    }

    /// Verifies the issuer signature.
    pub fn verify(&self) -> Result<()> {
        let body = Self::body_bytes(&self.subject, &self.subject_key, &self.issuer_key)?;
        self.issuer_key.verify(&body, &self.signature)
    }

    fn body_bytes(
        subject: &PartyName,
        subject_key: &PublicKey,
        issuer_key: &PublicKey,
    ) -> Result<Vec<u8>> {
        let mut bytes = CERTIFICATE_DOMAIN.to_vec();
        bytes.extend(canonical_bytes(&CertificateBody {
            subject,
            subject_key,
            issuer_key,
        })?);
        Ok(bytes)
    }
}

/// A key bound to a legal name through a certificate chain.
///
/// `chain[0]` certifies `owning_key`; each following link certifies the
/// issuer of the previous one; the final link is self-signed and is the
/// chain's root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyAndCertificate {
    name: PartyName,
    owning_key: PublicKey,
    chain: Vec<IdentityCertificate>,
}

impl PartyAndCertificate {
    /// Creates a well-known identity certified by its own key.
    pub fn self_signed(name: PartyName, keypair: &KeyPair) -> Result<Self> {
        let owning_key = keypair.public_key();
        let certificate = IdentityCertificate::issue(name.clone(), owning_key, keypair)?;
        Ok(Self {
            name,
            owning_key,
            chain: vec![certificate],
        })
    }

    /// Issues a confidential identity for `fresh_key`, anchored to this identity.
    ///
    /// `issuer` must be the keypair for this identity's owning key.
    pub fn issue_confidential(&self, fresh_key: PublicKey, issuer: &KeyPair) -> Result<Self> {
        if issuer.public_key() != self.owning_key {
            return Err(IdentityError::UnknownKey(issuer.public_key().short_id()));
        }
        let leaf = IdentityCertificate::issue(self.name.clone(), fresh_key, issuer)?;
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(leaf);
        chain.extend(self.chain.iter().cloned());
        Ok(Self {
            name: self.name.clone(),
            owning_key: fresh_key,
            chain,
        })
    }

    /// The legal name.
    pub fn name(&self) -> &PartyName {
        &self.name
    }

    /// The certified key.
    pub fn owning_key(&self) -> &PublicKey {
        &self.owning_key
    }

    /// The certificate chain, leaf first.
    pub fn chain(&self) -> &[IdentityCertificate] {
        &self.chain
    }

    /// Validates every link and returns the root key.
    pub fn verify_chain(&self) -> Result<PublicKey> {
        let leaf = self
            .chain
            .first()
            .ok_or_else(|| IdentityError::UntrustedCertificate("empty chain".into()))?;
        if leaf.subject_key != self.owning_key {
            return Err(IdentityError::UntrustedCertificate(
                "leaf does not certify the owning key".into(),
            ));
        }
        for (index, link) in self.chain.iter().enumerate() {
            if link.subject != self.name {
                return Err(IdentityError::UntrustedCertificate(format!(
                    "link {} names {} instead of {}",
                    index, link.subject, self.name
                )));
            }
            link.verify().map_err(|_| {
                IdentityError::UntrustedCertificate(format!("bad signature on link {}", index))
            })?;
            if let Some(next) = self.chain.get(index + 1) {
                if next.subject_key != link.issuer_key {
                    return Err(IdentityError::UntrustedCertificate(format!(
                        "link {} is not issued by link {}",
                        index,
                        index + 1
                    )));
                }
            } else if !link.is_self_signed() {
                return Err(IdentityError::UntrustedCertificate(
                    "chain does not end in a self-signed root".into(),
                ));
            }
        }
        Ok(self.chain[self.chain.len() - 1].subject_key)
    }

    /// The canonical bytes of this identity, as signed during identity exchange.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(canonical_bytes(self)?)
    }

    /// The named party this identity represents.
    pub fn party(&self) -> Party {
        Party {
            name: self.name.clone(),
            owning_key: self.owning_key,
        }
    }

    /// The identity stripped of its name.
    pub fn anonymise(&self) -> AnonymousParty {
        AnonymousParty {
            owning_key: self.owning_key,
        }
    }
}

/// A named participant and its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Party {
    /// Legal name.
    pub name: PartyName,
    /// Owning key.
    pub owning_key: PublicKey,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A participant known only by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnonymousParty {
    /// Owning key.
    pub owning_key: PublicKey,
}

impl fmt::Display for AnonymousParty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Anonymous({})", self.owning_key.short_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> PartyName {
        PartyName::new(s).unwrap()
    }

    #[test]
    fn test_self_signed_chain() {
        let keypair = KeyPair::generate();
        let identity = PartyAndCertificate::self_signed(name("O=Alice"), &keypair).unwrap();
        assert_eq!(identity.verify_chain().unwrap(), keypair.public_key());
    }

    #[test]
    fn test_confidential_chain_roots_at_legal_key() {
        let legal = KeyPair::generate();
        let identity = PartyAndCertificate::self_signed(name("O=Alice"), &legal).unwrap();
        let fresh = KeyPair::generate();
        let confidential = identity
            .issue_confidential(fresh.public_key(), &legal)
            .unwrap();

        assert_eq!(confidential.owning_key(), &fresh.public_key());
        assert_eq!(confidential.chain().len(), 2);
        assert_eq!(confidential.verify_chain().unwrap(), legal.public_key());
    }

    #[test]
    fn test_issue_with_wrong_key_rejected() {
        let legal = KeyPair::generate();
        let identity = PartyAndCertificate::self_signed(name("O=Alice"), &legal).unwrap();
        let stranger = KeyPair::generate();
        assert!(identity
            .issue_confidential(KeyPair::generate().public_key(), &stranger)
            .is_err());
    }

    #[test]
    fn test_tampered_subject_rejected() {
        let legal = KeyPair::generate();
        let identity = PartyAndCertificate::self_signed(name("O=Alice"), &legal).unwrap();
        let mut confidential = identity
            .issue_confidential(KeyPair::generate().public_key(), &legal)
            .unwrap();
        confidential.chain[0].subject = name("O=Mallory");
        confidential.name = name("O=Mallory");
        assert!(matches!(
            confidential.verify_chain(),
            Err(IdentityError::UntrustedCertificate(_))
        ));
    }

    #[test]
    fn test_serialize_is_deterministic() {
        let legal = KeyPair::generate();
        let identity = PartyAndCertificate::self_signed(name("O=Alice"), &legal).unwrap();
        assert_eq!(identity.serialize().unwrap(), identity.clone().serialize().unwrap());
    }
}
