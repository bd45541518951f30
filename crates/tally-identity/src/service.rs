//! The identity directory.

use crate::{IdentityError, Party, PartyAndCertificate, PublicKey, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use tally_types::PartyName;

/// Maps keys and names to the legal identities behind them.
///
/// Well-known identities are registered out of band (network map). Confidential
/// identities are registered only after their chain is proven to root at the
/// well-known key of the legal name they claim.
#[derive(Debug, Default)]
pub struct IdentityService {
    well_known: RwLock<HashMap<PartyName, PartyAndCertificate>>,
    by_key: RwLock<HashMap<PublicKey, PartyAndCertificate>>,
}

impl IdentityService {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a well-known identity. Its chain must be a single self-signed link.
    pub fn register_well_known(&self, identity: PartyAndCertificate) -> Result<()> {
        let root = identity.verify_chain()?;
        if root != *identity.owning_key() {
            return Err(IdentityError::UntrustedCertificate(
                "well-known identity must be self-certified".into(),
            ));
        }
        tracing::debug!(party = %identity.name(), "Registered well-known identity");
        self.by_key
            .write()
            .insert(*identity.owning_key(), identity.clone());
        self.well_known
            .write()
            .insert(identity.name().clone(), identity);
        Ok(())
    }

    /// Validates a confidential identity and records the key to legal identity mapping.
    ///
    /// Returns the well-known party the identity resolves to.
    pub fn verify_and_register(&self, identity: &PartyAndCertificate) -> Result<Party> {
        let root = identity.verify_chain()?;
        let well_known = self
            .party_from_name(identity.name())
            .ok_or_else(|| IdentityError::UnknownParty(identity.name().clone()))?;
        if root != well_known.owning_key {
            return Err(IdentityError::UntrustedCertificate(format!(
                "chain for {} is not rooted at its well-known key",
                identity.name()
            )));
        }
        self.by_key
            .write()
            .insert(*identity.owning_key(), identity.clone());
        tracing::debug!(
            party = %identity.name(),
            key = %identity.owning_key().short_id(),
            "Registered confidential identity"
        );
        Ok(well_known)
    }

    /// Resolves a key, confidential or not, to its well-known party.
    pub fn well_known_party_for(&self, key: &PublicKey) -> Option<Party> {
        let name = self.by_key.read().get(key)?.name().clone();
        self.party_from_name(&name)
    }

    /// Looks up a well-known party by name.
    pub fn party_from_name(&self, name: &PartyName) -> Option<Party> {
        self.well_known.read().get(name).map(PartyAndCertificate::party)
    }

    /// Returns the certificate registered for `key`.
    pub fn certificate_for_key(&self, key: &PublicKey) -> Option<PartyAndCertificate> {
        self.by_key.read().get(key).cloned()
    }

    /// All well-known parties, sorted by name.
    pub fn well_known_parties(&self) -> Vec<Party> {
        let mut parties: Vec<Party> = self
            .well_known
            .read()
            .values()
            .map(PartyAndCertificate::party)
            .collect();
        parties.sort_by(|a, b| a.name.cmp(&b.name));
        parties
    }
}
