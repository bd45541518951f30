//! Node services available to flows.

use std::sync::Arc;
use tally_identity::{IdentityService, KeyManagementService, Party};
use tally_notary::UniquenessProvider;
use tally_storage::RecordStore;
use tally_types::{Attachment, Clock, PartyName, WireTransaction};

/// Everything a flow may touch besides its sessions.
#[derive(Clone)]
pub struct ServiceHub {
    /// Private keys of this node.
    pub keys: Arc<KeyManagementService>,
    /// Directory of known identities.
    pub identities: Arc<IdentityService>,
    /// Local attachment cache.
    pub attachments: Arc<dyn RecordStore<Attachment>>,
    /// Local transaction cache.
    pub transactions: Arc<dyn RecordStore<WireTransaction>>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// The uniqueness provider, if this node is a notary.
    pub uniqueness: Option<Arc<dyn UniquenessProvider>>,
}

impl ServiceHub {
    /// This node's legal identity.
    pub fn our_identity(&self) -> Party {
        self.keys.legal_identity().party()
    }

    /// This node's legal name.
    pub fn our_name(&self) -> &PartyName {
        self.keys.legal_identity().name()
    }

    /// Returns true if this node hosts the uniqueness provider.
    pub fn is_notary(&self) -> bool {
        self.uniqueness.is_some()
    }
}

impl std::fmt::Debug for ServiceHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHub")
            .field("identity", self.our_name())
            .field("notary", &self.is_notary())
            .finish_non_exhaustive()
    }
}
