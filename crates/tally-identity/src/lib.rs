//! # Tally Identity
//!
//! Ed25519 keys, signatures and the certificate model used to bind keys to
//! legal identities.
//!
//! A node owns one long-term *well-known* identity. It may additionally mint
//! any number of *confidential* identities: fresh keys whose certificate is
//! issued by the well-known key, so a counterparty holding the chain can map
//! the pseudonym back to the legal entity while outsiders cannot.
//!
//! ## Example
//!
//! ```rust
//! use tally_identity::{IdentityService, KeyManagementService, KeyPair};
//! use tally_types::PartyName;
//!
//! let name = PartyName::new("O=Alice").unwrap();
//! let kms = KeyManagementService::new(name, KeyPair::generate()).unwrap();
//! let identities = IdentityService::new();
//! identities.register_well_known(kms.legal_identity().clone()).unwrap();
//!
//! let confidential = kms.fresh_key_and_cert().unwrap();
//! let party = identities.verify_and_register(&confidential).unwrap();
//! assert_eq!(party.name, *kms.legal_identity().name());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod certificate;
mod error;
mod keys;
mod kms;
mod service;

pub use certificate::{AnonymousParty, IdentityCertificate, Party, PartyAndCertificate};
pub use error::{IdentityError, Result};
pub use keys::{DigitalSignatureWithKey, KeyPair, PublicKey, Signature};
pub use kms::KeyManagementService;
pub use service::IdentityService;
