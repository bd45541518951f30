//! # Tally Protocols
//!
//! Application protocols built on the flow engine:
//!
//! - [`SwapIdentitiesFlow`]: two parties exchange fresh confidential identities;
//! - [`FetchDataFlow`]: batch download of attachments or transactions with
//!   integrity checking;
//! - [`NotaryClientFlow`] / [`NotaryServiceFlow`]: notarisation against the
//!   uniqueness provider.
//!
//! [`register_all`] installs every initiator and responder in a
//! [`FlowRegistry`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod fetch;
mod identity;
mod notary;

pub use fetch::{
    AttachmentKind, FetchAttachmentsFlow, FetchDataFlow, FetchDataHandler, FetchKind,
    FetchRequest, FetchResult, FetchState, FetchTransactionsFlow, TransactionKind,
};
pub use identity::{
    build_data_to_sign, validate_and_register_identity, validate_nonce, ConfidentialIdentities,
    IdentityWithSignature, SwapHandlerState, SwapIdentitiesFlow, SwapIdentitiesHandler, SwapState,
    NONCE_SIZE_BYTES,
};
pub use notary::{
    notarisation_payload, NotarisableTransaction, NotarisationResponse, NotaryClientFlow,
    NotaryClientState, NotaryError, NotaryServiceFlow,
};

use tally_flow::FlowRegistry;

/// Registers the protocols every node runs.
pub fn register_all(registry: &mut FlowRegistry) -> &mut FlowRegistry {
    registry
        .register_responder::<SwapIdentitiesFlow, SwapIdentitiesHandler>(|party| {
            SwapIdentitiesHandler::new(party.clone())
        })
        .register_responder::<FetchDataFlow<AttachmentKind>, FetchDataHandler<AttachmentKind>>(
            |party| FetchDataHandler::new(party.clone()),
        )
        .register_responder::<FetchDataFlow<TransactionKind>, FetchDataHandler<TransactionKind>>(
            |party| FetchDataHandler::new(party.clone()),
        )
        .register::<NotaryClientFlow>()
}

/// Registers the notary service. Only notary nodes answer notarisation sessions.
pub fn register_notary_service(registry: &mut FlowRegistry) -> &mut FlowRegistry {
    registry.register_responder::<NotaryClientFlow, NotaryServiceFlow>(|party| {
        NotaryServiceFlow::new(party.clone())
    })
}
