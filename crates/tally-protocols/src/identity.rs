//! Confidential identity exchange.
//!
//! Each side mints a fresh key certified by its legal identity and proves
//! possession of it by signing `serialize(identity) ++ peer_nonce`. The nonce
//! comes from the counterparty, so a signed claim cannot be replayed into
//! another exchange.
//!
//! ```text
//! initiator                              responder
//!     | ---------- nonce_i -------------> |
//!     | <--------- nonce_r -------------- |
//!     | -- identity_i, sig(id_i||nonce_r) -> |  verify, register
//!     | <- identity_r, sig(id_r||nonce_i) -- |
//!   verify, register
//! ```

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tally_flow::{FlowContext, FlowError, FlowLogic, FlowResult, Received, SessionRef, Step};
use tally_identity::{
    AnonymousParty, DigitalSignatureWithKey, IdentityService, PartyAndCertificate, Signature,
};
use tally_types::{PartyName, SerializedBytes};

/// Length of an exchange nonce.
pub const NONCE_SIZE_BYTES: usize = 16;

/// The fresh identities produced by an exchange, keyed by legal name.
pub type ConfidentialIdentities = BTreeMap<PartyName, AnonymousParty>;

/// A confidential identity and the proof that its owner holds the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityWithSignature {
    /// The canonical bytes of a [`PartyAndCertificate`].
    pub identity: SerializedBytes,
    /// Signature by the identity's key over the identity bytes and the peer's nonce.
    pub signature: Signature,
}

/// Rejects nonces of the wrong length and the all-zero nonce.
pub fn validate_nonce(nonce: &[u8]) -> FlowResult<()> {
    if nonce.len() != NONCE_SIZE_BYTES {
        return Err(FlowError::Validation(format!(
            "nonce must be {} bytes, got {}",
            NONCE_SIZE_BYTES,
            nonce.len()
        )));
    }
    if nonce.iter().all(|b| *b == 0) {
        return Err(FlowError::Validation("nonce must not be all zeroes".into()));
    }
    Ok(())
}

/// The payload a party signs to claim its confidential identity.
pub fn build_data_to_sign(identity: &SerializedBytes, nonce: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(identity.bytes().len() + nonce.len());
    data.extend_from_slice(identity.bytes());
    data.extend_from_slice(nonce);
    data
}

/// Checks a counterparty's claimed identity and registers it.
///
/// The certificate subject must be `other_side`, the signature must verify
/// against the certified key over the identity bytes and `our_nonce`, and the
/// chain must root at `other_side`'s well-known key.
pub fn validate_and_register_identity(
    identities: &IdentityService,
    other_side: &PartyName,
    claim: &IdentityWithSignature,
    our_nonce: &[u8],
) -> FlowResult<PartyAndCertificate> {
    let identity: PartyAndCertificate = claim.identity.deserialize().map_err(|e| {
        FlowError::Validation(format!("malformed identity from {}: {}", other_side, e))
    })?;
    if identity.name() != other_side {
        return Err(FlowError::Validation(format!(
            "certificate subject {} does not match counterparty {}",
            identity.name(),
            other_side
        )));
    }
    let signature = DigitalSignatureWithKey {
        by: *identity.owning_key(),
        bytes: claim.signature,
    };
    signature
        .verify(&build_data_to_sign(&claim.identity, our_nonce))
        .map_err(|_| {
            FlowError::Validation("signature does not match the given identity and nonce".into())
        })?;
    identities
        .verify_and_register(&identity)
        .map_err(|e| FlowError::Validation(e.to_string()))?;
    Ok(identity)
}

/// Mints a confidential identity and records it in our own identity service,
/// so the fresh key resolves locally to our legal identity.
fn mint_identity(ctx: &FlowContext<'_>) -> FlowResult<PartyAndCertificate> {
    let identity = ctx.services().keys.fresh_key_and_cert()?;
    ctx.services().identities.verify_and_register(&identity)?;
    Ok(identity)
}

fn fresh_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_SIZE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn claim_for(
    ctx: &FlowContext<'_>,
    identity: &SerializedBytes,
    key: &PartyAndCertificate,
    peer_nonce: &[u8],
) -> FlowResult<IdentityWithSignature> {
    let signature = ctx
        .services()
        .keys
        .sign(&build_data_to_sign(identity, peer_nonce), key.owning_key())?;
    Ok(IdentityWithSignature {
        identity: identity.clone(),
        signature: signature.bytes,
    })
}

/// Exchanges fresh confidential identities with `other_party`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapIdentitiesFlow {
    other_party: PartyName,
}

impl SwapIdentitiesFlow {
    /// Creates the flow.
    pub fn new(other_party: PartyName) -> Self {
        Self { other_party }
    }
}

/// Suspension points of [`SwapIdentitiesFlow`].
#[derive(Debug, Serialize, Deserialize)]
pub enum SwapState {
    /// Our nonce is out; waiting for theirs.
    AwaitingNonce {
        /// Session with the counterparty.
        session: SessionRef,
        /// Our fresh identity.
        identity: PartyAndCertificate,
        /// Nonce we sent.
        our_nonce: Vec<u8>,
    },
    /// Our signed identity is out; waiting for theirs.
    AwaitingIdentity {
        /// Session with the counterparty.
        session: SessionRef,
        /// Our fresh identity.
        identity: PartyAndCertificate,
        /// Nonce we sent.
        our_nonce: Vec<u8>,
    },
}

impl FlowLogic for SwapIdentitiesFlow {
    const NAME: &'static str = "tally.identity.swap";
    type State = SwapState;
    type Output = ConfidentialIdentities;

    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<Step<SwapState, ConfidentialIdentities>> {
        let identity = mint_identity(ctx)?;

        if ctx.services().our_name() == &self.other_party {
            tracing::debug!(party = %self.other_party, "Identity swap with self; no session");
            let mut identities = ConfidentialIdentities::new();
            identities.insert(self.other_party.clone(), identity.anonymise());
            return Ok(Step::Done(identities));
        }

        let session = ctx.initiate_flow(&self.other_party);
        let our_nonce = fresh_nonce();
        ctx.send_and_receive(
            session,
            &our_nonce,
            SwapState::AwaitingNonce {
                session,
                identity,
                our_nonce: our_nonce.clone(),
            },
        )
    }

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        state: SwapState,
        received: Received,
    ) -> FlowResult<Step<SwapState, ConfidentialIdentities>> {
        match state {
            SwapState::AwaitingNonce {
                session,
                identity,
                our_nonce,
            } => {
                let their_nonce: Vec<u8> = received.decode()?;
                validate_nonce(&their_nonce)?;
                let serialized = SerializedBytes::from_vec(identity.serialize()?);
                let claim = claim_for(ctx, &serialized, &identity, &their_nonce)?;
                ctx.send_and_receive(
                    session,
                    &claim,
                    SwapState::AwaitingIdentity {
                        session,
                        identity,
                        our_nonce,
                    },
                )
            }
            SwapState::AwaitingIdentity {
                identity,
                our_nonce,
                ..
            } => {
                let claim: IdentityWithSignature = received.decode()?;
                let theirs = validate_and_register_identity(
                    &ctx.services().identities,
                    &self.other_party,
                    &claim,
                    &our_nonce,
                )?;
                tracing::info!(
                    counterparty = %self.other_party,
                    key = %theirs.owning_key().short_id(),
                    "Confidential identities exchanged"
                );
                let mut identities = ConfidentialIdentities::new();
                identities.insert(ctx.services().our_name().clone(), identity.anonymise());
                identities.insert(self.other_party.clone(), theirs.anonymise());
                Ok(Step::Done(identities))
            }
        }
    }
}

/// Responder side of [`SwapIdentitiesFlow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapIdentitiesHandler {
    other_side: PartyName,
}

impl SwapIdentitiesHandler {
    /// Creates the responder for a session opened by `other_side`.
    pub fn new(other_side: PartyName) -> Self {
        Self { other_side }
    }
}

/// Suspension points of [`SwapIdentitiesHandler`].
#[derive(Debug, Serialize, Deserialize)]
pub enum SwapHandlerState {
    /// Waiting for the initiator's nonce.
    AwaitingNonce {
        /// The initiating session.
        session: SessionRef,
    },
    /// Our nonce is out; waiting for the initiator's signed identity.
    AwaitingIdentity {
        /// The initiating session.
        session: SessionRef,
        /// Our fresh identity.
        identity: PartyAndCertificate,
        /// Nonce we sent.
        our_nonce: Vec<u8>,
        /// Nonce the initiator sent.
        their_nonce: Vec<u8>,
    },
}

impl FlowLogic for SwapIdentitiesHandler {
    const NAME: &'static str = "tally.identity.swap-handler";
    type State = SwapHandlerState;
    type Output = ConfidentialIdentities;

    fn start(
        &self,
        ctx: &mut FlowContext<'_>,
    ) -> FlowResult<Step<SwapHandlerState, ConfidentialIdentities>> {
        let session = ctx.initiating_session()?;
        ctx.receive(session, SwapHandlerState::AwaitingNonce { session })
    }

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        state: SwapHandlerState,
        received: Received,
    ) -> FlowResult<Step<SwapHandlerState, ConfidentialIdentities>> {
        match state {
            SwapHandlerState::AwaitingNonce { session } => {
                let their_nonce: Vec<u8> = received.decode()?;
                validate_nonce(&their_nonce)?;
                let identity = mint_identity(ctx)?;
                let our_nonce = fresh_nonce();
                ctx.send_and_receive(
                    session,
                    &our_nonce,
                    SwapHandlerState::AwaitingIdentity {
                        session,
                        identity,
                        our_nonce: our_nonce.clone(),
                        their_nonce,
                    },
                )
            }
            SwapHandlerState::AwaitingIdentity {
                session,
                identity,
                our_nonce,
                their_nonce,
            } => {
                let claim: IdentityWithSignature = received.decode()?;
                let theirs = validate_and_register_identity(
                    &ctx.services().identities,
                    &self.other_side,
                    &claim,
                    &our_nonce,
                )?;
                let serialized = SerializedBytes::from_vec(identity.serialize()?);
                let ours = claim_for(ctx, &serialized, &identity, &their_nonce)?;
                ctx.send(session, &ours)?;

                let mut identities = ConfidentialIdentities::new();
                identities.insert(ctx.services().our_name().clone(), identity.anonymise());
                identities.insert(self.other_side.clone(), theirs.anonymise());
                Ok(Step::Done(identities))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_identity::{KeyManagementService, KeyPair};

    fn node(name: &str) -> KeyManagementService {
        KeyManagementService::new(PartyName::new(name).unwrap(), KeyPair::generate()).unwrap()
    }

    fn directory_with(kms: &KeyManagementService) -> IdentityService {
        let directory = IdentityService::new();
        directory
            .register_well_known(kms.legal_identity().clone())
            .unwrap();
        directory
    }

    fn nonce(seed: u8) -> Vec<u8> {
        (0..NONCE_SIZE_BYTES as u8).map(|i| i ^ seed).collect()
    }

    fn signed_claim(kms: &KeyManagementService, nonce: &[u8]) -> (PartyAndCertificate, IdentityWithSignature) {
        let identity = kms.fresh_key_and_cert().unwrap();
        let serialized = SerializedBytes::from_vec(identity.serialize().unwrap());
        let signature = kms
            .sign(&build_data_to_sign(&serialized, nonce), identity.owning_key())
            .unwrap();
        (
            identity,
            IdentityWithSignature {
                identity: serialized,
                signature: signature.bytes,
            },
        )
    }

    #[test]
    fn test_nonce_validation() {
        assert!(validate_nonce(&nonce(0x5a)).is_ok());
        assert!(matches!(
            validate_nonce(&[1u8; NONCE_SIZE_BYTES - 1]),
            Err(FlowError::Validation(_))
        ));
        assert!(matches!(
            validate_nonce(&[1u8; NONCE_SIZE_BYTES + 1]),
            Err(FlowError::Validation(_))
        ));
        assert!(matches!(
            validate_nonce(&[0u8; NONCE_SIZE_BYTES]),
            Err(FlowError::Validation(msg)) if msg.contains("zero")
        ));
    }

    #[test]
    fn test_data_to_sign_is_identity_then_nonce() {
        let identity = SerializedBytes::from_vec(vec![1, 2, 3]);
        assert_eq!(build_data_to_sign(&identity, &[9, 8]), vec![1, 2, 3, 9, 8]);
    }

    #[test]
    fn test_valid_claim_is_registered() {
        let bob = node("O=Bob");
        let directory = directory_with(&bob);
        let our_nonce = nonce(0x11);
        let (identity, claim) = signed_claim(&bob, &our_nonce);

        let registered =
            validate_and_register_identity(&directory, bob.legal_identity().name(), &claim, &our_nonce)
                .unwrap();
        assert_eq!(registered, identity);
        assert_eq!(
            directory.well_known_party_for(identity.owning_key()),
            Some(bob.legal_identity().party())
        );
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let bob = node("O=Bob");
        let directory = directory_with(&bob);
        let (identity, claim) = signed_claim(&bob, &nonce(0x11));

        let result =
            validate_and_register_identity(&directory, bob.legal_identity().name(), &claim, &nonce(0x22));
        assert!(matches!(result, Err(FlowError::Validation(_))));
        assert!(directory.well_known_party_for(identity.owning_key()).is_none());
    }

    #[test]
    fn test_reordered_payload_fails() {
        let bob = node("O=Bob");
        let directory = directory_with(&bob);
        let our_nonce = nonce(0x11);
        let identity = bob.fresh_key_and_cert().unwrap();
        let serialized = SerializedBytes::from_vec(identity.serialize().unwrap());

        let mut reordered = our_nonce.clone();
        reordered.extend_from_slice(serialized.bytes());
        let signature = bob.sign(&reordered, identity.owning_key()).unwrap();
        let claim = IdentityWithSignature {
            identity: serialized,
            signature: signature.bytes,
        };

        let result =
            validate_and_register_identity(&directory, bob.legal_identity().name(), &claim, &our_nonce);
        assert!(matches!(result, Err(FlowError::Validation(_))));
    }

    #[test]
    fn test_subject_must_match_counterparty() {
        let bob = node("O=Bob");
        let mallory = node("O=Mallory");
        let directory = directory_with(&bob);
        let our_nonce = nonce(0x11);
        let (_, claim) = signed_claim(&mallory, &our_nonce);

        let result =
            validate_and_register_identity(&directory, bob.legal_identity().name(), &claim, &our_nonce);
        assert!(matches!(result, Err(FlowError::Validation(msg)) if msg.contains("subject")));
    }

    #[test]
    fn test_chain_must_root_at_well_known_key() {
        // Same legal name, different key: the chain does not root at the
        // registered identity.
        let bob = node("O=Bob");
        let impostor = node("O=Bob");
        let directory = directory_with(&bob);
        let our_nonce = nonce(0x11);
        let (_, claim) = signed_claim(&impostor, &our_nonce);

        let result =
            validate_and_register_identity(&directory, bob.legal_identity().name(), &claim, &our_nonce);
        assert!(matches!(result, Err(FlowError::Validation(_))));
    }
}
