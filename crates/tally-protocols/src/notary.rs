//! Notarisation flows.
//!
//! The notary is non-validating: it checks that the transaction is addressed
//! to it and that its id matches its content, then asks the uniqueness
//! provider to bind the inputs. On success it signs the transaction id.

use serde::{Deserialize, Serialize};
use tally_flow::{FlowContext, FlowError, FlowLogic, FlowResult, Received, ServiceHub, SessionRef, Step};
use tally_identity::DigitalSignatureWithKey;
use tally_notary::{CommitOutcome, CommitRequest, Conflict};
use tally_types::{PartyName, TimeWindow, Timestamp, TransactionId, WireTransaction, NAMESPACE};

const NOTARISATION_DOMAIN: &[u8] = b"_NOTARISE";

/// The bytes a notary signs to attest that a transaction's inputs are consumed by it.
pub fn notarisation_payload(id: &TransactionId) -> Vec<u8> {
    let mut payload = Vec::with_capacity(NAMESPACE.len() + NOTARISATION_DOMAIN.len() + 32);
    payload.extend_from_slice(NAMESPACE);
    payload.extend_from_slice(NOTARISATION_DOMAIN);
    payload.extend_from_slice(id.as_bytes());
    payload
}

/// What a client sends to the notary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotarisableTransaction {
    /// The id the client claims for the transaction.
    pub id: TransactionId,
    /// The transaction.
    pub transaction: WireTransaction,
}

/// Why a notary refused to sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotaryError {
    /// Inputs are already consumed by other transactions (double spend).
    Conflict(Conflict),
    /// The notary clock is outside the transaction's time window.
    TimeWindowInvalid {
        /// Notary clock reading.
        current: Timestamp,
        /// The window.
        window: TimeWindow,
    },
    /// The transaction names a different notary.
    WrongNotary(PartyName),
    /// The claimed id does not match the content.
    TransactionInvalid(String),
}

impl std::fmt::Display for NotaryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotaryError::Conflict(conflict) => write!(
                f,
                "double spend: {} input(s) already consumed",
                conflict.states.len()
            ),
            NotaryError::TimeWindowInvalid { current, window } => {
                write!(f, "time {} outside window {}", current, window)
            }
            NotaryError::WrongNotary(notary) => write!(f, "transaction is for notary {}", notary),
            NotaryError::TransactionInvalid(reason) => write!(f, "invalid transaction: {}", reason),
        }
    }
}

/// Outcome of notarisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotarisationResponse {
    /// The notary's signature over [`notarisation_payload`].
    Signed(DigitalSignatureWithKey),
    /// The notary refused.
    Error(NotaryError),
}

impl NotarisationResponse {
    /// The signature, if the transaction was notarised.
    pub fn signature(&self) -> Option<&DigitalSignatureWithKey> {
        match self {
            NotarisationResponse::Signed(signature) => Some(signature),
            NotarisationResponse::Error(_) => None,
        }
    }

    /// Label for logs and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            NotarisationResponse::Signed(_) => "signed",
            NotarisationResponse::Error(NotaryError::Conflict(_)) => "conflict",
            NotarisationResponse::Error(NotaryError::TimeWindowInvalid { .. }) => "time_window_invalid",
            NotarisationResponse::Error(NotaryError::WrongNotary(_)) => "wrong_notary",
            NotarisationResponse::Error(NotaryError::TransactionInvalid(_)) => "invalid",
        }
    }
}

/// Runs the notary checks and the uniqueness commit on this node.
fn notarise(
    services: &ServiceHub,
    caller: &PartyName,
    request: &NotarisableTransaction,
) -> FlowResult<NotarisationResponse> {
    let uniqueness = services.uniqueness.as_ref().ok_or_else(|| {
        FlowError::Validation(format!("{} is not a notary", services.our_name()))
    })?;

    let tx = &request.transaction;
    if &tx.notary != services.our_name() {
        return Ok(NotarisationResponse::Error(NotaryError::WrongNotary(
            tx.notary.clone(),
        )));
    }
    let actual = tx.id()?;
    if actual != request.id {
        return Ok(NotarisationResponse::Error(NotaryError::TransactionInvalid(
            format!("claimed id {} but content hashes to {}", request.id, actual),
        )));
    }

    let outcome = uniqueness.commit(&CommitRequest {
        tx_id: actual,
        inputs: tx.inputs.clone(),
        time_window: tx.time_window,
        caller: caller.clone(),
    })?;
    let response = match outcome {
        CommitOutcome::Committed => NotarisationResponse::Signed(
            services.keys.sign_as_legal(&notarisation_payload(&actual))?,
        ),
        CommitOutcome::Conflict(conflict) => {
            NotarisationResponse::Error(NotaryError::Conflict(conflict))
        }
        CommitOutcome::TimeWindowInvalid { current, window } => {
            NotarisationResponse::Error(NotaryError::TimeWindowInvalid { current, window })
        }
    };
    tracing::info!(
        tx = %actual,
        caller = %caller,
        outcome = response.outcome(),
        "Notarisation request processed"
    );
    Ok(response)
}

/// Checks that a signature is the notary's, over the transaction id.
fn verify_notary_signature(
    services: &ServiceHub,
    notary: &PartyName,
    id: &TransactionId,
    signature: &DigitalSignatureWithKey,
) -> FlowResult<()> {
    let party = services
        .identities
        .party_from_name(notary)
        .ok_or_else(|| FlowError::Validation(format!("unknown notary {}", notary)))?;
    if signature.by != party.owning_key {
        return Err(FlowError::Validation(format!(
            "signature is not by notary {}",
            notary
        )));
    }
    signature
        .verify(&notarisation_payload(id))
        .map_err(|_| FlowError::Validation("invalid notary signature".into()))
}

/// Obtains the notary's signature for a transaction.
///
/// Conflicts and time-window rejections are returned as
/// [`NotarisationResponse::Error`], not as flow failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotaryClientFlow {
    transaction: WireTransaction,
}

impl NotaryClientFlow {
    /// Creates the flow.
    pub fn new(transaction: WireTransaction) -> Self {
        Self { transaction }
    }
}

/// Suspension point of [`NotaryClientFlow`].
#[derive(Debug, Serialize, Deserialize)]
pub struct NotaryClientState {
    session: SessionRef,
    id: TransactionId,
}

impl FlowLogic for NotaryClientFlow {
    const NAME: &'static str = "tally.notary.client";
    type State = NotaryClientState;
    type Output = NotarisationResponse;

    fn start(
        &self,
        ctx: &mut FlowContext<'_>,
    ) -> FlowResult<Step<NotaryClientState, NotarisationResponse>> {
        let id = self.transaction.id()?;
        let request = NotarisableTransaction {
            id,
            transaction: self.transaction.clone(),
        };
        let notary = &self.transaction.notary;

        if notary == ctx.services().our_name() {
            let services = ctx.services();
            let response = notarise(services, services.our_name(), &request)?;
            return Ok(Step::Done(response));
        }

        tracing::debug!(tx = %id, notary = %notary, "Requesting notarisation");
        let session = ctx.initiate_flow(notary);
        ctx.send_and_receive(session, &request, NotaryClientState { session, id })
    }

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        state: NotaryClientState,
        received: Received,
    ) -> FlowResult<Step<NotaryClientState, NotarisationResponse>> {
        let response: NotarisationResponse = received.decode()?;
        if let NotarisationResponse::Signed(signature) = &response {
            verify_notary_signature(ctx.services(), &self.transaction.notary, &state.id, signature)?;
        }
        Ok(Step::Done(response))
    }
}

/// The notary side of [`NotaryClientFlow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotaryServiceFlow {
    client: PartyName,
}

impl NotaryServiceFlow {
    /// Creates the responder for a session opened by `client`.
    pub fn new(client: PartyName) -> Self {
        Self { client }
    }
}

impl FlowLogic for NotaryServiceFlow {
    const NAME: &'static str = "tally.notary.service";
    type State = SessionRef;
    type Output = NotarisationResponse;

    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<Step<SessionRef, NotarisationResponse>> {
        let session = ctx.initiating_session()?;
        ctx.receive(session, session)
    }

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        session: SessionRef,
        received: Received,
    ) -> FlowResult<Step<SessionRef, NotarisationResponse>> {
        let request: NotarisableTransaction = received.decode()?;
        let response = notarise(ctx.services(), &self.client, &request)?;
        ctx.send(session, &response)?;
        Ok(Step::Done(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_binds_transaction_id() {
        let a = TransactionId::new(tally_types::SecureHash::compute(b"a"));
        let b = TransactionId::new(tally_types::SecureHash::compute(b"b"));
        assert_ne!(notarisation_payload(&a), notarisation_payload(&b));
        assert!(notarisation_payload(&a).starts_with(NAMESPACE));
    }
}
