//! Protocol tests over an in-memory network of flow engines.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_flow::{
    FlowContext, FlowEngine, FlowError, FlowLogic, FlowRegistry, FlowResult, Received,
    ServiceHub, SessionRef, Step,
};
use tally_identity::{IdentityService, KeyManagementService, KeyPair};
use tally_notary::{PersistentUniquenessProvider, TimeWindowChecker, UniquenessProvider};
use tally_protocols::{
    notarisation_payload, register_all, register_notary_service, AttachmentKind,
    FetchAttachmentsFlow, FetchKind, FetchRequest, FetchTransactionsFlow, NotarisationResponse,
    NotaryClientFlow, NotaryError, SwapIdentitiesFlow,
};
use tally_session::{MemoryNetwork, SessionConfig};
use tally_storage::{MemoryCheckpointStore, MemoryCommitmentStore, MemoryRecordStore};
use tally_types::{
    Attachment, PartyName, SecureHash, SerializedBytes, StateRef, SystemClock, TimeWindow,
    Timestamp, TransactionId, WireTransaction,
};

struct TestNode {
    services: Arc<ServiceHub>,
    engine: FlowEngine,
}

impl TestNode {
    fn name(&self) -> PartyName {
        self.services.our_name().clone()
    }
}

fn party(name: &str) -> PartyName {
    PartyName::new(name).unwrap()
}

fn notary_provider() -> Arc<dyn UniquenessProvider> {
    Arc::new(PersistentUniquenessProvider::new(
        Arc::new(MemoryCommitmentStore::new()),
        TimeWindowChecker::new(Arc::new(SystemClock)),
    ))
}

/// Builds a fully connected network in which every node knows every
/// well-known identity.
fn network(names: &[&str], notary: Option<&str>, extra: impl Fn(&mut FlowRegistry)) -> Vec<TestNode> {
    let network = MemoryNetwork::new();
    let keys: Vec<_> = names
        .iter()
        .map(|name| Arc::new(KeyManagementService::new(party(name), KeyPair::generate()).unwrap()))
        .collect();

    keys.iter()
        .map(|kms| {
            let identities = Arc::new(IdentityService::new());
            for other in &keys {
                identities
                    .register_well_known(other.legal_identity().clone())
                    .unwrap();
            }
            let is_notary = notary == Some(kms.legal_identity().name().as_str());
            let services = Arc::new(ServiceHub {
                keys: kms.clone(),
                identities,
                attachments: Arc::new(MemoryRecordStore::new()),
                transactions: Arc::new(MemoryRecordStore::new()),
                clock: Arc::new(SystemClock),
                uniqueness: is_notary.then(notary_provider),
            });
            let mut registry = FlowRegistry::new();
            register_all(&mut registry);
            if is_notary {
                register_notary_service(&mut registry);
            }
            extra(&mut registry);
            let engine = FlowEngine::new(
                services.clone(),
                registry,
                Arc::new(MemoryCheckpointStore::new()),
                Arc::new(network.join(services.our_name().clone())),
                SessionConfig::default(),
            );
            engine.start().unwrap();
            TestNode { services, engine }
        })
        .collect()
}

fn attachment(content: &str) -> Attachment {
    Attachment::new(content.as_bytes().to_vec())
}

// ---------------------------------------------------------------------------
// Identity exchange
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_swap_identities_round_trip() {
    let nodes = network(&["O=Alice", "O=Bob"], None, |_| {});
    let (alice, bob) = (&nodes[0], &nodes[1]);

    let identities = alice
        .engine
        .start_flow(SwapIdentitiesFlow::new(bob.name()))
        .unwrap()
        .result()
        .await
        .unwrap();

    assert_eq!(identities.len(), 2);
    let alice_anon = identities[&alice.name()];
    let bob_anon = identities[&bob.name()];

    // Fresh keys, not the legal ones.
    assert_ne!(alice_anon.owning_key, alice.services.our_identity().owning_key);
    assert_ne!(bob_anon.owning_key, bob.services.our_identity().owning_key);
    assert!(alice.services.keys.owns(&alice_anon.owning_key));
    assert!(bob.services.keys.owns(&bob_anon.owning_key));

    // Each side resolves the other's fresh key to its legal identity.
    assert_eq!(
        alice.services.identities.well_known_party_for(&bob_anon.owning_key),
        Some(bob.services.our_identity())
    );
    assert_eq!(
        bob.services.identities.well_known_party_for(&alice_anon.owning_key),
        Some(alice.services.our_identity())
    );

    // And its own.
    assert_eq!(
        alice.services.identities.well_known_party_for(&alice_anon.owning_key),
        Some(alice.services.our_identity())
    );
    assert_eq!(
        bob.services.identities.well_known_party_for(&bob_anon.owning_key),
        Some(bob.services.our_identity())
    );
}

#[tokio::test]
async fn test_swap_with_self_opens_no_session() {
    let nodes = network(&["O=Alice"], None, |_| {});
    let alice = &nodes[0];
    let mut events = alice.engine.subscribe();

    let identities = alice
        .engine
        .start_flow(SwapIdentitiesFlow::new(alice.name()))
        .unwrap()
        .result()
        .await
        .unwrap();

    assert_eq!(identities.len(), 1);
    let anon = identities[&alice.name()];
    assert!(alice.services.keys.owns(&anon.owning_key));
    assert_ne!(anon.owning_key, alice.services.our_identity().owning_key);
    assert_eq!(
        alice.services.identities.well_known_party_for(&anon.owning_key),
        Some(alice.services.our_identity())
    );

    // Only the initiator ran: started, completed, nothing else.
    assert!(matches!(events.recv().await.unwrap(), tally_flow::FlowEvent::Started { initiated_by: None, .. }));
    assert!(matches!(events.recv().await.unwrap(), tally_flow::FlowEvent::Completed { .. }));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_swap_with_unknown_counterparty_fails_validation() {
    // Bob does not know Alice's well-known identity, so he cannot register
    // her confidential one.
    let network = MemoryNetwork::new();
    let make = |name: &str| {
        let kms = Arc::new(KeyManagementService::new(party(name), KeyPair::generate()).unwrap());
        let identities = Arc::new(IdentityService::new());
        identities
            .register_well_known(kms.legal_identity().clone())
            .unwrap();
        Arc::new(ServiceHub {
            keys: kms,
            identities,
            attachments: Arc::new(MemoryRecordStore::new()),
            transactions: Arc::new(MemoryRecordStore::new()),
            clock: Arc::new(SystemClock),
            uniqueness: None,
        })
    };
    let alice = make("O=Alice");
    let bob = make("O=Bob");
    alice
        .identities
        .register_well_known(bob.keys.legal_identity().clone())
        .unwrap();

    let engines: Vec<_> = [&alice, &bob]
        .iter()
        .map(|services| {
            let mut registry = FlowRegistry::new();
            register_all(&mut registry);
            let engine = FlowEngine::new(
                (*services).clone(),
                registry,
                Arc::new(MemoryCheckpointStore::new()),
                Arc::new(network.join(services.our_name().clone())),
                SessionConfig::default(),
            );
            engine.start().unwrap();
            engine
        })
        .collect();

    let result = engines[0]
        .start_flow(SwapIdentitiesFlow::new(bob.our_name().clone()))
        .unwrap()
        .result()
        .await;
    match result {
        Err(FlowError::CounterpartyFailed { party, report }) => {
            assert_eq!(&party, bob.our_name());
            assert!(report.message.contains("validation"));
        }
        other => panic!("unexpected result {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Batch fetch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fetch_downloads_then_serves_locally() {
    let nodes = network(&["O=Alice", "O=Bob"], None, |_| {});
    let (alice, bob) = (&nodes[0], &nodes[1]);

    let remote = [attachment("contract code"), attachment("legal prose")];
    for a in &remote {
        bob.services.attachments.persist(a.clone()).unwrap();
    }
    let local = attachment("already here");
    alice.services.attachments.persist(local.clone()).unwrap();

    let ids: Vec<SecureHash> = remote.iter().chain([&local]).map(Attachment::id).collect();
    let first = alice
        .engine
        .start_flow(FetchAttachmentsFlow::new(ids.clone(), bob.name()))
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(first.from_disk, vec![local.clone()]);
    assert_eq!(first.downloaded.len(), 2);
    assert_eq!(
        format!("{:?}", first),
        "FetchResult { kind: \"tally.fetch.attachment\", from_disk: 1, downloaded: 2 }"
    );
    for a in &remote {
        assert!(first.downloaded.contains(a));
        assert_eq!(alice.services.attachments.load(&a.id()).unwrap(), Some(a.clone()));
    }

    let second = alice
        .engine
        .start_flow(FetchAttachmentsFlow::new(ids, bob.name()))
        .unwrap()
        .result()
        .await
        .unwrap();
    assert!(second.downloaded.is_empty());
    assert_eq!(second.from_disk.len(), 3);
    assert_eq!(second.all().count(), 3);
}

#[tokio::test]
async fn test_fetch_transactions_verifies_ids() {
    let nodes = network(&["O=Alice", "O=Bob"], None, |_| {});
    let (alice, bob) = (&nodes[0], &nodes[1]);

    let tx = WireTransaction {
        inputs: vec![],
        outputs: vec![b"cash".to_vec()],
        attachments: vec![],
        notary: bob.name(),
        time_window: None,
    };
    let id = tx.id().unwrap();
    bob.services.transactions.persist(tx.clone()).unwrap();

    let result = alice
        .engine
        .start_flow(FetchTransactionsFlow::new([id], bob.name()))
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(result.downloaded, vec![tx]);
    assert!(alice.services.transactions.contains(&id).unwrap());
}

#[tokio::test]
async fn test_fetch_of_unknown_record_fails() {
    let nodes = network(&["O=Alice", "O=Bob"], None, |_| {});
    let (alice, bob) = (&nodes[0], &nodes[1]);

    let missing = SecureHash::compute(b"nobody has this");
    let result = alice
        .engine
        .start_flow(FetchAttachmentsFlow::new([missing], bob.name()))
        .unwrap()
        .result()
        .await;
    match result {
        Err(FlowError::CounterpartyFailed { party, report }) => {
            assert_eq!(party, bob.name());
            assert!(report.message.contains("does not have"));
        }
        other => panic!("unexpected result {:?}", other),
    }
}

/// Serves the real record for every id except the last, which it swaps for junk.
#[derive(Debug, Serialize, Deserialize)]
struct TamperingHandler;

impl FlowLogic for TamperingHandler {
    const NAME: &'static str = "test.fetch.tampering";
    type State = SessionRef;
    type Output = ();

    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<Step<SessionRef, ()>> {
        let session = ctx.initiating_session()?;
        ctx.receive(session, session)
    }

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        session: SessionRef,
        received: Received,
    ) -> FlowResult<Step<SessionRef, ()>> {
        let request: FetchRequest<AttachmentKind> = received.decode()?;
        let mut wire: Vec<SerializedBytes> = Vec::new();
        for id in &request.ids {
            let record = AttachmentKind::load_local(ctx.services(), id)?
                .ok_or_else(|| FlowError::Validation("missing".into()))?;
            wire.push(AttachmentKind::to_wire(record));
        }
        if let Some(last) = wire.last_mut() {
            *last = SerializedBytes::from_vec(b"tampered".to_vec());
        }
        ctx.send(session, &wire)?;
        Ok(Step::Done(()))
    }
}

#[tokio::test]
async fn test_fetch_integrity_failure_persists_nothing() {
    let nodes = network(&["O=Alice", "O=Bob"], None, |registry| {
        registry.register_responder_for(AttachmentKind::FLOW, |_| TamperingHandler);
    });
    let (alice, bob) = (&nodes[0], &nodes[1]);

    let records = [attachment("one"), attachment("two"), attachment("three")];
    for a in &records {
        bob.services.attachments.persist(a.clone()).unwrap();
    }

    let result = alice
        .engine
        .start_flow(FetchAttachmentsFlow::new(
            records.iter().map(Attachment::id),
            bob.name(),
        ))
        .unwrap()
        .result()
        .await;
    assert!(matches!(result, Err(FlowError::Validation(msg)) if msg.contains("hash mismatch")));
    assert_eq!(alice.services.attachments.len().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Notarisation
// ---------------------------------------------------------------------------

fn spend(notary: &PartyName, inputs: Vec<StateRef>, tag: &str) -> WireTransaction {
    WireTransaction {
        inputs,
        outputs: vec![tag.as_bytes().to_vec()],
        attachments: vec![],
        notary: notary.clone(),
        time_window: None,
    }
}

fn issued_state(n: u8) -> StateRef {
    StateRef::new(TransactionId::new(SecureHash::compute(&[n])), 0)
}

#[tokio::test]
async fn test_notarisation_signs_then_rejects_double_spend() {
    let nodes = network(&["O=Alice", "O=Notary"], Some("O=Notary"), |_| {});
    let (alice, notary) = (&nodes[0], &nodes[1]);

    let first = spend(&notary.name(), vec![issued_state(1)], "to bob");
    let first_id = first.id().unwrap();
    let response = alice
        .engine
        .start_flow(NotaryClientFlow::new(first.clone()))
        .unwrap()
        .result()
        .await
        .unwrap();
    let signature = response.signature().expect("signed").clone();
    assert_eq!(signature.by, notary.services.our_identity().owning_key);
    assert!(signature.verify(&notarisation_payload(&first_id)).is_ok());

    // Re-submitting the same transaction is an idempotent success.
    let retry = alice
        .engine
        .start_flow(NotaryClientFlow::new(first))
        .unwrap()
        .result()
        .await
        .unwrap();
    assert!(matches!(retry, NotarisationResponse::Signed(_)));

    let double_spend = spend(&notary.name(), vec![issued_state(1), issued_state(2)], "to carol");
    let response = alice
        .engine
        .start_flow(NotaryClientFlow::new(double_spend))
        .unwrap()
        .result()
        .await
        .unwrap();
    match response {
        NotarisationResponse::Error(NotaryError::Conflict(conflict)) => {
            assert_eq!(conflict.winning_transactions(), vec![first_id]);
            assert_eq!(conflict.states.len(), 1);
            assert_eq!(conflict.states[0].state_ref, issued_state(1));
            assert_eq!(conflict.states[0].consumed_by.requesting_party, alice.name());
        }
        other => panic!("unexpected response {:?}", other),
    }
}

#[tokio::test]
async fn test_notary_commits_locally_for_itself() {
    let nodes = network(&["O=Notary"], Some("O=Notary"), |_| {});
    let notary = &nodes[0];
    let tx = spend(&notary.name(), vec![issued_state(7)], "self");

    let response = notary
        .engine
        .start_flow(NotaryClientFlow::new(tx))
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(response.outcome(), "signed");
}

#[tokio::test]
async fn test_expired_time_window_is_rejected() {
    let nodes = network(&["O=Alice", "O=Notary"], Some("O=Notary"), |_| {});
    let (alice, notary) = (&nodes[0], &nodes[1]);

    let mut tx = spend(&notary.name(), vec![issued_state(3)], "late");
    tx.time_window = Some(TimeWindow::until_only(Timestamp::from_millis(1)));
    let response = alice
        .engine
        .start_flow(NotaryClientFlow::new(tx.clone()))
        .unwrap()
        .result()
        .await
        .unwrap();
    assert!(matches!(
        response,
        NotarisationResponse::Error(NotaryError::TimeWindowInvalid { .. })
    ));

    // Nothing was committed: the same input can still be spent.
    tx.time_window = None;
    let response = alice
        .engine
        .start_flow(NotaryClientFlow::new(tx))
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(response.outcome(), "signed");
}

#[tokio::test]
async fn test_non_notary_rejects_session() {
    let nodes = network(&["O=Alice", "O=Bob"], None, |_| {});
    let (alice, bob) = (&nodes[0], &nodes[1]);

    let tx = spend(&bob.name(), vec![issued_state(4)], "nowhere");
    let result = alice
        .engine
        .start_flow(NotaryClientFlow::new(tx))
        .unwrap()
        .result()
        .await;
    assert!(matches!(
        result,
        Err(FlowError::SessionRejected { party, .. }) if party == bob.name()
    ));
}
