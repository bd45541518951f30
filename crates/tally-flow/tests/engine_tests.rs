//! End-to-end tests of the flow engine over an in-memory network.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tally_flow::{
    FlowContext, FlowEngine, FlowError, FlowEvent, FlowLogic, FlowRegistry, FlowResult,
    FlowStatus, Received, ServiceHub, SessionRef, Step, FINISHED_RETENTION,
};
use tally_identity::{IdentityService, KeyManagementService, KeyPair};
use tally_session::{MemoryNetwork, RetryPolicy, SessionConfig};
use tally_storage::{MemoryCheckpointStore, MemoryRecordStore};
use tally_types::{PartyName, SystemClock};

// ---------------------------------------------------------------------------
// Test flows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ball {
    n: u32,
    last: bool,
}

/// Bounces a counter off `to` for `rounds` round trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    to: PartyName,
    rounds: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct PingState {
    session: SessionRef,
    round: u32,
}

impl FlowLogic for Ping {
    const NAME: &'static str = "test.ping";
    type State = PingState;
    type Output = u32;

    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<Step<PingState, u32>> {
        let session = ctx.initiate_flow(&self.to);
        let ball = Ball {
            n: 0,
            last: self.rounds == 1,
        };
        ctx.send_and_receive(session, &ball, PingState { session, round: 1 })
    }

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        state: PingState,
        received: Received,
    ) -> FlowResult<Step<PingState, u32>> {
        let reply: u32 = received.decode()?;
        if state.round >= self.rounds {
            return Ok(Step::Done(reply));
        }
        let round = state.round + 1;
        let ball = Ball {
            n: reply + 1,
            last: round == self.rounds,
        };
        ctx.send_and_receive(
            state.session,
            &ball,
            PingState {
                session: state.session,
                round,
            },
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pong;

impl FlowLogic for Pong {
    const NAME: &'static str = "test.pong";
    type State = SessionRef;
    type Output = u32;

    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<Step<SessionRef, u32>> {
        let session = ctx.initiating_session()?;
        ctx.receive(session, session)
    }

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        session: SessionRef,
        received: Received,
    ) -> FlowResult<Step<SessionRef, u32>> {
        let ball: Ball = received.decode()?;
        ctx.send(session, &(ball.n + 1))?;
        if ball.last {
            Ok(Step::Done(ball.n + 1))
        } else {
            ctx.receive(session, session)
        }
    }
}

/// Sends one greeting then waits for an answer that never comes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Hail {
    to: PartyName,
}

impl FlowLogic for Hail {
    const NAME: &'static str = "test.hail";
    type State = ();
    type Output = ();

    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<Step<(), ()>> {
        let session = ctx.initiate_flow(&self.to);
        ctx.send_and_receive(session, &"hello", ())
    }

    fn resume(
        &self,
        _ctx: &mut FlowContext<'_>,
        _state: (),
        _received: Received,
    ) -> FlowResult<Step<(), ()>> {
        Ok(Step::Done(()))
    }
}

/// Responder that keeps listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Listen;

impl FlowLogic for Listen {
    const NAME: &'static str = "test.listen";
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
        _received: Received,
    ) -> FlowResult<Step<SessionRef, ()>> {
        ctx.receive(session, session)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Nap {
    millis: u64,
}

impl FlowLogic for Nap {
    const NAME: &'static str = "test.nap";
    type State = ();
    type Output = String;

    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<Step<(), String>> {
        let until = ctx
            .services()
            .clock
            .now()
            .plus(Duration::from_millis(self.millis));
        Ok(Step::Sleep { until, state: () })
    }

    fn resume(
        &self,
        _ctx: &mut FlowContext<'_>,
        _state: (),
        _received: Received,
    ) -> FlowResult<Step<(), String>> {
        Err(FlowError::UnexpectedMessage("nap takes no messages".into()))
    }

    fn wake(&self, _ctx: &mut FlowContext<'_>, _state: ()) -> FlowResult<Step<(), String>> {
        Ok(Step::Done("rested".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn party(name: &str) -> PartyName {
    PartyName::new(name).unwrap()
}

fn fast_config(receive_timeout: Duration) -> SessionConfig {
    SessionConfig {
        receive_timeout,
        retry: RetryPolicy::new(3, Duration::from_millis(10)),
    }
}

fn registry() -> FlowRegistry {
    let mut registry = FlowRegistry::new();
    registry
        .register_responder::<Ping, Pong>(|_| Pong)
        .register_responder::<Hail, Listen>(|_| Listen)
        .register::<Nap>();
    registry
}

struct TestNode {
    name: PartyName,
    services: Arc<ServiceHub>,
    checkpoints: Arc<MemoryCheckpointStore>,
}

impl TestNode {
    fn new(name: &str) -> Self {
        let name = party(name);
        let keys = Arc::new(KeyManagementService::new(name.clone(), KeyPair::generate()).unwrap());
        let services = Arc::new(ServiceHub {
            keys,
            identities: Arc::new(IdentityService::new()),
            attachments: Arc::new(MemoryRecordStore::new()),
            transactions: Arc::new(MemoryRecordStore::new()),
            clock: Arc::new(SystemClock),
            uniqueness: None,
        });
        Self {
            name,
            services,
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    fn engine(&self, network: &MemoryNetwork, registry: FlowRegistry, config: SessionConfig) -> FlowEngine {
        FlowEngine::new(
            self.services.clone(),
            registry,
            self.checkpoints.clone(),
            Arc::new(network.join(self.name.clone())),
            config,
        )
    }
}

async fn wait_for_status(engine: &FlowEngine, flow_id: &tally_types::FlowId, wanted: FlowStatus) {
    for _ in 0..200 {
        if engine.flow_status(flow_id) == Some(wanted.clone()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("flow never reached {:?}", wanted);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ping_pong_completes() {
    let network = MemoryNetwork::new();
    let alice = TestNode::new("O=Alice");
    let bob = TestNode::new("O=Bob");
    let alice_engine = alice.engine(&network, registry(), SessionConfig::default());
    let bob_engine = bob.engine(&network, registry(), SessionConfig::default());
    let mut bob_events = bob_engine.subscribe();
    alice_engine.start().unwrap();
    bob_engine.start().unwrap();

    let handle = alice_engine
        .start_flow(Ping {
            to: bob.name.clone(),
            rounds: 3,
        })
        .unwrap();
    assert_eq!(handle.result().await.unwrap(), 5);

    match bob_events.recv().await.unwrap() {
        FlowEvent::Started {
            name, initiated_by, ..
        } => {
            assert_eq!(name, "test.pong");
            assert_eq!(initiated_by, Some(alice.name.clone()));
        }
        other => panic!("unexpected event {:?}", other),
    }
    match bob_events.recv().await.unwrap() {
        FlowEvent::Completed { name, .. } => assert_eq!(name, "test.pong"),
        other => panic!("unexpected event {:?}", other),
    }

    assert!(alice.checkpoints.is_empty());
    assert!(bob.checkpoints.is_empty());
    assert!(alice_engine.running_flows().is_empty());
}

#[tokio::test]
async fn test_duplicated_frames_are_delivered_once() {
    let network = MemoryNetwork::new();
    network.set_duplication(2);
    let alice = TestNode::new("O=Alice");
    let bob = TestNode::new("O=Bob");
    let alice_engine = alice.engine(&network, registry(), SessionConfig::default());
    let bob_engine = bob.engine(&network, registry(), SessionConfig::default());
    alice_engine.start().unwrap();
    bob_engine.start().unwrap();

    let handle = alice_engine
        .start_flow(Ping {
            to: bob.name.clone(),
            rounds: 4,
        })
        .unwrap();
    assert_eq!(handle.result().await.unwrap(), 7);
}

#[tokio::test]
async fn test_unregistered_protocol_is_rejected() {
    let network = MemoryNetwork::new();
    let alice = TestNode::new("O=Alice");
    let bob = TestNode::new("O=Bob");
    let alice_engine = alice.engine(&network, registry(), SessionConfig::default());
    let bob_engine = bob.engine(&network, FlowRegistry::new(), SessionConfig::default());
    alice_engine.start().unwrap();
    bob_engine.start().unwrap();

    let handle = alice_engine
        .start_flow(Ping {
            to: bob.name.clone(),
            rounds: 1,
        })
        .unwrap();
    match handle.result().await {
        Err(FlowError::SessionRejected { party, reason }) => {
            assert_eq!(party, bob.name);
            assert!(reason.contains("test.ping"));
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(alice.checkpoints.is_empty());
}

#[tokio::test]
async fn test_silent_counterparty_times_out() {
    let network = MemoryNetwork::new();
    let alice = TestNode::new("O=Alice");
    let carol = party("O=Carol");
    // Carol has an inbox but no engine.
    let _carol_transport = network.join(carol.clone());
    let alice_engine = alice.engine(&network, registry(), fast_config(Duration::from_millis(200)));
    alice_engine.start().unwrap();

    let handle = alice_engine
        .start_flow(Ping {
            to: carol.clone(),
            rounds: 1,
        })
        .unwrap();
    assert_eq!(
        handle.result().await,
        Err(FlowError::CounterpartyUnresponsive(carol.clone()))
    );
    assert!(network.pending(&carol) >= 1);
}

#[tokio::test]
async fn test_unreachable_counterparty_breaks_session() {
    let network = MemoryNetwork::new();
    let alice = TestNode::new("O=Alice");
    let dave = party("O=Dave");
    let _dave_transport = network.join(dave.clone());
    network.disconnect(&dave);
    let alice_engine = alice.engine(&network, registry(), fast_config(Duration::from_secs(30)));
    alice_engine.start().unwrap();

    let handle = alice_engine
        .start_flow(Ping {
            to: dave.clone(),
            rounds: 1,
        })
        .unwrap();
    assert_eq!(handle.result().await, Err(FlowError::SessionBroken(dave)));
}

#[tokio::test]
async fn test_kill_relays_failure_to_counterparty() {
    let network = MemoryNetwork::new();
    let alice = TestNode::new("O=Alice");
    let bob = TestNode::new("O=Bob");
    let alice_engine = alice.engine(&network, registry(), SessionConfig::default());
    let bob_engine = bob.engine(&network, registry(), SessionConfig::default());
    let mut bob_events = bob_engine.subscribe();
    alice_engine.start().unwrap();
    bob_engine.start().unwrap();

    let handle = alice_engine
        .start_flow(Hail {
            to: bob.name.clone(),
        })
        .unwrap();
    let flow_id = handle.id();

    let listener = match bob_events.recv().await.unwrap() {
        FlowEvent::Started { flow_id, name, .. } => {
            assert_eq!(name, "test.listen");
            flow_id
        }
        other => panic!("unexpected event {:?}", other),
    };
    // Once Bob is parked his Confirm is on the wire; wait until Alice's
    // router has taken it so the kill is processed after it.
    wait_for_status(&bob_engine, &listener, FlowStatus::Suspended).await;
    while network.pending(&alice.name) > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(alice_engine.running_flows(), vec![flow_id]);

    assert!(alice_engine.kill_flow(&flow_id));
    assert_eq!(handle.result().await, Err(FlowError::Killed));
    assert!(!alice_engine.kill_flow(&flow_id));

    match bob_events.recv().await.unwrap() {
        FlowEvent::Failed { name, error, .. } => {
            assert_eq!(name, "test.listen");
            match error {
                FlowError::CounterpartyFailed { party, report } => {
                    assert_eq!(party, alice.name);
                    assert!(!report.infrastructure);
                    assert!(report.message.contains("killed"));
                }
                other => panic!("unexpected error {:?}", other),
            }
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(bob.checkpoints.is_empty());
}

#[tokio::test]
async fn test_flow_resumes_after_restart() {
    let network = MemoryNetwork::new();
    let alice = TestNode::new("O=Alice");
    let bob = TestNode::new("O=Bob");
    let _bob_inbox = network.join(bob.name.clone());

    let alice_engine = alice.engine(&network, registry(), SessionConfig::default());
    alice_engine.start().unwrap();
    let handle = alice_engine
        .start_flow(Ping {
            to: bob.name.clone(),
            rounds: 2,
        })
        .unwrap();
    let flow_id = handle.id();
    wait_for_status(&alice_engine, &flow_id, FlowStatus::Suspended).await;

    alice_engine.shutdown();
    assert_eq!(handle.result().await, Err(FlowError::EngineStopped));
    assert_eq!(alice.checkpoints.len(), 1);

    // Bob answers while Alice is down; the frames wait in her inbox.
    let bob_engine = bob.engine(&network, registry(), SessionConfig::default());
    bob_engine.start().unwrap();

    let alice_engine = alice.engine(&network, registry(), SessionConfig::default());
    assert_eq!(alice_engine.start().unwrap(), 1);
    let handle = alice_engine.handle::<u32>(flow_id).unwrap();
    assert_eq!(handle.result().await.unwrap(), 3);
    assert!(alice.checkpoints.is_empty());
}

#[tokio::test]
async fn test_finished_flows_are_forgotten_beyond_retention() {
    let network = MemoryNetwork::new();
    let alice = TestNode::new("O=Alice");
    let bob = TestNode::new("O=Bob");
    let alice_engine = alice.engine(&network, registry(), SessionConfig::default());
    let bob_engine = bob.engine(&network, registry(), SessionConfig::default());
    alice_engine.start().unwrap();
    bob_engine.start().unwrap();

    let mut ids = Vec::new();
    for _ in 0..FINISHED_RETENTION + 40 {
        let handle = alice_engine.start_flow(Nap { millis: 0 }).unwrap();
        ids.push(handle.id());
        assert_eq!(handle.result().await.unwrap(), "rested");

        let handle = alice_engine
            .start_flow(Ping {
                to: bob.name.clone(),
                rounds: 1,
            })
            .unwrap();
        assert_eq!(handle.result().await.unwrap(), 1);
    }
    for _ in 0..200 {
        if bob_engine.running_flows().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(alice_engine.running_flows().is_empty());
    assert_eq!(alice_engine.known_flows(), FINISHED_RETENTION);
    assert_eq!(alice_engine.flow_status(&ids[0]), None);
    assert!(alice_engine.handle::<String>(ids[0]).is_none());
    assert_eq!(
        alice_engine.flow_status(ids.last().unwrap()),
        Some(FlowStatus::Completed(serde_json::json!("rested")))
    );
    assert_eq!(bob_engine.known_flows(), FINISHED_RETENTION);
    assert_eq!(bob_engine.known_initiations(), FINISHED_RETENTION);
}

#[tokio::test]
async fn test_sleeping_flow_wakes() {
    let network = MemoryNetwork::new();
    let alice = TestNode::new("O=Alice");
    let alice_engine = alice.engine(&network, registry(), SessionConfig::default());
    alice_engine.start().unwrap();

    let handle = alice_engine.start_flow(Nap { millis: 50 }).unwrap();
    assert_eq!(handle.result().await.unwrap(), "rested");
}

#[tokio::test]
async fn test_unknown_checkpoint_is_skipped() {
    let network = MemoryNetwork::new();
    let alice = TestNode::new("O=Alice");
    let alice_engine = alice.engine(&network, registry(), SessionConfig::default());
    alice_engine.start().unwrap();
    let handle = alice_engine.start_flow(Nap { millis: 60_000 }).unwrap();
    let flow_id = handle.id();
    wait_for_status(&alice_engine, &flow_id, FlowStatus::Suspended).await;
    alice_engine.shutdown();

    // A registry without the flow cannot rebuild it.
    let restarted = alice.engine(&network, FlowRegistry::new(), SessionConfig::default());
    assert_eq!(restarted.start().unwrap(), 0);
    assert_eq!(alice.checkpoints.len(), 1);
    restarted.shutdown();

    let restarted = alice.engine(&network, registry(), SessionConfig::default());
    assert_eq!(restarted.start().unwrap(), 1);
    assert!(restarted.kill_flow(&flow_id));
}
