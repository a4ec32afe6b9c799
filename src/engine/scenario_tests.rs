// End-to-end runs of small processes through the whole engine

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::bus::{InMemoryBus, MessageServer};
use super::events::{EventBus, Topic};
use super::instance::{Instance, InstanceState};
use super::thresher::Thresher;
use super::track::TrackState;
use crate::config::ThresherConfig;
use crate::models::{
    DataSet, FlowCondition, GatewayDirection, GatewayKind, Id, Lane, Message, MessageDirection,
    MessageVariable, Node, OutputSink, Parameter, Process, TaskDefinition, TokenState, VarType,
    Variable,
};
use crate::ThresherError;

fn config() -> ThresherConfig {
    ThresherConfig {
        bus_wait_ms: 200,
        ..Default::default()
    }
}

fn engine_with(bus: &InMemoryBus) -> Thresher {
    Thresher::new(Arc::new(bus.clone()), config())
}

fn engine() -> Thresher {
    engine_with(&InMemoryBus::new())
}

async fn finish(instance: &Arc<Instance>) {
    tokio::time::timeout(Duration::from_secs(5), instance.wait())
        .await
        .expect("instance did not end in time");
}

fn states(instance: &Instance) -> Vec<TrackState> {
    instance.tracks().iter().map(|t| t.state).collect()
}

async fn wait_until<F: Fn() -> bool>(what: &str, ready: F) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !ready() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn letter(direction: MessageDirection) -> Message {
    Message::new(
        "letter_X",
        direction,
        vec![MessageVariable::required(Variable::int("x", 0))],
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_then_output() {
    let (sink, out) = OutputSink::memory();
    let mut process = Process::new("store-output");
    let store = process
        .add_node(Node::task("store x", TaskDefinition::store(vec![Variable::int("x", 10)])))
        .unwrap();
    let print = process
        .add_node(Node::task("print x", TaskDefinition::output(vec!["x"], sink)))
        .unwrap();
    process.link(store, print).unwrap();

    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    assert_eq!(out.contents(), "x = 10\n");
    assert_eq!(instance.state(), InstanceState::Ended);
    let tracks = instance.tracks();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].state, TrackState::Ended);
    assert_eq!(tracks[0].steps, 2);
    assert_eq!(instance.variable_store().get("x").unwrap().int_value().unwrap(), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_then_receive_across_instances() {
    let bus = InMemoryBus::new();
    let engine = engine_with(&bus);

    let mut sender = Process::new("sender");
    sender.add_message(letter(MessageDirection::Outgoing)).unwrap();
    let store = sender
        .add_node(Node::task("store x", TaskDefinition::store(vec![Variable::int("x", 42)])))
        .unwrap();
    let send = sender
        .add_node(Node::task("send letter", TaskDefinition::send("letter_X", "Q")))
        .unwrap();
    sender.link(store, send).unwrap();

    let (sink, out) = OutputSink::memory();
    let mut receiver = Process::new("receiver");
    receiver.add_message(letter(MessageDirection::Incoming)).unwrap();
    let recv = receiver
        .add_node(Node::task("receive letter", TaskDefinition::receive("letter_X", "Q")))
        .unwrap();
    let print = receiver
        .add_node(Node::task("print x", TaskDefinition::output(vec!["x"], sink)))
        .unwrap();
    receiver.link(recv, print).unwrap();

    let listening = engine.run_process(receiver.snapshot().unwrap(), Vec::new()).unwrap();
    let sending = engine.run_process(sender.snapshot().unwrap(), Vec::new()).unwrap();

    finish(&sending).await;
    tokio::time::timeout(Duration::from_secs(2), listening.wait())
        .await
        .expect("receiver did not get the letter");

    assert_eq!(out.contents(), "x = 42\n");
    assert_eq!(bus.queue_len("Q"), 1);
    assert_eq!(states(&listening), vec![TrackState::Ended]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exclusive_gateway_takes_first_true_flow() {
    let (sink_a, out_a) = OutputSink::memory();
    let (sink_b, out_b) = OutputSink::memory();
    let mut process = Process::new("exclusive");
    let store = process
        .add_node(Node::task("store x", TaskDefinition::store(vec![Variable::int("x", 5)])))
        .unwrap();
    let gw = process
        .add_node(Node::gateway("x big?", GatewayKind::Exclusive, GatewayDirection::Diverging))
        .unwrap();
    let a = process
        .add_node(Node::task("output A", TaskDefinition::output(vec!["x"], sink_a)))
        .unwrap();
    let b = process
        .add_node(Node::task("output B", TaskDefinition::output(vec!["x"], sink_b)))
        .unwrap();
    process.link(store, gw).unwrap();
    process.link_when(gw, a, FlowCondition::expr("x > 3")).unwrap();
    let fallback = process.link(gw, b).unwrap();
    process.set_default_flow(gw, fallback).unwrap();

    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    assert_eq!(out_a.contents(), "x = 5\n");
    assert_eq!(out_b.contents(), "");
    assert_eq!(states(&instance), vec![TrackState::Ended]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exclusive_gateway_falls_back_to_default() {
    let (sink_a, out_a) = OutputSink::memory();
    let (sink_b, out_b) = OutputSink::memory();
    let mut process = Process::new("exclusive default");
    let store = process
        .add_node(Node::task("store x", TaskDefinition::store(vec![Variable::int("x", 1)])))
        .unwrap();
    let gw = process
        .add_node(Node::gateway("x big?", GatewayKind::Exclusive, GatewayDirection::Diverging))
        .unwrap();
    let a = process
        .add_node(Node::task("output A", TaskDefinition::output(vec!["x"], sink_a)))
        .unwrap();
    let b = process
        .add_node(Node::task("output B", TaskDefinition::output(vec!["x"], sink_b)))
        .unwrap();
    process.link(store, gw).unwrap();
    process
        .link_when(
            gw,
            a,
            FlowCondition::VarGreaterThan {
                name: "x".to_string(),
                value: 3.0,
            },
        )
        .unwrap();
    let fallback = process.link(gw, b).unwrap();
    process.set_default_flow(gw, fallback).unwrap();

    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    assert_eq!(out_a.contents(), "");
    assert_eq!(out_b.contents(), "x = 1\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exclusive_gateway_without_match_fails_the_track() {
    let mut process = Process::new("dead end");
    let store = process
        .add_node(Node::task("store x", TaskDefinition::store(vec![Variable::int("x", 1)])))
        .unwrap();
    let gw = process
        .add_node(Node::gateway("x big?", GatewayKind::Exclusive, GatewayDirection::Diverging))
        .unwrap();
    let a = process.add_node(Node::task("never", TaskDefinition::Service)).unwrap();
    process.link(store, gw).unwrap();
    process.link_when(gw, a, FlowCondition::expr("x > 3")).unwrap();

    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    let tracks = instance.tracks();
    assert_eq!(tracks[0].state, TrackState::Error);
    assert!(!tracks[0].cancelled);
    let error = tracks[0].error.clone().unwrap();
    assert!(error.contains("x big?"), "{}", error);
    assert!(error.contains("No outgoing flow"), "{}", error);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_activity_forks_parallel_tracks() {
    let mut process = Process::new("fork");
    let fork = process.add_node(Node::task("fork", TaskDefinition::Service)).unwrap();
    let a = process
        .add_node(Node::task("store a", TaskDefinition::store(vec![Variable::int("a", 1)])))
        .unwrap();
    let b = process
        .add_node(Node::task("store b", TaskDefinition::store(vec![Variable::int("b", 1)])))
        .unwrap();
    process.link(fork, a).unwrap();
    process.link(fork, b).unwrap();

    let engine = engine();
    let mut events = engine.subscribe();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    assert_eq!(states(&instance), vec![TrackState::Ended, TrackState::Ended]);
    let store = instance.variable_store();
    assert_eq!(store.get("a").unwrap().int_value().unwrap(), 1);
    assert_eq!(store.get("b").unwrap().int_value().unwrap(), 1);
    assert_eq!(instance.alive_tokens(), 0);

    let mut new_tracks = 0;
    loop {
        let event = events.recv().await.unwrap();
        match event.topic {
            Topic::NewTrack => new_tracks += 1,
            Topic::InstanceEnd => break,
            Topic::InstanceStart => {}
        }
    }
    assert_eq!(new_tracks, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_while_receiving() {
    let mut process = Process::new("lonely receiver");
    process.add_message(letter(MessageDirection::Incoming)).unwrap();
    process
        .add_node(Node::task("receive letter", TaskDefinition::receive("letter_X", "")))
        .unwrap();

    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancelled_at = Instant::now();
    instance.cancel();
    finish(&instance).await;
    assert!(cancelled_at.elapsed() < Duration::from_millis(200));

    let tracks = instance.tracks();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].state, TrackState::Error);
    assert!(tracks[0].cancelled);
}

#[test]
fn test_duplicate_lane_is_rejected_at_model_time() {
    let mut process = Process::new("lanes");
    process.add_lane(Lane::new("L")).unwrap();
    assert!(matches!(
        process.add_lane(Lane::new("L")),
        Err(ThresherError::DuplicateName { kind: "lane", .. })
    ));
}

#[tokio::test]
async fn test_process_without_entry_nodes_does_not_start() {
    let engine = engine();
    let empty = Process::new("empty");
    assert!(matches!(
        engine.run_process(empty.snapshot().unwrap(), Vec::new()),
        Err(ThresherError::Structural(_))
    ));

    let mut gateway_only = Process::new("gateway only");
    gateway_only
        .add_node(Node::gateway("gw", GatewayKind::Parallel, GatewayDirection::Unspecified))
        .unwrap();
    assert!(engine
        .run_process(gateway_only.snapshot().unwrap(), Vec::new())
        .is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_right_after_run_still_ends() {
    let mut process = Process::new("quick");
    process
        .add_node(Node::task("store x", TaskDefinition::store(vec![Variable::int("x", 1)])))
        .unwrap();
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let instance = Instance::new(
        process.snapshot().unwrap(),
        Arc::new(InMemoryBus::new()),
        events,
        Duration::from_millis(200),
        CancellationToken::new(),
        Vec::new(),
    );
    instance.prepare().unwrap();
    instance.cancel();

    let result = instance.run().await;
    assert!(matches!(result, Err(ThresherError::Cancelled)));
    assert_eq!(instance.state(), InstanceState::Ended);
    assert!(instance.tracks().iter().all(|t| t.state.is_terminal()));

    let mut ended = false;
    while let Ok(event) = rx.try_recv() {
        if event.topic == Topic::InstanceEnd {
            assert_eq!(event.payload["cancelled"], true);
            ended = true;
        }
    }
    assert!(ended);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_with_missing_variable_puts_nothing() {
    let bus = InMemoryBus::new();
    let engine = engine_with(&bus);
    let mut process = Process::new("careless sender");
    process.add_message(letter(MessageDirection::Outgoing)).unwrap();
    process
        .add_node(Node::task("send letter", TaskDefinition::send("letter_X", "Q")))
        .unwrap();

    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    let tracks = instance.tracks();
    assert_eq!(tracks[0].state, TrackState::Error);
    assert!(tracks[0].error.clone().unwrap().contains("Variable not found: x"));
    assert_eq!(bus.queue_len("Q"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_parallel_join_merges_tracks() {
    let (sink, out) = OutputSink::memory();
    let mut process = Process::new("split and join");
    let start = process.add_node(Node::start_event("start")).unwrap();
    let split = process
        .add_node(Node::gateway("split", GatewayKind::Parallel, GatewayDirection::Diverging))
        .unwrap();
    let a = process
        .add_node(Node::task("store a", TaskDefinition::store(vec![Variable::int("a", 1)])))
        .unwrap();
    let b = process
        .add_node(Node::task("store b", TaskDefinition::store(vec![Variable::int("b", 2)])))
        .unwrap();
    let join = process
        .add_node(Node::gateway("join", GatewayKind::Parallel, GatewayDirection::Converging))
        .unwrap();
    let print = process
        .add_node(Node::task("print", TaskDefinition::output(vec!["a", "b"], sink)))
        .unwrap();
    let end = process.add_node(Node::end_event("end")).unwrap();
    process.link(start, split).unwrap();
    process.link(split, a).unwrap();
    process.link(split, b).unwrap();
    process.link(a, join).unwrap();
    process.link(b, join).unwrap();
    process.link(join, print).unwrap();
    process.link(print, end).unwrap();

    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    assert_eq!(out.contents(), "a = 1\nb = 2\n");
    let tracks = instance.tracks();
    assert_eq!(tracks.len(), 2);
    let merged = tracks.iter().filter(|t| t.state == TrackState::Merged).count();
    let ended: Vec<_> = tracks.iter().filter(|t| t.state == TrackState::Ended).collect();
    assert_eq!(merged, 1);
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].node_name, "end");
    assert_eq!(ended[0].token_state, TokenState::Consumed);
    assert_eq!(instance.alive_tokens(), 0);
}

fn inclusive_process(sink: OutputSink, x: i64) -> Process {
    let mut process = Process::new("inclusive");
    let store = process
        .add_node(Node::task("store x", TaskDefinition::store(vec![Variable::int("x", x)])))
        .unwrap();
    let split = process
        .add_node(Node::gateway("split", GatewayKind::Inclusive, GatewayDirection::Diverging))
        .unwrap();
    let a = process
        .add_node(Node::task("store a", TaskDefinition::store(vec![Variable::int("a", 1)])))
        .unwrap();
    let b = process
        .add_node(Node::task("store b", TaskDefinition::store(vec![Variable::int("b", 1)])))
        .unwrap();
    let join = process
        .add_node(Node::gateway("join", GatewayKind::Inclusive, GatewayDirection::Converging))
        .unwrap();
    let print = process
        .add_node(Node::task("print", TaskDefinition::output(vec!["x"], sink)))
        .unwrap();
    process.link(store, split).unwrap();
    process.link_when(split, a, FlowCondition::expr("x > 1")).unwrap();
    process.link_when(split, b, FlowCondition::expr("x > 100")).unwrap();
    process.link(a, join).unwrap();
    process.link(b, join).unwrap();
    process.link(join, print).unwrap();
    process
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inclusive_join_with_one_active_branch() {
    let (sink, out) = OutputSink::memory();
    let process = inclusive_process(sink, 5);
    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    assert_eq!(out.contents(), "x = 5\n");
    assert_eq!(states(&instance), vec![TrackState::Ended]);
    assert!(!instance.variable_store().contains("b"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inclusive_join_waits_for_every_active_branch() {
    let (sink, out) = OutputSink::memory();
    let process = inclusive_process(sink, 500);
    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    assert_eq!(out.contents(), "x = 500\n");
    let mut states = states(&instance);
    states.sort_by_key(|s| s.to_string());
    assert_eq!(states, vec![TrackState::Ended, TrackState::Merged]);
    assert_eq!(instance.alive_tokens(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_user_task_waits_for_completion() {
    let (sink, out) = OutputSink::memory();
    let mut process = Process::new("approval");
    let review = process.add_node(Node::task("review", TaskDefinition::User)).unwrap();
    let print = process
        .add_node(Node::task("print", TaskDefinition::output(vec!["approved"], sink)))
        .unwrap();
    process.link(review, print).unwrap();

    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(instance.state(), InstanceState::Running);

    instance
        .complete_user_task(review, vec![Variable::bool("approved", true)])
        .unwrap();
    finish(&instance).await;
    assert_eq!(out.contents(), "approved = true\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_data_input_fails_before_running() {
    let (sink, out) = OutputSink::memory();
    let mut process = Process::new("data");
    let task = process
        .add_node(Node::task("svc", TaskDefinition::Service).with_data(DataSet {
            inputs: vec![Parameter::new("amount", VarType::Float)],
            outputs: Vec::new(),
        }))
        .unwrap();
    let print = process
        .add_node(Node::task("print", TaskDefinition::output(vec!["amount"], sink)))
        .unwrap();
    process.link(task, print).unwrap();

    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    let tracks = instance.tracks();
    assert_eq!(tracks[0].state, TrackState::Error);
    assert_eq!(tracks[0].node_name, "svc");
    assert_eq!(out.contents(), "");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_process_cancels_its_instances() {
    let mut process = Process::new("waiting");
    process.add_node(Node::task("review", TaskDefinition::User)).unwrap();
    let process_id: Id = process.id;

    let engine = engine();
    let first = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    let second = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    assert_eq!(engine.instances(process_id).len(), 2);

    assert_eq!(engine.stop_process(process_id), 2);
    finish(&first).await;
    finish(&second).await;
    assert!(first.tracks()[0].cancelled);
    assert!(second.tracks()[0].cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exclusive_join_passes_first_arrival_only() {
    let (sink, out) = OutputSink::memory();
    let mut process = Process::new("exclusive merge");
    let store = process
        .add_node(Node::task("store x", TaskDefinition::store(vec![Variable::int("x", 1)])))
        .unwrap();
    let fork = process.add_node(Node::task("fork", TaskDefinition::Service)).unwrap();
    let a = process.add_node(Node::task("a", TaskDefinition::Service)).unwrap();
    let b = process.add_node(Node::task("b", TaskDefinition::Service)).unwrap();
    let merge = process
        .add_node(Node::gateway("merge", GatewayKind::Exclusive, GatewayDirection::Converging))
        .unwrap();
    let print = process
        .add_node(Node::task("print", TaskDefinition::output(vec!["x"], sink)))
        .unwrap();
    process.link(store, fork).unwrap();
    process.link(fork, a).unwrap();
    process.link(fork, b).unwrap();
    process.link(a, merge).unwrap();
    process.link(b, merge).unwrap();
    process.link(merge, print).unwrap();

    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    assert_eq!(out.contents(), "x = 1\n");
    let mut states = states(&instance);
    states.sort_by_key(|s| s.to_string());
    assert_eq!(states, vec![TrackState::Ended, TrackState::Merged]);
    assert_eq!(instance.alive_tokens(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loop_back_through_exclusive_join_passes() {
    let (sink, out) = OutputSink::memory();
    let mut process = Process::new("review loop");
    let store = process
        .add_node(Node::task("store x", TaskDefinition::store(vec![Variable::int("x", 3)])))
        .unwrap();
    let merge = process
        .add_node(Node::gateway("merge", GatewayKind::Exclusive, GatewayDirection::Converging))
        .unwrap();
    let review = process.add_node(Node::task("review", TaskDefinition::User)).unwrap();
    let decide = process
        .add_node(Node::gateway("done?", GatewayKind::Exclusive, GatewayDirection::Diverging))
        .unwrap();
    let print = process
        .add_node(Node::task("print", TaskDefinition::output(vec!["x"], sink)))
        .unwrap();
    process.link(store, merge).unwrap();
    process.link(merge, review).unwrap();
    process.link(review, decide).unwrap();
    process.link_when(decide, print, FlowCondition::expr("done")).unwrap();
    let again = process.link(decide, merge).unwrap();
    process.set_default_flow(decide, again).unwrap();

    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    instance
        .complete_user_task(review, vec![Variable::bool("done", false)])
        .unwrap();

    // store, merge, review, done?, merge, review
    wait_until("second review", || {
        let tracks = instance.tracks();
        tracks[0].steps == 6 && tracks[0].state == TrackState::Executing
    })
    .await;
    instance
        .complete_user_task(review, vec![Variable::bool("done", true)])
        .unwrap();
    finish(&instance).await;

    assert_eq!(out.contents(), "x = 3\n");
    assert_eq!(states(&instance), vec![TrackState::Ended]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mixed_gateway_joins_then_selects() {
    let (hit, hit_out) = OutputSink::memory();
    let (miss, miss_out) = OutputSink::memory();
    let mut process = Process::new("mixed");
    let fork = process.add_node(Node::task("fork", TaskDefinition::Service)).unwrap();
    let a = process
        .add_node(Node::task("store a", TaskDefinition::store(vec![Variable::int("a", 1)])))
        .unwrap();
    let b = process
        .add_node(Node::task("store b", TaskDefinition::store(vec![Variable::int("b", 2)])))
        .unwrap();
    let mix = process
        .add_node(Node::gateway("mix", GatewayKind::Inclusive, GatewayDirection::Mixed))
        .unwrap();
    let print_b = process
        .add_node(Node::task("print b", TaskDefinition::output(vec!["a", "b"], hit)))
        .unwrap();
    let print_a = process
        .add_node(Node::task("print a", TaskDefinition::output(vec!["a"], miss)))
        .unwrap();
    process.link(fork, a).unwrap();
    process.link(fork, b).unwrap();
    process.link(a, mix).unwrap();
    process.link(b, mix).unwrap();
    process.link_when(mix, print_b, FlowCondition::expr("b > 1")).unwrap();
    process.link_when(mix, print_a, FlowCondition::expr("a > 5")).unwrap();

    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    assert_eq!(hit_out.contents(), "a = 1\nb = 2\n");
    assert_eq!(miss_out.contents(), "");
    let mut states = states(&instance);
    states.sort_by_key(|s| s.to_string());
    assert_eq!(states, vec![TrackState::Ended, TrackState::Merged]);
}

/// fork -> {store a, approve (user task)} -> parallel join -> print a
fn held_join(sink: OutputSink) -> (Process, Id, Id) {
    let mut process = Process::new("held join");
    let fork = process.add_node(Node::task("fork", TaskDefinition::Service)).unwrap();
    let a = process
        .add_node(Node::task("store a", TaskDefinition::store(vec![Variable::int("a", 1)])))
        .unwrap();
    let approve = process.add_node(Node::task("approve", TaskDefinition::User)).unwrap();
    let join = process
        .add_node(Node::gateway("join", GatewayKind::Parallel, GatewayDirection::Converging))
        .unwrap();
    let print = process
        .add_node(Node::task("print", TaskDefinition::output(vec!["a"], sink)))
        .unwrap();
    process.link(fork, a).unwrap();
    process.link(fork, approve).unwrap();
    process.link(a, join).unwrap();
    process.link(approve, join).unwrap();
    process.link(join, print).unwrap();
    (process, approve, join)
}

fn waiting_at(instance: &Instance, gateway: Id) -> usize {
    instance
        .gatekeeper()
        .get(gateway)
        .map(|g| g.waiting())
        .unwrap_or(0)
}

fn blocked(instance: &Instance, join: Id) -> bool {
    waiting_at(instance, join) == 1
        && instance
            .tracks()
            .iter()
            .any(|t| t.node_name == "approve" && t.state == TrackState::Executing)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_alive_tokens_match_live_tracks_mid_run() {
    let (sink, out) = OutputSink::memory();
    let (process, approve, join) = held_join(sink);
    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();

    wait_until("join and user task to block", || blocked(&instance, join)).await;
    let live = instance
        .tracks()
        .iter()
        .filter(|t| !t.state.is_terminal())
        .count();
    assert_eq!(live, 2);
    assert_eq!(instance.alive_tokens(), live);

    instance.complete_user_task(approve, Vec::new()).unwrap();
    finish(&instance).await;

    assert_eq!(out.contents(), "a = 1\n");
    assert!(instance.tracks().iter().all(|t| t.state.is_terminal()));
    assert_eq!(instance.alive_tokens(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_withdraws_join_waiter() {
    let (sink, out) = OutputSink::memory();
    let (process, _approve, join) = held_join(sink);
    let engine = engine();
    let instance = engine.run_process(process.snapshot().unwrap(), Vec::new()).unwrap();

    wait_until("join and user task to block", || blocked(&instance, join)).await;
    instance.cancel();
    finish(&instance).await;

    assert_eq!(waiting_at(&instance, join), 0);
    let tracks = instance.tracks();
    assert_eq!(tracks.len(), 2);
    assert!(tracks.iter().all(|t| t.state == TrackState::Error && t.cancelled));
    assert_eq!(instance.alive_tokens(), 0);
    assert_eq!(out.contents(), "");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_receive_skips_envelopes_with_other_names() {
    let bus = InMemoryBus::new();
    let producer = Id::new();
    let noise = Message::new(
        "letter_Y",
        MessageDirection::Outgoing,
        vec![MessageVariable::required(Variable::int("x", 99))],
    );
    let wanted = letter(MessageDirection::Outgoing)
        .outgoing(vec![MessageVariable::required(Variable::int("x", 7))]);
    bus.put(producer, "Q", &noise).await.unwrap();
    bus.put(producer, "Q", &wanted).await.unwrap();

    let (sink, out) = OutputSink::memory();
    let mut receiver = Process::new("picky receiver");
    receiver.add_message(letter(MessageDirection::Incoming)).unwrap();
    let recv = receiver
        .add_node(Node::task("receive letter", TaskDefinition::receive("letter_X", "Q")))
        .unwrap();
    let print = receiver
        .add_node(Node::task("print x", TaskDefinition::output(vec!["x"], sink)))
        .unwrap();
    receiver.link(recv, print).unwrap();

    let engine = engine_with(&bus);
    let instance = engine.run_process(receiver.snapshot().unwrap(), Vec::new()).unwrap();
    finish(&instance).await;

    assert_eq!(out.contents(), "x = 7\n");
    assert_eq!(states(&instance), vec![TrackState::Ended]);
    assert_eq!(bus.queue_len("Q"), 2);
}
