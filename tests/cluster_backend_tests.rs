//! Cluster backend tests over the in-memory job client: idempotent
//! submission, recovery by a second runner, and job shape.

use std::sync::Arc;
use std::time::Duration;

use scenerun::config::ExecutionMode;
use scenerun::controller::Controller;
use scenerun::engine::Engine;
use scenerun::phase::PlayPhase;
use scenerun::provision::MemoryProvisioner;
use scenerun::scheduler::cluster::{
    BatchJob, ClusterJobBackend, InMemoryJobClient, JobClient, JobConditionType,
};
use scenerun::scheduler::{self, SchedulerBackend, StatusWriter};
use scenerun::store::{MemoryStore, PlayStore};
use scenerun::types::{
    Action, Container, FRAME_LABEL, Frame, PLAY_LABEL, Play, PlayKey, PlaySpec, Scene, Screenplay,
};

// =============================================================================
// Helpers
// =============================================================================

fn frame(name: &str) -> Frame {
    Frame {
        name: name.to_string(),
        action: Action {
            containers: vec![Container::with_command(name, ["true"])],
            ..Action::default()
        },
        ..Frame::default()
    }
}

fn frame_with_id(name: &str, id: &str, copies: u32) -> Frame {
    Frame {
        id: id.to_string(),
        copies,
        ..frame(name)
    }
}

fn play(name: &str, scenes: Vec<Vec<Frame>>) -> Play {
    Play::new(
        "ci",
        name,
        PlaySpec {
            screenplays: vec![Screenplay {
                name: "main".to_string(),
                scenes: scenes
                    .into_iter()
                    .enumerate()
                    .map(|(i, frames)| Scene {
                        name: format!("scene-{}", i),
                        frames,
                        ..Scene::default()
                    })
                    .collect(),
            }],
            ..PlaySpec::default()
        },
    )
}

/// One engine process sharing the cluster state with any others.
fn engine(store: &Arc<MemoryStore>, client: &Arc<InMemoryJobClient>) -> Engine {
    let writer = Arc::new(StatusWriter::new(store.clone(), 5));
    let backend = ClusterJobBackend::new(client.clone(), writer)
        .with_poll_interval(Duration::from_millis(50));
    Engine::new(store.clone(), Arc::new(backend), Arc::new(MemoryProvisioner::new()))
        .with_requeue_interval(Duration::from_millis(50))
}

/// Reconciles until the Play is `Running` with its first scene submitted.
fn start(engine: &Engine, key: &PlayKey) {
    for _ in 0..3 {
        engine.reconcile(key).expect("reconcile");
    }
    assert_eq!(engine.store().get(key).expect("get").phase(), Some(PlayPhase::Running));
}

fn job_for(play: &Play, frame_name: &str) -> String {
    let frame = play
        .frames()
        .find(|f| f.name == frame_name)
        .expect("frame exists");
    scheduler::job_name(play.name(), &frame.id)
}

// =============================================================================
// Idempotence
// =============================================================================

#[test]
fn test_repeated_reconciles_create_each_job_once() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let engine = engine(&store, &client);
    let key = store
        .create(play("steady", vec![vec![frame("a"), frame("b")]]))
        .expect("create")
        .key();

    start(&engine, &key);
    for _ in 0..5 {
        let outcome = engine.reconcile(&key).expect("reconcile");
        assert_eq!(outcome.phase, Some(PlayPhase::Running));
    }
    assert_eq!(client.created_count(), 2);
}

#[test]
fn test_finished_frame_is_never_resubmitted() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let engine = engine(&store, &client);
    let key = store
        .create(play("partial", vec![vec![frame("done"), frame("todo")]]))
        .expect("create")
        .key();

    // Walk to Running without submitting anything
    engine.reconcile(&key).expect("to init");
    engine.reconcile(&key).expect("to running");
    let running = store.get(&key).expect("get");
    let done_id = running
        .frames()
        .find(|f| f.name == "done")
        .map(|f| f.id.clone())
        .expect("frame");
    engine
        .backend()
        .record_frame_result(&key, &done_id, 0)
        .expect("record");

    engine.reconcile(&key).expect("submit");
    let jobs = client.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].metadata.name, job_for(&running, "todo"));
}

#[test]
fn test_first_recorded_result_wins() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let engine = engine(&store, &client);
    let key = store.create(play("once", vec![vec![frame("a")]])).expect("create").key();
    start(&engine, &key);

    let id = store.get(&key).expect("get").frames().next().expect("frame").id.clone();
    engine.backend().record_frame_result(&key, &id, 1).expect("first");
    let play = engine.backend().record_frame_result(&key, &id, 0).expect("second");
    assert_eq!(play.frame_result(&id), Some(1));
}

// =============================================================================
// Recovery
// =============================================================================

#[test]
fn test_second_runner_adopts_running_play() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let key = store
        .create(play("handover", vec![vec![frame("a"), frame("b")], vec![frame("c")]]))
        .expect("create")
        .key();

    let first = engine(&store, &client);
    start(&first, &key);
    assert_eq!(client.created_count(), 2);
    let first_runner = first.runner_id().to_string();
    drop(first);

    // One job finishes while no engine is running
    let stored = store.get(&key).expect("get");
    client
        .set_condition("ci", &job_for(&stored, "a"), JobConditionType::Complete)
        .expect("complete a");

    let second = engine(&store, &client);
    assert_ne!(second.runner_id(), first_runner);
    second.reconcile(&key).expect("adopt");

    let adopted = store.get(&key).expect("get");
    assert_eq!(adopted.status.runner, second.runner_id());
    assert_eq!(client.created_count(), 2, "running jobs are attached, not recreated");
    assert_eq!(adopted.frame_result(&adopted.frames().find(|f| f.name == "a").expect("a").id), Some(0));

    client
        .set_condition("ci", &job_for(&adopted, "b"), JobConditionType::Complete)
        .expect("complete b");
    second.reconcile(&key).expect("next scene");
    assert_eq!(client.created_count(), 3);

    client
        .set_condition("ci", &job_for(&adopted, "c"), JobConditionType::Complete)
        .expect("complete c");
    let outcome = second.reconcile(&key).expect("finish");
    assert_eq!(outcome.phase, Some(PlayPhase::Complete));
}

#[test]
fn test_adopting_runner_in_blocking_mode() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let key = store.create(play("resume", vec![vec![frame("a")]])).expect("create").key();

    let first = engine(&store, &client);
    start(&first, &key);
    drop(first);

    let stored = store.get(&key).expect("get");
    client
        .set_condition("ci", &job_for(&stored, "a"), JobConditionType::Failed)
        .expect("fail a");

    let second = Arc::new(engine(&store, &client).with_mode(ExecutionMode::Blocking));
    let controller = Controller::new(second, Duration::from_millis(100)).expect("controller");
    let phases = controller
        .run_until_terminal(std::slice::from_ref(&key), Some(Duration::from_secs(10)))
        .expect("run");

    assert_eq!(phases.get(&key), Some(&PlayPhase::Failed));
    assert_eq!(client.created_count(), 1);
}

// =============================================================================
// Failures and job shape
// =============================================================================

#[test]
fn test_create_failure_ends_in_error() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    client.fail_creates("admission denied").expect("configure");
    let engine = engine(&store, &client);
    let key = store.create(play("denied", vec![vec![frame("a")]])).expect("create").key();

    engine.reconcile(&key).expect("to init");
    engine.reconcile(&key).expect("to running");
    let outcome = engine.reconcile(&key).expect("submit");
    assert_eq!(outcome.phase, Some(PlayPhase::Error));
}

#[test]
fn test_jobs_are_labelled_and_owned() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let engine = engine(&store, &client);
    let key = store.create(play("labelled", vec![vec![frame("a")]])).expect("create").key();
    start(&engine, &key);

    let play = store.get(&key).expect("get");
    let frame = play.frames().next().expect("frame");
    let job: BatchJob = client
        .get("ci", &scheduler::job_name(play.name(), &frame.id))
        .expect("job exists");

    assert_eq!(job.metadata.labels.get(PLAY_LABEL).map(String::as_str), Some("labelled"));
    assert_eq!(job.metadata.labels.get(FRAME_LABEL), Some(&frame.id));
    assert_eq!(job.metadata.owner_references.len(), 1);
    assert_eq!(job.metadata.owner_references[0].uid, play.metadata.uid);
    assert_eq!(job.spec.backoff_limit, Some(0));
    assert_eq!(job.exit_code(), None);
}

#[test]
fn test_long_play_names_are_truncated() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let engine = engine(&store, &client);
    let name = "a-very-long-play-name-that-keeps-going-and-going-and-going";
    let key = store.create(play(name, vec![vec![frame("a")]])).expect("create").key();
    start(&engine, &key);

    let jobs = client.jobs();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].metadata.name.len() <= scheduler::MAX_JOB_NAME_LENGTH);
    assert!(jobs[0].metadata.name.starts_with(&name[..scheduler::JOB_NAME_PLAY_CHARS]));
}

// =============================================================================
// Job name collisions
// =============================================================================

/// Walks a Play through `Init` and returns the phase it lands in.
fn initialize(engine: &Engine, key: &PlayKey) -> Option<PlayPhase> {
    engine.reconcile(key).expect("to init");
    engine.reconcile(key).expect("init").phase
}

#[test]
fn test_ids_sharing_a_job_name_end_in_error() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let engine = engine(&store, &client);
    let key = store
        .create(play(
            "build",
            vec![vec![
                frame_with_id("a", "integration-test-a", 1),
                frame_with_id("b", "integration-test-b", 1),
            ]],
        ))
        .expect("create")
        .key();

    assert_eq!(initialize(&engine, &key), Some(PlayPhase::Error));
    for _ in 0..3 {
        engine.reconcile(&key).expect("reconcile");
    }
    let stored = store.get(&key).expect("get");
    assert_eq!(stored.phase(), Some(PlayPhase::Error));
    assert!(stored.status.frames.is_empty(), "no frame is recorded");
    assert_eq!(client.created_count(), 0);
}

#[test]
fn test_copies_sharing_a_job_name_end_in_error() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let engine = engine(&store, &client);
    let key = store
        .create(play("sharded", vec![vec![frame_with_id("suite", "shardedtestsuite", 3)]]))
        .expect("create")
        .key();

    assert_eq!(initialize(&engine, &key), Some(PlayPhase::Error));
    engine.reconcile(&key).expect("finalize");
    assert_eq!(client.created_count(), 0);
}

#[test]
fn test_explicit_id_clashing_with_a_copy_ends_in_error() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let engine = engine(&store, &client);
    let key = store
        .create(play(
            "clash",
            vec![vec![frame_with_id("x", "x", 2)], vec![frame_with_id("y", "x-0", 1)]],
        ))
        .expect("create")
        .key();

    assert_eq!(initialize(&engine, &key), Some(PlayPhase::Error));
    assert_eq!(client.created_count(), 0);
}

#[test]
fn test_distinct_job_names_each_get_a_job() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let engine = engine(&store, &client);
    let key = store
        .create(play(
            "build",
            vec![vec![
                frame_with_id("a", "integration-a", 1),
                frame_with_id("b", "integration-b", 1),
                frame_with_id("shard", "shard", 3),
            ]],
        ))
        .expect("create")
        .key();
    start(&engine, &key);

    let mut names: Vec<String> = client.jobs().into_iter().map(|j| j.metadata.name).collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "build-integration-a",
            "build-integration-b",
            "build-shard-0",
            "build-shard-1",
            "build-shard-2",
        ]
    );

    for name in &names {
        client
            .set_condition("ci", name, JobConditionType::Complete)
            .expect("complete");
    }
    let outcome = engine.reconcile(&key).expect("collect");
    assert_eq!(outcome.phase, Some(PlayPhase::Complete));
    assert_eq!(store.get(&key).expect("get").status.frames.len(), 5);
}

#[test]
fn test_invalid_names_end_in_error_before_submission() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(InMemoryJobClient::new());
    let engine = engine(&store, &client);
    let key = store
        .create(play("Build_Nightly", vec![vec![frame("a")]]))
        .expect("create")
        .key();

    assert_eq!(initialize(&engine, &key), Some(PlayPhase::Error));
    assert_eq!(client.created_count(), 0);
}
