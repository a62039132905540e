//! Context lifecycle: initialization, finalization and metadata ownership.
//!
//! The last section drives random operation sequences through a context with
//! proptest-state-machine and checks that connections and metadata records
//! are released exactly once.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::Stage;
use dyadio::config::StageOptions;
use dyadio::error::{Operation, StageError, UsageError};
use dyadio::ffi::{CallKind, RecordingService, ServiceCall};
use dyadio::{Context, MetadataHandle};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};

// ============================================================================
// Initialization
// ============================================================================

#[test]
fn test_init_with_options_reports_roots() {
    let dir = tempfile::tempdir().unwrap();
    let base = std::fs::canonicalize(dir.path()).unwrap();
    let svc = Arc::new(RecordingService::new());
    let ctx = Context::with_service(svc.clone());

    ctx.init(&StageOptions::default().producer(base.join("out")).consumer(base.join("in")))
        .unwrap();

    assert!(ctx.is_initialized());
    assert_eq!(ctx.producer_root(), Some(base.join("out")));
    assert_eq!(ctx.consumer_root(), Some(base.join("in")));
    assert!(ctx.is_producer_managed(base.join("out/a.bin")));
    assert!(!ctx.is_producer_managed(base.join("out")));
    assert!(ctx.is_consumer_managed(base.join("in/x/y.bin")));
    assert_eq!(
        svc.calls(),
        vec![ServiceCall::Init {
            producer: Some(base.join("out")),
            consumer: Some(base.join("in")),
            reinit: false,
        }]
    );
}

#[test]
fn test_second_init_requires_reinit() {
    let stage = Stage::new(true, false);

    let err = stage.ctx.init(&StageOptions::default()).unwrap_err();
    assert!(matches!(err, StageError::Usage(UsageError::AlreadyInitialized)));
    let err = stage.ctx.init_from_environment().unwrap_err();
    assert!(matches!(err, StageError::Usage(UsageError::AlreadyInitialized)));
    assert!(stage.svc.calls().is_empty());

    let consumer = stage.base.join("in");
    stage
        .ctx
        .init(&StageOptions::default().consumer(&consumer).reinit(true))
        .unwrap();

    let kinds: Vec<CallKind> = stage.svc.calls().iter().map(ServiceCall::kind).collect();
    assert_eq!(kinds, vec![CallKind::Finalize, CallKind::Init]);
    assert_eq!(stage.svc.live_connections(), 1);
    assert_eq!(stage.ctx.producer_root(), None);
    assert_eq!(stage.ctx.consumer_root(), Some(consumer));
}

#[test]
fn test_init_failure_leaves_context_uninitialized() {
    let svc = Arc::new(RecordingService::new());
    svc.fail(CallKind::InitEnv, -3);
    let ctx = Context::with_service(svc.clone());

    let err = ctx.init_from_environment().unwrap_err();
    assert!(matches!(err, StageError::InitFailed { status: -3 }));
    assert!(!ctx.is_initialized());

    // Operations on an uninitialized context are no-ops
    ctx.produce("/stage/out/a.bin").unwrap();
    assert!(ctx.get_metadata("/stage/in/b.bin", true).unwrap().is_none());
    assert_eq!(svc.count(CallKind::Produce), 0);
    assert_eq!(svc.count(CallKind::GetMetadata), 0);

    svc.succeed(CallKind::InitEnv);
    ctx.init_from_environment().unwrap();
    assert!(ctx.is_initialized());
}

#[test]
fn test_namespace_with_nul_is_rejected() {
    let svc = Arc::new(RecordingService::new());
    let ctx = Context::with_service(svc.clone());
    let options = StageOptions {
        kvs_namespace: Some("bad\0ns".to_string()),
        ..Default::default()
    };

    let err = ctx.init(&options).unwrap_err();
    assert!(matches!(err, StageError::Usage(UsageError::InvalidOption(_))));
    assert!(svc.calls().is_empty());
}

// ============================================================================
// Finalization
// ============================================================================

#[test]
fn test_finalize_is_idempotent() {
    let stage = Stage::new(true, true);

    stage.ctx.finalize().unwrap();
    stage.ctx.finalize().unwrap();
    assert!(!stage.ctx.is_initialized());
    assert_eq!(stage.ctx.producer_root(), None);

    drop(stage.ctx.clone());
    assert_eq!(stage.svc.count(CallKind::Finalize), 1);
    assert_eq!(stage.svc.double_releases(), 0);
}

#[test]
fn test_finalize_failure_still_releases() {
    let stage = Stage::new(true, false);
    stage.svc.fail(CallKind::Finalize, -1);

    match stage.ctx.finalize() {
        Err(StageError::OperationFailed { op, status }) => {
            assert_eq!(op, Operation::Finalize);
            assert_eq!(status, -1);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!stage.ctx.is_initialized());
    stage.ctx.finalize().unwrap();
    assert_eq!(stage.svc.count(CallKind::Finalize), 1);
}

#[test]
fn test_last_clone_finalizes() {
    let svc = Arc::new(RecordingService::new());
    let ctx = Context::with_service(svc.clone());
    ctx.init_from_environment().unwrap();

    let clone = ctx.clone();
    assert!(clone.same_as(&ctx));
    drop(ctx);
    assert_eq!(svc.count(CallKind::Finalize), 0);

    drop(clone);
    assert_eq!(svc.count(CallKind::Finalize), 1);
    assert_eq!(svc.live_connections(), 0);
}

// ============================================================================
// Metadata ownership
// ============================================================================

#[test]
fn test_foreign_metadata_rejected() {
    let first = Stage::new(false, true);
    let second = Stage::new(false, true);
    let path = first.in_path("b.bin");
    first.svc.add_metadata(&path, 1);

    let metadata = first.ctx.get_metadata(&path, false).unwrap().unwrap();
    let err = second
        .ctx
        .consume_with_metadata(second.in_path("b.bin"), &metadata)
        .unwrap_err();
    assert!(matches!(err, StageError::Usage(UsageError::ForeignMetadata)));

    let raw = first.ctx.get_metadata_raw(&path, false).unwrap().unwrap();
    let err = second.ctx.free_metadata(raw).unwrap_err();
    assert!(matches!(err, StageError::Usage(UsageError::ForeignMetadata)));
    assert_eq!(second.svc.calls().len(), 0);
}

#[test]
fn test_released_metadata_rejected() {
    let stage = Stage::new(false, true);
    let path = stage.in_path("b.bin");
    stage.svc.add_metadata(&path, 1);

    let mut metadata = stage.ctx.get_metadata(&path, false).unwrap().unwrap();
    metadata.release().unwrap();

    let err = stage.ctx.consume_with_metadata(&path, &metadata).unwrap_err();
    assert!(matches!(err, StageError::Usage(UsageError::MetadataReleased)));
    assert_eq!(stage.svc.count(CallKind::ConsumeWithMetadata), 0);
}

// ============================================================================
// Random operation sequences
// ============================================================================

const FILES: [&str; 3] = ["a.bin", "b.bin", "c.bin"];

#[derive(Clone, Debug)]
pub enum Transition {
    InitEnv,
    Reinit,
    Finalize,
    Produce { file: usize },
    GetMetadata { file: usize },
    ReleaseFirst,
    DropLast,
}

/// Expected connection and record counts
#[derive(Clone, Debug, Default)]
pub struct LifecycleRef {
    initialized: bool,
    handles: usize,
    produced: usize,
}

impl ReferenceStateMachine for LifecycleRef {
    type State = Self;
    type Transition = Transition;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            Just(Transition::InitEnv),
            Just(Transition::Reinit),
            Just(Transition::Finalize),
            (0..FILES.len()).prop_map(|file| Transition::Produce { file }),
            (0..FILES.len()).prop_map(|file| Transition::GetMetadata { file }),
            Just(Transition::ReleaseFirst),
            Just(Transition::DropLast),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            Transition::InitEnv | Transition::Reinit => state.initialized = true,
            Transition::Finalize => state.initialized = false,
            Transition::Produce { .. } => {
                if state.initialized {
                    state.produced += 1;
                }
            }
            Transition::GetMetadata { .. } => {
                if state.initialized {
                    state.handles += 1;
                }
            }
            Transition::ReleaseFirst | Transition::DropLast => {
                state.handles = state.handles.saturating_sub(1);
            }
        }
        state
    }
}

pub struct LifecycleTest {
    stage: Stage,
    handles: Vec<MetadataHandle>,
}

impl LifecycleTest {
    fn path(&self, file: usize) -> PathBuf {
        self.stage.out_path(FILES[file])
    }
}

impl StateMachineTest for LifecycleTest {
    type SystemUnderTest = Self;
    type Reference = LifecycleRef;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        let stage = Stage::new(true, true);
        stage.ctx.finalize().unwrap();
        for file in FILES {
            stage.svc.add_metadata(stage.out_path(file), 0);
        }
        Self {
            stage,
            handles: Vec::new(),
        }
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        let ctx = &state.stage.ctx;
        match transition {
            Transition::InitEnv => {
                if ctx.is_initialized() {
                    let err = ctx.init_from_environment().unwrap_err();
                    assert!(matches!(err, StageError::Usage(UsageError::AlreadyInitialized)));
                } else {
                    ctx.init_from_environment().unwrap();
                }
            }
            Transition::Reinit => {
                let options = StageOptions::default()
                    .producer(&state.stage.out)
                    .consumer(&state.stage.input)
                    .reinit(true);
                ctx.init(&options).unwrap();
            }
            Transition::Finalize => ctx.finalize().unwrap(),
            Transition::Produce { file } => {
                let path = state.path(file);
                state.stage.ctx.produce(path).unwrap();
            }
            Transition::GetMetadata { file } => {
                let path = state.path(file);
                if let Some(handle) = state.stage.ctx.get_metadata(path, false).unwrap() {
                    state.handles.push(handle);
                }
            }
            Transition::ReleaseFirst => {
                if !state.handles.is_empty() {
                    let mut handle = state.handles.remove(0);
                    handle.release().unwrap();
                    assert!(handle.is_released());
                }
            }
            Transition::DropLast => {
                state.handles.pop();
            }
        }
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        let svc = &state.stage.svc;
        assert_eq!(state.stage.ctx.is_initialized(), ref_state.initialized);
        assert_eq!(svc.live_connections(), usize::from(ref_state.initialized));
        assert_eq!(svc.live_records(), ref_state.handles);
        assert_eq!(state.handles.len(), ref_state.handles);
        assert_eq!(svc.count(CallKind::Produce), ref_state.produced);
        assert_eq!(svc.double_releases(), 0);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn pbt_context_lifecycle(
        sequential 1..30 => LifecycleTest
    );
}
