//! End-to-end staging scenarios over the recording service.

mod common;

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use common::{Stage, seed};
use dyadio::api::{
    FileState, OpenFlags, Route, StagedContainer, StagedFile, StagedOpenOptions, with_staged_file,
};
use dyadio::config::LibraryConfig;
use dyadio::context::{
    clear_default, default_context, default_context_with, register_default, resolve_context,
};
use dyadio::error::{Operation, StageError, UsageError};
use dyadio::ffi::recording::RECORDING_NOT_FOUND;
use dyadio::ffi::{CallKind, RecordingService, ServiceCall};
use dyadio::Context;

// ============================================================================
// Producer side
// ============================================================================

#[test]
fn test_write_under_producer_root_produces_after_close() {
    let stage = Stage::new(true, false);
    let path = stage.out_path("a.bin");

    let mut file = StagedOpenOptions::new()
        .mode("wb")
        .context(&stage.ctx)
        .open(&path)
        .unwrap();
    assert_eq!(file.state(), FileState::OpenForWrite);
    file.write_all(b"produced bytes").unwrap();
    assert!(stage.svc.calls().is_empty(), "produce must wait for close");

    file.close().unwrap();
    assert_eq!(stage.svc.calls(), vec![ServiceCall::Produce(path.clone())]);
    assert_eq!(std::fs::read(&path).unwrap(), b"produced bytes");
}

#[test]
fn test_scoped_write_produces_once() {
    let stage = Stage::new(true, false);
    let path = stage.out_path("scoped.bin");
    let options = StagedOpenOptions::new().mode("w").context(&stage.ctx);

    let written = with_staged_file(&path, &options, |file| {
        file.write_all(b"12345")?;
        Ok(5)
    })
    .unwrap();

    assert_eq!(written, 5);
    assert_eq!(stage.svc.calls_of(CallKind::Produce), vec![ServiceCall::Produce(path)]);
}

#[test]
fn test_produce_failure_surfaces_after_close() {
    let stage = Stage::new(true, false);
    stage.svc.fail(CallKind::Produce, -11);
    let path = stage.out_path("failing.bin");

    let mut file = StagedOpenOptions::new()
        .mode("w")
        .context(&stage.ctx)
        .open(&path)
        .unwrap();
    file.write_all(b"data").unwrap();

    match file.close() {
        Err(StageError::OperationFailed { op, status }) => {
            assert_eq!(op, Operation::Produce);
            assert_eq!(status, -11);
        }
        other => panic!("unexpected {:?}", other),
    }
    // The local file is complete regardless
    assert_eq!(file.state(), FileState::Closed);
    assert_eq!(std::fs::read(&path).unwrap(), b"data");
}

#[test]
fn test_append_and_update_never_produce() {
    let stage = Stage::new(true, false);
    let path = stage.out_path("log.txt");
    seed(&path, b"start\n");

    for mode in ["a", "r+", "w+", "a+"] {
        let mut file = StagedOpenOptions::new()
            .mode(mode)
            .context(&stage.ctx)
            .open(&path)
            .unwrap();
        assert_eq!(file.route(), Route::Unmanaged, "{}", mode);
        assert_eq!(file.state(), FileState::OpenUnrouted, "{}", mode);
        file.write_all(b"x").unwrap();
        file.close().unwrap();
    }
    assert!(stage.svc.calls().is_empty());
}

// ============================================================================
// Consumer side
// ============================================================================

#[test]
fn test_read_under_consumer_root_consumes_before_open() {
    let stage = Stage::new(false, true);
    let path = stage.in_path("b.bin");
    seed(&path, b"staged in");

    let mut file = StagedOpenOptions::new()
        .mode("rb")
        .context(&stage.ctx)
        .open(&path)
        .unwrap();
    assert_eq!(stage.svc.calls(), vec![ServiceCall::Consume(path.clone())]);

    let mut contents = String::new();
    file.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "staged in");
    file.close().unwrap();
    assert_eq!(stage.svc.calls().len(), 1);
}

#[test]
fn test_read_with_metadata_uses_metadata_variant() {
    let stage = Stage::new(false, true);
    let path = stage.in_path("b.bin");
    seed(&path, b"x");
    stage.svc.add_metadata(&path, 4);

    let metadata = stage.ctx.get_metadata(&path, false).unwrap().unwrap();
    assert_eq!(metadata.owner_rank().unwrap(), 4);

    let file = StagedOpenOptions::new()
        .mode("r")
        .context(&stage.ctx)
        .metadata(&metadata)
        .open(&path)
        .unwrap();
    drop(file);

    assert_eq!(
        stage.svc.calls_of(CallKind::ConsumeWithMetadata),
        vec![ServiceCall::ConsumeWithMetadata {
            path: path.clone(),
            owner_rank: 4
        }]
    );
    assert_eq!(stage.svc.count(CallKind::Consume), 0);

    drop(metadata);
    assert_eq!(stage.svc.count(CallKind::FreeMetadata), 1);
    assert_eq!(stage.svc.live_records(), 0);
}

#[test]
fn test_directory_reads_are_not_consumed() {
    let stage = Stage::new(false, true);
    let dir = stage.in_path("sub");
    std::fs::create_dir(&dir).unwrap();

    let decision = dyadio::api::route(&dir, &OpenFlags::read_only(), &stage.ctx.roots()).unwrap();
    assert_eq!(decision.route, Route::Unmanaged);
}

#[test]
fn test_symlink_into_consumer_root_is_consumed() {
    let stage = Stage::new(false, true);
    let target = stage.in_path("real.bin");
    seed(&target, b"through a link");
    let link = stage.local_path("link.bin");
    std::os::unix::fs::symlink(&target, &link).unwrap();

    let file = StagedOpenOptions::new()
        .mode("r")
        .context(&stage.ctx)
        .open(&link)
        .unwrap();
    assert_eq!(file.path(), target.as_path());
    assert_eq!(stage.svc.calls(), vec![ServiceCall::Consume(target)]);
}

#[test]
fn test_consume_failure_propagates() {
    let stage = Stage::new(false, true);
    let path = stage.in_path("missing.bin");
    stage.svc.fail(CallKind::Consume, -20);

    let err = StagedOpenOptions::new()
        .mode("r")
        .context(&stage.ctx)
        .open(&path)
        .unwrap_err();
    assert!(matches!(
        err,
        StageError::OperationFailed {
            op: Operation::Consume,
            status: -20
        }
    ));
}

// ============================================================================
// Unmanaged paths
// ============================================================================

#[test]
fn test_no_roots_means_no_calls() {
    let stage = Stage::new(false, false);
    let path = stage.local_path("plain.txt");

    for mode in ["w", "wb", "r", "rb", "a", "r+", "w+", "a+"] {
        let mut file = StagedOpenOptions::new()
            .mode(mode)
            .context(&stage.ctx)
            .open(&path)
            .unwrap();
        assert_eq!(file.route(), Route::Unmanaged);
        if mode.starts_with('r') && !mode.contains('+') {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).unwrap();
        } else {
            file.write_all(b"z").unwrap();
        }
        file.close().unwrap();
    }
    assert!(stage.svc.calls().is_empty());
}

#[test]
fn test_unmanaged_io_matches_std() {
    let stage = Stage::new(true, true);
    let staged_path = stage.local_path("staged.bin");
    let plain_path = stage.local_path("plain.bin");
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

    let mut file = StagedOpenOptions::new()
        .mode("wb")
        .context(&stage.ctx)
        .open(&staged_path)
        .unwrap();
    file.write_all(&payload).unwrap();
    file.seek(SeekFrom::Start(100)).unwrap();
    file.write_all(b"patched").unwrap();
    file.close().unwrap();

    let mut plain = std::fs::File::create(&plain_path).unwrap();
    plain.write_all(&payload).unwrap();
    plain.seek(SeekFrom::Start(100)).unwrap();
    plain.write_all(b"patched").unwrap();
    drop(plain);

    assert_eq!(
        std::fs::read(&staged_path).unwrap(),
        std::fs::read(&plain_path).unwrap()
    );
    assert!(stage.svc.calls().is_empty());
}

#[test]
fn test_sibling_of_root_is_unmanaged() {
    let stage = Stage::new(true, false);
    let sibling: PathBuf = stage.base.join("out2");
    std::fs::create_dir(&sibling).unwrap();

    let file = StagedOpenOptions::new()
        .mode("w")
        .context(&stage.ctx)
        .open(sibling.join("a.bin"))
        .unwrap();
    assert_eq!(file.route(), Route::Unmanaged);
    drop(file);
    assert!(stage.svc.calls().is_empty());
}

// ============================================================================
// Metadata lookups
// ============================================================================

#[test]
fn test_missing_metadata_without_wait_is_none() {
    let stage = Stage::new(false, true);
    let path = stage.in_path("never-produced.bin");

    assert!(stage.ctx.get_metadata(&path, false).unwrap().is_none());
    assert!(stage.ctx.get_metadata_raw(&path, false).unwrap().is_none());

    match stage.ctx.get_metadata(&path, true) {
        Err(StageError::OperationFailed { op, status }) => {
            assert_eq!(op, Operation::GetMetadata);
            assert_eq!(status, RECORDING_NOT_FOUND);
        }
        other => panic!("unexpected {:?}", other),
    }
}

// ============================================================================
// Unavailable service
// ============================================================================

#[test]
fn test_missing_library_degrades_to_noops() {
    let ctx = Context::with_library(&LibraryConfig {
        library_path: Some(PathBuf::from("/nonexistent/dyadio-test/libdyad_core.so")),
        ..Default::default()
    })
    .unwrap();
    assert!(!ctx.is_available());

    ctx.init_from_environment().unwrap();
    assert!(!ctx.is_initialized());
    ctx.produce("/stage/out/a.bin").unwrap();
    ctx.consume("/stage/in/b.bin").unwrap();
    assert!(ctx.get_metadata("/stage/in/b.bin", true).unwrap().is_none());
    ctx.finalize().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.txt");
    let options = StagedOpenOptions::new().mode("w").context(&ctx);
    with_staged_file(&path, &options, |file| {
        file.write_all(b"still works")?;
        Ok(())
    })
    .unwrap();

    let options = StagedOpenOptions::new().mode("r").context(&ctx);
    let contents = with_staged_file(&path, &options, |file| {
        let mut s = String::new();
        file.read_to_string(&mut s)?;
        Ok(s)
    })
    .unwrap();
    assert_eq!(contents, "still works");
}

// ============================================================================
// Ambient default context
// ============================================================================

// The default slot is process-global, so everything touching it lives in this
// one test.
#[test]
fn test_default_context_registration() {
    let previous = clear_default();

    // A failed init is surfaced and leaves the slot empty
    let failing = Arc::new(RecordingService::new());
    failing.fail(CallKind::InitEnv, -7);
    let err = default_context_with(|| Ok(Context::with_service(failing.clone()))).unwrap_err();
    assert!(matches!(err, StageError::InitFailed { status: -7 }));
    assert!(clear_default().is_none());

    // Created lazily once, then shared; no library is installed here
    let first = default_context().unwrap();
    let second = default_context().unwrap();
    assert!(first.same_as(&second));
    assert!(!first.is_available());

    // The constructor is not consulted while a default exists
    let unused = Arc::new(RecordingService::new());
    let third = default_context_with(|| Ok(Context::with_service(unused.clone()))).unwrap();
    assert!(third.same_as(&first));
    assert!(unused.calls().is_empty());

    // Unmanaged I/O through the lazy default is plain file I/O
    let scratch = tempfile::tempdir().unwrap();
    let plain = scratch.path().join("plain.bin");
    let mut file = StagedFile::open(&plain, "w").unwrap();
    assert_eq!(file.route(), Route::Unmanaged);
    file.write_all(b"lazy").unwrap();
    file.close().unwrap();
    assert_eq!(std::fs::read(&plain).unwrap(), b"lazy");
    assert!(clear_default().unwrap().same_as(&first));

    let stage = Stage::new(true, false);
    register_default(stage.ctx.clone());

    let path = stage.out_path("via-default.bin");
    let mut file = StagedFile::open(&path, "w").unwrap();
    file.write_all(b"d").unwrap();
    file.close().unwrap();
    assert_eq!(stage.svc.calls_of(CallKind::Produce), vec![ServiceCall::Produce(path)]);

    // An explicit context with registration replaces the default
    let other = Stage::new(true, false);
    let chosen = resolve_context(Some(&other.ctx), true).unwrap();
    assert!(chosen.same_as(&other.ctx));
    assert!(resolve_context(None, false).unwrap().same_as(&other.ctx));

    // Without registration it does not
    let chosen = resolve_context(Some(&stage.ctx), false).unwrap();
    assert!(chosen.same_as(&stage.ctx));
    assert!(resolve_context(None, false).unwrap().same_as(&other.ctx));

    let cleared = clear_default().unwrap();
    assert!(cleared.same_as(&other.ctx));
    if let Some(previous) = previous {
        register_default(previous);
    }
}

// ============================================================================
// Containers
// ============================================================================

#[test]
fn test_container_consume_and_produce() {
    let stage = Stage::new(true, true);
    let input = stage.in_path("dataset.h5");
    seed(&input, b"container");
    stage.svc.add_metadata(&input, 2);
    let metadata = stage.ctx.get_metadata(&input, false).unwrap().unwrap();

    let container: StagedContainer<std::fs::File> =
        StagedContainer::open(&input, "r", &stage.ctx, Some(&metadata)).unwrap();
    assert_eq!(container.route(), Route::Consume);
    container.close().unwrap();

    let output = stage.out_path("result.h5");
    let mut container: StagedContainer<std::fs::File> =
        StagedContainer::open(&output, "w", &stage.ctx, None).unwrap();
    container.get_mut().write_all(b"out").unwrap();
    drop(container);

    let kinds: Vec<CallKind> = stage.svc.calls().iter().map(ServiceCall::kind).collect();
    assert_eq!(
        kinds,
        vec![
            CallKind::GetMetadata,
            CallKind::ConsumeWithMetadata,
            CallKind::Produce
        ]
    );
}

#[test]
fn test_missing_mode_is_usage_error() {
    let stage = Stage::new(true, true);
    let err = StagedOpenOptions::new()
        .context(&stage.ctx)
        .open(stage.out_path("a.bin"))
        .unwrap_err();
    assert!(matches!(err, StageError::Usage(UsageError::MissingMode)));

    let err = StagedOpenOptions::new()
        .mode("rw")
        .context(&stage.ctx)
        .open(stage.out_path("a.bin"))
        .unwrap_err();
    assert!(matches!(err, StageError::Usage(UsageError::InvalidMode(_))));
    assert!(stage.svc.calls().is_empty());
}
