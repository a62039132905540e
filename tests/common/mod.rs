//! Shared fixtures: a temporary staging area and a context over the
//! recording service.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dyadio::Context;
use dyadio::ffi::RecordingService;
use tempfile::TempDir;

pub struct Stage {
    _dir: TempDir,
    /// Canonical temp directory
    pub base: PathBuf,
    /// Producer root (`<base>/out`)
    pub out: PathBuf,
    /// Consumer root (`<base>/in`)
    pub input: PathBuf,
    /// Outside both roots (`<base>/local`)
    pub local: PathBuf,
    pub svc: Arc<RecordingService>,
    pub ctx: Context,
}

impl Stage {
    /// Initialized context whose service reports the requested roots
    pub fn new(producer: bool, consumer: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let out = base.join("out");
        let input = base.join("in");
        let local = base.join("local");
        for d in [&out, &input, &local] {
            std::fs::create_dir(d).unwrap();
        }

        let svc = Arc::new(RecordingService::new().with_env_roots(
            producer.then_some(out.as_path()),
            consumer.then_some(input.as_path()),
        ));
        let ctx = Context::with_service(svc.clone());
        ctx.init_from_environment().unwrap();
        svc.clear_calls();

        Self {
            _dir: dir,
            base,
            out,
            input,
            local,
            svc,
            ctx,
        }
    }

    pub fn out_path(&self, name: &str) -> PathBuf {
        self.out.join(name)
    }

    pub fn in_path(&self, name: &str) -> PathBuf {
        self.input.join(name)
    }

    pub fn local_path(&self, name: &str) -> PathBuf {
        self.local.join(name)
    }
}

/// Write `contents` to `path` without going through the staging layer
pub fn seed(path: &Path, contents: &[u8]) {
    std::fs::write(path, contents).unwrap();
}
