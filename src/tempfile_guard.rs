//! Process-scoped guard over temp files the `collection snapshot`/`restore`
//! commands create locally (e.g. while staging a download before handing it
//! to Qdrant). Files are created with exclusive-create semantics and are
//! removed on success, on normal process exit, and on SIGINT/SIGTERM.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

static REGISTRY: OnceLock<Arc<Mutex<HashSet<PathBuf>>>> = OnceLock::new();

fn registry() -> Arc<Mutex<HashSet<PathBuf>>> {
    REGISTRY
        .get_or_init(|| Arc::new(Mutex::new(HashSet::new())))
        .clone()
}

/// A handle to a temp file created via [`create_exclusive`]. Dropping it
/// removes the file from disk and from the process registry.
pub struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        release(&self.path);
    }
}

/// Creates `path` with `O_EXCL` semantics (fails if it already exists) and
/// registers it for cleanup.
pub fn create_exclusive(path: impl Into<PathBuf>) -> std::io::Result<TempFileGuard> {
    let path = path.into();
    OpenOptions::new().write(true).create_new(true).open(&path)?;
    registry().lock().unwrap().insert(path.clone());
    Ok(TempFileGuard { path })
}

fn release(path: &Path) {
    let mut guard = registry().lock().unwrap();
    if guard.remove(path) {
        let _ = std::fs::remove_file(path);
    }
}

/// Removes every temp file still registered. Called from the SIGINT/SIGTERM
/// handler and at the end of `main` as a last-resort sweep.
pub fn cleanup_all() {
    let mut guard = registry().lock().unwrap();
    for path in guard.drain() {
        let _ = std::fs::remove_file(&path);
    }
}

/// Registers SIGINT/SIGTERM against a shared flag and spawns a watcher
/// thread that sweeps [`cleanup_all`] and exits once either fires. Must be
/// called once, early in `main`.
pub fn install_signal_cleanup() -> Result<(), std::io::Error> {
    use std::sync::atomic::{AtomicBool, Ordering};

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())?;

    std::thread::spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(200));
        }
        cleanup_all();
        std::process::exit(130);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_exclusive_fails_on_existing_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("chessmate-test-{}.tmp", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let guard = create_exclusive(&path).unwrap();
        assert!(path.exists());
        assert!(create_exclusive(&path).is_err());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_all_removes_every_registered_file() {
        let dir = std::env::temp_dir();
        let a = dir.join(format!("chessmate-test-a-{}.tmp", std::process::id()));
        let b = dir.join(format!("chessmate-test-b-{}.tmp", std::process::id()));
        let _ = std::fs::remove_file(&a);
        let _ = std::fs::remove_file(&b);
        let ga = create_exclusive(&a).unwrap();
        let gb = create_exclusive(&b).unwrap();
        std::mem::forget(ga);
        std::mem::forget(gb);
        cleanup_all();
        assert!(!a.exists());
        assert!(!b.exists());
    }
}
