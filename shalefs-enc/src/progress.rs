//! Shared progress counters for the build pipeline.
//!
//! Counters are bumped from many threads with relaxed atomics; the one
//! non-atomic value, the file currently being scanned, sits behind a coarse
//! mutex. The UI is expected to poll on a timer around [`UI_TICK`] rather
//! than being notified.

use std::{
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering::Relaxed},
    },
    time::Duration,
};

/// The suggested polling interval for progress consumers.
pub const UI_TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
pub struct Progress {
    /// Entries discovered while walking the source tree.
    pub files_found: AtomicU64,
    /// Regular files whose content has been fed through the segmenter.
    pub files_scanned: AtomicU64,
    /// Source bytes consumed by the segmenter.
    pub bytes_read: AtomicU64,
    /// Bytes covered by back-reference chunks instead of fresh block data.
    pub saved_bytes: AtomicU64,
    /// Blocks fully emitted to the output stream.
    pub blocks_written: AtomicU64,
    /// Compressed section payload bytes emitted.
    pub compressed_bytes: AtomicU64,
    /// Non-fatal per-file errors; the scan continues past them.
    pub errors: AtomicU64,

    cancel: AtomicBool,
    current_file: Mutex<String>,
}

impl Progress {
    /// Request cancellation of the whole build. In-flight block
    /// compressions complete, but no new work is admitted; the scan
    /// unwinds with an error and the output ends at the last fully-emitted
    /// section.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Relaxed)
    }

    pub fn set_current_file(&self, path: &Path) {
        let mut guard = self.current_file.lock().expect("not poisoned");
        guard.clear();
        guard.push_str(&path.display().to_string());
    }

    pub fn current_file(&self) -> String {
        self.current_file.lock().expect("not poisoned").clone()
    }

    /// Convenience for `fetch_add` with relaxed ordering.
    pub fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Relaxed)
    }
}
