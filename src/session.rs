//! The session: the public surface of an index.
//!
//! A session owns the running index and the callback worker. Operations
//! are asynchronous: `post`, `update`, `query`, and `delete` enqueue a
//! request and return; the supplied callback runs later on the callback
//! thread with the outcome (`found`, location, old and new metadata,
//! status). `flush` waits until every outstanding request has called
//! back, which is also how `save`, `suspend`, and `close` quiesce the
//! pipeline.
//!
//! A session may be shared across threads (`&self` methods throughout);
//! one session serves one index, and the index's backing file is locked
//! against other processes for the session's lifetime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::info;

use crate::config::{IndexConfig, IndexName};
use crate::error::{Error, Result};
use crate::index::{save_index, Index, IndexCore, IndexStats, LoadContext, LoadType, OpenMode};
use crate::layout::Layout;
use crate::name::{ChunkData, ChunkName};
use crate::request::{Location, Request, RequestKind};

/// Per-session request counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SessionStats {
    pub requests: u64,
    pub posts_found: u64,
    pub posts_not_found: u64,
    pub queries_found: u64,
    pub queries_not_found: u64,
    pub updates_found: u64,
    pub updates_not_found: u64,
    pub deletions_found: u64,
    pub deletions_not_found: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    posts_found: AtomicU64,
    posts_not_found: AtomicU64,
    queries_found: AtomicU64,
    queries_not_found: AtomicU64,
    updates_found: AtomicU64,
    updates_not_found: AtomicU64,
    deletions_found: AtomicU64,
    deletions_not_found: AtomicU64,
}

impl Counters {
    fn tally(&self, request: &Request) {
        let (found, not_found) = match request.kind {
            RequestKind::Post => (&self.posts_found, &self.posts_not_found),
            RequestKind::Update => (&self.updates_found, &self.updates_not_found),
            RequestKind::Query { .. } => (&self.queries_found, &self.queries_not_found),
            RequestKind::Delete => (&self.deletions_found, &self.deletions_not_found),
        };
        if request.found {
            found.fetch_add(1, Ordering::Relaxed);
        } else {
            not_found.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            requests: self.requests.load(Ordering::Relaxed),
            posts_found: self.posts_found.load(Ordering::Relaxed),
            posts_not_found: self.posts_not_found.load(Ordering::Relaxed),
            queries_found: self.queries_found.load(Ordering::Relaxed),
            queries_not_found: self.queries_not_found.load(Ordering::Relaxed),
            updates_found: self.updates_found.load(Ordering::Relaxed),
            updates_not_found: self.updates_not_found.load(Ordering::Relaxed),
            deletions_found: self.deletions_found.load(Ordering::Relaxed),
            deletions_not_found: self.deletions_not_found.load(Ordering::Relaxed),
        }
    }
}

struct Outstanding {
    count: Mutex<u64>,
    drained: Condvar,
}

impl Outstanding {
    fn increment(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_for_zero(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.drained.wait(count).unwrap();
        }
    }
}

/// The complete statistics surface.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Stats {
    pub load_type: LoadType,
    pub session: SessionStats,
    pub index: IndexStats,
}

/// An open index session.
pub struct Session {
    core: Arc<IndexCore>,
    index: Mutex<Option<Index>>,
    load_type: LoadType,
    load_context: Arc<LoadContext>,
    counters: Arc<Counters>,
    outstanding: Arc<Outstanding>,
    suspended: AtomicBool,
    callback_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a fresh index at `name`
    /// (`<path>[ size=<bytes>][ offset=<bytes>]`).
    pub fn create(name: &str, config: IndexConfig) -> Result<Session> {
        Self::open(name, OpenMode::Create, config)
    }

    /// Load an index from its latest clean save. Fails with
    /// [`Error::NotSavedCleanly`] if none exists. The stored geometry
    /// wins; only the runtime parameters of `config` (zones, read
    /// threads) apply.
    pub fn load(name: &str, config: IndexConfig) -> Result<Session> {
        Self::open(name, OpenMode::Load, config)
    }

    /// Load an index, rebuilding it from the volume contents if the load
    /// fails.
    pub fn rebuild(name: &str, config: IndexConfig) -> Result<Session> {
        Self::open(name, OpenMode::Rebuild, config)
    }

    fn open(name: &str, mode: OpenMode, config: IndexConfig) -> Result<Session> {
        let parsed = IndexName::parse(name)?;
        let offset = parsed.offset.unwrap_or(0);
        let layout = match mode {
            OpenMode::Create => Layout::create(&parsed.path, offset, config.clone())?,
            OpenMode::Load | OpenMode::Rebuild => Layout::open(&parsed.path, offset)?,
        };
        if let Some(size) = parsed.size {
            let used = layout.file().metadata()?.len().saturating_sub(offset);
            if used > size {
                return Err(crate::errinput!(
                    "index needs {used} bytes but only {size} were offered"
                ));
            }
        }

        let load_context = Arc::new(LoadContext::new());
        let index = Index::open(layout, &config, mode, load_context.clone())?;
        let core = index.core().clone();
        let load_type = index.loaded_type;

        let counters = Arc::new(Counters::default());
        let outstanding = Arc::new(Outstanding {
            count: Mutex::new(0),
            drained: Condvar::new(),
        });
        let callback_thread = {
            let queue = core.callback_queue.clone();
            let counters = counters.clone();
            let outstanding = outstanding.clone();
            std::thread::spawn(move || {
                while let Some(mut request) = queue.dequeue() {
                    request.found = request.status.is_ok()
                        && !matches!(request.location, Location::Unknown | Location::Unavailable);
                    counters.tally(&request);
                    request.complete();
                    outstanding.decrement();
                }
            })
        };

        Ok(Session {
            core,
            index: Mutex::new(Some(index)),
            load_type,
            load_context,
            counters,
            outstanding,
            suspended: AtomicBool::new(false),
            callback_thread: Mutex::new(Some(callback_thread)),
        })
    }

    fn launch<F>(
        &self,
        kind: RequestKind,
        name: ChunkName,
        metadata: ChunkData,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&Request) + Send + 'static,
    {
        if self.suspended.load(Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        if self.core.disabled.load(Ordering::SeqCst) {
            return Err(Error::Disabled);
        }
        let index = self.index.lock().unwrap();
        let Some(index) = index.as_ref() else {
            return Err(Error::NoIndex);
        };
        let mut request = Request::new(name, kind, metadata);
        request.callback = Some(Box::new(callback));
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.outstanding.increment();
        index.enqueue(request);
        Ok(())
    }

    /// Index `name`, or report the existing binding as a duplicate.
    pub fn post<F>(&self, name: ChunkName, metadata: ChunkData, callback: F) -> Result<()>
    where
        F: FnOnce(&Request) + Send + 'static,
    {
        self.launch(RequestKind::Post, name, metadata, callback)
    }

    /// Rebind `name` unconditionally.
    pub fn update<F>(&self, name: ChunkName, metadata: ChunkData, callback: F) -> Result<()>
    where
        F: FnOnce(&Request) + Send + 'static,
    {
        self.launch(RequestKind::Update, name, metadata, callback)
    }

    /// Look `name` up; with `update`, a hit is refreshed in the open
    /// chapter.
    pub fn query<F>(&self, name: ChunkName, update: bool, callback: F) -> Result<()>
    where
        F: FnOnce(&Request) + Send + 'static,
    {
        self.launch(RequestKind::Query { update }, name, [0u8; 16], callback)
    }

    /// Remove the binding for `name`.
    pub fn delete<F>(&self, name: ChunkName, callback: F) -> Result<()>
    where
        F: FnOnce(&Request) + Send + 'static,
    {
        self.launch(RequestKind::Delete, name, [0u8; 16], callback)
    }

    /// Wait until every outstanding request has completed its callback.
    pub fn flush(&self) -> Result<()> {
        self.outstanding.wait_for_zero();
        Ok(())
    }

    /// Quiesce and write a clean save.
    pub fn save(&self) -> Result<()> {
        self.flush()?;
        if self.index.lock().unwrap().is_none() {
            return Err(Error::NoIndex);
        }
        save_index(&self.core)
    }

    /// Stop accepting requests and drain; optionally save.
    pub fn suspend(&self, save: bool) -> Result<()> {
        self.suspended.store(true, Ordering::SeqCst);
        self.load_context.suspend();
        self.flush()?;
        if save {
            save_index(&self.core)?;
        }
        Ok(())
    }

    /// Resume a suspended session.
    pub fn resume(&self) -> Result<()> {
        self.load_context.resume();
        self.suspended.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Set the checkpoint frequency, returning the previous value.
    pub fn set_checkpoint_frequency(&self, frequency: u32) -> u32 {
        self.core.checkpoint.set_frequency(frequency)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            load_type: self.load_type,
            session: self.counters.snapshot(),
            index: self.core.stats(),
        }
    }

    /// Close the session cleanly: drain, save, stop.
    pub fn close(&self) -> Result<()> {
        self.shutdown(true)
    }

    /// Tear the session down without saving. The next open must load an
    /// older save or rebuild.
    pub fn destroy(&self) -> Result<()> {
        self.load_context.free();
        self.shutdown(false)
    }

    fn shutdown(&self, save: bool) -> Result<()> {
        self.suspended.store(true, Ordering::SeqCst);
        let Some(index) = self.index.lock().unwrap().take() else {
            return Ok(());
        };
        self.outstanding.wait_for_zero();
        let save_result = if save { save_index(&self.core) } else { Ok(()) };
        index.close()?;
        if let Some(handle) = self.callback_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        info!(saved = save, "session closed");
        save_result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::testing::small_sparse;
    use std::sync::mpsc;
    use tempfile::tempdir;

    /// The small test shape from the concrete scenarios: 16 records per
    /// page, 4 record pages, 8 chapters, 2 sparse, 2 zones, sample rate 4.
    fn small_config() -> IndexConfig {
        IndexConfig::default()
            .chapters(4, 8, 2)
            .bytes_per_page(512)
            .zones(2)
            .sparse_sample_rate(4)
            .cache_chapters(3)
    }

    fn dense_config() -> IndexConfig {
        IndexConfig::default()
            .chapters(4, 8, 0)
            .bytes_per_page(512)
            .zones(2)
    }

    /// A deterministic name: seeds scatter across zones, lists, and
    /// chapter addresses.
    fn test_name(seed: u64) -> ChunkName {
        let mut name = ChunkName::new([0u8; 16]);
        name.set_volume_index_bytes(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1);
        name.set_chapter_index_bytes(seed.wrapping_mul(0x2545_f491_4f6c_dd1d) & 0xffff_ffff);
        name.set_sampling_bytes((seed % 16) as u16 + 1);
        name
    }

    /// A hook name under sample rate 4.
    fn hook_name(seed: u64) -> ChunkName {
        let mut name = test_name(seed);
        name.set_sampling_bytes(4);
        name
    }

    fn metadata(seed: u64) -> ChunkData {
        let mut data = [0u8; 16];
        data[..8].copy_from_slice(&seed.to_le_bytes());
        data
    }

    /// Run one operation synchronously, returning
    /// `(found, old_metadata, location)`.
    fn run(
        session: &Session,
        kind: RequestKind,
        name: ChunkName,
        new_metadata: ChunkData,
    ) -> (bool, ChunkData, Location) {
        let (tx, rx) = mpsc::channel();
        let callback = move |request: &Request| {
            assert!(request.status.is_ok(), "request failed: {:?}", request.status);
            tx.send((request.found, request.old_metadata, request.location))
                .unwrap();
        };
        match kind {
            RequestKind::Post => session.post(name, new_metadata, callback).unwrap(),
            RequestKind::Update => session.update(name, new_metadata, callback).unwrap(),
            RequestKind::Query { update } => session.query(name, update, callback).unwrap(),
            RequestKind::Delete => session.delete(name, callback).unwrap(),
        }
        rx.recv().expect("request callback never ran")
    }

    fn post(session: &Session, seed: u64) -> (bool, ChunkData, Location) {
        run(session, RequestKind::Post, test_name(seed), metadata(seed))
    }

    fn query(session: &Session, seed: u64) -> (bool, ChunkData, Location) {
        run(
            session,
            RequestKind::Query { update: false },
            test_name(seed),
            [0u8; 16],
        )
    }

    #[test]
    fn test_post_then_query() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();
        let session = Session::create(&path, dense_config()).unwrap();

        let (found, _, location) = post(&session, 1);
        assert!(!found);
        assert_eq!(location, Location::Unavailable);

        let (found, old, location) = query(&session, 1);
        assert!(found);
        assert_eq!(old, metadata(1));
        assert_eq!(location, Location::InOpenChapter);

        // Posting the same name again reports the duplicate.
        let (found, old, _) = post(&session, 1);
        assert!(found);
        assert_eq!(old, metadata(1));

        let stats = session.stats();
        assert_eq!(stats.session.posts_not_found, 1);
        assert_eq!(stats.session.posts_found, 1);
        assert_eq!(stats.session.queries_found, 1);
        session.destroy().unwrap();
    }

    #[test]
    fn test_delete_then_repost() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();
        let session = Session::create(&path, dense_config()).unwrap();

        post(&session, 7);
        let (found, _, _) = run(&session, RequestKind::Delete, test_name(7), [0u8; 16]);
        assert!(found);
        let (found, _, _) = query(&session, 7);
        assert!(!found);

        // Re-posting after a delete must behave like a fresh insert.
        let (found, _, _) = run(&session, RequestKind::Post, test_name(7), metadata(77));
        assert!(!found);
        let (found, old, _) = query(&session, 7);
        assert!(found);
        assert_eq!(old, metadata(77));
        session.destroy().unwrap();
    }

    #[test]
    fn test_update_rebinds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();
        let session = Session::create(&path, dense_config()).unwrap();

        post(&session, 9);
        run(&session, RequestKind::Update, test_name(9), metadata(900));
        let (found, old, _) = query(&session, 9);
        assert!(found);
        assert_eq!(old, metadata(900));
        session.destroy().unwrap();
    }

    #[test]
    fn test_chapter_rollover_and_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();
        let session = Session::create(&path, dense_config()).unwrap();

        // Fill well past one chapter (capacity 64 across 2 zones).
        for seed in 0..200u64 {
            post(&session, seed);
        }
        session.flush().unwrap();
        let stats = session.stats();
        assert!(
            stats.index.newest_chapter >= 2,
            "posting 200 names must close chapters (newest = {})",
            stats.index.newest_chapter
        );

        // Recently posted names are still found.
        let (found, old, _) = query(&session, 199);
        assert!(found);
        assert_eq!(old, metadata(199));
        session.destroy().unwrap();
    }

    #[test]
    fn test_volume_rotation_forgets_oldest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();
        let session = Session::create(&path, dense_config()).unwrap();

        // Push the window around the whole volume: 8 chapters of 64
        // records, plus enough to wrap.
        for seed in 0..640u64 {
            post(&session, seed);
        }
        session.flush().unwrap();
        let stats = session.stats();
        assert!(stats.index.newest_chapter >= 8);
        assert!(stats.index.oldest_chapter >= 1);

        // A name from the very first chapter has been rotated out.
        let (found, _, _) = query(&session, 0);
        assert!(!found, "name from the expired chapter must be forgotten");
        session.destroy().unwrap();
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();

        let session = Session::create(&path, dense_config()).unwrap();
        for seed in 0..100u64 {
            post(&session, seed);
        }
        session.close().unwrap();
        drop(session);

        let session = Session::load(&path, dense_config()).unwrap();
        assert_eq!(session.stats().load_type, LoadType::Load);
        for seed in (0..100u64).step_by(7) {
            let (found, old, _) = query(&session, seed);
            assert!(found, "seed {seed} lost in save/load");
            assert_eq!(old, metadata(seed));
        }
        session.destroy().unwrap();
    }

    #[test]
    fn test_load_without_save_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();
        let session = Session::create(&path, dense_config()).unwrap();
        post(&session, 1);
        session.destroy().unwrap();
        drop(session);

        match Session::load(&path, dense_config()) {
            Err(Error::NotSavedCleanly) => {}
            Err(e) => panic!("expected NotSavedCleanly, got {e}"),
            Ok(_) => panic!("load must fail without a clean save"),
        }
    }

    #[test]
    fn test_rebuild_recovers_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();

        let session = Session::create(&path, dense_config()).unwrap();
        for seed in 0..300u64 {
            post(&session, seed);
        }
        session.flush().unwrap();
        let before = session.stats();
        // No save: tear down as a crash would.
        session.destroy().unwrap();
        drop(session);

        let session = Session::rebuild(&path, dense_config()).unwrap();
        let stats = session.stats();
        assert_eq!(stats.load_type, LoadType::Rebuild);
        assert_eq!(stats.index.newest_chapter, before.index.newest_chapter);
        assert_eq!(stats.index.oldest_chapter, before.index.oldest_chapter);

        // Names in written chapters are found again; open-chapter records
        // died with the crash.
        let written_chapters = before.index.newest_chapter;
        let records_written = written_chapters * 64;
        let mut recovered = 0;
        for seed in 0..records_written.min(300) {
            if query(&session, seed).0 {
                recovered += 1;
            }
        }
        assert!(
            recovered > 0,
            "rebuild must recover records from written chapters"
        );
        session.destroy().unwrap();
    }

    #[test]
    fn test_sparse_index_end_to_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();
        let session = Session::create(&path, small_config()).unwrap();

        // Interleave hooks and plain names across many chapters so some
        // chapters become sparse.
        for seed in 0..600u64 {
            if seed % 4 == 0 {
                run(
                    &session,
                    RequestKind::Post,
                    hook_name(seed),
                    metadata(seed),
                );
            } else {
                post(&session, seed);
            }
        }
        session.flush().unwrap();
        let stats = session.stats();
        assert!(stats.index.newest_chapter > 6, "window must cover sparse chapters");
        assert!(stats.index.sparse_index.record_count > 0);

        // Recent hooks must be findable through the sparse machinery.
        let mut found_hooks = 0;
        for seed in (400..600u64).filter(|s| s % 4 == 0) {
            let (found, old, _) = run(
                &session,
                RequestKind::Query { update: false },
                hook_name(seed),
                [0u8; 16],
            );
            if found {
                assert_eq!(old, metadata(seed));
                found_hooks += 1;
            }
        }
        assert!(found_hooks > 0, "recent hooks must be retrievable");

        // Hooks posted long ago live in chapters that are now sparse;
        // finding them exercises the barrier protocol and the sparse
        // cache. These queries go through the triage stage because the
        // index is sparse and multi-zone.
        let mut old_hooks = 0;
        for seed in (200..400u64).filter(|s| s % 4 == 0) {
            let (found, old, _) = run(
                &session,
                RequestKind::Query { update: false },
                hook_name(seed),
                [0u8; 16],
            );
            if found {
                assert_eq!(old, metadata(seed));
                old_hooks += 1;
            }
        }
        assert!(old_hooks > 0, "hooks in sparse chapters must be retrievable");
        assert!(
            session.stats().index.sparse_cache.chapter_hits
                + session.stats().index.sparse_cache.chapter_misses
                > 0,
            "sparse cache must have been consulted"
        );
        session.destroy().unwrap();
    }

    #[test]
    fn test_suspend_rejects_requests() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();
        let session = Session::create(&path, dense_config()).unwrap();
        post(&session, 5);
        session.suspend(false).unwrap();
        assert!(matches!(
            session.post(test_name(6), metadata(6), |_| {}),
            Err(Error::Busy)
        ));
        session.resume().unwrap();
        let (found, _, _) = query(&session, 5);
        assert!(found);
        session.destroy().unwrap();
    }

    #[test]
    fn test_checkpoints_written_and_used() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();
        let config = dense_config().checkpoint_frequency(2);

        let session = Session::create(&path, config.clone()).unwrap();
        for seed in 0..300u64 {
            post(&session, seed);
        }
        session.flush().unwrap();
        let stats = session.stats();
        assert!(
            stats.index.checkpoints > 0,
            "closing several chapters must trigger checkpoints"
        );
        session.destroy().unwrap();
        drop(session);

        // The checkpoint serves as a rebuild baseline.
        let session = Session::rebuild(&path, config).unwrap();
        assert_eq!(session.stats().load_type, LoadType::Rebuild);
        let (found, _, _) = query(&session, 250);
        let _ = found; // records from written chapters may or may not
                       // include this seed's chapter; window checks below.
        assert!(session.stats().index.newest_chapter >= 8);
        session.destroy().unwrap();
    }

    #[test]
    fn test_second_session_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").display().to_string();
        let _session = Session::create(&path, dense_config()).unwrap();
        match Session::rebuild(&path, dense_config()) {
            Err(Error::Busy) => {}
            Err(e) => panic!("expected Busy, got {e}"),
            Ok(_) => panic!("second session must not open the same index"),
        }
    }

    #[test]
    fn test_geometry_helper_matches_config() {
        // The scenario configs in these tests assume the derived shape.
        let geometry = small_sparse();
        let config_geometry = small_config().geometry().unwrap();
        assert_eq!(geometry, config_geometry);
    }
}
