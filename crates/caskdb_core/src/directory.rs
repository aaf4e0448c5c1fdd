//! The index directory worker.
//!
//! One thread owns the ordered segment list and is the only code that ever
//! mutates it or the active segment's index. Lookups, index updates, segment
//! rotation, and compaction installs all arrive as messages on a rendezvous
//! channel, so callers observe either the fully-old or fully-new list, never
//! a half-replaced one.
//!
//! Compaction itself runs on a background thread over an immutable snapshot
//! of the sealed segments; its finished output comes back to this worker as a
//! single [`DirectoryOp::CompactionFinished`] message.

use crate::compact::{self, MergeOutcome};
use crate::error::{CoreError, CoreResult};
use crate::segment::{segment_path, Segment};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Where a key's newest record lives.
#[derive(Debug, Clone)]
pub struct KeyPosition {
    /// Segment holding the record.
    pub segment: Arc<Segment>,
    /// Byte offset of the record within the segment file.
    pub offset: u64,
}

/// Messages processed by the directory worker.
pub(crate) enum DirectoryOp {
    /// Resolve a key to its newest position, newest segment first.
    Lookup {
        key: String,
        reply: Sender<Option<KeyPosition>>,
    },
    /// Record a fresh append in the active segment's index.
    RecordWrite { key: String, offset: u64 },
    /// Append a new active segment to the list.
    Rotate { segment: Arc<Segment> },
    /// A background merge finished (successfully or not).
    CompactionFinished { outcome: CoreResult<MergeOutcome> },
    /// Report the current segment count.
    SegmentCount { reply: Sender<usize> },
    /// Stop the worker.
    Shutdown,
}

/// Cloneable sending side of the directory worker.
#[derive(Debug, Clone)]
pub(crate) struct DirectoryHandle {
    tx: Sender<DirectoryOp>,
}

impl DirectoryHandle {
    /// Resolves `key` to its newest position across all segments.
    pub fn lookup(&self, key: &str) -> CoreResult<Option<KeyPosition>> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(DirectoryOp::Lookup {
                key: key.to_owned(),
                reply,
            })
            .map_err(|_| CoreError::Closed)?;
        rx.recv().map_err(|_| CoreError::Closed)
    }

    /// Records a fresh append in the active segment's index.
    ///
    /// This is a rendezvous send: when it returns, the worker has taken the
    /// message, so a later lookup cannot overtake the index update.
    pub fn record_write(&self, key: String, offset: u64) -> CoreResult<()> {
        self.tx
            .send(DirectoryOp::RecordWrite { key, offset })
            .map_err(|_| CoreError::Closed)
    }

    /// Installs a new active segment at the end of the list.
    pub fn rotate(&self, segment: Arc<Segment>) -> CoreResult<()> {
        self.tx
            .send(DirectoryOp::Rotate { segment })
            .map_err(|_| CoreError::Closed)
    }

    /// Returns the number of segments currently in the directory.
    pub fn segment_count(&self) -> CoreResult<usize> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(DirectoryOp::SegmentCount { reply })
            .map_err(|_| CoreError::Closed)?;
        rx.recv().map_err(|_| CoreError::Closed)
    }

    /// Asks the worker to stop. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.tx.send(DirectoryOp::Shutdown);
    }
}

/// The directory worker state. Lives entirely on its own thread.
pub(crate) struct DirectoryWorker {
    dir: PathBuf,
    segments: Vec<Arc<Segment>>,
    compact_threshold: usize,
    sync_on_rotate: bool,
    compacting: bool,
    ops: Receiver<DirectoryOp>,
    tx: Sender<DirectoryOp>,
}

impl DirectoryWorker {
    /// Spawns the worker thread over an initial segment list (oldest first,
    /// last element active).
    pub fn spawn(
        dir: PathBuf,
        segments: Vec<Arc<Segment>>,
        compact_threshold: usize,
        sync_on_rotate: bool,
    ) -> CoreResult<(DirectoryHandle, JoinHandle<()>)> {
        let (tx, ops) = bounded(0);
        let worker = Self {
            dir,
            segments,
            compact_threshold,
            sync_on_rotate,
            compacting: false,
            ops,
            tx: tx.clone(),
        };

        let handle = thread::Builder::new()
            .name("caskdb-directory".to_owned())
            .spawn(move || worker.run())?;

        Ok((DirectoryHandle { tx }, handle))
    }

    fn run(mut self) {
        // Recovery may have loaded enough sealed segments to warrant an
        // immediate pass, ahead of the next rotation.
        self.maybe_schedule_compaction();

        while let Ok(op) = self.ops.recv() {
            match op {
                DirectoryOp::Lookup { key, reply } => {
                    let _ = reply.send(self.lookup(&key));
                }
                DirectoryOp::RecordWrite { key, offset } => {
                    self.active().record_write(key, offset);
                }
                DirectoryOp::Rotate { segment } => {
                    tracing::debug!(id = segment.id(), "segment rotated");
                    self.segments.push(segment);
                    self.maybe_schedule_compaction();
                }
                DirectoryOp::CompactionFinished { outcome } => {
                    self.compacting = false;
                    match outcome {
                        Ok(merge) => self.install(merge),
                        Err(e) => tracing::warn!(error = %e, "compaction failed"),
                    }
                    self.maybe_schedule_compaction();
                }
                DirectoryOp::SegmentCount { reply } => {
                    let _ = reply.send(self.segments.len());
                }
                DirectoryOp::Shutdown => break,
            }
        }
    }

    /// Newest-first scan; the first hit is the authoritative position.
    fn lookup(&self, key: &str) -> Option<KeyPosition> {
        self.segments.iter().rev().find_map(|segment| {
            segment.lookup(key).map(|offset| KeyPosition {
                segment: Arc::clone(segment),
                offset,
            })
        })
    }

    fn active(&self) -> &Arc<Segment> {
        // The list is never empty: open() always installs at least one segment.
        &self.segments[self.segments.len() - 1]
    }

    fn maybe_schedule_compaction(&mut self) {
        // A merge needs at least two sealed segments, whatever the
        // configured threshold says: merging a lone sealed segment would
        // produce a list that still qualifies, rewriting the same file
        // forever.
        if self.compacting
            || self.segments.len() < self.compact_threshold
            || self.segments.len() < 3
        {
            return;
        }
        self.compacting = true;

        // Everything but the active segment; sealed indexes are frozen, so
        // the snapshot is immutable.
        let snapshot: Vec<_> = self.segments[..self.segments.len() - 1].to_vec();
        let dir = self.dir.clone();
        let tx = self.tx.clone();
        let sync = self.sync_on_rotate;

        tracing::debug!(segments = snapshot.len(), "scheduling compaction");

        let spawned = thread::Builder::new()
            .name("caskdb-compact".to_owned())
            .spawn(move || {
                let outcome = compact::merge(&dir, &snapshot, sync);
                // Fails only when the engine is shutting down.
                let _ = tx.send(DirectoryOp::CompactionFinished { outcome });
            });

        if let Err(e) = spawned {
            tracing::warn!(error = %e, "could not spawn compaction thread");
            self.compacting = false;
        }
    }

    /// Swaps the replaced prefix for the merged segment: rename the merge
    /// output into place, splice the list, then delete the stale files.
    /// Runs inside the worker loop, so it is serialized against lookups.
    fn install(&mut self, merge: MergeOutcome) {
        let replaced = merge.replaced_ids.len();
        let prefix_matches = self.segments.len() > replaced
            && self
                .segments
                .iter()
                .take(replaced)
                .map(|s| s.id())
                .eq(merge.replaced_ids.iter().copied());
        if !prefix_matches {
            tracing::warn!("stale compaction output discarded");
            let _ = fs::remove_file(&merge.tmp_path);
            return;
        }

        // Atomically replaces the newest merged-in segment's file.
        if let Err(e) = fs::rename(&merge.tmp_path, &merge.final_path) {
            tracing::warn!(error = %e, "could not install compaction output");
            let _ = fs::remove_file(&merge.tmp_path);
            return;
        }

        let merged = Arc::new(Segment::with_index(
            merge.id,
            merge.final_path,
            merge.index,
        ));
        let mut segments = Vec::with_capacity(self.segments.len() - replaced + 1);
        segments.push(merged);
        segments.extend_from_slice(&self.segments[replaced..]);
        self.segments = segments;

        // The newest replaced id was renamed over; the strictly older files
        // are now unreachable and can go.
        for &id in &merge.replaced_ids[..replaced - 1] {
            let path = segment_path(&self.dir, id);
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(error = %e, path = %path.display(), "could not delete stale segment");
            }
        }

        tracing::info!(
            merged_id = merge.id,
            replaced,
            remaining = self.segments.len(),
            "compacted segments installed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentWriter;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sealed_segment(dir: &std::path::Path, id: u64, pairs: &[(&str, &str)]) -> Arc<Segment> {
        let segment = Arc::new(Segment::new(id, segment_path(dir, id)));
        let mut writer = SegmentWriter::create(Arc::clone(&segment)).unwrap();
        for (key, value) in pairs {
            let offset = writer.append(key, value).unwrap();
            segment.record_write((*key).to_owned(), offset);
        }
        writer.seal(false).unwrap();
        segment
    }

    fn wait_for_segment_count(handle: &DirectoryHandle, expected: usize) {
        for _ in 0..200 {
            if handle.segment_count().unwrap() == expected {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!(
            "segment count did not settle at {expected}, currently {}",
            handle.segment_count().unwrap()
        );
    }

    #[test]
    fn lookup_prefers_newest_segment() {
        let dir = tempdir().unwrap();
        let old = sealed_segment(dir.path(), 0, &[("key", "old"), ("other", "x")]);
        let new = sealed_segment(dir.path(), 1, &[("key", "new")]);

        let (handle, join) =
            DirectoryWorker::spawn(dir.path().to_path_buf(), vec![old, new], 10, false).unwrap();

        let pos = handle.lookup("key").unwrap().unwrap();
        assert_eq!(pos.segment.id(), 1);
        assert_eq!(pos.segment.read_at(pos.offset).unwrap(), "new");

        let pos = handle.lookup("other").unwrap().unwrap();
        assert_eq!(pos.segment.id(), 0);

        assert!(handle.lookup("missing").unwrap().is_none());

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn record_write_lands_in_active_segment() {
        let dir = tempdir().unwrap();
        let old = sealed_segment(dir.path(), 0, &[("key", "old")]);
        let active = sealed_segment(dir.path(), 1, &[("key", "new")]);
        let offset = active.lookup("key").unwrap();

        let (handle, join) =
            DirectoryWorker::spawn(dir.path().to_path_buf(), vec![old, active], 10, false)
                .unwrap();

        handle.record_write("fresh".to_owned(), offset).unwrap();
        let pos = handle.lookup("fresh").unwrap().unwrap();
        assert_eq!(pos.segment.id(), 1);

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn rotation_to_threshold_compacts_down_to_two() {
        let dir = tempdir().unwrap();
        let s0 = sealed_segment(dir.path(), 0, &[("key1", "v1"), ("key2", "v2")]);
        let s1 = sealed_segment(dir.path(), 1, &[("key2", "v3")]);
        let (handle, join) =
            DirectoryWorker::spawn(dir.path().to_path_buf(), vec![s0, s1], 3, false).unwrap();

        let active = sealed_segment(dir.path(), 2, &[("key3", "v4")]);
        handle.rotate(active).unwrap();

        wait_for_segment_count(&handle, 2);

        // Values are unchanged after the swap.
        let pos = handle.lookup("key1").unwrap().unwrap();
        assert_eq!(pos.segment.read_at(pos.offset).unwrap(), "v1");
        let pos = handle.lookup("key2").unwrap().unwrap();
        assert_eq!(pos.segment.read_at(pos.offset).unwrap(), "v3");
        let pos = handle.lookup("key3").unwrap().unwrap();
        assert_eq!(pos.segment.read_at(pos.offset).unwrap(), "v4");

        // The merged file took over id 1 and the id-0 file is gone.
        assert!(segment_path(dir.path(), 1).exists());
        assert!(!segment_path(dir.path(), 0).exists());

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn tiny_threshold_is_clamped_to_a_real_merge_set() {
        let dir = tempdir().unwrap();
        let s0 = sealed_segment(dir.path(), 0, &[("key", "old")]);
        let s1 = sealed_segment(dir.path(), 1, &[("key", "new")]);
        let (handle, join) =
            DirectoryWorker::spawn(dir.path().to_path_buf(), vec![s0, s1], 1, false).unwrap();

        // Only one sealed segment exists, so no merge may be scheduled; the
        // worker keeps answering and the list stays put.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.segment_count().unwrap(), 2);
        assert!(handle.lookup("key").unwrap().is_some());

        // A third segment gives a real sealed pair and the pass runs.
        let active = sealed_segment(dir.path(), 2, &[("other", "x")]);
        handle.rotate(active).unwrap();
        wait_for_segment_count(&handle, 2);

        let pos = handle.lookup("key").unwrap().unwrap();
        assert_eq!(pos.segment.read_at(pos.offset).unwrap(), "new");

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn startup_over_threshold_compacts_immediately() {
        let dir = tempdir().unwrap();
        let segments = vec![
            sealed_segment(dir.path(), 0, &[("a", "1")]),
            sealed_segment(dir.path(), 1, &[("b", "2")]),
            sealed_segment(dir.path(), 2, &[("a", "3")]),
            sealed_segment(dir.path(), 3, &[("c", "4")]),
        ];

        let (handle, join) =
            DirectoryWorker::spawn(dir.path().to_path_buf(), segments, 3, false).unwrap();

        wait_for_segment_count(&handle, 2);

        let pos = handle.lookup("a").unwrap().unwrap();
        assert_eq!(pos.segment.read_at(pos.offset).unwrap(), "3");

        handle.shutdown();
        join.join().unwrap();
    }
}
