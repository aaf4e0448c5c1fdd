//! The public database facade.
//!
//! [`Db`] wires the two worker threads together: the write coordinator owns
//! the active segment file, the directory worker owns the segment list and
//! every index. `Db` itself holds only channel handles, so it is cheap to
//! share behind an `Arc` and safe to call from many threads at once.

use crate::config::Config;
use crate::directory::{DirectoryHandle, DirectoryWorker, KeyPosition};
use crate::error::{CoreError, CoreResult};
use crate::segment::{self, Segment, SegmentWriter};
use crate::writer::{WriteCoordinator, WriterHandle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

/// An append-only key/value store over a directory of segment files.
#[derive(Debug)]
pub struct Db {
    writer: WriterHandle,
    directory: DirectoryHandle,
    writer_join: Option<JoinHandle<()>>,
    directory_join: Option<JoinHandle<()>>,
}

impl Db {
    /// Opens the store at `dir` with default configuration, creating the
    /// directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> CoreResult<Self> {
        Self::open_with_config(dir, Config::default())
    }

    /// Opens the store at `dir`, replaying every segment file to rebuild the
    /// in-memory indexes.
    ///
    /// A truncated trailing record (an interrupted write) is discarded
    /// silently; corruption anywhere before the tail makes the open fail.
    pub fn open_with_config(dir: impl AsRef<Path>, config: Config) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        remove_leftover_merge_files(&dir)?;

        let mut segments = Vec::new();
        for (id, path) in list_segment_files(&dir)? {
            let (index, size) = Segment::replay(&path)?;
            tracing::debug!(id, size, keys = index.len(), "segment replayed");
            segments.push((Arc::new(Segment::with_index(id, path, index)), size));
        }

        let active = match segments.last() {
            Some((segment, size)) => SegmentWriter::open_existing(Arc::clone(segment), *size)?,
            None => {
                let segment = Arc::new(Segment::new(0, segment::segment_path(&dir, 0)));
                let writer = SegmentWriter::create(Arc::clone(&segment))?;
                segments.push((segment, 0));
                writer
            }
        };

        tracing::info!(
            path = %dir.display(),
            segments = segments.len(),
            "store opened"
        );

        let segments: Vec<_> = segments.into_iter().map(|(segment, _)| segment).collect();
        let (directory, directory_join) = DirectoryWorker::spawn(
            dir.clone(),
            segments,
            config.compact_threshold,
            config.sync_on_rotate,
        )?;
        let (writer, writer_join) =
            WriteCoordinator::spawn(dir, active, directory.clone(), config)?;

        Ok(Self {
            writer,
            directory,
            writer_join: Some(writer_join),
            directory_join: Some(directory_join),
        })
    }

    /// Stores `value` under `key`. Returns once the record is appended and
    /// visible to subsequent gets.
    pub fn put(&self, key: &str, value: &str) -> CoreResult<()> {
        self.writer.put(key.to_owned(), value.to_owned())
    }

    /// Returns the newest value stored under `key`.
    ///
    /// Fails with [`CoreError::NotFound`] for absent keys and with a
    /// corruption error if the record on disk does not match its checksum.
    pub fn get(&self, key: &str) -> CoreResult<String> {
        let pos = self.directory.lookup(key)?.ok_or(CoreError::NotFound)?;
        match Self::read_position(key, &pos) {
            // A compaction install rewrites and deletes segment files under
            // positions resolved just before it. The fresh lookup is served
            // from the post-install list, so one retry settles it.
            Err(e) if Self::position_went_stale(&e) => {
                let pos = self.directory.lookup(key)?.ok_or(CoreError::NotFound)?;
                Self::read_position(key, &pos)
            }
            result => result,
        }
    }

    /// Reads a resolved position and checks the stored record really is for
    /// `key`; a compaction install may have rewritten the file in place, in
    /// which case the offset can land on a different key's intact record.
    fn read_position(key: &str, pos: &KeyPosition) -> CoreResult<String> {
        let record = pos.segment.read_record_at(pos.offset)?;
        if record.key != key {
            return Err(CoreError::corrupt(format!(
                "record at offset {} of segment {} holds key {:?}",
                pos.offset,
                pos.segment.id(),
                record.key
            )));
        }
        Ok(record.value)
    }

    /// Errors a concurrent compaction install can inflict on a position that
    /// was resolved just before it ran: the file is gone, the offset holds a
    /// different key's record, or it no longer sits on a frame boundary.
    /// Genuine corruption reproduces on the retried read and is reported.
    fn position_went_stale(e: &CoreError) -> bool {
        e.is_vanished_file() || e.is_corrupt()
    }

    /// Returns the number of segment files currently in the store.
    pub fn segment_count(&self) -> CoreResult<usize> {
        self.directory.segment_count()
    }

    /// Seals and syncs the active segment, then stops the worker threads.
    ///
    /// # Errors
    ///
    /// Returns the flush/sync error if sealing the active segment fails; the
    /// workers are stopped either way.
    pub fn close(mut self) -> CoreResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> CoreResult<()> {
        let sealed = self.writer.shutdown();
        if let Some(join) = self.writer_join.take() {
            let _ = join.join();
        }
        self.directory.shutdown();
        if let Some(join) = self.directory_join.take() {
            let _ = join.join();
        }
        sealed
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.writer_join.is_some() || self.directory_join.is_some() {
            if let Err(e) = self.shutdown() {
                tracing::warn!(error = %e, "could not seal active segment on drop");
            }
        }
    }
}

/// Segment files in the directory, sorted oldest first by numeric id.
fn list_segment_files(dir: &Path) -> CoreResult<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(segment::parse_segment_id) {
            files.push((id, entry.path()));
        }
    }
    files.sort_by_key(|(id, _)| *id);
    Ok(files)
}

/// Deletes merge outputs a previous process left behind mid-compaction.
/// The inputs they were built from are all still present.
fn remove_leftover_merge_files(dir: &Path) -> CoreResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let is_tmp = name
            .to_str()
            .is_some_and(|n| n.starts_with(segment::SEGMENT_PREFIX) && n.ends_with(segment::TMP_SUFFIX));
        if is_tmp {
            tracing::warn!(path = %entry.path().display(), "removing leftover merge file");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
