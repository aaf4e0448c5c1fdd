//! Segment files and their in-memory key indexes.
//!
//! A segment is one append-only log file plus a map from key to the byte
//! offset of that key's most recent record within the file. Only the active
//! (last) segment ever receives appends; every other segment is sealed and
//! its index frozen. Reads open the file fresh per call, so any number of
//! concurrent readers can hit the same segment without coordination.

use crate::error::{CoreError, CoreResult};
use crate::record;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name prefix for segment log files.
pub(crate) const SEGMENT_PREFIX: &str = "segment-";
/// File name suffix for segment log files.
const SEGMENT_SUFFIX: &str = ".log";
/// Suffix appended to a compaction output while it is being built.
pub(crate) const TMP_SUFFIX: &str = ".tmp";

/// Returns the path of the segment file with the given id.
#[must_use]
pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{id:06}{SEGMENT_SUFFIX}"))
}

/// Parses a segment id out of a file name, ignoring anything else
/// (temporary compaction outputs included).
#[must_use]
pub fn parse_segment_id(file_name: &str) -> Option<u64> {
    let stem = file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    stem.parse().ok()
}

/// One append-only log file and its key → offset index.
///
/// The index is written only by the directory worker (for the active
/// segment); sealed segments' indexes are immutable, which is what lets the
/// compactor read them as a consistent snapshot.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    path: PathBuf,
    index: RwLock<HashMap<String, u64>>,
}

impl Segment {
    /// Creates a segment handle with an empty index.
    #[must_use]
    pub fn new(id: u64, path: PathBuf) -> Self {
        Self::with_index(id, path, HashMap::new())
    }

    /// Creates a segment handle over a pre-built index (recovery, compaction).
    #[must_use]
    pub fn with_index(id: u64, path: PathBuf, index: HashMap<String, u64>) -> Self {
        Self {
            id,
            path,
            index: RwLock::new(index),
        }
    }

    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the path of the segment file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the offset of the newest record for `key` in this segment.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<u64> {
        self.index.read().get(key).copied()
    }

    /// Returns whether this segment's index holds `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.index.read().contains_key(key)
    }

    /// Returns a snapshot of the indexed keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    /// Returns the number of indexed keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.index.read().len()
    }

    /// Records the offset of a fresh append. Called only by the directory
    /// worker, and only while this is the active segment.
    pub(crate) fn record_write(&self, key: String, offset: u64) {
        self.index.write().insert(key, offset);
    }

    /// Reads and verifies the record at `offset`, returning its value.
    ///
    /// # Errors
    ///
    /// As for [`Segment::read_record_at`].
    pub fn read_at(&self, offset: u64) -> CoreResult<String> {
        Ok(self.read_record_at(offset)?.value)
    }

    /// Reads and verifies the whole record at `offset`, key included.
    ///
    /// Each call opens the file independently; there is no shared cursor, so
    /// concurrent reads are always safe. The key is returned so callers
    /// holding an index position can check it still points at the record
    /// they resolved (a compaction install rewrites segment files in place).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChecksumMismatch`] or [`CoreError::Corrupt`] if
    /// the frame at `offset` fails integrity checks, or the underlying I/O
    /// error verbatim.
    pub fn read_record_at(&self, offset: u64) -> CoreResult<record::Record> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)
            .map_err(|e| truncated_as_corrupt(e, "frame length"))?;
        let total = u32::from_le_bytes(len_buf) as usize;

        if total < record::MIN_FRAME_SIZE {
            return Err(CoreError::corrupt(format!(
                "declared frame length {total} below minimum at offset {offset}"
            )));
        }
        let file_size = file.metadata()?.len();
        if offset + total as u64 > file_size {
            return Err(CoreError::corrupt(format!(
                "frame at offset {offset} extends beyond segment ({total} bytes declared)"
            )));
        }

        let mut frame = vec![0u8; total];
        frame[..4].copy_from_slice(&len_buf);
        file.read_exact(&mut frame[4..])
            .map_err(|e| truncated_as_corrupt(e, "frame body"))?;

        record::verify(&frame, offset)?;
        record::decode(&frame)
    }

    /// Rebuilds a segment index by scanning its file from offset 0.
    ///
    /// Returns the index and the number of bytes covered by intact records.
    /// A frame that runs past the end of the file is treated as a truncated
    /// trailing write (crash mid-append) and ends the replay cleanly; any
    /// decode or checksum failure on a fully present frame is unrecoverable
    /// corruption and fails the replay.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corrupt`] / [`CoreError::ChecksumMismatch`] on
    /// mid-file corruption, or I/O errors from reading the file.
    pub fn replay(path: &Path) -> CoreResult<(HashMap<String, u64>, u64)> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut index = HashMap::new();
        let mut offset = 0usize;

        while offset < data.len() {
            let remaining = &data[offset..];

            // A partially written trailing frame (not even a full length
            // field, or fewer bytes than the declared size) is a clean end.
            if remaining.len() < 4 {
                break;
            }
            let total =
                u32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]])
                    as usize;
            if total < record::MIN_FRAME_SIZE {
                return Err(CoreError::corrupt(format!(
                    "declared frame length {total} below minimum at offset {offset}"
                )));
            }
            if total > remaining.len() {
                break;
            }

            let frame = &remaining[..total];
            record::verify(frame, offset as u64)?;
            let decoded = record::decode(frame)?;

            index.insert(decoded.key, offset as u64);
            offset += total;
        }

        Ok((index, offset as u64))
    }
}

/// Maps an unexpected-EOF during a positional read to a corrupt-record error;
/// anything else passes through verbatim.
fn truncated_as_corrupt(e: std::io::Error, what: &str) -> CoreError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CoreError::corrupt(format!("{what} truncated"))
    } else {
        CoreError::Io(e)
    }
}

/// Exclusive append handle over the active segment.
///
/// Owned by the write coordinator; there is exactly one of these alive at a
/// time, which is what makes size accounting and rotation decisions safe.
#[derive(Debug)]
pub struct SegmentWriter {
    segment: Arc<Segment>,
    file: File,
    offset: u64,
}

impl SegmentWriter {
    /// Creates the segment file and an append handle at offset 0.
    ///
    /// # Errors
    ///
    /// Returns the I/O error verbatim if the file cannot be created.
    pub fn create(segment: Arc<Segment>) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(segment.path())?;

        Ok(Self {
            segment,
            file,
            offset: 0,
        })
    }

    /// Opens an append handle over a recovered segment.
    ///
    /// The file is truncated to `size`, discarding any partially written
    /// trailing frame the replay skipped, so new appends land on a frame
    /// boundary.
    ///
    /// # Errors
    ///
    /// Returns the I/O error verbatim if the file cannot be opened or
    /// truncated.
    pub fn open_existing(segment: Arc<Segment>, size: u64) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .append(true)
            .write(true)
            .open(segment.path())?;
        file.set_len(size)?;

        Ok(Self {
            segment,
            file,
            offset: size,
        })
    }

    /// Encodes and appends a record, returning the offset it started at.
    ///
    /// The index is deliberately not touched here; cross-segment index
    /// ownership belongs to the directory worker.
    ///
    /// # Errors
    ///
    /// Returns the I/O error verbatim on write failure.
    pub fn append(&mut self, key: &str, value: &str) -> CoreResult<u64> {
        let frame = record::encode(key, value);
        self.file.write_all(&frame)?;

        let offset = self.offset;
        self.offset += frame.len() as u64;
        Ok(offset)
    }

    /// Returns the current size of the active segment in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.offset
    }

    /// Returns the segment this writer appends to.
    #[must_use]
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Flushes buffered writes, optionally syncing to disk.
    ///
    /// # Errors
    ///
    /// Returns the I/O error verbatim on flush or sync failure.
    pub fn seal(&mut self, sync: bool) -> CoreResult<()> {
        self.file.flush()?;
        if sync {
            self.file.sync_all()?;
        }
        Ok(())
    }
}
