//! Segment compaction.
//!
//! Compaction merges the sealed (non-active) segments into a single segment
//! holding only each key's newest surviving record, reclaiming the space
//! occupied by shadowed writes.
//!
//! ## Invariants
//!
//! - Compaction never changes a key's visible value.
//! - The active segment is never part of the merge set.
//! - The merge reads only immutable snapshots; the one shared-state change
//!   is the single install message handed back to the directory worker.

use crate::error::{CoreError, CoreResult};
use crate::record;
use crate::segment::{segment_path, Segment, TMP_SUFFIX};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A fully built compaction output, ready to be installed by the directory
/// worker in one atomic list swap.
#[derive(Debug)]
pub(crate) struct MergeOutcome {
    /// Id of the merged segment (the newest replaced segment's id, so the
    /// file sorts before the active segment on recovery).
    pub id: u64,
    /// Temporary file holding the merged records.
    pub tmp_path: PathBuf,
    /// Final path the temporary file is renamed to at install time.
    pub final_path: PathBuf,
    /// Key → offset index of the merged file.
    pub index: HashMap<String, u64>,
    /// Ids of the segments this merge replaces, oldest first.
    pub replaced_ids: Vec<u64>,
}

/// Builds the merged segment file for a snapshot of sealed segments.
///
/// Segments are visited oldest to newest. A key is skipped if it reappears in
/// any strictly newer snapshot member; it will be carried forward from there
/// instead, so the output holds exactly one, newest, copy of each key.
///
/// # Errors
///
/// Returns read errors from the source segments or write errors on the
/// temporary output verbatim. On error the temporary file is left behind and
/// cleaned up at the next open.
pub(crate) fn merge(
    dir: &Path,
    snapshot: &[Arc<Segment>],
    sync: bool,
) -> CoreResult<MergeOutcome> {
    let id = match snapshot.last() {
        Some(segment) => segment.id(),
        None => return Err(CoreError::corrupt("empty merge snapshot")),
    };
    let final_path = segment_path(dir, id);
    let tmp_path = tmp_merge_path(&final_path);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    let mut index = HashMap::new();
    let mut offset = 0u64;

    for (position, segment) in snapshot.iter().enumerate() {
        let newer = &snapshot[position + 1..];

        for key in segment.keys() {
            if newer.iter().any(|s| s.contains(&key)) {
                continue;
            }
            let Some(source_offset) = segment.lookup(&key) else {
                continue;
            };

            let value = segment.read_at(source_offset)?;
            let frame = record::encode(&key, &value);
            file.write_all(&frame)?;

            index.insert(key, offset);
            offset += frame.len() as u64;
        }
    }

    file.flush()?;
    if sync {
        file.sync_all()?;
    }

    tracing::debug!(
        merged_id = id,
        input_segments = snapshot.len(),
        live_records = index.len(),
        bytes = offset,
        "compaction output built"
    );

    Ok(MergeOutcome {
        id,
        tmp_path,
        final_path,
        index,
        replaced_ids: snapshot.iter().map(|s| s.id()).collect(),
    })
}

/// Returns the temporary path a merge is built under.
pub(crate) fn tmp_merge_path(final_path: &Path) -> PathBuf {
    let mut name = OsString::from(final_path.as_os_str());
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}
