//! The write coordinator.
//!
//! A single thread owns the active [`SegmentWriter`] and applies every put in
//! arrival order. Rotation happens here too: when a record would push the
//! active file past the size limit, the coordinator opens the successor
//! first, seals the old file, and tells the directory worker about the new
//! active segment before appending.

use crate::config::Config;
use crate::directory::DirectoryHandle;
use crate::error::{CoreError, CoreResult};
use crate::record;
use crate::segment::{segment_path, Segment, SegmentWriter};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Messages processed by the write coordinator.
pub(crate) enum WriteOp {
    /// Append a key/value pair; the reply fires once the record is in the
    /// file and indexed.
    Put {
        key: String,
        value: String,
        reply: Sender<CoreResult<()>>,
    },
    /// Seal the active segment and stop; the reply carries the final
    /// flush/sync result.
    Shutdown { reply: Sender<CoreResult<()>> },
}

/// Cloneable sending side of the write coordinator.
#[derive(Debug, Clone)]
pub(crate) struct WriterHandle {
    tx: Sender<WriteOp>,
}

impl WriterHandle {
    /// Stores `value` under `key`, blocking until the write is applied.
    pub fn put(&self, key: String, value: String) -> CoreResult<()> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(WriteOp::Put { key, value, reply })
            .map_err(|_| CoreError::Closed)?;
        rx.recv().map_err(|_| CoreError::Closed)?
    }

    /// Seals the active segment, stops the coordinator, and reports the
    /// final flush/sync result. Later calls return [`CoreError::Closed`].
    pub fn shutdown(&self) -> CoreResult<()> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(WriteOp::Shutdown { reply })
            .map_err(|_| CoreError::Closed)?;
        rx.recv().map_err(|_| CoreError::Closed)?
    }
}

/// The write coordinator state. Lives entirely on its own thread.
pub(crate) struct WriteCoordinator {
    dir: PathBuf,
    active: SegmentWriter,
    next_id: u64,
    directory: DirectoryHandle,
    config: Config,
    ops: Receiver<WriteOp>,
}

impl WriteCoordinator {
    /// Spawns the coordinator thread over the recovered active writer.
    pub fn spawn(
        dir: PathBuf,
        active: SegmentWriter,
        directory: DirectoryHandle,
        config: Config,
    ) -> CoreResult<(WriterHandle, JoinHandle<()>)> {
        let (tx, ops) = bounded(0);
        let next_id = active.segment().id() + 1;
        let coordinator = Self {
            dir,
            active,
            next_id,
            directory,
            config,
            ops,
        };

        let handle = thread::Builder::new()
            .name("caskdb-writer".to_owned())
            .spawn(move || coordinator.run())?;

        Ok((WriterHandle { tx }, handle))
    }

    fn run(mut self) {
        while let Ok(op) = self.ops.recv() {
            match op {
                WriteOp::Put { key, value, reply } => {
                    let _ = reply.send(self.put(&key, &value));
                }
                WriteOp::Shutdown { reply } => {
                    let _ = reply.send(self.active.seal(true));
                    return;
                }
            }
        }
        // Every handle dropped without an explicit shutdown.
        if let Err(e) = self.active.seal(true) {
            tracing::warn!(error = %e, "could not seal active segment on shutdown");
        }
    }

    fn put(&mut self, key: &str, value: &str) -> CoreResult<()> {
        let frame_len = record::encoded_len(key, value) as u64;
        if frame_len > self.config.max_segment_size {
            return Err(CoreError::RecordTooLarge {
                size: frame_len,
                limit: self.config.max_segment_size,
            });
        }

        if self.active.size() + frame_len > self.config.max_segment_size {
            self.rotate()?;
        }

        let offset = self.active.append(key, value)?;
        self.directory.record_write(key.to_owned(), offset)?;
        Ok(())
    }

    /// Opens the successor segment before touching the current one, so a
    /// failure here leaves the active writer untouched.
    fn rotate(&mut self) -> CoreResult<()> {
        let id = self.next_id;
        let segment = Arc::new(Segment::new(id, segment_path(&self.dir, id)));
        let writer = SegmentWriter::create(Arc::clone(&segment))?;

        let mut sealed = std::mem::replace(&mut self.active, writer);
        sealed.seal(self.config.sync_on_rotate)?;
        self.next_id += 1;

        self.directory.rotate(segment)?;
        Ok(())
    }
}
