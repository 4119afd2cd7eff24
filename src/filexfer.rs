//! File-transfer sub-protocol: raw chunk streaming over the session channel
//!
//! A transfer is entered by a control message carrying a target name and a
//! correlation id; after that, raw frames with the same id carry file bytes
//! until one arrives with the end-of-file flag (success) or the transfer is
//! aborted (explicit abort frame or connection loss). One inbound transfer
//! per session at a time; the sink interface is implemented by the storage
//! layer, with a local staging-file implementation provided here.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::framing::build_raw_frame;
use crate::protocol::{command, flags};
use crate::session::SessionHandle;

/// Byte sink for one inbound transfer, implemented by the storage layer
pub trait FileSink: Send {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()>;
    /// Commit (success) or discard (failure) whatever was written
    fn finish(self: Box<Self>, success: bool) -> std::io::Result<()>;
}

/// Invoked once with the transfer outcome after the sink is closed
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send>;

/// State of one active inbound transfer
pub struct InboundTransfer {
    pub request_id: u32,
    pub name: String,
    sink: Box<dyn FileSink>,
    on_complete: Option<CompletionCallback>,
    bytes: u64,
    audit: Option<TransferLog>,
}

impl InboundTransfer {
    pub fn new(
        request_id: u32,
        name: &str,
        sink: Box<dyn FileSink>,
        on_complete: Option<CompletionCallback>,
    ) -> Self {
        InboundTransfer {
            request_id,
            name: name.to_string(),
            sink,
            on_complete,
            bytes: 0,
            audit: None,
        }
    }

    /// Attach a JSONL audit log that records the transfer outcome
    pub fn with_audit(mut self, log: TransferLog) -> Self {
        self.audit = Some(log);
        self
    }

    pub fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.sink.write(data)?;
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// Close the sink and fire the completion callback. A sink that fails
    /// to commit downgrades a success into a failure outcome.
    pub fn complete(mut self, success: bool) -> bool {
        let committed = match self.sink.finish(success) {
            Ok(()) => success,
            Err(e) => {
                warn!(name = %self.name, error = %e, "failed to finalize transfer sink");
                false
            }
        };
        if let Some(log) = &self.audit {
            let entry = TransferLogEntry {
                timestamp: Utc::now().to_rfc3339(),
                name: self.name.clone(),
                bytes: self.bytes,
                outcome: if committed {
                    TransferOutcome::Completed
                } else {
                    TransferOutcome::Failed
                },
            };
            if let Err(e) = log.add_entry(&entry) {
                warn!(error = %e, "failed to append transfer log entry");
            }
        }
        debug!(
            name = %self.name,
            bytes = self.bytes,
            success = committed,
            "file transfer finished"
        );
        if let Some(cb) = self.on_complete.take() {
            cb(committed);
        }
        committed
    }
}

/// Sink that stages into a uniquely named temp file next to the target and
/// renames into place only on success, so an aborted transfer never leaves
/// a partial file behind.
pub struct LocalFileSink {
    staging: PathBuf,
    target: PathBuf,
    file: Option<fs::File>,
}

impl LocalFileSink {
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create file store directory {}", dir.display()))?;
        let staging = dir.join(format!(".gridmon-{}.part", Uuid::new_v4()));
        let file = fs::File::create(&staging)
            .with_context(|| format!("create staging file {}", staging.display()))?;
        Ok(LocalFileSink {
            staging,
            target: dir.join(name),
            file: Some(file),
        })
    }

    pub fn target_path(&self) -> &Path {
        &self.target
    }
}

impl FileSink for LocalFileSink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match &mut self.file {
            Some(f) => f.write_all(data),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "sink already closed",
            )),
        }
    }

    fn finish(mut self: Box<Self>, success: bool) -> std::io::Result<()> {
        if let Some(f) = self.file.take() {
            drop(f);
        }
        if success {
            fs::rename(&self.staging, &self.target)
        } else {
            fs::remove_file(&self.staging)
        }
    }
}

impl Drop for LocalFileSink {
    fn drop(&mut self) {
        // Belt-and-suspenders for the connection-loss path
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.staging);
        }
    }
}

/// Stream a local file to the peer as raw data frames on the given
/// correlation id; the last chunk carries the end-of-file flag. An empty
/// file still produces one empty, flagged chunk so the receiver sees a
/// completion. Returns the byte count sent.
pub async fn send_file(
    session: &SessionHandle,
    request_id: u32,
    path: &Path,
    chunk_size: usize,
) -> Result<u64> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let total = file.metadata().await?.len();
    let mut sent: u64 = 0;
    loop {
        let mut chunk = vec![0u8; chunk_size];
        let n = file.read(&mut chunk).await?;
        chunk.truncate(n);
        sent += n as u64;
        let last = sent >= total || n == 0;
        let extra = if last { flags::END_OF_FILE } else { 0 };
        session
            .enqueue_frame(build_raw_frame(command::FILE_DATA, extra, request_id, &chunk))
            .await?;
        if last {
            break;
        }
    }
    Ok(sent)
}

/// Raw frame telling the peer to drop its side of an active transfer
pub fn abort_frame(request_id: u32) -> Vec<u8> {
    build_raw_frame(command::ABORT_FILE_TRANSFER, 0, request_id, &[])
}

/// Outcome recorded in the transfer audit log
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub name: String,
    pub bytes: u64,
    pub outcome: TransferOutcome,
}

/// Append-only JSONL record of finished transfers
#[derive(Clone)]
pub struct TransferLog {
    path: PathBuf,
}

impl TransferLog {
    pub fn new(store_root: &Path) -> Self {
        TransferLog {
            path: store_root.join(".gridmon_transfers.jsonl"),
        }
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("open transfer log")?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path).context("read transfer log")?;
        let mut entries = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_local_sink_commits_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Box::new(LocalFileSink::create(dir.path(), "pkg.bin").unwrap());
        sink.write(b"hello ").unwrap();
        sink.write(b"world").unwrap();
        let target = sink.target_path().to_path_buf();
        sink.finish(true).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"hello world");
        // No staging residue
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_local_sink_discards_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Box::new(LocalFileSink::create(dir.path(), "pkg.bin").unwrap());
        sink.write(b"partial").unwrap();
        let target = sink.target_path().to_path_buf();
        sink.finish(false).unwrap();
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_inbound_transfer_success_fires_callback() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Box::new(LocalFileSink::create(dir.path(), "out.dat").unwrap());
        let target = sink.target_path().to_path_buf();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let mut transfer = InboundTransfer::new(
            5,
            "out.dat",
            sink,
            Some(Box::new(move |ok| {
                assert!(ok);
                fired2.store(true, Ordering::SeqCst);
            })),
        );
        transfer.append(b"abc").unwrap();
        transfer.append(b"def").unwrap();
        assert!(transfer.complete(true));
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(fs::read(&target).unwrap(), b"abcdef");
    }

    #[test]
    fn test_inbound_transfer_abort_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Box::new(LocalFileSink::create(dir.path(), "out.dat").unwrap());
        let target = sink.target_path().to_path_buf();
        let mut transfer = InboundTransfer::new(5, "out.dat", sink, None);
        transfer.append(b"abc").unwrap();
        assert!(!transfer.complete(false));
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_audit_log_records_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransferLog::new(dir.path());

        let sink = Box::new(LocalFileSink::create(dir.path(), "a.bin").unwrap());
        InboundTransfer::new(1, "a.bin", sink, None)
            .with_audit(log.clone())
            .complete(true);
        let sink = Box::new(LocalFileSink::create(dir.path(), "b.bin").unwrap());
        InboundTransfer::new(2, "b.bin", sink, None)
            .with_audit(log.clone())
            .complete(false);

        let entries = log.read_log().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.bin");
        assert_eq!(entries[0].outcome, TransferOutcome::Completed);
        assert_eq!(entries[1].outcome, TransferOutcome::Failed);
    }

    #[test]
    fn test_abort_frame_shape() {
        let frame = abort_frame(9);
        assert_eq!(
            u16::from_be_bytes([frame[0], frame[1]]),
            command::ABORT_FILE_TRANSFER
        );
        assert_ne!(u16::from_be_bytes([frame[2], frame[3]]) & flags::BINARY, 0);
        assert_eq!(frame.len(), crate::protocol::HEADER_SIZE);
    }
}
