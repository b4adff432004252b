//! Sync orchestration on top of the engine.
//!
//! [`SyncSession`] is the single consumer of an engine's event stream. It
//! always plays responder (answering tree and file requests from the peer)
//! and can additionally run [`sync`], the client's server-authoritative
//! one-shot pull: fetch the remote manifest, diff against the local tree,
//! delete what the remote no longer has, then download files one at a time
//! with strict offset ordering and atomic rename-on-complete.
//!
//! [`sync`]: SyncSession::sync

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::diff::diff;
use super::path::{resolve_under_root, PathTraversal};
use super::scanner::{manifest, scan};
use crate::core::{FILE_CHUNK_SIZE, TEMP_SUFFIX, TREE_RESPONSE_TIMEOUT};
use crate::crypto::Sas;
use crate::engine::{EngineEvent, EngineHandle};
use crate::wire::FileEntry;

/// Errors that resolve a sync (or serve) future.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The peer did not answer the tree request in time.
    #[error("timed out waiting for the remote file tree")]
    TreeTimeout,

    /// A chunk for the active file arrived at the wrong offset.
    #[error("offset mismatch for {path}: expected {expected}, got {actual}")]
    OffsetMismatch {
        /// File being transferred.
        path: String,
        /// Offset the pump expected next.
        expected: u64,
        /// Offset the chunk carried.
        actual: u64,
    },

    /// A remote-supplied path tried to escape the sync root.
    #[error(transparent)]
    Path(#[from] PathTraversal),

    /// The engine terminated with an error.
    #[error("engine error: {0}")]
    Engine(String),

    /// The connection went away mid-operation.
    #[error("session disconnected")]
    Disconnected,

    /// Local filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Progress notification emitted while a pull is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// File currently in flight.
    pub path: String,
    /// Bytes of that file written so far.
    pub bytes_received: u64,
    /// Files finished before this one.
    pub files_completed: usize,
    /// Total files in the plan.
    pub files_total: usize,
}

/// Outcome of a completed pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Files downloaded and renamed into place.
    pub downloaded: usize,
    /// Local files removed because the remote no longer has them.
    pub deleted: usize,
}

/// The single file in flight during the sequential pump.
struct IncomingTransfer {
    temp_path: PathBuf,
    final_path: PathBuf,
    expected_offset: u64,
    writer: File,
}

/// Orchestrates one engine's application-level traffic.
pub struct SyncSession {
    engine: EngineHandle,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    root: PathBuf,
    /// Folded relative path -> original-case absolute path, refreshed on
    /// every local scan. Lets the responder open files whose on-disk case
    /// differs from the manifest case.
    serve_index: HashMap<String, PathBuf>,
    progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl SyncSession {
    /// Attach an orchestrator to an engine's event stream, rooted at the
    /// local sync directory.
    pub fn new(
        engine: EngineHandle,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            events,
            root: root.into(),
            serve_index: HashMap::new(),
            progress: None,
        }
    }

    /// Subscribe a progress channel for pull updates.
    pub fn set_progress(&mut self, progress: mpsc::UnboundedSender<ProgressUpdate>) {
        self.progress = Some(progress);
    }

    /// The engine handle (cloneable; safe to share with a UI).
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Drain events until the SAS is generated and return it.
    pub async fn wait_for_sas(&mut self) -> Result<Sas, SyncError> {
        loop {
            let event = self.next_event().await?;
            if let Some(EngineEvent::SasGenerated(sas)) = self.handle_ambient(event)? {
                return Ok(sas);
            }
        }
    }

    /// Drain events until the session is secured in both directions.
    pub async fn wait_until_secured(&mut self) -> Result<(), SyncError> {
        loop {
            let event = self.next_event().await?;
            if let Some(EngineEvent::SessionSecured) = self.handle_ambient(event)? {
                return Ok(());
            }
        }
    }

    /// Responder-only loop: answer the peer until it disconnects.
    pub async fn serve(&mut self) -> Result<(), SyncError> {
        loop {
            match self.events.recv().await {
                Some(event) => {
                    self.handle_ambient(event)?;
                }
                // Peer gone; a served session ends quietly.
                None => return Ok(()),
            }
        }
    }

    /// Run the server-authoritative one-shot pull.
    pub async fn sync(&mut self) -> Result<SyncReport, SyncError> {
        self.engine.request_remote_tree();
        let remote = timeout(TREE_RESPONSE_TIMEOUT, self.await_remote_tree())
            .await
            .map_err(|_| SyncError::TreeTimeout)??;

        let local = manifest(&scan(&self.root)?);
        let plan = diff(&local, &remote);
        tracing::info!(
            downloads = plan.to_download.len(),
            deletions = plan.to_delete.len(),
            "sync plan computed"
        );

        let mut deleted = 0;
        for relative in &plan.to_delete {
            let target = resolve_under_root(&self.root, relative)?;
            match std::fs::remove_file(&target) {
                Ok(()) => deleted += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        let files_total = plan.to_download.len();
        let mut downloaded = 0;
        for entry in plan.to_download {
            self.pull_file(&entry, downloaded, files_total).await?;
            downloaded += 1;
        }

        tracing::info!(downloaded, deleted, "sync finished");
        Ok(SyncReport {
            downloaded,
            deleted,
        })
    }

    async fn await_remote_tree(&mut self) -> Result<Vec<FileEntry>, SyncError> {
        loop {
            let event = self.next_event().await?;
            if let Some(EngineEvent::RemoteTreeReceived(files)) = self.handle_ambient(event)? {
                return Ok(files);
            }
        }
    }

    /// Download one file into `<final>.tmp`, then rename atomically.
    async fn pull_file(
        &mut self,
        entry: &FileEntry,
        files_completed: usize,
        files_total: usize,
    ) -> Result<(), SyncError> {
        let final_path = resolve_under_root(&self.root, &entry.relative_path)?;
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = temp_path_for(&final_path);
        remove_if_exists(&temp_path).await?;
        let writer = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;

        let transfer = IncomingTransfer {
            temp_path: temp_path.clone(),
            final_path,
            expected_offset: 0,
            writer,
        };

        self.emit_progress(&entry.relative_path, 0, files_completed, files_total);
        tracing::debug!(path = %entry.relative_path, size = entry.size, "requesting file");
        self.engine.request_file(&entry.relative_path);

        let result = self
            .run_transfer(transfer, entry, files_completed, files_total)
            .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn run_transfer(
        &mut self,
        mut transfer: IncomingTransfer,
        entry: &FileEntry,
        files_completed: usize,
        files_total: usize,
    ) -> Result<(), SyncError> {
        loop {
            let event = self.next_event().await?;
            match self.handle_ambient(event)? {
                Some(EngineEvent::FileChunkReceived { path, offset, data }) => {
                    if path != entry.relative_path {
                        tracing::warn!(%path, "stray file chunk ignored");
                        continue;
                    }
                    if offset != transfer.expected_offset {
                        return Err(SyncError::OffsetMismatch {
                            path,
                            expected: transfer.expected_offset,
                            actual: offset,
                        });
                    }
                    transfer.writer.write_all(&data).await?;
                    transfer.expected_offset += data.len() as u64;
                    self.emit_progress(
                        &entry.relative_path,
                        transfer.expected_offset,
                        files_completed,
                        files_total,
                    );
                }
                Some(EngineEvent::FileCompleteReceived(path)) => {
                    if path != entry.relative_path {
                        tracing::warn!(%path, "stray file completion ignored");
                        continue;
                    }
                    let IncomingTransfer {
                        temp_path,
                        final_path,
                        writer,
                        ..
                    } = transfer;
                    let mut writer = writer;
                    writer.flush().await?;
                    writer.sync_all().await?;

                    // Stamp the remote mtime so the next diff sees the
                    // file as unchanged.
                    let writer = writer.into_std().await;
                    set_modified_ticks(&writer, entry.last_write_ticks)?;
                    drop(writer);

                    remove_if_exists(&final_path).await?;
                    tokio::fs::rename(&temp_path, &final_path).await?;
                    tracing::debug!(path = %entry.relative_path, "file completed");
                    return Ok(());
                }
                // Anything else mid-transfer is a stray; ignore it.
                _ => continue,
            }
        }
    }

    async fn next_event(&mut self) -> Result<EngineEvent, SyncError> {
        self.events.recv().await.ok_or(SyncError::Disconnected)
    }

    /// Handle the hooks that are live on both sides; return the event if it
    /// was not consumed.
    fn handle_ambient(
        &mut self,
        event: EngineEvent,
    ) -> Result<Option<EngineEvent>, SyncError> {
        match event {
            EngineEvent::RemoteTreeRequested => {
                self.respond_tree()?;
                Ok(None)
            }
            EngineEvent::FileRequested(path) => {
                self.respond_file(path)?;
                Ok(None)
            }
            EngineEvent::Error(message) => Err(SyncError::Engine(message)),
            other => Ok(Some(other)),
        }
    }

    fn respond_tree(&mut self) -> Result<(), SyncError> {
        let files = scan(&self.root)?;
        self.serve_index = files
            .iter()
            .map(|file| (file.entry.relative_path.clone(), file.absolute.clone()))
            .collect();
        tracing::debug!(files = files.len(), "sending file tree");
        self.engine.send_file_tree(manifest(&files));
        Ok(())
    }

    fn respond_file(&mut self, path: String) -> Result<(), SyncError> {
        // Sandbox check first; a hostile path rejects the request, not the
        // session.
        if resolve_under_root(&self.root, &path).is_err() {
            tracing::warn!(%path, "rejected file request outside sync root");
            return Ok(());
        }

        let absolute = match self.lookup_served_file(&path)? {
            Some(absolute) => absolute,
            None => {
                tracing::error!(%path, "requested file not present locally");
                self.engine.shutdown();
                return Ok(());
            }
        };

        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(err) = stream_file(&engine, &path, &absolute).await {
                tracing::error!(%path, %err, "file streaming failed");
                engine.shutdown();
            }
        });
        Ok(())
    }

    /// Look the path up in the serve index, rescanning once on a miss.
    fn lookup_served_file(&mut self, path: &str) -> Result<Option<PathBuf>, SyncError> {
        if let Some(absolute) = self.serve_index.get(path) {
            return Ok(Some(absolute.clone()));
        }
        let files = scan(&self.root)?;
        self.serve_index = files
            .iter()
            .map(|file| (file.entry.relative_path.clone(), file.absolute.clone()))
            .collect();
        Ok(self.serve_index.get(path).cloned())
    }

    fn emit_progress(
        &self,
        path: &str,
        bytes_received: u64,
        files_completed: usize,
        files_total: usize,
    ) {
        tracing::debug!(%path, bytes_received, files_completed, files_total, "progress");
        if let Some(progress) = &self.progress {
            let _ = progress.send(ProgressUpdate {
                path: path.to_owned(),
                bytes_received,
                files_completed,
                files_total,
            });
        }
    }
}

/// Stream one local file to the peer in fixed-size chunks.
///
/// Runs on its own task so reads never block event handling.
async fn stream_file(engine: &EngineHandle, path: &str, absolute: &Path) -> io::Result<()> {
    let mut file = File::open(absolute).await?;
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    let mut offset = 0u64;
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        engine.send_file_chunk(path, offset, buf[..read].to_vec());
        offset += read as u64;
    }
    engine.send_file_complete(path);
    tracing::debug!(%path, bytes = offset, "file streamed");
    Ok(())
}

/// Apply a manifest timestamp (100 ns ticks since the Unix epoch).
fn set_modified_ticks(file: &std::fs::File, ticks: i64) -> io::Result<()> {
    if ticks <= 0 {
        return Ok(());
    }
    let secs = (ticks / 10_000_000) as u64;
    let nanos = ((ticks % 10_000_000) * 100) as u32;
    file.set_modified(UNIX_EPOCH + Duration::new(secs, nanos))
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut os = final_path.as_os_str().to_owned();
    os.push(TEMP_SUFFIX);
    PathBuf::from(os)
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
