//! Upload session actor.
//!
//! Each in-flight upload is owned by one spawned task. The task is the only
//! code that touches the chunk bitmap, the writer count and the deadline;
//! everything else talks to it through a `SessionHandle`:
//!
//! - chunk writers ask for a `WritePermit`, write through it, and the permit
//!   reports the outcome back exactly once (explicitly, or from `Drop`);
//! - status pollers get a snapshot of the received chunk indices;
//! - completion pollers wait on the `finished` / `processed` latches.
//!
//! Lifecycle: `Active` until every chunk is present or the inactivity
//! deadline passes, then `Draining` (no new permits, in-flight writers are
//! waited for), then `Finalizing` and `Terminated` in the `Finalizer`.

use crate::{
    models::upload::{UploadDescriptor, UploadId},
    services::{
        chunk_bitmap::ChunkBitmap,
        finalize::{FinalizeJob, Finalizer, FinishOutcome, ProcessedOutcome},
        latch::{Latch, LatchWaiter},
    },
};
use bytes::Bytes;
use std::{fs::File as StdFile, io, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, sleep},
};
use tracing::{debug, info, warn};

const MAILBOX_CAPACITY: usize = 64;

/// Result of one chunk write attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(u32),
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Draining,
    Finalizing,
    Terminated,
}

/// Why a session stopped accepting writers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Complete,
    TimedOut,
}

enum SessionCommand {
    Admit {
        respond_to: oneshot::Sender<WritePermit>,
    },
    Status {
        respond_to: oneshot::Sender<Vec<u32>>,
    },
}

/// Sends a write outcome to the actor exactly once.
///
/// Dropping an unsent reporter counts as a failed write, so a cancelled or
/// panicking writer can never leave the actor waiting for it.
struct OutcomeReporter {
    tx: Option<mpsc::UnboundedSender<WriteOutcome>>,
}

impl OutcomeReporter {
    fn send(mut self, outcome: WriteOutcome) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for OutcomeReporter {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(WriteOutcome::Failed);
        }
    }
}

/// Admission token for one chunk write.
///
/// The destination file is only reachable through the permit, and only for
/// a positional write.
pub struct WritePermit {
    file: Arc<StdFile>,
    descriptor: Arc<UploadDescriptor>,
    reporter: OutcomeReporter,
}

impl WritePermit {
    /// Write `data` as chunk `index` and report the outcome.
    ///
    /// The write runs on the blocking pool and reports from there, so the
    /// actor hears about it even if the calling future is dropped midway.
    pub async fn write_chunk(self, index: u32, data: Bytes) -> io::Result<()> {
        tokio::task::spawn_blocking(move || {
            let offset = self.descriptor.offset_of(index);
            let result = write_at(&self.file, &data, offset);
            self.report(match result {
                Ok(()) => WriteOutcome::Written(index),
                Err(_) => WriteOutcome::Failed,
            });
            result
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Report the outcome of this permit's write.
    ///
    /// Consumes the permit; the file reference is released before the
    /// actor hears about it.
    pub fn report(self, outcome: WriteOutcome) {
        let WritePermit { file, reporter, .. } = self;
        drop(file);
        reporter.send(outcome);
    }
}

#[cfg(unix)]
fn write_at(file: &StdFile, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &StdFile, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Cloneable handle to a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    id: UploadId,
    descriptor: Arc<UploadDescriptor>,
    commands: mpsc::Sender<SessionCommand>,
    finished: LatchWaiter<FinishOutcome>,
    processed: LatchWaiter<ProcessedOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> UploadId {
        self.id
    }

    pub fn descriptor(&self) -> &UploadDescriptor {
        &self.descriptor
    }

    /// Ask for permission to write one chunk.
    ///
    /// `None` means the session no longer accepts writers; callers report
    /// that as "not found" rather than retrying.
    pub async fn request_write_permit(&self) -> Option<WritePermit> {
        let (respond_to, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Admit { respond_to })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Received chunk indices, ascending. `None` once the session has closed.
    pub async fn query_status(&self) -> Option<Vec<u32>> {
        let (respond_to, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Status { respond_to })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Resolves once the file is stored, or the session failed or timed out.
    pub async fn finished(&self) -> FinishOutcome {
        self.finished
            .wait()
            .await
            .unwrap_or_else(|| FinishOutcome::Failed("session ended unexpectedly".into()))
    }

    /// Resolves once post-processing is over (or was skipped).
    pub async fn processed(&self) -> ProcessedOutcome {
        match self.processed.wait().await {
            Some(outcome) => outcome,
            None => ProcessedOutcome {
                finish: self.finished().await,
                mime_type: None,
                thumbnail: None,
            },
        }
    }
}

/// Start the actor for a freshly registered upload.
///
/// `file` is the open temp file at `tmp_path`; from here on the actor owns it.
pub fn start(
    id: UploadId,
    descriptor: UploadDescriptor,
    file: StdFile,
    tmp_path: PathBuf,
    timeout: Duration,
    finalizer: Arc<Finalizer>,
) -> SessionHandle {
    let descriptor = Arc::new(descriptor);
    let (commands_tx, commands_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let (finished, finished_waiter) = Latch::new();
    let (processed, processed_waiter) = Latch::new();

    let actor = SessionActor {
        id,
        bitmap: ChunkBitmap::new(descriptor.chunks as usize),
        descriptor: descriptor.clone(),
        file: Arc::new(file),
        tmp_path,
        received: 0,
        in_flight: 0,
        state: SessionState::Active,
        timeout,
        commands: commands_rx,
        outcomes: outcome_rx,
        outcome_tx,
        finished,
        processed,
        finalizer,
    };
    tokio::spawn(actor.run());

    SessionHandle {
        id,
        descriptor,
        commands: commands_tx,
        finished: finished_waiter,
        processed: processed_waiter,
    }
}

struct SessionActor {
    id: UploadId,
    descriptor: Arc<UploadDescriptor>,
    file: Arc<StdFile>,
    tmp_path: PathBuf,
    bitmap: ChunkBitmap,
    received: u32,
    in_flight: usize,
    state: SessionState,
    timeout: Duration,
    commands: mpsc::Receiver<SessionCommand>,
    outcomes: mpsc::UnboundedReceiver<WriteOutcome>,
    outcome_tx: mpsc::UnboundedSender<WriteOutcome>,
    finished: Latch<FinishOutcome>,
    processed: Latch<ProcessedOutcome>,
    finalizer: Arc<Finalizer>,
}

impl SessionActor {
    async fn run(mut self) {
        info!(
            upload_id = %self.id,
            name = %self.descriptor.name,
            chunks = self.descriptor.chunks,
            "upload session started"
        );

        let end = self.accept().await;
        self.transition(SessionState::Draining);
        self.drain().await;
        self.transition(SessionState::Finalizing);

        let SessionActor {
            id,
            descriptor,
            file,
            tmp_path,
            finished,
            processed,
            finalizer,
            ..
        } = self;
        let job = FinalizeJob {
            id,
            descriptor,
            file,
            tmp_path,
            end,
        };
        finalizer.run(job, finished, processed).await;
        debug!(upload_id = %id, state = ?SessionState::Terminated, "session state change");
    }

    /// Serve writers and pollers until the upload is complete or idle too long.
    async fn accept(&mut self) -> SessionEnd {
        let deadline = sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            if self.bitmap.is_complete() {
                return SessionEnd::Complete;
            }

            // Outcomes first, so a status snapshot reflects every write that
            // reported before the query was sent.
            tokio::select! {
                biased;
                Some(outcome) = self.outcomes.recv() => self.apply(outcome),
                _ = &mut deadline => {
                    warn!(
                        upload_id = %self.id,
                        received = self.received,
                        chunks = self.descriptor.chunks,
                        "upload timed out"
                    );
                    return SessionEnd::TimedOut;
                }
                Some(cmd) = self.commands.recv() => match cmd {
                    SessionCommand::Admit { respond_to } => {
                        deadline.as_mut().reset(Instant::now() + self.timeout);
                        // A requester that went away drops the permit, which reports a failure.
                        let _ = respond_to.send(self.admit());
                    }
                    SessionCommand::Status { respond_to } => {
                        let _ = respond_to.send(self.bitmap.to_indices());
                    }
                },
            }
        }
    }

    /// Refuse new work and wait for every permit already handed out.
    async fn drain(&mut self) {
        self.commands.close();

        while self.in_flight > 0 {
            tokio::select! {
                biased;
                Some(outcome) = self.outcomes.recv() => self.apply(outcome),
                Some(cmd) = self.commands.recv() => self.refuse(cmd),
            }
        }
        while let Ok(cmd) = self.commands.try_recv() {
            self.refuse(cmd);
        }
    }

    fn admit(&mut self) -> WritePermit {
        self.in_flight += 1;
        WritePermit {
            file: self.file.clone(),
            descriptor: self.descriptor.clone(),
            reporter: OutcomeReporter {
                tx: Some(self.outcome_tx.clone()),
            },
        }
    }

    fn apply(&mut self, outcome: WriteOutcome) {
        self.in_flight = self.in_flight.saturating_sub(1);

        match outcome {
            WriteOutcome::Written(index) if index < self.descriptor.chunks => {
                if !self.bitmap.has(index as usize) {
                    self.bitmap.mark(index as usize);
                    self.received += 1;
                }
                debug!(
                    upload_id = %self.id,
                    chunk = index,
                    received = self.received,
                    chunks = self.descriptor.chunks,
                    "chunk stored"
                );
            }
            WriteOutcome::Written(index) => {
                warn!(upload_id = %self.id, chunk = index, "ignoring out-of-range chunk report");
            }
            WriteOutcome::Failed => {
                debug!(upload_id = %self.id, "chunk write failed");
            }
        }
    }

    fn refuse(&self, cmd: SessionCommand) {
        let kind = match cmd {
            SessionCommand::Admit { .. } => "write permit",
            SessionCommand::Status { .. } => "status",
        };
        debug!(upload_id = %self.id, kind, "refusing request on closed session");
    }

    fn transition(&mut self, to: SessionState) {
        debug!(upload_id = %self.id, from = ?self.state, to = ?to, "session state change");
        self.state = to;
    }
}

#[cfg(test)]
pub(crate) fn detached_handle(id: UploadId, descriptor: UploadDescriptor) -> SessionHandle {
    let (commands, _) = mpsc::channel(1);
    let (_, finished) = Latch::new();
    let (_, processed) = Latch::new();
    SessionHandle {
        id,
        descriptor: Arc::new(descriptor),
        commands,
        finished,
        processed,
    }
}
