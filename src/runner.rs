//! Background execution of a [`Pipeline`] with cooperative cancellation.
//!
//! The driving process starts a run, polls [`PipelineRunner::is_alive`] and
//! [`PipelineRunner::progress`], may call [`PipelineRunner::request_stop`] and
//! finally collects the outcome with [`PipelineRunner::join`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use tracing::{error, info};

use crate::controls::PipelineConfig;
use crate::embedder::{EmbedProgress, EmbeddingService, ProgressSnapshot};
use crate::error::{PipelineError, Result};
use crate::pipeline::{Pipeline, PipelineOutput};

/// Shared stop flag checked between batches and stages.
#[derive(Clone, Default)]
pub struct CancellationToken {
    stop_requested: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop; idempotent.
    pub fn cancel(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Fails with [`PipelineError::Cancelled`] once a stop was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Lifecycle of a run as seen by the driving process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunStatus {
    NotStarted = 0,
    Running = 1,
    Finished = 2,
    /// Stopped on request or by a failure, including a worker panic.
    Terminated = 3,
}

impl RunStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Running,
            2 => Self::Finished,
            _ => Self::Terminated,
        }
    }
}

/// Runs a pipeline on a dedicated worker thread.
pub struct PipelineRunner {
    pipeline: Option<Pipeline>,
    cancel: CancellationToken,
    status: Arc<AtomicU8>,
    progress: Arc<EmbedProgress>,
    result_rx: Option<Receiver<Result<PipelineOutput>>>,
    handle: Option<JoinHandle<()>>,
}

impl PipelineRunner {
    /// Builds the pipeline for `config`; the run starts with [`Self::start`].
    pub fn new(config: PipelineConfig, service: Arc<dyn EmbeddingService>) -> Result<Self> {
        Ok(Self::from_pipeline(Pipeline::new(config, service)?))
    }

    /// Wraps an already configured pipeline.
    pub fn from_pipeline(pipeline: Pipeline) -> Self {
        let progress = pipeline.progress();
        Self {
            pipeline: Some(pipeline),
            cancel: CancellationToken::new(),
            status: Arc::new(AtomicU8::new(RunStatus::NotStarted as u8)),
            progress,
            result_rx: None,
            handle: None,
        }
    }

    /// Spawns the worker. A runner can be started once.
    pub fn start(&mut self) -> Result<()> {
        let mut pipeline = self.pipeline.take().ok_or_else(|| {
            PipelineError::invalid_parameter("runner", "pipeline already started")
        })?;
        let (tx, rx) = bounded(1);
        let cancel = self.cancel.clone();
        let status = Arc::clone(&self.status);
        status.store(RunStatus::Running as u8, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name("fractal-pipeline".into())
            .spawn(move || {
                let guard = StatusGuard::new(status);
                let result = pipeline.run(&cancel);
                match &result {
                    Ok(output) => {
                        info!(report = ?output.report, "pipeline finished");
                        guard.settle(RunStatus::Finished);
                    }
                    Err(err) => {
                        error!(error = %err, "pipeline terminated");
                        guard.settle(RunStatus::Terminated);
                    }
                }
                let _ = tx.send(result);
            });
        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                self.result_rx = Some(rx);
                Ok(())
            }
            Err(err) => {
                self.status
                    .store(RunStatus::Terminated as u8, Ordering::SeqCst);
                Err(PipelineError::invalid_parameter(
                    "runner",
                    format!("failed to spawn worker: {err}"),
                ))
            }
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> RunStatus {
        RunStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Whether the worker is still running.
    pub fn is_alive(&self) -> bool {
        self.status() == RunStatus::Running
    }

    /// Embedding counters published by the worker.
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Asks the worker to stop at its next checkpoint.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the worker and returns its outcome.
    pub fn join(mut self) -> Result<PipelineOutput> {
        let (Some(rx), Some(handle)) = (self.result_rx.take(), self.handle.take()) else {
            return Err(PipelineError::invalid_parameter(
                "runner",
                "pipeline was never started",
            ));
        };
        let received = rx.recv();
        if handle.join().is_err() {
            self.status
                .store(RunStatus::Terminated as u8, Ordering::SeqCst);
            return Err(PipelineError::WorkerPanicked);
        }
        received.unwrap_or(Err(PipelineError::WorkerPanicked))
    }
}

/// Stores the terminal status when dropped, so a worker that unwinds still
/// leaves the runner `Terminated`.
struct StatusGuard {
    status: Arc<AtomicU8>,
    terminal: RunStatus,
}

impl StatusGuard {
    fn new(status: Arc<AtomicU8>) -> Self {
        Self {
            status,
            terminal: RunStatus::Terminated,
        }
    }

    fn settle(mut self, terminal: RunStatus) {
        self.terminal = terminal;
    }
}

impl Drop for StatusGuard {
    fn drop(&mut self) {
        self.status.store(self.terminal as u8, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_reports_cancellation() {
        let token = CancellationToken::new();
        let shared = token.clone();
        assert!(token.check().is_ok());
        shared.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(PipelineError::Cancelled)));
    }

    #[test]
    fn status_guard_marks_unwinding_workers_terminated() {
        let status = Arc::new(AtomicU8::new(RunStatus::Running as u8));
        let shared = Arc::clone(&status);
        let outcome = thread::spawn(move || {
            let _guard = StatusGuard::new(shared);
            panic!("worker blew up");
        })
        .join();
        assert!(outcome.is_err());
        assert_eq!(
            RunStatus::from_u8(status.load(Ordering::SeqCst)),
            RunStatus::Terminated
        );

        StatusGuard::new(Arc::clone(&status)).settle(RunStatus::Finished);
        assert_eq!(
            RunStatus::from_u8(status.load(Ordering::SeqCst)),
            RunStatus::Finished
        );
    }

    #[test]
    fn status_round_trips_through_u8() {
        for status in [
            RunStatus::NotStarted,
            RunStatus::Running,
            RunStatus::Finished,
            RunStatus::Terminated,
        ] {
            assert_eq!(RunStatus::from_u8(status as u8), status);
        }
    }
}
