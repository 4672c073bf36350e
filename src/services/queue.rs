use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Capacity of the dispatcher's command channel.
const COMMAND_BUFFER: usize = 256;

/// How a job finished. Scheduling ignores the difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

/// A unit of generation work. Nothing runs until the queue polls it.
pub type Job = BoxFuture<'static, JobOutcome>;

/// One pending job.
pub struct QueueItem {
    pub session_id: Uuid,
    pub job: Job,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(session_id: Uuid, job: Job) -> Self {
        Self {
            session_id,
            job,
            enqueued_at: Utc::now(),
        }
    }
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("session_id", &self.session_id)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    QueueFull,
    Unavailable,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::QueueFull => f.write_str("queue full"),
            RejectReason::Unavailable => f.write_str("queue unavailable"),
        }
    }
}

/// The answer to an enqueue. Position `0` means the job is running now;
/// waiting jobs are numbered from `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Accepted { position: usize },
    Rejected { reason: RejectReason },
}

impl EnqueueResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, EnqueueResult::Accepted { .. })
    }

    pub fn position(&self) -> Option<usize> {
        match self {
            EnqueueResult::Accepted { position } => Some(*position),
            EnqueueResult::Rejected { .. } => None,
        }
    }
}

/// Concurrency and backlog bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_concurrency: usize,
    pub max_queue_length: usize,
}

/// A waiter's new place in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionUpdate {
    pub session_id: Uuid,
    pub position: usize,
    pub total: usize,
}

/// What `QueueState::enqueue` decided.
#[derive(Debug)]
pub enum Admission {
    /// Run this item now; the running count already includes it.
    StartNow(QueueItem),
    Queued { position: usize },
    Full,
}

impl Admission {
    pub fn result(&self) -> EnqueueResult {
        match self {
            Admission::StartNow(_) => EnqueueResult::Accepted { position: 0 },
            Admission::Queued { position } => EnqueueResult::Accepted {
                position: *position,
            },
            Admission::Full => EnqueueResult::Rejected {
                reason: RejectReason::QueueFull,
            },
        }
    }
}

/// One dequeued item plus the renumbering that followed it.
#[derive(Debug)]
pub struct DispatchStep {
    pub started: QueueItem,
    pub positions: Vec<PositionUpdate>,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub running: usize,
    pub waiting: usize,
    pub max_concurrency: usize,
    pub max_queue_length: usize,
}

/// The admission bookkeeping, free of any I/O.
///
/// Every method is a complete state transition; the caller performs the
/// returned actions (start jobs, send notifications) afterwards.
#[derive(Debug)]
pub struct QueueState {
    limits: QueueLimits,
    running: usize,
    waiting: VecDeque<QueueItem>,
}

impl QueueState {
    /// Creates an empty queue.
    ///
    /// # Returns
    ///
    /// A validation error when either limit is zero.
    pub fn new(limits: QueueLimits) -> Result<Self> {
        if limits.max_concurrency == 0 {
            return Err(AppError::Validation(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if limits.max_queue_length == 0 {
            return Err(AppError::Validation(
                "max_queue_length must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            limits,
            running: 0,
            waiting: VecDeque::with_capacity(limits.max_queue_length),
        })
    }

    /// Admits, queues or refuses `item`.
    pub fn enqueue(&mut self, item: QueueItem) -> Admission {
        if self.running < self.limits.max_concurrency && self.waiting.is_empty() {
            self.running += 1;
            return Admission::StartNow(item);
        }

        if self.waiting.len() >= self.limits.max_queue_length {
            return Admission::Full;
        }

        self.waiting.push_back(item);
        Admission::Queued {
            position: self.waiting.len(),
        }
    }

    /// Records one finished job and admits as many waiters as now fit.
    pub fn complete(&mut self) -> Vec<DispatchStep> {
        if self.running == 0 {
            tracing::warn!("Completion received with no running jobs");
        }
        self.running = self.running.saturating_sub(1);

        let mut steps = Vec::new();
        while self.running < self.limits.max_concurrency {
            let Some(started) = self.waiting.pop_front() else {
                break;
            };
            self.running += 1;

            let total = self.waiting.len();
            let positions = self
                .waiting
                .iter()
                .enumerate()
                .map(|(index, item)| PositionUpdate {
                    session_id: item.session_id,
                    position: index + 1,
                    total,
                })
                .collect();

            steps.push(DispatchStep { started, positions });
        }
        steps
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            running: self.running,
            waiting: self.waiting.len(),
            max_concurrency: self.limits.max_concurrency,
            max_queue_length: self.limits.max_queue_length,
        }
    }
}

/// Hooks the dispatcher calls as jobs move through the queue.
#[async_trait]
pub trait QueueObserver: Send + Sync {
    /// Called right before a job starts, whether admitted immediately or dequeued.
    async fn job_started(&self, session_id: Uuid);

    /// Called when a waiter is queued or its position changes.
    async fn position_changed(&self, update: PositionUpdate);
}

enum Command {
    Enqueue {
        item: QueueItem,
        reply: oneshot::Sender<EnqueueResult>,
    },
    Completed {
        session_id: Uuid,
        outcome: JobOutcome,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
}

/// Handle to the generation admission queue.
///
/// All state lives in a single dispatcher task; this handle only sends it
/// commands, so admissions and completions are applied one at a time.
#[derive(Clone)]
pub struct GenerationQueue {
    commands: mpsc::Sender<Command>,
}

impl GenerationQueue {
    /// Spawns the dispatcher task.
    ///
    /// # Arguments
    ///
    /// * `limits` - Concurrency and backlog bounds.
    /// * `observer` - Receives start and position events.
    /// * `cancel` - Stops the dispatcher when triggered; running jobs are left to finish.
    ///
    /// # Returns
    ///
    /// The queue handle and the dispatcher's `JoinHandle`.
    pub fn start(
        limits: QueueLimits,
        observer: Arc<dyn QueueObserver>,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>)> {
        let state = QueueState::new(limits)?;
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        let dispatcher = Dispatcher {
            state,
            commands: rx,
            completions: tx.clone(),
            observer,
        };
        let handle = tokio::spawn(dispatcher.run(cancel));

        tracing::info!(
            max_concurrency = limits.max_concurrency,
            max_queue_length = limits.max_queue_length,
            "✅ Generation queue started"
        );

        Ok((Self { commands: tx }, handle))
    }

    /// Submits a job for `session_id`.
    ///
    /// Never fails; a stopped dispatcher is reported as a rejection.
    pub async fn enqueue(&self, session_id: Uuid, job: Job) -> EnqueueResult {
        let (reply, response) = oneshot::channel();
        let command = Command::Enqueue {
            item: QueueItem::new(session_id, job),
            reply,
        };

        let unavailable = EnqueueResult::Rejected {
            reason: RejectReason::Unavailable,
        };

        if self.commands.send(command).await.is_err() {
            return unavailable;
        }
        response.await.unwrap_or(unavailable)
    }

    /// Returns the current running and waiting counts.
    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| AppError::QueueUnavailable)?;
        response.await.map_err(|_| AppError::QueueUnavailable)
    }
}

struct Dispatcher {
    state: QueueState,
    commands: mpsc::Receiver<Command>,
    completions: mpsc::Sender<Command>,
    observer: Arc<dyn QueueObserver>,
}

impl Dispatcher {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(
                        running = self.state.running(),
                        waiting = self.state.waiting(),
                        "Generation queue shutting down"
                    );
                    break;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle(command).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { item, reply } => {
                let session_id = item.session_id;
                let admission = self.state.enqueue(item);
                let result = admission.result();
                let _ = reply.send(result);

                match admission {
                    Admission::StartNow(item) => {
                        tracing::debug!("Session {} admitted immediately", session_id);
                        self.start(item).await;
                    }
                    Admission::Queued { position } => {
                        tracing::debug!("Session {} queued at position {}", session_id, position);
                        self.observer
                            .position_changed(PositionUpdate {
                                session_id,
                                position,
                                total: self.state.waiting(),
                            })
                            .await;
                    }
                    Admission::Full => {
                        tracing::info!("Session {} rejected: queue full", session_id);
                    }
                }
            }

            Command::Completed { session_id, outcome } => {
                tracing::debug!("Session {} finished: {:?}", session_id, outcome);

                for step in self.state.complete() {
                    self.start(step.started).await;
                    for update in step.positions {
                        self.observer.position_changed(update).await;
                    }
                }
            }

            Command::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
        }
    }

    async fn start(&mut self, item: QueueItem) {
        let session_id = item.session_id;
        self.observer.job_started(session_id).await;

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let outcome = match tokio::spawn(item.job).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Generation job for session {} aborted: {}", session_id, e);
                    JobOutcome::Failed
                }
            };

            if completions
                .send(Command::Completed { session_id, outcome })
                .await
                .is_err()
            {
                tracing::warn!("Queue stopped before session {} completed", session_id);
            }
        });
    }
}
