use hindsight_schemas::{BankId, EntityId, OperationId, RetainRequest};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::observations;
use crate::retain::{self, RetainContext};

/// Default bounded pool size.
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug)]
pub enum Task {
    /// Deferred retain for `async=true` requests.
    Retain {
        operation_id: OperationId,
        request: RetainRequest,
    },
    RegenerateObservations {
        bank_id: BankId,
        entity_id: EntityId,
    },
    ReinforceOpinions {
        bank_id: BankId,
        entity_ids: Vec<EntityId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObservationState {
    Queued,
    Running,
    RunningPending,
}

/// Submission handle shared by the pipeline and the workers.
///
/// Observation refreshes coalesce per `(bank, entity)`: at most one
/// run in flight, and a request arriving mid-run buys exactly one
/// re-run after the current one completes.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
    observation_state: Arc<StdMutex<HashMap<(BankId, EntityId), ObservationState>>>,
}

impl TaskQueue {
    pub fn new() -> (TaskQueue, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TaskQueue {
                tx,
                observation_state: Arc::new(StdMutex::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Direct submission for non-coalesced task kinds.
    pub fn submit(&self, task: Task) {
        if let Task::RegenerateObservations { bank_id, entity_id } = task {
            self.request_observation_refresh(bank_id, entity_id);
            return;
        }
        if self.tx.send(task).is_err() {
            warn!("task queue is closed, dropping task");
        }
    }

    pub fn request_observation_refresh(&self, bank_id: BankId, entity_id: EntityId) {
        let key = (bank_id.clone(), entity_id.clone());
        let mut state = self.observation_state.lock().unwrap();
        match state.get(&key) {
            None => {
                state.insert(key, ObservationState::Queued);
                drop(state);
                if self
                    .tx
                    .send(Task::RegenerateObservations { bank_id, entity_id })
                    .is_err()
                {
                    warn!("task queue is closed, dropping observation refresh");
                }
            }
            // Already queued: the pending run will see the new facts.
            Some(ObservationState::Queued) => {}
            // Mid-run: mark one follow-up run.
            Some(ObservationState::Running) => {
                state.insert(key, ObservationState::RunningPending);
            }
            Some(ObservationState::RunningPending) => {}
        }
    }

    fn observation_started(&self, key: &(BankId, EntityId)) {
        let mut state = self.observation_state.lock().unwrap();
        if state.get(key) == Some(&ObservationState::Queued) {
            state.insert(key.clone(), ObservationState::Running);
        }
    }

    fn observation_finished(&self, key: &(BankId, EntityId)) {
        let rerun = {
            let mut state = self.observation_state.lock().unwrap();
            match state.remove(key) {
                Some(ObservationState::RunningPending) => {
                    state.insert(key.clone(), ObservationState::Queued);
                    true
                }
                _ => false,
            }
        };
        if rerun {
            let (bank_id, entity_id) = key.clone();
            if self
                .tx
                .send(Task::RegenerateObservations { bank_id, entity_id })
                .is_err()
            {
                warn!("task queue is closed, dropping coalesced refresh");
            }
        }
    }
}

/// Bounded pool of workers draining the shared queue. The pool is an
/// explicit value owned by the embedding process, not global state.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        ctx: RetainContext,
        queue: TaskQueue,
        rx: mpsc::UnboundedReceiver<Task>,
        workers: usize,
    ) -> WorkerPool {
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|worker| {
                let ctx = ctx.clone();
                let queue = queue.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    worker_loop(worker, ctx, queue, rx).await;
                })
            })
            .collect();
        info!("worker pool started with {} workers", workers.max(1));
        WorkerPool { handles }
    }

    pub fn abort(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn worker_loop(
    worker: usize,
    ctx: RetainContext,
    queue: TaskQueue,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
) {
    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            info!("worker {} stopping, queue closed", worker);
            return;
        };
        handle_task(&ctx, &queue, task).await;
    }
}

async fn handle_task(ctx: &RetainContext, queue: &TaskQueue, task: Task) {
    match task {
        Task::Retain {
            operation_id,
            request,
        } => {
            {
                let db = ctx.db.lock().await;
                if let Err(e) = db.mark_operation_running(&operation_id) {
                    error!("failed to mark operation {} running: {}", operation_id, e);
                }
            }
            let outcome = retain::run_retain(ctx, queue, &request).await;
            let db = ctx.db.lock().await;
            let result = match &outcome {
                Ok(unit_ids) => {
                    info!(
                        "async retain {} stored {} units",
                        operation_id,
                        unit_ids.len()
                    );
                    db.finish_operation(&operation_id, Ok(unit_ids.as_slice()))
                }
                Err(e) => {
                    error!("async retain {} failed: {}", operation_id, e);
                    db.finish_operation(&operation_id, Err(&e.to_string()))
                }
            };
            if let Err(e) = result {
                error!("failed to record operation {} outcome: {}", operation_id, e);
            }
        }
        Task::RegenerateObservations { bank_id, entity_id } => {
            let key = (bank_id.clone(), entity_id.clone());
            queue.observation_started(&key);
            match observations::regenerate(ctx, &bank_id, &entity_id).await {
                Ok(count) => info!("refreshed {} observations for {}", count, entity_id),
                // One failure never stops the worker.
                Err(e) => error!("observation refresh for {} failed: {}", entity_id, e),
            }
            queue.observation_finished(&key);
        }
        Task::ReinforceOpinions {
            bank_id,
            entity_ids,
        } => {
            if let Err(e) = retain::reinforce_opinions(ctx, &bank_id, &entity_ids).await {
                // Reinforcement is best-effort by contract.
                warn!("opinion reinforcement failed: {}", e);
            }
        }
    }
}
