use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use futures::Stream;
use mediaflow_model::{ProgressEvent, TaskId};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tracing::{debug, warn};

use super::store::OrchestratorStore;
use super::task::TaskRecord;
use crate::error::{ConsistencyError, OrchestratorError, Result};

/// Why a subscription ended before the task reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The subscriber fell behind and was dropped. Resume with
    /// `subscribe_after(task_id, resume_after)`.
    #[error("subscriber lagged behind; resume after {resume_after:?}")]
    Lagged { resume_after: Option<u64> },
    /// The bus released the task's log (e.g. it was purged).
    #[error("progress stream closed; resume after {resume_after:?}")]
    Closed { resume_after: Option<u64> },
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ProgressEvent>,
    lagged: Arc<AtomicBool>,
}

#[derive(Default)]
struct TaskLog {
    loaded: bool,
    terminal: bool,
    events: Vec<ProgressEvent>,
    subscribers: Vec<Subscriber>,
}

impl TaskLog {
    fn next_sequence(&self) -> u64 {
        self.events
            .last()
            .map(|e| e.sequence_number + 1)
            .unwrap_or_default()
    }

    fn fan_out(&mut self, event: &ProgressEvent) {
        self.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    subscriber.lagged.store(true, Ordering::Release);
                    warn!(
                        target: "mediaflow::progress",
                        task_id = %event.task_id,
                        subscriber = subscriber.id,
                        sequence = event.sequence_number,
                        "dropping lagging subscriber"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// Append-only per-task event log with ordered fan-out.
///
/// Each task's log sits behind its own lock; publishing to one task never
/// waits on another. A subscriber receives the backlog captured under that
/// lock followed by every later event, so it sees a gap-free sequence.
pub struct ProgressBus {
    store: Arc<dyn OrchestratorStore>,
    logs: DashMap<TaskId, Arc<Mutex<TaskLog>>>,
    buffer: usize,
    next_subscriber: AtomicU64,
}

impl fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressBus")
            .field("store", &self.store)
            .field("open_logs", &self.logs.len())
            .field("subscriber_buffer", &self.buffer)
            .finish()
    }
}

impl ProgressBus {
    pub fn new(store: Arc<dyn OrchestratorStore>, subscriber_buffer: usize) -> Self {
        Self {
            store,
            logs: DashMap::new(),
            buffer: subscriber_buffer.max(1),
            next_subscriber: AtomicU64::new(0),
        }
    }

    async fn lock_log(&self, task_id: TaskId) -> Result<OwnedMutexGuard<TaskLog>> {
        let log = Arc::clone(
            self.logs
                .entry(task_id)
                .or_insert_with(|| Arc::new(Mutex::new(TaskLog::default())))
                .value(),
        );

        let mut guard = log.lock_owned().await;
        if !guard.loaded {
            let events = self.store.load_events(task_id, None).await?;
            // Events another writer committed since the last load.
            let known = guard.next_sequence();
            for event in events.iter().filter(|e| e.sequence_number >= known) {
                guard.fan_out(event);
            }
            guard.terminal = events.last().is_some_and(ProgressEvent::is_terminal);
            if guard.terminal {
                guard.subscribers.clear();
            }
            guard.events = events;
            guard.loaded = true;
        }
        Ok(guard)
    }

    /// Re-reads the task's log from the store and forwards anything committed
    /// by another writer to current subscribers.
    pub async fn reload(&self, task_id: TaskId) -> Result<()> {
        let Some(log) = self.logs.get(&task_id).map(|entry| Arc::clone(entry.value())) else {
            return Ok(());
        };
        log.lock().await.loaded = false;

        let terminal = self.lock_log(task_id).await?.terminal;
        if terminal {
            self.logs.remove(&task_id);
        }
        Ok(())
    }

    /// Appends a standalone event.
    pub async fn publish(&self, event: ProgressEvent) -> Result<()> {
        self.publish_inner(event, None).await
    }

    /// Appends an event and persists the task snapshot it belongs to in the
    /// same store transaction.
    pub async fn publish_transition(&self, event: ProgressEvent, record: &TaskRecord) -> Result<()> {
        self.publish_inner(event, Some(record)).await
    }

    async fn publish_inner(&self, event: ProgressEvent, record: Option<&TaskRecord>) -> Result<()> {
        let task_id = event.task_id;
        let mut log = self.lock_log(task_id).await?;

        if log.terminal {
            let status = log
                .events
                .last()
                .map(|e| e.status)
                .unwrap_or(event.status);
            let err = ConsistencyError::AlreadyTerminal { task_id, status };
            warn!(target: "mediaflow::progress", task_id = %task_id, "{err}");
            return Err(err.into());
        }

        let expected = log.next_sequence();
        if event.sequence_number != expected {
            let err = ConsistencyError::OutOfOrder {
                task_id,
                expected,
                got: event.sequence_number,
            };
            warn!(target: "mediaflow::progress", task_id = %task_id, "{err}");
            return Err(err.into());
        }

        let committed = match record {
            Some(record) => self.store.commit_transition(record, &event).await,
            None => self.store.append_event(&event).await,
        };
        if let Err(err) = committed {
            if err.is_conflict() {
                log.loaded = false;
            }
            return Err(err);
        }

        log.fan_out(&event);
        let terminal = event.is_terminal();
        debug!(
            target: "mediaflow::progress",
            task_id = %task_id,
            sequence = event.sequence_number,
            status = %event.status,
            progress = event.progress_percent,
            "event published"
        );
        log.events.push(event);

        if terminal {
            log.terminal = true;
            log.subscribers.clear();
            drop(log);
            // Late subscribers reload the finished log from the store.
            self.logs.remove(&task_id);
        }

        Ok(())
    }

    /// Replays the task's backlog, then follows live events until the
    /// terminal one.
    pub async fn subscribe(&self, task_id: TaskId) -> Result<ProgressSubscription> {
        self.subscribe_from(task_id, None).await
    }

    /// Like [`ProgressBus::subscribe`], skipping events up to and including
    /// `cursor`.
    pub async fn subscribe_after(&self, task_id: TaskId, cursor: u64) -> Result<ProgressSubscription> {
        self.subscribe_from(task_id, Some(cursor)).await
    }

    async fn subscribe_from(&self, task_id: TaskId, cursor: Option<u64>) -> Result<ProgressSubscription> {
        let mut log = self.lock_log(task_id).await?;

        if log.events.is_empty() {
            drop(log);
            self.logs
                .remove_if(&task_id, |_, log| Arc::strong_count(log) == 1);
            return Err(OrchestratorError::TaskNotFound(task_id));
        }

        let backlog: VecDeque<ProgressEvent> = log
            .events
            .iter()
            .filter(|e| cursor.is_none_or(|c| e.sequence_number > c))
            .cloned()
            .collect();

        let lagged = Arc::new(AtomicBool::new(false));
        let rx = if log.terminal {
            None
        } else {
            let (tx, rx) = mpsc::channel(self.buffer);
            let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
            log.subscribers.push(Subscriber {
                id,
                tx,
                lagged: Arc::clone(&lagged),
            });
            Some(rx)
        };

        Ok(ProgressSubscription {
            task_id,
            backlog,
            rx,
            lagged,
            cursor,
            finished: false,
        })
    }

    /// Stored events after `after`, without subscribing.
    pub async fn events(&self, task_id: TaskId, after: Option<u64>) -> Result<Vec<ProgressEvent>> {
        self.store.load_events(task_id, after).await
    }

    /// Forgets in-memory logs, closing any open subscriptions.
    pub fn evict(&self, task_ids: &[TaskId]) {
        for task_id in task_ids {
            self.logs.remove(task_id);
        }
    }

    pub fn subscriber_count(&self, task_id: TaskId) -> usize {
        self.logs
            .get(&task_id)
            .and_then(|log| log.try_lock().ok().map(|guard| guard.subscribers.len()))
            .unwrap_or_default()
    }
}

/// Ordered view of one task's events: backlog first, then live.
pub struct ProgressSubscription {
    task_id: TaskId,
    backlog: VecDeque<ProgressEvent>,
    rx: Option<mpsc::Receiver<ProgressEvent>>,
    lagged: Arc<AtomicBool>,
    cursor: Option<u64>,
    finished: bool,
}

impl fmt::Debug for ProgressSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSubscription")
            .field("task_id", &self.task_id)
            .field("pending_backlog", &self.backlog.len())
            .field("live", &self.rx.is_some())
            .field("cursor", &self.cursor)
            .field("finished", &self.finished)
            .finish()
    }
}

impl ProgressSubscription {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Sequence number of the last delivered event.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    fn deliver(&mut self, event: ProgressEvent) -> ProgressEvent {
        self.cursor = Some(event.sequence_number);
        if event.is_terminal() {
            self.finished = true;
            self.rx = None;
        }
        event
    }

    /// Next event, `None` once the terminal event has been delivered, or an
    /// error if the stream ended early.
    pub async fn next(&mut self) -> Option<std::result::Result<ProgressEvent, SubscriptionError>> {
        if self.finished {
            return None;
        }

        if let Some(event) = self.backlog.pop_front() {
            return Some(Ok(self.deliver(event)));
        }

        let received = match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        };

        match received {
            Some(event) => Some(Ok(self.deliver(event))),
            None => {
                self.finished = true;
                self.rx = None;
                let resume_after = self.cursor;
                if self.lagged.load(Ordering::Acquire) {
                    Some(Err(SubscriptionError::Lagged { resume_after }))
                } else {
                    Some(Err(SubscriptionError::Closed { resume_after }))
                }
            }
        }
    }

    pub fn into_stream(
        self,
    ) -> impl Stream<Item = std::result::Result<ProgressEvent, SubscriptionError>> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|item| (item, subscription))
        })
    }
}
