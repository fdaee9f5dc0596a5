use crate::key::CounterKey;
use crate::period::{Period, PeriodType};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;

/// Parameters of a pending writeback. Kept flat so it can travel through any task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushTask {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<Period>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_type: Option<PeriodType>,
    pub namespace: String,
}

impl FlushTask {
    pub fn scoped(namespace: &str, period_type: PeriodType, period: &Period, name: &str) -> Self {
        Self {
            name: name.to_string(),
            period: Some(period.clone()),
            period_type: Some(period_type),
            namespace: namespace.to_string(),
        }
    }

    pub fn simple(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            period: None,
            period_type: None,
            namespace: namespace.to_string(),
        }
    }

    /// Recompute the counter key this task refers to.
    pub fn key(&self) -> anyhow::Result<CounterKey> {
        match (self.period_type, &self.period) {
            (None, _) => Ok(CounterKey::simple(&self.namespace, &self.name)),
            (Some(ty), Some(period)) => {
                Ok(CounterKey::scoped(&self.namespace, ty, period, &self.name))
            }
            // the bucket of `all` does not depend on the period
            (Some(PeriodType::All), None) => Ok(CounterKey::scoped(
                &self.namespace,
                PeriodType::All,
                &Period::now(),
                &self.name,
            )),
            (Some(ty), None) => anyhow::bail!(
                "flush task for {}:{} has period type {ty} but no period",
                self.namespace,
                self.name
            ),
        }
    }
}

/// An at-least-once dispatcher of flush tasks.
#[async_trait::async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, task: FlushTask) -> anyhow::Result<()>;
}

/// Whatever a worker runs for every delivered task. An `Err` asks for a redelivery.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: &FlushTask) -> anyhow::Result<()>;
}

#[derive(Debug)]
struct Delivery {
    task: FlushTask,
    attempt: u32,
}

/// Deliveries accepted but not finished yet, retries waiting for their delay included.
#[derive(Debug, Default)]
struct Backlog {
    closed: AtomicBool,
    outstanding: AtomicUsize,
    drained: Notify,
}

impl Backlog {
    /// Account for a new delivery, unless intake is already closed.
    fn admit(&self) -> bool {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.settle();
            return false;
        }
        true
    }

    fn settle(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn wait_drained(&self) {
        loop {
            let drained = self.drained.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// Named in-process [`WorkQueue`]. Tasks are consumed by a [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct TaskQueue {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Delivery>,
    backlog: Arc<Backlog>,
}

/// Consuming side of a [`TaskQueue`], handed to [`WorkerPool::spawn`].
pub struct TaskReceiver {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    backlog: Arc<Backlog>,
}

impl TaskQueue {
    pub fn new(name: &str) -> (Self, TaskReceiver) {
        let name: Arc<str> = Arc::from(name);
        let backlog = Arc::new(Backlog::default());
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            name: Arc::clone(&name),
            sender: sender.clone(),
            backlog: Arc::clone(&backlog),
        };
        (
            queue,
            TaskReceiver {
                name,
                sender,
                receiver,
                backlog,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait::async_trait]
impl WorkQueue for TaskQueue {
    async fn enqueue(&self, task: FlushTask) -> anyhow::Result<()> {
        if !self.backlog.admit() {
            anyhow::bail!("task queue {} is shutting down", self.name);
        }

        tracing::debug!("enqueue writeback of {}:{} on {}", task.namespace, task.name, self.name);
        if self.sender.send(Delivery { task, attempt: 0 }).is_err() {
            self.backlog.settle();
            anyhow::bail!("task queue {} is no longer consumed", self.name);
        }
        Ok(())
    }
}

/// How often and how fast a failed task is redelivered.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with up to one base delay of jitter.
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let backoff = base.saturating_mul(1 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..=base);
        Duration::from_millis(backoff + jitter)
    }
}

/// A set of tokio tasks draining one [`TaskQueue`].
pub struct WorkerPool {
    name: Arc<str>,
    backlog: Arc<Backlog>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<H: TaskHandler>(
        receiver: TaskReceiver,
        handler: H,
        workers: usize,
        retry: RetryPolicy,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        let TaskReceiver {
            name,
            sender,
            receiver,
            backlog,
        } = receiver;
        let receiver = Arc::new(Mutex::new(receiver));
        let handler = Arc::new(handler);

        let workers = (0..workers.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: Arc::clone(&name),
                    receiver: Arc::clone(&receiver),
                    requeue: sender.clone(),
                    backlog: Arc::clone(&backlog),
                    handler: Arc::clone(&handler),
                    retry,
                };
                tokio::spawn(worker.run(rx.clone()))
            })
            .collect();

        tracing::info!("started writeback workers on queue {name}");

        Self {
            name,
            backlog,
            shutdown: tx,
            workers,
        }
    }

    /// Refuse new tasks, run every accepted one to completion (retries included), then stop the
    /// workers.
    pub async fn shutdown(self) {
        self.backlog.close();
        let outstanding = self.backlog.outstanding.load(Ordering::SeqCst);
        tracing::info!("draining {outstanding} writebacks from queue {}", self.name);
        self.backlog.wait_drained().await;

        self.shutdown.send(true).ok();
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::error!("writeback worker exited abnormally: {err}")
            }
        }
    }
}

struct Worker<H> {
    id: usize,
    queue: Arc<str>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    requeue: mpsc::UnboundedSender<Delivery>,
    backlog: Arc<Backlog>,
    handler: Arc<H>,
    retry: RetryPolicy,
}

impl<H: TaskHandler> Worker<H> {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let delivery = tokio::select! {
                _ = shutdown.changed() => {
                    break;
                }
                delivery = async { self.receiver.lock().await.recv().await } => delivery,
            };

            let Some(delivery) = delivery else {
                break;
            };
            self.process(delivery).await;
        }

        tracing::debug!("writeback worker {} on {} is exiting", self.id, self.queue);
    }

    async fn process(&self, delivery: Delivery) {
        let Delivery { task, attempt } = delivery;
        let err = match self.handler.handle(&task).await {
            Ok(()) => {
                self.backlog.settle();
                return;
            }
            Err(err) => err,
        };

        let next = attempt + 1;
        if next >= self.retry.max_attempts {
            tracing::error!(
                "giving up writeback of {}:{} after {next} attempts: {err:#}",
                task.namespace,
                task.name
            );
            self.backlog.settle();
            return;
        }

        let delay = self.retry.delay(attempt);
        tracing::warn!(
            "writeback of {}:{} failed, retrying in {delay:?}: {err:#}",
            task.namespace,
            task.name
        );
        // still outstanding until the redelivery is processed
        let requeue = self.requeue.clone();
        let backlog = Arc::clone(&self.backlog);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if requeue.send(Delivery { task, attempt: next }).is_err() {
                backlog.settle();
            }
        });
    }
}
