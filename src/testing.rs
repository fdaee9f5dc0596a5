use crate::queue::{FlushTask, WorkQueue};
use std::sync::{Arc, Mutex};

/// Keeps every enqueued task instead of running it.
#[derive(Clone, Default)]
pub(crate) struct RecordingQueue {
    tasks: Arc<Mutex<Vec<FlushTask>>>,
}

impl RecordingQueue {
    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub(crate) fn drain(&self) -> Vec<FlushTask> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }
}

#[async_trait::async_trait]
impl WorkQueue for RecordingQueue {
    async fn enqueue(&self, task: FlushTask) -> anyhow::Result<()> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

pub(crate) struct FailingQueue;

#[async_trait::async_trait]
impl WorkQueue for FailingQueue {
    async fn enqueue(&self, _task: FlushTask) -> anyhow::Result<()> {
        anyhow::bail!("queue is unavailable")
    }
}
