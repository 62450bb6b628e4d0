//! Shared scheduler for processor workers.
//!
//! Sized to the number of local agents: each agent gets exactly one worker task,
//! which runs its pulses and cycles one after the other.

use crate::error::{CoordinationError, Result};
use std::future::Future;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct ProcessorScheduler {
    capacity: usize,
    workers: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ProcessorScheduler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            workers: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Spawn a worker. Fails once every slot is taken.
    pub async fn spawn<F>(&self, name: impl Into<String>, worker: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut workers = self.workers.lock().await;
        if workers.len() >= self.capacity {
            return Err(CoordinationError::SchedulerFull(self.capacity));
        }

        debug!(worker = %name, slot = workers.len(), "Spawning processor worker");
        workers.push((name, tokio::spawn(worker)));
        Ok(())
    }

    /// Abort every worker and wait for the tasks to wind down.
    ///
    /// Cancellation is expected; any other join failure (a panicking worker) is
    /// reported.
    pub async fn shutdown_now(&self) -> Result<()> {
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        if workers.is_empty() {
            return Ok(());
        }

        for (_, handle) in &workers {
            handle.abort();
        }

        let mut errors = Vec::new();
        for (name, handle) in workers {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    debug!(worker = %name, error = %e, "Processor worker failed");
                    errors.push(CoordinationError::Join(e));
                }
            }
        }

        info!(capacity = self.capacity, "Processor scheduler shut down");

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CoordinationError::Multiple(errors)),
        }
    }
}
