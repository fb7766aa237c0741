//! Threaded I/O scheduler for physical block writes.
//!
//! Writes from foreground accounts must not queue behind background work
//! (compaction, bulk loads). The scheduler routes each job by account
//! priority into one of two bounded worker pools.
//!
//! Submission never blocks. An async caller first reserves a queue slot with
//! [`IoScheduler::reserve`], which suspends only its task while the pool is
//! full, and keeps the slot until its job has finished. A submit that finds
//! the queue full fails with [`StorageError::QueueFull`].

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[cfg(test)]
use std::time::Duration;

use crate::error::ConfigError;
use crate::io_account::IoPriority;
use crate::storage::traits::StorageError;

/// Worker pool selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoPath {
    /// Latency-sensitive writes.
    Foreground,
    /// Bulk and maintenance writes.
    Background,
}

impl IoPath {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Background => "background",
        }
    }
}

/// Routes jobs to a worker pool.
pub trait IoRouter: Send + Sync {
    /// Selects the pool for a job submitted under `priority`.
    fn route(&self, priority: IoPriority) -> IoPath;
}

/// Priority at or above [`IoPriority::DEFAULT`] is foreground.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultIoRouter;

impl IoRouter for DefaultIoRouter {
    fn route(&self, priority: IoPriority) -> IoPath {
        if priority >= IoPriority::DEFAULT {
            IoPath::Foreground
        } else {
            IoPath::Background
        }
    }
}

/// I/O scheduler configuration.
#[derive(Debug, Clone)]
pub struct IoPoolConfig {
    /// Number of foreground workers.
    pub foreground_workers: usize,
    /// Number of background workers.
    pub background_workers: usize,
    /// Maximum queued jobs per pool.
    pub queue_capacity: usize,
}

impl Default for IoPoolConfig {
    fn default() -> Self {
        Self {
            foreground_workers: 2,
            background_workers: 1,
            queue_capacity: 1024,
        }
    }
}

impl IoPoolConfig {
    /// Rejects zero-sized pools and queues.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.foreground_workers == 0 {
            return Err(ConfigError::ZeroField { field: "foreground_workers" });
        }
        if self.background_workers == 0 {
            return Err(ConfigError::ZeroField { field: "background_workers" });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroField { field: "queue_capacity" });
        }
        Ok(self)
    }
}

type IoTask = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Run(IoTask),

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

/// A reserved place in one pool's queue, released on drop.
pub struct QueueSlot {
    path: IoPath,
    _permit: OwnedSemaphorePermit,
}

impl QueueSlot {
    /// Pool the slot belongs to.
    #[must_use]
    pub const fn path(&self) -> IoPath {
        self.path
    }
}

impl fmt::Debug for QueueSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSlot").field("path", &self.path).finish()
    }
}

struct WorkerPool {
    path: IoPath,
    tx: Option<Sender<Job>>,
    slots: Arc<Semaphore>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn start(path: IoPath, workers: usize, queue_capacity: usize) -> io::Result<Self> {
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers.max(1) {
            let rx: Receiver<Job> = rx.clone();
            let thread_name = format!("kyroblock-io-{}-{idx}", path.as_str());
            let handle = thread::Builder::new().name(thread_name).spawn(move || loop {
                match rx.recv() {
                    Ok(Job::Run(task)) => task(),
                    Err(_) => break,

                    #[cfg(test)]
                    Ok(Job::Sleep { duration, reply }) => {
                        thread::sleep(duration);
                        let _ = reply.send(());
                    }
                }
            })?;
            handles.push(handle);
        }

        Ok(Self {
            path,
            tx: Some(tx),
            slots: Arc::new(Semaphore::new(queue_capacity)),
            workers: handles,
        })
    }

    fn disconnected(&self) -> StorageError {
        StorageError::Disconnected {
            path: self.path.as_str().to_string(),
        }
    }

    async fn reserve(&self) -> Result<QueueSlot, StorageError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| self.disconnected())?;
        Ok(QueueSlot {
            path: self.path,
            _permit: permit,
        })
    }

    fn submit(&self, job: Job) -> Result<(), StorageError> {
        let tx = self.tx.as_ref().ok_or_else(|| self.disconnected())?;
        tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => StorageError::QueueFull {
                path: self.path.as_str().to_string(),
            },
            TrySendError::Disconnected(_) => self.disconnected(),
        })
    }

    fn shutdown(&mut self) {
        // Close the channel: workers will drain queued jobs then exit.
        self.slots.close();
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!(path = self.path.as_str(), "I/O worker panicked");
            }
        }
    }
}

/// Two worker pools plus a router choosing between them.
pub struct IoScheduler<R: IoRouter = DefaultIoRouter> {
    router: R,
    foreground: WorkerPool,
    background: WorkerPool,
}

impl IoScheduler<DefaultIoRouter> {
    /// Starts a scheduler with the default router.
    pub fn start(config: &IoPoolConfig) -> Result<Self, StorageError> {
        Self::with_router(config, DefaultIoRouter)
    }
}

impl<R: IoRouter> IoScheduler<R> {
    /// Starts a scheduler with a custom router.
    pub fn with_router(config: &IoPoolConfig, router: R) -> Result<Self, StorageError> {
        let spawn_err = |e: io::Error| StorageError::io("spawn I/O worker", &e);
        let foreground =
            WorkerPool::start(IoPath::Foreground, config.foreground_workers, config.queue_capacity)
                .map_err(spawn_err)?;
        let background =
            WorkerPool::start(IoPath::Background, config.background_workers, config.queue_capacity)
                .map_err(spawn_err)?;
        Ok(Self {
            router,
            foreground,
            background,
        })
    }

    /// Waits for a free place in the queue of the pool chosen for `priority`.
    ///
    /// Suspends the calling task, never its thread. Hold the slot until the
    /// job submitted under it has finished.
    ///
    /// # Errors
    /// [`StorageError::Disconnected`] once the scheduler is shutting down.
    pub async fn reserve(&self, priority: IoPriority) -> Result<QueueSlot, StorageError> {
        self.pool(self.router.route(priority)).reserve().await
    }

    /// Runs `task` on the pool chosen for `priority`. Returns the chosen path.
    ///
    /// # Errors
    /// [`StorageError::QueueFull`] if the queue has no room, which cannot
    /// happen while every submitter holds a [`QueueSlot`].
    pub fn submit(
        &self,
        priority: IoPriority,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<IoPath, StorageError> {
        let path = self.router.route(priority);
        self.pool(path).submit(Job::Run(Box::new(task)))?;
        Ok(path)
    }

    fn pool(&self, path: IoPath) -> &WorkerPool {
        match path {
            IoPath::Foreground => &self.foreground,
            IoPath::Background => &self.background,
        }
    }

    #[cfg(test)]
    fn submit_sleep(&self, path: IoPath, duration: Duration) -> Result<Receiver<()>, StorageError> {
        let (tx, rx) = bounded::<()>(1);
        self.pool(path).submit(Job::Sleep { duration, reply: tx })?;
        Ok(rx)
    }
}

impl<R: IoRouter> Drop for IoScheduler<R> {
    fn drop(&mut self) {
        // Deterministic shutdown: queued writes still run before the workers exit.
        self.foreground.shutdown();
        self.background.shutdown();
    }
}
