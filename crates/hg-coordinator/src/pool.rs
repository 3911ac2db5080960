//! WorkerPool - bounded background execution per priority class
//!
//! Each pool owns:
//! - A bounded submission queue drained by a single dispatcher task
//! - A semaphore capping concurrent jobs
//! - An optional governor rate limit applied before a job takes a permit
//!
//! Critical and standard work get separate pools, so a flood of standard
//! events can fill its own queue and permits without touching critical
//! capacity.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::CoordinatorError;

const QUEUE_CAPACITY_MULTIPLIER: u32 = 64;
const MIN_QUEUE_CAPACITY: u32 = 256;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolClass {
    Critical,
    Standard,
}

impl PoolClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolClass::Critical => "critical",
            PoolClass::Standard => "standard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub class: PoolClass,
    pub concurrency: u32,
    pub rate_limit_per_minute: Option<u32>,
}

impl PoolConfig {
    pub fn queue_capacity(&self) -> u32 {
        std::cmp::max(self.concurrency.saturating_mul(QUEUE_CAPACITY_MULTIPLIER), MIN_QUEUE_CAPACITY)
    }
}

/// Unit of background work
pub struct PoolJob {
    pub provider_id: String,
    pub event_id: String,
    pub work: BoxFuture<'static, ()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub class: PoolClass,
    pub concurrency: u32,
    pub active_workers: u32,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub running: bool,
}

pub struct WorkerPool {
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    rate_limiter: Option<Arc<DirectLimiter>>,
    sender: Mutex<Option<mpsc::Sender<PoolJob>>>,
    running: AtomicBool,
    queue_size: Arc<AtomicU32>,
    active_workers: Arc<AtomicU32>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let rate_limiter = config
            .rate_limit_per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))));

        Self {
            config,
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1) as usize)),
            rate_limiter,
            sender: Mutex::new(None),
            running: AtomicBool::new(false),
            queue_size: Arc::new(AtomicU32::new(0)),
            active_workers: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Spawn the dispatcher. Must run inside a Tokio runtime.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = mpsc::channel(self.config.queue_capacity() as usize);
        *self.sender.lock() = Some(tx);

        info!(
            pool = self.config.class.as_str(),
            concurrency = self.config.concurrency,
            rate_limit = ?self.config.rate_limit_per_minute,
            "Starting worker pool"
        );

        tokio::spawn(Self::run_dispatcher(
            self.config.class,
            rx,
            self.semaphore.clone(),
            self.rate_limiter.clone(),
            self.queue_size.clone(),
            self.active_workers.clone(),
        ));
    }

    pub fn submit(&self, job: PoolJob) -> Result<(), CoordinatorError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ShuttingDown);
        }

        let sender = self.sender.lock().clone().ok_or(CoordinatorError::ShuttingDown)?;
        let capacity = self.config.queue_capacity();
        if self.queue_size.load(Ordering::SeqCst) >= capacity {
            debug!(pool = self.config.class.as_str(), capacity = capacity, "Pool at capacity, rejecting");
            return Err(CoordinatorError::PoolSaturated { pool: self.config.class.as_str() });
        }

        self.queue_size.fetch_add(1, Ordering::SeqCst);
        sender.try_send(job).map_err(|e| {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            match e {
                mpsc::error::TrySendError::Full(_) => CoordinatorError::PoolSaturated { pool: self.config.class.as_str() },
                mpsc::error::TrySendError::Closed(_) => CoordinatorError::ShuttingDown,
            }
        })
    }

    async fn run_dispatcher(
        class: PoolClass,
        mut rx: mpsc::Receiver<PoolJob>,
        semaphore: Arc<Semaphore>,
        rate_limiter: Option<Arc<DirectLimiter>>,
        queue_size: Arc<AtomicU32>,
        active_workers: Arc<AtomicU32>,
    ) {
        debug!(pool = class.as_str(), "Dispatcher started");

        while let Some(job) = rx.recv().await {
            if let Some(limiter) = &rate_limiter {
                if limiter.check().is_err() {
                    debug!(pool = class.as_str(), event_id = %job.event_id, "Rate limited, waiting");
                    limiter.until_ready().await;
                }
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(pool = class.as_str(), "Semaphore closed, dispatcher exiting");
                    queue_size.fetch_sub(1, Ordering::SeqCst);
                    break;
                }
            };

            // Count as active before leaving the queue so drain never sees a gap
            active_workers.fetch_add(1, Ordering::SeqCst);
            queue_size.fetch_sub(1, Ordering::SeqCst);

            let active = active_workers.clone();
            let PoolJob { provider_id, event_id, work } = job;
            tokio::spawn(async move {
                debug!(pool = class.as_str(), provider_id = %provider_id, event_id = %event_id, "Job started");
                work.await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        debug!(pool = class.as_str(), "Dispatcher exited");
    }

    /// Stop accepting work; queued jobs still run
    pub fn drain(&self) {
        info!(pool = self.config.class.as_str(), "Draining pool");
        self.running.store(false, Ordering::SeqCst);
        self.sender.lock().take();
    }

    pub fn is_fully_drained(&self) -> bool {
        self.queue_size.load(Ordering::SeqCst) == 0 && self.active_workers.load(Ordering::SeqCst) == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn class(&self) -> PoolClass {
        self.config.class
    }

    pub fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn get_stats(&self) -> PoolStats {
        PoolStats {
            class: self.config.class,
            concurrency: self.config.concurrency,
            active_workers: self.active_workers(),
            queue_size: self.queue_size(),
            queue_capacity: self.config.queue_capacity(),
            rate_limit_per_minute: self.config.rate_limit_per_minute,
            running: self.is_running(),
        }
    }
}
