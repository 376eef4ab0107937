//! Handler work dispatch.
//!
//! The session reader never runs user handlers inline: handler invocation
//! is submitted to a [`WorkPool`], and a submission that cannot be
//! accepted drops the message (the peer will retransmit a confirmable).
//! The trait keeps the pool pluggable; the default is a bounded wrapper
//! over tokio's blocking pool.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::Error;

/// A unit of handler work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Best-effort work submission: accepted or rejected, never queued
/// unboundedly and never blocking the caller.
pub trait WorkPool: Send + Sync {
    /// Submit a job. `Err(Error::Overloaded)` means the pool is saturated
    /// or shutting down and the job was not accepted.
    fn submit(&self, job: Job) -> Result<(), Error>;
}

/// Default pool: up to `capacity` jobs in flight on tokio's blocking
/// thread pool, refusals beyond that.
pub struct BoundedPool {
    permits: Arc<Semaphore>,
}

impl BoundedPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }
}

impl Default for BoundedPool {
    fn default() -> Self {
        Self::new(64)
    }
}

impl WorkPool for BoundedPool {
    fn submit(&self, job: Job) -> Result<(), Error> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::Overloaded)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job();
        });
        Ok(())
    }
}
