//! Pending job queue

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::error::Result;
use crate::object::RealmId;
use crate::runtime::RuntimeInner;

/// A deferred unit of work run by [`Runtime::execute_pending_jobs`](crate::Runtime::execute_pending_jobs)
pub type Job = Box<dyn FnOnce(&Context) -> Result<()> + Send>;

/// FIFO of jobs, each bound to the realm that enqueued it
pub(crate) struct JobQueue {
    jobs: Mutex<VecDeque<(RealmId, Job)>>,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, realm: RealmId, job: Job) {
        self.jobs.lock().push_back((realm, job));
    }

    fn pop(&self) -> Option<(RealmId, Job)> {
        self.jobs.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Drop every queued job; the closures are dropped after the lock is released
    pub(crate) fn clear(&self) {
        let drained = std::mem::take(&mut *self.jobs.lock());
        drop(drained);
    }
}

/// Run the oldest job. Returns `false` when the queue was empty.
pub(crate) fn run_next(rt: &Arc<RuntimeInner>) -> Result<bool> {
    let Some((realm, job)) = rt.jobs.pop() else {
        return Ok(false);
    };
    if !rt.realm_open(realm) {
        tracing::trace!(target: "hostlink_engine", realm = realm.0, "dropping job of closed context");
        return Ok(true);
    }
    let ctx = Context::borrowed(Arc::clone(rt), realm);
    job(&ctx)?;
    Ok(true)
}

impl Context {
    /// Queue `job` to run on this context
    pub fn enqueue_job<F>(&self, job: F)
    where
        F: FnOnce(&Context) -> Result<()> + Send + 'static,
    {
        self.inner().jobs.push(self.realm(), Box::new(job));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::runtime::Runtime;

    use super::*;

    #[test]
    fn test_jobs_run_in_order() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            ctx.enqueue_job(move |_| {
                order.lock().push(i);
                Ok(())
            });
        }
        assert!(rt.is_job_pending());
        assert_eq!(rt.execute_pending_jobs().unwrap(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(!rt.is_job_pending());
    }

    #[test]
    fn test_jobs_of_closed_context_are_dropped() {
        let rt = Runtime::new();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ctx = rt.new_context().unwrap();
            let ran = Arc::clone(&ran);
            ctx.enqueue_job(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        rt.execute_pending_jobs().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_job_stops_the_drain() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        ctx.enqueue_job(|ctx| Err(ctx.throw(crate::ErrorKind::Error, "boom")));
        ctx.enqueue_job(|_| Ok(()));
        let err = rt.execute_pending_jobs().unwrap_err();
        assert_eq!(err.exception().unwrap().message(), "boom");
        assert!(rt.is_job_pending());
    }
}
