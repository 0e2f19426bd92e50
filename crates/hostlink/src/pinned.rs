//! A runtime pinned to a dedicated thread
//!
//! The engine must only be driven from the thread that created it.
//! [`PinnedRuntime`] owns that thread: it creates a [`Runtime`] and one
//! [`Context`] there and runs closures shipped to it over a channel, one at a
//! time, in submission order.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use hostlink_engine::RuntimeOptions;
use tracing::{debug, error};

use crate::context::Context;
use crate::dispatch::panic_message;
use crate::error::{Error, Result};
use crate::runtime::Runtime;

type Task = Box<dyn FnOnce(&Runtime, &Context) + Send>;

/// Handle to a runtime living on its own thread.
///
/// The handle is `Send + Sync`; any thread may submit work. Dropping it stops
/// the thread after the queued work has run, then joins it.
pub struct PinnedRuntime {
    tasks: Option<Sender<Task>>,
    thread: Option<JoinHandle<()>>,
}

impl PinnedRuntime {
    /// Start the engine thread and create its runtime and context
    pub fn spawn(options: RuntimeOptions) -> Result<Self> {
        let (task_tx, task_rx) = channel::unbounded::<Task>();
        let (ready_tx, ready_rx) = channel::bounded::<Result<()>>(1);

        let thread = thread::Builder::new()
            .name("hostlink-engine".to_string())
            .spawn(move || {
                let rt = Runtime::with_options(options);
                let ctx = match rt.new_context() {
                    Ok(ctx) => ctx,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while let Ok(task) = task_rx.recv() {
                    task(&rt, &ctx);
                }
                debug!(target: "hostlink", "engine thread stopping");
            })
            .map_err(|e| Error::host(format!("failed to spawn engine thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                tasks: Some(task_tx),
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Disconnected)
            }
        }
    }

    /// Run `f` on the engine thread and wait for its result.
    ///
    /// A panic in `f` is reported as [`Error::Host`]; the thread keeps
    /// serving later calls.
    pub fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Runtime, &Context) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let tasks = self.tasks.as_ref().ok_or(Error::Disconnected)?;
        let (result_tx, result_rx) = channel::bounded::<Result<R>>(1);
        let task: Task = Box::new(move |rt, ctx| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(rt, ctx))).unwrap_or_else(
                |payload| {
                    let message = panic_message(payload.as_ref());
                    error!(target: "hostlink", "task panicked on engine thread: {message}");
                    Err(Error::host(format!("task panicked: {message}")))
                },
            );
            let _ = result_tx.send(result);
        });
        tasks.send(task).map_err(|_| Error::Disconnected)?;
        result_rx.recv().map_err(|_| Error::Disconnected)?
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map_or(false, |thread| !thread.is_finished())
    }
}

impl Drop for PinnedRuntime {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.tasks.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(target: "hostlink", "engine thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hostlink_engine::Value;

    use super::*;
    use crate::function::arg;

    #[test]
    fn test_state_persists_between_runs() {
        let pinned = PinnedRuntime::spawn(RuntimeOptions::default()).unwrap();
        pinned
            .run(|_, ctx| {
                let globals = ctx.globals()?;
                let double = ctx.function("double", |_, _, args| {
                    let n: i32 = arg(args, 0)?;
                    Ok(Value::from(n * 2))
                })?;
                ctx.set(&globals, "double", double)
            })
            .unwrap();

        let doubled = pinned
            .run(|_, ctx| {
                let globals = ctx.globals()?;
                let double = ctx.get(&globals, "double")?;
                let out = ctx.call(&double, &Value::undefined(), &[Value::from(21)])?;
                Ok(out.as_i32())
            })
            .unwrap();
        assert_eq!(doubled, Some(42));
    }

    #[test]
    fn test_submissions_from_many_threads() {
        let pinned = Arc::new(PinnedRuntime::spawn(RuntimeOptions::default()).unwrap());
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let pinned = Arc::clone(&pinned);
                std::thread::spawn(move || {
                    pinned
                        .run(move |_, ctx| {
                            let obj = ctx.object()?;
                            ctx.set(&obj, "i", i)?;
                            Ok(ctx.get(&obj, "i")?.as_i32())
                        })
                        .unwrap()
                })
            })
            .collect();
        let mut seen: Vec<_> = workers
            .into_iter()
            .map(|w| w.join().unwrap().unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_panicking_task_keeps_thread_alive() {
        let pinned = PinnedRuntime::spawn(RuntimeOptions::default()).unwrap();
        let err = pinned
            .run(|_, _| -> Result<()> { panic!("task blew up") })
            .unwrap_err();
        assert!(matches!(err, Error::Host(ref m) if m.contains("task blew up")));
        assert!(pinned.is_running());
        assert_eq!(pinned.run(|_, _| Ok(7)).unwrap(), 7);
    }
}
