//! Promises
//!
//! A promise capability is a promise object plus its two resolving
//! functions. The pair shares one "already resolved" flag, so only the first
//! call of either function has an effect. Resolving with another promise
//! makes the first one follow the second.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::error::{ErrorKind, Result};
use crate::object::{Heap, ObjectData, ObjectId, ObjectKind};
use crate::value::{HeapValue, Value};

pub(crate) enum Settlement {
    Pending,
    Fulfilled(HeapValue),
    Rejected(HeapValue),
}

pub(crate) struct PromiseData {
    pub(crate) state: Settlement,
    /// Promises that adopted this one while it was pending
    pub(crate) dependents: Vec<ObjectId>,
}

impl PromiseData {
    pub(crate) fn pending() -> Self {
        Self {
            state: Settlement::Pending,
            dependents: Vec::new(),
        }
    }

    pub(crate) fn objects(&self, out: &mut Vec<ObjectId>) {
        match &self.state {
            Settlement::Fulfilled(value) | Settlement::Rejected(value) => {
                out.extend(value.object())
            }
            Settlement::Pending => {}
        }
        out.extend(self.dependents.iter().copied());
    }
}

#[derive(Clone)]
pub(crate) struct ResolvingFunction {
    pub(crate) promise: ObjectId,
    pub(crate) reject: bool,
    pub(crate) settled: Arc<AtomicBool>,
}

/// Observable state of a promise
#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

impl PromiseState {
    pub fn is_pending(&self) -> bool {
        matches!(self, PromiseState::Pending)
    }
}

/// A promise with its resolving functions
#[derive(Debug, Clone)]
pub struct PromiseCapability {
    pub promise: Value,
    pub resolve: Value,
    pub reject: Value,
}

impl Heap {
    /// Settle `promise` and, transitively, every promise following it.
    pub(crate) fn settle(&mut self, promise: ObjectId, fulfilled: bool, value: HeapValue) {
        let mut work = vec![promise];
        while let Some(id) = work.pop() {
            let dependents = {
                let Some(ObjectData {
                    kind: ObjectKind::Promise(data),
                    ..
                }) = self.get_mut(id)
                else {
                    continue;
                };
                if !matches!(data.state, Settlement::Pending) {
                    continue;
                }
                data.state = if fulfilled {
                    Settlement::Fulfilled(value.clone())
                } else {
                    Settlement::Rejected(value.clone())
                };
                std::mem::take(&mut data.dependents)
            };
            self.retain_value(&value);
            for dependent in dependents {
                work.push(dependent);
                self.release(dependent);
            }
        }
    }

    /// Make `dependent` follow `source`
    pub(crate) fn adopt(&mut self, source: ObjectId, dependent: ObjectId) {
        let settled = match self.get(source).map(|obj| &obj.kind) {
            Some(ObjectKind::Promise(data)) => match &data.state {
                Settlement::Pending => None,
                Settlement::Fulfilled(value) => Some((true, value.clone())),
                Settlement::Rejected(value) => Some((false, value.clone())),
            },
            _ => return,
        };
        match settled {
            Some((fulfilled, value)) => self.settle(dependent, fulfilled, value),
            None => {
                self.retain(dependent);
                if let Some(ObjectData {
                    kind: ObjectKind::Promise(data),
                    ..
                }) = self.get_mut(source)
                {
                    data.dependents.push(dependent);
                }
            }
        }
    }

    pub(crate) fn is_promise(&self, id: ObjectId) -> bool {
        matches!(
            self.get(id).map(|obj| &obj.kind),
            Some(ObjectKind::Promise(_))
        )
    }
}

impl Context {
    /// Create a pending promise together with its resolving functions
    pub fn new_promise_capability(&self) -> Result<PromiseCapability> {
        let promise_proto = self.intrinsic(|realm| realm.promise_proto)?;
        let function_proto = self.intrinsic(|realm| realm.function_proto)?;

        let (promise_id, promise) = self.alloc(ObjectData::new(
            self.realm(),
            Some(promise_proto),
            ObjectKind::Promise(PromiseData::pending()),
        ))?;
        let settled = Arc::new(AtomicBool::new(false));
        let resolving = |reject: bool| {
            ObjectData::new(
                self.realm(),
                Some(function_proto),
                ObjectKind::Resolving(ResolvingFunction {
                    promise: promise_id,
                    reject,
                    settled: Arc::clone(&settled),
                }),
            )
        };
        let (_, resolve) = self.alloc(resolving(false))?;
        let (_, reject) = self.alloc(resolving(true))?;

        Ok(PromiseCapability {
            promise,
            resolve,
            reject,
        })
    }

    pub fn is_promise(&self, value: &Value) -> bool {
        match value.object_id() {
            Some(id) if self.owns(value) => self.inner().heap.lock().is_promise(id),
            _ => false,
        }
    }

    /// State of `value` if it is a promise
    pub fn promise_state(&self, value: &Value) -> Option<PromiseState> {
        let id = value.object_id()?;
        if !self.owns(value) {
            return None;
        }
        let state = {
            let mut heap = self.inner().heap.lock();
            let state = match &heap.get(id)?.kind {
                ObjectKind::Promise(data) => match &data.state {
                    Settlement::Pending => None,
                    Settlement::Fulfilled(v) => Some((true, v.clone())),
                    Settlement::Rejected(v) => Some((false, v.clone())),
                },
                _ => return None,
            };
            if let Some((_, v)) = &state {
                heap.retain_value(v);
            }
            state
        };
        Some(match state {
            None => PromiseState::Pending,
            Some((true, v)) => PromiseState::Fulfilled(self.lift(v)),
            Some((false, v)) => PromiseState::Rejected(self.lift(v)),
        })
    }

    /// Drive the job queue until `value` settles.
    ///
    /// Non-promise values are returned as they are. A rejection is returned
    /// as an exception carrying the rejection reason.
    pub fn await_value(&self, value: &Value) -> Result<Value> {
        loop {
            match self.promise_state(value) {
                None => return Ok(value.clone()),
                Some(PromiseState::Fulfilled(v)) => return Ok(v),
                Some(PromiseState::Rejected(reason)) => return Err(self.throw_value(reason)),
                Some(PromiseState::Pending) => {
                    if !crate::job::run_next(self.inner())? {
                        return Err(self.throw(
                            ErrorKind::InternalError,
                            "promise is pending and the job queue is empty",
                        ));
                    }
                }
            }
        }
    }

    /// Invoke a resolving function
    pub(crate) fn run_resolving(&self, resolving: ResolvingFunction, value: &Value) -> Result<()> {
        if resolving.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if resolving.reject {
            return self.settle(resolving.promise, false, value);
        }
        if value.object_id() == Some(resolving.promise) {
            let err = self.new_error(ErrorKind::TypeError, "promise resolved with itself")?;
            return self.settle(resolving.promise, false, &err);
        }
        let hv = self.lower(value)?;
        let mut heap = self.inner().heap.lock();
        match hv.object() {
            Some(source) if heap.is_promise(source) => heap.adopt(source, resolving.promise),
            _ => heap.settle(resolving.promise, true, hv),
        }
        Ok(())
    }

    fn settle(&self, promise: ObjectId, fulfilled: bool, value: &Value) -> Result<()> {
        let hv = self.lower(value)?;
        self.inner().heap.lock().settle(promise, fulfilled, hv);
        Ok(())
    }
}
