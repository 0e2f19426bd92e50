//! Runtimes
//!
//! A [`Runtime`] owns one object heap, the class identity table, the job
//! queue and the native handler. It is pinned to the thread that created it;
//! only [`Value`](crate::Value)s may travel to other threads.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::class::{ClassDef, ClassId, ClassTable, Finalized};
use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::job::{self, JobQueue};
use crate::native::{FreedFunction, NativeHandler, UnboundHandler};
use crate::object::{
    Freed, Heap, ObjectData, ObjectId, ObjectKind, Property, PropertyFlags, RealmId, OBJECT_COST,
};
use crate::options::RuntimeOptions;
use crate::value::HeapValue;

/// Number of objects every new realm allocates
const INTRINSIC_OBJECTS: usize = 5;

/// Callback polled on every call; returning `true` interrupts execution
pub type InterruptHandler = Box<dyn FnMut() -> bool + Send>;

/// Heap statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Objects not yet freed, including ones queued for the sweep
    pub objects: usize,
    /// Accounted bytes
    pub bytes: usize,
    pub limit: Option<usize>,
    pub allocations_since_gc: usize,
}

/// Per-context state: intrinsics, class prototypes and host userdata
pub(crate) struct Realm {
    pub(crate) global: ObjectId,
    pub(crate) object_proto: ObjectId,
    pub(crate) function_proto: ObjectId,
    pub(crate) error_proto: ObjectId,
    pub(crate) promise_proto: ObjectId,
    pub(crate) class_protos: FxHashMap<ClassId, ObjectId>,
    pub(crate) userdata: Option<Arc<dyn Any + Send + Sync>>,
}

impl Realm {
    fn roots(&self) -> Vec<ObjectId> {
        let mut roots = vec![
            self.global,
            self.object_proto,
            self.function_proto,
            self.error_proto,
            self.promise_proto,
        ];
        roots.extend(self.class_protos.values().copied());
        roots
    }

    fn build(heap: &mut Heap, realm: RealmId) -> Result<Realm> {
        if let Some(limit) = heap.limit() {
            if (heap.live() + INTRINSIC_OBJECTS) * OBJECT_COST > limit {
                return Err(EngineError::OutOfMemory { limit });
            }
        }
        let object_proto = heap.alloc(ObjectData::new(realm, None, ObjectKind::Ordinary))?;
        let derived = |kind| ObjectData::new(realm, Some(object_proto), kind);
        let function_proto = heap.alloc(derived(ObjectKind::Ordinary))?;
        let error_proto = heap.alloc(
            derived(ObjectKind::Ordinary)
                .with_property("name", hidden_string("Error"))
                .with_property("message", hidden_string("")),
        )?;
        let promise_proto = heap.alloc(derived(ObjectKind::Ordinary))?;
        let global = heap.alloc(derived(ObjectKind::Ordinary))?;
        Ok(Realm {
            global,
            object_proto,
            function_proto,
            error_proto,
            promise_proto,
            class_protos: FxHashMap::default(),
            userdata: None,
        })
    }
}

fn hidden_string(s: &str) -> Property {
    Property::Data {
        value: HeapValue::String(Arc::from(s)),
        flags: PropertyFlags::HIDDEN,
    }
}

pub(crate) struct RuntimeInner {
    pub(crate) heap: Mutex<Heap>,
    pub(crate) realms: Mutex<Vec<Option<Realm>>>,
    pub(crate) classes: RwLock<ClassTable>,
    pub(crate) jobs: JobQueue,
    handler: RwLock<Arc<dyn NativeHandler>>,
    interrupt: Mutex<Option<InterruptHandler>>,
    options: RwLock<RuntimeOptions>,
    depth: AtomicUsize,
    call_started: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

/// Tracks one level of call nesting
pub(crate) struct CallFrame<'a> {
    rt: &'a RuntimeInner,
}

impl Drop for CallFrame<'_> {
    fn drop(&mut self) {
        self.rt.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RuntimeInner {
    fn new(options: RuntimeOptions) -> Self {
        Self {
            heap: Mutex::new(Heap::new(options.memory_limit)),
            realms: Mutex::new(Vec::new()),
            classes: RwLock::new(ClassTable::new()),
            jobs: JobQueue::new(),
            handler: RwLock::new(Arc::new(UnboundHandler)),
            interrupt: Mutex::new(None),
            options: RwLock::new(options),
            depth: AtomicUsize::new(0),
            call_started: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self, id: ObjectId) {
        if !self.is_closed() {
            self.heap.lock().retain(id);
        }
    }

    pub(crate) fn release(&self, id: ObjectId) {
        if !self.is_closed() {
            self.heap.lock().release(id);
        }
    }

    pub(crate) fn handler(&self) -> Arc<dyn NativeHandler> {
        Arc::clone(&self.handler.read())
    }

    pub(crate) fn realm_open(&self, realm: RealmId) -> bool {
        matches!(self.realms.lock().get(realm.0 as usize), Some(Some(_)))
    }

    pub(crate) fn realm_data(&self, realm: RealmId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.realms
            .lock()
            .get(realm.0 as usize)
            .and_then(Option::as_ref)
            .and_then(|r| r.userdata.clone())
    }

    /// Enter one call level, enforcing depth, interrupt and timeout limits.
    pub(crate) fn enter(&self) -> Result<CallFrame<'_>> {
        if self.is_closed() {
            return Err(EngineError::RuntimeClosed);
        }
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        let frame = CallFrame { rt: self };

        if depth == 1 {
            *self.call_started.lock() = Some(Instant::now());
            let threshold = self.options.read().gc_threshold;
            if let Some(threshold) = threshold {
                let due = self.heap.lock().allocations() >= threshold;
                if due {
                    self.collect(true);
                }
            }
        }

        let max_depth = self.options.read().max_call_depth;
        if let Some(max) = max_depth {
            if depth > max {
                return Err(EngineError::StackOverflow { max });
            }
        }
        if self.interrupted() {
            return Err(EngineError::Interrupted);
        }
        Ok(frame)
    }

    fn interrupted(&self) -> bool {
        {
            let mut interrupt = self.interrupt.lock();
            if let Some(handler) = interrupt.as_mut() {
                if handler() {
                    return true;
                }
            }
        }
        let timeout = self.options.read().execute_timeout();
        let started = *self.call_started.lock();
        match (timeout, started) {
            (Some(timeout), Some(started)) => started.elapsed() > timeout,
            _ => false,
        }
    }

    /// Sweep queued objects (and cycles when asked), then report every free.
    pub(crate) fn collect(&self, cycles: bool) {
        let mut detect = cycles;
        loop {
            let freed = {
                let mut heap = self.heap.lock();
                if detect {
                    heap.collect_cycles()
                } else {
                    heap.free_pending()
                }
            };
            detect = false;
            if freed.is_empty() {
                break;
            }
            tracing::trace!(target: "hostlink_engine", count = freed.len(), "freed objects");
            self.notify_freed(freed);
        }
    }

    /// Run finalizers and release hooks. No lock is held while they run.
    fn notify_freed(&self, freed: Vec<Freed>) {
        let handler = self.handler();
        for f in freed {
            let realm_data = self.realm_data(f.realm);
            if let Some(native) = f.native {
                handler.release(FreedFunction {
                    object: f.id,
                    kind: native.kind,
                    tag: native.tag,
                    magic: native.magic,
                    realm_data: realm_data.clone(),
                });
            }
            if let Some(class_id) = f.class_id {
                let finalizer = self.classes.read().finalizer(class_id);
                if let Some(finalizer) = finalizer {
                    finalizer(Finalized {
                        object: f.id,
                        class_id,
                        opaque: f.opaque,
                        realm_data,
                    });
                }
            }
        }
    }

    pub(crate) fn close_realm(&self, realm: RealmId) {
        let taken = self
            .realms
            .lock()
            .get_mut(realm.0 as usize)
            .and_then(Option::take);
        let Some(state) = taken else {
            return;
        };
        if !self.is_closed() {
            let mut heap = self.heap.lock();
            for root in state.roots() {
                heap.release(root);
            }
        }
        // userdata may hold values; drop it with no lock held
        drop(state);
    }

    fn shutdown(&self) {
        if self.is_closed() {
            return;
        }
        let realms: Vec<Realm> = self
            .realms
            .lock()
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        {
            let mut heap = self.heap.lock();
            for realm in &realms {
                for root in realm.roots() {
                    heap.release(root);
                }
            }
        }
        drop(realms);
        self.jobs.clear();
        self.collect(true);

        // whatever is left is still referenced from host values
        let leftover = self.heap.lock().free_all();
        if !leftover.is_empty() {
            tracing::debug!(
                target: "hostlink_engine",
                count = leftover.len(),
                "freeing objects still referenced at teardown"
            );
        }
        self.notify_freed(leftover);
        self.closed.store(true, Ordering::Release);
        self.jobs.clear();
        self.classes.write().clear();
    }
}

/// An engine instance
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_options(RuntimeOptions::default())
    }

    pub fn with_options(options: RuntimeOptions) -> Self {
        Self {
            inner: Arc::new(RuntimeInner::new(options)),
            _not_send: PhantomData,
        }
    }

    pub fn options(&self) -> RuntimeOptions {
        self.inner.options.read().clone()
    }

    /// Create a new context (realm) with its own global object
    pub fn new_context(&self) -> Result<Context> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(EngineError::RuntimeClosed);
        }
        let realm = {
            let mut realms = inner.realms.lock();
            realms.push(None);
            RealmId((realms.len() - 1) as u32)
        };
        let state = Realm::build(&mut inner.heap.lock(), realm)?;
        if let Some(slot) = inner.realms.lock().get_mut(realm.0 as usize) {
            *slot = Some(state);
        }
        Ok(Context::owned(Arc::clone(inner), realm))
    }

    /// Install the handler that receives every native function call
    pub fn set_native_handler(&self, handler: Arc<dyn NativeHandler>) {
        *self.inner.handler.write() = handler;
    }

    /// Allocate a fresh class identity
    pub fn new_class_id(&self) -> Result<ClassId> {
        self.inner.classes.write().allocate()
    }

    /// Define an allocated class identity
    pub fn new_class(&self, id: ClassId, def: ClassDef) -> Result<()> {
        self.inner.classes.write().define(id, def)
    }

    pub fn is_registered_class(&self, id: ClassId) -> bool {
        self.inner.classes.read().is_defined(id)
    }

    pub fn class_name(&self, id: ClassId) -> Option<String> {
        self.inner.classes.read().name(id).map(str::to_string)
    }

    /// Number of class identities handed out so far
    pub fn class_count(&self) -> usize {
        self.inner.classes.read().allocated()
    }

    /// Free queued objects and unreachable cycles, running finalizers
    pub fn run_gc(&self) {
        self.inner.collect(true);
    }

    /// Run one job. Returns `false` when none was pending.
    pub fn execute_pending_job(&self) -> Result<bool> {
        job::run_next(&self.inner)
    }

    /// Run jobs until the queue is empty, returning how many ran
    pub fn execute_pending_jobs(&self) -> Result<usize> {
        let mut ran = 0;
        while self.execute_pending_job()? {
            ran += 1;
        }
        Ok(ran)
    }

    pub fn is_job_pending(&self) -> bool {
        self.inner.jobs.len() > 0
    }

    pub fn set_interrupt_handler<F>(&self, handler: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        *self.inner.interrupt.lock() = Some(Box::new(handler));
    }

    pub fn clear_interrupt_handler(&self) {
        let old = self.inner.interrupt.lock().take();
        drop(old);
    }

    pub fn set_memory_limit(&self, limit: Option<usize>) {
        self.inner.options.write().memory_limit = limit;
        self.inner.heap.lock().set_limit(limit);
    }

    pub fn set_gc_threshold(&self, threshold: Option<usize>) {
        self.inner.options.write().gc_threshold = threshold;
    }

    pub fn set_max_call_depth(&self, depth: Option<usize>) {
        self.inner.options.write().max_call_depth = depth;
    }

    pub fn set_execute_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map(|t| t.as_millis().min(u64::MAX as u128) as u64);
        self.inner.options.write().execute_timeout_ms = ms;
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let heap = self.inner.heap.lock();
        MemoryUsage {
            objects: heap.live(),
            bytes: heap.bytes(),
            limit: heap.limit(),
            allocations_since_gc: heap.allocations(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::value::Value;

    #[test]
    fn test_new_context_allocates_intrinsics() {
        let rt = Runtime::new();
        let before = rt.memory_usage().objects;
        let ctx = rt.new_context().unwrap();
        assert_eq!(rt.memory_usage().objects, before + INTRINSIC_OBJECTS);
        drop(ctx);
        rt.run_gc();
        assert_eq!(rt.memory_usage().objects, before);
    }

    #[test]
    fn test_finalizer_runs_once_on_gc() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let class_id = rt.new_class_id().unwrap();
        let counter = Arc::clone(&hits);
        rt.new_class(
            class_id,
            ClassDef::new("Res").with_finalizer(Arc::new(move |f: Finalized| {
                assert_eq!(f.opaque, 7);
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        let obj = ctx
            .new_object_proto_class(&Value::null(), class_id)
            .unwrap();
        ctx.set_opaque(&obj, 7).unwrap();
        let copy = obj.clone();
        drop(obj);
        rt.run_gc();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        drop(copy);
        rt.run_gc();
        rt.run_gc();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_finalizes_leftovers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let leaked;
        {
            let rt = Runtime::new();
            let ctx = rt.new_context().unwrap();
            let class_id = rt.new_class_id().unwrap();
            let counter = Arc::clone(&hits);
            rt.new_class(
                class_id,
                ClassDef::new("Leak").with_finalizer(Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
            leaked = ctx
                .new_object_proto_class(&Value::null(), class_id)
                .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // dropping a value after teardown is a no-op
        drop(leaked);
    }

    #[test]
    fn test_memory_limit_blocks_allocation() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let usage = rt.memory_usage();
        rt.set_memory_limit(Some(usage.bytes + OBJECT_COST));
        let _one = ctx.new_object().unwrap();
        assert!(matches!(
            ctx.new_object(),
            Err(EngineError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_gc_threshold_collects_at_call_entry() {
        let rt = Runtime::with_options(RuntimeOptions::new().with_gc_threshold(1));
        let ctx = rt.new_context().unwrap();
        drop(ctx.new_object().unwrap());
        let before = rt.memory_usage().objects;
        let cap = ctx.new_promise_capability().unwrap();
        ctx.call(&cap.resolve, &Value::undefined(), &[]).unwrap();
        assert!(rt.memory_usage().objects < before + 3);
    }

    #[test]
    fn test_closed_runtime_rejects_new_contexts() {
        let rt = Runtime::new();
        rt.inner.shutdown();
        assert!(rt.is_closed());
        assert!(matches!(rt.new_context(), Err(EngineError::RuntimeClosed)));
    }
}
