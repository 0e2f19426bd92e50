//! Integration tests for the bridge
//!
//! Tests cover:
//! - Host functions called from the engine
//! - Class registration, construction and instance data
//! - Script-level subclasses of bridged classes
//! - Finalization of collected instances
//! - Class identity exhaustion and runtime limits
//! - Options loaded from JSON
//! - Functions, classes and instances shared between contexts of one runtime

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hostlink::{
    arg, ClassBuilder, ClassId, Context, EngineError, Error, Finalize, HostValue, Runtime,
    RuntimeOptions, Value,
};
use hostlink_engine::{PropertyFlags, MAX_CLASS_ID};
use parking_lot::Mutex;

struct Point {
    x: Mutex<f64>,
    y: f64,
}

fn point_class(ctx: &Context) -> (Value, ClassId) {
    ClassBuilder::new("Point")
        .constructor(|ctx, new_target, args| {
            let point = Point {
                x: Mutex::new(arg(args, 0)?),
                y: arg(args, 1)?,
            };
            ctx.create_instance(new_target, HostValue::new(point))
        })
        .method("norm", |ctx, this, _| {
            let data = ctx.any_instance_data(this)?;
            let point = data
                .downcast_ref::<Point>()
                .ok_or_else(|| ctx.throw_type_error("not a Point"))?;
            let x = *point.x.lock();
            Ok(Value::from((x * x + point.y * point.y).sqrt()))
        })
        .accessor(
            "x",
            |ctx, this| {
                let data = ctx.any_instance_data(this)?;
                let point = data
                    .downcast_ref::<Point>()
                    .ok_or_else(|| ctx.throw_type_error("not a Point"))?;
                let x = *point.x.lock();
                Ok(Value::from(x))
            },
            |ctx, this, value| {
                let data = ctx.any_instance_data(this)?;
                let point = data
                    .downcast_ref::<Point>()
                    .ok_or_else(|| ctx.throw_type_error("not a Point"))?;
                *point.x.lock() = arg(std::slice::from_ref(value), 0)?;
                Ok(())
            },
        )
        .static_method("origin", |ctx, this, _| {
            ctx.construct(this, &[Value::from(0), Value::from(0)])
        })
        .build(ctx)
        .unwrap()
}

#[test]
fn test_add_function() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    let add = ctx
        .function_with_length("add", 2, |_, _, args| {
            let a: i32 = arg(args, 0)?;
            let b: i32 = arg(args, 1)?;
            Ok(Value::from(a + b))
        })
        .unwrap();
    let globals = ctx.globals().unwrap();
    ctx.set(&globals, "add", add).unwrap();

    let add = ctx.get(&globals, "add").unwrap();
    let sum = ctx
        .call(&add, &Value::undefined(), &[Value::from(2), Value::from(3)])
        .unwrap();
    assert_eq!(sum.as_i32(), Some(5));
}

#[test]
fn test_wrong_argument_type_throws_type_error() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    let square = ctx
        .function("square", |_, _, args| {
            let n: f64 = arg(args, 0)?;
            Ok(Value::from(n * n))
        })
        .unwrap();
    let err = ctx
        .call(&square, &Value::undefined(), &[Value::from("three")])
        .unwrap_err();
    let exception = err.exception().unwrap();
    assert_eq!(exception.name(), "TypeError");
    assert!(exception.message().contains("expected number, got string"));
}

#[test]
fn test_point_construction_and_instance_data() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    let (point, class_id) = point_class(&ctx);

    let p = ctx
        .construct(&point, &[Value::from(3), Value::from(4)])
        .unwrap();
    assert!(ctx.is_instance_of(&p, class_id));

    let data = ctx.instance_data_as::<Point>(&p, class_id).unwrap();
    assert_eq!(*data.x.lock(), 3.0);
    assert_eq!(data.y, 4.0);

    let norm = ctx.get(&p, "norm").unwrap();
    assert_eq!(ctx.call(&norm, &p, &[]).unwrap().as_f64(), Some(5.0));

    // instance accessors are own properties of every instance
    assert!(ctx.engine().has_own_property(&p, "x").unwrap());
    ctx.set(&p, "x", 6.0).unwrap();
    assert_eq!(ctx.get(&p, "x").unwrap().as_f64(), Some(6.0));
    assert_eq!(*data.x.lock(), 6.0);
}

#[test]
fn test_static_method_constructs_through_this() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    let (point, class_id) = point_class(&ctx);
    let origin = ctx.get(&point, "origin").unwrap();
    let p = ctx.call(&origin, &point, &[]).unwrap();
    let data = ctx.instance_data_as::<Point>(&p, class_id).unwrap();
    assert_eq!(data.y, 0.0);
}

#[test]
fn test_constructor_requires_new() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    let (point, _) = point_class(&ctx);
    let err = ctx
        .call(&point, &Value::undefined(), &[Value::from(1), Value::from(2)])
        .unwrap_err();
    assert_eq!(err.exception().unwrap().name(), "TypeError");
}

#[test]
fn test_instance_data_checks_class() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    let (point, point_id) = point_class(&ctx);
    let (_, other_id) = ClassBuilder::new("Other")
        .constructor(|ctx, new_target, _| ctx.create_instance(new_target, HostValue::new(())))
        .build(&ctx)
        .unwrap();

    let p = ctx
        .construct(&point, &[Value::from(1), Value::from(2)])
        .unwrap();
    assert!(matches!(
        ctx.instance_data(&p, other_id),
        Err(Error::TypeMismatch(_))
    ));
    assert!(matches!(
        ctx.instance_data(&Value::from(1), point_id),
        Err(Error::TypeMismatch(_))
    ));
    let plain = ctx.object().unwrap();
    assert!(matches!(
        ctx.instance_data(&plain, point_id),
        Err(Error::TypeMismatch(_))
    ));
    assert!(matches!(
        ctx.instance_data_as::<String>(&p, point_id),
        Err(Error::TypeMismatch(_))
    ));
}

#[test]
fn test_script_subclass_of_bridged_class() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    let (point, class_id) = point_class(&ctx);

    let point3 = ctx.derive_class("Point3", &point).unwrap();
    let sub_proto = ctx.get(&point3, "prototype").unwrap();
    ctx.engine()
        .define_value(&sub_proto, "dims", &Value::from(3), PropertyFlags::DEFAULT)
        .unwrap();

    let p = ctx
        .construct(&point3, &[Value::from(3), Value::from(4)])
        .unwrap();
    assert!(ctx.is_instance_of(&p, class_id));
    assert!(ctx
        .engine()
        .prototype_of(&p)
        .unwrap()
        .same_object(&sub_proto));

    // own subclass members and inherited bridged members both resolve
    assert_eq!(ctx.get(&p, "dims").unwrap().as_i32(), Some(3));
    let norm = ctx.get(&p, "norm").unwrap();
    assert_eq!(ctx.call(&norm, &p, &[]).unwrap().as_f64(), Some(5.0));
    assert_eq!(
        ctx.instance_data_as::<Point>(&p, class_id).unwrap().y,
        4.0
    );
}

struct Tracked {
    finalized: Arc<AtomicUsize>,
}

impl Finalize for Tracked {
    fn finalize(&self) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_collected_instance_is_finalized_once() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finalized);
    let (tracked, _) = ClassBuilder::new("Tracked")
        .constructor(move |ctx, new_target, _| {
            let value = HostValue::finalizable(Tracked {
                finalized: Arc::clone(&counter),
            });
            ctx.create_instance(new_target, value)
        })
        .build(&ctx)
        .unwrap();

    let before = ctx.handle_count();
    let instance = ctx.construct(&tracked, &[]).unwrap();
    assert_eq!(ctx.handle_count(), before + 1);

    drop(instance);
    rt.run_gc();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.handle_count(), before);

    rt.run_gc();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn test_instance_released_on_other_thread() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finalized);
    let (tracked, _) = ClassBuilder::new("Tracked")
        .constructor(move |ctx, new_target, _| {
            let value = HostValue::finalizable(Tracked {
                finalized: Arc::clone(&counter),
            });
            ctx.create_instance(new_target, value)
        })
        .build(&ctx)
        .unwrap();

    let instance = ctx.construct(&tracked, &[]).unwrap();
    thread::spawn(move || drop(instance)).join().unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 0);
    rt.run_gc();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn test_class_unregistered_once_its_context_is_gone() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    let _ = point_class(&ctx);
    rt.run_gc();
    assert!(ctx.handle_count() > 0);
    assert_eq!(rt.registered_constructors(), 1);

    // the class prototype stays registered with the realm, so the class
    // lives until the context goes away
    drop(ctx);
    rt.run_gc();
    assert_eq!(rt.registered_constructors(), 0);
}

#[test]
fn test_context_close_releases_everything() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    let (point, _) = point_class(&ctx);
    let _p = ctx
        .construct(&point, &[Value::from(1), Value::from(2)])
        .unwrap();
    // constructor, norm, x getter + setter, origin, one instance
    assert_eq!(ctx.handle_count(), 6);
    assert_eq!(ctx.close(), 6);
    assert_eq!(ctx.handle_count(), 0);
}

#[test]
fn test_class_identity_exhaustion() {
    let rt = Runtime::new();
    let ctx = rt.new_context().unwrap();
    while rt.engine().new_class_id().is_ok() {}

    let result = ClassBuilder::new("Late")
        .constructor(|ctx, new_target, _| ctx.create_instance(new_target, HostValue::new(())))
        .method("m", |_, _, _| Ok(Value::undefined()))
        .build(&ctx);
    match result {
        Err(Error::Registration { source, .. }) => {
            assert!(matches!(source, EngineError::ClassLimit { max } if max == MAX_CLASS_ID));
        }
        Err(other) => panic!("expected registration error, got {other}"),
        Ok(_) => panic!("class identities should be exhausted"),
    }
    assert_eq!(ctx.handle_count(), 0);
}

#[test]
fn test_options_from_json() {
    let options: RuntimeOptions = serde_json::from_str(
        r#"{ "memory_limit": 1048576, "max_call_depth": 16 }"#,
    )
    .unwrap();
    assert_eq!(options.gc_threshold, None);
    assert_eq!(options.execute_timeout_ms, None);

    let rt = Runtime::with_options(options);
    assert_eq!(rt.memory_usage().limit, Some(1_048_576));
    assert_eq!(rt.engine().options().max_call_depth, Some(16));
}

#[test]
fn test_execute_timeout_interrupts_long_call() {
    let options = RuntimeOptions::new().with_execute_timeout(Duration::from_millis(5));
    let rt = Runtime::with_options(options);
    let ctx = rt.new_context().unwrap();
    let quick = ctx.function("quick", |_, _, _| Ok(Value::undefined())).unwrap();
    let inner = quick.clone();
    let slow = ctx
        .function("slow", move |ctx, _, _| {
            thread::sleep(Duration::from_millis(30));
            ctx.call(&inner, &Value::undefined(), &[])
        })
        .unwrap();

    let err = ctx.call(&slow, &Value::undefined(), &[]).unwrap_err();
    assert!(matches!(err, Error::Engine(EngineError::Interrupted)));
    // each outermost call gets a fresh budget
    assert!(ctx.call(&quick, &Value::undefined(), &[]).is_ok());
}

// ============================================================================
// Multiple contexts of one runtime
// ============================================================================

fn label_class(ctx: &Context) -> (Value, ClassId) {
    ClassBuilder::new("Label")
        .constructor(|ctx, new_target, args| {
            let text: String = arg(args, 0)?;
            ctx.create_instance(new_target, HostValue::new(text))
        })
        .build(ctx)
        .unwrap()
}

#[test]
fn test_instance_data_resolves_through_creating_context() {
    let rt = Runtime::new();
    let a = rt.new_context().unwrap();
    let b = rt.new_context().unwrap();
    let (label_a, id_a) = label_class(&a);
    let (label_b, id_b) = label_class(&b);

    // both instances sit under the same handle id in their own tables
    let ia = a.construct(&label_a, &[Value::from("belongs-to-A")]).unwrap();
    let ib = b.construct(&label_b, &[Value::from("belongs-to-B")]).unwrap();
    assert_eq!(a.handle_count(), b.handle_count());

    let typed = a.instance_data_as::<String>(&ib, id_b).unwrap();
    assert_eq!(typed.as_str(), "belongs-to-B");
    let any = a.any_instance_data(&ib).unwrap();
    assert_eq!(
        any.downcast_ref::<String>().map(String::as_str),
        Some("belongs-to-B")
    );
    let typed = b.instance_data_as::<String>(&ia, id_a).unwrap();
    assert_eq!(typed.as_str(), "belongs-to-A");

    assert!(matches!(
        a.instance_data(&ib, id_a),
        Err(Error::TypeMismatch(_))
    ));
}

#[test]
fn test_function_runs_in_the_context_that_bound_it() {
    let rt = Runtime::new();
    let a = rt.new_context().unwrap();
    let b = rt.new_context().unwrap();
    let handles = |ctx: &Context, _: &Value, _: &[Value]| -> hostlink::Result<Value> {
        Ok(Value::from(ctx.handle_count() as i32))
    };
    let count_a = a.function("count", handles).unwrap();
    let _count_b = b.function("count", handles).unwrap();
    let _extra_b = b.function("extra", handles).unwrap();

    let out = b.call(&count_a, &Value::undefined(), &[]).unwrap();
    assert_eq!(out.as_i32(), Some(1));
}

#[test]
fn test_class_constructed_from_another_context() {
    let rt = Runtime::new();
    let a = rt.new_context().unwrap();
    let b = rt.new_context().unwrap();
    let (label_a, id_a) = label_class(&a);
    let before_a = a.handle_count();

    let instance = b.construct(&label_a, &[Value::from("made-in-B")]).unwrap();
    assert_eq!(a.handle_count(), before_a + 1);
    assert_eq!(b.handle_count(), 0);

    let data = b.instance_data_as::<String>(&instance, id_a).unwrap();
    assert_eq!(data.as_str(), "made-in-B");
    drop(instance);
    rt.run_gc();
    assert_eq!(a.handle_count(), before_a);
}

struct Guarded {
    finalized: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl Finalize for Guarded {
    fn finalize(&self) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for Guarded {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_instance_outliving_its_context() {
    let rt = Runtime::new();
    let a = rt.new_context().unwrap();
    let b = rt.new_context().unwrap();
    let finalized = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));
    let (f, d) = (Arc::clone(&finalized), Arc::clone(&dropped));
    let (guarded, _) = ClassBuilder::new("Guarded")
        .constructor(move |ctx, new_target, _| {
            let value = HostValue::finalizable(Guarded {
                finalized: Arc::clone(&f),
                dropped: Arc::clone(&d),
            });
            ctx.create_instance(new_target, value)
        })
        .build(&a)
        .unwrap();
    let instance = a.construct(&guarded, &[]).unwrap();
    drop(guarded);

    // closing the creating context drops the value without its hook
    drop(a);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    assert!(matches!(
        b.any_instance_data(&instance),
        Err(Error::TypeMismatch(_))
    ));

    drop(instance);
    rt.run_gc();
    assert_eq!(finalized.load(Ordering::SeqCst), 0);

    // the surviving context is unaffected
    let (label, id) = label_class(&b);
    let ib = b.construct(&label, &[Value::from("still-here")]).unwrap();
    let data = b.instance_data_as::<String>(&ib, id).unwrap();
    assert_eq!(data.as_str(), "still-here");
}
