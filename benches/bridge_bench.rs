use criterion::{black_box, criterion_group, criterion_main, Criterion};
use jsc_napi_bridge::engine::heap::HeapEngine;
use jsc_napi_bridge::{CallMode, Env, EnvConfig, QueueExecutor};
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

fn new_env() -> (std::rc::Rc<Env<HeapEngine>>, Arc<QueueExecutor>) {
    let executor = Arc::new(QueueExecutor::new());
    let env = Env::new(HeapEngine::new(), executor.clone(), EnvConfig::default());
    (env, executor)
}

fn bench_strings(c: &mut Criterion) {
    let (env, _executor) = new_env();
    let mut buffer = [0u8; 64];
    c.bench_function("string_utf8_round_trip", |b| {
        b.iter(|| {
            let value = env.create_string_utf8(black_box(b"hello bridge")).unwrap();
            env.get_value_string_utf8(&value, Some(&mut buffer)).unwrap()
        })
    });
}

fn bench_bigint(c: &mut Criterion) {
    let (env, _executor) = new_env();
    c.bench_function("bigint_int64_round_trip", |b| {
        b.iter(|| {
            let value = env.create_bigint_int64(black_box(-1 << 50)).unwrap();
            env.get_value_bigint_int64(&value).unwrap()
        })
    });
}

fn bench_references(c: &mut Criterion) {
    let (env, _executor) = new_env();
    let object = env.create_object().unwrap();
    c.bench_function("reference_ref_unref", |b| {
        let reference = env.create_reference(&object, 0).unwrap();
        b.iter(|| {
            env.reference_ref(&reference).unwrap();
            env.reference_unref(&reference).unwrap()
        })
    });
}

fn count(
    _env: &Env<HeapEngine>,
    _function: Option<jsc_napi_bridge::engine::heap::HeapValue>,
    _context: *mut c_void,
    data: *mut c_void,
) {
    black_box(data);
}

fn bench_threadsafe_calls(c: &mut Criterion) {
    let (env, executor) = new_env();
    let tsfn = env
        .create_threadsafe_function(None, 0, 1, ptr::null_mut(), None, ptr::null_mut(), Some(count))
        .unwrap();
    c.bench_function("threadsafe_call_dispatch_100", |b| {
        b.iter(|| {
            for i in 0..100usize {
                tsfn.call(i as *mut c_void, CallMode::NonBlocking).unwrap();
            }
            executor.run_pending()
        })
    });
}

criterion_group!(
    benches,
    bench_strings,
    bench_bigint,
    bench_references,
    bench_threadsafe_calls
);
criterion_main!(benches);
