//! Benchmarks for code rewriting and dispatch.
//!
//! - Rewriting a class with many call sites
//! - Rewriting through a warm cache
//! - Decoding a class image
//! - Dispatching a rewritten call end to end

extern crate shadowbox;

use criterion::{criterion_group, criterion_main, Criterion};
use shadowbox::{code::ClassImage, prelude::*};
use std::{hint::black_box, sync::Arc};

/// A class whose `run()` performs `calls` instance calls on a counter.
fn busy_caller(calls: usize) -> Vec<u8> {
    ClassBuilder::new("app.Busy")
        .static_method("run", &[], ValueKind::Int, |asm| {
            asm.newobj("app.Counter", &[]).stloc(0);
            for _ in 0..calls {
                asm.ldloc(0)
                    .ldc(1)
                    .callvirt("app.Counter", "increment", &[ValueKind::Int], ValueKind::Int)
                    .pop();
            }
            asm.ldloc(0)
                .ldc(0)
                .callvirt("app.Counter", "increment", &[ValueKind::Int], ValueKind::Int)
                .ret();
        })
        .build()
        .unwrap()
}

fn counter() -> Vec<u8> {
    ClassBuilder::new("app.Counter")
        .constructor(&[], |asm| {
            asm.ldarg(0).ldc(0).stfld("count").ret();
        })
        .instance_method("increment", &[ValueKind::Int], ValueKind::Int, |asm| {
            asm.ldarg(0)
                .ldarg(0)
                .ldfld("count")
                .ldarg(1)
                .add()
                .stfld("count")
                .ldarg(0)
                .ldfld("count")
                .ret();
        })
        .build()
        .unwrap()
}

/// Benchmark rewriting a class with 1000 call sites.
fn bench_rewrite_cold(c: &mut Criterion) {
    let raw = busy_caller(1000);
    let policy = InstrumentationPolicy::builder().with_default_exclusions().build();

    c.bench_function("rewrite_1000_call_sites", |b| {
        b.iter(|| {
            let out = rewrite(black_box(&raw), "app.Busy", &policy).unwrap();
            black_box(out)
        });
    });
}

/// Benchmark the same rewrite answered from the cache.
fn bench_rewrite_cached(c: &mut Criterion) {
    let raw = busy_caller(1000);
    let policy = InstrumentationPolicy::default();
    let cache = RewriteCache::new();
    cache.rewrite(&raw, "app.Busy", &policy).unwrap();

    c.bench_function("rewrite_1000_call_sites_cached", |b| {
        b.iter(|| {
            let out = cache.rewrite(black_box(&raw), "app.Busy", &policy).unwrap();
            black_box(out)
        });
    });
}

/// Benchmark decoding a class image and all its bodies.
fn bench_parse_image(c: &mut Criterion) {
    let raw = busy_caller(1000);

    c.bench_function("parse_image_1000_call_sites", |b| {
        b.iter(|| {
            let image = ClassImage::parse(black_box(&raw)).unwrap();
            let bodies: usize = image
                .methods
                .iter()
                .map(|m| m.instructions().unwrap().len())
                .sum();
            black_box(bodies)
        });
    });
}

/// Benchmark running rewritten code with a shadowed callee.
fn bench_dispatch_shadowed(c: &mut Criterion) {
    let shadow = ShadowClass::new("bench.CounterShadow", "app.Counter")
        .state(|| 0_i64)
        .method("increment", &[ValueKind::Int], |ctx| {
            let by = ctx.arg(0)?.as_int()?;
            ctx.with_state(|n: &mut i64| {
                *n += by;
                Value::Int(*n)
            })
        });
    let source = MemoryClassSource::new()
        .with(counter())
        .unwrap()
        .with(busy_caller(100))
        .unwrap();
    let mut sandbox = Sandbox::builder(InstrumentationPolicy::default())
        .source(source)
        .config(SandboxConfig::permissive())
        .build()
        .unwrap();
    sandbox
        .install(
            ShadowMap::builder().add_shadow_class(Arc::new(shadow)).build(),
            Interceptors::new(),
        )
        .unwrap();
    sandbox.activate().unwrap();
    let busy = sandbox.load_class("app.Busy").unwrap();

    c.bench_function("dispatch_100_shadowed_calls", |b| {
        b.iter(|| black_box(busy.call_static("run", &[], vec![]).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_rewrite_cold,
    bench_rewrite_cached,
    bench_parse_image,
    bench_dispatch_shadowed
);
criterion_main!(benches);
