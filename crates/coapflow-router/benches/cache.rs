//! Proxy cache benchmarks

use coapflow_core::{MediaType, Request, Response, ResponseCode};
use coapflow_router::{CacheConfig, ProxyCache};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn populated(entries: usize) -> ProxyCache {
    let cache = ProxyCache::new(CacheConfig::default());
    for i in 0..entries {
        let request = Request::get().with_proxy_uri(format!("coap://origin/sensor/{}", i));
        let response = Response::text(ResponseCode::Content, "21.5").with_max_age(3600);
        cache.cache_response(&request, &response);
    }
    cache
}

fn lookup_benchmark(c: &mut Criterion) {
    let cache = populated(1_000);
    let hit = Request::get()
        .with_proxy_uri("coap://origin/sensor/500")
        .with_accept(MediaType::TEXT_PLAIN);
    let fan_out = Request::get().with_proxy_uri("coap://origin/sensor/missing");

    c.bench_function("cache_lookup_hit", |b| {
        b.iter(|| black_box(cache.get_response(&hit)))
    });

    c.bench_function("cache_lookup_miss_fan_out", |b| {
        b.iter(|| black_box(cache.get_response(&fan_out)))
    });
}

fn insert_benchmark(c: &mut Criterion) {
    let cache = populated(0);
    let response = Response::text(ResponseCode::Content, "21.5").with_max_age(60);
    let mut i = 0u64;

    c.bench_function("cache_insert_with_eviction", |b| {
        b.iter(|| {
            i += 1;
            let request = Request::get().with_proxy_uri(format!("coap://origin/{}", i % 20_000));
            cache.cache_response(black_box(&request), black_box(&response));
        })
    });
}

criterion_group!(benches, lookup_benchmark, insert_benchmark);
criterion_main!(benches);
