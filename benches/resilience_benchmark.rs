use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use rand::{thread_rng, Rng};
use travel_cache_resilience::cache_store::Freshness;
use travel_cache_resilience::rate_limiter::RateLimitStore;

pub fn rate_limit_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limit_increment");

    // Hot key vs keys spread across many clients
    for clients in [1usize, 1_000].iter() {
        group.bench_with_input(BenchmarkId::new("single_thread", clients), clients, |b, &clients| {
            let store = RateLimitStore::default();
            let keys: Vec<String> = (0..clients).map(|i| format!("general:10.0.{}.{}", i / 256, i % 256)).collect();
            let mut rng = thread_rng();
            b.iter(|| {
                let key = &keys[rng.gen_range(0..keys.len())];
                black_box(store.increment(key, Duration::from_secs(60)));
            });
        });
    }

    group.bench_function("contended_4_threads", |b| {
        b.iter(|| {
            let store = Arc::new(RateLimitStore::default());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let store = Arc::clone(&store);
                    thread::spawn(move || {
                        for i in 0..250 {
                            store.increment(&format!("search:10.0.0.{}", (t * 250 + i) % 8), Duration::from_secs(60));
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });

    group.finish();
}

pub fn freshness_benchmark(c: &mut Criterion) {
    let now = Utc::now();
    let threshold = chrono::Duration::hours(20);
    let mut rng = thread_rng();
    let samples: Vec<_> = (0..1_000)
        .map(|_| {
            let age = chrono::Duration::minutes(rng.gen_range(0..48 * 60));
            let last_updated = if rng.gen_bool(0.05) { None } else { Some(now - age) };
            (last_updated, now - age + chrono::Duration::hours(24))
        })
        .collect();

    c.bench_function("freshness_classify_1000", |b| {
        b.iter(|| {
            for (last_updated, expires_at) in &samples {
                black_box(Freshness::classify(*last_updated, *expires_at, now, threshold));
            }
        });
    });
}

criterion_group!(benches, rate_limit_benchmark, freshness_benchmark);
criterion_main!(benches);
