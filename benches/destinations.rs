use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use pasarela::routing::ErrorRateBlocker;
use pasarela::utils::{ip_fingerprint, split_addr_port};

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("split_addr_port", |b| {
        b.iter(|| {
            black_box(split_addr_port(black_box("db-3.example.com:3306")).unwrap());
        })
    });

    c.bench_function("blocker_should_block", |b| {
        let blocker = ErrorRateBlocker::new(100, Duration::from_secs(60));
        let keys: Vec<[u8; 16]> = (0..1024u32)
            .map(|i| {
                ip_fingerprint(Some(std::net::IpAddr::V4(std::net::Ipv4Addr::from(
                    0x0a000000 | i,
                ))))
            })
            .collect();
        for key in &keys {
            blocker.note_failure(key, "bench", "bench");
        }

        let mut index = 0usize;
        b.iter(|| {
            index = (index + 1) % keys.len();
            black_box(blocker.should_block(&keys[index]));
        })
    });

    c.bench_function("error_counter_churn", |b| {
        let blocker = ErrorRateBlocker::new(u64::MAX, Duration::ZERO);
        let key = ip_fingerprint(Some("10.1.2.3".parse().unwrap()));
        b.iter(|| {
            black_box(blocker.note_failure(&key, "10.1.2.3", "bench"));
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
