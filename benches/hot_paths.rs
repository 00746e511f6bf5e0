use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use latency_indexer::latency::{sample_time, DeviceLinkCircuit, DeviceLinkLatencySample};
use latency_indexer::store::ipdv::{compute_ipdv, sort_samples};
use latency_indexer::store::memory::MemoryBackend;
use latency_indexer::store::Store;
use latency_indexer::telemetry::{DeviceLatencyTail, SamplesHeader};

const CIRCUITS: usize = 64;
const SAMPLES_PER_CIRCUIT: u32 = 160;

fn build_batch() -> Vec<DeviceLinkLatencySample> {
    let mut batch = Vec::with_capacity(CIRCUITS * SAMPLES_PER_CIRCUIT as usize);
    for link in 0..CIRCUITS {
        let circuit = DeviceLinkCircuit::new(
            format!("device-a-{link}"),
            format!("device-z-{link}"),
            format!("link-{link}"),
        );
        for idx in 0..SAMPLES_PER_CIRCUIT {
            // Every 17th probe is lost.
            let rtt = if idx % 17 == 0 { 0 } else { 4_000 + (idx * 37) % 900 };
            batch.push(DeviceLinkLatencySample::new(
                &circuit,
                100,
                idx,
                sample_time(1_600_000_000_000_000, 100_000, idx),
                rtt,
            ));
        }
    }
    // Fan-out collects in completion order, not key order.
    batch.reverse();
    batch
}

fn bench_ipdv(c: &mut Criterion) {
    let batch = build_batch();

    c.bench_function("ipdv/sort_and_derive_10k", |b| {
        b.iter_batched(
            || batch.clone(),
            |mut samples| {
                sort_samples(&mut samples);
                let rows = compute_ipdv(samples, Default::default());
                black_box(rows.len())
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_tail(c: &mut Criterion) {
    let circuit = DeviceLinkCircuit::new("device-a", "device-z", "link");
    let tail = DeviceLatencyTail {
        header: SamplesHeader {
            start_timestamp_us: 1_600_000_000_000_000,
            sampling_interval_us: 100_000,
            next_sample_index: 4_096,
        },
        start_index: 0,
        rtts_us: (0..4_096).map(|i| 4_000 + i % 500).collect(),
    };

    c.bench_function("refresh/device_tail_samples_4k", |b| {
        b.iter(|| {
            let samples = latency_indexer::refresh::device_tail_samples(
                black_box(&circuit),
                100,
                2_047,
                black_box(&tail),
            );
            black_box(samples.len())
        })
    });
}

fn bench_append(c: &mut Criterion) {
    let batch = build_batch();
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("build runtime");

    c.bench_function("store/append_memory_10k", |b| {
        b.to_async(&rt).iter_batched(
            || Store::new(MemoryBackend::new()),
            |store| {
                let batch = &batch;
                async move {
                    store
                        .append_device_link_latency_samples(batch)
                        .await
                        .expect("append");
                    black_box(store.backend().physical_row_count(
                        latency_indexer::latency::LatencyKind::DeviceLink,
                    ))
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_ipdv(c);
    bench_tail(c);
    bench_append(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
