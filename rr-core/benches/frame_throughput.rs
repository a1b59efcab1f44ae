//! Batch frame generation throughput over a synthetic 20-car field

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rr_core::model::{group_samples, Channels, EntityId, Sample, TimelineMap};
use rr_core::{FrameRequest, FrameRun};

fn field(cars: u32, seconds: i64) -> TimelineMap {
    let start = Utc.with_ymd_and_hms(2024, 3, 2, 15, 0, 0).unwrap();
    let samples = (0..cars).flat_map(|car| {
        (0..seconds * 4).map(move |k| {
            let phase = k as f64 * 0.01 + car as f64 * 0.3;
            Sample::new(
                EntityId(car + 1),
                start + Duration::milliseconds(k * 250 + (car as i64 * 7) % 40),
                Channels::position(phase.cos() * 4000.0, phase.sin() * 2500.0).with_speed(280.0),
            )
        })
    });
    group_samples(samples)
}

fn bench_batch(c: &mut Criterion) {
    let timelines = field(20, 600);
    let start = Utc.with_ymd_and_hms(2024, 3, 2, 15, 0, 0).unwrap();
    let request = FrameRequest::window(start, start + Duration::seconds(600)).stride_ms(100);

    let mut group = c.benchmark_group("frame_throughput");
    group.throughput(Throughput::Elements(request.frame_count()));
    group.bench_function("batch_600s_20_cars", |b| {
        b.iter(|| {
            let run = FrameRun::new(request.clone(), timelines.clone(), true);
            black_box(run.count())
        })
    });
    group.bench_function("delta_600s_20_cars", |b| {
        let request = request.clone().delta(true);
        b.iter(|| {
            let run = FrameRun::new(request.clone(), timelines.clone(), false);
            black_box(run.count())
        })
    });
    group.finish();
}

criterion_group!(benches, bench_batch);
criterion_main!(benches);
