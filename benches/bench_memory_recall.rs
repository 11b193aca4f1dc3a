use criterion::{black_box, criterion_group, criterion_main, Criterion};
use signal_controller::domain::{per_road, Road};
use signal_controller::memory::{fingerprint, MemoryRecord, MemoryStore};
use signal_controller::metrics::RoadMetrics;

fn metrics(waiting: u32) -> RoadMetrics {
    RoadMetrics {
        waiting_count: waiting,
        avg_wait_time: waiting as f64 * 0.5,
        cleared_last_interval: 0,
        arrival_rate_vpm: 4.0,
        departure_rate_vpm: 6.0,
        time_since_last_green: waiting as u64,
        congestion_percent: (waiting as f64 / 40.0 * 100.0).min(100.0),
        eta_clear_seconds: waiting as f64 / 0.1,
    }
}

fn seeded_store(records: usize) -> MemoryStore {
    let dir = std::env::temp_dir().join(format!("bench_memory_recall_{}", std::process::id()));
    let _ = std::fs::remove_file(&dir);
    let mut store = MemoryStore::load(&dir, records + 10);
    for i in 0..records {
        let waiting = (i % 40) as u32;
        let road_metrics = per_road(|_| metrics(waiting));
        store.add(MemoryRecord {
            sim_time: i as u64,
            state_queues: per_road(|r| road_metrics[&r].waiting_count as i64),
            state_vector: Some(fingerprint(&road_metrics)),
            action_road: Road::ALL[i % 4],
            action_duration: 20,
            reward: (i % 10) as f64 - 5.0,
            reason: "phase_end".into(),
        });
    }
    let _ = std::fs::remove_file(&dir);
    store
}

fn bench_memory_recall(c: &mut Criterion) {
    let store = seeded_store(2_000);
    let current = per_road(|_| metrics(15));

    c.bench_function("memory_recall_2000_records", |b| {
        b.iter(|| black_box(store.recall(&current, black_box(10_000))))
    });
}

criterion_group!(benches, bench_memory_recall);
criterion_main!(benches);
