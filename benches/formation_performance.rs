//! Performance benchmarks for match formation and rating updates

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use scrim_room::formation::plan_all;
use scrim_room::metrics::MetricsCollector;
use scrim_room::queue::QueueStore;
use scrim_room::rating::{ExtendedWengLinConfig, RatingCalculator, WengLinRatingCalculator};
use scrim_room::service::{EngineDeps, EngineSettings, MatchmakingEngine};
use scrim_room::types::{QueueGroup, TeamRating, TEAM_SIZE};
use scrim_room::utils::current_timestamp;
use std::sync::Arc;

/// Every fourth entry is a full team, the rest are solos
fn mixed_queue(groups: usize) -> Vec<QueueGroup> {
    let now = current_timestamp();
    let mut next_player = 1u64;
    (0..groups as u64)
        .map(|index| {
            if index % 4 == 0 {
                let members: Vec<u64> = (next_player..next_player + TEAM_SIZE as u64).collect();
                next_player += TEAM_SIZE as u64;
                QueueGroup::team(index + 1, members, now)
            } else {
                next_player += 1;
                QueueGroup::solo(next_player - 1, now)
            }
        })
        .collect()
}

fn bench_plan_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_all");
    for size in [50, 500, 5000] {
        let queue = mixed_queue(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &queue, |b, queue| {
            b.iter(|| black_box(plan_all(queue)))
        });
    }
    group.finish();
}

fn bench_rating_update(c: &mut Criterion) {
    let calculator = WengLinRatingCalculator::new(ExtendedWengLinConfig::default()).unwrap();
    let winner = TeamRating {
        rating: 1500.0,
        uncertainty: 200.0,
    };
    let loser = TeamRating {
        rating: 1600.0,
        uncertainty: 180.0,
    };

    c.bench_function("rate_result_upset", |b| {
        b.iter(|| black_box(calculator.rate_result((1, &winner), (2, &loser))))
    });
}

fn bench_queue_join(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("queue_join_and_leave", |b| {
        let store = QueueStore::in_memory();
        b.iter(|| {
            rt.block_on(async {
                black_box(store.join_solo(7).await.unwrap());
                black_box(store.leave(7).await.unwrap());
            })
        })
    });
}

fn bench_solo_formation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("ten_solos_to_started_match", |b| {
        b.iter(|| {
            rt.block_on(async {
                let metrics = Arc::new(MetricsCollector::new().unwrap());
                let deps = EngineDeps::in_memory(metrics).unwrap();
                let engine = MatchmakingEngine::new(deps, EngineSettings::default());
                for player in 1..=10 {
                    let _ = engine.join_queue(player).await;
                }
                black_box(engine.queue_count().await)
            })
        })
    });
}

criterion_group!(
    benches,
    bench_plan_all,
    bench_rating_update,
    bench_queue_join,
    bench_solo_formation
);
criterion_main!(benches);
