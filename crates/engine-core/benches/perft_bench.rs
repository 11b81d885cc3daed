use criterion::{criterion_group, criterion_main, Criterion};

use engine_core::movegen::perft;
use engine_core::position::Position;

fn bench_perft(c: &mut Criterion) {
    engine_core::init();
    let mut group = c.benchmark_group("perft");
    group.sample_size(10);

    group.bench_function("startpos_depth3", |b| {
        let mut pos = Position::startpos();
        b.iter(|| {
            let nodes = perft(&mut pos, 3);
            assert_eq!(nodes, 79666);
            nodes
        })
    });

    group.bench_function("startpos_depth2", |b| {
        let mut pos = Position::startpos();
        b.iter(|| perft(&mut pos, 2))
    });

    group.finish();
}

criterion_group!(benches, bench_perft);
criterion_main!(benches);
