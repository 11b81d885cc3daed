use criterion::{criterion_group, criterion_main, Criterion};

use engine_core::movegen::{generate, GenType, MoveList};
use engine_core::position::Position;

fn bench_see(c: &mut Criterion) {
    engine_core::init();

    // Tactical middlegame with several contested squares
    let pos = Position::from_fen(
        "rnbakab1r/9/1c4nc1/p1p1p1p1p/9/2P6/P3P1P1P/1C2C1N2/9/RNBAKAB1R w",
    )
    .unwrap();

    let mut captures = MoveList::new();
    generate(&pos, GenType::Captures, &mut captures);
    let mut all = MoveList::new();
    generate(&pos, GenType::NonEvasions, &mut all);

    c.bench_function("see_ge_captures", |b| {
        b.iter(|| {
            let mut wins = 0;
            for m in captures.iter() {
                if pos.see_ge(*m, 0) {
                    wins += 1;
                }
            }
            wins
        })
    });

    c.bench_function("see_ge_threshold_sweep", |b| {
        b.iter(|| {
            let mut acc = 0;
            for m in all.iter() {
                for t in [-200, 0, 200] {
                    acc += pos.see_ge(*m, t) as i32;
                }
            }
            acc
        })
    });
}

criterion_group!(benches, bench_see);
criterion_main!(benches);
