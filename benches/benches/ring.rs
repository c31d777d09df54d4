use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use wavepipe_rt::CommandRing;

fn post_and_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_ring");

    group.bench_function("post_take_64", |b| {
        let ring: CommandRing<u64> = CommandRing::new();
        b.iter(|| {
            for value in 0..64 {
                ring.post(black_box(value)).expect("post");
            }
            while let Some(envelope) = ring.try_take() {
                black_box(envelope.command);
            }
        });
    });

    // Growth from the minimum increment up to 4096 queued commands.
    group.bench_function("grow_to_4096", |b| {
        b.iter_batched(
            || CommandRing::<u64>::with_increment(2),
            |ring| {
                for value in 0..4096 {
                    ring.post(value).expect("post");
                }
                ring.drain().len()
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("send_wait_round_trip", |b| {
        let ring: Arc<CommandRing<u64, u64>> = Arc::new(CommandRing::new());
        let engine = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                while !ring.is_closed() {
                    ring.block_until(None);
                    while let Some(envelope) = ring.try_take() {
                        let value = envelope.command;
                        if let Some(signal) = envelope.signal {
                            signal.complete(value + 1);
                        }
                    }
                }
            })
        };
        b.iter(|| ring.send_wait(black_box(41)).expect("reply"));
        ring.close();
        engine.join().expect("engine thread");
    });

    group.finish();
}

criterion_group!(benches, post_and_take);
criterion_main!(benches);
