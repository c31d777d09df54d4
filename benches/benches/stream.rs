use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wavepipe_backends::{ManualClock, SimClock, SimConfig, SimulatedPcm};
use wavepipe_engine::{
    ChannelSink, EngineConfig, PcmFormat, StreamEvent, StreamHandle, TimeFormat, WaveBuffer,
};

fn simulated() -> SimulatedPcm {
    SimulatedPcm::playback(
        PcmFormat::cd(),
        SimConfig {
            period_frames: 256,
            periods: 8,
            clock: SimClock::Manual(ManualClock::new()),
            tap: false,
            ..SimConfig::default()
        },
    )
}

fn stream_commands(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("submit_16_then_reset", |b| {
        let (sink, events) = ChannelSink::new();
        let handle = StreamHandle::open(
            PcmFormat::cd(),
            Box::new(simulated()),
            None,
            Box::new(sink),
            &EngineConfig::default(),
        )
        .expect("open stream");
        let mut spare: Vec<WaveBuffer> = (0..16)
            .map(|user| {
                let mut buffer = WaveBuffer::new(vec![0; 4096]).with_user(user);
                buffer.prepare().expect("prepare");
                buffer
            })
            .collect();

        b.iter(|| {
            for buffer in spare.drain(..) {
                handle.submit(buffer).expect("submit");
            }
            handle.reset().expect("reset");
            // Reset hands every buffer back before it returns.
            spare.extend(events.try_iter().filter_map(|event| match event {
                StreamEvent::BufferCompleted { buffer, .. } => Some(buffer),
                _ => None,
            }));
        });
        handle.close().expect("close");
    });

    group.bench_function("position_round_trip", |b| {
        let (sink, _events) = ChannelSink::new();
        let handle = StreamHandle::open(
            PcmFormat::cd(),
            Box::new(simulated()),
            None,
            Box::new(sink),
            &EngineConfig::default(),
        )
        .expect("open stream");
        b.iter(|| black_box(handle.position(TimeFormat::Millis).expect("position")));
        handle.close().expect("close");
    });

    group.finish();
}

criterion_group!(benches, stream_commands);
criterion_main!(benches);
