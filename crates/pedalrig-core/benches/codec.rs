//! Codec hot-loop benchmarks: one block of stereo decode + encode per format.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pedalrig_core::{AudioFormat, SampleFormat};

fn bench_codec(c: &mut Criterion) {
    const FRAMES: usize = 256;
    const CHANNELS: usize = 2;

    let formats = [
        SampleFormat::S16Le,
        SampleFormat::S24P3Le,
        SampleFormat::S24Le,
        SampleFormat::S32Le,
        SampleFormat::F32Le,
    ];

    let mut group = c.benchmark_group("codec");
    for format in formats {
        let fmt = AudioFormat::new(format);
        let mut planar: Vec<Box<[f32]>> = (0..CHANNELS)
            .map(|ch| {
                (0..FRAMES)
                    .map(|i| ((i + ch) as f32 / FRAMES as f32) * 2.0 - 1.0)
                    .collect()
            })
            .collect();
        let mut raw = vec![0u8; fmt.frame_size(CHANNELS) * FRAMES];

        group.bench_with_input(
            BenchmarkId::new("encode_decode", format.name()),
            &format,
            |b, _| {
                b.iter(|| {
                    (fmt.encode)(&planar, &mut raw, CHANNELS, FRAMES);
                    (fmt.decode)(&raw, &mut planar, CHANNELS, FRAMES);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
