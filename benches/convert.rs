use criterion::{criterion_group, criterion_main, Criterion};
use kmscap::capture::convert::{ConversionKind, FrameConverter, PixelLayout, TileGeometry};
use kmscap::capture::diff::diff_frames;
use kmscap::capture::CanonicalFrame;

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;

fn bench_linear_conversion(c: &mut Criterion) {
    let raw = vec![0x5au8; (WIDTH * HEIGHT * 4) as usize];
    let mut dst = vec![0u8; raw.len()];

    let mut bgrx = FrameConverter::new(ConversionKind::Linear, PixelLayout::BGRX);
    c.bench_function("convert_1080p_bgrx", |b| {
        b.iter(|| {
            bgrx.convert(&raw, WIDTH, HEIGHT, WIDTH as usize * 4, &mut dst).expect("convert");
        })
    });

    let mut ten_bit = FrameConverter::new(ConversionKind::Linear, PixelLayout::X2R10G10B10);
    c.bench_function("convert_1080p_xr30", |b| {
        b.iter(|| {
            ten_bit.convert(&raw, WIDTH, HEIGHT, WIDTH as usize * 4, &mut dst).expect("convert");
        })
    });
}

fn bench_detiling(c: &mut Criterion) {
    let tile = TileGeometry::NVIDIA;
    let raw = vec![0x33u8; tile.required_bytes(WIDTH, HEIGHT)];
    let mut dst = vec![0u8; (WIDTH * HEIGHT * 4) as usize];
    let mut converter = FrameConverter::new(ConversionKind::XTiled(tile), PixelLayout::BGRX);

    c.bench_function("detile_1080p_nvidia", |b| {
        b.iter(|| {
            converter.convert(&raw, WIDTH, HEIGHT, 0, &mut dst).expect("detile");
        })
    });
}

fn bench_diff(c: &mut Criterion) {
    let current = CanonicalFrame::new(WIDTH, HEIGHT);
    let mut changed = current.clone();
    let last = changed.data.len() - 1;
    changed.data[last] = 1;

    c.bench_function("diff_1080p_unchanged", |b| {
        let mut previous = current.clone();
        b.iter(|| diff_frames(&current, &mut previous, true))
    });

    c.bench_function("diff_1080p_last_pixel", |b| {
        let mut previous = current.clone();
        b.iter(|| {
            previous.data[last] = 0;
            diff_frames(&changed, &mut previous, true)
        })
    });
}

criterion_group!(benches, bench_linear_conversion, bench_detiling, bench_diff);
criterion_main!(benches);
