//! Cache throughput benchmarks.
//!
//! Measures lookup, insert-with-eviction and compression pass cost on the
//! mock device.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use vram_core::{
    CacheConfig, CompressionPolicy, GraphicsDevice, IntelligentCache, MockDevice, PatternConfig,
    TextureCompression, TextureDesc, TextureFormat, TextureHandle,
};

const MIB: usize = 1024 * 1024;

fn setup(max_cache_size: usize) -> (Arc<MockDevice>, IntelligentCache) {
    let device = Arc::new(MockDevice::new(1024 * MIB));
    let compression = Arc::new(TextureCompression::new(device.clone(), CompressionPolicy::default()));
    let cache = IntelligentCache::new(
        device.clone(),
        compression,
        CacheConfig {
            max_cache_size,
            enable_prediction: false,
            ..Default::default()
        },
        PatternConfig::default(),
    );
    (device, cache)
}

fn frame_texture(device: &MockDevice, side: u32) -> TextureHandle {
    let desc = TextureDesc::new(side, side, TextureFormat::Rgba8);
    let data: Vec<u8> = (0..desc.raw_size()).map(|i| (i / 1024) as u8).collect();
    device
        .create_texture_with_data(&desc, &data)
        .unwrap_or_else(|e| panic!("bench texture: {e}"))
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_lookup");

    for entries in [16u64, 256, 1024] {
        let (device, cache) = setup(512 * MIB);
        for hash in 0..entries {
            cache.put_texture(hash, frame_texture(&device, 64), 1.0);
        }

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("hit", entries), |b| {
            let mut hash = 0;
            b.iter(|| {
                black_box(cache.get_texture(black_box(hash % entries)));
                hash += 1;
            })
        });
        group.bench_function(BenchmarkId::new("miss", entries), |b| {
            b.iter(|| black_box(cache.get_texture(black_box(u64::MAX))))
        });
    }

    group.finish();
}

fn bench_insert_with_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_insert");

    // 64x64 RGBA is 16 KiB; the small cap forces an eviction per insert.
    for (name, cap_entries) in [("cap_64", 64usize), ("cap_512", 512)] {
        let (device, cache) = setup(cap_entries * 16 * 1024);
        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("evicting", name), |b| {
            let mut hash = 0u64;
            b.iter(|| {
                let handle = frame_texture(&device, 64);
                if !cache.put_texture(hash, handle, 1.0) {
                    let _ = device.destroy_texture(handle);
                }
                hash += 1;
            })
        });
    }

    group.finish();
}

fn bench_optimization_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_optimization_pass");

    group.bench_function("idle_256", |b| {
        let (device, cache) = setup(512 * MIB);
        for hash in 0..256 {
            cache.put_texture(hash, frame_texture(&device, 64), 1.0);
        }
        b.iter(|| black_box(cache.run_optimization_pass()))
    });

    group.finish();
}

criterion_group!(benches, bench_lookup, bench_insert_with_eviction, bench_optimization_pass);
criterion_main!(benches);
