//! Integration tests for streaming playback against a shared cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use vram_core::{
    frame_texture_hash, CacheConfig, CompressionPolicy, IntelligentCache, MockDevice, PatternConfig,
    StreamingConfig, StreamingOptimizer, SyntheticFrameLoader, TextureCompression, TextureFormat,
};

const MIB: usize = 1024 * 1024;

fn setup(
    cache_size: usize,
    config: StreamingConfig,
) -> (Arc<MockDevice>, Arc<IntelligentCache>, Arc<SyntheticFrameLoader>, StreamingOptimizer) {
    let device = Arc::new(MockDevice::new(256 * MIB));
    let compression = Arc::new(TextureCompression::new(device.clone(), CompressionPolicy::default()));
    let cache = Arc::new(IntelligentCache::new(
        device.clone(),
        compression,
        CacheConfig {
            max_cache_size: cache_size,
            ..Default::default()
        },
        PatternConfig::default(),
    ));
    let loader = Arc::new(SyntheticFrameLoader::new(device.clone(), 256, 256, TextureFormat::R8));
    let streaming = StreamingOptimizer::new(
        cache.clone(),
        device.clone(),
        loader.clone(),
        config,
        PatternConfig::default(),
    );
    (device, cache, loader, streaming)
}

fn manual(read_ahead: u32) -> StreamingConfig {
    StreamingConfig {
        read_ahead_frames: read_ahead,
        background_loading: false,
        ..Default::default()
    }
}

#[test]
fn test_realtime_playback_keeps_buffer_ahead() {
    let config = StreamingConfig {
        read_ahead_frames: 8,
        max_concurrent_loads: 2,
        ..Default::default()
    };
    let (device, cache, _loader, streaming) = setup(64 * MIB, config);
    streaming.start_streaming(0).unwrap();

    for frame in 0..40 {
        streaming.on_frame_change(frame);
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            streaming.drain_completed();
            if streaming.is_buffer_healthy() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(streaming.is_buffer_healthy(), "buffer starved at frame {frame}");
    }

    let stats = streaming.analyze_access_patterns();
    assert!(stats.frames_streamed >= 40);
    assert!(stats.cache_hits > 0);
    assert_eq!(stats.load_errors, 0);

    streaming.shutdown();
    assert_eq!(device.leak_count(), cache.len());
}

#[test]
fn test_reverse_playback_streams_backwards() {
    let (_device, cache, _loader, streaming) = setup(64 * MIB, manual(5));
    streaming.start_streaming(100).unwrap();
    streaming.set_playback_speed(-1.0);

    assert_eq!(streaming.window(), vec![100, 99, 98, 97, 96]);
    streaming.process_pending(100);

    for frame in 96..=100 {
        assert!(cache.contains(frame_texture_hash(frame)), "frame {frame} missing");
    }
    assert!(!cache.contains(frame_texture_hash(101)));
}

#[test]
fn test_small_cache_stays_bounded_during_playback() {
    let (device, cache, loader, streaming) = setup(10 * 64 * 1024, manual(5));
    assert_eq!(loader.frame_bytes(), 64 * 1024);
    streaming.start_streaming(0).unwrap();

    for frame in 0..60 {
        streaming.on_frame_change(frame);
        streaming.process_pending(16);
        assert!(cache.get_total_bytes() <= 10 * loader.frame_bytes());
        assert_eq!(device.leak_count(), cache.len());
    }
    assert!(cache.get_statistics().evictions > 0);
}

#[test]
fn test_dropping_streaming_releases_inflight_loads() {
    let config = StreamingConfig {
        read_ahead_frames: 30,
        max_concurrent_loads: 3,
        ..Default::default()
    };
    let (device, cache, _loader, streaming) = setup(64 * MIB, config);
    streaming.start_streaming(0).unwrap();
    std::thread::sleep(Duration::from_millis(10));

    drop(streaming);
    assert_eq!(device.leak_count(), cache.len());

    drop(cache);
    assert_eq!(device.leak_count(), 0);
}
