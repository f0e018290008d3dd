//! Tests for StreamingOptimizer.

use super::*;
use crate::cache::CacheConfig;
use crate::compression::{CompressionPolicy, TextureCompression};
use crate::device::{MockDevice, TextureFormat};

const MIB: usize = 1024 * 1024;

struct Fixture {
    device: Arc<MockDevice>,
    cache: Arc<IntelligentCache>,
    loader: Arc<SyntheticFrameLoader>,
    streaming: StreamingOptimizer,
}

fn fixture(config: StreamingConfig) -> Fixture {
    fixture_with_delay(config, Duration::ZERO)
}

fn fixture_with_delay(config: StreamingConfig, delay: Duration) -> Fixture {
    let device = Arc::new(MockDevice::new(512 * MIB));
    let compression = Arc::new(TextureCompression::new(device.clone(), CompressionPolicy::default()));
    let cache = Arc::new(IntelligentCache::new(
        device.clone(),
        compression,
        CacheConfig {
            max_cache_size: 128 * MIB,
            ..Default::default()
        },
        PatternConfig::default(),
    ));
    let loader = Arc::new(SyntheticFrameLoader::new(device.clone(), 256, 256, TextureFormat::R8).with_delay(delay));
    let streaming = StreamingOptimizer::new(
        cache.clone(),
        device.clone(),
        loader.clone(),
        config,
        PatternConfig::default(),
    );
    Fixture {
        device,
        cache,
        loader,
        streaming,
    }
}

fn manual(read_ahead: u32) -> StreamingConfig {
    StreamingConfig {
        read_ahead_frames: read_ahead,
        background_loading: false,
        ..Default::default()
    }
}

fn queued_frames(streaming: &StreamingOptimizer) -> Vec<u32> {
    streaming.shared.jobs.lock().iter().map(|job| job.frame).collect()
}

#[test]
fn test_start_seeds_read_ahead_window() {
    let f = fixture(manual(5));
    f.streaming.start_streaming(0).unwrap();

    assert!(f.streaming.is_streaming());
    assert_eq!(f.streaming.window(), vec![0, 1, 2, 3, 4]);
    assert_eq!(queued_frames(&f.streaming), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_process_pending_fills_cache() {
    let f = fixture(manual(5));
    f.streaming.start_streaming(0).unwrap();

    assert_eq!(f.streaming.process_pending(10), 5);
    for frame in 0..5 {
        assert!(f.cache.contains(frame_texture_hash(frame)));
    }

    let stats = f.streaming.analyze_access_patterns();
    assert_eq!(stats.frames_streamed, 5);
    assert_eq!(stats.bytes_streamed, 5 * f.loader.frame_bytes() as u64);
    assert_eq!(stats.buffer_depth, 5);
    assert_eq!(stats.buffer_utilization, 1.0);
    assert!(!stats.is_underrun);
    assert!(f.streaming.is_buffer_healthy());
    assert_eq!(f.device.leak_count(), f.cache.len());
}

#[test]
fn test_underrun_with_slow_loader() {
    let config = StreamingConfig {
        read_ahead_frames: 5,
        max_concurrent_loads: 1,
        ..Default::default()
    };
    let f = fixture_with_delay(config, Duration::from_millis(50));
    f.streaming.start_streaming(0).unwrap();

    for frame in 1..=20 {
        f.streaming.on_frame_change(frame);
    }
    let stats = f.streaming.analyze_access_patterns();

    assert!(stats.is_underrun);
    assert!(!f.streaming.is_buffer_healthy());
    assert!(stats.cache_misses >= 20);

    f.streaming.shutdown();
    assert_eq!(f.device.leak_count(), f.cache.len());
}

#[test]
fn test_seek_requeues_window() {
    let f = fixture(manual(5));
    f.streaming.start_streaming(0).unwrap();
    f.streaming.seek_to_frame(100);

    assert_eq!(f.streaming.playhead(), 100);
    assert_eq!(queued_frames(&f.streaming), vec![100, 101, 102, 103, 104]);
}

#[test]
fn test_seek_discards_stale_loads() {
    let f = fixture(manual(5));
    f.streaming.start_streaming(0).unwrap();

    // A load that finished but was not delivered before the seek.
    let job = f.streaming.shared.jobs.lock().pop_front().unwrap();
    run_job(&f.streaming.shared, f.loader.as_ref(), job);
    f.streaming.seek_to_frame(500);

    assert_eq!(f.streaming.drain_completed(), 0);
    assert!(!f.cache.contains(frame_texture_hash(job.frame)));
    assert_eq!(f.streaming.get_statistics().frames_dropped, 1);
    assert_eq!(f.device.leak_count(), 0);
}

#[test]
fn test_stop_cancels_queued_work() {
    let f = fixture(manual(8));
    f.streaming.start_streaming(0).unwrap();
    f.streaming.stop_streaming();

    assert!(!f.streaming.is_streaming());
    assert_eq!(f.streaming.queued_loads(), 0);
    assert_eq!(f.streaming.process_pending(10), 0);
    assert_eq!(f.loader.loads(), 0);

    // Frame changes are ignored while stopped.
    f.streaming.on_frame_change(3);
    assert_eq!(f.streaming.get_statistics().cache_misses, 0);
}

#[test]
fn test_playback_speed_scales_read_ahead() {
    let f = fixture(manual(10));
    f.streaming.start_streaming(50).unwrap();

    f.streaming.set_playback_speed(2.0);
    assert_eq!(f.streaming.get_statistics().read_ahead_frames, 20);

    f.streaming.set_playback_speed(10.0);
    assert_eq!(f.streaming.get_statistics().read_ahead_frames, 40);

    f.streaming.set_playback_speed(0.1);
    assert_eq!(f.streaming.get_statistics().read_ahead_frames, 5);

    f.streaming.set_playback_speed(-1.0);
    assert_eq!(f.streaming.get_statistics().read_ahead_frames, 10);
    assert_eq!(f.streaming.window(), (41..=50).rev().collect::<Vec<u32>>());
}

#[test]
fn test_adaptive_quality_degrades_and_recovers() {
    let f = fixture(manual(5));
    f.streaming.start_streaming(0).unwrap();

    // Empty window is below the load threshold.
    f.streaming.analyze_access_patterns();
    assert_eq!(f.streaming.quality(), StreamQuality::Compressed(CompressionLevel::Fast));

    assert_eq!(f.streaming.process_pending(5), 5);
    let info = f.cache.entry_info(frame_texture_hash(0)).unwrap();
    assert_eq!(info.compression_level, CompressionLevel::Fast);
    assert!(info.memory_size < f.loader.frame_bytes());

    // Full window with fast loads steps back up.
    f.streaming.analyze_access_patterns();
    assert_eq!(f.streaming.quality(), StreamQuality::Full);
    assert_eq!(f.device.leak_count(), f.cache.len());
}

#[test]
fn test_critical_pressure_forces_quality_down() {
    let f = fixture(manual(5));
    f.streaming.set_memory_pressure(0.5);
    assert_eq!(f.streaming.quality(), StreamQuality::Full);

    f.streaming.set_memory_pressure(1.0);
    assert_eq!(f.streaming.quality(), StreamQuality::Compressed(CompressionLevel::Fast));
    f.streaming.set_memory_pressure(0.95);
    assert_eq!(f.streaming.quality(), StreamQuality::Compressed(CompressionLevel::Balanced));
}

#[test]
fn test_quality_ladder() {
    let mut quality = StreamQuality::Full;
    for _ in 0..5 {
        quality = quality.degrade();
    }
    assert_eq!(quality, StreamQuality::Compressed(CompressionLevel::Maximum));
    assert!(quality.score() < StreamQuality::Full.score());
    for _ in 0..5 {
        quality = quality.improve();
    }
    assert_eq!(quality, StreamQuality::Full);
}

#[test]
fn test_adjust_cache_size_dynamically() {
    let f = fixture(manual(20));
    f.streaming.start_streaming(0).unwrap();

    // Nothing loaded: underrun grows read-ahead.
    assert_eq!(f.streaming.adjust_cache_size_dynamically(), 25);

    // Fill the whole window: overfull shrinks it.
    f.streaming.process_pending(100);
    assert_eq!(f.streaming.adjust_cache_size_dynamically(), 23);

    assert_eq!(f.streaming.tuning().read_ahead_frames, 23);
    assert_eq!(f.streaming.get_config().read_ahead_frames, 20);
}

#[test]
fn test_optimize_for_playback_mode() {
    let f = fixture(manual(50));
    let configured = f.streaming.get_config();

    f.streaming.optimize_for_playback_mode(true);
    assert_eq!(
        f.streaming.tuning(),
        StreamingTuning {
            read_ahead_frames: 30,
            max_concurrent_loads: 2,
        }
    );

    f.streaming.optimize_for_playback_mode(false);
    let tuning = f.streaming.tuning();
    assert_eq!(tuning.read_ahead_frames, 10);
    assert_eq!(tuning.max_concurrent_loads, 4);
    assert_eq!(f.streaming.get_statistics().read_ahead_frames, 10);

    let config = f.streaming.get_config();
    assert_eq!(config.read_ahead_frames, configured.read_ahead_frames);
    assert_eq!(config.max_concurrent_loads, configured.max_concurrent_loads);
}

#[test]
fn test_update_config_keeps_tuning_unless_sizing_changes() {
    let f = fixture(manual(50));
    f.streaming.optimize_for_playback_mode(true);

    // Same sizing fields: adaptation survives a config reapply.
    let mut config = f.streaming.get_config();
    config.enable_adaptive_quality = !config.enable_adaptive_quality;
    f.streaming.update_config(config.clone());
    assert_eq!(f.streaming.tuning().read_ahead_frames, 30);

    // New read-ahead: tuning restarts from the configuration.
    config.read_ahead_frames = 12;
    f.streaming.update_config(config);
    assert_eq!(
        f.streaming.tuning(),
        StreamingTuning {
            read_ahead_frames: 12,
            max_concurrent_loads: 4,
        }
    );
    assert_eq!(f.streaming.get_statistics().read_ahead_frames, 12);
}

#[test]
fn test_prioritize_critical_textures() {
    let f = fixture(manual(5));
    f.streaming.start_streaming(0).unwrap();
    f.streaming.process_pending(5);

    assert_eq!(f.streaming.prioritize_critical_textures(), 5);
    assert!(f.cache.entry_info(frame_texture_hash(2)).unwrap().is_critical);

    f.streaming.seek_to_frame(1000);
    assert!(!f.cache.entry_info(frame_texture_hash(2)).unwrap().is_critical);
}

#[test]
fn test_failed_loads_are_counted() {
    let f = fixture(manual(5));
    f.streaming.start_streaming(0).unwrap();
    f.device.fail_next_allocations(2);

    assert_eq!(f.streaming.process_pending(5), 3);
    let stats = f.streaming.get_statistics();
    assert_eq!(stats.load_errors, 2);
    assert_eq!(stats.frames_streamed, 3);
}

#[test]
fn test_playhead_advance_counts_hits() {
    let f = fixture(manual(5));
    f.streaming.start_streaming(0).unwrap();
    f.streaming.process_pending(5);

    f.streaming.on_frame_change(1);
    f.streaming.on_frame_change(2);
    f.streaming.on_frame_change(9);

    let stats = f.streaming.get_statistics();
    assert_eq!(stats.cache_hits, 2);
    assert_eq!(stats.cache_misses, 1);
}

#[test]
fn test_request_frames_outside_window() {
    let f = fixture(manual(5));
    f.streaming.start_streaming(0).unwrap();

    assert_eq!(f.streaming.request_frames(&[300, 301]), 2);
    assert_eq!(f.streaming.request_frames(&[300]), 0);
    f.streaming.process_pending(20);
    assert!(f.cache.contains(frame_texture_hash(300)));
    assert!(f.cache.contains(frame_texture_hash(301)));
}

#[test]
fn test_background_loaders_fill_window() {
    let config = StreamingConfig {
        read_ahead_frames: 5,
        max_concurrent_loads: 2,
        ..Default::default()
    };
    let f = fixture(config);
    f.streaming.start_streaming(10).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut inserted = 0;
    while inserted < 5 && Instant::now() < deadline {
        inserted += f.streaming.drain_completed();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(inserted, 5);
    assert!(f.streaming.is_buffer_healthy());

    f.streaming.shutdown();
    assert!(!f.streaming.is_streaming());
    assert_eq!(f.device.leak_count(), f.cache.len());
}
