//! Tests for TextureCompression against the mock device.

use super::*;
use crate::device::MockDevice;

fn setup() -> (Arc<MockDevice>, TextureCompression) {
    let device = Arc::new(MockDevice::new(256 * MIB));
    let compression = TextureCompression::new(device.clone(), CompressionPolicy::default());
    (device, compression)
}

fn upload(device: &MockDevice, format: TextureFormat) -> (TextureHandle, Vec<u8>) {
    let raw = profiles::synthetic_texels(format, 64, 64);
    let handle = device
        .create_texture_with_data(&TextureDesc::new(64, 64, format), &raw)
        .unwrap();
    (handle, raw)
}

fn within_tolerance(format: TextureFormat, tol: f32, original: &[u8], decoded: &[u8]) -> bool {
    if format.is_float() {
        original.chunks_exact(4).zip(decoded.chunks_exact(4)).all(|(a, b)| {
            let a = f32::from_le_bytes([a[0], a[1], a[2], a[3]]);
            let b = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            (a - b).abs() <= tol * a.abs()
        })
    } else {
        original
            .iter()
            .zip(decoded)
            .all(|(a, b)| (*a as f32 - *b as f32).abs() <= tol)
    }
}

#[test]
fn test_round_trip_every_format_and_level() {
    let (device, compression) = setup();
    for format in TextureFormat::ALL {
        for level in profiles::ENCODING_LEVELS {
            let (handle, raw) = upload(&device, format);
            let packed = match compression.compress_for_cache(handle, level) {
                Ok(h) => h,
                Err(CompressionError::Ineffective { .. }) => {
                    device.destroy_texture(handle).unwrap();
                    continue;
                }
                Err(e) => panic!("{} {:?}: {}", format, level, e),
            };
            assert_eq!(device.texture_desc(packed).unwrap().compression, level);

            let restored = compression.decompress_for_use(packed).unwrap();
            let decoded = device.read_texture(restored).unwrap();
            if level == CompressionLevel::Lossless {
                assert_eq!(decoded, raw, "{} lossless", format);
            } else {
                let tol = codec::tolerance(format, level);
                assert!(within_tolerance(format, tol, &raw, &decoded), "{} {:?}", format, level);
            }
            device.destroy_texture(restored).unwrap();
        }
    }
    assert_eq!(device.leak_count(), 0);
}

#[test]
fn test_compress_replaces_input() {
    let (device, compression) = setup();
    let (handle, raw) = upload(&device, TextureFormat::Rgba8);
    let packed = compression
        .compress_for_cache(handle, CompressionLevel::Maximum)
        .unwrap();

    assert_ne!(packed, handle);
    assert!(matches!(device.texture_size(handle), Err(DeviceError::StaleHandle(_))));
    assert!(device.texture_size(packed).unwrap() < raw.len());
    assert_eq!(device.leak_count(), 1);

    let stats = compression.stats();
    assert_eq!(stats.textures_compressed, 1);
    assert!(stats.bytes_saved > 0);
}

#[test]
fn test_level_none_returns_input() {
    let (device, compression) = setup();
    let (handle, _) = upload(&device, TextureFormat::R8);
    assert_eq!(compression.compress_for_cache(handle, CompressionLevel::None).unwrap(), handle);
}

#[test]
fn test_double_compress_rejected() {
    let (device, compression) = setup();
    let (handle, _) = upload(&device, TextureFormat::Bgra8);
    let packed = compression.compress_for_cache(handle, CompressionLevel::Fast).unwrap();
    let result = compression.compress_for_cache(packed, CompressionLevel::Maximum);
    assert!(matches!(result, Err(CompressionError::AlreadyCompressed(_))));
}

#[test]
fn test_decompress_raw_is_noop() {
    let (device, compression) = setup();
    let (handle, _) = upload(&device, TextureFormat::R32F);
    assert_eq!(compression.decompress_for_use(handle).unwrap(), handle);
}

#[test]
fn test_stale_handle_propagates() {
    let (device, compression) = setup();
    let (handle, _) = upload(&device, TextureFormat::R8);
    device.destroy_texture(handle).unwrap();
    let result = compression.compress_for_cache(handle, CompressionLevel::Fast);
    assert!(matches!(result, Err(CompressionError::Device(DeviceError::StaleHandle(_)))));
}

#[test]
fn test_recommend_compression_level() {
    let (_, compression) = setup();
    let f = TextureFormat::Rgba8;
    assert_eq!(compression.recommend_compression_level(f, 1.0), CompressionLevel::Lossless);
    assert_eq!(compression.recommend_compression_level(f, 0.9), CompressionLevel::Fast);
    assert_eq!(compression.recommend_compression_level(f, 0.6), CompressionLevel::Balanced);
    assert_eq!(compression.recommend_compression_level(f, 0.1), CompressionLevel::Maximum);
}

#[test]
fn test_is_compression_beneficial() {
    let (_, compression) = setup();
    assert!(!compression.is_compression_beneficial(512 * 1024, 0.0));
    assert!(compression.is_compression_beneficial(8 * MIB, 0.01));
    assert!(!compression.is_compression_beneficial(8 * MIB, 60.0));
}

#[test]
fn test_add_profile_and_ratio() {
    let (_, compression) = setup();
    let info = CompressionInfo {
        level: CompressionLevel::Fast,
        format: TextureFormat::R8,
        compression_ratio: 3.0,
        compress_us_per_mib: 100.0,
        decompress_us_per_mib: 50.0,
        is_lossy: true,
        tolerance: 2.0,
    };
    compression.add_compression_profile(TextureFormat::Rgba8, info);
    assert_eq!(compression.get_compression_ratio(TextureFormat::Rgba8, CompressionLevel::Fast), 3.0);
    assert_eq!(compression.get_compression_ratio(TextureFormat::Rgba8, CompressionLevel::None), 1.0);

    let available = compression.get_available_compressions(TextureFormat::Rgba8);
    assert_eq!(available.len(), 4);
    assert!(available.iter().all(|p| p.format == TextureFormat::Rgba8));
    assert_eq!(available[0].level, CompressionLevel::Fast);
}

#[test]
fn test_benchmark_refines_profiles() {
    let (_, compression) = setup();
    let results = compression.benchmark_compression_methods();
    assert_eq!(results.len(), TextureFormat::ALL.len() * 4);
    assert!(results.iter().all(|p| p.compression_ratio > 0.0));
    let lossless = results
        .iter()
        .find(|p| p.format == TextureFormat::R8 && p.level == CompressionLevel::Lossless)
        .unwrap();
    assert_eq!(lossless.tolerance, 0.0);
    assert!(!lossless.is_lossy);
}
