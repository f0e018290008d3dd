//! Tests for the GraphicsDevice trait and MockDevice.

use super::*;

fn rgba(width: u32, height: u32) -> TextureDesc {
    TextureDesc::new(width, height, TextureFormat::Rgba8)
}

#[test]
fn create_and_destroy_all_returns_zero() {
    let device = MockDevice::new(1024 * 1024);
    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(device.create_texture(&rgba(16, 16)).unwrap());
    }
    assert_eq!(device.allocated_bytes(), 8 * 16 * 16 * 4);
    for h in &handles {
        device.destroy_texture(*h).unwrap();
    }
    assert_eq!(device.allocated_bytes(), 0);
    assert_eq!(device.leak_count(), 0);
}

#[test]
fn beyond_capacity_returns_out_of_memory() {
    let device = MockDevice::new(4096);
    let _a = device.create_texture(&rgba(16, 16)).unwrap();
    let result = device.create_texture(&rgba(32, 32));
    assert!(matches!(result, Err(DeviceError::OutOfMemory { .. })));
}

#[test]
fn stale_handle_after_slot_reuse() {
    let device = MockDevice::new(1024 * 1024);
    let first = device.create_texture(&rgba(4, 4)).unwrap();
    device.destroy_texture(first).unwrap();
    let second = device.create_texture(&rgba(4, 4)).unwrap();

    assert_eq!(first.index(), second.index());
    assert_ne!(first, second);
    assert!(matches!(device.texture_size(first), Err(DeviceError::StaleHandle(_))));
    assert!(matches!(device.destroy_texture(first), Err(DeviceError::StaleHandle(_))));
    assert_eq!(device.texture_size(second).unwrap(), 64);
}

#[test]
fn double_destroy_detection() {
    let device = MockDevice::new(4096);
    let handle = device.create_texture(&rgba(2, 2)).unwrap();
    device.destroy_texture(handle).unwrap();
    assert!(matches!(device.destroy_texture(handle), Err(DeviceError::StaleHandle(_))));
}

#[test]
fn upload_size_is_validated() {
    let device = MockDevice::new(4096);
    let result = device.create_texture_with_data(&rgba(2, 2), &[0u8; 15]);
    assert!(matches!(
        result,
        Err(DeviceError::DataSizeMismatch { expected: 16, actual: 15 })
    ));
}

#[test]
fn memory_info_includes_external_usage() {
    let device = MockDevice::new(1000);
    device.set_external_usage(600);
    let _t = device
        .create_texture_with_data(&TextureDesc::new(10, 10, TextureFormat::R8), &[7u8; 100])
        .unwrap();

    let info = device.memory_info();
    assert_eq!(info.total, 1000);
    assert_eq!(info.used, 700);
    assert_eq!(info.available, 300);
    assert_eq!(info.allocation_count, 1);
    assert!(info.used + info.available <= info.total);
}

#[test]
fn injected_failures_are_consumed() {
    let device = MockDevice::new(4096);
    device.fail_next_allocations(1);
    assert!(matches!(
        device.create_texture(&rgba(2, 2)),
        Err(DeviceError::OperationFailed(_))
    ));
    assert!(device.create_texture(&rgba(2, 2)).is_ok());
}
