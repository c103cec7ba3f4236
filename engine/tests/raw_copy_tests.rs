//! Raw-copy byte-exactness (testable property #5) and cancellation
//! draining (S6), run against a loopback image instead of real hardware.

use sdtool_core::{BlockDeviceGateway, NoOpProgress};
use sdtool_engine::pipeline::{raw_copy, ChunkPlan};
use sdtool_platform::loopback::{create_sparse_image, LoopbackGateway};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[tokio::test]
async fn raw_copy_is_byte_exact_for_a_small_partition() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("card.img");
    create_sparse_image(&image, 16 * 1024 * 1024).unwrap();
    let gateway: Arc<dyn BlockDeviceGateway> = Arc::new(LoopbackGateway::new(dir.path()));
    let device = image.to_str().unwrap().to_string();

    let mut pattern = vec![0u8; 64 * 512];
    for (i, byte) in pattern.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    gateway.write(&device, 100, &pattern, true).await.unwrap();

    let plan = ChunkPlan { chunk_sectors: 16, buffers: 2 };
    raw_copy(
        gateway.clone(),
        device.clone(),
        100,
        device.clone(),
        5000,
        64,
        plan,
        Arc::new(NoOpProgress),
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    let copied = gateway.read(&device, 5000, 64).await.unwrap();
    assert_eq!(copied, pattern);
}

#[tokio::test]
async fn raw_copy_single_threaded_path_is_also_byte_exact() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("card.img");
    create_sparse_image(&image, 16 * 1024 * 1024).unwrap();
    let gateway: Arc<dyn BlockDeviceGateway> = Arc::new(LoopbackGateway::new(dir.path()));
    let device = image.to_str().unwrap().to_string();

    let mut pattern = vec![0u8; 32 * 512];
    for (i, byte) in pattern.iter_mut().enumerate() {
        *byte = (i % 199) as u8;
    }
    gateway.write(&device, 200, &pattern, true).await.unwrap();

    let plan = ChunkPlan { chunk_sectors: 8, buffers: 1 };
    raw_copy(
        gateway.clone(),
        device.clone(),
        200,
        device.clone(),
        9000,
        32,
        plan,
        Arc::new(NoOpProgress),
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    let copied = gateway.read(&device, 9000, 32).await.unwrap();
    assert_eq!(copied, pattern);
}

#[tokio::test]
async fn cancellation_before_any_chunk_surfaces_cancelled_error() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("card.img");
    create_sparse_image(&image, 16 * 1024 * 1024).unwrap();
    let gateway: Arc<dyn BlockDeviceGateway> = Arc::new(LoopbackGateway::new(dir.path()));
    let device = image.to_str().unwrap().to_string();

    let cancel = Arc::new(AtomicBool::new(true));
    let plan = ChunkPlan { chunk_sectors: 8, buffers: 1 };
    let result = raw_copy(
        gateway,
        device.clone(),
        0,
        device,
        1000,
        64,
        plan,
        Arc::new(NoOpProgress),
        cancel,
    );
    assert!(matches!(result, Err(sdtool_core::SdToolError::Cancelled)));
}
