//! The raw sector-copy pipeline (spec §4.F.2, §5): exactly one reader
//! thread and one writer thread joined by a bounded
//! `std::sync::mpsc::sync_channel`, never a thread pool. Chunk size and
//! buffer count are picked from available RAM at call time via `sysinfo`.

use sdtool_core::{BlockDeviceGateway, ProgressCallback, SdToolError, SECTOR_SIZE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct ChunkPlan {
    pub chunk_sectors: u64,
    pub buffers: usize,
}

/// Chunk/buffer sizing table from spec §4.F.2, read from `sysinfo`'s
/// available-memory figure at pipeline start.
pub fn plan_chunking(available_bytes: u64) -> ChunkPlan {
    const GIB: u64 = 1024 * 1024 * 1024;
    if available_bytes >= 8 * GIB {
        ChunkPlan { chunk_sectors: 128 * 1024 * 1024 / SECTOR_SIZE, buffers: 3 }
    } else if available_bytes >= 4 * GIB {
        ChunkPlan { chunk_sectors: 64 * 1024 * 1024 / SECTOR_SIZE, buffers: 2 }
    } else {
        ChunkPlan { chunk_sectors: 32 * 1024 * 1024 / SECTOR_SIZE, buffers: 1 }
    }
}

pub fn detect_chunk_plan() -> ChunkPlan {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    plan_chunking(system.available_memory())
}

enum Message {
    Chunk { offset_sectors: u64, data: Vec<u8> },
    EndOfStream,
}

/// Copies `size_sectors` sectors from `src_device[src_start..]` to
/// `dst_device[dst_start..]`, byte-exact. `cancel` is polled before each
/// chunk read and each chunk write; an in-flight chunk always completes.
#[allow(clippy::too_many_arguments)]
pub fn raw_copy(
    gateway: Arc<dyn BlockDeviceGateway>,
    src_device: String,
    src_start: u64,
    dst_device: String,
    dst_start: u64,
    size_sectors: u64,
    plan: ChunkPlan,
    progress: Arc<dyn ProgressCallback>,
    cancel: Arc<AtomicBool>,
) -> Result<(), SdToolError> {
    if plan.buffers <= 1 {
        return raw_copy_single_threaded(gateway.as_ref(), &src_device, src_start, &dst_device, dst_start, size_sectors, plan.chunk_sectors, progress.as_ref(), &cancel);
    }

    let runtime = tokio::runtime::Handle::try_current();
    let (tx, rx) = mpsc::sync_channel::<Message>(plan.buffers);
    let error_slot: Arc<Mutex<Option<SdToolError>>> = Arc::new(Mutex::new(None));

    let reader_gateway = gateway.clone();
    let reader_device = src_device.clone();
    let reader_cancel = cancel.clone();
    let reader_error = error_slot.clone();
    let reader_runtime = runtime.clone();
    let chunk_sectors = plan.chunk_sectors;

    let reader = std::thread::spawn(move || {
        let mut offset = 0u64;
        while offset < size_sectors {
            if reader_cancel.load(Ordering::SeqCst) {
                break;
            }
            let count = chunk_sectors.min(size_sectors - offset);
            let read = block_on(&reader_runtime, reader_gateway.read(&reader_device, src_start + offset, count));
            match read {
                Ok(data) => {
                    if tx.send(Message::Chunk { offset_sectors: offset, data }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    latch_error(&reader_error, e);
                    break;
                }
            }
            offset += count;
        }
        let _ = tx.send(Message::EndOfStream);
    });

    let writer_gateway = gateway.clone();
    let writer_device = dst_device.clone();
    let writer_cancel = cancel.clone();
    let writer_error = error_slot.clone();
    let writer_progress = progress.clone();
    let writer_runtime = runtime;

    let writer = std::thread::spawn(move || {
        let mut written_sectors = 0u64;
        let mut last_report = Instant::now();
        let mut last_percent = 0u8;
        loop {
            match rx.recv() {
                Ok(Message::Chunk { offset_sectors, data }) => {
                    if writer_cancel.load(Ordering::SeqCst) {
                        continue;
                    }
                    let result = block_on(
                        &writer_runtime,
                        writer_gateway.write(&writer_device, dst_start + offset_sectors, &data, true),
                    );
                    if let Err(e) = result {
                        latch_error(&writer_error, e);
                        continue;
                    }
                    written_sectors += data.len() as u64 / SECTOR_SIZE;
                    let percent = ((written_sectors as f64 / size_sectors.max(1) as f64) * 100.0) as u8;
                    if percent >= last_percent + 1 || last_report.elapsed() >= Duration::from_secs(5) {
                        writer_progress.on_progress("CopyPartitions", percent, &format!("{written_sectors}/{size_sectors} sectors"));
                        last_percent = percent;
                        last_report = Instant::now();
                    }
                }
                Ok(Message::EndOfStream) | Err(_) => break,
            }
        }
    });

    reader.join().map_err(|_| SdToolError::Other("raw-copy reader thread panicked".to_string()))?;
    writer.join().map_err(|_| SdToolError::Other("raw-copy writer thread panicked".to_string()))?;

    if let Some(err) = error_slot.lock().unwrap().take() {
        return Err(err);
    }
    if cancel.load(Ordering::SeqCst) {
        return Err(SdToolError::Cancelled);
    }
    Ok(())
}

fn latch_error(slot: &Mutex<Option<SdToolError>>, error: SdToolError) {
    let mut guard = slot.lock().unwrap();
    if guard.is_none() {
        *guard = Some(error);
    }
}

/// The reader/writer threads are plain `std::thread`s, not tokio tasks,
/// so they borrow the caller's runtime handle to drive the async
/// gateway calls. `raw_copy` must be invoked from inside a tokio
/// runtime (the migration/cleanup stages always are).
fn block_on<F: std::future::Future>(handle: &Option<tokio::runtime::Handle>, future: F) -> F::Output {
    handle
        .as_ref()
        .expect("raw_copy must be called from within a tokio runtime")
        .block_on(future)
}

#[allow(clippy::too_many_arguments)]
fn raw_copy_single_threaded(
    gateway: &dyn BlockDeviceGateway,
    src_device: &str,
    src_start: u64,
    dst_device: &str,
    dst_start: u64,
    size_sectors: u64,
    chunk_sectors: u64,
    progress: &dyn ProgressCallback,
    cancel: &AtomicBool,
) -> Result<(), SdToolError> {
    let runtime = tokio::runtime::Handle::try_current();
    let mut offset = 0u64;
    while offset < size_sectors {
        if cancel.load(Ordering::SeqCst) {
            return Err(SdToolError::Cancelled);
        }
        let count = chunk_sectors.min(size_sectors - offset);
        let data = block_on(&runtime, gateway.read(src_device, src_start + offset, count))?;
        block_on(&runtime, gateway.write(dst_device, dst_start + offset, &data, true))?;
        offset += count;
        let percent = ((offset as f64 / size_sectors.max(1) as f64) * 100.0) as u8;
        progress.on_progress("CopyPartitions", percent, &format!("{offset}/{size_sectors} sectors"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_plan_picks_largest_tier_for_abundant_ram() {
        let plan = plan_chunking(16 * 1024 * 1024 * 1024);
        assert_eq!(plan.buffers, 3);
        assert_eq!(plan.chunk_sectors, 128 * 1024 * 1024 / SECTOR_SIZE);
    }

    #[test]
    fn chunk_plan_falls_back_to_single_threaded_under_4gib() {
        let plan = plan_chunking(2 * 1024 * 1024 * 1024);
        assert_eq!(plan.buffers, 1);
    }

    #[test]
    fn chunk_plan_mid_tier_at_4gib() {
        let plan = plan_chunking(4 * 1024 * 1024 * 1024);
        assert_eq!(plan.buffers, 2);
    }
}
