//! File-level copy of the FAT32 partition's contents (spec §4.F.3). Unlike
//! the raw-copy pipeline, this never touches sectors directly: it walks the
//! mounted source tree itself and delegates each file's copy to a
//! `TreeCopier`, so the host's own copy tool preserves timestamps and
//! attributes the way a bit-for-bit sector clone would lose, while the
//! walk stays in our hands long enough to report progress as files land.

use crate::external::TreeCopier;
use sdtool_core::{ProgressCallback, SdToolError};
use std::path::Path;
use walkdir::WalkDir;

const REPORT_EVERY_FILES: u64 = 10;
const REPORT_EVERY_BYTES: u64 = 100 * 1024 * 1024;

/// Copies every file under `source` into `destination` via `copier`, then
/// validates the destination actually received something. A failure on
/// any single file is fatal: hekate configs and save data are not safe to
/// migrate partially.
pub async fn copy_fat32_tree(
    copier: &dyn TreeCopier,
    source: &Path,
    destination: &Path,
    progress: &dyn ProgressCallback,
) -> Result<(), SdToolError> {
    if !source.is_dir() {
        return Err(SdToolError::Other(format!(
            "FAT32 source mount point {source:?} is not a directory"
        )));
    }

    let (total_files, total_bytes) = scan_tree(source)?;
    progress.on_progress(
        "CopyPartitions",
        0,
        &format!("copying {total_files} files ({} MiB)", total_bytes / (1024 * 1024)),
    );

    let copied = copy_tree_reporting(copier, source, destination, total_files, progress).await?;

    validate_destination(destination, copied)?;
    progress.on_progress("CopyPartitions", 100, &format!("copied {copied} files"));
    Ok(())
}

fn scan_tree(source: &Path) -> Result<(u64, u64), SdToolError> {
    let mut file_count = 0u64;
    let mut total_bytes = 0u64;
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| SdToolError::Other(format!("walking {source:?}: {e}")))?;
        if entry.file_type().is_file() {
            file_count += 1;
            total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok((file_count, total_bytes))
}

/// Walks `source` and copies each file via `copier`, reporting every 10
/// files or 100 MiB copied (spec §4.F.3). A failure on any single file is
/// fatal.
async fn copy_tree_reporting(
    copier: &dyn TreeCopier,
    source: &Path,
    destination: &Path,
    total_files: u64,
    progress: &dyn ProgressCallback,
) -> Result<u64, SdToolError> {
    let mut copied_files = 0u64;
    let mut copied_bytes = 0u64;
    let mut since_report_files = 0u64;
    let mut since_report_bytes = 0u64;

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| SdToolError::Other(format!("walking {source:?}: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| SdToolError::Other(format!("{:?} is not under {source:?}: {e}", entry.path())))?;
        let dest_path = destination.join(rel);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest_path)?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        copier.copy_file(entry.path(), &dest_path).await?;

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        copied_files += 1;
        copied_bytes += size;
        since_report_files += 1;
        since_report_bytes += size;

        if since_report_files >= REPORT_EVERY_FILES || since_report_bytes >= REPORT_EVERY_BYTES {
            let percent = if total_files > 0 {
                ((copied_files * 100) / total_files).min(99) as u8
            } else {
                0
            };
            progress.on_progress(
                "CopyPartitions",
                percent,
                &format!("copied {copied_files}/{total_files} files ({} MiB)", copied_bytes / (1024 * 1024)),
            );
            since_report_files = 0;
            since_report_bytes = 0;
        }
    }

    Ok(copied_files)
}

/// Post-condition per spec §4.F.3: the destination mount point still
/// exists and, if the source had any files at all, isn't empty.
fn validate_destination(destination: &Path, source_file_count: u64) -> Result<(), SdToolError> {
    if !destination.is_dir() {
        return Err(SdToolError::Other(format!(
            "FAT32 destination mount point {destination:?} vanished after copy"
        )));
    }
    if source_file_count == 0 {
        return Ok(());
    }
    let has_entries = std::fs::read_dir(destination)
        .map_err(|e| SdToolError::Other(format!("reading {destination:?}: {e}")))?
        .next()
        .is_some();
    if !has_entries {
        return Err(SdToolError::Other(format!(
            "FAT32 destination {destination:?} is empty after copying {source_file_count} source files"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeCopier {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TreeCopier for FakeCopier {
        async fn copy_file(&self, source: &Path, destination: &Path) -> Result<(), SdToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::copy(source, destination)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn copies_files_and_validates_destination_nonempty() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("hekate_ipl.ini"), b"test").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let copier = FakeCopier { calls: calls.clone() };
        copy_fat32_tree(&copier, src_dir.path(), dst_dir.path(), &sdtool_core::NoOpProgress)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dst_dir.path().join("hekate_ipl.ini").exists());
    }

    #[tokio::test]
    async fn reports_progress_every_ten_files() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        for i in 0..25 {
            std::fs::write(src_dir.path().join(format!("save{i}.bin")), b"x").unwrap();
        }

        let reports = Arc::new(std::sync::Mutex::new(Vec::new()));
        struct RecordingProgress(Arc<std::sync::Mutex<Vec<(u8, String)>>>);
        impl sdtool_core::ProgressCallback for RecordingProgress {
            fn on_progress(&self, _stage: &str, percent: u8, detail: &str) {
                self.0.lock().unwrap().push((percent, detail.to_string()));
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let copier = FakeCopier { calls: calls.clone() };
        let progress = RecordingProgress(reports.clone());
        copy_fat32_tree(&copier, src_dir.path(), dst_dir.path(), &progress).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 25);
        // Initial 0%, at least two "every 10 files" reports, plus the 100% close-out.
        let recorded = reports.lock().unwrap();
        assert!(recorded.len() >= 4, "expected incremental progress reports, got {recorded:?}");
        assert!(recorded.iter().any(|(_, detail)| detail.contains("copied 10/25")));
    }

    #[tokio::test]
    async fn empty_source_does_not_require_nonempty_destination() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let copier = FakeCopier { calls };
        copy_fat32_tree(&copier, src_dir.path(), dst_dir.path(), &sdtool_core::NoOpProgress)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_source_directory_is_an_error() {
        let dst_dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let copier = FakeCopier { calls };
        let result = copy_fat32_tree(
            &copier,
            Path::new("/nonexistent/source/path"),
            dst_dir.path(),
            &sdtool_core::NoOpProgress,
        )
        .await;
        assert!(result.is_err());
    }
}
