//! Progress reporting for the migration/cleanup stage graph. Milestone-based
//! (never continuous), matching the `(stage_name, overall_percent, detail)`
//! callback shape.

/// Receives milestone updates from the engine. Implementors must be cheap
/// to call from the raw-copy pipeline's writer thread.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, stage: &str, overall_percent: u8, detail: &str);
}

/// Discards all progress. The default for library callers that don't want
/// output.
pub struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _stage: &str, _overall_percent: u8, _detail: &str) {}
}

/// Routes progress through the `log` facade at `info` level.
pub struct LoggingProgress;

impl ProgressCallback for LoggingProgress {
    fn on_progress(&self, stage: &str, overall_percent: u8, detail: &str) {
        log::info!("[{overall_percent:>3}%] {stage}: {detail}");
    }
}

/// Wraps an arbitrary closure as a `ProgressCallback`, for the CLI's
/// progress-bar renderer and for tests that want to assert on the
/// milestone sequence.
pub struct FnProgress<F>
where
    F: Fn(&str, u8, &str) + Send + Sync,
{
    callback: F,
}

impl<F> FnProgress<F>
where
    F: Fn(&str, u8, &str) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressCallback for FnProgress<F>
where
    F: Fn(&str, u8, &str) + Send + Sync,
{
    fn on_progress(&self, stage: &str, overall_percent: u8, detail: &str) {
        (self.callback)(stage, overall_percent, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn fn_progress_forwards_calls() {
        let seen = Mutex::new(Vec::new());
        let cb = FnProgress::new(|stage: &str, pct: u8, detail: &str| {
            seen.lock().unwrap().push((stage.to_string(), pct, detail.to_string()));
        });
        cb.on_progress("Clean", 0, "starting");
        cb.on_progress("Done", 100, "finished");
        let recorded = seen.into_inner().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].1, 100);
    }
}
