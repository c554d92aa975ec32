//! Per-stage timing for the resize pipeline.
//!
//! When enabled, each stage's wall time is reported back to the client as a
//! `Thumbgate-Timing-<Stage>` response header (milliseconds).

use std::future::Future;
use std::time::{Duration, Instant};

/// Prefix shared by all timing headers
pub const TIMING_HEADER_PREFIX: &str = "Thumbgate-Timing-";

/// Instrumented pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    SourceFormatDetection,
    OutputAutoFormatDetection,
    LoadSource,
    Resize,
    EncodeOutput,
}

impl Stage {
    /// Full response header name for this stage
    pub fn header_name(&self) -> &'static str {
        match self {
            Self::Fetch => "Thumbgate-Timing-Fetch",
            Self::SourceFormatDetection => "Thumbgate-Timing-Source-Format-Detection",
            Self::OutputAutoFormatDetection => "Thumbgate-Timing-Output-Auto-Format-Detection",
            Self::LoadSource => "Thumbgate-Timing-Load-Source",
            Self::Resize => "Thumbgate-Timing-Resize",
            Self::EncodeOutput => "Thumbgate-Timing-Encode-Output",
        }
    }
}

/// Collects stage durations; a disabled timer runs closures untouched
#[derive(Debug, Default)]
pub struct StageTimer {
    enabled: bool,
    timings: Vec<(Stage, Duration)>,
}

impl StageTimer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            timings: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run `f`, recording its duration under `stage`
    pub fn time<T>(&mut self, stage: Stage, f: impl FnOnce() -> T) -> T {
        if !self.enabled {
            return f();
        }
        let start = Instant::now();
        let result = f();
        self.record(stage, start.elapsed());
        result
    }

    /// Await `fut`, recording its duration under `stage`
    pub async fn time_async<F: Future>(&mut self, stage: Stage, fut: F) -> F::Output {
        if !self.enabled {
            return fut.await;
        }
        let start = Instant::now();
        let result = fut.await;
        self.record(stage, start.elapsed());
        result
    }

    /// Record a duration; a later record for the same stage replaces it
    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        match self.timings.iter_mut().find(|(s, _)| *s == stage) {
            Some(entry) => entry.1 = elapsed,
            None => self.timings.push((stage, elapsed)),
        }
    }

    pub fn timings(&self) -> &[(Stage, Duration)] {
        &self.timings
    }

    /// Header name/value pairs in stage order, values in whole milliseconds
    pub fn into_headers(self) -> Vec<(String, String)> {
        self.timings
            .into_iter()
            .map(|(stage, elapsed)| {
                (
                    stage.header_name().to_string(),
                    elapsed.as_millis().to_string(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_names_share_prefix() {
        for stage in [
            Stage::Fetch,
            Stage::SourceFormatDetection,
            Stage::OutputAutoFormatDetection,
            Stage::LoadSource,
            Stage::Resize,
            Stage::EncodeOutput,
        ] {
            assert!(stage.header_name().starts_with(TIMING_HEADER_PREFIX));
        }
    }

    #[test]
    fn test_disabled_timer_records_nothing() {
        let mut timer = StageTimer::new(false);
        let value = timer.time(Stage::Resize, || 42);
        assert_eq!(value, 42);
        assert!(timer.into_headers().is_empty());
    }

    #[test]
    fn test_enabled_timer_records_each_stage() {
        let mut timer = StageTimer::new(true);
        timer.time(Stage::LoadSource, || ());
        timer.time(Stage::Resize, || ());
        timer.record(Stage::Resize, Duration::from_millis(7));

        let headers = timer.into_headers();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0, "Thumbgate-Timing-Load-Source");
        assert_eq!(headers[1], ("Thumbgate-Timing-Resize".to_string(), "7".to_string()));
    }

    #[tokio::test]
    async fn test_time_async() {
        let mut timer = StageTimer::new(true);
        let value = timer
            .time_async(Stage::Fetch, async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                "done"
            })
            .await;
        assert_eq!(value, "done");
        assert!(timer.timings()[0].1 >= Duration::from_millis(5));
    }
}
