//! Media analysis. The default implementation shells out to a
//! configurable external binary — the actual black/silence detection
//! algorithm is an external concern this crate never implements itself.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use stream_core::WorkerError;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnalysisResult {
    /// >90% of sampled frames are black per the analyzer's own threshold.
    pub black: bool,
    pub silent: bool,
}

#[async_trait]
pub trait SegmentAnalyzer: Send + Sync {
    async fn analyze(&self, segment_path: &Path) -> Result<AnalysisResult, WorkerError>;
}

#[derive(Deserialize)]
struct AnalyzerOutput {
    black: bool,
    silent: bool,
}

/// Shells out to `binary_path segment_path` and parses one line of JSON
/// (`{"black": bool, "silent": bool}`) from stdout.
pub struct SubprocessAnalyzer {
    binary_path: String,
}

impl SubprocessAnalyzer {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self { binary_path: binary_path.into() }
    }
}

#[async_trait]
impl SegmentAnalyzer for SubprocessAnalyzer {
    async fn analyze(&self, segment_path: &Path) -> Result<AnalysisResult, WorkerError> {
        let output = Command::new(&self.binary_path)
            .arg(segment_path)
            .output()
            .await
            .map_err(|e| WorkerError::Segment(format!("analyzer spawn failed: {e}")))?;

        if !output.status.success() {
            return Err(WorkerError::Segment(format!(
                "analyzer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: AnalyzerOutput = serde_json::from_str(stdout.trim())
            .map_err(|e| WorkerError::Segment(format!("analyzer output was not valid JSON: {e}")))?;

        Ok(AnalysisResult { black: parsed.black, silent: parsed.silent })
    }
}
