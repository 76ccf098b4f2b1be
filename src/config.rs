use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::progress::{DelayingProgressReporter, ImmediateProgressReporter, ProgressReporter};
use crate::{FlowError, RetryPolicy, Stats};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ProgressMode {
    #[default]
    Immediate,
    Delaying { period: Duration },
}

/// Settings shared by the flows of one component. Constructed once and
/// handed to whoever builds graphs; there is no process-wide instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub default_retry: RetryPolicy,
    pub progress: ProgressMode,
}

impl FlowConfig {
    pub fn from_json_str(json: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn default_retry_policy(&self) -> RetryPolicy {
        self.default_retry.clone()
    }

    pub fn progress_reporter(
        &self,
        callback: impl Fn(Stats) + Send + Sync + 'static,
    ) -> Arc<dyn ProgressReporter> {
        match &self.progress {
            ProgressMode::Immediate => Arc::new(ImmediateProgressReporter::new(callback)),
            ProgressMode::Delaying { period } => {
                Arc::new(DelayingProgressReporter::new(*period, callback))
            }
        }
    }
}
