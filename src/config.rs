//! Run and evaluation settings.
//!
//! These replace compile-time constants: the class count sizes the confusion
//! matrix, the sample limit caps how much of a dataset is read, and the
//! backend tag plus thread count decide how kernels execute.

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::{Error, Result};

/// Evaluation table settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Number of classes; the confusion matrix is `num_classes × num_classes`.
    pub num_classes: usize,
    /// Evaluate at most this many samples. `None` means the whole dataset.
    #[serde(default)]
    pub sample_limit: Option<usize>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            sample_limit: None,
        }
    }
}

impl EvalConfig {
    /// Checks the settings are usable.
    ///
    /// # Errors
    /// [`Error::Config`] for zero classes or a zero sample limit.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Config("class count must be at least 1".into()));
        }
        if self.sample_limit == Some(0) {
            return Err(Error::Config("sample limit must be at least 1".into()));
        }
        Ok(())
    }
}

/// Execution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Kernel backend.
    #[serde(default)]
    pub backend: Backend,
    /// Worker count for the CPU backend; `None` uses one per logical core.
    #[serde(default)]
    pub threads: Option<usize>,
    /// Run whole samples in parallel instead of parallelising inside kernels.
    #[serde(default)]
    pub parallel_samples: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_ten_classes_whole_dataset() {
        let cfg = EvalConfig::default();
        assert_eq!(cfg.num_classes, 10);
        assert_eq!(cfg.sample_limit, None);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_settings() {
        let zero_classes = EvalConfig {
            num_classes: 0,
            ..EvalConfig::default()
        };
        assert!(zero_classes.validate().is_err());
        let zero_limit = EvalConfig {
            sample_limit: Some(0),
            ..EvalConfig::default()
        };
        assert!(zero_limit.validate().is_err());
    }

    #[test]
    fn run_config_parses_from_json() {
        let cfg: RunConfig = serde_json::from_str(r#"{ "backend": "cpu", "threads": 4 }"#).unwrap();
        assert_eq!(cfg.backend, Backend::Cpu);
        assert_eq!(cfg.threads, Some(4));
        assert!(!cfg.parallel_samples);
    }
}
