use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{analysis::DEFAULT_FFT_SIZE, Result, ToyboxError};

/// Top-level configuration structure for the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub analysis: AnalysisConfig,
    pub resolver: ResolverConfig,
    pub router: RouterConfig,
    pub flow: FlowConfig,
}

impl AppConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Rejects settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        crate::analysis::validate_fft_size(self.analysis.fft_size)?;
        if self.analysis.input_capacity == 0 || self.analysis.frame_capacity == 0 {
            return Err(ToyboxError::InvalidConfig(
                "analysis channel capacities must be non-zero".to_string(),
            ));
        }
        if self.router.query_param.is_empty() {
            return Err(ToyboxError::InvalidConfig(
                "router query parameter must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for the off-thread spectral analyser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub fft_size: usize,
    pub sample_rate: u32,
    /// Number of input quanta that may queue before the producer starts
    /// dropping them.
    pub input_capacity: usize,
    /// Number of frames that may queue before the analyser drops new ones.
    pub frame_capacity: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fft_size: DEFAULT_FFT_SIZE,
            sample_rate: 48_000,
            input_capacity: 64,
            frame_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Explicit base URL. Wins over the page location when set.
    pub base_url: Option<String>,
    /// URL of the resolver itself, used for `./` and `../` keys.
    pub module_origin: Option<String>,
    /// Manifest locations tried in order, relative to the base URL.
    pub manifest_candidates: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            module_origin: None,
            manifest_candidates: vec![
                ".vite/manifest.json".to_string(),
                "manifest.json".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub query_param: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            query_param: "toy".to_string(),
        }
    }
}

/// Interval policy used by the flow scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub warmup_secs: u64,
    pub engaged_secs: u64,
    pub idle_secs: u64,
    pub engagement_window_secs: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            warmup_secs: 60,
            engaged_secs: 90,
            idle_secs: 120,
            engagement_window_secs: 120,
        }
    }
}

impl FlowConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn engaged(&self) -> Duration {
        Duration::from_secs(self.engaged_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn engagement_window(&self) -> Duration {
        Duration::from_secs(self.engagement_window_secs)
    }
}
