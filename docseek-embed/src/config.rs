//! Configuration for embedding models

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Model used when nothing else is configured.
pub const DEFAULT_MODEL_ID: &str = "Xenova/multilingual-e5-small";

/// Vector width used for models missing from [`known_model_dimensions`].
pub const DEFAULT_DIMENSIONS: usize = 384;

pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Output width of the models this crate knows about.
pub fn known_model_dimensions(model_id: &str) -> Option<usize> {
    match model_id {
        "Xenova/multilingual-e5-small" | "intfloat/multilingual-e5-small" => Some(384),
        "Xenova/multilingual-e5-base" | "intfloat/multilingual-e5-base" => Some(768),
        "Xenova/multilingual-e5-large" | "intfloat/multilingual-e5-large" => Some(1024),
        _ => None,
    }
}

/// Numeric precision of the model weights. Vectors produced under different
/// quantizations are not comparable, so the value is pinned per index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    #[default]
    Q8,
    Q4,
    Fp16,
    Fp32,
}

impl Quantization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quantization::Q8 => "q8",
            Quantization::Q4 => "q4",
            Quantization::Fp16 => "fp16",
            Quantization::Fp32 => "fp32",
        }
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quantization {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "q8" | "int8" => Ok(Quantization::Q8),
            "q4" | "int4" => Ok(Quantization::Q4),
            "fp16" | "f16" => Ok(Quantization::Fp16),
            "fp32" | "f32" => Ok(Quantization::Fp32),
            other => Err(EmbedError::invalid_config(format!(
                "unknown quantization '{other}'"
            ))),
        }
    }
}

/// Where the model runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Use an accelerator when one is available, otherwise the CPU.
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one embedder instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedConfig {
    pub model_id: String,
    pub quantization: Quantization,
    pub device: Device,
    /// Explicit output width; derived from the model id when `None`.
    pub dimensions: Option<usize>,
    pub batch_size: usize,
    pub normalize: bool,
    /// Directory for downloaded model files.
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            quantization: Quantization::default(),
            device: Device::default(),
            dimensions: None,
            batch_size: DEFAULT_BATCH_SIZE,
            normalize: true,
            cache_dir: None,
        }
    }
}

impl EmbedConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    pub fn with_quantization(self, quantization: Quantization) -> Self {
        Self {
            quantization,
            ..self
        }
    }

    pub fn with_device(self, device: Device) -> Self {
        Self { device, ..self }
    }

    pub fn with_dimensions(self, dimensions: usize) -> Self {
        Self {
            dimensions: Some(dimensions),
            ..self
        }
    }

    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    pub fn with_cache_dir(self, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(cache_dir.into()),
            ..self
        }
    }

    /// Output width: explicit setting, then the known model table, then
    /// [`DEFAULT_DIMENSIONS`].
    pub fn resolved_dimensions(&self) -> usize {
        self.dimensions
            .or_else(|| known_model_dimensions(&self.model_id))
            .unwrap_or(DEFAULT_DIMENSIONS)
    }

    /// E5 models expect `query: ` / `passage: ` prefixes.
    pub fn is_e5_model(&self) -> bool {
        self.model_id.to_ascii_lowercase().contains("e5")
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(EmbedError::invalid_config("model id must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch size must be at least 1"));
        }
        if self.dimensions == Some(0) {
            return Err(EmbedError::invalid_config("dimensions must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EmbedConfig::default();
        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
        assert_eq!(config.quantization, Quantization::Q8);
        assert_eq!(config.device, Device::Auto);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.resolved_dimensions(), 384);
        assert!(config.is_e5_model());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dimensions_resolution() {
        assert_eq!(
            EmbedConfig::new("intfloat/multilingual-e5-large").resolved_dimensions(),
            1024
        );
        assert_eq!(
            EmbedConfig::new("Xenova/multilingual-e5-base").resolved_dimensions(),
            768
        );
        assert_eq!(EmbedConfig::new("custom/model").resolved_dimensions(), 384);
        assert_eq!(
            EmbedConfig::new("custom/model")
                .with_dimensions(32)
                .resolved_dimensions(),
            32
        );
    }

    #[test]
    fn test_quantization_parsing() {
        assert_eq!("FP16".parse::<Quantization>().unwrap(), Quantization::Fp16);
        assert_eq!("q4".parse::<Quantization>().unwrap(), Quantization::Q4);
        assert!("q2".parse::<Quantization>().is_err());
        assert_eq!(Quantization::Fp32.to_string(), "fp32");

        let json = serde_json::to_string(&Quantization::Q8).unwrap();
        assert_eq!(json, "\"q8\"");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(EmbedConfig::new("").validate().is_err());
        assert!(EmbedConfig::default().with_batch_size(0).validate().is_err());
        assert!(EmbedConfig::default().with_dimensions(0).validate().is_err());
    }
}
