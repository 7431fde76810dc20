//! Training and inference configuration, loaded from JSON files.

use std::{fs, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};
use shakmaty::Color;

use crate::{
    dataset::DatasetConfig,
    error::{ChessNetError, Result},
    network::NetConfig,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTarget {
    #[default]
    Cpu,
    /// CUDA device with the given ordinal.
    Cuda(usize),
    /// First CUDA device if available, CPU otherwise.
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// JSON-lines game files.
    pub game_sources: Vec<PathBuf>,
    pub batch_size: usize,
    /// Total epochs to train, counting those completed before a resume.
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub lr_step_epochs: usize,
    pub lr_gamma: f64,
    pub policy_weight: f64,
    pub value_weight: f64,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_every_steps: Option<u64>,
    pub checkpoint_every_epochs: Option<usize>,
    pub resume_from: Option<PathBuf>,
    pub device: DeviceTarget,
    pub dataset: DatasetConfig,
    pub network: NetConfig,
    /// Consecutive non-finite losses tolerated before training halts.
    pub max_divergent_batches: usize,
    /// Restrict the policy softmax to legal moves when computing the loss.
    pub mask_illegal_moves: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            game_sources: Vec::new(),
            batch_size: 256,
            epochs: 10,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            lr_step_epochs: 5,
            lr_gamma: 0.1,
            policy_weight: 1.0,
            value_weight: 1.0,
            checkpoint_dir: PathBuf::from("checkpoints"),
            checkpoint_every_steps: None,
            checkpoint_every_epochs: Some(1),
            resume_from: None,
            device: DeviceTarget::Cpu,
            dataset: DatasetConfig::default(),
            network: NetConfig::default(),
            max_divergent_batches: 3,
            mask_illegal_moves: true,
        }
    }
}

impl TrainingConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ChessNetError::InvalidConfig(msg));
        if self.batch_size == 0 {
            return fail("batch_size must be positive".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return fail(format!("weight_decay must be non-negative, got {}", self.weight_decay));
        }
        if !(self.lr_gamma > 0.0 && self.lr_gamma <= 1.0) {
            return fail(format!("lr_gamma must be in (0, 1], got {}", self.lr_gamma));
        }
        if self.policy_weight < 0.0 || self.value_weight < 0.0 {
            return fail("loss weights must be non-negative".into());
        }
        if self.checkpoint_every_steps == Some(0) || self.checkpoint_every_epochs == Some(0) {
            return fail("checkpoint intervals must be positive".into());
        }
        if self.max_divergent_batches == 0 {
            return fail("max_divergent_batches must be at least 1".into());
        }
        self.dataset.validate()?;
        self.network.validate()
    }
}

/// Colour as written in config files (`"white"` / `"black"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    White,
    Black,
}

impl From<Side> for Color {
    fn from(side: Side) -> Self {
        match side {
            Side::White => Color::White,
            Side::Black => Color::Black,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub checkpoint_path: PathBuf,
    /// Position to analyse once. Ignored in interactive mode.
    pub fen: Option<String>,
    pub interactive: bool,
    pub top_k: usize,
    /// Side the engine plays in interactive mode, if any.
    pub engine_color: Option<Side>,
    pub device: DeviceTarget,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("checkpoints/latest.safetensors"),
            fen: None,
            interactive: false,
            top_k: 5,
            engine_color: None,
            device: DeviceTarget::Cpu,
        }
    }
}

impl InferenceConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(ChessNetError::InvalidConfig("top_k must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let config: TrainingConfig =
            serde_json::from_str(r#"{"game_sources": ["games.jsonl"], "batch_size": 32, "device": {"cuda": 1}}"#)
                .unwrap();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.epochs, 10);
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.checkpoint_every_epochs, Some(1));
        assert_eq!(config.device, DeviceTarget::Cuda(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero_batch = TrainingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(zero_batch.validate(), Err(ChessNetError::InvalidConfig(_))));

        let never = TrainingConfig {
            checkpoint_every_steps: Some(0),
            ..Default::default()
        };
        assert!(never.validate().is_err());

        let inference = InferenceConfig {
            top_k: 0,
            ..Default::default()
        };
        assert!(inference.validate().is_err());
    }

    #[test]
    fn inference_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("play.json");
        fs::write(&path, r#"{"checkpoint_path": "net.safetensors", "interactive": true, "engine_color": "black"}"#)
            .unwrap();
        let config = InferenceConfig::from_file(&path).unwrap();
        assert!(config.interactive);
        assert_eq!(config.engine_color.map(Color::from), Some(Color::Black));
        assert_eq!(config.top_k, 5);
        assert_eq!(config.device, DeviceTarget::Cpu);
    }
}
