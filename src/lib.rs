//! Train and query a dual-headed policy/value network for chess.
//!
//! Positions are encoded into a fixed stack of 8×8 planes, moves into a
//! fixed 4672-entry move space, and a residual convolutional network
//! ([`DualHeadNet`]) learns from recorded games to predict both the move
//! that was played and the final result.
//!
//! The usual flow:
//!
//! 1. load games into a [`PositionDataset`],
//! 2. run a [`Trainer`] over it, which writes safetensors checkpoints,
//! 3. load a checkpoint into an [`InferenceEngine`] to evaluate positions,
//!    rank legal moves or play through an [`InteractiveSession`].
//!
//! The library re‑exports `shakmaty` to make position construction easy.

mod checkpoint;
mod config;
mod dataset;
mod engine;
mod error;
mod interactive;
mod moves;
mod network;
mod optim;
mod tensor;
mod train;
mod types;
mod util;

/// Board encoding.
pub use tensor::{
    EncodedBoard, PLANES, encode, encode_position, fen_of, position_from_fen, position_from_setup,
    stack_boards, to_tensor,
};

/// Move codec between legal moves and policy indices.
pub use moves::{
    MOVE_PLANES, MOVE_SPACE, MoveShape, decode_move, encode_move, legal_move_indices, parse_move,
    play, shape_of, target_square, uci_index,
};

/// Training data.
pub use dataset::{
    DatasetConfig, DatasetStats, GameEntry, GameRecord, PositionDataset, Samples, TrainingSample,
    load_jsonl, parse_jsonl,
};

/// The network and its persisted form.
pub use checkpoint::{Checkpoint, Counters};
pub use network::{ArchitectureSignature, DualHeadNet, NetConfig};

/// Training.
pub use optim::{Adam, AdamParams, AdamState};
pub use train::{
    BatchOutcome, LossBreakdown, StopSignal, Trainer, TrainerState, TrainingOutcome, TrainingReport,
};

/// Inference.
pub use engine::InferenceEngine;
pub use interactive::{GameEnd, InteractiveSession, SessionSummary};

/// Configuration files.
pub use config::{DeviceTarget, InferenceConfig, Side, TrainingConfig};

/// Error type produced by library operations.
pub use error::{ChessNetError, Result};

/// Output data structures returned by evaluations.
pub use types::{EvaluationResult, GameResult, MoveProbability};

pub use util::{init_logging, select_device};

/// Checkpoint reading and writing.
pub mod checkpoints {
    pub use crate::checkpoint::{FORMAT, FORMAT_VERSION, load, save};
}

/// Re-export of `shakmaty` for convenience when building positions.
pub use shakmaty;
