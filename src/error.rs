//! Error types for the chessnet library.
//!
//! Every fallible operation returns [`ChessNetError`]. Variants are grouped
//! by the layer that produced them (encoding, codec, dataset, network,
//! checkpoint, training, inference) and each message starts with that
//! layer's name followed by the offending input, so a failure printed to a
//! user says where it happened and on what.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChessNetError {
    /// The board violates a structural invariant (missing or duplicate
    /// king, pawn on a back rank, misplaced en passant square).
    #[error("encoding: invalid position: {0}")]
    InvalidPosition(String),

    /// The provided FEN string could not be parsed.
    #[error("encoding: invalid FEN: {0}")]
    InvalidFen(#[from] shakmaty::fen::ParseFenError),

    #[error("codec: illegal move `{mv}` in position {fen}")]
    IllegalMove { mv: String, fen: String },

    #[error("codec: move index {index} is not a legal move in position {fen}")]
    IllegalMoveIndex { index: u32, fen: String },

    /// A single game record could not be replayed. Recoverable: the dataset
    /// reports it and moves on to the next game.
    #[error("dataset: corrupt game `{game_id}`: {reason}")]
    CorruptGame { game_id: String, reason: String },

    #[error("dataset: {corrupt} of {total} games were corrupt (limit {max_fraction})")]
    CorruptRateExceeded {
        corrupt: usize,
        total: usize,
        max_fraction: f64,
    },

    #[error("training: malformed batch skipped: {0}")]
    MalformedBatch(String),

    #[error("training: loss diverged at step {step} ({consecutive} consecutive non-finite batches)")]
    NumericalDivergence { step: u64, consecutive: usize },

    #[error("checkpoint: incompatible checkpoint {}: {reason}", path.display())]
    IncompatibleCheckpoint { path: PathBuf, reason: String },

    #[error("inference: no legal moves in position {fen}")]
    NoLegalMoves { fen: String },

    #[error("config: {0}")]
    InvalidConfig(String),

    /// Wraps an error raised by the candle tensor library.
    #[error("network: {0}")]
    Candle(#[from] candle_core::Error),

    /// Occurs when an ndarray has an unexpected shape during tensor
    /// preparation.
    #[error("encoding: tensor shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("checkpoint: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ChessNetError {
    /// Name of the layer that produced the error.
    pub fn layer(&self) -> &'static str {
        match self {
            Self::InvalidPosition(_) | Self::InvalidFen(_) | Self::ShapeError(_) => "encoding",
            Self::IllegalMove { .. } | Self::IllegalMoveIndex { .. } => "codec",
            Self::CorruptGame { .. } | Self::CorruptRateExceeded { .. } => "dataset",
            Self::MalformedBatch(_) | Self::NumericalDivergence { .. } => "training",
            Self::IncompatibleCheckpoint { .. } | Self::Safetensors(_) => "checkpoint",
            Self::NoLegalMoves { .. } => "inference",
            Self::InvalidConfig(_) | Self::Json(_) => "config",
            Self::Candle(_) => "network",
            Self::Io(_) => "io",
        }
    }

    /// Whether a dataset pass can continue after this error.
    pub fn is_recoverable_game_error(&self) -> bool {
        matches!(self, Self::CorruptGame { .. })
    }
}

pub type Result<T, E = ChessNetError> = std::result::Result<T, E>;
