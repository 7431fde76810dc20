use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use shakmaty::{Color, Move, uci::UciMove};

#[derive(Debug, Clone)]
pub struct MoveProbability {
    pub uci: UciMove,
    pub mv: Move,
    /// Index of the move in the policy head's move space.
    pub index: u32,
    pub probability: f32,
}

#[derive(Debug, Clone)]
pub struct EvaluationResult {
    /// Legal moves and their probabilities, sorted highest to lowest
    pub policy: Vec<MoveProbability>,
    /// Value head output in [-1, 1] for the side to move
    pub value: f32,
    /// `value` rescaled to a win probability (0.0 to 1.0) for the side to move
    pub win_probability: f32,
}

/// Final result of a recorded game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameResult {
    WhiteWin,
    BlackWin,
    Draw,
}

impl GameResult {
    /// Outcome label for the player of `color`: +1 win, -1 loss, 0 draw.
    pub fn outcome_for(self, color: Color) -> f32 {
        match (self, color) {
            (GameResult::Draw, _) => 0.0,
            (GameResult::WhiteWin, Color::White) | (GameResult::BlackWin, Color::Black) => 1.0,
            _ => -1.0,
        }
    }
}

impl FromStr for GameResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1-0" | "white_win" => Ok(GameResult::WhiteWin),
            "0-1" | "black_win" => Ok(GameResult::BlackWin),
            "1/2-1/2" | "½-½" | "draw" => Ok(GameResult::Draw),
            other => Err(format!("unrecognised result `{other}`")),
        }
    }
}

impl fmt::Display for GameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GameResult::WhiteWin => "1-0",
            GameResult::BlackWin => "0-1",
            GameResult::Draw => "1/2-1/2",
        })
    }
}
