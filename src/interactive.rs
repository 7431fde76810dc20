//! Line-oriented play against, or analysis with, an [`InferenceEngine`].
//!
//! The session reads one command per line and writes its replies to any
//! `Write`, so the same loop drives a terminal or a scripted test.

use std::io::{BufRead, Write};

use shakmaty::{Chess, Color, File, Position, Rank, Square};

use crate::{
    engine::InferenceEngine,
    error::{ChessNetError, Result},
    moves::{parse_move, play},
    tensor::{fen_of, position_from_fen},
};

const HELP: &str = "\
commands:
  <move>      play a move in UCI (e2e4) or SAN (e4)
  go          let the engine move for the side to move
  undo        take back your last move
  new         start a new game
  fen <FEN>   set up a position
  eval        show the evaluation and best moves again
  help        show this text
  quit        leave the session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameEnd {
    Checkmate { winner: Color },
    Stalemate,
    InsufficientMaterial,
    FiftyMoves,
    Repetition,
}

impl GameEnd {
    fn describe(self) -> String {
        match self {
            GameEnd::Checkmate { winner } => format!("checkmate, {} wins", color_name(winner)),
            GameEnd::Stalemate => "stalemate".to_string(),
            GameEnd::InsufficientMaterial => "draw by insufficient material".to_string(),
            GameEnd::FiftyMoves => "draw by the fifty-move rule".to_string(),
            GameEnd::Repetition => "draw by threefold repetition".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Plies on the board when the session ended.
    pub moves_played: usize,
    pub final_fen: String,
    pub game_end: Option<GameEnd>,
}

enum Flow {
    Continue,
    Quit,
}

pub struct InteractiveSession<'e> {
    engine: &'e InferenceEngine,
    top_k: usize,
    engine_color: Option<Color>,
    history: Vec<Chess>,
}

impl<'e> InteractiveSession<'e> {
    pub fn new(engine: &'e InferenceEngine, top_k: usize) -> Self {
        Self {
            engine,
            top_k,
            engine_color: None,
            history: vec![Chess::default()],
        }
    }

    /// Let the engine answer automatically whenever `color` is to move.
    pub fn with_engine_color(mut self, color: Option<Color>) -> Self {
        self.engine_color = color;
        self
    }

    pub fn with_position(mut self, pos: Chess) -> Self {
        self.history = vec![pos];
        self
    }

    pub fn position(&self) -> &Chess {
        // history always holds at least the starting position
        &self.history[self.history.len() - 1]
    }

    pub fn game_end(&self) -> Option<GameEnd> {
        let pos = self.position();
        if pos.is_checkmate() {
            return Some(GameEnd::Checkmate { winner: !pos.turn() });
        }
        if pos.is_stalemate() {
            return Some(GameEnd::Stalemate);
        }
        if pos.is_insufficient_material() {
            return Some(GameEnd::InsufficientMaterial);
        }
        if pos.halfmoves() >= 100 {
            return Some(GameEnd::FiftyMoves);
        }
        let key = repetition_key(pos);
        if self.history.iter().filter(|p| repetition_key(p) == key).count() >= 3 {
            return Some(GameEnd::Repetition);
        }
        None
    }

    /// Process commands until `quit` or end of input.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, out: &mut W) -> Result<SessionSummary> {
        writeln!(out, "type `help` for commands")?;
        self.report(out)?;
        self.engine_replies(out)?;

        for line in input.lines() {
            let line = line?;
            match self.handle(line.trim(), out) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(ChessNetError::Io(e)) => return Err(e.into()),
                Err(e) => writeln!(out, "error: {e}")?,
            }
        }

        Ok(SessionSummary {
            moves_played: self.history.len() - 1,
            final_fen: fen_of(self.position()),
            game_end: self.game_end(),
        })
    }

    fn handle<W: Write>(&mut self, line: &str, out: &mut W) -> Result<Flow> {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "" => {}
            "quit" | "exit" => return Ok(Flow::Quit),
            "help" => writeln!(out, "{HELP}")?,
            "eval" => self.report(out)?,
            "new" => {
                self.history = vec![Chess::default()];
                self.report(out)?;
                self.engine_replies(out)?;
            }
            "fen" => {
                let pos = position_from_fen(rest.trim())?;
                self.history = vec![pos];
                self.report(out)?;
                self.engine_replies(out)?;
            }
            "undo" => self.undo(out)?,
            "go" => {
                if let Some(end) = self.game_end() {
                    writeln!(out, "game over: {}", end.describe())?;
                } else {
                    self.engine_move(out)?;
                    self.engine_replies(out)?;
                }
            }
            _ => {
                if let Some(end) = self.game_end() {
                    writeln!(out, "game over: {} (use new, fen or undo)", end.describe())?;
                    return Ok(Flow::Continue);
                }
                let m = parse_move(self.position(), line)?;
                let next = play(self.position(), &m);
                self.history.push(next);
                self.report(out)?;
                self.engine_replies(out)?;
            }
        }
        Ok(Flow::Continue)
    }

    fn undo<W: Write>(&mut self, out: &mut W) -> Result<()> {
        if self.history.len() < 2 {
            writeln!(out, "nothing to undo")?;
            return Ok(());
        }
        self.history.pop();
        // take back the engine's reply together with the move it answered
        if self.engine_color == Some(self.position().turn()) && self.history.len() > 1 {
            self.history.pop();
        }
        self.report(out)?;
        self.engine_replies(out)
    }

    fn engine_replies<W: Write>(&mut self, out: &mut W) -> Result<()> {
        while self.engine_color == Some(self.position().turn()) && self.game_end().is_none() {
            self.engine_move(out)?;
        }
        Ok(())
    }

    fn engine_move<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let best = self.engine.suggest_moves(self.position(), 1)?;
        let Some(choice) = best.into_iter().next() else {
            return Err(ChessNetError::NoLegalMoves {
                fen: fen_of(self.position()),
            });
        };
        writeln!(out, "engine plays {}", choice.uci)?;
        let next = play(self.position(), &choice.mv);
        self.history.push(next);
        self.report(out)
    }

    fn report<W: Write>(&self, out: &mut W) -> Result<()> {
        let pos = self.position();
        writeln!(out)?;
        write_board(pos, out)?;
        writeln!(out, "{} to move", color_name(pos.turn()))?;

        let value = self.engine.evaluate(pos)?;
        writeln!(out, "evaluation: {value:+.3}")?;

        if let Some(end) = self.game_end() {
            writeln!(out, "game over: {}", end.describe())?;
            return Ok(());
        }
        writeln!(out, "top moves:")?;
        for (i, m) in self.engine.suggest_moves(pos, self.top_k)?.iter().enumerate() {
            writeln!(out, "{:>3}. {:<6} ({:.3}%)", i + 1, m.uci, m.probability * 100.0)?;
        }
        Ok(())
    }
}

fn color_name(color: Color) -> &'static str {
    match color {
        Color::White => "White",
        Color::Black => "Black",
    }
}

/// Placement, side to move, castling and en passant fields of the FEN.
fn repetition_key(pos: &Chess) -> String {
    fen_of(pos).split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}

fn write_board<W: Write>(pos: &Chess, out: &mut W) -> std::io::Result<()> {
    let board = pos.board();
    for rank in (0..8u32).rev() {
        let row: Vec<String> = (0..8u32)
            .map(|file| {
                let square = Square::from_coords(File::new(file), Rank::new(rank));
                board.piece_at(square).map_or('.', |p| p.char()).to_string()
            })
            .collect();
        writeln!(out, "{} {}", rank + 1, row.join(" "))?;
    }
    writeln!(out, "  a b c d e f g h")
}
