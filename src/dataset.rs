//! Labelled training positions drawn from recorded games.
//!
//! Games arrive as [`GameRecord`]s (usually one JSON object per line, see
//! [`load_jsonl`]). Each ply of a game becomes one [`TrainingSample`]
//! holding the encoded position, the index of the move that was played and
//! the game result seen from the side that played it.

use std::{
    collections::VecDeque,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use shakmaty::{Chess, Move, Position};

use crate::{
    error::{ChessNetError, Result},
    moves::{encode_move, legal_move_indices, parse_move, play},
    tensor::{EncodedBoard, encode_position, position_from_fen},
    types::GameResult,
};

/// A game as handed over by the game-file reader: moves in SAN or UCI and
/// the final result (`1-0`, `0-1`, `1/2-1/2`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    #[serde(default)]
    pub id: String,
    /// Starting position, the standard initial position when absent.
    #[serde(default)]
    pub start_fen: Option<String>,
    pub moves: Vec<String>,
    pub result: String,
}

/// A game replayed into `(position before the move, move played)` pairs.
#[derive(Debug, Clone)]
pub struct ReplayedGame {
    pub id: String,
    pub plies: Vec<(Chess, Move)>,
    pub result: GameResult,
}

impl GameRecord {
    pub fn new(id: impl Into<String>, moves: &[&str], result: &str) -> Self {
        Self {
            id: id.into(),
            start_fen: None,
            moves: moves.iter().map(|m| m.to_string()).collect(),
            result: result.to_string(),
        }
    }

    /// Replay the move list, failing with `CorruptGame` on the first move
    /// that does not parse or is illegal.
    pub fn replay(&self) -> Result<ReplayedGame> {
        let corrupt = |reason: String| ChessNetError::CorruptGame {
            game_id: self.id.clone(),
            reason,
        };

        let result = self.result.parse::<GameResult>().map_err(corrupt)?;
        let mut pos = match &self.start_fen {
            Some(fen) => {
                position_from_fen(fen).map_err(|e| corrupt(format!("start position: {e}")))?
            }
            None => Chess::default(),
        };

        let mut plies = Vec::with_capacity(self.moves.len());
        for (i, text) in self.moves.iter().enumerate() {
            let m = parse_move(&pos, text).map_err(|e| corrupt(format!("ply {}: {e}", i + 1)))?;
            let next = play(&pos, &m);
            plies.push((pos, m));
            pos = next;
        }

        Ok(ReplayedGame {
            id: self.id.clone(),
            plies,
            result,
        })
    }
}

/// One entry of a game collection. Records that could not even be
/// deserialized are kept so the dataset pass reports them in order.
#[derive(Debug, Clone)]
pub enum GameEntry {
    Record(GameRecord),
    Unreadable { id: String, reason: String },
}

impl GameEntry {
    pub fn id(&self) -> &str {
        match self {
            GameEntry::Record(r) => &r.id,
            GameEntry::Unreadable { id, .. } => id,
        }
    }
}

/// Read a JSON-lines game file.
pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Vec<GameEntry>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    parse_jsonl(BufReader::new(file), &path.display().to_string())
}

/// Parse JSON lines; blank lines are ignored and malformed lines become
/// [`GameEntry::Unreadable`] entries named `source:line`.
pub fn parse_jsonl(reader: impl BufRead, source: &str) -> Result<Vec<GameEntry>> {
    let mut entries = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fallback_id = format!("{source}:{}", i + 1);
        match serde_json::from_str::<GameRecord>(&line) {
            Ok(mut record) => {
                if record.id.is_empty() {
                    record.id = fallback_id;
                }
                entries.push(GameEntry::Record(record));
            }
            Err(e) => entries.push(GameEntry::Unreadable {
                id: fallback_id,
                reason: e.to_string(),
            }),
        }
    }
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Plies that must have been played before a position is sampled.
    pub min_ply: usize,
    /// Games with fewer plies are skipped.
    pub min_game_plies: usize,
    pub max_samples_per_game: Option<usize>,
    /// Upper bound on samples per pass.
    pub max_samples: Option<usize>,
    /// `None` keeps file order.
    pub shuffle_seed: Option<u64>,
    /// Samples held back for mixing positions of different games.
    pub shuffle_buffer: usize,
    /// End the pass at the first corrupt game.
    pub fail_fast: bool,
    /// Fraction of corrupt games above which a pass fails.
    pub max_corrupt_fraction: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            min_ply: 0,
            min_game_plies: 0,
            max_samples_per_game: None,
            max_samples: None,
            shuffle_seed: None,
            shuffle_buffer: 4096,
            fail_fast: false,
            max_corrupt_fraction: 0.1,
        }
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.max_corrupt_fraction) {
            return Err(ChessNetError::InvalidConfig(format!(
                "max_corrupt_fraction must be within [0, 1], got {}",
                self.max_corrupt_fraction
            )));
        }
        if self.shuffle_seed.is_some() && self.shuffle_buffer == 0 {
            return Err(ChessNetError::InvalidConfig(
                "shuffle_buffer must be positive when shuffling".to_string(),
            ));
        }
        if self.max_samples_per_game == Some(0) {
            return Err(ChessNetError::InvalidConfig(
                "max_samples_per_game must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub board: EncodedBoard,
    /// Index of the move actually played.
    pub move_index: u32,
    /// Game result from the mover's perspective: +1 win, -1 loss, 0 draw.
    pub outcome: f32,
    /// Indices of all legal moves in the position.
    pub legal_indices: Vec<u32>,
    /// Plies played before this position.
    pub ply: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetStats {
    pub games_seen: usize,
    pub games_used: usize,
    pub games_skipped: usize,
    pub games_corrupt: usize,
    pub samples: usize,
}

pub struct PositionDataset {
    games: Vec<GameEntry>,
    config: DatasetConfig,
}

impl PositionDataset {
    pub fn new(games: Vec<GameEntry>, config: DatasetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { games, config })
    }

    pub fn from_records(records: Vec<GameRecord>, config: DatasetConfig) -> Result<Self> {
        Self::new(records.into_iter().map(GameEntry::Record).collect(), config)
    }

    /// Load and concatenate JSON-lines game files.
    pub fn load<P: AsRef<Path>>(paths: &[P], config: DatasetConfig) -> Result<Self> {
        let mut games = Vec::new();
        for path in paths {
            let entries = load_jsonl(path)?;
            log::info!("loaded {} games from {}", entries.len(), path.as_ref().display());
            games.extend(entries);
        }
        Self::new(games, config)
    }

    pub fn games(&self) -> &[GameEntry] {
        &self.games
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    /// First pass over the data.
    pub fn iter(&self) -> Samples<'_> {
        self.iter_epoch(0)
    }

    /// Pass number `epoch`. Passes with the same number yield the same
    /// sequence; with shuffling each epoch uses `shuffle_seed + epoch`.
    pub fn iter_epoch(&self, epoch: u64) -> Samples<'_> {
        let seed = self.config.shuffle_seed.map(|s| s.wrapping_add(epoch));
        let mut order: Vec<usize> = (0..self.games.len()).collect();
        let rng = seed.map(|s| {
            let mut rng = StdRng::seed_from_u64(s);
            order.shuffle(&mut rng);
            rng
        });
        Samples {
            dataset: self,
            order,
            cursor: 0,
            seed: seed.unwrap_or(epoch),
            pending: VecDeque::new(),
            buffer: Vec::new(),
            rng,
            stats: DatasetStats::default(),
            halted: false,
            done: false,
        }
    }

    fn game_samples(&self, index: usize, seed: u64) -> Result<Option<Vec<TrainingSample>>> {
        let record = match &self.games[index] {
            GameEntry::Record(record) => record,
            GameEntry::Unreadable { id, reason } => {
                return Err(ChessNetError::CorruptGame {
                    game_id: id.clone(),
                    reason: reason.clone(),
                });
            }
        };

        let game = record.replay()?;
        if game.plies.len() < self.config.min_game_plies {
            log::debug!("skipping short game {} ({} plies)", game.id, game.plies.len());
            return Ok(None);
        }

        let mut eligible: Vec<usize> = (self.config.min_ply..game.plies.len()).collect();
        if let Some(limit) = self.config.max_samples_per_game {
            if eligible.len() > limit {
                let mut rng = StdRng::seed_from_u64(
                    seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
                );
                let mut picked = rand::seq::index::sample(&mut rng, eligible.len(), limit).into_vec();
                picked.sort_unstable();
                eligible = picked.into_iter().map(|i| eligible[i]).collect();
            }
        }

        let mut samples = Vec::with_capacity(eligible.len());
        for ply in eligible {
            let (pos, m) = &game.plies[ply];
            let move_index = encode_move(pos, m).map_err(|e| ChessNetError::CorruptGame {
                game_id: game.id.clone(),
                reason: e.to_string(),
            })?;
            samples.push(TrainingSample {
                board: encode_position(pos),
                move_index,
                outcome: game.result.outcome_for(pos.turn()),
                legal_indices: legal_move_indices(pos).into_iter().map(|(_, i)| i).collect(),
                ply,
            });
        }
        Ok(Some(samples))
    }
}

/// Lazy pass over a [`PositionDataset`].
///
/// Yields `Err(CorruptGame)` once per malformed game and carries on, unless
/// `fail_fast` is set. After the last game, a corrupt fraction above
/// `max_corrupt_fraction` produces a final `Err(CorruptRateExceeded)`.
pub struct Samples<'a> {
    dataset: &'a PositionDataset,
    order: Vec<usize>,
    cursor: usize,
    seed: u64,
    pending: VecDeque<TrainingSample>,
    buffer: Vec<TrainingSample>,
    rng: Option<StdRng>,
    stats: DatasetStats,
    halted: bool,
    done: bool,
}

impl Samples<'_> {
    pub fn stats(&self) -> &DatasetStats {
        &self.stats
    }

    /// Next sample in game order.
    fn pull(&mut self) -> Option<Result<TrainingSample>> {
        loop {
            if let Some(sample) = self.pending.pop_front() {
                return Some(Ok(sample));
            }
            if self.halted {
                return None;
            }
            let &index = self.order.get(self.cursor)?;
            self.cursor += 1;
            self.stats.games_seen += 1;
            match self.dataset.game_samples(index, self.seed) {
                Ok(Some(samples)) => {
                    self.stats.games_used += 1;
                    self.pending.extend(samples);
                }
                Ok(None) => self.stats.games_skipped += 1,
                Err(e) => {
                    self.stats.games_corrupt += 1;
                    if self.dataset.config.fail_fast {
                        self.halted = true;
                    }
                    return Some(Err(e));
                }
            }
        }
    }

    fn finish(&mut self) -> Option<Result<TrainingSample>> {
        self.done = true;
        let DatasetStats {
            games_seen,
            games_corrupt,
            ..
        } = self.stats;
        let max_fraction = self.dataset.config.max_corrupt_fraction;
        if games_seen > 0 && games_corrupt as f64 / games_seen as f64 > max_fraction {
            return Some(Err(ChessNetError::CorruptRateExceeded {
                corrupt: games_corrupt,
                total: games_seen,
                max_fraction,
            }));
        }
        None
    }

    fn emit(&mut self, sample: TrainingSample) -> Option<Result<TrainingSample>> {
        self.stats.samples += 1;
        Some(Ok(sample))
    }
}

impl Iterator for Samples<'_> {
    type Item = Result<TrainingSample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.halted {
            self.done = true;
            return None;
        }
        if let Some(max) = self.dataset.config.max_samples {
            if self.stats.samples >= max {
                return self.finish();
            }
        }

        if self.rng.is_none() {
            return match self.pull() {
                Some(Ok(sample)) => self.emit(sample),
                Some(Err(e)) => Some(Err(e)),
                None => self.finish(),
            };
        }

        let capacity = self.dataset.config.shuffle_buffer;
        while self.buffer.len() < capacity {
            match self.pull() {
                Some(Ok(sample)) => self.buffer.push(sample),
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return self.finish();
        }
        let pick = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(0..self.buffer.len()),
            None => 0,
        };
        let sample = self.buffer.swap_remove(pick);
        self.emit(sample)
    }
}
