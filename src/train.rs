//! Supervised training of the policy/value network on recorded games.
//!
//! One optimizer step per batch: the whole batch goes through a single
//! forward/backward pass and the aggregated gradients are applied once.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::{
    checkpoint::{self, Counters},
    config::TrainingConfig,
    dataset::{PositionDataset, TrainingSample},
    engine::InferenceEngine,
    error::{ChessNetError, Result},
    moves::MOVE_SPACE,
    network::{ArchitectureSignature, DualHeadNet, snapshot},
    optim::{Adam, AdamParams, step_decay},
    tensor::{stack_boards, to_tensor},
    util::select_device,
};

/// Added to the logits of illegal moves before the policy softmax.
const ILLEGAL_LOGIT: f32 = -1e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Initializing,
    Training { epoch: usize, batch: usize },
    Checkpointing,
    Completed,
    Stopped,
}

/// Cooperative cancellation flag shared between the training loop and
/// whoever wants it to stop.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    pub total: f32,
    pub policy: f32,
    pub value: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchOutcome {
    Trained(LossBreakdown),
    /// The batch failed validation and was dropped.
    Skipped,
    /// The loss was NaN or infinite; parameters were not updated.
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingOutcome {
    Completed,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub outcome: TrainingOutcome,
    /// Optimizer steps taken in total, including before a resume.
    pub steps: u64,
    pub epochs_completed: usize,
    pub last_loss: Option<LossBreakdown>,
    pub skipped_batches: usize,
    pub non_finite_batches: usize,
    pub corrupt_games: usize,
    pub checkpoints: Vec<PathBuf>,
}

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    varmap: VarMap,
    net: DualHeadNet,
    adam: Adam,
    counters: Counters,
    state: TrainerState,
    consecutive_non_finite: usize,
}

impl Trainer {
    /// Fresh parameters, or the state of `config.resume_from` when set.
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let device = select_device(config.device)?;
        let (varmap, net) = DualHeadNet::trainable(config.network, &device)?;
        let adam = Adam::new(
            &varmap,
            AdamParams {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;

        let mut trainer = Self {
            config,
            device,
            varmap,
            net,
            adam,
            counters: Counters::default(),
            state: TrainerState::Initializing,
            consecutive_non_finite: 0,
        };
        if let Some(path) = trainer.config.resume_from.clone() {
            trainer.restore(&path)?;
        }
        Ok(trainer)
    }

    /// Continue from the checkpoint at `path`.
    pub fn resume(mut config: TrainingConfig, path: impl Into<PathBuf>) -> Result<Self> {
        config.resume_from = Some(path.into());
        Self::new(config)
    }

    fn restore(&mut self, path: &Path) -> Result<()> {
        let ck = checkpoint::load(path, &self.device)?;
        ck.require_signature(&self.signature())?;
        ck.restore_parameters(&self.varmap)?;
        if ck.optimizer.is_some() {
            ck.restore_optimizer(&mut self.adam)?;
        } else {
            log::warn!("{} has no optimizer state, starting Adam from scratch", path.display());
        }
        self.counters = ck.counters;
        log::info!(
            "resumed from {} at epoch {}, step {} ({} items into the epoch)",
            path.display(),
            self.counters.epoch + 1,
            self.counters.step,
            self.counters.items_in_epoch
        );
        Ok(())
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn signature(&self) -> ArchitectureSignature {
        self.net.signature()
    }

    /// An engine over a snapshot of the current parameters. Later training
    /// does not affect it.
    pub fn inference_engine(&self) -> Result<InferenceEngine> {
        let net = DualHeadNet::frozen(self.config.network, snapshot(&self.varmap)?, &self.device)?;
        Ok(InferenceEngine::from_network(net, self.device.clone()))
    }

    /// Write parameters, optimizer state and counters to `path`.
    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        checkpoint::save(path, self.signature(), self.counters, &self.varmap, Some(&self.adam))
    }

    /// Train until `config.epochs` epochs have been completed or `stop` is
    /// raised and the next checkpoint has been written.
    pub fn run(&mut self, dataset: &PositionDataset, stop: &StopSignal) -> Result<TrainingReport> {
        let mut report = TrainingReport {
            outcome: TrainingOutcome::Completed,
            steps: self.counters.step,
            epochs_completed: 0,
            last_loss: None,
            skipped_batches: 0,
            non_finite_batches: 0,
            corrupt_games: 0,
            checkpoints: Vec::new(),
        };
        let batch_size = self.config.batch_size;
        let periodic = self.config.checkpoint_every_steps.is_some() || self.config.checkpoint_every_epochs.is_some();

        while self.counters.epoch < self.config.epochs {
            let epoch = self.counters.epoch;
            let lr = step_decay(
                self.config.learning_rate,
                self.config.lr_gamma,
                self.config.lr_step_epochs,
                epoch,
            );
            self.adam.set_learning_rate(lr);
            log::info!("epoch {}/{} (lr {lr:e})", epoch + 1, self.config.epochs);

            let mut samples = dataset.iter_epoch(epoch as u64);
            let mut to_skip = self.counters.items_in_epoch;
            let mut batch: Vec<TrainingSample> = Vec::with_capacity(batch_size);
            let mut batch_index = 0;

            loop {
                let next = samples.next();
                let exhausted = next.is_none();
                match next {
                    Some(Ok(_)) if to_skip > 0 => to_skip -= 1,
                    Some(Ok(sample)) => batch.push(sample),
                    Some(Err(e)) if e.is_recoverable_game_error() => {
                        if to_skip == 0 {
                            log::warn!("{e}");
                        }
                    }
                    Some(Err(e)) => {
                        log::error!("aborting training: {e}");
                        return Err(e);
                    }
                    None => {}
                }

                if batch.len() == batch_size || (exhausted && !batch.is_empty()) {
                    self.state = TrainerState::Training {
                        epoch,
                        batch: batch_index,
                    };
                    let stepped = self.apply_batch(&batch, &mut report)?;
                    self.counters.items_in_epoch += batch.len();
                    batch.clear();
                    batch_index += 1;

                    let due = stepped
                        && self
                            .config
                            .checkpoint_every_steps
                            .is_some_and(|every| self.counters.step % every == 0);
                    if due || (stop.is_raised() && !periodic) {
                        self.checkpoint(None, &mut report)?;
                        if stop.is_raised() {
                            return Ok(self.stopped(report));
                        }
                    }
                }
                if exhausted {
                    break;
                }
            }

            report.corrupt_games += samples.stats().games_corrupt;
            self.counters.epoch += 1;
            self.counters.items_in_epoch = 0;
            report.epochs_completed += 1;
            log::info!(
                "finished epoch {} after step {} ({} samples, {} corrupt games)",
                epoch + 1,
                self.counters.step,
                samples.stats().samples,
                samples.stats().games_corrupt
            );

            let finished = self.counters.epoch >= self.config.epochs;
            let due = self
                .config
                .checkpoint_every_epochs
                .is_some_and(|every| self.counters.epoch % every == 0);
            if due || finished || stop.is_raised() {
                let epoch_file = due.then_some(self.counters.epoch);
                self.checkpoint(epoch_file, &mut report)?;
                if stop.is_raised() && !finished {
                    return Ok(self.stopped(report));
                }
            }
        }

        self.state = TrainerState::Completed;
        log::info!("training completed after {} steps", self.counters.step);
        Ok(report)
    }

    fn stopped(&mut self, mut report: TrainingReport) -> TrainingReport {
        self.state = TrainerState::Stopped;
        report.outcome = TrainingOutcome::Stopped;
        log::info!("training stopped at step {}", self.counters.step);
        report
    }

    fn checkpoint(&mut self, epoch_file: Option<usize>, report: &mut TrainingReport) -> Result<()> {
        let previous = self.state;
        self.state = TrainerState::Checkpointing;
        let dir = self.config.checkpoint_dir.clone();
        let latest = dir.join("latest.safetensors");
        self.save_checkpoint(&latest)?;
        report.checkpoints.push(latest);
        if let Some(epoch) = epoch_file {
            let path = dir.join(format!("epoch-{epoch:04}.safetensors"));
            self.save_checkpoint(&path)?;
            report.checkpoints.push(path);
        }
        self.state = previous;
        Ok(())
    }

    /// Returns whether an optimizer step was taken.
    fn apply_batch(&mut self, batch: &[TrainingSample], report: &mut TrainingReport) -> Result<bool> {
        match self.train_batch(batch)? {
            BatchOutcome::Trained(loss) => {
                report.steps = self.counters.step;
                report.last_loss = Some(loss);
                return Ok(true);
            }
            BatchOutcome::Skipped => report.skipped_batches += 1,
            BatchOutcome::NonFinite => report.non_finite_batches += 1,
        }
        Ok(false)
    }

    /// One forward/backward pass and optimizer step over `batch`.
    ///
    /// Invalid batches are skipped and non-finite losses leave the
    /// parameters untouched; after `max_divergent_batches` non-finite
    /// losses in a row this fails with `NumericalDivergence`.
    pub fn train_batch(&mut self, batch: &[TrainingSample]) -> Result<BatchOutcome> {
        if let Err(e) = self.check_batch(batch) {
            log::warn!("{e}");
            return Ok(BatchOutcome::Skipped);
        }

        let (loss, breakdown) = self.loss(batch)?;
        if !breakdown.total.is_finite() {
            self.consecutive_non_finite += 1;
            log::warn!(
                "non-finite loss at step {} ({} in a row), update skipped",
                self.counters.step,
                self.consecutive_non_finite
            );
            if self.consecutive_non_finite >= self.config.max_divergent_batches {
                let err = ChessNetError::NumericalDivergence {
                    step: self.counters.step,
                    consecutive: self.consecutive_non_finite,
                };
                log::error!("{err}");
                return Err(err);
            }
            return Ok(BatchOutcome::NonFinite);
        }
        self.consecutive_non_finite = 0;

        let grads = loss.backward()?;
        self.adam.step(&grads)?;
        self.counters.step += 1;
        log::debug!(
            "step {}: loss {:.4} (policy {:.4}, value {:.4})",
            self.counters.step,
            breakdown.total,
            breakdown.policy,
            breakdown.value
        );
        Ok(BatchOutcome::Trained(breakdown))
    }

    /// Loss over `batch` with the current parameters, without training.
    pub fn evaluate_batch(&self, batch: &[TrainingSample]) -> Result<LossBreakdown> {
        self.check_batch(batch)?;
        Ok(self.loss(batch)?.1)
    }

    fn check_batch(&self, batch: &[TrainingSample]) -> Result<()> {
        if batch.is_empty() {
            return Err(ChessNetError::MalformedBatch("empty batch".to_string()));
        }
        for sample in batch {
            if sample.board.planes().iter().any(|v| !v.is_finite()) {
                return Err(ChessNetError::MalformedBatch(format!(
                    "non-finite board planes (ply {})",
                    sample.ply
                )));
            }
            if sample.move_index as usize >= MOVE_SPACE {
                return Err(ChessNetError::MalformedBatch(format!(
                    "move index {} outside the move space (ply {})",
                    sample.move_index, sample.ply
                )));
            }
            if !(-1.0..=1.0).contains(&sample.outcome) {
                return Err(ChessNetError::MalformedBatch(format!(
                    "outcome label {} outside [-1, 1] (ply {})",
                    sample.outcome, sample.ply
                )));
            }
            if self.config.mask_illegal_moves && !sample.legal_indices.contains(&sample.move_index) {
                return Err(ChessNetError::MalformedBatch(format!(
                    "played move {} is not among the legal moves (ply {})",
                    sample.move_index, sample.ply
                )));
            }
        }
        Ok(())
    }

    fn loss(&self, batch: &[TrainingSample]) -> Result<(Tensor, LossBreakdown)> {
        let n = batch.len();
        let boards = stack_boards(batch.iter().map(|s| &s.board));
        let xs = to_tensor(&boards, &self.device)?;
        let targets = Tensor::from_vec(
            batch.iter().map(|s| s.move_index).collect::<Vec<u32>>(),
            n,
            &self.device,
        )?;
        let outcomes = Tensor::from_vec(
            batch.iter().map(|s| s.outcome).collect::<Vec<f32>>(),
            n,
            &self.device,
        )?;

        let (mut logits, value) = self.net.forward(&xs)?;
        if self.config.mask_illegal_moves {
            let mut mask = vec![ILLEGAL_LOGIT; n * MOVE_SPACE];
            for (row, sample) in batch.iter().enumerate() {
                for &index in &sample.legal_indices {
                    mask[row * MOVE_SPACE + index as usize] = 0.0;
                }
            }
            logits = logits.add(&Tensor::from_vec(mask, (n, MOVE_SPACE), &self.device)?)?;
        }

        let policy = candle_nn::loss::cross_entropy(&logits, &targets)?;
        let value = candle_nn::loss::mse(&value, &outcomes)?;
        let total = policy
            .affine(self.config.policy_weight, 0.0)?
            .add(&value.affine(self.config.value_weight, 0.0)?)?;

        let breakdown = LossBreakdown {
            total: total.to_scalar()?,
            policy: policy.to_scalar()?,
            value: value.to_scalar()?,
        };
        Ok((total, breakdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DeviceTarget,
        dataset::{DatasetConfig, GameRecord},
        network::tiny,
        tensor::EncodedBoard,
    };
    use ndarray::Array3;
    use shakmaty::Chess;

    fn games() -> Vec<GameRecord> {
        vec![
            GameRecord::new("g1", &["e4", "e5", "Nf3", "Nc6"], "1-0"),
            GameRecord::new("g2", &["d4", "d5", "c4"], "0-1"),
            GameRecord::new("g3", &["e4", "c5"], "1/2-1/2"),
        ]
    }

    fn dataset(seed: Option<u64>) -> PositionDataset {
        let config = DatasetConfig {
            shuffle_seed: seed,
            ..Default::default()
        };
        PositionDataset::from_records(games(), config).unwrap()
    }

    fn config(dir: &Path) -> TrainingConfig {
        TrainingConfig {
            batch_size: 4,
            epochs: 2,
            learning_rate: 1e-2,
            checkpoint_dir: dir.to_path_buf(),
            device: DeviceTarget::Cpu,
            network: tiny(),
            ..Default::default()
        }
    }

    fn params(varmap: &VarMap) -> Vec<(String, Vec<f32>)> {
        let mut out: Vec<_> = snapshot(varmap)
            .unwrap()
            .into_iter()
            .map(|(name, t)| (name, t.flatten_all().unwrap().to_vec1().unwrap()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn start_samples(n: usize) -> Vec<TrainingSample> {
        let pos = Chess::default();
        let legal: Vec<u32> = crate::moves::legal_move_indices(&pos).into_iter().map(|(_, i)| i).collect();
        (0..n)
            .map(|i| TrainingSample {
                board: crate::tensor::encode_position(&pos),
                move_index: legal[i % legal.len()],
                outcome: if i % 2 == 0 { 1.0 } else { -1.0 },
                legal_indices: legal.clone(),
                ply: 0,
            })
            .collect()
    }

    #[test]
    fn runs_every_epoch_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(config(dir.path())).unwrap();
        assert_eq!(trainer.state(), TrainerState::Initializing);

        let report = trainer.run(&dataset(None), &StopSignal::new()).unwrap();
        assert_eq!(report.outcome, TrainingOutcome::Completed);
        assert_eq!(trainer.state(), TrainerState::Completed);
        // 9 samples per epoch in batches of 4, 4 and 1
        assert_eq!(report.steps, 6);
        assert_eq!(report.epochs_completed, 2);
        assert!(report.last_loss.is_some());
        assert!(dir.path().join("latest.safetensors").exists());
        assert!(dir.path().join("epoch-0001.safetensors").exists());
        assert!(dir.path().join("epoch-0002.safetensors").exists());
        assert_eq!(trainer.counters().epoch, 2);
    }

    #[test]
    fn checkpoint_reproduces_engine_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(config(dir.path())).unwrap();
        trainer.run(&dataset(None), &StopSignal::new()).unwrap();

        let live = trainer.inference_engine().unwrap();
        let loaded = InferenceEngine::from_checkpoint(dir.path().join("latest.safetensors"), Device::Cpu).unwrap();
        let pos = Chess::default();
        assert_eq!(live.evaluate(&pos).unwrap(), loaded.evaluate(&pos).unwrap());

        let a = live.suggest_moves(&pos, 5).unwrap();
        let b = loaded.suggest_moves(&pos, 5).unwrap();
        assert_eq!(
            a.iter().map(|m| (m.index, m.probability)).collect::<Vec<_>>(),
            b.iter().map(|m| (m.index, m.probability)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn stop_then_resume_matches_uninterrupted_run() {
        let init_dir = tempfile::tempdir().unwrap();
        let init = init_dir.path().join("init.safetensors");
        Trainer::new(config(init_dir.path())).unwrap().save_checkpoint(&init).unwrap();
        let data = dataset(Some(7));

        let straight_dir = tempfile::tempdir().unwrap();
        let mut straight = Trainer::resume(config(straight_dir.path()), &init).unwrap();
        straight.run(&data, &StopSignal::new()).unwrap();

        // stop two steps into the first epoch
        let split_dir = tempfile::tempdir().unwrap();
        let stop = StopSignal::new();
        stop.raise();
        let mut first = Trainer::resume(
            TrainingConfig {
                checkpoint_every_steps: Some(2),
                ..config(split_dir.path())
            },
            &init,
        )
        .unwrap();
        let report = first.run(&data, &stop).unwrap();
        assert_eq!(report.outcome, TrainingOutcome::Stopped);
        assert_eq!(first.state(), TrainerState::Stopped);
        assert_eq!(report.steps, 2);
        assert_eq!(first.counters().items_in_epoch, 8);

        let mut second = Trainer::resume(config(split_dir.path()), split_dir.path().join("latest.safetensors")).unwrap();
        assert_eq!(second.counters().step, 2);
        let report = second.run(&data, &StopSignal::new()).unwrap();
        assert_eq!(report.steps, 6);

        for ((name, a), (_, b)) in params(straight.varmap()).iter().zip(params(second.varmap()).iter()) {
            for (x, y) in a.iter().zip(b) {
                assert!((x - y).abs() < 1e-5, "{name}: {x} vs {y}");
            }
        }
    }

    #[test]
    fn resume_rejects_other_network_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.safetensors");
        Trainer::new(config(dir.path())).unwrap().save_checkpoint(&path).unwrap();

        let mut wider = config(dir.path());
        wider.network.channels = 16;
        assert!(matches!(
            Trainer::resume(wider, &path),
            Err(ChessNetError::IncompatibleCheckpoint { .. })
        ));
    }

    #[test]
    fn non_finite_losses_halt_without_updating() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(config(dir.path())).unwrap();
        {
            let vars = trainer.varmap().data().lock().unwrap();
            vars["value.fc2.bias"].set(&Tensor::new(&[f32::NAN], &Device::Cpu).unwrap()).unwrap();
        }
        let healthy = |varmap: &VarMap| {
            params(varmap)
                .into_iter()
                .filter(|(name, _)| name != "value.fc2.bias")
                .collect::<Vec<_>>()
        };
        let before = healthy(trainer.varmap());

        let batch = start_samples(2);
        assert_eq!(trainer.train_batch(&batch).unwrap(), BatchOutcome::NonFinite);
        assert_eq!(trainer.train_batch(&batch).unwrap(), BatchOutcome::NonFinite);
        assert!(matches!(
            trainer.train_batch(&batch),
            Err(ChessNetError::NumericalDivergence { step: 0, consecutive: 3 })
        ));
        assert_eq!(before, healthy(trainer.varmap()));
        assert_eq!(trainer.counters().step, 0);
    }

    #[test]
    fn malformed_batches_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(config(dir.path())).unwrap();

        let mut bad_label = start_samples(3);
        bad_label[1].outcome = 2.0;
        assert_eq!(trainer.train_batch(&bad_label).unwrap(), BatchOutcome::Skipped);

        let mut bad_index = start_samples(3);
        bad_index[0].move_index = MOVE_SPACE as u32;
        assert_eq!(trainer.train_batch(&bad_index).unwrap(), BatchOutcome::Skipped);

        let mut unplayable = start_samples(3);
        unplayable[2].legal_indices.clear();
        assert_eq!(trainer.train_batch(&unplayable).unwrap(), BatchOutcome::Skipped);

        let mut nan_board = start_samples(3);
        nan_board[1].board = EncodedBoard::from_array(Array3::from_elem((19, 8, 8), f32::NAN)).unwrap();
        assert_eq!(trainer.train_batch(&nan_board).unwrap(), BatchOutcome::Skipped);

        assert_eq!(trainer.counters().step, 0);
        assert!(matches!(trainer.train_batch(&start_samples(3)).unwrap(), BatchOutcome::Trained(_)));
        assert_eq!(trainer.counters().step, 1);
    }

    #[test]
    fn repeated_batch_loss_goes_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(config(dir.path())).unwrap();
        let batch = start_samples(4);

        let first = trainer.evaluate_batch(&batch).unwrap();
        for _ in 0..30 {
            trainer.train_batch(&batch).unwrap();
        }
        let last = trainer.evaluate_batch(&batch).unwrap();
        assert!(last.total < first.total, "{} -> {}", first.total, last.total);
        // legal masking keeps the policy loss below uniform over all moves
        assert!(first.policy < (MOVE_SPACE as f32).ln());
    }

    #[test]
    fn stop_signal_is_shared() {
        let stop = StopSignal::new();
        let other = stop.clone();
        assert!(!stop.is_raised());
        other.raise();
        assert!(stop.is_raised());
    }
}
