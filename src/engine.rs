use std::path::Path;

use candle_core::Device;
use shakmaty::{CastlingMode, Chess, Position};

use crate::{
    checkpoint,
    error::{ChessNetError, Result},
    moves::legal_move_indices,
    network::{ArchitectureSignature, DualHeadNet},
    tensor::{encode_position, fen_of, position_from_fen, stack_boards, to_tensor},
    types::{EvaluationResult, MoveProbability},
};

/// Read-only evaluator over a frozen set of network parameters.
///
/// The weights are constant tensors, so an engine can be shared between
/// threads and never observes a training run in progress.
pub struct InferenceEngine {
    net: DualHeadNet,
    device: Device,
}

impl InferenceEngine {
    /// Load the parameters of a checkpoint written by the trainer.
    pub fn from_checkpoint(path: impl AsRef<Path>, device: Device) -> Result<Self> {
        let ck = checkpoint::load(path.as_ref(), &device)?;
        let net = ck.frozen_network(&device)?;
        log::info!(
            "loaded network {:?} from {} (step {})",
            ck.net_config(),
            path.as_ref().display(),
            ck.counters.step
        );
        Ok(Self { net, device })
    }

    pub fn from_network(net: DualHeadNet, device: Device) -> Self {
        Self { net, device }
    }

    pub fn signature(&self) -> ArchitectureSignature {
        self.net.signature()
    }

    /// Value in [-1, 1] for the side to move. A checkmated side gets -1 and
    /// a stalemate 0 without consulting the network.
    pub fn evaluate(&self, pos: &Chess) -> Result<f32> {
        if pos.is_checkmate() {
            return Ok(-1.0);
        }
        if pos.is_stalemate() {
            return Ok(0.0);
        }
        let (_, values) = self.forward(std::slice::from_ref(pos))?;
        Ok(values[0])
    }

    /// The `top_k` most likely legal moves according to the policy head.
    pub fn suggest_moves(&self, pos: &Chess, top_k: usize) -> Result<Vec<MoveProbability>> {
        Ok(self.analyse(pos, top_k)?.policy)
    }

    pub fn analyse(&self, pos: &Chess, top_k: usize) -> Result<EvaluationResult> {
        let mut results = self.batch_analyse(std::slice::from_ref(pos), top_k)?;
        results.pop().ok_or_else(|| ChessNetError::NoLegalMoves { fen: fen_of(pos) })
    }

    pub fn analyse_fen(&self, fen: &str, top_k: usize) -> Result<EvaluationResult> {
        self.analyse(&position_from_fen(fen)?, top_k)
    }

    /// Analyse several positions with a single forward pass. Fails with
    /// `NoLegalMoves` if any position is terminal.
    pub fn batch_analyse(&self, positions: &[Chess], top_k: usize) -> Result<Vec<EvaluationResult>> {
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(terminal) = positions.iter().find(|p| p.legal_moves().is_empty()) {
            return Err(ChessNetError::NoLegalMoves { fen: fen_of(terminal) });
        }

        let (logits, values) = self.forward(positions)?;
        Ok(positions
            .iter()
            .zip(logits.iter().zip(values))
            .map(|(pos, (row, value))| process_output(row, value, pos, top_k))
            .collect())
    }

    fn forward(&self, positions: &[Chess]) -> Result<(Vec<Vec<f32>>, Vec<f32>)> {
        let boards: Vec<_> = positions.iter().map(encode_position).collect();
        let xs = to_tensor(&stack_boards(&boards), &self.device)?;
        let (logits, values) = self.net.forward(&xs)?;
        Ok((logits.to_vec2()?, values.to_vec1()?))
    }
}

fn process_output(logits: &[f32], value: f32, pos: &Chess, top_k: usize) -> EvaluationResult {
    let legal = legal_move_indices(pos);

    let max_logit = legal
        .iter()
        .map(|&(_, index)| logits[index as usize])
        .fold(f32::NEG_INFINITY, f32::max);

    // softmax restricted to the legal moves
    let exps: Vec<f32> = legal
        .iter()
        .map(|&(_, index)| (logits[index as usize] - max_logit).exp())
        .collect();
    let sum_exp: f32 = exps.iter().sum();

    let mut policy: Vec<MoveProbability> = legal
        .into_iter()
        .zip(exps)
        .map(|((mv, index), exp)| MoveProbability {
            uci: mv.to_uci(CastlingMode::Standard),
            mv,
            index,
            probability: exp / sum_exp,
        })
        .collect();

    policy.sort_by(|a, b| {
        b.probability
            .total_cmp(&a.probability)
            .then(a.index.cmp(&b.index))
    });
    policy.truncate(top_k);

    EvaluationResult {
        policy,
        value,
        win_probability: (value / 2.0 + 0.5).clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{snapshot, tiny};
    use std::collections::HashMap;

    const THREE_MOVES: &str = "k7/8/8/8/8/8/8/7K w - - 0 1";
    const FOOLS_MATE: &str = "rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3";
    const STALEMATE: &str = "k7/8/1Q6/8/8/8/8/7K b - - 0 1";

    fn random_engine() -> InferenceEngine {
        let (_, net) = DualHeadNet::trainable(tiny(), &Device::Cpu).unwrap();
        InferenceEngine::from_network(net, Device::Cpu)
    }

    fn zero_engine() -> InferenceEngine {
        let (varmap, _) = DualHeadNet::trainable(tiny(), &Device::Cpu).unwrap();
        let zeros: HashMap<_, _> = snapshot(&varmap)
            .unwrap()
            .into_iter()
            .map(|(name, t)| (name, t.zeros_like().unwrap()))
            .collect();
        let net = DualHeadNet::frozen(tiny(), zeros, &Device::Cpu).unwrap();
        InferenceEngine::from_network(net, Device::Cpu)
    }

    #[test]
    fn policy_covers_only_legal_moves() {
        let engine = random_engine();
        let pos = position_from_fen(THREE_MOVES).unwrap();
        let moves = engine.suggest_moves(&pos, 5).unwrap();
        assert_eq!(moves.len(), 3);

        let total: f32 = moves.iter().map(|m| m.probability).sum();
        assert!((total - 1.0).abs() < 1e-5);
        for pair in moves.windows(2) {
            assert!(pair[0].probability >= pair[1].probability);
        }
        let legal = pos.legal_moves();
        assert!(moves.iter().all(|m| legal.contains(&m.mv)));
    }

    #[test]
    fn top_k_truncates() {
        let engine = random_engine();
        let moves = engine.suggest_moves(&Chess::default(), 4).unwrap();
        assert_eq!(moves.len(), 4);
        let all = engine.suggest_moves(&Chess::default(), 100).unwrap();
        assert_eq!(all.len(), 20);
        assert_eq!(moves[0].index, all[0].index);
    }

    #[test]
    fn ties_break_by_move_index() {
        let engine = zero_engine();
        let pos = Chess::default();
        let moves = engine.suggest_moves(&pos, 20).unwrap();

        let mut expected: Vec<u32> = legal_move_indices(&pos).into_iter().map(|(_, i)| i).collect();
        expected.sort_unstable();
        assert_eq!(moves.iter().map(|m| m.index).collect::<Vec<_>>(), expected);
        assert!(moves.iter().all(|m| (m.probability - 0.05).abs() < 1e-6));
        assert_eq!(engine.evaluate(&pos).unwrap(), 0.0);
    }

    #[test]
    fn terminal_positions() {
        let engine = random_engine();
        let mated = position_from_fen(FOOLS_MATE).unwrap();
        assert_eq!(engine.evaluate(&mated).unwrap(), -1.0);
        assert!(matches!(
            engine.suggest_moves(&mated, 3),
            Err(ChessNetError::NoLegalMoves { .. })
        ));

        let stalemate = position_from_fen(STALEMATE).unwrap();
        assert_eq!(engine.evaluate(&stalemate).unwrap(), 0.0);
        assert!(engine.analyse(&stalemate, 3).is_err());
        assert!(engine.batch_analyse(&[Chess::default(), stalemate], 3).is_err());
    }

    #[test]
    fn batch_matches_single_analysis() {
        let engine = random_engine();
        let positions = [Chess::default(), position_from_fen(THREE_MOVES).unwrap()];
        let batch = engine.batch_analyse(&positions, 5).unwrap();
        assert_eq!(batch.len(), 2);
        for (pos, result) in positions.iter().zip(&batch) {
            let single = engine.analyse(pos, 5).unwrap();
            assert!((single.value - result.value).abs() < 1e-5);
            assert_eq!(single.policy[0].index, result.policy[0].index);
            assert!((0.0..=1.0).contains(&result.win_probability));
        }
        assert!(engine.batch_analyse(&[], 5).unwrap().is_empty());
    }

    #[test]
    fn analyse_fen_reports_bad_input() {
        let engine = random_engine();
        assert!(engine.analyse_fen("not a fen", 3).is_err());
        assert_eq!(engine.analyse_fen(THREE_MOVES, 1).unwrap().policy.len(), 1);
    }

    #[test]
    fn engine_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<InferenceEngine>();
    }
}
