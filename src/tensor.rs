use candle_core::{Device, Tensor};
use ndarray::{Array3, Array4, ArrayView2, ArrayView3, ArrayViewMut3, Axis, ErrorKind, ShapeError};
use shakmaty::{
    Bitboard, CastlingMode, Chess, Color, EnPassantMode, File, Position, Rank, Role, Setup, Square,
    fen::Fen,
};

use crate::error::{ChessNetError, Result};

/// Number of input planes produced by [`encode`].
///
/// - 0..=5   white pawn, knight, bishop, rook, queen, king
/// - 6..=11  black pieces in the same order
/// - 12      side to move (1.0 everywhere if white is to move)
/// - 13..=16 castling rights K, Q, k, q
/// - 17      en passant target square
/// - 18      half-move clock, `min(halfmoves, 100) / 100`
///
/// Changing this layout invalidates every trained checkpoint; the plane
/// count is part of the architecture signature stored with the weights.
pub const PLANES: usize = 19;

pub const TURN_PLANE: usize = 12;
pub const CASTLING_PLANE: usize = 13;
pub const EN_PASSANT_PLANE: usize = 17;
pub const HALFMOVE_PLANE: usize = 18;

const HALFMOVE_SCALE: u32 = 100;

/// A position encoded as `[PLANES, 8, 8]` floats indexed
/// `[plane, rank, file]` (rank 1 and file a map to 0).
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBoard(Array3<f32>);

impl EncodedBoard {
    /// Wrap a raw array, checking its shape.
    pub fn from_array(planes: Array3<f32>) -> Result<Self> {
        if planes.dim() != (PLANES, 8, 8) {
            return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into());
        }
        Ok(Self(planes))
    }

    pub fn planes(&self) -> ArrayView3<'_, f32> {
        self.0.view()
    }

    pub fn plane(&self, index: usize) -> ArrayView2<'_, f32> {
        self.0.index_axis(Axis(0), index)
    }

    pub fn into_inner(self) -> Array3<f32> {
        self.0
    }
}

/// Encode a structured position descriptor.
///
/// Only structural defects are rejected; legality of the position (checks,
/// reachable material) is irrelevant to the encoding. Playable setups are
/// encoded exactly like [`encode_position`], so the en passant plane is set
/// only when the capture is legal. Other setups keep the square when a pawn
/// of the side to move stands ready to capture.
pub fn encode(setup: &Setup) -> Result<EncodedBoard> {
    check_structure(setup)?;
    if let Ok(pos) = setup.clone().position::<Chess>(CastlingMode::Standard) {
        return Ok(encode_position(&pos));
    }
    let ep_square = setup.ep_square.filter(|&ep| has_en_passant_capturer(setup, ep));
    let setup = Setup { ep_square, ..setup.clone() };
    let mut planes = Array3::<f32>::zeros((PLANES, 8, 8));
    board_to_tensor(&setup, planes.view_mut());
    Ok(EncodedBoard(planes))
}

/// Encode an already validated position.
pub fn encode_position(pos: &Chess) -> EncodedBoard {
    let setup = pos.to_setup(EnPassantMode::Legal);
    let mut planes = Array3::<f32>::zeros((PLANES, 8, 8));
    board_to_tensor(&setup, planes.view_mut());
    EncodedBoard(planes)
}

fn has_en_passant_capturer(setup: &Setup, ep: Square) -> bool {
    let rank = if setup.turn.is_white() { ep.rank() as i32 - 1 } else { ep.rank() as i32 + 1 };
    let pawns = setup.board.pawns() & setup.board.by_color(setup.turn);
    [ep.file() as i32 - 1, ep.file() as i32 + 1]
        .into_iter()
        .filter(|file| (0..8).contains(file) && (0..8).contains(&rank))
        .any(|file| pawns.contains(Square::from_coords(File::new(file as u32), Rank::new(rank as u32))))
}

fn check_structure(setup: &Setup) -> Result<()> {
    let board = &setup.board;
    for color in [Color::White, Color::Black] {
        let kings = (board.kings() & board.by_color(color)).count();
        if kings != 1 {
            return Err(ChessNetError::InvalidPosition(format!(
                "{color:?} has {kings} kings, expected exactly one"
            )));
        }
    }

    let backranks = Bitboard::from_rank(Rank::First) | Bitboard::from_rank(Rank::Eighth);
    if !(board.pawns() & backranks).is_empty() {
        return Err(ChessNetError::InvalidPosition(
            "pawn on the first or eighth rank".to_string(),
        ));
    }

    if let Some(ep) = setup.ep_square {
        let expected = if setup.turn.is_white() { Rank::Sixth } else { Rank::Third };
        if ep.rank() != expected {
            return Err(ChessNetError::InvalidPosition(format!(
                "en passant square {ep} is not on the {expected:?} rank"
            )));
        }
    }
    Ok(())
}

fn board_to_tensor(setup: &Setup, mut tensor: ArrayViewMut3<f32>) {
    // Piece placement: white pieces in 0..=5, black in 6..=11.
    for sq in Square::ALL {
        if let Some(piece) = setup.board.piece_at(sq) {
            let color_offset = if piece.color.is_white() { 0 } else { 6 };
            let channel = color_offset + role_offset(piece.role);
            tensor[[channel, sq.rank() as usize, sq.file() as usize]] = 1.0;
        }
    }

    tensor
        .index_axis_mut(Axis(0), TURN_PLANE)
        .fill(setup.turn.is_white() as u8 as f32);

    // Castling rights are stored as the original rook squares.
    let castling_rights = [
        setup.castling_rights.contains(Square::H1), // K
        setup.castling_rights.contains(Square::A1), // Q
        setup.castling_rights.contains(Square::H8), // k
        setup.castling_rights.contains(Square::A8), // q
    ];
    for (i, &has_right) in castling_rights.iter().enumerate() {
        tensor
            .index_axis_mut(Axis(0), CASTLING_PLANE + i)
            .fill(has_right as u8 as f32);
    }

    if let Some(ep_sq) = setup.ep_square {
        tensor[[EN_PASSANT_PLANE, ep_sq.rank() as usize, ep_sq.file() as usize]] = 1.0;
    }

    let clock = setup.halfmoves.min(HALFMOVE_SCALE) as f32 / HALFMOVE_SCALE as f32;
    tensor.index_axis_mut(Axis(0), HALFMOVE_PLANE).fill(clock);
}

fn role_offset(role: Role) -> usize {
    match role {
        Role::Pawn => 0,
        Role::Knight => 1,
        Role::Bishop => 2,
        Role::Rook => 3,
        Role::Queen => 4,
        Role::King => 5,
    }
}

/// Stack encoded boards into a `[B, PLANES, 8, 8]` batch.
pub fn stack_boards<'a>(boards: impl IntoIterator<Item = &'a EncodedBoard>) -> Array4<f32> {
    let boards: Vec<&EncodedBoard> = boards.into_iter().collect();
    let mut batch = Array4::<f32>::zeros((boards.len(), PLANES, 8, 8));
    for (i, board) in boards.iter().enumerate() {
        batch.index_axis_mut(Axis(0), i).assign(&board.0);
    }
    batch
}

/// Move a batch onto a candle device.
pub fn to_tensor(batch: &Array4<f32>, device: &Device) -> Result<Tensor> {
    let (b, c, h, w) = batch.dim();
    let data: Vec<f32> = batch.iter().copied().collect();
    Ok(Tensor::from_vec(data, (b, c, h, w), device)?)
}

/// Build a validated position from a structured descriptor.
pub fn position_from_setup(setup: Setup) -> Result<Chess> {
    check_structure(&setup)?;
    setup
        .position(CastlingMode::Standard)
        .map_err(|e| ChessNetError::InvalidPosition(e.to_string()))
}

pub fn position_from_fen(fen: &str) -> Result<Chess> {
    let fen: Fen = fen.trim().parse()?;
    position_from_setup(fen.into_setup())
}

/// FEN of a position, used to identify positions in errors and reports.
pub fn fen_of(pos: &Chess) -> String {
    Fen::from_position(pos, EnPassantMode::Legal).to_string()
}
