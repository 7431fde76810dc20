//! Fixed-size move space shared by the policy head, the dataset labels and
//! inference.
//!
//! A move is identified by its origin square and its geometric shape:
//! `index = plane * 64 + from`. Planes `0..56` are queen-like slides (eight
//! directions, distance 1 to 7), `56..64` the knight jumps and `64..73`
//! under-promotions to knight, bishop or rook with a file delta of -1, 0
//! or +1. Queen promotions and castling (the king's two-square step) reuse
//! the slide planes. The same index can therefore denote different moves in
//! different positions, but never two legal moves of one position.

use std::sync::LazyLock;

use shakmaty::{
    CastlingMode, Chess, File, Move, Position, Rank, Role, Square,
    san::SanPlus,
    uci::UciMove,
};

use crate::{
    error::{ChessNetError, Result},
    tensor::fen_of,
};

pub const MOVE_PLANES: usize = 73;
pub const MOVE_SPACE: usize = MOVE_PLANES * 64;

const QUEEN_DIRECTIONS: [(i32, i32); 8] = [
    (0, 1),   // N
    (1, 1),   // NE
    (1, 0),   // E
    (1, -1),  // SE
    (0, -1),  // S
    (-1, -1), // SW
    (-1, 0),  // W
    (-1, 1),  // NW
];

const KNIGHT_JUMPS: [(i32, i32); 8] = [
    (1, 2),
    (2, 1),
    (2, -1),
    (1, -2),
    (-1, -2),
    (-2, -1),
    (-2, 1),
    (-1, 2),
];

const UNDERPROMOTIONS: [Role; 3] = [Role::Knight, Role::Bishop, Role::Rook];

/// Shape of one move plane: file and rank delta from the origin square,
/// and the promotion role for under-promotion planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveShape {
    Slide { df: i32, dr: i32 },
    Knight { df: i32, dr: i32 },
    Underpromotion { df: i32, role: Role },
}

/// Plane table, indexed by plane number.
static SHAPES: LazyLock<Vec<MoveShape>> = LazyLock::new(|| {
    let mut shapes = Vec::with_capacity(MOVE_PLANES);
    for &(df, dr) in &QUEEN_DIRECTIONS {
        for dist in 1..=7 {
            shapes.push(MoveShape::Slide { df: df * dist, dr: dr * dist });
        }
    }
    for &(df, dr) in &KNIGHT_JUMPS {
        shapes.push(MoveShape::Knight { df, dr });
    }
    for role in UNDERPROMOTIONS {
        for df in -1..=1 {
            shapes.push(MoveShape::Underpromotion { df, role });
        }
    }
    shapes
});

/// Geometry of a move index, independent of any position.
pub fn shape_of(index: u32) -> Option<(Square, MoveShape)> {
    let index = index as usize;
    if index >= MOVE_SPACE {
        return None;
    }
    let from = Square::new((index % 64) as u32);
    SHAPES.get(index / 64).map(|&shape| (from, shape))
}

fn plane_of(df: i32, dr: i32, promotion: Option<Role>) -> Option<usize> {
    match promotion {
        Some(Role::Knight | Role::Bishop | Role::Rook) => {
            if dr.abs() != 1 || df.abs() > 1 {
                return None;
            }
            let role = promotion?;
            let r = UNDERPROMOTIONS.iter().position(|&p| p == role)?;
            Some(56 + 8 + r * 3 + (df + 1) as usize)
        }
        Some(Role::Pawn | Role::King) => None,
        Some(Role::Queen) | None => {
            if let Some(k) = KNIGHT_JUMPS.iter().position(|&j| j == (df, dr)) {
                return Some(56 + k);
            }
            let dist = df.abs().max(dr.abs());
            if dist == 0 || dist > 7 || (df != 0 && dr != 0 && df.abs() != dr.abs()) {
                return None;
            }
            let dir = QUEEN_DIRECTIONS
                .iter()
                .position(|&d| d == (df.signum(), dr.signum()))?;
            Some(dir * 7 + (dist - 1) as usize)
        }
    }
}

/// Index of a UCI move from its geometry alone. `None` for drops, null
/// moves and shapes outside the move space.
pub fn uci_index(uci: &UciMove) -> Option<u32> {
    match *uci {
        UciMove::Normal { from, to, promotion } => {
            let df = to.file() as i32 - from.file() as i32;
            let dr = to.rank() as i32 - from.rank() as i32;
            let plane = plane_of(df, dr, promotion)?;
            Some((plane * 64 + from as usize) as u32)
        }
        UciMove::Put { .. } | UciMove::Null => None,
    }
}

fn index_of_legal(m: &Move) -> Option<u32> {
    uci_index(&m.to_uci(CastlingMode::Standard))
}

/// Encode a move that must be legal in `pos`.
pub fn encode_move(pos: &Chess, m: &Move) -> Result<u32> {
    let legal = pos.legal_moves();
    if !legal.contains(m) {
        return Err(illegal(pos, m.to_uci(CastlingMode::Standard).to_string()));
    }
    index_of_legal(m).ok_or_else(|| illegal(pos, m.to_uci(CastlingMode::Standard).to_string()))
}

/// Decode an index back to the legal move it denotes in `pos`.
pub fn decode_move(pos: &Chess, index: u32) -> Result<Move> {
    if (index as usize) < MOVE_SPACE {
        for m in pos.legal_moves() {
            if index_of_legal(&m) == Some(index) {
                return Ok(m);
            }
        }
    }
    Err(ChessNetError::IllegalMoveIndex {
        index,
        fen: fen_of(pos),
    })
}

/// Every legal move of `pos` paired with its index, in move generation
/// order.
pub fn legal_move_indices(pos: &Chess) -> Vec<(Move, u32)> {
    pos.legal_moves()
        .into_iter()
        .filter_map(|m| index_of_legal(&m).map(|idx| (m, idx)))
        .collect()
}

/// Parse a move typed as UCI (`e2e4`, `e7e8q`) or SAN (`Nf3`, `O-O`,
/// `exd5+`) and check that it is legal in `pos`.
pub fn parse_move(pos: &Chess, text: &str) -> Result<Move> {
    let text = text.trim();
    if let Ok(uci) = text.parse::<UciMove>() {
        if let Ok(m) = uci.to_move(pos) {
            return Ok(m);
        }
    }
    if let Ok(san) = text.parse::<SanPlus>() {
        if let Ok(m) = san.san.to_move(pos) {
            return Ok(m);
        }
    }
    Err(illegal(pos, text.to_string()))
}

/// Position after a legal move.
pub fn play(pos: &Chess, m: &Move) -> Chess {
    let mut next = pos.clone();
    next.play_unchecked(m.clone());
    next
}

fn illegal(pos: &Chess, mv: String) -> ChessNetError {
    ChessNetError::IllegalMove { mv, fen: fen_of(pos) }
}

/// Square reached by a shape from `from`, if it stays on the board.
pub fn target_square(from: Square, shape: MoveShape) -> Option<Square> {
    let (df, dr) = match shape {
        MoveShape::Slide { df, dr } | MoveShape::Knight { df, dr } => (df, dr),
        // under-promotions are only ever forward moves of the side to move;
        // the rank direction follows from the origin rank
        MoveShape::Underpromotion { df, .. } => {
            let dr = match from.rank() {
                Rank::Seventh => 1,
                Rank::Second => -1,
                _ => return None,
            };
            (df, dr)
        }
    };
    let file = from.file() as i32 + df;
    let rank = from.rank() as i32 + dr;
    if !(0..8).contains(&file) || !(0..8).contains(&rank) {
        return None;
    }
    Some(Square::from_coords(File::new(file as u32), Rank::new(rank as u32)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::position_from_fen;
    use std::collections::HashSet;

    const POSITIONS: [&str; 6] = [
        "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
        // castling both ways for white
        "r3k2r/pppq1ppp/2n2n2/2bpp1B1/2BPP1b1/2N2N2/PPPQ1PPP/R3K2R w KQkq - 4 8",
        // promotions with captures
        "1n2k3/P1P5/8/8/8/8/6pp/4KN2 w - - 0 1",
        "1n2k3/P1P5/8/8/8/8/6pp/4KN2 b - - 0 1",
        // en passant
        "rnbqkbnr/ppp1p1pp/8/3pPp2/8/8/PPPP1PPP/RNBQKBNR w KQkq f6 0 3",
        // black castling
        "r3k2r/8/8/8/8/8/8/4K3 b kq - 0 1",
    ];

    #[test]
    fn plane_table_is_complete() {
        assert_eq!(SHAPES.len(), MOVE_PLANES);
        let unique: HashSet<_> = SHAPES.iter().map(|s| format!("{s:?}")).collect();
        assert_eq!(unique.len(), MOVE_PLANES);
        assert_eq!(MOVE_SPACE, 4672);
    }

    #[test]
    fn codec_round_trips_every_legal_move() {
        for fen in POSITIONS {
            let pos = position_from_fen(fen).unwrap();
            let mut seen = HashSet::new();
            for m in pos.legal_moves() {
                let idx = encode_move(&pos, &m).unwrap();
                assert!((idx as usize) < MOVE_SPACE);
                assert!(seen.insert(idx), "duplicate index {idx} in {fen}");
                assert_eq!(decode_move(&pos, idx).unwrap(), m, "{fen}");
            }
            assert_eq!(legal_move_indices(&pos).len(), pos.legal_moves().len());
        }
    }

    #[test]
    fn known_indices() {
        let pos = Chess::default();
        // e2e4: north slide of distance 2 from e2 (square 12)
        let m = parse_move(&pos, "e2e4").unwrap();
        assert_eq!(encode_move(&pos, &m).unwrap(), 64 + 12);
        // g1f3: knight jump (-1, +2), the last knight plane
        let m = parse_move(&pos, "Nf3").unwrap();
        assert_eq!(encode_move(&pos, &m).unwrap(), (56 + 7) * 64 + 6);

        // white short castling is the king's two-square step east
        let pos = position_from_fen(POSITIONS[1]).unwrap();
        let m = parse_move(&pos, "O-O").unwrap();
        assert_eq!(encode_move(&pos, &m).unwrap(), (2 * 7 + 1) * 64 + 4);

        // a7b8n: capture-promotion to knight with file delta +1
        let pos = position_from_fen(POSITIONS[2]).unwrap();
        let m = parse_move(&pos, "a7b8n").unwrap();
        assert_eq!(encode_move(&pos, &m).unwrap(), (64 + 2) * 64 + 48);
        // a7b8q uses the north-east slide plane
        let m = parse_move(&pos, "a7b8q").unwrap();
        assert_eq!(encode_move(&pos, &m).unwrap(), 7 * 64 + 48);
    }

    #[test]
    fn shapes_match_indices() {
        let pos = position_from_fen(POSITIONS[2]).unwrap();
        for (m, idx) in legal_move_indices(&pos) {
            let (from, shape) = shape_of(idx).unwrap();
            assert_eq!(Some(from), m.from());
            assert_eq!(target_square(from, shape), Some(m.to()));
        }
        assert_eq!(shape_of(MOVE_SPACE as u32), None);
    }

    #[test]
    fn illegal_moves_are_rejected() {
        let pos = Chess::default();
        let err = parse_move(&pos, "e2e5").unwrap_err();
        assert!(matches!(err, ChessNetError::IllegalMove { .. }));
        assert_eq!(err.layer(), "codec");

        // legal from another position, not from the start position
        let other = position_from_fen(POSITIONS[1]).unwrap();
        let castle = parse_move(&other, "e1g1").unwrap();
        assert!(matches!(
            encode_move(&pos, &castle),
            Err(ChessNetError::IllegalMove { .. })
        ));
    }

    #[test]
    fn illegal_indices_are_rejected() {
        let pos = Chess::default();
        // a1 rook has no legal slide at the start
        assert!(matches!(
            decode_move(&pos, 0),
            Err(ChessNetError::IllegalMoveIndex { index: 0, .. })
        ));
        assert!(matches!(
            decode_move(&pos, MOVE_SPACE as u32),
            Err(ChessNetError::IllegalMoveIndex { .. })
        ));
    }

    #[test]
    fn same_index_in_different_positions() {
        // e2e4 for white and e7e5 mirrored: the index depends only on the
        // origin square and shape, so white's index names no move for black
        let white = Chess::default();
        let e4 = parse_move(&white, "e4").unwrap();
        let after = play(&white, &e4);
        let idx = encode_move(&white, &e4).unwrap();
        assert!(decode_move(&after, idx).is_err());
        assert!(parse_move(&after, "e5").is_ok());
    }
}
