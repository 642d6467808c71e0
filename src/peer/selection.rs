//! Piece selection
//!
//! Given our bitfield and a neighbour's, pick which piece to request
//! next. Selection is uniformly random over the candidates rather than
//! rarest-first; randomization spreads early demand across pieces when
//! every peer is missing almost everything.

use rand::Rng;
use tracing::trace;

use crate::peer::Bitfield;

/// Pieces the neighbour has that we lack and have not already requested
///
/// Computed as `(mine XOR theirs) AND theirs, AND-NOT in-flight`. The
/// XOR/AND composition restricts the symmetric difference to their side;
/// in-flight pieces are excluded by the separate AND-NOT.
pub fn candidate_pieces(mine: &Bitfield, theirs: &Bitfield, in_flight: &Bitfield) -> Bitfield {
    mine.xor(theirs).and(theirs).and_not(in_flight)
}

/// Decide whether the neighbour's bitfield makes us interested
///
/// True iff they have at least one piece we lack, ignoring in-flight
/// tracking: an in-flight piece is still missing until it completes.
pub fn is_interesting(mine: &Bitfield, theirs: &Bitfield) -> bool {
    !mine.xor(theirs).and(theirs).is_empty()
}

/// Pick one candidate piece uniformly at random
///
/// Returns None when no candidate exists; never blocks.
pub fn select_piece(mine: &Bitfield, theirs: &Bitfield, in_flight: &Bitfield) -> Option<u32> {
    let candidates: Vec<usize> = candidate_pieces(mine, theirs, in_flight).set_indices().collect();
    if candidates.is_empty() {
        return None;
    }
    let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
    trace!("Selected piece {} from {} candidates", pick, candidates.len());
    Some(pick as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bf(bytes: &[u8], num_pieces: usize) -> Bitfield {
        Bitfield::from_bytes(bytes, num_pieces).unwrap()
    }

    #[test]
    fn test_candidates_are_their_exclusive_pieces() {
        // self 0000, neighbour 1010 -> candidates {0, 2}
        let mine = bf(&[0b0000_0000], 4);
        let theirs = bf(&[0b1010_0000], 4);
        let candidates = candidate_pieces(&mine, &theirs, &Bitfield::new(4));
        assert_eq!(candidates.set_indices().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_candidates_exclude_in_flight() {
        let mine = bf(&[0b0000_0000], 4);
        let theirs = bf(&[0b1010_0000], 4);
        let in_flight = bf(&[0b1000_0000], 4);
        let candidates = candidate_pieces(&mine, &theirs, &in_flight);
        assert_eq!(candidates.set_indices().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_candidates_exclude_owned_pieces() {
        // Pieces we both have fall out of the XOR
        let mine = bf(&[0b1010_0000], 4);
        let theirs = bf(&[0b1010_0000], 4);
        let candidates = candidate_pieces(&mine, &theirs, &Bitfield::new(4));
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_interest_decision() {
        let mine = bf(&[0b0000_0000], 4);
        let theirs = bf(&[0b1010_0000], 4);
        assert!(is_interesting(&mine, &theirs));

        let mine = bf(&[0b1111_0000], 4);
        assert!(!is_interesting(&mine, &theirs));
    }

    #[test]
    fn test_interest_ignores_pieces_only_we_have() {
        // They lack pieces we have; that is their problem, not our interest
        let mine = bf(&[0b1111_0000], 4);
        let theirs = bf(&[0b0011_0000], 4);
        assert!(!is_interesting(&mine, &theirs));
    }

    #[test]
    fn test_select_returns_only_valid_candidates() {
        let mine = bf(&[0b0000_0000], 4);
        let theirs = bf(&[0b1010_0000], 4);
        let in_flight = Bitfield::new(4);
        for _ in 0..50 {
            let pick = select_piece(&mine, &theirs, &in_flight).unwrap();
            assert!(pick == 0 || pick == 2);
        }
    }

    #[test]
    fn test_select_with_no_candidates() {
        let mine = bf(&[0b1010_0000], 4);
        let theirs = bf(&[0b1010_0000], 4);
        assert!(select_piece(&mine, &theirs, &Bitfield::new(4)).is_none());
    }

    #[test]
    fn test_select_never_returns_owned_or_in_flight() {
        let mine = bf(&[0b1000_0000], 4);
        let theirs = bf(&[0b1110_0000], 4);
        let in_flight = bf(&[0b0100_0000], 4);
        for _ in 0..50 {
            let pick = select_piece(&mine, &theirs, &in_flight).unwrap();
            assert_eq!(pick, 2);
        }
    }

    #[test]
    fn test_select_eventually_covers_all_candidates() {
        let mine = bf(&[0b0000_0000], 8);
        let theirs = bf(&[0b1010_1010], 8);
        let in_flight = Bitfield::new(8);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(select_piece(&mine, &theirs, &in_flight).unwrap());
        }
        assert_eq!(seen.len(), 4);
    }
}
