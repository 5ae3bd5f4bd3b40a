//! # Piece Scheduler
//!
//! Owns the piece table: which blocks to request from which peer, which
//! blocks have arrived, and whether a completed piece survives its digest
//! check.
//!
//! ## Selection Rule
//!
//! Candidates are wanted pieces the peer holds that still have an open block
//! slot (absent, or requested so long ago the request is reclaimed). While
//! fewer than four pieces are complete the scheduler picks a random
//! candidate so the client quickly owns something to reciprocate with; after
//! that it picks the candidate held by the fewest connected peers
//! (rarest first), breaking ties by lowest index. Within a piece, the
//! lowest-offset open slot is handed out.
//!
//! ## Atomicity
//!
//! The scheduler performs no I/O and is driven under a single mutex; every
//! method is one atomic state transition. Verified piece bytes are returned
//! to the caller, which writes them out after releasing the lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};

use crate::metainfo::Metainfo;
use crate::peer::{Bitfield, PeerKey};

/// Request granularity: every block but a piece's last has this length.
pub const BLOCK_SIZE: u32 = 16384;

/// In-flight requests older than this are reclaimed for other peers.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pieces complete before rarest-first selection takes over.
const RANDOM_FIRST_THRESHOLD: u32 = 4;

/// Lifecycle of one piece: Missing → InFlight → {Have, Corrupt}, and
/// Corrupt reverts to Missing with every block slot cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    InFlight,
    Have,
    /// Digest check failed; reverts to `Missing` via [`Piece::reset`].
    Corrupt,
}

#[derive(Debug)]
enum BlockSlot {
    Absent,
    Requested { peer: PeerKey, issued_at: Instant },
    Present(Vec<u8>),
}

struct Piece {
    state: PieceState,
    /// One slot per block; empty once the piece reaches `Have`.
    blocks: Vec<BlockSlot>,
    present: u32,
}

impl Piece {
    fn new(length: u32) -> Piece {
        let num_blocks = length.div_ceil(BLOCK_SIZE) as usize;
        Piece {
            state: PieceState::Missing,
            blocks: (0..num_blocks).map(|_| BlockSlot::Absent).collect(),
            present: 0,
        }
    }

    /// The Corrupt → Missing transition: clear every slot so the piece can
    /// be fetched again from scratch.
    fn reset(&mut self) {
        debug_assert_eq!(self.state, PieceState::Corrupt);
        self.state = PieceState::Missing;
        self.present = 0;
        for slot in &mut self.blocks {
            *slot = BlockSlot::Absent;
        }
    }
}

/// One block to request from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Outcome of delivering a block.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Stored; the piece is still incomplete.
    Accepted,
    /// The block completed its piece and the digest matched. The caller
    /// writes `data` at `offset` and broadcasts `have(index)`.
    Verified {
        index: u32,
        offset: u64,
        data: Vec<u8>,
    },
    /// The block completed its piece but the digest failed; the piece was
    /// reset to missing and its bytes discarded.
    Corrupt { index: u32 },
    /// The slot already holds these bytes.
    Duplicate,
    /// No matching outstanding request; dropped.
    Rejected,
}

/// Aggregate transfer counters for the progress line and final summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {
    pub downloaded_bytes: u64,
    pub wasted_bytes: u64,
    pub verification_failures: u64,
}

/// The piece table plus availability bookkeeping.
pub struct Scheduler {
    meta: Arc<Metainfo>,
    pieces: Vec<Piece>,
    /// Pieces `0..wanted` are required for completion (`max-pieces` mode).
    wanted: u32,
    /// Per piece, how many connected peers advertise it.
    availability: Vec<u32>,
    have_count: u32,
    request_timeout: Duration,
    stats: TransferStats,
}

impl Scheduler {
    pub fn new(meta: Arc<Metainfo>, max_pieces: Option<u32>) -> Scheduler {
        let total = meta.num_pieces();
        let wanted = max_pieces.map_or(total, |n| n.min(total)).max(1);
        let pieces = (0..total).map(|i| Piece::new(meta.piece_len(i))).collect();

        Scheduler {
            pieces,
            wanted,
            availability: vec![0; total as usize],
            have_count: 0,
            request_timeout: REQUEST_TIMEOUT,
            stats: TransferStats::default(),
            meta,
        }
    }

    /// Shrink the reclaim window; test hook for the stalled-peer path.
    #[cfg(test)]
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    pub fn is_complete(&self) -> bool {
        self.pieces[..self.wanted as usize]
            .iter()
            .all(|p| p.state == PieceState::Have)
    }

    pub fn wanted_pieces(&self) -> u32 {
        self.wanted
    }

    pub fn have_count(&self) -> u32 {
        self.have_count
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn bytes_left(&self) -> u64 {
        self.pieces[..self.wanted as usize]
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state != PieceState::Have)
            .map(|(i, _)| self.meta.piece_len(i as u32) as u64)
            .sum()
    }

    /// Our own advertised bitfield, derived from completed pieces.
    pub fn have_bitfield(&self) -> Bitfield {
        let mut field = Bitfield::new(self.meta.num_pieces());
        for (index, piece) in self.pieces.iter().enumerate() {
            if piece.state == PieceState::Have {
                field.set(index as u32);
            }
        }
        field
    }

    /// Whether the peer advertises any piece we still need.
    pub fn peer_is_useful(&self, bitfield: &Bitfield) -> bool {
        self.pieces[..self.wanted as usize]
            .iter()
            .enumerate()
            .any(|(i, p)| p.state != PieceState::Have && bitfield.has(i as u32))
    }

    /// Fold a newly advertised bitfield into the availability map.
    pub fn peer_joined(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            self.availability[index as usize] += 1;
        }
    }

    /// A peer announced one more piece via `have`.
    pub fn peer_has(&mut self, index: u32) {
        if let Some(count) = self.availability.get_mut(index as usize) {
            *count += 1;
        }
    }

    /// Remove a departing peer's bitfield from the availability map and
    /// restore its in-flight slots.
    pub fn peer_left(&mut self, peer: PeerKey, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            let count = &mut self.availability[index as usize];
            *count = count.saturating_sub(1);
        }
        self.release_requests(peer);
    }

    /// Restore every slot requested by `peer` to absent.
    pub fn release_requests(&mut self, peer: PeerKey) {
        for piece in &mut self.pieces {
            if piece.state != PieceState::InFlight {
                continue;
            }
            for slot in &mut piece.blocks {
                if matches!(slot, BlockSlot::Requested { peer: p, .. } if *p == peer) {
                    *slot = BlockSlot::Absent;
                }
            }
            if piece.present == 0
                && piece
                    .blocks
                    .iter()
                    .all(|slot| matches!(slot, BlockSlot::Absent))
            {
                piece.state = PieceState::Missing;
            }
        }
    }

    /// Restore one specific requested slot (cancelled by its own session).
    pub fn release_block(&mut self, peer: PeerKey, index: u32, begin: u32) {
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            return;
        };
        let slot_index = (begin / BLOCK_SIZE) as usize;
        if let Some(slot) = piece.blocks.get_mut(slot_index) {
            if matches!(slot, BlockSlot::Requested { peer: p, .. } if *p == peer) {
                *slot = BlockSlot::Absent;
            }
        }
    }

    /// Pick the next block `peer` should request, or `None` if the peer has
    /// nothing we can use right now.
    pub fn next_request(
        &mut self,
        peer: PeerKey,
        bitfield: &Bitfield,
        now: Instant,
    ) -> Option<BlockRequest> {
        let index = self.select_piece(bitfield, now)?;
        let piece = &mut self.pieces[index as usize];

        let slot_index = piece.blocks.iter().position(|slot| match slot {
            BlockSlot::Absent => true,
            BlockSlot::Requested { issued_at, .. } => {
                now.duration_since(*issued_at) > self.request_timeout
            }
            BlockSlot::Present(_) => false,
        })?;

        piece.blocks[slot_index] = BlockSlot::Requested {
            peer,
            issued_at: now,
        };
        if piece.state == PieceState::Missing {
            piece.state = PieceState::InFlight;
        }

        let begin = slot_index as u32 * BLOCK_SIZE;
        let length = BLOCK_SIZE.min(self.meta.piece_len(index) - begin);
        Some(BlockRequest { index, begin, length })
    }

    fn select_piece(&self, bitfield: &Bitfield, now: Instant) -> Option<u32> {
        let candidates: Vec<u32> = (0..self.wanted)
            .filter(|&i| {
                let piece = &self.pieces[i as usize];
                piece.state != PieceState::Have
                    && bitfield.has(i)
                    && piece.blocks.iter().any(|slot| match slot {
                        BlockSlot::Absent => true,
                        BlockSlot::Requested { issued_at, .. } => {
                            now.duration_since(*issued_at) > self.request_timeout
                        }
                        BlockSlot::Present(_) => false,
                    })
            })
            .collect();

        if candidates.is_empty() {
            return None;
        }

        if self.have_count < RANDOM_FIRST_THRESHOLD {
            return candidates.choose(&mut rand::thread_rng()).copied();
        }

        // rarest first, ties to the lowest index
        candidates
            .into_iter()
            .min_by_key(|&i| (self.availability[i as usize], i))
    }

    /// Deliver a block received from `peer`.
    pub fn deliver(&mut self, peer: PeerKey, index: u32, begin: u32, bytes: Vec<u8>) -> Delivery {
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            self.stats.wasted_bytes += bytes.len() as u64;
            return Delivery::Rejected;
        };

        if begin % BLOCK_SIZE != 0 || (begin / BLOCK_SIZE) as usize >= piece.blocks.len() {
            self.stats.wasted_bytes += bytes.len() as u64;
            return Delivery::Rejected;
        }
        let slot_index = (begin / BLOCK_SIZE) as usize;

        let expected_len = BLOCK_SIZE.min(self.meta.piece_len(index) - begin) as usize;
        match &piece.blocks[slot_index] {
            BlockSlot::Present(_) => {
                self.stats.wasted_bytes += bytes.len() as u64;
                return Delivery::Duplicate;
            }
            BlockSlot::Requested { peer: p, .. } if *p == peer => {
                if bytes.len() != expected_len {
                    self.stats.wasted_bytes += bytes.len() as u64;
                    return Delivery::Rejected;
                }
            }
            _ => {
                self.stats.wasted_bytes += bytes.len() as u64;
                return Delivery::Rejected;
            }
        }

        self.stats.downloaded_bytes += bytes.len() as u64;
        piece.blocks[slot_index] = BlockSlot::Present(bytes);
        piece.present += 1;

        if piece.present < piece.blocks.len() as u32 {
            return Delivery::Accepted;
        }

        // all blocks present: verify against the published digest
        let mut hasher = Sha1::new();
        for slot in &piece.blocks {
            if let BlockSlot::Present(data) = slot {
                hasher.update(data);
            }
        }
        let digest: [u8; 20] = hasher.finalize().into();

        if &digest != self.meta.piece_hash(index) {
            warn!("piece {index} failed verification, resetting");
            self.stats.wasted_bytes += self.meta.piece_len(index) as u64;
            self.stats.verification_failures += 1;
            piece.state = PieceState::Corrupt;
            piece.reset();
            return Delivery::Corrupt { index };
        }

        let mut data = Vec::with_capacity(self.meta.piece_len(index) as usize);
        for slot in std::mem::take(&mut piece.blocks) {
            if let BlockSlot::Present(block) = slot {
                data.extend_from_slice(&block);
            }
        }
        piece.state = PieceState::Have;
        self.have_count += 1;

        info!(
            "piece {index} verified ({}/{} complete)",
            self.have_count, self.wanted
        );

        Delivery::Verified {
            index,
            offset: self.meta.piece_offset(index),
            data,
        }
    }

    /// Count of slots currently requested by `peer`; test observation point.
    #[cfg(test)]
    pub fn requested_by(&self, peer: PeerKey) -> usize {
        self.pieces
            .iter()
            .flat_map(|piece| piece.blocks.iter())
            .filter(|slot| matches!(slot, BlockSlot::Requested { peer: p, .. } if *p == peer))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Metainfo;

    /// Single-file descriptor with real digests over `content`, piece length
    /// `piece_length`.
    fn build_meta(content: &[u8], piece_length: usize) -> (Arc<Metainfo>, Vec<Vec<u8>>) {
        let pieces: Vec<Vec<u8>> = content.chunks(piece_length).map(|c| c.to_vec()).collect();
        let mut hashes = Vec::new();
        for piece in &pieces {
            let mut hasher = Sha1::new();
            hasher.update(piece);
            let digest: [u8; 20] = hasher.finalize().into();
            hashes.extend_from_slice(&digest);
        }

        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce16:http://tracker/a4:infod");
        data.extend_from_slice(format!("6:lengthi{}e", content.len()).as_bytes());
        data.extend_from_slice(b"4:name4:test");
        data.extend_from_slice(format!("12:piece lengthi{piece_length}e").as_bytes());
        data.extend_from_slice(format!("6:pieces{}:", hashes.len()).as_bytes());
        data.extend_from_slice(&hashes);
        data.extend_from_slice(b"ee");

        (Arc::new(Metainfo::from_bytes(&data).unwrap()), pieces)
    }

    fn full_bitfield(num_pieces: u32) -> Bitfield {
        let mut field = Bitfield::new(num_pieces);
        for i in 0..num_pieces {
            field.set(i);
        }
        field
    }

    /// 40000 bytes at 32768: piece 0 has blocks 16384+16384, piece 1 a short
    /// 7232 block.
    fn two_piece_fixture() -> (Arc<Metainfo>, Vec<Vec<u8>>) {
        let content: Vec<u8> = (0..40000u32).map(|i| (i % 241) as u8).collect();
        build_meta(&content, 32768)
    }

    #[test]
    fn hands_out_lowest_offset_slot_first() {
        let (meta, _) = two_piece_fixture();
        let mut sched = Scheduler::new(meta, None);
        let field = full_bitfield(2);
        let now = Instant::now();

        let first = sched.next_request(0, &field, now).unwrap();
        assert_eq!(first.begin, 0);
        assert_eq!(first.length, BLOCK_SIZE);

        let second = sched.next_request(0, &field, now).unwrap();
        assert_eq!(second.index, first.index);
        assert!(second.begin == BLOCK_SIZE || second.length < BLOCK_SIZE);
    }

    #[test]
    fn never_double_assigns_a_block_slot() {
        let (meta, _) = two_piece_fixture();
        let mut sched = Scheduler::new(meta, None);
        let field = full_bitfield(2);
        let now = Instant::now();

        let mut seen = std::collections::HashSet::new();
        for peer in 0..4 {
            while let Some(req) = sched.next_request(peer, &field, now) {
                assert!(seen.insert((req.index, req.begin)), "slot handed out twice");
            }
        }
        // 2 + 1 block slots in total
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn accepts_blocks_and_verifies_piece() {
        let (meta, pieces) = two_piece_fixture();
        let mut sched = Scheduler::new(meta, None);
        let field = full_bitfield(2);
        let now = Instant::now();

        let mut verified = Vec::new();
        while let Some(req) = sched.next_request(7, &field, now) {
            let bytes =
                pieces[req.index as usize][req.begin as usize..(req.begin + req.length) as usize].to_vec();
            match sched.deliver(7, req.index, req.begin, bytes) {
                Delivery::Accepted => {}
                Delivery::Verified { index, offset, data } => {
                    assert_eq!(offset, index as u64 * 32768);
                    assert_eq!(data, pieces[index as usize]);
                    verified.push(index);
                }
                other => panic!("unexpected delivery outcome {other:?}"),
            }
        }

        assert_eq!(verified.len(), 2);
        assert!(sched.is_complete());
        assert_eq!(sched.stats().downloaded_bytes, 40000);
        assert_eq!(sched.stats().wasted_bytes, 0);
    }

    #[test]
    fn corrupt_piece_resets_to_missing_and_is_redownloadable() {
        let (meta, pieces) = two_piece_fixture();
        let mut sched = Scheduler::new(meta, None);
        let mut field = Bitfield::new(2);
        field.set(1); // single-block piece
        let now = Instant::now();

        let req = sched.next_request(0, &field, now).unwrap();
        let mut bad = pieces[1].clone();
        bad[100] ^= 0xff;
        assert_eq!(
            sched.deliver(0, req.index, req.begin, bad),
            Delivery::Corrupt { index: 1 }
        );
        assert_eq!(sched.stats().verification_failures, 1);
        assert!(!sched.is_complete());

        // the piece is requestable again and verifies with good bytes
        let req = sched.next_request(0, &field, now).unwrap();
        assert_eq!(req.index, 1);
        assert!(matches!(
            sched.deliver(0, req.index, req.begin, pieces[1].clone()),
            Delivery::Verified { index: 1, .. }
        ));
    }

    #[test]
    fn rejects_unrequested_and_duplicate_blocks() {
        let (meta, pieces) = two_piece_fixture();
        let mut sched = Scheduler::new(meta, None);
        let field = full_bitfield(2);
        let now = Instant::now();

        // nothing requested yet
        assert_eq!(
            sched.deliver(0, 0, 0, vec![0; BLOCK_SIZE as usize]),
            Delivery::Rejected
        );

        let req = sched.next_request(3, &field, now).unwrap();
        let good = pieces[req.index as usize]
            [req.begin as usize..(req.begin + req.length) as usize]
            .to_vec();

        // wrong peer
        assert_eq!(
            sched.deliver(4, req.index, req.begin, good.clone()),
            Delivery::Rejected
        );
        // wrong length
        assert_eq!(
            sched.deliver(3, req.index, req.begin, good[..10].to_vec()),
            Delivery::Rejected
        );

        assert_eq!(sched.deliver(3, req.index, req.begin, good.clone()), Delivery::Accepted);
        assert_eq!(sched.deliver(3, req.index, req.begin, good), Delivery::Duplicate);
        assert!(sched.stats().wasted_bytes > 0);
    }

    #[test]
    fn stale_requests_are_reclaimed_for_other_peers() {
        let (meta, _) = two_piece_fixture();
        let mut sched = Scheduler::new(meta, None);
        sched.set_request_timeout(Duration::from_secs(5));
        let field = full_bitfield(2);
        let start = Instant::now();

        // peer 0 claims every slot, then stalls
        while sched.next_request(0, &field, start).is_some() {}
        assert_eq!(sched.requested_by(0), 3);
        assert!(sched.next_request(1, &field, start).is_none());

        // after the timeout the slots are claimable by peer 1
        let later = start + Duration::from_secs(6);
        let req = sched.next_request(1, &field, later).unwrap();
        assert_eq!(req.begin % BLOCK_SIZE, 0);
        assert_eq!(sched.requested_by(1), 1);
    }

    #[test]
    fn release_requests_restores_slots() {
        let (meta, _) = two_piece_fixture();
        let mut sched = Scheduler::new(meta, None);
        let field = full_bitfield(2);
        let now = Instant::now();

        while sched.next_request(5, &field, now).is_some() {}
        assert_eq!(sched.requested_by(5), 3);

        sched.release_requests(5);
        assert_eq!(sched.requested_by(5), 0);
        // slots immediately available again
        assert!(sched.next_request(6, &field, now).is_some());
    }

    #[test]
    fn rarest_piece_wins_after_random_first_phase() {
        // 8 pieces of one block each
        let content: Vec<u8> = (0..8 * 1024u32).map(|i| (i % 7) as u8).collect();
        let (meta, pieces) = build_meta(&content, 1024);
        let mut sched = Scheduler::new(meta, None);
        let field = full_bitfield(8);
        let now = Instant::now();

        // complete pieces 0-3 to leave the random-first phase
        for index in 0..4u32 {
            let mut one = Bitfield::new(8);
            one.set(index);
            let req = sched.next_request(0, &one, now).unwrap();
            assert!(matches!(
                sched.deliver(0, req.index, req.begin, pieces[index as usize].clone()),
                Delivery::Verified { .. }
            ));
        }

        // piece 6 is the rarest remaining, piece 5 the most common
        sched.peer_has(4);
        sched.peer_has(4);
        sched.peer_has(5);
        sched.peer_has(5);
        sched.peer_has(5);
        sched.peer_has(6);
        sched.peer_has(7);
        sched.peer_has(7);

        let req = sched.next_request(1, &field, now).unwrap();
        assert_eq!(req.index, 6);
    }

    #[test]
    fn ties_break_toward_the_lowest_index() {
        let content: Vec<u8> = (0..8 * 1024u32).map(|i| (i % 7) as u8).collect();
        let (meta, pieces) = build_meta(&content, 1024);
        let mut sched = Scheduler::new(meta, None);
        let field = full_bitfield(8);
        let now = Instant::now();

        for index in 0..4u32 {
            let mut one = Bitfield::new(8);
            one.set(index);
            let req = sched.next_request(0, &one, now).unwrap();
            sched.deliver(0, req.index, req.begin, pieces[index as usize].clone());
        }

        // equal availability everywhere: expect piece 4
        let req = sched.next_request(1, &field, now).unwrap();
        assert_eq!(req.index, 4);
    }

    #[test]
    fn max_pieces_bounds_completion() {
        let (meta, pieces) = two_piece_fixture();
        let mut sched = Scheduler::new(meta, Some(1));
        let field = full_bitfield(2);
        let now = Instant::now();

        assert_eq!(sched.wanted_pieces(), 1);
        let mut done = false;
        while let Some(req) = sched.next_request(0, &field, now) {
            assert_eq!(req.index, 0, "must not request past the wanted range");
            let bytes = pieces[0][req.begin as usize..(req.begin + req.length) as usize].to_vec();
            if matches!(sched.deliver(0, 0, req.begin, bytes), Delivery::Verified { .. }) {
                done = true;
            }
        }
        assert!(done);
        assert!(sched.is_complete());
    }

    #[test]
    fn availability_tracks_joins_and_leaves() {
        let (meta, _) = two_piece_fixture();
        let mut sched = Scheduler::new(meta, None);
        let field = full_bitfield(2);

        sched.peer_joined(&field);
        sched.peer_joined(&field);
        assert_eq!(sched.availability, vec![2, 2]);

        sched.peer_left(0, &field);
        assert_eq!(sched.availability, vec![1, 1]);
    }
}
