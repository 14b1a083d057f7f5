//! Out-of-order packet reassembly.
//!
//! Fragments of a message may arrive in any order, interleaved with other
//! messages and whole packets. Each in-flight message is tracked by its
//! 64-bit packet id; when the last fragment lands, the completing caller (and
//! only that caller) receives the ordered slice vector.
//!
//! The table is bounded two ways: a hard cap on simultaneous assemblies, and
//! a per-path fragment budget that evicts the path's least recently created
//! assembly before admitting more, so one abusive path cannot starve the
//! shared buffer pool. Assemblies that linger past [`FRAGMENT_TTL_MS`] are
//! purged whenever a new assembly is admitted. Each `(path, packet id)` is
//! reassembled at most once: completed ids are remembered for the fragment
//! TTL (in a set bounded like the table itself), and stragglers arriving
//! after completion are reported as duplicates rather than seeding a second
//! assembly.

use crate::buf::{Slice, SliceVector};
use crate::wire::{MAX_FRAGMENTS, MAX_PACKET_LENGTH};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use thiserror::Error;

/// Age at which an incomplete assembly becomes collectable.
pub const FRAGMENT_TTL_MS: i64 = 1000;

/// Hard cap on simultaneous assemblies across all paths.
pub const MAX_ASSEMBLIES: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefragError {
    #[error("fragment already received")]
    Duplicate,
    #[error("fragment index or total count is invalid")]
    Invalid,
    #[error("too many in-flight fragments for path")]
    TooManyFragments,
    #[error("assembly table is full")]
    OutOfMemory,
}

/// Successful outcomes of [`Defragmenter::assemble`].
#[derive(Debug)]
pub enum Assembled {
    /// Fragment recorded; the message is still incomplete.
    Pending,
    /// This fragment completed the message; slices are in index order.
    Complete(SliceVector),
}

struct Assembly<K> {
    slices: [Option<Slice>; MAX_FRAGMENTS],
    received_mask: u16,
    have: u8,
    /// Total fragment count, zero until some fragment reports it.
    total: u8,
    size: usize,
    created_at: i64,
    path: K,
}

impl<K> Assembly<K> {
    fn new(path: K, now: i64) -> Self {
        Assembly {
            slices: Default::default(),
            received_mask: 0,
            have: 0,
            total: 0,
            size: 0,
            created_at: now,
            path,
        }
    }
}

#[derive(Default)]
struct PathState {
    fragments: usize,
    // Creation order of this path's assemblies; stale ids are skipped lazily.
    order: VecDeque<u64>,
}

struct Table<K> {
    assemblies: HashMap<u64, Assembly<K>>,
    paths: HashMap<K, PathState>,
    /// Recently completed packet ids and when they finished.
    completed: HashMap<u64, i64>,
    // Insertion order of `completed`, oldest first.
    completed_order: VecDeque<u64>,
}

/// Bounded reassembly table keyed by packet id.
///
/// `K` identifies the receiving path; the dispatcher uses
/// `(local socket, remote address)`.
pub struct Defragmenter<K: Eq + Hash + Clone> {
    table: Mutex<Table<K>>,
}

impl<K: Eq + Hash + Clone> Default for Defragmenter<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> Defragmenter<K> {
    pub fn new() -> Self {
        Defragmenter {
            table: Mutex::new(Table {
                assemblies: HashMap::new(),
                paths: HashMap::new(),
                completed: HashMap::new(),
                completed_order: VecDeque::new(),
            }),
        }
    }

    /// Record one fragment of `packet_id`.
    ///
    /// `total_fragments` is zero when the carrying datagram does not know the
    /// count (the head of a fragmented packet); any fragment that does know it
    /// fills it in. The fragment's payload slice is consumed either way; on
    /// error or duplicate its buffer simply returns to the pool.
    pub fn assemble(
        &self,
        packet_id: u64,
        fragment: Slice,
        fragment_no: u8,
        total_fragments: u8,
        now: i64,
        path: K,
        per_path_cap: usize,
    ) -> Result<Assembled, DefragError> {
        if fragment_no as usize >= MAX_FRAGMENTS || total_fragments as usize > MAX_FRAGMENTS {
            return Err(DefragError::Invalid);
        }

        let mut table = self.table.lock();

        // An id that already completed is not reassembled a second time;
        // stragglers and replays of its fragments are duplicates. Only once
        // the memory of the completion ages out may the id be reused.
        match table.completed.get(&packet_id) {
            Some(&done_at) if now - done_at <= FRAGMENT_TTL_MS => {
                return Err(DefragError::Duplicate);
            }
            Some(_) => {
                table.completed.remove(&packet_id);
            }
            None => {}
        }

        // A stale assembly under the same id is abandoned, not resumed.
        if table
            .assemblies
            .get(&packet_id)
            .is_some_and(|a| now - a.created_at > FRAGMENT_TTL_MS)
        {
            Self::remove_assembly(&mut table, packet_id);
        }

        if !table.assemblies.contains_key(&packet_id) {
            Self::admit(&mut table, packet_id, &path, now, per_path_cap)?;
        }

        let step = match table.assemblies.get_mut(&packet_id) {
            Some(entry) => Self::insert_fragment(entry, fragment, fragment_no, total_fragments),
            None => return Err(DefragError::OutOfMemory),
        };

        let (complete, entry_path) = match step {
            Ok(done) => done,
            Err(DefragError::Duplicate) => return Err(DefragError::Duplicate),
            Err(err) => {
                Self::remove_assembly(&mut table, packet_id);
                return Err(err);
            }
        };

        if let Some(ps) = table.paths.get_mut(&entry_path) {
            ps.fragments += 1;
        }

        if !complete {
            return Ok(Assembled::Pending);
        }

        let mut entry = match table.assemblies.remove(&packet_id) {
            Some(entry) => entry,
            None => return Err(DefragError::OutOfMemory),
        };
        Self::release_path_entry(&mut table, &entry.path, packet_id, entry.have);
        Self::note_completed(&mut table, packet_id, now);
        drop(table);

        let mut out = SliceVector::new();
        for slot in entry.slices.iter_mut().take(entry.total as usize) {
            match slot.take() {
                Some(slice) => out.push(slice).map_err(|_| DefragError::Invalid)?,
                None => return Err(DefragError::Invalid),
            }
        }
        Ok(Assembled::Complete(out))
    }

    fn insert_fragment(
        entry: &mut Assembly<K>,
        fragment: Slice,
        fragment_no: u8,
        total_fragments: u8,
    ) -> Result<(bool, K), DefragError> {
        if total_fragments != 0 {
            if entry.total != 0 && entry.total != total_fragments {
                return Err(DefragError::Invalid);
            }
            entry.total = total_fragments;
        }
        if entry.total != 0 && fragment_no >= entry.total {
            return Err(DefragError::Invalid);
        }

        let bit = 1u16 << fragment_no;
        if entry.received_mask & bit != 0 {
            return Err(DefragError::Duplicate);
        }

        entry.size += fragment.len();
        if entry.size > MAX_PACKET_LENGTH {
            return Err(DefragError::Invalid);
        }

        entry.received_mask |= bit;
        entry.slices[fragment_no as usize] = Some(fragment);
        entry.have += 1;

        // Widened shift: a 16-fragment message needs bit 15, and 1 << 16
        // does not fit in the mask type.
        let complete =
            entry.total != 0 && u32::from(entry.received_mask) == (1u32 << entry.total) - 1;
        Ok((complete, entry.path.clone()))
    }

    /// Number of live assemblies (for tests and introspection).
    pub fn assemblies(&self) -> usize {
        self.table.lock().assemblies.len()
    }

    /// In-flight fragments currently charged to `path`.
    pub fn fragments_for(&self, path: &K) -> usize {
        self.table
            .lock()
            .paths
            .get(path)
            .map(|ps| ps.fragments)
            .unwrap_or(0)
    }

    fn admit(
        table: &mut Table<K>,
        packet_id: u64,
        path: &K,
        now: i64,
        per_path_cap: usize,
    ) -> Result<(), DefragError> {
        if table.assemblies.len() >= MAX_ASSEMBLIES {
            let expired: Vec<u64> = table
                .assemblies
                .iter()
                .filter(|(_, a)| now - a.created_at > FRAGMENT_TTL_MS)
                .map(|(&id, _)| id)
                .collect();
            for id in expired {
                Self::remove_assembly(table, id);
            }
            if table.assemblies.len() >= MAX_ASSEMBLIES {
                return Err(DefragError::OutOfMemory);
            }
        }

        let over_budget = table
            .paths
            .get(path)
            .is_some_and(|ps| ps.fragments >= per_path_cap);
        if over_budget && !Self::evict_oldest_for_path(table, path) {
            return Err(DefragError::TooManyFragments);
        }

        table
            .assemblies
            .insert(packet_id, Assembly::new(path.clone(), now));
        table
            .paths
            .entry(path.clone())
            .or_default()
            .order
            .push_back(packet_id);
        Ok(())
    }

    fn evict_oldest_for_path(table: &mut Table<K>, path: &K) -> bool {
        loop {
            let candidate = match table.paths.get_mut(path) {
                Some(ps) => ps.order.pop_front(),
                None => return false,
            };
            let id = match candidate {
                Some(id) => id,
                None => return false,
            };
            // Completed or already-evicted ids linger in the order queue.
            if table.assemblies.get(&id).is_some_and(|a| &a.path == path) {
                Self::remove_assembly(table, id);
                return true;
            }
        }
    }

    fn remove_assembly(table: &mut Table<K>, packet_id: u64) {
        if let Some(entry) = table.assemblies.remove(&packet_id) {
            Self::release_path_entry(table, &entry.path, packet_id, entry.have);
        }
    }

    /// Return an assembly's fragments to its path budget and drop the id
    /// from the path's creation-order queue. A path with nothing in flight
    /// is forgotten entirely.
    fn release_path_entry(table: &mut Table<K>, path: &K, packet_id: u64, have: u8) {
        let mut drop_path = false;
        if let Some(ps) = table.paths.get_mut(path) {
            ps.fragments = ps.fragments.saturating_sub(have as usize);
            if let Some(pos) = ps.order.iter().position(|&id| id == packet_id) {
                ps.order.remove(pos);
            }
            drop_path = ps.fragments == 0 && ps.order.is_empty();
        }
        if drop_path {
            table.paths.remove(path);
        }
    }

    /// Remember a finished id so stragglers read as duplicates. The memory
    /// holds at most [`MAX_ASSEMBLIES`] entries and ages out with
    /// [`FRAGMENT_TTL_MS`].
    fn note_completed(table: &mut Table<K>, packet_id: u64, now: i64) {
        while let Some(&oldest) = table.completed_order.front() {
            let expired = table
                .completed
                .get(&oldest)
                .map_or(true, |&done_at| now - done_at > FRAGMENT_TTL_MS);
            if expired || table.completed.len() >= MAX_ASSEMBLIES {
                table.completed_order.pop_front();
                table.completed.remove(&oldest);
            } else {
                break;
            }
        }
        table.completed.insert(packet_id, now);
        table.completed_order.push_back(packet_id);
    }

    #[cfg(test)]
    fn order_len_for(&self, path: &K) -> usize {
        self.table
            .lock()
            .paths
            .get(path)
            .map(|ps| ps.order.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufPool;
    use crate::wire::MAX_INCOMING_FRAGMENTS_PER_PATH;

    fn fragment(pool: &BufPool, fill: u8, len: usize) -> Slice {
        let mut buf = pool.get().expect("pool buffer");
        buf.bytes_mut()[..len].fill(fill);
        Slice::new(buf, 0, len).expect("slice")
    }

    fn concatenated(v: &SliceVector) -> Vec<u8> {
        let mut out = Vec::new();
        for s in v.iter() {
            out.extend_from_slice(s.data());
        }
        out
    }

    #[test]
    fn completes_in_any_permutation() {
        let pool = BufPool::new(64);
        // Deliver fragments of a three-part message in every order.
        let permutations: [[u8; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for (run, order) in permutations.iter().enumerate() {
            let defrag: Defragmenter<u8> = Defragmenter::new();
            let id = 100 + run as u64;
            let mut complete = None;
            for (step, &no) in order.iter().enumerate() {
                let total = if no == 0 { 0 } else { 3 };
                let result = defrag
                    .assemble(id, fragment(&pool, no, 10), no, total, 0, 1, 32)
                    .expect("assemble");
                match result {
                    Assembled::Complete(v) => {
                        assert_eq!(step, order.len() - 1, "completed early in {order:?}");
                        complete = Some(v);
                    }
                    Assembled::Pending => assert!(step < order.len() - 1),
                }
            }
            let v = complete.expect("message completed");
            let mut expected = Vec::new();
            for no in 0u8..3 {
                expected.extend_from_slice(&[no; 10]);
            }
            assert_eq!(concatenated(&v), expected);
            assert_eq!(defrag.assemblies(), 0);
        }
    }

    #[test]
    fn sixteen_fragment_message_completes() {
        let pool = BufPool::new(32);
        let defrag: Defragmenter<u8> = Defragmenter::new();
        let total = MAX_FRAGMENTS as u8;
        for no in 0..total - 1 {
            let result = defrag
                .assemble(42, fragment(&pool, no, 5), no, total, 0, 1, 32)
                .expect("assemble");
            assert!(matches!(result, Assembled::Pending));
        }
        let result = defrag
            .assemble(42, fragment(&pool, total - 1, 5), total - 1, total, 0, 1, 32)
            .expect("assemble");
        match result {
            Assembled::Complete(v) => assert_eq!(v.len(), MAX_FRAGMENTS),
            Assembled::Pending => panic!("final fragment should complete"),
        }
    }

    #[test]
    fn duplicate_fragments_are_rejected() {
        let pool = BufPool::new(64);
        let defrag: Defragmenter<u8> = Defragmenter::new();
        defrag
            .assemble(7, fragment(&pool, 1, 8), 1, 3, 0, 1, 32)
            .expect("first");
        let err = defrag
            .assemble(7, fragment(&pool, 1, 8), 1, 3, 0, 1, 32)
            .expect_err("duplicate");
        assert_eq!(err, DefragError::Duplicate);
    }

    #[test]
    fn completed_id_rejects_stragglers() {
        let pool = BufPool::new(16);
        let defrag: Defragmenter<u8> = Defragmenter::new();
        for no in 0..2u8 {
            defrag
                .assemble(88, fragment(&pool, no, 6), no, 3, 0, 1, 32)
                .expect("assemble");
        }
        let done = defrag
            .assemble(88, fragment(&pool, 2, 6), 2, 3, 0, 1, 32)
            .expect("assemble");
        assert!(matches!(done, Assembled::Complete(_)));

        // Redelivering any fragment after completion must not seed a second
        // assembly under the same id.
        for no in 0..3u8 {
            let err = defrag
                .assemble(88, fragment(&pool, no, 6), no, 3, 1, 1, 32)
                .expect_err("straggler");
            assert_eq!(err, DefragError::Duplicate, "fragment {no}");
        }
        assert_eq!(defrag.assemblies(), 0);

        // Once the memory of the completion expires the id may be reused.
        let reused = defrag
            .assemble(88, fragment(&pool, 0, 6), 0, 0, FRAGMENT_TTL_MS + 2, 1, 32)
            .expect("reuse after expiry");
        assert!(matches!(reused, Assembled::Pending));
    }

    #[test]
    fn completion_releases_path_bookkeeping() {
        let pool = BufPool::new(16);
        let defrag: Defragmenter<u8> = Defragmenter::new();
        // A path that always completes within its budget must never trip
        // eviction or a budget error, no matter how long it runs.
        for i in 0..(MAX_INCOMING_FRAGMENTS_PER_PATH as u64 * 4) {
            let id = 7000 + i;
            defrag
                .assemble(id, fragment(&pool, 0, 4), 0, 2, 0, 1, MAX_INCOMING_FRAGMENTS_PER_PATH)
                .expect("head");
            let done = defrag
                .assemble(id, fragment(&pool, 1, 4), 1, 2, 0, 1, MAX_INCOMING_FRAGMENTS_PER_PATH)
                .expect("tail");
            assert!(matches!(done, Assembled::Complete(_)));
        }
        assert_eq!(defrag.assemblies(), 0);
        assert_eq!(defrag.fragments_for(&1), 0);
        assert_eq!(defrag.order_len_for(&1), 0);
    }

    #[test]
    fn invalid_index_or_total_is_rejected() {
        let pool = BufPool::new(64);
        let defrag: Defragmenter<u8> = Defragmenter::new();
        assert_eq!(
            defrag
                .assemble(1, fragment(&pool, 0, 8), 16, 0, 0, 1, 32)
                .expect_err("index out of range"),
            DefragError::Invalid
        );
        defrag
            .assemble(2, fragment(&pool, 0, 8), 1, 3, 0, 1, 32)
            .expect("fragment");
        assert_eq!(
            defrag
                .assemble(2, fragment(&pool, 0, 8), 2, 4, 0, 1, 32)
                .expect_err("conflicting totals"),
            DefragError::Invalid
        );
    }

    #[test]
    fn per_path_budget_evicts_oldest() {
        let pool = BufPool::new(MAX_INCOMING_FRAGMENTS_PER_PATH * 2 + 8);
        let defrag: Defragmenter<u8> = Defragmenter::new();
        for id in 0..MAX_INCOMING_FRAGMENTS_PER_PATH as u64 {
            defrag
                .assemble(
                    id,
                    fragment(&pool, 0, 4),
                    1,
                    3,
                    0,
                    1,
                    MAX_INCOMING_FRAGMENTS_PER_PATH,
                )
                .expect("admit");
        }
        assert_eq!(
            defrag.fragments_for(&1),
            MAX_INCOMING_FRAGMENTS_PER_PATH
        );

        // One more admission evicts the oldest assembly rather than growing.
        defrag
            .assemble(
                999,
                fragment(&pool, 0, 4),
                1,
                3,
                0,
                1,
                MAX_INCOMING_FRAGMENTS_PER_PATH,
            )
            .expect("eviction admits");
        assert_eq!(
            defrag.fragments_for(&1),
            MAX_INCOMING_FRAGMENTS_PER_PATH
        );
        assert!(defrag.assemblies() <= MAX_INCOMING_FRAGMENTS_PER_PATH);

        // A different path is unaffected by the first path's pressure.
        defrag
            .assemble(
                5000,
                fragment(&pool, 0, 4),
                1,
                3,
                0,
                2,
                MAX_INCOMING_FRAGMENTS_PER_PATH,
            )
            .expect("other path admits");
        assert_eq!(defrag.fragments_for(&2), 1);
    }

    #[test]
    fn stale_assembly_is_replaced() {
        let pool = BufPool::new(8);
        let defrag: Defragmenter<u8> = Defragmenter::new();
        defrag
            .assemble(9, fragment(&pool, 0, 4), 0, 0, 0, 1, 32)
            .expect("head");
        // Same id long after the TTL: treated as a new message, so the same
        // fragment index is not a duplicate.
        let result = defrag.assemble(
            9,
            fragment(&pool, 0, 4),
            0,
            0,
            FRAGMENT_TTL_MS + 1,
            1,
            32,
        );
        assert!(matches!(result, Ok(Assembled::Pending)));
        assert_eq!(defrag.assemblies(), 1);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let pool = BufPool::new(8);
        let defrag: Defragmenter<u8> = Defragmenter::new();
        defrag
            .assemble(3, fragment(&pool, 0, MAX_PACKET_LENGTH), 0, 0, 0, 1, 32)
            .expect("head fits");
        assert_eq!(
            defrag
                .assemble(3, fragment(&pool, 0, 64), 1, 2, 0, 1, 32)
                .expect_err("sum too large"),
            DefragError::Invalid
        );
        assert_eq!(defrag.assemblies(), 0);
    }
}
