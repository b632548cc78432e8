use std::collections::{HashMap, VecDeque};

use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::chunk::chunk_selective_ack::GapAckBlock;
use crate::util::*;

/// DATA chunks keyed by TSN, with the TSNs kept in serial number order.
///
/// The sender keeps its in-flight chunks here until they are cumulatively
/// acked; the receiver keeps the chunks that arrived above its cumulative
/// TSN so it can report gap ack blocks and duplicates.
#[derive(Default, Debug)]
pub(crate) struct PayloadQueue {
    pub(crate) chunk_map: HashMap<u32, ChunkPayloadData>,
    pub(crate) sorted: VecDeque<u32>,
    pub(crate) dup_tsn: Vec<u32>,
    pub(crate) n_bytes: usize,
}

impl PayloadQueue {
    pub(crate) fn new() -> Self {
        PayloadQueue::default()
    }

    pub(crate) fn can_push(&self, p: &ChunkPayloadData, cumulative_tsn: u32) -> bool {
        !(self.chunk_map.contains_key(&p.tsn) || sna32lte(p.tsn, cumulative_tsn))
    }

    pub(crate) fn push_no_check(&mut self, p: ChunkPayloadData) {
        let tsn = p.tsn;
        self.n_bytes += p.user_data.len();
        self.chunk_map.insert(tsn, p);

        match (self.sorted.front(), self.sorted.back()) {
            (_, Some(&back)) if sna32gt(tsn, back) => self.sorted.push_back(tsn),
            (Some(&front), _) if sna32lt(tsn, front) => self.sorted.push_front(tsn),
            (None, None) => self.sorted.push_back(tsn),
            _ => {
                let pos = self.sorted.partition_point(|element| sna32lt(*element, tsn));
                self.sorted.insert(pos, tsn);
            }
        }
    }

    /// push pushes a payload data. If the payload data is already in our queue or
    /// older than our cumulative_tsn marker, it will be recorded as duplication,
    /// which can later be retrieved using pop_duplicates.
    pub(crate) fn push(&mut self, p: ChunkPayloadData, cumulative_tsn: u32) -> bool {
        if !self.can_push(&p, cumulative_tsn) {
            self.dup_tsn.push(p.tsn);
            return false;
        }

        self.push_no_check(p);
        true
    }

    /// pop pops only if the oldest chunk's TSN matches the given TSN.
    pub(crate) fn pop(&mut self, tsn: u32) -> Option<ChunkPayloadData> {
        if Some(&tsn) != self.sorted.front() {
            return None;
        }
        self.sorted.pop_front();
        let c = self.chunk_map.remove(&tsn)?;
        self.n_bytes -= c.user_data.len();
        Some(c)
    }

    pub(crate) fn get(&self, tsn: u32) -> Option<&ChunkPayloadData> {
        self.chunk_map.get(&tsn)
    }

    pub(crate) fn get_mut(&mut self, tsn: u32) -> Option<&mut ChunkPayloadData> {
        self.chunk_map.get_mut(&tsn)
    }

    /// TSNs in serial number order, oldest first.
    pub(crate) fn tsns(&self) -> impl Iterator<Item = u32> + '_ {
        self.sorted.iter().copied()
    }

    /// Chunks in TSN order, oldest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &ChunkPayloadData> + '_ {
        self.sorted.iter().filter_map(|tsn| self.chunk_map.get(tsn))
    }

    /// pop_duplicates returns the TSNs that were found duplicate since the last call.
    pub(crate) fn pop_duplicates(&mut self) -> Vec<u32> {
        self.dup_tsn.drain(..).collect()
    }

    pub(crate) fn has_duplicates(&self) -> bool {
        !self.dup_tsn.is_empty()
    }

    pub(crate) fn get_gap_ack_blocks(&self, cumulative_tsn: u32) -> Vec<GapAckBlock> {
        let mut gap_ack_blocks: Vec<GapAckBlock> = vec![];
        for tsn in &self.sorted {
            let diff = tsn.wrapping_sub(cumulative_tsn);
            if diff == 0 || diff > u16::MAX as u32 {
                continue;
            }
            let diff = diff as u16;

            match gap_ack_blocks.last_mut() {
                Some(b) if b.end.wrapping_add(1) == diff => b.end = diff,
                _ => gap_ack_blocks.push(GapAckBlock {
                    start: diff,
                    end: diff,
                }),
            }
        }

        gap_ack_blocks
    }

    pub(crate) fn get_gap_ack_blocks_string(&self, cumulative_tsn: u32) -> String {
        let mut s = format!("cumTSN={cumulative_tsn}");
        for b in self.get_gap_ack_blocks(cumulative_tsn) {
            s += format!(",{}-{}", b.start, b.end).as_str();
        }
        s
    }

    /// Marks the chunk acked and releases its payload. Returns the number of
    /// user data bytes newly acked.
    pub(crate) fn mark_as_acked(&mut self, tsn: u32) -> usize {
        match self.chunk_map.get_mut(&tsn) {
            Some(c) if !c.acked => {
                c.acked = true;
                c.retransmit = false;
                c.fast_retransmit = false;
                let n = c.user_data.len();
                self.n_bytes -= n;
                c.user_data.clear();
                n
            }
            _ => 0,
        }
    }

    pub(crate) fn get_last_tsn_received(&self) -> Option<&u32> {
        self.sorted.back()
    }

    /// Removes the leading chunks with a TSN at or below `tsn`. Returns how
    /// many were removed.
    pub(crate) fn pop_through(&mut self, tsn: u32) -> usize {
        let mut popped = 0;
        while let Some(&front) = self.sorted.front() {
            if sna32gt(front, tsn) {
                break;
            }
            self.sorted.pop_front();
            if let Some(c) = self.chunk_map.remove(&front) {
                self.n_bytes -= c.user_data.len();
            }
            popped += 1;
        }
        popped
    }

    pub(crate) fn mark_all_to_retransmit(&mut self) {
        for c in self.chunk_map.values_mut() {
            if c.acked || c.abandoned {
                continue;
            }
            c.retransmit = true;
            c.fast_retransmit = false;
        }
    }

    /// Removes every chunk, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<ChunkPayloadData> {
        let mut chunks = Vec::with_capacity(self.sorted.len());
        while let Some(tsn) = self.sorted.pop_front() {
            if let Some(c) = self.chunk_map.remove(&tsn) {
                chunks.push(c);
            }
        }
        self.n_bytes = 0;
        chunks
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.chunk_map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
