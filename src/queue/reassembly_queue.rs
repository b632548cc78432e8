use std::cmp::Ordering;

use bytes::BytesMut;

use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::stream::Message;
use crate::util::*;

fn sort_chunks_by_tsn(c: &mut [ChunkPayloadData]) {
    c.sort_by(|a, b| {
        if sna32lt(a.tsn, b.tsn) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    });
}

fn sort_chunks_by_ssn(c: &mut [ChunkSet]) {
    c.sort_by(|a, b| {
        if sna16lt(a.ssn, b.ssn) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    });
}

/// chunkSet is a set of chunks that share the same SSN
#[derive(Debug, Clone)]
pub(crate) struct ChunkSet {
    /// used only with the ordered chunks
    pub(crate) ssn: u16,
    pub(crate) ppi: PayloadProtocolIdentifier,
    pub(crate) chunks: Vec<ChunkPayloadData>,
}

impl ChunkSet {
    pub(crate) fn new(ssn: u16, ppi: PayloadProtocolIdentifier) -> Self {
        ChunkSet {
            ssn,
            ppi,
            chunks: vec![],
        }
    }

    /// Adds a fragment. Returns false for a duplicate TSN.
    pub(crate) fn push(&mut self, chunk: ChunkPayloadData) -> bool {
        if self.chunks.iter().any(|c| c.tsn == chunk.tsn) {
            return false;
        }

        self.chunks.push(chunk);
        sort_chunks_by_tsn(&mut self.chunks);
        true
    }

    pub(crate) fn is_complete(&self) -> bool {
        // Condition for complete set
        //   0. Has at least one chunk.
        //   1. Begins with beginningFragment set to true
        //   2. Ends with endingFragment set to true
        //   3. TSN monotonically increase by 1 from beginning to end
        let (first, last) = match (self.chunks.first(), self.chunks.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return false,
        };
        if !first.beginning_fragment || !last.ending_fragment {
            return false;
        }

        // From RFC 4960 Section 3.3.1:
        //   When a user message is fragmented into multiple chunks, the TSNs are
        //   used by the receiver to reassemble the message.  This means that the
        //   TSNs for each fragment of a fragmented user message MUST be strictly
        //   sequential.
        self.chunks
            .windows(2)
            .all(|w| w[1].tsn == w[0].tsn.wrapping_add(1))
    }

    fn num_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.user_data.len()).sum()
    }

    fn into_message(self) -> Message {
        let data = if self.chunks.len() == 1 {
            self.chunks
                .into_iter()
                .next()
                .map(|c| c.user_data)
                .unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(self.num_bytes());
            for c in &self.chunks {
                buf.extend_from_slice(&c.user_data);
            }
            buf.freeze()
        };
        Message {
            ppi: self.ppi,
            data,
        }
    }
}

/// Inbound reassembly for one stream.
#[derive(Default, Debug)]
pub(crate) struct ReassemblyQueue {
    pub(crate) si: u16,
    /// expected SSN for next ordered chunk
    pub(crate) next_ssn: u16,
    pub(crate) ordered: Vec<ChunkSet>,
    pub(crate) unordered: Vec<ChunkSet>,
    pub(crate) unordered_chunks: Vec<ChunkPayloadData>,
    pub(crate) n_bytes: usize,
}

impl ReassemblyQueue {
    /// From RFC 4960 Sec 6.5:
    ///   The Stream Sequence Number in all the streams MUST start from 0 when
    ///   the association is Established.  Also, when the Stream Sequence
    ///   Number reaches the value 65535 the next Stream Sequence Number MUST
    ///   be set to 0.
    pub(crate) fn new(si: u16) -> Self {
        ReassemblyQueue {
            si,
            ..Default::default()
        }
    }

    /// Buffers a fragment. Returns true when a message became readable.
    pub(crate) fn push(&mut self, chunk: ChunkPayloadData) -> bool {
        if chunk.stream_identifier != self.si {
            return false;
        }

        if chunk.unordered {
            if self.unordered_chunks.iter().any(|c| c.tsn == chunk.tsn) {
                return false;
            }
            self.n_bytes += chunk.user_data.len();
            self.unordered_chunks.push(chunk);
            sort_chunks_by_tsn(&mut self.unordered_chunks);

            // Scan unordered_chunks that are contiguous (in TSN)
            // If found, append the complete set to the unordered array
            if let Some(cset) = self.find_complete_unordered_chunk_set() {
                self.unordered.push(cset);
                return true;
            }

            false
        } else {
            // This is an ordered chunk
            if sna16lt(chunk.stream_sequence_number, self.next_ssn) {
                return false;
            }

            let n = chunk.user_data.len();
            let ssn = chunk.stream_sequence_number;

            // Check if a chunkSet with the SSN already exists
            let cset = match self.ordered.iter().position(|s| s.ssn == ssn) {
                Some(idx) => &mut self.ordered[idx],
                None => {
                    self.ordered.push(ChunkSet::new(ssn, chunk.payload_type));
                    sort_chunks_by_ssn(&mut self.ordered);
                    match self.ordered.iter_mut().find(|s| s.ssn == ssn) {
                        Some(s) => s,
                        None => return false,
                    }
                }
            };

            if !cset.push(chunk) {
                return false;
            }
            self.n_bytes += n;

            self.is_readable()
        }
    }

    pub(crate) fn find_complete_unordered_chunk_set(&mut self) -> Option<ChunkSet> {
        let mut start_idx: Option<usize> = None;
        let mut n_chunks = 0usize;
        let mut last_tsn = 0u32;
        let mut found = false;

        for (i, c) in self.unordered_chunks.iter().enumerate() {
            // seek beginning
            if c.beginning_fragment {
                start_idx = Some(i);
                n_chunks = 1;
                last_tsn = c.tsn;

                if c.ending_fragment {
                    found = true;
                    break;
                }
                continue;
            }

            if start_idx.is_none() {
                continue;
            }

            // Check if contiguous in TSN
            if c.tsn != last_tsn.wrapping_add(1) {
                start_idx = None;
                continue;
            }

            last_tsn = c.tsn;
            n_chunks += 1;

            if c.ending_fragment {
                found = true;
                break;
            }
        }

        let start_idx = match (found, start_idx) {
            (true, Some(idx)) => idx,
            _ => return None,
        };

        // Extract the range of chunks
        let chunks: Vec<ChunkPayloadData> = self
            .unordered_chunks
            .drain(start_idx..start_idx + n_chunks)
            .collect();

        let mut chunk_set = ChunkSet::new(0, chunks[0].payload_type);
        chunk_set.chunks = chunks;

        Some(chunk_set)
    }

    pub(crate) fn is_readable(&self) -> bool {
        // Check unordered first
        if !self.unordered.is_empty() {
            // The chunk sets in self.unordered should all be complete.
            return true;
        }

        // Check ordered sets
        if let Some(cset) = self.ordered.first() {
            if cset.is_complete() && sna16lte(cset.ssn, self.next_ssn) {
                return true;
            }
        }
        false
    }

    /// Takes the next deliverable message: complete unordered messages first,
    /// then the ordered message carrying the expected SSN.
    pub(crate) fn read(&mut self) -> Option<Message> {
        let cset = if !self.unordered.is_empty() {
            self.unordered.remove(0)
        } else {
            let cset = self.ordered.first()?;
            if !cset.is_complete() || sna16gt(cset.ssn, self.next_ssn) {
                return None;
            }
            if cset.ssn == self.next_ssn {
                // From RFC 4960 Sec 6.5:
                self.next_ssn = self.next_ssn.wrapping_add(1);
            }
            self.ordered.remove(0)
        };

        self.subtract_num_bytes(cset.num_bytes());
        Some(cset.into_message())
    }

    /// Use last_ssn to locate a chunkSet then remove it if the set has
    /// not been complete
    pub(crate) fn forward_tsn_for_ordered(&mut self, last_ssn: u16) {
        let num_bytes = self
            .ordered
            .iter()
            .filter(|s| sna16lte(s.ssn, last_ssn) && !s.is_complete())
            .map(|s| s.num_bytes())
            .sum();
        self.subtract_num_bytes(num_bytes);

        self.ordered
            .retain(|s| !sna16lte(s.ssn, last_ssn) || s.is_complete());

        // Finally, forward next_ssn
        if sna16lte(self.next_ssn, last_ssn) {
            self.next_ssn = last_ssn.wrapping_add(1);
        }
    }

    /// Remove all fragments in the unordered sets that contains chunks
    /// equal to or older than `new_cumulative_tsn`.
    /// We know all sets in the self.unordered are complete ones.
    /// Just remove chunks that are equal to or older than new_cumulative_tsn
    /// from the unordered_chunks
    pub(crate) fn forward_tsn_for_unordered(&mut self, new_cumulative_tsn: u32) {
        let stale = self
            .unordered_chunks
            .iter()
            .take_while(|c| sna32lte(c.tsn, new_cumulative_tsn))
            .count();
        let num_bytes = self.unordered_chunks[..stale]
            .iter()
            .map(|c| c.user_data.len())
            .sum();
        self.subtract_num_bytes(num_bytes);
        self.unordered_chunks.drain(..stale);
    }

    pub(crate) fn subtract_num_bytes(&mut self, n_bytes: usize) {
        self.n_bytes = self.n_bytes.saturating_sub(n_bytes);
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }
}
