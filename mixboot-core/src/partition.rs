//! Message partitioning: split an E2E payload into parts that fit one round each, and reassemble on receipt.

use std::collections::HashMap;

use crate::protocol::MessageId;

/// Default maximum part length in bytes.
pub const DEFAULT_MAX_PART_LEN: usize = 4096;

/// Partial messages kept before the oldest is dropped.
const MAX_PENDING_MESSAGES: usize = 256;

/// Split a payload into parts of at most `max_part_len` bytes. Always returns at least one part.
pub fn split_into_parts(payload: &[u8], max_part_len: usize) -> Vec<Vec<u8>> {
    let size = if max_part_len == 0 {
        DEFAULT_MAX_PART_LEN
    } else {
        max_part_len
    };
    if payload.is_empty() {
        return vec![Vec::new()];
    }
    payload.chunks(size).map(<[u8]>::to_vec).collect()
}

struct PartialMessage {
    parts: Vec<Option<Vec<u8>>>,
    /// Insertion sequence, for eviction.
    seq: u64,
}

impl PartialMessage {
    fn is_complete(&self) -> bool {
        self.parts.iter().all(Option::is_some)
    }

    fn reassemble(self) -> Vec<u8> {
        self.parts.into_iter().flatten().flatten().collect()
    }
}

/// Collects parts per message ID and yields the payload once every part arrived.
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<MessageId, PartialMessage>,
    next_seq: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one part. Returns `Ok(Some(payload))` when the message is complete, `Ok(None)` while in progress.
    pub fn on_part(
        &mut self,
        message_id: MessageId,
        part: u16,
        parts: u16,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, PartitionError> {
        if parts == 0 || part >= parts {
            return Err(PartitionError::BadIndex { part, parts });
        }
        if parts == 1 {
            return Ok(Some(payload));
        }
        if !self.pending.contains_key(&message_id) && self.pending.len() >= MAX_PENDING_MESSAGES {
            self.evict_oldest();
        }
        let seq = self.next_seq;
        let entry = self
            .pending
            .entry(message_id)
            .or_insert_with(|| PartialMessage {
                parts: vec![None; parts as usize],
                seq,
            });
        if entry.seq == seq {
            self.next_seq += 1;
        }
        if entry.parts.len() != parts as usize {
            return Err(PartitionError::CountMismatch {
                expected: entry.parts.len() as u16,
                got: parts,
            });
        }
        entry.parts[part as usize] = Some(payload);
        if entry.is_complete() {
            let done = self.pending.remove(&message_id).map(PartialMessage::reassemble);
            return Ok(done);
        }
        Ok(None)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .pending
            .iter()
            .min_by_key(|(_, p)| p.seq)
            .map(|(id, _)| *id)
        {
            self.pending.remove(&oldest);
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("part {part} out of range for {parts} parts")]
    BadIndex { part: u16, parts: u16 },
    #[error("part count changed mid-message: expected {expected}, got {got}")]
    CountMismatch { expected: u16, got: u16 },
}
