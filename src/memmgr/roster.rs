//! Reader bookkeeping
//!
//! The roster owns reader identity; segment state machines only hold
//! references into it by id. Per reader it counts the `info_update`
//! messages still awaiting an ack for each segment.

use std::collections::HashMap;

use crate::memmgr::segment::SegmentId;
use crate::memmgr::types::ReaderId;

#[derive(Debug, PartialEq)]
pub enum AckOutcome {
    /// No update was outstanding for this reader and segment.
    Untracked,
    /// Acks are still pending; the count is what remains.
    Pending(u32),
    /// The last outstanding update was acked.
    Synced,
}

#[derive(Default)]
pub struct ReaderRoster {
    readers: HashMap<ReaderId, HashMap<SegmentId, u32>>,
}

impl ReaderRoster {
    pub fn new() -> ReaderRoster {
        ReaderRoster {
            readers: HashMap::new(),
        }
    }

    /// Returns false when the reader was already subscribed.
    pub fn add_reader(&mut self, reader: &str) -> bool {
        if self.readers.contains_key(reader) {
            return false;
        }
        self.readers.insert(reader.to_string(), HashMap::new());
        true
    }

    /// Drops the reader and any outstanding counts with it.
    pub fn remove_reader(&mut self, reader: &str) -> bool {
        self.readers.remove(reader).is_some()
    }

    pub fn contains(&self, reader: &str) -> bool {
        self.readers.contains_key(reader)
    }

    pub fn reader_ids(&self) -> Vec<ReaderId> {
        self.readers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Count one more `info_update` sent toward a reader.
    ///
    /// Returns false for an untracked reader, in which case nothing is
    /// recorded.
    pub fn note_update_sent(&mut self, reader: &str, segment: &SegmentId) -> bool {
        match self.readers.get_mut(reader) {
            Some(outstanding) => {
                *outstanding.entry(segment.clone()).or_insert(0) += 1;
                true
            }
            None => false,
        }
    }

    pub fn outstanding(&self, reader: &str, segment: &SegmentId) -> u32 {
        self.readers
            .get(reader)
            .and_then(|outstanding| outstanding.get(segment))
            .copied()
            .unwrap_or(0)
    }

    pub fn has_outstanding(&self, reader: &str, segment: &SegmentId) -> bool {
        self.outstanding(reader, segment) > 0
    }

    /// Account for one `info_update_ack`.
    ///
    /// The segment key is removed the moment the count reaches zero, so a
    /// zero count and an absent key are the same thing.
    pub fn ack(&mut self, reader: &str, segment: &SegmentId) -> AckOutcome {
        let Some(outstanding) = self.readers.get_mut(reader) else {
            return AckOutcome::Untracked;
        };
        let Some(count) = outstanding.get_mut(segment) else {
            return AckOutcome::Untracked;
        };
        *count -= 1;
        if *count == 0 {
            outstanding.remove(segment);
            AckOutcome::Synced
        } else {
            AckOutcome::Pending(*count)
        }
    }
}
