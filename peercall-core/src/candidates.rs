//! Buffering for connectivity candidates that arrive early
//!
//! Candidates regularly beat the remote description over an unordered
//! signaling channel. They are held here in arrival order and handed back in
//! one batch once the description lands, so application order always matches
//! arrival order.

use crate::types::IceCandidate;
use std::collections::VecDeque;

/// FIFO buffer for candidates that cannot be applied yet
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queued: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate behind everything already waiting
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queued.push_back(candidate);
    }

    /// Take every queued candidate, oldest first, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queued.drain(..).collect()
    }

    /// Discard all queued candidates
    pub fn clear(&mut self) {
        self.queued.clear();
    }

    /// Number of queued candidates
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Whether the buffer holds nothing
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn candidate_strategy() -> impl Strategy<Value = IceCandidate> {
        (
            "[a-z0-9 .:]{1,64}",
            proptest::option::of("[0-9]{1,2}"),
            proptest::option::of(any::<u16>()),
        )
            .prop_map(|(candidate, sdp_mid, sdp_mline_index)| IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            })
    }

    proptest! {
        #[test]
        fn prop_drain_order_matches_push_order(
            candidates in proptest::collection::vec(candidate_strategy(), 0..32),
        ) {
            let mut buffer = CandidateBuffer::new();
            for c in &candidates {
                buffer.push(c.clone());
            }

            prop_assert_eq!(buffer.len(), candidates.len());
            let drained = buffer.drain();
            prop_assert_eq!(drained, candidates);
            prop_assert!(buffer.is_empty());
        }

        #[test]
        fn prop_interleaved_drains_never_reorder(
            first in proptest::collection::vec(candidate_strategy(), 0..16),
            second in proptest::collection::vec(candidate_strategy(), 0..16),
        ) {
            let mut buffer = CandidateBuffer::new();
            for c in &first {
                buffer.push(c.clone());
            }
            let drained_first = buffer.drain();

            for c in &second {
                buffer.push(c.clone());
            }
            let drained_second = buffer.drain();

            prop_assert_eq!(drained_first, first);
            prop_assert_eq!(drained_second, second);
        }
    }
}
