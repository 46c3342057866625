use std::collections::VecDeque;

use crate::media::{IceCandidate, SignalingState};

/// Local ICE candidates waiting for a stable signaling state
///
/// Candidates leave in arrival order, exactly once. Nothing is reordered or
/// deduplicated.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    candidates: VecDeque<IceCandidate>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.candidates.push_back(candidate);
    }

    /// Returns the candidate if it may be sent right away, otherwise keeps it
    ///
    /// A candidate is only sendable when the connection is stable and nothing
    /// older is still waiting.
    pub fn admit(
        &mut self,
        candidate: IceCandidate,
        signaling_state: SignalingState,
    ) -> Option<IceCandidate> {
        if signaling_state == SignalingState::Stable && self.candidates.is_empty() {
            return Some(candidate);
        }
        self.push(candidate);
        None
    }

    /// Hand every buffered candidate to `send`, oldest first, and empty the
    /// buffer. Returns how many were drained.
    pub fn drain_to<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(IceCandidate),
    {
        let count = self.candidates.len();
        for candidate in self.candidates.drain(..) {
            send(candidate);
        }
        count
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{}", n), "0", 0)
    }

    #[test]
    fn test_fifo_until_stable() {
        let mut buffer = IceCandidateBuffer::new();
        for n in 1..=3 {
            assert!(buffer
                .admit(candidate(n), SignalingState::HaveLocalOffer)
                .is_none());
        }
        assert_eq!(buffer.len(), 3);

        let mut sent = Vec::new();
        assert_eq!(buffer.drain_to(|c| sent.push(c.candidate)), 3);
        assert_eq!(sent, vec!["candidate:1", "candidate:2", "candidate:3"]);

        // Exactly once
        assert_eq!(buffer.drain_to(|_| panic!("drained twice")), 0);
    }

    #[test]
    fn test_stable_passes_through() {
        let mut buffer = IceCandidateBuffer::new();
        let passed = buffer.admit(candidate(7), SignalingState::Stable);
        assert_eq!(passed, Some(candidate(7)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_no_overtaking_of_older_candidates() {
        let mut buffer = IceCandidateBuffer::new();
        buffer.admit(candidate(1), SignalingState::HaveRemoteOffer);
        // Stable already, but candidate 1 has not been drained yet
        assert!(buffer.admit(candidate(2), SignalingState::Stable).is_none());

        let mut sent = Vec::new();
        buffer.drain_to(|c| sent.push(c));
        assert_eq!(sent, vec![candidate(1), candidate(2)]);
    }

    #[test]
    fn test_duplicates_are_kept() {
        let mut buffer = IceCandidateBuffer::new();
        buffer.push(candidate(1));
        buffer.push(candidate(1));
        assert_eq!(buffer.len(), 2);
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
