//! Worker choice for a ready task.
//!
//! Among workers with a free slot: most dependency bytes already held,
//! then lowest `running / capacity`, then lowest worker id.

use std::cmp::Ordering;

use stellwerk_wire::protocol::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub id: WorkerId,
    pub running: u64,
    pub capacity: u64,
    /// Bytes of the task's dependencies this worker already holds.
    pub locality: u64,
}

impl Candidate {
    /// Better candidates order first.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .locality
            .cmp(&self.locality)
            .then_with(|| (self.running * other.capacity).cmp(&(other.running * self.capacity)))
            .then_with(|| self.id.cmp(&other.id))
    }
}

pub(crate) fn choose(candidates: impl IntoIterator<Item = Candidate>) -> Option<WorkerId> {
    candidates
        .into_iter()
        .filter(|c| c.capacity > 0 && c.running < c.capacity)
        .min_by(Candidate::rank)
        .map(|c| c.id)
}
