//! The driver's mutable state: phase, matching set, fetch bookkeeping and
//! the pending write-fence queue. Always accessed through `Inner::state`'s
//! `parking_lot::Mutex`, never held across an `.await`.

use std::collections::HashMap;

use crate::{
    matching::MatchingSet,
    phase::{
        Phase,
        PhaseController,
    },
    types::{
        DocumentId,
        Timestamp,
        WriteToken,
    },
};

pub struct DriverState {
    pub phase: PhaseController,
    pub matching: MatchingSet,
    /// Ids observed on the oplog (or pending reclassification) that still
    /// need a point fetch before they can be classified.
    pub need_to_fetch: HashMap<DocumentId, Timestamp>,
    /// The batch currently in flight, moved out of `need_to_fetch` at the
    /// start of a fetch-loop iteration and treated as immutable for its
    /// duration.
    pub currently_fetching: HashMap<DocumentId, Timestamp>,
    pub fetch_generation: u64,
    pub requery_when_done_this_query: bool,
    pub writes_to_commit_when_we_reach_steady: Vec<Box<dyn WriteToken>>,
    pub stopped: bool,
}

impl DriverState {
    pub fn new(matching: MatchingSet) -> Self {
        Self {
            phase: PhaseController::new(),
            matching,
            need_to_fetch: HashMap::new(),
            currently_fetching: HashMap::new(),
            fetch_generation: 0,
            requery_when_done_this_query: false,
            writes_to_commit_when_we_reach_steady: Vec::new(),
            stopped: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.current()
    }
}
