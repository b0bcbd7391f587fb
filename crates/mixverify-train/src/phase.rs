//! Epoch / phase sequencing.
//!
//! Each epoch runs TRAIN then VALIDATE; TEST runs only after the last
//! epoch's validation.

use mixverify_core::Phase;

/// Position in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    EpochStart(usize),
    Train(usize),
    Validate(usize),
    Test(usize),
    EpochEnd(usize),
    Done,
}

impl RunState {
    /// First state for a run of `num_epochs`.
    pub fn initial(num_epochs: usize) -> Self {
        if num_epochs == 0 {
            RunState::Done
        } else {
            RunState::EpochStart(0)
        }
    }

    pub fn next(self, num_epochs: usize) -> Self {
        match self {
            RunState::EpochStart(e) => RunState::Train(e),
            RunState::Train(e) => RunState::Validate(e),
            RunState::Validate(e) if e + 1 == num_epochs => RunState::Test(e),
            RunState::Validate(e) => RunState::EpochEnd(e),
            RunState::Test(e) => RunState::EpochEnd(e),
            RunState::EpochEnd(e) if e + 1 < num_epochs => RunState::EpochStart(e + 1),
            RunState::EpochEnd(_) | RunState::Done => RunState::Done,
        }
    }

    /// Data phase run in this state, if any.
    pub fn phase(self) -> Option<Phase> {
        match self {
            RunState::Train(_) => Some(Phase::Train),
            RunState::Validate(_) => Some(Phase::Validate),
            RunState::Test(_) => Some(Phase::Test),
            _ => None,
        }
    }

    pub fn epoch(self) -> Option<usize> {
        match self {
            RunState::EpochStart(e)
            | RunState::Train(e)
            | RunState::Validate(e)
            | RunState::Test(e)
            | RunState::EpochEnd(e) => Some(e),
            RunState::Done => None,
        }
    }
}

/// Every state from `initial` through `Done`.
pub fn schedule(num_epochs: usize) -> Vec<RunState> {
    let mut out = Vec::new();
    let mut state = RunState::initial(num_epochs);
    loop {
        out.push(state);
        if state == RunState::Done {
            return out;
        }
        state = state.next(num_epochs);
    }
}
