use protocol::TriggerResult;

/// What one trigger sample means relative to the previous one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged,
    Increased { from: u64, to: u64 },
    /// The count went down, which only happens when the coordinator lost its
    /// state.
    Decreased { from: u64, to: u64 },
    /// The coordinator reported a different boot id than last time.
    Restarted { from: u64, to: u64 },
}

impl PollOutcome {
    pub fn should_build(&self) -> bool {
        matches!(self, PollOutcome::Increased { .. })
    }
}

/// Edge detector over successive trigger samples.
///
/// Only successful samples are fed in; a failed poll leaves the previous
/// sample in place.
#[derive(Clone, Debug, Default)]
pub struct TriggerWatch {
    last_seen: u64,
    boot_id: Option<String>,
}

impl TriggerWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn boot_id(&self) -> Option<&str> {
        self.boot_id.as_deref()
    }

    /// Records a baseline without classifying it.
    pub fn prime(&mut self, sample: &TriggerResult) {
        self.last_seen = sample.count;
        if sample.boot_id.is_some() {
            self.boot_id = sample.boot_id.clone();
        }
    }

    pub fn observe(&mut self, sample: &TriggerResult) -> PollOutcome {
        let from = self.last_seen;
        let to = sample.count;
        let restarted = matches!(
            (self.boot_id.as_deref(), sample.boot_id.as_deref()),
            (Some(known), Some(current)) if known != current
        );
        self.prime(sample);

        if restarted {
            PollOutcome::Restarted { from, to }
        } else if to == from {
            PollOutcome::Unchanged
        } else if to > from {
            PollOutcome::Increased { from, to }
        } else {
            PollOutcome::Decreased { from, to }
        }
    }
}
