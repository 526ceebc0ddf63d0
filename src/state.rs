use std::fmt;

// Lifecycle of one watershed through the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovered,
    InventoryReady,
    AccumulatorInitialized,
    Downscaled,
    Routed,
    Normalized,
    StatisticsGenerated,
    StatisticsSkipped,
    Done,
}

impl Stage {
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Discovered, InventoryReady)
                | (InventoryReady, AccumulatorInitialized)
                | (AccumulatorInitialized, Downscaled)
                | (Downscaled, Routed)
                | (Routed, Normalized)
                | (Normalized, StatisticsGenerated)
                | (Normalized, StatisticsSkipped)
                | (StatisticsGenerated, Done)
                | (StatisticsSkipped, Done)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discovered => "discovered",
            Stage::InventoryReady => "inventory-ready",
            Stage::AccumulatorInitialized => "accumulator-initialized",
            Stage::Downscaled => "downscaled",
            Stage::Routed => "routed",
            Stage::Normalized => "normalized",
            Stage::StatisticsGenerated => "statistics-generated",
            Stage::StatisticsSkipped => "statistics-skipped",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

// Terminal state reported for every watershed at the end of a run
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Done,
    /// `stage` is the stage that was being attempted when the error occurred.
    Failed { stage: Stage, reason: String },
}

impl Terminal {
    pub fn is_done(&self) -> bool {
        matches!(self, Terminal::Done)
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Done => f.write_str("Done"),
            Terminal::Failed { stage, reason } => write!(f, "Failed({}, {})", stage, reason),
        }
    }
}

/// Tracks the current stage of a watershed; `Failed` is absorbing.
#[derive(Debug)]
pub struct StageTracker {
    current: Stage,
    attempting: Option<Stage>,
    history: Vec<Stage>,
    failure: Option<String>,
}

impl StageTracker {
    pub fn new() -> Self {
        StageTracker {
            current: Stage::Discovered,
            attempting: None,
            history: vec![Stage::Discovered],
            failure: None,
        }
    }

    /// Last stage completed.
    pub fn current(&self) -> Stage {
        self.current
    }

    /// Stage in progress: the one a failure is charged to.
    pub fn attempting(&self) -> Stage {
        self.attempting.unwrap_or(self.current)
    }

    /// Marks `next` as in progress. Ignored unless it is a legal successor.
    pub fn attempt(&mut self, next: Stage) {
        if self.failure.is_none() && self.current.can_advance_to(next) {
            self.attempting = Some(next);
        }
    }

    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    /// Moves to `next`. Illegal transitions and transitions after a failure
    /// are refused and leave the tracker untouched.
    pub fn advance(&mut self, next: Stage) -> bool {
        if self.failure.is_some() || !self.current.can_advance_to(next) {
            return false;
        }
        self.current = next;
        self.attempting = None;
        self.history.push(next);
        true
    }

    /// Records a failure of the stage in progress. Only the first failure sticks.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
    }

    pub fn terminal(&self) -> Terminal {
        match &self.failure {
            Some(reason) => Terminal::Failed {
                stage: self.attempting(),
                reason: reason.clone(),
            },
            None if self.current == Stage::Done => Terminal::Done,
            None => Terminal::Failed {
                stage: self.attempting(),
                reason: "pipeline stopped before completion".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_path_reaches_done() {
        let mut tracker = StageTracker::new();
        for stage in [
            Stage::InventoryReady,
            Stage::AccumulatorInitialized,
            Stage::Downscaled,
            Stage::Routed,
            Stage::Normalized,
            Stage::StatisticsSkipped,
            Stage::Done,
        ] {
            assert!(tracker.advance(stage), "refused {}", stage);
        }
        assert_eq!(tracker.terminal(), Terminal::Done);
        assert_eq!(tracker.history().len(), 8);
    }

    #[test]
    fn skipping_a_stage_is_refused() {
        let mut tracker = StageTracker::new();
        assert!(tracker.advance(Stage::InventoryReady));
        assert!(!tracker.advance(Stage::Downscaled));
        assert_eq!(tracker.current(), Stage::InventoryReady);
    }

    #[test]
    fn failure_is_absorbing() {
        let mut tracker = StageTracker::new();
        tracker.advance(Stage::InventoryReady);
        tracker.advance(Stage::AccumulatorInitialized);
        tracker.attempt(Stage::Downscaled);
        tracker.fail("2 of 3 downscaling jobs failed");
        tracker.fail("ignored");
        assert!(!tracker.advance(Stage::Downscaled));
        assert_eq!(tracker.current(), Stage::AccumulatorInitialized);
        assert_eq!(
            tracker.terminal(),
            Terminal::Failed {
                stage: Stage::Downscaled,
                reason: "2 of 3 downscaling jobs failed".to_string()
            }
        );
    }

    #[test]
    fn failure_without_attempt_is_charged_to_current_stage() {
        let mut tracker = StageTracker::new();
        tracker.advance(Stage::InventoryReady);
        tracker.attempt(Stage::Routed);
        assert_eq!(tracker.attempting(), Stage::InventoryReady);
        tracker.fail("no output directory");
        assert!(matches!(
            tracker.terminal(),
            Terminal::Failed { stage: Stage::InventoryReady, .. }
        ));
    }
}
