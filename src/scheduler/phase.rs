//! Phase plan for the multi-source batch cycle
//!
//! Each configured source passes through scrape → break → enrich → break;
//! after the last source the cycle wraps to the first. The plan is
//! recomputed from the selection set whenever a full cycle restarts,
//! never mid-cycle.

use serde::Serialize;

/// Stage of one source's pass through the cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scrape,
    BreakBeforeEnrich,
    Enrich,
    BreakAfter,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Scrape => "scrape",
            Stage::BreakBeforeEnrich => "break_before_enrich",
            Stage::Enrich => "enrich",
            Stage::BreakAfter => "break_after",
        };
        write!(f, "{name}")
    }
}

/// A named state in the scheduler's state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Phase {
    pub source: String,
    pub source_idx: usize,
    pub stage: Stage,
}

impl Phase {
    /// Display label, e.g. `vendor-a_enrich`
    pub fn label(&self) -> String {
        format!("{}_{}", self.source, self.stage)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Ordered walk over the selected sources
#[derive(Debug, Clone)]
pub struct PhasePlan {
    sources: Vec<String>,
}

impl PhasePlan {
    /// Build a plan from the externally supplied selection set
    pub fn new(selected: &[String]) -> Self {
        let mut sources = Vec::new();
        for source in selected {
            let source = source.trim();
            if !source.is_empty() && !sources.iter().any(|s| s == source) {
                sources.push(source.to_string());
            }
        }
        Self { sources }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// First phase of a fresh cycle
    pub fn start(&self) -> Option<Phase> {
        (!self.sources.is_empty()).then(|| self.phase(0, Stage::Scrape))
    }

    /// The phase after `current`; `None` once the cycle is complete
    pub fn next(&self, current: &Phase) -> Option<Phase> {
        match current.stage {
            Stage::Scrape => Some(self.phase(current.source_idx, Stage::BreakBeforeEnrich)),
            Stage::BreakBeforeEnrich => Some(self.phase(current.source_idx, Stage::Enrich)),
            Stage::Enrich => Some(self.phase(current.source_idx, Stage::BreakAfter)),
            Stage::BreakAfter => {
                let next_idx = current.source_idx + 1;
                (next_idx < self.sources.len()).then(|| self.phase(next_idx, Stage::Scrape))
            }
        }
    }

    /// Backpressure fast-path target: the same source's enrich phase
    pub fn enrich(&self, source_idx: usize) -> Phase {
        self.phase(source_idx, Stage::Enrich)
    }

    fn phase(&self, source_idx: usize, stage: Stage) -> Phase {
        Phase {
            source: self.sources[source_idx].clone(),
            source_idx,
            stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_full_cycle_walk() {
        let plan = PhasePlan::new(&selection(&["a", "b"]));

        let mut labels = Vec::new();
        let mut phase = plan.start();
        while let Some(current) = phase {
            labels.push(current.label());
            phase = plan.next(&current);
        }

        assert_eq!(
            labels,
            vec![
                "a_scrape",
                "a_break_before_enrich",
                "a_enrich",
                "a_break_after",
                "b_scrape",
                "b_break_before_enrich",
                "b_enrich",
                "b_break_after",
            ]
        );
    }

    #[test]
    fn test_fast_path_targets_same_source() {
        let plan = PhasePlan::new(&selection(&["a", "b"]));
        let start = plan.start().unwrap();

        let enrich = plan.enrich(start.source_idx);
        assert_eq!(enrich.source, "a");
        assert_eq!(enrich.stage, Stage::Enrich);

        // The fast-path phase continues the normal walk afterwards.
        assert_eq!(plan.next(&enrich).unwrap().stage, Stage::BreakAfter);
    }

    #[test]
    fn test_empty_and_duplicate_selection() {
        assert!(PhasePlan::new(&[]).is_empty());
        assert!(PhasePlan::new(&selection(&["", "  "])).is_empty());

        let plan = PhasePlan::new(&selection(&["a", "a", "b"]));
        assert_eq!(plan.sources(), &["a".to_string(), "b".to_string()]);
    }
}
