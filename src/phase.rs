//! Phase detection on the target's output
//!
//! A run moves `Idle -> Monitoring -> Ended` and never back. Without a start
//! pattern the run begins in `Monitoring`.

use crate::glob::GlobPattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    Monitoring,
    Ended,
}

/// A state change caused by one output line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    Started,
    Ended,
}

#[derive(Debug, Clone)]
pub struct PhaseTracker {
    state: PhaseState,
    start: Option<GlobPattern>,
    end: Option<GlobPattern>,
}

impl PhaseTracker {
    pub fn new(start: Option<&str>, end: Option<&str>) -> Self {
        let state = if start.is_some() {
            PhaseState::Idle
        } else {
            PhaseState::Monitoring
        };
        Self {
            state,
            start: start.map(GlobPattern::new),
            end: end.map(GlobPattern::new),
        }
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn is_monitoring(&self) -> bool {
        self.state == PhaseState::Monitoring
    }

    /// Whether output lines can change the phase at all
    pub fn watches_output(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    /// Feed one line (without its terminator)
    pub fn observe(&mut self, line: &str) -> Option<PhaseTransition> {
        match self.state {
            PhaseState::Idle => {
                let start = self.start.as_ref()?;
                if start.matches(line) {
                    self.state = PhaseState::Monitoring;
                    return Some(PhaseTransition::Started);
                }
            }
            PhaseState::Monitoring => {
                let end = self.end.as_ref()?;
                if end.matches(line) {
                    self.state = PhaseState::Ended;
                    return Some(PhaseTransition::Ended);
                }
            }
            PhaseState::Ended => {}
        }
        None
    }
}
