/// Wake-word detection state machine
///
/// Turns the stream of raw per-window model scores into discrete detection
/// events. A trigger needs `required_consecutive_hits` scores at or above the
/// threshold in a row; after a trigger the machine ignores the next
/// `refractory_window_count` scores so one utterance cannot fire twice while
/// it is still inside the sliding window.

use crate::config::DetectorConfig;
use serde::Serialize;
use tracing::{debug, trace};

/// Detection result handed back to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionEvent {
    /// Session the audio came from
    pub session_id: String,

    /// Name of the wake word / model that fired
    pub wake_word_id: String,

    /// Score of the triggering window (0.0 - 1.0)
    pub score: f32,

    /// Timestamp of the triggering window in milliseconds
    pub timestamp: u64,
}

/// State of a single detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    /// No window scored yet
    Idle,

    /// Monitoring scores
    Armed,

    /// Threshold satisfied; only observable from inside a transition
    Triggered,

    /// Cooling down, scores ignored
    Refractory { remaining: u32 },
}

/// A trigger produced by [`DetectionStateMachine::observe`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trigger {
    pub score: f32,
    pub timestamp: u64,
}

/// Threshold/debounce policy for one wake word in one session
#[derive(Debug, Clone)]
pub struct DetectionStateMachine {
    threshold: f32,
    required_hits: u32,
    refractory_windows: u32,
    state: DetectionState,
    consecutive_hits: u32,
}

impl DetectionStateMachine {
    pub fn new(threshold: f32, required_hits: u32, refractory_windows: u32) -> Self {
        Self {
            threshold,
            required_hits: required_hits.max(1),
            refractory_windows,
            state: DetectionState::Idle,
            consecutive_hits: 0,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(
            config.threshold,
            config.required_consecutive_hits,
            config.refractory_window_count,
        )
    }

    /// Feed one score; returns a trigger if this window completes one
    pub fn observe(&mut self, score: f32, timestamp: u64) -> Option<Trigger> {
        match self.state {
            DetectionState::Refractory { remaining } => {
                let remaining = remaining.saturating_sub(1);
                trace!("Refractory window ignored (score {:.3}, {} left)", score, remaining);
                self.state = if remaining == 0 {
                    DetectionState::Armed
                } else {
                    DetectionState::Refractory { remaining }
                };
                None
            }
            DetectionState::Idle | DetectionState::Armed | DetectionState::Triggered => {
                self.state = DetectionState::Armed;

                if score >= self.threshold {
                    self.consecutive_hits += 1;
                } else {
                    self.consecutive_hits = 0;
                }

                if self.consecutive_hits < self.required_hits {
                    return None;
                }

                self.state = DetectionState::Triggered;
                debug!(
                    "Threshold satisfied after {} hits (score {:.3})",
                    self.consecutive_hits, score
                );
                self.consecutive_hits = 0;
                self.enter_refractory();

                Some(Trigger { score, timestamp })
            }
        }
    }

    fn enter_refractory(&mut self) {
        self.state = if self.refractory_windows == 0 {
            DetectionState::Armed
        } else {
            DetectionState::Refractory {
                remaining: self.refractory_windows,
            }
        };
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    pub fn consecutive_hits(&self) -> u32 {
        self.consecutive_hits
    }

    /// Forget all score history
    pub fn reset(&mut self) {
        self.state = DetectionState::Idle;
        self.consecutive_hits = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(machine: &mut DetectionStateMachine, scores: &[f32]) -> Vec<(usize, Trigger)> {
        scores
            .iter()
            .enumerate()
            .filter_map(|(i, &s)| machine.observe(s, i as u64).map(|t| (i, t)))
            .collect()
    }

    #[test]
    fn test_starts_idle() {
        let machine = DetectionStateMachine::new(0.5, 1, 0);
        assert_eq!(machine.state(), DetectionState::Idle);
    }

    #[test]
    fn test_below_threshold_never_triggers() {
        let mut machine = DetectionStateMachine::new(0.5, 1, 0);
        let triggers = feed(&mut machine, &[0.1; 500]);

        assert!(triggers.is_empty());
        assert_eq!(machine.state(), DetectionState::Armed);
    }

    #[test]
    fn test_single_hit_trigger() {
        let mut machine = DetectionStateMachine::new(0.5, 1, 0);
        let triggers = feed(&mut machine, &[0.2, 0.5, 0.1]);

        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].0, 1);
        assert_eq!(triggers[0].1.score, 0.5);
    }

    #[test]
    fn test_consecutive_hits_required() {
        let mut machine = DetectionStateMachine::new(0.5, 2, 1);
        let triggers = feed(&mut machine, &[0.6, 0.7, 0.2]);

        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].0, 1);
        assert_eq!(triggers[0].1.score, 0.7);
    }

    #[test]
    fn test_interrupted_hits_reset_counter() {
        let mut machine = DetectionStateMachine::new(0.5, 3, 0);
        let triggers = feed(&mut machine, &[0.9, 0.9, 0.1, 0.9, 0.9]);

        assert!(triggers.is_empty());
        assert_eq!(machine.consecutive_hits(), 2);
    }

    #[test]
    fn test_refractory_suppresses_duplicates() {
        let mut machine = DetectionStateMachine::new(0.5, 1, 3);
        let triggers = feed(&mut machine, &[0.9; 9]);

        // Fires at 0, ignores 1..=3, fires at 4, ignores 5..=7, fires at 8
        let indices: Vec<usize> = triggers.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 4, 8]);
    }

    #[test]
    fn test_refractory_countdown_returns_to_armed() {
        let mut machine = DetectionStateMachine::new(0.5, 1, 2);
        machine.observe(0.9, 0);
        assert_eq!(machine.state(), DetectionState::Refractory { remaining: 2 });

        machine.observe(0.0, 1);
        assert_eq!(machine.state(), DetectionState::Refractory { remaining: 1 });

        machine.observe(0.0, 2);
        assert_eq!(machine.state(), DetectionState::Armed);
    }

    #[test]
    fn test_zero_refractory_rearms_immediately() {
        let mut machine = DetectionStateMachine::new(0.5, 1, 0);
        let triggers = feed(&mut machine, &[0.9, 0.9]);
        assert_eq!(triggers.len(), 2);
    }

    #[test]
    fn test_trigger_carries_timestamp() {
        let mut machine = DetectionStateMachine::new(0.5, 1, 0);
        let trigger = machine.observe(0.8, 1234).unwrap();
        assert_eq!(trigger.timestamp, 1234);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut machine = DetectionStateMachine::new(0.5, 2, 5);
        machine.observe(0.9, 0);
        machine.reset();

        assert_eq!(machine.state(), DetectionState::Idle);
        assert_eq!(machine.consecutive_hits(), 0);
    }
}
