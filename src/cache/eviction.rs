//! Priority scoring and victim selection.
//!
//! Pure functions over entry snapshots, so ordering can be tested without
//! a device or a clock.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// Inputs to the priority score of one entry.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub quality_score: f32,
    pub idle: Duration,
    pub access_count: u32,
    /// `|current_frame - frame_last_used|`.
    pub frame_distance: u32,
    pub is_critical: bool,
    pub is_predicted_needed: bool,
}

/// Composite priority. Lower values are evicted first.
pub fn priority_score(inputs: &ScoreInputs) -> f32 {
    let ms_idle = inputs.idle.as_secs_f32() * 1000.0;
    let time_factor = 1.0 / (1.0 + ms_idle * 0.001);
    let usage_factor = (inputs.access_count as f32 / 10.0).min(2.0);
    let recency_factor = 1.0 / (1.0 + inputs.frame_distance as f32);
    let critical_factor = if inputs.is_critical { 10.0 } else { 1.0 };
    let predict_factor = if inputs.is_predicted_needed { 2.0 } else { 1.0 };

    inputs.quality_score * time_factor * usage_factor * recency_factor * critical_factor * predict_factor
}

/// Eviction candidate. Critical and referenced entries never become one.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub hash: u64,
    pub priority: f32,
    pub created: Instant,
    pub size: usize,
}

/// Ascending priority, then oldest creation time, then hash.
fn eviction_order(a: &Candidate, b: &Candidate) -> Ordering {
    a.priority
        .total_cmp(&b.priority)
        .then_with(|| a.created.cmp(&b.created))
        .then_with(|| a.hash.cmp(&b.hash))
}

/// Outcome of a victim search.
#[derive(Debug, Default)]
pub(crate) struct Selection {
    pub victims: Vec<u64>,
    pub freed: usize,
    /// True when both requirements are met by `victims`.
    pub satisfied: bool,
}

/// Pick the lowest-priority candidates until `bytes` are freed and
/// `entries` removed. When the candidates cannot cover the request the
/// selection holds all of them and `satisfied` is false.
pub(crate) fn select_victims(mut candidates: Vec<Candidate>, bytes: usize, entries: usize) -> Selection {
    candidates.sort_by(eviction_order);

    let mut selection = Selection::default();
    for c in candidates {
        if selection.freed >= bytes && selection.victims.len() >= entries {
            break;
        }
        selection.freed += c.size;
        selection.victims.push(c.hash);
    }
    selection.satisfied = selection.freed >= bytes && selection.victims.len() >= entries;
    selection
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> ScoreInputs {
        ScoreInputs {
            quality_score: 1.0,
            idle: Duration::ZERO,
            access_count: 10,
            frame_distance: 0,
            is_critical: false,
            is_predicted_needed: false,
        }
    }

    fn candidate(hash: u64, priority: f32, created: Instant, size: usize) -> Candidate {
        Candidate {
            hash,
            priority,
            created,
            size,
        }
    }

    #[test]
    fn test_priority_formula() {
        assert!((priority_score(&inputs()) - 1.0).abs() < 1e-6);

        let idle = ScoreInputs {
            idle: Duration::from_secs(1),
            ..inputs()
        };
        assert!((priority_score(&idle) - 0.5).abs() < 1e-6);

        let far = ScoreInputs {
            frame_distance: 3,
            ..inputs()
        };
        assert!((priority_score(&far) - 0.25).abs() < 1e-6);

        let hot = ScoreInputs {
            access_count: 1000,
            ..inputs()
        };
        assert!((priority_score(&hot) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_critical_and_predicted_multipliers() {
        let critical = ScoreInputs {
            is_critical: true,
            ..inputs()
        };
        let predicted = ScoreInputs {
            is_predicted_needed: true,
            ..inputs()
        };
        assert!((priority_score(&critical) - 10.0).abs() < 1e-5);
        assert!((priority_score(&predicted) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_lowest_priority_first() {
        let now = Instant::now();
        let selection = select_victims(
            vec![
                candidate(1, 0.9, now, 10),
                candidate(2, 0.1, now, 10),
                candidate(3, 0.5, now, 10),
            ],
            15,
            0,
        );
        assert_eq!(selection.victims, vec![2, 3]);
        assert_eq!(selection.freed, 20);
        assert!(selection.satisfied);
    }

    #[test]
    fn test_ties_broken_by_creation_then_hash() {
        let older = Instant::now();
        let newer = older + Duration::from_millis(5);
        let selection = select_victims(
            vec![
                candidate(9, 0.5, newer, 1),
                candidate(7, 0.5, older, 1),
                candidate(3, 0.5, newer, 1),
            ],
            3,
            0,
        );
        assert_eq!(selection.victims, vec![7, 3, 9]);
    }

    #[test]
    fn test_unsatisfiable_selection() {
        let now = Instant::now();
        let selection = select_victims(vec![candidate(1, 0.1, now, 4)], 10, 0);
        assert!(!selection.satisfied);
        assert_eq!(selection.victims, vec![1]);
    }

    #[test]
    fn test_entry_count_requirement() {
        let now = Instant::now();
        let selection = select_victims(
            vec![candidate(1, 0.1, now, 100), candidate(2, 0.2, now, 100)],
            0,
            2,
        );
        assert_eq!(selection.victims.len(), 2);
        assert!(selection.satisfied);
    }

    #[test]
    fn test_nothing_needed() {
        let now = Instant::now();
        let selection = select_victims(vec![candidate(1, 0.1, now, 100)], 0, 0);
        assert!(selection.victims.is_empty());
        assert!(selection.satisfied);
    }
}
