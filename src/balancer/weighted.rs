use super::Target;
use parking_lot::Mutex;

/// Weighted round-robin that spreads each target's picks across the cycle.
///
/// A cycle has `Σ weights` picks and every target is chosen exactly `weight`
/// times in it. Each pick goes to the target with the most picks still due,
/// skipping the previous pick unless nothing else is due. Ties go to the
/// target configured first. With weights {5, 3, 2} one cycle reads
/// `A B A B A C A B A C`.
pub struct WeightedRoundRobinBalancer {
    state: Mutex<WrrState>,
}

#[derive(Default)]
struct WrrState {
    targets: Vec<Target>,
    remaining: Vec<u64>,
    last: Option<usize>,
}

impl Default for WeightedRoundRobinBalancer {
    fn default() -> Self {
        Self {
            state: Mutex::new(WrrState::default()),
        }
    }
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the target set and start a fresh cycle.
    pub fn update_targets(&self, targets: Vec<Target>) {
        let remaining = targets.iter().map(|t| t.weight() as u64).collect();
        let mut state = self.state.lock();
        state.targets = targets;
        state.remaining = remaining;
        state.last = None;
    }

    pub fn do_select(&self) -> Option<Target> {
        let mut state = self.state.lock();
        if state.targets.is_empty() {
            return None;
        }
        if state.remaining.iter().all(|&r| r == 0) {
            let weights: Vec<u64> = state.targets.iter().map(|t| t.weight() as u64).collect();
            state.remaining = weights;
        }

        let last = state.last;
        let pick = best_due(&state.remaining, last).or_else(|| best_due(&state.remaining, None))?;

        state.remaining[pick] -= 1;
        state.last = Some(pick);
        Some(state.targets[pick].clone())
    }

    pub fn get_targets(&self) -> Vec<Target> {
        self.state.lock().targets.clone()
    }
}

/// Index with the largest remaining quota, excluding `skip`. First wins ties.
fn best_due(remaining: &[u64], skip: Option<usize>) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &r) in remaining.iter().enumerate() {
        if r == 0 || Some(i) == skip {
            continue;
        }
        match best {
            Some(b) if remaining[b] >= r => {}
            _ => best = Some(i),
        }
    }
    best
}
