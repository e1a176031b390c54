use super::Target;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Plain round-robin: `counter % len`, weights ignored.
pub struct RoundRobinBalancer {
    targets: ArcSwap<Vec<Target>>,
    counter: AtomicU64,
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self {
            targets: ArcSwap::from_pointee(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_targets(&self, targets: Vec<Target>) {
        self.targets.store(Arc::new(targets));
    }

    pub fn do_select(&self) -> Option<Target> {
        let targets = self.targets.load();
        if targets.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let idx = (count % targets.len() as u64) as usize;
        Some(targets[idx].clone())
    }

    pub fn get_targets(&self) -> Vec<Target> {
        self.targets.load().as_ref().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn targets(names: &[&str]) -> Vec<Target> {
        names.iter().map(|n| Target::new(*n, 1)).collect()
    }

    #[test]
    fn test_fair_and_cyclic() {
        let lb = RoundRobinBalancer::new();
        lb.update_targets(targets(&["A", "B", "C"]));
        let mut counts = HashMap::new();
        let mut order = Vec::new();
        for _ in 0..300 {
            let t = lb.do_select().unwrap();
            *counts.entry(t.address().to_string()).or_insert(0) += 1;
            order.push(t.address().to_string());
        }
        assert_eq!(counts["A"], 100);
        assert_eq!(counts["B"], 100);
        assert_eq!(counts["C"], 100);
        assert_eq!(&order[..6], &["A", "B", "C", "A", "B", "C"]);
    }

    #[test]
    fn test_weights_ignored() {
        let lb = RoundRobinBalancer::new();
        lb.update_targets(vec![Target::new("A", 10), Target::new("B", 1)]);
        let picks: Vec<_> = (0..4).map(|_| lb.do_select().unwrap()).collect();
        assert_eq!(picks[0].address(), "A");
        assert_eq!(picks[1].address(), "B");
        assert_eq!(picks[2].address(), "A");
        assert_eq!(picks[3].address(), "B");
    }

    #[test]
    fn test_empty() {
        let lb = RoundRobinBalancer::new();
        lb.update_targets(vec![]);
        assert!(lb.do_select().is_none());
    }

    #[test]
    fn test_single() {
        let lb = RoundRobinBalancer::new();
        lb.update_targets(targets(&["A"]));
        for _ in 0..100 {
            assert_eq!(lb.do_select().unwrap().address(), "A");
        }
    }

    #[test]
    fn test_concurrent_selects_stay_fair() {
        let lb = Arc::new(RoundRobinBalancer::new());
        lb.update_targets(targets(&["A", "B", "C", "D"]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lb = Arc::clone(&lb);
                std::thread::spawn(move || {
                    (0..1000)
                        .map(|_| lb.do_select().unwrap().address().to_string())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut counts = HashMap::new();
        for h in handles {
            for addr in h.join().unwrap() {
                *counts.entry(addr).or_insert(0) += 1;
            }
        }
        for name in ["A", "B", "C", "D"] {
            assert_eq!(counts[name], 2000);
        }
    }
}
