use super::Target;
use arc_swap::ArcSwap;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const DEFAULT_REPLICAS: usize = 160;

/// Consistent hashing over a ring of virtual nodes.
///
/// Every target owns `replicas` points on a 32-bit ring. A key maps to the
/// first point at or after its own hash, wrapping to the start. Removing a
/// target only moves the keys that were mapped to its points.
pub struct KetamaBalancer {
    replicas: usize,
    ring: ArcSwap<HashRing>,
}

#[derive(Default)]
struct HashRing {
    points: Vec<(u32, usize)>,
    targets: Vec<Target>,
}

impl HashRing {
    fn build(targets: Vec<Target>, replicas: usize) -> Self {
        let mut points = Vec::with_capacity(targets.len() * replicas);
        for (idx, target) in targets.iter().enumerate() {
            for i in 0..replicas {
                points.push((ring_hash(format!("{}#{}", target.address(), i).as_bytes()), idx));
            }
        }
        // Ties on equal hashes resolve by target order so rebuilds are deterministic.
        points.sort_unstable();
        Self { points, targets }
    }

    fn lookup(&self, key: &str) -> Option<&Target> {
        if self.points.is_empty() {
            return None;
        }
        let h = ring_hash(key.as_bytes());
        let pos = self.points.partition_point(|&(p, _)| p < h);
        let (_, idx) = self.points[if pos == self.points.len() { 0 } else { pos }];
        self.targets.get(idx)
    }
}

/// First four bytes of the SHA-256 digest, big-endian.
fn ring_hash(data: &[u8]) -> u32 {
    let digest = Sha256::digest(data);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

impl KetamaBalancer {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            ring: ArcSwap::from_pointee(HashRing::default()),
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Build the new ring off to the side, then swap it in.
    pub fn update_targets(&self, targets: Vec<Target>) {
        let ring = HashRing::build(targets, self.replicas);
        self.ring.store(Arc::new(ring));
    }

    pub fn do_select(&self, key: &str) -> Option<Target> {
        self.ring.load().lookup(key).cloned()
    }

    pub fn get_targets(&self) -> Vec<Target> {
        self.ring.load().targets.clone()
    }
}
