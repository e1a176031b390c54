pub mod normalize;

pub use normalize::{DefaultNormalizer, TargetNormalizer};
