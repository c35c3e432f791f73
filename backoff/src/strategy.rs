/// Same delay before every retry.
pub mod fixed;

/// Delay that grows geometrically with every retry, optionally jittered.
pub mod exponential;
