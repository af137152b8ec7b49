//! Default constants for shardmerge configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Top-K Defaults
// =============================================================================

/// Global size of a ranked aggregation when the query does not set one
pub const DEFAULT_NUMBER: i64 = 10;

/// Each shard is initially asked for this many times the global size
pub const DEFAULT_SHARD_NUMBER_MULTIPLIER: i64 = 2;

/// Upper bound on aggregations produced by variable expansion
pub const DEFAULT_MAX_EXPANSION: usize = 1024;

// =============================================================================
// Round Defaults
// =============================================================================

/// Per-shard request timeout (milliseconds)
pub const DEFAULT_SHARD_TIMEOUT_MS: u64 = 5_000;

/// Whether flagged shards are asked again below the estimated boundary
pub const DEFAULT_MISSING_TOP_ROUND: bool = true;

/// Whether shards are asked for keys other shards reported
pub const DEFAULT_MISSING_KEY_ROUND: bool = true;

/// Whether shards get a final round to attach display data
pub const DEFAULT_FINISH_ROUND: bool = false;

// =============================================================================
// Simulation Defaults
// =============================================================================

/// Number of simulated shards
pub const DEFAULT_SIM_SHARDS: usize = 4;

/// Distinct keys drawn per simulated shard
pub const DEFAULT_SIM_KEYS_PER_SHARD: usize = 200;

/// Size of the key vocabulary shared by simulated shards
pub const DEFAULT_SIM_VOCABULARY: usize = 500;

/// Largest per-key observation count on a simulated shard
pub const DEFAULT_SIM_MAX_COUNT: u64 = 50;

/// Seed for the simulated data
pub const DEFAULT_SIM_SEED: u64 = 42;
