//! # Shardmerge
//!
//! Distributed aggregation merging with a bounded top-K protocol.
//!
//! Shards answer a query with partial result trees. The coordinator merges
//! them structurally and, for ranked aggregations, runs a fixed sequence of
//! follow-up rounds so the final top-K is exact without every shard shipping
//! its complete list.

pub mod aggregate;
pub mod boundary;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod missing;
pub mod numeric;
pub mod params;
pub mod request;
pub mod test_support;
pub mod transport;
pub mod tree;

// Re-export main types for convenience
pub use aggregate::{
    Aggregate, Coverage, Mergeable, RankedList, SortDirection, SortSpec, SortType,
    StatsAccumulator,
};
pub use config::{CoordinatorConfig, ShardMergeConfig};
pub use coordinator::{CoordinatorState, QueryOutcome, TopKCoordinator};
pub use error::{CoordinatorError, Diagnostic, ShardError};
pub use merge::{merge, merge_all, MergeReport};
pub use numeric::Numeric;
pub use params::ParamSet;
pub use request::{SubRequest, TopKAggregation, TopKQuery};
pub use transport::{ShardId, ShardTransport};
pub use tree::{ResultTree, Scalar};
