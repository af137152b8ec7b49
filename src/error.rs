//! Error and diagnostic types shared by the merge engine and the coordinator.
//!
//! Only two conditions ever reach the caller of a query: no shard answered the
//! gathering round, or the query was cancelled. Everything else is recovered
//! locally and surfaced as a [`Diagnostic`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::ShardId;

/// Merge of two trees whose kinds differ at the root.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("kind mismatch at {path}: {dest} vs {src}")]
    KindMismatch {
        path: String,
        dest: &'static str,
        src: &'static str,
    },
}

/// Encoding an aggregate for the wire.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("aggregate could not be serialized: {0}")]
    Serialize(#[from] bincode::Error),
}

/// Why a shard contributed nothing to a round.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error("shard {shard} timed out after {}ms", timeout.as_millis())]
    Timeout { shard: ShardId, timeout: Duration },

    #[error("shard {shard} transport error: {reason}")]
    Transport { shard: ShardId, reason: String },

    #[error("shard {shard} returned a malformed response: {reason}")]
    Malformed { shard: ShardId, reason: String },
}

impl ShardError {
    pub fn shard(&self) -> ShardId {
        match self {
            ShardError::Timeout { shard, .. }
            | ShardError::Transport { shard, .. }
            | ShardError::Malformed { shard, .. } => *shard,
        }
    }
}

/// Parameter parsing and expansion failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("missing parameter {0}")]
    Missing(String),

    #[error("invalid value {value:?} for parameter {key}")]
    Invalid { key: String, value: String },

    #[error("variable expansion would produce {size} combinations (limit {limit})")]
    ExpansionTooLarge { size: usize, limit: usize },
}

/// Query-level failures.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("no shard responded to the initial request ({attempted} attempted)")]
    NoShardResponded { attempted: usize },

    #[error("query cancelled")]
    Cancelled,

    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Something that went wrong during a query but did not fail it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Diagnostic {
    KindMismatch {
        path: String,
        dest: String,
        src: String,
    },
    DecodeFailure {
        path: String,
    },
    ShardUnavailable {
        shard: ShardId,
        round: String,
        reason: String,
    },
    BoundaryUnderflow {
        aggregation: String,
        entries: usize,
        number: i64,
    },
}

impl Diagnostic {
    pub fn kind_mismatch(path: impl Into<String>, dest: &str, src: &str) -> Self {
        Diagnostic::KindMismatch {
            path: path.into(),
            dest: dest.to_string(),
            src: src.to_string(),
        }
    }

    pub fn shard_unavailable(round: &str, err: &ShardError) -> Self {
        Diagnostic::ShardUnavailable {
            shard: err.shard(),
            round: round.to_string(),
            reason: err.to_string(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::KindMismatch { path, dest, src } => {
                write!(f, "kind mismatch at {path}: {dest} vs {src}")
            }
            Diagnostic::DecodeFailure { path } => write!(f, "undecodable aggregate at {path}"),
            Diagnostic::ShardUnavailable {
                shard,
                round,
                reason,
            } => write!(f, "shard {shard} unavailable during {round}: {reason}"),
            Diagnostic::BoundaryUnderflow {
                aggregation,
                entries,
                number,
            } => write!(
                f,
                "aggregation {aggregation} has {entries} entries for number {number}"
            ),
        }
    }
}

impl From<MergeError> for Diagnostic {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::KindMismatch { path, dest, src } => {
                Diagnostic::kind_mismatch(path, dest, src)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_error_reports_its_shard() {
        let err = ShardError::Timeout {
            shard: ShardId(3),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.shard(), ShardId(3));
        assert_eq!(err.to_string(), "shard 3 timed out after 250ms");
    }

    #[test]
    fn diagnostic_serializes_with_kind_tag() {
        let diag = Diagnostic::DecodeFailure {
            path: "agg.terms".to_string(),
        };
        let json = serde_json::to_string(&diag).unwrap();
        assert_eq!(json, r#"{"kind":"decode-failure","path":"agg.terms"}"#);
    }
}
