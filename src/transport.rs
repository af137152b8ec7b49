//! The narrow seam between the coordinator and whatever carries requests to
//! shards.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ShardError;
use crate::params::ParamSet;
use crate::tree::ResultTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ShardId {
    fn from(id: u32) -> Self {
        ShardId(id)
    }
}

/// Sends one parameter set to one shard and returns its partial result.
///
/// Implementations should not retry; the coordinator applies its own
/// per-request timeout and treats any error as an empty contribution.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    async fn send(&self, shard: ShardId, params: &ParamSet) -> Result<ResultTree, ShardError>;
}

#[async_trait]
impl<T> ShardTransport for Arc<T>
where
    T: ShardTransport + ?Sized,
{
    async fn send(&self, shard: ShardId, params: &ParamSet) -> Result<ResultTree, ShardError> {
        (**self).send(shard, params).await
    }
}
