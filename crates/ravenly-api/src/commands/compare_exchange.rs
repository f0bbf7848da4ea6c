use bytes::Bytes;
use serde::Deserialize;

use crate::command::{Command, RawRequest};
use crate::error::Error;
use crate::node::ServerNode;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompareExchangeResult {
    /// Raft index at which the value was (or would have been) written.
    pub index: i64,
    pub successful: bool,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Commit index of the cluster-wide write, when the server reports it.
    #[serde(default)]
    pub raft_command_index: Option<u64>,
}

/// Cluster-wide compare-exchange write.
///
/// Requires consensus: it carries an idempotency key so the server can
/// deduplicate a replay against a different leader.
#[derive(Debug, Clone)]
pub struct PutCompareExchangeValueCommand {
    key: String,
    value: serde_json::Value,
    index: i64,
    raft_id: String,
}

impl PutCompareExchangeValueCommand {
    pub fn new(key: impl Into<String>, value: serde_json::Value, index: i64) -> Result<Self, Error> {
        if index < 0 {
            return Err(Error::InvalidCommand("index must be a non-negative number".into()));
        }
        let key = key.into();
        if key.trim().is_empty() {
            return Err(Error::InvalidCommand("compare-exchange key cannot be blank".into()));
        }
        Ok(Self {
            key,
            value,
            index,
            raft_id: uuid::Uuid::new_v4().to_string(),
        })
    }
}

impl Command for PutCompareExchangeValueCommand {
    type Output = CompareExchangeResult;

    fn create_request(&self, node: &ServerNode) -> Result<RawRequest, Error> {
        let mut url = node.database_url("cmpxchg")?;
        url.query_pairs_mut()
            .append_pair("key", &self.key)
            .append_pair("index", &self.index.to_string());

        RawRequest::put(url).with_json(&serde_json::json!({ "Object": self.value }))
    }

    fn is_read_request(&self) -> bool {
        false
    }

    fn parse_response(&self, body: &Bytes, _from_cache: bool) -> Result<Self::Output, Error> {
        serde_json::from_slice(body).map_err(|e| Error::deserialization(&e, body))
    }

    fn raft_id(&self) -> Option<&str> {
        Some(&self.raft_id)
    }
}
