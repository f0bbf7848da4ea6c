use bytes::Bytes;
use serde::Deserialize;

use crate::command::{Command, RawRequest};
use crate::error::Error;
use crate::node::ServerNode;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NextOperationId {
    pub id: i64,
    #[serde(default)]
    pub node_tag: Option<String>,
}

/// Reserve an operation id on the contacted node.
///
/// A plain GET, but every call must reach the server, so it bypasses
/// the response cache.
#[derive(Debug, Clone, Default)]
pub struct GetNextOperationIdCommand;

impl Command for GetNextOperationIdCommand {
    type Output = NextOperationId;

    fn create_request(&self, node: &ServerNode) -> Result<RawRequest, Error> {
        Ok(RawRequest::get(node.database_url("operations/next-operation-id")?))
    }

    fn is_read_request(&self) -> bool {
        false
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn parse_response(&self, body: &Bytes, _from_cache: bool) -> Result<Self::Output, Error> {
        serde_json::from_slice(body).map_err(|e| Error::deserialization(&e, body))
    }
}
