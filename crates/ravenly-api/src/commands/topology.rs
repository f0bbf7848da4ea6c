use bytes::Bytes;

use crate::command::{Command, IF_NONE_MATCH_HEADER, RawRequest};
use crate::error::Error;
use crate::node::{ServerNode, Topology};

/// Fetch the database topology from one node.
///
/// Carries the caller's known etag in `If-None-Match`; the server
/// answers 304 when nothing changed, which parses to `None`.
#[derive(Debug, Clone)]
pub struct GetDatabaseTopologyCommand {
    known_etag: Option<i64>,
    debug_tag: Option<String>,
}

impl GetDatabaseTopologyCommand {
    pub fn new(known_etag: Option<i64>) -> Self {
        Self {
            known_etag,
            debug_tag: None,
        }
    }

    /// Free-form label echoed to the server for diagnostics.
    pub fn with_debug_tag(mut self, tag: impl Into<String>) -> Self {
        self.debug_tag = Some(tag.into());
        self
    }
}

impl Command for GetDatabaseTopologyCommand {
    type Output = Option<Topology>;

    fn create_request(&self, node: &ServerNode) -> Result<RawRequest, Error> {
        let mut url = node.server_url("topology")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("name", &node.database);
            if let Some(ref tag) = self.debug_tag {
                pairs.append_pair("debug-tag", tag);
            }
        }

        let request = RawRequest::get(url);
        match self.known_etag {
            Some(etag) if etag >= 0 => request.with_header(IF_NONE_MATCH_HEADER, &format!("\"{etag}\"")),
            _ => Ok(request),
        }
    }

    fn is_read_request(&self) -> bool {
        // Topology has its own etag protocol; keep it out of the response cache.
        false
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn parse_response(&self, body: &Bytes, _from_cache: bool) -> Result<Self::Output, Error> {
        let topology: Topology =
            serde_json::from_slice(body).map_err(|e| Error::deserialization(&e, body))?;
        Ok(Some(topology))
    }

    fn parse_not_modified(&self) -> Option<Self::Output> {
        Some(None)
    }
}
