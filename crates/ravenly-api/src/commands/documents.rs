use bytes::Bytes;
use serde::Deserialize;

use crate::command::{Command, RawRequest};
use crate::error::Error;
use crate::node::ServerNode;

// ── Load ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetDocumentsResult {
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
    #[serde(default)]
    pub includes: serde_json::Map<String, serde_json::Value>,
}

/// Load one or more documents by id. Cacheable; a 404 resolves to `None`.
#[derive(Debug, Clone)]
pub struct GetDocumentsCommand {
    ids: Vec<String>,
    includes: Vec<String>,
    metadata_only: bool,
}

impl GetDocumentsCommand {
    pub fn new(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            includes: Vec::new(),
            metadata_only: false,
        }
    }

    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.includes.push(path.into());
        self
    }

    pub fn metadata_only(mut self) -> Self {
        self.metadata_only = true;
        self
    }
}

impl Command for GetDocumentsCommand {
    type Output = Option<GetDocumentsResult>;

    fn create_request(&self, node: &ServerNode) -> Result<RawRequest, Error> {
        if self.ids.is_empty() {
            return Err(Error::InvalidCommand("at least one document id is required".into()));
        }

        let mut url = node.database_url("docs")?;
        {
            let mut pairs = url.query_pairs_mut();
            for id in &self.ids {
                pairs.append_pair("id", id);
            }
            for include in &self.includes {
                pairs.append_pair("include", include);
            }
            if self.metadata_only {
                pairs.append_pair("metadataOnly", "true");
            }
        }
        Ok(RawRequest::get(url))
    }

    fn is_read_request(&self) -> bool {
        true
    }

    fn parse_response(&self, body: &Bytes, _from_cache: bool) -> Result<Self::Output, Error> {
        let result: GetDocumentsResult =
            serde_json::from_slice(body).map_err(|e| Error::deserialization(&e, body))?;
        Ok(Some(result))
    }

    fn parse_not_found(&self) -> Option<Self::Output> {
        Some(None)
    }
}

// ── Store ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutResult {
    pub id: String,
    pub change_vector: String,
}

/// Store a document, optionally guarded by an expected change vector.
#[derive(Debug, Clone)]
pub struct PutDocumentCommand {
    id: String,
    change_vector: Option<String>,
    document: serde_json::Value,
}

impl PutDocumentCommand {
    pub fn new(id: impl Into<String>, document: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            change_vector: None,
            document,
        }
    }

    pub fn with_change_vector(mut self, change_vector: impl Into<String>) -> Self {
        self.change_vector = Some(change_vector.into());
        self
    }
}

impl Command for PutDocumentCommand {
    type Output = PutResult;

    fn create_request(&self, node: &ServerNode) -> Result<RawRequest, Error> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidCommand("document id cannot be blank".into()));
        }

        let mut url = node.database_url("docs")?;
        url.query_pairs_mut().append_pair("id", &self.id);

        let request = RawRequest::put(url).with_json(&self.document)?;
        match self.change_vector {
            Some(ref cv) => request.with_header("If-Match", &format!("\"{cv}\"")),
            None => Ok(request),
        }
    }

    fn is_read_request(&self) -> bool {
        false
    }

    fn parse_response(&self, body: &Bytes, _from_cache: bool) -> Result<Self::Output, Error> {
        serde_json::from_slice(body).map_err(|e| Error::deserialization(&e, body))
    }
}
