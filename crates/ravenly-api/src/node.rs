// Cluster topology wire model.
//
// `ServerNode` and `Topology` are exchanged with the server verbatim
// (PascalCase JSON) and treated as immutable values by the client:
// a topology refresh replaces the whole list, never a single node.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Cluster tag assigned to nodes built from seed URLs, before the
/// server has told us who they are.
pub const UNKNOWN_CLUSTER_TAG: &str = "?";

/// Role a node plays in a database group.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum ServerRole {
    #[default]
    None,
    Promotable,
    Member,
    Rehab,
}

/// One database-server endpoint.
///
/// Identity is `(url, database)`: two nodes with the same URL and
/// database compare equal even when their tag or role differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerNode {
    pub url: String,
    pub database: String,
    #[serde(default)]
    pub cluster_tag: String,
    #[serde(default)]
    pub server_role: ServerRole,
}

impl ServerNode {
    /// A node known only by URL, as produced from seed configuration.
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: normalize_url(&url.into()),
            database: database.into(),
            cluster_tag: UNKNOWN_CLUSTER_TAG.into(),
            server_role: ServerRole::None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.cluster_tag = tag.into();
        self
    }

    pub fn with_role(mut self, role: ServerRole) -> Self {
        self.server_role = role;
        self
    }

    /// Build `<url>/databases/<db>/<resource>`.
    pub fn database_url(&self, resource: &str) -> Result<Url, Error> {
        let raw = format!(
            "{}/databases/{}/{}",
            normalize_url(&self.url),
            self.database,
            resource.trim_start_matches('/')
        );
        Ok(Url::parse(&raw)?)
    }

    /// Build `<url>/<path>` for server-level endpoints.
    pub fn server_url(&self, path: &str) -> Result<Url, Error> {
        let raw = format!("{}/{}", normalize_url(&self.url), path.trim_start_matches('/'));
        Ok(Url::parse(&raw)?)
    }
}

impl PartialEq for ServerNode {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.database == other.database
    }
}

impl Eq for ServerNode {}

impl Hash for ServerNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
        self.database.hash(state);
    }
}

/// Versioned set of nodes for one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Topology {
    pub etag: i64,
    #[serde(default)]
    pub nodes: Vec<ServerNode>,
    #[serde(default)]
    pub promotables: Vec<ServerNode>,
}

impl Topology {
    /// One node per seed URL, etag `-1`. Used until the first
    /// successful refresh.
    pub fn from_seed_urls(urls: &[Url], database: &str) -> Self {
        Self {
            etag: -1,
            nodes: urls
                .iter()
                .map(|u| ServerNode::new(u.as_str(), database))
                .collect(),
            promotables: Vec::new(),
        }
    }

    pub fn node_by_tag(&self, tag: &str) -> Option<(usize, &ServerNode)> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(_, n)| n.cluster_tag.eq_ignore_ascii_case(tag))
    }

    pub fn index_of(&self, node: &ServerNode) -> Option<usize> {
        self.nodes.iter().position(|n| n == node)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Strip trailing slashes so URLs compare and join uniformly.
pub fn normalize_url(raw: &str) -> String {
    raw.trim_end_matches('/').to_owned()
}
