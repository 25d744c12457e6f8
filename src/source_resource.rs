//! Resource-server source adapter.
//!
//! Wraps any [`ResourceClient`] (filesystem, version-control, or
//! documentation server) as a [`ContextSource`] with id `mcp:<name>`.
//!
//! Two query styles are supported:
//!
//! - **Listing servers**: list resources scoped to the query file's
//!   directory (documentation servers are listed unscoped), score each
//!   handle with the configured [`RelevanceScorer`], and read the best
//!   `max_resources` handles.
//! - **Tool servers**: call one configured tool whose string arguments may
//!   reference `{file_path}`, `{directory}` and `{language}`, and return its
//!   output as a single item.
//!
//! Payloads that are not valid UTF-8 fail the fetch with
//! [`ContextError::SourceMalformedResult`].

use async_trait::async_trait;
use std::sync::Arc;

use context_daemon_core::score::{strip_scheme, KeywordScorer, PathProximityScorer, RelevanceScorer};
use context_daemon_core::source::{ContextSource, QueryFingerprint};
use context_daemon_core::{CompletionQuery, ContextError, ContextItem, SourceId, SourceKind};

use crate::config::{ServerConfig, ToolConfig};

/// Score given to a tool server's output.
pub const TOOL_RESULT_SCORE: f32 = 0.5;

/// A resource advertised by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub uri: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
}

impl ResourceHandle {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: None,
            mime_type: None,
        }
    }
}

/// The capability a resource server exposes to the context engine.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Resources under `scope` (a directory path). An empty scope lists
    /// everything.
    async fn list_resources(&self, scope: &str) -> Result<Vec<ResourceHandle>, ContextError>;

    async fn read_resource(&self, handle: &ResourceHandle) -> Result<Vec<u8>, ContextError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<Vec<u8>, ContextError>;
}

pub struct ResourceSource {
    id: SourceId,
    kind: SourceKind,
    client: Arc<dyn ResourceClient>,
    scorer: Arc<dyn RelevanceScorer>,
    max_resources: usize,
    tool: Option<ToolConfig>,
}

impl ResourceSource {
    pub fn new(
        id: SourceId,
        kind: SourceKind,
        client: Arc<dyn ResourceClient>,
        scorer: Arc<dyn RelevanceScorer>,
    ) -> Self {
        Self {
            id,
            kind,
            client,
            scorer,
            max_resources: 5,
            tool: None,
        }
    }

    /// Build the adapter for a configured server, picking the default scorer
    /// for its kind.
    pub fn from_config(config: &ServerConfig, client: Arc<dyn ResourceClient>) -> Self {
        let kind = config.kind.source_kind();
        let scorer: Arc<dyn RelevanceScorer> = match kind {
            SourceKind::DocumentationResource => Arc::new(KeywordScorer),
            _ => Arc::new(PathProximityScorer::default()),
        };
        let mut source = Self::new(config.source_id(), kind, client, scorer)
            .with_max_resources(config.max_resources);
        if let Some(tool) = &config.tool {
            source = source.with_tool(tool.clone());
        }
        source
    }

    pub fn with_max_resources(mut self, max: usize) -> Self {
        self.max_resources = max;
        self
    }

    pub fn with_tool(mut self, tool: ToolConfig) -> Self {
        self.tool = Some(tool);
        self
    }

    fn scope<'q>(&self, query: &'q CompletionQuery) -> &'q str {
        match self.kind {
            SourceKind::DocumentationResource => "",
            _ => query.directory(),
        }
    }

    fn decode(&self, bytes: Vec<u8>, what: &str) -> Result<String, ContextError> {
        String::from_utf8(bytes).map_err(|_| {
            ContextError::malformed(&self.id, format!("{} is not valid UTF-8", what))
        })
    }

    async fn fetch_tool(
        &self,
        tool: &ToolConfig,
        query: &CompletionQuery,
    ) -> Result<Vec<ContextItem>, ContextError> {
        let arguments = render_arguments(tool, query);
        let output = self.client.call_tool(&tool.name, arguments).await?;
        let text = self.decode(output, &format!("tool '{}' output", tool.name))?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ContextItem::new(self.id.clone(), text, TOOL_RESULT_SCORE)
            .with_origin(query.file_path.clone())])
    }

    async fn fetch_listing(
        &self,
        query: &CompletionQuery,
    ) -> Result<Vec<ContextItem>, ContextError> {
        let handles = self.client.list_resources(self.scope(query)).await?;

        let mut scored: Vec<(f32, ResourceHandle)> = handles
            .into_iter()
            .filter(|h| strip_scheme(&h.uri) != query.file_path)
            .map(|h| (self.scorer.score(query, &h.uri), h))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(self.max_resources);

        let mut items = Vec::with_capacity(scored.len());
        for (score, handle) in scored {
            let bytes = self.client.read_resource(&handle).await?;
            let text = self.decode(bytes, &handle.uri)?;
            if text.is_empty() {
                continue;
            }
            items.push(
                ContextItem::new(self.id.clone(), text, score)
                    .with_origin(strip_scheme(&handle.uri).to_string()),
            );
        }
        Ok(items)
    }
}

#[async_trait]
impl ContextSource for ResourceSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn fingerprint(&self, query: &CompletionQuery) -> QueryFingerprint {
        let key = match &self.tool {
            Some(tool) => format!("tool:{}|{}", tool.name, render_arguments(tool, query)),
            None => format!("list:{}|{}|{}", self.scope(query), query.file_path, query.language),
        };
        QueryFingerprint::new(key, vec![query.file_path.clone()])
    }

    async fn fetch(&self, query: &CompletionQuery) -> Result<Vec<ContextItem>, ContextError> {
        match &self.tool {
            Some(tool) => self.fetch_tool(tool, query).await,
            None => self.fetch_listing(query).await,
        }
    }
}

/// Substitute query placeholders into every string value of the tool's
/// argument table, recursively.
pub fn render_arguments(tool: &ToolConfig, query: &CompletionQuery) -> serde_json::Value {
    fn render(value: &serde_json::Value, query: &CompletionQuery) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => serde_json::Value::String(
                s.replace("{file_path}", &query.file_path)
                    .replace("{directory}", query.directory())
                    .replace("{language}", &query.language),
            ),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| render(v, query)).collect())
            }
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), render(v, query))).collect(),
            ),
            other => other.clone(),
        }
    }
    render(&serde_json::Value::Object(tool.arguments.clone()), query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_daemon_core::Position;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeClient {
        resources: Vec<ResourceHandle>,
        contents: HashMap<String, Vec<u8>>,
        listed_scopes: Mutex<Vec<String>>,
        tool_calls: Mutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl ResourceClient for FakeClient {
        async fn list_resources(&self, scope: &str) -> Result<Vec<ResourceHandle>, ContextError> {
            self.listed_scopes.lock().unwrap().push(scope.to_string());
            Ok(self.resources.clone())
        }

        async fn read_resource(&self, handle: &ResourceHandle) -> Result<Vec<u8>, ContextError> {
            Ok(self.contents.get(&handle.uri).cloned().unwrap_or_default())
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: serde_json::Value,
        ) -> Result<Vec<u8>, ContextError> {
            self.tool_calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments));
            Ok(b"diff --git a/src/lib.rs".to_vec())
        }
    }

    fn query() -> CompletionQuery {
        CompletionQuery::new("src/net/client.rs", Position { line: 3, column: 0 }, "rust")
    }

    fn fs_client() -> FakeClient {
        let mut client = FakeClient::default();
        for (uri, body) in [
            ("file://src/net/client.rs", "self"),
            ("file://src/net/client_pool.rs", "pool"),
            ("file://src/net/socket.rs", "socket"),
            ("file://docs/guide/intro.md", "intro"),
        ] {
            client.resources.push(ResourceHandle::new(uri));
            client.contents.insert(uri.to_string(), body.as_bytes().to_vec());
        }
        client
    }

    #[tokio::test]
    async fn listing_skips_current_file_and_ranks_neighbours() {
        let client = Arc::new(fs_client());
        let source = ResourceSource::new(
            SourceId::new("mcp:fs"),
            SourceKind::FilesystemResource,
            client.clone(),
            Arc::new(PathProximityScorer::default()),
        )
        .with_max_resources(2);

        let items = source.fetch(&query()).await.unwrap();
        let origins: Vec<_> = items.iter().map(|i| i.origin_path().unwrap()).collect();
        assert_eq!(origins, vec!["src/net/client_pool.rs", "src/net/socket.rs"]);
        assert_eq!(client.listed_scopes.lock().unwrap()[0], "src/net");
    }

    #[tokio::test]
    async fn documentation_lists_unscoped() {
        let client = Arc::new(fs_client());
        let source = ResourceSource::new(
            SourceId::new("mcp:docs"),
            SourceKind::DocumentationResource,
            client.clone(),
            Arc::new(KeywordScorer),
        );
        source.fetch(&query()).await.unwrap();
        assert_eq!(client.listed_scopes.lock().unwrap()[0], "");
    }

    #[tokio::test]
    async fn non_utf8_payload_is_malformed() {
        let mut client = FakeClient::default();
        client.resources.push(ResourceHandle::new("file://src/net/bin.rs"));
        client
            .contents
            .insert("file://src/net/bin.rs".to_string(), vec![0xff, 0xfe, 0x00]);
        let source = ResourceSource::new(
            SourceId::new("mcp:fs"),
            SourceKind::FilesystemResource,
            Arc::new(client),
            Arc::new(PathProximityScorer::default()),
        );
        let err = source.fetch(&query()).await.unwrap_err();
        assert!(matches!(err, ContextError::SourceMalformedResult { .. }));
    }

    #[tokio::test]
    async fn tool_server_renders_placeholders() {
        let client = Arc::new(FakeClient::default());
        let mut arguments = serde_json::Map::new();
        arguments.insert("path".into(), json!("{file_path}"));
        arguments.insert("scope".into(), json!(["{directory}", "{language}"]));
        arguments.insert("limit".into(), json!(3));
        let source = ResourceSource::new(
            SourceId::new("mcp:git"),
            SourceKind::VersionControlResource,
            client.clone(),
            Arc::new(PathProximityScorer::default()),
        )
        .with_tool(ToolConfig {
            name: "git_diff".into(),
            arguments,
        });

        let items = source.fetch(&query()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].relevance_score(), TOOL_RESULT_SCORE);

        let calls = client.tool_calls.lock().unwrap();
        assert_eq!(calls[0].0, "git_diff");
        assert_eq!(
            calls[0].1,
            json!({ "path": "src/net/client.rs", "scope": ["src/net", "rust"], "limit": 3 })
        );
    }

    #[test]
    fn fingerprint_distinguishes_files() {
        let source = ResourceSource::new(
            SourceId::new("mcp:fs"),
            SourceKind::FilesystemResource,
            Arc::new(FakeClient::default()),
            Arc::new(PathProximityScorer::default()),
        );
        let a = source.fingerprint(&query());
        let b = source.fingerprint(&CompletionQuery::new(
            "src/net/socket.rs",
            Position::default(),
            "rust",
        ));
        assert_ne!(a.key, b.key);
        assert_eq!(a.paths, vec!["src/net/client.rs".to_string()]);
    }
}
