//! Stdio resource-protocol client.
//!
//! Spawns a configured server as a child process through `rmcp`'s
//! [`TokioChildProcess`] transport and runs the client side of the protocol
//! over it. The connection is established lazily on first use and
//! re-established on the next call after a transport failure; errors the
//! server itself reports leave the connection in place.
//!
//! Implements [`ResourceClient`] on top of `resources/list`,
//! `resources/read` and `tools/call`, and exposes `tools/list` for the
//! inspection commands.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, ReadResourceRequestParams, Resource, ResourceContents,
};
use rmcp::service::{RunningService, ServiceError};
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use serde_json::{json, Value};
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use context_daemon_core::score::strip_scheme;
use context_daemon_core::{ContextError, SourceId};

use crate::config::ServerConfig;
use crate::source_resource::{ResourceClient, ResourceHandle};

type Connection = RunningService<RoleClient, ()>;

/// A tool advertised by a server.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: Option<String>,
}

/// [`ResourceClient`] backed by a stdio server process.
pub struct StdioResourceClient {
    id: SourceId,
    config: ServerConfig,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl StdioResourceClient {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            id: config.source_id(),
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    async fn connect(&self) -> Result<Connection> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args).envs(&self.config.env);

        let (transport, _stderr) = TokioChildProcess::builder(cmd)
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| {
                format!("failed to spawn server '{}': {}", self.config.name, self.config.command)
            })?;

        let service = tokio::time::timeout(self.request_timeout(), ().serve(transport))
            .await
            .with_context(|| format!("initialize handshake with '{}' timed out", self.config.name))?
            .with_context(|| format!("initialize handshake with '{}'", self.config.name))?;

        let server = service
            .peer_info()
            .map(|info| info.server_info.name.clone())
            .unwrap_or_else(|| "unknown".to_string());
        info!(source = %self.id, server = %server, "connected to resource server");
        Ok(service)
    }

    async fn connection(&self) -> Result<Arc<Connection>, ContextError> {
        let mut slot = self.connection.lock().await;
        if let Some(service) = slot.as_ref() {
            return Ok(Arc::clone(service));
        }
        let service = Arc::new(
            self.connect()
                .await
                .map_err(|e| ContextError::unavailable(&self.id, format!("{:#}", e)))?,
        );
        *slot = Some(Arc::clone(&service));
        Ok(service)
    }

    /// Forget `service` so the next call starts a fresh process.
    async fn reset(&self, service: &Arc<Connection>) {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, service)) {
            debug!(source = %self.id, "dropping resource server connection");
            *slot = None;
        }
    }

    /// Run one request under the configured timeout.
    async fn call<T, F, Fut>(&self, method: &str, request: F) -> Result<T, ContextError>
    where
        F: FnOnce(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let service = self.connection().await?;
        match tokio::time::timeout(self.request_timeout(), request(Arc::clone(&service))).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if !matches!(e, ServiceError::McpError(_)) {
                    self.reset(&service).await;
                }
                Err(ContextError::unavailable(&self.id, format!("{} failed: {}", method, e)))
            }
            Err(_) => Err(ContextError::unavailable(
                &self.id,
                format!("{} timed out after {}ms", method, self.config.request_timeout_ms),
            )),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, ContextError> {
        let tools = self
            .call("tools/list", |s| async move { s.list_all_tools().await })
            .await?;
        Ok(tools
            .into_iter()
            .map(|t| ToolInfo {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
            })
            .collect())
    }

    /// Stop the server process, if running.
    pub async fn shutdown(&self) {
        let Some(service) = self.connection.lock().await.take() else {
            return;
        };
        // Other holders are in-flight requests; the last drop cancels.
        if let Ok(service) = Arc::try_unwrap(service) {
            if let Err(e) = service.cancel().await {
                debug!(source = %self.id, error = %e, "resource server did not stop cleanly");
            }
        }
    }
}

#[async_trait]
impl ResourceClient for StdioResourceClient {
    async fn list_resources(&self, scope: &str) -> Result<Vec<ResourceHandle>, ContextError> {
        let resources = self
            .call("resources/list", |s| async move { s.list_all_resources().await })
            .await?;
        Ok(resource_handles(resources)
            .into_iter()
            .filter(|h| in_scope(&h.uri, scope))
            .collect())
    }

    async fn read_resource(&self, handle: &ResourceHandle) -> Result<Vec<u8>, ContextError> {
        let params: ReadResourceRequestParams = request_params(json!({ "uri": handle.uri }))
            .map_err(|e| ContextError::malformed(&self.id, e.to_string()))?;
        let result = self
            .call("resources/read", |s| async move { s.read_resource(params).await })
            .await?;
        decode_contents(&result.contents)
            .map_err(|e| ContextError::malformed(&self.id, e.to_string()))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Vec<u8>, ContextError> {
        let params: CallToolRequestParams =
            request_params(json!({ "name": name, "arguments": arguments }))
                .map_err(|e| ContextError::malformed(&self.id, e.to_string()))?;
        let result = self
            .call("tools/call", |s| async move { s.call_tool(params).await })
            .await?;
        let text = tool_text(&result);
        if result.is_error.unwrap_or(false) {
            return Err(ContextError::unavailable(
                &self.id,
                format!("tool '{}' reported an error: {}", name, text),
            ));
        }
        Ok(text.into_bytes())
    }
}

/// Build request parameters from their wire form.
fn request_params<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).context("invalid request parameters")
}

fn in_scope(uri: &str, scope: &str) -> bool {
    let scope = scope.trim_end_matches('/');
    if scope.is_empty() {
        return true;
    }
    let path = strip_scheme(uri);
    path == scope
        || path
            .strip_prefix(scope)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn resource_handles(resources: Vec<Resource>) -> Vec<ResourceHandle> {
    resources
        .into_iter()
        .map(|r| ResourceHandle {
            uri: r.raw.uri,
            name: Some(r.raw.name).filter(|n| !n.is_empty()),
            mime_type: r.raw.mime_type,
        })
        .collect()
}

/// Concatenate every content entry; text is taken as-is, blobs are
/// base64-decoded.
fn decode_contents(contents: &[ResourceContents]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for entry in contents {
        match entry {
            ResourceContents::TextResourceContents { text, .. } => {
                out.extend_from_slice(text.as_bytes())
            }
            ResourceContents::BlobResourceContents { blob, .. } => {
                out.extend(BASE64.decode(blob).context("invalid base64 blob")?)
            }
        }
    }
    Ok(out)
}

/// Join the text parts of a tool result.
fn tool_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| c.as_text())
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
