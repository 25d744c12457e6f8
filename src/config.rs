//! Configuration parsing and validation.
//!
//! The daemon is configured by a single TOML file. Every table and field has
//! a default, so an empty file is a valid configuration that serves open
//! buffers and an offline hashing index over the current directory.
//!
//! `${VAR}` placeholders anywhere in the file are replaced from the
//! environment before parsing; unknown variables are left untouched.
//!
//! ```toml
//! [context]
//! context_budget_bytes = 51200
//! total_gather_timeout_ms = 500
//!
//! [context.source_timeout_ms]
//! "mcp:git" = 250
//!
//! [[servers]]
//! name = "git"
//! kind = "version_control"
//! command = "mcp-server-git"
//! args = ["--repository", "${HOME}/src/project"]
//!
//! [import]
//! files = [".vscode/mcp.json"]
//! kinds = { git = "version_control" }
//! ```
//!
//! Servers listed in `[import]` files use the `mcpServers` JSON layout shared
//! by editors and desktop clients; see [`crate::import`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use context_daemon_core::cache::CacheTtls;
use context_daemon_core::chunk::ChunkParams;
use context_daemon_core::health::BreakerConfig;
use context_daemon_core::{SourceId, SourceKind};

pub const BUFFER_SOURCE: &str = "buffer";
pub const SEMANTIC_SOURCE: &str = "semantic";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub import: ImportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_sweep_interval")]
    pub cache_sweep_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cache_sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7431".to_string()
}
fn default_sweep_interval() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_budget")]
    pub context_budget_bytes: usize,
    #[serde(default = "default_total_timeout")]
    pub total_gather_timeout_ms: u64,
    #[serde(default = "default_source_timeout")]
    pub default_source_timeout_ms: u64,
    /// Per-source overrides keyed by source id (`buffer`, `semantic`,
    /// `mcp:<name>`).
    #[serde(default)]
    pub source_timeout_ms: BTreeMap<String, u64>,
    #[serde(default = "default_current_file_timeout")]
    pub current_file_timeout_ms: u64,
    /// How long a fetch that missed its request may keep running so its
    /// result can still populate the cache.
    #[serde(default = "default_late_grace")]
    pub late_result_grace_ms: u64,
    /// Empty means every configured source is enabled.
    #[serde(default)]
    pub enabled_sources: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_budget_bytes: default_budget(),
            total_gather_timeout_ms: default_total_timeout(),
            default_source_timeout_ms: default_source_timeout(),
            source_timeout_ms: BTreeMap::new(),
            current_file_timeout_ms: default_current_file_timeout(),
            late_result_grace_ms: default_late_grace(),
            enabled_sources: Vec::new(),
        }
    }
}

impl ContextConfig {
    pub fn source_timeout(&self, id: &SourceId) -> Duration {
        let ms = self
            .source_timeout_ms
            .get(id.as_str())
            .copied()
            .unwrap_or(self.default_source_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_gather_timeout_ms)
    }

    pub fn is_enabled(&self, id: &SourceId) -> bool {
        self.enabled_sources.is_empty() || self.enabled_sources.iter().any(|s| s == id.as_str())
    }
}

fn default_budget() -> usize {
    50 * 1024
}
fn default_total_timeout() -> u64 {
    500
}
fn default_source_timeout() -> u64 {
    300
}
fn default_current_file_timeout() -> u64 {
    100
}
fn default_late_grace() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_file_ttl")]
    pub file_content_ttl_secs: u64,
    #[serde(default = "default_listing_ttl")]
    pub resource_listing_ttl_secs: u64,
    #[serde(default = "default_docs_ttl")]
    pub documentation_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            file_content_ttl_secs: default_file_ttl(),
            resource_listing_ttl_secs: default_listing_ttl(),
            documentation_ttl_secs: default_docs_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn ttls(&self) -> CacheTtls {
        CacheTtls {
            file_content: Duration::from_secs(self.file_content_ttl_secs),
            resource_listing: Duration::from_secs(self.resource_listing_ttl_secs),
            documentation: Duration::from_secs(self.documentation_ttl_secs),
        }
    }
}

fn default_file_ttl() -> u64 {
    30
}
fn default_listing_ttl() -> u64 {
    60
}
fn default_docs_ttl() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_ms: u64,
    #[serde(default = "default_latency_alpha")]
    pub latency_ema_alpha: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown(),
            max_cooldown_ms: default_max_cooldown(),
            latency_ema_alpha: default_latency_alpha(),
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
            max_cooldown: Duration::from_millis(self.max_cooldown_ms),
            latency_alpha: self.latency_ema_alpha,
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown() -> u64 {
    30_000
}
fn default_max_cooldown() -> u64 {
    240_000
}
fn default_latency_alpha() -> f64 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    #[serde(default = "default_max_siblings")]
    pub max_sibling_files: usize,
    #[serde(default = "default_max_sibling_bytes")]
    pub max_sibling_bytes: usize,
    #[serde(default = "default_current_file_score")]
    pub current_file_score: f32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_sibling_files: default_max_siblings(),
            max_sibling_bytes: default_max_sibling_bytes(),
            current_file_score: default_current_file_score(),
        }
    }
}

fn default_max_siblings() -> usize {
    8
}
fn default_max_sibling_bytes() -> usize {
    16 * 1024
}
fn default_current_file_score() -> f32 {
    1.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RagConfig {
    #[serde(default = "default_rag_root")]
    pub root: PathBuf,
    /// Where the index snapshot is persisted. No persistence when unset.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
    #[serde(default = "default_overlap_bytes")]
    pub overlap_bytes: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_index_interval")]
    pub index_interval_ms: u64,
    #[serde(default = "default_query_window")]
    pub query_window_lines: usize,
    /// Files larger than this are not indexed.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            root: default_rag_root(),
            snapshot_path: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_chunk_bytes: default_max_chunk_bytes(),
            overlap_bytes: default_overlap_bytes(),
            top_k: default_top_k(),
            min_score: default_min_score(),
            index_interval_ms: default_index_interval(),
            query_window_lines: default_query_window(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

impl RagConfig {
    pub fn chunk_params(&self) -> ChunkParams {
        ChunkParams {
            max_bytes: self.max_chunk_bytes,
            overlap_bytes: self.overlap_bytes,
        }
    }
}

fn default_rag_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_include_globs() -> Vec<String> {
    [
        "**/*.rs", "**/*.py", "**/*.ts", "**/*.tsx", "**/*.js", "**/*.go", "**/*.lua", "**/*.c",
        "**/*.h", "**/*.cpp", "**/*.java", "**/*.md",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_chunk_bytes() -> usize {
    1500
}
fn default_overlap_bytes() -> usize {
    200
}
fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f32 {
    0.25
}
fn default_index_interval() -> u64 {
    25
}
fn default_query_window() -> usize {
    30
}
fn default_max_file_bytes() -> u64 {
    512 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama host, OpenAI-compatible endpoint).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Which kind of context a resource server provides.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Filesystem,
    VersionControl,
    Documentation,
}

impl ServerKind {
    pub fn source_kind(self) -> SourceKind {
        match self {
            ServerKind::Filesystem => SourceKind::FilesystemResource,
            ServerKind::VersionControl => SourceKind::VersionControlResource,
            ServerKind::Documentation => SourceKind::DocumentationResource,
        }
    }
}

/// A resource-protocol server spawned as a child process.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub kind: ServerKind,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_max_resources")]
    pub max_resources: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// When set, the server is queried by calling this tool instead of
    /// listing and reading resources.
    #[serde(default)]
    pub tool: Option<ToolConfig>,
}

impl ServerConfig {
    pub fn source_id(&self) -> SourceId {
        SourceId::new(format!("mcp:{}", self.name))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolConfig {
    pub name: String,
    /// String values may contain `{file_path}`, `{directory}` and
    /// `{language}`, filled in from the query.
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

pub(crate) fn default_max_resources() -> usize {
    5
}
pub(crate) fn default_request_timeout() -> u64 {
    5_000
}

/// Resource servers read from `mcpServers` JSON files. Servers declared in
/// `[[servers]]` win over imported ones with the same name.
#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    /// Files to import. A listed file that is missing is an error.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Also import the first file found in the well-known locations.
    #[serde(default)]
    pub search_default_locations: bool,
    /// Kind given to imported servers without an entry in `kinds`.
    #[serde(default = "default_import_kind")]
    pub kind: ServerKind,
    #[serde(default)]
    pub kinds: BTreeMap<String, ServerKind>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            search_default_locations: false,
            kind: default_import_kind(),
            kinds: BTreeMap::new(),
        }
    }
}

fn default_import_kind() -> ServerKind {
    ServerKind::Filesystem
}

/// Replace `${VAR}` placeholders with environment values. Unknown variables
/// and unterminated placeholders are kept verbatim.
pub fn substitute_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(&substitute_env(content)).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Read, parse and validate `path`, then merge servers from `[import]`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config = parse_config(&content)?;
    crate::import::import_servers(&mut config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let ctx = &config.context;
    if ctx.context_budget_bytes == 0 {
        anyhow::bail!("context.context_budget_bytes must be > 0");
    }
    if ctx.total_gather_timeout_ms == 0 {
        anyhow::bail!("context.total_gather_timeout_ms must be > 0");
    }
    if ctx.default_source_timeout_ms > ctx.total_gather_timeout_ms {
        anyhow::bail!(
            "context.default_source_timeout_ms ({}) must not exceed total_gather_timeout_ms ({})",
            ctx.default_source_timeout_ms,
            ctx.total_gather_timeout_ms
        );
    }
    for (id, ms) in &ctx.source_timeout_ms {
        if *ms > ctx.total_gather_timeout_ms {
            anyhow::bail!(
                "context.source_timeout_ms.\"{}\" ({}) must not exceed total_gather_timeout_ms ({})",
                id,
                ms,
                ctx.total_gather_timeout_ms
            );
        }
    }

    let breaker = &config.breaker;
    if breaker.failure_threshold == 0 {
        anyhow::bail!("breaker.failure_threshold must be >= 1");
    }
    if breaker.max_cooldown_ms < breaker.cooldown_ms {
        anyhow::bail!("breaker.max_cooldown_ms must be >= breaker.cooldown_ms");
    }
    if !(breaker.latency_ema_alpha > 0.0 && breaker.latency_ema_alpha <= 1.0) {
        anyhow::bail!("breaker.latency_ema_alpha must be in (0.0, 1.0]");
    }

    if config.rag.max_chunk_bytes == 0 {
        anyhow::bail!("rag.max_chunk_bytes must be > 0");
    }
    if config.rag.overlap_bytes >= config.rag.max_chunk_bytes {
        anyhow::bail!("rag.overlap_bytes must be smaller than rag.max_chunk_bytes");
    }
    if !(-1.0..=1.0).contains(&config.rag.min_score) {
        anyhow::bail!("rag.min_score must be in [-1.0, 1.0]");
    }

    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" | "ollama" => {
            if embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    embedding.provider
                );
            }
            if embedding.dims.is_none() {
                anyhow::bail!(
                    "embedding.dims must be specified when provider is '{}'",
                    embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or disabled.",
            other
        ),
    }
    if embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    let mut names = HashSet::new();
    for server in &config.servers {
        if server.name.trim().is_empty() {
            anyhow::bail!("servers: every server needs a non-empty name");
        }
        if !names.insert(server.name.as_str()) {
            anyhow::bail!("servers: duplicate server name '{}'", server.name);
        }
        if server.command.trim().is_empty() {
            anyhow::bail!("servers.{}: command must not be empty", server.name);
        }
    }

    Ok(())
}
