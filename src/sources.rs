use anyhow::Result;
use serde::Serialize;

use context_daemon_core::{SourceId, SourceKind};

use crate::config::{Config, BUFFER_SOURCE, SEMANTIC_SOURCE};

/// One configured source, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub id: SourceId,
    pub kind: SourceKind,
    pub cached: bool,
    pub enabled: bool,
}

/// Sources the daemon registers for `config`, in registration order.
pub fn configured_sources(config: &Config) -> Vec<SourceInfo> {
    let ttls = config.cache.ttls();
    let info = |id: SourceId, kind: SourceKind| SourceInfo {
        enabled: config.context.is_enabled(&id),
        cached: ttls.ttl_for(kind.cache_class()).is_some(),
        id,
        kind,
    };

    let mut sources = vec![info(SourceId::new(BUFFER_SOURCE), SourceKind::Buffer)];
    for server in config.servers.iter().filter(|s| !s.disabled) {
        sources.push(info(server.source_id(), server.kind.source_kind()));
    }
    if config.embedding.is_enabled() {
        sources.push(info(SourceId::new(SEMANTIC_SOURCE), SourceKind::SemanticIndex));
    }
    sources
}

pub fn list_sources(config: &Config) -> Result<()> {
    println!("{:<24} {:<16} {:<8} ENABLED", "SOURCE", "KIND", "CACHED");
    for source in configured_sources(config) {
        println!(
            "{:<24} {:<16} {:<8} {}",
            source.id.as_str(),
            source.kind.to_string(),
            source.cached,
            source.enabled
        );
    }

    let disabled: Vec<&str> = config
        .servers
        .iter()
        .filter(|s| s.disabled)
        .map(|s| s.name.as_str())
        .collect();
    if !disabled.is_empty() {
        println!();
        println!("disabled servers: {}", disabled.join(", "));
    }

    Ok(())
}
