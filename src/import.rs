//! Importing resource servers from `mcpServers` JSON files.
//!
//! Editors and desktop clients describe their servers in JSON. Two layouts
//! are understood:
//!
//! ```json
//! { "mcpServers": { "git": { "command": "mcp-server-git", "args": ["--repository", "."] } } }
//! { "servers":    { "git": { "type": "stdio", "command": "mcp-server-git" } } }
//! ```
//!
//! The first is used by MCPHub, Cursor and Claude Desktop, the second by
//! VS Code. Before parsing, `${env:VAR}` is replaced from the environment
//! (unset variables become empty); a leading `~` in `command`, `args` and
//! `env` values expands to the home directory. Entries with a `url` instead
//! of a `command` are remote servers and are skipped.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{
    default_max_resources, default_request_timeout, Config, ImportConfig, ServerConfig,
};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServerEntry {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        disabled: bool,
    },
    Remote {
        url: String,
    },
}

#[derive(Debug, Deserialize)]
struct ServersFile {
    #[serde(rename = "mcpServers")]
    mcp_servers: Option<BTreeMap<String, ServerEntry>>,
    servers: Option<BTreeMap<String, ServerEntry>>,
}

/// Well-known locations, project files first.
pub fn default_locations(home: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from(".mcphub/servers.json"),
        PathBuf::from(".vscode/mcp.json"),
        PathBuf::from(".cursor/mcp.json"),
    ];
    if let Some(home) = home {
        paths.push(home.join(".config/mcphub/servers.json"));
        paths.push(home.join(".config/mcp/servers.json"));
        paths.push(home.join(".cursor/mcp.json"));
        if cfg!(target_os = "macos") {
            paths.push(home.join("Library/Application Support/Claude/claude_desktop_config.json"));
        } else {
            paths.push(home.join(".config/Claude/claude_desktop_config.json"));
        }
    }
    paths
}

/// Replace `${env:VAR}` references. Unset variables expand to nothing.
pub fn expand_env_refs(input: &str) -> String {
    const OPEN: &str = "${env:";
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => warn!(variable = name, "environment variable not set"),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn expand_home(value: &str, home: Option<&Path>) -> String {
    match (value.strip_prefix('~'), home) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            format!("{}{}", home.display(), rest)
        }
        _ => value.to_string(),
    }
}

/// Parse one servers file into server configs.
pub fn parse_servers(
    content: &str,
    import: &ImportConfig,
    home: Option<&Path>,
) -> Result<Vec<ServerConfig>> {
    let file: ServersFile = serde_json::from_str(&expand_env_refs(content))
        .context("not a JSON servers file")?;
    let entries = match (file.mcp_servers, file.servers) {
        (Some(entries), _) | (None, Some(entries)) => entries,
        (None, None) => bail!("no \"mcpServers\" or \"servers\" object"),
    };

    let mut servers = Vec::new();
    for (name, entry) in entries {
        match entry {
            ServerEntry::Stdio {
                command,
                args,
                env,
                disabled,
            } => {
                if command.trim().is_empty() {
                    warn!(server = %name, "skipping imported server with empty command");
                    continue;
                }
                servers.push(ServerConfig {
                    kind: import.kinds.get(&name).copied().unwrap_or(import.kind),
                    command: expand_home(&command, home),
                    args: args.iter().map(|a| expand_home(a, home)).collect(),
                    env: env
                        .into_iter()
                        .map(|(k, v)| (k, expand_home(&v, home)))
                        .collect(),
                    disabled,
                    max_resources: default_max_resources(),
                    request_timeout_ms: default_request_timeout(),
                    tool: None,
                    name,
                });
            }
            ServerEntry::Remote { url } => {
                warn!(
                    server = %name,
                    url = %url,
                    "skipping remote server; only stdio servers are supported"
                );
            }
        }
    }
    Ok(servers)
}

pub fn load_servers_file(path: &Path, import: &ImportConfig) -> Result<Vec<ServerConfig>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read servers file: {}", path.display()))?;
    parse_servers(&content, import, dirs::home_dir().as_deref())
        .with_context(|| format!("Failed to parse servers file: {}", path.display()))
}

/// Merge servers from `config.import` into `config.servers`. Returns how many
/// were added.
pub fn import_servers(config: &mut Config) -> Result<usize> {
    let import = config.import.clone();
    let mut files = import.files.clone();
    if import.search_default_locations {
        let home = dirs::home_dir();
        match default_locations(home.as_deref()).into_iter().find(|p| p.exists()) {
            Some(found) => files.push(found),
            None => debug!("no servers file in the default locations"),
        }
    }

    let mut added = 0;
    for path in files {
        for server in load_servers_file(&path, &import)? {
            if config.servers.iter().any(|s| s.name == server.name) {
                debug!(
                    server = %server.name,
                    file = %path.display(),
                    "already configured; import skipped"
                );
                continue;
            }
            config.servers.push(server);
            added += 1;
        }
        info!(file = %path.display(), "imported resource servers");
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, ServerKind};

    #[test]
    fn parses_mcp_servers_layout() {
        let import = ImportConfig {
            kinds: BTreeMap::from([("git".to_string(), ServerKind::VersionControl)]),
            ..ImportConfig::default()
        };
        let servers = parse_servers(
            r#"{
                "mcpServers": {
                    "git": { "command": "mcp-server-git", "args": ["--repository", "~/src/app"] },
                    "fs": { "command": "~/bin/fs-server", "env": { "ROOT": "~" }, "disabled": true },
                    "remote": { "url": "https://example.invalid/mcp" }
                },
                "globalShortcut": "Ctrl+Space"
            }"#,
            &import,
            Some(Path::new("/home/dev")),
        )
        .unwrap();

        assert_eq!(servers.len(), 2);
        let fs = &servers[0];
        assert_eq!(fs.name, "fs");
        assert_eq!(fs.kind, ServerKind::Filesystem);
        assert_eq!(fs.command, "/home/dev/bin/fs-server");
        assert_eq!(fs.env["ROOT"], "/home/dev");
        assert!(fs.disabled);
        let git = &servers[1];
        assert_eq!(git.kind, ServerKind::VersionControl);
        assert_eq!(git.args, vec!["--repository", "/home/dev/src/app"]);
        assert_eq!(git.source_id().as_str(), "mcp:git");
    }

    #[test]
    fn parses_vscode_layout() {
        let servers = parse_servers(
            r#"{ "servers": { "docs": { "type": "stdio", "command": "docs-server" } } }"#,
            &ImportConfig::default(),
            None,
        )
        .unwrap();
        assert_eq!(servers[0].name, "docs");
        assert_eq!(servers[0].command, "docs-server");
    }

    #[test]
    fn rejects_unknown_layout() {
        let err = parse_servers(r#"{ "other": {} }"#, &ImportConfig::default(), None).unwrap_err();
        assert!(err.to_string().contains("mcpServers"));
    }

    #[test]
    fn expands_env_references() {
        std::env::set_var("CTXD_IMPORT_TEST_TOKEN", "s3cret");
        assert_eq!(expand_env_refs("a ${env:CTXD_IMPORT_TEST_TOKEN} b"), "a s3cret b");
        std::env::remove_var("CTXD_IMPORT_TEST_TOKEN");
        assert_eq!(expand_env_refs("${env:CTXD_IMPORT_SURELY_UNSET}"), "");
        assert_eq!(expand_env_refs("${HOME} ${env:open"), "${HOME} ${env:open");
    }

    #[test]
    fn tilde_only_expands_as_a_prefix() {
        let home = Some(Path::new("/home/dev"));
        assert_eq!(expand_home("~/x", home), "/home/dev/x");
        assert_eq!(expand_home("~user/x", home), "~user/x");
        assert_eq!(expand_home("a~/x", home), "a~/x");
        assert_eq!(expand_home("~/x", None), "~/x");
    }

    #[test]
    fn declared_servers_win_over_imported() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mcp.json");
        std::fs::write(
            &file,
            r#"{ "mcpServers": {
                "git": { "command": "imported-git" },
                "docs": { "command": "docs-server" }
            } }"#,
        )
        .unwrap();
        let mut config = parse_config(&format!(
            r#"
[[servers]]
name = "git"
kind = "version_control"
command = "mcp-server-git"

[import]
files = ["{}"]
kind = "documentation"
"#,
            file.display()
        ))
        .unwrap();

        assert_eq!(import_servers(&mut config).unwrap(), 1);
        let names: Vec<&str> = config.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["git", "docs"]);
        assert_eq!(config.servers[0].command, "mcp-server-git");
        assert_eq!(config.servers[1].kind, ServerKind::Documentation);
    }

    #[test]
    fn missing_listed_file_is_an_error() {
        let mut config = Config::default();
        config.import.files = vec![PathBuf::from("/definitely/not/here/mcp.json")];
        assert!(import_servers(&mut config).is_err());
    }

    #[test]
    fn default_locations_cover_editors_and_desktop() {
        let paths = default_locations(Some(Path::new("/home/dev")));
        assert_eq!(paths[1], PathBuf::from(".vscode/mcp.json"));
        assert!(paths.contains(&PathBuf::from("/home/dev/.config/mcphub/servers.json")));
        assert!(paths.iter().any(|p| p.ends_with("claude_desktop_config.json")));
        assert_eq!(default_locations(None).len(), 3);
    }
}
