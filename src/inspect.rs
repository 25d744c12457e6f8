//! Server inspection commands: talk to configured resource servers directly,
//! outside the gather path, to check what they advertise and return.

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::config::{Config, ServerConfig};
use crate::mcp::StdioResourceClient;
use crate::source_resource::{ResourceClient, ResourceHandle};

/// Enabled servers, or only `name` when given. Naming a disabled server is
/// allowed so it can be checked before enabling it.
pub fn select_servers<'a>(config: &'a Config, name: Option<&str>) -> Result<Vec<&'a ServerConfig>> {
    match name {
        Some(name) => match config.servers.iter().find(|s| s.name == name) {
            Some(server) => Ok(vec![server]),
            None => bail!("no server named '{}' is configured", name),
        },
        None => Ok(config.servers.iter().filter(|s| !s.disabled).collect()),
    }
}

fn client_for(config: &Config, name: &str) -> Result<StdioResourceClient> {
    let server = select_servers(config, Some(name))?[0].clone();
    Ok(StdioResourceClient::new(server))
}

pub async fn list_tools(config: &Config, server: Option<&str>) -> Result<()> {
    for server in select_servers(config, server)? {
        let client = StdioResourceClient::new(server.clone());
        println!("{}:", server.name);
        match client.list_tools().await {
            Ok(tools) if tools.is_empty() => println!("  (no tools)"),
            Ok(tools) => {
                for tool in tools {
                    match tool.description {
                        Some(description) => println!("  {:<28} {}", tool.name, description),
                        None => println!("  {}", tool.name),
                    }
                }
            }
            Err(e) => println!("  error: {}", e),
        }
        client.shutdown().await;
    }
    Ok(())
}

pub async fn list_resources(config: &Config, server: Option<&str>, scope: &str) -> Result<()> {
    for server in select_servers(config, server)? {
        let client = StdioResourceClient::new(server.clone());
        println!("{}:", server.name);
        match client.list_resources(scope).await {
            Ok(handles) if handles.is_empty() => println!("  (no resources)"),
            Ok(handles) => {
                for handle in handles {
                    println!(
                        "  {:<48} {}",
                        handle.uri,
                        handle.mime_type.as_deref().unwrap_or("-")
                    );
                }
            }
            Err(e) => println!("  error: {}", e),
        }
        client.shutdown().await;
    }
    Ok(())
}

pub async fn read_resource(config: &Config, server: &str, uri: &str) -> Result<()> {
    let client = client_for(config, server)?;
    let result = client.read_resource(&ResourceHandle::new(uri)).await;
    client.shutdown().await;
    let bytes = result?;
    match String::from_utf8(bytes) {
        Ok(text) => print!("{}", text),
        Err(e) => println!("<{} bytes of binary content>", e.as_bytes().len()),
    }
    Ok(())
}

/// Call `tool` with `args`, a JSON object (`{}` when omitted).
pub async fn call_tool(
    config: &Config,
    server: &str,
    tool: &str,
    args: Option<&str>,
) -> Result<()> {
    let arguments = parse_arguments(args)?;
    let client = client_for(config, server)?;
    let result = client.call_tool(tool, arguments).await;
    client.shutdown().await;
    println!("{}", String::from_utf8_lossy(&result?));
    Ok(())
}

fn parse_arguments(args: Option<&str>) -> Result<Value> {
    let Some(args) = args else {
        return Ok(Value::Object(Default::default()));
    };
    let value: Value = serde_json::from_str(args).context("--args must be valid JSON")?;
    if !value.is_object() {
        bail!("--args must be a JSON object");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn config() -> Config {
        parse_config(
            r#"
[[servers]]
name = "git"
kind = "version_control"
command = "mcp-server-git"

[[servers]]
name = "old"
kind = "filesystem"
command = "fs-server"
disabled = true
"#,
        )
        .unwrap()
    }

    #[test]
    fn selects_enabled_or_named_servers() {
        let config = config();
        let all: Vec<&str> = select_servers(&config, None)
            .unwrap()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(all, vec!["git"]);
        assert_eq!(select_servers(&config, Some("old")).unwrap()[0].name, "old");
        assert!(select_servers(&config, Some("nope")).is_err());
    }

    #[test]
    fn tool_arguments_must_be_an_object() {
        assert_eq!(parse_arguments(None).unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_arguments(Some(r#"{"query":"rust"}"#)).unwrap()["query"],
            "rust"
        );
        assert!(parse_arguments(Some("[1, 2]")).is_err());
        assert!(parse_arguments(Some("{oops")).is_err());
    }

    #[tokio::test]
    async fn unreachable_server_fails_read() {
        let mut config = config();
        config.servers[0].command = "/definitely/not/a/real/ctxd-server".into();
        config.servers[0].request_timeout_ms = 200;
        assert!(read_resource(&config, "git", "file://a.rs").await.is_err());
    }
}
