//! Tool-server (MCP) descriptor validation and the `.mcp.json` style export.

use std::collections::BTreeMap;

use agent_fleet_error::FleetError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::store::{McpServerRecord, McpServerType};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct McpConfigExport {
    pub servers: BTreeMap<String, McpServerEntry>,
}

impl McpConfigExport {
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct McpServerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

pub fn validate_server(
    server_type: McpServerType,
    command: Option<&str>,
    url: Option<&str>,
) -> Result<(), FleetError> {
    let blank = |value: Option<&str>| value.map_or(true, |v| v.trim().is_empty());
    match server_type {
        McpServerType::Stdio if blank(command) => Err(FleetError::InvalidRequest {
            message: "command is required for stdio MCP servers".to_string(),
        }),
        McpServerType::Http | McpServerType::Sse if blank(url) => Err(FleetError::InvalidRequest {
            message: "url is required for http/sse MCP servers".to_string(),
        }),
        _ => Ok(()),
    }
}

/// Projects enabled records into the export shape, keyed by server name.
/// Disabled records are skipped.
pub fn export_config<'a>(servers: impl IntoIterator<Item = &'a McpServerRecord>) -> McpConfigExport {
    let mut export = McpConfigExport::default();
    for server in servers.into_iter().filter(|server| server.enabled) {
        let mut entry = McpServerEntry::default();
        match server.server_type {
            McpServerType::Stdio => {
                entry.command = server.command.clone();
                if !server.args.is_empty() {
                    entry.args = Some(server.args.clone());
                }
            }
            McpServerType::Http | McpServerType::Sse => {
                entry.url = server.url.clone();
            }
        }
        if !server.env.is_empty() {
            entry.env = Some(server.env.clone());
        }
        export.servers.insert(server.name.clone(), entry);
    }
    export
}

/// Export restricted to the names an instance asked for.
pub fn export_for_instance(servers: &[McpServerRecord], names: &[String]) -> McpConfigExport {
    export_config(
        servers
            .iter()
            .filter(|server| names.iter().any(|name| name == &server.name)),
    )
}
