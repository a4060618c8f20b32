//! Ambient configuration: CLI flags (clap) layered over a TOML file and
//! `AGENTBOX_*` environment variables, the way the teacher's CLI config
//! discovery works, minus the task-specific flags it no longer needs.

use crate::env::{
    DEFAULT_BIND_ADDR, DEFAULT_UPLOAD_DIR_NAME, DEFAULT_WORKSPACE_DIR_NAME, ENV_BIND_ADDR,
    ENV_CONTAINER_SOCKET, ENV_UPLOAD_DIR, ENV_WORKSPACE_DIR,
};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "agentbox", about = "Run headless coding agents in sandboxed containers")]
pub struct Args {
    /// Path to a TOML config file. Overrides discovery of ./agentbox.toml.
    #[arg(long, env = "AGENTBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the HTTP server binds to.
    #[arg(long, env = "AGENTBOX_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Root directory for per-Session workspace staging.
    #[arg(long, env = "AGENTBOX_WORKSPACE_DIR")]
    pub workspace_dir: Option<PathBuf>,

    /// Root directory client uploads land in before being copied into a container.
    #[arg(long, env = "AGENTBOX_UPLOAD_DIR")]
    pub upload_dir: Option<PathBuf>,

    /// Container engine socket override (defaults to Docker-then-Podman discovery).
    #[arg(long, env = "AGENTBOX_CONTAINER_SOCKET")]
    pub container_socket: Option<String>,
}

/// Config file schema, every field optional since CLI flags and env vars can
/// supply each one independently.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind_addr: Option<String>,
    workspace_dir: Option<PathBuf>,
    upload_dir: Option<PathBuf>,
    container_socket: Option<String>,
}

/// Fully resolved configuration, precedence CLI flag > env var > config file > default.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub workspace_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub container_socket: Option<String>,
}

impl AppConfig {
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let file_config = match &args.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading config file {path:?}: {e}"))?;
                toml::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("parsing config file {path:?}: {e}"))?
            }
            None => {
                let default_path = PathBuf::from("agentbox.toml");
                if default_path.exists() {
                    let text = std::fs::read_to_string(&default_path)?;
                    toml::from_str(&text)?
                } else {
                    FileConfig::default()
                }
            }
        };

        Ok(Self {
            bind_addr: args
                .bind_addr
                .clone()
                .or(file_config.bind_addr)
                .or_else(|| std::env::var(ENV_BIND_ADDR).ok())
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            workspace_dir: args
                .workspace_dir
                .clone()
                .or(file_config.workspace_dir)
                .or_else(|| std::env::var(ENV_WORKSPACE_DIR).ok().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_DIR_NAME)),
            upload_dir: args
                .upload_dir
                .clone()
                .or(file_config.upload_dir)
                .or_else(|| std::env::var(ENV_UPLOAD_DIR).ok().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR_NAME)),
            container_socket: args
                .container_socket
                .clone()
                .or(file_config.container_socket)
                .or_else(|| std::env::var(ENV_CONTAINER_SOCKET).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_wins_over_default() {
        let args = Args {
            config: None,
            bind_addr: Some("0.0.0.0:9000".to_string()),
            workspace_dir: None,
            upload_dir: None,
            container_socket: None,
        };
        let config = AppConfig::load(&args).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
    }

    #[test]
    fn falls_back_to_defaults_when_nothing_set() {
        let args = Args {
            config: None,
            bind_addr: None,
            workspace_dir: None,
            upload_dir: None,
            container_socket: None,
        };
        let config = AppConfig::load(&args).unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
    }
}
