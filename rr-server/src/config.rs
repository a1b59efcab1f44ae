//! Server configuration: CLI flags and environment over an optional TOML file

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rr_adapters::{DemoConfig, OpenF1Config};
use rr_core::generator::GeneratorConfig;
use rr_core::window::{DEFAULT_GAP_MS, DEFAULT_STRIDE_MS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// RaceReplay frame server
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "rr-server", version, about = "Serve interpolated replay frames over HTTP")]
pub struct Args {
    /// Path to a TOML config file
    #[arg(short, long, env = "RR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:9100
    #[arg(long, env = "RR_BIND")]
    pub bind: Option<String>,

    /// Where samples come from
    #[arg(long, value_enum, env = "RR_SOURCE")]
    pub source: Option<SourceKind>,

    /// Base URL of the upstream sample provider
    #[arg(long, env = "RR_UPSTREAM_URL")]
    pub upstream_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Synthetic field of cars, no network needed
    #[default]
    Demo,
    /// OpenF1-style REST provider
    Openf1,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub source: SourceKind,
    /// Stride used when a request names none
    pub default_stride_ms: u64,
    /// Gap tolerance used when a request names none
    pub default_gap_ms: u64,
    /// Answer upstream failures with empty frames and a degraded header
    /// instead of an error status
    pub degrade_on_source_error: bool,
    pub generator: GeneratorConfig,
    pub demo: DemoConfig,
    pub upstream: OpenF1Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9100".to_string(),
            source: SourceKind::Demo,
            default_stride_ms: DEFAULT_STRIDE_MS,
            default_gap_ms: DEFAULT_GAP_MS,
            degrade_on_source_error: true,
            generator: GeneratorConfig::default(),
            demo: DemoConfig::default(),
            upstream: OpenF1Config::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid server config")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// `<config dir>/race-replay/server.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("race-replay").join("server.toml"))
    }

    /// Resolve the effective config: explicit file, else the default file
    /// if present, else built-in defaults; CLI/env values win over both.
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => {
                    info!("Using config file {}", path.display());
                    Self::from_file(&path)?
                }
                None => Self::default(),
            },
        };
        config.apply_overrides(args);
        Ok(config)
    }

    fn apply_overrides(&mut self, args: &Args) {
        if let Some(bind) = &args.bind {
            self.bind = bind.clone();
        }
        if let Some(source) = args.source {
            self.source = source;
        }
        if let Some(url) = &args.upstream_url {
            self.upstream.base_url = url.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.generator.window_pad_ms, 500);
        assert_eq!(config.default_stride_ms, 200);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = ServerConfig::from_toml(
            r#"
bind = "127.0.0.1:8080"
source = "openf1"

[generator]
max_frames_ahead = 32

[upstream]
base_url = "http://localhost:8000/v1"
timeout_ms = 2500
"#,
        )
        .unwrap();

        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.source, SourceKind::Openf1);
        assert_eq!(config.generator.max_frames_ahead, 32);
        assert_eq!(config.generator.point_pad_ms, 300);
        assert_eq!(config.upstream.timeout_ms, 2500);
        assert_eq!(config.upstream.classes, vec!["location".to_string()]);
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        assert!(ServerConfig::from_toml(r#"source = "carrier-pigeon""#).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = ServerConfig::default();
        config.apply_overrides(&Args {
            bind: Some("127.0.0.1:1".to_string()),
            source: Some(SourceKind::Openf1),
            upstream_url: Some("http://mirror/v1".to_string()),
            ..Args::default()
        });
        assert_eq!(config.bind, "127.0.0.1:1");
        assert_eq!(config.source, SourceKind::Openf1);
        assert_eq!(config.upstream.base_url, "http://mirror/v1");
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["rr-server", "--bind", "0.0.0.0:1", "--source", "demo"])
            .unwrap();
        assert_eq!(args.source, Some(SourceKind::Demo));
        assert!(args.config.is_none());
    }
}
