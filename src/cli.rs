//! Shared CLI helpers and the Clap definitions of both binaries

use anyhow::Result;
use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::logger::LogFormat;

/// Split pattern arguments on `,`, `;` and spaces; empty pieces are dropped.
/// `-m ".c,.h" -m .rs` gives `[".c", ".h", ".rs"]`.
pub fn parse_pattern_list<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| {
            v.as_ref()
                .split(|c| matches!(c, ',' | ';' | ' '))
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Combined binary: serves `--path` unless `--address` names a server to
/// mirror from.
#[derive(Clone, Debug, Default, Parser)]
#[command(
    name = "treesync",
    author,
    version,
    about = "Keep a directory tree mirrored from a peer over TCP"
)]
pub struct SyncArgs {
    /// Local root directory (served, or mirrored into)
    #[arg(short = 'p', long = "path")]
    pub path: Option<PathBuf>,

    /// Server to mirror from (host or host:port); server mode when absent
    #[arg(short = 'a', long)]
    pub address: Option<String>,

    /// Print the filtered file list of --path and exit
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Only include names containing one of these substrings
    #[arg(short = 'm', long = "match", value_name = "LIST", action = ArgAction::Append)]
    pub match_patterns: Vec<String>,

    /// Skip names containing one of these substrings
    #[arg(short = 'i', long = "ignore", value_name = "LIST", action = ArgAction::Append)]
    pub ignore_patterns: Vec<String>,

    /// TCP port
    #[arg(long)]
    pub port: Option<u16>,

    /// Timer tick period
    #[arg(long, value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// TOML config file; flags given here override it
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Append a sync journal to this file
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Journal format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// More diagnostics (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl SyncArgs {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    /// Overlay the flags that were given on top of `cfg`.
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(p) = &self.path {
            cfg.root = p.clone();
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(ms) = self.interval_ms {
            cfg.tick_interval_ms = ms;
        }
        apply_patterns(cfg, &self.match_patterns, &self.ignore_patterns);
        if let Some(p) = &self.log_file {
            cfg.log_file = Some(p.clone());
        }
        if let Some(f) = self.log_format {
            cfg.log_format = f;
        }
    }

    /// Config file (if any) with the flags applied, validated
    pub fn resolve(&self) -> Result<Config> {
        let mut cfg = Config::load_or_default(self.config_path())?;
        self.apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Server-only daemon options
#[derive(Clone, Debug, Default, Parser)]
#[command(name = "treesyncd", author, version, about = "treesync server daemon")]
pub struct DaemonOpts {
    /// Bind address (host:port); 0.0.0.0:55443 by default
    #[arg(long)]
    pub bind: Option<String>,

    /// Root directory to serve
    #[arg(long)]
    pub root: Option<PathBuf>,

    #[arg(short = 'm', long = "match", value_name = "LIST", action = ArgAction::Append)]
    pub match_patterns: Vec<String>,

    #[arg(short = 'i', long = "ignore", value_name = "LIST", action = ArgAction::Append)]
    pub ignore_patterns: Vec<String>,

    #[arg(long, value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Full rescan every N ticks
    #[arg(long, value_name = "N")]
    pub rescan_cycle: Option<u64>,

    #[arg(long, value_name = "N")]
    pub max_connections: Option<usize>,

    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(b) = &self.bind {
            cfg.bind = Some(b.clone());
        }
        if let Some(r) = &self.root {
            cfg.root = r.clone();
        }
        apply_patterns(cfg, &self.match_patterns, &self.ignore_patterns);
        if let Some(ms) = self.interval_ms {
            cfg.tick_interval_ms = ms;
        }
        if let Some(n) = self.rescan_cycle {
            cfg.rescan_cycle = n;
        }
        if let Some(n) = self.max_connections {
            cfg.max_connections = n;
        }
        if let Some(p) = &self.log_file {
            cfg.log_file = Some(p.clone());
        }
    }

    pub fn resolve(&self) -> Result<Config> {
        let mut cfg = Config::load_or_default(self.config.as_deref())?;
        self.apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }
}

// Patterns given on the command line replace those from the config file
fn apply_patterns(cfg: &mut Config, matches: &[String], ignores: &[String]) {
    if !matches.is_empty() {
        cfg.filter.match_patterns = parse_pattern_list(matches);
    }
    if !ignores.is_empty() {
        cfg.filter.ignore_patterns = parse_pattern_list(ignores);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pattern_list() {
        assert_eq!(
            parse_pattern_list(&[".c,.h", " .rs;;.toml ", ""]),
            vec![".c", ".h", ".rs", ".toml"]
        );
        assert!(parse_pattern_list::<&str>(&[]).is_empty());
        assert!(parse_pattern_list(&[",; ,"]).is_empty());
    }

    #[test]
    fn test_sync_args_parse_and_apply() {
        let args = SyncArgs::try_parse_from([
            "treesync", "-p", "/data", "-a", "nas:7000", "-m", ".c,.h", "-m", ".rs", "-i",
            "target/", "--interval-ms", "250", "--log-format", "json", "-vv",
        ])
        .unwrap();
        assert_eq!(args.address.as_deref(), Some("nas:7000"));
        assert_eq!(args.verbose, 2);
        assert!(!args.list);

        let mut cfg = Config::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.root, PathBuf::from("/data"));
        assert_eq!(cfg.tick_interval_ms, 250);
        assert_eq!(cfg.filter.match_patterns, vec![".c", ".h", ".rs"]);
        assert_eq!(cfg.filter.ignore_patterns, vec!["target/"]);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.port, crate::protocol::DEFAULT_PORT);
    }

    #[test]
    fn test_flags_override_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("treesync.toml");
        std::fs::write(&path, "port = 6000\ntick_interval_ms = 500\nignore = [\".git\"]\n").unwrap();
        let args = SyncArgs::try_parse_from([
            "treesync",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "7000",
        ])
        .unwrap();
        let cfg = args.resolve().unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.tick_interval_ms, 500);
        assert_eq!(cfg.filter.ignore_patterns, vec![".git"]);
    }

    #[test]
    fn test_daemon_opts() {
        let opts = DaemonOpts::try_parse_from([
            "treesyncd",
            "--bind",
            "127.0.0.1:9000",
            "--root",
            "/srv",
            "--rescan-cycle",
            "3",
            "--max-connections",
            "4",
        ])
        .unwrap();
        let cfg = opts.resolve().unwrap();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9000");
        assert_eq!(cfg.root, PathBuf::from("/srv"));
        assert_eq!(cfg.rescan_cycle, 3);
        assert_eq!(cfg.max_connections, 4);

        let bad = DaemonOpts::try_parse_from(["treesyncd", "--rescan-cycle", "0"]).unwrap();
        assert!(bad.resolve().is_err());
    }
}
