//! Clap option structs for `wsync` and `wsyncd`

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::plan::{Destination, Overrides};

/// Host daemon options. Unset values come from the settings file.
#[derive(Clone, Debug, Parser)]
#[command(name = "wsyncd", version, about = "Serve numbered content folders to wsync clients")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Content root holding the numbered folders
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Settings file (default: <config dir>/settings.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Also write a daily log file into this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Parser)]
#[command(name = "wsync", version, about = "Mirror a host's content folders into Assets/Mods")]
pub struct ClientOpts {
    /// Host address (wsync://host:port or host:port)
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Local Assets root
    #[arg(long, global = true)]
    pub assets: Option<PathBuf>,

    /// Local Mods root
    #[arg(long, global = true)]
    pub mods: Option<PathBuf>,

    /// Send this folder to Mods regardless of its contents (repeatable)
    #[arg(long = "to-mods", value_name = "ID", global = true)]
    pub to_mods: Vec<String>,

    /// Send this folder to Assets regardless of its contents (repeatable)
    #[arg(long = "to-assets", value_name = "ID", global = true)]
    pub to_assets: Vec<String>,

    /// Settings file (default: <config dir>/settings.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Store --server/--assets/--mods in the settings file
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub save: bool,

    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Also write a daily log file into this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Print the reconciliation plan
    Plan {
        /// Include SAME rows
        #[arg(long, action = ArgAction::SetTrue)]
        all: bool,
    },
    /// Transfer NEW/UPDATE files for the given folder or file keys
    Sync {
        keys: Vec<String>,
        /// Every folder in the host's index
        #[arg(long, action = ArgAction::SetTrue, conflicts_with = "keys")]
        all: bool,
    },
    /// Delete local folders (ID) or files (ID/path)
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Delete every local folder/file the host no longer has
    Prune,
}

impl ClientOpts {
    /// `--to-assets` first, then `--to-mods`; the later flag wins for a
    /// folder named by both.
    pub fn overrides(&self) -> Overrides {
        let mut overrides = Overrides::new();
        for id in &self.to_assets {
            overrides.set(id.clone(), Destination::Assets);
        }
        for id in &self.to_mods {
            overrides.set(id.clone(), Destination::Mods);
        }
        overrides
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_sync_args() {
        let opts = ClientOpts::try_parse_from([
            "wsync", "--server", "host:1", "sync", "1", "2/a.crp", "--to-mods", "1",
        ])
        .unwrap();
        assert_eq!(opts.server.as_deref(), Some("host:1"));
        match &opts.command {
            ClientCommand::Sync { keys, all } => {
                assert_eq!(keys, &vec!["1".to_string(), "2/a.crp".to_string()]);
                assert!(!all);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(opts.overrides().get("1"), Some(Destination::Mods));
    }

    #[test]
    fn test_overrides_later_flag_wins() {
        let opts = ClientOpts::try_parse_from([
            "wsync", "--to-assets", "5", "--to-mods", "5", "--to-assets", "6", "prune",
        ])
        .unwrap();
        let o = opts.overrides();
        assert_eq!(o.get("5"), Some(Destination::Mods));
        assert_eq!(o.get("6"), Some(Destination::Assets));
    }

    #[test]
    fn test_delete_requires_keys() {
        assert!(ClientOpts::try_parse_from(["wsync", "delete"]).is_err());
        assert!(ClientOpts::try_parse_from(["wsync", "sync", "--all", "3"]).is_err());
    }

    #[test]
    fn test_daemon_defaults_unset() {
        let opts = DaemonOpts::try_parse_from(["wsyncd"]).unwrap();
        assert!(opts.bind.is_none());
        assert!(opts.root.is_none());
        assert!(!opts.verbose);
    }
}
