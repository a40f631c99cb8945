use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};

use blobferry_model::{BlobRef, TransferId, TransferState};

#[derive(Debug, Parser)]
#[command(name = "blobferry", version, about = "Resumable chunked blob transfers")]
pub struct Cli {
    /// Directory acting as the remote blob store
    #[arg(long = "remote-root", global = true, default_value = "blobferry-remote")]
    pub remote_root: PathBuf,

    /// Manager configuration file (TOML); created with defaults if missing
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload a local file to <container>/<blob>
    Upload {
        file: PathBuf,
        #[arg(value_parser = parse_blob)]
        target: BlobRef,
    },
    /// Download <container>/<blob> into a local file
    Download {
        #[arg(value_parser = parse_blob)]
        source: BlobRef,
        file: PathBuf,
    },
    /// List every transfer recorded in the store
    List {
        #[arg(long)]
        state: Option<StateArg>,
    },
    /// Resume one transfer, or every paused and failed one
    Resume { id: Option<TransferId> },
    Pause { id: TransferId },
    Cancel { id: TransferId },
    /// Cancel a transfer and forget it
    Remove { id: TransferId },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StateArg {
    Pending,
    InProgress,
    Paused,
    Failed,
    Complete,
    Canceled,
}

impl From<StateArg> for TransferState {
    fn from(s: StateArg) -> Self {
        match s {
            StateArg::Pending => Self::Pending,
            StateArg::InProgress => Self::InProgress,
            StateArg::Paused => Self::Paused,
            StateArg::Failed => Self::Failed,
            StateArg::Complete => Self::Complete,
            StateArg::Canceled => Self::Canceled,
        }
    }
}

/// Parses `container/blob`. The blob name may itself contain slashes.
fn parse_blob(s: &str) -> anyhow::Result<BlobRef> {
    let (container, name) = s
        .split_once('/')
        .with_context(|| format!("expected <container>/<blob>, got {s:?}"))?;
    if container.is_empty() || name.is_empty() {
        bail!("expected <container>/<blob>, got {s:?}");
    }
    Ok(BlobRef::new(container, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_argument() {
        let blob = parse_blob("photos/2024/a.jpg").unwrap();
        assert_eq!(blob.container, "photos");
        assert_eq!(blob.name, "2024/a.jpg");
        assert!(parse_blob("photos").is_err());
        assert!(parse_blob("/a").is_err());
    }

    #[test]
    fn parses_upload() {
        let cli = Cli::try_parse_from(["blobferry", "upload", "a.bin", "c/a", "--remote-root", "/tmp/r"]).unwrap();
        assert_eq!(cli.remote_root, PathBuf::from("/tmp/r"));
        assert!(matches!(cli.command, Command::Upload { .. }));
    }

    #[test]
    fn list_accepts_finished_states() {
        let cli = Cli::try_parse_from(["blobferry", "list", "--state", "complete"]).unwrap();
        let Command::List { state: Some(state) } = cli.command else {
            panic!("expected list with a state");
        };
        assert_eq!(TransferState::from(state), TransferState::Complete);
    }

    #[test]
    fn rejects_bad_id() {
        assert!(Cli::try_parse_from(["blobferry", "pause", "nope"]).is_err());
    }
}
