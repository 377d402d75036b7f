use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::protocol::PermissionLevel;

#[derive(Parser, Debug)]
#[command(name = "drivelite")]
#[command(about = "Private versioned file storage over TCP", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Host to bind (serve) or connect to (client commands)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port (default: DRIVELITE_PORT or 9000)
    #[arg(long, short = 'p', global = true)]
    pub port: Option<u16>,

    /// Connect over TLS (client commands)
    #[arg(long, global = true)]
    pub tls: bool,

    /// Disable progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

/// Credentials for commands that need a session. The password falls back
/// to DRIVELITE_PASSWORD so it stays out of shell history.
#[derive(clap::Args, Debug, Clone)]
pub struct Credentials {
    /// Account email
    #[arg(long, short = 'e')]
    pub email: String,

    /// Account password
    #[arg(long)]
    pub password: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the storage server
    Serve {
        /// Storage directory (overrides DRIVELITE_STORAGE_PATH)
        #[arg(long, short = 's')]
        storage: Option<PathBuf>,

        /// Maximum concurrent clients (overrides DRIVELITE_MAX_CLIENTS)
        #[arg(long)]
        max_clients: Option<usize>,
    },

    /// Check that a server answers
    Ping,

    /// Create an account
    Register {
        #[command(flatten)]
        credentials: Credentials,

        /// Name shown to people you share with
        #[arg(long, short = 'n')]
        name: String,
    },

    /// Upload a file as a new file
    Upload {
        /// File to upload
        path: PathBuf,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Upload a file as the next version of an existing file
    NewVersion {
        /// Id of the file to extend
        file_id: u64,

        /// File holding the new contents
        path: PathBuf,

        /// Short description of the change
        #[arg(long)]
        note: Option<String>,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Download a file
    Download {
        /// Id of the file to fetch
        file_id: u64,

        /// Version to fetch (default: current)
        #[arg(long)]
        version: Option<u32>,

        /// Output path (default: the stored file name)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// List your files and the files shared with you
    List {
        #[command(flatten)]
        credentials: Credentials,
    },

    /// Give another account access to one of your files
    Share {
        /// Id of the file to share
        file_id: u64,

        /// Email of the account to share with
        target: String,

        /// VIEW or EDIT
        #[arg(long, short = 'l', default_value = "VIEW")]
        level: PermissionLevel,

        #[command(flatten)]
        credentials: Credentials,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_args() {
        let cli = Cli::try_parse_from([
            "drivelite", "--host", "files.local", "download", "7", "--version", "2", "-e", "a@b.co",
        ])
        .unwrap();
        assert_eq!(cli.host.as_deref(), Some("files.local"));
        match cli.command {
            Commands::Download {
                file_id,
                version,
                credentials,
                ..
            } => {
                assert_eq!(file_id, 7);
                assert_eq!(version, Some(2));
                assert_eq!(credentials.email, "a@b.co");
                assert!(credentials.password.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_share_level_parses() {
        let cli = Cli::try_parse_from([
            "drivelite", "share", "3", "bob@example.com", "--level", "edit", "-e", "a@b.co",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Share { level: PermissionLevel::Edit, .. }
        ));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["drivelite", "ping", "-p", "9100", "--tls"]).unwrap();
        assert_eq!(cli.port, Some(9100));
        assert!(cli.tls);
    }
}
