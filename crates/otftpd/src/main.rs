//! otftpd - TFTP server for Project Oberon
//!
//! Serves files to Oberon workstations and emulators. Pointed at a directory
//! inside an `Oberon` tree, a request for `Texts.Mod` is answered with the
//! closest copy between the served directory and the tree's `Lib` directory.

mod logging;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use otftp::{TftpServer, TftpServerConfig, TransferConfig};

use crate::logging::LogConfig;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 69;

#[derive(FromArgs, Debug)]
#[argh(
    description = "otftpd - TFTP server for Project Oberon",
    example = "Serve an Oberon project on the standard port:\n  {command_name} --files-dir ~/Oberon/proj",
    example = "Unprivileged testing with debug logging:\n  {command_name} --host 127.0.0.1 -p 6969 -v",
    example = "Slow link:\n  {command_name} --ack-timeout 2 --conn-timeout 30 -l /var/log/otftpd.log"
)]
struct CliConfig {
    #[argh(
        option,
        description = "address to listen on",
        default = "DEFAULT_HOST.to_string()"
    )]
    host: String,

    #[argh(option, short = 'p', description = "port to listen on", default = "DEFAULT_PORT")]
    port: u16,

    #[argh(option, description = "directory to serve files from (default: current directory)")]
    files_dir: Option<PathBuf>,

    #[argh(
        option,
        description = "seconds to wait for each acknowledgment",
        default = "0.5"
    )]
    ack_timeout: f64,

    #[argh(
        option,
        description = "hard cap in seconds on a whole transfer, however active",
        default = "3.0"
    )]
    conn_timeout: f64,

    #[argh(option, short = 'l', description = "append logs to this file")]
    file_log: Option<PathBuf>,

    #[argh(switch, short = 'v', description = "enable debug logging")]
    verbose: bool,

    #[argh(switch, description = "print version and exit")]
    version: bool,
}

impl CliConfig {
    fn log_config(&self) -> LogConfig {
        LogConfig {
            verbose: self.verbose,
            file: self.file_log.clone(),
        }
    }

    fn into_server_config(self) -> Result<TftpServerConfig> {
        let ack_timeout = parse_timeout("ack-timeout", self.ack_timeout)?;
        let conn_timeout = parse_timeout("conn-timeout", self.conn_timeout)?;
        if ack_timeout > conn_timeout {
            bail!(
                "--ack-timeout ({}s) must not exceed --conn-timeout ({}s)",
                self.ack_timeout,
                self.conn_timeout
            );
        }

        let host: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("Invalid host address: {}", self.host))?;

        let root_directory = match self.files_dir {
            Some(dir) => dir
                .canonicalize()
                .with_context(|| format!("Invalid files directory: {}", dir.display()))?,
            None => std::env::current_dir().context("Failed to determine current directory")?,
        };

        let transfer_config = TransferConfig {
            root_dir: root_directory.clone(),
            ack_timeout,
            conn_timeout,
            local_bind: (!host.is_unspecified()).then_some(host),
        };

        Ok(TftpServerConfig {
            bind_address: SocketAddr::new(host, self.port).to_string(),
            root_directory,
            transfer_config,
        })
    }
}

fn parse_timeout(name: &str, seconds: f64) -> Result<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("--{} must be a positive number of seconds, got {}", name, seconds);
    }
    Duration::try_from_secs_f64(seconds).with_context(|| format!("--{} is out of range: {}", name, seconds))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli_config: CliConfig = argh::from_env();

    if cli_config.version {
        println!("otftpd version: {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    cli_config.log_config().init()?;
    let server_config = cli_config.into_server_config()?;

    let mut server = TftpServer::new(server_config);
    server.bind().await?;
    server.serve(shutdown_signal()).await
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn parse(args: &[&str]) -> CliConfig {
        CliConfig::from_args(&["otftpd"], args).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&[]);
        assert_eq!(cli.host, "0.0.0.0");
        assert_eq!(cli.port, 69);
        assert!(cli.files_dir.is_none());
        assert!(!cli.verbose);
        assert!(!cli.version);

        let config = cli.into_server_config().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:69");
        assert_eq!(config.root_directory, std::env::current_dir().unwrap());
        assert_eq!(config.transfer_config.ack_timeout, Duration::from_millis(500));
        assert_eq!(config.transfer_config.conn_timeout, Duration::from_secs(3));
        assert_eq!(config.transfer_config.local_bind, None);
    }

    #[test]
    fn test_full_command_line() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path().to_str().unwrap();
        let cli = parse(&[
            "--host",
            "127.0.0.1",
            "-p",
            "6969",
            "--files-dir",
            dir,
            "--ack-timeout",
            "0.5",
            "--conn-timeout",
            "2",
            "-l",
            "otftpd.log",
            "-v",
        ]);

        assert_eq!(
            cli.log_config(),
            LogConfig {
                verbose: true,
                file: Some(PathBuf::from("otftpd.log")),
            }
        );

        let config = cli.into_server_config().unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:6969");
        assert_eq!(config.root_directory, temp_dir.path().canonicalize().unwrap());
        assert_eq!(config.transfer_config.root_dir, config.root_directory);
        assert_eq!(config.transfer_config.retry_budget(), 4);
        assert_eq!(config.transfer_config.local_bind, Some("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_help_describes_conn_timeout_as_hard_cap() {
        let early_exit = CliConfig::from_args(&["otftpd"], &["--help"]).unwrap_err();
        assert!(early_exit.status.is_ok());
        assert!(early_exit.output.contains("--conn-timeout"));
        assert!(early_exit.output.contains("hard cap"));
    }

    #[test]
    fn test_version_switch() {
        assert!(parse(&["--version"]).version);
    }

    #[test]
    fn test_ipv6_host() {
        let config = parse(&["--host", "::1", "-p", "1069"]).into_server_config().unwrap();
        assert_eq!(config.bind_address, "[::1]:1069");
    }

    #[test]
    fn test_rejects_invalid_host() {
        let err = parse(&["--host", "localhost"]).into_server_config().unwrap_err();
        assert!(err.to_string().contains("Invalid host address"));
    }

    #[test]
    fn test_rejects_bad_timeouts() {
        assert!(parse(&["--ack-timeout", "0"]).into_server_config().is_err());
        assert!(parse(&["--conn-timeout", "inf"]).into_server_config().is_err());
        assert!(parse(&["--ack-timeout", "NaN"]).into_server_config().is_err());
        assert!(
            parse(&["--ack-timeout", "5", "--conn-timeout", "1"])
                .into_server_config()
                .is_err()
        );
    }

    #[test]
    fn test_rejects_missing_files_dir() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("missing");
        let err = parse(&["--files-dir", missing.to_str().unwrap()])
            .into_server_config()
            .unwrap_err();
        assert!(err.to_string().contains("Invalid files directory"));
    }
}
