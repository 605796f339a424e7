//! Command line for the `ft` binary

use clap::Parser;
use std::path::PathBuf;

use crate::app::Role;
use crate::config::{TransportMode, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::protocol::defaults;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "ft",
    author,
    version,
    about = "File Tunnel - carry TCP and UDP connections through a pair of shared files"
)]
pub struct Args {
    /// File the counterpart writes and this side reads
    #[arg(short, long)]
    pub read: Option<PathBuf>,

    /// File this side writes and the counterpart reads
    #[arg(short, long)]
    pub write: Option<PathBuf>,

    /// Load settings from a TOML file; flags given here take precedence
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// How commands are carried through the files
    #[arg(long, value_enum)]
    pub mode: Option<TransportMode>,

    /// Streaming: purge the write file once it reaches this many bytes (0 = never).
    /// Exchange: maximum size of one file.
    #[arg(long)]
    pub purge_size: Option<u64>,

    /// Milliseconds without contact before the counterpart counts as offline
    #[arg(long = "tunnel-timeout")]
    pub tunnel_timeout_ms: Option<u64>,

    /// Milliseconds spent batching: relayed socket reads are gathered this long
    /// before being forwarded, and in exchange mode commands are collected this
    /// long into one file
    #[arg(long = "read-duration")]
    pub read_duration_ms: Option<u64>,

    /// Exchange: minimum milliseconds between file operations
    #[arg(long = "pace")]
    pub pace_ms: Option<u64>,

    /// Accept TCP connections on this address (host:port)
    #[arg(long, value_name = "ADDR", group = "role")]
    pub tcp_listen: Option<String>,

    /// Connect tunnelled connections to this TCP address
    #[arg(long, value_name = "ADDR", group = "role")]
    pub tcp_connect: Option<String>,

    /// Accept UDP datagrams on this address
    #[arg(long, value_name = "ADDR", group = "role")]
    pub udp_listen: Option<String>,

    /// Send tunnelled datagrams to this UDP address
    #[arg(long, value_name = "ADDR", group = "role")]
    pub udp_send_to: Option<String>,

    /// Local address datagrams to --udp-send-to are sent from
    #[arg(long, value_name = "ADDR", default_value = defaults::UDP_SEND_FROM)]
    pub udp_send_from: String,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Merge the optional TOML file with the flags and validate the result.
    pub fn resolve(&self) -> Result<(TunnelConfig, Role)> {
        let mut config = match &self.config {
            Some(path) => TunnelConfig::load(path)?,
            None => TunnelConfig::default(),
        };

        if let Some(read) = &self.read {
            config.read = read.clone();
        }
        if let Some(write) = &self.write {
            config.write = write.clone();
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(v) = self.purge_size {
            config.purge_size = v;
        }
        if let Some(v) = self.tunnel_timeout_ms {
            config.tunnel_timeout_ms = v;
        }
        if let Some(v) = self.read_duration_ms {
            config.read_duration_ms = v;
        }
        if let Some(v) = self.pace_ms {
            config.pace_ms = v;
        }
        config.verbose |= self.verbose;
        config.validate()?;

        Ok((config, self.role()?))
    }

    fn role(&self) -> Result<Role> {
        if let Some(bind) = &self.tcp_listen {
            Ok(Role::TcpListen { bind: bind.clone() })
        } else if let Some(target) = &self.tcp_connect {
            Ok(Role::TcpForward {
                target: target.clone(),
            })
        } else if let Some(bind) = &self.udp_listen {
            Ok(Role::UdpListen { bind: bind.clone() })
        } else if let Some(target) = &self.udp_send_to {
            Ok(Role::UdpForward {
                target: target.clone(),
                send_from: self.udp_send_from.clone(),
            })
        } else {
            Err(TunnelError::Config(
                "one of --tcp-listen, --tcp-connect, --udp-listen or --udp-send-to is required"
                    .into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("ft").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn tcp_listen_role() {
        let args = parse(&["-r", "in.dat", "-w", "out.dat", "--tcp-listen", "127.0.0.1:5000"]);
        let (config, role) = args.resolve().unwrap();
        assert_eq!(config.read, PathBuf::from("in.dat"));
        assert_eq!(config.mode, TransportMode::Streaming);
        assert_eq!(
            role,
            Role::TcpListen {
                bind: "127.0.0.1:5000".into()
            }
        );
    }

    #[test]
    fn udp_send_from_defaults() {
        let args = parse(&["-r", "a", "-w", "b", "--udp-send-to", "10.0.0.1:53"]);
        let (_, role) = args.resolve().unwrap();
        assert_eq!(
            role,
            Role::UdpForward {
                target: "10.0.0.1:53".into(),
                send_from: "0.0.0.0:0".into()
            }
        );
    }

    #[test]
    fn roles_are_exclusive() {
        let result = Args::try_parse_from([
            "ft",
            "--tcp-listen",
            "127.0.0.1:1",
            "--tcp-connect",
            "127.0.0.1:2",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn missing_role_is_rejected() {
        let args = parse(&["-r", "a", "-w", "b"]);
        assert!(matches!(args.resolve(), Err(TunnelError::Config(_))));
    }

    #[test]
    fn verbose_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ft.toml");
        std::fs::write(&path, "read = \"x.dat\"\nwrite = \"y.dat\"\nverbose = true\n").unwrap();

        let args = parse(&["--config", path.to_str().unwrap(), "--udp-listen", "0.0.0.0:53"]);
        assert!(!args.verbose);
        let (config, _) = args.resolve().unwrap();
        assert!(config.verbose);
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ft.toml");
        std::fs::write(
            &path,
            "read = \"x.dat\"\nwrite = \"y.dat\"\nmode = \"exchange\"\npace_ms = 25\n",
        )
        .unwrap();

        let args = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--pace",
            "5",
            "--tcp-connect",
            "127.0.0.1:22",
        ]);
        let (config, _) = args.resolve().unwrap();
        assert_eq!(config.read, PathBuf::from("x.dat"));
        assert_eq!(config.mode, TransportMode::Exchange);
        assert_eq!(config.pace_ms, 5);
    }
}
