//! KVS server replica executable.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::sync::watch;

use paxkv::{pf_error, KvsReplica, PaxkvError, ReplicaId};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Replica ID of myself.
    #[arg(short, long)]
    id: ReplicaId,

    /// Key-value API port open to clients.
    #[arg(short, long, default_value_t = 52700)]
    api_port: u16,

    /// List of replica peer endpoints, the order of which maps to replica
    /// IDs. Example: '-r host1:port1 -r host2:port2 -r host3:port3'.
    #[arg(short, long)]
    replicas: Vec<SocketAddr>,

    /// Configuration string in TOML format, e.g.
    /// "storage_root = '/data/sst'\nlog_root = '/data/logs'".
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitizes command line arguments, returning my peer address on
    /// success.
    fn sanitize(&self) -> Result<SocketAddr, PaxkvError> {
        let mut replicas_set = HashSet::new();
        for addr in self.replicas.iter() {
            if replicas_set.contains(addr) {
                return Err(PaxkvError(format!(
                    "duplicate replica address '{}' given",
                    addr
                )));
            }
            replicas_set.insert(addr);
        }

        if (self.id as usize) >= self.replicas.len() {
            return Err(PaxkvError(format!(
                "invalid replica ID {} / {}",
                self.id,
                self.replicas.len()
            )));
        }
        let my_addr = self.replicas[self.id as usize];

        if self.api_port <= 1024 {
            Err(PaxkvError(format!("invalid api_port {}", self.api_port)))
        } else if self.api_port == my_addr.port() {
            Err(PaxkvError(format!(
                "api_port == peer port {}",
                self.api_port
            )))
        } else if self.threads < 2 {
            Err(PaxkvError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(my_addr)
        }
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), PaxkvError> {
    let args = CliArgs::parse();
    let p2p_addr = args.sanitize()?;

    let mut peer_addrs = HashMap::new();
    for (id, &addr) in args.replicas.iter().enumerate() {
        let id = id as ReplicaId;
        if id != args.id {
            peer_addrs.insert(id, addr);
        }
    }

    let api_addr: SocketAddr =
        SocketAddr::new(p2p_addr.ip(), args.api_port);

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-replica{}", args.id))
        .build()?;

    runtime.block_on(async move {
        let mut replica = KvsReplica::new_and_setup(
            args.id,
            args.replicas.len() as ReplicaId,
            api_addr,
            p2p_addr,
            peer_addrs,
            args.config.as_deref(),
        )
        .await?;

        // the standalone executable runs until killed
        let (_tx_term, rx_term) = watch::channel(false);
        replica.run(rx_term).await?;

        Ok::<(), PaxkvError>(())
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server"; "server_main exited: {}", e);
    }
}

#[cfg(test)]
mod server_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), PaxkvError> {
        let args = CliArgs {
            id: 1,
            api_port: 52701,
            replicas: vec![
                "127.0.0.1:52800".parse()?,
                "127.0.0.1:52801".parse()?,
            ],
            config: None,
            threads: 4,
        };
        assert_eq!(args.sanitize()?, "127.0.0.1:52801".parse()?);
        Ok(())
    }

    #[test]
    fn sanitize_invalid_api_port() -> Result<(), PaxkvError> {
        let args = CliArgs {
            id: 0,
            api_port: 1023,
            replicas: vec!["127.0.0.1:52800".parse()?],
            config: None,
            threads: 4,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_api_peer_port_clash() -> Result<(), PaxkvError> {
        let args = CliArgs {
            id: 0,
            api_port: 52800,
            replicas: vec!["127.0.0.1:52800".parse()?],
            config: None,
            threads: 4,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_duplicate_replica() -> Result<(), PaxkvError> {
        let args = CliArgs {
            id: 0,
            api_port: 52700,
            replicas: vec![
                "127.0.0.1:52800".parse()?,
                "127.0.0.1:52800".parse()?,
            ],
            config: None,
            threads: 4,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_id() -> Result<(), PaxkvError> {
        let args = CliArgs {
            id: 2,
            api_port: 52700,
            replicas: vec![
                "127.0.0.1:52800".parse()?,
                "127.0.0.1:52801".parse()?,
            ],
            config: None,
            threads: 4,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), PaxkvError> {
        let args = CliArgs {
            id: 0,
            api_port: 52700,
            replicas: vec!["127.0.0.1:52800".parse()?],
            config: None,
            threads: 1,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
