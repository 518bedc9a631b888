//! Per-host controller executable.

use std::net::SocketAddr;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;

use paxkv::{pf_error, KvsController, PaxkvError};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Control address to listen on for orchestrator requests.
    #[arg(short, long, default_value = "127.0.0.1:40050")]
    ctrl_addr: SocketAddr,

    /// Directory under which per-replica storage and log roots are placed.
    #[arg(short, long, default_value = "/tmp/paxkv")]
    base_dir: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    fn sanitize(&self) -> Result<(), PaxkvError> {
        if self.ctrl_addr.port() <= 1024 {
            Err(PaxkvError(format!(
                "invalid ctrl port {}",
                self.ctrl_addr.port()
            )))
        } else if self.threads < 2 {
            Err(PaxkvError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

// Controller executable main entrance.
fn controller_main() -> Result<(), PaxkvError> {
    let args = CliArgs::parse();
    args.sanitize()?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-controller")
        .build()?;

    runtime.block_on(async move {
        let mut controller =
            KvsController::new_and_setup(args.ctrl_addr, &args.base_dir)
                .await?;
        controller.run().await
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = controller_main() {
        pf_error!("ctrl"; "controller_main exited: {}", e);
    }
}

#[cfg(test)]
mod controller_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), PaxkvError> {
        let args = CliArgs {
            ctrl_addr: "127.0.0.1:40050".parse()?,
            base_dir: "/tmp/paxkv".into(),
            threads: 4,
        };
        assert!(args.sanitize().is_ok());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_port() -> Result<(), PaxkvError> {
        let args = CliArgs {
            ctrl_addr: "127.0.0.1:80".parse()?,
            base_dir: "/tmp/paxkv".into(),
            threads: 4,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
