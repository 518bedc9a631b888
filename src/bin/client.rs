//! One-shot command line client for the KVS.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

use env_logger::Env;

use tokio::runtime::Builder;

use paxkv::{
    pf_error, CtrlReply, CtrlRequest, CtrlStub, KvsClient, PaxkvError,
    ReplicaId, NO_LOCK,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Replica API endpoints of one cluster, comma-separated; pass the
    /// flag multiple times for multiple clusters. Required for key-value
    /// operations. Example: '-c h1:p1,h2:p2,h3:p3 -c h4:p4,h5:p5,h6:p6'.
    #[arg(short, long)]
    cluster: Vec<String>,

    /// Lock token to carry on the operation.
    #[arg(short, long, default_value = NO_LOCK)]
    lock_id: String,

    #[command(subcommand)]
    op: OpCommand,
}

#[derive(Subcommand, Debug)]
enum OpCommand {
    /// Put a cell value.
    Put {
        row: String,
        col: String,
        value: String,
    },

    /// Conditionally put a cell value.
    Cput {
        row: String,
        col: String,
        old_value: String,
        new_value: String,
    },

    /// Get a cell value.
    Get { row: String, col: String },

    /// Delete a cell.
    Delete { row: String, col: String },

    /// Acquire a row lock; prints the token.
    Setnx { row: String },

    /// Enumerate all rows.
    Rows,

    /// Enumerate the columns of a row.
    Cols { row: String },

    /// Ask a host controller to start a replica.
    CtlStart {
        ctrl_addr: SocketAddr,
        index: ReplicaId,
        replicas: Vec<SocketAddr>,
    },

    /// Ask a host controller to stop a replica.
    CtlStop {
        ctrl_addr: SocketAddr,
        addr: SocketAddr,
    },

    /// List the replicas running on a host.
    CtlList { ctrl_addr: SocketAddr },

    /// Stop all replicas running on a host.
    CtlKillAll { ctrl_addr: SocketAddr },
}

async fn run_ctl_op(
    ctrl_addr: SocketAddr,
    req: CtrlRequest,
) -> Result<(), PaxkvError> {
    let mut stub = CtrlStub::new_by_connect(ctrl_addr).await?;
    match stub.call(&req).await? {
        CtrlReply::Start { status } | CtrlReply::Stop { status } => {
            println!("{:?}", status)
        }
        CtrlReply::GetAll { addrs } => {
            for addr in addrs {
                println!("{}", addr);
            }
        }
        CtrlReply::KillAll { stopped } => println!("stopped {}", stopped),
    }
    Ok(())
}

/// Parses each `-c` occurrence into that cluster's endpoint list.
fn parse_clusters(
    args: &[String],
) -> Result<Vec<Vec<SocketAddr>>, PaxkvError> {
    let mut clusters = Vec::new();
    for cluster in args {
        let endpoints = cluster
            .split(',')
            .map(|addr| addr.trim().parse::<SocketAddr>())
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(PaxkvError::msg("empty cluster endpoint list"));
        }
        clusters.push(endpoints);
    }
    Ok(clusters)
}

async fn run_op(args: CliArgs) -> Result<(), PaxkvError> {
    // controller operations talk to a host controller, not the clusters
    match args.op {
        OpCommand::CtlStart {
            ctrl_addr,
            index,
            replicas,
        } => {
            return run_ctl_op(
                ctrl_addr,
                CtrlRequest::Start { index, replicas },
            )
            .await;
        }
        OpCommand::CtlStop { ctrl_addr, addr } => {
            return run_ctl_op(ctrl_addr, CtrlRequest::Stop { addr }).await;
        }
        OpCommand::CtlList { ctrl_addr } => {
            return run_ctl_op(ctrl_addr, CtrlRequest::GetAll).await;
        }
        OpCommand::CtlKillAll { ctrl_addr } => {
            return run_ctl_op(ctrl_addr, CtrlRequest::KillAll).await;
        }
        _ => {}
    }

    if args.cluster.is_empty() {
        return Err(PaxkvError::msg(
            "key-value operations require at least one -c cluster",
        ));
    }
    let mut client = KvsClient::new(parse_clusters(&args.cluster)?);
    let lock_id = &args.lock_id;

    match args.op {
        OpCommand::Put { row, col, value } => {
            let ok =
                client.put(&row, &col, value.as_bytes(), lock_id).await?;
            println!("{}", if ok { "OK" } else { "DENIED" });
        }
        OpCommand::Cput {
            row,
            col,
            old_value,
            new_value,
        } => {
            let ok = client
                .cput(
                    &row,
                    &col,
                    old_value.as_bytes(),
                    new_value.as_bytes(),
                    lock_id,
                )
                .await?;
            println!("{}", if ok { "OK" } else { "FAILED" });
        }
        OpCommand::Get { row, col } => {
            match client.get(&row, &col, lock_id).await? {
                Some(value) => {
                    println!("{}", String::from_utf8_lossy(&value))
                }
                None => println!("(not found)"),
            }
        }
        OpCommand::Delete { row, col } => {
            let ok = client.delete(&row, &col, lock_id).await?;
            println!("{}", if ok { "OK" } else { "DENIED" });
        }
        OpCommand::Setnx { row } => match client.set_nx(&row).await? {
            Some(token) => println!("{}", token),
            None => println!("(already locked)"),
        },
        OpCommand::Rows => {
            let mut rows = client.get_all_rows().await?;
            rows.sort();
            rows.dedup();
            for row in rows {
                println!("{}", row);
            }
        }
        OpCommand::Cols { row } => {
            let mut cols = client.get_cols_in_row(&row, lock_id).await?;
            cols.sort();
            cols.dedup();
            for col in cols {
                println!("{}", col);
            }
        }

        // controller operations returned above
        OpCommand::CtlStart { .. }
        | OpCommand::CtlStop { .. }
        | OpCommand::CtlList { .. }
        | OpCommand::CtlKillAll { .. } => unreachable!(),
    }

    client.leave().await
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    let args = CliArgs::parse();
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-client")
        .build()
        .expect("failed to build tokio runtime");

    if let Err(e) = runtime.block_on(run_op(args)) {
        pf_error!("client"; "operation failed: {}", e);
    }
}
