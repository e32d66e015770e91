use std::{
    cell::RefCell,
    net::SocketAddr,
    path::PathBuf,
    process::ExitCode,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use netfs_fs::{DEFAULT_PROTOCOL, LocalBackend};
use netfs_server::NetfsServer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Serve directory trees over the netfs wire protocol.
#[derive(Parser, Debug)]
#[command(name = "netfs-server", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:7070")]
    listen: SocketAddr,
    /// Directory served under the default `file` protocol.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Extra mounts as `protocol=path` pairs.
    #[arg(long = "mount", value_name = "PROTO=PATH")]
    mounts: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netfs_server=info,netfs_fs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "server failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))?;

    let mut server = NetfsServer::bind(args.listen)?;
    server.register_backend(
        DEFAULT_PROTOCOL,
        Rc::new(RefCell::new(LocalBackend::new(args.root.clone())?)),
    )?;
    for mount in &args.mounts {
        let Some((protocol, path)) = mount.split_once('=') else {
            return Err(format!("bad mount spec {mount:?}, expected PROTO=PATH").into());
        };
        server.register_backend(protocol, Rc::new(RefCell::new(LocalBackend::new(path)?)))?;
    }

    info!(addr = %server.local_addr(), root = %args.root.display(), "netfs server up");
    server.run_until(&stop)?;
    info!("shutting down");
    Ok(())
}
