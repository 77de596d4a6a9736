use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use reroute::{config, logging};
use reroute_core::{
    HyperForwarder, Plugin, ProxyPlugin, Server, ServerMode, tls::load_tls_acceptor,
};
use tracing::{debug, error, info, instrument};

#[derive(Parser, Debug)]
#[command(name = "reroute")]
#[command(author, version, about = "Regex routed development reverse proxy")]
struct Args {
    /// Path to the YAML or JSON config file
    #[arg(short, long, env = "REROUTE_CONFIG", default_value = "reroute.yaml")]
    config: PathBuf,

    /// Address to listen on, overrides `server.address`
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run the preview server hooks instead of the dev server ones
    #[arg(long)]
    preview: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match config::load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init_logging_from_env(config.log_level.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let server = match start(&args, &config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start reroute: {:#}", e);
            std::process::exit(1);
        }
    };

    run_server(server).await;
}

#[instrument(name = "reroute_startup", skip_all)]
async fn start(args: &Args, config: &config::Config) -> anyhow::Result<Server> {
    info!("Starting reroute with {}", args.config.display());

    let options = config.proxy_options()?;
    let plugin: Arc<dyn Plugin> =
        Arc::new(ProxyPlugin::new(options, Arc::new(HyperForwarder::new())));

    let tls_acceptor = match &config.server.tls {
        Some(tls) => Some(
            load_tls_acceptor(&tls.certificate, &tls.private_key)
                .context("Failed to set up listener TLS")?,
        ),
        None => None,
    };

    let mode = if args.preview {
        ServerMode::Preview
    } else {
        ServerMode::Dev
    };
    let addr = args.listen.unwrap_or(config.server.address);

    let server = Server::new(
        addr,
        &[plugin],
        mode,
        tls_acceptor,
        config.unclaimed_upgrade_timeout(),
    )
    .await?;

    info!("Server started successfully, accepting connections");
    Ok(server)
}

#[instrument(skip(server))]
async fn run_server(server: Server) {
    loop {
        match server.accept().await {
            Ok(_) => debug!("Accepted new connection"),
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}
