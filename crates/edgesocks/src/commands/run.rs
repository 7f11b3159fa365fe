use std::path::PathBuf;
use std::sync::Arc;

use edgesocks_proxy::ProxyServer;

use crate::agent;
use crate::cli::RunArgs;
use crate::error::CliError;

pub async fn run(args: RunArgs, cwd: PathBuf) -> Result<(), CliError> {
    // 1. Load config, then apply CLI overrides.
    let mut config = agent::load_config(&args.source, &cwd)?;
    if let Some(ip) = args.listen_ip {
        config.socks5.listen_ip = Some(ip.to_string());
    }
    if let Some(port) = args.port {
        config.socks5.listen_port = Some(port);
    }
    if let Some(name) = args.node_name {
        config.socks5.node_name = Some(name);
    }

    if !config.socks5.enabled() {
        tracing::info!("SOCKS5 proxy is disabled (socks5.enable = false)");
        println!("edgesocks: SOCKS5 proxy disabled, nothing to do");
        return Ok(());
    }
    config.validate()?;

    // 2. Build collaborators and start.
    let proxy_config = agent::proxy_config(&config)?;
    let node_name = proxy_config.node_name.clone();
    let lister = agent::pod_lister(&config);
    if lister.is_empty() {
        tracing::warn!("no [[discovery.pods]] configured; every destination will be unresolvable");
    }
    let server = ProxyServer::new(
        proxy_config,
        Arc::new(lister),
        Arc::new(agent::transport(&config)),
    )?;
    let handle = server.start().await?;

    println!(
        "edgesocks: listening on {} (node {node_name})",
        handle.local_addr()
    );

    // 3. Serve until Ctrl-C, then drain.
    tokio::signal::ctrl_c().await?;
    tracing::info!(active = handle.active_connections(), "shutdown requested");
    handle.shutdown().await?;
    Ok(())
}
