use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use edgesocks_proxy::ProxyServer;
use edgesocks_settings::ConfigLoader;

use crate::agent;
use crate::cli::ConfigSource;
use crate::error::CliError;

pub async fn check(source: ConfigSource, cwd: PathBuf) -> Result<(), CliError> {
    let mut all_ok = true;

    // 1. Platform info
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);

    // 2. Config files
    println!("\nConfig files:");
    if source.no_config {
        println!("  (skipped: --no-config)");
    } else {
        for path in [
            ConfigLoader::global_config_path(),
            ConfigLoader::project_config_path(&cwd),
        ] {
            let status = if path.exists() { "found" } else { "not found" };
            println!("  {} ({})", path.display(), status);
        }
    }
    if let Some(ref extra) = source.extra_config {
        let status = if extra.exists() { "found" } else { "not found" };
        println!("  {} ({})", extra.display(), status);
    }

    // 3. Validation
    let config = match agent::load_config(&source, &cwd) {
        Ok(config) => config,
        Err(e) => {
            println!("\nConfig loaded: FAIL - {e}");
            return Err(CliError::Other("One or more checks failed".to_string()));
        }
    };
    print!("\nConfig valid: ");
    let validated = config
        .validate()
        .map_err(CliError::from)
        .and_then(|()| agent::proxy_config(&config));
    let proxy_config = match validated {
        Ok(proxy_config) => {
            println!("OK (node {})", proxy_config.node_name);
            Some(proxy_config)
        }
        Err(e) => {
            println!("FAIL - {e}");
            all_ok = false;
            None
        }
    };
    println!("Static agent pods: {}", config.discovery.pods.len());

    // 4. Listener smoke-test (configured address, ephemeral port)
    if let Some(mut proxy_config) = proxy_config {
        proxy_config.bind_addr = SocketAddr::new(proxy_config.bind_addr.ip(), 0);
        print!("Listener ({}): ", proxy_config.bind_addr.ip());
        let server = ProxyServer::new(
            proxy_config,
            Arc::new(agent::pod_lister(&config)),
            Arc::new(agent::transport(&config)),
        );
        match server {
            Ok(server) => match server.start().await {
                Ok(handle) => match handle.shutdown().await {
                    Ok(()) => println!("OK"),
                    Err(e) => {
                        println!("FAIL (shutdown) - {e}");
                        all_ok = false;
                    }
                },
                Err(e) => {
                    println!("FAIL (start) - {e}");
                    all_ok = false;
                }
            },
            Err(e) => {
                println!("FAIL (init) - {e}");
                all_ok = false;
            }
        }
    }

    if !all_ok {
        return Err(CliError::Other("One or more checks failed".to_string()));
    }

    Ok(())
}
