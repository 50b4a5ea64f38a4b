use log::{error, info};
use std::io;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};

use edgewatch::{AppConfig, AppState, GpioManager};

#[cfg(feature = "mock-gpio")]
use edgewatch::MockGpioBackend;
#[cfg(not(feature = "mock-gpio"))]
use edgewatch::SysfsBackend;

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EDGEWATCH_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string())
}

/// Removes a socket file left behind by a previous run.
fn clear_stale_socket(socket_path: &str) -> io::Result<()> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }
    Ok(())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let path = config_path();
    let config = Arc::new(AppConfig::load_from_file(&path).map_err(io::Error::other)?);
    info!("Loaded config from {path}");

    #[cfg(feature = "mock-gpio")]
    let backend = Arc::new(MockGpioBackend::default());
    #[cfg(not(feature = "mock-gpio"))]
    let backend = {
        let backend = SysfsBackend::new(config.sysfs_root.clone());
        info!("Using sysfs GPIO tree at {}", backend.root().display());
        Arc::new(backend)
    };

    let manager = Arc::new(GpioManager::new(config.clone(), backend).map_err(io::Error::other)?);
    let app_state = AppState {
        manager: Arc::clone(&manager),
    };

    let scope_path = config.http.path.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    });

    let http_cfg = &config.http;
    let (server, bind_addrs) = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            clear_stale_socket(socket_path)?;
            (
                server.bind_uds(socket_path)?.bind_auto_h2c(host)?,
                format!("{socket_path} and {host}"),
            )
        }
        (Some(socket_path), None) => {
            clear_stale_socket(socket_path)?;
            (server.bind_uds(socket_path)?, socket_path.clone())
        }
        (None, Some(host)) => (server.bind_auto_h2c(host)?, host.clone()),
        (None, None) => {
            return Err(io::Error::other(
                "Config error: either 'http.unix_socket' or 'http.host' must be specified",
            ));
        }
    };

    info!("Starting server on {bind_addrs}...");

    let result = server.run().await;

    // actix stops on SIGINT/SIGTERM; leave no pin exported behind
    info!("Server stopped, releasing pins");
    if let Err(e) = manager.cleanup(None) {
        error!("Cleanup failed: {e}");
    }

    result
}
