use log::{error, info, warn};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use warp::{self, Filter};

use switchyard::config::GatewayConfig;
use switchyard::core::server::{GatewayManager, SharedGateway};
use switchyard::handlers::websocket::handle_gateway_client;

#[tokio::main]
async fn main() {
    // Initialize env
    match dotenvy::dotenv() {
        Ok(_) => info!("Environment variables loaded from .env file"),
        Err(e) => warn!("No .env file loaded: {}", e),
    };

    // Initialize logging
    env_logger::init();

    // Load config; an unusable configuration aborts startup
    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: host={}, port={}, path=/{}, backend={:?}",
        config.host, config.port, config.ws_path, config.backend_type
    );

    let gateway = match GatewayManager::new(config.clone()) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to build gateway: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.clone().start().await {
        error!("Failed to start gateway background tasks: {}", e);
        std::process::exit(1);
    }

    // WebSocket upgrade route. Tenant resolution here is deliberately
    // simple (query parameter); deployments front this with their own
    // resolution mechanism.
    let ws_route = warp::path(config.ws_path.clone())
        .and(warp::ws())
        .and(warp::addr::remote())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_gateway(gateway.clone()))
        .map(
            |ws: warp::ws::Ws,
             addr: Option<SocketAddr>,
             query: HashMap<String, String>,
             gateway: SharedGateway| {
                let tenant_id = query
                    .get("tenant")
                    .cloned()
                    .unwrap_or_else(|| "default".to_string());
                let token = query.get("token").cloned();
                let remote_ip = addr.map(|a| a.ip());
                ws.on_upgrade(move |socket| {
                    handle_gateway_client(socket, remote_ip, tenant_id, token, gateway)
                })
            },
        );

    let health_route = warp::path("health")
        .and(with_gateway(gateway.clone()))
        .and_then(health_handler);

    let stats_route = warp::path("stats")
        .and(with_gateway(gateway.clone()))
        .and_then(stats_handler);

    let routes = ws_route.or(health_route).or(stats_route);

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse listen address: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting switchyard gateway on {}", addr);

    // On shutdown: refuse new connections, drain, then force-close the
    // remaining sessions so the server can finish its open connections.
    let shutdown_gateway = gateway.clone();
    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received; refusing new connections");
        shutdown_gateway.shutdown().await;
    });

    server.await;
    info!("Gateway stopped");
}

// Helper to include the gateway in request handling
fn with_gateway(
    gateway: SharedGateway,
) -> impl Filter<Extract = (SharedGateway,), Error = Infallible> + Clone {
    warp::any().map(move || gateway.clone())
}

async fn health_handler(gateway: SharedGateway) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&gateway.health_check().await))
}

async fn stats_handler(gateway: SharedGateway) -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&gateway.get_stats().await))
}
