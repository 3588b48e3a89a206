//! Teller edge gateway.
//!
//! Routes inbound requests to registered services, discovering them
//! through the registry it also registers itself with.

use std::sync::Arc;

use actix_web::web;
use clap::Parser;
use teller_api::InstanceRegistration;
use teller_client::{DiscoveryClient, DiscoveryConfig, HttpClientConfig, HttpRegistryTransport, TellerHttpClient};
use teller_common::wait_for_shutdown_signal;
use teller_gateway::{
    CircuitBreakerRegistry, GatewayRouter, GatewayState, HttpUpstream, PublicPaths, RateLimiter,
    RouteTable,
};
use teller_server::{Cli, Configuration, startup};
use tracing::{error, info, warn};

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let cli_port = cli.port;
    let configuration = Configuration::from_cli(cli)?;
    let _logging_guard = startup::init_logging(&configuration.logging_config())?;

    let address = configuration.server_address();
    let port = configuration.gateway_listen_port(cli_port);

    let routes = Arc::new(RouteTable::new(configuration.gateway_routes()?)?);
    info!(routes = routes.len(), "Loaded gateway routes");

    let request_timeout = configuration.client_request_timeout();
    let http = Arc::new(TellerHttpClient::new(
        HttpClientConfig::with_servers(configuration.registry_urls()).with_timeouts(
            configuration.gateway_connect_timeout().as_millis() as u64,
            (configuration.config_max_wait() + request_timeout).as_millis() as u64,
        ),
    )?);

    let registration = InstanceRegistration::new(
        configuration.gateway_service_name(),
        configuration.gateway_advertised_host(),
        port,
    );
    let discovery = Arc::new(DiscoveryClient::new(
        Arc::new(HttpRegistryTransport::new(http)),
        DiscoveryConfig {
            poll_interval: configuration.client_poll_interval(),
            request_timeout,
            ..DiscoveryConfig::default()
        }
        .with_registration(registration),
    ));
    discovery.start();

    let router = Arc::new(GatewayRouter::new(
        routes,
        discovery.clone(),
        Arc::new(HttpUpstream::new(configuration.gateway_connect_timeout())?),
        Arc::new(CircuitBreakerRegistry::new()),
    ));

    let rate_limiter = Arc::new(RateLimiter::new(configuration.gateway_rate_limit()?));
    let state = web::Data::new(GatewayState {
        router,
        authorizer: startup::build_authorizer(&configuration)?,
        public_paths: PublicPaths::new(&configuration.gateway_public_paths())?,
        rate_limiter: rate_limiter.clone(),
    });

    let shutdown = wait_for_shutdown_signal();
    let cleanup_handle = tokio::spawn(startup::run_rate_limit_cleanup(rate_limiter, shutdown.clone()));

    info!("Starting Teller gateway on {}:{}", address, port);
    let server = startup::gateway_server(state, address, port)?;
    let server_handle = server.handle();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Gateway server error: {}", e);
            }
            shutdown.shutdown();
        }
        _ = shutdown.wait() => {
            info!("Stopping gateway HTTP server...");
            server_handle.stop(true).await;
        }
    }

    discovery.shutdown().await;
    if let Err(e) = cleanup_handle.await {
        warn!("Rate limit cleanup task failed: {}", e);
    }

    info!("Teller gateway shutdown complete");
    Ok(())
}
