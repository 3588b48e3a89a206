//! Gateway assembly: authorizer selection, rate limiter upkeep and the
//! HTTP listener.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, dev::Server, middleware::Logger, web};
use teller_common::ShutdownSignal;
use teller_gateway::{
    AllowAllAuthorizer, Authorizer, GatewayState, Identity, IntrospectionAuthorizer, RateLimiter,
    StaticTokenAuthorizer, configure,
};
use tracing::{debug, info};

use crate::model::config::{AuthMode, Configuration};

/// Build the token validator selected by `gateway.auth.mode`.
pub fn build_authorizer(configuration: &Configuration) -> anyhow::Result<Arc<dyn Authorizer>> {
    match configuration.gateway_auth_mode() {
        AuthMode::None => {
            info!("Gateway authentication disabled");
            Ok(Arc::new(AllowAllAuthorizer))
        }
        AuthMode::Static => {
            let tokens = configuration.gateway_static_tokens()?;
            if tokens.is_empty() {
                anyhow::bail!("gateway.auth.mode is 'static' but gateway.auth.tokens is empty");
            }
            let mut authorizer = StaticTokenAuthorizer::new();
            for entry in &tokens {
                let identity = entry
                    .claims
                    .iter()
                    .fold(Identity::new(&entry.subject), |identity, (name, value)| {
                        identity.with_claim(name, value)
                    });
                authorizer = authorizer.with_token(&entry.token, identity);
            }
            info!(tokens = tokens.len(), "Gateway authentication with static tokens");
            Ok(Arc::new(authorizer))
        }
        AuthMode::Introspection => {
            let Some(endpoint) = configuration.gateway_introspection_url() else {
                anyhow::bail!(
                    "gateway.auth.mode is 'introspection' but gateway.auth.introspection_url is not set"
                );
            };
            let mut authorizer = IntrospectionAuthorizer::new(
                &endpoint,
                configuration.client_request_timeout(),
            )?;
            if let Some((client_id, client_secret)) =
                configuration.gateway_introspection_credentials()
            {
                authorizer = authorizer.with_credentials(&client_id, &client_secret);
            }
            if let Some(scope) = configuration.gateway_required_scope() {
                authorizer = authorizer.with_required_scope(&scope);
            }
            info!(endpoint = %endpoint, "Gateway authentication with token introspection");
            Ok(Arc::new(authorizer))
        }
    }
}

/// Drop idle rate limit buckets once per window until shutdown.
pub async fn run_rate_limit_cleanup(limiter: Arc<RateLimiter>, shutdown: ShutdownSignal) {
    let period = limiter.config().window().max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = limiter.cleanup();
                if removed > 0 {
                    debug!(removed, remaining = limiter.tracked_keys(), "Rate limit buckets cleaned up");
                }
            }
            _ = shutdown.wait() => break,
        }
    }
}

/// Creates and binds the gateway HTTP server.
pub fn gateway_server(
    state: web::Data<GatewayState>,
    address: String,
    port: u16,
) -> Result<Server, std::io::Error> {
    Ok(HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((address, port))?
    .disable_signals()
    .run())
}
