use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue};
use axum::routing::get;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::pulse::Pulse;
use crate::Result;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pulse: Pulse,
}

pub struct ApiServer {
    config: Arc<Config>,
}

impl ApiServer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            pulse: Pulse::new(self.config.server.pulse_url.clone()),
            config: self.config.clone(),
        };

        Router::new()
            .route("/create", get(crate::api::routes::create_backup))
            .route("/download", get(crate::api::routes::download_backup))
            .with_state(state)
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static("x-powered-by"),
                HeaderValue::from_static("atlasvault"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static("x-app-version"),
                HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
            ))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn serve(self) -> Result<()> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "HTTP server listening");

        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}
