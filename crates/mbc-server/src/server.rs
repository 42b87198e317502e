use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use mbc_sdk::Cqrs;

use crate::config::AppConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::AppState;
use crate::router::build_router;

/// HTTP front end over one [`Cqrs`] instance.
pub struct MbcServer {
    config: AppConfig,
    cqrs: Arc<Cqrs>,
}

impl MbcServer {
    /// Start the core and register the configured import tables. Must be
    /// called inside a tokio runtime.
    pub fn new(config: AppConfig) -> ServerResult<Self> {
        let cqrs = Cqrs::builder().config(config.core.clone()).build()?;
        for table in &config.tables {
            let required: Vec<&str> = table.required.iter().map(String::as_str).collect();
            cqrs.register_attribute_table(&table.name, &table.kind, &required)?;
        }
        Ok(Self {
            config,
            cqrs: Arc::new(cqrs),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cqrs(&self) -> &Arc<Cqrs> {
        &self.cqrs
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(AppState::new(self.cqrs.clone()), &self.config.server)
    }

    /// Serve until ctrl-c, then drain the dispatcher.
    pub async fn serve(self) -> ServerResult<()> {
        let app = self.router();
        let listener = TcpListener::bind(&self.config.server.bind_addr).await?;
        info!(addr = %self.config.server.bind_addr, "mbc server listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown requested");
            })
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        self.cqrs.shutdown().await?;
        Ok(())
    }
}
