/**
 * VSTORE PANEL - point d'entrée
 *
 * RÔLE :
 * Charge la configuration, ouvre la session device en arrière-plan et sert
 * l'API du panneau jusqu'à ctrl-c, puis libère la connexion device.
 */

mod config;
mod http;

use crate::config::{load_config, PanelConfig};
use crate::http::{build_router, ApiKeyGuard, AppState};

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vstore_core::{
    ActingIdentity, DiskMaterializer, JsonFileCredentials, MqttConnector, PayloadDecoder,
    ResourceSession, SessionController, TimeRangeCodec,
};

type PanelController = SessionController<MqttConnector>;

fn build_controller(cfg: &PanelConfig) -> PanelController {
    let connector = MqttConnector::new(cfg.mqtt.topic_prefix.clone())
        .with_default_port(cfg.mqtt.port)
        .with_keep_alive(cfg.mqtt.keep_alive());
    let credentials = Arc::new(JsonFileCredentials::new(&cfg.credentials_file));
    let decoder = PayloadDecoder::new(Arc::new(DiskMaterializer::new(&cfg.download_dir)));
    let identity =
        ActingIdentity::new(cfg.machine_id.clone()).with_credential_key(cfg.credential_key());

    SessionController::new(
        ResourceSession::new(connector, credentials),
        decoder,
        TimeRangeCodec::local(),
        identity,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env facultatif
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vstore_panel=info,vstore_core=info")),
        )
        .init();

    let cfg = load_config().await;
    info!(machine = %cfg.machine_id, listen = %cfg.listen, "vstore panel starting");

    let api_key = ApiKeyGuard::from_env();
    if !api_key.is_configured() {
        warn!("VSTORE_API_KEY not set, every route except /health will answer 401");
    }

    let controller = Arc::new(build_controller(&cfg));
    let init = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.initialize().await })
    };

    let app = build_router(AppState { controller: controller.clone() }, api_key);
    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen))?;
    info!("listening on http://{}", cfg.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    controller.shutdown().await;
    init.abort();
    info!("vstore panel stopped");
    Ok(())
}
