mod attendance;
mod busy;
mod config;
mod db;
mod error;
mod export;
mod html;
mod loader;
mod navigation;
mod pdf_writer;
mod server;
mod session;
mod store;
mod view;

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{AppConfig, StoreBackend};
use db::MySqlStore;
use export::EngineSlot;
use pdf_writer::PdfEngine;
use server::AppState;
use session::StaticSessionProvider;
use store::{MemoryStore, RecordStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;

    let store: Arc<dyn RecordStore> = match &config.store {
        StoreBackend::Memory { data_file } => {
            info!(path = %data_file.display(), "using in-memory store");
            Arc::new(MemoryStore::from_file(data_file)?)
        }
        StoreBackend::MySql(db) => {
            info!(host = %db.host, database = %db.database, "using mysql store");
            Arc::new(MySqlStore::connect(db)?)
        }
    };

    let sessions = Arc::new(StaticSessionProvider::from_file(&config.sessions_file)?);

    // エンジン未登録の間のエクスポートは503
    let engine = Arc::new(EngineSlot::new());
    let pdf_engine = match &config.pdf_font_file {
        Some(path) => PdfEngine::from_font_file(path)?,
        None => PdfEngine::new(),
    };
    engine.install(Arc::new(pdf_engine))?;
    info!(ready = engine.is_ready(), "export engine installed");

    let state = Arc::new(AppState::new(store, sessions, engine, config.branding.clone()));
    server::run(state, config.port).await
}
