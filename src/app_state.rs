use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use crate::{
    config::AppConfig,
    ingest::{DocumentProcessor, IngestionService},
    rag::RagPipeline,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: Arc<RagPipeline>,
    pub ingestion: Arc<IngestionService>,
    pub processor: DocumentProcessor,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}
