// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod context;
mod entities;
mod error;
mod fusion;
mod graph;
mod ingest;
mod llm;
mod models;
mod neo4j_client;
mod prompts;
mod quality;
mod rag;
mod scratchpad;
mod tokens;
mod vector_store;

use crate::app_state::{AppState, Status};
use anyhow::Result;
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::GraphBackend,
    entities::CapitalizedTermExtractor,
    fusion::{FusionSource, RetrievalFusion, SearchStrategy},
    graph::{GraphContextResolver, InMemoryGraphStore},
    ingest::{DocumentProcessor, IngestionService},
    llm::{AnswerGenerator, Embedder, LlmManager},
    neo4j_client::Neo4jGraphStore,
    quality::{CorrectionStrategy, LogOnlyCorrection, ReRetrieveCorrection},
    rag::{RagPipeline, RunOptions},
    scratchpad::JsonlScratchpad,
    tokens::TokenAnalyzer,
    vector_store::{InMemoryVectorIndex, Neo4jVectorStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env()?;

    // 3. Inicializar gestor de LLMs (embeddings + generación)
    let llm_manager = Arc::new(LlmManager::from_config(&cfg)?);
    let embedder: Arc<dyn Embedder> = llm_manager.clone();
    let generator: Arc<dyn AnswerGenerator> = llm_manager.clone();

    // 4. Conectar a Neo4j si el grafo lo usa. Sin conexión el servicio
    //    arranca igual, con el grafo degradado.
    let neo4j = match cfg.graph_backend {
        GraphBackend::Memory => None,
        GraphBackend::Neo4j => match neo4j_client::connect_from_config(&cfg).await {
            Ok(graph) => {
                if let Err(e) = neo4j_client::ensure_schema(&graph).await {
                    warn!("No se pudo asegurar el esquema de Neo4j: {e}");
                }
                Some(Arc::new(graph))
            }
            Err(e) => {
                warn!("Neo4j no disponible, el grafo queda desconectado: {e}");
                None
            }
        },
    };

    // 5. Fusión vectorial: índice local (MMR) y, si hay Neo4j, su índice vectorial
    let local_index = match &cfg.vector_index_path {
        Some(path) => InMemoryVectorIndex::open(embedder.clone(), path.clone()).await?,
        None => InMemoryVectorIndex::new(embedder.clone()),
    };
    let mut sources = vec![FusionSource::new(Arc::new(local_index), SearchStrategy::Diversity)];
    if let Some(graph) = &neo4j {
        let store = Neo4jVectorStore::new(graph.clone(), embedder.clone(), llm_manager.embedding_dimensions());
        if let Err(e) = store.ensure_index().await {
            warn!("No se pudo asegurar el índice vectorial de Neo4j: {e}");
        }
        sources.push(FusionSource::new(Arc::new(store), SearchStrategy::Similarity));
    }
    let fusion = Arc::new(RetrievalFusion::new(sources));

    // 6. Resolvedor del grafo de conocimiento
    let extractor = Arc::new(CapitalizedTermExtractor::default());
    let graph_resolver = match (cfg.graph_backend, &neo4j) {
        (GraphBackend::Memory, _) => {
            GraphContextResolver::new(Arc::new(InMemoryGraphStore::new()), extractor)
        }
        (GraphBackend::Neo4j, Some(graph)) => {
            GraphContextResolver::new(Arc::new(Neo4jGraphStore::new(graph.clone())), extractor)
        }
        (GraphBackend::Neo4j, None) => GraphContextResolver::disconnected(extractor),
    };
    let graph_resolver = Arc::new(graph_resolver.with_timeout(cfg.graph_timeout));

    // 7. Scratchpad y estrategia correctiva
    let scratchpad = Arc::new(JsonlScratchpad::open(&cfg.scratchpad_path).await?);
    info!("Scratchpad en {}", scratchpad.path().display());
    let correction: Arc<dyn CorrectionStrategy> = if cfg.corrective_reretrieval {
        Arc::new(ReRetrieveCorrection::new(
            fusion.clone(),
            graph_resolver.clone(),
            cfg.retrieval_depth,
        ))
    } else {
        Arc::new(LogOnlyCorrection)
    };

    let pipeline = RagPipeline::new(
        fusion.clone(),
        graph_resolver.clone(),
        generator,
        scratchpad,
        correction,
        TokenAnalyzer::new(&cfg.llm_chat_model),
    )
    .with_defaults(RunOptions {
        generation_timeout: cfg.llm_timeout,
        top_k: cfg.retrieval_depth,
        max_context_tokens: cfg.max_context_tokens,
    });

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 8. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        pipeline: Arc::new(pipeline),
        ingestion: Arc::new(IngestionService::new(fusion, graph_resolver)),
        processor: DocumentProcessor::from_config(&cfg),
        status: Arc::new(Mutex::new(Status {
            is_busy: false,
            message: "Servidor listo.".to_string(),
            progress: 0.0,
        })),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 9. Configurar el router de la API
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 10. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr).await?;
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
