//! Resolución de contexto a partir del grafo de conocimiento.
//!
//! Ingesta: `(Document {id})-[:MENTIONS]->(Entity {name})` por cada término
//! extraído de cada chunk. Consulta: para cada candidato de la query, hasta
//! `k` pares `(Entity)<-[:MENTIONS]-(Document)` acumulados en un subgrafo.
//!
//! Si el grafo no está conectado ambas operaciones devuelven un resultado
//! vacío marcado como degradado.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::entities::EntityExtractor;
use crate::error::{PipelineError, Result};
use crate::models::{Chunk, GraphEdge, GraphNode, GraphStats, SubgraphBundle};

pub const DEFAULT_GRAPH_TIMEOUT: Duration = Duration::from_secs(10);

const DISCONNECTED_NOTE: &str = "Graph DB not connected.";

/// Almacén de grafo con identidad por clave natural.
#[async_trait]
pub trait GraphStore: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert_document(&self, id: &str, filename: &str, page: u32) -> Result<()>;

    async fn upsert_entity_mention(&self, document_id: &str, entity_name: &str) -> Result<()>;

    /// Pares `(Entity, Document)` para una entidad.
    async fn query_mentions(&self, entity_name: &str, k: usize) -> Result<Vec<(GraphNode, GraphNode)>>;

    async fn stats(&self) -> Result<GraphStats>;

    async fn reset(&self) -> Result<()>;
}

// ---------------------------------------------------------------------
// ALMACÉN EN MEMORIA
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemoryGraph {
    documents: BTreeMap<String, (String, u32)>,
    entities: BTreeSet<String>,
    /// `(entity, document_id)`, ordenado por entidad para las consultas.
    mentions: BTreeSet<(String, String)>,
}

/// Grafo en proceso (`GRAPH_BACKEND=memory`).
#[derive(Default)]
pub struct InMemoryGraphStore {
    inner: RwLock<MemoryGraph>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    fn name(&self) -> &str {
        "in-memory graph"
    }

    async fn upsert_document(&self, id: &str, filename: &str, page: u32) -> Result<()> {
        self.inner
            .write()
            .await
            .documents
            .insert(id.to_string(), (filename.to_string(), page));
        Ok(())
    }

    async fn upsert_entity_mention(&self, document_id: &str, entity_name: &str) -> Result<()> {
        let mut graph = self.inner.write().await;
        if !graph.documents.contains_key(document_id) {
            return Err(PipelineError::backend(
                self.name(),
                format!("document '{document_id}' not found"),
            ));
        }
        graph.entities.insert(entity_name.to_string());
        graph
            .mentions
            .insert((entity_name.to_string(), document_id.to_string()));
        Ok(())
    }

    async fn query_mentions(&self, entity_name: &str, k: usize) -> Result<Vec<(GraphNode, GraphNode)>> {
        let graph = self.inner.read().await;
        Ok(graph
            .mentions
            .iter()
            .filter(|(entity, _)| entity == entity_name)
            .take(k)
            .filter_map(|(entity, doc_id)| {
                graph.documents.get(doc_id).map(|(filename, page)| {
                    (
                        GraphNode::Entity { name: entity.clone() },
                        GraphNode::Document {
                            id: doc_id.clone(),
                            filename: filename.clone(),
                            page: *page,
                        },
                    )
                })
            })
            .collect())
    }

    async fn stats(&self) -> Result<GraphStats> {
        let graph = self.inner.read().await;
        Ok(GraphStats {
            documents: graph.documents.len(),
            entities: graph.entities.len(),
            mentions: graph.mentions.len(),
        })
    }

    async fn reset(&self) -> Result<()> {
        *self.inner.write().await = MemoryGraph::default();
        Ok(())
    }
}

// ---------------------------------------------------------------------
// RESOLVEDOR
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphIngestReport {
    pub documents: usize,
    pub mentions: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct GraphContextResolver {
    store: Option<Arc<dyn GraphStore>>,
    extractor: Arc<dyn EntityExtractor>,
    // Lecturas concurrentes; la ingesta es exclusiva.
    lock: RwLock<()>,
    timeout: Duration,
}

impl GraphContextResolver {
    pub fn new(store: Arc<dyn GraphStore>, extractor: Arc<dyn EntityExtractor>) -> Self {
        Self {
            store: Some(store),
            extractor,
            lock: RwLock::new(()),
            timeout: DEFAULT_GRAPH_TIMEOUT,
        }
    }

    /// Resolvedor sin conexión. No se reintenta después.
    pub fn disconnected(extractor: Arc<dyn EntityExtractor>) -> Self {
        Self {
            store: None,
            extractor,
            lock: RwLock::new(()),
            timeout: DEFAULT_GRAPH_TIMEOUT,
        }
    }

    /// Presupuesto de tiempo por llamada al almacén.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.store {
            Some(_) => ConnectionStatus::Connected,
            None => ConnectionStatus::Disconnected,
        }
    }

    pub fn store_name(&self) -> &str {
        self.store.as_ref().map(|s| s.name()).unwrap_or("disconnected")
    }

    async fn timed<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| PipelineError::Timeout {
                operation: operation.to_string(),
                after: self.timeout,
            })?
    }

    /// Inserta documentos, entidades y menciones. Idempotente.
    #[instrument(skip(self, chunks), fields(chunks = chunks.len()))]
    pub async fn ingest(&self, chunks: &[Chunk]) -> GraphIngestReport {
        let mut report = GraphIngestReport::default();
        let Some(store) = &self.store else {
            warn!("Ingesta en el grafo omitida: {DISCONNECTED_NOTE}");
            report.skipped = chunks.len();
            return report;
        };

        let _guard = self.lock.write().await;
        for chunk in chunks {
            if let Err(e) = chunk.validate() {
                warn!("Chunk omitido en la ingesta del grafo: {e}");
                report.skipped += 1;
                continue;
            }
            let upsert = store.upsert_document(&chunk.id, &chunk.source_filename, chunk.page);
            if let Err(e) = self.timed("upsert_document", upsert).await {
                warn!("No se pudo insertar el documento {}: {e}", chunk.id);
                report.failed += 1;
                continue;
            }
            report.documents += 1;

            for term in self.extractor.extract(&chunk.text) {
                let mention = store.upsert_entity_mention(&chunk.id, &term);
                match self.timed("upsert_entity_mention", mention).await {
                    Ok(()) => report.mentions += 1,
                    Err(e) => warn!("No se pudo insertar la mención {} -> {term}: {e}", chunk.id),
                }
            }
        }

        info!(
            "Grafo: {} documentos, {} menciones, {} omitidos, {} fallidos",
            report.documents, report.mentions, report.skipped, report.failed
        );
        report
    }

    /// Subgrafo de apoyo para las entidades de la consulta.
    #[instrument(skip(self))]
    pub async fn retrieve(&self, query: &str, k: usize) -> SubgraphBundle {
        let Some(store) = &self.store else {
            return SubgraphBundle::degraded(DISCONNECTED_NOTE);
        };

        let _guard = self.lock.read().await;
        let mut bundle = SubgraphBundle::default();
        let mut seen_nodes = HashSet::new();

        for entity in self.extractor.query_candidates(query) {
            let pairs = match self.timed("query_mentions", store.query_mentions(&entity, k)).await {
                Ok(pairs) => pairs,
                Err(e) => {
                    warn!("Consulta de menciones para '{entity}' degradada: {e}");
                    bundle.degraded = true;
                    bundle.note = Some(format!("Partial graph context: {e}"));
                    continue;
                }
            };

            for (entity_node, doc_node) in pairs {
                let (GraphNode::Entity { name }, GraphNode::Document { id, filename, .. }) =
                    (&entity_node, &doc_node)
                else {
                    continue;
                };
                bundle.edges.push(GraphEdge::mentions(id.clone(), name.clone()));
                bundle
                    .supporting_texts
                    .push(format!("Document {filename} mentions {name}"));
                for node in [entity_node.clone(), doc_node.clone()] {
                    if seen_nodes.insert(node.key()) {
                        bundle.nodes.push(node);
                    }
                }
            }
        }

        bundle
    }

    pub async fn stats(&self) -> Option<GraphStats> {
        let store = self.store.as_ref()?;
        let _guard = self.lock.read().await;
        match self.timed("stats", store.stats()).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("No se pudieron leer las estadísticas del grafo: {e}");
                None
            }
        }
    }

    pub async fn reset(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _guard = self.lock.write().await;
        self.timed("reset", store.reset()).await
    }
}
