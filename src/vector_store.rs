//! Backends vectoriales consultados por la fusión.
//!
//! API pública:
//!   - trait `VectorBackend` (búsqueda por similitud, búsqueda diversa MMR,
//!     actualización del índice).
//!   - `InMemoryVectorIndex`: índice local en proceso con instantánea JSON.
//!   - `Neo4jVectorStore`: índice vectorial sobre `:Chunk(embedding)`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use neo4rs::{query, Graph};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::llm::Embedder;
use crate::models::Chunk;

/// Peso de relevancia frente a diversidad en MMR.
const MMR_LAMBDA: f64 = 0.5;

#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<Chunk>>;

    async fn diversity_search(&self, query: &str, k: usize, fetch_k: usize) -> Result<Vec<Chunk>>;

    /// Ruta de actualización del índice (ingesta).
    async fn add_chunks(&self, chunks: &[Chunk]) -> Result<usize>;

    async fn reset(&self) -> Result<()>;
}

pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let (mut dot, mut na, mut nb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

/// Maximal marginal relevance: elige `k` índices de `candidates` equilibrando
/// similitud con la consulta y redundancia con lo ya elegido.
pub fn mmr_select(query: &[f64], candidates: &[Vec<f64>], k: usize, lambda: f64) -> Vec<usize> {
    let relevance: Vec<f64> = candidates.iter().map(|c| cosine_similarity(query, c)).collect();
    let mut chosen: Vec<usize> = Vec::new();
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    while chosen.len() < k && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (pos, &idx) in remaining.iter().enumerate() {
            let redundancy = chosen
                .iter()
                .map(|&j| cosine_similarity(&candidates[idx], &candidates[j]))
                .fold(0.0, f64::max);
            let score = lambda * relevance[idx] - (1.0 - lambda) * redundancy;
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        chosen.push(remaining.remove(best_pos));
    }
    chosen
}

// ---------------------------------------------------------------------
// ÍNDICE EN MEMORIA
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedChunk {
    chunk: Chunk,
    embedding: Vec<f64>,
}

/// Índice vectorial local. Las búsquedas comparten el lock de lectura;
/// la ingesta y el reset toman el de escritura.
pub struct InMemoryVectorIndex {
    name: String,
    embedder: Arc<dyn Embedder>,
    entries: RwLock<Vec<IndexedChunk>>,
    snapshot_path: Option<PathBuf>,
}

impl InMemoryVectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            name: "in-memory".to_string(),
            embedder,
            entries: RwLock::new(Vec::new()),
            snapshot_path: None,
        }
    }

    /// Abre el índice cargando la instantánea si existe.
    pub async fn open(embedder: Arc<dyn Embedder>, path: PathBuf) -> anyhow::Result<Self> {
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<IndexedChunk>>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Índice en memoria cargado desde {} ({} chunks)", path.display(), entries.len());
        Ok(Self {
            name: "in-memory".to_string(),
            embedder,
            entries: RwLock::new(entries),
            snapshot_path: Some(path),
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn persist(&self, entries: &[IndexedChunk]) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::backend(&self.name, e))?;
        }
        let bytes = serde_json::to_vec(entries).map_err(|e| PipelineError::backend(&self.name, e))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| PipelineError::backend(&self.name, e))
    }

    async fn query_vector(&self, query: &str) -> Result<Vec<f64>> {
        self.embedder
            .embed_query(query)
            .await
            .map_err(|e| PipelineError::backend(&self.name, e))
    }

    /// Candidatos ordenados por similitud descendente.
    async fn ranked(&self, query_vec: &[f64], limit: usize) -> Vec<IndexedChunk> {
        let entries = self.entries.read().await;
        let mut scored: Vec<(f64, &IndexedChunk)> = entries
            .iter()
            .map(|e| (cosine_similarity(query_vec, &e.embedding), e))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, e)| e.clone()).collect()
    }
}

#[async_trait]
impl VectorBackend for InMemoryVectorIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<Chunk>> {
        if k == 0 || self.entries.read().await.is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = self.query_vector(query).await?;
        Ok(self.ranked(&query_vec, k).await.into_iter().map(|e| e.chunk).collect())
    }

    async fn diversity_search(&self, query: &str, k: usize, fetch_k: usize) -> Result<Vec<Chunk>> {
        if k == 0 || self.entries.read().await.is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = self.query_vector(query).await?;
        let candidates = self.ranked(&query_vec, fetch_k.max(k)).await;
        let vectors: Vec<Vec<f64>> = candidates.iter().map(|c| c.embedding.clone()).collect();
        Ok(mmr_select(&query_vec, &vectors, k, MMR_LAMBDA)
            .into_iter()
            .map(|i| candidates[i].chunk.clone())
            .collect())
    }

    async fn add_chunks(&self, chunks: &[Chunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_texts(&texts)
            .await
            .map_err(|e| PipelineError::backend(&self.name, e))?;

        // Se persiste una copia; la memoria sólo cambia si el snapshot se escribió.
        let mut entries = self.entries.write().await;
        let mut staged = entries.clone();
        let mut added = 0;
        for (chunk, embedding) in chunks.iter().zip(vectors) {
            match staged.iter_mut().find(|e| e.chunk.id == chunk.id) {
                Some(existing) => {
                    existing.chunk = chunk.clone();
                    existing.embedding = embedding;
                }
                None => {
                    staged.push(IndexedChunk { chunk: chunk.clone(), embedding });
                    added += 1;
                }
            }
        }
        self.persist(&staged).await?;
        *entries = staged;
        Ok(added)
    }

    async fn reset(&self) -> Result<()> {
        let mut entries = self.entries.write().await;
        self.persist(&[]).await?;
        entries.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------
// NEO4J
// ---------------------------------------------------------------------

fn distinct_ids(chunks: &[Chunk]) -> BTreeSet<String> {
    chunks.iter().map(|c| c.id.clone()).collect()
}

const CHUNK_INDEX_NAME: &str = "chunkEmbeddingIndex";

/// Índice vectorial persistente de Neo4j sobre `:Chunk(embedding)`.
pub struct Neo4jVectorStore {
    graph: Arc<Graph>,
    embedder: Arc<dyn Embedder>,
    dimensions: usize,
    write_lock: RwLock<()>,
}

impl Neo4jVectorStore {
    pub fn new(graph: Arc<Graph>, embedder: Arc<dyn Embedder>, dimensions: usize) -> Self {
        Self {
            graph,
            embedder,
            dimensions,
            write_lock: RwLock::new(()),
        }
    }

    /// Garantiza que el índice vectorial sobre `:Chunk(embedding)` exista.
    pub async fn ensure_index(&self) -> Result<()> {
        // ¿Ya existe el índice? Usamos la sintaxis moderna SHOW VECTOR INDEXES.
        let mut cursor = self
            .graph
            .execute(
                query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                    .param("name", CHUNK_INDEX_NAME),
            )
            .await?;

        if cursor.next().await?.is_some() {
            info!("Índice vectorial '{CHUNK_INDEX_NAME}' ya existe.");
            return Ok(());
        }

        let cypher = format!(
            "\
CREATE VECTOR INDEX {CHUNK_INDEX_NAME}
FOR (c:Chunk)
ON (c.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {dims},
    `vector.similarity_function`: 'cosine'
  }}
}}",
            dims = self.dimensions
        );

        self.graph.run(query(&cypher)).await?;
        info!("Índice vectorial '{CHUNK_INDEX_NAME}' creado.");
        Ok(())
    }

    /// Consulta el índice y devuelve `(chunk, embedding)` por score descendente.
    async fn query_nodes(&self, query_vec: Vec<f64>, k: usize) -> Result<Vec<(Chunk, Vec<f64>)>> {
        let _guard = self.write_lock.read().await;
        let mut cursor = self
            .graph
            .execute(
                query(
                    "CALL db.index.vector.queryNodes($index_name, $k, $embedding)
                     YIELD node, score
                     RETURN node.id AS id, node.source_filename AS source_filename,
                            node.page AS page, node.text AS text,
                            node.tokens_estimate AS tokens_estimate, node.file_hash AS file_hash,
                            node.created_at AS created_at, node.embedding AS embedding
                     ORDER BY score DESC",
                )
                .param("index_name", CHUNK_INDEX_NAME)
                .param("k", k as i64)
                .param("embedding", query_vec),
            )
            .await?;

        let mut output = Vec::new();
        while let Some(row) = cursor.next().await? {
            let created_at = row
                .get::<String>("created_at")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            let chunk = Chunk {
                id: row.get("id").unwrap_or_default(),
                source_filename: row.get("source_filename").unwrap_or_default(),
                page: row.get::<i64>("page").unwrap_or_default().max(0) as u32,
                text: row.get("text").unwrap_or_default(),
                tokens_estimate: row.get::<i64>("tokens_estimate").unwrap_or_default().max(0) as usize,
                file_hash: row.get("file_hash").unwrap_or_default(),
                created_at,
            };
            let embedding: Vec<f64> = row.get("embedding").unwrap_or_default();
            output.push((chunk, embedding));
        }
        Ok(output)
    }

    async fn query_vector(&self, query_text: &str) -> Result<Vec<f64>> {
        self.embedder
            .embed_query(query_text)
            .await
            .map_err(|e| PipelineError::backend("neo4j-vector", e))
    }

    /// Cuántos de `ids` ya existen como `:Chunk`. El `MERGE` posterior sólo
    /// crea el resto.
    async fn count_existing(&self, ids: &BTreeSet<String>) -> Result<usize> {
        let mut cursor = self
            .graph
            .execute(
                query("MATCH (c:Chunk) WHERE c.id IN $ids RETURN count(c) AS existing")
                    .param("ids", ids.iter().cloned().collect::<Vec<String>>()),
            )
            .await?;
        let existing = match cursor.next().await? {
            Some(row) => row.get::<i64>("existing").unwrap_or_default().max(0) as usize,
            None => 0,
        };
        Ok(existing)
    }
}

#[async_trait]
impl VectorBackend for Neo4jVectorStore {
    fn name(&self) -> &str {
        "neo4j-vector"
    }

    async fn similarity_search(&self, query_text: &str, k: usize) -> Result<Vec<Chunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.query_vector(query_text).await?;
        Ok(self
            .query_nodes(query_vec, k)
            .await?
            .into_iter()
            .map(|(chunk, _)| chunk)
            .collect())
    }

    async fn diversity_search(&self, query_text: &str, k: usize, fetch_k: usize) -> Result<Vec<Chunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.query_vector(query_text).await?;
        let candidates = self.query_nodes(query_vec.clone(), fetch_k.max(k)).await?;
        let vectors: Vec<Vec<f64>> = candidates.iter().map(|(_, v)| v.clone()).collect();
        Ok(mmr_select(&query_vec, &vectors, k, MMR_LAMBDA)
            .into_iter()
            .map(|i| candidates[i].0.clone())
            .collect())
    }

    async fn add_chunks(&self, chunks: &[Chunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_texts(&texts)
            .await
            .map_err(|e| PipelineError::backend("neo4j-vector", e))?;

        let _guard = self.write_lock.write().await;
        let ids = distinct_ids(chunks);
        let existing = self.count_existing(&ids).await?;
        let added = ids.len().saturating_sub(existing);

        let tx = self.graph.start_txn().await?;
        for (chunk, embedding) in chunks.iter().zip(vectors) {
            tx.run(
                query(
                    "MERGE (c:Chunk {id: $id})
                     SET c.source_filename = $source_filename, c.page = $page, c.text = $text,
                         c.tokens_estimate = $tokens_estimate, c.file_hash = $file_hash,
                         c.created_at = $created_at, c.embedding = $embedding",
                )
                .param("id", chunk.id.clone())
                .param("source_filename", chunk.source_filename.clone())
                .param("page", chunk.page as i64)
                .param("text", chunk.text.clone())
                .param("tokens_estimate", chunk.tokens_estimate as i64)
                .param("file_hash", chunk.file_hash.clone())
                .param("created_at", chunk.created_at.to_rfc3339())
                .param("embedding", embedding),
            )
            .await?;
        }
        tx.commit().await?;
        info!("{} chunks indexados en Neo4j ({added} nuevos)", chunks.len());
        Ok(added)
    }

    async fn reset(&self) -> Result<()> {
        let _guard = self.write_lock.write().await;
        self.graph.run(query("MATCH (c:Chunk) DETACH DELETE c")).await?;
        warn!("Chunks vectoriales de Neo4j eliminados.");
        Ok(())
    }
}
