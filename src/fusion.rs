//! Fusión de resultados de varios backends vectoriales independientes.
//!
//! Flujo:
//!   1. Cada backend se consulta con su estrategia (MMR con `2k` candidatos o
//!      similitud simple con `k`). Un backend caído aporta una lista vacía.
//!   2. Las salidas se concatenan en orden de prioridad.
//!   3. Deduplicación por `id` (o hash del contenido), conservando la primera
//!      aparición.
//!   4. Truncado a `k` después de fusionar: si el backend prioritario ya
//!      aporta `k` chunks únicos, los demás no aportan nada.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::models::{Chunk, Provenance, RetrievalResult};
use crate::vector_store::VectorBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    /// MMR: pide `2k` candidatos y se queda con `k` diversos.
    Diversity,
    Similarity,
}

pub struct FusionSource {
    pub backend: Arc<dyn VectorBackend>,
    pub strategy: SearchStrategy,
}

impl FusionSource {
    pub fn new(backend: Arc<dyn VectorBackend>, strategy: SearchStrategy) -> Self {
        Self { backend, strategy }
    }
}

/// Recuperador que fusiona backends en un orden de prioridad fijo.
pub struct RetrievalFusion {
    sources: Vec<FusionSource>,
}

impl RetrievalFusion {
    pub fn new(sources: Vec<FusionSource>) -> Self {
        Self { sources }
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.backend.name().to_string()).collect()
    }

    /// Devuelve como mucho `k` chunks con ids distintos. Nunca falla.
    #[instrument(skip(self))]
    pub async fn retrieve(&self, query: &str, k: usize) -> RetrievalResult {
        if k == 0 {
            return RetrievalResult::default();
        }

        // Los backends no comparten estado: se consultan a la vez y se
        // fusionan después en orden de prioridad.
        let outputs = join_all(self.sources.iter().map(|source| async move {
            let backend = &source.backend;
            let result = match source.strategy {
                SearchStrategy::Diversity => backend.diversity_search(query, k, k * 2).await,
                SearchStrategy::Similarity => backend.similarity_search(query, k).await,
            };
            match result {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!("Backend '{}' degradado a vacío: {e}", backend.name());
                    Vec::new()
                }
            }
        }))
        .await;

        let tagged = self
            .sources
            .iter()
            .zip(outputs)
            .map(|(source, chunks)| (source.backend.name().to_string(), chunks));
        let fused = merge(tagged, k);
        debug!("Fusión: {} chunks únicos (k = {k})", fused.len());
        fused
    }

    /// Actualiza todos los backends con un lote de ingesta. Un backend que
    /// falla se omite. Devuelve los chunks nuevos por backend.
    pub async fn index(&self, chunks: &[Chunk]) -> Vec<(String, usize)> {
        let mut report = Vec::new();
        for source in &self.sources {
            let name = source.backend.name().to_string();
            match source.backend.add_chunks(chunks).await {
                Ok(added) => report.push((name, added)),
                Err(e) => warn!("No se pudo indexar en '{name}': {e}"),
            }
        }
        report
    }

    pub async fn reset(&self) {
        for source in &self.sources {
            if let Err(e) = source.backend.reset().await {
                warn!("No se pudo resetear '{}': {e}", source.backend.name());
            }
        }
    }
}

/// Concatena en orden, deduplica conservando la primera aparición y trunca.
pub fn merge(outputs: impl IntoIterator<Item = (String, Vec<Chunk>)>, k: usize) -> RetrievalResult {
    let mut seen = HashSet::new();
    let mut result = RetrievalResult::default();

    for (backend, chunks) in outputs {
        for (rank, chunk) in chunks.into_iter().enumerate() {
            if seen.insert(chunk.dedup_key()) {
                result.chunks.push(chunk);
                result.provenance.push(Provenance {
                    backend: backend.clone(),
                    rank,
                });
            }
        }
    }

    result.chunks.truncate(k);
    result.provenance.truncate(k);
    result
}
