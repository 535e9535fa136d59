//! Puerta de calidad del contexto y punto de extensión del bucle correctivo.
//!
//! La puntuación es una función pura de `(query, contexto)`: cobertura léxica
//! de los términos de la consulta dentro del texto seleccionado.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::fusion::RetrievalFusion;
use crate::graph::GraphContextResolver;
use crate::models::{
    Chunk, QualityAssessment, QualityDecision, QualityLabel, RetrievalMode, RetrievedEvidence,
};
use crate::rag::retrieve_for_mode;

pub const EXCELLENT_THRESHOLD: f64 = 0.8;
pub const GOOD_THRESHOLD: f64 = 0.65;
pub const FAIR_THRESHOLD: f64 = 0.5;

/// Términos añadidos como máximo al expandir una consulta.
const EXPANSION_TERMS: usize = 5;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "how", "what", "when", "where", "which", "who", "why",
    "with", "this", "that", "from", "they", "will", "would", "there", "their", "about", "into",
    "does", "did", "its", "than", "then", "them", "these", "those", "your", "been", "were",
];

fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
}

pub fn label_for(score: f64) -> QualityLabel {
    if score >= EXCELLENT_THRESHOLD {
        QualityLabel::Excellent
    } else if score >= GOOD_THRESHOLD {
        QualityLabel::Good
    } else if score >= FAIR_THRESHOLD {
        QualityLabel::Fair
    } else {
        QualityLabel::Poor
    }
}

/// Puntúa el contexto contra la consulta.
pub fn evaluate(query: &str, context: &[Chunk]) -> QualityAssessment {
    let context_terms: BTreeSet<String> = context.iter().flat_map(|c| terms(&c.text)).collect();
    let query_terms: BTreeSet<String> = terms(query).collect();

    let score = if context_terms.is_empty() {
        0.0
    } else if query_terms.is_empty() {
        1.0
    } else {
        let matched = query_terms.iter().filter(|t| context_terms.contains(*t)).count();
        matched as f64 / query_terms.len() as f64
    };

    QualityAssessment {
        score,
        label: label_for(score),
    }
}

/// FAIR y POOR piden corrección.
pub fn decide(label: QualityLabel) -> QualityDecision {
    match label {
        QualityLabel::Excellent | QualityLabel::Good => QualityDecision::Proceed,
        QualityLabel::Fair | QualityLabel::Poor => QualityDecision::Correct,
    }
}

/// Expansión determinista: añade los términos más frecuentes del contexto
/// que no aparecen en la consulta.
pub fn expand_query(query: &str, context: &[Chunk]) -> String {
    let query_terms: BTreeSet<String> = terms(query).collect();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for term in context.iter().flat_map(|c| terms(&c.text)) {
        if !query_terms.contains(&term) {
            *counts.entry(term).or_default() += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let extra: Vec<String> = ranked.into_iter().take(EXPANSION_TERMS).map(|(t, _)| t).collect();
    if extra.is_empty() {
        query.to_string()
    } else {
        format!("{} {}", query.trim(), extra.join(" "))
    }
}

/// Estrategia invocada cuando la decisión es `Correct`.
/// Devolver `Some(evidencia)` hace que el orquestador vuelva a presupuestar
/// y evaluar una vez con esa evidencia. Sólo se consultan las fuentes que
/// permite `mode`.
#[async_trait]
pub trait CorrectionStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn correct(
        &self,
        query: &str,
        expanded_query: &str,
        mode: RetrievalMode,
        assessment: &QualityAssessment,
    ) -> Option<RetrievedEvidence>;
}

/// Sólo registra la decisión; no hay re-recuperación.
pub struct LogOnlyCorrection;

#[async_trait]
impl CorrectionStrategy for LogOnlyCorrection {
    fn name(&self) -> &str {
        "log-only"
    }

    async fn correct(
        &self,
        query: &str,
        expanded_query: &str,
        _mode: RetrievalMode,
        assessment: &QualityAssessment,
    ) -> Option<RetrievedEvidence> {
        info!(
            "Calidad {} ({:.2}) para '{query}'; consulta expandida propuesta: '{expanded_query}'",
            assessment.label, assessment.score
        );
        None
    }
}

/// Repite la recuperación del modo con la consulta expandida.
pub struct ReRetrieveCorrection {
    fusion: Arc<RetrievalFusion>,
    graph: Arc<GraphContextResolver>,
    k: usize,
}

impl ReRetrieveCorrection {
    pub fn new(fusion: Arc<RetrievalFusion>, graph: Arc<GraphContextResolver>, k: usize) -> Self {
        Self { fusion, graph, k }
    }
}

#[async_trait]
impl CorrectionStrategy for ReRetrieveCorrection {
    fn name(&self) -> &str {
        "re-retrieve"
    }

    async fn correct(
        &self,
        _query: &str,
        expanded_query: &str,
        mode: RetrievalMode,
        _assessment: &QualityAssessment,
    ) -> Option<RetrievedEvidence> {
        let retrieved = retrieve_for_mode(&self.fusion, &self.graph, expanded_query, mode, self.k).await;
        if retrieved.is_empty() {
            None
        } else {
            info!(
                "Re-recuperación en modo {} con '{expanded_query}': {} chunks",
                mode.label(),
                retrieved.evidence().len()
            );
            Some(retrieved)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> Chunk {
        Chunk::new("h", 0, "doc.md", 1, text)
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(label_for(0.8), QualityLabel::Excellent);
        assert_eq!(label_for(0.79), QualityLabel::Good);
        assert_eq!(label_for(0.65), QualityLabel::Good);
        assert_eq!(label_for(0.5), QualityLabel::Fair);
        assert_eq!(label_for(0.49), QualityLabel::Poor);
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let ctx = vec![chunk("Neo4j stores graphs of entities"), chunk("Vectors power semantic search")];
        let a = evaluate("How does Neo4j store entities?", &ctx);
        let b = evaluate("How does Neo4j store entities?", &ctx);
        assert_eq!(a, b);
    }

    #[test]
    fn test_evaluate_coverage() {
        let ctx = vec![chunk("Neo4j stores graphs of entities")];
        // Términos de la consulta: neo4j, graphs, vectors -> 2 de 3.
        let q = evaluate("Neo4j graphs vectors", &ctx);
        assert!((q.score - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(q.label, QualityLabel::Good);
    }

    #[test]
    fn test_empty_context_is_poor() {
        let q = evaluate("anything at all", &[]);
        assert_eq!(q.score, 0.0);
        assert_eq!(q.label, QualityLabel::Poor);
        assert_eq!(decide(q.label), QualityDecision::Correct);
    }

    #[test]
    fn test_decide() {
        assert_eq!(decide(QualityLabel::Excellent), QualityDecision::Proceed);
        assert_eq!(decide(QualityLabel::Good), QualityDecision::Proceed);
        assert_eq!(decide(QualityLabel::Fair), QualityDecision::Correct);
    }

    #[test]
    fn test_expand_query_adds_frequent_terms() {
        let ctx = vec![chunk("graph graph vector index"), chunk("graph index")];
        let expanded = expand_query("search", &ctx);
        assert_eq!(expanded, "search graph index vector");
        assert_eq!(expand_query("graph", &[]), "graph");
    }

    #[tokio::test]
    async fn test_log_only_correction_returns_nothing() {
        let assessment = QualityAssessment { score: 0.1, label: QualityLabel::Poor };
        assert!(LogOnlyCorrection
            .correct("q", "q more", RetrievalMode::Hybrid, &assessment)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_re_retrieve_only_queries_sources_of_the_mode() {
        use crate::entities::CapitalizedTermExtractor;
        use crate::fusion::{FusionSource, SearchStrategy};
        use crate::graph::InMemoryGraphStore;
        use crate::vector_store::tests::embedder;
        use crate::vector_store::{InMemoryVectorIndex, VectorBackend};

        let index = Arc::new(InMemoryVectorIndex::new(embedder()));
        index.add_chunks(&[Chunk::new("v", 0, "vector_only.md", 1, "rust tooling notes")]).await.unwrap();
        let fusion = Arc::new(RetrievalFusion::new(vec![FusionSource::new(index, SearchStrategy::Similarity)]));
        let graph = Arc::new(GraphContextResolver::new(
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(CapitalizedTermExtractor::default()),
        ));
        graph.ingest(&[Chunk::new("g", 0, "people.md", 1, "Alice writes Rust tools.")]).await;
        let correction = ReRetrieveCorrection::new(fusion, graph, 5);
        let assessment = QualityAssessment { score: 0.2, label: QualityLabel::Poor };

        let graph_only = correction
            .correct("Alice", "Alice rust", RetrievalMode::KnowledgeGraph, &assessment)
            .await
            .unwrap();
        assert!(graph_only.vector.is_none());
        assert!(graph_only.evidence().iter().all(|c| c.source_filename == "people.md"));

        let vector_only = correction
            .correct("Alice", "Alice rust", RetrievalMode::Traditional, &assessment)
            .await
            .unwrap();
        assert!(vector_only.graph.is_none());
        assert_eq!(vector_only.evidence()[0].source_filename, "vector_only.md");

        let both = correction
            .correct("Alice", "Alice rust", RetrievalMode::Hybrid, &assessment)
            .await
            .unwrap();
        assert!(both.vector.is_some() && both.graph.is_some());
    }
}
