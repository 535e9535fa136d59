//! Modelos de dominio: chunks, resultados de recuperación, nodos del grafo,
//! selección de contexto, evaluación de calidad y la respuesta del pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// Trozo de texto producido por el procesador de documentos.
/// Es inmutable una vez creado; `id` es `"{file_hash}_{index}"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source_filename: String,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tokens_estimate: usize,
    #[serde(default)]
    pub file_hash: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(
        file_hash: &str,
        index: usize,
        source_filename: impl Into<String>,
        page: u32,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            id: format!("{file_hash}_{index}"),
            source_filename: source_filename.into(),
            page,
            tokens_estimate: estimate_tokens(&text),
            text,
            file_hash: file_hash.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Clave de deduplicación: el `id`, o un hash del contenido si falta.
    pub fn dedup_key(&self) -> String {
        if self.id.is_empty() {
            format!("blake3:{}", blake3::hash(self.text.as_bytes()).to_hex())
        } else {
            self.id.clone()
        }
    }

    /// Comprueba los campos obligatorios.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let field = if self.text.trim().is_empty() {
            "text"
        } else if self.source_filename.is_empty() {
            "source_filename"
        } else {
            return Ok(());
        };
        Err(PipelineError::MalformedChunk {
            id: self.dedup_key(),
            field,
        })
    }
}

/// Estimación barata: ~4 caracteres por token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Qué backend produjo cada chunk y en qué posición.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub backend: String,
    pub rank: usize,
}

/// Resultado fusionado: `chunks[i]` fue producido según `provenance[i]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunks: Vec<Chunk>,
    pub provenance: Vec<Provenance>,
}

impl RetrievalResult {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.chunks.iter().map(|c| c.id.as_str()).collect()
    }
}

// --- Grafo ---

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "label", rename_all = "PascalCase")]
pub enum GraphNode {
    Document { id: String, filename: String, page: u32 },
    Entity { name: String },
}

impl GraphNode {
    /// Clave natural del nodo (`id` del documento o `name` de la entidad).
    pub fn key(&self) -> String {
        match self {
            GraphNode::Document { id, .. } => format!("document:{id}"),
            GraphNode::Entity { name } => format!("entity:{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Mentions,
}

/// Arista `(Document)-[:MENTIONS]->(Entity)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

impl GraphEdge {
    pub fn mentions(document_id: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            from: document_id.into(),
            to: entity.into(),
            kind: EdgeKind::Mentions,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub documents: usize,
    pub entities: usize,
    pub mentions: usize,
}

/// Subgrafo de apoyo devuelto por el resolvedor de contexto del grafo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubgraphBundle {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub supporting_texts: Vec<String>,
    /// `true` cuando el grafo no estaba disponible: recall reducido, no fallo.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SubgraphBundle {
    pub fn degraded(note: impl Into<String>) -> Self {
        Self {
            degraded: true,
            note: Some(note.into()),
            ..Self::default()
        }
    }

    /// Convierte los textos de apoyo en chunks sintéticos para que el
    /// presupuesto de tokens los trate igual que la evidencia vectorial.
    pub fn as_evidence(&self) -> Vec<Chunk> {
        self.edges
            .iter()
            .zip(self.supporting_texts.iter())
            .map(|(edge, text)| {
                let (filename, page) = self
                    .nodes
                    .iter()
                    .find_map(|node| match node {
                        GraphNode::Document { id, filename, page } if *id == edge.from => {
                            Some((filename.clone(), *page))
                        }
                        _ => None,
                    })
                    .unwrap_or_else(|| (edge.from.clone(), 0));
                Chunk {
                    id: format!("graph:{}:{}", edge.from, edge.to),
                    source_filename: filename,
                    page,
                    tokens_estimate: estimate_tokens(text),
                    text: text.clone(),
                    file_hash: String::new(),
                    created_at: Utc::now(),
                }
            })
            .collect()
    }
}

/// Lo que devolvió cada fuente consultada. `None` = fuente no consultada.
#[derive(Debug, Clone, Default)]
pub struct RetrievedEvidence {
    pub vector: Option<RetrievalResult>,
    pub graph: Option<SubgraphBundle>,
}

impl RetrievedEvidence {
    /// Evidencia vectorial primero y después la del grafo, sin re-ranking.
    pub fn evidence(&self) -> Vec<Chunk> {
        let mut evidence: Vec<Chunk> = self
            .vector
            .as_ref()
            .map(|v| v.chunks.clone())
            .unwrap_or_default();
        if let Some(bundle) = &self.graph {
            evidence.extend(bundle.as_evidence());
        }
        evidence
    }

    pub fn is_empty(&self) -> bool {
        self.vector.as_ref().map_or(true, |v| v.is_empty())
            && self.graph.as_ref().map_or(true, |b| b.edges.is_empty())
    }
}

// --- Selección de contexto y calidad ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSelection {
    pub selected: Vec<Chunk>,
    pub total_tokens: usize,
    pub dropped_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QualityLabel {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QualityLabel::Excellent => "EXCELLENT",
            QualityLabel::Good => "GOOD",
            QualityLabel::Fair => "FAIR",
            QualityLabel::Poor => "POOR",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub score: f64,
    pub label: QualityLabel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityDecision {
    Proceed,
    Correct,
}

// --- Modo de recuperación ---

/// Modo de recuperación. Cerrado: toda rama del orquestador es exhaustiva.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Traditional,
    KnowledgeGraph,
    Hybrid,
}

impl RetrievalMode {
    pub const ALL: [RetrievalMode; 3] = [
        RetrievalMode::Traditional,
        RetrievalMode::KnowledgeGraph,
        RetrievalMode::Hybrid,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            RetrievalMode::Traditional => "Traditional (Vector Fusion)",
            RetrievalMode::KnowledgeGraph => "Knowledge Graph (Neo4j)",
            RetrievalMode::Hybrid => "Hybrid (Vector + Graph)",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            RetrievalMode::Traditional => {
                "Vectors for semantic similarity. Fuses the in-process index and the Neo4j vector index."
            }
            RetrievalMode::KnowledgeGraph => {
                "Graph for explicit relationships. Uses Neo4j to find connected entities."
            }
            RetrievalMode::Hybrid => {
                "Combines semantic vectors and graph relationships for maximum context."
            }
        }
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RetrievalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "traditional" | "vector" => Ok(Self::Traditional),
            "knowledge_graph" | "graph" | "kg" => Ok(Self::KnowledgeGraph),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown retrieval mode: {other}")),
        }
    }
}

// --- Respuesta del pipeline ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Medium,
}

impl Confidence {
    pub fn from_score(score: f64) -> Self {
        if score > 0.7 {
            Confidence::High
        } else {
            Confidence::Medium
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptViews {
    pub raw_context: String,
    pub prepared_context: String,
    pub final_prompt: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub raw_context_tokens: usize,
    pub prepared_context_tokens: usize,
    pub prompt_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub quality_score: f64,
    pub quality_label: QualityLabel,
    pub decision: QualityDecision,
    pub retrieval_mode: RetrievalMode,
    pub token_usage: TokenUsage,
    pub estimated_prompt_cost_usd: f64,
}

/// Respuesta estructurada de una consulta. Se crea una vez y no se modifica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub answer: String,
    pub confidence: Confidence,
    pub sources: Vec<String>,
    pub limitations: String,
    pub llm_output: String,
    pub tools_used: Vec<String>,
    pub prompt_views: PromptViews,
    pub metrics: Metrics,
}

// --- Traza de auditoría ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditStep {
    Start,
    Retrieval,
    Evaluation,
    Correction,
    Completion,
}

/// Registro del scratchpad: sólo se añade, ordenado por creación.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Agrupa las entradas de una misma consulta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub query: String,
    pub step: AuditStep,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AuditEntry {
    pub fn new(query: &str, step: AuditStep, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: None,
            query: query.to_string(),
            step,
            content: content.into(),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
