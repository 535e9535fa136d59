//! Orquestador del pipeline RAG correctivo.
//!
//! Flujo de una consulta:
//!   1. Recuperación según el modo (fusión vectorial, grafo o ambos a la vez).
//!   2. Selección de contexto por presupuesto de tokens.
//!   3. Puerta de calidad y, si hace falta, estrategia correctiva.
//!   4. Construcción del prompt y generación con timeout (texto de respaldo si falla).
//!   5. Respuesta estructurada y traza en el scratchpad.
//!
//! `run` nunca devuelve error: cada fallo se degrada a su política.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::RETRIEVAL_DEPTH_MEDIUM;
use crate::context::{self, DEFAULT_MAX_CONTEXT_TOKENS};
use crate::error::{GenerationError, PipelineError};
use crate::fusion::RetrievalFusion;
use crate::graph::GraphContextResolver;
use crate::llm::AnswerGenerator;
use crate::models::{
    AuditEntry, AuditStep, Chunk, Confidence, Metrics, PipelineResponse, PromptViews,
    QualityDecision, QualityLabel, RetrievalMode, RetrievedEvidence, TokenUsage,
};
use crate::prompts::Role;
use crate::quality::{self, CorrectionStrategy};
use crate::scratchpad::AuditLog;
use crate::tokens::TokenAnalyzer;

/// Chunks que entran en el bloque de contexto del prompt. Independiente del
/// presupuesto de tokens.
pub const PROMPT_CHUNK_LIMIT: usize = 5;
/// Chunks mostrados en las vistas de contexto crudo y preparado.
pub const CONTEXT_PREVIEW_LIMIT: usize = 10;
/// Menciones por entidad pedidas al grafo.
pub const GRAPH_TOP_K: usize = 5;
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(60);

const EMPTY_CONTEXT: &str = "No supporting documents were retrieved.";
const BASE_LIMITATIONS: &str =
    "Generated by an automated retrieval pipeline. Verify with original docs.";

/// Parámetros ajustables por consulta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub generation_timeout: Duration,
    pub top_k: usize,
    pub max_context_tokens: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            generation_timeout: DEFAULT_GENERATION_TIMEOUT,
            top_k: RETRIEVAL_DEPTH_MEDIUM,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
        }
    }
}

pub struct RagPipeline {
    fusion: Arc<RetrievalFusion>,
    graph: Arc<GraphContextResolver>,
    generator: Arc<dyn AnswerGenerator>,
    audit: Arc<dyn AuditLog>,
    correction: Arc<dyn CorrectionStrategy>,
    tokens: TokenAnalyzer,
    defaults: RunOptions,
}

/// Consulta las fuentes que permite el modo. Hybrid lanza ambas a la vez.
pub async fn retrieve_for_mode(
    fusion: &RetrievalFusion,
    graph: &GraphContextResolver,
    query: &str,
    mode: RetrievalMode,
    k: usize,
) -> RetrievedEvidence {
    match mode {
        RetrievalMode::Traditional => RetrievedEvidence {
            vector: Some(fusion.retrieve(query, k).await),
            graph: None,
        },
        RetrievalMode::KnowledgeGraph => RetrievedEvidence {
            vector: None,
            graph: Some(graph.retrieve(query, GRAPH_TOP_K).await),
        },
        RetrievalMode::Hybrid => {
            let (vector, graph) =
                tokio::join!(fusion.retrieve(query, k), graph.retrieve(query, GRAPH_TOP_K));
            RetrievedEvidence {
                vector: Some(vector),
                graph: Some(graph),
            }
        }
    }
}

impl RagPipeline {
    pub fn new(
        fusion: Arc<RetrievalFusion>,
        graph: Arc<GraphContextResolver>,
        generator: Arc<dyn AnswerGenerator>,
        audit: Arc<dyn AuditLog>,
        correction: Arc<dyn CorrectionStrategy>,
        tokens: TokenAnalyzer,
    ) -> Self {
        Self {
            fusion,
            graph,
            generator,
            audit,
            correction,
            tokens,
            defaults: RunOptions::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: RunOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn fusion(&self) -> &Arc<RetrievalFusion> {
        &self.fusion
    }

    pub fn graph(&self) -> &Arc<GraphContextResolver> {
        &self.graph
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub async fn run(&self, query: &str, mode: RetrievalMode, role: Role) -> PipelineResponse {
        self.run_with(query, mode, role, self.defaults).await
    }

    #[instrument(skip_all, fields(query = query, mode = ?mode, role = role.name()))]
    pub async fn run_with(
        &self,
        query: &str,
        mode: RetrievalMode,
        role: Role,
        options: RunOptions,
    ) -> PipelineResponse {
        let run_id = Uuid::new_v4();
        self.record(run_id, AuditEntry::new(
            query,
            AuditStep::Start,
            format!("Started RAG pipeline in {} mode as {}.", mode.label(), role.name()),
        ))
        .await;

        // 1) Recuperación
        let retrieved =
            retrieve_for_mode(&self.fusion, &self.graph, query, mode, options.top_k).await;
        let mut tools_used = Vec::new();
        self.record_retrieval(run_id, query, "", &retrieved, &mut tools_used).await;
        let mut corrective: Option<RetrievedEvidence> = None;

        // 2) Presupuesto de contexto
        let mut evidence = retrieved.evidence();
        let raw_context_tokens: usize = evidence.iter().map(|c| c.tokens_estimate).sum();
        let raw_context = format_context_block(&evidence, CONTEXT_PREVIEW_LIMIT);
        let mut selection = context::select(&evidence, options.max_context_tokens);

        // 3) Puerta de calidad
        let mut assessment = quality::evaluate(query, &selection.selected);
        let mut decision = quality::decide(assessment.label);
        self.record(
            run_id,
            AuditEntry::new(
                query,
                AuditStep::Evaluation,
                format!("Context Quality: {} ({:.2})", assessment.label, assessment.score),
            )
            .with_metadata(json!({
                "decision": decision,
                "selected": selection.selected.len(),
                "dropped": selection.dropped_count,
                "summary": context::compress(&selection.selected),
            })),
        )
        .await;

        if decision == QualityDecision::Correct {
            let expanded = quality::expand_query(query, &selection.selected);
            self.record(run_id, AuditEntry::new(
                query,
                AuditStep::Correction,
                format!(
                    "Quality low. Triggering corrective loop ({}) with expanded query: {expanded}",
                    self.correction.name()
                ),
            ))
            .await;

            let extra = self.correction.correct(query, &expanded, mode, &assessment).await;
            if let Some(extra) = extra {
                self.record_retrieval(run_id, query, "Corrective re-retrieval: ", &extra, &mut tools_used)
                    .await;
                // Una sola pasada: nueva evidencia primero, sin repetir chunks.
                let mut merged = extra.evidence();
                for chunk in evidence {
                    let key = chunk.dedup_key();
                    if !merged.iter().any(|c| c.dedup_key() == key) {
                        merged.push(chunk);
                    }
                }
                evidence = merged;
                selection = context::select(&evidence, options.max_context_tokens);
                assessment = quality::evaluate(query, &selection.selected);
                decision = quality::decide(assessment.label);
                self.record(run_id, AuditEntry::new(
                    query,
                    AuditStep::Evaluation,
                    format!(
                        "Context Quality after correction: {} ({:.2})",
                        assessment.label, assessment.score
                    ),
                ))
                .await;
                corrective = Some(extra);
            }
        }
        let prepared_context = format_context_block(&selection.selected, CONTEXT_PREVIEW_LIMIT);

        // 4) Prompt y generación
        let system_prompt = role.system_prompt();
        let prompt_chunks = &selection.selected[..selection.selected.len().min(PROMPT_CHUNK_LIMIT)];
        let user_prompt = build_user_prompt(query, prompt_chunks);
        let final_prompt = format!("{system_prompt}\n\n{user_prompt}");
        let prompt_tokens = self.tokens.count_tokens(&final_prompt);

        let generation = match tokio::time::timeout(
            options.generation_timeout,
            self.generator.generate(system_prompt, &user_prompt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(options.generation_timeout)),
        };
        let (answer, generation_failed) = match generation {
            Ok(text) => (text, false),
            Err(e) => {
                warn!("Se usa la respuesta de respaldo: {}", PipelineError::from(e.clone()));
                (fallback_answer(&e), true)
            }
        };
        tools_used.push(format!("LLM ({})", self.generator.model_name()));

        // 5) Respuesta estructurada
        let response = PipelineResponse {
            answer: answer.clone(),
            confidence: Confidence::from_score(assessment.score),
            sources: selection
                .selected
                .iter()
                .map(|c| c.source_filename.clone())
                .collect(),
            limitations: limitations(
                &retrieved,
                corrective.as_ref(),
                assessment.label,
                generation_failed,
            ),
            llm_output: answer,
            tools_used,
            prompt_views: PromptViews {
                raw_context,
                prepared_context,
                final_prompt,
            },
            metrics: Metrics {
                quality_score: assessment.score,
                quality_label: assessment.label,
                decision,
                retrieval_mode: mode,
                token_usage: TokenUsage {
                    raw_context_tokens,
                    prepared_context_tokens: selection.total_tokens,
                    prompt_tokens,
                },
                estimated_prompt_cost_usd: self.tokens.prompt_cost(prompt_tokens),
            },
        };

        let metadata = serde_json::to_value(&response).unwrap_or_default();
        self.record(
            run_id,
            AuditEntry::new(query, AuditStep::Completion, "Generated answer.").with_metadata(metadata),
        )
        .await;

        info!(
            "Consulta completada: calidad {} ({:.2}), {} fuentes, {} tokens de prompt",
            assessment.label,
            assessment.score,
            response.sources.len(),
            prompt_tokens
        );
        response
    }

    /// Una entrada Retrieval por fuente consultada; la herramienta se añade
    /// a `tools_used` una sola vez.
    async fn record_retrieval(
        &self,
        run_id: Uuid,
        query: &str,
        prefix: &str,
        retrieved: &RetrievedEvidence,
        tools_used: &mut Vec<String>,
    ) {
        if let Some(vector) = &retrieved.vector {
            let names = self.fusion.backend_names().join(" + ");
            self.record(
                run_id,
                AuditEntry::new(
                    query,
                    AuditStep::Retrieval,
                    format!("{prefix}Retrieved {} docs via vector fusion ({names}).", vector.len()),
                )
                .with_metadata(json!({
                    "ids": vector.ids(),
                    "provenance": vector.provenance,
                })),
            )
            .await;
            push_tool(tools_used, format!("Vector Store ({names})"));
        }
        if let Some(bundle) = &retrieved.graph {
            let mut content = format!(
                "{prefix}Retrieved graph context with {} nodes.",
                bundle.nodes.len()
            );
            if let Some(note) = &bundle.note {
                content.push(' ');
                content.push_str(note);
            }
            self.record(run_id, AuditEntry::new(query, AuditStep::Retrieval, content)).await;
            push_tool(tools_used, format!("Knowledge Graph ({})", self.graph.store_name()));
        }
    }

    /// La traza es best-effort: un fallo se registra y la consulta sigue.
    async fn record(&self, run_id: Uuid, entry: AuditEntry) {
        let step = entry.step;
        if let Err(e) = self.audit.append(entry.with_run(run_id)).await {
            warn!("No se pudo registrar el paso {step:?} en el scratchpad: {e}");
        }
    }
}

/// Bloque de contexto legible para el LLM y las vistas de depuración.
pub fn format_context_block(chunks: &[Chunk], limit: usize) -> String {
    if chunks.is_empty() {
        return EMPTY_CONTEXT.to_string();
    }
    chunks
        .iter()
        .take(limit)
        .map(|c| format!("Source: {} (Page {})\n{}", c.source_filename, c.page, c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn build_user_prompt(query: &str, chunks: &[Chunk]) -> String {
    format!(
        "Use only the context below to answer the question. \
         If the answer cannot be derived from the context, say you do not have enough information.\n\n\
         Context:\n{}\n\nQuestion: {query}",
        format_context_block(chunks, PROMPT_CHUNK_LIMIT)
    )
}

pub fn fallback_answer(err: &GenerationError) -> String {
    format!(
        "[Fallback Response] Unable to contact LLM: {err}. \
         Returning synthesized placeholder answer instead."
    )
}

fn push_tool(tools_used: &mut Vec<String>, tool: String) {
    if !tools_used.contains(&tool) {
        tools_used.push(tool);
    }
}

fn limitations(
    retrieved: &RetrievedEvidence,
    corrective: Option<&RetrievedEvidence>,
    label: QualityLabel,
    generation_failed: bool,
) -> String {
    let mut notes = vec![BASE_LIMITATIONS.to_string()];
    let vector_empty = retrieved.vector.as_ref().is_some_and(|v| v.is_empty())
        && corrective
            .and_then(|c| c.vector.as_ref())
            .map_or(true, |v| v.is_empty());
    if vector_empty {
        notes.push("Vector retrieval returned no documents.".to_string());
    }
    let degraded = [Some(retrieved), corrective]
        .into_iter()
        .flatten()
        .filter_map(|r| r.graph.as_ref())
        .find(|b| b.degraded);
    if let Some(bundle) = degraded {
        let note = bundle.note.as_deref().unwrap_or("Graph context unavailable.");
        notes.push(format!("Knowledge graph degraded: {note}"));
    }
    if matches!(label, QualityLabel::Fair | QualityLabel::Poor) {
        notes.push(format!("Context quality was {label}; the answer may be incomplete."));
    }
    if generation_failed {
        notes.push("The language model could not be reached; the answer is a placeholder.".to_string());
    }
    notes.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::entities::CapitalizedTermExtractor;
    use crate::error::{PipelineError, Result};
    use crate::fusion::{FusionSource, SearchStrategy};
    use crate::graph::InMemoryGraphStore;
    use crate::graph::tests::SlowGraphStore;
    use crate::quality::{LogOnlyCorrection, ReRetrieveCorrection};
    use crate::vector_store::tests::embedder;
    use crate::vector_store::{InMemoryVectorIndex, VectorBackend};

    struct EchoGenerator;

    #[async_trait]
    impl AnswerGenerator for EchoGenerator {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, _system: &str, user: &str) -> std::result::Result<String, GenerationError> {
            Ok(format!("answer from {} chars", user.len()))
        }
    }

    struct SlowGenerator;

    #[async_trait]
    impl AnswerGenerator for SlowGenerator {
        fn model_name(&self) -> &str {
            "slow"
        }

        async fn generate(&self, _system: &str, _user: &str) -> std::result::Result<String, GenerationError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".to_string())
        }
    }

    #[derive(Default)]
    struct MemoryAuditLog {
        entries: Mutex<Vec<AuditEntry>>,
    }

    #[async_trait]
    impl AuditLog for MemoryAuditLog {
        async fn append(&self, entry: AuditEntry) -> Result<()> {
            self.entries.lock().unwrap().push(entry);
            Ok(())
        }

        async fn read(&self, limit: usize) -> Result<Vec<AuditEntry>> {
            let entries = self.entries.lock().unwrap();
            let skip = entries.len().saturating_sub(limit);
            Ok(entries[skip..].to_vec())
        }

        async fn clear(&self) -> Result<()> {
            self.entries.lock().unwrap().clear();
            Ok(())
        }
    }

    struct BrokenAuditLog;

    #[async_trait]
    impl AuditLog for BrokenAuditLog {
        async fn append(&self, _entry: AuditEntry) -> Result<()> {
            Err(PipelineError::AuditWrite("disk full".into()))
        }

        async fn read(&self, _limit: usize) -> Result<Vec<AuditEntry>> {
            Ok(Vec::new())
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Devuelve siempre la misma evidencia para la corrección.
    struct FixedCorrection(Vec<Chunk>);

    #[async_trait]
    impl CorrectionStrategy for FixedCorrection {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn correct(
            &self,
            _query: &str,
            _expanded_query: &str,
            _mode: RetrievalMode,
            _assessment: &crate::models::QualityAssessment,
        ) -> Option<RetrievedEvidence> {
            Some(RetrievedEvidence {
                vector: Some(crate::models::RetrievalResult {
                    chunks: self.0.clone(),
                    provenance: Vec::new(),
                }),
                graph: None,
            })
        }
    }

    struct Harness {
        index: Arc<InMemoryVectorIndex>,
        graph: Arc<GraphContextResolver>,
        audit: Arc<MemoryAuditLog>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                index: Arc::new(InMemoryVectorIndex::new(embedder())),
                graph: Arc::new(GraphContextResolver::new(
                    Arc::new(InMemoryGraphStore::new()),
                    Arc::new(CapitalizedTermExtractor::default()),
                )),
                audit: Arc::new(MemoryAuditLog::default()),
            }
        }

        fn fusion(&self) -> Arc<RetrievalFusion> {
            Arc::new(RetrievalFusion::new(vec![FusionSource::new(
                self.index.clone(),
                SearchStrategy::Diversity,
            )]))
        }

        fn pipeline_with(
            &self,
            generator: Arc<dyn AnswerGenerator>,
            correction: Arc<dyn CorrectionStrategy>,
        ) -> RagPipeline {
            RagPipeline::new(
                self.fusion(),
                self.graph.clone(),
                generator,
                self.audit.clone(),
                correction,
                TokenAnalyzer::new("gpt-4o"),
            )
        }

        fn pipeline(&self) -> RagPipeline {
            self.pipeline_with(Arc::new(EchoGenerator), Arc::new(LogOnlyCorrection))
        }

        fn steps(&self) -> Vec<AuditStep> {
            self.audit.entries.lock().unwrap().iter().map(|e| e.step).collect()
        }

        fn retrievals(&self) -> usize {
            self.steps().iter().filter(|s| **s == AuditStep::Retrieval).count()
        }

        /// Un chunk sólo vectorial y un documento del grafo que menciona a Alice.
        async fn seeded_re_retrieval(&self) -> RagPipeline {
            self.index
                .add_chunks(&[Chunk::new("v", 0, "vector_only.md", 1, "rust tooling notes")])
                .await
                .unwrap();
            self.graph
                .ingest(&[Chunk::new("g", 0, "people.md", 1, "Alice writes Rust tools.")])
                .await;
            let correction = ReRetrieveCorrection::new(self.fusion(), self.graph.clone(), 5);
            self.pipeline_with(Arc::new(EchoGenerator), Arc::new(correction))
        }
    }

    fn chunk(i: usize, text: &str) -> Chunk {
        Chunk::new("f", i, "guide.md", 1, text)
    }

    #[tokio::test]
    async fn test_traditional_with_empty_stores() {
        let harness = Harness::new();
        let response = harness
            .pipeline()
            .run("What is Rust?", RetrievalMode::Traditional, Role::NormalChatbot)
            .await;

        assert!(response.sources.is_empty());
        assert_eq!(response.metrics.quality_label, QualityLabel::Poor);
        assert_eq!(response.metrics.decision, QualityDecision::Correct);
        assert_eq!(response.metrics.token_usage.raw_context_tokens, 0);
        assert_eq!(response.prompt_views.prepared_context, EMPTY_CONTEXT);
        assert!(response.prompt_views.final_prompt.contains(EMPTY_CONTEXT));
        assert!(response.limitations.contains("Vector retrieval returned no documents."));
        assert_eq!(
            harness.steps(),
            vec![
                AuditStep::Start,
                AuditStep::Retrieval,
                AuditStep::Evaluation,
                AuditStep::Correction,
                AuditStep::Completion
            ]
        );
        let entries = harness.audit.entries.lock().unwrap().clone();
        assert!(entries[0].run_id.is_some());
        assert!(entries.iter().all(|e| e.run_id == entries[0].run_id));
    }

    #[tokio::test]
    async fn test_generation_timeout_uses_fallback() {
        let harness = Harness::new();
        harness.index.add_chunks(&[chunk(0, "Rust has a borrow checker.")]).await.unwrap();
        let pipeline = harness.pipeline_with(Arc::new(SlowGenerator), Arc::new(LogOnlyCorrection));
        let options = RunOptions {
            generation_timeout: Duration::from_millis(20),
            ..RunOptions::default()
        };

        let response = pipeline
            .run_with("rust borrow checker", RetrievalMode::Traditional, Role::CodingAgent, options)
            .await;

        assert!(response.llm_output.starts_with("[Fallback Response]"));
        assert_eq!(response.answer, response.llm_output);
        let expected = TokenAnalyzer::new("gpt-4o").count_tokens(&response.prompt_views.final_prompt);
        assert_eq!(response.metrics.token_usage.prompt_tokens, expected);
        assert!(response.limitations.contains("placeholder"));
        assert_eq!(response.tools_used.last().map(String::as_str), Some("LLM (slow)"));
    }

    #[tokio::test]
    async fn test_good_context_proceeds_with_high_confidence() {
        let harness = Harness::new();
        harness
            .index
            .add_chunks(&[chunk(0, "Rust ownership and the borrow checker prevent data races.")])
            .await
            .unwrap();

        let response = harness
            .pipeline()
            .run("rust ownership borrow checker", RetrievalMode::Traditional, Role::DocumentAnalyser)
            .await;

        assert_eq!(response.metrics.decision, QualityDecision::Proceed);
        assert_eq!(response.confidence, Confidence::High);
        assert_eq!(response.sources, vec!["guide.md"]);
        assert!(response.answer.starts_with("answer from"));
        assert_eq!(response.tools_used, vec!["Vector Store (in-memory)", "LLM (echo)"]);
        assert!(!harness.steps().contains(&AuditStep::Correction));
    }

    #[tokio::test]
    async fn test_hybrid_puts_vector_evidence_before_graph() {
        let harness = Harness::new();
        let doc = Chunk::new("g", 0, "people.md", 3, "Alice works on Rust graph tooling.");
        harness.index.add_chunks(&[chunk(0, "rust graph notes")]).await.unwrap();
        harness.graph.ingest(&[doc]).await;

        let response = harness
            .pipeline()
            .run("Tell me about Alice", RetrievalMode::Hybrid, Role::NormalChatbot)
            .await;

        assert_eq!(response.sources, vec!["guide.md", "people.md"]);
        assert!(response.prompt_views.raw_context.contains("Document people.md mentions Alice"));
        assert_eq!(response.tools_used.len(), 3);
        assert_eq!(response.tools_used[1], "Knowledge Graph (in-memory graph)");
        let retrievals = harness.steps().iter().filter(|s| **s == AuditStep::Retrieval).count();
        assert_eq!(retrievals, 2);
    }

    #[tokio::test]
    async fn test_disconnected_graph_is_noted_in_limitations() {
        let harness = Harness::new();
        let fusion = Arc::new(RetrievalFusion::new(Vec::new()));
        let pipeline = RagPipeline::new(
            fusion,
            Arc::new(GraphContextResolver::disconnected(Arc::new(
                CapitalizedTermExtractor::default(),
            ))),
            Arc::new(EchoGenerator),
            harness.audit.clone(),
            Arc::new(LogOnlyCorrection),
            TokenAnalyzer::new("gpt-4o"),
        );

        let response = pipeline.run("Who is Alice?", RetrievalMode::KnowledgeGraph, Role::NormalChatbot).await;

        assert!(response.sources.is_empty());
        assert!(response.limitations.contains("Knowledge graph degraded"));
        assert_eq!(response.tools_used[0], "Knowledge Graph (disconnected)");
    }

    #[tokio::test]
    async fn test_correction_evidence_is_re_evaluated() {
        let harness = Harness::new();
        let extra = vec![chunk(7, "Tokio runtime schedules async tasks.")];
        let pipeline = harness.pipeline_with(Arc::new(EchoGenerator), Arc::new(FixedCorrection(extra)));

        let response = pipeline
            .run("tokio runtime async tasks", RetrievalMode::Traditional, Role::NormalChatbot)
            .await;

        assert_eq!(response.metrics.decision, QualityDecision::Proceed);
        assert_eq!(response.sources, vec!["guide.md"]);
        let evaluations = harness.steps().iter().filter(|s| **s == AuditStep::Evaluation).count();
        assert_eq!(evaluations, 2);
    }

    #[tokio::test]
    async fn test_re_retrieval_in_knowledge_graph_mode_stays_on_the_graph() {
        let harness = Harness::new();
        let pipeline = harness.seeded_re_retrieval().await;

        let response = pipeline
            .run("Tell me about Alice rust", RetrievalMode::KnowledgeGraph, Role::NormalChatbot)
            .await;

        assert_eq!(response.metrics.decision, QualityDecision::Correct);
        assert_eq!(response.sources, vec!["people.md"]);
        assert_eq!(response.tools_used, vec!["Knowledge Graph (in-memory graph)", "LLM (echo)"]);
        assert_eq!(harness.retrievals(), 2);
    }

    #[tokio::test]
    async fn test_re_retrieval_in_traditional_mode_stays_on_vectors() {
        let harness = Harness::new();
        let pipeline = harness.seeded_re_retrieval().await;

        let response = pipeline
            .run("rust borrow checker", RetrievalMode::Traditional, Role::NormalChatbot)
            .await;

        assert_eq!(response.sources, vec!["vector_only.md"]);
        assert_eq!(response.tools_used, vec!["Vector Store (in-memory)", "LLM (echo)"]);
        assert_eq!(harness.retrievals(), 2);
        let entries = harness.audit.entries.lock().unwrap().clone();
        assert!(entries
            .iter()
            .any(|e| e.content.starts_with("Corrective re-retrieval: Retrieved 1 docs")));
    }

    #[tokio::test]
    async fn test_re_retrieval_in_hybrid_mode_queries_both_sources() {
        let harness = Harness::new();
        let pipeline = harness.seeded_re_retrieval().await;

        let response = pipeline
            .run("Tell me about Alice and Bob rust", RetrievalMode::Hybrid, Role::NormalChatbot)
            .await;

        assert_eq!(response.sources, vec!["vector_only.md", "people.md"]);
        assert_eq!(
            response.tools_used,
            vec!["Vector Store (in-memory)", "Knowledge Graph (in-memory graph)", "LLM (echo)"]
        );
        assert_eq!(harness.retrievals(), 4);
    }

    #[tokio::test]
    async fn test_graph_timeout_is_noted_in_limitations() {
        let harness = Harness::new();
        let graph = GraphContextResolver::new(
            Arc::new(SlowGraphStore),
            Arc::new(CapitalizedTermExtractor::default()),
        )
        .with_timeout(Duration::from_millis(20));
        let pipeline = RagPipeline::new(
            harness.fusion(),
            Arc::new(graph),
            Arc::new(EchoGenerator),
            harness.audit.clone(),
            Arc::new(LogOnlyCorrection),
            TokenAnalyzer::new("gpt-4o"),
        );

        let response = pipeline.run("Who is Alice?", RetrievalMode::KnowledgeGraph, Role::NormalChatbot).await;

        assert!(response.limitations.contains("Knowledge graph degraded"));
        assert!(response.limitations.contains("timed out"));
    }

    #[tokio::test]
    async fn test_prompt_uses_at_most_five_chunks() {
        let harness = Harness::new();
        let chunks: Vec<Chunk> = (0..8).map(|i| chunk(i, &format!("rust fact number {i}"))).collect();
        harness.index.add_chunks(&chunks).await.unwrap();

        let response = harness
            .pipeline()
            .run("rust fact", RetrievalMode::Traditional, Role::NormalChatbot)
            .await;

        assert_eq!(response.sources.len(), 8);
        let in_prompt = response.prompt_views.final_prompt.matches("Source: guide.md").count();
        assert_eq!(in_prompt, PROMPT_CHUNK_LIMIT);
        let in_preview = response.prompt_views.prepared_context.matches("Source: guide.md").count();
        assert_eq!(in_preview, 8);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_break_query() {
        let harness = Harness::new();
        let fusion = Arc::new(RetrievalFusion::new(vec![FusionSource::new(
            harness.index.clone(),
            SearchStrategy::Similarity,
        )]));
        let pipeline = RagPipeline::new(
            fusion,
            harness.graph.clone(),
            Arc::new(EchoGenerator),
            Arc::new(BrokenAuditLog),
            Arc::new(LogOnlyCorrection),
            TokenAnalyzer::new("gpt-4o"),
        );

        let response = pipeline.run("anything", RetrievalMode::Hybrid, Role::NormalChatbot).await;
        assert!(response.answer.starts_with("answer from"));
    }

    #[test]
    fn test_fallback_text() {
        let text = fallback_answer(&GenerationError::Quota("429".into()));
        assert_eq!(
            text,
            "[Fallback Response] Unable to contact LLM: quota exceeded: 429. \
             Returning synthesized placeholder answer instead."
        );
    }
}
