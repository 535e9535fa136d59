//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM.
//! De momento se implementa OpenAI; Gemini/Ollama quedan preparados para el futuro.
//!
//! El núcleo sólo ve los traits `Embedder` y `AnswerGenerator`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel; // <- para .embed_texts

use crate::config::{AppConfig, LlmProvider};
use crate::error::GenerationError;

/// Calcula embeddings de textos (colaborador externo del núcleo).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f64>> {
        self.embed_texts(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No se pudo generar embedding de la query"))
    }
}

/// Servicio de generación de respuestas.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String, GenerationError>;
}

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
        })
    }

    /// Dimensión de los vectores del modelo de embeddings configurado.
    pub fn embedding_dimensions(&self) -> usize {
        match self.embedding_model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        }
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    async fn embed_with_openai(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        use rig::client::EmbeddingsClient as _;
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};

        let client = openai::Client::from_env();
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };
        let embedding_model = client.embedding_model(model_name);

        let embeddings = embedding_model.embed_texts(texts.to_vec()).await?;
        if embeddings.len() != texts.len() {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                texts.len()
            ));
        }

        Ok(embeddings.into_iter().map(|e| e.vec).collect())
    }

    // ---------------------------------------------------------------------
    // CHAT / COMPLETION
    // ---------------------------------------------------------------------

    async fn answer_with_openai(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, GenerationError> {
        use rig::client::CompletionClient as _;
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o"
        } else {
            self.chat_model.as_str()
        };

        // Temperatura baja para respuestas estables.
        let agent = client
            .agent(model_name)
            .preamble(system_prompt)
            .temperature(0.2)
            .build();

        agent
            .prompt(user_prompt)
            .await
            .map_err(|e| GenerationError::classify(e.to_string()))
    }
}

#[async_trait]
impl Embedder for LlmManager {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(texts).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para embeddings",
                other
            )),
        }
    }
}

#[async_trait]
impl AnswerGenerator for LlmManager {
    fn model_name(&self) -> &str {
        &self.chat_model
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String, GenerationError> {
        match self.provider {
            LlmProvider::OpenAI => self.answer_with_openai(system_prompt, user_prompt).await,
            ref other => Err(GenerationError::Transport(format!(
                "Proveedor LLM {other:?} aún no implementado para chat"
            ))),
        }
    }
}
