//! Carga y gestión de configuración de la aplicación (Neo4j + LLM + pipeline).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

#[derive(Clone, Debug)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Dónde vive el almacén del grafo.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphBackend {
    Neo4j,
    Memory,
}

impl GraphBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "neo4j" => Ok(Self::Neo4j),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(anyhow!("Backend de grafo no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,

    pub graph_backend: GraphBackend,
    pub vector_index_path: Option<PathBuf>,
    pub scratchpad_path: PathBuf,

    pub retrieval_depth: usize,
    pub max_context_tokens: usize,
    pub graph_timeout: Duration,
    pub llm_timeout: Duration,
    pub corrective_reretrieval: bool,

    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// Profundidades de recuperación (SHALLOW / MEDIUM / DEEP).
pub const RETRIEVAL_DEPTH_SHALLOW: usize = 5;
pub const RETRIEVAL_DEPTH_MEDIUM: usize = 10;
pub const RETRIEVAL_DEPTH_DEEP: usize = 20;

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let neo4j_uri = env::var("NEO4J_URI").unwrap_or_else(|_| "bolt://localhost:7687".to_string());
        let neo4j_user = env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string());
        let neo4j_password = env::var("NEO4J_PASSWORD").unwrap_or_else(|_| "password".to_string());

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

        let graph_backend =
            GraphBackend::from_str(&env::var("GRAPH_BACKEND").unwrap_or_else(|_| "neo4j".to_string()))?;
        let vector_index_path = match env::var("VECTOR_INDEX_PATH") {
            Ok(path) if path.is_empty() => None,
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => Some(PathBuf::from("data/vector_index.json")),
        };
        let scratchpad_path = PathBuf::from(
            env::var("SCRATCHPAD_PATH").unwrap_or_else(|_| "data/scratchpad.jsonl".to_string()),
        );

        let retrieval_depth = match env::var("RETRIEVAL_DEPTH") {
            Ok(raw) => parse_depth(&raw)?,
            Err(_) => RETRIEVAL_DEPTH_MEDIUM,
        };
        let max_context_tokens =
            parse_or("MAX_CONTEXT_TOKENS", crate::context::DEFAULT_MAX_CONTEXT_TOKENS)?;
        let graph_timeout = Duration::from_secs(parse_or("GRAPH_TIMEOUT_SECS", 10)?);
        let llm_timeout = Duration::from_secs(parse_or("LLM_TIMEOUT_SECS", 60)?);
        let corrective_reretrieval = env::var("CORRECTIVE_RERETRIEVAL")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        let chunk_size = parse_or("CHUNK_SIZE", 1200)?;
        let chunk_overlap = parse_or("CHUNK_OVERLAP", 200)?;
        if chunk_overlap >= chunk_size {
            return Err(anyhow!(
                "CHUNK_OVERLAP ({chunk_overlap}) debe ser menor que CHUNK_SIZE ({chunk_size})"
            ));
        }

        Ok(Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            llm_provider,
            llm_embedding_model,
            llm_chat_model,
            graph_backend,
            vector_index_path,
            scratchpad_path,
            retrieval_depth,
            max_context_tokens,
            graph_timeout,
            llm_timeout,
            corrective_reretrieval,
            chunk_size,
            chunk_overlap,
        })
    }
}

/// Acepta un número o uno de los niveles `shallow`, `medium`, `deep`.
fn parse_depth(raw: &str) -> Result<usize> {
    match raw.trim().to_lowercase().as_str() {
        "shallow" => Ok(RETRIEVAL_DEPTH_SHALLOW),
        "medium" => Ok(RETRIEVAL_DEPTH_MEDIUM),
        "deep" => Ok(RETRIEVAL_DEPTH_DEEP),
        other => other
            .parse::<usize>()
            .map_err(|e| anyhow!("Valor inválido para RETRIEVAL_DEPTH ('{raw}'): {e}")),
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Valor inválido para {key} ('{raw}'): {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_and_backend_parsing() {
        assert!(matches!(LlmProvider::from_str("OpenAI"), Ok(LlmProvider::OpenAI)));
        assert!(LlmProvider::from_str("bard").is_err());
        assert_eq!(GraphBackend::from_str("memory").ok(), Some(GraphBackend::Memory));
        assert!(GraphBackend::from_str("sqlite").is_err());
    }

    #[test]
    fn test_parse_depth_levels_and_numbers() {
        assert_eq!(parse_depth("Shallow").unwrap(), RETRIEVAL_DEPTH_SHALLOW);
        assert_eq!(parse_depth("deep").unwrap(), 20);
        assert_eq!(parse_depth(" 7 ").unwrap(), 7);
        assert!(parse_depth("bottomless").is_err());
    }

    #[test]
    fn test_parse_or_uses_default_when_missing() {
        let value: usize = parse_or("CFG_TEST_SURELY_UNSET_KEY", 7).unwrap();
        assert_eq!(value, 7);
    }
}
