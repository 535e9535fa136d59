//! Conteo de tokens con tiktoken y estimación de costes por modelo.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Precio en USD por millón de tokens `(entrada, salida)`.
const PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o", 5.00, 15.00),
    ("gpt-4o-mini", 0.15, 0.60),
    ("text-embedding-3-large", 0.13, 0.00),
    ("text-embedding-3-small", 0.02, 0.00),
];

/// Contador de tokens. Si el tokenizador no se puede cargar cae a la
/// estimación de 4 caracteres por token.
#[derive(Clone)]
pub struct TokenAnalyzer {
    bpe: Option<Arc<CoreBPE>>,
    model: String,
}

impl TokenAnalyzer {
    pub fn new(model: &str) -> Self {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .or_else(|_| tiktoken_rs::cl100k_base())
            .map(Arc::new)
            .map_err(|e| warn!("No se pudo cargar el tokenizador para {model}: {e}"))
            .ok();
        Self {
            bpe,
            model: model.to_string(),
        }
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => crate::models::estimate_tokens(text),
        }
    }

    /// Coste estimado en USD. Modelos desconocidos cuestan 0.
    pub fn estimate_cost(&self, input_tokens: usize, output_tokens: usize, model: &str) -> f64 {
        let (input, output) = PRICING
            .iter()
            .find(|(name, _, _)| *name == model)
            .map(|(_, i, o)| (*i, *o))
            .unwrap_or((0.0, 0.0));
        (input_tokens as f64 / 1_000_000.0) * input + (output_tokens as f64 / 1_000_000.0) * output
    }

    /// Coste de entrada del prompt con el modelo configurado.
    pub fn prompt_cost(&self, prompt_tokens: usize) -> f64 {
        self.estimate_cost(prompt_tokens, 0, &self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_counting() {
        let analyzer = TokenAnalyzer::new("gpt-4o");
        let count = analyzer.count_tokens("Hello world");
        assert!(count > 0);
        assert_eq!(analyzer.count_tokens(""), 0);
    }

    #[test]
    fn test_cost_estimation() {
        let analyzer = TokenAnalyzer::new("gpt-4o");
        let cost = analyzer.estimate_cost(1000, 1000, "gpt-4o");
        assert!((cost - 0.02).abs() < 1e-4);
        assert_eq!(analyzer.estimate_cost(1000, 1000, "unknown-model"), 0.0);
    }
}
