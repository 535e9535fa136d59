//! Selección de contexto por presupuesto de tokens y compresión extractiva.

use tracing::{debug, warn};

use crate::models::{Chunk, ContextSelection};

/// Presupuesto de tokens por defecto para el contexto preparado.
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 3000;

/// Acumulación voraz sobre el orden de entrada (ya ordenado por el
/// recuperador). El primer chunk que excede el presupuesto detiene la
/// aceptación: los siguientes se descartan aunque quepan.
/// Los chunks mal formados se omiten y cuentan como descartados.
pub fn select(chunks: &[Chunk], max_tokens: usize) -> ContextSelection {
    let mut selected = Vec::new();
    let mut total_tokens = 0usize;

    for chunk in chunks {
        if let Err(e) = chunk.validate() {
            warn!("Chunk omitido en la selección de contexto: {e}");
            continue;
        }
        // Un desbordamiento cuenta como fuera de presupuesto.
        match total_tokens.checked_add(chunk.tokens_estimate) {
            Some(next) if next <= max_tokens => total_tokens = next,
            _ => break,
        }
        selected.push(chunk.clone());
    }

    let dropped_count = chunks.len() - selected.len();
    debug!(
        "Contexto seleccionado: {} chunks, {} tokens, {} descartados",
        selected.len(),
        total_tokens,
        dropped_count
    );

    ContextSelection {
        selected,
        total_tokens,
        dropped_count,
    }
}

/// Resumen extractivo: primera frase de cada chunk con su etiqueta de fuente.
pub fn compress(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .map(|chunk| {
            let first_sentence = chunk.text.split('.').next().unwrap_or_default().trim();
            format!(
                "- {first_sentence}. [{}:{}]",
                chunk.source_filename, chunk.page
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
