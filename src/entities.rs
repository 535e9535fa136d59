//! Extracción heurística de entidades. Sustituible por un modelo NER real
//! implementando `EntityExtractor`.

/// Máximo de entidades por chunk en la ingesta.
pub const MAX_ENTITIES_PER_CHUNK: usize = 5;

pub trait EntityExtractor: Send + Sync {
    /// Entidades de un chunk durante la ingesta.
    fn extract(&self, text: &str) -> Vec<String>;

    /// Candidatos a entidad dentro de una consulta.
    fn query_candidates(&self, query: &str) -> Vec<String>;
}

/// Palabras que empiezan por mayúscula.
#[derive(Debug, Clone)]
pub struct CapitalizedTermExtractor {
    pub max_per_chunk: usize,
}

impl Default for CapitalizedTermExtractor {
    fn default() -> Self {
        Self {
            max_per_chunk: MAX_ENTITIES_PER_CHUNK,
        }
    }
}

fn starts_uppercase(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase)
}

fn strip_punctuation(word: &str) -> &str {
    word.trim_end_matches(|c: char| c.is_ascii_punctuation())
}

fn push_unique(out: &mut Vec<String>, term: &str) {
    if !term.is_empty() && !out.iter().any(|t| t == term) {
        out.push(term.to_string());
    }
}

impl EntityExtractor for CapitalizedTermExtractor {
    fn extract(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        // La longitud se mide sobre el token crudo, antes de quitar la puntuación.
        for word in text.split_whitespace() {
            if out.len() == self.max_per_chunk {
                break;
            }
            if starts_uppercase(word) && word.chars().count() > 3 {
                push_unique(&mut out, strip_punctuation(word));
            }
        }
        out
    }

    fn query_candidates(&self, query: &str) -> Vec<String> {
        let mut out = Vec::new();
        for word in query.split_whitespace().filter(|w| starts_uppercase(w)) {
            push_unique(&mut out, strip_punctuation(word));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_capitalized_terms() {
        let ex = CapitalizedTermExtractor::default();
        let terms = ex.extract("Alice met Bob at Google. Then Alice, tired, left for Paris.");
        assert_eq!(terms, vec!["Alice", "Google", "Then", "Paris"]);
    }

    #[test]
    fn test_extract_caps_at_five_unique() {
        let ex = CapitalizedTermExtractor::default();
        let terms = ex.extract("Aaaa Bbbb Aaaa Cccc Dddd Eeee Ffff Gggg");
        assert_eq!(terms, vec!["Aaaa", "Bbbb", "Cccc", "Dddd", "Eeee"]);
    }

    #[test]
    fn test_query_candidates_have_no_length_filter() {
        let ex = CapitalizedTermExtractor::default();
        assert_eq!(ex.query_candidates("What did Bob say about Neo4j?"), vec!["What", "Bob", "Neo4j"]);
        assert!(ex.query_candidates("all lowercase").is_empty());
    }
}
