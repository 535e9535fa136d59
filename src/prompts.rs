//! Prompts de sistema por rol del agente.

use serde::{Deserialize, Serialize};

const NORMAL_CHATBOT: &str = r#"
You are a helpful and friendly AI assistant.
Your goal is to engage in natural, open-ended conversation while providing accurate information.
- Be polite, concise, and clear.
- Answer questions directly and admit if you don't know something.
- Maintain a conversational tone.
"#;

const CODING_AGENT: &str = r#"
You are an expert Software Engineer and Coding Assistant.
Your goal is to help write, debug, and explain code.
- Provide clean, efficient, and well-commented code snippets.
- Explain the logic behind your solutions.
- Follow best practices and design patterns.
- If asked to fix a bug, explain the root cause and the solution.
"#;

const DOCUMENT_ANALYSER: &str = r#"
You are a specialized Document Analyst.
Your goal is to extract insights, summarize content, and answer questions based strictly on the provided documents.
- Base your answers ONLY on the context provided.
- If the information is not in the documents, state that clearly.
- Provide citations or references to specific sections if possible.
- Summarize complex information into clear, digestible points.
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[default]
    NormalChatbot,
    CodingAgent,
    DocumentAnalyser,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::NormalChatbot, Role::CodingAgent, Role::DocumentAnalyser];

    /// Roles desconocidos caen al chatbot normal.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().replace(['_', '-'], " ").as_str() {
            "coding agent" => Role::CodingAgent,
            "document analyser" | "document analyzer" => Role::DocumentAnalyser,
            _ => Role::NormalChatbot,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::NormalChatbot => "Normal Chatbot",
            Role::CodingAgent => "Coding Agent",
            Role::DocumentAnalyser => "Document Analyser",
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Role::NormalChatbot => NORMAL_CHATBOT,
            Role::CodingAgent => CODING_AGENT,
            Role::DocumentAnalyser => DOCUMENT_ANALYSER,
        }
        .trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing_falls_back_to_chatbot() {
        assert_eq!(Role::parse("Coding Agent"), Role::CodingAgent);
        assert_eq!(Role::parse("document_analyser"), Role::DocumentAnalyser);
        assert_eq!(Role::parse("Architect"), Role::NormalChatbot);
    }

    #[test]
    fn test_system_prompt_is_trimmed() {
        let prompt = Role::DocumentAnalyser.system_prompt();
        assert!(prompt.starts_with("You are a specialized Document Analyst."));
        assert!(!prompt.ends_with('\n'));
    }
}
