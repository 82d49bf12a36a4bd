//! `render`: pure rendering of selected chunks + question into a prompt.
//!
//! Templates are loaded once into a `Tera` instance at construction and
//! rendering is then a pure function of (selected chunks, question,
//! language) — no I/O, no clock reads, safe to call from any worker.

use tera::{Context as TeraContext, Tera};

use crate::core::{RagError, RagResult, RetrievedChunk};

const TPL_PROMPT: &str = include_str!("../templates/prompt.tera");
const TPL_SYSTEM_ID: &str = include_str!("../templates/id/system.tera");
const TPL_FALLBACK_ID: &str = include_str!("../templates/id/fallback.tera");
const TPL_SYSTEM_EN: &str = include_str!("../templates/en/system.tera");
const TPL_FALLBACK_EN: &str = include_str!("../templates/en/fallback.tera");

/// Instructional languages with a shipped localized template pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Indonesian,
    English,
}

impl Language {
    /// Parse an `instructional_language` config value. Unrecognized values
    /// are the caller's problem to warn about and default away from — this
    /// constructor simply reports what it does not know.
    pub fn from_code(code: &str) -> Result<Self, RagError> {
        match code.to_lowercase().as_str() {
            "id" | "id-id" | "indonesian" => Ok(Self::Indonesian),
            "en" | "en-us" | "english" => Ok(Self::English),
            other => Err(RagError::UnknownLanguage(other.to_string())),
        }
    }

    fn system_template_name(self) -> &'static str {
        match self {
            Self::Indonesian => "system_id",
            Self::English => "system_en",
        }
    }

    fn fallback_template_name(self) -> &'static str {
        match self {
            Self::Indonesian => "fallback_id",
            Self::English => "fallback_en",
        }
    }
}

/// The rendered prompt plus whether this was the fallback branch (no
/// context retrieved). Callers use `is_fallback` to drive the confidence
/// formula (§4.6: fallback ⇒ confidence 0.0).
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPrompt {
    pub text: String,
    pub is_fallback: bool,
}

/// Renders prompts from a fixed set of compiled-in templates.
pub struct PromptRenderer {
    tera: Tera,
}

impl PromptRenderer {
    pub fn new() -> RagResult<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("prompt", TPL_PROMPT),
            ("system_id", TPL_SYSTEM_ID),
            ("fallback_id", TPL_FALLBACK_ID),
            ("system_en", TPL_SYSTEM_EN),
            ("fallback_en", TPL_FALLBACK_EN),
        ])
        .map_err(|e| RagError::Template(e.to_string()))?;
        Ok(Self { tera })
    }

    /// Render a prompt for `selected` chunks and `question` in `language`.
    ///
    /// An empty `selected` set takes the fallback branch: the system
    /// instructions become the localized "material not available" message
    /// and no context block is rendered (§4.3 edge case).
    pub fn render(
        &self,
        selected: &[RetrievedChunk],
        question: &str,
        language: Language,
    ) -> RagResult<RenderedPrompt> {
        let is_fallback = selected.is_empty();

        let system_template = if is_fallback {
            language.fallback_template_name()
        } else {
            language.system_template_name()
        };
        let system_instructions = self
            .tera
            .render(system_template, &TeraContext::new())
            .map_err(|e| RagError::Template(e.to_string()))?
            .trim()
            .to_string();

        let context_block = if is_fallback {
            String::new()
        } else {
            render_context_block(selected)
        };

        let mut ctx = TeraContext::new();
        ctx.insert("system_instructions", &system_instructions);
        ctx.insert("context_block", &context_block);
        ctx.insert("question", question);

        let text = self
            .tera
            .render("prompt", &ctx)
            .map_err(|e| RagError::Template(e.to_string()))?;

        Ok(RenderedPrompt { text, is_fallback })
    }
}

fn render_context_block(selected: &[RetrievedChunk]) -> String {
    let mut out = String::new();
    for chunk in selected {
        out.push_str(&format!(
            "[source: {}, {}]\n{}\n\n",
            chunk.book_title, chunk.ordinal, chunk.text
        ));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, ordinal: u32) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: format!("c-{ordinal}"),
            text: text.into(),
            book_id: "book-1".into(),
            book_title: "Buku Informatika".into(),
            ordinal,
            token_count: 10,
            score: 0.8,
            subject_match: true,
        }
    }

    #[test]
    fn render_is_deterministic() {
        let renderer = PromptRenderer::new().unwrap();
        let chunks = vec![chunk("Variabel adalah tempat menyimpan nilai.", 0)];
        let a = renderer.render(&chunks, "apa itu variabel?", Language::Indonesian).unwrap();
        let b = renderer.render(&chunks, "apa itu variabel?", Language::Indonesian).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_fallback);
        assert!(a.text.contains("[source: Buku Informatika, 0]"));
        assert!(a.text.contains("apa itu variabel?"));
    }

    #[test]
    fn empty_selection_renders_fallback() {
        let renderer = PromptRenderer::new().unwrap();
        let rendered = renderer.render(&[], "apa itu variabel?", Language::Indonesian).unwrap();
        assert!(rendered.is_fallback);
        assert!(rendered.text.contains("belum tersedia"));
        assert!(!rendered.text.contains("## Context"));
    }

    #[test]
    fn unknown_language_is_rejected() {
        assert!(Language::from_code("fr").is_err());
        assert!(Language::from_code("en").is_ok());
    }
}
