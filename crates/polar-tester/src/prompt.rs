//! Prompt assembly: context documents + requirement → [`GenerationRequest`].
//!
//! Assembly is a pure transformation. Reading context files from disk is a
//! separate step ([`load_contexts`]) so the assembler can be tested without
//! I/O and reused by callers that source context text elsewhere.

use std::path::Path;

use crate::error::{Error, Result};

/// Opening instructions of every system message.
pub const SYSTEM_PREAMBLE: &str = "You are an expert author of Polar authorization policies. \
Use the reference material below to write a policy that satisfies the user's requirement. \
Return only Polar source code, without markdown formatting or commentary.";

/// Closing instruction appended to correction requests.
pub const CORRECTION_INSTRUCTION: &str = "The previous policy failed validation. Fix every \
error reported by the validator and return only the corrected Polar policy.";

// ── Request ────────────────────────────────────────────────────────

/// Per-request overrides for the model client's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOverrides {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// An assembled, immutable model request.
///
/// Build with [`assemble`]; derive a correction request with
/// [`GenerationRequest::retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    contexts: Vec<String>,
    requirement: String,
    prior_attempt: Option<String>,
    prior_error: Option<String>,
    overrides: ModelOverrides,
}

/// Assemble a request from ordered context texts and a requirement.
///
/// Fails with [`Error::Configuration`] when `contexts` is empty or the
/// requirement is blank. The correction section is only rendered when both
/// `prior_attempt` and `prior_error` are present.
pub fn assemble(
    contexts: Vec<String>,
    requirement: impl Into<String>,
    prior_attempt: Option<String>,
    prior_error: Option<String>,
) -> Result<GenerationRequest> {
    if contexts.is_empty() {
        return Err(Error::Configuration(
            "at least one context document is required".into(),
        ));
    }
    let requirement = requirement.into();
    if requirement.trim().is_empty() {
        return Err(Error::Configuration("requirement text is empty".into()));
    }
    Ok(GenerationRequest {
        contexts,
        requirement,
        prior_attempt,
        prior_error,
        overrides: ModelOverrides::default(),
    })
}

impl GenerationRequest {
    /// Attach model overrides (model name, temperature, max tokens).
    pub fn with_overrides(mut self, overrides: ModelOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// The request for the next attempt: same contexts, requirement, and
    /// overrides, with the failed candidate and the validator's message.
    pub fn retry(&self, prior_attempt: impl Into<String>, prior_error: impl Into<String>) -> Self {
        Self {
            contexts: self.contexts.clone(),
            requirement: self.requirement.clone(),
            prior_attempt: Some(prior_attempt.into()),
            prior_error: Some(prior_error.into()),
            overrides: self.overrides.clone(),
        }
    }

    pub fn contexts(&self) -> &[String] {
        &self.contexts
    }

    pub fn requirement(&self) -> &str {
        &self.requirement
    }

    pub fn prior_attempt(&self) -> Option<&str> {
        self.prior_attempt.as_deref()
    }

    pub fn prior_error(&self) -> Option<&str> {
        self.prior_error.as_deref()
    }

    pub fn overrides(&self) -> &ModelOverrides {
        &self.overrides
    }

    /// Whether this request asks the model to correct a previous attempt.
    pub fn is_correction(&self) -> bool {
        self.prior_attempt.is_some() && self.prior_error.is_some()
    }

    /// Render the system message: preamble plus every context document.
    pub fn system_message(&self) -> String {
        self.contexts
            .iter()
            .enumerate()
            .fold(PromptBuilder::new(SYSTEM_PREAMBLE), |b, (i, ctx)| {
                b.section(&format!("Context {}", i + 1), ctx.as_str())
            })
            .build()
    }

    /// Render the user message: the requirement, plus the correction
    /// section when this is a retry.
    pub fn user_message(&self) -> String {
        let builder = PromptBuilder::new("").section("Requirement", self.requirement.as_str());
        match (&self.prior_attempt, &self.prior_error) {
            (Some(attempt), Some(error)) => builder
                .section("Previous attempt", format!("```polar\n{}\n```", attempt.trim_end()))
                .section("Validator error", format!("```\n{}\n```", error.trim_end()))
                .raw(CORRECTION_INSTRUCTION)
                .build(),
            _ => builder.build(),
        }
    }
}

// ── PromptBuilder ──────────────────────────────────────────────────

/// Builder for multi-section markdown prompts.
///
/// Sections are joined with blank lines; empty sections and an empty
/// preamble are skipped.
///
/// ```
/// use polar_tester::prompt::PromptBuilder;
///
/// let prompt = PromptBuilder::new("Preamble")
///     .section("Reference", "allow(actor, action, resource) if ...;")
///     .section("Empty", "")
///     .build();
///
/// assert!(prompt.starts_with("Preamble"));
/// assert!(prompt.contains("## Reference"));
/// assert!(!prompt.contains("## Empty"));
/// ```
pub struct PromptBuilder {
    sections: Vec<String>,
}

impl PromptBuilder {
    pub fn new(preamble: impl Into<String>) -> Self {
        let preamble = preamble.into();
        let sections = if preamble.is_empty() {
            Vec::new()
        } else {
            vec![preamble]
        };
        Self { sections }
    }

    /// Append a `## heading` section. Skipped if `content` is empty.
    pub fn section(mut self, heading: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        if !content.trim().is_empty() {
            self.sections.push(format!("## {heading}\n\n{}", content.trim_end()));
        }
        self
    }

    /// Append text without a heading. Skipped if empty.
    pub fn raw(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.trim().is_empty() {
            self.sections.push(text);
        }
        self
    }

    pub fn build(self) -> String {
        self.sections.join("\n\n")
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Strip a surrounding markdown code fence (```` ```polar ```` or
/// ```` ``` ````) from model output.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string (e.g. "polar") on the opening fence line.
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => strip_inline_language(rest),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
        .to_string()
}

/// Info strings recognised on a single-line fence.
const FENCE_LANGUAGES: &[&str] = &["polar", "oso", "text"];

/// ```` ```polar allow(...);``` ```` has no newline to end the info string,
/// so only a known language tag followed by whitespace is removed.
fn strip_inline_language(rest: &str) -> &str {
    match rest.split_once(char::is_whitespace) {
        Some((tag, body)) if FENCE_LANGUAGES.iter().any(|l| tag.eq_ignore_ascii_case(l)) => {
            body
        }
        _ => rest,
    }
}

/// Read context documents from disk, preserving order.
///
/// Fails with [`Error::Configuration`] naming the first unreadable file.
pub async fn load_contexts<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<String>> {
    let mut contexts = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Configuration(format!("failed to read context file {}: {e}", path.display()))
        })?;
        tracing::debug!("Loaded context {} ({} bytes)", path.display(), text.len());
        contexts.push(text);
    }
    Ok(contexts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_has_reference_and_requirement_but_no_correction() {
        let req = assemble(
            vec!["Policy reference text".into()],
            "create a read-only policy for Documents",
            None,
            None,
        )
        .unwrap();

        assert!(req.system_message().contains("Policy reference text"));
        let user = req.user_message();
        assert!(user.contains("create a read-only policy for Documents"));
        assert!(!user.contains("Previous attempt"));
        assert!(!user.contains("Validator error"));
        assert!(!req.is_correction());
    }

    #[test]
    fn empty_contexts_is_configuration_error() {
        let err = assemble(vec![], "anything", None, None).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn blank_requirement_is_configuration_error() {
        let err = assemble(vec!["ctx".into()], "   ", None, None).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn retry_quotes_prior_attempt_and_exact_error() {
        let req = assemble(vec!["ctx".into()], "req", None, None).unwrap();
        let retry = req.retry("actor User {", "error: unexpected end of input at line 1");

        assert!(retry.is_correction());
        let user = retry.user_message();
        assert!(user.contains("## Previous attempt"));
        assert!(user.contains("actor User {"));
        assert!(user.contains("error: unexpected end of input at line 1"));
        assert!(user.contains(CORRECTION_INSTRUCTION));
        assert_eq!(retry.contexts(), req.contexts());
        assert_eq!(retry.requirement(), "req");
    }

    #[test]
    fn only_prior_attempt_renders_no_correction() {
        let req = assemble(vec!["ctx".into()], "req", Some("old".into()), None).unwrap();
        assert!(!req.is_correction());
        assert!(!req.user_message().contains("Previous attempt"));
    }

    #[test]
    fn contexts_keep_their_order() {
        let req = assemble(vec!["first".into(), "second".into()], "req", None, None).unwrap();
        let sys = req.system_message();
        let a = sys.find("## Context 1").unwrap();
        let b = sys.find("## Context 2").unwrap();
        assert!(a < b);
        assert!(sys.find("first").unwrap() < sys.find("second").unwrap());
    }

    #[test]
    fn retry_keeps_overrides() {
        let overrides = ModelOverrides {
            model: Some("gpt-4o".into()),
            temperature: Some(0.2),
            max_tokens: None,
        };
        let req = assemble(vec!["ctx".into()], "req", None, None)
            .unwrap()
            .with_overrides(overrides.clone());
        assert_eq!(req.retry("a", "b").overrides(), &overrides);
    }

    #[test]
    fn strip_code_fence_variants() {
        assert_eq!(strip_code_fence("```polar\nactor User {}\n```"), "actor User {}");
        assert_eq!(strip_code_fence("```\nallow(a, b, c);\n```\n"), "allow(a, b, c);");
        assert_eq!(strip_code_fence("  plain text  "), "plain text");
        assert_eq!(strip_code_fence("```polar\nunterminated"), "unterminated");
    }

    #[test]
    fn strip_single_line_fence() {
        assert_eq!(strip_code_fence("```polar allow(a,b,c);```"), "allow(a,b,c);");
        assert_eq!(strip_code_fence("```allow(a,b,c);```"), "allow(a,b,c);");
        // Polar keywords are not mistaken for a language tag.
        assert_eq!(strip_code_fence("```actor User {}```"), "actor User {}");
    }

    #[tokio::test]
    async fn load_contexts_reads_in_order_and_names_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mdx");
        let b = dir.path().join("b.polar");
        std::fs::write(&a, "alpha").unwrap();
        std::fs::write(&b, "beta").unwrap();

        let texts = load_contexts(&[&a, &b]).await.unwrap();
        assert_eq!(texts, vec!["alpha".to_string(), "beta".to_string()]);

        let missing = dir.path().join("missing.mdx");
        let err = load_contexts(&[missing]).await.unwrap_err();
        assert!(err.to_string().contains("missing.mdx"));
    }
}
