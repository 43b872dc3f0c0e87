// ✍️ Normalizer - Free-text dream → canonical title + 1..3 taxonomy pairs
// One model call per entry; JSON recovered from fenced or chatty output.

use crate::db::{CategoryPair, NormalizedResult, MAX_CATEGORY_PAIRS};
use crate::error::{PipelineError, UpstreamError};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// LANGUAGE MODEL SEAM
// ============================================================================

/// Text-generation backend used by the normalizer
pub trait LanguageModel {
    /// Send one prompt, return the raw completion text
    fn complete(&self, prompt: &str) -> Result<String, UpstreamError>;

    /// Model identifier recorded on every result
    fn model_name(&self) -> &str;
}

impl<T: LanguageModel + ?Sized> LanguageModel for &T {
    fn complete(&self, prompt: &str) -> Result<String, UpstreamError> {
        (**self).complete(prompt)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

impl<T: LanguageModel + ?Sized> LanguageModel for Box<T> {
    fn complete(&self, prompt: &str) -> Result<String, UpstreamError> {
        (**self).complete(prompt)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Normalizer output before it is bound to an entry id
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub title: String,
    pub categories: Vec<CategoryPair>,
    pub is_fallback: bool,
}

impl Normalized {
    pub fn into_result(self, entry_id: i64, model: &str) -> NormalizedResult {
        NormalizedResult {
            entry_id,
            normalized_title: self.title,
            categories: self.categories,
            is_fallback: self.is_fallback,
            model: model.to_string(),
            normalized_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum NormalizeError {
    /// No JSON object (or no usable title) could be recovered
    #[error("unparseable model output: {raw:?}")]
    Parse { raw: String },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl NormalizeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            NormalizeError::Parse { .. } => false,
            NormalizeError::Upstream(e) => e.is_retryable(),
        }
    }
}

impl From<NormalizeError> for PipelineError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::Parse { raw } => PipelineError::Parse { raw },
            NormalizeError::Upstream(e) => PipelineError::Upstream(e),
        }
    }
}

// ============================================================================
// NORMALIZER
// ============================================================================

pub struct Normalizer<M> {
    model: M,
}

impl<M: LanguageModel> Normalizer<M> {
    pub fn new(model: M) -> Self {
        Normalizer { model }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Normalize one raw dream text
    pub fn normalize(&self, original_text: &str) -> Result<Normalized, NormalizeError> {
        if original_text.trim().is_empty() {
            return Err(NormalizeError::Parse {
                raw: original_text.to_string(),
            });
        }

        let prompt = build_prompt(original_text);
        let raw = self.model.complete(&prompt)?;
        parse_model_output(&raw)
    }
}

pub fn build_prompt(original_text: &str) -> String {
    format!(
        r#"You normalize people's dreams and life goals into a canonical short title and a taxonomy.

Rules:
- If the dream is not in English (for example Hebrew), translate it to English first.
- The title is a short generic phrase of 2-5 words, lowercase, starting with a verb, without "to".
- Remove locations, numbers, names, years and brands. Keep only the core concept.
- Assign between 1 and 3 (category, subcategory) pairs, most relevant first.

Examples:
"i want to become a doctor one day" -> {{"title": "become doctor", "categories": [{{"category": "Career", "subcategory": "Medicine"}}]}}
"buy 3 houses in Tel Aviv" -> {{"title": "buy property", "categories": [{{"category": "Financial", "subcategory": "Real Estate"}}]}}
"become a YouTube star with 1M subscribers" -> {{"title": "become content creator", "categories": [{{"category": "Career", "subcategory": "Digital Creator"}}, {{"category": "Fame", "subcategory": "Social Media"}}]}}

Reply with ONLY a JSON object of the form:
{{"title": "...", "categories": [{{"category": "...", "subcategory": "..."}}]}}

Dream: {original_text}"#
    )
}

// ============================================================================
// PARSING
// ============================================================================

/// Parse a completion into a `Normalized`, recovering an embedded JSON object
/// when the model wraps it in prose or code fences.
pub fn parse_model_output(raw: &str) -> Result<Normalized, NormalizeError> {
    let parse_error = || NormalizeError::Parse {
        raw: raw.to_string(),
    };

    let object = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value @ Value::Object(_)) => value,
        _ => extract_json_object(raw).ok_or_else(parse_error)?,
    };

    let title = ["title", "normalized_title", "normalized"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(clean_title)
        .filter(|t| !t.is_empty())
        .ok_or_else(parse_error)?;

    let categories = sanitize_categories(object.get("categories"));
    let is_fallback = categories.is_empty();
    let categories = if is_fallback {
        vec![CategoryPair::fallback()]
    } else {
        categories
    };

    Ok(Normalized {
        title,
        categories,
        is_fallback,
    })
}

/// Find the first balanced `{...}` that parses as a JSON object
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;

    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(close) = matching_brace(bytes, open) {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&text[open..=close]) {
                return Some(value);
            }
        }
        start = open + 1;
    }

    None
}

/// Index of the brace closing the one at `open`, skipping string contents
fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Keep valid, distinct pairs in model order, at most three.
/// Accepts `{"category", "subcategory"}` objects, `[cat, sub]` arrays and
/// `"Cat|Sub"` strings.
fn sanitize_categories(value: Option<&Value>) -> Vec<CategoryPair> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    let mut pairs: Vec<CategoryPair> = Vec::new();

    for item in items {
        let pair = match item {
            Value::Object(map) => {
                let category = map.get("category").and_then(Value::as_str);
                let subcategory = map.get("subcategory").and_then(Value::as_str);
                category.zip(subcategory).map(|(c, s)| CategoryPair::new(c.trim(), s.trim()))
            }
            Value::Array(parts) if parts.len() == 2 => parts[0]
                .as_str()
                .zip(parts[1].as_str())
                .map(|(c, s)| CategoryPair::new(c.trim(), s.trim())),
            Value::String(s) => s
                .split_once('|')
                .or_else(|| s.split_once('>'))
                .map(|(c, s)| CategoryPair::new(c.trim(), s.trim())),
            _ => None,
        };

        if let Some(pair) = pair {
            if pair.is_valid() && !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }

        if pairs.len() == MAX_CATEGORY_PAIRS {
            break;
        }
    }

    pairs
}

/// Lowercase, unquoted, single-spaced, no trailing punctuation, no leading "to "
pub fn clean_title(raw: &str) -> String {
    let unwrapped = raw
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '`');

    let mut title = unwrapped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    while title.ends_with(['.', '!', ',', ';', ':']) {
        title.pop();
    }

    while let Some(rest) = title.strip_prefix("to ") {
        title = rest.to_string();
    }

    title.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct ScriptedModel {
        replies: RefCell<Vec<Result<String, UpstreamError>>>,
        prompts: RefCell<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String, UpstreamError>>) -> Self {
            ScriptedModel {
                replies: RefCell::new(replies),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl LanguageModel for ScriptedModel {
        fn complete(&self, prompt: &str) -> Result<String, UpstreamError> {
            self.prompts.borrow_mut().push(prompt.to_string());
            self.replies.borrow_mut().remove(0)
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    #[test]
    fn test_doctor_scenario() {
        let model = ScriptedModel::new(vec![Ok(
            r#"{"title": "become doctor", "categories": [{"category": "Career", "subcategory": "Medicine"}]}"#
                .to_string(),
        )]);
        let normalizer = Normalizer::new(&model);

        let result = normalizer.normalize("i want to become a doctor one day").unwrap();

        assert_eq!(result.title, "become doctor");
        assert_eq!(result.categories, vec![CategoryPair::new("Career", "Medicine")]);
        assert!(!result.is_fallback);
        assert!(model.prompts.borrow()[0].contains("i want to become a doctor one day"));
    }

    #[test]
    fn test_embedded_json_in_prose_and_fences() {
        let raw = "Sure! Here is the result:\n```json\n{\"title\": \"To Buy Property.\", \"categories\": [{\"category\": \"Financial\", \"subcategory\": \"Real Estate\"}]}\n```\nHope it helps {not json}";
        let result = parse_model_output(raw).unwrap();

        assert_eq!(result.title, "buy property");
        assert_eq!(result.categories, vec![CategoryPair::new("Financial", "Real Estate")]);
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_extraction() {
        let raw = r#"noise {"title": "write a {great} novel", "categories": [["Creativity", "Writing"]]} tail"#;
        let result = parse_model_output(raw).unwrap();

        assert_eq!(result.title, "write a {great} novel");
        assert_eq!(result.categories, vec![CategoryPair::new("Creativity", "Writing")]);
    }

    #[test]
    fn test_no_json_is_parse_error() {
        let err = parse_model_output("I cannot help with that.").unwrap_err();
        assert!(matches!(err, NormalizeError::Parse { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_missing_title_is_parse_error() {
        let err = parse_model_output(r#"{"categories": []}"#).unwrap_err();
        assert!(matches!(err, NormalizeError::Parse { .. }));
    }

    #[test]
    fn test_missing_or_malformed_categories_fall_back() {
        for raw in [
            r#"{"title": "get rich"}"#,
            r#"{"title": "get rich", "categories": "Financial"}"#,
            r#"{"title": "get rich", "categories": [{"category": "", "subcategory": "Wealth"}]}"#,
            r#"{"title": "get rich", "categories": [42, null]}"#,
        ] {
            let result = parse_model_output(raw).unwrap();
            assert!(result.is_fallback, "expected fallback for {raw}");
            assert_eq!(result.categories, vec![CategoryPair::fallback()]);
        }
    }

    #[test]
    fn test_categories_truncated_and_deduplicated() {
        let raw = r#"{"title": "travel", "categories": [
            {"category": "Travel", "subcategory": "Adventure"},
            {"category": "Travel", "subcategory": "Adventure"},
            "Personal|Growth",
            {"category": "Culture", "subcategory": "Food"},
            {"category": "Extra", "subcategory": "Dropped"}
        ]}"#;
        let result = parse_model_output(raw).unwrap();

        assert_eq!(
            result.categories,
            vec![
                CategoryPair::new("Travel", "Adventure"),
                CategoryPair::new("Personal", "Growth"),
                CategoryPair::new("Culture", "Food"),
            ]
        );
        assert!(!result.is_fallback);
    }

    #[test]
    fn test_upstream_error_passes_through() {
        let model = ScriptedModel::new(vec![Err(UpstreamError::new(
            crate::error::UpstreamKind::RateLimited,
            "429",
        ))]);
        let err = Normalizer::new(&model).normalize("see the northern lights").unwrap_err();

        assert!(matches!(err, NormalizeError::Upstream(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_blank_input_never_calls_model() {
        let model = ScriptedModel::new(vec![]);
        let err = Normalizer::new(&model).normalize("   ").unwrap_err();

        assert!(matches!(err, NormalizeError::Parse { .. }));
        assert!(model.prompts.borrow().is_empty());
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("  \"To  Become a   Pilot.\" "), "become a pilot");
        assert_eq!(clean_title("**open a business**"), "open a business");
        assert_eq!(clean_title("to to get married!"), "get married");
    }
}
