//! Response protocol: prompts, payload extraction, strict validation.
//!
//! Model output is untrusted input. Validation is fail-closed: a single key
//! outside the allowed sets, at the root or inside any item, rejects the whole
//! response with `BAD_RESPONSE`. Unknown *values* for `type`/`severity` are
//! not an attack surface and fall back to defaults instead.

use serde_json::{Map, Value};

use feedq_core::Subject;

use crate::result::{Category, ProviderError, ResultItem, Severity};

pub const ROOT_KEYS: [&str; 2] = ["items", "meta"];

pub const ITEM_KEYS: [&str; 6] = ["type", "severity", "message", "suggestion", "tags", "scoreHint"];

/// Tags a stored item may carry. Anything else becomes [`CATCH_ALL_TAG`].
pub const TAG_VOCABULARY: [&str; 15] = [
    "naming",
    "readability",
    "complexity",
    "duplication",
    "error-handling",
    "performance",
    "security",
    "testing",
    "documentation",
    "formatting",
    "style",
    "logic",
    "memory",
    "concurrency",
    "other",
];

pub const CATCH_ALL_TAG: &str = "other";

pub const DEFAULT_CATEGORY: Category = Category::Other;

pub const DEFAULT_SEVERITY: Severity = Severity::Warn;

const FENCE_OPEN: &str = "```json";
const FENCE_CLOSE: &str = "```";

/// Fixed instruction prompt. Enumerates every key and enum value the
/// validator accepts.
pub fn system_prompt() -> String {
    let categories: Vec<&str> = Category::ALL.iter().map(Category::as_str).collect();
    let severities: Vec<&str> = Severity::ALL.iter().map(Severity::as_str).collect();

    format!(
        "You are a code reviewer. Reply with a single JSON object and nothing else.\n\
         Allowed root keys: {root}. \"items\" is an array, \"meta\" is an optional object.\n\
         Allowed item keys: {item}. \"message\" is required and non-empty.\n\
         \"type\" must be one of: {categories}.\n\
         \"severity\" must be one of: {severities}.\n\
         \"tags\" is an array of strings drawn from: {tags}.\n\
         \"scoreHint\" is an optional number.\n\
         Do not add any other keys.",
        root = ROOT_KEYS.join(", "),
        item = ITEM_KEYS.join(", "),
        categories = categories.join(", "),
        severities = severities.join(", "),
        tags = TAG_VOCABULARY.join(", "),
    )
}

/// Subject content cut to a character budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedContent<'a> {
    pub text: &'a str,
    pub truncated: bool,
    pub original_chars: usize,
}

/// Truncate on a char boundary to at most `max_chars` characters.
pub fn truncate_content(content: &str, max_chars: usize) -> PreparedContent<'_> {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => PreparedContent {
            text: &content[..cut],
            truncated: true,
            original_chars: content.chars().count(),
        },
        None => PreparedContent {
            text: content,
            truncated: false,
            original_chars: content.chars().count(),
        },
    }
}

/// User prompt for one subject. Returns the prompt and whether the content
/// was truncated.
pub fn user_prompt(subject: &Subject, max_chars: usize) -> (String, bool) {
    let prepared = truncate_content(&subject.content, max_chars);
    let mut prompt = format!(
        "Review the following {} code.\n\n{}\n",
        subject.language, prepared.text
    );
    if prepared.truncated {
        prompt.push_str(&format!(
            "\n[content truncated to {} of {} characters]\n",
            max_chars, prepared.original_chars
        ));
    }
    (prompt, prepared.truncated)
}

/// Parse the provider's text payload as JSON.
///
/// Tries the whole text first, then the interior of the first
/// ```` ```json ```` fenced block.
pub fn extract_json(text: &str) -> Result<Value, ProviderError> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return Ok(value);
    }

    fenced_block(text)
        .and_then(|inner| serde_json::from_str::<Value>(inner.trim()).ok())
        .ok_or_else(|| ProviderError::bad_response("response is not valid JSON"))
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.to_ascii_lowercase().find(FENCE_OPEN)?;
    let body_start = open + FENCE_OPEN.len();
    let rest = &text[body_start..];
    let close = rest.find(FENCE_CLOSE)?;
    Some(&rest[..close])
}

/// Validate a parsed payload and turn it into at most `max_items` items.
pub fn validate_response(value: &Value, max_items: usize) -> Result<Vec<ResultItem>, ProviderError> {
    let root = value
        .as_object()
        .ok_or_else(|| ProviderError::bad_response("response root must be an object"))?;

    if root.is_empty() {
        return Err(ProviderError::bad_response("response root has no keys"));
    }
    reject_unknown_keys(root, &ROOT_KEYS, "root")?;

    if let Some(meta) = root.get("meta") {
        if !meta.is_object() {
            return Err(ProviderError::bad_response("`meta` must be an object"));
        }
    }

    let raw_items = match root.get("items") {
        None => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ProviderError::bad_response("`items` must be an array")),
    };

    // Every item is checked before truncation: a smuggled key past the
    // cut-off still rejects the response.
    let mut items = raw_items
        .iter()
        .enumerate()
        .map(|(idx, raw)| validate_item(idx, raw))
        .collect::<Result<Vec<_>, _>>()?;

    items.truncate(max_items);
    Ok(items)
}

fn reject_unknown_keys(
    object: &Map<String, Value>,
    allowed: &[&str],
    location: &str,
) -> Result<(), ProviderError> {
    match object.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(ProviderError::bad_response(format!(
            "unexpected key `{key}` in {location}"
        ))),
        None => Ok(()),
    }
}

fn validate_item(idx: usize, raw: &Value) -> Result<ResultItem, ProviderError> {
    let location = format!("item {idx}");
    let item = raw
        .as_object()
        .ok_or_else(|| ProviderError::bad_response(format!("{location} must be an object")))?;
    reject_unknown_keys(item, &ITEM_KEYS, &location)?;

    let message = item
        .get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            ProviderError::bad_response(format!("{location}: `message` must be a non-empty string"))
        })?;

    let category = item
        .get("type")
        .and_then(Value::as_str)
        .and_then(Category::parse)
        .unwrap_or(DEFAULT_CATEGORY);

    let severity = item
        .get("severity")
        .and_then(Value::as_str)
        .and_then(Severity::parse)
        .unwrap_or(DEFAULT_SEVERITY);

    let suggestion = item
        .get("suggestion")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let tags = match item.get("tags") {
        Some(Value::Array(raw_tags)) => normalize_tags(raw_tags.iter().filter_map(Value::as_str)),
        _ => Vec::new(),
    };

    Ok(ResultItem {
        category,
        severity,
        message: message.to_string(),
        suggestion,
        tags,
        score_hint: item.get("scoreHint").and_then(coerce_score),
    })
}

fn coerce_score(value: &Value) -> Option<f64> {
    let score = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    score.is_finite().then_some(score)
}

/// Lower-case, trim, and collapse runs of whitespace, underscores and
/// hyphens into a single hyphen. Does not consult the vocabulary.
pub fn normalize_tag(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_sep = false;

    for ch in lowered.chars() {
        if ch.is_whitespace() || ch == '_' || ch == '-' {
            pending_sep = true;
            continue;
        }
        if pending_sep && !out.is_empty() {
            out.push('-');
        }
        pending_sep = false;
        out.push(ch);
    }
    out
}

/// Normalize, map to the vocabulary, dedupe. Order of first appearance is
/// kept; empty tags are dropped.
pub fn normalize_tags<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in raw {
        let normalized = normalize_tag(tag);
        if normalized.is_empty() {
            continue;
        }
        let mapped = if TAG_VOCABULARY.contains(&normalized.as_str()) {
            normalized
        } else {
            CATCH_ALL_TAG.to_string()
        };
        if !out.contains(&mapped) {
            out.push(mapped);
        }
    }
    out
}
