//! Evidence extraction — applies a job's patterns to one candidate message.
//!
//! Patterns are compiled into [`Rule`]s per evaluation. A pattern that fails
//! to compile or evaluate is skipped and named in [`EvidenceResult::skipped`];
//! the remaining patterns still run.
//!
//! Evaluation order is descending priority (stable, so ties keep declaration
//! order). When two patterns share an extraction name, the last successful
//! write wins.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use cronwatch_core::error::CronWatchError;
use cronwatch_core::types::{
    CandidateMessage, Completeness, EvidenceResult, MailPattern, PatternKind, TargetField,
};
use regex::Regex;
use serde_json::Value;

/// `/source/flags` flags that map onto inline regex flags.
const INLINE_FLAGS: &str = "imsx";
/// Flags accepted for compatibility but without effect here.
const IGNORED_FLAGS: &str = "gu";

static DURATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?:処理時間|実行時間|所要時間)[：:]\s*(\d+)\s*秒",
        r"(?i)(?:execution|processing|elapsed|run)\s+time\s*[：:=]\s*(\d+)",
        r"(?i)\bduration\s*[：:=]\s*(\d+)",
        r"(?i)\btook\s+(\d+)\s*s(?:ec(?:ond)?s?)?\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// A compiled pattern. One variant per pattern kind.
#[derive(Debug)]
enum Rule {
    Regex(Regex),
    Keyword(String),
    JsonPath(Vec<String>),
}

impl Rule {
    fn compile(pattern: &MailPattern) -> Result<Self, CronWatchError> {
        match pattern.kind {
            PatternKind::Regex => compile_regex(&pattern.value).map(Rule::Regex).map_err(|e| {
                CronWatchError::ExtractionPattern {
                    pattern: pattern.name.clone(),
                    reason: e.to_string(),
                }
            }),
            PatternKind::Keyword => Ok(Rule::Keyword(pattern.value.clone())),
            PatternKind::JsonPath => Ok(Rule::JsonPath(
                pattern
                    .value
                    .split('.')
                    .filter(|segment| !segment.is_empty())
                    .map(String::from)
                    .collect(),
            )),
        }
    }

    /// `Ok(None)` means "no value here"; `Err` means the pattern itself failed.
    fn apply(&self, text: &str) -> Result<Option<Value>, String> {
        match self {
            Rule::Regex(re) => Ok(re.captures(text).and_then(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| Value::String(m.as_str().to_string()))
            })),
            Rule::Keyword(word) => Ok(Some(Value::Bool(text.contains(word.as_str())))),
            Rule::JsonPath(path) => {
                let Some(document) = locate_json(text) else {
                    return Ok(None);
                };
                let root: Value = serde_json::from_str(&document)
                    .map_err(|e| format!("malformed JSON: {e}"))?;
                Ok(walk(&root, path).cloned())
            }
        }
    }
}

/// Split a `/source/flags` value. Returns `None` for a bare pattern.
pub fn parse_delimited(value: &str) -> Option<(&str, &str)> {
    let rest = value.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let (source, flags) = (&rest[..end], &rest[end + 1..]);
    if source.is_empty() {
        return None;
    }
    flags
        .chars()
        .all(|c| INLINE_FLAGS.contains(c) || IGNORED_FLAGS.contains(c))
        .then_some((source, flags))
}

/// Compile a regex value, honouring `/source/flags` delimiters.
pub fn compile_regex(value: &str) -> Result<Regex, regex::Error> {
    let Some((source, flags)) = parse_delimited(value) else {
        return Regex::new(value);
    };
    let mut inline = String::new();
    for c in flags.chars().filter(|c| INLINE_FLAGS.contains(*c)) {
        if !inline.contains(c) {
            inline.push(c);
        }
    }
    if inline.is_empty() {
        Regex::new(source)
    } else {
        Regex::new(&format!("(?{inline}){source}"))
    }
}

/// Apply `patterns` to `message`.
pub fn extract(message: &CandidateMessage, patterns: &[MailPattern]) -> EvidenceResult {
    let mut ordered: Vec<&MailPattern> = patterns.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut fields = BTreeMap::new();
    let mut skipped = Vec::new();

    for pattern in ordered {
        let rule = match Rule::compile(pattern) {
            Ok(rule) => rule,
            Err(e) => {
                tracing::warn!("⚠️ {e}");
                skipped.push(pattern.name.clone());
                continue;
            }
        };

        let mut found = None;
        let mut failure = None;
        for text in source_texts(message, pattern.target, pattern.kind) {
            match rule.apply(&text) {
                Ok(Some(value)) => {
                    found = Some(value);
                    break;
                }
                Ok(None) => {}
                Err(reason) => failure = Some(reason),
            }
        }

        match (found, failure) {
            (Some(value), _) => {
                fields.insert(pattern.extraction_name.clone(), value);
            }
            (None, Some(reason)) => {
                tracing::debug!("Pattern '{}' skipped: {reason}", pattern.name);
                skipped.push(pattern.name.clone());
            }
            (None, None) => {}
        }
    }

    let complete = patterns
        .iter()
        .filter(|p| p.required)
        .all(|p| fields.contains_key(&p.extraction_name));

    EvidenceResult {
        fields,
        completeness: if complete {
            Completeness::Complete
        } else {
            Completeness::Partial
        },
        message_id: Some(message.message_id.clone()),
        received_at: Some(message.received_at),
        skipped,
    }
}

/// The newest message in the pool by receipt time.
pub fn select_candidate(pool: &[CandidateMessage]) -> Option<&CandidateMessage> {
    pool.iter().max_by_key(|m| m.received_at)
}

/// Extract from the newest candidate; an empty pool yields `Completeness::None`.
pub fn evaluate(pool: &[CandidateMessage], patterns: &[MailPattern]) -> EvidenceResult {
    match select_candidate(pool) {
        Some(message) => extract(message, patterns),
        None => EvidenceResult::none(),
    }
}

/// Run time reported in a confirmation body ("Execution time: 42"), in seconds.
pub fn execution_duration_secs(text: &str) -> Option<u64> {
    DURATION_PATTERNS
        .iter()
        .find_map(|re| re.captures(text)?.get(1)?.as_str().parse().ok())
}

/// Texts a pattern is tried against, in preference order. Empty fields are skipped.
fn source_texts(message: &CandidateMessage, target: TargetField, kind: PatternKind) -> Vec<Cow<'_, str>> {
    let texts: Vec<Cow<'_, str>> = match target {
        TargetField::Subject => vec![Cow::Borrowed(message.subject.as_str())],
        TargetField::Body => match (&message.html_body, kind) {
            (Some(html), PatternKind::JsonPath) => {
                vec![Cow::Borrowed(html.as_str()), Cow::Borrowed(message.body.as_str())]
            }
            _ => vec![Cow::Borrowed(message.body.as_str())],
        },
        TargetField::From => vec![Cow::Borrowed(message.from.as_str())],
        TargetField::To => vec![Cow::Borrowed(message.to.as_str())],
        TargetField::Headers => {
            if message.headers.is_empty() {
                Vec::new()
            } else {
                // BTreeMap keeps the serialization canonical.
                serde_json::to_string(&message.headers)
                    .map(|json| vec![Cow::Owned(json)])
                    .unwrap_or_default()
            }
        }
    };
    texts.into_iter().filter(|t| !t.trim().is_empty()).collect()
}

/// Find a JSON document: a `<pre>` block, a fenced block, then the first balanced object.
fn locate_json(text: &str) -> Option<String> {
    if let Some(inner) = pre_block(text) {
        return Some(decode_entities(&strip_tags(inner)));
    }
    if let Some(inner) = fenced_block(text) {
        return Some(inner.to_string());
    }
    balanced_object(text).map(str::to_string)
}

fn pre_block(text: &str) -> Option<&str> {
    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();
    let open = lower.find("<pre")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</pre>")?;
    let inner = text[start..end].trim();
    (!inner.is_empty()).then_some(inner)
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    let body = &after[after.find('\n')? + 1..];
    let inner = body[..body.find("```")?].trim();
    (!inner.is_empty()).then_some(inner)
}

fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Dot-path traversal; numeric segments index arrays.
fn walk<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
