//! Judge verdicts and prompt construction
//!
//! The judge is asked one structured question per call and must answer in
//! JSON. Models wrap JSON in markdown fences or prose often enough that the
//! parser extracts the first balanced `{…}` block before handing the text
//! to serde. Every judge-flavoured call shares the same verdict shape, so
//! interchangeable chat endpoints can never diverge in format.

use serde::{Deserialize, Serialize};

// ============================================================================
// KINDS
// ============================================================================

/// What the judge is being asked to decide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeKind {
    /// Does the evidence satisfy a falsification condition?
    Invalidates,
    /// Does the evidence satisfy a confirmation condition?
    Confirms,
    /// Is the new claim a duplicate of the existing one?
    Duplicate,
}

impl JudgeKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeKind::Invalidates => "invalidates",
            JudgeKind::Confirms => "confirms",
            JudgeKind::Duplicate => "duplicate",
        }
    }
}

// ============================================================================
// VERDICT
// ============================================================================

/// Judge response, parsed from JSON
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct JudgeVerdict {
    /// Whether the condition/claim matches
    pub matches: bool,
    /// Judge confidence in [0, 1]
    pub confidence: f32,
    /// Free-form reasoning, kept for event context
    pub reasoning: String,
}

impl Default for JudgeVerdict {
    fn default() -> Self {
        Self::non_match()
    }
}

impl JudgeVerdict {
    /// The safe default used when the judge cannot be parsed
    pub fn non_match() -> Self {
        Self {
            matches: false,
            confidence: 0.0,
            reasoning: String::new(),
        }
    }
}

// ============================================================================
// PROMPTS
// ============================================================================

/// System prompt shared by all judge calls
pub const JUDGE_SYSTEM_PROMPT: &str = "You are a precise semantic judge for a belief-tracking system. \
     Answer ONLY with a JSON object of the form \
     {\"matches\": <bool>, \"confidence\": <0.0-1.0>, \"reasoning\": \"<short>\"}. \
     No other text.";

/// Build the user prompt for one judge call
pub fn build_judge_prompt(kind: JudgeKind, subject: &str, condition: &str, claim: &str) -> String {
    match kind {
        JudgeKind::Invalidates => format!(
            "A belief carries this falsification condition:\n  condition: {condition}\n\n\
             New evidence arrived:\n  evidence: {subject}\n\n\
             The belief under test reads:\n  belief: {claim}\n\n\
             Does the evidence satisfy the falsification condition? \
             Judge the condition literally; do not speculate beyond the evidence."
        ),
        JudgeKind::Confirms => format!(
            "A belief carries this confirmation condition:\n  condition: {condition}\n\n\
             New evidence arrived:\n  evidence: {subject}\n\n\
             The belief under test reads:\n  belief: {claim}\n\n\
             Does the evidence satisfy the confirmation condition? \
             Judge the condition literally; do not speculate beyond the evidence."
        ),
        JudgeKind::Duplicate => {
            let _ = condition;
            format!(
                "An existing memory reads:\n  existing: {claim}\n\n\
                 A new submission reads:\n  new: {subject}\n\n\
                 Are these the same claim (same fact, same subject, same direction), \
                 as opposed to related-but-distinct claims? Ignore phrasing differences."
            )
        }
    }
}

/// System prompt for the advisory completeness oracle
pub const COMPLETENESS_SYSTEM_PROMPT: &str = "You review new memory submissions for a belief-tracking system. \
     Answer ONLY with a JSON object {\"warnings\": [\"<short warning>\", ...]}. \
     An empty array means the submission is complete. No other text.";

/// Build the user prompt for the completeness oracle
pub fn build_completeness_prompt(
    content: &str,
    kind: &str,
    has_invalidates: bool,
    has_confirms: bool,
) -> String {
    format!(
        "A new {kind} was submitted:\n  content: {content}\n\n\
         It {inv} falsification conditions and {conf} confirmation conditions.\n\
         List concrete missing-field warnings (for example a prediction without \
         a measurable outcome condition, or a belief with no falsification \
         condition). Return an empty array when nothing important is missing.",
        inv = if has_invalidates { "has" } else { "has no" },
        conf = if has_confirms { "has" } else { "has no" },
    )
}

// ============================================================================
// PARSING
// ============================================================================

/// Extract the first balanced JSON object from model output
///
/// Tolerates markdown code fences and surrounding prose: the scan simply
/// starts at the first `{` and tracks brace depth with string/escape
/// awareness.
pub fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let tail = &content[start..];

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    for (idx, c) in tail.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&tail[..idx + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a judge verdict out of raw model output
///
/// Returns `None` on any parse failure; callers fall back to
/// [`JudgeVerdict::non_match`] as the safe default.
pub fn parse_verdict(content: &str) -> Option<JudgeVerdict> {
    let json = extract_json_object(content)?;
    let mut verdict: JudgeVerdict = serde_json::from_str(json).ok()?;
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    Some(verdict)
}

/// Parse completeness warnings out of raw model output
pub fn parse_warnings(content: &str) -> Option<Vec<String>> {
    #[derive(Deserialize)]
    struct Warnings {
        warnings: Vec<String>,
    }
    let json = extract_json_object(content)?;
    serde_json::from_str::<Warnings>(json).ok().map(|w| w.warnings)
}
