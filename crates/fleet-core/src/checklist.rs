//! Parsing of `- [ ] item` / `- [x] item` checklist fields.
//!
//! Every gate (start, complete, review, approval) goes through this module so
//! that all call sites agree on what counts as a checked item.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*[-*]\s+\[(x| )\]\s+(.*)$").expect("checklist item regex should compile")
});

static BOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[xX ]\]").expect("checkbox regex should compile"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub checked: bool,
    pub label: String,
}

/// Result of evaluating a checklist field against the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecklistState {
    /// At least one item and every item is checked.
    Complete,
    /// Labels of the unchecked items, in order.
    Unchecked(Vec<String>),
    /// Text present but no line uses checklist syntax.
    Malformed,
    /// Field is blank.
    Empty,
}

/// Parse every checklist line; non-matching lines are ignored.
pub fn parse(text: &str) -> Vec<ChecklistItem> {
    text.lines()
        .filter_map(|line| {
            let caps = ITEM_RE.captures(line)?;
            let mark = caps.get(1)?.as_str();
            let label = caps.get(2)?.as_str().trim().to_string();
            Some(ChecklistItem {
                checked: mark.eq_ignore_ascii_case("x"),
                label,
            })
        })
        .collect()
}

pub fn evaluate(text: &str) -> ChecklistState {
    if text.trim().is_empty() {
        return ChecklistState::Empty;
    }
    let items = parse(text);
    if items.is_empty() {
        return ChecklistState::Malformed;
    }
    let unchecked: Vec<String> = items
        .into_iter()
        .filter(|item| !item.checked)
        .map(|item| item.label)
        .collect();
    if unchecked.is_empty() {
        ChecklistState::Complete
    } else {
        ChecklistState::Unchecked(unchecked)
    }
}

/// Set the box of the `index`-th (1-based) checklist item.
///
/// Returns `None` when the index does not address an item.
pub fn set_item(text: &str, index: usize, checked: bool) -> Option<String> {
    if index == 0 {
        return None;
    }
    let mark = if checked { "[x]" } else { "[ ]" };
    let mut seen = 0;
    let mut found = false;
    let lines: Vec<String> = text
        .lines()
        .map(|line| {
            if ITEM_RE.is_match(line) {
                seen += 1;
                if seen == index {
                    found = true;
                    return BOX_RE.replace(line, mark).into_owned();
                }
            }
            line.to_string()
        })
        .collect();
    if !found {
        return None;
    }
    let mut out = lines.join("\n");
    if text.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Human-only predicate
// ---------------------------------------------------------------------------

/// Decides whether a checklist label can only be satisfied by a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanOnlyMatcher {
    markers: Vec<String>,
    prefixes: Vec<String>,
}

impl HumanOnlyMatcher {
    pub fn new(markers: Vec<String>, prefixes: Vec<String>) -> Self {
        Self {
            markers: markers.into_iter().map(|m| m.to_lowercase()).collect(),
            prefixes: prefixes.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    pub fn is_human_only(&self, label: &str) -> bool {
        let lower = label.trim().to_lowercase();
        self.markers.iter().any(|m| lower.contains(m.as_str()))
            || self.prefixes.iter().any(|p| lower.starts_with(p.as_str()))
    }

    pub fn any_human_only<'a>(&self, labels: impl IntoIterator<Item = &'a String>) -> bool {
        labels.into_iter().any(|label| self.is_human_only(label))
    }
}

impl Default for HumanOnlyMatcher {
    fn default() -> Self {
        Self::new(
            vec!["@human".into(), "human-only".into(), "🔒".into()],
            vec!["human:".into()],
        )
    }
}
