//! Transcript document model
//!
//! A stored transcript is a body followed by an optional trailer of stamp
//! lines (`%% ace/<stage> score=<n> outcome=<o>`), one per stage commit.
//! Stage handlers only ever see the body.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::session::{StageId, StageOutcome};

pub const STAMP_PREFIX: &str = "%% ace/";

static MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[(\?|inaudible|unclear|crosstalk)(?::\s*([^\]]*))?\]").expect("valid regex")
});

static TURN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>[A-Za-z][\w.'-]*(?: [\w.'-]+){0,3})\s*:(?:\s+(?P<text>.*))?$")
        .expect("valid regex")
});

// ═══════════════════════════════════════════════════════════════════════════
// Document
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub body: String,
    pub trailer: Vec<String>,
}

impl Transcript {
    pub fn parse(text: &str) -> Self {
        let mut lines: Vec<&str> = text.lines().collect();
        while lines.last().is_some_and(|line| line.trim().is_empty()) {
            lines.pop();
        }

        let mut trailer = Vec::new();
        while let Some(line) = lines.last() {
            if line.starts_with(STAMP_PREFIX) {
                trailer.push(line.trim_end().to_string());
                lines.pop();
            } else {
                break;
            }
        }
        trailer.reverse();

        Self {
            body: lines.join("\n").trim_end().to_string(),
            trailer,
        }
    }

    pub fn render(&self) -> String {
        if self.trailer.is_empty() {
            format!("{}\n", self.body)
        } else {
            format!("{}\n\n{}\n", self.body, self.trailer.join("\n"))
        }
    }

    /// Record a stage commit in the trailer
    pub fn stamp(&mut self, stage: StageId, final_score: u8, outcome: StageOutcome) {
        self.trailer.push(format!(
            "{}{} score={} outcome={}",
            STAMP_PREFIX, stage, final_score, outcome
        ));
    }

    pub fn stamps(&self) -> &[String] {
        &self.trailer
    }

    /// Stages stamped so far, in commit order
    pub fn stamped_stages(&self) -> Vec<StageId> {
        self.trailer
            .iter()
            .filter_map(|line| line.strip_prefix(STAMP_PREFIX))
            .filter_map(|rest| rest.split_whitespace().next())
            .filter_map(|name| StageId::from_str(name).ok())
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Ambiguity markers
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Question,
    Inaudible,
    Unclear,
    Crosstalk,
}

impl MarkerKind {
    pub fn slug(&self) -> &'static str {
        match self {
            MarkerKind::Question => "question",
            MarkerKind::Inaudible => "inaudible",
            MarkerKind::Unclear => "unclear",
            MarkerKind::Crosstalk => "crosstalk",
        }
    }

    fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "inaudible" => MarkerKind::Inaudible,
            "unclear" => MarkerKind::Unclear,
            "crosstalk" => MarkerKind::Crosstalk,
            _ => MarkerKind::Question,
        }
    }
}

/// One unresolved span such as `[inaudible]` or `[unclear: Tuesday]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub kind: MarkerKind,
    /// Inline best guess, if the transcriber left one
    pub guess: Option<String>,
    pub start: usize,
    pub end: usize,
}

pub fn find_markers(text: &str) -> Vec<Marker> {
    MARKER_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let guess = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|g| !g.is_empty());
            Some(Marker {
                kind: MarkerKind::from_tag(caps.get(1)?.as_str()),
                guess,
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

pub fn count_markers(text: &str) -> usize {
    MARKER_RE.find_iter(text).count()
}

/// Replace every marker for which `resolve` yields text
pub fn replace_markers<F>(text: &str, mut resolve: F) -> (String, usize)
where
    F: FnMut(usize, &Marker) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut resolved = 0;
    for (idx, marker) in find_markers(text).iter().enumerate() {
        out.push_str(&text[last..marker.start]);
        match resolve(idx, marker) {
            Some(replacement) => {
                out.push_str(&replacement);
                resolved += 1;
            }
            None => out.push_str(&text[marker.start..marker.end]),
        }
        last = marker.end;
    }
    out.push_str(&text[last..]);
    (out, resolved)
}

/// Fill markers in order from clarifier answers; blank answers leave the
/// corresponding marker in place. Returns the new text and resolved count.
pub fn apply_answers(text: &str, answers: &[String]) -> (String, usize) {
    replace_markers(text, |idx, _| {
        answers
            .get(idx)
            .map(|answer| answer.trim())
            .filter(|answer| !answer.is_empty())
            .map(str::to_string)
    })
}

/// Percent of units resolved: words count as resolved, markers as unresolved
pub fn marker_coverage(text: &str) -> u8 {
    let markers = count_markers(text);
    let words = MARKER_RE.replace_all(text, " ").split_whitespace().count();
    let units = words + markers;
    if units == 0 {
        return 0;
    }
    ((words as f64 * 100.0) / units as f64).round() as u8
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

// ═══════════════════════════════════════════════════════════════════════════
// Speaker turns
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub speaker: String,
    pub text: String,
    pub line: usize,
}

/// Parse a `Name: text` line
pub fn parse_turn(line: &str) -> Option<(String, String)> {
    let caps = TURN_RE.captures(line.trim())?;
    let name = caps.name("name")?.as_str().trim().to_string();
    let text = caps
        .name("text")
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    Some((name, text))
}

pub fn turns(body: &str) -> Vec<Turn> {
    body.lines()
        .enumerate()
        .filter_map(|(line, raw)| {
            parse_turn(raw).map(|(speaker, text)| Turn { speaker, text, line })
        })
        .collect()
}

/// Distinct speakers in order of first appearance
pub fn speakers(turns: &[Turn]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for turn in turns {
        if !seen.iter().any(|s| s == &turn.speaker) {
            seen.push(turn.speaker.clone());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_trailer() {
        let doc = Transcript::parse(
            "Alice: hi\nBob: yo\n\n%% ace/formatting score=90 outcome=ok\n%% ace/summary score=80 outcome=degraded\n",
        );
        assert_eq!(doc.body, "Alice: hi\nBob: yo");
        assert_eq!(doc.stamps().len(), 2);
        assert_eq!(
            doc.stamped_stages(),
            vec![StageId::Formatting, StageId::Summary]
        );
        assert_eq!(Transcript::parse(&doc.render()), doc);
    }

    #[test]
    fn test_stamp_renders_trailer() {
        let mut doc = Transcript::parse("Alice: hi\n");
        assert!(doc.trailer.is_empty());
        doc.stamp(StageId::ContextualRepair, 75, StageOutcome::Ok);
        assert_eq!(
            doc.render(),
            "Alice: hi\n\n%% ace/contextual_repair score=75 outcome=ok\n"
        );
    }

    #[test]
    fn test_find_markers_with_guess() {
        let markers = find_markers("we met on [unclear: Tuesday] at [INAUDIBLE] and [?]");
        assert_eq!(markers.len(), 3);
        assert_eq!(markers[0].kind, MarkerKind::Unclear);
        assert_eq!(markers[0].guess.as_deref(), Some("Tuesday"));
        assert_eq!(markers[1].kind, MarkerKind::Inaudible);
        assert_eq!(markers[2].kind, MarkerKind::Question);
        assert!(markers[2].guess.is_none());
        assert_eq!(count_markers("[crosstalk] [unclear:]"), 2);
        assert_eq!(count_markers("[note] [x]"), 0);
    }

    #[test]
    fn test_apply_answers_in_order_skips_blank() {
        let (text, resolved) = apply_answers(
            "a [?] b [inaudible] c [unclear]",
            &["one".to_string(), "  ".to_string(), "three".to_string()],
        );
        assert_eq!(text, "a one b [inaudible] c three");
        assert_eq!(resolved, 2);

        let (same, none) = apply_answers("a [?]", &[]);
        assert_eq!(same, "a [?]");
        assert_eq!(none, 0);
    }

    #[test]
    fn test_marker_coverage() {
        assert_eq!(marker_coverage(""), 0);
        assert_eq!(marker_coverage("three plain words"), 100);
        assert_eq!(marker_coverage("one two three [?]"), 75);
    }

    #[test]
    fn test_turns_and_speakers() {
        let body = "Alice: hello\nnot a turn\nbob: hey there\nAlice:\n@@ words: 3";
        let parsed = turns(body);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].speaker, "bob");
        assert_eq!(parsed[1].text, "hey there");
        assert_eq!(parsed[2].text, "");
        assert_eq!(speakers(&parsed), vec!["Alice", "bob"]);
        assert!(parse_turn("see http://example.com").is_none());
    }
}
