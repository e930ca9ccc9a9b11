use crate::error::Result;
use crate::pipeline::{StageContext, StageHandler, StageOutput};
use crate::session::StageId;
use crate::transcript::replace_markers;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static SPACE_BEFORE_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+([,.;!?])").expect("valid regex"));

/// Contextual Repair
///
/// Accepts inline transcriber guesses, collapses stutters and tidies
/// punctuation spacing.
#[derive(Debug, Default, Clone, Copy)]
pub struct RepairStage;

/// Stage-level repair statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairStats {
    pub guesses_accepted: usize,
    pub stutters_removed: usize,
}

impl RepairStage {
    pub fn repair(body: &str) -> (String, RepairStats) {
        let mut stats = RepairStats::default();

        let (guessed, accepted) = replace_markers(body, |_, marker| marker.guess.clone());
        stats.guesses_accepted = accepted;

        let lines: Vec<String> = guessed
            .lines()
            .map(|line| {
                let (line, removed) = Self::collapse_stutters(line);
                stats.stutters_removed += removed;
                SPACE_BEFORE_PUNCT.replace_all(&line, "$1").into_owned()
            })
            .collect();

        (lines.join("\n"), stats)
    }

    /// `the the cat` -> `the cat`, for purely alphabetic words
    fn collapse_stutters(line: &str) -> (String, usize) {
        let mut kept: Vec<&str> = Vec::new();
        let mut removed = 0;
        for token in line.split(' ') {
            let is_word = !token.is_empty() && token.chars().all(char::is_alphabetic);
            let repeats = kept
                .last()
                .is_some_and(|prev| is_word && prev.eq_ignore_ascii_case(token));
            if repeats {
                removed += 1;
            } else {
                kept.push(token);
            }
        }
        (kept.join(" "), removed)
    }
}

#[async_trait]
impl StageHandler for RepairStage {
    fn stage_id(&self) -> StageId {
        StageId::ContextualRepair
    }

    async fn transform(&self, body: &str, ctx: &StageContext) -> Result<StageOutput> {
        let (repaired, stats) = Self::repair(body);
        debug!(
            session_id = %ctx.session_id,
            guesses = stats.guesses_accepted,
            stutters = stats.stutters_removed,
            "Repaired transcript"
        );

        let mut output = StageOutput::from_body(repaired);
        if stats.guesses_accepted > 0 {
            output
                .notes
                .push(format!("accepted {} inline guesses", stats.guesses_accepted));
        }
        Ok(output)
    }
}
