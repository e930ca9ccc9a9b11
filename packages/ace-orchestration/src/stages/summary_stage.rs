use crate::error::{OrchestratorError, Result};
use crate::pipeline::{StageContext, StageHandler, StageOutput};
use crate::session::StageId;
use crate::transcript::{count_markers, marker_coverage, speakers, turns};
use async_trait::async_trait;
use tracing::debug;

pub const SUMMARY_START: &str = "== Summary ==";
pub const SUMMARY_END: &str = "== End Summary ==";

/// Highlight lines per summary
const MAX_HIGHLIGHTS: usize = 5;

/// Summary Generation
///
/// Appends (or rewrites) a summary section with per-speaker turn counts and
/// the first clean sentence of the opening turns.
#[derive(Debug, Default, Clone, Copy)]
pub struct SummaryStage;

impl SummaryStage {
    /// Body with any existing summary section removed
    pub fn strip_summary(body: &str) -> String {
        let mut kept = Vec::new();
        let mut inside = false;
        for line in body.lines() {
            match line.trim() {
                SUMMARY_START => inside = true,
                SUMMARY_END if inside => inside = false,
                _ if inside => {}
                _ => kept.push(line),
            }
        }
        kept.join("\n").trim_end().to_string()
    }

    pub fn has_summary(body: &str) -> bool {
        body.lines().any(|line| line.trim() == SUMMARY_START)
            && body.lines().any(|line| line.trim() == SUMMARY_END)
    }

    fn first_sentence(text: &str) -> Option<String> {
        text.split_inclusive(|c: char| matches!(c, '.' | '!' | '?'))
            .map(str::trim)
            .find(|sentence| {
                !sentence.is_empty()
                    && count_markers(sentence) == 0
                    && !sentence.contains('[')
                    && sentence.split_whitespace().count() >= 2
            })
            .map(str::to_string)
    }

    pub fn summarize(body: &str) -> Result<(String, usize)> {
        let content = Self::strip_summary(body);
        let parsed = turns(&content);
        if parsed.is_empty() {
            return Err(OrchestratorError::MalformedInput(
                "summary: no speaker turns".to_string(),
            ));
        }

        let mut section = vec![SUMMARY_START.to_string()];
        for speaker in speakers(&parsed) {
            let count = parsed.iter().filter(|t| t.speaker == speaker).count();
            section.push(format!(
                "- {} ({} {})",
                speaker,
                count,
                if count == 1 { "turn" } else { "turns" }
            ));
        }

        let highlights: Vec<String> = parsed
            .iter()
            .filter_map(|turn| {
                Self::first_sentence(&turn.text).map(|s| format!("> {}: {}", turn.speaker, s))
            })
            .take(MAX_HIGHLIGHTS)
            .collect();
        let highlighted = highlights.len();
        section.extend(highlights);
        section.push(SUMMARY_END.to_string());

        Ok((format!("{}\n\n{}", content, section.join("\n")), highlighted))
    }
}

#[async_trait]
impl StageHandler for SummaryStage {
    fn stage_id(&self) -> StageId {
        StageId::Summary
    }

    async fn transform(&self, body: &str, ctx: &StageContext) -> Result<StageOutput> {
        let (summarized, highlights) = Self::summarize(body)?;
        debug!(session_id = %ctx.session_id, highlights, "Summarized transcript");

        let coverage = marker_coverage(&Self::strip_summary(&summarized));
        Ok(StageOutput {
            body: summarized,
            coverage,
            notes: Vec::new(),
        })
    }
}
