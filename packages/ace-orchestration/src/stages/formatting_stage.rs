use crate::error::Result;
use crate::pipeline::{StageContext, StageHandler, StageOutput};
use crate::session::StageId;
use crate::transcript::parse_turn;
use async_trait::async_trait;
use tracing::debug;

/// Natural Formatting
///
/// Normalizes line endings and whitespace and rewrites speaker labels as
/// `Name: text`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormattingStage;

impl FormattingStage {
    pub fn format(body: &str) -> String {
        let unified = body.replace("\r\n", "\n").replace('\r', "\n");

        let mut lines: Vec<String> = Vec::new();
        let mut blank_run = false;
        for raw in unified.lines() {
            let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            if collapsed.is_empty() {
                if !lines.is_empty() && !blank_run {
                    lines.push(String::new());
                }
                blank_run = true;
                continue;
            }
            blank_run = false;
            lines.push(Self::format_line(&collapsed));
        }
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }

    fn format_line(line: &str) -> String {
        match parse_turn(line) {
            Some((name, text)) => {
                let mut chars = name.chars();
                let name = match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => name,
                };
                if text.is_empty() {
                    format!("{}:", name)
                } else {
                    format!("{}: {}", name, text)
                }
            }
            None => line.to_string(),
        }
    }
}

#[async_trait]
impl StageHandler for FormattingStage {
    fn stage_id(&self) -> StageId {
        StageId::Formatting
    }

    async fn transform(&self, body: &str, ctx: &StageContext) -> Result<StageOutput> {
        let formatted = Self::format(body);
        debug!(
            session_id = %ctx.session_id,
            bytes_in = body.len(),
            bytes_out = formatted.len(),
            "Formatted transcript"
        );
        Ok(StageOutput::from_body(formatted))
    }
}
