use crate::error::Result;
use crate::pipeline::{StageContext, StageHandler, StageOutput};
use crate::session::StageId;
use crate::transcript::{marker_coverage, speakers, turns, word_count};
use async_trait::async_trait;
use holofs_store::ContentHash;
use tracing::debug;

pub const HEADER_PREFIX: &str = "@@ ";

/// Split `body` into its leading `@@ ` header lines and the rest
///
/// Only the block at the very top counts; `@@` lines further down are
/// transcript content.
pub fn split_header(body: &str) -> (Vec<&str>, &str) {
    let mut header = Vec::new();
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        let line_text = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
        if !line_text.starts_with(HEADER_PREFIX) {
            break;
        }
        header.push(line_text);
        offset += line.len();
    }
    (header, &body[offset..])
}

/// Body without its header block
pub fn strip_header(body: &str) -> String {
    split_header(body).1.trim().to_string()
}

/// `(key, value)` pairs of the `@@ key: value` header lines
pub fn header_fields(body: &str) -> Vec<(String, String)> {
    split_header(body)
        .0
        .into_iter()
        .filter_map(|line| line.strip_prefix(HEADER_PREFIX))
        .filter_map(|field| {
            let (key, value) = field.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn header_value<'a>(fields: &'a [(String, String)], key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Hash recorded in the header for `content`
pub fn content_digest(content: &str) -> String {
    ContentHash::compute(content.as_bytes()).to_string()
}

/// Pipeline Integration
///
/// Writes the integration header downstream consumers index on. The header
/// is rebuilt from scratch on every run.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegrationStage;

impl IntegrationStage {
    pub fn integrate(body: &str, ctx: &StageContext) -> String {
        let content = strip_header(body);
        let parsed = turns(&content);

        let header = [
            format!("{}artifact: {}", HEADER_PREFIX, ctx.artifact_id),
            format!("{}session: {}", HEADER_PREFIX, ctx.session_id),
            format!("{}body-sha256: {}", HEADER_PREFIX, content_digest(&content)),
            format!("{}words: {}", HEADER_PREFIX, word_count(&content)),
            format!("{}speakers: {}", HEADER_PREFIX, speakers(&parsed).join(", ")),
            format!("{}turns: {}", HEADER_PREFIX, parsed.len()),
        ];
        format!("{}\n\n{}", header.join("\n"), content)
    }
}

#[async_trait]
impl StageHandler for IntegrationStage {
    fn stage_id(&self) -> StageId {
        StageId::PipelineIntegration
    }

    async fn transform(&self, body: &str, ctx: &StageContext) -> Result<StageOutput> {
        let integrated = Self::integrate(body, ctx);
        debug!(session_id = %ctx.session_id, artifact = %ctx.artifact_id, "Integration header written");
        let coverage = marker_coverage(&strip_header(&integrated));
        Ok(StageOutput {
            body: integrated,
            coverage,
            notes: Vec::new(),
        })
    }
}
