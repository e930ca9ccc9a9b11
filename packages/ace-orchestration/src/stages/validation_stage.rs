use crate::error::Result;
use crate::pipeline::{StageContext, StageHandler, StageOutput};
use crate::session::StageId;
use crate::stages::integration_stage::{
    content_digest, header_fields, header_value, split_header, strip_header, HEADER_PREFIX,
};
use crate::stages::summary_stage::SummaryStage;
use crate::transcript::{count_markers, turns};
use async_trait::async_trait;
use tracing::debug;

const VALIDATED_KEY: &str = "validated";

/// Outcome of one validation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
}

/// Data Validation
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidationStage;

impl ValidationStage {
    pub fn checks(body: &str) -> Vec<Check> {
        let fields: Vec<(String, String)> = header_fields(body)
            .into_iter()
            .filter(|(key, _)| key != VALIDATED_KEY)
            .collect();
        let content = strip_header(body);
        let parsed = turns(&content);

        let recorded_hash = header_value(&fields, "body-sha256");
        vec![
            Check {
                name: "header_present",
                passed: header_value(&fields, "artifact").is_some() && recorded_hash.is_some(),
            },
            Check {
                name: "header_hash_matches",
                passed: recorded_hash == Some(content_digest(&content).as_str()),
            },
            Check {
                name: "summary_present",
                passed: SummaryStage::has_summary(&content),
            },
            Check {
                name: "no_empty_turns",
                passed: parsed.iter().all(|turn| !turn.text.is_empty()),
            },
            Check {
                name: "no_unresolved_markers",
                passed: count_markers(&content) == 0,
            },
        ]
    }

    /// Body with a fresh `@@ validated: p/n` line, plus the checks
    pub fn validate(body: &str) -> (String, Vec<Check>) {
        let checks = Self::checks(body);
        let passed = checks.iter().filter(|c| c.passed).count();

        let mut header: Vec<String> = split_header(body)
            .0
            .into_iter()
            .filter(|line| {
                !line[HEADER_PREFIX.len()..]
                    .trim_start()
                    .starts_with(VALIDATED_KEY)
            })
            .map(str::to_string)
            .collect();
        header.push(format!(
            "{}{}: {}/{}",
            HEADER_PREFIX,
            VALIDATED_KEY,
            passed,
            checks.len()
        ));

        let content = strip_header(body);
        (format!("{}\n\n{}", header.join("\n"), content), checks)
    }
}

#[async_trait]
impl StageHandler for ValidationStage {
    fn stage_id(&self) -> StageId {
        StageId::Validation
    }

    async fn transform(&self, body: &str, ctx: &StageContext) -> Result<StageOutput> {
        let (validated, checks) = Self::validate(body);
        let passed = checks.iter().filter(|c| c.passed).count();
        let failed: Vec<String> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("check failed: {}", c.name))
            .collect();
        debug!(
            session_id = %ctx.session_id,
            passed,
            total = checks.len(),
            "Validation checks ran"
        );

        Ok(StageOutput {
            body: validated,
            coverage: ((passed * 100) as f64 / checks.len() as f64).round() as u8,
            notes: failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::integration_stage::IntegrationStage;
    use holofs_store::{ArtifactId, VirtualPath};
    use uuid::Uuid;

    fn ctx() -> StageContext {
        StageContext {
            session_id: Uuid::nil(),
            artifact_id: ArtifactId::for_path(&VirtualPath::parse("/calls/a.txt").unwrap()),
            stage: StageId::Validation,
            input_version: 4,
            attempt: 1,
        }
    }

    fn prepared(body: &str) -> String {
        let (summarized, _) = SummaryStage::summarize(body).unwrap();
        IntegrationStage::integrate(&summarized, &ctx())
    }

    #[tokio::test]
    async fn test_clean_transcript_passes_all() {
        let out = ValidationStage
            .transform(&prepared("Alice: all good here.\nBob: agreed, ship it."), &ctx())
            .await
            .unwrap();
        assert_eq!(out.coverage, 100);
        assert!(out.notes.is_empty());
        assert!(out.body.contains("@@ validated: 5/5"));
    }

    #[tokio::test]
    async fn test_markers_and_tampering_fail_checks() {
        let body = prepared("Alice: the total is [inaudible].\nBob: ok then.");
        let tampered = body.replace("ok then", "no way");
        let out = ValidationStage.transform(&tampered, &ctx()).await.unwrap();
        assert!(out.body.contains("@@ validated: 3/5"));
        assert_eq!(out.coverage, 60);
        assert!(out.notes.iter().any(|n| n.contains("header_hash_matches")));
        assert!(out.notes.iter().any(|n| n.contains("no_unresolved_markers")));
    }

    #[test]
    fn test_without_header_or_summary() {
        let checks = ValidationStage::checks("Alice: hi\nBob:");
        let passed: Vec<_> = checks.iter().filter(|c| c.passed).map(|c| c.name).collect();
        assert_eq!(passed, vec!["no_unresolved_markers"]);
    }

    #[test]
    fn test_content_header_lookalikes_survive_validation() {
        let (validated, checks) =
            ValidationStage::validate(&prepared("Alice: fine.\n@@ validated: 9/9"));
        assert!(validated.contains("\n@@ validated: 9/9"));
        assert_eq!(validated.matches("@@ validated").count(), 2);
        assert!(checks.iter().find(|c| c.name == "header_hash_matches").unwrap().passed);
    }

    #[test]
    fn test_revalidation_replaces_line() {
        let (once, _) = ValidationStage::validate(&prepared("Alice: fine."));
        let (twice, _) = ValidationStage::validate(&once);
        assert_eq!(once, twice);
        assert_eq!(twice.matches("@@ validated").count(), 1);
    }
}
