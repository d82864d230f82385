//! In-process report digest over the findings of earlier steps

use super::{PrepareContext, PreparedCall, ToolAdapter, ToolSpec};
use crate::command_executor::CapturedOutput;
use crate::target::Target;
use sdk::errors::EngineError;
use sdk::types::{Capability, Finding, FindingKind, RiskLevel, Severity, ToolInput};
use std::collections::BTreeMap;

const KEY_FINDINGS: usize = 5;

/// Executive summary: overall risk, severity counts, and the top findings.
pub struct Digest;

/// Build the summary finding for a set of upstream findings.
pub fn summarize(target: &str, findings: &[Finding]) -> Finding {
    let relevant: Vec<&Finding> = findings
        .iter()
        .filter(|f| !matches!(f.kind, FindingKind::Summary { .. }))
        .collect();

    let mut severity_counts: BTreeMap<Severity, u32> = BTreeMap::new();
    for finding in &relevant {
        *severity_counts.entry(finding.severity).or_default() += 1;
    }
    let count = |s: Severity| severity_counts.get(&s).copied().unwrap_or(0);

    let risk_level = if count(Severity::Critical) > 0 || count(Severity::High) > 0 {
        RiskLevel::High
    } else if count(Severity::Medium) > 0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    let mut ranked = relevant.clone();
    // Stable sort keeps discovery order within a severity
    ranked.sort_by(|a, b| b.severity.cmp(&a.severity));
    let key_findings = ranked
        .iter()
        .take(KEY_FINDINGS)
        .map(|f| format!("{} ({})", f.title(), f.severity))
        .collect();

    Finding::new(
        "digest",
        target,
        FindingKind::Summary {
            risk_level,
            total: relevant.len() as u32,
            severity_counts,
            key_findings,
        },
    )
}

impl ToolAdapter for Digest {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "digest",
            capability: Capability::Report,
            binary: None,
            timeout_units: 1,
            intrusiveness: 0.0,
            thoroughness: 0.5,
            ok_exit_codes: &[0],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        _input: &ToolInput,
        _ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        Ok(PreparedCall::new(target, Vec::new()))
    }

    fn parse(
        &self,
        _output: &CapturedOutput,
        _call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        Ok(Vec::new())
    }

    fn run_builtin(&self, call: &PreparedCall, upstream: &[Finding]) -> Option<Vec<Finding>> {
        Some(vec![summarize(&call.target.as_arg(), upstream)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity, message: &str) -> Finding {
        Finding::new(
            "nikto",
            "http://10.0.0.5/",
            FindingKind::WebVulnerability {
                reference: None,
                message: message.to_string(),
                uri: None,
            },
        )
        .with_severity(severity)
    }

    #[test]
    fn test_risk_levels() {
        let high = summarize("t", &[finding(Severity::Low, "a"), finding(Severity::High, "b")]);
        let FindingKind::Summary {
            risk_level,
            total,
            key_findings,
            ..
        } = high.kind
        else {
            panic!("expected summary");
        };
        assert_eq!(risk_level, RiskLevel::High);
        assert_eq!(total, 2);
        assert_eq!(key_findings[0], "b (high)");

        let medium = summarize("t", &[finding(Severity::Medium, "m")]);
        assert!(matches!(
            medium.kind,
            FindingKind::Summary {
                risk_level: RiskLevel::Medium,
                ..
            }
        ));

        let empty = summarize("t", &[]);
        assert!(matches!(
            empty.kind,
            FindingKind::Summary {
                risk_level: RiskLevel::Low,
                total: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_key_findings_capped() {
        let many: Vec<Finding> = (0..9).map(|i| finding(Severity::Info, &i.to_string())).collect();
        let summary = summarize("t", &many);
        if let FindingKind::Summary { key_findings, .. } = summary.kind {
            assert_eq!(key_findings.len(), KEY_FINDINGS);
        }
    }
}
