use proptest::prelude::*;
use sdk::errors::{EngineError, WardenErrorExt};
use sdk::types::{
    Finding, FindingKind, OsintCategory, Severity, StringCategory, ToolReport, ToolStatus,
};
use std::collections::BTreeMap;

fn severity() -> impl Strategy<Value = Severity> {
    prop_oneof![
        Just(Severity::Info),
        Just(Severity::Low),
        Just(Severity::Medium),
        Just(Severity::High),
        Just(Severity::Critical),
    ]
}

fn finding_kind() -> impl Strategy<Value = FindingKind> {
    prop_oneof![
        (
            "[a-z0-9.]{1,20}",
            any::<u16>(),
            "tcp|udp",
            proptest::option::of("[a-z-]{1,10}"),
            proptest::option::of("\\PC{0,20}"),
        )
            .prop_map(|(host, port, protocol, service, version)| {
                FindingKind::OpenPort {
                    host,
                    port,
                    protocol,
                    service,
                    version,
                }
            }),
        (
            "/[a-z/]{0,20}",
            proptest::option::of(100u16..600),
            proptest::option::of(any::<u64>()),
        )
            .prop_map(|(path, status_code, size)| FindingKind::InterestingPath {
                path,
                status_code,
                size,
            }),
        (proptest::option::of("[a-z_]{1,8}"), "\\PC{1,30}").prop_map(
            |(parameter, technique)| FindingKind::SqlInjection {
                parameter,
                technique,
            }
        ),
        (
            prop_oneof![
                Just(StringCategory::Url),
                Just(StringCategory::Email),
                Just(StringCategory::Ip),
                Just(StringCategory::FilePath),
                Just(StringCategory::Keyword),
            ],
            "\\PC{1,40}",
        )
            .prop_map(|(category, value)| FindingKind::ExtractedString { category, value }),
        (any::<u64>(), "\\PC{1,40}")
            .prop_map(|(offset, description)| FindingKind::Signature {
                offset,
                description,
            }),
        (
            prop_oneof![Just(OsintCategory::Email), Just(OsintCategory::Host)],
            "[a-z@.]{3,30}",
        )
            .prop_map(|(category, value)| FindingKind::OsintRecord { category, value }),
        (severity(), 0u32..50, prop::collection::vec("\\PC{1,20}", 0..5)).prop_map(
            |(sev, count, key_findings)| {
                let mut severity_counts = BTreeMap::new();
                severity_counts.insert(sev, count);
                FindingKind::Summary {
                    risk_level: sdk::types::RiskLevel::Medium,
                    total: count,
                    severity_counts,
                    key_findings,
                }
            }
        ),
    ]
}

fn finding() -> impl Strategy<Value = Finding> {
    ("[a-z]{2,12}", "\\PC{1,30}", severity(), finding_kind()).prop_map(
        |(tool, target, severity, kind)| Finding::new(tool, target, kind).with_severity(severity),
    )
}

// Findings survive the external JSON contract without information loss
proptest! {
    #[test]
    fn test_finding_json_round_trip(findings in prop::collection::vec(finding(), 0..8)) {
        let report = ToolReport::completed(findings.clone(), false);
        let json = report.to_json();
        let parsed = ToolReport::from_json(&json).expect("report should parse");

        prop_assert_eq!(parsed.status, ToolStatus::Completed);
        prop_assert_eq!(parsed.findings, findings);
    }
}

proptest! {
    #[test]
    fn test_error_user_hint_completeness(error_str in "\\PC*") {
        let errs = vec![
            EngineError::Config(error_str.clone()),
            EngineError::InvalidTarget(error_str.clone()),
            EngineError::ToolNotFound { tool: error_str.clone() },
            EngineError::Orchestration(error_str.clone()),
            EngineError::tool_execution("nmap", Some(1), &error_str),
            EngineError::parse_error("nikto", error_str.as_bytes()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            if error_str.len() > 3 {
                prop_assert!(!hint.contains(&error_str));
            }
        }
    }
}
