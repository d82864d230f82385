//! OSINT adapter: theHarvester over a domain

use super::{PrepareContext, PreparedCall, ToolAdapter, ToolSpec};
use crate::command_executor::CapturedOutput;
use crate::target::Target;
use sdk::errors::EngineError;
use sdk::types::{Capability, Finding, FindingKind, OsintCategory, ToolInput};
use std::collections::HashSet;
use std::net::Ipv4Addr;

const ALLOWED_SOURCES: &[&str] = &[
    "baidu",
    "bing",
    "bingapi",
    "certspotter",
    "crtsh",
    "dnsdumpster",
    "duckduckgo",
    "github",
    "google",
    "hunter",
    "intelx",
    "linkedin",
    "otx",
    "securityTrails",
    "threatcrowd",
    "trello",
    "twitter",
    "vhost",
    "virustotal",
    "yahoo",
];

const DEFAULT_SOURCES: &[&str] = &["google", "bing", "yahoo"];

/// Email, host, and address harvesting from public sources.
pub struct Harvester;

impl ToolAdapter for Harvester {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "theharvester",
            capability: Capability::Social,
            binary: Some("theHarvester"),
            timeout_units: 5,
            intrusiveness: 0.1,
            thoroughness: 0.6,
            ok_exit_codes: &[0],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        _ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let Target::Domain(domain) = target else {
            return Err(EngineError::InvalidTarget(format!(
                "expected a domain, got {} target",
                target.kind_str()
            )));
        };
        let limit = input.param_i64_in("limit", 1, 10_000, 500)?;
        let sources = input
            .param_list("sources")
            .unwrap_or_else(|| DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect());
        if sources.is_empty() {
            return Err(EngineError::InvalidTarget("no OSINT sources given".to_string()));
        }
        if let Some(bad) = sources.iter().find(|s| !ALLOWED_SOURCES.contains(&s.as_str())) {
            return Err(EngineError::InvalidTarget(format!(
                "invalid source '{}'",
                bad
            )));
        }

        let args = vec![
            "-d".to_string(),
            domain.clone(),
            "-l".into(),
            limit.to_string(),
            "-b".into(),
            sources.join(","),
        ];
        Ok(PreparedCall::new(target, args))
    }

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        let target = call.target.as_arg();
        Ok(parse_sections(&output.stdout)
            .into_iter()
            .map(|(category, value)| {
                Finding::new(
                    "theharvester",
                    &target,
                    FindingKind::OsintRecord { category, value },
                )
            })
            .collect())
    }
}

/// Walk the `[*] Emails found:` style sections of a report.
pub fn parse_sections(stdout: &str) -> Vec<(OsintCategory, String)> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut section = None;

    let mut record = |category: OsintCategory, value: &str| {
        if seen.insert((category, value.to_string())) {
            records.push((category, value.to_string()));
        }
    };

    for line in stdout.lines().map(str::trim) {
        if line.starts_with('[') {
            let lower = line.to_lowercase();
            section = if lower.contains("email") {
                Some(OsintCategory::Email)
            } else if lower.contains("host") {
                Some(OsintCategory::Host)
            } else if lower.contains("ips") || lower.contains("addresses") {
                Some(OsintCategory::Ip)
            } else if lower.contains("url") {
                Some(OsintCategory::Url)
            } else {
                None
            };
            continue;
        }
        if line.is_empty() || line.starts_with('-') || line.starts_with('=') {
            continue;
        }

        match section {
            Some(OsintCategory::Email) if line.contains('@') => record(OsintCategory::Email, line),
            Some(OsintCategory::Host) => {
                // `www.example.com:93.184.216.34`
                let (host, ip) = match line.split_once(':') {
                    Some((h, i)) => (h, Some(i)),
                    None => (line, None),
                };
                record(OsintCategory::Host, host);
                if let Some(ip) = ip.filter(|i| i.parse::<Ipv4Addr>().is_ok()) {
                    record(OsintCategory::Ip, ip);
                }
            }
            Some(OsintCategory::Ip) if line.parse::<Ipv4Addr>().is_ok() => {
                record(OsintCategory::Ip, line)
            }
            Some(OsintCategory::Url)
                if line.starts_with("http://") || line.starts_with("https://") =>
            {
                record(OsintCategory::Url, line)
            }
            _ => {}
        }
    }
    records
}
