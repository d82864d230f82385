//! Web adapters: content discovery, server misconfiguration scanning, and
//! technology fingerprinting

use super::{
    check_option_value, json_array_prefix, json_array_prefix_at, PrepareContext, PreparedCall,
    ToolAdapter, ToolSpec,
};
use crate::command_executor::CapturedOutput;
use crate::target::{validate_file, Target};
use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::{Capability, Finding, FindingKind, Severity, ToolInput};
use serde::Deserialize;
use std::sync::OnceLock;

const MAX_EXTENSIONS: usize = 10;

fn status_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Status: (\d+)").expect("Invalid status pattern"))
}

fn size_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Size: (\d+)").expect("Invalid size pattern"))
}

fn url_arg(target: &Target) -> Result<String, EngineError> {
    match target {
        Target::Url(url) => Ok(url.clone()),
        other => Err(EngineError::InvalidTarget(format!(
            "expected a URL, got {} target",
            other.kind_str()
        ))),
    }
}

/// Directory and file brute forcing.
pub struct Gobuster;

impl ToolAdapter for Gobuster {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "gobuster",
            capability: Capability::Web,
            binary: Some("gobuster"),
            timeout_units: 10,
            intrusiveness: 0.6,
            thoroughness: 0.7,
            ok_exit_codes: &[0],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let url = url_arg(target)?;
        validate_file(ctx.wordlist)?;
        let threads = input.param_i64_in("threads", 1, 50, 10)?;

        let mut args = vec![
            "dir".to_string(),
            "-u".into(),
            url,
            "-w".into(),
            ctx.wordlist.to_string_lossy().into_owned(),
        ];

        if let Some(extensions) = input.param_list("extensions") {
            if extensions.len() > MAX_EXTENSIONS
                || extensions
                    .iter()
                    .any(|e| e.len() > 8 || !e.chars().all(|c| c.is_ascii_alphanumeric()))
            {
                return Err(EngineError::InvalidTarget(
                    "extensions must be up to 10 short alphanumeric values".to_string(),
                ));
            }
            if !extensions.is_empty() {
                args.push("-x".into());
                args.push(extensions.join(","));
            }
        }

        args.extend([
            "-t".into(),
            threads.to_string(),
            "-q".into(),
            "--no-error".into(),
        ]);
        Ok(PreparedCall::new(target, args))
    }

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        let target = call.target.as_arg();
        let mut findings = Vec::new();
        for line in output.stdout.lines().map(str::trim) {
            // `/admin (Status: 301) [Size: 0] [--> /admin/]`
            if line.is_empty() || line.starts_with('=') || !line.starts_with('/') {
                continue;
            }
            let Some(path) = line.split_whitespace().next() else {
                continue;
            };
            let status_code = status_pattern()
                .captures(line)
                .and_then(|c| c[1].parse().ok());
            let size = size_pattern().captures(line).and_then(|c| c[1].parse().ok());
            let severity = match status_code {
                Some(200) if looks_sensitive(path) => Severity::Medium,
                _ => Severity::Info,
            };
            findings.push(
                Finding::new(
                    "gobuster",
                    &target,
                    FindingKind::InterestingPath {
                        path: path.to_string(),
                        status_code,
                        size,
                    },
                )
                .with_severity(severity),
            );
        }
        Ok(findings)
    }
}

fn looks_sensitive(path: &str) -> bool {
    const MARKERS: &[&str] = &[".git", ".env", "backup", ".bak", "config", "admin", ".sql"];
    let lower = path.to_ascii_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

/// Web server misconfiguration scanner.
pub struct Nikto;

#[derive(Debug, Deserialize)]
struct NiktoReport {
    #[serde(default)]
    vulnerabilities: Vec<NiktoItem>,
}

#[derive(Debug, Deserialize)]
struct NiktoItem {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    uri: Option<String>,
    #[serde(rename = "OSVDB", default)]
    osvdb: Option<serde_json::Value>,
}

/// Keyword severity for a nikto message.
pub fn nikto_severity(message: &str) -> Severity {
    let lower = message.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if has(&["sql", "injection", "xss", "command", "execute"]) {
        Severity::High
    } else if has(&["disclosure", "expose", "leak", "password"]) {
        Severity::Medium
    } else if has(&["header", "version", "banner"]) {
        Severity::Low
    } else {
        Severity::Info
    }
}

fn json_label(value: &Option<serde_json::Value>) -> Option<String> {
    match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() && s != "0" => Some(s.clone()),
        Some(serde_json::Value::Number(n)) if n.as_u64() != Some(0) => Some(n.to_string()),
        _ => None,
    }
}

impl ToolAdapter for Nikto {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "nikto",
            capability: Capability::Web,
            binary: Some("nikto"),
            timeout_units: 15,
            intrusiveness: 0.7,
            thoroughness: 0.8,
            // nikto exits 1 when it reports items
            ok_exit_codes: &[0, 1],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        _ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let mut args = vec![
            "-h".to_string(),
            url_arg(target)?,
            "-Format".into(),
            "json".into(),
            "-o".into(),
            "-".into(),
            "-ask".into(),
            "no".into(),
        ];
        if let Some(tuning) = input.param_str_opt("tuning") {
            check_option_value("tuning", &tuning)?;
            if !tuning.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(EngineError::InvalidTarget(
                    "tuning must be alphanumeric".to_string(),
                ));
            }
            args.push("-Tuning".into());
            args.push(tuning);
        }
        Ok(PreparedCall::new(target, args))
    }

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        let target = call.target.as_arg();
        let mut findings = Vec::new();
        let mut saw_json = false;

        for line in output.stdout.lines().map(str::trim) {
            if !line.starts_with('{') && !line.starts_with('[') {
                continue;
            }
            let reports: Vec<NiktoReport> = match serde_json::from_str::<NiktoReport>(line) {
                Ok(report) => vec![report],
                Err(_) => match serde_json::from_str(line) {
                    Ok(reports) => reports,
                    Err(_) if output.stdout_truncated => {
                        let vulnerabilities = json_array_prefix_at(line, "vulnerabilities");
                        if vulnerabilities.is_empty() {
                            continue;
                        }
                        vec![NiktoReport { vulnerabilities }]
                    }
                    Err(_) => continue,
                },
            };
            saw_json = true;
            for item in reports.into_iter().flat_map(|r| r.vulnerabilities) {
                let reference = json_label(&item.osvdb)
                    .map(|id| format!("OSVDB-{}", id))
                    .or_else(|| json_label(&item.id));
                findings.push(
                    Finding::new(
                        "nikto",
                        &target,
                        FindingKind::WebVulnerability {
                            reference,
                            uri: item.uri,
                            message: item.msg.clone(),
                        },
                    )
                    .with_severity(nikto_severity(&item.msg)),
                );
            }
        }

        if !saw_json {
            // Plain text report: `+ OSVDB-3092: /admin/: This might be interesting`
            for line in output.stdout.lines() {
                let lower = line.to_lowercase();
                if line.contains("+ ")
                    && (line.contains("OSVDB") || line.contains("CVE") || lower.contains("error"))
                {
                    let message = line.trim().trim_start_matches("+ ").to_string();
                    findings.push(
                        Finding::new(
                            "nikto",
                            &target,
                            FindingKind::WebVulnerability {
                                reference: None,
                                uri: None,
                                message: message.clone(),
                            },
                        )
                        .with_severity(nikto_severity(&message)),
                    );
                }
            }
        }

        Ok(findings)
    }
}

/// Technology fingerprinting.
pub struct WhatWeb;

#[derive(Debug, Deserialize)]
struct WhatWebRecord {
    #[serde(default)]
    plugins: serde_json::Map<String, serde_json::Value>,
}

impl ToolAdapter for WhatWeb {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "whatweb",
            capability: Capability::Web,
            binary: Some("whatweb"),
            timeout_units: 1,
            intrusiveness: 0.2,
            thoroughness: 0.4,
            ok_exit_codes: &[0],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        _ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let aggression = input.param_i64_in("aggression", 1, 4, 3)?;
        let args = vec![
            "--log-json=-".to_string(),
            "-a".into(),
            aggression.to_string(),
            url_arg(target)?,
        ];
        Ok(PreparedCall::new(target, args))
    }

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            return Ok(Vec::new());
        }

        let records: Vec<WhatWebRecord> = match serde_json::from_str(stdout) {
            Ok(records) => records,
            Err(_) if output.stdout_truncated && stdout.starts_with('[') => {
                json_array_prefix(stdout)
            }
            Err(_) => {
                let lines: Vec<&str> = stdout
                    .lines()
                    .map(|l| l.trim().trim_end_matches(','))
                    .filter(|l| l.starts_with('{'))
                    .collect();
                let mut records = Vec::with_capacity(lines.len());
                for (i, line) in lines.iter().enumerate() {
                    match serde_json::from_str(line) {
                        Ok(record) => records.push(record),
                        Err(_) if output.stdout_truncated && i + 1 == lines.len() => break,
                        Err(_) => {
                            return Err(EngineError::parse_error("whatweb", stdout.as_bytes()))
                        }
                    }
                }
                if records.is_empty() && !output.stdout_truncated {
                    return Err(EngineError::parse_error("whatweb", stdout.as_bytes()));
                }
                records
            }
        };

        let target = call.target.as_arg();
        let mut findings = Vec::new();
        for record in records {
            for (name, data) in record.plugins {
                if !data.is_object() {
                    continue;
                }
                let version = match data.get("version") {
                    Some(serde_json::Value::Array(v)) => {
                        v.first().and_then(|x| x.as_str()).map(String::from)
                    }
                    Some(serde_json::Value::String(s)) => Some(s.clone()),
                    _ => None,
                };
                findings.push(Finding::new(
                    "whatweb",
                    &target,
                    FindingKind::Technology { name, version },
                ));
            }
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    fn ctx() -> PrepareContext<'static> {
        PrepareContext {
            wordlist: Path::new("/usr/share/wordlists/dirb/common.txt"),
            work_dir: Path::new("/tmp/warden"),
            upstream: &[],
        }
    }

    fn url() -> Target {
        Target::parse("http://10.0.0.5/").unwrap()
    }

    #[test]
    fn test_gobuster_argv() {
        let input = ToolInput::new("x")
            .with_param("extensions", json!("php,html"))
            .with_param("threads", json!(20));
        let call = Gobuster.prepare(&url(), &input, &ctx()).unwrap();
        assert_eq!(
            call.args,
            vec![
                "dir",
                "-u",
                "http://10.0.0.5/",
                "-w",
                "/usr/share/wordlists/dirb/common.txt",
                "-x",
                "php,html",
                "-t",
                "20",
                "-q",
                "--no-error"
            ]
        );
    }

    #[test]
    fn test_gobuster_rejects_host_target_and_bad_extensions() {
        let host = Target::parse("10.0.0.5").unwrap();
        assert!(Gobuster.prepare(&host, &ToolInput::new("x"), &ctx()).is_err());

        let input = ToolInput::new("x").with_param("extensions", json!("php;id"));
        assert!(Gobuster.prepare(&url(), &input, &ctx()).is_err());
    }

    #[test]
    fn test_gobuster_parse() {
        let stdout = "/admin (Status: 301) [Size: 0] [--> /admin/]\n/index.html (Status: 200) [Size: 1520]\n===============\n";
        let call = PreparedCall::new(&url(), vec![]);
        let findings = Gobuster
            .parse(&CapturedOutput::from_stdout(stdout), &call)
            .unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(
            findings[1].kind,
            FindingKind::InterestingPath {
                path: "/index.html".into(),
                status_code: Some(200),
                size: Some(1520)
            }
        );
    }

    #[test]
    fn test_nikto_severity_keywords() {
        assert_eq!(nikto_severity("Possible SQL injection in id"), Severity::High);
        assert_eq!(nikto_severity("Server leaks inodes via ETags"), Severity::Medium);
        assert_eq!(nikto_severity("X-Frame-Options header is not present"), Severity::Low);
        assert_eq!(nikto_severity("Allowed HTTP Methods: GET"), Severity::Info);
    }

    #[test]
    fn test_nikto_json_and_text() {
        let stdout = r#"{"host":"10.0.0.5","vulnerabilities":[{"id":"999990","OSVDB":"3092","method":"GET","uri":"/admin/","msg":"Admin login page found, password field exposed"}]}"#;
        let call = PreparedCall::new(&url(), vec![]);
        let findings = Nikto
            .parse(&CapturedOutput::from_stdout(stdout), &call)
            .unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Medium);
        match &findings[0].kind {
            FindingKind::WebVulnerability { reference, uri, .. } => {
                assert_eq!(reference.as_deref(), Some("OSVDB-3092"));
                assert_eq!(uri.as_deref(), Some("/admin/"));
            }
            other => panic!("unexpected kind {other:?}"),
        }

        let text = "- Nikto v2.5.0\n+ OSVDB-877: HTTP TRACE method is active\n+ Server: nginx\n";
        let findings = Nikto.parse(&CapturedOutput::from_stdout(text), &call).unwrap();
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_whatweb_parse() {
        let stdout = r#"[{"target":"http://10.0.0.5/","http_status":200,"plugins":{"nginx":{"version":["1.18.0"]},"Country":{"string":["RESERVED"]},"HTTPServer":{"string":["nginx/1.18.0"]}}}]"#;
        let call = PreparedCall::new(&url(), vec![]);
        let findings = WhatWeb
            .parse(&CapturedOutput::from_stdout(stdout), &call)
            .unwrap();
        assert_eq!(findings.len(), 3);
        assert!(findings.iter().any(|f| f.kind
            == FindingKind::Technology {
                name: "nginx".into(),
                version: Some("1.18.0".into())
            }));

        let err = WhatWeb
            .parse(&CapturedOutput::from_stdout("ERROR Opening"), &call)
            .unwrap_err();
        assert!(matches!(err, EngineError::ParseError { .. }));
    }

    #[test]
    fn test_truncated_json_reports_keep_complete_records() {
        let call = PreparedCall::new(&url(), vec![]);
        let cut = |stdout: &str| CapturedOutput {
            stdout_truncated: true,
            ..CapturedOutput::from_stdout(stdout)
        };

        let nikto = r#"{"host":"10.0.0.5","vulnerabilities":[{"id":"1","uri":"/a","msg":"Server leaks inodes via ETags"},{"id":"2","uri":"/b","msg":"Directory indexing found"},{"id":"3","ur"#;
        let findings = Nikto.parse(&cut(nikto), &call).unwrap();
        assert_eq!(findings.len(), 2);

        let whatweb = r#"[{"target":"http://10.0.0.5/","plugins":{"nginx":{"version":["1.18.0"]}}},{"target":"http://10.0.0.5/x","plugins":{"PHP":{"ver"#;
        let findings = WhatWeb.parse(&cut(whatweb), &call).unwrap();
        assert_eq!(
            findings,
            vec![Finding::new(
                "whatweb",
                &url().as_arg(),
                FindingKind::Technology {
                    name: "nginx".into(),
                    version: Some("1.18.0".into())
                }
            )]
        );
    }
}
