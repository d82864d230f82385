//! Vulnerability adapters: SQL injection testing and exploit database lookup

use super::{json_array_prefix_at, PrepareContext, PreparedCall, ToolAdapter, ToolSpec};
use crate::command_executor::CapturedOutput;
use crate::target::Target;
use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::{Capability, Finding, FindingKind, Severity, ToolInput};
use serde::Deserialize;
use std::sync::OnceLock;

const MAX_SEARCH_TERMS: usize = 4;

fn search_term() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]{1,40}$").expect("Invalid search term pattern"))
}

fn parameter_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Parameter: ([\w\-\[\]]+)").expect("Invalid parameter pattern"))
}

fn vulnerable_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"parameter '([\w\-\[\]]+)' (?:is|appears to be) .*vulnerable")
            .expect("Invalid vulnerable pattern")
    })
}

/// Automated SQL injection testing against a URL with parameters.
pub struct Sqlmap;

fn technique_of(type_line: &str) -> String {
    let lower = type_line.to_lowercase();
    let known = [
        ("boolean-based blind", "boolean"),
        ("time-based blind", "time"),
        ("union query", "union"),
        ("error-based", "error"),
        ("stacked queries", "stacked"),
        ("inline query", "inline"),
    ];
    known
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, name)| name.to_string())
        .unwrap_or(lower)
}

impl ToolAdapter for Sqlmap {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "sqlmap",
            capability: Capability::Vulnerability,
            binary: Some("sqlmap"),
            timeout_units: 20,
            intrusiveness: 0.9,
            thoroughness: 0.9,
            ok_exit_codes: &[0],
        }
    }

    fn accepts(&self, target: &Target) -> bool {
        matches!(target, Target::Url(_))
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        _ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let level = input.param_i64_in("level", 1, 5, 1)?;
        let risk = input.param_i64_in("risk", 1, 3, 1)?;
        let args = vec![
            "-u".to_string(),
            target.as_arg(),
            "--batch".into(),
            "--technique".into(),
            "BEUSTQ".into(),
            "--level".into(),
            level.to_string(),
            "--risk".into(),
            risk.to_string(),
        ];
        Ok(PreparedCall::new(target, args))
    }

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        let mut points: Vec<(Option<String>, String)> = Vec::new();
        let mut vulnerable: Vec<String> = Vec::new();
        let mut current: Option<String> = None;

        for line in output.stdout.lines().map(str::trim) {
            if let Some(caps) = vulnerable_line().captures(line) {
                let name = caps[1].to_string();
                if !vulnerable.contains(&name) {
                    vulnerable.push(name);
                }
            } else if let Some(caps) = parameter_line().captures(line) {
                current = Some(caps[1].to_string());
            } else if let Some(kind) = line.strip_prefix("Type: ") {
                let point = (current.clone(), technique_of(kind));
                if !points.contains(&point) {
                    points.push(point);
                }
            }
        }

        // Parameters reported vulnerable without a technique block still count
        for name in vulnerable {
            if !points.iter().any(|(p, _)| p.as_deref() == Some(name.as_str())) {
                points.push((Some(name), "unknown".to_string()));
            }
        }

        let target = call.target.as_arg();
        Ok(points
            .into_iter()
            .map(|(parameter, technique)| {
                let severity = if technique == "union" {
                    Severity::Critical
                } else {
                    Severity::High
                };
                Finding::new(
                    "sqlmap",
                    &target,
                    FindingKind::SqlInjection {
                        parameter,
                        technique,
                    },
                )
                .with_severity(severity)
            })
            .collect())
    }
}

/// Offline exploit database search keyed on discovered service versions.
pub struct Searchsploit;

#[derive(Debug, Deserialize)]
struct SearchsploitOutput {
    #[serde(rename = "RESULTS_EXPLOIT", default)]
    exploits: Vec<SearchsploitEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchsploitEntry {
    #[serde(rename = "Title")]
    title: String,
    #[serde(rename = "EDB-ID", default)]
    edb_id: Option<String>,
    #[serde(rename = "Path", default)]
    path: Option<String>,
}

/// Search terms drawn from upstream service versions or technology fingerprints.
pub fn search_terms(input: &ToolInput, upstream: &[Finding]) -> Result<Vec<String>, EngineError> {
    let raw = match input.param_str_opt("query") {
        Some(query) => query,
        None => upstream
            .iter()
            .find_map(|f| match &f.kind {
                FindingKind::OpenPort {
                    version: Some(v), ..
                } => Some(v.clone()),
                FindingKind::Technology {
                    name,
                    version: Some(v),
                } => Some(format!("{} {}", name, v)),
                _ => None,
            })
            .ok_or_else(|| {
                EngineError::InvalidTarget("no service version to search for".to_string())
            })?,
    };

    let terms: Vec<String> = raw
        .split_whitespace()
        .filter(|t| search_term().is_match(t))
        .take(MAX_SEARCH_TERMS)
        .map(String::from)
        .collect();
    if terms.is_empty() {
        return Err(EngineError::InvalidTarget(
            "search query has no usable terms".to_string(),
        ));
    }
    Ok(terms)
}

impl ToolAdapter for Searchsploit {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "searchsploit",
            capability: Capability::Vulnerability,
            binary: Some("searchsploit"),
            timeout_units: 2,
            intrusiveness: 0.0,
            thoroughness: 0.5,
            ok_exit_codes: &[0],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let mut args = vec!["--json".to_string()];
        args.extend(search_terms(input, ctx.upstream)?);
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
        let parsed = serde_json::from_str::<SearchsploitOutput>(stdout);
        let exploits: Vec<SearchsploitEntry> = match parsed {
            Ok(parsed) => parsed.exploits,
            Err(_) if output.stdout_truncated && stdout.starts_with('{') => {
                json_array_prefix_at(stdout, "RESULTS_EXPLOIT")
            }
            Err(_) => return Err(EngineError::parse_error("searchsploit", stdout.as_bytes())),
        };

        let target = call.target.as_arg();
        Ok(exploits
            .into_iter()
            .map(|e| {
                Finding::new(
                    "searchsploit",
                    &target,
                    FindingKind::Exploit {
                        title: e.title,
                        edb_id: e.edb_id,
                        path: e.path,
                    },
                )
                .with_severity(Severity::Medium)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    fn ctx(upstream: &[Finding]) -> PrepareContext<'_> {
        PrepareContext {
            wordlist: Path::new("/usr/share/wordlists/dirb/common.txt"),
            work_dir: Path::new("/tmp/warden"),
            upstream,
        }
    }

    #[test]
    fn test_sqlmap_bounds_and_argv() {
        let target = Target::parse("http://10.0.0.5/item.php?id=1").unwrap();
        let input = ToolInput::new("x").with_param("level", json!(6));
        assert!(matches!(
            Sqlmap.prepare(&target, &input, &ctx(&[])),
            Err(EngineError::InvalidTarget(_))
        ));

        let input = ToolInput::new("x").with_param("risk", json!(2));
        let call = Sqlmap.prepare(&target, &input, &ctx(&[])).unwrap();
        assert_eq!(call.args[1], "http://10.0.0.5/item.php?id=1");
        assert!(call.args.windows(2).any(|w| w == ["--risk", "2"]));
        assert!(!Sqlmap.accepts(&Target::parse("10.0.0.5").unwrap()));
    }

    #[test]
    fn test_sqlmap_parse_injection_points() {
        let stdout = "[12:00:01] [INFO] GET parameter 'id' is vulnerable. Do you want to keep testing the others (if any)? [y/N] N\n\
sqlmap identified the following injection point(s):\n---\n\
Parameter: id (GET)\n    Type: boolean-based blind\n    Title: AND boolean-based blind\n\n\
    Type: UNION query\n    Title: Generic UNION query (NULL) - 3 columns\n---\n";
        let target = Target::parse("http://10.0.0.5/item.php?id=1").unwrap();
        let call = PreparedCall::new(&target, vec![]);
        let findings = Sqlmap
            .parse(&CapturedOutput::from_stdout(stdout), &call)
            .unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[1].severity, Severity::Critical);
        assert_eq!(
            findings[1].kind,
            FindingKind::SqlInjection {
                parameter: Some("id".into()),
                technique: "union".into()
            }
        );
    }

    #[test]
    fn test_searchsploit_terms_from_upstream() {
        let upstream = vec![Finding::new(
            "nmap",
            "10.0.0.5",
            FindingKind::OpenPort {
                host: "10.0.0.5".into(),
                port: 21,
                protocol: "tcp".into(),
                service: Some("ftp".into()),
                version: Some("vsftpd 2.3.4 $(id)".into()),
            },
        )];
        let target = Target::parse("10.0.0.5").unwrap();
        let call = Searchsploit
            .prepare(&target, &ToolInput::new("x"), &ctx(&upstream))
            .unwrap();
        assert_eq!(call.args, vec!["--json", "vsftpd", "2.3.4"]);

        assert!(Searchsploit
            .prepare(&target, &ToolInput::new("x"), &ctx(&[]))
            .is_err());
    }

    #[test]
    fn test_searchsploit_parse() {
        let stdout = r#"{"SEARCH":"vsftpd 2.3.4","RESULTS_EXPLOIT":[{"Title":"vsftpd 2.3.4 - Backdoor Command Execution","EDB-ID":"49757","Path":"/usr/share/exploitdb/exploits/unix/remote/49757.py"}],"RESULTS_SHELLCODE":[]}"#;
        let target = Target::parse("10.0.0.5").unwrap();
        let call = PreparedCall::new(&target, vec![]);
        let findings = Searchsploit
            .parse(&CapturedOutput::from_stdout(stdout), &call)
            .unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].title().contains("Backdoor"));

        let err = Searchsploit
            .parse(&CapturedOutput::from_stdout("not json"), &call)
            .unwrap_err();
        assert!(matches!(err, EngineError::ParseError { .. }));
    }

    #[test]
    fn test_searchsploit_truncated_keeps_complete_entries() {
        let stdout = r#"{"SEARCH":"apache 2.4","DB_PATH_EXPLOIT":"/usr/share/exploitdb","RESULTS_EXPLOIT":[{"Title":"Apache 2.4.49 - Path Traversal","EDB-ID":"50383","Path":"/a.sh"},{"Title":"Apache 2.4.50 - RCE","EDB-ID":"50406","Path":"/b.sh"},{"Title":"Apache 2.4.x - mod_"#;
        let output = CapturedOutput {
            stdout_truncated: true,
            ..CapturedOutput::from_stdout(stdout)
        };
        let target = Target::parse("10.0.0.5").unwrap();
        let call = PreparedCall::new(&target, vec![]);
        let findings = Searchsploit.parse(&output, &call).unwrap();
        assert_eq!(findings.len(), 2);
        assert!(findings[1].title().contains("RCE"));
    }
}
