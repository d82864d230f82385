//! Network adapters: nmap port scans, masscan, and ping-sweep discovery

use super::{check_option_value, PrepareContext, PreparedCall, ToolAdapter, ToolSpec};
use crate::command_executor::CapturedOutput;
use crate::target::Target;
use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::{Capability, Finding, FindingKind, Severity, ToolInput};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::OnceLock;

/// Cleartext or remote-admin services reported above informational
const EXPOSED_PORTS: &[u16] = &[21, 23, 445, 3389];

fn port_list() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9]{1,5}(-[0-9]{1,5})?(,[0-9]{1,5}(-[0-9]{1,5})?)*$")
            .expect("Invalid port list pattern")
    })
}

pub(crate) fn port_severity(port: u16) -> Severity {
    if EXPOSED_PORTS.contains(&port) {
        Severity::Low
    } else {
        Severity::Info
    }
}

fn ports_arg(input: &ToolInput, default: &str) -> Result<String, EngineError> {
    let ports = input
        .param_str_opt("ports")
        .unwrap_or_else(|| default.to_string());
    if !port_list().is_match(&ports) {
        return Err(EngineError::InvalidTarget(format!(
            "invalid port specification '{}'",
            ports
        )));
    }
    Ok(ports)
}

/// Port scan with service detection.
pub struct Nmap;

impl ToolAdapter for Nmap {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "nmap",
            capability: Capability::Network,
            binary: Some("nmap"),
            timeout_units: 10,
            intrusiveness: 0.5,
            thoroughness: 0.8,
            ok_exit_codes: &[0],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        _ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        // Unprivileged runs cannot send raw SYN packets, so connect scan is the default
        let scan_type = input
            .param_str_opt("scan_type")
            .unwrap_or_else(|| "connect".to_string());
        let mut args: Vec<String> = match scan_type.as_str() {
            "stealth" => vec!["-sS".into(), "-sV".into()],
            "connect" => vec!["-sT".into(), "-sV".into()],
            "udp" => vec!["-sU".into()],
            "version" => vec!["-sV".into(), "-sC".into()],
            "aggressive" => vec!["-A".into()],
            other => {
                return Err(EngineError::InvalidTarget(format!(
                    "unknown scan type '{}'",
                    other
                )))
            }
        };

        match input.param_str_opt("ports").as_deref() {
            None | Some("top") | Some("top-1000") => args.push("--top-ports=1000".into()),
            Some("all") => {
                args.push("-p".into());
                args.push("1-65535".into());
            }
            Some(_) => {
                args.push("-p".into());
                args.push(ports_arg(input, "")?);
            }
        }

        args.extend(["-T4".into(), "-oG".into(), "-".into(), target.as_arg()]);
        Ok(PreparedCall::new(target, args))
    }

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        parse_grepable(&output.stdout, &call.target.as_arg())
    }
}

/// Parse `-oG` output into open-port findings.
///
/// Host lines look like
/// `Host: 10.0.0.5 (web.local)\tPorts: 22/open/tcp//ssh//OpenSSH 8.9/, 80/open/tcp//http///`.
pub fn parse_grepable(stdout: &str, target: &str) -> Result<Vec<Finding>, EngineError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    if !stdout.contains("# Nmap") && !stdout.contains("Host:") {
        return Err(EngineError::parse_error("nmap", stdout.as_bytes()));
    }

    let mut findings = Vec::new();
    for line in stdout.lines().filter(|l| l.starts_with("Host:")) {
        let mut host = None;
        for field in line.split('\t') {
            if let Some(rest) = field.strip_prefix("Host: ") {
                host = rest.split_whitespace().next().map(String::from);
            } else if let Some(ports) = field.strip_prefix("Ports: ") {
                let Some(host) = host.as_deref() else {
                    continue;
                };
                for entry in ports.split(", ") {
                    if let Some((port, kind)) = parse_port_entry(host, entry) {
                        findings.push(
                            Finding::new("nmap", target, kind).with_severity(port_severity(port)),
                        );
                    }
                }
            }
        }
    }
    Ok(findings)
}

fn parse_port_entry(host: &str, entry: &str) -> Option<(u16, FindingKind)> {
    let fields: Vec<&str> = entry.trim().split('/').collect();
    if fields.len() < 5 || fields[1] != "open" {
        return None;
    }
    let port = fields[0].parse().ok()?;
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    let kind = FindingKind::OpenPort {
        host: host.to_string(),
        port,
        protocol: fields[2].to_string(),
        service: non_empty(fields[4]),
        version: fields.get(6).and_then(|v| non_empty(v)),
    };
    Some((port, kind))
}

/// Fast asynchronous port scanner, IP and CIDR targets only.
pub struct Masscan;

#[derive(Debug, Deserialize)]
struct MasscanRecord {
    ip: String,
    #[serde(default)]
    ports: Vec<MasscanPort>,
}

#[derive(Debug, Deserialize)]
struct MasscanPort {
    port: u16,
    #[serde(default = "default_proto")]
    proto: String,
    #[serde(default)]
    status: Option<String>,
}

fn default_proto() -> String {
    "tcp".to_string()
}

impl ToolAdapter for Masscan {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "masscan",
            capability: Capability::Network,
            binary: Some("masscan"),
            timeout_units: 5,
            intrusiveness: 0.8,
            thoroughness: 0.6,
            ok_exit_codes: &[0],
        }
    }

    fn accepts(&self, target: &Target) -> bool {
        match target {
            Target::Host(h) => h.split('/').next().is_some_and(|ip| ip.parse::<IpAddr>().is_ok()),
            _ => false,
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        _ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let ports = ports_arg(input, "1-1000")?;
        let rate = input.param_i64_in("rate", 1, 100_000, 1000)?;
        let args = vec![
            target.as_arg(),
            "-p".into(),
            ports,
            "--rate".into(),
            rate.to_string(),
            "--open-only".into(),
            "--output-format".into(),
            "json".into(),
            "--output-filename".into(),
            "-".into(),
        ];
        Ok(PreparedCall::new(target, args))
    }

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        let target = call.target.as_arg();
        let mut findings = Vec::new();
        // One record per line inside a JSON array, each line ending in a comma
        let lines: Vec<&str> = output
            .stdout
            .lines()
            .map(|l| l.trim().trim_end_matches(','))
            .filter(|l| !l.is_empty() && *l != "[" && *l != "]")
            .collect();
        for (i, line) in lines.iter().enumerate() {
            let record: MasscanRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                // A cut-off capture ends mid-record
                Err(_) if output.stdout_truncated && i + 1 == lines.len() => break,
                Err(_) => {
                    return Err(EngineError::parse_error("masscan", output.stdout.as_bytes()))
                }
            };
            for port in record
                .ports
                .into_iter()
                .filter(|p| p.status.as_deref().unwrap_or("open") == "open")
            {
                findings.push(
                    Finding::new(
                        "masscan",
                        &target,
                        FindingKind::OpenPort {
                            host: record.ip.clone(),
                            port: port.port,
                            protocol: port.proto,
                            service: None,
                            version: None,
                        },
                    )
                    .with_severity(port_severity(port.port)),
                );
            }
        }
        Ok(findings)
    }
}

/// Ping sweep of a network range.
pub struct Discovery;

impl ToolAdapter for Discovery {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "discovery",
            capability: Capability::Network,
            binary: Some("nmap"),
            timeout_units: 1,
            intrusiveness: 0.2,
            thoroughness: 0.3,
            ok_exit_codes: &[0],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        _ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let mut args = vec!["-sn".to_string()];
        if let Some(exclude) = input.param_str_opt("exclude") {
            check_option_value("exclude", &exclude)?;
            crate::target::validate_host(&exclude)?;
            args.push("--exclude".into());
            args.push(exclude);
        }
        args.push(target.as_arg());
        Ok(PreparedCall::new(target, args))
    }

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        let target = call.target.as_arg();
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix("Nmap scan report for "))
            .map(|rest| {
                // Either `hostname (ip)` or a bare ip
                let kind = match rest.split_once(" (") {
                    Some((name, ip)) => FindingKind::LiveHost {
                        ip: ip.trim_end_matches(')').to_string(),
                        hostname: Some(name.to_string()),
                    },
                    None => FindingKind::LiveHost {
                        ip: rest.to_string(),
                        hostname: None,
                    },
                };
                Finding::new("discovery", &target, kind)
            })
            .collect())
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

    #[test]
    fn test_nmap_argv_defaults_to_connect_scan() {
        let target = Target::parse("192.168.1.1").unwrap();
        let call = Nmap.prepare(&target, &ToolInput::new("192.168.1.1"), &ctx()).unwrap();
        assert_eq!(
            call.args,
            vec!["-sT", "-sV", "--top-ports=1000", "-T4", "-oG", "-", "192.168.1.1"]
        );
    }

    #[test]
    fn test_nmap_rejects_bad_ports() {
        let target = Target::parse("192.168.1.1").unwrap();
        let input = ToolInput::new("x").with_param("ports", json!("80;reboot"));
        assert!(matches!(
            Nmap.prepare(&target, &input, &ctx()),
            Err(EngineError::InvalidTarget(_))
        ));
        let input = ToolInput::new("x").with_param("ports", json!("22,80,8000-8100"));
        let call = Nmap.prepare(&target, &input, &ctx()).unwrap();
        assert!(call.args.windows(2).any(|w| w == ["-p", "22,80,8000-8100"]));
    }

    #[test]
    fn test_parse_grepable_open_ports() {
        let stdout = "# Nmap 7.94 scan initiated\n\
Host: 10.0.0.5 (web.local)\tStatus: Up\n\
Host: 10.0.0.5 (web.local)\tPorts: 22/open/tcp//ssh//OpenSSH 8.9p1/, 23/open/tcp//telnet///, 81/closed/tcp//hosts2-ns///\tIgnored State: closed (997)\n\
# Nmap done at Mon -- 1 IP address (1 host up)\n";
        let findings = parse_grepable(stdout, "10.0.0.5").unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].open_port(), Some((22, Some("ssh"))));
        match &findings[0].kind {
            FindingKind::OpenPort { version, host, .. } => {
                assert_eq!(version.as_deref(), Some("OpenSSH 8.9p1"));
                assert_eq!(host, "10.0.0.5");
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(findings[1].severity, Severity::Low);
    }

    #[test]
    fn test_parse_grepable_rejects_garbage() {
        let err = parse_grepable("<html>not nmap</html>", "x").unwrap_err();
        assert!(matches!(err, EngineError::ParseError { .. }));
    }

    #[test]
    fn test_masscan_only_accepts_addresses() {
        assert!(Masscan.accepts(&Target::parse("10.0.0.0/24").unwrap()));
        assert!(!Masscan.accepts(&Target::parse("example.com").unwrap()));
    }

    #[test]
    fn test_masscan_json_lines() {
        let stdout = "[\n{ \"ip\": \"10.0.0.7\", \"timestamp\": \"1700000000\", \"ports\": [ {\"port\": 445, \"proto\": \"tcp\", \"status\": \"open\", \"reason\": \"syn-ack\", \"ttl\": 64} ] },\n]\n";
        let output = CapturedOutput::from_stdout(stdout);
        let target = Target::parse("10.0.0.0/24").unwrap();
        let call = PreparedCall::new(&target, vec![]);
        let findings = Masscan.parse(&output, &call).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].open_port(), Some((445, None)));
        assert_eq!(findings[0].severity, Severity::Low);
    }

    #[test]
    fn test_masscan_truncated_drops_partial_record() {
        let stdout = "[\n{ \"ip\": \"10.0.0.7\", \"ports\": [ {\"port\": 22, \"proto\": \"tcp\", \"status\": \"open\"} ] },\n{ \"ip\": \"10.0.0.8\", \"ports\": [ {\"port\": 44";
        let target = Target::parse("10.0.0.0/24").unwrap();
        let call = PreparedCall::new(&target, vec![]);

        let truncated = CapturedOutput {
            stdout_truncated: true,
            ..CapturedOutput::from_stdout(stdout)
        };
        let findings = Masscan.parse(&truncated, &call).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].open_port(), Some((22, None)));

        // The same text without the truncation flag is malformed
        let err = Masscan
            .parse(&CapturedOutput::from_stdout(stdout), &call)
            .unwrap_err();
        assert!(matches!(err, EngineError::ParseError { .. }));
    }

    #[test]
    fn test_discovery_parse() {
        let stdout = "Nmap scan report for gw.local (10.0.0.1)\nHost is up.\nNmap scan report for 10.0.0.9\n";
        let target = Target::parse("10.0.0.0/24").unwrap();
        let call = PreparedCall::new(&target, vec![]);
        let findings = Discovery
            .parse(&CapturedOutput::from_stdout(stdout), &call)
            .unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(
            findings[0].kind,
            FindingKind::LiveHost {
                ip: "10.0.0.1".into(),
                hostname: Some("gw.local".into())
            }
        );
    }
}
