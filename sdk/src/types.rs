//! Shared data contract
//!
//! Capabilities, findings, and the `{status, findings, error}` report shape
//! every tool adapter returns across the adapter boundary.

use crate::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// A named class of security-assessment function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Network,
    Web,
    Vulnerability,
    Forensic,
    Social,
    Report,
}

impl Capability {
    /// All capabilities in planning order.
    pub const ALL: [Capability; 6] = [
        Capability::Network,
        Capability::Web,
        Capability::Vulnerability,
        Capability::Forensic,
        Capability::Social,
        Capability::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Network => "network",
            Capability::Web => "web",
            Capability::Vulnerability => "vulnerability",
            Capability::Forensic => "forensic",
            Capability::Social => "social",
            Capability::Report => "report",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown capability '{}'", s))
    }
}

/// Severity of a finding, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Request-level priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Numeric weight (1, 3, 7, 10).
    pub fn weight(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 3,
            Priority::High => 7,
            Priority::Critical => 10,
        }
    }

    /// Weight scaled into [0, 1].
    pub fn normalized(&self) -> f64 {
        f64::from(self.weight()) / 10.0
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Category of an interesting string pulled out of a binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringCategory {
    Url,
    Email,
    Ip,
    FilePath,
    Keyword,
}

/// Category of an OSINT record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsintCategory {
    Email,
    Host,
    Ip,
    Url,
}

/// Overall risk level of an assessment digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Typed payload of a finding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FindingKind {
    OpenPort {
        host: String,
        port: u16,
        protocol: String,
        service: Option<String>,
        version: Option<String>,
    },
    LiveHost {
        ip: String,
        hostname: Option<String>,
    },
    InterestingPath {
        path: String,
        status_code: Option<u16>,
        size: Option<u64>,
    },
    WebVulnerability {
        reference: Option<String>,
        message: String,
        uri: Option<String>,
    },
    SqlInjection {
        parameter: Option<String>,
        technique: String,
    },
    Technology {
        name: String,
        version: Option<String>,
    },
    Exploit {
        title: String,
        edb_id: Option<String>,
        path: Option<String>,
    },
    ExtractedString {
        category: StringCategory,
        value: String,
    },
    Signature {
        offset: u64,
        description: String,
    },
    MemoryArtifact {
        plugin: String,
        row: String,
    },
    ProtocolStat {
        protocol: String,
        packets: u64,
    },
    CarvedFiles {
        file_type: String,
        count: u64,
    },
    OsintRecord {
        category: OsintCategory,
        value: String,
    },
    Summary {
        risk_level: RiskLevel,
        total: u32,
        severity_counts: BTreeMap<Severity, u32>,
        key_findings: Vec<String>,
    },
}

/// A structured unit of discovered information. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Finding {
    pub tool: String,
    pub target: String,
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: FindingKind,
}

impl Finding {
    /// Create an informational finding.
    pub fn new(tool: impl Into<String>, target: impl Into<String>, kind: FindingKind) -> Self {
        Self {
            tool: tool.into(),
            target: target.into(),
            severity: Severity::Info,
            kind,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// One-line human readable title.
    pub fn title(&self) -> String {
        match &self.kind {
            FindingKind::OpenPort {
                host,
                port,
                protocol,
                service,
                ..
            } => format!(
                "Open port {}/{} on {} ({})",
                port,
                protocol,
                host,
                service.as_deref().unwrap_or("unknown")
            ),
            FindingKind::LiveHost { ip, .. } => format!("Live host {}", ip),
            FindingKind::InterestingPath {
                path, status_code, ..
            } => match status_code {
                Some(code) => format!("Path {} (HTTP {})", path, code),
                None => format!("Path {}", path),
            },
            FindingKind::WebVulnerability { message, .. } => message.clone(),
            FindingKind::SqlInjection {
                parameter,
                technique,
            } => format!(
                "SQL injection ({}) in parameter {}",
                technique,
                parameter.as_deref().unwrap_or("?")
            ),
            FindingKind::Technology { name, version } => match version {
                Some(v) => format!("{} {}", name, v),
                None => name.clone(),
            },
            FindingKind::Exploit { title, .. } => format!("Known exploit: {}", title),
            FindingKind::ExtractedString { category, value } => {
                format!("{:?} string: {}", category, value)
            }
            FindingKind::Signature {
                offset,
                description,
            } => format!("{:#x}: {}", offset, description),
            FindingKind::MemoryArtifact { plugin, row } => format!("{}: {}", plugin, row),
            FindingKind::ProtocolStat { protocol, packets } => {
                format!("{} packets of {}", packets, protocol)
            }
            FindingKind::CarvedFiles { file_type, count } => {
                format!("{} carved {} files", count, file_type)
            }
            FindingKind::OsintRecord { category, value } => format!("{:?}: {}", category, value),
            FindingKind::Summary {
                risk_level, total, ..
            } => format!("Overall risk {:?} across {} findings", risk_level, total),
        }
    }

    /// Returns `(port, service)` when this finding is an open port.
    pub fn open_port(&self) -> Option<(u16, Option<&str>)> {
        match &self.kind {
            FindingKind::OpenPort { port, service, .. } => Some((*port, service.as_deref())),
            _ => None,
        }
    }
}

/// Outcome status in the external report contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Completed,
    Failed,
}

/// `{status, findings, error?}` as returned across the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolReport {
    pub status: ToolStatus,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub truncated: bool,
}

impl ToolReport {
    pub fn completed(findings: Vec<Finding>, truncated: bool) -> Self {
        Self {
            status: ToolStatus::Completed,
            findings,
            error: None,
            truncated,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Failed,
            findings: Vec::new(),
            error: Some(error.into()),
            truncated: false,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Aggregate availability of one capability's tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

/// Result of `health_check()`: status plus a per-tool availability map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub capability: Capability,
    pub status: HealthStatus,
    pub tools: BTreeMap<String, bool>,
}

impl HealthReport {
    pub fn from_availability(capability: Capability, tools: BTreeMap<String, bool>) -> Self {
        let available = tools.values().filter(|v| **v).count();
        let status = if available == 0 {
            HealthStatus::Unavailable
        } else if available == tools.len() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        Self {
            capability,
            status,
            tools,
        }
    }

    pub fn is_available(&self, tool: &str) -> bool {
        self.tools.get(tool).copied().unwrap_or(false)
    }
}

/// Target plus free-form options for one tool operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolInput {
    pub target: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl ToolInput {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            params: HashMap::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Get an optional string parameter
    pub fn param_str_opt(&self, key: &str) -> Option<String> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    /// Get an optional i64 parameter, rejecting values of the wrong type
    pub fn param_i64_opt(&self, key: &str) -> Result<Option<i64>, EngineError> {
        match self.params.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => v.as_i64().map(Some).ok_or_else(|| {
                EngineError::InvalidTarget(format!("parameter '{}' must be an integer", key))
            }),
        }
    }

    /// Get an i64 parameter bounded to `[min, max]`, or `default` when absent
    pub fn param_i64_in(
        &self,
        key: &str,
        min: i64,
        max: i64,
        default: i64,
    ) -> Result<i64, EngineError> {
        let value = self.param_i64_opt(key)?.unwrap_or(default);
        if value < min || value > max {
            return Err(EngineError::InvalidTarget(format!(
                "parameter '{}' must be between {} and {}, got {}",
                key, min, max, value
            )));
        }
        Ok(value)
    }

    /// Get an optional bool parameter
    pub fn param_bool_opt(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }

    /// Get a list of strings, accepting either a JSON array or a comma separated string
    pub fn param_list(&self, key: &str) -> Option<Vec<String>> {
        match self.params.get(key)? {
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            serde_json::Value::String(s) => Some(
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect(),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capability_parse_and_display() {
        assert_eq!("Network".parse::<Capability>().unwrap(), Capability::Network);
        assert_eq!(Capability::Vulnerability.to_string(), "vulnerability");
        assert!("plumbing".parse::<Capability>().is_err());
    }

    #[test]
    fn test_priority_weights() {
        assert_eq!(Priority::High.weight(), 7);
        assert!((Priority::Critical.normalized() - 1.0).abs() < f64::EPSILON);
        assert_eq!("medium".parse::<Priority>().unwrap(), Priority::Medium);
    }

    #[test]
    fn test_finding_json_shape() {
        let finding = Finding::new(
            "nmap",
            "192.168.1.1",
            FindingKind::OpenPort {
                host: "192.168.1.1".into(),
                port: 80,
                protocol: "tcp".into(),
                service: Some("http".into()),
                version: None,
            },
        );
        let value = serde_json::to_value(&finding).unwrap();
        assert_eq!(value["type"], "open_port");
        assert_eq!(value["port"], 80);
        assert_eq!(value["severity"], "info");
        assert_eq!(finding.open_port(), Some((80, Some("http"))));
    }

    #[test]
    fn test_tool_report_failed_shape() {
        let report = ToolReport::failed("binary missing");
        let json = report.to_json();
        assert!(json.contains("\"status\":\"failed\""));
        assert_eq!(ToolReport::from_json(&json).unwrap(), report);
    }

    #[test]
    fn test_health_report_status() {
        let mut tools = BTreeMap::new();
        tools.insert("nmap".to_string(), true);
        tools.insert("masscan".to_string(), false);
        let report = HealthReport::from_availability(Capability::Network, tools.clone());
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.is_available("nmap"));
        assert!(!report.is_available("masscan"));

        tools.insert("masscan".to_string(), true);
        let report = HealthReport::from_availability(Capability::Network, tools);
        assert_eq!(report.status, HealthStatus::Healthy);

        let empty = HealthReport::from_availability(Capability::Report, BTreeMap::new());
        assert_eq!(empty.status, HealthStatus::Unavailable);
    }

    #[test]
    fn test_param_bounds() {
        let input = ToolInput::new("/tmp/a.bin").with_param("min_length", json!(0));
        let err = input.param_i64_in("min_length", 1, 100, 4).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTarget(_)));

        let input = ToolInput::new("/tmp/a.bin");
        assert_eq!(input.param_i64_in("min_length", 1, 100, 4).unwrap(), 4);

        let input = ToolInput::new("x").with_param("min_length", json!("ten"));
        assert!(input.param_i64_opt("min_length").is_err());
    }

    #[test]
    fn test_param_list_forms() {
        let input = ToolInput::new("x")
            .with_param("a", json!(["php", " html "]))
            .with_param("b", json!("google, bing,,yahoo"));
        assert_eq!(input.param_list("a").unwrap(), vec!["php", "html"]);
        assert_eq!(input.param_list("b").unwrap(), vec!["google", "bing", "yahoo"]);
        assert!(input.param_list("c").is_none());
    }
}
