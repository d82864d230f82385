//! Assessment targets and their grammars
//!
//! A `Target` is immutable once constructed and is checked against the grammar
//! of the capability that will consume it before any process is spawned.
//!
//! - **Host**: IPv4/IPv6 literal, CIDR block, or RFC 1123 hostname
//! - **Url**: `http`/`https` only, host part must itself be a valid host
//! - **Domain**: registrable name with at least one dot
//! - **File**: absolute path without `..` components

use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::Capability;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// URL schemes accepted for web targets
pub const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

static HOST_LABEL: OnceLock<Regex> = OnceLock::new();
static DOMAIN: OnceLock<Regex> = OnceLock::new();

fn host_label() -> &'static Regex {
    HOST_LABEL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$")
            .expect("Invalid host label pattern")
    })
}

fn domain_pattern() -> &'static Regex {
    DOMAIN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9\-.]+[a-zA-Z0-9]$").expect("Invalid domain pattern")
    })
}

/// What a step is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Target {
    Host(String),
    Url(String),
    Domain(String),
    File(PathBuf),
}

impl Target {
    /// Detect the target kind from free-form input and validate it.
    ///
    /// URLs need an explicit scheme, absolute paths become file targets, and
    /// everything else must be a valid host (IP, CIDR, or hostname).
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(EngineError::InvalidTarget("empty target".to_string()));
        }

        if input.contains("://") {
            validate_url(input)?;
            return Ok(Target::Url(input.to_string()));
        }

        if input.starts_with('/') {
            let path = PathBuf::from(input);
            validate_file(&path)?;
            return Ok(Target::File(path));
        }

        validate_host(input)?;
        Ok(Target::Host(input.to_string()))
    }

    /// Build a domain target, validating the domain grammar.
    pub fn domain(input: &str) -> Result<Self, EngineError> {
        validate_domain(input)?;
        Ok(Target::Domain(input.to_string()))
    }

    /// Build an `http(s)://host:port/` URL target for a discovered web port.
    pub fn http_url(host: &str, port: u16, tls: bool) -> Result<Self, EngineError> {
        validate_host(host)?;
        let scheme = if tls { "https" } else { "http" };
        let default_port = if tls { 443 } else { 80 };
        let authority = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        let url = if port == default_port {
            format!("{}://{}/", scheme, authority)
        } else {
            format!("{}://{}:{}/", scheme, authority, port)
        };
        Ok(Target::Url(url))
    }

    /// The value handed to a tool as a single argv element.
    pub fn as_arg(&self) -> String {
        match self {
            Target::Host(s) | Target::Url(s) | Target::Domain(s) => s.clone(),
            Target::File(p) => p.to_string_lossy().into_owned(),
        }
    }

    /// Host part of a host or URL target.
    pub fn host(&self) -> Option<String> {
        match self {
            Target::Host(h) => Some(h.clone()),
            Target::Url(u) => split_url(u).map(|(_, host, _)| host.to_string()),
            Target::Domain(d) => Some(d.clone()),
            Target::File(_) => None,
        }
    }

    /// Domain view of a target, for OSINT steps.
    pub fn to_domain(&self) -> Option<Target> {
        let host = self.host()?;
        let host = host.split('/').next().unwrap_or(&host).to_string();
        if host.parse::<IpAddr>().is_ok() {
            return None;
        }
        validate_domain(&host).ok()?;
        Some(Target::Domain(host))
    }

    pub fn is_cidr(&self) -> bool {
        matches!(self, Target::Host(h) if h.contains('/'))
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Target::Host(_) => "host",
            Target::Url(_) => "url",
            Target::Domain(_) => "domain",
            Target::File(_) => "file",
        }
    }

    /// Check that this target kind is something the capability can consume.
    pub fn check_for(&self, capability: Capability) -> Result<(), EngineError> {
        let ok = match capability {
            Capability::Network => matches!(self, Target::Host(_) | Target::Domain(_)),
            Capability::Web => matches!(self, Target::Url(_)),
            Capability::Vulnerability => {
                matches!(self, Target::Url(_) | Target::Host(_) | Target::Domain(_))
            }
            Capability::Forensic => matches!(self, Target::File(_)),
            Capability::Social => matches!(self, Target::Domain(_)),
            Capability::Report => true,
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidTarget(format!(
                "{} target is not valid for {} steps",
                self.kind_str(),
                capability
            )))
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_arg())
    }
}

/// Checks if a string contains shell metacharacters.
///
/// Detects: | & ; ' " ` $ \n \r < > and NUL. Arguments never reach a shell,
/// but values with these characters are still refused so a target can never
/// be mistaken for something other than data by a wrapped tool.
pub fn has_shell_metacharacters(s: &str) -> bool {
    s.chars().any(|c| {
        matches!(
            c,
            '|' | '&' | ';' | '\'' | '"' | '`' | '$' | '\n' | '\r' | '<' | '>' | '\0'
        )
    })
}

/// Validate an IP, CIDR block, or hostname.
pub fn validate_host(input: &str) -> Result<(), EngineError> {
    if input.is_empty() || input.len() > 253 {
        return Err(EngineError::InvalidTarget(
            "host must be 1-253 characters".to_string(),
        ));
    }
    if has_shell_metacharacters(input) {
        return Err(EngineError::InvalidTarget(
            "host contains shell metacharacters".to_string(),
        ));
    }

    if let Some((addr, prefix)) = input.split_once('/') {
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| EngineError::InvalidTarget(format!("invalid CIDR address '{}'", addr)))?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        let bits: u8 = prefix
            .parse()
            .map_err(|_| EngineError::InvalidTarget(format!("invalid CIDR prefix '{}'", prefix)))?;
        if bits > max {
            return Err(EngineError::InvalidTarget(format!(
                "CIDR prefix /{} exceeds /{}",
                bits, max
            )));
        }
        return Ok(());
    }

    if input.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    // Dotted quads that failed IP parsing are not hostnames either
    if input.split('.').all(|p| p.chars().all(|c| c.is_ascii_digit())) {
        return Err(EngineError::InvalidTarget(format!(
            "invalid IPv4 address '{}'",
            input
        )));
    }

    let name = input.strip_suffix('.').unwrap_or(input);
    if name.split('.').all(|label| host_label().is_match(label)) {
        Ok(())
    } else {
        Err(EngineError::InvalidTarget(format!(
            "invalid hostname '{}'",
            input
        )))
    }
}

/// Validate a web URL against the scheme whitelist.
pub fn validate_url(input: &str) -> Result<(), EngineError> {
    if input.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(EngineError::InvalidTarget(
            "URL contains whitespace or control characters".to_string(),
        ));
    }
    if input.chars().any(|c| matches!(c, '\'' | '"' | '`' | '<' | '>')) {
        return Err(EngineError::InvalidTarget(
            "URL contains quote or angle bracket characters".to_string(),
        ));
    }

    let (scheme, host, _) = split_url(input)
        .ok_or_else(|| EngineError::InvalidTarget(format!("malformed URL '{}'", input)))?;

    if !ALLOWED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
        return Err(EngineError::InvalidTarget(format!(
            "URL scheme '{}' is not allowed (use http or https)",
            scheme
        )));
    }
    if host.contains("..") {
        return Err(EngineError::InvalidTarget(
            "URL host contains traversal sequence".to_string(),
        ));
    }

    validate_host(host)
}

/// Validate an OSINT domain.
pub fn validate_domain(input: &str) -> Result<(), EngineError> {
    if !domain_pattern().is_match(input) || !input.contains('.') || input.contains("..") {
        return Err(EngineError::InvalidTarget(format!(
            "invalid domain '{}'",
            input
        )));
    }
    Ok(())
}

/// Validate a file target: absolute, no `..`, no metacharacters.
pub fn validate_file(path: &Path) -> Result<(), EngineError> {
    if !path.is_absolute() {
        return Err(EngineError::InvalidTarget(
            "file targets must be absolute paths".to_string(),
        ));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(EngineError::InvalidTarget(
            "file path contains a traversal sequence".to_string(),
        ));
    }
    let as_str = path
        .to_str()
        .ok_or_else(|| EngineError::InvalidTarget("file path is not valid UTF-8".to_string()))?;
    if has_shell_metacharacters(as_str) {
        return Err(EngineError::InvalidTarget(
            "file path contains shell metacharacters".to_string(),
        ));
    }
    Ok(())
}

/// Split `scheme://host[:port][/rest]` into `(scheme, host, port)`.
fn split_url(url: &str) -> Option<(&str, &str, Option<u16>)> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme.is_empty() {
        return None;
    }
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    // userinfo is never valid in a target URL
    if authority.is_empty() || authority.contains('@') {
        return None;
    }

    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, after) = stripped.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if after.is_empty() => None,
            None => return None,
        };
        return Some((scheme, host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((scheme, host, Some(port.parse().ok()?))),
        None => Some((scheme, authority, None)),
    }
}
