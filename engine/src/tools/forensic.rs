//! Forensic adapters over absolute file paths: string extraction, firmware
//! signatures, packet captures, file carving, and memory images

use super::{file_arg, json_array_prefix, PrepareContext, PreparedCall, ToolAdapter, ToolSpec};
use crate::command_executor::CapturedOutput;
use crate::target::Target;
use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::{Capability, Finding, FindingKind, Severity, StringCategory, ToolInput};
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use uuid::Uuid;

/// Lines of `strings` output considered for categorisation
const MAX_STRING_LINES: usize = 1000;
const MAX_PER_CATEGORY: usize = 50;
const MAX_MEMORY_ROWS: usize = 500;

const KEYWORDS: &[&str] = &[
    "password", "secret", "api_key", "token", "auth", "admin", "root", "key",
];

const CARVE_TYPES: &[&str] = &[
    "jpg", "gif", "png", "bmp", "avi", "exe", "mpg", "wav", "riff", "wmv", "mov", "pdf", "ole",
    "doc", "zip", "rar", "htm", "cpp", "all",
];

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^\s]+").expect("Invalid URL pattern"))
}

fn email_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("Invalid email pattern")
    })
}

fn ip_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("Invalid IP pattern"))
}

fn path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z]:\\[\\\w\s\-.]+|/[\w/\-.]+").expect("Invalid path pattern")
    })
}

fn signature_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\s+(.+)$").expect("Invalid signature pattern"))
}

fn plugin_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_]+(\.[A-Za-z0-9_]+)+$").expect("Invalid plugin pattern")
    })
}

fn display_filter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_.:=!() ]{1,200}$").expect("Invalid display filter pattern")
    })
}

/// Printable string extraction with categorisation.
pub struct Strings;

/// Sort extracted strings into categories, deduplicated and capped per category.
pub fn categorize_strings(lines: &str) -> BTreeMap<StringCategory, Vec<String>> {
    let mut out: BTreeMap<StringCategory, Vec<String>> = BTreeMap::new();
    let mut seen: HashSet<(StringCategory, String)> = HashSet::new();

    let mut push = |category: StringCategory, value: &str| {
        let bucket = out.entry(category).or_default();
        if bucket.len() < MAX_PER_CATEGORY && seen.insert((category, value.to_string())) {
            bucket.push(value.to_string());
        }
    };

    for line in lines.lines().take(MAX_STRING_LINES) {
        let value = line.trim();
        if value.is_empty() {
            continue;
        }
        if url_pattern().is_match(value) {
            push(StringCategory::Url, value);
        }
        if email_pattern().is_match(value) {
            push(StringCategory::Email, value);
        }
        if ip_pattern().is_match(value) {
            push(StringCategory::Ip, value);
        }
        if path_pattern().is_match(value) {
            push(StringCategory::FilePath, value);
        }
        let lower = value.to_lowercase();
        if KEYWORDS.iter().any(|k| lower.contains(k)) {
            push(StringCategory::Keyword, value);
        }
    }
    out.retain(|_, v| !v.is_empty());
    out
}

impl ToolAdapter for Strings {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "strings",
            capability: Capability::Forensic,
            binary: Some("strings"),
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
        _ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let file = file_arg(target)?;
        let min_length = input.param_i64_in("min_length", 1, 100, 4)?;
        let mut args = vec!["-n".to_string(), min_length.to_string()];

        match input.param_str_opt("encoding").as_deref() {
            None | Some("ascii") | Some("s") => {}
            Some("unicode") => args.extend(["-e".into(), "l".into()]),
            Some("utf-8") | Some("S") => args.extend(["-e".into(), "S".into()]),
            Some(other) => {
                return Err(EngineError::InvalidTarget(format!(
                    "unsupported encoding '{}'",
                    other
                )))
            }
        }

        args.push(file);
        Ok(PreparedCall::new(target, args))
    }

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        let target = call.target.as_arg();
        let mut findings = Vec::new();
        for (category, values) in categorize_strings(&output.stdout) {
            let severity = if category == StringCategory::Keyword {
                Severity::Low
            } else {
                Severity::Info
            };
            findings.extend(values.into_iter().map(|value| {
                Finding::new(
                    "strings",
                    &target,
                    FindingKind::ExtractedString { category, value },
                )
                .with_severity(severity)
            }));
        }
        Ok(findings)
    }
}

/// Firmware and embedded file signature analysis.
pub struct Binwalk;

impl ToolAdapter for Binwalk {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "binwalk",
            capability: Capability::Forensic,
            binary: Some("binwalk"),
            timeout_units: 10,
            intrusiveness: 0.0,
            thoroughness: 0.6,
            ok_exit_codes: &[0],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let file = file_arg(target)?;
        let extract = input.param_bool_opt("extract").unwrap_or(false);
        let entropy = input.param_bool_opt("entropy").unwrap_or(false);

        let mut args = vec!["-B".to_string()];
        if extract {
            args.push("-e".into());
        }
        if entropy {
            args.push("-E".into());
            args.push("--nplot".into());
        }
        args.push(file);

        let mut call = PreparedCall::new(target, args);
        if extract {
            // Extraction lands in the working directory
            call.working_dir = Some(ctx.work_dir.join(format!("binwalk-{}", Uuid::new_v4())));
        }
        Ok(call)
    }

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        let target = call.target.as_arg();
        let mut findings = Vec::new();
        for line in output.stdout.lines() {
            let Some(caps) = signature_line().captures(line.trim()) else {
                continue;
            };
            let Ok(offset) = caps[1].parse::<u64>() else {
                continue;
            };
            // `0   0x0   ELF, 64-bit LSB executable`: drop the hex column
            let rest = caps[2].trim();
            let description = match rest.split_once(char::is_whitespace) {
                Some((hex, tail)) if hex.starts_with("0x") => tail.trim(),
                _ => rest,
            };
            findings.push(Finding::new(
                "binwalk",
                &target,
                FindingKind::Signature {
                    offset,
                    description: description.to_string(),
                },
            ));
        }
        Ok(findings)
    }
}

/// Packet capture protocol breakdown.
pub struct Tshark;

impl ToolAdapter for Tshark {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "tshark",
            capability: Capability::Forensic,
            binary: Some("tshark"),
            timeout_units: 5,
            intrusiveness: 0.0,
            thoroughness: 0.5,
            ok_exit_codes: &[0],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        _ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let file = file_arg(target)?;
        let max_packets = input.param_i64_in("max_packets", 1, 100_000, 10_000)?;
        let mut args = vec![
            "-r".to_string(),
            file,
            "-T".into(),
            "json".into(),
            "-c".into(),
            max_packets.to_string(),
        ];
        if let Some(filter) = input.param_str_opt("filter") {
            if !display_filter().is_match(&filter) {
                return Err(EngineError::InvalidTarget(
                    "display filter contains unsupported characters".to_string(),
                ));
            }
            args.push("-Y".into());
            args.push(filter);
        }
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
        let packets: Vec<serde_json::Value> = if output.stdout_truncated && stdout.starts_with('[') {
            json_array_prefix(stdout)
        } else {
            serde_json::from_str(stdout)
                .map_err(|_| EngineError::parse_error("tshark", stdout.as_bytes()))?
        };

        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for packet in &packets {
            if let Some(layers) = packet
                .pointer("/_source/layers")
                .and_then(|l| l.as_object())
            {
                for protocol in layers.keys() {
                    *counts.entry(protocol.clone()).or_default() += 1;
                }
            }
        }

        let target = call.target.as_arg();
        Ok(counts
            .into_iter()
            .map(|(protocol, packets)| {
                Finding::new(
                    "tshark",
                    &target,
                    FindingKind::ProtocolStat { protocol, packets },
                )
            })
            .collect())
    }
}

/// File carving from disk images.
pub struct Foremost;

impl ToolAdapter for Foremost {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "foremost",
            capability: Capability::Forensic,
            binary: Some("foremost"),
            timeout_units: 30,
            intrusiveness: 0.0,
            thoroughness: 0.8,
            ok_exit_codes: &[0],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let file = file_arg(target)?;
        let types = input
            .param_list("types")
            .unwrap_or_else(|| vec!["all".to_string()]);
        if types.is_empty() || types.iter().any(|t| !CARVE_TYPES.contains(&t.as_str())) {
            return Err(EngineError::InvalidTarget(format!(
                "carve types must be drawn from: {}",
                CARVE_TYPES.join(", ")
            )));
        }

        // foremost refuses to write into a non-empty directory, so each run gets its own
        let output_dir = ctx.work_dir.join(format!("foremost-{}", Uuid::new_v4()));
        let args = vec![
            "-i".to_string(),
            file,
            "-o".into(),
            output_dir.to_string_lossy().into_owned(),
            "-t".into(),
            types.join(","),
        ];
        let mut call = PreparedCall::new(target, args);
        call.output_dir = Some(output_dir);
        Ok(call)
    }

    fn parse(
        &self,
        _output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        let Some(dir) = &call.output_dir else {
            return Ok(Vec::new());
        };
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let count = std::fs::read_dir(&path)?.flatten().count() as u64;
            if count > 0 {
                counts.insert(entry.file_name().to_string_lossy().into_owned(), count);
            }
        }

        let target = call.target.as_arg();
        Ok(counts
            .into_iter()
            .map(|(file_type, count)| {
                Finding::new(
                    "foremost",
                    &target,
                    FindingKind::CarvedFiles { file_type, count },
                )
            })
            .collect())
    }
}

/// Memory image analysis with volatility 3.
pub struct Volatility;

impl ToolAdapter for Volatility {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "volatility",
            capability: Capability::Forensic,
            binary: Some("vol"),
            timeout_units: 20,
            intrusiveness: 0.0,
            thoroughness: 0.9,
            ok_exit_codes: &[0],
        }
    }

    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        _ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError> {
        let file = file_arg(target)?;
        let plugin = input
            .param_str_opt("plugin")
            .unwrap_or_else(|| "windows.pslist".to_string());
        if !plugin_name().is_match(&plugin) {
            return Err(EngineError::InvalidTarget(format!(
                "invalid volatility plugin '{}'",
                plugin
            )));
        }
        Ok(PreparedCall::new(target, vec!["-f".into(), file, plugin]))
    }

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError> {
        let plugin = call.args.last().cloned().unwrap_or_default();
        let target = call.target.as_arg();
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| {
                !l.is_empty()
                    && !l.starts_with("Volatility")
                    && !l.starts_with("Progress")
                    && l.split_whitespace().count() >= 2
            })
            .take(MAX_MEMORY_ROWS)
            .map(|row| {
                Finding::new(
                    "volatility",
                    &target,
                    FindingKind::MemoryArtifact {
                        plugin: plugin.clone(),
                        row: row.to_string(),
                    },
                )
            })
            .collect())
    }
}
