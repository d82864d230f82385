//! Tool adapters
//!
//! One adapter per external security tool, registered under its capability.
//! An adapter validates step options, builds the argument vector, and parses
//! the captured output into findings. [`ToolSet`] owns the adapters, resolves
//! binaries, and runs each call through the shared [`ProcessRunner`].

pub mod forensic;
pub mod network;
pub mod report;
pub mod social;
pub mod vulnerability;
pub mod web;

use crate::command_executor::{
    CapturedOutput, CommandError, CommandExecutor, CommandSpec, ProcessRunner,
};
use crate::config::Config;
use crate::target::Target;
use sdk::errors::EngineError;
use sdk::types::{Capability, Finding, HealthReport, ToolInput};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Static description of a wrapped tool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub capability: Capability,
    /// `None` for tools that run in-process
    pub binary: Option<&'static str>,
    /// Hard ceiling as a multiple of the base timeout
    pub timeout_units: u32,
    /// How noisy the tool is against the target, 0 (passive) to 1
    pub intrusiveness: f64,
    /// How much ground the tool covers, 0 to 1
    pub thoroughness: f64,
    pub ok_exit_codes: &'static [i32],
}

impl ToolSpec {
    pub fn ceiling(&self, base: Duration) -> Duration {
        base * self.timeout_units
    }
}

/// Inputs an adapter may need besides the target and options.
#[derive(Debug, Clone, Copy)]
pub struct PrepareContext<'a> {
    pub wordlist: &'a Path,
    pub work_dir: &'a Path,
    /// Findings of the steps this one depends on
    pub upstream: &'a [Finding],
}

/// A validated call, ready to hand to the process runner.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub target: Target,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Directory the tool writes results into, created before spawning
    pub output_dir: Option<PathBuf>,
}

impl PreparedCall {
    pub fn new(target: &Target, args: Vec<String>) -> Self {
        Self {
            target: target.clone(),
            args,
            working_dir: None,
            output_dir: None,
        }
    }
}

pub trait ToolAdapter: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Narrower target check than the capability grammar, e.g. IP-only tools.
    fn accepts(&self, _target: &Target) -> bool {
        true
    }

    /// Validate options and build the argument vector. Never spawns anything.
    fn prepare(
        &self,
        target: &Target,
        input: &ToolInput,
        ctx: &PrepareContext<'_>,
    ) -> Result<PreparedCall, EngineError>;

    fn parse(
        &self,
        output: &CapturedOutput,
        call: &PreparedCall,
    ) -> Result<Vec<Finding>, EngineError>;

    /// In-process tools compute their findings here instead of spawning.
    fn run_builtin(&self, _call: &PreparedCall, _upstream: &[Finding]) -> Option<Vec<Finding>> {
        None
    }
}

/// Result of one successful adapter invocation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub argv: Vec<String>,
    pub findings: Vec<Finding>,
    pub truncated: bool,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

/// One adapter call.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub capability: Capability,
    pub tool: &'a str,
    pub target: &'a Target,
    pub input: &'a ToolInput,
    /// Requested timeout, capped at the tool ceiling
    pub timeout: Option<Duration>,
    pub upstream: &'a [Finding],
}

/// Every registered adapter plus what is needed to run them.
pub struct ToolSet {
    adapters: BTreeMap<&'static str, Arc<dyn ToolAdapter>>,
    path_overrides: HashMap<String, PathBuf>,
    runner: Arc<dyn ProcessRunner>,
    base_timeout: Duration,
    output_limit: usize,
    work_dir: PathBuf,
    wordlist: PathBuf,
}

impl ToolSet {
    /// All built-in adapters, run through a [`CommandExecutor`] whose allowlist
    /// is exactly their binaries plus any configured overrides.
    pub fn from_config(config: &Config) -> Self {
        let adapters = builtin_adapters();
        let mut executor = CommandExecutor::with_allowlist(
            adapters
                .iter()
                .filter_map(|a| a.spec().binary.map(String::from)),
            config.execution.kill_grace(),
        );
        for path in config.tools.paths.values() {
            if let Some(name) = path.file_name() {
                executor.allow_command(name.to_string_lossy().into_owned());
            }
        }
        Self::build(config, Arc::new(executor), adapters)
    }

    /// Built-in adapters run through a caller-supplied runner.
    pub fn with_runner(config: &Config, runner: Arc<dyn ProcessRunner>) -> Self {
        Self::build(config, runner, builtin_adapters())
    }

    fn build(
        config: &Config,
        runner: Arc<dyn ProcessRunner>,
        adapters: Vec<Arc<dyn ToolAdapter>>,
    ) -> Self {
        let mut set = Self {
            adapters: BTreeMap::new(),
            path_overrides: config.tools.paths.clone(),
            runner,
            base_timeout: config.execution.base_timeout(),
            output_limit: config.execution.output_limit_bytes,
            work_dir: config.execution.work_dir.clone(),
            wordlist: config.tools.wordlist.clone(),
        };
        for adapter in adapters {
            set.register(adapter);
        }
        set
    }

    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        let name = adapter.spec().name;
        if self.adapters.insert(name, adapter).is_some() {
            warn!("Adapter {} registered twice, keeping the latest", name);
        }
    }

    pub fn get(&self, tool: &str) -> Option<&Arc<dyn ToolAdapter>> {
        self.adapters.get(tool)
    }

    pub fn specs(&self) -> impl Iterator<Item = ToolSpec> + '_ {
        self.adapters.values().map(|a| a.spec())
    }

    /// Names of the adapters registered under a capability.
    pub fn tools_for(&self, capability: Capability) -> Vec<&'static str> {
        self.adapters
            .values()
            .map(|a| a.spec())
            .filter(|s| s.capability == capability)
            .map(|s| s.name)
            .collect()
    }

    pub fn ceiling(&self, tool: &str) -> Option<Duration> {
        self.get(tool).map(|a| a.spec().ceiling(self.base_timeout))
    }

    /// Effective timeout: the requested one capped at the tool ceiling.
    pub fn timeout_for(&self, tool: &str, requested: Option<Duration>) -> Option<Duration> {
        let ceiling = self.ceiling(tool)?;
        Some(requested.map_or(ceiling, |t| t.min(ceiling)))
    }

    /// Locate a tool's binary: configured override first, then `PATH`.
    pub fn resolve_binary(&self, tool: &str) -> Option<PathBuf> {
        let spec = self.get(tool)?.spec();
        let binary = spec.binary?;

        let configured = self
            .path_overrides
            .get(spec.name)
            .or_else(|| self.path_overrides.get(binary));
        if let Some(path) = configured {
            return is_executable(path).then(|| path.clone());
        }

        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(binary))
            .find(|candidate| is_executable(candidate))
    }

    pub fn is_available(&self, tool: &str) -> bool {
        match self.get(tool) {
            Some(adapter) if adapter.spec().binary.is_none() => true,
            Some(_) => self.resolve_binary(tool).is_some(),
            None => false,
        }
    }

    /// Availability of every adapter of a capability. A pure lookup.
    pub fn health_check(&self, capability: Capability) -> HealthReport {
        let tools = self
            .tools_for(capability)
            .into_iter()
            .map(|name| (name.to_string(), self.is_available(name)))
            .collect();
        HealthReport::from_availability(capability, tools)
    }

    /// Validate, spawn, and parse one adapter call.
    ///
    /// Validation happens before binary resolution, and binary resolution
    /// before any spawn, so an invalid target or a missing tool never starts
    /// a process.
    pub async fn invoke(
        &self,
        call: Invocation<'_>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome, EngineError> {
        let adapter = self
            .get(call.tool)
            .ok_or_else(|| EngineError::ToolNotFound {
                tool: call.tool.to_string(),
            })?;
        let spec = adapter.spec();
        if spec.capability != call.capability {
            return Err(EngineError::Orchestration(format!(
                "tool {} does not serve capability {}",
                spec.name, call.capability
            )));
        }

        call.target.check_for(call.capability)?;
        if !adapter.accepts(call.target) {
            return Err(EngineError::InvalidTarget(format!(
                "{} does not accept {} target {}",
                spec.name,
                call.target.kind_str(),
                call.target
            )));
        }

        let input = scoped_input(spec.name, call.input);
        let ctx = PrepareContext {
            wordlist: &self.wordlist,
            work_dir: &self.work_dir,
            upstream: call.upstream,
        };
        let prepared = adapter.prepare(call.target, &input, &ctx)?;

        if let Some(findings) = adapter.run_builtin(&prepared, call.upstream) {
            return Ok(ToolOutcome {
                argv: Vec::new(),
                findings,
                truncated: false,
                exit_code: Some(0),
                duration: Duration::ZERO,
            });
        }

        let program = self
            .resolve_binary(spec.name)
            .ok_or_else(|| EngineError::ToolNotFound {
                tool: spec.name.to_string(),
            })?;

        if let Some(dir) = prepared.output_dir.as_deref().and_then(Path::parent) {
            tokio::fs::create_dir_all(dir).await?;
        }
        if let Some(dir) = &prepared.working_dir {
            tokio::fs::create_dir_all(dir).await?;
        }

        let ceiling = spec.ceiling(self.base_timeout);
        let timeout = call.timeout.map_or(ceiling, |t| t.min(ceiling));
        let command = CommandSpec {
            program,
            args: prepared.args.clone(),
            working_dir: prepared.working_dir.clone(),
            timeout,
            output_limit: self.output_limit,
        };
        let argv = command.argv();
        debug!(tool = spec.name, argc = argv.len(), ?timeout, "Invoking tool");

        let output = self
            .runner
            .run(&command, cancel)
            .await
            .map_err(|e| map_command_error(spec.name, timeout, e))?;

        let exit_ok = output
            .exit_code
            .is_some_and(|code| spec.ok_exit_codes.contains(&code));
        if !exit_ok {
            return Err(EngineError::tool_execution(
                spec.name,
                output.exit_code,
                &output.stderr,
            ));
        }

        let findings = adapter.parse(&output, &prepared).map_err(|e| {
            if let EngineError::ParseError { output_hash, .. } = &e {
                warn!(tool = spec.name, %output_hash, "Unparseable tool output");
            }
            e
        })?;

        if output.truncated() {
            info!(tool = spec.name, "Tool output exceeded the capture limit and was truncated");
        }

        Ok(ToolOutcome {
            argv,
            findings,
            truncated: output.truncated(),
            exit_code: output.exit_code,
            duration: output.duration,
        })
    }
}

fn builtin_adapters() -> Vec<Arc<dyn ToolAdapter>> {
    vec![
        Arc::new(network::Nmap),
        Arc::new(network::Masscan),
        Arc::new(network::Discovery),
        Arc::new(web::Gobuster),
        Arc::new(web::Nikto),
        Arc::new(web::WhatWeb),
        Arc::new(vulnerability::Sqlmap),
        Arc::new(vulnerability::Searchsploit),
        Arc::new(forensic::Strings),
        Arc::new(forensic::Binwalk),
        Arc::new(forensic::Tshark),
        Arc::new(forensic::Foremost),
        Arc::new(forensic::Volatility),
        Arc::new(social::Harvester),
        Arc::new(report::Digest),
    ]
}

/// Options keyed `tool.key` apply only to that tool; bare keys apply to all.
fn scoped_input(tool: &str, input: &ToolInput) -> ToolInput {
    let mut scoped = ToolInput::new(input.target.clone());
    for (key, value) in &input.params {
        if !key.contains('.') {
            scoped.params.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    for (key, value) in &input.params {
        if let Some((prefix, rest)) = key.split_once('.') {
            if prefix == tool {
                scoped.params.insert(rest.to_string(), value.clone());
            }
        }
    }
    scoped
}

fn map_command_error(tool: &str, timeout: Duration, error: CommandError) -> EngineError {
    match error {
        CommandError::CommandNotAllowed(program) => EngineError::CommandNotAllowed(program),
        CommandError::ShellInjectionAttempt => {
            EngineError::CommandNotAllowed(format!("{} resolved to a shell", tool))
        }
        CommandError::InvalidArgument(arg) => {
            EngineError::InvalidTarget(format!("argument rejected: {}", arg))
        }
        CommandError::NotFound(_) => EngineError::ToolNotFound {
            tool: tool.to_string(),
        },
        CommandError::TimedOut { .. } => EngineError::Timeout {
            tool: tool.to_string(),
            timeout_secs: timeout.as_secs(),
        },
        CommandError::Cancelled => EngineError::Cancelled,
        CommandError::ExecutionFailed(e) => EngineError::Io(e),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Complete elements of a JSON array whose tail may have been cut off.
///
/// Parsing stops at the first element that does not decode, so a document
/// truncated mid-record yields every record before the cut.
pub(crate) fn json_array_prefix<T: DeserializeOwned>(text: &str) -> Vec<T> {
    let mut items = Vec::new();
    let Some(mut rest) = text.trim_start().strip_prefix('[') else {
        return items;
    };
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if rest.is_empty() || rest.starts_with(']') {
            break;
        }
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<T>();
        match stream.next() {
            Some(Ok(item)) => {
                items.push(item);
                rest = &rest[stream.byte_offset()..];
            }
            _ => break,
        }
    }
    items
}

/// Complete elements of the array stored under `key` in a cut-off JSON object.
pub(crate) fn json_array_prefix_at<T: DeserializeOwned>(text: &str, key: &str) -> Vec<T> {
    let needle = format!("\"{}\"", key);
    text.find(&needle)
        .and_then(|at| text[at + needle.len()..].trim_start().strip_prefix(':'))
        .map(json_array_prefix)
        .unwrap_or_default()
}

/// Reject option values that could be mistaken for flags or carry metacharacters.
pub(crate) fn check_option_value(key: &str, value: &str) -> Result<(), EngineError> {
    if value.is_empty() || value.starts_with('-') || crate::target::has_shell_metacharacters(value)
    {
        return Err(EngineError::InvalidTarget(format!(
            "option '{}' has an unsafe value",
            key
        )));
    }
    Ok(())
}

/// The file a file-based tool reads, re-checked against the file grammar.
pub(crate) fn file_arg(target: &Target) -> Result<String, EngineError> {
    match target {
        Target::File(path) => {
            crate::target::validate_file(path)?;
            Ok(path.to_string_lossy().into_owned())
        }
        other => Err(EngineError::InvalidTarget(format!(
            "expected an absolute file path, got {} target",
            other.kind_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_executor::ScriptedRunner;
    use serde_json::json;

    fn toolset(runner: &ScriptedRunner) -> ToolSet {
        ToolSet::with_runner(&Config::default(), Arc::new(runner.clone()))
    }

    #[test]
    fn test_every_capability_has_tools() {
        let set = toolset(&ScriptedRunner::new());
        for capability in Capability::ALL {
            assert!(
                !set.tools_for(capability).is_empty(),
                "no tools for {}",
                capability
            );
        }
    }

    #[test]
    fn test_timeout_capped_at_ceiling() {
        let set = toolset(&ScriptedRunner::new());
        assert_eq!(set.ceiling("nmap"), Some(Duration::from_secs(300)));
        assert_eq!(set.ceiling("foremost"), Some(Duration::from_secs(900)));
        assert_eq!(
            set.timeout_for("strings", Some(Duration::from_secs(3600))),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            set.timeout_for("strings", Some(Duration::from_secs(5))),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_scoped_options() {
        let input = ToolInput::new("x")
            .with_param("threads", json!(20))
            .with_param("gobuster.threads", json!(5))
            .with_param("nikto.tuning", json!("x"));
        let gobuster = scoped_input("gobuster", &input);
        assert_eq!(gobuster.params["threads"], json!(5));
        assert!(!gobuster.params.contains_key("tuning"));
        let nmap = scoped_input("nmap", &input);
        assert_eq!(nmap.params["threads"], json!(20));
    }

    #[test]
    fn test_builtin_report_always_available() {
        let set = toolset(&ScriptedRunner::new());
        assert!(set.is_available("digest"));
        assert!(!set.is_available("no-such-tool"));
    }

    #[test]
    fn test_override_path_must_be_executable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nmap");
        let mut config = Config::default();
        config.tools.paths.insert("nmap".into(), missing);
        let set = ToolSet::with_runner(&config, Arc::new(ScriptedRunner::new()));
        assert!(set.resolve_binary("nmap").is_none());
    }

    #[test]
    fn test_json_array_prefix_stops_at_cut() {
        let text = r#"[ {"a": 1}, {"a": [2, 3]},
  {"a": "x, ]"}, {"a": 4"#;
        let items: Vec<serde_json::Value> = json_array_prefix(text);
        assert_eq!(items, vec![json!({"a": 1}), json!({"a": [2, 3]}), json!({"a": "x, ]"})]);

        let items: Vec<serde_json::Value> = json_array_prefix("[]");
        assert!(items.is_empty());
        let items: Vec<serde_json::Value> = json_array_prefix("not json");
        assert!(items.is_empty());
    }

    #[test]
    fn test_json_array_prefix_at_key() {
        let text = r#"{"SEARCH":"x","RESULTS":[{"n":1},{"n":2},{"n""#;
        let items: Vec<serde_json::Value> = json_array_prefix_at(text, "RESULTS");
        assert_eq!(items.len(), 2);
        let none: Vec<serde_json::Value> = json_array_prefix_at(text, "MISSING");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_structured_output_still_succeeds() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("capture.pcap");
        std::fs::write(&capture, b"pcap").unwrap();
        let tshark = dir.path().join("tshark");
        std::fs::write(&tshark, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tshark, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::default();
        config.execution.output_limit_bytes = 4096;
        config.tools.paths.insert("tshark".into(), tshark);
        let runner = ScriptedRunner::new();
        let packets: Vec<serde_json::Value> = (0..60)
            .map(|i| {
                json!({"_index": "packets", "_source": {"layers": {
                    "frame": {"frame.number": i.to_string()},
                    "eth": {"eth.src": "00:11:22:33:44:55"},
                    "ip": {"ip.src": "10.0.0.1", "ip.dst": "10.0.0.2"},
                    "tcp": {"tcp.srcport": "443", "tcp.dstport": "51515"}
                }}})
            })
            .collect();
        let stdout = serde_json::to_string_pretty(&packets).unwrap();
        assert!(stdout.len() > 4096);
        runner.respond("tshark", &stdout, 0);
        let set = ToolSet::with_runner(&config, Arc::new(runner.clone()));

        let target = Target::parse(capture.to_str().unwrap()).unwrap();
        let input = ToolInput::new(capture.to_str().unwrap());
        let outcome = set
            .invoke(
                Invocation {
                    capability: Capability::Forensic,
                    tool: "tshark",
                    target: &target,
                    input: &input,
                    timeout: None,
                    upstream: &[],
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.truncated);
        let frames = outcome
            .findings
            .iter()
            .find_map(|f| match &f.kind {
                sdk::types::FindingKind::ProtocolStat { protocol, packets } if protocol == "frame" => {
                    Some(*packets)
                }
                _ => None,
            })
            .unwrap();
        assert!(frames > 0 && frames < 60, "recovered {} packets", frames);
    }

    #[test]
    fn test_option_value_check() {
        assert!(check_option_value("ports", "80,443").is_ok());
        assert!(check_option_value("ports", "--script=evil").is_err());
        assert!(check_option_value("ports", "80;id").is_err());
    }
}
