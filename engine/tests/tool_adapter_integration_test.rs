//! Integration tests for the tool adapter layer
//!
//! Binaries are stand-in shell scripts registered through `tools.paths`, and
//! the process runner is scripted, so nothing here needs a real scanner.

use sdk::errors::EngineError;
use sdk::types::{Capability, FindingKind, HealthStatus, ToolInput};
use serde_json::json;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use warden_engine::command_executor::{ProcessRunner, ScriptedRunner};
use warden_engine::config::Config;
use warden_engine::target::Target;
use warden_engine::tools::{Invocation, ToolSet};

fn fake_binary(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config_with(dir: &Path, tools: &[&str]) -> Config {
    let mut config = Config::default();
    for tool in tools {
        let path = fake_binary(dir, tool, "exit 0");
        config.tools.paths.insert(tool.to_string(), path);
    }
    config
}

fn scripted(config: &Config) -> (ToolSet, Arc<ScriptedRunner>) {
    let runner = Arc::new(ScriptedRunner::new());
    let tools = ToolSet::with_runner(config, Arc::clone(&runner) as Arc<dyn ProcessRunner>);
    (tools, runner)
}

async fn invoke(
    tools: &ToolSet,
    capability: Capability,
    tool: &str,
    target: &Target,
    input: &ToolInput,
) -> Result<warden_engine::tools::ToolOutcome, EngineError> {
    tools
        .invoke(
            Invocation {
                capability,
                tool,
                target,
                input,
                timeout: None,
                upstream: &[],
            },
            &CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn test_nmap_default_argv_and_parsing() {
    let dir = TempDir::new().unwrap();
    let config = config_with(dir.path(), &["nmap"]);
    let (tools, runner) = scripted(&config);
    runner.respond(
        "nmap",
        "# Nmap 7.94 scan initiated\nHost: 192.168.1.1 ()\tPorts: 22/open/tcp//ssh//OpenSSH 8.9/, 80/open/tcp//http///\n",
        0,
    );

    let target = Target::parse("192.168.1.1").unwrap();
    let input = ToolInput::new("192.168.1.1");
    let outcome = invoke(&tools, Capability::Network, "nmap", &target, &input)
        .await
        .unwrap();

    let program = config.tools.paths["nmap"].to_string_lossy().into_owned();
    let expected: Vec<String> = [
        program.as_str(),
        "-sT",
        "-sV",
        "--top-ports=1000",
        "-T4",
        "-oG",
        "-",
        "192.168.1.1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    assert_eq!(outcome.argv, expected);
    assert_eq!(runner.calls(), vec![expected]);

    assert_eq!(outcome.findings.len(), 2);
    let ports: Vec<u16> = outcome
        .findings
        .iter()
        .filter_map(|f| match &f.kind {
            FindingKind::OpenPort { port, .. } => Some(*port),
            _ => None,
        })
        .collect();
    assert_eq!(ports, vec![22, 80]);
}

#[tokio::test]
async fn test_out_of_range_option_rejected_before_spawn() {
    let dir = TempDir::new().unwrap();
    let config = config_with(dir.path(), &["strings"]);
    let (tools, runner) = scripted(&config);

    let sample = dir.path().join("sample.bin");
    fs::write(&sample, b"\x00\x01hello world\x00").unwrap();
    let target = Target::parse(sample.to_str().unwrap()).unwrap();
    let input = ToolInput::new(sample.to_str().unwrap()).with_param("min_length", json!(0));

    let err = invoke(&tools, Capability::Forensic, "strings", &target, &input)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTarget(_)));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_missing_binary_is_tool_not_found() {
    let mut config = Config::default();
    config
        .tools
        .paths
        .insert("nikto".to_string(), "/nonexistent/bin/nikto".into());
    let (tools, runner) = scripted(&config);

    let target = Target::parse("http://10.0.0.5/").unwrap();
    let input = ToolInput::new("http://10.0.0.5/");
    let err = invoke(&tools, Capability::Web, "nikto", &target, &input)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ToolNotFound { ref tool } if tool == "nikto"));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_metacharacter_target_never_spawns() {
    let dir = TempDir::new().unwrap();
    let config = config_with(dir.path(), &["nmap"]);
    let (tools, runner) = scripted(&config);

    assert!(Target::parse("10.0.0.1; rm -rf /").is_err());

    // A URL is the wrong kind of target for a port scan
    let target = Target::parse("http://10.0.0.1/").unwrap();
    let input = ToolInput::new("http://10.0.0.1/");
    let err = invoke(&tools, Capability::Network, "masscan", &target, &input)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTarget(_)));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_non_zero_exit_is_tool_execution_error() {
    let dir = TempDir::new().unwrap();
    let config = config_with(dir.path(), &["nmap"]);
    let (tools, runner) = scripted(&config);
    runner.respond("nmap", "", 2);

    let target = Target::parse("10.0.0.1").unwrap();
    let input = ToolInput::new("10.0.0.1");
    let err = invoke(&tools, Capability::Network, "nmap", &target, &input)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ToolExecution { .. }));
}

#[tokio::test]
async fn test_garbage_output_is_parse_error() {
    let dir = TempDir::new().unwrap();
    let config = config_with(dir.path(), &["nmap"]);
    let (tools, runner) = scripted(&config);
    runner.respond("nmap", "segmentation fault (core dumped)", 0);

    let target = Target::parse("10.0.0.1").unwrap();
    let input = ToolInput::new("10.0.0.1");
    let err = invoke(&tools, Capability::Network, "nmap", &target, &input)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ParseError { .. }));
}

#[tokio::test]
async fn test_wrong_capability_rejected() {
    let dir = TempDir::new().unwrap();
    let config = config_with(dir.path(), &["nmap"]);
    let (tools, runner) = scripted(&config);

    let target = Target::parse("10.0.0.1").unwrap();
    let input = ToolInput::new("10.0.0.1");
    let err = invoke(&tools, Capability::Web, "nmap", &target, &input)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Orchestration(_)));
    assert!(runner.calls().is_empty());
}

#[test]
fn test_health_check_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let config = config_with(dir.path(), &["strings", "binwalk"]);
    let mut config = config;
    for missing in ["tshark", "foremost", "volatility"] {
        config
            .tools
            .paths
            .insert(missing.to_string(), dir.path().join("absent").join(missing));
    }
    let (tools, runner) = scripted(&config);

    let first = tools.health_check(Capability::Forensic);
    let second = tools.health_check(Capability::Forensic);
    assert_eq!(first, second);
    assert_eq!(first.status, HealthStatus::Degraded);
    assert!(first.is_available("strings"));
    assert!(!first.is_available("tshark"));
    assert!(runner.calls().is_empty());

    // The in-process digest needs no binary
    assert!(tools.health_check(Capability::Report).is_available("digest"));
}

#[test]
fn test_non_executable_override_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nmap");
    fs::write(&path, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

    let mut config = Config::default();
    config.tools.paths.insert("nmap".to_string(), path);
    let (tools, _) = scripted(&config);
    assert!(!tools.is_available("nmap"));
    assert!(tools.resolve_binary("nmap").is_none());
}

#[test]
fn test_timeout_capped_at_ceiling() {
    let config = Config::default();
    let (tools, _) = scripted(&config);
    let ceiling = tools.ceiling("nmap").unwrap();
    assert_eq!(
        tools.timeout_for("nmap", Some(ceiling * 10)),
        Some(ceiling)
    );
    assert_eq!(
        tools.timeout_for("nmap", Some(Duration::from_secs(1))),
        Some(Duration::from_secs(1))
    );
    assert_eq!(tools.timeout_for("not-a-tool", None), None);
}

/// Real subprocess: a hung tool is killed at its timeout.
#[tokio::test]
async fn test_hung_tool_times_out() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.execution.kill_grace_secs = 1;
    let path = fake_binary(dir.path(), "nmap", "sleep 10");
    config.tools.paths.insert("nmap".to_string(), path);
    let tools = ToolSet::from_config(&config);

    let target = Target::parse("10.0.0.1").unwrap();
    let input = ToolInput::new("10.0.0.1");
    let started = std::time::Instant::now();
    let err = tools
        .invoke(
            Invocation {
                capability: Capability::Network,
                tool: "nmap",
                target: &target,
                input: &input,
                timeout: Some(Duration::from_secs(1)),
                upstream: &[],
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Timeout { timeout_secs: 1, .. }));
    assert!(started.elapsed() < Duration::from_secs(6));
}

/// Real subprocess: output is captured and parsed end to end.
#[tokio::test]
async fn test_real_process_output_parsed() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    let path = fake_binary(
        dir.path(),
        "nmap",
        "printf '# Nmap 7.94\\nHost: 10.0.0.1 ()\\tPorts: 443/open/tcp//https///\\n'",
    );
    config.tools.paths.insert("nmap".to_string(), path);
    let tools = ToolSet::from_config(&config);

    let target = Target::parse("10.0.0.1").unwrap();
    let input = ToolInput::new("10.0.0.1");
    let outcome = invoke(&tools, Capability::Network, "nmap", &target, &input)
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert!(matches!(
        outcome.findings[0].kind,
        FindingKind::OpenPort { port: 443, .. }
    ));
}
