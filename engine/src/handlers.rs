//! Command handlers for CLI operations
//!
//! - run: plan and execute an assessment, Ctrl-C cancels
//! - plan: print the materialised plan
//! - health: tool availability per capability
//! - tools: registered adapters with their ceilings
//! - config: show the effective configuration or its path

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cli::RequestArgs;
use crate::conductor::{ExecutionPlan, Orchestrator, PlanReport, PlanRequest, StepStatus};
use crate::config::Config;
use crate::message_bus::{Event, EventType};
use crate::tools::ToolSet;
use sdk::errors::WardenErrorExt;
use sdk::types::{Capability, HealthReport};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Parse `key=value` step options. Values that parse as JSON (numbers,
/// booleans, arrays) keep their type; anything else is a string.
pub fn parse_options(raw: &[String]) -> Result<Vec<(String, serde_json::Value)>> {
    raw.iter()
        .map(|item| {
            let (key, value) = item
                .split_once('=')
                .with_context(|| format!("Option '{}' is not in key=value form", item))?;
            let key = key.trim();
            if key.is_empty() {
                bail!("Option '{}' has an empty key", item);
            }
            let value = serde_json::from_str(value.trim())
                .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}

/// Build a plan request from CLI arguments.
pub fn build_request(args: &RequestArgs) -> Result<PlanRequest> {
    let mut request = PlanRequest::new(&args.request, &args.target)
        .with_capabilities(args.capabilities.clone());
    if let Some(priority) = args.priority {
        request = request.with_priority(priority);
    }
    if let Some(strategy) = args.strategy {
        request = request.with_strategy(strategy);
    }
    if let Some(secs) = args.timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }
    for (key, value) in parse_options(&args.options)? {
        request = request.with_option(key, value);
    }
    Ok(request)
}

/// One stderr progress line per plan event.
pub fn progress_line(event: &Event) -> Option<String> {
    match event {
        Event::PlanStarted { plan_id, steps } => {
            Some(format!("[{}] started, {} steps", plan_id, steps))
        }
        Event::StepStarted {
            step_id,
            capability,
            tool,
            confidence,
            ..
        } => Some(format!(
            "  {} {} -> {} (confidence {:.2})",
            step_id, capability, tool, confidence
        )),
        Event::StepFinished {
            step_id,
            status,
            findings,
            duration_ms,
            ..
        } => Some(format!(
            "  {} {} with {} findings in {} ms",
            step_id, status, findings, duration_ms
        )),
        Event::StepSkipped { step_id, reason, .. } => {
            Some(format!("  {} skipped: {}", step_id, reason))
        }
        Event::PlanFinished { .. } => None,
    }
}

/// Plan and execute a request
///
/// Ctrl-C cancels the plan. In-flight tools are terminated and the partial
/// report is still printed. Text output streams progress to stderr.
pub async fn handle_run(
    args: RequestArgs,
    concurrency: Option<usize>,
    mut config: Config,
    format: OutputFormat,
) -> Result<()> {
    if let Some(n) = concurrency {
        if n == 0 {
            bail!("--concurrency must be at least 1");
        }
        config.execution.max_concurrency = n;
    }

    let request = build_request(&args)?;
    let orchestrator = Orchestrator::new(config).context("Failed to initialise orchestrator")?;
    let plan = match orchestrator.plan(&request) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("Hint: {}", e.user_hint());
            return Err(e).context("Planning failed");
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling plan");
            on_signal.cancel();
        }
    });

    let progress = match format {
        OutputFormat::Text => {
            let mut events = orchestrator.bus().subscribe(EventType::All).await;
            let plan_id = plan.id.clone();
            Some(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if event.plan_id() != plan_id {
                        continue;
                    }
                    if let Some(line) = progress_line(&event) {
                        eprintln!("{}", line);
                    }
                    if matches!(event, Event::PlanFinished { .. }) {
                        break;
                    }
                }
            }))
        }
        OutputFormat::Json => None,
    };

    let report = orchestrator.execute(plan, cancel).await;
    signal_task.abort();
    if let Some(task) = progress {
        // PlanFinished is published before execute returns; a full channel
        // may have dropped it
        if tokio::time::timeout(Duration::from_millis(500), task).await.is_err() {
            tracing::debug!("Progress output did not drain");
        }
    }

    print_report(&report, format)?;
    if !report.success {
        bail!("Plan {} finished {}", report.plan_id, report.state);
    }
    Ok(())
}

/// Print the plan a request would produce
pub async fn handle_plan(args: RequestArgs, config: Config, format: OutputFormat) -> Result<()> {
    let request = build_request(&args)?;
    let orchestrator = Orchestrator::new(config).context("Failed to initialise orchestrator")?;
    let plan = orchestrator.plan(&request).context("Planning failed")?;
    print_plan(&plan, format)
}

/// Print tool availability
pub async fn handle_health(
    capability: Option<Capability>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let tools = ToolSet::from_config(config);
    let capabilities: Vec<Capability> = match capability {
        Some(c) => vec![c],
        None => Capability::ALL.to_vec(),
    };
    let reports: Vec<HealthReport> = capabilities
        .into_iter()
        .map(|c| tools.health_check(c))
        .collect();

    match format {
        OutputFormat::Text => {
            for report in &reports {
                println!("{}: {:?}", report.capability, report.status);
                for (tool, available) in &report.tools {
                    let mark = if *available { "available" } else { "missing" };
                    println!("  {:<14} {}", tool, mark);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
    }
    Ok(())
}

/// List registered adapters
pub async fn handle_tools(config: &Config, format: OutputFormat) -> Result<()> {
    let tools = ToolSet::from_config(config);
    let base = config.execution.base_timeout();

    match format {
        OutputFormat::Text => {
            println!("Registered tools:");
            println!();
            for spec in tools.specs() {
                println!(
                    "  {:<14} {:<14} {:>5}s  {}",
                    spec.name,
                    spec.capability.as_str(),
                    spec.ceiling(base).as_secs(),
                    if tools.is_available(spec.name) {
                        "available"
                    } else {
                        "missing"
                    }
                );
            }
        }
        OutputFormat::Json => {
            let listing: Vec<_> = tools
                .specs()
                .map(|spec| {
                    json!({
                        "name": spec.name,
                        "capability": spec.capability,
                        "binary": spec.binary,
                        "ceiling_secs": spec.ceiling(base).as_secs(),
                        "available": tools.is_available(spec.name),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json!({ "tools": listing }))?);
        }
    }
    Ok(())
}

/// Show the effective configuration
pub async fn handle_config_show(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let text = toml::to_string_pretty(config).context("Failed to serialize config")?;
            println!("{}", text);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
    }
    Ok(())
}

/// Print where the configuration lives
pub async fn handle_config_path(custom: Option<&Path>, format: OutputFormat) -> Result<()> {
    let path = match custom {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };
    match format {
        OutputFormat::Text => println!("{}", path.display()),
        OutputFormat::Json => println!("{}", json!({ "path": path })),
    }
    Ok(())
}

fn print_plan(plan: &ExecutionPlan, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("Plan {} ({:?} priority)", plan.id, plan.priority);
            println!("Target: {}", plan.target);
            println!();
            for step in &plan.steps {
                let tools = if step.tool_hints.is_empty() {
                    "any".to_string()
                } else {
                    step.tool_hints.join(", ")
                };
                println!(
                    "  {} [{}] {} -> {} (tools: {})",
                    step.id, step.capability, step.name, step.target, tools
                );
                for dep in &step.depends_on {
                    println!("      after {} ({:?})", dep.step, dep.condition);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(plan)?);
        }
    }
    Ok(())
}

fn print_report(report: &PlanReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("Plan {}: {}", report.plan_id, report.state);
            println!();
            for step in &report.steps {
                let detail = match step.status {
                    StepStatus::Succeeded => format!(
                        "{} finding(s) via {}",
                        step.findings,
                        step.tool.as_deref().unwrap_or("-")
                    ),
                    StepStatus::Failed => step.error.clone().unwrap_or_default(),
                    StepStatus::Skipped => step.skip_reason.clone().unwrap_or_default(),
                    _ => String::new(),
                };
                println!(
                    "  {:<8} {:<10} {:<28} {}",
                    step.id,
                    step.status.to_string(),
                    step.name,
                    detail
                );
            }
            println!();
            println!(
                "{} finding(s) in {:.1}s",
                report.findings.len(),
                report.duration_ms as f64 / 1000.0
            );
            for finding in &report.findings {
                println!("  [{}] {}", finding.severity, finding.title());
            }
        }
        OutputFormat::Json => {
            println!("{}", report.to_json()?);
        }
    }
    Ok(())
}
