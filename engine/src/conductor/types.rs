//! Plan and step types shared by the planner and the dispatcher

use crate::config::StrategyKind;
use crate::risk_assessor::RiskAssessment;
use crate::target::Target;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::types::{Capability, Finding, Priority, ToolInput};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

/// Ports treated as HTTP-capable regardless of the reported service
pub const HTTP_PORTS: &[u16] = &[80, 443, 8000, 8080, 8443, 8888];

/// Ports served over TLS when the service name does not say otherwise
const TLS_PORTS: &[u16] = &[443, 8443];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Statuses only move forward.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Pending, StepStatus::Skipped)
                | (StepStatus::Running, StepStatus::Succeeded)
                | (StepStatus::Running, StepStatus::Failed)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// What a dependency must have produced before the dependent step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// The dependency succeeded
    Succeeded,
    /// The dependency succeeded and found an HTTP-capable open port; the
    /// dependent step targets the URL of that port
    HttpPortOpen,
    /// The dependency succeeded and reported at least one service version
    ServiceVersionFound,
    /// The dependency reached any terminal status
    Finished,
}

impl Condition {
    /// Why the condition failed on a dependency that did succeed.
    pub fn unmet_reason(&self) -> &'static str {
        match self {
            Condition::HttpPortOpen => "no HTTP-capable port",
            Condition::ServiceVersionFound => "no service version found",
            Condition::Succeeded | Condition::Finished => "condition not met",
        }
    }

    /// Whether a succeeded dependency's findings satisfy the condition.
    pub fn satisfied_by(&self, findings: &[Finding]) -> bool {
        match self {
            Condition::Succeeded | Condition::Finished => true,
            Condition::HttpPortOpen => http_port(findings).is_some(),
            Condition::ServiceVersionFound => findings.iter().any(has_version),
        }
    }
}

fn has_version(finding: &Finding) -> bool {
    match &finding.kind {
        sdk::types::FindingKind::OpenPort { version, .. }
        | sdk::types::FindingKind::Technology { version, .. } => {
            version.as_deref().is_some_and(|v| !v.trim().is_empty())
        }
        _ => false,
    }
}

/// First HTTP-capable open port: `(host, port, tls)`.
pub fn http_port(findings: &[Finding]) -> Option<(String, u16, bool)> {
    findings.iter().find_map(|finding| {
        let sdk::types::FindingKind::OpenPort {
            host,
            port,
            service,
            ..
        } = &finding.kind
        else {
            return None;
        };
        let service = service.as_deref().unwrap_or("").to_ascii_lowercase();
        let http_service = service.contains("http");
        if !http_service && !HTTP_PORTS.contains(port) {
            return None;
        }
        let tls = service.contains("https")
            || service.contains("ssl")
            || (!http_service && TLS_PORTS.contains(port));
        Some((host.clone(), *port, tls))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub step: String,
    pub condition: Condition,
}

impl Dependency {
    pub fn on(step: impl Into<String>, condition: Condition) -> Self {
        Self {
            step: step.into(),
            condition,
        }
    }
}

/// Why a step never ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// A dependency succeeded but did not produce what this step needs
    ConditionNotMet(String),
    /// A dependency failed or was skipped
    DependencyFailed(String),
    /// None of the step's tools is installed
    ToolUnavailable(Vec<String>),
    Cancelled,
}

impl SkipReason {
    /// Skips that are part of a normal, successful plan
    pub fn is_benign(&self) -> bool {
        matches!(self, SkipReason::ConditionNotMet(_))
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ConditionNotMet(reason) => f.write_str(reason),
            SkipReason::DependencyFailed(step) => {
                write!(f, "dependency {} did not succeed", step)
            }
            SkipReason::ToolUnavailable(tools) => {
                write!(f, "no tool available ({} not installed)", tools.join(", "))
            }
            SkipReason::Cancelled => f.write_str("plan cancelled"),
        }
    }
}

/// What happened when a step ran, or why it did not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub tool: Option<String>,
    pub strategy: Option<StrategyKind>,
    pub confidence: Option<f64>,
    /// Target actually used, when derived from an upstream finding
    pub resolved_target: Option<Target>,
    pub risk: Option<RiskAssessment>,
    pub argv: Vec<String>,
    pub findings: Vec<Finding>,
    pub truncated: bool,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub skip_reason: Option<SkipReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub capability: Capability,
    pub target: Target,
    /// Tools the decision engine may choose from; empty means every tool of
    /// the capability
    pub tool_hints: Vec<String>,
    pub options: ToolInput,
    pub timeout: Option<Duration>,
    pub depends_on: Vec<Dependency>,
    pub status: StepStatus,
    pub result: Option<StepResult>,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        capability: Capability,
        target: Target,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capability,
            target,
            tool_hints: Vec::new(),
            options: ToolInput::default(),
            timeout: None,
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            result: None,
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tool_hints = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn after(mut self, step: &str, condition: Condition) -> Self {
        self.depends_on.push(Dependency::on(step, condition));
        self
    }

    /// Move to `next`, refusing any backward or sideways move.
    pub fn transition(&mut self, next: StepStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Orchestration(format!(
                "step {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn findings(&self) -> &[Finding] {
        self.result.as_ref().map_or(&[], |r| r.findings.as_slice())
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        self.result.as_ref()?.skip_reason.as_ref()
    }
}

/// An ordered set of steps plus their dependency edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub request: String,
    pub target: Target,
    pub priority: Priority,
    /// Strategy forced for every step, else the configured one per capability
    pub strategy: Option<StrategyKind>,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// Build a plan, rejecting duplicate ids, dangling dependencies, and cycles.
    pub fn new(
        request: impl Into<String>,
        target: Target,
        priority: Priority,
        steps: Vec<Step>,
    ) -> Result<Self, EngineError> {
        let plan = Self {
            id: uuid::Uuid::new_v4().to_string(),
            request: request.into(),
            target,
            priority,
            strategy: None,
            steps,
            created_at: Utc::now(),
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn with_strategy(mut self, strategy: Option<StrategyKind>) -> Self {
        self.strategy = strategy;
        self
    }

    fn validate(&self) -> Result<(), EngineError> {
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(EngineError::Orchestration(format!(
                    "duplicate step id {}",
                    step.id
                )));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.step.as_str()) {
                    return Err(EngineError::Orchestration(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep.step
                    )));
                }
            }
        }
        if self.topological_order().len() != self.steps.len() {
            return Err(EngineError::Orchestration(
                "plan has a dependency cycle".to_string(),
            ));
        }
        Ok(())
    }

    /// Kahn's algorithm over step ids; shorter than the plan when there is a cycle.
    pub fn topological_order(&self) -> Vec<String> {
        let mut indegree: HashMap<&str, usize> =
            self.steps.iter().map(|s| (s.id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                *indegree.entry(step.id.as_str()).or_default() += 1;
                dependents
                    .entry(dep.step.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = self
            .steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| indegree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for next in dependents.get(id).into_iter().flatten() {
                if let Some(n) = indegree.get_mut(next) {
                    *n -= 1;
                    if *n == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }
        order
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Steps that list `id` as a dependency.
    pub fn dependents(&self, id: &str) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d.step == id))
            .collect()
    }

    /// All findings in step order.
    pub fn findings(&self) -> Vec<Finding> {
        self.steps
            .iter()
            .flat_map(|s| s.findings().iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Created,
    Running,
    Completed,
    PartiallyFailed,
    Aborted,
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanState::Created => "created",
            PlanState::Running => "running",
            PlanState::Completed => "completed",
            PlanState::PartiallyFailed => "partially_failed",
            PlanState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Per-step line of a plan report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub id: String,
    pub name: String,
    pub capability: Capability,
    pub target: String,
    pub status: StepStatus,
    pub tool: Option<String>,
    pub strategy: Option<StrategyKind>,
    pub confidence: Option<f64>,
    pub risk: Option<RiskAssessment>,
    pub findings: usize,
    pub duration_ms: u64,
    pub truncated: bool,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
}

impl StepReport {
    pub fn from_step(step: &Step) -> Self {
        let result = step.result.clone().unwrap_or_default();
        let target = result
            .resolved_target
            .as_ref()
            .unwrap_or(&step.target)
            .to_string();
        Self {
            id: step.id.clone(),
            name: step.name.clone(),
            capability: step.capability,
            target,
            status: step.status,
            tool: result.tool,
            strategy: result.strategy,
            confidence: result.confidence,
            risk: result.risk,
            findings: result.findings.len(),
            duration_ms: result.duration.as_millis() as u64,
            truncated: result.truncated,
            error: result.error,
            skip_reason: result.skip_reason.map(|r| r.to_string()),
        }
    }
}

/// Caller-facing result of one plan run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan_id: String,
    pub request: String,
    pub state: PlanState,
    pub success: bool,
    pub steps: Vec<StepReport>,
    pub findings: Vec<Finding>,
    pub duration_ms: u64,
}

impl PlanReport {
    pub fn new(plan: &ExecutionPlan, state: PlanState, duration: Duration) -> Self {
        Self {
            plan_id: plan.id.clone(),
            request: plan.request.clone(),
            state,
            success: state == PlanState::Completed,
            steps: plan.steps.iter().map(StepReport::from_step).collect(),
            findings: plan.findings(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Orchestration(format!("report serialization failed: {}", e)))
    }
}
