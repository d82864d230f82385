//! Task planner
//!
//! Turns a request into a fully materialised [`ExecutionPlan`]. The request
//! text is classified by keyword into one of a few assessment templates; an
//! explicit capability list bypasses the keywords. Steps are laid out in
//! capability order (network, web, vulnerability, forensic, social, report)
//! and later steps carry conditions on earlier ones. Planning never runs
//! anything.

use super::types::{Condition, ExecutionPlan, Step};
use crate::config::StrategyKind;
use crate::target::Target;
use crate::tools::ToolSet;
use sdk::errors::EngineError;
use sdk::types::{Capability, Priority, ToolInput};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const PCAP_EXTENSIONS: &[&str] = &["pcap", "pcapng", "cap"];
const MEMORY_EXTENSIONS: &[&str] = &["raw", "mem", "vmem", "dmp", "lime"];

/// A caller's request before planning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub request: String,
    pub target: String,
    /// Overrides keyword classification when non-empty
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    pub priority: Option<Priority>,
    pub strategy: Option<StrategyKind>,
    /// Step options; `tool.key` scopes a key to one tool
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    /// Per-step timeout, capped at each tool's ceiling
    pub timeout: Option<Duration>,
}

impl PlanRequest {
    pub fn new(request: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Assessment templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    FullAssessment,
    NetworkScan,
    WebAssessment,
    Forensic,
    Osint,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::FullAssessment => "full assessment",
            TaskKind::NetworkScan => "network scan",
            TaskKind::WebAssessment => "web assessment",
            TaskKind::Forensic => "forensic analysis",
            TaskKind::Osint => "osint",
        }
    }

    pub fn default_priority(&self) -> Priority {
        match self {
            TaskKind::FullAssessment => Priority::High,
            _ => Priority::Medium,
        }
    }

    /// Keyword classification, first match wins.
    pub fn classify(request: &str) -> Option<TaskKind> {
        let lower = request.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        if has(&["pentest", "penetration test"]) {
            Some(TaskKind::FullAssessment)
        } else if has(&["scan", "recon"]) {
            Some(TaskKind::NetworkScan)
        } else if has(&["web"]) {
            Some(TaskKind::WebAssessment)
        } else if has(&["forensic", "memory", "pcap", "strings", "carve"]) {
            Some(TaskKind::Forensic)
        } else if has(&["osint", "harvest", "social"]) {
            Some(TaskKind::Osint)
        } else {
            None
        }
    }

    /// Template implied by the target alone.
    pub fn for_target(target: &Target) -> TaskKind {
        match target {
            Target::File(_) => TaskKind::Forensic,
            Target::Url(_) => TaskKind::WebAssessment,
            Target::Domain(_) => TaskKind::Osint,
            Target::Host(_) => TaskKind::NetworkScan,
        }
    }

    fn fits(&self, target: &Target) -> bool {
        match self {
            TaskKind::Forensic => matches!(target, Target::File(_)),
            TaskKind::Osint => target.to_domain().is_some(),
            _ => !matches!(target, Target::File(_)),
        }
    }
}

/// Sequentially numbered steps under construction.
struct Draft<'a> {
    tools: &'a ToolSet,
    options: ToolInput,
    timeout: Option<Duration>,
    steps: Vec<Step>,
}

impl Draft<'_> {
    fn add(
        &mut self,
        name: &str,
        capability: Capability,
        target: &Target,
        hints: &[&str],
        deps: &[(&str, Condition)],
    ) -> Result<String, EngineError> {
        let registered = self.tools.tools_for(capability);
        let tools: Vec<&str> = if hints.is_empty() {
            registered
        } else {
            hints
                .iter()
                .copied()
                .filter(|h| registered.contains(h))
                .collect()
        };
        if tools.is_empty() {
            return Err(EngineError::NoEligibleTool(capability));
        }

        let id = format!("step_{}", self.steps.len() + 1);
        let mut step = Step::new(&id, name, capability, target.clone()).with_tools(&tools);
        for (dep, condition) in deps {
            step = step.after(dep, *condition);
        }
        step.options = ToolInput {
            target: target.as_arg(),
            params: self.options.params.clone(),
        };
        step.timeout = self.timeout;
        self.steps.push(step);
        Ok(id)
    }

    /// Report over everything before it, whatever the outcomes.
    fn add_report(&mut self, target: &Target) -> Result<String, EngineError> {
        let ids: Vec<String> = self.steps.iter().map(|s| s.id.clone()).collect();
        let deps: Vec<(&str, Condition)> = ids
            .iter()
            .map(|id| (id.as_str(), Condition::Finished))
            .collect();
        self.add("Report", Capability::Report, target, &[], &deps)
    }
}

/// Host target for network steps.
fn network_target(target: &Target) -> Result<Target, EngineError> {
    match target {
        Target::Host(_) => Ok(target.clone()),
        Target::Url(_) | Target::Domain(_) => {
            let host = target
                .host()
                .ok_or_else(|| EngineError::InvalidTarget(format!("no host in {}", target)))?;
            Target::parse(&host)
        }
        Target::File(_) => Err(EngineError::InvalidTarget(
            "network steps need a host, not a file".to_string(),
        )),
    }
}

fn has_extension(target: &Target, extensions: &[&str]) -> bool {
    let Target::File(path) = target else {
        return false;
    };
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.contains(&e.to_ascii_lowercase().as_str()))
}

pub struct Planner {
    tools: Arc<ToolSet>,
}

impl Planner {
    pub fn new(tools: Arc<ToolSet>) -> Self {
        Self { tools }
    }

    pub fn plan(&self, request: &PlanRequest) -> Result<ExecutionPlan, EngineError> {
        let target = Target::parse(&request.target)?;
        let mut draft = Draft {
            tools: &self.tools,
            options: ToolInput {
                target: target.as_arg(),
                params: request.options.clone(),
            },
            timeout: request.timeout,
            steps: Vec::new(),
        };

        let priority = if request.capabilities.is_empty() {
            let kind = TaskKind::classify(&request.request)
                .filter(|k| k.fits(&target))
                .unwrap_or_else(|| TaskKind::for_target(&target));
            info!(kind = kind.as_str(), target = %target, "Request classified");
            self.template(kind, &target, request, &mut draft)?;
            request.priority.unwrap_or(kind.default_priority())
        } else {
            self.custom(&request.capabilities, &target, &mut draft)?;
            request.priority.unwrap_or(Priority::Medium)
        };

        if draft.steps.iter().all(|s| s.capability == Capability::Report) {
            return Err(EngineError::Orchestration(
                "request produced no assessment steps".to_string(),
            ));
        }

        let plan = ExecutionPlan::new(&request.request, target, priority, draft.steps)?
            .with_strategy(request.strategy);
        debug!(plan_id = %plan.id, steps = plan.steps.len(), "Plan materialised");
        Ok(plan)
    }

    fn template(
        &self,
        kind: TaskKind,
        target: &Target,
        request: &PlanRequest,
        draft: &mut Draft<'_>,
    ) -> Result<(), EngineError> {
        match kind {
            TaskKind::FullAssessment => {
                let host = network_target(target)?;
                let network = draft.add("Network reconnaissance", Capability::Network, &host, &["nmap"], &[])?;

                // A URL target is probed directly; otherwise web steps wait
                // for a discovered HTTP port and target its URL.
                let (web_target, gate) = match target {
                    Target::Url(_) => (target.clone(), Condition::Finished),
                    _ => (host.clone(), Condition::HttpPortOpen),
                };
                let recon = draft.add(
                    "Web reconnaissance",
                    Capability::Web,
                    &web_target,
                    &["gobuster", "whatweb"],
                    &[(&network, gate)],
                )?;
                draft.add(
                    "Web vulnerability scan",
                    Capability::Web,
                    &web_target,
                    &["nikto"],
                    &[(&network, gate)],
                )?;
                draft.add(
                    "SQL injection testing",
                    Capability::Vulnerability,
                    &web_target,
                    &["sqlmap"],
                    &[(&network, gate), (&recon, Condition::Succeeded)],
                )?;
                draft.add(
                    "Exploit lookup",
                    Capability::Vulnerability,
                    &host,
                    &["searchsploit"],
                    &[(&network, Condition::ServiceVersionFound)],
                )?;
            }
            TaskKind::NetworkScan => {
                let host = network_target(target)?;
                if host.is_cidr() {
                    draft.add("Host discovery", Capability::Network, &host, &["discovery"], &[])?;
                } else {
                    draft.add("Port scan", Capability::Network, &host, &["nmap", "masscan"], &[])?;
                }
            }
            TaskKind::WebAssessment => {
                let url = match target {
                    Target::Url(_) => target.clone(),
                    other => {
                        let host = network_target(other)?.as_arg();
                        Target::http_url(&host, 80, false)?
                    }
                };
                let recon = draft.add(
                    "Web reconnaissance",
                    Capability::Web,
                    &url,
                    &["gobuster", "whatweb"],
                    &[],
                )?;
                draft.add(
                    "Web vulnerability scan",
                    Capability::Web,
                    &url,
                    &["nikto"],
                    &[(&recon, Condition::Succeeded)],
                )?;
            }
            TaskKind::Forensic => {
                draft.add("String extraction", Capability::Forensic, target, &["strings"], &[])?;
                draft.add("Firmware analysis", Capability::Forensic, target, &["binwalk"], &[])?;
                if has_extension(target, PCAP_EXTENSIONS) {
                    draft.add("Packet capture analysis", Capability::Forensic, target, &["tshark"], &[])?;
                }
                if has_extension(target, MEMORY_EXTENSIONS) {
                    draft.add("Memory analysis", Capability::Forensic, target, &["volatility"], &[])?;
                }
                let lower = request.request.to_lowercase();
                let carve = request
                    .options
                    .get("carve")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if carve || lower.contains("carve") || lower.contains("foremost") {
                    draft.add("File carving", Capability::Forensic, target, &["foremost"], &[])?;
                }
            }
            TaskKind::Osint => {
                let domain = target.to_domain().ok_or_else(|| {
                    EngineError::InvalidTarget(format!("{} has no domain name for OSINT", target))
                })?;
                draft.add("OSINT harvesting", Capability::Social, &domain, &["theharvester"], &[])?;
            }
        }
        draft.add_report(target)?;
        Ok(())
    }

    /// One step per requested capability, every registered tool eligible.
    fn custom(
        &self,
        capabilities: &[Capability],
        target: &Target,
        draft: &mut Draft<'_>,
    ) -> Result<(), EngineError> {
        let wants = |c: Capability| capabilities.contains(&c);
        let mut network = None;
        let mut web = None;
        let mut web_target = target.clone();
        let mut web_gate = None;

        if wants(Capability::Network) {
            let host = network_target(target)?;
            network = Some(draft.add("Network scan", Capability::Network, &host, &[], &[])?);
        }

        if wants(Capability::Web) || wants(Capability::Vulnerability) {
            match (target, &network) {
                (Target::Url(_), _) => {}
                (_, Some(id)) => {
                    web_target = network_target(target)?;
                    web_gate = Some((id.clone(), Condition::HttpPortOpen));
                }
                (other, None) => {
                    let host = network_target(other)?.as_arg();
                    web_target = Target::http_url(&host, 80, false)?;
                }
            }
        }

        if wants(Capability::Web) {
            let deps: Vec<(&str, Condition)> = web_gate
                .iter()
                .map(|(id, c)| (id.as_str(), *c))
                .collect();
            web = Some(draft.add("Web assessment", Capability::Web, &web_target, &[], &deps)?);
        }

        if wants(Capability::Vulnerability) {
            let mut deps: Vec<(&str, Condition)> = web_gate
                .iter()
                .map(|(id, c)| (id.as_str(), *c))
                .collect();
            if let Some(id) = &web {
                deps.push((id.as_str(), Condition::Succeeded));
            }
            draft.add(
                "Vulnerability assessment",
                Capability::Vulnerability,
                &web_target,
                &[],
                &deps,
            )?;
        }

        if wants(Capability::Forensic) {
            target.check_for(Capability::Forensic)?;
            draft.add("Forensic analysis", Capability::Forensic, target, &[], &[])?;
        }

        if wants(Capability::Social) {
            let domain = target.to_domain().ok_or_else(|| {
                EngineError::InvalidTarget(format!("{} has no domain name for OSINT", target))
            })?;
            draft.add("OSINT harvesting", Capability::Social, &domain, &[], &[])?;
        }

        draft.add_report(target)?;
        Ok(())
    }
}
