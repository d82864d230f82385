//! Conductor
//!
//! Plans requests and runs the resulting plans. The [`Orchestrator`] owns the
//! shared state every plan uses: the tool set, the agent registry, the
//! decision engine, and the message bus. Plans themselves are owned by the
//! run that executes them.

pub mod dispatcher;
pub mod feedback;
pub mod planner;
pub mod types;

pub use dispatcher::Dispatcher;
pub use feedback::LearningLoop;
pub use planner::{PlanRequest, Planner, TaskKind};
pub use types::{
    Condition, ExecutionPlan, PlanReport, PlanState, SkipReason, Step, StepReport, StepResult,
    StepStatus,
};

use crate::command_executor::ProcessRunner;
use crate::config::Config;
use crate::decision::DecisionEngine;
use crate::message_bus::MessageBus;
use crate::registry::AgentRegistry;
use crate::tools::ToolSet;
use sdk::errors::EngineError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

type ActivePlans = Mutex<HashMap<String, CancellationToken>>;

/// Keeps a plan listed as active until the run finishes or is dropped.
struct ActiveGuard<'a> {
    active: &'a ActivePlans,
    plan_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.plan_id);
    }
}

pub struct Orchestrator {
    config: Config,
    tools: Arc<ToolSet>,
    registry: Arc<AgentRegistry>,
    engine: Arc<DecisionEngine>,
    bus: MessageBus,
    active: ActivePlans,
}

impl Orchestrator {
    /// Orchestrator running real tool binaries.
    pub fn new(config: Config) -> Result<Self, EngineError> {
        let tools = ToolSet::from_config(&config);
        Self::assemble(config, tools)
    }

    /// Orchestrator whose tools run through a caller-supplied runner.
    pub fn with_runner(config: Config, runner: Arc<dyn ProcessRunner>) -> Result<Self, EngineError> {
        let tools = ToolSet::with_runner(&config, runner);
        Self::assemble(config, tools)
    }

    fn assemble(config: Config, tools: ToolSet) -> Result<Self, EngineError> {
        let engine = DecisionEngine::new(&config)?;
        Ok(Self {
            registry: Arc::new(AgentRegistry::new(&config.registry)),
            engine: Arc::new(engine),
            tools: Arc::new(tools),
            bus: MessageBus::new(),
            active: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tools(&self) -> &Arc<ToolSet> {
        &self.tools
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Materialise a plan without running it.
    pub fn plan(&self, request: &PlanRequest) -> Result<ExecutionPlan, EngineError> {
        Planner::new(Arc::clone(&self.tools)).plan(request)
    }

    /// Plan and run a request to completion.
    pub async fn submit(&self, request: &PlanRequest) -> Result<PlanReport, EngineError> {
        self.submit_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Plan and run a request; firing `cancel` aborts the plan.
    ///
    /// Only planning errors are returned as `Err`. Step failures are part of
    /// the report.
    pub async fn submit_with_cancel(
        &self,
        request: &PlanRequest,
        cancel: CancellationToken,
    ) -> Result<PlanReport, EngineError> {
        let plan = self.plan(request)?;
        Ok(self.execute(plan, cancel).await)
    }

    /// Run an already materialised plan.
    pub async fn execute(&self, mut plan: ExecutionPlan, cancel: CancellationToken) -> PlanReport {
        self.active().insert(plan.id.clone(), cancel.clone());
        let _guard = ActiveGuard {
            active: &self.active,
            plan_id: plan.id.clone(),
        };

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.tools),
            Arc::clone(&self.registry),
            Arc::clone(&self.engine),
            self.bus.clone(),
            self.config.execution.max_concurrency,
        );
        dispatcher.run(&mut plan, &cancel).await
    }

    /// Cancel a running plan. False when no such plan is running.
    pub fn cancel(&self, plan_id: &str) -> bool {
        match self.active().get(plan_id) {
            Some(token) => {
                info!(plan_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_plans(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_executor::ScriptedRunner;

    #[test]
    fn test_cancel_unknown_plan() {
        let orchestrator =
            Orchestrator::with_runner(Config::default(), Arc::new(ScriptedRunner::new())).unwrap();
        assert!(!orchestrator.cancel("no-such-plan"));
        assert!(orchestrator.active_plans().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_run_leaves_no_active_plan() {
        use crate::target::Target;
        use sdk::types::{Capability, Priority};
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let nmap = dir.path().join("nmap");
        std::fs::write(&nmap, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&nmap, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut config = Config::default();
        config.tools.paths.insert("nmap".to_string(), nmap);

        let runner = Arc::new(ScriptedRunner::new());
        runner.delay("nmap", Duration::from_secs(30));
        let orchestrator =
            Orchestrator::with_runner(config, Arc::clone(&runner) as Arc<dyn ProcessRunner>)
                .unwrap();

        let target = Target::parse("10.0.0.1").unwrap();
        let step = Step::new("step_1", "scan", Capability::Network, target.clone())
            .with_tools(&["nmap"]);
        let plan = ExecutionPlan::new("scan", target, Priority::Low, vec![step]).unwrap();
        let plan_id = plan.id.clone();

        let mut run = Box::pin(orchestrator.execute(plan, CancellationToken::new()));
        let listed = tokio::select! {
            _ = &mut run => panic!("plan should still be running"),
            _ = tokio::time::sleep(Duration::from_millis(100)) => orchestrator.active_plans(),
        };
        assert_eq!(listed, vec![plan_id]);

        drop(run);
        assert!(orchestrator.active_plans().is_empty());
    }

    #[test]
    fn test_plan_does_not_execute() {
        let runner = Arc::new(ScriptedRunner::new());
        let orchestrator =
            Orchestrator::with_runner(Config::default(), Arc::clone(&runner) as Arc<dyn ProcessRunner>)
                .unwrap();
        let plan = orchestrator
            .plan(&PlanRequest::new("pentest", "10.0.0.1"))
            .unwrap();
        assert!(plan.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(runner.calls().is_empty());
    }
}
