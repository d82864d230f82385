//! Agent registry
//!
//! One record per capability holding the current load, a bounded rolling
//! window of performance metrics, and an expertise score. Each record sits
//! behind its own lock; strategies only ever see [`AgentSnapshot`] copies, so
//! no lock is held while a decision is made or a tool runs.

use crate::config::RegistryConfig;
use chrono::{DateTime, Utc};
use sdk::types::Capability;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Starting expertise for a capability with no history
pub const INITIAL_EXPERTISE: f64 = 0.5;

/// Outcome of one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub capability: Capability,
    pub tool: String,
    pub success: bool,
    pub timed_out: bool,
    pub duration: Duration,
    pub findings: usize,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceMetric {
    pub fn new(
        capability: Capability,
        tool: impl Into<String>,
        success: bool,
        duration: Duration,
        findings: usize,
    ) -> Self {
        Self {
            capability,
            tool: tool.into(),
            success,
            timed_out: false,
            duration,
            findings,
            timestamp: Utc::now(),
        }
    }

    pub fn timed_out(mut self) -> Self {
        self.timed_out = true;
        self.success = false;
        self
    }
}

/// Aggregates over the window for one tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub uses: usize,
    pub successes: usize,
    pub total_duration: Duration,
}

impl ToolStats {
    /// Success rate, or `prior` when the tool has no history.
    pub fn success_rate_or(&self, prior: f64) -> f64 {
        if self.uses == 0 {
            prior
        } else {
            self.successes as f64 / self.uses as f64
        }
    }

    pub fn avg_duration(&self) -> Option<Duration> {
        (self.uses > 0).then(|| self.total_duration / self.uses as u32)
    }
}

#[derive(Debug)]
struct AgentState {
    load: usize,
    tool_load: HashMap<String, usize>,
    history: VecDeque<PerformanceMetric>,
    expertise: f64,
}

impl AgentState {
    fn new() -> Self {
        Self {
            load: 0,
            tool_load: HashMap::new(),
            history: VecDeque::new(),
            expertise: INITIAL_EXPERTISE,
        }
    }
}

/// Point-in-time copy of one capability's record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub capability: Capability,
    pub load: usize,
    pub tool_load: HashMap<String, usize>,
    pub expertise: f64,
    pub history_len: usize,
    pub successes: usize,
    pub tool_stats: HashMap<String, ToolStats>,
}

impl AgentSnapshot {
    /// Recent success rate over the window, `INITIAL_EXPERTISE` when empty.
    pub fn success_rate(&self) -> f64 {
        if self.history_len == 0 {
            INITIAL_EXPERTISE
        } else {
            self.successes as f64 / self.history_len as f64
        }
    }

    pub fn stats_for(&self, tool: &str) -> ToolStats {
        self.tool_stats.get(tool).copied().unwrap_or_default()
    }

    pub fn load_of(&self, tool: &str) -> usize {
        self.tool_load.get(tool).copied().unwrap_or(0)
    }
}

/// Registry of per-capability agent records.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: HashMap<Capability, Mutex<AgentState>>,
    window: usize,
    expertise_rate: f64,
}

impl AgentRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            agents: Capability::ALL
                .into_iter()
                .map(|c| (c, Mutex::new(AgentState::new())))
                .collect(),
            window: config.history_window.max(1),
            expertise_rate: config.expertise_rate,
        }
    }

    fn state(&self, capability: Capability) -> MutexGuard<'_, AgentState> {
        // Every capability is seeded in `new`
        let slot = &self.agents[&capability];
        slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count one in-flight step against the capability and tool until the
    /// returned guard is dropped.
    pub fn acquire(self: &Arc<Self>, capability: Capability, tool: &str) -> LoadGuard {
        {
            let mut state = self.state(capability);
            state.load += 1;
            *state.tool_load.entry(tool.to_string()).or_default() += 1;
            debug!(%capability, tool, load = state.load, "Agent load incremented");
        }
        LoadGuard {
            registry: Arc::clone(self),
            capability,
            tool: tool.to_string(),
        }
    }

    fn release(&self, capability: Capability, tool: &str) {
        let mut state = self.state(capability);
        state.load = state.load.saturating_sub(1);
        if let Some(n) = state.tool_load.get_mut(tool) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                state.tool_load.remove(tool);
            }
        }
        debug!(%capability, tool, load = state.load, "Agent load decremented");
    }

    /// Append a metric, evicting the oldest past the window, and move the
    /// expertise score toward the observed outcome.
    pub fn record(&self, metric: PerformanceMetric) {
        let mut state = self.state(metric.capability);
        let outcome = if metric.success { 1.0 } else { 0.0 };
        state.expertise += self.expertise_rate * (outcome - state.expertise);
        state.history.push_back(metric);
        while state.history.len() > self.window {
            state.history.pop_front();
        }
    }

    pub fn snapshot(&self, capability: Capability) -> AgentSnapshot {
        let state = self.state(capability);
        let mut tool_stats: HashMap<String, ToolStats> = HashMap::new();
        for metric in &state.history {
            let stats = tool_stats.entry(metric.tool.clone()).or_default();
            stats.uses += 1;
            stats.successes += usize::from(metric.success);
            stats.total_duration += metric.duration;
        }
        AgentSnapshot {
            capability,
            load: state.load,
            tool_load: state.tool_load.clone(),
            expertise: state.expertise,
            history_len: state.history.len(),
            successes: state.history.iter().filter(|m| m.success).count(),
            tool_stats,
        }
    }

    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        Capability::ALL.into_iter().map(|c| self.snapshot(c)).collect()
    }

    /// The window, oldest first.
    pub fn history(&self, capability: Capability) -> Vec<PerformanceMetric> {
        self.state(capability).history.iter().cloned().collect()
    }
}

/// Holds one unit of load; released on drop, including on panic or cancellation.
#[derive(Debug)]
pub struct LoadGuard {
    registry: Arc<AgentRegistry>,
    capability: Capability,
    tool: String,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.registry.release(self.capability, &self.tool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(window: usize) -> Arc<AgentRegistry> {
        Arc::new(AgentRegistry::new(&RegistryConfig {
            history_window: window,
            expertise_rate: 0.1,
        }))
    }

    #[test]
    fn test_load_guard_balances() {
        let registry = registry(10);
        let a = registry.acquire(Capability::Network, "nmap");
        let b = registry.acquire(Capability::Network, "masscan");
        let snap = registry.snapshot(Capability::Network);
        assert_eq!(snap.load, 2);
        assert_eq!(snap.load_of("nmap"), 1);
        drop(a);
        drop(b);
        let snap = registry.snapshot(Capability::Network);
        assert_eq!(snap.load, 0);
        assert!(snap.tool_load.is_empty());
    }

    #[test]
    fn test_history_window_evicts_oldest() {
        let registry = registry(3);
        for i in 0..5 {
            registry.record(PerformanceMetric::new(
                Capability::Web,
                format!("tool{}", i),
                true,
                Duration::from_secs(1),
                0,
            ));
        }
        let history = registry.history(Capability::Web);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].tool, "tool2");
    }

    #[test]
    fn test_expertise_moves_toward_outcomes() {
        let registry = registry(10);
        assert_eq!(registry.snapshot(Capability::Forensic).expertise, INITIAL_EXPERTISE);
        registry.record(PerformanceMetric::new(
            Capability::Forensic,
            "strings",
            true,
            Duration::from_secs(2),
            4,
        ));
        let up = registry.snapshot(Capability::Forensic).expertise;
        assert!((up - 0.55).abs() < 1e-9);
        registry.record(
            PerformanceMetric::new(Capability::Forensic, "binwalk", true, Duration::ZERO, 0)
                .timed_out(),
        );
        assert!(registry.snapshot(Capability::Forensic).expertise < up);
    }

    #[test]
    fn test_tool_stats() {
        let registry = registry(10);
        registry.record(PerformanceMetric::new(
            Capability::Network,
            "nmap",
            true,
            Duration::from_secs(10),
            3,
        ));
        registry.record(PerformanceMetric::new(
            Capability::Network,
            "nmap",
            false,
            Duration::from_secs(20),
            0,
        ));
        let snap = registry.snapshot(Capability::Network);
        let stats = snap.stats_for("nmap");
        assert_eq!(stats.uses, 2);
        assert_eq!(stats.success_rate_or(0.5), 0.5);
        assert_eq!(stats.avg_duration(), Some(Duration::from_secs(15)));
        assert_eq!(snap.stats_for("masscan").success_rate_or(0.5), 0.5);
        assert_eq!(snap.success_rate(), 0.5);
    }

    #[test]
    fn test_concurrent_updates_keep_load_consistent() {
        let registry = registry(1000);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = registry.acquire(Capability::Social, "theharvester");
                        registry.record(PerformanceMetric::new(
                            Capability::Social,
                            "theharvester",
                            true,
                            Duration::from_millis(1),
                            0,
                        ));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = registry.snapshot(Capability::Social);
        assert_eq!(snap.load, 0);
        assert_eq!(snap.history_len, 800);
    }
}
