//! Warden Engine Library
//!
//! Core of the warden security-assessment orchestrator: tool adapters, the
//! agent registry, the decision engine, and the planner and dispatcher that
//! tie them together. Used by the `warden` binary and integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// Command execution security module
pub mod command_executor;

/// Assessment targets and their grammars
pub mod target;

/// Risk assessment module
pub mod risk_assessor;

/// External tool adapters
pub mod tools;

/// Per-capability agent state
pub mod registry;

/// Tool selection strategies
pub mod decision;

/// Planning, dispatch, and learning feedback
pub mod conductor;

/// Message bus for plan lifecycle events
pub mod message_bus;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
