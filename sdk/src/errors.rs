//! Error types and handling
//!
//! This module provides the error taxonomy shared by the Warden engine and its
//! tool adapters. All errors implement the `WardenErrorExt` trait which provides
//! user-friendly hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! Error messages never carry raw tool stdout. Parse failures are reported with
//! a SHA-256 hash of the output, and stderr is truncated before it is stored.

use crate::types::Capability;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum number of stderr bytes kept in a `ToolExecution` error
pub const STDERR_LIMIT: usize = 512;

/// Trait for Warden error extensions
///
/// Provides additional context for errors, including user-friendly hints and
/// recoverability information.
pub trait WardenErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display and does not contain scan data or paths.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors may succeed when the step is planned again, possibly
    /// with a different tool. Non-recoverable errors need the request or the
    /// environment to change first.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Pre-flight**: `ToolNotFound` (binary absent, step is skipped)
/// - **Validation**: `InvalidTarget` (fatal for that step only)
/// - **Execution**: `ToolExecution`, `Timeout`, `Cancelled`
/// - **Parsing**: `ParseError` (hash of raw output only)
/// - **Planning**: `NoEligibleTool`, `Orchestration`
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, WardenErrorExt};
///
/// let error = EngineError::Timeout { tool: "nmap".to_string(), timeout_secs: 300 };
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::InvalidTarget("relative path".to_string());
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Tool errors
    #[error("Tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Tool {tool} failed with exit code {exit_code:?}: {stderr}")]
    ToolExecution {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Tool {tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("Failed to parse {tool} output (sha256 {output_hash})")]
    ParseError { tool: String, output_hash: String },

    #[error("Command not allowed: {0}")]
    CommandNotAllowed(String),

    // Planning errors
    #[error("No eligible tool for capability {0}")]
    NoEligibleTool(Capability),

    #[error("Orchestration error: {0}")]
    Orchestration(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Build a `ToolExecution` error, keeping at most `STDERR_LIMIT` bytes of stderr.
    pub fn tool_execution(tool: impl Into<String>, exit_code: Option<i32>, stderr: &str) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            exit_code,
            stderr: truncate_utf8(stderr.trim(), STDERR_LIMIT).to_string(),
        }
    }

    /// Build a `ParseError` carrying the hash of the raw output instead of the output.
    pub fn parse_error(tool: impl Into<String>, raw_output: &[u8]) -> Self {
        Self::ParseError {
            tool: tool.into(),
            output_hash: output_hash(raw_output),
        }
    }

    /// Whether the error reports how a tool behaved once it ran, rather than
    /// a request refused before anything was spawned.
    pub fn is_tool_outcome(&self) -> bool {
        matches!(
            self,
            Self::ToolExecution { .. } | Self::Timeout { .. } | Self::ParseError { .. }
        )
    }

    /// Short machine-readable label used in plan reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::InvalidTarget(_) => "invalid_target",
            Self::ToolExecution { .. } => "tool_execution",
            Self::Timeout { .. } => "timeout",
            Self::ParseError { .. } => "parse_error",
            Self::CommandNotAllowed(_) => "command_not_allowed",
            Self::NoEligibleTool(_) => "no_eligible_tool",
            Self::Orchestration(_) => "orchestration",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
        }
    }
}

impl WardenErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::ToolNotFound { .. } => {
                "Install the tool or set its path under [tools.paths] in config.toml"
            }
            Self::InvalidTarget(_) => "The target or an option failed validation",
            Self::ToolExecution { .. } => "The tool exited with an error. Check its stderr",
            Self::Timeout { .. } => "The tool exceeded its time limit and was stopped",
            Self::ParseError { .. } => "The tool produced output in an unexpected format",
            Self::CommandNotAllowed(_) => "This command is not permitted",
            Self::NoEligibleTool(_) => "No registered tool can handle this step",
            Self::Orchestration(_) => "The execution plan is inconsistent",
            Self::Cancelled => "The plan was cancelled",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::ToolNotFound { .. }
            | Self::InvalidTarget(_)
            | Self::CommandNotAllowed(_)
            | Self::NoEligibleTool(_)
            | Self::Orchestration(_)
            | Self::Config(_) => false,

            _ => true,
        }
    }
}

/// Hex-encoded SHA-256 of raw tool output, used for diagnostics in place of content.
pub fn output_hash(raw_output: &[u8]) -> String {
    hex::encode(Sha256::digest(raw_output))
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
