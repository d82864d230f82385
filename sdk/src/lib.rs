//! Warden SDK
//!
//! Shared library providing the error taxonomy and the data contract used by
//! the engine and by every tool adapter.

/// Error types and handling
pub mod errors;

/// Capabilities, findings, and tool report types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, WardenErrorExt};
pub use types::{
    Capability, Finding, FindingKind, HealthReport, HealthStatus, Priority, Severity, ToolInput,
    ToolReport, ToolStatus,
};
