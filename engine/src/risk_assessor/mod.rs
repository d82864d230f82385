//! Risk assessment module
//!
//! Scores how risky a step is to run against its target. The score feeds the
//! decision strategies as the "target risk" input and is reported per step.
//! Steps are also classified into three risk tiers:
//!
//! - **Passive**: reads local evidence or public sources only
//!   - forensic analysis, OSINT, report digest
//!
//! - **Active**: sends ordinary traffic to the target
//!   - port scans, fingerprinting, content discovery
//!
//! - **Intrusive**: attempts exploitation or heavy probing
//!   - SQL injection testing, aggressive scan profiles
//!
//! # Escalation
//!
//! - Aggressive options (`scan_type=aggressive`, sqlmap `level >= 3` or `risk >= 2`)
//!   escalate the tier by one level
//! - Network ranges wider than a /24 add to the score

use sdk::types::{Capability, Priority, ToolInput};
use serde::{Deserialize, Serialize};

use crate::target::Target;

/// Risk tier classification for steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Passive = 0,
    Active = 1,
    Intrusive = 2,
}

impl RiskTier {
    /// Escalate the risk tier by one level
    ///
    /// Passive → Active, Active → Intrusive, Intrusive → Intrusive (max)
    pub fn escalate(self) -> Self {
        match self {
            RiskTier::Passive => RiskTier::Active,
            RiskTier::Active => RiskTier::Intrusive,
            RiskTier::Intrusive => RiskTier::Intrusive,
        }
    }
}

/// Result of assessing one step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Target risk in [0, 1]
    pub score: f64,
    pub tier: RiskTier,
}

/// Risk assessor for step classification
///
/// # Examples
///
/// ```
/// use warden_engine::risk_assessor::{RiskAssessor, RiskTier};
/// use warden_engine::target::Target;
/// use sdk::types::{Capability, Priority, ToolInput};
///
/// let assessor = RiskAssessor::new();
/// let target = Target::parse("http://10.0.0.5/item.php?id=1").unwrap();
///
/// let web = assessor.assess(Capability::Web, &target, Priority::Medium, &ToolInput::default());
/// assert_eq!(web.tier, RiskTier::Active);
///
/// let sqli = assessor.assess(Capability::Vulnerability, &target, Priority::High, &ToolInput::default());
/// assert_eq!(sqli.tier, RiskTier::Intrusive);
/// assert!(sqli.score > web.score);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RiskAssessor;

impl RiskAssessor {
    pub fn new() -> Self {
        Self
    }

    pub fn assess(
        &self,
        capability: Capability,
        target: &Target,
        priority: Priority,
        options: &ToolInput,
    ) -> RiskAssessment {
        let mut tier = self.classify_capability(capability);
        let mut score = self.base_score(capability);

        if self.is_wide_range(target) {
            score += 0.2;
        }
        score += priority.normalized() * 0.2;

        if self.has_aggressive_options(options) {
            tier = tier.escalate();
            score += 0.1;
        }

        RiskAssessment {
            score: score.clamp(0.0, 1.0),
            tier,
        }
    }

    fn classify_capability(&self, capability: Capability) -> RiskTier {
        match capability {
            Capability::Forensic | Capability::Social | Capability::Report => RiskTier::Passive,
            Capability::Network | Capability::Web => RiskTier::Active,
            Capability::Vulnerability => RiskTier::Intrusive,
        }
    }

    fn base_score(&self, capability: Capability) -> f64 {
        match capability {
            Capability::Network => 0.4,
            Capability::Web => 0.5,
            Capability::Vulnerability => 0.8,
            Capability::Forensic => 0.2,
            Capability::Social => 0.1,
            Capability::Report => 0.0,
        }
    }

    /// CIDR ranges wider than a /24
    fn is_wide_range(&self, target: &Target) -> bool {
        match target {
            Target::Host(h) => h
                .split_once('/')
                .and_then(|(_, prefix)| prefix.parse::<u8>().ok())
                .is_some_and(|prefix| prefix < 24),
            _ => false,
        }
    }

    fn has_aggressive_options(&self, options: &ToolInput) -> bool {
        let scan_aggressive = options
            .params
            .iter()
            .filter(|(k, _)| k.ends_with("scan_type"))
            .any(|(_, v)| v.as_str() == Some("aggressive"));
        let deep = |key: &str, threshold: i64| {
            options
                .params
                .iter()
                .filter(|(k, _)| *k == key || k.ends_with(&format!(".{}", key)))
                .any(|(_, v)| v.as_i64().is_some_and(|n| n >= threshold))
        };
        scan_aggressive || deep("level", 3) || deep("risk", 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_risk_tier_escalate() {
        assert_eq!(RiskTier::Passive.escalate(), RiskTier::Active);
        assert_eq!(RiskTier::Active.escalate(), RiskTier::Intrusive);
        assert_eq!(RiskTier::Intrusive.escalate(), RiskTier::Intrusive);
    }

    #[test]
    fn test_classify_by_capability() {
        let assessor = RiskAssessor::new();
        let file = Target::parse("/evidence/disk.img").unwrap();
        let host = Target::parse("10.0.0.1").unwrap();
        let none = ToolInput::default();

        assert_eq!(
            assessor.assess(Capability::Forensic, &file, Priority::Low, &none).tier,
            RiskTier::Passive
        );
        assert_eq!(
            assessor.assess(Capability::Network, &host, Priority::Low, &none).tier,
            RiskTier::Active
        );
        assert_eq!(
            assessor.assess(Capability::Vulnerability, &host, Priority::Low, &none).tier,
            RiskTier::Intrusive
        );
    }

    #[test]
    fn test_wide_range_scores_higher() {
        let assessor = RiskAssessor::new();
        let none = ToolInput::default();
        let narrow = Target::parse("10.0.0.0/24").unwrap();
        let wide = Target::parse("10.0.0.0/16").unwrap();
        let a = assessor.assess(Capability::Network, &narrow, Priority::Medium, &none);
        let b = assessor.assess(Capability::Network, &wide, Priority::Medium, &none);
        assert!((b.score - a.score - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_aggressive_options_escalate() {
        let assessor = RiskAssessor::new();
        let host = Target::parse("10.0.0.1").unwrap();
        let options = ToolInput::default().with_param("nmap.scan_type", json!("aggressive"));
        let assessment = assessor.assess(Capability::Network, &host, Priority::Low, &options);
        assert_eq!(assessment.tier, RiskTier::Intrusive);

        let options = ToolInput::default().with_param("sqlmap.level", json!(5));
        let assessment = assessor.assess(Capability::Web, &host, Priority::Low, &options);
        assert_eq!(assessment.tier, RiskTier::Intrusive);
    }

    #[test]
    fn test_score_is_bounded() {
        let assessor = RiskAssessor::new();
        let wide = Target::parse("10.0.0.0/8").unwrap();
        let options = ToolInput::default().with_param("risk", json!(3));
        let assessment =
            assessor.assess(Capability::Vulnerability, &wide, Priority::Critical, &options);
        assert!((0.0..=1.0).contains(&assessment.score));
    }
}
