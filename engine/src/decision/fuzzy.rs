//! Fuzzy rule scoring
//!
//! Six linguistic inputs (target risk, capability load, capability expertise,
//! and the tool's reliability, stealth, and thoroughness) are fuzzified with
//! triangular and shoulder-trapezoid sets. Weighted rules fire with min
//! conjunction, their consequents are clipped and max-aggregated, and the
//! centroid of the aggregate is the candidate's score.
//!
//! Selection is a pure function of the context and the current rule weights.
//! Weights move slowly from learning samples and stay within the configured
//! bounds.

use super::{pick_best, sanitize, Decision, DecisionContext, LearningSample, Strategy};
use crate::config::{FuzzyConfig, StrategyKind};
use sdk::errors::EngineError;
use sdk::types::Capability;
use std::collections::HashMap;
use std::sync::RwLock;

/// Sample points used for the centroid over [0, 1]
const RESOLUTION: usize = 100;

/// Membership function over [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Membership {
    Triangle(f64, f64, f64),
    /// `a == b` is a left shoulder, `c == d` a right shoulder
    Trapezoid(f64, f64, f64, f64),
}

impl Membership {
    pub fn degree(&self, x: f64) -> f64 {
        match *self {
            Membership::Triangle(a, b, c) => Membership::Trapezoid(a, b, b, c).degree(x),
            Membership::Trapezoid(a, b, c, d) => {
                if x < b {
                    if a == b {
                        1.0
                    } else if x <= a {
                        0.0
                    } else {
                        (x - a) / (b - a)
                    }
                } else if x <= c || c == d {
                    1.0
                } else if x >= d {
                    0.0
                } else {
                    (d - x) / (d - c)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Risk = 0,
    Load = 1,
    Expertise = 2,
    Reliability = 3,
    Stealth = 4,
    Thoroughness = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Term {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Score {
    Poor,
    Fair,
    Excellent,
}

impl Input {
    fn set(self, term: Term) -> Membership {
        match (self, term) {
            (Input::Load, Term::Low) => Membership::Trapezoid(0.0, 0.0, 0.1, 0.3),
            (Input::Load, Term::Medium) => Membership::Triangle(0.2, 0.5, 0.8),
            (Input::Load, Term::High) => Membership::Trapezoid(0.7, 0.9, 1.0, 1.0),
            (_, Term::Low) => Membership::Trapezoid(0.0, 0.0, 0.2, 0.4),
            (_, Term::Medium) => Membership::Triangle(0.2, 0.5, 0.8),
            (_, Term::High) => Membership::Trapezoid(0.6, 0.8, 1.0, 1.0),
        }
    }
}

impl Score {
    fn set(self) -> Membership {
        match self {
            Score::Poor => Membership::Trapezoid(0.0, 0.0, 0.1, 0.3),
            Score::Fair => Membership::Triangle(0.2, 0.5, 0.8),
            Score::Excellent => Membership::Trapezoid(0.7, 0.9, 1.0, 1.0),
        }
    }

    /// Representative value the rule pushes the score toward
    fn center(self) -> f64 {
        match self {
            Score::Poor => 0.1,
            Score::Fair => 0.5,
            Score::Excellent => 0.9,
        }
    }
}

struct Rule {
    when: &'static [(Input, Term)],
    then: Score,
    weight: f64,
}

const RULES: &[Rule] = &[
    Rule {
        when: &[(Input::Reliability, Term::High), (Input::Expertise, Term::High)],
        then: Score::Excellent,
        weight: 1.0,
    },
    Rule {
        when: &[(Input::Reliability, Term::High), (Input::Load, Term::Low)],
        then: Score::Excellent,
        weight: 0.9,
    },
    Rule {
        when: &[(Input::Reliability, Term::Low)],
        then: Score::Poor,
        weight: 0.9,
    },
    // Noisy tools against sensitive targets
    Rule {
        when: &[(Input::Risk, Term::High), (Input::Stealth, Term::Low)],
        then: Score::Poor,
        weight: 0.8,
    },
    Rule {
        when: &[(Input::Risk, Term::High), (Input::Stealth, Term::High)],
        then: Score::Fair,
        weight: 0.7,
    },
    Rule {
        when: &[(Input::Risk, Term::Low), (Input::Thoroughness, Term::High)],
        then: Score::Excellent,
        weight: 0.8,
    },
    Rule {
        when: &[(Input::Risk, Term::Medium), (Input::Reliability, Term::Medium)],
        then: Score::Fair,
        weight: 0.7,
    },
    Rule {
        when: &[(Input::Load, Term::High)],
        then: Score::Poor,
        weight: 0.7,
    },
    Rule {
        when: &[(Input::Load, Term::Medium), (Input::Thoroughness, Term::Medium)],
        then: Score::Fair,
        weight: 0.6,
    },
    Rule {
        when: &[(Input::Expertise, Term::Low), (Input::Thoroughness, Term::High)],
        then: Score::Fair,
        weight: 0.6,
    },
    Rule {
        when: &[(Input::Expertise, Term::Medium), (Input::Reliability, Term::Medium)],
        then: Score::Fair,
        weight: 0.5,
    },
    Rule {
        when: &[(Input::Thoroughness, Term::High), (Input::Stealth, Term::High)],
        then: Score::Excellent,
        weight: 0.7,
    },
];

type Inputs = [f64; 6];

/// Unweighted firing strength of every rule.
fn activations(inputs: &Inputs) -> Vec<f64> {
    RULES
        .iter()
        .map(|rule| {
            rule.when
                .iter()
                .map(|&(input, term)| input.set(term).degree(inputs[input as usize]))
                .fold(1.0, f64::min)
        })
        .collect()
}

/// Mamdani inference with centroid defuzzification. 0.5 when no rule fires.
fn infer(inputs: &Inputs, weights: &[f64]) -> f64 {
    let strengths: Vec<f64> = activations(inputs)
        .into_iter()
        .zip(weights)
        .map(|(a, w)| a * w)
        .collect();

    let (mut num, mut den) = (0.0, 0.0);
    for i in 0..=RESOLUTION {
        let y = i as f64 / RESOLUTION as f64;
        let mu = RULES
            .iter()
            .zip(&strengths)
            .map(|(rule, &s)| s.min(rule.then.set().degree(y)))
            .fold(0.0, f64::max);
        num += y * mu;
        den += mu;
    }
    if den <= f64::EPSILON {
        0.5
    } else {
        sanitize(num / den)
    }
}

/// Rule-based scoring with slowly adapting rule weights.
pub struct FuzzyStrategy {
    weights: RwLock<HashMap<Capability, Vec<f64>>>,
    adaptation_rate: f64,
    min_weight: f64,
    max_weight: f64,
    tie_epsilon: f64,
}

impl FuzzyStrategy {
    pub fn new(config: &FuzzyConfig, tie_epsilon: f64) -> Self {
        Self {
            weights: RwLock::new(HashMap::new()),
            adaptation_rate: config.adaptation_rate,
            min_weight: config.min_rule_weight,
            max_weight: config.max_rule_weight,
            tie_epsilon,
        }
    }

    fn initial_weights(&self) -> Vec<f64> {
        RULES
            .iter()
            .map(|r| r.weight.max(self.min_weight).min(self.max_weight))
            .collect()
    }

    pub fn rule_weights(&self, capability: Capability) -> Vec<f64> {
        let weights = self.weights.read().unwrap_or_else(|e| e.into_inner());
        weights
            .get(&capability)
            .cloned()
            .unwrap_or_else(|| self.initial_weights())
    }

    /// Score of one candidate of the context, in [0, 1].
    pub fn score(&self, ctx: &DecisionContext, tool: &str) -> Option<f64> {
        let candidate = ctx.candidate(tool)?;
        let weights = self.rule_weights(ctx.capability);
        Some(infer(
            &[
                ctx.target_risk,
                ctx.load_ratio(),
                ctx.agent.expertise,
                candidate.success_rate,
                1.0 - candidate.intrusiveness,
                candidate.thoroughness,
            ],
            &weights,
        ))
    }
}

impl Strategy for FuzzyStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fuzzy
    }

    fn select(&self, ctx: &DecisionContext) -> Result<Decision, EngineError> {
        let scores: Vec<f64> = ctx
            .candidates
            .iter()
            .map(|c| self.score(ctx, &c.name).unwrap_or(0.0))
            .collect();
        let best = pick_best(&ctx.candidates, &scores, self.tie_epsilon);
        let candidate = ctx
            .candidates
            .get(best)
            .ok_or(EngineError::NoEligibleTool(ctx.capability))?;
        Ok(Decision {
            tool: candidate.name.clone(),
            confidence: scores[best],
            strategy: StrategyKind::Fuzzy,
        })
    }

    /// Strengthen rules whose consequent agrees with the observed outcome,
    /// weaken the ones that disagree, in proportion to how strongly they fired.
    fn learn(&self, sample: &LearningSample) {
        let inputs = [
            sample.target_risk,
            sample.load_ratio,
            sample.expertise,
            sample.candidate.success_rate,
            1.0 - sample.candidate.intrusiveness,
            sample.candidate.thoroughness,
        ]
        .map(sanitize);
        let target = sample.target();
        let fired = activations(&inputs);

        let mut all = self.weights.write().unwrap_or_else(|e| e.into_inner());
        let weights = all
            .entry(sample.capability)
            .or_insert_with(|| self.initial_weights());
        for ((weight, rule), activation) in weights.iter_mut().zip(RULES).zip(fired) {
            if activation <= 0.0 {
                continue;
            }
            let agreement = 1.0 - 2.0 * (target - rule.then.center()).abs();
            *weight = (*weight + self.adaptation_rate * activation * agreement)
                .max(self.min_weight).min(self.max_weight);
        }
    }
}
