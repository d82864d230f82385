//! Evolutionary strategy search
//!
//! Each capability keeps a population of genomes. A genome is a weight per
//! tool feature (reliability, speed, thoroughness, stealth, load aversion);
//! a candidate's score is the weighted mean of its features. Fitness is how
//! well a genome's scores predicted the rewards of recent samples.
//!
//! The population evolves every `evolve_every` samples. Between generations
//! selection only reads the best genome, so a step never waits on evolution.

use super::{pick_best, sanitize, Decision, DecisionContext, LearningSample, Strategy, FEATURES};
use crate::config::{EvolutionaryConfig, StrategyKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sdk::errors::EngineError;
use sdk::types::Capability;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub type Genome = [f64; FEATURES];

/// Equal weight on every feature
pub const NEUTRAL: Genome = [0.5; FEATURES];

/// Samples kept per capability for fitness evaluation
const SAMPLE_WINDOW: usize = 50;

const TOURNAMENT_SIZE: usize = 3;

/// Weighted mean of the features under a genome.
pub fn score(genome: &Genome, features: &[f64; FEATURES]) -> f64 {
    let total: f64 = genome.iter().sum();
    if total <= f64::EPSILON {
        return sanitize(features.iter().sum::<f64>() / FEATURES as f64);
    }
    let weighted: f64 = genome.iter().zip(features).map(|(g, f)| g * f).sum();
    sanitize(weighted / total)
}

/// Mean of `1 - (score - target)^2` over the samples; 0 with no samples.
pub fn fitness(genome: &Genome, samples: &[([f64; FEATURES], f64)]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples
        .iter()
        .map(|(features, target)| {
            let err = score(genome, features) - target;
            1.0 - err * err
        })
        .sum();
    total / samples.len() as f64
}

struct Population {
    genomes: Vec<Genome>,
    best: Genome,
    samples: VecDeque<([f64; FEATURES], f64)>,
    pending: usize,
    generation: u64,
}

struct State {
    populations: HashMap<Capability, Population>,
    rng: StdRng,
}

pub struct EvolutionaryStrategy {
    state: Mutex<State>,
    population_size: usize,
    mutation_rate: f64,
    mutation_sigma: f64,
    elite_fraction: f64,
    evolve_every: usize,
    tie_epsilon: f64,
}

impl EvolutionaryStrategy {
    pub fn new(config: &EvolutionaryConfig, tie_epsilon: f64) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            state: Mutex::new(State {
                populations: HashMap::new(),
                rng,
            }),
            population_size: config.population_size.max(2),
            mutation_rate: config.mutation_rate,
            mutation_sigma: config.mutation_sigma,
            elite_fraction: config.elite_fraction,
            evolve_every: config.evolve_every.max(1),
            tie_epsilon,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Genome used for selection; [`NEUTRAL`] before any sample.
    pub fn best_genome(&self, capability: Capability) -> Genome {
        self.lock()
            .populations
            .get(&capability)
            .map_or(NEUTRAL, |p| p.best)
    }

    pub fn generation(&self, capability: Capability) -> u64 {
        self.lock()
            .populations
            .get(&capability)
            .map_or(0, |p| p.generation)
    }

    /// The fitness window of a capability, oldest first.
    pub fn samples(&self, capability: Capability) -> Vec<([f64; FEATURES], f64)> {
        self.lock()
            .populations
            .get(&capability)
            .map(|p| p.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every genome of the current generation.
    pub fn population(&self, capability: Capability) -> Vec<Genome> {
        self.lock()
            .populations
            .get(&capability)
            .map(|p| p.genomes.clone())
            .unwrap_or_default()
    }

    fn seed_population(&self, rng: &mut StdRng) -> Population {
        let mut genomes = vec![NEUTRAL];
        while genomes.len() < self.population_size {
            let mut genome = [0.0; FEATURES];
            for gene in genome.iter_mut() {
                *gene = rng.gen::<f64>();
            }
            genomes.push(genome);
        }
        Population {
            genomes,
            best: NEUTRAL,
            samples: VecDeque::new(),
            pending: 0,
            generation: 0,
        }
    }

    /// Elitism, tournament selection, uniform crossover, Gaussian mutation.
    fn evolve(&self, population: &mut Population, rng: &mut StdRng) {
        let samples: Vec<_> = population.samples.iter().copied().collect();
        let mut ranked: Vec<(f64, Genome)> = population
            .genomes
            .iter()
            .map(|g| (fitness(g, &samples), *g))
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        let size = ranked.len();
        let elites = ((size as f64 * self.elite_fraction).round() as usize).clamp(1, size);
        let mut next: Vec<Genome> = ranked.iter().take(elites).map(|(_, g)| *g).collect();

        while next.len() < size {
            let a = tournament(&ranked, rng);
            let b = tournament(&ranked, rng);
            let mut child = [0.0; FEATURES];
            for (i, gene) in child.iter_mut().enumerate() {
                *gene = if rng.gen_bool(0.5) { a[i] } else { b[i] };
                if rng.gen::<f64>() < self.mutation_rate {
                    *gene = (*gene + self.mutation_sigma * gaussian(rng)).clamp(0.0, 1.0);
                }
            }
            next.push(child);
        }

        population.best = ranked[0].1;
        population.genomes = next;
        population.pending = 0;
        population.generation += 1;
        debug!(
            generation = population.generation,
            best_fitness = ranked[0].0,
            "Population evolved"
        );
    }
}

fn tournament(ranked: &[(f64, Genome)], rng: &mut StdRng) -> Genome {
    let mut winner = rng.gen_range(0..ranked.len());
    for _ in 1..TOURNAMENT_SIZE {
        let contender = rng.gen_range(0..ranked.len());
        // `ranked` is sorted by descending fitness
        winner = winner.min(contender);
    }
    ranked[winner].1
}

/// Standard normal draw (Box-Muller)
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

impl Strategy for EvolutionaryStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Evolutionary
    }

    fn select(&self, ctx: &DecisionContext) -> Result<Decision, EngineError> {
        let genome = self.best_genome(ctx.capability);
        let scores: Vec<f64> = ctx
            .candidates
            .iter()
            .map(|c| score(&genome, &c.features()))
            .collect();
        let best = pick_best(&ctx.candidates, &scores, self.tie_epsilon);
        let candidate = ctx
            .candidates
            .get(best)
            .ok_or(EngineError::NoEligibleTool(ctx.capability))?;
        Ok(Decision {
            tool: candidate.name.clone(),
            confidence: scores[best],
            strategy: StrategyKind::Evolutionary,
        })
    }

    fn learn(&self, sample: &LearningSample) {
        let mut guard = self.lock();
        let State { populations, rng } = &mut *guard;
        if !populations.contains_key(&sample.capability) {
            let seeded = self.seed_population(rng);
            populations.insert(sample.capability, seeded);
        }
        let Some(population) = populations.get_mut(&sample.capability) else {
            return;
        };

        population
            .samples
            .push_back((sample.candidate.features(), sample.target()));
        while population.samples.len() > SAMPLE_WINDOW {
            population.samples.pop_front();
        }
        population.pending += 1;
        if population.pending >= self.evolve_every {
            self.evolve(population, rng);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{candidate, context};
    use super::*;

    fn config(seed: u64) -> EvolutionaryConfig {
        EvolutionaryConfig {
            seed: Some(seed),
            evolve_every: 5,
            ..EvolutionaryConfig::default()
        }
    }

    fn feed(strategy: &EvolutionaryStrategy, rounds: usize) {
        let ctx = context(
            Capability::Web,
            0.5,
            vec![candidate("gobuster", 0.9, 0.5), candidate("nikto", 0.2, 0.7)],
        );
        for i in 0..rounds {
            let (tool, reward) = if i % 2 == 0 { ("gobuster", 0.8) } else { ("nikto", -0.5) };
            let sample = LearningSample::from_context(&ctx, tool, reward, reward > 0.0).unwrap();
            strategy.learn(&sample);
        }
    }

    #[test]
    fn test_score_is_weighted_mean() {
        let features = [1.0, 0.0, 0.5, 0.5, 1.0];
        assert!((score(&NEUTRAL, &features) - 0.6).abs() < 1e-9);
        assert_eq!(score(&[1.0, 0.0, 0.0, 0.0, 0.0], &features), 1.0);
        assert!((score(&[0.0; FEATURES], &features) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_uses_neutral_genome_before_learning() {
        let s = EvolutionaryStrategy::new(&config(7), 0.01);
        assert_eq!(s.best_genome(Capability::Web), NEUTRAL);
        let ctx = context(
            Capability::Web,
            0.5,
            vec![candidate("gobuster", 0.9, 0.5), candidate("nikto", 0.2, 0.5)],
        );
        assert_eq!(s.select(&ctx).unwrap().tool, "gobuster");
    }

    #[test]
    fn test_evolves_on_schedule() {
        let s = EvolutionaryStrategy::new(&config(7), 0.01);
        feed(&s, 4);
        assert_eq!(s.generation(Capability::Web), 0);
        feed(&s, 1);
        assert_eq!(s.generation(Capability::Web), 1);
        assert_eq!(s.population(Capability::Web).len(), 20);
        assert_eq!(s.generation(Capability::Network), 0);
    }

    #[test]
    fn test_best_genome_at_least_as_fit_as_neutral() {
        let s = EvolutionaryStrategy::new(&config(11), 0.01);
        feed(&s, 5);
        let samples = s.samples(Capability::Web);
        let best = s.best_genome(Capability::Web);
        assert!(fitness(&best, &samples) >= fitness(&NEUTRAL, &samples));
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let a = EvolutionaryStrategy::new(&config(42), 0.01);
        let b = EvolutionaryStrategy::new(&config(42), 0.01);
        feed(&a, 30);
        feed(&b, 30);
        assert_eq!(a.best_genome(Capability::Web), b.best_genome(Capability::Web));
        assert_eq!(a.population(Capability::Web), b.population(Capability::Web));
    }

    #[test]
    fn test_genes_stay_in_unit_range() {
        let s = EvolutionaryStrategy::new(
            &EvolutionaryConfig {
                mutation_rate: 1.0,
                mutation_sigma: 1.0,
                ..config(3)
            },
            0.01,
        );
        feed(&s, 100);
        for genome in s.population(Capability::Web) {
            assert!(genome.iter().all(|g| (0.0..=1.0).contains(g)));
        }
    }
}
