//! Genetic reshaping of the model population.
//!
//! After each epoch the ranked population is rebuilt from five groups, in
//! order: verbatim copies of the best performers, an average of the best,
//! an average of everyone, and randomized perturbations of the two averages.
//! Every child is a freshly constructed wrapper, so no parameters are ever
//! shared with a parent.

use crate::neural::{ModelWrapper, NetConfig};
use crate::{AgentError, Result};

/// How many individuals each group contributes to the next generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationProportions {
    /// Top performers kept unchanged
    pub n_tops: usize,
    /// Individuals set to the parameter average of the tops
    pub averaged_n_tops: usize,
    /// Individuals set to the parameter average of the whole population
    pub n_averaged_all: usize,
    /// Perturbed variants of the tops average
    pub random_n_tops_averaged_mutations: usize,
    /// Perturbed variants of the whole-population average
    pub random_all_averaged_mutations: usize,
}

impl MutationProportions {
    pub fn total(&self) -> usize {
        self.n_tops
            + self.averaged_n_tops
            + self.n_averaged_all
            + self.random_n_tops_averaged_mutations
            + self.random_all_averaged_mutations
    }
}

#[derive(Debug, Clone)]
pub struct MutatorConfig {
    pub proportions: MutationProportions,
    /// Magnitude of the random perturbation (stddev of the noise)
    pub mutation_volume: f64,
    /// Probability that an individual parameter is perturbed
    pub mutation_freq: f64,
}

impl MutatorConfig {
    /// The proportion counts must sum exactly to the population size; a
    /// mismatch is rejected up front rather than silently padded or truncated.
    pub fn validate(&self, population_size: usize) -> Result<()> {
        let total = self.proportions.total();
        if total != population_size {
            return Err(AgentError::Configuration(format!(
                "mutation proportions sum to {total}, but the population holds {population_size} models"
            )));
        }
        if !(0.0..=1.0).contains(&self.mutation_freq) {
            return Err(AgentError::Configuration(format!(
                "mutation frequency {} outside [0, 1]",
                self.mutation_freq
            )));
        }
        if !self.mutation_volume.is_finite() || self.mutation_volume < 0.0 {
            return Err(AgentError::Configuration(format!(
                "mutation volume {} must be finite and non-negative",
                self.mutation_volume
            )));
        }
        Ok(())
    }
}

/// Bound to a config and a wrapper construction recipe; turns one ranked
/// generation into the next.
pub struct Mutator {
    config: MutatorConfig,
    net_config: NetConfig,
}

impl Mutator {
    pub fn new(config: MutatorConfig, net_config: NetConfig) -> Self {
        Self { config, net_config }
    }

    /// Build the next generation from a population ranked best-first.
    /// Returns exactly `ranked.len()` new wrappers.
    pub fn mutate(&self, ranked: Vec<ModelWrapper>) -> Result<Vec<ModelWrapper>> {
        self.config.validate(ranked.len())?;
        if ranked.is_empty() {
            return Ok(ranked);
        }
        let p = &self.config.proportions;

        // When n_tops is zero the averaging groups still need a "tops" set;
        // fall back to the single best individual.
        let tops_count = p.n_tops.clamp(1, ranked.len());
        let tops: Vec<&ModelWrapper> = ranked.iter().take(tops_count).collect();
        let everyone: Vec<&ModelWrapper> = ranked.iter().collect();

        let mut next = Vec::with_capacity(ranked.len());

        for parent in ranked.iter().take(p.n_tops) {
            next.push(parent.clone_into_new()?);
        }
        for _ in 0..p.averaged_n_tops {
            next.push(self.averaged(&tops)?);
        }
        for _ in 0..p.n_averaged_all {
            next.push(self.averaged(&everyone)?);
        }
        for _ in 0..p.random_n_tops_averaged_mutations {
            let mut child = self.averaged(&tops)?;
            child.perturb(self.config.mutation_volume, self.config.mutation_freq)?;
            next.push(child);
        }
        for _ in 0..p.random_all_averaged_mutations {
            let mut child = self.averaged(&everyone)?;
            child.perturb(self.config.mutation_volume, self.config.mutation_freq)?;
            next.push(child);
        }

        Ok(next)
    }

    fn averaged(&self, parents: &[&ModelWrapper]) -> Result<ModelWrapper> {
        let mut child = ModelWrapper::new(self.net_config.clone())?;
        child.load_average_of(parents)?;
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn net_config() -> NetConfig {
        NetConfig {
            feature_dim: 3,
            hidden_dims: vec![8],
            dropout: 0.0,
            learning_rate: 1e-2,
        }
    }

    fn population(n: usize) -> Vec<ModelWrapper> {
        (0..n)
            .map(|_| ModelWrapper::new(net_config()).unwrap())
            .collect()
    }

    fn mutator(proportions: MutationProportions) -> Mutator {
        Mutator::new(
            MutatorConfig {
                proportions,
                mutation_volume: 0.2,
                mutation_freq: 0.2,
            },
            net_config(),
        )
    }

    #[test]
    fn mismatched_counts_are_rejected() {
        let config = MutatorConfig {
            proportions: MutationProportions {
                n_tops: 4,
                averaged_n_tops: 1,
                n_averaged_all: 1,
                random_n_tops_averaged_mutations: 2,
                random_all_averaged_mutations: 2,
            },
            mutation_volume: 0.2,
            mutation_freq: 0.2,
        };
        assert!(config.validate(10).is_ok());
        assert_matches!(config.validate(9), Err(AgentError::Configuration(_)));
    }

    #[test]
    fn mutate_preserves_population_size() {
        let m = mutator(MutationProportions {
            n_tops: 2,
            averaged_n_tops: 1,
            n_averaged_all: 1,
            random_n_tops_averaged_mutations: 1,
            random_all_averaged_mutations: 1,
        });
        let next = m.mutate(population(6)).unwrap();
        assert_eq!(next.len(), 6);
    }

    #[test]
    fn tops_are_copied_verbatim() {
        let pop = population(4);
        let best_snapshot = pop[0].clone_into_new().unwrap();

        let m = mutator(MutationProportions {
            n_tops: 1,
            averaged_n_tops: 1,
            n_averaged_all: 1,
            random_n_tops_averaged_mutations: 1,
            random_all_averaged_mutations: 0,
        });
        let next = m.mutate(pop).unwrap();
        assert!(next[0].params_allclose(&best_snapshot));
    }

    #[test]
    fn children_never_alias_each_other() {
        let pop = population(3);
        let best_snapshot = pop[0].clone_into_new().unwrap();

        let m = mutator(MutationProportions {
            n_tops: 1,
            averaged_n_tops: 1,
            n_averaged_all: 1,
            random_n_tops_averaged_mutations: 0,
            random_all_averaged_mutations: 0,
        });
        let mut next = m.mutate(pop).unwrap();

        // All children descend from the same parents; mutating the averaged
        // ones must leave no trace on the verbatim copy of the top.
        for child in next.iter_mut().skip(1) {
            child.perturb(1.0, 1.0).unwrap();
        }
        assert!(next[0].params_allclose(&best_snapshot));
    }

    #[test]
    fn averaged_all_child_is_the_population_mean() {
        let pop = population(2);
        let a = pop[0].clone_into_new().unwrap();
        let b = pop[1].clone_into_new().unwrap();

        let m = mutator(MutationProportions {
            n_tops: 1,
            averaged_n_tops: 0,
            n_averaged_all: 1,
            random_n_tops_averaged_mutations: 0,
            random_all_averaged_mutations: 0,
        });
        let next = m.mutate(pop).unwrap();

        let mut expected = ModelWrapper::new(net_config()).unwrap();
        expected.load_average_of(&[&a, &b]).unwrap();
        assert!(next[1].params_allclose(&expected));
    }
}
