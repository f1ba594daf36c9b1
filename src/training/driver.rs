//! The outer training loop.
//!
//! One epoch: every model plays an episode on every map, sequentially, and
//! trains on its own trajectory; the per-map rewards are summed into a
//! per-model score; the ranked population is then reshaped by the mutator.
//! An episode failure is a worst-case score for that model/map pairing, not
//! a reason to stop the epoch. An epoch in which no episode at all could be
//! played means the game servers are gone and training aborts.

use std::cmp::Ordering;

use crate::agent::connection::ConnectionManager;
use crate::agent::protocol::GameMap;
use crate::neural::{ModelWrapper, TrainSample};
use crate::{AgentError, Result};

/// Loop bounds for one `r_learn` invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub epochs: usize,
    pub max_steps: usize,
}

/// Run the full evolve-and-train loop, returning the population produced by
/// the final epoch's mutation.
pub async fn r_learn(
    run: &RunConfig,
    mut population: Vec<ModelWrapper>,
    maps: &[GameMap],
    mutator: &crate::training::Mutator,
    cm: &mut ConnectionManager,
) -> Result<Vec<ModelWrapper>> {
    if population.is_empty() {
        return Err(AgentError::Configuration(
            "cannot train an empty population".to_string(),
        ));
    }
    if maps.is_empty() {
        return Err(AgentError::Configuration(
            "no maps available for evaluation".to_string(),
        ));
    }

    for epoch in 0..run.epochs {
        let mut scores = Vec::with_capacity(population.len());
        let mut episodes_played = 0usize;

        for (model_idx, model) in population.iter_mut().enumerate() {
            let mut model_score = 0.0;
            for map in maps {
                match play_episode(model, map, run.max_steps, cm).await {
                    Ok(score) => {
                        episodes_played += 1;
                        model_score += score;
                        log::debug!(
                            "epoch {epoch}, model {model_idx}, map {}: score {score:.3}",
                            map.id
                        );
                    }
                    Err(e) => {
                        log::warn!(
                            "epoch {epoch}, model {model_idx}, map {}: episode failed: {e}",
                            map.id
                        );
                        model_score = f64::NEG_INFINITY;
                    }
                }
            }
            scores.push(model_score);
        }

        if episodes_played == 0 {
            return Err(AgentError::TrainingAborted(format!(
                "epoch {epoch}: every episode failed, game servers presumed lost"
            )));
        }

        let best = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        log::info!(
            "epoch {epoch} complete: {episodes_played}/{} episodes played, best score {best:.3}",
            population.len() * maps.len()
        );

        let ranked = rank_population(population, &scores);
        population = mutator.mutate(ranked)?;
    }

    Ok(population)
}

/// Play one episode of `map` with `model`, then train the model on its own
/// trajectory. Returns the summed reward.
async fn play_episode(
    model: &mut ModelWrapper,
    map: &GameMap,
    max_steps: usize,
    cm: &mut ConnectionManager,
) -> Result<f64> {
    let mut obs = cm.start_episode(&map.id).await?;
    let mut samples: Vec<TrainSample> = Vec::new();
    let mut total_reward = 0.0;

    for _ in 0..max_steps {
        let chosen = model.evaluate(&obs)?;
        let outcome = cm.step(&map.id, chosen).await?;
        total_reward += outcome.reward;
        samples.push(TrainSample {
            observation: obs,
            chosen,
            reward: outcome.reward,
        });
        if outcome.done {
            break;
        }
        obs = outcome.observation;
    }

    // A trajectory with no reward signal carries a zero gradient; skip it.
    if samples.iter().any(|s| s.reward != 0.0) {
        let loss = model.train_step(&samples)?;
        log::debug!("map {}: trained on {} steps, loss {loss:.4}", map.id, samples.len());
    }

    Ok(total_reward)
}

/// Reorder the population best-first by score; equal scores keep their
/// original index order so mutation stays reproducible.
fn rank_population(population: Vec<ModelWrapper>, scores: &[f64]) -> Vec<ModelWrapper> {
    let mut indexed: Vec<(usize, ModelWrapper)> = population.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| {
        scores[b.0]
            .partial_cmp(&scores[a.0])
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    indexed.into_iter().map(|(_, model)| model).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::NetConfig;
    use crate::training::{MutationProportions, Mutator, MutatorConfig};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn net_config() -> NetConfig {
        NetConfig {
            feature_dim: 3,
            hidden_dims: vec![8],
            dropout: 0.0,
            learning_rate: 1e-2,
        }
    }

    fn rank_order(scores: &[f64]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });
        order
    }

    #[test]
    fn ranking_is_best_first_and_stable() {
        assert_eq!(rank_order(&[1.0, 3.0, 2.0]), vec![1, 2, 0]);
        // ties keep original population order
        assert_eq!(rank_order(&[2.0, 2.0, 2.0]), vec![0, 1, 2]);
        assert_eq!(
            rank_order(&[f64::NEG_INFINITY, 1.0, f64::NEG_INFINITY]),
            vec![1, 0, 2]
        );
    }

    #[test]
    fn rank_population_reorders_models() {
        let pop: Vec<ModelWrapper> = (0..3)
            .map(|_| ModelWrapper::new(net_config()).unwrap())
            .collect();
        let snapshots: Vec<ModelWrapper> =
            pop.iter().map(|w| w.clone_into_new().unwrap()).collect();

        let ranked = rank_population(pop, &[0.5, 2.0, 1.0]);
        assert!(ranked[0].params_allclose(&snapshots[1]));
        assert!(ranked[1].params_allclose(&snapshots[2]));
        assert!(ranked[2].params_allclose(&snapshots[0]));
    }

    #[tokio::test]
    async fn all_endpoints_lost_aborts_training() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut cm = ConnectionManager::new(
            vec![format!("ws://{addr}")],
            Duration::from_millis(200),
        )
        .unwrap();

        let population = vec![ModelWrapper::new(net_config()).unwrap()];
        let mutator = Mutator::new(
            MutatorConfig {
                proportions: MutationProportions {
                    n_tops: 1,
                    averaged_n_tops: 0,
                    n_averaged_all: 0,
                    random_n_tops_averaged_mutations: 0,
                    random_all_averaged_mutations: 0,
                },
                mutation_volume: 0.2,
                mutation_freq: 0.2,
            },
            net_config(),
        );
        let maps = vec![GameMap {
            id: "m1".to_string(),
            name: "Unreachable".to_string(),
        }];
        let run = RunConfig {
            epochs: 1,
            max_steps: 1,
        };

        let err = r_learn(&run, population, &maps, &mutator, &mut cm)
            .await
            .unwrap_err();
        assert_matches!(err, AgentError::TrainingAborted(_));
        cm.close().await;
    }

    #[tokio::test]
    async fn empty_population_is_rejected() {
        let mut cm = ConnectionManager::new(
            vec!["ws://localhost:9000".to_string()],
            Duration::from_millis(200),
        )
        .unwrap();
        let mutator = Mutator::new(
            MutatorConfig {
                proportions: MutationProportions {
                    n_tops: 0,
                    averaged_n_tops: 0,
                    n_averaged_all: 0,
                    random_n_tops_averaged_mutations: 0,
                    random_all_averaged_mutations: 0,
                },
                mutation_volume: 0.2,
                mutation_freq: 0.2,
            },
            net_config(),
        );
        let maps = vec![GameMap {
            id: "m1".to_string(),
            name: "Any".to_string(),
        }];
        let run = RunConfig {
            epochs: 1,
            max_steps: 1,
        };

        let err = r_learn(&run, vec![], &maps, &mutator, &mut cm)
            .await
            .unwrap_err();
        assert_matches!(err, AgentError::Configuration(_));
    }
}
