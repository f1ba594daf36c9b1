//! The trainable unit the population is made of.
//!
//! A [`ModelWrapper`] couples one VarStore-backed GCN, one Adam optimizer
//! bound to that store, and the policy-gradient loss into a single owner.
//! Wrappers never share parameters; the mutation operators below
//! (`clone_into_new`, `load_average_of`, `perturb`) always produce or edit
//! independently owned stores.

use std::path::Path;

use rand::RngExt;
use rand_distr::{Distribution, Normal};
use tch::nn::OptimizerConfig;
use tch::{nn, Device, IndexOp, Kind, Tensor};

use crate::agent::protocol::GraphObs;
use crate::neural::gcn::StateGcn;
use crate::{AgentError, Result};

/// Network construction parameters, shared by every member of a population.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Width of a node feature row
    pub feature_dim: i64,
    /// Hidden layer widths of the GCN stack
    pub hidden_dims: Vec<i64>,
    /// Dropout applied between graph layers during training
    pub dropout: f64,
    /// Adam learning rate
    pub learning_rate: f64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            feature_dim: 8,
            hidden_dims: vec![64, 64],
            dropout: 0.1,
            learning_rate: 1e-2,
        }
    }
}

/// One step of an episode trajectory, as consumed by [`ModelWrapper::train_step`].
#[derive(Debug, Clone)]
pub struct TrainSample {
    pub observation: GraphObs,
    pub chosen: i64,
    pub reward: f64,
}

#[derive(Debug)]
pub struct ModelWrapper {
    config: NetConfig,
    vs: nn::VarStore,
    net: StateGcn,
    optimizer: nn::Optimizer,
}

impl ModelWrapper {
    pub fn new(config: NetConfig) -> Result<Self> {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = StateGcn::new(&vs, config.feature_dim, &config.hidden_dims, config.dropout);
        let optimizer = nn::Adam::default().build(&vs, config.learning_rate)?;
        Ok(Self {
            config,
            vs,
            net,
            optimizer,
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Score the state graph and return the id of the node to expand next.
    /// No gradient side effects.
    pub fn evaluate(&self, obs: &GraphObs) -> Result<i64> {
        obs.validate(self.config.feature_dim as usize)?;
        let logits = tch::no_grad(|| self.net.forward(obs, false));
        Ok(logits.argmax(-1, false).int64_value(&[]))
    }

    /// One optimizer step over an episode trajectory.
    ///
    /// Reward-weighted cross-entropy: the log-probability of each chosen node
    /// is scaled by the reward the server paid for it. Returns the scalar loss.
    pub fn train_step(&mut self, batch: &[TrainSample]) -> Result<f64> {
        if batch.is_empty() {
            return Ok(0.0);
        }

        let mut total = Tensor::zeros([], tch::kind::FLOAT_CPU);
        for sample in batch {
            sample
                .observation
                .validate(self.config.feature_dim as usize)?;
            let n = sample.observation.num_nodes() as i64;
            if sample.chosen < 0 || sample.chosen >= n {
                return Err(AgentError::Protocol(format!(
                    "chosen node {} out of range for {n} nodes",
                    sample.chosen
                )));
            }
            let logits = self.net.forward(&sample.observation, true);
            let logp = logits.log_softmax(-1, Kind::Float);
            let chosen_logp = logp.i(sample.chosen);
            total = total - chosen_logp * sample.reward;
        }
        let loss = total / (batch.len() as f64);
        let loss_value = loss.double_value(&[]);

        if !loss_value.is_finite() {
            log::error!("non-finite loss {loss_value}, skipping optimizer step");
            return Ok(loss_value);
        }

        self.optimizer.zero_grad();
        loss.backward();
        self.optimizer.step();

        Ok(loss_value)
    }

    /// Deep copy: a fresh wrapper whose parameters equal this one's.
    pub fn clone_into_new(&self) -> Result<ModelWrapper> {
        let mut child = ModelWrapper::new(self.config.clone())?;
        child.vs.copy(&self.vs)?;
        Ok(child)
    }

    /// Overwrite this wrapper's parameters with the elementwise average of
    /// the parents' parameters.
    pub fn load_average_of(&mut self, parents: &[&ModelWrapper]) -> Result<()> {
        if parents.is_empty() {
            return Err(AgentError::Configuration(
                "cannot average an empty parent set".to_string(),
            ));
        }
        tch::no_grad(|| -> Result<()> {
            for (name, mut tensor) in self.vs.variables() {
                let mut acc = Tensor::zeros_like(&tensor);
                for parent in parents {
                    let vars = parent.vs.variables();
                    let src = vars.get(&name).ok_or_else(|| {
                        AgentError::Configuration(format!(
                            "population member is missing parameter {name}"
                        ))
                    })?;
                    acc = acc + src;
                }
                tensor.copy_(&(acc / parents.len() as f64));
            }
            Ok(())
        })
    }

    /// Add sparse Gaussian noise to every parameter tensor: each element is
    /// touched with probability `freq` and shifted by N(0, volume).
    pub fn perturb(&mut self, volume: f64, freq: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&freq) {
            return Err(AgentError::Configuration(format!(
                "mutation frequency {freq} outside [0, 1]"
            )));
        }
        let normal = Normal::new(0.0, volume).map_err(|e| {
            AgentError::Configuration(format!("invalid mutation volume {volume}: {e}"))
        })?;
        let mut rng = rand::rng();
        tch::no_grad(|| -> Result<()> {
            for (_name, mut tensor) in self.vs.variables() {
                let mut noise = vec![0f32; tensor.numel()];
                let mut touched = false;
                for value in noise.iter_mut() {
                    if rng.random_bool(freq) {
                        *value = normal.sample(&mut rng) as f32;
                        touched = true;
                    }
                }
                if touched {
                    let noise_t = Tensor::from_slice(&noise).reshape(tensor.size());
                    let _ = tensor.f_add_(&noise_t)?;
                }
            }
            Ok(())
        })
    }

    /// Parameter-level equality, up to floating-point tolerance.
    pub fn params_allclose(&self, other: &ModelWrapper) -> bool {
        let mine = self.vs.variables();
        let theirs = other.vs.variables();
        if mine.len() != theirs.len() {
            return false;
        }
        mine.iter().all(|(name, tensor)| {
            theirs
                .get(name)
                .map(|o| tensor.size() == o.size() && tensor.allclose(o, 1e-5, 1e-7, false))
                .unwrap_or(false)
        })
    }

    /// Save the model weights to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.vs.save(path.as_ref())?;
        Ok(())
    }

    /// Load model weights previously written by [`save`](Self::save).
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.vs.load(path.as_ref())?;
        Ok(())
    }
}
