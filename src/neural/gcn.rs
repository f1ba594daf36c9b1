use tch::IndexOp;
use tch::{nn, Kind, Tensor};

use crate::agent::protocol::GraphObs;

const DEFAULT_HIDDEN: &[i64] = &[64, 64];

#[derive(Debug)]
pub struct GraphLayer {
    w_self: nn::Linear,
    w_neigh: nn::Linear,
    ln: nn::LayerNorm, // LayerNorm instead of BatchNorm for graph-friendly normalization
    use_residual: bool,
}

impl GraphLayer {
    pub fn new(path: &nn::Path<'_>, in_dim: i64, out_dim: i64) -> Self {
        let w_self = nn::linear(path / "self", in_dim, out_dim, Default::default());
        let w_neigh = nn::linear(path / "neigh", in_dim, out_dim, Default::default());
        // LayerNorm normalizes over the feature dimension, per node
        let ln = nn::layer_norm(
            path / "ln",
            vec![out_dim],
            nn::LayerNormConfig {
                eps: 1e-5,
                ..Default::default()
            },
        );
        let use_residual = in_dim == out_dim;
        Self {
            w_self,
            w_neigh,
            ln,
            use_residual,
        }
    }

    pub fn forward(&self, x: &Tensor, adj: &Tensor, train: bool, dropout: f64) -> Tensor {
        let residual = if self.use_residual {
            Some(x.shallow_clone())
        } else {
            None
        };

        let self_term = x.apply(&self.w_self);
        let neigh_msg = x.apply(&self.w_neigh);
        let batch_size = x.size()[0];
        let adj_exp = adj.unsqueeze(0).expand([batch_size, -1, -1], false);
        let neigh_agg = adj_exp.bmm(&neigh_msg);

        let mut out = self_term + neigh_agg;
        out = out.apply(&self.ln);

        if let Some(res) = residual {
            out = out + res;
        }

        out = out.relu();

        if train && dropout > 0.0 {
            out = out.dropout(dropout, train);
        }

        out
    }
}

/// Graph convolutional scorer over a symbolic-execution state graph.
///
/// A stack of message-passing layers followed by a linear head that emits one
/// logit per node. Unlike a fixed-board GNN, the adjacency is rebuilt from
/// every observation's edge list, so the network handles graphs of any size.
#[derive(Debug)]
pub struct StateGcn {
    layers: Vec<GraphLayer>,
    head: nn::Linear,
    dropout: f64,
}

impl StateGcn {
    pub fn new(vs: &nn::VarStore, input_dim: i64, hidden_dims: &[i64], dropout: f64) -> Self {
        let p = vs.root();
        let mut layers = Vec::new();
        let mut dims = Vec::from(hidden_dims);
        if dims.is_empty() {
            dims.extend_from_slice(DEFAULT_HIDDEN);
        }

        let mut in_dim = input_dim;
        for (idx, &out_dim) in dims.iter().enumerate() {
            let layer =
                GraphLayer::new(&(p.clone() / format!("graph_layer_{idx}")), in_dim, out_dim);
            layers.push(layer);
            in_dim = out_dim;
        }

        let head = nn::linear(p / "score_head", in_dim, 1, Default::default());

        Self {
            layers,
            head,
            dropout,
        }
    }

    /// Score every node of the observation; returns logits of shape `[n]`.
    pub fn forward(&self, obs: &GraphObs, train: bool) -> Tensor {
        let x = node_features_to_tensor(obs);
        let adj = build_normalized_adjacency(obs);
        let mut h = x;
        for layer in &self.layers {
            h = layer.forward(&h, &adj, train, self.dropout);
        }
        h.apply(&self.head).squeeze_dim(-1).squeeze_dim(0)
    }
}

fn node_features_to_tensor(obs: &GraphObs) -> Tensor {
    let n = obs.nodes.len() as i64;
    let f = obs.nodes[0].len() as i64;
    let flat: Vec<f32> = obs.nodes.iter().flatten().copied().collect();
    Tensor::from_slice(&flat).reshape([1, n, f])
}

fn build_normalized_adjacency(obs: &GraphObs) -> Tensor {
    let n = obs.nodes.len() as i64;
    let adj = Tensor::zeros([n, n], (Kind::Float, tch::Device::Cpu));
    for &(src, dst) in &obs.edges {
        let _ = adj.i((src, dst)).fill_(1.0);
        let _ = adj.i((dst, src)).fill_(1.0);
    }
    for idx in 0..n {
        let _ = adj.i((idx, idx)).fill_(1.0);
    }
    // Symmetric normalization: D^(-1/2) * A * D^(-1/2)
    let degree = adj.sum_dim_intlist([1].as_ref(), false, Kind::Float);
    let degree_inv_sqrt = degree.pow_tensor_scalar(-0.5);
    let degree_inv_sqrt = degree_inv_sqrt.masked_fill(&degree_inv_sqrt.isinf(), 0.0);
    let d_inv_sqrt_left = degree_inv_sqrt.unsqueeze(1);
    let d_inv_sqrt_right = degree_inv_sqrt.unsqueeze(0);
    &adj * &d_inv_sqrt_left * &d_inv_sqrt_right
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn sample_obs() -> GraphObs {
        GraphObs {
            nodes: vec![
                vec![1.0, 0.0, 0.5],
                vec![0.0, 1.0, 0.5],
                vec![0.0, 0.0, 1.0],
                vec![1.0, 1.0, 0.0],
            ],
            edges: vec![(0, 1), (1, 2), (2, 3)],
        }
    }

    #[test]
    fn forward_emits_one_logit_per_node() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = StateGcn::new(&vs, 3, &[16, 16], 0.1);
        let logits = net.forward(&sample_obs(), false);
        assert_eq!(logits.size(), vec![4]);
    }

    #[test]
    fn adjacency_is_symmetric_and_finite() {
        let adj = build_normalized_adjacency(&sample_obs());
        let diff: f64 = (&adj - adj.transpose(0, 1))
            .abs()
            .sum(Kind::Float)
            .double_value(&[]);
        assert!(diff < 1e-6);
        assert_eq!(adj.isinf().any().int64_value(&[]), 0);
        assert_eq!(adj.isnan().any().int64_value(&[]), 0);
    }

    #[test]
    fn forward_handles_graphs_of_different_sizes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = StateGcn::new(&vs, 2, &[8], 0.0);

        let small = GraphObs {
            nodes: vec![vec![0.0, 1.0]],
            edges: vec![],
        };
        let large = GraphObs {
            nodes: (0..17).map(|i| vec![i as f32, 1.0]).collect(),
            edges: (0..16).map(|i| (i, i + 1)).collect(),
        };

        assert_eq!(net.forward(&small, false).size(), vec![1]);
        assert_eq!(net.forward(&large, false).size(), vec![17]);
    }
}
