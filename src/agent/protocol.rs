//! Wire protocol spoken with the game server.
//!
//! Every frame is a JSON-encoded, `type`-tagged message. The server owns the
//! symbolic-execution engine; the agent only ever sees the current state graph
//! and answers with the id of the node it wants expanded next.

use serde::{Deserialize, Serialize};

use crate::{AgentError, Result};

/// Descriptor of an evaluation environment served by the game server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMap {
    pub id: String,
    pub name: String,
}

/// Snapshot of the symbolic-execution state graph.
///
/// `nodes` is a dense feature matrix (one row per state), `edges` an
/// undirected edge list over row indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphObs {
    pub nodes: Vec<Vec<f32>>,
    pub edges: Vec<(i64, i64)>,
}

impl GraphObs {
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Check the graph is non-empty, rectangular with `feature_dim` columns,
    /// and that every edge endpoint is a valid row index.
    pub fn validate(&self, feature_dim: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(AgentError::Protocol(
                "observation contains no graph nodes".to_string(),
            ));
        }
        for (idx, row) in self.nodes.iter().enumerate() {
            if row.len() != feature_dim {
                return Err(AgentError::Protocol(format!(
                    "node {} has {} features, expected {}",
                    idx,
                    row.len(),
                    feature_dim
                )));
            }
        }
        let n = self.nodes.len() as i64;
        for &(src, dst) in &self.edges {
            if src < 0 || dst < 0 || src >= n || dst >= n {
                return Err(AgentError::Protocol(format!(
                    "edge ({src}, {dst}) out of range for {n} nodes"
                )));
            }
        }
        Ok(())
    }
}

/// Requests the agent sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    GetAllMaps,
    Start { map_id: String },
    Step { map_id: String, state_id: i64 },
}

/// Replies the server sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Maps {
        maps: Vec<GameMap>,
    },
    GameState {
        observation: GraphObs,
    },
    StepResult {
        observation: GraphObs,
        reward: f64,
        done: bool,
    },
    ServerError {
        message: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AgentError::Protocol(format!("failed to encode request: {e}")))
    }
}

impl ServerMessage {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| AgentError::Protocol(format!("malformed server reply: {e}")))
    }
}
