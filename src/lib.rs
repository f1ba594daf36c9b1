//! # Symex Agent
//!
//! Training driver for graph neural networks that play a symbolic-execution
//! path-selection game against external game servers.
//!
//! The library couples two loops:
//!
//! - an inner, gradient-based loop: every model trains on the trajectories it
//!   collects while playing episodes on the server's maps;
//! - an outer, genetic-algorithm loop: after each epoch the population is
//!   ranked by score and reshaped by copying, averaging and perturbing the
//!   best performers.
//!
//! Game servers are reached over websockets; the wire protocol lives in
//! [`agent::protocol`], connection lifecycle in [`agent::connection`].

/// Game-server side: wire protocol and connection management
pub mod agent;

/// Neural network components (tch-based GCN and the trainable wrapper)
pub mod neural;

/// Population training: mutation operators and the epoch driver
pub mod training;

/// Logging setup
pub mod logging;

/// Main error type for the agent
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("training aborted: {0}")]
    TrainingAborted(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] tch::TchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AgentError>;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
