pub mod connection;
pub mod protocol;

pub use connection::{ConnectionManager, StepOutcome};
pub use protocol::{GameMap, GraphObs};
