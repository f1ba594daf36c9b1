pub mod gcn;
pub mod wrapper;

pub use gcn::StateGcn;
pub use wrapper::{ModelWrapper, NetConfig, TrainSample};
