pub mod driver;
pub mod mutation;

pub use driver::{r_learn, RunConfig};
pub use mutation::{MutationProportions, Mutator, MutatorConfig};
