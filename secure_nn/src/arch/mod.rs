mod recipe;
mod topology;

pub use recipe::{Block, Recipe};
pub use topology::{ArchSpec, Hyper, HyperOverrides, Topology};
