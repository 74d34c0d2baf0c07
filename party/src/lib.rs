pub mod config;
pub mod coordinator;
pub mod data;
mod error;
pub mod session;
pub mod strategy;
pub mod training;

pub use config::PartyConfig;
pub use coordinator::{BatchReport, PartyCoordinator, Phase};
pub use error::{PartyErr, Result};
pub use strategy::RoleStrategy;
pub use training::{TrainingLoop, TrainingState};
