//! Runtime configuration for the coordination core.

mod settings;

pub use settings::{
    ConflictConfig, DecompositionConfig, DistributionConfig, MeshConfig, NegotiationConfig,
    ScoringConfig,
};
