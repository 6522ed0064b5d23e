pub mod config;
pub mod sim_params;
pub mod snapshot;
pub mod vecmath;

// Re-export key types for easier use by dependent crates
pub use config::{
    BoundaryType, GridConfig, InitialConditions, InitialMoleculesConfig, OutputConfig,
    PlacementConfig, ReactionConfig, SimulationConfig, SpeciesConfig, TimingConfig,
    UniverseConfig, ZeroOrderLocus,
};
pub use sim_params::{GridSizing, SimParams};
pub use snapshot::{MoleculeRecord, Snapshot, SpeciesCount};
pub use vecmath::{clamp, Vec3};
