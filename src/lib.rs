//! Particle-based stochastic reaction-diffusion kernel.
//!
//! Molecules are points that diffuse with Gaussian steps and react when they
//! come close: unimolecular and zeroth order reactions fire with per-step
//! probabilities, bimolecular reactions fire when two reactants are within a
//! capture radius solved from the requested rate constant.

pub mod condition;
pub mod error;
pub mod grid;
pub mod molecule;
pub mod motion;
pub mod reaction;
pub mod simulation;
pub mod species;
pub mod stats;
pub mod surface;

pub use condition::{ConditionGraph, Structure, StructureCondition};
pub use error::{SimError, SimResult};
pub use grid::SpatialIndex;
pub use molecule::{MolId, Molecule, MoleculePool};
pub use reaction::{ProductPlacement, ReactionId, ReactionModel, ReversibilityPolicy, SolveContext};
pub use simulation::Simulation;
pub use species::{MolState, Species, SpeciesId, SpeciesRegistry, SpeciesState};
pub use surface::{AxisAlignedPanels, NoSurfaces, SurfaceGeometry};
