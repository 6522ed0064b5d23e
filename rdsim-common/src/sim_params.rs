use serde::{Deserialize, Serialize};
use crate::config::BoundaryType;
use crate::vecmath::Vec3;

/// How the spatial grid chooses its box size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GridSizing {
    /// Aim for roughly this many molecules per box.
    MoleculesPerBox(f64),
    /// Use this box side length on every active axis.
    BoxSize(f64),
}

/// Simulation parameters derived from the configuration, used frequently during simulation steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    // World & Grid
    pub dim: usize,
    pub low: Vec3,
    pub high: Vec3,
    pub boundaries: [BoundaryType; 3],
    pub grid_sizing: GridSizing,

    // Time
    pub dt: f64,
    pub time_step: u64, // Current simulation step number

    // Population
    pub seed: u64,
    pub max_molecules: Option<usize>,
}

impl SimParams {
    /// Side length of the system along `axis`.
    pub fn side(&self, axis: usize) -> f64 {
        self.high[axis] - self.low[axis]
    }

    /// Volume (area in 2D, length in 1D) of the system.
    pub fn volume(&self) -> f64 {
        (0..self.dim).map(|axis| self.side(axis)).product()
    }

    /// True when every active axis has a positive extent.
    pub fn is_degenerate(&self) -> bool {
        (0..self.dim).any(|axis| !(self.side(axis) > 0.0))
    }
}
