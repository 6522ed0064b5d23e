use serde::{Deserialize, Serialize};
use anyhow::Result;
use crate::sim_params::{GridSizing, SimParams};
use crate::vecmath::Vec3;
use std::path::Path;

/// Behaviour of one axis of the simulation volume at its two faces.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryType {
    /// Molecules bounce back into the volume.
    #[default]
    Reflect,
    /// Molecules leaving one face re-enter through the opposite face.
    Periodic,
    /// Molecules leaving the volume are removed.
    Absorb,
    /// Molecules may leave the volume and keep diffusing outside it.
    Transparent,
}

// Configuration for the simulation volume
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UniverseConfig {
    /// Number of spatial dimensions (1, 2 or 3).
    pub dim: usize,
    pub low: Vec<f64>,
    pub high: Vec<f64>,
    /// One entry per axis; missing entries default to `reflect`.
    #[serde(default)]
    pub boundaries: Vec<BoundaryType>,
}

// Configuration for timing
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimingConfig {
    pub dt: f64,
    pub total_time: f64,
    pub record_interval: f64,
}

// Spatial partitioning; `box_size` wins over `molecules_per_box` when both are set
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GridConfig {
    #[serde(default = "default_molecules_per_box")]
    pub molecules_per_box: f64,
    #[serde(default)]
    pub box_size: Option<f64>,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig { molecules_per_box: default_molecules_per_box(), box_size: None }
    }
}

fn default_molecules_per_box() -> f64 {
    4.0
}

// One molecular species. Diffusion coefficients are per state class.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SpeciesConfig {
    pub name: String,
    /// Diffusion coefficient in solution.
    #[serde(default)]
    pub difc: f64,
    /// Diffusion coefficient while bound to a surface; defaults to `difc`.
    #[serde(default)]
    pub difc_surface: Option<f64>,
    /// Constant drift velocity applied to solution molecules.
    #[serde(default)]
    pub drift: Option<Vec<f64>>,
    /// Row-major square-root diffusion matrix for anisotropic diffusion.
    #[serde(default)]
    pub diffusion_matrix: Option<Vec<Vec<f64>>>,
}

/// Product placement for reactions, written as an inline table, e.g.
/// `product_placement = { policy = "pgem", probability = 0.2 }`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum PlacementConfig {
    Irreversible,
    Confspread { radius: f64 },
    Bounce {
        #[serde(default)]
        separation: Option<f64>,
    },
    Pgem { probability: f64 },
    Ratio { ratio: f64 },
    Unbindrad { radius: f64 },
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ZeroOrderLocus {
    #[default]
    System,
    Surface,
}

// One reaction definition. Reactants and products are `name` or `name(state)`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReactionConfig {
    pub name: String,
    #[serde(default)]
    pub reactants: Vec<String>,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub rate: Option<f64>,
    /// Explicit per-collision (order 2) or per-step (order 1) probability.
    #[serde(default)]
    pub probability: Option<f64>,
    /// Explicit capture radius for order-2 reactions; overrides `rate`.
    #[serde(default)]
    pub capture_radius: Option<f64>,
    #[serde(default = "default_multiplicity")]
    pub multiplicity: u32,
    #[serde(default)]
    pub product_placement: Option<PlacementConfig>,
    #[serde(default)]
    pub locus: ZeroOrderLocus,
}

fn default_multiplicity() -> u32 {
    1
}

// A batch of molecules placed before the first step
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct InitialMoleculesConfig {
    pub species: String,
    pub count: u32,
    /// Exact position for every molecule of the batch.
    #[serde(default)]
    pub position: Option<Vec<f64>>,
    /// Sub-region for uniform placement; defaults to the whole volume.
    #[serde(default)]
    pub low: Option<Vec<f64>>,
    #[serde(default)]
    pub high: Option<Vec<f64>>,
}

// Initial conditions for the simulation, loaded from config.toml
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct InitialConditions {
    pub seed: u64,
    /// Hard ceiling on simultaneously allocated molecules.
    #[serde(default)]
    pub max_molecules: Option<usize>,
    #[serde(default)]
    pub molecules: Vec<InitialMoleculesConfig>,
}

// Configuration for output settings, loaded from config.toml
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    pub base_filename: String,
    pub save_positions: bool,
    pub save_stats: bool,
    #[serde(default)]
    pub save_positions_in_snapshot: bool,
    pub format: Option<String>, // Output format: "json", "bincode", "messagepack"
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            base_filename: "rdsim".to_string(),
            save_positions: false,
            save_stats: false,
            save_positions_in_snapshot: false,
            format: None,
        }
    }
}

// Main simulation configuration structure, loaded from config.toml.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SimulationConfig {
    pub universe: UniverseConfig,
    pub timing: TimingConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub species: Vec<SpeciesConfig>,
    #[serde(default)]
    pub reactions: Vec<ReactionConfig>,
    pub initial_conditions: InitialConditions,
    #[serde(default)]
    pub output: OutputConfig,
}

impl SimulationConfig {
    /// Loads the simulation configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path_ref.display(), e))
    }

    /// Parses and validates a configuration held in memory.
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: SimulationConfig = toml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not need the engine's type system.
    pub fn validate(&self) -> Result<()> {
        let u = &self.universe;
        if !(1..=3).contains(&u.dim) {
            anyhow::bail!("universe.dim must be 1, 2 or 3 (got {}).", u.dim);
        }
        if u.low.len() != u.dim || u.high.len() != u.dim {
            anyhow::bail!("universe.low and universe.high must have {} entries.", u.dim);
        }
        if u.boundaries.len() > u.dim {
            anyhow::bail!("universe.boundaries has more entries than dimensions.");
        }
        if self.get_sim_params().is_degenerate() {
            anyhow::bail!("universe.high must exceed universe.low on every axis.");
        }
        if !(self.timing.dt > 0.0) {
            anyhow::bail!("timing.dt must be positive.");
        }
        if self.timing.total_time < 0.0 {
            anyhow::bail!("timing.total_time must not be negative.");
        }
        if let Some(size) = self.grid.box_size {
            if !(size > 0.0) {
                anyhow::bail!("grid.box_size must be positive.");
            }
        } else if !(self.grid.molecules_per_box > 0.0) {
            anyhow::bail!("grid.molecules_per_box must be positive.");
        }
        for species in &self.species {
            if species.name.is_empty() {
                anyhow::bail!("species names must not be empty.");
            }
            if species.difc < 0.0 || species.difc_surface.is_some_and(|d| d < 0.0) {
                anyhow::bail!("species '{}' has a negative diffusion coefficient.", species.name);
            }
        }
        for rxn in &self.reactions {
            if rxn.reactants.len() > 2 {
                anyhow::bail!("reaction '{}' has more than two reactants.", rxn.name);
            }
            if rxn.rate.is_some_and(|r| r < 0.0) {
                anyhow::bail!("reaction '{}' has a negative rate.", rxn.name);
            }
        }
        Ok(())
    }

    /// Converts the configuration into simulation parameters used at runtime.
    pub fn get_sim_params(&self) -> SimParams {
        let u = &self.universe;
        let mut boundaries = [BoundaryType::Reflect; 3];
        for (axis, b) in u.boundaries.iter().enumerate().take(3) {
            boundaries[axis] = *b;
        }

        let grid_sizing = match self.grid.box_size {
            Some(size) => GridSizing::BoxSize(size),
            None => GridSizing::MoleculesPerBox(self.grid.molecules_per_box),
        };

        SimParams {
            dim: u.dim,
            low: Vec3::from_slice(&u.low),
            high: Vec3::from_slice(&u.high),
            boundaries,
            dt: self.timing.dt,
            time_step: 0,
            grid_sizing,
            seed: self.initial_conditions.seed,
            max_molecules: self.initial_conditions.max_molecules,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [universe]
        dim = 2
        low = [0.0, 0.0]
        high = [10.0, 5.0]
        boundaries = ["periodic"]

        [timing]
        dt = 0.01
        total_time = 1.0
        record_interval = 0.1

        [[species]]
        name = "A"
        difc = 1.0

        [[reactions]]
        name = "decay"
        reactants = ["A"]
        products = []
        rate = 0.5
        product_placement = { policy = "pgem", probability = 0.3 }

        [initial_conditions]
        seed = 7
    "#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = SimulationConfig::from_toml_str(MINIMAL).expect("config should parse");
        assert_eq!(config.grid.molecules_per_box, 4.0);
        assert_eq!(config.reactions[0].multiplicity, 1);
        assert_eq!(
            config.reactions[0].product_placement,
            Some(PlacementConfig::Pgem { probability: 0.3 })
        );

        let params = config.get_sim_params();
        assert_eq!(params.dim, 2);
        assert_eq!(params.boundaries[0], BoundaryType::Periodic);
        assert_eq!(params.boundaries[1], BoundaryType::Reflect);
        assert_eq!(params.high, Vec3::new(10.0, 5.0, 0.0));
        assert_eq!(params.grid_sizing, GridSizing::MoleculesPerBox(4.0));
    }

    #[test]
    fn rejects_bad_dimension_timestep_and_volume() {
        let bad_dim = MINIMAL.replace("dim = 2", "dim = 4");
        assert!(SimulationConfig::from_toml_str(&bad_dim).is_err());

        let bad_dt = MINIMAL.replace("dt = 0.01", "dt = 0.0");
        assert!(SimulationConfig::from_toml_str(&bad_dt).is_err());

        let flat = MINIMAL.replace("high = [10.0, 5.0]", "high = [10.0, 0.0]");
        assert!(SimulationConfig::from_toml_str(&flat).is_err());
    }
}
