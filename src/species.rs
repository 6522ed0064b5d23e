//! Species registry and molecule states.

use std::fmt;
use std::str::FromStr;

use rdsim_common::{SpeciesConfig, Vec3};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Index of a species. Id 0 is reserved for vacant molecule slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpeciesId(pub u32);

impl SpeciesId {
    pub const VACANT: SpeciesId = SpeciesId(0);

    pub fn is_vacant(self) -> bool {
        self == SpeciesId::VACANT
    }
}

/// Where a molecule lives: free in solution or bound to one side of a surface panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MolState {
    Solution,
    Front,
    Back,
    Up,
    Down,
}

impl MolState {
    pub const ALL: [MolState; 5] =
        [MolState::Solution, MolState::Front, MolState::Back, MolState::Up, MolState::Down];

    pub fn is_bound(self) -> bool {
        self != MolState::Solution
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MolState::Solution => "soln",
            MolState::Front => "front",
            MolState::Back => "back",
            MolState::Up => "up",
            MolState::Down => "down",
        }
    }
}

impl fmt::Display for MolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MolState {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "soln" | "solution" | "fsoln" => Ok(MolState::Solution),
            "front" => Ok(MolState::Front),
            "back" => Ok(MolState::Back),
            "up" => Ok(MolState::Up),
            "down" => Ok(MolState::Down),
            other => Err(SimError::InvalidParameter(format!("unknown molecule state '{}'", other))),
        }
    }
}

/// A species together with a state, the key of every live list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpeciesState {
    pub species: SpeciesId,
    pub state: MolState,
}

impl SpeciesState {
    pub fn new(species: SpeciesId, state: MolState) -> Self {
        SpeciesState { species, state }
    }

    pub fn soln(species: SpeciesId) -> Self {
        SpeciesState { species, state: MolState::Solution }
    }
}

/// Motion parameters of one (species, state).
#[derive(Debug, Clone, PartialEq)]
pub struct Motion {
    pub difc: f64,
    pub drift: Vec3,
    /// Square-root diffusion matrix, row major. `None` means isotropic.
    pub matrix: Option<[[f64; 3]; 3]>,
}

impl Motion {
    pub fn is_mobile(&self) -> bool {
        self.difc > 0.0
            || self.drift.length_squared() > 0.0
            || self.matrix.is_some_and(|m| m.iter().flatten().any(|&x| x != 0.0))
    }

    /// Isotropic diffusion coefficient with the same mean squared step in
    /// the active dimensions. With a matrix `M` this is `trace(M M^T) / dim`.
    pub fn effective_difc(&self, dim: usize) -> f64 {
        match self.matrix {
            Some(m) => {
                let dim = dim.clamp(1, 3);
                let sum: f64 = m[..dim].iter().flat_map(|row| &row[..dim]).map(|x| x * x).sum();
                sum / dim as f64
            }
            None => self.difc,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Species {
    pub name: String,
    pub difc: f64,
    pub difc_surface: f64,
    pub drift: Vec3,
    pub matrix: Option<[[f64; 3]; 3]>,
}

impl Species {
    pub fn new(name: &str, difc: f64) -> Self {
        Species {
            name: name.to_string(),
            difc,
            difc_surface: difc,
            drift: Vec3::zero(),
            matrix: None,
        }
    }

    pub fn motion(&self, state: MolState) -> Motion {
        if state.is_bound() {
            // bound molecules diffuse in the panel plane, no drift or anisotropy
            Motion { difc: self.difc_surface, drift: Vec3::zero(), matrix: None }
        } else {
            Motion { difc: self.difc, drift: self.drift, matrix: self.matrix }
        }
    }
}

impl TryFrom<&SpeciesConfig> for Species {
    type Error = SimError;

    fn try_from(cfg: &SpeciesConfig) -> SimResult<Self> {
        let mut species = Species::new(&cfg.name, cfg.difc);
        if let Some(ds) = cfg.difc_surface {
            species.difc_surface = ds;
        }
        if let Some(drift) = &cfg.drift {
            species.drift = Vec3::from_slice(drift);
        }
        if let Some(rows) = &cfg.diffusion_matrix {
            let mut m = [[0.0; 3]; 3];
            if rows.len() > 3 || rows.iter().any(|r| r.len() > 3) {
                return Err(SimError::InvalidParameter(format!(
                    "diffusion matrix of '{}' is larger than 3x3",
                    cfg.name
                )));
            }
            for (i, row) in rows.iter().enumerate() {
                for (j, v) in row.iter().enumerate() {
                    m[i][j] = *v;
                }
            }
            species.matrix = Some(m);
        }
        Ok(species)
    }
}

/// All species known to the simulation. Species may be added at any time;
/// ids are never reused.
#[derive(Debug, Clone, Default)]
pub struct SpeciesRegistry {
    // index 0 is the vacant placeholder
    species: Vec<Species>,
    by_name: FxHashMap<String, SpeciesId>,
}

impl SpeciesRegistry {
    pub fn new() -> Self {
        SpeciesRegistry {
            species: vec![Species::new("empty", 0.0)],
            by_name: FxHashMap::default(),
        }
    }

    /// Adds a species, or returns the existing id if the name is taken.
    pub fn add(&mut self, species: Species) -> SpeciesId {
        if let Some(id) = self.by_name.get(&species.name) {
            return *id;
        }
        let id = SpeciesId(self.species.len() as u32);
        self.by_name.insert(species.name.clone(), id);
        log::debug!("registered species '{}' as {:?}", species.name, id);
        self.species.push(species);
        id
    }

    pub fn id(&self, name: &str) -> SimResult<SpeciesId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| SimError::UnknownSpecies(name.to_string()))
    }

    pub fn get(&self, id: SpeciesId) -> SimResult<&Species> {
        if id.is_vacant() {
            return Err(SimError::UnknownSpecies("empty".to_string()));
        }
        self.species
            .get(id.0 as usize)
            .ok_or_else(|| SimError::UnknownSpecies(format!("#{}", id.0)))
    }

    pub fn get_mut(&mut self, id: SpeciesId) -> SimResult<&mut Species> {
        if id.is_vacant() {
            return Err(SimError::UnknownSpecies("empty".to_string()));
        }
        self.species
            .get_mut(id.0 as usize)
            .ok_or_else(|| SimError::UnknownSpecies(format!("#{}", id.0)))
    }

    pub fn name(&self, id: SpeciesId) -> &str {
        self.species.get(id.0 as usize).map(|s| s.name.as_str()).unwrap_or("?")
    }

    pub fn motion(&self, key: SpeciesState) -> SimResult<Motion> {
        Ok(self.get(key.species)?.motion(key.state))
    }

    /// Number of real species (excluding the vacant placeholder).
    pub fn len(&self) -> usize {
        self.species.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> impl Iterator<Item = SpeciesId> + '_ {
        (1..self.species.len()).map(|i| SpeciesId(i as u32))
    }

    /// Parses `name` or `name(state)` into a species/state key.
    pub fn parse(&self, text: &str) -> SimResult<SpeciesState> {
        let text = text.trim();
        let (name, state) = match text.find('(') {
            Some(open) => {
                let close = text.rfind(')').ok_or_else(|| {
                    SimError::InvalidParameter(format!("missing ')' in '{}'", text))
                })?;
                if close < open {
                    return Err(SimError::InvalidParameter(format!("malformed '{}'", text)));
                }
                (&text[..open], text[open + 1..close].parse::<MolState>()?)
            }
            None => (text, MolState::Solution),
        };
        Ok(SpeciesState::new(self.id(name.trim())?, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_assigns_stable_ids_and_parses_states() {
        let mut reg = SpeciesRegistry::new();
        let a = reg.add(Species::new("A", 1.0));
        let b = reg.add(Species::new("B", 0.5));
        assert_eq!(a, SpeciesId(1));
        assert_eq!(b, SpeciesId(2));
        assert_eq!(reg.add(Species::new("A", 9.0)), a);
        assert_eq!(reg.len(), 2);

        assert_eq!(reg.parse("A").unwrap(), SpeciesState::soln(a));
        assert_eq!(reg.parse(" B(front) ").unwrap(), SpeciesState::new(b, MolState::Front));
        assert!(matches!(reg.parse("C"), Err(SimError::UnknownSpecies(_))));
        assert!(reg.parse("A(sideways)").is_err());
    }

    #[test]
    fn bound_states_use_surface_diffusion_without_drift() {
        let mut s = Species::new("A", 2.0);
        s.difc_surface = 0.1;
        s.drift = Vec3::new(1.0, 0.0, 0.0);
        assert_eq!(s.motion(MolState::Solution).difc, 2.0);
        let bound = s.motion(MolState::Up);
        assert_eq!(bound.difc, 0.1);
        assert_eq!(bound.drift, Vec3::zero());
    }

    #[test]
    fn a_diffusion_matrix_alone_makes_a_species_mobile() {
        let mut s = Species::new("A", 0.0);
        assert!(!s.motion(MolState::Solution).is_mobile());
        s.matrix = Some([[1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 9.0]]);
        let motion = s.motion(MolState::Solution);
        assert!(motion.is_mobile());
        assert_eq!(motion.effective_difc(2), 2.5);
        assert_eq!(motion.effective_difc(3), 86.0 / 3.0);
        assert_eq!(s.motion(MolState::Front).effective_difc(2), 0.0);
    }
}
