use serde::{Serialize, Deserialize};

/// Population of one (species, state) live list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesCount {
    pub species: String,
    pub state: String,
    pub count: usize,
}

/// Position record for one molecule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoleculeRecord {
    pub serial: u64,
    pub species: String,
    pub state: String,
    pub position: [f64; 3],
}

/// A snapshot of the simulation state and metrics at a specific time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The simulation time at which the snapshot was taken.
    pub time: f64,
    /// Number of completed steps.
    pub step: u64,
    /// The total number of live molecules.
    pub total_molecule_count: usize,
    /// Per (species, state) populations, in registration order.
    pub counts: Vec<SpeciesCount>,
    /// Cumulative number of times each reaction fired, indexed like the reaction table.
    pub reaction_events: Vec<(String, u64)>,
    #[serde(skip_serializing_if = "Option::is_none")] // Don't write "molecules": null
    pub molecules: Option<Vec<MoleculeRecord>>,
}
