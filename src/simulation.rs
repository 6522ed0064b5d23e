use anyhow::Context;
use log::{debug, info, trace};
use rand::prelude::*;
use rand_distr::Poisson;
use rayon::prelude::*;
use rdsim_common::{
    MoleculeRecord, SimParams, SimulationConfig, Snapshot, SpeciesCount, Vec3, ZeroOrderLocus,
};
use rustc_hash::FxHashMap;

use crate::condition::{ConditionGraph, Structure, StructureCondition};
use crate::error::{SimError, SimResult};
use crate::grid::SpatialIndex;
use crate::molecule::{MolId, Molecule, MoleculePool};
use crate::motion::{apply_boundaries, displacement, stream_seed, uniform_point, Fate};
use crate::reaction::policy::{bounce, random_direction, reaction_point, separate};
use crate::reaction::{ProductPlacement, ReactionId, ReactionModel, ReversibilityPolicy, SolveContext};
use crate::species::{MolState, Motion, Species, SpeciesId, SpeciesRegistry, SpeciesState};
use crate::surface::{NoSurfaces, PanelId, SurfaceGeometry};

/// One reactant of a bimolecular event, seen from the first reactant's frame.
#[derive(Debug, Clone, Copy)]
struct Reactant {
    key: SpeciesState,
    /// Position in the frame of the pair (periodic image applied).
    pos: Vec3,
    prev: Vec3,
    /// Position in its own frame.
    own: Vec3,
    panel: Option<PanelId>,
}

impl Reactant {
    fn of(m: &Molecule, shift: Vec3) -> Self {
        Reactant { key: m.key(), pos: m.pos + shift, prev: m.pos_prev + shift, own: m.pos, panel: m.panel }
    }
}

/// Reaction-diffusion simulation of point molecules.
///
/// Derived data (motion tables, solved reaction parameters, the box grid) is
/// tracked by a [`ConditionGraph`]: setters downgrade the affected structure and
/// [`Simulation::refresh`] rebuilds whatever is stale before the next step.
pub struct Simulation {
    params: SimParams,
    species: SpeciesRegistry,
    reactions: ReactionModel,
    pool: MoleculePool,
    /// Built by the first refresh.
    grid: Option<SpatialIndex>,
    surfaces: Box<dyn SurfaceGeometry>,
    conditions: ConditionGraph,
    /// Host-side RNG for the serial reaction phases and placement.
    rng: StdRng,
    time: f64,
    motions: FxHashMap<SpeciesState, Motion>,
    /// Number of times each reaction fired.
    events: Vec<u64>,
    recorded_snapshots: Vec<Snapshot>,
    save_positions_in_snapshot: bool,
}

impl Simulation {
    /// Empty simulation over the volume described by `params`.
    pub fn new(params: SimParams) -> SimResult<Self> {
        if !(1..=3).contains(&params.dim) {
            return Err(SimError::InvalidParameter(format!("dimension {} must be 1, 2 or 3", params.dim)));
        }
        if let Some(axis) = (0..params.dim).find(|&a| !(params.side(a) > 0.0)) {
            return Err(SimError::DegenerateDomain { axis });
        }
        if !(params.dt > 0.0) {
            return Err(SimError::InvalidParameter(format!("time step {} must be positive", params.dt)));
        }
        Ok(Simulation {
            rng: StdRng::seed_from_u64(params.seed),
            pool: MoleculePool::new(params.max_molecules),
            params,
            species: SpeciesRegistry::new(),
            reactions: ReactionModel::new(),
            grid: None,
            surfaces: Box::new(NoSurfaces),
            conditions: ConditionGraph::new(),
            time: 0.0,
            motions: FxHashMap::default(),
            events: Vec::new(),
            recorded_snapshots: Vec::new(),
            save_positions_in_snapshot: false,
        })
    }

    /// Builds a ready-to-run simulation from a parsed configuration file.
    pub fn from_config(config: &SimulationConfig) -> anyhow::Result<Self> {
        let mut sim = Simulation::new(config.get_sim_params()).context("invalid simulation volume")?;
        sim.save_positions_in_snapshot = config.output.save_positions_in_snapshot;

        for cfg in &config.species {
            let species = Species::try_from(cfg).with_context(|| format!("species '{}'", cfg.name))?;
            sim.add_species(species);
        }
        for cfg in &config.reactions {
            let id = sim
                .reactions
                .register_config(cfg, &sim.species)
                .with_context(|| format!("reaction '{}'", cfg.name))?;
            debug!("Configured reaction '{}' as #{}", cfg.name, id);
        }
        sim.events.resize(sim.reactions.len(), 0);
        sim.conditions.downgrade(Structure::Reactions, StructureCondition::ListsValid);

        for batch in &config.initial_conditions.molecules {
            let key = sim.species.parse(&batch.species).with_context(|| format!("initial '{}'", batch.species))?;
            let count = batch.count as usize;
            if key.state.is_bound() {
                sim.add_surface_molecules(key, count)?;
            } else if let Some(pos) = &batch.position {
                let pos = Vec3::from_slice(pos);
                for _ in 0..count {
                    sim.add_molecule(key, pos)?;
                }
            } else {
                let low = batch.low.as_deref().map(Vec3::from_slice).unwrap_or(sim.params.low);
                let high = batch.high.as_deref().map(Vec3::from_slice).unwrap_or(sim.params.high);
                sim.add_molecules(key, count, low, high)?;
            }
        }
        info!("Placed {} initial molecules.", sim.pool.live_count());

        sim.refresh().context("failed to prepare the simulation")?;
        Ok(sim)
    }

    // --- Setup ---

    pub fn add_species(&mut self, species: Species) -> SpeciesId {
        let id = self.species.add(species);
        self.conditions.downgrade(Structure::Molecules, StructureCondition::ListsValid);
        id
    }

    /// Changes the solution diffusion coefficient of a species.
    pub fn set_diffusion(&mut self, species: SpeciesId, difc: f64) -> SimResult<()> {
        if !(difc >= 0.0) {
            return Err(SimError::InvalidParameter(format!("diffusion coefficient {} is negative", difc)));
        }
        self.species.get_mut(species)?.difc = difc;
        self.reactions.invalidate_all();
        self.conditions.downgrade(Structure::Molecules, StructureCondition::ParamsValid);
        Ok(())
    }

    pub fn set_dt(&mut self, dt: f64) -> SimResult<()> {
        if !(dt > 0.0) {
            return Err(SimError::InvalidParameter(format!("time step {} must be positive", dt)));
        }
        self.params.dt = dt;
        self.reactions.invalidate_all();
        self.conditions.downgrade(Structure::Reactions, StructureCondition::ParamsValid);
        Ok(())
    }

    pub fn set_surfaces(&mut self, surfaces: Box<dyn SurfaceGeometry>) {
        self.surfaces = surfaces;
        // surface-locus reactions scale with the total panel area
        self.reactions.invalidate_all();
        self.conditions.downgrade(Structure::Reactions, StructureCondition::ParamsValid);
        self.conditions.downgrade(Structure::Boxes, StructureCondition::Uninitialized);
    }

    /// Registers a reaction. Reactants and products are `name` or `name(state)`.
    pub fn add_reaction(&mut self, name: &str, reactants: &[&str], products: &[&str]) -> SimResult<ReactionId> {
        let parse = |names: &[&str]| names.iter().map(|n| self.species.parse(n)).collect::<SimResult<Vec<_>>>();
        let (reactants, products) = (parse(reactants)?, parse(products)?);
        let id = self.reactions.register(name, &reactants, &products)?;
        self.events.resize(self.reactions.len(), 0);
        self.conditions.downgrade(Structure::Reactions, StructureCondition::ListsValid);
        Ok(id)
    }

    pub fn set_rate(&mut self, id: ReactionId, rate: f64) -> SimResult<()> {
        self.reactions.set_rate(id, rate)?;
        self.conditions.downgrade(Structure::Reactions, StructureCondition::ParamsValid);
        Ok(())
    }

    pub fn set_policy(&mut self, id: ReactionId, policy: ReversibilityPolicy) -> SimResult<()> {
        self.reactions.set_policy(id, policy)?;
        self.conditions.downgrade(Structure::Reactions, StructureCondition::ParamsValid);
        Ok(())
    }

    pub fn set_probability(&mut self, id: ReactionId, probability: f64) -> SimResult<()> {
        self.reactions.set_probability(id, probability)?;
        self.conditions.downgrade(Structure::Reactions, StructureCondition::ParamsValid);
        Ok(())
    }

    pub fn set_capture_radius(&mut self, id: ReactionId, radius: f64) -> SimResult<()> {
        self.reactions.set_capture_radius(id, radius)?;
        self.conditions.downgrade(Structure::Reactions, StructureCondition::ParamsValid);
        Ok(())
    }

    /// Adds one molecule. It becomes visible to reactions after the next
    /// compaction (at the latest, the start of the next step).
    pub fn add_molecule(&mut self, key: SpeciesState, pos: Vec3) -> SimResult<MolId> {
        self.species.get(key.species)?;
        self.pool.allocate(key, pos, None)
    }

    /// Adds `count` molecules uniformly distributed in `[low, high]`.
    pub fn add_molecules(&mut self, key: SpeciesState, count: usize, low: Vec3, high: Vec3) -> SimResult<()> {
        self.species.get(key.species)?;
        self.pool.ensure_capacity(self.pool.live_count() + self.pool.pending_count() + count)?;
        for _ in 0..count {
            let pos = uniform_point(low, high, self.params.dim, &mut self.rng);
            self.pool.allocate(key, pos, None)?;
        }
        Ok(())
    }

    /// Adds `count` bound molecules on randomly chosen panels, weighted by area.
    pub fn add_surface_molecules(&mut self, key: SpeciesState, count: usize) -> SimResult<()> {
        self.species.get(key.species)?;
        if !key.state.is_bound() {
            return Err(SimError::InvalidParameter(format!("{:?} is not a surface-bound state", key.state)));
        }
        for _ in 0..count {
            let panel = self
                .random_panel()
                .ok_or_else(|| SimError::InvalidParameter("no surface panels to place molecules on".to_string()))?;
            let pos = self.surfaces.random_point(panel, &mut self.rng);
            self.pool.allocate(key, pos, Some(panel))?;
        }
        Ok(())
    }

    pub fn kill_molecule(&mut self, id: MolId) -> SimResult<()> {
        self.pool.get(id)?;
        self.pool.kill(id.index);
        Ok(())
    }

    // --- Refresh ---

    /// Brings every stale structure up to date and files pending molecules.
    pub fn refresh(&mut self) -> SimResult<()> {
        for structure in self.conditions.stale() {
            match structure {
                Structure::Molecules => self.refresh_motion(),
                Structure::Reactions => self.refresh_reactions()?,
                Structure::Boxes => self.refresh_boxes()?,
            }
            self.conditions.upgrade(structure, StructureCondition::Ready);
        }
        if self.pool.pending_count() > 0 {
            let grid = self.grid.as_mut().ok_or_else(|| SimError::InvariantViolation("grid missing".to_string()))?;
            self.pool.compact(grid)?;
            self.update_mobility();
        }
        Ok(())
    }

    fn refresh_motion(&mut self) {
        self.motions.clear();
        for id in self.species.ids() {
            if let Ok(species) = self.species.get(id) {
                for state in MolState::ALL {
                    self.motions.insert(SpeciesState::new(id, state), species.motion(state));
                }
            }
        }
        self.update_mobility();
        debug!("Motion table rebuilt for {} species.", self.species.len());
    }

    fn update_mobility(&mut self) {
        for list in 0..self.pool.lists().len() {
            let key = self.pool.list(list).key;
            let mobile = self.motions.get(&key).is_some_and(|m| m.is_mobile());
            self.pool.set_mobile(list, mobile);
        }
    }

    fn refresh_reactions(&mut self) -> SimResult<()> {
        let ctx = SolveContext {
            dim: self.params.dim,
            dt: self.params.dt,
            volume: self.params.volume(),
            surface_area: self.surfaces.total_area(),
            species: &self.species,
        };
        self.reactions.solve_all(&ctx)?;
        self.events.resize(self.reactions.len(), 0);
        Ok(())
    }

    fn refresh_boxes(&mut self) -> SimResult<()> {
        let min_side = self.reactions.max_capture_radius();
        let dim = self.params.dim;
        let fits = self.grid.as_ref().is_some_and(|g| {
            (0..dim).all(|axis| g.box_size()[axis] >= min_side || g.side_count()[axis] == 1)
        });
        if !fits {
            let population = self.pool.live_count();
            let mut grid = SpatialIndex::build(&self.params, population, min_side, self.pool.lists().len())?;
            self.pool.rebuild_membership(&mut grid)?;
            self.grid = Some(grid);
        }
        if let Some(grid) = self.grid.as_mut() {
            grid.assign_panels(self.surfaces.as_ref());
        }
        Ok(())
    }

    // --- Stepping ---

    /// Advances the simulation by one time step.
    pub fn step(&mut self) -> SimResult<()> {
        self.refresh()?;
        let mut grid = self
            .grid
            .take()
            .ok_or_else(|| SimError::InvariantViolation("grid missing".to_string()))?;
        let result = self.tick(&mut grid);
        self.grid = Some(grid);
        result?;
        self.update_mobility();
        self.params.time_step += 1;
        self.time += self.params.dt;
        Ok(())
    }

    fn tick(&mut self, grid: &mut SpatialIndex) -> SimResult<()> {
        // --- 1. Displacement (Parallel) ---
        self.diffuse();
        // --- 2. Box Reassignment ---
        let moved = self.pool.relocate(grid)?;
        trace!("{} molecules changed box", moved);
        // --- 3. Zeroth and First Order Reactions ---
        self.zeroth_order()?;
        self.first_order()?;
        // --- 4. Second Order Reactions ---
        self.second_order(grid)?;
        // --- 5. Compaction ---
        self.pool.compact(grid)?;
        Ok(())
    }

    fn diffuse(&mut self) {
        if !self.pool.lists().iter().any(|l| l.mobile) {
            return;
        }
        let params = &self.params;
        let motions = &self.motions;
        let surfaces = self.surfaces.as_ref();
        let tick = params.time_step;

        let outcomes: Vec<(u32, Fate)> = self
            .pool
            .slots_mut()
            .par_iter_mut()
            .enumerate()
            .filter_map(|(index, m)| {
                if m.is_vacant() {
                    return None;
                }
                let Some(motion) = motions.get(&m.key()).filter(|mo| mo.is_mobile()) else {
                    m.pos_prev = m.pos;
                    return None;
                };
                let mut rng = StdRng::seed_from_u64(stream_seed(params.seed, m.serial, tick));
                m.pos_prev = m.pos;
                let mut pos = m.pos + displacement(motion, params.dim, params.dt, &mut rng);
                if let Some(panel) = m.panel {
                    pos = surfaces.project(panel, pos);
                }
                let fate = apply_boundaries(&mut pos, params);
                m.pos = pos;
                Some((index as u32, fate))
            })
            .collect();

        for (index, fate) in outcomes {
            match fate {
                Fate::Kept => self.pool.mark_moved(index),
                Fate::Absorbed => self.pool.kill(index),
            }
        }
    }

    fn zeroth_order(&mut self) -> SimResult<()> {
        for id in self.reactions.zeroth_order().to_vec() {
            let Some(solved) = self.reactions.get(id).solved().copied() else {
                continue;
            };
            if !(solved.expected_events > 0.0) {
                continue;
            }
            let poisson = Poisson::new(solved.expected_events)
                .map_err(|e| SimError::InvalidParameter(format!("event rate {}: {}", solved.expected_events, e)))?;
            let n = poisson.sample(&mut self.rng) as u64;
            let locus = self.reactions.get(id).locus;
            let products = self.reactions.get(id).products.clone();
            for _ in 0..n {
                let (pos, panel) = match locus {
                    ZeroOrderLocus::System => {
                        (uniform_point(self.params.low, self.params.high, self.params.dim, &mut self.rng), None)
                    }
                    ZeroOrderLocus::Surface => {
                        let Some(panel) = self.random_panel() else {
                            break;
                        };
                        (self.surfaces.random_point(panel, &mut self.rng), Some(panel))
                    }
                };
                let spots = vec![pos; products.len()];
                let panels = vec![panel; products.len()];
                self.place_products(&products, &spots, &panels, &[])?;
                self.events[id] += 1;
            }
        }
        Ok(())
    }

    fn first_order(&mut self) -> SimResult<()> {
        let mut keys: Vec<SpeciesState> = self.reactions.first_order_keys().collect();
        keys.sort();
        for key in keys {
            let Some(list) = self.pool.list_of(key) else {
                continue;
            };
            let chain: Vec<(ReactionId, f64)> = self
                .reactions
                .first_order(key)
                .iter()
                .filter_map(|&id| self.reactions.get(id).solved().map(|s| (id, s.probability)))
                .filter(|(_, p)| *p > 0.0)
                .collect();
            if chain.is_empty() {
                continue;
            }
            // list membership only changes at compaction
            for k in 0..self.pool.list(list).len() {
                let index = self.pool.list(list).members()[k];
                if !self.pool.slot(index).is_active() {
                    continue;
                }
                for &(id, p) in &chain {
                    if self.rng.random::<f64>() < p {
                        self.fire_unimolecular(id, index)?;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn fire_unimolecular(&mut self, id: ReactionId, index: u32) -> SimResult<()> {
        let reaction = self.reactions.get(id);
        let products = reaction.products.clone();
        let placement = reaction.solved().map(|s| s.placement);
        let (pos, panel) = {
            let m = self.pool.slot(index);
            (m.pos, m.panel)
        };

        let mut spots = vec![pos; products.len()];
        if let Some(ProductPlacement::Separate { distance }) = placement {
            if products.len() >= 2 && distance > 0.0 {
                let (d1, d2) = (self.difc(products[0]), self.difc(products[1]));
                let direction = random_direction(self.params.dim, &mut self.rng);
                let (a, b) = separate(pos, direction, distance, d1, d2);
                spots[0] = a;
                spots[1] = b;
            }
        }
        let panels = vec![panel; products.len()];
        self.place_products(&products, &spots, &panels, &[index])?;
        self.events[id] += 1;
        Ok(())
    }

    fn second_order(&mut self, grid: &SpatialIndex) -> SimResult<()> {
        let period = grid.period();
        let mut pairs: Vec<((SpeciesState, SpeciesState), Vec<ReactionId>)> =
            self.reactions.reactive_pairs().map(|(k, ids)| (k, ids.to_vec())).collect();
        pairs.sort_by_key(|(k, _)| *k);

        for ((ka, kb), ids) in pairs {
            let (Some(la), Some(lb)) = (self.pool.list_of(ka), self.pool.list_of(kb)) else {
                continue;
            };
            let tests: Vec<(ReactionId, f64, f64)> = ids
                .iter()
                .filter_map(|&id| {
                    let s = self.reactions.get(id).solved()?;
                    Some((id, s.capture_radius * s.capture_radius, s.probability))
                })
                .filter(|(_, a2, p)| *a2 > 0.0 && *p > 0.0)
                .collect();
            let Some(reach) = tests.iter().map(|t| t.1).reduce(f64::max) else {
                continue;
            };
            let same = la == lb;

            for cell in 0..grid.len() {
                // (box, image shift, is the home box)
                let partners: Vec<(usize, Vec3, bool)> = std::iter::once((cell, Vec3::zero(), true))
                    .chain(
                        grid.neighbors(cell)
                            .iter()
                            .filter(|n| !same || n.forward)
                            .map(|n| (n.cell, n.wrap.shift(period), false)),
                    )
                    .collect();
                let home = grid.members(cell, la);
                for (ia, &i) in home.iter().enumerate() {
                    'partners: for &(other, shift, is_home) in &partners {
                        let candidates = grid.members(other, lb);
                        let start = if same && is_home { ia + 1 } else { 0 };
                        for &j in candidates.iter().skip(start) {
                            if !self.pool.slot(i).is_active() {
                                break 'partners;
                            }
                            if j == i || !self.pool.slot(j).is_active() {
                                continue;
                            }
                            let r2 = (self.pool.slot(j).pos + shift).distance_squared(self.pool.slot(i).pos);
                            if r2 > reach {
                                continue;
                            }
                            for &(id, a2, p) in &tests {
                                if r2 <= a2 && (p >= 1.0 || self.rng.random::<f64>() < p) {
                                    self.fire_bimolecular(id, i, j, shift)?;
                                    break 'partners;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn fire_bimolecular(&mut self, id: ReactionId, i: u32, j: u32, shift: Vec3) -> SimResult<()> {
        let reaction = self.reactions.get(id);
        let products = reaction.products.clone();
        let first_key = reaction.reactants[0];
        let Some(solved) = reaction.solved().copied() else {
            return Ok(());
        };
        let a = Reactant::of(self.pool.slot(i), Vec3::zero());
        let b = Reactant::of(self.pool.slot(j), shift);
        let (slots, r1, r2) = if a.key == first_key { ([i, j], a, b) } else { ([j, i], b, a) };
        let (d1, d2) = (self.difc(r1.key), self.difc(r2.key));
        let center = reaction_point(r1.pos, d1, r2.pos, d2);

        let mut spots = vec![center; products.len()];
        if products.len() >= 2 {
            match solved.placement {
                ProductPlacement::AtReactionPoint => {}
                ProductPlacement::Inherit => {
                    spots[0] = r1.own;
                    spots[1] = r2.own;
                }
                ProductPlacement::Separate { distance } => {
                    let (p1, p2) = (self.difc(products[0]), self.difc(products[1]));
                    let direction = random_direction(self.params.dim, &mut self.rng);
                    let (x, y) = separate(center, direction, distance, p1, p2);
                    spots[0] = x;
                    spots[1] = y;
                }
                ProductPlacement::Bounce { separation } => {
                    let relative_step = (r2.pos - r2.prev) - (r1.pos - r1.prev);
                    let (x, y) = bounce(
                        r1.pos,
                        d1,
                        r2.pos,
                        d2,
                        solved.capture_radius,
                        separation,
                        relative_step,
                        self.params.dim,
                        &mut self.rng,
                    );
                    spots[0] = x;
                    spots[1] = y;
                }
            }
        } else if products.len() == 1 && solved.placement == ProductPlacement::Inherit {
            spots[0] = r1.own;
        }

        let any_panel = r1.panel.or(r2.panel);
        let panels: Vec<Option<PanelId>> = (0..products.len())
            .map(|k| [r1.panel, r2.panel].get(k).copied().flatten().or(any_panel))
            .collect();
        self.place_products(&products, &spots, &panels, &slots)?;
        self.events[id] += 1;
        Ok(())
    }

    /// Writes products into reactant slots first, then into new slots.
    /// Reactant slots left over are killed.
    fn place_products(
        &mut self,
        products: &[SpeciesState],
        spots: &[Vec3],
        panels: &[Option<PanelId>],
        slots: &[u32],
    ) -> SimResult<()> {
        let mut used = [false; 2];
        for (k, &product) in products.iter().enumerate() {
            let panel = if product.state.is_bound() { panels[k] } else { None };
            let mut pos = spots[k];
            if let Some(p) = panel {
                pos = self.surfaces.project(p, pos);
            }
            if apply_boundaries(&mut pos, &self.params) == Fate::Absorbed {
                continue;
            }
            match slots.get(k) {
                Some(&slot) => {
                    self.pool.change_identity(slot, product, pos, panel);
                    used[k] = true;
                }
                None => {
                    self.pool.allocate(product, pos, panel)?;
                }
            }
        }
        for (k, &slot) in slots.iter().enumerate() {
            if !used[k] {
                self.pool.kill(slot);
            }
        }
        Ok(())
    }

    fn difc(&self, key: SpeciesState) -> f64 {
        self.motions.get(&key).map(|m| m.effective_difc(self.params.dim)).unwrap_or(0.0)
    }

    fn random_panel(&mut self) -> Option<PanelId> {
        let count = self.surfaces.panel_count();
        let total = self.surfaces.total_area();
        if count == 0 || !(total > 0.0) {
            return None;
        }
        let mut target = self.rng.random::<f64>() * total;
        for panel in 0..count as PanelId {
            target -= self.surfaces.area(panel);
            if target < 0.0 {
                return Some(panel);
            }
        }
        Some(count as PanelId - 1)
    }

    // --- Queries ---

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn step_count(&self) -> u64 {
        self.params.time_step
    }

    pub fn species(&self) -> &SpeciesRegistry {
        &self.species
    }

    pub fn reactions(&self) -> &ReactionModel {
        &self.reactions
    }

    pub fn grid(&self) -> Option<&SpatialIndex> {
        self.grid.as_ref()
    }

    pub fn molecule(&self, id: MolId) -> SimResult<&Molecule> {
        self.pool.get(id)
    }

    pub fn condition(&self, structure: Structure) -> StructureCondition {
        self.conditions.get(structure)
    }

    pub fn conditions(&self) -> &ConditionGraph {
        &self.conditions
    }

    /// Number of live molecules.
    pub fn molecule_count(&self) -> usize {
        self.pool.live_count()
    }

    pub fn count(&self, key: SpeciesState) -> usize {
        self.pool.count(key)
    }

    pub fn count_species(&self, species: SpeciesId) -> usize {
        self.pool.count_species(species)
    }

    /// How often each reaction has fired.
    pub fn reaction_events(&self, id: ReactionId) -> u64 {
        self.events.get(id).copied().unwrap_or(0)
    }

    /// Filed molecules within `radius` of `point`. Periodic images are not searched.
    pub fn molecules_within(&self, point: Vec3, radius: f64) -> Vec<MolId> {
        let Some(grid) = &self.grid else {
            return Vec::new();
        };
        let r2 = radius * radius;
        let mut out = Vec::new();
        for cell in grid.scan_radius(point, radius) {
            for list in 0..self.pool.lists().len() {
                for &index in grid.members(cell, list) {
                    let m = self.pool.slot(index);
                    if !m.is_vacant() && m.pos.distance_squared(point) <= r2 {
                        out.push(self.pool.id_of(index));
                    }
                }
            }
        }
        out
    }

    /// Positions of every live molecule.
    pub fn molecule_records(&self) -> Vec<MoleculeRecord> {
        self.pool
            .iter()
            .map(|(_, m)| MoleculeRecord {
                serial: m.serial,
                species: self.species.name(m.species).to_string(),
                state: m.state.as_str().to_string(),
                position: m.pos.to_array(),
            })
            .collect()
    }

    /// Verifies that lists, boxes and counts agree. Only valid between steps.
    pub fn check_consistency(&self) -> SimResult<()> {
        let grid = self.grid.as_ref().ok_or_else(|| SimError::InvariantViolation("grid missing".to_string()))?;
        self.pool.check_consistency(grid)?;
        if grid.occupancy() != self.pool.live_count() {
            return Err(SimError::InvariantViolation(format!(
                "{} molecules in boxes, {} live",
                grid.occupancy(),
                self.pool.live_count()
            )));
        }
        Ok(())
    }

    /// Collects per-species counts and reaction tallies as a Snapshot.
    pub fn record_snapshot(&mut self) -> SimResult<()> {
        debug!("Recording snapshot at t = {:.4e}...", self.time);
        let counts = self
            .pool
            .lists()
            .iter()
            .map(|l| SpeciesCount {
                species: self.species.name(l.key.species).to_string(),
                state: l.key.state.as_str().to_string(),
                count: self.pool.count(l.key),
            })
            .collect();
        let reaction_events = self
            .reactions
            .iter()
            .map(|(id, r)| (r.name.clone(), self.reaction_events(id)))
            .collect();
        let molecules = if self.save_positions_in_snapshot { Some(self.molecule_records()) } else { None };

        let snapshot = Snapshot {
            time: self.time,
            step: self.params.time_step,
            total_molecule_count: self.pool.live_count(),
            counts,
            reaction_events,
            molecules,
        };
        self.recorded_snapshots.try_reserve(1)?;
        self.recorded_snapshots.push(snapshot);
        Ok(())
    }

    pub fn get_recorded_snapshots(&self) -> &Vec<Snapshot> {
        &self.recorded_snapshots
    }

    pub fn set_save_positions_in_snapshot(&mut self, save: bool) {
        self.save_positions_in_snapshot = save;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::AxisAlignedPanels;
    use rdsim_common::{BoundaryType, GridSizing};

    fn params(dim: usize, side: f64, boundary: BoundaryType) -> SimParams {
        let mut high = Vec3::zero();
        for axis in 0..dim {
            high[axis] = side;
        }
        SimParams {
            dim,
            low: Vec3::zero(),
            high,
            boundaries: [boundary; 3],
            grid_sizing: GridSizing::MoleculesPerBox(4.0),
            dt: 0.01,
            time_step: 0,
            seed: 17,
            max_molecules: None,
        }
    }

    fn key(sim: &Simulation, name: &str) -> SpeciesState {
        sim.species().parse(name).unwrap()
    }

    #[test]
    fn rejects_degenerate_volume() {
        let mut p = params(2, 1.0, BoundaryType::Reflect);
        p.high.y = 0.0;
        assert!(matches!(Simulation::new(p), Err(SimError::DegenerateDomain { axis: 1 })));
    }

    #[test]
    fn conditions_follow_setters() {
        let mut sim = Simulation::new(params(3, 1.0, BoundaryType::Reflect)).unwrap();
        sim.add_species(Species::new("A", 1.0));
        assert_eq!(sim.condition(Structure::Molecules), StructureCondition::Uninitialized);
        sim.refresh().unwrap();
        assert!(sim.conditions().is_ready());

        let id = sim.add_reaction("decay", &["A"], &[]).unwrap();
        assert_eq!(sim.condition(Structure::Reactions), StructureCondition::ListsValid);
        assert_eq!(sim.condition(Structure::Molecules), StructureCondition::Ready);
        sim.refresh().unwrap();
        sim.set_rate(id, 2.0).unwrap();
        assert_eq!(sim.condition(Structure::Reactions), StructureCondition::ParamsValid);
        assert_eq!(sim.condition(Structure::Boxes), StructureCondition::ParamsValid);
        sim.refresh().unwrap();
        assert!(sim.reactions().is_solved());
    }

    #[test]
    fn setters_take_effect_on_the_next_step() {
        let mut sim = Simulation::new(params(3, 1.0, BoundaryType::Reflect)).unwrap();
        let species = sim.add_species(Species::new("A", 0.0));
        let id = sim.add_reaction("decay", &["A"], &[]).unwrap();
        sim.set_rate(id, 1.0).unwrap();
        let a = key(&sim, "A");
        let still = sim.add_molecule(a, Vec3::new(0.5, 0.5, 0.5)).unwrap();
        let doomed = sim.add_molecule(a, Vec3::new(0.2, 0.2, 0.2)).unwrap();
        sim.refresh().unwrap();
        let p_before = sim.reactions().get(id).solved().unwrap().probability;

        sim.kill_molecule(doomed).unwrap();
        assert!(sim.kill_molecule(doomed).is_err());
        sim.set_dt(0.1).unwrap();
        assert_eq!(sim.condition(Structure::Reactions), StructureCondition::ParamsValid);
        sim.set_diffusion(species, 0.01).unwrap();
        assert!(sim.set_diffusion(species, -1.0).is_err());
        sim.set_rate(id, 0.0).unwrap();
        sim.step().unwrap();

        assert_eq!(sim.count(a), 1);
        assert!(sim.reactions().get(id).solved().unwrap().probability < p_before);
        assert_ne!(sim.molecule(still).unwrap().pos, Vec3::new(0.5, 0.5, 0.5));
        assert!((sim.time() - 0.1).abs() < 1e-12);
        sim.check_consistency().unwrap();
    }

    #[test]
    fn steps_keep_boxes_consistent() {
        let mut sim = Simulation::new(params(2, 1.0, BoundaryType::Periodic)).unwrap();
        sim.add_species(Species::new("A", 0.5));
        sim.add_species(Species::new("B", 0.0));
        let a = key(&sim, "A");
        let b = key(&sim, "B");
        sim.add_molecules(a, 200, Vec3::zero(), Vec3::new(1.0, 1.0, 0.0)).unwrap();
        sim.add_molecules(b, 50, Vec3::zero(), Vec3::new(1.0, 1.0, 0.0)).unwrap();
        for _ in 0..20 {
            sim.step().unwrap();
            sim.check_consistency().unwrap();
        }
        assert_eq!(sim.count(a), 200);
        assert_eq!(sim.count(b), 50);
        assert_eq!(sim.step_count(), 20);
        assert!((sim.time() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn absorbing_walls_remove_molecules() {
        let mut sim = Simulation::new(params(1, 1.0, BoundaryType::Absorb)).unwrap();
        sim.add_species(Species::new("A", 10.0));
        let a = key(&sim, "A");
        sim.add_molecules(a, 100, Vec3::zero(), Vec3::new(1.0, 0.0, 0.0)).unwrap();
        for _ in 0..50 {
            sim.step().unwrap();
        }
        assert!(sim.count(a) < 100);
        sim.check_consistency().unwrap();
    }

    #[test]
    fn bimolecular_products_form_at_the_reaction_point() {
        let mut sim = Simulation::new(params(3, 1.0, BoundaryType::Reflect)).unwrap();
        sim.add_species(Species::new("A", 0.0));
        sim.add_species(Species::new("B", 0.0));
        sim.add_species(Species::new("C", 0.0));
        let id = sim.add_reaction("bind", &["A", "B"], &["C"]).unwrap();
        sim.set_rate(id, 1.0).unwrap();
        sim.set_capture_radius(id, 0.1).unwrap();
        sim.set_probability(id, 1.0).unwrap();
        let (a, b, c) = (key(&sim, "A"), key(&sim, "B"), key(&sim, "C"));
        sim.add_molecule(a, Vec3::new(0.5, 0.5, 0.5)).unwrap();
        sim.add_molecule(b, Vec3::new(0.55, 0.5, 0.5)).unwrap();
        sim.add_molecule(b, Vec3::new(0.9, 0.9, 0.9)).unwrap();
        sim.step().unwrap();

        assert_eq!(sim.count(a), 0);
        assert_eq!(sim.count(b), 1);
        assert_eq!(sim.count(c), 1);
        assert_eq!(sim.reaction_events(id), 1);
        let product = sim.molecule_records().into_iter().find(|m| m.species == "C").unwrap();
        // immobile reactants meet halfway
        assert!((product.position[0] - 0.525).abs() < 1e-12);
        sim.check_consistency().unwrap();
    }

    #[test]
    fn a_molecule_reacts_at_most_once_per_step() {
        let mut sim = Simulation::new(params(2, 1.0, BoundaryType::Reflect)).unwrap();
        sim.add_species(Species::new("A", 0.0));
        sim.add_species(Species::new("D", 0.0));
        let id = sim.add_reaction("dimer", &["A", "A"], &["D"]).unwrap();
        sim.set_capture_radius(id, 0.2).unwrap();
        sim.set_probability(id, 1.0).unwrap();
        let a = key(&sim, "A");
        for x in [0.40, 0.45, 0.50] {
            sim.add_molecule(a, Vec3::new(x, 0.5, 0.0)).unwrap();
        }
        sim.step().unwrap();
        // three mutually close molecules make exactly one dimer
        assert_eq!(sim.count(key(&sim, "D")), 1);
        assert_eq!(sim.count(a), 1);
        sim.check_consistency().unwrap();
    }

    fn position_of(sim: &Simulation, name: &str) -> Vec3 {
        let record = sim.molecule_records().into_iter().find(|m| m.species == name).unwrap();
        Vec3::from_slice(&record.position)
    }

    #[test]
    fn bounced_products_separate_along_the_relative_step() {
        let mut sim = Simulation::new(params(3, 1.0, BoundaryType::Reflect)).unwrap();
        let mut walker = Species::new("A", 0.0);
        walker.drift = Vec3::new(0.0, 10.0, 0.0);
        sim.add_species(walker);
        sim.add_species(Species::new("B", 0.0));
        let id = sim.add_reaction("collide", &["A", "B"], &["A", "B"]).unwrap();
        sim.set_capture_radius(id, 0.1).unwrap();
        sim.set_probability(id, 1.0).unwrap();
        sim.set_policy(id, ReversibilityPolicy::Bounce { separation: Some(0.3) }).unwrap();
        sim.add_molecule(key(&sim, "A"), Vec3::new(0.5, 0.4, 0.5)).unwrap();
        sim.add_molecule(key(&sim, "B"), Vec3::new(0.55, 0.5, 0.5)).unwrap();
        sim.step().unwrap();

        assert_eq!(sim.reaction_events(id), 1);
        // A stepped +y onto B, so the pair leaves along -y from the midpoint
        let (a, b) = (position_of(&sim, "A"), position_of(&sim, "B"));
        assert!((a.x - 0.525).abs() < 1e-9 && (b.x - 0.525).abs() < 1e-9);
        assert!((a.y - 0.65).abs() < 1e-9, "{:?}", a);
        assert!((b.y - 0.35).abs() < 1e-9, "{:?}", b);
        sim.check_consistency().unwrap();
    }

    #[test]
    fn spread_products_inherit_reactant_positions() {
        let mut sim = Simulation::new(params(3, 1.0, BoundaryType::Reflect)).unwrap();
        for name in ["A", "B", "C", "D"] {
            sim.add_species(Species::new(name, 0.0));
        }
        let id = sim.add_reaction("spread", &["A", "B"], &["C", "D"]).unwrap();
        sim.set_rate(id, 1e5).unwrap();
        sim.set_policy(id, ReversibilityPolicy::ConformationalSpread { radius: 0.1 }).unwrap();
        sim.add_molecule(key(&sim, "A"), Vec3::new(0.5, 0.5, 0.5)).unwrap();
        sim.add_molecule(key(&sim, "B"), Vec3::new(0.56, 0.5, 0.5)).unwrap();
        sim.step().unwrap();

        assert_eq!(sim.reaction_events(id), 1);
        assert_eq!(position_of(&sim, "C"), Vec3::new(0.5, 0.5, 0.5));
        assert_eq!(position_of(&sim, "D"), Vec3::new(0.56, 0.5, 0.5));
        sim.check_consistency().unwrap();
    }

    #[test]
    fn slow_reversible_binding_runs_with_the_default_policy() {
        let mut sim = Simulation::new(params(3, 2.0, BoundaryType::Reflect)).unwrap();
        sim.add_species(Species::new("A", 1.0));
        sim.add_species(Species::new("B", 1.0));
        sim.add_species(Species::new("C", 0.0));
        let bind = sim.add_reaction("bind", &["A", "B"], &["C"]).unwrap();
        let unbind = sim.add_reaction("unbind", &["C"], &["A", "B"]).unwrap();
        sim.set_rate(bind, 0.5).unwrap();
        sim.set_rate(unbind, 1.0).unwrap();
        let c = key(&sim, "C");
        sim.add_molecules(c, 50, Vec3::zero(), Vec3::new(2.0, 2.0, 2.0)).unwrap();
        sim.refresh().unwrap();

        let solved = *sim.reactions().get(bind).solved().unwrap();
        assert_eq!(solved.unbinding_radius, 0.0);
        assert!(solved.geminate < crate::reaction::DEFAULT_GEMINATE_PROBABILITY);
        for _ in 0..20 {
            sim.step().unwrap();
        }
        let (a, b) = (sim.count(key(&sim, "A")), sim.count(key(&sim, "B")));
        assert_eq!(a, b);
        assert_eq!(a + sim.count(c), 50);
        assert!(sim.reaction_events(unbind) > 0);
        sim.check_consistency().unwrap();
    }

    #[test]
    fn matrix_diffusion_moves_and_reacts_without_a_scalar_coefficient() {
        let mut sim = Simulation::new(params(3, 1.0, BoundaryType::Reflect)).unwrap();
        let mut anisotropic = Species::new("A", 0.0);
        anisotropic.matrix = Some([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        sim.add_species(anisotropic);
        sim.add_species(Species::new("B", 0.0));
        let id = sim.add_reaction("capture", &["A", "B"], &[]).unwrap();
        sim.set_rate(id, 1.0).unwrap();
        let start = Vec3::new(0.5, 0.5, 0.5);
        let walker = sim.add_molecule(key(&sim, "A"), start).unwrap();
        sim.refresh().unwrap();
        assert!(sim.reactions().get(id).solved().unwrap().capture_radius > 0.0);

        for _ in 0..10 {
            sim.step().unwrap();
        }
        assert_ne!(sim.molecule(walker).unwrap().pos, start);
    }

    #[test]
    fn periodic_images_react_across_the_edge() {
        let mut p = params(1, 1.0, BoundaryType::Periodic);
        p.grid_sizing = GridSizing::BoxSize(0.1);
        let mut sim = Simulation::new(p).unwrap();
        sim.add_species(Species::new("A", 0.0));
        sim.add_species(Species::new("B", 0.0));
        let id = sim.add_reaction("annihilate", &["A", "B"], &[]).unwrap();
        sim.set_capture_radius(id, 0.05).unwrap();
        sim.set_probability(id, 1.0).unwrap();
        sim.add_molecule(key(&sim, "A"), Vec3::new(0.01, 0.0, 0.0)).unwrap();
        sim.add_molecule(key(&sim, "B"), Vec3::new(0.98, 0.0, 0.0)).unwrap();
        sim.step().unwrap();
        assert_eq!(sim.molecule_count(), 0);
    }

    #[test]
    fn radius_query_uses_the_grid() {
        let mut sim = Simulation::new(params(2, 1.0, BoundaryType::Reflect)).unwrap();
        sim.add_species(Species::new("A", 0.0));
        let a = key(&sim, "A");
        let near = sim.add_molecule(a, Vec3::new(0.5, 0.5, 0.0)).unwrap();
        sim.add_molecule(a, Vec3::new(0.9, 0.9, 0.0)).unwrap();
        sim.refresh().unwrap();
        assert_eq!(sim.molecules_within(Vec3::new(0.45, 0.5, 0.0), 0.1), vec![near]);
    }

    #[test]
    fn surface_molecules_stay_on_their_panel() {
        let mut sim = Simulation::new(params(3, 1.0, BoundaryType::Reflect)).unwrap();
        let mut panels = AxisAlignedPanels::new(3);
        panels.add_panel(2, 0.5, Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 1.0, 0.0));
        sim.set_surfaces(Box::new(panels));
        let mut species = Species::new("R", 0.0);
        species.difc_surface = 0.1;
        sim.add_species(species);
        let front = key(&sim, "R(front)");
        sim.add_surface_molecules(front, 20).unwrap();
        for _ in 0..10 {
            sim.step().unwrap();
        }
        for m in sim.molecule_records() {
            assert!((m.position[2] - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn snapshots_carry_counts_and_events() {
        let mut sim = Simulation::new(params(3, 1.0, BoundaryType::Reflect)).unwrap();
        sim.add_species(Species::new("A", 0.0));
        let id = sim.add_reaction("decay", &["A"], &[]).unwrap();
        sim.set_rate(id, 1000.0).unwrap();
        let a = key(&sim, "A");
        sim.add_molecules(a, 10, Vec3::zero(), Vec3::new(1.0, 1.0, 1.0)).unwrap();
        sim.set_save_positions_in_snapshot(true);
        sim.refresh().unwrap();
        sim.record_snapshot().unwrap();
        for _ in 0..5 {
            sim.step().unwrap();
        }
        sim.record_snapshot().unwrap();

        let snaps = sim.get_recorded_snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].total_molecule_count, 10);
        assert_eq!(snaps[0].molecules.as_ref().map(|m| m.len()), Some(10));
        assert_eq!(snaps[1].reaction_events, vec![("decay".to_string(), 10 - sim.count(a) as u64)]);
    }
}
