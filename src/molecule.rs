//! Molecule storage.
//!
//! All molecules live in one slot arena owned by [`MoleculePool`]. Vacant
//! slots sit in the dead arena and are reused before the arena grows.
//! Molecules allocated since the last compaction form the resurrection zone:
//! they exist but are not yet filed in a live list or a box.
//!
//! Killing a molecule or changing its identity never touches list or box
//! arrays directly; the slot is queued and the next [`MoleculePool::compact`]
//! moves it. Callers can therefore mutate molecules while iterating over a
//! live list, and compaction cost is proportional to the number of molecules
//! that changed, not the population.

use rdsim_common::Vec3;
use rustc_hash::FxHashMap;

use crate::error::{SimError, SimResult};
use crate::grid::SpatialIndex;
use crate::species::{MolState, SpeciesId, SpeciesState};
use crate::surface::PanelId;

pub type ListId = usize;

/// Generation-checked handle to a molecule slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MolId {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone)]
pub struct Molecule {
    /// Tracking number, kept across identity changes.
    pub serial: u64,
    pub species: SpeciesId,
    pub state: MolState,
    pub pos: Vec3,
    /// Position before the most recent displacement.
    pub pos_prev: Vec3,
    pub panel: Option<PanelId>,
    cell: Option<usize>,
    list: Option<ListId>,
    list_pos: u32,
    box_pos: u32,
    generation: u32,
    queued: bool,
    fresh: bool,
}

impl Molecule {
    fn vacant() -> Self {
        Molecule {
            serial: 0,
            species: SpeciesId::VACANT,
            state: MolState::Solution,
            pos: Vec3::zero(),
            pos_prev: Vec3::zero(),
            panel: None,
            cell: None,
            list: None,
            list_pos: 0,
            box_pos: 0,
            generation: 0,
            queued: false,
            fresh: false,
        }
    }

    pub fn key(&self) -> SpeciesState {
        SpeciesState::new(self.species, self.state)
    }

    pub fn is_vacant(&self) -> bool {
        self.species.is_vacant()
    }

    /// Live, filed and untouched since the last compaction. Only these
    /// molecules may take part in reactions.
    pub fn is_active(&self) -> bool {
        !self.is_vacant() && !self.fresh
    }

    /// Box the molecule is currently filed in.
    pub fn cell(&self) -> Option<usize> {
        self.cell
    }

    /// Live list the molecule is currently filed in.
    pub fn list(&self) -> Option<ListId> {
        self.list
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Contiguous array of the molecules of one (species, state).
#[derive(Debug, Clone)]
pub struct LiveList {
    pub key: SpeciesState,
    /// Whether molecules in this list move during the displacement phase.
    pub mobile: bool,
    members: Vec<u32>,
}

impl LiveList {
    pub fn members(&self) -> &[u32] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Box membership as seen by the pool.
pub trait Occupancy {
    fn locate(&self, pos: Vec3) -> usize;
    fn members(&self, cell: usize, list: ListId) -> &[u32];
    fn ensure_lists(&mut self, count: usize) -> SimResult<()>;
    fn insert(&mut self, cell: usize, list: ListId, slot: u32) -> SimResult<u32>;
    fn remove(&mut self, cell: usize, list: ListId, position: u32) -> Option<u32>;
}

impl Occupancy for SpatialIndex {
    fn locate(&self, pos: Vec3) -> usize {
        SpatialIndex::locate(self, pos)
    }

    fn members(&self, cell: usize, list: ListId) -> &[u32] {
        SpatialIndex::members(self, cell, list)
    }

    fn ensure_lists(&mut self, count: usize) -> SimResult<()> {
        SpatialIndex::ensure_lists(self, count)
    }

    fn insert(&mut self, cell: usize, list: ListId, slot: u32) -> SimResult<u32> {
        SpatialIndex::insert(self, cell, list, slot)
    }

    fn remove(&mut self, cell: usize, list: ListId, position: u32) -> Option<u32> {
        SpatialIndex::remove(self, cell, list, position)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MoleculePool {
    slots: Vec<Molecule>,
    /// Vacant slots ready for reuse; popped from the back.
    dead: Vec<u32>,
    /// Slots allocated since the last compaction, not yet filed.
    resurrected: Vec<u32>,
    /// Filed slots whose list or box may be stale.
    queue: Vec<u32>,
    lists: Vec<LiveList>,
    list_index: FxHashMap<SpeciesState, ListId>,
    counts: FxHashMap<SpeciesState, usize>,
    live: usize,
    next_serial: u64,
    max_molecules: Option<usize>,
}

const INITIAL_SLOTS: usize = 64;

impl MoleculePool {
    pub fn new(max_molecules: Option<usize>) -> Self {
        MoleculePool { next_serial: 1, max_molecules, ..Default::default() }
    }

    /// Grows the slot arena so that at least `required` slots exist. New slots
    /// are vacant and go to the dead arena.
    pub fn ensure_capacity(&mut self, required: usize) -> SimResult<()> {
        let current = self.slots.len();
        if required <= current {
            return Ok(());
        }
        let mut new_capacity = required.max(current * 2).max(INITIAL_SLOTS);
        if let Some(max) = self.max_molecules {
            new_capacity = new_capacity.min(max.max(required));
        }
        log::info!("Resizing molecule arena from {} to {} slots.", current, new_capacity);
        self.slots.try_reserve_exact(new_capacity - current)?;
        self.dead.try_reserve(new_capacity - current)?;
        self.slots.resize_with(new_capacity, Molecule::vacant);
        // reverse so that the lowest new index is handed out first
        self.dead.extend((current..new_capacity).rev().map(|i| i as u32));
        Ok(())
    }

    /// Takes a slot for a new molecule and gives it a fresh serial number.
    /// The molecule joins its live list and box at the next compaction.
    pub fn allocate(&mut self, key: SpeciesState, pos: Vec3, panel: Option<PanelId>) -> SimResult<MolId> {
        if key.species.is_vacant() {
            return Err(SimError::InvalidParameter("cannot allocate a vacant molecule".to_string()));
        }
        if let Some(max) = self.max_molecules {
            if self.live >= max {
                return Err(SimError::OutOfMemory(format!("molecule ceiling of {} reached", max)));
            }
        }
        if self.dead.is_empty() {
            self.ensure_capacity(self.slots.len() + 1)?;
        }
        let index = self
            .dead
            .pop()
            .ok_or_else(|| SimError::OutOfMemory("dead arena exhausted".to_string()))?;
        self.resurrected.try_reserve(1)?;

        let serial = self.next_serial;
        self.next_serial += 1;
        let m = &mut self.slots[index as usize];
        m.serial = serial;
        m.species = key.species;
        m.state = key.state;
        m.pos = pos;
        m.pos_prev = pos;
        m.panel = panel;
        m.fresh = true;
        m.queued = true;
        let generation = m.generation;
        self.resurrected.push(index);
        self.live += 1;
        *self.counts.entry(key).or_insert(0) += 1;
        Ok(MolId { index, generation })
    }

    /// Marks a molecule vacant. Its slot stays in place (and in its list)
    /// until the next compaction returns it to the dead arena.
    pub fn kill(&mut self, index: u32) {
        let Some(m) = self.slots.get_mut(index as usize) else {
            return;
        };
        if m.species.is_vacant() {
            return;
        }
        let key = m.key();
        m.species = SpeciesId::VACANT;
        m.state = MolState::Solution;
        m.panel = None;
        m.generation = m.generation.wrapping_add(1);
        let newly_queued = !m.queued;
        m.queued = true;
        if newly_queued {
            self.queue.push(index);
        }
        self.live -= 1;
        if let Some(c) = self.counts.get_mut(&key) {
            *c -= 1;
        }
    }

    /// Gives a molecule a new species/state in place (used when a reactant
    /// slot is reused for a product). The serial number is kept.
    pub fn change_identity(&mut self, index: u32, key: SpeciesState, pos: Vec3, panel: Option<PanelId>) {
        let Some(m) = self.slots.get_mut(index as usize) else {
            return;
        };
        if m.species.is_vacant() || key.species.is_vacant() {
            return;
        }
        let old = m.key();
        m.species = key.species;
        m.state = key.state;
        m.pos = pos;
        m.pos_prev = pos;
        m.panel = panel;
        m.fresh = true;
        let newly_queued = !m.queued;
        m.queued = true;
        if newly_queued {
            self.queue.push(index);
        }
        if let Some(c) = self.counts.get_mut(&old) {
            *c -= 1;
        }
        *self.counts.entry(key).or_insert(0) += 1;
    }

    /// Queues a molecule whose position changed so its box is rechecked.
    pub fn mark_moved(&mut self, index: u32) {
        if let Some(m) = self.slots.get_mut(index as usize) {
            if !m.queued && m.list.is_some() {
                m.queued = true;
                self.queue.push(index);
            }
        }
    }

    /// Applies queued box and list changes for filed molecules only.
    /// Returns the number of molecules that changed box or list.
    pub fn relocate(&mut self, occupancy: &mut impl Occupancy) -> SimResult<usize> {
        let queue = std::mem::take(&mut self.queue);
        let mut moved = 0;
        for index in queue {
            if self.refile(index, occupancy)? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Moves every queued molecule to the list and box matching its current
    /// identity and position, files the resurrection zone and returns vacant
    /// slots to the dead arena. Returns the number of molecules moved.
    pub fn compact(&mut self, occupancy: &mut impl Occupancy) -> SimResult<usize> {
        let mut moved = self.relocate(occupancy)?;
        let resurrected = std::mem::take(&mut self.resurrected);
        for index in resurrected {
            if self.refile(index, occupancy)? {
                moved += 1;
            }
        }
        if moved > 0 {
            log::trace!("compaction moved {} molecules", moved);
        }
        Ok(moved)
    }

    fn refile(&mut self, index: u32, occupancy: &mut impl Occupancy) -> SimResult<bool> {
        let (key, vacant, pos, old_list, old_cell) = {
            let m = &mut self.slots[index as usize];
            m.queued = false;
            m.fresh = false;
            (m.key(), m.is_vacant(), m.pos, m.list, m.cell)
        };
        if vacant && old_list.is_none() {
            // allocated and killed between two compactions
            self.dead.try_reserve(1)?;
            self.dead.push(index);
            return Ok(false);
        }
        let target_list = if vacant { None } else { Some(self.ensure_list(key, occupancy)?) };
        let target_cell = target_list.map(|_| occupancy.locate(pos));
        if target_list == old_list && target_cell == old_cell {
            return Ok(false);
        }

        if let Some(list) = old_list {
            self.unfile(index, list, old_cell, occupancy);
        }

        match (target_list, target_cell) {
            (Some(list), Some(cell)) => {
                let members = &mut self.lists[list].members;
                if members.len() == members.capacity() {
                    members.try_reserve(members.len().max(8))?;
                }
                members.push(index);
                let list_pos = (members.len() - 1) as u32;
                let box_pos = occupancy.insert(cell, list, index)?;
                let m = &mut self.slots[index as usize];
                m.list = Some(list);
                m.list_pos = list_pos;
                m.cell = Some(cell);
                m.box_pos = box_pos;
            }
            _ => {
                let m = &mut self.slots[index as usize];
                m.list = None;
                m.cell = None;
                self.dead.try_reserve(1)?;
                self.dead.push(index);
            }
        }
        Ok(true)
    }

    fn unfile(&mut self, index: u32, list: ListId, cell: Option<usize>, occupancy: &mut impl Occupancy) {
        let (list_pos, box_pos) = {
            let m = &self.slots[index as usize];
            (m.list_pos as usize, m.box_pos)
        };
        let members = &mut self.lists[list].members;
        if list_pos < members.len() && members[list_pos] == index {
            members.swap_remove(list_pos);
            if let Some(&shifted) = members.get(list_pos) {
                self.slots[shifted as usize].list_pos = list_pos as u32;
            }
        } else {
            log::error!("Molecule slot {} not found at position {} of list {}.", index, list_pos, list);
        }
        if let Some(cell) = cell {
            if let Some(shifted) = occupancy.remove(cell, list, box_pos) {
                self.slots[shifted as usize].box_pos = box_pos;
            }
        }
        let m = &mut self.slots[index as usize];
        m.list = None;
        m.cell = None;
    }

    /// Live list for `key`, created on first use.
    pub fn ensure_list(&mut self, key: SpeciesState, occupancy: &mut impl Occupancy) -> SimResult<ListId> {
        if let Some(list) = self.list_index.get(&key) {
            return Ok(*list);
        }
        let list = self.lists.len();
        self.lists.try_reserve(1)?;
        self.lists.push(LiveList { key, mobile: false, members: Vec::new() });
        self.list_index.insert(key, list);
        occupancy.ensure_lists(self.lists.len())?;
        log::debug!("created live list {} for {:?}", list, key);
        Ok(list)
    }

    /// Reserves room for `extra` more members in one live list. Growth is
    /// geometric and never disturbs existing entries.
    pub fn expand(&mut self, list: ListId, extra: usize) -> SimResult<()> {
        let members = &mut self.lists[list].members;
        let wanted = members.len() + extra;
        if wanted > members.capacity() {
            let grow = (wanted - members.len()).max(members.capacity());
            members.try_reserve(grow)?;
        }
        Ok(())
    }

    /// Files every filed molecule again into a freshly built grid.
    pub fn rebuild_membership(&mut self, occupancy: &mut impl Occupancy) -> SimResult<()> {
        occupancy.ensure_lists(self.lists.len())?;
        for list in 0..self.lists.len() {
            for k in 0..self.lists[list].members.len() {
                let index = self.lists[list].members[k];
                let cell = occupancy.locate(self.slots[index as usize].pos);
                let box_pos = occupancy.insert(cell, list, index)?;
                let m = &mut self.slots[index as usize];
                m.cell = Some(cell);
                m.box_pos = box_pos;
            }
        }
        Ok(())
    }

    pub fn get(&self, id: MolId) -> SimResult<&Molecule> {
        match self.slots.get(id.index as usize) {
            Some(m) if m.generation == id.generation && !m.is_vacant() => Ok(m),
            _ => Err(SimError::StaleHandle { index: id.index, generation: id.generation }),
        }
    }

    pub fn get_mut(&mut self, id: MolId) -> SimResult<&mut Molecule> {
        match self.slots.get_mut(id.index as usize) {
            Some(m) if m.generation == id.generation && !m.is_vacant() => Ok(m),
            _ => Err(SimError::StaleHandle { index: id.index, generation: id.generation }),
        }
    }

    pub fn id_of(&self, index: u32) -> MolId {
        MolId { index, generation: self.slots[index as usize].generation }
    }

    pub fn slot(&self, index: u32) -> &Molecule {
        &self.slots[index as usize]
    }

    /// Every slot, vacant ones included. Used by the parallel displacement phase.
    pub fn slots_mut(&mut self) -> &mut [Molecule] {
        &mut self.slots
    }

    pub fn lists(&self) -> &[LiveList] {
        &self.lists
    }

    pub fn list(&self, list: ListId) -> &LiveList {
        &self.lists[list]
    }

    pub fn list_of(&self, key: SpeciesState) -> Option<ListId> {
        self.list_index.get(&key).copied()
    }

    pub fn set_mobile(&mut self, list: ListId, mobile: bool) {
        self.lists[list].mobile = mobile;
    }

    /// Current number of molecules of `key`, exact at any time.
    pub fn count(&self, key: SpeciesState) -> usize {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    pub fn count_species(&self, species: SpeciesId) -> usize {
        MolState::ALL.iter().map(|s| self.count(SpeciesState::new(species, *s))).sum()
    }

    /// Number of non-vacant molecules.
    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn dead_count(&self) -> usize {
        self.dead.len()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len() + self.resurrected.len()
    }

    /// Live molecules with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (MolId, &Molecule)> + '_ {
        self.slots.iter().enumerate().filter(|(_, m)| !m.is_vacant()).map(|(i, m)| {
            (MolId { index: i as u32, generation: m.generation }, m)
        })
    }

    /// Checks that lists and boxes agree with molecule identities and
    /// positions. Only meaningful right after a compaction.
    pub fn check_consistency(&self, occupancy: &impl Occupancy) -> SimResult<()> {
        let mut filed = 0;
        for (list, live) in self.lists.iter().enumerate() {
            for (pos, &index) in live.members.iter().enumerate() {
                let m = &self.slots[index as usize];
                filed += 1;
                if m.key() != live.key || m.list != Some(list) || m.list_pos as usize != pos {
                    return Err(SimError::InvariantViolation(format!(
                        "slot {} ({:?}) filed in list {} ({:?}) at {}",
                        index, m.key(), list, live.key, pos
                    )));
                }
                let expected = occupancy.locate(m.pos);
                if m.cell != Some(expected) {
                    return Err(SimError::InvariantViolation(format!(
                        "slot {} is filed in box {:?} but sits in box {}",
                        index, m.cell, expected
                    )));
                }
                if occupancy.members(expected, list).get(m.box_pos as usize) != Some(&index) {
                    return Err(SimError::InvariantViolation(format!(
                        "box {} list {} does not hold slot {} at {}",
                        expected, list, index, m.box_pos
                    )));
                }
            }
        }
        if filed != self.live || !self.resurrected.is_empty() || !self.queue.is_empty() {
            return Err(SimError::InvariantViolation(format!(
                "{} molecules filed, {} live, {} pending",
                filed,
                self.live,
                self.pending_count()
            )));
        }
        Ok(())
    }
}
