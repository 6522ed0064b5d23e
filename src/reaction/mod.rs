//! Reaction tables and microscopic parameter solving.
//!
//! Reactions are indexed by order: order 0 is a flat list, order 1 is keyed
//! by the reactant (species, state), order 2 by the sorted reactant pair.
//! The tables are hash maps so species registered mid-run never require a
//! rebuild.
//!
//! Requested inputs (rate, policy, explicit probability or radius) are kept
//! apart from the solved parameters. Any setter drops the solved values of
//! the reaction and of its reversible partner; [`ReactionModel::solve_all`]
//! recomputes whatever is missing.

pub mod policy;
pub mod radial;

use rdsim_common::{ReactionConfig, ZeroOrderLocus};
use rustc_hash::FxHashMap;

use crate::error::{SimError, SimResult};
use crate::species::{SpeciesRegistry, SpeciesState};
use crate::stats::{ball_volume, clamp_probability};

pub use policy::{ProductPlacement, ReversibilityPolicy, DEFAULT_GEMINATE_PROBABILITY};

pub type ReactionId = usize;

/// Solved microscopic parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Solved {
    /// Order 0: chance of at least one event per step. Order 1: conditional
    /// per-step probability within the reactant's chain. Order 2: chance a
    /// pair inside the capture radius reacts.
    pub probability: f64,
    /// Mean number of events per step (order 0 only).
    pub expected_events: f64,
    pub capture_radius: f64,
    /// Unbinding radius of the reversible pair this reaction belongs to.
    pub unbinding_radius: f64,
    /// Geminate rebinding probability of the reversible pair.
    pub geminate: f64,
    pub placement: ProductPlacement,
}

impl Solved {
    fn inert() -> Self {
        Solved {
            probability: 0.0,
            expected_events: 0.0,
            capture_radius: 0.0,
            unbinding_radius: 0.0,
            geminate: 0.0,
            placement: ProductPlacement::AtReactionPoint,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reaction {
    pub name: String,
    pub reactants: Vec<SpeciesState>,
    pub products: Vec<SpeciesState>,
    pub rate: f64,
    pub multiplicity: u32,
    pub locus: ZeroOrderLocus,
    policy: Option<ReversibilityPolicy>,
    requested_probability: Option<f64>,
    requested_radius: Option<f64>,
    partner: Option<ReactionId>,
    solved: Option<Solved>,
}

impl Reaction {
    pub fn order(&self) -> usize {
        self.reactants.len()
    }

    pub fn policy(&self) -> Option<ReversibilityPolicy> {
        self.policy
    }

    /// The reverse (or forward) reaction of a reversible pair.
    pub fn partner(&self) -> Option<ReactionId> {
        self.partner
    }

    pub fn solved(&self) -> Option<&Solved> {
        self.solved.as_ref()
    }

    pub fn is_solved(&self) -> bool {
        self.solved.is_some()
    }

    fn sorted_signature(&self) -> (Vec<SpeciesState>, Vec<SpeciesState>) {
        let mut r = self.reactants.clone();
        let mut p = self.products.clone();
        r.sort();
        p.sort();
        (r, p)
    }
}

/// Everything the solver needs from the rest of the simulation.
#[derive(Clone, Copy)]
pub struct SolveContext<'a> {
    pub dim: usize,
    pub dt: f64,
    /// System volume (area in 2D, length in 1D).
    pub volume: f64,
    /// Total surface panel area, for surface-locus zeroth order reactions.
    pub surface_area: f64,
    pub species: &'a SpeciesRegistry,
}

impl SolveContext<'_> {
    fn difc(&self, key: SpeciesState) -> SimResult<f64> {
        Ok(self.species.motion(key)?.effective_difc(self.dim))
    }

    /// Per-axis rms step of a pair with summed diffusion coefficient `d`.
    fn step_length(&self, d: f64) -> f64 {
        (2.0 * d * self.dt).sqrt()
    }
}

fn pair_key(a: SpeciesState, b: SpeciesState) -> (SpeciesState, SpeciesState) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReactionModel {
    reactions: Vec<Reaction>,
    by_name: FxHashMap<String, ReactionId>,
    order0: Vec<ReactionId>,
    order1: FxHashMap<SpeciesState, Vec<ReactionId>>,
    order2: FxHashMap<(SpeciesState, SpeciesState), Vec<ReactionId>>,
    pairs_linked: bool,
}

impl ReactionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reaction. The order is the number of reactants.
    pub fn register(
        &mut self,
        name: &str,
        reactants: &[SpeciesState],
        products: &[SpeciesState],
    ) -> SimResult<ReactionId> {
        let invalid = |reason: &str| SimError::InvalidReaction { name: name.to_string(), reason: reason.to_string() };
        if name.is_empty() {
            return Err(invalid("reaction names must not be empty"));
        }
        if self.by_name.contains_key(name) {
            return Err(SimError::DuplicateReaction(name.to_string()));
        }
        if reactants.len() > 2 {
            return Err(invalid("at most two reactants are supported"));
        }
        if reactants.iter().chain(products).any(|k| k.species.is_vacant()) {
            return Err(invalid("the empty species cannot react"));
        }
        if !reactants.is_empty()
            && products.iter().any(|p| p.state.is_bound())
            && !reactants.iter().any(|r| r.state.is_bound())
        {
            return Err(invalid("a bound product needs a bound reactant to take its panel from"));
        }

        let reaction = Reaction {
            name: name.to_string(),
            reactants: reactants.to_vec(),
            products: products.to_vec(),
            rate: 0.0,
            multiplicity: 1,
            locus: ZeroOrderLocus::System,
            policy: None,
            requested_probability: None,
            requested_radius: None,
            partner: None,
            solved: None,
        };
        let signature = reaction.sorted_signature();
        if let Some(other) = self.reactions.iter().find(|r| r.sorted_signature() == signature) {
            return Err(SimError::DuplicateReaction(format!("{} (same as '{}')", name, other.name)));
        }

        let id = self.reactions.len();
        match reactants {
            [] => self.order0.push(id),
            [a] => self.order1.entry(*a).or_default().push(id),
            [a, b] => self.order2.entry(pair_key(*a, *b)).or_default().push(id),
            _ => unreachable!("checked above"),
        }
        self.by_name.insert(name.to_string(), id);
        self.reactions.push(reaction);
        self.pairs_linked = false;
        log::debug!("registered reaction '{}' (order {}) as #{}", name, reactants.len(), id);
        Ok(id)
    }

    /// Registers a reaction from its configuration entry.
    pub fn register_config(&mut self, cfg: &ReactionConfig, species: &SpeciesRegistry) -> SimResult<ReactionId> {
        let reactants = cfg.reactants.iter().map(|r| species.parse(r)).collect::<SimResult<Vec<_>>>()?;
        let products = cfg.products.iter().map(|p| species.parse(p)).collect::<SimResult<Vec<_>>>()?;
        let id = self.register(&cfg.name, &reactants, &products)?;
        self.set_rate(id, cfg.rate.unwrap_or(0.0))?;
        self.set_multiplicity(id, cfg.multiplicity)?;
        self.reactions[id].locus = cfg.locus;
        if let Some(p) = cfg.probability {
            self.set_probability(id, p)?;
        }
        if let Some(r) = cfg.capture_radius {
            self.set_capture_radius(id, r)?;
        }
        if let Some(placement) = &cfg.product_placement {
            self.set_policy(id, ReversibilityPolicy::from(placement))?;
        }
        Ok(id)
    }

    fn reaction_mut(&mut self, id: ReactionId) -> SimResult<&mut Reaction> {
        self.reactions
            .get_mut(id)
            .ok_or_else(|| SimError::InvalidParameter(format!("no reaction #{}", id)))
    }

    /// Drops the solved parameters of `id` and everything solved from it.
    fn invalidate(&mut self, id: ReactionId) {
        let mut partner = None;
        if let Some(r) = self.reactions.get_mut(id) {
            r.solved = None;
            partner = r.partner;
        }
        if let Some(p) = partner {
            self.reactions[p].solved = None;
        }
        // order-1 probabilities are conditional on the whole chain
        for rid in [Some(id), partner].into_iter().flatten() {
            if let [key] = *self.reactions[rid].reactants.as_slice() {
                if let Some(chain) = self.order1.get(&key) {
                    for &other in chain {
                        self.reactions[other].solved = None;
                    }
                }
            }
        }
    }

    /// Drops every solved parameter, e.g. after the time step or a diffusion
    /// coefficient changed.
    pub fn invalidate_all(&mut self) {
        for r in &mut self.reactions {
            r.solved = None;
        }
    }

    pub fn set_rate(&mut self, id: ReactionId, rate: f64) -> SimResult<()> {
        let r = self.reaction_mut(id)?;
        if !(rate >= 0.0) || !rate.is_finite() {
            return Err(SimError::InvalidParameter(format!("rate {} of '{}' must be finite and non-negative", rate, r.name)));
        }
        r.rate = rate;
        self.invalidate(id);
        Ok(())
    }

    pub fn set_multiplicity(&mut self, id: ReactionId, multiplicity: u32) -> SimResult<()> {
        self.reaction_mut(id)?.multiplicity = multiplicity;
        self.invalidate(id);
        Ok(())
    }

    pub fn set_policy(&mut self, id: ReactionId, policy: ReversibilityPolicy) -> SimResult<()> {
        self.reaction_mut(id)?.policy = Some(policy);
        self.invalidate(id);
        Ok(())
    }

    /// Fixes the per-collision (order 2) or per-step (order 1) probability.
    pub fn set_probability(&mut self, id: ReactionId, probability: f64) -> SimResult<()> {
        let r = self.reaction_mut(id)?;
        if !(probability > 0.0 && probability <= 1.0) {
            return Err(SimError::InvalidParameter(format!(
                "probability {} of '{}' must lie in (0, 1]",
                probability, r.name
            )));
        }
        r.requested_probability = Some(probability);
        self.invalidate(id);
        Ok(())
    }

    /// Fixes the capture radius of a bimolecular reaction.
    pub fn set_capture_radius(&mut self, id: ReactionId, radius: f64) -> SimResult<()> {
        let r = self.reaction_mut(id)?;
        if r.order() != 2 {
            return Err(SimError::InvalidReaction {
                name: r.name.clone(),
                reason: "only bimolecular reactions have a capture radius".to_string(),
            });
        }
        if !(radius >= 0.0) || !radius.is_finite() {
            return Err(SimError::InvalidParameter(format!("capture radius {} of '{}'", radius, r.name)));
        }
        r.requested_radius = Some(radius);
        self.invalidate(id);
        Ok(())
    }

    pub fn get(&self, id: ReactionId) -> &Reaction {
        &self.reactions[id]
    }

    pub fn id(&self, name: &str) -> Option<ReactionId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.reactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReactionId, &Reaction)> + '_ {
        self.reactions.iter().enumerate()
    }

    pub fn zeroth_order(&self) -> &[ReactionId] {
        &self.order0
    }

    /// Unimolecular reactions of `key`, in trial order.
    pub fn first_order(&self, key: SpeciesState) -> &[ReactionId] {
        self.order1.get(&key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Bimolecular reactions between `a` and `b`, in either order.
    pub fn second_order(&self, a: SpeciesState, b: SpeciesState) -> &[ReactionId] {
        self.order2.get(&pair_key(a, b)).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Candidate reactions for a reactant tuple of length 0, 1 or 2.
    pub fn candidates(&self, reactants: &[SpeciesState]) -> &[ReactionId] {
        match reactants {
            [] => self.zeroth_order(),
            [a] => self.first_order(*a),
            [a, b] => self.second_order(*a, *b),
            _ => &[],
        }
    }

    pub fn first_order_keys(&self) -> impl Iterator<Item = SpeciesState> + '_ {
        self.order1.keys().copied()
    }

    /// Reactant pairs with at least one bimolecular reaction.
    pub fn reactive_pairs(&self) -> impl Iterator<Item = ((SpeciesState, SpeciesState), &[ReactionId])> + '_ {
        self.order2.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn is_solved(&self) -> bool {
        self.pairs_linked && self.reactions.iter().all(|r| r.solved.is_some())
    }

    /// Largest solved capture radius; the grid's boxes must be at least this wide.
    pub fn max_capture_radius(&self) -> f64 {
        self.reactions
            .iter()
            .filter_map(|r| r.solved.as_ref())
            .map(|s| s.capture_radius)
            .fold(0.0, f64::max)
    }

    /// Finds reversible pairs: an order-2 reaction with one product whose
    /// reverse is an order-1 reaction of that product back to the reactants.
    fn link_pairs(&mut self) {
        for r in &mut self.reactions {
            r.partner = None;
        }
        for f in 0..self.reactions.len() {
            let fwd = &self.reactions[f];
            if fwd.order() != 2 || fwd.products.len() != 1 {
                continue;
            }
            let mut wanted = fwd.reactants.clone();
            wanted.sort();
            let candidates = self.first_order(fwd.products[0]).to_vec();
            let reverse = candidates.into_iter().find(|&r| {
                let rev = &self.reactions[r];
                let mut got = rev.products.clone();
                got.sort();
                rev.partner.is_none() && got == wanted
            });
            if let Some(r) = reverse {
                self.reactions[f].partner = Some(r);
                self.reactions[r].partner = Some(f);
                log::debug!(
                    "'{}' and '{}' form a reversible pair",
                    self.reactions[f].name,
                    self.reactions[r].name
                );
            }
        }
        self.pairs_linked = true;
    }

    /// Pair policy of a reversible pair: the reverse reaction's, then the
    /// forward's. `None` means neither was set.
    fn pair_policy(&self, forward: ReactionId) -> Option<ReversibilityPolicy> {
        let fwd = &self.reactions[forward];
        let reverse = fwd.partner.and_then(|r| self.reactions[r].policy);
        reverse
            .filter(|p| p.is_pair_policy())
            .or(fwd.policy.filter(|p| p.is_pair_policy()))
    }

    /// Solves every reaction that has no solved parameters.
    pub fn solve_all(&mut self, ctx: &SolveContext) -> SimResult<()> {
        if !self.pairs_linked {
            self.link_pairs();
            self.invalidate_all();
        }
        let mut solved = 0;
        for order in [2, 1, 0] {
            for id in 0..self.reactions.len() {
                if self.reactions[id].order() == order && self.reactions[id].solved.is_none() {
                    self.solve(id, ctx)?;
                    solved += 1;
                }
            }
        }
        if solved > 0 {
            log::info!("Solved microscopic parameters of {} reactions.", solved);
        }
        Ok(())
    }

    /// Solves one reaction (for order 1, its whole chain).
    pub fn solve(&mut self, id: ReactionId, ctx: &SolveContext) -> SimResult<()> {
        if !self.pairs_linked {
            self.link_pairs();
        }
        if !(ctx.dt > 0.0) {
            return Err(SimError::InvalidParameter(format!("time step {} must be positive", ctx.dt)));
        }
        match self.reactions[id].order() {
            0 => self.solve_zeroth(id, ctx),
            1 => {
                let key = self.reactions[id].reactants[0];
                self.solve_chain(key, ctx)
            }
            _ => self.solve_bimolecular(id, ctx),
        }
    }

    fn solve_zeroth(&mut self, id: ReactionId, ctx: &SolveContext) -> SimResult<()> {
        let r = &self.reactions[id];
        let extent = match r.locus {
            ZeroOrderLocus::System => ctx.volume,
            ZeroOrderLocus::Surface => ctx.surface_area,
        };
        if r.locus == ZeroOrderLocus::System && r.products.iter().any(|p| p.state.is_bound()) {
            return Err(SimError::InvalidReaction {
                name: r.name.clone(),
                reason: "bound products of a zeroth order reaction need the surface locus".to_string(),
            });
        }
        let lambda = r.rate * r.multiplicity as f64 * ctx.dt * extent;
        let mut solved = Solved::inert();
        solved.expected_events = lambda.max(0.0);
        solved.probability = clamp_probability(1.0 - (-lambda).exp());
        log::debug!("'{}': {:.4e} events per step", r.name, lambda);
        self.reactions[id].solved = Some(solved);
        Ok(())
    }

    /// Conditional probabilities of a competing-exponential race between all
    /// unimolecular reactions of `key`, tried in registration order.
    fn solve_chain(&mut self, key: SpeciesState, ctx: &SolveContext) -> SimResult<()> {
        let chain = self.first_order(key).to_vec();
        // partners supply the geminate correction and the unbinding radius
        for &id in &chain {
            if let Some(f) = self.reactions[id].partner {
                if self.reactions[f].solved.is_none() {
                    self.solve_bimolecular(f, ctx)?;
                }
            }
        }

        let mut rates = Vec::with_capacity(chain.len());
        let mut placements = Vec::with_capacity(chain.len());
        for &id in &chain {
            let r = &self.reactions[id];
            let pair = r.partner.and_then(|f| self.reactions[f].solved);
            let geminate = pair.map(|s| s.geminate).unwrap_or(0.0);
            if geminate >= 1.0 {
                return Err(SimError::InfeasiblePolicy {
                    name: r.name.clone(),
                    reason: "every released pair would rebind".to_string(),
                });
            }
            rates.push(r.rate * r.multiplicity as f64 / (1.0 - geminate));

            let distance = match (pair, r.policy) {
                (Some(s), _) => s.unbinding_radius,
                (None, Some(ReversibilityPolicy::UnbindingRadius(b))) => b,
                _ => 0.0,
            };
            let placement = if r.products.len() >= 2 && distance > 0.0 {
                ProductPlacement::Separate { distance }
            } else {
                ProductPlacement::AtReactionPoint
            };
            placements.push((placement, geminate, distance));
        }

        let total: f64 = chain
            .iter()
            .zip(&rates)
            .filter(|(id, _)| self.reactions[**id].requested_probability.is_none())
            .map(|(_, r)| r)
            .sum();
        let p_total = 1.0 - (-total * ctx.dt).exp();

        let mut fired = 0.0;
        for (k, &id) in chain.iter().enumerate() {
            let r = &self.reactions[id];
            let unconditional = match r.requested_probability {
                Some(p) => p,
                None if total > 0.0 => rates[k] / total * p_total,
                None => 0.0,
            };
            let remaining = 1.0 - fired;
            let conditional = if remaining > 0.0 { unconditional / remaining } else { 1.0 };
            fired += unconditional;

            let (placement, geminate, distance) = placements[k];
            let solved = Solved {
                probability: clamp_probability(conditional),
                expected_events: 0.0,
                capture_radius: 0.0,
                unbinding_radius: distance,
                geminate,
                placement,
            };
            log::debug!("'{}': probability {:.4e} per step", r.name, solved.probability);
            self.reactions[id].solved = Some(solved);
        }
        if fired > 1.0 + 1e-12 {
            log::warn!("Unimolecular reactions of {:?} fire with total probability {:.3} per step.", key, fired);
        }
        Ok(())
    }

    /// Rate multiplier for pair geometry: identical reactants are counted
    /// once per pair, and a bound reactant only meets partners from one side.
    fn encounter_factor(r: &Reaction) -> f64 {
        let (a, b) = (r.reactants[0], r.reactants[1]);
        let mut factor = 1.0;
        if a == b {
            factor *= 2.0;
        }
        if a.state.is_bound() != b.state.is_bound() {
            factor *= 2.0;
        }
        factor
    }

    fn solve_bimolecular(&mut self, id: ReactionId, ctx: &SolveContext) -> SimResult<()> {
        let r = &self.reactions[id];
        let name = r.name.clone();
        let unsolvable = |reason: &str| SimError::UnsolvableRate { name: name.clone(), reason: reason.to_string() };
        let infeasible = |reason: String| SimError::InfeasiblePolicy { name: name.clone(), reason };

        let d = ctx.difc(r.reactants[0])? + ctx.difc(r.reactants[1])?;
        let k_eff = r.rate * r.multiplicity as f64 * Self::encounter_factor(r);
        let dim = ctx.dim;

        let mut solved = Solved::inert();
        match r.policy {
            Some(ReversibilityPolicy::ConformationalSpread { radius }) => {
                if !(radius > 0.0) {
                    return Err(infeasible(format!("conformational spread radius {} must be positive", radius)));
                }
                solved.capture_radius = radius;
                solved.probability = clamp_probability(1.0 - (-k_eff * ctx.dt / ball_volume(dim, radius)).exp());
                solved.placement = ProductPlacement::Inherit;
            }
            policy => {
                let mut p = r.requested_probability.unwrap_or(1.0);
                let s = ctx.step_length(d);
                let target = if s > 0.0 { k_eff * ctx.dt / s.powi(dim as i32) } else { 0.0 };
                let a = match r.requested_radius {
                    Some(a) => {
                        if k_eff > 0.0 && r.requested_probability.is_none() {
                            if !(s > 0.0) {
                                return Err(unsolvable("both reactants are immobile"));
                            }
                            p = radial::probability_for(dim, a / s, target)
                                .ok_or_else(|| unsolvable("the capture radius is too small for the rate"))?;
                        }
                        a
                    }
                    None if k_eff == 0.0 => 0.0,
                    None => {
                        if !(s > 0.0) {
                            return Err(unsolvable("both reactants are immobile"));
                        }
                        radial::capture_radius_for(dim, target, p)
                            .ok_or_else(|| unsolvable("no capture radius reproduces the rate"))?
                            * s
                    }
                };
                solved.capture_radius = a;
                solved.probability = clamp_probability(p);
                solved.placement = match policy {
                    Some(ReversibilityPolicy::Bounce { separation }) => ProductPlacement::Bounce { separation },
                    _ => ProductPlacement::AtReactionPoint,
                };
            }
        }

        if r.partner.is_some() {
            let (b, pgem) = self.solve_unbinding(id, ctx, &solved, d)?;
            solved.unbinding_radius = b;
            solved.geminate = pgem;
        }
        log::debug!(
            "'{}': capture radius {:.4e}, probability {:.4}, unbinding radius {:.4e}, geminate {:.4}",
            name,
            solved.capture_radius,
            solved.probability,
            solved.unbinding_radius,
            solved.geminate
        );
        self.reactions[id].solved = Some(solved);
        if let Some(reverse) = self.reactions[id].partner {
            let key = self.reactions[reverse].reactants[0];
            self.solve_chain(key, ctx)?;
        }
        Ok(())
    }

    /// Unbinding radius and geminate probability of a reversible pair.
    fn solve_unbinding(&self, forward: ReactionId, ctx: &SolveContext, solved: &Solved, d: f64) -> SimResult<(f64, f64)> {
        let reverse = self.reactions[forward].partner.map(|r| &self.reactions[r]);
        let name = reverse.map(|r| r.name.clone()).unwrap_or_default();
        let infeasible = |reason: String| SimError::InfeasiblePolicy { name: name.clone(), reason };

        let dim = ctx.dim;
        let s = ctx.step_length(d);
        let a = solved.capture_radius;
        let p = solved.probability;
        let geminate_at = |b: f64| -> SimResult<f64> {
            if !(s > 0.0) || !(a > 0.0) {
                return Ok(0.0);
            }
            radial::geminate_probability(dim, a / s, p, b / s)
                .ok_or_else(|| SimError::UnsolvableRate { name: name.clone(), reason: "radial solve failed".to_string() })
        };

        match self.pair_policy(forward) {
            // the default is a ceiling; pairs that cannot reach it separate at contact
            None => {
                let target = DEFAULT_GEMINATE_PROBABILITY;
                let at_contact = geminate_at(0.0)?;
                if at_contact <= target {
                    if at_contact == 0.0 {
                        return Ok((0.0, 0.0));
                    }
                    log::warn!(
                        "'{}': geminate probability {} is out of reach (at most {:.4} at contact); releasing products at contact.",
                        name,
                        target,
                        at_contact
                    );
                    return Ok((0.0, at_contact));
                }
                let b = radial::unbinding_radius_for(dim, a / s, p, target).ok_or_else(|| {
                    infeasible(format!("geminate probability {} cannot be reached with this capture radius", target))
                })?;
                Ok((b * s, target))
            }
            Some(ReversibilityPolicy::GeminateProbability(target)) => {
                if !(target > 0.0 && target < 1.0) {
                    return Err(infeasible(format!("geminate probability {} must lie in (0, 1)", target)));
                }
                if !(s > 0.0) || !(a > 0.0) {
                    return Err(infeasible("a geminate probability needs mobile reactants and a capture radius".to_string()));
                }
                let b = radial::unbinding_radius_for(dim, a / s, p, target).ok_or_else(|| {
                    infeasible(format!("geminate probability {} cannot be reached with this capture radius", target))
                })?;
                Ok((b * s, target))
            }
            Some(ReversibilityPolicy::FixedRatio(ratio)) => {
                if !(ratio > 0.0 && ratio <= 1.0) {
                    return Err(infeasible(format!("radius ratio {} must lie in (0, 1]", ratio)));
                }
                let b = a / ratio;
                let pgem = geminate_at(b)?;
                if pgem >= 1.0 {
                    return Err(infeasible(format!("every pair released at {:.4e} rebinds", b)));
                }
                Ok((b, pgem))
            }
            Some(ReversibilityPolicy::UnbindingRadius(b)) => {
                if !(b >= 0.0) {
                    return Err(infeasible(format!("unbinding radius {} must not be negative", b)));
                }
                let pgem = geminate_at(b)?;
                if pgem >= 1.0 {
                    return Err(infeasible(format!("every pair released at {:.4e} rebinds", b)));
                }
                Ok((b, pgem))
            }
            _ => Ok((0.0, 0.0)),
        }
    }

    /// Macroscopic rate reproduced by the solved parameters of `id`.
    pub fn effective_rate(&self, id: ReactionId, ctx: &SolveContext) -> SimResult<f64> {
        let r = &self.reactions[id];
        let solved = r
            .solved
            .ok_or_else(|| SimError::InvalidParameter(format!("reaction '{}' is not solved", r.name)))?;
        let multiplicity = (r.multiplicity as f64).max(f64::MIN_POSITIVE);
        match r.order() {
            0 => {
                let extent = match r.locus {
                    ZeroOrderLocus::System => ctx.volume,
                    ZeroOrderLocus::Surface => ctx.surface_area,
                };
                Ok(solved.expected_events / (ctx.dt * extent * multiplicity))
            }
            1 => {
                // undo the conditioning to get each unconditional probability
                let chain = self.first_order(r.reactants[0]);
                let mut survive = 1.0;
                let mut own = 0.0;
                let mut total = 0.0;
                for &other in chain {
                    let q = self.reactions[other].solved.map(|s| s.probability).unwrap_or(0.0);
                    let unconditional = survive * q;
                    if other == id {
                        own = unconditional;
                    }
                    total += unconditional;
                    survive *= 1.0 - q;
                }
                if !(total > 0.0) {
                    return Ok(0.0);
                }
                let race = -(1.0 - total.min(1.0 - 1e-15)).ln() / ctx.dt;
                Ok(own / total * race * (1.0 - solved.geminate) / multiplicity)
            }
            _ => {
                let factor = Self::encounter_factor(r) * multiplicity;
                if let Some(ReversibilityPolicy::ConformationalSpread { radius }) = r.policy {
                    let volume = ball_volume(ctx.dim, radius);
                    return Ok(-(1.0 - solved.probability.min(1.0 - 1e-15)).ln() * volume / ctx.dt / factor);
                }
                let d = ctx.difc(r.reactants[0])? + ctx.difc(r.reactants[1])?;
                let s = ctx.step_length(d);
                if !(s > 0.0) || !(solved.capture_radius > 0.0) {
                    return Ok(0.0);
                }
                let geometry = radial::PairGeometry::irreversible(ctx.dim, solved.capture_radius / s, solved.probability);
                let q = radial::reaction_volume(&geometry).ok_or_else(|| SimError::UnsolvableRate {
                    name: r.name.clone(),
                    reason: "radial solve failed".to_string(),
                })?;
                Ok(q * s.powi(ctx.dim as i32) / ctx.dt / factor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::species::{MolState, Species};
    use approx::assert_relative_eq;

    fn registry() -> SpeciesRegistry {
        let mut reg = SpeciesRegistry::new();
        reg.add(Species::new("A", 1.0));
        reg.add(Species::new("B", 0.0));
        reg.add(Species::new("C", 0.5));
        reg.add(Species::new("S", 0.0));
        reg
    }

    fn ctx(reg: &SpeciesRegistry) -> SolveContext<'_> {
        SolveContext { dim: 3, dt: 1e-3, volume: 1.0, surface_area: 0.0, species: reg }
    }

    fn key(reg: &SpeciesRegistry, name: &str) -> SpeciesState {
        reg.parse(name).unwrap()
    }

    #[test]
    fn duplicate_names_and_signatures_are_rejected() {
        let reg = registry();
        let mut model = ReactionModel::new();
        let (a, b, c) = (key(&reg, "A"), key(&reg, "B"), key(&reg, "C"));
        model.register("bind", &[a, b], &[c]).unwrap();
        assert!(matches!(model.register("bind", &[a], &[]), Err(SimError::DuplicateReaction(_))));
        assert!(matches!(model.register("again", &[b, a], &[c]), Err(SimError::DuplicateReaction(_))));
        assert_eq!(model.second_order(b, a), &[0]);
        assert!(model.second_order(a, a).is_empty());
    }

    #[test]
    fn bound_products_need_a_bound_reactant() {
        let reg = registry();
        let mut model = ReactionModel::new();
        let a = key(&reg, "A");
        let bound = SpeciesState::new(a.species, MolState::Front);
        assert!(matches!(model.register("stick", &[a], &[bound]), Err(SimError::InvalidReaction { .. })));
        model.register("flip", &[bound], &[SpeciesState::new(a.species, MolState::Back)]).unwrap();
    }

    #[test]
    fn bimolecular_rate_round_trips_over_decades() {
        let reg = registry();
        let ctx = ctx(&reg);
        let mut model = ReactionModel::new();
        let id = model.register("bind", &[key(&reg, "A"), key(&reg, "B")], &[key(&reg, "C")]).unwrap();
        model.set_policy(id, ReversibilityPolicy::Irreversible).unwrap();
        for rate in [1e-4, 1e-2, 1.0, 100.0] {
            model.set_rate(id, rate).unwrap();
            model.solve_all(&ctx).unwrap();
            let solved = *model.get(id).solved().unwrap();
            assert!(solved.capture_radius >= 0.0);
            assert!((0.0..=1.0).contains(&solved.probability));
            assert_relative_eq!(model.effective_rate(id, &ctx).unwrap(), rate, max_relative = 1e-3);
        }
    }

    #[test]
    fn identical_reactants_double_the_capture_volume() {
        let reg = registry();
        let ctx = ctx(&reg);
        let mut model = ReactionModel::new();
        let (a, c) = (key(&reg, "A"), key(&reg, "C"));
        let same = model.register("dimerize", &[a, a], &[c]).unwrap();
        let other = model.register("mix", &[a, c], &[]).unwrap();
        model.set_rate(same, 0.01).unwrap();
        model.set_rate(other, 0.01).unwrap();
        model.solve_all(&ctx).unwrap();
        assert_relative_eq!(model.effective_rate(same, &ctx).unwrap(), 0.01, max_relative = 1e-3);
        let r_same = model.get(same).solved().unwrap().capture_radius;
        assert!(r_same > 0.0);
    }

    #[test]
    fn immobile_reactants_cannot_be_solved() {
        let reg = registry();
        let mut model = ReactionModel::new();
        let id = model.register("stuck", &[key(&reg, "B"), key(&reg, "S")], &[]).unwrap();
        model.set_rate(id, 1.0).unwrap();
        assert!(matches!(model.solve_all(&ctx(&reg)), Err(SimError::UnsolvableRate { .. })));

        model.set_rate(id, 0.0).unwrap();
        model.solve_all(&ctx(&reg)).unwrap();
        assert_eq!(model.get(id).solved().unwrap().capture_radius, 0.0);
    }

    #[test]
    fn unimolecular_chain_reproduces_competing_exponentials() {
        let reg = registry();
        let ctx = SolveContext { dt: 0.1, ..ctx(&reg) };
        let mut model = ReactionModel::new();
        let a = key(&reg, "A");
        let first = model.register("toB", &[a], &[key(&reg, "B")]).unwrap();
        let second = model.register("toC", &[a], &[key(&reg, "C")]).unwrap();
        model.set_rate(first, 1.0).unwrap();
        model.set_rate(second, 3.0).unwrap();
        model.solve_all(&ctx).unwrap();

        let q1 = model.get(first).solved().unwrap().probability;
        let q2 = model.get(second).solved().unwrap().probability;
        let total = 1.0 - (-4.0f64 * 0.1).exp();
        assert_relative_eq!(q1, 0.25 * total, max_relative = 1e-12);
        assert_relative_eq!((1.0 - q1) * q2, 0.75 * total, max_relative = 1e-12);
        assert_relative_eq!(model.effective_rate(second, &ctx).unwrap(), 3.0, max_relative = 1e-9);
    }

    #[test]
    fn reversible_pair_gets_default_geminate_policy() {
        let reg = registry();
        let ctx = ctx(&reg);
        let mut model = ReactionModel::new();
        let (a, b, c) = (key(&reg, "A"), key(&reg, "B"), key(&reg, "C"));
        let fwd = model.register("bind", &[a, b], &[c]).unwrap();
        let rev = model.register("unbind", &[c], &[b, a]).unwrap();
        model.set_rate(fwd, 1.0).unwrap();
        model.set_rate(rev, 2.0).unwrap();
        model.solve_all(&ctx).unwrap();

        assert_eq!(model.get(fwd).partner(), Some(rev));
        let fs = *model.get(fwd).solved().unwrap();
        assert_relative_eq!(fs.geminate, DEFAULT_GEMINATE_PROBABILITY);
        assert!(fs.unbinding_radius > 0.0);
        let rs = *model.get(rev).solved().unwrap();
        assert_eq!(rs.placement, ProductPlacement::Separate { distance: fs.unbinding_radius });
        // the reverse micro-rate is raised so net dissociation matches the request
        assert_relative_eq!(rs.probability, 1.0 - (-2.0 / 0.8 * 1e-3f64).exp(), max_relative = 1e-12);
        assert_relative_eq!(model.effective_rate(rev, &ctx).unwrap(), 2.0, max_relative = 1e-9);
    }

    #[test]
    fn slow_binding_releases_at_contact_under_the_default_policy() {
        let mut reg = registry();
        reg.add(Species::new("E", 1.0));
        let ctx = SolveContext { dt: 0.01, ..ctx(&reg) };
        let mut model = ReactionModel::new();
        let (a, e, c) = (key(&reg, "A"), key(&reg, "E"), key(&reg, "C"));
        let fwd = model.register("bind", &[a, e], &[c]).unwrap();
        let rev = model.register("unbind", &[c], &[a, e]).unwrap();
        model.set_rate(fwd, 0.5).unwrap();
        model.set_rate(rev, 1.0).unwrap();
        model.solve_all(&ctx).unwrap();

        let fs = *model.get(fwd).solved().unwrap();
        assert_eq!(fs.unbinding_radius, 0.0);
        assert!(fs.geminate > 0.0 && fs.geminate < DEFAULT_GEMINATE_PROBABILITY, "{}", fs.geminate);
        assert_eq!(model.get(rev).solved().unwrap().placement, ProductPlacement::AtReactionPoint);
        assert_relative_eq!(model.effective_rate(rev, &ctx).unwrap(), 1.0, max_relative = 1e-9);

        // an explicit request for the same value stays strict
        model.set_policy(rev, ReversibilityPolicy::GeminateProbability(DEFAULT_GEMINATE_PROBABILITY)).unwrap();
        assert!(matches!(model.solve_all(&ctx), Err(SimError::InfeasiblePolicy { .. })));
    }

    #[test]
    fn infeasible_policies_are_reported() {
        let reg = registry();
        let ctx = ctx(&reg);
        let mut model = ReactionModel::new();
        let (a, b, c) = (key(&reg, "A"), key(&reg, "B"), key(&reg, "C"));
        let fwd = model.register("bind", &[a, b], &[c]).unwrap();
        let rev = model.register("unbind", &[c], &[a, b]).unwrap();
        model.set_rate(fwd, 1.0).unwrap();
        model.set_rate(rev, 1.0).unwrap();

        model.set_policy(rev, ReversibilityPolicy::FixedRatio(1.5)).unwrap();
        assert!(matches!(model.solve_all(&ctx), Err(SimError::InfeasiblePolicy { .. })));

        model.set_policy(rev, ReversibilityPolicy::GeminateProbability(0.999)).unwrap();
        assert!(matches!(model.solve_all(&ctx), Err(SimError::InfeasiblePolicy { .. })));

        model.set_policy(rev, ReversibilityPolicy::FixedRatio(0.5)).unwrap();
        model.solve_all(&ctx).unwrap();
        let fs = model.get(fwd).solved().unwrap();
        assert_relative_eq!(fs.unbinding_radius, 2.0 * fs.capture_radius);
        assert!(fs.geminate > 0.0 && fs.geminate < 1.0);
    }

    #[test]
    fn zeroth_order_uses_system_volume() {
        let reg = registry();
        let ctx = SolveContext { volume: 8.0, ..ctx(&reg) };
        let mut model = ReactionModel::new();
        let id = model.register("make", &[], &[key(&reg, "A")]).unwrap();
        model.set_rate(id, 5.0).unwrap();
        model.set_multiplicity(id, 2).unwrap();
        model.solve_all(&ctx).unwrap();
        let s = model.get(id).solved().unwrap();
        assert_relative_eq!(s.expected_events, 5.0 * 2.0 * 1e-3 * 8.0);
        assert_relative_eq!(model.effective_rate(id, &ctx).unwrap(), 5.0, max_relative = 1e-12);
    }

    #[test]
    fn setters_invalidate_solved_parameters() {
        let reg = registry();
        let ctx = ctx(&reg);
        let mut model = ReactionModel::new();
        let a = key(&reg, "A");
        let id = model.register("decay", &[a], &[]).unwrap();
        model.set_rate(id, 1.0).unwrap();
        model.solve_all(&ctx).unwrap();
        assert!(model.is_solved());
        model.set_rate(id, 2.0).unwrap();
        assert!(!model.is_solved());
        assert!(model.set_probability(id, 1.5).is_err());
    }

    #[test]
    fn conformational_spread_uses_a_fixed_radius() {
        let reg = registry();
        let ctx = ctx(&reg);
        let mut model = ReactionModel::new();
        let (a, c) = (key(&reg, "A"), key(&reg, "C"));
        let id = model.register("spread", &[a, c], &[c, c]).unwrap();
        model.set_rate(id, 0.5).unwrap();
        model.set_policy(id, ReversibilityPolicy::ConformationalSpread { radius: 0.05 }).unwrap();
        model.solve_all(&ctx).unwrap();
        let s = model.get(id).solved().unwrap();
        assert_eq!(s.capture_radius, 0.05);
        assert_eq!(s.placement, ProductPlacement::Inherit);
        assert_relative_eq!(model.effective_rate(id, &ctx).unwrap(), 0.5, max_relative = 1e-9);
    }
}
