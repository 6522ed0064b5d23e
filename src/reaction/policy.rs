//! Reversibility policies and product placement geometry.

use rand::Rng;
use rand_distr::{Distribution, UnitCircle, UnitSphere};
use rdsim_common::{PlacementConfig, Vec3};

/// Geminate probability used for a reversible pair that names no policy.
pub const DEFAULT_GEMINATE_PROBABILITY: f64 = 0.2;

/// How a reaction separates its products, and for reversible pairs, how the
/// unbinding radius is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReversibilityPolicy {
    /// Products appear at the reaction point; no geminate correction.
    Irreversible,
    /// Fixed interaction radius; each product takes its reactant's position.
    ConformationalSpread { radius: f64 },
    /// Products are pushed apart: to `separation` if given, otherwise
    /// reflected through the capture radius.
    Bounce { separation: Option<f64> },
    /// Unbinding radius solved so this fraction of releases rebind.
    GeminateProbability(f64),
    /// Capture radius over unbinding radius, in (0, 1].
    FixedRatio(f64),
    UnbindingRadius(f64),
}

impl ReversibilityPolicy {
    /// Policies that describe a forward/reverse pair rather than a single reaction.
    pub fn is_pair_policy(self) -> bool {
        matches!(
            self,
            ReversibilityPolicy::Irreversible
                | ReversibilityPolicy::GeminateProbability(_)
                | ReversibilityPolicy::FixedRatio(_)
                | ReversibilityPolicy::UnbindingRadius(_)
        )
    }
}

impl From<&PlacementConfig> for ReversibilityPolicy {
    fn from(cfg: &PlacementConfig) -> Self {
        match cfg {
            PlacementConfig::Irreversible => ReversibilityPolicy::Irreversible,
            PlacementConfig::Confspread { radius } => ReversibilityPolicy::ConformationalSpread { radius: *radius },
            PlacementConfig::Bounce { separation } => ReversibilityPolicy::Bounce { separation: *separation },
            PlacementConfig::Pgem { probability } => ReversibilityPolicy::GeminateProbability(*probability),
            PlacementConfig::Ratio { ratio } => ReversibilityPolicy::FixedRatio(*ratio),
            PlacementConfig::Unbindrad { radius } => ReversibilityPolicy::UnbindingRadius(*radius),
        }
    }
}

/// Solved product placement of one reaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProductPlacement {
    AtReactionPoint,
    /// Product `i` takes the position of reactant `i`.
    Inherit,
    /// First two products placed `distance` apart along a random direction.
    Separate { distance: f64 },
    Bounce { separation: Option<f64> },
}

/// Uniformly distributed unit vector in the active dimensions.
pub fn random_direction<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Vec3 {
    match dim {
        1 => Vec3::new(if rng.random::<bool>() { 1.0 } else { -1.0 }, 0.0, 0.0),
        2 => {
            let [x, y]: [f64; 2] = UnitCircle.sample(rng);
            Vec3::new(x, y, 0.0)
        }
        _ => {
            let [x, y, z]: [f64; 3] = UnitSphere.sample(rng);
            Vec3::new(x, y, z)
        }
    }
}

/// Share of a separation taken up by each partner: the faster one moves more.
fn split(d1: f64, d2: f64) -> (f64, f64) {
    let total = d1 + d2;
    if total > 0.0 {
        (d1 / total, d2 / total)
    } else {
        (0.5, 0.5)
    }
}

/// Point between two reactants, weighted by their diffusion coefficients.
pub fn reaction_point(p1: Vec3, d1: f64, p2: Vec3, d2: f64) -> Vec3 {
    let (w1, _) = split(d1, d2);
    p1 + (p2 - p1) * w1
}

/// Places two partners `distance` apart along `direction` around `center`.
pub fn separate(center: Vec3, direction: Vec3, distance: f64, d1: f64, d2: f64) -> (Vec3, Vec3) {
    let (w1, w2) = split(d1, d2);
    (center - direction * (distance * w1), center + direction * (distance * w2))
}

/// New positions of a bounced pair around its reaction point, offset along
/// the pair's relative step over the last time step. Without a relative
/// step the inter-center direction is used, then a random one. The
/// separation becomes `separation`, or `2 * capture - r` when none is given.
#[allow(clippy::too_many_arguments)]
pub fn bounce<R: Rng + ?Sized>(
    p1: Vec3,
    d1: f64,
    p2: Vec3,
    d2: f64,
    capture: f64,
    separation: Option<f64>,
    relative_step: Vec3,
    dim: usize,
    rng: &mut R,
) -> (Vec3, Vec3) {
    let delta = p2 - p1;
    let r = delta.length();
    let direction = if relative_step.length_squared() > 0.0 {
        relative_step.normalize_or_zero()
    } else if r > 0.0 {
        delta / r
    } else {
        random_direction(dim, rng)
    };
    let distance = separation.unwrap_or(2.0 * capture - r).max(0.0);
    separate(reaction_point(p1, d1, p2, d2), direction, distance, d1, d2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn reaction_point_favors_the_slower_reactant() {
        let p1 = Vec3::new(0.0, 0.0, 0.0);
        let p2 = Vec3::new(1.0, 0.0, 0.0);
        assert_eq!(reaction_point(p1, 1.0, p2, 0.0), p2);
        assert_eq!(reaction_point(p1, 0.0, p2, 0.0), Vec3::new(0.5, 0.0, 0.0));
        assert_eq!(reaction_point(p1, 3.0, p2, 1.0), Vec3::new(0.75, 0.0, 0.0));
    }

    #[test]
    fn separation_is_exact_and_weighted() {
        let center = Vec3::new(1.0, 1.0, 1.0);
        let dir = Vec3::new(0.0, 1.0, 0.0);
        let (a, b) = separate(center, dir, 0.4, 1.0, 0.0);
        assert_relative_eq!(a.distance(b), 0.4);
        assert_eq!(b, center);
    }

    #[test]
    fn bounce_reflects_through_the_capture_radius() {
        let mut rng = StdRng::seed_from_u64(5);
        let p1 = Vec3::new(0.0, 0.0, 0.0);
        let p2 = Vec3::new(0.3, 0.0, 0.0);
        let (a, b) = bounce(p1, 1.0, p2, 1.0, 0.5, None, Vec3::zero(), 3, &mut rng);
        assert_relative_eq!(a.distance(b), 0.7, epsilon = 1e-12);
        assert!(b.x > a.x);

        let (a, b) = bounce(p1, 1.0, p1, 1.0, 0.5, Some(0.2), Vec3::new(0.0, 2.0, 0.0), 3, &mut rng);
        assert_relative_eq!(a.distance(b), 0.2, epsilon = 1e-12);
        assert_relative_eq!(b.y - a.y, 0.2, epsilon = 1e-12);
    }

    #[test]
    fn bounce_follows_the_relative_step() {
        let mut rng = StdRng::seed_from_u64(9);
        let p1 = Vec3::new(0.0, 0.0, 0.0);
        let p2 = Vec3::new(0.3, 0.0, 0.0);
        let (a, b) = bounce(p1, 1.0, p2, 1.0, 0.5, Some(0.6), Vec3::new(0.0, 1.0, 0.0), 3, &mut rng);
        assert_relative_eq!(b.y - a.y, 0.6, epsilon = 1e-12);
        assert_relative_eq!(a.x, 0.15, epsilon = 1e-12);
        assert_relative_eq!(b.x, 0.15, epsilon = 1e-12);

        // the faster partner takes the larger share
        let (a, b) = bounce(p1, 3.0, p2, 1.0, 0.5, Some(0.4), Vec3::new(0.0, 0.0, -2.0), 3, &mut rng);
        let center = reaction_point(p1, 3.0, p2, 1.0);
        assert_relative_eq!(center.z - a.z, -0.3, epsilon = 1e-12);
        assert_relative_eq!(b.z - center.z, -0.1, epsilon = 1e-12);
    }

    #[test]
    fn random_directions_are_unit_length() {
        let mut rng = StdRng::seed_from_u64(11);
        for dim in 1..=3 {
            for _ in 0..50 {
                let v = random_direction(dim, &mut rng);
                assert_relative_eq!(v.length(), 1.0, epsilon = 1e-12);
                for axis in dim..3 {
                    assert_eq!(v[axis], 0.0);
                }
            }
        }
    }
}
