//! Single-molecule displacement and boundary handling.

use rand::Rng;
use rand_distr::StandardNormal;
use rdsim_common::{BoundaryType, SimParams, Vec3};

use crate::species::Motion;

/// What happened to a molecule at the system boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Kept,
    /// Crossed an absorbing face and must be removed.
    Absorbed,
}

/// Rms displacement along one axis for diffusion coefficient `difc`.
pub fn step_length(difc: f64, dt: f64) -> f64 {
    (2.0 * difc * dt).sqrt()
}

/// Random displacement over one time step: Gaussian diffusion, optionally
/// shaped by a square-root diffusion matrix, plus drift.
pub fn displacement<R: Rng + ?Sized>(motion: &Motion, dim: usize, dt: f64, rng: &mut R) -> Vec3 {
    let mut step = Vec3::zero();
    if motion.difc > 0.0 || motion.matrix.is_some() {
        let mut noise = Vec3::zero();
        for axis in 0..dim {
            noise[axis] = rng.sample::<f64, _>(StandardNormal);
        }
        match &motion.matrix {
            Some(m) => {
                let scale = (2.0 * dt).sqrt();
                for (row, out) in m.iter().enumerate().take(dim) {
                    let dot: f64 = (0..dim).map(|col| out[col] * noise[col]).sum();
                    step[row] = dot * scale;
                }
            }
            None => step = noise * step_length(motion.difc, dt),
        }
    }
    for axis in 0..dim {
        step[axis] += motion.drift[axis] * dt;
    }
    step
}

/// Folds `pos` back into the system according to each axis' boundary type.
pub fn apply_boundaries(pos: &mut Vec3, params: &SimParams) -> Fate {
    let mut fate = Fate::Kept;
    for axis in 0..params.dim {
        let (low, high) = (params.low[axis], params.high[axis]);
        let x = pos[axis];
        if x >= low && x <= high {
            continue;
        }
        match params.boundaries[axis] {
            BoundaryType::Reflect => pos[axis] = reflect(x, low, high),
            BoundaryType::Periodic => {
                let side = high - low;
                let mut wrapped = low + (x - low).rem_euclid(side);
                // rem_euclid can round up to exactly `side`
                if wrapped >= high {
                    wrapped = low;
                }
                pos[axis] = wrapped;
            }
            BoundaryType::Absorb => fate = Fate::Absorbed,
            BoundaryType::Transparent => {}
        }
    }
    fate
}

/// Mirror image of `x` inside `[low, high]`, folding as often as needed.
fn reflect(x: f64, low: f64, high: f64) -> f64 {
    let side = high - low;
    if !(side > 0.0) {
        return low;
    }
    let t = (x - low).rem_euclid(2.0 * side);
    let folded = if t > side { 2.0 * side - t } else { t };
    low + folded
}

/// Uniform point in the axis-aligned box `[low, high]` on the active axes.
pub fn uniform_point<R: Rng + ?Sized>(low: Vec3, high: Vec3, dim: usize, rng: &mut R) -> Vec3 {
    let mut out = Vec3::zero();
    for axis in 0..dim {
        let u: f64 = rng.random();
        out[axis] = low[axis] + u * (high[axis] - low[axis]);
    }
    out
}

/// Seed of the displacement stream of one molecule at one tick. Streams of
/// different (serial, tick) pairs must not coincide.
pub fn stream_seed(seed: u64, serial: u64, tick: u64) -> u64 {
    let mut z = seed
        .wrapping_add(serial.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(tick.wrapping_mul(0xD1B5_4A32_D192_ED03));
    // splitmix64 finalizer
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rdsim_common::GridSizing;

    fn params(boundary: BoundaryType) -> SimParams {
        SimParams {
            dim: 2,
            low: Vec3::zero(),
            high: Vec3::new(1.0, 2.0, 0.0),
            boundaries: [boundary; 3],
            grid_sizing: GridSizing::BoxSize(0.5),
            dt: 0.1,
            time_step: 0,
            seed: 3,
            max_molecules: None,
        }
    }

    #[test]
    fn reflection_folds_back_inside() {
        let p = params(BoundaryType::Reflect);
        let mut pos = Vec3::new(-0.25, 2.5, 0.0);
        assert_eq!(apply_boundaries(&mut pos, &p), Fate::Kept);
        assert_relative_eq!(pos.x, 0.25);
        assert_relative_eq!(pos.y, 1.5);

        let mut far = Vec3::new(2.75, 0.5, 0.0);
        apply_boundaries(&mut far, &p);
        assert_relative_eq!(far.x, 0.75, epsilon = 1e-12);
    }

    #[test]
    fn periodic_wraps_and_absorb_reports() {
        let mut pos = Vec3::new(1.25, -0.5, 0.0);
        apply_boundaries(&mut pos, &params(BoundaryType::Periodic));
        assert_relative_eq!(pos.x, 0.25, epsilon = 1e-12);
        assert_relative_eq!(pos.y, 1.5, epsilon = 1e-12);

        let mut out = Vec3::new(1.25, 0.5, 0.0);
        assert_eq!(apply_boundaries(&mut out, &params(BoundaryType::Absorb)), Fate::Absorbed);

        let mut free = Vec3::new(1.25, 0.5, 0.0);
        assert_eq!(apply_boundaries(&mut free, &params(BoundaryType::Transparent)), Fate::Kept);
        assert_eq!(free.x, 1.25);
    }

    #[test]
    fn isotropic_steps_have_the_expected_variance() {
        let motion = Motion { difc: 2.0, drift: Vec3::new(1.0, 0.0, 5.0), matrix: None };
        let mut rng = StdRng::seed_from_u64(42);
        let n = 20_000;
        let (mut sum, mut sum_sq) = (0.0, 0.0);
        for _ in 0..n {
            let d = displacement(&motion, 2, 0.01, &mut rng);
            assert_eq!(d.z, 0.0);
            sum += d.x;
            sum_sq += d.y * d.y;
        }
        assert_relative_eq!(sum / n as f64, 0.01, epsilon = 3e-3);
        assert_relative_eq!(sum_sq / n as f64, 2.0 * 2.0 * 0.01, max_relative = 0.05);
    }

    #[test]
    fn matrix_diffusion_is_confined_to_its_rows() {
        let m = [[1.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]];
        let motion = Motion { difc: 0.0, drift: Vec3::zero(), matrix: Some(m) };
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..100 {
            let d = displacement(&motion, 3, 0.5, &mut rng);
            assert_eq!(d.y, 0.0);
            assert_eq!(d.z, 0.0);
        }
    }

    #[test]
    fn stream_seeds_differ_across_serials_and_ticks() {
        assert_ne!(stream_seed(1, 2, 1), stream_seed(1, 1, 2));
        assert_ne!(stream_seed(1, 1, 1), stream_seed(2, 1, 1));
        assert_eq!(stream_seed(7, 3, 4), stream_seed(7, 3, 4));
    }

    #[test]
    fn uniform_points_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let p = uniform_point(Vec3::new(1.0, 2.0, 3.0), Vec3::new(2.0, 4.0, 6.0), 2, &mut rng);
            assert!(p.x >= 1.0 && p.x < 2.0);
            assert!(p.y >= 2.0 && p.y < 4.0);
            assert_eq!(p.z, 0.0);
        }
    }
}
