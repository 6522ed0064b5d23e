//! Steady-state radial distribution of a reacting pair under the discrete
//! algorithm: every step the pair separation takes a Gaussian jump, then a
//! pair closer than the capture radius reacts with the per-collision
//! probability. Reversible pairs put the reacted mass back at the unbinding
//! radius.
//!
//! Lengths are in units of the per-axis rms step `s = sqrt(2 D dt)`. The
//! result of a solve is the reaction volume `Q`, the number of reactions per
//! step per unit pair density; the macroscopic rate is `Q s^dim / dt`.
//!
//! The separation axis is cut into thin shells. The one-step transfer
//! between shells is integrated numerically from the exact radial jump
//! density, so the steady state is a banded linear system which we factor
//! directly. Far from the capture radius the distribution follows the
//! continuum form `1 - c/r` in 3D and is pinned to 1 in 1D and 2D.

use crate::stats::{ball_volume, bessel_i0e, normal_pdf, shell_volume, GAUSS_LEGENDRE_4};

/// Target shell width.
const CELL_WIDTH: f64 = 0.1;
/// Jumps longer than this are neglected.
const REACH: f64 = 8.0;
/// Solved shells extend this far past the outermost radius of interest.
const FIELD: f64 = 7.0;
const MAX_CELLS: usize = 3000;
const MAX_DOUBLINGS: usize = 48;
const MAX_BISECTIONS: usize = 200;

/// One reacting pair in reduced units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairGeometry {
    pub dim: usize,
    pub capture: f64,
    pub probability: f64,
    /// Unbinding radius of re-injected pairs; `None` for irreversible binding.
    pub unbinding: Option<f64>,
}

impl PairGeometry {
    pub fn irreversible(dim: usize, capture: f64, probability: f64) -> Self {
        PairGeometry { dim, capture, probability, unbinding: None }
    }

    pub fn reversible(dim: usize, capture: f64, probability: f64, unbinding: f64) -> Self {
        PairGeometry { dim, capture, probability, unbinding: Some(unbinding) }
    }
}

fn sinhc(x: f64) -> f64 {
    if x < 1e-4 {
        1.0 + x * x / 6.0
    } else {
        x.sinh() / x
    }
}

/// Density of landing at separation `rp` after one step from separation `r`.
fn jump_density(dim: usize, r: f64, rp: f64) -> f64 {
    match dim {
        1 => normal_pdf(rp - r) + normal_pdf(rp + r),
        2 => rp * (-0.5 * (rp - r) * (rp - r)).exp() * bessel_i0e(r * rp),
        _ => {
            let x = r * rp;
            if x < 1.0 {
                2.0 * rp * rp * normal_pdf(rp) * (-0.5 * r * r).exp() * sinhc(x)
            } else {
                rp / r * (normal_pdf(rp - r) - normal_pdf(rp + r))
            }
        }
    }
}

/// Probability that a pair at separation `r` lands in the shell `[lo, hi]`.
fn transfer(dim: usize, r: f64, lo: f64, hi: f64) -> f64 {
    let lo = lo.max(r - REACH).max(0.0);
    let hi = hi.min(r + REACH);
    if hi <= lo {
        return 0.0;
    }
    let panels = ((hi - lo) / CELL_WIDTH).ceil().max(1.0) as usize;
    let half = 0.5 * (hi - lo) / panels as f64;
    let mut sum = 0.0;
    for k in 0..panels {
        let mid = lo + (2 * k + 1) as f64 * half;
        for (x, w) in GAUSS_LEGENDRE_4 {
            sum += w * half * jump_density(dim, r, mid + half * x);
        }
    }
    sum
}

/// Quadrature points of a shell, weighted by the radial volume element.
fn source_points(dim: usize, lo: f64, hi: f64) -> [(f64, f64); 4] {
    let mid = 0.5 * (lo + hi);
    let half = 0.5 * (hi - lo);
    let mut pts = [(0.0, 0.0); 4];
    let mut total = 0.0;
    for (k, (x, w)) in GAUSS_LEGENDRE_4.iter().enumerate() {
        let r = mid + half * x;
        let weight = w * r.powi(dim as i32 - 1);
        pts[k] = (r, weight);
        total += weight;
    }
    for p in &mut pts {
        p.1 /= total;
    }
    pts
}

fn shell_transfer(dim: usize, pts: &[(f64, f64); 4], lo: f64, hi: f64) -> f64 {
    pts.iter().map(|(r, w)| w * transfer(dim, *r, lo, hi)).sum()
}

/// Square band matrix with `kb` diagonals on each side, row major.
struct BandMatrix {
    n: usize,
    kb: usize,
    data: Vec<f64>,
}

impl BandMatrix {
    fn identity(n: usize, kb: usize) -> Self {
        let width = 2 * kb + 1;
        let mut data = vec![0.0; n * width];
        for i in 0..n {
            data[i * width + kb] = 1.0;
        }
        BandMatrix { n, kb, data }
    }

    #[inline]
    fn idx(&self, i: usize, j: usize) -> usize {
        i * (2 * self.kb + 1) + (j + self.kb - i)
    }

    fn add(&mut self, i: usize, j: usize, v: f64) {
        let k = self.idx(i, j);
        self.data[k] += v;
    }

    fn get(&self, i: usize, j: usize) -> f64 {
        self.data[self.idx(i, j)]
    }

    /// In-place LU without pivoting. The steady-state matrix is diagonally
    /// dominant, so pivoting is unnecessary.
    fn factor(&mut self) -> Option<()> {
        let (n, kb) = (self.n, self.kb);
        for k in 0..n {
            let pivot = self.get(k, k);
            if !(pivot.abs() > 1e-300) {
                return None;
            }
            let end = (k + kb + 1).min(n);
            for i in k + 1..end {
                let ik = self.idx(i, k);
                let l = self.data[ik] / pivot;
                if l == 0.0 {
                    continue;
                }
                self.data[ik] = l;
                for j in k + 1..end {
                    let kj = self.get(k, j);
                    let ij = self.idx(i, j);
                    self.data[ij] -= l * kj;
                }
            }
        }
        Some(())
    }

    fn solve(&self, x: &mut [f64]) {
        let (n, kb) = (self.n, self.kb);
        for i in 0..n {
            let mut s = x[i];
            for k in i.saturating_sub(kb)..i {
                s -= self.get(i, k) * x[k];
            }
            x[i] = s;
        }
        for i in (0..n).rev() {
            let mut s = x[i];
            for j in i + 1..(i + kb + 1).min(n) {
                s -= self.get(i, j) * x[j];
            }
            x[i] = s / self.get(i, i);
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

struct Layout {
    edges: Vec<f64>,
    /// Leading shells that lie inside the capture radius.
    inside: usize,
    tail: Vec<f64>,
}

impl Layout {
    fn new(geom: &PairGeometry) -> Self {
        let a = geom.capture;
        let outer = a.max(geom.unbinding.unwrap_or(0.0)) + FIELD;
        let mut edges = Vec::new();
        // a fully absorbing interior is empty after every step and needs no shells
        let inside = if geom.probability < 1.0 {
            ((a / CELL_WIDTH).ceil() as usize).clamp(1, MAX_CELLS)
        } else {
            0
        };
        for k in 0..inside {
            edges.push(a * k as f64 / inside as f64);
        }
        let n_out = (((outer - a) / CELL_WIDTH).ceil() as usize).clamp(1, MAX_CELLS);
        let width = (outer - a) / n_out as f64;
        edges.extend((0..=n_out).map(|k| a + width * k as f64));
        let n_tail = (REACH / width).ceil() as usize;
        let tail = (0..=n_tail).map(|k| outer + width * k as f64).collect();
        Layout { edges, inside, tail }
    }

    fn cells(&self) -> usize {
        self.edges.len() - 1
    }
}

/// Reaction volume `Q` of a pair at steady state. `None` if the linear
/// system could not be solved; infinite when every released pair rebinds.
pub fn reaction_volume(geom: &PairGeometry) -> Option<f64> {
    let dim = geom.dim;
    let a = geom.capture;
    let p = geom.probability.clamp(0.0, 1.0);
    if !(a > 0.0) || !(p > 0.0) {
        return Some(0.0);
    }

    let layout = Layout::new(geom);
    let e = &layout.edges;
    let n = layout.cells();
    let aggregate = layout.inside == 0;
    let vol: Vec<f64> = (0..n).map(|i| shell_volume(dim, e[i], e[i + 1])).collect();
    let keep = |i: usize| if i < layout.inside { 1.0 - p } else { 1.0 };
    let capture = |i: usize| if i < layout.inside { p } else { 0.0 };

    let (w_min, w_max) = (0..n)
        .map(|i| e[i + 1] - e[i])
        .fold((f64::INFINITY, 0.0f64), |(lo, hi), w| (lo.min(w), hi.max(w)));
    let kb = (((REACH + 2.0 * w_max) / w_min).ceil() as usize + 1).min(n - 1);

    let mut m = BandMatrix::identity(n, kb);
    let mut rhs = vec![0.0; n];
    let mut capture_weight = vec![0.0; n];
    let mut tau = 0.0;

    for j in 0..n {
        let pts = source_points(dim, e[j], e[j + 1]);
        for i in j.saturating_sub(kb)..(j + kb + 1).min(n) {
            let flow = shell_transfer(dim, &pts, e[i], e[i + 1]) * vol[j];
            if flow == 0.0 {
                continue;
            }
            m.add(i, j, -keep(i) * flow / vol[i]);
            capture_weight[j] += capture(i) * flow;
        }
        if aggregate {
            capture_weight[j] += p * shell_transfer(dim, &pts, 0.0, a) * vol[j];
        }
    }

    // shells beyond the solved range, at the far-field density
    let last = n - 1;
    let r_last = 0.5 * (e[last] + e[n]);
    for t in 0..layout.tail.len() - 1 {
        let (lo, hi) = (layout.tail[t], layout.tail[t + 1]);
        let vt = shell_volume(dim, lo, hi);
        let scale = if dim == 3 { r_last / (0.5 * (lo + hi)) } else { 0.0 };
        let pts = source_points(dim, lo, hi);
        for i in (0..n).rev() {
            if e[i + 1] < lo - REACH {
                break;
            }
            let flow = shell_transfer(dim, &pts, e[i], e[i + 1]) * vt;
            if flow == 0.0 {
                continue;
            }
            rhs[i] += keep(i) * flow * (1.0 - scale) / vol[i];
            if scale > 0.0 && last - i <= kb {
                m.add(i, last, -keep(i) * flow * scale / vol[i]);
            }
            capture_weight[last] += capture(i) * flow * scale;
            tau += capture(i) * flow * (1.0 - scale);
        }
        if aggregate {
            let flow = p * shell_transfer(dim, &pts, 0.0, a) * vt;
            capture_weight[last] += flow * scale;
            tau += flow * (1.0 - scale);
        }
    }

    m.factor()?;

    let Some(b) = geom.unbinding else {
        let mut g = rhs;
        m.solve(&mut g);
        return Some(dot(&capture_weight, &g) + tau);
    };

    // re-injected mass enters as a rank-one term; Sherman-Morrison
    let point: Vec<f64> = (0..n).map(|i| transfer(dim, b, e[i], e[i + 1])).collect();
    let mut beta: f64 = (0..n).map(|i| capture(i) * point[i]).sum();
    if aggregate {
        beta += p * transfer(dim, b, 0.0, a);
    }
    let denom = 1.0 - beta;
    if denom <= 1e-14 {
        return Some(f64::INFINITY);
    }
    let source: Vec<f64> = (0..n).map(|i| keep(i) * point[i] / vol[i]).collect();
    let mut y: Vec<f64> = rhs.iter().zip(&source).map(|(r, u)| r + u * tau / denom).collect();
    m.solve(&mut y);
    let mut z = source;
    m.solve(&mut z);
    let v: Vec<f64> = capture_weight.iter().map(|w| w / denom).collect();
    let vz = 1.0 - dot(&v, &z);
    if vz <= 1e-14 {
        return Some(f64::INFINITY);
    }
    let factor = dot(&v, &y) / vz;
    let g: Vec<f64> = y.iter().zip(&z).map(|(yi, zi)| yi + zi * factor).collect();
    Some((dot(&capture_weight, &g) + tau) / denom)
}

/// Bisection on a monotone function. `increasing` tells the direction.
fn bisect(mut lo: f64, mut hi: f64, target: f64, increasing: bool, f: impl Fn(f64) -> Option<f64>) -> Option<f64> {
    for _ in 0..MAX_BISECTIONS {
        let mid = 0.5 * (lo + hi);
        if hi - lo <= 1e-12 * hi.abs().max(1e-300) {
            break;
        }
        let above = f(mid)? >= target;
        if above == increasing {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    Some(0.5 * (lo + hi))
}

/// Radius of the `dim`-ball with the given volume.
fn ball_radius(dim: usize, volume: f64) -> f64 {
    let unit = ball_volume(dim, 1.0);
    (volume / unit).powf(1.0 / dim as f64)
}

/// Capture radius whose irreversible reaction volume equals `target`.
pub fn capture_radius_for(dim: usize, target: f64, probability: f64) -> Option<f64> {
    if !(target > 0.0) {
        return Some(0.0);
    }
    if !(probability > 0.0) {
        return None;
    }
    let q = |a: f64| reaction_volume(&PairGeometry::irreversible(dim, a, probability));
    let mut hi = ball_radius(dim, target / probability).max(1e-6);
    let mut lo = 0.0;
    let mut doublings = 0;
    while q(hi)? < target {
        lo = hi;
        hi *= 2.0;
        doublings += 1;
        if doublings > MAX_DOUBLINGS {
            return None;
        }
    }
    bisect(lo, hi, target, true, q)
}

/// Per-collision probability that gives reaction volume `target` at a fixed
/// capture radius, or `None` if even certain reaction falls short.
pub fn probability_for(dim: usize, capture: f64, target: f64) -> Option<f64> {
    if !(target > 0.0) {
        return Some(0.0);
    }
    let q = |p: f64| reaction_volume(&PairGeometry::irreversible(dim, capture, p));
    if q(1.0)? < target {
        return None;
    }
    bisect(0.0, 1.0, target, true, q)
}

/// Fraction of reactions of a reversible pair that are rebindings of a
/// just-released pair.
pub fn geminate_probability(dim: usize, capture: f64, probability: f64, unbinding: f64) -> Option<f64> {
    let irreversible = reaction_volume(&PairGeometry::irreversible(dim, capture, probability))?;
    geminate_from(dim, capture, probability, unbinding, irreversible)
}

fn geminate_from(dim: usize, capture: f64, probability: f64, unbinding: f64, irreversible: f64) -> Option<f64> {
    let reversible = reaction_volume(&PairGeometry::reversible(dim, capture, probability, unbinding))?;
    if !reversible.is_finite() {
        return Some(1.0);
    }
    if !(reversible > 0.0) {
        return Some(0.0);
    }
    Some((1.0 - irreversible / reversible).clamp(0.0, 1.0))
}

/// Unbinding radius that gives the requested geminate probability.
/// `None` when the target is outside (0, 1) or above what releasing the pair
/// at zero separation achieves.
pub fn unbinding_radius_for(dim: usize, capture: f64, probability: f64, target: f64) -> Option<f64> {
    if !(target > 0.0 && target < 1.0) {
        return None;
    }
    let irreversible = reaction_volume(&PairGeometry::irreversible(dim, capture, probability))?;
    let pgem = |b: f64| geminate_from(dim, capture, probability, b, irreversible);
    if pgem(0.0)? <= target {
        return None;
    }
    let mut hi = capture.max(1.0);
    let mut lo = 0.0;
    let mut doublings = 0;
    while pgem(hi)? > target {
        lo = hi;
        hi *= 2.0;
        doublings += 1;
        if doublings > MAX_DOUBLINGS {
            return None;
        }
    }
    bisect(lo, hi, target, false, pgem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    #[test]
    fn jump_density_is_normalized() {
        for dim in 1..=3 {
            for r in [0.0, 0.3, 2.0, 10.0] {
                let total = transfer(dim, r, 0.0, r + REACH);
                assert_relative_eq!(total, 1.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn small_capture_radius_reacts_with_every_pair_inside() {
        let a = 0.05;
        let q = reaction_volume(&PairGeometry::irreversible(3, a, 1.0)).unwrap();
        assert_relative_eq!(q, 4.0 / 3.0 * PI * a * a * a, max_relative = 0.02);

        let q_half = reaction_volume(&PairGeometry::irreversible(3, a, 0.5)).unwrap();
        assert_relative_eq!(q_half, 0.5 * q, max_relative = 0.02);
    }

    #[test]
    fn large_capture_radius_approaches_diffusion_limit() {
        let a = 20.0;
        let q = reaction_volume(&PairGeometry::irreversible(3, a, 1.0)).unwrap();
        let smoluchowski = 2.0 * PI * a;
        assert!((q / smoluchowski - 1.0).abs() < 0.1, "Q = {} vs {}", q, smoluchowski);
    }

    #[test]
    fn reaction_volume_grows_with_radius_in_every_dimension() {
        for dim in 1..=3 {
            let mut previous = 0.0;
            for a in [0.1, 0.5, 1.0, 3.0] {
                let q = reaction_volume(&PairGeometry::irreversible(dim, a, 1.0)).unwrap();
                assert!(q > previous, "dim {} a {}: {} <= {}", dim, a, q, previous);
                previous = q;
            }
        }
    }

    #[test]
    fn capture_radius_inverts_reaction_volume() {
        for target in [1e-6, 1e-3, 0.5, 20.0, 500.0] {
            let a = capture_radius_for(3, target, 1.0).unwrap();
            assert!(a > 0.0);
            let q = reaction_volume(&PairGeometry::irreversible(3, a, 1.0)).unwrap();
            assert_relative_eq!(q, target, max_relative = 1e-6);
        }
    }

    #[test]
    fn probability_inverts_at_fixed_radius() {
        let a = 1.0;
        let full = reaction_volume(&PairGeometry::irreversible(2, a, 1.0)).unwrap();
        let p = probability_for(2, a, 0.4 * full).unwrap();
        assert!(p > 0.0 && p < 1.0);
        assert!(probability_for(2, a, 2.0 * full).is_none());
    }

    #[test]
    fn geminate_probability_matches_continuum_for_large_radii() {
        let pgem = geminate_probability(3, 20.0, 1.0, 40.0).unwrap();
        assert!((pgem - 0.5).abs() < 0.08, "pgem = {}", pgem);
    }

    #[test]
    fn unbinding_radius_reproduces_requested_geminate_probability() {
        let a = 1.0;
        let b = unbinding_radius_for(3, a, 1.0, 0.2).unwrap();
        assert!(b > 0.0);
        let pgem = geminate_probability(3, a, 1.0, b).unwrap();
        assert_relative_eq!(pgem, 0.2, epsilon = 1e-4);

        assert!(unbinding_radius_for(3, a, 1.0, 0.0).is_none());
        assert!(unbinding_radius_for(3, a, 1.0, 1.0).is_none());
        // releasing at contact cannot reach a near-certain rebinding for a small radius
        assert!(unbinding_radius_for(3, 0.05, 1.0, 0.99).is_none());
    }
}
