//! Special functions used by the reaction parameter solver.

use std::f64::consts::PI;

/// 1/sqrt(2π)
const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;

/// Standard normal density.
pub fn normal_pdf(x: f64) -> f64 {
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Exponentially scaled modified Bessel function, `exp(-x) * I0(x)` for x >= 0.
pub fn bessel_i0e(x: f64) -> f64 {
    let ax = x.abs();
    if ax < 3.75 {
        let y = (x / 3.75) * (x / 3.75);
        let i0 = 1.0
            + y * (3.515_622_9
                + y * (3.089_942_4
                    + y * (1.206_749_2 + y * (0.265_973_2 + y * (0.036_076_8 + y * 0.004_581_3)))));
        i0 * (-ax).exp()
    } else {
        let y = 3.75 / ax;
        (1.0 / ax.sqrt())
            * (0.398_942_28
                + y * (0.013_285_92
                    + y * (0.002_253_19
                        + y * (-0.001_575_65
                            + y * (0.009_162_81
                                + y * (-0.020_577_06
                                    + y * (0.026_355_37 + y * (-0.016_476_33 + y * 0.003_923_77))))))))
    }
}

/// Four-point Gauss-Legendre nodes and weights on [-1, 1].
pub const GAUSS_LEGENDRE_4: [(f64, f64); 4] = [
    (-0.861_136_311_594_052_6, 0.347_854_845_137_453_9),
    (-0.339_981_043_584_856_3, 0.652_145_154_862_546_1),
    (0.339_981_043_584_856_3, 0.652_145_154_862_546_1),
    (0.861_136_311_594_052_6, 0.347_854_845_137_453_9),
];

/// Volume of a `dim`-ball of the given radius (2r in 1D, πr² in 2D).
pub fn ball_volume(dim: usize, radius: f64) -> f64 {
    match dim {
        1 => 2.0 * radius,
        2 => PI * radius * radius,
        _ => 4.0 / 3.0 * PI * radius * radius * radius,
    }
}

/// Volume of the radial shell `[r1, r2]` in `dim` dimensions.
pub fn shell_volume(dim: usize, r1: f64, r2: f64) -> f64 {
    ball_volume(dim, r2) - ball_volume(dim, r1)
}

/// Clamps a computed probability into [0, 1]; NaN becomes 0.
pub fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn bessel_i0e_reference_values() {
        // I0(1) = 1.2660658777520082, I0(5) = 27.239871823604442
        assert_relative_eq!(bessel_i0e(1.0), 1.266_065_877_752_008_2 * (-1.0f64).exp(), max_relative = 1e-6);
        assert_relative_eq!(bessel_i0e(5.0), 27.239_871_823_604_442 * (-5.0f64).exp(), max_relative = 1e-6);
    }

    #[test]
    fn gauss_legendre_integrates_cubics_exactly() {
        let integral: f64 = GAUSS_LEGENDRE_4.iter().map(|(x, w)| w * (x * x * x + x * x)).sum();
        assert_relative_eq!(integral, 2.0 / 3.0, epsilon = 1e-14);
    }

    #[test]
    fn shell_volumes() {
        assert_relative_eq!(shell_volume(3, 0.0, 1.0), 4.0 / 3.0 * PI);
        assert_relative_eq!(shell_volume(2, 1.0, 2.0), 3.0 * PI);
        assert_relative_eq!(shell_volume(1, 0.5, 1.0), 1.0);
    }
}
