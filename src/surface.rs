//! Interface to the surface geometry layer.
//!
//! Panel shapes, ray/panel intersection and surface actions live outside the
//! kernel. The kernel only needs to know which panels touch a box, how to keep
//! a bound molecule on its panel, and how large a panel is.

use rand::{Rng, RngCore};
use rdsim_common::Vec3;

pub type PanelId = u32;

pub trait SurfaceGeometry: Send + Sync {
    fn panel_count(&self) -> usize;

    /// Panels intersecting the axis-aligned box `[low, high]`.
    fn panels_in_box(&self, low: Vec3, high: Vec3) -> Vec<PanelId>;

    /// Closest point on `panel` to `pos`.
    fn project(&self, panel: PanelId, pos: Vec3) -> Vec3;

    /// Area of `panel` (length in 2D systems).
    fn area(&self, panel: PanelId) -> f64;

    /// Uniformly distributed point on `panel`.
    fn random_point(&self, panel: PanelId, rng: &mut dyn RngCore) -> Vec3;

    fn total_area(&self) -> f64 {
        (0..self.panel_count() as PanelId).map(|p| self.area(p)).sum()
    }
}

/// Geometry with no surfaces at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSurfaces;

impl SurfaceGeometry for NoSurfaces {
    fn panel_count(&self) -> usize {
        0
    }

    fn panels_in_box(&self, _low: Vec3, _high: Vec3) -> Vec<PanelId> {
        Vec::new()
    }

    fn project(&self, _panel: PanelId, pos: Vec3) -> Vec3 {
        pos
    }

    fn area(&self, _panel: PanelId) -> f64 {
        0.0
    }

    fn random_point(&self, _panel: PanelId, _rng: &mut dyn RngCore) -> Vec3 {
        Vec3::zero()
    }
}

/// A flat rectangle perpendicular to one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisPanel {
    pub normal_axis: usize,
    /// Corner with the smallest coordinates; `low[normal_axis]` is the plane position.
    pub low: Vec3,
    /// Opposite corner; `high[normal_axis]` equals `low[normal_axis]`.
    pub high: Vec3,
}

/// Simple geometry made of axis-aligned rectangles (segments in 2D, points in 1D).
#[derive(Debug, Clone, Default)]
pub struct AxisAlignedPanels {
    dim: usize,
    panels: Vec<AxisPanel>,
}

impl AxisAlignedPanels {
    pub fn new(dim: usize) -> Self {
        AxisAlignedPanels { dim, panels: Vec::new() }
    }

    /// Adds a panel in the plane `x[normal_axis] = offset` spanning `[low, high]`
    /// on the remaining axes.
    pub fn add_panel(&mut self, normal_axis: usize, offset: f64, mut low: Vec3, mut high: Vec3) -> PanelId {
        low[normal_axis] = offset;
        high[normal_axis] = offset;
        self.panels.push(AxisPanel { normal_axis, low, high });
        (self.panels.len() - 1) as PanelId
    }

    pub fn panel(&self, panel: PanelId) -> Option<&AxisPanel> {
        self.panels.get(panel as usize)
    }
}

impl SurfaceGeometry for AxisAlignedPanels {
    fn panel_count(&self) -> usize {
        self.panels.len()
    }

    fn panels_in_box(&self, low: Vec3, high: Vec3) -> Vec<PanelId> {
        self.panels
            .iter()
            .enumerate()
            .filter(|(_, p)| (0..self.dim).all(|a| p.low[a] <= high[a] && p.high[a] >= low[a]))
            .map(|(i, _)| i as PanelId)
            .collect()
    }

    fn project(&self, panel: PanelId, pos: Vec3) -> Vec3 {
        let Some(p) = self.panel(panel) else {
            return pos;
        };
        let mut out = pos;
        for axis in 0..self.dim {
            out[axis] = pos[axis].clamp(p.low[axis], p.high[axis]);
        }
        out
    }

    fn area(&self, panel: PanelId) -> f64 {
        let Some(p) = self.panel(panel) else {
            return 0.0;
        };
        (0..self.dim)
            .filter(|a| *a != p.normal_axis)
            .map(|a| p.high[a] - p.low[a])
            .product()
    }

    fn random_point(&self, panel: PanelId, rng: &mut dyn RngCore) -> Vec3 {
        let Some(p) = self.panel(panel) else {
            return Vec3::zero();
        };
        let mut out = p.low;
        for axis in 0..self.dim {
            if axis != p.normal_axis {
                let u: f64 = rng.random();
                out[axis] = p.low[axis] + u * (p.high[axis] - p.low[axis]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn axis_panel_projection_and_area() {
        let mut geo = AxisAlignedPanels::new(3);
        let p = geo.add_panel(2, 0.5, Vec3::new(0.0, 0.0, 0.0), Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(geo.area(p), 2.0);
        assert_eq!(geo.project(p, Vec3::new(0.3, 3.0, 0.9)), Vec3::new(0.3, 2.0, 0.5));

        assert_eq!(geo.panels_in_box(Vec3::new(0.0, 0.0, 0.4), Vec3::new(0.5, 0.5, 0.6)), vec![p]);
        assert!(geo.panels_in_box(Vec3::new(0.0, 0.0, 0.6), Vec3::new(0.5, 0.5, 0.9)).is_empty());

        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let q = geo.random_point(p, &mut rng);
            assert_eq!(q.z, 0.5);
            assert!((0.0..=1.0).contains(&q.x) && (0.0..=2.0).contains(&q.y));
        }
    }
}
