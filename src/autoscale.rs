//! Automatic scale search.
//!
//! After correction, parts of the output image may sample outside the
//! source rectangle (barrel correction pushes the corners out, projection
//! changes bend the edges). The autoscale search finds a magnification
//! that keeps every output pixel inside the source.
//!
//! The search casts rays from the optical centre in sixteen directions.
//! Along each ray it binary-searches for the radius whose image under the
//! coordinate chain lands exactly on the source edge, then compares that
//! radius with the distance to the output edge in the same direction. The
//! scan is coarse on purpose: it costs a constant number of chain
//! evaluations, at the price of underestimating the optimal scale by a
//! few percent in pathological high-distortion cases.

use tracing::debug;

use crate::modifier::Modifier;

const RAY_COUNT: usize = 16;
const BISECTIONS: usize = 50;

impl Modifier<'_> {
    /// Compute the automatic scale factor.
    ///
    /// Expects every other coordinate kernel to be installed already; the
    /// scale kernel itself must not be in the chain yet. With `reverse`
    /// the reciprocal factor is returned, ready to feed the reverse scale
    /// kernel.
    pub fn get_auto_scale(&self, reverse: bool) -> f32 {
        if self.coord_chain_empty() {
            return 1.0;
        }

        let mut scale: f64 = 1.0;
        for angle in self.ray_angles() {
            let edge = self.edge_distance(angle);
            let corrected = self.transformed_edge_distance(angle);
            if corrected.is_finite() && corrected > 0.0 {
                scale = scale.max(edge / corrected);
            }
        }

        if !scale.is_finite() || scale <= 0.0 {
            scale = 1.0;
        }
        debug!(scale, reverse, "autoscale search finished");
        if reverse {
            (1.0 / scale) as f32
        } else {
            scale as f32
        }
    }

    /// The sixteen ray directions: the four corners, the four edge
    /// midpoints, and the bisectors between them. Corners are where
    /// barrel correction bites hardest, so they must be sampled exactly.
    fn ray_angles(&self) -> [f64; RAY_COUNT] {
        use std::f64::consts::{FRAC_PI_2, PI, TAU};
        let (max_x, max_y) = self.clip_bounds();
        let c = max_y.atan2(max_x);

        let principal = [
            0.0,
            c,
            FRAC_PI_2,
            PI - c,
            PI,
            PI + c,
            3.0 * FRAC_PI_2,
            TAU - c,
        ];
        let mut angles = [0.0f64; RAY_COUNT];
        for i in 0..8 {
            let next = if i == 7 { TAU } else { principal[i + 1] };
            angles[2 * i] = principal[i];
            angles[2 * i + 1] = (principal[i] + next) / 2.0;
        }
        angles
    }

    /// Distance from the centre to the image edge along `angle`, in
    /// normalized coordinates.
    fn edge_distance(&self, angle: f64) -> f64 {
        let (max_x, max_y) = self.clip_bounds();
        let (sin_a, cos_a) = angle.sin_cos();
        let dx = if cos_a.abs() > 1e-12 {
            max_x / cos_a.abs()
        } else {
            f64::INFINITY
        };
        let dy = if sin_a.abs() > 1e-12 {
            max_y / sin_a.abs()
        } else {
            f64::INFINITY
        };
        dx.min(dy)
    }

    /// Signed distance of a corrected point from the source rectangle:
    /// negative inside, zero on the edge, positive outside.
    fn residual_distance(&self, x: f64, y: f64) -> f64 {
        let (max_x, max_y) = self.clip_bounds();
        (x.abs() - max_x).max(y.abs() - max_y)
    }

    /// Radius along `angle` whose image under the coordinate chain lies on
    /// the source edge. Infinite when the whole ray stays inside (the
    /// direction does not constrain the scale).
    fn transformed_edge_distance(&self, angle: f64) -> f64 {
        let (sin_a, cos_a) = angle.sin_cos();
        let residual_at = |r: f64| {
            let (x, y) = self.transform_point(r * cos_a, r * sin_a);
            if x.is_finite() && y.is_finite() {
                self.residual_distance(x, y)
            } else {
                f64::MAX
            }
        };

        let (max_x, max_y) = self.clip_bounds();
        let mut lo = 0.0;
        let mut hi = max_x.hypot(max_y);
        let mut expansions = 0;
        while residual_at(hi) < 0.0 {
            lo = hi;
            hi *= 2.0;
            expansions += 1;
            if expansions > 16 {
                return f64::INFINITY;
            }
        }
        for _ in 0..BISECTIONS {
            let mid = 0.5 * (lo + hi);
            if residual_at(mid) > 0.0 {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        0.5 * (lo + hi)
    }
}

#[cfg(test)]
mod tests {
    use crate::lens::{DistortionCalib, DistortionModel, Lens, LensType};
    use crate::modifier::{Modifier, ModifyFlags};
    use crate::pixels::PixelFormat;

    fn barrel_lens(k1: f32) -> Lens {
        let mut lens = Lens::new();
        lens.set_model("Test 20mm f/2.8", None);
        lens.add_mount("M42");
        lens.crop_factor = 1.0;
        lens.aspect_ratio = 1.0;
        lens.kind = LensType::Rectilinear;
        lens.add_calib_distortion(&DistortionCalib {
            model: DistortionModel::Poly3,
            focal: 20.0,
            real_focal: 20.0,
            real_focal_measured: false,
            terms: [k1, 0.0, 0.0, 0.0, 0.0],
        });
        lens
    }

    fn distortion_modifier(lens: &Lens, reverse: bool) -> Modifier<'_> {
        let mut modifier = Modifier::new(lens, 1.0, 1001, 1001);
        let applied = modifier.initialize(
            PixelFormat::F32,
            20.0,
            2.8,
            1.0,
            1.0,
            LensType::Rectilinear,
            ModifyFlags::DISTORTION,
            reverse,
        );
        assert!(applied.contains(ModifyFlags::DISTORTION));
        modifier
    }

    #[test]
    fn test_no_chain_gives_unit_scale() {
        let lens = barrel_lens(0.05);
        let modifier = Modifier::new(&lens, 1.0, 1001, 1001);
        assert_eq!(modifier.get_auto_scale(false), 1.0);
    }

    #[test]
    fn test_barrel_correction_needs_upscale() {
        let lens = barrel_lens(0.05);
        let modifier = distortion_modifier(&lens, false);
        let scale = modifier.get_auto_scale(false);
        assert!(
            (1.02..=1.08).contains(&scale),
            "autoscale for k1 = 0.05 barrel out of range: {scale}"
        );
    }

    #[test]
    fn test_autoscale_at_least_one() {
        // Pincushion correction pulls the edges inward; the scale must
        // still not drop below 1.
        let lens = barrel_lens(-0.05);
        let modifier = distortion_modifier(&lens, false);
        assert!(modifier.get_auto_scale(false) >= 1.0);
    }

    #[test]
    fn test_reverse_scale_is_reciprocal() {
        let lens = barrel_lens(0.05);
        let modifier = distortion_modifier(&lens, false);
        let forward = modifier.get_auto_scale(false);
        let reverse = modifier.get_auto_scale(true);
        assert!((forward * reverse - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_scaled_grid_stays_inside_source() {
        // Install distortion plus the automatic scale, then check that a
        // full output grid never samples outside the source rectangle.
        let lens = barrel_lens(0.05);
        let mut modifier = Modifier::new(&lens, 1.0, 1001, 1001);
        let applied = modifier.initialize(
            PixelFormat::F32,
            20.0,
            2.8,
            1.0,
            0.0, // autoscale
            LensType::Rectilinear,
            ModifyFlags::DISTORTION | ModifyFlags::SCALE,
            false,
        );
        assert!(applied.contains(ModifyFlags::SCALE));

        let mut buf = [0.0f32; 2];
        for gy in 0..33 {
            for gx in 0..33 {
                let px = gx as f32 * 1000.0 / 32.0;
                let py = gy as f32 * 1000.0 / 32.0;
                assert!(modifier.apply_geometry_distortion(px, py, 1, 1, &mut buf));
                assert!(
                    (-0.51f32..=1000.51).contains(&buf[0])
                        && (-0.51f32..=1000.51).contains(&buf[1]),
                    "({px}, {py}) sampled outside: ({}, {})",
                    buf[0],
                    buf[1],
                );
            }
        }
    }
}
