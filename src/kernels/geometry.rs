//! Projection-geometry conversion kernels.
//!
//! Converting an image from one projection to another means computing, for
//! every target pixel, the source pixel that shows the same scene
//! direction. All projections here are radially symmetric around the
//! optical axis except the cylindrical panorama and the equirectangular
//! map, so two paths exist:
//!
//! - both projections radial: the shared quantity is the angle theta from
//!   the optical axis; only the radius changes.
//! - otherwise: the target coordinates are lifted to a 3-D unit direction
//!   and reprojected into the source.
//!
//! Coordinates enter and leave in units of the real focal length. Scene
//! directions a projection cannot represent (e.g. behind the hemisphere of
//! an orthographic fisheye) yield `None`; the kernel writes the
//! out-of-bounds sentinel there.
//!
//! Direction vectors use x right, y down, z along the optical axis.

use crate::lens::LensType;

use super::OUT_OF_BOUNDS;

// Thoby fisheye measurement constants (Nikkor 10.5):
// r = 1.47 * sin(0.713 * theta).
const THOBY_K1: f64 = 1.47;
const THOBY_K2: f64 = 0.713;

/// Run the projection change over an interleaved coordinate buffer.
/// `focal` is the real focal length in normalized units.
pub(crate) fn apply(from: LensType, to: LensType, focal: f64, io: &mut [f32]) {
    for p in io.chunks_exact_mut(2) {
        let x = p[0] as f64 / focal;
        let y = p[1] as f64 / focal;
        match map_point(from, to, x, y) {
            Some((xs, ys)) => {
                p[0] = (xs * focal) as f32;
                p[1] = (ys * focal) as f32;
            }
            None => {
                p[0] = OUT_OF_BOUNDS;
                p[1] = OUT_OF_BOUNDS;
            }
        }
    }
}

/// Radius (in units of the focal length) at which the given projection
/// images a ray `theta` radians off the optical axis; `None` outside the
/// projection's field. Used to derive the real focal length from a known
/// field of view.
pub(crate) fn field_radius(kind: LensType, theta: f64) -> Option<f64> {
    radius_of_theta(kind, theta)
}

/// Map a target-image point to the source-image point showing the same
/// scene direction, for an image converted `from` -> `to`. Coordinates in
/// units of the focal length.
pub(crate) fn map_point(from: LensType, to: LensType, x: f64, y: f64) -> Option<(f64, f64)> {
    if is_radial(from) && is_radial(to) {
        let r = (x * x + y * y).sqrt();
        if r == 0.0 {
            return Some((0.0, 0.0));
        }
        let theta = theta_of_radius(to, r)?;
        let rs = radius_of_theta(from, theta)?;
        let s = rs / r;
        Some((x * s, y * s))
    } else {
        let dir = direction(to, x, y)?;
        project(from, dir)
    }
}

fn is_radial(kind: LensType) -> bool {
    !matches!(kind, LensType::Panoramic | LensType::Equirectangular)
}

/// Radius (in focal units) at which a projection images the angle `theta`
/// from the optical axis. `None` when the angle is outside the projection's
/// field.
fn radius_of_theta(kind: LensType, theta: f64) -> Option<f64> {
    use std::f64::consts::{FRAC_PI_2, PI};
    match kind {
        LensType::Rectilinear | LensType::Unknown => {
            (theta < FRAC_PI_2).then(|| theta.tan())
        }
        LensType::Fisheye => (theta <= PI).then_some(theta),
        LensType::FisheyeOrthographic => (theta <= FRAC_PI_2).then(|| theta.sin()),
        LensType::FisheyeStereographic => (theta < PI).then(|| 2.0 * (theta / 2.0).tan()),
        LensType::FisheyeEquisolid => (theta <= PI).then(|| 2.0 * (theta / 2.0).sin()),
        LensType::FisheyeThoby => {
            // Monotonic only while the inner sine stays below its crest.
            (THOBY_K2 * theta <= FRAC_PI_2).then(|| THOBY_K1 * (THOBY_K2 * theta).sin())
        }
        LensType::Panoramic | LensType::Equirectangular => None,
    }
}

/// Angle from the optical axis imaged at radius `r`, the inverse of
/// [`radius_of_theta`].
fn theta_of_radius(kind: LensType, r: f64) -> Option<f64> {
    use std::f64::consts::PI;
    match kind {
        LensType::Rectilinear | LensType::Unknown => Some(r.atan()),
        LensType::Fisheye => (r <= PI).then_some(r),
        LensType::FisheyeOrthographic => (r <= 1.0).then(|| r.asin()),
        LensType::FisheyeStereographic => Some(2.0 * (r / 2.0).atan()),
        LensType::FisheyeEquisolid => (r <= 2.0).then(|| 2.0 * (r / 2.0).asin()),
        LensType::FisheyeThoby => (r <= THOBY_K1).then(|| (r / THOBY_K1).asin() / THOBY_K2),
        LensType::Panoramic | LensType::Equirectangular => None,
    }
}

/// Unit scene direction seen at image point (x, y).
fn direction(kind: LensType, x: f64, y: f64) -> Option<[f64; 3]> {
    use std::f64::consts::FRAC_PI_2;
    match kind {
        LensType::Panoramic => {
            // x is the longitude, y the tangent of the (downward) latitude.
            let lat = y.atan();
            Some([lat.cos() * x.sin(), lat.sin(), lat.cos() * x.cos()])
        }
        LensType::Equirectangular => {
            // x is the longitude, y the (downward) latitude.
            if y.abs() > FRAC_PI_2 {
                return None;
            }
            Some([y.cos() * x.sin(), y.sin(), y.cos() * x.cos()])
        }
        _ => {
            let r = (x * x + y * y).sqrt();
            let theta = theta_of_radius(kind, r)?;
            if r == 0.0 {
                return Some([0.0, 0.0, 1.0]);
            }
            let sin_t = theta.sin();
            Some([sin_t * x / r, sin_t * y / r, theta.cos()])
        }
    }
}

/// Image point at which a projection shows the unit direction `v`.
fn project(kind: LensType, v: [f64; 3]) -> Option<(f64, f64)> {
    let [vx, vy, vz] = v;
    match kind {
        LensType::Panoramic => {
            let hyp = (vx * vx + vz * vz).sqrt();
            if hyp < 1e-12 {
                return None;
            }
            Some((vx.atan2(vz), vy / hyp))
        }
        LensType::Equirectangular => {
            Some((vx.atan2(vz), vy.clamp(-1.0, 1.0).asin()))
        }
        _ => {
            let theta = vz.clamp(-1.0, 1.0).acos();
            let r = radius_of_theta(kind, theta)?;
            let rho = (vx * vx + vy * vy).sqrt();
            if rho < 1e-12 {
                return Some((0.0, 0.0));
            }
            Some((r * vx / rho, r * vy / rho))
        }
    }
}
