//! Stock correction kernels and the callback chains they live in.
//!
//! A modifier owns three chains of kernels: color (stage 1, pixel values in
//! place), coordinate (stage 2, one (x, y) pair per output pixel) and
//! subpixel coordinate (stage 3, one (x, y) pair per channel per pixel).
//! Each chain entry is a closed sum over the stock kernels plus a `User`
//! case holding a caller-supplied closure, so chains are plain values that
//! can be shared across threads.
//!
//! All coordinate kernels operate in normalized units (optical centre at
//! the origin, 1.0 at half the longer side of the calibration sensor) and
//! overwrite their buffer in place. Kernels that hit unreachable points
//! (e.g. directions behind the projection sphere) write the
//! [`OUT_OF_BOUNDS`] sentinel, which exceeds any legal image coordinate so
//! the caller's resampler can paint background.

pub mod distortion;
pub mod geometry;
pub mod perspective;
pub mod tca;
pub mod vignetting;

use std::sync::Arc;

use nalgebra::Matrix3;

use crate::lens::{DistortionModel, LensType, TcaModel};
use crate::pixels::{PixelData, RoleWord};

/// Sentinel written to both coordinates of unreachable pixels. Larger than
/// any legal image bound.
pub const OUT_OF_BOUNDS: f32 = 1.6e16;

/// User-supplied coordinate callback: receives the interleaved
/// `[x0, y0, x1, y1, ...]` buffer in normalized units and rewrites it in
/// place.
pub type CoordCallbackFn = Arc<dyn Fn(&mut [f32]) + Send + Sync>;

/// User-supplied subpixel callback: like [`CoordCallbackFn`] but over
/// `[xR, yR, xG, yG, xB, yB, ...]` triples.
pub type SubpixelCallbackFn = Arc<dyn Fn(&mut [f32]) + Send + Sync>;

/// User-supplied color callback: receives the normalized coordinates of the
/// first pixel of the row, the per-pixel coordinate step, the pixel row and
/// its component-role word.
pub type ColorCallbackFn = Arc<dyn Fn(f32, f32, f32, PixelData<'_>, RoleWord) + Send + Sync>;

/// A kernel on the coordinate chain.
#[derive(Clone)]
pub enum CoordKernel {
    /// Rescaling. `factor` is the value the coordinates are multiplied by,
    /// i.e. the reciprocal of the magnification in the forward direction.
    Scale {
        /// Multiplier applied to both coordinates.
        factor: f64,
    },
    /// Lens distortion, forward (correcting) or inverse (simulating).
    Distortion {
        /// Model the terms belong to.
        model: DistortionModel,
        /// Model coefficients.
        terms: [f64; 5],
        /// `true` to apply the inverse model.
        inverse: bool,
        /// Real focal length in normalized units; the ACM model measures
        /// its coordinates in these.
        focal: f64,
    },
    /// Projection change between two lens types.
    Geometry {
        /// Projection of the source image.
        from: LensType,
        /// Projection of the target image.
        to: LensType,
        /// Real focal length in normalized units.
        focal: f64,
    },
    /// Perspective correction from control points.
    Perspective {
        /// Projective map from target to source homogeneous coordinates.
        matrix: Matrix3<f64>,
        /// Focal length (normalized) the matrix was built with.
        focal: f64,
    },
    /// Caller-registered callback.
    User {
        /// The callback.
        callback: CoordCallbackFn,
    },
}

impl CoordKernel {
    /// Run the kernel over an interleaved coordinate buffer.
    pub fn apply(&self, io: &mut [f32]) {
        debug_assert!(io.len() % 2 == 0);
        match self {
            CoordKernel::Scale { factor } => {
                for c in io.iter_mut() {
                    *c = (*c as f64 * factor) as f32;
                }
            }
            CoordKernel::Distortion {
                model,
                terms,
                inverse,
                focal,
            } => distortion::apply(*model, terms, *inverse, *focal, io),
            CoordKernel::Geometry { from, to, focal } => geometry::apply(*from, *to, *focal, io),
            CoordKernel::Perspective { matrix, focal } => {
                perspective::apply(matrix, *focal, io)
            }
            CoordKernel::User { callback } => callback(io),
        }
    }
}

/// A kernel on the subpixel-coordinate chain.
#[derive(Clone)]
pub enum SubpixelKernel {
    /// Transversal chromatic aberration, forward or inverse.
    Tca {
        /// Model the terms belong to.
        model: TcaModel,
        /// Model coefficients, red and blue interleaved.
        terms: [f64; 12],
        /// `true` to apply the inverse model.
        inverse: bool,
        /// Nominal focal length in normalized units (ACM coordinates).
        focal: f64,
    },
    /// Caller-registered callback.
    User {
        /// The callback.
        callback: SubpixelCallbackFn,
    },
}

impl SubpixelKernel {
    /// Run the kernel over an interleaved R/G/B coordinate buffer.
    pub fn apply(&self, io: &mut [f32]) {
        debug_assert!(io.len() % 6 == 0);
        match self {
            SubpixelKernel::Tca {
                model,
                terms,
                inverse,
                focal,
            } => tca::apply(*model, terms, *inverse, *focal, io),
            SubpixelKernel::User { callback } => callback(io),
        }
    }
}

/// A kernel on the color chain.
#[derive(Clone)]
pub enum ColorKernel {
    /// Vignetting correction or application.
    Vignetting {
        /// Polynomial coefficients `[k1, k2, k3]`.
        terms: [f64; 3],
        /// Factor converting normalized radii into the model's coordinate
        /// system (aspect correction for PA, focal units for ACM).
        coord_scale: f64,
        /// `true` multiplies by the polynomial (applies vignetting),
        /// `false` divides (corrects it).
        multiply: bool,
    },
    /// Caller-registered callback.
    User {
        /// The callback.
        callback: ColorCallbackFn,
    },
}

impl ColorKernel {
    /// Run the kernel over one pixel row. `x0`/`y` are the normalized
    /// coordinates of the row's first pixel, `step` the per-pixel
    /// coordinate increment.
    pub fn apply(&self, x0: f32, y: f32, step: f32, row: PixelData<'_>, roles: RoleWord) {
        match self {
            ColorKernel::Vignetting {
                terms,
                coord_scale,
                multiply,
            } => vignetting::apply(terms, *coord_scale, *multiply, x0, y, step, row, roles),
            ColorKernel::User { callback } => callback(x0, y, step, row, roles),
        }
    }
}
