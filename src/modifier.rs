//! The image modifier: three priority-ordered kernel chains applied
//! block-wise to an image.
//!
//! # Coordinate conventions
//!
//! - **Pixel coordinates**: origin at the top-left pixel centre, +X right,
//!   +Y down. Grid extents are the image dimensions minus one (a
//!   four-pixel-wide image spans x = 0..3).
//! - **Normalized coordinates**: origin at the optical centre, 1.0 at half
//!   the longer side of the *calibration* sensor. `norm_scale` converts
//!   pixel into normalized coordinates and folds in the crop-factor and
//!   aspect-ratio difference between the camera the shot was taken with
//!   and the camera the lens was calibrated on.
//!
//! # Stages
//!
//! Corrections conceptually run vignetting -> TCA -> distortion ->
//! geometry -> perspective -> scale, but the library works backwards from
//! output pixels, so the chains execute:
//!
//! 1. color chain (vignetting), pixel values in place;
//! 2. coordinate chain (scale, perspective, geometry, distortion), one
//!    (x, y) pair per output pixel;
//! 3. subpixel chain (TCA), one (x, y) pair per channel.
//!
//! Stages 2 and 3 can be fused with
//! [`Modifier::apply_subpixel_geometry_distortion`], which feeds the stage
//! 2 result directly into stage 3 and avoids a second resampling pass.
//!
//! After [`Modifier::initialize`] returns, no method mutates shared state:
//! all apply methods take `&self` and write only to caller-owned buffers,
//! so disjoint tiles can be processed from multiple threads on one
//! modifier.

use std::ops::{BitAnd, BitOr, BitOrAssign};

use tracing::debug;

use crate::kernels::{
    geometry, perspective, ColorKernel, CoordKernel, SubpixelKernel,
};
use crate::lens::{
    DistortionCalib, DistortionModel, Lens, LensType, TcaCalib, TcaModel, VignettingCalib,
    VignettingModel,
};
use crate::pixels::{PixelData, PixelFormat, RoleWord};

/// Bitmask of corrections a modifier should perform.
///
/// Bit 4 is historic and ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifyFlags(u32);

impl ModifyFlags {
    /// Correct (or apply) transversal chromatic aberrations.
    pub const TCA: ModifyFlags = ModifyFlags(1);
    /// Correct (or apply) vignetting.
    pub const VIGNETTING: ModifyFlags = ModifyFlags(2);
    /// Correct (or apply) lens distortion.
    pub const DISTORTION: ModifyFlags = ModifyFlags(8);
    /// Convert the projection geometry.
    pub const GEOMETRY: ModifyFlags = ModifyFlags(16);
    /// Additional image rescaling.
    pub const SCALE: ModifyFlags = ModifyFlags(32);
    /// Everything possible.
    pub const ALL: ModifyFlags = ModifyFlags(u32::MAX);

    /// No corrections.
    pub const fn empty() -> ModifyFlags {
        ModifyFlags(0)
    }

    /// `true` when every bit of `other` is set in `self`.
    pub const fn contains(self, other: ModifyFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit value.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ModifyFlags {
    type Output = ModifyFlags;
    fn bitor(self, rhs: ModifyFlags) -> ModifyFlags {
        ModifyFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ModifyFlags {
    fn bitor_assign(&mut self, rhs: ModifyFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ModifyFlags {
    type Output = ModifyFlags;
    fn bitand(self, rhs: ModifyFlags) -> ModifyFlags {
        ModifyFlags(self.0 & rhs.0)
    }
}

// Fixed chain priorities of the stock kernels. Chains run in ascending
// order; user callbacks may use 0..=999.
const PRIORITY_SCALE: i32 = 100;
const PRIORITY_PERSPECTIVE: i32 = 300;
const PRIORITY_GEOMETRY: i32 = 500;
const PRIORITY_TCA: i32 = 500;
const PRIORITY_CORRECT: i32 = 250;
const PRIORITY_UNCORRECT: i32 = 750;

/// A kernel chain kept sorted by ascending priority; equal priorities
/// preserve insertion order.
struct Chain<K> {
    entries: Vec<(i32, K)>,
}

impl<K> Chain<K> {
    fn new() -> Self {
        Chain {
            entries: Vec::new(),
        }
    }

    fn add(&mut self, priority: i32, kernel: K) {
        let pos = self.entries.partition_point(|(p, _)| *p <= priority);
        self.entries.insert(pos, (priority, kernel));
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Optimized per-image state for rectifying (or simulating) lens defects.
///
/// Create one per output geometry with [`Modifier::new`], configure it with
/// [`Modifier::initialize`] (and optionally
/// [`Modifier::enable_perspective_correction`] or the `add_*` helpers), then
/// apply it block-wise. The modifier borrows the lens and its calibration
/// data for its whole lifetime.
pub struct Modifier<'a> {
    lens: &'a Lens,

    /// Conversion from pixel to normalized coordinates (and back).
    norm_scale: f64,
    norm_unscale: f64,
    /// Optical centre in normalized units (subtracted after scaling).
    center_x: f64,
    center_y: f64,
    /// Half-extents of the image in normalized coordinates.
    max_x: f64,
    max_y: f64,
    /// Millimetres on the calibration sensor per normalized unit.
    normalized_in_mm: f64,
    /// Converts long-side-normalized radii into the vignetting models'
    /// coordinate system of the calibration sensor.
    aspect_ratio_correction: f64,
    /// Nominal focal length in normalized units.
    focal_length_normalized: f64,
    /// Real (paraxial) focal length in normalized units.
    real_focal_normalized: f64,

    reverse: bool,
    format: PixelFormat,

    color_chain: Chain<ColorKernel>,
    coord_chain: Chain<CoordKernel>,
    subpixel_chain: Chain<SubpixelKernel>,
}

impl<'a> Modifier<'a> {
    /// Create a modifier for an image of `width` x `height` pixels taken
    /// with the given lens on a camera with crop factor `camera_crop`.
    ///
    /// Pass the full image dimensions even when only a part will be
    /// corrected. The lens must carry a valid (positive) crop factor.
    pub fn new(lens: &'a Lens, camera_crop: f32, width: usize, height: usize) -> Modifier<'a> {
        assert!(camera_crop > 0.0, "camera crop factor must be positive");
        assert!(
            lens.crop_factor > 0.0,
            "lens calibration crop factor must be positive"
        );

        let w = if width >= 2 { (width - 1) as f64 } else { 1.0 };
        let h = if height >= 2 { (height - 1) as f64 } else { 1.0 };
        let size = w.max(h);

        // Fraction of the sensor diagonal taken by the long half-side.
        let long_frac = |aspect: f64| aspect / (1.0 + aspect * aspect).sqrt();
        let img_aspect = w.max(h) / w.min(h);
        let lens_aspect = if lens.aspect_ratio >= 1.0 {
            lens.aspect_ratio as f64
        } else {
            1.5
        };
        let calib_crop = lens.crop_factor as f64;

        // Scale into the calibration sensor's normalized system: unit is
        // half the longer image side, adjusted for the crop-factor and
        // aspect-ratio difference between camera and calibration sensors.
        let norm_scale = 2.0 / size * (calib_crop / camera_crop as f64) * long_frac(img_aspect)
            / long_frac(lens_aspect);
        let norm_unscale = 1.0 / norm_scale;

        let center_x = (w / 2.0 + lens.center_x as f64 * size) * norm_scale;
        let center_y = (h / 2.0 + lens.center_y as f64 * size) * norm_scale;

        // Half the calibration sensor's long side, in millimetres: a full
        // 35 mm frame has a 43.27 mm diagonal.
        let normalized_in_mm =
            (36.0f64.hypot(24.0) / 2.0) / calib_crop * long_frac(lens_aspect);

        Modifier {
            lens,
            norm_scale,
            norm_unscale,
            center_x,
            center_y,
            max_x: w / 2.0 * norm_scale,
            max_y: h / 2.0 * norm_scale,
            normalized_in_mm,
            aspect_ratio_correction: lens_aspect,
            focal_length_normalized: 1.0,
            real_focal_normalized: 1.0,
            reverse: false,
            format: PixelFormat::F32,
            color_chain: Chain::new(),
            coord_chain: Chain::new(),
            subpixel_chain: Chain::new(),
        }
    }

    /// Grid extents in normalized coordinates (exposed for the autoscale
    /// search).
    pub(crate) fn clip_bounds(&self) -> (f64, f64) {
        (self.max_x, self.max_y)
    }

    pub(crate) fn coord_chain_empty(&self) -> bool {
        self.coord_chain.is_empty()
    }

    /// Run the coordinate chain over a single normalized point.
    pub(crate) fn transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        let mut io = [x as f32, y as f32];
        for (_, kernel) in &self.coord_chain.entries {
            kernel.apply(&mut io);
        }
        (io[0] as f64, io[1] as f64)
    }

    /// Set up the chains to rectify (or, with `reverse`, to simulate) the
    /// aberrations selected by `flags`.
    ///
    /// Aperture and focus distance only matter for vignetting; the
    /// dependence on distance is weak, so an estimate (1000 for "unknown")
    /// is fine. `scale` of 1.0 disables rescaling, 0.0 requests automatic
    /// scaling. A `target` projection different from the lens type enables
    /// the geometry conversion.
    ///
    /// Returns the subset of `flags` that actually installed a kernel;
    /// corrections without calibration data (and no-op requests) drop out.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize(
        &mut self,
        format: PixelFormat,
        focal: f32,
        aperture: f32,
        distance: f32,
        scale: f32,
        target: LensType,
        flags: ModifyFlags,
        reverse: bool,
    ) -> ModifyFlags {
        assert!(focal > 0.0, "focal length must be positive");

        self.color_chain.clear();
        self.coord_chain.clear();
        self.subpixel_chain.clear();
        self.reverse = reverse;
        self.format = format;
        self.focal_length_normalized = focal as f64 / self.normalized_in_mm;
        self.real_focal_normalized = self.real_focal_length(focal) / self.normalized_in_mm;

        let mut applied = ModifyFlags::empty();

        if flags.contains(ModifyFlags::TCA) {
            if let Some(calib) = self.lens.interpolate_tca(focal) {
                if self.add_subpixel_callback_tca(&calib, reverse) {
                    applied |= ModifyFlags::TCA;
                }
            }
        }
        if flags.contains(ModifyFlags::VIGNETTING) {
            if let Some(calib) = self.lens.interpolate_vignetting(focal, aperture, distance) {
                if self.add_color_callback_vignetting(&calib, reverse) {
                    applied |= ModifyFlags::VIGNETTING;
                }
            }
        }
        if flags.contains(ModifyFlags::DISTORTION) {
            if let Some(calib) = self.lens.interpolate_distortion(focal) {
                if self.add_coord_callback_distortion(&calib, reverse) {
                    applied |= ModifyFlags::DISTORTION;
                }
            }
        }
        if flags.contains(ModifyFlags::GEOMETRY) && target != self.lens.kind {
            let (from, to) = if reverse {
                (target, self.lens.kind)
            } else {
                (self.lens.kind, target)
            };
            if self.add_coord_callback_geometry(from, to) {
                applied |= ModifyFlags::GEOMETRY;
            }
        }
        // Scaling always sits first in the chain, no matter the direction.
        if flags.contains(ModifyFlags::SCALE) && scale != 1.0 {
            if self.add_coord_callback_scale(scale, reverse) {
                applied |= ModifyFlags::SCALE;
            }
        }

        debug!(
            flags = applied.bits(),
            focal,
            real_focal_normalized = self.real_focal_normalized,
            reverse,
            "modifier initialized"
        );
        applied
    }

    /// The real (paraxial) focal length in mm for a nominal focal length:
    /// a measured calibration value if present, else derived from the
    /// field of view, else the nominal value itself.
    fn real_focal_length(&self, focal: f32) -> f64 {
        if let Some(calib) = self.lens.interpolate_distortion(focal) {
            if calib.real_focal_measured && calib.real_focal > 0.0 {
                return calib.real_focal as f64;
            }
        }
        if let Some(fov) = self.lens.interpolate_fov(focal) {
            if fov.field_of_view > 0.0 {
                let half = (fov.field_of_view as f64).to_radians() / 2.0;
                if let Some(radius) = geometry::field_radius(self.lens.kind, half) {
                    if radius > 0.0 {
                        return self.normalized_in_mm / radius;
                    }
                }
            }
        }
        focal as f64
    }

    /// Register a user coordinate callback at the given priority (0..=999).
    pub fn add_coord_callback<F>(&mut self, priority: i32, callback: F)
    where
        F: Fn(&mut [f32]) + Send + Sync + 'static,
    {
        self.coord_chain.add(
            priority,
            CoordKernel::User {
                callback: std::sync::Arc::new(callback),
            },
        );
    }

    /// Register a user subpixel callback at the given priority (0..=999).
    pub fn add_subpixel_callback<F>(&mut self, priority: i32, callback: F)
    where
        F: Fn(&mut [f32]) + Send + Sync + 'static,
    {
        self.subpixel_chain.add(
            priority,
            SubpixelKernel::User {
                callback: std::sync::Arc::new(callback),
            },
        );
    }

    /// Register a user color callback at the given priority (0..=999).
    pub fn add_color_callback<F>(&mut self, priority: i32, callback: F)
    where
        F: Fn(f32, f32, f32, PixelData<'_>, RoleWord) + Send + Sync + 'static,
    {
        self.color_chain.add(
            priority,
            ColorKernel::User {
                callback: std::sync::Arc::new(callback),
            },
        );
    }

    /// Install the stock TCA kernel. `reverse` simulates the aberration
    /// instead of correcting it; the Adobe model has no inverse and
    /// refuses the reverse direction.
    pub fn add_subpixel_callback_tca(&mut self, calib: &TcaCalib, reverse: bool) -> bool {
        match calib.model {
            TcaModel::None => false,
            TcaModel::Acm if reverse => false,
            model => {
                let mut terms = [0.0f64; 12];
                for (t, &v) in terms.iter_mut().zip(&calib.terms) {
                    *t = v as f64;
                }
                self.subpixel_chain.add(
                    PRIORITY_TCA,
                    SubpixelKernel::Tca {
                        model,
                        terms,
                        inverse: reverse,
                        focal: self.focal_length_normalized,
                    },
                );
                true
            }
        }
    }

    /// Install the stock vignetting kernel. `reverse` re-applies the
    /// falloff instead of correcting it.
    pub fn add_color_callback_vignetting(&mut self, calib: &VignettingCalib, reverse: bool) -> bool {
        match calib.model {
            VignettingModel::None => false,
            model => {
                let coord_scale = match model {
                    // The calibration measures radii against the short
                    // side; our normalized system against the long one.
                    VignettingModel::Pa => self.aspect_ratio_correction,
                    // Adobe radii are in units of the focal length.
                    VignettingModel::Acm => self.normalized_in_mm / calib.focal as f64,
                    VignettingModel::None => unreachable!(),
                };
                let priority = if reverse {
                    PRIORITY_UNCORRECT
                } else {
                    PRIORITY_CORRECT
                };
                self.color_chain.add(
                    priority,
                    ColorKernel::Vignetting {
                        terms: [
                            calib.terms[0] as f64,
                            calib.terms[1] as f64,
                            calib.terms[2] as f64,
                        ],
                        coord_scale,
                        multiply: reverse,
                    },
                );
                true
            }
        }
    }

    /// Install the stock distortion kernel. `reverse` simulates the
    /// distortion instead of correcting it; the Adobe model has no inverse
    /// and refuses the reverse direction.
    pub fn add_coord_callback_distortion(&mut self, calib: &DistortionCalib, reverse: bool) -> bool {
        match calib.model {
            DistortionModel::None => false,
            DistortionModel::Acm if reverse => false,
            model => {
                let mut terms = [0.0f64; 5];
                for (t, &v) in terms.iter_mut().zip(&calib.terms) {
                    *t = v as f64;
                }
                // Correcting evaluates the forward model (undistorted
                // output coordinate -> distorted source coordinate), so it
                // runs late in the chain; simulating inverts and runs
                // early.
                let (priority, inverse) = if reverse {
                    (PRIORITY_CORRECT, true)
                } else {
                    (PRIORITY_UNCORRECT, false)
                };
                self.coord_chain.add(
                    priority,
                    CoordKernel::Distortion {
                        model,
                        terms,
                        inverse,
                        focal: self.real_focal_normalized,
                    },
                );
                true
            }
        }
    }

    /// Install the stock projection-conversion kernel for an image going
    /// from projection `from` to projection `to`.
    pub fn add_coord_callback_geometry(&mut self, from: LensType, to: LensType) -> bool {
        if from == to || from == LensType::Unknown || to == LensType::Unknown {
            return false;
        }
        self.coord_chain.add(
            PRIORITY_GEOMETRY,
            CoordKernel::Geometry {
                from,
                to,
                focal: self.real_focal_normalized,
            },
        );
        true
    }

    /// Install the stock scaling kernel. A `scale` of 0.0 runs the
    /// automatic scale search, which requires every other coordinate
    /// kernel to be installed already.
    pub fn add_coord_callback_scale(&mut self, scale: f32, reverse: bool) -> bool {
        let scale = if scale == 0.0 {
            self.get_auto_scale(reverse)
        } else {
            scale
        };
        if scale == 0.0 || !scale.is_finite() {
            return false;
        }
        let factor = if reverse {
            scale as f64
        } else {
            1.0 / scale as f64
        };
        self.coord_chain
            .add(PRIORITY_SCALE, CoordKernel::Scale { factor });
        true
    }

    /// Enable perspective correction from 4, 5, 6, 7 or 8 control points
    /// given in pixel coordinates of the original image (ideally after
    /// anti-distortion).
    ///
    /// `d` is meant for a user-facing slider in -1..=1: -1 leaves the
    /// image unchanged, 0 applies the exact correction, +1 overshoots the
    /// tilt by 25 %. Returns `false` for unsupported counts or degenerate
    /// point geometry.
    pub fn enable_perspective_correction(&mut self, xs: &[f32], ys: &[f32], d: f32) -> bool {
        if xs.len() != ys.len() {
            return false;
        }
        let nx: Vec<f64> = xs
            .iter()
            .map(|&x| x as f64 * self.norm_scale - self.center_x)
            .collect();
        let ny: Vec<f64> = ys
            .iter()
            .map(|&y| y as f64 * self.norm_scale - self.center_y)
            .collect();

        match perspective::fit(&nx, &ny, d as f64, self.focal_length_normalized) {
            Some((matrix, focal)) => {
                self.coord_chain
                    .add(PRIORITY_PERSPECTIVE, CoordKernel::Perspective { matrix, focal });
                true
            }
            None => false,
        }
    }

    /// Correction stage 1: fix pixel colors (vignetting) in place.
    ///
    /// `x`/`y` are the pixel coordinates of the block's top-left corner in
    /// the full image, `row_stride` the distance between rows in
    /// *components* of the pixel type. Returns `false` when the color
    /// chain is empty and the buffer was left untouched.
    pub fn apply_color_modification(
        &self,
        mut pixels: PixelData<'_>,
        x: f32,
        y: f32,
        width: usize,
        height: usize,
        roles: RoleWord,
        row_stride: usize,
    ) -> bool {
        if self.color_chain.is_empty() || width == 0 || height == 0 {
            return false;
        }
        debug_assert_eq!(pixels.format(), self.format);

        let row_len = roles.components_for(width);
        let x0 = x as f64 * self.norm_scale - self.center_x;
        let mut yn = y as f64 * self.norm_scale - self.center_y;

        for row in 0..height {
            for (_, kernel) in &self.color_chain.entries {
                kernel.apply(
                    x0 as f32,
                    yn as f32,
                    self.norm_scale as f32,
                    pixels.slice(row * row_stride, row_len),
                    roles,
                );
            }
            yn += self.norm_scale;
        }
        true
    }

    /// Correction stage 2: compute source coordinates for a block of
    /// output pixels.
    ///
    /// For every pixel of the `width` x `height` block starting at pixel
    /// coordinates (`xu`, `yu`), the distorted source position is written
    /// to `res` as interleaved X, Y values (`width * height * 2` floats).
    /// Safe to call from multiple threads. Returns `false` when the
    /// coordinate chain is empty.
    pub fn apply_geometry_distortion(
        &self,
        xu: f32,
        yu: f32,
        width: usize,
        height: usize,
        res: &mut [f32],
    ) -> bool {
        if self.coord_chain.is_empty() || width == 0 || height == 0 {
            return false;
        }
        assert!(res.len() >= width * height * 2, "result buffer too small");

        let x0 = xu as f64 * self.norm_scale - self.center_x;
        let mut y = yu as f64 * self.norm_scale - self.center_y;

        for row in res.chunks_exact_mut(width * 2).take(height) {
            let mut x = x0;
            for p in row.chunks_exact_mut(2) {
                p[0] = x as f32;
                p[1] = y as f32;
                x += self.norm_scale;
            }
            for (_, kernel) in &self.coord_chain.entries {
                kernel.apply(row);
            }
            for p in row.chunks_exact_mut(2) {
                p[0] = ((p[0] as f64 + self.center_x) * self.norm_unscale) as f32;
                p[1] = ((p[1] as f64 + self.center_y) * self.norm_unscale) as f32;
            }
            y += self.norm_scale;
        }
        true
    }

    /// Correction stage 3: compute per-channel source coordinates for a
    /// block of output pixels.
    ///
    /// Like [`Modifier::apply_geometry_distortion`], but `res` receives
    /// three coordinate pairs per pixel in R, G, B order
    /// (`width * height * 2 * 3` floats) and only the subpixel chain runs.
    pub fn apply_subpixel_distortion(
        &self,
        xu: f32,
        yu: f32,
        width: usize,
        height: usize,
        res: &mut [f32],
    ) -> bool {
        if self.subpixel_chain.is_empty() || width == 0 || height == 0 {
            return false;
        }
        assert!(res.len() >= width * height * 6, "result buffer too small");

        let x0 = xu as f64 * self.norm_scale - self.center_x;
        let mut y = yu as f64 * self.norm_scale - self.center_y;

        for row in res.chunks_exact_mut(width * 6).take(height) {
            let mut x = x0;
            for p in row.chunks_exact_mut(6) {
                let xf = x as f32;
                let yf = y as f32;
                p.copy_from_slice(&[xf, yf, xf, yf, xf, yf]);
                x += self.norm_scale;
            }
            for (_, kernel) in &self.subpixel_chain.entries {
                kernel.apply(row);
            }
            for p in row.chunks_exact_mut(2) {
                p[0] = ((p[0] as f64 + self.center_x) * self.norm_unscale) as f32;
                p[1] = ((p[1] as f64 + self.center_y) * self.norm_unscale) as f32;
            }
            y += self.norm_scale;
        }
        true
    }

    /// Stages 2 and 3 fused: run the coordinate chain once per pixel, fan
    /// the result out to the three channels and run the subpixel chain on
    /// top.
    ///
    /// Output layout matches [`Modifier::apply_subpixel_distortion`]. This
    /// is the memory-friendly path: the caller resamples once instead of
    /// twice, with no intermediate image.
    pub fn apply_subpixel_geometry_distortion(
        &self,
        xu: f32,
        yu: f32,
        width: usize,
        height: usize,
        res: &mut [f32],
    ) -> bool {
        if (self.coord_chain.is_empty() && self.subpixel_chain.is_empty())
            || width == 0
            || height == 0
        {
            return false;
        }
        assert!(res.len() >= width * height * 6, "result buffer too small");

        let x0 = xu as f64 * self.norm_scale - self.center_x;
        let mut y = yu as f64 * self.norm_scale - self.center_y;

        for row in res.chunks_exact_mut(width * 6).take(height) {
            // Stage 2 on a tightly packed prefix of the row buffer.
            let mut x = x0;
            for p in row[..width * 2].chunks_exact_mut(2) {
                p[0] = x as f32;
                p[1] = y as f32;
                x += self.norm_scale;
            }
            for (_, kernel) in &self.coord_chain.entries {
                kernel.apply(&mut row[..width * 2]);
            }
            // Fan out to R, G, B, walking backwards so nothing is
            // overwritten before it is read.
            for i in (0..width).rev() {
                let (px, py) = (row[2 * i], row[2 * i + 1]);
                row[6 * i..6 * i + 6].copy_from_slice(&[px, py, px, py, px, py]);
            }
            for (_, kernel) in &self.subpixel_chain.entries {
                kernel.apply(row);
            }
            for p in row.chunks_exact_mut(2) {
                p[0] = ((p[0] as f64 + self.center_x) * self.norm_unscale) as f32;
                p[1] = ((p[1] as f64 + self.center_y) * self.norm_unscale) as f32;
            }
            y += self.norm_scale;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::DistortionModel;
    use std::sync::{Arc, Mutex};

    fn test_lens() -> Lens {
        let mut lens = Lens::new();
        lens.set_model("Test 20mm f/2.8", None);
        lens.add_mount("M42");
        lens.crop_factor = 1.0;
        lens.aspect_ratio = 1.0;
        lens.kind = LensType::Rectilinear;
        lens
    }

    fn poly3_lens(k1: f32) -> Lens {
        let mut lens = test_lens();
        lens.add_calib_distortion(&DistortionCalib {
            model: DistortionModel::Poly3,
            focal: 20.0,
            real_focal: 20.0,
            real_focal_measured: false,
            terms: [k1, 0.0, 0.0, 0.0, 0.0],
        });
        lens
    }

    #[test]
    fn test_initialize_reports_effective_flags() {
        let lens = poly3_lens(0.05);
        let mut modifier = Modifier::new(&lens, 1.0, 1001, 1001);
        let applied = modifier.initialize(
            PixelFormat::F32,
            20.0,
            2.8,
            1.0,
            1.0,
            LensType::Rectilinear,
            ModifyFlags::ALL,
            false,
        );

        // Only distortion has calibration data; TCA and vignetting drop
        // out, geometry is a no-op (same projection), scale is 1.0.
        assert!(applied.contains(ModifyFlags::DISTORTION));
        assert!(!applied.contains(ModifyFlags::TCA));
        assert!(!applied.contains(ModifyFlags::VIGNETTING));
        assert!(!applied.contains(ModifyFlags::GEOMETRY));
        assert!(!applied.contains(ModifyFlags::SCALE));
    }

    #[test]
    fn test_geometry_flag_requires_projection_change() {
        let lens = poly3_lens(0.05);
        let mut modifier = Modifier::new(&lens, 1.0, 1001, 1001);
        let applied = modifier.initialize(
            PixelFormat::F32,
            20.0,
            2.8,
            1.0,
            1.0,
            LensType::Panoramic,
            ModifyFlags::GEOMETRY,
            false,
        );
        assert!(applied.contains(ModifyFlags::GEOMETRY));
    }

    #[test]
    fn test_deprecated_flag_bit_ignored() {
        let lens = poly3_lens(0.05);
        let mut modifier = Modifier::new(&lens, 1.0, 1001, 1001);
        let applied = modifier.initialize(
            PixelFormat::F32,
            20.0,
            2.8,
            1.0,
            1.0,
            LensType::Rectilinear,
            ModifyFlags(4),
            false,
        );
        assert_eq!(applied, ModifyFlags::empty());
    }

    #[test]
    fn test_callback_order_ascending_priority_stable() {
        let lens = test_lens();
        let mut modifier = Modifier::new(&lens, 1.0, 101, 101);

        let order = Arc::new(Mutex::new(Vec::new()));
        for (id, priority) in [(0u32, 500), (1, 100), (2, 500), (3, 900)] {
            let order = Arc::clone(&order);
            modifier.add_coord_callback(priority, move |_io| {
                order.lock().unwrap().push(id);
            });
        }

        let mut buf = [0.0f32; 2];
        assert!(modifier.apply_geometry_distortion(50.0, 50.0, 1, 1, &mut buf));
        // Ascending priority; the two priority-500 callbacks keep their
        // insertion order.
        assert_eq!(*order.lock().unwrap(), vec![1, 0, 2, 3]);
    }

    #[test]
    fn test_apply_with_empty_chains_returns_false() {
        let lens = test_lens();
        let modifier = Modifier::new(&lens, 1.0, 101, 101);
        let mut buf = [0.0f32; 32];
        assert!(!modifier.apply_geometry_distortion(0.0, 0.0, 4, 4, &mut buf[..]));
        assert!(!modifier.apply_subpixel_distortion(0.0, 0.0, 2, 2, &mut buf[..]));
        let mut px = [0.5f32; 12];
        assert!(!modifier.apply_color_modification(
            PixelData::F32(&mut px),
            0.0,
            0.0,
            4,
            1,
            RoleWord::RGB,
            12,
        ));
    }

    #[test]
    fn test_identity_chain_reproduces_grid() {
        let lens = test_lens();
        let mut modifier = Modifier::new(&lens, 1.0, 101, 101);
        modifier.add_coord_callback(500, |_io| {});

        let mut buf = [0.0f32; 3 * 2 * 2];
        assert!(modifier.apply_geometry_distortion(10.0, 20.0, 3, 2, &mut buf));
        // The chain does nothing, so the output is the identity grid.
        let expected = [
            (10.0, 20.0),
            (11.0, 20.0),
            (12.0, 20.0),
            (10.0, 21.0),
            (11.0, 21.0),
            (12.0, 21.0),
        ];
        for (pair, (ex, ey)) in buf.chunks_exact(2).zip(expected) {
            assert!(
                (pair[0] - ex).abs() < 1e-4 && (pair[1] - ey).abs() < 1e-4,
                "got ({}, {}), want ({ex}, {ey})",
                pair[0],
                pair[1],
            );
        }
    }

    #[test]
    fn test_center_shift_moves_origin() {
        let mut lens = test_lens();
        lens.center_x = 0.1;
        let mut modifier = Modifier::new(&lens, 1.0, 101, 101);
        // A kernel that records the normalized coordinate it sees.
        let seen = Arc::new(Mutex::new((0.0f32, 0.0f32)));
        {
            let seen = Arc::clone(&seen);
            modifier.add_coord_callback(500, move |io| {
                *seen.lock().unwrap() = (io[0], io[1]);
            });
        }
        let mut buf = [0.0f32; 2];
        // The geometric centre of a 101-pixel grid is pixel 50; with a
        // +0.1 shift the optical centre sits at pixel 60.
        modifier.apply_geometry_distortion(60.0, 50.0, 1, 1, &mut buf);
        let (nx, ny) = *seen.lock().unwrap();
        assert!(nx.abs() < 1e-6 && ny.abs() < 1e-6, "({nx}, {ny})");
    }

    #[test]
    fn test_fused_matches_separate_stages() {
        let mut lens = poly3_lens(0.06);
        let mut tca = [0.0f32; 12];
        tca[0] = 1.003;
        tca[1] = 0.997;
        lens.add_calib_tca(&TcaCalib {
            model: TcaModel::Linear,
            focal: 20.0,
            terms: tca,
        });

        let mut modifier = Modifier::new(&lens, 1.0, 201, 151);
        let applied = modifier.initialize(
            PixelFormat::F32,
            20.0,
            2.8,
            1.0,
            1.0,
            LensType::Rectilinear,
            ModifyFlags::ALL,
            false,
        );
        assert!(applied.contains(ModifyFlags::DISTORTION));
        assert!(applied.contains(ModifyFlags::TCA));

        // Fused output for one block.
        let (w, h) = (4, 3);
        let mut fused = vec![0.0f32; w * h * 6];
        assert!(modifier.apply_subpixel_geometry_distortion(30.0, 40.0, w, h, &mut fused));

        // Manual two-stage evaluation of the same block: stage 2 grid,
        // then stage 3 seeded from the stage 2 result. The subpixel chain
        // runs in normalized units, so replicate the steps by hand.
        let mut coords = vec![0.0f32; w * h * 2];
        assert!(modifier.apply_geometry_distortion(30.0, 40.0, w, h, &mut coords));

        for (pix, pair) in fused.chunks_exact(6).zip(coords.chunks_exact(2)) {
            // Green matches stage 2 exactly: the linear TCA kernel leaves
            // green untouched.
            assert!(
                (pix[2] - pair[0]).abs() < 1e-3 && (pix[3] - pair[1]).abs() < 1e-3,
                "green {:?} vs stage-2 {:?}",
                &pix[2..4],
                pair,
            );
            // Red and blue are scaled around the optical centre.
            assert!(pix[0].is_finite() && pix[4].is_finite());
        }
    }

    #[test]
    fn test_subpixel_seeds_three_channels() {
        let lens = test_lens();
        let mut modifier = Modifier::new(&lens, 1.0, 101, 101);
        modifier.add_subpixel_callback(500, |_io| {});

        let mut buf = [0.0f32; 6];
        assert!(modifier.apply_subpixel_distortion(25.0, 75.0, 1, 1, &mut buf));
        for c in buf.chunks_exact(2) {
            assert!((c[0] - 25.0).abs() < 1e-4 && (c[1] - 75.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_distortion_roundtrip_through_modifier() {
        let lens = poly3_lens(0.08);
        let mut forward = Modifier::new(&lens, 1.0, 1001, 1001);
        let applied = forward.initialize(
            PixelFormat::F32,
            20.0,
            2.8,
            1.0,
            1.0,
            LensType::Rectilinear,
            ModifyFlags::DISTORTION,
            false,
        );
        assert!(applied.contains(ModifyFlags::DISTORTION));

        let mut reverse = Modifier::new(&lens, 1.0, 1001, 1001);
        let applied = reverse.initialize(
            PixelFormat::F32,
            20.0,
            2.8,
            1.0,
            1.0,
            LensType::Rectilinear,
            ModifyFlags::DISTORTION,
            true,
        );
        assert!(applied.contains(ModifyFlags::DISTORTION));

        // Map a 32 x 32 grid forward, then feed every result through the
        // reverse modifier; the composition must be the identity to 1e-4
        // in normalized units (= half the image side).
        let tol = 1e-4 * 500.0;
        for gy in 0..32 {
            for gx in 0..32 {
                let px = gx as f32 * 1000.0 / 31.0;
                let py = gy as f32 * 1000.0 / 31.0;
                let mut buf = [0.0f32; 2];
                assert!(forward.apply_geometry_distortion(px, py, 1, 1, &mut buf));
                let mut back = [0.0f32; 2];
                assert!(reverse.apply_geometry_distortion(buf[0], buf[1], 1, 1, &mut back));
                assert!(
                    (back[0] - px).abs() < tol && (back[1] - py).abs() < tol,
                    "roundtrip failed at ({px}, {py}): ({}, {})",
                    back[0],
                    back[1],
                );
            }
        }
    }

    #[test]
    fn test_vignetting_color_modification() {
        let mut lens = test_lens();
        lens.add_calib_vignetting(&VignettingCalib {
            model: VignettingModel::Pa,
            focal: 20.0,
            aperture: 2.8,
            distance: 1.0,
            terms: [-0.3, 0.0, 0.0],
        });
        lens.guess_parameters();

        let mut modifier = Modifier::new(&lens, 1.0, 101, 101);
        let applied = modifier.initialize(
            PixelFormat::F32,
            20.0,
            2.8,
            1.0,
            1.0,
            LensType::Rectilinear,
            ModifyFlags::VIGNETTING,
            false,
        );
        assert!(applied.contains(ModifyFlags::VIGNETTING));

        // One pixel at the optical centre, one at the right edge.
        let mut centre = [0.5f32, 0.5, 0.5];
        assert!(modifier.apply_color_modification(
            PixelData::F32(&mut centre),
            50.0,
            50.0,
            1,
            1,
            RoleWord::RGB,
            3,
        ));
        assert!((centre[0] - 0.5).abs() < 1e-6, "centre pixel must not change");

        let mut edge = [0.5f32, 0.5, 0.5];
        assert!(modifier.apply_color_modification(
            PixelData::F32(&mut edge),
            100.0,
            50.0,
            1,
            1,
            RoleWord::RGB,
            3,
        ));
        assert!(edge[0] > 0.5, "edge pixel must be brightened");
    }
}
