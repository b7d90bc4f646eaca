//! Interpolation of calibration records at arbitrary shooting parameters.
//!
//! Distortion, TCA, crop and field-of-view data are sampled along the focal
//! axis and interpolated with a Hermite cubic spline over up to four
//! neighbouring samples. Vignetting is sampled along three axes (focal,
//! aperture, focus distance) and interpolated with inverse distance
//! weighting.
//!
//! # Parameter-axis rescaling
//!
//! Both methods work best when the sampled values follow a roughly linear
//! slope in the focal length. Most distortion and TCA parameters fall off
//! like 1/f, so each term is multiplied by its sample's focal length before
//! interpolation and divided by the query focal afterwards. The Adobe (ACM)
//! models use a coordinate system that itself scales with the focal length,
//! which makes their parameters grow with powers of f; those terms are
//! additionally divided by the focal length raised to the power of the r
//! exponent they multiply in the model formula. The per-channel scale
//! factors near unity (TCA orders 0 and 1) and the D'Angelo vignetting
//! terms stay unscaled.
//!
//! Exact matches (within 1e-4 of a sample on the vignetting axes, exact
//! focal equality elsewhere) return the sample verbatim and skip the
//! rescaling entirely.

use crate::lens::{
    CropCalib, CropMode, DistortionCalib, DistortionModel, FovCalib, Lens, TcaCalib, TcaModel,
    VignettingCalib, VignettingModel,
};

/// Hermite cubic through the two inner points `y2` (at t = 0) and `y3`
/// (at t = 1), with one-sided tangents when an outer neighbour is missing.
pub(crate) fn hermite(y1: Option<f64>, y2: f64, y3: f64, y4: Option<f64>, t: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;

    let tg2 = match y1 {
        Some(y1) => (y3 - y1) * 0.5,
        None => y3 - y2,
    };
    let tg3 = match y4 {
        Some(y4) => (y4 - y2) * 0.5,
        None => y3 - y2,
    };

    (2.0 * t3 - 3.0 * t2 + 1.0) * y2
        + (t3 - 2.0 * t2 + t) * tg2
        + (-2.0 * t3 + 3.0 * t2) * y3
        + (t3 - t2) * tg3
}

/// The up-to-four spline neighbours of a query focal: indices of the two
/// nearest samples below and the two nearest above, by focal length.
#[derive(Debug, Default)]
struct SplineSlots {
    below: [Option<usize>; 2], // below[1] is nearest, below[0] second-nearest
    above: [Option<usize>; 2], // above[0] is nearest, above[1] second-nearest
}

impl SplineSlots {
    fn insert(&mut self, focals: impl Fn(usize) -> f32, idx: usize, delta: f32) {
        if delta < 0.0 {
            match self.below[1] {
                Some(cur) if focals(cur) >= focals(idx) => {
                    if self.below[0].map_or(true, |c| focals(c) < focals(idx)) {
                        self.below[0] = Some(idx);
                    }
                }
                cur => {
                    self.below[0] = cur;
                    self.below[1] = Some(idx);
                }
            }
        } else {
            match self.above[0] {
                Some(cur) if focals(cur) <= focals(idx) => {
                    if self.above[1].map_or(true, |c| focals(c) > focals(idx)) {
                        self.above[1] = Some(idx);
                    }
                }
                cur => {
                    self.above[1] = cur;
                    self.above[0] = Some(idx);
                }
            }
        }
    }
}

/// Outcome of scanning a calibration list for a query focal.
enum Selection {
    /// A sample with exactly the query focal.
    Exact(usize),
    /// A single admissible sample (all neighbours on one side).
    Single(usize),
    /// Inner pair plus optional outer neighbours: (y1, y2, y3, y4).
    Spline(Option<usize>, usize, usize, Option<usize>),
    /// Nothing admissible at all.
    Nothing,
}

/// Scan a list, latching the model family of the first admissible record and
/// silently skipping records of other families, and pick the spline
/// neighbours of `focal`.
fn select<F, A>(count: usize, admissible: A, focal_of: F, focal: f32) -> Selection
where
    F: Fn(usize) -> f32,
    A: Fn(usize) -> bool,
{
    let mut slots = SplineSlots::default();
    let mut any = false;
    for idx in 0..count {
        if !admissible(idx) {
            continue;
        }
        any = true;
        let delta = focal - focal_of(idx);
        if delta == 0.0 {
            return Selection::Exact(idx);
        }
        slots.insert(&focal_of, idx, -delta);
    }

    if !any {
        return Selection::Nothing;
    }
    match (slots.below[1], slots.above[0]) {
        (Some(lo), Some(hi)) => Selection::Spline(slots.below[0], lo, hi, slots.above[1]),
        (Some(lo), None) => Selection::Single(lo),
        (None, Some(hi)) => Selection::Single(hi),
        (None, None) => Selection::Nothing,
    }
}

/// Which correction a parameter scale is asked for.
#[derive(Clone, Copy)]
enum ScaleKind {
    Distortion(DistortionModel),
    Tca(TcaModel),
    Vignetting(VignettingModel),
}

/// Parameter-axis scale factor for term `index` at focal length `f`.
///
/// Terms are multiplied by the factor at each sample's focal and divided by
/// the factor at the query focal.
fn parameter_scale(kind: ScaleKind, index: usize, f: f64) -> f64 {
    match kind {
        ScaleKind::Distortion(model) => match model {
            DistortionModel::Poly3 | DistortionModel::Poly5 | DistortionModel::PtLens => f,
            DistortionModel::Acm => {
                let exponent = if index < 3 { 2 * (index as i32 + 1) } else { 1 };
                f / f.powi(exponent)
            }
            DistortionModel::None => f,
        },
        ScaleKind::Tca(model) => match model {
            TcaModel::Linear | TcaModel::Poly3 => {
                if index < 2 {
                    1.0
                } else {
                    f
                }
            }
            TcaModel::Acm => {
                let exponent = if index > 1 && index < 8 {
                    (index as i32 / 2) * 2
                } else {
                    1
                };
                f / f.powi(exponent)
            }
            TcaModel::None => f,
        },
        ScaleKind::Vignetting(model) => match model {
            VignettingModel::Pa => 1.0,
            VignettingModel::Acm => {
                let exponent = 2 * (index as i32 + 1);
                1.0 / f.powi(exponent)
            }
            VignettingModel::None => 1.0,
        },
    }
}

/// Interpolate one term across the spline slots with parameter rescaling.
fn spline_term<G>(
    kind: ScaleKind,
    index: usize,
    term: G,
    focal_of: impl Fn(usize) -> f32,
    slots: (Option<usize>, usize, usize, Option<usize>),
    focal: f32,
    t: f64,
) -> f64
where
    G: Fn(usize) -> f32,
{
    let scaled = |idx: usize| {
        term(idx) as f64 * parameter_scale(kind, index, focal_of(idx) as f64)
    };
    let (y1, y2, y3, y4) = slots;
    hermite(y1.map(&scaled), scaled(y2), scaled(y3), y4.map(&scaled), t)
        / parameter_scale(kind, index, focal as f64)
}

impl Lens {
    /// Interpolate the distortion model at the given focal length.
    ///
    /// `None` when there is no admissible calibration data. A sample with
    /// exactly the query focal is returned verbatim.
    pub fn interpolate_distortion(&self, focal: f32) -> Option<DistortionCalib> {
        let list = &self.calib_distortion;

        // The first non-NONE model wins; other families are skipped.
        let family = list
            .iter()
            .map(|c| c.model)
            .find(|&m| m != DistortionModel::None)?;

        let admissible = |i: usize| list[i].model == family;
        let focal_of = |i: usize| list[i].focal;
        let slots = match select(list.len(), admissible, focal_of, focal) {
            Selection::Exact(i) | Selection::Single(i) => return Some(list[i]),
            Selection::Nothing => return None,
            Selection::Spline(y1, y2, y3, y4) => (y1, y2, y3, y4),
        };

        let (_, lo, hi, _) = slots;
        let t = ((focal - list[lo].focal) / (list[hi].focal - list[lo].focal)) as f64;
        let kind = ScaleKind::Distortion(family);

        let mut res = DistortionCalib {
            model: family,
            focal,
            real_focal: hermite(
                slots.0.map(|i| list[i].real_focal as f64),
                list[lo].real_focal as f64,
                list[hi].real_focal as f64,
                slots.3.map(|i| list[i].real_focal as f64),
                t,
            ) as f32,
            real_focal_measured: list[lo].real_focal_measured && list[hi].real_focal_measured,
            terms: [0.0; 5],
        };
        for index in 0..res.terms.len() {
            res.terms[index] =
                spline_term(kind, index, |i| list[i].terms[index], focal_of, slots, focal, t)
                    as f32;
        }
        Some(res)
    }

    /// Interpolate the TCA model at the given focal length.
    pub fn interpolate_tca(&self, focal: f32) -> Option<TcaCalib> {
        let list = &self.calib_tca;
        let family = list
            .iter()
            .map(|c| c.model)
            .find(|&m| m != TcaModel::None)?;

        let admissible = |i: usize| list[i].model == family;
        let focal_of = |i: usize| list[i].focal;
        let slots = match select(list.len(), admissible, focal_of, focal) {
            Selection::Exact(i) | Selection::Single(i) => return Some(list[i]),
            Selection::Nothing => return None,
            Selection::Spline(y1, y2, y3, y4) => (y1, y2, y3, y4),
        };

        let (_, lo, hi, _) = slots;
        let t = ((focal - list[lo].focal) / (list[hi].focal - list[lo].focal)) as f64;
        let kind = ScaleKind::Tca(family);

        let mut res = TcaCalib {
            model: family,
            focal,
            terms: [0.0; 12],
        };
        for index in 0..res.terms.len() {
            res.terms[index] =
                spline_term(kind, index, |i| list[i].terms[index], focal_of, slots, focal, t)
                    as f32;
        }
        Some(res)
    }

    /// Interpolate the vignetting model at the given focal length, aperture
    /// and focus distance, by inverse distance weighting with power 3.5.
    ///
    /// Fails when the nearest sample is farther than one unit away in the
    /// normalised (focal, 4/aperture, 0.1/distance) space.
    pub fn interpolate_vignetting(
        &self,
        focal: f32,
        aperture: f32,
        distance: f32,
    ) -> Option<VignettingCalib> {
        const POWER: f64 = 3.5;
        const EXACT: f64 = 1e-4;

        let list = &self.calib_vignetting;
        let family = list
            .iter()
            .map(|c| c.model)
            .find(|&m| m != VignettingModel::None)?;
        let kind = ScaleKind::Vignetting(family);

        let mut res = VignettingCalib {
            model: family,
            focal,
            aperture,
            distance,
            terms: [0.0; 3],
        };
        let mut acc = [0.0f64; 3];
        let mut total_weight = 0.0f64;
        let mut smallest = f64::INFINITY;

        for c in list.iter().filter(|c| c.model == family) {
            let d = self.vignetting_axis_distance(c, focal, aperture, distance);
            if d < EXACT {
                return Some(*c);
            }
            smallest = smallest.min(d);
            let weight = (1.0 / d.powf(POWER)).abs();
            for (index, slot) in acc.iter_mut().enumerate() {
                *slot +=
                    weight * c.terms[index] as f64 * parameter_scale(kind, index, c.focal as f64);
            }
            total_weight += weight;
        }

        if smallest > 1.0 || total_weight <= 0.0 {
            return None;
        }
        for (index, slot) in acc.iter().enumerate() {
            res.terms[index] =
                (slot / total_weight / parameter_scale(kind, index, focal as f64)) as f32;
        }
        Some(res)
    }

    /// Distance between the query point and a sample in the normalised
    /// vignetting parameter space. The focal axis is normalised to the
    /// lens's focal range, aperture and distance to reciprocal axes (their
    /// influence falls off with 1/value).
    fn vignetting_axis_distance(
        &self,
        c: &VignettingCalib,
        focal: f32,
        aperture: f32,
        distance: f32,
    ) -> f64 {
        let range = (self.max_focal - self.min_focal) as f64;
        let (f1, f2) = if range != 0.0 {
            (
                (focal - self.min_focal) as f64 / range,
                (c.focal - self.min_focal) as f64 / range,
            )
        } else {
            (0.0, 0.0)
        };
        let a1 = 4.0 / aperture as f64;
        let a2 = 4.0 / c.aperture as f64;
        let d1 = 0.1 / distance as f64;
        let d2 = 0.1 / c.distance as f64;

        ((f2 - f1).powi(2) + (a2 - a1).powi(2) + (d2 - d1).powi(2)).sqrt()
    }

    /// Interpolate the crop rectangle at the given focal length.
    pub fn interpolate_crop(&self, focal: f32) -> Option<CropCalib> {
        let list = &self.calib_crop;
        let family = list
            .iter()
            .map(|c| c.mode)
            .find(|&m| m != CropMode::NoCrop)?;

        let admissible = |i: usize| list[i].mode == family;
        let focal_of = |i: usize| list[i].focal;
        let slots = match select(list.len(), admissible, focal_of, focal) {
            Selection::Exact(i) | Selection::Single(i) => return Some(list[i]),
            Selection::Nothing => return None,
            Selection::Spline(y1, y2, y3, y4) => (y1, y2, y3, y4),
        };

        let (y1, lo, hi, y4) = slots;
        let t = ((focal - list[lo].focal) / (list[hi].focal - list[lo].focal)) as f64;

        let mut res = CropCalib {
            focal,
            mode: family,
            crop: [0.0; 4],
        };
        for index in 0..4 {
            res.crop[index] = hermite(
                y1.map(|i| list[i].crop[index] as f64),
                list[lo].crop[index] as f64,
                list[hi].crop[index] as f64,
                y4.map(|i| list[i].crop[index] as f64),
                t,
            ) as f32;
        }
        Some(res)
    }

    /// Interpolate the field of view at the given focal length (deprecated
    /// database entry).
    pub fn interpolate_fov(&self, focal: f32) -> Option<FovCalib> {
        let list = &self.calib_fov;
        let admissible = |i: usize| list[i].field_of_view != 0.0;
        if !list.iter().any(|c| c.field_of_view != 0.0) {
            return None;
        }

        let focal_of = |i: usize| list[i].focal;
        let slots = match select(list.len(), admissible, focal_of, focal) {
            Selection::Exact(i) | Selection::Single(i) => return Some(list[i]),
            Selection::Nothing => return None,
            Selection::Spline(y1, y2, y3, y4) => (y1, y2, y3, y4),
        };

        let (y1, lo, hi, y4) = slots;
        let t = ((focal - list[lo].focal) / (list[hi].focal - list[lo].focal)) as f64;
        Some(FovCalib {
            focal,
            field_of_view: hermite(
                y1.map(|i| list[i].field_of_view as f64),
                list[lo].field_of_view as f64,
                list[hi].field_of_view as f64,
                y4.map(|i| list[i].field_of_view as f64),
                t,
            ) as f32,
        })
    }
}
