//! Lens records and their calibration data.
//!
//! A lens owns five unsorted lists of sampled calibration records, keyed by
//! focal length (vignetting additionally by aperture and focus distance).
//! Adding a record replaces an existing entry with an equal key tuple.
//! Interpolation over these lists lives in [`crate::interp`].
//!
//! # Coordinate conventions
//!
//! Distortion and TCA radii are normalised distances to the optical centre,
//! with 1.0 at half the longer side of the calibration sensor. The Adobe
//! (ACM) models instead measure everything in units of the focal length.
//! Crop rectangles are relative to the long side as well.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::mlstr::MlStr;

/// Lens distortion models.
///
/// Distortion depends heavily on the focal length but not on the aperture.
/// `rd` is the distorted radius, `ru` the undistorted (corrected) one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum DistortionModel {
    /// Distortion parameters are unknown.
    #[default]
    None = 0,
    /// 3rd order polynomial, a subset of the PTLens model:
    /// `rd = ru * (1 - k1 + k1 * ru^2)`.
    Poly3 = 1,
    /// 5th order polynomial: `rd = ru * (1 + k1 * ru^2 + k2 * ru^4)`.
    Poly5 = 2,
    /// PTLens model, also used by Hugin:
    /// `rd = ru * (a * ru^3 + b * ru^2 + c * ru + 1 - a - b - c)`.
    PtLens = 3,
    /// Adobe camera model, in units of the focal length:
    ///
    /// ```text
    /// xd = xu (1 + k1 ru^2 + k2 ru^4 + k3 ru^6) + 2 xu (k4 yu + k5 xu) + k5 ru^2
    /// yd = yu (1 + k1 ru^2 + k2 ru^4 + k3 ru^6) + 2 yu (k4 yu + k5 xu) + k4 ru^2
    /// ```
    Acm = 4,
}

/// Transversal (lateral) chromatic aberration models.
///
/// TCA depends on the focal length; the red and blue channels carry separate
/// coefficient sets while green is the reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum TcaModel {
    /// No TCA correction data known.
    #[default]
    None = 0,
    /// Linear model: `rd_R = ru_R * kr`, `rd_B = ru_B * kb`.
    Linear = 1,
    /// Third order polynomial, per channel:
    /// `rd = ru * (b * ru^2 + c * ru + v)`.
    Poly3 = 2,
    /// Adobe camera model for TCA, per channel, in units of the focal
    /// length; cubic radial plus two tangential terms, premultiplied by a
    /// channel scale (alpha0/beta0).
    Acm = 3,
}

/// Vignetting models. Only optical and natural vignetting are covered;
/// mechanical vignetting cannot be generalised per lens type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum VignettingModel {
    /// No vignetting correction data known.
    #[default]
    None = 0,
    /// Pablo D'Angelo model, a generalisation of the cos^4 law:
    /// `cd = cs / (1 + k1 r^2 + k2 r^4 + k3 r^6)`.
    Pa = 1,
    /// Adobe vignetting model; same polynomial with the radius measured in
    /// units of the focal length.
    Acm = 2,
}

/// Crop modes for removing dark borders (e.g. circular fisheye images).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum CropMode {
    /// No crop.
    #[default]
    NoCrop = 0,
    /// Rectangular crop area.
    Rectangle = 1,
    /// Circular crop area.
    Circle = 2,
}

/// Lens projection types.
///
/// The discriminants are stable across versions; they persist in external
/// databases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum LensType {
    /// Unknown projection.
    #[default]
    Unknown = 0,
    /// Rectilinear: straight lines stay straight. Nearly all lenses.
    Rectilinear = 1,
    /// Equidistant fisheye.
    Fisheye = 2,
    /// Cylindrical panorama. No real lens projects this way; useful as a
    /// conversion target.
    Panoramic = 3,
    /// Equirectangular. Conversion target only, like panoramic.
    Equirectangular = 4,
    /// Orthographic fisheye.
    FisheyeOrthographic = 5,
    /// Stereographic fisheye.
    FisheyeStereographic = 6,
    /// Equisolid fisheye.
    FisheyeEquisolid = 7,
    /// Fisheye as measured by Thoby (Nikkor 10.5).
    FisheyeThoby = 8,
}

/// Distortion calibration sample. Keyed by nominal focal length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistortionCalib {
    /// Distortion model the terms belong to.
    pub model: DistortionModel,
    /// Nominal focal length in mm at which the data was measured.
    pub focal: f32,
    /// Real (paraxial) focal length in mm for this nominal focal length.
    ///
    /// The nominal focal length is the EXIF value or the gravure on the
    /// barrel; especially for fisheyes the paraxial focal length differs.
    /// Projection math uses this value.
    pub real_focal: f32,
    /// Whether the real focal length was actually measured (as opposed to
    /// defaulted from the nominal value by the loader).
    pub real_focal_measured: bool,
    /// Model coefficients: `[k1]`, `[k1, k2]`, `[a, b, c]` or
    /// `[k1, k2, k3, k4, k5]` depending on the model.
    pub terms: [f32; 5],
}

/// TCA calibration sample. Keyed by nominal focal length.
///
/// Term layout per model: LINEAR `[kr, kb]`; POLY3 `[vr, vb, cr, cb, br,
/// bb]`; ACM `[alpha0, beta0, alpha1, beta1, ..., alpha5, beta5]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TcaCalib {
    /// TCA model the terms belong to.
    pub model: TcaModel,
    /// Nominal focal length in mm at which the data was measured.
    pub focal: f32,
    /// Model coefficients, red then blue per order position.
    pub terms: [f32; 12],
}

/// Vignetting calibration sample. Keyed by (focal, aperture, distance).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VignettingCalib {
    /// Vignetting model the terms belong to.
    pub model: VignettingModel,
    /// Nominal focal length in mm.
    pub focal: f32,
    /// Aperture (f-number).
    pub aperture: f32,
    /// Focus distance in meters.
    pub distance: f32,
    /// Model coefficients `[k1, k2, k3]`.
    pub terms: [f32; 3],
}

/// Image crop sample. Keyed by nominal focal length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropCalib {
    /// Nominal focal length in mm.
    pub focal: f32,
    /// Crop mode to apply.
    pub mode: CropMode,
    /// Crop coordinates `[left, right, top, bottom]`, relative to the long
    /// side. Left/right always refer to the long side, top/bottom to the
    /// short side. Negative values are allowed for crop circles extending
    /// beyond the image border.
    pub crop: [f32; 4],
}

/// Field-of-view sample (deprecated database entry). Keyed by focal length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FovCalib {
    /// Nominal focal length in mm.
    pub focal: f32,
    /// Field of view in degrees across the long side.
    pub field_of_view: f32,
}

/// A single parameter of a calibration model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelParam {
    /// Parameter name as it appears in calibration files.
    pub name: &'static str,
    /// Minimal value that makes sense.
    pub min: f32,
    /// Maximal value that makes sense.
    pub max: f32,
    /// Default value.
    pub default: f32,
}

/// Human-readable description of a calibration model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelDesc {
    /// Short model name.
    pub name: &'static str,
    /// Technical description, possibly multi-line.
    pub details: &'static str,
    /// Parameter descriptors in term order.
    pub params: &'static [ModelParam],
}

const fn param(name: &'static str, min: f32, max: f32, default: f32) -> ModelParam {
    ModelParam {
        name,
        min,
        max,
        default,
    }
}

static DIST_POLY3_PARAMS: [ModelParam; 1] = [param("k1", -0.2, 0.2, 0.0)];
static DIST_POLY5_PARAMS: [ModelParam; 2] =
    [param("k1", -0.2, 0.2, 0.0), param("k2", -0.2, 0.2, 0.0)];
static DIST_PTLENS_PARAMS: [ModelParam; 3] = [
    param("a", -0.5, 0.5, 0.0),
    param("b", -1.0, 1.0, 0.0),
    param("c", -1.0, 1.0, 0.0),
];
static DIST_ACM_PARAMS: [ModelParam; 5] = [
    param("k1", -0.2, 0.2, 0.0),
    param("k2", -0.2, 0.2, 0.0),
    param("k3", -1.0, 1.0, 0.0),
    param("k4", -1.0, 1.0, 0.0),
    param("k5", -1.0, 1.0, 0.0),
];

static TCA_LINEAR_PARAMS: [ModelParam; 2] =
    [param("kr", 0.99, 1.01, 1.0), param("kb", 0.99, 1.01, 1.0)];
static TCA_POLY3_PARAMS: [ModelParam; 6] = [
    param("vr", 0.99, 1.01, 1.0),
    param("vb", 0.99, 1.01, 1.0),
    param("cr", -0.01, 0.01, 0.0),
    param("cb", -0.01, 0.01, 0.0),
    param("br", -0.01, 0.01, 0.0),
    param("bb", -0.01, 0.01, 0.0),
];
static TCA_ACM_PARAMS: [ModelParam; 12] = [
    param("alpha0", 0.99, 1.01, 1.0),
    param("beta0", 0.99, 1.01, 1.0),
    param("alpha1", -0.01, 0.01, 0.0),
    param("beta1", -0.01, 0.01, 0.0),
    param("alpha2", -0.01, 0.01, 0.0),
    param("beta2", -0.01, 0.01, 0.0),
    param("alpha3", -0.01, 0.01, 0.0),
    param("beta3", -0.01, 0.01, 0.0),
    param("alpha4", -0.01, 0.01, 0.0),
    param("beta4", -0.01, 0.01, 0.0),
    param("alpha5", -0.01, 0.01, 0.0),
    param("beta5", -0.01, 0.01, 0.0),
];

static VIG_PA_PARAMS: [ModelParam; 3] = [
    param("k1", -3.0, 1.0, 0.0),
    param("k2", -5.0, 10.0, 0.0),
    param("k3", -5.0, 10.0, 0.0),
];
static VIG_ACM_PARAMS: [ModelParam; 3] = [
    param("alpha1", -1.0, 1.0, 0.0),
    param("alpha2", -5.0, 10.0, 0.0),
    param("alpha3", -5.0, 10.0, 0.0),
];

static CROP_PARAMS: [ModelParam; 4] = [
    param("left", -1.0, 1.0, 0.0),
    param("right", 0.0, 2.0, 0.0),
    param("top", -1.0, 1.0, 0.0),
    param("bottom", 0.0, 2.0, 0.0),
];

impl DistortionModel {
    /// Human-readable description and parameter bounds of this model.
    pub fn descriptor(self) -> ModelDesc {
        match self {
            DistortionModel::None => ModelDesc {
                name: "None",
                details: "No distortion model",
                params: &[],
            },
            DistortionModel::Poly3 => ModelDesc {
                name: "3rd order polynomial",
                details: "Rd = Ru * (1 - k1 + k1 * Ru^2)",
                params: &DIST_POLY3_PARAMS,
            },
            DistortionModel::Poly5 => ModelDesc {
                name: "5th order polynomial",
                details: "Rd = Ru * (1 + k1 * Ru^2 + k2 * Ru^4)",
                params: &DIST_POLY5_PARAMS,
            },
            DistortionModel::PtLens => ModelDesc {
                name: "PanoTools lens model",
                details: "Rd = Ru * (a * Ru^3 + b * Ru^2 + c * Ru + 1 - (a + b + c))",
                params: &DIST_PTLENS_PARAMS,
            },
            DistortionModel::Acm => ModelDesc {
                name: "Adobe camera model",
                details: "x_d = x_u (1 + k1 r^2 + k2 r^4 + k3 r^6) + 2x(k4 y + k5 x) + k5 r^2\n\
                          y_d = y_u (1 + k1 r^2 + k2 r^4 + k3 r^6) + 2y(k4 y + k5 x) + k4 r^2\n\
                          Coordinates are in units of the focal length.",
                params: &DIST_ACM_PARAMS,
            },
        }
    }
}

impl TcaModel {
    /// Human-readable description and parameter bounds of this model.
    pub fn descriptor(self) -> ModelDesc {
        match self {
            TcaModel::None => ModelDesc {
                name: "None",
                details: "No transversal chromatic aberration model",
                params: &[],
            },
            TcaModel::Linear => ModelDesc {
                name: "Linear",
                details: "Rd = Ru * k",
                params: &TCA_LINEAR_PARAMS,
            },
            TcaModel::Poly3 => ModelDesc {
                name: "3rd order polynomial",
                details: "Rd = Ru^3 * b + Ru^2 * c + Ru * v",
                params: &TCA_POLY3_PARAMS,
            },
            TcaModel::Acm => ModelDesc {
                name: "Adobe camera model",
                details: "Per-channel cubic radial plus tangential terms,\n\
                          coordinates in units of the focal length.",
                params: &TCA_ACM_PARAMS,
            },
        }
    }
}

impl VignettingModel {
    /// Human-readable description and parameter bounds of this model.
    pub fn descriptor(self) -> ModelDesc {
        match self {
            VignettingModel::None => ModelDesc {
                name: "None",
                details: "No vignetting model",
                params: &[],
            },
            VignettingModel::Pa => ModelDesc {
                name: "6th order polynomial (Pablo D'Angelo)",
                details: "Cd = Cs / (1 + k1 * R^2 + k2 * R^4 + k3 * R^6)",
                params: &VIG_PA_PARAMS,
            },
            VignettingModel::Acm => ModelDesc {
                name: "6th order polynomial (Adobe)",
                details: "Cd = Cs / (1 + k1 * R^2 + k2 * R^4 + k3 * R^6),\n\
                          R in units of the focal length.",
                params: &VIG_ACM_PARAMS,
            },
        }
    }
}

impl CropMode {
    /// Human-readable description and parameter bounds of this crop mode.
    pub fn descriptor(self) -> ModelDesc {
        match self {
            CropMode::NoCrop => ModelDesc {
                name: "No crop",
                details: "No crop",
                params: &[],
            },
            CropMode::Rectangle => ModelDesc {
                name: "rectangular crop",
                details: "Rectangular crop area",
                params: &CROP_PARAMS,
            },
            CropMode::Circle => ModelDesc {
                name: "circular crop",
                details: "Circular crop area",
                params: &CROP_PARAMS,
            },
        }
    }
}

impl LensType {
    /// Short human-readable name and description of this projection.
    pub fn descriptor(self) -> (&'static str, &'static str) {
        match self {
            LensType::Unknown => ("Unknown", ""),
            LensType::Rectilinear => ("Rectilinear", "Straight lines remain straight"),
            LensType::Fisheye => ("Fish-Eye", "Equidistant fisheye projection"),
            LensType::Panoramic => ("Panoramic", "Cylindrical projection"),
            LensType::Equirectangular => ("Equirectangular", "Equirectangular projection"),
            LensType::FisheyeOrthographic => ("Fisheye, orthographic", "Orthographic fisheye"),
            LensType::FisheyeStereographic => {
                ("Fisheye, stereographic", "Stereographic fisheye")
            }
            LensType::FisheyeEquisolid => ("Fisheye, equisolid", "Equisolid fisheye"),
            LensType::FisheyeThoby => ("Thoby-Fisheye", "Fisheye as measured by Thoby"),
        }
    }
}

/// Lens data. Unknown fields are 0 or empty.
///
/// To create a lens record manually, fill the fields you have data for and
/// call [`Lens::check`], which validates the record and fills derivable
/// fields from the model name and the calibration lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lens {
    /// Lens maker.
    pub maker: MlStr,
    /// Lens model.
    pub model: MlStr,
    /// Minimum focal length in mm.
    pub min_focal: f32,
    /// Maximum focal length in mm. Equal to `min_focal` for primes.
    pub max_focal: f32,
    /// Smallest possible f-number.
    pub min_aperture: f32,
    /// Biggest possible f-number.
    pub max_aperture: f32,
    /// Compatible mount identifiers.
    pub mounts: Vec<String>,
    /// Horizontal shift of the optical centre, relative with 1.0 equal to
    /// the longer image dimension; valid range -0.5 ..= 0.5. Distortion and
    /// TCA share this centre.
    pub center_x: f32,
    /// Vertical shift of the optical centre; (0, 0) is the geometric centre.
    pub center_y: f32,
    /// Crop factor of the camera the calibration was measured on.
    pub crop_factor: f32,
    /// Aspect ratio (long side over short side, >= 1) of the calibration
    /// images.
    pub aspect_ratio: f32,
    /// Projection type of the lens.
    pub kind: LensType,
    /// Distortion calibration samples, unsorted.
    pub calib_distortion: Vec<DistortionCalib>,
    /// TCA calibration samples, unsorted.
    pub calib_tca: Vec<TcaCalib>,
    /// Vignetting calibration samples, unsorted.
    pub calib_vignetting: Vec<VignettingCalib>,
    /// Crop samples, unsorted.
    pub calib_crop: Vec<CropCalib>,
    /// Field-of-view samples, unsorted (deprecated database entry).
    pub calib_fov: Vec<FovCalib>,
    /// Matching score used while searching; transient, never persisted.
    #[serde(skip)]
    pub score: i32,
}

// Lens-name patterns for focal range and aperture guessing. Group indices
// follow each pattern's comment: (min focal, max focal, min aperture).
static NAME_PATTERNS: Lazy<[(Regex, [usize; 3]); 3]> = Lazy::new(|| {
    [
        // "[min]-[max]mm f/[min]-[max]", e.g. "smc PENTAX-F 35-105mm F4-5.6"
        (
            Regex::new(r"(?i)(\s+|^)([0-9]+[0-9.]*)(-[0-9]+[0-9.]*)?(mm)?\s+(f/|f|1/|1:)?([0-9.]+)(-[0-9.]+)?")
                .unwrap(),
            [2, 3, 6],
        ),
        // "1:[min]-[max] [min]-[max]mm", e.g. "Zoom-Rolleinar 1:3.5 35-105mm"
        (
            Regex::new(r"(?i)\s+1:([0-9.]+)(-[0-9.]+)?\s+([0-9.]+)(-[0-9.]+)?(mm)?").unwrap(),
            [3, 4, 1],
        ),
        // "[min]-[max]/[min]-[max]", e.g. "MD 2.8/90"
        (
            Regex::new(r"(?i)([0-9.]+)(-[0-9.]+)?\s*/\s*([0-9.]+)(-[0-9.]+)?").unwrap(),
            [3, 4, 1],
        ),
    ]
});

// Tele-extender names like "2x" or "1.4x" carry magnifications, not focal
// lengths; their numbers are not focal lengths.
static EXTENDER_MAGNIFICATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[0-9](\.[0-9]+)?x").unwrap());

fn parse_range_float(text: &str) -> f32 {
    // A leading '-' is the range separator, not a sign.
    text.trim_start_matches('-').parse().unwrap_or(0.0)
}

/// Extract (min focal, max focal, min aperture) from a lens model name.
fn parse_lens_name(model: &str) -> Option<(Option<f32>, Option<f32>, Option<f32>)> {
    for (re, idx) in NAME_PATTERNS.iter() {
        if let Some(caps) = re.captures(model) {
            let field = |i: usize| caps.get(i).map(|m| parse_range_float(m.as_str()));
            return Some((field(idx[0]), field(idx[1]), field(idx[2])));
        }
    }
    None
}

impl Lens {
    /// Create an empty lens record.
    ///
    /// Attribute defaults are "unknown" (zero), so that ad hoc instances
    /// used for searches can be matched against database lenses; defaults
    /// for database tags are the loader's business.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lens maker. `lang = None` replaces the default value.
    pub fn set_maker(&mut self, value: &str, lang: Option<&str>) {
        self.maker.set(lang, value);
    }

    /// Set the lens model. `lang = None` replaces the default value.
    pub fn set_model(&mut self, value: &str, lang: Option<&str>) {
        self.model.set(lang, value);
    }

    /// Add a mount identifier.
    pub fn add_mount(&mut self, mount: &str) {
        self.mounts.push(mount.to_owned());
    }

    /// Add a distortion sample, replacing an entry with the same focal.
    pub fn add_calib_distortion(&mut self, calib: &DistortionCalib) {
        match self.calib_distortion.iter_mut().find(|c| c.focal == calib.focal) {
            Some(slot) => *slot = *calib,
            None => self.calib_distortion.push(*calib),
        }
    }

    /// Remove the distortion sample at `idx`. `false` if out of range.
    pub fn remove_calib_distortion(&mut self, idx: usize) -> bool {
        if idx < self.calib_distortion.len() {
            self.calib_distortion.remove(idx);
            true
        } else {
            false
        }
    }

    /// Add a TCA sample, replacing an entry with the same focal.
    pub fn add_calib_tca(&mut self, calib: &TcaCalib) {
        match self.calib_tca.iter_mut().find(|c| c.focal == calib.focal) {
            Some(slot) => *slot = *calib,
            None => self.calib_tca.push(*calib),
        }
    }

    /// Remove the TCA sample at `idx`. `false` if out of range.
    pub fn remove_calib_tca(&mut self, idx: usize) -> bool {
        if idx < self.calib_tca.len() {
            self.calib_tca.remove(idx);
            true
        } else {
            false
        }
    }

    /// Add a vignetting sample, replacing an entry with the same
    /// (focal, aperture, distance) triple.
    pub fn add_calib_vignetting(&mut self, calib: &VignettingCalib) {
        let same_key = |c: &&mut VignettingCalib| {
            c.focal == calib.focal && c.aperture == calib.aperture && c.distance == calib.distance
        };
        match self.calib_vignetting.iter_mut().find(same_key) {
            Some(slot) => *slot = *calib,
            None => self.calib_vignetting.push(*calib),
        }
    }

    /// Remove the vignetting sample at `idx`. `false` if out of range.
    pub fn remove_calib_vignetting(&mut self, idx: usize) -> bool {
        if idx < self.calib_vignetting.len() {
            self.calib_vignetting.remove(idx);
            true
        } else {
            false
        }
    }

    /// Add a crop sample, replacing an entry with the same focal.
    pub fn add_calib_crop(&mut self, calib: &CropCalib) {
        match self.calib_crop.iter_mut().find(|c| c.focal == calib.focal) {
            Some(slot) => *slot = *calib,
            None => self.calib_crop.push(*calib),
        }
    }

    /// Remove the crop sample at `idx`. `false` if out of range.
    pub fn remove_calib_crop(&mut self, idx: usize) -> bool {
        if idx < self.calib_crop.len() {
            self.calib_crop.remove(idx);
            true
        } else {
            false
        }
    }

    /// Add a field-of-view sample, replacing an entry with the same focal.
    pub fn add_calib_fov(&mut self, calib: &FovCalib) {
        match self.calib_fov.iter_mut().find(|c| c.focal == calib.focal) {
            Some(slot) => *slot = *calib,
            None => self.calib_fov.push(*calib),
        }
    }

    /// Remove the field-of-view sample at `idx`. `false` if out of range.
    pub fn remove_calib_fov(&mut self, idx: usize) -> bool {
        if idx < self.calib_fov.len() {
            self.calib_fov.remove(idx);
            true
        } else {
            false
        }
    }

    /// Fill missing focal-length and aperture ranges from the model name
    /// and the calibration lists.
    ///
    /// Only unset (zero) fields are assigned, so repeated calls are no-ops
    /// after the first.
    pub fn guess_parameters(&mut self) {
        let mut min_f: Option<f32> = None;
        let mut max_f: Option<f32> = None;
        let mut min_a: Option<f32> = None;
        let mut max_a: Option<f32> = None;

        let fold_min = |slot: &mut Option<f32>, v: f32| {
            *slot = Some(slot.map_or(v, |cur: f32| cur.min(v)));
        };

        if self.min_aperture == 0.0 || self.min_focal == 0.0 {
            if let Some(model) = self.model.default_value() {
                let blocked = ["adapter", "reducer", "booster", "extender", "converter"]
                    .iter()
                    .any(|w| model.contains(w))
                    || EXTENDER_MAGNIFICATION.is_match(model);
                if !blocked {
                    if let Some((f_lo, f_hi, a_lo)) = parse_lens_name(model) {
                        if let Some(v) = f_lo {
                            fold_min(&mut min_f, v);
                        }
                        if let Some(v) = f_hi {
                            max_f = Some(max_f.map_or(v, |cur| cur.max(v)));
                        }
                        if let Some(v) = a_lo {
                            fold_min(&mut min_a, v);
                        }
                    }
                }
            }

            // Widen the ranges with every calibration sample.
            let mut fold_focal = |v: f32| {
                min_f = Some(min_f.map_or(v, |cur| cur.min(v)));
                max_f = Some(max_f.map_or(v, |cur| cur.max(v)));
            };
            for c in &self.calib_distortion {
                fold_focal(c.focal);
            }
            for c in &self.calib_tca {
                fold_focal(c.focal);
            }
            for c in &self.calib_vignetting {
                fold_focal(c.focal);
                min_a = Some(min_a.map_or(c.aperture, |cur| cur.min(c.aperture)));
                max_a = Some(max_a.map_or(c.aperture, |cur| cur.max(c.aperture)));
            }
            for c in &self.calib_crop {
                fold_focal(c.focal);
            }
            for c in &self.calib_fov {
                fold_focal(c.focal);
            }
        }

        if self.min_focal == 0.0 {
            self.min_focal = min_f.unwrap_or(0.0);
        }
        if self.max_focal == 0.0 {
            self.max_focal = max_f.unwrap_or(0.0);
        }
        if self.min_aperture == 0.0 {
            self.min_aperture = min_a.unwrap_or(0.0);
        }
        if self.max_aperture == 0.0 {
            self.max_aperture = max_a.unwrap_or(0.0);
        }
        if self.max_focal == 0.0 {
            self.max_focal = self.min_focal;
        }
    }

    /// Validate the record, deriving missing fields first.
    ///
    /// `true` when the model and mounts are present, the crop factor is
    /// positive, the focal and aperture ranges are ordered and the aspect
    /// ratio is at least 1.
    pub fn check(&mut self) -> bool {
        self.guess_parameters();

        !self.model.is_empty()
            && !self.mounts.is_empty()
            && self.crop_factor > 0.0
            && self.min_focal <= self.max_focal
            && (self.max_aperture == 0.0 || self.min_aperture <= self.max_aperture)
            && self.aspect_ratio >= 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_lens(model: &str) -> Lens {
        let mut lens = Lens::new();
        lens.set_model(model, None);
        lens
    }

    #[test]
    fn test_parse_zoom_with_aperture_range() {
        let mut lens = named_lens("smc PENTAX-F 35-105mm F4-5.6");
        lens.guess_parameters();
        assert_eq!(lens.min_focal, 35.0);
        assert_eq!(lens.max_focal, 105.0);
        assert_eq!(lens.min_aperture, 4.0);
    }

    #[test]
    fn test_parse_prime_slash_style() {
        let mut lens = named_lens("Minolta MD 2.8/90");
        lens.guess_parameters();
        assert_eq!(lens.min_focal, 90.0);
        assert_eq!(lens.max_focal, 90.0);
        assert_eq!(lens.min_aperture, 2.8);
    }

    #[test]
    fn test_parse_ratio_style() {
        let mut lens = named_lens("Zoom-Rolleinar 1:3.5 35-105mm");
        lens.guess_parameters();
        assert_eq!(lens.min_focal, 35.0);
        assert_eq!(lens.max_focal, 105.0);
        assert_eq!(lens.min_aperture, 3.5);
    }

    #[test]
    fn test_extender_names_not_parsed() {
        let mut lens = named_lens("Kenko C-AF 2x Teleplus MC7");
        lens.guess_parameters();
        assert_eq!(lens.min_focal, 0.0, "extender magnification is not a focal");
        assert_eq!(lens.min_aperture, 0.0);
    }

    #[test]
    fn test_guess_from_calibrations() {
        let mut lens = Lens::new();
        for (focal, aperture) in [(24.0, 2.8), (50.0, 4.0)] {
            lens.add_calib_vignetting(&VignettingCalib {
                model: VignettingModel::Pa,
                focal,
                aperture,
                distance: 1.0,
                terms: [0.0; 3],
            });
        }
        lens.guess_parameters();
        assert_eq!(lens.min_focal, 24.0);
        assert_eq!(lens.max_focal, 50.0);
        assert_eq!(lens.min_aperture, 2.8);
        assert_eq!(lens.max_aperture, 4.0);
    }

    #[test]
    fn test_guess_parameters_idempotent() {
        let mut lens = named_lens("Tamron SP AF 17-50mm F/2.8 XR Di II");
        lens.add_calib_distortion(&DistortionCalib {
            model: DistortionModel::Poly3,
            focal: 17.0,
            real_focal: 17.0,
            real_focal_measured: false,
            terms: [0.01, 0.0, 0.0, 0.0, 0.0],
        });
        lens.guess_parameters();
        let once = lens.clone();
        lens.guess_parameters();
        assert_eq!(lens, once);
    }

    #[test]
    fn test_add_replaces_same_key() {
        let mut lens = Lens::new();
        let mut calib = DistortionCalib {
            model: DistortionModel::Poly3,
            focal: 35.0,
            real_focal: 35.0,
            real_focal_measured: false,
            terms: [0.01, 0.0, 0.0, 0.0, 0.0],
        };
        lens.add_calib_distortion(&calib);
        calib.terms[0] = 0.02;
        lens.add_calib_distortion(&calib);
        assert_eq!(lens.calib_distortion.len(), 1);
        assert_eq!(lens.calib_distortion[0].terms[0], 0.02);

        // Vignetting keys on the full triple: a different aperture is a new
        // entry, the same triple replaces.
        let vig = VignettingCalib {
            model: VignettingModel::Pa,
            focal: 35.0,
            aperture: 2.8,
            distance: 1.0,
            terms: [-0.3, 0.0, 0.0],
        };
        lens.add_calib_vignetting(&vig);
        lens.add_calib_vignetting(&VignettingCalib {
            aperture: 5.6,
            ..vig
        });
        lens.add_calib_vignetting(&VignettingCalib {
            terms: [-0.5, 0.0, 0.0],
            ..vig
        });
        assert_eq!(lens.calib_vignetting.len(), 2);
        assert_eq!(lens.calib_vignetting[0].terms[0], -0.5);
    }

    #[test]
    fn test_remove_out_of_range() {
        let mut lens = Lens::new();
        assert!(!lens.remove_calib_distortion(0));
        lens.add_calib_distortion(&DistortionCalib {
            model: DistortionModel::Poly3,
            focal: 35.0,
            real_focal: 35.0,
            real_focal_measured: false,
            terms: [0.0; 5],
        });
        assert!(lens.remove_calib_distortion(0));
        assert!(lens.calib_distortion.is_empty());
    }

    #[test]
    fn test_check() {
        let mut lens = named_lens("Test 50mm f/1.4");
        assert!(!lens.check(), "missing mount and crop factor");
        lens.add_mount("M42");
        lens.crop_factor = 1.0;
        lens.aspect_ratio = 1.5;
        assert!(lens.check());

        lens.min_focal = 100.0;
        lens.max_focal = 50.0;
        assert!(!lens.check(), "inverted focal range");
    }

    #[test]
    fn test_lens_type_discriminants_stable() {
        assert_eq!(LensType::Unknown as u32, 0);
        assert_eq!(LensType::Rectilinear as u32, 1);
        assert_eq!(LensType::Fisheye as u32, 2);
        assert_eq!(LensType::Panoramic as u32, 3);
        assert_eq!(LensType::Equirectangular as u32, 4);
        assert_eq!(LensType::FisheyeOrthographic as u32, 5);
        assert_eq!(LensType::FisheyeStereographic as u32, 6);
        assert_eq!(LensType::FisheyeEquisolid as u32, 7);
        assert_eq!(LensType::FisheyeThoby as u32, 8);
    }

    #[test]
    fn test_descriptors() {
        let desc = DistortionModel::PtLens.descriptor();
        assert_eq!(desc.name, "PanoTools lens model");
        assert_eq!(desc.params.len(), 3);
        assert_eq!(desc.params[0].name, "a");

        let desc = TcaModel::Linear.descriptor();
        assert_eq!(desc.params[0].default, 1.0);

        assert!(VignettingModel::Pa.descriptor().params[0].min < 0.0);
        assert_eq!(CropMode::Circle.descriptor().params.len(), 4);
        assert_eq!(LensType::Rectilinear.descriptor().0, "Rectilinear");
    }
}
