//! lenscorrect: correction of optical aberrations in photographs taken with
//! known lenses.
//!
//! Given a lens described by sampled calibration data, shooting parameters
//! (focal length, aperture, focus distance) and the target image geometry,
//! the library produces the per-pixel coordinate and color transforms needed
//! to remove (or synthesize) distortion, transversal chromatic aberration,
//! vignetting, projection-geometry changes, perspective and rescaling.
//!
//! The crate is the numerical engine only. Database loading, catalog search
//! and pixel resampling live in the host application; their contract with
//! this crate is the data model in [`Lens`], [`Camera`] and [`Mount`] and
//! the coordinate buffers filled by [`Modifier`].
//!
//! # Pipeline
//!
//! ```text
//! loader -> Lens (calibration lists)
//!        -> interpolation at (focal, aperture, distance)
//!        -> Modifier::initialize (kernels pushed onto priority chains)
//!        -> per block: color chain in place,
//!                      coord chain  (x, y) per output pixel,
//!                      subpixel chain (xR, yR, xG, yG, xB, yB)
//! ```
//!
//! All block-apply methods take `&self` and touch only caller-owned buffers,
//! so a single initialized modifier can be shared across worker threads that
//! process disjoint tiles.

pub mod camera;
pub mod interp;
pub mod kernels;
pub mod lens;
pub mod mlstr;
pub mod modifier;
pub mod mount;
pub mod pixels;

mod autoscale;

pub use camera::Camera;
pub use lens::{
    CropCalib, CropMode, DistortionCalib, DistortionModel, FovCalib, Lens, LensType, ModelDesc,
    ModelParam, TcaCalib, TcaModel, VignettingCalib, VignettingModel,
};
pub use mlstr::MlStr;
pub use modifier::{Modifier, ModifyFlags};
pub use mount::Mount;
pub use pixels::{ComponentRole, PixelData, PixelFormat, RoleWord};

/// Library error codes shared with external tooling.
///
/// Only the loader-facing surface produces these; validation and
/// interpolation report plain `bool`/`Option` results instead. The numeric
/// codes are stable: negative values are reserved for `-errno` by the wire
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed wire data (e.g. a packed multilingual string that does not
    /// follow the NUL-separated layout).
    #[error("wrong data format")]
    WrongFormat,
    /// No calibration database could be loaded.
    #[error("no database could be loaded")]
    NoDatabase,
}

impl Error {
    /// Stable numeric code of this error on the wire.
    pub fn code(self) -> i32 {
        match self {
            Error::WrongFormat => 1,
            Error::NoDatabase => 2,
        }
    }
}
