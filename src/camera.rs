//! Camera records.

use serde::{Deserialize, Serialize};

use crate::mlstr::MlStr;

/// Camera data.
///
/// Maker and model must match the EXIF values exactly (case-insensitively),
/// since EXIF is the only way to detect the camera automatically. Some
/// cameras share one EXIF id between different models; the `variant` field
/// then carries the exact model name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// Camera maker, as in EXIF.
    pub maker: MlStr,
    /// Model name, as in EXIF.
    pub model: MlStr,
    /// Camera variant for models sharing an EXIF id.
    pub variant: MlStr,
    /// Mount identifier.
    pub mount: Option<String>,
    /// Crop factor. Must be strictly positive to be valid.
    pub crop_factor: f32,
    /// Matching score used while searching; transient, never persisted.
    #[serde(skip)]
    pub score: i32,
}

impl Camera {
    /// Create an empty camera record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the camera maker. `lang = None` replaces the default value.
    pub fn set_maker(&mut self, value: &str, lang: Option<&str>) {
        self.maker.set(lang, value);
    }

    /// Set the camera model. `lang = None` replaces the default value.
    pub fn set_model(&mut self, value: &str, lang: Option<&str>) {
        self.model.set(lang, value);
    }

    /// Set the camera variant. `lang = None` replaces the default value.
    pub fn set_variant(&mut self, value: &str, lang: Option<&str>) {
        self.variant.set(lang, value);
    }

    /// Set the mount identifier.
    pub fn set_mount(&mut self, value: &str) {
        self.mount = Some(value.to_owned());
    }

    /// `true` if the required fields are present and consistent.
    pub fn check(&self) -> bool {
        !self.maker.is_empty()
            && !self.model.is_empty()
            && self.mount.is_some()
            && self.crop_factor > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check() {
        let mut cam = Camera::new();
        assert!(!cam.check());
        cam.set_maker("Rollei", None);
        cam.set_model("Rolleiflex SL35", None);
        cam.set_mount("QBM");
        assert!(!cam.check(), "zero crop factor must be rejected");
        cam.crop_factor = 1.0;
        assert!(cam.check());
    }
}
