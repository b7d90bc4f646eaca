//! Camera mount records.

use serde::{Deserialize, Serialize};

use crate::mlstr::MlStr;

/// Everything specific to a camera mount.
///
/// Mount records are usually produced by the database loader; they can also
/// be created ad hoc, in which case the caller owns them. Mount names for
/// fixed-lens cameras, and only they, start with a lower-case letter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount name.
    pub name: MlStr,
    /// Identifiers of compatible mounts.
    pub compat: Vec<String>,
}

impl Mount {
    /// Create an empty mount record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mount name. `lang = None` replaces the default value.
    pub fn set_name(&mut self, value: &str, lang: Option<&str>) {
        self.name.set(lang, value);
    }

    /// Add a mount identifier to the compatibility list.
    pub fn add_compat(&mut self, mount: &str) {
        self.compat.push(mount.to_owned());
    }

    /// `true` if the required fields are present.
    pub fn check(&self) -> bool {
        !self.name.is_empty()
    }
}
