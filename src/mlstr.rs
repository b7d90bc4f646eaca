//! Multilingual strings.
//!
//! Entity names in the calibration database carry translations. The store is
//! an ordered map from language tag to translation plus a designated default
//! value; lookup falls back to `"en"` and then to the default.
//!
//! External XML tooling expects the historical packed wire layout: the
//! default value first, NUL-terminated, then (language, translation) pairs,
//! each NUL-terminated, with an empty string closing the list.
//! [`MlStr::to_packed`] and [`MlStr::from_packed`] round-trip that form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A string with optional per-language translations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlStr {
    default: Option<String>,
    translations: BTreeMap<String, String>,
}

impl MlStr {
    /// Create an empty multilingual string.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a multilingual string with only a default value.
    pub fn from_default(value: impl Into<String>) -> Self {
        Self {
            default: Some(value.into()),
            translations: BTreeMap::new(),
        }
    }

    /// `true` when neither a default value nor any translation is present.
    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.translations.is_empty()
    }

    /// Set a value. `lang = None` replaces the default value, otherwise the
    /// translation for that language is inserted or replaced.
    pub fn set(&mut self, lang: Option<&str>, value: impl Into<String>) {
        match lang {
            None => self.default = Some(value.into()),
            Some(lang) => {
                self.translations.insert(lang.to_owned(), value.into());
            }
        }
    }

    /// The default value, if any.
    pub fn default_value(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Look up the value for a language, falling back to the English
    /// translation and then to the default value.
    pub fn get(&self, lang: &str) -> Option<&str> {
        self.translations
            .get(lang)
            .or_else(|| self.translations.get("en"))
            .map(String::as_str)
            .or(self.default_value())
    }

    /// Encode into the packed NUL-separated wire layout.
    pub fn to_packed(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.default.as_deref().unwrap_or("").as_bytes());
        out.push(0);
        for (lang, value) in &self.translations {
            out.extend_from_slice(lang.as_bytes());
            out.push(0);
            out.extend_from_slice(value.as_bytes());
            out.push(0);
        }
        out.push(0);
        out
    }

    /// Decode the packed NUL-separated wire layout.
    ///
    /// The buffer must contain the default value followed by complete
    /// (language, translation) pairs and the closing empty segment.
    pub fn from_packed(data: &[u8]) -> Result<Self, Error> {
        let mut segments = Vec::new();
        let mut rest = data;
        loop {
            let end = rest.iter().position(|&b| b == 0).ok_or(Error::WrongFormat)?;
            let seg = std::str::from_utf8(&rest[..end]).map_err(|_| Error::WrongFormat)?;
            rest = &rest[end + 1..];
            if !segments.is_empty() && seg.is_empty() {
                break;
            }
            segments.push(seg.to_owned());
        }

        let mut iter = segments.into_iter();
        let default = iter.next().ok_or(Error::WrongFormat)?;
        let mut translations = BTreeMap::new();
        loop {
            let Some(lang) = iter.next() else { break };
            let value = iter.next().ok_or(Error::WrongFormat)?;
            translations.insert(lang, value);
        }

        Ok(Self {
            default: if default.is_empty() { None } else { Some(default) },
            translations,
        })
    }
}
