//! Size class and engine version resolution

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Named size classes for one backend plus a designated default
#[derive(Clone, Debug, PartialEq)]
pub struct SizeCatalog<T> {
    classes: BTreeMap<String, T>,
    default_class: String,
}

/// Outcome of resolving a size request
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution<T> {
    /// Class actually used
    pub class: String,
    pub params: T,
    /// One entry per fallback taken
    pub warnings: Vec<String>,
}

impl<T: Clone> SizeCatalog<T> {
    /// Build a catalog.
    ///
    /// When the default class is missing from `classes`, `builtin` is
    /// registered under that name; without one the catalog is rejected.
    pub fn new(
        mut classes: BTreeMap<String, T>,
        default_class: impl Into<String>,
        builtin: Option<T>,
    ) -> Result<Self> {
        let default_class = default_class.into();
        if !classes.contains_key(&default_class) {
            match builtin {
                Some(params) => {
                    classes.insert(default_class.clone(), params);
                }
                None => {
                    return Err(Error::config(format!(
                        "Default size class '{}' is not defined",
                        default_class
                    )))
                }
            }
        }
        Ok(Self {
            classes,
            default_class,
        })
    }

    pub fn default_class(&self) -> &str {
        &self.default_class
    }

    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// Resolve a requested class, falling back to the default with a warning
    pub fn resolve(&self, requested: Option<&str>) -> Resolution<T> {
        let (class, warning) = match requested {
            Some(class) if self.classes.contains_key(class) => (class.to_string(), None),
            Some(class) => (
                self.default_class.clone(),
                Some(format!(
                    "Size class '{}' is not available, falling back to default class '{}'",
                    class, self.default_class
                )),
            ),
            None => (
                self.default_class.clone(),
                Some(format!(
                    "No size class specified, falling back to default class '{}'",
                    self.default_class
                )),
            ),
        };

        // The default class is always present, see `new`
        let params = self.classes[&class].clone();
        Resolution {
            class,
            params,
            warnings: warning.into_iter().collect(),
        }
    }
}

/// Engine version pins for one backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionPolicy {
    pub default: &'static str,
    /// Bare major version to pinned version
    pub pinned: &'static [(&'static str, &'static str)],
}

impl VersionPolicy {
    /// Resolve a requested engine version.
    ///
    /// `major.minor` passes through unchanged, a pinned bare major expands
    /// to its pin, anything else yields the default.
    pub fn resolve(&self, requested: Option<&str>) -> String {
        let Some(requested) = requested.map(str::trim) else {
            return self.default.to_string();
        };

        if let Some((major, minor)) = requested.split_once('.') {
            if is_number(major) && is_number(minor) {
                return requested.to_string();
            }
        }

        self.pinned
            .iter()
            .find(|(major, _)| *major == requested)
            .map(|(_, pinned)| pinned.to_string())
            .unwrap_or_else(|| self.default.to_string())
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parse a Kubernetes CPU quantity (`2`, `1.5`, `500m`) into cores
pub fn parse_cpu(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    match quantity.strip_suffix('m') {
        Some(millis) => millis.parse::<f64>().ok().map(|m| m / 1000.0),
        None => quantity.parse::<f64>().ok(),
    }
}
