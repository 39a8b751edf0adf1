//! Plugins shipped with the host binary.

pub mod chime;

pub use chime::Chime;

use crate::plugin::PluginManifest;

/// Manifest of the bundled plugins.
#[must_use]
pub fn manifest() -> PluginManifest {
    PluginManifest::new().with(Chime::new())
}
