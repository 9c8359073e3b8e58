//! Licence plate recognition client.
//!
//! The recognition engine is external. This module only defines the seam
//! (`PlateRecognizer`), the result model the engine reports, and the
//! backends that talk to a concrete engine.

mod backend;
mod backends;
mod result;

use anyhow::{anyhow, Result};

use crate::config::EngineSettings;

pub use backend::PlateRecognizer;
pub use backends::{OpenAlprCli, OpenAlprConfig, StubRecognizer};
pub use result::{PlateCandidate, PlateDetection, PlatePoint, RecognitionResult};

/// Build the recognizer named by `settings.backend`.
///
/// The returned backend has not been warmed up yet.
pub fn open_recognizer(settings: &EngineSettings) -> Result<Box<dyn PlateRecognizer>> {
    match settings.backend.as_str() {
        OpenAlprCli::NAME => Ok(Box::new(OpenAlprCli::new(OpenAlprConfig {
            binary: settings.binary.clone(),
            country: settings.country.clone(),
            config_file: settings.config_path.clone(),
            top_n: settings.top_n,
            default_region: settings.default_region.clone(),
        }))),
        StubRecognizer::NAME => Ok(Box::new(StubRecognizer::new())),
        other => Err(anyhow!(
            "unknown recognition backend '{}' (expected '{}' or '{}')",
            other,
            OpenAlprCli::NAME,
            StubRecognizer::NAME
        )),
    }
}
