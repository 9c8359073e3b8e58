use anyhow::Result;

use crate::frame::{Frame, RegionOfInterest};
use crate::recognize::result::RecognitionResult;

/// Recognition engine seam.
///
/// Implementations receive the frame and the regions to search, and return
/// every plate they found with candidates ranked best-first. An empty result
/// is a normal outcome, not an error.
pub trait PlateRecognizer: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run recognition on `frame`, restricted to `regions`.
    fn recognize(&mut self, frame: &Frame, regions: &[RegionOfInterest])
        -> Result<RecognitionResult>;

    /// Check that the engine is installed and configured.
    ///
    /// Called once at startup; an error here is fatal.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
