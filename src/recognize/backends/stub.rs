use anyhow::Result;
use std::collections::VecDeque;

use crate::frame::{Frame, RegionOfInterest};
use crate::recognize::backend::PlateRecognizer;
use crate::recognize::result::{PlateDetection, RecognitionResult};

/// Scripted recognizer for tests and dry runs.
///
/// Each call pops the next scripted plate list; once the script runs out
/// every frame comes back with no plates.
pub struct StubRecognizer {
    script: VecDeque<Vec<PlateDetection>>,
    calls: u64,
}

impl StubRecognizer {
    pub const NAME: &'static str = "stub";

    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            calls: 0,
        }
    }

    pub fn with_script(script: Vec<Vec<PlateDetection>>) -> Self {
        Self {
            script: script.into(),
            calls: 0,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PlateRecognizer for StubRecognizer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn recognize(
        &mut self,
        frame: &Frame,
        regions: &[RegionOfInterest],
    ) -> Result<RecognitionResult> {
        self.calls += 1;
        let plates = self.script.pop_front().unwrap_or_default();
        let mut result = RecognitionResult::new(frame.width, frame.height).with_plates(plates);
        result.regions_of_interest = regions.to_vec();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognize::result::PlateCandidate;

    #[test]
    fn stub_replays_script_then_goes_empty() -> Result<()> {
        let frame = Frame::rgb(vec![0u8; 12], 2, 2)?;
        let regions = [frame.full_region()];
        let mut stub = StubRecognizer::with_script(vec![vec![PlateDetection::from_candidates(
            vec![PlateCandidate::new("XYZ999", 50.0, false)],
        )]]);

        let first = stub.recognize(&frame, &regions)?;
        assert_eq!(first.plates.len(), 1);
        assert_eq!(first.regions_of_interest, regions.to_vec());
        assert_eq!((first.img_width, first.img_height), (2, 2));

        let second = stub.recognize(&frame, &regions)?;
        assert!(second.plates.is_empty());
        assert_eq!(stub.calls(), 2);
        Ok(())
    }
}
