use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::RegionOfInterest;

const RESULT_VERSION: u32 = 2;
const RESULT_DATA_TYPE: &str = "alpr_results";

/// One reading of a plate, as ranked by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlateCandidate {
    #[serde(rename = "plate")]
    pub characters: String,
    #[serde(rename = "confidence")]
    pub overall_confidence: f32,
    /// The reading conforms to the country/region plate format.
    #[serde(default, with = "template_flag")]
    pub matches_template: bool,
}

impl PlateCandidate {
    pub fn new(characters: impl Into<String>, overall_confidence: f32, matches_template: bool) -> Self {
        Self {
            characters: characters.into(),
            overall_confidence,
            matches_template,
        }
    }
}

/// Plate corner in frame pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatePoint {
    pub x: i32,
    pub y: i32,
}

/// One physical plate found in the frame.
///
/// The `plate`/`confidence`/`matches_template` fields are the engine's own
/// headline reading; `candidates` holds the full best-first ranking.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlateDetection {
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default, with = "template_flag")]
    pub matches_template: bool,
    #[serde(default)]
    pub plate_index: u32,
    /// Region code such as "es"; empty when the engine did not classify one.
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub region_confidence: f32,
    #[serde(default)]
    pub processing_time_ms: f32,
    #[serde(default)]
    pub requested_topn: u32,
    #[serde(default)]
    pub coordinates: Vec<PlatePoint>,
    #[serde(default)]
    pub candidates: Vec<PlateCandidate>,
}

impl PlateDetection {
    /// Detection whose headline reading is the first candidate.
    pub fn from_candidates(candidates: Vec<PlateCandidate>) -> Self {
        let mut detection = Self {
            requested_topn: candidates.len() as u32,
            ..Self::default()
        };
        if let Some(top) = candidates.first() {
            detection.plate = top.characters.clone();
            detection.confidence = top.overall_confidence;
            detection.matches_template = top.matches_template;
        }
        detection.candidates = candidates;
        detection
    }

    pub fn with_region(mut self, region: impl Into<String>, confidence: f32) -> Self {
        self.region = region.into();
        self.region_confidence = confidence;
        self
    }

    pub fn region(&self) -> Option<&str> {
        if self.region.is_empty() {
            None
        } else {
            Some(&self.region)
        }
    }

    pub fn top_candidate(&self) -> Option<&PlateCandidate> {
        self.candidates.first()
    }
}

/// Everything the engine reported for one frame.
///
/// Serializes in the engine's JSON layout so it can be forwarded as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub data_type: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub epoch_time: u64,
    #[serde(default)]
    pub img_width: u32,
    #[serde(default)]
    pub img_height: u32,
    #[serde(default)]
    pub processing_time_ms: f32,
    #[serde(default)]
    pub regions_of_interest: Vec<RegionOfInterest>,
    #[serde(rename = "results", default)]
    pub plates: Vec<PlateDetection>,
}

impl RecognitionResult {
    pub fn new(img_width: u32, img_height: u32) -> Self {
        Self {
            img_width,
            img_height,
            epoch_time: epoch_millis(),
            ..Self::default()
        }
    }

    pub fn with_plates(mut self, plates: Vec<PlateDetection>) -> Self {
        self.plates = plates;
        self
    }

    /// Single-line JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Default for RecognitionResult {
    fn default() -> Self {
        Self {
            version: RESULT_VERSION,
            data_type: RESULT_DATA_TYPE.to_string(),
            epoch_time: 0,
            img_width: 0,
            img_height: 0,
            processing_time_ms: 0.0,
            regions_of_interest: Vec::new(),
            plates: Vec::new(),
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The engine encodes template matches as 0/1.
mod template_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Flag {
            Bool(bool),
            Int(i64),
        }
        Ok(match Flag::deserialize(deserializer)? {
            Flag::Bool(value) => value,
            Flag::Int(value) => value != 0,
        })
    }
}
