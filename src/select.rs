//! Picks the single plate string reported back to the client.
//!
//! Detections are walked in engine order and candidates best-first. The first
//! candidate anywhere that matches a plate template wins outright. Failing
//! that, the top candidate of the first detection that has any candidates is
//! used.

use anyhow::{Context, Result};

use crate::protocol::Reply;
use crate::recognize::{PlateCandidate, PlateDetection, RecognitionResult};

/// Outcome of plate selection for one recognition result.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Selection<'a> {
    /// A candidate conforming to a plate template.
    TemplateMatch {
        detection: &'a PlateDetection,
        candidate: &'a PlateCandidate,
    },
    /// No template match; the best reading of the first usable detection.
    TopCandidate {
        detection: &'a PlateDetection,
        candidate: &'a PlateCandidate,
    },
    NoLegible,
}

impl<'a> Selection<'a> {
    pub fn plate(&self) -> Option<&'a str> {
        match self {
            Self::TemplateMatch { candidate, .. } | Self::TopCandidate { candidate, .. } => {
                Some(candidate.characters.as_str())
            }
            Self::NoLegible => None,
        }
    }

    pub fn is_template_match(&self) -> bool {
        matches!(self, Self::TemplateMatch { .. })
    }

    pub fn to_reply(&self) -> Reply {
        match self.plate() {
            Some(plate) => Reply::Plate(plate.to_string()),
            None => Reply::NoLegible,
        }
    }
}

pub fn select_best_plate(result: &RecognitionResult) -> Selection<'_> {
    let template_match = result.plates.iter().find_map(|detection| {
        detection
            .candidates
            .iter()
            .find(|candidate| candidate.matches_template)
            .map(|candidate| Selection::TemplateMatch {
                detection,
                candidate,
            })
    });
    if let Some(selection) = template_match {
        return selection;
    }

    result
        .plates
        .iter()
        .find_map(|detection| {
            detection
                .top_candidate()
                .map(|candidate| Selection::TopCandidate {
                    detection,
                    candidate,
                })
        })
        .unwrap_or(Selection::NoLegible)
}

/// Reply for a recognition result: the selected plate, or the whole result as
/// one JSON line.
pub fn build_reply(result: &RecognitionResult, json: bool) -> Result<Reply> {
    if json {
        let encoded = result.to_json().context("encode recognition result")?;
        return Ok(Reply::Json(encoded));
    }
    Ok(select_best_plate(result).to_reply())
}
