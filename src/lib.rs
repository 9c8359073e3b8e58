//! Plate relay
//!
//! Captures one frame from a USB or network camera when a TCP client sends
//! the trigger byte `Z`, hands it to an external licence plate recognition
//! engine, and answers with the best plate (or `NO_LEGIBLE`).
//!
//! # Module Structure
//!
//! - `session`, `protocol`: single-client TCP session and the trigger/reply wire format
//! - `ingest`, `frame`: camera sources (USB, network) and the captured frame
//! - `recognize`: the recognition engine seam and its backends
//! - `select`: picks the reported plate from a recognition result
//! - `relay`: the trigger → capture → recognize → reply loop
//! - `config`: layered daemon configuration

pub mod config;
pub mod frame;
pub mod ingest;
pub mod protocol;
pub mod recognize;
pub mod relay;
pub mod select;
pub mod session;

pub use config::{CameraSettings, CliOverrides, EngineSettings, OutputSettings, RelayConfig};
pub use frame::{Frame, RegionOfInterest};
pub use ingest::{open_source, Capture, CaptureMode, FrameSource, NetworkSource, UsbSource};
pub use protocol::{Command, Framing, MessageFramer, Reply, CAPTURE_FAILED, NO_LEGIBLE};
pub use recognize::{
    open_recognizer, PlateCandidate, PlateDetection, PlateRecognizer, RecognitionResult,
    StubRecognizer,
};
pub use relay::{CycleOutcome, CycleState, Relay, RelayStats};
pub use select::{build_reply, select_best_plate, Selection};
pub use session::{Session, ShutdownHandle};
