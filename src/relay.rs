//! Trigger → capture → recognize → reply control loop.

use anyhow::Result;
use std::time::Instant;

use crate::config::OutputSettings;
use crate::ingest::{Capture, FrameSource};
use crate::protocol::{preview, Command, Reply};
use crate::recognize::{PlateRecognizer, RecognitionResult};
use crate::select::{build_reply, select_best_plate};
use crate::session::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleState {
    WaitingForTrigger,
    Capturing,
    Recognizing,
    Replying,
}

/// How one cycle ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A reply was produced; `delivered` is false if the client vanished
    /// before it could be written.
    Replied { reply: Reply, delivered: bool },
    CaptureFailed,
    RecognitionFailed,
    /// The session stopped while waiting for a trigger.
    Shutdown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub triggers: u64,
    pub ignored_messages: u64,
    pub capture_failures: u64,
    pub recognition_failures: u64,
    pub replies_sent: u64,
    pub template_matches: u64,
    pub no_legible: u64,
}

pub struct Relay {
    source: Box<dyn FrameSource>,
    recognizer: Box<dyn PlateRecognizer>,
    output: OutputSettings,
    state: CycleState,
    stats: RelayStats,
}

impl Relay {
    /// `source` must already be connected and `recognizer` warmed up.
    pub fn new(
        source: Box<dyn FrameSource>,
        recognizer: Box<dyn PlateRecognizer>,
        output: OutputSettings,
    ) -> Self {
        Self {
            source,
            recognizer,
            output,
            state: CycleState::WaitingForTrigger,
            stats: RelayStats::default(),
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Serve cycles until the session shuts down, then release the source.
    pub fn run(&mut self, session: &mut Session) -> Result<RelayStats> {
        log::info!(
            "relay running: source {} ({:?}), recognizer {}, {} replies",
            self.source.name(),
            self.source.mode(),
            self.recognizer.name(),
            if self.output.json { "json" } else { "plate" }
        );
        let outcome = loop {
            match self.run_cycle(session) {
                Ok(CycleOutcome::Shutdown) => break Ok(()),
                Ok(_) => {}
                Err(err) => break Err(err),
            }
        };
        self.source.disconnect();
        log::info!("relay stopped: {:?}", self.stats);
        outcome.map(|()| self.stats.clone())
    }

    /// Run one full cycle, starting from waiting for a trigger.
    pub fn run_cycle(&mut self, session: &mut Session) -> Result<CycleOutcome> {
        self.enter(CycleState::WaitingForTrigger);
        loop {
            let Some(message) = session.receive()? else {
                return Ok(CycleOutcome::Shutdown);
            };
            match Command::parse(&message) {
                Command::TakePicture => break,
                Command::Ignored => {
                    self.stats.ignored_messages += 1;
                    log::debug!("ignoring message {:?}", preview(&message));
                }
            }
        }
        self.stats.triggers += 1;

        self.enter(CycleState::Capturing);
        if !self.source.is_healthy() {
            log::warn!("source {} reports unhealthy", self.source.name());
        }
        let capture = match self.source.capture() {
            Ok(capture) => capture,
            Err(err) => {
                self.stats.capture_failures += 1;
                log::warn!("capture from {} failed: {:#}", self.source.name(), err);
                return Ok(self.abandon(session, CycleOutcome::CaptureFailed));
            }
        };

        self.enter(CycleState::Recognizing);
        let result = match self.recognize(&capture) {
            Ok(result) => result,
            Err(err) => {
                self.stats.recognition_failures += 1;
                log::warn!("recognition failed: {:#}", err);
                return Ok(self.abandon(session, CycleOutcome::RecognitionFailed));
            }
        };

        self.enter(CycleState::Replying);
        let selection = select_best_plate(&result);
        match selection.plate() {
            Some(plate) if selection.is_template_match() => {
                self.stats.template_matches += 1;
                log::info!("selected {} (template match)", plate);
            }
            Some(plate) => log::info!("selected {} (top candidate)", plate),
            None => {
                self.stats.no_legible += 1;
                log::info!("no legible plate");
            }
        }
        let reply = build_reply(&result, self.output.json)?;
        let delivered = session.send(&reply);
        if delivered {
            self.stats.replies_sent += 1;
        }
        self.enter(CycleState::WaitingForTrigger);
        Ok(CycleOutcome::Replied { reply, delivered })
    }

    fn recognize(&mut self, capture: &Capture) -> Result<RecognitionResult> {
        let frame = &capture.frame;
        if let Some(path) = &self.output.snapshot_path {
            if let Err(err) = frame.save_snapshot(path) {
                log::warn!("snapshot {} not written: {:#}", path.display(), err);
            }
        }
        if !capture.motion_regions.is_empty() {
            log::debug!("motion regions: {:?}", capture.motion_regions);
        }

        log::debug!("recognizing frame captured {:?} ago", frame.age());

        let regions = [frame.full_region()];
        let started = Instant::now();
        let mut result = self.recognizer.recognize(frame, &regions)?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        // Backends that do not time themselves get the round trip.
        if result.processing_time_ms <= 0.0 {
            result.processing_time_ms = elapsed_ms as f32;
        }
        log::info!(
            "recognized {}x{} frame in {:.1} ms ({} plates)",
            frame.width,
            frame.height,
            elapsed_ms,
            result.plates.len()
        );
        log_candidates(&result);
        Ok(result)
    }

    fn abandon(&mut self, session: &mut Session, outcome: CycleOutcome) -> CycleOutcome {
        if self.output.reply_on_capture_failure && session.send(&Reply::CaptureFailed) {
            self.stats.replies_sent += 1;
        }
        self.enter(CycleState::WaitingForTrigger);
        outcome
    }

    fn enter(&mut self, state: CycleState) {
        if self.state != state {
            log::debug!("cycle: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

fn log_candidates(result: &RecognitionResult) {
    for (index, plate) in result.plates.iter().enumerate() {
        log::info!(
            "plate{}: {} results{}",
            index,
            plate.candidates.len(),
            plate
                .region()
                .map(|region| format!(" (region {} {:.1}%)", region, plate.region_confidence))
                .unwrap_or_default()
        );
        for candidate in &plate.candidates {
            log::info!(
                "    - {}\t confidence: {:.2}\t pattern_match: {}",
                candidate.characters,
                candidate.overall_confidence,
                u8::from(candidate.matches_template)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, RegionOfInterest};
    use crate::ingest::CaptureMode;
    use crate::protocol::Framing;
    use crate::recognize::{PlateCandidate, PlateDetection, StubRecognizer};
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{Ipv4Addr, SocketAddr, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Source that fails the captures scripted as `false`.
    struct ScriptedSource {
        outcomes: VecDeque<bool>,
        disconnected: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(outcomes: &[bool]) -> Self {
            Self {
                outcomes: outcomes.iter().copied().collect(),
                disconnected: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn mode(&self) -> CaptureMode {
            CaptureMode::Usb
        }

        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn capture(&mut self) -> Result<Capture> {
            if self.outcomes.pop_front().unwrap_or(true) {
                Ok(Capture::new(Frame::rgb(vec![128u8; 8 * 8 * 3], 8, 8)?))
            } else {
                Err(anyhow!("no frame available"))
            }
        }

        fn disconnect(&mut self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    struct BrokenRecognizer;

    impl PlateRecognizer for BrokenRecognizer {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn recognize(&mut self, _: &Frame, _: &[RegionOfInterest]) -> Result<RecognitionResult> {
            Err(anyhow!("engine crashed"))
        }
    }

    /// Sleeps for `delay`, then reports `reported_ms` as its own timing.
    struct TimedRecognizer {
        delay: Duration,
        reported_ms: f32,
    }

    impl PlateRecognizer for TimedRecognizer {
        fn name(&self) -> &'static str {
            "timed"
        }

        fn recognize(&mut self, frame: &Frame, _: &[RegionOfInterest]) -> Result<RecognitionResult> {
            thread::sleep(self.delay);
            let mut result = RecognitionResult::new(frame.width, frame.height);
            result.processing_time_ms = self.reported_ms;
            Ok(result)
        }
    }

    fn plate(candidates: &[(&str, f32, bool)]) -> PlateDetection {
        PlateDetection::from_candidates(
            candidates
                .iter()
                .map(|(text, confidence, template)| PlateCandidate::new(*text, *confidence, *template))
                .collect(),
        )
    }

    /// Output settings that keep snapshots out of the working directory.
    fn quiet_output() -> OutputSettings {
        OutputSettings {
            snapshot_path: None,
            ..OutputSettings::default()
        }
    }

    fn session() -> Session {
        Session::bind_to(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), Framing::Line).unwrap()
    }

    /// Connects, sends `input`, and reads `replies` lines back.
    fn client(addr: SocketAddr, input: &'static [u8], replies: usize) -> thread::JoinHandle<Vec<String>> {
        thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(input).unwrap();
            let mut reader = BufReader::new(stream);
            (0..replies)
                .map(|_| {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    line
                })
                .collect()
        })
    }

    #[test]
    fn non_trigger_messages_are_ignored() -> Result<()> {
        let mut session = session();
        let peer = client(session.local_addr(), b"hello\nz\nZ\n", 1);
        let recognizer =
            StubRecognizer::with_script(vec![vec![plate(&[("ABC123", 91.0, false), ("ABC128", 77.0, true)])]]);
        let mut relay = Relay::new(
            Box::new(ScriptedSource::new(&[])),
            Box::new(recognizer),
            quiet_output(),
        );

        let outcome = relay.run_cycle(&mut session)?;
        assert_eq!(
            outcome,
            CycleOutcome::Replied {
                reply: Reply::Plate("ABC128".into()),
                delivered: true
            }
        );
        assert_eq!(peer.join().unwrap(), vec!["ABC128\n"]);
        assert_eq!(relay.stats().ignored_messages, 2);
        assert_eq!(relay.stats().template_matches, 1);
        assert_eq!(relay.state(), CycleState::WaitingForTrigger);
        Ok(())
    }

    #[test]
    fn capture_failure_is_silent_by_default() -> Result<()> {
        let mut session = session();
        let peer = client(session.local_addr(), b"Z\nZ\n", 1);
        let mut relay = Relay::new(
            Box::new(ScriptedSource::new(&[false, true])),
            Box::new(StubRecognizer::new()),
            quiet_output(),
        );

        assert_eq!(relay.run_cycle(&mut session)?, CycleOutcome::CaptureFailed);
        assert!(matches!(relay.run_cycle(&mut session)?, CycleOutcome::Replied { .. }));
        // The only line the client sees answers the second trigger.
        assert_eq!(peer.join().unwrap(), vec!["NO_LEGIBLE\n"]);
        assert_eq!(relay.stats().capture_failures, 1);
        assert_eq!(relay.stats().replies_sent, 1);
        Ok(())
    }

    #[test]
    fn capture_failure_reply_when_enabled() -> Result<()> {
        let mut session = session();
        let peer = client(session.local_addr(), b"Z\n", 1);
        let output = OutputSettings {
            reply_on_capture_failure: true,
            ..quiet_output()
        };
        let mut relay = Relay::new(
            Box::new(ScriptedSource::new(&[false])),
            Box::new(StubRecognizer::new()),
            output,
        );

        assert_eq!(relay.run_cycle(&mut session)?, CycleOutcome::CaptureFailed);
        assert_eq!(peer.join().unwrap(), vec!["CAPTURE_FAILED\n"]);
        Ok(())
    }

    #[test]
    fn recognition_failure_is_handled_like_capture_failure() -> Result<()> {
        let mut session = session();
        let peer = client(session.local_addr(), b"Z\n", 1);
        let mut relay = Relay::new(
            Box::new(ScriptedSource::new(&[])),
            Box::new(BrokenRecognizer),
            OutputSettings {
                reply_on_capture_failure: true,
                ..quiet_output()
            },
        );

        assert_eq!(relay.run_cycle(&mut session)?, CycleOutcome::RecognitionFailed);
        assert_eq!(peer.join().unwrap(), vec!["CAPTURE_FAILED\n"]);
        assert_eq!(relay.stats().recognition_failures, 1);
        Ok(())
    }

    #[test]
    fn json_mode_sends_whole_result() -> Result<()> {
        let mut session = session();
        let peer = client(session.local_addr(), b"Z\n", 1);
        let mut relay = Relay::new(
            Box::new(ScriptedSource::new(&[])),
            Box::new(StubRecognizer::with_script(vec![vec![plate(&[("XYZ999", 50.0, false)])]])),
            OutputSettings {
                json: true,
                ..quiet_output()
            },
        );

        relay.run_cycle(&mut session)?;
        let lines = peer.join().unwrap();
        let value: serde_json::Value = serde_json::from_str(lines[0].trim_end()).unwrap();
        assert_eq!(value["img_width"], 8);
        assert_eq!(value["results"][0]["candidates"][0]["plate"], "XYZ999");
        assert_eq!(value["regions_of_interest"][0]["width"], 8);
        Ok(())
    }

    #[test]
    fn json_result_carries_measured_recognition_time() -> Result<()> {
        let mut session = session();
        let peer = client(session.local_addr(), b"Z\n", 1);
        let mut relay = Relay::new(
            Box::new(ScriptedSource::new(&[])),
            Box::new(TimedRecognizer {
                delay: Duration::from_millis(5),
                reported_ms: 0.0,
            }),
            OutputSettings {
                json: true,
                ..quiet_output()
            },
        );

        relay.run_cycle(&mut session)?;
        let lines = peer.join().unwrap();
        let value: serde_json::Value = serde_json::from_str(lines[0].trim_end()).unwrap();
        assert!(value["processing_time_ms"].as_f64().unwrap() >= 5.0);
        Ok(())
    }

    #[test]
    fn engine_reported_time_is_kept() -> Result<()> {
        let mut session = session();
        let peer = client(session.local_addr(), b"Z\n", 1);
        let mut relay = Relay::new(
            Box::new(ScriptedSource::new(&[])),
            Box::new(TimedRecognizer {
                delay: Duration::ZERO,
                reported_ms: 41.5,
            }),
            OutputSettings {
                json: true,
                ..quiet_output()
            },
        );

        relay.run_cycle(&mut session)?;
        let lines = peer.join().unwrap();
        let value: serde_json::Value = serde_json::from_str(lines[0].trim_end()).unwrap();
        assert_eq!(value["processing_time_ms"].as_f64(), Some(41.5));
        Ok(())
    }

    #[test]
    fn snapshot_is_written_before_recognition() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("last-image.jpg");
        let mut session = session();
        let peer = client(session.local_addr(), b"Z\n", 1);
        let mut relay = Relay::new(
            Box::new(ScriptedSource::new(&[])),
            Box::new(StubRecognizer::new()),
            OutputSettings {
                snapshot_path: Some(path.clone()),
                ..quiet_output()
            },
        );

        relay.run_cycle(&mut session)?;
        peer.join().unwrap();
        assert!(path.is_file());
        Ok(())
    }

    #[test]
    fn run_stops_on_shutdown_and_releases_source() -> Result<()> {
        let mut session = session();
        let shutdown = session.shutdown_handle();
        let source = ScriptedSource::new(&[]);
        let disconnected = source.disconnected.clone();
        let mut relay = Relay::new(
            Box::new(source),
            Box::new(StubRecognizer::new()),
            quiet_output(),
        );

        let peer = client(session.local_addr(), b"Z\n", 1);
        let stopper = thread::spawn(move || {
            let replies = peer.join().unwrap();
            thread::sleep(Duration::from_millis(20));
            shutdown.trigger();
            replies
        });

        let stats = relay.run(&mut session)?;
        assert_eq!(stopper.join().unwrap(), vec!["NO_LEGIBLE\n"]);
        assert_eq!(stats.triggers, 1);
        assert_eq!(stats.no_legible, 1);
        assert!(disconnected.load(Ordering::SeqCst));
        Ok(())
    }
}
