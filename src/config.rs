use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::ingest::CaptureMode;
use crate::protocol::Framing;

const DEFAULT_PORT: u16 = 1234;
const DEFAULT_COUNTRY: &str = "eu";
const DEFAULT_ENGINE_CONFIG: &str = "runtime_data/eu.conf";
const DEFAULT_BACKEND: &str = "openalpr-cli";
const DEFAULT_BINARY: &str = "alpr";
const DEFAULT_TOP_N: u32 = 10;
const DEFAULT_SETUP_RETRIES: u32 = 5;
const DEFAULT_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_SNAPSHOT_PATH: &str = "last-image.jpg";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    engine: Option<EngineConfigFile>,
    camera: Option<CameraConfigFile>,
    output: Option<OutputConfigFile>,
    session: Option<SessionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EngineConfigFile {
    backend: Option<String>,
    binary: Option<PathBuf>,
    country: Option<String>,
    config_path: Option<PathBuf>,
    top_n: Option<u32>,
    default_region: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    address: Option<String>,
    device_index: Option<u32>,
    usb_device: Option<String>,
    setup_retries: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    json: Option<bool>,
    snapshot_path: Option<String>,
    reply_on_capture_failure: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SessionConfigFile {
    port: Option<u16>,
    framing: Option<Framing>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub engine: EngineSettings,
    pub camera: CameraSettings,
    pub output: OutputSettings,
    pub port: u16,
    pub framing: Framing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Recognizer backend name, see `recognize::open_recognizer`.
    pub backend: String,
    pub binary: PathBuf,
    pub country: String,
    pub config_path: PathBuf,
    pub top_n: u32,
    pub default_region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    /// Network camera address; empty selects USB capture.
    pub address: String,
    pub device_index: u32,
    /// Replaces `/dev/video<device_index>` when set.
    pub usb_device: Option<String>,
    pub setup_retries: u32,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSettings {
    pub json: bool,
    /// Debug snapshot of the latest frame; `None` disables it.
    pub snapshot_path: Option<PathBuf>,
    pub reply_on_capture_failure: bool,
}

/// Values given on the command line (or their clap-bound env vars).
/// They override everything else.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub country: Option<String>,
    pub engine_config: Option<PathBuf>,
    pub port: Option<u16>,
    pub address: Option<String>,
    pub camera: Option<u32>,
    pub json: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            binary: PathBuf::from(DEFAULT_BINARY),
            country: DEFAULT_COUNTRY.to_string(),
            config_path: PathBuf::from(DEFAULT_ENGINE_CONFIG),
            top_n: DEFAULT_TOP_N,
            default_region: None,
        }
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            device_index: 0,
            usb_device: None,
            setup_retries: DEFAULT_SETUP_RETRIES,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            target_fps: DEFAULT_FPS,
        }
    }
}

impl CameraSettings {
    pub fn mode(&self) -> CaptureMode {
        CaptureMode::from_address(&self.address)
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            json: false,
            snapshot_path: Some(PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            reply_on_capture_failure: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            camera: CameraSettings::default(),
            output: OutputSettings::default(),
            port: DEFAULT_PORT,
            framing: Framing::default(),
        }
    }
}

impl RelayConfig {
    /// Defaults, then the file named by `ALPR_RELAY_CONFIG`, then `ALPR_*`
    /// environment overrides, then the command line.
    pub fn load(cli: &CliOverrides) -> Result<Self> {
        let config_path = std::env::var("ALPR_RELAY_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty());
        let file_cfg = match config_path.as_deref() {
            Some(path) => read_config_file(Path::new(path))?,
            None => RelayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.apply_cli(cli);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let mut cfg = Self::default();
        if let Some(engine) = file.engine {
            let settings = &mut cfg.engine;
            if let Some(backend) = engine.backend {
                settings.backend = backend;
            }
            if let Some(binary) = engine.binary {
                settings.binary = binary;
            }
            if let Some(country) = engine.country {
                settings.country = country;
            }
            if let Some(path) = engine.config_path {
                settings.config_path = path;
            }
            settings.top_n = engine.top_n.unwrap_or(settings.top_n);
            settings.default_region = engine.default_region.filter(|r| !r.trim().is_empty());
        }
        if let Some(camera) = file.camera {
            let settings = &mut cfg.camera;
            if let Some(address) = camera.address {
                settings.address = address;
            }
            settings.device_index = camera.device_index.unwrap_or(settings.device_index);
            settings.usb_device = camera.usb_device.filter(|d| !d.trim().is_empty());
            settings.setup_retries = camera.setup_retries.unwrap_or(settings.setup_retries);
            settings.width = camera.width.unwrap_or(settings.width);
            settings.height = camera.height.unwrap_or(settings.height);
            settings.target_fps = camera.target_fps.unwrap_or(settings.target_fps);
        }
        if let Some(output) = file.output {
            let settings = &mut cfg.output;
            settings.json = output.json.unwrap_or(settings.json);
            if let Some(path) = output.snapshot_path {
                settings.snapshot_path = snapshot_path(&path);
            }
            settings.reply_on_capture_failure = output
                .reply_on_capture_failure
                .unwrap_or(settings.reply_on_capture_failure);
        }
        if let Some(session) = file.session {
            cfg.port = session.port.unwrap_or(cfg.port);
            cfg.framing = session.framing.unwrap_or(cfg.framing);
        }
        cfg
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(backend) = std::env::var("ALPR_ENGINE_BACKEND") {
            if !backend.trim().is_empty() {
                self.engine.backend = backend.trim().to_string();
            }
        }
        // Set-but-empty turns the snapshot off.
        if let Ok(path) = std::env::var("ALPR_SNAPSHOT_PATH") {
            self.output.snapshot_path = snapshot_path(&path);
        }
        if let Ok(framing) = std::env::var("ALPR_FRAMING") {
            if !framing.trim().is_empty() {
                self.framing = framing.parse()?;
            }
        }
        if let Ok(flag) = std::env::var("ALPR_REPLY_ON_CAPTURE_FAILURE") {
            self.output.reply_on_capture_failure = parse_flag(&flag).ok_or_else(|| {
                anyhow!("ALPR_REPLY_ON_CAPTURE_FAILURE must be true/false (got '{}')", flag)
            })?;
        }
        if let Ok(retries) = std::env::var("ALPR_SETUP_RETRIES") {
            self.camera.setup_retries = retries
                .trim()
                .parse()
                .map_err(|_| anyhow!("ALPR_SETUP_RETRIES must be a non-negative integer"))?;
        }
        Ok(())
    }

    fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(country) = &cli.country {
            self.engine.country = country.clone();
        }
        if let Some(path) = &cli.engine_config {
            self.engine.config_path = path.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(address) = &cli.address {
            self.camera.address = address.clone();
        }
        if let Some(index) = cli.camera {
            self.camera.device_index = index;
        }
        if cli.json {
            self.output.json = true;
        }
    }

    fn validate(&mut self) -> Result<()> {
        self.engine.country = self.engine.country.trim().to_string();
        if self.engine.country.is_empty() {
            return Err(anyhow!("country code must not be empty"));
        }
        if self.engine.backend.trim().is_empty() {
            return Err(anyhow!("engine backend must not be empty"));
        }
        if self.engine.top_n == 0 {
            return Err(anyhow!("engine top_n must be at least 1"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!(
                "camera resolution must be non-zero (got {}x{})",
                self.camera.width,
                self.camera.height
            ));
        }
        if self.camera.setup_retries == 0 {
            return Err(anyhow!("camera setup_retries must be at least 1"));
        }
        self.camera.address = self.camera.address.trim().to_string();
        // YUYV packs two horizontal pixels per sample.
        if self.camera.mode() == CaptureMode::Usb && self.camera.width % 2 != 0 {
            return Err(anyhow!(
                "USB camera width must be even (got {})",
                self.camera.width
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn snapshot_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
