use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use plate_relay::config::{CliOverrides, RelayConfig};
use plate_relay::{CaptureMode, Framing};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ALPR_RELAY_CONFIG",
        "ALPR_ENGINE_BACKEND",
        "ALPR_SNAPSHOT_PATH",
        "ALPR_FRAMING",
        "ALPR_REPLY_ON_CAPTURE_FAILURE",
        "ALPR_SETUP_RETRIES",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_env_and_cli() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "engine": {
                "backend": "openalpr-cli",
                "binary": "/opt/openalpr/bin/alpr",
                "country": "us",
                "config_path": "/etc/openalpr/openalpr.conf",
                "top_n": 5,
                "default_region": "ca"
            },
            "camera": {
                "address": "rtsp://10.0.0.7/stream1",
                "setup_retries": 3,
                "width": 1280,
                "height": 720,
                "target_fps": 15
            },
            "output": {
                "snapshot_path": "/tmp/plate.jpg",
                "reply_on_capture_failure": false
            },
            "session": {
                "port": 4000,
                "framing": "line"
            }
        }"#,
    );

    std::env::set_var("ALPR_RELAY_CONFIG", file.path());
    std::env::set_var("ALPR_ENGINE_BACKEND", "stub");
    std::env::set_var("ALPR_REPLY_ON_CAPTURE_FAILURE", "true");
    std::env::set_var("ALPR_SETUP_RETRIES", "8");

    let cli = CliOverrides {
        country: Some("eu".to_string()),
        port: Some(5555),
        json: true,
        ..CliOverrides::default()
    };
    let cfg = RelayConfig::load(&cli).expect("load config");

    assert_eq!(cfg.engine.backend, "stub");
    assert_eq!(cfg.engine.binary, PathBuf::from("/opt/openalpr/bin/alpr"));
    assert_eq!(cfg.engine.country, "eu");
    assert_eq!(cfg.engine.config_path, PathBuf::from("/etc/openalpr/openalpr.conf"));
    assert_eq!(cfg.engine.top_n, 5);
    assert_eq!(cfg.engine.default_region.as_deref(), Some("ca"));
    assert_eq!(cfg.camera.mode(), CaptureMode::Network);
    assert_eq!(cfg.camera.setup_retries, 8);
    assert_eq!((cfg.camera.width, cfg.camera.height), (1280, 720));
    assert_eq!(cfg.camera.target_fps, 15);
    assert_eq!(cfg.output.snapshot_path, Some(PathBuf::from("/tmp/plate.jpg")));
    assert!(cfg.output.reply_on_capture_failure);
    assert!(cfg.output.json);
    assert_eq!(cfg.port, 5555);
    assert_eq!(cfg.framing, Framing::Line);

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = RelayConfig::load(&CliOverrides::default()).expect("load config");
    assert_eq!(cfg.port, 1234);
    assert_eq!(cfg.engine.backend, "openalpr-cli");
    assert_eq!(cfg.engine.country, "eu");
    assert_eq!(cfg.camera.mode(), CaptureMode::Usb);
    assert_eq!(cfg.camera.device_index, 0);
    assert_eq!(cfg.framing, Framing::Chunk);
    assert!(!cfg.output.reply_on_capture_failure);
}

#[test]
fn empty_snapshot_env_disables_snapshot() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ALPR_SNAPSHOT_PATH", "");
    let cfg = RelayConfig::load(&CliOverrides::default()).expect("load config");
    assert_eq!(cfg.output.snapshot_path, None);

    clear_env();
}

#[test]
fn cli_camera_index_and_empty_address_select_usb() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cli = CliOverrides {
        address: Some("   ".to_string()),
        camera: Some(2),
        ..CliOverrides::default()
    };
    let cfg = RelayConfig::load(&cli).expect("load config");
    assert_eq!(cfg.camera.mode(), CaptureMode::Usb);
    assert_eq!(cfg.camera.device_index, 2);
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ALPR_FRAMING", "length-prefixed");
    assert!(RelayConfig::load(&CliOverrides::default()).is_err());
    clear_env();

    std::env::set_var("ALPR_REPLY_ON_CAPTURE_FAILURE", "sometimes");
    assert!(RelayConfig::load(&CliOverrides::default()).is_err());
    clear_env();

    let file = write_config(r#"{"engine": {"top_n": 0}}"#);
    std::env::set_var("ALPR_RELAY_CONFIG", file.path());
    assert!(RelayConfig::load(&CliOverrides::default()).is_err());
    clear_env();

    std::env::set_var("ALPR_RELAY_CONFIG", "/nonexistent/relay.json");
    let err = RelayConfig::load(&CliOverrides::default()).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
    clear_env();
}
