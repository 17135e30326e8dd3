use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use footfall::config::FootfallConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FOOTFALL_CONFIG",
        "FOOTFALL_DB_PATH",
        "FOOTFALL_HTTP_ADDR",
        "FOOTFALL_FRAME_TIMEOUT_SECS",
        "FOOTFALL_SNAPSHOT_SECS",
        "FOOTFALL_DETECTOR",
        "FOOTFALL_MODEL_PATH",
        "FOOTFALL_FONT_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_apply_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = FootfallConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "footfall.db");
    assert_eq!(cfg.http_addr, "127.0.0.1:8000");
    assert_eq!(cfg.stream.poll_interval, Duration::from_millis(50));
    assert_eq!(cfg.stream.frame_timeout, Duration::from_secs(10));
    assert_eq!(cfg.worker.snapshot_interval, Duration::from_secs(300));
    assert_eq!(cfg.worker.max_reconnect_attempts, 10);
    assert_eq!(cfg.tracker.max_age, 20);
    assert_eq!(cfg.tracker.min_hits, 3);
    assert!(cfg.annotate.font_path.is_none());
    assert!(cfg.branches.is_empty());
}

#[test]
fn loads_json_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "counts_prod.db",
        "http": { "addr": "0.0.0.0:9000" },
        "stream": { "poll_interval_ms": 20, "frame_timeout_secs": 4 },
        "worker": { "max_reconnect_attempts": 0, "jpeg_quality": 60 },
        "snapshot": { "interval_secs": 120 },
        "detector": { "backend": "stub", "confidence": 0.4, "max_detections": 12 },
        "tracker": { "iou_threshold": 0.5 },
        "branches": { "downtown": ["rtsp://cam-1", "rtsp://cam-2"] }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("FOOTFALL_CONFIG", file.path());
    std::env::set_var("FOOTFALL_HTTP_ADDR", "127.0.0.1:8123");
    std::env::set_var("FOOTFALL_SNAPSHOT_SECS", "60");
    std::env::set_var("FOOTFALL_FONT_PATH", "/usr/share/fonts/dejavu.ttf");

    let cfg = FootfallConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "counts_prod.db");
    assert_eq!(cfg.http_addr, "127.0.0.1:8123");
    assert_eq!(cfg.stream.poll_interval, Duration::from_millis(20));
    assert_eq!(cfg.stream.frame_timeout, Duration::from_secs(4));
    assert_eq!(cfg.worker.max_reconnect_attempts, 0);
    assert_eq!(cfg.worker.jpeg_quality, 60);
    assert_eq!(cfg.worker.snapshot_interval, Duration::from_secs(60));
    assert_eq!(cfg.detector.confidence, 0.4);
    assert_eq!(cfg.detector.max_detections, 12);
    assert_eq!(cfg.tracker.iou_threshold, 0.5);
    assert_eq!(cfg.tracker.min_hits, 3);
    assert_eq!(
        cfg.annotate.font_path.as_deref(),
        Some(std::path::Path::new("/usr/share/fonts/dejavu.ttf"))
    );
    assert_eq!(cfg.branch_for("rtsp://cam-2"), Some(("downtown", 2)));

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        db_path = "branch.db"

        [worker]
        idle_timeout_secs = 15

        [branches]
        uptown = ["stub://entrance"]
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = FootfallConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.db_path, "branch.db");
    assert_eq!(cfg.worker.idle_timeout, Duration::from_secs(15));
    assert_eq!(cfg.branches["uptown"], vec!["stub://entrance".to_string()]);
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FOOTFALL_FRAME_TIMEOUT_SECS", "soon");
    assert!(FootfallConfig::load().is_err());
    clear_env();

    std::env::set_var("FOOTFALL_SNAPSHOT_SECS", "0");
    assert!(FootfallConfig::load().is_err());
    clear_env();

    std::env::set_var("FOOTFALL_DETECTOR", "mystery");
    assert!(FootfallConfig::load().is_err());
    clear_env();

    // Either missing from the build or missing its model; never accepted bare.
    std::env::set_var("FOOTFALL_DETECTOR", "tract");
    assert!(FootfallConfig::load().is_err());
    clear_env();
}

#[test]
fn rejects_malformed_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    assert!(FootfallConfig::load_from(Some(file.path())).is_err());
}
