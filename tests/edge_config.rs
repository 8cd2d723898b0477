use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use manta_edge::config::EdgeConfig;
use manta_edge::{EdgeError, ErrorKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "MANTA_CONFIG",
        "MANTA_CAMERA_ID",
        "MANTA_CAMERA_SOURCE",
        "MANTA_DATABASE_URL",
        "MANTA_STORAGE_URL",
        "MANTA_BATCH_SIZE",
        "MANTA_RETRY_INTERVAL_SECS",
        "MANTA_SIMILARITY_THRESHOLD",
        "MANTA_RETENTION_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = EdgeConfig::load().expect("load defaults");
    assert_eq!(cfg.camera_id, "camera-01");
    assert_eq!(cfg.camera.source.url, "stub://front_camera");
    assert_eq!(cfg.camera.supervisor.connection_timeout, Duration::from_secs(10));
    assert_eq!(cfg.camera.supervisor.retry_interval, Duration::from_secs(5));
    assert_eq!(cfg.camera.supervisor.staleness_timeout, Duration::from_secs(10));
    assert_eq!(cfg.reid.matcher.feature_size, 128);
    assert_eq!(cfg.reid.matcher.similarity_threshold, 0.6);
    assert_eq!(cfg.reid.matcher.retention, Duration::from_secs(3600));
    assert_eq!(cfg.reid.matcher.max_stored_vectors, 1000);
    assert_eq!(cfg.delivery.queue.batch_size, 10);
    assert_eq!(cfg.delivery.queue.retry_interval, Duration::from_secs(60));
    assert!(cfg.delivery.database_url.is_none());
    assert_eq!(cfg.storage.queue.batch_size, 1);
    assert_eq!(cfg.activity.retention_days, 7);
    assert!(cfg.wifi.is_none());
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "camera_id": "lobby",
        "camera": {
            "source": "rtsp://10.0.0.5/stream",
            "width": 1280,
            "height": 720,
            "connection_timeout_secs": 15,
            "staleness_timeout_secs": 20
        },
        "wifi": { "ssid": "cam-net", "password": "secret" },
        "reid": {
            "feature_size": 256,
            "similarity_threshold": 0.7,
            "max_stored_vectors": 50
        },
        "delivery": {
            "database_url": "https://db.example.com",
            "path_prefix": "sites/hq",
            "batch_size": 25
        },
        "storage": { "local_dir": "/var/lib/manta/store", "workers": 4 },
        "activity": { "path": "/var/log/manta/activity.json", "retention_days": 3 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("MANTA_CONFIG", file.path());
    std::env::set_var("MANTA_CAMERA_ID", "lobby-2");
    std::env::set_var("MANTA_RETENTION_SECS", "600");
    std::env::set_var("MANTA_RETRY_INTERVAL_SECS", "30");

    let cfg = EdgeConfig::load().expect("load config");

    assert_eq!(cfg.camera_id, "lobby-2");
    assert_eq!(cfg.camera.source.url, "rtsp://10.0.0.5/stream");
    assert_eq!(cfg.camera.source.width, 1280);
    assert_eq!(cfg.camera.source.height, 720);
    assert_eq!(cfg.camera.supervisor.connection_timeout, Duration::from_secs(15));
    assert_eq!(cfg.camera.supervisor.staleness_timeout, Duration::from_secs(20));
    let wifi = cfg.wifi.expect("wifi settings");
    assert_eq!(wifi.ssid, "cam-net");
    assert_eq!(wifi.password.as_deref(), Some("secret"));
    assert_eq!(cfg.reid.matcher.feature_size, 256);
    assert_eq!(cfg.reid.matcher.similarity_threshold, 0.7);
    assert_eq!(cfg.reid.matcher.retention, Duration::from_secs(600));
    assert_eq!(cfg.reid.matcher.max_stored_vectors, 50);
    assert_eq!(cfg.delivery.database_url.as_deref(), Some("https://db.example.com"));
    assert_eq!(cfg.delivery.path_prefix, "sites/hq");
    assert_eq!(cfg.delivery.queue.batch_size, 25);
    assert_eq!(cfg.delivery.queue.retry_interval, Duration::from_secs(30));
    assert_eq!(cfg.storage.queue.retry_interval, Duration::from_secs(30));
    assert_eq!(cfg.storage.queue.workers, 4);
    assert_eq!(cfg.activity.retention_days, 3);

    clear_env();
}

#[test]
fn invalid_values_are_configuration_errors() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("MANTA_SIMILARITY_THRESHOLD", "1.7");
    let err = EdgeConfig::load().unwrap_err();
    assert_eq!(EdgeError::classify(&err), ErrorKind::Configuration);

    std::env::set_var("MANTA_SIMILARITY_THRESHOLD", "high");
    let err = EdgeConfig::load().unwrap_err();
    assert_eq!(EdgeError::classify(&err), ErrorKind::Configuration);

    clear_env();
    std::env::set_var("MANTA_BATCH_SIZE", "0");
    assert!(EdgeConfig::load().is_err());

    clear_env();
}

#[test]
fn unreadable_config_file_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("MANTA_CONFIG", "/nonexistent/manta.json");
    let err = EdgeConfig::load().unwrap_err();
    assert_eq!(EdgeError::classify(&err), ErrorKind::Configuration);

    clear_env();
}
