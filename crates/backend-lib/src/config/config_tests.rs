use super::*;
use std::path::PathBuf;
use tempfile::tempdir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert!(settings.validate().is_ok());
    assert_eq!(settings.room.countdown_secs, 60);
    assert_eq!(settings.room.extension_secs, 60);
    assert_eq!(settings.video.max_participants, 2);
    assert_eq!(settings.video.room_expiry_secs, 3600);
    assert!(settings.video.api_key.is_none());
    assert_eq!(settings.bind_addr().unwrap().to_string(), "127.0.0.1:3000");
}

#[test]
fn test_settings_validation() {
    let settings = Settings::default();

    // Test invalid log level
    let mut invalid_settings = settings.clone();
    invalid_settings.logging.level = "invalid".to_string();
    assert!(invalid_settings.validate().is_err());

    // Test zero countdown
    let mut invalid_settings = settings.clone();
    invalid_settings.room.countdown_secs = 0;
    assert!(invalid_settings.validate().is_err());

    let mut invalid_settings = settings.clone();
    invalid_settings.server.port = 0;
    assert!(invalid_settings.validate().is_err());

    let mut invalid_settings = settings.clone();
    invalid_settings.matchmaking.channel_capacity = 0;
    assert!(invalid_settings.validate().is_err());

    // Rooms are strictly one-on-one
    let mut invalid_settings = settings;
    invalid_settings.video.max_participants = 4;
    assert!(invalid_settings.validate().is_err());
}

#[test]
fn test_load_settings_from_file() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("protv.toml");

    std::fs::write(
        &config_path,
        r#"
        [server]
        port = 4100

        [storage]
        path = "test_data"

        [room]
        countdown_secs = 30

        [logging]
        level = "debug"
        "#,
    )
    .unwrap();

    let settings = Settings::load_from(Some(&config_path)).unwrap();
    assert_eq!(settings.server.port, 4100);
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.storage.path, PathBuf::from("test_data"));
    assert_eq!(settings.room.countdown_secs, 30);
    // Untouched keys keep their defaults
    assert_eq!(settings.room.extension_secs, 60);
    assert_eq!(settings.logging.level, "debug");
}

#[test]
fn test_load_rejects_invalid_file() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("bad.toml");
    std::fs::write(&config_path, "[video]\nmax_participants = 3\n").unwrap();

    assert!(Settings::load_from(Some(&config_path)).is_err());
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let temp_dir = tempdir().unwrap();
    let missing = temp_dir.path().join("nope.toml");
    assert!(Settings::load_from(Some(&missing)).is_err());
}
