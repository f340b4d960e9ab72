use super::*;

#[test]
fn defaults_resolve_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert_eq!(settings.logging.format, LogFormat::Compact);
    assert!(settings.cache.enable_activity);
    assert!(settings.cache.enable_file_stats);
    assert!(settings.cache.async_derived);
    assert_eq!(settings.cache.activity_window_months, 12);
    assert_eq!(settings.cache.dispatch_batch_limit, 100);
    assert_eq!(settings.mirror.ttl, Duration::from_secs(300));
    assert_eq!(settings.mirror.max_entries.get(), 500);
    assert!(settings.store.seed.is_none());
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.store.seed = Some(PathBuf::from("from-file.toml"));
    raw.cache.async_derived = Some(true);

    let overrides = GlobalOverrides {
        seed: Some(PathBuf::from("from-cli.toml")),
        log_level: Some("debug".to_string()),
        log_json: Some(true),
        sync_derived: true,
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.logging.format, LogFormat::Json);
    assert_eq!(settings.store.seed, Some(PathBuf::from("from-cli.toml")));
    assert!(!settings.cache.async_derived);
}

#[test]
fn absent_overrides_keep_file_values() {
    let mut raw = RawSettings::default();
    raw.cache.async_derived = Some(false);
    raw.logging.json = Some(true);

    raw.apply_overrides(&GlobalOverrides::default());
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(!settings.cache.async_derived);
    assert_eq!(settings.logging.format, LogFormat::Json);
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn activity_window_must_be_within_three_years() {
    for months in [0u8, 37] {
        let mut raw = RawSettings::default();
        raw.cache.activity_window_months = Some(months);
        let err = Settings::from_raw(raw).expect_err("out of range window");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "cache.activity_window_months",
                ..
            }
        ));
    }

    let mut raw = RawSettings::default();
    raw.cache.activity_window_months = Some(36);
    let settings = Settings::from_raw(raw).expect("upper bound accepted");
    assert_eq!(settings.cache.activity_window_months, 36);
}

#[test]
fn zero_limits_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.dispatch_batch_limit = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "cache.dispatch_batch_limit",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.mirror.max_entries = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "mirror.max_entries",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.mirror.ttl_ms = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "mirror.ttl_ms",
            ..
        })
    ));
}

#[test]
fn cache_settings_feed_cache_config() {
    let mut raw = RawSettings::default();
    raw.cache.enable_file_stats = Some(false);
    raw.cache.dispatch_batch_limit = Some(8);
    let settings = Settings::from_raw(raw).expect("valid settings");

    let config = crate::cache::CacheConfig::from(&settings.cache);
    assert!(config.enable_activity);
    assert!(!config.enable_file_stats);
    assert_eq!(config.dispatch_batch_limit, 8);
}

#[test]
fn cli_parses_audit_with_global_flags() {
    let args = CliArgs::parse_from([
        "canopy",
        "--config-file",
        "custom.toml",
        "audit",
        "--node",
        "7",
        "--strict",
        "--log-json",
        "--seed",
        "seed.toml",
    ]);

    assert_eq!(args.config_file, Some(PathBuf::from("custom.toml")));
    assert_eq!(args.overrides.log_json, Some(true));
    assert_eq!(args.overrides.seed, Some(PathBuf::from("seed.toml")));
    match args.command {
        Some(Command::Audit(audit)) => {
            assert_eq!(audit.node, Some(7));
            assert!(audit.strict);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_defaults_to_no_subcommand() {
    let args = CliArgs::parse_from(["canopy", "--log-level", "warn"]);
    assert!(args.command.is_none());
    assert_eq!(args.overrides.log_level.as_deref(), Some("warn"));
    assert!(!args.overrides.sync_derived);
}

#[test]
fn load_reads_an_explicit_config_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("canopy-test.toml");
    std::fs::write(
        &path,
        "[cache]\nenable_activity = false\nactivity_window_months = 6\n\n[mirror]\nmax_entries = 32\n",
    )
    .expect("write config");

    let args = CliArgs::parse_from([
        "canopy",
        "--config-file",
        path.to_str().expect("utf-8 path"),
    ]);
    let settings = load(&args).expect("settings load");

    assert!(!settings.cache.enable_activity);
    assert_eq!(settings.cache.activity_window_months, 6);
    assert_eq!(settings.mirror.max_entries.get(), 32);
}
