use posture_analysis::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const MANAGED_VARS: &[&str] = &[
    "POSTURE_PROFILE",
    "POSTURE_API_BIND_ADDR",
    "POSTURE_ENGINE_MODEL",
    "POSTURE_ENGINE_API_KEY",
    "POSTURE_STORAGE_BUCKET",
    "POSTURE_STORAGE_PUBLIC_BASE_URL",
    "POSTURE_HISTORY_DEFAULT_LIMIT",
];

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    for var in MANAGED_VARS {
        unsafe {
            env::remove_var(var);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    fs::write(dir.path().join(name), contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.engine.model, "gemini-2.5-flash");
    assert_eq!(cfg.orchestrator.ready_ceiling_seconds, 300);
    assert_eq!(cfg.orchestrator.ready_poll_interval_seconds, 10);
    assert_eq!(cfg.orchestrator.rate_limit_backoff_seconds, 30);
    assert_eq!(cfg.history.default_limit, 10);
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "POSTURE_ENGINE_MODEL=from-env\n");
    write_env_file(&temp_dir, ".env.test", "POSTURE_ENGINE_MODEL=from-profile\n");
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "POSTURE_ENGINE_MODEL=from-profile-local\n",
    );
    // Profile chosen in .env.local before profile-specific files load
    write_env_file(
        &temp_dir,
        ".env.local",
        "POSTURE_PROFILE=test\nPOSTURE_ENGINE_MODEL=from-local\n",
    );

    let cfg = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.engine.model, "from-profile-local");
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "POSTURE_API_BIND_ADDR=127.0.0.1:3000\nPOSTURE_HISTORY_DEFAULT_LIMIT=5\n",
    );

    unsafe {
        env::set_var("POSTURE_API_BIND_ADDR", "0.0.0.0:9090");
    }

    let cfg = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.history.default_limit, 5);

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("POSTURE_API_BIND_ADDR", "not-an-addr");
    }
    let temp_dir = TempDir::new().unwrap();
    let err = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect_err("invalid bind addr should fail");
    assert!(matches!(err, ConfigError::InvalidBindAddr { .. }));
    assert!(err.to_string().contains("invalid api bind address"));

    clear_env();
}

#[test]
fn strict_profile_requires_credentials() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "POSTURE_PROFILE=prod\n");

    let err = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect_err("prod without credentials should fail");
    assert!(matches!(err, ConfigError::Missing(_)));
}
