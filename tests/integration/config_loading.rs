use komagen::config::{global_config_path, ConfigLoader, MissingCharacterPolicy, PROJECT_CONFIG_FILE};
use std::sync::Mutex;
use tempfile::TempDir;

/// Serializes tests that touch process-wide environment variables.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const VARS: &[&str] = &[
    "HOME",
    "XDG_CONFIG_HOME",
    "KOMAGEN_ENV",
    "KOMAGEN__ORCHESTRATOR__MAX_CONCURRENT",
];

/// Run `f` with an isolated config home and the given variables set, restoring afterwards.
fn with_env<R>(home: &TempDir, vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let saved: Vec<(&str, Option<String>)> =
        VARS.iter().map(|k| (*k, std::env::var(k).ok())).collect();

    for key in VARS {
        std::env::remove_var(key);
    }
    std::env::set_var("HOME", home.path().join("home"));
    std::env::set_var("XDG_CONFIG_HOME", home.path().join("config"));
    for (key, value) in vars {
        std::env::set_var(key, value);
    }

    let result = f();

    for (key, value) in saved {
        match value {
            Some(value) => std::env::set_var(key, value),
            None => std::env::remove_var(key),
        }
    }
    result
}

#[test]
fn project_file_overrides_global_file() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    std::fs::write(
        project.path().join(PROJECT_CONFIG_FILE),
        "[orchestrator]\nmax_concurrent = 4\n",
    )
    .unwrap();

    let config = with_env(&home, &[], || {
        let global = global_config_path().unwrap();
        std::fs::create_dir_all(global.parent().unwrap()).unwrap();
        std::fs::write(
            &global,
            "[service]\nbase_url = \"http://render-box:7860\"\n\n[orchestrator]\nmax_concurrent = 1\nmax_retries = 3\n",
        )
        .unwrap();
        ConfigLoader::load(project.path()).unwrap()
    });

    assert_eq!(config.service.base_url, "http://render-box:7860");
    assert_eq!(config.orchestrator.max_concurrent, 4);
    assert_eq!(config.orchestrator.max_retries, 3);
}

#[test]
fn environment_file_and_variables_layer_on_top() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    std::fs::write(
        project.path().join(PROJECT_CONFIG_FILE),
        "[orchestrator]\nmax_concurrent = 4\n",
    )
    .unwrap();
    std::fs::create_dir_all(project.path().join("config")).unwrap();
    std::fs::write(
        project.path().join("config").join("ci.toml"),
        "[orchestrator]\nmissing_character = \"fail\"\nretry_delay_ms = 0\n",
    )
    .unwrap();

    let config = with_env(
        &home,
        &[
            ("KOMAGEN_ENV", "ci"),
            ("KOMAGEN__ORCHESTRATOR__MAX_CONCURRENT", "6"),
        ],
        || ConfigLoader::load(project.path()).unwrap(),
    );

    assert_eq!(config.orchestrator.max_concurrent, 6);
    assert_eq!(
        config.orchestrator.missing_character,
        MissingCharacterPolicy::Fail
    );
    assert_eq!(config.orchestrator.retry_delay_ms, 0);
}

#[test]
fn empty_project_loads_valid_defaults() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    let config = with_env(&home, &[], || ConfigLoader::load(project.path()).unwrap());
    assert_eq!(config.orchestrator.max_concurrent, 2);
    assert_eq!(config.logging.output, "stderr");
    assert!(config.validate().is_ok());
}

#[test]
fn invalid_values_fail_validation_not_loading() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    std::fs::write(
        project.path().join(PROJECT_CONFIG_FILE),
        "[orchestrator]\nmax_concurrent = 0\n\n[logging]\nformat = \"yaml\"\n",
    )
    .unwrap();

    let config = with_env(&home, &[], || ConfigLoader::load(project.path()).unwrap());
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 2);
    assert!(config.ensure_valid().is_err());
}

#[test]
fn missing_explicit_file_is_an_error() {
    let project = TempDir::new().unwrap();
    assert!(ConfigLoader::load_from_file(&project.path().join("nope.toml")).is_err());
}
