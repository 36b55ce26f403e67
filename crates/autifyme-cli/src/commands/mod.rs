//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command. Commands return
//! the JSON they want printed; `main` prints it with [`print_json`].

pub mod approval;
pub mod audit;
pub mod cost;
pub mod provider;
pub mod workflow;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use autifyme_core::engine::DefinitionRegistry;
use autifyme_core::models::WorkflowData;
use autifyme_core::{Database, EngineConfig, SqliteStore, WorkflowEngine};

use crate::executor::DefinitionWalker;

/// What every command runs against.
pub struct AppContext {
    pub engine: Arc<WorkflowEngine>,
    pub config: EngineConfig,
}

/// `$XDG_DATA_HOME/autifyme/autifyme.db` (or the platform equivalent).
pub fn default_db_path() -> String {
    dirs::data_local_dir()
        .map(|d| d.join("autifyme").join("autifyme.db"))
        .unwrap_or_else(|| PathBuf::from("autifyme.db"))
        .to_string_lossy()
        .to_string()
}

pub fn load_config(path: Option<&str>) -> Result<EngineConfig, String> {
    match path {
        Some(p) => EngineConfig::from_file(p).map_err(|e| e.to_string()),
        None => Ok(EngineConfig::default()),
    }
}

/// Built-in definitions plus every YAML file in `dir`.
pub fn load_definitions(dir: Option<&str>) -> Result<DefinitionRegistry, String> {
    let mut registry = DefinitionRegistry::with_builtins();
    if let Some(dir) = dir {
        let loaded = registry.load_dir(Path::new(dir)).map_err(|e| e.to_string())?;
        tracing::info!("[CLI] Loaded {} definition(s) from '{}'", loaded.len(), dir);
    }
    Ok(registry)
}

/// Open the database and build an engine driven by the definition walker.
pub fn init(
    db_path: &str,
    config_path: Option<&str>,
    definitions_dir: Option<&str>,
) -> Result<AppContext, String> {
    let config = load_config(config_path)?;
    let definitions = load_definitions(definitions_dir)?;

    if db_path != ":memory:" {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create '{}': {}", parent.display(), e))?;
            }
        }
    }
    let db = Database::open(db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", db_path, e))?;

    let store = Arc::new(SqliteStore::new(db));
    let executor = Arc::new(DefinitionWalker::new(definitions.clone()));
    let engine = WorkflowEngine::new(&config, store, executor).with_definitions(definitions);

    Ok(AppContext {
        engine: Arc::new(engine),
        config,
    })
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Failed to serialize output: {}", e))
}

/// Parse a `--data` argument; it must be a JSON object.
pub(crate) fn parse_data(raw: Option<&str>) -> Result<WorkflowData, String> {
    match raw {
        None => Ok(WorkflowData::new()),
        Some(s) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err("--data must be a JSON object".to_string()),
            Err(e) => Err(format!("Invalid --data JSON: {}", e)),
        },
    }
}

pub(crate) fn parse_time(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("Invalid timestamp '{}': {}", s, e))
    })
    .transpose()
}
