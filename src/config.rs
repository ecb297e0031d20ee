//! Runtime configuration. Settings are merged depth-first from compiled
//! defaults, the system / user / local TOML files, and `HYPERSHELL_*`
//! environment variables (with `_` as the section separator); command-line
//! flags are applied on top by the individual subcommands. Keys suffixed
//! `_env` or `_eval` are late-expanded by the loader, never at use site.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{HyperError, Result};
use crate::protocol::DEFAULT_PORT;

/// Compiled-in authentication token; rejected for non-loopback binds.
pub const DEFAULT_AUTH: &str = "__HYPERSHELL_DEFAULT_AUTHKEY__";

const ENV_PREFIX: &str = "HYPERSHELL_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub submit: SubmitSettings,
    pub task: TaskSettings,
    pub autoscale: AutoscaleSettings,
    pub ssh: SshSettings,
    pub export: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingSettings::default(),
            database: DatabaseSettings::default(),
            server: ServerSettings::default(),
            client: ClientSettings::default(),
            submit: SubmitSettings::default(),
            task: TaskSettings::default(),
            autoscale: AutoscaleSettings::default(),
            ssh: SshSettings::default(),
            export: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub style: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            style: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            provider: "sqlite".to_string(),
            file: None,
            host: None,
            port: None,
            user: None,
            password: None,
            schema: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    pub auth: String,
    /// Bundles allowed on the outbound queue before the scheduler blocks.
    pub queuesize: usize,
    pub bundlesize: usize,
    pub attempts: u32,
    /// Prefer failed tasks over novel tasks when scheduling.
    pub eager: bool,
    /// Seconds to wait between database polls.
    pub wait: u64,
    /// Seconds of heartbeat silence before a client is evicted.
    pub evict: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "localhost".to_string(),
            port: DEFAULT_PORT,
            auth: DEFAULT_AUTH.to_string(),
            queuesize: 1,
            bundlesize: 1,
            attempts: 1,
            eager: false,
            wait: 5,
            evict: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub bundlesize: usize,
    pub bundlewait: u64,
    /// Seconds between heartbeats.
    pub heartrate: u64,
    /// Seconds without a bundle before the client disconnects on its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            bundlesize: 1,
            bundlewait: 5,
            heartrate: 10,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitSettings {
    pub bundlesize: usize,
    pub bundlewait: u64,
}

impl Default for SubmitSettings {
    fn default() -> Self {
        Self {
            bundlesize: 1,
            bundlewait: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Walltime limit in seconds; unlimited when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Seconds between INT, TERM, KILL during timeout escalation.
    pub signalwait: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: None,
            signalwait: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleSettings {
    pub policy: String,
    pub factor: f64,
    pub period: u64,
    /// Launch command prefix; empty means launch clients bare.
    pub launcher: String,
    pub size: AutoscaleSize,
}

impl Default for AutoscaleSettings {
    fn default() -> Self {
        Self {
            policy: "fixed".to_string(),
            factor: 1.0,
            period: 60,
            launcher: String::new(),
            size: AutoscaleSize::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleSize {
    pub init: usize,
    pub min: usize,
    pub max: usize,
}

impl Default for AutoscaleSize {
    fn default() -> Self {
        Self {
            init: 1,
            min: 0,
            max: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SshSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    pub nodelist: BTreeMap<String, Vec<String>>,
}

/// Configuration layers in precedence order (low to high).
#[derive(Debug)]
pub struct ConfigLoader {
    layers: Vec<(String, Value)>,
}

impl ConfigLoader {
    /// Load every configuration layer. With `HYPERSHELL_CONFIG_FILE` set,
    /// only that file is read (plus defaults and the environment).
    pub fn load() -> Result<Self> {
        let mut layers = vec![(
            "default".to_string(),
            Value::try_from(Settings::default())
                .map_err(|err| HyperError::Config(err.to_string()))?,
        )];
        if let Ok(only) = std::env::var(format!("{ENV_PREFIX}CONFIG_FILE")) {
            layers.push(("local".to_string(), load_file(&PathBuf::from(only))?));
        } else {
            for (name, path) in [
                ("system", system_path()),
                ("user", user_path()),
                ("local", local_path()),
            ] {
                layers.push((name.to_string(), load_file(&path)?));
            }
        }
        layers.push(("env".to_string(), load_env()));
        Ok(Self { layers })
    }

    /// Merge all layers and resolve `_env`/`_eval` deferred values.
    pub fn settings(&self) -> Result<Settings> {
        let mut merged = Value::Table(toml::map::Map::new());
        for (_, layer) in &self.layers {
            deep_merge(&mut merged, layer);
        }
        resolve_deferred(&mut merged)?;
        merged
            .try_into()
            .map_err(|err| HyperError::Config(err.to_string()))
    }

    /// Name of the highest-precedence layer defining a dotted path.
    pub fn which(&self, path: &str) -> Option<&str> {
        self.layers
            .iter()
            .rev()
            .find(|(_, layer)| lookup(layer, path).is_some())
            .map(|(name, _)| name.as_str())
    }

    /// Value at a dotted path in the merged configuration.
    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        let mut merged = Value::Table(toml::map::Map::new());
        for (_, layer) in &self.layers {
            deep_merge(&mut merged, layer);
        }
        resolve_deferred(&mut merged)?;
        Ok(lookup(&merged, path).cloned())
    }
}

pub fn system_path() -> PathBuf {
    PathBuf::from("/etc/hypershell.toml")
}

pub fn user_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".hypershell").join("config.toml")
}

pub fn local_path() -> PathBuf {
    PathBuf::from(".hypershell.toml")
}

fn load_file(path: &PathBuf) -> Result<Value> {
    if !path.exists() {
        return Ok(Value::Table(toml::map::Map::new()));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|err| HyperError::Config(format!("{}: {err}", path.display())))?;
    content
        .parse::<Value>()
        .map_err(|err| HyperError::Config(format!("{}: {err}", path.display())))
}

/// Expand `HYPERSHELL_*` environment variables into a namespace. Section
/// names are matched greedily against the default structure so that e.g.
/// `HYPERSHELL_AUTOSCALE_SIZE_MAX` lands at `autoscale.size.max`.
/// `HYPERSHELL_EXPORT_<NAME>` keys preserve case.
fn load_env() -> Value {
    let skeleton = Value::try_from(Settings::default()).expect("defaults serialize");
    let mut table = toml::map::Map::new();
    for (name, raw) in std::env::vars() {
        let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if rest == "CONFIG_FILE" {
            continue;
        }
        if let Some(export) = rest.strip_prefix("EXPORT_") {
            let exports = table
                .entry("export".to_string())
                .or_insert_with(|| Value::Table(toml::map::Map::new()));
            if let Value::Table(exports) = exports {
                exports.insert(export.to_string(), Value::String(raw));
            }
            continue;
        }
        let segments: Vec<String> = rest.split('_').map(|s| s.to_lowercase()).collect();
        if segments.len() < 2 {
            continue;
        }
        // walk nested tables in the skeleton to find the key boundary
        let mut path = Vec::new();
        let mut cursor = &skeleton;
        let mut index = 0;
        while index < segments.len() - 1 {
            match cursor.get(segments[index].as_str()) {
                Some(next @ Value::Table(_)) => {
                    path.push(segments[index].clone());
                    cursor = next;
                    index += 1;
                }
                _ => break,
            }
        }
        if path.is_empty() {
            path.push(segments[0].clone());
            index = 1;
        }
        let key = segments[index..].join("_");
        let mut target = &mut table;
        for segment in &path {
            let entry = target
                .entry(segment.clone())
                .or_insert_with(|| Value::Table(toml::map::Map::new()));
            match entry {
                Value::Table(inner) => target = inner,
                _ => {
                    *entry = Value::Table(toml::map::Map::new());
                    if let Value::Table(inner) = entry {
                        target = inner;
                    } else {
                        unreachable!()
                    }
                }
            }
        }
        target.insert(key, parse_scalar(&raw));
    }
    Value::Table(table)
}

/// Coerce a raw environment string to a typed TOML scalar.
fn parse_scalar(raw: &str) -> Value {
    if let Ok(value) = raw.parse::<i64>() {
        return Value::Integer(value);
    }
    if let Ok(value) = raw.parse::<f64>() {
        return Value::Float(value);
    }
    match raw {
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        _ => Value::String(raw.to_string()),
    }
}

/// Depth-first merge of `overlay` onto `base`.
fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(key) {
                    Some(existing) if existing.is_table() && value.is_table() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_table.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, _) => *base_slot = overlay.clone(),
    }
}

/// Replace `key_env` entries by reading the named environment variable and
/// `key_eval` entries by executing the value as a shell snippet.
fn resolve_deferred(value: &mut Value) -> Result<()> {
    let Value::Table(table) = value else {
        return Ok(());
    };
    let deferred: Vec<String> = table
        .keys()
        .filter(|key| key.ends_with("_env") || key.ends_with("_eval"))
        .cloned()
        .collect();
    for key in deferred {
        let raw = table.remove(&key).unwrap();
        let Value::String(spec) = raw else {
            return Err(HyperError::Config(format!("expected string for `{key}`")));
        };
        let (base, resolved) = if let Some(base) = key.strip_suffix("_env") {
            let value = std::env::var(&spec)
                .map_err(|_| HyperError::Config(format!("`{key}`: ${spec} is not set")))?;
            (base, value)
        } else {
            let base = key.strip_suffix("_eval").unwrap();
            let output = std::process::Command::new("sh")
                .arg("-c")
                .arg(&spec)
                .output()
                .map_err(|err| HyperError::Config(format!("`{key}`: {err}")))?;
            if !output.status.success() {
                return Err(HyperError::Config(format!("`{key}`: command failed: {spec}")));
            }
            (base, String::from_utf8_lossy(&output.stdout).trim().to_string())
        };
        table.insert(base.to_string(), parse_scalar(&resolved));
    }
    for (_, entry) in table.iter_mut() {
        resolve_deferred(entry)?;
    }
    Ok(())
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = value;
    for segment in path.split('.') {
        cursor = cursor.get(segment)?;
    }
    Some(cursor)
}

/// Write a dotted-path assignment into a configuration file, creating the
/// file and parent directory as needed.
pub fn update_file(path: &PathBuf, dotted: &str, raw: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| HyperError::Config(format!("{}: {err}", parent.display())))?;
    }
    let mut root = load_file(path)?;
    let segments: Vec<&str> = dotted.split('.').collect();
    let mut cursor = &mut root;
    for segment in &segments[..segments.len() - 1] {
        let table = match cursor {
            Value::Table(table) => table,
            _ => return Err(HyperError::Config(format!("`{dotted}` collides with a value"))),
        };
        cursor = table
            .entry(segment.to_string())
            .or_insert_with(|| Value::Table(toml::map::Map::new()));
    }
    match cursor {
        Value::Table(table) => {
            table.insert(segments[segments.len() - 1].to_string(), parse_scalar(raw));
        }
        _ => return Err(HyperError::Config(format!("`{dotted}` collides with a value"))),
    }
    let rendered =
        toml::to_string_pretty(&root).map_err(|err| HyperError::Config(err.to_string()))?;
    std::fs::write(path, rendered)
        .map_err(|err| HyperError::Config(format!("{}: {err}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 50001);
        assert_eq!(settings.server.queuesize, 1);
        assert_eq!(settings.server.evict, 600);
        assert_eq!(settings.client.heartrate, 10);
        assert_eq!(settings.autoscale.policy, "fixed");
        assert_eq!(settings.autoscale.size.min, 0);
    }

    #[test]
    fn deep_merge_overrides_leaves() {
        let mut base = Value::try_from(Settings::default()).unwrap();
        let overlay: Value = "[server]\nport = 9000\n".parse().unwrap();
        deep_merge(&mut base, &overlay);
        let settings: Settings = base.try_into().unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.bind, "localhost");
    }

    #[test]
    fn env_value_coercion() {
        assert_eq!(parse_scalar("42"), Value::Integer(42));
        assert_eq!(parse_scalar("2.5"), Value::Float(2.5));
        assert_eq!(parse_scalar("true"), Value::Boolean(true));
        assert_eq!(parse_scalar("abc"), Value::String("abc".to_string()));
    }

    #[test]
    fn deferred_env_resolution() {
        std::env::set_var("HYPERSHELL_TEST_SECRET", "token-abc");
        let mut value: Value = "[server]\nauth_env = \"HYPERSHELL_TEST_SECRET\"\n"
            .parse()
            .unwrap();
        resolve_deferred(&mut value).unwrap();
        assert_eq!(
            lookup(&value, "server.auth"),
            Some(&Value::String("token-abc".to_string()))
        );
    }

    #[test]
    fn deferred_eval_resolution() {
        let mut value: Value = "[server]\nauth_eval = \"echo secret-xyz\"\n".parse().unwrap();
        resolve_deferred(&mut value).unwrap();
        assert_eq!(
            lookup(&value, "server.auth"),
            Some(&Value::String("secret-xyz".to_string()))
        );
    }

    #[test]
    fn update_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        update_file(&path, "server.port", "9001").unwrap();
        update_file(&path, "logging.level", "debug").unwrap();
        let value = load_file(&path).unwrap();
        assert_eq!(lookup(&value, "server.port"), Some(&Value::Integer(9001)));
        assert_eq!(
            lookup(&value, "logging.level"),
            Some(&Value::String("debug".to_string()))
        );
    }
}
