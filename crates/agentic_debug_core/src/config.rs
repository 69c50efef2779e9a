//! Launch configuration resolution.
//!
//! Each launch merges three sources, highest priority first: the parameters of
//! the tool call, the persisted `agenticDebug.*` settings, and (path mappings
//! only) the first matching profile of the project's `launch.json`. Whatever is
//! still missing falls back to hardcoded defaults. A mapping that is present but
//! empty counts as missing at every tier.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{BridgeError, Result};

pub const SETTINGS_NAMESPACE: &str = "agenticDebug";
pub const DEBUG_TYPE: &str = "php";
pub const SESSION_NAME: &str = "Agentic Debug Session";
pub const ADAPTER_EXTENSION_ID: &str = "xdebug.php-debug";
pub const ADAPTER_PATH_ENV: &str = "AGENTIC_DEBUG_ADAPTER_PATH";

pub const DEFAULT_PORT: u16 = 9003;
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";
pub const DEFAULT_STOP_ON_ENTRY: bool = true;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 0;
pub const PINNED_RUNTIME_EXECUTABLE: &str = "php";
pub const PINNED_LOG: bool = false;

/// Keys a tool call may wrap its real arguments in.
const WRAPPER_KEYS: [&str; 3] = ["input", "params", "arguments"];

/// Remote (debuggee) path → local (workspace) path.
pub type PathMappings = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Route through the host debug UI via [`crate::ProtocolBridge`].
    #[default]
    Ui,
    /// Talk to the adapter directly, without the host.
    Headless,
}

/// Strongly typed launch parameters, normalized at the tool boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchParams {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, alias = "stop_on_entry")]
    pub stop_on_entry: Option<bool>,
    #[serde(default, alias = "path_mappings")]
    pub path_mappings: Option<PathMappings>,
    #[serde(default, alias = "backend_mode")]
    pub backend_mode: Option<BackendMode>,
}

impl LaunchParams {
    /// Parses raw tool input, unwrapping a single `input`/`params`/`arguments`
    /// wrapper object if the caller nested its fields under one.
    pub fn from_tool_input(input: Value) -> Result<Self> {
        let input = match input {
            Value::Null => return Ok(Self::default()),
            Value::Object(mut map) if map.len() == 1 => {
                let wrapped = WRAPPER_KEYS
                    .iter()
                    .find(|key| map.get(**key).is_some_and(Value::is_object))
                    .copied();
                match wrapped {
                    Some(key) => map.remove(key).unwrap_or(Value::Null),
                    None => Value::Object(map),
                }
            }
            other => other,
        };

        serde_json::from_value(input)
            .map_err(|e| BridgeError::InvalidParams(format!("launch parameters: {e}")))
    }

    pub fn backend_mode(&self) -> BackendMode {
        self.backend_mode.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub adapter_path: PathBuf,
    pub port: u16,
    pub hostname: String,
    pub stop_on_entry: bool,
    pub path_mappings: PathMappings,
    pub max_connections: u32,
    pub runtime_executable: String,
    pub log: bool,
    pub xdebug_settings: Map<String, Value>,
}

impl ResolvedConfig {
    /// Arguments for the protocol `launch` request.
    pub fn launch_arguments(&self) -> Value {
        json!({
            "port": self.port,
            "hostname": self.hostname,
            "stopOnEntry": self.stop_on_entry,
            "pathMappings": self.path_mappings,
            "maxConnections": self.max_connections,
            "runtimeExecutable": self.runtime_executable,
            "log": self.log,
            "xdebugSettings": self.xdebug_settings,
        })
    }
}

/// Read-only view of persisted user settings under [`SETTINGS_NAMESPACE`].
pub trait SettingsSource: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
}

/// Read-only view of the project's launch profiles.
pub trait LaunchProfileSource: Send + Sync {
    fn profiles(&self) -> Vec<LaunchProfile>;
}

/// Finds the debug adapter shipped by the companion editor extension.
pub trait AdapterLocator: Send + Sync {
    fn locate(&self) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LaunchProfile {
    #[serde(rename = "type", default)]
    pub debug_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "pathMappings", default)]
    pub path_mappings: Option<PathMappings>,
}

/// Treats an empty mapping the same as an absent one.
pub fn non_empty(mappings: Option<&PathMappings>) -> Option<&PathMappings> {
    mappings.filter(|m| !m.is_empty())
}

/// First profile of `debug_type` that carries a non-empty mapping.
pub fn profile_path_mappings(profiles: &[LaunchProfile], debug_type: &str) -> Option<PathMappings> {
    profiles
        .iter()
        .filter(|profile| profile.debug_type == debug_type)
        .find_map(|profile| non_empty(profile.path_mappings.as_ref()).cloned())
}

pub fn resolve_path_mappings(
    params: &LaunchParams,
    settings: &dyn SettingsSource,
    profiles: &dyn LaunchProfileSource,
) -> PathMappings {
    if let Some(mappings) = non_empty(params.path_mappings.as_ref()) {
        return mappings.clone();
    }

    let from_settings = settings
        .get("pathMappings")
        .and_then(|value| serde_json::from_value::<PathMappings>(value).ok());
    if let Some(mappings) = non_empty(from_settings.as_ref()) {
        return mappings.clone();
    }

    if let Some(mappings) = profile_path_mappings(&profiles.profiles(), DEBUG_TYPE) {
        tracing::info!("Using pathMappings from launch profile: {:?}", mappings);
        return mappings;
    }

    PathMappings::new()
}

/// Merges all tiers into a [`ResolvedConfig`]. Pure given its inputs.
pub fn resolve(
    params: &LaunchParams,
    settings: &dyn SettingsSource,
    profiles: &dyn LaunchProfileSource,
    adapter_path: PathBuf,
) -> ResolvedConfig {
    let port = params
        .port
        .or_else(|| setting_u64(settings, "port").and_then(|p| u16::try_from(p).ok()))
        .unwrap_or(DEFAULT_PORT);
    let hostname = params
        .hostname
        .clone()
        .or_else(|| settings.get("hostname").and_then(|v| v.as_str().map(str::to_string)))
        .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());
    let stop_on_entry = params
        .stop_on_entry
        .or_else(|| settings.get("stopOnEntry").and_then(|v| v.as_bool()))
        .unwrap_or(DEFAULT_STOP_ON_ENTRY);
    let max_connections = setting_u64(settings, "maxConnections")
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);

    ResolvedConfig {
        adapter_path,
        port,
        hostname,
        stop_on_entry,
        path_mappings: resolve_path_mappings(params, settings, profiles),
        max_connections,
        runtime_executable: PINNED_RUNTIME_EXECUTABLE.to_string(),
        log: PINNED_LOG,
        xdebug_settings: Map::new(),
    }
}

fn setting_u64(settings: &dyn SettingsSource, key: &str) -> Option<u64> {
    settings.get(key).and_then(|v| v.as_u64())
}

/// Resolves configuration for one launch from its three providers.
#[derive(Clone)]
pub struct ConfigResolver {
    settings: Arc<dyn SettingsSource>,
    profiles: Arc<dyn LaunchProfileSource>,
    locator: Arc<dyn AdapterLocator>,
}

impl ConfigResolver {
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        profiles: Arc<dyn LaunchProfileSource>,
        locator: Arc<dyn AdapterLocator>,
    ) -> Self {
        Self {
            settings,
            profiles,
            locator,
        }
    }

    /// Fails before anything else when the adapter cannot be located.
    pub fn resolve(&self, params: &LaunchParams) -> Result<ResolvedConfig> {
        let adapter_path = self.locator.locate()?;
        Ok(resolve(
            params,
            self.settings.as_ref(),
            self.profiles.as_ref(),
            adapter_path,
        ))
    }
}

/// Layered VS Code style settings files. Earlier layers win.
#[derive(Debug, Clone, Default)]
pub struct JsonSettings {
    layers: Vec<Map<String, Value>>,
}

impl JsonSettings {
    pub fn from_value(value: Value) -> Self {
        let mut settings = Self::default();
        if let Value::Object(map) = value {
            settings.layers.push(map);
        }
        settings
    }

    /// Loads every readable file in `paths`; missing or malformed files are skipped.
    pub fn load(paths: &[PathBuf]) -> Self {
        let mut settings = Self::default();
        for path in paths {
            let Ok(text) = fs::read_to_string(path) else {
                continue;
            };
            match serde_json::from_str::<Value>(&strip_jsonc(&text)) {
                Ok(Value::Object(map)) => settings.layers.push(map),
                Ok(_) => tracing::warn!("Ignoring settings file {}: not an object", path.display()),
                Err(e) => tracing::warn!("Ignoring settings file {}: {e}", path.display()),
            }
        }
        settings
    }

    /// Workspace `.vscode/settings.json`, then the user's settings file.
    pub fn discover(workspace: &Path) -> Self {
        let mut paths = vec![workspace.join(".vscode").join("settings.json")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("Code").join("User").join("settings.json"));
        }
        Self::load(&paths)
    }
}

impl SettingsSource for JsonSettings {
    fn get(&self, key: &str) -> Option<Value> {
        let flat = format!("{SETTINGS_NAMESPACE}.{key}");
        self.layers.iter().find_map(|layer| {
            layer
                .get(&flat)
                .or_else(|| layer.get(SETTINGS_NAMESPACE).and_then(|ns| ns.get(key)))
                .filter(|v| !v.is_null())
                .cloned()
        })
    }
}

/// Profiles read from a project `launch.json`.
#[derive(Debug, Clone, Default)]
pub struct LaunchFile {
    profiles: Vec<LaunchProfile>,
}

impl LaunchFile {
    pub fn from_profiles(profiles: Vec<LaunchProfile>) -> Self {
        Self { profiles }
    }

    /// A missing file yields no profiles; entries that fail to parse are skipped.
    pub fn load(path: &Path) -> Self {
        let Ok(text) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<Value>(&strip_jsonc(&text)) {
            Ok(doc) => Self::from_document(&doc),
            Err(e) => {
                tracing::warn!("Ignoring launch file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn in_workspace(workspace: &Path) -> Self {
        Self::load(&workspace.join(".vscode").join("launch.json"))
    }

    fn from_document(doc: &Value) -> Self {
        let profiles = doc
            .get("configurations")
            .and_then(Value::as_array)
            .map(|configs| {
                configs
                    .iter()
                    .filter_map(|c| serde_json::from_value(c.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Self { profiles }
    }
}

impl LaunchProfileSource for LaunchFile {
    fn profiles(&self) -> Vec<LaunchProfile> {
        self.profiles.clone()
    }
}

/// Removes `//` and `/* */` comments and trailing commas outside string literals.
pub fn strip_jsonc(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            '}' | ']' => {
                let trimmed = out.trim_end_matches(char::is_whitespace).len();
                if out[..trimmed].ends_with(',') {
                    out.truncate(trimmed - 1);
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    out
}

/// Locates `out/phpDebug.js` of the installed `xdebug.php-debug` extension.
#[derive(Debug, Clone, Default)]
pub struct ExtensionAdapterLocator {
    override_path: Option<PathBuf>,
    search_roots: Vec<PathBuf>,
}

impl ExtensionAdapterLocator {
    pub fn new(override_path: Option<PathBuf>, search_roots: Vec<PathBuf>) -> Self {
        Self {
            override_path,
            search_roots,
        }
    }

    pub fn from_env() -> Self {
        let override_path = std::env::var(ADAPTER_PATH_ENV).ok().map(PathBuf::from);
        let search_roots = dirs::home_dir()
            .map(|home| {
                [".vscode", ".vscode-server", ".vscode-oss"]
                    .iter()
                    .map(|dir| home.join(dir).join("extensions"))
                    .collect()
            })
            .unwrap_or_default();
        Self::new(override_path, search_roots)
    }

    fn missing_extension() -> BridgeError {
        BridgeError::Precondition(format!(
            "{ADAPTER_EXTENSION_ID} extension is required but not installed. \
             Please install it from the VS Code marketplace."
        ))
    }
}

impl AdapterLocator for ExtensionAdapterLocator {
    fn locate(&self) -> Result<PathBuf> {
        if let Some(path) = &self.override_path {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(BridgeError::Precondition(format!(
                "{ADAPTER_PATH_ENV} points to '{}', which does not exist",
                path.display()
            )));
        }

        let mut candidates: Vec<(Option<semver::Version>, PathBuf)> = Vec::new();
        for root in &self.search_roots {
            let pattern = Path::new(&glob::Pattern::escape(&root.to_string_lossy()))
                .join(format!("{ADAPTER_EXTENSION_ID}-*"))
                .join("out")
                .join("phpDebug.js");
            let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
                continue;
            };
            for adapter in paths.flatten() {
                candidates.push((extension_version(&adapter), adapter));
            }
        }

        // Unparseable versions rank below every parseable one.
        candidates
            .into_iter()
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
            .map(|(_, path)| path)
            .ok_or_else(Self::missing_extension)
    }
}

/// Version from `<id>-<version>/out/phpDebug.js`.
fn extension_version(adapter: &Path) -> Option<semver::Version> {
    let dir = adapter.parent()?.parent()?.file_name()?.to_str()?;
    let version = dir.strip_prefix(ADAPTER_EXTENSION_ID)?.strip_prefix('-')?;
    semver::Version::parse(version).ok()
}

/// An adapter path known up front.
#[derive(Debug, Clone)]
pub struct StaticAdapterLocator(pub PathBuf);

impl AdapterLocator for StaticAdapterLocator {
    fn locate(&self) -> Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// Tuning knobs for [`crate::ProtocolBridge`].
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub debug_type: String,
    pub session_name: String,
    pub poll_interval: Duration,
    pub session_start_timeout: Duration,
    pub workspace_folder: Option<PathBuf>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            debug_type: DEBUG_TYPE.to_string(),
            session_name: SESSION_NAME.to_string(),
            poll_interval: Duration::from_millis(500),
            session_start_timeout: Duration::from_secs(30),
            workspace_folder: None,
        }
    }
}

impl BridgeOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let poll_interval = std::env::var("AGENTIC_DEBUG_POLL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let session_start_timeout = std::env::var("AGENTIC_DEBUG_START_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.session_start_timeout);

        let workspace_folder = std::env::var("AGENTIC_DEBUG_WORKSPACE")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok());

        Self {
            poll_interval,
            session_start_timeout,
            workspace_folder,
            ..defaults
        }
    }
}
