use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Project names double as subdomain labels, so they follow DNS label rules.
static NAME_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[a-z][a-z0-9-]*$").expect("valid name pattern"));

/// Maximum length of a project name or alias (DNS label limit)
const MAX_LABEL_LEN: usize = 63;

/// A duration expressed in milliseconds.
///
/// In YAML this is either a bare integer (milliseconds) or a string of the
/// form `<int><unit>` where unit is one of `ms`, `s`, `m`, `h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DurationMs(pub u64);

impl DurationMs {
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn to_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }
}

/// Parse the duration grammar: `^\d+(ms|s|m|h)?$`, no unit means milliseconds.
pub fn parse_duration(input: &str) -> anyhow::Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    if digits.is_empty() {
        anyhow::bail!("invalid duration '{}': expected digits", input);
    }

    let value: u64 = digits
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid duration '{}': {}", input, e))?;

    let factor = match unit {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!("invalid duration '{}': unknown unit '{}'", input, other),
    };

    value
        .checked_mul(factor)
        .ok_or_else(|| anyhow::anyhow!("duration '{}' overflows", input))
}

impl<'de> Deserialize<'de> for DurationMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(DurationMs(ms)),
            Raw::Text(s) => parse_duration(&s).map(DurationMs).map_err(de::Error::custom),
        }
    }
}

/// Global configuration for the daemon
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Daemon-wide settings
    #[serde(default)]
    pub settings: Settings,

    /// Registered projects, keyed by name
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Port the proxy listens on (default: 80)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Default idle timeout when a project has no override and the dynamic
    /// algorithm is disabled
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: DurationMs,

    /// How long a cold start may take before it is abandoned
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: DurationMs,

    /// Inclusive range of ports handed to dev servers
    #[serde(default = "default_port_range")]
    pub port_range: [u16; 2],

    /// Cadence of the idle scanner
    #[serde(default = "default_scan_interval")]
    pub scan_interval: DurationMs,

    /// Compute idle timeouts from cold-start cost and traffic density
    #[serde(default = "default_dynamic_timeout")]
    pub dynamic_timeout: bool,

    /// Lower clamp for dynamically computed timeouts
    #[serde(default = "default_min_timeout")]
    pub min_timeout: DurationMs,

    /// Upper clamp for dynamically computed timeouts
    #[serde(default = "default_max_timeout")]
    pub max_timeout: DurationMs,

    /// Shell used to interpret `start_cmd` (default: sh)
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Maximum time to wait for an upstream response head
    #[serde(default = "default_request_timeout")]
    pub request_timeout: DurationMs,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            idle_timeout: default_idle_timeout(),
            startup_timeout: default_startup_timeout(),
            port_range: default_port_range(),
            scan_interval: default_scan_interval(),
            dynamic_timeout: default_dynamic_timeout(),
            min_timeout: default_min_timeout(),
            max_timeout: default_max_timeout(),
            shell: default_shell(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Settings {
    pub fn port_min(&self) -> u16 {
        self.port_range[0]
    }

    pub fn port_max(&self) -> u16 {
        self.port_range[1]
    }
}

/// Configuration for a single project
///
/// # Security Warning
///
/// `start_cmd` is handed to a shell verbatim. Config files must be protected
/// with appropriate file permissions; a writable config means arbitrary code
/// execution with the daemon's privileges.
#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    /// Project name; must match the map key and `^[a-z][a-z0-9-]*$`
    pub name: String,

    /// Working directory for the dev server; `~` expands to $HOME
    pub cwd: String,

    /// Shell command line that starts the dev server
    pub start_cmd: String,

    /// Idle timeout override; `0` disables auto-stop entirely, absent means
    /// use the dynamic timeout (or the global default when dynamic is off)
    #[serde(default)]
    pub idle_timeout: Option<DurationMs>,

    /// Exempt from the idle scanner; the proxy still routes to it
    #[serde(default)]
    pub disabled: bool,

    /// Additional subdomain labels routing to this project
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl ProjectConfig {
    /// Working directory with `~` expanded
    pub fn working_dir(&self) -> PathBuf {
        expand_tilde(&self.cwd)
    }

    /// Validate one project entry, pushing every problem found
    fn validate(&self, key: &str, errors: &mut Vec<String>) {
        if self.name != key {
            errors.push(format!(
                "project '{}': 'name' field is '{}', must match its key",
                key, self.name
            ));
        }
        if !is_valid_label(&self.name) {
            errors.push(format!(
                "project '{}': name must match ^[a-z][a-z0-9-]*$ and be at most {} chars",
                key, MAX_LABEL_LEN
            ));
        }
        if self.cwd.trim().is_empty() {
            errors.push(format!("project '{}': 'cwd' must not be empty", key));
        }
        if self.start_cmd.trim().is_empty() {
            errors.push(format!("project '{}': 'start_cmd' must not be empty", key));
        }
        for alias in &self.aliases {
            if !is_valid_label(alias) {
                errors.push(format!(
                    "project '{}': alias '{}' must match ^[a-z][a-z0-9-]*$",
                    key, alias
                ));
            }
        }
    }
}

fn is_valid_label(label: &str) -> bool {
    label.len() <= MAX_LABEL_LEN && NAME_PATTERN.is_match(label)
}

/// Expand a leading `~` or `~/` to the user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("failed to read {}: {}", path.as_ref().display(), e)
        })?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole document, reporting every error at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.settings.port_min() > self.settings.port_max() {
            errors.push(format!(
                "settings: port_range [{}, {}] is inverted",
                self.settings.port_min(),
                self.settings.port_max()
            ));
        }
        if self.settings.min_timeout > self.settings.max_timeout {
            errors.push("settings: min_timeout exceeds max_timeout".to_string());
        }

        for (key, project) in &self.projects {
            project.validate(key, &mut errors);
        }

        // Aliases must not collide with each other or with project names
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (key, project) in &self.projects {
            let key = key.as_str();
            for label in std::iter::once(project.name.as_str())
                .chain(project.aliases.iter().map(|a| a.as_str()))
            {
                if let Some(other) = seen.insert(label, key) {
                    if other != key {
                        errors.push(format!(
                            "label '{}' is claimed by both '{}' and '{}'",
                            label, other, key
                        ));
                    }
                }
            }
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Map from lowercase subdomain label (name or alias) to canonical project name
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    labels: HashMap<String, String>,
}

impl RoutingTable {
    pub fn build(config: &Config) -> Self {
        let mut labels = HashMap::new();
        for project in config.projects.values() {
            labels.insert(project.name.to_lowercase(), project.name.clone());
            for alias in &project.aliases {
                labels.insert(alias.to_lowercase(), project.name.clone());
            }
        }
        Self { labels }
    }

    /// Resolve a label to the canonical project name
    pub fn resolve(&self, label: &str) -> Option<&str> {
        self.labels.get(label).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// An immutable, atomically published view of the configuration.
///
/// The watcher builds a fresh snapshot on every successful reload; consumers
/// clone the `Arc` out of a watch channel and never observe a torn view.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub settings: Settings,
    pub projects: HashMap<String, ProjectConfig>,
    pub routing: RoutingTable,
}

impl ConfigSnapshot {
    pub fn from_config(config: Config) -> Self {
        let routing = RoutingTable::build(&config);
        Self {
            settings: config.settings,
            projects: config.projects,
            routing,
        }
    }

    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.get(name)
    }
}

/// Default config file location: `~/.config/lazydev/config.yaml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lazydev")
        .join("config.yaml")
}

/// State directory: `$LAZYDEV_STATE_DIR` or `~/.local/share/lazydev`
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LAZYDEV_STATE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lazydev")
}

// Default value functions
fn default_proxy_port() -> u16 {
    80
}

fn default_idle_timeout() -> DurationMs {
    DurationMs(600_000) // 10 minutes
}

fn default_startup_timeout() -> DurationMs {
    DurationMs(30_000)
}

fn default_port_range() -> [u16; 2] {
    [4000, 4999]
}

fn default_scan_interval() -> DurationMs {
    DurationMs(30_000)
}

fn default_dynamic_timeout() -> bool {
    true
}

fn default_min_timeout() -> DurationMs {
    DurationMs(120_000) // 2 minutes
}

fn default_max_timeout() -> DurationMs {
    DurationMs(1_800_000) // 30 minutes
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_request_timeout() -> DurationMs {
    DurationMs(255_000)
}
