use std::{
    env,
    ffi::OsStr,
    fmt, fs,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;
use url::Url;

pub const PROJECT_CONFIG_FILENAME: &str = "harreplay.toml";
pub const HOME_CONFIG_DIR: &str = ".harreplay";
pub const HOME_CONFIG_FILENAME: &str = "config.toml";
pub const DEFAULT_HOST_NAME: &str = "com.harreplay.host";
const DEFAULT_NEUTRAL_PAGE: &str = "loading.html";
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    pub storage: Option<StorageConfig>,
    pub admin: Option<AdminConfig>,
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source: Option<ConfigSource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default = "default_host_name")]
    pub name: String,
    #[serde(default = "default_host_description")]
    pub description: String,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: default_host_name(),
            description: default_host_description(),
            allowed_origins: Vec::new(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl HostConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayConfig {
    /// Absolute URL, or a path resolved against the extension origin given at launch.
    #[serde(default = "default_neutral_page")]
    pub neutral_page: String,
    /// Overrides the persisted global replay flag at startup.
    pub start_active: Option<bool>,
    #[serde(default = "default_pause_patterns")]
    pub pause_patterns: Vec<String>,
    #[serde(default = "default_ignored_url_prefixes")]
    pub ignored_url_prefixes: Vec<String>,
    pub detour_timeout_ms: Option<u64>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            neutral_page: default_neutral_page(),
            start_active: None,
            pause_patterns: default_pause_patterns(),
            ignored_url_prefixes: default_ignored_url_prefixes(),
            detour_timeout_ms: None,
        }
    }
}

impl ReplayConfig {
    pub fn detour_timeout(&self) -> Option<Duration> {
        self.detour_timeout_ms.map(Duration::from_millis)
    }

    pub fn neutral_page_url(&self, extension_origin: Option<&str>) -> anyhow::Result<String> {
        if let Ok(url) = Url::parse(&self.neutral_page) {
            return Ok(url.into());
        }
        let Some(origin) = extension_origin else {
            bail!(
                "`replay.neutral_page` (`{}`) is relative and no extension origin was given; \
                 launch from the browser or configure an absolute URL",
                self.neutral_page
            );
        };
        let origin =
            Url::parse(origin).with_context(|| format!("parse extension origin `{origin}`"))?;
        let url = origin
            .join(&self.neutral_page)
            .with_context(|| format!("resolve `{}` against {origin}", self.neutral_page))?;
        Ok(url.into())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    pub listen: SocketAddr,
    pub api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Override(PathBuf),
    Project(PathBuf),
    Home(PathBuf),
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            Self::Override(path) | Self::Project(path) | Self::Home(path) => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Override(path) => write!(f, "--config {}", path.display()),
            Self::Project(_) => write!(f, "project ./{PROJECT_CONFIG_FILENAME}"),
            Self::Home(path) => write!(f, "home {}", path.display()),
        }
    }
}

impl Config {
    /// Loads the explicit path when given, otherwise the first of `./harreplay.toml` and
    /// `$HOME/.harreplay/config.toml` that exists, otherwise built-in defaults.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        let source = match override_path {
            Some(path) => Some(ConfigSource::Override(path.to_path_buf())),
            None => {
                let cwd = env::current_dir().context("resolve current directory")?;
                let home = env::var_os("HOME").map(PathBuf::from);
                discover(&cwd, home.as_deref())
            }
        };

        let Some(source) = source else {
            return Ok(Self::default());
        };
        let mut config = Self::from_path(source.path())
            .with_context(|| format!("load config from {source}"))?;
        config.source = Some(source);
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn source(&self) -> Option<&ConfigSource> {
        self.source.as_ref()
    }

    fn validate(&self) -> anyhow::Result<()> {
        validate_host_name(&self.host.name)?;
        if self.host.command_timeout_ms == 0 {
            bail!("`host.command_timeout_ms` must be greater than zero");
        }
        if self.replay.pause_patterns.is_empty() {
            bail!("`replay.pause_patterns` must list at least one URL pattern");
        }
        if self.replay.detour_timeout_ms == Some(0) {
            bail!("`replay.detour_timeout_ms` must be greater than zero when set");
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

pub fn discover(cwd: &Path, home: Option<&Path>) -> Option<ConfigSource> {
    let project = cwd.join(PROJECT_CONFIG_FILENAME);
    if project.is_file() {
        return Some(ConfigSource::Project(project));
    }
    let home = home?.join(HOME_CONFIG_DIR).join(HOME_CONFIG_FILENAME);
    home.is_file().then_some(ConfigSource::Home(home))
}

/// Native messaging host names allow lowercase alphanumerics, `_` and `.`; dots may not
/// lead, trail, or repeat.
pub fn validate_host_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        bail!("`host.name` cannot be empty");
    }
    if !name
        .bytes()
        .all(|byte| matches!(byte, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.'))
    {
        bail!("`host.name` `{name}` may only contain lowercase letters, digits, `_` and `.`");
    }
    if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
        bail!("`host.name` `{name}` cannot start or end with `.` or contain `..`");
    }
    Ok(())
}

pub fn expand_tilde_path(path: &Path) -> anyhow::Result<PathBuf> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(component)) if component == OsStr::new("~") => {
            let home = env::var_os("HOME").ok_or_else(|| {
                anyhow::anyhow!("cannot expand `~` in {}: HOME is not set", path.display())
            })?;
            let mut expanded = PathBuf::from(home);
            for component in components {
                expanded.push(component.as_os_str());
            }
            Ok(expanded)
        }
        _ => Ok(path.to_path_buf()),
    }
}

fn default_host_name() -> String {
    DEFAULT_HOST_NAME.to_owned()
}

fn default_host_description() -> String {
    "HAR replay native messaging host".to_owned()
}

fn default_command_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}

fn default_neutral_page() -> String {
    DEFAULT_NEUTRAL_PAGE.to_owned()
}

fn default_pause_patterns() -> Vec<String> {
    vec!["*".to_owned()]
}

fn default_ignored_url_prefixes() -> Vec<String> {
    ["chrome://", "devtools://", "chrome-extension://"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}
