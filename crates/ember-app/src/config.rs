//! Settings from the config file and the command line.
//!
//! The file is JSON at `<config_dir>/ember/config.json`; every field is
//! optional. Command-line flags win over the file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use ember_pty::pty::default_shell;
use ember_pty::{LaunchConfig, SessionConfig, DEFAULT_SCROLLBACK_BYTES, DEFAULT_TERM};
use ember_scrollback::ring::MIN_CAPACITY;
use ember_scrollback::{Layout, OverflowPolicy, Viewport, DEFAULT_PLACEHOLDER};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Default)]
#[command(name = "ember")]
#[command(about = "Run a program on a pseudo-terminal with scrollback")]
#[command(version)]
pub struct Cli {
    /// Config file to read instead of the default location
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Scrollback size in bytes
    #[arg(long, value_name = "BYTES")]
    pub scrollback: Option<usize>,

    /// Discard new output instead of old output when the scrollback is full
    #[arg(long)]
    pub drop_newest: bool,

    /// TERM value for the child
    #[arg(long, value_name = "NAME")]
    pub term: Option<String>,

    /// Visible columns, overriding the window layout
    #[arg(long)]
    pub cols: Option<u16>,

    /// Visible rows, overriding the window layout
    #[arg(long)]
    pub rows: Option<u16>,

    /// Program and arguments to run (defaults to $SHELL)
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Errors from loading or validating settings.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid setting: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Window metrics in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub window_width: u32,
    pub window_height: u32,
    pub padding: u32,
    pub advance: u32,
    pub line_height: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            window_width: 1280,
            window_height: 720,
            padding: 12,
            advance: 8,
            line_height: 16,
        }
    }
}

/// All user-tunable settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Program and arguments for the child.
    pub command: Vec<String>,
    pub term: String,
    pub scrollback_bytes: usize,
    /// Evict old output on overflow; otherwise drop new output.
    pub overwrite_oldest: bool,
    pub poll_timeout_ms: u64,
    /// Lines moved by one scroll command.
    pub scroll_lines: usize,
    pub placeholder: char,
    pub layout: LayoutConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: vec![default_shell()],
            term: DEFAULT_TERM.to_string(),
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            overwrite_oldest: true,
            poll_timeout_ms: 100,
            scroll_lines: 3,
            placeholder: DEFAULT_PLACEHOLDER as char,
            layout: LayoutConfig::default(),
            cols: None,
            rows: None,
        }
    }
}

impl Config {
    /// `<config_dir>/ember/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ember").join("config.json"))
    }

    /// Load the file (if any), apply `cli` on top and validate the result.
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match find_config_file(cli.config.as_deref(), Self::default_path()) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(bytes) = cli.scrollback {
            self.scrollback_bytes = bytes;
        }
        if cli.drop_newest {
            self.overwrite_oldest = false;
        }
        if let Some(term) = &cli.term {
            self.term = term.clone();
        }
        if cli.cols.is_some() {
            self.cols = cli.cols;
        }
        if cli.rows.is_some() {
            self.rows = cli.rows;
        }
        if !cli.command.is_empty() {
            self.command = cli.command.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scrollback_bytes < MIN_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "scrollback_bytes must be at least {MIN_CAPACITY}, got {}",
                self.scrollback_bytes
            )));
        }
        if self.command.first().map_or(true, |program| program.is_empty()) {
            return Err(ConfigError::Invalid("command must not be empty".into()));
        }
        if self.term.is_empty() {
            return Err(ConfigError::Invalid("term must not be empty".into()));
        }
        if self.layout.advance == 0 || self.layout.line_height == 0 {
            return Err(ConfigError::Invalid(
                "layout advance and line_height must be positive".into(),
            ));
        }
        if !(self.placeholder.is_ascii_graphic() || self.placeholder == ' ') {
            return Err(ConfigError::Invalid(format!(
                "placeholder must be printable ASCII, got {:?}",
                self.placeholder
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout {
            padding: self.layout.padding,
            advance: self.layout.advance,
            line_height: self.layout.line_height,
        }
    }

    /// Visible text area: the window layout, with `cols`/`rows` overrides.
    pub fn viewport(&self) -> Viewport {
        let fitted = self
            .layout()
            .viewport(self.layout.window_width, self.layout.window_height);
        Viewport::new(
            self.cols.map_or(fitted.cols, usize::from),
            self.rows.map_or(fitted.rows, usize::from),
        )
    }

    pub fn placeholder_byte(&self) -> u8 {
        u8::try_from(self.placeholder).unwrap_or(DEFAULT_PLACEHOLDER)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn session_config(&self) -> SessionConfig {
        let viewport = self.viewport();
        let pty_dim = |cells: usize| u16::try_from(cells).unwrap_or(u16::MAX).max(1);
        SessionConfig {
            launch: LaunchConfig {
                argv: self.command.clone(),
                term: self.term.clone(),
                cols: pty_dim(viewport.cols),
                rows: pty_dim(viewport.rows),
            },
            scrollback_bytes: self.scrollback_bytes,
            policy: OverflowPolicy::from_overwrite_oldest(self.overwrite_oldest),
            poll_timeout: self.poll_timeout(),
            ..SessionConfig::default()
        }
    }
}

/// Pick the config file to read.
///
/// An explicit path that does not exist falls back to the default location
/// with a warning. No file at all means built-in defaults.
fn find_config_file(explicit: Option<&Path>, default: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        warn!(
            "config file {} not found, trying the default location",
            path.display()
        );
    }
    default.filter(|path| path.exists())
}
