use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::Deserialize;
use std::str::FromStr;

use crate::{store::StoreOptions, subject::SubjectOverrides};

pub const PROJECT_CONFIG_FILE_NAME: &str = "certstore.toml";
pub const HOME_CONFIG_RELATIVE_PATH: &str = ".certstore/config.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub subject: SubjectOverrides,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub dir: Option<PathBuf>,
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    /// Loads the explicit override when given, else the first of
    /// `./certstore.toml` and `~/.certstore/config.toml` that exists, else
    /// built-in defaults.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = override_path {
            return Self::from_path(path)
                .with_context(|| format!("load config override {}", path.display()));
        }

        let project_path = Path::new(".").join(PROJECT_CONFIG_FILE_NAME);
        if project_path.is_file() {
            return Self::from_path(&project_path)
                .with_context(|| format!("load project ./{PROJECT_CONFIG_FILE_NAME}"));
        }

        if let Some(home) = env::var_os("HOME") {
            let home_path = Path::new(&home).join(HOME_CONFIG_RELATIVE_PATH);
            if home_path.is_file() {
                return Self::from_path(&home_path)
                    .with_context(|| format!("load home ~/{HOME_CONFIG_RELATIVE_PATH}"));
            }
        }

        Ok(Self::default())
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

    /// Store options with command-line overrides taking precedence.
    pub fn store_options(&self, dir: Option<&Path>, name: Option<&str>) -> StoreOptions {
        StoreOptions {
            dir: dir.map(Path::to_path_buf).or_else(|| self.store.dir.clone()),
            name: name.map(str::to_owned).or_else(|| self.store.name.clone()),
            subject: self.subject.clone(),
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}
