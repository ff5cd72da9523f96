use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

static DEFAULT_SSH_PORT: u16 = 22;
static DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // local cache root, created on load when missing
    pub datadir: Option<PathBuf>,
    pub ssh: SshConfig,
    #[serde(default)]
    pub mount: MountConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub login: String,
    /// Private key file; ssh-agent is used when neither key nor password is set.
    pub key: Option<PathBuf>,
    pub password: Option<String>,
    /// Remote root every virtual path is joined to. Empty means the login's
    /// SFTP home directory.
    #[serde(default)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MountConfig {
    #[serde(default)]
    pub allow_other: bool,
    #[serde(default)]
    pub nonempty: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Config {
    /// Cache root; `load_config` guarantees it is present.
    pub fn cache_root(&self) -> &Path {
        self.datadir.as_deref().unwrap_or(Path::new(""))
    }

    /// Anchor relative local paths (cache root, key file, log file) at
    /// `base`. The daemon changes its working directory to `/`, so relative
    /// paths have to be settled before it detaches.
    pub fn anchor_paths(&mut self, base: &Path) {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(dir) = self.datadir.as_mut() {
            anchor(dir);
        }
        if let Some(key) = self.ssh.key.as_mut() {
            anchor(key);
        }
        if let Some(file) = self.log.file.as_mut() {
            anchor(file);
        }
    }

    fn validate(&self) -> Result<()> {
        match &self.datadir {
            None => bail!("datadir has not been found in config"),
            Some(dir) if dir.as_os_str().is_empty() => bail!("datadir must not be empty"),
            Some(_) => {}
        }
        if self.ssh.host.is_empty() {
            bail!("ssh.host must not be empty");
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}

/// Read, validate and prepare the configuration: relative local paths are
/// anchored at the working directory and the cache root is created when it
/// does not exist yet.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let mut cfg = parse_config(&content)?;
    let cwd = std::env::current_dir().context("Failed to read the working directory")?;
    cfg.anchor_paths(&cwd);
    fs::create_dir_all(cfg.cache_root()).with_context(|| {
        format!("Failed to create datadir at {:?}", cfg.cache_root())
    })?;
    Ok(cfg)
}
