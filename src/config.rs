//! Container configuration: the three input sources and their merge.
//!
//! Precedence, highest first: command line, environment, JSON file, built-in
//! default. `rootfs_path` and `command` have no default.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_HOSTNAME: &str = "mun-os-container";
pub const MEMORY_LIMIT_ENV: &str = "MUN_OS_MEMORY_LIMIT";
pub const PIDS_LIMIT_ENV: &str = "MUN_OS_PIDS_LIMIT";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub memory_limit_mb: Option<u64>,
    pub pids_limit: Option<u64>,
}

/// Fully resolved description of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub hostname: String,
    pub rootfs_path: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub resources: Resources,
}

/// Values given as command line flags.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub hostname: Option<String>,
    pub rootfs_path: Option<PathBuf>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub memory_limit_mb: Option<u64>,
    pub pids_limit: Option<u64>,
}

/// Values taken from `MUN_OS_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub memory_limit_mb: Option<u64>,
    pub pids_limit: Option<u64>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(
            [MEMORY_LIMIT_ENV, PIDS_LIMIT_ENV]
                .into_iter()
                .filter_map(|key| std::env::var(key).ok().map(|value| (key, value))),
        )
    }

    /// Builds the overrides from an explicit set of variables. Unrelated keys are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut env = EnvOverrides::default();
        for (key, value) in vars {
            match key.as_ref() {
                MEMORY_LIMIT_ENV => {
                    env.memory_limit_mb = parse_positive(MEMORY_LIMIT_ENV, value.as_ref())?
                }
                PIDS_LIMIT_ENV => env.pids_limit = parse_positive(PIDS_LIMIT_ENV, value.as_ref())?,
                _ => {}
            }
        }
        Ok(env)
    }
}

/// The JSON configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub hostname: Option<String>,
    pub rootfs_path: Option<PathBuf>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub resources: FileResources,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileResources {
    pub memory_limit_mb: Option<i64>,
    #[serde(alias = "process_limit")]
    pub pids_limit: Option<i64>,
}

impl FileConfig {
    /// Reads and parses a config file. A relative `rootfs_path` is resolved
    /// against the directory holding the file.
    pub fn load(path: &Path) -> Result<Self> {
        let path = std::path::absolute(path)
            .map_err(|e| Error::config(format!("invalid config path {:?}: {}", path, e)))?;
        let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::config(format!("config file does not exist: {}", path.display()))
            }
            _ => Error::config(format!("cannot read {}: {}", path.display(), e)),
        })?;
        let base = path.parent().unwrap_or(Path::new("/"));
        Self::parse(&text, base).map_err(|e| match e {
            Error::Config(message) => Error::config(format!("{}: {}", path.display(), message)),
            other => other,
        })
    }

    pub fn parse(text: &str, base_dir: &Path) -> Result<Self> {
        let mut config: FileConfig = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("malformed JSON config: {}", e)))?;
        if let Some(rootfs) = config.rootfs_path.take() {
            config.rootfs_path = Some(if rootfs.is_relative() && !rootfs.as_os_str().is_empty() {
                base_dir.join(rootfs)
            } else {
                rootfs
            });
        }
        Ok(config)
    }
}

/// Merges the three sources into one spec.
pub fn resolve(
    cli: &CliOverrides,
    env: &EnvOverrides,
    file: Option<&FileConfig>,
) -> Result<ContainerSpec> {
    let default_file = FileConfig::default();
    let file = file.unwrap_or(&default_file);

    let hostname = non_empty(cli.hostname.as_deref())
        .or_else(|| non_empty(file.hostname.as_deref()))
        .unwrap_or(DEFAULT_HOSTNAME)
        .to_string();

    let rootfs_path = cli
        .rootfs_path
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty())
        .or_else(|| {
            file.rootfs_path
                .as_ref()
                .filter(|p| !p.as_os_str().is_empty())
        })
        .cloned()
        .ok_or_else(|| Error::config("'rootfs_path' is required (use --rootfs or a config file)"))?;
    if !rootfs_path.is_absolute() {
        return Err(Error::config(format!(
            "rootfs_path must be absolute, got {}",
            rootfs_path.display()
        )));
    }

    // a command on the command line replaces the file's command and arguments
    let (command, args) = match non_empty(cli.command.as_deref()) {
        Some(command) => (command.to_string(), cli.args.clone()),
        None => {
            let command = non_empty(file.command.as_deref())
                .ok_or_else(|| Error::config("'command' is required"))?;
            (command.to_string(), file.args.clone().unwrap_or_default())
        }
    };

    let resources = Resources {
        memory_limit_mb: positive("--memory", cli.memory_limit_mb)?
            .or(env.memory_limit_mb)
            .or(from_file(
                "resources.memory_limit_mb",
                file.resources.memory_limit_mb,
            )?),
        pids_limit: positive("--pids", cli.pids_limit)?
            .or(env.pids_limit)
            .or(from_file("resources.pids_limit", file.resources.pids_limit)?),
    };

    Ok(ContainerSpec {
        hostname,
        rootfs_path,
        command,
        args,
        resources,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_positive(source: &str, value: &str) -> Result<Option<u64>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(Error::config(format!(
            "{} must be a positive integer, got '{}'",
            source, value
        ))),
    }
}

fn positive(source: &str, value: Option<u64>) -> Result<Option<u64>> {
    match value {
        Some(0) => Err(Error::config(format!(
            "{} must be a positive integer, got '0'",
            source
        ))),
        other => Ok(other),
    }
}

fn from_file(source: &str, value: Option<i64>) -> Result<Option<u64>> {
    match value {
        None => Ok(None),
        Some(n) if n > 0 => Ok(Some(n as u64)),
        Some(n) => Err(Error::config(format!(
            "{} must be a positive integer, got '{}'",
            source, n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRECEDENCE_JSON: &str = r#"{
        "hostname": "precedence-test",
        "rootfs_path": "/srv/rootfs",
        "command": "/bin/dd",
        "args": ["if=/dev/zero", "of=/dev/null", "bs=1M", "count=70"],
        "resources": { "memory_limit_mb": 128 }
    }"#;

    fn file(json: &str) -> FileConfig {
        FileConfig::parse(json, Path::new("/configs")).unwrap()
    }

    #[test]
    fn test_cli_beats_env_beats_file() {
        let file = file(PRECEDENCE_JSON);
        let env = EnvOverrides::from_vars([(MEMORY_LIMIT_ENV, "64")]).unwrap();
        let cli = CliOverrides {
            memory_limit_mb: Some(32),
            ..Default::default()
        };

        let spec = resolve(&cli, &env, Some(&file)).unwrap();
        assert_eq!(spec.resources.memory_limit_mb, Some(32));

        let spec = resolve(&CliOverrides::default(), &env, Some(&file)).unwrap();
        assert_eq!(spec.resources.memory_limit_mb, Some(64));

        let spec = resolve(&CliOverrides::default(), &EnvOverrides::default(), Some(&file)).unwrap();
        assert_eq!(spec.resources.memory_limit_mb, Some(128));
        assert_eq!(spec.resources.pids_limit, None);
    }

    #[test]
    fn test_pids_precedence() {
        let file = file(r#"{"rootfs_path": "/r", "command": "sh", "resources": {"pids_limit": 50}}"#);
        let env = EnvOverrides::from_vars([(PIDS_LIMIT_ENV, "20")]).unwrap();
        let cli = CliOverrides {
            pids_limit: Some(10),
            ..Default::default()
        };
        assert_eq!(
            resolve(&cli, &env, Some(&file)).unwrap().resources.pids_limit,
            Some(10)
        );
        assert_eq!(
            resolve(&CliOverrides::default(), &env, Some(&file))
                .unwrap()
                .resources
                .pids_limit,
            Some(20)
        );
    }

    #[test]
    fn test_file_fields() {
        let spec = resolve(
            &CliOverrides::default(),
            &EnvOverrides::default(),
            Some(&file(PRECEDENCE_JSON)),
        )
        .unwrap();
        assert_eq!(spec.hostname, "precedence-test");
        assert_eq!(spec.rootfs_path, PathBuf::from("/srv/rootfs"));
        assert_eq!(spec.command, "/bin/dd");
        assert_eq!(spec.args.len(), 4);
    }

    #[test]
    fn test_cli_only() {
        let cli = CliOverrides {
            rootfs_path: Some(PathBuf::from("/srv/rootfs")),
            command: Some("/bin/echo".into()),
            args: vec!["Hello Foreground".into()],
            ..Default::default()
        };
        let spec = resolve(&cli, &EnvOverrides::default(), None).unwrap();
        assert_eq!(spec.hostname, DEFAULT_HOSTNAME);
        assert_eq!(spec.command, "/bin/echo");
        assert_eq!(spec.args, vec!["Hello Foreground".to_string()]);
        assert_eq!(spec.resources, Resources::default());
    }

    #[test]
    fn test_cli_command_replaces_file_args() {
        let cli = CliOverrides {
            command: Some("/bin/sh".into()),
            ..Default::default()
        };
        let spec = resolve(&cli, &EnvOverrides::default(), Some(&file(PRECEDENCE_JSON))).unwrap();
        assert_eq!(spec.command, "/bin/sh");
        assert!(spec.args.is_empty());
    }

    #[test]
    fn test_missing_required_fields() {
        let err = resolve(&CliOverrides::default(), &EnvOverrides::default(), None).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("rootfs_path")));

        let no_command = file(r#"{"rootfs_path": "/srv/rootfs", "command": ""}"#);
        let err = resolve(&CliOverrides::default(), &EnvOverrides::default(), Some(&no_command))
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("command")));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            FileConfig::parse("{ \"rootfs_path\": ", Path::new("/")),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            FileConfig::parse(r#"{"args": "not-a-list"}"#, Path::new("/")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(EnvOverrides::from_vars([(MEMORY_LIMIT_ENV, "lots")]).is_err());
        assert!(EnvOverrides::from_vars([(MEMORY_LIMIT_ENV, "0")]).is_err());
        assert!(EnvOverrides::from_vars([(PIDS_LIMIT_ENV, "-3")]).is_err());
        assert_eq!(
            EnvOverrides::from_vars([(MEMORY_LIMIT_ENV, "")]).unwrap(),
            EnvOverrides::default()
        );

        let negative = file(r#"{"rootfs_path": "/r", "command": "sh", "resources": {"memory_limit_mb": -1}}"#);
        assert!(resolve(&CliOverrides::default(), &EnvOverrides::default(), Some(&negative)).is_err());

        let cli = CliOverrides {
            rootfs_path: Some("/r".into()),
            command: Some("sh".into()),
            pids_limit: Some(0),
            ..Default::default()
        };
        assert!(resolve(&cli, &EnvOverrides::default(), None).is_err());
    }

    #[test]
    fn test_process_limit_alias() {
        let config = file(r#"{"rootfs_path": "/r", "command": "sh", "resources": {"process_limit": 7}}"#);
        assert_eq!(config.resources.pids_limit, Some(7));
    }

    #[test]
    fn test_relative_rootfs_uses_config_dir() {
        let config = file(r#"{"rootfs_path": "../rootfs", "command": "sh"}"#);
        assert_eq!(config.rootfs_path, Some(PathBuf::from("/configs/../rootfs")));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileConfig::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bg.json");
        std::fs::write(&path, r#"{"rootfs_path": "rootfs", "command": "/bin/sleep", "args": ["10"]}"#)
            .unwrap();
        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.rootfs_path, Some(dir.path().join("rootfs")));
        assert_eq!(config.args, Some(vec!["10".to_string()]));
    }
}
