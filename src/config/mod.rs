// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! The config file is JSON. It is loaded through figment so that individual
//! keys can be overridden from the environment with the
//! `LOG_COURIER_OVERRIDE_` prefix, `__` separating sections and `_` standing
//! in for spaces (`LOG_COURIER_OVERRIDE_GENERAL__SPOOL_SIZE=10`).
//!
//! Every section is checked for unknown keys so typos surface at startup.

pub mod parse;

use crate::codecs::{CodecConfig, CodecRegistry};
use crate::errors::{Error, Result};
use figment::Figment;
use figment::providers::{Env, Format, Json};
use parse::{deserialize_duration, populate, take_section};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_OVERRIDE_PREFIX: &str = "LOG_COURIER_OVERRIDE_";

/// Protocol limit on the size of a single payload.
pub const MAX_SPOOL_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;

const DEFAULT_HOST: &str = "localhost.localdomain";

const ROOT_KEYS: &[&str] = &["general", "network", "files", "includes", "admin", "stdin"];

const GENERAL_KEYS: &[&str] = &[
    "spool size",
    "spool max bytes",
    "spool timeout",
    "prospect interval",
    "persist dir",
    "line buffer bytes",
    "max line bytes",
    "global fields",
    "host",
];

const NETWORK_KEYS: &[&str] = &[
    "transport",
    "servers",
    "ssl certificate",
    "ssl key",
    "ssl ca",
    "timeout",
    "reconnect",
    "max pending payloads",
];

const STREAM_KEYS: &[&str] = &[
    "fields",
    "dead time",
    "add path field",
    "add offset field",
    "add host field",
    "add timezone field",
];

const ADMIN_KEYS: &[&str] = &["enabled", "listen address"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    #[serde(rename = "spool size")]
    pub spool_size: usize,
    #[serde(rename = "spool max bytes")]
    pub spool_max_bytes: u64,
    #[serde(rename = "spool timeout", deserialize_with = "deserialize_duration")]
    pub spool_timeout: Duration,
    #[serde(rename = "prospect interval", deserialize_with = "deserialize_duration")]
    pub prospect_interval: Duration,
    #[serde(rename = "persist dir")]
    pub persist_dir: PathBuf,
    #[serde(rename = "line buffer bytes")]
    pub line_buffer_bytes: usize,
    #[serde(rename = "max line bytes")]
    pub max_line_bytes: usize,
    #[serde(rename = "global fields")]
    pub global_fields: Map<String, Value>,
    pub host: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            spool_size: 1024,
            spool_max_bytes: 10 * 1024 * 1024,
            spool_timeout: Duration::from_secs(5),
            prospect_interval: Duration::from_secs(10),
            persist_dir: PathBuf::from("."),
            line_buffer_bytes: 16384,
            max_line_bytes: 1024 * 1024,
            global_fields: Map::new(),
            host: gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }
}

impl GeneralConfig {
    fn validate(&mut self) -> Result<()> {
        if self.spool_size == 0 {
            return Err(Error::Config(
                "/general/spool size must be greater than 0".to_string(),
            ));
        }
        if self.spool_max_bytes == 0 || self.spool_max_bytes > MAX_SPOOL_MAX_BYTES {
            return Err(Error::Config(
                "/general/spool max bytes can not be greater than 2 GiB".to_string(),
            ));
        }
        if self.line_buffer_bytes < 1 {
            return Err(Error::Config(
                "/general/line buffer bytes must be greater than 1".to_string(),
            ));
        }
        if self.max_line_bytes as u64 > self.spool_max_bytes {
            return Err(Error::Config(
                "/general/max line bytes can not be greater than /general/spool max bytes"
                    .to_string(),
            ));
        }
        if self.host.is_empty() {
            self.host = DEFAULT_HOST.to_string();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tls,
    Tcp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub transport: Transport,
    pub servers: Vec<String>,
    #[serde(rename = "ssl certificate")]
    pub ssl_certificate: Option<PathBuf>,
    #[serde(rename = "ssl key")]
    pub ssl_key: Option<PathBuf>,
    #[serde(rename = "ssl ca")]
    pub ssl_ca: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub reconnect: Duration,
    #[serde(rename = "max pending payloads")]
    pub max_pending_payloads: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Tls,
            servers: Vec::new(),
            ssl_certificate: None,
            ssl_key: None,
            ssl_ca: None,
            timeout: Duration::from_secs(15),
            reconnect: Duration::from_secs(1),
            max_pending_payloads: 10,
        }
    }
}

impl NetworkConfig {
    fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config(
                "No network servers were specified (/network/servers)".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server) {
                return Err(Error::Config(format!(
                    "The list of network servers must be unique: {} appears more than once",
                    server
                )));
            }
        }

        if self.ssl_certificate.is_some() != self.ssl_key.is_some() {
            return Err(Error::Config(
                "/network/ssl certificate and /network/ssl key must be specified together"
                    .to_string(),
            ));
        }

        if self.max_pending_payloads == 0 {
            return Err(Error::Config(
                "/network/max pending payloads must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options shared by every harvested stream, files and stdin alike.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub fields: Map<String, Value>,
    #[serde(rename = "dead time", deserialize_with = "deserialize_duration")]
    pub dead_time: Duration,
    #[serde(rename = "add path field")]
    pub add_path_field: bool,
    #[serde(rename = "add offset field")]
    pub add_offset_field: bool,
    #[serde(rename = "add host field")]
    pub add_host_field: bool,
    #[serde(rename = "add timezone field")]
    pub add_timezone_field: bool,
    #[serde(skip)]
    pub codecs: Vec<CodecConfig>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fields: Map::new(),
            dead_time: Duration::from_secs(3600),
            add_path_field: true,
            add_offset_field: true,
            add_host_field: true,
            add_timezone_field: false,
            codecs: vec![CodecConfig::Plain],
        }
    }
}

impl StreamConfig {
    fn parse(
        path: &str,
        mut options: Map<String, Value>,
        general: &GeneralConfig,
        registry: &CodecRegistry,
    ) -> Result<Self> {
        let codecs = options.remove("codecs");
        let mut config: StreamConfig = populate(path, options, STREAM_KEYS)?;

        config.codecs = match codecs {
            None | Some(Value::Null) => vec![CodecConfig::Plain],
            Some(Value::Array(entries)) if entries.is_empty() => vec![CodecConfig::Plain],
            Some(Value::Array(entries)) => entries
                .into_iter()
                .enumerate()
                .map(|(i, entry)| {
                    let codec_path = format!("{}codecs[{}]", path, i);
                    match entry {
                        Value::Object(map) => registry.parse(&codec_path, map, general),
                        _ => Err(Error::Config(format!("Option {} must be a hash", codec_path))),
                    }
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(Error::Config(format!(
                    "Option {}codecs must be an array",
                    path
                )));
            }
        };

        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct FileConfig {
    pub paths: Vec<String>,
    pub stream: StreamConfig,
}

impl FileConfig {
    fn parse(
        path: &str,
        mut options: Map<String, Value>,
        general: &GeneralConfig,
        registry: &CodecRegistry,
    ) -> Result<Self> {
        let paths: Vec<String> = match options.remove("paths") {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::Config(format!("{}paths: {}", path, e)))?,
            None => Vec::new(),
        };
        if paths.is_empty() {
            return Err(Error::Config(format!("No paths specified for {}", path)));
        }

        let stream = StreamConfig::parse(path, options, general, registry)?;
        Ok(Self { paths, stream })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    #[serde(rename = "listen address")]
    pub listen_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: "tcp:127.0.0.1:1234".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub files: Vec<FileConfig>,
    pub stdin: StreamConfig,
    pub admin: AdminConfig,
}

impl Config {
    /// Reads the config file, applies environment overrides and validates.
    pub fn load(path: &Path, registry: &CodecRegistry) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::Config(format!(
                "Failed to open config file: {}",
                path.display()
            )));
        }

        let env = Env::prefixed(ENV_OVERRIDE_PREFIX)
            .split("__")
            .map(|key| key.as_str().replace('_', " ").into());

        let root: Map<String, Value> = Figment::new()
            .merge(Json::file(path))
            .merge(env)
            .extract()
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_map(root, base, registry)
    }

    /// Parses a config held in memory. Relative include globs resolve against
    /// the current directory.
    pub fn from_json_str(json: &str, registry: &CodecRegistry) -> Result<Self> {
        let root: Map<String, Value> = serde_json::from_str(json)?;
        Self::from_map(root, Path::new("."), registry)
    }

    fn from_map(
        mut root: Map<String, Value>,
        base: &Path,
        registry: &CodecRegistry,
    ) -> Result<Self> {
        parse::check_unused("/", &root, ROOT_KEYS)?;

        let mut general: GeneralConfig =
            populate("/general/", take_section(&mut root, "/", "general")?, GENERAL_KEYS)?;
        general.validate()?;

        let network: NetworkConfig =
            populate("/network/", take_section(&mut root, "/", "network")?, NETWORK_KEYS)?;
        network.validate()?;

        let admin: AdminConfig =
            populate("/admin/", take_section(&mut root, "/", "admin")?, ADMIN_KEYS)?;

        let stdin = StreamConfig::parse(
            "/stdin/",
            take_section(&mut root, "/", "stdin")?,
            &general,
            registry,
        )?;

        let mut files = Vec::new();
        for (i, entry) in object_list(root.remove("files"), "/files")?
            .into_iter()
            .enumerate()
        {
            files.push(FileConfig::parse(
                &format!("/files[{}]/", i),
                entry,
                &general,
                registry,
            )?);
        }

        let includes: Vec<String> = match root.remove("includes") {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::Config(format!("/includes: {}", e)))?,
            None => Vec::new(),
        };
        for include in includes {
            files.extend(load_include(&include, base, &general, registry)?);
        }

        Ok(Self {
            general,
            network,
            files,
            stdin,
            admin,
        })
    }
}

fn object_list(value: Option<Value>, path: &str) -> Result<Vec<Map<String, Value>>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(entries)) => entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| match entry {
                Value::Object(map) => Ok(map),
                _ => Err(Error::Config(format!("Option {}[{}] must be a hash", path, i))),
            })
            .collect(),
        Some(_) => Err(Error::Config(format!("Option {} must be an array", path))),
    }
}

/// Each file matched by an include glob holds a JSON array of files entries.
fn load_include(
    pattern: &str,
    base: &Path,
    general: &GeneralConfig,
    registry: &CodecRegistry,
) -> Result<Vec<FileConfig>> {
    let pattern = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        base.join(pattern).to_string_lossy().into_owned()
    };

    let matches = glob::glob(&pattern).map_err(|e| Error::InvalidGlob(e.to_string()))?;

    let mut files = Vec::new();
    for entry in matches {
        let include = entry.map_err(|e| Error::Config(e.to_string()))?;
        let label = include.display().to_string();

        let content = std::fs::read_to_string(&include)?;
        let value: Value = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", label, e)))?;

        for (i, entry) in object_list(Some(value), &label)?.into_iter().enumerate() {
            files.push(FileConfig::parse(
                &format!("{}[{}]/", label, i),
                entry,
                general,
                registry,
            )?);
        }
    }
    Ok(files)
}
