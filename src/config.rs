// cmk-agents - Checkmk integrations for REST APIs
// Copyright (C) 2026 The cmk-agents contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const DEFAULT_XIQ_BASE_URL: &str = "https://api.extremecloudiq.com";
pub const DEFAULT_RAPID_SERVER: &str = "https://localhost:3001";
pub const DEFAULT_RAPID_DATABASE: &str = "DB1";
pub const DEFAULT_RAPID_NODE: &str = "PythonRestClient";
pub const DEFAULT_TOKEN_FILE: &str = "xiq_api_token.txt";
pub const DEFAULT_REDIS_HOST: &str = "localhost";
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_REDIS_AP_DB: i64 = 3;
pub const DEFAULT_REDIS_LOCATIONS_DB: i64 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_MODEM_NO: u32 = 2;

// Later layers win: `overlay!(base, top, a, b)` keeps `top.a` when set.
macro_rules! overlay {
    ($base:expr, $top:expr; $($field:ident),+ $(,)?) => {{
        let base = $base;
        let top = $top;
        Self { $($field: top.$field.or(base.$field)),+ }
    }};
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rapid: Option<RapidConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xiq: Option<XiqConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmware: Option<VmwareConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smseagle: Option<SmsEagleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkmk: Option<CheckmkConfig>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct RapidConfig {
    pub server: Option<String>,
    pub api_key: Option<String>,
    pub database: Option<String>,
    pub node: Option<String>,
    pub verify_tls: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct XiqConfig {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token_file: Option<PathBuf>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ap_db: Option<i64>,
    pub locations_db: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct VmwareConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct SmsEagleConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub url2: Option<String>,
    pub token2: Option<String>,
    pub modem_no: Option<u32>,
    pub verify_tls: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct CheckmkConfig {
    pub api_url: Option<String>,
    pub api_user: Option<String>,
    pub api_key: Option<String>,
}

impl RapidConfig {
    fn overlay(base: Self, top: Self) -> Self {
        overlay!(base, top; server, api_key, database, node, verify_tls)
    }
}

impl XiqConfig {
    fn overlay(base: Self, top: Self) -> Self {
        overlay!(base, top; base_url, username, password, token_file, page_size)
    }
}

impl RedisConfig {
    fn overlay(base: Self, top: Self) -> Self {
        overlay!(base, top; host, port, ap_db, locations_db)
    }
}

impl VmwareConfig {
    fn overlay(base: Self, top: Self) -> Self {
        overlay!(base, top; username, password, port)
    }
}

impl SmsEagleConfig {
    fn overlay(base: Self, top: Self) -> Self {
        overlay!(base, top; url, token, url2, token2, modem_no, verify_tls)
    }
}

impl CheckmkConfig {
    fn overlay(base: Self, top: Self) -> Self {
        overlay!(base, top; api_url, api_user, api_key)
    }
}

fn overlay_section<T: Default>(base: Option<T>, top: Option<T>, f: fn(T, T) -> T) -> Option<T> {
    match (base, top) {
        (Some(b), Some(t)) => Some(f(b, t)),
        (Some(b), None) => Some(b),
        (None, Some(t)) => Some(t),
        (None, None) => None,
    }
}

impl Config {
    /// Returns a copy with every secret replaced by `*****`.
    pub fn masked(&self) -> Config {
        fn mask(value: &mut Option<String>) {
            if value.is_some() {
                *value = Some("*****".into());
            }
        }
        let mut masked = self.clone();
        if let Some(rapid) = masked.rapid.as_mut() {
            mask(&mut rapid.api_key);
        }
        if let Some(xiq) = masked.xiq.as_mut() {
            mask(&mut xiq.password);
        }
        if let Some(vmware) = masked.vmware.as_mut() {
            mask(&mut vmware.password);
        }
        if let Some(sms) = masked.smseagle.as_mut() {
            mask(&mut sms.token);
            mask(&mut sms.token2);
        }
        if let Some(cmk) = masked.checkmk.as_mut() {
            mask(&mut cmk.api_key);
        }
        masked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    User,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not locate a writable config directory for the current user")]
    MissingConfigDir,
    #[error(
        "RAPID API key is required; pass --api-key, set RAPID_API_KEY or run `cmk-agents configure --rapid-api-key <key>`"
    )]
    MissingRapidKey,
    #[error(
        "XIQ credentials are required to request a token; set XIQ_USERNAME/XIQ_PASSWORD or pass --username/--password"
    )]
    MissingXiqCredentials,
    #[error("SMSEagle url and access token are required; pass --url/--token or configure the smseagle section")]
    MissingSmsEagle,
    #[error("{file} already exists; remove it first or pass --force")]
    EnvFileExists { file: String },
}

#[derive(Debug, Clone)]
pub struct RapidSettings {
    pub server: String,
    pub api_key: String,
    pub database: String,
    pub node: String,
    pub verify_tls: bool,
}

#[derive(Debug, Clone)]
pub struct XiqSettings {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token_file: PathBuf,
    pub page_size: u32,
}

impl XiqSettings {
    pub fn credentials(&self) -> Result<(String, String)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Ok((u.clone(), p.clone())),
            _ => Err(ConfigError::MissingXiqCredentials.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub ap_db: i64,
    pub locations_db: i64,
}

impl RedisSettings {
    pub fn url(&self, db: i64) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, db)
    }
}

#[derive(Debug, Clone)]
pub struct SmsEagleSettings {
    pub url: String,
    pub token: String,
    pub fallback: Option<(String, String)>,
    pub modem_no: u32,
    pub verify_tls: bool,
}

pub fn config_path(scope: Scope, cwd: &Path) -> Result<PathBuf> {
    match scope {
        Scope::Local => Ok(cwd.join(".cmk-agents.yaml")),
        Scope::User => {
            if let Ok(custom) = env::var("CMK_AGENTS_CONFIG_DIR") {
                return Ok(PathBuf::from(custom).join("config.yaml"));
            }
            let base = config_dir().ok_or(ConfigError::MissingConfigDir)?;
            Ok(base.join("cmk-agents").join("config.yaml"))
        }
    }
}

/// Merged user and local files, then environment variables on top.
pub fn load(cwd: &Path) -> Result<Config> {
    let user = read_if_exists(&config_path(Scope::User, cwd)?)?.unwrap_or_default();
    let local = read_if_exists(&config_path(Scope::Local, cwd)?)?.unwrap_or_default();
    Ok(merge(merge(user, local), from_env()))
}

pub fn load_scope(scope: Scope, cwd: &Path) -> Result<Config> {
    Ok(read_if_exists(&config_path(scope, cwd)?)?.unwrap_or_default())
}

pub fn save(scope: Scope, config: &Config, cwd: &Path) -> Result<PathBuf> {
    let path = config_path(scope, cwd)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
    }
    let serialized = serde_yaml::to_string(config).context("serializing config")?;
    fs::write(&path, serialized).with_context(|| format!("writing {:?}", path))?;
    Ok(path)
}

pub fn resolve_rapid(cwd: &Path, overrides: RapidConfig) -> Result<RapidSettings> {
    let merged = load(cwd)?;
    let rapid = RapidConfig::overlay(merged.rapid.unwrap_or_default(), overrides);

    let api_key = rapid
        .api_key
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .ok_or(ConfigError::MissingRapidKey)?;

    Ok(RapidSettings {
        server: rapid
            .server
            .unwrap_or_else(|| DEFAULT_RAPID_SERVER.to_string()),
        api_key,
        database: rapid
            .database
            .unwrap_or_else(|| DEFAULT_RAPID_DATABASE.to_string()),
        node: rapid.node.unwrap_or_else(|| DEFAULT_RAPID_NODE.to_string()),
        verify_tls: rapid.verify_tls.unwrap_or(true),
    })
}

pub fn resolve_xiq(cwd: &Path, overrides: XiqConfig) -> Result<XiqSettings> {
    let merged = load(cwd)?;
    let xiq = XiqConfig::overlay(merged.xiq.unwrap_or_default(), overrides);

    Ok(XiqSettings {
        base_url: xiq
            .base_url
            .unwrap_or_else(|| DEFAULT_XIQ_BASE_URL.to_string()),
        username: xiq.username,
        password: xiq.password,
        token_file: xiq
            .token_file
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_FILE)),
        page_size: xiq.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
    })
}

pub fn resolve_redis(cwd: &Path, overrides: RedisConfig) -> Result<RedisSettings> {
    let merged = load(cwd)?;
    let redis = RedisConfig::overlay(merged.redis.unwrap_or_default(), overrides);

    Ok(RedisSettings {
        host: redis
            .host
            .unwrap_or_else(|| DEFAULT_REDIS_HOST.to_string()),
        port: redis.port.unwrap_or(DEFAULT_REDIS_PORT),
        ap_db: redis.ap_db.unwrap_or(DEFAULT_REDIS_AP_DB),
        locations_db: redis.locations_db.unwrap_or(DEFAULT_REDIS_LOCATIONS_DB),
    })
}

pub fn resolve_vmware(cwd: &Path, overrides: VmwareConfig) -> Result<VmwareConfig> {
    let merged = load(cwd)?;
    Ok(VmwareConfig::overlay(
        merged.vmware.unwrap_or_default(),
        overrides,
    ))
}

pub fn resolve_smseagle(cwd: &Path, overrides: SmsEagleConfig) -> Result<SmsEagleSettings> {
    let merged = load(cwd)?;
    let sms = SmsEagleConfig::overlay(merged.smseagle.unwrap_or_default(), overrides);

    let url = sms.url.ok_or(ConfigError::MissingSmsEagle)?;
    let token = sms.token.ok_or(ConfigError::MissingSmsEagle)?;
    let fallback = match (sms.url2, sms.token2) {
        (Some(u), Some(t)) => Some((u, t)),
        (Some(u), None) => Some((u, token.clone())),
        _ => None,
    };

    Ok(SmsEagleSettings {
        url,
        token,
        fallback,
        modem_no: sms.modem_no.unwrap_or(DEFAULT_MODEM_NO),
        verify_tls: sms.verify_tls.unwrap_or(true),
    })
}

pub fn resolve_checkmk(cwd: &Path, overrides: CheckmkConfig) -> Result<CheckmkConfig> {
    let merged = load(cwd)?;
    Ok(CheckmkConfig::overlay(
        merged.checkmk.unwrap_or_default(),
        overrides,
    ))
}

/// Writes a `.env` template for the XIQ/Redis tools.
pub fn write_env_template(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(ConfigError::EnvFileExists {
            file: path.display().to_string(),
        }
        .into());
    }
    let template = format!(
        "XIQ_BASE_URL={DEFAULT_XIQ_BASE_URL}\n\
         XIQ_USERNAME=\n\
         XIQ_PASSWORD=\n\
         XIQ_TOKEN_FILE={DEFAULT_TOKEN_FILE}\n\
         REDIS_HOST={DEFAULT_REDIS_HOST}\n\
         REDIS_PORT={DEFAULT_REDIS_PORT}\n\
         REDIS_AP_DB={DEFAULT_REDIS_AP_DB}\n\
         REDIS_LOCATIONS_DB={DEFAULT_REDIS_LOCATIONS_DB}\n\
         PAGE_SIZE={DEFAULT_PAGE_SIZE}\n"
    );
    fs::write(path, template).with_context(|| format!("writing {:?}", path))
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {name}={raw}: not a valid value");
            None
        }
    }
}

fn from_env() -> Config {
    let rapid = RapidConfig {
        api_key: env_string("RAPID_API_KEY").or_else(|| env_string("API_KEY")),
        ..Default::default()
    };
    let xiq = XiqConfig {
        base_url: env_string("XIQ_BASE_URL"),
        username: env_string("XIQ_USERNAME"),
        password: env_string("XIQ_PASSWORD"),
        token_file: env_string("XIQ_TOKEN_FILE").map(PathBuf::from),
        page_size: env_parsed("PAGE_SIZE"),
    };
    let redis = RedisConfig {
        host: env_string("REDIS_HOST"),
        port: env_parsed("REDIS_PORT"),
        ap_db: env_parsed("REDIS_AP_DB"),
        locations_db: env_parsed("REDIS_LOCATIONS_DB"),
    };

    Config {
        rapid: (rapid != RapidConfig::default()).then_some(rapid),
        xiq: (xiq != XiqConfig::default()).then_some(xiq),
        redis: (redis != RedisConfig::default()).then_some(redis),
        ..Default::default()
    }
}

fn read_if_exists(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let config = serde_yaml::from_str(&contents).with_context(|| format!("parsing {:?}", path))?;
    Ok(Some(config))
}

fn merge(base: Config, top: Config) -> Config {
    Config {
        rapid: overlay_section(base.rapid, top.rapid, RapidConfig::overlay),
        xiq: overlay_section(base.xiq, top.xiq, XiqConfig::overlay),
        redis: overlay_section(base.redis, top.redis, RedisConfig::overlay),
        vmware: overlay_section(base.vmware, top.vmware, VmwareConfig::overlay),
        smseagle: overlay_section(base.smseagle, top.smseagle, SmsEagleConfig::overlay),
        checkmk: overlay_section(base.checkmk, top.checkmk, CheckmkConfig::overlay),
    }
}
