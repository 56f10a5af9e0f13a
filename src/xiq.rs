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

//! ExtremeCloud IQ REST client.

use crate::client::{ApiClient, Auth, ClientOptions, RetryPolicy, is_unauthorized};
use crate::config::{ConfigError, XiqSettings};
use crate::ratelimit::RateLimitInfo;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use log::{debug, error, info, warn};
use reqwest::Method;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const RADIO_BATCH_SIZE: usize = 10;
pub const DEFAULT_PAGE_PAUSE: Duration = Duration::from_millis(800);
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum View {
    Basic,
    Full,
    Status,
    Location,
    Client,
    Detail,
}

impl View {
    pub fn as_str(self) -> &'static str {
        match self {
            View::Basic => "BASIC",
            View::Full => "FULL",
            View::Status => "STATUS",
            View::Location => "LOCATION",
            View::Client => "CLIENT",
            View::Detail => "DETAIL",
        }
    }
}

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationRef {
    #[serde(default, deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LldpInfo {
    #[serde(default)]
    pub interface_name: Option<String>,
    #[serde(default)]
    pub port_id: Option<String>,
    #[serde(default)]
    pub port_description: Option<String>,
    #[serde(default)]
    pub system_id: Option<String>,
    #[serde(default)]
    pub system_name: Option<String>,
    #[serde(default)]
    pub management_ip: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default, deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub software_version: Option<String>,
    #[serde(default)]
    pub device_function: Option<String>,
    #[serde(default)]
    pub managed_by: Option<String>,
    #[serde(default)]
    pub device_admin_state: Option<String>,
    #[serde(default)]
    pub connected: Value,
    #[serde(default)]
    pub system_up_time: Option<Value>,
    #[serde(default, deserialize_with = "null_default")]
    pub locations: Vec<LocationRef>,
    #[serde(default, deserialize_with = "null_default")]
    pub lldp_cdp_infos: Vec<LldpInfo>,
}

impl Device {
    pub fn display_name(&self) -> String {
        self.hostname
            .clone()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| format!("device-{}", self.id))
    }

    pub fn is_ap(&self) -> bool {
        self.device_function.as_deref() == Some("AP")
    }

    pub fn is_connected(&self) -> bool {
        norm_connected(&self.connected)
    }

    pub fn location_names(&self) -> Vec<String> {
        self.locations.iter().map(|l| l.name.clone()).collect()
    }

    /// Location path joined with `/`, root first.
    pub fn location_path(&self) -> String {
        self.location_names().join("/")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsidInfo {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub ssid_status: String,
    #[serde(default)]
    pub ssid_security_type: String,
    #[serde(default)]
    pub bssid: String,
    #[serde(default)]
    pub network_policy_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRadios {
    #[serde(default, deserialize_with = "id_string")]
    pub device_id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub radios: Vec<Value>,
}

impl DeviceRadios {
    /// SSIDs across all radios, first occurrence of each name wins.
    pub fn ssids(&self) -> Vec<SsidInfo> {
        let mut seen = HashSet::new();
        let mut ssids = Vec::new();
        for radio in &self.radios {
            let Some(wlans) = radio.get("wlans").and_then(Value::as_array) else {
                continue;
            };
            for wlan in wlans {
                let Ok(info) = serde_json::from_value::<SsidInfo>(wlan.clone()) else {
                    continue;
                };
                if !info.ssid.is_empty() && seen.insert(info.ssid.clone()) {
                    ssids.push(info);
                }
            }
        }
        ssids
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BandCounts {
    pub c24: u64,
    pub c5: u64,
    pub c6: u64,
}

impl BandCounts {
    pub fn total(&self) -> u64 {
        self.c24 + self.c5 + self.c6
    }

    pub fn add(&mut self, client: &Value) {
        match classify_band(client) {
            Band::G6 => self.c6 += 1,
            Band::G5 => self.c5 += 1,
            Band::G24 => self.c24 += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    G24,
    G5,
    G6,
}

/// Band from `frequency`, falling back to `radio_type`. Unclassified
/// clients count as 2.4 GHz.
pub fn classify_band(client: &Value) -> Band {
    let text = |key: &str| match client.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let Some(raw) = text("frequency").or_else(|| text("radio_type")) else {
        return Band::G24;
    };
    if raw.contains("2.4") {
        Band::G24
    } else if raw.contains('6') {
        Band::G6
    } else if raw.contains('5') {
        Band::G5
    } else {
        Band::G24
    }
}

/// Client counts per `device_id`.
pub fn clients_per_device(clients: &[Value]) -> BTreeMap<String, BandCounts> {
    let mut counts: BTreeMap<String, BandCounts> = BTreeMap::new();
    for client in clients {
        let id = match client.get("device_id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        counts.entry(id).or_default().add(client);
    }
    counts
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationMatch {
    pub unique_name: String,
    pub id: String,
}

/// Depth-first search for a node whose `unique_name` (or `uniqueName`)
/// equals `unique_name`.
pub fn find_location(tree: &Value, unique_name: &str) -> Option<LocationMatch> {
    match tree {
        Value::Array(items) => items.iter().find_map(|i| find_location(i, unique_name)),
        Value::Object(map) => {
            let name = map
                .get("unique_name")
                .or_else(|| map.get("uniqueName"))
                .and_then(Value::as_str);
            if name == Some(unique_name) {
                let id = match map.get("id") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => String::new(),
                };
                return Some(LocationMatch {
                    unique_name: unique_name.to_string(),
                    id,
                });
            }
            map.get("children")
                .and_then(|c| find_location(c, unique_name))
        }
        _ => None,
    }
}

pub fn norm_connected(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "connected"
        ),
        _ => false,
    }
}

/// Lowercase `aa:bb:..` for 12 character input, anything else unchanged.
pub fn format_mac_lower(raw: &str) -> String {
    if raw.chars().count() != 12 {
        return raw.to_string();
    }
    let lower = raw.to_ascii_lowercase();
    pairs(&lower)
}

/// Uppercase `AA:BB:..` from the hex digits of `raw`.
pub fn format_mac_upper(raw: &str) -> String {
    let hex: String = raw.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() < 12 {
        return raw.to_string();
    }
    pairs(&hex[..12].to_ascii_uppercase())
}

fn pairs(s: &str) -> String {
    s.as_bytes()
        .chunks(2)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

pub fn format_uptime_long(ts_ms: i64, now: DateTime<Utc>) -> String {
    let delta_ms = now.timestamp_millis() - ts_ms;
    if delta_ms < 0 {
        return "Timestamp is in the future".to_string();
    }
    let total = delta_ms / 1000;
    let days = total / 86_400;
    if days > 2000 {
        return "offline".to_string();
    }
    let rest = total % 86_400;
    format!(
        "{} days, {:02}:{:02}:{:02}",
        days,
        rest / 3600,
        (rest % 3600) / 60,
        rest % 60
    )
}

pub fn format_uptime_short(seconds: u64) -> String {
    format!(
        "{}d {}h {}m",
        seconds / 86_400,
        (seconds % 86_400) / 3600,
        (seconds % 3600) / 60
    )
}

/// Uptime in seconds from the assorted encodings XIQ uses for
/// `system_up_time`.
pub fn uptime_seconds(raw: &Value, now: DateTime<Utc>) -> Option<u64> {
    let value = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if value <= 0.0 {
        return None;
    }
    let now_s = now.timestamp() as f64;
    let seconds = if value >= 1e11 {
        now_s - value / 1000.0
    } else if value >= 1e9 {
        now_s - value
    } else if value > 1e7 {
        value
    } else {
        value / 1000.0
    };
    (seconds >= 0.0).then_some(seconds as u64)
}

pub fn clean_text(s: &str) -> String {
    s.replace("(interface name)", "")
        .replace("(mac address)", "")
        .trim()
        .to_string()
}

/// Access token persisted in a plain text file, first line only.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.lines().next().unwrap_or_default().trim().to_string();
                if token.is_empty() {
                    warn!("token file {:?} is empty", self.path);
                    None
                } else {
                    debug!("token loaded from {:?}", self.path);
                    Some(token)
                }
            }
            Err(err) => {
                debug!("no token at {:?}: {}", self.path, err);
                None
            }
        }
    }

    pub fn save(&self, token: &str) -> Result<()> {
        fs::write(&self.path, token)
            .with_context(|| format!("writing token to {:?}", self.path))?;
        info!("token saved to {:?}", self.path);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
struct Page<T> {
    #[serde(default, deserialize_with = "null_default")]
    data: Vec<T>,
}

#[derive(Debug)]
pub struct XiqClient {
    api: ApiClient,
    store: Option<TokenStore>,
    credentials: Option<(String, String)>,
    page_size: u32,
    page_pause: Duration,
    batch_pause: Duration,
}

impl XiqClient {
    pub fn new(base_url: &str, options: &ClientOptions) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(base_url, Auth::None, options)?,
            store: None,
            credentials: None,
            page_size: 100,
            page_pause: DEFAULT_PAGE_PAUSE,
            batch_pause: DEFAULT_BATCH_PAUSE,
        })
    }

    /// Client for the configured account; the token is loaded or obtained
    /// lazily by `authenticate`.
    pub fn from_settings(settings: &XiqSettings, options: &ClientOptions) -> Result<Self> {
        let mut client = Self::new(&settings.base_url, options)?
            .with_token_store(TokenStore::new(&settings.token_file))
            .with_page_size(settings.page_size);
        if let Ok((username, password)) = settings.credentials() {
            client = client.with_credentials(&username, &password);
        }
        Ok(client)
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.set_token(token);
        self
    }

    pub fn set_token(&mut self, token: &str) {
        self.api.set_auth(Auth::Bearer(token.to_string()));
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn with_token_store(mut self, store: TokenStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_sleeper(mut self, sleeper: fn(Duration)) -> Self {
        self.api = self.api.with_sleeper(sleeper);
        self
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// `POST /login`; the token becomes the bearer for later calls and is
    /// persisted when a token store is set.
    pub fn login(&mut self) -> Result<String> {
        let Some((username, password)) = self.credentials.clone() else {
            return Err(ConfigError::MissingXiqCredentials.into());
        };
        info!("logging in to {}", self.api.base_url());
        let response = self
            .api
            .post_json(
                "login",
                &[],
                Some(&json!({"username": username, "password": password})),
            )
            .context("XIQ login failed")?;
        let Some(token) = response
            .json
            .as_ref()
            .and_then(|j| j.get("access_token"))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            bail!("XIQ login response carries no access_token");
        };
        self.api.set_auth(Auth::Bearer(token.clone()));
        if let Some(store) = &self.store
            && let Err(err) = store.save(&token)
        {
            error!("{:#}", err);
        }
        Ok(token)
    }

    /// Uses the stored token when there is one, otherwise logs in.
    pub fn authenticate(&mut self) -> Result<()> {
        if let Some(token) = self.store.as_ref().and_then(TokenStore::load) {
            self.api.set_auth(Auth::Bearer(token));
            return Ok(());
        }
        self.login().map(|_| ())
    }

    /// Runs `call`, renewing the token once on 401.
    fn call<T>(&mut self, call: impl Fn(&ApiClient) -> Result<T>) -> Result<T> {
        match call(&self.api) {
            Err(err) if is_unauthorized(&err) && self.credentials.is_some() => {
                warn!("access token rejected, logging in again");
                self.login()?;
                call(&self.api)
            }
            other => other,
        }
    }

    fn paginate<T: DeserializeOwned>(
        &mut self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let mut all = Vec::new();
        let mut page = 1u32;
        let limit = self.page_size;
        loop {
            let mut params: Vec<(&str, String)> =
                vec![("page", page.to_string()), ("limit", limit.to_string())];
            params.extend(query.iter().cloned());
            let batch: Page<T> = self
                .call(|api| api.get_json(path, &params))
                .with_context(|| format!("fetching {path} page {page}"))?;
            let count = batch.data.len();
            debug!("{} page {}: {} entries", path, page, count);
            all.extend(batch.data);
            if count == 0 || count < limit as usize {
                break;
            }
            page += 1;
            self.api.sleep(self.page_pause);
        }
        info!("{}: {} entries", path, all.len());
        Ok(all)
    }

    pub fn devices(&mut self, views: View) -> Result<Vec<Device>> {
        self.paginate("devices", &[("views", views.as_str().to_string())])
    }

    pub fn devices_raw(&mut self, views: View) -> Result<Vec<Value>> {
        self.paginate("devices", &[("views", views.as_str().to_string())])
    }

    pub fn device(&mut self, id: &str) -> Result<Value> {
        let path = format!("devices/{id}");
        self.call(|api| api.get_json(&path, &[("views", "FULL".to_string())]))
    }

    /// Full details of the device whose hostname matches, ignoring case.
    pub fn device_by_hostname(&mut self, hostname: &str) -> Result<Option<Value>> {
        let id = self
            .devices(View::Basic)?
            .into_iter()
            .find(|d| {
                d.hostname
                    .as_deref()
                    .is_some_and(|h| h.eq_ignore_ascii_case(hostname))
            })
            .map(|d| d.id);
        match id {
            Some(id) => self.device(&id).map(Some),
            None => Ok(None),
        }
    }

    pub fn access_points(&mut self) -> Result<Vec<Device>> {
        let devices = self.devices(View::Full)?;
        Ok(devices.into_iter().filter(Device::is_ap).collect())
    }

    /// Radio details in batches. A failed batch is logged and skipped.
    pub fn radio_information(&mut self, ids: &[String]) -> Result<Vec<DeviceRadios>> {
        let mut result = Vec::new();
        for (n, chunk) in ids.chunks(RADIO_BATCH_SIZE).enumerate() {
            if n > 0 {
                self.api.sleep(self.batch_pause);
            }
            let query = [
                ("page", "1".to_string()),
                ("limit", RADIO_BATCH_SIZE.to_string()),
                ("deviceIds", chunk.join(",")),
                ("includeDisabledRadio", "false".to_string()),
            ];
            match self.call(|api| api.get("devices/radio-information", &query)) {
                Ok(response) => match parse_radio_payload(response.json) {
                    Ok(mut radios) => result.append(&mut radios),
                    Err(err) => error!("radio information for {}: {:#}", chunk.join(","), err),
                },
                Err(err) => error!("radio information for {}: {:#}", chunk.join(","), err),
            }
        }
        Ok(result)
    }

    pub fn clients(
        &mut self,
        views: View,
        sort: Option<&str>,
        dir: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Vec<Value>> {
        let mut query = vec![("views", views.as_str().to_string())];
        if let Some(sort) = sort {
            query.push(("sort", sort.to_string()));
        }
        if let Some(dir) = dir {
            query.push(("dir", dir.to_string()));
        }
        if let Some(filter) = filter {
            query.push(("where", filter.to_string()));
        }
        self.paginate("clients", &query)
    }

    pub fn active_clients(&mut self) -> Result<Vec<Value>> {
        self.paginate("clients/active", &[])
    }

    pub fn location_tree(&mut self) -> Result<Value> {
        self.call(|api| api.get_json("locations/tree", &[]))
    }

    pub fn location_summary(&mut self, location_id: &str) -> Result<Value> {
        let path = format!("locations/{location_id}/device_status_summary");
        self.call(|api| api.get_json(&path, &[]))
    }

    pub fn wifi_health(&mut self, location_id: &str) -> Result<Value> {
        let path = format!("locations/{location_id}/wifi-health");
        self.call(|api| api.get_json(&path, &[]))
    }

    /// One cheap `devices` call, returning the rate-limit headers whatever
    /// the status. Never retried.
    pub fn rate_limit(&self) -> RateLimitInfo {
        let query = [("page", "1".to_string()), ("limit", "1".to_string())];
        let api = self.api.clone().with_retry(RetryPolicy::none());
        match api.send(Method::GET, "devices", &query, Option::<&Value>::None)
        {
            Ok(response) => RateLimitInfo::from_response(&response),
            Err(err) => {
                warn!("rate limit probe failed: {:#}", err);
                RateLimitInfo::no_response()
            }
        }
    }
}

fn parse_radio_payload(json: Option<Value>) -> Result<Vec<DeviceRadios>> {
    let data = match json {
        Some(Value::Array(items)) => Value::Array(items),
        Some(Value::Object(mut map)) => map.remove("data").unwrap_or(Value::Array(Vec::new())),
        _ => bail!("radio information response is not JSON"),
    };
    serde_json::from_value(data).context("unexpected radio information shape")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn client(server: &MockServer) -> XiqClient {
        XiqClient::new(&server.base_url(), &ClientOptions::default())
            .unwrap()
            .with_sleeper(|_| {})
    }

    #[test]
    fn paginates_until_short_page() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/devices")
                .query_param("page", "1")
                .query_param("limit", "2")
                .query_param("views", "FULL");
            then.status(200).json_body(json!({"data": [
                {"id": 1, "hostname": "ap-1", "device_function": "AP"},
                {"id": 2, "hostname": "sw-1", "device_function": "SWITCH"}
            ]}));
        });
        let second = server.mock(|when, then| {
            when.method(GET).path("/devices").query_param("page", "2");
            then.status(200).json_body(json!({"data": [
                {"id": "3", "hostname": "ap-2", "device_function": "AP", "locations": null}
            ]}));
        });

        let mut xiq = client(&server).with_token("t").with_page_size(2);
        let aps = xiq.access_points().unwrap();
        first.assert();
        second.assert();
        let ids: Vec<&str> = aps.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn stops_on_empty_page() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/clients/active");
            then.status(200).json_body(json!({"data": []}));
        });
        let clients = client(&server).active_clients().unwrap();
        mock.assert_hits(1);
        assert!(clients.is_empty());
    }

    #[test]
    fn renews_token_once_on_unauthorized() {
        let dir = tempdir().unwrap();
        let token_file = dir.path().join("token.txt");
        std::fs::write(&token_file, "stale\n").unwrap();

        let server = MockServer::start();
        let stale = server.mock(|when, then| {
            when.method(GET)
                .path("/locations/tree")
                .header("Authorization", "Bearer stale");
            then.status(401);
        });
        let login = server.mock(|when, then| {
            when.method(POST)
                .path("/login")
                .json_body(json!({"username": "u", "password": "p"}));
            then.status(200).json_body(json!({"access_token": "fresh"}));
        });
        let fresh = server.mock(|when, then| {
            when.method(GET)
                .path("/locations/tree")
                .header("Authorization", "Bearer fresh");
            then.status(200).json_body(json!([{"id": 1, "unique_name": "Org"}]));
        });

        let mut xiq = client(&server)
            .with_token_store(TokenStore::new(&token_file))
            .with_credentials("u", "p");
        xiq.authenticate().unwrap();
        let tree = xiq.location_tree().unwrap();

        stale.assert();
        login.assert();
        fresh.assert();
        assert_eq!(tree[0]["unique_name"], "Org");
        assert_eq!(std::fs::read_to_string(&token_file).unwrap(), "fresh");
    }

    #[test]
    fn rate_limit_is_a_single_request_even_when_throttled() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/devices")
                .query_param("page", "1")
                .query_param("limit", "1");
            then.status(429)
                .header("Retry-After", "60")
                .header("RateLimit-Remaining", "0");
        });

        let info = XiqClient::new(&server.base_url(), &ClientOptions::default())
            .unwrap()
            .with_token("t")
            .with_sleeper(|_| panic!("rate limit check must not sleep"))
            .rate_limit();

        mock.assert_hits(1);
        assert_eq!(info.status, Some(429));
        assert_eq!(info.remaining, Some(0));
    }

    #[test]
    fn fetches_device_details_by_id_or_hostname() {
        let server = MockServer::start();
        let list = server.mock(|when, then| {
            when.method(GET).path("/devices").query_param("views", "BASIC");
            then.status(200).json_body(json!({"data": [
                {"id": 11, "hostname": "AP-Lobby"},
                {"id": 12, "hostname": "ap-roof"}
            ]}));
        });
        let details = server.mock(|when, then| {
            when.method(GET).path("/devices/12").query_param("views", "FULL");
            then.status(200)
                .json_body(json!({"id": 12, "hostname": "ap-roof", "connected": true}));
        });

        let mut xiq = client(&server).with_token("t");
        assert_eq!(xiq.device("12").unwrap()["connected"], true);
        let found = xiq.device_by_hostname("AP-ROOF").unwrap().unwrap();
        assert_eq!(found["hostname"], "ap-roof");
        assert!(xiq.device_by_hostname("ap-cellar").unwrap().is_none());

        details.assert_hits(2);
        list.assert_hits(2);
    }

    #[test]
    fn second_unauthorized_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/locations/tree");
            then.status(401);
        });
        server.mock(|when, then| {
            when.method(POST).path("/login");
            then.status(200).json_body(json!({"access_token": "again"}));
        });

        let mut xiq = client(&server).with_credentials("u", "p");
        let err = xiq.location_tree().unwrap_err();
        assert!(is_unauthorized(&err));
    }

    #[test]
    fn login_without_credentials_fails_with_hint() {
        let server = MockServer::start();
        let err = client(&server).login().unwrap_err();
        assert!(err.to_string().contains("XIQ"));
    }

    #[test]
    fn radio_information_is_batched_and_deduplicated() {
        let server = MockServer::start();
        let first_ids: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
        let first = server.mock(|when, then| {
            when.method(GET)
                .path("/devices/radio-information")
                .query_param("deviceIds", first_ids.join(","))
                .query_param("includeDisabledRadio", "false");
            then.status(200).json_body(json!({"data": [{
                "device_id": 1,
                "radios": [
                    {"name": "wifi0", "wlans": [
                        {"ssid": "corp", "ssid_status": "ENABLED", "bssid": "aa"},
                        {"ssid": "guest", "ssid_status": "ENABLED", "bssid": "bb"}
                    ]},
                    {"name": "wifi1", "wlans": [
                        {"ssid": "corp", "ssid_status": "ENABLED", "bssid": "cc"}
                    ]}
                ]
            }]}));
        });
        let second = server.mock(|when, then| {
            when.method(GET)
                .path("/devices/radio-information")
                .query_param("deviceIds", "11");
            then.status(500);
        });

        let ids: Vec<String> = (1..=11).map(|i| i.to_string()).collect();
        let radios = client(&server).with_token("t").radio_information(&ids).unwrap();
        first.assert();
        second.assert_hits(4);
        assert_eq!(radios.len(), 1);
        let ssids: Vec<String> = radios[0].ssids().into_iter().map(|s| s.ssid).collect();
        assert_eq!(ssids, vec!["corp", "guest"]);
    }

    #[test]
    fn client_query_carries_filters() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/clients")
                .query_param("views", "DETAIL")
                .query_param("sort", "hostname")
                .query_param("dir", "ASC")
                .query_param("where", "ssid=corp");
            then.status(200).json_body(json!({"data": [{"mac_address": "x"}]}));
        });
        let clients = client(&server)
            .clients(View::Detail, Some("hostname"), Some("ASC"), Some("ssid=corp"))
            .unwrap();
        mock.assert();
        assert_eq!(clients.len(), 1);
    }

    #[test]
    fn counts_clients_per_band() {
        let clients = vec![
            json!({"device_id": 1, "frequency": "2.4GHz"}),
            json!({"device_id": 1, "frequency": "5GHz"}),
            json!({"device_id": 1, "radio_type": "6 GHz"}),
            json!({"device_id": 1}),
            json!({"device_id": "2", "frequency": 5}),
            json!({"frequency": "5GHz"}),
        ];
        let counts = clients_per_device(&clients);
        assert_eq!(counts["1"], BandCounts { c24: 2, c5: 1, c6: 1 });
        assert_eq!(counts["2"].total(), 1);
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn finds_locations_recursively() {
        let tree = json!([{
            "id": 1, "unique_name": "Org",
            "children": [{
                "id": 2, "uniqueName": "Org/Berlin",
                "children": [{"id": "3", "unique_name": "Org/Berlin/B1"}]
            }]
        }]);
        assert_eq!(
            find_location(&tree, "Org/Berlin/B1"),
            Some(LocationMatch {
                unique_name: "Org/Berlin/B1".into(),
                id: "3".into()
            })
        );
        assert_eq!(find_location(&tree, "Org/Berlin").unwrap().id, "2");
        assert_eq!(find_location(&tree, "Nowhere"), None);
    }

    #[test]
    fn formats_mac_addresses() {
        assert_eq!(format_mac_lower("90B8D0123456"), "90:b8:d0:12:34:56");
        assert_eq!(format_mac_lower("90B8"), "90B8");
        assert_eq!(format_mac_upper("90-b8-d0-12-34-56"), "90:B8:D0:12:34:56");
        assert_eq!(format_mac_upper("zz"), "zz");
    }

    #[test]
    fn formats_uptimes() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let boot = Utc.with_ymd_and_hms(2024, 1, 8, 10, 30, 15).unwrap();
        assert_eq!(
            format_uptime_long(boot.timestamp_millis(), now),
            "2 days, 01:29:45"
        );
        assert_eq!(
            format_uptime_long(now.timestamp_millis() + 1000, now),
            "Timestamp is in the future"
        );
        assert_eq!(format_uptime_long(0, now), "offline");
        assert_eq!(format_uptime_short(90_061), "1d 1h 1m");
    }

    #[test]
    fn uptime_heuristics() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let ms = json!(now.timestamp_millis() - 60_000);
        assert_eq!(uptime_seconds(&ms, now), Some(60));
        assert_eq!(uptime_seconds(&json!(now.timestamp() - 120), now), Some(120));
        assert_eq!(uptime_seconds(&json!(50_000_000), now), Some(50_000_000));
        assert_eq!(uptime_seconds(&json!("90000"), now), Some(90));
        assert_eq!(uptime_seconds(&json!(null), now), None);
    }

    #[test]
    fn normalises_connected_flags() {
        assert!(norm_connected(&json!(true)));
        assert!(norm_connected(&json!(1)));
        assert!(norm_connected(&json!("Connected")));
        assert!(!norm_connected(&json!("no")));
        assert!(!norm_connected(&Value::Null));
    }

    #[test]
    fn cleans_placeholder_text() {
        assert_eq!(clean_text(" eth0 (interface name)"), "eth0");
        assert_eq!(clean_text("(mac address)"), "");
    }

    #[test]
    fn token_store_reads_first_line() {
        let dir = tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("t.txt"));
        assert_eq!(store.load(), None);
        std::fs::write(store.path(), "  abc \nignored").unwrap();
        assert_eq!(store.load().as_deref(), Some("abc"));
        std::fs::write(store.path(), "\n").unwrap();
        assert_eq!(store.load(), None);
    }
}
