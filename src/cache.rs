//! Redis cache of XIQ access points and the location tree.

use crate::config::RedisSettings;
use crate::xiq::{Device, DeviceRadios, SsidInfo, XiqClient, format_mac_lower};
use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use redis::Commands;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;

pub const AP_TTL_SECS: u64 = 7200;
pub const AP_KEY_PREFIX: &str = "ap:";
pub const LOCATION_TREE_KEY: &str = "xiq:locations:tree";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApRecord {
    pub id: String,
    pub hostname: String,
    pub ip_address: String,
    pub serial_number: String,
    pub bssid_mac: String,
    pub managed_by: String,
    pub device_function: String,
    pub locations: Vec<String>,
    pub ssids: Vec<SsidInfo>,
}

impl ApRecord {
    pub fn from_device(device: &Device, ssids: Vec<SsidInfo>) -> Self {
        let text = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
        Self {
            id: device.id.clone(),
            hostname: text(&device.hostname),
            ip_address: text(&device.ip_address),
            serial_number: text(&device.serial_number),
            bssid_mac: device
                .mac_address
                .as_deref()
                .map(format_mac_lower)
                .unwrap_or_else(|| "N/A".to_string()),
            managed_by: device.managed_by.clone().unwrap_or_default(),
            device_function: device.device_function.clone().unwrap_or_default(),
            locations: device.location_names(),
            ssids,
        }
    }

    pub fn key(&self) -> String {
        format!("{AP_KEY_PREFIX}{}", self.id)
    }

    /// Hash fields; `locations` and `ssids` are JSON encoded.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>> {
        let locations: Vec<Value> = self.locations.iter().map(|n| json!({"name": n})).collect();
        Ok(vec![
            ("hostname", self.hostname.clone()),
            ("ip_address", self.ip_address.clone()),
            ("serial_number", self.serial_number.clone()),
            ("bssid_mac", self.bssid_mac.clone()),
            ("managed_by", self.managed_by.clone()),
            ("device_function", self.device_function.clone()),
            ("locations", serde_json::to_string(&locations)?),
            ("ssids", serde_json::to_string(&self.ssids)?),
        ])
    }

    /// Rebuilds a record from `HGETALL`. Accepts locations as names or
    /// `{name}` objects, and the older single `location` field.
    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let field = |name: &str| fields.get(name).cloned().unwrap_or_default();

        let locations = match fields.get("locations") {
            Some(raw) => {
                let parsed: Vec<Value> = serde_json::from_str(raw)
                    .with_context(|| format!("{key}: invalid locations JSON"))?;
                parsed
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s),
                        Value::Object(map) => map
                            .get("name")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        _ => None,
                    })
                    .collect()
            }
            None => fields
                .get("location")
                .filter(|l| !l.is_empty())
                .map(|l| vec![l.clone()])
                .unwrap_or_default(),
        };
        let ssids = match fields.get("ssids") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
                .with_context(|| format!("{key}: invalid ssids JSON"))?,
            _ => Vec::new(),
        };

        Ok(Self {
            id: key.strip_prefix(AP_KEY_PREFIX).unwrap_or(key).to_string(),
            hostname: field("hostname"),
            ip_address: field("ip_address"),
            serial_number: field("serial_number"),
            bssid_mac: field("bssid_mac"),
            managed_by: field("managed_by"),
            device_function: field("device_function"),
            locations,
            ssids,
        })
    }
}

/// Joins APs with their SSIDs from the radio information.
pub fn build_records(aps: &[Device], radios: &[DeviceRadios]) -> Vec<ApRecord> {
    let ssids: HashMap<&str, Vec<SsidInfo>> = radios
        .iter()
        .map(|r| (r.device_id.as_str(), r.ssids()))
        .collect();
    aps.iter()
        .map(|ap| {
            ApRecord::from_device(ap, ssids.get(ap.id.as_str()).cloned().unwrap_or_default())
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFilter {
    pub hostname: Option<String>,
    pub location_part: Option<String>,
    pub managed_by: Option<String>,
    pub device_function: Option<String>,
    /// Compare whole values instead of substrings.
    pub exact: bool,
}

impl HostFilter {
    fn matches_text(&self, needle: &Option<String>, haystack: &str) -> bool {
        let Some(needle) = needle else {
            return true;
        };
        let (needle, haystack) = (needle.to_lowercase(), haystack.to_lowercase());
        if self.exact {
            needle == haystack
        } else {
            haystack.contains(&needle)
        }
    }

    pub fn matches(&self, record: &ApRecord) -> bool {
        let location = self.location_part.is_none()
            || record
                .locations
                .iter()
                .any(|l| self.matches_text(&self.location_part, l));
        // Records cached before the field existed are all APs.
        let function = if record.device_function.is_empty() {
            "AP"
        } else {
            record.device_function.as_str()
        };
        self.matches_text(&self.hostname, &record.hostname)
            && self.matches_text(&self.managed_by, &record.managed_by)
            && location
            && self
                .device_function
                .as_ref()
                .is_none_or(|f| f.eq_ignore_ascii_case(function))
    }
}

pub fn find_hosts<'a>(records: &'a [ApRecord], filter: &HostFilter) -> Vec<&'a ApRecord> {
    records.iter().filter(|r| filter.matches(r)).collect()
}

pub struct RedisCache {
    conn: redis::Connection,
    url: String,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("url", &self.url)
            .field("conn", &"<redis connection>")
            .finish()
    }
}

impl RedisCache {
    pub fn connect(url: &str) -> Result<Self> {
        info!("connecting to redis at {}", url);
        let client = redis::Client::open(url).with_context(|| format!("invalid redis URL {url}"))?;
        let conn = client
            .get_connection()
            .with_context(|| format!("connecting to redis at {url}"))?;
        Ok(Self {
            conn,
            url: url.to_string(),
        })
    }

    pub fn open(settings: &RedisSettings, db: i64) -> Result<Self> {
        Self::connect(&settings.url(db))
    }

    /// `HSET` then `EXPIRE` for every record, in one pipeline each.
    pub fn store(&mut self, records: &[ApRecord], ttl_secs: u64) -> Result<usize> {
        for record in records {
            let key = record.key();
            let fields = record.to_fields()?;
            redis::pipe()
                .atomic()
                .hset_multiple(&key, &fields)
                .ignore()
                .expire(&key, ttl_secs as i64)
                .ignore()
                .query::<()>(&mut self.conn)
                .with_context(|| format!("storing {key}"))?;
            debug!("stored {}", key);
        }
        info!("{} access points cached with ttl {}s", records.len(), ttl_secs);
        Ok(records.len())
    }

    pub fn load_all(&mut self) -> Result<Vec<ApRecord>> {
        let keys: Vec<String> = self
            .conn
            .scan_match::<_, String>(format!("{AP_KEY_PREFIX}*"))
            .context("scanning ap keys")?
            .collect();
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let fields: HashMap<String, String> = self
                .conn
                .hgetall(&key)
                .with_context(|| format!("reading {key}"))?;
            if fields.is_empty() {
                continue;
            }
            match ApRecord::from_fields(&key, &fields) {
                Ok(record) => records.push(record),
                Err(err) => warn!("skipping {}: {:#}", key, err),
            }
        }
        records.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(records)
    }

    pub fn by_hostname(&mut self, hostname: &str) -> Result<Option<ApRecord>> {
        Ok(self
            .load_all()?
            .into_iter()
            .find(|r| r.hostname.eq_ignore_ascii_case(hostname)))
    }

    pub fn store_location_tree(&mut self, tree: &Value) -> Result<()> {
        let encoded = serde_json::to_string(tree)?;
        self.conn
            .set::<_, _, ()>(LOCATION_TREE_KEY, encoded)
            .context("storing location tree")?;
        info!("location tree stored in {}", self.url);
        Ok(())
    }

    pub fn location_tree(&mut self) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .get(LOCATION_TREE_KEY)
            .context("reading location tree")?;
        raw.map(|r| serde_json::from_str(&r).map_err(|e| anyhow!("cached location tree is not JSON: {e}")))
            .transpose()
    }
}

/// Pulls all APs with their SSIDs and caches them.
pub fn sync(xiq: &mut XiqClient, cache: &mut RedisCache, ttl_secs: u64) -> Result<Vec<ApRecord>> {
    let aps = xiq.access_points()?;
    let ids: Vec<String> = aps.iter().map(|d| d.id.clone()).collect();
    let radios = xiq.radio_information(&ids)?;
    let records = build_records(&aps, &radios);
    cache.store(&records, ttl_secs)?;
    Ok(records)
}
