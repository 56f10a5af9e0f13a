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

//! RAPID server: REST client, node connection local checks and the
//! hardware special agent.

use crate::checkmk::{Perfdata, SectionWriter, State};
use crate::client::{ApiClient, Auth, ClientOptions};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

/// Connection state reported by `nodeconnections/.../status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeConnection {
    Disconnected,
    WaitingToConnect,
    ItemsLoaded,
    ItemsUnloaded,
    Connecting,
    Connected,
    WaitingToDisconnect,
    Disconnecting,
    WaitingForRetry,
    ConnectedPartially,
    ConnectedToNotAll,
    Error,
    Other(String),
}

impl NodeConnection {
    pub fn as_str(&self) -> &str {
        match self {
            NodeConnection::Disconnected => "DISCONNECTED_E",
            NodeConnection::WaitingToConnect => "WAITING_TO_CONNECT_E",
            NodeConnection::ItemsLoaded => "ITEMS_LOADED_E",
            NodeConnection::ItemsUnloaded => "ITEMS_UNLOADED_E",
            NodeConnection::Connecting => "CONNECTING_E",
            NodeConnection::Connected => "CONNECTED_E",
            NodeConnection::WaitingToDisconnect => "WAITING_TO_DISCONNECT_E",
            NodeConnection::Disconnecting => "DISCONNECTING_E",
            NodeConnection::WaitingForRetry => "WAITING_FOR_RETRY_E",
            NodeConnection::ConnectedPartially => "CONNECTED_PARTIALLY_E",
            NodeConnection::ConnectedToNotAll => "CONNECTED_TO_NOT_ALL_E",
            NodeConnection::Error => "ERROR",
            NodeConnection::Other(raw) => raw,
        }
    }
}

impl FromStr for NodeConnection {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "DISCONNECTED_E" => NodeConnection::Disconnected,
            "WAITING_TO_CONNECT_E" => NodeConnection::WaitingToConnect,
            "ITEMS_LOADED_E" => NodeConnection::ItemsLoaded,
            "ITEMS_UNLOADED_E" => NodeConnection::ItemsUnloaded,
            "CONNECTING_E" => NodeConnection::Connecting,
            "CONNECTED_E" => NodeConnection::Connected,
            "WAITING_TO_DISCONNECT_E" => NodeConnection::WaitingToDisconnect,
            "DISCONNECTING_E" => NodeConnection::Disconnecting,
            "WAITING_FOR_RETRY_E" => NodeConnection::WaitingForRetry,
            "CONNECTED_PARTIALLY_E" => NodeConnection::ConnectedPartially,
            "CONNECTED_TO_NOT_ALL_E" => NodeConnection::ConnectedToNotAll,
            "ERROR" => NodeConnection::Error,
            other => NodeConnection::Other(other.to_string()),
        })
    }
}

impl fmt::Display for NodeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct RawNodeStatus {
    #[serde(rename = "ConnectionStatus", default)]
    connection_status: Option<RawConnection>,
    #[serde(rename = "ConnectionError", default)]
    connection_error: Option<Value>,
    #[serde(rename = "LastUpdate", default)]
    last_update: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    #[serde(rename = "ConnectionStatus", default)]
    connection_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatusReport {
    #[serde(rename = "ConnectionStatus", serialize_with = "serialize_connection")]
    pub connection: Option<NodeConnection>,
    #[serde(rename = "ConnectionError")]
    pub connection_error: Option<String>,
    #[serde(rename = "LastUpdate")]
    pub last_update: Option<String>,
}

fn serialize_connection<S: serde::Serializer>(
    value: &Option<NodeConnection>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(value.as_ref().map(|c| c.as_str()).unwrap_or("Unknown"))
}

impl NodeStatusReport {
    pub fn fetch_failed() -> Self {
        Self {
            connection: Some(NodeConnection::Other("Unknown".into())),
            connection_error: Some("Failed to fetch status".into()),
            last_update: None,
        }
    }

    fn from_raw(raw: RawNodeStatus) -> Self {
        let connection_error = match raw.connection_error {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };
        Self {
            connection: raw
                .connection_status
                .and_then(|c| c.connection_status)
                .and_then(|s| s.parse().ok()),
            connection_error,
            last_update: raw.last_update.filter(|s| !s.is_empty()),
        }
    }

    /// Maps the node to a Checkmk state and message.
    pub fn evaluate(&self, node: &str) -> (State, String) {
        let status = self.connection.as_ref().map(|c| c.as_str());
        let failed = matches!(
            self.connection,
            Some(NodeConnection::Disconnected) | Some(NodeConnection::Error)
        ) || self.connection_error.is_some();

        if failed {
            (
                State::Crit,
                format!(
                    "Node '{}': Status CRITICAL - {}",
                    node,
                    status.unwrap_or("Connection Error")
                ),
            )
        } else if self.connection == Some(NodeConnection::Connected) {
            (
                State::Ok,
                format!("Node '{}': Status OK - {}", node, NodeConnection::Connected),
            )
        } else {
            (
                State::Warn,
                format!(
                    "Node '{}': Status WARNING - {}",
                    node,
                    status.unwrap_or("Unknown")
                ),
            )
        }
    }

    pub fn seconds_since_update(&self, now: DateTime<Utc>) -> Option<f64> {
        let ts = parse_timestamp(self.last_update.as_deref()?).ok()?;
        let delta = now.signed_duration_since(ts.and_utc());
        Some(delta.num_milliseconds() as f64 / 1000.0)
    }
}

/// Accepts RFC 3339 (any offset, converted to UTC) or a naive ISO timestamp.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc).naive_utc());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .with_context(|| format!("invalid timestamp `{raw}`; expected ISO format like 2023-10-26T10:00:00"))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessEvent {
    pub ts: String,
    pub val: f64,
}

/// `count` events one millisecond apart starting at `start`, values in [0, 100).
pub fn process_events<R: Rng>(start: NaiveDateTime, count: usize, rng: &mut R) -> Vec<ProcessEvent> {
    (0..count)
        .map(|i| ProcessEvent {
            ts: (start + ChronoDuration::milliseconds(i as i64))
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
            val: rng.gen_range(0.0..100.0),
        })
        .collect()
}

fn last_segment(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug)]
pub struct RapidClient {
    api: ApiClient,
}

impl RapidClient {
    pub fn new(server: &str, api_key: &str, options: &ClientOptions) -> Result<Self> {
        let options = ClientOptions {
            accept: "text/plain",
            ..options.clone()
        };
        let api = ApiClient::new(server, Auth::Bearer(api_key.to_string()), &options)?;
        Ok(Self { api })
    }

    pub fn authenticate(&self) -> Result<Value> {
        let response = self
            .api
            .get("auth", &[("format", "json".to_string())])
            .context("authenticating against RAPID server")?;
        Ok(response.json.unwrap_or(Value::String(response.body)))
    }

    fn names(&self, path: &str) -> Result<Vec<String>> {
        let urls: Vec<String> = self.api.get_json(path, &[])?;
        Ok(urls.iter().map(|u| last_segment(u)).collect())
    }

    pub fn list_databases(&self) -> Result<Vec<String>> {
        self.names("api/v1/database")
    }

    pub fn list_nodes(&self, db: &str) -> Result<Vec<String>> {
        self.names(&format!("api/v1/database/{db}/node"))
    }

    pub fn list_items(&self, db: &str, node: &str) -> Result<Vec<String>> {
        self.names(&format!("api/v1/database/{db}/node/{node}/item"))
    }

    pub fn database_exists(&self, db: &str) -> bool {
        exists(self.list_databases(), db)
    }

    pub fn node_exists(&self, db: &str, node: &str) -> bool {
        exists(self.list_nodes(db), node)
    }

    pub fn item_exists(&self, db: &str, node: &str, item: &str) -> bool {
        exists(self.list_items(db, node), item)
    }

    pub fn node_status(&self, db: &str, node: &str) -> Result<NodeStatusReport> {
        let raw: RawNodeStatus = self
            .api
            .get_json(
                &format!("api/v1/nodeconnections/database/{db}/node/{node}/status"),
                &[],
            )
            .with_context(|| format!("fetching status of node `{node}`"))?;
        Ok(NodeStatusReport::from_raw(raw))
    }

    pub fn create_node(&self, db: &str, name: &str) -> Result<Option<Value>> {
        let response = self.api.post_json(
            &format!("api/v1/database/{db}/node?format=json"),
            &[],
            Some(&json!({"Name": name, "Type": 2})),
        )?;
        info!("node {} created in {}", name, db);
        Ok(response.json)
    }

    pub fn create_item(
        &self,
        db: &str,
        node: &str,
        name: &str,
        description: &str,
    ) -> Result<Option<Value>> {
        let response = self.api.post_json(
            "api/v1.1/item?format=json",
            &[],
            Some(&json!({
                "DbName": db,
                "NodeName": node,
                "Name": name,
                "Description": description,
            })),
        )?;
        info!("item {} created in {}/{}", name, db, node);
        Ok(response.json)
    }

    pub fn item(&self, db: &str, node: &str, item: &str) -> Result<Value> {
        self.api.get_json(
            &format!("api/v1/database/{db}/node/{node}/item/{item}?format=json"),
            &[],
        )
    }

    pub fn write_process_data(
        &self,
        db: &str,
        node: &str,
        item: &str,
        events: &[ProcessEvent],
    ) -> Result<usize> {
        self.api.post_json(
            &format!("api/v1/database/{db}/node/{node}/item/{item}/processData?format=json"),
            &[],
            Some(&json!({ "values": events })),
        )?;
        info!("{} events written to {}/{}/{}", events.len(), db, node, item);
        Ok(events.len())
    }

    pub fn read_process_data(
        &self,
        db: &str,
        node: &str,
        item: &str,
        start: &str,
        end: &str,
    ) -> Result<Value> {
        let query = [
            ("startTime", start.to_string()),
            ("endTime", end.to_string()),
            ("format", "json".to_string()),
        ];
        self.api.get_json(
            &format!("api/v1/database/{db}/node/{node}/item/{item}/processData"),
            &query,
        )
    }

    /// Node list plus per-node status. `None` when the database is missing.
    pub fn snapshot(&self, db: &str) -> Result<Option<NodeSnapshot>> {
        if !self.database_exists(db) {
            return Ok(None);
        }
        let nodes = self.list_nodes(db)?;
        let mut status = BTreeMap::new();
        for node in &nodes {
            let report = match self.node_status(db, node) {
                Ok(report) => report,
                Err(err) => {
                    warn!("{:#}", err);
                    NodeStatusReport::fetch_failed()
                }
            };
            status.insert(node.clone(), report);
        }
        Ok(Some(NodeSnapshot { nodes, status }))
    }
}

fn exists(names: Result<Vec<String>>, wanted: &str) -> bool {
    match names {
        Ok(names) => names.iter().any(|n| n == wanted),
        Err(err) => {
            debug!("existence check failed: {:#}", err);
            false
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    #[serde(rename = "Nodes")]
    pub nodes: Vec<String>,
    #[serde(rename = "Status")]
    pub status: BTreeMap<String, NodeStatusReport>,
}

/// Writes the `<<<local>>>` block for the nodes of `db` and returns the
/// worst state written. `only` restricts the output to one node.
pub fn write_node_checks<W: Write>(
    out: &mut SectionWriter<W>,
    db: &str,
    snapshot: Option<&NodeSnapshot>,
    only: Option<&str>,
    now: DateTime<Utc>,
) -> Result<State> {
    out.section("local", None)?;
    let Some(snapshot) = snapshot else {
        out.local_check(
            State::Ok,
            "rest_api_nodes",
            &[],
            &format!("Database '{db}' not found"),
        )?;
        return Ok(State::Ok);
    };

    if let Some(name) = only
        && !snapshot.nodes.iter().any(|n| n == name)
    {
        out.local_check(
            State::Unknown,
            &format!("rest_api_node_{name}"),
            &[],
            &format!("Node '{name}' not found"),
        )?;
        return Ok(State::Unknown);
    }

    if snapshot.nodes.is_empty() {
        out.local_check(
            State::Ok,
            "rest_api_nodes",
            &[],
            &format!("No nodes found in database '{db}'"),
        )?;
        return Ok(State::Ok);
    }

    let mut worst = State::Ok;
    for node in snapshot
        .nodes
        .iter()
        .filter(|n| only.is_none_or(|o| o == n.as_str()))
    {
        let report = snapshot
            .status
            .get(node)
            .cloned()
            .unwrap_or_else(NodeStatusReport::fetch_failed);
        let (state, message) = report.evaluate(node);
        let perf: Vec<Perfdata> = report
            .seconds_since_update(now)
            .map(|s| Perfdata::new("time_since_update", s.max(0.0).round()).uom("s"))
            .into_iter()
            .collect();
        out.local_check(
            state,
            &format!("rest_api_node_{node}"),
            &perf,
            &format!(
                "{} (Last Update: {})",
                message,
                report.last_update.as_deref().unwrap_or("Unknown")
            ),
        )?;
        worst = worst.worst(state);
    }
    Ok(worst)
}

pub const HARDWARE_ENDPOINTS: [&str; 3] = ["system", "thermal", "power"];

/// RAPID hardware agent: one JSON section per REST endpoint, skipping the
/// ones that fail.
pub fn run_hardware_agent<W: Write>(api: &ApiClient, out: &mut SectionWriter<W>) -> Result<usize> {
    let mut written = 0;
    for endpoint in HARDWARE_ENDPOINTS {
        match api.get(endpoint, &[]) {
            Ok(response) => {
                let Some(json) = response.json else {
                    warn!("{} returned no JSON, skipping section", endpoint);
                    continue;
                };
                out.section(&format!("rapid_{endpoint}"), Some('\0'))?;
                out.json(&json)?;
                written += 1;
            }
            Err(err) => warn!("no {} data: {:#}", endpoint, err),
        }
    }
    if written == 0 {
        return Err(anyhow!("RAPID server returned no data for any endpoint"));
    }
    Ok(written)
}

pub fn hardware_client(host: &str, username: &str, password: &str, options: &ClientOptions) -> Result<ApiClient> {
    let base = if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}/rest/v1", host.trim_end_matches('/'))
    } else {
        format!("https://{host}/rest/v1")
    };
    ApiClient::new(
        &base,
        Auth::Basic {
            username: username.to_string(),
            password: password.to_string(),
        },
        options,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn client(server: &MockServer) -> RapidClient {
        RapidClient::new(&server.base_url(), "key", &ClientOptions::default()).unwrap()
    }

    fn report(status: &str, error: Option<&str>, last: Option<&str>) -> NodeStatusReport {
        NodeStatusReport {
            connection: Some(status.parse().unwrap()),
            connection_error: error.map(str::to_string),
            last_update: last.map(str::to_string),
        }
    }

    fn render(
        snapshot: Option<&NodeSnapshot>,
        only: Option<&str>,
        now: DateTime<Utc>,
    ) -> String {
        let mut w = SectionWriter::new(Vec::new());
        write_node_checks(&mut w, "DB1", snapshot, only, now).unwrap();
        String::from_utf8(w.into_inner()).unwrap()
    }

    #[test]
    fn lists_names_from_urls() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/database/DB1/node")
                .header("Authorization", "Bearer key")
                .header("Accept", "text/plain");
            then.status(200).json_body(json!([
                "https://rapid:3001/api/v1/database/DB1/node/Collector",
                "https://rapid:3001/api/v1/database/DB1/node/Adaptor/"
            ]));
        });

        let nodes = client(&server).list_nodes("DB1").unwrap();
        mock.assert();
        assert_eq!(nodes, vec!["Collector", "Adaptor"]);
    }

    #[test]
    fn existence_checks_treat_errors_as_missing() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/database");
            then.status(200).json_body(json!(["/api/v1/database/DB1"]));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/database/DB1/node/N1/item");
            then.status(404);
        });

        let client = client(&server);
        assert!(client.database_exists("DB1"));
        assert!(!client.database_exists("DB2"));
        assert!(!client.item_exists("DB1", "N1", "I1"));
    }

    #[test]
    fn parses_node_status_payload() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/nodeconnections/database/DB1/node/N1/status");
            then.status(200).json_body(json!({
                "ConnectionStatus": {"ConnectionStatus": "CONNECTING_E"},
                "ConnectionError": "",
                "LastUpdate": "2024-05-01T10:00:00Z"
            }));
        });

        let status = client(&server).node_status("DB1", "N1").unwrap();
        assert_eq!(status.connection, Some(NodeConnection::Connecting));
        assert_eq!(status.connection_error, None);
        assert_eq!(status.last_update.as_deref(), Some("2024-05-01T10:00:00Z"));
    }

    #[test]
    fn creates_node_and_item_with_expected_bodies() {
        let server = MockServer::start();
        let node = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1/database/DB1/node")
                .query_param("format", "json")
                .json_body(json!({"Name": "N2", "Type": 2}));
            then.status(201).json_body(json!({"Name": "N2"}));
        });
        let item = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1.1/item")
                .query_param("format", "json")
                .json_body(json!({
                    "DbName": "DB1",
                    "NodeName": "N2",
                    "Name": "Temp",
                    "Description": "Test Item"
                }));
            then.status(200).json_body(json!({}));
        });

        let client = client(&server);
        client.create_node("DB1", "N2").unwrap();
        client.create_item("DB1", "N2", "Temp", "Test Item").unwrap();
        node.assert();
        item.assert();
    }

    #[test]
    fn writes_and_reads_process_data() {
        let server = MockServer::start();
        let start = parse_timestamp("2023-10-26T10:00:00").unwrap();
        let events = process_events(start, 2, &mut StdRng::seed_from_u64(7));
        let write = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v1/database/DB1/node/N1/item/I1/processData")
                .query_param("format", "json")
                .json_body(json!({"values": [
                    {"ts": "2023-10-26T10:00:00.000000", "val": events[0].val},
                    {"ts": "2023-10-26T10:00:00.001000", "val": events[1].val}
                ]}));
            then.status(200);
        });
        let read = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/database/DB1/node/N1/item/I1/processData")
                .query_param("startTime", "2023-10-26T10:00:00")
                .query_param("endTime", "2023-10-26T11:00:00")
                .query_param("format", "json");
            then.status(200).json_body(json!({"values": []}));
        });

        let client = client(&server);
        assert_eq!(client.write_process_data("DB1", "N1", "I1", &events).unwrap(), 2);
        let data = client
            .read_process_data("DB1", "N1", "I1", "2023-10-26T10:00:00", "2023-10-26T11:00:00")
            .unwrap();
        write.assert();
        read.assert();
        assert!(data["values"].is_array());
        assert!(events.iter().all(|e| (0.0..100.0).contains(&e.val)));
    }

    #[test]
    fn evaluates_node_states() {
        assert_eq!(
            report("CONNECTED_E", None, None).evaluate("n").0,
            State::Ok
        );
        let (state, msg) = report("DISCONNECTED_E", None, None).evaluate("n");
        assert_eq!(state, State::Crit);
        assert_eq!(msg, "Node 'n': Status CRITICAL - DISCONNECTED_E");
        assert_eq!(
            report("CONNECTED_E", Some("socket closed"), None).evaluate("n").0,
            State::Crit
        );
        let (state, msg) = report("WAITING_FOR_RETRY_E", None, None).evaluate("n");
        assert_eq!(state, State::Warn);
        assert_eq!(msg, "Node 'n': Status WARNING - WAITING_FOR_RETRY_E");

        let empty = NodeStatusReport {
            connection: None,
            connection_error: Some("boom".into()),
            last_update: None,
        };
        assert_eq!(
            empty.evaluate("n").1,
            "Node 'n': Status CRITICAL - Connection Error"
        );
    }

    #[test]
    fn renders_local_checks_with_age_perfdata() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap();
        let mut status = BTreeMap::new();
        status.insert(
            "Collector".to_string(),
            report("CONNECTED_E", None, Some("2024-05-01T10:00:00Z")),
        );
        status.insert("Adaptor".to_string(), NodeStatusReport::fetch_failed());
        let snapshot = NodeSnapshot {
            nodes: vec!["Collector".into(), "Adaptor".into()],
            status,
        };

        assert_eq!(
            render(Some(&snapshot), None, now),
            "<<<local>>>\n\
             0 rest_api_node_Collector time_since_update=60s Node 'Collector': Status OK - CONNECTED_E (Last Update: 2024-05-01T10:00:00Z)\n\
             2 rest_api_node_Adaptor - Node 'Adaptor': Status CRITICAL - Unknown (Last Update: Unknown)\n"
        );
        assert_eq!(
            render(Some(&snapshot), Some("Ghost"), now),
            "<<<local>>>\n3 rest_api_node_Ghost - Node 'Ghost' not found\n"
        );
        let mut sink = SectionWriter::new(Vec::new());
        let worst = write_node_checks(&mut sink, "DB1", Some(&snapshot), None, now).unwrap();
        assert_eq!(worst, State::Crit);
        let single =
            write_node_checks(&mut sink, "DB1", Some(&snapshot), Some("Collector"), now).unwrap();
        assert_eq!(single, State::Ok);
    }

    #[test]
    fn renders_missing_database_and_empty_node_list() {
        let now = Utc::now();
        assert_eq!(
            render(None, None, now),
            "<<<local>>>\n0 rest_api_nodes - Database 'DB1' not found\n"
        );
        let empty = NodeSnapshot {
            nodes: vec![],
            status: BTreeMap::new(),
        };
        assert_eq!(
            render(Some(&empty), None, now),
            "<<<local>>>\n0 rest_api_nodes - No nodes found in database 'DB1'\n"
        );
    }

    #[test]
    fn snapshot_marks_failed_status_fetches() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/database");
            then.status(200).json_body(json!(["/api/v1/database/DB1"]));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v1/database/DB1/node");
            then.status(200).json_body(json!(["/api/v1/database/DB1/node/N1"]));
        });
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/nodeconnections/database/DB1/node/N1/status");
            then.status(404);
        });

        let snapshot = client(&server).snapshot("DB1").unwrap().unwrap();
        assert_eq!(snapshot.status["N1"], NodeStatusReport::fetch_failed());
        let encoded = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(encoded["Status"]["N1"]["ConnectionStatus"], "Unknown");
        assert_eq!(encoded["Nodes"][0], "N1");
    }

    #[test]
    fn hardware_agent_skips_failing_endpoints() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/rest/v1/system");
            then.status(200).json_body(json!({"model": "R1"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/v1/thermal");
            then.status(500);
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/v1/power");
            then.status(200).json_body(json!({"psu": [1, 2]}));
        });

        let api = hardware_client(&server.base_url(), "u", "p", &ClientOptions::default())
            .unwrap()
            .with_sleeper(|_| {});
        let mut out = SectionWriter::new(Vec::new());
        let written = run_hardware_agent(&api, &mut out).unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            String::from_utf8(out.into_inner()).unwrap(),
            "<<<rapid_system:sep(0)>>>\n{\"model\":\"R1\"}\n<<<rapid_power:sep(0)>>>\n{\"psu\":[1,2]}\n"
        );
    }
}
