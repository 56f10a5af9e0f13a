//! Auto-downtime notification: puts a long-running downtime on hosts that have
//! been DOWN for longer than a threshold and removes it again on recovery.

use crate::checkmk::NotifyContext;
use crate::client::{ApiClient, Auth, ClientOptions, RetryPolicy};
use crate::config::CheckmkConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "http://localhost/site/check_mk/api/1.0";
pub const DEFAULT_API_USER: &str = "automation";
pub const DEFAULT_DURATION_DAYS: f64 = 2.0;
pub const COMMENT_MARKER: &str = "Auto-Downtime: Host DOWN";

const DOWNTIMES: &str = "domain-types/downtime/collections/all";
const DOWNTIME_SPAN_DAYS: i64 = 3650;

#[derive(Debug, Error)]
pub enum DowntimeError {
    #[error("no API key; set NOTIFY_PARAMETER_API_KEY or pass --api-key")]
    MissingApiKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub api_url: String,
    pub api_user: String,
    pub api_key: Option<String>,
    pub duration_days: f64,
}

fn days_to_delta(days: f64) -> Option<Duration> {
    let seconds = days * 86_400.0;
    if !seconds.is_finite() || seconds < 0.0 || seconds >= i64::MAX as f64 {
        return None;
    }
    Duration::try_seconds(seconds as i64)
}

/// Falls back to the default on anything that is not a positive number
/// or does not fit a time span.
pub fn parse_duration(raw: Option<&str>) -> f64 {
    match raw.map(|r| r.trim().parse::<f64>()) {
        Some(Ok(days)) if days_to_delta(days).is_some() => days,
        Some(_) => {
            warn!("invalid DURATION_DAYS, using {}", DEFAULT_DURATION_DAYS);
            DEFAULT_DURATION_DAYS
        }
        None => DEFAULT_DURATION_DAYS,
    }
}

impl Params {
    /// Flags and config first, then `NOTIFY_PARAMETER_*`, then defaults.
    pub fn resolve(ctx: &NotifyContext, overrides: CheckmkConfig, duration: Option<String>) -> Self {
        let param = |name: &str| ctx.parameter(name).map(str::to_string);
        Self {
            api_url: overrides
                .api_url
                .or_else(|| param("API_URL"))
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_user: overrides
                .api_user
                .or_else(|| param("API_USER"))
                .unwrap_or_else(|| DEFAULT_API_USER.to_string()),
            api_key: overrides
                .api_key
                .or_else(|| param("API_KEY"))
                .filter(|k| !k.trim().is_empty()),
            duration_days: parse_duration(duration.or_else(|| param("DURATION_DAYS")).as_deref()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Skipped(String),
    Created { host: String, id: String },
    Removed { host: String, count: usize },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Skipped(reason) => write!(f, "{reason}"),
            Outcome::Created { host, id } => write!(f, "Downtime set for {host} (ID: {id})"),
            Outcome::Removed { host, count: 0 } => write!(f, "No auto-downtimes for {host}"),
            Outcome::Removed { host, count } => write!(f, "{count} downtime(s) removed for {host}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DowntimeList {
    #[serde(default)]
    value: Vec<DowntimeEntry>,
}

#[derive(Debug, Deserialize)]
struct DowntimeEntry {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    extensions: Value,
}

impl DowntimeEntry {
    fn id(&self) -> Option<String> {
        match &self.id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn is_auto(&self) -> bool {
        self.extensions
            .get("comment")
            .and_then(Value::as_str)
            .is_some_and(|c| c.contains(COMMENT_MARKER))
    }
}

fn format_days(days: f64) -> String {
    if days.fract() == 0.0 {
        format!("{days:.1}")
    } else {
        days.to_string()
    }
}

#[derive(Debug)]
pub struct Notifier {
    api: ApiClient,
    duration_days: f64,
}

impl Notifier {
    pub fn new(params: &Params, options: &ClientOptions) -> Result<Self> {
        let key = params.api_key.as_deref().ok_or(DowntimeError::MissingApiKey)?;
        let auth = Auth::Header {
            name: "Authorization".to_string(),
            value: format!("Bearer {} {}", params.api_user, key),
        };
        let api = ApiClient::new(&params.api_url, auth, options)?.with_retry(RetryPolicy::none());
        Ok(Self {
            api,
            duration_days: params.duration_days,
        })
    }

    fn threshold(&self) -> Duration {
        days_to_delta(self.duration_days)
            .or_else(|| days_to_delta(DEFAULT_DURATION_DAYS))
            .unwrap_or_else(|| Duration::days(2))
    }

    pub fn set_downtime(&self, host: &str, now: DateTime<Utc>) -> Result<String> {
        let payload = json!({
            "downtime_type": "host",
            "host_name": host,
            "start_time": now.to_rfc3339(),
            "end_time": (now + Duration::days(DOWNTIME_SPAN_DAYS)).to_rfc3339(),
            "recur": "fixed",
            "comment": format!("{COMMENT_MARKER} for > {} days", format_days(self.duration_days)),
        });
        let response = self
            .api
            .post_json(DOWNTIMES, &[], Some(&payload))
            .with_context(|| format!("setting downtime for {host}"))?;
        Ok(response
            .json
            .as_ref()
            .and_then(|j| j.get("id"))
            .and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| "unknown".to_string()))
    }

    /// Deletes every downtime of `host` whose comment carries the marker.
    pub fn remove_downtimes(&self, host: &str) -> Result<usize> {
        let list: DowntimeList = self
            .api
            .get_json(DOWNTIMES, &[("host_name", host.to_string())])
            .with_context(|| format!("listing downtimes of {host}"))?;
        let mut removed = 0;
        for entry in list.value.iter().filter(|e| e.is_auto()) {
            let Some(id) = entry.id() else {
                continue;
            };
            match self.api.delete(&format!("objects/downtime/{id}")) {
                Ok(_) => removed += 1,
                Err(err) => warn!("deleting downtime {}: {:#}", id, err),
            }
        }
        Ok(removed)
    }

    pub fn handle(&self, ctx: &NotifyContext, now: DateTime<Utc>) -> Result<Outcome> {
        let host = ctx.get("HOSTNAME").unwrap_or_default().to_string();
        match ctx.get("HOSTSTATE") {
            Some("DOWN") => {
                let Some(last_up) = ctx
                    .get("HOSTLASTUPTIME")
                    .filter(|v| v.chars().all(|c| c.is_ascii_digit()))
                    .and_then(|v| v.parse::<i64>().ok())
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                else {
                    return Ok(Outcome::Skipped(format!(
                        "No valid HOSTLASTUPTIME for {host}"
                    )));
                };
                let down_for = now - last_up;
                if down_for < self.threshold() {
                    return Ok(Outcome::Skipped(format!(
                        "{host} DOWN only {}d {}h < {}d, skipping",
                        down_for.num_days(),
                        down_for.num_hours() % 24,
                        format_days(self.duration_days)
                    )));
                }
                let id = self.set_downtime(&host, now)?;
                info!("downtime {} set for {}", id, host);
                Ok(Outcome::Created { host, id })
            }
            Some("UP") => {
                let count = self.remove_downtimes(&host)?;
                Ok(Outcome::Removed { host, count })
            }
            other => Ok(Outcome::Skipped(format!(
                "Unknown HOSTSTATE: {}",
                other.unwrap_or_default()
            ))),
        }
    }
}

/// Non-host events are skipped before credentials are checked.
pub fn run(
    ctx: &NotifyContext,
    params: &Params,
    options: &ClientOptions,
    now: DateTime<Utc>,
) -> Result<Outcome> {
    if ctx.get("WHAT") != Some("HOST") {
        return Ok(Outcome::Skipped("Only HOST events are processed".to_string()));
    }
    Notifier::new(params, options)?.handle(ctx, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;

    fn ctx(pairs: &[(&str, &str)]) -> NotifyContext {
        NotifyContext::from_vars(
            pairs
                .iter()
                .map(|(k, v)| (format!("NOTIFY_{k}"), v.to_string())),
        )
    }

    fn params(url: String) -> Params {
        Params {
            api_url: url,
            api_user: "automation".into(),
            api_key: Some("secret".into()),
            duration_days: 2.0,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn resolves_parameters_with_fallbacks() {
        let c = ctx(&[
            ("PARAMETER_API_URL", "https://cmk/site/check_mk/api/1.0"),
            ("PARAMETER_API_KEY", "k"),
            ("PARAMETER_DURATION_DAYS", "abc"),
        ]);
        let p = Params::resolve(&c, CheckmkConfig::default(), None);
        assert_eq!(p.api_url, "https://cmk/site/check_mk/api/1.0");
        assert_eq!(p.api_user, DEFAULT_API_USER);
        assert_eq!(p.api_key.as_deref(), Some("k"));
        assert_eq!(p.duration_days, DEFAULT_DURATION_DAYS);

        let over = CheckmkConfig {
            api_user: Some("bot".into()),
            ..Default::default()
        };
        let p = Params::resolve(&c, over, Some("0.5".into()));
        assert_eq!(p.api_user, "bot");
        assert_eq!(p.duration_days, 0.5);
    }

    #[test]
    fn out_of_range_duration_uses_default() {
        let c = ctx(&[("PARAMETER_DURATION_DAYS", "1e12")]);
        let p = Params::resolve(&c, CheckmkConfig::default(), None);
        assert_eq!(p.duration_days, DEFAULT_DURATION_DAYS);
        assert_eq!(parse_duration(Some("-1")), DEFAULT_DURATION_DAYS);
        assert_eq!(parse_duration(Some("inf")), DEFAULT_DURATION_DAYS);
        assert_eq!(parse_duration(Some("36500")), 36500.0);

        let mut huge = params("http://127.0.0.1:9".into());
        huge.duration_days = 1e12;
        let n = Notifier::new(&huge, &ClientOptions::default()).unwrap();
        let recent = (now() - Duration::hours(30)).timestamp().to_string();
        let outcome = n
            .handle(
                &ctx(&[("HOSTNAME", "web01"), ("HOSTSTATE", "DOWN"), ("HOSTLASTUPTIME", recent.as_str())]),
                now(),
            )
            .unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
    }

    #[test]
    fn skips_service_events_and_requires_key_for_hosts() {
        let mut p = params("http://127.0.0.1:9".into());
        p.api_key = None;
        let outcome = run(&ctx(&[("WHAT", "SERVICE")]), &p, &ClientOptions::default(), now()).unwrap();
        assert_eq!(outcome, Outcome::Skipped("Only HOST events are processed".into()));

        let err = run(&ctx(&[("WHAT", "HOST")]), &p, &ClientOptions::default(), now()).unwrap_err();
        assert!(err.to_string().contains("no API key"));
    }

    #[test]
    fn skips_short_or_unknown_outages() {
        let n = Notifier::new(&params("http://127.0.0.1:9".into()), &ClientOptions::default()).unwrap();
        let recent = (now() - Duration::hours(30)).timestamp().to_string();
        let outcome = n
            .handle(
                &ctx(&[("HOSTNAME", "web01"), ("HOSTSTATE", "DOWN"), ("HOSTLASTUPTIME", recent.as_str())]),
                now(),
            )
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Skipped("web01 DOWN only 1d 6h < 2.0d, skipping".into())
        );

        let outcome = n
            .handle(&ctx(&[("HOSTNAME", "web01"), ("HOSTSTATE", "DOWN")]), now())
            .unwrap();
        assert_eq!(outcome, Outcome::Skipped("No valid HOSTLASTUPTIME for web01".into()));

        let outcome = n
            .handle(&ctx(&[("HOSTNAME", "web01"), ("HOSTSTATE", "UNREACH")]), now())
            .unwrap();
        assert_eq!(outcome, Outcome::Skipped("Unknown HOSTSTATE: UNREACH".into()));
    }

    #[test]
    fn sets_downtime_after_threshold() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/domain-types/downtime/collections/all")
                .header("Authorization", "Bearer automation secret")
                .json_body(json!({
                    "downtime_type": "host",
                    "host_name": "web01",
                    "start_time": "2024-05-10T12:00:00+00:00",
                    "end_time": "2034-05-08T12:00:00+00:00",
                    "recur": "fixed",
                    "comment": "Auto-Downtime: Host DOWN for > 2.0 days"
                }));
            then.status(200).json_body(json!({"id": "17"}));
        });
        let n = Notifier::new(&params(server.base_url()), &ClientOptions::default()).unwrap();
        let last_up = (now() - Duration::days(3)).timestamp().to_string();
        let outcome = n
            .handle(
                &ctx(&[("HOSTNAME", "web01"), ("HOSTSTATE", "DOWN"), ("HOSTLASTUPTIME", last_up.as_str())]),
                now(),
            )
            .unwrap();
        mock.assert();
        assert_eq!(outcome.to_string(), "Downtime set for web01 (ID: 17)");
    }

    #[test]
    fn removes_only_auto_downtimes_on_recovery() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/domain-types/downtime/collections/all")
                .query_param("host_name", "web01");
            then.status(200).json_body(json!({"value": [
                {"id": "1", "extensions": {"comment": "Auto-Downtime: Host DOWN for > 2.0 days"}},
                {"id": "2", "extensions": {"comment": "maintenance"}},
                {"id": 3, "extensions": {"comment": "Auto-Downtime: Host DOWN for > 1.5 days"}}
            ]}));
        });
        let first = server.mock(|when, then| {
            when.method(DELETE).path("/objects/downtime/1");
            then.status(204);
        });
        let third = server.mock(|when, then| {
            when.method(DELETE).path("/objects/downtime/3");
            then.status(204);
        });
        let n = Notifier::new(&params(server.base_url()), &ClientOptions::default()).unwrap();
        let outcome = n
            .handle(&ctx(&[("HOSTNAME", "web01"), ("HOSTSTATE", "UP")]), now())
            .unwrap();
        first.assert();
        third.assert();
        assert_eq!(
            outcome,
            Outcome::Removed {
                host: "web01".into(),
                count: 2
            }
        );
    }

    #[test]
    fn api_errors_propagate() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/domain-types/downtime/collections/all");
            then.status(403).body("forbidden");
        });
        let n = Notifier::new(&params(server.base_url()), &ClientOptions::default()).unwrap();
        let err = n
            .handle(&ctx(&[("HOSTNAME", "web01"), ("HOSTSTATE", "UP")]), now())
            .unwrap_err();
        assert!(format!("{err:#}").contains("listing downtimes of web01"));
    }
}
