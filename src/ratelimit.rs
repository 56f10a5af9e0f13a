//! XIQ API rate-limit headers: parsing, the agent section and the Nagios
//! style check.

use crate::checkmk::{CheckOutcome, Direction, Levels, Perfdata, SectionWriter, State};
use crate::client::{ApiClient, ResponseData, RetryPolicy, is_timeout};
use anyhow::Result;
use reqwest::Method;
use serde_json::Value;
use std::io::Write;
use std::time::Duration;

pub const DEFAULT_WARN_PERCENT: f64 = 20.0;
pub const DEFAULT_CRIT_PERCENT: f64 = 5.0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// `None` when no HTTP response was received.
    pub status: Option<u16>,
    pub limit: Option<u64>,
    pub window: Option<u64>,
    pub remaining: Option<u64>,
    pub reset: Option<u64>,
    pub headers: Vec<(String, String)>,
}

/// Parses `RateLimit-Limit` values such as `7500` or `7500;w=3600`.
pub fn parse_limit(raw: &str) -> Option<(u64, Option<u64>)> {
    let mut parts = raw.split(';');
    let limit = parts.next()?.trim().parse().ok()?;
    let window = parts
        .filter_map(|p| p.trim().strip_prefix("w="))
        .find_map(|w| w.trim().parse().ok());
    Some((limit, window))
}

impl RateLimitInfo {
    pub fn no_response() -> Self {
        Self::default()
    }

    pub fn from_response(response: &ResponseData) -> Self {
        let number = |name: &str| {
            response
                .header(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        let (limit, window) = response
            .header("ratelimit-limit")
            .and_then(parse_limit)
            .map_or((None, None), |(l, w)| (Some(l), w));

        let mut headers: Vec<(String, String)> = response
            .headers
            .iter()
            .filter(|(name, _)| {
                let name = name.as_str();
                name.starts_with("ratelimit") || name.starts_with("x-ratelimit") || name == "retry-after"
            })
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        headers.sort();

        Self {
            status: Some(response.status),
            limit,
            window,
            remaining: number("ratelimit-remaining"),
            reset: number("ratelimit-reset"),
            headers,
        }
    }

    pub fn agent_state(&self) -> &'static str {
        match self.status {
            None => "NO_RESPONSE",
            Some(_) if self.headers.is_empty() => "UNLIMITED",
            Some(_) => "OK",
        }
    }

    /// `<<<extreme_cloud_iq_rate_limits>>>` key/value lines.
    pub fn write_section<W: Write>(&self, out: &mut SectionWriter<W>) -> Result<()> {
        let opt = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_default();
        out.section("extreme_cloud_iq_rate_limits", None)?;
        out.line(&["state", self.agent_state()])?;
        out.line(&["limit".to_string(), opt(self.limit)])?;
        out.line(&["remaining".to_string(), opt(self.remaining)])?;
        out.line(&["reset_in_seconds".to_string(), opt(self.reset)])?;
        out.line(&["window_s".to_string(), opt(self.window)])?;
        out.line(&[
            "status_code".to_string(),
            self.status.map(|s| s.to_string()).unwrap_or_default(),
        ])?;
        out.raw("headers_begin")?;
        for (name, value) in &self.headers {
            out.raw(&format!("header {name}: {value}"))?;
        }
        out.raw("headers_end")
    }
}

/// Builds lower-bound levels on the remaining percentage. Swaps the values
/// when warn is below crit.
pub fn levels(warn: f64, crit: f64) -> Result<Levels> {
    let (warn, crit) = if warn < crit { (crit, warn) } else { (warn, crit) };
    Levels::try_new(Direction::Lower, warn, crit)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn evaluate(info: &RateLimitInfo, levels: &Levels) -> CheckOutcome {
    let Some(status) = info.status else {
        return CheckOutcome::new(State::Unknown, "No response from API");
    };

    if status == 429 {
        let remaining = info.remaining.unwrap_or(0);
        let reset = info.reset.unwrap_or(0);
        return CheckOutcome::new(
            State::Crit,
            format!("API Limit reached: {remaining} requests remaining, reset in {reset}s"),
        )
        .with_perf(Perfdata::new("remaining_requests", remaining as f64))
        .with_perf(Perfdata::new("reset_seconds", reset as f64).uom("s"));
    }

    if !(200..300).contains(&status) {
        return CheckOutcome::new(State::Unknown, format!("API error: HTTP status {status}"));
    }

    let (Some(limit), Some(remaining), Some(reset)) = (info.limit, info.remaining, info.reset)
    else {
        return CheckOutcome::new(State::Unknown, "Rate limit headers missing in response");
    };
    if limit == 0 {
        return CheckOutcome::new(State::Unknown, "API reported a rate limit of 0 requests");
    }

    let ratio = remaining as f64 / limit as f64;
    let remaining_percent = round2(ratio * 100.0);
    let used_percent = round2((1.0 - ratio) * 100.0);
    let state = levels.evaluate(remaining_percent);

    CheckOutcome::new(
        state,
        format!(
            "API Limit: {remaining} requests ({remaining_percent:.2}%) remaining (used: {used_percent:.2}%). Reset in {reset}s."
        ),
    )
    .with_perf(
        Perfdata::new("remaining_requests", remaining as f64)
            .levels(
                (limit as f64 * levels.warn / 100.0).floor(),
                (limit as f64 * levels.crit / 100.0).floor(),
            )
            .bounds(0.0, limit as f64),
    )
    .with_perf(
        Perfdata::new("remaining_percent", remaining_percent)
            .uom("%")
            .levels(levels.warn, levels.crit)
            .bounds(0.0, 100.0),
    )
    .with_perf(Perfdata::new("reset_seconds", reset as f64).uom("s"))
}

/// Probes `devices` once and evaluates the rate-limit headers. Transport
/// failures are CRIT.
pub fn check(api: &ApiClient, levels: &Levels, timeout: Duration) -> CheckOutcome {
    let api = api.clone().with_retry(RetryPolicy::none());
    let query = [("page", "1".to_string()), ("limit", "1".to_string())];
    match api.send(Method::GET, "devices", &query, Option::<&Value>::None) {
        Ok(response) => evaluate(&RateLimitInfo::from_response(&response), levels),
        Err(err) if is_timeout(&err) => CheckOutcome::new(
            State::Crit,
            format!("API connection timed out after {}s", timeout.as_secs()),
        ),
        Err(err) => CheckOutcome::new(State::Crit, format!("Connection or request error: {err:#}")),
    }
}
