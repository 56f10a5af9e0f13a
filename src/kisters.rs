//! Availability agent for Kisters REST endpoints. Every configured entry is
//! requested once and reported with its status code and response time.

use crate::checkmk::SectionWriter;
use anyhow::{Context, Result, bail};
use log::{debug, warn};
use reqwest::Method;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use std::io::Write;
use std::time::{Duration, Instant};

pub const SECTION: &str = "kisters_rest_check";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Endpoint {
    pub instance: Option<String>,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub data: Option<Value>,
    pub user: Option<String>,
    pub password: Option<String>,
    #[serde(rename = "pvId", default, deserialize_with = "pv_id")]
    pub pv_id: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn pv_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl Endpoint {
    pub fn instance(&self) -> &str {
        self.instance.as_deref().unwrap_or(&self.url)
    }

    /// The request URL with `pvId` appended as a query parameter.
    pub fn target(&self) -> String {
        match &self.pv_id {
            Some(id) if self.url.contains('?') => format!("{}&pvId={id}", self.url),
            Some(id) => format!("{}?pvId={id}", self.url),
            None => self.url.clone(),
        }
    }
}

pub fn parse_config(raw: &str) -> Result<Vec<Endpoint>> {
    let value: Value = serde_json::from_str(raw).context("parsing --config JSON")?;
    if !value.is_array() {
        bail!("Configuration must be a list of entries");
    }
    serde_json::from_value(value).context("invalid configuration entry")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    Answered { status: u16, elapsed: Duration },
    Failed(String),
}

pub fn probe(http: &Client, endpoint: &Endpoint) -> Result<Probe> {
    let method = Method::from_bytes(endpoint.method.to_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method `{}`", endpoint.method))?;
    let mut request = http.request(method, endpoint.target());
    if let (Some(user), Some(password)) = (&endpoint.user, &endpoint.password) {
        request = request.basic_auth(user, Some(password));
    }
    request = match &endpoint.data {
        Some(Value::String(text)) => request.body(text.clone()),
        Some(Value::Object(form)) => request.form(form),
        Some(other) => request.body(other.to_string()),
        None => request,
    };

    let started = Instant::now();
    Ok(match request.send() {
        Ok(response) => {
            let status = response.status().as_u16();
            debug!("{} answered {}", endpoint.instance(), status);
            Probe::Answered {
                status,
                elapsed: started.elapsed(),
            }
        }
        Err(err) => {
            warn!("{}: {}", endpoint.instance(), err);
            Probe::Failed(err.to_string())
        }
    })
}

pub fn write_result<W: Write>(
    out: &mut SectionWriter<W>,
    endpoint: &Endpoint,
    result: &Probe,
) -> Result<()> {
    out.raw(&format!("instance: {}", endpoint.instance()))?;
    match result {
        Probe::Answered { status, elapsed } => {
            out.raw(&format!("status_code: {status}"))?;
            out.raw(&format!("response_time: {:.3}", elapsed.as_secs_f64()))?;
        }
        Probe::Failed(err) => {
            out.raw("status_code: -1")?;
            out.raw(&format!("error: {err}"))?;
        }
    }
    if let Some(id) = &endpoint.pv_id {
        out.raw(&format!("pvId: {id}"))?;
    }
    out.raw("---")
}

pub fn run<W: Write>(
    out: &mut SectionWriter<W>,
    endpoints: &[Endpoint],
    timeout: Duration,
    verify_tls: bool,
) -> Result<()> {
    let http = Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!verify_tls)
        .build()
        .context("building HTTP client")?;
    out.section(SECTION, None)?;
    for endpoint in endpoints {
        let result = probe(&http, endpoint)?;
        write_result(out, endpoint, &result)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn config_must_be_a_list() {
        let err = parse_config(r#"{"url": "http://x"}"#).unwrap_err();
        assert!(err.to_string().contains("must be a list"));

        let entries =
            parse_config(r#"[{"url": "http://x/api?a=1", "pvId": 42}, {"url": "http://y", "instance": "y", "pvId": ""}]"#)
                .unwrap();
        assert_eq!(entries[0].method, "GET");
        assert_eq!(entries[0].instance(), "http://x/api?a=1");
        assert_eq!(entries[0].target(), "http://x/api?a=1&pvId=42");
        assert_eq!(entries[1].pv_id, None);
        assert_eq!(entries[1].target(), "http://y");
    }

    #[test]
    fn reports_each_endpoint() {
        let server = MockServer::start();
        let ok = server.mock(|when, then| {
            when.method(POST)
                .path("/kiwis")
                .query_param("pvId", "7")
                .header("Authorization", "Basic dTpw")
                .body("q=1");
            then.status(200).body("ok");
        });
        server.mock(|when, then| {
            when.method(GET).path("/broken");
            then.status(503);
        });

        let config = format!(
            r#"[
                {{"instance": "kiwis", "url": "{}", "method": "post", "data": "q=1", "user": "u", "password": "p", "pvId": "7"}},
                {{"url": "{}"}},
                {{"instance": "down", "url": "http://127.0.0.1:9/"}}
            ]"#,
            server.url("/kiwis"),
            server.url("/broken"),
        );
        let endpoints = parse_config(&config).unwrap();
        let mut out = SectionWriter::new(Vec::new());
        run(&mut out, &endpoints, Duration::from_secs(2), true).unwrap();
        ok.assert();

        let text = String::from_utf8(out.into_inner()).unwrap();
        let lines: Vec<&str> = text
            .lines()
            .filter(|l| !l.starts_with("response_time: ") && !l.starts_with("error: "))
            .collect();
        let broken = format!("instance: {}", server.url("/broken"));
        assert_eq!(
            lines,
            vec![
                "<<<kisters_rest_check>>>",
                "instance: kiwis",
                "status_code: 200",
                "pvId: 7",
                "---",
                broken.as_str(),
                "status_code: 503",
                "---",
                "instance: down",
                "status_code: -1",
                "---",
            ]
        );
        assert_eq!(text.matches("response_time: ").count(), 2);
        assert_eq!(text.matches("error: ").count(), 1);
    }
}
