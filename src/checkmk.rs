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

//! Checkmk agent text protocol and Nagios plugin output.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::io::Write;
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    Ok,
    Warn,
    Crit,
    Unknown,
}

impl State {
    pub fn code(self) -> u8 {
        match self {
            State::Ok => 0,
            State::Warn => 1,
            State::Crit => 2,
            State::Unknown => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            State::Ok => "OK",
            State::Warn => "WARNING",
            State::Crit => "CRITICAL",
            State::Unknown => "UNKNOWN",
        }
    }

    pub fn exit_code(self) -> ExitCode {
        ExitCode::from(self.code())
    }

    // Checkmk ranks UNKNOWN between WARN and CRIT.
    fn severity(self) -> u8 {
        match self {
            State::Ok => 0,
            State::Warn => 1,
            State::Unknown => 2,
            State::Crit => 3,
        }
    }

    pub fn worst(self, other: State) -> State {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upper,
    Lower,
}

/// Warn/crit thresholds. `Upper` alerts when the value rises to a level,
/// `Lower` when it falls to one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Levels {
    pub warn: f64,
    pub crit: f64,
    pub direction: Direction,
}

impl Levels {
    pub fn try_new(direction: Direction, warn: f64, crit: f64) -> Result<Self> {
        let ordered = match direction {
            Direction::Upper => warn <= crit,
            Direction::Lower => warn >= crit,
        };
        if !ordered {
            bail!("inconsistent levels: warn {warn} / crit {crit} for {direction:?} bounds");
        }
        Ok(Self {
            warn,
            crit,
            direction,
        })
    }

    pub fn evaluate(&self, value: f64) -> State {
        match self.direction {
            Direction::Upper if value >= self.crit => State::Crit,
            Direction::Upper if value >= self.warn => State::Warn,
            Direction::Lower if value <= self.crit => State::Crit,
            Direction::Lower if value <= self.warn => State::Warn,
            _ => State::Ok,
        }
    }
}

impl fmt::Display for Levels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "warn/crit at {}/{}", self.warn, self.crit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Perfdata {
    pub label: String,
    pub value: f64,
    pub uom: String,
    pub warn: Option<f64>,
    pub crit: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Perfdata {
    pub fn new(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
            uom: String::new(),
            warn: None,
            crit: None,
            min: None,
            max: None,
        }
    }

    pub fn uom(mut self, uom: &str) -> Self {
        self.uom = uom.to_string();
        self
    }

    pub fn levels(mut self, warn: f64, crit: f64) -> Self {
        self.warn = Some(warn);
        self.crit = Some(crit);
        self
    }

    pub fn bounds(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }
}

fn num(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}

impl fmt::Display for Perfdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = vec![
            format!("{}{}", num(self.value), self.uom),
            self.warn.map(num).unwrap_or_default(),
            self.crit.map(num).unwrap_or_default(),
            self.min.map(num).unwrap_or_default(),
            self.max.map(num).unwrap_or_default(),
        ];
        while fields.len() > 1 && fields.last().is_some_and(|f| f.is_empty()) {
            fields.pop();
        }
        write!(f, "'{}'={}", self.label.replace('\'', ""), fields.join(";"))
    }
}

/// Result of a Nagios-style active check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub state: State,
    pub summary: String,
    pub perfdata: Vec<Perfdata>,
}

impl CheckOutcome {
    pub fn new(state: State, summary: impl Into<String>) -> Self {
        Self {
            state,
            summary: summary.into(),
            perfdata: Vec::new(),
        }
    }

    pub fn with_perf(mut self, perf: Perfdata) -> Self {
        self.perfdata.push(perf);
        self
    }

    pub fn render(&self) -> String {
        let mut out = format!("{} - {}", self.state.label(), self.summary);
        if !self.perfdata.is_empty() {
            let perf: Vec<String> = self.perfdata.iter().map(|p| p.to_string()).collect();
            out.push('|');
            out.push_str(&perf.join(" "));
        }
        out
    }
}

/// Writes agent sections to any sink, usually stdout.
pub struct SectionWriter<W: Write> {
    out: W,
    sep: Option<char>,
}

impl<W: Write> SectionWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, sep: None }
    }

    pub fn section(&mut self, name: &str, sep: Option<char>) -> Result<()> {
        match sep {
            Some(c) => {
                if !matches!(c, '\0' | ' '..='~') {
                    bail!("separator {c:?} is not printable ASCII");
                }
                writeln!(self.out, "<<<{name}:sep({})>>>", c as u32)
            }
            None => writeln!(self.out, "<<<{name}>>>"),
        }
        .context("writing section header")?;
        self.sep = sep;
        Ok(())
    }

    pub fn line<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<()> {
        let sep = self.sep.unwrap_or(' ');
        let rendered: Vec<String> = fields
            .iter()
            .map(|f| sanitize(f.as_ref(), self.sep))
            .collect();
        writeln!(self.out, "{}", rendered.join(&sep.to_string())).context("writing section line")
    }

    pub fn raw(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "{}", sanitize(text, None)).context("writing section line")
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value).context("encoding section JSON")?;
        writeln!(self.out, "{encoded}").context("writing section JSON")
    }

    pub fn piggyback(&mut self, host: &str) -> Result<()> {
        let host: String = host
            .trim()
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();
        writeln!(self.out, "<<<<{host}>>>>").context("writing piggyback header")
    }

    pub fn end_piggyback(&mut self) -> Result<()> {
        writeln!(self.out, "<<<<>>>>").context("writing piggyback footer")
    }

    pub fn local_check(
        &mut self,
        state: State,
        service: &str,
        perfdata: &[Perfdata],
        text: &str,
    ) -> Result<()> {
        let service: String = service
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();
        let perf = if perfdata.is_empty() {
            "-".to_string()
        } else {
            perfdata
                .iter()
                .map(|p| p.to_string().replace('\'', ""))
                .collect::<Vec<_>>()
                .join("|")
        };
        writeln!(
            self.out,
            "{} {} {} {}",
            state.code(),
            service,
            perf,
            sanitize(text, None)
        )
        .context("writing local check")
    }

    pub fn agent_info(&mut self, version: &str, os: &str, build_date: &str) -> Result<()> {
        self.section("check_mk", None)?;
        writeln!(self.out, "Version: {version}")?;
        writeln!(self.out, "AgentOS: {os}")?;
        writeln!(self.out, "BuildDate: {build_date}")?;
        Ok(())
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Notification context handed to notification scripts as `NOTIFY_*`
/// variables, keyed without the prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyContext(pub BTreeMap<String, String>);

impl NotifyContext {
    pub fn from_env() -> Self {
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I: IntoIterator<Item = (String, String)>>(vars: I) -> Self {
        Self(
            vars.into_iter()
                .filter_map(|(k, v)| k.strip_prefix("NOTIFY_").map(|k| (k.to_string(), v)))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// `PARAMETER_<name>` as configured on the notification rule.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.get(&format!("PARAMETER_{name}"))
    }

    pub fn is_service(&self) -> bool {
        self.get("WHAT") == Some("SERVICE")
    }

    /// Replaces `$KEY$` placeholders; unknown keys are left untouched.
    pub fn expand(&self, template: &str) -> String {
        let mut text = template.to_string();
        for (key, value) in &self.0 {
            let placeholder = format!("${key}$");
            if text.contains(&placeholder) {
                text = text.replace(&placeholder, value);
            }
        }
        text
    }
}

fn sanitize(field: &str, sep: Option<char>) -> String {
    field
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            c if Some(c) == sep => '/',
            c => c,
        })
        .collect()
}
