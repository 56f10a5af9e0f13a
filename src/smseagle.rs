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

//! SMSEagle API v2 notifier: SMS, text-to-speech calls and wave calls with
//! failover to a second device.

use crate::checkmk::NotifyContext;
use crate::client::{ApiClient, Auth, ClientOptions, RetryPolicy};
use crate::config::SmsEagleSettings;
use anyhow::{Context, Result};
use clap::ValueEnum;
use log::{error, info, warn};
use serde_json::{Map, Value, json};
use thiserror::Error;

pub const DEFAULT_VOICE_ID: u32 = 3;

const HOST_TEMPLATE: &str = "$NOTIFICATIONTYPE$ Host $HOSTNAME$ is $HOSTSTATE$ - $HOSTOUTPUT$";
const SERVICE_TEMPLATE: &str =
    "$NOTIFICATIONTYPE$ Service $SERVICEDESC$ on $HOSTNAME$ is $SERVICESTATE$ - $SERVICEOUTPUT$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MessageType {
    Sms,
    #[value(name = "call_tts", alias = "call-tts")]
    CallTts,
    Wave,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Sms => "sms",
            MessageType::CallTts => "call_tts",
            MessageType::Wave => "wave",
        }
    }

    pub fn endpoint(self) -> &'static str {
        match self {
            MessageType::Sms => "api/v2/messages/sms",
            MessageType::CallTts => "api/v2/calls/tts_advanced",
            MessageType::Wave => "api/v2/calls/wave",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SmsEagleError {
    #[error("no recipient given; pass --to, --contacts or --groups")]
    NoRecipient,
    #[error("--text is required for {0} messages")]
    MissingText(&'static str),
    #[error("--wave-id is required for wave calls")]
    MissingWaveId,
    #[error("API returned a list, not an object")]
    ListResponse,
    #[error("message not queued: {0}")]
    NotQueued(String),
    #[error("invalid JSON response: {0}")]
    InvalidJson(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients {
    pub to: Vec<String>,
    pub contacts: Vec<u32>,
    pub groups: Vec<u32>,
}

impl Recipients {
    pub fn is_empty(&self) -> bool {
        self.to.is_empty() && self.contacts.is_empty() && self.groups.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub recipients: Recipients,
    pub text: Option<String>,
    pub wave_id: Option<u32>,
    pub voice_id: u32,
    pub modem_no: u32,
}

impl Message {
    pub fn validate(&self) -> Result<(), SmsEagleError> {
        if self.recipients.is_empty() {
            return Err(SmsEagleError::NoRecipient);
        }
        match self.kind {
            MessageType::Sms | MessageType::CallTts
                if self.text.as_deref().is_none_or(|t| t.trim().is_empty()) =>
            {
                Err(SmsEagleError::MissingText(self.kind.as_str()))
            }
            MessageType::Wave if self.wave_id.is_none() => Err(SmsEagleError::MissingWaveId),
            _ => Ok(()),
        }
    }

    pub fn payload(&self) -> Value {
        let mut body = Map::new();
        if !self.recipients.to.is_empty() {
            body.insert("to".into(), json!(self.recipients.to));
        }
        if !self.recipients.contacts.is_empty() {
            body.insert("contacts".into(), json!(self.recipients.contacts));
        }
        if !self.recipients.groups.is_empty() {
            body.insert("groups".into(), json!(self.recipients.groups));
        }
        body.insert("modem_no".into(), json!(self.modem_no));
        match self.kind {
            MessageType::Sms => {
                body.insert("text".into(), json!(self.text));
            }
            MessageType::CallTts => {
                body.insert("text".into(), json!(self.text));
                body.insert("voice_id".into(), json!(self.voice_id));
            }
            MessageType::Wave => {
                body.insert("wave_id".into(), json!(self.wave_id));
            }
        }
        Value::Object(body)
    }
}

/// Parses a comma separated id list such as `12,15`.
pub fn parse_ids(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().with_context(|| format!("invalid id `{s}`")))
        .collect()
}

/// Only a JSON object with `status == "queued"` counts as delivered.
pub fn interpret(json: Option<&Value>, body: &str) -> Result<Value, SmsEagleError> {
    match json {
        Some(Value::Array(_)) => Err(SmsEagleError::ListResponse),
        Some(Value::Object(map)) if map.get("status").and_then(Value::as_str) == Some("queued") => {
            Ok(Value::Object(map.clone()))
        }
        Some(Value::Object(map)) => Err(SmsEagleError::NotQueued(
            map.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string()),
        )),
        _ => Err(SmsEagleError::InvalidJson(body.to_string())),
    }
}

#[derive(Debug)]
pub struct Notifier {
    servers: Vec<ApiClient>,
}

impl Notifier {
    pub fn new(settings: &SmsEagleSettings, options: &ClientOptions) -> Result<Self> {
        let options = ClientOptions {
            verify_tls: settings.verify_tls && options.verify_tls,
            ..options.clone()
        };
        let mut servers = vec![device(&settings.url, &settings.token, &options)?];
        if let Some((url, token)) = &settings.fallback {
            servers.push(device(url, token, &options)?);
        }
        Ok(Self { servers })
    }

    fn send_to(api: &ApiClient, message: &Message) -> Result<Value> {
        let response = api.post_json(message.kind.endpoint(), &[], Some(&message.payload()))?;
        info!("API response: {}", response.body);
        Ok(interpret(response.json.as_ref(), &response.body)?)
    }

    /// Tries every configured device in order; the first queued answer wins.
    pub fn send(&self, message: &Message) -> Result<Value> {
        message.validate()?;
        let mut last = None;
        for (idx, api) in self.servers.iter().enumerate() {
            if idx > 0 {
                info!("trying secondary server {}", api.base_url());
            }
            match Self::send_to(api, message) {
                Ok(answer) => {
                    info!(
                        "message sent successfully. Number: {}, ID: {}",
                        answer.get("number").unwrap_or(&Value::Null),
                        answer.get("id").unwrap_or(&Value::Null)
                    );
                    return Ok(answer);
                }
                Err(err) => {
                    error!("sending via {} failed: {:#}", api.base_url(), err);
                    last = Some(err);
                }
            }
        }
        Err(last
            .unwrap_or_else(|| anyhow::anyhow!("no SMSEagle server configured"))
            .context("all SMSEagle servers failed"))
    }
}

fn device(url: &str, token: &str, options: &ClientOptions) -> Result<ApiClient> {
    let auth = Auth::Header {
        name: "access-token".to_string(),
        value: token.to_string(),
    };
    Ok(ApiClient::new(url, auth, options)?.with_retry(RetryPolicy::none()))
}

pub fn default_text(ctx: &NotifyContext) -> String {
    ctx.expand(if ctx.is_service() {
        SERVICE_TEMPLATE
    } else {
        HOST_TEMPLATE
    })
}

pub fn pager(ctx: &NotifyContext) -> Option<&str> {
    let pager = ctx.get("CONTACTPAGER");
    if pager.is_none() {
        warn!("NOTIFY_CONTACTPAGER is not set");
    }
    pager
}
