//! ExtremeCloud IQ special agent: account sections, device inventory and one
//! piggyback block per access point.

use crate::checkmk::SectionWriter;
use crate::client::error_status;
use crate::config::ConfigError;
use crate::xiq::{
    BandCounts, Device, DeviceRadios, View, XiqClient, clean_text, clients_per_device,
    format_mac_upper, uptime_seconds,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Write;

const SEP: Option<char> = Some('|');

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAuth {
    Token(String),
    Login { username: String, password: String },
    /// Neither a token nor credentials are configured.
    Missing,
}

fn opt(value: &Option<String>) -> String {
    value.as_deref().map(clean_text).unwrap_or_default()
}

fn flag(b: bool) -> &'static str {
    if b { "1" } else { "0" }
}

pub fn inventory_row(device: &Device) -> Vec<String> {
    vec![
        device.id.clone(),
        device.display_name(),
        opt(&device.serial_number),
        device
            .mac_address
            .as_deref()
            .map(format_mac_upper)
            .unwrap_or_default(),
        opt(&device.ip_address),
        opt(&device.product_type),
        opt(&device.software_version),
        device.location_path(),
        opt(&device.device_function),
        opt(&device.managed_by),
        flag(device.is_connected()).to_string(),
    ]
}

pub fn neighbor_rows(device: &Device) -> Vec<Vec<String>> {
    device
        .lldp_cdp_infos
        .iter()
        .map(|n| {
            vec![
                device.id.clone(),
                device.display_name(),
                opt(&device.ip_address),
                opt(&n.interface_name),
                opt(&n.management_ip),
                opt(&n.port_id),
                opt(&n.port_description),
                n.mac_address
                    .as_deref()
                    .map(format_mac_upper)
                    .unwrap_or_default(),
                opt(&n.system_name),
            ]
        })
        .collect()
}

/// First LLDP/CDP neighbour as `system:port`.
fn lldp_short(device: &Device) -> String {
    let Some(first) = device.lldp_cdp_infos.first() else {
        return String::new();
    };
    match (opt(&first.system_name), opt(&first.port_id)) {
        (s, p) if s.is_empty() && p.is_empty() => String::new(),
        (s, p) if p.is_empty() => s,
        (s, p) => format!("{s}:{p}"),
    }
}

pub fn ap_status_row(device: &Device, now: DateTime<Utc>) -> Vec<String> {
    let connected = device.is_connected();
    vec![
        device.display_name(),
        opt(&device.serial_number),
        device
            .mac_address
            .as_deref()
            .map(format_mac_upper)
            .unwrap_or_default(),
        opt(&device.ip_address),
        opt(&device.product_type),
        flag(connected).to_string(),
        if connected { "CONNECTED" } else { "DISCONNECTED" }.to_string(),
        opt(&device.software_version),
        device
            .system_up_time
            .as_ref()
            .and_then(|raw| uptime_seconds(raw, now))
            .map(|s| s.to_string())
            .unwrap_or_default(),
        device.location_path(),
        lldp_short(device),
    ]
}

fn write_login_error<W: Write>(
    out: &mut SectionWriter<W>,
    err: &anyhow::Error,
    xiq: &XiqClient,
) -> Result<()> {
    let code = error_status(err).unwrap_or(0);
    out.section("extreme_cloud_iq_login", None)?;
    out.raw(&format!(
        "STATUS:ERROR CODE:{code} RESPONSE:{}",
        format!("{err:#}").replace('\n', " ")
    ))?;
    xiq.rate_limit().write_section(out)
}

/// Emits all sections. Login failures are reported in-band; a failed device
/// listing aborts after the account sections.
pub fn run<W: Write>(
    xiq: &mut XiqClient,
    auth: &AgentAuth,
    out: &mut SectionWriter<W>,
    now: DateTime<Utc>,
) -> Result<()> {
    let login = match auth {
        AgentAuth::Token(token) => {
            xiq.set_token(token);
            Ok("token supplied")
        }
        AgentAuth::Login { .. } => xiq.login().map(|_| "token acquired"),
        AgentAuth::Missing => Err(ConfigError::MissingXiqCredentials.into()),
    };
    let message = match login {
        Ok(message) => message,
        Err(err) => {
            warn!("login failed: {:#}", err);
            return write_login_error(out, &err, xiq);
        }
    };
    out.section("extreme_cloud_iq_login", None)?;
    out.raw(&format!("STATUS:OK CODE:200 RESPONSE:{message}"))?;
    xiq.rate_limit().write_section(out)?;

    let devices = xiq.devices(View::Full).context("listing XIQ devices")?;
    let aps: Vec<&Device> = devices.iter().filter(|d| d.is_ap()).collect();
    info!("{} devices, {} access points", devices.len(), aps.len());

    let clients = xiq.active_clients().unwrap_or_else(|err| {
        warn!("no client data: {:#}", err);
        Vec::new()
    });
    let counts = clients_per_device(&clients);

    let ap_ids: Vec<String> = aps.iter().map(|d| d.id.clone()).collect();
    let radios: BTreeMap<String, DeviceRadios> = xiq
        .radio_information(&ap_ids)?
        .into_iter()
        .map(|r| (r.device_id.clone(), r))
        .collect();

    let totals = counts.values().fold(BandCounts::default(), |acc, c| BandCounts {
        c24: acc.c24 + c.c24,
        c5: acc.c5 + c.c5,
        c6: acc.c6 + c.c6,
    });
    out.section("extreme_summary", None)?;
    out.raw(&format!("access_points {}", aps.len()))?;
    out.raw(&format!(
        "connected_aps {}",
        aps.iter().filter(|d| d.is_connected()).count()
    ))?;
    out.raw(&format!("total_clients {}", totals.total()))?;
    out.raw(&format!("clients_24 {}", totals.c24))?;
    out.raw(&format!("clients_5 {}", totals.c5))?;
    out.raw(&format!("clients_6 {}", totals.c6))?;

    out.section("extreme_device_inventory", SEP)?;
    for device in &devices {
        out.line(&inventory_row(device))?;
    }

    out.section("extreme_device_neighbors", SEP)?;
    for device in &devices {
        for row in neighbor_rows(device) {
            out.line(&row)?;
        }
    }

    for ap in aps {
        let band = counts.get(&ap.id).copied().unwrap_or_default();
        out.piggyback(&ap.display_name())?;
        out.section("extreme_ap_status", SEP)?;
        out.line(&ap_status_row(ap, now))?;
        out.section("extreme_ap_clients", SEP)?;
        out.line(&[band.c24.to_string(), band.c5.to_string(), band.c6.to_string()])?;
        out.section("extreme_ap_neighbors", SEP)?;
        for row in neighbor_rows(ap) {
            out.line(&row)?;
        }
        if let Some(radio) = radios.get(&ap.id) {
            out.section("xiq_radio_information", Some('\0'))?;
            out.json(&json!({
                "device_id": ap.id,
                "hostname": ap.display_name(),
                "radios": radio.radios,
            }))?;
        }
        out.end_piggyback()?;
    }
    Ok(())
}
