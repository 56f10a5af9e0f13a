//! CSV and JSON exports of cached access points, device lists and raw API
//! objects.

use crate::cache::ApRecord;
use crate::xiq::{Device, format_mac_lower, format_uptime_long, norm_connected};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const AP_FIELDS: [&str; 12] = [
    "id",
    "hostname",
    "ip_address",
    "serial_number",
    "bssid_mac",
    "site",
    "region",
    "country",
    "city",
    "location",
    "floor",
    "ssids",
];

pub const DEVICE_FIELDS: [&str; 18] = [
    "id",
    "hostname",
    "mac_address",
    "ip_address",
    "serial_number",
    "product_type",
    "software_version",
    "device_function",
    "managed_by",
    "connected",
    "uptime",
    "org",
    "city",
    "building",
    "floor",
    "lldp_port",
    "lldp_system_name",
    "lldp_management_ip",
];

fn level(names: &[String], idx: usize) -> String {
    names.get(idx).cloned().unwrap_or_default()
}

pub fn write_ap_csv<W: Write>(records: &[ApRecord], out: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(AP_FIELDS)?;
    for ap in records {
        let ssids: Vec<&str> = ap.ssids.iter().map(|s| s.ssid.as_str()).collect();
        let mut row = vec![
            ap.id.clone(),
            ap.hostname.clone(),
            ap.ip_address.clone(),
            ap.serial_number.clone(),
            ap.bssid_mac.clone(),
        ];
        row.extend((0..6).map(|i| level(&ap.locations, i)));
        row.push(ssids.join(";"));
        wtr.write_record(&row)?;
    }
    wtr.flush().context("flushing CSV output")?;
    Ok(())
}

pub fn write_device_csv<W: Write>(devices: &[Device], out: W, now: DateTime<Utc>) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(DEVICE_FIELDS)?;
    for device in devices {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        let names = device.location_names();
        let lldp = device.lldp_cdp_infos.first();
        let uptime = match &device.system_up_time {
            Some(Value::Number(n)) => n
                .as_i64()
                .map(|ms| format_uptime_long(ms, now))
                .unwrap_or_default(),
            _ => String::new(),
        };
        let mut row = vec![
            device.id.clone(),
            text(&device.hostname),
            device
                .mac_address
                .as_deref()
                .map(format_mac_lower)
                .unwrap_or_default(),
            text(&device.ip_address),
            text(&device.serial_number),
            text(&device.product_type),
            text(&device.software_version),
            text(&device.device_function),
            text(&device.managed_by),
            norm_connected(&device.connected).to_string(),
            uptime,
        ];
        row.extend((0..4).map(|i| level(&names, i)));
        row.push(lldp.and_then(|l| l.port_id.clone()).unwrap_or_default());
        row.push(lldp.and_then(|l| l.system_name.clone()).unwrap_or_default());
        row.push(lldp.and_then(|l| l.management_ip.clone()).unwrap_or_default());
        wtr.write_record(&row)?;
    }
    wtr.flush().context("flushing CSV output")?;
    Ok(())
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// CSV of arbitrary objects; the header is the key set of the first object.
pub fn write_objects_csv<W: Write>(items: &[Value], out: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    let Some(Value::Object(first)) = items.first() else {
        wtr.flush()?;
        return Ok(());
    };
    let header: Vec<String> = first.keys().cloned().collect();
    wtr.write_record(&header)?;
    for item in items {
        let row: Vec<String> = header.iter().map(|k| cell(item.get(k))).collect();
        wtr.write_record(&row)?;
    }
    wtr.flush().context("flushing CSV output")?;
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized, W: Write>(value: &T, mut out: W) -> Result<()> {
    serde_json::to_writer_pretty(&mut out, value).context("encoding JSON")?;
    writeln!(out)?;
    Ok(())
}

/// Opens `path` for writing and hands a buffered writer to `f`.
pub fn to_file<F>(path: &Path, f: F) -> Result<()>
where
    F: FnOnce(BufWriter<File>) -> Result<()>,
{
    let file = File::create(path).with_context(|| format!("creating {:?}", path))?;
    f(BufWriter::new(file)).with_context(|| format!("writing {:?}", path))
}
