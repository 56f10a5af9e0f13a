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

//! vCenter special agent: certificate expiry, VM addresses, untagged VMs
//! and cluster DRS/HA state.

use crate::checkmk::SectionWriter;
use crate::client::{ApiClient, Auth, ClientOptions};
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use x509_parser::objects::{oid_registry, oid2abbrev};
use x509_parser::pem::Pem;

pub const AGENT_VERSION: &str = "v0.1";
pub const AGENT_BUILD: &str = "2023-02-21";
pub const SESSION_HEADER: &str = "vmware-api-session-id";

const TLS: &str = "api/vcenter/certificate-management/vcenter/tls";
const SIGNING: &str = "api/vcenter/certificate-management/vcenter/signing-certificate";
const TRUSTED_ROOTS: &str = "api/vcenter/certificate-management/vcenter/trusted-root-chains";
const TAG_ASSOCIATIONS: &str = "api/vcenter/tagging/associations";
const VMS: &str = "api/vcenter/vm";
const CLUSTERS: &str = "api/vcenter/cluster";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertLine {
    pub usage: String,
    pub common_name: String,
    pub expires: i64,
    pub subject: String,
}

impl CertLine {
    pub fn fields(&self) -> [String; 4] {
        [
            self.usage.clone(),
            self.common_name.clone(),
            self.expires.to_string(),
            self.subject.clone(),
        ]
    }
}

/// Every certificate in a PEM bundle.
pub fn parse_pem_chain(pem: &str, usage: &str) -> Result<Vec<CertLine>> {
    let mut lines = Vec::new();
    for block in Pem::iter_from_buffer(pem.as_bytes()) {
        let block = block.map_err(|e| anyhow!("invalid PEM block: {e}"))?;
        let cert = block
            .parse_x509()
            .map_err(|e| anyhow!("invalid certificate: {e}"))?;
        let name = cert.subject();
        let common_name = name
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let mut subject = String::new();
        for rdn in name.iter_rdn() {
            for attr in rdn.iter() {
                let key = oid2abbrev(attr.attr_type(), oid_registry())
                    .map(str::to_string)
                    .unwrap_or_else(|_| attr.attr_type().to_id_string());
                let value = attr.as_str().unwrap_or_default();
                subject.push_str(&format!("/{key}={value}"));
            }
        }
        lines.push(CertLine {
            usage: usage.to_string(),
            common_name,
            expires: cert.validity().not_after.timestamp(),
            subject,
        });
    }
    Ok(lines)
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: String,
}

#[derive(Debug)]
pub struct VmwareAgent {
    api: ApiClient,
}

pub fn read_password_file(path: &Path) -> Result<String> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading password file {:?}", path))?;
    let password = contents.lines().next().unwrap_or_default().trim().to_string();
    if password.is_empty() {
        bail!("password file {:?} is empty", path);
    }
    Ok(password)
}

pub fn base_url(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}:{port}")
    }
}

impl VmwareAgent {
    /// Opens an API session; later calls carry the session id header.
    pub fn connect(
        base_url: &str,
        username: &str,
        password: &str,
        options: &ClientOptions,
    ) -> Result<Self> {
        let auth = Auth::Basic {
            username: username.to_string(),
            password: password.to_string(),
        };
        let mut api = ApiClient::new(base_url, auth, options)?;
        let response = api
            .post_json("api/session", &[], Option::<&Value>::None)
            .context("Unable to retrieve a session ID")?;
        let Some(Value::String(session)) = response.json else {
            bail!("Unable to retrieve a session ID: unexpected response {}", response.body);
        };
        api.set_auth(Auth::None);
        info!("vCenter session opened");
        Ok(Self {
            api: api.with_header(SESSION_HEADER, &session)?,
        })
    }

    fn get(&self, path: &str) -> Result<Value> {
        self.api.get_json(path, &[])
    }

    /// Deduplicated certificate lines in first-seen order. Failing
    /// endpoints are skipped.
    pub fn certificates(&self) -> Vec<CertLine> {
        let mut found: Vec<CertLine> = Vec::new();
        let mut push = |lines: Vec<CertLine>| {
            for line in lines {
                if !found.contains(&line) {
                    found.push(line);
                }
            }
        };
        let chain = |usage: &str, pems: &Value| -> Vec<CertLine> {
            let Some(pems) = pems.as_array() else {
                return Vec::new();
            };
            pems.iter()
                .filter_map(Value::as_str)
                .filter_map(|pem| match parse_pem_chain(pem, usage) {
                    Ok(lines) => Some(lines),
                    Err(err) => {
                        warn!("{} certificate: {:#}", usage, err);
                        None
                    }
                })
                .flatten()
                .collect()
        };

        match self.get(TLS) {
            Ok(tls) => {
                if let Some(cert) = tls.get("cert") {
                    push(chain("UI", &Value::Array(vec![cert.clone()])));
                }
            }
            Err(err) => warn!("tls certificate: {:#}", err),
        }

        match self.get(SIGNING) {
            Ok(Value::Object(map)) => {
                for value in map.values() {
                    if let Some(certs) = value.get("cert_chain") {
                        push(chain("Signing", certs));
                    }
                }
            }
            Ok(_) => debug!("signing certificate response is not an object"),
            Err(err) => warn!("signing certificates: {:#}", err),
        }

        let roots = match self.get(TRUSTED_ROOTS) {
            Ok(Value::Array(roots)) => roots,
            Ok(_) => Vec::new(),
            Err(err) => {
                warn!("trusted root chains: {:#}", err);
                Vec::new()
            }
        };
        for root in roots {
            let Some(id) = root.get("chain").and_then(Value::as_str) else {
                continue;
            };
            match self.get(&format!("{TRUSTED_ROOTS}/{id}")) {
                Ok(Value::Object(map)) => {
                    for value in map.values() {
                        if let Some(certs) = value.get("cert_chain") {
                            push(chain("Trust chain", certs));
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => warn!("trusted root chain {}: {:#}", id, err),
            }
        }
        found
    }

    fn vms(&self) -> Result<Vec<VmSummary>> {
        self.api.get_json(VMS, &[]).context("listing VMs")
    }

    /// `(bios_uuid, name, ip)` for every VM.
    pub fn vm_ips(&self) -> Result<Vec<[String; 3]>> {
        let mut rows = Vec::new();
        for vm in self.vms()? {
            let detail = match self.get(&format!("{VMS}/{}", vm.vm)) {
                Ok(detail) => detail,
                Err(err) => {
                    warn!("skipping VM {}: {:#}", vm.name, err);
                    continue;
                }
            };
            let uuid = detail
                .pointer("/identity/bios_uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let ip = match self.get(&format!("{VMS}/{}/guest/identity", vm.vm)) {
                Ok(identity) => identity
                    .get("ip_address")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                Err(err) => {
                    debug!("no guest identity for {}: {:#}", vm.name, err);
                    String::new()
                }
            };
            rows.push([uuid, vm.name, ip]);
        }
        Ok(rows)
    }

    /// Names of VMs without any tag association, `vCLS` VMs excluded.
    pub fn untagged_vms(&self) -> Result<Vec<String>> {
        let associations = self.get(TAG_ASSOCIATIONS)?;
        let mut tagged = HashSet::new();
        let entries = associations
            .get("associations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in entries {
            let (Some(tag), Some(object)) = (
                entry.get("tag").and_then(Value::as_str),
                entry.pointer("/object/id").and_then(Value::as_str),
            ) else {
                continue;
            };
            if let Err(err) = self.get(&format!("api/cis/tagging/tag/{tag}")) {
                debug!("tag {}: {:#}", tag, err);
                continue;
            }
            match self.get(&format!("{VMS}/{object}")) {
                Ok(vm) => {
                    if let Some(name) = vm.pointer("/identity/name").and_then(Value::as_str) {
                        tagged.insert(name.to_string());
                    }
                }
                Err(err) => debug!("tagged object {} is not a VM: {:#}", object, err),
            }
        }
        Ok(self
            .vms()?
            .into_iter()
            .map(|vm| vm.name)
            .filter(|name| !tagged.contains(name) && !name.starts_with("vCLS"))
            .collect())
    }

    pub fn clusters(&self) -> Result<Value> {
        self.get(CLUSTERS)
    }

    pub fn run<W: Write>(&self, out: &mut SectionWriter<W>) -> Result<()> {
        out.section("vmware_api_certificates", Some('|'))?;
        for cert in self.certificates() {
            out.line(&cert.fields())?;
        }

        out.section("vmware_api_vm_ips", Some('|'))?;
        match self.vm_ips() {
            Ok(rows) => {
                for row in rows {
                    out.line(&row)?;
                }
            }
            Err(err) => warn!("VM addresses: {:#}", err),
        }

        out.section("vmware_api_tags", Some('|'))?;
        match self.untagged_vms() {
            Ok(names) => {
                for name in names {
                    out.line(&[name])?;
                }
            }
            Err(err) => warn!("tag associations: {:#}", err),
        }

        match self.clusters() {
            Ok(clusters @ Value::Array(_)) => {
                out.section("vmware_api_ha", Some('\0'))?;
                out.json(&clusters)?;
            }
            Ok(_) => warn!("cluster response is not a list"),
            Err(err) => warn!("clusters: {:#}", err),
        }

        out.agent_info(AGENT_VERSION, "Linux", AGENT_BUILD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    const VCENTER_PEM: &str = include_str!("../tests/fixtures/vcenter.pem");
    const ROOT_PEM: &str = include_str!("../tests/fixtures/root-ca.pem");

    fn session(server: &MockServer) {
        server.mock(|when, then| {
            when.method(POST)
                .path("/api/session")
                .header("Authorization", "Basic YWRtaW46c2VjcmV0");
            then.status(201).json_body(json!("sess-1"));
        });
    }

    fn agent(server: &MockServer) -> VmwareAgent {
        session(server);
        VmwareAgent::connect(&server.base_url(), "admin", "secret", &ClientOptions::default())
            .unwrap()
    }

    #[test]
    fn parses_every_certificate_of_a_bundle() {
        let bundle = format!("{VCENTER_PEM}{ROOT_PEM}");
        let lines = parse_pem_chain(&bundle, "Trust chain").unwrap();
        assert_eq!(
            lines,
            vec![
                CertLine {
                    usage: "Trust chain".into(),
                    common_name: "vcenter.example.test".into(),
                    expires: 2107550089,
                    subject: "/C=DE/O=Example Lab/CN=vcenter.example.test".into(),
                },
                CertLine {
                    usage: "Trust chain".into(),
                    common_name: "Example Root CA".into(),
                    expires: 2422910089,
                    subject: "/C=DE/CN=Example Root CA".into(),
                },
            ]
        );
    }

    #[test]
    fn session_failure_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/session");
            then.status(401);
        });
        let err = VmwareAgent::connect(&server.base_url(), "a", "b", &ClientOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("Unable to retrieve a session ID"));
    }

    #[test]
    fn collects_deduplicated_certificates() {
        let server = MockServer::start();
        let agent = agent(&server);
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/{TLS}"))
                .header(SESSION_HEADER, "sess-1");
            then.status(200).json_body(json!({"cert": VCENTER_PEM}));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{SIGNING}"));
            then.status(200).json_body(json!({
                "active_cert_chain": {"cert_chain": [VCENTER_PEM, ROOT_PEM]},
                "signing_cert_chains": [{"cert_chain": ["ignored"]}]
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{TRUSTED_ROOTS}"));
            then.status(200).json_body(json!([{"chain": "abc"}, {"chain": "gone"}]));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{TRUSTED_ROOTS}/abc"));
            then.status(200)
                .json_body(json!({"cert_chain": {"cert_chain": [ROOT_PEM, ROOT_PEM]}}));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{TRUSTED_ROOTS}/gone"));
            then.status(404);
        });

        let certs = agent.certificates();
        let summary: Vec<(String, String)> = certs
            .into_iter()
            .map(|c| (c.usage, c.common_name))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("UI".to_string(), "vcenter.example.test".to_string()),
                ("Signing".to_string(), "vcenter.example.test".to_string()),
                ("Signing".to_string(), "Example Root CA".to_string()),
                ("Trust chain".to_string(), "Example Root CA".to_string()),
            ]
        );
    }

    #[test]
    fn full_agent_output() {
        let server = MockServer::start();
        let agent = agent(&server);
        for path in [TLS, SIGNING, TRUSTED_ROOTS] {
            server.mock(|when, then| {
                when.method(GET).path(format!("/{path}"));
                then.status(500);
            });
        }
        server.mock(|when, then| {
            when.method(GET).path(format!("/{VMS}"));
            then.status(200).json_body(json!([
                {"vm": "vm-1", "name": "db01"},
                {"vm": "vm-2", "name": "vCLS-abc"},
                {"vm": "vm-3", "name": "web01"}
            ]));
        });
        for (id, name, uuid) in [("vm-1", "db01", "u1"), ("vm-2", "vCLS-abc", "u2"), ("vm-3", "web01", "u3")] {
            server.mock(|when, then| {
                when.method(GET).path(format!("/{VMS}/{id}"));
                then.status(200)
                    .json_body(json!({"identity": {"name": name, "bios_uuid": uuid}}));
            });
        }
        server.mock(|when, then| {
            when.method(GET).path(format!("/{VMS}/vm-1/guest/identity"));
            then.status(200).json_body(json!({"ip_address": "10.0.0.5"}));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{VMS}/vm-2/guest/identity"));
            then.status(503);
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{VMS}/vm-3/guest/identity"));
            then.status(200).json_body(json!({}));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{TAG_ASSOCIATIONS}"));
            then.status(200).json_body(json!({"associations": [
                {"tag": "t1", "object": {"id": "vm-1", "type": "VirtualMachine"}}
            ]}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/cis/tagging/tag/t1");
            then.status(200).json_body(json!({"name": "backup"}));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{CLUSTERS}"));
            then.status(200).json_body(json!([
                {"cluster": "c1", "name": "prod", "drs_enabled": true, "ha_enabled": false}
            ]));
        });

        let agent = VmwareAgent {
            api: agent.api.with_sleeper(|_| {}),
        };
        let mut out = SectionWriter::new(Vec::new());
        agent.run(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out.into_inner()).unwrap(),
            "<<<vmware_api_certificates:sep(124)>>>\n\
             <<<vmware_api_vm_ips:sep(124)>>>\n\
             u1|db01|10.0.0.5\n\
             u2|vCLS-abc|\n\
             u3|web01|\n\
             <<<vmware_api_tags:sep(124)>>>\n\
             web01\n\
             <<<vmware_api_ha:sep(0)>>>\n\
             [{\"cluster\":\"c1\",\"drs_enabled\":true,\"ha_enabled\":false,\"name\":\"prod\"}]\n\
             <<<check_mk>>>\nVersion: v0.1\nAgentOS: Linux\nBuildDate: 2023-02-21\n"
        );
    }

    #[test]
    fn failed_vm_lookups_do_not_stop_the_agent() {
        let server = MockServer::start();
        let agent = agent(&server);
        for path in [TLS, SIGNING, TRUSTED_ROOTS, TAG_ASSOCIATIONS] {
            server.mock(|when, then| {
                when.method(GET).path(format!("/{path}"));
                then.status(500);
            });
        }
        server.mock(|when, then| {
            when.method(GET).path(format!("/{VMS}"));
            then.status(200).json_body(json!([
                {"vm": "vm-1", "name": "db01"},
                {"vm": "vm-2", "name": "web01"}
            ]));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{VMS}/vm-1"));
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{VMS}/vm-2"));
            then.status(200).json_body(json!({"identity": {"name": "web01", "bios_uuid": "u2"}}));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{VMS}/vm-2/guest/identity"));
            then.status(200).json_body(json!({"ip_address": "10.0.0.9"}));
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/{CLUSTERS}"));
            then.status(200).json_body(json!([]));
        });

        let agent = VmwareAgent {
            api: agent.api.with_sleeper(|_| {}),
        };
        let mut out = SectionWriter::new(Vec::new());
        agent.run(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out.into_inner()).unwrap(),
            "<<<vmware_api_certificates:sep(124)>>>\n\
             <<<vmware_api_vm_ips:sep(124)>>>\n\
             u2|web01|10.0.0.9\n\
             <<<vmware_api_tags:sep(124)>>>\n\
             <<<vmware_api_ha:sep(0)>>>\n\
             []\n\
             <<<check_mk>>>\nVersion: v0.1\nAgentOS: Linux\nBuildDate: 2023-02-21\n"
        );
    }

    #[test]
    fn password_file_and_base_url() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pw");
        fs::write(&path, "s3cret\n").unwrap();
        assert_eq!(read_password_file(&path).unwrap(), "s3cret");
        fs::write(&path, "").unwrap();
        assert!(read_password_file(&path).is_err());

        assert_eq!(base_url("vc01", 443), "https://vc01:443");
        assert_eq!(base_url("http://127.0.0.1:8080", 443), "http://127.0.0.1:8080");
    }
}
