//! cloud-init seed rendering and ISO authoring.
//!
//! Each VM gets its own directory under `<artifact_root>/cloud-init/<name>/`
//! holding the rendered `user-data`, `meta-data`, and the `seed.iso` built by
//! the external `cloud-localds` tool. user-data comes either pre-rendered
//! from the caller or from a template with `{variable}` substitution.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::process::Command;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Config;
use crate::error::ProvisionError;
use crate::exec::run_with_timeout;

const CLOUD_LOCALDS_TIMEOUT: Duration = Duration::from_secs(120);

/// Fallback user-data when the config names no template: one login user with
/// the credential-fetch hook pointed at the signing endpoint.
const DEFAULT_USER_DATA_TEMPLATE: &str = r#"#cloud-config
hostname: {vm_name}
users:
  - name: {username}
    groups: sudo
    shell: /bin/bash
    sudo: ALL=(ALL) NOPASSWD:ALL
write_files:
  - path: /etc/blockhost/credential.env
    permissions: "0600"
    content: |
      SIGNING_ENDPOINT={signing_endpoint}
      NFT_TOKEN_ID={nft_token_id}
      PUBLIC_SECRET={public_secret}
runcmd:
  - [sh, -c, "ip addr add {ip}/24 dev ens3 || true"]
"#;

/// Values substituted into the user-data template.
#[derive(Debug)]
pub struct CloudInitVars<'a> {
    pub vm_name: &'a str,
    pub ip: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    pub gateway: Ipv4Addr,
    pub username: &'a str,
    pub nft_token_id: Option<u64>,
    pub signing_endpoint: &'a str,
    pub public_secret: Option<&'a str>,
}

fn render(template: &str, vars: &CloudInitVars<'_>) -> String {
    let pairs = [
        ("{vm_name}", vars.vm_name.to_string()),
        ("{ip}", vars.ip.to_string()),
        (
            "{ipv6}",
            vars.ipv6.map(|a| a.to_string()).unwrap_or_default(),
        ),
        ("{gateway}", vars.gateway.to_string()),
        ("{username}", vars.username.to_string()),
        (
            "{nft_token_id}",
            vars.nft_token_id.map(|t| t.to_string()).unwrap_or_default(),
        ),
        ("{signing_endpoint}", vars.signing_endpoint.to_string()),
        (
            "{public_secret}",
            vars.public_secret.unwrap_or_default().to_string(),
        ),
    ];
    let mut out = template.to_string();
    for (key, value) in pairs {
        out = out.replace(key, &value);
    }
    out
}

/// Write the per-VM seed directory and build the boot ISO. Returns the ISO
/// path. The caller owns cleanup of the directory on saga failure.
pub fn build_seed(
    cfg: &Config,
    vars: &CloudInitVars<'_>,
    prerendered_user_data: Option<&Utf8Path>,
) -> Result<Utf8PathBuf, ProvisionError> {
    let dir = cfg.cloud_init_dir().join(vars.vm_name);
    std::fs::create_dir_all(&dir)
        .map_err(|e| ProvisionError::ExternalTool(format!("cannot create {dir}: {e}")))?;

    let user_data = match prerendered_user_data {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Configuration(format!("cannot read cloud-init content {path}: {e}"))
        })?,
        None => {
            let template = match &cfg.user_data_template {
                Some(path) => std::fs::read_to_string(path).map_err(|e| {
                    ProvisionError::Configuration(format!(
                        "cannot read user-data template {path}: {e}"
                    ))
                })?,
                None => DEFAULT_USER_DATA_TEMPLATE.to_string(),
            };
            render(&template, vars)
        }
    };

    let meta_data = format!(
        "instance-id: {name}\nlocal-hostname: {name}\n",
        name = vars.vm_name
    );

    let user_data_path = dir.join("user-data");
    let meta_data_path = dir.join("meta-data");
    std::fs::write(&user_data_path, user_data)
        .map_err(|e| ProvisionError::ExternalTool(format!("cannot write user-data: {e}")))?;
    std::fs::write(&meta_data_path, meta_data)
        .map_err(|e| ProvisionError::ExternalTool(format!("cannot write meta-data: {e}")))?;

    let iso_path = dir.join("seed.iso");
    let mut cmd = Command::new("cloud-localds");
    cmd.args([
        iso_path.as_str(),
        user_data_path.as_str(),
        meta_data_path.as_str(),
    ]);

    let outcome = run_with_timeout(&mut cmd, CLOUD_LOCALDS_TIMEOUT)
        .map_err(|e| ProvisionError::ExternalTool(format!("failed to spawn cloud-localds: {e}")))?;

    if outcome.timed_out() {
        return Err(ProvisionError::Timeout(format!(
            "cloud-localds for {iso_path}"
        )));
    }
    if !outcome.success() {
        return Err(ProvisionError::ExternalTool(format!(
            "cloud-localds failed (exit {:?}): {}",
            outcome.status, outcome.stderr_tail
        )));
    }
    tracing::debug!("built cloud-init seed {iso_path}");
    Ok(iso_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> CloudInitVars<'static> {
        CloudInitVars {
            vm_name: "web01",
            ip: Ipv4Addr::new(10, 0, 0, 5),
            ipv6: Some("2001:db8:100::2".parse().unwrap()),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            username: "blockhost",
            nft_token_id: Some(42),
            signing_endpoint: "https://sign.example/api",
            public_secret: None,
        }
    }

    #[test]
    fn renders_all_derived_variables() {
        let out = render(
            "{vm_name} {ip} {ipv6} {gateway} {username} {nft_token_id} {signing_endpoint}",
            &vars(),
        );
        assert_eq!(
            out,
            "web01 10.0.0.5 2001:db8:100::2 10.0.0.1 blockhost 42 https://sign.example/api"
        );
    }

    #[test]
    fn absent_optionals_render_empty() {
        let mut v = vars();
        v.ipv6 = None;
        v.nft_token_id = None;
        assert_eq!(render("[{ipv6}][{nft_token_id}][{public_secret}]", &v), "[][][]");
    }

    #[test]
    fn default_template_mentions_signing_endpoint() {
        let out = render(DEFAULT_USER_DATA_TEMPLATE, &vars());
        assert!(out.contains("SIGNING_ENDPOINT=https://sign.example/api"));
        assert!(out.contains("NFT_TOKEN_ID=42"));
        assert!(out.contains("hostname: web01"));
    }
}
