//! Provisioning saga: create one VM as an atomic unit.
//!
//! The saga claims external resources in a fixed order (IPv4, IPv6, NFT
//! token, seed artifacts, disk overlay, domain definition) and records a
//! compensating action for each claim as it succeeds. Any hard failure walks
//! that ledger in reverse, best-effort per step, so the caller never gets a
//! silent "maybe created" state.

use std::net::{Ipv4Addr, Ipv6Addr};

use camino::Utf8PathBuf;
use chrono::{Duration, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cloudinit::{self, CloudInitVars};
use crate::config::Config;
use crate::domain_xml::DomainDescriptor;
use crate::error::ProvisionError;
use crate::gateway::{is_valid_identifier, Action, ActionRunner, GatewayError};
use crate::qemu_img;
use crate::store::{VmRecord, VmStatus, VmStore};

/// Options for creating a VM.
#[derive(Debug, Parser)]
pub struct CreateOpts {
    /// VM name; also the libvirt domain id
    pub name: String,

    /// Owner wallet address (0x...)
    #[clap(long = "owner-wallet")]
    pub owner_wallet: String,

    /// Number of vCPUs
    #[clap(long, default_value_t = 1)]
    pub cpu: u32,

    /// Memory in MB
    #[clap(long, default_value_t = 2048)]
    pub memory: u32,

    /// Disk size in GB
    #[clap(long, default_value_t = 20)]
    pub disk: u32,

    /// Actually create the VM (dry-run without)
    #[clap(long)]
    pub apply: bool,

    /// Path to pre-rendered cloud-init user-data
    #[clap(long = "cloud-init-content")]
    pub cloud_init_content: Option<Utf8PathBuf>,

    /// Skip embedding credential-signing material (minting handled elsewhere)
    #[clap(long = "skip-mint")]
    pub skip_mint: bool,

    /// User signature for encrypted credentials
    #[clap(long = "user-signature", requires = "public_secret")]
    pub user_signature: Option<String>,

    /// Public secret for signature verification
    #[clap(long = "public-secret")]
    pub public_secret: Option<String>,

    /// Override the configured subscription length
    #[clap(long = "expiry-days")]
    pub expiry_days: Option<i64>,
}

/// Success summary, printed as JSON.
#[derive(Debug, Serialize)]
pub struct CreateSummary {
    pub status: &'static str,
    pub vm_name: String,
    pub ip: Ipv4Addr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
    /// Domain id; for libvirt this is the VM name.
    pub vmid: String,
    pub nft_token_id: u64,
    pub username: String,
}

/// One undo step, pushed as the corresponding resource commits. Executed in
/// reverse order during rollback; every step is individually best-effort.
#[derive(Debug)]
enum Compensation {
    ReleaseIpv4(Ipv4Addr),
    ReleaseIpv6(Ipv6Addr),
    ReleaseToken(u64),
    RemoveDir(Utf8PathBuf),
    RemoveFile(Utf8PathBuf),
    /// Destroy (force stop) then undefine with storage removal.
    UndefineDomain(String),
}

/// Seam over the external artifact tools (cloud-localds, qemu-img) so the
/// saga is testable without them installed.
pub trait ArtifactBuilder {
    fn build_seed(
        &self,
        cfg: &Config,
        vars: &CloudInitVars<'_>,
        prerendered: Option<&camino::Utf8Path>,
    ) -> Result<Utf8PathBuf, ProvisionError>;

    fn create_overlay(
        &self,
        template: &camino::Utf8Path,
        dest: &camino::Utf8Path,
        size_gb: u32,
    ) -> Result<(), ProvisionError>;
}

/// The real tools.
pub struct ExternalTools;

impl ArtifactBuilder for ExternalTools {
    fn build_seed(
        &self,
        cfg: &Config,
        vars: &CloudInitVars<'_>,
        prerendered: Option<&camino::Utf8Path>,
    ) -> Result<Utf8PathBuf, ProvisionError> {
        cloudinit::build_seed(cfg, vars, prerendered)
    }

    fn create_overlay(
        &self,
        template: &camino::Utf8Path,
        dest: &camino::Utf8Path,
        size_gb: u32,
    ) -> Result<(), ProvisionError> {
        qemu_img::create_overlay(template, dest, size_gb)
    }
}

/// Run the provisioning saga. On failure every ledger entry is compensated
/// before the error is returned.
pub fn run(
    cfg: &Config,
    store: &mut dyn VmStore,
    gateway: &dyn ActionRunner,
    tools: &dyn ArtifactBuilder,
    opts: &CreateOpts,
) -> Result<CreateSummary, ProvisionError> {
    let mut ledger: Vec<Compensation> = Vec::new();
    match run_saga(cfg, store, gateway, tools, opts, &mut ledger) {
        Ok(summary) => Ok(summary),
        Err(err) => {
            warn!("provisioning '{}' failed: {err}; rolling back", opts.name);
            compensate(ledger, store, gateway);
            Err(err)
        }
    }
}

fn run_saga(
    cfg: &Config,
    store: &mut dyn VmStore,
    gateway: &dyn ActionRunner,
    tools: &dyn ArtifactBuilder,
    opts: &CreateOpts,
    ledger: &mut Vec<Compensation>,
) -> Result<CreateSummary, ProvisionError> {
    let name = opts.name.as_str();

    // Preconditions: nothing is allocated until these pass.
    if !is_valid_identifier(name) {
        return Err(GatewayError::InvalidParameter(format!("invalid VM name: {name:?}")).into());
    }
    if !cfg.template_image.is_file() {
        return Err(ProvisionError::Configuration(format!(
            "template image not found: {}",
            cfg.template_image
        )));
    }
    if let Some(existing) = store.get_vm(name)? {
        if existing.status != VmStatus::Destroyed {
            return Err(ProvisionError::Collision(format!(
                "VM '{name}' already exists (status {})",
                existing.status
            )));
        }
    }
    let disk_path = cfg.disk_path(name);
    if disk_path.exists() {
        return Err(ProvisionError::Collision(format!(
            "disk already exists: {disk_path}"
        )));
    }

    // Step 2: IPv4, fail closed on exhaustion.
    let ip = store.allocate_ip()?;
    ledger.push(Compensation::ReleaseIpv4(ip));
    debug!("allocated {ip} for '{name}'");

    // Step 3: IPv6 is the one allocation whose failure does not abort.
    let ipv6 = if cfg.ipv6.is_some() {
        match store.allocate_ipv6() {
            Ok(addr) => {
                ledger.push(Compensation::ReleaseIpv6(addr));
                Some(addr)
            }
            Err(e) => {
                warn!("IPv6 allocation for '{name}' failed, continuing IPv4-only: {e}");
                None
            }
        }
    } else {
        None
    };

    // Step 4: reserve the credential token id. Minting itself is the
    // engine's job; signature material only flows into cloud-init below.
    let token_id = store.reserve_nft_token_id(name)?;
    ledger.push(Compensation::ReleaseToken(token_id));
    if opts.user_signature.is_some() {
        debug!("user signature supplied for token {token_id}; mint happens out of band");
    }

    let summary = CreateSummary {
        status: "ok",
        vm_name: name.to_string(),
        ip,
        ipv6,
        vmid: name.to_string(),
        nft_token_id: token_id,
        username: cfg.guest_username.clone(),
    };

    // Step 5: dry-run stops before any filesystem or hypervisor mutation.
    // Pool allocations made above are intentionally held.
    if !opts.apply {
        info!(
            "dry-run for '{name}': holding ip={ip} ipv6={ipv6:?} nft_token_id={token_id}; \
             re-run with --apply to create"
        );
        return Ok(summary);
    }

    // Step 6: cloud-init seed. The undo is pushed before the build so a
    // half-written seed directory is cleaned up too.
    let seed_dir = cfg.cloud_init_dir().join(name);
    ledger.push(Compensation::RemoveDir(seed_dir));
    let vars = CloudInitVars {
        vm_name: name,
        ip,
        ipv6,
        gateway: cfg.ip_pool.gateway,
        username: &cfg.guest_username,
        nft_token_id: Some(token_id),
        signing_endpoint: &cfg.signing_endpoint,
        public_secret: if opts.skip_mint {
            None
        } else {
            opts.public_secret.as_deref()
        },
    };
    let seed_iso = tools.build_seed(cfg, &vars, opts.cloud_init_content.as_deref())?;

    // Step 7: copy-on-write overlay backed by the template.
    ledger.push(Compensation::RemoveFile(disk_path.clone()));
    tools.create_overlay(&cfg.template_image, &disk_path, opts.disk)?;

    // Step 8: serialize the domain descriptor.
    let descriptor = DomainDescriptor {
        name: name.to_string(),
        vcpus: opts.cpu,
        memory_mb: opts.memory,
        disk_path: disk_path.clone(),
        template_path: cfg.template_image.clone(),
        seed_iso_path: seed_iso,
        bridge: cfg.bridge_interface.clone(),
    };
    let xml_path = cfg.domain_xml_path(name);
    std::fs::create_dir_all(cfg.domain_xml_dir())
        .map_err(|e| ProvisionError::ExternalTool(format!("cannot create domain dir: {e}")))?;
    std::fs::write(&xml_path, descriptor.build_xml())
        .map_err(|e| ProvisionError::ExternalTool(format!("cannot write {xml_path}: {e}")))?;
    ledger.push(Compensation::RemoveFile(xml_path.clone()));

    // Step 9: define then start. Both are hard failure points.
    gateway.execute(&Action::DomainDefine { xml_path })?;
    ledger.push(Compensation::UndefineDomain(name.to_string()));
    gateway.execute(&Action::DomainStart {
        domain: name.to_string(),
    })?;

    // Step 10: best-effort IPv6 route; the VM is usable over IPv4 without it.
    if let (Some(addr), Some(v6cfg)) = (ipv6, cfg.ipv6.as_ref()) {
        let route = Action::RouteAdd {
            address: addr.to_string(),
            dev: v6cfg.route_dev.clone(),
        };
        if let Err(e) = gateway.execute(&route) {
            warn!("route attach for {addr} failed (VM continues over IPv4): {e}");
        }
    }

    // Step 11: registration commits the record as active.
    let expiry_days = opts.expiry_days.unwrap_or(cfg.expiry_days);
    store.register_vm(VmRecord {
        name: name.to_string(),
        ip,
        ipv6,
        owner: opts.owner_wallet.clone(),
        status: VmStatus::Active,
        expiry: Utc::now() + Duration::days(expiry_days),
        nft_token_id: Some(token_id),
    })?;

    info!("created VM '{name}' ({ip}, expires in {expiry_days}d)");
    Ok(summary)
}

/// Walk the ledger in reverse, executing every compensating action. A step
/// that fails is logged loudly and never stops the rest; an uncompensated
/// resource is the operator's to reclaim.
fn compensate(mut ledger: Vec<Compensation>, store: &mut dyn VmStore, gateway: &dyn ActionRunner) {
    while let Some(step) = ledger.pop() {
        debug!("compensating: {step:?}");
        match step {
            Compensation::UndefineDomain(domain) => {
                // The domain may never have started; destroy failure is
                // expected in that case.
                if let Err(e) = gateway.execute(&Action::DomainDestroy {
                    domain: domain.clone(),
                }) {
                    debug!("destroy during rollback of '{domain}': {e}");
                }
                if let Err(e) = gateway.execute(&Action::DomainUndefine {
                    domain: domain.clone(),
                    remove_storage: true,
                }) {
                    warn!("could not undefine '{domain}' during rollback: {e}");
                }
            }
            Compensation::RemoveFile(path) => {
                if path.exists() {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!("could not remove {path} during rollback: {e}");
                    }
                }
            }
            Compensation::RemoveDir(path) => {
                if path.exists() {
                    if let Err(e) = std::fs::remove_dir_all(&path) {
                        warn!("could not remove {path} during rollback: {e}");
                    }
                }
            }
            Compensation::ReleaseIpv6(addr) => {
                if let Err(e) = store.release_ipv6(addr) {
                    warn!("could not release {addr} during rollback: {e}");
                }
            }
            Compensation::ReleaseIpv4(ip) => {
                if let Err(e) = store.release_ip(ip) {
                    warn!("could not release {ip} during rollback: {e}");
                }
            }
            Compensation::ReleaseToken(id) => {
                if let Err(e) = store.mark_nft_failed(id) {
                    warn!("could not mark token {id} failed during rollback: {e}");
                }
            }
        }
    }
}
