//! Two-phase garbage collection of expired VMs.
//!
//! Phase 1 gracefully shuts down VMs past their expiry and marks them
//! suspended; a VM that refuses the shutdown stays active and is retried on
//! the next run. Phase 2 tears down VMs whose grace period has also elapsed
//! and marks them destroyed. Dry-run by default.

use chrono::{Duration, Utc};
use clap::Parser;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ProvisionError;
use crate::gateway::{Action, ActionRunner};
use crate::store::{VmStatus, VmStore};

#[derive(Debug, Parser)]
pub struct GcOpts {
    /// Actually perform actions (dry-run without)
    #[clap(long)]
    pub execute: bool,

    /// Only run the suspend phase
    #[clap(long = "suspend-only", conflicts_with = "destroy_only")]
    pub suspend_only: bool,

    /// Only run the destroy phase
    #[clap(long = "destroy-only")]
    pub destroy_only: bool,

    /// Override the configured grace period in days
    #[clap(long = "grace-days")]
    pub grace_days: Option<i64>,
}

/// Counts reported after a run. In dry-run mode only the candidate counts
/// are populated.
#[derive(Debug, Default)]
pub struct GcReport {
    pub suspend_candidates: usize,
    pub suspended: usize,
    pub destroy_candidates: usize,
    pub destroyed: usize,
    pub executed: bool,
}

pub fn run(
    cfg: &Config,
    store: &mut dyn VmStore,
    gateway: &dyn ActionRunner,
    opts: &GcOpts,
) -> Result<GcReport, ProvisionError> {
    let now = Utc::now();
    let mut report = GcReport {
        executed: opts.execute,
        ..Default::default()
    };

    if !opts.destroy_only {
        let expired = store.list_active_expired(now)?;
        report.suspend_candidates = expired.len();
        for vm in expired {
            debug!("expired: '{}' (expiry {})", vm.name, vm.expiry);
            if !opts.execute {
                continue;
            }
            match gateway.execute(&Action::DomainShutdown {
                domain: vm.name.clone(),
            }) {
                Ok(_) => {
                    store.update_vm_status(&vm.name, VmStatus::Suspended, None)?;
                    info!("suspended '{}'", vm.name);
                    report.suspended += 1;
                }
                Err(e) => {
                    // Stays active; the next run retries. No forced destroy
                    // in this phase.
                    warn!("graceful shutdown of '{}' failed: {e}", vm.name);
                }
            }
        }
    }

    if !opts.suspend_only {
        let grace = Duration::days(opts.grace_days.unwrap_or(cfg.gc_grace_days));
        let doomed = store.list_suspended_past_grace(now, grace)?;
        report.destroy_candidates = doomed.len();
        for vm in doomed {
            debug!("past grace: '{}' (expiry {})", vm.name, vm.expiry);
            if !opts.execute {
                continue;
            }
            // The domain is normally already off; a failed force-stop is
            // expected then.
            if let Err(e) = gateway.execute(&Action::DomainDestroy {
                domain: vm.name.clone(),
            }) {
                debug!("destroy of '{}': {e}", vm.name);
            }
            match gateway.execute(&Action::DomainUndefine {
                domain: vm.name.clone(),
                remove_storage: true,
            }) {
                Ok(_) => {
                    remove_artifacts(cfg, &vm.name);
                    store.update_vm_status(&vm.name, VmStatus::Destroyed, None)?;
                    if let Err(e) = store.release_ip(vm.ip) {
                        warn!("could not release {} of '{}': {e}", vm.ip, vm.name);
                    }
                    if let Some(addr) = vm.ipv6 {
                        if let Err(e) = store.release_ipv6(addr) {
                            warn!("could not release {addr} of '{}': {e}", vm.name);
                        }
                    }
                    info!("destroyed '{}'", vm.name);
                    report.destroyed += 1;
                }
                Err(e) => {
                    // Leave it suspended; the next run retries the teardown.
                    warn!("undefine of '{}' failed: {e}", vm.name);
                }
            }
        }
    }

    Ok(report)
}

/// Best-effort removal of per-VM files that virsh does not own.
fn remove_artifacts(cfg: &Config, name: &str) {
    for path in [cfg.disk_path(name), cfg.domain_xml_path(name)] {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("could not remove {path}: {e}");
            }
        }
    }
    let seed_dir = cfg.cloud_init_dir().join(name);
    if seed_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&seed_dir) {
            warn!("could not remove {seed_dir}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::store::{VmRecord, YamlStore};
    use crate::testutil::FakeGateway;
    use camino::Utf8Path;
    use chrono::{DateTime, Utc};
    use std::net::Ipv4Addr;

    fn record(name: &str, status: VmStatus, expiry: DateTime<Utc>) -> VmRecord {
        VmRecord {
            name: name.to_string(),
            ip: Ipv4Addr::new(10, 0, 0, 5),
            ipv6: None,
            owner: "0xabc".to_string(),
            status,
            expiry,
            nft_token_id: Some(1),
        }
    }

    fn fixture() -> (tempfile::TempDir, crate::config::Config, YamlStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let cfg = test_config(&root);
        let store = YamlStore::in_memory(cfg.ip_pool.clone(), None);
        (dir, cfg, store)
    }

    fn gc_opts(execute: bool) -> GcOpts {
        GcOpts {
            execute,
            suspend_only: false,
            destroy_only: false,
            grace_days: None,
        }
    }

    #[test]
    fn dry_run_counts_without_gateway_calls() {
        let (_dir, cfg, mut store) = fixture();
        let past = Utc::now() - Duration::days(10);
        store
            .register_vm(record("expired", VmStatus::Active, past))
            .unwrap();
        store
            .register_vm(record("doomed", VmStatus::Suspended, past))
            .unwrap();

        let gw = FakeGateway::new();
        let report = run(&cfg, &mut store, &gw, &gc_opts(false)).unwrap();

        assert_eq!(report.suspend_candidates, 1);
        assert_eq!(report.destroy_candidates, 1);
        assert_eq!(report.suspended, 0);
        assert_eq!(report.destroyed, 0);
        assert!(gw.calls().is_empty());
        assert_eq!(
            store.get_vm("expired").unwrap().unwrap().status,
            VmStatus::Active
        );
    }

    #[test]
    fn expired_active_vm_is_suspended_on_execute() {
        let (_dir, cfg, mut store) = fixture();
        store
            .register_vm(record(
                "expired",
                VmStatus::Active,
                Utc::now() - Duration::days(1),
            ))
            .unwrap();

        let gw = FakeGateway::new();
        let report = run(&cfg, &mut store, &gw, &gc_opts(true)).unwrap();

        assert_eq!(report.suspended, 1);
        assert_eq!(gw.calls(), vec!["domain-shutdown"]);
        assert_eq!(
            store.get_vm("expired").unwrap().unwrap().status,
            VmStatus::Suspended
        );
    }

    #[test]
    fn failed_shutdown_leaves_vm_active() {
        let (_dir, cfg, mut store) = fixture();
        store
            .register_vm(record(
                "stubborn",
                VmStatus::Active,
                Utc::now() - Duration::days(1),
            ))
            .unwrap();

        let gw = FakeGateway::failing_on("domain-shutdown");
        let report = run(&cfg, &mut store, &gw, &gc_opts(true)).unwrap();

        assert_eq!(report.suspend_candidates, 1);
        assert_eq!(report.suspended, 0);
        assert_eq!(
            store.get_vm("stubborn").unwrap().unwrap().status,
            VmStatus::Active
        );
    }

    #[test]
    fn suspended_vm_past_grace_is_destroyed() {
        let (_dir, cfg, mut store) = fixture();
        store
            .register_vm(record(
                "doomed",
                VmStatus::Suspended,
                Utc::now() - Duration::days(10),
            ))
            .unwrap();

        let gw = FakeGateway::new();
        let report = run(&cfg, &mut store, &gw, &gc_opts(true)).unwrap();

        assert_eq!(report.destroyed, 1);
        assert_eq!(gw.calls(), vec!["domain-destroy", "domain-undefine"]);
        assert_eq!(
            store.get_vm("doomed").unwrap().unwrap().status,
            VmStatus::Destroyed
        );
        // Its address went back to the pool.
        assert_eq!(
            store.allocate_ip().unwrap(),
            Ipv4Addr::new(10, 0, 0, 5)
        );
    }

    #[test]
    fn suspended_vm_within_grace_is_left_alone() {
        let (_dir, cfg, mut store) = fixture();
        store
            .register_vm(record(
                "waiting",
                VmStatus::Suspended,
                Utc::now() - Duration::days(2),
            ))
            .unwrap();

        let gw = FakeGateway::new();
        let report = run(&cfg, &mut store, &gw, &gc_opts(true)).unwrap();
        assert_eq!(report.destroy_candidates, 0);
        assert!(gw.calls().is_empty());
    }

    #[test]
    fn grace_days_override_shrinks_the_window() {
        let (_dir, cfg, mut store) = fixture();
        store
            .register_vm(record(
                "waiting",
                VmStatus::Suspended,
                Utc::now() - Duration::days(2),
            ))
            .unwrap();

        let mut opts = gc_opts(false);
        opts.grace_days = Some(1);
        let report = run(&cfg, &mut store, &FakeGateway::new(), &opts).unwrap();
        assert_eq!(report.destroy_candidates, 1);
    }

    #[test]
    fn failed_undefine_leaves_vm_suspended_for_retry() {
        let (_dir, cfg, mut store) = fixture();
        store
            .register_vm(record(
                "stuck",
                VmStatus::Suspended,
                Utc::now() - Duration::days(10),
            ))
            .unwrap();

        let gw = FakeGateway::failing_on("domain-undefine");
        let report = run(&cfg, &mut store, &gw, &gc_opts(true)).unwrap();

        assert_eq!(report.destroyed, 0);
        assert_eq!(
            store.get_vm("stuck").unwrap().unwrap().status,
            VmStatus::Suspended
        );
    }

    #[test]
    fn phases_are_independently_selectable() {
        let (_dir, cfg, mut store) = fixture();
        let past = Utc::now() - Duration::days(10);
        store
            .register_vm(record("expired", VmStatus::Active, past))
            .unwrap();
        store
            .register_vm(record("doomed", VmStatus::Suspended, past))
            .unwrap();

        let gw = FakeGateway::new();
        let mut opts = gc_opts(true);
        opts.suspend_only = true;
        let report = run(&cfg, &mut store, &gw, &opts).unwrap();
        assert_eq!(report.suspended, 1);
        assert_eq!(report.destroy_candidates, 0);
        assert_eq!(gw.calls(), vec!["domain-shutdown"]);

        let gw = FakeGateway::new();
        let mut opts = gc_opts(true);
        opts.destroy_only = true;
        let report = run(&cfg, &mut store, &gw, &opts).unwrap();
        assert_eq!(report.suspend_candidates, 0);
        assert_eq!(report.destroyed, 1);
    }

    #[test]
    fn two_phase_never_jumps_active_to_destroyed() {
        let (_dir, cfg, mut store) = fixture();
        // Expired long ago but still active: phase 2 must not touch it even
        // though it is far past expiry + grace.
        store
            .register_vm(record(
                "expired",
                VmStatus::Active,
                Utc::now() - Duration::days(100),
            ))
            .unwrap();

        let gw = FakeGateway::failing_on("domain-shutdown");
        run(&cfg, &mut store, &gw, &gc_opts(true)).unwrap();
        let status = store.get_vm("expired").unwrap().unwrap().status;
        assert_eq!(status, VmStatus::Active);
        assert_eq!(gw.calls(), vec!["domain-shutdown"]);
    }
}
