//! Resume a suspended VM.

use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::error::ProvisionError;
use crate::gateway::{Action, ActionRunner};
use crate::store::{VmStatus, VmStore};

#[derive(Debug, Parser)]
pub struct ResumeOpts {
    /// VM name
    pub name: String,

    /// Extend the subscription by N days on top of the current expiry
    #[clap(long = "extend-days")]
    pub extend_days: Option<i64>,

    /// Show what would happen without starting anything
    #[clap(long = "dry-run")]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct ResumeReport {
    pub status: &'static str,
    pub vm_name: String,
    pub expiry: DateTime<Utc>,
    pub dry_run: bool,
}

pub fn run(
    store: &mut dyn VmStore,
    gateway: &dyn ActionRunner,
    opts: &ResumeOpts,
) -> Result<ResumeReport, ProvisionError> {
    let record = store
        .get_vm(&opts.name)?
        .ok_or_else(|| ProvisionError::NotFound(format!("VM '{}'", opts.name)))?;

    // State check happens before any gateway action is issued.
    if record.status != VmStatus::Suspended {
        return Err(ProvisionError::StateConflict(format!(
            "VM '{}' is {}, not suspended",
            opts.name, record.status
        )));
    }

    let new_expiry = opts
        .extend_days
        .map(|days| record.expiry + Duration::days(days));
    let expiry = new_expiry.unwrap_or(record.expiry);

    if opts.dry_run {
        return Ok(ResumeReport {
            status: "ok",
            vm_name: opts.name.clone(),
            expiry,
            dry_run: true,
        });
    }

    let output = gateway.execute(&Action::DomainStart {
        domain: opts.name.clone(),
    })?;
    if !output.stdout.is_empty() {
        tracing::debug!("virsh start: {}", output.stdout.trim());
    }
    store.update_vm_status(&opts.name, VmStatus::Active, new_expiry)?;
    info!("resumed '{}' (expiry {expiry})", opts.name);

    Ok(ResumeReport {
        status: "ok",
        vm_name: opts.name.clone(),
        expiry,
        dry_run: false,
    })
}
