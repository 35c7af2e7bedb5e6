//! qcow2 overlay creation via qemu-img.

use std::process::Command;
use std::time::Duration;

use camino::Utf8Path;

use crate::error::ProvisionError;
use crate::exec::run_with_timeout;

const QEMU_IMG_TIMEOUT: Duration = Duration::from_secs(60);

/// Create a copy-on-write overlay at `dest`, backed by `template`, sized to
/// `size_gb`. Creation is metadata-only; the overlay holds just the VM's
/// delta writes.
pub fn create_overlay(
    template: &Utf8Path,
    dest: &Utf8Path,
    size_gb: u32,
) -> Result<(), ProvisionError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ProvisionError::ExternalTool(format!("cannot create {parent}: {e}")))?;
    }

    let mut cmd = Command::new("qemu-img");
    cmd.args([
        "create",
        "-f",
        "qcow2",
        "-F",
        "qcow2",
        "-b",
        template.as_str(),
        dest.as_str(),
        &format!("{size_gb}G"),
    ]);

    let outcome = run_with_timeout(&mut cmd, QEMU_IMG_TIMEOUT)
        .map_err(|e| ProvisionError::ExternalTool(format!("failed to spawn qemu-img: {e}")))?;

    if outcome.timed_out() {
        return Err(ProvisionError::Timeout(format!(
            "qemu-img create for {dest}"
        )));
    }
    if !outcome.success() {
        return Err(ProvisionError::ExternalTool(format!(
            "qemu-img create failed (exit {:?}): {}",
            outcome.status, outcome.stderr_tail
        )));
    }
    tracing::debug!("created overlay {dest} backed by {template} ({size_gb}G)");
    Ok(())
}
