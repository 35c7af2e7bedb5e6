//! Privileged action gateway.
//!
//! The only component allowed to issue hypervisor- or network-mutating
//! commands. The set of actions is a closed enum, every parameter is
//! validated before any external process starts, and each action runs under
//! its own timeout. The gateway's one guarantee: the exact validated command
//! was issued once, and its exit/timeout outcome is reported. It performs no
//! retries and keeps no state.

use std::net::IpAddr;
use std::process::Command;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::exec::run_with_timeout;

/// Maximum length of a domain-identifying parameter.
const MAX_IDENT_LEN: usize = 64;

/// A validated request against the hypervisor or host network stack.
///
/// Variants are the complete allow-list; anything else arriving as a named
/// request fails [`Action::parse`] with [`GatewayError::InvalidAction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// `virsh start <domain>`
    DomainStart { domain: String },
    /// `virsh destroy <domain>` — force stop (confusing, blame libvirt)
    DomainDestroy { domain: String },
    /// `virsh shutdown <domain>` — graceful ACPI, long timeout
    DomainShutdown { domain: String },
    /// `virsh reboot <domain>`
    DomainReboot { domain: String },
    /// `virsh define <xml_path>`; the path must live under the artifact root
    DomainDefine { xml_path: Utf8PathBuf },
    /// `virsh undefine <domain> [--remove-all-storage]`
    DomainUndefine { domain: String, remove_storage: bool },
    /// `ip [-6] route add <address> dev <dev>`
    RouteAdd { address: String, dev: String },
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown action '{0}'")]
    InvalidAction(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("external command failed (exit {status:?}): {stderr}")]
    ExternalFailure { status: Option<i32>, stderr: String },

    #[error("action '{action}' timed out after {timeout:?}")]
    Timeout { action: String, timeout: Duration },
}

/// Restrictive identifier grammar for domain names and device names:
/// alphanumeric start, then alphanumerics plus `. _ -`, at most 64 chars.
/// Rejects anything that could smuggle shell or option syntax.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    s.len() <= MAX_IDENT_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

fn check_identifier(kind: &str, s: &str) -> Result<(), GatewayError> {
    if is_valid_identifier(s) {
        Ok(())
    } else {
        Err(GatewayError::InvalidParameter(format!(
            "invalid {kind} name: {s:?}"
        )))
    }
}

/// Validate a route target: a bare IPv4/IPv6 address with an optional
/// `/prefix` suffix. Parsed, not pattern-matched.
fn check_route_address(s: &str) -> Result<IpAddr, GatewayError> {
    let (addr_part, prefix) = match s.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (s, None),
    };
    let addr: IpAddr = addr_part
        .parse()
        .map_err(|_| GatewayError::InvalidParameter(format!("invalid route address: {s:?}")))?;
    if let Some(p) = prefix {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let n: u8 = p
            .parse()
            .map_err(|_| GatewayError::InvalidParameter(format!("invalid prefix length: {s:?}")))?;
        if n > max {
            return Err(GatewayError::InvalidParameter(format!(
                "prefix length out of range: {s:?}"
            )));
        }
    }
    Ok(addr)
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::DomainStart { .. } => "domain-start",
            Action::DomainDestroy { .. } => "domain-destroy",
            Action::DomainShutdown { .. } => "domain-shutdown",
            Action::DomainReboot { .. } => "domain-reboot",
            Action::DomainDefine { .. } => "domain-define",
            Action::DomainUndefine { .. } => "domain-undefine",
            Action::RouteAdd { .. } => "route-add",
        }
    }

    /// Map an untrusted `{action_name, parameters}` request onto the closed
    /// action set. Shape errors surface here; value validation (grammar,
    /// path confinement) happens again at execute time regardless of how the
    /// action was constructed.
    pub fn parse(name: &str, params: &serde_json::Map<String, Value>) -> Result<Self, GatewayError> {
        fn str_param(
            params: &serde_json::Map<String, Value>,
            key: &str,
        ) -> Result<String, GatewayError> {
            params
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| GatewayError::InvalidParameter(format!("'{key}' is required")))
        }

        match name {
            "domain-start" => Ok(Action::DomainStart {
                domain: str_param(params, "domain")?,
            }),
            "domain-destroy" => Ok(Action::DomainDestroy {
                domain: str_param(params, "domain")?,
            }),
            "domain-shutdown" => Ok(Action::DomainShutdown {
                domain: str_param(params, "domain")?,
            }),
            "domain-reboot" => Ok(Action::DomainReboot {
                domain: str_param(params, "domain")?,
            }),
            "domain-define" => Ok(Action::DomainDefine {
                xml_path: Utf8PathBuf::from(str_param(params, "xml_path")?),
            }),
            "domain-undefine" => Ok(Action::DomainUndefine {
                domain: str_param(params, "domain")?,
                remove_storage: params
                    .get("remove_storage")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            "route-add" => Ok(Action::RouteAdd {
                address: str_param(params, "address")?,
                dev: str_param(params, "dev")?,
            }),
            other => Err(GatewayError::InvalidAction(other.to_string())),
        }
    }

    /// Per-action bound on external execution. Graceful shutdown waits for
    /// the guest's ACPI handling, so it gets minutes; queries and route
    /// changes get seconds.
    fn timeout(&self) -> Duration {
        match self {
            Action::DomainDefine { .. } => Duration::from_secs(30),
            Action::DomainUndefine { .. } => Duration::from_secs(60),
            Action::DomainStart { .. }
            | Action::DomainDestroy { .. }
            | Action::DomainReboot { .. } => Duration::from_secs(120),
            Action::DomainShutdown { .. } => Duration::from_secs(300),
            Action::RouteAdd { .. } => Duration::from_secs(10),
        }
    }
}

/// Captured stdout of a successful action.
#[derive(Debug)]
pub struct ActionOutput {
    pub stdout: String,
}

/// Seam between the orchestration code and privileged execution. The saga
/// and lifecycle manager drive this trait; tests substitute a scripted fake.
pub trait ActionRunner {
    fn execute(&self, action: &Action) -> Result<ActionOutput, GatewayError>;
}

/// The real gateway: validates, then shells out.
pub struct Gateway {
    artifact_root: Utf8PathBuf,
}

impl Gateway {
    pub fn new(artifact_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            artifact_root: artifact_root.into(),
        }
    }

    fn validate(&self, action: &Action) -> Result<(), GatewayError> {
        match action {
            Action::DomainStart { domain }
            | Action::DomainDestroy { domain }
            | Action::DomainShutdown { domain }
            | Action::DomainReboot { domain }
            | Action::DomainUndefine { domain, .. } => check_identifier("domain", domain),
            Action::DomainDefine { xml_path } => self.check_artifact_path(xml_path),
            Action::RouteAdd { address, dev } => {
                check_route_address(address)?;
                check_identifier("device", dev)
            }
        }
    }

    /// A filesystem parameter must resolve under the approved artifact root
    /// and must already exist.
    fn check_artifact_path(&self, path: &Utf8Path) -> Result<(), GatewayError> {
        if !path.is_absolute() {
            return Err(GatewayError::InvalidParameter(format!(
                "path must be absolute: {path}"
            )));
        }
        let resolved = path
            .canonicalize_utf8()
            .map_err(|_| GatewayError::NotFound(format!("file not found: {path}")))?;
        // Compare against the canonical root so symlinked roots don't reject
        // their own contents.
        let root = self
            .artifact_root
            .canonicalize_utf8()
            .unwrap_or_else(|_| self.artifact_root.clone());
        if !resolved.starts_with(&root) {
            return Err(GatewayError::InvalidParameter(format!(
                "path outside artifact root {}: {path}",
                self.artifact_root
            )));
        }
        if !resolved.is_file() {
            return Err(GatewayError::NotFound(format!("not a file: {path}")));
        }
        Ok(())
    }

    fn command_for(&self, action: &Action) -> Command {
        match action {
            Action::DomainStart { domain } => virsh(&["start", domain]),
            Action::DomainDestroy { domain } => virsh(&["destroy", domain]),
            Action::DomainShutdown { domain } => virsh(&["shutdown", domain]),
            Action::DomainReboot { domain } => virsh(&["reboot", domain]),
            Action::DomainDefine { xml_path } => virsh(&["define", xml_path.as_str()]),
            Action::DomainUndefine {
                domain,
                remove_storage,
            } => {
                let mut cmd = virsh(&["undefine", domain]);
                if *remove_storage {
                    cmd.arg("--remove-all-storage");
                }
                cmd
            }
            Action::RouteAdd { address, dev } => {
                let mut cmd = Command::new("ip");
                if check_route_address(address).map(|a| a.is_ipv6()).unwrap_or(false) {
                    cmd.arg("-6");
                }
                cmd.args(["route", "add", address, "dev", dev]);
                cmd
            }
        }
    }
}

fn virsh(args: &[&str]) -> Command {
    let mut cmd = Command::new("virsh");
    cmd.args(args);
    cmd
}

impl ActionRunner for Gateway {
    fn execute(&self, action: &Action) -> Result<ActionOutput, GatewayError> {
        self.validate(action)?;
        let timeout = action.timeout();
        let mut cmd = self.command_for(action);
        tracing::debug!(action = action.name(), "dispatching gateway action");

        let outcome = run_with_timeout(&mut cmd, timeout).map_err(|e| {
            GatewayError::ExternalFailure {
                status: None,
                stderr: format!("failed to spawn: {e}"),
            }
        })?;

        if outcome.timed_out() {
            return Err(GatewayError::Timeout {
                action: action.name().to_string(),
                timeout,
            });
        }
        if !outcome.success() {
            return Err(GatewayError::ExternalFailure {
                status: outcome.status,
                stderr: if outcome.stderr_tail.is_empty() {
                    outcome.stdout
                } else {
                    outcome.stderr_tail
                },
            });
        }
        Ok(ActionOutput {
            stdout: outcome.stdout,
        })
    }
}
