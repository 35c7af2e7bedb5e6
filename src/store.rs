//! VM records and the resource store.
//!
//! The platform's real database is an external collaborator; this module
//! defines the narrow interface the core consumes ([`VmStore`]) plus a
//! file-backed implementation that persists everything to one YAML document,
//! the same shape as the installer's `db.yaml`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use camino::Utf8PathBuf;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{IpPoolConfig, Ipv6Config};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} pool exhausted")]
    PoolExhausted(String),

    #[error("VM '{0}' already exists")]
    DuplicateName(String),

    #[error("no such VM '{0}'")]
    UnknownVm(String),

    #[error("invalid transition for '{name}': {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: VmStatus,
        to: VmStatus,
    },

    #[error("failed to persist store: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store file: {0}")]
    Corrupt(#[from] serde_yaml::Error),
}

/// Lifecycle state of a VM record.
///
/// Transitions are closed: `Active -> Suspended` (expiry), `Suspended ->
/// Destroyed` (grace elapsed), `Suspended -> Active` (resume). `Destroyed`
/// is terminal and `Active` never jumps straight to `Destroyed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Provisioning,
    Active,
    Suspended,
    Destroyed,
}

impl VmStatus {
    pub fn can_transition(self, to: VmStatus) -> bool {
        use VmStatus::*;
        matches!(
            (self, to),
            (Provisioning, Active)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Suspended, Destroyed)
        )
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::Provisioning => "provisioning",
            VmStatus::Active => "active",
            VmStatus::Suspended => "suspended",
            VmStatus::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// One hosted VM. `name` doubles as the libvirt domain id and must be unique
/// among non-destroyed records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub ip: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
    /// Owner wallet address.
    pub owner: String,
    pub status: VmStatus,
    pub expiry: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nft_token_id: Option<u64>,
}

/// The allocate/release/register/query contract the saga and lifecycle
/// manager consume. Pool primitives must be exclusive: an address or token
/// id is never handed out twice while still claimed.
pub trait VmStore {
    fn allocate_ip(&mut self) -> Result<Ipv4Addr, StoreError>;
    fn release_ip(&mut self, ip: Ipv4Addr) -> Result<(), StoreError>;

    fn allocate_ipv6(&mut self) -> Result<Ipv6Addr, StoreError>;
    fn release_ipv6(&mut self, addr: Ipv6Addr) -> Result<(), StoreError>;

    fn reserve_nft_token_id(&mut self, name: &str) -> Result<u64, StoreError>;
    fn mark_nft_failed(&mut self, id: u64) -> Result<(), StoreError>;

    fn get_vm(&self, name: &str) -> Result<Option<VmRecord>, StoreError>;
    fn register_vm(&mut self, record: VmRecord) -> Result<(), StoreError>;
    fn update_vm_status(
        &mut self,
        name: &str,
        status: VmStatus,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    fn list_active_expired(&self, now: DateTime<Utc>) -> Result<Vec<VmRecord>, StoreError>;
    fn list_suspended_past_grace(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<VmRecord>, StoreError>;
}

/// Serialized store state. BTree containers keep the YAML output stable.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    vms: BTreeMap<String, VmRecord>,
    #[serde(default)]
    allocated_ips: BTreeSet<Ipv4Addr>,
    #[serde(default)]
    allocated_ipv6: BTreeSet<Ipv6Addr>,
    /// Token ids are reserved monotonically and never reused.
    #[serde(default)]
    nft_token_counter: u64,
    #[serde(default)]
    nft_reservations: BTreeMap<u64, String>,
    #[serde(default)]
    failed_nft_tokens: BTreeSet<u64>,
}

/// YAML-file store. Loads on open, writes back after every mutation via an
/// atomic rename so a crash never leaves a torn file.
pub struct YamlStore {
    path: Option<Utf8PathBuf>,
    pool: IpPoolConfig,
    ipv6: Option<Ipv6Config>,
    state: StoreState,
}

impl YamlStore {
    pub fn open(
        path: Utf8PathBuf,
        pool: IpPoolConfig,
        ipv6: Option<Ipv6Config>,
    ) -> Result<Self, StoreError> {
        let state = if path.exists() {
            serde_yaml::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            StoreState::default()
        };
        Ok(Self {
            path: Some(path),
            pool,
            ipv6,
            state,
        })
    }

    /// Store with no backing file. Used by tests and dry-run plumbing.
    pub fn in_memory(pool: IpPoolConfig, ipv6: Option<Ipv6Config>) -> Self {
        Self {
            path: None,
            pool,
            ipv6,
            state: StoreState::default(),
        }
    }

    fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, serde_yaml::to_string(&self.state)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn record_mut(&mut self, name: &str) -> Result<&mut VmRecord, StoreError> {
        self.state
            .vms
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownVm(name.to_string()))
    }
}

impl VmStore for YamlStore {
    fn allocate_ip(&mut self) -> Result<Ipv4Addr, StoreError> {
        let start = u32::from(self.pool.start);
        let end = u32::from(self.pool.end);
        for raw in start..=end {
            let candidate = Ipv4Addr::from(raw);
            if !self.state.allocated_ips.contains(&candidate) {
                self.state.allocated_ips.insert(candidate);
                self.save()?;
                return Ok(candidate);
            }
        }
        Err(StoreError::PoolExhausted("IPv4".to_string()))
    }

    fn release_ip(&mut self, ip: Ipv4Addr) -> Result<(), StoreError> {
        self.state.allocated_ips.remove(&ip);
        self.save()
    }

    fn allocate_ipv6(&mut self) -> Result<Ipv6Addr, StoreError> {
        let cfg = self
            .ipv6
            .as_ref()
            .ok_or_else(|| StoreError::PoolExhausted("IPv6 (no broker configured)".to_string()))?;
        let base = u128::from(cfg.prefix);
        // Offsets start at 2; ::1 within the prefix is reserved for the host.
        for offset in 2u128..=u128::from(u16::MAX) {
            let candidate = Ipv6Addr::from(base + offset);
            if !self.state.allocated_ipv6.contains(&candidate) {
                self.state.allocated_ipv6.insert(candidate);
                self.save()?;
                return Ok(candidate);
            }
        }
        Err(StoreError::PoolExhausted("IPv6".to_string()))
    }

    fn release_ipv6(&mut self, addr: Ipv6Addr) -> Result<(), StoreError> {
        self.state.allocated_ipv6.remove(&addr);
        self.save()
    }

    fn reserve_nft_token_id(&mut self, name: &str) -> Result<u64, StoreError> {
        self.state.nft_token_counter += 1;
        let id = self.state.nft_token_counter;
        self.state.nft_reservations.insert(id, name.to_string());
        self.save()?;
        Ok(id)
    }

    fn mark_nft_failed(&mut self, id: u64) -> Result<(), StoreError> {
        self.state.nft_reservations.remove(&id);
        self.state.failed_nft_tokens.insert(id);
        self.save()
    }

    fn get_vm(&self, name: &str) -> Result<Option<VmRecord>, StoreError> {
        Ok(self.state.vms.get(name).cloned())
    }

    fn register_vm(&mut self, record: VmRecord) -> Result<(), StoreError> {
        if let Some(existing) = self.state.vms.get(&record.name) {
            if existing.status != VmStatus::Destroyed {
                return Err(StoreError::DuplicateName(record.name));
            }
        }
        self.state.vms.insert(record.name.clone(), record);
        self.save()
    }

    fn update_vm_status(
        &mut self,
        name: &str,
        status: VmStatus,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let record = self.record_mut(name)?;
        if !record.status.can_transition(status) {
            return Err(StoreError::InvalidTransition {
                name: name.to_string(),
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        if let Some(expiry) = expiry {
            record.expiry = expiry;
        }
        self.save()
    }

    fn list_active_expired(&self, now: DateTime<Utc>) -> Result<Vec<VmRecord>, StoreError> {
        Ok(self
            .state
            .vms
            .values()
            .filter(|r| r.status == VmStatus::Active && r.expiry < now)
            .cloned()
            .collect())
    }

    fn list_suspended_past_grace(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<VmRecord>, StoreError> {
        Ok(self
            .state
            .vms
            .values()
            .filter(|r| r.status == VmStatus::Suspended && r.expiry + grace < now)
            .cloned()
            .collect())
    }
}
