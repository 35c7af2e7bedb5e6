//! Domain descriptor builder.
//!
//! Pure mapping from a VM's sizing and artifact paths to libvirt domain XML.
//! No side effects; the saga serializes the result to a file and hands it to
//! the gateway's `domain-define` action.

use camino::Utf8PathBuf;

/// Everything that goes into one domain definition. Produced once per saga
/// run; never stored.
#[derive(Debug, Clone)]
pub struct DomainDescriptor {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u32,
    /// qcow2 overlay holding the VM's delta writes.
    pub disk_path: Utf8PathBuf,
    /// Immutable backing template the overlay references.
    pub template_path: Utf8PathBuf,
    /// cloud-init seed ISO, attached as removable media.
    pub seed_iso_path: Utf8PathBuf,
    /// Host bridge the single network interface attaches to.
    pub bridge: String,
}

impl DomainDescriptor {
    /// Render the libvirt domain XML.
    ///
    /// The boot disk is virtio with `cache='none' discard='unmap'` so guest
    /// discards reach the overlay file; the seed ISO rides a SATA cdrom so
    /// cloud-init's nocloud datasource finds it.
    pub fn build_xml(&self) -> String {
        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='none' discard='unmap'/>
      <source file='{disk}'/>
      <backingStore type='file'>
        <format type='qcow2'/>
        <source file='{template}'/>
      </backingStore>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{seed}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <interface type='bridge'>
      <source bridge='{bridge}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#,
            name = self.name,
            memory = self.memory_mb,
            vcpus = self.vcpus,
            disk = self.disk_path,
            template = self.template_path,
            seed = self.seed_iso_path,
            bridge = self.bridge,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> DomainDescriptor {
        DomainDescriptor {
            name: "web01".to_string(),
            vcpus: 2,
            memory_mb: 2048,
            disk_path: "/var/lib/blockhost/vms/web01.qcow2".into(),
            template_path: "/var/lib/blockhost/template.qcow2".into(),
            seed_iso_path: "/var/lib/blockhost/cloud-init/web01/seed.iso".into(),
            bridge: "br0".to_string(),
        }
    }

    #[test]
    fn xml_carries_sizing_and_name() {
        let xml = descriptor().build_xml();
        assert!(xml.contains("<name>web01</name>"));
        assert!(xml.contains("<memory unit='MiB'>2048</memory>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
    }

    #[test]
    fn xml_sets_disk_cache_and_discard() {
        let xml = descriptor().build_xml();
        assert!(xml.contains("type='qcow2' cache='none' discard='unmap'"));
        assert!(xml.contains("<source file='/var/lib/blockhost/vms/web01.qcow2'/>"));
        assert!(xml.contains("<source file='/var/lib/blockhost/template.qcow2'/>"));
    }

    #[test]
    fn xml_attaches_seed_iso_readonly() {
        let xml = descriptor().build_xml();
        assert!(xml.contains("device='cdrom'"));
        assert!(xml.contains("<source file='/var/lib/blockhost/cloud-init/web01/seed.iso'/>"));
        assert!(xml.contains("<readonly/>"));
    }

    #[test]
    fn xml_has_single_bridge_interface() {
        let xml = descriptor().build_xml();
        assert_eq!(xml.matches("<interface").count(), 1);
        assert!(xml.contains("<source bridge='br0'/>"));
    }
}
