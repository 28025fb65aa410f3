use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of console a target exposes.
///
/// Guests (`Qemu`, `Lxc`) attach to the guest framebuffer or container tty;
/// `Node` attaches to a login shell on the hypervisor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Qemu,
    Lxc,
    Node,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Qemu => "qemu",
            TargetKind::Lxc => "lxc",
            TargetKind::Node => "node",
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, TargetKind::Qemu | TargetKind::Lxc)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One thing the operator can open a console to: a VM, a container, or a
/// node shell. `vmid` is 0 for node shells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleTarget {
    pub kind: TargetKind,
    pub node: String,
    pub vmid: u32,
    /// Display name shown in the UI (VM name, or the node name for shells).
    pub name: String,
}

impl ConsoleTarget {
    pub fn guest(kind: TargetKind, node: impl Into<String>, vmid: u32, name: impl Into<String>) -> Self {
        Self {
            kind,
            node: node.into(),
            vmid,
            name: name.into(),
        }
    }

    pub fn node_shell(node: impl Into<String>) -> Self {
        let node = node.into();
        Self {
            kind: TargetKind::Node,
            name: node.clone(),
            node,
            vmid: 0,
        }
    }

    /// Canonical key used to deduplicate sessions for the same target.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.kind, self.node, self.vmid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_key_is_canonical() {
        let vm = ConsoleTarget::guest(TargetKind::Qemu, "pve1", 100, "web1");
        assert_eq!(vm.key(), "qemu:pve1:100");

        let shell = ConsoleTarget::node_shell("pve1");
        assert_eq!(shell.key(), "node:pve1:0");
        assert_eq!(shell.name, "pve1");
        assert_eq!(shell.vmid, 0);
    }

    #[test]
    fn kind_display_matches_api_strings() {
        assert_eq!(TargetKind::Qemu.to_string(), "qemu");
        assert_eq!(TargetKind::Lxc.to_string(), "lxc");
        assert_eq!(TargetKind::Node.to_string(), "node");
        assert!(TargetKind::Lxc.is_guest());
        assert!(!TargetKind::Node.is_guest());
    }
}
