//! VM identity keys
//!
//! Work items, cache entries and log lines all refer to a VM by its
//! namespace-qualified name, rendered as `namespace/name`.

use std::fmt;

use kube::{Resource, ResourceExt};

/// Namespace-qualified identity of a VirtualMachine
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmKey {
    /// Namespace, empty for cluster-scoped keys
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl VmKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build the key of a Kubernetes object
    pub fn from_object<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for VmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{VirtualMachine, VirtualMachineSpec};

    #[test]
    fn display_includes_namespace() {
        assert_eq!(VmKey::new("ns", "vm-a").to_string(), "ns/vm-a");
        assert_eq!(VmKey::new("", "vm-a").to_string(), "vm-a");
    }

    #[test]
    fn key_from_object_uses_namespace_and_name() {
        let mut vm = VirtualMachine::new("vm-a", VirtualMachineSpec::default());
        vm.metadata.namespace = Some("ns".into());
        assert_eq!(VmKey::from_object(&vm), VmKey::new("ns", "vm-a"));
    }
}
