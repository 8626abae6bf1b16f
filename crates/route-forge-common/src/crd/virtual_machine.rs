//! VirtualMachine CRD (virtualization.deckhouse.io/v1alpha2)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// VirtualMachine as seen by the route engine.
///
/// Example:
/// ```yaml
/// apiVersion: virtualization.deckhouse.io/v1alpha2
/// kind: VirtualMachine
/// metadata:
///   name: vm-a
///   namespace: ns
/// status:
///   ipAddress: 10.66.10.7
///   node: node-1
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    namespaced,
    status = "VirtualMachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Name of the VirtualMachineIPAddress claimed by this VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_ip_address_name: Option<String>,

    /// Run policy (AlwaysOn, Manual, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_policy: Option<String>,
}

/// Observed placement of a VirtualMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Address assigned to the VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Node currently running the VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Lifecycle phase reported by the VM controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}
