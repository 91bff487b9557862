//! Hardware inventory records
//!
//! A Hardware record is how a workflow target is resolved into worker
//! addresses: every interface MAC becomes a `device_N` entry that templates
//! reference as `{{.device_1}}`, `{{.device_2}}`, ...

use crate::{CrdError, ObjectMeta, Result, TypeMeta};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

/// Hardware resource representing a physical or virtual machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hardware {
    /// Type metadata (apiVersion, kind)
    #[serde(flatten)]
    pub type_meta: TypeMeta,

    /// Object metadata (name, uid, labels)
    pub metadata: ObjectMeta,

    /// Hardware specification
    pub spec: HardwareSpec,
}

impl Hardware {
    /// Create a new Hardware resource
    pub fn new(name: impl Into<String>, spec: HardwareSpec) -> Self {
        Self {
            type_meta: TypeMeta::hardware(),
            metadata: ObjectMeta::new(name),
            spec,
        }
    }

    /// Device map used to render templates against this machine
    ///
    /// Interfaces are numbered from 1 in declaration order; interfaces that
    /// disallow workflows are skipped but still consume their number.
    pub fn device_map(&self) -> HashMap<String, String> {
        self.spec
            .interfaces
            .iter()
            .enumerate()
            .filter(|(_, iface)| iface.allows_workflow())
            .filter_map(|(i, iface)| {
                iface
                    .dhcp
                    .as_ref()
                    .map(|dhcp| (format!("device_{}", i + 1), normalize_mac(&dhcp.mac)))
            })
            .collect()
    }

    /// Validate the hardware resource
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.is_empty() {
            return Err(CrdError::MissingField("metadata.name".to_string()));
        }

        if self.spec.interfaces.is_empty() {
            return Err(CrdError::MissingField("spec.interfaces".to_string()));
        }

        for (i, iface) in self.spec.interfaces.iter().enumerate() {
            if let Some(dhcp) = &iface.dhcp {
                dhcp.validate().map_err(|e| CrdError::InvalidFieldValue {
                    field: format!("spec.interfaces[{}].dhcp", i),
                    message: e.to_string(),
                })?;
            }
        }

        Ok(())
    }
}

/// Hardware specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HardwareSpec {
    /// Network interface specifications
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
}

impl HardwareSpec {
    /// Create a new hardware spec with a single interface
    pub fn new(mac: impl Into<String>) -> Self {
        Self {
            interfaces: vec![InterfaceSpec::new(mac)],
        }
    }

    /// Builder method to add an interface
    pub fn with_interface(mut self, iface: InterfaceSpec) -> Self {
        self.interfaces.push(iface);
        self
    }
}

/// Network interface specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InterfaceSpec {
    /// DHCP configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<DhcpSpec>,

    /// Netboot configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netboot: Option<NetbootSpec>,
}

impl InterfaceSpec {
    /// Create a new interface with just a MAC address
    pub fn new(mac: impl Into<String>) -> Self {
        Self {
            dhcp: Some(DhcpSpec::new(mac)),
            netboot: None,
        }
    }

    /// Disallow workflow execution on this interface
    pub fn without_workflow(mut self) -> Self {
        self.netboot = Some(NetbootSpec {
            allow_workflow: Some(false),
        });
        self
    }

    /// Workflows are allowed unless explicitly disabled
    pub fn allows_workflow(&self) -> bool {
        self.netboot
            .as_ref()
            .and_then(|n| n.allow_workflow)
            .unwrap_or(true)
    }
}

/// DHCP configuration for an interface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DhcpSpec {
    /// MAC address (required)
    pub mac: String,

    /// IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl DhcpSpec {
    /// Create a new DHCP spec with just a MAC address
    pub fn new(mac: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            ip: None,
        }
    }

    /// Builder method to set the IP address
    pub fn with_ip(mut self, address: impl Into<String>) -> Self {
        self.ip = Some(address.into());
        self
    }

    /// Validate the DHCP spec
    pub fn validate(&self) -> Result<()> {
        if self.mac.is_empty() {
            return Err(CrdError::InvalidMacAddress("MAC address is empty".to_string()));
        }

        // 6 bytes in hex, separated by colons or dashes
        let mac_clean = self.mac.replace([':', '-'], "");
        if mac_clean.len() != 12 || !mac_clean.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CrdError::InvalidMacAddress(self.mac.clone()));
        }

        if let Some(ip) = &self.ip {
            if IpAddr::from_str(ip).is_err() {
                return Err(CrdError::InvalidIpAddress(ip.clone()));
            }
        }

        Ok(())
    }
}

/// Netboot configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NetbootSpec {
    /// Allow workflow execution
    #[serde(rename = "allowWorkflow", skip_serializing_if = "Option::is_none")]
    pub allow_workflow: Option<bool>,
}

/// Normalize a MAC address to lowercase, colon separated form
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase().replace('-', ":")
}
