use crate::policy::FixedDevicePolicy;
use serde::{Deserialize, Serialize};

/// Class code of an IOMMU; its remapping tables are built from the boot-time layout.
pub const CLASS_CODE_IOMMU: u32 = 0x08_06_00;

/// Tunables for a rebalance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RebalanceConfig {
    pub policy: FixedDevicePolicy,
    /// Highest bus number a fabric root may be extended to.
    pub max_bus_number: u8,
    pub allow_root_bus_extension: bool,
    /// All fabric roots number their buses from one space, so a root may not grow into the
    /// base bus of a root above it.
    pub shared_bus_space: bool,
    /// Clip root "available" entries that stick out of the root's decoded ranges instead of
    /// refusing to rebalance.
    pub trim_root_available: bool,
    /// Devices whose presence anywhere in the fabric disables rebalancing.
    pub blocking_class_codes: Vec<u32>,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            policy: FixedDevicePolicy::default(),
            max_bus_number: 0xff,
            allow_root_bus_extension: true,
            shared_bus_space: true,
            trim_root_available: true,
            blocking_class_codes: vec![CLASS_CODE_IOMMU],
        }
    }
}

impl RebalanceConfig {
    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pci_fabric::PciId;

    #[test]
    fn empty_json_yields_defaults() {
        assert_eq!(
            RebalanceConfig::from_json_str("{}").unwrap(),
            RebalanceConfig::default()
        );
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let cfg = RebalanceConfig::from_json_str(
            r#"{
                "max_bus_number": 63,
                "policy": {
                    "pinned_bridges": [{ "vendor_id": 4130, "device_id": 29784 }],
                    "pin_root_leaves": false
                }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.max_bus_number, 63);
        assert!(cfg.allow_root_bus_extension);
        assert_eq!(cfg.policy.pinned_bridges, vec![PciId::new(0x1022, 0x7458)]);
        assert!(!cfg.policy.pin_root_leaves);
        assert!(cfg.policy.pin_display);
        assert_eq!(cfg.blocking_class_codes, vec![CLASS_CODE_IOMMU]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(RebalanceConfig::from_json_str(r#"{ "max_bus": 3 }"#).is_err());
    }

    #[test]
    fn config_survives_json() {
        let mut cfg = RebalanceConfig::default();
        cfg.policy.pinned_children.push(PciId::new(0x1000, 0x0072));
        let raw = cfg.to_json_string().unwrap();
        assert_eq!(RebalanceConfig::from_json_str(&raw).unwrap(), cfg);
    }
}
