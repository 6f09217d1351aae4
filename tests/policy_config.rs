use pci_rm::fabric::{
    BusRange, DeviceSpec, DeviceTree, Interval, MemoryFabric, NodeId, PropertyStore, Region,
    ResourceType, ResourceTypes, Slot,
};
use pci_rm::{find_resources, FabricLocks, RebalanceConfig, RebalanceRequest};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const MEM: ResourceType = ResourceType::Mem;
const DISPLAY_VGA: u32 = 0x03_00_00;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A bridge whose 1 MiB window is half taken by a display adapter, and a new 1 MiB device.
fn display_and_newcomer() -> (MemoryFabric, NodeId, NodeId, NodeId) {
    let mut fabric = MemoryFabric::new();
    let root = fabric.add_root(BusRange::new(0, 0x1f));
    fabric.set_root_ranges(root, MEM, &[Interval::new(0x8000_0000, 0x100_0000)]);
    let bridge = fabric.add_bridge(root, DeviceSpec::new());
    fabric.assign_bus_range(bridge, BusRange::new(1, 1));
    fabric.open_window(bridge, MEM, Interval::new(0x8000_0000, 0x10_0000));

    let display = fabric.add_device(bridge, DeviceSpec::id(0x1234, 0x1111).class_code(DISPLAY_VGA));
    fabric.assign(display, Region::assigned(MEM, Slot::Bar(0x10), 0x8000_0000, 0x8_0000));
    let newcomer = fabric.add_device(bridge, DeviceSpec::new());
    fabric.declare(newcomer, Region::sized(MEM, Slot::Bar(0x10), 0x10_0000));
    (fabric, bridge, display, newcomer)
}

#[test]
fn display_keeps_its_address_by_default() -> anyhow::Result<()> {
    init_tracing();
    let (mut fabric, bridge, display, newcomer) = display_and_newcomer();
    let locks = FabricLocks::new();
    let config = RebalanceConfig::default();

    let handle = find_resources(
        &fabric,
        &locks,
        &config,
        &RebalanceRequest::new(bridge, ResourceTypes::MEM),
    )?;
    assert!(handle.map().entries_for(display).is_empty());
    handle.commit(&mut fabric);

    assert_eq!(
        fabric.assigned(display, MEM, Slot::Bar(0x10)),
        Some(Interval::new(0x8000_0000, 0x8_0000))
    );
    assert_eq!(
        fabric.assigned(newcomer, MEM, Slot::Bar(0x10)),
        Some(Interval::new(0x8010_0000, 0x10_0000))
    );
    assert_eq!(
        fabric.window(bridge, MEM),
        Some(Interval::new(0x8000_0000, 0x20_0000))
    );
    Ok(())
}

#[test]
fn display_moves_when_the_policy_allows_it() -> anyhow::Result<()> {
    init_tracing();
    let (mut fabric, bridge, display, newcomer) = display_and_newcomer();
    let root = fabric.fabric_root_of(bridge).expect("root");
    let locks = FabricLocks::new();
    let config: RebalanceConfig = serde_json::from_value(json!({
        "policy": { "pin_display": false }
    }))?;

    let handle = find_resources(
        &fabric,
        &locks,
        &config,
        &RebalanceRequest::new(bridge, ResourceTypes::MEM),
    )?;
    let moved = handle
        .map()
        .find(display, MEM, Slot::Bar(0x10))
        .copied()
        .expect("display entry");
    assert_eq!((moved.old_base, moved.new_base), (0x8000_0000, 0x8010_0000));
    handle.commit(&mut fabric);

    assert_eq!(
        fabric.assigned(newcomer, MEM, Slot::Bar(0x10)),
        Some(Interval::new(0x8000_0000, 0x10_0000))
    );
    assert_eq!(
        fabric.available(root, MEM),
        vec![Interval::new(0x8020_0000, 0xe0_0000)]
    );
    Ok(())
}

#[test]
fn unknown_config_keys_are_rejected() {
    let parsed: Result<RebalanceConfig, _> = serde_json::from_value(json!({
        "policy": { "pin_displays": false }
    }));
    assert!(parsed.is_err());
}
