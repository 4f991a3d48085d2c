//! End-to-end deployment scenarios against the simulated instrument network.

use std::sync::Arc;

use rust_tsp::transport::{SimulatedScript, SimulatedTransport};
use rust_tsp::{
    DeployError, DeploymentCoordinator, FirmwareScriptDescriptor, NodeIdentity, ScriptInstanceCollection,
    VersionStatus,
};

/// Global table a test script defines, distinct from the script name.
fn namespace(name: &str) -> String {
    name.replace('_', "")
}

fn descriptor(name: &str, mask: &str, released: &str) -> FirmwareScriptDescriptor {
    let table = namespace(name);
    let mut descriptor = FirmwareScriptDescriptor::new(name, mask).unwrap();
    descriptor.set_namespace_list(&table);
    descriptor.set_firmware_version_getter(&format!("{table}.version"));
    descriptor.set_released_version(released);
    descriptor
        .set_source(&format!(
            "{table} = {{}}\nfunction {table}.version() return '{released}' end\n"
        ))
        .unwrap();
    descriptor
}

/// Simulated behavior for a script at `version`.
fn behavior(name: &str, version: &str) -> SimulatedScript {
    let table = namespace(name);
    SimulatedScript::new(name)
        .with_namespace(&table)
        .with_version(&format!("{table}.version"), version)
}

fn coordinator(model: &str) -> DeploymentCoordinator {
    DeploymentCoordinator::new(NodeIdentity::controller(model, "4090123", 1))
}

#[tokio::test]
async fn test_fresh_controller_deploy() {
    let transport = SimulatedTransport::new(1);
    transport.define_script(1, behavior("isr_support", "2.1.0"));
    transport.define_script(1, behavior("isr_meter", "2.1.0"));

    let mut coordinator = coordinator("2602A");
    let mut support = descriptor("isr_support", "", "2.1.0");
    support.set_support_script(true);
    support.set_embed_to_non_volatile_memory(true);
    coordinator.add_script(support).unwrap();
    coordinator.add_script(descriptor("isr_meter", "260%*", "2.1.0")).unwrap();

    coordinator.read_states(&transport).await.unwrap();
    assert!(!coordinator.firmware_exists());

    let report = coordinator.deploy(&transport).await.unwrap();
    assert!(report.success, "{}", report.details);
    assert!(coordinator.firmware_exists());
    assert!(coordinator.support_scripts_exist());
    assert!(coordinator.all_versions_current());
    assert!(!coordinator.is_program_outdated());

    // only the script flagged for embedding reaches non-volatile memory
    assert!(transport.script(1, "isr_support").unwrap().embedded);
    assert!(!transport.script(1, "isr_meter").unwrap().embedded);
    assert!(transport.script(1, "isr_meter").unwrap().activated);
}

#[tokio::test]
async fn test_run_stops_at_first_failure() {
    let transport = SimulatedTransport::new(1);
    transport.define_script(1, behavior("isr_support", "1.0"));
    transport.define_script(1, behavior("isr_meter", "1.0").failing());
    transport.define_script(1, behavior("isr_trigger", "1.0"));

    let mut coordinator = coordinator("2602A");
    for name in ["isr_support", "isr_meter", "isr_trigger"] {
        coordinator.add_script(descriptor(name, "", "1.0")).unwrap();
    }
    coordinator.read_states(&transport).await.unwrap();
    coordinator.upload_scripts(&transport).await.unwrap();
    transport.clear_log();

    let report = coordinator.run_scripts(&transport, false).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.failed_script.as_deref(), Some("isr_meter"));
    assert!(report.details.contains("isr_meter.run()"));
    assert!(report.details.contains("raised an error"));
    assert_eq!(coordinator.identified_script(), Some((1, "isr_meter")));

    let log = transport.call_log();
    assert!(log.contains(&"write: isr_support.run()".to_string()));
    assert!(!log.contains(&"write: isr_trigger.run()".to_string()));
    assert!(!transport.script(1, "isr_trigger").unwrap().activated);
}

#[tokio::test]
async fn test_outdated_script_is_replaced() {
    let transport = SimulatedTransport::new(1);
    transport.define_script(
        1,
        behavior("isr_support", "1.0.0")
            .embedded()
            .activated()
            .upgrades_to("2.0.0"),
    );

    let mut coordinator = coordinator("2602A");
    let mut support = descriptor("isr_support", "", "2.0.0");
    support.set_embed_to_non_volatile_memory(true);
    coordinator.add_script(support).unwrap();

    coordinator.read_states(&transport).await.unwrap();
    let instance = coordinator.instance(1, "isr_support").unwrap();
    assert_eq!(instance.version_status(), VersionStatus::Older);
    assert!(instance.requires_deletion());
    assert!(!coordinator.all_versions_current());

    let report = coordinator.deploy(&transport).await.unwrap();
    assert!(report.success, "{}", report.details);
    assert!(coordinator.all_versions_current());
    assert!(transport
        .call_log()
        .contains(&"write: script.delete('isr_support')".to_string()));

    let script = transport.script(1, "isr_support").unwrap();
    assert!(script.embedded);
    assert_eq!(script.version.as_deref(), Some("2.0.0"));
}

#[tokio::test]
async fn test_newer_script_flags_outdated_program() {
    let transport = SimulatedTransport::new(1);
    transport.define_script(1, behavior("isr_support", "3.0").embedded().activated());

    let mut coordinator = coordinator("2602A");
    coordinator.add_script(descriptor("isr_support", "", "2.0")).unwrap();
    coordinator.read_states(&transport).await.unwrap();

    assert!(coordinator.is_program_outdated());
    assert_eq!(coordinator.identified_script(), Some((1, "isr_support")));
    let instance = coordinator.instance(1, "isr_support").unwrap();
    assert_eq!(instance.version_status(), VersionStatus::Newer);
    assert!(!instance.requires_deletion());
}

#[tokio::test]
async fn test_subordinate_node_receives_scripts() {
    let transport = SimulatedTransport::new(1);
    transport.add_node(2);
    transport.define_script(1, behavior("isr_support", "1.2"));
    transport.define_script(2, behavior("isr_support", "1.2"));

    let mut coordinator = coordinator("2602A");
    coordinator
        .register_node(NodeIdentity::subordinate("2612B", "4090124", 2))
        .unwrap();
    let mut support = descriptor("isr_support", "", "1.2");
    support.set_embed_to_non_volatile_memory(true);
    coordinator.add_script(support).unwrap();

    let report = coordinator.deploy(&transport).await.unwrap();
    assert!(report.success, "{}", report.details);
    assert!(coordinator.all_versions_current());

    let log = transport.call_log();
    assert!(log
        .iter()
        .any(|call| call.starts_with("write: node[2].script.new(") && call.ends_with(", 'isr_support')")));
    assert!(log.contains(&"write: node[2].isr_support.save()".to_string()));
    assert!(log.contains(&"write: node[2].isr_support.run()".to_string()));

    let remote = transport.script(2, "isr_support").unwrap();
    assert!(remote.loaded && remote.embedded && remote.activated);
    assert_eq!(coordinator.node_scripts(2).unwrap().len(), 1);
}

#[tokio::test]
async fn test_model_mask_limits_scripts_per_node() {
    let transport = SimulatedTransport::new(1);
    transport.add_node(2);
    transport.define_script(1, behavior("isr_meter", "1.0"));

    let mut coordinator = coordinator("2602A");
    coordinator
        .register_node(NodeIdentity::subordinate("2701", "4090125", 2))
        .unwrap();
    coordinator.add_script(descriptor("isr_meter", "260%*", "1.0")).unwrap();

    assert_eq!(coordinator.script_entities().len(), 1);
    assert!(coordinator.node_scripts(2).unwrap().is_empty());

    let report = coordinator.deploy(&transport).await.unwrap();
    assert!(report.success, "{}", report.details);
    assert!(transport.script(2, "isr_meter").is_none());
    assert!(transport.script(1, "isr_meter").unwrap().activated);
}

#[tokio::test]
async fn test_byte_code_conversion_before_embedding() {
    let transport = SimulatedTransport::new(1);
    transport.define_script(1, behavior("isr_support", "1.0"));

    let mut coordinator = coordinator("2602A");
    let mut support = descriptor("isr_support", "", "1.0");
    support.set_embed_to_non_volatile_memory(true);
    support.set_convert_to_byte_code(true);
    coordinator.add_script(support).unwrap();

    let report = coordinator.deploy(&transport).await.unwrap();
    assert!(report.success, "{}", report.details);

    let script = transport.script(1, "isr_support").unwrap();
    assert!(script.embedded && script.byte_code);
    let instance = coordinator.instance(1, "isr_support").unwrap();
    assert!(instance.is_saved());
    assert!(!instance.requires_deletion());

    let log = transport.call_log();
    let convert = log.iter().position(|c| c == "write: isr_support.source = nil").unwrap();
    let save = log.iter().position(|c| c == "write: isr_support.save()").unwrap();
    assert!(convert < save);
}

#[tokio::test]
async fn test_legacy_scripts_are_removed() {
    let transport = SimulatedTransport::new(1);
    transport.define_script(1, SimulatedScript::new("isr_legacy").embedded());
    transport.define_script(1, behavior("isr_support", "1.0"));

    let mut coordinator = coordinator("2602A");
    coordinator.add_script(descriptor("isr_support", "", "1.0")).unwrap();
    coordinator.add_legacy_script("isr_legacy", "").unwrap();

    coordinator.read_states(&transport).await.unwrap();
    assert!(coordinator.legacy_scripts_exist());

    let report = coordinator.deploy(&transport).await.unwrap();
    assert!(report.success, "{}", report.details);
    assert!(!coordinator.legacy_scripts_exist());
    assert!(!transport.script(1, "isr_legacy").unwrap().embedded);
}

#[tokio::test]
async fn test_delete_scripts_clears_the_network() {
    let transport = SimulatedTransport::new(1);
    transport.add_node(2);
    for node in [1, 2] {
        transport.define_script(node, behavior("isr_support", "1.0").embedded().activated());
    }

    let mut coordinator = coordinator("2602A");
    coordinator
        .register_node(NodeIdentity::subordinate("2602A", "4090126", 2))
        .unwrap();
    coordinator.add_script(descriptor("isr_support", "", "1.0")).unwrap();
    coordinator.read_states(&transport).await.unwrap();
    assert!(coordinator.firmware_exists());

    assert!(coordinator.delete_scripts(&transport, false).await.unwrap());
    coordinator.read_states(&transport).await.unwrap();
    assert!(!coordinator.node_scripts_mut(1).unwrap().any_exist());
    assert!(!coordinator.node_scripts_mut(2).unwrap().any_exist());
    assert!(!transport.script(2, "isr_support").unwrap().embedded);

    // subordinate nodes are cleared before the controller
    let log = transport.call_log();
    let remote = log
        .iter()
        .position(|c| c == "write: node[2].script.delete('isr_support')")
        .unwrap();
    let local = log
        .iter()
        .position(|c| c == "write: script.delete('isr_support')")
        .unwrap();
    assert!(remote < local);
}

#[tokio::test]
async fn test_delete_script_is_idempotent() {
    let transport = SimulatedTransport::new(1);
    transport.define_script(1, SimulatedScript::new("isr_support").embedded());
    let node = Arc::new(NodeIdentity::controller("2602A", "4090123", 1));
    let mut scripts = ScriptInstanceCollection::new(node, 1);

    assert!(scripts.delete_script(&transport, "isr_support").await.unwrap());
    transport.clear_log();
    assert!(scripts.delete_script(&transport, "isr_support").await.unwrap());
    // the second call only checks the name
    assert_eq!(transport.call_log(), vec!["is_nil: isr_support".to_string()]);
}

#[tokio::test]
async fn test_embed_not_required_when_already_embedded() {
    let transport = SimulatedTransport::new(1);
    transport.define_script(1, SimulatedScript::new("isr_support").embedded());
    let node = Arc::new(NodeIdentity::controller("2602A", "4090123", 1));
    let mut scripts = ScriptInstanceCollection::new(node, 1);

    let required = scripts
        .is_embed_required(&transport, "isr_support", true, false, false, true)
        .await
        .unwrap();
    assert!(!required);
    let required = scripts
        .is_embed_required(&transport, "isr_support", true, true, false, false)
        .await
        .unwrap();
    assert!(required, "plain-text copy must be replaced by byte code");
}

#[tokio::test]
async fn test_transport_failure_propagates() {
    let transport = SimulatedTransport::new(1);
    let mut coordinator = coordinator("2602A");
    coordinator.add_script(descriptor("isr_support", "", "1.0")).unwrap();

    transport.inject_next_failure();
    assert!(coordinator.read_states(&transport).await.is_err());
    coordinator.define_known_reset_state();
    coordinator.read_states(&transport).await.unwrap();
}

#[tokio::test]
async fn test_subordinate_failure_names_node_and_script() {
    let transport = SimulatedTransport::new(1);
    transport.add_node(2);
    transport.define_script(1, behavior("isr_support", "1.2"));
    transport.define_script(2, behavior("isr_support", "1.2"));
    transport.inject_failure_on("node[2].isr_support.run()");

    let mut coordinator = coordinator("2602A");
    coordinator
        .register_node(NodeIdentity::subordinate("2612B", "4090124", 2))
        .unwrap();
    coordinator.add_script(descriptor("isr_support", "", "1.2")).unwrap();

    match coordinator.deploy(&transport).await.unwrap_err() {
        DeployError::ScriptStepFailed { name, node, step, .. } => {
            assert_eq!((name.as_str(), node, step), ("isr_support", 2, "run"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(coordinator.identified_script(), Some((2, "isr_support")));
    assert!(transport.script(1, "isr_support").unwrap().activated);
}

#[tokio::test]
async fn test_stale_device_errors_do_not_fail_deploy() {
    let transport = SimulatedTransport::new(1);
    transport.define_script(1, behavior("isr_support", "1.2"));
    transport.push_error("-286, left over from an earlier session");
    transport.push_error("-285, TSP Syntax error");

    let mut coordinator = coordinator("2602A");
    coordinator.add_script(descriptor("isr_support", "", "1.2")).unwrap();

    let report = coordinator.deploy(&transport).await.unwrap();
    assert!(report.success, "{}", report.details);
    assert_eq!(transport.error_count(), 0);
}
