//! Install/update/destroy runs against the in-memory hypervisor.

use std::sync::Arc;

use clap::Parser;
use vmcreator_cli::{run, Args, Config, Provisioner, VmOutcome, EXIT_FATAL, EXIT_PARTIAL};
use vmcreator_hypervisor::{Hypervisor, MockBackend, MockRunner, NetworkReconciler};

const CONFIG: &str = r#"
libvirt:
  vm-pool: vms
  iso-pool: isos
networks:
  lan:
    ipCidr: 10.0.0.1/24
    mode: NAT
    dhcp:
      enabled: true
      start: 10.0.0.10
      end: 10.0.0.100
services:
  web01:
    cpu: 2
    ram:
      size: 2048
    image: debian.qcow2
    volumes:
      - type: root
        size: 10G
    networks:
      - name: lan
        ipAddr: 10.0.0.20
    users:
      - name: admin
        ssh_key:
          - ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 admin@workstation
"#;

struct Harness {
    vms: tempfile::TempDir,
    _isos: tempfile::TempDir,
    backend: Arc<MockBackend>,
    runner: Arc<MockRunner>,
    provisioner: Provisioner,
}

fn harness(yaml: &str) -> Harness {
    let vms = tempfile::tempdir().unwrap();
    let isos = tempfile::tempdir().unwrap();
    std::fs::write(isos.path().join("debian.qcow2"), b"").unwrap();

    let backend = Arc::new(MockBackend::new());
    backend.add_pool("vms", vms.path()).unwrap();
    backend.add_pool("isos", isos.path()).unwrap();

    let runner = Arc::new(MockRunner::new());
    let config = Config::from_yaml(yaml).unwrap();
    let provisioner = Provisioner::new(config, backend.clone(), runner.clone());

    Harness { vms, _isos: isos, backend, runner, provisioner }
}

fn args(action: &str, extra: &[&str]) -> Args {
    let mut argv = vec!["vmcreator", "--config", "vms.yaml", action];
    argv.extend_from_slice(extra);
    Args::parse_from(argv)
}

#[tokio::test]
async fn test_install_provisions_everything() {
    let h = harness(CONFIG);

    let (report, code) = run(&h.provisioner, &args("install", &[])).await;
    assert_eq!(code, 0);
    assert_eq!(report.vms.len(), 1);
    assert!(matches!(report.vms[0].outcome, VmOutcome::Created { .. }));

    assert!(h.vms.path().join("web01-root-vda.qcow2").exists());
    assert!(h.vms.path().join("web01.cloudinit.iso").exists());

    let qemu = h.runner.calls_to("qemu-img");
    assert_eq!(qemu.len(), 1);
    assert!(qemu[0].contains(&"-b".to_string()));
    assert_eq!(qemu[0].last().map(String::as_str), Some("10G"));
    assert_eq!(h.runner.calls_to("genisoimage").len(), 1);

    assert_eq!(h.backend.network_names(), vec!["lan".to_string()]);
    assert!(h.backend.network_is_active("lan"));

    let domain = h.backend.lookup_domain("web01").await.unwrap();
    assert!(h.backend.domain_is_active(&domain).await.unwrap());
    let xml = h.backend.domain_xml(&domain).await.unwrap();
    assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
    assert!(xml.contains("web01-root-vda.qcow2"));
    assert!(xml.contains("web01.cloudinit.iso"));
    assert!(xml.contains("<source network='lan'/>"));

    let networks = NetworkReconciler::new(h.backend.clone());
    let lan = h.backend.lookup_network("lan").await.unwrap();
    let leases = networks.leases(&lan).await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].hostname.as_deref(), Some("web01"));
    assert_eq!(leases[0].ip.as_deref(), Some("10.0.0.20"));
    assert!(xml.contains(&leases[0].mac.to_string()));
}

#[tokio::test]
async fn test_install_twice_changes_nothing() {
    let h = harness(CONFIG);

    run(&h.provisioner, &args("install", &[])).await;
    let (report, code) = run(&h.provisioner, &args("install", &[])).await;

    assert_eq!(code, 0);
    assert!(matches!(report.vms[0].outcome, VmOutcome::Unchanged { .. }));
    assert_eq!(h.runner.calls_to("qemu-img").len(), 1);
    assert_eq!(h.runner.calls_to("genisoimage").len(), 1);
    assert_eq!(h.backend.domain_names(), vec!["web01".to_string()]);

    let networks = NetworkReconciler::new(h.backend.clone());
    let lan = h.backend.lookup_network("lan").await.unwrap();
    assert_eq!(networks.leases(&lan).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_update_rebuilds_seed() {
    let h = harness(CONFIG);

    run(&h.provisioner, &args("install", &[])).await;
    let (report, code) = run(&h.provisioner, &args("update", &[])).await;

    assert_eq!(code, 0);
    assert!(matches!(report.vms[0].outcome, VmOutcome::Unchanged { .. }));
    assert_eq!(h.runner.calls_to("genisoimage").len(), 2);
    assert_eq!(h.runner.calls_to("qemu-img").len(), 1);
}

#[tokio::test]
async fn test_destroy_with_storage() {
    let h = harness(CONFIG);
    run(&h.provisioner, &args("install", &[])).await;

    let (report, code) = run(&h.provisioner, &args("destroy", &["--delete-storage"])).await;
    assert_eq!(code, 0);

    match &report.vms[0].outcome {
        VmOutcome::Removed { teardown } => {
            assert!(teardown.stopped);
            assert_eq!(teardown.volumes_deleted.len(), 2);
            assert_eq!(teardown.leases_released, vec!["lan".to_string()]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    assert!(h.backend.domain_names().is_empty());
    assert!(!h.vms.path().join("web01-root-vda.qcow2").exists());
    assert!(!h.vms.path().join("web01.cloudinit.iso").exists());

    let networks = NetworkReconciler::new(h.backend.clone());
    let lan = h.backend.lookup_network("lan").await.unwrap();
    assert!(networks.leases(&lan).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_destroy_keeps_storage_and_network() {
    let h = harness(CONFIG);
    run(&h.provisioner, &args("install", &[])).await;

    let (report, code) = run(&h.provisioner, &args("destroy", &["--delete-network"])).await;
    assert_eq!(code, 0);

    assert!(h.backend.domain_names().is_empty());
    assert!(h.vms.path().join("web01-root-vda.qcow2").exists());
    assert_eq!(h.backend.network_names(), vec!["lan".to_string()]);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("Not implemented"));
}

#[tokio::test]
async fn test_destroy_of_missing_vms_is_fatal() {
    let h = harness(CONFIG);

    let (report, code) = run(&h.provisioner, &args("destroy", &[])).await;
    assert_eq!(code, EXIT_FATAL);
    assert!(report.vms[0].outcome.is_failure());
}

#[tokio::test]
async fn test_failed_vm_does_not_stop_the_batch() {
    let yaml = CONFIG.replace("    image: debian.qcow2", "    image: missing.qcow2")
        + r#"  db01:
    volumes:
      - size: 5G
    networks:
      - name: lan
"#;
    let h = harness(&yaml);

    let (report, code) = run(&h.provisioner, &args("install", &[])).await;
    assert_eq!(code, EXIT_PARTIAL);
    assert!(report.vms[0].outcome.is_failure());
    assert!(matches!(report.vms[1].outcome, VmOutcome::Created { .. }));
    assert_eq!(h.backend.domain_names(), vec!["db01".to_string()]);

    // No ipAddr: the NIC is bound without a static lease.
    let networks = NetworkReconciler::new(h.backend.clone());
    let lan = h.backend.lookup_network("lan").await.unwrap();
    assert!(networks.leases(&lan).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_json_report_shape() {
    let h = harness(CONFIG);
    let (report, _) = run(&h.provisioner, &args("install", &["--json"])).await;

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["vms"][0]["name"], "web01");
    assert_eq!(json["vms"][0]["outcome"], "created");
    assert!(json["vms"][0]["uuid"].is_string());
}

#[tokio::test]
async fn test_two_nics_on_one_network_get_their_own_macs() {
    let yaml = CONFIG.replace(
        "      - name: lan\n        ipAddr: 10.0.0.20\n",
        "      - name: lan\n        ipAddr: 10.0.0.20\n      - name: lan\n        ipAddr: 10.0.0.21\n",
    );
    let h = harness(&yaml);

    let (_, code) = run(&h.provisioner, &args("install", &[])).await;
    assert_eq!(code, 0);

    let networks = NetworkReconciler::new(h.backend.clone());
    let lan = h.backend.lookup_network("lan").await.unwrap();
    let leases = networks.leases(&lan).await.unwrap();
    assert_eq!(leases.len(), 2);
    assert_ne!(leases[0].mac, leases[1].mac);

    let domain = h.backend.lookup_domain("web01").await.unwrap();
    let xml = h.backend.domain_xml(&domain).await.unwrap();
    for lease in &leases {
        assert!(xml.contains(&format!("<mac address='{}'/>", lease.mac)));
    }

    // A second install keeps both addresses on their MACs.
    run(&h.provisioner, &args("install", &[])).await;
    assert_eq!(networks.leases(&lan).await.unwrap(), leases);
}
