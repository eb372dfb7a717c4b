use super::*;
use crate::{
    database::memory::MemoryStore,
    provision::NodeState,
    testing::{running, FakeProvisioner, FakeTransport},
    transport::Transport,
};
use std::thread;

const MOUNT: &str = "sudo mount -t efs fs-1234:/ /var/nfs_dir";
const BOOTSTRAP: &str = "sudo systemctl start munge";

fn settings() -> ReconcilerSettings {
    ReconcilerSettings {
        poll_interval: Duration::ZERO,
        settle_delay: Duration::ZERO,
        mount_attempts: 3,
        mount_retry_delay: Duration::ZERO,
        max_rounds: 3,
        timeout: None,
    }
}

fn reconciler(
    transport: &FakeTransport,
    provisioner: &FakeProvisioner,
    store: &MemoryStore,
    settings: ReconcilerSettings,
    token: CancellationToken,
) -> Reconciler {
    let transport: Arc<dyn Transport> = Arc::new(transport.clone());

    Reconciler::new(
        HealthProber::new(transport.clone(), Duration::from_secs(1)),
        RemoteExecutor::new(transport),
        Arc::new(provisioner.clone()),
        Arc::new(store.clone()),
        settings,
        token,
    )
}

fn cluster(addresses: &[&str], shared_storage: bool) -> Cluster {
    let addresses = addresses.iter().map(|a| a.to_string()).collect_vec();
    let mut cluster = Cluster::new("test-cluster", FakeTransport::USER, &addresses);
    cluster.bootstrap_commands = vec![BOOTSTRAP.to_owned()];
    if shared_storage {
        cluster.shared_storage = Some(SharedStorage {
            mount_commands: vec![MOUNT.to_owned()],
        });
    }

    cluster
}

#[test]
fn only_replaced_nodes_are_bootstrapped() {
    let transport = FakeTransport::new();
    transport.kill("B");
    let mut booting = running(&["A", "C"]);
    booting.insert(
        1,
        LiveNode {
            address: "D".to_owned(),
            state: NodeState::Pending,
        },
    );
    let provisioner = FakeProvisioner::new(vec![booting, running(&["A", "D", "C"])]);
    let store = MemoryStore::new();
    let cluster = cluster(&["A", "B", "C"], true);

    let report = reconciler(&transport, &provisioner, &store, settings(), CancellationToken::new())
        .reconcile(&cluster)
        .unwrap();

    assert_eq!(report.rounds, 1);
    assert_eq!(report.replaced, transport.nodes(&["D"]));
    assert_eq!(cluster.addresses(), vec!["A", "D", "C"]);
    assert_eq!(transport.calls_for(MOUNT), vec!["D"]);
    assert_eq!(transport.calls_for(BOOTSTRAP), vec!["D"]);
    assert_eq!(provisioner.converge_count(), 1);
    assert_eq!(provisioner.poll_count(), 2);

    let stored = store.find_cluster("test-cluster").unwrap().unwrap();
    assert_eq!(stored.nodes, transport.nodes(&["A", "D", "C"]));
}

#[test]
fn healthy_cluster_is_left_alone() {
    let transport = FakeTransport::new();
    let provisioner = FakeProvisioner::settled(&["A", "B"]);
    let store = MemoryStore::new();
    let cluster = cluster(&["A", "B"], true);

    let report = reconciler(&transport, &provisioner, &store, settings(), CancellationToken::new())
        .reconcile(&cluster)
        .unwrap();

    assert!(!report.repaired());
    assert!(report.replaced.is_empty());
    assert_eq!(provisioner.converge_count(), 0);
    assert_eq!(transport.probe_count(), 2);
    assert!(transport.calls().is_empty());
    assert!(store.find_cluster("test-cluster").unwrap().is_none());
}

#[test]
fn replaced_control_node_is_reported() {
    let transport = FakeTransport::new();
    transport.kill("A");
    let provisioner = FakeProvisioner::settled(&["E", "B"]);
    let store = MemoryStore::new();
    let cluster = cluster(&["A", "B"], false);

    let report = reconciler(&transport, &provisioner, &store, settings(), CancellationToken::new())
        .reconcile(&cluster)
        .unwrap();

    assert!(report.control_node_replaced(&cluster));
    assert_eq!(cluster.control_node().unwrap().address, "E");
    assert!(transport.calls_for(MOUNT).is_empty());
}

#[test]
fn bootstrap_failure_is_fatal() {
    let transport = FakeTransport::new();
    transport.kill("B");
    transport.fail_on("D", BOOTSTRAP, 5, "Failed to start munge.service: Unit not found.");
    let provisioner = FakeProvisioner::settled(&["A", "D"]);
    let store = MemoryStore::new();
    let cluster = cluster(&["A", "B"], false);

    let result = reconciler(&transport, &provisioner, &store, settings(), CancellationToken::new())
        .reconcile(&cluster);

    assert!(matches!(result, Err(ReconcileError::Bootstrap(_))));
    assert!(store.find_cluster("test-cluster").unwrap().is_none());
}

#[test]
fn mount_is_retried_until_it_succeeds() {
    let transport = FakeTransport::new();
    transport.kill("B");
    transport.script(MOUNT, vec![(32, "mount.nfs4: Failed to resolve server fs-1234")]);
    let provisioner = FakeProvisioner::settled(&["A", "D"]);
    let store = MemoryStore::new();
    let cluster = cluster(&["A", "B"], true);

    reconciler(&transport, &provisioner, &store, settings(), CancellationToken::new())
        .reconcile(&cluster)
        .unwrap();

    assert_eq!(transport.calls_for(MOUNT), vec!["D", "D"]);
    assert_eq!(transport.calls_for(BOOTSTRAP), vec!["D"]);
}

#[test]
fn mount_gives_up_after_configured_attempts() {
    let transport = FakeTransport::new();
    transport.kill("B");
    transport.fail_on("D", MOUNT, 32, "mount.nfs4: access denied by server");
    let provisioner = FakeProvisioner::settled(&["A", "D"]);
    let store = MemoryStore::new();
    let cluster = cluster(&["A", "B"], true);

    let result = reconciler(&transport, &provisioner, &store, settings(), CancellationToken::new())
        .reconcile(&cluster);

    match result {
        Err(ReconcileError::StorageAttach { nodes, attempts }) => {
            assert_eq!(nodes, vec!["D"]);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(transport.calls_for(MOUNT).len(), 3);
    assert!(transport.calls_for(BOOTSTRAP).is_empty());
}

#[test]
fn gives_up_after_max_rounds() {
    let transport = FakeTransport::new();
    transport.kill("B");
    // the infrastructure keeps reporting the dead node as running
    let provisioner = FakeProvisioner::settled(&["A", "B"]);
    let store = MemoryStore::new();
    let cluster = cluster(&["A", "B"], false);

    let result = reconciler(&transport, &provisioner, &store, settings(), CancellationToken::new())
        .reconcile(&cluster);

    match result {
        Err(ReconcileError::StillDegraded { rounds, unhealthy }) => {
            assert_eq!(rounds, 3);
            assert_eq!(unhealthy, vec!["B"]);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(provisioner.converge_count(), 3);
}

#[test]
fn converge_failure_is_reported() {
    let transport = FakeTransport::new();
    transport.kill("A");
    let provisioner = FakeProvisioner::failing();
    let store = MemoryStore::new();
    let cluster = cluster(&["A"], false);

    let result = reconciler(&transport, &provisioner, &store, settings(), CancellationToken::new())
        .reconcile(&cluster);

    assert!(matches!(result, Err(ReconcileError::Provisioning(_))));
    assert_eq!(provisioner.poll_count(), 0);
}

#[test]
fn cancellation_interrupts_the_stability_wait() {
    let transport = FakeTransport::new();
    transport.kill("B");
    // never reaches the desired count of two
    let provisioner = FakeProvisioner::settled(&["A"]);
    let store = MemoryStore::new();
    let cluster = cluster(&["A", "B"], false);
    let token = CancellationToken::new();
    let settings = ReconcilerSettings {
        poll_interval: Duration::from_millis(10),
        ..settings()
    };

    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        })
    };

    let result = reconciler(&transport, &provisioner, &store, settings, token).reconcile(&cluster);
    canceller.join().unwrap();

    assert!(matches!(result, Err(ReconcileError::Cancelled)));
    assert!(provisioner.poll_count() >= 1);
    assert_eq!(cluster.addresses(), vec!["A", "B"]);
}

#[test]
fn deadline_bounds_the_stability_wait() {
    let transport = FakeTransport::new();
    transport.kill("B");
    let provisioner = FakeProvisioner::settled(&["A"]);
    let store = MemoryStore::new();
    let cluster = cluster(&["A", "B"], false);
    let settings = ReconcilerSettings {
        poll_interval: Duration::from_millis(5),
        timeout: Some(Duration::from_millis(40)),
        ..settings()
    };

    let result = reconciler(&transport, &provisioner, &store, settings, CancellationToken::new())
        .reconcile(&cluster);

    assert!(matches!(result, Err(ReconcileError::Cancelled)));
}
