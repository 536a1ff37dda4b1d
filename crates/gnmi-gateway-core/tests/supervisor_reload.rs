//! Configuration reloads through the supervisor, using files on disk for
//! both the target configuration and the fleet locks.

use std::sync::Arc;
use std::time::Duration;

use gnmi_gateway_core::cache::Cache;
use gnmi_gateway_core::config::GatewayConfig;
use gnmi_gateway_core::lock::FileLockProvider;
use gnmi_gateway_core::proto::SubscribeResponse;
use gnmi_gateway_core::state::ConnectionPhase;
use gnmi_gateway_core::supervisor::TargetConnectionSupervisor;
use gnmi_gateway_core::target::TargetConfiguration;
use gnmi_gateway_core::transport::LoopbackTransport;
use pretty_assertions::assert_eq;

const TARGETS_V1: &str = r#"
[targets.edge1]
addresses = ["10.0.0.1:9339"]
request = "interfaces"

[targets.edge2]
addresses = ["10.0.0.2:9339"]
request = "interfaces"

[targets.edge2.credentials]
username = "admin"
password = "secret"

[requests.interfaces.subscribe]
mode = "stream"

[[requests.interfaces.subscribe.subscription]]
mode = "sample"
sample_interval = 10000000000

[[requests.interfaces.subscribe.subscription.path.elem]]
name = "interfaces"
"#;

#[tokio::test]
async fn reload_from_disk_with_file_locks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_dir = dir.path().join("locks");
    let gateway = GatewayConfig::from_toml_str(&format!(
        "lock_retry_interval_ms = 5\n\n[lock]\nbackend = \"file\"\ndir = {:?}\n",
        lock_dir.display().to_string()
    ))
    .expect("gateway config");

    let targets_path = dir.path().join("targets.toml");
    std::fs::write(&targets_path, TARGETS_V1).expect("write targets");

    let (transport, mut acceptor) = LoopbackTransport::channel();
    let cache = Arc::new(Cache::new());
    let mut supervisor =
        TargetConnectionSupervisor::from_config(&gateway, Arc::clone(&cache), Arc::new(transport))
            .expect("supervisor");

    let v1 = TargetConfiguration::load(&targets_path).expect("load v1");
    let summary = supervisor.apply(&v1).await.expect("apply v1");
    assert_eq!(summary.added, vec!["edge1".to_string(), "edge2".to_string()]);

    let mut sessions = vec![
        acceptor.accept().await.expect("dial"),
        acceptor.accept().await.expect("dial"),
    ];
    sessions.sort_by(|a, b| a.query.target.cmp(&b.query.target));
    assert!(sessions[1].query.credentials.is_some());
    for session in &sessions {
        assert!(session.send(SubscribeResponse::sync()).await);
    }

    // Lock files are held while streaming.
    let locks = FileLockProvider::new(&lock_dir).expect("lock dir");
    let holder = locks.holder("edge1").expect("edge1 lock held");
    assert_eq!(holder.pid, std::process::id());

    // edge2 is dropped from the configuration.
    let v2 = TARGETS_V1
        .split("[targets.edge2]")
        .next()
        .expect("v1 head")
        .to_string()
        + TARGETS_V1
            .split("[requests.interfaces.subscribe]")
            .nth(1)
            .map(|tail| format!("[requests.interfaces.subscribe]{tail}"))
            .expect("v1 tail")
            .as_str();
    std::fs::write(&targets_path, v2).expect("write targets");
    let v2 = TargetConfiguration::load(&targets_path).expect("load v2");

    let summary = supervisor.apply(&v2).await.expect("apply v2");
    assert_eq!(summary.removed, vec!["edge2".to_string()]);
    assert_eq!(summary.kept, vec!["edge1".to_string()]);
    assert!(sessions[1].is_closed());
    assert!(cache.get("edge2").is_none());
    assert!(locks.holder("edge2").is_none());

    let conn = supervisor.connection("edge1").expect("edge1");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !conn.is_synced() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("edge1 synced");

    supervisor.shutdown().await;
    assert_eq!(conn.phase(), ConnectionPhase::Stopped);
    assert!(locks.holder("edge1").is_none());
    assert_eq!(supervisor.slot_stats().in_use, 0);
}
