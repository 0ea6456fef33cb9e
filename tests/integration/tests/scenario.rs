//! End-to-end scenario tests.

use ds_core::{ConnectionStatus, SaslMechanism, SecurityLevel};
use ds_session::testing::EndpointBehavior;

use crate::common::TestEnv;

/// A reachable replica on a local interface is used without racing.
#[tokio::test(start_paused = true)]
async fn test_local_replica_preferred() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.resolver.add_host("local.example.com", &["192.168.1.10"]);
    env.resolver.add_host("remote.example.com", &["10.0.0.2"]);
    env.resolver.add_local("192.168.1.10");
    env.transport.add("192.168.1.10:389", EndpointBehavior::new());
    env.transport.add(
        "10.0.0.2:389",
        EndpointBehavior::new().mechanisms(&[SaslMechanism::Gssapi]),
    );
    env.node("node1", &["local.example.com", "remote.example.com"]);

    let conn = env.manager.get_connection("node1").await?;
    let guard = conn.lock().await?;

    assert_eq!(
        guard.replica().and_then(|r| r.endpoint().socket_addr()),
        Some("192.168.1.10:389".parse()?)
    );
    assert_eq!(guard.security_level(), SecurityLevel::NONE);
    assert_eq!(guard.security_level().bits(), 0);
    conn.unlock(guard, false).await;

    assert_eq!(conn.status(), ConnectionStatus::Safe);
    assert_eq!(env.transport.connects("10.0.0.2:389"), 0, "remote never raced");
    assert_eq!(env.transport.connects("192.168.1.10:389"), 1);
    Ok(())
}

/// When the local replica goes away the remote one takes over.
#[tokio::test(start_paused = true)]
async fn test_failover_to_remote() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.resolver.add_host("local.example.com", &["192.168.1.10"]);
    env.resolver.add_host("remote.example.com", &["10.0.0.2"]);
    env.resolver.add_local("192.168.1.10");
    env.transport.add("192.168.1.10:389", EndpointBehavior::new());
    env.transport.add("10.0.0.2:389", EndpointBehavior::new());
    env.node("node1", &["local.example.com", "remote.example.com"]);

    let conn = env.manager.get_connection("node1").await?;
    env.transport
        .add("192.168.1.10:389", EndpointBehavior::new().refuse());

    let guard = conn.lock().await?;
    conn.unlock(guard, true).await;
    assert_eq!(conn.status(), ConnectionStatus::Unknown);

    let guard = conn.lock().await?;
    assert_eq!(
        guard.replica().and_then(|r| r.endpoint().socket_addr()),
        Some("10.0.0.2:389".parse()?)
    );
    conn.unlock(guard, false).await;
    Ok(())
}

/// A network change revives an unsafe pooled connection.
#[tokio::test(start_paused = true)]
async fn test_network_transition_recovers() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.node("node1", &["10.0.0.1"]);

    assert!(env.manager.get_connection("node1").await.is_err());
    env.transport.add("10.0.0.1:389", EndpointBehavior::new());

    env.manager.network_transition();
    env.manager.state().wait_for_check().await;

    let conn = env.manager.get_connection("node1").await?;
    assert_eq!(conn.status(), ConnectionStatus::Safe);
    Ok(())
}
