//! Replica race tests.

use std::time::Duration;

use ds_core::{ConnectionStatus, SaslMechanism, SecurityLevel};
use ds_session::testing::EndpointBehavior;
use ds_session::{AuthMode, Connection};
use tokio::time::Instant;

use crate::common::TestEnv;

fn scripted_race(env: &TestEnv) {
    env.transport.add("10.0.0.1:389", EndpointBehavior::new().hang());
    env.transport.add(
        "10.0.0.2:389",
        EndpointBehavior::new()
            .delay(Duration::from_millis(10))
            .mechanisms(&[SaslMechanism::CramMd5]),
    );
    env.transport.add(
        "10.0.0.3:389",
        EndpointBehavior::new()
            .delay(Duration::from_millis(40))
            .mechanisms(&[SaslMechanism::Gssapi]),
    );
}

/// The first responder that meets policy wins, not the first responder.
#[tokio::test(start_paused = true)]
async fn test_race_tie_break() -> anyhow::Result<()> {
    let env = TestEnv::new();
    scripted_race(&env);
    let node = env.node_with(
        "node1",
        &["10.0.0.1", "10.0.0.2", "10.0.0.3"],
        SecurityLevel::PACKET_SIGNING,
    );

    let started = Instant::now();
    let mut selected = node
        .find_suitable_replica(None, false, false)
        .await
        .ok_or_else(|| anyhow::anyhow!("no replica selected"))?;

    assert_eq!(
        selected.replica.endpoint().socket_addr(),
        Some("10.0.0.3:389".parse()?)
    );
    assert!(started.elapsed() < Duration::from_secs(1), "winner should not wait for A");
    assert_eq!(env.transport.unbinds(), 1, "B is closed after failing policy");
    selected.session.unbind().await?;
    Ok(())
}

/// Kerberos sessions go through the same race and carry GSSAPI security.
#[tokio::test(start_paused = true)]
async fn test_race_then_kerberos_bind() -> anyhow::Result<()> {
    let env = TestEnv::new();
    scripted_race(&env);
    let node = env.node_with(
        "node1",
        &["10.0.0.1", "10.0.0.2", "10.0.0.3"],
        SecurityLevel::PACKET_SIGNING,
    );
    let conn = Connection::new(
        node,
        AuthMode::Kerberos {
            kerberos_id: "alice@EXAMPLE.COM".to_string(),
        },
    );

    let guard = conn.lock().await?;
    assert_eq!(
        guard.replica().and_then(|r| r.endpoint().socket_addr()),
        Some("10.0.0.3:389".parse()?)
    );
    assert_eq!(guard.security_level(), SecurityLevel::ALL);
    conn.unlock(guard, false).await;
    assert_eq!(env.transport.gssapi_binds(), 1);
    assert_eq!(conn.status(), ConnectionStatus::Safe);
    Ok(())
}

/// A replica that never answers is never selected and costs one budget.
#[tokio::test(start_paused = true)]
async fn test_silent_replica_times_out() {
    let env = TestEnv::new();
    env.transport.add("10.0.0.1:389", EndpointBehavior::new().hang());
    let node = env.node("node1", &["10.0.0.1"]);

    let started = Instant::now();
    let conn = Connection::new(node, AuthMode::Anonymous);
    assert!(conn.lock().await.is_err());

    let budget = node_budget();
    assert!(started.elapsed() >= budget);
    assert!(started.elapsed() < budget + Duration::from_millis(100));
    assert_eq!(conn.status(), ConnectionStatus::Unsafe);
    assert_eq!(env.availability.last("node1"), Some(false));
}

fn node_budget() -> Duration {
    // TestEnv nodes use a two second open/close timeout.
    ds_core::RaceSettings::default().budget(Duration::from_secs(2))
}
