//! Pool sharing and suspension tests.

use std::sync::Arc;

use ds_core::ConnectionStatus;
use ds_session::testing::EndpointBehavior;
use ds_session::SessionError;

use crate::common::TestEnv;

/// Two lookups without an intervening failure share one connection.
#[tokio::test]
async fn test_pool_dedup() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport.add("10.0.0.1:389", EndpointBehavior::new());
    env.node("node1", &["10.0.0.1"]);

    let first = env.manager.get_connection("node1").await?;
    let second = env.manager.get_connection("node1").await?;

    assert!(Arc::ptr_eq(&first, &second), "should reuse pooled connection");
    assert_eq!(env.transport.total_connects(), 1);
    Ok(())
}

/// Local-socket nodes never hand out a shared connection.
#[tokio::test]
async fn test_local_socket_never_pooled() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport.add("/var/run/ldapi", EndpointBehavior::new());

    let first = env.manager.get_connection("ldapi://%2Fvar%2Frun%2Fldapi").await?;
    let second = env.manager.get_connection("ldapi://%2Fvar%2Frun%2Fldapi").await?;

    assert!(!Arc::ptr_eq(&first, &second), "local socket must not be shared");
    assert_eq!(env.manager.pool_len(), 0);
    assert_eq!(env.transport.connects("/var/run/ldapi"), 2);
    Ok(())
}

/// Dynamic URL nodes are pooled like configured ones.
#[tokio::test]
async fn test_url_node_is_pooled() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport.add("10.0.0.7:389", EndpointBehavior::new());

    let first = env.manager.get_connection("ldap://10.0.0.7").await?;
    let second = env.manager.get_connection("ldap://10.0.0.7").await?;

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(env.manager.registry().len(), 1);
    Ok(())
}

/// While asleep, maintenance, network changes and health checks do nothing.
#[tokio::test]
async fn test_sleep_suppression() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport.add("10.0.0.1:389", EndpointBehavior::new());
    env.node("node1", &["10.0.0.1"]);
    let conn = env.manager.get_connection("node1").await?;

    env.manager.system_going_to_sleep().await;
    assert_eq!(conn.status(), ConnectionStatus::Unsafe);
    assert!(!conn.has_session().await, "idle session should be closed");

    let connects = env.transport.total_connects();
    let ticks = conn.idle_ticks();

    env.manager.periodic_task().await;
    env.manager.network_transition();
    env.manager.check_failed().await;
    assert!(!env.manager.launch_check_failed(true));

    assert_eq!(env.transport.total_connects(), connects);
    assert_eq!(conn.idle_ticks(), ticks);
    assert_eq!(conn.status(), ConnectionStatus::Unsafe);
    assert_eq!(env.manager.pool_len(), 1);
    assert!(matches!(
        env.manager.get_connection("node1").await,
        Err(SessionError::Unavailable(_))
    ));

    env.manager.system_will_power_on();
    assert_eq!(conn.status(), ConnectionStatus::Unknown);
    env.manager.state().wait_for_check().await;
    assert_eq!(conn.status(), ConnectionStatus::Safe);
    Ok(())
}

/// Dropping the last outside reference lets the sweep reap the connection.
#[tokio::test]
async fn test_unreferenced_connection_is_reaped() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport.add("10.0.0.1:389", EndpointBehavior::new());
    env.node("node1", &["10.0.0.1"]);

    let conn = env.manager.get_connection("node1").await?;
    env.manager.periodic_task().await;
    assert_eq!(env.manager.pool_len(), 1, "held connection survives");

    drop(conn);
    env.manager.periodic_task().await;
    assert_eq!(env.manager.pool_len(), 0);
    assert_eq!(env.transport.unbinds(), 1);

    let again = env.manager.get_connection("node1").await?;
    assert_eq!(again.status(), ConnectionStatus::Safe);
    Ok(())
}

/// Authenticated clones are retained and swept with the pool.
#[tokio::test]
async fn test_authenticated_clone_is_retained() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport
        .add("10.0.0.1:389", EndpointBehavior::new().password("secret"));
    env.node("node1", &["10.0.0.1"]);

    let shared = env.manager.get_connection("node1").await?;
    let mut conn = Arc::clone(&shared);
    env.manager
        .auth_connection(&mut conn, "cn=alice", "secret", None)
        .await?;

    assert!(!Arc::ptr_eq(&conn, &shared));
    assert_eq!(env.manager.authenticated_len(), 1);
    assert_eq!(env.transport.simple_binds(), 1);

    drop(conn);
    env.manager.periodic_task().await;
    assert_eq!(env.manager.authenticated_len(), 0);
    Ok(())
}

/// One user's wrong password never marks the node down.
#[tokio::test]
async fn test_rejected_user_keeps_node_available() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport
        .add("10.0.0.1:389", EndpointBehavior::new().password("secret"));
    env.node("node1", &["10.0.0.1"]);

    let shared = env.manager.get_connection("node1").await?;
    let mut conn = Arc::clone(&shared);
    let result = env
        .manager
        .auth_connection(&mut conn, "cn=alice", "wrong", None)
        .await;

    assert!(matches!(result, Err(ref e) if e.is_auth_error()));
    assert!(Arc::ptr_eq(&conn, &shared));
    assert_eq!(shared.status(), ConnectionStatus::Safe);
    assert_ne!(env.availability.last("node1"), Some(false));
    assert!(env.availability.updates().iter().all(|(_, up)| *up));
    assert_eq!(env.manager.authenticated_len(), 0);
    Ok(())
}
