//! Connection lock protocol and state machine tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ds_core::{ConnectionStatus, SaslMechanism, SecurityLevel};
use ds_session::testing::EndpointBehavior;
use ds_session::{AuthMode, AuthState, Connection, SessionError};

use crate::common::TestEnv;

fn password(secret: &str) -> AuthMode {
    AuthMode::Password {
        username: "cn=svc,dc=example,dc=com".to_string(),
        password: secret.to_string(),
        kerberos_id: None,
    }
}

/// At most one caller holds the session at any time.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport.add("10.0.0.1:389", EndpointBehavior::new());
    let conn = Arc::new(Connection::new(
        env.node("node1", &["10.0.0.1"]),
        AuthMode::Anonymous,
    ));
    let holders = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let conn = Arc::clone(&conn);
        let holders = Arc::clone(&holders);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let guard = conn.lock().await?;
            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            holders.fetch_sub(1, Ordering::SeqCst);
            conn.unlock(guard, false).await;
            Ok::<_, SessionError>(())
        }));
    }
    for result in futures::future::join_all(tasks).await {
        result??;
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(env.transport.total_connects(), 1);
    Ok(())
}

/// Returning another connection's guard is a programming error.
#[tokio::test]
#[should_panic(expected = "did not issue it")]
async fn test_foreign_guard_is_fatal() {
    let env = TestEnv::new();
    env.transport.add("10.0.0.1:389", EndpointBehavior::new());
    let node = env.node("node1", &["10.0.0.1"]);
    let owner = Connection::new(Arc::clone(&node), AuthMode::Anonymous);
    let other = Connection::new(node, AuthMode::Anonymous);

    let guard = owner.lock().await.unwrap();
    other.unlock(guard, false).await;
}

/// A failed unlock always leaves the connection unknown with no session.
#[tokio::test]
async fn test_failed_unlock_status() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport.add("10.0.0.1:389", EndpointBehavior::new());
    let conn = Connection::new(env.node("node1", &["10.0.0.1"]), AuthMode::Anonymous);

    for _ in 0..3 {
        let guard = conn.lock().await?;
        conn.unlock(guard, true).await;
        assert_eq!(conn.status(), ConnectionStatus::Unknown);
        assert!(!conn.has_session().await);
    }
    assert_eq!(env.transport.total_connects(), 3);
    assert_eq!(env.transport.unbinds(), 3);
    Ok(())
}

/// Rejected credentials never reach the network again until updated.
#[tokio::test]
async fn test_sticky_bad_credentials() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport
        .add("10.0.0.1:389", EndpointBehavior::new().password("right"));
    let conn = Connection::new(env.node("node1", &["10.0.0.1"]), password("wrong"));

    let first = conn.lock().await;
    assert!(matches!(first, Err(ref e) if e.is_auth_error()));
    assert_eq!(conn.auth_state().await, AuthState::CredentialsRejected);

    for _ in 0..5 {
        conn.network_transition();
        assert!(matches!(
            conn.lock().await,
            Err(SessionError::CredentialsRejected(_))
        ));
    }
    assert_eq!(env.transport.total_connects(), 1);
    assert_eq!(env.transport.simple_binds(), 1);

    conn.update_credentials(password("right")).await;
    let guard = conn.lock().await?;
    conn.unlock(guard, false).await;
    assert_eq!(conn.auth_state().await, AuthState::Authenticated);
    assert_eq!(env.transport.total_connects(), 2);
    Ok(())
}

/// Idle sessions are closed after the node's limit and reopened on demand.
#[tokio::test]
async fn test_idle_reap() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport.add("10.0.0.1:389", EndpointBehavior::new());
    let node = env.node("node1", &["10.0.0.1"]);
    let idle_max = node.settings().idle_max_count;
    let conn = Connection::new(node, AuthMode::Anonymous);

    let guard = conn.lock().await?;
    conn.unlock(guard, false).await;

    for _ in 0..idle_max {
        conn.periodic_task().await;
        assert!(conn.has_session().await);
    }
    conn.periodic_task().await;
    assert!(!conn.has_session().await);
    assert_eq!(conn.status(), ConnectionStatus::Safe);

    let guard = conn.lock().await?;
    conn.unlock(guard, false).await;
    assert_eq!(env.transport.total_connects(), 2);
    Ok(())
}

/// A Kerberos ticket lives as long as the session that uses it.
#[tokio::test]
async fn test_ticket_destroyed_on_release() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport.add(
        "10.0.0.1:389",
        EndpointBehavior::new()
            .mechanisms(&[SaslMechanism::Gssapi])
            .fqdn("ldap1.example.com"),
    );
    let conn = Connection::new(
        env.node("node1", &["10.0.0.1"]),
        AuthMode::Kerberos {
            kerberos_id: "alice@EXAMPLE.COM".to_string(),
        },
    );

    let guard = conn.lock().await?;
    assert_eq!(guard.security_level(), SecurityLevel::ALL);
    conn.unlock(guard, false).await;
    assert_eq!(env.credentials.acquired(), vec!["alice@EXAMPLE.COM".to_string()]);
    assert!(env.credentials.destroyed().is_empty());

    conn.release().await;
    let destroyed = env.credentials.destroyed();
    assert_eq!(destroyed.len(), 1);
    assert_eq!(destroyed[0].principal, "alice@EXAMPLE.COM");
    Ok(())
}

fn kerberos() -> AuthMode {
    AuthMode::Kerberos {
        kerberos_id: "alice@EXAMPLE.COM".to_string(),
    }
}

/// A credential store outage fails the bind but never sticks.
#[tokio::test]
async fn test_credential_store_outage_is_retried() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport.add(
        "10.0.0.1:389",
        EndpointBehavior::new().mechanisms(&[SaslMechanism::Gssapi]),
    );
    env.credentials.set_failing(true);
    let conn = Connection::new(env.node("node1", &["10.0.0.1"]), kerberos());

    let result = conn.lock().await;
    assert!(matches!(result, Err(SessionError::AuthFailed { .. })));
    assert_ne!(conn.auth_state().await, AuthState::CredentialsRejected);
    assert_ne!(conn.status(), ConnectionStatus::Unsafe);
    assert_ne!(env.availability.last("node1"), Some(false));

    env.credentials.set_failing(false);
    conn.network_transition();
    let guard = conn.lock().await?;
    conn.unlock(guard, false).await;
    assert_eq!(conn.auth_state().await, AuthState::Authenticated);
    Ok(())
}

/// A bind that times out is a reachability failure, not a credential one.
#[tokio::test]
async fn test_bind_timeout_is_retry_eligible() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport
        .add("10.0.0.1:389", EndpointBehavior::new().time_out_binds());
    let conn = Connection::new(env.node("node1", &["10.0.0.1"]), password("right"));

    assert!(matches!(conn.lock().await, Err(SessionError::Unavailable(_))));
    assert_eq!(conn.status(), ConnectionStatus::Unsafe);
    assert_ne!(conn.auth_state().await, AuthState::CredentialsRejected);

    env.transport.add("10.0.0.1:389", EndpointBehavior::new());
    conn.network_transition();
    assert_eq!(conn.status(), ConnectionStatus::Unknown);
    let guard = conn.lock().await?;
    conn.unlock(guard, false).await;
    assert_eq!(conn.status(), ConnectionStatus::Safe);
    assert_eq!(env.transport.total_connects(), 2);
    Ok(())
}

/// A replica without GSSAPI refuses Kerberos; the next attempt still binds.
#[tokio::test]
async fn test_kerberos_without_gssapi_is_retry_eligible() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.transport.add("10.0.0.1:389", EndpointBehavior::new());
    let conn = Connection::new(env.node("node1", &["10.0.0.1"]), kerberos());

    assert!(matches!(
        conn.lock().await,
        Err(SessionError::AuthFailed { .. })
    ));
    assert_ne!(conn.auth_state().await, AuthState::CredentialsRejected);
    assert_ne!(env.availability.last("node1"), Some(false));

    for _ in 0..2 {
        assert!(matches!(
            conn.lock().await,
            Err(SessionError::AuthFailed { .. })
        ));
    }
    assert_eq!(env.transport.total_connects(), 3);
    assert!(env.credentials.acquired().is_empty());
    Ok(())
}
