//! Kerberos credential store boundary.
//!
//! Ticket acquisition may block on a KDC for a long time. The core calls
//! into the store only while holding its own credential gate, never while
//! holding a pool-wide lock.

use async_trait::async_trait;

use crate::error::{SpiError, SpiResult};

/// An acquired ticket cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TicketHandle {
    /// Client principal the cache holds tickets for.
    pub principal: String,
    /// Store-specific cache name.
    pub cache_name: String,
}

impl TicketHandle {
    /// Creates a handle.
    #[must_use]
    pub fn new(principal: impl Into<String>, cache_name: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            cache_name: cache_name.into(),
        }
    }
}

/// Acquires and destroys Kerberos tickets.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Obtains or refreshes a ticket for `principal`.
    ///
    /// With `secret` set the store authenticates to the KDC; without it the
    /// store must find an existing cache for the principal.
    async fn acquire_ticket(&self, principal: &str, secret: Option<&str>)
        -> SpiResult<TicketHandle>;

    /// Destroys a cache previously returned by [`acquire_ticket`](Self::acquire_ticket).
    async fn destroy_ticket(&self, ticket: &TicketHandle) -> SpiResult<()>;
}

/// Store used when Kerberos is not available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentialStore;

#[async_trait]
impl CredentialStore for NoCredentialStore {
    async fn acquire_ticket(
        &self,
        principal: &str,
        _secret: Option<&str>,
    ) -> SpiResult<TicketHandle> {
        Err(SpiError::unsupported(format!(
            "no credential store configured for {principal}"
        )))
    }

    async fn destroy_ticket(&self, _ticket: &TicketHandle) -> SpiResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_store_refuses_tickets() {
        let store = NoCredentialStore;
        let result = store.acquire_ticket("user@EXAMPLE.COM", Some("pw")).await;
        assert!(matches!(result, Err(SpiError::Unsupported(_))));

        let ticket = TicketHandle::new("user@EXAMPLE.COM", "MEMORY:1");
        assert!(store.destroy_ticket(&ticket).await.is_ok());
    }
}
