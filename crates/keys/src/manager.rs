//! Identity-scoped ledger connections with guaranteed release

use crate::error::KeyResult;
use futures::future::BoxFuture;
use keyledger_ledger::{ConnectionError, Identity, LedgerConnection, LedgerConnector};
use std::sync::Arc;
use tracing::{debug, warn};

/// Opens ledger connections on behalf of callers.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn LedgerConnector>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn LedgerConnector>) -> Self {
        Self { connector }
    }

    /// Connect as `identity`. The returned guard must be released with
    /// [`ConnectionGuard::release`]; dropping it disconnects in the background.
    pub async fn create_connection(
        &self,
        identity: &Identity,
    ) -> Result<ConnectionGuard, ConnectionError> {
        if identity.is_empty() {
            return Err(ConnectionError::EmptyIdentity);
        }
        let connection = self.connector.connect(identity).await?;
        debug!(identity = %identity, "ledger connection opened");
        Ok(ConnectionGuard::new(Arc::from(connection)))
    }

    /// Run `body` against a connection opened for `identity`.
    ///
    /// The connection is released exactly once before this returns, whether
    /// `body` succeeds or fails. If `body` panics or the returned future is
    /// dropped mid-flight, the guard's `Drop` releases it instead.
    pub async fn scoped<T, F>(&self, identity: &Identity, body: F) -> KeyResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c dyn LedgerConnection) -> BoxFuture<'c, KeyResult<T>> + Send,
    {
        let guard = self.create_connection(identity).await?;
        let outcome = body(guard.connection()).await;
        let released = guard.release().await;

        match (outcome, released) {
            (outcome, Ok(())) => outcome,
            (Ok(value), Err(err)) => {
                warn!(identity = %identity, error = %err, "release failed after completed operation");
                Ok(value)
            }
            (Err(err), Err(release_err)) => {
                warn!(identity = %identity, error = %release_err, "release failed after failed operation");
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}

/// Exclusive ownership of one live connection.
pub struct ConnectionGuard {
    connection: Arc<dyn LedgerConnection>,
    released: bool,
}

impl ConnectionGuard {
    fn new(connection: Arc<dyn LedgerConnection>) -> Self {
        Self {
            connection,
            released: false,
        }
    }

    pub fn connection(&self) -> &dyn LedgerConnection {
        self.connection.as_ref()
    }

    pub fn identity(&self) -> &Identity {
        self.connection.identity()
    }

    /// Disconnect now. Consumes the guard so release cannot run twice.
    pub async fn release(mut self) -> keyledger_ledger::Result<()> {
        self.released = true;
        let result = self.connection.disconnect().await;
        debug!(identity = %self.connection.identity(), ok = result.is_ok(), "ledger connection released");
        result
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let connection = Arc::clone(&self.connection);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(identity = %connection.identity(), "releasing abandoned ledger connection");
                handle.spawn(async move {
                    if let Err(err) = connection.disconnect().await {
                        warn!(identity = %connection.identity(), error = %err, "abandoned connection failed to disconnect");
                    }
                });
            }
            Err(_) => {
                warn!(identity = %connection.identity(), "no runtime to release abandoned ledger connection");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("identity", self.connection.identity())
            .field("released", &self.released)
            .finish()
    }
}
