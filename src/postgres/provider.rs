// ABOUTME: Connection capability handed to sources and destinations
// ABOUTME: Scoped acquisition via guards; provider ids identify physical connections

use std::fmt;
use std::ops::DerefMut;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio_postgres::Client;

use super::connection::connect_with_retry;
use crate::error::Result;
use crate::utils::strip_password_from_url;

/// A borrowed connection. Dropping the guard releases it.
pub type ConnectionGuard = Box<dyn DerefMut<Target = Client> + Send>;

/// Capability to borrow a database connection for the duration of a scope.
///
/// Implementations must hand out one connection at a time per physical
/// connection; two providers with equal [`id`](ConnectionProvider::id) are
/// assumed to share that connection.
#[async_trait]
pub trait ConnectionProvider: Send + Sync + fmt::Debug {
    /// Identity of the underlying physical connection.
    fn id(&self) -> &str;

    /// Borrow the connection until the returned guard is dropped.
    async fn acquire(&self) -> Result<ConnectionGuard>;
}

/// True when both providers hand out the same physical connection.
pub fn shares_connection(a: &dyn ConnectionProvider, b: &dyn ConnectionProvider) -> bool {
    a.id() == b.id()
}

/// A single lazily-opened PostgreSQL connection shared by every user of
/// this provider.
///
/// Users are serialized through an owned mutex guard, so a second `acquire`
/// waits until the first guard is dropped.
pub struct PgConnection {
    name: String,
    url: String,
    client: OnceCell<Arc<Mutex<Client>>>,
}

impl PgConnection {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client: OnceCell::new(),
        }
    }

    /// Wrap an already-connected client.
    pub fn from_client(name: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            url: String::new(),
            client: OnceCell::new_with(Some(Arc::new(Mutex::new(client)))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("name", &self.name)
            .field("url", &strip_password_from_url(&self.url))
            .field("connected", &self.client.initialized())
            .finish()
    }
}

#[async_trait]
impl ConnectionProvider for PgConnection {
    fn id(&self) -> &str {
        &self.name
    }

    async fn acquire(&self) -> Result<ConnectionGuard> {
        let shared = self
            .client
            .get_or_try_init(|| async {
                tracing::debug!(
                    "Opening connection '{}' to {}",
                    self.name,
                    strip_password_from_url(&self.url)
                );
                let client = connect_with_retry(&self.url).await?;
                Ok::<_, crate::error::SyncError>(Arc::new(Mutex::new(client)))
            })
            .await?
            .clone();

        let mut guard = shared.lock_owned().await;
        if guard.is_closed() && !self.url.is_empty() {
            tracing::warn!("Connection '{}' was closed, reconnecting", self.name);
            *guard = connect_with_retry(&self.url).await?;
        }

        Ok(Box::new(guard))
    }
}
