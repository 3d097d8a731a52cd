//! SQL Server connections over tiberius, pooled with bb8.
//!
//! Connections are built from ADO.NET connection strings. Managed identity
//! sources authenticate with an AAD access token instead of the
//! credentials in the string. Azure SQL gateway redirects are followed once.
//!
//! A checked-out [`MssqlConn`] goes back to the pool only when the caller
//! [releases](MssqlConn::release) it after a completed exchange. Dropping it
//! any other way (a timeout, an error, a cancelled future) leaves unread
//! response data or a half-sent bulk load on the wire, so the connection is
//! discarded and the next checkout reconnects.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

pub type MssqlClient = Client<Compat<TcpStream>>;

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    connection_string: String,
    access_token: Option<String>,
    /// Set when the checked-out connection was abandoned mid-exchange.
    broken: Arc<AtomicBool>,
}

impl TiberiusConnectionManager {
    pub fn new(connection_string: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            access_token,
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    fn build_config(&self) -> std::result::Result<Config, tiberius::error::Error> {
        let mut config = Config::from_ado_string(&self.connection_string)?;
        if let Some(token) = &self.access_token {
            config.authentication(AuthMethod::aad_token(token));
        }
        Ok(config)
    }

    async fn connect_to(config: Config) -> std::result::Result<MssqlClient, tiberius::error::Error> {
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }
}

impl fmt::Debug for TiberiusConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TiberiusConnectionManager")
            .field("connection_string", &"<redacted>")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config()?;
        match Self::connect_to(config.clone()).await {
            Err(tiberius::error::Error::Routing { host, port }) => {
                debug!("Following gateway redirect to {}:{}", host, port);
                let mut redirected = config;
                redirected.host(&host);
                redirected.port(port);
                Self::connect_to(redirected).await
            }
            other => other,
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        let broken = self.broken.swap(false, Ordering::AcqRel);
        if broken {
            debug!("Discarding connection abandoned mid-exchange");
        }
        broken
    }
}

/// Marks a connection broken unless the exchange it covers completed.
pub(crate) struct InFlight<'a> {
    broken: &'a AtomicBool,
    completed: bool,
}

impl<'a> InFlight<'a> {
    pub(crate) fn new(broken: &'a AtomicBool) -> Self {
        Self {
            broken,
            completed: false,
        }
    }

    pub(crate) fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.broken.store(true, Ordering::Release);
        }
    }
}

/// A checked-out connection. Call [`release`](Self::release) once the
/// response has been fully read.
pub struct MssqlConn<'a> {
    // Dropped before `conn`, so the flag is set by the time bb8 asks
    // `has_broken`.
    in_flight: InFlight<'a>,
    conn: PooledConnection<'a, TiberiusConnectionManager>,
}

impl MssqlConn<'_> {
    /// Return the connection to the pool for the next statement.
    pub fn release(mut self) {
        self.in_flight.complete();
    }
}

impl Deref for MssqlConn<'_> {
    type Target = MssqlClient;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for MssqlConn<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Single-connection pool: one physical connection per database per job,
/// reused by every statement of that job.
pub struct MssqlPool {
    pool: Pool<TiberiusConnectionManager>,
    broken: Arc<AtomicBool>,
    label: String,
}

impl MssqlPool {
    /// Open and test the connection.
    pub async fn connect(
        label: impl Into<String>,
        connection_string: &str,
        access_token: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let label = label.into();
        let manager = TiberiusConnectionManager::new(connection_string, access_token);
        let broken = manager.broken.clone();
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(connect_timeout)
            .build(manager)
            .await
            .map_err(|e| SyncError::connection(e, format!("connecting to {}", label)))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| SyncError::connection(e, format!("testing connection to {}", label)))?;
            conn.simple_query("SELECT 1").await?.into_row().await?;
        }

        info!("Connected to {}", label);
        Ok(Self { pool, broken, label })
    }

    /// Check out the connection, reconnecting if the last one was abandoned.
    pub async fn get_conn(&self) -> Result<MssqlConn<'_>> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| SyncError::connection(e, format!("getting connection to {}", self.label)))?;
        Ok(MssqlConn {
            in_flight: InFlight::new(&self.broken),
            conn,
        })
    }

    /// `server/database` this pool talks to.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Run a database future under a timeout.
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout {
            operation: operation.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}
