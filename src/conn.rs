//! Pooled, retrying access to the source and target stores.
//!
//! One long-lived client is opened per endpoint and kept for the life of the
//! process. Workers rent a [`Session`] before touching a store; the session
//! pool caps how many may be outstanding per endpoint, and a failed health
//! probe bumps the pool generation so stale sessions are quietly discarded
//! instead of returned.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;
use crate::store::{self, CollectionHandle, ConnectOptions, StoreClient};

/// Retry policy for operations that touch the network: up to `limit`
/// attempts with a delay of `base_delay · attempt` between them. Only
/// transient errors are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub limit: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> RetryPolicy {
        RetryPolicy {
            limit: cfg.retry_limit.max(1),
            base_delay: cfg.retry_delay,
        }
    }

    /// Run `op`, retrying transient failures with linear backoff.
    ///
    /// Backoff sleeps are shutdown-checked at one-second granularity; a
    /// shutdown during the wait surfaces as [`Error::Shutdown`].
    pub fn run<T, F>(&self, shutdown: &Shutdown, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.limit => {
                    warn!(what, attempt, %err, "transient failure, retrying");
                    if !shutdown.sleep(self.base_delay * attempt) {
                        return Err(Error::Shutdown);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

struct SessionPool {
    /// The maximum number of outstanding sessions.
    size: usize,
    in_use: usize,
    /// Bumped when a health probe fails; sessions from an older generation
    /// are discarded on drop instead of returned.
    generation: u64,
}

struct Endpoint {
    client: Arc<dyn StoreClient>,
    pool: Mutex<SessionPool>,
    // Threads waiting for the pool to hand a session back.
    wait: Condvar,
}

/// Opens one long-lived client per endpoint and rents out sessions from a
/// capped pool.
pub struct ConnectionManager {
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
    options: ConnectOptions,
    pool_size: usize,
    pub retry: RetryPolicy,
}

impl ConnectionManager {
    pub fn new(cfg: &Config) -> ConnectionManager {
        ConnectionManager {
            endpoints: Mutex::new(HashMap::new()),
            options: ConnectOptions {
                connection_timeout: cfg.connection_timeout,
                socket_timeout: cfg.socket_timeout,
            },
            pool_size: cfg.max_pool_size.max(1),
            retry: RetryPolicy::from_config(cfg),
        }
    }

    fn endpoint(&self, uri: &str) -> Result<Arc<Endpoint>> {
        let mut endpoints = self
            .endpoints
            .lock()
            .map_err(|_| Error::Operation("endpoint table lock poisoned".into()))?;
        if let Some(endpoint) = endpoints.get(uri) {
            return Ok(endpoint.clone());
        }
        let client = store::connect(uri, &self.options)?;
        let endpoint = Arc::new(Endpoint {
            client,
            pool: Mutex::new(SessionPool {
                size: self.pool_size,
                in_use: 0,
                generation: 0,
            }),
            wait: Condvar::new(),
        });
        endpoints.insert(uri.to_owned(), endpoint.clone());
        Ok(endpoint)
    }

    /// Acquire a session against `uri`, blocking while the pool is
    /// exhausted.
    pub fn session(&self, uri: &str) -> Result<Session> {
        let endpoint = self.endpoint(uri)?;
        let generation = {
            let mut pool = endpoint
                .pool
                .lock()
                .map_err(|_| Error::Operation("session pool lock poisoned".into()))?;
            while pool.in_use >= pool.size {
                pool = endpoint
                    .wait
                    .wait(pool)
                    .map_err(|_| Error::Operation("session pool lock poisoned".into()))?;
            }
            pool.in_use += 1;
            pool.generation
        };
        Ok(Session {
            endpoint,
            generation,
        })
    }

    /// Health-probe an endpoint. A failed probe discards pooled sessions so
    /// later acquisitions start from a fresh generation.
    pub fn ping(&self, uri: &str) -> Result<()> {
        let endpoint = self.endpoint(uri)?;
        match endpoint.client.ping() {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Ok(mut pool) = endpoint.pool.lock() {
                    pool.generation += 1;
                    pool.in_use = 0;
                }
                endpoint.wait.notify_all();
                Err(err)
            }
        }
    }

    /// Validate both replication endpoints before any worker starts.
    pub fn validate(&self, cfg: &Config, shutdown: &Shutdown) -> Result<()> {
        info!("validating source endpoint");
        self.retry
            .run(shutdown, "source ping", || self.ping(&cfg.source_uri))?;
        info!("validating target endpoint");
        self.retry
            .run(shutdown, "target ping", || self.ping(&cfg.target_uri))?;
        info!("endpoints validated");
        Ok(())
    }
}

/// A rented client session. Its pool slot is returned on drop.
pub struct Session {
    endpoint: Arc<Endpoint>,
    generation: u64,
}

impl Session {
    pub fn client(&self) -> &dyn StoreClient {
        self.endpoint.client.as_ref()
    }

    pub fn collection(&self, db: &str, name: &str) -> Box<dyn CollectionHandle> {
        self.endpoint.client.collection(db, name)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Return the slot, or discard it silently if the generation moved on
        // or the pool lock has been poisoned.
        if let Ok(mut pool) = self.endpoint.pool.lock() {
            if pool.generation == self.generation && pool.in_use > 0 {
                pool.in_use -= 1;
                self.endpoint.wait.notify_one();
            }
        }
    }
}
