//! Warm pool of authenticated connections
//!
//! Keeps up to `connection_pool_size` WebSocket sessions, created lazily
//! through the token exchange. A returned connection stays warm for the idle
//! TTL and is handed back to the next session with a matching
//! `(language, sample_rate)` tuple; a background reaper closes whatever sits
//! idle too long.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::config::SttConfig;
use crate::connection::Connection;
use crate::error::SttError;
use crate::token::TokenExchanger;

/// Idle connections older than this are closed instead of reused
const IDLE_TTL: Duration = Duration::from_secs(30);

/// How often the reaper sweeps the idle list
const REAP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct PoolInner {
    idle: Vec<Connection>,
    /// Connections alive anywhere: idle here plus checked out by sessions
    total: usize,
    closed: bool,
}

/// Bounded pool of warm [`Connection`]s
#[derive(Debug)]
pub(crate) struct ConnectionPool {
    inner: Arc<Mutex<PoolInner>>,
    released: Arc<Notify>,
    exchanger: TokenExchanger,
    max_size: usize,
    reaper: tokio::task::JoinHandle<()>,
}

enum Plan {
    Reuse(Connection),
    Mint,
    Wait,
}

impl ConnectionPool {
    pub fn new(config: &SttConfig) -> Self {
        let inner = Arc::new(Mutex::new(PoolInner {
            idle: Vec::new(),
            total: 0,
            closed: false,
        }));
        let released = Arc::new(Notify::new());
        let reaper = tokio::spawn(reap_loop(Arc::downgrade(&inner), released.clone()));

        Self {
            inner,
            released,
            exchanger: TokenExchanger::new(config),
            max_size: config.connection_pool_size,
            reaper,
        }
    }

    /// Check out a ready connection, waiting up to `wait` when saturated
    ///
    /// Token-exchange and open errors propagate unchanged so the caller can
    /// apply its own retry classification.
    pub async fn acquire(
        &self,
        language: &str,
        sample_rate: u32,
        wait: Duration,
    ) -> Result<Connection, SttError> {
        let deadline = Instant::now() + wait;

        loop {
            let plan = {
                let mut guard = self.inner.lock().await;
                if guard.closed {
                    return Err(SttError::Network("connection pool is closed".to_string()));
                }

                if let Some(pos) = guard.idle.iter().position(|c| {
                    c.matches(language, sample_rate) && c.is_ready() && c.idle_age() < IDLE_TTL
                }) {
                    let mut conn = guard.idle.swap_remove(pos);
                    conn.mark_checked_out();
                    Plan::Reuse(conn)
                } else if guard.total < self.max_size {
                    // Reserve the slot before the slow mint/open path
                    guard.total += 1;
                    Plan::Mint
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Reuse(conn) => {
                    log::debug!("Pool: reusing idle connection");
                    return Ok(conn);
                }
                Plan::Mint => match self.mint_and_open(language, sample_rate).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        self.inner.lock().await.total -= 1;
                        self.released.notify_one();
                        return Err(e);
                    }
                },
                Plan::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SttError::Network(
                            "timed out waiting for a pooled connection".to_string(),
                        ));
                    }
                    let _ = timeout(deadline - now, self.released.notified()).await;
                }
            }
        }
    }

    /// Return a connection; kept warm when still usable, closed otherwise
    pub async fn release(&self, mut conn: Connection) {
        let to_close = {
            let mut guard = self.inner.lock().await;
            if !guard.closed && conn.is_ready() && conn.idle_age() < IDLE_TTL {
                conn.mark_idle();
                guard.idle.push(conn);
                None
            } else {
                guard.total -= 1;
                Some(conn)
            }
        };

        self.released.notify_one();
        if let Some(conn) = to_close {
            log::debug!("Pool: closing returned connection instead of pooling it");
            conn.close().await;
        }
    }

    /// Dispose of a failed or drained connection, freeing its slot
    pub async fn discard(&self, conn: Connection) {
        {
            let mut guard = self.inner.lock().await;
            guard.total -= 1;
        }
        self.released.notify_one();
        conn.close().await;
    }

    /// Close every idle connection and refuse further acquisitions
    pub async fn close_all(&self) {
        self.reaper.abort();

        let drained: Vec<Connection> = {
            let mut guard = self.inner.lock().await;
            guard.closed = true;
            let idle_count = guard.idle.len();
            guard.total -= idle_count;
            guard.idle.drain(..).collect()
        };

        log::debug!("Pool: closing {} idle connections", drained.len());
        for conn in drained {
            conn.close().await;
        }
        self.released.notify_waiters();
    }

    async fn mint_and_open(
        &self,
        language: &str,
        sample_rate: u32,
    ) -> Result<Connection, SttError> {
        let ws_url = self.exchanger.mint(language, sample_rate).await?;
        let mut conn = Connection::open(&ws_url, language, sample_rate).await?;
        conn.send_config().await?;
        log::debug!("Pool: opened fresh connection");
        Ok(conn)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

/// Periodically close idle connections past the TTL
async fn reap_loop(inner: std::sync::Weak<Mutex<PoolInner>>, released: Arc<Notify>) {
    let mut tick = tokio::time::interval(REAP_INTERVAL);
    tick.tick().await; // the first tick fires immediately

    loop {
        tick.tick().await;
        let Some(inner) = inner.upgrade() else { return };

        let stale: Vec<Connection> = {
            let mut guard = inner.lock().await;
            let mut keep = Vec::with_capacity(guard.idle.len());
            let mut stale = Vec::new();
            for conn in guard.idle.drain(..) {
                if conn.is_ready() && conn.idle_age() < IDLE_TTL {
                    keep.push(conn);
                } else {
                    stale.push(conn);
                }
            }
            guard.idle = keep;
            guard.total -= stale.len();
            stale
        };

        if !stale.is_empty() {
            log::debug!("Pool: reaping {} stale connections", stale.len());
            for conn in stale {
                conn.close().await;
            }
            released.notify_one();
        }
    }
}
