//! TCP stub server.
//!
//! Accepts one connection at a time and handles it fully before accepting
//! the next. Keeping it serial keeps the injected latency of one request
//! independent of every other request.

use crate::config::{ConfigError, ServerConfig};
use crate::protocols::stub::{self, RuleTable};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use socket2::{Domain, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Artificial latency injected before each reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Latency {
    /// Uniform in `[0, max)`.
    Uniform { max: Duration },
    /// Exactly this long every time.
    Fixed(Duration),
}

impl Latency {
    /// Uniform latency bounded by `max_secs`, which must be strictly positive.
    pub fn uniform(max_secs: f64) -> Result<Self, ConfigError> {
        Ok(Latency::Uniform {
            max: positive_secs(max_secs)?,
        })
    }

    /// Constant latency of `secs`, which must be strictly positive.
    pub fn fixed(secs: f64) -> Result<Self, ConfigError> {
        Ok(Latency::Fixed(positive_secs(secs)?))
    }

    /// Configured upper bound (or the constant for fixed latency).
    pub fn bound(&self) -> Duration {
        match self {
            Latency::Uniform { max } => *max,
            Latency::Fixed(d) => *d,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match self {
            Latency::Uniform { max } => max.mul_f64(rng.gen::<f64>()),
            Latency::Fixed(d) => *d,
        }
    }
}

fn positive_secs(secs: f64) -> Result<Duration, ConfigError> {
    // `!(secs > 0.0)` also rejects NaN
    if !(secs > 0.0) {
        return Err(ConfigError::InvalidLatency(secs));
    }
    // Infinity and values past `Duration::MAX` fail here
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidLatency(secs))
}

/// Server instance
pub struct StubServer {
    config: ServerConfig,
    listener: TcpListener,
    rules: RuleTable,
    rng: StdRng,
}

impl StubServer {
    /// Bind the listening socket.
    ///
    /// This is the only fatal failure point: once bound, per-connection
    /// errors never stop the server.
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let listener = listen(&config.listen(), config.backlog)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(StubServer {
            config,
            listener,
            rules: RuleTable::default(),
            rng,
        })
    }

    /// Replace the default rule table
    pub fn with_rules(mut self, rules: RuleTable) -> Self {
        self.rules = rules;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and handle connections until `shutdown` resolves.
    ///
    /// Shutdown is only observed between connections, so a request that is
    /// being handled always completes first.
    pub async fn serve<F>(mut self, shutdown: F) -> io::Result<()>
    where
        F: Future,
    {
        info!(
            address = %self.local_addr()?,
            latency = ?self.config.latency,
            "Server started"
        );

        tokio::pin!(shutdown);
        let mut accept_failures = 0u32;

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = &mut shutdown => {
                    info!("Server shutting down");
                    return Ok(());
                }
            };

            match accepted {
                Ok((mut stream, addr)) => {
                    accept_failures = 0;
                    debug!(peer = %addr, "New connection");

                    if let Err(e) = stub::handle_connection(
                        &mut stream,
                        &self.rules,
                        &self.config.latency,
                        &mut self.rng,
                        self.config.read_timeout,
                    )
                    .await
                    {
                        debug!(peer = %addr, error = %e, "Connection error");
                    }
                    // `stream` drops here: the connection is always closed
                }
                Err(e) => {
                    accept_failures = accept_failures.saturating_add(1);
                    let delay = accept_backoff(accept_failures);
                    error!(error = %e, retry_in = ?delay, "Failed to accept connection");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut shutdown => {
                            info!("Server shutting down");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Serve forever.
    pub async fn run(self) -> io::Result<()> {
        self.serve(std::future::pending::<()>()).await
    }
}

/// Pause after the `failures`-th accept error in a row: 10ms doubling up
/// to one second. Errors like EMFILE persist until a descriptor frees up.
fn accept_backoff(failures: u32) -> Duration {
    const BASE: Duration = Duration::from_millis(10);
    const MAX: Duration = Duration::from_secs(1);

    let shift = failures.saturating_sub(1).min(16);
    BASE.saturating_mul(1 << shift).min(MAX)
}

/// Bind a non-blocking listener with an explicit backlog.
fn listen(address: &str, backlog: i32) -> io::Result<TcpListener> {
    let addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address to bind"))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}
