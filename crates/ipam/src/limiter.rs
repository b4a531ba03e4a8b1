//! Admission limiter
//!
//! Bounds how many allocation and release operations run against the same
//! pool at once. Every pool update is a compare-and-swap on one Kubernetes
//! object, so unbounded concurrency only turns into conflict retries.
//!
//! The limiter is an actor: callers send commands over an unbounded channel
//! and wait for a grant on a oneshot. Requests are served first come, first
//! served per pool name: a waiting request holds back every later request
//! sharing one of its names, so nobody starves behind a stream of newcomers.
//!
//! A grant is a [`Ticket`]; dropping it gives the capacity back.

use crate::config::LimiterConfig;
use crate::error::IpamError;
use crate::metrics::IpamMetrics;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Reply = oneshot::Sender<Result<(), IpamError>>;

enum Command {
    Acquire { names: Vec<String>, reply: Reply },
    Release { names: Vec<String> },
}

/// Admission limiter handle
///
/// Cheap to clone; all clones talk to the same run loop.
#[derive(Clone)]
pub struct Limiter {
    tx: mpsc::UnboundedSender<Command>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Command>>>>,
    config: LimiterConfig,
    metrics: Arc<IpamMetrics>,
}

/// Grant for a set of pool names, returned on drop
#[must_use = "dropping a ticket releases it immediately"]
pub struct Ticket {
    names: Vec<String>,
    tx: mpsc::UnboundedSender<Command>,
}

impl Ticket {
    /// Pool names covered by the ticket
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.names.is_empty() {
            return;
        }
        let names = std::mem::take(&mut self.names);
        // A stopped run loop holds no capacity any more
        let _ = self.tx.send(Command::Release { names });
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket").field("names", &self.names).finish()
    }
}

impl Limiter {
    /// Creates a limiter. Nothing is granted until [`Limiter::start`] runs.
    pub fn new(config: LimiterConfig, metrics: Arc<IpamMetrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            config,
            metrics,
        }
    }

    /// Starts the run loop; it stops when `token` is canceled.
    pub fn start(&self, token: CancellationToken) -> Result<JoinHandle<()>, IpamError> {
        let rx = self
            .rx
            .lock()
            .map_err(|_| IpamError::Admission("limiter state poisoned".to_string()))?
            .take()
            .ok_or_else(|| IpamError::Admission("limiter already started".to_string()))?;

        let state = State::new(self.config.max_concurrent_per_pool, self.config.max_queue_size);
        info!(
            "Starting admission limiter (per-pool capacity {}, queue size {})",
            self.config.max_concurrent_per_pool, self.config.max_queue_size
        );
        Ok(tokio::spawn(run(state, rx, token)))
    }

    /// Waits until every pool in `names` has capacity and takes it.
    ///
    /// Gives up when `token` is canceled or after the configured maximum
    /// wait. A grant racing the give-up is returned, never leaked.
    pub async fn acquire<I, S>(&self, token: &CancellationToken, names: I) -> Result<Ticket, IpamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        if names.is_empty() {
            return Ok(Ticket { names, tx: self.tx.clone() });
        }

        let (reply, mut rx) = oneshot::channel();
        self.tx
            .send(Command::Acquire { names: names.clone(), reply })
            .map_err(|_| IpamError::Admission("limiter is not running".to_string()))?;

        let started = Instant::now();
        let outcome = tokio::select! {
            result = &mut rx => Some(result),
            _ = token.cancelled() => None,
            _ = tokio::time::sleep(self.config.max_wait()) => None,
        };
        self.metrics
            .limiter_queuing_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Some(Ok(Ok(()))) => {
                debug!("Granted tickets for IP pools {:?}", names);
                Ok(Ticket { names, tx: self.tx.clone() })
            }
            Some(Ok(Err(e))) => Err(e),
            Some(Err(_)) => Err(IpamError::Admission("limiter stopped".to_string())),
            None => {
                rx.close();
                if let Ok(Ok(())) = rx.try_recv() {
                    drop(Ticket { names: names.clone(), tx: self.tx.clone() });
                }
                if token.is_cancelled() {
                    Err(IpamError::Canceled(format!("waiting for tickets of IP pools {:?}", names)))
                } else {
                    warn!("Timed out waiting for tickets of IP pools {:?}", names);
                    Err(IpamError::Admission(format!(
                        "timed out after {:?} waiting for tickets of IP pools {:?}",
                        self.config.max_wait(),
                        names
                    )))
                }
            }
        }
    }
}

struct Waiter {
    names: Vec<String>,
    reply: Reply,
}

struct State {
    capacity: usize,
    max_queue_size: usize,
    in_use: HashMap<String, usize>,
    queue: VecDeque<Waiter>,
}

impl State {
    fn new(capacity: usize, max_queue_size: usize) -> Self {
        Self {
            capacity,
            max_queue_size,
            in_use: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn has_capacity(&self, names: &[String]) -> bool {
        names
            .iter()
            .all(|name| self.in_use.get(name).copied().unwrap_or_default() < self.capacity)
    }

    fn take(&mut self, names: &[String]) {
        for name in names {
            *self.in_use.entry(name.clone()).or_default() += 1;
        }
    }

    fn give_back(&mut self, names: &[String]) {
        for name in names {
            if let Some(count) = self.in_use.get_mut(name) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.in_use.remove(name);
                }
            }
        }
    }

    /// Rejects the newest waiter when more requests wait than allowed.
    fn shed(&mut self) {
        if self.queue.len() <= self.max_queue_size {
            return;
        }
        if let Some(waiter) = self.queue.pop_back() {
            warn!("Admission queue full, rejecting request for IP pools {:?}", waiter.names);
            let _ = waiter.reply.send(Err(IpamError::Admission(format!(
                "queue is full ({} waiting requests)",
                self.max_queue_size
            ))));
        }
    }

    /// Grants every waiter that has capacity and is not held back by an
    /// earlier waiter sharing one of its names.
    fn dispatch(&mut self) {
        let mut held: HashSet<String> = HashSet::new();
        let mut remaining = VecDeque::with_capacity(self.queue.len());

        while let Some(waiter) = self.queue.pop_front() {
            if waiter.reply.is_closed() {
                continue;
            }
            let blocked = waiter.names.iter().any(|name| held.contains(name));
            if blocked || !self.has_capacity(&waiter.names) {
                held.extend(waiter.names.iter().cloned());
                remaining.push_back(waiter);
                continue;
            }
            self.take(&waiter.names);
            if waiter.reply.send(Ok(())).is_err() {
                // Caller gave up in between
                self.give_back(&waiter.names);
            }
        }

        self.queue = remaining;
    }
}

async fn run(mut state: State, mut rx: mpsc::UnboundedReceiver<Command>, token: CancellationToken) {
    loop {
        let command = tokio::select! {
            _ = token.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        match command {
            Command::Acquire { names, reply } => {
                state.queue.push_back(Waiter { names, reply });
                state.dispatch();
                state.shed();
            }
            Command::Release { names } => {
                state.give_back(&names);
                state.dispatch();
            }
        }
    }
    info!("Admission limiter stopped with {} waiting requests", state.queue.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(capacity: usize, queue: usize, wait_seconds: u64) -> Limiter {
        let config = LimiterConfig {
            max_queue_size: queue,
            max_wait_seconds: wait_seconds,
            max_concurrent_per_pool: capacity,
        };
        Limiter::new(config, Arc::new(IpamMetrics::unregistered().unwrap()))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let token = CancellationToken::new();
        let limiter = limiter(1, 10, 5);
        let _run = limiter.start(token.clone()).unwrap();

        let ticket = limiter.acquire(&token, ["pool-a", "pool-b", "pool-a"]).await.unwrap();
        assert_eq!(ticket.names(), ["pool-a", "pool-b"]);
        drop(ticket);

        let again = limiter.acquire(&token, ["pool-a"]).await.unwrap();
        assert_eq!(again.names(), ["pool-a"]);
        token.cancel();
    }

    #[test]
    fn test_debug_shows_config() {
        let shown = format!("{:?}", limiter(2, 10, 5));
        assert!(shown.starts_with("Limiter"));
        assert!(shown.contains("max_concurrent_per_pool: 2"));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let token = CancellationToken::new();
        let limiter = limiter(1, 10, 5);
        let _run = limiter.start(token.clone()).unwrap();
        assert!(matches!(limiter.start(token.clone()), Err(IpamError::Admission(_))));
        token.cancel();
    }

    #[tokio::test]
    async fn test_capacity_blocks_until_release() {
        let token = CancellationToken::new();
        let limiter = limiter(1, 10, 5);
        let _run = limiter.start(token.clone()).unwrap();

        let first = limiter.acquire(&token, ["pool-a"]).await.unwrap();
        let waiter = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire(&token, ["pool-a"]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.names(), ["pool-a"]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_unrelated_pools_do_not_wait() {
        let token = CancellationToken::new();
        let limiter = limiter(1, 10, 5);
        let _run = limiter.start(token.clone()).unwrap();

        let _a = limiter.acquire(&token, ["pool-a"]).await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), limiter.acquire(&token, ["pool-b"]))
            .await
            .unwrap();
        assert!(b.is_ok());
        token.cancel();
    }

    #[tokio::test]
    async fn test_waiting_request_holds_back_later_ones() {
        let token = CancellationToken::new();
        let limiter = limiter(1, 10, 5);
        let _run = limiter.start(token.clone()).unwrap();

        let a = limiter.acquire(&token, ["pool-a"]).await.unwrap();
        // Waits for pool-a, and therefore keeps pool-b for itself
        let both = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire(&token, ["pool-a", "pool-b"]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let late = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire(&token, ["pool-b"]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!both.is_finished());
        assert!(!late.is_finished());

        drop(a);
        let both = both.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!late.is_finished());

        drop(both);
        assert!(late.await.unwrap().is_ok());
        token.cancel();
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_does_not_leak() {
        let token = CancellationToken::new();
        let limiter = limiter(1, 10, 5);
        let _run = limiter.start(token.clone()).unwrap();

        let held = limiter.acquire(&token, ["pool-a"]).await.unwrap();
        let call = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let call = call.clone();
            tokio::spawn(async move { limiter.acquire(&call, ["pool-a"]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        call.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(IpamError::Canceled(_))));

        drop(held);
        let next = tokio::time::timeout(Duration::from_secs(1), limiter.acquire(&token, ["pool-a"]))
            .await
            .unwrap();
        assert!(next.is_ok());
        token.cancel();
    }

    #[tokio::test]
    async fn test_wait_is_bounded() {
        let token = CancellationToken::new();
        let limiter = limiter(1, 10, 1);
        let _run = limiter.start(token.clone()).unwrap();

        let _held = limiter.acquire(&token, ["pool-a"]).await.unwrap();
        let err = limiter.acquire(&token, ["pool-a"]).await.unwrap_err();
        assert!(matches!(err, IpamError::Admission(_)));
        token.cancel();
    }

    #[tokio::test]
    async fn test_queue_is_bounded() {
        let token = CancellationToken::new();
        let limiter = limiter(1, 1, 5);
        let _run = limiter.start(token.clone()).unwrap();

        let _held = limiter.acquire(&token, ["pool-a"]).await.unwrap();
        let queued = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire(&token, ["pool-a"]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = limiter.acquire(&token, ["pool-a"]).await.unwrap_err();
        assert!(matches!(err, IpamError::Admission(_)));
        // Requests that need not wait are still served
        assert!(limiter.acquire(&token, ["pool-b"]).await.is_ok());
        queued.abort();
        token.cancel();
    }

    #[tokio::test]
    async fn test_stopped_limiter_refuses() {
        let token = CancellationToken::new();
        let limiter = limiter(1, 10, 5);
        let run = limiter.start(token.clone()).unwrap();
        token.cancel();
        run.await.unwrap();
        let err = limiter.acquire(&CancellationToken::new(), ["pool-a"]).await.unwrap_err();
        assert!(matches!(err, IpamError::Admission(_)));
    }
}
