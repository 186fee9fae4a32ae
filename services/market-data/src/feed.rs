//! Feed connection supervisor
//!
//! Owns the connection to the broker tick stream and turns its callbacks
//! into one ordered stream of [`FeedEvent`]s handled by a single consumer.
//!
//! State machine:
//!
//! ```text
//!  Disconnected ──► Connecting ──► Connected
//!       ▲               │              │
//!       │  transient    │              │ close / transient error
//!       └── (sleep) ◄───┴──────────────┘
//!                       │ auth expired
//!                       ▼
//!                     Fatal
//! ```
//!
//! Transient failures sleep a fixed delay and reconnect. An expired session
//! is fatal: the loop stops and the caller must re-authenticate. A stop
//! signal is honoured between events, never in the middle of a batch.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use types::ids::InstrumentToken;

use crate::error::FeedError;

/// Events delivered by a live connection, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// The session is established and ready for subscriptions.
    Connected,
    /// A batch of raw ticks.
    Ticks(Vec<Value>),
    /// The remote side closed the connection.
    Closed { code: u16, reason: String },
    Error(FeedError),
}

/// Subscription control for an established connection.
#[async_trait]
pub trait FeedControl: Send + Sync {
    async fn subscribe(&self, tokens: &[InstrumentToken]) -> Result<(), FeedError>;

    async fn unsubscribe(&self, tokens: &[InstrumentToken]) -> Result<(), FeedError>;

    /// Request full-depth tick mode for already subscribed tokens.
    async fn set_full_mode(&self, tokens: &[InstrumentToken]) -> Result<(), FeedError>;
}

/// An established connection: its control handle and event stream.
pub struct FeedConnection {
    pub control: Box<dyn FeedControl>,
    pub events: mpsc::Receiver<FeedEvent>,
}

/// Opens connections to the tick source.
#[async_trait]
pub trait FeedTransport: Send {
    async fn connect(&mut self) -> Result<FeedConnection, FeedError>;
}

/// Consumer of feed events. Called sequentially from the supervisor task.
#[async_trait]
pub trait FeedHandler: Send {
    async fn on_connected(&mut self, control: &dyn FeedControl);

    async fn on_ticks(&mut self, ticks: Vec<Value>, control: &dyn FeedControl);

    async fn on_disconnected(&mut self, reason: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Fatal,
}

/// Timestamp (epoch ms) of the last received tick batch, shared between the
/// tick path and liveness checks.
#[derive(Debug, Clone, Default)]
pub struct Heartbeat {
    last_ms: Arc<AtomicI64>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self, now_ms: i64) {
        self.last_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Last beat, `None` before the first.
    pub fn last_ms(&self) -> Option<i64> {
        match self.last_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn is_live(&self, now_ms: i64, max_age_ms: i64) -> bool {
        is_fresh(self.last_ms(), now_ms, max_age_ms)
    }
}

/// Consumer-side liveness rule: a heartbeat is fresh while its age is below
/// `max_age_ms`.
pub fn is_fresh(heartbeat_ms: Option<i64>, now_ms: i64, max_age_ms: i64) -> bool {
    match heartbeat_ms {
        Some(ms) if ms > 0 => now_ms - ms < max_age_ms,
        _ => false,
    }
}

/// Resolves once a stop is requested or the stop handle is dropped.
async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

enum SessionEnd {
    Stopped,
    Lost(FeedError),
}

pub struct FeedSupervisor<T: FeedTransport> {
    transport: T,
    retry_delay: Duration,
    state: watch::Sender<FeedState>,
    reconnects: u64,
}

impl<T: FeedTransport> FeedSupervisor<T> {
    pub fn new(transport: T, retry_delay: Duration) -> Self {
        let (state, _) = watch::channel(FeedState::Disconnected);
        Self {
            transport,
            retry_delay,
            state,
            reconnects: 0,
        }
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    /// Number of reconnect attempts after a lost or failed connection.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    fn set_state(&self, state: FeedState) {
        self.state.send_replace(state);
    }

    /// Run until stopped (`Ok`) or the session expires (`Err`).
    pub async fn run<H: FeedHandler>(
        &mut self,
        handler: &mut H,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), FeedError> {
        loop {
            if *stop.borrow() {
                break;
            }
            self.set_state(FeedState::Connecting);

            let connected = tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop) => break,
                result = self.transport.connect() => result,
            };

            let failure = match connected {
                Ok(connection) => match self.session(connection, handler, &mut stop).await {
                    SessionEnd::Stopped => break,
                    SessionEnd::Lost(err) => {
                        handler.on_disconnected(&err.to_string()).await;
                        err
                    }
                },
                Err(err) => err,
            };

            if failure.is_fatal() {
                self.set_state(FeedState::Fatal);
                error!(error = %failure, "Feed stopped, re-authentication required");
                return Err(failure);
            }

            self.set_state(FeedState::Disconnected);
            self.reconnects += 1;
            warn!(
                error = %failure,
                retry_ms = self.retry_delay.as_millis() as u64,
                attempt = self.reconnects,
                "Feed lost, retrying"
            );
            tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop) => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        self.set_state(FeedState::Disconnected);
        info!("Feed supervisor stopped");
        Ok(())
    }

    async fn session<H: FeedHandler>(
        &self,
        connection: FeedConnection,
        handler: &mut H,
        stop: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let FeedConnection {
            control,
            mut events,
        } = connection;

        loop {
            let event = tokio::select! {
                biased;
                _ = wait_for_stop(stop) => return SessionEnd::Stopped,
                event = events.recv() => event,
            };

            match event {
                Some(FeedEvent::Connected) => {
                    self.set_state(FeedState::Connected);
                    info!("Feed connected");
                    handler.on_connected(control.as_ref()).await;
                }
                Some(FeedEvent::Ticks(ticks)) => {
                    handler.on_ticks(ticks, control.as_ref()).await;
                }
                Some(FeedEvent::Closed { code, reason }) => {
                    return SessionEnd::Lost(FeedError::Transient(format!(
                        "closed ({}): {}",
                        code, reason
                    )));
                }
                Some(FeedEvent::Error(err)) => return SessionEnd::Lost(err),
                None => {
                    return SessionEnd::Lost(FeedError::Transient("event stream ended".to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct NoopControl;

    #[async_trait]
    impl FeedControl for NoopControl {
        async fn subscribe(&self, _: &[InstrumentToken]) -> Result<(), FeedError> {
            Ok(())
        }
        async fn unsubscribe(&self, _: &[InstrumentToken]) -> Result<(), FeedError> {
            Ok(())
        }
        async fn set_full_mode(&self, _: &[InstrumentToken]) -> Result<(), FeedError> {
            Ok(())
        }
    }

    /// Each connect pops one scripted outcome; an empty script parks forever.
    struct ScriptedTransport {
        script: VecDeque<Result<Vec<FeedEvent>, FeedError>>,
        connects: Arc<Mutex<Vec<tokio::time::Instant>>>,
    }

    #[async_trait]
    impl FeedTransport for ScriptedTransport {
        async fn connect(&mut self) -> Result<FeedConnection, FeedError> {
            if let Ok(mut c) = self.connects.lock() {
                c.push(tokio::time::Instant::now());
            }
            match self.script.pop_front() {
                Some(Ok(events)) => {
                    let (tx, rx) = mpsc::channel(16);
                    for ev in events {
                        let _ = tx.send(ev).await;
                    }
                    // keep the stream open so the session waits for stop
                    tokio::spawn(async move {
                        tx.closed().await;
                    });
                    Ok(FeedConnection {
                        control: Box::new(NoopControl),
                        events: rx,
                    })
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        connected: usize,
        batches: usize,
        disconnects: Vec<String>,
    }

    #[async_trait]
    impl FeedHandler for Recorder {
        async fn on_connected(&mut self, _: &dyn FeedControl) {
            self.connected += 1;
        }
        async fn on_ticks(&mut self, _: Vec<Value>, _: &dyn FeedControl) {
            self.batches += 1;
        }
        async fn on_disconnected(&mut self, reason: &str) {
            self.disconnects.push(reason.to_string());
        }
    }

    fn transport(script: Vec<Result<Vec<FeedEvent>, FeedError>>) -> (ScriptedTransport, Arc<Mutex<Vec<tokio::time::Instant>>>) {
        let connects = Arc::new(Mutex::new(Vec::new()));
        (
            ScriptedTransport {
                script: script.into(),
                connects: connects.clone(),
            },
            connects,
        )
    }

    #[test]
    fn test_heartbeat_freshness() {
        let hb = Heartbeat::new();
        assert!(!hb.is_live(1_000, 15_000));
        hb.beat(1_000);
        assert!(hb.is_live(15_999, 15_000));
        assert!(!hb.is_live(16_000, 15_000));
        assert!(!is_fresh(Some(0), 1, 15_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_expiry_is_fatal() {
        let (t, _) = transport(vec![
            Ok(vec![
                FeedEvent::Connected,
                FeedEvent::Ticks(vec![]),
                FeedEvent::Closed {
                    code: 1006,
                    reason: "abnormal".into(),
                },
            ]),
            Err(FeedError::AuthExpired("token expired".into())),
        ]);
        let mut sup = FeedSupervisor::new(t, Duration::from_secs(2));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut rec = Recorder::default();

        let result = sup.run(&mut rec, stop_rx).await;

        assert_eq!(result, Err(FeedError::AuthExpired("token expired".into())));
        assert_eq!(sup.state(), FeedState::Fatal);
        assert_eq!(rec.batches, 1);
        assert_eq!(rec.disconnects, vec!["transient feed failure: closed (1006): abnormal"]);
        assert_eq!(sup.reconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retries_after_fixed_delay() {
        let (t, connects) = transport(vec![
            Err(FeedError::Transient("connection refused".into())),
            Err(FeedError::Transient("connection refused".into())),
            Ok(vec![FeedEvent::Connected, FeedEvent::Ticks(vec![])]),
        ]);
        let mut sup = FeedSupervisor::new(t, Duration::from_secs(2));
        let mut states = sup.subscribe_state();
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut rec = Recorder::default();
            let result = sup.run(&mut rec, stop_rx).await;
            (result, rec, sup.reconnects())
        });

        while *states.borrow_and_update() != FeedState::Connected {
            states.changed().await.unwrap();
        }
        stop_tx.send(true).unwrap();
        let (result, rec, reconnects) = task.await.unwrap();

        assert!(result.is_ok());
        assert_eq!(reconnects, 2);
        assert_eq!(rec.connected, 1);
        assert_eq!(rec.batches, 1);
        let connects = connects.lock().unwrap();
        assert_eq!(connects.len(), 3);
        assert_eq!(connects[1] - connects[0], Duration::from_secs(2));
        assert_eq!(connects[2] - connects[1], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_pending_connect() {
        let (t, _) = transport(vec![]);
        let mut sup = FeedSupervisor::new(t, Duration::from_secs(2));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut rec = Recorder::default();
            let result = sup.run(&mut rec, stop_rx).await;
            (result, sup.state())
        });
        tokio::time::sleep(Duration::from_secs(30)).await;
        stop_tx.send(true).unwrap();
        let (result, state) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state, FeedState::Disconnected);
    }
}
