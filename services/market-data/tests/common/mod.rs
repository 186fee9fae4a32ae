//! Shared fakes for the engine integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use market_data::backfill::HistoricalSource;
use market_data::cache::InMemoryCache;
use market_data::clock::ManualClock;
use market_data::directory::InstrumentSource;
use market_data::error::{BackfillError, DirectoryError, FeedError};
use market_data::feed::{FeedConnection, FeedControl, FeedEvent, FeedTransport};
use types::ids::InstrumentToken;

/// 2024-03-04 09:15:00 IST. Sixty seconds past a two-minute mark, so no
/// rotation window is open at this instant.
pub const BASE_MS: i64 = 1_709_523_900_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn token(raw: u32) -> InstrumentToken {
    InstrumentToken::new(raw)
}

pub fn tick(token: u32, price: f64, qty: u32) -> Value {
    json!({"instrument_token": token, "last_price": price, "last_quantity": qty})
}

pub fn nse_row(token: u32, tsym: &str) -> Value {
    json!({
        "instrument_token": token,
        "tradingsymbol": tsym,
        "instrument_type": "EQ",
        "segment": "NSE",
        "exchange": "NSE",
    })
}

pub struct StaticInstruments {
    pub nse: Vec<Value>,
}

#[async_trait]
impl InstrumentSource for StaticInstruments {
    async fn instruments(&self, exchange: Option<&str>) -> Result<Vec<Value>, DirectoryError> {
        match exchange {
            Some("NSE") => Ok(self.nse.clone()),
            _ => Ok(Vec::new()),
        }
    }
}

/// Four NSE equities: A=1, B=2, C=3, D=4.
pub fn four_instruments() -> StaticInstruments {
    StaticInstruments {
        nse: vec![
            nse_row(1, "A"),
            nse_row(2, "B"),
            nse_row(3, "C"),
            nse_row(4, "D"),
        ],
    }
}

pub struct FixedHistory {
    pub rows: HashMap<u32, Vec<Value>>,
}

#[async_trait]
impl HistoricalSource for FixedHistory {
    async fn bars(
        &self,
        token: InstrumentToken,
        _from_ms: i64,
        _to_ms: i64,
        _interval: &str,
    ) -> Result<Vec<Value>, BackfillError> {
        self.rows
            .get(&token.get())
            .cloned()
            .ok_or_else(|| BackfillError::QueryFailed {
                token,
                reason: "no data".into(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    Subscribe(Vec<u32>),
    Unsubscribe(Vec<u32>),
    FullMode(Vec<u32>),
}

/// Records every subscription call. Subscribe and unsubscribe can be made
/// to fail; failed calls are still recorded.
#[derive(Clone, Default)]
pub struct RecordingControl {
    pub calls: Arc<Mutex<Vec<ControlCall>>>,
    reject_subscribe: Arc<AtomicBool>,
    reject_unsubscribe: Arc<AtomicBool>,
}

impl RecordingControl {
    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reject_subscribe(&self, reject: bool) {
        self.reject_subscribe.store(reject, Ordering::SeqCst);
    }

    pub fn reject_unsubscribe(&self, reject: bool) {
        self.reject_unsubscribe.store(reject, Ordering::SeqCst);
    }

    fn push(&self, call: ControlCall) {
        self.calls.lock().unwrap().push(call);
    }
}

fn raw(tokens: &[InstrumentToken]) -> Vec<u32> {
    tokens.iter().map(|t| t.get()).collect()
}

#[async_trait]
impl FeedControl for RecordingControl {
    async fn subscribe(&self, tokens: &[InstrumentToken]) -> Result<(), FeedError> {
        self.push(ControlCall::Subscribe(raw(tokens)));
        if self.reject_subscribe.load(Ordering::SeqCst) {
            return Err(FeedError::Transient("subscribe rejected".into()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, tokens: &[InstrumentToken]) -> Result<(), FeedError> {
        self.push(ControlCall::Unsubscribe(raw(tokens)));
        if self.reject_unsubscribe.load(Ordering::SeqCst) {
            return Err(FeedError::Transient("unsubscribe rejected".into()));
        }
        Ok(())
    }

    async fn set_full_mode(&self, tokens: &[InstrumentToken]) -> Result<(), FeedError> {
        self.push(ControlCall::FullMode(raw(tokens)));
        Ok(())
    }
}

/// Hands out pre-built sessions in order; the test keeps each session's
/// event sender and drives it. Parks forever once sessions run out.
pub struct ChannelTransport {
    sessions: VecDeque<FeedConnection>,
    pub connects: Arc<Mutex<u32>>,
}

impl ChannelTransport {
    pub fn new(
        sessions: usize,
        control: &RecordingControl,
    ) -> (Self, Vec<mpsc::Sender<FeedEvent>>) {
        let mut senders = Vec::new();
        let mut queue = VecDeque::new();
        for _ in 0..sessions {
            let (tx, rx) = mpsc::channel(64);
            senders.push(tx);
            queue.push_back(FeedConnection {
                control: Box::new(control.clone()),
                events: rx,
            });
        }
        (
            Self {
                sessions: queue,
                connects: Arc::new(Mutex::new(0)),
            },
            senders,
        )
    }
}

#[async_trait]
impl FeedTransport for ChannelTransport {
    async fn connect(&mut self) -> Result<FeedConnection, FeedError> {
        *self.connects.lock().unwrap() += 1;
        match self.sessions.pop_front() {
            Some(session) => Ok(session),
            None => std::future::pending().await,
        }
    }
}

pub fn cache_with_clock() -> (ManualClock, Arc<InMemoryCache>) {
    let clock = ManualClock::new(BASE_MS);
    let cache = Arc::new(InMemoryCache::new(Arc::new(clock.clone())));
    (clock, cache)
}

/// Poll `check` while letting other tasks run, failing after a bounded
/// number of attempts.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
