//! Session log broadcaster.
//!
//! Every line of tap & target output produced during a session flows through this controller.
//! The controller assigns each line its session sequence number, retains it in the session's
//! history, and fans it out to every subscriber. Each subscriber is fed through its own
//! unbounded queue, so a slow or disconnected subscriber never holds up publishers or other
//! subscribers.
//!
//! Subscribers may ask for a replay starting at a given sequence number. As subscription
//! requests are handled by the same task which handles publication, the replayed history and
//! the live lines which follow it meet without gaps or duplicates.


use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::models::descriptor::PluginKind;
use crate::models::log::LogLine;

const METRIC_LOG_LINES: &str = "knot_log_lines_total";

/// A stream of log lines delivered to a single subscriber.
pub type LogSubscription = UnboundedReceiverStream<LogLine>;

/// A message bound for the log controller.
pub enum LogCtlMsg {
    Publish { source: PluginKind, text: String },
    Subscribe { from: Option<u64>, tx: oneshot::Sender<LogSubscription> },
    History { tx: oneshot::Sender<Vec<LogLine>> },
}

/// A handle for publishing to and subscribing to a session's log.
#[derive(Clone)]
pub struct LogBroadcaster {
    tx: mpsc::UnboundedSender<LogCtlMsg>,
}

impl LogBroadcaster {
    /// Publish a line of output produced by the given kind of process.
    ///
    /// Publication never blocks; if the controller has already shut down the line is dropped.
    pub fn publish(&self, source: PluginKind, text: String) {
        let _res = self.tx.send(LogCtlMsg::Publish { source, text });
    }

    /// Subscribe to the session's log.
    ///
    /// With `from` set, every retained line with a sequence number greater than or equal to
    /// `from` is delivered first, followed by all subsequently published lines. Without it, only
    /// lines published after this call are delivered.
    pub async fn subscribe(&self, from: Option<u64>) -> Result<LogSubscription> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(LogCtlMsg::Subscribe { from, tx })
            .map_err(|_| anyhow::anyhow!("error communicating with log controller"))?;
        rx.await.context("error awaiting response from log controller")
    }

    /// A snapshot of the session's log history.
    pub async fn history(&self) -> Result<Vec<LogLine>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(LogCtlMsg::History { tx })
            .map_err(|_| anyhow::anyhow!("error communicating with log controller"))?;
        rx.await.context("error awaiting response from log controller")
    }
}

/// A controller owning the log of a single session.
pub struct LogCtl {
    /// The ID of the session to which this log belongs.
    session_id: Uuid,
    /// A channel of inbound requests.
    requests_rx: UnboundedReceiverStream<LogCtlMsg>,
    /// All lines published during the session.
    history: Vec<LogLine>,
    /// The delivery queues of all active subscribers, along with the first sequence each wants.
    subscribers: Vec<(u64, mpsc::UnboundedSender<LogLine>)>,
}

impl LogCtl {
    /// Create a new instance.
    ///
    /// The controller shuts down once every `LogBroadcaster` handle has been dropped.
    pub fn new(session_id: Uuid) -> (Self, LogBroadcaster) {
        let (tx, rx) = mpsc::unbounded_channel();
        metrics::describe_counter!(METRIC_LOG_LINES, metrics::Unit::Count, "the number of tap & target output lines published");
        (
            Self {
                session_id,
                requests_rx: UnboundedReceiverStream::new(rx),
                history: Vec::new(),
                subscribers: Vec::new(),
            },
            LogBroadcaster { tx },
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!(session = %self.session_id, "log controller has started");
        while let Some(msg) = self.requests_rx.next().await {
            match msg {
                LogCtlMsg::Publish { source, text } => self.handle_publish(source, text),
                LogCtlMsg::Subscribe { from, tx } => self.handle_subscribe(from, tx),
                LogCtlMsg::History { tx } => {
                    let _res = tx.send(self.history.clone());
                }
            }
        }
        tracing::debug!(session = %self.session_id, lines = self.history.len(), "log controller has shutdown");
    }

    /// Assign the next sequence number to the given line, record it and deliver it.
    fn handle_publish(&mut self, source: PluginKind, text: String) {
        let line = LogLine {
            source,
            sequence: self.history.len() as u64,
            timestamp: (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
            text,
        };
        tracing::trace!(session = %self.session_id, sequence = line.sequence, %source, text = %line.text);
        metrics::counter!(METRIC_LOG_LINES, "source" => source.as_str()).increment(1);
        self.subscribers.retain(|(from, sub)| line.sequence < *from || sub.send(line.clone()).is_ok());
        self.history.push(line);
    }

    /// Register a new subscriber, replaying history as requested.
    fn handle_subscribe(&mut self, from: Option<u64>, tx: oneshot::Sender<LogSubscription>) {
        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        let next_sequence = self.history.len() as u64;
        let from = match from {
            Some(from) => {
                let start = usize::try_from(from).unwrap_or(usize::MAX).min(self.history.len());
                for line in self.history[start..].iter() {
                    let _res = sub_tx.send(line.clone());
                }
                from.max(next_sequence)
            }
            None => next_sequence,
        };
        if tx.send(UnboundedReceiverStream::new(sub_rx)).is_ok() {
            self.subscribers.push((from, sub_tx));
        }
    }
}
