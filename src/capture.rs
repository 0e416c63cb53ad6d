use std::sync::Arc;

use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinHandle, JoinSet},
};
use tracing::Instrument as _;

use crate::{
    correlator::Correlator,
    logging,
    event::{BodyFetcher, NetworkEvent, ResponseBody},
    storage::{CapturedExchange, ExchangeStore},
};

#[derive(Debug)]
pub enum CaptureError {
    AlreadyActive(String),
    Store(String),
    Internal(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyActive(session) => {
                write!(f, "capture is already running for session `{session}`")
            }
            Self::Store(message) | Self::Internal(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Counters collected over the lifetime of one capture session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub events_processed: usize,
    pub records_written: usize,
    pub write_failures: usize,
    pub bodies_retrieved: usize,
    pub bodies_missing: usize,
}

enum SessionCommand {
    Event(NetworkEvent),
    Stop(oneshot::Sender<Result<CaptureReport, CaptureError>>),
}

/// One running capture: a single consumer applying events in delivery order.
pub struct CaptureSession {
    session_id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    join: JoinHandle<()>,
}

impl CaptureSession {
    /// Spawns the session's consumer task. Must be called within a tokio runtime.
    pub fn spawn(
        session_id: impl Into<String>,
        store: Arc<dyn ExchangeStore>,
        fetcher: Arc<dyn BodyFetcher>,
    ) -> Self {
        let session_id = session_id.into();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(
            run_session(
                Correlator::new(session_id.clone()),
                store,
                fetcher,
                command_rx,
            )
            .instrument(logging::capture_span(&session_id)),
        );
        Self {
            session_id,
            commands,
            join,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queues an event without waiting for it to be applied.
    pub fn handle_event(&self, event: NetworkEvent) {
        if self.commands.send(SessionCommand::Event(event)).is_err() {
            tracing::debug!(session = %self.session_id, "capture session is no longer running");
        }
    }

    /// Waits for queued events, outstanding body fetches and writes, then
    /// discards the in-memory state. Persisted records are left in place.
    pub async fn stop(self) -> Result<CaptureReport, CaptureError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Stop(reply_tx))
            .map_err(|_| {
                CaptureError::Internal(format!(
                    "capture session `{}` stopped unexpectedly",
                    self.session_id
                ))
            })?;
        let result = reply_rx.await.map_err(|_| {
            CaptureError::Internal(format!(
                "capture session `{}` exited before reporting",
                self.session_id
            ))
        })?;
        self.join.await.map_err(|err| {
            CaptureError::Internal(format!("join capture session task failed: {err}"))
        })?;
        result
    }
}

type BodyOutcome = (String, anyhow::Result<ResponseBody>);

async fn run_session(
    mut correlator: Correlator,
    store: Arc<dyn ExchangeStore>,
    fetcher: Arc<dyn BodyFetcher>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let session_id = correlator.session_id().to_owned();

    // Events queue in `commands` while the earlier records load.
    let load_error = match store.get_all_by_session(&session_id).await {
        Ok(records) => {
            let resumed = correlator.seed(records);
            tracing::info!(resumed, "capture session started");
            None
        }
        Err(err) => {
            tracing::warn!("failed to load earlier records, starting empty: {err:#}");
            Some(format!("load earlier records of session `{session_id}`: {err:#}"))
        }
    };

    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(run_writer(store, write_rx).in_current_span());
    let mut bodies: JoinSet<BodyOutcome> = JoinSet::new();
    let mut report = CaptureReport::default();

    let reply = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Event(event)) => {
                    report.events_processed += 1;
                    let transition = correlator.observe(&event);
                    tracing::debug!(
                        exchange = %event.exchange_id(),
                        kind = event.kind(),
                        timestamp = event.timestamp(),
                        persist = transition.persist,
                        "applied network event"
                    );
                    if transition.persist {
                        queue_write(&write_tx, transition.record);
                    }
                    if transition.fetch_body {
                        let fetcher = fetcher.clone();
                        let exchange_id = event.exchange_id().to_owned();
                        bodies.spawn(
                            async move {
                                let outcome = fetcher.fetch_body(&exchange_id).await;
                                (exchange_id, outcome)
                            }
                            .in_current_span(),
                        );
                    }
                }
                Some(SessionCommand::Stop(reply)) => break Some(reply),
                None => break None,
            },
            Some(joined) = bodies.join_next(), if !bodies.is_empty() => {
                apply_body_outcome(&mut correlator, &write_tx, &mut report, joined);
            }
        }
    };

    while let Some(joined) = bodies.join_next().await {
        apply_body_outcome(&mut correlator, &write_tx, &mut report, joined);
    }
    drop(write_tx);

    let result = match writer.await {
        Ok(outcome) => {
            report.records_written = outcome.written;
            report.write_failures = outcome.failures;
            match load_error.or(outcome.first_error) {
                Some(message) => Err(CaptureError::Store(message)),
                None => Ok(report),
            }
        }
        Err(err) => Err(CaptureError::Internal(format!(
            "join capture writer task failed: {err}"
        ))),
    };

    tracing::info!(tracked = correlator.len(), "capture session stopped");

    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

fn queue_write(write_tx: &mpsc::UnboundedSender<CapturedExchange>, record: CapturedExchange) {
    if write_tx.send(record).is_err() {
        tracing::warn!("capture writer stopped before all records were queued");
    }
}

fn apply_body_outcome(
    correlator: &mut Correlator,
    write_tx: &mpsc::UnboundedSender<CapturedExchange>,
    report: &mut CaptureReport,
    joined: Result<BodyOutcome, tokio::task::JoinError>,
) {
    let (exchange_id, outcome) = match joined {
        Ok(joined) => joined,
        Err(err) => {
            report.bodies_missing += 1;
            tracing::warn!("body retrieval task failed: {err}");
            return;
        }
    };

    match outcome {
        Ok(body) => match correlator.attach_body(&exchange_id, &body) {
            Some(record) => {
                report.bodies_retrieved += 1;
                queue_write(write_tx, record);
            }
            None => {
                report.bodies_missing += 1;
                tracing::debug!(exchange = %exchange_id, "dropping body for untracked exchange");
            }
        },
        Err(err) => {
            report.bodies_missing += 1;
            tracing::debug!(
                exchange = %exchange_id,
                "response body unavailable, keeping record without it: {err:#}"
            );
        }
    }
}

#[derive(Debug, Default)]
struct WriterOutcome {
    written: usize,
    failures: usize,
    first_error: Option<String>,
}

async fn run_writer(
    store: Arc<dyn ExchangeStore>,
    mut records: mpsc::UnboundedReceiver<CapturedExchange>,
) -> WriterOutcome {
    let mut outcome = WriterOutcome::default();
    while let Some(record) = records.recv().await {
        match store.upsert(&record).await {
            Ok(()) => outcome.written += 1,
            Err(err) => {
                outcome.failures += 1;
                tracing::warn!(
                    session = %record.session_id,
                    exchange = %record.exchange_id,
                    "failed to persist exchange: {err:#}"
                );
                if outcome.first_error.is_none() {
                    outcome.first_error = Some(format!(
                        "persist exchange `{}` of session `{}`: {err:#}",
                        record.exchange_id, record.session_id
                    ));
                }
            }
        }
    }
    outcome
}

/// Owns the single active capture and routes events to it.
pub struct CaptureManager {
    store: Arc<dyn ExchangeStore>,
    active: Option<CaptureSession>,
}

impl CaptureManager {
    pub fn new(store: Arc<dyn ExchangeStore>) -> Self {
        Self {
            store,
            active: None,
        }
    }

    pub fn active_session(&self) -> Option<&str> {
        self.active.as_ref().map(CaptureSession::session_id)
    }

    pub fn is_capturing(&self) -> bool {
        self.active.is_some()
    }

    /// Starts capturing `session_id`. Starting the session that is already
    /// active is a no-op; records written earlier for it are kept.
    pub fn start(
        &mut self,
        session_id: &str,
        fetcher: Arc<dyn BodyFetcher>,
    ) -> Result<(), CaptureError> {
        if let Some(active) = self.active.as_ref() {
            if active.session_id() == session_id {
                tracing::debug!(session = %session_id, "capture already running");
                return Ok(());
            }
            return Err(CaptureError::AlreadyActive(active.session_id().to_owned()));
        }

        self.active = Some(CaptureSession::spawn(
            session_id,
            self.store.clone(),
            fetcher,
        ));
        Ok(())
    }

    /// Routes an event to the active session; a no-op for any other session.
    pub fn handle_event(&self, session_id: &str, event: NetworkEvent) {
        match self.active.as_ref() {
            Some(active) if active.session_id() == session_id => active.handle_event(event),
            _ => {}
        }
    }

    /// Like [`Self::handle_event`] for a raw CDP method and params. Methods
    /// outside the network lifecycle and malformed params are logged and
    /// dropped.
    pub fn handle_cdp_event(&self, session_id: &str, method: &str, params: Value) {
        if self.active_session() != Some(session_id) {
            return;
        }
        match NetworkEvent::from_cdp(method, params) {
            Ok(Some(event)) => self.handle_event(session_id, event),
            Ok(None) => tracing::trace!(method, "ignoring non-network event"),
            Err(err) => tracing::warn!(method, "dropping malformed network event: {err:#}"),
        }
    }

    /// Stops the active capture. `Ok(None)` when nothing was running.
    pub async fn stop(&mut self) -> Result<Option<CaptureReport>, CaptureError> {
        match self.active.take() {
            Some(active) => active.stop().await.map(Some),
            None => Ok(None),
        }
    }
}
