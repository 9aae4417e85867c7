//! Message dispatch.
//!
//! Deliveries are consumed with auto-ack, so a message counts as handled the
//! moment it arrives. Each one is decoded and handed to a [`MatchHandler`] on
//! its own task; there is no ordering and no concurrency cap between them.

use crate::error::{ProvisionError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// One match request as delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRequest {
    /// Message body decoded as UTF-8; invalid sequences are replaced
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl MatchRequest {
    #[must_use]
    pub fn from_bytes(body: &[u8]) -> Self {
        Self {
            payload: String::from_utf8_lossy(body).into_owned(),
            received_at: Utc::now(),
        }
    }
}

/// Handles one decoded match request. Must not fail.
#[async_trait]
pub trait MatchHandler: Send + Sync + 'static {
    async fn handle(&self, request: MatchRequest);
}

/// Counters reported when dispatching stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub dispatched: u64,
    pub panicked: u64,
}

/// Fans deliveries out to a handler
pub struct Dispatcher<H: MatchHandler> {
    handler: Arc<H>,
    in_flight: JoinSet<()>,
    summary: DispatchSummary,
}

impl<H: MatchHandler> Dispatcher<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            in_flight: JoinSet::new(),
            summary: DispatchSummary::default(),
        }
    }

    /// Spawn handling of one message body
    pub fn dispatch(&mut self, body: &[u8]) {
        let request = MatchRequest::from_bytes(body);
        info!(payload = %request.payload, bytes = body.len(), "📨 Received match request");

        let handler = Arc::clone(&self.handler);
        self.in_flight.spawn(async move {
            handler.handle(request).await;
        });
        self.summary.dispatched += 1;
        self.reap_finished();
    }

    /// Consume `deliveries` until the stream ends or yields an error. Either
    /// way the result is an error once in-flight handlers have finished.
    pub async fn run<S, B, E>(self, deliveries: S) -> Result<DispatchSummary>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        self.run_until(deliveries, std::future::pending()).await
    }

    /// Consume `deliveries` until the stream ends, yields an error, or
    /// `shutdown` completes.
    ///
    /// Handlers still running when consumption stops are awaited before
    /// returning. Only a completed `shutdown` yields `Ok`; a stream error or
    /// an unrequested end of stream is returned after the drain.
    pub async fn run_until<S, B, E, F>(
        mut self,
        deliveries: S,
        shutdown: F,
    ) -> Result<DispatchSummary>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
        F: Future<Output = ()>,
    {
        futures::pin_mut!(deliveries);
        futures::pin_mut!(shutdown);
        let mut failure = None;

        loop {
            let delivery = tokio::select! {
                delivery = deliveries.next() => delivery,
                () = &mut shutdown => {
                    info!("Stopping consumption");
                    break;
                }
            };

            match delivery {
                Some(Ok(body)) => self.dispatch(body.as_ref()),
                Some(Err(e)) => {
                    error!(error = %e, "Delivery stream failed");
                    failure = Some(ProvisionError::DeliveryFailed(e.to_string()));
                    break;
                }
                None => {
                    warn!("Delivery stream ended without a shutdown request");
                    failure = Some(ProvisionError::ConsumerCancelled);
                    break;
                }
            }
        }

        let summary = self.drain().await;

        match failure {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    /// Wait for every in-flight handler to finish
    pub async fn drain(mut self) -> DispatchSummary {
        let pending = self.in_flight.len();
        if pending > 0 {
            info!(pending, "Waiting for in-flight matches");
        }
        while let Some(joined) = self.in_flight.join_next().await {
            self.record(joined);
        }
        info!(
            dispatched = self.summary.dispatched,
            panicked = self.summary.panicked,
            "Dispatcher stopped"
        );
        self.summary
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            self.record(joined);
        }
    }

    fn record(&mut self, joined: std::result::Result<(), tokio::task::JoinError>) {
        match joined {
            Ok(()) => debug!("Match handler finished"),
            Err(e) => {
                self.summary.panicked += 1;
                error!(error = %e, "Match handler aborted");
            }
        }
    }
}
