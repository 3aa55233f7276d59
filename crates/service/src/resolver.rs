//! Ties the context store, the broker and the tracer together.
//!
//! The HTTP span that creates a trade is the context snapshot stored with it.
//! Later work on the trade (settlement, status reads, failure handling) runs
//! in whatever trace it was triggered from and links back to that snapshot,
//! so the two traces stay navigable in both directions.

use std::collections::BTreeMap;
use std::sync::Arc;

use tradetrace_core::error::{Result, TradeTraceError};
use tradetrace_core::model::message::{MessageType, TradeMessage};
use tradetrace_core::model::trade::{NewTrade, SettleOutcome, SettlementView, Trade};
use tradetrace_core::{
    Context, SpanBuilder, SpanKind, SpanLink, SpanStatus, TraceContext, Tracer, time,
};
use tradetrace_store::{ContextStore, StoredTrade, TradeRepository};

use crate::broker::{Broker, Delivery};

pub const LINK_REASON_KEY: &str = "link.reason";
pub const LINK_REASON_TRADE_CREATED: &str = "trade.created";

/// What the consumer should do with a delivery after handling it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Complete,
    /// Return the message for redelivery.
    Abandon(String),
    DeadLetter(String),
}

#[derive(Clone)]
pub struct CausalityResolver<R> {
    store: ContextStore<R>,
    tracer: Tracer,
    broker: Broker,
    queue: Arc<str>,
}

impl<R: TradeRepository> CausalityResolver<R> {
    pub fn new(
        store: ContextStore<R>,
        tracer: Tracer,
        broker: Broker,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tracer,
            broker,
            queue: Arc::from(queue.into()),
        }
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Persists a new trade under the active span of `cx` and announces it on
    /// the queue.
    pub async fn create_trade(&self, cx: &Context, request: NewTrade) -> Result<Trade> {
        request.validate()?;
        let trade = self
            .store
            .write_with_context(request.into_pending(), cx.span_context())
            .await?;

        let mut span = self.tracer.start(
            cx,
            SpanBuilder::new(format!("publish {}", self.queue))
                .with_kind(SpanKind::Producer)
                .with_attribute("messaging.system", "emulated")
                .with_attribute("messaging.destination.name", &*self.queue)
                .with_attribute("trade.id", trade.trade_id.as_str()),
        );
        let sent = TradeMessage::new(&trade.trade_id, MessageType::TradeSubmitted)
            .with_property("instrument", &trade.instrument)
            .with_property("counterparty", &trade.counterparty)
            .to_bytes()
            .and_then(|body| {
                self.broker
                    .send(&span.context(), &self.queue, body, BTreeMap::new())
            });
        let message_id = match sent {
            Ok(id) => id,
            Err(err) => {
                span.record_error(&err);
                span.end();
                self.abandon_unpublished(&trade.trade_id, &err).await;
                return Err(err);
            }
        };
        span.set_attribute("messaging.message.id", message_id.as_str());
        span.set_status(SpanStatus::Ok);
        span.end();

        let trade = self
            .store
            .mark_submitted(&trade.trade_id)
            .await?
            .unwrap_or(trade);

        tracing::info!(
            trade_id = %trade.trade_id,
            message_id = %message_id,
            trace_parent = trade.trace_parent.as_deref().unwrap_or("-"),
            "trade created"
        );
        Ok(trade)
    }

    pub async fn get_trade(&self, trade_id: &str) -> Result<Option<Trade>> {
        Ok(self
            .store
            .read_with_context(trade_id)
            .await?
            .map(|stored| stored.trade))
    }

    pub async fn list_trades(&self) -> Result<Vec<Trade>> {
        self.store.list().await
    }

    /// Settles a trade. The settlement span is a child of `cx` and links to the
    /// context stored when the trade was created, if there is a usable one.
    pub async fn settle_trade(&self, cx: &Context, trade_id: &str) -> Result<SettleOutcome> {
        let stored = self.read(trade_id).await?;
        let mut span = self.tracer.start(
            cx,
            linked_builder("settle_trade", &stored).with_kind(SpanKind::Consumer),
        );

        let outcome = match self.store.settle(trade_id, time::now()).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                let err = not_found(trade_id);
                span.record_error(&err);
                return Err(err);
            }
            Err(err) => {
                span.record_error(&err);
                return Err(err);
            }
        };

        span.set_attribute("settlement.outcome", outcome.label());
        span.set_status(SpanStatus::Ok);
        tracing::info!(
            trade_id,
            outcome = outcome.label(),
            linked = stored.context.is_some(),
            "settlement processed"
        );
        Ok(outcome)
    }

    /// `Ok(None)` when the trade does not exist.
    pub async fn settlement_status(
        &self,
        cx: &Context,
        trade_id: &str,
    ) -> Result<Option<SettlementView>> {
        let Some(stored) = self.store.read_with_context(trade_id).await? else {
            return Ok(None);
        };
        let mut span = self
            .tracer
            .start(cx, linked_builder("get_settlement_status", &stored));
        let view = settlement_view(&stored);
        span.set_attribute("trade.status", view.status.as_str());
        span.set_status(SpanStatus::Ok);
        Ok(Some(view))
    }

    /// Marks an open trade as failed; settled trades stay settled.
    pub async fn fail_trade(&self, cx: &Context, trade_id: &str, reason: &str) -> Result<Trade> {
        let stored = self.read(trade_id).await?;
        let mut span = self.tracer.start(
            cx,
            linked_builder("fail_trade", &stored)
                .with_kind(SpanKind::Consumer)
                .with_attribute("trade.failure_reason", reason),
        );

        let trade = match self.store.mark_failed(trade_id).await {
            Ok(Some(trade)) => trade,
            Ok(None) => {
                let err = not_found(trade_id);
                span.record_error(&err);
                return Err(err);
            }
            Err(err) => {
                span.record_error(&err);
                return Err(err);
            }
        };
        span.set_attribute("trade.status", trade.status.as_str());
        span.set_status(SpanStatus::Ok);
        tracing::warn!(trade_id, reason, status = %trade.status, "trade failure recorded");
        Ok(trade)
    }

    /// Handles one broker delivery and settles it according to the outcome.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Disposition {
        let disposition = self.process(delivery.context(), delivery.body()).await;
        tracing::debug!(
            message_id = delivery.message_id(),
            delivery_count = delivery.delivery_count(),
            disposition = ?disposition,
            "delivery handled"
        );
        match &disposition {
            Disposition::Complete => delivery.complete(),
            Disposition::Abandon(_) => delivery.abandon(),
            Disposition::DeadLetter(reason) => delivery.dead_letter(reason.clone()),
        }
        disposition
    }

    /// Decides the disposition of a message body received under `cx`.
    pub async fn process(&self, cx: &Context, body: &[u8]) -> Disposition {
        let message = match TradeMessage::from_bytes(body) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable message");
                return Disposition::DeadLetter(err.to_string());
            }
        };
        let Ok(kind) = message.kind() else {
            tracing::warn!(
                trade_id = %message.trade_id,
                message_type = %message.message_type,
                "unknown message type; acknowledging without action"
            );
            return Disposition::Complete;
        };

        let result = match kind {
            MessageType::TradeSubmitted => {
                self.settle_trade(cx, &message.trade_id).await.map(|_| ())
            }
            MessageType::TradeSettled => {
                tracing::info!(trade_id = %message.trade_id, "settlement confirmation received");
                Ok(())
            }
            MessageType::TradeFailed => {
                let reason = message
                    .properties
                    .get("reason")
                    .map(String::as_str)
                    .unwrap_or("unspecified");
                self.fail_trade(cx, &message.trade_id, reason).await.map(|_| ())
            }
        };

        match result {
            Ok(()) => Disposition::Complete,
            Err(err @ TradeTraceError::NotFound(_)) => {
                tracing::warn!(
                    trade_id = %message.trade_id,
                    error = %err,
                    "message refers to unknown trade"
                );
                Disposition::DeadLetter(err.to_string())
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    trade_id = %message.trade_id,
                    error = %err,
                    "transient failure; message will be retried"
                );
                Disposition::Abandon(err.to_string())
            }
            Err(err) => {
                tracing::error!(
                    trade_id = %message.trade_id,
                    error = %err,
                    "message handling failed"
                );
                Disposition::DeadLetter(err.to_string())
            }
        }
    }

    /// A trade that was stored but never announced cannot settle; it is marked
    /// failed so it does not sit in `Pending` forever.
    async fn abandon_unpublished(&self, trade_id: &str, err: &TradeTraceError) {
        match self.store.mark_failed(trade_id).await {
            Ok(_) => tracing::error!(
                trade_id,
                error = %err,
                "trade persisted but not published; marked failed and will never settle"
            ),
            Err(mark_err) => tracing::error!(
                trade_id,
                error = %err,
                mark_error = %mark_err,
                "trade persisted but not published; left pending and will never settle"
            ),
        }
    }

    async fn read(&self, trade_id: &str) -> Result<StoredTrade> {
        self.store
            .read_with_context(trade_id)
            .await?
            .ok_or_else(|| not_found(trade_id))
    }
}

fn not_found(trade_id: &str) -> TradeTraceError {
    TradeTraceError::NotFound(format!("trade {trade_id}"))
}

fn linked_builder(name: &str, stored: &StoredTrade) -> SpanBuilder {
    let builder = SpanBuilder::new(name)
        .with_attribute("trade.id", stored.trade.trade_id.as_str())
        .with_attribute("trade.instrument", stored.trade.instrument.as_str())
        .with_attribute("settlement.linked", stored.context.is_some());
    match &stored.context {
        Some(created) => builder.with_link(creation_link(created)),
        None => builder,
    }
}

fn creation_link(created: &TraceContext) -> SpanLink {
    SpanLink::new(created.clone()).with_attribute(LINK_REASON_KEY, LINK_REASON_TRADE_CREATED)
}

pub fn settlement_view(stored: &StoredTrade) -> SettlementView {
    let trade = &stored.trade;
    SettlementView {
        trade_id: trade.trade_id.clone(),
        status: trade.status,
        is_settled: trade.settled_at.is_some(),
        settled_at: trade.settled_at,
        trace_parent: trade.trace_parent.clone(),
        linked_trace_id: stored.context.as_ref().map(|c| c.trace_id().to_string()),
    }
}
