//! The query state machine.
//!
//! `ResolvingTimeframe → SelectingSource → Fetching → Compressing →
//! Analyzing → UpdatingSession → Done`, with `Failed` reachable from
//! any state. One progress event per transition. Stage-local
//! recoveries (ambiguous timeframe, single-source outage, empty
//! corpus) never fail the query; retries belong to the stages
//! themselves, never to this layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hivesift_bus::BusPublisher;
use hivesift_schema::{
    AnalysisResult, Corpus, CorpusMeta, ConversationFilter, ErrorKind, QueryEvent, QueryFailure,
    Stage, TimeInterval,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer::{AnalyzeError, Analyzer};
use crate::compress::CorpusCompressor;
use crate::followup::is_follow_up;
use crate::selector::SourceSelector;
use crate::session::SessionStore;
use crate::session_lock::SessionLockManager;
use crate::timeframe::{self, TimeframeDefaults};

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub session_id: String,
    pub query: String,
    /// Injectable clock for deterministic timeframe resolution.
    pub now: Option<DateTime<Utc>>,
}

impl QueryRequest {
    pub fn new(session_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            query: query.into(),
            now: None,
        }
    }
}

pub struct QueryOrchestrator {
    selector: SourceSelector,
    compressor: CorpusCompressor,
    analyzer: Analyzer,
    sessions: Arc<SessionStore>,
    locks: SessionLockManager,
    bus: BusPublisher,
    timeframe_defaults: TimeframeDefaults,
    fetch_limit: Option<usize>,
}

impl QueryOrchestrator {
    pub fn new(
        selector: SourceSelector,
        compressor: CorpusCompressor,
        analyzer: Analyzer,
        sessions: Arc<SessionStore>,
        locks: SessionLockManager,
        bus: BusPublisher,
    ) -> Self {
        Self {
            selector,
            compressor,
            analyzer,
            sessions,
            locks,
            bus,
            timeframe_defaults: TimeframeDefaults::default(),
            fetch_limit: None,
        }
    }

    pub fn with_timeframe_defaults(mut self, defaults: TimeframeDefaults) -> Self {
        self.timeframe_defaults = defaults;
        self
    }

    pub fn with_fetch_limit(mut self, fetch_limit: usize) -> Self {
        self.fetch_limit = Some(fetch_limit);
        self
    }

    pub async fn run(&self, request: QueryRequest) -> Result<AnalysisResult, QueryFailure> {
        self.run_cancellable(request, CancellationToken::new())
            .await
    }

    /// Cancellable at every state boundary; in-flight fetch and model
    /// calls are raced against the token. Cancellation never touches
    /// the session store.
    pub async fn run_cancellable(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisResult, QueryFailure> {
        let trace_id = Uuid::new_v4();
        let session_id = request.session_id.clone();
        let _guard = self.locks.acquire(&session_id).await;
        let now = request.now.unwrap_or_else(Utc::now);

        // ResolvingTimeframe
        self.check_cancel(&cancel, trace_id, &session_id, Stage::ResolvingTimeframe)
            .await?;
        self.emit(trace_id, &session_id, Stage::ResolvingTimeframe, "resolving timeframe")
            .await;
        let resolution = timeframe::resolve(&request.query, now, &self.timeframe_defaults);
        if resolution.kind == timeframe::ResolutionKind::Ambiguous {
            tracing::warn!(query = %request.query, "conflicting timeframes, using default window");
        }

        let prior = self.sessions.get(&session_id).await;
        let reusable = prior
            .as_ref()
            .filter(|state| state.has_conversations)
            .filter(|_| !resolution.is_explicit())
            .filter(|_| is_follow_up(&request.query))
            .cloned();

        let (corpus, interval) = match reusable {
            Some(state) => match self.sessions.cached_corpus(&session_id).await {
                Some(corpus) => {
                    // Follow-up: re-analyze the prior corpus, skipping
                    // SelectingSource and Fetching outright.
                    tracing::info!(%session_id, "follow-up query, reusing prior corpus");
                    let interval = state.last_interval.unwrap_or(resolution.interval);
                    (corpus, interval)
                }
                None => {
                    self.fetch_fresh(trace_id, &session_id, &cancel, resolution.interval)
                        .await?
                }
            },
            None => {
                self.fetch_fresh(trace_id, &session_id, &cancel, resolution.interval)
                    .await?
            }
        };

        // Compressing
        self.check_cancel(&cancel, trace_id, &session_id, Stage::Compressing)
            .await?;
        self.emit(trace_id, &session_id, Stage::Compressing, "fitting corpus to model budget")
            .await;
        let compressed = match self.compressor.compress(&corpus) {
            Ok(compressed) => compressed,
            Err(err) => {
                return Err(self
                    .fail(
                        trace_id,
                        Stage::Compressing,
                        ErrorKind::CompressionBudgetUnreachable,
                        &session_id,
                        "narrow the timeframe or raise the compression budget",
                        err.to_string(),
                    )
                    .await);
            }
        };
        let mut corpus = corpus;
        corpus.meta.compressed = compressed.compressed;

        // Analyzing
        self.check_cancel(&cancel, trace_id, &session_id, Stage::Analyzing)
            .await?;
        self.emit(trace_id, &session_id, Stage::Analyzing, "extracting insights")
            .await;
        let analysis = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(self.cancelled(trace_id, &session_id, Stage::Analyzing).await);
            }
            result = self.analyzer.analyze(&request.query, &compressed, &corpus) => result,
        };
        let result = match analysis {
            Ok(result) => result,
            Err(err) => {
                let (kind, hint) = match &err {
                    AnalyzeError::Unstructured { .. } => (
                        ErrorKind::UnstructuredResponse,
                        "the model did not return valid JSON; retry the query",
                    ),
                    AnalyzeError::Timeout { .. } => {
                        (ErrorKind::Internal, "the model call timed out; retry")
                    }
                    AnalyzeError::Model(_) => {
                        (ErrorKind::Internal, "check model credentials and retry")
                    }
                };
                return Err(self
                    .fail(trace_id, Stage::Analyzing, kind, &session_id, hint, err.to_string())
                    .await);
            }
        };

        // UpdatingSession
        self.check_cancel(&cancel, trace_id, &session_id, Stage::UpdatingSession)
            .await?;
        self.emit(trace_id, &session_id, Stage::UpdatingSession, "recording session context")
            .await;
        self.sessions
            .update(&session_id, &request.query, interval, &corpus)
            .await;

        // Done
        self.emit(trace_id, &session_id, Stage::Done, "analysis complete")
            .await;
        let _ = self
            .bus
            .publish(QueryEvent::Completed {
                trace_id,
                session_id: session_id.clone(),
                result: result.clone(),
            })
            .await;

        Ok(result)
    }

    /// SelectingSource and Fetching for a query that cannot reuse prior
    /// context.
    async fn fetch_fresh(
        &self,
        trace_id: Uuid,
        session_id: &str,
        cancel: &CancellationToken,
        interval: TimeInterval,
    ) -> Result<(Corpus, TimeInterval), QueryFailure> {
        self.check_cancel(cancel, trace_id, session_id, Stage::SelectingSource)
            .await?;
        self.emit(trace_id, session_id, Stage::SelectingSource, "choosing conversation source")
            .await;

        let mut filter = ConversationFilter::for_interval(interval);
        filter.max_count = self.fetch_limit;

        self.check_cancel(cancel, trace_id, session_id, Stage::Fetching)
            .await?;
        self.emit(trace_id, session_id, Stage::Fetching, "fetching conversations")
            .await;
        let selection = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(self.cancelled(trace_id, session_id, Stage::Fetching).await);
            }
            result = self.selector.select(&filter) => result,
        };
        let selection = match selection {
            Ok(selection) => selection,
            Err(err) => {
                return Err(self
                    .fail(
                        trace_id,
                        Stage::Fetching,
                        ErrorKind::AllSourcesExhausted,
                        session_id,
                        "check conversation source connectivity and credentials, then retry",
                        err.to_string(),
                    )
                    .await);
            }
        };

        tracing::info!(
            used = %selection.used,
            fell_back = selection.fell_back,
            count = selection.conversations.len(),
            "fetched corpus"
        );
        let corpus = Corpus {
            conversations: selection.conversations,
            meta: CorpusMeta {
                source: selection.used,
                fetch_elapsed: selection.fetch_elapsed,
                fell_back: selection.fell_back,
                compressed: false,
            },
        };
        Ok((corpus, interval))
    }

    async fn emit(&self, trace_id: Uuid, session_id: &str, stage: Stage, message: &str) {
        let _ = self
            .bus
            .publish(QueryEvent::StageChanged {
                trace_id,
                session_id: session_id.to_string(),
                stage,
                message: message.to_string(),
                percent: stage.percent(),
            })
            .await;
    }

    async fn check_cancel(
        &self,
        cancel: &CancellationToken,
        trace_id: Uuid,
        session_id: &str,
        stage: Stage,
    ) -> Result<(), QueryFailure> {
        if cancel.is_cancelled() {
            return Err(self.cancelled(trace_id, session_id, stage).await);
        }
        Ok(())
    }

    async fn cancelled(&self, trace_id: Uuid, session_id: &str, stage: Stage) -> QueryFailure {
        self.fail(
            trace_id,
            stage,
            ErrorKind::Cancelled,
            session_id,
            "the caller disconnected; no state was modified",
            "query cancelled".to_string(),
        )
        .await
    }

    async fn fail(
        &self,
        trace_id: Uuid,
        stage: Stage,
        kind: ErrorKind,
        session_id: &str,
        hint: &str,
        detail: String,
    ) -> QueryFailure {
        let failure = QueryFailure {
            stage,
            kind,
            session_id: session_id.to_string(),
            hint: hint.to_string(),
            detail,
        };
        tracing::warn!(stage = %failure.stage, ?kind, "query failed");
        let _ = self
            .bus
            .publish(QueryEvent::Failed {
                trace_id,
                failure: failure.clone(),
            })
            .await;
        failure
    }
}
