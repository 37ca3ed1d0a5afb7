use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::analysis::AnalysisClient;
use crate::backend::BackendClient;
use crate::capture::{CaptureCoordinator, SensorFrame, TapPoint};
use crate::config::NutriLensConfig;
use crate::error::{ErrorKind, NutriLensError, Result};
use crate::food_log::{FoodLogStore, PendingQueue, SyncReport};
use crate::insights;
use crate::model::{AnalysisResult, FoodLogEntry, NutritionInsights, DEFAULT_DAILY_CALORIE_GOAL};
use crate::session::{SessionStore, TokenStore};

/// Where the current gesture stands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Capturing,
    Analyzing,
    Ready(AnalysisResult),
    Failed(ErrorKind),
    Committing,
    Committed(FoodLogEntry),
}

impl PipelineState {
    /// True while a capture, analysis or commit is outstanding.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Capturing | Self::Analyzing | Self::Committing)
    }
}

/// What a tap did to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapOutcome {
    /// Analysis is in flight for this gesture.
    Started { generation: u64 },
    /// The gesture failed before any request was sent.
    Failed(ErrorKind),
    /// A commit is in progress; the tap was dropped.
    Ignored,
}

#[derive(Debug, Default)]
struct Gesture {
    generation: u64,
    cancel: Option<CancellationToken>,
}

/// Ties session, capture, analysis and the food log together into the
/// capture → analyze → confirm → commit flow.
///
/// State is published through a `watch` channel. Every gesture gets a
/// generation number; async completions carry theirs and are dropped unless
/// it still matches, so a superseded analysis can never touch the state.
pub struct Pipeline {
    session: Arc<SessionStore>,
    capture: CaptureCoordinator,
    analysis: Arc<AnalysisClient>,
    log: Arc<FoodLogStore>,
    backend: BackendClient,
    state: watch::Sender<PipelineState>,
    gesture: Mutex<Gesture>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &*self.state.borrow())
            .field("analysis", &self.analysis)
            .finish()
    }
}

impl Pipeline {
    pub fn new(
        backend: BackendClient,
        session: Arc<SessionStore>,
        analysis: AnalysisClient,
        log: Arc<FoodLogStore>,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            session,
            capture: CaptureCoordinator::new(),
            analysis: Arc::new(analysis),
            log,
            backend,
            state,
            gesture: Mutex::new(Gesture::default()),
        }
    }

    /// Wire every component from configuration: token file, pending queue,
    /// backend and analysis clients.
    pub fn from_config(config: &NutriLensConfig) -> Result<Self> {
        let tokens = TokenStore::file(config.session.resolved_token_path()?);
        Self::from_config_with_tokens(config, tokens)
    }

    /// Like [`Pipeline::from_config`] but with an explicit token store.
    pub fn from_config_with_tokens(config: &NutriLensConfig, tokens: TokenStore) -> Result<Self> {
        let backend = BackendClient::from_config(&config.backend)?;
        let session = Arc::new(SessionStore::new(backend.clone(), tokens));
        let analysis = AnalysisClient::from_config(&config.analysis, &config.backend)?;
        let queue = PendingQueue::new(config.log.resolved_pending_path()?);
        let log = FoodLogStore::new(backend.clone(), Arc::clone(&session)).with_pending(queue)?;
        Ok(Self::new(backend, session, analysis, Arc::new(log)))
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn log(&self) -> &Arc<FoodLogStore> {
        &self.log
    }

    pub fn analysis(&self) -> &AnalysisClient {
        &self.analysis
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Wait until no capture, analysis or commit is outstanding and return
    /// the state reached.
    pub async fn settled(&self) -> PipelineState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|s| !s.is_busy()).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        settled
    }

    /// Start a gesture at `tap` over the given sensor frame.
    ///
    /// Supersedes any capture or analysis in flight. Ignored while a commit
    /// is outstanding. Must be called inside a Tokio runtime.
    pub fn tap(self: &Arc<Self>, tap: TapPoint, frame: &SensorFrame) -> TapOutcome {
        let mut gesture = self.lock_gesture();

        if matches!(*self.state.borrow(), PipelineState::Committing) {
            tracing::debug!("tap ignored while committing");
            return TapOutcome::Ignored;
        }

        gesture.generation += 1;
        let generation = gesture.generation;
        if let Some(previous) = gesture.cancel.take() {
            tracing::debug!(generation, "superseding in-flight analysis");
            previous.cancel();
        }

        if !self.session.is_authenticated() {
            tracing::debug!(generation, "tap without a session");
            self.publish(PipelineState::Failed(ErrorKind::Unauthorized));
            return TapOutcome::Failed(ErrorKind::Unauthorized);
        }

        self.publish(PipelineState::Capturing);
        let evidence = match self.capture.capture(tap, frame) {
            Ok(evidence) => evidence,
            Err(e) => {
                let kind = failure_kind(&e);
                tracing::warn!(generation, error = %e, "capture failed");
                self.publish(PipelineState::Failed(kind));
                return TapOutcome::Failed(kind);
            }
        };

        self.publish(PipelineState::Analyzing);
        let cancel = CancellationToken::new();
        gesture.cancel = Some(cancel.clone());
        drop(gesture);

        let token = self.session.current_token();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(generation, "analysis cancelled");
                    return;
                }
                result = this.analysis.analyze(&evidence, token.as_deref()) => result,
            };
            this.finish_analysis(generation, token.as_deref(), result);
        });

        TapOutcome::Started { generation }
    }

    /// Commit the `Ready` result into the food log.
    ///
    /// Fails with `InvalidTransition` from any other state. The local insert
    /// happens even when the remote write fails.
    pub fn confirm(self: &Arc<Self>) -> Result<()> {
        let mut gesture = self.lock_gesture();
        let result = match self.state() {
            PipelineState::Ready(result) => result,
            other => {
                return Err(NutriLensError::InvalidTransition(format!(
                    "cannot confirm from {other:?}"
                )));
            }
        };

        gesture.generation += 1;
        let generation = gesture.generation;
        self.publish(PipelineState::Committing);
        drop(gesture);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let entry = FoodLogEntry::from_result(&result, Utc::now());
            let token = this.session.current_token();
            let outcome = this.log.append(entry).await;
            this.finish_commit(generation, token.as_deref(), outcome);
        });
        Ok(())
    }

    /// Drop the `Ready` result and return to `Idle`.
    pub fn discard(&self) -> Result<()> {
        let mut gesture = self.lock_gesture();
        match self.state() {
            PipelineState::Ready(result) => {
                gesture.generation += 1;
                tracing::debug!(food = %result.food_name, "result discarded");
                self.publish(PipelineState::Idle);
                Ok(())
            }
            other => Err(NutriLensError::InvalidTransition(format!(
                "cannot discard from {other:?}"
            ))),
        }
    }

    /// Reload the food log from the backend.
    pub async fn refresh_log(&self) -> Result<Vec<FoodLogEntry>> {
        let token = self.session.current_token();
        let result = self.log.load().await;
        self.invalidate_on_unauthorized(token.as_deref(), &result);
        result
    }

    /// Push entries whose remote write has not succeeded yet.
    pub async fn sync_pending(&self) -> Result<SyncReport> {
        let token = self.session.current_token();
        let result = self.log.sync_pending().await;
        self.invalidate_on_unauthorized(token.as_deref(), &result);
        result
    }

    /// Weekly insights from the backend, or computed from the local log
    /// when the backend cannot serve them.
    pub async fn insights(&self) -> Result<NutritionInsights> {
        let token = self
            .session
            .current_token()
            .ok_or_else(|| NutriLensError::Unauthorized("not logged in".into()))?;

        match self.backend.fetch_insights(&token).await {
            Ok(insights) => Ok(insights),
            Err(e) if e.is_unauthorized() => {
                self.session.clear_if_current(&token);
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "remote insights unavailable, summarizing locally");
                let goal = self
                    .session
                    .identity()
                    .map_or(DEFAULT_DAILY_CALORIE_GOAL, |u| u.daily_calorie_goal);
                Ok(insights::weekly_summary(
                    &self.log.entries(),
                    goal,
                    Utc::now().date_naive(),
                ))
            }
        }
    }

    fn finish_analysis(&self, generation: u64, token: Option<&str>, result: Result<AnalysisResult>) {
        let mut gesture = self.lock_gesture();
        if gesture.generation != generation {
            tracing::debug!(generation, current = gesture.generation, "discarding stale analysis");
            return;
        }
        gesture.cancel = None;

        match result {
            Ok(result) => self.publish(PipelineState::Ready(result)),
            Err(e) => {
                let kind = failure_kind(&e);
                if kind == ErrorKind::Unauthorized {
                    self.invalidate(token);
                }
                self.publish(PipelineState::Failed(kind));
            }
        }
    }

    fn finish_commit(&self, generation: u64, token: Option<&str>, outcome: Result<FoodLogEntry>) {
        let gesture = self.lock_gesture();
        if gesture.generation != generation {
            tracing::debug!(generation, current = gesture.generation, "discarding stale commit");
            return;
        }

        match outcome {
            Ok(entry) => self.publish(PipelineState::Committed(entry)),
            Err(e) => {
                let kind = failure_kind(&e);
                if kind == ErrorKind::Unauthorized {
                    self.invalidate(token);
                }
                self.publish(PipelineState::Failed(kind));
            }
        }
    }

    fn invalidate_on_unauthorized<T>(&self, token: Option<&str>, result: &Result<T>) {
        if matches!(result, Err(e) if e.is_unauthorized()) {
            self.invalidate(token);
        }
    }

    /// Drop the session the rejected request was sent with, if still current.
    fn invalidate(&self, token: Option<&str>) {
        if let Some(token) = token {
            self.session.clear_if_current(token);
        }
    }

    fn publish(&self, state: PipelineState) {
        tracing::debug!(?state, "pipeline state");
        self.state.send_replace(state);
    }

    fn lock_gesture(&self) -> MutexGuard<'_, Gesture> {
        self.gesture.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Collapse any error into the kind surfaced through `Failed`.
fn failure_kind(e: &NutriLensError) -> ErrorKind {
    e.kind().unwrap_or_else(|| {
        tracing::warn!(error = %e, "untyped failure reported as server error");
        ErrorKind::ServerError
    })
}
