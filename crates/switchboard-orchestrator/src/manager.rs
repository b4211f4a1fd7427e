//! Session lifecycle: opening pipelines, running per-session turn
//! loops, sweeping idle calls, and shutting everything down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchboard_agents::{AgentRegistry, ToolRegistry};
use switchboard_core::config::{Config, PipelineConfig};
use switchboard_core::error::{Result, SwitchboardError};
use switchboard_core::events::SessionEvent;
use switchboard_core::session::{Session, TransportType};
use switchboard_core::store::SessionStateStore;
use switchboard_media::{
    PipelineEvent, PipelineHandle, RecognizerPool, SpeechPipelineCoordinator, SynthesizerPool,
};
use switchboard_pool::PoolMetrics;
use switchboard_providers::LlmClient;

use crate::orchestrator::{SessionOrchestrator, TurnSettings};

const EVENT_STREAM_CAPACITY: usize = 64;

/// Manager tuning, resolved once from config.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub pipeline: PipelineConfig,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub turn: TurnSettings,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pipeline: config.pipeline_settings(),
            acquire_timeout: config.stt_pool().acquire_timeout(),
            idle_timeout: config.idle_timeout(),
            sweep_interval: config.sweep_interval(),
            turn: TurnSettings::from_config(config),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A live session the transport can feed and listen to.
#[derive(Debug)]
pub struct OpenSession {
    pub session_id: String,
    /// Raw little-endian PCM from the transport.
    pub audio_in: mpsc::Sender<Vec<u8>>,
    /// Ordered orchestrator events for this session.
    pub events: mpsc::Receiver<SessionEvent>,
}

struct ActiveSession {
    cancel: CancellationToken,
    /// Unix seconds of the last pipeline event, updated by the turn loop.
    last_activity: Arc<AtomicU64>,
}

/// Owns every live session: their pipelines, their orchestrator tasks,
/// and the background upkeep that retires the idle ones.
pub struct SessionManager {
    settings: ManagerSettings,
    /// Swapped on scenario reload; live sessions keep the registry they
    /// started with.
    registry: RwLock<Arc<AgentRegistry>>,
    tools: Arc<ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn SessionStateStore>,
    stt_pool: Arc<RecognizerPool>,
    tts_pool: Arc<SynthesizerPool>,
    active: Mutex<HashMap<String, ActiveSession>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: AgentRegistry,
        tools: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn SessionStateStore>,
        stt_pool: Arc<RecognizerPool>,
        tts_pool: Arc<SynthesizerPool>,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            registry: RwLock::new(Arc::new(registry)),
            tools,
            llm,
            store,
            stt_pool,
            tts_pool,
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn background upkeep: pool maintenance and the idle sweeper.
    pub fn start_upkeep(self: &Arc<Self>) {
        self.stt_pool.spawn_maintenance(self.shutdown.child_token());
        self.tts_pool.spawn_maintenance(self.shutdown.child_token());
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_sweeper().await });
    }

    /// Open (or resume) a session: acquire speech resources, start the
    /// audio pipeline, and spawn the turn loop. Pool exhaustion surfaces
    /// to the caller so the transport can refuse the call.
    pub async fn open_session(
        self: &Arc<Self>,
        session_id: Option<String>,
        transport: TransportType,
        audio_out: mpsc::Sender<Vec<u8>>,
    ) -> Result<OpenSession> {
        // Fail duplicates before acquiring speech resources: a dedicated
        // acquire for a live session would alias its pooled instances.
        if let Some(id) = &session_id {
            if self.active.lock().await.contains_key(id) {
                return Err(SwitchboardError::Session(format!(
                    "session '{id}' is already connected"
                )));
            }
        }

        let registry = self.registry.read().await.clone();

        let mut session = match &session_id {
            Some(id) => match self.store.load(id).await? {
                Some(existing) => {
                    debug!(session = %id, entries = existing.history.len(), "Resuming session");
                    existing
                }
                None => Session::with_id(id.clone(), transport, registry.start_agent()),
            },
            None => Session::new(transport, registry.start_agent()),
        };
        if !registry.contains(&session.active_agent) {
            // The scenario changed since this session was persisted.
            warn!(
                session = %session.session_id,
                agent = %session.active_agent,
                start = registry.start_agent(),
                "Persisted agent is not in the current scenario; restarting at the entry agent"
            );
            session.active_agent = registry.start_agent().to_string();
            session.visit(registry.start_agent());
        }
        let id = session.session_id.clone();

        let (pipeline, pipeline_events) = SpeechPipelineCoordinator::start(
            &id,
            self.settings.pipeline,
            Arc::clone(&self.stt_pool),
            Arc::clone(&self.tts_pool),
            audio_out,
            self.settings.acquire_timeout,
        )
        .await?;

        let (event_tx, events) = mpsc::channel(EVENT_STREAM_CAPACITY);
        let orchestrator = SessionOrchestrator::new(
            session,
            registry,
            Arc::clone(&self.tools),
            Arc::clone(&self.llm),
            Arc::clone(&self.store),
            Some(pipeline.speaker()),
            event_tx,
            self.settings.turn.clone(),
        );

        let cancel = self.shutdown.child_token();
        let last_activity = Arc::new(AtomicU64::new(now_secs()));
        {
            let mut active = self.active.lock().await;
            if active.contains_key(&id) {
                // Raced with another open for the same id.
                pipeline.close();
                return Err(SwitchboardError::Session(format!(
                    "session '{id}' is already connected"
                )));
            }
            active.insert(
                id.clone(),
                ActiveSession {
                    cancel: cancel.clone(),
                    last_activity: Arc::clone(&last_activity),
                },
            );
        }

        let audio_in = pipeline.audio_sender();
        let manager = Arc::clone(self);
        let task_id = id.clone();
        tokio::spawn(async move {
            run_session(orchestrator, pipeline, pipeline_events, last_activity, cancel).await;
            manager.active.lock().await.remove(&task_id);
        });

        info!(session = %id, "Session opened");
        Ok(OpenSession {
            session_id: id,
            audio_in,
            events,
        })
    }

    /// Request a session close. Returns false if it was not live.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let active = self.active.lock().await;
        match active.get(session_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Swap the scenario for sessions opened from now on.
    pub async fn replace_registry(&self, registry: AgentRegistry) {
        let scenario = registry.scenario_name().to_string();
        let agents = registry.agent_names().len();
        *self.registry.write().await = Arc::new(registry);
        info!(scenario = %scenario, agents, "Scenario registry replaced");
    }

    pub async fn registry(&self) -> Arc<AgentRegistry> {
        self.registry.read().await.clone()
    }

    pub async fn pool_metrics(&self) -> (PoolMetrics, PoolMetrics) {
        (self.stt_pool.snapshot().await, self.tts_pool.snapshot().await)
    }

    /// Stop everything: live sessions, the sweeper, pool maintenance.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_idle().await;
                    if let Err(e) = self.store.sweep().await {
                        warn!(error = %e, "Store sweep failed");
                    }
                }
            }
        }
    }

    /// Close sessions idle past the timeout.
    async fn sweep_idle(&self) {
        let cutoff = self.settings.idle_timeout.as_secs();
        let now = now_secs();
        let idle: Vec<(String, CancellationToken)> = {
            let active = self.active.lock().await;
            active
                .iter()
                .filter(|(_, entry)| {
                    now.saturating_sub(entry.last_activity.load(Ordering::Relaxed)) > cutoff
                })
                .map(|(id, entry)| (id.clone(), entry.cancel.clone()))
                .collect()
        };
        for (id, cancel) in idle {
            info!(session = %id, "Closing idle session");
            cancel.cancel();
        }
    }
}

/// Per-session turn loop: translate pipeline events into turns until the
/// transport disconnects, the sweeper retires us, or shutdown lands.
async fn run_session(
    mut orchestrator: SessionOrchestrator,
    pipeline: PipelineHandle,
    mut pipeline_events: mpsc::Receiver<PipelineEvent>,
    last_activity: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    orchestrator.open().await;

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "closed",
            maybe = pipeline_events.recv() => {
                let Some(event) = maybe else { break "transport closed" };
                last_activity.store(now_secs(), Ordering::Relaxed);
                match event {
                    PipelineEvent::UtteranceComplete { transcript } => {
                        orchestrator.process_turn(&transcript).await;
                    }
                    PipelineEvent::PartialTranscript { text } => {
                        orchestrator.note_partial(text).await;
                    }
                    PipelineEvent::BargeIn => {
                        orchestrator.note_barge_in().await;
                    }
                    PipelineEvent::Closed => break "pipeline closed",
                }
            }
        }
    };

    pipeline.close();
    orchestrator.finish(reason).await;
}

fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
