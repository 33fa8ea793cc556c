// Session dispatcher / worker pool
//
// Accepts start requests, enforces the concurrent-session cap and supervises
// one isolated worker task per session. The capacity counter is the only
// state shared between sessions; a slot is taken before anything is spawned
// and released by the supervisor once the worker is gone, however it ended.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::events::EventPublisher;
use crate::providers::ProviderFactory;
use crate::room::{RoomConnector, TokenIssuer};
use crate::session::{
    AudioSettings, SessionConfig, SessionDefaults, SessionHandle, SessionLifecycleManager,
    SessionMode, SessionRequest, SessionStatus, StatusReport,
};

/// Limits and identity naming for the worker pool
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Maximum concurrently running sessions (default: 8)
    pub max_sessions: usize,
    /// Final status reports kept after sessions end (default: 256)
    pub finished_records: usize,
    pub user_identity_prefix: String,
    pub agent_identity_prefix: String,
    pub session: SessionDefaults,
    pub audio: AudioSettings,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_sessions: 8,
            finished_records: 256,
            user_identity_prefix: "user".to_string(),
            agent_identity_prefix: "agent".to_string(),
            session: SessionDefaults::default(),
            audio: AudioSettings::default(),
        }
    }
}

/// Process-wide collaborators every session is built from
#[derive(Clone)]
pub struct SessionServices {
    pub connector: Arc<RoomConnector>,
    pub providers: Arc<dyn ProviderFactory>,
    pub tokens: Arc<dyn TokenIssuer>,
    /// Optional sink for every session's event stream
    pub publisher: Option<Arc<dyn EventPublisher>>,
}

/// Returned to the caller when a session is accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTicket {
    pub session_id: Uuid,
    pub room_name: String,
    pub media_server_url: String,
    pub user_access_token: String,
    pub agent_access_token: String,
    pub status: SessionStatus,
}

struct SessionEntry {
    handle: SessionHandle,
    abort: AbortHandle,
    /// Fires once the supervisor has recorded the final status
    retired: CancellationToken,
}

/// A claimed unit of capacity, returned on drop
struct CapacitySlot {
    active: Arc<AtomicUsize>,
}

impl Drop for CapacitySlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct DispatcherInner {
    settings: DispatcherSettings,
    services: SessionServices,
    active: Arc<AtomicUsize>,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    finished: Mutex<VecDeque<StatusReport>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(settings: DispatcherSettings, services: SessionServices) -> Self {
        info!(
            "Dispatcher ready: up to {} concurrent sessions, media server {}",
            settings.max_sessions,
            services.connector.url()
        );
        Self {
            inner: Arc::new(DispatcherInner {
                settings,
                services,
                active: Arc::new(AtomicUsize::new(0)),
                sessions: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.settings.max_sessions
    }

    /// Sessions currently holding a capacity slot
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Accept or reject a new session. On success the worker is already
    /// running and connecting to the room.
    pub fn request_start(&self, request: SessionRequest) -> Result<SessionTicket, DispatchError> {
        let inner = &self.inner;
        let slot = self.try_claim_slot().ok_or(DispatchError::CapacityExceeded {
            limit: inner.settings.max_sessions,
        })?;

        let session_id = Uuid::new_v4();
        let mut config = SessionConfig::resolve(
            session_id,
            &request,
            &inner.settings.session,
            &inner.settings.audio,
        )?;

        let user_identity = format!("{}-{}", inner.settings.user_identity_prefix, session_id);
        let agent_identity = format!("{}-{}", inner.settings.agent_identity_prefix, session_id);
        if config.mode == SessionMode::OneToOne && config.participant_identity.is_none() {
            config.participant_identity = Some(user_identity.clone());
        }

        let tokens = &inner.services.tokens;
        let user_access_token = tokens.issue(&config.room_name, &user_identity, "User")?;
        let agent_access_token = tokens.issue(&config.room_name, &agent_identity, "AI Agent")?;

        let room_name = config.room_name.clone();
        let manager = SessionLifecycleManager::new(
            config,
            agent_access_token.clone(),
            Arc::clone(&inner.services.connector),
            inner.services.providers.as_ref(),
        )?;
        let handle = manager.handle();
        if let Some(publisher) = &inner.services.publisher {
            publisher.attach(handle.subscribe_events());
        }
        let worker = tokio::spawn(manager.run());

        let retired = CancellationToken::new();
        self.sessions().insert(
            session_id,
            SessionEntry {
                handle: handle.clone(),
                abort: worker.abort_handle(),
                retired: retired.clone(),
            },
        );

        // Supervisor: isolates the worker and always returns its slot
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let report = match worker.await {
                Ok(report) => report,
                Err(e) => {
                    let mut report = handle.status();
                    if e.is_panic() {
                        error!("Session {} worker panicked; marking failed", session_id);
                        report.status = SessionStatus::Failed;
                        report.error = Some("session worker panicked".to_string());
                    } else {
                        warn!("Session {} worker was force-stopped", session_id);
                        report.status = SessionStatus::Stopped;
                        report.error = Some("force teardown after stop grace period".to_string());
                    }
                    report.stopped_at = Some(Utc::now());
                    report
                }
            };
            dispatcher.retire(report);
            drop(slot);
            retired.cancel();
        });

        info!(
            "Accepted session {} for room '{}' ({}/{} active)",
            session_id,
            room_name,
            self.active_count(),
            self.capacity()
        );

        Ok(SessionTicket {
            session_id,
            room_name,
            media_server_url: inner.services.connector.url().to_string(),
            user_access_token,
            agent_access_token,
            status: SessionStatus::Starting,
        })
    }

    /// Stop a session, forcing teardown if it does not release within its
    /// grace period. Stopping an already finished session is acknowledged.
    pub async fn stop(&self, session_id: Uuid) -> Result<StatusReport, DispatchError> {
        let entry = self
            .sessions()
            .get(&session_id)
            .map(|e| (e.handle.clone(), e.abort.clone(), e.retired.clone()));

        let Some((handle, abort, retired)) = entry else {
            return self
                .finished_report(session_id)
                .ok_or(DispatchError::NotFound(session_id));
        };

        info!("Stopping session {}", session_id);
        if !handle.stop().await {
            warn!(
                "Session {} did not release within {:?}; forcing teardown",
                session_id,
                handle.stop_grace()
            );
            abort.abort();
        }
        retired.cancelled().await;

        self.finished_report(session_id)
            .ok_or(DispatchError::NotFound(session_id))
    }

    pub fn status(&self, session_id: Uuid) -> Result<StatusReport, DispatchError> {
        if let Some(entry) = self.sessions().get(&session_id) {
            return Ok(entry.handle.status());
        }
        self.finished_report(session_id)
            .ok_or(DispatchError::NotFound(session_id))
    }

    /// Live session handle, for event subscription
    pub fn handle(&self, session_id: Uuid) -> Option<SessionHandle> {
        self.sessions().get(&session_id).map(|e| e.handle.clone())
    }

    /// Status of every running session, oldest first
    pub fn list(&self) -> Vec<StatusReport> {
        let mut reports: Vec<StatusReport> =
            self.sessions().values().map(|e| e.handle.status()).collect();
        reports.sort_by_key(|r| r.started_at);
        reports
    }

    /// Stop every running session concurrently
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.sessions().keys().copied().collect();
        if ids.is_empty() {
            return;
        }
        info!("Stopping {} running sessions", ids.len());
        futures::future::join_all(ids.into_iter().map(|id| self.stop(id))).await;
    }

    fn try_claim_slot(&self) -> Option<CapacitySlot> {
        let max = self.inner.settings.max_sessions;
        self.inner
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| CapacitySlot {
                active: Arc::clone(&self.inner.active),
            })
    }

    fn retire(&self, report: StatusReport) {
        self.sessions().remove(&report.session_id);
        info!(
            "Session {} retired with status {}",
            report.session_id, report.status
        );

        let mut finished = self
            .inner
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        finished.push_back(report);
        while finished.len() > self.inner.settings.finished_records.max(1) {
            finished.pop_front();
        }
    }

    fn finished_report(&self, session_id: Uuid) -> Option<StatusReport> {
        self.inner
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|r| r.session_id == session_id)
            .cloned()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
