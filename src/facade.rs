//! Session facade.
//!
//! [`SessionContext`] is the entry point: it opens sessions on an injected
//! [`EngineProvider`], negotiates and closes them, and keeps the registry of
//! active sessions. There is no process-wide session state; two contexts never
//! see each other's sessions.
//!
//! Every session serializes its operations on an internal async mutex, so
//! concurrent calls on the same [`Session`] run one after another in arrival
//! order. Lifecycle transitions only ever happen while that mutex is held.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{MediaConstraints, SessionConfig};
use crate::engine::{
    Backend, EngineError, EngineEvent, EngineProvider, TransportEngine, TransportStats,
};
use crate::error::{FacadeError, Result};
use crate::model::control::ControlMessage;
use crate::model::description::{LocalDescription, RemoteDescription};
use crate::model::session::{MediaAttributes, SessionId, SessionInfo, SessionState};

/// Explicit context owning the registry of sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    provider: Arc<dyn EngineProvider>,
    registry: Mutex<HashMap<SessionId, Session>>,
}

impl SessionContext {
    pub fn new(provider: impl EngineProvider + 'static) -> Self {
        Self::with_provider(Arc::new(provider))
    }

    pub fn with_provider(provider: Arc<dyn EngineProvider>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                provider,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn backend(&self) -> Backend {
        self.inner.provider.backend()
    }

    /// Opens a session and produces its local description.
    ///
    /// The returned session is `Connecting`; hand
    /// [`Session::local_description`] to the remote peer and pass its reply to
    /// [`negotiate`](Self::negotiate).
    pub async fn open(&self, config: SessionConfig) -> Result<Session> {
        let endpoints = config.usable_endpoints()?;

        let mut pending = PendingOpen {
            engine: Some(self.inner.provider.create(&config).await?),
        };
        let local = match pending.engine.as_mut() {
            Some(engine) => engine.create_offer().await?,
            None => return Err(EngineError::Released.into()),
        };
        let Some(mut engine) = pending.engine.take() else {
            return Err(EngineError::Released.into());
        };
        let events = engine.take_events();

        let id = SessionId::next();
        let (state, _) = watch::channel(SessionState::Connecting);
        let shared = Arc::new(Shared {
            id,
            context: Arc::downgrade(&self.inner),
            backend: self.backend(),
            opened_at: Utc::now(),
            negotiation_timeout: config.negotiation_timeout(),
            media: config.media_constraints,
            local,
            state,
            core: tokio::sync::Mutex::new(Core {
                engine: Some(engine),
                remote: None,
                custom_parameters: BTreeMap::new(),
            }),
            snapshot: Mutex::new(Snapshot {
                media: MediaAttributes {
                    video_sending: config.media_constraints.video,
                    ..Default::default()
                },
                ..Default::default()
            }),
        });

        let session = Session {
            shared: shared.clone(),
        };
        self.inner.registry().insert(id, session.clone());

        // The monitor may deregister the session, so it starts after the insert.
        if let Some(events) = events {
            tokio::spawn(monitor(Arc::downgrade(&shared), events));
        }

        let endpoints: Vec<_> = endpoints.iter().map(ToString::to_string).collect();
        info!(
            "{} opened on {} backend, ICE servers: {}",
            id,
            self.backend(),
            endpoints.join(", ")
        );

        Ok(session)
    }

    /// Applies the remote peer's description and waits for the transport.
    ///
    /// On timeout the session stays `Connecting` and the call may be retried.
    /// If the returned future is dropped before it resolves, the engine is
    /// released and the session ends up `Closed`.
    pub async fn negotiate(
        &self,
        session: &Session,
        remote: impl Into<RemoteDescription>,
    ) -> Result<()> {
        let remote = remote.into();
        let shared = &session.shared;
        let mut core = shared.core.lock().await;

        let state = shared.state();
        if state != SessionState::Connecting {
            return Err(FacadeError::InvalidState {
                operation: "negotiate",
                state,
            });
        }
        if remote.is_blank() {
            return Err(FacadeError::Negotiation("empty remote description".into()));
        }

        let timeout = shared.negotiation_timeout;
        let result = {
            let mut pending = PendingNegotiation {
                shared,
                core: &mut *core,
                armed: true,
            };
            let result = match pending.core.engine.as_mut() {
                Some(engine) => tokio::time::timeout(timeout, engine.negotiate(&remote)).await,
                None => Ok(Err(EngineError::Released)),
            };
            pending.armed = false;
            result
        };

        match result {
            Ok(Ok(())) => {
                core.remote = Some(remote);
                shared.transition(SessionState::Connected);
                info!("{} connected", shared.id);
                Ok(())
            }
            Ok(Err(e)) => {
                let err = FacadeError::from(e);
                if err.is_fatal() {
                    shared.fail_locked(&mut core, err.to_string());
                } else {
                    warn!("{} negotiation rejected: {}", shared.id, err);
                }
                Err(err)
            }
            Err(_elapsed) => {
                if let Some(engine) = core.engine.as_mut() {
                    engine.cancel_negotiation();
                }
                warn!("{} negotiation timed out after {:?}", shared.id, timeout);
                Err(FacadeError::Timeout(timeout))
            }
        }
    }

    /// Closes the session and releases its engine. Closing a session that is
    /// already `Closed` or `Failed` does nothing.
    pub async fn close(&self, session: &Session) {
        self.close_with_reason(session, None).await
    }

    pub async fn close_with_reason(&self, session: &Session, reason: Option<String>) {
        let shared = &session.shared;
        let mut core = shared.core.lock().await;

        let state = shared.state();
        if state.is_terminal() {
            debug!("{} already {:?}, close is a no-op", shared.id, state);
        } else {
            if state == SessionState::Connected {
                if let Some(engine) = core.engine.as_mut() {
                    if let Err(e) = engine.send_control(ControlMessage::Bye(reason.clone())).await {
                        warn!("{} could not say goodbye: {}", shared.id, e);
                    }
                }
            }
            shared.close_locked(&mut core, reason);
        }
    }

    /// Looks up a session of this context that has not reached a terminal
    /// state.
    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.inner.registry().get(&id).cloned()
    }

    /// Snapshots of every session that is still `Connecting` or `Connected`.
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self.inner.registry().values().map(Session::info).collect();
        infos.sort_by_key(|i| i.id);
        infos
    }
}

impl ContextInner {
    /// Sessions leave the registry as soon as they reach a terminal state.
    fn registry(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owns a freshly created engine until its session is registered. Dropping
/// `open` half way releases the engine.
struct PendingOpen {
    engine: Option<Box<dyn TransportEngine>>,
}

impl Drop for PendingOpen {
    fn drop(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            debug!("open abandoned, releasing engine");
            engine.release();
        }
    }
}

/// Handle on one session. Clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

struct Shared {
    id: SessionId,
    context: Weak<ContextInner>,
    backend: Backend,
    opened_at: DateTime<Utc>,
    negotiation_timeout: Duration,
    media: MediaConstraints,
    local: LocalDescription,
    state: watch::Sender<SessionState>,
    core: tokio::sync::Mutex<Core>,
    snapshot: Mutex<Snapshot>,
}

/// State only touched with the session mutex held.
struct Core {
    engine: Option<Box<dyn TransportEngine>>,
    remote: Option<RemoteDescription>,
    custom_parameters: BTreeMap<String, String>,
}

/// State readable without waiting on the session mutex.
#[derive(Default)]
struct Snapshot {
    media: MediaAttributes,
    remote_media: Option<MediaAttributes>,
    close_reason: Option<String>,
    final_stats: TransportStats,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn snapshot(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves to `next` if the lifecycle allows it.
    fn transition(&self, next: SessionState) -> bool {
        let id = self.id;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!("{} {:?} -> {:?}", id, state, next);
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn release_locked(&self, core: &mut Core) {
        if let Some(mut engine) = core.engine.take() {
            self.snapshot().final_stats = engine.stats();
            engine.release();
        }
        if let Some(context) = self.context.upgrade() {
            context.registry().remove(&self.id);
        }
    }

    fn close_locked(&self, core: &mut Core, reason: Option<String>) {
        if self.transition(SessionState::Closed) {
            self.release_locked(core);
            info!(
                "{} closed{}",
                self.id,
                reason
                    .as_deref()
                    .map(|r| format!(": {}", r))
                    .unwrap_or_default()
            );
            self.snapshot().close_reason = reason;
        }
    }

    fn fail_locked(&self, core: &mut Core, reason: String) {
        if self.transition(SessionState::Failed) {
            self.release_locked(core);
            warn!("{} failed: {}", self.id, reason);
            self.snapshot().close_reason = Some(reason);
        }
    }
}

/// Holds the session mutex across a negotiation. If dropped while armed, the
/// negotiation was cancelled and the engine is released.
struct PendingNegotiation<'a> {
    shared: &'a Shared,
    core: &'a mut Core,
    armed: bool,
}

impl Drop for PendingNegotiation<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("{} negotiation cancelled, releasing engine", self.shared.id);
            self.shared
                .close_locked(self.core, Some("negotiation cancelled".into()));
        }
    }
}

/// Reacts to engine events for as long as the session exists.
async fn monitor(session: Weak<Shared>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = session.upgrade() else {
            break;
        };

        match event {
            EngineEvent::Disconnected => {
                let mut core = shared.core.lock().await;
                shared.fail_locked(&mut core, "transport disconnected".into());
            }
            EngineEvent::Fatal(reason) => {
                let mut core = shared.core.lock().await;
                shared.fail_locked(&mut core, reason);
            }
            EngineEvent::Remote(ControlMessage::Bye(reason)) => {
                let mut core = shared.core.lock().await;
                let reason = match reason {
                    Some(r) => format!("remote hung up: {}", r),
                    None => "remote hung up".to_string(),
                };
                shared.close_locked(&mut core, Some(reason));
            }
            EngineEvent::Remote(ControlMessage::Media(attributes)) => {
                info!("{} remote media: {:?}", shared.id, attributes);
                shared.snapshot().remote_media = Some(attributes);
            }
            EngineEvent::Remote(message) => {
                info!("{} remote control: {:?}", shared.id, message);
            }
        }
    }
    debug!("Engine event stream ended");
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Receiver that observes every state change of this session.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// The description to send to the remote peer.
    pub fn local_description(&self) -> &LocalDescription {
        &self.shared.local
    }

    /// The remote description accepted by a successful negotiation.
    pub async fn remote_description(&self) -> Option<RemoteDescription> {
        self.shared.core.lock().await.remote.clone()
    }

    pub fn info(&self) -> SessionInfo {
        let snapshot = self.shared.snapshot();
        SessionInfo {
            id: self.shared.id,
            state: self.shared.state(),
            backend: self.shared.backend,
            opened_at: self.shared.opened_at,
            media: snapshot.media,
            remote_media: snapshot.remote_media,
            close_reason: snapshot.close_reason.clone(),
        }
    }

    pub fn media_attributes(&self) -> MediaAttributes {
        self.shared.snapshot().media
    }

    /// Transport counters; frozen at their last value once the engine is gone.
    pub async fn stats(&self) -> TransportStats {
        let core = self.shared.core.lock().await;
        match core.engine.as_ref() {
            Some(engine) => engine.stats(),
            None => self.shared.snapshot().final_stats,
        }
    }

    pub async fn mute(&self) -> Result<()> {
        self.update_media("mute", |m| {
            m.audio_muted = true;
            Ok(())
        })
        .await
    }

    pub async fn unmute(&self) -> Result<()> {
        self.update_media("unmute", |m| {
            m.audio_muted = false;
            Ok(())
        })
        .await
    }

    pub async fn video_mute(&self) -> Result<()> {
        self.update_media("video_mute", |m| {
            m.video_muted = true;
            Ok(())
        })
        .await
    }

    pub async fn video_unmute(&self) -> Result<()> {
        self.update_media("video_unmute", |m| {
            m.video_muted = false;
            Ok(())
        })
        .await
    }

    pub async fn video_start(&self) -> Result<()> {
        let video_enabled = self.shared.media.video;
        self.update_media("video_start", move |m| {
            if !video_enabled {
                return Err(FacadeError::Configuration(
                    "video is disabled in the media constraints".into(),
                ));
            }
            m.video_sending = true;
            Ok(())
        })
        .await
    }

    pub async fn video_stop(&self) -> Result<()> {
        self.update_media("video_stop", |m| {
            m.video_sending = false;
            Ok(())
        })
        .await
    }

    pub async fn hold(&self) -> Result<()> {
        self.update_media("hold", |m| {
            m.held = true;
            Ok(())
        })
        .await
    }

    pub async fn unhold(&self) -> Result<()> {
        self.update_media("unhold", |m| {
            m.held = false;
            Ok(())
        })
        .await
    }

    /// Sends one DTMF tone (`0-9`, `*`, `#`, `A-D`).
    pub async fn send_dtmf(&self, tone: char) -> Result<()> {
        if !ControlMessage::is_valid_dtmf(tone) {
            return Err(FacadeError::Configuration(format!(
                "invalid DTMF tone '{}'",
                tone
            )));
        }
        let mut core = self.connected_core("send_dtmf").await?;
        self.send_locked(&mut core, ControlMessage::Dtmf(tone.to_ascii_uppercase()))
            .await
    }

    /// Stores parameters to be sent with [`send_custom_parameters`](Self::send_custom_parameters).
    pub async fn set_custom_parameters(&self, parameters: BTreeMap<String, String>) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        let state = self.shared.state();
        if state.is_terminal() {
            return Err(FacadeError::InvalidState {
                operation: "set_custom_parameters",
                state,
            });
        }
        core.custom_parameters = parameters;
        Ok(())
    }

    pub async fn custom_parameters(&self) -> BTreeMap<String, String> {
        self.shared.core.lock().await.custom_parameters.clone()
    }

    pub async fn send_custom_parameters(&self) -> Result<()> {
        let mut core = self.connected_core("send_custom_parameters").await?;
        let message = ControlMessage::CustomParameters(core.custom_parameters.clone());
        self.send_locked(&mut core, message).await
    }

    async fn connected_core(
        &self,
        operation: &'static str,
    ) -> Result<tokio::sync::MutexGuard<'_, Core>> {
        let core = self.shared.core.lock().await;
        let state = self.shared.state();
        if state != SessionState::Connected {
            return Err(FacadeError::InvalidState { operation, state });
        }
        Ok(core)
    }

    async fn update_media<F>(&self, operation: &'static str, update: F) -> Result<()>
    where
        F: FnOnce(&mut MediaAttributes) -> Result<()>,
    {
        let mut core = self.connected_core(operation).await?;
        let mut media = self.shared.snapshot().media;
        update(&mut media)?;

        self.send_locked(&mut core, ControlMessage::Media(media))
            .await?;
        self.shared.snapshot().media = media;
        debug!("{} {}: {:?}", self.shared.id, operation, media);
        Ok(())
    }

    async fn send_locked(&self, core: &mut Core, message: ControlMessage) -> Result<()> {
        let Some(engine) = core.engine.as_mut() else {
            return Err(FacadeError::TransportFatal("engine released".into()));
        };
        if let Err(e) = engine.send_control(message).await {
            let err = FacadeError::from(e);
            if err.is_fatal() {
                self.shared.fail_locked(core, err.to_string());
            }
            return Err(err);
        }
        Ok(())
    }
}
