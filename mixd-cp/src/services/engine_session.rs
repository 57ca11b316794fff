//! Playback-engine session
//!
//! Persistent bidirectional WebSocket session to the engine. On connect the
//! session identifies itself, starts a keepalive ping and resets the
//! reconnect back-off; on close it reconnects with exponential back-off.
//! Inbound commands are answered on the session task, which is what makes
//! the track-info-before-stems ordering hold: the stem probe only runs after
//! the reply has been handed to the writer.
//!
//! Other components deliver through a clonable [`EngineHandle`]; sends never
//! block and never fail the caller; a disconnected engine just means there
//! is nobody to deliver to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mixd_common::{EventBus, MixdEvent};

use crate::db::{hot_cues, tracks};
use crate::models::{AnalysisOptions, DeliveryHook, HookKind, HotCue, JobPriority};
use crate::services::engine_protocol::{
    Deck, HotCuePayload, IdentifyMessage, InboundMessage, OutboundMessage, TrackInfoReply,
};
use crate::services::queue_engine::QueueEngine;
use crate::services::stem_fulfilment::StemFulfilment;

const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct EngineSessionConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl From<&crate::config::ControlPlaneConfig> for EngineSessionConfig {
    fn from(config: &crate::config::ControlPlaneConfig) -> Self {
        Self {
            url: config.engine_ws_url.clone(),
            connect_timeout: Duration::from_millis(config.engine_connect_timeout_ms),
            ping_interval: Duration::from_millis(config.engine_ping_interval),
            reconnect_delay: Duration::from_millis(config.engine_reconnect_delay),
            max_reconnect_delay: Duration::from_millis(config.engine_max_reconnect_delay),
        }
    }
}

/// Clonable delivery handle into the engine session.
///
/// `try_send` semantics throughout: when the outbound queue is full or the
/// session is gone the message is logged and dropped, never blocking the
/// analysis path.
#[derive(Clone)]
pub struct EngineHandle {
    db: SqlitePool,
    tx: mpsc::Sender<OutboundMessage>,
}

/// Create the outbound channel pair shared by the session and its handles
pub fn engine_channel(db: SqlitePool) -> (EngineHandle, mpsc::Receiver<OutboundMessage>) {
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    (EngineHandle { db, tx }, rx)
}

impl EngineHandle {
    /// Queue a message for the engine
    pub fn send(&self, message: OutboundMessage) {
        if let Err(e) = self.tx.try_send(message) {
            tracing::warn!(error = %e, "Dropping outbound engine message");
        }
    }

    /// Build and push a track-info message for an analysed track
    pub async fn send_track_info(&self, track_id: Uuid, request_id: Option<String>) {
        match self.build_track_info(track_id, request_id.clone()).await {
            Ok(reply) => self.send(OutboundMessage::TrackInfo(reply)),
            Err(e) => {
                tracing::error!(
                    track_id = %track_id,
                    error = %e,
                    "Failed to build track info push"
                );
                self.send(OutboundMessage::TrackInfo(TrackInfoReply::error(
                    track_id,
                    request_id,
                    "Track data unavailable",
                )));
            }
        }
    }

    /// Push a stems-ready message with cached stem paths
    pub fn send_stems_ready(
        &self,
        track_id: Uuid,
        request_id: Option<String>,
        stems: HashMap<String, PathBuf>,
    ) {
        self.send(OutboundMessage::stems_ready(track_id, request_id, stems));
    }

    async fn build_track_info(
        &self,
        track_id: Uuid,
        request_id: Option<String>,
    ) -> anyhow::Result<TrackInfoReply> {
        let track = tracks::get(&self.db, track_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("track {} not found", track_id))?;
        let cues = hot_cues::list_for_track(&self.db, track_id).await?;

        Ok(TrackInfoReply {
            success: true,
            request_id,
            track_id,
            file_path: Some(track.file_path),
            bpm: track.tempo,
            key: track.musical_key,
            mode: track.mode,
            first_beat_offset: track.first_beat_offset,
            first_phrase_beat_no: track.first_phrase_beat_no,
            hot_cues: Some(
                cues.into_iter()
                    .map(|c| HotCuePayload {
                        index: c.index,
                        position: c.position,
                        label: c.label,
                    })
                    .collect(),
            ),
            error: None,
        })
    }
}

/// The engine session service
pub struct EngineSession {
    config: EngineSessionConfig,
    db: SqlitePool,
    queue: Arc<QueueEngine>,
    stems: Arc<StemFulfilment>,
    handle: EngineHandle,
    outbound_rx: std::sync::Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    state: Arc<RwLock<SessionState>>,
    decks: Arc<RwLock<HashMap<Deck, Uuid>>>,
    events: EventBus,
}

impl EngineSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineSessionConfig,
        db: SqlitePool,
        queue: Arc<QueueEngine>,
        stems: Arc<StemFulfilment>,
        handle: EngineHandle,
        outbound_rx: mpsc::Receiver<OutboundMessage>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            db,
            queue,
            stems,
            handle,
            outbound_rx: std::sync::Mutex::new(Some(outbound_rx)),
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            decks: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// The track currently loaded in a deck, if any
    pub async fn deck_track(&self, deck: Deck) -> Option<Uuid> {
        self.decks.read().await.get(&deck).copied()
    }

    /// Dispatch one inbound engine message. Replies and follow-up work run
    /// on the calling task, in order.
    pub async fn handle_inbound(&self, raw: &str) {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid JSON from engine");
                return;
            }
        };
        let Some(message) = InboundMessage::parse(&value) else {
            tracing::warn!(payload = %value, "Engine message without discriminator");
            return;
        };

        match message {
            InboundMessage::GetTrackInfo {
                track_id,
                deck,
                stems,
                request_id,
            } => {
                self.handle_get_track_info(track_id, deck, stems, request_id)
                    .await
            }
            InboundMessage::SetCue {
                deck,
                index,
                position,
            } => self.persist_cue(deck, index, position).await,
            InboundMessage::TrackLoadRequested { deck, track_id } => {
                // Updated immediately so subsequent cue events resolve to
                // the right track even before the load confirmation.
                self.decks.write().await.insert(deck, track_id);
                tracing::debug!(deck = deck.as_str(), track_id = %track_id, "Track load requested");
            }
            InboundMessage::TrackLoaded {
                deck,
                track_id,
                success,
            } => {
                let mut decks = self.decks.write().await;
                if success {
                    decks.insert(deck, track_id);
                } else {
                    decks.remove(&deck);
                }
                tracing::debug!(deck = deck.as_str(), track_id = %track_id, success, "Track loaded");
            }
            InboundMessage::CuePointSet {
                deck,
                index,
                position,
                success,
            } => {
                if success {
                    self.persist_cue(deck, index, position).await;
                }
            }
            InboundMessage::CuePointRemoved {
                deck,
                index,
                success,
            } => {
                if success {
                    self.remove_cue(deck, index).await;
                }
            }
            InboundMessage::Welcome { version } => {
                tracing::info!(version = ?version, "Engine welcomed session");
            }
            InboundMessage::DeckStateUpdate => {}
            InboundMessage::Unknown(name) => {
                tracing::debug!(message = %name, "Ignoring unknown engine message");
            }
        }
    }

    async fn handle_get_track_info(
        &self,
        track_id: Uuid,
        deck: Option<Deck>,
        stems: bool,
        request_id: Option<String>,
    ) {
        if let Some(deck) = deck {
            self.decks.write().await.insert(deck, track_id);
        }

        let track = match tracks::get(&self.db, track_id).await {
            Ok(Some(track)) => track,
            Ok(None) => {
                self.handle.send(OutboundMessage::TrackInfo(TrackInfoReply::error(
                    track_id,
                    request_id,
                    "Track not found",
                )));
                return;
            }
            Err(e) => {
                tracing::error!(track_id = %track_id, error = %e, "Track lookup failed");
                self.handle.send(OutboundMessage::TrackInfo(TrackInfoReply::error(
                    track_id,
                    request_id,
                    "Track lookup failed",
                )));
                return;
            }
        };

        if !tokio::fs::try_exists(&track.file_path).await.unwrap_or(false) {
            self.handle.send(OutboundMessage::TrackInfo(TrackInfoReply::error(
                track_id,
                request_id,
                "File missing",
            )));
            return;
        }

        if !track.is_analyzed() {
            // Not yet analysed: queue at high priority with a track-info
            // hook so the push fires once basic features land.
            let hook = DeliveryHook {
                kind: HookKind::TrackInfo,
                engine_track_id: track_id,
                correlation_id: request_id.clone(),
            };
            if let Err(e) = self
                .queue
                .request_analysis(
                    &track,
                    AnalysisOptions::basic_only(),
                    JobPriority::High,
                    Some(hook),
                    false,
                )
                .await
            {
                tracing::error!(track_id = %track_id, error = %e, "Failed to queue analysis");
            }
            self.handle.send(OutboundMessage::TrackInfo(TrackInfoReply::error(
                track_id,
                request_id,
                "Analysis in progress",
            )));
            return;
        }

        // Reply first; the stem probe is strictly sequenced after it on this
        // task, which is what guarantees track-info-before-stems.
        self.handle.send_track_info(track_id, request_id.clone()).await;

        if stems {
            if let Err(e) = self.stems.request_for_engine(&track, request_id).await {
                tracing::error!(track_id = %track_id, error = %e, "Stem request failed");
            }
        }
    }

    async fn persist_cue(&self, deck: Deck, index: i64, position: f64) {
        let Some(track_id) = self.deck_track(deck).await else {
            tracing::warn!(
                deck = deck.as_str(),
                index,
                "Cue event for a deck with no loaded track"
            );
            return;
        };

        let cue = HotCue::user(track_id, index, position);
        if let Err(e) = hot_cues::upsert(&self.db, &cue).await {
            tracing::error!(track_id = %track_id, index, error = %e, "Failed to persist hot cue");
        } else {
            tracing::debug!(track_id = %track_id, index, position, "Hot cue persisted");
        }
    }

    async fn remove_cue(&self, deck: Deck, index: i64) {
        let Some(track_id) = self.deck_track(deck).await else {
            tracing::warn!(
                deck = deck.as_str(),
                index,
                "Cue removal for a deck with no loaded track"
            );
            return;
        };

        match hot_cues::remove(&self.db, track_id, index, HotCue::SOURCE_USER).await {
            Ok(removed) => {
                tracing::debug!(track_id = %track_id, index, removed, "Hot cue removed");
            }
            Err(e) => {
                tracing::error!(track_id = %track_id, index, error = %e, "Failed to remove hot cue");
            }
        }
    }

    /// Run the session until cancelled: connect, serve, back off, reconnect.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .expect("outbound receiver lock")
            .take()
            .expect("session started twice");

        tokio::spawn(async move {
            if let Err(e) = url::Url::parse(&self.config.url) {
                tracing::error!(url = %self.config.url, error = %e, "Invalid engine URL");
                return;
            }
            let mut delay = self.config.reconnect_delay;

            loop {
                if cancel.is_cancelled() {
                    break;
                }
                *self.state.write().await = SessionState::Connecting;

                let connected = tokio::time::timeout(
                    self.config.connect_timeout,
                    connect_async(self.config.url.as_str()),
                )
                .await;

                let ws = match connected {
                    Ok(Ok((ws, _response))) => ws,
                    Ok(Err(e)) => {
                        tracing::warn!(url = %self.config.url, error = %e, "Engine connect failed");
                        *self.state.write().await = SessionState::Disconnected;
                        if Self::backoff(&cancel, &mut delay, self.config.max_reconnect_delay).await
                        {
                            break;
                        }
                        continue;
                    }
                    Err(_) => {
                        tracing::warn!(url = %self.config.url, "Engine connect timed out");
                        *self.state.write().await = SessionState::Disconnected;
                        if Self::backoff(&cancel, &mut delay, self.config.max_reconnect_delay).await
                        {
                            break;
                        }
                        continue;
                    }
                };

                tracing::info!(url = %self.config.url, "Engine session connected");
                *self.state.write().await = SessionState::Connected;
                self.events.emit_lossy(MixdEvent::EngineConnected {
                    timestamp: mixd_common::time::now(),
                });
                delay = self.config.reconnect_delay;

                let (mut write, mut read) = ws.split();

                let identify = serde_json::to_string(&IdentifyMessage::new())
                    .expect("identify serializes");
                if write.send(Message::Text(identify)).await.is_err() {
                    *self.state.write().await = SessionState::Disconnected;
                    continue;
                }

                let mut ping = tokio::time::interval(self.config.ping_interval);
                ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ping.tick().await; // the first tick fires immediately

                let mut shutting_down = false;
                loop {
                    tokio::select! {
                        inbound = read.next() => {
                            match inbound {
                                Some(Ok(Message::Text(text))) => self.handle_inbound(&text).await,
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "Engine socket error");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                        outbound = outbound_rx.recv() => {
                            match outbound {
                                Some(message) => {
                                    let json = match serde_json::to_string(&message) {
                                        Ok(json) => json,
                                        Err(e) => {
                                            tracing::error!(error = %e, "Unserializable outbound message");
                                            continue;
                                        }
                                    };
                                    if write.send(Message::Text(json)).await.is_err() {
                                        break;
                                    }
                                }
                                None => {
                                    shutting_down = true;
                                    break;
                                }
                            }
                        }
                        _ = ping.tick() => {
                            if write.send(Message::Ping(Vec::new())).await.is_err() {
                                break;
                            }
                        }
                        _ = cancel.cancelled() => {
                            let _ = write.send(Message::Close(None)).await;
                            shutting_down = true;
                            break;
                        }
                    }
                }

                *self.state.write().await = SessionState::Disconnected;
                self.events.emit_lossy(MixdEvent::EngineDisconnected {
                    timestamp: mixd_common::time::now(),
                });

                if shutting_down || cancel.is_cancelled() {
                    break;
                }
                tracing::info!("Engine session closed, reconnecting");
                if Self::backoff(&cancel, &mut delay, self.config.max_reconnect_delay).await {
                    break;
                }
            }

            tracing::info!("Engine session stopped");
        })
    }

    /// Sleep the current back-off, doubling it up to the cap. Returns true
    /// when cancellation fired during the sleep.
    async fn backoff(
        cancel: &CancellationToken,
        delay: &mut Duration,
        max_delay: Duration,
    ) -> bool {
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(*delay) => false,
            _ = cancel.cancelled() => true,
        };
        *delay = (*delay * 2).min(max_delay);
        cancelled
    }
}
