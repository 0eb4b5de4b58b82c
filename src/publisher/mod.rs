//! Peer-connection signaling and lifecycle management
//!
//! One [`Publisher`] owns one local video source and one remote consumer.
//! It drives the offer/answer/ICE exchange over a [`SignalingChannel`],
//! buffers locally discovered candidates until the remote description is
//! known, and keeps the connection alive through a bounded reconnect
//! budget. Failed connections are rebuilt by a per-stream reconciliation
//! loop fed by engine state events, so a reconnect never runs inside the
//! engine callback itself.

pub mod candidates;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::config::WebRtcConfig;
use crate::error::{AppError, Result};
use crate::signaling::{IceCandidate, SessionIdentity, SignalingChannel};
use crate::source::{SourceConfig, VideoTrack};

use candidates::PendingCandidates;
use retry::RetryBudget;

/// Engine notifications consumed by the reconciliation loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineEvent {
    Connected,
    Failed,
}

/// Publishes one local video source to one remote consumer
pub struct Publisher<S> {
    ctx: Arc<Context<S>>,
    source: SourceConfig,
}

/// Everything a handshake attempt needs, shared with spawned tasks
struct Context<S> {
    identity: SessionIdentity,
    webrtc: WebRtcConfig,
    answer_timeout: Duration,
    signaling: Arc<S>,
    retries: RetryBudget,
}

impl<S: SignalingChannel> Publisher<S> {
    pub fn new(
        identity: SessionIdentity,
        webrtc: WebRtcConfig,
        answer_timeout: Duration,
        signaling: Arc<S>,
        source: SourceConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(Context {
                identity,
                webrtc,
                answer_timeout,
                signaling,
                retries: RetryBudget::default(),
            }),
            source,
        }
    }

    /// Run the stream: create the track, negotiate the session, then feed
    /// the track from the configured source until the process stops.
    ///
    /// Track allocation, the first handshake and its sends are fatal here;
    /// connection failures after that are absorbed by the reconnect budget
    /// and never surface through this call.
    pub async fn publish(&self) -> Result<()> {
        info!("publishing stream {}", self.ctx.identity);

        let track = self.source.create_track()?;
        debug!("created video track for {}", self.ctx.identity);

        self.connect(track.clone()).await?;
        debug!("created peer connection for {}", self.ctx.identity);

        self.source.stream(&track).await?;
        debug!("stream {} is over", self.ctx.identity);
        Ok(())
    }

    /// First handshake attempt, then hand the session to the
    /// reconciliation loop.
    async fn connect(&self, track: VideoTrack) -> Result<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = open_session(&self.ctx, &track, events_tx.clone()).await?;
        tokio::spawn(reconcile(
            self.ctx.clone(),
            track,
            session,
            events_tx,
            events_rx,
        ));
        Ok(())
    }
}

/// One live peer-connection attempt. Closed and replaced wholesale on
/// reconnect, never reused.
struct Session {
    pc: Arc<RTCPeerConnection>,
}

impl Session {
    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            error!("closing peer connection: {}", e);
        } else {
            info!("peer connection closed");
        }
    }
}

/// Per-stream reconciliation loop applying the retry policy.
///
/// Runs until the budget is exhausted; a stream whose handshake aborted
/// gracefully simply never receives events and idles here until shutdown.
async fn reconcile<S: SignalingChannel>(
    ctx: Arc<Context<S>>,
    track: VideoTrack,
    mut session: Session,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    mut events_rx: mpsc::UnboundedReceiver<EngineEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            EngineEvent::Connected => {
                // success clears the budget, retried or not
                ctx.retries.record_connected();
                info!("stream {} connected", ctx.identity);
            }
            EngineEvent::Failed => {
                session.close().await;
                match ctx.retries.register_failure() {
                    Some(attempt) => {
                        info!(
                            "retrying peer connection for {} (attempt {})",
                            ctx.identity, attempt
                        );
                        match open_session(&ctx, &track, events_tx.clone()).await {
                            Ok(next) => session = next,
                            Err(e) => error!(
                                "could not recreate peer connection for {}: {}",
                                ctx.identity, e
                            ),
                        }
                    }
                    None => {
                        warn!(
                            "stream {} exhausted its reconnect budget, giving up",
                            ctx.identity
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// One handshake attempt: open an engine session bound to the track,
/// exchange offer/answer, then flush buffered candidates and start the
/// inbound-candidate loop.
async fn open_session<S: SignalingChannel>(
    ctx: &Arc<Context<S>>,
    track: &VideoTrack,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> Result<Session> {
    let mut answers = ctx.signaling.answers().await?;
    let inbound = ctx.signaling.candidates().await?;

    let pc = Arc::new(ctx.new_peer_connection().await?);

    let sender = pc
        .add_track(track.track_local())
        .await
        .map_err(|e| AppError::WebRtc(format!("could not add track: {}", e)))?;
    tokio::spawn(drain_rtcp(sender));

    let pending = Arc::new(PendingCandidates::default());
    register_candidate_handler(ctx.clone(), &pc, pending.clone());
    register_state_handler(&pc, ctx.identity.clone(), events);

    let offer = pc
        .create_offer(None)
        .await
        .map_err(|e| AppError::WebRtc(format!("could not create offer: {}", e)))?;
    pc.set_local_description(offer)
        .await
        .map_err(|e| AppError::WebRtc(format!("could not set local description: {}", e)))?;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| AppError::WebRtc("local description missing after set".to_string()))?;
    ctx.signaling
        .send_offer(&local)
        .await
        .map_err(|e| AppError::Signaling(format!("could not send offer: {}", e)))?;
    debug!("sent local description offer for {}", ctx.identity);

    let answer = match timeout(ctx.answer_timeout, answers.recv()).await {
        Err(_) => return Err(AppError::AnswerTimeout(ctx.answer_timeout.as_secs())),
        Ok(None) => {
            // The remote side withdrew without answering. Not a failure;
            // the attempt just ends here.
            debug!("answer channel for {} closed without a value", ctx.identity);
            return Ok(Session { pc });
        }
        Ok(Some(answer)) => answer,
    };

    pc.set_remote_description(answer)
        .await
        .map_err(|e| AppError::WebRtc(format!("could not set remote description: {}", e)))?;
    debug!("received remote answer for {}", ctx.identity);

    // Remote candidates may only reach the engine from this point on
    tokio::spawn(apply_remote_candidates(pc.clone(), inbound));

    let sent = flush_pending(ctx.signaling.as_ref(), &pending).await?;
    if sent > 0 {
        debug!("sent {} buffered ICE candidates for {}", sent, ctx.identity);
    }

    Ok(Session { pc })
}

impl<S: SignalingChannel> Context<S> {
    async fn new_peer_connection(&self) -> Result<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("could not register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("could not register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![];
        if !self.webrtc.ice_server.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: vec![self.webrtc.ice_server.clone()],
                username: self.webrtc.username.clone(),
                credential: self.webrtc.credential.clone(),
                ..Default::default()
            });
        }

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map_err(|e| AppError::WebRtc(format!("could not create peer connection: {}", e)))
    }
}

/// Route every locally discovered candidate either into the pending buffer
/// (remote description not yet applied) or straight out through the
/// signaling channel.
fn register_candidate_handler<S: SignalingChannel>(
    ctx: Arc<Context<S>>,
    pc: &Arc<RTCPeerConnection>,
    pending: Arc<PendingCandidates>,
) {
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let ctx = ctx.clone();
        let pending = pending.clone();

        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    error!("could not serialize ICE candidate: {}", e);
                    return;
                }
            };

            // buffered candidates are sent by the handshake path after
            // the remote description lands
            let Some(candidate) = pending.push(IceCandidate::from(init)).await else {
                return;
            };

            if let Err(e) = ctx.signaling.send_candidate(&candidate).await {
                error!("could not send candidate: {}", e);
            } else {
                debug!("sent an ICE candidate for {}", ctx.identity);
            }
        })
    }));
}

/// Forward engine state transitions as events to the reconciliation loop
fn register_state_handler(
    pc: &Arc<RTCPeerConnection>,
    identity: SessionIdentity,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let identity = identity.clone();
        let events = events.clone();

        Box::pin(async move {
            debug!("connection state for {} has changed: {}", identity, state);
            match state {
                RTCPeerConnectionState::Connected => {
                    let _ = events.send(EngineEvent::Connected);
                }
                RTCPeerConnectionState::Failed => {
                    let _ = events.send(EngineEvent::Failed);
                }
                _ => {}
            }
        })
    }));
}

/// Drain the buffer in discovery order, sending each candidate through the
/// signaling channel. A send failure is fatal to the handshake attempt.
async fn flush_pending<S: SignalingChannel>(
    signaling: &S,
    pending: &PendingCandidates,
) -> Result<usize> {
    let mut sent = 0;
    for candidate in pending.flush().await {
        signaling
            .send_candidate(&candidate)
            .await
            .map_err(|e| AppError::Signaling(format!("could not send buffered candidate: {}", e)))?;
        sent += 1;
    }
    Ok(sent)
}

/// Apply inbound remote candidates until the signaling stream closes
async fn apply_remote_candidates(
    pc: Arc<RTCPeerConnection>,
    mut inbound: mpsc::Receiver<IceCandidate>,
) {
    while let Some(candidate) = inbound.recv().await {
        if let Err(e) = pc.add_ice_candidate(candidate.into()).await {
            error!("could not add ICE candidate: {}", e);
            continue;
        }
        debug!("added a remote ICE candidate");
    }
    debug!("remote candidate stream closed");
}

/// Read incoming RTCP so interceptor feedback (NACK and friends) keeps
/// flowing. Ends when the sender shuts down; any other read error is
/// logged and ends the loop without restarting it.
async fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    let mut buf = vec![0u8; 1500];
    loop {
        match sender.read(&mut buf).await {
            Ok(_) => {}
            Err(webrtc::Error::ErrClosedPipe) => {
                if let Err(e) = sender.stop().await {
                    debug!("stopping RTP sender: {}", e);
                }
                return;
            }
            Err(e) => {
                error!("rtcp read: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

    use crate::source::SourceKind;

    #[derive(Clone, Copy, PartialEq)]
    enum AnswerMode {
        /// answers() ends immediately with no value
        Close,
        /// a remote peer answers the offer
        Answer,
        /// the answer channel stays open but never yields
        Silent,
    }

    struct FakeSignaling {
        mode: AnswerMode,
        offers: Mutex<Vec<RTCSessionDescription>>,
        candidates_sent: Mutex<Vec<IceCandidate>>,
        answer_tx: Mutex<Option<mpsc::Sender<RTCSessionDescription>>>,
        remote: Mutex<Option<Arc<RTCPeerConnection>>>,
    }

    impl FakeSignaling {
        fn new(mode: AnswerMode) -> Self {
            Self {
                mode,
                offers: Mutex::new(vec![]),
                candidates_sent: Mutex::new(vec![]),
                answer_tx: Mutex::new(None),
                remote: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl SignalingChannel for FakeSignaling {
        async fn send_offer(&self, description: &RTCSessionDescription) -> Result<()> {
            self.offers.lock().await.push(description.clone());

            if self.mode == AnswerMode::Answer {
                let remote = remote_peer().await;
                remote
                    .set_remote_description(description.clone())
                    .await
                    .expect("remote rejects offer");
                let answer = remote.create_answer(None).await.expect("create answer");
                remote
                    .set_local_description(answer)
                    .await
                    .expect("remote local description");
                let local = remote
                    .local_description()
                    .await
                    .expect("remote description missing");

                if let Some(tx) = self.answer_tx.lock().await.take() {
                    let _ = tx.send(local).await;
                }
                *self.remote.lock().await = Some(remote);
            }
            Ok(())
        }

        async fn answers(&self) -> Result<mpsc::Receiver<RTCSessionDescription>> {
            let (tx, rx) = mpsc::channel(1);
            match self.mode {
                AnswerMode::Close => drop(tx),
                _ => *self.answer_tx.lock().await = Some(tx),
            }
            Ok(rx)
        }

        async fn send_candidate(&self, candidate: &IceCandidate) -> Result<()> {
            self.candidates_sent.lock().await.push(candidate.clone());
            Ok(())
        }

        async fn candidates(&self) -> Result<mpsc::Receiver<IceCandidate>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    async fn remote_peer() -> Arc<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        )
    }

    fn test_context(signaling: Arc<FakeSignaling>, ceiling: u32) -> Arc<Context<FakeSignaling>> {
        Arc::new(Context {
            identity: SessionIdentity::new("test-stream", SourceKind::Rtp),
            webrtc: WebRtcConfig {
                ice_server: String::new(),
                username: String::new(),
                credential: String::new(),
            },
            answer_timeout: Duration::from_secs(5),
            signaling,
            retries: RetryBudget::new(ceiling),
        })
    }

    fn test_track() -> VideoTrack {
        SourceConfig::Rtp {
            host: "127.0.0.1".to_string(),
            port: 0,
        }
        .create_track()
        .unwrap()
    }

    fn test_candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 UDP 2013266431 10.0.0.7 5000{} typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn closed_answer_channel_aborts_gracefully() {
        let signaling = Arc::new(FakeSignaling::new(AnswerMode::Close));
        let ctx = test_context(signaling.clone(), retry::MAX_RETRY);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let session = open_session(&ctx, &test_track(), events_tx).await.unwrap();

        // no remote description was applied and no candidate was sent
        assert!(session.pc.remote_description().await.is_none());
        assert_eq!(signaling.offers.lock().await.len(), 1);
        assert!(signaling.candidates_sent.lock().await.is_empty());
        session.close().await;
    }

    #[tokio::test]
    async fn handshake_applies_the_remote_answer() {
        let signaling = Arc::new(FakeSignaling::new(AnswerMode::Answer));
        let ctx = test_context(signaling.clone(), retry::MAX_RETRY);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let session = open_session(&ctx, &test_track(), events_tx).await.unwrap();

        assert!(session.pc.remote_description().await.is_some());
        assert_eq!(signaling.offers.lock().await.len(), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn silent_answer_channel_times_out() {
        let signaling = Arc::new(FakeSignaling::new(AnswerMode::Silent));
        let mut ctx = test_context(signaling, retry::MAX_RETRY);
        Arc::get_mut(&mut ctx).unwrap().answer_timeout = Duration::from_millis(200);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let result = open_session(&ctx, &test_track(), events_tx).await;

        assert!(matches!(result, Err(AppError::AnswerTimeout(_))));
    }

    #[tokio::test]
    async fn buffered_candidates_are_flushed_in_discovery_order() {
        let signaling = FakeSignaling::new(AnswerMode::Close);
        let pending = PendingCandidates::default();
        for n in 0..3 {
            pending.push(test_candidate(n)).await;
        }

        let sent = flush_pending(&signaling, &pending).await.unwrap();

        assert_eq!(sent, 3);
        assert_eq!(pending.buffered().await, 0);
        let recorded = signaling.candidates_sent.lock().await;
        let order: Vec<String> = recorded.iter().map(|c| c.candidate.clone()).collect();
        assert_eq!(
            order,
            vec![
                test_candidate(0).candidate,
                test_candidate(1).candidate,
                test_candidate(2).candidate
            ]
        );
    }

    #[tokio::test]
    async fn reconciliation_retries_until_the_budget_is_exhausted() {
        let signaling = Arc::new(FakeSignaling::new(AnswerMode::Close));
        let ctx = test_context(signaling.clone(), 1);
        let track = test_track();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = open_session(&ctx, &track, events_tx.clone()).await.unwrap();

        let handle = tokio::spawn(reconcile(
            ctx.clone(),
            track,
            session,
            events_tx.clone(),
            events_rx,
        ));

        // first failure grants a retry, the second exceeds the ceiling
        events_tx.send(EngineEvent::Failed).unwrap();
        events_tx.send(EngineEvent::Failed).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("reconciliation loop should give up")
            .unwrap();

        assert_eq!(ctx.retries.consecutive_failures(), 2);
        // the initial handshake plus exactly one retry sent offers
        assert_eq!(signaling.offers.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn connected_event_clears_the_retry_budget() {
        let signaling = Arc::new(FakeSignaling::new(AnswerMode::Close));
        let ctx = test_context(signaling.clone(), 1);
        let track = test_track();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = open_session(&ctx, &track, events_tx.clone()).await.unwrap();

        // one failure already on the books; without the reset the first
        // Failed below would exhaust the budget with no retry
        ctx.retries.register_failure();

        let handle = tokio::spawn(reconcile(
            ctx.clone(),
            track,
            session,
            events_tx.clone(),
            events_rx,
        ));

        events_tx.send(EngineEvent::Connected).unwrap();
        events_tx.send(EngineEvent::Failed).unwrap();
        events_tx.send(EngineEvent::Failed).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("reconciliation loop should give up")
            .unwrap();

        // the reset made room for one retried handshake
        assert_eq!(signaling.offers.lock().await.len(), 2);
    }
}
