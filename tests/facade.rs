//! Session lifecycle tests against the loopback backend.

use std::{collections::BTreeMap, time::Duration};

use rover_call::{
    engine::{
        loopback::{answer_for, failing_answer_for},
        Backend, EngineEvent, LoopbackControl, LoopbackProvider,
    },
    model::control::ControlMessage,
    util::init_log,
    ErrorKind, FacadeError, MediaAttributes, MediaConstraints, RemoteDescription, Session,
    SessionConfig, SessionContext, SessionState,
};

fn setup() -> (SessionContext, LoopbackControl) {
    init_log();
    let provider = LoopbackProvider::new();
    let control = provider.control();
    (SessionContext::new(provider), control)
}

fn config() -> SessionConfig {
    SessionConfig::with_servers(["stun:example"])
}

async fn connected(ctx: &SessionContext) -> Session {
    let session = ctx.open(config()).await.unwrap();
    let answer = answer_for(session.local_description()).unwrap();
    ctx.negotiate(&session, answer).await.unwrap();
    session
}

async fn wait_for_state(session: &Session, state: SessionState) {
    let mut rx = session.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .expect("state change in time")
        .expect("session alive");
}

#[tokio::test]
async fn open_negotiate_close() {
    let (ctx, control) = setup();
    assert_eq!(ctx.backend(), Backend::Loopback);

    let err = ctx.open(SessionConfig::default()).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(control.engines_created(), 0);

    let session = ctx.open(config()).await.unwrap();
    assert_eq!(session.state(), SessionState::Connecting);
    assert!(!session.local_description().as_str().is_empty());

    let answer = answer_for(session.local_description()).unwrap();
    ctx.negotiate(&session, answer.clone()).await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.remote_description().await, Some(answer));

    ctx.close(&session).await;
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(control.engines_released(), 1);
    assert_eq!(control.sent(), vec![ControlMessage::Bye(None)]);

    ctx.close(&session).await;
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(control.engines_released(), 1);
    assert_eq!(control.sent().len(), 1);
}

#[tokio::test]
async fn open_skips_unusable_servers() {
    let (ctx, _) = setup();
    let config = SessionConfig::with_servers(["gopher://nowhere", "turn:relay.example"]);
    assert!(matches!(
        ctx.open(config).await,
        Err(FacadeError::Configuration(_))
    ));

    let config = SessionConfig::with_servers(["gopher://nowhere", "stun:example"]);
    let session = ctx.open(config).await.unwrap();
    assert_eq!(session.state(), SessionState::Connecting);
}

#[tokio::test]
async fn open_reports_engine_refusal() {
    let (ctx, control) = setup();
    control.refuse_create(Some("no audio device"));

    let err = ctx.open(config()).await.err().unwrap();
    assert!(matches!(err, FacadeError::Configuration(ref m) if m == "no audio device"));
    assert!(ctx.active_sessions().is_empty());
}

#[tokio::test]
async fn negotiate_rejects_bad_answers_without_state_change() {
    let (ctx, control) = setup();
    let session = ctx.open(config()).await.unwrap();

    let err = ctx.negotiate(&session, "").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Negotiation);

    let err = ctx.negotiate(&session, "v=0 not json").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Negotiation);
    assert!(!err.is_retryable());
    assert_eq!(session.state(), SessionState::Connecting);
    assert_eq!(control.engines_released(), 0);

    let answer = answer_for(session.local_description()).unwrap();
    ctx.negotiate(&session, answer).await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn negotiate_outside_connecting_is_invalid() {
    let (ctx, _) = setup();
    let session = connected(&ctx).await;
    let answer = answer_for(session.local_description()).unwrap();

    let err = ctx.negotiate(&session, answer.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        FacadeError::InvalidState {
            operation: "negotiate",
            state: SessionState::Connected
        }
    ));

    ctx.close(&session).await;
    let err = ctx.negotiate(&session, answer).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn negotiate_timeout_leaves_session_retryable() {
    let (ctx, control) = setup();
    let mut config = config();
    config.negotiation_timeout_ms = 50;
    let session = ctx.open(config).await.unwrap();
    let answer = answer_for(session.local_description()).unwrap();

    control.set_negotiation_delay(Some(Duration::from_secs(1)));
    let err = ctx.negotiate(&session, answer.clone()).await.unwrap_err();
    assert!(matches!(err, FacadeError::Timeout(d) if d == Duration::from_millis(50)));
    assert!(err.is_retryable());
    assert_eq!(session.state(), SessionState::Connecting);
    assert_eq!(control.engines_released(), 0);

    control.set_negotiation_delay(None);
    ctx.negotiate(&session, answer).await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn cancelled_negotiation_closes_session() {
    let (ctx, control) = setup();
    let session = ctx.open(config()).await.unwrap();
    let answer = answer_for(session.local_description()).unwrap();

    control.set_negotiation_delay(Some(Duration::from_secs(5)));
    let outcome =
        tokio::time::timeout(Duration::from_millis(100), ctx.negotiate(&session, answer)).await;
    assert!(outcome.is_err());

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(
        session.info().close_reason.as_deref(),
        Some("negotiation cancelled")
    );
    assert_eq!(control.engines_released(), 1);
}

#[tokio::test]
async fn fatal_negotiation_fails_session() {
    let (ctx, control) = setup();
    let session = ctx.open(config()).await.unwrap();
    let answer = failing_answer_for(session.local_description(), "dtls handshake").unwrap();

    let err = ctx.negotiate(&session, answer).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.info().close_reason.as_deref(), Some("fatal transport error: dtls handshake"));
    assert_eq!(control.engines_released(), 1);

    // Closing a failed session changes nothing.
    ctx.close(&session).await;
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(control.engines_released(), 1);
}

#[tokio::test]
async fn transport_loss_fails_session() {
    let (ctx, control) = setup();
    let session = connected(&ctx).await;

    control.emit(EngineEvent::Disconnected);
    wait_for_state(&session, SessionState::Failed).await;

    assert_eq!(control.engines_released(), 1);
    assert!(ctx.active_sessions().is_empty());
    assert!(ctx.get(session.id()).is_none());
}

#[tokio::test]
async fn remote_hangup_closes_session() {
    let (ctx, control) = setup();
    let session = connected(&ctx).await;

    let remote = MediaAttributes {
        audio_muted: true,
        ..Default::default()
    };
    control.emit(EngineEvent::Remote(ControlMessage::Media(remote)));
    control.emit(EngineEvent::Remote(ControlMessage::Bye(Some("busy".into()))));
    wait_for_state(&session, SessionState::Closed).await;

    let info = session.info();
    assert_eq!(info.remote_media, Some(remote));
    assert_eq!(info.close_reason.as_deref(), Some("remote hung up: busy"));
}

#[tokio::test]
async fn concurrent_negotiations_are_serialized() {
    let (ctx, _) = setup();
    let session = ctx.open(config()).await.unwrap();
    let answer = answer_for(session.local_description()).unwrap();

    let (first, second) = tokio::join!(
        ctx.negotiate(&session, answer.clone()),
        ctx.negotiate(&session, answer)
    );

    assert!(first.is_ok());
    assert!(matches!(
        second,
        Err(FacadeError::InvalidState {
            state: SessionState::Connected,
            ..
        })
    ));
}

#[tokio::test]
async fn call_control_requires_connection() {
    let (ctx, control) = setup();
    let session = ctx.open(config()).await.unwrap();

    assert_eq!(session.mute().await.unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(session.hold().await.unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(session.send_dtmf('1').await.unwrap_err().kind(), ErrorKind::InvalidState);
    assert!(control.sent().is_empty());
    assert_eq!(session.media_attributes(), MediaAttributes::default());
}

#[tokio::test]
async fn media_changes_are_announced() {
    let (ctx, control) = setup();
    let session = connected(&ctx).await;

    session.mute().await.unwrap();
    session.hold().await.unwrap();
    session.unmute().await.unwrap();

    let media = session.media_attributes();
    assert!(!media.audio_muted);
    assert!(media.held);

    let sent = control.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(
        sent[0],
        ControlMessage::Media(MediaAttributes {
            audio_muted: true,
            ..Default::default()
        })
    );
    assert_eq!(sent[2], ControlMessage::Media(media));
    assert_eq!(session.stats().await.packets_sent, 3);
}

#[tokio::test]
async fn video_follows_media_constraints() {
    let (ctx, _) = setup();
    let session = connected(&ctx).await;
    let err = session.video_start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!session.media_attributes().video_sending);

    let mut config = config();
    config.media_constraints = MediaConstraints {
        audio: true,
        video: true,
    };
    let session = ctx.open(config).await.unwrap();
    assert!(session.media_attributes().video_sending);
    let answer = answer_for(session.local_description()).unwrap();
    ctx.negotiate(&session, answer).await.unwrap();

    session.video_stop().await.unwrap();
    session.video_mute().await.unwrap();
    session.video_start().await.unwrap();
    let media = session.media_attributes();
    assert!(media.video_sending);
    assert!(media.video_muted);
}

#[tokio::test]
async fn dtmf_tones_are_validated() {
    let (ctx, control) = setup();
    let session = connected(&ctx).await;

    for tone in ['x', ' ', 'E'] {
        let err = session.send_dtmf(tone).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "tone {:?}", tone);
    }
    assert!(control.sent().is_empty());

    session.send_dtmf('#').await.unwrap();
    session.send_dtmf('b').await.unwrap();
    assert_eq!(
        control.sent(),
        vec![ControlMessage::Dtmf('#'), ControlMessage::Dtmf('B')]
    );
}

#[tokio::test]
async fn custom_parameters_are_sent_on_demand() {
    let (ctx, control) = setup();
    let session = ctx.open(config()).await.unwrap();

    let parameters = BTreeMap::from([("room".to_string(), "42".to_string())]);
    session.set_custom_parameters(parameters.clone()).await.unwrap();
    assert_eq!(session.custom_parameters().await, parameters);
    assert_eq!(
        session.send_custom_parameters().await.unwrap_err().kind(),
        ErrorKind::InvalidState
    );

    let answer = answer_for(session.local_description()).unwrap();
    ctx.negotiate(&session, answer).await.unwrap();
    session.send_custom_parameters().await.unwrap();
    assert_eq!(
        control.sent(),
        vec![ControlMessage::CustomParameters(parameters)]
    );

    ctx.close(&session).await;
    assert!(session.set_custom_parameters(BTreeMap::new()).await.is_err());
}

#[tokio::test]
async fn contexts_keep_separate_registries() {
    let (first, _) = setup();
    let (second, _) = setup();

    let a = first.open(config()).await.unwrap();
    let b = connected(&first).await;
    let c = second.open(config()).await.unwrap();

    let ids: Vec<_> = first.active_sessions().iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![a.id(), b.id()]);
    assert!(first.get(c.id()).is_none());
    assert_eq!(second.active_sessions().len(), 1);

    let info = first.get(b.id()).unwrap().info();
    assert_eq!(info.state, SessionState::Connected);
    assert_eq!(info.backend, Backend::Loopback);

    first.close_with_reason(&a, Some("done".into())).await;
    assert_eq!(a.info().close_reason.as_deref(), Some("done"));
    assert_eq!(first.active_sessions().len(), 1);
}

#[tokio::test]
async fn subscribers_observe_every_transition() {
    let (ctx, _) = setup();
    let session = ctx.open(config()).await.unwrap();
    let mut rx = session.subscribe();
    assert_eq!(*rx.borrow_and_update(), SessionState::Connecting);

    let answer = answer_for(session.local_description()).unwrap();
    ctx.negotiate(&session, answer).await.unwrap();
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), SessionState::Connected);

    ctx.close(&session).await;
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), SessionState::Closed);
}

#[tokio::test]
async fn stats_survive_release() {
    let (ctx, _) = setup();
    let session = connected(&ctx).await;
    session.send_dtmf('5').await.unwrap();

    ctx.close(&session).await;
    // The goodbye is counted too.
    assert_eq!(session.stats().await.packets_sent, 2);
}

#[tokio::test]
async fn descriptions_accept_strings() {
    let (ctx, _) = setup();
    let session = ctx.open(config()).await.unwrap();
    let answer = answer_for(session.local_description()).unwrap();
    let owned: String = answer.as_str().to_string();
    ctx.negotiate(&session, RemoteDescription::from(owned)).await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn abandoned_open_releases_engine() {
    let (ctx, control) = setup();
    control.set_offer_delay(Some(Duration::from_secs(1)));

    let outcome = tokio::time::timeout(Duration::from_millis(100), ctx.open(config())).await;
    assert!(outcome.is_err());

    assert_eq!(control.engines_created(), 1);
    assert_eq!(control.engines_released(), 1);
    assert!(ctx.active_sessions().is_empty());
}

#[tokio::test]
async fn data_only_session() {
    let (ctx, control) = setup();
    let mut config = config();
    config.media_constraints = MediaConstraints {
        audio: false,
        video: false,
    };

    let session = ctx.open(config).await.unwrap();
    let answer = answer_for(session.local_description()).unwrap();
    ctx.negotiate(&session, answer).await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);

    let err = session.video_start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(session.media_attributes(), MediaAttributes::default());

    session.send_dtmf('9').await.unwrap();
    assert_eq!(control.sent(), vec![ControlMessage::Dtmf('9')]);
}
