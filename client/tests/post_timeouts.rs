/// Post acknowledgment and request-timeout scenarios driven by the coarse
/// dispatch-time timer scan.

mod common;

use std::time::Duration;

use common::*;
use feedwatch_client::{StatusCause, StreamStatus, WatchlistError, WatchlistEvent};
use feedwatch_shared::{
    LoginFeatures, Message, NakCode, Payload, PostMsg, RequestMsg, WatchlistConfig,
};

#[test]
fn acknowledged_post_surfaces_a_positive_ack() {
    let mut fixture = Fixture::new(WatchlistConfig::default());
    fixture.establish_session();
    let (item, id) = fixture.open_item("X");

    fixture
        .watchlist
        .submit_post(item, PostMsg::new(9, Payload::Opaque(vec![1])))
        .unwrap();

    let sent = fixture.remote.take_sent();
    let posted = sent
        .iter()
        .find_map(|message| match message {
            Message::Post(post) => Some(post),
            _ => None,
        })
        .expect("post went to the wire");
    assert_eq!(posted.stream_id, id);

    fixture.remote.push_msg(post_ack(id, 9, None));
    let events = fixture.dispatch();

    assert!(events.iter().any(|event| matches!(
        event,
        WatchlistEvent::Ack(ack)
            if ack.handle == item && ack.post_id == 9 && ack.nak_code.is_none()
    )));
}

#[test]
fn provider_nak_is_passed_through() {
    let mut fixture = Fixture::new(WatchlistConfig::default());
    fixture.establish_session();
    let (item, id) = fixture.open_item("X");

    fixture
        .watchlist
        .submit_post(item, PostMsg::new(9, Payload::None))
        .unwrap();
    fixture
        .remote
        .push_msg(post_ack(id, 9, Some(NakCode::DeniedBySource)));
    let events = fixture.dispatch();

    assert!(events.iter().any(|event| matches!(
        event,
        WatchlistEvent::Ack(ack)
            if ack.handle == item && ack.nak_code == Some(NakCode::DeniedBySource)
    )));
}

#[test]
fn unacknowledged_post_naks_after_the_timeout() {
    let mut fixture = Fixture::new(WatchlistConfig {
        post_ack_timeout: Duration::from_millis(100),
        ..WatchlistConfig::default()
    });
    fixture.establish_session();
    let (item, _) = fixture.open_item("X");

    fixture
        .watchlist
        .submit_post(item, PostMsg::new(9, Payload::None))
        .unwrap();

    // nothing before the interval elapses
    let events = fixture.dispatch();
    assert!(!events
        .iter()
        .any(|event| matches!(event, WatchlistEvent::Ack(_))));

    std::thread::sleep(Duration::from_millis(120));
    let events = fixture.dispatch();

    let naks: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            WatchlistEvent::Ack(ack) if ack.handle == item => Some(ack),
            _ => None,
        })
        .collect();
    assert_eq!(naks.len(), 1, "exactly one synthesized negative ack");
    assert_eq!(naks[0].nak_code, Some(NakCode::NoResponse));

    // the owning stream is unaffected
    assert_eq!(fixture.watchlist.stream_status(item), Some(StreamStatus::Open));

    // and the deadline is consumed
    assert!(fixture.dispatch().is_empty());
}

#[test]
fn request_timeout_closes_an_unanswered_stream() {
    let mut fixture = Fixture::new(WatchlistConfig {
        request_timeout: Duration::from_millis(50),
        ..WatchlistConfig::default()
    });
    fixture.establish_session();

    let item = fixture
        .watchlist
        .submit(RequestMsg::market_price(feed(), "X"))
        .unwrap();
    assert!(!requests_of(&fixture.remote.take_sent()).is_empty());

    std::thread::sleep(Duration::from_millis(70));
    let events = fixture.dispatch();

    assert!(events.iter().any(|event| matches!(
        event,
        WatchlistEvent::Status(status)
            if status.handle == item && status.cause == StatusCause::RequestTimeout
    )));
    assert_eq!(fixture.watchlist.stream_status(item), None);
}

#[test]
fn answered_requests_never_time_out() {
    let mut fixture = Fixture::new(WatchlistConfig {
        request_timeout: Duration::from_millis(50),
        ..WatchlistConfig::default()
    });
    fixture.establish_session();
    let (item, _) = fixture.open_item("X");

    std::thread::sleep(Duration::from_millis(70));
    let events = fixture.dispatch();

    assert!(events.is_empty());
    assert_eq!(fixture.watchlist.stream_status(item), Some(StreamStatus::Open));
}

#[test]
fn zero_request_timeout_disables_the_clock() {
    let mut fixture = Fixture::new(WatchlistConfig {
        request_timeout: Duration::ZERO,
        ..WatchlistConfig::default()
    });
    fixture.establish_session();

    let item = fixture
        .watchlist
        .submit(RequestMsg::market_price(feed(), "X"))
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    fixture.dispatch();

    assert_eq!(fixture.watchlist.stream_status(item), Some(StreamStatus::Pending));
}

#[test]
fn posting_requires_the_negotiated_feature() {
    let mut fixture = Fixture::new(WatchlistConfig::default());
    fixture.establish_session_with(
        LoginFeatures {
            supports_batch_requests: true,
            supports_view_requests: true,
            supports_posting: false,
        },
        vec![default_service()],
    );
    let (item, _) = fixture.open_item("X");

    let result = fixture
        .watchlist
        .submit_post(item, PostMsg::new(9, Payload::None));

    assert_eq!(
        result,
        Err(WatchlistError::FeatureUnavailable { feature: "posting" })
    );
}

#[test]
fn posts_need_an_open_stream() {
    let mut fixture = Fixture::new(WatchlistConfig::default());
    fixture.establish_session();

    let item = fixture
        .watchlist
        .submit(RequestMsg::market_price(feed(), "X"))
        .unwrap();

    // still pending: no refresh has arrived
    let result = fixture
        .watchlist
        .submit_post(item, PostMsg::new(9, Payload::None));

    assert_eq!(result, Err(WatchlistError::StreamNotOpen));
}
