/// Session establishment scenarios: the login stream gates everything
/// else, and its failure takes the whole session down with it.

mod common;

use std::time::Duration;

use common::*;
use feedwatch_client::{
    ChannelEventKind, LoginState, StatusCause, StreamStatus, WatchlistError, WatchlistEvent,
};
use feedwatch_shared::{
    DomainType, LoginFeatures, LoginRequest, Message, RequestMsg, WatchlistConfig,
};

#[test]
fn login_refresh_establishes_session() {
    let mut fixture = Fixture::new(WatchlistConfig::default());

    let login = fixture.watchlist.login(LoginRequest::new("user")).unwrap();
    fixture.remote.channel_up();
    fixture.remote.push_msg(login_accept(LoginFeatures::all()));
    let events = fixture.dispatch();

    assert_eq!(fixture.watchlist.login_state(), LoginState::LoggedIn);
    assert_eq!(fixture.watchlist.stream_status(login), Some(StreamStatus::Open));

    let refreshes: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            WatchlistEvent::Refresh(refresh) => Some(refresh),
            _ => None,
        })
        .collect();
    assert_eq!(refreshes.len(), 1, "exactly one login refresh event");
    assert_eq!(refreshes[0].handle, login);
    assert!(events.iter().any(|event| matches!(
        event,
        WatchlistEvent::Channel(channel) if channel.kind == ChannelEventKind::Up
    )));

    // the directory request follows the login automatically
    let sent = fixture.remote.take_sent();
    let requests = requests_of(&sent);
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].domain, DomainType::Login);
    assert_eq!(requests[1].domain, DomainType::Directory);
}

#[test]
fn item_traffic_is_held_until_login_completes() {
    let mut fixture = Fixture::new(WatchlistConfig::default());

    fixture.watchlist.login(LoginRequest::new("user")).unwrap();
    let item = fixture
        .watchlist
        .submit(RequestMsg::market_price(feed(), "X"))
        .unwrap();
    fixture.remote.channel_up();
    fixture.dispatch();

    // channel is up but the session is not; the item must stay off the wire
    assert_eq!(fixture.watchlist.login_state(), LoginState::LoginPending);
    assert_eq!(fixture.watchlist.stream_status(item), Some(StreamStatus::Pending));
    let sent = fixture.remote.take_sent();
    assert!(requests_of(&sent)
        .iter()
        .all(|request| request.domain == DomainType::Login));

    fixture.remote.push_msg(login_accept(LoginFeatures::all()));
    fixture.remote.push_msg(directory_refresh(vec![default_service()]));
    fixture.dispatch();

    let sent = fixture.remote.take_sent();
    assert!(requests_of(&sent)
        .iter()
        .any(|request| request.key.name == "X"));
}

#[test]
fn login_rejection_closes_every_stream() {
    let mut fixture = Fixture::new(WatchlistConfig::default());

    let login = fixture.watchlist.login(LoginRequest::new("user")).unwrap();
    let item = fixture
        .watchlist
        .submit(RequestMsg::market_price(feed(), "X"))
        .unwrap();
    fixture.remote.channel_up();
    fixture.remote.push_msg(login_reject("Not entitled"));
    let events = fixture.dispatch();

    let statuses: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            WatchlistEvent::Status(status) => Some(status),
            _ => None,
        })
        .collect();
    assert!(statuses
        .iter()
        .any(|status| status.handle == login && status.cause == StatusCause::Provider));
    assert!(statuses
        .iter()
        .any(|status| status.handle == item && status.cause == StatusCause::SessionClosed));
    assert!(events.iter().any(|event| matches!(
        event,
        WatchlistEvent::Channel(channel) if channel.kind == ChannelEventKind::Closed
    )));

    assert_eq!(fixture.watchlist.login_state(), LoginState::NotLoggedIn);
    assert_eq!(fixture.watchlist.stream_status(login), None);
    assert_eq!(fixture.watchlist.stream_status(item), None);
}

#[test]
fn login_timeout_behaves_like_rejection() {
    let mut fixture = Fixture::new(WatchlistConfig {
        request_timeout: Duration::from_millis(50),
        ..WatchlistConfig::default()
    });

    let login = fixture.watchlist.login(LoginRequest::new("user")).unwrap();
    let item = fixture
        .watchlist
        .submit(RequestMsg::market_price(feed(), "X"))
        .unwrap();
    fixture.remote.channel_up();
    fixture.dispatch();

    std::thread::sleep(Duration::from_millis(70));
    let events = fixture.dispatch();

    assert!(events.iter().any(|event| matches!(
        event,
        WatchlistEvent::Status(status)
            if status.handle == login && status.cause == StatusCause::RequestTimeout
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        WatchlistEvent::Status(status)
            if status.handle == item && status.cause == StatusCause::SessionClosed
    )));
    assert_eq!(fixture.watchlist.stream_status(login), None);
    assert_eq!(fixture.watchlist.stream_status(item), None);
}

#[test]
fn login_reissue_keeps_the_handle() {
    let mut fixture = Fixture::new(WatchlistConfig::default());
    let login = fixture.establish_session();

    let mut reissue = LoginRequest::new("user");
    reissue.application_id = "42".to_string();
    let handle = fixture.watchlist.login(reissue).unwrap();

    assert_eq!(handle, login);
    let sent = fixture.remote.take_sent();
    assert_eq!(requests_of(&sent).len(), 1, "one reissued login request");
}

#[test]
fn login_reissue_cannot_change_user() {
    let mut fixture = Fixture::new(WatchlistConfig::default());
    fixture.establish_session();

    let result = fixture.watchlist.login(LoginRequest::new("other-user"));

    assert_eq!(result, Err(WatchlistError::LoginIdentityChange));
}

#[test]
fn negotiated_features_are_exposed() {
    let mut fixture = Fixture::new(WatchlistConfig::default());
    fixture.establish_session_with(
        LoginFeatures {
            supports_batch_requests: false,
            supports_view_requests: true,
            supports_posting: false,
        },
        vec![default_service()],
    );

    let features = fixture.watchlist.features();
    assert!(!features.supports_batch_requests);
    assert!(features.supports_view_requests);
    assert!(!features.supports_posting);
}

#[test]
fn logout_closes_dependent_streams() {
    let mut fixture = Fixture::new(WatchlistConfig::default());
    let login = fixture.establish_session();
    let (item, _) = fixture.open_item("X");

    fixture.watchlist.unregister(login).unwrap();
    let events = fixture.dispatch();

    assert!(events.iter().any(|event| matches!(
        event,
        WatchlistEvent::Status(status)
            if status.handle == item && status.cause == StatusCause::SessionClosed
    )));
    assert_eq!(fixture.watchlist.stream_status(item), None);
    assert_eq!(fixture.watchlist.login_state(), LoginState::NotLoggedIn);

    let sent = fixture.remote.take_sent();
    assert!(sent
        .iter()
        .any(|message| matches!(message, Message::Close(close) if close.stream_id == 1)));
}
