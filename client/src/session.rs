use std::time::Duration;

use feedwatch_shared::{
    DomainType, ItemKey, LoginFeatures, LoginRequest, RequestMsg, Timer, LOGIN_STREAM_ID,
};

use crate::handle::StreamHandle;

/// Login progress on the current channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginState {
    NotLoggedIn,
    /// The login request went to the wire; waiting for the refresh.
    LoginPending,
    LoggedIn,
    /// The session was established once and the channel dropped; the login
    /// will be replayed when the channel returns.
    LoginRecovering,
}

/// The single login stream per channel. Gates all other traffic: nothing
/// else leaves `Pending` until the session reaches `LoggedIn`.
pub(crate) struct LoginSession {
    pub state: LoginState,
    pub handle: Option<StreamHandle>,
    /// Last submitted parameters, replayed verbatim on reconnection.
    pub request: Option<LoginRequest>,
    pub features: LoginFeatures,
    pub timer: Timer,
}

impl LoginSession {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            state: LoginState::NotLoggedIn,
            handle: None,
            request: None,
            features: LoginFeatures::default(),
            timer: Timer::new(request_timeout),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.state == LoginState::LoggedIn
    }

    /// The wire request for the pending login parameters, if any were
    /// submitted.
    pub fn wire_request(&self) -> Option<RequestMsg> {
        let credentials = self.request.clone()?;
        Some(RequestMsg {
            stream_id: LOGIN_STREAM_ID,
            domain: DomainType::Login,
            key: ItemKey {
                service: None,
                name: credentials.user_name.clone(),
            },
            streaming: true,
            view: None,
            batch_items: Vec::new(),
            filter: 0,
            credentials: Some(credentials),
        })
    }

    /// Channel loss: negotiated capabilities are void, parameters are kept
    /// for replay.
    pub fn reset_for_reconnect(&mut self) {
        self.timer.disarm();
        self.features = LoginFeatures::default();
        self.state = match self.state {
            LoginState::NotLoggedIn => LoginState::NotLoggedIn,
            _ => {
                if self.request.is_some() {
                    LoginState::LoginRecovering
                } else {
                    LoginState::NotLoggedIn
                }
            }
        };
    }

    /// Session teardown after rejection, timeout or logout.
    pub fn reset(&mut self) {
        self.state = LoginState::NotLoggedIn;
        self.handle = None;
        self.request = None;
        self.features = LoginFeatures::default();
        self.timer.disarm();
    }
}
