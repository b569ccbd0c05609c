//! Per-connection session state machine.
//!
//! ```text
//! Disconnected -Negotiate-> Negotiating -> Negotiated -Establish-> Establishing -> Established
//!      any state --Terminate / violation / timeout / shutdown--> Terminated
//! ```
//!
//! [`Session`] never touches a socket. Inbound messages and timer checks return
//! [`SessionAction`]s which the server carries out, so the whole protocol can be
//! exercised without I/O.

use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::messages::{
    FlowType, Inbound, MdRejectReason, Outbound, RejectCode, SubscriptionType, TerminationCode,
};
use crate::engine::types::InstrumentId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    /// Credentials under validation.
    Negotiating,
    Negotiated,
    /// Keepalive under validation.
    Establishing,
    Established,
    Terminated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Static allow-list. An empty list admits everyone.
#[derive(Clone, Debug, Default)]
pub struct CredentialStore {
    allowed: AHashMap<String, String>,
}

impl CredentialStore {
    pub fn new<I: IntoIterator<Item = Credential>>(credentials: I) -> Self {
        CredentialStore { allowed: credentials.into_iter().map(|c| (c.username, c.password)).collect() }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        self.allowed.get(username).is_some_and(|p| p == password)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Subscription {
    #[default]
    None,
    All,
    Instruments(AHashSet<InstrumentId>),
}

impl Subscription {
    pub fn matches(&self, id: InstrumentId) -> bool {
        match self {
            Subscription::None => false,
            Subscription::All => true,
            Subscription::Instruments(ids) => ids.contains(&id),
        }
    }

    fn subscribe(&mut self, instruments: &[InstrumentId]) {
        if instruments.is_empty() {
            *self = Subscription::All;
            return;
        }
        match self {
            Subscription::All => {}
            Subscription::Instruments(ids) => ids.extend(instruments.iter().copied()),
            Subscription::None => *self = Subscription::Instruments(instruments.iter().copied().collect()),
        }
    }

    fn unsubscribe(&mut self, instruments: &[InstrumentId]) {
        if instruments.is_empty() {
            *self = Subscription::None;
            return;
        }
        if let Subscription::Instruments(ids) = self {
            for id in instruments {
                ids.remove(id);
            }
            if ids.is_empty() {
                *self = Subscription::None;
            }
        }
    }
}

/// Work the server performs on a session's behalf.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionAction {
    Send(Outbound),
    /// Full refresh for each instrument; empty means every instrument.
    SendSnapshots { request_id: u32, instruments: Vec<InstrumentId> },
    /// Security definitions; empty means every instrument.
    SendDefinitions { request_id: u32, instruments: Vec<InstrumentId> },
    Close,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    uuid: u64,
    state: SessionState,
    flow: Option<FlowType>,
    keepalive: Duration,
    last_inbound: Instant,
    last_outbound: Instant,
    subscription: Subscription,
    next_seq: u64,
    termination: Option<TerminationCode>,
}

impl Session {
    pub fn new(id: String, default_keepalive: Duration, now: Instant) -> Self {
        Session {
            id,
            uuid: 0,
            state: SessionState::Disconnected,
            flow: None,
            keepalive: default_keepalive,
            last_inbound: now,
            last_outbound: now,
            subscription: Subscription::None,
            next_seq: 1,
            termination: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn flow(&self) -> Option<FlowType> {
        self.flow
    }

    pub fn keepalive(&self) -> Duration {
        self.keepalive
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn termination(&self) -> Option<TerminationCode> {
        self.termination
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    /// Established and subscribed to `id`.
    pub fn wants(&self, id: InstrumentId) -> bool {
        self.is_established() && self.subscription.matches(id)
    }

    /// Sequence number for the next application message; consumes it.
    pub fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn note_sent(&mut self, now: Instant) {
        self.last_outbound = now;
    }

    pub fn handle(
        &mut self,
        msg: Inbound,
        now: Instant,
        credentials: &CredentialStore,
        is_known: impl Fn(InstrumentId) -> bool,
    ) -> Vec<SessionAction> {
        if self.is_terminated() {
            return Vec::new();
        }
        self.last_inbound = now;
        debug!(session = %self.id, state = ?self.state, message = msg.kind(), "Inbound message");

        match msg {
            Inbound::Negotiate { uuid, timestamp, flow, username, password } => {
                if self.state != SessionState::Disconnected {
                    return self.violation("Negotiate after negotiation");
                }
                self.state = SessionState::Negotiating;
                self.uuid = uuid;
                if !credentials.verify(&username, &password) {
                    warn!(session = %self.id, %username, "Negotiation rejected: bad credentials");
                    self.terminated(TerminationCode::AuthenticationFailed);
                    let reject = Outbound::NegotiationReject {
                        uuid,
                        request_timestamp: timestamp,
                        code: RejectCode::Credentials,
                        reason: "Invalid credentials".into(),
                    };
                    return vec![SessionAction::Send(reject), SessionAction::Close];
                }
                self.flow = Some(flow);
                self.state = SessionState::Negotiated;
                info!(session = %self.id, %username, uuid, "Session negotiated");
                vec![SessionAction::Send(Outbound::NegotiationResponse { uuid, request_timestamp: timestamp })]
            }
            Inbound::Establish { uuid, timestamp, keepalive_ms, .. } => {
                if self.state != SessionState::Negotiated {
                    return self.violation("Establish before negotiation");
                }
                self.state = SessionState::Establishing;
                let reject = |code: RejectCode, reason: &str| Outbound::EstablishmentReject {
                    uuid,
                    request_timestamp: timestamp,
                    code,
                    reason: reason.to_string(),
                };
                if uuid != self.uuid {
                    warn!(session = %self.id, expected = self.uuid, uuid, "Establish for unknown session id");
                    self.terminated(TerminationCode::ProtocolViolation);
                    return vec![SessionAction::Send(reject(RejectCode::NotNegotiated, "Unknown session id")), SessionAction::Close];
                }
                if keepalive_ms == 0 {
                    warn!(session = %self.id, "Establish with zero keepalive");
                    self.terminated(TerminationCode::ProtocolViolation);
                    return vec![SessionAction::Send(reject(RejectCode::InvalidKeepalive, "Keepalive must be positive")), SessionAction::Close];
                }
                self.keepalive = Duration::from_millis(u64::from(keepalive_ms));
                self.state = SessionState::Established;
                info!(session = %self.id, keepalive_ms, "Session established");
                vec![SessionAction::Send(Outbound::EstablishmentAck {
                    uuid,
                    request_timestamp: timestamp,
                    keepalive_ms,
                    next_seq_no: self.next_seq,
                })]
            }
            Inbound::Sequence { .. } => Vec::new(),
            Inbound::Terminate { code, reason, .. } => {
                info!(session = %self.id, ?code, %reason, "Peer terminated session");
                self.terminated(TerminationCode::Finished);
                vec![
                    SessionAction::Send(Outbound::Terminate {
                        uuid: self.uuid,
                        code: TerminationCode::Finished,
                        reason: "Session finished".into(),
                    }),
                    SessionAction::Close,
                ]
            }
            Inbound::MarketDataRequest { request_id, subscription, instruments, .. } => {
                if !self.is_established() {
                    return self.violation("MarketDataRequest before establishment");
                }
                if let Some(unknown) = instruments.iter().copied().find(|id| !is_known(*id)) {
                    debug!(session = %self.id, request_id, instrument_id = unknown, "Rejecting request");
                    let seq = self.take_seq();
                    return vec![SessionAction::Send(Outbound::MarketDataRequestReject {
                        seq,
                        request_id,
                        reason: MdRejectReason::UnknownInstrument,
                        text: format!("Unknown instrument {unknown}"),
                    })];
                }
                match subscription {
                    SubscriptionType::Snapshot => vec![SessionAction::SendSnapshots { request_id, instruments }],
                    SubscriptionType::Subscribe => {
                        self.subscription.subscribe(&instruments);
                        info!(session = %self.id, request_id, subscription = ?self.subscription, "Subscribed");
                        vec![SessionAction::SendSnapshots { request_id, instruments }]
                    }
                    SubscriptionType::Unsubscribe => {
                        self.subscription.unsubscribe(&instruments);
                        info!(session = %self.id, request_id, "Unsubscribed");
                        Vec::new()
                    }
                }
            }
            Inbound::SecurityDefinitionRequest { request_id, instruments } => {
                if !self.is_established() {
                    return self.violation("SecurityDefinitionRequest before establishment");
                }
                if let Some(unknown) = instruments.iter().copied().find(|id| !is_known(*id)) {
                    let seq = self.take_seq();
                    return vec![SessionAction::Send(Outbound::MarketDataRequestReject {
                        seq,
                        request_id,
                        reason: MdRejectReason::UnknownInstrument,
                        text: format!("Unknown instrument {unknown}"),
                    })];
                }
                vec![SessionAction::SendDefinitions { request_id, instruments }]
            }
        }
    }

    /// Heartbeat and inactivity checks.
    pub fn poll_timers(&mut self, now: Instant, session_timeout: Duration) -> Vec<SessionAction> {
        if self.is_terminated() {
            return Vec::new();
        }
        if now.saturating_duration_since(self.last_inbound) > session_timeout {
            warn!(session = %self.id, state = ?self.state, "Session inactive; evicting");
            let notify = self.state != SessionState::Disconnected;
            self.terminated(TerminationCode::KeepaliveTimeout);
            let mut actions = Vec::with_capacity(2);
            if notify {
                actions.push(SessionAction::Send(Outbound::Terminate {
                    uuid: self.uuid,
                    code: TerminationCode::KeepaliveTimeout,
                    reason: "Inactivity timeout".into(),
                }));
            }
            actions.push(SessionAction::Close);
            return actions;
        }
        if self.is_established() && now.saturating_duration_since(self.last_outbound) >= self.keepalive / 2 {
            self.last_outbound = now;
            return vec![SessionAction::Send(Outbound::Sequence { uuid: self.uuid, next_seq_no: self.next_seq })];
        }
        Vec::new()
    }

    /// Administrative termination. Peers past negotiation are told why.
    pub fn terminate(&mut self, code: TerminationCode, reason: &str) -> Vec<SessionAction> {
        if self.is_terminated() {
            return Vec::new();
        }
        let notify = matches!(self.state, SessionState::Negotiated | SessionState::Established);
        self.terminated(code);
        let mut actions = Vec::with_capacity(2);
        if notify {
            actions.push(SessionAction::Send(Outbound::Terminate { uuid: self.uuid, code, reason: reason.to_string() }));
        }
        actions.push(SessionAction::Close);
        actions
    }

    /// The transport went away; nothing can be sent any more.
    pub fn connection_lost(&mut self) {
        if !self.is_terminated() {
            debug!(session = %self.id, state = ?self.state, "Connection lost");
            self.terminated(TerminationCode::Unspecified);
        }
    }

    fn violation(&mut self, reason: &str) -> Vec<SessionAction> {
        warn!(session = %self.id, state = ?self.state, reason, "Protocol violation");
        self.terminated(TerminationCode::ProtocolViolation);
        vec![
            SessionAction::Send(Outbound::Terminate {
                uuid: self.uuid,
                code: TerminationCode::ProtocolViolation,
                reason: reason.to_string(),
            }),
            SessionAction::Close,
        ]
    }

    fn terminated(&mut self, code: TerminationCode) {
        self.state = SessionState::Terminated;
        self.termination = Some(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: u64 = 4242;

    fn negotiate(user: &str, pass: &str) -> Inbound {
        Inbound::Negotiate {
            uuid: UUID,
            timestamp: 1,
            flow: FlowType::Idempotent,
            username: user.into(),
            password: pass.into(),
        }
    }

    fn establish(keepalive_ms: u32) -> Inbound {
        Inbound::Establish { uuid: UUID, timestamp: 2, keepalive_ms, next_seq_no: 1 }
    }

    fn creds() -> CredentialStore {
        CredentialStore::new([Credential { username: "user".into(), password: "pw".into() }])
    }

    fn known(id: InstrumentId) -> bool {
        id < 10
    }

    fn established(now: Instant) -> Session {
        let mut s = Session::new("s1".into(), Duration::from_secs(30), now);
        s.handle(negotiate("user", "pw"), now, &creds(), known);
        s.handle(establish(10_000), now, &creds(), known);
        assert_eq!(s.state(), SessionState::Established);
        s
    }

    #[test]
    fn test_handshake_reaches_established() {
        let now = Instant::now();
        let mut s = Session::new("s1".into(), Duration::from_secs(30), now);
        assert_eq!(s.state(), SessionState::Disconnected);

        let actions = s.handle(negotiate("user", "pw"), now, &creds(), known);
        assert_eq!(s.state(), SessionState::Negotiated);
        assert_eq!(
            actions,
            vec![SessionAction::Send(Outbound::NegotiationResponse { uuid: UUID, request_timestamp: 1 })]
        );

        let actions = s.handle(establish(5_000), now, &creds(), known);
        assert_eq!(s.state(), SessionState::Established);
        assert_eq!(s.keepalive(), Duration::from_secs(5));
        assert!(matches!(
            actions.as_slice(),
            [SessionAction::Send(Outbound::EstablishmentAck { keepalive_ms: 5_000, next_seq_no: 1, .. })]
        ));
    }

    #[test]
    fn test_establish_before_negotiate_terminates() {
        let now = Instant::now();
        let mut s = Session::new("s1".into(), Duration::from_secs(30), now);
        let actions = s.handle(establish(5_000), now, &creds(), known);
        assert_eq!(s.state(), SessionState::Terminated);
        assert_eq!(s.termination(), Some(TerminationCode::ProtocolViolation));
        assert_eq!(actions.last(), Some(&SessionAction::Close));

        // nothing revives a terminated session
        assert!(s.handle(negotiate("user", "pw"), now, &creds(), known).is_empty());
        assert_eq!(s.state(), SessionState::Terminated);
    }

    #[test]
    fn test_bad_credentials_rejected() {
        let now = Instant::now();
        let mut s = Session::new("s1".into(), Duration::from_secs(30), now);
        let actions = s.handle(negotiate("user", "wrong"), now, &creds(), known);
        assert_eq!(s.state(), SessionState::Terminated);
        assert!(matches!(
            actions.as_slice(),
            [SessionAction::Send(Outbound::NegotiationReject { code: RejectCode::Credentials, .. }), SessionAction::Close]
        ));
    }

    #[test]
    fn test_empty_allow_list_admits_anyone() {
        assert!(CredentialStore::default().verify("anyone", "anything"));
        assert!(!creds().verify("other", "pw"));
    }

    #[test]
    fn test_second_negotiate_is_violation() {
        let now = Instant::now();
        let mut s = established(now);
        let actions = s.handle(negotiate("user", "pw"), now, &creds(), known);
        assert_eq!(s.termination(), Some(TerminationCode::ProtocolViolation));
        assert!(matches!(
            actions.first(),
            Some(SessionAction::Send(Outbound::Terminate { code: TerminationCode::ProtocolViolation, .. }))
        ));
    }

    #[test]
    fn test_subscription_lifecycle() {
        let now = Instant::now();
        let mut s = established(now);
        let subscribe = |ids: Vec<InstrumentId>| Inbound::MarketDataRequest {
            request_id: 1,
            subscription: SubscriptionType::Subscribe,
            depth: 10,
            instruments: ids,
        };

        let actions = s.handle(subscribe(vec![1, 2]), now, &creds(), known);
        assert_eq!(actions, vec![SessionAction::SendSnapshots { request_id: 1, instruments: vec![1, 2] }]);
        assert!(s.wants(1) && s.wants(2) && !s.wants(3));

        s.handle(
            Inbound::MarketDataRequest { request_id: 2, subscription: SubscriptionType::Unsubscribe, depth: 0, instruments: vec![1] },
            now,
            &creds(),
            known,
        );
        assert!(!s.wants(1) && s.wants(2));

        s.handle(subscribe(vec![]), now, &creds(), known);
        assert_eq!(s.subscription(), &Subscription::All);
        assert!(s.wants(7));
    }

    #[test]
    fn test_unknown_instrument_rejected_with_sequence() {
        let now = Instant::now();
        let mut s = established(now);
        let actions = s.handle(
            Inbound::MarketDataRequest { request_id: 9, subscription: SubscriptionType::Subscribe, depth: 1, instruments: vec![1, 99] },
            now,
            &creds(),
            known,
        );
        assert!(matches!(
            actions.as_slice(),
            [SessionAction::Send(Outbound::MarketDataRequestReject { seq: 1, request_id: 9, .. })]
        ));
        assert_eq!(s.subscription(), &Subscription::None);
        assert_eq!(s.next_seq(), 2);
    }

    #[test]
    fn test_request_before_established_is_violation() {
        let now = Instant::now();
        let mut s = Session::new("s1".into(), Duration::from_secs(30), now);
        s.handle(negotiate("user", "pw"), now, &creds(), known);
        s.handle(Inbound::SecurityDefinitionRequest { request_id: 1, instruments: vec![] }, now, &creds(), known);
        assert_eq!(s.termination(), Some(TerminationCode::ProtocolViolation));
    }

    #[test]
    fn test_heartbeat_after_half_keepalive() {
        let start = Instant::now();
        let mut s = established(start);
        let timeout = Duration::from_secs(60);
        assert!(s.poll_timers(start + Duration::from_secs(4), timeout).is_empty());

        let actions = s.poll_timers(start + Duration::from_secs(5), timeout);
        assert_eq!(actions, vec![SessionAction::Send(Outbound::Sequence { uuid: UUID, next_seq_no: 1 })]);
        // interval restarts from the heartbeat
        assert!(s.poll_timers(start + Duration::from_secs(6), timeout).is_empty());
    }

    #[test]
    fn test_inactive_session_evicted() {
        let start = Instant::now();
        let mut s = established(start);
        let actions = s.poll_timers(start + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(s.termination(), Some(TerminationCode::KeepaliveTimeout));
        assert!(matches!(
            actions.as_slice(),
            [SessionAction::Send(Outbound::Terminate { code: TerminationCode::KeepaliveTimeout, .. }), SessionAction::Close]
        ));

        let mut fresh = Session::new("s2".into(), Duration::from_secs(30), start);
        assert_eq!(fresh.poll_timers(start + Duration::from_secs(31), Duration::from_secs(30)), vec![SessionAction::Close]);
    }

    #[test]
    fn test_peer_terminate_is_echoed() {
        let now = Instant::now();
        let mut s = established(now);
        let actions = s.handle(
            Inbound::Terminate { uuid: UUID, code: TerminationCode::Finished, reason: "bye".into() },
            now,
            &creds(),
            known,
        );
        assert_eq!(s.state(), SessionState::Terminated);
        assert!(matches!(
            actions.as_slice(),
            [SessionAction::Send(Outbound::Terminate { code: TerminationCode::Finished, .. }), SessionAction::Close]
        ));
    }

    #[test]
    fn test_admin_terminate() {
        let now = Instant::now();
        let mut s = established(now);
        let actions = s.terminate(TerminationCode::AdminShutdown, "Server shutting down");
        assert_eq!(actions.len(), 2);
        assert!(s.terminate(TerminationCode::AdminShutdown, "again").is_empty());
    }
}
