use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::messages::{
    IncrementalEntry, Inbound, MdEntryType, Outbound, SnapshotEntry, TerminationCode,
};
use super::session::{CredentialStore, Session, SessionAction};
use super::sofh::{encode_frame, FrameDecoder};
use crate::engine::book::PriceLevelBook;
use crate::engine::registry::BookRegistry;
use crate::engine::types::{InstrumentId, LevelChange, MarketStats, PriceLevel, Side};
use crate::market_data::events::{BatchEntry, MarketEvent, MarketEventListener, QuoteUpdate, TradeEvent};
use crate::transport::{Acceptor, Connection, Receive};

const READ_CHUNK: usize = 64 * 1024;
/// Reads per connection per poll, so one chatty peer cannot starve the loop.
const MAX_READS_PER_POLL: usize = 16;
/// Entries per IncrementalRefresh; a full message stays well inside one SOFH frame.
pub const MAX_INCREMENTAL_ENTRIES: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Inbound silence after which a session is evicted.
    #[serde(with = "millis")]
    pub session_timeout: Duration,
    /// Keepalive assumed until Establish names one.
    #[serde(with = "millis")]
    pub default_keepalive: Duration,
    pub max_sessions: usize,
    pub snapshot_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            session_timeout: Duration::from_secs(30),
            default_keepalive: Duration::from_secs(10),
            max_sessions: 64,
            snapshot_depth: 10,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    /// Connections refused because `max_sessions` was reached.
    pub refused: u64,
    pub terminated: u64,
    pub evicted: u64,
    pub protocol_violations: u64,
    pub auth_failures: u64,
    pub decode_errors: u64,
    pub messages_sent: u64,
    /// Messages dropped before sending because they could not be encoded or framed.
    pub encode_errors: u64,
    pub send_errors: u64,
    pub accept_errors: u64,
}

struct Client<C> {
    conn: C,
    session: Session,
    decoder: FrameDecoder,
}

/// Cooperative server for the session feed. Each `poll` accepts, reads, runs timers and
/// flushes without blocking; market events are pushed to established subscribers.
pub struct SessionServer<A: Acceptor> {
    acceptor: A,
    config: ServerConfig,
    credentials: CredentialStore,
    clients: BTreeMap<u64, Client<A::Conn>>,
    next_client: u64,
    last_rpt_seq: AHashMap<InstrumentId, u32>,
    stats: ServerStats,
    read_buf: Vec<u8>,
}

impl<A: Acceptor> SessionServer<A> {
    pub fn new(acceptor: A, config: ServerConfig, credentials: CredentialStore) -> Self {
        SessionServer {
            acceptor,
            config,
            credentials,
            clients: BTreeMap::new(),
            next_client: 1,
            last_rpt_seq: AHashMap::new(),
            stats: ServerStats::default(),
            read_buf: vec![0; READ_CHUNK],
        }
    }

    pub fn acceptor(&self) -> &A {
        &self.acceptor
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    pub fn session_count(&self) -> usize {
        self.clients.len()
    }

    pub fn established_count(&self) -> usize {
        self.clients.values().filter(|c| c.session.is_established()).count()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.clients.values().map(|c| &c.session)
    }

    /// One loop iteration: accept, drain input, timers, flush, reap.
    pub fn poll_once(&mut self, registry: &BookRegistry, now: Instant) {
        self.accept_pending(now);

        let ids: Vec<u64> = self.clients.keys().copied().collect();
        for id in ids {
            let actions = self.drain_input(id, registry, now);
            if let Some(client) = self.clients.get_mut(&id) {
                let mut actions = actions;
                actions.extend(client.session.poll_timers(now, self.config.session_timeout));
                execute(client, actions, registry, &self.config, &self.last_rpt_seq, &mut self.stats, now);
                if let Err(e) = client.conn.flush() {
                    count_send_error(&mut self.stats);
                    warn!(session = %client.session.id(), error = %e, "Flush failed");
                    client.session.connection_lost();
                }
            }
        }

        self.reap();
    }

    fn accept_pending(&mut self, now: Instant) {
        loop {
            match self.acceptor.accept() {
                Ok(Some(mut conn)) => {
                    if self.clients.len() >= self.config.max_sessions {
                        self.stats.refused += 1;
                        warn!(peer = %conn.peer(), max = self.config.max_sessions, "Session limit reached; refusing");
                        conn.close();
                        continue;
                    }
                    let id = self.next_client;
                    self.next_client += 1;
                    let session_id = format!("{}#{}", conn.peer(), id);
                    info!(session = %session_id, "Session accepted");
                    let session = Session::new(session_id, self.config.default_keepalive, now);
                    self.clients.insert(id, Client { conn, session, decoder: FrameDecoder::new() });
                    self.stats.accepted += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    self.stats.accept_errors += 1;
                    warn!(error = %e, "Accept failed");
                    break;
                }
            }
        }
        metrics::gauge!("mdfeed_sessions_active").set(self.clients.len() as f64);
    }

    /// Reads what is available and runs every complete frame through the session.
    fn drain_input(&mut self, id: u64, registry: &BookRegistry, now: Instant) -> Vec<SessionAction> {
        let Some(client) = self.clients.get_mut(&id) else {
            return Vec::new();
        };
        let mut actions = Vec::new();

        for _ in 0..MAX_READS_PER_POLL {
            match client.conn.receive(&mut self.read_buf) {
                Ok(Receive::Data(n)) => client.decoder.extend(&self.read_buf[..n]),
                Ok(Receive::Idle) => break,
                Ok(Receive::Closed) => {
                    debug!(session = %client.session.id(), "Peer closed connection");
                    client.session.connection_lost();
                    break;
                }
                Err(e) => {
                    warn!(session = %client.session.id(), error = %e, "Receive failed");
                    client.session.connection_lost();
                    break;
                }
            }
        }

        while !client.session.is_terminated() {
            let payload = match client.decoder.next_frame() {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    self.stats.decode_errors += 1;
                    warn!(session = %client.session.id(), error = %e, "Malformed frame");
                    actions.extend(client.session.terminate(TerminationCode::ProtocolViolation, "Malformed frame"));
                    break;
                }
            };
            match Inbound::decode(&payload) {
                Ok(msg) => {
                    let known = |instrument: InstrumentId| registry.contains(instrument);
                    actions.extend(client.session.handle(msg, now, &self.credentials, known));
                }
                Err(e) => {
                    self.stats.decode_errors += 1;
                    warn!(session = %client.session.id(), error = %e, "Undecodable message");
                    actions.extend(client.session.terminate(TerminationCode::ProtocolViolation, "Undecodable message"));
                }
            }
        }
        actions
    }

    fn reap(&mut self) {
        let done: Vec<u64> =
            self.clients.iter().filter(|(_, c)| c.session.is_terminated()).map(|(id, _)| *id).collect();
        for id in done {
            if let Some(mut client) = self.clients.remove(&id) {
                client.conn.close();
                self.stats.terminated += 1;
                match client.session.termination() {
                    Some(TerminationCode::ProtocolViolation) => self.stats.protocol_violations += 1,
                    Some(TerminationCode::AuthenticationFailed) => self.stats.auth_failures += 1,
                    Some(TerminationCode::KeepaliveTimeout) => self.stats.evicted += 1,
                    _ => {}
                }
                info!(session = %client.session.id(), code = ?client.session.termination(), "Session closed");
            }
        }
        metrics::gauge!("mdfeed_sessions_active").set(self.clients.len() as f64);
    }

    /// Sends a per-session message to every established session that wants `instrument`.
    fn broadcast(&mut self, instrument: Option<InstrumentId>, build: impl Fn(u64) -> Outbound) {
        let now = Instant::now();
        for client in self.clients.values_mut() {
            let wanted = match instrument {
                Some(id) => client.session.wants(id),
                None => client.session.is_established(),
            };
            if !wanted {
                continue;
            }
            send_sequenced(client, &build, &mut self.stats, now);
        }
    }

    fn broadcast_batch(&mut self, timestamp: u64, entries: &[BatchEntry]) {
        let now = Instant::now();
        for client in self.clients.values_mut() {
            if !client.session.is_established() {
                continue;
            }
            let matched: Vec<IncrementalEntry> = entries
                .iter()
                .filter(|e| client.session.wants(e.instrument_id()))
                .map(|e| match e {
                    BatchEntry::Quote(q) => quote_entry(q),
                    BatchEntry::Trade(t) => trade_entry(t),
                })
                .collect();
            for chunk in matched.chunks(MAX_INCREMENTAL_ENTRIES) {
                let build = |seq| Outbound::IncrementalRefresh { seq, timestamp, entries: chunk.to_vec() };
                send_sequenced(client, build, &mut self.stats, now);
                if client.session.is_terminated() {
                    break;
                }
            }
        }
    }
}

fn frame<C>(client: &Client<C>, msg: &Outbound, stats: &mut ServerStats) -> Option<Bytes> {
    let frame = match msg.encode() {
        Ok(payload) => encode_frame(&payload).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match frame {
        Ok(frame) => Some(frame),
        Err(e) => {
            stats.encode_errors += 1;
            warn!(session = %client.session.id(), template = msg.template_id(), error = %e, "Failed to encode message");
            None
        }
    }
}

fn send<C: Connection>(client: &mut Client<C>, msg: &Outbound, stats: &mut ServerStats, now: Instant) {
    if let Some(frame) = frame(client, msg, stats) {
        write(client, &frame, stats, now);
    }
}

/// Sends an application message numbered with the session's next sequence. The number is
/// only consumed once the message is framed, so a dropped message leaves no gap.
fn send_sequenced<C: Connection>(
    client: &mut Client<C>,
    build: impl FnOnce(u64) -> Outbound,
    stats: &mut ServerStats,
    now: Instant,
) {
    let msg = build(client.session.next_seq());
    if let Some(frame) = frame(client, &msg, stats) {
        client.session.take_seq();
        write(client, &frame, stats, now);
    }
}

fn write<C: Connection>(client: &mut Client<C>, frame: &[u8], stats: &mut ServerStats, now: Instant) {
    match client.conn.send(frame) {
        Ok(()) => {
            stats.messages_sent += 1;
            client.session.note_sent(now);
        }
        Err(e) => {
            count_send_error(stats);
            warn!(session = %client.session.id(), error = %e, "Send failed; dropping session");
            client.session.connection_lost();
        }
    }
}

/// Pushes out whatever the connection still holds, then closes it.
fn close<C: Connection>(client: &mut Client<C>, stats: &mut ServerStats) {
    if let Err(e) = client.conn.flush() {
        count_send_error(stats);
        warn!(session = %client.session.id(), error = %e, "Flush before close failed");
    }
    client.conn.close();
}

fn count_send_error(stats: &mut ServerStats) {
    stats.send_errors += 1;
    metrics::counter!("mdfeed_reuters_send_errors_total").increment(1);
}

fn execute<C: Connection>(
    client: &mut Client<C>,
    actions: Vec<SessionAction>,
    registry: &BookRegistry,
    config: &ServerConfig,
    last_rpt_seq: &AHashMap<InstrumentId, u32>,
    stats: &mut ServerStats,
    now: Instant,
) {
    for action in actions {
        match action {
            SessionAction::Send(msg) => send(client, &msg, stats, now),
            SessionAction::SendSnapshots { request_id, instruments } => {
                for id in resolve(registry, instruments) {
                    let Ok(book) = registry.lookup(id) else { continue };
                    let rpt_seq = last_rpt_seq.get(&id).copied().unwrap_or(0);
                    let build = |seq| full_refresh(book, seq, request_id, rpt_seq, config.snapshot_depth);
                    send_sequenced(client, build, stats, now);
                }
            }
            SessionAction::SendDefinitions { request_id, instruments } => {
                let ids = resolve(registry, instruments);
                let total = u32::try_from(ids.len()).unwrap_or(u32::MAX);
                for id in ids {
                    let Ok(book) = registry.lookup(id) else { continue };
                    let build =
                        |seq| Outbound::SecurityDefinition { seq, request_id, total, instrument: book.instrument().clone() };
                    send_sequenced(client, build, stats, now);
                }
            }
            SessionAction::Close => close(client, stats),
        }
        // connection lost mid-way; nothing further can be delivered
        if client.session.termination() == Some(TerminationCode::Unspecified) {
            break;
        }
    }
}

fn resolve(registry: &BookRegistry, instruments: Vec<InstrumentId>) -> Vec<InstrumentId> {
    if instruments.is_empty() {
        registry.sorted_ids()
    } else {
        instruments
    }
}

fn level_entries(side: Side, levels: &[PriceLevel]) -> impl Iterator<Item = SnapshotEntry> + '_ {
    levels.iter().enumerate().map(move |(i, level)| SnapshotEntry {
        entry_type: MdEntryType::for_side(side),
        price: Some(level.price),
        size: level.quantity,
        order_count: level.order_count,
        level: u8::try_from(i + 1).unwrap_or(u8::MAX),
    })
}

fn stats_entries(stats: &MarketStats) -> Vec<SnapshotEntry> {
    let priced = [
        (MdEntryType::Trade, stats.last),
        (MdEntryType::Open, stats.open),
        (MdEntryType::High, stats.high),
        (MdEntryType::Low, stats.low),
        (MdEntryType::Settlement, stats.settlement),
        (MdEntryType::Vwap, stats.vwap()),
    ];
    let mut out: Vec<SnapshotEntry> = priced
        .into_iter()
        .filter_map(|(entry_type, price)| {
            price.map(|p| SnapshotEntry { entry_type, price: Some(p), size: 0, order_count: 0, level: 0 })
        })
        .collect();
    out.push(SnapshotEntry { entry_type: MdEntryType::Volume, price: None, size: stats.volume, order_count: 0, level: 0 });
    out
}

fn full_refresh(book: &PriceLevelBook, seq: u64, request_id: u32, rpt_seq: u32, depth: usize) -> Outbound {
    let bids = book.bid_depth(depth);
    let asks = book.ask_depth(depth);
    let mut entries: Vec<SnapshotEntry> = level_entries(Side::Buy, &bids).chain(level_entries(Side::Sell, &asks)).collect();
    entries.extend(stats_entries(book.stats()));
    Outbound::SnapshotFullRefresh {
        seq,
        request_id,
        instrument_id: book.instrument().id,
        rpt_seq,
        timestamp: crate::engine::types::now_nanos(),
        status: book.trading_status(),
        entries,
    }
}

fn quote_entry(q: &QuoteUpdate) -> IncrementalEntry {
    IncrementalEntry {
        instrument_id: q.instrument_id,
        rpt_seq: q.rpt_seq,
        action: q.action,
        entry_type: MdEntryType::for_side(q.side),
        price: Some(q.price),
        size: q.quantity,
        order_count: q.order_count,
        level: q.level,
        aggressor: None,
        trade_id: 0,
    }
}

fn trade_entry(t: &TradeEvent) -> IncrementalEntry {
    IncrementalEntry {
        instrument_id: t.instrument_id,
        rpt_seq: t.rpt_seq,
        action: LevelChange::New,
        entry_type: MdEntryType::Trade,
        price: Some(t.price),
        size: t.quantity,
        order_count: 0,
        level: 0,
        aggressor: Some(t.aggressor),
        trade_id: t.trade_id,
    }
}

impl<A: Acceptor> MarketEventListener for SessionServer<A> {
    fn name(&self) -> &str {
        "reuters"
    }

    fn on_market_event(&mut self, event: &MarketEvent) {
        match event {
            MarketEvent::Batch(batch) => {
                for entry in &batch.entries {
                    let rpt_seq = match entry {
                        BatchEntry::Quote(q) => q.rpt_seq,
                        BatchEntry::Trade(t) => t.rpt_seq,
                    };
                    self.last_rpt_seq.insert(entry.instrument_id(), rpt_seq);
                }
                self.broadcast_batch(batch.timestamp, &batch.entries);
            }
            MarketEvent::QuoteUpdate(q) => {
                self.last_rpt_seq.insert(q.instrument_id, q.rpt_seq);
                let entry = quote_entry(q);
                let timestamp = q.timestamp;
                self.broadcast(Some(q.instrument_id), |seq| Outbound::IncrementalRefresh {
                    seq,
                    timestamp,
                    entries: vec![entry],
                });
            }
            MarketEvent::Trade(t) => {
                self.last_rpt_seq.insert(t.instrument_id, t.rpt_seq);
                let entry = trade_entry(t);
                let timestamp = t.timestamp;
                self.broadcast(Some(t.instrument_id), |seq| Outbound::IncrementalRefresh {
                    seq,
                    timestamp,
                    entries: vec![entry],
                });
            }
            MarketEvent::Statistics(s) => {
                self.last_rpt_seq.insert(s.instrument_id, s.rpt_seq);
                let entries: Vec<IncrementalEntry> = stats_entries(&s.stats)
                    .into_iter()
                    .map(|e| IncrementalEntry {
                        instrument_id: s.instrument_id,
                        rpt_seq: s.rpt_seq,
                        action: LevelChange::New,
                        entry_type: e.entry_type,
                        price: e.price,
                        size: e.size,
                        order_count: 0,
                        level: 0,
                        aggressor: None,
                        trade_id: 0,
                    })
                    .collect();
                let timestamp = s.timestamp;
                self.broadcast(Some(s.instrument_id), |seq| Outbound::IncrementalRefresh {
                    seq,
                    timestamp,
                    entries: entries.clone(),
                });
            }
            MarketEvent::StatusChange(s) => {
                self.last_rpt_seq.insert(s.instrument_id, s.rpt_seq);
                let s = *s;
                self.broadcast(Some(s.instrument_id), |seq| Outbound::SecurityStatus {
                    seq,
                    instrument_id: s.instrument_id,
                    rpt_seq: s.rpt_seq,
                    timestamp: s.timestamp,
                    status: s.status,
                });
            }
            MarketEvent::Snapshot(s) => {
                let mut entries: Vec<SnapshotEntry> =
                    level_entries(Side::Buy, &s.bids).chain(level_entries(Side::Sell, &s.asks)).collect();
                entries.extend(stats_entries(&s.stats));
                self.broadcast(Some(s.instrument_id), |seq| Outbound::SnapshotFullRefresh {
                    seq,
                    request_id: 0,
                    instrument_id: s.instrument_id,
                    rpt_seq: s.rpt_seq,
                    timestamp: s.timestamp,
                    status: s.status,
                    entries: entries.clone(),
                });
            }
        }
    }

    fn poll(&mut self, registry: &BookRegistry, now: Instant) {
        self.poll_once(registry, now);
    }

    fn shutdown(&mut self) {
        let now = Instant::now();
        let count = self.clients.len();
        for client in self.clients.values_mut() {
            let actions = client.session.terminate(TerminationCode::AdminShutdown, "Server shutting down");
            for action in actions {
                match action {
                    SessionAction::Send(msg) => send(client, &msg, &mut self.stats, now),
                    _ => close(client, &mut self.stats),
                }
            }
        }
        self.reap();
        info!(sessions = count, sent = self.stats.messages_sent, "Session server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{Instrument, InstrumentKind, Price, TradingStatus};
    use crate::market_data::events::{BatchEvent, StatusEvent};
    use crate::reuters::messages::{FlowType, SubscriptionType};
    use crate::reuters::schema::{self, SCHEMA};
    use crate::reuters::session::{Credential, SessionState};
    use crate::sbe::{DecodedMessage, Value};
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    #[derive(Default)]
    struct Wire {
        to_server: Vec<u8>,
        to_client: Vec<u8>,
        closed: bool,
        fail_flush: bool,
    }

    struct FakeConn(Rc<RefCell<Wire>>);

    impl Connection for FakeConn {
        fn peer(&self) -> String {
            "fake".into()
        }

        fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
            let mut wire = self.0.borrow_mut();
            if wire.closed {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
            }
            wire.to_client.extend_from_slice(bytes);
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8]) -> io::Result<Receive> {
            let mut wire = self.0.borrow_mut();
            if wire.to_server.is_empty() {
                return Ok(if wire.closed { Receive::Closed } else { Receive::Idle });
            }
            let n = wire.to_server.len().min(buf.len());
            buf[..n].copy_from_slice(&wire.to_server[..n]);
            wire.to_server.drain(..n);
            Ok(Receive::Data(n))
        }

        fn flush(&mut self) -> io::Result<()> {
            let wire = self.0.borrow();
            if wire.fail_flush && !wire.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reset"));
            }
            Ok(())
        }

        fn close(&mut self) {
            self.0.borrow_mut().closed = true;
        }
    }

    #[derive(Default)]
    struct FakeAcceptor {
        pending: Rc<RefCell<Vec<FakeConn>>>,
    }

    impl Acceptor for FakeAcceptor {
        type Conn = FakeConn;

        fn accept(&mut self) -> io::Result<Option<FakeConn>> {
            Ok(self.pending.borrow_mut().pop())
        }
    }

    struct Client {
        wire: Rc<RefCell<Wire>>,
        decoder: FrameDecoder,
    }

    impl Client {
        fn send(&self, msg: Inbound) {
            let frame = encode_frame(&msg.encode().unwrap()).unwrap();
            self.wire.borrow_mut().to_server.extend_from_slice(&frame);
        }

        /// Template ids and payloads received since the last call.
        fn received(&mut self) -> Vec<(u16, Vec<u8>)> {
            let bytes = std::mem::take(&mut self.wire.borrow_mut().to_client);
            self.decoder.extend(&bytes);
            let mut out = Vec::new();
            while let Some(frame) = self.decoder.next_frame().unwrap() {
                let msg = DecodedMessage::decode(&SCHEMA, &frame).unwrap();
                out.push((msg.template_id(), frame.to_vec()));
            }
            out
        }

        fn templates(&mut self) -> Vec<u16> {
            self.received().into_iter().map(|(t, _)| t).collect()
        }

        fn closed(&self) -> bool {
            self.wire.borrow().closed
        }
    }

    fn registry() -> BookRegistry {
        let mut reg = BookRegistry::new();
        for (id, symbol) in [(1, "ESZ5"), (2, "EURUSD")] {
            let instrument = Instrument {
                id,
                symbol: symbol.into(),
                tick_size: Price::from_f64(0.25),
                kind: InstrumentKind::default(),
            };
            reg.register(instrument, Price::from_f64(100.0), Price::from_f64(0.25)).unwrap();
        }
        reg
    }

    fn server(config: ServerConfig) -> (SessionServer<FakeAcceptor>, Rc<RefCell<Vec<FakeConn>>>) {
        let acceptor = FakeAcceptor::default();
        let pending = acceptor.pending.clone();
        let creds = CredentialStore::new([Credential { username: "user".into(), password: "pw".into() }]);
        (SessionServer::new(acceptor, config, creds), pending)
    }

    fn connect(pending: &Rc<RefCell<Vec<FakeConn>>>) -> Client {
        let wire = Rc::new(RefCell::new(Wire::default()));
        pending.borrow_mut().push(FakeConn(wire.clone()));
        Client { wire, decoder: FrameDecoder::new() }
    }

    fn negotiate(password: &str) -> Inbound {
        Inbound::Negotiate { uuid: 1, timestamp: 1, flow: FlowType::Idempotent, username: "user".into(), password: password.into() }
    }

    fn establish() -> Inbound {
        Inbound::Establish { uuid: 1, timestamp: 2, keepalive_ms: 2_000, next_seq_no: 1 }
    }

    fn establish_client(srv: &mut SessionServer<FakeAcceptor>, pending: &Rc<RefCell<Vec<FakeConn>>>, reg: &BookRegistry, now: Instant) -> Client {
        let mut client = connect(pending);
        client.send(negotiate("pw"));
        client.send(establish());
        srv.poll_once(reg, now);
        assert_eq!(client.templates(), vec![schema::NEGOTIATION_RESPONSE, schema::ESTABLISHMENT_ACK]);
        client
    }

    #[test]
    fn test_handshake_over_connection() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let now = Instant::now();
        let mut client = connect(&pending);

        srv.poll_once(&reg, now);
        assert_eq!(srv.session_count(), 1);
        assert_eq!(srv.sessions().next().map(Session::state), Some(SessionState::Disconnected));

        client.send(negotiate("pw"));
        srv.poll_once(&reg, now);
        assert_eq!(client.templates(), vec![schema::NEGOTIATION_RESPONSE]);
        assert_eq!(srv.sessions().next().map(Session::state), Some(SessionState::Negotiated));

        client.send(establish());
        srv.poll_once(&reg, now);
        assert_eq!(client.templates(), vec![schema::ESTABLISHMENT_ACK]);
        assert_eq!(srv.established_count(), 1);
    }

    #[test]
    fn test_bad_password_rejected_and_closed() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let mut client = connect(&pending);
        client.send(negotiate("nope"));
        srv.poll_once(&reg, Instant::now());

        assert_eq!(client.templates(), vec![schema::NEGOTIATION_REJECT]);
        assert!(client.closed());
        assert_eq!(srv.session_count(), 0);
        assert_eq!(srv.stats().auth_failures, 1);
    }

    #[test]
    fn test_establish_without_negotiate_terminates() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let mut client = connect(&pending);
        client.send(establish());
        srv.poll_once(&reg, Instant::now());

        assert_eq!(client.templates(), vec![schema::TERMINATE]);
        assert!(client.closed());
        assert_eq!(srv.stats().protocol_violations, 1);
    }

    #[test]
    fn test_unestablished_sessions_get_no_data() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let mut client = connect(&pending);
        client.send(negotiate("pw"));
        srv.poll_once(&reg, Instant::now());
        client.received();

        srv.on_market_event(&MarketEvent::StatusChange(StatusEvent {
            instrument_id: 1,
            rpt_seq: 1,
            timestamp: 1,
            status: TradingStatus::Halt,
        }));
        assert!(client.received().is_empty());
    }

    #[test]
    fn test_subscribe_sends_snapshot_then_filtered_incrementals() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let now = Instant::now();
        let mut client = establish_client(&mut srv, &pending, &reg, now);

        client.send(Inbound::MarketDataRequest {
            request_id: 7,
            subscription: SubscriptionType::Subscribe,
            depth: 10,
            instruments: vec![2],
        });
        srv.poll_once(&reg, now);
        let received = client.received();
        assert_eq!(received.len(), 1);
        let snapshot = DecodedMessage::decode(&SCHEMA, &received[0].1).unwrap();
        assert_eq!(snapshot.template_id(), schema::SNAPSHOT_FULL_REFRESH);
        assert_eq!(snapshot.get("SecurityID").unwrap(), Value::U32(2));
        assert_eq!(snapshot.get("SeqNum").unwrap(), Value::U64(1));
        // five seeded levels per side plus settlement and volume
        assert_eq!(snapshot.group_len(schema::MD_ENTRIES).unwrap(), 12);

        let quote = |id: InstrumentId, rpt_seq: u32| {
            BatchEntry::Quote(QuoteUpdate {
                instrument_id: id,
                rpt_seq,
                timestamp: 5,
                side: Side::Buy,
                action: LevelChange::Change,
                price: Price::from_f64(100.0),
                quantity: 3,
                order_count: 1,
                level: 1,
            })
        };
        srv.on_market_event(&MarketEvent::Batch(BatchEvent { timestamp: 5, entries: vec![quote(1, 1), quote(2, 1), quote(2, 2)] }));
        let received = client.received();
        assert_eq!(received.len(), 1);
        let incremental = DecodedMessage::decode(&SCHEMA, &received[0].1).unwrap();
        assert_eq!(incremental.template_id(), schema::INCREMENTAL_REFRESH);
        assert_eq!(incremental.get("SeqNum").unwrap(), Value::U64(2));
        assert_eq!(incremental.group_len(schema::MD_ENTRIES).unwrap(), 2);

        // instrument 1 alone is filtered out entirely
        srv.on_market_event(&MarketEvent::Batch(BatchEvent { timestamp: 6, entries: vec![quote(1, 2)] }));
        assert!(client.received().is_empty());
    }

    #[test]
    fn test_oversized_batch_is_split_without_sequence_gaps() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let now = Instant::now();
        let mut client = establish_client(&mut srv, &pending, &reg, now);
        client.send(Inbound::MarketDataRequest {
            request_id: 1,
            subscription: SubscriptionType::Subscribe,
            depth: 1,
            instruments: vec![1],
        });
        srv.poll_once(&reg, now);
        assert_eq!(client.templates(), vec![schema::SNAPSHOT_FULL_REFRESH]);

        let entries: Vec<BatchEntry> = (1..=4_000u32)
            .map(|rpt_seq| {
                BatchEntry::Quote(QuoteUpdate {
                    instrument_id: 1,
                    rpt_seq,
                    timestamp: 9,
                    side: Side::Sell,
                    action: LevelChange::New,
                    price: Price::from_f64(101.0),
                    quantity: 1,
                    order_count: 1,
                    level: 1,
                })
            })
            .collect();
        srv.on_market_event(&MarketEvent::Batch(BatchEvent { timestamp: 9, entries }));
        srv.on_market_event(&MarketEvent::StatusChange(StatusEvent {
            instrument_id: 1,
            rpt_seq: 4_001,
            timestamp: 10,
            status: TradingStatus::Halt,
        }));

        let mut seqs = Vec::new();
        let mut entry_total = 0;
        for (template, payload) in client.received() {
            let msg = DecodedMessage::decode(&SCHEMA, &payload).unwrap();
            if template == schema::INCREMENTAL_REFRESH {
                let len = msg.group_len(schema::MD_ENTRIES).unwrap();
                assert!(len <= MAX_INCREMENTAL_ENTRIES);
                entry_total += len;
            }
            seqs.push(msg.get("SeqNum").unwrap().as_u64().unwrap());
        }
        assert_eq!(entry_total, 4_000);
        // snapshot took 1, four incrementals, then the status message
        assert_eq!(seqs, vec![2, 3, 4, 5, 6]);
        assert_eq!(srv.stats().encode_errors, 0);
        assert_eq!(srv.established_count(), 1);
    }

    #[test]
    fn test_flush_failure_on_close_is_counted() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let client = connect(&pending);
        client.wire.borrow_mut().fail_flush = true;
        client.send(negotiate("nope"));
        srv.poll_once(&reg, Instant::now());

        assert!(client.closed());
        assert_eq!(srv.stats().auth_failures, 1);
        assert_eq!(srv.stats().send_errors, 1);
    }

    #[test]
    fn test_flush_failure_on_shutdown_is_counted() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let now = Instant::now();
        let client = establish_client(&mut srv, &pending, &reg, now);
        client.wire.borrow_mut().fail_flush = true;

        srv.shutdown();
        assert!(client.closed());
        assert_eq!(srv.stats().send_errors, 1);
        assert_eq!(srv.session_count(), 0);
    }

    #[test]
    fn test_unknown_instrument_rejected() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let now = Instant::now();
        let mut client = establish_client(&mut srv, &pending, &reg, now);
        client.send(Inbound::MarketDataRequest {
            request_id: 3,
            subscription: SubscriptionType::Subscribe,
            depth: 1,
            instruments: vec![42],
        });
        srv.poll_once(&reg, now);
        assert_eq!(client.templates(), vec![schema::MARKET_DATA_REQUEST_REJECT]);
        assert_eq!(srv.established_count(), 1);
    }

    #[test]
    fn test_security_definitions_for_all() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let now = Instant::now();
        let mut client = establish_client(&mut srv, &pending, &reg, now);
        client.send(Inbound::SecurityDefinitionRequest { request_id: 1, instruments: vec![] });
        srv.poll_once(&reg, now);
        let received = client.received();
        assert_eq!(received.len(), 2);
        let first = DecodedMessage::decode(&SCHEMA, &received[0].1).unwrap();
        assert_eq!(first.template_id(), schema::SECURITY_DEFINITION);
        assert_eq!(first.get("Symbol").unwrap().as_str(), Some("ESZ5"));
        assert_eq!(first.get("TotNumReports").unwrap(), Value::U32(2));
    }

    #[test]
    fn test_heartbeat_and_eviction() {
        let config = ServerConfig { session_timeout: Duration::from_secs(5), ..ServerConfig::default() };
        let (mut srv, pending) = server(config);
        let reg = registry();
        let start = Instant::now();
        let mut client = establish_client(&mut srv, &pending, &reg, start);

        // keepalive 2s: heartbeat after 1s of outbound silence
        srv.poll_once(&reg, start + Duration::from_millis(1_100));
        assert_eq!(client.templates(), vec![schema::SEQUENCE]);

        // client heartbeat keeps the session alive past the timeout
        client.send(Inbound::Sequence { uuid: 1, next_seq_no: 1 });
        srv.poll_once(&reg, start + Duration::from_secs(4));
        srv.poll_once(&reg, start + Duration::from_secs(8));
        assert_eq!(srv.session_count(), 1);

        srv.poll_once(&reg, start + Duration::from_secs(10));
        assert_eq!(srv.session_count(), 0);
        assert_eq!(srv.stats().evicted, 1);
        assert!(client.closed());
    }

    #[test]
    fn test_session_limit() {
        let config = ServerConfig { max_sessions: 1, ..ServerConfig::default() };
        let (mut srv, pending) = server(config);
        let reg = registry();
        let first = connect(&pending);
        let second = connect(&pending);
        srv.poll_once(&reg, Instant::now());
        assert_eq!(srv.session_count(), 1);
        assert_eq!(srv.stats().refused, 1);
        assert!(first.closed() != second.closed());
    }

    #[test]
    fn test_shutdown_terminates_established() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let now = Instant::now();
        let mut client = establish_client(&mut srv, &pending, &reg, now);
        let idle = connect(&pending);
        srv.poll_once(&reg, now);

        srv.shutdown();
        let received = client.received();
        assert_eq!(received.len(), 1);
        let terminate = DecodedMessage::decode(&SCHEMA, &received[0].1).unwrap();
        assert_eq!(terminate.template_id(), schema::TERMINATE);
        assert_eq!(terminate.get("Code").unwrap(), Value::U8(TerminationCode::AdminShutdown.code()));
        assert!(client.closed() && idle.closed());
        assert_eq!(srv.session_count(), 0);
    }

    #[test]
    fn test_garbage_frame_terminates_session() {
        let (mut srv, pending) = server(ServerConfig::default());
        let reg = registry();
        let client = connect(&pending);
        client.wire.borrow_mut().to_server.extend_from_slice(&[0, 0, 0, 8, 0xAA, 0xBB, 1, 2]);
        srv.poll_once(&reg, Instant::now());
        assert!(client.closed());
        assert_eq!(srv.stats().decode_errors, 1);
        assert_eq!(srv.stats().protocol_violations, 1);
    }
}
