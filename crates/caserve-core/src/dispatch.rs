// Framer and command dispatch for one connection.
use bytes::Bytes;
use caserve_wire::{Command, Frame, FrameDecoder, Header, SEARCH_DO_REPLY, Status, decode_name};
use std::sync::Arc;

use crate::client::Client;
use crate::{Server, SessionError};

/// How requests reach the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A connection-oriented stream owned by one client.
    Stream,
    /// Discovery datagrams, answered on behalf of the provisional client.
    Datagram,
}

/// Drives one client: splits incoming bytes into frames and dispatches each
/// to its handler in arrival order.
///
/// ```
/// use caserve_core::{EngineConfig, Server, Session};
/// use caserve_db::{MemoryDatabase, PvValue};
/// use caserve_wire::{Command, FrameDecoder, Header, SEARCH_DO_REPLY, encode_frame, encode_name};
/// use std::sync::Arc;
///
/// let db = Arc::new(MemoryDatabase::new());
/// db.add_record("PV:1", PvValue::Double(vec![1.5]));
/// let server = Server::new(db, EngineConfig::default()).expect("server");
/// let mut session = Session::stream(&server, "doc");
///
/// let mut request = bytes::BytesMut::new();
/// let mut search = Header::new(Command::Search).with_token(7);
/// search.data_type = SEARCH_DO_REPLY;
/// encode_frame(&mut request, &search, &encode_name("PV:1"));
/// session.on_bytes_received(&request).expect("dispatch");
///
/// let mut decoder = FrameDecoder::new(1024);
/// decoder.extend(&session.take_outbound().expect("reply"));
/// let reply = decoder.next_frame().expect("decode").expect("frame");
/// assert_eq!(reply.header.command(), Some(Command::Search));
/// assert_eq!(reply.header.token, 7);
/// ```
pub struct Session {
    server: Arc<Server>,
    client: Arc<Client>,
    decoder: FrameDecoder,
    origin: Origin,
}

impl Session {
    pub fn stream(server: &Arc<Server>, label: impl Into<String>) -> Self {
        let client = server.connect(label);
        Self::with_client(server, client, Origin::Stream)
    }

    pub fn datagram(server: &Arc<Server>) -> Self {
        let client = Arc::clone(server.provisional());
        Self::with_client(server, client, Origin::Datagram)
    }

    fn with_client(server: &Arc<Server>, client: Arc<Client>, origin: Origin) -> Self {
        Self {
            decoder: FrameDecoder::new(server.config().max_frame_bytes),
            server: Arc::clone(server),
            client,
            origin,
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Feed newly arrived bytes. Every complete frame is dispatched before
    /// returning; a trailing partial frame stays buffered. Returns the
    /// number of frames dispatched. Fails with [`SessionError::Closed`] once
    /// the client or the server has shut down.
    pub fn on_bytes_received(&mut self, bytes: &[u8]) -> Result<usize, SessionError> {
        if self.client.is_closed() {
            return Err(SessionError::Closed);
        }
        self.decoder.extend(bytes);
        let mut dispatched = 0;
        while let Some(frame) = self.decoder.next_frame()? {
            metrics::counter!("caserve_frames_in_total").increment(1);
            let Some(_admitted) = self.server.admit() else {
                return Err(SessionError::Closed);
            };
            self.dispatch(frame)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Process one datagram. Datagrams carry whole frames, so leftover bytes
    /// are discarded rather than joined with the next datagram.
    pub fn on_datagram(&mut self, bytes: &[u8]) -> Result<usize, SessionError> {
        let result = self.on_bytes_received(bytes);
        if self.decoder.buffered() > 0 || result.is_err() {
            self.decoder = FrameDecoder::new(self.server.config().max_frame_bytes);
        }
        result
    }

    /// Bytes ready to be written to the peer.
    pub fn take_outbound(&self) -> Option<Bytes> {
        self.server.take_outbound(&self.client)
    }

    /// Release everything the connection owns. Idempotent.
    pub fn on_connection_closed(&mut self) {
        if self.origin == Origin::Stream {
            self.server.disconnect(&self.client);
        }
    }

    fn dispatch(&self, frame: Frame) -> Result<(), SessionError> {
        let Frame { header, payload } = frame;
        let server = &self.server;
        let client = &self.client;
        let Some(command) = header.command() else {
            return self.unknown(&header);
        };
        tracing::trace!(client = %client.id(), command = command.name(), "dispatch");
        if self.origin == Origin::Datagram
            && !matches!(command, Command::Noop | Command::Search | Command::Build)
        {
            tracing::debug!(command = command.name(), "request ignored on datagram path");
            return Ok(());
        }
        match command {
            Command::Noop => {}
            Command::Search => {
                let reply = header.data_type == SEARCH_DO_REPLY;
                server.search(client, &header, decode_name(&payload).ok(), reply);
            }
            Command::Build => {
                let stream = self.origin == Origin::Stream;
                server.build(client, &header, decode_name(&payload).ok(), stream);
            }
            Command::ClaimChannel => server.claim(client, &header),
            Command::ClearChannel => server.clear(client, &header)?,
            Command::EventAdd => server.event_add(client, &header, &payload),
            Command::EventCancel => server.event_cancel(client, &header),
            Command::EventsOff => server.events_off(client),
            Command::EventsOn => server.events_on(client),
            Command::Read => server.read(client, &header),
            Command::ReadNotify => server.read_notify(client, &header),
            Command::Write => server.write(client, &header, &payload),
            Command::WriteNotify => server.write_notify(client, &header, &payload),
            Command::ReadSync => client.reply().frame(&header.with_payload_size(0), &[]),
            // Server-to-client replies are not valid requests.
            Command::Error | Command::NotFound => return self.unknown(&header),
        }
        Ok(())
    }

    fn unknown(&self, header: &Header) -> Result<(), SessionError> {
        metrics::counter!("caserve_unknown_command_total").increment(1);
        self.client
            .reply()
            .error(header, Status::Internal, "unsupported command");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.on_connection_closed();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.client.id())
            .field("origin", &self.origin)
            .field("buffered", &self.decoder.buffered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{be_f64, drain, frame, server_with};
    use caserve_db::PvValue;
    use caserve_wire::{DbrType, EventAddRequest, SEARCH_DONT_REPLY, encode_name};
    use std::time::Duration;

    const VALUE_MASK: u16 = 0x1;

    fn search(cid: u32, name: &str, reply: bool) -> Vec<u8> {
        let mut header = Header::new(Command::Search).with_token(cid);
        header.data_type = if reply { SEARCH_DO_REPLY } else { SEARCH_DONT_REPLY };
        frame(header, &encode_name(name))
    }

    fn event_add(sid: u32, token: u32, mask: u16) -> Vec<u8> {
        let header = Header {
            command: Command::EventAdd.code(),
            payload_size: 0,
            data_type: DbrType::Double.code(),
            count: 1,
            handle: sid,
            token,
        };
        frame(header, &EventAddRequest::new(mask).encode())
    }

    fn request(command: Command, sid: u32, token: u32) -> Vec<u8> {
        let header = Header {
            command: command.code(),
            payload_size: 0,
            data_type: DbrType::Double.code(),
            count: 1,
            handle: sid,
            token,
        };
        frame(header, &[])
    }

    fn open(session: &mut Session, name: &str) -> u32 {
        session
            .on_bytes_received(&search(1, name, true))
            .expect("search");
        let replies = drain(session);
        assert_eq!(replies[0].header.command(), Some(Command::Search));
        replies[0].header.handle
    }

    #[tokio::test]
    async fn search_registers_channel_in_resource_table() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        session
            .on_bytes_received(&search(42, "PV:1", true))
            .expect("search");
        let replies = drain(&session);
        assert_eq!(replies.len(), 1);
        let reply = replies[0].header;
        assert_eq!(reply.token, 42);
        assert_eq!(reply.data_type, DbrType::Double.code());
        assert_eq!(reply.count, 1);

        let (owner, cid) = server.resolve_sid(reply.handle).expect("registered");
        assert!(Arc::ptr_eq(&owner, session.client()));
        assert_eq!(cid, 42);
        assert_eq!(session.client().channel_count(), 1);
    }

    #[tokio::test]
    async fn failed_search_replies_only_when_asked() {
        let (server, _db) = server_with(&[]);
        let mut session = Session::stream(&server, "test");
        session
            .on_bytes_received(&search(1, "missing", false))
            .expect("search");
        assert!(drain(&session).is_empty());

        session
            .on_bytes_received(&search(2, "missing", true))
            .expect("search");
        let replies = drain(&session);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].header.command(), Some(Command::NotFound));
        assert_eq!(replies[0].header.token, 2);
    }

    #[tokio::test]
    async fn build_piggybacks_initial_value() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![2.5]))]);
        let mut session = Session::stream(&server, "test");
        let mut header = Header::new(Command::Build).with_token(9);
        header.data_type = DbrType::Double.code();
        header.count = 1;
        session
            .on_bytes_received(&frame(header, &encode_name("PV:1")))
            .expect("build");
        let replies = drain(&session);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].header.command(), Some(Command::Build));
        assert_eq!(replies[1].header.command(), Some(Command::Read));
        assert_eq!(replies[1].header.handle, replies[0].header.handle);
        assert_eq!(be_f64(&replies[1].payload), 2.5);
    }

    #[tokio::test]
    async fn replies_follow_request_order() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        let mut batch = Vec::new();
        for token in 0..5 {
            batch.extend(request(Command::Read, sid, token));
            batch.extend(request(Command::ReadSync, 0, 100 + token));
        }
        assert_eq!(session.on_bytes_received(&batch).expect("batch"), 10);
        let tokens: Vec<u32> = drain(&session).iter().map(|f| f.header.token).collect();
        assert_eq!(tokens, vec![0, 100, 1, 101, 2, 102, 3, 103, 4, 104]);
    }

    #[tokio::test]
    async fn partial_frame_waits_for_rest() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        let bytes = search(3, "PV:1", true);
        assert_eq!(session.on_bytes_received(&bytes[..18]).expect("partial"), 0);
        assert!(drain(&session).is_empty());
        assert_eq!(session.on_bytes_received(&bytes[18..]).expect("rest"), 1);
        assert_eq!(drain(&session).len(), 1);
    }

    #[tokio::test]
    async fn unknown_command_is_reported_and_processing_continues() {
        let (server, _db) = server_with(&[]);
        let mut session = Session::stream(&server, "test");
        let bogus = Header {
            command: 0x0055,
            payload_size: 0,
            data_type: 0,
            count: 0,
            handle: 77,
            token: 5,
        };
        let mut batch = frame(bogus, b"abcd");
        batch.extend(request(Command::ReadSync, 0, 6));
        assert_eq!(session.on_bytes_received(&batch).expect("batch"), 2);
        let replies = drain(&session);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].header.command(), Some(Command::Error));
        assert_eq!(replies[0].header.handle, 77);
        assert_eq!(
            Status::from_code(replies[0].header.token),
            Some(Status::Internal)
        );
        let (echoed, _) = Header::decode(&replies[0].payload).expect("echoed header");
        assert_eq!(echoed.command, 0x0055);
        assert_eq!(replies[1].header.token, 6);
    }

    #[tokio::test]
    async fn oversized_frame_is_fatal() {
        let db = Arc::new(caserve_db::MemoryDatabase::new());
        let config = crate::EngineConfig {
            max_frame_bytes: 64,
            ..Default::default()
        };
        let server = Server::new(db, config).expect("server");
        let mut session = Session::stream(&server, "test");
        let err = session
            .on_bytes_received(&frame(Header::new(Command::Write), &[0; 128]))
            .expect_err("fatal");
        assert!(matches!(err, SessionError::Frame(_)));
    }

    #[tokio::test]
    async fn subscribe_flow_off_then_on_delivers_latest_once() {
        let (server, db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");

        session
            .on_bytes_received(&event_add(sid, 11, VALUE_MASK))
            .expect("event add");
        let initial = drain(&session);
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].header.command(), Some(Command::EventAdd));
        assert_eq!(initial[0].header.token, 11);
        assert_eq!(be_f64(&initial[0].payload), 1.0);

        session
            .on_bytes_received(&request(Command::EventsOff, 0, 0))
            .expect("events off");
        for value in [2.0, 3.0, 4.0] {
            db.set("PV:1", PvValue::Double(vec![value])).expect("set");
        }
        assert!(drain(&session).is_empty());

        session
            .on_bytes_received(&request(Command::EventsOn, 0, 0))
            .expect("events on");
        let flushed = drain(&session);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].header.token, 11);
        assert_eq!(be_f64(&flushed[0].payload), 4.0);

        // Nothing left to flush on a second toggle.
        session
            .on_bytes_received(&request(Command::EventsOn, 0, 0))
            .expect("events on");
        assert!(drain(&session).is_empty());
    }

    #[tokio::test]
    async fn live_updates_flow_while_gate_is_on() {
        let (server, db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        session
            .on_bytes_received(&event_add(sid, 1, VALUE_MASK))
            .expect("event add");
        drain(&session);
        db.set("PV:1", PvValue::Double(vec![5.0])).expect("set");
        db.set("PV:1", PvValue::Double(vec![6.0])).expect("set");
        let updates = drain(&session);
        assert_eq!(updates.len(), 2);
        assert_eq!(be_f64(&updates[1].payload), 6.0);
    }

    #[tokio::test]
    async fn event_add_validates_request() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");

        session
            .on_bytes_received(&event_add(sid, 1, 0))
            .expect("event add");
        session
            .on_bytes_received(&event_add(sid + 1000, 2, VALUE_MASK))
            .expect("event add");
        let mut bad_type = Header::new(Command::EventAdd).with_handle(sid).with_token(3);
        bad_type.data_type = 99;
        bad_type.count = 1;
        session
            .on_bytes_received(&frame(bad_type, &EventAddRequest::new(1).encode()))
            .expect("event add");

        let statuses: Vec<_> = drain(&session)
            .iter()
            .map(|f| Status::from_code(f.header.token))
            .collect();
        assert_eq!(
            statuses,
            vec![
                Some(Status::BadMask),
                Some(Status::BadChannel),
                Some(Status::BadType)
            ]
        );
        assert_eq!(server.stats().subscriptions.outstanding, 0);
    }

    #[tokio::test]
    async fn event_cancel_confirms_and_releases() {
        let (server, db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        session
            .on_bytes_received(&event_add(sid, 21, VALUE_MASK))
            .expect("event add");
        drain(&session);
        assert_eq!(db.monitor_count(), 1);

        session
            .on_bytes_received(&request(Command::EventCancel, sid, 21))
            .expect("cancel");
        let replies = drain(&session);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].header.command(), Some(Command::EventCancel));
        assert!(replies[0].payload.is_empty());
        assert_eq!(db.monitor_count(), 0);
        assert_eq!(server.stats().subscriptions.outstanding, 0);

        session
            .on_bytes_received(&request(Command::EventCancel, sid, 21))
            .expect("cancel");
        let replies = drain(&session);
        assert_eq!(
            Status::from_code(replies[0].header.token),
            Some(Status::EventNotFound)
        );
    }

    #[tokio::test]
    async fn clear_returns_every_subscription_and_stales_callbacks() {
        let (server, db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        for token in 0..3 {
            session
                .on_bytes_received(&event_add(sid, token, VALUE_MASK))
                .expect("event add");
        }
        drain(&session);
        let before = server.stats();
        assert_eq!(before.subscriptions.outstanding, 3);
        assert_eq!(before.channels.outstanding, 1);

        session
            .on_bytes_received(&request(Command::ClearChannel, sid, 1))
            .expect("clear");
        let replies = drain(&session);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].header.command(), Some(Command::ClearChannel));

        let after = server.stats();
        assert_eq!(after.subscriptions.outstanding, 0);
        assert_eq!(after.subscriptions.free, before.subscriptions.free + 3);
        assert_eq!(after.channels.outstanding, 0);
        assert_eq!(session.client().channel_count(), 0);
        assert_eq!(db.monitor_count(), 0);

        // A delivery racing the clear finds nothing and writes nothing.
        server.deliver(session.client(), sid, 1);
        assert!(drain(&session).is_empty());
        assert_eq!(db.set("PV:1", PvValue::Double(vec![9.0])).expect("set"), 0);
        assert!(drain(&session).is_empty());
    }

    #[tokio::test]
    async fn second_clear_is_a_lifetime_violation() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        session
            .on_bytes_received(&request(Command::ClearChannel, sid, 1))
            .expect("first clear");
        drain(&session);
        let err = session
            .on_bytes_received(&request(Command::ClearChannel, sid, 1))
            .expect_err("second clear");
        assert!(matches!(err, SessionError::LifetimeViolation(_)));
        let replies = drain(&session);
        assert_eq!(
            Status::from_code(replies[0].header.token),
            Some(Status::BadChannel)
        );
    }

    #[tokio::test]
    async fn read_and_write_round_trip_with_conversion() {
        let (server, db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");

        let write = Header {
            command: Command::Write.code(),
            payload_size: 0,
            data_type: DbrType::Long.code(),
            count: 1,
            handle: sid,
            token: 1,
        };
        session
            .on_bytes_received(&frame(write, &7i32.to_be_bytes()))
            .expect("write");
        assert!(drain(&session).is_empty());
        assert_eq!(db.value("PV:1"), Some(PvValue::Double(vec![7.0])));

        let mut read = write.with_command(Command::Read).with_token(2);
        read.data_type = DbrType::Short.code();
        session.on_bytes_received(&frame(read, &[])).expect("read");
        let replies = drain(&session);
        assert_eq!(replies[0].payload.as_ref(), &[0, 7]);

        // Too short for one LONG.
        session
            .on_bytes_received(&frame(write.with_token(3), &[0, 1]))
            .expect("write");
        let replies = drain(&session);
        assert_eq!(
            Status::from_code(replies[0].header.token),
            Some(Status::BadPayload)
        );
    }

    #[tokio::test]
    async fn write_notify_reports_status_in_handle() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        let header = Header {
            command: Command::WriteNotify.code(),
            payload_size: 0,
            data_type: DbrType::Double.code(),
            count: 1,
            handle: sid,
            token: 33,
        };
        session
            .on_bytes_received(&frame(header, &2.0f64.to_be_bytes()))
            .expect("write notify");
        let replies = drain(&session);
        assert_eq!(replies[0].header.command(), Some(Command::WriteNotify));
        assert_eq!(replies[0].header.token, 33);
        assert_eq!(Status::from_code(replies[0].header.handle), Some(Status::Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_write_notify_times_out() {
        let (server, db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        db.defer_put_notify(true);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        let header = Header {
            command: Command::WriteNotify.code(),
            payload_size: 0,
            data_type: DbrType::Double.code(),
            count: 1,
            handle: sid,
            token: 44,
        };
        session
            .on_bytes_received(&frame(header, &2.0f64.to_be_bytes()))
            .expect("write notify");
        assert!(drain(&session).is_empty());

        // Newer synchronous requests are answered before the parked put.
        session
            .on_bytes_received(&request(Command::ReadSync, 0, 45))
            .expect("read sync");
        assert_eq!(drain(&session)[0].header.token, 45);

        tokio::time::sleep(server.config().put_notify_timeout + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        let replies = drain(&session);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].header.token, 44);
        assert_eq!(Status::from_code(replies[0].header.handle), Some(Status::Timeout));
    }

    #[tokio::test]
    async fn deferred_write_notify_completes() {
        let (server, db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        db.defer_put_notify(true);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        let header = Header {
            command: Command::WriteNotify.code(),
            payload_size: 0,
            data_type: DbrType::Double.code(),
            count: 1,
            handle: sid,
            token: 50,
        };
        session
            .on_bytes_received(&frame(header, &8.0f64.to_be_bytes()))
            .expect("write notify");
        assert_eq!(db.complete_deferred_puts(), 1);
        let replies = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let replies = drain(&session);
                if !replies.is_empty() {
                    return replies;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("completion reply");
        assert_eq!(Status::from_code(replies[0].header.handle), Some(Status::Normal));
        assert_eq!(db.value("PV:1"), Some(PvValue::Double(vec![8.0])));
    }

    fn double_request(command: Command, sid: u32, token: u32) -> Header {
        Header {
            command: command.code(),
            payload_size: 0,
            data_type: DbrType::Double.code(),
            count: 1,
            handle: sid,
            token,
        }
    }

    fn wait_for_replies(session: &Session) -> Vec<Frame> {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let replies = drain(session);
            if !replies.is_empty() {
                return replies;
            }
            assert!(std::time::Instant::now() < deadline, "no reply");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[tokio::test]
    async fn read_notify_reports_status_in_handle() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![6.5]))]);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        session
            .on_bytes_received(&frame(double_request(Command::ReadNotify, sid, 21), &[]))
            .expect("read notify");
        let replies = drain(&session);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].header.command(), Some(Command::ReadNotify));
        assert_eq!(replies[0].header.token, 21);
        assert_eq!(Status::from_code(replies[0].header.handle), Some(Status::Normal));
        assert_eq!(be_f64(&replies[0].payload), 6.5);
    }

    #[tokio::test]
    async fn deferred_read_notify_completes_with_current_value() {
        let (server, db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        db.defer_get_notify(true);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        session
            .on_bytes_received(&frame(double_request(Command::ReadNotify, sid, 22), &[]))
            .expect("read notify");
        assert!(drain(&session).is_empty());
        assert_eq!(db.deferred_get_count(), 1);

        db.set("PV:1", PvValue::Double(vec![3.25])).expect("set");
        assert_eq!(db.complete_deferred_gets(), 1);
        let replies = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let replies = drain(&session);
                if !replies.is_empty() {
                    return replies;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("completion reply");
        assert_eq!(replies[0].header.command(), Some(Command::ReadNotify));
        assert_eq!(replies[0].header.token, 22);
        assert_eq!(Status::from_code(replies[0].header.handle), Some(Status::Normal));
        assert_eq!(be_f64(&replies[0].payload), 3.25);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_read_notify_times_out_with_zeroed_value() {
        let (server, db) = server_with(&[("PV:1", PvValue::Double(vec![9.0]))]);
        db.defer_get_notify(true);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        session
            .on_bytes_received(&frame(double_request(Command::ReadNotify, sid, 23), &[]))
            .expect("read notify");
        assert!(drain(&session).is_empty());

        tokio::time::sleep(server.config().put_notify_timeout + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        let replies = drain(&session);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].header.token, 23);
        assert_eq!(Status::from_code(replies[0].header.handle), Some(Status::Timeout));
        assert_eq!(replies[0].payload.as_ref(), &[0u8; 8]);
        // The late answer finds nobody waiting.
        assert_eq!(db.complete_deferred_gets(), 0);
    }

    #[test]
    fn parked_notify_without_runtime_fails_with_internal() {
        let (server, db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        db.defer_put_notify(true);
        db.defer_get_notify(true);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        session
            .on_bytes_received(&frame(
                double_request(Command::WriteNotify, sid, 60),
                &2.0f64.to_be_bytes(),
            ))
            .expect("write notify");
        session
            .on_bytes_received(&frame(double_request(Command::ReadNotify, sid, 61), &[]))
            .expect("read notify");
        let replies = drain(&session);
        assert_eq!(replies.len(), 2);
        for reply in &replies {
            assert_eq!(reply.header.command(), Some(Command::Error));
            assert_eq!(reply.header.handle, sid);
            assert_eq!(Status::from_code(reply.header.token), Some(Status::Internal));
        }
        assert_eq!(session.client().pending_count(), 0);

        // The session keeps serving requests.
        session
            .on_bytes_received(&request(Command::ReadSync, 0, 62))
            .expect("read sync");
        assert_eq!(drain(&session)[0].header.token, 62);
    }

    #[test]
    fn parked_notify_completes_on_the_server_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .expect("runtime");
        let (server, db) = {
            let _entered = runtime.enter();
            server_with(&[("PV:1", PvValue::Double(vec![1.0]))])
        };
        db.defer_put_notify(true);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        session
            .on_bytes_received(&frame(
                double_request(Command::WriteNotify, sid, 63),
                &4.0f64.to_be_bytes(),
            ))
            .expect("write notify");
        assert!(drain(&session).is_empty());
        assert_eq!(session.client().pending_count(), 1);

        assert_eq!(db.complete_deferred_puts(), 1);
        let replies = wait_for_replies(&session);
        assert_eq!(replies[0].header.command(), Some(Command::WriteNotify));
        assert_eq!(replies[0].header.token, 63);
        assert_eq!(Status::from_code(replies[0].header.handle), Some(Status::Normal));
        assert_eq!(db.value("PV:1"), Some(PvValue::Double(vec![4.0])));
        drop(session);
        server.shutdown();
    }

    #[tokio::test]
    async fn unparsable_string_write_is_bad_string() {
        let (server, db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        let mut text = [0u8; 40];
        text[..5].copy_from_slice(b"hello");
        let mut write = double_request(Command::Write, sid, 70);
        write.data_type = DbrType::String.code();
        session
            .on_bytes_received(&frame(write, &text))
            .expect("write");
        let replies = drain(&session);
        assert_eq!(replies[0].header.command(), Some(Command::Error));
        assert_eq!(
            Status::from_code(replies[0].header.token),
            Some(Status::BadString)
        );

        let notify = write.with_command(Command::WriteNotify).with_token(71);
        session
            .on_bytes_received(&frame(notify, &text))
            .expect("write notify");
        let replies = drain(&session);
        assert_eq!(replies[0].header.command(), Some(Command::WriteNotify));
        assert_eq!(
            Status::from_code(replies[0].header.handle),
            Some(Status::BadString)
        );

        text[..5].copy_from_slice(b" 12.5");
        session
            .on_bytes_received(&frame(write.with_token(72), &text))
            .expect("write");
        assert!(drain(&session).is_empty());
        assert_eq!(db.value("PV:1"), Some(PvValue::Double(vec![12.5])));
    }

    #[tokio::test]
    async fn repeated_datagram_searches_share_one_channel() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut udp = Session::datagram(&server);
        udp.on_datagram(&search(5, "PV:1", true)).expect("search");
        udp.on_datagram(&search(6, "PV:1", true)).expect("search");
        let replies = drain(&udp);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].header.handle, replies[1].header.handle);
        assert_eq!(replies[1].header.token, 6);
        assert_eq!(server.provisional().channel_count(), 1);
        let sid = replies[0].header.handle;

        // A claimed channel is no longer handed out to searches.
        let mut tcp = Session::stream(&server, "test");
        tcp.on_bytes_received(&request(Command::ClaimChannel, sid, 77))
            .expect("claim");
        drain(&tcp);
        udp.on_datagram(&search(7, "PV:1", true)).expect("search");
        let fresh = drain(&udp)[0].header.handle;
        assert_ne!(fresh, sid);

        // Nor is a reaped one.
        assert_eq!(server.reap_provisional(Duration::ZERO), 1);
        udp.on_datagram(&search(8, "PV:1", true)).expect("search");
        let again = drain(&udp)[0].header.handle;
        assert_ne!(again, fresh);
        assert_eq!(server.provisional().channel_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_refuses_further_requests() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut session = Session::stream(&server, "test");
        open(&mut session, "PV:1");
        let mut udp = Session::datagram(&server);
        udp.on_datagram(&search(5, "PV:1", false)).expect("search");
        server.shutdown();
        assert!(server.is_shut_down());
        assert!(matches!(
            session.on_bytes_received(&search(2, "PV:1", true)),
            Err(SessionError::Closed)
        ));
        assert!(matches!(
            udp.on_datagram(&search(6, "PV:1", true)),
            Err(SessionError::Closed)
        ));
        let stats = server.stats();
        assert_eq!(stats.channels.outstanding, 0);
        assert_eq!(stats.resources.entries, 0);
    }

    #[tokio::test]
    async fn datagram_search_then_claim_moves_channel() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut udp = Session::datagram(&server);
        udp.on_datagram(&search(5, "PV:1", true)).expect("search");
        let sid = drain(&udp)[0].header.handle;
        assert_eq!(server.provisional().channel_count(), 1);

        let mut tcp = Session::stream(&server, "test");
        tcp.on_bytes_received(&request(Command::ClaimChannel, sid, 77))
            .expect("claim");
        let replies = drain(&tcp);
        assert_eq!(replies[0].header.command(), Some(Command::ClaimChannel));
        assert_eq!(replies[0].header.handle, sid);
        assert_eq!(server.provisional().channel_count(), 0);
        assert_eq!(tcp.client().channel_count(), 1);
        let (owner, cid) = server.resolve_sid(sid).expect("registered");
        assert!(Arc::ptr_eq(&owner, tcp.client()));
        assert_eq!(cid, 77);

        // Already claimed.
        tcp.on_bytes_received(&request(Command::ClaimChannel, sid, 78))
            .expect("claim");
        assert_eq!(
            Status::from_code(drain(&tcp)[0].header.token),
            Some(Status::BadChannel)
        );
    }

    #[tokio::test]
    async fn datagram_path_ignores_channel_requests_and_partial_frames() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut udp = Session::datagram(&server);
        udp.on_datagram(&request(Command::Read, 1, 1)).expect("read");
        assert!(drain(&udp).is_empty());
        let bytes = search(5, "PV:1", true);
        udp.on_datagram(&bytes[..10]).expect("partial");
        udp.on_datagram(&bytes).expect("whole");
        assert_eq!(drain(&udp).len(), 1);
    }

    #[tokio::test]
    async fn provisional_channels_are_reaped() {
        let (server, _db) = server_with(&[("PV:1", PvValue::Double(vec![1.0]))]);
        let mut udp = Session::datagram(&server);
        udp.on_datagram(&search(5, "PV:1", false)).expect("search");
        drain(&udp);
        assert_eq!(server.reap_provisional(Duration::from_secs(60)), 0);
        assert_eq!(server.reap_provisional(Duration::ZERO), 1);
        assert_eq!(server.provisional().channel_count(), 0);
        assert!(server.stats().resources.entries == 0);
    }

    #[tokio::test]
    async fn backpressure_coalesces_until_drained() {
        let db = Arc::new(caserve_db::MemoryDatabase::new());
        db.add_record("PV:1", PvValue::Double(vec![0.0]));
        let config = crate::EngineConfig {
            max_send_bytes: 1,
            ..Default::default()
        };
        let server = Server::new(db.clone(), config).expect("server");
        let mut session = Session::stream(&server, "test");
        let sid = open(&mut session, "PV:1");
        session
            .on_bytes_received(&event_add(sid, 1, VALUE_MASK))
            .expect("event add");
        // Initial value is buffered and puts the client over the mark.
        for value in 1..=5 {
            db.set("PV:1", PvValue::Double(vec![f64::from(value)]))
                .expect("set");
        }
        let first = session.take_outbound().expect("initial");
        assert_eq!(first.len(), 16 + 8);
        let second = drain(&session);
        assert_eq!(second.len(), 1);
        assert_eq!(be_f64(&second[0].payload), 5.0);
    }

    #[tokio::test]
    async fn disconnect_releases_everything() {
        let (server, db) = server_with(&[
            ("PV:1", PvValue::Double(vec![1.0])),
            ("PV:2", PvValue::Double(vec![2.0])),
        ]);
        let mut session = Session::stream(&server, "test");
        let a = open(&mut session, "PV:1");
        let b = open(&mut session, "PV:2");
        for (sid, token) in [(a, 1), (a, 2), (b, 3)] {
            session
                .on_bytes_received(&event_add(sid, token, VALUE_MASK))
                .expect("event add");
        }
        assert_eq!(server.client_count(), 1);
        session.on_connection_closed();
        session.on_connection_closed();
        assert_eq!(server.client_count(), 0);
        assert_eq!(db.monitor_count(), 0);
        let stats = server.stats();
        assert_eq!(stats.channels.outstanding, 0);
        assert_eq!(stats.subscriptions.outstanding, 0);
        assert!(matches!(
            session.on_bytes_received(&request(Command::ReadSync, 0, 1)),
            Err(SessionError::Closed)
        ));
        drop(session);
        server.shutdown();
    }
}
