// Channel lifecycle: search, build, claim, clear and client teardown.
use caserve_db::{DbAddr, EventMask, SubscriptionToken};
use caserve_wire::{Command, DbrType, Header, Status};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::Client;
use crate::pool::Recycle;
use crate::{ChannelRef, Key, Server, SessionError};

/// One claimed PV handle within a client.
#[derive(Debug, Default)]
pub struct Channel {
    pub(crate) sid: u32,
    pub(crate) cid: u32,
    pub(crate) addr: Option<DbAddr>,
    pub(crate) created: Option<Instant>,
    pub(crate) subscriptions: SmallVec<[Box<Subscription>; 4]>,
}

impl Channel {
    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn addr(&self) -> Option<&DbAddr> {
        self.addr.as_ref()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Recycle for Channel {
    fn recycle(&mut self) {
        debug_assert!(
            self.subscriptions.is_empty(),
            "channel recycled with live subscriptions"
        );
        self.sid = 0;
        self.cid = 0;
        self.addr = None;
        self.created = None;
        self.subscriptions.clear();
    }
}

/// One active monitor on a channel.
#[derive(Debug, Default)]
pub struct Subscription {
    // Engine-wide id captured by the database callback.
    pub(crate) event_id: u64,
    // Original EVENT_ADD header, echoed on every update.
    pub(crate) header: Header,
    pub(crate) dbr_type: Option<DbrType>,
    pub(crate) mask: EventMask,
    // An update arrived while delivery was suppressed.
    pub(crate) modified: bool,
    pub(crate) db_token: Option<SubscriptionToken>,
}

impl Subscription {
    pub fn mask(&self) -> EventMask {
        self.mask
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

impl Recycle for Subscription {
    fn recycle(&mut self) {
        self.event_id = 0;
        self.header = Header::default();
        self.dbr_type = None;
        self.mask = EventMask::default();
        self.modified = false;
        self.db_token = None;
    }
}

/// A channel unlinked from every table, ready to be released.
pub(crate) struct Detached {
    pub(crate) channel: Box<Channel>,
}

impl Server {
    /// Run `f` on `client`'s channel `sid`. The sid must be registered to
    /// this client and the slab slot must still hold it.
    pub(crate) fn with_channel<R>(
        &self,
        client: &Arc<Client>,
        sid: u32,
        f: impl FnOnce(&mut Channel) -> R,
    ) -> Option<R> {
        let resources = self.resources.lock();
        let entry = resources.lookup(Key::Unsigned(sid))?;
        if !std::ptr::eq(entry.owner.as_ptr(), Arc::as_ptr(client)) {
            return None;
        }
        let mut channels = client.channels.lock();
        let channel = channels.get_mut(entry.slot)?;
        if channel.sid != sid {
            return None;
        }
        Some(f(channel))
    }

    pub(crate) fn channel_addr(&self, client: &Arc<Client>, sid: u32) -> Option<DbAddr> {
        self.with_channel(client, sid, |channel| channel.addr.clone())
            .flatten()
    }

    /// Resolve `name` and link a new channel into `client`.
    fn open_channel(&self, client: &Arc<Client>, name: &str, cid: u32) -> OpenOutcome {
        let Some(addr) = self.db.resolve(name) else {
            return OpenOutcome::NotFound;
        };
        let mut channel = self.channel_pool.acquire();
        channel.cid = cid;
        channel.addr = Some(addr.clone());
        channel.created = Some(Instant::now());
        match self.link_channel(client, channel) {
            Ok(sid) => {
                metrics::gauge!("caserve_channels_active").increment(1.0);
                OpenOutcome::Linked { sid, addr }
            }
            Err(channel) => {
                self.channel_pool.release(channel);
                OpenOutcome::Exhausted
            }
        }
    }

    fn open(&self, client: &Arc<Client>, name: Option<&str>, cid: u32) -> OpenOutcome {
        let Some(name) = name else {
            return OpenOutcome::NotFound;
        };
        if Arc::ptr_eq(client, self.provisional()) {
            self.open_provisional(name, cid)
        } else {
            self.open_channel(client, name, cid)
        }
    }

    // Discovery searches are repeated, so one provisional channel answers
    // every search for a name until it is claimed or reaped.
    fn open_provisional(&self, name: &str, cid: u32) -> OpenOutcome {
        let provisional = self.provisional();
        let mut names = self.provisional_names.lock();
        if let Some(&sid) = names.lookup(Key::Str(name)) {
            if let Some(addr) = self.channel_addr(provisional, sid) {
                metrics::counter!("caserve_search_reused_total").increment(1);
                return OpenOutcome::Linked { sid, addr };
            }
            let _ = names.remove(Key::Str(name));
        }
        let outcome = self.open_channel(provisional, name, cid);
        if let OpenOutcome::Linked { sid, .. } = &outcome
            && let Err(err) = names.insert(Key::Str(name), *sid)
        {
            tracing::warn!(pv = name, sid, error = %err, "provisional channel not indexed");
        }
        outcome
    }

    fn forget_provisional(&self, name: &str, sid: u32) {
        let mut names = self.provisional_names.lock();
        if names.lookup(Key::Str(name)) == Some(&sid) {
            let _ = names.remove(Key::Str(name));
        }
    }

    // Either the channel ends up in both the slab and the resource table,
    // or in neither.
    fn link_channel(
        &self,
        client: &Arc<Client>,
        mut channel: Box<Channel>,
    ) -> Result<u32, Box<Channel>> {
        let mut resources = self.resources.lock();
        // Teardown takes the resource lock after marking the client closed.
        if client.is_closed() {
            return Err(channel);
        }
        let Some(sid) = self.allocate_sid(&resources) else {
            return Err(channel);
        };
        channel.sid = sid;
        let slot = client.channels.lock().insert(channel);
        let entry = ChannelRef {
            owner: Arc::downgrade(client),
            slot,
        };
        match resources.insert(Key::Unsigned(sid), entry) {
            Ok(()) => Ok(sid),
            Err(err) => {
                tracing::warn!(sid, error = %err, "channel registration rolled back");
                Err(client.channels.lock().remove(slot))
            }
        }
    }

    pub(crate) fn search(
        &self,
        client: &Arc<Client>,
        header: &Header,
        name: Option<&str>,
        reply_on_failure: bool,
    ) {
        let mut out = client.reply();
        let outcome = self.open(client, name, header.token);
        match outcome {
            OpenOutcome::Linked { sid, addr } => {
                tracing::debug!(client = %client.id(), pv = %addr.name, sid, "search resolved");
                out.frame(&resolved_reply(Command::Search, header, sid, &addr), &[]);
            }
            OpenOutcome::NotFound => {
                metrics::counter!("caserve_search_miss_total").increment(1);
                if reply_on_failure {
                    out.frame(&header.with_command(Command::NotFound), &[]);
                }
            }
            OpenOutcome::Exhausted => {
                out.error(header, Status::AllocMem, "no channel resources");
            }
        }
    }

    /// Search plus an initial read, replied under one send lock so the value
    /// immediately follows the channel reply.
    pub(crate) fn build(
        &self,
        client: &Arc<Client>,
        header: &Header,
        name: Option<&str>,
        stream: bool,
    ) {
        let mut out = client.reply();
        let outcome = self.open(client, name, header.token);
        match outcome {
            OpenOutcome::Linked { sid, addr } => {
                out.frame(&resolved_reply(Command::Build, header, sid, &addr), &[]);
                let (data_type, count) = if header.count == 0 {
                    (addr.native_type.code(), addr.element_count)
                } else {
                    (header.data_type, header.count)
                };
                let read = Header {
                    command: Command::Read.code(),
                    payload_size: 0,
                    data_type,
                    count,
                    handle: sid,
                    token: header.token,
                };
                self.read_into(&mut out, &read, &addr);
            }
            OpenOutcome::NotFound => {
                metrics::counter!("caserve_search_miss_total").increment(1);
                if stream {
                    out.frame(&header.with_command(Command::NotFound), &[]);
                }
            }
            OpenOutcome::Exhausted => {
                out.error(header, Status::AllocMem, "no channel resources");
            }
        }
    }

    /// Move a provisional channel onto `client` without reallocating it.
    pub(crate) fn claim(&self, client: &Arc<Client>, header: &Header) {
        let sid = header.handle;
        let mut out = client.reply();
        match self.transfer(client, sid, header.token) {
            Some(addr) => {
                self.forget_provisional(&addr.name, sid);
                tracing::debug!(client = %client.id(), sid, "provisional channel claimed");
                out.frame(&resolved_reply(Command::ClaimChannel, header, sid, &addr), &[]);
            }
            None => out.error(header, Status::BadChannel, "no provisional channel"),
        }
    }

    fn transfer(&self, client: &Arc<Client>, sid: u32, cid: u32) -> Option<DbAddr> {
        let provisional = self.provisional();
        let mut resources = self.resources.lock();
        if client.is_closed() {
            return None;
        }
        let slot = resources
            .lookup(Key::Unsigned(sid))
            .filter(|entry| std::ptr::eq(entry.owner.as_ptr(), Arc::as_ptr(provisional)))?
            .slot;
        let mut channel = {
            let mut from = provisional.channels.lock();
            let candidate = from.get(slot)?;
            // Subscriptions capture their owner, so only idle channels move.
            if candidate.sid != sid || !candidate.subscriptions.is_empty() {
                return None;
            }
            from.remove(slot)
        };
        channel.cid = cid;
        let addr = channel.addr.clone();
        let slot = client.channels.lock().insert(channel);
        let entry = resources.lookup_mut(Key::Unsigned(sid))?;
        entry.owner = Arc::downgrade(client);
        entry.slot = slot;
        addr
    }

    /// Clear one channel. An unknown sid means the client cleared a channel
    /// twice or never owned it, which ends the session.
    pub(crate) fn clear(&self, client: &Arc<Client>, header: &Header) -> Result<(), SessionError> {
        let sid = header.handle;
        let mut out = client.reply();
        let Some(detached) = self.detach(client, sid) else {
            out.error(header, Status::BadChannel, "channel already cleared");
            return Err(SessionError::LifetimeViolation(format!(
                "clear of unknown channel {sid}"
            )));
        };
        let released = self.release_detached(detached);
        tracing::debug!(client = %client.id(), sid, subscriptions = released, "channel cleared");
        out.frame(header, &[]);
        Ok(())
    }

    // Unlink a channel from the resource table, then from its owner.
    fn detach(&self, client: &Arc<Client>, sid: u32) -> Option<Detached> {
        let mut resources = self.resources.lock();
        let entry = resources.lookup(Key::Unsigned(sid))?;
        if !std::ptr::eq(entry.owner.as_ptr(), Arc::as_ptr(client)) {
            return None;
        }
        let slot = entry.slot;
        resources.remove(Key::Unsigned(sid)).ok()?;
        let channel = client.channels.lock().try_remove(slot)?;
        Some(Detached { channel })
    }

    /// Cancel every subscription, then return subscriptions and the channel
    /// to their pools. Returns the number of subscriptions released.
    pub(crate) fn release_detached(&self, detached: Detached) -> usize {
        let mut channel = detached.channel;
        let subscriptions = std::mem::take(&mut channel.subscriptions);
        let count = subscriptions.len();
        for subscription in subscriptions {
            self.release_subscription(subscription);
        }
        self.release_channel(channel);
        metrics::gauge!("caserve_channels_active").decrement(1.0);
        count
    }

    fn release_channel(&self, channel: Box<Channel>) {
        self.channel_pool.release(channel);
    }

    /// Release every channel owned by `client`. Returns how many there were.
    pub(crate) fn teardown(&self, client: &Arc<Client>) -> usize {
        let _out = client.reply();
        let detached: Vec<Detached> = {
            let mut resources = self.resources.lock();
            let mut channels = client.channels.lock();
            channels
                .drain()
                .map(|channel| {
                    if resources.remove(Key::Unsigned(channel.sid)).is_err() {
                        tracing::warn!(sid = channel.sid, "channel missing from resource table");
                    }
                    Detached { channel }
                })
                .collect()
        };
        let count = detached.len();
        for channel in detached {
            self.release_detached(channel);
        }
        count
    }

    /// Release provisional channels older than `max_age`. Returns how many
    /// were reaped.
    pub fn reap_provisional(&self, max_age: Duration) -> usize {
        let provisional = self.provisional();
        let now = Instant::now();
        let expired: Vec<Detached> = {
            let mut resources = self.resources.lock();
            let mut channels = provisional.channels.lock();
            let stale: Vec<usize> = channels
                .iter()
                .filter(|(_, channel)| {
                    channel
                        .created
                        .is_some_and(|created| now.saturating_duration_since(created) >= max_age)
                })
                .map(|(slot, _)| slot)
                .collect();
            stale
                .into_iter()
                .map(|slot| {
                    let channel = channels.remove(slot);
                    let _ = resources.remove(Key::Unsigned(channel.sid));
                    Detached { channel }
                })
                .collect()
        };
        let count = expired.len();
        for detached in expired {
            if let Some(addr) = &detached.channel.addr {
                self.forget_provisional(&addr.name, detached.channel.sid);
            }
            self.release_detached(detached);
        }
        if count > 0 {
            metrics::counter!("caserve_provisional_reaped_total").increment(count as u64);
            tracing::debug!(count, "reaped provisional channels");
        }
        count
    }

    /// Look up the channel for `sid` regardless of owner, returning its
    /// owner and client id.
    pub fn resolve_sid(&self, sid: u32) -> Option<(Arc<Client>, u32)> {
        let resources = self.resources.lock();
        let entry = resources.lookup(Key::Unsigned(sid))?;
        let owner = entry.owner.upgrade()?;
        let cid = owner.channels.lock().get(entry.slot)?.cid;
        Some((owner, cid))
    }
}

enum OpenOutcome {
    Linked { sid: u32, addr: DbAddr },
    NotFound,
    Exhausted,
}

fn resolved_reply(command: Command, request: &Header, sid: u32, addr: &DbAddr) -> Header {
    Header {
        command: command.code(),
        payload_size: 0,
        data_type: addr.native_type.code(),
        count: addr.element_count,
        handle: sid,
        token: request.token,
    }
}

/// Reject requests whose type or count cannot be served from `addr`.
pub(crate) fn check_shape(header: &Header, addr: &DbAddr) -> Result<(DbrType, u32), Status> {
    let dbr = DbrType::from_code(header.data_type).ok_or(Status::BadType)?;
    if header.count == 0 || header.count > addr.element_count {
        return Err(Status::BadCount);
    }
    Ok((dbr, header.count))
}
