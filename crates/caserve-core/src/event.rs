// Subscription pipeline: registration with the database, delivery from
// scanner threads, flow control and coalescing.
use caserve_db::{DbAddr, EventCallback, EventMask};
use caserve_wire::{DbrType, EventAddRequest, Header, Status};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::Server;
use crate::channel::check_shape;
use crate::client::{Client, ReplyGuard};

// Everything a database callback needs to find its subscription again.
// Holds no strong references, so a callback that outlives its client or
// subscription degrades to a no-op.
struct EventTarget {
    server: Weak<Server>,
    client: Weak<Client>,
    sid: u32,
    event_id: u64,
}

impl EventTarget {
    fn fire(&self, _mask: EventMask) {
        let (Some(server), Some(client)) = (self.server.upgrade(), self.client.upgrade()) else {
            metrics::counter!("caserve_stale_event_total").increment(1);
            return;
        };
        server.deliver(&client, self.sid, self.event_id);
    }
}

// Snapshot of what a delivery writes, taken under the channel lock.
struct Pending {
    addr: DbAddr,
    header: Header,
    dbr: DbrType,
}

impl Server {
    pub(crate) fn event_add(&self, client: &Arc<Client>, header: &Header, payload: &[u8]) {
        let sid = header.handle;
        let Some(addr) = self.channel_addr(client, sid) else {
            client
                .reply()
                .error(header, Status::BadChannel, "unknown channel");
            return;
        };
        let request = match EventAddRequest::decode(payload) {
            Ok(request) => request,
            Err(_) => {
                client
                    .reply()
                    .error(header, Status::BadPayload, "short event request");
                return;
            }
        };
        let (dbr, _) = match check_shape(header, &addr) {
            Ok(shape) => shape,
            Err(status) => {
                client.reply().error(header, status, "bad event type or count");
                return;
            }
        };
        let mask = EventMask::from_bits(request.mask);
        if mask.is_empty() {
            client.reply().error(header, Status::BadMask, "empty event mask");
            return;
        }

        let mut subscription = self.event_pool.acquire();
        metrics::gauge!("caserve_subscriptions_active").increment(1.0);
        let event_id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        subscription.event_id = event_id;
        subscription.header = header.with_payload_size(0);
        subscription.dbr_type = Some(dbr);
        subscription.mask = mask;

        // Registered before the send lock is taken: a database may fire the
        // callback from inside subscribe.
        let target = EventTarget {
            server: self.weak(),
            client: Arc::downgrade(client),
            sid,
            event_id,
        };
        let callback: EventCallback = Arc::new(move |mask| target.fire(mask));
        match self.db.subscribe(&addr, mask, callback) {
            Ok(token) => subscription.db_token = Some(token),
            Err(err) => {
                self.release_subscription(subscription);
                client.reply().error(header, Status::Internal, &err.to_string());
                return;
            }
        }

        let mut out = client.reply();
        let mut unlinked = Some(subscription);
        self.with_channel(client, sid, |channel| {
            if let Some(subscription) = unlinked.take() {
                channel.subscriptions.push(subscription);
            }
        });
        if let Some(subscription) = unlinked {
            // The client was torn down while subscribing.
            self.release_subscription(subscription);
            out.error(header, Status::BadChannel, "channel cleared during subscribe");
            return;
        }
        tracing::debug!(client = %client.id(), sid, event_id, mask = ?mask, "subscription added");
        // Initial value, whether or not anything has changed yet.
        self.write_event(
            &mut out,
            &Pending {
                addr,
                header: header.with_payload_size(0),
                dbr,
            },
        );
    }

    pub(crate) fn event_cancel(&self, client: &Arc<Client>, header: &Header) {
        let sid = header.handle;
        let token = header.token;
        let mut out = client.reply();
        let removed = self.with_channel(client, sid, |channel| {
            let index = channel
                .subscriptions
                .iter()
                .position(|subscription| subscription.header.token == token)?;
            Some(channel.subscriptions.remove(index))
        });
        match removed {
            None => out.error(header, Status::BadChannel, "unknown channel"),
            Some(None) => out.error(header, Status::EventNotFound, "no such subscription"),
            Some(Some(subscription)) => {
                tracing::debug!(client = %client.id(), sid, token, "subscription cancelled");
                self.release_subscription(subscription);
                out.frame(&header.with_payload_size(0), &[]);
            }
        }
    }

    /// Deregister from the database, then return to the pool.
    pub(crate) fn release_subscription(&self, mut subscription: Box<crate::Subscription>) {
        if let Some(token) = subscription.db_token.take() {
            if let Err(err) = self.db.unsubscribe(token) {
                tracing::warn!(error = %err, "database subscription already gone");
            }
        }
        self.event_pool.release(subscription);
        metrics::gauge!("caserve_subscriptions_active").decrement(1.0);
    }

    /// Entry point for database callbacks. May run on any thread.
    pub(crate) fn deliver(&self, client: &Arc<Client>, sid: u32, event_id: u64) {
        let mut out = client.reply();
        if client.is_closed() {
            metrics::counter!("caserve_stale_event_total").increment(1);
            return;
        }
        let suppressed = out.state.events_off || out.over_high_water();
        let pending = self
            .with_channel(client, sid, |channel| {
                let subscription = channel
                    .subscriptions
                    .iter_mut()
                    .find(|subscription| subscription.event_id == event_id)?;
                if suppressed {
                    subscription.modified = true;
                    return Some(None);
                }
                Some(Some(Pending {
                    addr: channel.addr.clone()?,
                    header: subscription.header,
                    dbr: subscription.dbr_type?,
                }))
            })
            .flatten();
        match pending {
            None => {
                metrics::counter!("caserve_stale_event_total").increment(1);
                tracing::trace!(client = %client.id(), sid, event_id, "stale event dropped");
            }
            Some(None) => {
                if !out.state.events_off {
                    out.state.deferred = true;
                }
                metrics::counter!("caserve_events_coalesced_total").increment(1);
            }
            Some(Some(pending)) => self.write_event(&mut out, &pending),
        }
    }

    pub(crate) fn events_off(&self, client: &Arc<Client>) {
        client.reply().state.events_off = true;
        tracing::debug!(client = %client.id(), "event delivery suspended");
    }

    pub(crate) fn events_on(&self, client: &Arc<Client>) {
        let mut out = client.reply();
        out.state.events_off = false;
        out.state.deferred = false;
        let flushed = self.flush_modified(client, &mut out);
        tracing::debug!(client = %client.id(), flushed, "event delivery resumed");
    }

    /// Send one update for every subscription marked modified, clearing the
    /// marks. Returns the number of updates written.
    pub(crate) fn flush_modified(&self, client: &Client, out: &mut ReplyGuard<'_>) -> usize {
        let pending: Vec<Pending> = {
            let mut channels = client.channels.lock();
            channels
                .iter_mut()
                .flat_map(|(_, channel)| {
                    let addr = channel.addr.clone();
                    channel
                        .subscriptions
                        .iter_mut()
                        .filter(|subscription| subscription.modified)
                        .filter_map(move |subscription| {
                            subscription.modified = false;
                            Some(Pending {
                                addr: addr.clone()?,
                                header: subscription.header,
                                dbr: subscription.dbr_type?,
                            })
                        })
                })
                .collect()
        };
        for update in &pending {
            self.write_event(out, update);
        }
        pending.len()
    }

    // Read the current value and frame it as an update.
    fn write_event(&self, out: &mut ReplyGuard<'_>, pending: &Pending) {
        match self.db.get(&pending.addr, pending.dbr, pending.header.count) {
            Ok(value) => {
                out.frame(&pending.header, &value);
                metrics::counter!("caserve_events_sent_total").increment(1);
            }
            Err(err) => out.error(&pending.header, Status::GetFail, &err.to_string()),
        }
    }
}
