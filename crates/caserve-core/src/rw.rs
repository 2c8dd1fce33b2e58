// One-shot get/put requests, immediate and with completion notification.
use bytes::Bytes;
use caserve_db::{Completion, DbAddr, DbError, DbResult};
use caserve_wire::{DbrType, Header, Status};
use std::sync::Arc;

use crate::Server;
use crate::channel::check_shape;
use crate::client::{Client, ReplyGuard};

impl Server {
    pub(crate) fn read(&self, client: &Arc<Client>, header: &Header) {
        let mut out = client.reply();
        match self.channel_addr(client, header.handle) {
            Some(addr) => self.read_into(&mut out, header, &addr),
            None => out.error(header, Status::BadChannel, "unknown channel"),
        }
    }

    /// Frame the current value as the reply to `header`, or an error.
    pub(crate) fn read_into(&self, out: &mut ReplyGuard<'_>, header: &Header, addr: &DbAddr) {
        let (dbr, count) = match check_shape(header, addr) {
            Ok(shape) => shape,
            Err(status) => return out.error(header, status, "bad read type or count"),
        };
        match self.db.get(addr, dbr, count) {
            Ok(value) => out.frame(header, &value),
            Err(err) => out.error(header, Status::GetFail, &err.to_string()),
        }
    }

    /// Immediate put. Silent on success.
    pub(crate) fn write(&self, client: &Arc<Client>, header: &Header, payload: &[u8]) {
        let Some(addr) = self.channel_addr(client, header.handle) else {
            client
                .reply()
                .error(header, Status::BadChannel, "unknown channel");
            return;
        };
        let (dbr, count) = match check_write(header, &addr, payload) {
            Ok(shape) => shape,
            Err(status) => {
                client.reply().error(header, status, "bad write request");
                return;
            }
        };
        if let Err(err) = self.db.put(&addr, dbr, count, payload) {
            client
                .reply()
                .error(header, put_failure(&err), &err.to_string());
        }
    }

    pub(crate) fn read_notify(&self, client: &Arc<Client>, header: &Header) {
        let Some(addr) = self.channel_addr(client, header.handle) else {
            client
                .reply()
                .error(header, Status::BadChannel, "unknown channel");
            return;
        };
        let (dbr, count) = match check_shape(header, &addr) {
            Ok(shape) => shape,
            Err(status) => {
                client.reply().error(header, status, "bad read type or count");
                return;
            }
        };
        let reply = *header;
        match self.db.get_notify(&addr, dbr, count) {
            Completion::Ready(result) => {
                let result = result.map_err(|err| {
                    tracing::debug!(token = reply.token, error = %err, "read notify failed");
                    Status::GetFail
                });
                finish_read(&mut client.reply(), &reply, result);
            }
            Completion::Pending(rx) => {
                let Some(runtime) = self.runtime() else {
                    return no_runtime(client, header);
                };
                let weak = Arc::downgrade(client);
                let timeout = self.config.put_notify_timeout;
                client.spawn_pending(&runtime, async move {
                    let result = match tokio::time::timeout(timeout, rx).await {
                        Ok(Ok(Ok(value))) => Ok(value),
                        Ok(Ok(Err(_))) | Ok(Err(_)) => Err(Status::GetFail),
                        Err(_) => {
                            metrics::counter!("caserve_read_notify_timeout_total").increment(1);
                            Err(Status::Timeout)
                        }
                    };
                    let Some(client) = weak.upgrade() else { return };
                    let mut out = client.reply();
                    if !client.is_closed() {
                        finish_read(&mut out, &reply, result);
                    }
                });
            }
        }
    }

    pub(crate) fn write_notify(&self, client: &Arc<Client>, header: &Header, payload: &[u8]) {
        let Some(addr) = self.channel_addr(client, header.handle) else {
            client
                .reply()
                .error(header, Status::BadChannel, "unknown channel");
            return;
        };
        let (dbr, count) = match check_write(header, &addr, payload) {
            Ok(shape) => shape,
            Err(status) => {
                client.reply().error(header, status, "bad write request");
                return;
            }
        };
        let reply = header.with_payload_size(0);
        match self.db.put_notify(&addr, dbr, count, payload) {
            Completion::Ready(result) => {
                client
                    .reply()
                    .frame(&notify_reply(&reply, put_status(&result)), &[]);
            }
            Completion::Pending(rx) => {
                let Some(runtime) = self.runtime() else {
                    return no_runtime(client, header);
                };
                let weak = Arc::downgrade(client);
                let timeout = self.config.put_notify_timeout;
                client.spawn_pending(&runtime, async move {
                    let status = match tokio::time::timeout(timeout, rx).await {
                        Ok(Ok(result)) => put_status(&result),
                        // Completer dropped without an answer.
                        Ok(Err(_)) => Status::PutFail,
                        Err(_) => {
                            metrics::counter!("caserve_put_notify_timeout_total").increment(1);
                            tracing::debug!(token = reply.token, "put notify timed out");
                            Status::Timeout
                        }
                    };
                    let Some(client) = weak.upgrade() else { return };
                    let mut out = client.reply();
                    if !client.is_closed() {
                        out.frame(&notify_reply(&reply, status), &[]);
                    }
                });
            }
        }
    }
}

fn check_write(
    header: &Header,
    addr: &DbAddr,
    payload: &[u8],
) -> Result<(DbrType, u32), Status> {
    let (dbr, count) = check_shape(header, addr)?;
    let needed = dbr.payload_size(count).ok_or(Status::BadCount)?;
    if payload.len() < needed {
        return Err(Status::BadPayload);
    }
    Ok((dbr, count))
}

fn put_status(result: &DbResult<()>) -> Status {
    match result {
        Ok(()) => Status::Normal,
        Err(err) => put_failure(err),
    }
}

fn put_failure(err: &DbError) -> Status {
    match err {
        DbError::TypeMismatch => Status::BadString,
        _ => Status::PutFail,
    }
}

// The database parked the request but nothing can wait for it.
fn no_runtime(client: &Arc<Client>, header: &Header) {
    metrics::counter!("caserve_notify_unparked_total").increment(1);
    tracing::warn!(client = %client.id(), token = header.token, "no runtime to await completion");
    client
        .reply()
        .error(header, Status::Internal, "completion cannot be awaited");
}

// Notify replies carry their completion status in the handle field.
fn notify_reply(request: &Header, status: Status) -> Header {
    request.with_handle(status.code())
}

fn zeroed(header: &Header) -> Vec<u8> {
    let size = DbrType::from_code(header.data_type)
        .and_then(|dbr| dbr.payload_size(header.count))
        .unwrap_or(0);
    vec![0; size]
}

fn finish_read(out: &mut ReplyGuard<'_>, request: &Header, result: Result<Bytes, Status>) {
    match result {
        Ok(value) => out.frame(&notify_reply(request, Status::Normal), &value),
        Err(status) => out.frame(&notify_reply(request, status), &zeroed(request)),
    }
}
