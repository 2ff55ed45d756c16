//! Inbound request processing

use super::{ConnContext, ServerError, SessionTable};
use crate::event::{Event, EventCodec, EventKind, AUTH_FAILED, AUTH_SUCCESS};
use crate::protocol::ProtocolError;
use bytes::BytesMut;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Application routing behind the channel layer
pub trait RequestHandler: Send + Sync {
    /// Handle one authenticated event, returning immediate responses
    fn handle(&self, ctx: &ConnContext, event: Event) -> Vec<Event>;
}

/// Turns inbound bytes into handled events and immediate responses
pub struct RequestProcessor {
    codec: Arc<EventCodec>,
    sessions: SessionTable,
    handler: Arc<dyn RequestHandler>,
    /// Empty means every user is accepted
    allowed_users: HashSet<String>,
}

impl RequestProcessor {
    pub fn new(
        codec: Arc<EventCodec>,
        handler: Arc<dyn RequestHandler>,
        allowed_users: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            codec,
            sessions: SessionTable::new(),
            handler,
            allowed_users: allowed_users.into_iter().collect(),
        }
    }

    pub fn codec(&self) -> &Arc<EventCodec> {
        &self.codec
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    fn is_allowed(&self, user: &str) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.contains(user)
    }

    /// Decode and handle every complete event in `buf`
    ///
    /// A trailing partial frame stays in `buf`. Responses are returned in
    /// order and must be sealed under `ctx.iv` as it stands afterwards. A
    /// refused auth frame stops processing and sets `ctx.rejected`.
    pub fn process(&self, buf: &mut BytesMut, ctx: &mut ConnContext) -> Result<Vec<Event>, ServerError> {
        let mut responses = Vec::new();

        while !buf.is_empty() {
            let event = match self.codec.decrypt(buf, ctx.iv) {
                Ok(event) => event,
                Err(e) if e.is_need_more() => break,
                Err(e) => return Err(e.into()),
            };

            match &event.kind {
                EventKind::Auth(auth) => {
                    if auth.iv == 0 || !self.is_allowed(&auth.user) {
                        warn!(user = %auth.user, index = auth.index, "auth rejected");
                        ctx.rejected = true;
                        responses.push(Event::notify(AUTH_FAILED));
                        return Ok(responses);
                    }
                    // Repeated auth frames for the same connection instance are absorbed.
                    if auth.iv != ctx.iv {
                        ctx.authenticate(auth);
                        info!(user = %ctx.user, index = ctx.index, "connection authed");
                        responses.push(Event::notify(AUTH_SUCCESS));
                    }
                }
                _ if !ctx.is_authed() => {
                    return Err(ProtocolError::AuthRequired(format!("{:?}", event.event_type())).into());
                }
                EventKind::Heartbeat => trace!(user = %ctx.user, index = ctx.index, "heartbeat"),
                EventKind::Notify { code } => debug!(code, "ignoring notify from client"),
                EventKind::Close => {
                    self.sessions.close(ctx, event.session_id);
                    responses.extend(self.handler.handle(ctx, event));
                }
                EventKind::Data(_) => {
                    self.sessions.open(ctx, event.session_id);
                    responses.extend(self.handler.handle(ctx, event));
                }
            }
        }

        Ok(responses)
    }
}
