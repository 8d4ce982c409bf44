//! Queued requests and their resolution contract.

use crate::cache::CacheTier;
use crate::cluster::connection::{ConnId, Connection};
use crate::error::HiveResult;
use crate::response::Response;
use std::time::Instant;
use tokio::sync::oneshot;

/// What completing a request does to cluster state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RequestKind {
    Plain,
    /// Add these channels to the executing connection's `listens` set.
    Listen(Vec<String>),
    /// Remove these channels from the executing connection's `listens` set.
    Unlisten(Vec<String>),
    Begin,
    Commit,
    Rollback,
}

/// Resolution payload: the response plus the connection that produced it.
pub(crate) struct Outcome {
    pub(crate) response: Response,
    pub(crate) conn: ConnId,
}

pub(crate) struct Request {
    pub(crate) id: u64,
    pub(crate) command: String,
    pub(crate) created_at: Instant,
    /// `None` = any connection not mid-transaction.
    pub(crate) session: Option<ConnId>,
    /// Populate this cache slot on success.
    pub(crate) cache: Option<(String, CacheTier)>,
    pub(crate) kind: RequestKind,
    reply: oneshot::Sender<HiveResult<Outcome>>,
    pub(crate) stuck_logged: bool,
}

impl Request {
    pub(crate) fn new(
        id: u64,
        command: String,
        session: Option<ConnId>,
        cache: Option<(String, CacheTier)>,
        kind: RequestKind,
        reply: oneshot::Sender<HiveResult<Outcome>>,
    ) -> Self {
        Self {
            id,
            command,
            created_at: Instant::now(),
            session,
            cache,
            kind,
            reply,
            stuck_logged: false,
        }
    }

    /// Scheduling rule: unpinned requests avoid mid-transaction links;
    /// pinned requests only ever match their own link.
    pub(crate) fn eligible(&self, conn: &Connection) -> bool {
        match self.session {
            None => !conn.in_transaction(),
            Some(id) => id == conn.id,
        }
    }

    /// Deliver the result. The receiver may be gone (internal requests,
    /// abandoned callers); either way the request is spent.
    pub(crate) fn resolve(self, outcome: HiveResult<Outcome>) {
        let _ = self.reply.send(outcome);
    }
}

/// One statement per channel, e.g. `LISTEN "jobs"; LISTEN "audit";`.
pub(crate) fn batch_statement(verb: &str, channels: &[String]) -> String {
    channels
        .iter()
        .map(|name| format!("{} \"{}\";", verb, name.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}
