//! Single-owner cluster actor.
//!
//! One task owns the pool arena, the pending queue and the channel table,
//! and processes commands serially. Query I/O, reconnection and callback
//! invocation run in spawned tasks that report back through the same
//! command channel, so cluster state is never touched from two places and
//! no reply is ever sent while state is borrowed.

use crate::cache::ResultCache;
use crate::cluster::connection::{ConnId, Connection};
use crate::cluster::request::{batch_statement, Outcome, Request, RequestKind};
use crate::cluster::{Notification, NotifyCallback, PoolStatus, SessionId};
use crate::config::{ClusterConfig, ConnectParams};
use crate::error::{HiveError, HiveResult};
use crate::response::Response;
use futures::StreamExt;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};

pub(crate) type RawConnection =
    tokio_postgres::Connection<tokio_postgres::Socket, tokio_postgres::tls::NoTlsStream>;

pub(crate) enum Command {
    Query(Request),
    Subscribe {
        channel: String,
        callback: NotifyCallback,
        reply: oneshot::Sender<u64>,
    },
    Unsubscribe {
        channel: String,
        id: u64,
        reply: oneshot::Sender<bool>,
    },
    /// Channels from the given list not yet LISTENed anywhere.
    ListenPlan {
        channels: Vec<String>,
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Which link holds which of the given channels.
    UnlistenPlan {
        channels: Vec<String>,
        reply: oneshot::Sender<Vec<(SessionId, Vec<String>)>>,
    },
    Completed {
        conn: ConnId,
        request: u64,
        outcome: HiveResult<Response>,
    },
    Notified {
        conn: ConnId,
        channel: String,
        payload: String,
        process_id: i32,
    },
    Lost {
        conn: ConnId,
    },
    Restored {
        conn: ConnId,
        client: Client,
        io_task: JoinHandle<()>,
    },
    /// Reconnect hook approved resubscription of these channels.
    Relisten {
        conn: ConnId,
        channels: Vec<String>,
    },
    Status {
        reply: oneshot::Sender<PoolStatus>,
    },
    Shutdown,
}

pub(crate) struct ClusterActor {
    params: ConnectParams,
    config: ClusterConfig,
    pool: BTreeMap<ConnId, Connection>,
    queue: VecDeque<Request>,
    inflight: HashMap<u64, Request>,
    channels: HashMap<String, HashMap<u64, NotifyCallback>>,
    next_subscription: u64,
    cache: Arc<ResultCache>,
    ids: Arc<AtomicU64>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ClusterActor {
    pub(crate) fn spawn(
        params: ConnectParams,
        config: ClusterConfig,
        cache: Arc<ResultCache>,
        ids: Arc<AtomicU64>,
        links: Vec<(Client, RawConnection)>,
    ) -> mpsc::UnboundedSender<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pool = BTreeMap::new();
        for (index, (client, raw)) in links.into_iter().enumerate() {
            let id = ConnId(index as u64);
            let io_task = spawn_io(id, raw, tx.clone());
            pool.insert(id, Connection::new(id, Arc::new(client), io_task));
        }
        let actor = ClusterActor {
            params,
            config,
            pool,
            queue: VecDeque::new(),
            inflight: HashMap::new(),
            channels: HashMap::new(),
            next_subscription: 1,
            cache,
            ids,
            cmd_tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        tx
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
        }
        self.teardown();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Query(request) => self.on_query(request),
            Command::Subscribe {
                channel,
                callback,
                reply,
            } => {
                let id = self.next_subscription;
                self.next_subscription += 1;
                self.channels
                    .entry(channel)
                    .or_default()
                    .insert(id, callback);
                let _ = reply.send(id);
            }
            Command::Unsubscribe { channel, id, reply } => {
                let removed = match self.channels.get_mut(&channel) {
                    Some(subscribers) => {
                        let removed = subscribers.remove(&id).is_some();
                        if subscribers.is_empty() {
                            self.channels.remove(&channel);
                        }
                        removed
                    }
                    None => false,
                };
                let _ = reply.send(removed);
            }
            Command::ListenPlan { channels, reply } => {
                let mut fresh: Vec<String> = Vec::new();
                for name in channels {
                    let known = self.pool.values().any(|c| c.listens.contains(&name))
                        || fresh.contains(&name);
                    if !known {
                        fresh.push(name);
                    }
                }
                let _ = reply.send(fresh);
            }
            Command::UnlistenPlan { channels, reply } => {
                let mut targets = Vec::new();
                for conn in self.pool.values() {
                    let held: Vec<String> = channels
                        .iter()
                        .filter(|name| conn.listens.contains(*name))
                        .cloned()
                        .collect();
                    if !held.is_empty() {
                        targets.push((SessionId(conn.id), held));
                    }
                }
                let _ = reply.send(targets);
            }
            Command::Completed {
                conn,
                request,
                outcome,
            } => self.on_completed(conn, request, outcome),
            Command::Notified {
                conn,
                channel,
                payload,
                process_id,
            } => self.on_notified(conn, channel, payload, process_id),
            Command::Lost { conn } => self.on_lost(conn),
            Command::Restored {
                conn,
                client,
                io_task,
            } => self.on_restored(conn, client, io_task),
            Command::Relisten { conn, channels } => self.enqueue_listen(conn, channels),
            Command::Status { reply } => {
                let ready = self.pool.values().filter(|c| !c.lost()).count();
                let busy = self.pool.values().filter(|c| c.busy()).count();
                let _ = reply.send(PoolStatus {
                    connections: self.pool.len(),
                    ready,
                    busy,
                    queued: self.queue.len(),
                });
            }
            Command::Shutdown => {}
        }
    }

    fn on_query(&mut self, request: Request) {
        self.log_stuck();
        if let Some(session) = request.session {
            if !self.pool.contains_key(&session) {
                request.resolve(Err(HiveError::new("supplied transaction id does not exist")));
                return;
            }
        }
        self.queue.push_back(request);
        let ids: Vec<ConnId> = self.pool.keys().copied().collect();
        for id in ids {
            if self.queue.is_empty() {
                break;
            }
            self.consume(id);
        }
    }

    /// Assign the first eligible queued request to this connection.
    fn consume(&mut self, id: ConnId) {
        let conn = match self.pool.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        if conn.lost() || conn.busy() {
            return;
        }
        let slot = match self.queue.iter().position(|r| r.eligible(conn)) {
            Some(slot) => slot,
            None => return,
        };
        let request = match self.queue.remove(slot) {
            Some(request) => request,
            None => return,
        };
        let client = match conn.client.clone() {
            Some(client) => client,
            None => return,
        };
        conn.make_busy(request.id);
        let request_id = request.id;
        let command = request.command.clone();
        self.inflight.insert(request_id, request);

        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let outcome = client
                .simple_query(&command)
                .await
                .map(Response::from_messages)
                .map_err(HiveError::from);
            let _ = tx.send(Command::Completed {
                conn: id,
                request: request_id,
                outcome,
            });
        });
    }

    fn on_completed(&mut self, conn_id: ConnId, request_id: u64, outcome: HiveResult<Response>) {
        let request = match self.inflight.remove(&request_id) {
            Some(request) => request,
            // already failed by a loss report that raced ahead
            None => return,
        };

        let mut in_tx = self
            .pool
            .get(&conn_id)
            .map(|c| c.in_transaction())
            .unwrap_or(false);
        if outcome.is_ok() {
            match &request.kind {
                RequestKind::Plain => {}
                RequestKind::Listen(names) => {
                    if let Some(conn) = self.pool.get_mut(&conn_id) {
                        conn.listens.extend(names.iter().cloned());
                    }
                }
                RequestKind::Unlisten(names) => {
                    if let Some(conn) = self.pool.get_mut(&conn_id) {
                        for name in names {
                            conn.listens.remove(name);
                        }
                    }
                }
                RequestKind::Begin => in_tx = true,
                RequestKind::Commit | RequestKind::Rollback => in_tx = false,
            }
        }
        if let Some(conn) = self.pool.get_mut(&conn_id) {
            if conn.current == Some(request_id) {
                conn.make_idle(in_tx);
            }
        }

        let outcome = match outcome {
            Ok(response) => {
                if let Some((key, tier)) = &request.cache {
                    self.cache.put(key, &response, *tier);
                }
                Ok(Outcome {
                    response,
                    conn: conn_id,
                })
            }
            Err(err) => Err(err),
        };
        request.resolve(outcome);

        self.consume(conn_id);
    }

    fn on_notified(&mut self, conn: ConnId, channel: String, payload: String, process_id: i32) {
        let subscribers = match self.channels.get(&channel) {
            Some(subscribers) => subscribers,
            None => {
                tracing::debug!(conn = conn.0, %channel, "notification with no subscribers");
                return;
            }
        };
        tracing::debug!(
            conn = conn.0,
            %channel,
            subscribers = subscribers.len(),
            "routing notification"
        );
        for callback in subscribers.values() {
            let callback = Arc::clone(callback);
            let notification = Notification {
                channel: channel.clone(),
                payload: payload.clone(),
                process_id,
            };
            // user code never runs on the actor
            tokio::spawn(async move {
                callback(notification);
            });
        }
    }

    fn on_lost(&mut self, id: ConnId) {
        let conn = match self.pool.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        if conn.lost() {
            // duplicate report; a reestablish is already underway
            return;
        }
        tracing::warn!(conn = id.0, "connection lost, scheduling reestablish");
        let failed = conn.make_lost();
        if let Some(request_id) = failed {
            if let Some(request) = self.inflight.remove(&request_id) {
                request.resolve(Err(HiveError::new(
                    "connection lost while query was in flight",
                )));
            }
        }
        self.spawn_reestablish(id);
    }

    fn spawn_reestablish(&self, id: ConnId) {
        let params = self.params.clone();
        let cap = self.config.reconnect_cap;
        let mut delay = self.config.reconnect_base;
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            loop {
                match connect_one(&params).await {
                    Ok((client, raw)) => {
                        let io_task = spawn_io(id, raw, tx.clone());
                        let command = Command::Restored {
                            conn: id,
                            client,
                            io_task,
                        };
                        if let Err(dead) = tx.send(command) {
                            if let Command::Restored { io_task, .. } = dead.0 {
                                io_task.abort();
                            }
                        }
                        return;
                    }
                    Err(err) => {
                        let jitter = Duration::from_millis(rand::rng().random_range(0..=250));
                        tracing::warn!(
                            conn = id.0,
                            error = %err,
                            retry_in = ?(delay + jitter),
                            "reconnect attempt failed"
                        );
                        tokio::time::sleep(delay + jitter).await;
                        delay = (delay * 2).min(cap);
                        if tx.is_closed() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn on_restored(&mut self, id: ConnId, client: Client, io_task: JoinHandle<()>) {
        let conn = match self.pool.get_mut(&id) {
            Some(conn) => conn,
            None => {
                io_task.abort();
                return;
            }
        };
        if !conn.lost() {
            io_task.abort();
            return;
        }
        conn.restore(Arc::new(client), io_task);
        tracing::info!(conn = id.0, "connection reestablished");

        let channels: Vec<String> = conn.listens.iter().cloned().collect();
        if !channels.is_empty() {
            match self.config.on_reconnected.clone() {
                None => self.enqueue_listen(id, channels),
                Some(hook) => {
                    let tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        if hook(SessionId(id), channels.clone()).await {
                            let _ = tx.send(Command::Relisten { conn: id, channels });
                        }
                    });
                }
            }
        }
        self.consume(id);
    }

    /// Queue a LISTEN batch pinned to one link (resubscription path).
    fn enqueue_listen(&mut self, id: ConnId, channels: Vec<String>) {
        let command = batch_statement("LISTEN", &channels);
        // internal request: nobody awaits the reply
        let (reply, _discard) = oneshot::channel();
        let request = Request::new(
            self.ids.fetch_add(1, Ordering::Relaxed),
            command,
            Some(id),
            None,
            RequestKind::Listen(channels),
            reply,
        );
        self.on_query(request);
    }

    fn log_stuck(&mut self) {
        let threshold = self.config.stuck_after;
        for request in self.inflight.values_mut() {
            if !request.stuck_logged && request.created_at.elapsed() > threshold {
                request.stuck_logged = true;
                tracing::warn!(
                    request = request.id,
                    elapsed = ?request.created_at.elapsed(),
                    command = %request.command,
                    "query appears stuck; no cancellation will be attempted"
                );
            }
        }
    }

    fn teardown(&mut self) {
        tracing::debug!(
            queued = self.queue.len(),
            inflight = self.inflight.len(),
            "cluster actor shutting down"
        );
        for request in self.queue.drain(..) {
            request.resolve(Err(HiveError::new("cluster is shut down")));
        }
        for (_, request) in self.inflight.drain() {
            request.resolve(Err(HiveError::new("cluster is shut down")));
        }
        for conn in self.pool.values_mut() {
            conn.make_lost();
        }
        self.channels.clear();
    }
}

/// One handshake bounded by the configured connect timeout.
pub(crate) async fn connect_one(params: &ConnectParams) -> HiveResult<(Client, RawConnection)> {
    let config = params.to_pg_config();
    match tokio::time::timeout(params.connect_timeout, config.connect(NoTls)).await {
        Ok(result) => result.map_err(HiveError::from),
        Err(_) => Err(HiveError::new(format!(
            "connection to {} has timed out",
            params.endpoint()
        ))),
    }
}

/// Forward the link's async messages to the actor until the stream ends,
/// then report the link lost.
pub(crate) fn spawn_io(
    id: ConnId,
    mut connection: RawConnection,
    tx: mpsc::UnboundedSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(notification)) => {
                    let _ = tx.send(Command::Notified {
                        conn: id,
                        channel: notification.channel().to_string(),
                        payload: notification.payload().to_string(),
                        process_id: notification.process_id(),
                    });
                }
                Ok(AsyncMessage::Notice(notice)) => {
                    tracing::debug!(conn = id.0, message = %notice.message(), "server notice");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(conn = id.0, error = %err, "connection stream error");
                    break;
                }
            }
        }
        let _ = tx.send(Command::Lost { conn: id });
    })
}
