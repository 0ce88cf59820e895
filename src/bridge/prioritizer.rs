//! Priority-aware request dispatch.
//!
//! [`SendPrioritizer`] lets many callers submit requests that must be
//! answered, one ticket per request, and orders the queue by caller rank.
//! A caller that calls [`SendPrioritizer::prioritize`] gets a rank lower than
//! every rank handed out before it, so the most recently prioritized caller
//! always dispatches first. Callers without a rank dispatch last, in
//! correlation id order.
//!
//! A single dispatch loop takes the head of the queue and runs it inline
//! (concurrency 1) or on one of a fixed number of executor tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{Notify, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use super::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::error::{BridgeError, BridgeResult, LockResultExt};

/// Rank of callers that never asked for priority.
const LOWEST_RANK: i64 = i64::MAX;

/// Performs one request/response exchange.
pub trait Exchange: Send + Sync + 'static {
    fn exchange(
        &self,
        request: RequestEnvelope,
    ) -> impl Future<Output = BridgeResult<ResponseEnvelope>> + Send;
}

/// Identity of a submitting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerId(u64);

impl CallerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Capability to complete a dispatcher, held only by its owner.
#[derive(Debug)]
pub struct OwnerToken {
    dispatcher: Ulid,
}

struct Ticket {
    caller: CallerId,
    request: RequestEnvelope,
    reply: oneshot::Sender<BridgeResult<ResponseEnvelope>>,
}

struct DispatchState {
    queue: Vec<Ticket>,
    ranks: HashMap<CallerId, i64>,
    next_rank: i64,
    accepting: bool,
}

impl DispatchState {
    fn rank_of(&self, caller: CallerId) -> i64 {
        self.ranks.get(&caller).copied().unwrap_or(LOWEST_RANK)
    }

    fn resort(&mut self) {
        let ranks = &self.ranks;
        self.queue.sort_by_key(|ticket| {
            (
                ranks.get(&ticket.caller).copied().unwrap_or(LOWEST_RANK),
                ticket.request.id,
            )
        });
    }
}

/// Priority dispatcher over an [`Exchange`].
pub struct SendPrioritizer<E: Exchange> {
    id: Ulid,
    exchange: Arc<E>,
    state: Mutex<DispatchState>,
    queued: Notify,
    concurrency: usize,
    idle_poll: Duration,
    abort: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    dispatched: AtomicU64,
}

impl<E: Exchange> SendPrioritizer<E> {
    /// Create a dispatcher and start its dispatch loop.
    ///
    /// Returns the dispatcher and the token required to complete it.
    pub fn start(
        exchange: Arc<E>,
        concurrency: usize,
        idle_poll: Duration,
        abort: &CancellationToken,
    ) -> (Arc<Self>, OwnerToken) {
        let id = Ulid::new();
        let dispatcher = Arc::new(Self {
            id,
            exchange,
            state: Mutex::new(DispatchState {
                queue: Vec::new(),
                ranks: HashMap::new(),
                next_rank: 0,
                accepting: true,
            }),
            queued: Notify::new(),
            concurrency: concurrency.max(1),
            idle_poll,
            abort: abort.child_token(),
            task: Mutex::new(None),
            dispatched: AtomicU64::new(0),
        });

        let handle = tokio::spawn(Arc::clone(&dispatcher).dispatch_loop());
        *dispatcher
            .task
            .lock()
            .recover_poison("SendPrioritizer::start") = Some(handle);

        (dispatcher, OwnerToken { dispatcher: id })
    }

    /// Give `caller` a rank above every caller prioritized before it.
    pub fn prioritize(&self, caller: CallerId) -> i64 {
        let mut state = self.state.lock().recover_poison("SendPrioritizer::prioritize");
        state.next_rank -= 1;
        let rank = state.next_rank;
        state.ranks.insert(caller, rank);
        state.resort();
        debug!(
            target: "resolver_bridge::prioritizer",
            "Caller {:?} prioritized with rank {}",
            caller,
            rank
        );
        rank
    }

    /// Return `caller` to the lowest rank.
    pub fn unprioritize(&self, caller: CallerId) {
        let mut state = self
            .state
            .lock()
            .recover_poison("SendPrioritizer::unprioritize");
        if state.ranks.remove(&caller).is_some() {
            state.resort();
        }
    }

    pub fn rank_of(&self, caller: CallerId) -> i64 {
        self.state
            .lock()
            .recover_poison("SendPrioritizer::rank_of")
            .rank_of(caller)
    }

    pub fn queued_len(&self) -> usize {
        self.state
            .lock()
            .recover_poison("SendPrioritizer::queued_len")
            .queue
            .len()
    }

    /// Requests handed to an executor so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Submit a request and wait for its response.
    pub async fn send(
        &self,
        caller: CallerId,
        mut request: RequestEnvelope,
    ) -> BridgeResult<ResponseEnvelope> {
        let id = request.id;
        if self.abort.is_cancelled() {
            return Err(BridgeError::Closed);
        }
        let (reply, response) = oneshot::channel();
        {
            let mut state = self.state.lock().recover_poison("SendPrioritizer::send");
            if !state.accepting {
                return Err(BridgeError::DispatcherClosed { id });
            }
            request.mark_enqueued();
            state.queue.push(Ticket {
                caller,
                request,
                reply,
            });
            state.resort();
        }
        self.queued.notify_one();

        tokio::select! {
            _ = self.abort.cancelled() => Err(BridgeError::Closed),
            response = response => response.unwrap_or(Err(BridgeError::Closed)),
        }
    }

    /// Stop accepting submissions and clear rank state.
    ///
    /// Requests already queued are still dispatched. Returns `false` if
    /// `token` belongs to another dispatcher.
    pub fn complete(&self, token: &OwnerToken) -> bool {
        if token.dispatcher != self.id {
            warn!(
                target: "resolver_bridge::prioritizer",
                "Ignoring completion with a foreign owner token"
            );
            return false;
        }
        {
            let mut state = self.state.lock().recover_poison("SendPrioritizer::complete");
            state.accepting = false;
            state.ranks.clear();
        }
        self.queued.notify_one();
        true
    }

    /// Wait for the dispatch loop to exit.
    pub async fn join(&self) {
        let handle = self
            .task
            .lock()
            .recover_poison("SendPrioritizer::join")
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(
                target: "resolver_bridge::prioritizer",
                "Dispatch loop ended abnormally: {}",
                e
            );
        }
    }

    /// Take the head of the queue, waiting while it is empty.
    ///
    /// Returns `None` once the dispatcher is completed and drained, or aborted.
    async fn next_ticket(&self) -> Option<Ticket> {
        loop {
            let notified = self.queued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self
                    .state
                    .lock()
                    .recover_poison("SendPrioritizer::next_ticket");
                if self.abort.is_cancelled() {
                    return None;
                }
                if !state.queue.is_empty() {
                    return Some(state.queue.remove(0));
                }
                if !state.accepting {
                    return None;
                }
            }

            tokio::select! {
                _ = self.abort.cancelled() => return None,
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.idle_poll) => {}
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let executors = Arc::new(Semaphore::new(self.concurrency));

        loop {
            // Wait for a free executor before choosing, so a request queued
            // meanwhile can still win the head of the queue.
            let permit = if self.concurrency > 1 {
                let acquired = tokio::select! {
                    _ = self.abort.cancelled() => break,
                    permit = Arc::clone(&executors).acquire_owned() => permit,
                };
                match acquired {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                }
            } else {
                None
            };

            let Some(ticket) = self.next_ticket().await else {
                break;
            };
            self.dispatched.fetch_add(1, Ordering::Relaxed);

            match permit {
                Some(permit) => {
                    let exchange = Arc::clone(&self.exchange);
                    tokio::spawn(async move {
                        execute(exchange.as_ref(), ticket).await;
                        drop(permit);
                    });
                }
                None => execute(self.exchange.as_ref(), ticket).await,
            }
        }

        // Wait for running executors before reporting the loop as finished.
        if self.concurrency > 1 {
            tokio::select! {
                _ = self.abort.cancelled() => {}
                _ = executors.acquire_many(self.concurrency as u32) => {}
            }
        }

        let leftovers: Vec<Ticket> = {
            let mut state = self
                .state
                .lock()
                .recover_poison("SendPrioritizer::dispatch_loop");
            state.accepting = false;
            state.ranks.clear();
            state.queue.drain(..).collect()
        };
        for ticket in leftovers {
            let _ = ticket.reply.send(Err(BridgeError::Closed));
        }
        debug!(
            target: "resolver_bridge::prioritizer",
            "Dispatch loop exited after {} requests",
            self.dispatched()
        );
    }
}

async fn execute<E: Exchange>(exchange: &E, ticket: Ticket) {
    let Ticket { request, reply, .. } = ticket;
    let id = request.id;
    let result = exchange.exchange(request).await;
    if reply.send(result).is_err() {
        debug!(
            target: "resolver_bridge::prioritizer",
            "Caller of {} went away before its response",
            id
        );
    }
}
