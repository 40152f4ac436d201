//! Dispatch modes around the synchronous handler chain.
//!
//! [`HandlerChain::invoke`] is always run to its end: every mode below either
//! runs it on the caller's thread or hands the whole call to a blocking task
//! on the runtime. Dropping a [`Response`] detaches the task; the chain still
//! reaches `Completed` or `RolledBack`.

use crate::context::MessageContext;
use crate::engine::HandlerChain;
use crate::error::ChainFault;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a dispatched message did not complete.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The chain faulted and rolled back; the context is handed back.
    #[error("{fault}")]
    Fault {
        fault: ChainFault,
        context: Box<MessageContext>,
    },

    #[error("dispatcher is shut down")]
    ShutDown,

    /// The blocking task panicked or was cancelled.
    #[error("dispatch task failed: {0}")]
    Join(String),
}

/// Completion signal for [`Dispatcher::invoke_with_callback`].
pub trait AsyncCallback: Send + 'static {
    fn on_complete(self, ctx: MessageContext);

    fn on_error(self, error: DispatchError);
}

/// Counters since the dispatcher was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchMetrics {
    /// Messages that ran through the chain
    pub processed: u64,
    /// Of those, messages that faulted and rolled back
    pub faulted: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct Shared {
    shut_down: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    processed: AtomicU64,
    faulted: AtomicU64,
}

/// Marks one message as in flight until dropped.
struct InFlight(Arc<Shared>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Runs messages through a shared chain.
#[derive(Clone)]
pub struct Dispatcher {
    chain: Arc<HandlerChain>,
    runtime: Handle,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("chain", &self.chain)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(chain: Arc<HandlerChain>, runtime: Handle) -> Self {
        Self {
            chain,
            runtime,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn chain(&self) -> &HandlerChain {
        &self.chain
    }

    /// Run the chain on the caller's thread.
    pub fn invoke(&self, ctx: MessageContext) -> Result<MessageContext, DispatchError> {
        let guard = self.admit()?;
        let result = run_chain(&self.chain, &self.shared, ctx);
        drop(guard);
        result
    }

    /// Run the chain in the background; the outcome is only logged.
    pub fn invoke_one_way(&self, ctx: MessageContext) -> Result<(), DispatchError> {
        let guard = self.admit()?;
        let chain = Arc::clone(&self.chain);
        let shared = Arc::clone(&self.shared);
        self.runtime.spawn_blocking(move || {
            let _guard = guard;
            match run_chain(&chain, &shared, ctx) {
                Ok(ctx) => debug!(message_id = ?ctx.message_id(), "One-way message completed"),
                Err(err) => warn!(error = %err, "One-way message faulted"),
            }
        });
        Ok(())
    }

    /// Run the chain in the background and return a handle to its outcome.
    pub fn invoke_async(&self, ctx: MessageContext) -> Result<Response, DispatchError> {
        let guard = self.admit()?;
        let chain = Arc::clone(&self.chain);
        let shared = Arc::clone(&self.shared);
        let handle = self.runtime.spawn_blocking(move || {
            let _guard = guard;
            run_chain(&chain, &shared, ctx)
        });
        Ok(Response { handle })
    }

    /// Run the chain in the background and report to `callback`.
    pub fn invoke_with_callback<C: AsyncCallback>(
        &self,
        ctx: MessageContext,
        callback: C,
    ) -> Result<(), DispatchError> {
        let guard = self.admit()?;
        let chain = Arc::clone(&self.chain);
        let shared = Arc::clone(&self.shared);
        self.runtime.spawn_blocking(move || {
            let result = run_chain(&chain, &shared, ctx);
            drop(guard);
            match result {
                Ok(ctx) => callback.on_complete(ctx),
                Err(err) => callback.on_error(err),
            }
        });
        Ok(())
    }

    /// Stop accepting new messages. Messages already admitted still run.
    pub fn shutdown(&self) {
        if !self.shared.shut_down.swap(true, Ordering::SeqCst) {
            info!(
                in_flight = self.shared.in_flight.load(Ordering::SeqCst),
                "Dispatcher shutting down"
            );
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }

    /// Wait until no message is in flight.
    pub async fn drain(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn metrics(&self) -> DispatchMetrics {
        DispatchMetrics {
            processed: self.shared.processed.load(Ordering::Relaxed),
            faulted: self.shared.faulted.load(Ordering::Relaxed),
            in_flight: self.shared.in_flight.load(Ordering::SeqCst),
        }
    }

    fn admit(&self) -> Result<InFlight, DispatchError> {
        // Count first so a concurrent drain never misses this message.
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.shared));
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(DispatchError::ShutDown);
        }
        Ok(guard)
    }
}

fn run_chain(
    chain: &HandlerChain,
    shared: &Shared,
    mut ctx: MessageContext,
) -> Result<MessageContext, DispatchError> {
    let result = chain.invoke(&mut ctx);
    shared.processed.fetch_add(1, Ordering::Relaxed);
    match result {
        Ok(()) => Ok(ctx),
        Err(fault) => {
            shared.faulted.fetch_add(1, Ordering::Relaxed);
            Err(DispatchError::Fault {
                fault,
                context: Box::new(ctx),
            })
        }
    }
}

/// Outcome of [`Dispatcher::invoke_async`].
///
/// Await it for the result, or poll [`is_done`](Response::is_done).
#[derive(Debug)]
pub struct Response {
    handle: JoinHandle<Result<MessageContext, DispatchError>>,
}

impl Response {
    /// True once the chain has finished.
    pub fn is_done(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for Response {
    type Output = Result<MessageContext, DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(err) => Err(DispatchError::Join(err.to_string())),
        })
    }
}
