//! Integration tests for the dispatch modes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use zentinel_soap_engine::dispatch::{AsyncCallback, DispatchMetrics};
use zentinel_soap_engine::{
    ChainState, ConfigurationError, DispatchError, Dispatcher, Document, Handler, HandlerChain,
    HandlerDescription, HandlerFault, MessageContext,
};

/// Counts invocations; faults when the message id is `bad`.
struct Counter {
    description: HandlerDescription,
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl Handler for Counter {
    fn init(&mut self, description: HandlerDescription) -> Result<(), ConfigurationError> {
        self.description = description;
        Ok(())
    }

    fn invoke(&self, ctx: &mut MessageContext) -> Result<(), HandlerFault> {
        std::thread::sleep(self.delay);
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.message_id() == Some("bad") {
            return Err(HandlerFault::sender("bad message"));
        }
        ctx.set_property("counted", true);
        Ok(())
    }

    fn description(&self) -> &HandlerDescription {
        &self.description
    }
}

fn dispatcher(delay: Duration) -> (Dispatcher, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let chain = HandlerChain::builder()
        .handler(Box::new(Counter {
            description: HandlerDescription::new("counter", "counter"),
            calls: Arc::clone(&calls),
            delay,
        }))
        .build();
    let dispatcher = Dispatcher::new(Arc::new(chain), tokio::runtime::Handle::current());
    (dispatcher, calls)
}

fn message(id: &str) -> MessageContext {
    MessageContext::new(Document::parse_str("<r/>")).with_message_id(id)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invoke_async_completes() {
    let (dispatcher, _) = dispatcher(Duration::ZERO);
    let ctx = dispatcher.invoke_async(message("ok")).unwrap().await.unwrap();
    assert_eq!(ctx.chain_state(), ChainState::Completed);
    assert_eq!(ctx.property("counted"), Some(&serde_json::Value::Bool(true)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_response_can_be_polled() {
    let (dispatcher, _) = dispatcher(Duration::from_millis(20));
    let response = dispatcher.invoke_async(message("ok")).unwrap();
    while !response.is_done() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(response.await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fault_returns_rolled_back_context() {
    let (dispatcher, _) = dispatcher(Duration::ZERO);
    let err = dispatcher.invoke_async(message("bad")).unwrap().await.unwrap_err();
    match err {
        DispatchError::Fault { fault, context } => {
            assert_eq!(fault.fault.reason, "bad message");
            assert_eq!(context.chain_state(), ChainState::RolledBack);
            assert_eq!(context.message_id(), Some("bad"));
        }
        other => panic!("expected a fault, got {:?}", other),
    }
    assert_eq!(
        dispatcher.metrics(),
        DispatchMetrics {
            processed: 1,
            faulted: 1,
            in_flight: 0
        }
    );
}

struct Reply(oneshot::Sender<Result<ChainState, String>>);

impl AsyncCallback for Reply {
    fn on_complete(self, ctx: MessageContext) {
        let _ = self.0.send(Ok(ctx.chain_state()));
    }

    fn on_error(self, error: DispatchError) {
        let _ = self.0.send(Err(error.to_string()));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callback_receives_outcome() {
    let (dispatcher, _) = dispatcher(Duration::ZERO);

    let (tx, rx) = oneshot::channel();
    dispatcher.invoke_with_callback(message("ok"), Reply(tx)).unwrap();
    assert_eq!(rx.await.unwrap(), Ok(ChainState::Completed));

    let (tx, rx) = oneshot::channel();
    dispatcher.invoke_with_callback(message("bad"), Reply(tx)).unwrap();
    let reason = rx.await.unwrap().unwrap_err();
    assert!(reason.contains("bad message"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_way_then_drain() {
    let (dispatcher, calls) = dispatcher(Duration::from_millis(10));
    for i in 0..5 {
        dispatcher.invoke_one_way(message(&format!("m-{}", i))).unwrap();
    }
    dispatcher.shutdown();
    dispatcher.drain().await;

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(dispatcher.metrics().processed, 5);
    assert_eq!(dispatcher.metrics().in_flight, 0);
    assert!(matches!(
        dispatcher.invoke_one_way(message("late")),
        Err(DispatchError::ShutDown)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_response_still_finishes_chain() {
    let (dispatcher, calls) = dispatcher(Duration::from_millis(30));
    let response = dispatcher.invoke_async(message("ok")).unwrap();
    drop(response);

    dispatcher.drain().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.metrics().processed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_invoke_from_worker_thread() {
    let (dispatcher, _) = dispatcher(Duration::ZERO);
    let ctx = tokio::task::spawn_blocking(move || dispatcher.invoke(message("ok")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ctx.chain_state(), ChainState::Completed);
}
