//! The event bus: registration bookkeeping and the dispatch pass.

use crate::error::EventError;
use crate::event::Event;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error};

tokio::task_local! {
    /// Present while the current task is inside a dispatch pass. A handler
    /// that emits a nested event runs that pass inline under the outer pass
    /// lock instead of deadlocking on it. The flag is per task, not per bus;
    /// the hub runs a single bus per process.
    static IN_DISPATCH: ();
}

/// A registered event handler.
///
/// Handlers receive the event by mutable reference so they can cancel it.
/// Returning an error does not stop the pass; the bus logs the failure and
/// keeps going (failure isolation).
#[async_trait]
pub trait EventHandler<S: Send + Sync + 'static>: Send + Sync {
    async fn handle(&self, event: &mut Event<S>) -> Result<(), EventError>;
}

/// Adapter so simple extensions can register a closure instead of a struct.
///
/// The closure returns a boxed future borrowing the event, e.g.
/// `FnHandler::new(|event| async move { event.cancel(); Ok(()) }.boxed())`.
pub struct FnHandler<S, F> {
    f: F,
    _marker: PhantomData<fn(S)>,
}

impl<S, F> FnHandler<S, F>
where
    S: Send + Sync + 'static,
    F: for<'a> Fn(&'a mut Event<S>) -> BoxFuture<'a, Result<(), EventError>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<S, F> EventHandler<S> for FnHandler<S, F>
where
    S: Send + Sync + 'static,
    F: for<'a> Fn(&'a mut Event<S>) -> BoxFuture<'a, Result<(), EventError>>
        + Send
        + Sync
        + 'static,
{
    async fn handle(&self, event: &mut Event<S>) -> Result<(), EventError> {
        (self.f)(event).await
    }
}

/// One handler registration: who registered, where it sorts, and whether it
/// still wants events after cancellation.
struct Registration<S> {
    extension: String,
    priority: i32,
    accepts_cancelled: bool,
    handler: Arc<dyn EventHandler<S>>,
}

impl<S> Clone for Registration<S> {
    fn clone(&self) -> Self {
        Self {
            extension: self.extension.clone(),
            priority: self.priority,
            accepts_cancelled: self.accepts_cancelled,
            handler: self.handler.clone(),
        }
    }
}

/// The event bus.
///
/// Registrations are kept sorted per event name: priority descending, then
/// extension id ascending, so equal-priority handlers fire in a stable order
/// regardless of when they registered. Dispatch snapshots the handler list at
/// call time; registrations made mid-pass only take effect on the next pass.
pub struct EventBus<S: Send + Sync + 'static> {
    handlers: RwLock<HashMap<String, Vec<Registration<S>>>>,
    /// Serializes dispatch passes. Exactly one pass runs at a time; see
    /// `IN_DISPATCH` for the nested-emit escape hatch.
    pass_lock: Mutex<()>,
}

impl<S: Send + Sync + 'static> Default for EventBus<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Send + Sync + 'static> EventBus<S> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            pass_lock: Mutex::new(()),
        }
    }

    /// Registers a handler for `event_name` on behalf of `extension_id`.
    ///
    /// Fails with [`EventError::DuplicateRegistration`] if the extension
    /// already holds a handler for that event; the existing registration is
    /// left untouched.
    pub async fn register(
        &self,
        event_name: &str,
        extension_id: &str,
        priority: i32,
        accepts_cancelled: bool,
        handler: Arc<dyn EventHandler<S>>,
    ) -> Result<(), EventError> {
        let mut handlers = self.handlers.write().await;
        let entry = handlers.entry(event_name.to_string()).or_default();

        if entry.iter().any(|r| r.extension == extension_id) {
            return Err(EventError::DuplicateRegistration {
                event: event_name.to_string(),
                extension: extension_id.to_string(),
            });
        }

        entry.push(Registration {
            extension: extension_id.to_string(),
            priority,
            accepts_cancelled,
            handler,
        });
        entry.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.extension.cmp(&b.extension))
        });

        debug!(
            event = event_name,
            extension = extension_id,
            priority, "Registered handler"
        );
        Ok(())
    }

    /// Removes the handler `extension_id` registered for `event_name`.
    /// Idempotent.
    pub async fn unregister(&self, event_name: &str, extension_id: &str) {
        let mut handlers = self.handlers.write().await;
        if let Some(entry) = handlers.get_mut(event_name) {
            entry.retain(|r| r.extension != extension_id);
            if entry.is_empty() {
                handlers.remove(event_name);
            }
        }
    }

    /// Removes every handler registered by `extension_id`. Idempotent.
    pub async fn unregister_all(&self, extension_id: &str) {
        let mut handlers = self.handlers.write().await;
        handlers.retain(|_, entry| {
            entry.retain(|r| r.extension != extension_id);
            !entry.is_empty()
        });
    }

    /// Whether `extension_id` holds a handler for `event_name`.
    pub async fn has_handler(&self, event_name: &str, extension_id: &str) -> bool {
        self.handlers
            .read()
            .await
            .get(event_name)
            .is_some_and(|entry| entry.iter().any(|r| r.extension == extension_id))
    }

    /// Total number of registrations across all event names.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.values().map(Vec::len).sum()
    }

    /// Event names that currently have at least one handler.
    pub async fn registered_events(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }

    /// Runs one dispatch pass for `event`.
    ///
    /// Handlers fire synchronously in registration-sorted order; the call
    /// returns once every eligible handler has returned. Once the event is
    /// cancelled, only `accepts_cancelled` handlers still run. A faulting
    /// handler is logged and the pass continues.
    pub async fn dispatch(&self, event: &mut Event<S>) {
        if IN_DISPATCH.try_with(|_| ()).is_ok() {
            // Nested emit from inside a handler; the outer pass of this task
            // already holds the lock.
            self.run_pass(event).await;
            return;
        }

        let _pass = self.pass_lock.lock().await;
        IN_DISPATCH.scope((), self.run_pass(event)).await;
    }

    async fn run_pass(&self, event: &mut Event<S>) {
        let snapshot: Vec<Registration<S>> = {
            let handlers = self.handlers.read().await;
            handlers.get(event.name()).cloned().unwrap_or_default()
        };

        if snapshot.is_empty() {
            debug!(event = event.name(), "No handlers for event");
            return;
        }

        for registration in &snapshot {
            if event.cancelled() && !registration.accepts_cancelled {
                debug!(
                    event = event.name(),
                    extension = registration.extension.as_str(),
                    "Skipping handler, event is cancelled"
                );
                continue;
            }
            if let Err(e) = registration.handler.handle(event).await {
                error!(
                    event = event.name(),
                    extension = registration.extension.as_str(),
                    "Handler failed: {e}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex as StdMutex;

    /// Dummy source type; ordering tests never look at the caller.
    #[derive(Debug)]
    struct Probe;

    struct Recorder {
        tag: &'static str,
        log: Arc<StdMutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventHandler<Probe> for Recorder {
        async fn handle(&self, _event: &mut Event<Probe>) -> Result<(), EventError> {
            self.log.lock().unwrap().push(self.tag);
            Ok(())
        }
    }

    struct Canceller {
        log: Arc<StdMutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventHandler<Probe> for Canceller {
        async fn handle(&self, event: &mut Event<Probe>) -> Result<(), EventError> {
            self.log.lock().unwrap().push("canceller");
            event.cancel();
            Ok(())
        }
    }

    struct Faulty;

    #[async_trait]
    impl EventHandler<Probe> for Faulty {
        async fn handle(&self, _event: &mut Event<Probe>) -> Result<(), EventError> {
            Err(EventError::HandlerExecution("boom".into()))
        }
    }

    fn recorder(
        tag: &'static str,
        log: &Arc<StdMutex<Vec<&'static str>>>,
    ) -> Arc<dyn EventHandler<Probe>> {
        Arc::new(Recorder {
            tag,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn handlers_fire_priority_descending() {
        let bus = EventBus::<Probe>::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.register("data_received", "low", 1, false, recorder("low", &log))
            .await
            .unwrap();
        bus.register("data_received", "high", 100, false, recorder("high", &log))
            .await
            .unwrap();
        bus.register("data_received", "mid", 50, false, recorder("mid", &log))
            .await
            .unwrap();

        bus.dispatch(&mut Event::new("data_received")).await;
        assert_eq!(*log.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn equal_priority_ties_break_on_extension_id_ascending() {
        let log = Arc::new(StdMutex::new(Vec::new()));

        // Register in two different orders; the invocation order must not
        // depend on registration order.
        for names in [["zeta", "alpha", "mike"], ["mike", "zeta", "alpha"]] {
            let bus = EventBus::<Probe>::new();
            for name in names {
                bus.register("tick", name, 5, false, recorder(name, &log))
                    .await
                    .unwrap();
            }
            bus.dispatch(&mut Event::new("tick")).await;
            assert_eq!(*log.lock().unwrap(), vec!["alpha", "mike", "zeta"]);
            log.lock().unwrap().clear();
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected_and_first_survives() {
        let bus = EventBus::<Probe>::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.register("tick", "ext", 1, false, recorder("first", &log))
            .await
            .unwrap();
        let err = bus
            .register("tick", "ext", 99, false, recorder("second", &log))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::DuplicateRegistration { .. }));

        bus.dispatch(&mut Event::new("tick")).await;
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn cancellation_skips_later_handlers_unless_they_accept() {
        let bus = EventBus::<Probe>::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.register("msg", "a_before", 10, false, recorder("before", &log))
            .await
            .unwrap();
        bus.register(
            "msg",
            "b_cancel",
            5,
            false,
            Arc::new(Canceller { log: log.clone() }),
        )
        .await
        .unwrap();
        bus.register("msg", "c_skipped", 1, false, recorder("skipped", &log))
            .await
            .unwrap();
        bus.register("msg", "d_accepts", 0, true, recorder("accepts", &log))
            .await
            .unwrap();

        let mut event = Event::new("msg");
        bus.dispatch(&mut event).await;

        assert!(event.cancelled());
        assert_eq!(*log.lock().unwrap(), vec!["before", "canceller", "accepts"]);
    }

    #[tokio::test]
    async fn faulting_handler_does_not_stop_the_pass() {
        let bus = EventBus::<Probe>::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.register("msg", "a_fault", 10, false, Arc::new(Faulty))
            .await
            .unwrap();
        bus.register("msg", "b_after", 1, false, recorder("after", &log))
            .await
            .unwrap();

        bus.dispatch(&mut Event::new("msg")).await;
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let bus = EventBus::<Probe>::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.register("msg", "ext", 1, false, recorder("ext", &log))
            .await
            .unwrap();
        bus.unregister("msg", "ext").await;
        bus.unregister("msg", "ext").await;
        bus.unregister("never_registered", "ext").await;
        assert_eq!(bus.handler_count().await, 0);

        bus.unregister_all("ext").await;
        bus.dispatch(&mut Event::new("msg")).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregister_all_drops_every_event() {
        let bus = EventBus::<Probe>::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.register("a", "ext", 1, false, recorder("a", &log))
            .await
            .unwrap();
        bus.register("b", "ext", 1, false, recorder("b", &log))
            .await
            .unwrap();
        bus.register("a", "other", 1, false, recorder("other", &log))
            .await
            .unwrap();

        bus.unregister_all("ext").await;
        assert!(!bus.has_handler("a", "ext").await);
        assert!(!bus.has_handler("b", "ext").await);
        assert!(bus.has_handler("a", "other").await);
    }

    #[tokio::test]
    async fn registrations_made_mid_pass_join_the_next_pass_only() {
        let bus = Arc::new(EventBus::<Probe>::new());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let bus_for_handler = bus.clone();
        let log_for_handler = log.clone();
        let registering = FnHandler::new(move |_event: &mut Event<Probe>| {
            let bus = bus_for_handler.clone();
            let log = log_for_handler.clone();
            async move {
                log.lock().unwrap().push("registering");
                // Ignore the duplicate error on the second pass.
                let _ = bus
                    .register(
                        "msg",
                        "late",
                        -10,
                        false,
                        Arc::new(Recorder {
                            tag: "late",
                            log: log.clone(),
                        }),
                    )
                    .await;
                Ok(())
            }
            .boxed()
        });
        bus.register("msg", "registering", 10, false, Arc::new(registering))
            .await
            .unwrap();

        bus.dispatch(&mut Event::new("msg")).await;
        assert_eq!(*log.lock().unwrap(), vec!["registering"]);

        bus.dispatch(&mut Event::new("msg")).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["registering", "registering", "late"]
        );
    }

    #[tokio::test]
    async fn nested_dispatch_from_a_handler_runs_inline() {
        let bus = Arc::new(EventBus::<Probe>::new());
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.register("inner", "sink", 1, false, recorder("inner", &log))
            .await
            .unwrap();

        let bus_for_handler = bus.clone();
        let log_for_handler = log.clone();
        let emitting = FnHandler::new(move |_event: &mut Event<Probe>| {
            let bus = bus_for_handler.clone();
            let log = log_for_handler.clone();
            async move {
                log.lock().unwrap().push("outer");
                bus.dispatch(&mut Event::new("inner")).await;
                Ok(())
            }
            .boxed()
        });
        bus.register("outer", "emitter", 1, false, Arc::new(emitting))
            .await
            .unwrap();

        bus.dispatch(&mut Event::new("outer")).await;
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn cancellation_is_local_to_one_pass() {
        let bus = EventBus::<Probe>::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.register("msg", "a_cancel", 10, false, Arc::new(Canceller { log: log.clone() }))
            .await
            .unwrap();
        bus.register("msg", "b_sink", 1, false, recorder("sink", &log))
            .await
            .unwrap();

        bus.dispatch(&mut Event::new("msg")).await;
        bus.dispatch(&mut Event::new("msg")).await;

        // The sink is skipped in both passes, but each pass starts
        // uncancelled, so the canceller itself always runs.
        assert_eq!(*log.lock().unwrap(), vec!["canceller", "canceller"]);
    }
}
