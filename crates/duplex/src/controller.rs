use crate::value::{CallInner, Export, TokenShared};
use crate::{BoxError, Callable, Error, Kind, Message, Result, Value};
use futures::future::BoxFuture;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};

/// What the send callback did with an outgoing message.
pub enum Delivery {
    /// The message was posted somewhere; any response arrives later
    /// through [`Controller::insert`].
    Posted,
    /// The transport carries the response on the request itself, e.g.
    /// host-process IPC. The future resolves the peer's response message.
    Reply(BoxFuture<'static, std::result::Result<Message, BoxError>>),
}

pub(crate) type SendFn = dyn Fn(Message) -> std::result::Result<Delivery, BoxError> + Send + Sync;

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Opaque label for diagnostics, including remote stack-trace
    /// trailers. Defaults to a freshly generated identifier.
    pub controller_id: Option<String>,
    /// Attach stack strings to outgoing error records, and keep them on
    /// reconstructed incoming errors.
    pub produce_stack_trace: bool,
}

/// One peer's instance of the RPC engine. Symmetric in role: a Controller
/// both exposes callable functions ([`Controller::register`]) and invokes
/// the peer's ([`Controller::invoke`]).
///
/// Cheap to clone; all clones are the same controller. Must be created
/// and used within a tokio runtime.
#[derive(Clone)]
pub struct Controller {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) id: String,
    pub(crate) produce_stack_trace: bool,
    pub(crate) send: Box<SendFn>,
    pub(crate) state: Mutex<State>,
    pub(crate) reaper_tx: mpsc::UnboundedSender<String>,
    /// Handed to stubs and watchers, which must not keep the engine alive.
    pub(crate) weak_self: Weak<Shared>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Default)]
pub(crate) struct State {
    /// Exported target procedures, held strongly: registered functions
    /// until release, anonymous exports and abort adapters until the
    /// peer's purge.
    pub(crate) registry: HashMap<String, Callable>,
    /// Everything known to the peer by identifier, held weakly, spanning
    /// exports and imported stubs.
    pub(crate) table: HashMap<String, TableEntry>,
    /// Outstanding calls keyed by message identifier.
    pub(crate) invocations: HashMap<String, oneshot::Sender<Result<Value>>>,
    pub(crate) released: bool,
}

pub(crate) enum TableEntry {
    Function(Weak<CallInner>),
    Token(Weak<TokenShared>),
    /// An imported cancel descriptor: the abort adapter the peer invokes,
    /// plus the synthetic token it fires. The token is pinned so repeated
    /// imports of the identifier observe the same token.
    Adapter { target: Weak<CallInner>, token: crate::Token },
}

impl TableEntry {
    pub(crate) fn as_callable(&self) -> Option<Callable> {
        match self {
            TableEntry::Function(weak) | TableEntry::Adapter { target: weak, .. } => {
                Callable::upgrade(weak)
            }
            TableEntry::Token(_) => None,
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        match self {
            TableEntry::Function(weak) | TableEntry::Adapter { target: weak, .. } => {
                weak.strong_count() == 0
            }
            TableEntry::Token(weak) => weak.strong_count() == 0,
        }
    }

    pub(crate) fn unmark(&self) {
        match self {
            TableEntry::Function(weak) | TableEntry::Adapter { target: weak, .. } => {
                if let Some(callable) = Callable::upgrade(weak) {
                    callable.unmark();
                }
            }
            TableEntry::Token(weak) => {
                if let Some(token) = crate::Token::upgrade(weak) {
                    token.unmark();
                }
            }
        }
    }
}

/// Message and function identifiers: opaque, unique, and time-ordered.
pub(crate) fn fresh_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

impl Controller {
    /// Create a controller around the embedder's send callback. The
    /// callback posts one message toward the peer and reports whether the
    /// transport carries a response on the request itself (see
    /// [`Delivery`]); a callback error fails the caller synchronously.
    pub fn new<S>(send: S, options: Options) -> Self
    where
        S: Fn(Message) -> std::result::Result<Delivery, BoxError> + Send + Sync + 'static,
    {
        let Options {
            controller_id,
            produce_stack_trace,
        } = options;

        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        let shared = Arc::new_cyclic(|weak_self| Shared {
            id: controller_id.unwrap_or_else(fresh_id),
            produce_stack_trace,
            send: Box::new(send),
            state: Mutex::new(State::default()),
            reaper_tx,
            weak_self: weak_self.clone(),
            reaper: Mutex::new(None),
        });

        let reaper = tokio::spawn(Shared::reap(Arc::downgrade(&shared), reaper_rx));
        *shared.reaper.lock().unwrap() = Some(reaper);

        Self { shared }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Expose `target` to the peer under `function_id`. Fails with
    /// [`Error::AlreadyRegistered`] if the procedure is already exported
    /// or the identifier is taken. The returned [`Registration`]
    /// unregisters on explicit release and on drop.
    pub fn register<F, Fut>(&self, function_id: &str, target: F) -> Result<Registration>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register_callable(function_id, Callable::new(target))
    }

    /// As [`Controller::register`], for a procedure that is already a
    /// [`Callable`].
    pub fn register_callable(&self, function_id: &str, callable: Callable) -> Result<Registration> {
        {
            // Marker before state: the lock order of every export path.
            let mut marker = callable.marker();
            let mut state = self.shared.state.lock().unwrap();

            if state.released {
                return Err(Error::Released);
            }
            if marker.is_some() || state.registry.contains_key(function_id) {
                return Err(Error::AlreadyRegistered(function_id.to_string()));
            }
            state
                .registry
                .insert(function_id.to_string(), callable.clone());
            state.table.insert(
                function_id.to_string(),
                TableEntry::Function(callable.downgrade()),
            );
            *marker = Some(Export::new(
                function_id.to_string(),
                self.shared.reaper_tx.clone(),
            ));
        }

        Ok(Registration {
            shared: Arc::downgrade(&self.shared),
            function_id: function_id.to_string(),
        })
    }

    /// Expose a generator to the peer under `function_id`, for consumption
    /// with [`Controller::iterate`]. The registered procedure treats its
    /// first argument as a yield callback and awaits it once per produced
    /// item before pulling the next; this is the entire streaming
    /// protocol, with no message kinds of its own.
    pub fn register_generator<G, S>(&self, function_id: &str, generator: G) -> Result<Registration>
    where
        G: Fn(Vec<Value>) -> S + Send + Sync + 'static,
        S: futures::Stream<Item = Result<Value>> + Send + 'static,
    {
        let generator = Arc::new(generator);

        self.register(function_id, move |mut args: Vec<Value>| {
            let generator = generator.clone();
            async move {
                let emit = match args.first().and_then(Value::as_function) {
                    Some(emit) => emit.clone(),
                    None => {
                        return Err(Error::failed(
                            "generator invocation is missing its yield callback",
                        ))
                    }
                };
                args.remove(0);

                let stream = generator(args);
                let mut stream = std::pin::pin!(stream);
                while let Some(item) = stream.try_next().await? {
                    emit.call(vec![item]).await?;
                }
                Ok(Value::null())
            }
        })
    }

    /// Tear the controller down: every pending invocation rejects with
    /// "Controller released", all tables are cleared, and all finalization
    /// watches are disarmed. Dropping the last handle does the same.
    pub fn release(&self) {
        self.shared.release();
    }
}

impl Shared {
    async fn reap(shared: Weak<Self>, mut finalized: mpsc::UnboundedReceiver<String>) {
        while let Some(function_id) = finalized.recv().await {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.finalized(function_id).await;
        }
    }

    /// A weak table referent was collected with its watch armed: forget
    /// the identifier, and tell the peer to do the same.
    async fn finalized(&self, function_id: String) {
        let purge = {
            let mut state = self.state.lock().unwrap();
            // Skip identifiers already evicted, or re-issued to a live
            // referent by a raced re-import.
            let dead = !state.released
                && matches!(state.table.get(&function_id), Some(entry) if entry.is_dead());
            if dead {
                state.table.remove(&function_id);
            }
            dead
        };
        if !purge {
            return;
        }

        tracing::debug!(controller_id = %self.id, %function_id, "purging collected identifier");
        self.post(Message {
            message_id: fresh_id(),
            kind: Kind::Purge { function_id },
        })
        .await;
    }

    /// Push a message through the send callback, driving and discarding a
    /// waitable reply. Failures are logged, never retried.
    pub(crate) async fn post(&self, message: Message) {
        let message_id = message.message_id.clone();
        match (self.send)(message) {
            Ok(Delivery::Posted) => {}
            Ok(Delivery::Reply(reply)) => {
                if let Err(error) = reply.await {
                    tracing::warn!(controller_id = %self.id, %message_id, error = %error, "failed to send message to peer");
                }
            }
            Err(error) => {
                tracing::warn!(controller_id = %self.id, %message_id, error = %error, "failed to send message to peer");
            }
        }
    }

    pub(crate) fn release(&self) {
        let (registry, table, invocations) = {
            let mut state = self.state.lock().unwrap();
            if state.released {
                return;
            }
            state.released = true;
            (
                std::mem::take(&mut state.registry),
                std::mem::take(&mut state.table),
                std::mem::take(&mut state.invocations),
            )
        };

        // Disarm every finalization watch before the snapshots drop, so
        // teardown does not purge its own evictions.
        for callable in registry.values() {
            callable.unmark();
        }
        for entry in table.values() {
            entry.unmark();
        }
        for (_, resolve) in invocations {
            let _ = resolve.send(Err(Error::Released));
        }

        if let Some(reaper) = self.reaper.lock().unwrap().take() {
            reaper.abort();
        }
    }

    pub(crate) fn take_invocation(&self, message_id: &str) -> Option<oneshot::Sender<Result<Value>>> {
        self.state.lock().unwrap().invocations.remove(message_id)
    }

    pub(crate) fn trace_from(&self) -> Option<&str> {
        self.produce_stack_trace.then_some(self.id.as_str())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.release();
    }
}

/// Scoped handle for a registered function: explicit [`Registration::release`]
/// and drop both unregister, so release is guaranteed on all exit paths.
#[derive(Debug)]
pub struct Registration {
    shared: Weak<Shared>,
    function_id: String,
}

impl Registration {
    pub fn id(&self) -> &str {
        &self.function_id
    }

    /// Unregister now. Dropping the handle is equivalent.
    pub fn release(self) {}
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let (callable, entry) = {
            let mut state = shared.state.lock().unwrap();
            (
                state.registry.remove(&self.function_id),
                state.table.remove(&self.function_id),
            )
        };
        // Disarm before dropping: an explicit release is not a purge.
        if let Some(callable) = &callable {
            callable.unmark();
        }
        drop(entry);
    }
}
