use crate::controller::{Controller, Shared, TableEntry};
use crate::{Error, ErrorRecord, Kind, Message, WireValue};

impl Controller {
    /// Feed one incoming message. Returns immediately; handling proceeds
    /// on the runtime, responses go out through the send callback, and no
    /// failure escapes: peer-side problems become `error` messages or
    /// logs, spurious messages are logged and discarded.
    pub fn insert(&self, message: Message) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Some(response) = shared.dispatch(message, false).await {
                shared.post(response).await;
            }
        });
    }

    /// Feed one incoming message, returning the response instead of
    /// pushing it through the send callback: `invoke` yields its
    /// `result`/`error` (or `none` when one-way), while `result`, `error`,
    /// `purge` and `none` are processed as in [`Controller::insert`] and
    /// echoed back unchanged. This suits transports that carry responses
    /// on the request itself.
    pub async fn insert_waitable(&self, message: Message) -> Message {
        let echo = message.clone();
        match self.shared.dispatch(message, true).await {
            Some(response) => response,
            None => echo,
        }
    }
}

impl Shared {
    pub(crate) async fn dispatch(&self, message: Message, waitable: bool) -> Option<Message> {
        let Message { message_id, kind } = message;
        match kind {
            Kind::Invoke {
                function_id,
                args,
                one_way,
            } => {
                self.handle_invoke(message_id, function_id, args, one_way, waitable)
                    .await
            }
            Kind::Result { result } => {
                self.handle_result(message_id, result);
                None
            }
            Kind::Error { error } => {
                self.handle_error(message_id, error);
                None
            }
            Kind::Purge { function_id } => {
                self.handle_purge(&function_id);
                None
            }
            Kind::None => {
                tracing::debug!(controller_id = %self.id, %message_id, "discarding 'none' message");
                None
            }
        }
    }

    async fn handle_invoke(
        &self,
        message_id: String,
        function_id: String,
        args: Vec<WireValue>,
        one_way: bool,
        waitable: bool,
    ) -> Option<Message> {
        let target = {
            let state = self.state.lock().unwrap();
            state.table.get(&function_id).and_then(TableEntry::as_callable)
        };
        let Some(target) = target else {
            return Some(Message {
                message_id,
                kind: Kind::Error {
                    error: Error::NotFound(function_id).to_record(self.trace_from()),
                },
            });
        };

        let args = self.import_args(args);
        if one_way {
            if let Err(error) = target.call(args).await {
                tracing::warn!(controller_id = %self.id, %function_id, error = %error, "one-way invocation failed");
            }
            return waitable.then_some(Message {
                message_id,
                kind: Kind::None,
            });
        }

        match target.call(args).await {
            Ok(value) => Some(Message {
                message_id,
                kind: Kind::Result {
                    result: self.export_value(value),
                },
            }),
            Err(error) => Some(Message {
                message_id,
                kind: Kind::Error {
                    error: error.to_record(self.trace_from()),
                },
            }),
        }
    }

    fn handle_result(&self, message_id: String, result: WireValue) {
        let Some(resolve) = self.take_invocation(&message_id) else {
            tracing::warn!(controller_id = %self.id, %message_id, "received result for an unknown invocation");
            return;
        };
        let _ = resolve.send(Ok(self.import_value(result)));
    }

    fn handle_error(&self, message_id: String, record: ErrorRecord) {
        let Some(resolve) = self.take_invocation(&message_id) else {
            tracing::warn!(controller_id = %self.id, %message_id, "received error for an unknown invocation");
            return;
        };
        let _ = resolve.send(Err(Error::from_record(record, self.produce_stack_trace)));
    }

    fn handle_purge(&self, function_id: &str) {
        let (callable, entry) = {
            let mut state = self.state.lock().unwrap();
            (
                state.registry.remove(function_id),
                state.table.remove(function_id),
            )
        };
        if callable.is_none() && entry.is_none() {
            tracing::debug!(controller_id = %self.id, %function_id, "ignoring purge of an unknown identifier");
            return;
        }
        // Disarm before dropping, so evicting the entry doesn't purge the
        // identifier back at the peer.
        if let Some(callable) = &callable {
            callable.unmark();
        }
        if let Some(entry) = &entry {
            entry.unmark();
        }
    }
}
