use crate::controller::{fresh_id, Controller, Delivery, Shared};
use crate::{Callable, Error, Kind, Message, Result, Value};
use deferred::Deferred;
use tokio::sync::oneshot;

impl Controller {
    /// Invoke `function_id` on the peer, resolving with its result.
    ///
    /// A cancellation token among the arguments (the last one wins) also
    /// aborts the local wait: if it fires first, the call fails with
    /// [`Error::Cancelled`] without waiting for the peer.
    pub async fn invoke(&self, function_id: &str, args: Vec<Value>) -> Result<Value> {
        self.shared.invoke(function_id, args).await
    }

    /// Invoke `function_id` on the peer without awaiting completion: no
    /// pending invocation is registered, and any response is ignored.
    pub fn invoke_one_way(&self, function_id: &str, args: Vec<Value>) -> Result<()> {
        self.shared.send_one_way(function_id, args)
    }

    /// Invoke a generator registered on the peer (see
    /// [`Controller::register_generator`]), consuming its items as a lazy
    /// sequence. Items arrive strictly in yield order; a generator failure
    /// raises on the sequence after all prior items were delivered.
    pub fn iterate(&self, function_id: &str, mut args: Vec<Value>) -> Deferred<Value, Error> {
        let (producer, sequence) = deferred::deferred();

        // The yield callback feeds the sequence, resolving only once the
        // consumer takes the item: the remote generator is paced by the
        // local consumer.
        let emit = {
            let producer = producer.clone();
            Callable::new(move |mut args: Vec<Value>| {
                let producer = producer.clone();
                async move {
                    let item = if args.is_empty() {
                        Value::null()
                    } else {
                        args.remove(0)
                    };
                    if !producer.feed(item).await {
                        return Err(Error::Cancelled);
                    }
                    Ok(Value::null())
                }
            })
        };
        args.insert(0, Value::Function(emit));

        let shared = self.shared.clone();
        let function_id = function_id.to_string();
        tokio::spawn(async move {
            match shared.invoke(&function_id, args).await {
                Ok(_) => producer.complete(),
                Err(error) => producer.fail(error),
            }
        });

        sequence
    }
}

impl Shared {
    pub(crate) async fn invoke(&self, function_id: &str, args: Vec<Value>) -> Result<Value> {
        // Scan the arguments last-to-first for a token to race the wait.
        let cancel = args
            .iter()
            .rev()
            .find_map(|value| value.as_token().map(crate::Token::cancellation));

        let message_id = fresh_id();
        let args = self.export_args(args);

        let (resolve, resolved) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.released {
                return Err(Error::Released);
            }
            // Registered before the send callback runs, so a synchronous
            // reply cannot race the pending entry.
            state.invocations.insert(message_id.clone(), resolve);
        }

        let message = Message {
            message_id: message_id.clone(),
            kind: Kind::Invoke {
                function_id: function_id.to_string(),
                args,
                one_way: false,
            },
        };
        let delivery = match (self.send)(message) {
            Ok(delivery) => delivery,
            Err(error) => {
                self.take_invocation(&message_id);
                return Err(Error::Transport(error));
            }
        };

        match delivery {
            // Fire-and-forget transport: the response arrives later
            // through insert() and resolves the pending entry.
            Delivery::Posted => {
                let wait = async move { resolved.await.unwrap_or(Err(Error::Released)) };
                match cancel {
                    None => wait.await,
                    Some(cancellation) => tokio::select! {
                        result = wait => result,
                        () = cancellation.cancelled() => {
                            self.take_invocation(&message_id);
                            Err(Error::Cancelled)
                        }
                    },
                }
            }
            // Waitable transport: the response rides back on the send
            // itself and is interpreted directly.
            Delivery::Reply(reply) => {
                let outcome = match cancel {
                    None => reply.await,
                    Some(cancellation) => tokio::select! {
                        outcome = reply => outcome,
                        () = cancellation.cancelled() => {
                            self.take_invocation(&message_id);
                            return Err(Error::Cancelled);
                        }
                    },
                };
                self.take_invocation(&message_id);

                let response = outcome.map_err(Error::Transport)?;
                if response.message_id != message_id {
                    return Err(Error::UnexpectedResponse(function_id.to_string()));
                }
                match response.kind {
                    Kind::Result { result } => Ok(self.import_value(result)),
                    Kind::Error { error } => {
                        Err(Error::from_record(error, self.produce_stack_trace))
                    }
                    Kind::None => Ok(Value::null()),
                    Kind::Invoke { .. } | Kind::Purge { .. } => {
                        Err(Error::UnexpectedResponse(function_id.to_string()))
                    }
                }
            }
        }
    }

    pub(crate) fn send_one_way(&self, function_id: &str, args: Vec<Value>) -> Result<()> {
        let released = self.state.lock().unwrap().released;
        if released {
            return Err(Error::Released);
        }
        let args = self.export_args(args);
        let message = Message {
            message_id: fresh_id(),
            kind: Kind::Invoke {
                function_id: function_id.to_string(),
                args,
                one_way: true,
            },
        };
        match (self.send)(message) {
            Ok(Delivery::Posted) => Ok(()),
            Ok(Delivery::Reply(reply)) => {
                // One-way ignores any response, but a waitable transport
                // still wants its reply future driven.
                tokio::spawn(async move {
                    let _ = reply.await;
                });
                Ok(())
            }
            Err(error) => Err(Error::Transport(error)),
        }
    }
}
