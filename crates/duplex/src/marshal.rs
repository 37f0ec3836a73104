use crate::controller::{fresh_id, Shared, TableEntry};
use crate::value::Export;
use crate::{Callable, Descriptor, DescriptorKind, Error, Token, Value, WireValue};

impl Shared {
    pub(crate) fn export_args(&self, args: Vec<Value>) -> Vec<WireValue> {
        args.into_iter()
            .map(|value| self.export_value(value))
            .collect()
    }

    /// Outgoing transform: functions and cancellation tokens become
    /// descriptors naming an exported identifier, data passes through.
    pub(crate) fn export_value(&self, value: Value) -> WireValue {
        match value {
            Value::Json(data) => WireValue::Json(data),
            Value::Function(callable) => WireValue::Descriptor(Descriptor {
                kind: DescriptorKind::Function,
                id: self.export_function(&callable),
            }),
            Value::Token(token) => WireValue::Descriptor(Descriptor {
                kind: DescriptorKind::Cancel,
                id: self.export_token(&token),
            }),
        }
    }

    fn export_function(&self, callable: &Callable) -> String {
        let mut marker = callable.marker();
        if let Some(export) = marker.as_ref() {
            return export.id().to_string();
        }
        let id = fresh_id();
        {
            let mut state = self.state.lock().unwrap();
            // Anonymous exports are held strongly until the peer's purge:
            // the peer must have time to take its stub before local
            // collection could fire.
            state.registry.insert(id.clone(), callable.clone());
            state
                .table
                .insert(id.clone(), TableEntry::Function(callable.downgrade()));
        }
        *marker = Some(Export::new(id.clone(), self.reaper_tx.clone()));
        id
    }

    fn export_token(&self, token: &Token) -> String {
        let mut marker = token.marker();
        if let Some(export) = marker.as_ref() {
            return export.id().to_string();
        }
        let id = fresh_id();
        {
            let mut state = self.state.lock().unwrap();
            state
                .table
                .insert(id.clone(), TableEntry::Token(token.downgrade()));
        }
        // Relay a local firing to the peer's abort adapter. The watcher
        // holds the controller and the boundary identity only weakly, and
        // is aborted when the marker disarms.
        let watcher = tokio::spawn({
            let cancellation = token.cancellation();
            let shared = self.weak_self.clone();
            let id = id.clone();
            async move {
                cancellation.cancelled().await;
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if let Err(error) = shared.send_one_way(&id, Vec::new()) {
                    tracing::warn!(controller_id = %shared.id, function_id = %id, error = %error, "failed to relay cancellation to peer");
                }
            }
        });
        *marker = Some(Export::new(id.clone(), self.reaper_tx.clone()).with_watcher(watcher));
        id
    }

    pub(crate) fn import_args(&self, args: Vec<WireValue>) -> Vec<Value> {
        args.into_iter()
            .map(|value| self.import_value(value))
            .collect()
    }

    /// Incoming transform: descriptors become identity-preserving stubs
    /// or synthetic tokens, data passes through.
    pub(crate) fn import_value(&self, value: WireValue) -> Value {
        match value {
            WireValue::Json(data) => Value::Json(data),
            WireValue::Descriptor(Descriptor {
                kind: DescriptorKind::Function,
                id,
            }) => Value::Function(self.import_function(id)),
            WireValue::Descriptor(Descriptor {
                kind: DescriptorKind::Cancel,
                id,
            }) => Value::Token(self.import_token(id)),
        }
    }

    fn import_function(&self, id: String) -> Callable {
        let mut state = self.state.lock().unwrap();
        // The same identifier received twice must yield the same object.
        if let Some(live) = state.table.get(&id).and_then(TableEntry::as_callable) {
            return live;
        }

        let stub = self.stub(id.clone());
        state
            .table
            .insert(id.clone(), TableEntry::Function(stub.downgrade()));
        // The stub is unpublished, so marking it under the state lock
        // cannot contend.
        *stub.marker() = Some(Export::new(id, self.reaper_tx.clone()));
        stub
    }

    /// A stub invokes its identifier remotely when called. It holds the
    /// controller weakly: a stub outliving its controller fails with
    /// [`Error::Released`] rather than keeping the engine alive.
    fn stub(&self, function_id: String) -> Callable {
        let shared = self.weak_self.clone();
        Callable::new(move |args| {
            let shared = shared.clone();
            let function_id = function_id.clone();
            async move {
                let Some(shared) = shared.upgrade() else {
                    return Err(Error::Released);
                };
                shared.invoke(&function_id, args).await
            }
        })
    }

    fn import_token(&self, id: String) -> Token {
        let mut state = self.state.lock().unwrap();
        if let Some(TableEntry::Adapter { token, .. }) = state.table.get(&id) {
            return token.clone();
        }

        // Pair the peer's token identifier with a local token, behind an
        // abort adapter the peer invokes one-way to fire it.
        let token = Token::new();
        let adapter = {
            let cancellation = token.cancellation();
            Callable::new(move |_args| {
                let cancellation = cancellation.clone();
                async move {
                    cancellation.cancel();
                    Ok(Value::null())
                }
            })
        };
        state.registry.insert(id.clone(), adapter.clone());
        state.table.insert(
            id.clone(),
            TableEntry::Adapter {
                target: adapter.downgrade(),
                token: token.clone(),
            },
        );
        *adapter.marker() = Some(Export::new(id, self.reaper_tx.clone()));
        token
    }
}
