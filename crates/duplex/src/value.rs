use crate::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A value crossing the controller boundary: plain structured data, a
/// callable function, or a cancellation token. Arguments and results are
/// opaque to the core except for the two non-data variants, which cross the
/// wire by identifier rather than by value.
#[derive(Debug, Clone)]
pub enum Value {
    Json(serde_json::Value),
    Function(Callable),
    Token(Token),
}

impl Value {
    pub fn null() -> Self {
        Self::Json(serde_json::Value::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Json(serde_json::Value::Null))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_json().and_then(serde_json::Value::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_json().and_then(serde_json::Value::as_f64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_json().and_then(serde_json::Value::as_bool)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(serde_json::Value::as_str)
    }

    pub fn as_function(&self) -> Option<&Callable> {
        match self {
            Self::Function(callable) => Some(callable),
            _ => None,
        }
    }

    pub fn as_token(&self) -> Option<&Token> {
        match self {
            Self::Token(token) => Some(token),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}
impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Json(value.into())
    }
}
impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Json(value.into())
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Json(value.into())
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Json(value.into())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Json(value.into())
    }
}
impl From<Callable> for Value {
    fn from(value: Callable) -> Self {
        Self::Function(value)
    }
}
impl From<Token> for Value {
    fn from(value: Token) -> Self {
        Self::Token(value)
    }
}

/// Callable is a cloneable handle to an asynchronous procedure. Clones
/// share one identity: exporting any of them yields the same function
/// identifier, and the peer-side stub for that identifier is likewise a
/// single shared object.
#[derive(Clone)]
pub struct Callable {
    inner: Arc<CallInner>,
}

pub(crate) struct CallInner {
    target: Box<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>,
    export: Mutex<Option<Export>>,
}

impl Callable {
    pub fn new<F, Fut>(target: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            inner: Arc::new(CallInner {
                target: Box::new(move |args| target(args).boxed()),
                export: Mutex::new(None),
            }),
        }
    }

    /// Invoke the procedure. For a stub, this issues a remote invoke of
    /// the identifier the stub stands for.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        (self.inner.target)(args).await
    }

    /// Whether two handles designate the same underlying procedure.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn marker(&self) -> std::sync::MutexGuard<'_, Option<Export>> {
        self.inner.export.lock().unwrap()
    }

    pub(crate) fn unmark(&self) {
        if let Some(mut export) = self.inner.export.lock().unwrap().take() {
            export.disarm();
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<CallInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<CallInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let exported = self
            .inner
            .export
            .lock()
            .unwrap()
            .as_ref()
            .map(|export| export.id().to_string());
        f.debug_struct("Callable")
            .field("exported", &exported)
            .finish_non_exhaustive()
    }
}

/// Token is a cancellation token as it crosses the controller boundary.
/// Like [`Callable`], clones share one identity: to have two exports reuse
/// one identifier, export clones of the same Token.
#[derive(Clone)]
pub struct Token {
    shared: Arc<TokenShared>,
}

pub(crate) struct TokenShared {
    token: CancellationToken,
    export: Mutex<Option<Export>>,
}

impl Token {
    pub fn new() -> Self {
        Self::from_cancellation(CancellationToken::new())
    }

    /// Wrap an existing cancellation token for the boundary.
    pub fn from_cancellation(token: CancellationToken) -> Self {
        Self {
            shared: Arc::new(TokenShared {
                token,
                export: Mutex::new(None),
            }),
        }
    }

    pub fn cancel(&self) {
        self.shared.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.shared.token.cancelled().await;
    }

    /// A clone of the underlying cancellation token. Holding it does not
    /// keep the boundary identity alive.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.token.clone()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    pub(crate) fn marker(&self) -> std::sync::MutexGuard<'_, Option<Export>> {
        self.shared.export.lock().unwrap()
    }

    pub(crate) fn unmark(&self) {
        if let Some(mut export) = self.shared.export.lock().unwrap().take() {
            export.disarm();
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<TokenShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(weak: &Weak<TokenShared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let exported = self
            .shared
            .export
            .lock()
            .unwrap()
            .as_ref()
            .map(|export| export.id().to_string());
        f.debug_struct("Token")
            .field("cancelled", &self.is_cancelled())
            .field("exported", &exported)
            .finish_non_exhaustive()
    }
}

/// Export marks a Callable or Token as known to the peer under `id`, and is
/// the armed half of the finalization watch: dropping the referent drops
/// its marker, which reports the identifier to the controller's reaper.
/// Disarmed markers (explicit release, a peer purge, controller teardown)
/// report nothing.
pub(crate) struct Export {
    id: String,
    reaper: Option<mpsc::UnboundedSender<String>>,
    watcher: Option<tokio::task::JoinHandle<()>>,
}

impl Export {
    pub(crate) fn new(id: String, reaper: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            reaper: Some(reaper),
            watcher: None,
        }
    }

    pub(crate) fn with_watcher(mut self, watcher: tokio::task::JoinHandle<()>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn disarm(&mut self) {
        self.reaper = None;
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Drop for Export {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.send(std::mem::take(&mut self.id));
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}
