use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::io::{BufRead, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

pub const METHOD_NOT_FOUND: &str = "method_not_found";

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
pub type BlockingFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;
pub type SuspendFn = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// A registered method. Blocking handlers run on the caller's thread for
/// `call` and on the blocking pool for `call_async`; suspend handlers are
/// futures driven by the dispatcher's runtime.
#[derive(Clone)]
pub enum Handler {
    Blocking(BlockingFn),
    Suspend(SuspendFn),
}

impl Handler {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Handler::Blocking(Arc::new(f))
    }

    pub fn suspend<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Handler::Suspend(Arc::new(move |params| Box::pin(f(params))))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Blocking(_) => f.write_str("Handler::Blocking"),
            Handler::Suspend(_) => f.write_str("Handler::Suspend"),
        }
    }
}

/// Method-call request. `jsonrpc` and `id` members are tolerated and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl DispatchRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Uniform reply: exactly one of `result` or `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn is_method_not_found(&self) -> bool {
        self.error.as_deref() == Some(METHOD_NOT_FOUND)
    }

    pub fn into_result(self) -> Result<Value> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(anyhow!(err)),
            (Some(v), None) => Ok(v),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("method_not_found")]
    MethodNotFound(String),
    #[error("{0}")]
    Handler(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<DispatchError> for Envelope {
    fn from(err: DispatchError) -> Self {
        Envelope::failure(err.to_string())
    }
}

fn into_envelope(outcome: std::result::Result<Value, DispatchError>) -> Envelope {
    match outcome {
        Ok(value) => Envelope::success(value),
        Err(err) => err.into(),
    }
}

/// Method registry with a blocking and an async call path. The runtime
/// handle passed at construction drives suspend handlers reached through
/// `call`; it should belong to a multi-thread runtime.
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Handler>>,
    runtime: Handle,
}

impl Dispatcher {
    pub fn new(runtime: Handle) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            runtime,
        }
    }

    /// Registers `handler` under `method`, replacing any previous entry.
    pub fn register(&self, method: impl Into<String>, handler: Handler) {
        let method = method.into();
        debug!(%method, ?handler, "registered dispatch method");
        self.handlers
            .write()
            .expect("dispatcher handlers lock")
            .insert(method, handler);
    }

    pub fn register_blocking<F>(&self, method: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(method, Handler::blocking(f));
    }

    pub fn register_suspend<F, Fut>(&self, method: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(method, Handler::suspend(f));
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.handlers
            .read()
            .expect("dispatcher handlers lock")
            .contains_key(method)
    }

    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .expect("dispatcher handlers lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn resolve(&self, method: &str) -> std::result::Result<Handler, DispatchError> {
        self.handlers
            .read()
            .expect("dispatcher handlers lock")
            .get(method)
            .cloned()
            .ok_or_else(|| DispatchError::MethodNotFound(method.to_string()))
    }

    /// Runs `method` to completion on the calling thread.
    pub fn invoke(&self, method: &str, params: Value) -> std::result::Result<Value, DispatchError> {
        let handler = self.resolve(method)?;
        let outcome = catch_unwind(AssertUnwindSafe(|| match handler {
            Handler::Blocking(f) => f(params),
            Handler::Suspend(f) => self.drive(f(params)),
        }));
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                debug!(%method, error = %err, "handler failed");
                Err(DispatchError::Handler(err.to_string()))
            }
            Err(panic) => {
                warn!(%method, "handler panicked");
                Err(DispatchError::Handler(panic_message(panic.as_ref())))
            }
        }
    }

    /// Async counterpart of [`Dispatcher::invoke`]; blocking handlers are
    /// moved onto the blocking pool.
    pub async fn invoke_async(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, DispatchError> {
        let handler = self.resolve(method)?;
        let outcome = match handler {
            Handler::Suspend(f) => f(params).await,
            Handler::Blocking(f) => match tokio::task::spawn_blocking(move || f(params)).await {
                Ok(res) => res,
                Err(join) if join.is_panic() => {
                    warn!(%method, "blocking handler panicked");
                    return Err(DispatchError::Handler(panic_message(
                        join.into_panic().as_ref(),
                    )));
                }
                Err(join) => return Err(DispatchError::Handler(join.to_string())),
            },
        };
        outcome.map_err(|err| {
            debug!(%method, error = %err, "handler failed");
            DispatchError::Handler(err.to_string())
        })
    }

    pub fn call(&self, request: DispatchRequest) -> Envelope {
        into_envelope(self.invoke(&request.method, request.params))
    }

    pub async fn call_async(&self, request: DispatchRequest) -> Envelope {
        into_envelope(self.invoke_async(&request.method, request.params).await)
    }

    pub fn call_json(&self, text: &str) -> Envelope {
        match parse_request(text) {
            Ok(request) => self.call(request),
            Err(err) => err.into(),
        }
    }

    pub async fn call_json_async(&self, text: &str) -> Envelope {
        match parse_request(text) {
            Ok(request) => self.call_async(request).await,
            Err(err) => err.into(),
        }
    }

    fn drive(&self, fut: HandlerFuture) -> Result<Value> {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.runtime.block_on(fut))
            }
            Ok(_) => Err(anyhow!(
                "cannot block on an async handler inside a current-thread runtime; use call_async"
            )),
            Err(_) => self.runtime.block_on(fut),
        }
    }
}

fn parse_request(text: &str) -> std::result::Result<DispatchRequest, DispatchError> {
    serde_json::from_str(text).map_err(|e| DispatchError::Parse(e.to_string()))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

pub fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing {key}"))
}

pub fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

#[derive(Serialize)]
struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(flatten)]
    envelope: Envelope,
}

/// Serves newline-delimited dispatch requests from `reader`, one reply per
/// line on `writer`. A `shutdown` request ends the loop.
pub fn serve_lines<R: BufRead, W: Write>(
    dispatcher: &Dispatcher,
    reader: R,
    mut writer: W,
) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let id = serde_json::from_str::<Value>(trimmed)
            .ok()
            .and_then(|v| v.get("id").cloned());
        let is_shutdown = serde_json::from_str::<DispatchRequest>(trimmed)
            .is_ok_and(|req| req.method == "shutdown");
        let envelope = if is_shutdown {
            Envelope::success(json!({"ok": true}))
        } else {
            dispatcher.call_json(trimmed)
        };

        let out = serde_json::to_string(&Reply { id, envelope })?;
        writeln!(writer, "{out}")?;
        writer.flush()?;
        if is_shutdown {
            break;
        }
    }
    Ok(())
}

pub fn run_stdio_server(dispatcher: &Dispatcher) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve_lines(dispatcher, stdin.lock(), stdout.lock())
}
