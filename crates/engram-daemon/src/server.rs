//! The daemon server and its RPC client helper.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use engram_error::{EngramError, Result};
use engram_observability::{EventBus, EventStatus, MetricsRegistry};
use engram_reason::{PatternStore, ReasoningBank};
use engram_types::{
    Clock, DaemonConfig, EngramConfig, Metadata, MetadataValue, SystemClock, TrajectoryId, VectorId,
};
use engram_vector::{UpsertOutcome, VectorStore};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::protocol::{self, RpcRequest, RpcResponse};

const ACCEPT_POLL: Duration = Duration::from_millis(25);
const COMPONENT: &str = "daemon";

/// Runs during graceful shutdown, in ascending priority order.
pub type ShutdownHandler = Box<dyn FnOnce() + Send>;

/// Everything the daemon serves.
pub struct DaemonState {
    pub dim: usize,
    pub store: Arc<VectorStore>,
    pub patterns: Arc<PatternStore>,
    pub bank: Arc<ReasoningBank>,
    pub bus: EventBus,
    pub metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    started_ms: u64,
}

impl DaemonState {
    /// In-memory state sized from the configuration.
    #[must_use]
    pub fn new(config: &EngramConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::with_parts(
            config,
            Arc::new(VectorStore::new(config.dim, config.normalization_tolerance)),
            Arc::new(PatternStore::new(config.dim, config.normalization_tolerance)),
            Arc::new(ReasoningBank::new(config.sona.clone())),
            clock,
        )
    }

    #[must_use]
    pub fn with_parts(
        config: &EngramConfig,
        store: Arc<VectorStore>,
        patterns: Arc<PatternStore>,
        bank: Arc<ReasoningBank>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let started_ms = clock.now_ms();
        Self {
            dim: config.dim,
            store,
            patterns,
            bank,
            bus: EventBus::new(config.bus_capacity),
            metrics: Arc::new(MetricsRegistry::new()),
            clock,
            started_ms,
        }
    }
}

pub struct DaemonServer {
    socket_path: PathBuf,
    config: DaemonConfig,
    state: Arc<DaemonState>,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    handlers: Mutex<Vec<(i32, ShutdownHandler)>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DaemonServer {
    #[must_use]
    pub fn new(socket_path: PathBuf, config: DaemonConfig, state: Arc<DaemonState>) -> Self {
        Self {
            socket_path,
            config,
            state,
            stop: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            handlers: Mutex::new(Vec::new()),
            accept_thread: Mutex::new(None),
        }
    }

    /// Register a shutdown handler; lower priorities run first.
    pub fn register_shutdown_handler(&self, priority: i32, handler: ShutdownHandler) {
        self.handlers.lock().push((priority, handler));
    }

    /// Whether a live daemon answers on `socket`.
    #[must_use]
    pub fn is_running(socket: &Path) -> bool {
        rpc_call(socket, "ping", Value::Null, Duration::from_millis(500)).is_ok()
    }

    /// Bind the socket and start serving. Fails when a live daemon already
    /// owns the socket; a stale socket file is cleaned up.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if Self::is_running(&self.socket_path) {
            return Err(EngramError::InvalidRequest(format!(
                "daemon already running on {}",
                self.socket_path.display()
            )));
        }
        if let Some(parent) = self.socket_path.parent() {
            engram_fs::create_dir_all(parent)?;
        }
        engram_fs::remove_file(&self.socket_path)?;
        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| EngramError::io(&self.socket_path, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| EngramError::io(&self.socket_path, e))?;
        info!(
            target: "engram.daemon::server",
            socket = %self.socket_path.display(),
            max_connections = self.config.max_connections,
            "daemon listening"
        );

        let server = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("engramd-accept".to_string())
            .spawn(move || server.accept_loop(&listener))
            .map_err(|e| EngramError::io(&self.socket_path, e))?;
        *self.accept_thread.lock() = Some(handle);
        Ok(())
    }

    fn accept_loop(self: &Arc<Self>, listener: &UnixListener) {
        while !self.stop.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    if self.active.load(Ordering::SeqCst) >= self.config.max_connections {
                        let err = EngramError::MaxConnections(self.config.max_connections);
                        Self::reject(stream, &err);
                        continue;
                    }
                    self.active.fetch_add(1, Ordering::SeqCst);
                    let server = Arc::clone(self);
                    let _ = std::thread::Builder::new()
                        .name("engramd-conn".to_string())
                        .spawn(move || {
                            server.handle_connection(stream);
                            server.active.fetch_sub(1, Ordering::SeqCst);
                        });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!(target: "engram.daemon::server", error = %e, "accept failed");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn reject(mut stream: UnixStream, err: &EngramError) {
        let response = RpcResponse::fail(Value::Null, err);
        let _ = writeln!(stream, "{}", protocol::encode_response(&response));
    }

    fn handle_connection(&self, stream: UnixStream) {
        let _ = stream.set_read_timeout(Some(Duration::from_millis(self.config.request_timeout_ms)));
        let mut writer = match stream.try_clone() {
            Ok(clone) => clone,
            Err(_) => return,
        };
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => return,
                Ok(_) => {}
                Err(_) => return,
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            let response = if trimmed.len() > self.config.max_message_bytes {
                RpcResponse::fail(
                    Value::Null,
                    &EngramError::InvalidRequest(format!(
                        "message of {} bytes exceeds the {}-byte cap",
                        trimmed.len(),
                        self.config.max_message_bytes
                    )),
                )
            } else {
                match protocol::parse_request(trimmed) {
                    Ok(request) => self.dispatch(request),
                    Err(err) => RpcResponse::fail(Value::Null, &err),
                }
            };
            if writeln!(writer, "{}", protocol::encode_response(&response)).is_err() {
                return;
            }
        }
    }

    fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id.clone();
        let started = Instant::now();
        let outcome = self.handle_method(&request.method, &request.params);
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        self.state
            .metrics
            .histogram("daemon_request_latency_ms")
            .observe(elapsed);
        self.state.metrics.counter("daemon_requests_total").inc();
        match outcome {
            Ok(result) => RpcResponse::ok(id, result),
            Err(err) => {
                self.state.metrics.counter("daemon_request_errors_total").inc();
                self.emit_error(&request.method, &err);
                RpcResponse::fail(id, &err)
            }
        }
    }

    fn emit_error(&self, method: &str, err: &EngramError) {
        let mut metadata = Metadata::new();
        metadata.insert("method".into(), MetadataValue::Text(method.to_string()));
        metadata.insert("category".into(), MetadataValue::Text(err.category().to_string()));
        self.state.bus.emit_now(
            self.state.clock.now_ms(),
            COMPONENT,
            "rpc_error",
            EventStatus::Error,
            metadata,
        );
    }

    fn handle_method(&self, method: &str, params: &Value) -> Result<Value> {
        match method {
            "ping" => Ok(json!({ "pong": true })),
            "status" => Ok(self.status()),
            "metrics" => Ok(Value::String(self.state.metrics.render())),
            "shutdown" => {
                self.stop.store(true, Ordering::SeqCst);
                Ok(json!({ "stopping": true }))
            }
            "knowledge.store" => self.knowledge_store(params),
            "knowledge.by_domain" => self.knowledge_by_domain(params),
            "knowledge.by_tags" => self.knowledge_by_tags(params),
            "knowledge.delete" => self.knowledge_delete(params),
            "feedback.provide" => self.feedback_provide(params),
            "patterns.query" => self.patterns_query(params),
            "trajectory.create" => self.trajectory_create(params),
            other => Err(EngramError::UnknownMethod(other.to_string())),
        }
    }

    fn status(&self) -> Value {
        let now = self.state.clock.now_ms();
        json!({
            "uptime_ms": now.saturating_sub(self.state.started_ms),
            "vectors": self.state.store.count(),
            "patterns": self.state.patterns.len(),
            "active_connections": self.active.load(Ordering::SeqCst),
            "bus_depth": self.state.bus.len(),
        })
    }

    fn knowledge_store(&self, params: &Value) -> Result<Value> {
        let embedding = param_vector(params, "embedding")?;
        let id = params
            .get("id")
            .and_then(Value::as_str)
            .map_or_else(
                || engram_types::mint_tagged("know", self.state.clock.now_ms()),
                str::to_string,
            );
        let mut metadata = Metadata::new();
        if let Some(domain) = params.get("domain").and_then(Value::as_str) {
            metadata.insert("domain".into(), domain.into());
        }
        if let Some(tags) = params.get("tags").and_then(Value::as_array) {
            let joined = tags
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(",");
            metadata.insert("tags".into(), joined.as_str().into());
        }
        if let Some(content) = params.get("content").and_then(Value::as_str) {
            metadata.insert("content".into(), content.into());
        }
        let outcome = self
            .state
            .store
            .upsert(VectorId::from(id.clone()), embedding, metadata)?;
        Ok(json!({
            "id": id,
            "updated": outcome == UpsertOutcome::Updated,
        }))
    }

    fn knowledge_entry(&self, id: &VectorId, metadata: &Metadata) -> Value {
        let text = |key: &str| {
            metadata.get(key).and_then(|value| match value {
                MetadataValue::Text(text) => Some(text.clone()),
                _ => None,
            })
        };
        json!({
            "id": id.as_str(),
            "domain": text("domain"),
            "tags": text("tags").map(|t| t.split(',').map(str::to_string).collect::<Vec<_>>()),
            "content": text("content"),
        })
    }

    fn knowledge_scan(&self, keep: impl Fn(&Metadata) -> bool) -> Vec<Value> {
        self.state
            .store
            .iterate()
            .filter_map(|id| {
                let metadata = self.state.store.metadata_of(&id).ok()?;
                keep(&metadata).then(|| self.knowledge_entry(&id, &metadata))
            })
            .collect()
    }

    fn knowledge_by_domain(&self, params: &Value) -> Result<Value> {
        let domain = param_str(params, "domain")?;
        let entries = self.knowledge_scan(|metadata| {
            matches!(metadata.get("domain"), Some(MetadataValue::Text(d)) if *d == domain)
        });
        Ok(Value::Array(entries))
    }

    fn knowledge_by_tags(&self, params: &Value) -> Result<Value> {
        let tags: Vec<String> = params
            .get("tags")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .ok_or_else(|| EngramError::InvalidRequest("missing array param `tags`".to_string()))?;
        let entries = self.knowledge_scan(|metadata| {
            let Some(MetadataValue::Text(stored)) = metadata.get("tags") else {
                return false;
            };
            stored.split(',').any(|tag| tags.iter().any(|t| t == tag))
        });
        Ok(Value::Array(entries))
    }

    fn knowledge_delete(&self, params: &Value) -> Result<Value> {
        let id = param_str(params, "id")?;
        Ok(json!({ "deleted": self.state.store.delete(&VectorId::from(id)) }))
    }

    fn feedback_provide(&self, params: &Value) -> Result<Value> {
        let raw_id = param_str(params, "trajectory_id")?;
        let trajectory_id = TrajectoryId::parse(&raw_id)?;
        let quality = params
            .get("quality")
            .and_then(Value::as_f64)
            .ok_or_else(|| EngramError::FeedbackValidation("missing `quality`".to_string()))?;
        let weight = self.state.bank.provide_feedback(&trajectory_id, quality)?;
        Ok(json!({ "weight": weight }))
    }

    fn patterns_query(&self, params: &Value) -> Result<Value> {
        let task_type = param_str(params, "task_type")?;
        let signature = param_vector(params, "signature")?;
        let top_k = params
            .get("top_k")
            .and_then(Value::as_u64)
            .unwrap_or(10) as usize;
        let patterns = self.state.patterns.query(&task_type, &signature, top_k)?;
        Ok(Value::Array(
            patterns
                .into_iter()
                .map(|p| {
                    json!({
                        "id": p.id.as_str(),
                        "task_type": p.task_type,
                        "confidence": p.confidence,
                        "successes": p.success_count,
                        "failures": p.failure_count,
                    })
                })
                .collect(),
        ))
    }

    fn trajectory_create(&self, params: &Value) -> Result<Value> {
        let route = param_str(params, "route")?;
        let labels: Vec<String> = params
            .get("labels")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let context_ids: Vec<String> = params
            .get("context_ids")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let id = self.state.bank.create_trajectory(&route, labels, context_ids)?;
        Ok(json!({ "trajectory_id": id.as_str() }))
    }

    /// Graceful shutdown: drain in-flight requests, run handlers in
    /// priority order, close the listener, remove the socket.
    pub fn shutdown(&self) {
        let budget = Duration::from_millis(self.config.shutdown_budget_ms);
        let started = Instant::now();
        self.stop.store(true, Ordering::SeqCst);

        while self.active.load(Ordering::SeqCst) > 0 && started.elapsed() < budget {
            std::thread::sleep(Duration::from_millis(20));
        }

        let mut handlers = std::mem::take(&mut *self.handlers.lock());
        handlers.sort_by_key(|(priority, _)| *priority);
        for (priority, handler) in handlers {
            if started.elapsed() >= budget {
                warn!(
                    target: "engram.daemon::server",
                    priority,
                    "shutdown budget exhausted, skipping remaining handlers"
                );
                break;
            }
            handler();
        }

        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        let _ = engram_fs::remove_file(&self.socket_path);
        info!(target: "engram.daemon::server", "daemon stopped");
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Block until a shutdown request arrives, then drain.
    pub fn run_until_shutdown(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(50));
        }
        self.shutdown();
    }
}

fn param_str(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngramError::InvalidRequest(format!("missing string param `{key}`")))
}

fn param_vector(params: &Value, key: &str) -> Result<Vec<f32>> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .map(|v| v.as_f64().unwrap_or(f64::NAN) as f32)
                .collect()
        })
        .ok_or_else(|| EngramError::InvalidRequest(format!("missing vector param `{key}`")))
}

/// One round-trip RPC over the daemon socket.
pub fn rpc_call(socket: &Path, method: &str, params: Value, timeout: Duration) -> Result<Value> {
    let stream = UnixStream::connect(socket).map_err(|_| EngramError::ServerNotRunning)?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| EngramError::io(socket, e))?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|e| EngramError::io(socket, e))?;
    let request = RpcRequest {
        jsonrpc: protocol::JSONRPC_VERSION.to_string(),
        id: Value::from(1),
        method: method.to_string(),
        params,
    };
    let mut writer = stream.try_clone().map_err(|e| EngramError::io(socket, e))?;
    let line = serde_json::to_string(&request)
        .map_err(|err| EngramError::Internal(format!("request serialize: {err}")))?;
    writeln!(writer, "{line}").map_err(|_| EngramError::ServerDisconnected)?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    match reader.read_line(&mut response_line) {
        Ok(0) | Err(_) => return Err(EngramError::ServerDisconnected),
        Ok(_) => {}
    }
    let response: RpcResponse = serde_json::from_str(response_line.trim_end())
        .map_err(|err| EngramError::ParseError(err.to_string()))?;
    if let Some(error) = response.error {
        return Err(EngramError::InvalidRequest(format!(
            "rpc error {}: {}",
            error.code, error.message
        )));
    }
    response
        .result
        .ok_or_else(|| EngramError::ParseError("response missing result".to_string()))
}

/// Status snapshot keyed for the CLI.
pub fn status_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(key, val)| (key.clone(), val.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, at: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[at] = 1.0;
        v
    }

    struct Rig {
        server: Arc<DaemonServer>,
        socket: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let mut config = EngramConfig::default();
        config.dim = 8;
        config.socket_path = socket.clone();
        let state = Arc::new(DaemonState::new(&config));
        let server = Arc::new(DaemonServer::new(
            socket.clone(),
            config.daemon.clone(),
            state,
        ));
        server.start().unwrap();
        Rig {
            server,
            socket,
            _dir: dir,
        }
    }

    fn call(rig: &Rig, method: &str, params: Value) -> Result<Value> {
        rpc_call(&rig.socket, method, params, Duration::from_secs(2))
    }

    #[test]
    fn ping_round_trips() {
        let rig = rig();
        let result = call(&rig, "ping", Value::Null).unwrap();
        assert_eq!(result["pong"], Value::Bool(true));
        rig.server.shutdown();
    }

    #[test]
    fn knowledge_store_and_query_by_domain_and_tags() {
        let rig = rig();
        let stored = call(
            &rig,
            "knowledge.store",
            json!({
                "embedding": unit(8, 0),
                "domain": "physics",
                "tags": ["quantum", "entanglement"],
                "content": "spooky action",
            }),
        )
        .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();

        let by_domain = call(&rig, "knowledge.by_domain", json!({"domain": "physics"})).unwrap();
        assert_eq!(by_domain.as_array().unwrap().len(), 1);
        assert_eq!(by_domain[0]["id"], Value::String(id.clone()));

        let by_tags = call(&rig, "knowledge.by_tags", json!({"tags": ["quantum"]})).unwrap();
        assert_eq!(by_tags.as_array().unwrap().len(), 1);

        let deleted = call(&rig, "knowledge.delete", json!({"id": id})).unwrap();
        assert_eq!(deleted["deleted"], Value::Bool(true));
        let after = call(&rig, "knowledge.by_domain", json!({"domain": "physics"})).unwrap();
        assert!(after.as_array().unwrap().is_empty());
        rig.server.shutdown();
    }

    #[test]
    fn feedback_flows_through_the_bank() {
        let rig = rig();
        let created = call(
            &rig,
            "trajectory.create",
            json!({"route": "Plan/Act", "labels": ["test"]}),
        )
        .unwrap();
        let trajectory_id = created["trajectory_id"].as_str().unwrap().to_string();
        let result = call(
            &rig,
            "feedback.provide",
            json!({"trajectory_id": trajectory_id, "quality": 1.0}),
        )
        .unwrap();
        assert!((result["weight"].as_f64().unwrap() - 0.6).abs() < 1e-9);
        rig.server.shutdown();
    }

    #[test]
    fn unknown_method_maps_to_the_reserved_code() {
        let rig = rig();
        let err = call(&rig, "no.such.method", Value::Null).unwrap_err();
        assert!(err.to_string().contains("-32601"), "{err}");
        rig.server.shutdown();
    }

    #[test]
    fn oversized_message_is_rejected_not_fatal() {
        let rig = rig();
        let huge = vec![0.0f32; 600_000];
        let err = call(&rig, "knowledge.store", json!({"embedding": huge})).unwrap_err();
        assert!(err.to_string().contains("cap"), "{err}");
        // The server is still alive.
        assert!(call(&rig, "ping", Value::Null).is_ok());
        rig.server.shutdown();
    }

    #[test]
    fn shutdown_runs_handlers_in_priority_order() {
        let rig = rig();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, label) in [(10, "second"), (1, "first"), (99, "third")] {
            let order = Arc::clone(&order);
            rig.server.register_shutdown_handler(
                priority,
                Box::new(move || order.lock().push(label)),
            );
        }
        call(&rig, "shutdown", Value::Null).unwrap();
        rig.server.shutdown();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
        assert!(!rig.socket.exists(), "socket file removed on shutdown");
    }

    #[test]
    fn second_daemon_on_the_same_socket_is_refused() {
        let rig = rig();
        let mut config = EngramConfig::default();
        config.dim = 8;
        let state = Arc::new(DaemonState::new(&config));
        let second = Arc::new(DaemonServer::new(
            rig.socket.clone(),
            config.daemon.clone(),
            state,
        ));
        assert!(second.start().is_err());
        rig.server.shutdown();
    }
}
