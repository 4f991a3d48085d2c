//! Simulated instrument network for testing.
//!
//! `SimulatedTransport` answers the command vocabulary of [`commands`] the way a
//! TSP controller and its subordinate nodes would. It provides:
//! - A script table per node (loaded, embedded, byte code, activated)
//! - A shared error queue surfaced through the status byte
//! - Controllable failure injection
//! - Call logging for test verification
//!
//! Script entries are never dropped: deleting a script clears its flags but keeps
//! its behavior (namespace, version getter, run failure) for the next upload.
//!
//! [`commands`]: super::commands

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use super::commands::{self, END_SCRIPT_KEYWORD, LOAD_SCRIPT_KEYWORD};
use super::{ScriptTransport, StatusByte, TransportPacing};
use crate::codec;

/// One script as seen by a simulated node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedScript {
    /// Script name.
    pub name: String,
    /// Source as uploaded.
    pub source: String,
    /// Stored as byte code.
    pub byte_code: bool,
    /// Present in runtime memory.
    pub loaded: bool,
    /// Present in the non-volatile catalog.
    pub embedded: bool,
    /// Has been run.
    pub activated: bool,
    /// Global table defined when the script runs.
    pub namespace: Option<String>,
    /// Version getter defined when the script runs.
    pub version_getter: Option<String>,
    /// Value returned by the version getter.
    pub version: Option<String>,
    /// Version reported after the script is uploaded again.
    pub upload_version: Option<String>,
    /// Running the script raises an error.
    pub fails_on_run: bool,
}

impl SimulatedScript {
    /// A script that is neither loaded nor embedded.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Marks the script as loaded in runtime memory.
    pub fn loaded(mut self) -> Self {
        self.loaded = true;
        self
    }

    /// Marks the script as present in the non-volatile catalog.
    ///
    /// Embedded scripts are loaded at power-up, so this also marks it loaded.
    pub fn embedded(mut self) -> Self {
        self.embedded = true;
        self.loaded = true;
        self
    }

    /// Marks the script as already run.
    pub fn activated(mut self) -> Self {
        self.loaded = true;
        self.activated = true;
        self
    }

    /// Marks the stored script as byte code.
    pub fn byte_code(mut self) -> Self {
        self.byte_code = true;
        self
    }

    /// Sets the source text.
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    /// Sets the namespace defined when the script runs.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Sets the version getter and the value it returns.
    pub fn with_version(mut self, getter: &str, version: &str) -> Self {
        self.version_getter = Some(getter.to_string());
        self.version = Some(version.to_string());
        self
    }

    /// Sets the version reported once a new copy has been uploaded.
    pub fn upgrades_to(mut self, version: &str) -> Self {
        self.upload_version = Some(version.to_string());
        self
    }

    /// Makes every run of the script fail.
    pub fn failing(mut self) -> Self {
        self.fails_on_run = true;
        self
    }

    fn head(&self) -> String {
        if !self.loaded {
            String::new()
        } else if self.byte_code {
            "loadstring(".to_string()
        } else {
            self.source.chars().take(codec::CLASSIFY_WINDOW).collect()
        }
    }
}

#[derive(Debug, Default)]
struct SimulatedNode {
    scripts: IndexMap<String, SimulatedScript>,
    gc_incomplete: bool,
}

impl SimulatedNode {
    fn names(&self, filter: impl Fn(&SimulatedScript) -> bool) -> String {
        self.scripts
            .values()
            .filter(|script| filter(script))
            .map(|script| format!("{},", script.name))
            .collect()
    }

    fn entry(&mut self, name: &str) -> &mut SimulatedScript {
        self.scripts
            .entry(name.to_string())
            .or_insert_with(|| SimulatedScript::new(name))
    }
}

#[derive(Debug)]
struct PendingLoad {
    name: String,
    lines: Vec<String>,
}

#[derive(Debug, Default)]
struct SimulatedState {
    controller: u8,
    nodes: BTreeMap<u8, SimulatedNode>,
    error_queue: VecDeque<String>,
    pending_load: Option<PendingLoad>,
}

impl SimulatedState {
    fn prefix(&self, node: u8) -> String {
        if node == self.controller {
            String::new()
        } else {
            format!("node[{node}].")
        }
    }

    fn node_mut(&mut self, node: Option<u8>) -> Result<&mut SimulatedNode> {
        let number = node.unwrap_or(self.controller);
        self.nodes
            .get_mut(&number)
            .ok_or_else(|| anyhow!("Node {number} is not present on the network"))
    }

    fn runtime_error(&mut self, message: String) {
        self.error_queue
            .push_back(format!("-286, TSP Runtime error: {message}"));
    }

    fn load(&mut self, node: Option<u8>, name: &str, source: String, byte_code: bool) -> Result<()> {
        let script = self.node_mut(node)?.entry(name);
        script.source = source;
        script.byte_code = byte_code;
        script.loaded = true;
        script.activated = false;
        if let Some(version) = script.upload_version.clone() {
            script.version = Some(version);
        }
        Ok(())
    }

    fn execute(&mut self, command: &str) -> Result<()> {
        if let Some(mut pending) = self.pending_load.take() {
            if command.trim() == END_SCRIPT_KEYWORD {
                let source = pending.lines.join("\n");
                let byte_code = codec::classify(&source).is_binary;
                return self.load(None, &pending.name, source, byte_code);
            }
            pending.lines.push(command.to_string());
            self.pending_load = Some(pending);
            return Ok(());
        }

        if let Some(name) = command
            .strip_prefix(LOAD_SCRIPT_KEYWORD)
            .and_then(|rest| rest.strip_prefix(' '))
        {
            self.pending_load = Some(PendingLoad {
                name: name.trim().to_string(),
                lines: Vec::new(),
            });
            return Ok(());
        }

        let (node, rest) = commands::split_node_prefix(command);

        if let Some(name) = rest
            .strip_prefix("script.delete('")
            .and_then(|r| r.strip_suffix("')"))
        {
            if let Some(script) = self.node_mut(node)?.scripts.get_mut(name) {
                script.embedded = false;
                script.loaded = false;
                script.activated = false;
            }
            return Ok(());
        }

        if let Some(args) = rest
            .strip_prefix("script.new(")
            .and_then(|r| r.strip_suffix("')"))
        {
            let (code, name) = args
                .rsplit_once(", '")
                .ok_or_else(|| anyhow!("Malformed script.new command: {command}"))?;
            return self.load(node, name, code.to_string(), codec::is_loader_payload(code));
        }

        if rest.starts_with("collectgarbage()") {
            return Ok(());
        }

        if let Some(name) = rest.strip_suffix(".source = nil") {
            match self.node_mut(node)?.scripts.get_mut(name) {
                Some(script) if script.loaded => script.byte_code = true,
                _ => self.runtime_error(format!("attempt to index a nil value ({name})")),
            }
            return Ok(());
        }

        if let Some(name) = rest.strip_suffix(" = nil") {
            if let Some(script) = self.node_mut(node)?.scripts.get_mut(name) {
                script.loaded = false;
                script.activated = false;
            }
            return Ok(());
        }

        if let Some(name) = rest.strip_suffix(".save()") {
            match self.node_mut(node)?.scripts.get_mut(name) {
                Some(script) if script.loaded => script.embedded = true,
                _ => self.runtime_error(format!("attempt to index a nil value ({name})")),
            }
            return Ok(());
        }

        if let Some(name) = rest.strip_suffix(".run()") {
            let outcome = match self.node_mut(node)?.scripts.get_mut(name) {
                Some(script) if script.loaded || script.embedded => {
                    if script.fails_on_run {
                        Err(format!("{name} raised an error while running"))
                    } else {
                        script.loaded = true;
                        script.activated = true;
                        Ok(())
                    }
                }
                _ => Err(format!("attempt to index a nil value ({name})")),
            };
            if let Err(message) = outcome {
                self.runtime_error(message);
            }
            return Ok(());
        }

        self.error_queue
            .push_back(format!("-285, TSP Syntax error near '{command}'"));
        Ok(())
    }

    fn evaluate(&mut self, expression: &str) -> Result<String> {
        if expression == commands::ERROR_QUEUE_QUERY {
            return Ok(self
                .error_queue
                .pop_front()
                .unwrap_or_else(|| "0, Queue Is Empty".to_string()));
        }
        match self.answer(expression) {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => {
                self.runtime_error(message);
                Ok(String::new())
            }
            None => bail!("Unrecognized expression: {expression}"),
        }
    }

    /// Reply to a print expression, or the runtime error it raises.
    fn answer(&self, expression: &str) -> Option<Result<String, String>> {
        for (&number, node) in &self.nodes {
            let prefix = self.prefix(number);

            if expression == commands::embedded_catalog_query(&prefix) {
                return Some(Ok(node.names(|s| s.embedded)));
            }
            if expression == commands::byte_code_catalog_query(&prefix) {
                return Some(Ok(node.names(|s| s.embedded && s.byte_code)));
            }
            if expression == commands::loaded_catalog_query(&prefix) {
                return Some(Ok(node.names(|s| s.loaded)));
            }
            if expression == commands::collect_garbage_query(&prefix) {
                let reply = if node.gc_incomplete { "0" } else { commands::COLLECT_GARBAGE_DONE };
                return Some(Ok(reply.to_string()));
            }

            for script in node.scripts.values() {
                if expression == commands::source_head_query(&prefix, &script.name) {
                    return Some(Ok(script.head()));
                }
                let Some(getter) = &script.version_getter else {
                    continue;
                };
                if expression == commands::version_query(&prefix, getter) {
                    return Some(if script.activated {
                        Ok(script.version.clone().unwrap_or_default())
                    } else {
                        Err(format!("attempt to call a nil value ({getter})"))
                    });
                }
            }
        }
        None
    }

    fn resolves_to_nil(&self, name: &str) -> bool {
        let (node, rest) = commands::split_node_prefix(name);
        let Some(node) = self.nodes.get(&node.unwrap_or(self.controller)) else {
            return true;
        };
        if let Some(script) = node.scripts.get(rest) {
            return !script.loaded;
        }
        !node.scripts.values().any(|script| {
            script.activated
                && (script.namespace.as_deref() == Some(rest)
                    || script.version_getter.as_deref() == Some(rest))
        })
    }
}

/// Simulated controller session with optional subordinate nodes.
///
/// # Example
///
/// ```
/// use rust_tsp::transport::{SimulatedScript, SimulatedTransport};
///
/// let transport = SimulatedTransport::new(1);
/// transport.define_script(1, SimulatedScript::new("isr_support").embedded());
/// assert!(transport.script(1, "isr_support").unwrap().embedded);
/// ```
#[derive(Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimulatedState>>,
    should_fail_next: Arc<AtomicBool>,
    failing_command: Arc<Mutex<Option<String>>>,
    call_log: Arc<Mutex<Vec<String>>>,
    pacing: TransportPacing,
}

impl SimulatedTransport {
    /// Creates a network holding only the controller node.
    pub fn new(controller_node: u8) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(controller_node, SimulatedNode::default());
        Self {
            state: Arc::new(Mutex::new(SimulatedState {
                controller: controller_node,
                nodes,
                ..Default::default()
            })),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            failing_command: Arc::new(Mutex::new(None)),
            call_log: Arc::new(Mutex::new(Vec::new())),
            pacing: TransportPacing::default(),
        }
    }

    /// Sets the pacing reported to the engine.
    pub fn with_pacing(mut self, pacing: TransportPacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Adds a subordinate node.
    pub fn add_node(&self, node: u8) {
        self.state.lock().nodes.entry(node).or_default();
    }

    /// Adds or replaces a script on a node.
    pub fn define_script(&self, node: u8, script: SimulatedScript) {
        let mut state = self.state.lock();
        state
            .nodes
            .entry(node)
            .or_default()
            .scripts
            .insert(script.name.clone(), script);
    }

    /// Snapshot of a script on a node.
    pub fn script(&self, node: u8, name: &str) -> Option<SimulatedScript> {
        self.state
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.scripts.get(name))
            .cloned()
    }

    /// Makes garbage collection on a node report that it did not complete.
    pub fn set_gc_incomplete(&self, node: u8, incomplete: bool) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.gc_incomplete = incomplete;
        }
    }

    /// Appends a message to the error queue.
    pub fn push_error(&self, message: &str) {
        self.state.lock().error_queue.push_back(message.to_string());
    }

    /// Number of unread errors.
    pub fn error_count(&self) -> usize {
        self.state.lock().error_queue.len()
    }

    /// Inject a failure for the next operation.
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Fail every write of exactly `command` as a lost session would.
    pub fn inject_failure_on(&self, command: &str) {
        *self.failing_command.lock() = Some(command.to_string());
    }

    /// Get the call log.
    pub fn call_log(&self) -> Vec<String> {
        self.call_log.lock().clone()
    }

    /// Clear the call log.
    pub fn clear_log(&self) {
        self.call_log.lock().clear();
    }

    fn log_call(&self, call: String) {
        debug!("simulated transport: {}", call);
        self.call_log.lock().push(call);
    }

    fn check_failure(&self) -> Result<()> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            bail!("Injected failure");
        }
        Ok(())
    }
}

#[async_trait]
impl ScriptTransport for SimulatedTransport {
    async fn write_line(&self, command: &str) -> Result<()> {
        self.log_call(format!("write: {command}"));
        self.check_failure()?;
        if self.failing_command.lock().as_deref() == Some(command) {
            bail!("session timeout");
        }
        self.state.lock().execute(command)
    }

    async fn query_print_value(&self, expression: &str) -> Result<String> {
        self.log_call(format!("query: {expression}"));
        self.check_failure()?;
        self.state.lock().evaluate(expression)
    }

    async fn is_nil(&self, name: &str) -> Result<bool> {
        self.log_call(format!("is_nil: {name}"));
        self.check_failure()?;
        Ok(self.state.lock().resolves_to_nil(name))
    }

    async fn read_status_byte(&self) -> Result<StatusByte> {
        self.log_call("status".to_string());
        self.check_failure()?;
        let mut status = StatusByte::empty();
        status.set(
            StatusByte::ERROR_AVAILABLE,
            !self.state.lock().error_queue.is_empty(),
        );
        Ok(status)
    }

    fn pacing(&self) -> TransportPacing {
        self.pacing
    }
}
