//! The per-context environment.
//!
//! An [`Env`] owns one engine context together with every piece of bridging
//! state the ABI needs: the last-error and pending-exception slots, the
//! lazily created finalization registry and type-tag map, the strong
//! reference table, cleanup hooks and the thread-safe function tables.
//!
//! Environments live on the context-owning thread behind an `Rc` and are
//! destroyed only through [`Env::delete`].

use crate::config::{EnvConfig, NodeVersion};
use crate::engine::{Engine, JsResult, ValueKind};
use crate::error::{
    fatal_error, BridgeError, BridgeResult, Error, ExtendedErrorInfo, Result, Status,
};
use crate::executor::Executor;
use crate::metrics::BridgeMetrics;
use crate::reference::RefState;
use crate::threadsafe::TsfnEntry;
use once_cell::unsync::OnceCell;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::c_void;
use std::fmt;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

/// Identifier of one environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(Uuid);

impl EnvId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Hook run once when its environment is deleted
pub type CleanupHook = fn(*mut c_void);

/// Async cleanup hook; not supported by this binding
pub type AsyncCleanupHook = fn(*mut c_void, *mut c_void);

thread_local! {
    // Environments owned by this thread, for work arriving through an executor
    static DIRECTORY: RefCell<HashMap<EnvId, Weak<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Bracket returned by [`Env::open_handle_scope`]
#[derive(Debug)]
pub struct HandleScope {
    env: EnvId,
}

/// Bracket returned by [`Env::open_escapable_handle_scope`]
#[derive(Debug)]
pub struct EscapableHandleScope {
    env: EnvId,
    escaped: Cell<bool>,
}

/// Bridging state for one engine context
pub struct Env<E: Engine> {
    id: EnvId,
    engine: E,
    executor: Arc<dyn Executor>,
    config: EnvConfig,
    this: Weak<Env<E>>,
    last_exception: RefCell<Option<E::Value>>,
    last_error: Cell<ExtendedErrorInfo>,
    pub(crate) registry: OnceCell<E::Value>,
    pub(crate) type_tags: OnceCell<E::Value>,
    pub(crate) strong_refs: RefCell<BTreeMap<u64, Rc<RefState<E>>>>,
    next_id: Cell<u64>,
    cleanup_hooks: RefCell<HashMap<CleanupHook, HashSet<*mut c_void>>>,
    pub(crate) tsfns: RefCell<HashMap<u64, TsfnEntry<E>>>,
    pub(crate) strong_tsfns: RefCell<HashSet<u64>>,
    open_scopes: Cell<usize>,
    metrics: Arc<BridgeMetrics>,
    deleting: Cell<bool>,
}

impl<E: Engine> Env<E> {
    /// Wrap an engine context and its dispatcher in a new environment.
    ///
    /// The environment registers itself with the current thread so work
    /// dispatched through `executor` can find it again.
    #[instrument(skip_all, fields(napi_version = config.napi_version))]
    pub fn new(engine: E, executor: Arc<dyn Executor>, config: EnvConfig) -> Rc<Self> {
        let id = EnvId::new();
        let env = Rc::new_cyclic(|this| Self {
            id,
            engine,
            executor,
            config,
            this: this.clone(),
            last_exception: RefCell::new(None),
            last_error: Cell::new(ExtendedErrorInfo::default()),
            registry: OnceCell::new(),
            type_tags: OnceCell::new(),
            strong_refs: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(1),
            cleanup_hooks: RefCell::new(HashMap::new()),
            tsfns: RefCell::new(HashMap::new()),
            strong_tsfns: RefCell::new(HashSet::new()),
            open_scopes: Cell::new(0),
            metrics: Arc::new(BridgeMetrics::new()),
            deleting: Cell::new(false),
        });

        let entry: Weak<dyn Any> = Rc::downgrade(&env) as Weak<Self>;
        DIRECTORY.with(|directory| directory.borrow_mut().insert(id, entry));
        info!(env = %id, "Created environment");
        env
    }

    /// Create an environment from a JSON configuration file
    pub fn from_config_file(
        engine: E,
        executor: Arc<dyn Executor>,
        path: impl AsRef<Path>,
    ) -> BridgeResult<Rc<Self>> {
        let config = EnvConfig::from_file(path)?;
        Ok(Self::new(engine, executor, config))
    }

    /// Find a live environment owned by the current thread
    pub fn lookup(id: EnvId) -> BridgeResult<Rc<Self>> {
        DIRECTORY
            .with(|directory| directory.borrow().get(&id).and_then(Weak::upgrade))
            .and_then(|entry| entry.downcast::<Self>().ok())
            .ok_or(BridgeError::EnvironmentNotFound(id))
    }

    /// Tear the environment down.
    ///
    /// Runs every cleanup hook, finalizes thread-safe functions that are
    /// still open and drops every strong reference. The engine then
    /// reclaims every object while the environment is still alive, so the
    /// remaining native finalizers run with it.
    #[instrument(skip_all, fields(env = %env.id))]
    pub fn delete(env: Rc<Self>) {
        env.check_thread();
        env.deleting.set(true);

        let hooks = std::mem::take(&mut *env.cleanup_hooks.borrow_mut());
        let mut ran = 0;
        for (hook, args) in hooks {
            for arg in args {
                hook(arg);
                ran += 1;
            }
        }
        env.metrics.cleanup_hooks_ran(ran);
        debug!(hooks = ran, "Ran cleanup hooks");

        env.close_threadsafe_functions();

        let strong = std::mem::take(&mut *env.strong_refs.borrow_mut());
        let released = strong.len();
        for state in strong.into_values() {
            state.deinit(&env.engine);
        }
        debug!(references = released, "Released strong references");

        if let Some(registry) = env.registry.get() {
            env.engine.unprotect(registry);
        }
        if let Some(type_tags) = env.type_tags.get() {
            env.engine.unprotect(type_tags);
        }

        // Remaining finalizers still need a live environment
        env.engine.teardown();

        DIRECTORY.with(|directory| directory.borrow_mut().remove(&env.id));

        let others = Rc::strong_count(&env) - 1;
        if others > 0 {
            warn!(others, "Environment still referenced after delete");
        }
        info!("Deleted environment");
    }

    /// Environment id
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// The engine context
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Environment configuration
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Shared counters
    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }

    /// Whether [`Env::delete`] has started
    pub fn is_deleting(&self) -> bool {
        self.deleting.get()
    }

    pub(crate) fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub(crate) fn downgrade(&self) -> Weak<Self> {
        self.this.clone()
    }

    pub(crate) fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    pub(crate) fn check_thread(&self) {
        if self.config.check_thread {
            self.executor.assert_current();
        }
    }

    /// Run one ABI entry point: assert the thread, then record the outcome
    /// as the last error.
    pub(crate) fn entry<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.check_thread();
        let result = body();
        self.last_error.set(ExtendedErrorInfo {
            error_code: Status::of(&result),
            ..ExtendedErrorInfo::default()
        });
        result
    }

    /// Like [`Env::entry`] for operations that may run script; refuses to
    /// start while an exception is pending.
    pub(crate) fn entry_js<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.entry(|| {
            if self.is_pending() {
                return Err(Error::PendingException);
            }
            body()
        })
    }

    /// Move an engine exception into the pending-exception slot
    pub(crate) fn capture<T>(&self, result: JsResult<T, E::Value>) -> Result<T> {
        result.map_err(|exception| {
            trace!(env = %self.id, ?exception, "Captured engine exception");
            self.metrics.exception_captured();
            self.set_exception(exception);
            Error::PendingException
        })
    }

    pub(crate) fn set_exception(&self, exception: E::Value) {
        *self.last_exception.borrow_mut() = Some(exception);
    }

    pub(crate) fn take_exception(&self) -> Option<E::Value> {
        self.last_exception.borrow_mut().take()
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.last_exception.borrow().is_some()
    }

    pub(crate) fn clear_last_error(&self) {
        self.last_error.set(ExtendedErrorInfo::default());
    }

    /// Details of the last ABI call, with the canonical message attached
    pub fn get_last_error_info(&self) -> ExtendedErrorInfo {
        self.check_thread();
        let mut info = self.last_error.get();
        info.error_message = info.error_code.message();
        info
    }

    /// Advisory hook for when nothing strong remains; never tears down
    pub(crate) fn check_empty(&self) {
        if self.strong_refs.borrow().is_empty() && self.strong_tsfns.borrow().is_empty() {
            debug!(env = %self.id, "No strong references or thread-safe functions remain");
        }
    }

    /// Register `hook(arg)` to run when the environment is deleted
    pub fn add_env_cleanup_hook(&self, hook: CleanupHook, arg: *mut c_void) -> Result<()> {
        self.entry(|| {
            self.cleanup_hooks
                .borrow_mut()
                .entry(hook)
                .or_default()
                .insert(arg);
            Ok(())
        })
    }

    /// Unregister a cleanup hook; unknown pairs are ignored
    pub fn remove_env_cleanup_hook(&self, hook: CleanupHook, arg: *mut c_void) -> Result<()> {
        self.entry(|| {
            let mut hooks = self.cleanup_hooks.borrow_mut();
            if let Some(args) = hooks.get_mut(&hook) {
                args.remove(&arg);
                if args.is_empty() {
                    hooks.remove(&hook);
                }
            }
            Ok(())
        })
    }

    /// Not supported by this binding
    pub fn add_async_cleanup_hook(&self, _hook: AsyncCleanupHook, _arg: *mut c_void) -> Result<()> {
        fatal_error("napi_add_async_cleanup_hook", "async cleanup hooks are not supported")
    }

    /// Not supported by this binding
    pub fn remove_async_cleanup_hook(&self, _handle: *mut c_void) -> Result<()> {
        fatal_error("napi_remove_async_cleanup_hook", "async cleanup hooks are not supported")
    }

    /// Open a handle scope. Scopes only track nesting.
    pub fn open_handle_scope(&self) -> Result<HandleScope> {
        self.entry(|| {
            self.open_scopes.set(self.open_scopes.get() + 1);
            Ok(HandleScope { env: self.id })
        })
    }

    /// Close a handle scope
    pub fn close_handle_scope(&self, scope: HandleScope) -> Result<()> {
        self.entry(|| self.close_scope(scope.env))
    }

    /// Open a scope from which one value may escape
    pub fn open_escapable_handle_scope(&self) -> Result<EscapableHandleScope> {
        self.entry(|| {
            self.open_scopes.set(self.open_scopes.get() + 1);
            Ok(EscapableHandleScope {
                env: self.id,
                escaped: Cell::new(false),
            })
        })
    }

    /// Close an escapable scope
    pub fn close_escapable_handle_scope(&self, scope: EscapableHandleScope) -> Result<()> {
        self.entry(|| self.close_scope(scope.env))
    }

    /// Promote `escapee` to the enclosing scope; allowed once per scope
    pub fn escape_handle(
        &self,
        scope: &EscapableHandleScope,
        escapee: &E::Value,
    ) -> Result<E::Value> {
        self.entry(|| {
            if scope.env != self.id {
                return Err(Error::HandleScopeMismatch);
            }
            if scope.escaped.replace(true) {
                return Err(Error::EscapeCalledTwice);
            }
            Ok(escapee.clone())
        })
    }

    fn close_scope(&self, owner: EnvId) -> Result<()> {
        let open = self.open_scopes.get();
        if owner != self.id || open == 0 {
            return Err(Error::HandleScopeMismatch);
        }
        self.open_scopes.set(open - 1);
        Ok(())
    }

    /// ABI version reported to extensions
    pub fn get_version(&self) -> Result<u32> {
        self.entry(|| Ok(self.config.napi_version))
    }

    /// Host version reported to extensions
    pub fn get_node_version(&self) -> Result<NodeVersion> {
        self.entry(|| Ok(self.config.node_version.clone()))
    }

    /// Accepts an external-memory hint and echoes the change back
    pub fn adjust_external_memory(&self, change_in_bytes: i64) -> Result<i64> {
        self.entry(|| Ok(change_in_bytes))
    }

    /// Evaluate a script string in the global scope
    pub fn run_script(&self, script: &E::Value) -> Result<E::Value> {
        self.entry_js(|| {
            if self.engine.kind(script) != ValueKind::String {
                return Err(Error::StringExpected);
            }
            let source = self.capture(self.engine.to_string(script))?;
            self.capture(self.engine.evaluate_script(&source))
        })
    }
}

impl<E: Engine> fmt::Debug for Env<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("id", &self.id)
            .field("strong_refs", &self.strong_refs.borrow().len())
            .field("tsfns", &self.tsfns.borrow().len())
            .field("deleting", &self.deleting.get())
            .finish()
    }
}
