//! Thread-safe functions.
//!
//! A [`ThreadsafeFunction`] is the one bridge object that may be touched
//! from any thread. Each call is queued on the environment's [`Executor`] and
//! runs later on the context-owning thread. The handle's thread count lives
//! behind a mutex; when the last holder releases it (or anyone aborts) the
//! count becomes -1, further calls fail with [`Error::Closing`], and a
//! teardown unit is queued. Teardown drops the function reference and runs
//! the finalizer exactly once; calls that reach the owner thread after it
//! are skipped. The count lock is never held while the executor runs.
//!
//! [`Executor`]: crate::executor::Executor

use crate::engine::{Engine, ValueKind};
use crate::env::{Env, EnvId};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::metrics::BridgeMetrics;
use crate::native::Finalize;
use crate::reference::Reference;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// Runs one queued call on the context-owning thread.
///
/// Receives the environment, the function given at creation, the creation
/// context and the data passed to [`ThreadsafeFunction::call`].
pub type CallJs<E> = fn(&Env<E>, Option<<E as Engine>::Value>, *mut c_void, *mut c_void);

/// Behaviour of [`ThreadsafeFunction::call`] on a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Fail with [`Error::QueueFull`]
    NonBlocking,
    /// Accepted for compatibility; behaves as [`CallMode::NonBlocking`]
    Blocking,
}

/// How [`ThreadsafeFunction::release`] gives up its hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Drop one hold; the last one closes the function
    Release,
    /// Close immediately regardless of other holders
    Abort,
}

/// Raw pointer handed between threads; the caller owns its validity.
#[derive(Clone, Copy)]
struct SendPtr(*mut c_void);

// SAFETY: the pointer is opaque to the bridge and only dereferenced by
// embedder callbacks on the context-owning thread.
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl SendPtr {
    fn get(self) -> *mut c_void {
        self.0
    }
}

struct Shared {
    id: u64,
    env: EnvId,
    /// Thread count; -1 while closing, 0 once torn down
    refcount: Mutex<i64>,
    max_queue_size: usize,
    queued: AtomicUsize,
    context: SendPtr,
    executor: Arc<dyn Executor>,
    metrics: Arc<BridgeMetrics>,
}

pub(crate) struct TsfnEntry<E: Engine> {
    function: Option<Reference<E>>,
    call_js: Option<CallJs<E>>,
    finalize: Option<Finalize<E>>,
    finalize_data: *mut c_void,
    shared: Arc<Shared>,
}

/// Cross-thread handle to a script function
pub struct ThreadsafeFunction<E: Engine> {
    shared: Arc<Shared>,
    _engine: PhantomData<fn() -> E>,
}

impl<E: Engine> Clone for ThreadsafeFunction<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _engine: PhantomData,
        }
    }
}

impl<E: Engine> fmt::Debug for ThreadsafeFunction<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadsafeFunction")
            .field("id", &self.shared.id)
            .field("env", &self.shared.env)
            .field("refcount", &*self.shared.refcount.lock())
            .field("queued", &self.shared.queued.load(Ordering::Acquire))
            .finish()
    }
}

impl<E: Engine> ThreadsafeFunction<E> {
    /// Identifier, unique within its environment
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Context pointer given at creation
    pub fn context(&self) -> *mut c_void {
        self.shared.context.get()
    }

    /// Queue a call carrying `data`
    pub fn call(&self, data: *mut c_void, mode: CallMode) -> Result<()> {
        let shared = &self.shared;
        {
            let count = shared.refcount.lock();
            if *count <= 0 {
                return Err(Error::Closing);
            }
            let queued = shared.queued.load(Ordering::Acquire);
            if shared.max_queue_size > 0 && queued >= shared.max_queue_size {
                trace!(tsfn = shared.id, ?mode, "Thread-safe function queue full");
                return Err(Error::QueueFull);
            }
            shared.queued.fetch_add(1, Ordering::AcqRel);
        }
        shared.metrics.tsfn_call_dispatched();

        // The executor may block, so it never runs under the count lock
        let work_shared = Arc::clone(shared);
        let data = SendPtr(data);
        shared
            .executor
            .dispatch_async(Box::new(move || run_call::<E>(&work_shared, data.get())));
        Ok(())
    }

    /// Register one more holder
    pub fn acquire(&self) -> Result<()> {
        let mut count = self.shared.refcount.lock();
        if *count <= 0 {
            return Err(Error::Closing);
        }
        *count += 1;
        Ok(())
    }

    /// Give up a hold, or abort
    pub fn release(&self, mode: ReleaseMode) -> Result<()> {
        let shared = &self.shared;
        {
            let mut count = shared.refcount.lock();
            if *count <= 0 {
                return Err(Error::Closing);
            }
            match mode {
                ReleaseMode::Abort => *count = -1,
                ReleaseMode::Release => {
                    *count -= 1;
                    if *count > 0 {
                        return Ok(());
                    }
                    *count = -1;
                }
            }
        }

        debug!(tsfn = shared.id, ?mode, "Closing thread-safe function");
        // Calls that race past this point find the entry gone and are skipped
        let work_shared = Arc::clone(shared);
        shared
            .executor
            .dispatch_async(Box::new(move || teardown::<E>(&work_shared)));
        Ok(())
    }
}

fn run_call<E: Engine>(shared: &Shared, data: *mut c_void) {
    shared.queued.fetch_sub(1, Ordering::AcqRel);
    let env = match Env::<E>::lookup(shared.env) {
        Ok(env) => env,
        Err(error) => {
            trace!(tsfn = shared.id, %error, "Dropping call");
            return;
        }
    };
    let (function, call_js) = {
        let tsfns = env.tsfns.borrow();
        let Some(entry) = tsfns.get(&shared.id) else {
            trace!(tsfn = shared.id, "Thread-safe function finalized; dropping call");
            return;
        };
        (
            entry.function.as_ref().and_then(Reference::value),
            entry.call_js,
        )
    };

    match (call_js, function) {
        (Some(call_js), function) => call_js(&env, function, shared.context.get(), data),
        (None, Some(function)) => {
            let undefined = env.engine().undefined();
            if let Err(exception) = env.engine().call(&function, &undefined, &[]) {
                env.set_exception(exception);
            }
        }
        (None, None) => {}
    }
    if let Some(exception) = env.take_exception() {
        warn!(
            env = %env.id(),
            tsfn = shared.id,
            ?exception,
            "Uncaught exception in thread-safe call"
        );
    }
    shared.metrics.tsfn_call_executed();
}

fn teardown<E: Engine>(shared: &Shared) {
    *shared.refcount.lock() = 0;
    let Ok(env) = Env::<E>::lookup(shared.env) else {
        return;
    };
    let entry = env.tsfns.borrow_mut().remove(&shared.id);
    if let Some(entry) = entry {
        env.finalize_threadsafe_function(shared.id, entry);
    }
}

impl<E: Engine> Env<E> {
    fn finalize_threadsafe_function(&self, id: u64, entry: TsfnEntry<E>) {
        if self.strong_tsfns.borrow_mut().remove(&id) {
            self.check_empty();
        }
        if let Some(function) = entry.function {
            self.drop_reference(function);
        }
        if let Some(finalize) = entry.finalize {
            finalize(self, entry.finalize_data, entry.shared.context.get());
        }
        self.metrics().tsfn_finalized();
        debug!(env = %self.id(), tsfn = id, "Finalized thread-safe function");
    }

    /// Close and finalize every thread-safe function still open
    pub(crate) fn close_threadsafe_functions(&self) {
        let entries: Vec<(u64, TsfnEntry<E>)> = self.tsfns.borrow_mut().drain().collect();
        for (id, entry) in entries {
            *entry.shared.refcount.lock() = -1;
            self.finalize_threadsafe_function(id, entry);
        }
    }

    /// Create a thread-safe function.
    ///
    /// Either `function` or `call_js` must be given. `max_queue_size` of
    /// zero means unbounded; `initial_thread_count` must be positive.
    #[allow(clippy::too_many_arguments)]
    #[instrument(
        skip_all,
        fields(
            env = %self.id(),
            max_queue_size = max_queue_size,
            initial_thread_count = initial_thread_count
        )
    )]
    pub fn create_threadsafe_function(
        &self,
        function: Option<&E::Value>,
        max_queue_size: usize,
        initial_thread_count: usize,
        finalize_data: *mut c_void,
        finalize: Option<Finalize<E>>,
        context: *mut c_void,
        call_js: Option<CallJs<E>>,
    ) -> Result<ThreadsafeFunction<E>> {
        self.entry(|| {
            if initial_thread_count == 0 {
                return Err(Error::InvalidArg);
            }
            let function = match (function, call_js) {
                (None, None) => return Err(Error::InvalidArg),
                (Some(function), _) => {
                    self.expect_kind(function, ValueKind::Function, Error::FunctionExpected)?;
                    Some(self.new_reference(function, 1)?)
                }
                (None, Some(_)) => None,
            };

            let id = self.next_id();
            let shared = Arc::new(Shared {
                id,
                env: self.id(),
                refcount: Mutex::new(initial_thread_count as i64),
                max_queue_size,
                queued: AtomicUsize::new(0),
                context: SendPtr(context),
                executor: Arc::clone(self.executor()),
                metrics: Arc::clone(self.metrics()),
            });
            self.tsfns.borrow_mut().insert(
                id,
                TsfnEntry {
                    function,
                    call_js,
                    finalize,
                    finalize_data,
                    shared: Arc::clone(&shared),
                },
            );
            self.strong_tsfns.borrow_mut().insert(id);
            debug!(tsfn = id, "Created thread-safe function");

            Ok(ThreadsafeFunction {
                shared,
                _engine: PhantomData,
            })
        })
    }

    /// Count the function towards keeping the environment busy
    pub fn ref_threadsafe_function(&self, tsfn: &ThreadsafeFunction<E>) -> Result<()> {
        self.entry(|| {
            if !self.tsfns.borrow().contains_key(&tsfn.shared.id) {
                return Err(Error::InvalidArg);
            }
            self.strong_tsfns.borrow_mut().insert(tsfn.shared.id);
            Ok(())
        })
    }

    /// Stop counting the function towards keeping the environment busy
    pub fn unref_threadsafe_function(&self, tsfn: &ThreadsafeFunction<E>) -> Result<()> {
        self.entry(|| {
            if self.strong_tsfns.borrow_mut().remove(&tsfn.shared.id) {
                self.check_empty();
            }
            Ok(())
        })
    }
}
