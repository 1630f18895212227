//! # JSC N-API Bridge
//!
//! This library implements the Node-API native-extension ABI on top of an
//! embeddable JavaScript engine that has no native support for it. Native
//! extensions written against the ABI create values, objects, functions,
//! typed arrays, promises, references and thread-safe functions through an
//! [`Env`], and the bridge maps each operation onto the engine.
//!
//! ## Architecture
//!
//! ```text
//! Native extension
//!     │
//!     │ ABI calls (Env methods)
//!     ▼
//! Rust Bridge (this crate)
//!     │
//!     │ Engine trait + global-scope builtins
//!     ▼
//! Embeddable JavaScript engine
//! ```
//!
//! ## Features
//!
//! - **Native objects**: functions, classes, externals and wraps carry a
//!   native record in the engine's private slot
//! - **References**: counted handles with finalization-registry cleanup
//! - **Thread-safe functions**: cross-thread calls dispatched through an
//!   embedder-supplied [`Executor`]
//! - **Status tracking**: last-error info and a single pending-exception slot

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod native;
pub mod reference;
pub mod threadsafe;
pub mod value;

// Re-export commonly used types
pub use config::{EnvConfig, NodeVersion};
pub use engine::{Engine, TypedArrayKind, ValueKind};
pub use env::{Env, EnvId, EscapableHandleScope, HandleScope};
pub use error::{BridgeError, BridgeResult, Error, ExtendedErrorInfo, Result, Status};
pub use executor::{Executor, QueueExecutor};
pub use metrics::{BridgeMetrics, BridgeStats};
pub use native::{CallbackInfo, PropertyAttributes, PropertyDescriptor};
pub use reference::Reference;
pub use threadsafe::{CallMode, ReleaseMode, ThreadsafeFunction};
pub use value::{Deferred, TypeTag, ValueType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
