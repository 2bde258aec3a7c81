// workhive: the caller-facing facade. Turns a dotted path into a scheduled
// task without exposing `Pool::schedule`'s positional arguments directly.
//
// Spec §4.1 describes a dynamic-language proxy: property access on `P`
// accumulates a path string, and only an invocation consumes it, with every
// other property read returning `P` itself so `root.ns.method(...)` chains.
// Rust has no attribute interception, so per spec §9 ("Design Notes:
// Dynamic method surface") this is the typestate-builder rendition: each
// `.path(...)` call is the Rust analogue of one property access, joining
// onto the accumulator, and only `.call(...)`/`.call!` consumes it.

use crate::config::TaskOptions;
use crate::pool::{Pool, PoolStats};
use crate::task::TaskHandle;
use crate::value::Value;

/// The callable facade returned by [`Pool::facade`]. Cheap to clone --
/// cloning shares the same underlying [`Pool`].
#[derive(Clone)]
pub struct PoolHandle {
    pool: Pool,
    options: TaskOptions,
}

impl PoolHandle {
    pub(crate) fn new(pool: Pool) -> Self {
        Self {
            pool,
            options: TaskOptions::default(),
        }
    }

    /// The JS source's `pool(scheduleOptions)` call: returns a facade whose
    /// subsequent invocations all carry `options`, without mutating `self`.
    pub fn with_options(&self, options: TaskOptions) -> Self {
        Self {
            pool: self.pool.clone(),
            options,
        }
    }

    /// Starts (or extends) a dotted path. Each call is one "property access"
    /// in the spec's terms; chain as many as the action tree is nested.
    pub fn path(&self, segment: impl AsRef<str>) -> PathBuilder {
        PathBuilder {
            pool: self.pool.clone(),
            options: self.options.clone(),
            path: segment.as_ref().to_string(),
        }
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await
    }
}

/// An in-progress path accumulation. Non-terminal: building one without
/// calling [`PathBuilder::call`] has no side effect, matching spec §4.1
/// ("Calling `pool(...)` without a trailing invocation has no side
/// effect").
#[derive(Clone)]
pub struct PathBuilder {
    pool: Pool,
    options: TaskOptions,
    path: String,
}

impl PathBuilder {
    /// Extends the accumulated path with another dotted segment.
    pub fn path(mut self, segment: impl AsRef<str>) -> Self {
        self.path.push('.');
        self.path.push_str(segment.as_ref());
        self
    }

    /// The only operation that consumes the accumulator: submits a task for
    /// the path built so far and returns its handle immediately.
    pub fn call(self, args: Vec<Value>) -> TaskHandle {
        self.pool.schedule(self.path, args, self.options)
    }
}

/// Sugar for `facade.path("a").path("b")....call(vec![...])` that reads
/// closer to a direct method call: `call!(facade, a.b.c(x, y))`.
#[macro_export]
macro_rules! call {
    ($facade:expr, $first:ident $(. $rest:ident)* ( $($arg:expr),* $(,)? )) => {{
        let mut __path = ::std::string::String::from(stringify!($first));
        $(
            __path.push('.');
            __path.push_str(stringify!($rest));
        )*
        $facade.path(__path).call(vec![$(::std::convert::Into::into($arg)),*])
    }};
}
