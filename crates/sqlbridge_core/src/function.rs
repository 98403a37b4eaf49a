//! User-defined function dispatch.
//!
//! A [`FunctionDispatcher`] wraps one [`FunctionKind`] and implements the
//! engine's function protocols (`xFunc`, `xStep`/`xFinal`,
//! `xValue`/`xInverse`) as a [`CallbackTarget`]. Each native invocation gets
//! its own [`CallContext`] passed to the body by mutable reference, so the
//! same function can run on several connections at once.
//!
//! Body failures and panics are turned into an error result on the call's
//! result slot; they never unwind into native code.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlbridge_core::{ConnectionBridge, FunctionFlags, FunctionKind};
//!
//! bridge.create_function(
//!     "double_it",
//!     1,
//!     FunctionFlags::DETERMINISTIC,
//!     FunctionKind::scalar(|ctx| {
//!         let x = ctx.value_long(0)?;
//!         ctx.result_long(x * 2);
//!         Ok(())
//!     }),
//! )?;
//! ```

use crate::error::{BridgeError, BridgeResult};
use crate::result_code::ResultCode;
use crate::stats::BridgeStats;
use crate::trampoline::{
    AbiValue, CallbackMethod, CallbackTarget, FinalFn, FunctionFn, Trampoline, TrampolineFactory,
    TrampolineShape,
};
use crate::types::ValueType;
use libsqlite3_sys as ffi;
use std::ffi::{c_int, c_void};
use std::fmt;
use std::ops::BitOr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use tracing::debug;

/// Per-invocation view of a function call: its arguments and result slot.
pub struct CallContext<'a> {
    result_slot: *mut ffi::sqlite3_context,
    args: &'a [*mut ffi::sqlite3_value],
}

impl fmt::Debug for CallContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("result_slot", &self.result_slot)
            .field("arg_count", &self.args.len())
            .finish()
    }
}

impl<'a> CallContext<'a> {
    /// # Safety
    ///
    /// `result_slot` must be a live function context and `argv` must point
    /// to `argc` live values for the lifetime `'a`.
    pub(crate) unsafe fn from_raw(
        result_slot: *mut ffi::sqlite3_context,
        argc: c_int,
        argv: *mut *mut ffi::sqlite3_value,
    ) -> Self {
        let args = if argv.is_null() || argc <= 0 {
            &[][..]
        } else {
            std::slice::from_raw_parts(argv, argc as usize)
        };
        Self { result_slot, args }
    }

    /// Returns the result slot address.
    pub fn result_slot(&self) -> usize {
        self.result_slot as usize
    }

    /// Number of arguments passed to this call.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    fn arg(&self, index: usize) -> BridgeResult<*mut ffi::sqlite3_value> {
        self.args.get(index).copied().ok_or_else(|| {
            BridgeError::invalid_argument(format!(
                "argument index {index} out of range for {} argument(s)",
                self.args.len()
            ))
        })
    }

    /// Storage class of argument `index`.
    pub fn value_type(&self, index: usize) -> BridgeResult<ValueType> {
        let value = self.arg(index)?;
        // SAFETY: value belongs to the current call.
        Ok(ValueType::from_raw(unsafe { ffi::sqlite3_value_type(value) }))
    }

    /// Argument `index` as a 32-bit integer.
    pub fn value_int(&self, index: usize) -> BridgeResult<i32> {
        let value = self.arg(index)?;
        Ok(unsafe { ffi::sqlite3_value_int(value) })
    }

    /// Argument `index` as a 64-bit integer.
    pub fn value_long(&self, index: usize) -> BridgeResult<i64> {
        let value = self.arg(index)?;
        Ok(unsafe { ffi::sqlite3_value_int64(value) })
    }

    /// Argument `index` as a double.
    pub fn value_double(&self, index: usize) -> BridgeResult<f64> {
        let value = self.arg(index)?;
        Ok(unsafe { ffi::sqlite3_value_double(value) })
    }

    /// Byte length of argument `index` in its text or blob form.
    pub fn value_bytes(&self, index: usize) -> BridgeResult<usize> {
        let value = self.arg(index)?;
        Ok(unsafe { ffi::sqlite3_value_bytes(value) }.max(0) as usize)
    }

    /// Argument `index` as text; `None` for SQL NULL.
    pub fn value_text(&self, index: usize) -> BridgeResult<Option<String>> {
        let value = self.arg(index)?;
        // SAFETY: type, then pointer, then length, as the engine requires.
        unsafe {
            if ffi::sqlite3_value_type(value) == ffi::SQLITE_NULL {
                return Ok(None);
            }
            let text = ffi::sqlite3_value_text(value);
            if text.is_null() {
                return Ok(Some(String::new()));
            }
            let len = ffi::sqlite3_value_bytes(value).max(0) as usize;
            let bytes = std::slice::from_raw_parts(text, len);
            Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
        }
    }

    /// Argument `index` as bytes; `None` for SQL NULL, empty for a
    /// zero-length value.
    pub fn value_blob(&self, index: usize) -> BridgeResult<Option<Vec<u8>>> {
        let value = self.arg(index)?;
        unsafe {
            if ffi::sqlite3_value_type(value) == ffi::SQLITE_NULL {
                return Ok(None);
            }
            let blob = ffi::sqlite3_value_blob(value);
            if blob.is_null() {
                return Ok(Some(Vec::new()));
            }
            let len = ffi::sqlite3_value_bytes(value).max(0) as usize;
            Ok(Some(std::slice::from_raw_parts(blob.cast::<u8>(), len).to_vec()))
        }
    }

    /// Sets the result to NULL.
    pub fn result_null(&mut self) {
        unsafe { ffi::sqlite3_result_null(self.result_slot) }
    }

    /// Sets a 32-bit integer result.
    pub fn result_int(&mut self, value: i32) {
        unsafe { ffi::sqlite3_result_int(self.result_slot, value) }
    }

    /// Sets a 64-bit integer result.
    pub fn result_long(&mut self, value: i64) {
        unsafe { ffi::sqlite3_result_int64(self.result_slot, value) }
    }

    /// Sets a double result.
    pub fn result_double(&mut self, value: f64) {
        unsafe { ffi::sqlite3_result_double(self.result_slot, value) }
    }

    /// Sets a text result. The engine copies the bytes.
    pub fn result_text(&mut self, value: &str) {
        let Ok(len) = c_int::try_from(value.len()) else {
            unsafe { ffi::sqlite3_result_error_toobig(self.result_slot) };
            return;
        };
        unsafe {
            ffi::sqlite3_result_text(
                self.result_slot,
                value.as_ptr().cast(),
                len,
                ffi::SQLITE_TRANSIENT(),
            );
        }
    }

    /// Sets a blob result. An empty slice yields a zero-length blob.
    pub fn result_blob(&mut self, value: &[u8]) {
        let Ok(len) = c_int::try_from(value.len()) else {
            unsafe { ffi::sqlite3_result_error_toobig(self.result_slot) };
            return;
        };
        unsafe {
            if len == 0 {
                ffi::sqlite3_result_zeroblob(self.result_slot, 0);
            } else {
                ffi::sqlite3_result_blob(
                    self.result_slot,
                    value.as_ptr().cast(),
                    len,
                    ffi::SQLITE_TRANSIENT(),
                );
            }
        }
    }

    /// Makes the current SQL statement fail with `message`.
    pub fn result_error(&mut self, message: &str) {
        let len = c_int::try_from(message.len()).unwrap_or(c_int::MAX);
        unsafe { ffi::sqlite3_result_error(self.result_slot, message.as_ptr().cast(), len) }
    }
}

/// Body of a scalar function.
pub type ScalarFn = dyn Fn(&mut CallContext<'_>) -> BridgeResult<()> + Send + Sync;

/// Per-group accumulator of an aggregate function.
pub trait Aggregate: Send {
    /// Adds one row.
    fn step(&mut self, ctx: &mut CallContext<'_>) -> BridgeResult<()>;

    /// Emits the group's result. Called once per group, without arguments.
    fn finish(&mut self, ctx: &mut CallContext<'_>) -> BridgeResult<()>;
}

/// Accumulator of an aggregate window function.
pub trait WindowAggregate: Aggregate {
    /// Emits the current value without ending the group.
    fn value(&mut self, ctx: &mut CallContext<'_>) -> BridgeResult<()>;

    /// Removes the contribution of a row leaving the window.
    fn inverse(&mut self, ctx: &mut CallContext<'_>) -> BridgeResult<()>;
}

type AggregateFactory = dyn Fn() -> Box<dyn Aggregate> + Send + Sync;
type WindowFactory = dyn Fn() -> Box<dyn WindowAggregate> + Send + Sync;

/// The three function variants, each carrying only what it can do.
pub enum FunctionKind {
    /// Row-by-row function.
    Scalar(Box<ScalarFn>),
    /// Aggregate; the factory makes one accumulator per group.
    Aggregate(Box<AggregateFactory>),
    /// Aggregate usable as a window function.
    Window(Box<WindowFactory>),
}

impl fmt::Debug for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FunctionKind {
    /// Wraps a scalar body.
    pub fn scalar<F>(body: F) -> Self
    where
        F: Fn(&mut CallContext<'_>) -> BridgeResult<()> + Send + Sync + 'static,
    {
        Self::Scalar(Box::new(body))
    }

    /// Wraps an aggregate accumulator factory.
    pub fn aggregate<A, F>(factory: F) -> Self
    where
        A: Aggregate + 'static,
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::Aggregate(Box::new(move || Box::new(factory()) as Box<dyn Aggregate>))
    }

    /// Wraps a window accumulator factory.
    pub fn window<W, F>(factory: F) -> Self
    where
        W: WindowAggregate + 'static,
        F: Fn() -> W + Send + Sync + 'static,
    {
        Self::Window(Box::new(move || Box::new(factory()) as Box<dyn WindowAggregate>))
    }

    /// Short name of the variant.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Aggregate(_) => "aggregate",
            Self::Window(_) => "window",
        }
    }

    /// Protocols this kind implements.
    pub const fn protocols(&self) -> &'static [Protocol] {
        match self {
            Self::Scalar(_) => &[Protocol::Func],
            Self::Aggregate(_) => &[Protocol::Step, Protocol::Final],
            Self::Window(_) => &[
                Protocol::Step,
                Protocol::Final,
                Protocol::Value,
                Protocol::Inverse,
            ],
        }
    }
}

/// A native function protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Scalar body.
    Func,
    /// Aggregate step.
    Step,
    /// Aggregate final.
    Final,
    /// Window value.
    Value,
    /// Window inverse.
    Inverse,
}

impl Protocol {
    /// Callback method name.
    pub const fn method_name(self) -> &'static str {
        match self {
            Self::Func => "xFunc",
            Self::Step => "xStep",
            Self::Final => "xFinal",
            Self::Value => "xValue",
            Self::Inverse => "xInverse",
        }
    }

    /// Trampoline shape used for this protocol.
    pub const fn shape(self) -> TrampolineShape {
        match self {
            Self::Func => TrampolineShape::Scalar,
            Self::Step => TrampolineShape::Step,
            Self::Final => TrampolineShape::Final,
            Self::Value => TrampolineShape::Value,
            Self::Inverse => TrampolineShape::Inverse,
        }
    }

    fn from_method(name: &str) -> Option<Self> {
        [
            Self::Func,
            Self::Step,
            Self::Final,
            Self::Value,
            Self::Inverse,
        ]
        .into_iter()
        .find(|p| p.method_name() == name)
    }
}

/// Flags combined with the text encoding at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FunctionFlags(i32);

impl FunctionFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Same inputs always give the same output.
    pub const DETERMINISTIC: Self = Self(ffi::SQLITE_DETERMINISTIC);
    /// Only callable from top-level SQL.
    pub const DIRECT_ONLY: Self = Self(ffi::SQLITE_DIRECTONLY);
    /// No side effects.
    pub const INNOCUOUS: Self = Self(ffi::SQLITE_INNOCUOUS);

    /// Returns the raw bits.
    pub const fn bits(self) -> i32 {
        self.0
    }
}

impl BitOr for FunctionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

enum GroupState {
    Aggregate(Box<dyn Aggregate>),
    Window(Box<dyn WindowAggregate>),
}

impl GroupState {
    fn step(&mut self, ctx: &mut CallContext<'_>) -> BridgeResult<()> {
        match self {
            Self::Aggregate(acc) => acc.step(ctx),
            Self::Window(acc) => acc.step(ctx),
        }
    }

    fn finish(&mut self, ctx: &mut CallContext<'_>) -> BridgeResult<()> {
        match self {
            Self::Aggregate(acc) => acc.finish(ctx),
            Self::Window(acc) => acc.finish(ctx),
        }
    }

    fn window(&mut self) -> Option<&mut dyn WindowAggregate> {
        match self {
            Self::Window(acc) => Some(acc.as_mut()),
            Self::Aggregate(_) => None,
        }
    }
}

/// Native entry points for one registered function.
pub(crate) struct FunctionEntries {
    pub trampolines: Vec<Trampoline>,
    pub user_data: *mut c_void,
    pub func: Option<FunctionFn>,
    pub step: Option<FunctionFn>,
    pub final_: Option<FinalFn>,
    pub value: Option<FinalFn>,
    pub inverse: Option<FunctionFn>,
}

/// Callback target implementing the function protocols for one function.
pub struct FunctionDispatcher {
    name: String,
    kind: FunctionKind,
    stats: Arc<BridgeStats>,
}

impl fmt::Debug for FunctionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDispatcher")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl FunctionDispatcher {
    /// Creates a dispatcher for `kind`.
    pub fn new(name: impl Into<String>, kind: FunctionKind, stats: Arc<BridgeStats>) -> Self {
        Self {
            name: name.into(),
            kind,
            stats,
        }
    }

    /// Function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wrapped kind.
    pub fn kind(&self) -> &FunctionKind {
        &self.kind
    }

    /// Builds the trampoline for one protocol.
    ///
    /// Fails with [`BridgeError::UnsupportedFunctionKind`] if the wrapped
    /// kind does not implement `protocol`.
    pub fn trampoline(
        self: &Arc<Self>,
        protocol: Protocol,
        factory: &TrampolineFactory,
    ) -> BridgeResult<Trampoline> {
        if !self.kind.protocols().contains(&protocol) {
            return Err(BridgeError::UnsupportedFunctionKind {
                name: self.name.clone(),
                protocol: protocol.method_name(),
            });
        }
        let target: Arc<dyn CallbackTarget> = self.clone();
        factory.create(target, protocol.method_name(), protocol.shape())
    }

    /// Builds every trampoline the kind needs plus the shared function table.
    pub(crate) fn entries(self: &Arc<Self>, factory: &TrampolineFactory) -> BridgeResult<FunctionEntries> {
        let trampolines = self
            .kind
            .protocols()
            .iter()
            .map(|protocol| self.trampoline(*protocol, factory))
            .collect::<BridgeResult<Vec<_>>>()?;

        let find = |shape: TrampolineShape| trampolines.iter().find(|t| t.shape() == shape);
        let func = find(TrampolineShape::Scalar).and_then(Trampoline::function_fn);
        let step = find(TrampolineShape::Step).and_then(Trampoline::function_fn);
        let final_ = find(TrampolineShape::Final).and_then(Trampoline::final_fn);
        let value = find(TrampolineShape::Value).and_then(Trampoline::final_fn);
        let inverse = find(TrampolineShape::Inverse).and_then(Trampoline::function_fn);
        let user_data = factory.function_table(&trampolines);

        Ok(FunctionEntries {
            trampolines,
            user_data,
            func,
            step,
            final_,
            value,
            inverse,
        })
    }

    fn new_group(&self, protocol: Protocol) -> BridgeResult<GroupState> {
        match &self.kind {
            FunctionKind::Aggregate(factory) => Ok(GroupState::Aggregate(factory())),
            FunctionKind::Window(factory) => Ok(GroupState::Window(factory())),
            FunctionKind::Scalar(_) => Err(BridgeError::UnsupportedFunctionKind {
                name: self.name.clone(),
                protocol: protocol.method_name(),
            }),
        }
    }

    /// Returns this group's accumulator, creating it on first use.
    ///
    /// # Safety
    ///
    /// `ctx` must be the live aggregate context of the current call.
    unsafe fn group<'g>(
        &self,
        ctx: *mut ffi::sqlite3_context,
        protocol: Protocol,
    ) -> BridgeResult<&'g mut GroupState> {
        let size = std::mem::size_of::<*mut GroupState>() as c_int;
        let slot = ffi::sqlite3_aggregate_context(ctx, size).cast::<*mut GroupState>();
        if slot.is_null() {
            return Err(BridgeError::native(ResultCode::NoMem));
        }
        if (*slot).is_null() {
            *slot = Box::into_raw(Box::new(self.new_group(protocol)?));
        }
        Ok(&mut **slot)
    }

    /// Removes this group's accumulator, or makes a fresh one for a group
    /// that saw no rows.
    ///
    /// # Safety
    ///
    /// `ctx` must be the live aggregate context of the current call.
    unsafe fn take_group(&self, ctx: *mut ffi::sqlite3_context) -> BridgeResult<GroupState> {
        let slot = ffi::sqlite3_aggregate_context(ctx, 0).cast::<*mut GroupState>();
        if slot.is_null() || (*slot).is_null() {
            return self.new_group(Protocol::Final);
        }
        let state = Box::from_raw(*slot);
        *slot = ptr::null_mut();
        Ok(*state)
    }

    fn dispatch(&self, protocol: Protocol, call: &mut CallContext<'_>) -> BridgeResult<()> {
        let ctx = call.result_slot;
        match protocol {
            Protocol::Func => match &self.kind {
                FunctionKind::Scalar(body) => body(call),
                _ => Err(BridgeError::UnsupportedFunctionKind {
                    name: self.name.clone(),
                    protocol: protocol.method_name(),
                }),
            },
            // SAFETY: ctx is the context of the call being dispatched.
            Protocol::Step => unsafe { self.group(ctx, protocol) }?.step(call),
            Protocol::Final => unsafe { self.take_group(ctx) }?.finish(call),
            Protocol::Value | Protocol::Inverse => {
                let group = unsafe { self.group(ctx, protocol) }?;
                let window = group.window().ok_or_else(|| BridgeError::UnsupportedFunctionKind {
                    name: self.name.clone(),
                    protocol: protocol.method_name(),
                })?;
                if protocol == Protocol::Value {
                    window.value(call)
                } else {
                    window.inverse(call)
                }
            }
        }
    }
}

impl CallbackTarget for FunctionDispatcher {
    fn callback_methods(&self) -> Vec<CallbackMethod> {
        self.kind
            .protocols()
            .iter()
            .map(|protocol| CallbackMethod {
                name: protocol.method_name(),
                signature: protocol.shape().descriptor(),
            })
            .collect()
    }

    fn invoke(&self, method: &str, args: &[AbiValue]) -> AbiValue {
        let Some(protocol) = Protocol::from_method(method) else {
            return AbiValue::Void;
        };
        let ctx = args
            .first()
            .and_then(|a| a.as_address())
            .unwrap_or_default() as *mut ffi::sqlite3_context;
        if ctx.is_null() {
            return AbiValue::Void;
        }
        let argc = args.get(1).and_then(|a| a.as_i32()).unwrap_or_default();
        let argv = args
            .get(2)
            .and_then(|a| a.as_address())
            .unwrap_or_default() as *mut *mut ffi::sqlite3_value;

        self.stats.record_callback();
        // SAFETY: arguments come straight from the engine for this call.
        let mut call = unsafe { CallContext::from_raw(ctx, argc, argv) };

        let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(protocol, &mut call)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("panic in function {}", self.name)),
        };
        if let Some(message) = failure {
            self.stats.record_callback_failure();
            debug!(function = %self.name, protocol = method, error = %message, "function failed");
            call.result_error(&message);
        }
        AbiValue::Void
    }

    fn target_name(&self) -> &'static str {
        "FunctionDispatcher"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trampoline::TrampolineArena;

    struct Sum(i64);

    impl Aggregate for Sum {
        fn step(&mut self, ctx: &mut CallContext<'_>) -> BridgeResult<()> {
            self.0 += ctx.value_long(0)?;
            Ok(())
        }

        fn finish(&mut self, ctx: &mut CallContext<'_>) -> BridgeResult<()> {
            ctx.result_long(self.0);
            Ok(())
        }
    }

    fn dispatcher(kind: FunctionKind) -> Arc<FunctionDispatcher> {
        Arc::new(FunctionDispatcher::new("f", kind, Arc::new(BridgeStats::new())))
    }

    fn factory() -> TrampolineFactory {
        TrampolineFactory::new(Arc::new(TrampolineArena::new()))
    }

    #[test]
    fn kinds_expose_their_protocols() {
        let scalar = FunctionKind::scalar(|_| Ok(()));
        assert_eq!(scalar.protocols(), &[Protocol::Func]);

        let aggregate = FunctionKind::aggregate(|| Sum(0));
        assert_eq!(aggregate.protocols(), &[Protocol::Step, Protocol::Final]);
        assert_eq!(aggregate.name(), "aggregate");
    }

    #[test]
    fn scalar_has_no_window_protocol() {
        let d = dispatcher(FunctionKind::scalar(|_| Ok(())));
        let err = d.trampoline(Protocol::Value, &factory()).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::UnsupportedFunctionKind { protocol: "xValue", .. }
        ));
        assert!(err.is_usage_error());
    }

    #[test]
    fn aggregate_has_no_inverse() {
        let d = dispatcher(FunctionKind::aggregate(|| Sum(0)));
        let err = d.trampoline(Protocol::Inverse, &factory()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "function f does not support the xInverse protocol"
        );
        assert!(d.trampoline(Protocol::Step, &factory()).is_ok());
    }

    #[test]
    fn entries_match_kind() {
        let f = factory();
        let d = dispatcher(FunctionKind::aggregate(|| Sum(0)));
        let entries = d.entries(&f).unwrap();
        assert!(entries.func.is_none());
        assert!(entries.step.is_some());
        assert!(entries.final_.is_some());
        assert!(entries.value.is_none());
        assert!(!entries.user_data.is_null());
        // two bindings plus the function table
        assert_eq!(f.arena().len(), 3);
    }

    #[test]
    fn methods_follow_shapes() {
        let d = dispatcher(FunctionKind::scalar(|_| Ok(())));
        let methods = d.callback_methods();
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].name, "xFunc");
        assert_eq!(methods[0].signature, TrampolineShape::Scalar.descriptor());
    }

    #[test]
    fn flags_combine() {
        let flags = FunctionFlags::DETERMINISTIC | FunctionFlags::INNOCUOUS;
        assert_eq!(
            flags.bits(),
            ffi::SQLITE_DETERMINISTIC | ffi::SQLITE_INNOCUOUS
        );
        assert_eq!(FunctionFlags::default(), FunctionFlags::NONE);
    }
}
