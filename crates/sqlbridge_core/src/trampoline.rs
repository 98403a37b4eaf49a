//! Trampoline factory.
//!
//! A trampoline is a native-callable function pointer bound to a callback
//! object. The set of native entry shapes is closed: every shape the engine
//! can call ([`TrampolineShape`]) has exactly one `extern "C"` entry function
//! with a fixed ABI signature. [`TrampolineFactory::create`] resolves a method
//! by name on a [`CallbackTarget`], checks that its declared signature is
//! native-representable and equal to the shape's, and binds the pair into an
//! arena-owned binding whose address is handed to the engine as user data.
//!
//! # Lifetime
//!
//! Bindings are retained by a [`TrampolineArena`] and only released when the
//! arena is released, which the connection does after the native handle is
//! closed. Each entry function also pins its binding for the duration of a
//! call, so replacing a registration from inside a callback cannot free the
//! binding that is currently executing.

use crate::error::{BridgeError, BridgeResult};
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use std::any::Any;
use std::ffi::{c_char, c_int, c_void};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tracing::error;

/// A declared parameter or return type of a callback method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    /// No value (return position only).
    Void,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Opaque native pointer.
    Pointer,
    /// Any type that has no native representation, by name.
    Other(&'static str),
}

impl NativeType {
    /// Returns true if the type can cross the native boundary.
    pub const fn is_native(self) -> bool {
        !matches!(self, Self::Other(_))
    }

    fn label(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Pointer => "ptr",
            Self::Other(name) => name,
        }
    }
}

/// Ordered parameter layouts plus return layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiDescriptor {
    /// Parameter types in call order.
    pub params: Vec<NativeType>,
    /// Return type (`Void` for none).
    pub ret: NativeType,
}

impl AbiDescriptor {
    /// Creates a descriptor.
    pub fn new(params: &[NativeType], ret: NativeType) -> Self {
        Self {
            params: params.to_vec(),
            ret,
        }
    }
}

impl fmt::Display for AbiDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<&str> = self.params.iter().map(|p| p.label()).collect();
        write!(f, "({}) -> {}", params.join(", "), self.ret.label())
    }
}

/// A callback method exposed by a [`CallbackTarget`].
#[derive(Debug, Clone)]
pub struct CallbackMethod {
    /// Method name used for lookup.
    pub name: &'static str,
    /// Declared signature.
    pub signature: AbiDescriptor,
}

impl CallbackMethod {
    /// Declares a method.
    pub fn new(name: &'static str, params: &[NativeType], ret: NativeType) -> Self {
        Self {
            name,
            signature: AbiDescriptor::new(params, ret),
        }
    }
}

/// A value crossing the boundary in either direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbiValue {
    /// No value.
    Void,
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Native address.
    Pointer(usize),
}

impl AbiValue {
    /// Returns the value as `i32`, if it is one.
    pub fn as_i32(self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the value as `i64`, if it is one.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the value as an address, if it is one.
    pub fn as_address(self) -> Option<usize> {
        match self {
            Self::Pointer(v) => Some(v),
            _ => None,
        }
    }
}

/// An object that can be bound into trampolines.
///
/// `callback_methods` plays the role of the type's method table; `invoke`
/// is called from native code with arguments already marshalled according
/// to the declared signature. `invoke` must not fail: anything that goes
/// wrong has to be expressed through the return value or the engine's own
/// error channel.
pub trait CallbackTarget: Send + Sync + 'static {
    /// Lists the methods that may be bound.
    fn callback_methods(&self) -> Vec<CallbackMethod>;

    /// Invokes `method` with native arguments.
    fn invoke(&self, method: &str, args: &[AbiValue]) -> AbiValue;

    /// Name used in error messages.
    fn target_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The closed set of native callback shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrampolineShape {
    /// Scalar function body: `(ctx, argc, argv) -> void`.
    Scalar,
    /// Aggregate step: `(ctx, argc, argv) -> void`.
    Step,
    /// Aggregate final: `(ctx) -> void`.
    Final,
    /// Window value: `(ctx) -> void`.
    Value,
    /// Window inverse: `(ctx, argc, argv) -> void`.
    Inverse,
    /// Busy handler: `(data, attempts) -> i32`.
    Busy,
    /// Progress handler: `(data) -> i32`.
    Progress,
    /// Commit hook: `(data) -> i32`.
    Commit,
    /// Rollback hook: `(data) -> void`.
    Rollback,
    /// Update hook: `(data, op, db, table, rowid) -> void`.
    Update,
    /// Collation: `(data, len1, str1, len2, str2) -> i32`.
    Collation,
}

use NativeType::{Pointer, Void, I32, I64};

const FUNCTION_PARAMS: &[NativeType] = &[Pointer, I32, Pointer];
const CONTEXT_ONLY: &[NativeType] = &[Pointer];

impl TrampolineShape {
    /// Returns the fixed ABI descriptor of this shape.
    pub fn descriptor(self) -> AbiDescriptor {
        match self {
            Self::Scalar | Self::Step | Self::Inverse => AbiDescriptor::new(FUNCTION_PARAMS, Void),
            Self::Final | Self::Value => AbiDescriptor::new(CONTEXT_ONLY, Void),
            Self::Busy => AbiDescriptor::new(&[Pointer, I32], I32),
            Self::Progress | Self::Commit => AbiDescriptor::new(CONTEXT_ONLY, I32),
            Self::Rollback => AbiDescriptor::new(CONTEXT_ONLY, Void),
            Self::Update => AbiDescriptor::new(&[Pointer, I32, Pointer, Pointer, I64], Void),
            Self::Collation => AbiDescriptor::new(&[Pointer, I32, Pointer, I32, Pointer], I32),
        }
    }

    /// Returns true for the user-function protocols.
    ///
    /// Function shapes find their binding through the function table passed
    /// as the engine's per-function user data rather than through a direct
    /// data pointer.
    pub const fn is_function(self) -> bool {
        matches!(
            self,
            Self::Scalar | Self::Step | Self::Final | Self::Value | Self::Inverse
        )
    }

    const fn slot(self) -> usize {
        match self {
            Self::Scalar => 0,
            Self::Step => 1,
            Self::Final => 2,
            Self::Value => 3,
            Self::Inverse => 4,
            _ => usize::MAX,
        }
    }

    /// Value returned to the engine when the bound callback panics or
    /// returns a value of the wrong type.
    const fn fallback(self) -> c_int {
        match self {
            // stop waiting / interrupt
            Self::Busy => 0,
            Self::Progress => 1,
            _ => 0,
        }
    }

    fn entry(self) -> EntryPoint {
        match self {
            Self::Scalar => EntryPoint::Function(function_entry::<0>),
            Self::Step => EntryPoint::Function(function_entry::<1>),
            Self::Inverse => EntryPoint::Function(function_entry::<4>),
            Self::Final => EntryPoint::Final(final_entry::<2>),
            Self::Value => EntryPoint::Final(final_entry::<3>),
            Self::Busy => EntryPoint::Busy(busy_entry),
            Self::Progress => EntryPoint::Notify(progress_entry),
            Self::Commit => EntryPoint::Notify(commit_entry),
            Self::Rollback => EntryPoint::Rollback(rollback_entry),
            Self::Update => EntryPoint::Update(update_entry),
            Self::Collation => EntryPoint::Collation(collation_entry),
        }
    }
}

pub(crate) type FunctionFn =
    unsafe extern "C" fn(*mut ffi::sqlite3_context, c_int, *mut *mut ffi::sqlite3_value);
pub(crate) type FinalFn = unsafe extern "C" fn(*mut ffi::sqlite3_context);
pub(crate) type BusyFn = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
pub(crate) type NotifyFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub(crate) type RollbackFn = unsafe extern "C" fn(*mut c_void);
pub(crate) type UpdateFn =
    unsafe extern "C" fn(*mut c_void, c_int, *const c_char, *const c_char, ffi::sqlite3_int64);
pub(crate) type CollationFn =
    unsafe extern "C" fn(*mut c_void, c_int, *const c_void, c_int, *const c_void) -> c_int;

#[derive(Clone, Copy)]
enum EntryPoint {
    Function(FunctionFn),
    Final(FinalFn),
    Busy(BusyFn),
    Notify(NotifyFn),
    Rollback(RollbackFn),
    Update(UpdateFn),
    Collation(CollationFn),
}

impl EntryPoint {
    fn address(self) -> usize {
        match self {
            Self::Function(f) => f as usize,
            Self::Final(f) => f as usize,
            Self::Busy(f) => f as usize,
            Self::Notify(f) => f as usize,
            Self::Rollback(f) => f as usize,
            Self::Update(f) => f as usize,
            Self::Collation(f) => f as usize,
        }
    }
}

/// A (target, method) pair bound for native invocation.
pub(crate) struct Binding {
    target: Arc<dyn CallbackTarget>,
    method: &'static str,
    shape: TrampolineShape,
}

impl Binding {
    fn call(&self, args: &[AbiValue]) -> Option<AbiValue> {
        catch_unwind(AssertUnwindSafe(|| self.target.invoke(self.method, args))).ok()
    }

    fn call_int(&self, args: &[AbiValue]) -> c_int {
        match self.call(args).and_then(AbiValue::as_i32) {
            Some(v) => v,
            None => {
                error!(
                    method = self.method,
                    target = self.target.target_name(),
                    "callback panicked or returned a mistyped value"
                );
                self.shape.fallback()
            }
        }
    }

    fn call_void(&self, args: &[AbiValue]) {
        if self.call(args).is_none() {
            error!(
                method = self.method,
                target = self.target.target_name(),
                "callback panicked"
            );
        }
    }
}

/// A native-callable address bound to a callback.
#[derive(Clone)]
pub struct Trampoline {
    entry: EntryPoint,
    binding: Arc<Binding>,
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("shape", &self.binding.shape)
            .field("method", &self.binding.method)
            .field("address", &format_args!("{:#x}", self.address()))
            .finish()
    }
}

impl Trampoline {
    /// Returns the shape of this trampoline.
    pub fn shape(&self) -> TrampolineShape {
        self.binding.shape
    }

    /// Returns the name of the bound method.
    pub fn method(&self) -> &'static str {
        self.binding.method
    }

    /// Returns the native entry address.
    pub fn address(&self) -> usize {
        self.entry.address()
    }

    /// Returns the data pointer the engine passes back to the entry.
    pub fn user_data(&self) -> *mut c_void {
        Arc::as_ptr(&self.binding).cast_mut().cast()
    }

    pub(crate) fn function_fn(&self) -> Option<FunctionFn> {
        match self.entry {
            EntryPoint::Function(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn final_fn(&self) -> Option<FinalFn> {
        match self.entry {
            EntryPoint::Final(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn busy_fn(&self) -> Option<BusyFn> {
        match self.entry {
            EntryPoint::Busy(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn notify_fn(&self) -> Option<NotifyFn> {
        match self.entry {
            EntryPoint::Notify(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn rollback_fn(&self) -> Option<RollbackFn> {
        match self.entry {
            EntryPoint::Rollback(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn update_fn(&self) -> Option<UpdateFn> {
        match self.entry {
            EntryPoint::Update(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn collation_fn(&self) -> Option<CollationFn> {
        match self.entry {
            EntryPoint::Collation(f) => Some(f),
            _ => None,
        }
    }
}

/// Per-function user data: one binding slot per function protocol.
pub(crate) struct FunctionTable {
    slots: [Option<Arc<Binding>>; 5],
}

impl FunctionTable {
    fn binding(&self, slot: usize) -> Option<Arc<Binding>> {
        self.slots.get(slot).and_then(Clone::clone)
    }
}

/// Owner of every binding handed to the engine.
///
/// Nothing in the arena is released until [`TrampolineArena::release`] is
/// called (or the arena is dropped).
#[derive(Default)]
pub struct TrampolineArena {
    entries: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for TrampolineArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrampolineArena")
            .field("entries", &self.len())
            .finish()
    }
}

impl TrampolineArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-lifetime arena. It is never released.
    pub fn process() -> Arc<TrampolineArena> {
        static PROCESS: OnceLock<Arc<TrampolineArena>> = OnceLock::new();
        Arc::clone(PROCESS.get_or_init(|| Arc::new(TrampolineArena::new())))
    }

    fn retain(&self, entry: Arc<dyn Any + Send + Sync>) {
        self.entries.lock().push(entry);
    }

    /// Number of retained bindings and tables.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases every retained binding.
    ///
    /// Only call once the engine can no longer reach any of them.
    pub fn release(&self) -> usize {
        let released = std::mem::take(&mut *self.entries.lock());
        released.len()
    }
}

/// Builds trampolines into an arena.
#[derive(Debug, Clone)]
pub struct TrampolineFactory {
    arena: Arc<TrampolineArena>,
}

impl TrampolineFactory {
    /// Creates a factory whose trampolines live as long as `arena`.
    pub fn new(arena: Arc<TrampolineArena>) -> Self {
        Self { arena }
    }

    /// Creates a factory bound to the process-lifetime arena.
    pub fn process() -> Self {
        Self::new(TrampolineArena::process())
    }

    /// Returns the owning arena.
    pub fn arena(&self) -> &Arc<TrampolineArena> {
        &self.arena
    }

    /// Binds `method` of `target` into a trampoline of the given shape.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::CallbackNotFound`] if no method has that name
    /// - [`BridgeError::AmbiguousCallback`] if several do
    /// - [`BridgeError::UnsupportedCallbackSignature`] if a parameter or the
    ///   return type is not native-representable, or the signature differs
    ///   from the shape's fixed descriptor
    pub fn create(
        &self,
        target: Arc<dyn CallbackTarget>,
        method: &str,
        shape: TrampolineShape,
    ) -> BridgeResult<Trampoline> {
        let resolved = resolve_method(target.as_ref(), method)?;
        validate_signature(&resolved, shape)?;

        let binding = Arc::new(Binding {
            target,
            method: resolved.name,
            shape,
        });
        self.arena.retain(binding.clone());

        Ok(Trampoline {
            entry: shape.entry(),
            binding,
        })
    }

    /// Packs function-protocol trampolines into the engine's per-function
    /// user data. Returns the pointer to pass as the function's user data.
    pub(crate) fn function_table(&self, trampolines: &[Trampoline]) -> *mut c_void {
        let mut slots: [Option<Arc<Binding>>; 5] = Default::default();
        for trampoline in trampolines {
            let slot = trampoline.shape().slot();
            if slot < slots.len() {
                slots[slot] = Some(trampoline.binding.clone());
            }
        }
        let table = Arc::new(FunctionTable { slots });
        let data = Arc::as_ptr(&table).cast_mut().cast();
        self.arena.retain(table);
        data
    }
}

fn resolve_method(target: &dyn CallbackTarget, method: &str) -> BridgeResult<CallbackMethod> {
    let mut matches = target
        .callback_methods()
        .into_iter()
        .filter(|m| m.name == method);

    match (matches.next(), matches.next()) {
        (None, _) => Err(BridgeError::CallbackNotFound {
            method: method.to_string(),
            target: target.target_name(),
        }),
        (Some(_), Some(_)) => Err(BridgeError::AmbiguousCallback {
            method: method.to_string(),
            target: target.target_name(),
        }),
        (Some(found), None) => Ok(found),
    }
}

fn validate_signature(method: &CallbackMethod, shape: TrampolineShape) -> BridgeResult<()> {
    let signature = &method.signature;

    if let Some((index, param)) = signature
        .params
        .iter()
        .enumerate()
        .find(|(_, p)| !p.is_native() || **p == NativeType::Void)
    {
        return Err(BridgeError::unsupported_signature(
            method.name,
            format!(
                "parameter {index} must be a primitive or pointer, not {}",
                param.label()
            ),
        ));
    }

    if !signature.ret.is_native() {
        return Err(BridgeError::unsupported_signature(
            method.name,
            format!(
                "return type must be void, a primitive or a pointer, not {}",
                signature.ret.label()
            ),
        ));
    }

    let expected = shape.descriptor();
    if *signature != expected {
        return Err(BridgeError::unsupported_signature(
            method.name,
            format!("{shape:?} trampolines require {expected}, found {signature}"),
        ));
    }

    Ok(())
}

/// Pins the binding behind `data` for the duration of one native call.
///
/// # Safety
///
/// `data` must come from [`Trampoline::user_data`] of a binding that is
/// still retained by its arena.
unsafe fn pin_binding(data: *mut c_void) -> Option<Arc<Binding>> {
    if data.is_null() {
        return None;
    }
    let ptr = data as *const Binding;
    Arc::increment_strong_count(ptr);
    Some(Arc::from_raw(ptr))
}

/// Pins the function table behind the context's user data and returns the
/// binding for `slot`.
///
/// # Safety
///
/// `ctx` must be a live function context whose user data was produced by
/// [`TrampolineFactory::function_table`].
unsafe fn function_binding(ctx: *mut ffi::sqlite3_context, slot: usize) -> Option<Arc<Binding>> {
    let data = ffi::sqlite3_user_data(ctx) as *const FunctionTable;
    if data.is_null() {
        return None;
    }
    Arc::increment_strong_count(data);
    let table = Arc::from_raw(data);
    table.binding(slot)
}

unsafe fn report_missing(ctx: *mut ffi::sqlite3_context) {
    const MSG: &str = "function protocol is not registered";
    ffi::sqlite3_result_error(ctx, MSG.as_ptr().cast(), MSG.len() as c_int);
}

unsafe fn report_panic(ctx: *mut ffi::sqlite3_context, binding: &Binding) {
    let msg = format!("panic in callback {}", binding.method);
    ffi::sqlite3_result_error(ctx, msg.as_ptr().cast(), msg.len() as c_int);
}

unsafe extern "C" fn function_entry<const SLOT: usize>(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let Some(binding) = function_binding(ctx, SLOT) else {
        report_missing(ctx);
        return;
    };
    let args = [
        AbiValue::Pointer(ctx as usize),
        AbiValue::I32(argc),
        AbiValue::Pointer(argv as usize),
    ];
    if binding.call(&args).is_none() {
        report_panic(ctx, &binding);
    }
}

unsafe extern "C" fn final_entry<const SLOT: usize>(ctx: *mut ffi::sqlite3_context) {
    let Some(binding) = function_binding(ctx, SLOT) else {
        report_missing(ctx);
        return;
    };
    if binding.call(&[AbiValue::Pointer(ctx as usize)]).is_none() {
        report_panic(ctx, &binding);
    }
}

unsafe extern "C" fn busy_entry(data: *mut c_void, attempts: c_int) -> c_int {
    match pin_binding(data) {
        Some(binding) => {
            binding.call_int(&[AbiValue::Pointer(data as usize), AbiValue::I32(attempts)])
        }
        None => TrampolineShape::Busy.fallback(),
    }
}

unsafe extern "C" fn progress_entry(data: *mut c_void) -> c_int {
    match pin_binding(data) {
        Some(binding) => binding.call_int(&[AbiValue::Pointer(data as usize)]),
        None => TrampolineShape::Progress.fallback(),
    }
}

unsafe extern "C" fn commit_entry(data: *mut c_void) -> c_int {
    match pin_binding(data) {
        Some(binding) => binding.call_int(&[AbiValue::Pointer(data as usize)]),
        None => TrampolineShape::Commit.fallback(),
    }
}

unsafe extern "C" fn rollback_entry(data: *mut c_void) {
    if let Some(binding) = pin_binding(data) {
        binding.call_void(&[AbiValue::Pointer(data as usize)]);
    }
}

unsafe extern "C" fn update_entry(
    data: *mut c_void,
    op: c_int,
    db_name: *const c_char,
    table_name: *const c_char,
    row_id: ffi::sqlite3_int64,
) {
    if let Some(binding) = pin_binding(data) {
        binding.call_void(&[
            AbiValue::Pointer(data as usize),
            AbiValue::I32(op),
            AbiValue::Pointer(db_name as usize),
            AbiValue::Pointer(table_name as usize),
            AbiValue::I64(row_id),
        ]);
    }
}

unsafe extern "C" fn collation_entry(
    data: *mut c_void,
    len1: c_int,
    str1: *const c_void,
    len2: c_int,
    str2: *const c_void,
) -> c_int {
    match pin_binding(data) {
        Some(binding) => binding.call_int(&[
            AbiValue::Pointer(data as usize),
            AbiValue::I32(len1),
            AbiValue::Pointer(str1 as usize),
            AbiValue::I32(len2),
            AbiValue::Pointer(str2 as usize),
        ]),
        None => TrampolineShape::Collation.fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct Counter {
        last: AtomicI32,
    }

    impl CallbackTarget for Counter {
        fn callback_methods(&self) -> Vec<CallbackMethod> {
            vec![
                CallbackMethod::new("busy", &[Pointer, I32], I32),
                CallbackMethod::new("twice", &[Pointer], I32),
                CallbackMethod::new("twice", &[Pointer, I32], I32),
                CallbackMethod::new("text", &[Pointer, NativeType::Other("String")], I32),
                CallbackMethod::new("returns_vec", &[Pointer], NativeType::Other("Vec<u8>")),
                CallbackMethod::new("wrong_shape", &[Pointer, I64], I32),
                CallbackMethod::new("panics", &[Pointer, I32], I32),
            ]
        }

        fn invoke(&self, method: &str, args: &[AbiValue]) -> AbiValue {
            match method {
                "busy" => {
                    let attempts = args[1].as_i32().unwrap_or(-1);
                    self.last.store(attempts, Ordering::SeqCst);
                    AbiValue::I32(i32::from(attempts < 3))
                }
                "panics" => panic!("boom"),
                _ => AbiValue::Void,
            }
        }

        fn target_name(&self) -> &'static str {
            "Counter"
        }
    }

    fn counter() -> Arc<Counter> {
        Arc::new(Counter {
            last: AtomicI32::new(-1),
        })
    }

    #[test]
    fn missing_method() {
        let factory = TrampolineFactory::new(Arc::new(TrampolineArena::new()));
        let err = factory
            .create(counter(), "nope", TrampolineShape::Busy)
            .unwrap_err();
        assert!(matches!(err, BridgeError::CallbackNotFound { .. }));
        assert_eq!(err.to_string(), "could not find method nope in Counter");
    }

    #[test]
    fn overloaded_method() {
        let factory = TrampolineFactory::new(Arc::new(TrampolineArena::new()));
        let err = factory
            .create(counter(), "twice", TrampolineShape::Busy)
            .unwrap_err();
        assert!(matches!(err, BridgeError::AmbiguousCallback { .. }));
    }

    #[test]
    fn non_native_types_rejected() {
        let factory = TrampolineFactory::new(Arc::new(TrampolineArena::new()));

        let err = factory
            .create(counter(), "text", TrampolineShape::Busy)
            .unwrap_err();
        assert!(err.to_string().contains("not String"));

        let err = factory
            .create(counter(), "returns_vec", TrampolineShape::Progress)
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedCallbackSignature { .. }));
    }

    #[test]
    fn shape_mismatch_rejected() {
        let factory = TrampolineFactory::new(Arc::new(TrampolineArena::new()));
        let err = factory
            .create(counter(), "wrong_shape", TrampolineShape::Busy)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported callback signature for wrong_shape: \
             Busy trampolines require (ptr, i32) -> i32, found (ptr, i64) -> i32"
        );
    }

    #[test]
    fn busy_trampoline_dispatches() {
        let arena = Arc::new(TrampolineArena::new());
        let factory = TrampolineFactory::new(Arc::clone(&arena));
        let target = counter();

        let trampoline = factory
            .create(target.clone(), "busy", TrampolineShape::Busy)
            .unwrap();
        assert_eq!(trampoline.shape(), TrampolineShape::Busy);
        assert_ne!(trampoline.address(), 0);
        assert_eq!(arena.len(), 1);

        let entry = trampoline.busy_fn().unwrap();
        let retry = unsafe { entry(trampoline.user_data(), 1) };
        assert_eq!(retry, 1);
        assert_eq!(target.last.load(Ordering::SeqCst), 1);

        let retry = unsafe { entry(trampoline.user_data(), 5) };
        assert_eq!(retry, 0);
    }

    #[test]
    fn panic_is_contained() {
        let factory = TrampolineFactory::new(Arc::new(TrampolineArena::new()));
        let trampoline = factory
            .create(counter(), "panics", TrampolineShape::Busy)
            .unwrap();
        let entry = trampoline.busy_fn().unwrap();
        let result = unsafe { entry(trampoline.user_data(), 0) };
        assert_eq!(result, TrampolineShape::Busy.fallback());
    }

    #[test]
    fn binding_survives_release_while_pinned() {
        let arena = Arc::new(TrampolineArena::new());
        let factory = TrampolineFactory::new(Arc::clone(&arena));
        let trampoline = factory
            .create(counter(), "busy", TrampolineShape::Busy)
            .unwrap();

        let pinned = unsafe { pin_binding(trampoline.user_data()) }.unwrap();
        assert_eq!(arena.release(), 1);
        drop(trampoline);

        // the pin alone keeps the binding alive
        assert_eq!(pinned.call_int(&[AbiValue::Pointer(0), AbiValue::I32(0)]), 1);
    }

    #[test]
    fn descriptors_are_fixed() {
        assert_eq!(
            TrampolineShape::Update.descriptor().to_string(),
            "(ptr, i32, ptr, ptr, i64) -> void"
        );
        assert_eq!(
            TrampolineShape::Final.descriptor(),
            TrampolineShape::Value.descriptor()
        );
        assert!(TrampolineShape::Inverse.is_function());
        assert!(!TrampolineShape::Collation.is_function());
    }
}
