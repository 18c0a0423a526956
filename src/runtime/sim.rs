//! In-memory foreign heap for tests.
//!
//! `SimHeap` is the shared heap (objects, references, types, callables);
//! `SimEnv` is one thread's view of it, with its own reference frames and
//! pending-exception slot. References are handed out as fresh tokens, so two
//! references to one object compare unequal, and popping a frame really
//! kills the references in it.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::abi::{BridgeValue, ContextId, ForeignRef, Object, Ref, binary_name};
use super::dispatch::CallSite;
use super::env::{CallableId, ForeignEnv};
use super::exception::{ExceptionHelper, HELPER_TYPE};
use super::frames::{StackFrame, decode_stack, encode_stack};

pub const DEFAULT_CONTEXT: ContextId = ContextId(1);

/// Class of exceptions made by the `createException` helper.
pub const CREATED_EXCEPTION: &str = "tscl.bridge.ForeignBridgeException";

type CallableBody = dyn Fn(&SimEnv, ForeignRef, &[BridgeValue]) -> BridgeValue + Send + Sync;

#[derive(Debug, Clone)]
enum Body {
    Plain,
    Class,
    Str(String),
    StrArray(Vec<String>),
    Throwable {
        message: Option<String>,
        stack: Vec<String>,
    },
}

#[derive(Debug, Clone)]
struct SimObject {
    class: String,
    body: Body,
}

#[derive(Debug, Clone, Copy)]
struct RefEntry {
    object: usize,
    durable: bool,
}

struct SimCallable {
    owner: usize,
    name: String,
    signature: String,
    body: Arc<CallableBody>,
}

struct HeapState {
    objects: Vec<SimObject>,
    refs: HashMap<usize, RefEntry>,
    next_ref: usize,
    types: HashMap<String, usize>,
    callables: Vec<SimCallable>,
    raise_on_missing: bool,
    find_type_delay: Option<Duration>,
    failing: HashSet<String>,
    find_type_calls: HashMap<String, usize>,
    find_callable_calls: usize,
    invocations: HashMap<String, usize>,
    deleted_durables: usize,
}

impl HeapState {
    fn alloc_object(&mut self, class: &str, body: Body) -> usize {
        self.objects.push(SimObject {
            class: class.to_string(),
            body,
        });
        self.objects.len() - 1
    }

    fn alloc_ref(&mut self, object: usize, durable: bool) -> ForeignRef {
        let token = self.next_ref;
        self.next_ref += 8;
        self.refs.insert(token, RefEntry { object, durable });
        ForeignRef::from_usize(token)
    }

    fn object_of(&self, reference: ForeignRef) -> usize {
        match self.refs.get(&reference.as_usize()) {
            Some(entry) => entry.object,
            None => panic!("use of dead or unknown reference {reference:?}"),
        }
    }
}

pub struct SimHeap {
    state: Mutex<HeapState>,
}

impl SimHeap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HeapState {
                objects: Vec::new(),
                refs: HashMap::new(),
                next_ref: 0x1000,
                types: HashMap::new(),
                callables: Vec::new(),
                raise_on_missing: true,
                find_type_delay: None,
                failing: HashSet::new(),
                find_type_calls: HashMap::new(),
                find_callable_calls: 0,
                invocations: HashMap::new(),
                deleted_durables: 0,
            }),
        })
    }

    /// Register a type under its source-format name.
    pub fn define_type(&self, name: &str) {
        let mut state = self.state.lock();
        let binary = binary_name(name);
        if !state.types.contains_key(&binary) {
            let object = state.alloc_object(name, Body::Class);
            state.types.insert(binary, object);
        }
    }

    pub fn define_callable(
        &self,
        owner: &str,
        name: &str,
        signature: &str,
        body: impl Fn(&SimEnv, ForeignRef, &[BridgeValue]) -> BridgeValue + Send + Sync + 'static,
    ) {
        let mut state = self.state.lock();
        let owner = match state.types.get(&binary_name(owner)) {
            Some(owner) => *owner,
            None => panic!("callable {name} defined on unknown type {owner}"),
        };
        state.callables.push(SimCallable {
            owner,
            name: name.to_string(),
            signature: signature.to_string(),
            body: Arc::new(body),
        });
    }

    /// Define the exception translation helpers.
    pub fn install_exception_support(&self) {
        self.define_type(HELPER_TYPE);
        let helper = |h: ExceptionHelper| (h.name(), h.signature().into_owned());

        let (name, sig) = helper(ExceptionHelper::ClassName);
        self.define_callable(HELPER_TYPE, name, &sig, |env, _, args| {
            let throwable = arg_ref(args, 0);
            BridgeValue::reference(env.new_string(&env.class_of(throwable)))
        });

        let (name, sig) = helper(ExceptionHelper::Message);
        self.define_callable(HELPER_TYPE, name, &sig, |env, _, args| {
            match env.message_of(arg_ref(args, 0)) {
                Some(message) => BridgeValue::reference(env.new_string(&message)),
                None => BridgeValue::null(),
            }
        });

        let (name, sig) = helper(ExceptionHelper::StackTrace);
        self.define_callable(HELPER_TYPE, name, &sig, |env, _, args| {
            let records = env.stack_records(arg_ref(args, 0));
            BridgeValue::reference(env.new_string_array(&records))
        });

        let (name, sig) = helper(ExceptionHelper::Create);
        self.define_callable(HELPER_TYPE, name, &sig, |env, _, args| {
            let message = env.read_string(arg_ref(args, 0));
            let stack = env.current_stack.borrow().clone();
            BridgeValue::reference(env.new_throwable(CREATED_EXCEPTION, message, stack))
        });

        let (name, sig) = helper(ExceptionHelper::UpdateStackTrace);
        self.define_callable(HELPER_TYPE, name, &sig, |env, _, args| {
            let throwable = arg_ref(args, 0);
            let array = arg_ref(args, 1);
            let records = (0..env.array_length(array))
                .filter_map(|i| env.read_string(env.array_element(array, i)))
                .collect();
            env.set_stack_records(throwable, records);
            BridgeValue::reference(throwable)
        });
    }

    /// Whether failed lookups leave an exception pending.
    pub fn set_raise_on_missing(&self, raise: bool) {
        self.state.lock().raise_on_missing = raise;
    }

    pub fn set_find_type_delay(&self, delay: Duration) {
        self.state.lock().find_type_delay = Some(delay);
    }

    /// Make every invocation of callables named `name` raise instead of run.
    pub fn fail_invocations_of(&self, name: &str) {
        self.state.lock().failing.insert(name.to_string());
    }

    pub fn durable_count(&self) -> usize {
        self.state.lock().refs.values().filter(|e| e.durable).count()
    }

    pub fn deleted_durables(&self) -> usize {
        self.state.lock().deleted_durables
    }

    /// Lookups of `binary` so far.
    pub fn find_type_calls(&self, binary: &str) -> usize {
        self.state
            .lock()
            .find_type_calls
            .get(binary)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_find_type_calls(&self) -> usize {
        self.state.lock().find_type_calls.values().sum()
    }

    pub fn find_callable_calls(&self) -> usize {
        self.state.lock().find_callable_calls
    }

    /// Invocations of callables named `name` so far.
    pub fn invocations(&self, name: &str) -> usize {
        self.state.lock().invocations.get(name).copied().unwrap_or(0)
    }
}

fn arg_ref(args: &[BridgeValue], index: usize) -> ForeignRef {
    args.get(index)
        .copied()
        .and_then(BridgeValue::as_ref)
        .unwrap_or_default()
}

/// One thread's view of a `SimHeap`.
pub struct SimEnv {
    heap: Arc<SimHeap>,
    context: ContextId,
    frames: RefCell<Vec<Vec<ForeignRef>>>,
    /// Pending exception object.
    pending: Cell<Option<usize>>,
    current_stack: RefCell<Vec<String>>,
}

impl SimEnv {
    pub fn new(heap: Arc<SimHeap>) -> Self {
        Self::with_context(heap, DEFAULT_CONTEXT)
    }

    pub fn with_context(heap: Arc<SimHeap>, context: ContextId) -> Self {
        Self {
            heap,
            context,
            // Base frame, never popped
            frames: RefCell::new(vec![Vec::new()]),
            pending: Cell::new(None),
            current_stack: RefCell::new(Vec::new()),
        }
    }

    fn local(&self, object: usize) -> ForeignRef {
        let reference = self.heap.state.lock().alloc_ref(object, false);
        if let Some(frame) = self.frames.borrow_mut().last_mut() {
            frame.push(reference);
        }
        reference
    }

    fn object(&self, reference: ForeignRef) -> SimObject {
        let state = self.heap.state.lock();
        let object = state.object_of(reference);
        state.objects[object].clone()
    }

    pub fn new_object(&self, class: &str) -> Ref<Object> {
        let object = self.heap.state.lock().alloc_object(class, Body::Plain);
        Ref::new(self.local(object))
    }

    /// A second local reference to the object behind `reference`.
    pub fn new_local_ref(&self, reference: ForeignRef) -> ForeignRef {
        let object = self.heap.state.lock().object_of(reference);
        self.local(object)
    }

    fn new_throwable(&self, class: &str, message: Option<String>, stack: Vec<String>) -> ForeignRef {
        let object = self
            .heap
            .state
            .lock()
            .alloc_object(class, Body::Throwable { message, stack });
        self.local(object)
    }

    /// Make a new exception pending.
    pub fn throw_new(&self, class: &str, message: Option<&str>, frames: &[StackFrame]) {
        let object = self.heap.state.lock().alloc_object(
            class,
            Body::Throwable {
                message: message.map(str::to_string),
                stack: encode_stack(frames),
            },
        );
        self.pending.set(Some(object));
    }

    /// Stack given to exceptions created by the `createException` helper.
    pub fn set_current_stack(&self, frames: &[StackFrame]) {
        *self.current_stack.borrow_mut() = encode_stack(frames);
    }

    pub fn is_live_ref(&self, reference: ForeignRef) -> bool {
        self.heap
            .state
            .lock()
            .refs
            .contains_key(&reference.as_usize())
    }

    /// Pushed frames, including the base frame.
    pub fn frame_depth(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn class_of(&self, reference: ForeignRef) -> String {
        self.object(reference).class
    }

    pub fn message_of(&self, reference: ForeignRef) -> Option<String> {
        match self.object(reference).body {
            Body::Throwable { message, .. } => message,
            _ => None,
        }
    }

    pub fn stack_records(&self, reference: ForeignRef) -> Vec<String> {
        match self.object(reference).body {
            Body::Throwable { stack, .. } => stack,
            _ => Vec::new(),
        }
    }

    pub fn stack_of(&self, reference: ForeignRef) -> Vec<StackFrame> {
        decode_stack(&self.stack_records(reference))
    }

    fn set_stack_records(&self, reference: ForeignRef, records: Vec<String>) {
        let mut state = self.heap.state.lock();
        let object = state.object_of(reference);
        if let Body::Throwable { stack, .. } = &mut state.objects[object].body {
            *stack = records;
        }
    }

    fn raise(&self, class: &str, message: &str) {
        self.throw_new(class, Some(message), &[]);
    }
}

impl ForeignEnv for SimEnv {
    fn context_id(&self) -> ContextId {
        self.context
    }

    fn push_frame(&self, _capacity: usize) {
        self.frames.borrow_mut().push(Vec::new());
    }

    fn pop_frame(&self, result: ForeignRef) -> ForeignRef {
        let mut frames = self.frames.borrow_mut();
        assert!(frames.len() > 1, "pop of the base frame");
        let frame = frames.pop().unwrap_or_default();
        drop(frames);

        let kept = (!result.is_null()).then(|| self.heap.state.lock().object_of(result));
        {
            let mut state = self.heap.state.lock();
            for reference in frame {
                state.refs.remove(&reference.as_usize());
            }
        }
        match kept {
            Some(object) => self.local(object),
            None => ForeignRef::null(),
        }
    }

    fn new_durable_ref(&self, reference: ForeignRef) -> ForeignRef {
        if reference.is_null() {
            return reference;
        }
        let mut state = self.heap.state.lock();
        let object = state.object_of(reference);
        state.alloc_ref(object, true)
    }

    fn delete_durable_ref(&self, reference: ForeignRef) {
        let mut state = self.heap.state.lock();
        match state.refs.remove(&reference.as_usize()) {
            Some(entry) if entry.durable => state.deleted_durables += 1,
            Some(_) => panic!("{reference:?} is not a durable reference"),
            None => panic!("durable reference {reference:?} deleted twice"),
        }
    }

    fn is_same_object(&self, a: ForeignRef, b: ForeignRef) -> bool {
        match (a.is_null(), b.is_null()) {
            (true, true) => true,
            (false, false) => {
                let state = self.heap.state.lock();
                state.object_of(a) == state.object_of(b)
            }
            _ => false,
        }
    }

    fn find_type(&self, binary_name: &str) -> ForeignRef {
        let (found, delay, raise) = {
            let mut state = self.heap.state.lock();
            *state
                .find_type_calls
                .entry(binary_name.to_string())
                .or_default() += 1;
            (
                state.types.get(binary_name).copied(),
                state.find_type_delay,
                state.raise_on_missing,
            )
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        match found {
            Some(object) => self.local(object),
            None => {
                if raise {
                    self.raise(
                        "java.lang.NoClassDefFoundError",
                        &binary_name.replace('/', "."),
                    );
                }
                ForeignRef::null()
            }
        }
    }

    fn find_callable(
        &self,
        owner: ForeignRef,
        name: &str,
        signature: &str,
        _is_static: bool,
    ) -> Option<CallableId> {
        let (found, raise) = {
            let mut state = self.heap.state.lock();
            state.find_callable_calls += 1;
            let owner = state.object_of(owner);
            let found = state
                .callables
                .iter()
                .position(|c| c.owner == owner && c.name == name && c.signature == signature);
            (found, state.raise_on_missing)
        };
        if found.is_none() && raise {
            self.raise("java.lang.NoSuchMethodError", &format!("{name}{signature}"));
        }
        found.map(CallableId)
    }

    fn invoke(
        &self,
        owner: ForeignRef,
        callable: CallableId,
        receiver: ForeignRef,
        args: &[BridgeValue],
    ) -> BridgeValue {
        let (body, failing) = {
            let mut state = self.heap.state.lock();
            state.object_of(owner);
            let target = &state.callables[callable.0];
            let (body, name) = (target.body.clone(), target.name.clone());
            let failing = state.failing.contains(&name);
            *state.invocations.entry(name).or_default() += 1;
            (body, failing)
        };
        if failing {
            self.raise("java.lang.IllegalStateException", "forced failure");
            return BridgeValue::null();
        }
        body(self, receiver, args)
    }

    fn exception_check(&self) -> bool {
        self.pending.get().is_some()
    }

    /// A fresh local reference to the pending exception.
    fn exception_occurred(&self) -> ForeignRef {
        match self.pending.get() {
            Some(object) => self.local(object),
            None => ForeignRef::null(),
        }
    }

    fn exception_clear(&self) {
        self.pending.set(None);
    }

    fn throw(&self, exception: ForeignRef) {
        let object = self.heap.state.lock().object_of(exception);
        self.pending.set(Some(object));
    }

    fn new_string(&self, value: &str) -> ForeignRef {
        let object = self
            .heap
            .state
            .lock()
            .alloc_object("java.lang.String", Body::Str(value.to_string()));
        self.local(object)
    }

    fn read_string(&self, string: ForeignRef) -> Option<String> {
        if string.is_null() {
            return None;
        }
        match self.object(string).body {
            Body::Str(value) => Some(value),
            _ => None,
        }
    }

    fn new_string_array(&self, values: &[String]) -> ForeignRef {
        let object = self
            .heap
            .state
            .lock()
            .alloc_object("[Ljava.lang.String;", Body::StrArray(values.to_vec()));
        self.local(object)
    }

    fn array_length(&self, array: ForeignRef) -> usize {
        match self.object(array).body {
            Body::StrArray(values) => values.len(),
            _ => 0,
        }
    }

    fn array_element(&self, array: ForeignRef, index: usize) -> ForeignRef {
        match self.object(array).body {
            Body::StrArray(values) => match values.get(index) {
                Some(value) => self.new_string(value),
                None => ForeignRef::null(),
            },
            _ => ForeignRef::null(),
        }
    }
}
