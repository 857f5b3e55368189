//! Tree-walking evaluator used by the in-process strategy.
//!
//! Names resolve only through the restricted [`Namespace`]; there is no
//! import machinery, no reflection and no host I/O beyond an in-memory
//! stdout buffer. An evaluation runs on its own OS thread and polls an
//! interrupt flag at every statement, loop iteration and call, so the
//! monitor, the timeout and cancellation can all stop it.

mod builtins;
mod format;
mod meter;
mod methods;
mod ops;
mod value;

use crate::environment::{Binding, Namespace, Primitive};
use crate::lang::ast::{
    BinOpKind, BoolOpKind, CmpOpKind, CompFor, ComprehensionKind, Constant, ExceptHandler, Expr,
    ExprKind, FStringPart, MatchCase, Module, Parameters, Pattern, PatternKind, Stmt, StmtKind,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;
use value::{
    index_error, iterate, overflow_error, type_error, value_error, BoundMethod, Code, Collector,
    Eval, Exception, Frame, Function, Iter, RangeValue, Table, Value,
};

const INTERPRETER_STACK_SIZE: usize = 64 * 1024 * 1024;
const CPU_SAMPLE_TICKS: u64 = 256;

/// Why an evaluation was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    Terminated,
    Timeout,
    ResourceExceeded,
}

impl InterruptReason {
    fn code(self) -> u8 {
        match self {
            InterruptReason::Terminated => 1,
            InterruptReason::Timeout => 2,
            InterruptReason::ResourceExceeded => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(InterruptReason::Terminated),
            2 => Some(InterruptReason::Timeout),
            3 => Some(InterruptReason::ResourceExceeded),
            _ => None,
        }
    }
}

/// Shared between an evaluation thread and the async side.
///
/// The evaluation publishes its approximate memory and CPU usage here;
/// the async side raises the interrupt flag.
#[derive(Debug, Default)]
pub struct InterpreterControl {
    interrupt: AtomicBool,
    reason: AtomicU8,
    pub(crate) memory: AtomicU64,
    pub(crate) peak_memory: AtomicU64,
    cpu_time_ns: AtomicU64,
    finished: AtomicBool,
}

impl InterpreterControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the evaluation to stop at its next checkpoint. The first
    /// reason recorded wins.
    pub fn interrupt(&self, reason: InterruptReason) {
        let _ = self
            .reason
            .compare_exchange(0, reason.code(), Ordering::AcqRel, Ordering::Acquire);
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<InterruptReason> {
        InterruptReason::from_code(self.reason.load(Ordering::Acquire))
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory.load(Ordering::Relaxed)
    }

    pub fn peak_memory_bytes(&self) -> u64 {
        self.peak_memory.load(Ordering::Relaxed)
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_nanos(self.cpu_time_ns.load(Ordering::Relaxed))
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Ceilings enforced inside the evaluator itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationLimits {
    pub max_memory: u64,
    pub max_output_bytes: usize,
    pub recursion_limit: usize,
}

impl Default for EvaluationLimits {
    fn default() -> Self {
        Self {
            max_memory: 256 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            recursion_limit: 200,
        }
    }
}

/// Uncaught guest exception
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestError {
    pub kind: String,
    pub message: String,
    pub line: Option<usize>,
    /// Raised by the sandbox itself (memory ceiling, interrupt)
    pub fatal: bool,
}

impl GuestError {
    pub fn render(&self) -> String {
        if self.message.is_empty() {
            self.kind.clone()
        } else {
            format!("{}: {}", self.kind, self.message)
        }
    }
}

impl From<&Exception> for GuestError {
    fn from(error: &Exception) -> Self {
        Self {
            kind: error.kind.to_string(),
            message: error.message.clone(),
            line: error.line,
            fatal: error.is_fatal(),
        }
    }
}

/// Outcome of one evaluation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub stdout: String,
    pub stderr: String,
    /// Value of a trailing expression statement, unless it was `None`
    pub return_value: Option<serde_json::Value>,
    pub error: Option<GuestError>,
    pub output_truncated: bool,
}

impl Evaluation {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Evaluate `module` on the current thread
pub fn evaluate(
    module: &Module,
    namespace: &Namespace,
    limits: &EvaluationLimits,
    control: Arc<InterpreterControl>,
) -> Evaluation {
    meter::install(limits.max_memory, control.clone());
    let cpu_start = thread_cpu_time();

    let mut interpreter = Interpreter::new(namespace, limits, control.clone(), cpu_start);
    let outcome = interpreter.run(module);
    interpreter.record_cpu();
    let evaluation = interpreter.finish(outcome);

    meter::uninstall();
    control.finished.store(true, Ordering::Release);
    debug!(
        success = evaluation.is_success(),
        cpu_time = ?control.cpu_time(),
        peak_memory = control.peak_memory_bytes(),
        "Evaluation finished"
    );
    evaluation
}

/// Evaluate on a dedicated thread; the receiver yields the result
pub fn spawn(
    module: Arc<Module>,
    namespace: Namespace,
    limits: EvaluationLimits,
    control: Arc<InterpreterControl>,
) -> std::io::Result<oneshot::Receiver<Evaluation>> {
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("ward-interpreter".to_string())
        .stack_size(INTERPRETER_STACK_SIZE)
        .spawn(move || {
            let evaluation = evaluate(&module, &namespace, &limits, control);
            let _ = tx.send(evaluation);
        })?;
    Ok(rx)
}

fn thread_cpu_time() -> Duration {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: `ts` is a valid, writable timespec
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec.max(0) as u64, ts.tv_nsec.clamp(0, 999_999_999) as u32)
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct OutputBuffer {
    text: String,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            cap,
            truncated: false,
        }
    }

    /// Length of the prefix of `text` that still fits
    fn room_for(&self, text: &str) -> usize {
        let mut end = text.len().min(self.cap.saturating_sub(self.text.len()));
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        end
    }

    fn push(&mut self, text: &str) {
        let end = self.room_for(text);
        self.text.push_str(&text[..end]);
        if end < text.len() {
            self.truncated = true;
        }
    }
}

/// Destination of comprehension elements
enum Sink {
    Items(Collector),
    Set(Table),
    Dict(Table),
}

/// Resolved `start:stop:step` over a sequence of known length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SliceSpec {
    start: i64,
    stop: i64,
    step: i64,
}

impl SliceSpec {
    fn resolve(len: usize, lower: Option<i64>, upper: Option<i64>, step: Option<i64>) -> Eval<Self> {
        let step = step.unwrap_or(1);
        if step == 0 {
            return Err(value_error("slice step cannot be zero"));
        }
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let clamp = |index: i64| -> i64 {
            if index < 0 {
                let shifted = index.saturating_add(len);
                if shifted < 0 {
                    if step < 0 {
                        -1
                    } else {
                        0
                    }
                } else {
                    shifted
                }
            } else if index >= len {
                if step < 0 {
                    len - 1
                } else {
                    len
                }
            } else {
                index
            }
        };
        let (default_start, default_stop) = if step < 0 { (len - 1, -1) } else { (0, len) };
        Ok(Self {
            start: lower.map_or(default_start, clamp),
            stop: upper.map_or(default_stop, clamp),
            step,
        })
    }

    fn indices(self) -> impl Iterator<Item = usize> {
        let Self { start, stop, step } = self;
        std::iter::successors(Some(start), move |&index| index.checked_add(step))
            .take_while(move |&index| if step > 0 { index < stop } else { index > stop })
            .map(|index| index as usize)
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

fn not_supported(construct: &str) -> Exception {
    Exception::new(
        "NotImplementedError",
        format!("'{}' is not supported in the sandbox", construct),
    )
}

fn name_error(name: &str) -> Exception {
    Exception::new("NameError", format!("name '{}' is not defined", name))
}

fn no_attribute(value: &Value, attr: &str) -> Exception {
    Exception::new(
        "AttributeError",
        format!("'{}' object has no attribute '{}'", value.type_name(), attr),
    )
}

fn index_of(value: &Value, what: &str) -> Eval<i64> {
    value.as_int().ok_or_else(|| {
        type_error(format!(
            "{} indices must be integers or slices, not {}",
            what,
            value.type_name()
        ))
    })
}

pub(crate) struct Interpreter {
    builtins: HashMap<String, Value>,
    globals: Rc<Frame>,
    control: Arc<InterpreterControl>,
    cpu_start: Duration,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    depth: usize,
    recursion_limit: usize,
    ticks: u64,
    /// Frames captured by closures, cleared at teardown to break cycles
    captured: Vec<Weak<Frame>>,
    prune_at: usize,
    /// Exceptions being handled, innermost last
    handling: Vec<Exception>,
}

impl Interpreter {
    fn new(
        namespace: &Namespace,
        limits: &EvaluationLimits,
        control: Arc<InterpreterControl>,
        cpu_start: Duration,
    ) -> Self {
        let builtins = namespace
            .iter()
            .filter_map(|(name, binding)| {
                let value = match binding {
                    Binding::Primitive(primitive) => Value::Builtin(*primitive),
                    Binding::ExceptionType(kind) => Value::ExceptionType(*kind),
                    Binding::Constant(constant) => constant_value(constant).ok()?,
                };
                Some((name.to_string(), value))
            })
            .collect();
        Self {
            builtins,
            globals: Rc::new(Frame::default()),
            control,
            cpu_start,
            stdout: OutputBuffer::new(limits.max_output_bytes),
            stderr: OutputBuffer::new(limits.max_output_bytes),
            depth: 0,
            recursion_limit: limits.recursion_limit,
            ticks: 0,
            captured: Vec::new(),
            prune_at: 64,
            handling: Vec::new(),
        }
    }

    fn run(&mut self, module: &Module) -> Eval<Option<Value>> {
        let globals = self.globals.clone();
        let Some((last, rest)) = module.body.split_last() else {
            return Ok(None);
        };
        for stmt in rest {
            if let Flow::Return(value) = self.exec(stmt, &globals)? {
                return Ok(Some(value));
            }
        }
        match &last.kind {
            StmtKind::Expr(expr) => {
                let line = last.span.line;
                self.checkpoint().map_err(|e| e.at_line(line))?;
                self.eval(expr, &globals)
                    .map(Some)
                    .map_err(|e| e.at_line(line))
            }
            _ => match self.exec(last, &globals)? {
                Flow::Return(value) => Ok(Some(value)),
                _ => Ok(None),
            },
        }
    }

    fn finish(mut self, outcome: Eval<Option<Value>>) -> Evaluation {
        let (return_value, error) = match outcome {
            Ok(value) => (
                value
                    .filter(|value| !matches!(value, Value::None))
                    .map(|value| value.to_json()),
                None,
            ),
            Err(error) => {
                let mut report = String::from("Traceback (most recent call last):\n");
                if let Some(line) = error.line {
                    report.push_str(&format!(
                        "  File \"{}\", line {}, in <module>\n",
                        crate::environment::SENTINEL_FILE_NAME,
                        line
                    ));
                }
                report.push_str(&error.render());
                report.push('\n');
                self.stderr.push(&report);
                (None, Some(GuestError::from(&error)))
            }
        };
        self.teardown();
        Evaluation {
            stdout: std::mem::take(&mut self.stdout.text),
            stderr: std::mem::take(&mut self.stderr.text),
            return_value,
            error,
            output_truncated: self.stdout.truncated || self.stderr.truncated,
        }
    }

    fn teardown(&mut self) {
        for frame in self.captured.drain(..).filter_map(|frame| frame.upgrade()) {
            let vars = std::mem::take(&mut *frame.vars.borrow_mut());
            drop(vars);
        }
        let globals = std::mem::take(&mut *self.globals.vars.borrow_mut());
        drop(globals);
        self.handling.clear();
    }

    pub(super) fn checkpoint(&mut self) -> Eval<()> {
        if self.control.is_interrupted() {
            return Err(Exception::interrupted());
        }
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % CPU_SAMPLE_TICKS == 0 {
            self.record_cpu();
        }
        Ok(())
    }

    fn record_cpu(&self) {
        let used = thread_cpu_time().saturating_sub(self.cpu_start);
        let nanos = u64::try_from(used.as_nanos()).unwrap_or(u64::MAX);
        self.control.cpu_time_ns.store(nanos, Ordering::Relaxed);
    }

    pub(super) fn write_stdout(&mut self, text: &str) -> Eval<()> {
        meter::consume(self.stdout.room_for(text))?;
        self.stdout.push(text);
        Ok(())
    }

    /// Materialize any iterable, polling the interrupt flag as it goes
    pub(super) fn collect(&mut self, value: &Value) -> Eval<Vec<Value>> {
        match value {
            Value::List(list) => return Ok(list.borrow().clone()),
            Value::Tuple(tuple) => return Ok(tuple.items().to_vec()),
            _ => {}
        }
        let mut iter = iterate(value)?;
        let mut out = Collector::new();
        while let Some(item) = iter.next()? {
            out.push(item)?;
            if out.len() % 1024 == 0 {
                self.checkpoint()?;
            }
        }
        Ok(out.finish())
    }

    // Statements

    fn exec_block(&mut self, body: &[Stmt], scope: &Rc<Frame>) -> Eval<Flow> {
        for stmt in body {
            match self.exec(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, scope: &Rc<Frame>) -> Eval<Flow> {
        let line = stmt.span.line;
        self.checkpoint().map_err(|e| e.at_line(line))?;
        self.exec_inner(stmt, scope).map_err(|e| e.at_line(line))
    }

    fn exec_inner(&mut self, stmt: &Stmt, scope: &Rc<Frame>) -> Eval<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, scope)?;
                for target in targets {
                    self.assign(target, value.clone(), scope)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                self.aug_assign(target, *op, value, scope)?;
            }
            StmtKind::AnnAssign { target, value, .. } => {
                if let Some(value) = value {
                    let value = self.eval(value, scope)?;
                    self.assign(target, value, scope)?;
                }
            }
            StmtKind::Import(names) => {
                let module = names.first().map_or("", |alias| alias.name.as_str());
                return Err(import_error(module));
            }
            StmtKind::ImportFrom { module, level, .. } => {
                let module = format!("{}{}", ".".repeat(*level), module.as_deref().unwrap_or(""));
                return Err(import_error(&module));
            }
            StmtKind::If { test, body, orelse } => {
                let branch = if self.eval(test, scope)?.truthy() {
                    body
                } else {
                    orelse
                };
                return self.exec_block(branch, scope);
            }
            StmtKind::While { test, body, orelse } => {
                loop {
                    self.checkpoint()?;
                    if !self.eval(test, scope)?.truthy() {
                        return self.exec_block(orelse, scope);
                    }
                    match self.exec_block(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
                is_async,
            } => {
                if *is_async {
                    return Err(not_supported("async for"));
                }
                let iterable = self.eval(iter, scope)?;
                let mut iter = iterate(&iterable)?;
                loop {
                    self.checkpoint()?;
                    let Some(item) = iter.next()? else {
                        return self.exec_block(orelse, scope);
                    };
                    self.assign(target, item, scope)?;
                    match self.exec_block(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::FunctionDef(def) => {
                if def.is_async {
                    return Err(not_supported("async def"));
                }
                let decorators = def
                    .decorators
                    .iter()
                    .map(|decorator| self.eval(decorator, scope))
                    .collect::<Eval<Vec<_>>>()?;
                let defaults = self.eval_defaults(&def.params, scope)?;
                let mut value = Value::Function(Rc::new(Function {
                    name: def.name.clone(),
                    code: Code::Def(def.clone()),
                    defaults,
                    closure: self.closure_for(scope),
                }));
                for decorator in decorators.iter().rev() {
                    value = self.call(decorator, vec![value], Vec::new())?;
                }
                store(scope, &def.name, value);
            }
            StmtKind::ClassDef(_) => return Err(not_supported("class")),
            StmtKind::With { .. } => return Err(not_supported("with")),
            StmtKind::Global(_) => return Err(not_supported("global")),
            StmtKind::Nonlocal(_) => return Err(not_supported("nonlocal")),
            StmtKind::Return(value) => {
                let value = match value {
                    Some(value) => self.eval(value, scope)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Raise { exc, cause } => {
                if let Some(cause) = cause {
                    self.eval(cause, scope)?;
                }
                return Err(match exc {
                    Some(exc) => {
                        let value = self.eval(exc, scope)?;
                        self.to_exception(value)?
                    }
                    None => self.handling.last().cloned().ok_or_else(|| {
                        Exception::new("RuntimeError", "No active exception to reraise")
                    })?,
                });
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                let outcome = match self.exec_block(body, scope) {
                    Ok(Flow::Normal) => self.exec_block(orelse, scope),
                    Ok(flow) => Ok(flow),
                    Err(error) if error.is_fatal() => return Err(error),
                    Err(error) => self.handle(error, handlers, scope),
                };
                if matches!(&outcome, Err(error) if error.is_fatal()) {
                    return outcome;
                }
                if !finalbody.is_empty() {
                    match self.exec_block(finalbody, scope)? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
                return outcome;
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(target, scope)?;
                }
            }
            StmtKind::Match { subject, cases } => {
                let subject = self.eval(subject, scope)?;
                return self.exec_match(&subject, cases, scope);
            }
            StmtKind::Assert { test, msg } => {
                if !self.eval(test, scope)?.truthy() {
                    let message = match msg {
                        Some(msg) => self.eval(msg, scope)?.to_str(),
                        None => String::new(),
                    };
                    return Err(Exception::new("AssertionError", message));
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_match(&mut self, subject: &Value, cases: &[MatchCase], scope: &Rc<Frame>) -> Eval<Flow> {
        for case in cases {
            let mut bindings = Vec::new();
            if !self.match_pattern(&case.pattern, subject, &mut bindings, scope)? {
                continue;
            }
            // Captures are visible to the guard even when it rejects the case
            for (name, value) in bindings {
                store(scope, &name, value);
            }
            if let Some(guard) = &case.guard {
                if !self.eval(guard, scope)?.truthy() {
                    continue;
                }
            }
            return self.exec_block(&case.body, scope);
        }
        Ok(Flow::Normal)
    }

    /// Structural match; captures are collected into `bindings` and only
    /// stored once the whole pattern has matched.
    fn match_pattern(
        &mut self,
        pattern: &Pattern,
        subject: &Value,
        bindings: &mut Vec<(String, Value)>,
        scope: &Rc<Frame>,
    ) -> Eval<bool> {
        self.checkpoint()?;
        match &pattern.kind {
            PatternKind::Wildcard => Ok(true),
            PatternKind::Capture(name) => {
                bindings.push((name.clone(), subject.clone()));
                Ok(true)
            }
            PatternKind::Value(expr) => {
                let expected = self.eval(expr, scope)?;
                match &expr.kind {
                    ExprKind::Constant(Constant::None | Constant::Bool(_)) => {
                        Ok(subject.is(&expected))
                    }
                    _ => ops::compare(CmpOpKind::Eq, subject, &expected),
                }
            }
            PatternKind::Sequence(items) => self.match_sequence(items, subject, bindings, scope),
            PatternKind::Star(_) => Err(type_error("starred pattern outside a sequence pattern")),
            PatternKind::Mapping {
                keys,
                patterns,
                rest,
            } => {
                let Value::Dict(dict) = subject else {
                    return Ok(false);
                };
                let mut matched = Vec::with_capacity(keys.len());
                for (key, pattern) in keys.iter().zip(patterns) {
                    let hash = self.eval(key, scope)?.hash_key()?;
                    let value = dict.borrow().get(&hash).cloned();
                    let Some(value) = value else {
                        return Ok(false);
                    };
                    if !self.match_pattern(pattern, &value, bindings, scope)? {
                        return Ok(false);
                    }
                    matched.push(hash);
                }
                if let Some(name) = rest {
                    let mut remaining = dict.borrow().clone();
                    for hash in &matched {
                        remaining.remove(hash);
                    }
                    bindings.push((name.clone(), Value::new_dict(remaining)?));
                }
                Ok(true)
            }
            PatternKind::Class {
                cls,
                patterns,
                keywords,
            } => {
                if !keywords.is_empty() {
                    return Err(not_supported("keyword class pattern"));
                }
                let cls = self.eval(cls, scope)?;
                let is_instance = match &cls {
                    Value::Builtin(primitive) => match primitive {
                        Primitive::Bool => matches!(subject, Value::Bool(_)),
                        Primitive::Int => matches!(subject, Value::Int(_) | Value::Bool(_)),
                        Primitive::Float => matches!(subject, Value::Float(_)),
                        Primitive::Str => matches!(subject, Value::Str(_)),
                        Primitive::List => matches!(subject, Value::List(_)),
                        Primitive::Tuple => matches!(subject, Value::Tuple(_)),
                        Primitive::Dict => matches!(subject, Value::Dict(_)),
                        Primitive::Set => matches!(subject, Value::Set(_)),
                        _ => return Err(type_error("called match pattern must be a class")),
                    },
                    Value::ExceptionType(kind) => {
                        matches!(subject, Value::Exception(error) if error.is_instance_of(kind))
                    }
                    _ => return Err(type_error("called match pattern must be a class")),
                };
                if !is_instance {
                    return Ok(false);
                }
                match patterns.as_slice() {
                    [] => Ok(true),
                    // Builtin types match their single positional pattern against the subject
                    [single] if matches!(cls, Value::Builtin(_)) => {
                        self.match_pattern(single, subject, bindings, scope)
                    }
                    _ => Err(type_error(format!(
                        "{}() accepts at most 1 positional sub-pattern",
                        cls.repr()
                    ))),
                }
            }
            PatternKind::Or(alternatives) => {
                for alternative in alternatives {
                    let mark = bindings.len();
                    if self.match_pattern(alternative, subject, bindings, scope)? {
                        return Ok(true);
                    }
                    bindings.truncate(mark);
                }
                Ok(false)
            }
            PatternKind::As { pattern, name } => {
                if !self.match_pattern(pattern, subject, bindings, scope)? {
                    return Ok(false);
                }
                bindings.push((name.clone(), subject.clone()));
                Ok(true)
            }
        }
    }

    /// Lists and tuples only; strings and mappings never match a sequence
    fn match_sequence(
        &mut self,
        items: &[Pattern],
        subject: &Value,
        bindings: &mut Vec<(String, Value)>,
        scope: &Rc<Frame>,
    ) -> Eval<bool> {
        let values: Vec<Value> = match subject {
            Value::List(list) => list.borrow().clone(),
            Value::Tuple(tuple) => tuple.items().to_vec(),
            _ => return Ok(false),
        };
        let star = items
            .iter()
            .position(|item| matches!(item.kind, PatternKind::Star(_)));
        let Some(star) = star else {
            if values.len() != items.len() {
                return Ok(false);
            }
            for (item, value) in items.iter().zip(&values) {
                if !self.match_pattern(item, value, bindings, scope)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        };

        let tail = items.len() - star - 1;
        if values.len() < star + tail {
            return Ok(false);
        }
        let middle_end = values.len() - tail;
        let fixed = items[..star]
            .iter()
            .zip(&values[..star])
            .chain(items[star + 1..].iter().zip(&values[middle_end..]));
        for (item, value) in fixed {
            if !self.match_pattern(item, value, bindings, scope)? {
                return Ok(false);
            }
        }
        if let PatternKind::Star(Some(name)) = &items[star].kind {
            let rest = Value::new_list(values[star..middle_end].to_vec())?;
            bindings.push((name.clone(), rest));
        }
        Ok(true)
    }

    fn handle(
        &mut self,
        error: Exception,
        handlers: &[ExceptHandler],
        scope: &Rc<Frame>,
    ) -> Eval<Flow> {
        for handler in handlers {
            if !self.handler_matches(handler, &error, scope)? {
                continue;
            }
            if let Some(name) = &handler.name {
                store(scope, name, Value::Exception(Rc::new(error.clone())));
            }
            self.handling.push(error);
            let result = self.exec_block(&handler.body, scope);
            self.handling.pop();
            if let Some(name) = &handler.name {
                let previous = scope.vars.borrow_mut().remove(name);
                drop(previous);
            }
            return result;
        }
        Err(error)
    }

    fn handler_matches(
        &mut self,
        handler: &ExceptHandler,
        error: &Exception,
        scope: &Rc<Frame>,
    ) -> Eval<bool> {
        let Some(kind) = &handler.kind else {
            return Ok(true);
        };
        let kind = self.eval(kind, scope)?;
        let kinds = match &kind {
            Value::Tuple(tuple) => tuple.items().to_vec(),
            other => vec![other.clone()],
        };
        let mut matched = false;
        for kind in &kinds {
            match kind {
                Value::ExceptionType(name) => matched |= error.is_instance_of(name),
                _ => {
                    return Err(type_error(
                        "catching classes that do not inherit from BaseException is not allowed",
                    ))
                }
            }
        }
        Ok(matched)
    }

    fn to_exception(&mut self, value: Value) -> Eval<Exception> {
        match value {
            Value::ExceptionType(kind) => Ok(Exception::new(kind, "")),
            Value::Exception(exception) => {
                let mut exception = (*exception).clone();
                exception.line = None;
                Ok(exception)
            }
            _ => Err(type_error("exceptions must derive from BaseException")),
        }
    }

    fn eval_defaults(
        &mut self,
        params: &Parameters,
        scope: &Rc<Frame>,
    ) -> Eval<HashMap<String, Value>> {
        let mut defaults = HashMap::new();
        for param in params.positional.iter().chain(params.kwonly.iter()) {
            if let Some(default) = &param.default {
                defaults.insert(param.name.clone(), self.eval(default, scope)?);
            }
        }
        Ok(defaults)
    }

    fn closure_for(&mut self, scope: &Rc<Frame>) -> Option<Rc<Frame>> {
        if Rc::ptr_eq(scope, &self.globals) {
            return None;
        }
        if self.captured.len() >= self.prune_at {
            self.captured.retain(|frame| frame.strong_count() > 0);
            self.prune_at = (self.captured.len() * 2).max(64);
        }
        self.captured.push(Rc::downgrade(scope));
        Some(scope.clone())
    }

    // Binding

    fn assign(&mut self, target: &Expr, value: Value, scope: &Rc<Frame>) -> Eval<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                store(scope, name, value);
                Ok(())
            }
            ExprKind::Tuple(targets) | ExprKind::List(targets) => {
                self.unpack(targets, value, scope)
            }
            ExprKind::Subscript { value: container, index } => {
                let container = self.eval(container, scope)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let bounds = self.slice_bounds(lower, upper, step, scope)?;
                    return self.set_slice(&container, bounds, value);
                }
                let index = self.eval(index, scope)?;
                self.set_item(&container, index, value)
            }
            ExprKind::Attribute { value: receiver, attr, .. } => {
                let receiver = self.eval(receiver, scope)?;
                Err(no_attribute(&receiver, attr))
            }
            ExprKind::Starred(_) => Err(Exception::new(
                "SyntaxError",
                "starred assignment target must be in a list or tuple",
            )),
            other => Err(Exception::new(
                "SyntaxError",
                format!("cannot assign to {}", other.describe()),
            )),
        }
    }

    fn unpack(&mut self, targets: &[Expr], value: Value, scope: &Rc<Frame>) -> Eval<()> {
        let mut items = self.collect(&value)?;
        let starred = targets
            .iter()
            .position(|target| matches!(target.kind, ExprKind::Starred(_)));
        let Some(star) = starred else {
            if items.len() < targets.len() {
                return Err(value_error(format!(
                    "not enough values to unpack (expected {}, got {})",
                    targets.len(),
                    items.len()
                )));
            }
            if items.len() > targets.len() {
                return Err(value_error(format!(
                    "too many values to unpack (expected {})",
                    targets.len()
                )));
            }
            for (target, item) in targets.iter().zip(items) {
                self.assign(target, item, scope)?;
            }
            return Ok(());
        };

        let required = targets.len() - 1;
        if items.len() < required {
            return Err(value_error(format!(
                "not enough values to unpack (expected at least {}, got {})",
                required,
                items.len()
            )));
        }
        let after = targets.len() - star - 1;
        let tail = items.split_off(items.len() - after);
        let middle = items.split_off(star);
        for (target, item) in targets[..star].iter().zip(items) {
            self.assign(target, item, scope)?;
        }
        if let ExprKind::Starred(inner) = &targets[star].kind {
            self.assign(inner, Value::new_list(middle)?, scope)?;
        }
        for (target, item) in targets[star + 1..].iter().zip(tail) {
            self.assign(target, item, scope)?;
        }
        Ok(())
    }

    fn aug_assign(
        &mut self,
        target: &Expr,
        op: BinOpKind,
        value: &Expr,
        scope: &Rc<Frame>,
    ) -> Eval<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                let current = self.lookup(name, scope)?;
                let operand = self.eval(value, scope)?;
                let updated = self.augmented(op, &current, &operand)?;
                store(scope, name, updated);
                Ok(())
            }
            ExprKind::Subscript { value: container, index }
                if !matches!(index.kind, ExprKind::Slice { .. }) =>
            {
                let container = self.eval(container, scope)?;
                let index = self.eval(index, scope)?;
                let current = self.get_item(&container, &index)?;
                let operand = self.eval(value, scope)?;
                let updated = self.augmented(op, &current, &operand)?;
                self.set_item(&container, index, updated)
            }
            ExprKind::Attribute { value: receiver, attr, .. } => {
                let receiver = self.eval(receiver, scope)?;
                Err(no_attribute(&receiver, attr))
            }
            other => Err(Exception::new(
                "SyntaxError",
                format!(
                    "'{}' is an illegal expression for augmented assignment",
                    other.describe()
                ),
            )),
        }
    }

    /// `current op= operand`; mutable containers update in place
    fn augmented(&mut self, op: BinOpKind, current: &Value, operand: &Value) -> Eval<Value> {
        match (op, current) {
            (BinOpKind::Add, Value::List(list)) => {
                let items = self.collect(operand)?;
                list.borrow_mut().extend(items);
                list.recharge()?;
                Ok(current.clone())
            }
            (BinOpKind::BitOr | BinOpKind::BitAnd | BinOpKind::Sub | BinOpKind::BitXor, Value::Set(set))
            | (BinOpKind::BitOr, Value::Dict(set)) => {
                let computed = ops::binary(op, current, operand)?;
                if let Value::Set(table) | Value::Dict(table) = &computed {
                    let table = table.borrow().clone();
                    let previous = std::mem::replace(&mut *set.borrow_mut(), table);
                    drop(previous);
                    set.recharge()?;
                }
                Ok(current.clone())
            }
            _ => ops::binary(op, current, operand),
        }
    }

    fn delete(&mut self, target: &Expr, scope: &Rc<Frame>) -> Eval<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                let previous = scope.vars.borrow_mut().remove(name);
                match previous {
                    Some(value) => {
                        drop(value);
                        Ok(())
                    }
                    None => Err(name_error(name)),
                }
            }
            ExprKind::Tuple(targets) | ExprKind::List(targets) => {
                for target in targets {
                    self.delete(target, scope)?;
                }
                Ok(())
            }
            ExprKind::Subscript { value, index } => {
                let container = self.eval(value, scope)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let bounds = self.slice_bounds(lower, upper, step, scope)?;
                    return self.delete_slice(&container, bounds);
                }
                let index = self.eval(index, scope)?;
                self.delete_item(&container, &index)
            }
            ExprKind::Attribute { value, attr, .. } => {
                let receiver = self.eval(value, scope)?;
                Err(no_attribute(&receiver, attr))
            }
            other => Err(Exception::new(
                "SyntaxError",
                format!("cannot delete {}", other.describe()),
            )),
        }
    }

    fn lookup(&self, name: &str, scope: &Rc<Frame>) -> Eval<Value> {
        let mut frame = Some(scope);
        while let Some(current) = frame {
            if let Some(value) = current.vars.borrow().get(name) {
                return Ok(value.clone());
            }
            frame = current.parent.as_ref();
        }
        if let Some(value) = self.globals.vars.borrow().get(name) {
            return Ok(value.clone());
        }
        self.builtins
            .get(name)
            .cloned()
            .ok_or_else(|| name_error(name))
    }

    // Expressions

    fn eval(&mut self, expr: &Expr, scope: &Rc<Frame>) -> Eval<Value> {
        match &expr.kind {
            ExprKind::Constant(constant) => constant_value(constant),
            ExprKind::Name(name) => self.lookup(name, scope),
            ExprKind::Attribute { value, attr, .. } => {
                let value = self.eval(value, scope)?;
                self.get_attribute(&value, attr)
            }
            ExprKind::Subscript { value, index } => {
                let container = self.eval(value, scope)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let bounds = self.slice_bounds(lower, upper, step, scope)?;
                    return self.get_slice(&container, bounds);
                }
                let index = self.eval(index, scope)?;
                self.get_item(&container, &index)
            }
            ExprKind::Slice { .. } => Err(not_supported("slice object")),
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                let callee = self.eval(func, scope)?;
                let args = self.eval_items(args, scope)?;
                let mut kwargs = Vec::with_capacity(keywords.len());
                for keyword in keywords {
                    let value = self.eval(&keyword.value, scope)?;
                    match &keyword.arg {
                        Some(name) => kwargs.push((name.clone(), value)),
                        None => {
                            let Value::Dict(dict) = &value else {
                                return Err(type_error(format!(
                                    "argument after ** must be a mapping, not {}",
                                    value.type_name()
                                )));
                            };
                            for (key, item) in dict.borrow().iter() {
                                let Some(key) = key.as_str() else {
                                    return Err(type_error("keywords must be strings"));
                                };
                                kwargs.push((key.to_string(), item.clone()));
                            }
                        }
                    }
                }
                self.call(&callee, args, kwargs)
            }
            ExprKind::Starred(_) => Err(Exception::new(
                "SyntaxError",
                "can't use starred expression here",
            )),
            ExprKind::BinOp { left, op, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                ops::binary(*op, &left, &right)
            }
            ExprKind::UnaryOp { op, operand } => {
                let operand = self.eval(operand, scope)?;
                ops::unary(*op, &operand)
            }
            ExprKind::BoolOp { op, values } => {
                let mut result = Value::None;
                for value in values {
                    result = self.eval(value, scope)?;
                    let decided = match op {
                        BoolOpKind::And => !result.truthy(),
                        BoolOpKind::Or => result.truthy(),
                    };
                    if decided {
                        break;
                    }
                }
                Ok(result)
            }
            ExprKind::Compare {
                left,
                ops: operators,
                comparators,
            } => {
                let mut left = self.eval(left, scope)?;
                for (op, comparator) in operators.iter().zip(comparators) {
                    let right = self.eval(comparator, scope)?;
                    if !ops::compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::IfExp { test, body, orelse } => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(body, scope)
                } else {
                    self.eval(orelse, scope)
                }
            }
            ExprKind::Lambda(lambda) => {
                let defaults = self.eval_defaults(&lambda.params, scope)?;
                Ok(Value::Function(Rc::new(Function {
                    name: "<lambda>".to_string(),
                    code: Code::Lambda(lambda.clone()),
                    defaults,
                    closure: self.closure_for(scope),
                })))
            }
            ExprKind::Tuple(items) => Value::new_tuple(self.eval_items(items, scope)?),
            ExprKind::List(items) => Value::new_list(self.eval_items(items, scope)?),
            ExprKind::Set(items) => {
                let mut table = Table::default();
                for item in self.eval_items(items, scope)? {
                    table.insert_value(item, Value::None)?;
                }
                Value::new_set(table)
            }
            ExprKind::Dict { keys, values } => {
                let mut table = Table::default();
                for (key, value) in keys.iter().zip(values) {
                    match key {
                        Some(key) => {
                            let key = self.eval(key, scope)?;
                            let value = self.eval(value, scope)?;
                            table.insert_value(key, value)?;
                        }
                        None => {
                            let mapping = self.eval(value, scope)?;
                            let Value::Dict(dict) = &mapping else {
                                return Err(type_error(format!(
                                    "'{}' object is not a mapping",
                                    mapping.type_name()
                                )));
                            };
                            for (key, value) in dict.borrow().iter() {
                                table.insert_value(key.clone(), value.clone())?;
                            }
                        }
                    }
                }
                Value::new_dict(table)
            }
            ExprKind::Comprehension {
                kind,
                element,
                value,
                generators,
            } => self.comprehension(*kind, element, value.as_deref(), generators, scope),
            ExprKind::Yield(_) | ExprKind::YieldFrom(_) => Err(not_supported("yield")),
            ExprKind::Await(_) => Err(not_supported("await")),
            ExprKind::JoinedStr(parts) => {
                let text = self.fstring(parts, scope)?;
                Value::new_str(text)
            }
            ExprKind::NamedExpr { target, value } => {
                let value = self.eval(value, scope)?;
                store(scope, target, value.clone());
                Ok(value)
            }
        }
    }

    /// Positional items with `*iterable` expanded
    fn eval_items(&mut self, items: &[Expr], scope: &Rc<Frame>) -> Eval<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if let ExprKind::Starred(inner) = &item.kind {
                let value = self.eval(inner, scope)?;
                out.extend(self.collect(&value)?);
            } else {
                out.push(self.eval(item, scope)?);
            }
        }
        Ok(out)
    }

    fn fstring(&mut self, parts: &[FStringPart], scope: &Rc<Frame>) -> Eval<String> {
        let mut out = String::new();
        for part in parts {
            match part {
                FStringPart::Literal(text) => out.push_str(text),
                FStringPart::Field {
                    value,
                    conversion,
                    format_spec,
                    debug_text,
                } => {
                    let value = self.eval(value, scope)?;
                    if let Some(text) = debug_text {
                        out.push_str(text);
                    }
                    let spec = match format_spec {
                        Some(spec) => self.fstring(spec, scope)?,
                        None => String::new(),
                    };
                    let conversion = conversion.or_else(|| {
                        (debug_text.is_some() && format_spec.is_none()).then_some('r')
                    });
                    let rendered = match conversion {
                        Some('r') | Some('a') => {
                            format::format_value(&Value::new_str(value.repr())?, &spec)?
                        }
                        Some('s') => format::format_value(&Value::new_str(value.to_str())?, &spec)?,
                        _ => format::format_value(&value, &spec)?,
                    };
                    meter::check_available(out.len() + rendered.len())?;
                    out.push_str(&rendered);
                }
            }
        }
        Ok(out)
    }

    fn comprehension(
        &mut self,
        kind: ComprehensionKind,
        element: &Expr,
        value: Option<&Expr>,
        generators: &[CompFor],
        scope: &Rc<Frame>,
    ) -> Eval<Value> {
        let frame = Rc::new(Frame {
            vars: RefCell::default(),
            parent: Some(scope.clone()),
        });
        let mut sink = match kind {
            ComprehensionKind::List | ComprehensionKind::Generator => Sink::Items(Collector::new()),
            ComprehensionKind::Set => Sink::Set(Table::default()),
            ComprehensionKind::Dict => Sink::Dict(Table::default()),
        };
        self.comp_level(generators, element, value, &frame, &mut sink)?;
        match (kind, sink) {
            (ComprehensionKind::Generator, Sink::Items(items)) => {
                Ok(Value::new_iterator(Iter::Values(items.finish().into_iter())))
            }
            (_, Sink::Items(items)) => Value::new_list(items.finish()),
            (_, Sink::Set(table)) => Value::new_set(table),
            (_, Sink::Dict(table)) => Value::new_dict(table),
        }
    }

    fn comp_level(
        &mut self,
        generators: &[CompFor],
        element: &Expr,
        value: Option<&Expr>,
        frame: &Rc<Frame>,
        sink: &mut Sink,
    ) -> Eval<()> {
        let Some((generator, rest)) = generators.split_first() else {
            self.checkpoint()?;
            return match sink {
                Sink::Items(items) => items.push(self.eval(element, frame)?),
                Sink::Set(table) => {
                    let key = self.eval(element, frame)?;
                    table.insert_value(key, Value::None)?;
                    meter::check_available(table.len() * std::mem::size_of::<Value>() * 3)
                }
                Sink::Dict(table) => {
                    let key = self.eval(element, frame)?;
                    let item = match value {
                        Some(value) => self.eval(value, frame)?,
                        None => Value::None,
                    };
                    table.insert_value(key, item)?;
                    meter::check_available(table.len() * std::mem::size_of::<Value>() * 3)
                }
            };
        };
        if generator.is_async {
            return Err(not_supported("async for"));
        }
        let iterable = self.eval(&generator.iter, frame)?;
        let mut iter = iterate(&iterable)?;
        while let Some(item) = iter.next()? {
            self.checkpoint()?;
            self.assign(&generator.target, item, frame)?;
            let mut keep = true;
            for condition in &generator.ifs {
                if !self.eval(condition, frame)?.truthy() {
                    keep = false;
                    break;
                }
            }
            if keep {
                self.comp_level(rest, element, value, frame, sink)?;
            }
        }
        Ok(())
    }

    // Calls

    pub(super) fn call(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Eval<Value> {
        match callee {
            Value::Function(function) => self.call_function(function, args, kwargs),
            Value::Builtin(primitive) => builtins::call(self, *primitive, args, kwargs),
            Value::Method(method) => {
                methods::call(self, &method.receiver, &method.name, args, kwargs)
            }
            Value::ExceptionType(kind) => {
                if !kwargs.is_empty() {
                    return Err(type_error(format!(
                        "{}() takes no keyword arguments",
                        kind
                    )));
                }
                let message = match args.as_slice() {
                    [] => String::new(),
                    [single] => single.to_str(),
                    _ => Value::new_tuple(args)?.repr(),
                };
                Ok(Value::Exception(Rc::new(Exception::new(*kind, message))))
            }
            other => Err(type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(
        &mut self,
        function: &Rc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Eval<Value> {
        self.checkpoint()?;
        if self.depth >= self.recursion_limit {
            return Err(Exception::new(
                "RecursionError",
                "maximum recursion depth exceeded",
            ));
        }
        let vars = bind_params(function, args, kwargs)?;
        let frame = Rc::new(Frame {
            vars: RefCell::new(vars),
            parent: function.closure.clone(),
        });
        self.depth += 1;
        let result = match &function.code {
            Code::Def(def) => self.exec_block(&def.body, &frame).map(|flow| match flow {
                Flow::Return(value) => value,
                _ => Value::None,
            }),
            Code::Lambda(lambda) => self.eval(&lambda.body, &frame),
        };
        self.depth -= 1;
        result
    }

    // Subscripts and attributes

    fn slice_bounds(
        &mut self,
        lower: &Option<Box<Expr>>,
        upper: &Option<Box<Expr>>,
        step: &Option<Box<Expr>>,
        scope: &Rc<Frame>,
    ) -> Eval<[Option<i64>; 3]> {
        let mut bounds = [None; 3];
        for (slot, bound) in bounds.iter_mut().zip([lower, upper, step]) {
            let Some(bound) = bound else { continue };
            match self.eval(bound, scope)? {
                Value::None => {}
                value => {
                    *slot = Some(value.as_int().ok_or_else(|| {
                        type_error("slice indices must be integers or None")
                    })?);
                }
            }
        }
        Ok(bounds)
    }

    fn get_slice(&mut self, container: &Value, [lower, upper, step]: [Option<i64>; 3]) -> Eval<Value> {
        match container {
            Value::List(list) => {
                let items = list.borrow();
                let spec = SliceSpec::resolve(items.len(), lower, upper, step)?;
                let picked = spec.indices().map(|i| items[i].clone()).collect();
                drop(items);
                Value::new_list(picked)
            }
            Value::Tuple(tuple) => {
                let items = tuple.items();
                let spec = SliceSpec::resolve(items.len(), lower, upper, step)?;
                Value::new_tuple(spec.indices().map(|i| items[i].clone()).collect())
            }
            Value::Str(text) => {
                let chars: Vec<char> = text.as_str().chars().collect();
                let spec = SliceSpec::resolve(chars.len(), lower, upper, step)?;
                Value::new_str(spec.indices().map(|i| chars[i]).collect::<String>())
            }
            Value::Bytes(bytes) => {
                let spec = SliceSpec::resolve(bytes.len(), lower, upper, step)?;
                let picked: Vec<u8> = spec.indices().map(|i| bytes[i]).collect();
                Ok(Value::Bytes(Rc::from(picked)))
            }
            Value::Range(range) => {
                let spec = SliceSpec::resolve(range.len(), lower, upper, step)?;
                let at = |index: i64| {
                    index
                        .checked_mul(range.step)
                        .and_then(|offset| offset.checked_add(range.start))
                };
                match (at(spec.start), at(spec.stop), range.step.checked_mul(spec.step)) {
                    (Some(start), Some(stop), Some(step)) => {
                        Ok(Value::Range(RangeValue { start, stop, step }))
                    }
                    _ => Err(overflow_error()),
                }
            }
            other => Err(type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    pub(super) fn get_item(&mut self, container: &Value, index: &Value) -> Eval<Value> {
        match container {
            Value::List(list) => {
                let items = list.borrow();
                normalize_index(index_of(index, "list")?, items.len())
                    .map(|i| items[i].clone())
                    .ok_or_else(|| index_error("list index out of range"))
            }
            Value::Tuple(tuple) => {
                let items = tuple.items();
                normalize_index(index_of(index, "tuple")?, items.len())
                    .map(|i| items[i].clone())
                    .ok_or_else(|| index_error("tuple index out of range"))
            }
            Value::Str(text) => {
                let index = index_of(index, "string")?;
                let text = text.as_str();
                let ch = if text.is_ascii() {
                    normalize_index(index, text.len()).map(|i| char::from(text.as_bytes()[i]))
                } else {
                    let count = text.chars().count();
                    normalize_index(index, count).and_then(|i| text.chars().nth(i))
                };
                match ch {
                    Some(ch) => Value::new_str(ch.to_string()),
                    None => Err(index_error("string index out of range")),
                }
            }
            Value::Bytes(bytes) => normalize_index(index_of(index, "byte")?, bytes.len())
                .map(|i| Value::Int(i64::from(bytes[i])))
                .ok_or_else(|| index_error("index out of range")),
            Value::Range(range) => normalize_index(index_of(index, "range")?, range.len())
                .and_then(|i| range.get(i))
                .map(Value::Int)
                .ok_or_else(|| index_error("range object index out of range")),
            Value::Dict(dict) => {
                let hash = index.hash_key()?;
                dict.borrow()
                    .get(&hash)
                    .cloned()
                    .ok_or_else(|| Exception::new("KeyError", index.repr()))
            }
            other => Err(type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn set_item(&mut self, container: &Value, index: Value, value: Value) -> Eval<()> {
        match container {
            Value::List(list) => {
                let position = index_of(&index, "list")?;
                let mut items = list.borrow_mut();
                let Some(i) = normalize_index(position, items.len()) else {
                    return Err(index_error("list assignment index out of range"));
                };
                let previous = std::mem::replace(&mut items[i], value);
                drop(items);
                drop(previous);
                Ok(())
            }
            Value::Dict(dict) => {
                let hash = index.hash_key()?;
                dict.borrow_mut().insert(hash, index, value);
                dict.recharge()
            }
            other => Err(type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn set_slice(&mut self, container: &Value, [lower, upper, step]: [Option<i64>; 3], value: Value) -> Eval<()> {
        let Value::List(list) = container else {
            return Err(type_error(format!(
                "'{}' object does not support item assignment",
                container.type_name()
            )));
        };
        let replacement = self.collect(&value)?;
        let len = list.borrow().len();
        let spec = SliceSpec::resolve(len, lower, upper, step)?;
        if spec.step == 1 {
            let start = spec.start as usize;
            let stop = spec.stop.max(spec.start) as usize;
            let removed: Vec<Value> = list.borrow_mut().splice(start..stop, replacement).collect();
            drop(removed);
        } else {
            let indices: Vec<usize> = spec.indices().collect();
            if indices.len() != replacement.len() {
                return Err(value_error(format!(
                    "attempt to assign sequence of size {} to extended slice of size {}",
                    replacement.len(),
                    indices.len()
                )));
            }
            let mut previous = Vec::with_capacity(indices.len());
            {
                let mut items = list.borrow_mut();
                for (i, item) in indices.into_iter().zip(replacement) {
                    previous.push(std::mem::replace(&mut items[i], item));
                }
            }
            drop(previous);
        }
        list.recharge()
    }

    fn delete_item(&mut self, container: &Value, index: &Value) -> Eval<()> {
        match container {
            Value::List(list) => {
                let position = index_of(index, "list")?;
                let len = list.borrow().len();
                let Some(i) = normalize_index(position, len) else {
                    return Err(index_error("list assignment index out of range"));
                };
                let removed = list.borrow_mut().remove(i);
                drop(removed);
                list.recharge()
            }
            Value::Dict(dict) => {
                let removed = dict.borrow_mut().remove(&index.hash_key()?);
                match removed {
                    Some(entry) => {
                        drop(entry);
                        dict.recharge()
                    }
                    None => Err(Exception::new("KeyError", index.repr())),
                }
            }
            other => Err(type_error(format!(
                "'{}' object doesn't support item deletion",
                other.type_name()
            ))),
        }
    }

    fn delete_slice(&mut self, container: &Value, [lower, upper, step]: [Option<i64>; 3]) -> Eval<()> {
        let Value::List(list) = container else {
            return Err(type_error(format!(
                "'{}' object doesn't support item deletion",
                container.type_name()
            )));
        };
        let len = list.borrow().len();
        let spec = SliceSpec::resolve(len, lower, upper, step)?;
        let mut indices: Vec<usize> = spec.indices().collect();
        indices.sort_unstable();
        let mut removed = Vec::with_capacity(indices.len());
        {
            let mut items = list.borrow_mut();
            for i in indices.into_iter().rev() {
                removed.push(items.remove(i));
            }
        }
        drop(removed);
        list.recharge()
    }

    fn get_attribute(&mut self, value: &Value, attr: &str) -> Eval<Value> {
        match (value, attr) {
            (Value::Exception(exception), "args") => {
                if exception.message.is_empty() {
                    Value::new_tuple(Vec::new())
                } else {
                    Value::new_tuple(vec![Value::new_str(exception.message.clone())?])
                }
            }
            (Value::Range(range), "start") => Ok(Value::Int(range.start)),
            (Value::Range(range), "stop") => Ok(Value::Int(range.stop)),
            (Value::Range(range), "step") => Ok(Value::Int(range.step)),
            (Value::Function(function), "__name__") => Value::new_str(function.name.clone()),
            _ if methods::has_method(value, attr) => Ok(Value::Method(Rc::new(BoundMethod {
                receiver: value.clone(),
                name: attr.to_string(),
            }))),
            _ => Err(no_attribute(value, attr)),
        }
    }
}

fn store(scope: &Rc<Frame>, name: &str, value: Value) {
    let previous = scope.vars.borrow_mut().insert(name.to_string(), value);
    drop(previous);
}

fn import_error(module: &str) -> Exception {
    Exception::new(
        "ImportError",
        format!("import of '{}' is not available in the sandbox", module),
    )
}

fn constant_value(constant: &Constant) -> Eval<Value> {
    Ok(match constant {
        Constant::None => Value::None,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::BigInt(_) => {
            return Err(Exception::new(
                "OverflowError",
                "integer literal is too large for the sandbox",
            ))
        }
        Constant::Float(f) => Value::Float(*f),
        Constant::Imaginary(_) => return Err(not_supported("complex number")),
        Constant::Str(text) => return Value::new_str(text.clone()),
        Constant::Bytes(bytes) => Value::Bytes(Rc::from(bytes.as_slice())),
        Constant::Ellipsis => Value::Ellipsis,
    })
}

fn bind_params(
    function: &Function,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Eval<HashMap<String, Value>> {
    let params = function.code.params();
    let name = &function.name;
    let mut vars = HashMap::new();

    let given = args.len();
    let mut args = args.into_iter();
    for param in &params.positional {
        match args.next() {
            Some(arg) => {
                vars.insert(param.name.clone(), arg);
            }
            None => break,
        }
    }
    let extra: Vec<Value> = args.collect();
    match &params.vararg {
        Some(vararg) => {
            vars.insert(vararg.name.clone(), Value::new_tuple(extra)?);
        }
        None if !extra.is_empty() => {
            return Err(type_error(format!(
                "{}() takes {} positional argument{} but {} {} given",
                name,
                params.positional.len(),
                if params.positional.len() == 1 { "" } else { "s" },
                given,
                if given == 1 { "was" } else { "were" }
            )));
        }
        None => {}
    }

    let mut extra_kwargs = Table::default();
    for (key, value) in kwargs {
        let named = params
            .positional
            .iter()
            .chain(params.kwonly.iter())
            .any(|param| param.name == key);
        if named {
            if vars.contains_key(&key) {
                return Err(type_error(format!(
                    "{}() got multiple values for argument '{}'",
                    name, key
                )));
            }
            vars.insert(key, value);
        } else if params.kwarg.is_some() {
            extra_kwargs.insert_value(Value::new_str(key)?, value)?;
        } else {
            return Err(type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                name, key
            )));
        }
    }

    let mut missing = Vec::new();
    for param in params.positional.iter().chain(params.kwonly.iter()) {
        if vars.contains_key(&param.name) {
            continue;
        }
        match function.defaults.get(&param.name) {
            Some(default) => {
                vars.insert(param.name.clone(), default.clone());
            }
            None => missing.push(format!("'{}'", param.name)),
        }
    }
    if !missing.is_empty() {
        return Err(type_error(format!(
            "{}() missing {} required argument{}: {}",
            name,
            missing.len(),
            if missing.len() == 1 { "" } else { "s" },
            missing.join(", ")
        )));
    }

    if let Some(kwarg) = &params.kwarg {
        vars.insert(kwarg.name.clone(), Value::new_dict(extra_kwargs)?);
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{SecureExecutionEnvironment, SAFE_PRIMITIVES};
    use crate::lang::parse_module;
    use serde_json::json;

    fn run_with(source: &str, limits: EvaluationLimits) -> (Evaluation, Arc<InterpreterControl>) {
        let module = Arc::new(parse_module(source).unwrap());
        let namespace = SecureExecutionEnvironment::new().build(SAFE_PRIMITIVES);
        let control = Arc::new(InterpreterControl::new());
        let evaluation = spawn(module, namespace, limits, control.clone())
            .unwrap()
            .blocking_recv()
            .unwrap();
        (evaluation, control)
    }

    fn run(source: &str) -> Evaluation {
        run_with(source, EvaluationLimits::default()).0
    }

    fn error_kind(evaluation: &Evaluation) -> Option<&str> {
        evaluation.error.as_ref().map(|error| error.kind.as_str())
    }

    #[test]
    fn test_trailing_expression_is_return_value() {
        let evaluation = run("1 + 2");
        assert!(evaluation.is_success());
        assert_eq!(evaluation.return_value, Some(json!(3)));

        let evaluation = run("x = 5\nprint(x)");
        assert_eq!(evaluation.stdout, "5\n");
        assert_eq!(evaluation.return_value, None);
    }

    #[test]
    fn test_functions_closures_and_defaults() {
        let source = "\
def make_adder(n):
    def add(x, scale=1):
        return (x + n) * scale
    return add

add3 = make_adder(3)
[add3(1), add3(2, scale=10), (lambda *xs, **kw: len(xs) + len(kw))(1, 2, a=3)]
";
        let evaluation = run(source);
        assert_eq!(evaluation.return_value, Some(json!([4, 50, 3])));
    }

    #[test]
    fn test_control_flow() {
        let source = "\
total = 0
for i in range(10):
    if i % 2:
        continue
    if i > 6:
        break
    total += i
else:
    total = -1
n = 0
while n < 3:
    n += 1
else:
    n *= 10
(total, n)
";
        assert_eq!(run(source).return_value, Some(json!([12, 30])));
    }

    #[test]
    fn test_exceptions_are_caught_and_reraised() {
        let source = "\
log = []
try:
    {}['missing']
except (ValueError, LookupError) as e:
    log.append('caught ' + repr(e))
finally:
    log.append('finally')
try:
    try:
        raise ValueError('inner')
    except ValueError:
        raise
except Exception as e:
    log.append(str(e))
log
";
        let evaluation = run(source);
        assert_eq!(
            evaluation.return_value,
            Some(json!(["caught KeyError(\"'missing'\")", "finally", "inner"]))
        );
    }

    #[test]
    fn test_uncaught_error_is_rendered() {
        let evaluation = run("x = 1\ny = x / 0");
        let error = evaluation.error.unwrap();
        assert_eq!(error.kind, "ZeroDivisionError");
        assert_eq!(error.line, Some(2));
        assert!(evaluation.stderr.ends_with("ZeroDivisionError: division by zero\n"));
        assert!(evaluation.stderr.contains("<sandbox>"));
    }

    #[test]
    fn test_comprehensions_and_unpacking() {
        let source = "\
pairs = {k: v for k, v in zip('abc', range(3)) if v != 1}
first, *rest = [x * x for x in range(5)]
evens = {x % 4 for x in range(10)}
(pairs, first, rest, sorted(evens), sum(x for x in range(4)))
";
        assert_eq!(
            run(source).return_value,
            Some(json!([{"a": 0, "c": 2}, 0, [1, 4, 9, 16], [0, 1, 2, 3], 6]))
        );
    }

    #[test]
    fn test_slicing() {
        let source = "\
xs = list(range(10))
xs[2:4] = ['a']
del xs[::3]
(xs, 'hello'[::-1], (1, 2, 3)[-2:], range(0, 20, 2)[1:3][1])
";
        assert_eq!(
            run(source).return_value,
            Some(json!([[1, "a", 5, 6, 8, 9], "olleh", [2, 3], 4]))
        );
    }

    #[test]
    fn test_fstrings() {
        let evaluation = run("x = 3.14159\nname = 'ward'\nf'{name!r}: {x:.2f} {x=:.1f} {len(name)=}'");
        assert_eq!(
            evaluation.return_value,
            Some(json!("'ward': 3.14 x=3.1 len(name)=4"))
        );
    }

    #[test]
    fn test_structural_match() {
        let source = "\
def describe(command):
    match command:
        case []:
            return 'empty'
        case ['go', ('north' | 'south') as direction]:
            return 'go ' + direction
        case ['drop', *items] if items:
            return 'drop ' + str(len(items))
        case {'action': 'say', 'text': str(text), **extra}:
            return text + str(len(extra))
        case int(n) if n < 0:
            return 'negative'
        case 0 | 1:
            return 'small'
        case None:
            return 'nothing'
        case (x, y):
            return x + y
        case _:
            return 'other'

def flag(value):
    match value:
        case True:
            return 'true'
        case 1:
            return 'one'

inputs = ([], ['go', 'north'], ['go', 'east'], ['drop'], ['drop', 1, 2],
    {'action': 'say', 'text': 'hi', 'to': 1}, -5, 1, None, (2, 3), 'ab')
([describe(c) for c in inputs], flag(True), flag(1))
";
        assert_eq!(
            run(source).return_value,
            Some(json!([
                [
                    "empty", "go north", "goeast", "other", "drop 2", "hi1", "negative", "small",
                    "nothing", 5, "other"
                ],
                "true",
                "one"
            ]))
        );
    }

    #[test]
    fn test_match_without_matching_case_falls_through() {
        let evaluation = run("match 3:\n    case 1:\n        x = 'one'\nmatch = 'still a name'\nmatch");
        assert!(evaluation.is_success());
        assert_eq!(evaluation.return_value, Some(json!("still a name")));
    }

    #[test]
    fn test_unsupported_constructs() {
        assert_eq!(error_kind(&run("import os")), Some("ImportError"));
        assert_eq!(error_kind(&run("class A:\n    pass")), Some("NotImplementedError"));
        assert_eq!(error_kind(&run("open('x')")), Some("NameError"));
        assert_eq!(error_kind(&run("x = 10 ** 100")), Some("OverflowError"));
    }

    #[test]
    fn test_recursion_limit() {
        let evaluation = run("def f(n):\n    return f(n + 1)\nf(0)");
        assert_eq!(error_kind(&evaluation), Some("RecursionError"));
        assert!(!evaluation.error.unwrap().fatal);
    }

    #[test]
    fn test_memory_ceiling_is_fatal() {
        let limits = EvaluationLimits {
            max_memory: 1024 * 1024,
            ..EvaluationLimits::default()
        };
        let source = "\
try:
    data = [0] * 10_000_000
except MemoryError:
    data = None
data
";
        let (evaluation, control) = run_with(source, limits);
        let error = evaluation.error.unwrap();
        assert_eq!(error.kind, "MemoryError");
        assert!(error.fatal);
        assert!(control.is_finished());
    }

    #[test]
    fn test_output_is_capped() {
        let limits = EvaluationLimits {
            max_output_bytes: 10,
            ..EvaluationLimits::default()
        };
        let (evaluation, _) = run_with("for i in range(100):\n    print(i)", limits);
        assert!(evaluation.is_success());
        assert_eq!(evaluation.stdout.len(), 10);
        assert!(evaluation.output_truncated);
    }

    #[test]
    fn test_interrupt_stops_infinite_loop() {
        let module = Arc::new(parse_module("while True:\n    pass").unwrap());
        let namespace = SecureExecutionEnvironment::new().build(SAFE_PRIMITIVES);
        let control = Arc::new(InterpreterControl::new());
        let receiver = spawn(
            module,
            namespace,
            EvaluationLimits::default(),
            control.clone(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        control.interrupt(InterruptReason::Timeout);
        control.interrupt(InterruptReason::Terminated);
        let evaluation = receiver.blocking_recv().unwrap();
        let error = evaluation.error.unwrap();
        assert_eq!(error.kind, "KeyboardInterrupt");
        assert!(error.fatal);
        assert_eq!(control.reason(), Some(InterruptReason::Timeout));
    }

    #[test]
    fn test_sentinels_hide_host_identity() {
        assert_eq!(
            run("(__name__, __file__)").return_value,
            Some(json!(["__sandbox__", "<sandbox>"]))
        );
    }

    #[test]
    fn test_slice_spec_matches_python() {
        let spec = SliceSpec::resolve(5, None, None, Some(-1)).unwrap();
        assert_eq!(spec.indices().collect::<Vec<_>>(), vec![4, 3, 2, 1, 0]);
        let spec = SliceSpec::resolve(5, Some(-100), Some(100), Some(2)).unwrap();
        assert_eq!(spec.indices().collect::<Vec<_>>(), vec![0, 2, 4]);
        assert!(SliceSpec::resolve(5, None, None, Some(0)).is_err());
    }

    #[test]
    fn test_builtin_catalog() {
        let source = "\
print(sorted([3, 1, 2], reverse=True), max([4, 9, 2]), min('bca'))
print(sum(range(5)), abs(-3), round(2.675, 2), int('0x1f', 16), float('1e2'))
print(list(enumerate('ab', start=1)), list(zip([1, 2], 'xy')))
print(dict([('a', 1)], b=2), len({1, 2, 2}), divmod(-7, 2), hex(255), chr(65), ord('a'))
sorted(['bb', 'a', 'ccc'], key=len)";
        let evaluation = run(source);
        assert!(evaluation.is_success(), "{:?}", evaluation.error);
        assert_eq!(
            evaluation.stdout,
            "[3, 2, 1] 9 a\n\
10 3 2.67 31 100.0\n\
[(1, 'a'), (2, 'b')] [(1, 'x'), (2, 'y')]\n\
{'a': 1, 'b': 2} 2 (-4, 1) 0xff A 97\n"
        );
        assert_eq!(evaluation.return_value, Some(json!(["a", "bb", "ccc"])));
    }

    #[test]
    fn test_value_methods() {
        let source = "\
words = 'the Quick brown'.split()
words.append('fox')
words.sort()
counts = {}
for w in words:
    counts[w.lower()] = counts.get(w.lower(), 0) + 1
counts.update(extra=0)
s = {1, 2}
s.add(3)
print('-'.join(words), counts.pop('extra'), sorted(s.union([5])), 'a,b'.partition(','))
print('{}={:>4}'.format('x', 7), '  pad '.strip(), 'ab'.center(6, '*'), '42'.zfill(5))
words.index('zebra')";
        let evaluation = run(source);
        assert_eq!(error_kind(&evaluation), Some("ValueError"));
        assert_eq!(
            evaluation.stdout,
            "Quick-brown-fox-the 0 [1, 2, 3, 5] ('a', ',', 'b')\nx=   7 pad **ab** 00042\n"
        );
    }

    #[test]
    fn test_builtin_errors_are_catchable() {
        let source = "\
try:
    int('nope')
except ValueError as e:
    print('bad:', e)
try:
    sorted([1, 'a'])
except TypeError:
    print('unorderable')
try:
    [].pop()
except IndexError as e:
    print(e)
";
        let evaluation = run(source);
        assert!(evaluation.is_success(), "{:?}", evaluation.error);
        assert_eq!(
            evaluation.stdout,
            "bad: invalid literal for int() with base 10: 'nope'\nunorderable\npop from empty list\n"
        );
    }
}
