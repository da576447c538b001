//! The bytecode dispatch loop.
//!
//! One [`Interpreter`] owns a [`Chunk`], the value stack, the call-frame
//! stack, the global name table, and the heap. `run` drives the loop until
//! the synthetic top-level frame executes `RETURN`.

use std::collections::HashMap;

use lumen_core::{Builtin, Chunk, Heap, ObjArray, ObjFunction, ObjHeader, ObjString, OpCode, Value};
use tracing::{debug, trace};

use crate::builtins;
use crate::error::{RuntimeError, Traced};
use crate::frame::CallFrame;
use crate::jit::JitEngine;

const STACK_MAX: usize = 65_536;
const FRAMES_MAX: usize = 1_024;

pub struct Interpreter {
    pub chunk: Chunk,
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<*mut ObjString, Value>,
    jit: JitEngine,
}

type OpResult<T> = Result<T, RuntimeError>;

impl Interpreter {
    pub fn new(chunk: Chunk, heap: Heap, jit: JitEngine) -> Self {
        Interpreter {
            chunk,
            heap,
            stack: Vec::with_capacity(256),
            frames: vec![CallFrame::top_level()],
            globals: HashMap::new(),
            jit,
        }
    }

    /// Like [`Interpreter::new`], but seeds the global table instead of
    /// starting empty. Used by the REPL to carry variables forward into a
    /// freshly compiled chunk: functions cannot be carried this way since
    /// their bytecode offsets are only valid in the chunk they were compiled
    /// into, so callers should filter those out of `globals` first (see
    /// [`Interpreter::exportable_globals`]).
    pub fn resume(chunk: Chunk, heap: Heap, jit: JitEngine, globals: Vec<(*mut ObjString, Value)>) -> Self {
        let mut interp = Self::new(chunk, heap, jit);
        interp.globals.extend(globals);
        interp
    }

    /// Globals safe to carry into a later, independently compiled chunk:
    /// everything except function values, whose `start` offset is only
    /// meaningful against the chunk they were defined in.
    pub fn exportable_globals(&self) -> Vec<(*mut ObjString, Value)> {
        self.globals
            .iter()
            .filter(|(_, v)| !v.is_object() || unsafe { (*v.as_object()).ty } != lumen_core::ObjType::Function)
            .map(|(&k, &v)| (k, v))
            .collect()
    }

    fn push(&mut self, v: Value) -> OpResult<()> {
        if self.stack.len() >= STACK_MAX {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: compiler emitted unbalanced bytecode")
    }

    fn peek(&self, back: usize) -> Value {
        self.stack[self.stack.len() - 1 - back]
    }

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().unwrap();
        self.chunk.line_at(frame.ip)
    }

    fn traced(&self, error: RuntimeError) -> Traced {
        Traced { line: self.current_line(), error }
    }

    /// Every live `Value` the collector must trace: the value stack, each
    /// frame's called function object, and the global table's keys/values.
    fn gc_roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = self.stack.clone();
        roots.extend(self.chunk.constants.iter().copied());
        for frame in &self.frames {
            if let Some(f) = frame.function {
                roots.push(Value::object(f as *mut ObjHeader));
            }
        }
        for (&key, &value) in &self.globals {
            roots.push(Value::object(key as *mut ObjHeader));
            roots.push(value);
        }
        roots
    }

    fn collect_if_needed(&mut self) {
        if self.heap.should_collect() {
            let roots = self.gc_roots();
            self.heap.collect(roots);
        }
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let b = self.chunk.code[frame.ip];
        frame.ip += 1;
        b
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().unwrap();
        let v = self.chunk.read_u16(frame.ip);
        frame.ip += 2;
        v
    }

    fn read_constant(&mut self, idx: usize) -> Value {
        self.chunk.constants[idx]
    }

    fn read_string(&mut self, idx: usize) -> *mut ObjString {
        let v = self.read_constant(idx);
        v.as_object() as *mut ObjString
    }

    /// Runs until the top-level frame's `RETURN` fires, or an error occurs.
    pub fn run(&mut self) -> Result<(), Traced> {
        loop {
            let ip = self.frames.last().unwrap().ip;
            let op = OpCode::from_u8(self.chunk.code[ip]);
            self.frames.last_mut().unwrap().ip += 1;

            match self.step(op) {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Halt) => return Ok(()),
                Err(e) => return Err(self.traced(e)),
            }
        }
    }

    fn step(&mut self, op: OpCode) -> OpResult<StepOutcome> {
        match op {
            OpCode::Const => {
                let idx = self.read_u8() as usize;
                let v = self.read_constant(idx);
                self.push(v)?;
            }
            OpCode::ConstLong => {
                let idx = self.read_u16() as usize;
                let v = self.read_constant(idx);
                self.push(v)?;
            }
            OpCode::Const0 => self.push(Value::int(0))?,
            OpCode::Const1 => self.push(Value::int(1))?,
            OpCode::Const2 => self.push(Value::int(2))?,
            OpCode::Nil => self.push(Value::NIL)?,
            OpCode::True => self.push(Value::TRUE)?,
            OpCode::False => self.push(Value::FALSE)?,
            OpCode::Pop => {
                self.pop();
            }
            OpCode::PopN => {
                let n = self.read_u8() as usize;
                self.stack.truncate(self.stack.len() - n);
            }
            OpCode::Dup => {
                let v = self.peek(0);
                self.push(v)?;
            }

            OpCode::GetLocal => {
                let slot = self.read_u8() as usize;
                let base = self.frames.last().unwrap().base;
                self.push(self.stack[base + slot])?;
            }
            OpCode::GetLocal0 | OpCode::GetLocal1 | OpCode::GetLocal2 | OpCode::GetLocal3 => {
                let slot = (op as u8 - OpCode::GetLocal0 as u8) as usize;
                let base = self.frames.last().unwrap().base;
                self.push(self.stack[base + slot])?;
            }
            OpCode::SetLocal => {
                let slot = self.read_u8() as usize;
                let base = self.frames.last().unwrap().base;
                self.stack[base + slot] = self.peek(0);
            }
            OpCode::GetGlobal => {
                let idx = self.read_u8() as usize;
                let name = self.read_string(idx);
                match self.globals.get(&name) {
                    Some(&v) => self.push(v)?,
                    None => return Err(RuntimeError::UndefinedGlobal(unsafe { (*name).chars.to_string() })),
                }
            }
            OpCode::SetGlobal => {
                let idx = self.read_u8() as usize;
                let name = self.read_string(idx);
                self.globals.insert(name, self.peek(0));
            }

            OpCode::Add => self.add()?,
            OpCode::Sub => self.numeric_binop("sub", |a, b| a - b, |a, b| a.checked_sub(b))?,
            OpCode::Mul => self.numeric_binop("mul", |a, b| a * b, |a, b| a.checked_mul(b))?,
            OpCode::Div => self.div()?,
            OpCode::Mod => self.modulo()?,
            OpCode::Neg => self.negate()?,
            OpCode::Not => {
                let v = self.pop();
                self.push(Value::bool(v.is_falsey()))?;
            }
            OpCode::BitAnd => self.int_binop("&", |a, b| a & b)?,
            OpCode::BitOr => self.int_binop("|", |a, b| a | b)?,
            OpCode::BitXor => self.int_binop("^", |a, b| a ^ b)?,
            OpCode::Shl => self.int_binop("<<", |a, b| a.wrapping_shl(b as u32 & 31))?,
            OpCode::Shr => self.int_binop(">>", |a, b| a.wrapping_shr(b as u32 & 31))?,

            OpCode::Eq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::bool(Value::values_equal(a, b)))?;
            }
            OpCode::Neq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::bool(!Value::values_equal(a, b)))?;
            }
            OpCode::Lt => self.compare(|a, b| a < b)?,
            OpCode::Lte => self.compare(|a, b| a <= b)?,
            OpCode::Gt => self.compare(|a, b| a > b)?,
            OpCode::Gte => self.compare(|a, b| a >= b)?,

            OpCode::Add1 => {
                let v = self.pop();
                let r = self.add_one(v)?;
                self.push(r)?;
            }
            OpCode::Sub1 => {
                let v = self.pop();
                let r = self.sub_one(v)?;
                self.push(r)?;
            }

            OpCode::LtJmpFalse => self.fused_compare_jump(|a, b| a < b)?,
            OpCode::LteJmpFalse => self.fused_compare_jump(|a, b| a <= b)?,
            OpCode::GtJmpFalse => self.fused_compare_jump(|a, b| a > b)?,
            OpCode::GteJmpFalse => self.fused_compare_jump(|a, b| a >= b)?,
            OpCode::EqJmpFalse => {
                let b = self.pop();
                let a = self.pop();
                let offset = self.read_u16() as usize;
                if !Value::values_equal(a, b) {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }

            OpCode::Jmp => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip += offset;
            }
            OpCode::JmpFalse => {
                let offset = self.read_u16() as usize;
                let v = self.pop();
                if v.is_falsey() {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            OpCode::JmpTrue => {
                let offset = self.read_u16() as usize;
                let v = self.pop();
                if !v.is_falsey() {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip -= offset;
                self.maybe_trace_loop()?;
            }

            OpCode::Call => {
                let argc = self.read_u8();
                self.call(argc)?;
            }
            OpCode::Return => {
                let result = self.pop();
                let frame = self.frames.pop().unwrap();
                if self.frames.is_empty() {
                    return Ok(StepOutcome::Halt);
                }
                self.stack.truncate(frame.base);
                self.push(result)?;
            }

            OpCode::Array => {
                let count = self.read_u8() as usize;
                let start = self.stack.len() - count;
                let values = self.stack.split_off(start);
                self.collect_if_needed();
                let ptr = self.heap.alloc_array(values);
                self.push(Value::object(ptr as *mut ObjHeader))?;
            }
            OpCode::Index => {
                let index = self.pop();
                let container = self.pop();
                let v = self.index_get(container, index)?;
                self.push(v)?;
            }
            OpCode::IndexSet => {
                let value = self.pop();
                let index = self.pop();
                let container = self.pop();
                self.index_set(container, index, value)?;
                self.push(value)?;
            }
            OpCode::MakeRange => {
                let end = self.pop();
                let start = self.pop();
                let (s, e) = (self.expect_int(start, "range")?, self.expect_int(end, "range")?);
                self.collect_if_needed();
                let ptr = self.heap.alloc_range(s, e);
                self.push(Value::object(ptr as *mut ObjHeader))?;
            }

            OpCode::ForCount => {
                self.for_count()?;
            }
            OpCode::ForLoop => {
                self.for_loop()?;
            }

            OpCode::Builtin => {
                let id = self.read_u8();
                self.dispatch_builtin(Builtin::from_u8(id))?;
            }
        }
        Ok(StepOutcome::Continue)
    }

    // ---- calls -----------------------------------------------------------

    fn call(&mut self, argc: u8) -> OpResult<()> {
        let callee = self.peek(argc as usize);
        if !callee.is_object() {
            return Err(RuntimeError::NotCallable);
        }
        let header = callee.as_object();
        if unsafe { (*header).ty } != lumen_core::ObjType::Function {
            return Err(RuntimeError::NotCallable);
        }
        let func = header as *mut ObjFunction;
        let arity = unsafe { (*func).arity };
        if arity != argc {
            return Err(RuntimeError::WrongArity { expected: arity, got: argc });
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(RuntimeError::StackOverflow);
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame::for_call(func, base));
        Ok(())
    }

    // ---- arithmetic --------------------------------------------------------

    fn expect_number(&self, v: Value, op: &'static str) -> OpResult<()> {
        if !v.is_number() {
            return Err(RuntimeError::TypeMismatch { op, detail: "expected a number".to_string() });
        }
        Ok(())
    }

    fn expect_int(&self, v: Value, op: &'static str) -> OpResult<i32> {
        if v.is_int() {
            Ok(v.as_int())
        } else if v.is_double() {
            Ok(v.as_double() as i32)
        } else {
            Err(RuntimeError::TypeMismatch { op, detail: "expected an integer".to_string() })
        }
    }

    /// `+` concatenates when either operand is a string, otherwise adds
    /// numerically. This is the house answer to the spec's Open Question
    /// (ii): any non-string operand is rendered via [`builtins::display`]
    /// before concatenation, so `"x=" + 1` is legal and produces `"x=1"`.
    fn add(&mut self) -> OpResult<()> {
        let b = self.pop();
        let a = self.pop();
        if self.is_string(a) || self.is_string(b) {
            let sa = self.display(a);
            let sb = self.display(b);
            self.collect_if_needed();
            let ptr = self.heap.intern(&(sa + &sb));
            return self.push(Value::object(ptr as *mut ObjHeader));
        }
        self.expect_number(a, "add")?;
        self.expect_number(b, "add")?;
        let result = if a.is_int() && b.is_int() {
            match a.as_int().checked_add(b.as_int()) {
                Some(sum) => Value::int(sum),
                None => Value::double(a.as_int() as f64 + b.as_int() as f64),
            }
        } else {
            Value::double(a.as_f64_lossy() + b.as_f64_lossy())
        };
        self.push(result)
    }

    fn add_one(&mut self, v: Value) -> OpResult<Value> {
        self.expect_number(v, "add")?;
        if v.is_int() {
            Ok(match v.as_int().checked_add(1) {
                Some(sum) => Value::int(sum),
                None => Value::double(v.as_int() as f64 + 1.0),
            })
        } else {
            Ok(Value::double(v.as_double() + 1.0))
        }
    }

    fn sub_one(&mut self, v: Value) -> OpResult<Value> {
        self.expect_number(v, "sub")?;
        if v.is_int() {
            Ok(match v.as_int().checked_sub(1) {
                Some(diff) => Value::int(diff),
                None => Value::double(v.as_int() as f64 - 1.0),
            })
        } else {
            Ok(Value::double(v.as_double() - 1.0))
        }
    }

    /// Shared shape for `-`/`*`: `int_op` is tried first and only promotes to
    /// `double_op` on overflow or a non-int operand.
    fn numeric_binop(
        &mut self,
        op: &'static str,
        double_op: impl Fn(f64, f64) -> f64,
        int_op: impl Fn(i32, i32) -> Option<i32>,
    ) -> OpResult<()> {
        let b = self.pop();
        let a = self.pop();
        self.expect_number(a, op)?;
        self.expect_number(b, op)?;
        let result = if a.is_int() && b.is_int() {
            match int_op(a.as_int(), b.as_int()) {
                Some(v) => Value::int(v),
                None => Value::double(double_op(a.as_int() as f64, b.as_int() as f64)),
            }
        } else {
            Value::double(double_op(a.as_f64_lossy(), b.as_f64_lossy()))
        };
        self.push(result)
    }

    /// True division: exact only when both operands are int and evenly
    /// divide, otherwise a double.
    fn div(&mut self) -> OpResult<()> {
        let b = self.pop();
        let a = self.pop();
        self.expect_number(a, "div")?;
        self.expect_number(b, "div")?;
        if b.as_f64_lossy() == 0.0 {
            return Err(RuntimeError::DivisionByZero);
        }
        let result = if a.is_int() && b.is_int() && a.as_int() % b.as_int() == 0 {
            Value::int(a.as_int() / b.as_int())
        } else {
            Value::double(a.as_f64_lossy() / b.as_f64_lossy())
        };
        self.push(result)
    }

    /// Truncated-remainder, on the operands coerced to `i32`.
    fn modulo(&mut self) -> OpResult<()> {
        let b = self.pop();
        let a = self.pop();
        let ai = self.expect_int(a, "mod")?;
        let bi = self.expect_int(b, "mod")?;
        if bi == 0 {
            return Err(RuntimeError::DivisionByZero);
        }
        self.push(Value::int(ai.wrapping_rem(bi)))
    }

    fn negate(&mut self) -> OpResult<()> {
        let v = self.pop();
        self.expect_number(v, "neg")?;
        let result = if v.is_int() {
            match v.as_int().checked_neg() {
                Some(n) => Value::int(n),
                None => Value::double(-(v.as_int() as f64)),
            }
        } else {
            Value::double(-v.as_double())
        };
        self.push(result)
    }

    fn int_binop(&mut self, op: &'static str, f: impl Fn(i32, i32) -> i32) -> OpResult<()> {
        let b = self.pop();
        let a = self.pop();
        let ai = self.expect_int(a, op)?;
        let bi = self.expect_int(b, op)?;
        self.push(Value::int(f(ai, bi)))
    }

    /// Comparisons beyond `==`/`!=` are numeric only (Open Question (i)):
    /// a mismatched or non-numeric pair is a runtime type error rather than
    /// a silent `false`, so programs cannot accidentally depend on an
    /// unspecified total order across types.
    fn compare(&mut self, f: impl Fn(f64, f64) -> bool) -> OpResult<()> {
        let b = self.pop();
        let a = self.pop();
        self.expect_number(a, "compare")?;
        self.expect_number(b, "compare")?;
        self.push(Value::bool(f(a.as_f64_lossy(), b.as_f64_lossy())))
    }

    fn fused_compare_jump(&mut self, f: impl Fn(f64, f64) -> bool) -> OpResult<()> {
        let b = self.pop();
        let a = self.pop();
        self.expect_number(a, "compare")?;
        self.expect_number(b, "compare")?;
        let offset = self.read_u16() as usize;
        if !f(a.as_f64_lossy(), b.as_f64_lossy()) {
            self.frames.last_mut().unwrap().ip += offset;
        }
        Ok(())
    }

    // ---- aggregates --------------------------------------------------------

    fn is_string(&self, v: Value) -> bool {
        v.is_object() && unsafe { (*v.as_object()).ty } == lumen_core::ObjType::String
    }

    pub(crate) fn display(&self, v: Value) -> String {
        builtins::display(v)
    }

    fn index_get(&mut self, container: Value, index: Value) -> OpResult<Value> {
        if !container.is_object() {
            return Err(RuntimeError::NotIndexable("non-object"));
        }
        let header = container.as_object();
        match unsafe { (*header).ty } {
            lumen_core::ObjType::Array => {
                let arr = header as *mut ObjArray;
                let len = unsafe { (*arr).values.len() };
                let i = self.normalize_index(index, len)?;
                Ok(unsafe { (&(*arr).values)[i] })
            }
            lumen_core::ObjType::Bytes => {
                let bytes = header as *mut lumen_core::ObjBytes;
                let len = unsafe { (*bytes).data.len() };
                let i = self.normalize_index(index, len)?;
                Ok(Value::int(unsafe { (&(*bytes).data)[i] } as i32))
            }
            lumen_core::ObjType::Dict => {
                let dict = header as *mut lumen_core::ObjDict;
                if !self.is_string(index) {
                    return Err(RuntimeError::TypeMismatch { op: "index", detail: "dict keys must be strings".to_string() });
                }
                let key = index.as_object() as *mut ObjString;
                let hash = unsafe { (*key).hash };
                unsafe { (*dict).get(key, hash) }.ok_or(RuntimeError::IndexOutOfBounds { index: 0, len: 0 })
            }
            lumen_core::ObjType::String => {
                let s = header as *mut ObjString;
                let chars: Vec<char> = unsafe { (*s).chars.chars().collect() };
                let i = self.normalize_index(index, chars.len())?;
                self.collect_if_needed();
                let ptr = self.heap.intern(&chars[i].to_string());
                Ok(Value::object(ptr as *mut ObjHeader))
            }
            lumen_core::ObjType::Range => Err(RuntimeError::NotIndexable("range")),
            lumen_core::ObjType::Function => Err(RuntimeError::NotIndexable("function")),
        }
    }

    fn index_set(&mut self, container: Value, index: Value, value: Value) -> OpResult<()> {
        if !container.is_object() {
            return Err(RuntimeError::NotIndexable("non-object"));
        }
        let header = container.as_object();
        match unsafe { (*header).ty } {
            lumen_core::ObjType::Array => {
                let arr = header as *mut ObjArray;
                let len = unsafe { (*arr).values.len() };
                let i = self.normalize_index(index, len)?;
                unsafe { (&mut (*arr).values)[i] = value };
                Ok(())
            }
            lumen_core::ObjType::Dict => {
                let dict = header as *mut lumen_core::ObjDict;
                if !self.is_string(index) {
                    return Err(RuntimeError::TypeMismatch { op: "index", detail: "dict keys must be strings".to_string() });
                }
                let key = index.as_object() as *mut ObjString;
                unsafe { (*dict).insert(key, value) };
                Ok(())
            }
            _ => Err(RuntimeError::NotIndexable("value does not support index assignment")),
        }
    }

    fn normalize_index(&self, index: Value, len: usize) -> OpResult<usize> {
        if !index.is_int() {
            return Err(RuntimeError::TypeMismatch { op: "index", detail: "index must be an integer".to_string() });
        }
        let raw = index.as_int() as i64;
        let resolved = if raw < 0 { raw + len as i64 } else { raw };
        if resolved < 0 || resolved as usize >= len {
            return Err(RuntimeError::IndexOutOfBounds { index: raw, len });
        }
        Ok(resolved as usize)
    }

    // ---- iteration -----------------------------------------------------------

    fn for_count(&mut self) -> OpResult<()> {
        let counter_slot = self.read_u8();
        let end_slot = self.read_u8();
        let var_slot = self.read_u8();
        let offset = self.read_u16() as usize;
        let base = self.frames.last().unwrap().base;

        let counter = self.expect_int(self.stack[base + counter_slot as usize], "for")?;
        let end = self.expect_int(self.stack[base + end_slot as usize], "for")?;
        if counter >= end {
            self.frames.last_mut().unwrap().ip += offset;
            return Ok(());
        }
        self.stack[base + var_slot as usize] = Value::int(counter);
        self.stack[base + counter_slot as usize] = Value::int(counter + 1);
        Ok(())
    }

    fn for_loop(&mut self) -> OpResult<()> {
        let iterable_slot = self.read_u8();
        let index_slot = self.read_u8();
        let var_slot = self.read_u8();
        let offset = self.read_u16() as usize;
        let base = self.frames.last().unwrap().base;

        let iterable = self.stack[base + iterable_slot as usize];
        let index = self.expect_int(self.stack[base + index_slot as usize], "for")?;
        let len = self.iterable_len(iterable)?;
        if index as usize >= len {
            self.frames.last_mut().unwrap().ip += offset;
            return Ok(());
        }
        let item = self.index_get(iterable, Value::int(index))?;
        self.stack[base + var_slot as usize] = item;
        self.stack[base + index_slot as usize] = Value::int(index + 1);
        Ok(())
    }

    fn iterable_len(&self, v: Value) -> OpResult<usize> {
        if !v.is_object() {
            return Err(RuntimeError::NotIndexable("non-object"));
        }
        let header = v.as_object();
        match unsafe { (*header).ty } {
            lumen_core::ObjType::Array => Ok(unsafe { (*(header as *mut ObjArray)).values.len() }),
            lumen_core::ObjType::Bytes => Ok(unsafe { (*(header as *mut lumen_core::ObjBytes)).data.len() }),
            lumen_core::ObjType::String => Ok(unsafe { (*(header as *mut ObjString)).chars.chars().count() }),
            lumen_core::ObjType::Range => {
                let r = header as *mut lumen_core::ObjRange;
                Ok(unsafe { ((*r).end - (*r).start).max(0) as usize })
            }
            _ => Err(RuntimeError::NotIndexable("value is not iterable")),
        }
    }

    // ---- built-ins ---------------------------------------------------------

    fn dispatch_builtin(&mut self, builtin: Builtin) -> OpResult<()> {
        let (_, _, arity) =
            *Builtin::TABLE.iter().find(|(_, b, _)| *b == builtin).expect("builtin opcode has a table entry");
        let start = self.stack.len() - arity as usize;
        let args = self.stack.split_off(start);
        self.collect_if_needed();
        let result = builtins::call(builtin, &args, &mut self.heap)?;
        self.push(result)
    }

    // ---- JIT hook -----------------------------------------------------------

    /// Called right after `LOOP` rewinds the instruction pointer: if it
    /// landed on a `FOR_COUNT` header, let the JIT engine decide whether to
    /// record, compile, or run a cached native trace for the rest of this
    /// loop's iterations.
    fn maybe_trace_loop(&mut self) -> OpResult<()> {
        let frame = self.frames.last().unwrap();
        let offset = frame.ip;
        let base = frame.base;
        if OpCode::from_u8(self.chunk.code[offset]) != OpCode::ForCount {
            return Ok(());
        }
        let counter_slot = self.chunk.code[offset + 1];
        let end_slot = self.chunk.code[offset + 2];
        let var_slot = self.chunk.code[offset + 3];
        match self.jit.on_for_count(offset, &self.chunk, &mut self.stack, base, counter_slot, end_slot, var_slot) {
            Some(final_counter) => {
                debug!(offset, final_counter, "trace ran loop to completion natively");
                let exit_target = offset + 6 + self.chunk.read_u16(offset + 4) as usize;
                self.frames.last_mut().unwrap().ip = exit_target;
            }
            None => trace!(offset, "loop header not (yet) traced"),
        }
        Ok(())
    }
}

enum StepOutcome {
    Continue,
    Halt,
}
