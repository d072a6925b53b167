//! Stack-based virtual machine
//!
//! A frame-stack interpreter over the bytecode in `bytecode.rs`. The VM
//! owns all runtime state: the value stack, call frames, the globals
//! table, the open-upvalue list, and the heap. Compilation runs to
//! completion before execution begins; the dispatch loop knows nothing
//! about the compiler.

use std::io::Write;
use std::rc::Rc;
use std::time::Instant;

use crate::bytecode::{Chunk, OpCode};
use crate::compiler::compile;
use crate::error::{Error, RuntimeError};
use crate::gc::{Handle, Heap, Upvalue};
use crate::table::Table;
use crate::value::{Native, NativeFn, Value};

/// Maximum call depth
pub const FRAMES_MAX: usize = 64;

/// Maximum stack size: one full window of locals per frame
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// A call frame: the closure being executed, an instruction pointer into
/// its chunk, and the stack slot holding the callee (slot 0 of the frame).
/// The chunk is cached out of the function so dispatch never touches the
/// heap.
struct CallFrame {
    closure: Handle,
    chunk: Rc<Chunk>,
    ip: usize,
    slot: usize,
}

/// The virtual machine
pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,

    /// Upvalues still aliasing live stack slots, sorted by descending
    /// slot index
    open_upvalues: Vec<Handle>,

    pub heap: Heap,

    /// Interned `"init"`, looked up on every class call
    init_string: Handle,

    started: Instant,
    out: Box<dyn Write>,
}

impl VM {
    pub fn new() -> Self {
        Self::with_output(Box::new(std::io::stdout()))
    }

    /// Build a VM whose `print`/`println` natives write to `out`
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            heap,
            init_string,
            started: Instant::now(),
            out,
        };
        vm.define_natives();
        vm
    }

    /// Collect on every instruction dispatch; for exercising the GC
    pub fn set_gc_stress(&mut self, on: bool) {
        self.heap.stress = on;
    }

    /// Install a global binding to a native function
    pub fn define_native(&mut self, name: &str, arity: Option<usize>, function: NativeFn) {
        let handle = self.heap.intern(name);
        let hash = self.heap.string_hash(handle);
        self.globals
            .set(handle, hash, Value::Native(Native { function, arity }));
    }

    fn define_natives(&mut self) {
        // clock() -> seconds since the interpreter started
        self.define_native("clock", Some(0), |vm, _args| {
            Ok(Value::Number(vm.started.elapsed().as_secs_f64()))
        });

        // print(...) -> nil, no separator, no newline
        self.define_native("print", None, |vm, args| {
            let text: String = args.iter().map(|value| value.display(&vm.heap)).collect();
            let _ = write!(vm.out, "{}", text);
            let _ = vm.out.flush();
            Ok(Value::Nil)
        });

        // println(...) -> nil, as print plus a newline
        self.define_native("println", None, |vm, args| {
            let text: String = args.iter().map(|value| value.display(&vm.heap)).collect();
            let _ = writeln!(vm.out, "{}", text);
            let _ = vm.out.flush();
            Ok(Value::Nil)
        });
    }

    /// Compile and execute one source program. Compile diagnostics have
    /// already been printed when this returns `Error::Compile`; runtime
    /// errors print their message and a stack trace before the stack is
    /// reset.
    pub fn interpret(&mut self, source: &str) -> Result<(), Error> {
        let script = compile(source, &mut self.heap).ok_or(Error::Compile)?;

        let chunk = Rc::clone(
            &self
                .heap
                .get_function(script)
                .expect("script function")
                .chunk,
        );
        let closure = self.heap.alloc_closure(script, Vec::new());
        self.stack.push(Value::Closure(closure));
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            slot: 0,
        });

        match self.run() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.report_runtime_error(&error);
                self.reset();
                Err(Error::Runtime)
            }
        }
    }

    fn report_runtime_error(&self, error: &RuntimeError) {
        eprintln!("{}", error);
        for frame in self.frames.iter().rev() {
            let line = frame
                .chunk
                .lines
                .get(frame.ip.saturating_sub(1))
                .copied()
                .unwrap_or(0);
            let function = self
                .heap
                .get_closure(frame.closure)
                .and_then(|c| self.heap.get_function(c.function));
            let name = function.and_then(|f| f.name);
            match name.and_then(|n| self.heap.get_string(n)) {
                Some(s) => eprintln!("[line {}] in {}()", line, s.chars),
                None => eprintln!("[line {}] in script", line),
            }
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ==================== Dispatch ====================

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }

            let op = OpCode::from(self.read_byte());
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slot;
                    let value = self.stack[base + slot].clone();
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slot;
                    // Assignment is an expression; the value stays put.
                    let value = self.peek(0).clone();
                    self.stack[base + slot] = value;
                }

                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => {
                            let value = value.clone();
                            self.push(value);
                        }
                        None => return Err(self.undefined_variable(name)),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0).clone();
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0).clone();
                    if self.globals.set(name, hash, value) {
                        // Assigning to a name never defined: undo and fail.
                        self.globals.delete(name, hash);
                        return Err(self.undefined_variable(name));
                    }
                }

                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = match self.heap.get_upvalue(upvalue).expect("upvalue missing") {
                        Upvalue::Open(slot) => self.stack[*slot].clone(),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = self.peek(0).clone();
                    match self.heap.get_upvalue_mut(upvalue).expect("upvalue missing") {
                        Upvalue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        Upvalue::Closed(closed) => *closed = value,
                    }
                }

                OpCode::GetProperty => {
                    let name = self.read_string();
                    let instance = match self.peek(0) {
                        Value::Instance(handle) => *handle,
                        _ => return Err(RuntimeError::NoProperties),
                    };
                    let hash = self.heap.string_hash(name);
                    let field = self
                        .heap
                        .get_instance(instance)
                        .expect("instance missing")
                        .fields
                        .get(name, hash)
                        .cloned();
                    if let Some(value) = field {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self
                            .heap
                            .get_instance(instance)
                            .expect("instance missing")
                            .class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let instance = match self.peek(1) {
                        Value::Instance(handle) => *handle,
                        _ => return Err(RuntimeError::NoProperties),
                    };
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0).clone();
                    self.heap
                        .get_instance_mut(instance)
                        .expect("instance missing")
                        .fields
                        .set(name, hash, value);
                    let value = self.pop();
                    self.pop(); // the instance
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop() {
                        Value::Class(handle) => handle,
                        _ => unreachable!("compiler always binds 'super' to a class"),
                    };
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.comparison_op(|a, b| a > b)?,
                OpCode::Less => self.comparison_op(|a, b| a < b)?,
                OpCode::Add => {
                    let b = self.peek(0).clone();
                    let a = self.peek(1).clone();
                    match (a, b) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a + b));
                        }
                        (Value::String(a), Value::String(b)) => {
                            let mut chars = self
                                .heap
                                .get_string(a)
                                .expect("string missing")
                                .chars
                                .clone();
                            chars.push_str(&self.heap.get_string(b).expect("string missing").chars);
                            let result = self.heap.intern(&chars);
                            // Operands stay rooted until the result exists.
                            self.pop();
                            self.pop();
                            self.push(Value::String(result));
                        }
                        _ => return Err(RuntimeError::InvalidAddOperands),
                    }
                }
                OpCode::Subtract => self.binary_op(|a, b| a - b)?,
                OpCode::Multiply => self.binary_op(|a, b| a * b)?,
                OpCode::Divide => self.binary_op(|a, b| a / b)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => match self.pop() {
                    Value::Number(n) => self.push(Value::Number(-n)),
                    _ => return Err(RuntimeError::OperandMustBeNumber),
                },

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count).clone();
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::InvokeSuper => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = match self.pop() {
                        Value::Class(handle) => handle,
                        _ => unreachable!("compiler always binds 'super' to a class"),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }

                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Function(handle) => handle,
                        _ => unreachable!("Closure operand must be a function constant"),
                    };
                    let upvalue_count = self
                        .heap
                        .get_function(function)
                        .expect("function missing")
                        .upvalue_count;

                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.frame().slot;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            upvalues.push(self.frame_upvalue(index));
                        }
                    }

                    let closure = self.heap.alloc_closure(function, upvalues);
                    self.push(Value::Closure(closure));
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active frame");
                    self.close_upvalues(frame.slot);

                    if self.frames.is_empty() {
                        // Pop the script closure; execution is done.
                        self.pop();
                        return Ok(());
                    }

                    self.stack.truncate(frame.slot);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.heap.alloc_class(name);
                    self.push(Value::Class(class));
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1) {
                        Value::Class(handle) => *handle,
                        _ => return Err(RuntimeError::SuperclassMustBeClass),
                    };
                    let subclass = match self.peek(0) {
                        Value::Class(handle) => *handle,
                        _ => unreachable!("Inherit operates on a freshly pushed class"),
                    };
                    // Copy-down inheritance: methods defined afterwards
                    // override the copies.
                    let methods = self
                        .heap
                        .get_class(superclass)
                        .expect("class missing")
                        .methods
                        .clone();
                    methods.add_all(
                        &mut self
                            .heap
                            .get_class_mut(subclass)
                            .expect("class missing")
                            .methods,
                    );
                    self.pop(); // subclass; the superclass stays as `super`
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let hash = self.heap.string_hash(name);
                    let method = self.peek(0).clone();
                    let class = match self.peek(1) {
                        Value::Class(handle) => *handle,
                        _ => unreachable!("Method operates on the class being defined"),
                    };
                    self.heap
                        .get_class_mut(class)
                        .expect("class missing")
                        .methods
                        .set(name, hash, method);
                    self.pop();
                }
            }
        }
    }

    // ==================== Calls ====================

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        match callee {
            Value::Closure(handle) => self.call_closure(handle, arg_count),
            Value::BoundMethod(handle) => {
                let bound = self
                    .heap
                    .get_bound_method(handle)
                    .expect("bound method missing")
                    .clone();
                // The receiver takes the callee slot, becoming `this`.
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = bound.receiver;
                self.call_closure(bound.method, arg_count)
            }
            Value::Class(handle) => {
                let slot = self.stack.len() - arg_count - 1;
                let instance = self.heap.alloc_instance(handle);
                self.stack[slot] = Value::Instance(instance);

                let hash = self.heap.string_hash(self.init_string);
                let initializer = self
                    .heap
                    .get_class(handle)
                    .expect("class missing")
                    .methods
                    .get(self.init_string, hash)
                    .cloned();
                match initializer {
                    Some(Value::Closure(init)) => self.call_closure(init, arg_count),
                    _ if arg_count != 0 => Err(RuntimeError::WrongArity {
                        expected: 0,
                        got: arg_count,
                    }),
                    // No initializer: the instance already sits in the
                    // callee slot as the call's result.
                    _ => Ok(()),
                }
            }
            Value::Native(native) => {
                if let Some(arity) = native.arity {
                    if arg_count != arity {
                        return Err(RuntimeError::WrongArity {
                            expected: arity,
                            got: arg_count,
                        });
                    }
                }
                let args_start = self.stack.len() - arg_count;
                let args = self.stack[args_start..].to_vec();
                let result = (native.function)(self, &args).map_err(RuntimeError::Native)?;
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn call_closure(&mut self, closure: Handle, arg_count: usize) -> Result<(), RuntimeError> {
        let (arity, chunk) = {
            let c = self.heap.get_closure(closure).expect("closure missing");
            let f = self.heap.get_function(c.function).expect("function missing");
            (f.arity, Rc::clone(&f.chunk))
        };

        if arg_count != arity {
            return Err(RuntimeError::WrongArity {
                expected: arity,
                got: arg_count,
            });
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(RuntimeError::StackOverflow);
        }

        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            slot: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn invoke(&mut self, name: Handle, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count).clone();
        let instance = match receiver {
            Value::Instance(handle) => handle,
            _ => return Err(RuntimeError::NoMethods),
        };

        // A field shadowing the method name is called like any value.
        let hash = self.heap.string_hash(name);
        let field = self
            .heap
            .get_instance(instance)
            .expect("instance missing")
            .fields
            .get(name, hash)
            .cloned();
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = value.clone();
            return self.call_value(value, arg_count);
        }

        let class = self
            .heap
            .get_instance(instance)
            .expect("instance missing")
            .class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: Handle,
        name: Handle,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let hash = self.heap.string_hash(name);
        let method = self
            .heap
            .get_class(class)
            .expect("class missing")
            .methods
            .get(name, hash)
            .cloned();
        match method {
            Some(Value::Closure(closure)) => self.call_closure(closure, arg_count),
            _ => Err(RuntimeError::UndefinedProperty(self.string_contents(name))),
        }
    }

    /// Replace the instance on top of the stack with a bound method
    fn bind_method(&mut self, class: Handle, name: Handle) -> Result<(), RuntimeError> {
        let hash = self.heap.string_hash(name);
        let method = self
            .heap
            .get_class(class)
            .expect("class missing")
            .methods
            .get(name, hash)
            .cloned();
        match method {
            Some(Value::Closure(closure)) => {
                let receiver = self.peek(0).clone();
                let bound = self.heap.alloc_bound_method(receiver, closure);
                self.pop();
                self.push(Value::BoundMethod(bound));
                Ok(())
            }
            _ => {
                let class_name = self
                    .heap
                    .get_class(class)
                    .map(|c| self.string_contents(c.name))
                    .unwrap_or_default();
                Err(RuntimeError::UndefinedProperty(format!(
                    "{}.{}",
                    class_name,
                    self.string_contents(name)
                )))
            }
        }
    }

    // ==================== Upvalues ====================

    /// Find or create the open upvalue for a stack slot. The open list is
    /// kept sorted by descending slot, so walking it stops as soon as the
    /// candidate slots drop below the target.
    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let handle = self.open_upvalues[index];
            match self.heap.get_upvalue(handle).expect("upvalue missing") {
                Upvalue::Open(existing) if *existing > slot => index += 1,
                Upvalue::Open(existing) if *existing == slot => return handle,
                _ => break,
            }
        }

        let created = self.heap.alloc_upvalue(slot);
        self.open_upvalues.insert(index, created);
        created
    }

    /// Close every open upvalue at or above `last`: copy the stack value
    /// into the upvalue and drop it from the open list.
    fn close_upvalues(&mut self, last: usize) {
        let mut count = 0;
        while count < self.open_upvalues.len() {
            let handle = self.open_upvalues[count];
            let slot = match self.heap.get_upvalue(handle).expect("upvalue missing") {
                Upvalue::Open(slot) => *slot,
                Upvalue::Closed(_) => unreachable!("open list only holds open upvalues"),
            };
            if slot < last {
                break;
            }
            let value = self.stack[slot].clone();
            *self.heap.get_upvalue_mut(handle).expect("upvalue missing") =
                Upvalue::Closed(value);
            count += 1;
        }
        self.open_upvalues.drain(..count);
    }

    // ==================== Garbage collection ====================

    fn collect_garbage(&mut self) {
        // Roots: the stack, every frame's closure, the open upvalues,
        // the globals (keys and values), and the init sentinel.
        for value in &self.stack {
            for child in value.children() {
                self.heap.mark(child);
            }
        }
        for frame in &self.frames {
            self.heap.mark(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark(upvalue);
        }
        for (key, value) in self.globals.iter() {
            self.heap.mark(key);
            for child in value.children() {
                self.heap.mark(child);
            }
        }
        self.heap.mark(self.init_string);

        self.heap.trace_references();
        self.heap.sweep();
    }

    // ==================== Helpers ====================

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn frame_upvalue(&self, index: usize) -> Handle {
        let closure = self.frame().closure;
        self.heap
            .get_closure(closure)
            .expect("closure missing")
            .upvalues[index]
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = frame.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("no active frame");
        let value = frame.chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.frame().chunk.constants[index].clone()
    }

    fn read_string(&mut self) -> Handle {
        match self.read_constant() {
            Value::String(handle) => handle,
            _ => unreachable!("constant operand must be an interned string"),
        }
    }

    fn string_contents(&self, handle: Handle) -> String {
        self.heap
            .get_string(handle)
            .map(|s| s.chars.clone())
            .unwrap_or_default()
    }

    fn undefined_variable(&self, name: Handle) -> RuntimeError {
        RuntimeError::UndefinedVariable(self.string_contents(name))
    }

    fn push(&mut self, value: Value) {
        if self.stack.len() == STACK_MAX {
            panic!("Value stack overflow");
        }
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn binary_op<F>(&mut self, op: F) -> Result<(), RuntimeError>
    where
        F: Fn(f64, f64) -> f64,
    {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                self.push(Value::Number(op(a, b)));
                Ok(())
            }
            _ => Err(RuntimeError::OperandsMustBeNumbers),
        }
    }

    fn comparison_op<F>(&mut self, op: F) -> Result<(), RuntimeError>
    where
        F: Fn(f64, f64) -> bool,
    {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                self.push(Value::Bool(op(a, b)));
                Ok(())
            }
            _ => Err(RuntimeError::OperandsMustBeNumbers),
        }
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_source(source: &str) -> VM {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        vm.interpret(source).expect("execution failed");
        vm
    }

    fn global(vm: &mut VM, name: &str) -> Value {
        let handle = vm.heap.intern(name);
        let hash = vm.heap.string_hash(handle);
        vm.globals
            .get(handle, hash)
            .cloned()
            .expect("global not defined")
    }

    #[test]
    fn test_arithmetic() {
        let mut vm = run_source("var r = (1 + 2) * 3 - 4 / 2;");
        assert_eq!(global(&mut vm, "r"), Value::Number(7.0));
    }

    #[test]
    fn test_comparison_and_equality() {
        let mut vm = run_source("var a = 1 < 2; var b = 2 >= 3; var c = \"x\" == \"x\";");
        assert_eq!(global(&mut vm, "a"), Value::Bool(true));
        assert_eq!(global(&mut vm, "b"), Value::Bool(false));
        assert_eq!(global(&mut vm, "c"), Value::Bool(true));
    }

    #[test]
    fn test_truthiness_in_conditions() {
        let mut vm = run_source(
            "var r = 0; if (0) { r = 1; } else { r = 2; } var s = 0; if (\"\") { s = 1; }",
        );
        // 0 and "" are truthy; only nil and false are falsey.
        assert_eq!(global(&mut vm, "r"), Value::Number(1.0));
        assert_eq!(global(&mut vm, "s"), Value::Number(1.0));
    }

    #[test]
    fn test_string_concatenation_interns() {
        let mut vm = run_source("var a = \"ab\" + \"c\"; var b = \"abc\";");
        let a = global(&mut vm, "a");
        let b = global(&mut vm, "b");
        assert_eq!(a, b);
        match (a, b) {
            (Value::String(x), Value::String(y)) => assert_eq!(x, y),
            _ => panic!("expected strings"),
        }
    }

    #[test]
    fn test_short_circuit() {
        let mut vm = run_source(
            "var hits = 0; fun bump() { hits = hits + 1; return true; } \
             var a = false and bump(); var b = true or bump();",
        );
        assert_eq!(global(&mut vm, "hits"), Value::Number(0.0));
        assert_eq!(global(&mut vm, "a"), Value::Bool(false));
        assert_eq!(global(&mut vm, "b"), Value::Bool(true));
    }

    #[test]
    fn test_while_loop() {
        let mut vm = run_source("var sum = 0; var i = 1; while (i <= 5) { sum = sum + i; i = i + 1; }");
        assert_eq!(global(&mut vm, "sum"), Value::Number(15.0));
    }

    #[test]
    fn test_for_loop() {
        let mut vm = run_source("var sum = 0; for (var i = 0; i < 5; i = i + 1) { sum = sum + i; }");
        assert_eq!(global(&mut vm, "sum"), Value::Number(10.0));
    }

    #[test]
    fn test_break() {
        let mut vm = run_source(
            "var i = 0; while (true) { i = i + 1; if (i == 3) { break; } }",
        );
        assert_eq!(global(&mut vm, "i"), Value::Number(3.0));
    }

    #[test]
    fn test_break_discards_block_locals() {
        let mut vm = run_source(
            "var r = 0; for (var i = 0; i < 10; i = i + 1) { var x = i * 2; if (x > 4) { break; } r = x; }",
        );
        assert_eq!(global(&mut vm, "r"), Value::Number(4.0));
    }

    #[test]
    fn test_function_calls() {
        let mut vm = run_source("fun add(a, b) { return a + b; } var r = add(3, 4);");
        assert_eq!(global(&mut vm, "r"), Value::Number(7.0));
    }

    #[test]
    fn test_recursion() {
        let mut vm = run_source(
            "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } var r = fib(10);",
        );
        assert_eq!(global(&mut vm, "r"), Value::Number(55.0));
    }

    #[test]
    fn test_undefined_variable_errors() {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        assert_eq!(vm.interpret("nope;"), Err(Error::Runtime));
        assert_eq!(vm.interpret("missing = 1;"), Err(Error::Runtime));
    }

    #[test]
    fn test_add_type_error() {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        assert_eq!(vm.interpret("1 + \"a\";"), Err(Error::Runtime));
    }

    #[test]
    fn test_call_non_callable_errors() {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        assert_eq!(vm.interpret("var x = 1; x();"), Err(Error::Runtime));
    }

    #[test]
    fn test_arity_mismatch_errors() {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        assert_eq!(vm.interpret("fun f(a) {} f(1, 2);"), Err(Error::Runtime));
    }

    #[test]
    fn test_stack_overflow() {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        assert_eq!(vm.interpret("fun f() { f(); } f();"), Err(Error::Runtime));
    }

    #[test]
    fn test_stack_resets_after_runtime_error() {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        assert_eq!(vm.interpret("1 + nil;"), Err(Error::Runtime));
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        // The VM stays usable.
        assert_eq!(vm.interpret("var ok = 1;"), Ok(()));
    }

    #[test]
    fn test_globals_persist_across_interprets() {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        vm.interpret("var x = 41;").unwrap();
        vm.interpret("var y = x + 1;").unwrap();
        assert_eq!(global(&mut vm, "y"), Value::Number(42.0));
    }

    #[test]
    fn test_custom_native() {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        vm.define_native("double", Some(1), |_vm, args| match args[0] {
            Value::Number(n) => Ok(Value::Number(n * 2.0)),
            _ => Err(format!(
                "double() requires a number, got {}",
                args[0].type_name()
            )),
        });
        vm.interpret("var r = double(21);").unwrap();
        assert_eq!(global(&mut vm, "r"), Value::Number(42.0));
    }

    #[test]
    fn test_native_error_is_runtime_error() {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        vm.define_native("fail", None, |_vm, _args| Err("boom".to_string()));
        assert_eq!(vm.interpret("fail();"), Err(Error::Runtime));
    }

    #[test]
    fn test_clock_is_monotonic() {
        let mut vm = run_source("var a = clock(); var b = clock();");
        match (global(&mut vm, "a"), global(&mut vm, "b")) {
            (Value::Number(a), Value::Number(b)) => assert!(b >= a),
            _ => panic!("clock() must return numbers"),
        }
    }

    #[test]
    fn test_gc_collects_garbage_strings() {
        let mut vm = VM::with_output(Box::new(std::io::sink()));
        vm.interpret(
            "var keep = \"\"; for (var i = 0; i < 50; i = i + 1) { keep = \"k\" + \"eep\"; var w = \"was\" + \"te\"; }",
        )
        .unwrap();
        let before = vm.heap.bytes_allocated;
        vm.collect_garbage();
        assert!(vm.heap.bytes_allocated <= before);
        // Live data survives.
        let keep = global(&mut vm, "keep");
        assert_eq!(keep.display(&vm.heap), "keep");
    }
}
