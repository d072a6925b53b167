//! Single-pass compiler: tokens in, bytecode out
//!
//! A Pratt parser that emits into the chunk of the function currently
//! being compiled. Nested function and method bodies push a fresh
//! [`FunctionCompiler`] onto a stack; class bodies push a
//! [`ClassCompiler`]. There is no AST: each grammar rule emits its
//! bytecode as soon as it finishes parsing.
//!
//! Errors put the parser into panic mode, which suppresses further
//! diagnostics until a statement boundary; compilation continues so one
//! pass can report several errors, but any error means no function is
//! produced.

use std::rc::Rc;

use crate::bytecode::{Chunk, OpCode};
use crate::gc::{Handle, Heap};
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};
use crate::value::{Function, Value};

/// Maximum number of locals in a function, including slot 0
pub const MAX_LOCALS: usize = 256;

/// Maximum number of upvalues a function can capture
pub const MAX_UPVALUES: usize = 256;

/// Maximum number of parameters, leaving slot 0 for the receiver
pub const MAX_PARAMS: usize = 255;

/// Maximum number of constants in one chunk (1-byte operands)
pub const MAX_CONSTANTS: usize = 256;

/// Compile source to a heap-allocated function. Diagnostics go to stderr;
/// `None` means at least one was reported.
pub fn compile<'a>(source: &'a str, heap: &'a mut Heap) -> Option<Handle> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_compiler();
    if compiler.had_error {
        None
    } else {
        Some(compiler.heap.alloc_function(function))
    }
}

/// All precedence levels, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    /// `=`
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// `+` `-`
    Term,
    /// `*` `/`
    Factor,
    /// `!` unary `-`
    Unary,
    /// `.` `()`
    Call,
    Primary,
}

impl Precedence {
    /// The immediately higher level
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call => Self::Primary,
            Self::Primary => Self::Primary,
        }
    }

    /// Infix binding power of a token
    fn of(kind: TokenKind) -> Self {
        match kind {
            TokenKind::LeftParen | TokenKind::Dot => Precedence::Call,
            TokenKind::Minus | TokenKind::Plus => Precedence::Term,
            TokenKind::Slash | TokenKind::Star => Precedence::Factor,
            TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
            TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => Precedence::Comparison,
            TokenKind::And => Precedence::And,
            TokenKind::Or => Precedence::Or,
            _ => Precedence::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// Local variable in scope. `depth` is `None` between declaration and
/// initialization, which is how reads inside the initializer are caught.
#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: Option<usize>,
    is_captured: bool,
}

/// Upvalue being captured
#[derive(Debug, Clone, Copy)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

/// An enclosing loop: the scope depth outside its body, plus the jump
/// offsets every `break` inside it left to be patched.
#[derive(Debug)]
struct LoopContext {
    depth: usize,
    exits: Vec<usize>,
}

/// Function being compiled
struct FunctionCompiler {
    name: Option<Handle>,
    kind: FunctionKind,
    chunk: Chunk,
    arity: usize,
    locals: Vec<Local>,
    upvalues: Vec<Upvalue>,
    scope_depth: usize,
    loops: Vec<LoopContext>,
}

impl FunctionCompiler {
    fn new(name: Option<Handle>, kind: FunctionKind) -> Self {
        // Slot 0 is reserved: the closure itself, or the receiver in
        // methods and initializers.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this".to_string()
            } else {
                String::new()
            },
            depth: Some(0),
            is_captured: false,
        };
        Self {
            name,
            kind,
            chunk: Chunk::new(),
            arity: 0,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

/// Class being compiled
struct ClassCompiler {
    has_superclass: bool,
}

/// The compiler driver: parser state plus the stacks of nested function
/// and class contexts.
pub struct Compiler<'a> {
    lexer: Lexer<'a>,
    current: Token<'a>,
    previous: Token<'a>,
    had_error: bool,
    panic_mode: bool,
    compilers: Vec<FunctionCompiler>,
    classes: Vec<ClassCompiler>,
    heap: &'a mut Heap,
}

impl<'a> Compiler<'a> {
    fn new(source: &'a str, heap: &'a mut Heap) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Self {
            lexer: Lexer::new(source),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            compilers: vec![FunctionCompiler::new(None, FunctionKind::Script)],
            classes: Vec::new(),
            heap,
        }
    }

    // ==================== Token plumbing ====================

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        // One diagnostic per panic; the rest are noise until we resync.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        eprintln!("[line {}] Error{}: {}", token.line, location, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Break => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ==================== Emit helpers ====================

    fn current_fn(&mut self) -> &mut FunctionCompiler {
        self.compilers.last_mut().expect("compiler stack is never empty")
    }

    fn emit(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_fn().chunk.write(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_fn().chunk.write_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.current_fn().chunk.write_u16(value, line);
    }

    fn emit_return(&mut self) {
        if self.current_fn().kind == FunctionKind::Initializer {
            // An initializer always returns its receiver.
            self.emit(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit(OpCode::Nil);
        }
        self.emit(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if self.current_fn().chunk.constants.len() >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        self.current_fn().chunk.add_constant(value) as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit(OpCode::Constant);
        self.emit_byte(index);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.heap.intern(name);
        self.make_constant(Value::String(handle))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op);
        // two-byte placeholder, patched later
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_fn().chunk.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the jump offset bytes themselves
        let jump = self.current_fn().chunk.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        self.current_fn().chunk.patch(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit(OpCode::Loop);
        let offset = self.current_fn().chunk.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_u16(offset as u16);
    }

    fn end_compiler(&mut self) -> (Function, Vec<Upvalue>) {
        self.emit_return();
        let fc = self.compilers.pop().expect("compiler stack is never empty");
        let function = Function {
            name: fc.name,
            arity: fc.arity,
            upvalue_count: fc.upvalues.len(),
            chunk: Rc::new(fc.chunk),
        };
        (function, fc.upvalues)
    }

    // ==================== Scopes and variables ====================

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_fn().scope_depth -= 1;
        loop {
            let (pop, captured) = {
                let fc = self.current_fn();
                match fc.locals.last() {
                    Some(local) => (
                        local.depth.map_or(false, |d| d > fc.scope_depth),
                        local.is_captured,
                    ),
                    None => (false, false),
                }
            };
            if !pop {
                break;
            }
            self.current_fn().locals.pop();
            if captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &str) {
        if self.current_fn().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in scope.");
            return;
        }
        self.current_fn().locals.push(Local {
            name: name.to_string(),
            depth: None,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        // Nothing to do for globals; they are late-bound by name.
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;

        let mut duplicate = false;
        {
            let fc = self.current_fn();
            for local in fc.locals.iter().rev() {
                if let Some(depth) = local.depth {
                    if depth < fc.scope_depth {
                        break;
                    }
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_fn().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        let fc = self.current_fn();
        if fc.scope_depth == 0 {
            return;
        }
        let depth = fc.scope_depth;
        if let Some(local) = fc.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_fn().scope_depth > 0 {
            // The local's value is already sitting in its stack slot.
            self.mark_initialized();
            return;
        }
        self.emit(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &str) -> Option<u8> {
        let mut found = None;
        let mut uninitialized = false;
        for (i, local) in self.compilers[compiler_index].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth.is_none() {
                    uninitialized = true;
                }
                found = Some(i as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: u8, is_local: bool) -> u8 {
        for (i, upvalue) in self.compilers[compiler_index].upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }
        if self.compilers[compiler_index].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closed variables in function.");
            return 0;
        }
        let fc = &mut self.compilers[compiler_index];
        fc.upvalues.push(Upvalue { index, is_local });
        (fc.upvalues.len() - 1) as u8
    }

    /// Resolve a name against enclosing functions, installing a chain of
    /// upvalue records along the way. The directly captured local is
    /// marked so its scope closes it instead of popping it.
    fn resolve_upvalue(&mut self, compiler_index: usize, name: &str) -> Option<u8> {
        if compiler_index == 0 {
            return None;
        }
        let parent = compiler_index - 1;

        if let Some(index) = self.resolve_local(parent, name) {
            self.compilers[parent].locals[index as usize].is_captured = true;
            return Some(self.add_upvalue(compiler_index, index, true));
        }

        if let Some(index) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(compiler_index, index, false));
        }

        None
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let top = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(top, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(set_op);
            self.emit_byte(arg);
        } else {
            self.emit(get_op);
            self.emit_byte(arg);
        }
    }

    // ==================== Declarations ====================

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Functions may refer to themselves; initialize eagerly.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compile a function body. The name is `previous` when this is
    /// called. Emits the closure instruction and its upvalue operands.
    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme);
        self.compilers.push(FunctionCompiler::new(Some(name), kind));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.current_fn().arity += 1;
                if self.current_fn().arity > MAX_PARAMS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the whole compiler goes away with its scopes.
        let (function, upvalues) = self.end_compiler();
        let handle = self.heap.alloc_function(function);
        let constant = self.make_constant(Value::Function(handle));
        self.emit(OpCode::Closure);
        self.emit_byte(constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let lexeme = self.previous.lexeme;
        let constant = self.identifier_constant(lexeme);

        let kind = if lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);

        self.emit(OpCode::Method);
        self.emit_byte(constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_string();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass = self.previous.lexeme;
            self.named_variable(superclass, false);

            if class_name == superclass {
                self.error("A class can't inherit from itself.");
            }

            // The superclass value stays on the stack as a scoped local
            // named `super`, so super expressions can close over it.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit(OpCode::Inherit);
            self.classes
                .last_mut()
                .expect("class was just pushed")
                .has_superclass = true;
        }

        // Load the class for the method definitions to attach to.
        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit(OpCode::Pop);

        if self.classes.last().expect("class was just pushed").has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    // ==================== Statements ====================

    fn statement(&mut self) {
        if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        // The condition is popped on both paths.
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_fn().chunk.len();
        let depth = self.current_fn().scope_depth;
        self.current_fn().loops.push(LoopContext {
            depth,
            exits: Vec::new(),
        });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);

        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(OpCode::Pop);

        let exits = self
            .current_fn()
            .loops
            .pop()
            .expect("loop was just pushed")
            .exits;
        for exit in exits {
            self.patch_jump(exit);
        }
    }

    fn for_statement(&mut self) {
        // The initializer's variable lives in its own scope.
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_fn().chunk.len();
        let depth = self.current_fn().scope_depth;
        self.current_fn().loops.push(LoopContext {
            depth,
            exits: Vec::new(),
        });

        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            // No condition means no exit: an infinite loop.
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            // The increment textually precedes the body but runs after
            // it: jump over it into the body, then loop back through it.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_fn().chunk.len();
            self.expression();
            self.emit(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit(OpCode::Pop);
        }

        let exits = self
            .current_fn()
            .loops
            .pop()
            .expect("loop was just pushed")
            .exits;
        for exit in exits {
            self.patch_jump(exit);
        }

        self.end_scope();
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.current_fn().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }

        // Discard locals belonging to scopes inside the loop before
        // jumping past it. The locals stay in the compiler's list; the
        // scopes that own them still end normally.
        let loop_depth = self
            .current_fn()
            .loops
            .last()
            .expect("checked above")
            .depth;
        let mut captured_flags = Vec::new();
        for local in self.current_fn().locals.iter().rev() {
            match local.depth {
                Some(depth) if depth > loop_depth => captured_flags.push(local.is_captured),
                _ => break,
            }
        }
        for captured in captured_flags {
            if captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
        }

        let exit = self.emit_jump(OpCode::Jump);
        self.current_fn()
            .loops
            .last_mut()
            .expect("checked above")
            .exits
            .push(exit);
    }

    fn return_statement(&mut self) {
        if self.current_fn().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_fn().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit(OpCode::Return);
        }
    }

    // ==================== Expressions ====================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        // Assignment is only allowed when nothing of higher precedence
        // surrounds the target.
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= Precedence::of(self.current.kind) {
            self.advance();
            self.infix_rule(can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    /// Dispatch on `previous` as a prefix; false when it cannot start an
    /// expression.
    fn prefix_rule(&mut self, can_assign: bool) -> bool {
        match self.previous.kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Int | TokenKind::Float => self.number(),
            TokenKind::String => self.string(),
            TokenKind::False | TokenKind::True | TokenKind::Nil => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_(),
            TokenKind::Super => self.super_(),
            _ => return false,
        }
        true
    }

    /// Dispatch on `previous` as an infix operator
    fn infix_rule(&mut self, can_assign: bool) {
        match self.previous.kind {
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            _ => self.binary(),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::of(operator).next());
        match operator {
            TokenKind::Plus => self.emit(OpCode::Add),
            TokenKind::Minus => self.emit(OpCode::Subtract),
            TokenKind::Star => self.emit(OpCode::Multiply),
            TokenKind::Slash => self.emit(OpCode::Divide),
            TokenKind::EqualEqual => self.emit(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit(OpCode::Equal);
                self.emit(OpCode::Not);
            }
            TokenKind::Greater => self.emit(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            TokenKind::Less => self.emit(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            _ => unreachable!("precedence table admits only binary operators"),
        }
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit(OpCode::Negate),
            TokenKind::Bang => self.emit(OpCode::Not),
            _ => unreachable!("only '-' and '!' are unary"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit(OpCode::False),
            TokenKind::True => self.emit(OpCode::True),
            TokenKind::Nil => self.emit(OpCode::Nil),
            _ => unreachable!("only literals reach here"),
        }
    }

    fn number(&mut self) {
        // Underscore separators are stripped before conversion; int and
        // float literals produce the same numeric value.
        let literal: String = self
            .previous
            .lexeme
            .chars()
            .filter(|&c| c != '_')
            .collect();
        let value: f64 = literal
            .parse()
            .expect("lexer only produces valid number literals");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let handle = self.heap.intern(contents);
        self.emit_constant(Value::String(handle));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this_(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().expect("checked above").has_superclass {
            self.error("Can't use 'super' in a class that has no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let lexeme = self.previous.lexeme;
        let name = self.identifier_constant(lexeme);

        self.named_variable("this", false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit(OpCode::InvokeSuper);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit(OpCode::GetSuper);
            self.emit_byte(name);
        }
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let lexeme = self.previous.lexeme;
        let name = self.identifier_constant(lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(OpCode::SetProperty);
            self.emit_byte(name);
        } else if self.matches(TokenKind::LeftParen) {
            // Method call: skip the intermediate bound method.
            let arg_count = self.argument_list();
            self.emit(OpCode::Invoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.emit(OpCode::GetProperty);
            self.emit_byte(name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_function(source: &str, heap: &mut Heap) -> Function {
        let handle = compile(source, heap).expect("compilation failed");
        heap.get_function(handle).expect("script function").clone()
    }

    fn has_op(chunk: &Chunk, op: OpCode) -> bool {
        // Scanning raw bytes can hit operands, but these tests only look
        // for opcodes whose byte values don't collide with operands used.
        chunk.code.contains(&(op as u8))
    }

    #[test]
    fn test_compile_number_constant() {
        let mut heap = Heap::new();
        let function = compile_function("42;", &mut heap);
        assert_eq!(function.chunk.constants[0], Value::Number(42.0));
        assert!(function.name.is_none());
    }

    #[test]
    fn test_underscored_literal() {
        let mut heap = Heap::new();
        let function = compile_function("1_000.5;", &mut heap);
        assert_eq!(function.chunk.constants[0], Value::Number(1000.5));
    }

    #[test]
    fn test_compile_arithmetic() {
        let mut heap = Heap::new();
        let function = compile_function("1 + 2 * 3;", &mut heap);
        assert!(has_op(&function.chunk, OpCode::Add));
        assert!(has_op(&function.chunk, OpCode::Multiply));
    }

    #[test]
    fn test_global_names_are_interned_constants() {
        let mut heap = Heap::new();
        let function = compile_function("var x = 10;", &mut heap);
        let expected = heap.intern("x");
        assert!(function
            .chunk
            .constants
            .iter()
            .any(|c| matches!(c, Value::String(h) if *h == expected)));
    }

    #[test]
    fn test_if_emits_conditional_jump() {
        let mut heap = Heap::new();
        let function = compile_function("if (true) { 1; } else { 2; }", &mut heap);
        assert!(has_op(&function.chunk, OpCode::JumpIfFalse));
        assert!(has_op(&function.chunk, OpCode::Jump));
    }

    #[test]
    fn test_while_emits_loop() {
        let mut heap = Heap::new();
        let function = compile_function("while (false) { 1; }", &mut heap);
        assert!(has_op(&function.chunk, OpCode::Loop));
    }

    #[test]
    fn test_function_emits_closure() {
        let mut heap = Heap::new();
        let function = compile_function("fun f(a, b) { return a + b; }", &mut heap);
        assert!(has_op(&function.chunk, OpCode::Closure));
        let nested = function
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(h) => heap.get_function(*h),
                _ => None,
            })
            .expect("nested function constant");
        assert_eq!(nested.arity, 2);
        assert_eq!(nested.upvalue_count, 0);
    }

    #[test]
    fn test_nested_closure_captures_upvalue() {
        let mut heap = Heap::new();
        let function = compile_function(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
            &mut heap,
        );
        let outer = function
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(h) => heap.get_function(*h),
                _ => None,
            })
            .expect("outer function constant");
        let inner = outer
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Function(h) => heap.get_function(*h),
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(inner.upvalue_count, 1);
    }

    #[test]
    fn test_read_local_in_own_initializer_fails() {
        let mut heap = Heap::new();
        assert!(compile("{ var x = x; }", &mut heap).is_none());
    }

    #[test]
    fn test_redeclaration_in_same_scope_fails() {
        let mut heap = Heap::new();
        assert!(compile("{ var a = 1; var a = 2; }", &mut heap).is_none());
    }

    #[test]
    fn test_class_cannot_inherit_from_itself() {
        let mut heap = Heap::new();
        assert!(compile("class X < X {}", &mut heap).is_none());
    }

    #[test]
    fn test_return_at_top_level_fails() {
        let mut heap = Heap::new();
        assert!(compile("return 1;", &mut heap).is_none());
    }

    #[test]
    fn test_return_value_from_initializer_fails() {
        let mut heap = Heap::new();
        assert!(compile("class C { init() { return 5; } }", &mut heap).is_none());
        // A bare return is allowed.
        assert!(compile("class C { init() { return; } }", &mut heap).is_some());
    }

    #[test]
    fn test_this_outside_class_fails() {
        let mut heap = Heap::new();
        assert!(compile("print(this);", &mut heap).is_none());
    }

    #[test]
    fn test_super_without_superclass_fails() {
        let mut heap = Heap::new();
        assert!(compile("class C { m() { super.m(); } }", &mut heap).is_none());
    }

    #[test]
    fn test_break_outside_loop_fails() {
        let mut heap = Heap::new();
        assert!(compile("break;", &mut heap).is_none());
    }

    #[test]
    fn test_break_inside_loop_compiles() {
        let mut heap = Heap::new();
        assert!(compile("while (true) { break; }", &mut heap).is_some());
    }

    #[test]
    fn test_invalid_assignment_target_fails() {
        let mut heap = Heap::new();
        assert!(compile("var a = 1; var b = 2; a + b = 3;", &mut heap).is_none());
    }
}
