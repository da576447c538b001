//! Single-pass Pratt parser and bytecode emitter.
//!
//! There is no intermediate AST: each grammar rule emits directly into the
//! [`Chunk`] as it recognises the corresponding source construct, tracking
//! lexical scope and local-variable slots as it goes. A handful of
//! superinstruction fusions happen right at emission time (see
//! [`Compiler::emit_conditional_jump_false`] and the `CONST_1`/`ADD`/`SUB`
//! handling in [`Compiler::binary`]) rather than as a later optimisation
//! pass, because any post-pass that shifts bytes would invalidate jump
//! offsets already patched earlier in the same chunk.

use crate::error::CompileError;
use crate::lexer::{Lexer, nul_terminate};
use crate::token::{Token, TokenKind};
use lumen_core::{Builtin, Chunk, Heap, ObjHeader, OpCode, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Equality,
    Comparison,
    Shift,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => BitOr,
            BitOr => BitXor,
            BitXor => BitAnd,
            BitAnd => Equality,
            Equality => Comparison,
            Comparison => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }

    fn of(kind: TokenKind) -> Precedence {
        use TokenKind::*;
        match kind {
            Or | Xor => Precedence::Or,
            And => Precedence::And,
            Pipe => Precedence::BitOr,
            Caret => Precedence::BitXor,
            Amp => Precedence::BitAnd,
            EqEq | NotEq => Precedence::Equality,
            Lt | Gt | LtEq | GtEq => Precedence::Comparison,
            Shl | Shr => Precedence::Shift,
            Plus | Minus => Precedence::Term,
            Star | Slash | Percent => Precedence::Factor,
            LParen | LBracket => Precedence::Call,
            _ => Precedence::None,
        }
    }
}

struct Local {
    name: String,
    depth: i32,
    initialized: bool,
}

struct FunctionFrame {
    #[allow(dead_code)]
    name: Option<String>,
    arity: u8,
    start: usize,
    locals: Vec<Local>,
    scope_depth: i32,
}

/// Maximum locals per function frame (fits the `u8` slot operand).
const MAX_LOCALS: usize = 256;

pub struct Compiler<'src, 'heap> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    chunk: Chunk,
    heap: &'heap mut Heap,
    frames: Vec<FunctionFrame>,
    last_op: Option<(OpCode, usize)>,
}

/// Compiles `source` into a [`Chunk`]. String and function constants are
/// allocated on `heap`, which must outlive the interpreter session that
/// will run the resulting chunk.
pub fn compile(source: &str, heap: &mut Heap) -> Result<Chunk, Vec<CompileError>> {
    let nul_src = nul_terminate(source);
    let lexer = Lexer::new(&nul_src);
    let placeholder = Token { kind: TokenKind::Eof, text: "", line: 0 };
    let mut compiler = Compiler {
        lexer,
        previous: placeholder,
        current: placeholder,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        chunk: Chunk::new(),
        heap,
        frames: vec![FunctionFrame { name: None, arity: 0, start: 0, locals: Vec::new(), scope_depth: 0 }],
        last_op: None,
    };
    compiler.advance();
    compiler.skip_newlines();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration_or_resync();
        compiler.skip_newlines();
    }
    compiler.emit_op(OpCode::Nil);
    compiler.emit_op(OpCode::Return);

    if compiler.had_error { Err(compiler.errors) } else { Ok(compiler.chunk) }
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    // ---- token stream plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            if !self.panic_mode {
                self.errors.push(CompileError { line: self.current.line, message: self.current.text.to_string() });
                self.had_error = true;
            }
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, msg: &str) -> Result<Token<'src>, CompileError> {
        if self.current.kind == kind {
            let tok = self.current;
            self.advance();
            Ok(tok)
        } else {
            Err(self.error_at_current(msg))
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    fn error_at_current(&self, msg: &str) -> CompileError {
        CompileError { line: self.current.line, message: msg.to_string() }
    }

    fn error_at_previous(&self, msg: &str) -> CompileError {
        CompileError { line: self.previous.line, message: msg.to_string() }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Newline {
                return;
            }
            match self.current.kind {
                TokenKind::Fn
                | TokenKind::Let
                | TokenKind::Const
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Match
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    fn declaration_or_resync(&mut self) {
        if let Err(e) = self.declaration() {
            self.had_error = true;
            self.errors.push(e);
            self.panic_mode = true;
            self.synchronize();
        }
    }

    fn block_until(&mut self, terminators: &[TokenKind]) {
        self.skip_newlines();
        while !terminators.contains(&self.current.kind) && !self.check(TokenKind::Eof) {
            self.declaration_or_resync();
            self.skip_newlines();
        }
    }

    // ---- frame/scope helpers ----------------------------------------------

    fn current_frame(&self) -> &FunctionFrame {
        self.frames.last().unwrap()
    }

    fn current_frame_mut(&mut self) -> &mut FunctionFrame {
        self.frames.last_mut().unwrap()
    }

    fn begin_scope(&mut self) {
        self.current_frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let frame = self.current_frame_mut();
        frame.scope_depth -= 1;
        let depth = frame.scope_depth;
        let mut count: u8 = 0;
        while let Some(local) = frame.locals.last() {
            if local.depth > depth {
                frame.locals.pop();
                count += 1;
            } else {
                break;
            }
        }
        match count {
            0 => {}
            1 => {
                self.emit_op(OpCode::Pop);
            }
            n => {
                self.emit_u8(OpCode::PopN, n);
            }
        }
    }

    fn declare_local(&mut self, name: &str) -> Result<(), CompileError> {
        let depth = self.current_frame().scope_depth;
        for local in self.current_frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.depth == depth && local.name == name {
                return Err(self.error_at_previous(&format!("variable '{name}' already declared in this scope")));
            }
        }
        self.add_local(name)?;
        Ok(())
    }

    fn add_local(&mut self, name: &str) -> Result<u8, CompileError> {
        let frame = self.current_frame_mut();
        if frame.locals.len() >= MAX_LOCALS {
            return Err(CompileError { line: 0, message: "too many local variables in function".to_string() });
        }
        frame.locals.push(Local { name: name.to_string(), depth: frame.scope_depth, initialized: false });
        Ok((frame.locals.len() - 1) as u8)
    }

    fn mark_initialized(&mut self) {
        if let Some(local) = self.current_frame_mut().locals.last_mut() {
            local.initialized = true;
        }
    }

    fn resolve_local(&self, name: &str) -> Result<Option<u8>, CompileError> {
        for (i, local) in self.current_frame().locals.iter().enumerate().rev() {
            if local.name == name {
                if !local.initialized {
                    return Err(self.error_at_previous("can't read local variable in its own initializer"));
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    // ---- emission -----------------------------------------------------------

    fn emit_op(&mut self, op: OpCode) -> usize {
        let line = self.previous.line;
        let pos = self.chunk.write_op(op, line);
        self.last_op = Some((op, pos));
        pos
    }

    fn emit_byte(&mut self, b: u8) {
        let line = self.previous.line;
        self.chunk.write(b, line);
    }

    fn emit_u8(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.previous.line;
        self.emit_op(op);
        self.chunk.emit_jump_placeholder(line)
    }

    fn fuse_compare(op: OpCode) -> Option<OpCode> {
        Some(match op {
            OpCode::Lt => OpCode::LtJmpFalse,
            OpCode::Lte => OpCode::LteJmpFalse,
            OpCode::Gt => OpCode::GtJmpFalse,
            OpCode::Gte => OpCode::GteJmpFalse,
            OpCode::Eq => OpCode::EqJmpFalse,
            _ => return None,
        })
    }

    /// Emits a conditional forward jump on a false top-of-stack. When `fuse`
    /// is set and the instruction just written is a comparison, rewrites it
    /// in place into the fused `*_JMP_FALSE` superinstruction instead of
    /// appending a separate `JMP_FALSE`. `match` passes `fuse = false`
    /// because its condition comes from `DUP; ...; EQ`, and the generic
    /// fusion helper has no way to know the `DUP`'d subject must survive.
    fn emit_conditional_jump_false(&mut self, fuse: bool) -> usize {
        let line = self.previous.line;
        if fuse {
            if let Some((op, pos)) = self.last_op {
                if pos + 1 == self.chunk.code.len() {
                    if let Some(fused) = Self::fuse_compare(op) {
                        self.chunk.code[pos] = fused as u8;
                        self.last_op = Some((fused, pos));
                        return self.chunk.emit_jump_placeholder(line);
                    }
                }
            }
        }
        self.emit_jump(OpCode::JmpFalse)
    }

    fn patch_jump(&mut self, placeholder: usize) -> Result<(), CompileError> {
        self.chunk.patch_jump(placeholder).map_err(|m| self.error_at_previous(&m))
    }

    fn emit_loop(&mut self, loop_start: usize) -> Result<(), CompileError> {
        let line = self.previous.line;
        self.chunk.emit_loop(loop_start, line).map_err(|m| self.error_at_previous(&m))
    }

    fn intern_value(&mut self, s: &str) -> Value {
        let ptr = self.heap.intern(s);
        Value::object(ptr as *mut ObjHeader)
    }

    fn identifier_constant(&mut self, name: &str) -> Result<u8, CompileError> {
        let value = self.intern_value(name);
        let idx = self.chunk.add_constant(value);
        u8::try_from(idx).map_err(|_| self.error_at_previous("too many global/field names in one chunk"))
    }

    fn emit_constant(&mut self, value: Value) -> Result<(), CompileError> {
        if value.is_int() {
            match value.as_int() {
                0 => {
                    self.emit_op(OpCode::Const0);
                    return Ok(());
                }
                1 => {
                    self.emit_op(OpCode::Const1);
                    return Ok(());
                }
                2 => {
                    self.emit_op(OpCode::Const2);
                    return Ok(());
                }
                _ => {}
            }
        }
        let idx = self.chunk.add_constant(value);
        if let Ok(b) = u8::try_from(idx) {
            self.emit_op(OpCode::Const);
            self.emit_byte(b);
        } else if let Ok(w) = u16::try_from(idx) {
            self.emit_op(OpCode::ConstLong);
            let bytes = w.to_be_bytes();
            self.emit_byte(bytes[0]);
            self.emit_byte(bytes[1]);
        } else {
            return Err(self.error_at_previous("too many constants in one chunk"));
        }
        Ok(())
    }

    fn emit_get_local(&mut self, slot: u8) {
        match slot {
            0 => {
                self.emit_op(OpCode::GetLocal0);
            }
            1 => {
                self.emit_op(OpCode::GetLocal1);
            }
            2 => {
                self.emit_op(OpCode::GetLocal2);
            }
            3 => {
                self.emit_op(OpCode::GetLocal3);
            }
            _ => self.emit_u8(OpCode::GetLocal, slot),
        }
    }

    fn emit_get(&mut self, name: &str) -> Result<(), CompileError> {
        if let Some(slot) = self.resolve_local(name)? {
            self.emit_get_local(slot);
        } else {
            let idx = self.identifier_constant(name)?;
            self.emit_u8(OpCode::GetGlobal, idx);
        }
        Ok(())
    }

    fn emit_set(&mut self, name: &str) -> Result<(), CompileError> {
        if let Some(slot) = self.resolve_local(name)? {
            self.emit_u8(OpCode::SetLocal, slot);
        } else {
            let idx = self.identifier_constant(name)?;
            self.emit_u8(OpCode::SetGlobal, idx);
        }
        Ok(())
    }

    // ---- expressions ----------------------------------------------------------

    fn expression(&mut self) -> Result<(), CompileError> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, min_prec: Precedence) -> Result<(), CompileError> {
        self.advance();
        let can_assign = min_prec <= Precedence::Assignment;
        self.parse_prefix(can_assign)?;
        while min_prec <= Precedence::of(self.current.kind) {
            self.advance();
            self.parse_infix(can_assign)?;
        }
        if can_assign && self.check(TokenKind::Assign) {
            self.advance();
            return Err(self.error_at_previous("invalid assignment target"));
        }
        Ok(())
    }

    fn parse_prefix(&mut self, can_assign: bool) -> Result<(), CompileError> {
        match self.previous.kind {
            TokenKind::Int | TokenKind::Float => self.number(),
            TokenKind::Str => self.string_literal(),
            TokenKind::Nil | TokenKind::True | TokenKind::False => self.literal(),
            TokenKind::Identifier => self.prefix_identifier(can_assign),
            TokenKind::LParen => self.grouping(),
            TokenKind::LBracket => self.array_literal(),
            TokenKind::Minus | TokenKind::Not => self.unary(),
            _ => Err(self.error_at_previous("expected expression")),
        }
    }

    fn parse_infix(&mut self, can_assign: bool) -> Result<(), CompileError> {
        match self.previous.kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::EqEq
            | TokenKind::NotEq
            | TokenKind::Lt
            | TokenKind::Gt
            | TokenKind::LtEq
            | TokenKind::GtEq
            | TokenKind::Amp
            | TokenKind::Pipe
            | TokenKind::Caret
            | TokenKind::Shl
            | TokenKind::Shr => self.binary(),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            TokenKind::Xor => self.xor_(),
            TokenKind::LParen => self.call_infix(),
            TokenKind::LBracket => self.index_infix(can_assign),
            _ => Err(self.error_at_previous("unexpected token")),
        }
    }

    fn number(&mut self) -> Result<(), CompileError> {
        let text = self.previous.text;
        match self.previous.kind {
            TokenKind::Int => {
                let v: i32 = text.parse().map_err(|_| self.error_at_previous("malformed integer literal"))?;
                self.emit_constant(Value::int(v))
            }
            TokenKind::Float => {
                let v: f64 = text.parse().map_err(|_| self.error_at_previous("malformed float literal"))?;
                self.emit_constant(Value::double(v))
            }
            _ => unreachable!(),
        }
    }

    fn literal(&mut self) -> Result<(), CompileError> {
        match self.previous.kind {
            TokenKind::Nil => {
                self.emit_op(OpCode::Nil);
            }
            TokenKind::True => {
                self.emit_op(OpCode::True);
            }
            TokenKind::False => {
                self.emit_op(OpCode::False);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn string_literal(&mut self) -> Result<(), CompileError> {
        let raw = self.previous.text;
        let unescaped = unescape(raw).map_err(|m| self.error_at_previous(&m))?;
        let value = self.intern_value(&unescaped);
        self.emit_constant(value)
    }

    fn grouping(&mut self) -> Result<(), CompileError> {
        self.expression()?;
        self.consume(TokenKind::RParen, "expect ')' after expression")?;
        Ok(())
    }

    fn array_literal(&mut self) -> Result<(), CompileError> {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RBracket) {
            loop {
                self.expression()?;
                count += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBracket, "expect ']' after array elements")?;
        let count = u8::try_from(count).map_err(|_| self.error_at_previous("too many elements in array literal"))?;
        self.emit_u8(OpCode::Array, count);
        Ok(())
    }

    fn unary(&mut self) -> Result<(), CompileError> {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary)?;
        match op {
            TokenKind::Minus => {
                self.emit_op(OpCode::Neg);
            }
            TokenKind::Not => {
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn binary(&mut self) -> Result<(), CompileError> {
        let op = self.previous.kind;
        let prec = Precedence::of(op);
        self.parse_precedence(prec.next())?;
        let opcode = match op {
            TokenKind::Plus => OpCode::Add,
            TokenKind::Minus => OpCode::Sub,
            TokenKind::Star => OpCode::Mul,
            TokenKind::Slash => OpCode::Div,
            TokenKind::Percent => OpCode::Mod,
            TokenKind::EqEq => OpCode::Eq,
            TokenKind::NotEq => OpCode::Neq,
            TokenKind::Lt => OpCode::Lt,
            TokenKind::LtEq => OpCode::Lte,
            TokenKind::Gt => OpCode::Gt,
            TokenKind::GtEq => OpCode::Gte,
            TokenKind::Amp => OpCode::BitAnd,
            TokenKind::Pipe => OpCode::BitOr,
            TokenKind::Caret => OpCode::BitXor,
            TokenKind::Shl => OpCode::Shl,
            TokenKind::Shr => OpCode::Shr,
            _ => unreachable!(),
        };
        // CONST_1 directly followed by + or - fuses into ADD_1/SUB_1,
        // absorbing both the push of 1 and the arithmetic into one byte.
        if matches!(opcode, OpCode::Add | OpCode::Sub) {
            if let Some((OpCode::Const1, pos)) = self.last_op {
                if pos + 1 == self.chunk.code.len() {
                    let fused = if opcode == OpCode::Add { OpCode::Add1 } else { OpCode::Sub1 };
                    self.chunk.code[pos] = fused as u8;
                    self.last_op = Some((fused, pos));
                    return Ok(());
                }
            }
        }
        self.emit_op(opcode);
        Ok(())
    }

    fn and_(&mut self) -> Result<(), CompileError> {
        self.emit_op(OpCode::Dup);
        let end_jump = self.emit_jump(OpCode::JmpFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump)
    }

    fn or_(&mut self) -> Result<(), CompileError> {
        self.emit_op(OpCode::Dup);
        let end_jump = self.emit_jump(OpCode::JmpTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump)
    }

    /// `xor` is not short-circuiting: `a xor b` lowers to `not (a == b)`
    /// over the two (already-boolean) operands.
    fn xor_(&mut self) -> Result<(), CompileError> {
        self.parse_precedence(Precedence::Or.next())?;
        self.emit_op(OpCode::Eq);
        self.emit_op(OpCode::Not);
        Ok(())
    }

    fn prefix_identifier(&mut self, can_assign: bool) -> Result<(), CompileError> {
        let name = self.previous.text.to_string();
        if self.check(TokenKind::LParen) {
            if let Some((builtin, arity)) = Builtin::lookup(&name) {
                self.advance(); // consume '('
                self.finish_builtin_call(builtin, arity)?;
                return Ok(());
            }
        }
        self.variable_access(&name, can_assign)
    }

    fn variable_access(&mut self, name: &str, can_assign: bool) -> Result<(), CompileError> {
        if can_assign && self.check(TokenKind::Assign) {
            self.advance();
            self.parse_precedence(Precedence::Assignment)?;
            self.emit_set(name)
        } else {
            self.emit_get(name)
        }
    }

    fn finish_builtin_call(&mut self, builtin: Builtin, arity: u8) -> Result<(), CompileError> {
        for i in 0..arity {
            if i > 0 {
                self.consume(TokenKind::Comma, "expect ',' between builtin arguments")?;
            }
            self.expression()?;
        }
        self.consume(TokenKind::RParen, "expect ')' after builtin arguments")?;
        self.emit_op(OpCode::Builtin);
        self.emit_byte(builtin as u8);
        Ok(())
    }

    fn call_infix(&mut self) -> Result<(), CompileError> {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RParen) {
            loop {
                self.expression()?;
                argc += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expect ')' after arguments")?;
        let argc = u8::try_from(argc).map_err(|_| self.error_at_previous("too many arguments (max 255)"))?;
        self.emit_u8(OpCode::Call, argc);
        Ok(())
    }

    fn index_infix(&mut self, can_assign: bool) -> Result<(), CompileError> {
        self.expression()?;
        self.consume(TokenKind::RBracket, "expect ']' after index")?;
        if can_assign && self.check(TokenKind::Assign) {
            self.advance();
            self.expression()?;
            self.emit_op(OpCode::IndexSet);
        } else {
            self.emit_op(OpCode::Index);
        }
        Ok(())
    }

    // ---- statements -----------------------------------------------------------

    fn declaration(&mut self) -> Result<(), CompileError> {
        if self.match_tok(TokenKind::Fn) {
            self.fn_declaration()
        } else if self.match_tok(TokenKind::Let) || self.match_tok(TokenKind::Const) {
            self.var_declaration()
        } else {
            self.statement()
        }
    }

    fn statement(&mut self) -> Result<(), CompileError> {
        if self.check(TokenKind::If) {
            self.if_statement()
        } else if self.check(TokenKind::While) {
            self.while_statement()
        } else if self.check(TokenKind::For) {
            self.for_statement()
        } else if self.check(TokenKind::Match) {
            self.match_statement()
        } else if self.check(TokenKind::Return) {
            self.return_statement()
        } else {
            self.expression_statement()
        }
    }

    fn expression_statement(&mut self) -> Result<(), CompileError> {
        self.expression()?;
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    fn var_declaration(&mut self) -> Result<(), CompileError> {
        let name_tok = self.consume(TokenKind::Identifier, "expect variable name")?;
        let name = name_tok.text.to_string();
        let global_idx = if self.current_frame().scope_depth == 0 {
            Some(self.identifier_constant(&name)?)
        } else {
            self.declare_local(&name)?;
            None
        };
        if self.match_tok(TokenKind::Colon) {
            self.consume(TokenKind::Identifier, "expect type annotation after ':'")?;
        }
        self.consume(TokenKind::Assign, "expect '=' in variable declaration")?;
        self.expression()?;
        if let Some(idx) = global_idx {
            self.emit_u8(OpCode::SetGlobal, idx);
            self.emit_op(OpCode::Pop);
        } else {
            self.mark_initialized();
        }
        Ok(())
    }

    fn fn_declaration(&mut self) -> Result<(), CompileError> {
        let name_tok = self.consume(TokenKind::Identifier, "expect function name")?;
        let name = name_tok.text.to_string();
        let global_idx = if self.current_frame().scope_depth == 0 {
            Some(self.identifier_constant(&name)?)
        } else {
            self.declare_local(&name)?;
            self.mark_initialized();
            None
        };

        self.consume(TokenKind::LParen, "expect '(' after function name")?;
        self.frames.push(FunctionFrame {
            name: Some(name.clone()),
            arity: 0,
            start: 0,
            locals: vec![Local { name: String::new(), depth: 0, initialized: true }],
            scope_depth: 1,
        });

        let jump_over = self.emit_jump(OpCode::Jmp);
        let body_start = self.chunk.code.len();
        self.current_frame_mut().start = body_start;

        if !self.check(TokenKind::RParen) {
            loop {
                let param = self.consume(TokenKind::Identifier, "expect parameter name")?;
                let pname = param.text.to_string();
                self.declare_local(&pname)?;
                self.mark_initialized();
                if self.current_frame().arity == u8::MAX {
                    return Err(self.error_at_previous("function has too many parameters (max 255)"));
                }
                self.current_frame_mut().arity += 1;
                if self.match_tok(TokenKind::Colon) {
                    self.consume(TokenKind::Identifier, "expect type annotation after ':'")?;
                }
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expect ')' after parameters")?;
        if self.match_tok(TokenKind::Arrow) {
            self.consume(TokenKind::Identifier, "expect return type after '->'")?;
        }

        self.block_until(&[TokenKind::End]);
        self.consume(TokenKind::End, "expect 'end' after function body")?;
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
        self.patch_jump(jump_over)?;

        let frame = self.frames.pop().expect("function frame pushed above");
        let local_count = frame.locals.len() as u16;
        let name_ptr = self.heap.intern(&name);
        let func_ptr = self.heap.alloc_function(frame.arity, local_count, frame.start, Some(name_ptr));
        let func_value = Value::object(func_ptr as *mut ObjHeader);
        self.emit_constant(func_value)?;

        if let Some(idx) = global_idx {
            self.emit_u8(OpCode::SetGlobal, idx);
            self.emit_op(OpCode::Pop);
        }
        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), CompileError> {
        self.consume(TokenKind::If, "expect 'if'")?;
        self.expression()?;
        let mut exit = self.emit_conditional_jump_false(true);
        self.consume(TokenKind::Then, "expect 'then' after condition")?;
        self.begin_scope();
        self.block_until(&[TokenKind::Elif, TokenKind::Else, TokenKind::End]);
        self.end_scope();
        let mut end_jumps = vec![self.emit_jump(OpCode::Jmp)];
        self.patch_jump(exit)?;

        while self.match_tok(TokenKind::Elif) {
            self.expression()?;
            exit = self.emit_conditional_jump_false(true);
            self.consume(TokenKind::Then, "expect 'then' after condition")?;
            self.begin_scope();
            self.block_until(&[TokenKind::Elif, TokenKind::Else, TokenKind::End]);
            self.end_scope();
            end_jumps.push(self.emit_jump(OpCode::Jmp));
            self.patch_jump(exit)?;
        }

        if self.match_tok(TokenKind::Else) {
            self.begin_scope();
            self.block_until(&[TokenKind::End]);
            self.end_scope();
        }
        self.consume(TokenKind::End, "expect 'end' to close 'if'")?;
        for j in end_jumps {
            self.patch_jump(j)?;
        }
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), CompileError> {
        self.consume(TokenKind::While, "expect 'while'")?;
        let loop_start = self.chunk.code.len();
        self.expression()?;
        let exit = self.emit_conditional_jump_false(true);
        self.consume(TokenKind::Do, "expect 'do' after condition")?;
        self.begin_scope();
        self.block_until(&[TokenKind::End]);
        self.end_scope();
        self.consume(TokenKind::End, "expect 'end' to close 'while'")?;
        self.emit_loop(loop_start)?;
        self.patch_jump(exit)
    }

    fn for_statement(&mut self) -> Result<(), CompileError> {
        self.consume(TokenKind::For, "expect 'for'")?;
        self.begin_scope();
        let var_tok = self.consume(TokenKind::Identifier, "expect loop variable name")?;
        let var_name = var_tok.text.to_string();
        self.consume(TokenKind::In, "expect 'in' in for loop")?;
        self.expression()?;

        if self.match_tok(TokenKind::DotDot) {
            self.expression()?;
            self.consume(TokenKind::Do, "expect 'do' after range")?;
            let counter_slot = self.add_local("")?;
            self.mark_initialized();
            let end_slot = self.add_local("")?;
            self.mark_initialized();
            self.emit_op(OpCode::Nil);
            let var_slot = self.add_local(&var_name)?;
            self.mark_initialized();

            let loop_start = self.chunk.code.len();
            self.emit_op(OpCode::ForCount);
            self.emit_byte(counter_slot);
            self.emit_byte(end_slot);
            self.emit_byte(var_slot);
            let line = self.previous.line;
            let exit = self.chunk.emit_jump_placeholder(line);

            self.block_until(&[TokenKind::End]);
            self.consume(TokenKind::End, "expect 'end' to close 'for'")?;
            self.emit_loop(loop_start)?;
            self.patch_jump(exit)?;
        } else {
            self.consume(TokenKind::Do, "expect 'do' after iterable")?;
            let iterable_slot = self.add_local("")?;
            self.mark_initialized();
            self.emit_constant(Value::int(0))?;
            let index_slot = self.add_local("")?;
            self.mark_initialized();
            self.emit_op(OpCode::Nil);
            let var_slot = self.add_local(&var_name)?;
            self.mark_initialized();

            let loop_start = self.chunk.code.len();
            self.emit_op(OpCode::ForLoop);
            self.emit_byte(iterable_slot);
            self.emit_byte(index_slot);
            self.emit_byte(var_slot);
            let line = self.previous.line;
            let exit = self.chunk.emit_jump_placeholder(line);

            self.block_until(&[TokenKind::End]);
            self.consume(TokenKind::End, "expect 'end' to close 'for'")?;
            self.emit_loop(loop_start)?;
            self.patch_jump(exit)?;
        }
        self.end_scope();
        Ok(())
    }

    fn match_statement(&mut self) -> Result<(), CompileError> {
        self.consume(TokenKind::Match, "expect 'match'")?;
        self.expression()?;
        self.skip_newlines();
        let mut end_jumps = Vec::new();
        while self.match_tok(TokenKind::Case) {
            self.emit_op(OpCode::Dup);
            self.expression()?;
            self.emit_op(OpCode::Eq);
            let next_arm = self.emit_conditional_jump_false(false);
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::Then, "expect 'then' after case pattern")?;
            self.begin_scope();
            self.block_until(&[TokenKind::Case, TokenKind::Else, TokenKind::End]);
            self.end_scope();
            end_jumps.push(self.emit_jump(OpCode::Jmp));
            self.patch_jump(next_arm)?;
            self.skip_newlines();
        }
        if self.match_tok(TokenKind::Else) {
            self.begin_scope();
            self.block_until(&[TokenKind::End]);
            self.end_scope();
        }
        self.consume(TokenKind::End, "expect 'end' to close 'match'")?;
        self.emit_op(OpCode::Pop);
        for j in end_jumps {
            self.patch_jump(j)?;
        }
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), CompileError> {
        if self.frames.len() == 1 {
            return Err(self.error_at_current("can't return from top-level code"));
        }
        self.consume(TokenKind::Return, "expect 'return'")?;
        let has_value = !matches!(
            self.current.kind,
            TokenKind::Newline | TokenKind::End | TokenKind::Elif | TokenKind::Else | TokenKind::Case | TokenKind::Eof
        );
        if has_value {
            self.expression()?;
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
        Ok(())
    }
}

/// Decodes `\n \t \r \\ \" \' \0` escapes in a quoted string token's raw
/// text (which still includes its surrounding quote characters).
fn unescape(raw: &str) -> Result<String, String> {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('0') => out.push('\0'),
            Some(other) => return Err(format!("unknown escape sequence '\\{other}'")),
            None => return Err("unterminated escape sequence".to_string()),
        }
    }
    Ok(out)
}
