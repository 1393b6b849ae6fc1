//! Tree-walking evaluator.
//!
//! Evaluation is written as futures so that a host function deep inside an
//! expression can suspend the whole script thread; pure computation never
//! suspends. Recursion is boxed at every eval entry point.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::ast::{BinOp, Block, Chunk, Expr, FuncBody, Stmt, TableItem, Target, UnOp};
use super::error::VmError;
use super::thread::FrameInfo;
use super::value::{Function, ScriptFn, Table, Value};
use super::{CallCx, LocalBoxFuture};

const MAX_CALL_DEPTH: usize = 200;

/// A lexical scope chain. Cloning shares the chain; closures capture it.
#[derive(Clone)]
pub struct Env(Rc<Scope>);

struct Scope {
    kind: ScopeKind,
    parent: Option<Env>,
}

enum ScopeKind {
    Local(RefCell<HashMap<String, Value>>),
    /// The root of every thread: writes land in `own` (the thread sandbox),
    /// reads fall back to `shared` (the VM-wide globals).
    Globals { own: Table, shared: Table },
}

impl Env {
    pub fn globals(
        own: Table,
        shared: Table,
    ) -> Env {
        Env(Rc::new(Scope {
            kind: ScopeKind::Globals { own, shared },
            parent: None,
        }))
    }

    pub fn child(&self) -> Env {
        Env(Rc::new(Scope {
            kind: ScopeKind::Local(RefCell::new(HashMap::new())),
            parent: Some(self.clone()),
        }))
    }

    fn lookup(
        &self,
        name: &str,
    ) -> Value {
        let mut scope = self;
        loop {
            match &scope.0.kind {
                ScopeKind::Local(vars) => {
                    if let Some(value) = vars.borrow().get(name) {
                        return value.clone();
                    }
                }
                ScopeKind::Globals { own, shared } => {
                    let key = Value::from(name);
                    let value = own.get(&key);
                    if !matches!(value, Value::Nil) {
                        return value;
                    }
                    return shared.get(&key);
                }
            }
            match &scope.0.parent {
                Some(parent) => scope = parent,
                None => return Value::Nil,
            }
        }
    }

    /// Assign to an existing local, or to the thread's global sandbox.
    fn assign(
        &self,
        name: &str,
        value: Value,
    ) {
        let mut scope = self;
        loop {
            match &scope.0.kind {
                ScopeKind::Local(vars) => {
                    let mut vars = vars.borrow_mut();
                    if vars.contains_key(name) {
                        vars.insert(name.to_string(), value);
                        return;
                    }
                }
                ScopeKind::Globals { own, .. } => {
                    own.set(Value::from(name), value);
                    return;
                }
            }
            match &scope.0.parent {
                Some(parent) => scope = parent,
                None => return,
            }
        }
    }

    /// Declare a new local in the current scope.
    fn declare(
        &self,
        name: &str,
        value: Value,
    ) {
        if let ScopeKind::Local(vars) = &self.0.kind {
            vars.borrow_mut().insert(name.to_string(), value);
        }
    }
}

/// Control-flow result of executing a statement or block.
pub enum Flow {
    Normal,
    Break,
    Return(Vec<Value>),
}

/// Evaluator bound to one executing thread.
pub struct Interp {
    cx: CallCx,
}

impl Interp {
    pub fn new(cx: CallCx) -> Interp {
        Interp { cx }
    }

    /// Run a chunk as the body of the current thread. The chunk gets a fresh
    /// global sandbox whose reads fall back to the VM globals.
    pub async fn run_chunk(
        &self,
        chunk: &Chunk,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, VmError> {
        let root = Env::globals(Table::new(), self.cx.vm.globals().clone());
        let env = root.child();
        let result = self.exec_block(&chunk.block, &env, &args).await;
        match result {
            Ok(Flow::Return(values)) => Ok(values),
            Ok(_) => Ok(Vec::new()),
            Err(mut err) => {
                err.ensure_trace(|| self.cx.thread.traceback());
                Err(err)
            }
        }
    }

    fn raise(
        &self,
        line: u32,
        message: impl Into<String>,
    ) -> VmError {
        VmError::plain(format!(
            "{}:{}: {}",
            self.cx.thread.current_chunk(),
            line,
            message.into()
        ))
    }

    fn exec_block<'a>(
        &'a self,
        block: &'a Block,
        env: &'a Env,
        va: &'a [Value],
    ) -> LocalBoxFuture<'a, Result<Flow, VmError>> {
        Box::pin(async move {
            for stmt in &block.stmts {
                match self.exec_stmt(stmt, env, va).await? {
                    Flow::Normal => {}
                    other => return Ok(other),
                }
            }
            Ok(Flow::Normal)
        })
    }

    fn exec_stmt<'a>(
        &'a self,
        stmt: &'a Stmt,
        env: &'a Env,
        va: &'a [Value],
    ) -> LocalBoxFuture<'a, Result<Flow, VmError>> {
        Box::pin(async move {
            match stmt {
                Stmt::Local { names, exprs, line } => {
                    self.cx.thread.current_line.set(*line);
                    let values = self.eval_list(exprs, env, va).await?;
                    for (i, name) in names.iter().enumerate() {
                        env.declare(name, values.get(i).cloned().unwrap_or(Value::Nil));
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Assign {
                    targets,
                    exprs,
                    line,
                } => {
                    self.cx.thread.current_line.set(*line);
                    let values = self.eval_list(exprs, env, va).await?;
                    for (i, target) in targets.iter().enumerate() {
                        let value = values.get(i).cloned().unwrap_or(Value::Nil);
                        match target {
                            Target::Name(name) => env.assign(name, value),
                            Target::Index { object, key } => {
                                let object_value = self.eval(object, env, va).await?;
                                let key_value = self.eval(key, env, va).await?;
                                let Value::Table(table) = object_value else {
                                    return Err(self.raise(
                                        *line,
                                        format!(
                                            "attempt to index a {} value",
                                            object_value.type_name()
                                        ),
                                    ));
                                };
                                self.check_key(&key_value, *line)?;
                                table.set(key_value, value);
                            }
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Call { call, line } => {
                    self.cx.thread.current_line.set(*line);
                    self.eval_multi(call, env, va).await?;
                    Ok(Flow::Normal)
                }
                Stmt::Do { body, line } => {
                    self.cx.thread.current_line.set(*line);
                    let scope = env.child();
                    self.exec_block(body, &scope, va).await
                }
                Stmt::If {
                    arms,
                    else_body,
                    line,
                } => {
                    self.cx.thread.current_line.set(*line);
                    for (cond, body) in arms {
                        if self.eval(cond, env, va).await?.truthy() {
                            let scope = env.child();
                            return self.exec_block(body, &scope, va).await;
                        }
                    }
                    if let Some(body) = else_body {
                        let scope = env.child();
                        return self.exec_block(body, &scope, va).await;
                    }
                    Ok(Flow::Normal)
                }
                Stmt::While { cond, body, line } => {
                    self.cx.thread.current_line.set(*line);
                    loop {
                        if !self.eval(cond, env, va).await?.truthy() {
                            break;
                        }
                        let scope = env.child();
                        match self.exec_block(body, &scope, va).await? {
                            Flow::Normal => {}
                            Flow::Break => break,
                            flow @ Flow::Return(_) => return Ok(flow),
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::NumericFor {
                    var,
                    start,
                    stop,
                    step,
                    body,
                    line,
                } => {
                    self.cx.thread.current_line.set(*line);
                    let start = self.number_operand(start, env, va, "'for' initial value").await?;
                    let stop = self.number_operand(stop, env, va, "'for' limit").await?;
                    let step = match step {
                        Some(expr) => self.number_operand(expr, env, va, "'for' step").await?,
                        None => 1.0,
                    };
                    if step == 0.0 {
                        return Err(self.raise(*line, "'for' step is zero"));
                    }
                    let mut i = start;
                    while (step > 0.0 && i <= stop) || (step < 0.0 && i >= stop) {
                        let scope = env.child();
                        scope.declare(var, Value::Number(i));
                        match self.exec_block(body, &scope, va).await? {
                            Flow::Normal => {}
                            Flow::Break => break,
                            flow @ Flow::Return(_) => return Ok(flow),
                        }
                        i += step;
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Function { name, func, line } => {
                    self.cx.thread.current_line.set(*line);
                    let value = self.make_function(Some(name.clone()), func, env);
                    env.assign(name, value);
                    Ok(Flow::Normal)
                }
                Stmt::LocalFunction { name, func, line } => {
                    self.cx.thread.current_line.set(*line);
                    env.declare(name, Value::Nil);
                    let value = self.make_function(Some(name.clone()), func, env);
                    env.assign(name, value);
                    Ok(Flow::Normal)
                }
                Stmt::Return { exprs, line } => {
                    self.cx.thread.current_line.set(*line);
                    let values = self.eval_list(exprs, env, va).await?;
                    Ok(Flow::Return(values))
                }
                Stmt::Break { .. } => Ok(Flow::Break),
            }
        })
    }

    async fn number_operand(
        &self,
        expr: &Expr,
        env: &Env,
        va: &[Value],
        what: &str,
    ) -> Result<f64, VmError> {
        match self.eval(expr, env, va).await? {
            Value::Number(n) => Ok(n),
            other => Err(self.raise(
                expr.line(),
                format!("{} must be a number, got {}", what, other.type_name()),
            )),
        }
    }

    fn eval<'a>(
        &'a self,
        expr: &'a Expr,
        env: &'a Env,
        va: &'a [Value],
    ) -> LocalBoxFuture<'a, Result<Value, VmError>> {
        Box::pin(async move {
            match expr {
                Expr::Nil(_) => Ok(Value::Nil),
                Expr::True(_) => Ok(Value::Boolean(true)),
                Expr::False(_) => Ok(Value::Boolean(false)),
                Expr::Number(n, _) => Ok(Value::Number(*n)),
                Expr::Str(s, _) => Ok(Value::String(s.clone())),
                Expr::Vararg(_) => Ok(va.first().cloned().unwrap_or(Value::Nil)),
                Expr::Function(func) => Ok(self.make_function(None, func, env)),
                Expr::Name(name, _) => Ok(env.lookup(name)),
                Expr::Index { object, key, line } => {
                    let object_value = self.eval(object, env, va).await?;
                    let key_value = self.eval(key, env, va).await?;
                    match object_value {
                        Value::Table(table) => Ok(table.get(&key_value)),
                        other => Err(self.raise(
                            *line,
                            format!("attempt to index a {} value", other.type_name()),
                        )),
                    }
                }
                Expr::Call { .. } => {
                    let values = self.eval_multi(expr, env, va).await?;
                    Ok(values.into_iter().next().unwrap_or(Value::Nil))
                }
                Expr::Table { items, .. } => {
                    let table = Table::new();
                    let mut index = 1usize;
                    let count = items.len();
                    for (i, item) in items.iter().enumerate() {
                        match item {
                            TableItem::Positional(value_expr) => {
                                if i + 1 == count {
                                    for value in self.eval_multi(value_expr, env, va).await? {
                                        table.set(Value::Number(index as f64), value);
                                        index += 1;
                                    }
                                } else {
                                    let value = self.eval(value_expr, env, va).await?;
                                    table.set(Value::Number(index as f64), value);
                                    index += 1;
                                }
                            }
                            TableItem::Named(name, value_expr) => {
                                let value = self.eval(value_expr, env, va).await?;
                                table.set(Value::String(name.clone()), value);
                            }
                            TableItem::Keyed(key_expr, value_expr) => {
                                let key = self.eval(key_expr, env, va).await?;
                                self.check_key(&key, key_expr.line())?;
                                let value = self.eval(value_expr, env, va).await?;
                                table.set(key, value);
                            }
                        }
                    }
                    Ok(Value::Table(table))
                }
                Expr::Binary { op, lhs, rhs, line } => match op {
                    BinOp::And => {
                        let left = self.eval(lhs, env, va).await?;
                        if !left.truthy() {
                            return Ok(left);
                        }
                        self.eval(rhs, env, va).await
                    }
                    BinOp::Or => {
                        let left = self.eval(lhs, env, va).await?;
                        if left.truthy() {
                            return Ok(left);
                        }
                        self.eval(rhs, env, va).await
                    }
                    _ => {
                        let left = self.eval(lhs, env, va).await?;
                        let right = self.eval(rhs, env, va).await?;
                        self.binary_op(*op, left, right, *line)
                    }
                },
                Expr::Unary { op, expr, line } => {
                    let value = self.eval(expr, env, va).await?;
                    match op {
                        UnOp::Not => Ok(Value::Boolean(!value.truthy())),
                        UnOp::Neg => match value {
                            Value::Number(n) => Ok(Value::Number(-n)),
                            other => Err(self.raise(
                                *line,
                                format!(
                                    "attempt to perform arithmetic on a {} value",
                                    other.type_name()
                                ),
                            )),
                        },
                        UnOp::Len => match value {
                            Value::String(s) => Ok(Value::Number(s.len() as f64)),
                            Value::Table(t) => Ok(Value::Number(t.border() as f64)),
                            other => Err(self.raise(
                                *line,
                                format!("attempt to get length of a {} value", other.type_name()),
                            )),
                        },
                    }
                }
            }
        })
    }

    /// Evaluate an expression in multi-value position: calls and `...`
    /// expand to all of their values.
    fn eval_multi<'a>(
        &'a self,
        expr: &'a Expr,
        env: &'a Env,
        va: &'a [Value],
    ) -> LocalBoxFuture<'a, Result<Vec<Value>, VmError>> {
        Box::pin(async move {
            match expr {
                Expr::Call { func, args, line } => {
                    let callee = self.eval(func, env, va).await?;
                    let arg_values = self.eval_list(args, env, va).await?;
                    self.call_value(callee, arg_values, *line).await
                }
                Expr::Vararg(_) => Ok(va.to_vec()),
                other => Ok(vec![self.eval(other, env, va).await?]),
            }
        })
    }

    /// Evaluate an expression list: every expression contributes one value,
    /// except the last, which expands.
    fn eval_list<'a>(
        &'a self,
        exprs: &'a [Expr],
        env: &'a Env,
        va: &'a [Value],
    ) -> LocalBoxFuture<'a, Result<Vec<Value>, VmError>> {
        Box::pin(async move {
            let mut values = Vec::with_capacity(exprs.len());
            for (i, expr) in exprs.iter().enumerate() {
                if i + 1 == exprs.len() {
                    values.extend(self.eval_multi(expr, env, va).await?);
                } else {
                    values.push(self.eval(expr, env, va).await?);
                }
            }
            Ok(values)
        })
    }

    /// Invoke a callable value. This is the seam every call goes through:
    /// script closures, host functions, and cross-runtime bridges alike.
    pub fn call_value<'a>(
        &'a self,
        callee: Value,
        args: Vec<Value>,
        line: u32,
    ) -> LocalBoxFuture<'a, Result<Vec<Value>, VmError>> {
        Box::pin(async move {
            let state = &self.cx.thread;
            if state.frames.borrow().len() >= MAX_CALL_DEPTH {
                return Err(self.raise(line, "stack overflow"));
            }
            match callee {
                Value::Function(Function::Script(func)) => {
                    let env = func.env.child();
                    for (i, param) in func.params.iter().enumerate() {
                        env.declare(param, args.get(i).cloned().unwrap_or(Value::Nil));
                    }
                    let varargs: Vec<Value> = if func.is_vararg && args.len() > func.params.len() {
                        args[func.params.len()..].to_vec()
                    } else {
                        Vec::new()
                    };
                    state.frames.borrow_mut().push(FrameInfo {
                        name: func.name.clone().unwrap_or_else(|| "anonymous".to_string()),
                        chunk: func.chunk.clone(),
                        line,
                    });
                    let saved_chunk = state.chunk.replace(func.chunk.clone());
                    let saved_line = state.current_line.get();
                    let body = func.body.clone();
                    let result = self.exec_block(&body, &env, &varargs).await;
                    let result = match result {
                        Ok(Flow::Return(values)) => Ok(values),
                        Ok(_) => Ok(Vec::new()),
                        Err(mut err) => {
                            err.ensure_trace(|| state.traceback());
                            Err(err)
                        }
                    };
                    state.chunk.replace(saved_chunk);
                    state.current_line.set(saved_line);
                    state.frames.borrow_mut().pop();
                    result
                }
                Value::Function(Function::Native(func)) => {
                    state.frames.borrow_mut().push(FrameInfo {
                        name: func.name.clone(),
                        chunk: Rc::from("[host]"),
                        line,
                    });
                    let result = func.call(self.cx.clone(), args).await.map_err(|mut err| {
                        err.ensure_trace(|| state.traceback());
                        err
                    });
                    state.frames.borrow_mut().pop();
                    result
                }
                other => Err(self.raise(
                    line,
                    format!("attempt to call a {} value", other.type_name()),
                )),
            }
        })
    }

    fn make_function(
        &self,
        name: Option<String>,
        func: &Rc<FuncBody>,
        env: &Env,
    ) -> Value {
        Value::Function(Function::Script(Rc::new(ScriptFn {
            name,
            params: func.params.clone(),
            is_vararg: func.is_vararg,
            body: func.body.clone(),
            env: env.clone(),
            chunk: self.cx.thread.current_chunk(),
            line: func.line,
        })))
    }

    fn check_key(
        &self,
        key: &Value,
        line: u32,
    ) -> Result<(), VmError> {
        match key {
            Value::Nil => Err(self.raise(line, "table index is nil")),
            Value::Number(n) if n.is_nan() => Err(self.raise(line, "table index is NaN")),
            _ => Ok(()),
        }
    }

    fn binary_op(
        &self,
        op: BinOp,
        lhs: Value,
        rhs: Value,
        line: u32,
    ) -> Result<Value, VmError> {
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                let (Value::Number(a), Value::Number(b)) = (&lhs, &rhs) else {
                    let offender = if matches!(lhs, Value::Number(_)) {
                        &rhs
                    } else {
                        &lhs
                    };
                    return Err(self.raise(
                        line,
                        format!(
                            "attempt to perform arithmetic on a {} value",
                            offender.type_name()
                        ),
                    ));
                };
                let result = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Mod => a - (a / b).floor() * b,
                    _ => return Err(self.raise(line, "unsupported arithmetic operator")),
                };
                Ok(Value::Number(result))
            }
            BinOp::Concat => {
                let concatenable =
                    |v: &Value| matches!(v, Value::String(_) | Value::Number(_));
                if !concatenable(&lhs) || !concatenable(&rhs) {
                    let offender = if concatenable(&lhs) { &rhs } else { &lhs };
                    return Err(self.raise(
                        line,
                        format!("attempt to concatenate a {} value", offender.type_name()),
                    ));
                }
                Ok(Value::from(format!("{}{}", lhs, rhs)))
            }
            BinOp::Eq => Ok(Value::Boolean(lhs.raw_eq(&rhs))),
            BinOp::Ne => Ok(Value::Boolean(!lhs.raw_eq(&rhs))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ordering = match (&lhs, &rhs) {
                    (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => {
                        return Err(self.raise(
                            line,
                            format!(
                                "attempt to compare {} with {}",
                                lhs.type_name(),
                                rhs.type_name()
                            ),
                        ))
                    }
                };
                let Some(ordering) = ordering else {
                    return Ok(Value::Boolean(false));
                };
                let result = match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::Le => ordering.is_le(),
                    BinOp::Gt => ordering.is_gt(),
                    BinOp::Ge => ordering.is_ge(),
                    _ => false,
                };
                Ok(Value::Boolean(result))
            }
            BinOp::And | BinOp::Or => Err(self.raise(line, "short-circuit operator in value position")),
        }
    }
}

/// Call a function value on the current thread, outside of any chunk. Used
/// by hosts that invoke script functions directly, e.g. the cross-runtime
/// bridge.
pub async fn call_function(
    cx: &CallCx,
    func: Function,
    args: Vec<Value>,
) -> Result<Vec<Value>, VmError> {
    let interp = Interp::new(cx.clone());
    interp
        .call_value(Value::Function(func), args, 0)
        .await
}
