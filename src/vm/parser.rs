//! Recursive-descent parser for the embedded script language.

use std::rc::Rc;

use super::ast::{BinOp, Block, Chunk, Expr, FuncBody, Stmt, TableItem, Target, UnOp};
use super::lexer::{tokenize, SyntaxError, Token, TokenKind};

pub fn parse(
    source: &str,
    chunk_name: &str,
) -> Result<Chunk, SyntaxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let block = parser.block(&[TokenKind::Eof])?;
    parser.expect(TokenKind::Eof)?;
    Ok(Chunk {
        name: Rc::from(chunk_name),
        block,
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(
        &mut self,
        kind: &TokenKind,
    ) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(
        &mut self,
        kind: TokenKind,
    ) -> Result<Token, SyntaxError> {
        if self.peek() == &kind {
            Ok(self.advance())
        } else {
            Err(SyntaxError::new(
                self.line(),
                format!(
                    "expected {}, got {}",
                    kind.describe(),
                    self.peek().describe()
                ),
            ))
        }
    }

    fn expect_name(&mut self) -> Result<String, SyntaxError> {
        match self.peek().clone() {
            TokenKind::Name(n) => {
                self.advance();
                Ok(n)
            }
            other => Err(SyntaxError::new(
                self.line(),
                format!("expected a name, got {}", other.describe()),
            )),
        }
    }

    fn block(
        &mut self,
        terminators: &[TokenKind],
    ) -> Result<Block, SyntaxError> {
        let mut stmts = Vec::new();
        loop {
            while self.check(&TokenKind::Semi) {}
            if terminators.iter().any(|t| self.peek() == t) {
                break;
            }
            let stmt = self.statement()?;
            let is_return = matches!(stmt, Stmt::Return { .. });
            stmts.push(stmt);
            // return ends the block
            if is_return {
                while self.check(&TokenKind::Semi) {}
                break;
            }
        }
        Ok(Block { stmts })
    }

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        match self.peek() {
            TokenKind::Local => {
                self.advance();
                if self.check(&TokenKind::Function) {
                    let name = self.expect_name()?;
                    let func = self.func_body(Some(name.clone()))?;
                    return Ok(Stmt::LocalFunction { name, func, line });
                }
                let mut names = vec![self.expect_name()?];
                while self.check(&TokenKind::Comma) {
                    names.push(self.expect_name()?);
                }
                let exprs = if self.check(&TokenKind::Assign) {
                    self.expr_list()?
                } else {
                    Vec::new()
                };
                Ok(Stmt::Local { names, exprs, line })
            }
            TokenKind::Function => {
                self.advance();
                let name = self.expect_name()?;
                let func = self.func_body(Some(name.clone()))?;
                Ok(Stmt::Function { name, func, line })
            }
            TokenKind::If => {
                self.advance();
                let mut arms = Vec::new();
                let cond = self.expression()?;
                self.expect(TokenKind::Then)?;
                let body = self.block(&[TokenKind::End, TokenKind::Else, TokenKind::Elseif])?;
                arms.push((cond, body));
                let mut else_body = None;
                loop {
                    if self.check(&TokenKind::Elseif) {
                        let cond = self.expression()?;
                        self.expect(TokenKind::Then)?;
                        let body =
                            self.block(&[TokenKind::End, TokenKind::Else, TokenKind::Elseif])?;
                        arms.push((cond, body));
                    } else if self.check(&TokenKind::Else) {
                        else_body = Some(self.block(&[TokenKind::End])?);
                        self.expect(TokenKind::End)?;
                        break;
                    } else {
                        self.expect(TokenKind::End)?;
                        break;
                    }
                }
                Ok(Stmt::If {
                    arms,
                    else_body,
                    line,
                })
            }
            TokenKind::While => {
                self.advance();
                let cond = self.expression()?;
                self.expect(TokenKind::Do)?;
                let body = self.block(&[TokenKind::End])?;
                self.expect(TokenKind::End)?;
                Ok(Stmt::While { cond, body, line })
            }
            TokenKind::For => {
                self.advance();
                let var = self.expect_name()?;
                self.expect(TokenKind::Assign)?;
                let start = self.expression()?;
                self.expect(TokenKind::Comma)?;
                let stop = self.expression()?;
                let step = if self.check(&TokenKind::Comma) {
                    Some(self.expression()?)
                } else {
                    None
                };
                self.expect(TokenKind::Do)?;
                let body = self.block(&[TokenKind::End])?;
                self.expect(TokenKind::End)?;
                Ok(Stmt::NumericFor {
                    var,
                    start,
                    stop,
                    step,
                    body,
                    line,
                })
            }
            TokenKind::Do => {
                self.advance();
                let body = self.block(&[TokenKind::End])?;
                self.expect(TokenKind::End)?;
                Ok(Stmt::Do { body, line })
            }
            TokenKind::Return => {
                self.advance();
                let exprs = if self.at_block_end() {
                    Vec::new()
                } else {
                    self.expr_list()?
                };
                Ok(Stmt::Return { exprs, line })
            }
            TokenKind::Break => {
                self.advance();
                Ok(Stmt::Break { line })
            }
            _ => self.expr_statement(line),
        }
    }

    fn at_block_end(&self) -> bool {
        matches!(
            self.peek(),
            TokenKind::End
                | TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::Eof
                | TokenKind::Semi
        )
    }

    fn expr_statement(
        &mut self,
        line: u32,
    ) -> Result<Stmt, SyntaxError> {
        let first = self.suffixed_expr()?;
        if matches!(self.peek(), TokenKind::Assign | TokenKind::Comma) {
            let mut targets = vec![self.as_target(first)?];
            while self.check(&TokenKind::Comma) {
                let next = self.suffixed_expr()?;
                targets.push(self.as_target(next)?);
            }
            self.expect(TokenKind::Assign)?;
            let exprs = self.expr_list()?;
            return Ok(Stmt::Assign {
                targets,
                exprs,
                line,
            });
        }
        if matches!(first, Expr::Call { .. }) {
            Ok(Stmt::Call { call: first, line })
        } else {
            Err(SyntaxError::new(line, "syntax error near unexpected expression"))
        }
    }

    fn as_target(
        &self,
        expr: Expr,
    ) -> Result<Target, SyntaxError> {
        match expr {
            Expr::Name(name, _) => Ok(Target::Name(name)),
            Expr::Index { object, key, .. } => Ok(Target::Index {
                object: *object,
                key: *key,
            }),
            other => Err(SyntaxError::new(
                other.line(),
                "cannot assign to this expression",
            )),
        }
    }

    fn func_body(
        &mut self,
        name: Option<String>,
    ) -> Result<Rc<FuncBody>, SyntaxError> {
        let line = self.line();
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        let mut is_vararg = false;
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.check(&TokenKind::Ellipsis) {
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.check(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        let body = self.block(&[TokenKind::End])?;
        self.expect(TokenKind::End)?;
        let _ = name;
        Ok(Rc::new(FuncBody {
            params,
            is_vararg,
            body: Rc::new(body),
            line,
        }))
    }

    fn expr_list(&mut self) -> Result<Vec<Expr>, SyntaxError> {
        let mut exprs = vec![self.expression()?];
        while self.check(&TokenKind::Comma) {
            exprs.push(self.expression()?);
        }
        Ok(exprs)
    }

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        self.binary_expr(0)
    }

    fn binary_expr(
        &mut self,
        min_prec: u8,
    ) -> Result<Expr, SyntaxError> {
        let mut lhs = self.unary_expr()?;
        while let Some((op, prec, right_assoc)) = binary_op(self.peek()) {
            if prec < min_prec {
                break;
            }
            let line = self.line();
            self.advance();
            let next_min = if right_assoc { prec } else { prec + 1 };
            let rhs = self.binary_expr(next_min)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        let op = match self.peek() {
            TokenKind::Not => Some(UnOp::Not),
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::Hash => Some(UnOp::Len),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.unary_expr()?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
                line,
            });
        }
        self.suffixed_expr()
    }

    fn suffixed_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary_expr()?;
        loop {
            let line = self.line();
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_name()?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        key: Box::new(Expr::Str(Rc::from(name.as_str()), line)),
                        line,
                    };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        key: Box::new(key),
                        line,
                    };
                }
                TokenKind::LParen => {
                    self.advance();
                    let args = if self.check(&TokenKind::RParen) {
                        Vec::new()
                    } else {
                        let args = self.expr_list()?;
                        self.expect(TokenKind::RParen)?;
                        args
                    };
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary_expr(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        match self.peek().clone() {
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::Nil(line))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::True(line))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::False(line))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n, line))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Str(Rc::from(s.as_str()), line))
            }
            TokenKind::Ellipsis => {
                self.advance();
                Ok(Expr::Vararg(line))
            }
            TokenKind::Function => {
                self.advance();
                let func = self.func_body(None)?;
                Ok(Expr::Function(func))
            }
            TokenKind::Name(n) => {
                self.advance();
                Ok(Expr::Name(n, line))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBrace => self.table_expr(),
            other => Err(SyntaxError::new(
                line,
                format!("unexpected {}", other.describe()),
            )),
        }
    }

    fn table_expr(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        self.expect(TokenKind::LBrace)?;
        let mut items = Vec::new();
        loop {
            if self.check(&TokenKind::RBrace) {
                break;
            }
            match self.peek().clone() {
                TokenKind::LBracket => {
                    self.advance();
                    let key = self.expression()?;
                    self.expect(TokenKind::RBracket)?;
                    self.expect(TokenKind::Assign)?;
                    let value = self.expression()?;
                    items.push(TableItem::Keyed(key, value));
                }
                TokenKind::Name(n) if self.tokens[self.pos + 1].kind == TokenKind::Assign => {
                    self.advance();
                    self.advance();
                    let value = self.expression()?;
                    items.push(TableItem::Named(Rc::from(n.as_str()), value));
                }
                _ => {
                    let value = self.expression()?;
                    items.push(TableItem::Positional(value));
                }
            }
            if !self.check(&TokenKind::Comma) && !self.check(&TokenKind::Semi) {
                self.expect(TokenKind::RBrace)?;
                break;
            }
        }
        Ok(Expr::Table { items, line })
    }
}

fn binary_op(kind: &TokenKind) -> Option<(BinOp, u8, bool)> {
    let op = match kind {
        TokenKind::Or => (BinOp::Or, 1, false),
        TokenKind::And => (BinOp::And, 2, false),
        TokenKind::Lt => (BinOp::Lt, 3, false),
        TokenKind::Le => (BinOp::Le, 3, false),
        TokenKind::Gt => (BinOp::Gt, 3, false),
        TokenKind::Ge => (BinOp::Ge, 3, false),
        TokenKind::EqEq => (BinOp::Eq, 3, false),
        TokenKind::NotEq => (BinOp::Ne, 3, false),
        TokenKind::Concat => (BinOp::Concat, 4, true),
        TokenKind::Plus => (BinOp::Add, 5, false),
        TokenKind::Minus => (BinOp::Sub, 5, false),
        TokenKind::Star => (BinOp::Mul, 6, false),
        TokenKind::Slash => (BinOp::Div, 6, false),
        TokenKind::Percent => (BinOp::Mod, 6, false),
        _ => return None,
    };
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_returning_table() {
        let chunk = parse("return {x = 1}", "@test").expect("parse");
        assert_eq!(chunk.block.stmts.len(), 1);
        assert!(matches!(chunk.block.stmts[0], Stmt::Return { .. }));
    }

    #[test]
    fn parses_function_definitions() {
        let chunk = parse(
            "local function add(a, b) return a + b end\nreturn {add = add}",
            "@test",
        )
        .expect("parse");
        assert!(matches!(chunk.block.stmts[0], Stmt::LocalFunction { .. }));
    }

    #[test]
    fn respects_operator_precedence() {
        let chunk = parse("return 1 + 2 * 3", "@test").expect("parse");
        let Stmt::Return { exprs, .. } = &chunk.block.stmts[0] else {
            panic!("expected return");
        };
        let Expr::Binary { op, .. } = &exprs[0] else {
            panic!("expected binary expression");
        };
        assert_eq!(*op, BinOp::Add);
    }

    #[test]
    fn parses_control_flow() {
        parse(
            "local i = 0\nwhile i < 10 do\n  i = i + 1\n  if i == 5 then break end\nend",
            "@test",
        )
        .expect("parse");
        parse("for i = 1, 10, 2 do print(i) end", "@test").expect("parse");
    }

    #[test]
    fn rejects_dangling_expression() {
        assert!(parse("1 + 2", "@test").is_err());
        assert!(parse("local x = ", "@test").is_err());
    }

    #[test]
    fn parses_table_constructors() {
        let chunk = parse(r#"return {1, 2, x = "a", ["k"] = true}"#, "@test").expect("parse");
        let Stmt::Return { exprs, .. } = &chunk.block.stmts[0] else {
            panic!("expected return");
        };
        let Expr::Table { items, .. } = &exprs[0] else {
            panic!("expected table");
        };
        assert_eq!(items.len(), 4);
    }
}
