use quill_core::tools::{InputSchema, Tool, ToolError, ToolInput};

const MAX_EXPRESSION_LEN: usize = 256;

/// Evaluates arithmetic expressions.
pub struct CalculatorTool;

impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluates an arithmetic expression. Supports + - * / % ^, parentheses, \
         sqrt abs ln log exp sin cos tan floor ceil round, and the constants pi and e."
    }

    fn input_schema(&self) -> InputSchema {
        InputSchema::Text {
            max_len: MAX_EXPRESSION_LEN,
        }
    }

    fn execute(&self, input: ToolInput) -> Result<String, ToolError> {
        let expr = input
            .as_text()
            .ok_or_else(|| ToolError::InvalidArguments("expected an expression".into()))?;
        let value = evaluate(expr)?;
        Ok(format_number(value))
    }
}

pub fn evaluate(expr: &str) -> Result<f64, ToolError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if let Some(tok) = parser.peek() {
        return Err(ToolError::InvalidArguments(format!("unexpected {tok}")));
    }
    if !value.is_finite() {
        return Err(ToolError::ExecutionFailed("result is not a finite number".into()));
    }
    Ok(value)
}

/// Integral values print without a fractional part.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Num(n) => write!(f, "number {n}"),
            Self::Ident(s) => write!(f, "`{s}`"),
            Self::Op(c) => write!(f, "`{c}`"),
            Self::LParen => write!(f, "`(`"),
            Self::RParen => write!(f, "`)`"),
        }
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ToolError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let literal = &expr[start..end];
                let n = literal
                    .parse::<f64>()
                    .map_err(|_| ToolError::InvalidArguments(format!("bad number `{literal}`")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() {
                        end = i + 1;
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(expr[start..end].to_ascii_lowercase()));
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            other => {
                return Err(ToolError::InvalidArguments(format!("unexpected character `{other}`")));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat_op(&mut self, ops: &[char]) -> Option<char> {
        match self.peek() {
            Some(Token::Op(c)) if ops.contains(c) => {
                let c = *c;
                self.pos += 1;
                Some(c)
            }
            _ => None,
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, ToolError> {
        let mut value = self.term()?;
        while let Some(op) = self.eat_op(&['+', '-']) {
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    // term := unary (('*' | '/' | '%') unary)*
    fn term(&mut self) -> Result<f64, ToolError> {
        let mut value = self.unary()?;
        while let Some(op) = self.eat_op(&['*', '/', '%']) {
            let rhs = self.unary()?;
            if (op == '/' || op == '%') && rhs == 0.0 {
                return Err(ToolError::ExecutionFailed("division by zero".into()));
            }
            value = match op {
                '*' => value * rhs,
                '/' => value / rhs,
                _ => value % rhs,
            };
        }
        Ok(value)
    }

    // unary := ('-' | '+') unary | power
    fn unary(&mut self) -> Result<f64, ToolError> {
        match self.eat_op(&['-', '+']) {
            Some('-') => Ok(-self.unary()?),
            Some(_) => self.unary(),
            None => self.power(),
        }
    }

    // power := primary ('^' unary)?
    fn power(&mut self) -> Result<f64, ToolError> {
        let base = self.primary()?;
        if self.eat_op(&['^']).is_some() {
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, ToolError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                self.expect_rparen()?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let arg = self.expr()?;
                    self.expect_rparen()?;
                    apply(&name, arg)
                } else {
                    constant(&name)
                }
            }
            Some(tok) => Err(ToolError::InvalidArguments(format!("unexpected {tok}"))),
            None => Err(ToolError::InvalidArguments("unexpected end of expression".into())),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), ToolError> {
        match self.next() {
            Some(Token::RParen) => Ok(()),
            _ => Err(ToolError::InvalidArguments("missing `)`".into())),
        }
    }
}

fn constant(name: &str) -> Result<f64, ToolError> {
    match name {
        "pi" => Ok(std::f64::consts::PI),
        "e" => Ok(std::f64::consts::E),
        other => Err(ToolError::InvalidArguments(format!("unknown constant `{other}`"))),
    }
}

fn apply(name: &str, x: f64) -> Result<f64, ToolError> {
    let value = match name {
        "sqrt" => x.sqrt(),
        "abs" => x.abs(),
        "ln" => x.ln(),
        "log" => x.log10(),
        "exp" => x.exp(),
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        "round" => x.round(),
        other => return Err(ToolError::InvalidArguments(format!("unknown function `{other}`"))),
    };
    Ok(value)
}
