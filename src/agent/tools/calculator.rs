use async_trait::async_trait;
use serde_json::{Value, json};

use super::{ParamKind, ParamSpec, Tool, ToolContext, ToolOutput, ToolSpec};

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "calculator".into(),
            description: "Evaluate an arithmetic expression with + - * / % ^ and parentheses.".into(),
            parameters: vec![ParamSpec::required("expr", ParamKind::String, "Expression to evaluate, e.g. (2+3)*4")],
        }
    }

    async fn run(&self, _ctx: ToolContext<'_>, args: Value) -> anyhow::Result<ToolOutput> {
        let expr = args.get("expr").and_then(|v| v.as_str()).ok_or_else(|| anyhow::anyhow!("missing expr"))?;
        let value = evaluate(expr)?;
        Ok(ToolOutput { summary: format_number(value), data: Some(json!({ "expr": expr, "value": value })) })
    }
}

pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Nesting limit for parentheses, unary signs and exponent chains.
pub const MAX_DEPTH: usize = 128;

pub fn evaluate(expr: &str) -> anyhow::Result<f64> {
    let tokens = tokenize(expr)?;
    let mut p = Parser { tokens, pos: 0, depth: 0 };
    let v = p.expr()?;
    if p.pos != p.tokens.len() {
        anyhow::bail!("unexpected token at position {}", p.pos);
    }
    if !v.is_finite() {
        anyhow::bail!("result is not a finite number");
    }
    Ok(v)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Op(char),
    LParen,
    RParen,
}

fn tokenize(s: &str) -> anyhow::Result<Vec<Token>> {
    let mut out = Vec::new();
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let lit: String = chars[start..i].iter().collect();
                let n = lit.parse::<f64>().map_err(|_| anyhow::anyhow!("bad number: {}", lit))?;
                out.push(Token::Num(n));
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                out.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            other => anyhow::bail!("unexpected character: {}", other),
        }
    }
    if out.is_empty() {
        anyhow::bail!("empty expression");
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn expr(&mut self) -> anyhow::Result<f64> {
        let mut acc = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            acc = if op == '+' { acc + rhs } else { acc - rhs };
        }
        Ok(acc)
    }

    fn term(&mut self) -> anyhow::Result<f64> {
        let mut acc = self.factor()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            acc = match op {
                '*' => acc * rhs,
                _ if rhs == 0.0 => anyhow::bail!("division by zero"),
                '/' => acc / rhs,
                _ => acc % rhs,
            };
        }
        Ok(acc)
    }

    // every recursive path passes through here
    fn factor(&mut self) -> anyhow::Result<f64> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            anyhow::bail!("expression nested too deeply (limit {})", MAX_DEPTH);
        }
        let v = self.unary();
        self.depth -= 1;
        v
    }

    // unary minus binds looser than ^, so -2^2 == -4
    fn unary(&mut self) -> anyhow::Result<f64> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.factor()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> anyhow::Result<f64> {
        let base = self.primary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exp = self.factor()?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn primary(&mut self) -> anyhow::Result<f64> {
        match self.peek() {
            Some(Token::Num(n)) => {
                self.pos += 1;
                Ok(n)
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let v = self.expr()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(v)
                    }
                    _ => anyhow::bail!("missing closing parenthesis"),
                }
            }
            Some(t) => anyhow::bail!("unexpected token {:?}", t),
            None => anyhow::bail!("unexpected end of expression"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_with_precedence() {
        assert_eq!(evaluate("2+2").unwrap(), 4.0);
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("2^3^2").unwrap(), 512.0);
        assert_eq!(evaluate("-2^2").unwrap(), -4.0);
        assert_eq!(evaluate("10 % 4").unwrap(), 2.0);
        assert_eq!(evaluate("7 / 2").unwrap(), 3.5);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(evaluate("1 / 0").is_err());
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("1 2").is_err());
        assert!(evaluate("abc").is_err());
        assert!(evaluate("").is_err());
    }

    #[test]
    fn deep_nesting_is_an_error_not_a_crash() {
        let parens = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        let err = evaluate(&parens).unwrap_err();
        assert!(err.to_string().contains("nested too deeply"));

        assert!(evaluate(&format!("{}1", "-".repeat(100_000))).is_err());
        assert!(evaluate(&vec!["2"; 50_000].join("^")).is_err());
    }

    #[test]
    fn moderate_nesting_still_evaluates() {
        let expr = format!("{}1{}", "(".repeat(50), ")".repeat(50));
        assert_eq!(evaluate(&expr).unwrap(), 1.0);
        assert_eq!(evaluate("--2").unwrap(), 2.0);
    }

    #[test]
    fn integral_results_render_without_fraction() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-12.0), "-12");
        assert_eq!(format_number(3.5), "3.5");
    }
}
