//! Restricted arithmetic expression evaluator
//!
//! Accepts numeric literals, `+ - * / ^`, parentheses and unary minus.
//! Everything else is a disallowed token — no identifiers, no function
//! calls, no arbitrary code execution.

use crate::error::OrchestrationError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '^' => {
                chars.next();
                tokens.push(Token::Caret);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let literal = &expression[start..end];
                let value: f64 = literal.parse().map_err(|_| {
                    OrchestrationError::Calculation(format!(
                        "Invalid numeric literal '{}'",
                        literal
                    ))
                })?;
                tokens.push(Token::Number(value));
            }
            other => {
                return Err(OrchestrationError::Calculation(format!(
                    "Disallowed token '{}' in expression",
                    other
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    position: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.position).copied()
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.peek();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.advance();
                    value += self.term()?;
                }
                Token::Minus => {
                    self.advance();
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> Result<f64> {
        let mut value = self.unary()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.advance();
                    value *= self.unary()?;
                }
                Token::Slash => {
                    self.advance();
                    value /= self.unary()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // unary := '-' unary | power
    fn unary(&mut self) -> Result<f64> {
        if self.peek() == Some(Token::Minus) {
            self.advance();
            return Ok(-self.unary()?);
        }
        self.power()
    }

    // power := primary ('^' unary)?   (right-associative)
    fn power(&mut self) -> Result<f64> {
        let base = self.primary()?;
        if self.peek() == Some(Token::Caret) {
            self.advance();
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(OrchestrationError::Calculation(
                        "Unbalanced parentheses in expression".to_string(),
                    )),
                }
            }
            other => Err(OrchestrationError::Calculation(format!(
                "Unexpected token {:?} in expression",
                other
            ))),
        }
    }
}

/// Evaluate a restricted arithmetic expression. Callers are expected to
/// reject non-finite results.
pub fn evaluate(expression: &str) -> Result<f64> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(OrchestrationError::Calculation(
            "Empty expression".to_string(),
        ));
    }

    let mut parser = Parser {
        tokens: &tokens,
        position: 0,
    };
    let value = parser.expr()?;

    if parser.position != tokens.len() {
        return Err(OrchestrationError::Calculation(
            "Trailing tokens in expression".to_string(),
        ));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expression: &str) -> f64 {
        evaluate(expression).unwrap()
    }

    #[test]
    fn basic_arithmetic_and_precedence() {
        assert_eq!(eval("2 + 3 * 4"), 14.0);
        assert_eq!(eval("(2 + 3) * 4"), 20.0);
        assert_eq!(eval("10 / 4"), 2.5);
        assert_eq!(eval("10 - 3 - 2"), 5.0);
    }

    #[test]
    fn unary_minus_and_power() {
        assert_eq!(eval("-3 + 5"), 2.0);
        assert_eq!(eval("2 ^ 10"), 1024.0);
        // Right-associative: 2^(3^2)
        assert_eq!(eval("2 ^ 3 ^ 2"), 512.0);
        let cagr = eval("((3689 / 3200) ^ (1 / 1) - 1) * 100");
        assert!((cagr - 15.28125).abs() < 1e-9);
    }

    #[test]
    fn percentage_change_formula() {
        let value = eval("(3689 - 3200) / 3200 * 100");
        assert!((value - 15.28125).abs() < 1e-9);
    }

    #[test]
    fn identifiers_are_disallowed() {
        assert!(evaluate("net_profit / 2").is_err());
        assert!(evaluate("exec('rm')").is_err());
        assert!(evaluate("2 + x").is_err());
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(evaluate("").is_err());
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("1 2").is_err());
        assert!(evaluate("1..5 + 2").is_err());
    }

    #[test]
    fn division_by_zero_is_non_finite() {
        let value = eval("1 / 0");
        assert!(!value.is_finite());
    }
}
