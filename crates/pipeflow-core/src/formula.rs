//! Evaluador aritmético acotado para límites de runtime.
//!
//! Gramática (sin funciones, sin asignaciones, sin acceso a nada fuera de las
//! variables provistas):
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/') unary)*
//! unary  := '-' unary | atom
//! atom   := NUMBER | IDENT | '(' expr ')'
//! ```
//!
//! Los identificadores se resuelven sin distinguir mayúsculas; el único que
//! usa el motor es `SAMPLE_COUNT`.
use std::collections::HashMap;

use pipeflow_domain::RuntimeLimit;
use thiserror::Error;

/// Variable con la cantidad de muestras de la ejecución.
pub const SAMPLE_COUNT: &str = "SAMPLE_COUNT";

const MAX_DEPTH: usize = 32;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormulaError {
    #[error("unexpected character '{0}' at {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token at {0}")]
    UnexpectedToken(usize),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("expression nested too deeply")]
    TooDeep,
    #[error("result is not a finite number")]
    NotFinite,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, FormulaError> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                out.push((i, Token::Plus));
                i += 1;
            }
            '-' => {
                out.push((i, Token::Minus));
                i += 1;
            }
            '*' => {
                out.push((i, Token::Star));
                i += 1;
            }
            '/' => {
                out.push((i, Token::Slash));
                i += 1;
            }
            '(' => {
                out.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                out.push((i, Token::RParen));
                i += 1;
            }
            d if d.is_ascii_digit() || d == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let lit: String = chars[start..i].iter().collect();
                let n = lit.parse::<f64>().map_err(|_| FormulaError::UnexpectedChar(d, start))?;
                out.push((start, Token::Num(n)));
            }
            a if a.is_ascii_alphabetic() || a == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push((start, Token::Ident(chars[start..i].iter().collect())));
            }
            other => return Err(FormulaError::UnexpectedChar(other, i)),
        }
    }
    Ok(out)
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    vars: &'a HashMap<String, f64>,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> Result<f64, FormulaError> {
        let mut acc = self.term()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Plus => { self.pos += 1; acc += self.term()?; }
                Token::Minus => { self.pos += 1; acc -= self.term()?; }
                _ => break,
            }
        }
        Ok(acc)
    }

    fn term(&mut self) -> Result<f64, FormulaError> {
        let mut acc = self.unary()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Star => { self.pos += 1; acc *= self.unary()?; }
                Token::Slash => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    if rhs == 0.0 {
                        return Err(FormulaError::DivisionByZero);
                    }
                    acc /= rhs;
                }
                _ => break,
            }
        }
        Ok(acc)
    }

    fn unary(&mut self) -> Result<f64, FormulaError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.pos += 1;
            return self.nested(|p| p.unary()).map(|v| -v);
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<f64, FormulaError> {
        match self.next() {
            Some((_, Token::Num(n))) => Ok(n),
            Some((_, Token::Ident(name))) => self.vars
                                                 .get(&name.to_ascii_uppercase())
                                                 .copied()
                                                 .ok_or(FormulaError::UnknownVariable(name)),
            Some((_, Token::LParen)) => {
                let v = self.nested(|p| p.expr())?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(v),
                    Some((at, _)) => Err(FormulaError::UnexpectedToken(at)),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some((at, _)) => Err(FormulaError::UnexpectedToken(at)),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }

    fn nested<F>(&mut self, f: F) -> Result<f64, FormulaError>
        where F: FnOnce(&mut Self) -> Result<f64, FormulaError>
    {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FormulaError::TooDeep);
        }
        let r = f(self);
        self.depth -= 1;
        r
    }
}

/// Evalúa `expression` con las variables dadas (claves en mayúsculas).
pub fn evaluate(expression: &str, vars: &HashMap<String, f64>) -> Result<f64, FormulaError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0, vars, depth: 0 };
    let value = parser.expr()?;
    if let Some((at, _)) = parser.tokens.get(parser.pos) {
        return Err(FormulaError::UnexpectedToken(*at));
    }
    if !value.is_finite() {
        return Err(FormulaError::NotFinite);
    }
    Ok(value)
}

/// Resuelve un `RuntimeLimit` a segundos para `sample_count` muestras.
/// Resultados negativos se truncan a 0; fracciones se redondean hacia arriba.
pub fn runtime_limit_secs(limit: &RuntimeLimit, sample_count: usize) -> Result<u64, FormulaError> {
    match limit {
        RuntimeLimit::Seconds(s) => Ok(*s),
        RuntimeLimit::Formula(expr) => {
            let mut vars = HashMap::new();
            vars.insert(SAMPLE_COUNT.to_string(), sample_count as f64);
            let v = evaluate(expr, &vars)?;
            Ok(v.max(0.0).ceil() as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str, samples: f64) -> Result<f64, FormulaError> {
        let mut vars = HashMap::new();
        vars.insert(SAMPLE_COUNT.to_string(), samples);
        evaluate(expr, &vars)
    }

    #[test]
    fn precedence_and_parentheses() {
        assert_eq!(eval("1 + 2 * 3", 0.0).unwrap(), 7.0);
        assert_eq!(eval("(1 + 2) * 3", 0.0).unwrap(), 9.0);
        assert_eq!(eval("10 - 4 - 3", 0.0).unwrap(), 3.0);
        assert_eq!(eval("-2 * -3", 0.0).unwrap(), 6.0);
        assert_eq!(eval("7 / 2", 0.0).unwrap(), 3.5);
    }

    #[test]
    fn sample_count_variable_is_case_insensitive() {
        assert_eq!(eval("SAMPLE_COUNT * 60 + 300", 4.0).unwrap(), 540.0);
        assert_eq!(eval("sample_count * 2", 4.0).unwrap(), 8.0);
    }

    #[test]
    fn rejects_anything_outside_the_grammar() {
        assert_eq!(eval("HOME * 2", 1.0), Err(FormulaError::UnknownVariable("HOME".into())));
        assert!(matches!(eval("2 ** 3", 1.0), Err(FormulaError::UnexpectedToken(_))));
        assert!(matches!(eval("system(1)", 1.0), Err(FormulaError::UnknownVariable(_))));
        assert!(matches!(eval("1; 2", 1.0), Err(FormulaError::UnexpectedChar(';', 1))));
        assert_eq!(eval("(1 + 2", 1.0), Err(FormulaError::UnexpectedEnd));
        assert_eq!(eval("1 / (SAMPLE_COUNT - 1)", 1.0), Err(FormulaError::DivisionByZero));
        let deep = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(eval(&deep, 1.0), Err(FormulaError::TooDeep));
    }

    #[test]
    fn runtime_limit_rounds_up_and_clamps() {
        assert_eq!(runtime_limit_secs(&RuntimeLimit::Seconds(90), 3).unwrap(), 90);
        assert_eq!(runtime_limit_secs(&RuntimeLimit::Formula("SAMPLE_COUNT / 4".into()), 3).unwrap(), 1);
        assert_eq!(runtime_limit_secs(&RuntimeLimit::Formula("60 - SAMPLE_COUNT * 100".into()), 3).unwrap(), 0);
    }
}
