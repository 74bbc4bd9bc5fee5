// =============================================================================
// Expression Parser — the alert DSL
// =============================================================================
//
// Grammar (whitespace-insensitive):
//
//   root      := expr ( '@' integer )?          -- cooldown only at the root
//   expr      := and ( '|' and )*
//   and       := factor ( '&' factor )*
//   factor    := condition | '(' expr ')'
//   condition := module OP number (number)*
//
// Hand-rolled tokenizer + recursive descent. Errors are typed and phrased for
// the end user — they come straight back through the command surface.
// =============================================================================

use sha2::{Digest, Sha256};

/// Comparison operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl std::fmt::Display for CmpOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        };
        f.write_str(s)
    }
}

/// Elementary predicate: `module OP p1 p2 ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub module: String,
    pub op: CmpOp,
    pub params: Vec<f64>,
}

/// Expression tree. `Cooldown` can only appear as the root.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Condition(Condition),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Cooldown(Box<Expr>, u64),
}

/// Parse failure with a message fit to show the user verbatim.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown module \"{0}\"")]
    UnknownModule(String),
    #[error("module \"{module}\" expects {expected} numeric parameter(s), got {got}")]
    BadArity {
        module: String,
        expected: &'static str,
        got: usize,
    },
    #[error("invalid number \"{0}\"")]
    BadNumber(String),
    #[error("unexpected character \"{0}\"")]
    BadCharacter(char),
    #[error("unexpected token \"{0}\"")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unbalanced parentheses")]
    UnbalancedParen,
    #[error("cooldown \"@\" is only allowed at the end of the whole expression")]
    CooldownNotAtRoot,
    #[error("cooldown seconds must be a whole non-negative number")]
    BadCooldown,
    #[error("unexpected trailing input \"{0}\"")]
    TrailingInput(String),
}

/// Allowed parameter counts per module.
fn param_spec(module: &str) -> Option<&'static [usize]> {
    match module {
        "oi" | "oi_sum" => Some(&[1]),
        "funding" => Some(&[2]),
        "price" | "volume" | "volume_change" | "order_num" => Some(&[2, 3]),
        "order" => Some(&[3]),
        _ => None,
    }
}

fn arity_label(module: &str) -> &'static str {
    match module {
        "oi" | "oi_sum" => "1",
        "funding" => "2",
        "order" => "3",
        _ => "2 or 3",
    }
}

// =============================================================================
// Tokenizer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Op(CmpOp),
    Amp,
    Pipe,
    LParen,
    RParen,
    At,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ident(s) => f.write_str(s),
            Token::Number(n) => write!(f, "{n}"),
            Token::Op(op) => write!(f, "{op}"),
            Token::Amp => f.write_str("&"),
            Token::Pipe => f.write_str("|"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::At => f.write_str("@"),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '&' => {
                chars.next();
                tokens.push(Token::Amp);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '@' => {
                chars.next();
                tokens.push(Token::At);
            }
            '>' | '<' | '=' | '!' => {
                chars.next();
                let has_eq = matches!(chars.peek(), Some('='));
                if has_eq {
                    chars.next();
                }
                let op = match (c, has_eq) {
                    ('>', false) => CmpOp::Gt,
                    ('>', true) => CmpOp::Ge,
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::Ne,
                    _ => return Err(ParseError::BadCharacter(c)),
                };
                tokens.push(Token::Op(op));
            }
            '-' | '0'..='9' | '.' => {
                let mut raw = String::new();
                raw.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' || d == '_' {
                        raw.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let cleaned: String = raw.chars().filter(|&d| d != '_').collect();
                let value: f64 = cleaned
                    .parse()
                    .map_err(|_| ParseError::BadNumber(raw.clone()))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(ParseError::BadCharacter(other)),
        }
    }
    Ok(tokens)
}

// =============================================================================
// Parser
// =============================================================================

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
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut items = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.next();
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.pop().expect("non-empty")
        } else {
            Expr::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut items = vec![self.parse_factor()?];
        while matches!(self.peek(), Some(Token::Amp)) {
            self.next();
            items.push(self.parse_factor()?);
        }
        Ok(if items.len() == 1 {
            items.pop().expect("non-empty")
        } else {
            Expr::And(items)
        })
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.next();
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    // A cooldown nested inside parentheses is a user mistake
                    // worth its own message.
                    Some(Token::At) => Err(ParseError::CooldownNotAtRoot),
                    Some(tok) => Err(ParseError::UnexpectedToken(tok.to_string())),
                    None => Err(ParseError::UnbalancedParen),
                }
            }
            Some(Token::Ident(_)) => self.parse_condition(),
            Some(tok) => Err(ParseError::UnexpectedToken(tok.to_string())),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn parse_condition(&mut self) -> Result<Expr, ParseError> {
        let module = match self.next() {
            Some(Token::Ident(m)) => m,
            _ => return Err(ParseError::UnexpectedEnd),
        };
        let Some(allowed) = param_spec(&module) else {
            return Err(ParseError::UnknownModule(module));
        };

        let op = match self.next() {
            Some(Token::Op(op)) => op,
            Some(tok) => return Err(ParseError::UnexpectedToken(tok.to_string())),
            None => return Err(ParseError::UnexpectedEnd),
        };

        let mut params = Vec::new();
        match self.next() {
            Some(Token::Number(n)) => params.push(n),
            Some(tok) => return Err(ParseError::UnexpectedToken(tok.to_string())),
            None => return Err(ParseError::UnexpectedEnd),
        }
        while let Some(Token::Number(n)) = self.peek() {
            params.push(*n);
            self.next();
        }

        if !allowed.contains(&params.len()) {
            return Err(ParseError::BadArity {
                expected: arity_label(&module),
                got: params.len(),
                module,
            });
        }

        Ok(Expr::Condition(Condition { module, op, params }))
    }
}

/// Parse a user expression into its AST.
pub fn parse_expression(text: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;

    let expr = if matches!(parser.peek(), Some(Token::At)) {
        parser.next();
        let seconds = match parser.next() {
            Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => n as u64,
            Some(Token::Number(_)) => return Err(ParseError::BadCooldown),
            _ => return Err(ParseError::BadCooldown),
        };
        Expr::Cooldown(Box::new(expr), seconds)
    } else {
        expr
    };

    match parser.peek() {
        None => Ok(expr),
        Some(Token::RParen) => Err(ParseError::UnbalancedParen),
        Some(Token::At) => Err(ParseError::CooldownNotAtRoot),
        Some(tok) => Err(ParseError::TrailingInput(tok.to_string())),
    }
}

// =============================================================================
// Canonical rendering & fingerprints
// =============================================================================

/// Render a number the way the canonical form expects: integers without a
/// trailing ".0", everything else as-is.
fn render_num(n: f64) -> String {
    format!("{n}")
}

/// Canonical text form. Identical expressions render identically regardless
/// of surface whitespace, so fingerprints collide exactly when they should.
///
/// `Or` children of an `And` are parenthesized so the rendering re-parses to
/// the same tree.
pub fn render(expr: &Expr) -> String {
    match expr {
        Expr::Condition(c) => {
            let params: Vec<String> = c.params.iter().map(|p| render_num(*p)).collect();
            format!("{} {} {}", c.module, c.op, params.join(" "))
        }
        Expr::And(items) => items
            .iter()
            .map(|e| match e {
                Expr::Or(_) => format!("({})", render(e)),
                _ => render(e),
            })
            .collect::<Vec<_>>()
            .join(" & "),
        Expr::Or(items) => items.iter().map(render).collect::<Vec<_>>().join(" | "),
        Expr::Cooldown(inner, seconds) => format!("{} @{}", render(inner), seconds),
    }
}

/// Deterministic identifier for a canonical string.
pub fn fingerprint_str(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Deterministic identifier for an expression.
pub fn expr_fingerprint(expr: &Expr) -> String {
    fingerprint_str(&render(expr))
}

/// All leaf conditions of a tree, left to right.
pub fn collect_conditions(expr: &Expr) -> Vec<&Condition> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<&'a Condition>) {
        match expr {
            Expr::Condition(c) => out.push(c),
            Expr::And(items) | Expr::Or(items) => {
                for item in items {
                    walk(item, out);
                }
            }
            Expr::Cooldown(inner, _) => walk(inner, out),
        }
    }
    let mut out = Vec::new();
    walk(expr, &mut out);
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(module: &str, op: CmpOp, params: &[f64]) -> Expr {
        Expr::Condition(Condition {
            module: module.to_string(),
            op,
            params: params.to_vec(),
        })
    }

    #[test]
    fn parses_single_condition() {
        let expr = parse_expression("price > 5 300").unwrap();
        assert_eq!(expr, cond("price", CmpOp::Gt, &[5.0, 300.0]));
    }

    #[test]
    fn parses_and_or_with_precedence() {
        let expr = parse_expression("price > 5 300 & oi < 100 | funding > 0.1 600").unwrap();
        // '&' binds tighter than '|'.
        match expr {
            Expr::Or(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(items[0], Expr::And(_)));
                assert!(matches!(items[1], Expr::Condition(_)));
            }
            other => panic!("expected Or at root, got {other:?}"),
        }
    }

    #[test]
    fn parentheses_override_precedence() {
        let expr = parse_expression("price > 5 300 & (oi < 100 | funding > 0.1 600)").unwrap();
        match expr {
            Expr::And(items) => {
                assert!(matches!(items[0], Expr::Condition(_)));
                assert!(matches!(items[1], Expr::Or(_)));
            }
            other => panic!("expected And at root, got {other:?}"),
        }
    }

    #[test]
    fn cooldown_only_at_root() {
        let expr = parse_expression("price > 5 300 @10").unwrap();
        assert!(matches!(expr, Expr::Cooldown(_, 10)));

        let err = parse_expression("(price > 5 300 @10) & oi < 100").unwrap_err();
        assert_eq!(err, ParseError::CooldownNotAtRoot);
    }

    #[test]
    fn unknown_module_is_precise() {
        let err = parse_expression("prize > 5 300").unwrap_err();
        assert_eq!(err, ParseError::UnknownModule("prize".into()));
    }

    #[test]
    fn bad_arity_is_precise() {
        let err = parse_expression("oi > 5 300").unwrap_err();
        assert_eq!(
            err,
            ParseError::BadArity {
                module: "oi".into(),
                expected: "1",
                got: 2
            }
        );

        let err = parse_expression("price > 5").unwrap_err();
        assert!(matches!(err, ParseError::BadArity { got: 1, .. }));
    }

    #[test]
    fn malformed_number_is_an_error() {
        // "foo" where a number is required — scenario S6.
        let err = parse_expression("price > foo").unwrap_err();
        assert_eq!(err, ParseError::UnexpectedToken("foo".into()));
    }

    #[test]
    fn unbalanced_parens_is_an_error() {
        assert_eq!(
            parse_expression("(price > 5 300").unwrap_err(),
            ParseError::UnbalancedParen
        );
        assert_eq!(
            parse_expression("price > 5 300)").unwrap_err(),
            ParseError::UnbalancedParen
        );
    }

    #[test]
    fn negative_thresholds_parse() {
        let expr = parse_expression("funding > -0.05 600").unwrap();
        assert_eq!(expr, cond("funding", CmpOp::Gt, &[-0.05, 600.0]));
    }

    #[test]
    fn underscored_numbers_parse() {
        let expr = parse_expression("volume > 1_000_000 60").unwrap();
        assert_eq!(expr, cond("volume", CmpOp::Gt, &[1_000_000.0, 60.0]));
    }

    #[test]
    fn fingerprint_ignores_surface_whitespace() {
        let a = parse_expression("price > 5 300 & oi < 100").unwrap();
        let b = parse_expression("  price   >  5   300&oi<100 ").unwrap();
        assert_eq!(expr_fingerprint(&a), expr_fingerprint(&b));
    }

    #[test]
    fn fingerprint_distinguishes_cooldown() {
        let a = parse_expression("price > 5 300").unwrap();
        let b = parse_expression("price > 5 300 @10").unwrap();
        assert_ne!(expr_fingerprint(&a), expr_fingerprint(&b));
    }

    #[test]
    fn render_parse_round_trip_preserves_fingerprint() {
        for text in [
            "price > 5 300",
            "price > 5 300 & oi < 100",
            "price > 5 300 & (oi < 100 | volume_change > 50 600)",
            "(price > 5 300 | oi < 100) & funding > 0.1 600",
            "price > 5 300 & oi < 100 @10",
            "volume > 1000000 60 | order_num > 50 600",
        ] {
            let ast = parse_expression(text).unwrap();
            let reparsed = parse_expression(&render(&ast)).unwrap();
            assert_eq!(
                expr_fingerprint(&ast),
                expr_fingerprint(&reparsed),
                "round trip failed for {text}"
            );
        }
    }

    #[test]
    fn collect_conditions_walks_left_to_right() {
        let expr = parse_expression("price > 5 300 & (oi < 100 | volume > 1000 60)").unwrap();
        let mods: Vec<&str> = collect_conditions(&expr)
            .iter()
            .map(|c| c.module.as_str())
            .collect();
        assert_eq!(mods, vec!["price", "oi", "volume"]);
    }
}
