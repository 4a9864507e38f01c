//! Tokenizer for rule queries

use super::SqlError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    /// Bare identifier or keyword
    Ident(String),
    /// Backtick-quoted identifier, never treated as a keyword
    Quoted(String),
    String(String),
    Integer(i64),
    Float(f64),
    Comma,
    Dot,
    LParen,
    RParen,
    Star,
    Plus,
    Minus,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl Token {
    /// Whether this token is the given keyword (case-insensitive)
    pub(crate) fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Ident(word) if word.eq_ignore_ascii_case(keyword))
    }
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, SqlError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            c if c.is_whitespace() => pos += 1,
            ',' => push(&mut tokens, &mut pos, Token::Comma),
            '.' if !chars.get(pos + 1).is_some_and(|c| c.is_ascii_digit()) => {
                push(&mut tokens, &mut pos, Token::Dot)
            }
            '(' => push(&mut tokens, &mut pos, Token::LParen),
            ')' => push(&mut tokens, &mut pos, Token::RParen),
            '*' => push(&mut tokens, &mut pos, Token::Star),
            '+' => push(&mut tokens, &mut pos, Token::Plus),
            '-' => push(&mut tokens, &mut pos, Token::Minus),
            '/' => push(&mut tokens, &mut pos, Token::Slash),
            '%' => push(&mut tokens, &mut pos, Token::Percent),
            '=' => push(&mut tokens, &mut pos, Token::Eq),
            '!' if chars.get(pos + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                pos += 2;
            }
            '<' => match chars.get(pos + 1) {
                Some('=') => {
                    tokens.push(Token::LtEq);
                    pos += 2;
                }
                Some('>') => {
                    tokens.push(Token::NotEq);
                    pos += 2;
                }
                _ => push(&mut tokens, &mut pos, Token::Lt),
            },
            '>' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::GtEq);
                    pos += 2;
                } else {
                    push(&mut tokens, &mut pos, Token::Gt);
                }
            }
            '\'' | '"' => {
                let (value, next) = read_quoted(&chars, pos, c)?;
                tokens.push(Token::String(value));
                pos = next;
            }
            '`' => {
                let (value, next) = read_quoted(&chars, pos, '`')?;
                if value.is_empty() {
                    return Err(SqlError::Syntax("empty quoted identifier".to_string()));
                }
                tokens.push(Token::Quoted(value));
                pos = next;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let (token, next) = read_number(&chars, pos)?;
                tokens.push(token);
                pos = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                    pos += 1;
                }
                tokens.push(Token::Ident(chars[start..pos].iter().collect()));
            }
            other => {
                return Err(SqlError::Syntax(format!("unexpected character '{}'", other)));
            }
        }
    }

    Ok(tokens)
}

fn push(tokens: &mut Vec<Token>, pos: &mut usize, token: Token) {
    tokens.push(token);
    *pos += 1;
}

/// Read a quoted run; a doubled quote character stands for itself
fn read_quoted(chars: &[char], start: usize, quote: char) -> Result<(String, usize), SqlError> {
    let mut value = String::new();
    let mut pos = start + 1;

    while pos < chars.len() {
        if chars[pos] == quote {
            if chars.get(pos + 1) == Some(&quote) {
                value.push(quote);
                pos += 2;
                continue;
            }
            return Ok((value, pos + 1));
        }
        value.push(chars[pos]);
        pos += 1;
    }

    Err(SqlError::Syntax(format!("unterminated {} quote", quote)))
}

fn read_number(chars: &[char], start: usize) -> Result<(Token, usize), SqlError> {
    let mut pos = start;
    let mut is_float = false;

    while pos < chars.len() {
        match chars[pos] {
            c if c.is_ascii_digit() => pos += 1,
            '.' if !is_float => {
                is_float = true;
                pos += 1;
            }
            'e' | 'E' => {
                is_float = true;
                pos += 1;
                if matches!(chars.get(pos), Some('+') | Some('-')) {
                    pos += 1;
                }
            }
            _ => break,
        }
    }

    let text: String = chars[start..pos].iter().collect();
    let token = if is_float {
        text.parse::<f64>().map(Token::Float).ok()
    } else {
        text.parse::<i64>().map(Token::Integer).ok()
    };

    token
        .map(|t| (t, pos))
        .ok_or_else(|| SqlError::Syntax(format!("invalid number '{}'", text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tokenize_select() {
        let tokens = tokenize("SELECT `value` + 1 AS v, a.b FROM t WHERE x <> 'it''s'").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("SELECT".into()),
                Token::Quoted("value".into()),
                Token::Plus,
                Token::Integer(1),
                Token::Ident("AS".into()),
                Token::Ident("v".into()),
                Token::Comma,
                Token::Ident("a".into()),
                Token::Dot,
                Token::Ident("b".into()),
                Token::Ident("FROM".into()),
                Token::Ident("t".into()),
                Token::Ident("WHERE".into()),
                Token::Ident("x".into()),
                Token::NotEq,
                Token::String("it's".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_numbers_and_operators() {
        let tokens = tokenize("1.5 >= .5 != 2e3 <= 7").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Float(1.5),
                Token::GtEq,
                Token::Float(0.5),
                Token::NotEq,
                Token::Float(2000.0),
                Token::LtEq,
                Token::Integer(7),
            ]
        );
    }

    #[test]
    fn test_tokenize_errors() {
        assert!(tokenize("'open").is_err());
        assert!(tokenize("a ; b").is_err());
        assert!(tokenize("``").is_err());
    }
}
