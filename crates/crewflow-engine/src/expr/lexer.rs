use crewflow_core::error::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,
}

/// A token with its byte offset in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Spanned>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let token = match c {
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'[' => Token::LBracket,
            b']' => Token::RBracket,
            b',' => Token::Comma,
            b'.' if !next_is_digit(bytes, i + 1) => Token::Dot,
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => Token::Star,
            b'/' => Token::Slash,
            b'%' => Token::Percent,
            b'=' if peek(bytes, i + 1) == Some(b'=') => {
                i += 1;
                Token::Eq
            }
            b'!' if peek(bytes, i + 1) == Some(b'=') => {
                i += 1;
                Token::Ne
            }
            b'!' => Token::Bang,
            b'<' if peek(bytes, i + 1) == Some(b'=') => {
                i += 1;
                Token::Le
            }
            b'<' => Token::Lt,
            b'>' if peek(bytes, i + 1) == Some(b'=') => {
                i += 1;
                Token::Ge
            }
            b'>' => Token::Gt,
            b'&' if peek(bytes, i + 1) == Some(b'&') => {
                i += 1;
                Token::AndAnd
            }
            b'|' if peek(bytes, i + 1) == Some(b'|') => {
                i += 1;
                Token::OrOr
            }
            b'"' | b'\'' => {
                let (s, end) = lex_string(src, i)?;
                tokens.push(Spanned {
                    token: Token::Str(s),
                    offset: start,
                });
                i = end;
                continue;
            }
            b'0'..=b'9' | b'.' => {
                let (token, end) = lex_number(src, i)?;
                tokens.push(Spanned { token, offset: start });
                i = end;
                continue;
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let mut end = i;
                while end < bytes.len() && (bytes[end] == b'_' || bytes[end].is_ascii_alphanumeric())
                {
                    end += 1;
                }
                tokens.push(Spanned {
                    token: Token::Ident(src[i..end].to_string()),
                    offset: start,
                });
                i = end;
                continue;
            }
            _ => {
                let ch = src[i..].chars().next().unwrap_or('?');
                return Err(ExprError::Syntax {
                    offset: i,
                    message: format!("unexpected character '{}'", ch),
                });
            }
        };

        tokens.push(Spanned { token, offset: start });
        i += 1;
    }

    Ok(tokens)
}

fn peek(bytes: &[u8], i: usize) -> Option<u8> {
    bytes.get(i).copied()
}

fn next_is_digit(bytes: &[u8], i: usize) -> bool {
    peek(bytes, i).is_some_and(|b| b.is_ascii_digit())
}

fn lex_number(src: &str, start: usize) -> Result<(Token, usize), ExprError> {
    let bytes = src.as_bytes();
    let mut end = start;
    let mut is_float = false;

    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' | b'_' => end += 1,
            b'.' if !is_float && next_is_digit(bytes, end + 1) => {
                is_float = true;
                end += 1;
            }
            b'e' | b'E' => {
                is_float = true;
                end += 1;
                if matches!(peek(bytes, end), Some(b'+') | Some(b'-')) {
                    end += 1;
                }
            }
            _ => break,
        }
    }

    let text: String = src[start..end].chars().filter(|c| *c != '_').collect();
    let invalid = || ExprError::Syntax {
        offset: start,
        message: format!("invalid number '{}'", &src[start..end]),
    };

    let token = if is_float {
        Token::Float(text.parse().map_err(|_| invalid())?)
    } else {
        match text.parse::<i64>() {
            Ok(n) => Token::Int(n),
            Err(_) => Token::Float(text.parse().map_err(|_| invalid())?),
        }
    };
    Ok((token, end))
}

fn lex_string(src: &str, start: usize) -> Result<(String, usize), ExprError> {
    let quote = src.as_bytes()[start] as char;
    let mut out = String::new();
    let mut chars = src[start + 1..].char_indices();

    while let Some((idx, c)) = chars.next() {
        match c {
            c if c == quote => return Ok((out, start + 1 + idx + c.len_utf8())),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, other)) => out.push(other),
                None => break,
            },
            c => out.push(c),
        }
    }

    Err(ExprError::Syntax {
        offset: start,
        message: "unterminated string literal".to_string(),
    })
}
