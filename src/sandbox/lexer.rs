//! Tokenizer for ClawScript source.

use super::ParseError;

/// Multi-character punctuators, longest first.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "??", "+=", "-=", "*=", "/=", "++", "--",
    "{", "}", "(", ")", "[", "]", ";", ",", ".", ":", "?", "+", "-", "*", "/", "%", "<", ">",
    "=", "!",
];

/// A lexical token
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// Numeric literal
    Number(f64),
    /// String literal (escapes resolved)
    Str(String),
    /// Identifier or keyword
    Ident(String),
    /// Operator or delimiter
    Punct(&'static str),
    /// End of input
    Eof,
}

/// A token with the line it started on
#[derive(Clone, Debug, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

/// Split source text into tokens.
///
/// # Errors
/// Returns error on unterminated strings or comments and on characters
/// outside the language.
pub fn tokenize(src: &str) -> Result<Vec<Spanned>, ParseError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\n' {
            line += 1;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Comments
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            let start_line = line;
            i += 2;
            loop {
                match chars.get(i) {
                    None => return Err(ParseError::new(start_line, "unterminated comment")),
                    Some('*') if chars.get(i + 1) == Some(&'/') => {
                        i += 2;
                        break;
                    }
                    Some('\n') => line += 1,
                    Some(_) => {}
                }
                i += 1;
            }
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| ParseError::new(line, format!("invalid number literal '{text}'")))?;
            tokens.push(Spanned {
                token: Token::Number(n),
                line,
            });
            continue;
        }

        if c == '"' || c == '\'' {
            let (s, next) = read_string(&chars, i, line)?;
            tokens.push(Spanned {
                token: Token::Str(s),
                line,
            });
            i = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Spanned {
                token: Token::Ident(chars[start..i].iter().collect()),
                line,
            });
            continue;
        }

        let punct = PUNCTUATORS.iter().find(|p| {
            p.chars()
                .enumerate()
                .all(|(k, pc)| chars.get(i + k) == Some(&pc))
        });
        match punct {
            Some(p) => {
                tokens.push(Spanned {
                    token: Token::Punct(p),
                    line,
                });
                i += p.len();
            }
            None => return Err(ParseError::new(line, format!("unexpected character '{c}'"))),
        }
    }

    tokens.push(Spanned {
        token: Token::Eof,
        line,
    });
    Ok(tokens)
}

fn read_string(chars: &[char], start: usize, line: usize) -> Result<(String, usize), ParseError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    loop {
        match chars.get(i) {
            None | Some('\n') => return Err(ParseError::new(line, "unterminated string literal")),
            Some(&c) if c == quote => return Ok((out, i + 1)),
            Some('\\') => {
                let esc = chars
                    .get(i + 1)
                    .ok_or_else(|| ParseError::new(line, "unterminated string literal"))?;
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    'u' => {
                        let hex: String = chars.iter().skip(i + 2).take(4).collect();
                        let code = u32::from_str_radix(&hex, 16)
                            .ok()
                            .filter(|_| hex.len() == 4)
                            .and_then(char::from_u32)
                            .ok_or_else(|| ParseError::new(line, "invalid unicode escape"))?;
                        out.push(code);
                        i += 4;
                    }
                    other => out.push(*other),
                }
                i += 2;
            }
            Some(&c) => {
                out.push(c);
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            kinds("let x = 1.5;"),
            vec![
                Token::Ident("let".into()),
                Token::Ident("x".into()),
                Token::Punct("="),
                Token::Number(1.5),
                Token::Punct(";"),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_longest_punctuator_wins() {
        assert_eq!(
            kinds("a !== b"),
            vec![
                Token::Ident("a".into()),
                Token::Punct("!=="),
                Token::Ident("b".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\"b\n" 'c\u0041'"#),
            vec![Token::Str("a\"b\n".into()), Token::Str("cA".into()), Token::Eof]
        );
    }

    #[test]
    fn test_comments_and_lines() {
        let toks = tokenize("// one\n/* two\nthree */ x").unwrap();
        assert_eq!(toks[0].token, Token::Ident("x".into()));
        assert_eq!(toks[0].line, 3);
    }

    #[test]
    fn test_exponent() {
        assert_eq!(kinds("1e3"), vec![Token::Number(1000.0), Token::Eof]);
    }

    #[test]
    fn test_errors() {
        assert!(tokenize("\"open").is_err());
        assert!(tokenize("/* open").is_err());
        assert!(tokenize("a # b").is_err());
    }
}
