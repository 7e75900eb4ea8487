//! Query lexer using logos
//!
//! Keywords are case-insensitive, SQL style. An unrecognized character is
//! recorded as a diagnostic and skipped; lexing never halts.

use logos::Logos;

/// Query tokens
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\x0c]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"#[^\n]*")]
#[logos(skip r"/\*([^*]|\*[^/])*\*/")]
pub enum Tok {
    // Keywords
    #[token("TRUE", ignore(ascii_case))]
    True,

    #[token("FALSE", ignore(ascii_case))]
    False,

    #[token("NULL", ignore(ascii_case))]
    Null,

    #[token("NOT", ignore(ascii_case))]
    Not,

    #[token("AND", ignore(ascii_case))]
    And,

    #[token("OR", ignore(ascii_case))]
    Or,

    #[token("IN", ignore(ascii_case))]
    In,

    #[token("IS", ignore(ascii_case))]
    Is,

    #[token("NAMEMAP", ignore(ascii_case))]
    Namemap,

    #[token("ID", ignore(ascii_case))]
    Id,

    #[token("MAYBE", ignore(ascii_case))]
    Maybe,

    #[token("WHERE", ignore(ascii_case))]
    Where,

    #[token("LIMIT", ignore(ascii_case))]
    Limit,

    #[token("OFFSET", ignore(ascii_case))]
    Offset,

    #[token("DEPTH", ignore(ascii_case))]
    Depth,

    #[token("MERGEALL", ignore(ascii_case))]
    Mergeall,

    #[token("GROUP", ignore(ascii_case))]
    Group,

    #[token("GROUPBY", ignore(ascii_case))]
    Groupby,

    #[token("ORDER", ignore(ascii_case))]
    Order,

    #[token("ORDERBY", ignore(ascii_case))]
    Orderby,

    #[token("BY", ignore(ascii_case))]
    By,

    #[token("ASC", ignore(ascii_case))]
    Asc,

    #[token("DESC", ignore(ascii_case))]
    Desc,

    #[token("OMITNULL", ignore(ascii_case))]
    Omitnull,

    // Delimiters
    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,

    #[token("{")]
    LBrace,

    #[token("}")]
    RBrace,

    #[token(",")]
    Comma,

    #[token(".")]
    Period,

    #[token(":")]
    Colon,

    // Operators
    #[token("+")]
    Plus,

    #[token("-")]
    Minus,

    #[token("*")]
    Star,

    #[token("/")]
    Slash,

    #[token("%")]
    Percent,

    #[token("<")]
    Lt,

    #[token("<=")]
    Le,

    #[token(">")]
    Gt,

    #[token(">=")]
    Ge,

    #[token("=")]
    #[token("==")]
    Eq,

    #[token("!=")]
    Ne,

    // Literals
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""(?:[^"\\\n\r]|\\.)*""#, |lex| unescape(trim_delims(lex.slice())))]
    #[regex(r#"'(?:[^'\\\n\r]|\\.)*'"#, |lex| unescape(trim_delims(lex.slice())))]
    Str(String),

    // Quoted property name: <weird prop name>
    #[regex(r"<(?:[^<>\\\n\r]|\\.)*>", |lex| unescape(trim_delims(lex.slice())))]
    PropString(String),

    // Query label: ?foo
    #[regex(r"\?[A-Za-z_$][A-Za-z0-9_$]*", |lex| lex.slice()[1..].to_string())]
    QLabel(String),

    // Bind variable: :foo
    #[regex(r":[A-Za-z_$][A-Za-z0-9_$]*", |lex| lex.slice()[1..].to_string())]
    BindVar(String),

    // Identifiers (checked against keywords above first)
    #[regex(r"[A-Za-z_$][A-Za-z0-9_$]*", |lex| lex.slice().to_string())]
    Name(String),
}

fn trim_delims(slice: &str) -> &str {
    &slice[1..slice.len() - 1]
}

/// Decode JSON-style escapes; returns `None` on a malformed escape, which
/// surfaces as a lex diagnostic
fn unescape(raw: &str) -> Option<String> {
    if !raw.contains('\\') {
        return Some(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'b' => out.push('\u{0008}'),
            'f' => out.push('\u{000c}'),
            '0' => out.push('\0'),
            'u' => {
                let hex: String = chars.by_ref().take(4).collect();
                if hex.len() != 4 {
                    return None;
                }
                let code = u32::from_str_radix(&hex, 16).ok()?;
                out.push(char::from_u32(code)?);
            }
            'x' => {
                let hex: String = chars.by_ref().take(2).collect();
                if hex.len() != 2 {
                    return None;
                }
                let code = u32::from_str_radix(&hex, 16).ok()?;
                out.push(char::from_u32(code)?);
            }
            other => out.push(other),
        }
    }
    Some(out)
}

/// A token with its source span
pub type Spanned = (Tok, std::ops::Range<usize>);

/// Tokenize query text. Unrecognized input produces a diagnostic per bad
/// character and lexing continues with the next one.
pub fn tokenize(input: &str) -> (Vec<Spanned>, Vec<String>) {
    let mut tokens = Vec::new();
    let mut diagnostics = Vec::new();
    for (result, span) in Tok::lexer(input).spanned() {
        match result {
            Ok(tok) => tokens.push((tok, span)),
            Err(()) => {
                let (line, col) = line_col(input, span.start);
                diagnostics.push(format!(
                    "illegal character {:?} at line:{} char:{}",
                    &input[span.start..span.end],
                    line,
                    col
                ));
            }
        }
    }
    (tokens, diagnostics)
}

/// 1-based line and column for a byte offset
pub fn line_col(input: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, c) in input.char_indices() {
        if i >= offset {
            break;
        }
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn toks(input: &str) -> Vec<Tok> {
        let (tokens, diagnostics) = tokenize(input);
        assert!(diagnostics.is_empty(), "unexpected: {diagnostics:?}");
        tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_basic_query() {
        let tokens = toks("{ foo where (bar = 1) }");
        assert!(tokens.contains(&Tok::LBrace));
        assert!(tokens.contains(&Tok::Where));
        assert!(tokens.contains(&Tok::Eq));
        assert!(tokens.contains(&Tok::Int(1)));
        assert!(tokens
            .iter()
            .any(|t| matches!(t, Tok::Name(n) if n == "foo")));
    }

    #[test]
    fn test_case_insensitive_keywords() {
        assert_eq!(toks("WHERE where WhErE"), vec![Tok::Where; 3]);
        assert_eq!(toks("maybe MAYBE"), vec![Tok::Maybe; 2]);
    }

    #[test]
    fn test_labels_and_bindvars() {
        let tokens = toks("?child = :parent");
        assert_eq!(
            tokens,
            vec![
                Tok::QLabel("child".to_string()),
                Tok::Eq,
                Tok::BindVar("parent".to_string()),
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            toks(r#"'a\nb' "tab\there" "uA""#),
            vec![
                Tok::Str("a\nb".to_string()),
                Tok::Str("tab\there".to_string()),
                Tok::Str("uA".to_string()),
            ]
        );
    }

    #[test]
    fn test_propstring() {
        assert_eq!(
            toks("<a property name>"),
            vec![Tok::PropString("a property name".to_string())]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            toks("3 3.25 2e3"),
            vec![Tok::Int(3), Tok::Float(3.25), Tok::Float(2000.0)]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            toks("foo // line\n# python style\n/* block\nstill */ bar"),
            vec![
                Tok::Name("foo".to_string()),
                Tok::Name("bar".to_string()),
            ]
        );
    }

    #[test]
    fn test_double_equals() {
        assert_eq!(toks("= =="), vec![Tok::Eq, Tok::Eq]);
    }

    #[test]
    fn test_illegal_character_recovers() {
        let (tokens, diagnostics) = tokenize("foo ^ bar");
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].contains("illegal character"));
        assert_eq!(
            tokens.into_iter().map(|(t, _)| t).collect::<Vec<_>>(),
            vec![Tok::Name("foo".to_string()), Tok::Name("bar".to_string())]
        );
    }

    proptest! {
        #[test]
        fn prop_tokenize_never_panics(input in ".*") {
            let _ = tokenize(&input);
        }
    }
}
