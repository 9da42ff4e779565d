// lexer.rs — Tokeniser for SOUL source text
//
// Turns UTF-8 source into a token stream with byte-offset spans. Uses the
// `logos` crate for DFA-based lexing: keywords are fixed `#[token]` matches
// (which win over the identifier regex of the same length, giving
// longest-exact-match keyword recognition at identifier boundaries) and
// operators are fixed tokens (logos picks the longest prefix).
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with spans, or the first lexical error.
// Failure modes: illegal characters, unterminated strings/comments,
//   malformed literals — all fatal with a location.
// Side effects: none.

use logos::Logos;
use std::fmt;
use std::rc::Rc;

use crate::diag::{Category, CompileResult, Diagnostic, Location, SourceChunk, Span};

/// SOUL token types.
///
/// Literals carry parsed values. Identifiers carry no value — use the span
/// to retrieve the text from the source.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+|//[^\n]*|/\*[^*]*\*+([^/*][^*]*\*+)*/")]
pub enum Token {
    // ── Keywords ──
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("do")]
    Do,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("loop")]
    Loop,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,
    #[token("const")]
    Const,
    #[token("let")]
    Let,
    #[token("var")]
    Var,
    #[token("void")]
    Void,
    #[token("int")]
    Int,
    #[token("int32")]
    Int32,
    #[token("int64")]
    Int64,
    #[token("float")]
    Float,
    #[token("float32")]
    Float32,
    #[token("float64")]
    Float64,
    #[token("fixed")]
    Fixed,
    #[token("bool")]
    Bool,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("string")]
    String,
    #[token("struct")]
    Struct,
    #[token("using")]
    Using,
    #[token("external")]
    External,
    #[token("graph")]
    Graph,
    #[token("processor")]
    Processor,
    #[token("namespace")]
    Namespace,
    #[token("input")]
    Input,
    #[token("output")]
    Output,
    #[token("connection")]
    Connection,
    #[token("event")]
    Event,
    #[token("import")]
    Import,

    // Reserved for future use; the parser rejects these outright.
    #[token("try")]
    #[token("catch")]
    #[token("throw")]
    #[token("switch")]
    #[token("case")]
    #[token("default")]
    #[token("enum")]
    Reserved,

    // ── Operators ──
    //
    // logos resolves overlapping fixed tokens by longest match, so `<<=`
    // wins over `<<` which wins over `<`.
    #[token("::")]
    DoubleColon,
    #[token(";")]
    Semicolon,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("(")]
    OpenParen,
    #[token(")")]
    CloseParen,
    #[token("{")]
    OpenBrace,
    #[token("}")]
    CloseBrace,
    #[token("[[")]
    OpenDoubleBracket,
    #[token("]]")]
    CloseDoubleBracket,
    #[token("[")]
    OpenBracket,
    #[token("]")]
    CloseBracket,
    #[token("=")]
    Assign,
    #[token("==")]
    Equals,
    #[token("!=")]
    NotEquals,
    #[token("<")]
    LessThan,
    #[token("<=")]
    LessThanOrEqual,
    #[token(">")]
    GreaterThan,
    #[token(">=")]
    GreaterThanOrEqual,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Times,
    #[token("/")]
    Divide,
    #[token("%")]
    Modulo,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("+=")]
    PlusEquals,
    #[token("-=")]
    MinusEquals,
    #[token("*=")]
    TimesEquals,
    #[token("/=")]
    DivideEquals,
    #[token("%=")]
    ModuloEquals,
    #[token("<<")]
    LeftShift,
    #[token(">>")]
    RightShift,
    #[token(">>>")]
    RightShiftUnsigned,
    #[token("<<=")]
    LeftShiftEquals,
    #[token(">>=")]
    RightShiftEquals,
    #[token(">>>=")]
    RightShiftUnsignedEquals,
    #[token("&&")]
    LogicalAnd,
    #[token("||")]
    LogicalOr,
    #[token("!")]
    LogicalNot,
    #[token("&")]
    BitwiseAnd,
    #[token("|")]
    BitwiseOr,
    #[token("^")]
    BitwiseXor,
    #[token("~")]
    BitwiseNot,
    #[token("&=")]
    AndEquals,
    #[token("|=")]
    OrEquals,
    #[token("^=")]
    XorEquals,
    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token("->")]
    RightArrow,

    // ── Literals ──
    //
    // Integer regexes appear before the float regex so that a plain run of
    // digits lexes as an integer; the float regex requires a '.', exponent,
    // or float suffix. A trailing `L`/`_i64` marks 64-bit; `f`/`_f32` marks
    // float32.
    /// 32-bit integer literal (decimal, 0x hex, or 0b binary).
    #[regex(r"0[xX][0-9a-fA-F](_?[0-9a-fA-F])*", |lex| parse_int(lex.slice(), 16, false))]
    #[regex(r"0[bB][01](_?[01])*", |lex| parse_int(lex.slice(), 2, false))]
    #[regex(r"[0-9](_?[0-9])*", |lex| parse_int(lex.slice(), 10, false))]
    IntLiteral32(i64),

    /// 64-bit integer literal (trailing `L` or `_L` / `i64` suffix).
    #[regex(r"0[xX][0-9a-fA-F](_?[0-9a-fA-F])*(L|_L|i64|_i64)", |lex| parse_int(lex.slice(), 16, true))]
    #[regex(r"0[bB][01](_?[01])*(L|_L|i64|_i64)", |lex| parse_int(lex.slice(), 2, true))]
    #[regex(r"[0-9](_?[0-9])*(L|_L|i64|_i64)", |lex| parse_int(lex.slice(), 10, true))]
    IntLiteral64(i64),

    /// 32-bit float literal (trailing `f` / `f32`).
    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?(f|f32|_f32|_f)", |lex| parse_float(lex.slice()))]
    FloatLiteral32(f64),

    /// 64-bit float literal (decimal point or exponent, optional `f64`).
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?(f64|_f64)?", |lex| parse_float(lex.slice()))]
    #[regex(r"[0-9]+([eE][+-]?[0-9]+|f64|_f64)", |lex| parse_float(lex.slice()))]
    FloatLiteral64(f64),

    /// String literal with standard escapes.
    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| parse_string(lex.slice()))]
    StringLiteral(std::string::String),

    // ── Identifier ──
    /// Identifier: starts with an ASCII letter; body adds digits and `_`.
    #[regex(r"[a-zA-Z][a-zA-Z0-9_]*|_[a-zA-Z0-9_]+")]
    Identifier,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Token::If => "if",
            Token::Else => "else",
            Token::Do => "do",
            Token::While => "while",
            Token::For => "for",
            Token::Loop => "loop",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::Return => "return",
            Token::Const => "const",
            Token::Let => "let",
            Token::Var => "var",
            Token::Void => "void",
            Token::Int => "int",
            Token::Int32 => "int32",
            Token::Int64 => "int64",
            Token::Float => "float",
            Token::Float32 => "float32",
            Token::Float64 => "float64",
            Token::Fixed => "fixed",
            Token::Bool => "bool",
            Token::True => "true",
            Token::False => "false",
            Token::String => "string",
            Token::Struct => "struct",
            Token::Using => "using",
            Token::External => "external",
            Token::Graph => "graph",
            Token::Processor => "processor",
            Token::Namespace => "namespace",
            Token::Input => "input",
            Token::Output => "output",
            Token::Connection => "connection",
            Token::Event => "event",
            Token::Import => "import",
            Token::Reserved => "<reserved word>",
            Token::DoubleColon => "::",
            Token::Semicolon => ";",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::OpenParen => "(",
            Token::CloseParen => ")",
            Token::OpenBrace => "{",
            Token::CloseBrace => "}",
            Token::OpenBracket => "[",
            Token::CloseBracket => "]",
            Token::OpenDoubleBracket => "[[",
            Token::CloseDoubleBracket => "]]",
            Token::Assign => "=",
            Token::Equals => "==",
            Token::NotEquals => "!=",
            Token::LessThan => "<",
            Token::LessThanOrEqual => "<=",
            Token::GreaterThan => ">",
            Token::GreaterThanOrEqual => ">=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Times => "*",
            Token::Divide => "/",
            Token::Modulo => "%",
            Token::PlusPlus => "++",
            Token::MinusMinus => "--",
            Token::PlusEquals => "+=",
            Token::MinusEquals => "-=",
            Token::TimesEquals => "*=",
            Token::DivideEquals => "/=",
            Token::ModuloEquals => "%=",
            Token::LeftShift => "<<",
            Token::RightShift => ">>",
            Token::RightShiftUnsigned => ">>>",
            Token::LeftShiftEquals => "<<=",
            Token::RightShiftEquals => ">>=",
            Token::RightShiftUnsignedEquals => ">>>=",
            Token::LogicalAnd => "&&",
            Token::LogicalOr => "||",
            Token::LogicalNot => "!",
            Token::BitwiseAnd => "&",
            Token::BitwiseOr => "|",
            Token::BitwiseXor => "^",
            Token::BitwiseNot => "~",
            Token::AndEquals => "&=",
            Token::OrEquals => "|=",
            Token::XorEquals => "^=",
            Token::Question => "?",
            Token::Colon => ":",
            Token::RightArrow => "->",
            Token::IntLiteral32(v) => return write!(f, "{v}"),
            Token::IntLiteral64(v) => return write!(f, "{v}L"),
            Token::FloatLiteral32(v) => return write!(f, "{v}f"),
            Token::FloatLiteral64(v) => return write!(f, "{v}"),
            Token::StringLiteral(s) => return write!(f, "{s:?}"),
            Token::Identifier => "<identifier>",
        };
        write!(f, "{s}")
    }
}

// ── Callbacks ──

fn parse_int(slice: &str, radix: u32, is64: bool) -> Option<i64> {
    let mut digits: String = slice.chars().filter(|c| *c != '_').collect();
    for suffix in ["i64", "f64", "L"] {
        if let Some(stripped) = digits.strip_suffix(suffix) {
            digits = stripped.to_string();
            break;
        }
    }
    let digits = if radix != 10 { &digits[2..] } else { digits.as_str() };
    let value = u64::from_str_radix(digits, radix).ok()?;
    if is64 {
        i64::try_from(value).ok()
    } else {
        // 32-bit literals must fit in u32; the parser applies any leading minus.
        u32::try_from(value).ok().map(|v| v as i32 as i64)
    }
}

fn parse_float(slice: &str) -> Option<f64> {
    let mut digits: String = slice.chars().filter(|c| *c != '_').collect();
    for suffix in ["f64", "f32", "f"] {
        if let Some(stripped) = digits.strip_suffix(suffix) {
            digits = stripped.to_string();
            break;
        }
    }
    digits.parse().ok()
}

fn parse_string(slice: &str) -> Option<String> {
    let inner = &slice[1..slice.len() - 1];
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next()? {
                '"' => result.push('"'),
                '\\' => result.push('\\'),
                'n' => result.push('\n'),
                'r' => result.push('\r'),
                't' => result.push('\t'),
                '0' => result.push('\0'),
                _ => return None,
            }
        } else {
            result.push(c);
        }
    }
    Some(result)
}

// ── Public API ──

/// Lex a SOUL source chunk into tokens.
///
/// Lexing is fatal on the first illegal character or malformed literal,
/// matching the front-end's first-error-aborts policy.
pub fn lex(chunk: &Rc<SourceChunk>) -> CompileResult<Vec<(Token, Span)>> {
    let mut tokens = Vec::new();
    for (result, range) in Token::lexer(&chunk.text).spanned() {
        let span = Span::new(range.start, range.end);
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let excerpt = &chunk.text[span.start..span.end.min(chunk.text.len())];
                let message = if excerpt.starts_with('"') {
                    "unterminated string literal".to_string()
                } else if excerpt.starts_with("/*") {
                    "unterminated comment".to_string()
                } else {
                    format!("unexpected character: {excerpt:?}")
                };
                return Err(Diagnostic::new(
                    Category::Lexical,
                    Location::new(chunk.clone(), span),
                    message,
                ));
            }
        }
    }
    Ok(tokens)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: lex and assert success, return token list.
    fn lex_ok(source: &str) -> Vec<Token> {
        let chunk = SourceChunk::new("test", source);
        lex(&chunk)
            .unwrap_or_else(|e| panic!("unexpected lex error: {e}"))
            .into_iter()
            .map(|(t, _)| t)
            .collect()
    }

    fn lex_err(source: &str) -> Diagnostic {
        let chunk = SourceChunk::new("test", source);
        lex(&chunk).expect_err("expected lex error")
    }

    // ── Keywords ──

    #[test]
    fn keywords() {
        let tokens = lex_ok("processor graph namespace input output event connection");
        assert_eq!(
            tokens,
            vec![
                Token::Processor,
                Token::Graph,
                Token::Namespace,
                Token::Input,
                Token::Output,
                Token::Event,
                Token::Connection,
            ]
        );
    }

    #[test]
    fn keyword_vs_ident() {
        // `processors` is an identifier, not keyword `processor` + `s`
        let tokens = lex_ok("processor processors");
        assert_eq!(tokens, vec![Token::Processor, Token::Identifier]);
    }

    #[test]
    fn reserved_words_lex_as_reserved() {
        let tokens = lex_ok("switch enum");
        assert_eq!(tokens, vec![Token::Reserved, Token::Reserved]);
    }

    // ── Operators ──

    #[test]
    fn longest_prefix_operators() {
        let tokens = lex_ok("<< <<= >>> >>>= :: -> ++");
        assert_eq!(
            tokens,
            vec![
                Token::LeftShift,
                Token::LeftShiftEquals,
                Token::RightShiftUnsigned,
                Token::RightShiftUnsignedEquals,
                Token::DoubleColon,
                Token::RightArrow,
                Token::PlusPlus,
            ]
        );
    }

    #[test]
    fn double_bracket_annotation_tokens() {
        let tokens = lex_ok("[[ main ]]");
        assert_eq!(
            tokens,
            vec![
                Token::OpenDoubleBracket,
                Token::Identifier,
                Token::CloseDoubleBracket,
            ]
        );
    }

    // ── Integer literals ──

    #[test]
    fn int_literal_decimal() {
        assert_eq!(lex_ok("42"), vec![Token::IntLiteral32(42)]);
    }

    #[test]
    fn int_literal_hex_and_binary() {
        assert_eq!(lex_ok("0x1f"), vec![Token::IntLiteral32(31)]);
        assert_eq!(lex_ok("0b101"), vec![Token::IntLiteral32(5)]);
    }

    #[test]
    fn int_literal_64bit_suffix() {
        assert_eq!(lex_ok("42L"), vec![Token::IntLiteral64(42)]);
        assert_eq!(lex_ok("42_i64"), vec![Token::IntLiteral64(42)]);
        assert_eq!(lex_ok("0x10L"), vec![Token::IntLiteral64(16)]);
    }

    #[test]
    fn int_literal_underscore_separators() {
        assert_eq!(lex_ok("1_000_000"), vec![Token::IntLiteral32(1_000_000)]);
    }

    // ── Float literals ──

    #[test]
    fn float_literal_64() {
        assert_eq!(lex_ok("1.5"), vec![Token::FloatLiteral64(1.5)]);
        assert_eq!(lex_ok("1e3"), vec![Token::FloatLiteral64(1000.0)]);
    }

    #[test]
    fn float_literal_32_suffix() {
        assert_eq!(lex_ok("0.5f"), vec![Token::FloatLiteral32(0.5)]);
        assert_eq!(lex_ok("2f"), vec![Token::FloatLiteral32(2.0)]);
        assert_eq!(lex_ok("1.5f32"), vec![Token::FloatLiteral32(1.5)]);
    }

    #[test]
    fn float_vs_member_access() {
        // `x.size` must not lex the dot into a float
        let tokens = lex_ok("x.size");
        assert_eq!(tokens, vec![Token::Identifier, Token::Dot, Token::Identifier]);
    }

    // ── Strings ──

    #[test]
    fn string_literal() {
        assert_eq!(
            lex_ok(r#""hello""#),
            vec![Token::StringLiteral("hello".into())]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            lex_ok(r#""a\"b\\c\n""#),
            vec![Token::StringLiteral("a\"b\\c\n".into())]
        );
    }

    #[test]
    fn unterminated_string_is_error() {
        let e = lex_err("\"abc");
        assert!(e.message.contains("unterminated string"));
    }

    // ── Comments ──

    #[test]
    fn comments_skipped() {
        let tokens = lex_ok("a // line comment\n/* block\ncomment */ b");
        assert_eq!(tokens, vec![Token::Identifier, Token::Identifier]);
    }

    // ── Identifiers ──

    #[test]
    fn identifier_start_must_be_letter() {
        // a bare `_` is not an identifier start in SOUL, but `_x` is allowed
        // for compiler-generated names
        let tokens = lex_ok("abc a1_b");
        assert_eq!(tokens, vec![Token::Identifier, Token::Identifier]);
    }

    #[test]
    fn illegal_character_is_error() {
        let e = lex_err("a ` b");
        assert!(e.message.contains("unexpected character"));
        assert_eq!(e.category, Category::Lexical);
    }

    // ── Spans ──

    #[test]
    fn spans_are_byte_offsets() {
        let chunk = SourceChunk::new("test", "let x");
        let tokens = lex(&chunk).unwrap();
        assert_eq!(tokens[0].1, Span::new(0, 3));
        assert_eq!(tokens[1].1, Span::new(4, 5));
    }

    // ── A realistic snippet ──

    #[test]
    fn processor_snippet() {
        let tokens = lex_ok("processor P { output stream float out; void run() { loop { out << 0.0f; advance(); } } }");
        assert!(tokens.contains(&Token::Processor));
        assert!(tokens.contains(&Token::LeftShift));
        assert!(tokens.contains(&Token::FloatLiteral32(0.0)));
        assert!(tokens.contains(&Token::Loop));
    }
}
