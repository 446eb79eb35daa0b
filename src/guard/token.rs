/// Minimal lossless SQL lexer.
///
/// The guard never parses SQL; it only needs to know where words,
/// literals, comments, terminators and parentheses are. Concatenating the
/// `text` of every token reproduces the input exactly, so passes can rewrite
/// a statement by dropping or inserting tokens without disturbing anything
/// else.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Whitespace,
    LineComment,
    BlockComment,
    Word,
    QuotedIdent,
    StringLit,
    Number,
    Semicolon,
    Comma,
    LParen,
    RParen,
    Symbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the token in the source text.
    pub offset: usize,
}

impl<'a> Token<'a> {
    /// Whitespace and comments.
    pub fn is_trivia(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
        )
    }

    /// Case-insensitive keyword test. Only bare words qualify; quoted
    /// identifiers and literals never match.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    /// The value of an unsigned integer literal token.
    pub fn integer_value(&self) -> Option<u64> {
        if self.kind != TokenKind::Number || !self.text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.text.parse().ok()
    }

    pub fn end(&self) -> usize {
        self.offset + self.text.len()
    }
}

/// How quoted runs are read. Engines disagree about brackets and
/// backslashes, so an ambiguous statement is validated under both readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quoting {
    /// SQLite: `[x]` is an identifier and a backslash is an ordinary character.
    #[default]
    Sqlite,
    /// PostgreSQL `E'..'` and MySQL strings: a backslash escapes the next
    /// character, and `[` is plain punctuation.
    Backslash,
}

impl Quoting {
    /// Whether the two readings of `sql` can tokenize differently.
    pub fn is_ambiguous(sql: &str) -> bool {
        sql.contains('\\') || sql.contains('[')
    }
}

pub fn tokenize(sql: &str) -> Vec<Token<'_>> {
    tokenize_with(sql, Quoting::Sqlite)
}

/// Split `sql` into tokens. A string, quoted identifier or block comment
/// without its closing delimiter is not opaque: only the opener becomes a
/// `Symbol` and lexing carries on, so nothing can hide behind a stray quote.
pub fn tokenize_with(sql: &str, quoting: Quoting) -> Vec<Token<'_>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < sql.len() {
        let rest = &sql[pos..];
        let ch = match rest.chars().next() {
            Some(c) => c,
            None => break,
        };

        let (kind, len) = if ch.is_whitespace() {
            (TokenKind::Whitespace, take_while(rest, char::is_whitespace))
        } else if rest.starts_with("--") {
            (TokenKind::LineComment, rest.find('\n').unwrap_or(rest.len()))
        } else if rest.starts_with("/*") {
            let len = rest[2..].find("*/").map(|i| i + 4);
            closed_or_opener(TokenKind::BlockComment, len, 2)
        } else if ch == '\'' {
            let len = quoted_len(rest, b'\'', quoting == Quoting::Backslash);
            closed_or_opener(TokenKind::StringLit, len, 1)
        } else if ch == '"' {
            closed_or_opener(TokenKind::QuotedIdent, quoted_len(rest, b'"', false), 1)
        } else if ch == '`' {
            let len = rest[1..].find('`').map(|i| i + 2);
            closed_or_opener(TokenKind::QuotedIdent, len, 1)
        } else if ch == '[' && quoting == Quoting::Sqlite {
            let len = rest[1..].find(']').map(|i| i + 2);
            closed_or_opener(TokenKind::QuotedIdent, len, 1)
        } else if ch.is_ascii_digit() {
            (TokenKind::Number, number_len(&bytes[pos..]))
        } else if ch.is_alphabetic() || ch == '_' {
            let len = take_while(rest, |c| c.is_alphanumeric() || c == '_' || c == '$');
            (TokenKind::Word, len)
        } else {
            let kind = match ch {
                ';' => TokenKind::Semicolon,
                ',' => TokenKind::Comma,
                '(' => TokenKind::LParen,
                ')' => TokenKind::RParen,
                _ => TokenKind::Symbol,
            };
            (kind, ch.len_utf8())
        };

        tokens.push(Token {
            kind,
            text: &sql[pos..pos + len],
            offset: pos,
        });
        pos += len;
    }

    tokens
}

fn closed_or_opener(kind: TokenKind, len: Option<usize>, opener: usize) -> (TokenKind, usize) {
    match len {
        Some(len) => (kind, len),
        None => (TokenKind::Symbol, opener),
    }
}

fn take_while(s: &str, pred: impl Fn(char) -> bool) -> usize {
    s.char_indices()
        .find(|&(_, c)| !pred(c))
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Length of a quoted run starting at `s[0] == quote`, where a doubled quote
/// is an escape and, with `backslash`, so is a backslash plus any byte. `None` when
/// the run never closes.
fn quoted_len(s: &str, quote: u8, backslash: bool) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        if backslash && bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

fn number_len(bytes: &[u8]) -> usize {
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}

/// Index of the next non-trivia token at or after `from`.
pub fn next_significant(tokens: &[Token<'_>], from: usize) -> Option<usize> {
    (from..tokens.len()).find(|&i| !tokens[i].is_trivia())
}

/// Index of the last non-trivia token.
pub fn last_significant(tokens: &[Token<'_>]) -> Option<usize> {
    tokens.iter().rposition(|t| !t.is_trivia())
}

/// Parenthesis depth in front of each token. A `(` sits at the depth it
/// opens from and a `)` at the depth it returns to.
pub fn paren_depths(tokens: &[Token<'_>]) -> Vec<usize> {
    let mut depth = 0usize;
    tokens
        .iter()
        .map(|t| match t.kind {
            TokenKind::LParen => {
                depth += 1;
                depth - 1
            }
            TokenKind::RParen => {
                depth = depth.saturating_sub(1);
                depth
            }
            _ => depth,
        })
        .collect()
}

/// Whether the keyword appears as a bare word outside every parenthesis.
pub fn contains_top_level_keyword(sql: &str, keyword: &str) -> bool {
    let tokens = tokenize(sql);
    let depths = paren_depths(&tokens);
    tokens
        .iter()
        .zip(depths)
        .any(|(t, depth)| depth == 0 && t.is_keyword(keyword))
}

/// Append a clause to a statement, separated by a single space, or by a
/// newline when the statement ends inside a line comment.
pub fn append_clause(sql: &str, clause: &str) -> String {
    let mut out = sql.trim_end().to_string();
    separate(&mut out);
    out.push_str(clause);
    out
}

/// Make sure whatever is pushed next starts a new token: adds a space, or a
/// newline after a line comment. Does nothing on empty text or text that
/// already ends in whitespace.
pub fn separate(out: &mut String) {
    if out.is_empty() || out.ends_with(char::is_whitespace) {
        return;
    }
    if ends_in_line_comment(out) {
        out.push('\n');
    } else {
        out.push(' ');
    }
}

/// Drop trailing whitespace, keeping the newline that closes a trailing
/// line comment.
pub fn trim_end_in_place(out: &mut String) {
    let len = out.trim_end().len();
    out.truncate(len);
    if ends_in_line_comment(out) {
        out.push('\n');
    }
}

fn ends_in_line_comment(sql: &str) -> bool {
    tokenize(sql)
        .last()
        .map(|t| t.kind == TokenKind::LineComment)
        .unwrap_or(false)
}

/// Remove one trailing statement terminator, keeping any comment after it,
/// and trim surrounding whitespace.
pub fn strip_terminator(sql: &str) -> String {
    let trimmed = sql.trim();
    let tokens = tokenize(trimmed);
    match last_significant(&tokens) {
        Some(i) if tokens[i].kind == TokenKind::Semicolon => {
            let without = format!("{}{}", &trimmed[..tokens[i].offset], &trimmed[tokens[i].end()..]);
            without.trim().to_string()
        }
        _ => trimmed.to_string(),
    }
}
