//! Merge rewriting for SQL that arrives as text.
//!
//! Structured queries should go through [`crate::MergeQuery`]. This path exists
//! for callers that already hold compiled SQL. It works on tokens, never on raw
//! substrings, so an identifier such as `source_asset_id` is not mistaken for
//! the `asset` table. Table aliases cannot be told apart from table names at
//! this level and are rejected.

use tracing::debug;

use crate::localize::local_name;
use crate::schema::Catalog;
use crate::value::{quote_ident, quote_literal};
use crate::{CoreError, DataSource, SqlValue, SyncConfig, SOURCE_COLUMN};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Space(String),
    Word(String),
    /// Double-quoted or backtick identifier, stored unquoted.
    Quoted(String),
    /// Already-rendered literal text (strings, numbers, inlined parameters).
    Literal(String),
    Param(Option<usize>),
    Punct(String),
}

impl Token {
    fn is_space(&self) -> bool {
        matches!(self, Self::Space(_))
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Word(word) if word.eq_ignore_ascii_case(keyword))
    }

    fn is_punct(&self, punct: &str) -> bool {
        matches!(self, Self::Punct(value) if value == punct)
    }

    fn ident_name(&self) -> Option<&str> {
        match self {
            Self::Word(name) | Self::Quoted(name) => Some(name),
            _ => None,
        }
    }

    /// Identifier that can name a table or alias, i.e. not a reserved clause word.
    fn is_plain_ident(&self) -> bool {
        match self {
            Self::Quoted(_) => true,
            Self::Word(word) => !CLAUSE_KEYWORDS.iter().any(|kw| word.eq_ignore_ascii_case(kw)),
            _ => false,
        }
    }

    fn push_sql(&self, out: &mut String) {
        match self {
            Self::Space(text) | Self::Word(text) | Self::Literal(text) | Self::Punct(text) => {
                out.push_str(text);
            }
            Self::Quoted(name) => out.push_str(&quote_ident(name)),
            Self::Param(None) => out.push('?'),
            Self::Param(Some(index)) => {
                out.push('?');
                out.push_str(&index.to_string());
            }
        }
    }
}

const CLAUSE_KEYWORDS: &[&str] = &[
    "as", "cross", "except", "from", "full", "group", "having", "indexed", "inner", "intersect",
    "join", "left", "limit", "natural", "not", "offset", "on", "order", "outer", "returning",
    "right", "select", "union", "using", "values", "where", "window",
];

fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    for token in tokens {
        token.push_sql(&mut out);
    }
    out
}

fn lex(sql: &str) -> Result<Vec<Token>, CoreError> {
    let chars = sql.chars().collect::<Vec<_>>();
    let mut tokens = Vec::new();
    let mut index = 0;
    while index < chars.len() {
        let current = chars[index];
        let next = chars.get(index + 1).copied();
        let start = index;
        if current.is_whitespace() {
            while index < chars.len() && chars[index].is_whitespace() {
                index += 1;
            }
            tokens.push(Token::Space(chars[start..index].iter().collect()));
        } else if current == '-' && next == Some('-') {
            while index < chars.len() && chars[index] != '\n' {
                index += 1;
            }
            tokens.push(Token::Space(" ".to_string()));
        } else if current == '/' && next == Some('*') {
            index += 2;
            while index < chars.len() && !(chars[index] == '*' && chars.get(index + 1) == Some(&'/')) {
                index += 1;
            }
            if index >= chars.len() {
                return Err(CoreError::InvalidQuery("unterminated block comment".to_string()));
            }
            index += 2;
            tokens.push(Token::Space(" ".to_string()));
        } else if current == '\'' {
            let (text, end) = read_quoted(&chars, index, '\'')?;
            tokens.push(Token::Literal(quote_literal(&text)));
            index = end;
        } else if current == '"' || current == '`' {
            let (name, end) = read_quoted(&chars, index, current)?;
            tokens.push(Token::Quoted(name));
            index = end;
        } else if current == '?' {
            index += 1;
            while index < chars.len() && chars[index].is_ascii_digit() {
                index += 1;
            }
            let digits = chars[start + 1..index].iter().collect::<String>();
            let explicit = if digits.is_empty() {
                None
            } else {
                let position = digits.parse::<usize>().map_err(|err| {
                    CoreError::InvalidQuery(format!("invalid parameter ?{digits}: {err}"))
                })?;
                if position == 0 {
                    return Err(CoreError::InvalidQuery("parameter index ?0 is invalid".to_string()));
                }
                Some(position)
            };
            tokens.push(Token::Param(explicit));
        } else if matches!(current, ':' | '@' | '$') && next.is_some_and(|c| c.is_alphanumeric() || c == '_') {
            return Err(CoreError::InvalidQuery(
                "named parameters are not supported in merge queries".to_string(),
            ));
        } else if current.is_ascii_digit() || (current == '.' && next.is_some_and(|c| c.is_ascii_digit())) {
            while index < chars.len() && (chars[index].is_ascii_alphanumeric() || chars[index] == '.') {
                index += 1;
            }
            tokens.push(Token::Literal(chars[start..index].iter().collect()));
        } else if current.is_alphabetic() || current == '_' {
            while index < chars.len()
                && (chars[index].is_alphanumeric() || chars[index] == '_' || chars[index] == '$')
            {
                index += 1;
            }
            tokens.push(Token::Word(chars[start..index].iter().collect()));
        } else {
            let pair = next.map(|c| [current, c].iter().collect::<String>());
            match pair.as_deref() {
                Some("<=" | ">=" | "<>" | "!=" | "==" | "||" | "<<" | ">>") => {
                    index += 2;
                    tokens.push(Token::Punct(pair.unwrap_or_default()));
                }
                _ => {
                    index += 1;
                    tokens.push(Token::Punct(current.to_string()));
                }
            }
        }
    }
    Ok(tokens)
}

/// Read a quoted run starting at `start`; doubled quotes are escapes.
fn read_quoted(chars: &[char], start: usize, quote: char) -> Result<(String, usize), CoreError> {
    let mut text = String::new();
    let mut index = start + 1;
    while index < chars.len() {
        if chars[index] == quote {
            if chars.get(index + 1) == Some(&quote) {
                text.push(quote);
                index += 2;
                continue;
            }
            return Ok((text, index + 1));
        }
        text.push(chars[index]);
        index += 1;
    }
    Err(CoreError::InvalidQuery(format!("unterminated {quote} quote")))
}

fn next_significant(tokens: &[Token], from: usize) -> Option<usize> {
    (from..tokens.len()).find(|index| !tokens[*index].is_space())
}

/// Index of the `)` closing the `(` at `open`.
fn matching_paren(tokens: &[Token], open: usize) -> Result<usize, CoreError> {
    let mut depth = 0_usize;
    for (index, token) in tokens.iter().enumerate().skip(open) {
        if token.is_punct("(") {
            depth += 1;
        } else if token.is_punct(")") {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Ok(index);
            }
        }
    }
    Err(CoreError::InvalidQuery("unbalanced parentheses".to_string()))
}

/// Indices of tokens outside any parentheses.
fn top_level(tokens: &[Token]) -> Vec<usize> {
    let mut depth = 0_usize;
    let mut indices = Vec::new();
    for (index, token) in tokens.iter().enumerate() {
        if token.is_punct("(") {
            depth += 1;
        } else if token.is_punct(")") {
            depth = depth.saturating_sub(1);
        } else if depth == 0 {
            indices.push(index);
        }
    }
    indices
}

fn trim_statement(tokens: &mut Vec<Token>) -> Result<(), CoreError> {
    while tokens.last().is_some_and(|token| token.is_space() || token.is_punct(";")) {
        tokens.pop();
    }
    while tokens.first().is_some_and(Token::is_space) {
        tokens.remove(0);
    }
    if tokens.iter().any(|token| token.is_punct(";")) {
        return Err(CoreError::InvalidQuery("multiple statements cannot be merged".to_string()));
    }
    Ok(())
}

/// Replace every placeholder with the escaped literal of its parameter.
fn inline_params(tokens: &mut [Token], params: &[SqlValue]) -> Result<(), CoreError> {
    let mut largest = 0_usize;
    let mut positions = Vec::new();
    for (index, token) in tokens.iter().enumerate() {
        if let Token::Param(explicit) = token {
            let position = explicit.unwrap_or(largest + 1);
            largest = largest.max(position);
            positions.push((index, position));
        }
    }
    if largest != params.len() {
        return Err(CoreError::ParameterCount { expected: largest, provided: params.len() });
    }
    for (index, position) in positions {
        let literal = params[position - 1].to_sql_literal();
        tokens[index] = Token::Literal(literal);
    }
    Ok(())
}

fn ensure_single_select(tokens: &[Token]) -> Result<(), CoreError> {
    if !tokens.first().is_some_and(|token| token.is_keyword("select")) {
        return Err(CoreError::InvalidQuery("only SELECT statements can be merged".to_string()));
    }
    for index in top_level(tokens) {
        let token = &tokens[index];
        if ["union", "except", "intersect"].iter().any(|kw| token.is_keyword(kw)) {
            return Err(CoreError::InvalidQuery(
                "compound SELECT statements cannot be merged".to_string(),
            ));
        }
    }
    Ok(())
}

/// Fail on `FROM "t" "a"`, `FROM "t" AS a`, `FROM t a` and the `JOIN` forms.
fn reject_aliases(tokens: &[Token]) -> Result<(), CoreError> {
    for (index, token) in tokens.iter().enumerate() {
        let in_from = token.is_keyword("from");
        if !in_from && !token.is_keyword("join") {
            continue;
        }
        let mut cursor = next_significant(tokens, index + 1);
        while let Some(position) = cursor {
            let item = &tokens[position];
            if !item.is_plain_ident() {
                break;
            }
            let mut name = item.ident_name().unwrap_or_default().to_string();
            let mut after = next_significant(tokens, position + 1);
            if let Some(dot) = after.filter(|at| tokens[*at].is_punct(".")) {
                if let Some(qualified) = next_significant(tokens, dot + 1) {
                    name = tokens[qualified].ident_name().unwrap_or_default().to_string();
                    after = next_significant(tokens, qualified + 1);
                }
            }
            let Some(after) = after else {
                break;
            };
            let following = &tokens[after];
            if following.is_keyword("as") || following.is_plain_ident() {
                return Err(CoreError::AliasedTable(name));
            }
            if in_from && following.is_punct(",") {
                cursor = next_significant(tokens, after + 1);
                continue;
            }
            break;
        }
    }
    Ok(())
}

/// Split off a trailing top-level `ORDER BY` / `LIMIT` / `OFFSET` clause.
fn split_tail(mut tokens: Vec<Token>) -> (Vec<Token>, Vec<Token>) {
    let mut tail_start = None;
    for index in top_level(&tokens) {
        let token = &tokens[index];
        let is_order = token.is_keyword("order")
            && next_significant(&tokens, index + 1).is_some_and(|next| tokens[next].is_keyword("by"));
        if is_order || token.is_keyword("limit") {
            tail_start = Some(index);
            break;
        }
    }
    let Some(start) = tail_start else {
        return (tokens, Vec::new());
    };
    let tail = tokens.split_off(start);
    while tokens.last().is_some_and(Token::is_space) {
        tokens.pop();
    }
    (tokens, tail)
}

/// `"asset"."name"` becomes `"name"`; ordering applies to the union's output columns.
fn reduce_qualified(tail: &[Token]) -> Vec<Token> {
    let mut reduced = Vec::with_capacity(tail.len());
    let mut index = 0;
    while index < tail.len() {
        let qualified = tail[index].ident_name().is_some()
            && tail.get(index + 1).is_some_and(|token| token.is_punct("."))
            && tail.get(index + 2).is_some_and(|token| token.ident_name().is_some());
        if qualified {
            index += 2;
            continue;
        }
        reduced.push(tail[index].clone());
        index += 1;
    }
    reduced
}

/// Rewrite `json_group_array(json_array(a, b))` as
/// `json_group_array(json_object('a', a, 'b', b))`.
fn normalize_json_arrays(mut tokens: Vec<Token>) -> Result<Vec<Token>, CoreError> {
    let mut index = 0;
    while index < tokens.len() {
        if !tokens[index].is_keyword("json_group_array") {
            index += 1;
            continue;
        }
        let open = next_significant(&tokens, index + 1).filter(|at| tokens[*at].is_punct("("));
        let inner = open
            .and_then(|open| next_significant(&tokens, open + 1))
            .filter(|at| tokens[*at].is_keyword("json_array"));
        let inner_open = inner
            .and_then(|inner| next_significant(&tokens, inner + 1))
            .filter(|at| tokens[*at].is_punct("("));
        let (Some(inner), Some(inner_open)) = (inner, inner_open) else {
            index += 1;
            continue;
        };
        let close = matching_paren(&tokens, inner_open)?;

        let mut replacement = vec![Token::Word("json_object".to_string()), Token::Punct("(".to_string())];
        for (position, argument) in split_arguments(&tokens[inner_open + 1..close]).into_iter().enumerate() {
            if position > 0 {
                replacement.push(Token::Punct(",".to_string()));
                replacement.push(Token::Space(" ".to_string()));
            }
            replacement.push(Token::Literal(quote_literal(&argument_key(&argument, position))));
            replacement.push(Token::Punct(",".to_string()));
            replacement.push(Token::Space(" ".to_string()));
            replacement.extend(argument);
        }
        replacement.push(Token::Punct(")".to_string()));
        tokens.splice(inner..=close, replacement);
        index = inner + 1;
    }
    Ok(tokens)
}

fn split_arguments(tokens: &[Token]) -> Vec<Vec<Token>> {
    let mut arguments = vec![Vec::new()];
    let mut depth = 0_usize;
    for token in tokens {
        if token.is_punct("(") {
            depth += 1;
        } else if token.is_punct(")") {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && token.is_punct(",") {
            arguments.push(Vec::new());
            continue;
        }
        if let Some(current) = arguments.last_mut() {
            current.push(token.clone());
        }
    }
    arguments
        .into_iter()
        .map(|argument| argument.into_iter().skip_while(Token::is_space).collect::<Vec<_>>())
        .map(|mut argument| {
            while argument.last().is_some_and(Token::is_space) {
                argument.pop();
            }
            argument
        })
        .filter(|argument| !argument.is_empty())
        .collect()
}

/// Object key for a `json_array` argument: the column name when it is a column.
fn argument_key(argument: &[Token], position: usize) -> String {
    match argument {
        [column] | [_, Token::Punct(_), column] => column
            .ident_name()
            .filter(|_| argument.len() == 1 || argument[1].is_punct("."))
            .map_or_else(|| format!("col{position}"), str::to_string),
        _ => format!("col{position}"),
    }
}

/// Add `, '<tag>' AS "source"` to the outermost projection.
fn with_source_tag(body: &[Token], tag: &str) -> Vec<Token> {
    let from = top_level(body).into_iter().find(|index| body[*index].is_keyword("from"));
    let insert_at = match from {
        Some(from) => (0..from).rev().find(|index| !body[*index].is_space()).map_or(from, |at| at + 1),
        None => body.len(),
    };
    let mut tagged = body.to_vec();
    tagged.splice(
        insert_at..insert_at,
        [
            Token::Punct(",".to_string()),
            Token::Space(" ".to_string()),
            Token::Literal(quote_literal(tag)),
            Token::Space(" ".to_string()),
            Token::Word("AS".to_string()),
            Token::Space(" ".to_string()),
            Token::Quoted(SOURCE_COLUMN.to_string()),
        ],
    );
    tagged
}

/// Swap every identifier token naming a synced table for its local counterpart.
fn localize_tokens(body: &[Token], catalog: &Catalog, suffix: &str) -> Vec<Token> {
    body.iter()
        .map(|token| {
            let matched = token
                .ident_name()
                .and_then(|name| catalog.tables.iter().find(|table| table.name.eq_ignore_ascii_case(name)));
            match (token, matched) {
                (Token::Quoted(_), Some(table)) => Token::Quoted(local_name(&table.name, suffix)),
                (Token::Word(_), Some(table)) => Token::Word(local_name(&table.name, suffix)),
                _ => token.clone(),
            }
        })
        .collect()
}

/// Rewrite a read-only `SELECT` so it runs over both table families.
///
/// Parameters are inlined, the outermost projection gains a `source` tag, the
/// local branch swaps every synced table identifier for its local counterpart
/// and a trailing `ORDER BY`/`LIMIT` is applied once to the union.
///
/// # Errors
/// Returns [`CoreError::AliasedTable`] for aliased table references,
/// [`CoreError::ParameterCount`] when `params` does not match the placeholders
/// and [`CoreError::InvalidQuery`] for statements that are not a single SELECT.
pub fn merge_sql(
    sql: &str,
    params: &[SqlValue],
    catalog: &Catalog,
    config: &SyncConfig,
) -> Result<String, CoreError> {
    let mut tokens = lex(sql)?;
    trim_statement(&mut tokens)?;
    inline_params(&mut tokens, params)?;
    ensure_single_select(&tokens)?;
    reject_aliases(&tokens)?;

    let (body, tail) = split_tail(tokens);
    let body = normalize_json_arrays(body)?;
    let synced = with_source_tag(&body, DataSource::Synced.tag(config));
    let local = with_source_tag(
        &localize_tokens(&body, catalog, &config.local_suffix),
        DataSource::Local.tag(config),
    );

    let mut merged = format!("SELECT * FROM ({} UNION ALL {})", render(&synced), render(&local));
    if !tail.is_empty() {
        merged.push(' ');
        merged.push_str(&render(&reduce_qualified(&tail)));
    }
    debug!(sql = %merged, "merged textual query");
    Ok(merged)
}

/// Logical catalog tables named anywhere in `sql`, local names folded onto
/// their synced counterpart, in order of first appearance.
///
/// # Errors
/// Returns [`CoreError::InvalidQuery`] when `sql` cannot be tokenized.
pub fn referenced_tables(
    sql: &str,
    catalog: &Catalog,
    config: &SyncConfig,
) -> Result<Vec<String>, CoreError> {
    let mut tables: Vec<String> = Vec::new();
    for token in lex(sql)? {
        let Some(name) = token.ident_name() else {
            continue;
        };
        let logical = name.strip_suffix(&config.local_suffix).unwrap_or(name);
        if let Some(table) = catalog.tables.iter().find(|table| table.name.eq_ignore_ascii_case(logical)) {
            if !tables.contains(&table.name) {
                tables.push(table.name.clone());
            }
        }
    }
    Ok(tables)
}
