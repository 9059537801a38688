//! Changelog parsing.
//!
//! A changelog is a "formatted SQL" file: a header line followed by changesets, each
//! opened by a `--changeset author:id` line.
//!
//! ```text
//! --liquibase formatted sql
//!
//! --changeset alice:1 labels:base
//! --comment: people live here
//! CREATE TABLE person (id BIGINT PRIMARY KEY, name VARCHAR(100));
//! --rollback DROP TABLE person;
//!
//! --changeset bob:2 labels:extra context:"!test"
//! INSERT INTO person (id, name) VALUES (1, 'Ada');
//! --rollback DELETE FROM person WHERE id = 1;
//! ```
//!
//! The header may also be written `--changekeeper formatted sql`, and may carry
//! `logicalFilePath:<path>` to pin the path recorded in changeset identities.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use crate::core::{calculate_checksum, Changeset, ChangesetId, Rollback};
use crate::error::Error;
use crate::expression::Expression;

/// An ordered, parsed changelog.
#[derive(Debug, Clone, PartialEq)]
pub struct Changelog {
    path: String,
    changesets: Vec<Changeset>,
}

impl Changelog {
    /// Read and parse the changelog at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cwd = std::env::current_dir().ok();
        let relative = cwd
            .as_deref()
            .and_then(|cwd| path.strip_prefix(cwd).ok())
            .unwrap_or(path);
        Self::parse(&source, relative)
    }

    /// Parse changelog text. `path` is used for error messages and, unless the header sets
    /// `logicalFilePath`, as the path component of every changeset identity. The identity
    /// path is normalized, so `./db/changelog.sql` and `db/changelog.sql` name the same file.
    pub fn parse(source: &str, path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut parser = ChangelogParser {
            file: path.to_path_buf(),
            logical_path: normalize_path(&path.to_string_lossy()),
            changesets: Vec::new(),
            seen: HashSet::new(),
        };
        parser.run(source)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            path = %parser.logical_path,
            changesets = parser.changesets.len(),
            "Parsed changelog"
        );

        Ok(Self {
            path: parser.logical_path,
            changesets: parser.changesets,
        })
    }

    /// The path recorded in changeset identities.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn changesets(&self) -> &[Changeset] {
        &self.changesets
    }

    pub fn find(&self, id: &ChangesetId) -> Option<&Changeset> {
        self.changesets.iter().find(|c| &c.id == id)
    }

    /// This changelog cut after the first changeset whose id is `id`.
    pub fn up_to(&self, id: &str) -> Option<Changelog> {
        let end = self.changesets.iter().position(|c| c.id.id == id)?;
        Some(Self {
            path: self.path.clone(),
            changesets: self.changesets[..=end].to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.changesets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changesets.is_empty()
    }
}

/// Forward slashes only, no `.` segments, no repeated separators, `..` folded where it can be.
fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." if segments.last().is_some_and(|last| *last != "..") => {
                segments.pop();
            }
            ".." if absolute => {}
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

struct ChangelogParser {
    file: PathBuf,
    logical_path: String,
    changesets: Vec<Changeset>,
    seen: HashSet<(String, String)>,
}

/// A changeset whose body is still being read.
struct Draft {
    id: String,
    author: String,
    line: usize,
    labels: BTreeSet<String>,
    context: Option<Expression>,
    split_statements: bool,
    end_delimiter: String,
    strip_comments: bool,
    comment: Option<String>,
    body: String,
    rollback_declared: bool,
    rollback_body: String,
}

impl ChangelogParser {
    fn error(&self, line: usize, message: impl Into<String>) -> Error {
        Error::Parse {
            path: self.file.clone(),
            line,
            message: message.into(),
        }
    }

    fn run(&mut self, source: &str) -> Result<(), Error> {
        let mut header_seen = false;
        let mut current: Option<Draft> = None;
        let source = source.strip_prefix('\u{feff}').unwrap_or(source);

        for (index, raw_line) in source.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = raw_line.trim();

            if !header_seen {
                if trimmed.is_empty() {
                    continue;
                }
                self.header(trimmed, line_no)?;
                header_seen = true;
                continue;
            }

            if let Some(rest) = directive(trimmed, "changeset") {
                if let Some(draft) = current.take() {
                    self.finish(draft)?;
                }
                current = Some(self.open(rest, line_no)?);
                continue;
            }

            let Some(draft) = current.as_mut() else {
                if trimmed.is_empty() || trimmed.starts_with("--") {
                    continue;
                }
                return Err(self.error(line_no, "SQL found before the first --changeset"));
            };

            if let Some(rest) = directive(trimmed, "rollback") {
                draft.rollback_declared = true;
                if !rest.eq_ignore_ascii_case("not required") {
                    draft.rollback_body.push_str(rest);
                    draft.rollback_body.push('\n');
                }
            } else if let Some(rest) = comment_directive(trimmed) {
                draft.comment = Some(rest.to_string());
            } else {
                draft.body.push_str(raw_line);
                draft.body.push('\n');
            }
        }

        if !header_seen {
            return Err(self.error(1, "changelog is empty: expected '--liquibase formatted sql'"));
        }
        if let Some(draft) = current.take() {
            self.finish(draft)?;
        }
        Ok(())
    }

    fn header(&mut self, line: &str, line_no: usize) -> Result<(), Error> {
        let words = line
            .strip_prefix("--")
            .map(|rest| rest.split_whitespace().collect::<Vec<_>>())
            .unwrap_or_default();
        let valid = words.len() >= 3
            && (words[0].eq_ignore_ascii_case("liquibase")
                || words[0].eq_ignore_ascii_case("changekeeper"))
            && words[1].eq_ignore_ascii_case("formatted")
            && words[2].eq_ignore_ascii_case("sql");
        if !valid {
            return Err(self.error(
                line_no,
                "changelog must start with '--liquibase formatted sql'",
            ));
        }
        for word in &words[3..] {
            match word.split_once(':') {
                Some((key, value)) if key.eq_ignore_ascii_case("logicalFilePath") && !value.is_empty() => {
                    self.logical_path = normalize_path(value);
                }
                _ => {
                    return Err(self.error(
                        line_no,
                        format!("unknown changelog attribute '{}'", word),
                    ))
                }
            }
        }
        Ok(())
    }

    fn open(&self, rest: &str, line_no: usize) -> Result<Draft, Error> {
        let words = split_attributes(rest).map_err(|e| self.error(line_no, e))?;
        let Some((identity, attributes)) = words.split_first() else {
            return Err(self.error(line_no, "expected '--changeset author:id'"));
        };
        let (author, id) = match identity.split_once(':') {
            Some((author, id)) if !author.is_empty() && !id.is_empty() => (author, id),
            _ => {
                return Err(self.error(
                    line_no,
                    format!("expected 'author:id' after --changeset, found '{}'", identity),
                ))
            }
        };

        let mut draft = Draft {
            id: id.to_string(),
            author: author.to_string(),
            line: line_no,
            labels: BTreeSet::new(),
            context: None,
            split_statements: true,
            end_delimiter: ";".to_string(),
            strip_comments: false,
            comment: None,
            body: String::new(),
            rollback_declared: false,
            rollback_body: String::new(),
        };

        for attribute in attributes {
            let Some((key, value)) = attribute.split_once(':') else {
                return Err(self.error(
                    line_no,
                    format!("expected 'name:value' changeset attribute, found '{}'", attribute),
                ));
            };
            match key.to_ascii_lowercase().as_str() {
                "labels" => {
                    draft.labels = value
                        .split(',')
                        .map(|l| l.trim().to_lowercase())
                        .filter(|l| !l.is_empty())
                        .collect();
                }
                "context" | "contexts" => {
                    let expression =
                        Expression::parse(value).map_err(|e| self.error(line_no, e))?;
                    draft.context = (!expression.is_empty()).then_some(expression);
                }
                "splitstatements" => {
                    draft.split_statements = parse_bool(value).map_err(|e| self.error(line_no, e))?;
                }
                "stripcomments" => {
                    draft.strip_comments = parse_bool(value).map_err(|e| self.error(line_no, e))?;
                }
                "enddelimiter" => {
                    if value.is_empty() {
                        return Err(self.error(line_no, "endDelimiter must not be empty"));
                    }
                    draft.end_delimiter = value.to_string();
                }
                _ => {
                    return Err(self.error(
                        line_no,
                        format!("unknown changeset attribute '{}'", key),
                    ))
                }
            }
        }

        Ok(draft)
    }

    fn finish(&mut self, draft: Draft) -> Result<(), Error> {
        if !self.seen.insert((draft.id.clone(), draft.author.clone())) {
            return Err(self.error(
                draft.line,
                format!(
                    "duplicate changeset '{}:{}'",
                    draft.author, draft.id
                ),
            ));
        }

        let body = if draft.strip_comments {
            strip_line_comments(&draft.body)
        } else {
            draft.body
        };
        let statements = if draft.split_statements {
            split_statements(&body, &draft.end_delimiter)
        } else {
            let whole = body.trim();
            if is_blank_sql(whole) {
                vec![]
            } else {
                vec![whole.to_string()]
            }
        };
        if statements.is_empty() {
            return Err(self.error(
                draft.line,
                format!("changeset '{}:{}' has no SQL statements", draft.author, draft.id),
            ));
        }

        let rollback = Rollback {
            declared: draft.rollback_declared,
            statements: split_statements(&draft.rollback_body, &draft.end_delimiter),
        };

        self.changesets.push(Changeset {
            id: ChangesetId::new(draft.id, draft.author, self.logical_path.clone()),
            checksum: calculate_checksum(&statements),
            statements,
            rollback,
            labels: draft.labels,
            context: draft.context,
            comment: draft.comment,
            line: draft.line,
        });
        Ok(())
    }
}

/// If `line` is `--<name> ...`, return what follows the name.
fn directive<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix("--")?.trim_start();
    if rest.len() < name.len() || !rest.is_char_boundary(name.len()) {
        return None;
    }
    let (head, tail) = rest.split_at(name.len());
    if !head.eq_ignore_ascii_case(name) {
        return None;
    }
    if tail.is_empty() || tail.starts_with(char::is_whitespace) {
        Some(tail.trim())
    } else {
        None
    }
}

fn comment_directive(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("--")?.trim_start();
    let head = rest.get(..8)?;
    if head.eq_ignore_ascii_case("comment:") {
        Some(rest[8..].trim())
    } else {
        None
    }
}

/// Split on whitespace, keeping double-quoted runs together (quotes are removed).
fn split_attributes(rest: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in rest.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quote in --changeset line".to_string());
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("expected 'true' or 'false', found '{}'", value)),
    }
}

fn strip_line_comments(body: &str) -> String {
    body.lines()
        .filter(|l| !l.trim_start().starts_with("--"))
        .fold(String::new(), |mut acc, l| {
            acc.push_str(l);
            acc.push('\n');
            acc
        })
}

fn is_blank_sql(statement: &str) -> bool {
    statement.lines().all(|l| {
        let l = l.trim();
        l.is_empty() || l.starts_with("--")
    })
}

#[derive(Clone)]
enum SplitState {
    Normal,
    Quoted(char),
    LineComment,
    BlockComment,
    DollarQuoted(Vec<char>),
}

/// Split SQL into statements on `delimiter`, ignoring delimiters inside quotes,
/// comments and dollar-quoted bodies. Empty and comment-only statements are dropped.
pub(crate) fn split_statements(sql: &str, delimiter: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let delimiter: Vec<char> = delimiter.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = SplitState::Normal;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state.clone() {
            SplitState::Normal => {
                if !delimiter.is_empty() && chars[i..].starts_with(&delimiter) {
                    push_statement(&mut statements, &mut current);
                    i += delimiter.len();
                    continue;
                }
                match c {
                    '\'' | '"' | '`' => state = SplitState::Quoted(c),
                    '-' if next == Some('-') => state = SplitState::LineComment,
                    '/' if next == Some('*') => {
                        current.push_str("/*");
                        i += 2;
                        state = SplitState::BlockComment;
                        continue;
                    }
                    '$' => {
                        if let Some(tag) = dollar_tag(&chars[i..]) {
                            current.extend(tag.iter());
                            i += tag.len();
                            state = SplitState::DollarQuoted(tag);
                            continue;
                        }
                    }
                    _ => {}
                }
                current.push(c);
                i += 1;
            }
            SplitState::Quoted(quote) => {
                current.push(c);
                i += 1;
                if c == quote {
                    state = SplitState::Normal;
                }
            }
            SplitState::LineComment => {
                current.push(c);
                i += 1;
                if c == '\n' {
                    state = SplitState::Normal;
                }
            }
            SplitState::BlockComment => {
                if c == '*' && next == Some('/') {
                    current.push_str("*/");
                    i += 2;
                    state = SplitState::Normal;
                    continue;
                }
                current.push(c);
                i += 1;
            }
            SplitState::DollarQuoted(tag) => {
                if chars[i..].starts_with(&tag) {
                    current.extend(tag.iter());
                    i += tag.len();
                    state = SplitState::Normal;
                    continue;
                }
                current.push(c);
                i += 1;
            }
        }
    }

    push_statement(&mut statements, &mut current);
    statements
}

/// A dollar-quote opener such as `$$` or `$body$` at the start of `chars`.
fn dollar_tag(chars: &[char]) -> Option<Vec<char>> {
    let mut end = 1;
    while end < chars.len() {
        let c = chars[end];
        if c == '$' {
            return Some(chars[..=end].to_vec());
        }
        let valid = c == '_' || c.is_ascii_alphabetic() || (end > 1 && c.is_ascii_digit());
        if !valid {
            return None;
        }
        end += 1;
    }
    None
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !is_blank_sql(statement) {
        statements.push(statement.to_string());
    }
    current.clear();
}
