//! Statement classification for the proxy's rewrite and guard decisions.
//!
//! A byte scanner is all the proxy needs: it never plans or executes SQL
//! itself, it only has to tell transaction control apart from data
//! statements, split multi-statement strings the way the backend would,
//! and read a handful of shapes (savepoint names, DEALLOCATE targets,
//! RETURNING lists, `$N` markers). Everything else is relayed verbatim,
//! so vendor extensions the scanner does not understand still flow
//! through as `Other`.

/// PostgreSQL type OID for `bigint`.
pub const INT8_OID: u32 = 20;
/// PostgreSQL type OID for `text`.
pub const TEXT_OID: u32 = 25;
/// PostgreSQL type OID for `int4`.
pub const INT4_OID: u32 = 23;
/// PostgreSQL type OID for `bool`.
pub const BOOL_OID: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    Release,
    RollbackToSavepoint,
    Deallocate,
    Set,
    Create,
    Drop,
    Other,
}

impl StatementKind {
    pub fn is_transaction_control(self) -> bool {
        matches!(
            self,
            Self::Begin
                | Self::Commit
                | Self::Rollback
                | Self::Savepoint
                | Self::Release
                | Self::RollbackToSavepoint
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeallocateTarget {
    All,
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedStatement {
    pub sql: String,
    pub kind: StatementKind,
    /// Savepoint name for SAVEPOINT / RELEASE / ROLLBACK TO SAVEPOINT.
    pub savepoint_name: Option<String>,
    /// Target for DEALLOCATE.
    pub deallocate: Option<DeallocateTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturningColumn {
    pub name: String,
    pub type_oid: u32,
}

/// Splits a query string into statements on semicolons, respecting single
/// and double quotes (with doubled-quote escapes). Empty statements are
/// dropped.
pub fn split_statements(query: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;

    for ch in query.chars() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            ';' if !in_single && !in_double => {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    statements.push(trimmed.to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    statements
}

/// Splits and classifies every statement in the string.
pub fn parse_statements(query: &str) -> Vec<ClassifiedStatement> {
    split_statements(query).into_iter().map(|sql| classify(&sql)).collect()
}

pub fn classify(sql: &str) -> ClassifiedStatement {
    let trimmed = sql.trim();
    let mut words = KeywordScanner::new(trimmed);
    let first = words.next_keyword().unwrap_or_default();

    let (kind, savepoint_name, deallocate) = match first.as_str() {
        "SELECT" | "WITH" | "TABLE" | "VALUES" => (StatementKind::Select, None, None),
        "INSERT" => (StatementKind::Insert, None, None),
        "UPDATE" => (StatementKind::Update, None, None),
        "DELETE" => (StatementKind::Delete, None, None),
        "BEGIN" => (StatementKind::Begin, None, None),
        "START" => match words.next_keyword().as_deref() {
            Some("TRANSACTION") => (StatementKind::Begin, None, None),
            _ => (StatementKind::Other, None, None),
        },
        "COMMIT" => (StatementKind::Commit, None, None),
        "ROLLBACK" => {
            let mut lookahead = words.clone();
            if lookahead.next_keyword().as_deref() == Some("TO") {
                let mut after_savepoint = lookahead.clone();
                if after_savepoint.next_keyword().as_deref() == Some("SAVEPOINT") {
                    lookahead = after_savepoint;
                }
                let name = lookahead.next_identifier();
                (StatementKind::RollbackToSavepoint, name, None)
            } else {
                (StatementKind::Rollback, None, None)
            }
        }
        "SAVEPOINT" => {
            let name = words.next_identifier();
            (StatementKind::Savepoint, name, None)
        }
        "RELEASE" => {
            let mut lookahead = words.clone();
            if lookahead.next_keyword().as_deref() == Some("SAVEPOINT") {
                words = lookahead;
            }
            let name = words.next_identifier();
            (StatementKind::Release, name, None)
        }
        "DEALLOCATE" => {
            let mut lookahead = words.clone();
            if lookahead.next_keyword().as_deref() == Some("PREPARE") {
                words = lookahead;
            }
            let mut all_check = words.clone();
            let target = if all_check.next_keyword().as_deref() == Some("ALL") {
                Some(DeallocateTarget::All)
            } else {
                words.next_identifier().map(DeallocateTarget::Name)
            };
            (StatementKind::Deallocate, None, target)
        }
        "SET" => (StatementKind::Set, None, None),
        "CREATE" => (StatementKind::Create, None, None),
        "DROP" => (StatementKind::Drop, None, None),
        _ => (StatementKind::Other, None, None),
    };

    ClassifiedStatement {
        sql: trimmed.to_string(),
        kind,
        savepoint_name,
        deallocate,
    }
}

impl ClassifiedStatement {
    /// Whether executing this statement produces a result set: SELECT, or
    /// DML with a RETURNING clause.
    pub fn returns_result_set(&self) -> bool {
        match self.kind {
            StatementKind::Select => true,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete => {
                has_returning_clause(&self.sql)
            }
            _ => false,
        }
    }

    /// The CommandComplete tag the proxy synthesizes when it does not have
    /// the backend's real tag. Counts follow the tag conventions: INSERT
    /// reports one row, UPDATE/DELETE report zero.
    pub fn command_tag(&self) -> String {
        match self.kind {
            StatementKind::Select => "SELECT".to_string(),
            StatementKind::Insert => "INSERT 0 1".to_string(),
            StatementKind::Update => "UPDATE 0".to_string(),
            StatementKind::Delete => "DELETE 0".to_string(),
            StatementKind::Begin => "BEGIN".to_string(),
            StatementKind::Commit => "COMMIT".to_string(),
            StatementKind::Rollback | StatementKind::RollbackToSavepoint => {
                "ROLLBACK".to_string()
            }
            StatementKind::Savepoint => "SAVEPOINT".to_string(),
            StatementKind::Release => "RELEASE".to_string(),
            StatementKind::Deallocate => match self.deallocate {
                Some(DeallocateTarget::All) => "DEALLOCATE ALL".to_string(),
                _ => "DEALLOCATE".to_string(),
            },
            StatementKind::Set => "SET".to_string(),
            StatementKind::Create => "CREATE".to_string(),
            StatementKind::Drop => "DROP".to_string(),
            StatementKind::Other => "OK".to_string(),
        }
    }
}

fn has_returning_clause(sql: &str) -> bool {
    find_keyword_outside_quotes(sql, "RETURNING").is_some()
}

/// Extracts RETURNING column names from a DML statement. Returns an empty
/// list when there is no RETURNING clause, when it is `*`, or when any
/// item is not a bare column reference; callers then trust the backend's
/// own descriptor.
pub fn returning_columns(sql: &str) -> Vec<ReturningColumn> {
    let Some(idx) = find_keyword_outside_quotes(sql, "RETURNING") else {
        return Vec::new();
    };
    let mut rest = sql[idx + "RETURNING".len()..].trim();
    if rest.is_empty() || rest == "*" {
        return Vec::new();
    }

    let mut columns = Vec::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let (name, remaining) = if let Some(stripped) = rest.strip_prefix('"') {
            let Some(end) = find_closing_quote(stripped) else {
                return Vec::new();
            };
            (stripped[..end].replace("\"\"", "\""), stripped[end + 1..].trim_start())
        } else {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            if end == 0 {
                return Vec::new();
            }
            (rest[..end].to_ascii_lowercase(), rest[end..].trim_start())
        };

        let type_oid = if name.eq_ignore_ascii_case("id") {
            INT8_OID
        } else {
            TEXT_OID
        };
        columns.push(ReturningColumn { name, type_oid });

        if remaining.is_empty() {
            break;
        }
        if let Some(after_comma) = remaining.strip_prefix(',') {
            rest = after_comma;
            continue;
        }
        // An alias, expression tail, or anything else: not a bare column list.
        return Vec::new();
    }
    columns
}

fn find_closing_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'"' {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Locates a standalone keyword outside quoted regions, case-insensitive.
fn find_keyword_outside_quotes(sql: &str, keyword: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let upper = sql.to_ascii_uppercase();
    let upper_bytes = upper.as_bytes();
    let kw = keyword.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            _ if !in_single && !in_double => {
                if upper_bytes[i..].starts_with(kw) {
                    let before_ok = i == 0 || !is_identifier_byte(bytes[i - 1]);
                    let after = i + kw.len();
                    let after_ok = after >= bytes.len() || !is_identifier_byte(bytes[after]);
                    if before_ok && after_ok {
                        return Some(i);
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// The highest `$N` parameter index used in the statement, scanning
/// outside quoted regions. Zero when the statement takes no parameters.
pub fn max_param_index(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    let mut max = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            b'$' if !in_single && !in_double => {
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > i + 1 {
                    if let Ok(n) = sql[i + 1..end].parse::<usize>() {
                        max = max.max(n);
                    }
                    i = end;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    max
}

/// Word-at-a-time scanner over the leading tokens of a statement.
#[derive(Clone)]
struct KeywordScanner<'a> {
    rest: &'a str,
}

impl<'a> KeywordScanner<'a> {
    fn new(sql: &'a str) -> Self {
        Self { rest: sql }
    }

    /// Next bare word, uppercased. Stops at anything that is not a plain
    /// identifier character.
    fn next_keyword(&mut self) -> Option<String> {
        self.rest = self.rest.trim_start();
        let end = self
            .rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let word = self.rest[..end].to_ascii_uppercase();
        self.rest = &self.rest[end..];
        Some(word)
    }

    /// Next word preserving its case (identifiers are case-folded by the
    /// caller as needed).
    fn next_keyword_or_identifier(&mut self) -> Option<String> {
        self.rest = self.rest.trim_start();
        let end = self
            .rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let word = self.rest[..end].to_string();
        self.rest = &self.rest[end..];
        Some(word)
    }

    /// Next identifier, honoring double-quoting. Unquoted identifiers are
    /// folded to lowercase the way the backend folds them.
    fn next_identifier(&mut self) -> Option<String> {
        self.rest = self.rest.trim_start();
        if let Some(stripped) = self.rest.strip_prefix('"') {
            let end = find_closing_quote(stripped)?;
            let name = stripped[..end].replace("\"\"", "\"");
            self.rest = &stripped[end + 1..];
            return Some(name);
        }
        self.next_keyword_or_identifier()
            .map(|word| word.to_ascii_lowercase())
    }
}
