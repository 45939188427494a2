//! `pgrollback <verb>` pseudo-queries, recognized in query text before
//! any rewriting. Result sets are synthesized proxy-side; nothing is
//! forwarded to the backend.

use std::sync::Arc;

use crate::protocol::messages::FieldDescription;
use crate::proxy::registry::{RegistryError, SessionRegistry};
use crate::sql::classifier::{BOOL_OID, INT4_OID, TEXT_OID};

/// Case-insensitive first token that marks a pseudo-query. `pgtest` is
/// the legacy synonym.
const COMMAND_WORDS: [&str; 2] = ["pgrollback", "pgtest"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminVerb {
    /// Ensure the session exists; reply 1.
    Begin,
    /// Reset the session to a fresh base transaction; reply 1.
    Rollback,
    /// One row describing this session.
    Status,
    /// One row per live session.
    List,
    /// Evict idle sessions; reply the count.
    Cleanup,
}

/// Returns None when the text is not a pseudo-query, Some(Err) for a
/// pseudo-query with an unknown verb.
pub fn parse_admin_command(sql: &str) -> Option<Result<AdminVerb, String>> {
    let mut words = sql.trim().trim_end_matches(';').split_whitespace();
    let first = words.next()?;
    if !COMMAND_WORDS
        .iter()
        .any(|word| first.eq_ignore_ascii_case(word))
    {
        return None;
    }
    let verb = match words.next() {
        Some(verb) => verb.to_ascii_lowercase(),
        None => return Some(Err(format!("incomplete pgrollback command: {sql}"))),
    };
    if words.next().is_some() {
        return Some(Err(format!("malformed pgrollback command: {sql}")));
    }
    let verb = match verb.as_str() {
        "begin" => AdminVerb::Begin,
        "rollback" => AdminVerb::Rollback,
        "status" => AdminVerb::Status,
        "list" => AdminVerb::List,
        "cleanup" => AdminVerb::Cleanup,
        other => return Some(Err(format!("unknown pgrollback action: {other}"))),
    };
    Some(Ok(verb))
}

/// A result set the proxy answers without touching the backend.
#[derive(Debug, Clone)]
pub struct SynthesizedResultSet {
    pub fields: Vec<FieldDescription>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    pub tag: String,
}

fn int_result(value: i64) -> SynthesizedResultSet {
    SynthesizedResultSet {
        fields: vec![FieldDescription::text("?column?", INT4_OID)],
        rows: vec![vec![Some(value.to_string().into_bytes())]],
        tag: "SELECT 1".to_string(),
    }
}

fn status_fields() -> Vec<FieldDescription> {
    vec![
        FieldDescription::text("test_id", TEXT_OID),
        FieldDescription::text("active", BOOL_OID),
        FieldDescription::text("level", INT4_OID),
        FieldDescription::text("created_at", TEXT_OID),
    ]
}

/// The row-description a Describe of this verb's result set would carry.
pub fn fields_for_verb(verb: AdminVerb) -> Vec<FieldDescription> {
    match verb {
        AdminVerb::Begin | AdminVerb::Rollback => {
            vec![FieldDescription::text("?column?", INT4_OID)]
        }
        AdminVerb::Status | AdminVerb::List => status_fields(),
        AdminVerb::Cleanup => vec![FieldDescription::text("cleaned", INT4_OID)],
    }
}

fn status_row(status: &crate::proxy::registry::SessionStatus) -> Vec<Option<Vec<u8>>> {
    vec![
        Some(status.test_id.clone().into_bytes()),
        Some(if status.active { b"t".to_vec() } else { b"f".to_vec() }),
        Some(status.level.to_string().into_bytes()),
        Some(status.created_at.clone().into_bytes()),
    ]
}

/// Executes an admin verb for the issuing session's test id.
pub async fn run_admin(
    registry: &Arc<SessionRegistry>,
    test_id: &str,
    verb: AdminVerb,
) -> Result<SynthesizedResultSet, RegistryError> {
    match verb {
        AdminVerb::Begin => {
            registry.get_or_create(test_id).await?;
            Ok(int_result(1))
        }
        AdminVerb::Rollback => {
            registry.rollback_base(test_id).await?;
            Ok(int_result(1))
        }
        AdminVerb::Status => {
            let statuses = registry.statuses().await;
            let row = statuses
                .iter()
                .find(|status| status.test_id == test_id)
                .ok_or_else(|| RegistryError::NotFound(test_id.to_string()))?;
            Ok(SynthesizedResultSet {
                fields: status_fields(),
                rows: vec![status_row(row)],
                tag: "SELECT 1".to_string(),
            })
        }
        AdminVerb::List => {
            let statuses = registry.statuses().await;
            let rows: Vec<_> = statuses.iter().map(status_row).collect();
            let tag = format!("SELECT {}", rows.len());
            Ok(SynthesizedResultSet {
                fields: status_fields(),
                rows,
                tag,
            })
        }
        AdminVerb::Cleanup => {
            let cleaned = registry.cleanup_expired().await;
            Ok(SynthesizedResultSet {
                fields: vec![FieldDescription::text("cleaned", INT4_OID)],
                rows: vec![vec![Some(cleaned.to_string().into_bytes())]],
                tag: "SELECT 1".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_verbs_case_insensitively() {
        assert_eq!(
            parse_admin_command("pgrollback rollback"),
            Some(Ok(AdminVerb::Rollback))
        );
        assert_eq!(
            parse_admin_command("PGROLLBACK STATUS"),
            Some(Ok(AdminVerb::Status))
        );
        assert_eq!(
            parse_admin_command("  pgrollback list ;"),
            Some(Ok(AdminVerb::List))
        );
        assert_eq!(
            parse_admin_command("pgrollback cleanup"),
            Some(Ok(AdminVerb::Cleanup))
        );
        assert_eq!(
            parse_admin_command("pgrollback begin"),
            Some(Ok(AdminVerb::Begin))
        );
    }

    #[test]
    fn legacy_synonym_is_accepted() {
        assert_eq!(
            parse_admin_command("pgtest rollback"),
            Some(Ok(AdminVerb::Rollback))
        );
    }

    #[test]
    fn ordinary_sql_is_not_an_admin_command() {
        assert_eq!(parse_admin_command("SELECT 1"), None);
        assert_eq!(parse_admin_command("BEGIN"), None);
        // Identifier prefix does not count.
        assert_eq!(parse_admin_command("pgrollback_stats"), None);
    }

    #[test]
    fn unknown_or_malformed_verbs_error() {
        assert!(matches!(parse_admin_command("pgrollback"), Some(Err(_))));
        assert!(matches!(
            parse_admin_command("pgrollback explode"),
            Some(Err(_))
        ));
        assert!(matches!(
            parse_admin_command("pgrollback status extra"),
            Some(Err(_))
        ));
    }

    #[test]
    fn int_result_is_a_single_text_one() {
        let result = int_result(1);
        assert_eq!(result.rows, vec![vec![Some(b"1".to_vec())]]);
        assert_eq!(result.fields[0].name, "?column?");
        assert_eq!(result.tag, "SELECT 1");
    }

    #[test]
    fn status_schema_matches_the_contract() {
        let names: Vec<_> = fields_for_verb(AdminVerb::Status)
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["test_id", "active", "level", "created_at"]);
        let cleanup = fields_for_verb(AdminVerb::Cleanup);
        assert_eq!(cleanup[0].name, "cleaned");
    }
}
