//! Prepared-statement and portal name virtualization.
//!
//! All client connections of one session share one upstream connection,
//! and clients routinely use colliding names (PDO's `pdo_stmt_00000001`,
//! the unnamed statement, ...). Each (connection, client name) pair maps
//! to a unique backend name so two connections never stomp on each
//! other's prepared state.

use std::collections::HashMap;

use crate::proxy::session::ConnId;

/// A statement the client prepared. Statements classified as transaction
/// control or proxy commands are held locally and have no backend name.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Name the statement was parsed under upstream; None for statements
    /// the proxy handles itself at Execute time.
    pub backend_name: Option<String>,
    pub sql: String,
    pub parameter_types: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Portal {
    /// Backend portal name; None when the bound statement is local.
    pub backend_name: Option<String>,
    pub statement_sql: String,
    pub params: Vec<Option<Vec<u8>>>,
    pub param_formats: Vec<i16>,
    pub result_formats: Vec<i16>,
}

#[derive(Debug, Default)]
pub struct StatementRegistry {
    counter: u64,
    statements: HashMap<(ConnId, String), PreparedStatement>,
    portals: HashMap<(ConnId, String), Portal>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_statement_name(&mut self, conn: ConnId) -> String {
        self.counter += 1;
        format!("pgr_s_{conn}_{}", self.counter)
    }

    pub fn next_portal_name(&mut self, conn: ConnId) -> String {
        self.counter += 1;
        format!("pgr_p_{conn}_{}", self.counter)
    }

    /// Stores a statement under the client-visible name, returning the
    /// replaced entry if the client reused the name (the unnamed
    /// statement does this constantly).
    pub fn insert_statement(
        &mut self,
        conn: ConnId,
        client_name: &str,
        statement: PreparedStatement,
    ) -> Option<PreparedStatement> {
        self.statements
            .insert((conn, client_name.to_string()), statement)
    }

    pub fn statement(&self, conn: ConnId, client_name: &str) -> Option<&PreparedStatement> {
        self.statements.get(&(conn, client_name.to_string()))
    }

    pub fn remove_statement(
        &mut self,
        conn: ConnId,
        client_name: &str,
    ) -> Option<PreparedStatement> {
        self.statements.remove(&(conn, client_name.to_string()))
    }

    pub fn insert_portal(&mut self, conn: ConnId, client_name: &str, portal: Portal) -> Option<Portal> {
        self.portals.insert((conn, client_name.to_string()), portal)
    }

    pub fn portal(&self, conn: ConnId, client_name: &str) -> Option<&Portal> {
        self.portals.get(&(conn, client_name.to_string()))
    }

    pub fn remove_portal(&mut self, conn: ConnId, client_name: &str) -> Option<Portal> {
        self.portals.remove(&(conn, client_name.to_string()))
    }

    /// Backend names of every statement this connection still has
    /// prepared, for connection-scoped DEALLOCATE ALL.
    pub fn backend_statement_names(&self, conn: ConnId) -> Vec<String> {
        let mut names: Vec<String> = self
            .statements
            .iter()
            .filter(|((owner, _), _)| *owner == conn)
            .filter_map(|(_, stmt)| stmt.backend_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Removes every entry the connection owns, returning the backend
    /// statement names that should be closed upstream.
    pub fn drain_connection(&mut self, conn: ConnId) -> Vec<String> {
        let names = self.backend_statement_names(conn);
        self.statements.retain(|(owner, _), _| *owner != conn);
        self.portals.retain(|(owner, _), _| *owner != conn);
        names
    }

    /// Removes only the connection's statements, for DEALLOCATE ALL.
    pub fn clear_connection_statements(&mut self, conn: ConnId) -> Vec<String> {
        let names = self.backend_statement_names(conn);
        self.statements.retain(|(owner, _), _| *owner != conn);
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarded(registry: &mut StatementRegistry, conn: ConnId, sql: &str) -> PreparedStatement {
        let backend = registry.next_statement_name(conn);
        PreparedStatement {
            backend_name: Some(backend),
            sql: sql.to_string(),
            parameter_types: Vec::new(),
        }
    }

    #[test]
    fn colliding_client_names_map_to_distinct_backend_names() {
        let mut registry = StatementRegistry::new();
        let stmt_a = forwarded(&mut registry, 1, "SELECT $1::int");
        let stmt_b = forwarded(&mut registry, 2, "SELECT 42");
        registry.insert_statement(1, "s1", stmt_a);
        registry.insert_statement(2, "s1", stmt_b);

        let a = registry.statement(1, "s1").expect("conn 1 statement");
        let b = registry.statement(2, "s1").expect("conn 2 statement");
        assert_ne!(a.backend_name, b.backend_name);
        assert_eq!(a.sql, "SELECT $1::int");
        assert_eq!(b.sql, "SELECT 42");
    }

    #[test]
    fn removal_is_scoped_to_the_owning_connection() {
        let mut registry = StatementRegistry::new();
        let stmt_a = forwarded(&mut registry, 1, "SELECT 1");
        let stmt_b = forwarded(&mut registry, 2, "SELECT 2");
        registry.insert_statement(1, "shared", stmt_a);
        registry.insert_statement(2, "shared", stmt_b);

        assert!(registry.remove_statement(1, "shared").is_some());
        assert!(registry.statement(1, "shared").is_none());
        assert!(registry.statement(2, "shared").is_some());
    }

    #[test]
    fn reusing_a_name_returns_the_replaced_entry() {
        let mut registry = StatementRegistry::new();
        let first = forwarded(&mut registry, 1, "SELECT 1");
        let first_backend = first.backend_name.clone();
        registry.insert_statement(1, "", first);
        let second = forwarded(&mut registry, 1, "SELECT 2");
        let replaced = registry.insert_statement(1, "", second);
        assert_eq!(replaced.and_then(|s| s.backend_name), first_backend);
    }

    #[test]
    fn drain_returns_only_forwarded_statements() {
        let mut registry = StatementRegistry::new();
        let stmt = forwarded(&mut registry, 1, "SELECT 1");
        registry.insert_statement(1, "a", stmt);
        registry.insert_statement(
            1,
            "b",
            PreparedStatement {
                backend_name: None,
                sql: "BEGIN".to_string(),
                parameter_types: Vec::new(),
            },
        );
        registry.insert_portal(
            1,
            "",
            Portal {
                backend_name: None,
                statement_sql: "BEGIN".to_string(),
                params: Vec::new(),
                param_formats: Vec::new(),
                result_formats: Vec::new(),
            },
        );
        let other = forwarded(&mut registry, 2, "SELECT 2");
        registry.insert_statement(2, "a", other);

        let drained = registry.drain_connection(1);
        assert_eq!(drained.len(), 1);
        assert!(registry.statement(1, "a").is_none());
        assert!(registry.portal(1, "").is_none());
        assert!(registry.statement(2, "a").is_some());
    }

    #[test]
    fn deallocate_all_keeps_portals() {
        let mut registry = StatementRegistry::new();
        let stmt = forwarded(&mut registry, 1, "SELECT 1");
        registry.insert_statement(1, "a", stmt);
        registry.insert_portal(
            1,
            "p",
            Portal {
                backend_name: Some("pgr_p_1_9".to_string()),
                statement_sql: "SELECT 1".to_string(),
                params: Vec::new(),
                param_formats: Vec::new(),
                result_formats: Vec::new(),
            },
        );
        let cleared = registry.clear_connection_statements(1);
        assert_eq!(cleared.len(), 1);
        assert!(registry.portal(1, "p").is_some());
    }
}
