//! The execution guard: an inner savepoint around every data command so
//! a failed statement never aborts the base transaction. Without it, the
//! first application error would poison the session with "current
//! transaction is aborted" until rollback — exactly what the proxy
//! exists to prevent.

use tracing::warn;

use crate::protocol::messages::FieldDescription;
use crate::sql::{ClassifiedStatement, StatementKind};
use crate::upstream::{
    ExecuteOutcome, SimpleResult, StatementDescription, UpstreamConnection, UpstreamError,
};

/// The guard's savepoint. A fixed name is safe: the writer lock
/// serializes all upstream SQL, so guards never overlap.
pub const GUARD_SAVEPOINT: &str = "pgrollback_exec_guard";

/// Commands whose success consumes the guard: a rollback past it, or a
/// release of an older savepoint that merges the guard's scope away. The
/// final RELEASE must be skipped for these.
pub fn consumes_guard(stmt: &ClassifiedStatement) -> bool {
    matches!(
        stmt.kind,
        StatementKind::Rollback | StatementKind::RollbackToSavepoint | StatementKind::Release
    )
}

/// User SAVEPOINT must run on the base transaction directly: created
/// inside the guard it would vanish with the guard's RELEASE and later
/// ROLLBACK TO from any connection would fail.
pub fn runs_on_base(stmt: &ClassifiedStatement) -> bool {
    stmt.kind == StatementKind::Savepoint
}

async fn open(upstream: &mut UpstreamConnection) -> Result<(), UpstreamError> {
    upstream.exec(&format!("SAVEPOINT {GUARD_SAVEPOINT}")).await.map(|_| ())
}

async fn release(upstream: &mut UpstreamConnection) -> Result<(), UpstreamError> {
    upstream
        .exec(&format!("RELEASE SAVEPOINT {GUARD_SAVEPOINT}"))
        .await
        .map(|_| ())
}

/// Rolls the guard back after a failed command. Runs in the aborted
/// subtransaction state, which is the one place ROLLBACK TO is allowed.
async fn recover(upstream: &mut UpstreamConnection) -> Result<(), UpstreamError> {
    upstream
        .exec(&format!(
            "ROLLBACK TO SAVEPOINT {GUARD_SAVEPOINT}; RELEASE SAVEPOINT {GUARD_SAVEPOINT}"
        ))
        .await
        .map(|_| ())
}

/// Runs one simple-protocol statement under the guard. The original
/// backend error propagates unchanged; the guard rollback is internal.
pub async fn guarded_simple(
    upstream: &mut UpstreamConnection,
    stmt: &ClassifiedStatement,
) -> Result<Vec<SimpleResult>, UpstreamError> {
    if runs_on_base(stmt) {
        return upstream.query(&stmt.sql).await;
    }
    open(upstream).await?;
    match upstream.query(&stmt.sql).await {
        Ok(results) => {
            if !consumes_guard(stmt) {
                release(upstream).await?;
            }
            Ok(results)
        }
        Err(err) if !err.is_fatal() => {
            if let Err(recover_err) = recover(upstream).await {
                if recover_err.is_fatal() {
                    return Err(recover_err);
                }
                warn!(error = %recover_err, "guard recovery failed");
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Runs a TCL rewrite product. SAVEPOINT goes to the base transaction;
/// RELEASE and ROLLBACK TO run guarded with the guard consumed on
/// success (they roll back or merge past it).
pub async fn guarded_tcl(
    upstream: &mut UpstreamConnection,
    sql: &str,
) -> Result<(), UpstreamError> {
    let upper = sql.trim_start().to_ascii_uppercase();
    if upper.starts_with("SAVEPOINT ") {
        return upstream.exec(sql).await.map(|_| ());
    }
    open(upstream).await?;
    match upstream.exec(sql).await {
        Ok(_) => Ok(()),
        Err(err) if !err.is_fatal() => {
            if let Err(recover_err) = recover(upstream).await {
                if recover_err.is_fatal() {
                    return Err(recover_err);
                }
                warn!(error = %recover_err, "guard recovery failed");
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Forwards a Parse under the guard so a syntax error does not abort the
/// base transaction.
pub async fn guarded_parse(
    upstream: &mut UpstreamConnection,
    name: &str,
    sql: &str,
    parameter_types: &[u32],
) -> Result<(), UpstreamError> {
    open(upstream).await?;
    match upstream.extended_parse(name, sql, parameter_types).await {
        Ok(()) => release(upstream).await,
        Err(err) if !err.is_fatal() => {
            if let Err(recover_err) = recover(upstream).await {
                if recover_err.is_fatal() {
                    return Err(recover_err);
                }
                warn!(error = %recover_err, "guard recovery failed");
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Forwards a Bind under the guard.
pub async fn guarded_bind(
    upstream: &mut UpstreamConnection,
    portal: &str,
    statement: &str,
    param_formats: &[i16],
    params: &[Option<Vec<u8>>],
    result_formats: &[i16],
) -> Result<(), UpstreamError> {
    open(upstream).await?;
    match upstream
        .extended_bind(portal, statement, param_formats, params, result_formats)
        .await
    {
        Ok(()) => release(upstream).await,
        Err(err) if !err.is_fatal() => {
            if let Err(recover_err) = recover(upstream).await {
                if recover_err.is_fatal() {
                    return Err(recover_err);
                }
                warn!(error = %recover_err, "guard recovery failed");
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Executes a portal under the guard.
pub async fn guarded_execute(
    upstream: &mut UpstreamConnection,
    portal: &str,
    max_rows: i32,
) -> Result<ExecuteOutcome, UpstreamError> {
    open(upstream).await?;
    match upstream.extended_execute(portal, max_rows).await {
        Ok(outcome) => {
            release(upstream).await?;
            Ok(outcome)
        }
        Err(err) if !err.is_fatal() => {
            if let Err(recover_err) = recover(upstream).await {
                if recover_err.is_fatal() {
                    return Err(recover_err);
                }
                warn!(error = %recover_err, "guard recovery failed");
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Describes a statement under the guard, so an unexpected describe
/// error cannot leave the base transaction aborted.
pub async fn guarded_describe_statement(
    upstream: &mut UpstreamConnection,
    name: &str,
) -> Result<StatementDescription, UpstreamError> {
    open(upstream).await?;
    match upstream.extended_describe_statement(name).await {
        Ok(description) => {
            release(upstream).await?;
            Ok(description)
        }
        Err(err) if !err.is_fatal() => {
            if let Err(recover_err) = recover(upstream).await {
                if recover_err.is_fatal() {
                    return Err(recover_err);
                }
                warn!(error = %recover_err, "guard recovery failed");
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Describes a portal under the guard.
pub async fn guarded_describe_portal(
    upstream: &mut UpstreamConnection,
    name: &str,
) -> Result<Option<Vec<FieldDescription>>, UpstreamError> {
    open(upstream).await?;
    match upstream.extended_describe_portal(name).await {
        Ok(fields) => {
            release(upstream).await?;
            Ok(fields)
        }
        Err(err) if !err.is_fatal() => {
            if let Err(recover_err) = recover(upstream).await {
                if recover_err.is_fatal() {
                    return Err(recover_err);
                }
                warn!(error = %recover_err, "guard recovery failed");
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::classify;

    #[test]
    fn rollback_variants_consume_the_guard() {
        assert!(consumes_guard(&classify("ROLLBACK")));
        assert!(consumes_guard(&classify("ROLLBACK TO SAVEPOINT a")));
        assert!(consumes_guard(&classify("RELEASE SAVEPOINT a")));
        assert!(!consumes_guard(&classify("SELECT 1")));
        assert!(!consumes_guard(&classify("SAVEPOINT a")));
        assert!(!consumes_guard(&classify("INSERT INTO t VALUES (1)")));
    }

    #[test]
    fn user_savepoints_bypass_the_guard() {
        assert!(runs_on_base(&classify("SAVEPOINT a")));
        assert!(!runs_on_base(&classify("RELEASE SAVEPOINT a")));
        assert!(!runs_on_base(&classify("SELECT 1")));
    }
}
