//! Transaction-control rewriting.
//!
//! Client BEGIN/COMMIT/ROLLBACK never reach the backend as written:
//! BEGIN becomes a `pgrollback_v_*` savepoint, COMMIT releases it,
//! ROLLBACK rolls back to it, and the base transaction stays open
//! throughout. Planning is a pure function over the session state the
//! caller reads under the writer lock; the resulting effect is applied
//! only after the backend confirmed the rewritten SQL.

use crate::proxy::session::{savepoint_name, ConnId, SAVEPOINT_PREFIX};
use crate::sql::{ClassifiedStatement, StatementKind};

/// Session state the planner reads, captured under the writer lock.
#[derive(Debug, Clone, Copy)]
pub struct TclContext {
    pub savepoint_level: u32,
    pub claim: Option<ConnId>,
    pub conn: ConnId,
    /// How many user transactions this connection has open.
    pub conn_user_tx_count: u32,
}

/// What to mutate once the backend accepted the rewritten SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TclEffect {
    /// Savepoint confirmed: level += 1, claim for this connection,
    /// connection counter += 1.
    Begin,
    /// Release or rollback-to confirmed: level -= 1, connection counter
    /// -= 1, claim released when the counter reaches 0.
    Close,
    /// Passthrough of a user savepoint command: no proxy state changes.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TclPlan {
    /// Send this SQL to the backend; apply the effect on success.
    Execute { sql: String, effect: TclEffect },
    /// Nothing goes to the backend; reply success to the client.
    Synthesize,
    /// Precondition failed; surface as an ErrorResponse, no backend SQL.
    Reject { message: String },
}

/// Plans one transaction-control statement. Statements that are not TCL
/// must not be passed here.
pub fn plan_tcl(stmt: &ClassifiedStatement, ctx: &TclContext) -> TclPlan {
    match stmt.kind {
        StatementKind::Begin => plan_begin(ctx),
        StatementKind::Commit => plan_close(ctx, |name| format!("RELEASE SAVEPOINT {name}")),
        StatementKind::Rollback => plan_close(ctx, |name| {
            format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}")
        }),
        StatementKind::Savepoint | StatementKind::Release | StatementKind::RollbackToSavepoint => {
            plan_user_savepoint(stmt)
        }
        _ => TclPlan::Reject {
            message: format!("statement is not transaction control: {}", stmt.sql),
        },
    }
}

fn plan_begin(ctx: &TclContext) -> TclPlan {
    if ctx.claim_held_by_other() {
        return TclPlan::Reject {
            message: "only one connection may hold an open transaction per session".to_string(),
        };
    }
    // Nested BEGIN from the claim holder is absorbed without error.
    if ctx.savepoint_level >= 1 && ctx.claim == Some(ctx.conn) {
        return TclPlan::Synthesize;
    }
    TclPlan::Execute {
        sql: format!("SAVEPOINT {}", savepoint_name(ctx.savepoint_level + 1)),
        effect: TclEffect::Begin,
    }
}

fn plan_close(ctx: &TclContext, render: impl Fn(&str) -> String) -> TclPlan {
    // A connection with no open user transaction gets the same
    // warning-free success a real COMMIT outside a transaction gets.
    if ctx.conn_user_tx_count == 0 || ctx.savepoint_level == 0 {
        return TclPlan::Synthesize;
    }
    if ctx.claim != Some(ctx.conn) {
        return TclPlan::Synthesize;
    }
    TclPlan::Execute {
        sql: render(&savepoint_name(ctx.savepoint_level)),
        effect: TclEffect::Close,
    }
}

fn plan_user_savepoint(stmt: &ClassifiedStatement) -> TclPlan {
    if let Some(name) = &stmt.savepoint_name {
        if name.starts_with(SAVEPOINT_PREFIX) {
            return TclPlan::Reject {
                message: format!("savepoint name \"{name}\" is reserved by pgrollback"),
            };
        }
    }
    TclPlan::Execute {
        sql: stmt.sql.clone(),
        effect: TclEffect::None,
    }
}

impl TclContext {
    fn claim_held_by_other(&self) -> bool {
        matches!(self.claim, Some(holder) if holder != self.conn)
    }
}
