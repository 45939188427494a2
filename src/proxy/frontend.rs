//! The per-connection protocol engine: one client TCP connection,
//! terminated by the proxy. Handshake first (SSL probe, startup,
//! cleartext-password theater, session acquisition), then the message
//! loop dispatching the simple and extended query sub-protocols.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::protocol::messages::{
    decode_frontend_message, encode_backend_message, BackendMessage, FieldDescription,
    FrontendMessage, TransactionStatus,
};
use crate::protocol::startup::{decode_startup_action, StartupAction, StartupPacket};
use crate::proxy::commands::{self, AdminVerb};
use crate::proxy::guard;
use crate::proxy::registry::SessionRegistry;
use crate::proxy::rewriter::{plan_tcl, TclContext, TclEffect, TclPlan};
use crate::proxy::session::{ConnId, Session};
use crate::proxy::statements::{Portal, PreparedStatement};
use crate::sql::classifier::TEXT_OID;
use crate::sql::{
    classify, parse_statements, returning_columns, substitute_params, BindValue,
    ClassifiedStatement, DeallocateTarget, StatementKind,
};
use crate::upstream::{PgErrorInfo, SimpleResult, UpstreamError};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Hard cap on a single frontend message; anything bigger is a framing
/// error, not a query.
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Serves one accepted client connection to completion.
pub async fn serve(stream: TcpStream, registry: Arc<SessionRegistry>) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    if let Err(err) = run(stream, registry, conn_id).await {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            debug!(conn_id, "client disconnected");
        } else {
            warn!(conn_id, error = %err, "client connection ended with error");
        }
    }
}

async fn run(
    mut stream: TcpStream,
    registry: Arc<SessionRegistry>,
    conn_id: ConnId,
) -> io::Result<()> {
    let Some(packet) = handshake_startup(&mut stream).await? else {
        return Ok(());
    };
    let test_id = packet.test_id();
    info!(conn_id, test_id = %test_id, "client connected");

    // Authentication theater: always request a password and accept
    // whatever comes back, so every client walks the same path whether
    // its session is new or reused.
    send_message(
        &mut stream,
        &BackendMessage::AuthenticationCleartextPassword,
    )
    .await?;
    match read_frontend_message(&mut stream).await? {
        Some(FrontendMessage::Password { .. }) => {}
        Some(FrontendMessage::Terminate) | None => return Ok(()),
        Some(other) => {
            warn!(conn_id, "expected password message, got {other:?}");
            return Ok(());
        }
    }

    let session = match registry.get_or_create(&test_id).await {
        Ok(session) => session,
        Err(err) => {
            send_message(&mut stream, &BackendMessage::error("XX000", err.to_string())).await?;
            return Ok(());
        }
    };

    send_initial_protocol_messages(&mut stream, &session).await?;

    let mut connection = FrontendConnection {
        stream,
        conn_id,
        registry,
        session,
        test_id,
        user_tx_count: 0,
        skip_until_sync: false,
    };
    let result = connection.message_loop().await;
    connection.disconnect_cleanup().await;
    result
}

/// Reads length-prefixed startup packets until a real StartupMessage
/// arrives. SSL requests get the single-byte "no SSL" answer; cancel
/// requests close the socket (there is no mid-query cancellation).
async fn handshake_startup(stream: &mut TcpStream) -> io::Result<Option<StartupPacket>> {
    loop {
        let Some(packet) = read_length_prefixed(stream).await? else {
            return Ok(None);
        };
        match decode_startup_action(&packet) {
            Ok(StartupAction::SslRequest) => {
                stream.write_all(b"N").await?;
            }
            Ok(StartupAction::CancelRequest { .. }) => return Ok(None),
            Ok(StartupAction::Startup(packet)) => return Ok(Some(packet)),
            Err(err) => {
                send_message(stream, &BackendMessage::error("08P01", err.message)).await?;
                return Ok(None);
            }
        }
    }
}

async fn read_length_prefixed(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if !(8..=MAX_MESSAGE_LEN).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "startup packet length is invalid",
        ));
    }
    let mut packet = vec![0u8; len];
    packet[..4].copy_from_slice(&len_buf);
    stream.read_exact(&mut packet[4..]).await?;
    Ok(Some(packet))
}

async fn read_frontend_message(stream: &mut TcpStream) -> io::Result<Option<FrontendMessage>> {
    let mut tag_buf = [0u8; 1];
    match stream.read_exact(&mut tag_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if !(4..=MAX_MESSAGE_LEN).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frontend message length is invalid",
        ));
    }
    let mut payload = vec![0u8; len - 4];
    stream.read_exact(&mut payload).await?;
    decode_frontend_message(tag_buf[0], &payload)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.message))
}

async fn send_message(stream: &mut TcpStream, message: &BackendMessage) -> io::Result<()> {
    stream.write_all(&encode_backend_message(message)).await
}

/// Replays the upstream's ParameterStatus list (or a minimal default
/// set) plus a fabricated BackendKeyData, then ReadyForQuery.
async fn send_initial_protocol_messages(
    stream: &mut TcpStream,
    session: &Arc<Session>,
) -> io::Result<()> {
    let (statuses, backend_key) = {
        let core = session.lock().await;
        (
            core.upstream.parameter_statuses().to_vec(),
            core.upstream.backend_key(),
        )
    };
    let mut buf = Vec::new();
    buf.extend_from_slice(&encode_backend_message(&BackendMessage::AuthenticationOk));
    if statuses.is_empty() {
        for (name, value) in [
            ("server_version", "14.0"),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO"),
        ] {
            buf.extend_from_slice(&encode_backend_message(&BackendMessage::ParameterStatus {
                name: name.to_string(),
                value: value.to_string(),
            }));
        }
    } else {
        for (name, value) in statuses {
            buf.extend_from_slice(&encode_backend_message(&BackendMessage::ParameterStatus {
                name,
                value,
            }));
        }
    }
    // Replay the upstream's key data when known; clients only use it for
    // CancelRequest, which the proxy ignores anyway.
    let (process_id, secret_key) = if backend_key == (0, 0) {
        (OsRng.next_u32(), OsRng.next_u32())
    } else {
        backend_key
    };
    buf.extend_from_slice(&encode_backend_message(&BackendMessage::BackendKeyData {
        process_id,
        secret_key,
    }));
    buf.extend_from_slice(&encode_backend_message(&BackendMessage::ReadyForQuery {
        status: TransactionStatus::Idle,
    }));
    stream.write_all(&buf).await
}

struct FrontendConnection {
    stream: TcpStream,
    conn_id: ConnId,
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    test_id: String,
    /// User-opened transactions on this connection that have not been
    /// closed by COMMIT/ROLLBACK. Drives the ReadyForQuery status byte.
    user_tx_count: u32,
    /// Extended-protocol error recovery: after an ErrorResponse, incoming
    /// extended messages are discarded until the client's Sync.
    skip_until_sync: bool,
}

enum SqlFailure {
    /// Backend error, forwarded verbatim. The guard already restored the
    /// base transaction.
    Db(PgErrorInfo),
    /// Synthesized precondition error, SQLSTATE XX000.
    Rejected(String),
}

impl FrontendConnection {
    async fn message_loop(&mut self) -> io::Result<()> {
        loop {
            let Some(message) = read_frontend_message(&mut self.stream).await? else {
                return Ok(());
            };
            match message {
                FrontendMessage::Query { sql } => {
                    self.skip_until_sync = false;
                    self.handle_simple_query(&sql).await?;
                }
                FrontendMessage::Parse {
                    statement_name,
                    query,
                    parameter_types,
                } => {
                    if !self.skip_until_sync {
                        self.handle_parse(&statement_name, &query, parameter_types)
                            .await?;
                    }
                }
                FrontendMessage::Bind {
                    portal_name,
                    statement_name,
                    param_formats,
                    params,
                    result_formats,
                } => {
                    if !self.skip_until_sync {
                        self.handle_bind(
                            &portal_name,
                            &statement_name,
                            param_formats,
                            params,
                            result_formats,
                        )
                        .await?;
                    }
                }
                FrontendMessage::Execute {
                    portal_name,
                    max_rows,
                } => {
                    if !self.skip_until_sync {
                        self.handle_execute(&portal_name, max_rows).await?;
                    }
                }
                FrontendMessage::DescribeStatement { statement_name } => {
                    if !self.skip_until_sync {
                        self.handle_describe_statement(&statement_name).await?;
                    }
                }
                FrontendMessage::DescribePortal { portal_name } => {
                    if !self.skip_until_sync {
                        self.handle_describe_portal(&portal_name).await?;
                    }
                }
                FrontendMessage::CloseStatement { statement_name } => {
                    if !self.skip_until_sync {
                        self.handle_close(b'S', &statement_name).await?;
                    }
                }
                FrontendMessage::ClosePortal { portal_name } => {
                    if !self.skip_until_sync {
                        self.handle_close(b'P', &portal_name).await?;
                    }
                }
                FrontendMessage::Sync => {
                    self.skip_until_sync = false;
                    self.send_ready().await?;
                }
                FrontendMessage::Flush => {
                    self.stream.flush().await?;
                }
                FrontendMessage::Password { .. } => {}
                FrontendMessage::Terminate => return Ok(()),
            }
        }
    }

    fn tx_status(&self) -> TransactionStatus {
        if self.user_tx_count > 0 {
            TransactionStatus::InTransaction
        } else {
            TransactionStatus::Idle
        }
    }

    async fn send(&mut self, message: &BackendMessage) -> io::Result<()> {
        send_message(&mut self.stream, message).await
    }

    async fn send_ready(&mut self) -> io::Result<()> {
        let status = self.tx_status();
        self.send(&BackendMessage::ReadyForQuery { status }).await
    }

    async fn send_db_error(&mut self, info: &PgErrorInfo) -> io::Result<()> {
        self.send(&BackendMessage::ErrorResponse {
            severity: info.severity.clone(),
            code: info.code.clone(),
            message: info.message.clone(),
            detail: info.detail.clone(),
            hint: info.hint.clone(),
            position: info.position,
        })
        .await
    }

    /// A fatal upstream error kills the session: evict so the next
    /// request for this test id gets a fresh one, tell the client, and
    /// abandon this connection.
    async fn fail_fatal(&mut self, err: UpstreamError) -> io::Error {
        warn!(conn_id = self.conn_id, test_id = %self.test_id, error = %err, "fatal upstream error");
        self.session.mark_poisoned();
        self.registry.evict(&self.test_id).await;
        let _ = self
            .send(&BackendMessage::error(
                "08006",
                format!("upstream connection failed: {err}"),
            ))
            .await;
        io::Error::other("upstream connection failed")
    }

    // --- Simple query ------------------------------------------------

    async fn handle_simple_query(&mut self, sql: &str) -> io::Result<()> {
        if sql.trim().is_empty() {
            self.send(&BackendMessage::EmptyQueryResponse).await?;
            return self.send_ready().await;
        }

        if let Some(parsed) = commands::parse_admin_command(sql) {
            return self.handle_admin_simple(parsed).await;
        }

        let statements = parse_statements(sql);
        if statements.is_empty() {
            self.send(&BackendMessage::EmptyQueryResponse).await?;
            return self.send_ready().await;
        }

        let mut last_with_rows: Option<SimpleResult> = None;
        let mut last_any: Option<SimpleResult> = None;
        let mut failure: Option<SqlFailure> = None;

        for stmt in &statements {
            if stmt.kind.is_transaction_control() {
                match self.run_tcl(stmt).await? {
                    Ok(()) => {
                        let tag = stmt.command_tag();
                        self.send(&BackendMessage::CommandComplete { tag }).await?;
                    }
                    Err(fail) => {
                        failure = Some(fail);
                        break;
                    }
                }
                continue;
            }
            if stmt.kind == StatementKind::Deallocate {
                match self.run_deallocate(stmt).await? {
                    Ok(()) => {
                        let tag = stmt.command_tag();
                        self.send(&BackendMessage::CommandComplete { tag }).await?;
                    }
                    Err(fail) => {
                        failure = Some(fail);
                        break;
                    }
                }
                continue;
            }

            match self.run_data_statement(stmt).await? {
                Ok(results) => {
                    for result in results {
                        if result.fields.is_empty() {
                            let tag = if result.tag.is_empty() {
                                stmt.command_tag()
                            } else {
                                result.tag.clone()
                            };
                            self.send(&BackendMessage::CommandComplete { tag }).await?;
                        } else {
                            if !result.rows.is_empty() {
                                last_with_rows = Some(result.clone());
                            }
                            last_any = Some(result);
                        }
                    }
                }
                Err(fail) => {
                    failure = Some(fail);
                    break;
                }
            }
        }

        // Multi-statement strings relay only the last non-empty result
        // set; a zero-row result set still answers a lone SELECT.
        if let Some(result) = last_with_rows.or(last_any) {
            self.send_result_set(&result).await?;
        }
        match failure {
            Some(SqlFailure::Db(info)) => self.send_db_error(&info).await?,
            Some(SqlFailure::Rejected(message)) => {
                self.send(&BackendMessage::error("XX000", message)).await?;
            }
            None => {}
        }
        self.send_ready().await
    }

    async fn send_result_set(&mut self, result: &SimpleResult) -> io::Result<()> {
        self.send(&BackendMessage::RowDescription {
            fields: result.fields.clone(),
        })
        .await?;
        for row in &result.rows {
            self.send(&BackendMessage::DataRow { values: row.clone() }).await?;
        }
        let tag = if result.tag.is_empty() {
            format!("SELECT {}", result.rows.len())
        } else {
            result.tag.clone()
        };
        self.send(&BackendMessage::CommandComplete { tag }).await
    }

    async fn handle_admin_simple(
        &mut self,
        parsed: Result<AdminVerb, String>,
    ) -> io::Result<()> {
        match parsed {
            Ok(verb) => {
                match commands::run_admin(&self.registry, &self.test_id, verb).await {
                    Ok(result) => {
                        if verb == AdminVerb::Rollback {
                            // Session state was reset wholesale; this
                            // connection's transactions are gone with it.
                            self.user_tx_count = 0;
                        }
                        self.send(&BackendMessage::RowDescription {
                            fields: result.fields.clone(),
                        })
                        .await?;
                        for row in &result.rows {
                            self.send(&BackendMessage::DataRow { values: row.clone() })
                                .await?;
                        }
                        self.send(&BackendMessage::CommandComplete {
                            tag: result.tag.clone(),
                        })
                        .await?;
                    }
                    Err(err) => {
                        self.send(&BackendMessage::error("XX000", err.to_string()))
                            .await?;
                    }
                }
            }
            Err(message) => {
                self.send(&BackendMessage::error("XX000", message)).await?;
            }
        }
        self.send_ready().await
    }

    /// Plans and executes one transaction-control statement under the
    /// writer lock, applying state effects only after the backend
    /// confirmed the rewritten SQL.
    async fn run_tcl(
        &mut self,
        stmt: &ClassifiedStatement,
    ) -> io::Result<Result<(), SqlFailure>> {
        let session = self.session.clone();
        let mut core = session.lock().await;

        // Safety net: a session can outlive its base transaction only if
        // something reset it; BEGIN restores it before claiming.
        if stmt.kind == StatementKind::Begin && !core.upstream.has_base_tx() {
            if let Err(err) = core.upstream.begin_base_tx().await {
                drop(core);
                if err.is_fatal() {
                    return Err(self.fail_fatal(err).await);
                }
                return Ok(Err(SqlFailure::Rejected(err.to_string())));
            }
        }

        let plan = plan_tcl(
            stmt,
            &TclContext {
                savepoint_level: core.savepoint_level,
                claim: core.claim,
                conn: self.conn_id,
                conn_user_tx_count: self.user_tx_count,
            },
        );
        match plan {
            TclPlan::Synthesize => {
                // A full-session reset may have dissolved this
                // connection's transactions; reconcile the counter so
                // the status byte returns to idle.
                if matches!(stmt.kind, StatementKind::Commit | StatementKind::Rollback)
                    && core.savepoint_level == 0
                {
                    self.user_tx_count = 0;
                    core.release_open_transaction(self.conn_id);
                }
                Ok(Ok(()))
            }
            TclPlan::Reject { message } => Ok(Err(SqlFailure::Rejected(message))),
            TclPlan::Execute { sql, effect } => {
                let started = Instant::now();
                core.history.record(&stmt.sql);
                match guard::guarded_tcl(&mut core.upstream, &sql).await {
                    Ok(()) => {
                        core.history.finish_last(started.elapsed());
                        match effect {
                            TclEffect::Begin => {
                                core.increment_savepoint_level();
                                core.claim_open_transaction(self.conn_id);
                                self.user_tx_count += 1;
                            }
                            TclEffect::Close => {
                                core.decrement_savepoint_level();
                                self.user_tx_count = self.user_tx_count.saturating_sub(1);
                                if self.user_tx_count == 0 {
                                    core.release_open_transaction(self.conn_id);
                                }
                            }
                            TclEffect::None => {}
                        }
                        Ok(Ok(()))
                    }
                    Err(err) => {
                        drop(core);
                        self.sql_error(err).await
                    }
                }
            }
        }
    }

    /// DEALLOCATE is scoped to the issuing connection: its own entries
    /// resolve to backend names, anything else is forwarded untouched so
    /// the backend's SQLSTATE 26000 comes back verbatim.
    async fn run_deallocate(
        &mut self,
        stmt: &ClassifiedStatement,
    ) -> io::Result<Result<(), SqlFailure>> {
        let session = self.session.clone();
        let mut core = session.lock().await;
        match &stmt.deallocate {
            Some(DeallocateTarget::Name(name)) => {
                let removed = core.statements.remove_statement(self.conn_id, name);
                match removed.and_then(|entry| entry.backend_name) {
                    Some(backend_name) => {
                        let rewritten = classify(&format!("DEALLOCATE {backend_name}"));
                        match guard::guarded_simple(&mut core.upstream, &rewritten).await {
                            Ok(_) => Ok(Ok(())),
                            Err(err) => {
                                drop(core);
                                self.sql_error(err).await
                            }
                        }
                    }
                    None => match guard::guarded_simple(&mut core.upstream, stmt).await {
                        Ok(_) => Ok(Ok(())),
                        Err(err) => {
                            drop(core);
                            self.sql_error(err).await
                        }
                    },
                }
            }
            Some(DeallocateTarget::All) => {
                let names = core.statements.clear_connection_statements(self.conn_id);
                for backend_name in names {
                    let rewritten = classify(&format!("DEALLOCATE {backend_name}"));
                    if let Err(err) = guard::guarded_simple(&mut core.upstream, &rewritten).await
                    {
                        if err.is_fatal() {
                            drop(core);
                            return Err(self.fail_fatal(err).await);
                        }
                        warn!(conn_id = self.conn_id, error = %err, "deallocate all entry failed");
                    }
                }
                Ok(Ok(()))
            }
            None => match guard::guarded_simple(&mut core.upstream, stmt).await {
                Ok(_) => Ok(Ok(())),
                Err(err) => {
                    drop(core);
                    self.sql_error(err).await
                }
            },
        }
    }

    async fn run_data_statement(
        &mut self,
        stmt: &ClassifiedStatement,
    ) -> io::Result<Result<Vec<SimpleResult>, SqlFailure>> {
        let session = self.session.clone();
        let mut core = session.lock().await;
        let started = Instant::now();
        core.history.record(&stmt.sql);
        match guard::guarded_simple(&mut core.upstream, stmt).await {
            Ok(results) => {
                core.history.finish_last(started.elapsed());
                Ok(Ok(results))
            }
            Err(err) => {
                core.history.finish_last(started.elapsed());
                drop(core);
                self.sql_error(err).await
            }
        }
    }

    /// Splits an upstream failure into the forwardable kind and the
    /// fatal kind. Must be called with the writer lock released.
    async fn sql_error<T>(&mut self, err: UpstreamError) -> io::Result<Result<T, SqlFailure>> {
        match err {
            UpstreamError::Db(info) => Ok(Err(SqlFailure::Db(info))),
            other if other.is_fatal() => Err(self.fail_fatal(other).await),
            other => Ok(Err(SqlFailure::Rejected(other.to_string()))),
        }
    }

    // --- Extended query ----------------------------------------------

    async fn handle_parse(
        &mut self,
        client_name: &str,
        sql: &str,
        parameter_types: Vec<u32>,
    ) -> io::Result<()> {
        let stmt = classify(sql);
        let local = stmt.kind.is_transaction_control()
            || commands::parse_admin_command(sql).is_some();

        if local {
            let session = self.session.clone();
            let mut core = session.lock().await;
            core.statements.insert_statement(
                self.conn_id,
                client_name,
                PreparedStatement {
                    backend_name: None,
                    sql: sql.to_string(),
                    parameter_types,
                },
            );
            drop(core);
            return self.send(&BackendMessage::ParseComplete).await;
        }

        let session = self.session.clone();
        let mut core = session.lock().await;
        let backend_name = core.statements.next_statement_name(self.conn_id);
        match guard::guarded_parse(&mut core.upstream, &backend_name, sql, &parameter_types).await
        {
            Ok(()) => {
                let replaced = core.statements.insert_statement(
                    self.conn_id,
                    client_name,
                    PreparedStatement {
                        backend_name: Some(backend_name),
                        sql: sql.to_string(),
                        parameter_types,
                    },
                );
                if let Some(old_backend) = replaced.and_then(|entry| entry.backend_name) {
                    if let Err(err) = core.upstream.extended_close(b'S', &old_backend).await {
                        if err.is_fatal() {
                            drop(core);
                            return Err(self.fail_fatal(err).await);
                        }
                        debug!(error = %err, "closing replaced statement failed");
                    }
                }
                drop(core);
                self.send(&BackendMessage::ParseComplete).await
            }
            Err(err) => {
                drop(core);
                self.extended_error(err).await
            }
        }
    }

    async fn handle_bind(
        &mut self,
        client_portal: &str,
        client_statement: &str,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    ) -> io::Result<()> {
        let session = self.session.clone();
        let mut core = session.lock().await;
        let Some(entry) = core.statements.statement(self.conn_id, client_statement) else {
            drop(core);
            return self
                .extended_error(UpstreamError::Db(PgErrorInfo {
                    severity: "ERROR".to_string(),
                    code: "26000".to_string(),
                    message: format!(
                        "prepared statement \"{client_statement}\" does not exist"
                    ),
                    detail: None,
                    hint: None,
                    position: None,
                }))
                .await;
        };
        let statement_sql = entry.sql.clone();
        let backend_statement = entry.backend_name.clone();

        match backend_statement {
            None => {
                core.statements.insert_portal(
                    self.conn_id,
                    client_portal,
                    Portal {
                        backend_name: None,
                        statement_sql,
                        params,
                        param_formats,
                        result_formats,
                    },
                );
                drop(core);
                self.send(&BackendMessage::BindComplete).await
            }
            Some(backend_statement) => {
                let backend_portal = core.statements.next_portal_name(self.conn_id);
                match guard::guarded_bind(
                    &mut core.upstream,
                    &backend_portal,
                    &backend_statement,
                    &param_formats,
                    &params,
                    &result_formats,
                )
                .await
                {
                    Ok(()) => {
                        core.statements.insert_portal(
                            self.conn_id,
                            client_portal,
                            Portal {
                                backend_name: Some(backend_portal),
                                statement_sql,
                                params,
                                param_formats,
                                result_formats,
                            },
                        );
                        drop(core);
                        self.send(&BackendMessage::BindComplete).await
                    }
                    Err(err) => {
                        drop(core);
                        self.extended_error(err).await
                    }
                }
            }
        }
    }

    async fn handle_execute(&mut self, client_portal: &str, max_rows: i32) -> io::Result<()> {
        let portal = {
            let core = self.session.lock().await;
            core.statements.portal(self.conn_id, client_portal).cloned()
        };
        let Some(portal) = portal else {
            return self
                .extended_error(UpstreamError::Db(PgErrorInfo {
                    severity: "ERROR".to_string(),
                    code: "34000".to_string(),
                    message: format!("portal \"{client_portal}\" does not exist"),
                    detail: None,
                    hint: None,
                    position: None,
                }))
                .await;
        };

        let stmt = classify(&portal.statement_sql);

        if let Some(parsed) = commands::parse_admin_command(&portal.statement_sql) {
            return self.execute_admin_portal(parsed).await;
        }

        if stmt.kind.is_transaction_control() {
            return match self.run_tcl(&stmt).await? {
                Ok(()) => {
                    let tag = stmt.command_tag();
                    self.send(&BackendMessage::CommandComplete { tag }).await
                }
                Err(SqlFailure::Db(info)) => {
                    self.skip_until_sync = true;
                    self.send_db_error(&info).await
                }
                Err(SqlFailure::Rejected(message)) => {
                    self.skip_until_sync = true;
                    self.send(&BackendMessage::error("XX000", message)).await
                }
            };
        }

        let Some(backend_portal) = portal.backend_name.clone() else {
            // A local portal with a non-TCL statement cannot happen; treat
            // as an unknown portal rather than guessing.
            return self
                .extended_error(UpstreamError::Db(PgErrorInfo {
                    severity: "ERROR".to_string(),
                    code: "34000".to_string(),
                    message: format!("portal \"{client_portal}\" does not exist"),
                    detail: None,
                    hint: None,
                    position: None,
                }))
                .await;
        };

        let session = self.session.clone();
        let mut core = session.lock().await;
        let started = Instant::now();
        let substituted = substitute_params(
            &portal.statement_sql,
            &wire_bind_values(&portal.params, &portal.param_formats),
        );
        core.history.record(&substituted);
        match guard::guarded_execute(&mut core.upstream, &backend_portal, max_rows).await {
            Ok(outcome) => {
                core.history.finish_last(started.elapsed());
                drop(core);
                for row in &outcome.rows {
                    self.send(&BackendMessage::DataRow { values: row.clone() }).await?;
                }
                if outcome.suspended {
                    self.send(&BackendMessage::PortalSuspended).await
                } else {
                    let tag = outcome.tag.unwrap_or_else(|| stmt.command_tag());
                    self.send(&BackendMessage::CommandComplete { tag }).await
                }
            }
            Err(err) => {
                core.history.finish_last(started.elapsed());
                drop(core);
                self.extended_error(err).await
            }
        }
    }

    async fn execute_admin_portal(
        &mut self,
        parsed: Result<AdminVerb, String>,
    ) -> io::Result<()> {
        match parsed {
            Ok(verb) => match commands::run_admin(&self.registry, &self.test_id, verb).await {
                Ok(result) => {
                    if verb == AdminVerb::Rollback {
                        self.user_tx_count = 0;
                    }
                    for row in &result.rows {
                        self.send(&BackendMessage::DataRow { values: row.clone() }).await?;
                    }
                    self.send(&BackendMessage::CommandComplete {
                        tag: result.tag.clone(),
                    })
                    .await
                }
                Err(err) => {
                    self.skip_until_sync = true;
                    self.send(&BackendMessage::error("XX000", err.to_string())).await
                }
            },
            Err(message) => {
                self.skip_until_sync = true;
                self.send(&BackendMessage::error("XX000", message)).await
            }
        }
    }

    async fn handle_describe_statement(&mut self, client_name: &str) -> io::Result<()> {
        let entry = {
            let core = self.session.lock().await;
            core.statements.statement(self.conn_id, client_name).cloned()
        };
        let Some(entry) = entry else {
            return self
                .extended_error(UpstreamError::Db(PgErrorInfo {
                    severity: "ERROR".to_string(),
                    code: "26000".to_string(),
                    message: format!("prepared statement \"{client_name}\" does not exist"),
                    detail: None,
                    hint: None,
                    position: None,
                }))
                .await;
        };

        match &entry.backend_name {
            None => {
                let param_count = crate::sql::max_param_index(&entry.sql);
                self.send(&BackendMessage::ParameterDescription {
                    parameter_types: vec![0; param_count],
                })
                .await?;
                if let Some(Ok(verb)) = commands::parse_admin_command(&entry.sql) {
                    self.send(&BackendMessage::RowDescription {
                        fields: commands::fields_for_verb(verb),
                    })
                    .await
                } else {
                    self.send(&BackendMessage::NoData).await
                }
            }
            Some(backend_name) => {
                let backend_name = backend_name.clone();
                let session = self.session.clone();
                let mut core = session.lock().await;
                match guard::guarded_describe_statement(&mut core.upstream, &backend_name).await {
                    Ok(description) => {
                        drop(core);
                        self.send(&BackendMessage::ParameterDescription {
                            parameter_types: description.parameter_types,
                        })
                        .await?;
                        let synthesized = returning_fields(&entry.sql);
                        if let Some(fields) = synthesized {
                            self.send(&BackendMessage::RowDescription { fields }).await
                        } else if let Some(fields) = description.fields {
                            self.send(&BackendMessage::RowDescription { fields }).await
                        } else {
                            self.send(&BackendMessage::NoData).await
                        }
                    }
                    Err(err) => {
                        drop(core);
                        self.extended_error(err).await
                    }
                }
            }
        }
    }

    async fn handle_describe_portal(&mut self, client_portal: &str) -> io::Result<()> {
        let portal = {
            let core = self.session.lock().await;
            core.statements.portal(self.conn_id, client_portal).cloned()
        };
        let Some(portal) = portal else {
            return self
                .extended_error(UpstreamError::Db(PgErrorInfo {
                    severity: "ERROR".to_string(),
                    code: "34000".to_string(),
                    message: format!("portal \"{client_portal}\" does not exist"),
                    detail: None,
                    hint: None,
                    position: None,
                }))
                .await;
        };

        match &portal.backend_name {
            None => {
                if let Some(Ok(verb)) = commands::parse_admin_command(&portal.statement_sql) {
                    self.send(&BackendMessage::RowDescription {
                        fields: commands::fields_for_verb(verb),
                    })
                    .await
                } else {
                    self.send(&BackendMessage::NoData).await
                }
            }
            Some(backend_portal) => {
                let backend_portal = backend_portal.clone();
                let session = self.session.clone();
                let mut core = session.lock().await;
                match guard::guarded_describe_portal(&mut core.upstream, &backend_portal).await {
                    Ok(fields) => {
                        drop(core);
                        let synthesized = returning_fields(&portal.statement_sql);
                        if let Some(fields) = synthesized {
                            self.send(&BackendMessage::RowDescription { fields }).await
                        } else if let Some(fields) = fields {
                            self.send(&BackendMessage::RowDescription { fields }).await
                        } else {
                            self.send(&BackendMessage::NoData).await
                        }
                    }
                    Err(err) => {
                        drop(core);
                        self.extended_error(err).await
                    }
                }
            }
        }
    }

    async fn handle_close(&mut self, kind: u8, client_name: &str) -> io::Result<()> {
        let session = self.session.clone();
        let mut core = session.lock().await;
        let backend_name = match kind {
            b'S' => core
                .statements
                .remove_statement(self.conn_id, client_name)
                .and_then(|entry| entry.backend_name),
            _ => core
                .statements
                .remove_portal(self.conn_id, client_name)
                .and_then(|portal| portal.backend_name),
        };
        if let Some(backend_name) = backend_name {
            if let Err(err) = core.upstream.extended_close(kind, &backend_name).await {
                if err.is_fatal() {
                    drop(core);
                    return Err(self.fail_fatal(err).await);
                }
                debug!(conn_id = self.conn_id, error = %err, "close forwarded to backend failed");
            }
        }
        drop(core);
        self.send(&BackendMessage::CloseComplete).await
    }

    /// Extended-protocol error path: send the error, then discard
    /// messages until Sync.
    async fn extended_error(&mut self, err: UpstreamError) -> io::Result<()> {
        self.skip_until_sync = true;
        match err {
            UpstreamError::Db(info) => self.send_db_error(&info).await,
            other if other.is_fatal() => Err(self.fail_fatal(other).await),
            other => {
                self.send(&BackendMessage::error("XX000", other.to_string()))
                    .await
            }
        }
    }

    // --- Disconnect --------------------------------------------------

    /// Matches PostgreSQL's implicit rollback on disconnect: every user
    /// transaction this connection left open is rolled back, then the
    /// connection's backend prepared statements are reaped.
    async fn disconnect_cleanup(&mut self) {
        let session = self.session.clone();
        let mut core = session.lock().await;
        while self.user_tx_count > 0 && core.savepoint_level > 0 {
            let name = core.current_savepoint_name();
            let sql = format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}");
            match guard::guarded_tcl(&mut core.upstream, &sql).await {
                Ok(()) => {
                    core.decrement_savepoint_level();
                    self.user_tx_count -= 1;
                }
                Err(err) => {
                    warn!(conn_id = self.conn_id, error = %err, "rollback on disconnect failed");
                    if err.is_fatal() {
                        self.session.mark_poisoned();
                    }
                    break;
                }
            }
        }
        self.user_tx_count = 0;
        core.release_open_transaction(self.conn_id);

        for backend_name in core.statements.drain_connection(self.conn_id) {
            if let Err(err) = core.upstream.extended_close(b'S', &backend_name).await {
                warn!(conn_id = self.conn_id, error = %err, "statement cleanup on disconnect failed");
                if err.is_fatal() {
                    self.session.mark_poisoned();
                }
                break;
            }
        }
        info!(conn_id = self.conn_id, test_id = %self.test_id, "client connection closed");
    }
}

fn wire_bind_values(params: &[Option<Vec<u8>>], formats: &[i16]) -> Vec<BindValue> {
    params
        .iter()
        .enumerate()
        .map(|(i, value)| {
            // Format codes broadcast: none means all-text, one applies to
            // every parameter, otherwise they are positional.
            let format = match formats.len() {
                0 => 0,
                1 => formats[0],
                _ => formats.get(i).copied().unwrap_or(0),
            };
            BindValue::from_wire(value.as_deref(), format)
        })
        .collect()
}

/// Synthesized row description for DML whose RETURNING list is all bare
/// columns; None otherwise (the backend's descriptor is forwarded).
fn returning_fields(sql: &str) -> Option<Vec<FieldDescription>> {
    let columns = returning_columns(sql);
    if columns.is_empty() {
        return None;
    }
    Some(
        columns
            .into_iter()
            .map(|column| {
                let mut field = FieldDescription::text(column.name, column.type_oid);
                field.type_oid = if field.type_oid == 0 { TEXT_OID } else { field.type_oid };
                field
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_value_format_broadcast() {
        let params = vec![Some(b"1".to_vec()), Some(vec![0xff])];
        let all_text = wire_bind_values(&params, &[]);
        assert_eq!(all_text[0], BindValue::Text("1".to_string()));

        let all_binary = wire_bind_values(&params, &[1]);
        assert!(matches!(all_binary[0], BindValue::Bytes(_)));

        let positional = wire_bind_values(&params, &[0, 1]);
        assert_eq!(positional[0], BindValue::Text("1".to_string()));
        assert!(matches!(positional[1], BindValue::Bytes(_)));
    }

    #[test]
    fn returning_fields_only_for_bare_columns() {
        let fields =
            returning_fields("INSERT INTO t (v) VALUES (1) RETURNING id, name").expect("fields");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "id");
        assert_eq!(fields[0].type_oid, 20);
        assert_eq!(fields[1].type_oid, TEXT_OID);
        assert!(returning_fields("INSERT INTO t VALUES (1) RETURNING *").is_none());
        assert!(returning_fields("SELECT 1").is_none());
    }
}
