//! End-to-end scenarios against a live PostgreSQL.
//!
//! These tests start a real proxy on a kernel-assigned port and drive it
//! over the wire. They need a reachable database and are skipped unless
//! PGROLLBACK_TEST_HOST is set:
//!
//!   PGROLLBACK_TEST_HOST=127.0.0.1 PGROLLBACK_TEST_USER=postgres \
//!   PGROLLBACK_TEST_PASSWORD=postgres cargo test --test live_proxy

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use pgrollback::proxy::registry::{RegistrySettings, SessionRegistry};
use pgrollback::proxy::server::ProxyServer;
use pgrollback::upstream::{UpstreamConfig, UpstreamConnection, UpstreamError};

struct LiveEnv {
    host: String,
    port: u16,
    database: String,
    user: String,
    password: Option<String>,
}

fn live_env() -> Option<LiveEnv> {
    let host = std::env::var("PGROLLBACK_TEST_HOST").ok()?;
    Some(LiveEnv {
        host,
        port: std::env::var("PGROLLBACK_TEST_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(5432),
        database: std::env::var("PGROLLBACK_TEST_DB").unwrap_or_else(|_| "postgres".to_string()),
        user: std::env::var("PGROLLBACK_TEST_USER").unwrap_or_else(|_| "postgres".to_string()),
        password: std::env::var("PGROLLBACK_TEST_PASSWORD").ok(),
    })
}

struct TestProxy {
    registry: Arc<SessionRegistry>,
    addr: std::net::SocketAddr,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl TestProxy {
    async fn start(env: &LiveEnv) -> Self {
        let registry = SessionRegistry::new(RegistrySettings {
            postgres_host: env.host.clone(),
            postgres_port: env.port,
            postgres_database: env.database.clone(),
            postgres_user: env.user.clone(),
            postgres_password: env.password.clone(),
            session_timeout: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(600),
            keepalive_interval: Duration::ZERO,
        });
        let server = ProxyServer::bind("127.0.0.1", 0, registry.clone())
            .await
            .expect("proxy should bind a kernel-assigned port");
        let addr = server.local_addr();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(server.run(shutdown_rx));
        Self {
            registry,
            addr,
            shutdown,
            task,
        }
    }

    /// A wire client connected through the proxy under the given
    /// application_name. Any password is accepted by the proxy.
    async fn client(&self, application_name: &str) -> UpstreamConnection {
        let config = UpstreamConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            database: "postgres".to_string(),
            user: "tester".to_string(),
            password: Some("anything".to_string()),
            application_name: application_name.to_string(),
            session_timeout: Duration::from_secs(600),
        };
        UpstreamConnection::connect(&config)
            .await
            .expect("client should connect through the proxy")
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
        self.registry.destroy_all().await;
    }
}

/// A direct connection to the real database, bypassing the proxy.
async fn direct(env: &LiveEnv) -> UpstreamConnection {
    let config = UpstreamConfig {
        host: env.host.clone(),
        port: env.port,
        database: env.database.clone(),
        user: env.user.clone(),
        password: env.password.clone(),
        application_name: "pgrollback-verifier".to_string(),
        session_timeout: Duration::from_secs(600),
    };
    UpstreamConnection::connect(&config)
        .await
        .expect("direct connection should succeed")
}

fn single_value(results: &[pgrollback::upstream::SimpleResult]) -> String {
    let result = results
        .iter()
        .find(|result| !result.fields.is_empty())
        .expect("query should produce a result set");
    let row = result.rows.first().expect("result should have one row");
    let value = row.first().cloned().flatten().expect("value should be non-null");
    String::from_utf8(value).expect("value should be utf8")
}

#[tokio::test]
async fn commit_protection_keeps_writes_invisible_outside_the_proxy() {
    let Some(env) = live_env() else {
        return;
    };
    let proxy = TestProxy::start(&env).await;
    let mut client = proxy.client("pgtest_commit_protection").await;

    client
        .simple_query("CREATE TABLE t_commit_protection (id serial primary key, v text)")
        .await
        .expect("create table through proxy");
    client
        .simple_query("INSERT INTO t_commit_protection (v) VALUES ('a')")
        .await
        .expect("insert through proxy");
    client.simple_query("COMMIT").await.expect("commit is absorbed");

    let counted = client
        .simple_query("SELECT count(*) FROM t_commit_protection")
        .await
        .expect("select through proxy");
    assert_eq!(single_value(&counted), "1");

    // The real database must not see the table: the base transaction was
    // never committed.
    let mut verifier = direct(&env).await;
    let visible = verifier
        .simple_query("SELECT count(*) FROM pg_tables WHERE tablename = 't_commit_protection'")
        .await
        .expect("catalog query");
    assert_eq!(single_value(&visible), "0");
    verifier.close().await;

    // Full reset: the table disappears through the proxy too.
    client
        .simple_query("pgrollback rollback")
        .await
        .expect("pgrollback rollback");
    let err = client
        .simple_query("SELECT count(*) FROM t_commit_protection")
        .await
        .expect_err("table should be gone after full rollback");
    match err {
        UpstreamError::Db(info) => assert_eq!(info.code, "42P01"),
        other => panic!("expected undefined_table, got {other}"),
    }

    client.close().await;
    proxy.stop().await;
}

#[tokio::test]
async fn client_rollback_at_level_zero_is_a_noop() {
    let Some(env) = live_env() else {
        return;
    };
    let proxy = TestProxy::start(&env).await;
    let mut client = proxy.client("pgtest_rollback_noop").await;

    client
        .simple_query("CREATE TABLE t_rollback_noop (v text)")
        .await
        .expect("create table");
    client
        .simple_query("INSERT INTO t_rollback_noop VALUES ('x')")
        .await
        .expect("insert");
    client
        .simple_query("ROLLBACK")
        .await
        .expect("rollback at level zero succeeds");

    // The row survives: there was no user savepoint to roll back to.
    let counted = client
        .simple_query("SELECT count(*) FROM t_rollback_noop")
        .await
        .expect("select after noop rollback");
    assert_eq!(single_value(&counted), "1");

    client.close().await;
    proxy.stop().await;
}

#[tokio::test]
async fn two_connections_share_one_session() {
    let Some(env) = live_env() else {
        return;
    };
    let proxy = TestProxy::start(&env).await;
    let mut writer = proxy.client("pgtest_shared").await;
    let mut reader = proxy.client("pgtest_shared").await;

    writer
        .simple_query("CREATE TABLE t_shared (v text); INSERT INTO t_shared VALUES ('x')")
        .await
        .expect("create and insert");
    let counted = reader
        .simple_query("SELECT count(*) FROM t_shared")
        .await
        .expect("read uncommitted state from the shared session");
    assert_eq!(single_value(&counted), "1");

    writer.close().await;
    reader.close().await;
    proxy.stop().await;
}

#[tokio::test]
async fn different_test_ids_are_isolated() {
    let Some(env) = live_env() else {
        return;
    };
    let proxy = TestProxy::start(&env).await;
    let mut a = proxy.client("pgtest_iso_a").await;
    let mut b = proxy.client("pgtest_iso_b").await;

    a.simple_query("CREATE TABLE t_iso (x int)")
        .await
        .expect("create in session a");
    let err = b
        .simple_query("SELECT * FROM t_iso")
        .await
        .expect_err("session b must not see session a's table");
    match err {
        UpstreamError::Db(info) => assert_eq!(info.code, "42P01"),
        other => panic!("expected undefined_table, got {other}"),
    }

    a.close().await;
    b.close().await;
    proxy.stop().await;
}

#[tokio::test]
async fn nested_user_savepoints_roll_back_precisely() {
    let Some(env) = live_env() else {
        return;
    };
    let proxy = TestProxy::start(&env).await;
    let mut client = proxy.client("pgtest_nested").await;

    client
        .simple_query("CREATE TABLE t_nested (v int)")
        .await
        .expect("create table");
    client
        .simple_query(
            "BEGIN; INSERT INTO t_nested VALUES (1); SAVEPOINT a; \
             INSERT INTO t_nested VALUES (2); SAVEPOINT b; \
             INSERT INTO t_nested VALUES (3); ROLLBACK TO SAVEPOINT b; \
             ROLLBACK TO SAVEPOINT b",
        )
        .await
        .expect("nested savepoint sequence");
    let counted = client
        .simple_query("SELECT count(*) FROM t_nested")
        .await
        .expect("count after rollback to b");
    assert_eq!(single_value(&counted), "2");

    client
        .simple_query("RELEASE SAVEPOINT b; ROLLBACK TO SAVEPOINT a")
        .await
        .expect("release b, roll back to a");
    let counted = client
        .simple_query("SELECT count(*) FROM t_nested")
        .await
        .expect("count after rollback to a");
    assert_eq!(single_value(&counted), "1");

    client.close().await;
    proxy.stop().await;
}

#[tokio::test]
async fn failed_statements_do_not_abort_the_session() {
    let Some(env) = live_env() else {
        return;
    };
    let proxy = TestProxy::start(&env).await;
    let mut client = proxy.client("pgtest_guarded").await;

    let err = client
        .simple_query("SELECT * FROM table_that_does_not_exist")
        .await
        .expect_err("bad statement must fail");
    match err {
        UpstreamError::Db(info) => assert_eq!(info.code, "42P01"),
        other => panic!("expected undefined_table, got {other}"),
    }

    // The very next statement runs normally: the guard rolled back the
    // inner savepoint, never the base transaction.
    let value = client
        .simple_query("SELECT 41 + 1")
        .await
        .expect("statement after a failure must succeed");
    assert_eq!(single_value(&value), "42");

    client.close().await;
    proxy.stop().await;
}

#[tokio::test]
async fn colliding_prepared_statement_names_stay_isolated() {
    let Some(env) = live_env() else {
        return;
    };
    let proxy = TestProxy::start(&env).await;
    let mut a = proxy.client("pgtest_stmt_collision").await;
    let mut b = proxy.client("pgtest_stmt_collision").await;

    a.extended_parse("s1", "SELECT $1::int", &[])
        .await
        .expect("parse on connection a");
    b.extended_parse("s1", "SELECT 42", &[])
        .await
        .expect("parse of the same name on connection b");

    a.extended_bind("p1", "s1", &[], &[Some(b"123".to_vec())], &[])
        .await
        .expect("bind a's parameter");
    let a_result = a.extended_execute("p1", 0).await.expect("execute a's portal");
    assert_eq!(a_result.rows[0][0].as_deref(), Some(b"123".as_slice()));

    b.extended_bind("p1", "s1", &[], &[], &[])
        .await
        .expect("bind b's portal");
    let b_result = b.extended_execute("p1", 0).await.expect("execute b's portal");
    assert_eq!(b_result.rows[0][0].as_deref(), Some(b"42".as_slice()));

    a.close().await;
    b.close().await;
    proxy.stop().await;
}

#[tokio::test]
async fn second_connection_begin_is_rejected_while_claim_is_held() {
    let Some(env) = live_env() else {
        return;
    };
    let proxy = TestProxy::start(&env).await;
    let mut owner = proxy.client("pgtest_claim").await;
    let mut intruder = proxy.client("pgtest_claim").await;

    owner.simple_query("BEGIN").await.expect("owner claims the transaction");
    let err = intruder
        .simple_query("BEGIN")
        .await
        .expect_err("second connection BEGIN must be rejected");
    match err {
        UpstreamError::Db(info) => assert_eq!(info.code, "XX000"),
        other => panic!("expected synthesized error, got {other}"),
    }

    owner.simple_query("COMMIT").await.expect("owner commits");
    intruder
        .simple_query("BEGIN")
        .await
        .expect("claim is free after the owner commits");

    owner.close().await;
    intruder.close().await;
    proxy.stop().await;
}

#[tokio::test]
async fn execute_with_lock_serializes_on_the_advisory_key() {
    let Some(env) = live_env() else {
        return;
    };
    let proxy = TestProxy::start(&env).await;
    let mut client = proxy.client("pgtest_advisory").await;
    client
        .simple_query("CREATE TABLE t_advisory (v int)")
        .await
        .expect("create table");

    let session = proxy
        .registry
        .get("advisory")
        .await
        .expect("session should exist for the connected test id");
    session
        .execute_with_lock("INSERT INTO t_advisory VALUES (1)")
        .await
        .expect("locked execute should succeed");

    let counted = client
        .simple_query("SELECT count(*) FROM t_advisory")
        .await
        .expect("count after locked insert");
    assert_eq!(single_value(&counted), "1");

    client.close().await;
    proxy.stop().await;
}

#[tokio::test]
async fn admin_status_reports_the_session() {
    let Some(env) = live_env() else {
        return;
    };
    let proxy = TestProxy::start(&env).await;
    let mut client = proxy.client("pgtest_status").await;

    let results = client
        .simple_query("pgrollback status")
        .await
        .expect("status pseudo-query");
    let result = &results[0];
    assert_eq!(result.fields.len(), 4);
    assert_eq!(result.fields[0].name, "test_id");
    assert_eq!(result.rows[0][0].as_deref(), Some(b"status".as_slice()));

    client.close().await;
    proxy.stop().await;
}
