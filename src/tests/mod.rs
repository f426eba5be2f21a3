//! Connection-level tests against the scripted server in [`mock`].

mod copy;

#[cfg(feature = "postgres-integration-tests")]
mod integration;

use crate::{Config, Connection};
use mock::{Auth, MockServer};

async fn connected() -> (MockServer, Connection) {
    connected_with(Config::new()).await
}

async fn connected_with(config: Config) -> (MockServer, Connection) {
    let (server, channel) = MockServer::pair();
    let conn = Connection::connect_with_channel(channel, config)
        .await
        .unwrap();
    (server, conn)
}

async fn connect_with_auth(auth: Auth, config: Config) -> crate::Result<(MockServer, Connection)> {
    let (server, channel) = MockServer::with_auth(auth);
    let conn = Connection::connect_with_channel(channel, config).await?;
    Ok((server, conn))
}

mod startup {
    use super::*;
    use crate::{ConnectionStatus, Error, TransactionStatus};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_handshake() {
        let (server, conn) = connected().await;

        assert_eq!(conn.status(), ConnectionStatus::Idle);
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
        assert_eq!(conn.parameter("server_version").as_deref(), Some("16.0"));
        assert_eq!(conn.backend_pid(), 4242);
        assert_eq!(conn.depth(), 0);
        assert_eq!(server.startup_param("user").as_deref(), Some("postgres"));
        assert_eq!(server.startup_param("client_encoding").as_deref(), Some("UTF8"));
    }

    #[tokio::test]
    async fn test_application_name() {
        let (server, _conn) = connected_with(Config::new().application_name("worker")).await;
        assert_eq!(server.startup_param("application_name").as_deref(), Some("worker"));
    }

    #[tokio::test]
    async fn test_cleartext_auth() {
        let config = Config::new().user("alice").password("s3cret");
        let (_server, conn) = connect_with_auth(Auth::Cleartext("s3cret".into()), config)
            .await
            .unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Idle);
    }

    #[tokio::test]
    async fn test_md5_auth() {
        let config = Config::new().user("alice").password("s3cret");
        let (_server, conn) = connect_with_auth(Auth::Md5("s3cret".into()), config)
            .await
            .unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Idle);
    }

    #[tokio::test]
    async fn test_scram_auth() {
        let config = Config::new().user("alice").password("s3cret");
        let (_server, conn) = connect_with_auth(Auth::Scram("s3cret".into()), config)
            .await
            .unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Idle);
    }

    #[tokio::test]
    async fn test_wrong_password() {
        for auth in [
            Auth::Cleartext("right".into()),
            Auth::Md5("right".into()),
            Auth::Scram("right".into()),
        ] {
            let config = Config::new().user("alice").password("wrong");
            let err = connect_with_auth(auth.clone(), config).await.unwrap_err();
            assert!(matches!(err, Error::Connection(_)), "{:?}: {:?}", auth, err);
        }
    }

    #[tokio::test]
    async fn test_missing_password() {
        let err = connect_with_auth(Auth::Md5("pw".into()), Config::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(msg) if msg.contains("password")));
    }
}

mod execution {
    use super::*;
    use crate::{Error, Format, Oid, NULL};
    use mock::BoundParam;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_parameters_bound_in_order() {
        let (server, conn) = connected().await;

        let result = conn.execute("SELECT $1, $2", (42, "hello")).await.unwrap();

        assert_eq!(
            server.last_bind(),
            vec![
                BoundParam {
                    oid: Oid::INT4,
                    format: 1,
                    value: Some(42i32.to_be_bytes().to_vec()),
                },
                BoundParam {
                    oid: Oid::TEXT,
                    format: 0,
                    value: Some(b"hello".to_vec()),
                },
            ]
        );
        let (n, s): (i32, String) = result.one().unwrap();
        assert_eq!(n, 42);
        assert_eq!(s, "hello");
        assert_eq!(result.columns()[0].oid, Oid::INT4);
        assert_eq!(result.columns()[0].format, Format::Binary);
    }

    #[tokio::test]
    async fn test_null_parameter() {
        let (server, conn) = connected().await;

        let result = conn.execute("SELECT $1", NULL).await.unwrap();

        let bound = server.last_bind();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].oid, Oid::INVALID);
        assert_eq!(bound[0].value, None);

        let row = result.at(0).unwrap();
        assert!(row.at(0).unwrap().is_null());
        assert_eq!(row.get::<Option<i32>, _>(0).unwrap(), None);
        assert!(matches!(row.get::<i32, _>(0), Err(Error::NullValue { .. })));
    }

    #[tokio::test]
    async fn test_optional_parameter() {
        let (server, conn) = connected().await;
        let missing: Option<i64> = None;

        conn.execute("SELECT $1, $2", (Some(7i64), missing)).await.unwrap();

        let bound = server.last_bind();
        assert_eq!(bound[0].oid, Oid::INT8);
        assert_eq!(bound[0].value, Some(7i64.to_be_bytes().to_vec()));
        assert_eq!(bound[1].oid, Oid::INT8);
        assert_eq!(bound[1].value, None);
    }

    #[tokio::test]
    async fn test_text_rows() {
        let (server, conn) = connected().await;
        server.respond(
            "SELECT id, name FROM users",
            &[("id", Oid::INT4), ("name", Oid::TEXT)],
            &[&[Some("1"), Some("ann")], &[Some("2"), None]],
        );

        let result = conn.execute("SELECT id, name FROM users", ()).await.unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result.command_tag(), "SELECT 2");
        let users: Vec<(i32, Option<String>)> = result.to_vec().unwrap();
        assert_eq!(users, vec![(1, Some("ann".to_string())), (2, None)]);

        let first = result.at(0).unwrap();
        assert_eq!(first.get::<String, _>("name").unwrap(), "ann");
        assert!(matches!(first.get::<String, _>("email"), Err(Error::UnknownColumn(_))));
        assert!(matches!(result.at(2), Err(Error::Range { index: 2, size: 2 })));
        assert!(matches!(result.one::<i32>(), Err(Error::UnexpectedRowCount { .. })));
    }

    #[tokio::test]
    async fn test_rows_affected() {
        let (_server, conn) = connected().await;
        let result = conn
            .execute("INSERT INTO t (id) VALUES ($1)", 1)
            .await
            .unwrap();
        assert_eq!(result.command_tag(), "INSERT 0 1");
        assert_eq!(result.rows_affected(), 1);
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection_usable() {
        let (server, conn) = connected().await;
        server.fail_on("SELECT * FROM missing", "42P01");

        let err = conn.execute("SELECT * FROM missing", ()).await.unwrap_err();
        assert_eq!(err.sql_state(), Some("42P01"));
        assert!(!err.is_connection_error());
        assert_eq!(conn.status(), crate::ConnectionStatus::Idle);

        let value: i32 = conn.execute("SELECT $1", 5).await.unwrap().one().unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_short_data_row_is_protocol_error() {
        let (server, conn) = connected().await;
        server.respond(
            "SELECT id, name FROM users",
            &[("id", Oid::INT4), ("name", Oid::TEXT)],
            &[&[Some("1"), Some("ann")], &[Some("2")]],
        );

        let err = conn.execute("SELECT id, name FROM users", ()).await.unwrap_err();

        assert!(matches!(err, Error::Protocol(msg) if msg.contains("1 values")));
        assert_eq!(conn.status(), crate::ConnectionStatus::Broken);
    }

    #[tokio::test]
    async fn test_blocking_mode() {
        let (_server, conn) = connected_with(Config::new().non_blocking(false)).await;
        assert!(!conn.is_non_blocking());

        let value: String = conn.execute("SELECT $1", "x").await.unwrap().one().unwrap();
        assert_eq!(value, "x");
    }

    #[tokio::test]
    async fn test_prepared_statement() {
        let (server, conn) = connected().await;

        conn.prepare("echo_one", "SELECT $1").await.unwrap();
        assert!(conn.is_prepared("echo_one"));

        let result = conn.execute("echo_one", 42).await.unwrap();
        assert_eq!(server.statements().last().map(String::as_str), Some("SELECT $1"));
        assert_eq!(result.one::<i32>().unwrap(), 42);

        conn.deallocate("echo_one").await.unwrap();
        assert!(!conn.is_prepared("echo_one"));
    }

    #[tokio::test]
    async fn test_prepare_rejects_bad_name() {
        let (server, conn) = connected().await;
        let before = server.statements().len();

        let err = conn.prepare("drop table", "SELECT 1").await.unwrap_err();

        assert!(matches!(err, Error::InvalidIdentifier(_)));
        assert_eq!(server.statements().len(), before);
    }

    #[tokio::test]
    async fn test_prepare_failure() {
        let (server, conn) = connected().await;
        server.fail_on("SELEC ", "42601");

        let err = conn.prepare("bad", "SELEC 1").await.unwrap_err();

        assert_eq!(err.sql_state(), Some("42601"));
        assert!(!conn.is_prepared("bad"));
    }
}

mod lifecycle {
    use super::*;
    use crate::{ConnectionStatus, Error};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_close() {
        let (server, conn) = connected().await;

        conn.close().await.unwrap();

        assert!(server.terminated());
        assert!(conn.is_closed());
        assert!(matches!(conn.execute("SELECT 1", ()).await, Err(Error::UseAfterClose)));
        assert!(matches!(conn.begin().await, Err(Error::UseAfterClose)));
        // Closing twice is harmless
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_breaks_connection() {
        let (server, conn) = connected().await;
        conn.set_timeout(Some(Duration::from_millis(50)));
        server.stall();

        let started = Instant::now();
        let err = conn.execute("SELECT 1", ()).await.unwrap_err();

        assert!(matches!(err, Error::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(conn.status(), ConnectionStatus::Broken);

        let err = conn.execute("SELECT 1", ()).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));

        conn.close().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_timeout_in_blocking_mode() {
        let config = Config::new()
            .non_blocking(false)
            .timeout(Some(Duration::from_millis(30)));
        let (server, conn) = connected_with(config).await;
        server.stall();

        assert!(matches!(conn.execute("SELECT 1", ()).await, Err(Error::Timeout)));
        assert_eq!(conn.status(), ConnectionStatus::Broken);
    }

    #[tokio::test]
    async fn test_server_hang_up() {
        let (server, conn) = connected().await;
        server.hang_up();

        let err = conn.execute("SELECT 1", ()).await.unwrap_err();

        assert!(err.is_connection_error());
        assert_eq!(conn.status(), ConnectionStatus::Broken);
    }

    #[tokio::test]
    async fn test_concurrent_use_is_busy() {
        let (server, conn) = connected().await;
        server.stall();

        let mut first = Box::pin(conn.execute("SELECT 1", ()));
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut first)
            .await
            .is_err());
        assert_eq!(conn.status(), ConnectionStatus::Sending);

        assert!(matches!(conn.execute("SELECT 2", ()).await, Err(Error::Busy)));
        assert!(matches!(conn.begin().await, Err(Error::Busy)));
        assert!(matches!(conn.close().await, Err(Error::Busy)));

        // Abandoning the in-flight operation leaves the stream misaligned
        drop(first);
        assert_eq!(conn.status(), ConnectionStatus::Broken);
    }
}

mod notifications {
    use super::*;
    use crate::Notification;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_listen_and_poll() {
        let (server, conn) = connected().await;

        conn.listen("jobs").await.unwrap();
        assert_eq!(server.statements().last().map(String::as_str), Some("LISTEN \"jobs\""));

        server.notify("jobs", "42");
        server.notify("jobs", "43");
        assert_eq!(conn.process_notifications().await.unwrap(), 2);

        let received = conn.take_notifications();
        assert_eq!(
            received,
            vec![
                Notification {
                    process_id: 4242,
                    channel: "jobs".to_string(),
                    payload: "42".to_string(),
                },
                Notification {
                    process_id: 4242,
                    channel: "jobs".to_string(),
                    payload: "43".to_string(),
                },
            ]
        );
        assert!(conn.take_notifications().is_empty());
        assert_eq!(conn.process_notifications().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_handler_receives_notifications_during_execute() {
        let (server, conn) = connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conn.set_notification_handler(move |n| sink.lock().push(n.payload.clone()));

        server.notify("jobs", "ready");
        conn.execute("SELECT $1", 1).await.unwrap();

        assert_eq!(*seen.lock(), vec!["ready".to_string()]);
        assert!(conn.take_notifications().is_empty());

        conn.clear_notification_handler();
        server.notify("jobs", "queued");
        conn.process_notifications().await.unwrap();
        assert_eq!(conn.take_notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_notify_and_unlisten() {
        let (server, conn) = connected().await;

        conn.notify("jobs", Some("it's done")).await.unwrap();
        conn.notify("jobs", None).await.unwrap();
        conn.unlisten("jobs").await.unwrap();

        let statements = server.statements();
        let tail = &statements[statements.len() - 3..];
        assert_eq!(
            tail,
            [
                "NOTIFY \"jobs\", 'it''s done'".to_string(),
                "NOTIFY \"jobs\"".to_string(),
                "UNLISTEN \"jobs\"".to_string(),
            ]
        );
    }
}
