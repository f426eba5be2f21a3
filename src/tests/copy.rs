use super::*;
use crate::{ConnectionStatus, Error};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_writer_streams_rows() {
    let (server, conn) = connected().await;

    let mut writer = conn
        .table_writer("COPY notes (id, body) FROM STDIN")
        .await
        .unwrap();
    assert_eq!(writer.columns(), 2);
    assert_eq!(conn.status(), ConnectionStatus::Copying);

    writer.insert((1, "first\tline")).await.unwrap();
    writer.insert((2, None::<String>)).await.unwrap();
    writer.insert_raw(b"3\tthird\n").await.unwrap();
    assert_eq!(writer.finish().await.unwrap(), 3);

    assert!(!writer.is_open());
    assert_eq!(server.copied(), "1\tfirst\\tline\n2\t\\N\n3\tthird\n");
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    assert!(matches!(writer.finish().await, Err(Error::AlreadyClosed)));
}

#[tokio::test]
async fn test_writer_rejects_wrong_width() {
    let (server, conn) = connected().await;
    let mut writer = conn
        .table_writer("COPY notes (id, body) FROM STDIN")
        .await
        .unwrap();

    let err = writer.insert(1).await.unwrap_err();
    assert!(matches!(err, Error::Copy(msg) if msg.contains("1 values")));
    assert!(writer.is_open());

    writer.insert((1, "ok")).await.unwrap();
    assert_eq!(writer.finish().await.unwrap(), 1);
    assert_eq!(server.copied(), "1\tok\n");
}

#[tokio::test]
async fn test_other_operations_wait_for_copy() {
    let (_server, conn) = connected().await;
    let mut writer = conn.table_writer("COPY notes (id) FROM STDIN").await.unwrap();

    assert!(matches!(
        conn.execute("SELECT $1", 1).await,
        Err(Error::CopyInProgress)
    ));
    assert!(matches!(conn.begin().await, Err(Error::CopyInProgress)));
    assert!(matches!(
        conn.table_reader("COPY notes TO STDOUT").await,
        Err(Error::CopyInProgress)
    ));

    writer.finish().await.unwrap();
    let value: i32 = conn.execute("SELECT $1", 5).await.unwrap().one().unwrap();
    assert_eq!(value, 5);
}

#[tokio::test]
async fn test_cancel_writer() {
    let (server, conn) = connected().await;
    let mut writer = conn.table_writer("COPY notes (id) FROM STDIN").await.unwrap();
    writer.insert(1).await.unwrap();

    writer.cancel("changed my mind").await.unwrap();

    assert!(!writer.is_open());
    assert_eq!(server.copy_failures(), vec!["changed my mind".to_string()]);
    assert_eq!(server.copied(), "");
    assert_eq!(conn.status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn test_dropped_writer_aborts_before_next_statement() {
    let (server, conn) = connected().await;
    {
        let mut writer = conn.table_writer("COPY notes (id) FROM STDIN").await.unwrap();
        writer.insert(1).await.unwrap();
    }
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    assert!(server.copy_failures().is_empty());

    let value: i32 = conn.execute("SELECT $1", 5).await.unwrap().one().unwrap();

    assert_eq!(value, 5);
    assert_eq!(server.copy_failures().len(), 1);
    assert_eq!(server.copied(), "");
}

#[tokio::test]
async fn test_reader_rows() {
    let (server, conn) = connected().await;
    server.respond_copy(
        "COPY notes TO STDOUT",
        2,
        &["1\tfirst", "2\t\\N", "3\ttab\\there"],
    );

    let mut reader = conn.table_reader("COPY notes TO STDOUT").await.unwrap();
    assert_eq!(reader.columns(), 2);

    let first = reader.next_row().await.unwrap().unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first.get::<i32>(0).unwrap(), 1);
    assert_eq!(first.get::<String>(1).unwrap(), "first");

    let rest: Vec<(i32, Option<String>)> = reader.to_vec().await.unwrap();
    assert_eq!(
        rest,
        vec![(2, None), (3, Some("tab\there".to_string()))]
    );
    assert!(!reader.is_open());
    assert!(reader.next_row().await.unwrap().is_none());
    assert_eq!(conn.status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn test_dropped_reader_discards_rest() {
    let (server, conn) = connected().await;
    server.respond_copy("COPY notes TO STDOUT", 1, &["1", "2", "3"]);
    {
        let mut reader = conn.table_reader("COPY notes TO STDOUT").await.unwrap();
        assert!(reader.next_row().await.unwrap().is_some());
    }

    let value: i32 = conn.execute("SELECT $1", 9).await.unwrap().one().unwrap();
    assert_eq!(value, 9);
    assert_eq!(conn.status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn test_statement_must_match_direction() {
    let (server, conn) = connected().await;
    server.respond_copy("COPY notes TO STDOUT", 1, &["1"]);

    let err = conn.table_writer("COPY notes TO STDOUT").await.unwrap_err();
    assert!(matches!(err, Error::Copy(msg) if msg.contains("COPY TO STDOUT")));
    assert_eq!(conn.status(), ConnectionStatus::Idle);

    let err = conn.table_reader("COPY notes FROM STDIN").await.unwrap_err();
    assert!(matches!(err, Error::Copy(msg) if msg.contains("COPY FROM STDIN")));
    assert_eq!(server.copy_failures().len(), 1);

    let err = conn.table_writer("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Copy(msg) if msg.contains("does not copy")));

    let value: i32 = conn.execute("SELECT $1", 3).await.unwrap().one().unwrap();
    assert_eq!(value, 3);
}

#[tokio::test]
async fn test_copy_server_error() {
    let (server, conn) = connected().await;
    server.fail_on("COPY missing", "42P01");

    let err = conn.table_writer("COPY missing FROM STDIN").await.unwrap_err();
    assert_eq!(err.sql_state(), Some("42P01"));
    assert_eq!(conn.status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn test_copy_inside_transaction() {
    let (server, conn) = connected().await;
    let start = server.statements().len();

    let mut tx = conn.begin().await.unwrap();
    let mut writer = tx.table_writer("COPY notes (id) FROM STDIN").await.unwrap();
    writer.insert(7).await.unwrap();
    assert!(matches!(
        tx.execute("SELECT $1", 1).await,
        Err(Error::CopyInProgress)
    ));
    assert_eq!(writer.finish().await.unwrap(), 1);
    tx.commit().await.unwrap();

    assert_eq!(
        server.statements_since(start),
        vec![
            "START TRANSACTION".to_string(),
            "COPY notes (id) FROM STDIN".to_string(),
            "COMMIT TRANSACTION".to_string(),
        ]
    );
}
