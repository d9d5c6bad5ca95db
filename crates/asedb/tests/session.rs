//! Session behavior against an in-memory server.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use asedb::{Session, SessionState};
use asedb_core::error::{ConnectionErrorKind, QueryErrorKind};
use asedb_core::{Cx, Error, Value};

use common::Script;

fn batch_sizes(session: &Session, sql: &str) -> Vec<usize> {
    let cx = Cx::for_testing();
    let mut rows = session.execute(&cx, sql, &[]).unwrap();
    let mut sizes = Vec::new();
    while let Some(batch) = rows.next_batch(&cx).unwrap() {
        sizes.push(batch.len());
    }
    assert!(rows.is_done());
    sizes
}

// ============================================================================
// Login
// ============================================================================

#[test]
fn login_sends_username_and_locale() {
    let (session, server) = common::connect(500);
    let info = session.server_info();
    assert_eq!(info.program, "ASE fake");
    assert_eq!(info.version, "16.0.4.0");
    assert_eq!(info.tds_version, "5.0.0.0");
    assert_eq!(info.database, "master");
    assert_eq!(info.language, "us_english");
    assert_eq!(info.packet_size, 512);
    assert!(matches!(session.state(), SessionState::Ready));

    session.close(&Cx::for_testing()).unwrap();
    let log = server.join();
    assert_eq!(log.username, "sa");
    assert_eq!(log.locale, "us_english");
    assert_eq!(log.logouts, 1);
    assert!(log.malformed.is_empty());
}

#[test]
fn login_rejection_is_authentication_error() {
    let script = Script {
        reject_login: true,
        ..Script::default()
    };
    let (socket, server) = common::spawn(script);
    let cx = Cx::for_testing();
    let err = Session::connect_over(&cx, common::config(500), socket).unwrap_err();
    match err {
        Error::Connection(e) => {
            assert_eq!(e.kind, ConnectionErrorKind::Authentication);
            assert_eq!(e.message, "Login failed.");
        }
        other => panic!("expected authentication error, got {other:?}"),
    }
    server.join();
}

#[test]
fn larger_negotiated_packet_size_is_accepted() {
    let script = Script {
        packet_size: 2048,
        ..Script::default()
    };
    let (session, server) = common::connect_with(common::config(500), script);
    assert_eq!(session.server_info().packet_size, 2048);
    assert_eq!(batch_sizes(&session, "select id, name from t_1200"), vec![500, 500, 200]);
    drop(session);
    assert!(server.join().malformed.is_empty());
}

// ============================================================================
// Cursor paging
// ============================================================================

#[test]
fn cursor_select_pages_by_fetch_size() {
    let (session, server) = common::connect(500);
    let cx = Cx::for_testing();

    let mut rows = session
        .execute(&cx, "select id, name from t_1200", &[])
        .unwrap();
    assert_eq!(server.log().fetches.len(), 1);
    assert_eq!(rows.column_names(), ["id".to_string(), "name".to_string()]);
    assert!(rows.columns()[1].nullable());

    let mut sizes = Vec::new();
    let mut ids = Vec::new();
    while let Some(batch) = rows.next_batch(&cx).unwrap() {
        sizes.push(batch.len());
        for row in batch.rows() {
            ids.push(row.get_as::<i32>(0).unwrap());
        }
    }
    assert_eq!(sizes, vec![500, 500, 200]);
    assert_eq!(ids, (1..=1200).collect::<Vec<_>>());

    let log = server.log();
    // One fetch during execute, two more while iterating.
    assert_eq!(log.fetches, vec![500, 500, 500]);
    assert_eq!(log.closed_cursors, vec![1]);

    drop(rows);
    drop(session);
    assert!(server.join().malformed.is_empty());
}

#[test]
fn batch_count_is_rows_over_fetch_size_rounded_up() {
    for (total, fetch_size) in [(0, 100), (99, 100), (100, 100), (101, 100), (1000, 300)] {
        let (session, server) = common::connect(fetch_size);
        let sizes = batch_sizes(&session, &format!("select id, name from t_{}", total));
        assert_eq!(sizes.len(), usize::div_ceil(total, fetch_size), "{total}/{fetch_size}");
        assert_eq!(sizes.iter().sum::<usize>(), total);
        assert!(sizes.iter().all(|&n| n > 0 && n <= fetch_size));
        drop(session);
        let log = server.join();
        assert_eq!(log.closed_cursors.len(), 1);
        assert!(log.malformed.is_empty());
    }
}

#[test]
fn empty_result_closes_cursor_during_execute() {
    let (session, server) = common::connect(100);
    let cx = Cx::for_testing();
    let mut rows = session.execute(&cx, "select id, name from t_0", &[]).unwrap();
    assert!(rows.is_done());
    assert!(rows.next_batch(&cx).unwrap().is_none());
    assert_eq!(server.log().closed_cursors, vec![1]);
}

#[test]
fn next_row_walks_across_batches() {
    let (session, _server) = common::connect(100);
    let cx = Cx::for_testing();
    let mut rows = session.execute(&cx, "select id, name from t_250", &[]).unwrap();
    let mut count = 0;
    while let Some(row) = rows.next_row(&cx).unwrap() {
        count += 1;
        assert_eq!(
            row.get_by_name("name"),
            Some(&Value::Text(format!("name{}", count)))
        );
    }
    assert_eq!(count, 250);
}

#[test]
fn placeholders_are_interpolated() {
    let (session, server) = common::connect(100);
    let cx = Cx::for_testing();
    let mut rows = session
        .execute(
            &cx,
            "select id, name from t_5 where name = ?",
            &[Value::Text("o'brien".to_string())],
        )
        .unwrap();
    assert_eq!(rows.collect_rows(&cx).unwrap().len(), 5);
    assert_eq!(
        server.log().cursor_queries,
        vec!["select id, name from t_5 where name = 'o''brien'".to_string()]
    );
}

#[test]
fn explicit_close_releases_cursor() {
    let (session, server) = common::connect(100);
    let cx = Cx::for_testing();
    let mut rows = session.execute(&cx, "select id, name from t_1000", &[]).unwrap();
    assert!(rows.next_batch(&cx).unwrap().is_some());
    rows.close(&cx).unwrap();
    assert!(rows.is_done());
    assert!(rows.next_batch(&cx).unwrap().is_none());
    assert_eq!(server.log().closed_cursors, vec![1]);
}

#[test]
fn dropped_rows_cursor_is_closed_before_next_request() {
    let (session, server) = common::connect(100);
    let cx = Cx::for_testing();
    let mut rows = session.execute(&cx, "select id, name from t_1000", &[]).unwrap();
    assert!(rows.next_batch(&cx).unwrap().is_some());
    drop(rows);
    assert!(server.log().closed_cursors.is_empty());

    assert_eq!(session.exec(&cx, "update t set x = 1", &[]).unwrap(), 3);
    let log = server.log();
    assert_eq!(log.closed_cursors, vec![1]);
    assert_eq!(log.requests, vec!["cursor_open", "fetch", "cursor_close", "language"]);
}

// ============================================================================
// Language requests
// ============================================================================

#[test]
fn language_results_are_split_into_batches() {
    let (session, server) = common::connect(500);
    assert_eq!(batch_sizes(&session, "exec sp_rows 1200"), vec![500, 500, 200]);
    assert!(server.log().fetches.is_empty());
}

#[test]
fn exec_reports_rows_affected() {
    let (session, _server) = common::connect(100);
    let cx = Cx::for_testing();
    assert_eq!(session.exec(&cx, "update t set x = 1", &[]).unwrap(), 3);
    assert_eq!(session.exec(&cx, "print", &[]).unwrap(), 0);
    let rows = session.execute(&cx, "update t set x = 2", &[]).unwrap();
    assert_eq!(rows.rows_affected(), Some(3));
    assert!(rows.is_done());
}

#[test]
fn transaction_state_follows_done_tokens() {
    let (session, _server) = common::connect(100);
    let cx = Cx::for_testing();
    assert!(!session.in_transaction());
    session.exec(&cx, "begin tran", &[]).unwrap();
    assert!(session.in_transaction());
    session.exec(&cx, "commit tran", &[]).unwrap();
    assert!(!session.in_transaction());
}

#[test]
fn database_change_is_tracked() {
    let (session, _server) = common::connect(100);
    let cx = Cx::for_testing();
    session.exec(&cx, "use pubs2", &[]).unwrap();
    assert_eq!(session.server_info().database, "pubs2");
}

#[test]
fn server_error_keeps_session_ready() {
    let (session, server) = common::connect(100);
    let cx = Cx::for_testing();

    let err = session
        .execute(&cx, "select id from missing_table", &[])
        .unwrap_err();
    match &err {
        Error::Query(q) => {
            assert_eq!(q.kind, QueryErrorKind::NotFound);
            assert_eq!(q.number, Some(208));
            assert_eq!(q.severity, Some(16));
            assert_eq!(q.message, "missing not found.");
            assert_eq!(q.sql.as_deref(), Some("select id from missing_table"));
        }
        other => panic!("expected query error, got {other:?}"),
    }
    assert!(matches!(session.state(), SessionState::Ready));
    assert!(!session.is_bad());

    let err = session.exec(&cx, "exec missing_proc", &[]).unwrap_err();
    assert_eq!(err.server_code(), Some(208));

    assert_eq!(batch_sizes(&session, "select id, name from t_10"), vec![10]);
    drop(session);
    assert!(server.join().malformed.is_empty());
}

// ============================================================================
// Quarantine
// ============================================================================

#[test]
fn mid_response_hang_up_marks_session_bad() {
    let (session, server) = common::connect(100);
    let cx = Cx::for_testing();

    let err = session.exec(&cx, "hangup", &[]).unwrap_err();
    let cause = Arc::clone(err.bad_connection_cause().expect("bad connection"));
    assert!(matches!(
        &*cause,
        Error::Connection(e) if e.kind == ConnectionErrorKind::Disconnected
    ));
    assert!(session.is_bad());
    assert!(matches!(session.state(), SessionState::Bad(_)));

    for _ in 0..3 {
        let again = session
            .execute(&cx, "select id, name from t_10", &[])
            .unwrap_err();
        assert!(Arc::ptr_eq(again.bad_connection_cause().unwrap(), &cause));
    }
    assert!(Arc::ptr_eq(&session.bad_cause().unwrap(), &cause));

    session.close(&cx).unwrap();
    session.close(&cx).unwrap();
    let after_close = session.exec(&cx, "update t", &[]).unwrap_err();
    assert!(Arc::ptr_eq(after_close.bad_connection_cause().unwrap(), &cause));
    server.join();
}

#[test]
fn hang_up_during_fetch_marks_session_bad() {
    let script = Script {
        hang_up_on_fetch: Some(2),
        ..Script::default()
    };
    let (session, server) = common::connect_with(common::config(100), script);
    let cx = Cx::for_testing();

    let mut rows = session.execute(&cx, "select id, name from t_1000", &[]).unwrap();
    assert_eq!(rows.next_batch(&cx).unwrap().map(|b| b.len()), Some(100));
    let err = rows.next_batch(&cx).unwrap_err();
    assert!(err.is_bad_connection());
    assert!(session.is_bad());
    drop(rows);

    let again = session.exec(&cx, "update t", &[]).unwrap_err();
    assert!(Arc::ptr_eq(
        again.bad_connection_cause().unwrap(),
        err.bad_connection_cause().unwrap()
    ));
    server.join();
}

#[test]
fn fatal_severity_marks_session_bad() {
    let (session, server) = common::connect(100);
    let cx = Cx::for_testing();
    let err = session.exec(&cx, "fatal", &[]).unwrap_err();
    let cause = err.bad_connection_cause().expect("bad connection");
    assert!(matches!(
        &**cause,
        Error::Connection(e) if e.kind == ConnectionErrorKind::Aborted
    ));
    drop(session);
    server.join();
}

#[test]
fn cancel_while_waiting_marks_session_bad_promptly() {
    let (session, server) = common::connect(100);
    let cx = Cx::for_testing();
    let canceller = cx.clone();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        canceller.set_cancel_requested(true);
    });

    let start = Instant::now();
    let err = session.exec(&cx, "stall", &[]).unwrap_err();
    trigger.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(err.is_cancelled());
    let cause = Arc::clone(err.bad_connection_cause().expect("bad connection"));
    assert!(session.is_bad());

    let fresh = Cx::for_testing();
    let again = session.exec(&fresh, "update t", &[]).unwrap_err();
    assert!(Arc::ptr_eq(again.bad_connection_cause().unwrap(), &cause));
    session.close(&fresh).unwrap();

    let log = server.join();
    assert_eq!(log.attentions, 1);
    assert_eq!(log.languages, vec!["stall".to_string()]);
}

#[test]
fn cancel_before_send_keeps_session_ready() {
    let (session, server) = common::connect(100);
    let cx = Cx::for_testing();
    cx.set_cancel_requested(true);

    let err = session.exec(&cx, "update t set x = 1", &[]).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(matches!(session.state(), SessionState::Ready));
    assert!(!session.is_bad());

    let fresh = Cx::for_testing();
    assert_eq!(session.exec(&fresh, "update t set x = 1", &[]).unwrap(), 3);
    assert_eq!(server.log().languages.len(), 1);
}

// ============================================================================
// Lifecycle and sharing
// ============================================================================

#[test]
fn close_is_idempotent_and_final() {
    let (session, server) = common::connect(100);
    let cx = Cx::for_testing();
    session.close(&cx).unwrap();
    session.close(&cx).unwrap();
    assert!(matches!(session.state(), SessionState::Closed));

    let err = session.exec(&cx, "update t", &[]).unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(e) if e.kind == ConnectionErrorKind::Closed
    ));
    assert_eq!(server.join().logouts, 1);
}

#[test]
fn close_with_cancelled_context_still_logs_out() {
    let (session, server) = common::connect(100);
    let cx = Cx::for_testing();
    cx.set_cancel_requested(true);

    session.close(&cx).unwrap();
    assert!(matches!(session.state(), SessionState::Closed));
    assert_eq!(server.join().logouts, 1);
}

#[test]
fn close_aborts_exchange_stuck_in_another_thread() {
    let (session, server) = common::connect(100);
    let stuck = {
        let session = session.clone();
        thread::spawn(move || session.exec(&Cx::for_testing(), "stall", &[]))
    };
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    session.close(&Cx::for_testing()).unwrap();
    assert!(matches!(session.state(), SessionState::Closed));

    let err = stuck.join().unwrap().unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(err.is_bad_connection());
    assert!(matches!(
        session.exec(&Cx::for_testing(), "update t", &[]),
        Err(Error::BadConnection(_))
    ));

    let log = server.join();
    assert_eq!(log.languages, vec!["stall".to_string()]);
    assert_eq!(log.logouts, 0);
}

#[test]
fn concurrent_callers_never_interleave() {
    let (session, server) = common::connect(100);
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let session = session.clone();
            thread::spawn(move || {
                let cx = Cx::for_testing();
                for _ in 0..5 {
                    let mut rows = session
                        .execute(&cx, "select id, name from t_350", &[])
                        .unwrap();
                    let ids: Vec<i32> = rows
                        .collect_rows(&cx)
                        .unwrap()
                        .iter()
                        .map(|row| row.get_as::<i32>(0).unwrap())
                        .collect();
                    assert_eq!(ids, (1..=350).collect::<Vec<_>>());
                    assert_eq!(session.exec(&cx, "update t set x = 1", &[]).unwrap(), 3);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(matches!(session.state(), SessionState::Ready));

    session.close(&Cx::for_testing()).unwrap();
    let log = server.join();
    assert!(log.malformed.is_empty());
    assert_eq!(log.cursor_queries.len(), 20);
    assert_eq!(log.closed_cursors.len(), 20);
    assert_eq!(log.languages.len(), 20);
}
