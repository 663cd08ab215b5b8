use parley_identity::{create_user, issue_token, resolve, set_active, IdentityError, TokenSecret};
use parley_types::UserId;
use rusqlite::Connection;

fn test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    parley_db::run_migrations(&conn).expect("migrations should succeed");
    conn
}

#[test]
fn resolves_active_user() {
    let conn = test_db();
    let secret = TokenSecret::derive("resolve-test");
    create_user(&conn, UserId(1), "alice").expect("should create alice");

    let token = issue_token(UserId(1), &secret, 60);
    let identity = resolve(&conn, &token, &secret).expect("token should resolve");

    assert_eq!(identity.id, UserId(1));
    assert_eq!(identity.username, "alice");
    assert!(identity.active);
}

#[test]
fn unknown_user_is_rejected() {
    let conn = test_db();
    let secret = TokenSecret::derive("resolve-test");

    let token = issue_token(UserId(99), &secret, 60);
    let err = resolve(&conn, &token, &secret).expect_err("unknown user must fail");

    assert!(matches!(err, IdentityError::UnknownUser(UserId(99))));
    assert!(err.is_rejection());
}

#[test]
fn inactive_user_is_rejected() {
    let conn = test_db();
    let secret = TokenSecret::derive("resolve-test");
    create_user(&conn, UserId(2), "bob").expect("should create bob");
    assert!(set_active(&conn, UserId(2), false).expect("update should succeed"));

    let token = issue_token(UserId(2), &secret, 60);
    let err = resolve(&conn, &token, &secret).expect_err("inactive user must fail");
    assert!(matches!(err, IdentityError::Inactive(UserId(2))));
}

#[test]
fn database_failure_is_not_a_rejection() {
    // No migrations: the users table does not exist.
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    let secret = TokenSecret::derive("resolve-test");

    let token = issue_token(UserId(1), &secret, 60);
    let err = resolve(&conn, &token, &secret).expect_err("missing table must fail");
    assert!(matches!(err, IdentityError::Database(_)));
    assert!(!err.is_rejection());
}
