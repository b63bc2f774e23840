//! End-to-end tests: seed an in-memory database pair, compile a `PqlQuery`,
//! execute it, and check the decoded rows. `run_full_pql_query` covers the
//! scenarios that only need to know compilation+execution succeeds;
//! `run_query_against` is used directly wherever a test needs seeded data
//! or assertions on row order/content.

use crate::db::migrations::setup_test_databases;
use crate::pql::model::{
    AndOperator, EntityType, InBookmarks, InBookmarksArgs, InPaths, InPathsArgs, MatchPath,
    MatchPathArgs, MatchText, MatchTextArgs, NotOperator, OrOperator, OrderDirection, PqlQuery,
    QueryElement, ScalarValue, SortableOptions, TypeIn, TypeInArgs,
};

use super::filters::test_support::{run_full_pql_query, run_query_against};

async fn seed_file(
    conn: &mut sqlx::SqliteConnection,
    id: i64,
    item_id: i64,
    sha256: &str,
    path: &str,
    filename: &str,
    last_modified: &str,
) {
    sqlx::query(
        "INSERT INTO files (id, item_id, sha256, path, filename, last_modified) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(item_id)
    .bind(sha256)
    .bind(path)
    .bind(filename)
    .bind(last_modified)
    .execute(&mut *conn)
    .await
    .expect("seed file");
}

async fn seed_item(conn: &mut sqlx::SqliteConnection, id: i64, sha256: &str, item_type: &str) {
    sqlx::query("INSERT INTO items (id, sha256, type) VALUES (?, ?, ?)")
        .bind(id)
        .bind(sha256)
        .bind(item_type)
        .execute(&mut *conn)
        .await
        .expect("seed item");
}

async fn seed_bookmark(
    conn: &mut sqlx::SqliteConnection,
    sha256: &str,
    namespace: &str,
    user: &str,
    time_added: &str,
) {
    sqlx::query(
        "INSERT INTO user_data.bookmarks (sha256, namespace, user, time_added) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(sha256)
    .bind(namespace)
    .bind(user)
    .bind(time_added)
    .execute(&mut *conn)
    .await
    .expect("seed bookmark");
}

async fn seed_setter(conn: &mut sqlx::SqliteConnection, id: i64, setter_type: &str, name: &str) {
    sqlx::query("INSERT INTO setters (id, type, name) VALUES (?, ?, ?)")
        .bind(id)
        .bind(setter_type)
        .bind(name)
        .execute(&mut *conn)
        .await
        .expect("seed setter");
}

async fn seed_item_data(
    conn: &mut sqlx::SqliteConnection,
    id: i64,
    item_id: i64,
    setter_id: i64,
    data_type: &str,
) {
    sqlx::query("INSERT INTO item_data (id, item_id, setter_id, data_type) VALUES (?, ?, ?, ?)")
        .bind(id)
        .bind(item_id)
        .bind(setter_id)
        .bind(data_type)
        .execute(&mut *conn)
        .await
        .expect("seed item_data");
}

async fn seed_extracted_text(conn: &mut sqlx::SqliteConnection, id: i64, text: &str) {
    sqlx::query(
        "INSERT INTO extracted_text (id, text, text_length) VALUES (?, ?, ?)",
    )
    .bind(id)
    .bind(text)
    .bind(text.len() as i64)
    .execute(&mut *conn)
    .await
    .expect("seed extracted_text");
}

fn sortable(order_by: bool, priority: i32, direction: OrderDirection) -> SortableOptions {
    SortableOptions {
        order_by,
        direction,
        priority,
        ..SortableOptions::default()
    }
}

#[tokio::test]
async fn empty_query_returns_every_row_ordered_by_last_modified_desc() {
    let mut dbs = setup_test_databases().await;
    seed_item(&mut dbs.index_conn, 1, "sha-old", "image/png").await;
    seed_item(&mut dbs.index_conn, 2, "sha-new", "image/png").await;
    seed_file(
        &mut dbs.index_conn,
        1,
        1,
        "sha-old",
        "/movies/old.png",
        "old.png",
        "2024-01-01T00:00:00",
    )
    .await;
    seed_file(
        &mut dbs.index_conn,
        2,
        2,
        "sha-new",
        "/movies/new.png",
        "new.png",
        "2024-06-01T00:00:00",
    )
    .await;

    let rows = run_query_against(&mut dbs.index_conn, PqlQuery::default())
        .await
        .expect("query runs");

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["path"], "/movies/new.png");
    assert_eq!(rows[1]["path"], "/movies/old.png");
}

#[tokio::test]
async fn path_prefix_filter_matches_only_the_prefixed_subset() {
    let mut dbs = setup_test_databases().await;
    seed_item(&mut dbs.index_conn, 1, "sha-a", "image/png").await;
    seed_item(&mut dbs.index_conn, 2, "sha-b", "image/png").await;
    seed_item(&mut dbs.index_conn, 3, "sha-c", "image/png").await;
    seed_file(&mut dbs.index_conn, 1, 1, "sha-a", "/movies/a.png", "a.png", "2024-01-01").await;
    seed_file(&mut dbs.index_conn, 2, 2, "sha-b", "/movies/b.png", "b.png", "2024-01-02").await;
    seed_file(&mut dbs.index_conn, 3, 3, "sha-c", "/books/c.png", "c.png", "2024-01-03").await;

    let filter = QueryElement::InPaths(InPaths {
        in_paths: InPathsArgs {
            in_paths: vec!["/movies/".to_string()],
        },
    });
    let rows = run_full_pql_query(filter, EntityType::File)
        .await
        .expect("query runs");

    assert_eq!(rows.len(), 2);
    let paths: Vec<_> = rows.iter().map(|r| r["path"].as_str().unwrap()).collect();
    assert!(paths.contains(&"/movies/a.png"));
    assert!(paths.contains(&"/movies/b.png"));
}

#[tokio::test]
async fn and_not_excludes_the_negated_type() {
    let mut dbs = setup_test_databases().await;
    seed_item(&mut dbs.index_conn, 1, "sha-a", "image/png").await;
    seed_item(&mut dbs.index_conn, 2, "sha-b", "video/mp4").await;
    seed_item(&mut dbs.index_conn, 3, "sha-c", "image/jpeg").await;
    seed_file(&mut dbs.index_conn, 1, 1, "sha-a", "/movies/a.png", "a.png", "2024-01-01").await;
    seed_file(&mut dbs.index_conn, 2, 2, "sha-b", "/movies/b.mp4", "b.mp4", "2024-01-02").await;
    seed_file(&mut dbs.index_conn, 3, 3, "sha-c", "/movies/c.jpg", "c.jpg", "2024-01-03").await;

    let filter = QueryElement::And(AndOperator {
        and_: vec![
            QueryElement::InPaths(InPaths {
                in_paths: InPathsArgs {
                    in_paths: vec!["/movies/".to_string()],
                },
            }),
            QueryElement::Not(NotOperator {
                not_: Box::new(QueryElement::TypeIn(TypeIn {
                    type_in: TypeInArgs {
                        type_in: vec!["video".to_string()],
                    },
                })),
            }),
        ],
    });
    let rows = run_full_pql_query(filter, EntityType::File)
        .await
        .expect("query runs");

    assert_eq!(rows.len(), 2);
    let paths: Vec<_> = rows.iter().map(|r| r["path"].as_str().unwrap()).collect();
    assert!(!paths.contains(&"/movies/b.mp4"));
}

#[tokio::test]
async fn or_of_elided_children_matches_nothing() {
    // Or[TypeIn([]), TypeIn([])] both elide, so the Or must compile to an
    // empty-result node rather than vanish and return every row.
    let mut dbs = setup_test_databases().await;
    seed_item(&mut dbs.index_conn, 1, "sha-a", "image/png").await;
    seed_file(&mut dbs.index_conn, 1, 1, "sha-a", "/movies/a.png", "a.png", "2024-01-01").await;

    let filter = QueryElement::Or(OrOperator {
        or_: vec![
            QueryElement::TypeIn(TypeIn {
                type_in: TypeInArgs { type_in: vec![] },
            }),
            QueryElement::TypeIn(TypeIn {
                type_in: TypeInArgs { type_in: vec![] },
            }),
        ],
    });
    let rows = run_full_pql_query(filter, EntityType::File)
        .await
        .expect("query runs");

    assert!(rows.is_empty());
}

#[tokio::test]
async fn or_with_two_ranking_filters_orders_by_priority() {
    let mut dbs = setup_test_databases().await;
    seed_item(&mut dbs.index_conn, 1, "sha-alpha", "image/png").await;
    seed_item(&mut dbs.index_conn, 2, "sha-beta", "image/png").await;
    seed_file(
        &mut dbs.index_conn,
        1,
        1,
        "sha-alpha",
        "/movies/alpha.png",
        "alpha.png",
        "2024-01-01",
    )
    .await;
    seed_file(
        &mut dbs.index_conn,
        2,
        2,
        "sha-beta",
        "/movies/beta.png",
        "beta.png",
        "2024-01-02",
    )
    .await;
    seed_bookmark(&mut dbs.index_conn, "sha-alpha", "ns_a", "tester", "2024-01-10").await;
    seed_bookmark(&mut dbs.index_conn, "sha-beta", "ns_b", "tester", "2024-01-05").await;

    let higher_priority = QueryElement::InBookmarks(InBookmarks {
        sort: sortable(true, 5, OrderDirection::Asc),
        in_bookmarks: InBookmarksArgs {
            filter: true,
            namespaces: vec!["ns_a".to_string()],
            sub_ns: false,
            user: "tester".to_string(),
            include_wildcard: false,
        },
    });
    let lower_priority = QueryElement::InBookmarks(InBookmarks {
        sort: sortable(true, 1, OrderDirection::Asc),
        in_bookmarks: InBookmarksArgs {
            filter: true,
            namespaces: vec!["ns_b".to_string()],
            sub_ns: false,
            user: "tester".to_string(),
            include_wildcard: false,
        },
    });

    let mut query = PqlQuery {
        query: Some(QueryElement::Or(OrOperator {
            or_: vec![higher_priority, lower_priority],
        })),
        ..PqlQuery::default()
    };
    query.order_by = vec![];

    let rows = run_query_against(&mut dbs.index_conn, query)
        .await
        .expect("query runs");

    assert_eq!(rows.len(), 2);
    // The priority-5 filter (ns_a/alpha) only has a real rank for the alpha
    // row; beta's rank for that filter is NULL and NullOrdering::Last pushes
    // it after, so alpha must come first regardless of the priority-1 filter.
    assert_eq!(rows[0]["path"], "/movies/alpha.png");
    assert_eq!(rows[1]["path"], "/movies/beta.png");
}

#[tokio::test]
async fn cursor_bound_excludes_rows_at_or_before_the_cursor() {
    let mut dbs = setup_test_databases().await;
    for (id, sha, path, time_added) in [
        (1i64, "sha-a", "/movies/a.png", "2024-01-01"),
        (2, "sha-b", "/movies/b.png", "2024-01-02"),
        (3, "sha-c", "/movies/c.png", "2024-01-03"),
    ] {
        seed_item(&mut dbs.index_conn, id, sha, "image/png").await;
        seed_file(&mut dbs.index_conn, id, id, sha, path, path, "2024-01-01").await;
        seed_bookmark(&mut dbs.index_conn, sha, "ns", "tester", time_added).await;
    }

    let mut sort = sortable(true, 0, OrderDirection::Asc);
    sort.gt = Some(ScalarValue::String("2024-01-01".to_string()));
    let filter = QueryElement::InBookmarks(InBookmarks {
        sort,
        in_bookmarks: InBookmarksArgs {
            filter: true,
            namespaces: vec!["ns".to_string()],
            sub_ns: false,
            user: "tester".to_string(),
            include_wildcard: false,
        },
    });

    let rows = run_full_pql_query(filter, EntityType::File)
        .await
        .expect("query runs");

    assert_eq!(rows.len(), 2);
    let paths: Vec<_> = rows.iter().map(|r| r["path"].as_str().unwrap()).collect();
    assert!(!paths.contains(&"/movies/a.png"));
}

#[tokio::test]
async fn text_mode_match_returns_a_highlighted_snippet() {
    let mut dbs = setup_test_databases().await;
    seed_item(&mut dbs.index_conn, 1, "sha-a", "image/png").await;
    seed_file(&mut dbs.index_conn, 1, 1, "sha-a", "/movies/a.png", "a.png", "2024-01-01").await;
    seed_setter(&mut dbs.index_conn, 1, "ocr", "ocr-engine").await;
    seed_item_data(&mut dbs.index_conn, 1, 1, 1, "text").await;
    seed_extracted_text(&mut dbs.index_conn, 1, "a needle hiding in the haystack").await;

    let filter = QueryElement::MatchText(MatchText {
        sort: SortableOptions::default(),
        match_text: MatchTextArgs {
            r#match: "needle".to_string(),
            filter_only: false,
            setters: vec![],
            languages: vec![],
            min_language_confidence: None,
            min_confidence: None,
            raw_fts5_match: true,
            min_length: None,
            max_length: None,
            select_snippet_as: Some("snippet".to_string()),
            s_max_len: 30,
            s_ellipsis: "...".to_string(),
            s_start_tag: "<b>".to_string(),
            s_end_tag: "</b>".to_string(),
        },
    });

    let rows = run_full_pql_query(filter, EntityType::Text)
        .await
        .expect("query runs");

    assert_eq!(rows.len(), 1);
    let snippet = rows[0]["snippet"].as_str().expect("snippet is a string");
    assert!(snippet.contains("<b>"));
}

#[tokio::test]
async fn match_path_filename_only_matches_on_filename_not_directory() {
    let mut dbs = setup_test_databases().await;
    seed_item(&mut dbs.index_conn, 1, "sha-a", "image/png").await;
    seed_file(
        &mut dbs.index_conn,
        1,
        1,
        "sha-a",
        "/movies/report.png",
        "report.png",
        "2024-01-01",
    )
    .await;

    let filter = QueryElement::MatchPath(MatchPath {
        sort: SortableOptions::default(),
        match_path: MatchPathArgs {
            r#match: "report".to_string(),
            filename_only: true,
            raw_fts5_match: true,
        },
    });
    let rows = run_full_pql_query(filter, EntityType::File)
        .await
        .expect("query runs");

    assert_eq!(rows.len(), 1);
}
