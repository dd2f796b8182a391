//! Query building and execution against the seeded catalog.

mod common;

use common::{memory_executor, seed_catalog};
use serde_json::{json, Value};
use trellis_orm::{OrmError, SqliteExecutor, TableContext};

async fn tracks() -> TableContext<SqliteExecutor> {
    let executor = memory_executor().await;
    seed_catalog(&executor).await;
    TableContext::new(executor, "Track")
}

#[tokio::test]
async fn filter_by_composer() {
    let rows = tracks()
        .await
        .filter(|m| m.col("Composer").equals("AC/DC"))
        .unwrap()
        .select()
        .await
        .unwrap();
    assert_eq!(rows.len(), 8);
    assert!(rows.iter().all(|r| r["Composer"] == json!("AC/DC")));
}

#[tokio::test]
async fn chained_and_narrows_the_set() {
    let rows = tracks()
        .await
        .filter(|m| {
            m.col("Composer")
                .equals("AC/DC")
                .and(|m| m.col("Bytes").greater_than(7_032_162_i64))
        })
        .unwrap()
        .select()
        .await
        .unwrap();
    assert_eq!(rows.len(), 7);
    assert!(rows
        .iter()
        .all(|r| r["Composer"] == json!("AC/DC")
            && r["Bytes"].as_i64().unwrap() > 7_032_162));
}

#[tokio::test]
async fn sort_descending_is_non_increasing() {
    let rows = tracks()
        .await
        .filter(|m| m.col("Composer").equals("AC/DC"))
        .unwrap()
        .order_by(|s| s.desc("Bytes"))
        .select()
        .await
        .unwrap();
    assert_eq!(rows.len(), 8);
    let bytes: Vec<i64> = rows.iter().map(|r| r["Bytes"].as_i64().unwrap()).collect();
    assert!(bytes.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn limit_and_offset_page_through() {
    let ctx = tracks().await.order_by(|s| s.asc("TrackId"));
    let page = ctx
        .limit(3)
        .unwrap()
        .offset(3)
        .unwrap()
        .select()
        .await
        .unwrap();
    assert_eq!(page.len(), 3);
    assert_eq!(page[0]["TrackId"], json!(4));
    assert_eq!(page[2]["TrackId"], json!(6));
}

#[tokio::test]
async fn offset_without_limit_is_rejected() {
    let err = tracks()
        .await
        .offset(5)
        .unwrap()
        .select()
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::OffsetWithoutLimit));
}

#[tokio::test]
async fn negative_bounds_are_rejected() {
    let ctx = tracks().await;
    assert!(matches!(ctx.limit(-1), Err(OrmError::NegativeBound(-1))));
    assert!(matches!(ctx.offset(-3), Err(OrmError::NegativeBound(-3))));
}

#[tokio::test]
async fn projection_relabels_columns() {
    let rows = tracks()
        .await
        .filter(|m| m.col("Name").equals("Overdose"))
        .unwrap()
        .project(|p| p.col("Name").col_as("Bytes", "size"))
        .unwrap()
        .select()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["Name"], json!("Overdose"));
    assert_eq!(rows[0]["size"], json!(13_955_756));
    assert!(!rows[0].contains_key("Bytes"));
    assert!(!rows[0].contains_key("TrackId"));
}

#[tokio::test]
async fn grouping_counts_per_composer() {
    let rows = tracks()
        .await
        .group_by(|g| g.col("Composer").count_all("n").total("Bytes", "bytes_total"))
        .unwrap()
        .select()
        .await
        .unwrap();
    let acdc = rows
        .iter()
        .find(|r| r["Composer"] == json!("AC/DC"))
        .expect("AC/DC group missing");
    assert_eq!(acdc["n"], json!(8));
    assert!(acdc["bytes_total"].as_f64().unwrap() > 0.0);
    // The NULL-composer track forms its own group.
    assert!(rows.iter().any(|r| r["Composer"] == Value::Null));
}

#[tokio::test]
async fn projection_and_grouping_are_mutually_exclusive() {
    let ctx = tracks().await;
    let grouped = ctx.group_by(|g| g.col("Composer").count_all("n")).unwrap();
    assert!(matches!(
        grouped.project(|p| p.col("Name")),
        Err(OrmError::ProjectionConflict)
    ));
    let projected = ctx.project(|p| p.col("Name")).unwrap();
    assert!(matches!(
        projected.group_by(|g| g.col("Composer")),
        Err(OrmError::ProjectionConflict)
    ));
}

#[tokio::test]
async fn count_shares_the_filter() {
    let count = tracks()
        .await
        .filter(|m| m.col("Composer").equals("AC/DC"))
        .unwrap()
        .count()
        .await
        .unwrap();
    assert_eq!(count, 8);
}

#[tokio::test]
async fn unknown_filter_column_fails_descriptively() {
    let err = tracks()
        .await
        .filter(|m| m.col("Compositor").equals("AC/DC"))
        .unwrap()
        .select()
        .await
        .unwrap_err();
    match err {
        OrmError::UnknownColumn { table, column } => {
            assert_eq!(table, "Track");
            assert_eq!(column, "Compositor");
        }
        other => panic!("expected UnknownColumn, got {other}"),
    }
}

#[tokio::test]
async fn unknown_sort_column_fails() {
    let err = tracks()
        .await
        .order_by(|s| s.asc("NoSuchColumn"))
        .select()
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::UnknownColumn { .. }));
}

#[tokio::test]
async fn forks_stay_independent() {
    let base = tracks().await;
    let filtered = base
        .filter(|m| m.col("Composer").equals("AC/DC"))
        .unwrap();
    let sorted = base.order_by(|s| s.desc("Bytes"));

    // The parent is untouched by either fork.
    assert_eq!(base.select().await.unwrap().len(), 10);

    // The filtered fork carries no sort; the sorted fork carries no filter.
    assert_eq!(filtered.select().await.unwrap().len(), 8);
    let all_sorted = sorted.select().await.unwrap();
    assert_eq!(all_sorted.len(), 10);
    let bytes: Vec<i64> = all_sorted
        .iter()
        .map(|r| r["Bytes"].as_i64().unwrap())
        .collect();
    assert!(bytes.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn is_in_matches_listed_values() {
    let rows = tracks()
        .await
        .filter(|m| m.col("Composer").is_in(vec!["F. Baltes", "nobody"]))
        .unwrap()
        .select()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["Name"], json!("Fast As a Shark"));
}

#[tokio::test]
async fn empty_is_in_matches_nothing() {
    let rows = tracks()
        .await
        .filter(|m| m.col("Composer").is_in(Vec::<String>::new()))
        .unwrap()
        .select()
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn null_comparisons_use_is_forms() {
    let ctx = tracks().await;
    let missing = ctx
        .filter(|m| m.col("Composer").equals(Option::<String>::None))
        .unwrap()
        .select()
        .await
        .unwrap();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0]["Name"], json!("Princess of the Dawn"));

    let present = ctx
        .filter(|m| m.col("Composer").not().equals(Option::<String>::None))
        .unwrap()
        .select()
        .await
        .unwrap();
    assert_eq!(present.len(), 9);
}

#[tokio::test]
async fn contains_matches_substrings() {
    let rows = tracks()
        .await
        .filter(|m| m.col("Name").contains("Rock"))
        .unwrap()
        .select()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["Name"], json!("Let There Be Rock"));
}

#[tokio::test]
async fn or_groups_parenthesize() {
    // Composer = 'F. Baltes' OR (Bytes > 14000000 AND GenreId = 1)
    let rows = tracks()
        .await
        .filter(|m| {
            m.col("Composer").equals("F. Baltes").or(|m| {
                m.col("Bytes")
                    .greater_than(14_000_000_i64)
                    .and(|m| m.col("GenreId").equals(1_i64))
            })
        })
        .unwrap()
        .order_by(|s| s.asc("TrackId"))
        .select()
        .await
        .unwrap();
    let names: Vec<&str> = rows
        .iter()
        .map(|r| r["Name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Riff Raff", "Fast As a Shark"]);
}

#[tokio::test]
async fn schema_reports_identity_metadata() {
    let descriptors = tracks().await.schema().await.unwrap();
    let pk = descriptors.iter().find(|c| c.name == "TrackId").unwrap();
    assert!(pk.is_primary_key);
    assert!(pk.is_auto_increment);
    let name = descriptors.iter().find(|c| c.name == "Name").unwrap();
    assert!(name.not_null);
    assert!(!name.is_primary_key);
}
