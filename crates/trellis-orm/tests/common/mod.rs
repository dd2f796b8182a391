//! Shared fixtures for integration tests: an in-memory SQLite executor and
//! a small music-catalog dataset.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use serde_json::Value;
use trellis_orm::{Record, SqliteExecutor};

/// Connects an isolated in-memory database.
pub async fn memory_executor() -> SqliteExecutor {
    SqliteExecutor::connect(":memory:")
        .await
        .expect("failed to create in-memory SQLite pool")
}

/// Builds a [`Record`] from a `json!` object literal.
pub fn record(value: Value) -> Record {
    value.as_object().expect("fixture rows are objects").clone()
}

/// Creates and seeds the catalog schema.
///
/// Track data is arranged so that exactly 8 tracks have Composer `AC/DC`,
/// of which exactly 7 have `Bytes > 7032162` (one sits on the boundary),
/// one track has a NULL composer, and albums 1/2/3 carry 5/3/2 tracks.
pub async fn seed_catalog(executor: &SqliteExecutor) {
    let statements = [
        "CREATE TABLE Artist (
            ArtistId INTEGER PRIMARY KEY AUTOINCREMENT,
            Name TEXT
        )",
        "CREATE TABLE Album (
            AlbumId INTEGER PRIMARY KEY AUTOINCREMENT,
            Title TEXT NOT NULL,
            ArtistId INTEGER NOT NULL
        )",
        "CREATE TABLE Genre (
            GenreId INTEGER PRIMARY KEY AUTOINCREMENT,
            Name TEXT
        )",
        "CREATE TABLE Track (
            TrackId INTEGER PRIMARY KEY AUTOINCREMENT,
            Name TEXT NOT NULL,
            AlbumId INTEGER,
            GenreId INTEGER,
            Composer TEXT,
            Milliseconds INTEGER,
            Bytes INTEGER
        )",
        "INSERT INTO Artist (Name) VALUES ('AC/DC'), ('Accept')",
        "INSERT INTO Album (Title, ArtistId) VALUES
            ('Let There Be Rock', 1),
            ('Powerage', 1),
            ('Restless and Wild', 2)",
        "INSERT INTO Genre (Name) VALUES ('Rock'), ('Metal')",
        "INSERT INTO Track (Name, AlbumId, GenreId, Composer, Milliseconds, Bytes) VALUES
            ('Go Down', 1, 1, 'AC/DC', 331180, 10847611),
            ('Dog Eat Dog', 1, 1, 'AC/DC', 215196, 7032162),
            ('Let There Be Rock', 1, 1, 'AC/DC', 366654, 12021261),
            ('Bad Boy Boogie', 1, 1, 'AC/DC', 267728, 10223180),
            ('Overdose', 1, 1, 'AC/DC', 369319, 13955756),
            ('Riff Raff', 2, 1, 'AC/DC', 310657, 14590171),
            ('Sin City', 2, 1, 'AC/DC', 284891, 11544607),
            ('Down Payment Blues', 2, 1, 'AC/DC', 363822, 11960832),
            ('Fast As a Shark', 3, 2, 'F. Baltes', 230619, 3990994),
            ('Princess of the Dawn', 3, 2, NULL, 375418, 12369849)",
    ];
    for sql in statements {
        sqlx::query(sql)
            .execute(executor.pool())
            .await
            .expect("failed to seed catalog");
    }
}

/// A fresh single-column identity table for mutation tests.
pub async fn seed_notes(executor: &SqliteExecutor) {
    sqlx::query(
        "CREATE TABLE Note (
            NoteId INTEGER PRIMARY KEY AUTOINCREMENT,
            StringCol TEXT,
            NumberCol INTEGER
        )",
    )
    .execute(executor.pool())
    .await
    .expect("failed to create Note table");
}
