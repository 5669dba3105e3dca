use super::{TelemetryError, TimingEntry, UnitTiming};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct SQLiteSink {
    connection: Connection,
}

impl SQLiteSink {
    pub fn load(path: &Path) -> Result<Self, TelemetryError> {
        let connection = Connection::open(path)?;
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(TelemetryError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(Self { connection })
    }

    pub fn phase(&mut self, entry: &TimingEntry) -> Result<(), TelemetryError> {
        self.connection
            .prepare_cached(
                "insert into phases
                 (label, tag, timestamp_abs, timestamp_rel)
                 values (?, ?, ?, ?)",
            )?
            .execute(params![
                entry.label,
                entry.tag,
                entry.timestamp_abs,
                entry.timestamp_rel
            ])?;

        Ok(())
    }

    pub fn units(&mut self, units: &[UnitTiming]) -> Result<(), TelemetryError> {
        let tx = self.connection.transaction()?;

        for unit in units {
            tx.prepare_cached(
                "insert into units
                 (uid, name, tag, state, runtime)
                 values (?, ?, ?, ?, ?)",
            )?
            .execute(params![
                unit.uid,
                unit.name,
                unit.tag,
                unit.state as u8,
                unit.runtime
            ])?;
        }
        tx.commit()?;

        debug!("Stored {} unit timings", units.len());

        Ok(())
    }

    pub fn close(mut self) -> Result<(), TelemetryError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                return Err(TelemetryError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }
}

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists phases (
    id integer primary key,
    label text not null,
    tag text not null,
    timestamp_abs real not null,
    timestamp_rel real not null
);",
    "create table if not exists units (
    id integer primary key,
    uid text not null,
    name text not null,
    tag text not null,
    state tinyint not null,
    runtime real not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
