// Embedded schema migrations for the relay queue database
//
// SQL files under `migrations/` are compiled into the binary and applied on
// every open; refinery records what already ran in its own history table.

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Apply all pending migrations to the given connection
pub fn run_migrations(conn: &mut rusqlite::Connection) -> Result<usize, refinery::Error> {
    let report = embedded::migrations::runner().run(conn)?;
    Ok(report.applied_migrations().len())
}
