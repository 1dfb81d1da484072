//! Scoped SQL connections to a managed instance.
//!
//! Connections go through the instance's unix socket as the configured
//! superuser. Every helper closes the connection before returning, on success
//! and on error alike.

use crate::config::ControlConfig;
use crate::error::ControlResult;
use crate::models::Instance;
use futures::future::BoxFuture;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use tracing::{debug, warn};

/// Connect to `dbname` (default `postgres`) on the instance
pub async fn connect(
    instance: &Instance,
    config: &ControlConfig,
    dbname: Option<&str>,
) -> ControlResult<PgConnection> {
    let surole = &config.postgresql.surole;
    let mut options = PgConnectOptions::new()
        .socket(&instance.socket_directory)
        .port(instance.port)
        .username(&surole.name)
        .database(dbname.unwrap_or("postgres"))
        .application_name("pgcontrol");
    if let Some(password) = &surole.password {
        options = options.password(password);
    }
    debug!(instance = %instance, database = dbname.unwrap_or("postgres"), "connecting");
    Ok(options.connect().await?)
}

/// Open a connection, run `f` with it, and close it
pub async fn with_connection<T, F>(
    instance: &Instance,
    config: &ControlConfig,
    dbname: Option<&str>,
    f: F,
) -> ControlResult<T>
where
    F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, ControlResult<T>>,
{
    let mut conn = connect(instance, config, dbname).await?;
    let result = f(&mut conn).await;
    close(conn).await;
    result
}

/// Close a connection, logging instead of failing
pub async fn close(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        warn!(error = %e, "failed to close connection cleanly");
    }
}

/// `server_version_num` of the connected server, e.g. `160002`
pub async fn server_version_num(conn: &mut PgConnection) -> ControlResult<i32> {
    let version: String = sqlx::query_scalar("SELECT current_setting('server_version_num')")
        .fetch_one(&mut *conn)
        .await?;
    version.trim().parse().map_err(|_| {
        crate::error::ControlError::system(format!("unexpected server_version_num '{version}'"))
    })
}

/// Quote an SQL identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote an SQL string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
