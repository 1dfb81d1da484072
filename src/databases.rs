//! # Databases
//!
//! Desired-state management of databases inside a running primary instance.
//! Creation runs as a revertible task, so a failure while configuring a new
//! database drops it again.

use crate::config::ControlConfig;
use crate::db::{self, quote_ident, quote_literal};
use crate::error::{ControlError, ControlResult};
use crate::models::{ChangeState, DatabaseManifest, Instance, PresenceState};
use crate::orchestration::task::{Pipeline, Task};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use std::collections::BTreeMap;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A database as the server reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub owner: String,
    pub settings: BTreeMap<String, String>,
}

/// Bring a database to the state its manifest describes
pub async fn apply(
    instance: &Instance,
    config: &ControlConfig,
    database: &DatabaseManifest,
) -> ControlResult<Option<ChangeState>> {
    if instance.is_standby() {
        return Err(ControlError::InstanceReadOnly(instance.to_string()));
    }

    let conn = db::connect(instance, config, None).await?;
    // Shared with the create revert, which may need to reconnect
    let slot = Mutex::new(Some(conn));
    let result = apply_with(&slot, instance, config, database).await;
    if let Some(conn) = slot.lock().await.take() {
        db::close(conn).await;
    }
    result
}

async fn apply_with(
    slot: &Mutex<Option<PgConnection>>,
    instance: &Instance,
    config: &ControlConfig,
    database: &DatabaseManifest,
) -> ControlResult<Option<ChangeState>> {
    let name = database.name.as_str();
    let exists = {
        let mut guard = slot.lock().await;
        let conn = connection(&mut guard, instance, config).await?;
        exists_with(conn, name).await?
    };

    if database.state == PresenceState::Absent {
        if !exists {
            return Ok(None);
        }
        let mut guard = slot.lock().await;
        let conn = connection(&mut guard, instance, config).await?;
        drop_with(conn, name, database.force_drop).await?;
        return Ok(Some(ChangeState::Dropped));
    }

    if !exists {
        create(slot, instance, config, database).await?;
        return Ok(Some(ChangeState::Created));
    }

    info!(database = name, instance = %instance, "altering database");
    let mut guard = slot.lock().await;
    let conn = connection(&mut guard, instance, config).await?;
    let changed = alter(conn, database).await?;
    Ok(changed.then_some(ChangeState::Changed))
}

/// Whether the database exists
pub async fn exists(instance: &Instance, config: &ControlConfig, name: &str) -> ControlResult<bool> {
    let name = name.to_string();
    db::with_connection(instance, config, None, move |conn| {
        async move { exists_with(conn, &name).await }.boxed()
    })
    .await
}

/// Describe an existing database
pub async fn get(instance: &Instance, config: &ControlConfig, name: &str) -> ControlResult<DatabaseInfo> {
    let name = name.to_string();
    db::with_connection(instance, config, None, move |conn| {
        async move { describe(conn, &name).await }.boxed()
    })
    .await
}

/// Drop a database; it must exist
pub async fn drop(
    instance: &Instance,
    config: &ControlConfig,
    name: &str,
    force: bool,
) -> ControlResult<()> {
    if instance.is_standby() {
        return Err(ControlError::InstanceReadOnly(instance.to_string()));
    }
    let name = name.to_string();
    db::with_connection(instance, config, None, move |conn| {
        async move {
            if !exists_with(conn, &name).await? {
                return Err(ControlError::DatabaseNotFound(name));
            }
            drop_with(conn, &name, force).await
        }
        .boxed()
    })
    .await
}

async fn create(
    slot: &Mutex<Option<PgConnection>>,
    instance: &Instance,
    config: &ControlConfig,
    database: &DatabaseManifest,
) -> ControlResult<()> {
    let name = database.name.as_str();
    Pipeline::new(format!("creating database '{name}'"))
        .task(
            Task::new(format!("creating '{name}' database in {instance}"), move || {
                async move {
                    let mut guard = slot.lock().await;
                    let conn = connection(&mut guard, instance, config).await?;
                    let mut statement = format!("CREATE DATABASE {}", quote_ident(name));
                    if let Some(owner) = &database.owner {
                        statement.push_str(&format!(" OWNER {}", quote_ident(owner)));
                    }
                    sqlx::query(&statement).execute(&mut *conn).await?;
                    Ok(())
                }
                .boxed()
            })
            .with_revert(move |()| {
                async move {
                    let mut guard = slot.lock().await;
                    let conn = connection(&mut guard, instance, config).await?;
                    drop_with(conn, name, false).await
                }
                .boxed()
            }),
        )
        .task(Task::new(format!("configuring '{name}' database"), move || {
            async move {
                if database.settings.is_empty() {
                    return Ok(());
                }
                let mut guard = slot.lock().await;
                let conn = connection(&mut guard, instance, config).await?;
                configure(conn, name, &database.settings).await
            }
            .boxed()
        }))
        .run()
        .await?;
    Ok(())
}

/// Borrow the slot's connection, reconnecting when it is gone or broken
async fn connection<'g>(
    slot: &'g mut Option<PgConnection>,
    instance: &Instance,
    config: &ControlConfig,
) -> ControlResult<&'g mut PgConnection> {
    reuse_or_reconnect(
        slot,
        |conn| async move { conn.ping().await.is_ok() }.boxed(),
        || db::connect(instance, config, None),
    )
    .await
}

/// Keep the slot's connection when `healthy` accepts it, otherwise replace it
/// with a fresh one from `reconnect`
async fn reuse_or_reconnect<'g, C, H, R, Fut>(
    slot: &'g mut Option<C>,
    healthy: H,
    reconnect: R,
) -> ControlResult<&'g mut C>
where
    H: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, bool>,
    R: FnOnce() -> Fut,
    Fut: Future<Output = ControlResult<C>>,
{
    let usable = match slot.as_mut() {
        Some(conn) => healthy(conn).await,
        None => false,
    };
    if !usable {
        if slot.is_some() {
            warn!("database connection lost, reconnecting");
        }
        *slot = Some(reconnect().await?);
    }
    slot.as_mut()
        .ok_or_else(|| ControlError::system("no database connection available"))
}

async fn exists_with(conn: &mut PgConnection, name: &str) -> ControlResult<bool> {
    let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

async fn describe(conn: &mut PgConnection, name: &str) -> ControlResult<DatabaseInfo> {
    let owner: Option<String> = sqlx::query_scalar(
        "SELECT pg_catalog.pg_get_userbyid(datdba) FROM pg_database WHERE datname = $1",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    let owner = owner.ok_or_else(|| ControlError::DatabaseNotFound(name.to_string()))?;

    let entries: Vec<String> = sqlx::query_scalar(
        "SELECT unnest(s.setconfig) FROM pg_db_role_setting s \
         JOIN pg_database d ON d.oid = s.setdatabase \
         WHERE d.datname = $1 AND s.setrole = 0",
    )
    .bind(name)
    .fetch_all(&mut *conn)
    .await?;
    let settings = entries
        .iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Ok(DatabaseInfo {
        name: name.to_string(),
        owner,
        settings,
    })
}

/// Apply owner and settings; true when anything changed
async fn alter(conn: &mut PgConnection, database: &DatabaseManifest) -> ControlResult<bool> {
    let before = describe(conn, &database.name).await?;
    let owner = database
        .owner
        .as_deref()
        .map(quote_ident)
        .unwrap_or_else(|| "CURRENT_USER".to_string());
    sqlx::query(&format!(
        "ALTER DATABASE {} OWNER TO {owner}",
        quote_ident(&database.name)
    ))
    .execute(&mut *conn)
    .await?;
    configure(conn, &database.name, &database.settings).await?;
    let after = describe(conn, &database.name).await?;
    Ok(after != before)
}

async fn configure(
    conn: &mut PgConnection,
    name: &str,
    settings: &BTreeMap<String, String>,
) -> ControlResult<()> {
    let mut tx = conn.begin().await?;
    for (key, value) in settings {
        sqlx::query(&format!(
            "ALTER DATABASE {} SET {} TO {}",
            quote_ident(name),
            quote_ident(key),
            quote_literal(value)
        ))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn drop_with(conn: &mut PgConnection, name: &str, force: bool) -> ControlResult<()> {
    info!(database = name, "dropping database");
    let mut statement = format!("DROP DATABASE {}", quote_ident(name));
    if force {
        if db::server_version_num(conn).await? < 130_000 {
            return Err(ControlError::Unsupported(
                "force drop requires PostgreSQL 13 or later".to_string(),
            ));
        }
        statement.push_str(" WITH (FORCE)");
    }
    sqlx::query(&statement).execute(&mut *conn).await?;
    Ok(())
}
