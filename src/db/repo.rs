use super::model::{MailingListRow, PersonRow};
use crate::error::{Result, SyncError};
use crate::model::{MailingList, Subscriber};
use crate::result::SyncResult;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

const LIST_COLUMNS: &str =
    "id, name, remote_list_id, remote_api_key, syncing, last_synced_at, sync_result";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let mut options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .foreign_keys(true);
    if !normalized.starts_with("sqlite::memory") {
        // WAL with stricter durability for file-backed databases.
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
    }
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn create_mailing_list(
    pool: &Pool,
    name: &str,
    remote_list_id: Option<&str>,
    remote_api_key: Option<&str>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO mailing_lists (name, remote_list_id, remote_api_key) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(remote_list_id)
    .bind(remote_api_key)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Insert a person together with their tags. `person.id` is ignored.
#[instrument(skip_all)]
pub async fn insert_person(pool: &Pool, person: &Subscriber) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO people (email, first_name, last_name, nickname, company_name, gender) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&person.email)
    .bind(&person.first_name)
    .bind(&person.last_name)
    .bind(&person.nickname)
    .bind(&person.company_name)
    .bind(&person.gender)
    .fetch_one(&mut *tx)
    .await?;

    for tag in &person.tags {
        sqlx::query("INSERT INTO tags (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(tag)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT OR IGNORE INTO taggings (person_id, tag_id) SELECT ?, id FROM tags WHERE name = ?",
        )
        .bind(id)
        .bind(tag)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn update_person_email(pool: &Pool, person_id: i64, email: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE people SET email = ? WHERE id = ?")
        .bind(email)
        .bind(person_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn subscribe_person(pool: &Pool, list_id: i64, person_id: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO subscriptions (list_id, person_id) VALUES (?, ?)")
        .bind(list_id)
        .bind(person_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn unsubscribe_person(pool: &Pool, list_id: i64, person_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM subscriptions WHERE list_id = ? AND person_id = ?")
        .bind(list_id)
        .bind(person_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn tag_person(pool: &Pool, person_id: i64, tag: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO tags (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
        .bind(tag)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT OR IGNORE INTO taggings (person_id, tag_id) SELECT ?, id FROM tags WHERE name = ?",
    )
    .bind(person_id)
    .bind(tag)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn untag_person(pool: &Pool, person_id: i64, tag: &str) -> Result<()> {
    sqlx::query(
        "DELETE FROM taggings WHERE person_id = ? AND tag_id IN (SELECT id FROM tags WHERE name = ?)",
    )
    .bind(person_id)
    .bind(tag)
    .execute(pool)
    .await?;
    Ok(())
}

fn into_mailing_list(row: MailingListRow) -> MailingList {
    let sync_result = row.sync_result.as_deref().and_then(|raw| {
        SyncResult::from_json(raw)
            .map_err(|err| warn!(list_id = row.id, ?err, "unreadable stored sync result"))
            .ok()
    });
    MailingList {
        id: row.id,
        name: row.name,
        remote_list_id: row.remote_list_id,
        remote_api_key: row.remote_api_key,
        syncing: row.syncing,
        last_synced_at: row.last_synced_at,
        sync_result,
    }
}

#[instrument(skip_all)]
pub async fn fetch_mailing_list(pool: &Pool, list_id: i64) -> Result<MailingList> {
    let row = sqlx::query_as::<_, MailingListRow>(&format!(
        "SELECT {LIST_COLUMNS} FROM mailing_lists WHERE id = ?"
    ))
    .bind(list_id)
    .fetch_optional(pool)
    .await?;
    row.map(into_mailing_list)
        .ok_or(SyncError::ListNotFound(list_id))
}

/// Lists that carry remote coordinates, ordered by id.
#[instrument(skip_all)]
pub async fn list_remote_mailing_lists(pool: &Pool) -> Result<Vec<MailingList>> {
    let rows = sqlx::query_as::<_, MailingListRow>(&format!(
        "SELECT {LIST_COLUMNS} FROM mailing_lists \
         WHERE COALESCE(remote_list_id, '') <> '' AND COALESCE(remote_api_key, '') <> '' \
         ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(into_mailing_list).collect())
}

#[instrument(skip_all)]
pub async fn list_mailing_lists(pool: &Pool) -> Result<Vec<MailingList>> {
    let rows = sqlx::query_as::<_, MailingListRow>(&format!(
        "SELECT {LIST_COLUMNS} FROM mailing_lists ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(into_mailing_list).collect())
}

/// Current subscribers of a list with their tags.
#[instrument(skip_all)]
pub async fn list_subscribers(pool: &Pool, list_id: i64) -> Result<Vec<Subscriber>> {
    let people = sqlx::query_as::<_, PersonRow>(
        "SELECT p.id, p.email, p.first_name, p.last_name, p.nickname, p.company_name, p.gender \
         FROM people p JOIN subscriptions s ON s.person_id = p.id \
         WHERE s.list_id = ? ORDER BY p.id",
    )
    .bind(list_id)
    .fetch_all(pool)
    .await?;

    let tag_rows = sqlx::query(
        "SELECT tg.person_id, t.name FROM taggings tg \
         JOIN tags t ON t.id = tg.tag_id \
         JOIN subscriptions s ON s.person_id = tg.person_id \
         WHERE s.list_id = ?",
    )
    .bind(list_id)
    .fetch_all(pool)
    .await?;

    let mut tags: HashMap<i64, Vec<String>> = HashMap::new();
    for row in tag_rows {
        tags.entry(row.get::<i64, _>("person_id"))
            .or_default()
            .push(row.get("name"));
    }

    Ok(people
        .into_iter()
        .map(|p| Subscriber {
            tags: tags.remove(&p.id).unwrap_or_default().into_iter().collect(),
            id: p.id,
            email: p.email,
            first_name: p.first_name,
            last_name: p.last_name,
            nickname: p.nickname,
            company_name: p.company_name,
            gender: p.gender,
        })
        .collect())
}

/// Set the in-progress flag, refusing when a run is already in progress.
#[instrument(skip_all)]
pub async fn begin_sync(pool: &Pool, list_id: i64) -> Result<()> {
    let done = sqlx::query("UPDATE mailing_lists SET syncing = 1 WHERE id = ? AND syncing = 0")
        .bind(list_id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 1 {
        return Ok(());
    }
    let exists = sqlx::query_scalar::<_, i64>("SELECT id FROM mailing_lists WHERE id = ?")
        .bind(list_id)
        .fetch_optional(pool)
        .await?;
    match exists {
        Some(_) => Err(SyncError::AlreadySyncing(list_id)),
        None => Err(SyncError::ListNotFound(list_id)),
    }
}

/// Write the run's result and clear the flag in one statement. The timestamp
/// is only replaced when `synced_at` is given.
#[instrument(skip_all)]
pub async fn finish_sync(
    pool: &Pool,
    list_id: i64,
    result: &SyncResult,
    synced_at: Option<DateTime<Utc>>,
) -> Result<()> {
    let raw = result.to_json()?;
    sqlx::query(
        "UPDATE mailing_lists SET syncing = 0, sync_result = ?, \
         last_synced_at = COALESCE(?, last_synced_at) WHERE id = ?",
    )
    .bind(raw)
    .bind(synced_at)
    .bind(list_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn clear_syncing(pool: &Pool, list_id: i64) -> Result<()> {
    sqlx::query("UPDATE mailing_lists SET syncing = 0 WHERE id = ?")
        .bind(list_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Operator recovery for a flag left set by a crashed run. Returns whether
/// the flag was set.
#[instrument(skip_all)]
pub async fn reset_syncing(pool: &Pool, list_id: i64) -> Result<bool> {
    let done = sqlx::query("UPDATE mailing_lists SET syncing = 0 WHERE id = ? AND syncing = 1")
        .bind(list_id)
        .execute(pool)
        .await?;
    if done.rows_affected() == 1 {
        warn!(list_id, "cleared stale sync flag");
        return Ok(true);
    }
    fetch_mailing_list(pool, list_id).await.map(|_| false)
}
