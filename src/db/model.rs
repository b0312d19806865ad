//! Row models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A subscribed person before tags are attached.
#[derive(Debug, Clone, FromRow)]
pub struct PersonRow {
    pub id: i64,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub nickname: Option<String>,
    pub company_name: Option<String>,
    pub gender: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MailingListRow {
    pub id: i64,
    pub name: String,
    pub remote_list_id: Option<String>,
    pub remote_api_key: Option<String>,
    pub syncing: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_result: Option<String>,
}
