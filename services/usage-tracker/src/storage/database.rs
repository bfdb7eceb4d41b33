use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use feature_usage_limits::{
    FeatureRef, LimitRule, LimitRuleRepository, RecordToken, RepositoryError, Subject,
    UsageRecord, UsageRepository, UsageTrackingContext, WindowMatch,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::error::StorageError;
use super::schema::init_database;
use super::USAGE_DB_FILENAME;

/// SQLite-backed store for usage records and subject limit overrides.
pub struct UsageDatabase {
    data_dir: PathBuf,
    conn: Mutex<Connection>,
}

impl UsageDatabase {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        let db_path = data_dir.join(USAGE_DB_FILENAME);
        let is_new = !db_path.exists();
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        if is_new {
            init_database(&conn)?;
            info!(path = %db_path.display(), "initialized usage database");
        }

        Ok(Self {
            data_dir,
            conn: Mutex::new(conn),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::ConnectionPoisoned)
    }

    pub fn load_records(
        &self,
        context: &UsageTrackingContext,
    ) -> Result<Vec<UsageRecord>, StorageError> {
        let conn = self.lock()?;
        let feature = context.feature();
        let subject = context.subject();

        let mut stmt = conn.prepare(
            r#"
            SELECT record_id, limit_id, window_start, window_end, units, expiration_date
            FROM usage_records
            WHERE subject_kind = ?1 AND subject_id = ?2 AND product_id = ?3 AND feature_id = ?4
              AND limit_id = ?5
              AND (
                (?8 = 0
                  AND (?6 IS NULL OR window_start IS NULL OR window_start >= ?6)
                  AND (?7 IS NULL OR window_end IS NULL OR window_end <= ?7))
                OR (?8 = 1
                  AND window_end IS NOT NULL
                  AND (?6 IS NULL OR window_end >= ?6)
                  AND (?7 IS NULL OR window_end <= ?7))
              )
            "#,
        )?;

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for criteria in context.criteria() {
            let rows = stmt.query_map(
                params![
                    subject.kind.as_str(),
                    subject.id,
                    feature.product_id,
                    feature.feature_id,
                    criteria.limit_id,
                    criteria.window_start.map(format_timestamp),
                    criteria.window_end.map(format_timestamp),
                    criteria.mode == WindowMatch::EndsWithin,
                ],
                read_usage_row,
            )?;

            for row in rows {
                let record = row?.into_record()?;
                let token = record.token.clone();
                if seen.insert(token) {
                    records.push(record);
                }
            }
        }

        Ok(records)
    }

    /// Applies the staged records in one transaction.
    pub fn save_records(&self, context: &UsageTrackingContext) -> Result<usize, StorageError> {
        let mut conn = self.lock()?;
        let feature = context.feature();
        let subject = context.subject();
        let now = format_timestamp(Utc::now());

        let tx = conn.transaction()?;
        for record in context.updated() {
            let units = stored_units(record)?;
            match &record.token {
                Some(token) => {
                    let updated = tx.execute(
                        r#"
                        UPDATE usage_records
                        SET units = ?1, updated_at = ?2
                        WHERE record_id = ?3
                        "#,
                        params![units, now, token.as_str()],
                    )?;
                    if updated == 0 {
                        return Err(StorageError::RecordNotFound(token.as_str().to_string()));
                    }
                }
                None => {
                    tx.execute(
                        r#"
                        INSERT INTO usage_records (
                            record_id, subject_kind, subject_id, product_id, feature_id, limit_id,
                            window_start, window_end, units, expiration_date, updated_at
                        )
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                        "#,
                        params![
                            Uuid::new_v4().to_string(),
                            subject.kind.as_str(),
                            subject.id,
                            feature.product_id,
                            feature.feature_id,
                            record.limit_id,
                            record.window_start.map(format_timestamp),
                            record.window_end.map(format_timestamp),
                            units,
                            record.expiration_date.map(format_timestamp),
                            now,
                        ],
                    )?;
                }
            }
        }
        tx.commit()?;

        debug!(
            feature = %feature,
            subject = %subject,
            records = context.updated().len(),
            "saved usage records"
        );
        Ok(context.updated().len())
    }

    pub fn delete_expired(&self, as_of: DateTime<Utc>) -> Result<usize, StorageError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            r#"
            DELETE FROM usage_records
            WHERE expiration_date IS NOT NULL AND expiration_date <= ?1
            "#,
            params![format_timestamp(as_of)],
        )?;
        Ok(removed)
    }

    pub fn list_records(
        &self,
        feature: &FeatureRef,
        subject: &Subject,
    ) -> Result<Vec<UsageRecord>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT record_id, limit_id, window_start, window_end, units, expiration_date
            FROM usage_records
            WHERE subject_kind = ?1 AND subject_id = ?2 AND product_id = ?3 AND feature_id = ?4
            ORDER BY limit_id, window_start
            "#,
        )?;

        let rows = stmt.query_map(
            params![
                subject.kind.as_str(),
                subject.id,
                feature.product_id,
                feature.feature_id
            ],
            read_usage_row,
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    pub fn get_override(
        &self,
        feature: &FeatureRef,
        limit_id: &str,
        subject: &Subject,
    ) -> Result<Option<LimitRule>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT rule
            FROM limit_overrides
            WHERE subject_kind = ?1 AND subject_id = ?2 AND product_id = ?3 AND feature_id = ?4
              AND limit_id = ?5
            "#,
        )?;

        let rule = stmt
            .query_row(
                params![
                    subject.kind.as_str(),
                    subject.id,
                    feature.product_id,
                    feature.feature_id,
                    limit_id
                ],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match rule {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    pub fn set_override(
        &self,
        feature: &FeatureRef,
        rule: &LimitRule,
        subject: &Subject,
    ) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let encoded = serde_json::to_string(rule)?;
        let now = format_timestamp(Utc::now());

        conn.execute(
            r#"
            INSERT INTO limit_overrides (subject_kind, subject_id, product_id, feature_id, limit_id, rule, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(subject_kind, subject_id, product_id, feature_id, limit_id) DO UPDATE SET
                rule = excluded.rule,
                updated_at = excluded.updated_at
            "#,
            params![
                subject.kind.as_str(),
                subject.id,
                feature.product_id,
                feature.feature_id,
                rule.id,
                encoded,
                now
            ],
        )?;
        Ok(())
    }

    pub fn remove_override(
        &self,
        feature: &FeatureRef,
        limit_id: &str,
        subject: &Subject,
    ) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            r#"
            DELETE FROM limit_overrides
            WHERE subject_kind = ?1 AND subject_id = ?2 AND product_id = ?3 AND feature_id = ?4
              AND limit_id = ?5
            "#,
            params![
                subject.kind.as_str(),
                subject.id,
                feature.product_id,
                feature.feature_id,
                limit_id
            ],
        )?;
        Ok(removed > 0)
    }
}

impl UsageRepository for UsageDatabase {
    fn load_usage_data(&self, context: &mut UsageTrackingContext) -> Result<(), RepositoryError> {
        let records = self.load_records(context)?;
        context.load_current(records);
        Ok(())
    }

    fn update_usage_records(
        &self,
        context: &UsageTrackingContext,
    ) -> Result<usize, RepositoryError> {
        Ok(self.save_records(context)?)
    }

    fn delete_old_records(&self, as_of: DateTime<Utc>) -> Result<usize, RepositoryError> {
        Ok(self.delete_expired(as_of)?)
    }
}

impl LimitRuleRepository for UsageDatabase {
    fn find(
        &self,
        feature: &FeatureRef,
        limit_id: &str,
        subject: &Subject,
    ) -> Result<Option<LimitRule>, RepositoryError> {
        Ok(self.get_override(feature, limit_id, subject)?)
    }

    fn update(
        &self,
        feature: &FeatureRef,
        rule: &LimitRule,
        subject: &Subject,
    ) -> Result<(), RepositoryError> {
        Ok(self.set_override(feature, rule, subject)?)
    }

    fn delete(
        &self,
        feature: &FeatureRef,
        limit_id: &str,
        subject: &Subject,
    ) -> Result<bool, RepositoryError> {
        Ok(self.remove_override(feature, limit_id, subject)?)
    }
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| StorageError::InvalidTimestamp {
            value: value.to_string(),
            reason: err.to_string(),
        })
}

// SQLite integers are signed.
fn stored_units(record: &UsageRecord) -> Result<i64, StorageError> {
    i64::try_from(record.units).map_err(|_| StorageError::UnitsOutOfRange {
        limit_id: record.limit_id.clone(),
        units: record.units,
    })
}

fn parse_optional(value: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    value.as_deref().map(parse_timestamp).transpose()
}

struct UsageRow {
    record_id: String,
    limit_id: String,
    window_start: Option<String>,
    window_end: Option<String>,
    units: i64,
    expiration_date: Option<String>,
}

impl UsageRow {
    fn into_record(self) -> Result<UsageRecord, StorageError> {
        let units = u64::try_from(self.units).map_err(|_| StorageError::NegativeUnits {
            record_id: self.record_id.clone(),
            units: self.units,
        })?;
        Ok(UsageRecord {
            token: Some(RecordToken::new(self.record_id)),
            limit_id: self.limit_id,
            window_start: parse_optional(self.window_start)?,
            window_end: parse_optional(self.window_end)?,
            units,
            expiration_date: parse_optional(self.expiration_date)?,
        })
    }
}

fn read_usage_row(row: &Row<'_>) -> rusqlite::Result<UsageRow> {
    Ok(UsageRow {
        record_id: row.get(0)?,
        limit_id: row.get(1)?,
        window_start: row.get(2)?,
        window_end: row.get(3)?,
        units: row.get(4)?,
        expiration_date: row.get(5)?,
    })
}
