use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info};

use b2b_group_core::meta;
use b2b_group_core::types::format_timestamp;
use b2b_group_core::{extract_domain, AssignmentLogEntry, AssignmentOutcome};
use b2b_group_storage::{Database, OptionError, UserStoreError};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Applies the domain → group mapping to user accounts.
#[derive(Clone)]
pub struct AssignmentEngine {
    database: Database,
    clock: Clock,
    group_field: Arc<str>,
    log_capacity: usize,
}

impl AssignmentEngine {
    pub fn new(database: Database, clock: Clock, group_field: &str, log_capacity: usize) -> Self {
        Self {
            database,
            clock,
            group_field: Arc::from(group_field),
            log_capacity,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn group_field(&self) -> &str {
        &self.group_field
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Looks up the user's email domain and, when mapped, writes the group,
    /// the bookkeeping fields and a log entry.
    ///
    /// The three writes are not transactional; re-running converges.
    pub async fn assign(&self, user_id: i64) -> Result<AssignmentOutcome, EngineError> {
        let users = self.database.users();
        let Some(user) = users.get_user(user_id).await? else {
            debug!(stage = "assign", user_id, "user not found");
            counter!("assignments_total", "result" => "not_found").increment(1);
            return Ok(AssignmentOutcome::NotFound);
        };

        let domain = extract_domain(&user.email).to_string();
        let mappings = self.database.mappings().get_all().await?;
        let Some(group) = mappings.get(&domain).map(str::to_string) else {
            debug!(stage = "assign", user_id, %domain, "no mapping for domain");
            counter!("assignments_total", "result" => "no_mapping").increment(1);
            return Ok(AssignmentOutcome::NoMapping { domain });
        };

        let now = self.now();
        users
            .set_field(user_id, &self.group_field, &group, now)
            .await?;
        users
            .set_field(user_id, meta::ASSIGNED_GROUP, &group, now)
            .await?;
        users
            .set_field(user_id, meta::ASSIGNED_AT, &format_timestamp(now), now)
            .await?;
        users
            .set_field(user_id, meta::SOURCE_DOMAIN, &domain, now)
            .await?;

        let entry = AssignmentLogEntry {
            email: user.email.clone(),
            domain: domain.clone(),
            group: group.clone(),
            field: self.group_field.to_string(),
            assigned_at: now,
        };
        self.database
            .assignment_logs()
            .append(entry.to_string(), self.log_capacity)
            .await?;

        counter!("assignments_total", "result" => "assigned").increment(1);
        info!(stage = "assign", user_id, %domain, %group, field = %self.group_field, "group assigned");

        Ok(AssignmentOutcome::Assigned { domain, group })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("user store failure: {0}")]
    UserStore(#[from] UserStoreError),
    #[error("option store failure: {0}")]
    Options(#[from] OptionError),
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;

    pub const GROUP_FIELD: &str = "wcb2b_group";

    pub fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    pub fn fixed_clock(now: DateTime<Utc>) -> Clock {
        Arc::new(move || now)
    }

    pub async fn setup_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        (db, dir)
    }

    pub fn engine(db: &Database) -> AssignmentEngine {
        AssignmentEngine::new(db.clone(), fixed_clock(fixed_now()), GROUP_FIELD, 100)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    async fn seed(db: &Database, user_id: i64, email: &str) {
        db.users()
            .upsert_user(user_id, email, fixed_now())
            .await
            .expect("user");
        db.mappings().set("acme.com", "Gold").await.expect("mapping");
    }

    #[tokio::test]
    async fn mapped_domain_assigns_group_and_logs_once() {
        let (db, _dir) = setup_db().await;
        seed(&db, 1, "bob@acme.com").await;

        let outcome = engine(&db).assign(1).await.expect("assign");
        assert_eq!(
            outcome,
            AssignmentOutcome::Assigned {
                domain: "acme.com".into(),
                group: "Gold".into()
            }
        );

        let users = db.users();
        assert_eq!(
            users.get_field(1, GROUP_FIELD).await.unwrap().as_deref(),
            Some("Gold")
        );
        let state = users.assignment_state(1).await.unwrap();
        assert_eq!(state.group.as_deref(), Some("Gold"));
        assert_eq!(state.domain.as_deref(), Some("acme.com"));
        assert_eq!(state.assigned_at_parsed(), Some(fixed_now()));

        let logs = db.assignment_logs().get_all().await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("Domain: acme.com"));
        assert!(logs[0].contains("Group assigned: Gold"));
        assert!(logs[0].contains("Field: wcb2b_group"));
    }

    #[tokio::test]
    async fn unmapped_domain_leaves_user_untouched() {
        let (db, _dir) = setup_db().await;
        seed(&db, 2, "bob@unknown.org").await;
        db.users()
            .set_field(2, GROUP_FIELD, "Silver", fixed_now())
            .await
            .unwrap();

        let outcome = engine(&db).assign(2).await.expect("assign");
        assert_eq!(
            outcome,
            AssignmentOutcome::NoMapping {
                domain: "unknown.org".into()
            }
        );
        assert_eq!(
            db.users().get_field(2, GROUP_FIELD).await.unwrap().as_deref(),
            Some("Silver")
        );
        assert!(db.assignment_logs().get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let (db, _dir) = setup_db().await;
        db.mappings().set("acme.com", "Gold").await.unwrap();
        let outcome = engine(&db).assign(404).await.expect("assign");
        assert_eq!(outcome, AssignmentOutcome::NotFound);
        assert!(db.assignment_logs().get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_assignment_converges_but_logs_each_call() {
        let (db, _dir) = setup_db().await;
        seed(&db, 3, "carol@acme.com").await;
        let engine = engine(&db);

        engine.assign(3).await.expect("first");
        engine.assign(3).await.expect("second");

        assert_eq!(
            db.users().get_field(3, GROUP_FIELD).await.unwrap().as_deref(),
            Some("Gold")
        );
        assert_eq!(db.assignment_logs().get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn email_without_at_sign_is_looked_up_whole() {
        let (db, _dir) = setup_db().await;
        seed(&db, 4, "noatsign").await;

        let outcome = engine(&db).assign(4).await.expect("assign");
        assert_eq!(
            outcome,
            AssignmentOutcome::NoMapping {
                domain: "noatsign".into()
            }
        );

        db.mappings().set("noatsign", "Bronze").await.unwrap();
        let outcome = engine(&db).assign(4).await.expect("assign");
        assert!(outcome.is_assigned());
    }

    #[tokio::test]
    async fn deleted_mapping_stops_updates() {
        let (db, _dir) = setup_db().await;
        seed(&db, 5, "bob@acme.com").await;
        db.mappings().delete("acme.com").await.unwrap();

        let outcome = engine(&db).assign(5).await.expect("assign");
        assert!(!outcome.is_assigned());
        assert_eq!(db.users().get_field(5, GROUP_FIELD).await.unwrap(), None);
    }
}
