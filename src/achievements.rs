//! Achievement evaluator: grants threshold achievements from a user's tree total.
//!
//! Grants are monotonic and idempotent. Evaluation is best-effort: a failed
//! grant is logged and the remaining grants are still attempted.

use rusqlite::Connection;
use serde::Serialize;

use crate::db::queries;
use crate::error::{AppError, Result, msg};
use crate::models::{Achievement, CounterDrift, CreateAchievement};

/// Built-in catalog: (code, title, description, threshold).
pub const DEFAULT_CATALOG: &[(&str, &str, &str, Option<i64>)] = &[
    ("first_tree", "First Tree", "Planted your first tree", Some(1)),
    ("tree_planter", "Tree Planter", "Planted 10 trees", Some(10)),
    ("forest_guardian", "Forest Guardian", "Planted 100 trees", Some(100)),
    ("earth_saver", "Earth Saver", "Planted 1000 trees", Some(1000)),
    ("volunteer", "Volunteer", "Took part in a planting event", None),
];

/// Insert the built-in catalog. Existing codes are left as they are.
pub fn seed_catalog(conn: &Connection) -> Result<Vec<Achievement>> {
    DEFAULT_CATALOG
        .iter()
        .map(|(code, title, description, threshold)| {
            queries::create_achievement(
                conn,
                &CreateAchievement {
                    code: code.to_string(),
                    title: title.to_string(),
                    description: Some(description.to_string()),
                    threshold_trees: *threshold,
                },
            )
        })
        .collect()
}

/// Grant every threshold achievement reached at `total_trees` that the user
/// does not hold yet. Returns the newly granted ones.
pub fn evaluate(conn: &Connection, user_id: &str, total_trees: i64) -> Result<Vec<Achievement>> {
    let reached = queries::list_reached_achievements(conn, total_trees)?;
    let mut granted = Vec::new();

    for achievement in reached {
        match grant_once(conn, user_id, &achievement) {
            Ok(true) => {
                tracing::info!("User {} earned achievement {}", user_id, achievement.code);
                granted.push(achievement);
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(
                "Failed to grant {} to user {}: {}",
                achievement.code,
                user_id,
                e
            ),
        }
    }

    Ok(granted)
}

fn grant_once(conn: &Connection, user_id: &str, achievement: &Achievement) -> Result<bool> {
    if queries::user_has_achievement(conn, user_id, &achievement.id)? {
        return Ok(false);
    }
    let reason = achievement
        .threshold_trees
        .map(|t| format!("Reached {} trees", t));
    // The primary key makes a concurrent duplicate grant a no-op.
    queries::grant_achievement(conn, user_id, &achievement.id, reason.as_deref())
}

/// Grant a catalog entry by code, including manual-only ones. Returns false
/// if the user already held it.
pub fn award_by_code(
    conn: &Connection,
    user_id: &str,
    code: &str,
    reason: Option<&str>,
) -> Result<bool> {
    let achievement = queries::get_achievement_by_code(conn, code)?
        .ok_or_else(|| AppError::NotFound(msg::ACHIEVEMENT_NOT_FOUND.into()))?;
    if !queries::user_exists(conn, user_id)? {
        return Err(AppError::NotFound(msg::USER_NOT_FOUND.into()));
    }
    queries::grant_achievement(conn, user_id, &achievement.id, reason)
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub users_checked: usize,
    pub achievements_granted: usize,
    /// Users whose stored counters disagree with their donations.
    pub drift: Vec<CounterDrift>,
}

/// Re-derive threshold grants for every user from their stored totals and
/// report counter drift against the donations table.
pub fn reconcile(conn: &Connection) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for user in queries::list_users(conn)? {
        report.users_checked += 1;
        report.achievements_granted += evaluate(conn, &user.id, user.total_trees)?.len();
    }

    report.drift = queries::list_counter_drift(conn)?;
    for drift in &report.drift {
        tracing::warn!(
            "Counter drift for user {}: stored {} trees / {} donations, actual {} / {}",
            drift.user_id,
            drift.stored_total_trees,
            drift.stored_donations_count,
            drift.actual_total_trees,
            drift.actual_donations_count
        );
    }

    Ok(report)
}
