//! Agent telemetry
//!
//! Metric samples and command results arriving on the agent channel. Samples
//! are stored as reported and pruned by the sweeper once they age out.

use chrono::{DateTime, NaiveDateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wirewarp_db::entities::{agent, agent_metric};
use wirewarp_proto::AgentMetricSample;

use crate::config::chrono_duration;
use crate::convert;
use crate::error::{ControlError, Result};

/// Upper bound for one metrics listing
pub const MAX_METRICS_LIMIT: u64 = 1000;

/// Sample time as sent by the agent. RFC 3339, or a bare ISO timestamp taken
/// as UTC. Anything else falls back to arrival time.
pub(crate) fn sample_time(reported: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = reported.map(str::trim).filter(|s| !s.is_empty()) else {
        return now;
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    match NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(ts) => ts.and_utc(),
        Err(_) => {
            debug!(timestamp = raw, "Unparsable metrics timestamp, using arrival time");
            now
        }
    }
}

pub struct Telemetry {
    db: DatabaseConnection,
    retention: Duration,
}

impl Telemetry {
    pub fn new(db: DatabaseConnection, retention: Duration) -> Self {
        Self { db, retention }
    }

    /// Store one metrics sample
    pub async fn record_metrics(
        &self,
        agent_id: Uuid,
        timestamp: Option<&str>,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<AgentMetricSample> {
        let recorded_at = sample_time(timestamp, Utc::now());
        let data = serde_json::Value::Object(data);

        let inserted = agent_metric::ActiveModel {
            id: Set(Uuid::new_v4()),
            agent_id: Set(agent_id),
            recorded_at: Set(recorded_at),
            data: Set(data.to_string()),
        }
        .insert(&self.db)
        .await?;

        debug!(agent_id = %agent_id, recorded_at = %recorded_at, "Stored metrics sample");
        Ok(convert::metric_sample(inserted)?)
    }

    /// Log a command outcome reported by an agent
    pub fn record_command_result(
        &self,
        agent_id: Uuid,
        command_id: Option<&str>,
        success: bool,
        output: &str,
    ) {
        if success {
            info!(agent_id = %agent_id, command_id = ?command_id, "Agent command succeeded");
        } else {
            warn!(
                agent_id = %agent_id,
                command_id = ?command_id,
                output = %output,
                "Agent command failed"
            );
        }
    }

    /// Newest samples first
    pub async fn recent(&self, agent_id: Uuid, limit: u64) -> Result<Vec<AgentMetricSample>> {
        if !(1..=MAX_METRICS_LIMIT).contains(&limit) {
            return Err(ControlError::validation(format!(
                "limit must be between 1 and {}",
                MAX_METRICS_LIMIT
            )));
        }
        agent::Entity::find_by_id(agent_id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::AgentNotFound(agent_id))?;

        let rows = agent_metric::Entity::find()
            .filter(agent_metric::Column::AgentId.eq(agent_id))
            .order_by_desc(agent_metric::Column::RecordedAt)
            .limit(limit)
            .all(&self.db)
            .await?;

        rows.into_iter()
            .map(|row| convert::metric_sample(row).map_err(ControlError::from))
            .collect()
    }

    /// Drop samples older than the retention window
    pub async fn prune(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono_duration(self.retention);
        let removed = agent_metric::Entity::delete_many()
            .filter(agent_metric::Column::RecordedAt.lt(cutoff))
            .exec(&self.db)
            .await?
            .rows_affected;
        Ok(removed)
    }
}
