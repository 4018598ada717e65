use chrono::{DateTime, Utc};

use super::EntityStore;
use crate::core::transaction::Transaction;
use crate::domain::entities::{JobDescriptor, JobLog, TenantState, Trigger, TriggerState};
use crate::error::Result;
use crate::infrastructure::persistence::QueryCriteria;

/// Typed access to job descriptors, triggers, job logs and tenant state
#[derive(Clone)]
pub struct SchedulerStore {
    entities: EntityStore,
}

impl SchedulerStore {
    pub fn new(entities: EntityStore) -> Self {
        Self { entities }
    }

    // Job descriptors

    pub async fn insert_descriptor(&self, tx: &Transaction, descriptor: &JobDescriptor) -> Result<JobDescriptor> {
        self.entities.insert(tx, descriptor).await
    }

    pub async fn update_descriptor(&self, tx: &Transaction, descriptor: &JobDescriptor) -> Result<JobDescriptor> {
        self.entities.update(tx, descriptor).await
    }

    pub async fn delete_descriptor(&self, tx: &Transaction, id: &str) -> Result<bool> {
        self.entities.delete::<JobDescriptor>(tx, id).await
    }

    pub async fn get_descriptor(&self, tx: &Transaction, id: &str) -> Result<Option<JobDescriptor>> {
        self.entities.get(tx, id).await
    }

    pub async fn descriptors_named(&self, tx: &Transaction, tenant_id: i64, job_name: &str) -> Result<Vec<JobDescriptor>> {
        let criteria = QueryCriteria::new()
            .eq("tenant_id", tenant_id)
            .eq("job_name", job_name)
            .order_by_asc("created_at");
        self.entities.find(tx, &criteria).await
    }

    pub async fn descriptors_of_tenant(&self, tx: &Transaction, tenant_id: i64) -> Result<Vec<JobDescriptor>> {
        let criteria = QueryCriteria::new()
            .eq("tenant_id", tenant_id)
            .order_by_asc("job_name");
        self.entities.find(tx, &criteria).await
    }

    pub async fn descriptors_running_on(&self, tx: &Transaction, node_id: &str) -> Result<Vec<JobDescriptor>> {
        let criteria = QueryCriteria::new().eq("running_on", node_id);
        self.entities.find(tx, &criteria).await
    }

    // Triggers

    pub async fn insert_trigger(&self, tx: &Transaction, trigger: &Trigger) -> Result<Trigger> {
        self.entities.insert(tx, trigger).await
    }

    pub async fn update_trigger(&self, tx: &Transaction, trigger: &Trigger) -> Result<Trigger> {
        self.entities.update(tx, trigger).await
    }

    pub async fn delete_trigger(&self, tx: &Transaction, id: &str) -> Result<bool> {
        self.entities.delete::<Trigger>(tx, id).await
    }

    pub async fn get_trigger_by_id(&self, tx: &Transaction, id: &str) -> Result<Option<Trigger>> {
        self.entities.get(tx, id).await
    }

    pub async fn get_trigger(&self, tx: &Transaction, group: &str, name: &str) -> Result<Option<Trigger>> {
        self.entities.get(tx, &Trigger::id_for(group, name)).await
    }

    pub async fn triggers_of_descriptor(&self, tx: &Transaction, job_descriptor_id: &str) -> Result<Vec<Trigger>> {
        let criteria = QueryCriteria::new()
            .eq("job_descriptor_id", job_descriptor_id)
            .order_by_asc("name");
        self.entities.find(tx, &criteria).await
    }

    pub async fn triggers_of_tenant(&self, tx: &Transaction, tenant_id: i64, states: &[TriggerState]) -> Result<Vec<Trigger>> {
        let mut criteria = QueryCriteria::new().eq("tenant_id", tenant_id).order_by_asc("name");
        if !states.is_empty() {
            criteria = criteria.is_in("state", states.iter().map(|s| s.as_str()));
        }
        self.entities.find(tx, &criteria).await
    }

    pub async fn triggers_in_state(&self, tx: &Transaction, state: TriggerState) -> Result<Vec<Trigger>> {
        let criteria = QueryCriteria::new().eq("state", state.as_str()).order_by_asc("name");
        self.entities.find(tx, &criteria).await
    }

    /// `Scheduled` or `Due` triggers whose next fire time has passed, earliest first
    pub async fn due_triggers(&self, tx: &Transaction, now: DateTime<Utc>, max: usize) -> Result<Vec<Trigger>> {
        let criteria = QueryCriteria::new()
            .is_in("state", [TriggerState::Scheduled.as_str(), TriggerState::Due.as_str()])
            .lte("next_fire_time", now.timestamp_millis())
            .order_by_asc("next_fire_time")
            .max_results(max);
        self.entities.find(tx, &criteria).await
    }

    pub async fn triggers_claimed_by(&self, tx: &Transaction, node_id: &str) -> Result<Vec<Trigger>> {
        let criteria = QueryCriteria::new()
            .eq("state", TriggerState::Executing.as_str())
            .eq("claimed_by", node_id);
        self.entities.find(tx, &criteria).await
    }

    /// `Executing` triggers claimed before `cutoff`, whatever node holds
    /// them. A claim without a timestamp counts as expired.
    pub async fn triggers_claimed_before(&self, tx: &Transaction, cutoff: DateTime<Utc>) -> Result<Vec<Trigger>> {
        let executing = || QueryCriteria::new().eq("state", TriggerState::Executing.as_str());
        let mut expired = self
            .entities
            .find(tx, &executing().lt("claimed_at", cutoff.timestamp_millis()))
            .await?;
        expired.extend(self.entities.find::<Trigger>(tx, &executing().is_null("claimed_at")).await?);
        Ok(expired)
    }

    /// Descriptors whose run-lock was taken before `cutoff`
    pub async fn descriptors_locked_before(&self, tx: &Transaction, cutoff: DateTime<Utc>) -> Result<Vec<JobDescriptor>> {
        let criteria = QueryCriteria::new().lt("running_since", cutoff.timestamp_millis());
        self.entities.find(tx, &criteria).await
    }

    // Job logs

    pub async fn get_job_log(&self, tx: &Transaction, job_descriptor_id: &str) -> Result<Option<JobLog>> {
        self.entities.get(tx, &Self::job_log_id(job_descriptor_id)).await
    }

    pub async fn job_logs_of_descriptor(&self, tx: &Transaction, job_descriptor_id: &str) -> Result<Vec<JobLog>> {
        let criteria = QueryCriteria::new().eq("job_descriptor_id", job_descriptor_id);
        self.entities.find(tx, &criteria).await
    }

    pub async fn insert_job_log(&self, tx: &Transaction, log: &JobLog) -> Result<JobLog> {
        self.entities.insert(tx, log).await
    }

    pub async fn update_job_log(&self, tx: &Transaction, log: &JobLog) -> Result<JobLog> {
        self.entities.update(tx, log).await
    }

    pub async fn delete_job_logs(&self, tx: &Transaction, job_descriptor_id: &str) -> Result<u64> {
        let criteria = QueryCriteria::new().eq("job_descriptor_id", job_descriptor_id);
        self.entities.delete_where::<JobLog>(tx, &criteria).await
    }

    pub fn job_log_id(job_descriptor_id: &str) -> String {
        format!("log-{}", job_descriptor_id)
    }

    // Tenant state

    pub async fn get_tenant_state(&self, tx: &Transaction, tenant_id: i64) -> Result<Option<TenantState>> {
        self.entities.get(tx, &TenantState::id_for(tenant_id)).await
    }

    pub async fn save_tenant_state(&self, tx: &Transaction, state: &TenantState) -> Result<TenantState> {
        if state.version == 0 {
            self.entities.insert(tx, state).await
        } else {
            self.entities.update(tx, state).await
        }
    }
}
