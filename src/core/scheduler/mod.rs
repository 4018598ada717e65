//! Job scheduler: trigger catalogue, dispatch workers and tenant-level
//! pause/resume
//!
//! Every state transition goes through the store with an optimistic
//! version check, so several nodes (or several workers on one node) can
//! poll the same triggers and each firing is claimed exactly once.

pub mod trigger_evaluation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::core::clock::Clock;
use crate::core::jobs::{JobRegistry, StatelessJob};
use crate::core::transaction::{RetryTransactionExecutor, Transaction};
use crate::domain::entities::{JobDescriptor, JobLog, JobParameters, TenantState, Trigger, TriggerState};
use crate::domain::repositories::SchedulerStore;
use crate::error::{AppError, ErrorContext, Result, ResultExt};

use trigger_evaluation::MisfireDecision;

/// Outcome of one dispatch pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: u64,
    pub executed: u64,
    pub failed: u64,
    pub misfired: u64,
    pub erroneous: u64,
    pub lost_claims: u64,
    pub busy: u64,
    /// Claims and run-locks released because their lease ran out
    pub expired_claims: u64,
}

enum Claim {
    Claimed {
        trigger: Trigger,
        descriptor: JobDescriptor,
    },
    Misfired,
    Erroneous,
    Busy,
    Skipped,
}

pub struct SchedulerService {
    store: SchedulerStore,
    executor: RetryTransactionExecutor,
    registry: RwLock<JobRegistry>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    node_id: String,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl SchedulerService {
    pub fn new(
        store: SchedulerStore,
        executor: RetryTransactionExecutor,
        registry: JobRegistry,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        node_id: impl Into<String>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            executor,
            registry: RwLock::new(registry),
            clock,
            config,
            node_id: node_id.into(),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn register_job<F>(&self, class_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn StatelessJob> + Send + Sync + 'static,
    {
        self.registry.write().await.register(class_name, factory);
    }

    // Lifecycle

    /// Releases what this node left behind, then spawns the polling workers
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if self.started.load(Ordering::SeqCst) {
            return Err(AppError::scheduler("Scheduler is already running"));
        }

        let recovered = self.recover_node_triggers().await?;
        self.shutdown.send_replace(false);

        for worker in 0..self.config.workers {
            let scheduler = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            workers.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(scheduler.config.poll_interval());
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = scheduler.run_due_jobs().await {
                                error!(worker, "Error dispatching due jobs: {}", e);
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!(worker, "Scheduler worker stopped");
            }));
        }

        self.started.store(true, Ordering::SeqCst);
        info!(
            node_id = %self.node_id,
            workers = self.config.workers,
            recovered,
            "🔄 Scheduler started"
        );
        Ok(())
    }

    /// Waits for in-flight dispatch passes to finish
    pub async fn stop(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.send_replace(true);
        for handle in workers.drain(..) {
            if let Err(e) = handle.await {
                warn!("Scheduler worker ended abnormally: {}", e);
            }
        }

        self.started.store(false, Ordering::SeqCst);
        info!(node_id = %self.node_id, "Scheduler stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        !self.is_started()
    }

    // Registration

    pub async fn schedule(&self, tx: &Transaction, descriptor: JobDescriptor, trigger: Trigger) -> Result<Trigger> {
        self.schedule_with_parameters(tx, descriptor, JobParameters::new(), trigger)
            .await
    }

    /// Stores the descriptor, with `parameters` merged over its own, and
    /// its first trigger. A trigger left without a start time starts now.
    pub async fn schedule_with_parameters(
        &self,
        tx: &Transaction,
        mut descriptor: JobDescriptor,
        parameters: JobParameters,
        mut trigger: Trigger,
    ) -> Result<Trigger> {
        let now = self.clock.now();
        trigger_evaluation::validate(&trigger)?;

        let existing = self
            .store
            .descriptors_named(tx, descriptor.tenant_id, &descriptor.job_name)
            .await?;
        if !existing.is_empty()
            && (descriptor.disallow_concurrent_execution
                || existing.iter().any(|d| d.disallow_concurrent_execution))
        {
            return Err(AppError::scheduler(format!(
                "Job '{}' already exists for tenant {} and does not allow concurrent execution",
                descriptor.job_name, descriptor.tenant_id
            )));
        }

        if trigger.group.is_empty() {
            trigger.group = descriptor.tenant_id.to_string();
        }
        trigger.id = Trigger::id_for(&trigger.group, &trigger.name);
        if self.store.get_trigger_by_id(tx, &trigger.id).await?.is_some() {
            return Err(AppError::scheduler(format!(
                "Trigger '{}' already exists in group '{}'",
                trigger.name, trigger.group
            )));
        }

        if trigger.is_start_unset() {
            trigger.start_at = now;
        }
        let first = trigger_evaluation::first_fire_time(&trigger)?.ok_or_else(|| {
            AppError::scheduler(format!("Trigger '{}' will never fire", trigger.name))
        })?;

        descriptor.parameters.extend(parameters);
        descriptor.created_at = now;
        let descriptor = self
            .store
            .insert_descriptor(tx, &descriptor)
            .await
            .or_wrap(|| AppError::scheduler(format!("Unable to store job '{}'", descriptor.job_name)))?;

        trigger.tenant_id = descriptor.tenant_id;
        trigger.job_descriptor_id = descriptor.id.clone();
        trigger.next_fire_time = Some(first);
        trigger.fire_count = 0;
        trigger.claimed_by = None;
        trigger.claimed_at = None;
        if self.is_tenant_paused(tx, descriptor.tenant_id).await? {
            trigger.state = TriggerState::Paused;
            trigger.paused_at = Some(now);
        } else {
            trigger.state = TriggerState::Scheduled;
            trigger.paused_at = None;
        }

        let trigger = self.store.insert_trigger(tx, &trigger).await?;
        info!(
            job = %descriptor.job_name,
            trigger = %trigger.name,
            tenant_id = descriptor.tenant_id,
            next_fire_time = %first,
            "📋 Job scheduled"
        );
        Ok(trigger)
    }

    /// One extra firing `delay_millis` from now, next to the job's own triggers
    pub async fn execute_again(&self, tx: &Transaction, job_descriptor_id: &str, delay_millis: u64) -> Result<Trigger> {
        let descriptor = self.require_descriptor(tx, job_descriptor_id).await?;
        let at = trigger_evaluation::add_millis(self.clock.now(), delay_millis)?;
        let trigger = Trigger::one_shot(format!("{}-again-{}", descriptor.job_name, Uuid::new_v4()), at);

        let trigger = self.add_trigger(tx, &descriptor, trigger, TriggerState::Scheduled).await?;
        debug!(job = %descriptor.job_name, delay_millis, "Job will be executed again");
        Ok(trigger)
    }

    /// Clears the failure log and fires the job once, immediately
    pub async fn retry_job_that_failed(
        &self,
        tx: &Transaction,
        job_descriptor_id: &str,
        parameters: Option<JobParameters>,
    ) -> Result<Trigger> {
        let mut descriptor = self.require_descriptor(tx, job_descriptor_id).await?;
        self.store.delete_job_logs(tx, job_descriptor_id).await?;

        if let Some(parameters) = parameters {
            descriptor.parameters = parameters;
            descriptor = self.store.update_descriptor(tx, &descriptor).await?;
        }

        let trigger = Trigger::one_shot(
            format!("{}-retry-{}", descriptor.job_name, Uuid::new_v4()),
            self.clock.now(),
        );
        let trigger = self.add_trigger(tx, &descriptor, trigger, TriggerState::Due).await?;
        info!(job = %descriptor.job_name, "🔄 Failed job scheduled for retry");
        Ok(trigger)
    }

    async fn add_trigger(
        &self,
        tx: &Transaction,
        descriptor: &JobDescriptor,
        mut trigger: Trigger,
        state: TriggerState,
    ) -> Result<Trigger> {
        trigger.group = descriptor.tenant_id.to_string();
        trigger.id = Trigger::id_for(&trigger.group, &trigger.name);
        trigger.tenant_id = descriptor.tenant_id;
        trigger.job_descriptor_id = descriptor.id.clone();
        trigger.next_fire_time = trigger_evaluation::first_fire_time(&trigger)?;
        trigger.state = state;
        if self.is_tenant_paused(tx, descriptor.tenant_id).await? {
            trigger.state = TriggerState::Paused;
            trigger.paused_at = Some(self.clock.now());
        }
        self.store.insert_trigger(tx, &trigger).await
    }

    async fn require_descriptor(&self, tx: &Transaction, job_descriptor_id: &str) -> Result<JobDescriptor> {
        self.store
            .get_descriptor(tx, job_descriptor_id)
            .await?
            .ok_or_else(|| AppError::scheduler(format!("No job descriptor with id {}", job_descriptor_id)))
    }

    // Tenant pause and resume

    /// Suspends every waiting trigger of the tenant. Triggers currently
    /// executing are parked when their run finishes.
    pub async fn pause_jobs(&self, tx: &Transaction, tenant_id: i64) -> Result<u64> {
        let now = self.clock.now();
        let mut state = self.tenant_state(tx, tenant_id).await?;
        state.paused = true;
        state.paused_at = Some(now);
        self.store.save_tenant_state(tx, &state).await?;

        let triggers = self
            .store
            .triggers_of_tenant(tx, tenant_id, &[TriggerState::Scheduled, TriggerState::Due])
            .await?;
        let mut paused = 0;
        for mut trigger in triggers {
            trigger.state = TriggerState::Paused;
            trigger.paused_at = Some(now);
            self.store.update_trigger(tx, &trigger).await?;
            paused += 1;
        }

        info!(tenant_id, paused, "Jobs paused");
        Ok(paused)
    }

    /// Puts the tenant's paused triggers back on schedule. A trigger whose
    /// fire time went by while paused is handled by its misfire policy.
    pub async fn resume_jobs(&self, tx: &Transaction, tenant_id: i64) -> Result<u64> {
        let now = self.clock.now();
        let mut state = self.tenant_state(tx, tenant_id).await?;
        state.paused = false;
        state.paused_at = None;
        self.store.save_tenant_state(tx, &state).await?;

        let triggers = self
            .store
            .triggers_of_tenant(tx, tenant_id, &[TriggerState::Paused])
            .await?;
        let mut resumed = 0;
        for mut trigger in triggers {
            trigger.paused_at = None;
            match trigger.next_fire_time {
                None => trigger.state = TriggerState::Done,
                Some(next) if trigger_evaluation::is_misfire(next, now, self.config.misfire_threshold()) => {
                    self.apply_misfire(&mut trigger, now)?
                }
                Some(_) => trigger.state = TriggerState::Scheduled,
            }
            self.store.update_trigger(tx, &trigger).await?;
            resumed += 1;
        }

        info!(tenant_id, resumed, "Jobs resumed");
        Ok(resumed)
    }

    fn apply_misfire(&self, trigger: &mut Trigger, now: DateTime<Utc>) -> Result<()> {
        match trigger_evaluation::misfire_decision(trigger, now)? {
            MisfireDecision::FireNow => {
                trigger.state = TriggerState::Due;
                trigger.next_fire_time = Some(now);
            }
            MisfireDecision::SkipTo(next) => {
                trigger.state = TriggerState::Scheduled;
                trigger.next_fire_time = Some(next);
            }
            MisfireDecision::Exhausted => {
                trigger.state = TriggerState::Done;
                trigger.next_fire_time = None;
            }
        }
        debug!(trigger = %trigger.name, state = trigger.state.as_str(), "Misfire policy applied");
        Ok(())
    }

    async fn tenant_state(&self, tx: &Transaction, tenant_id: i64) -> Result<TenantState> {
        Ok(self
            .store
            .get_tenant_state(tx, tenant_id)
            .await?
            .unwrap_or_else(|| TenantState {
                id: TenantState::id_for(tenant_id),
                tenant_id,
                paused: false,
                paused_at: None,
                version: 0,
            }))
    }

    async fn is_tenant_paused(&self, tx: &Transaction, tenant_id: i64) -> Result<bool> {
        Ok(self
            .store
            .get_tenant_state(tx, tenant_id)
            .await?
            .map(|state| state.paused)
            .unwrap_or(false))
    }

    // Maintenance and introspection

    /// Moves a trigger to a new start time. Returns the new first fire
    /// time, or `None` when the trigger does not exist.
    pub async fn reschedule_job(
        &self,
        tx: &Transaction,
        trigger_name: &str,
        group: &str,
        new_start: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(trigger) = self.store.get_trigger(tx, group, trigger_name).await? else {
            return Ok(None);
        };

        let mut trigger = trigger.starting_at(new_start);
        trigger.fire_count = 0;
        trigger.previous_fire_time = None;
        let first = trigger_evaluation::first_fire_time(&trigger)?.ok_or_else(|| {
            AppError::scheduler(format!("Trigger '{}' will never fire after rescheduling", trigger_name))
        })?;
        trigger.next_fire_time = Some(first);
        if !matches!(trigger.state, TriggerState::Paused | TriggerState::Executing) {
            trigger.state = TriggerState::Scheduled;
        }

        self.store.update_trigger(tx, &trigger).await?;
        info!(trigger = %trigger_name, group = %group, next_fire_time = %first, "Trigger rescheduled");
        Ok(Some(first))
    }

    pub async fn is_existing_job(&self, tx: &Transaction, tenant_id: i64, job_name: &str) -> Result<bool> {
        Ok(!self.store.descriptors_named(tx, tenant_id, job_name).await?.is_empty())
    }

    pub async fn get_jobs(&self, tx: &Transaction, tenant_id: i64) -> Result<Vec<JobDescriptor>> {
        self.store.descriptors_of_tenant(tx, tenant_id).await
    }

    pub async fn get_trigger(&self, tx: &Transaction, group: &str, name: &str) -> Result<Option<Trigger>> {
        self.store.get_trigger(tx, group, name).await
    }

    pub async fn get_job_logs(&self, tx: &Transaction, job_descriptor_id: &str) -> Result<Vec<JobLog>> {
        self.store.job_logs_of_descriptor(tx, job_descriptor_id).await
    }

    /// Whether the trigger still has a firing ahead of it
    pub async fn may_fire_again(&self, tx: &Transaction, group: &str, name: &str) -> Result<bool> {
        let Some(trigger) = self.store.get_trigger(tx, group, name).await? else {
            return Ok(false);
        };
        Ok(match trigger.state {
            TriggerState::Done => false,
            TriggerState::Executing => {
                trigger_evaluation::fire_time_after(&trigger, self.clock.now())?.is_some()
            }
            _ => trigger.next_fire_time.is_some(),
        })
    }

    /// Removes every job of the tenant; returns the number of jobs removed
    pub async fn delete_jobs(&self, tx: &Transaction, tenant_id: i64) -> Result<u64> {
        let descriptors = self.store.descriptors_of_tenant(tx, tenant_id).await?;
        let mut deleted = 0;
        for descriptor in descriptors {
            self.remove_descriptor(tx, &descriptor).await?;
            deleted += 1;
        }
        info!(tenant_id, deleted, "Tenant jobs deleted");
        Ok(deleted)
    }

    /// Removes the named job with its triggers and logs; `false` when no
    /// such job exists
    pub async fn delete_job(&self, tx: &Transaction, tenant_id: i64, job_name: &str) -> Result<bool> {
        let descriptors = self.store.descriptors_named(tx, tenant_id, job_name).await?;
        let found = !descriptors.is_empty();
        for descriptor in descriptors {
            self.remove_descriptor(tx, &descriptor).await?;
        }
        if found {
            debug!(job = %job_name, tenant_id, "Job deleted");
        }
        Ok(found)
    }

    async fn remove_descriptor(&self, tx: &Transaction, descriptor: &JobDescriptor) -> Result<()> {
        for trigger in self.store.triggers_of_descriptor(tx, &descriptor.id).await? {
            self.store.delete_trigger(tx, &trigger.id).await?;
        }
        self.store.delete_job_logs(tx, &descriptor.id).await?;
        self.store.delete_descriptor(tx, &descriptor.id).await?;
        Ok(())
    }

    /// Re-derives the next fire time of every erroneous trigger whose job
    /// can be resolved again
    pub async fn reschedule_erroneous_triggers(&self, tx: &Transaction) -> Result<u64> {
        let now = self.clock.now();
        let mut rescheduled = 0;

        for mut trigger in self.store.triggers_in_state(tx, TriggerState::Erroneous).await? {
            let Some(descriptor) = self.store.get_descriptor(tx, &trigger.job_descriptor_id).await? else {
                warn!(trigger = %trigger.name, "Erroneous trigger has no job descriptor, leaving it");
                continue;
            };
            if !self.registry.read().await.contains(&descriptor.job_class_name) {
                warn!(trigger = %trigger.name, class = %descriptor.job_class_name, "Job class still unknown");
                continue;
            }

            trigger.claimed_by = None;
            trigger.claimed_at = None;
            trigger.next_fire_time = trigger_evaluation::rescheduled_fire_time(&trigger, now)?;
            trigger.state = match trigger.next_fire_time {
                None => TriggerState::Done,
                Some(_) if self.is_tenant_paused(tx, trigger.tenant_id).await? => TriggerState::Paused,
                Some(_) => TriggerState::Scheduled,
            };
            self.store.update_trigger(tx, &trigger).await?;
            rescheduled += 1;
        }

        if rescheduled > 0 {
            info!(rescheduled, "Erroneous triggers rescheduled");
        }
        Ok(rescheduled)
    }

    /// Releases triggers and run-locks this node held when it went down.
    /// The released triggers go through the misfire check on their next
    /// dispatch.
    pub async fn recover_node_triggers(&self) -> Result<u64> {
        let recovered = self
            .executor
            .execute(|tx| async move { self.release_node_claims(&tx).await })
            .await?;
        if recovered > 0 {
            warn!(node_id = %self.node_id, recovered, "Released triggers left executing by this node");
        }
        Ok(recovered)
    }

    /// Releases claims and run-locks held past the claim timeout by any
    /// node, including nodes that never came back. Returns the number of
    /// triggers released.
    pub async fn release_expired_claims(&self) -> Result<u64> {
        let Some(cutoff) = self.clock.now().checked_sub_signed(self.config.claim_timeout()) else {
            return Ok(0);
        };
        let released = self
            .executor
            .execute(|tx| async move { self.release_claims_before(&tx, cutoff).await })
            .await?;
        if released > 0 {
            warn!(released, cutoff = %cutoff, "Released triggers whose claim expired");
        }
        Ok(released)
    }

    async fn release_claims_before(&self, tx: &Transaction, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut released = 0;
        for trigger in self.store.triggers_claimed_before(tx, cutoff).await? {
            debug!(
                trigger = %trigger.name,
                claimed_by = trigger.claimed_by.as_deref().unwrap_or("-"),
                "Claim expired"
            );
            self.release_trigger(tx, trigger).await?;
            released += 1;
        }

        for mut descriptor in self.store.descriptors_locked_before(tx, cutoff).await? {
            debug!(
                job = %descriptor.job_name,
                running_on = descriptor.running_on.as_deref().unwrap_or("-"),
                "Run-lock expired"
            );
            descriptor.running_since = None;
            descriptor.running_on = None;
            self.store.update_descriptor(tx, &descriptor).await?;
        }
        Ok(released)
    }

    /// Back to `Scheduled` (or `Paused`) with its fire time untouched, so
    /// the next dispatch applies the misfire policy to the missed firing
    async fn release_trigger(&self, tx: &Transaction, mut trigger: Trigger) -> Result<Trigger> {
        trigger.claimed_by = None;
        trigger.claimed_at = None;
        trigger.state = if self.is_tenant_paused(tx, trigger.tenant_id).await? {
            TriggerState::Paused
        } else {
            TriggerState::Scheduled
        };
        self.store.update_trigger(tx, &trigger).await
    }

    async fn release_node_claims(&self, tx: &Transaction) -> Result<u64> {
        let mut recovered = 0;
        for trigger in self.store.triggers_claimed_by(tx, &self.node_id).await? {
            self.release_trigger(tx, trigger).await?;
            recovered += 1;
        }

        for mut descriptor in self.store.descriptors_running_on(tx, &self.node_id).await? {
            descriptor.running_since = None;
            descriptor.running_on = None;
            self.store.update_descriptor(tx, &descriptor).await?;
        }
        Ok(recovered)
    }

    // Dispatch

    /// One polling pass: releases expired claims, then claims due triggers,
    /// runs their jobs and moves the triggers on
    pub async fn run_due_jobs(&self) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        match self.release_expired_claims().await {
            Ok(released) => report.expired_claims = released,
            Err(e) => warn!(error = %e, "Unable to release expired claims"),
        }

        let now = self.clock.now();
        let batch_size = self.config.batch_size;
        let store = &self.store;
        let due = self
            .executor
            .execute(|tx| async move { store.due_triggers(&tx, now, batch_size).await })
            .await
            .or_wrap(|| AppError::scheduler("Unable to read due triggers"))?;

        for candidate in due {
            if let Err(e) = self.dispatch(&candidate.id, &mut report).await {
                error!(trigger = %candidate.name, error = %e, "Error dispatching trigger");
            }
        }

        if report != DispatchReport::default() {
            debug!(?report, "Dispatch pass finished");
        }
        Ok(report)
    }

    async fn dispatch(&self, trigger_id: &str, report: &mut DispatchReport) -> Result<()> {
        let now = self.clock.now();
        let claim = self
            .executor
            .execute_once(|tx| async move { self.claim(&tx, trigger_id, now).await })
            .await;

        let (trigger, descriptor) = match claim {
            Ok(Claim::Claimed { trigger, descriptor }) => (trigger, descriptor),
            Ok(Claim::Misfired) => {
                report.misfired += 1;
                return Ok(());
            }
            Ok(Claim::Erroneous) => {
                report.erroneous += 1;
                return Ok(());
            }
            Ok(Claim::Busy) => {
                report.busy += 1;
                return Ok(());
            }
            Ok(Claim::Skipped) => return Ok(()),
            Err(e) if e.is_concurrency_conflict() => {
                debug!(trigger_id = %trigger_id, "Trigger claimed by another worker");
                report.lost_claims += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        report.claimed += 1;

        match self.run_job(&descriptor).await {
            Ok(()) => report.executed += 1,
            Err(e) => {
                report.failed += 1;
                error!(
                    job = %descriptor.job_name,
                    trigger = %trigger.name,
                    error = %e.full_message(),
                    "Job execution failed"
                );
                let message = e.full_message();
                let (descriptor_ref, message) = (&descriptor, &message);
                if let Err(log_error) = self
                    .executor
                    .execute(|tx| async move { self.record_failure(&tx, descriptor_ref, message).await })
                    .await
                {
                    error!(job = %descriptor.job_name, error = %log_error, "Unable to record job failure");
                }
            }
        }

        let (claimed, descriptor_id) = (&trigger, descriptor.id.as_str());
        self.executor
            .execute(|tx| async move { self.finalize(&tx, claimed, descriptor_id).await })
            .await
            .or_wrap(|| AppError::scheduler(format!("Unable to finalize trigger '{}'", trigger.name)))
    }

    async fn claim(&self, tx: &Transaction, trigger_id: &str, now: DateTime<Utc>) -> Result<Claim> {
        let Some(mut trigger) = self.store.get_trigger_by_id(tx, trigger_id).await? else {
            return Ok(Claim::Skipped);
        };
        let Some(scheduled) = trigger.next_fire_time else {
            return Ok(Claim::Skipped);
        };
        if !matches!(trigger.state, TriggerState::Scheduled | TriggerState::Due) || scheduled > now {
            return Ok(Claim::Skipped);
        }

        let descriptor = self.store.get_descriptor(tx, &trigger.job_descriptor_id).await?;
        let known_class = match &descriptor {
            Some(d) => self.registry.read().await.contains(&d.job_class_name),
            None => false,
        };
        let Some(mut descriptor) = descriptor.filter(|_| known_class) else {
            warn!(trigger = %trigger.name, "Job of trigger cannot be resolved, marking trigger erroneous");
            trigger.state = TriggerState::Erroneous;
            self.store.update_trigger(tx, &trigger).await?;
            return Ok(Claim::Erroneous);
        };

        if trigger.state == TriggerState::Scheduled
            && trigger_evaluation::is_misfire(scheduled, now, self.config.misfire_threshold())
        {
            self.apply_misfire(&mut trigger, now)?;
            if trigger.state != TriggerState::Due {
                self.store.update_trigger(tx, &trigger).await?;
                info!(trigger = %trigger.name, "Misfired trigger skipped");
                return Ok(Claim::Misfired);
            }
        }

        if descriptor.disallow_concurrent_execution {
            if descriptor.is_running() {
                return Ok(Claim::Busy);
            }
            descriptor.running_since = Some(now);
            descriptor.running_on = Some(self.node_id.clone());
            descriptor = self.store.update_descriptor(tx, &descriptor).await?;
        }

        trigger.previous_fire_time = trigger.next_fire_time;
        trigger.state = TriggerState::Executing;
        trigger.claimed_by = Some(self.node_id.clone());
        trigger.claimed_at = Some(now);
        let trigger = self.store.update_trigger(tx, &trigger).await?;

        Ok(Claim::Claimed { trigger, descriptor })
    }

    async fn run_job(&self, descriptor: &JobDescriptor) -> Result<()> {
        let mut job = self.registry.read().await.create(&descriptor.job_class_name)?;
        job.set_attributes(&descriptor.parameters)?;

        let job: &dyn StatelessJob = job.as_ref();
        let context = ErrorContext::new("scheduler", "execute_job")
            .with_tenant(descriptor.tenant_id)
            .with_context("job", json!(descriptor.job_name));
        self.executor
            .execute_with_context(|tx| async move { job.execute(&tx).await }, context)
            .await
    }

    async fn record_failure(&self, tx: &Transaction, descriptor: &JobDescriptor, message: &str) -> Result<()> {
        let now = self.clock.now();
        match self.store.get_job_log(tx, &descriptor.id).await? {
            Some(mut log) => {
                log.retry_number += 1;
                log.exception_message = message.to_string();
                log.last_update = now;
                self.store.update_job_log(tx, &log).await?;
            }
            None => {
                let log = JobLog {
                    id: SchedulerStore::job_log_id(&descriptor.id),
                    job_descriptor_id: descriptor.id.clone(),
                    tenant_id: descriptor.tenant_id,
                    exception_message: message.to_string(),
                    retry_number: 0,
                    last_update: now,
                    version: 0,
                };
                self.store.insert_job_log(tx, &log).await?;
            }
        }
        Ok(())
    }

    /// Moves the trigger on, unless its claim expired and someone else took
    /// it over while the job ran
    async fn finalize(&self, tx: &Transaction, claimed: &Trigger, descriptor_id: &str) -> Result<()> {
        let now = self.clock.now();

        match self.store.get_trigger_by_id(tx, &claimed.id).await? {
            Some(mut trigger)
                if trigger.state == TriggerState::Executing
                    && trigger.claimed_by == claimed.claimed_by
                    && trigger.claimed_at == claimed.claimed_at =>
            {
                trigger.fire_count += 1;
                trigger.claimed_by = None;
                trigger.claimed_at = None;

                let next = if trigger.schedule.is_recurring() {
                    trigger_evaluation::fire_time_after(&trigger, now)?
                } else {
                    None
                };
                trigger.next_fire_time = next;
                trigger.state = match next {
                    None => TriggerState::Done,
                    Some(_) if self.is_tenant_paused(tx, trigger.tenant_id).await? => {
                        trigger.paused_at = Some(now);
                        TriggerState::Paused
                    }
                    Some(_) => TriggerState::Scheduled,
                };
                self.store.update_trigger(tx, &trigger).await?;
            }
            Some(trigger) => {
                debug!(trigger = %trigger.name, state = trigger.state.as_str(), "Trigger changed while executing");
            }
            None => debug!(trigger = %claimed.name, "Trigger deleted while executing"),
        }

        if let Some(mut descriptor) = self.store.get_descriptor(tx, descriptor_id).await? {
            if descriptor.running_on.as_deref() == Some(self.node_id.as_str()) {
                descriptor.running_since = None;
                descriptor.running_on = None;
                self.store.update_descriptor(tx, &descriptor).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SchedulerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerService")
            .field("node_id", &self.node_id)
            .field("started", &self.is_started())
            .field("config", &self.config)
            .finish()
    }
}
