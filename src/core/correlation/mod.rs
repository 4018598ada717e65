//! Event correlation engine
//!
//! Matches fired messages against waiting message events, signals against
//! waiting signal events and errors against boundary error events. Matching
//! claims the rows it pairs (`handled` on the message, `in_progress` on the
//! waiting event) inside the caller's transaction, so concurrent passes on
//! this or another node serialize on row contention.

pub mod matching;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::clock::{Clock, CreationSequence};
use crate::core::transaction::Transaction;
use crate::domain::entities::{
    MessageEventCouple, MessageInstance, TimerEventTriggerInstance, WaitingEvent, WaitingTrigger,
};
use crate::domain::repositories::EventCorrelationStore;
use crate::error::{AppError, Result, ResultExt};

const RESET_PAGE_SIZE: usize = 500;

pub struct EventCorrelationEngine {
    store: EventCorrelationStore,
    clock: Arc<dyn Clock>,
    sequence: CreationSequence,
}

impl EventCorrelationEngine {
    pub fn new(store: EventCorrelationStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            sequence: CreationSequence::new(),
        }
    }

    /// Persists a waiting event. Fails with `CreationError` when the same
    /// owner already waits on the same trigger.
    pub async fn create_waiting_event(&self, tx: &Transaction, event: WaitingEvent) -> Result<WaitingEvent> {
        match &event.trigger {
            WaitingTrigger::Signal { signal_name } if signal_name.trim().is_empty() => {
                return Err(AppError::creation("Waiting signal event without signal name"));
            }
            WaitingTrigger::Message { message_name, correlations } => {
                if message_name.trim().is_empty() {
                    return Err(AppError::creation("Waiting message event without message name"));
                }
                matching::validate_correlations(correlations)?;
            }
            _ => {}
        }

        let existing = self
            .store
            .waiting_events_with_owner_of(tx, &event)
            .await
            .or_wrap(|| AppError::creation(format!("Cannot check duplicates of waiting event {}", event.id)))?;
        if existing.iter().any(|other| other.trigger == event.trigger) {
            return Err(AppError::creation(format!(
                "Flow node '{}' of process '{}' already waits for {} '{}'",
                event.flow_node_name,
                event.process_name,
                event.trigger.event_type(),
                event.trigger.correlation_name().unwrap_or("*")
            )));
        }

        let mut event = event;
        event.created_at = self.clock.now();
        event.creation_seq = self.sequence.next(event.created_at);
        event.in_progress = false;
        event.active = true;

        let created = self
            .store
            .insert_waiting_event(tx, &event)
            .await
            .or_wrap(|| AppError::creation(format!("Cannot create waiting event {}", event.id)))?;
        debug!(
            waiting_event_id = %created.id,
            event_type = created.trigger.event_type(),
            name = created.trigger.correlation_name().unwrap_or("*"),
            "Waiting event created"
        );
        Ok(created)
    }

    /// Persists a fired message; matching happens later in a correlation pass
    pub async fn create_message_instance(&self, tx: &Transaction, message: MessageInstance) -> Result<MessageInstance> {
        if message.message_name.trim().is_empty() {
            return Err(AppError::creation("Message instance without message name"));
        }
        matching::validate_correlations(&message.correlations)?;

        let mut message = message;
        message.created_at = self.clock.now();
        message.creation_seq = self.sequence.next(message.created_at);
        message.handled = false;

        let created = self
            .store
            .insert_message(tx, &message)
            .await
            .or_wrap(|| AppError::creation(format!("Cannot create message instance {}", message.id)))?;
        debug!(message_id = %created.id, message_name = %created.message_name, "Message instance created");
        Ok(created)
    }

    /// Pairs up to `limit` unclaimed messages with unclaimed waiting message
    /// events and claims both rows of every pair in `tx`.
    ///
    /// Messages are taken oldest first; each goes to the oldest waiting event
    /// (creation order, also within one millisecond)
    /// whose declared correlations it satisfies. A pair whose claim loses
    /// against a concurrent pass is skipped.
    pub async fn get_message_event_couples(&self, tx: &Transaction, limit: usize) -> Result<Vec<MessageEventCouple>> {
        let mut couples = Vec::new();
        if limit == 0 {
            return Ok(couples);
        }

        let page_size = limit.max(100);
        let mut from_index = 0;
        let mut candidates: HashMap<(String, String), Vec<WaitingEvent>> = HashMap::new();
        let mut used_events: HashSet<String> = HashSet::new();

        'pages: loop {
            let messages = self
                .store
                .unhandled_messages(tx, from_index, page_size)
                .await
                .or_wrap(|| AppError::read("Cannot read unhandled message instances"))?;
            let page_len = messages.len();
            let mut claimed_in_page = 0;

            for message in messages {
                let key = (message.message_name.clone(), message.target_process.clone());
                if !candidates.contains_key(&key) {
                    let events = self
                        .store
                        .matchable_message_events(tx, &key.0, &key.1, None)
                        .await
                        .or_wrap(|| AppError::read(format!("Cannot read waiting events for message '{}'", key.0)))?;
                    candidates.insert(key.clone(), events);
                }

                let chosen = candidates.get(&key).and_then(|events| {
                    events
                        .iter()
                        .find(|event| !used_events.contains(&event.id) && matching::is_candidate(&message, event))
                        .cloned()
                });
                let Some(event) = chosen else {
                    continue;
                };
                used_events.insert(event.id.clone());

                if let Some(couple) = self.claim(tx, message, event).await? {
                    couples.push(couple);
                    claimed_in_page += 1;
                    if couples.len() >= limit {
                        break 'pages;
                    }
                }
            }

            if page_len < page_size {
                break;
            }
            // Claimed messages drop out of the unhandled list
            from_index += page_size - claimed_in_page;
        }

        if !couples.is_empty() {
            debug!(couples = couples.len(), "Message event couples claimed");
        }
        Ok(couples)
    }

    async fn claim(
        &self,
        tx: &Transaction,
        message: MessageInstance,
        event: WaitingEvent,
    ) -> Result<Option<MessageEventCouple>> {
        let mut marked = message;
        marked.handled = true;
        let message = match self.store.update_message(tx, &marked).await {
            Ok(message) => message,
            Err(e) if e.is_concurrency_conflict() || e.is_not_found() => {
                debug!(message_id = %marked.id, "Message claimed elsewhere, skipping");
                return Ok(None);
            }
            Err(e) => {
                return Err(AppError::modification(format!("Cannot mark message {} as handled", marked.id)).with_source(e))
            }
        };

        let mut in_progress = event;
        in_progress.in_progress = true;
        match self.store.update_waiting_event(tx, &in_progress).await {
            Ok(waiting_event) => Ok(Some(MessageEventCouple { message, waiting_event })),
            Err(e) if e.is_concurrency_conflict() || e.is_not_found() => {
                debug!(waiting_event_id = %in_progress.id, "Waiting event claimed elsewhere, giving back message");
                let mut back = message;
                back.handled = false;
                self.store
                    .update_message(tx, &back)
                    .await
                    .or_wrap(|| AppError::modification(format!("Cannot give back message {}", back.id)))?;
                Ok(None)
            }
            Err(e) => Err(AppError::modification(format!(
                "Cannot mark waiting event {} as in progress",
                in_progress.id
            ))
            .with_source(e)),
        }
    }

    /// Finishes a delivered couple: the message is deleted, the waiting event
    /// too unless it is a reusable start event, which becomes matchable again
    pub async fn consume_couple(&self, tx: &Transaction, couple: &MessageEventCouple) -> Result<()> {
        self.delete_message_instance(tx, &couple.message.id).await?;

        if couple.waiting_event.event_kind.is_reusable() {
            self.release_waiting_event(tx, &couple.waiting_event.id).await
        } else {
            self.delete_waiting_event(tx, &couple.waiting_event.id).await.map(|_| ())
        }
    }

    /// Gives both rows of a couple back to matching
    pub async fn release_couple(&self, tx: &Transaction, couple: &MessageEventCouple) -> Result<()> {
        if let Some(mut message) = self.get_message_instance(tx, &couple.message.id).await? {
            if message.handled {
                message.handled = false;
                self.store
                    .update_message(tx, &message)
                    .await
                    .or_wrap(|| AppError::modification(format!("Cannot release message {}", message.id)))?;
            }
        }
        self.release_waiting_event(tx, &couple.waiting_event.id).await
    }

    async fn release_waiting_event(&self, tx: &Transaction, id: &str) -> Result<()> {
        if let Some(mut event) = self.get_waiting_event(tx, id).await? {
            if event.in_progress {
                event.in_progress = false;
                self.store
                    .update_waiting_event(tx, &event)
                    .await
                    .or_wrap(|| AppError::modification(format!("Cannot release waiting event {}", id)))?;
            }
        }
        Ok(())
    }

    /// Crash recovery: clears `in_progress` on every waiting event
    pub async fn reset_in_progress_waiting_events(&self, tx: &Transaction) -> Result<u64> {
        let mut reset = 0;
        loop {
            let events = self
                .store
                .in_progress_waiting_events(tx, RESET_PAGE_SIZE)
                .await
                .or_wrap(|| AppError::read("Cannot read in-progress waiting events"))?;
            if events.is_empty() {
                break;
            }
            for mut event in events {
                event.in_progress = false;
                self.store
                    .update_waiting_event(tx, &event)
                    .await
                    .or_wrap(|| AppError::modification(format!("Cannot reset waiting event {}", event.id)))?;
                reset += 1;
            }
        }

        if reset > 0 {
            info!(count = reset, "🔄 Reset in-progress waiting events");
        }
        Ok(reset)
    }

    /// Crash recovery: clears `handled` on every message instance still stored
    pub async fn reset_progress_message_instances(&self, tx: &Transaction) -> Result<u64> {
        let mut reset = 0;
        loop {
            let messages = self
                .store
                .handled_messages(tx, RESET_PAGE_SIZE)
                .await
                .or_wrap(|| AppError::read("Cannot read handled message instances"))?;
            if messages.is_empty() {
                break;
            }
            for mut message in messages {
                message.handled = false;
                self.store
                    .update_message(tx, &message)
                    .await
                    .or_wrap(|| AppError::modification(format!("Cannot reset message instance {}", message.id)))?;
                reset += 1;
            }
        }

        if reset > 0 {
            info!(count = reset, "🔄 Reset handled message instances");
        }
        Ok(reset)
    }

    /// Claims the waiting events of a signal. Start events are returned
    /// without being claimed; they stay in place for the next signal.
    pub async fn match_signal(&self, tx: &Transaction, signal_name: &str, max: usize) -> Result<Vec<WaitingEvent>> {
        let events = self
            .store
            .matchable_signal_events(tx, signal_name, max)
            .await
            .or_wrap(|| AppError::read(format!("Cannot read waiting events for signal '{}'", signal_name)))?;

        let mut matched = Vec::with_capacity(events.len());
        for event in events {
            if event.event_kind.is_reusable() {
                matched.push(event);
                continue;
            }

            let mut claimed = event;
            claimed.in_progress = true;
            match self.store.update_waiting_event(tx, &claimed).await {
                Ok(event) => matched.push(event),
                Err(e) if e.is_concurrency_conflict() || e.is_not_found() => {
                    debug!(waiting_event_id = %claimed.id, "Signal event claimed elsewhere, skipping");
                }
                Err(e) => {
                    return Err(AppError::modification(format!(
                        "Cannot mark waiting event {} as in progress",
                        claimed.id
                    ))
                    .with_source(e))
                }
            }
        }

        debug!(signal = signal_name, matched = matched.len(), "Signal matched");
        Ok(matched)
    }

    /// Boundary event of `related_activity_instance_id` catching `error_code`
    pub async fn get_boundary_error_event(
        &self,
        tx: &Transaction,
        related_activity_instance_id: i64,
        error_code: Option<&str>,
    ) -> Result<Option<WaitingEvent>> {
        let events = self
            .store
            .boundary_error_events(tx, related_activity_instance_id)
            .await
            .or_wrap(|| {
                AppError::read(format!(
                    "Cannot read boundary error events of activity {}",
                    related_activity_instance_id
                ))
            })?;
        Ok(matching::select_boundary_error(&events, error_code).cloned())
    }

    pub async fn get_waiting_event(&self, tx: &Transaction, id: &str) -> Result<Option<WaitingEvent>> {
        self.store
            .get_waiting_event(tx, id)
            .await
            .or_wrap(|| AppError::read(format!("Cannot read waiting event {}", id)))
    }

    pub async fn get_message_instance(&self, tx: &Transaction, id: &str) -> Result<Option<MessageInstance>> {
        self.store
            .get_message(tx, id)
            .await
            .or_wrap(|| AppError::read(format!("Cannot read message instance {}", id)))
    }

    pub async fn get_waiting_events_of_flow_node(&self, tx: &Transaction, flow_node_instance_id: i64) -> Result<Vec<WaitingEvent>> {
        self.store
            .waiting_events_of_flow_node(tx, flow_node_instance_id)
            .await
            .or_wrap(|| AppError::read(format!("Cannot read waiting events of flow node {}", flow_node_instance_id)))
    }

    /// Hard delete; returns whether the row existed
    pub async fn delete_waiting_event(&self, tx: &Transaction, id: &str) -> Result<bool> {
        self.store
            .delete_waiting_event(tx, id)
            .await
            .or_wrap(|| AppError::modification(format!("Cannot delete waiting event {}", id)))
    }

    /// Hard delete; returns whether the row existed
    pub async fn delete_message_instance(&self, tx: &Transaction, id: &str) -> Result<bool> {
        self.store
            .delete_message(tx, id)
            .await
            .or_wrap(|| AppError::modification(format!("Cannot delete message instance {}", id)))
    }

    pub async fn delete_waiting_events_of_flow_node(&self, tx: &Transaction, flow_node_instance_id: i64) -> Result<u64> {
        self.store
            .delete_waiting_events_of_flow_node(tx, flow_node_instance_id)
            .await
            .or_wrap(|| {
                AppError::modification(format!("Cannot delete waiting events of flow node {}", flow_node_instance_id))
            })
    }

    pub async fn delete_waiting_events_of_process_instance(&self, tx: &Transaction, process_instance_id: i64) -> Result<u64> {
        self.store
            .delete_waiting_events_of_process_instance(tx, process_instance_id)
            .await
            .or_wrap(|| {
                AppError::modification(format!(
                    "Cannot delete waiting events of process instance {}",
                    process_instance_id
                ))
            })
    }

    /// Deletes up to `max` unmatched messages created before `cutoff`
    pub async fn delete_message_instances_created_before(
        &self,
        tx: &Transaction,
        cutoff: DateTime<Utc>,
        max: usize,
    ) -> Result<u64> {
        let expired = self
            .store
            .unhandled_messages_created_before(tx, cutoff, max)
            .await
            .or_wrap(|| AppError::read("Cannot read expired message instances"))?;

        let mut deleted = 0;
        for message in expired {
            if self.delete_message_instance(tx, &message.id).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            warn!(count = deleted, cutoff = %cutoff, "Deleted unmatched message instances past retention");
        }
        Ok(deleted)
    }

    // Timer rows

    pub async fn create_timer_trigger_instance(
        &self,
        tx: &Transaction,
        timer: TimerEventTriggerInstance,
    ) -> Result<TimerEventTriggerInstance> {
        self.store
            .insert_timer(tx, &timer)
            .await
            .or_wrap(|| AppError::creation(format!("Cannot create timer {}", timer.id)))
    }

    pub async fn get_timer_trigger_instance(&self, tx: &Transaction, id: &str) -> Result<Option<TimerEventTriggerInstance>> {
        self.store
            .get_timer(tx, id)
            .await
            .or_wrap(|| AppError::read(format!("Cannot read timer {}", id)))
    }

    pub async fn get_timer_trigger_instance_of_event_instance(
        &self,
        tx: &Transaction,
        event_instance_id: i64,
    ) -> Result<Option<TimerEventTriggerInstance>> {
        self.store
            .timer_of_event_instance(tx, event_instance_id)
            .await
            .or_wrap(|| AppError::read(format!("Cannot read timer of event instance {}", event_instance_id)))
    }

    pub async fn get_timer_trigger_instances_of_process_instance(
        &self,
        tx: &Transaction,
        process_instance_id: i64,
    ) -> Result<Vec<TimerEventTriggerInstance>> {
        self.store
            .timers_of_process_instance(tx, process_instance_id)
            .await
            .or_wrap(|| AppError::read(format!("Cannot read timers of process instance {}", process_instance_id)))
    }

    pub async fn delete_timer_trigger_instance(&self, tx: &Transaction, id: &str) -> Result<bool> {
        self.store
            .delete_timer(tx, id)
            .await
            .or_wrap(|| AppError::modification(format!("Cannot delete timer {}", id)))
    }
}
