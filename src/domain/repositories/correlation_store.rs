use chrono::{DateTime, Utc};

use super::EntityStore;
use crate::core::transaction::Transaction;
use crate::domain::entities::{MessageInstance, TimerEventTriggerInstance, WaitingEvent};
use crate::error::Result;
use crate::infrastructure::persistence::QueryCriteria;

/// Typed access to waiting events, message instances and timer rows
#[derive(Clone)]
pub struct EventCorrelationStore {
    entities: EntityStore,
}

impl EventCorrelationStore {
    pub fn new(entities: EntityStore) -> Self {
        Self { entities }
    }

    // Waiting events

    pub async fn insert_waiting_event(&self, tx: &Transaction, event: &WaitingEvent) -> Result<WaitingEvent> {
        self.entities.insert(tx, event).await
    }

    pub async fn update_waiting_event(&self, tx: &Transaction, event: &WaitingEvent) -> Result<WaitingEvent> {
        self.entities.update(tx, event).await
    }

    pub async fn delete_waiting_event(&self, tx: &Transaction, id: &str) -> Result<bool> {
        self.entities.delete::<WaitingEvent>(tx, id).await
    }

    pub async fn get_waiting_event(&self, tx: &Transaction, id: &str) -> Result<Option<WaitingEvent>> {
        self.entities.get(tx, id).await
    }

    /// Waiting events of the same type on the same flow node (or start event)
    pub async fn waiting_events_with_owner_of(&self, tx: &Transaction, event: &WaitingEvent) -> Result<Vec<WaitingEvent>> {
        let mut criteria = QueryCriteria::new()
            .eq("event_type", event.trigger.event_type())
            .eq("process_definition_id", event.process_definition_id)
            .eq("flow_node_name", event.flow_node_name.as_str());
        criteria = match event.flow_node_instance_id {
            Some(flow_node_instance_id) => criteria.eq("flow_node_instance_id", flow_node_instance_id),
            None => criteria.is_null("flow_node_instance_id"),
        };
        self.entities.find(tx, &criteria).await
    }

    /// Active, unclaimed waiting message events a message of `message_name`
    /// sent to `process_name` could reach, oldest first
    pub async fn matchable_message_events(
        &self,
        tx: &Transaction,
        message_name: &str,
        process_name: &str,
        flow_node_name: Option<&str>,
    ) -> Result<Vec<WaitingEvent>> {
        let mut criteria = QueryCriteria::new()
            .eq("event_type", "Message")
            .eq("message_name", message_name)
            .eq("process_name", process_name)
            .eq("active", true)
            .eq("in_progress", false)
            .order_by_asc("created_at")
            .order_by_asc("creation_seq");
        if let Some(flow_node_name) = flow_node_name {
            criteria = criteria.eq("flow_node_name", flow_node_name);
        }
        self.entities.find(tx, &criteria).await
    }

    pub async fn matchable_signal_events(&self, tx: &Transaction, signal_name: &str, max: usize) -> Result<Vec<WaitingEvent>> {
        let criteria = QueryCriteria::new()
            .eq("event_type", "Signal")
            .eq("signal_name", signal_name)
            .eq("active", true)
            .eq("in_progress", false)
            .order_by_asc("created_at")
            .order_by_asc("creation_seq")
            .max_results(max);
        self.entities.find(tx, &criteria).await
    }

    pub async fn boundary_error_events(&self, tx: &Transaction, related_activity_instance_id: i64) -> Result<Vec<WaitingEvent>> {
        let criteria = QueryCriteria::new()
            .eq("event_type", "Error")
            .eq("related_activity_instance_id", related_activity_instance_id)
            .eq("active", true)
            .order_by_asc("created_at")
            .order_by_asc("creation_seq");
        self.entities.find(tx, &criteria).await
    }

    pub async fn in_progress_waiting_events(&self, tx: &Transaction, max: usize) -> Result<Vec<WaitingEvent>> {
        let criteria = QueryCriteria::new()
            .eq("in_progress", true)
            .order_by_asc("created_at")
            .order_by_asc("creation_seq")
            .max_results(max);
        self.entities.find(tx, &criteria).await
    }

    pub async fn waiting_events_of_flow_node(&self, tx: &Transaction, flow_node_instance_id: i64) -> Result<Vec<WaitingEvent>> {
        let criteria = QueryCriteria::new()
            .eq("flow_node_instance_id", flow_node_instance_id)
            .order_by_asc("created_at")
            .order_by_asc("creation_seq");
        self.entities.find(tx, &criteria).await
    }

    pub async fn delete_waiting_events_of_flow_node(&self, tx: &Transaction, flow_node_instance_id: i64) -> Result<u64> {
        let criteria = QueryCriteria::new().eq("flow_node_instance_id", flow_node_instance_id);
        self.entities.delete_where::<WaitingEvent>(tx, &criteria).await
    }

    pub async fn delete_waiting_events_of_process_instance(&self, tx: &Transaction, process_instance_id: i64) -> Result<u64> {
        let criteria = QueryCriteria::new().eq("parent_process_instance_id", process_instance_id);
        self.entities.delete_where::<WaitingEvent>(tx, &criteria).await
    }

    // Message instances

    pub async fn insert_message(&self, tx: &Transaction, message: &MessageInstance) -> Result<MessageInstance> {
        self.entities.insert(tx, message).await
    }

    pub async fn update_message(&self, tx: &Transaction, message: &MessageInstance) -> Result<MessageInstance> {
        self.entities.update(tx, message).await
    }

    pub async fn delete_message(&self, tx: &Transaction, id: &str) -> Result<bool> {
        self.entities.delete::<MessageInstance>(tx, id).await
    }

    pub async fn get_message(&self, tx: &Transaction, id: &str) -> Result<Option<MessageInstance>> {
        self.entities.get(tx, id).await
    }

    /// Unclaimed messages, oldest first
    pub async fn unhandled_messages(&self, tx: &Transaction, from_index: usize, max: usize) -> Result<Vec<MessageInstance>> {
        let criteria = QueryCriteria::new()
            .eq("handled", false)
            .order_by_asc("created_at")
            .order_by_asc("creation_seq")
            .from_index(from_index)
            .max_results(max);
        self.entities.find(tx, &criteria).await
    }

    pub async fn handled_messages(&self, tx: &Transaction, max: usize) -> Result<Vec<MessageInstance>> {
        let criteria = QueryCriteria::new()
            .eq("handled", true)
            .order_by_asc("created_at")
            .order_by_asc("creation_seq")
            .max_results(max);
        self.entities.find(tx, &criteria).await
    }

    pub async fn unhandled_messages_created_before(
        &self,
        tx: &Transaction,
        cutoff: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<MessageInstance>> {
        let criteria = QueryCriteria::new()
            .eq("handled", false)
            .lt("created_at", cutoff.timestamp_millis())
            .order_by_asc("created_at")
            .order_by_asc("creation_seq")
            .max_results(max);
        self.entities.find(tx, &criteria).await
    }

    // Timer rows

    pub async fn insert_timer(&self, tx: &Transaction, timer: &TimerEventTriggerInstance) -> Result<TimerEventTriggerInstance> {
        self.entities.insert(tx, timer).await
    }

    pub async fn get_timer(&self, tx: &Transaction, id: &str) -> Result<Option<TimerEventTriggerInstance>> {
        self.entities.get(tx, id).await
    }

    pub async fn timer_of_event_instance(&self, tx: &Transaction, event_instance_id: i64) -> Result<Option<TimerEventTriggerInstance>> {
        let criteria = QueryCriteria::new().eq("event_instance_id", event_instance_id);
        self.entities.find_one(tx, &criteria).await
    }

    pub async fn timers_of_process_instance(&self, tx: &Transaction, process_instance_id: i64) -> Result<Vec<TimerEventTriggerInstance>> {
        let criteria = QueryCriteria::new()
            .eq("process_instance_id", process_instance_id)
            .order_by_asc("event_instance_id");
        self.entities.find(tx, &criteria).await
    }

    pub async fn delete_timer(&self, tx: &Transaction, id: &str) -> Result<bool> {
        self.entities.delete::<TimerEventTriggerInstance>(tx, id).await
    }
}
