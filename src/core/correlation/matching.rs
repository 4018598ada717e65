//! Matching rules between messages, signals, errors and waiting events

use crate::domain::entities::{Correlation, MessageInstance, WaitingEvent, WaitingTrigger, MAX_CORRELATIONS};
use crate::error::{AppError, Result};

/// Every correlation declared by the waiting event must be carried, with the
/// same value, by the message. The message may carry more.
pub fn correlations_satisfied(declared: &[Correlation], carried: &[Correlation]) -> bool {
    declared.iter().all(|wanted| {
        carried
            .iter()
            .any(|offered| offered.key == wanted.key && offered.value == wanted.value)
    })
}

/// Whether `event` can take `message`
pub fn is_candidate(message: &MessageInstance, event: &WaitingEvent) -> bool {
    let WaitingTrigger::Message { message_name, correlations } = &event.trigger else {
        return false;
    };

    if *message_name != message.message_name || event.process_name != message.target_process {
        return false;
    }
    if let Some(flow_node) = &message.target_flow_node {
        if *flow_node != event.flow_node_name {
            return false;
        }
    }
    correlations_satisfied(correlations, &message.correlations)
}

/// At most [`MAX_CORRELATIONS`] pairs, non-empty and distinct keys
pub fn validate_correlations(correlations: &[Correlation]) -> Result<()> {
    if correlations.len() > MAX_CORRELATIONS {
        return Err(AppError::creation(format!(
            "{} correlations given, at most {} are supported",
            correlations.len(),
            MAX_CORRELATIONS
        )));
    }
    for (index, correlation) in correlations.iter().enumerate() {
        if correlation.key.trim().is_empty() {
            return Err(AppError::creation("Correlation key must not be empty"));
        }
        if correlations[..index].iter().any(|c| c.key == correlation.key) {
            return Err(AppError::creation(format!(
                "Correlation key '{}' is declared twice",
                correlation.key
            )));
        }
    }
    Ok(())
}

/// Boundary event catching `error_code`: an exact code match wins over a
/// catch-all boundary (one without code)
pub fn select_boundary_error<'a>(events: &'a [WaitingEvent], error_code: Option<&str>) -> Option<&'a WaitingEvent> {
    let code_of = |event: &WaitingEvent| match &event.trigger {
        WaitingTrigger::Error { error_code, .. } => Some(error_code.clone()),
        _ => None,
    };

    let exact = error_code.and_then(|wanted| {
        events
            .iter()
            .find(|event| code_of(event) == Some(Some(wanted.to_string())))
    });
    exact.or_else(|| events.iter().find(|event| code_of(event) == Some(None)))
}
