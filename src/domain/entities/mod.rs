pub mod job;
pub mod message;
pub mod timer;
pub mod waiting_event;

pub use job::{
    JobDescriptor, JobLog, JobParameters, MisfirePolicy, TenantState, Trigger, TriggerSchedule,
    TriggerState,
};
pub use message::{MessageEventCouple, MessageInstance};
pub use timer::TimerEventTriggerInstance;
pub use waiting_event::{CatchEventKind, Correlation, WaitingEvent, WaitingTrigger, MAX_CORRELATIONS};
