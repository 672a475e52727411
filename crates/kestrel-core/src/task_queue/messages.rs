use std::time::Duration;

use crate::TaskMessage;

#[derive(Debug)]
pub(crate) enum SchedulerCommand {
    Schedule { message: TaskMessage, delay: Duration },
    Shutdown,
}
