use crate::task::{TaskId, TaskOrigin};
use std::any::Any;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single callable.
pub type TaskResult = Result<(), anyhow::Error>;

/// Errors returned to callers of the public scheduling API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// New work was offered after `stop()`, or through a handle whose loop is gone.
    #[error("event loop has been stopped")]
    Stopped,

    /// A run method was entered from inside a task the loop is executing.
    #[error("`{operation}` called from inside a running task")]
    Reentrant { operation: &'static str },

    /// The timer's deadline cannot be represented by the loop's clock.
    #[error("timer delay {delay:?} is out of range for the clock")]
    DelayOutOfRange { delay: Duration },
}

/// Why a callable did not complete successfully.
#[derive(Debug, Error)]
pub enum FailureCause {
    #[error(transparent)]
    Failed(anyhow::Error),

    #[error("panicked: {0}")]
    Panicked(String),
}

/// A failure raised by user code inside a task. Never propagated out of the
/// loop; routed to the error hook or the diagnostics list instead.
#[derive(Debug, Error)]
#[error("task {task} ({origin}) failed: {cause}")]
pub struct CallableError {
    pub task: TaskId,
    pub origin: TaskOrigin,
    #[source]
    pub cause: FailureCause,
}

impl CallableError {
    pub fn is_panic(&self) -> bool {
        matches!(self.cause, FailureCause::Panicked(_))
    }
}

/// Conversion from whatever a task closure returns into a [`TaskResult`].
///
/// Implemented for `()` and for `Result<(), E>` with any error type anyhow
/// can absorb, so both plain closures and fallible ones can be scheduled.
pub trait IntoTaskResult {
    fn into_task_result(self) -> TaskResult;
}

impl IntoTaskResult for () {
    fn into_task_result(self) -> TaskResult {
        Ok(())
    }
}

impl<E> IntoTaskResult for Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_task_result(self) -> TaskResult {
        self.map_err(Into::into)
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_render_as_text() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7_u32)), "non-string panic payload");
    }

    #[test]
    fn fallible_closures_convert() {
        assert!(().into_task_result().is_ok());

        let failed: Result<(), std::io::Error> = Err(std::io::Error::other("disk"));
        let err = failed.into_task_result().unwrap_err();
        assert_eq!(err.to_string(), "disk");
    }
}
