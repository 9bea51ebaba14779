//! Error types for the conveyor pipeline engine.

use thiserror::Error;

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The input queue of a stage is at capacity and the stage is configured
    /// to reject overflowing input.
    #[error("input queue for stage '{stage}' is full")]
    QueueFull {
        /// The stage whose queue rejected the element.
        stage: String,
    },

    /// Processing a single element failed. The stage records the failure and
    /// continues with the next element.
    #[error("element processing failed: {message}")]
    Process {
        /// Description of the failure.
        message: String,
    },

    /// A stage could not complete its run at all.
    #[error("stage '{stage}' failed: {message}")]
    StageFatal {
        /// The stage that failed.
        stage: String,
        /// Description of the failure.
        message: String,
    },

    /// A generic internal error.
    #[error("internal pipeline error: {0}")]
    Internal(String),

    /// An error from processor code using `anyhow` for context.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Creates an element-processing error.
    #[must_use]
    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "stage panicked".to_string()
    }
}
