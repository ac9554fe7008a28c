use thiserror::Error as ThisError;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum TriggerError {
    #[error("collection queue is full")]
    QueueFull,
    #[error("collection manager is not running")]
    Stopped,
}

/// Submits an on-demand collection without waiting for it to run.
pub trait CollectionTrigger: Send + Sync {
    fn trigger(&self, owner_id: &str) -> Result<(), TriggerError>;
}
