use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("not registered in the mesh (run `join` first)")]
    NotRegistered,

    #[error("invalid agent name '{0}' (1-50 chars, letters/digits/underscore/hyphen, must not start with '-')")]
    InvalidName(String),

    #[error("agent name '{0}' is already registered")]
    NameTaken(String),

    #[error("lost the registration race for '{0}'")]
    RaceLost(String),

    #[error("new name is the same as the current name")]
    SameName,

    #[error("no active recipients")]
    NoRecipients,

    #[error("recipient list is empty")]
    EmptyRecipients,

    #[error("message text is required")]
    MissingMessage,

    #[error("recipient is required")]
    MissingRecipient,

    #[error("cannot send a message to yourself")]
    CannotSendToSelf,

    #[error("recipient '{0}' not found in the registry")]
    RecipientNotFound(String),

    #[error("recipient '{0}' is no longer active")]
    RecipientNotActive(String),

    #[error("at least one reservation pattern is required")]
    EmptyPatterns,

    #[error("paths are required")]
    MissingPaths,

    #[error("no working spec set (pass `spec` or run the `spec` action)")]
    NoSpec,

    #[error("agent '{agent}' already holds a claim on {spec}#{task_id}")]
    AlreadyHaveClaim {
        agent: String,
        spec: String,
        task_id: String,
    },

    #[error("task {task_id} is already claimed by '{agent}'")]
    AlreadyClaimed { task_id: String, agent: String },

    #[error("task {0} is not claimed")]
    NotClaimed(String),

    #[error("task {task_id} is claimed by '{owner}', not you")]
    NotYourClaim { task_id: String, owner: String },

    #[error("task {task_id} was already completed by '{by}'")]
    AlreadyCompleted { task_id: String, by: String },

    #[error("an id is required")]
    MissingId,

    #[error("a title is required")]
    MissingTitle,

    #[error("content is required")]
    MissingContent,

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("epic {epic} has {remaining} unfinished task(s)")]
    IncompleteTasks { epic: String, remaining: usize },

    #[error("dependency cycle involving task {0}")]
    CircularDependency(String),

    #[error("task {task} depends on unknown task {dep}")]
    OrphanDependency { task: String, dep: String },

    #[error("could not acquire the swarm lock within {0}")]
    LockTimeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("scout concurrency is zero; nothing to plan with")]
    NoScouts,

    #[error("no analyst configured for plan synthesis")]
    NoAnalyst,

    #[error("scout worker failed: {0}")]
    GeneratorFailed(String),

    #[error("analyst worker failed: {0}")]
    AnalystFailed(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MessengerError {
    /// Stable machine-readable tag surfaced in dispatcher `details.error`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotRegistered => "not_registered",
            Self::InvalidName(_) => "invalid_name",
            Self::NameTaken(_) => "name_taken",
            Self::RaceLost(_) => "race_lost",
            Self::SameName => "same_name",
            Self::NoRecipients => "no_recipients",
            Self::EmptyRecipients => "empty_recipients",
            Self::MissingMessage => "missing_message",
            Self::MissingRecipient => "missing_recipient",
            Self::CannotSendToSelf => "cannot_send_to_self",
            Self::RecipientNotFound(_) => "recipient_not_found",
            Self::RecipientNotActive(_) => "recipient_not_active",
            Self::EmptyPatterns => "empty_patterns",
            Self::MissingPaths => "missing_paths",
            Self::NoSpec => "no_spec",
            Self::AlreadyHaveClaim { .. } => "already_have_claim",
            Self::AlreadyClaimed { .. } => "already_claimed",
            Self::NotClaimed(_) => "not_claimed",
            Self::NotYourClaim { .. } => "not_your_claim",
            Self::AlreadyCompleted { .. } => "already_completed",
            Self::MissingId => "missing_id",
            Self::MissingTitle => "missing_title",
            Self::MissingContent => "missing_content",
            Self::NotFound(_) => "not_found",
            Self::IncompleteTasks { .. } => "incomplete_tasks",
            Self::CircularDependency(_) => "circular_dependency",
            Self::OrphanDependency { .. } => "orphan_dependency",
            Self::LockTimeout(_) => "lock_timeout",
            Self::Cancelled => "cancelled",
            Self::NoScouts => "no_scouts",
            Self::NoAnalyst => "no_analyst",
            Self::GeneratorFailed(_) => "generator_failed",
            Self::AnalystFailed(_) => "analyst_failed",
            Self::UnknownAction(_) => "unknown_action",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, MessengerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_snake_case() {
        let err = MessengerError::AlreadyClaimed {
            task_id: "T1".into(),
            agent: "a".into(),
        };
        assert_eq!(err.code(), "already_claimed");
        assert_eq!(
            MessengerError::LockTimeout("5s".into()).code(),
            "lock_timeout"
        );
        assert_eq!(
            MessengerError::UnknownAction("x".into()).code(),
            "unknown_action"
        );
    }

    #[test]
    fn display_names_the_offender() {
        let err = MessengerError::NotYourClaim {
            task_id: "T1".into(),
            owner: "swift-otter".into(),
        };
        assert!(err.to_string().contains("swift-otter"));
    }
}
