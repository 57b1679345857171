use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Never registered, or disconnected and not yet re-registered.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent {agent_id} has no slot {slot}")]
    UnknownSlot { agent_id: String, slot: u32 },

    #[error("slot {slot} on agent {agent_id} is not free")]
    SlotNotFree { agent_id: String, slot: u32 },

    #[error("agent {agent_id} belongs to pool {actual}, not {expected}")]
    WrongPool {
        agent_id: String,
        expected: String,
        actual: String,
    },
}
