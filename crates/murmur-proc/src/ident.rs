use std::fmt;

/// Opaque identifier for one worker process.
///
/// Generated by the supervisor's [`IdGenerator`]; the string form is what the
/// pid↔worker mapping and all notifications carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Pluggable worker-id source. Ids must be collision-free with overwhelming
/// probability; the default is UUIDv4.
pub trait IdGenerator {
    fn next_id(&mut self) -> WorkerId;
}

/// Default generator: random UUIDv4 ids.
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&mut self) -> WorkerId {
        WorkerId(uuid::Uuid::new_v4().to_string())
    }
}
