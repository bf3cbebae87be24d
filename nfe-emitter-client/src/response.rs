use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Metadata {
    /// Identifies the call in logs. Every span opened for the call carries it.
    pub request_id: Uuid,
}

#[derive(Debug)]
pub struct EmitterResponse<T> {
    pub data: T,
    pub metadata: Metadata,
}

impl<T> EmitterResponse<T> {
    pub(crate) fn new(data: T, request_id: Uuid) -> Self {
        Self {
            data,
            metadata: Metadata { request_id },
        }
    }
}
