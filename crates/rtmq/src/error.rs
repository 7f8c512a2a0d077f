use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtmqError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] rtmq_wire::WireError),
    #[error("authentication failed")]
    AuthFailed,
    #[error("queue full, frame dropped at source")]
    QueueFull,
    #[error("handler already registered for type {0}")]
    DupRegister(u16),
    #[error("config: {0}")]
    Config(&'static str),
    #[error("resource: {0}")]
    Resource(String),
    #[error(transparent)]
    Queue(#[from] rtmq_queue::QueueError),
}
