use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid offset flag: {0}")]
    OffsetParse(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Consumer group error: {0}")]
    Group(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
