use kafka_listener_core::BrokerError;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Consumer error: {0}")]
    Consumer(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for BrokerError {
    fn from(error: Error) -> Self {
        match error {
            Error::Kafka(e) => classify(&e),
            Error::InvalidConfig(msg) | Error::Consumer(msg) => BrokerError::Fatal(msg),
        }
    }
}

/// Broker-side conditions that clear up on their own: leader elections,
/// coordinator moves, timeouts and lost connections.
pub(crate) fn is_transient(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::Resolve
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::CoordinatorLoadInProgress
            | RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::UnknownTopicOrPartition
    )
}

fn is_authorization(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
    )
}

/// Map an rdkafka error onto the retry classes containers understand.
pub fn classify(error: &KafkaError) -> BrokerError {
    let message = error.to_string();
    match error {
        KafkaError::ConsumerCommit(code) if is_authorization(*code) => BrokerError::Fatal(message),
        KafkaError::ConsumerCommit(_) => BrokerError::Commit(message),
        KafkaError::ClientCreation(_) | KafkaError::Subscription(_) => BrokerError::Fatal(message),
        _ => match error.rdkafka_error_code() {
            Some(code) if is_transient(code) => BrokerError::Connection(message),
            _ => BrokerError::Fatal(message),
        },
    }
}
