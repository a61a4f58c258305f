use llm::TransportError;
use thiserror::Error;

use crate::ids::{ConversationId, MessageId};

/// Why a generation ended without committing its pending message
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("generation aborted before any content arrived")]
    Aborted,
}

impl From<TransportError> for GenerationError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Network(msg) => GenerationError::NetworkError(msg),
            TransportError::Status { status, body } => {
                GenerationError::NetworkError(format!("server returned {}: {}", status, body))
            }
            TransportError::Protocol(msg) => GenerationError::InvalidResponse(msg),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChatError {
    #[error("parent {parent_id} does not exist in conversation {conversation_id}")]
    InvalidParent {
        conversation_id: ConversationId,
        parent_id: MessageId,
    },
    #[error("message {message_id} has no parent {parent_id} in conversation {conversation_id}")]
    OrphanNode {
        conversation_id: ConversationId,
        message_id: MessageId,
        parent_id: MessageId,
    },
    #[error("message {message_id} does not exist in conversation {conversation_id}")]
    UnknownMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    #[error("message {message_id} is a {actual} message, expected {expected}")]
    UnexpectedKind {
        message_id: MessageId,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("a response is already being generated for conversation {0}")]
    AlreadyGenerating(ConversationId),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_map_to_generation_errors() {
        assert_eq!(
            GenerationError::from(TransportError::Network("reset".into())),
            GenerationError::NetworkError("reset".into())
        );
        assert!(matches!(
            GenerationError::from(TransportError::Status { status: 503, body: "busy".into() }),
            GenerationError::NetworkError(msg) if msg.contains("503")
        ));
        assert_eq!(
            GenerationError::from(TransportError::Protocol("bad json".into())),
            GenerationError::InvalidResponse("bad json".into())
        );
    }
}
