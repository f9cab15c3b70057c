use serde::{Deserialize, Serialize};

use crate::{
    domain::{FileName, ServerAddress},
    error::ProtocolError,
};

pub const ACK_MESSAGE_TYPE: &str = "ack";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlInstruction {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInstruction {
    pub file_name: FileName,
    pub server_address: ServerAddress,
}

/// Server → viewer message telling the viewer what to load.
///
/// Externally tagged on the wire:
/// `{"sql":{"query":"..."}}` or
/// `{"parquet_file":{"file_name":"...","server_address":"http://host:port"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    Sql(SqlInstruction),
    ParquetFile(FileInstruction),
}

impl Instruction {
    pub fn sql(query: impl Into<String>) -> Self {
        Self::Sql(SqlInstruction {
            query: query.into(),
        })
    }

    pub fn parquet_file(file_name: FileName, server_address: ServerAddress) -> Self {
        Self::ParquetFile(FileInstruction {
            file_name,
            server_address,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sql(_) => "sql",
            Self::ParquetFile(_) => "parquet_file",
        }
    }
}

/// Viewer → server message. Only `message_type == "ack"` carries meaning;
/// every other shape is tolerated and reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
}

impl ClientMessage {
    pub fn ack() -> Self {
        Self {
            message_type: Some(ACK_MESSAGE_TYPE.to_string()),
        }
    }

    /// Decodes a text frame. Any valid JSON is accepted, including values
    /// that are not objects, which simply carry no message type.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let message_type = value
            .get("message_type")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        Ok(Self { message_type })
    }

    pub fn is_ack(&self) -> bool {
        self.message_type.as_deref() == Some(ACK_MESSAGE_TYPE)
    }

    /// Decodes a text frame and succeeds only for an acknowledgment.
    pub fn expect_ack(text: &str) -> Result<Self, ProtocolError> {
        let message = Self::decode(text)?;
        if message.is_ack() {
            Ok(message)
        } else {
            Err(ProtocolError::UnexpectedType(message.message_type))
        }
    }
}
