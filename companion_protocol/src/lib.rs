mod address;
mod codec;

pub use address::{ButtonAddress, ButtonTarget};
pub use codec::{decode, encode};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const IMAGE_WIDTH: usize = 72;
pub const IMAGE_HEIGHT: usize = 72;
pub const BYTES_PER_PIXEL: usize = 3;
/// Raw RGB buffer size of a single button image (72 × 72 × 3).
pub const IMAGE_BUFFER_LEN: usize = IMAGE_WIDTH * IMAGE_HEIGHT * BYTES_PER_PIXEL;

/// Slots in the flat (dynamic folder) tier.
pub const FLAT_SLOTS: u32 = 34;
pub const PAGE_COUNT: u32 = 100;
pub const BANK_COUNT: u32 = 32;
/// Page number reserved for the dynamic, unpaged tier.
pub const DYNAMIC_PAGE: u32 = 0;

pub const PROTOCOL_VERSION: u32 = 2;
pub const DEFAULT_DEVICE_ID: &str = "2E1F407206FF4353B33D724CD1429550";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has neither a response nor a command tag")]
    MissingTag,
    #[error("message `{0}` has no arguments")]
    MissingArguments(String),
    #[error("image buffer is {actual} bytes, expected {expected}")]
    BufferLength { expected: usize, actual: usize },
    #[error("invalid button address: {0}")]
    InvalidAddress(String),
}

/// Outbound wire unit: `{ "command": ..., "arguments": ... }`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutboundCommand {
    pub command: String,
    pub arguments: Value,
}

impl OutboundCommand {
    pub fn new(command: impl Into<String>, arguments: Value) -> Self {
        Self {
            command: command.into(),
            arguments,
        }
    }

    pub fn version(version: u32) -> Self {
        Self::new("version", json!({ "version": version }))
    }

    /// The controller expects the bare device id string as arguments, not an object.
    pub fn new_device(device_id: &str) -> Self {
        Self::new("new_device", Value::String(device_id.to_string()))
    }

    pub fn keydown(target: ButtonTarget) -> Self {
        Self::new("keydown", target.to_arguments())
    }

    pub fn keyup(target: ButtonTarget) -> Self {
        Self::new("keyup", target.to_arguments())
    }

    pub fn request_button(address: ButtonAddress) -> Self {
        Self::new(
            "request_button",
            json!({ "page": address.page, "bank": address.bank }),
        )
    }
}

/// Inbound wire unit. The two shapes are mutually exclusive; `response`
/// wins if a frame carries both tags.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEnvelope {
    Response { response: String, arguments: Value },
    Command { command: String, arguments: Value },
}

impl InboundEnvelope {
    pub fn tag(&self) -> &str {
        match self {
            InboundEnvelope::Response { response, .. } => response,
            InboundEnvelope::Command { command, .. } => command,
        }
    }

    /// Types the payload. Unknown tags are not an error.
    pub fn into_message(self) -> Result<InboundMessage, DecodeError> {
        match self {
            InboundEnvelope::Response {
                response,
                arguments,
            } => match response.as_str() {
                "version" => Ok(InboundMessage::Version(serde_json::from_value(arguments)?)),
                "new_device" => Ok(InboundMessage::NewDevice(NewDeviceResponse(arguments))),
                _ => Ok(InboundMessage::Unknown { tag: response }),
            },
            InboundEnvelope::Command { command, arguments } => match command.as_str() {
                "fillImage" => Ok(InboundMessage::FillImage(serde_json::from_value(arguments)?)),
                _ => Ok(InboundMessage::Unknown { tag: command }),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Version(VersionResponse),
    NewDevice(NewDeviceResponse),
    FillImage(FillImage),
    Unknown { tag: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    #[serde(default)]
    pub server_version: Option<Value>,
}

/// Device registration acknowledgment; the shape is opaque to the bridge.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct NewDeviceResponse(pub Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    /// No page: the dynamic folder stream.
    Flat,
    Paged,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FillImage {
    #[serde(default)]
    pub key_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank: Option<u32>,
    pub data: BufferData,
}

/// Node.js `Buffer` JSON form: `{ "type": "Buffer", "data": [..] }`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BufferData {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub data: Vec<u8>,
}

impl BufferData {
    pub fn from_rgb(data: Vec<u8>) -> Self {
        Self {
            kind: "Buffer".to_string(),
            data,
        }
    }
}

impl FillImage {
    pub fn addressing(&self) -> AddressingMode {
        if self.page.is_some() {
            AddressingMode::Paged
        } else {
            AddressingMode::Flat
        }
    }

    /// Slot index within the tier; `bank` overrides `keyIndex` when present.
    pub fn slot_index(&self) -> u32 {
        self.bank.unwrap_or(self.key_index)
    }

    pub fn pixels(&self) -> Result<&[u8], DecodeError> {
        let actual = self.data.data.len();
        if actual != IMAGE_BUFFER_LEN {
            return Err(DecodeError::BufferLength {
                expected: IMAGE_BUFFER_LEN,
                actual,
            });
        }
        Ok(&self.data.data)
    }
}
