use crate::{DecodeError, InboundEnvelope, OutboundCommand};
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
}

pub fn encode(cmd: &OutboundCommand) -> Result<String, serde_json::Error> {
    serde_json::to_string(cmd)
}

pub fn decode(text: &str) -> Result<InboundEnvelope, DecodeError> {
    let raw: RawEnvelope = serde_json::from_str(text)?;

    let (tag, is_response) = match (raw.response, raw.command) {
        (Some(response), _) => (response, true),
        (None, Some(command)) => (command, false),
        (None, None) => return Err(DecodeError::MissingTag),
    };

    let Some(arguments) = raw.arguments.filter(|a| !a.is_null()) else {
        return Err(DecodeError::MissingArguments(tag));
    };

    Ok(if is_response {
        InboundEnvelope::Response {
            response: tag,
            arguments,
        }
    } else {
        InboundEnvelope::Command {
            command: tag,
            arguments,
        }
    })
}
