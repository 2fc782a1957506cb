use crate::events::{FillImageBus, FillImageEvent};
use companion_protocol::{decode, InboundMessage};
use tracing::{debug, trace};

/// What a single inbound frame turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Version,
    NewDevice,
    FillImage,
    Ignored,
    Dropped,
}

/// Routes one text frame. Malformed frames are dropped without surfacing an
/// error; unknown tags are ignored.
pub fn dispatch_text(text: &str, bus: &FillImageBus) -> Dispatched {
    let envelope = match decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            trace!(error = %e, "dropping undecodable frame");
            return Dispatched::Dropped;
        }
    };

    let tag = envelope.tag().to_string();
    let message = match envelope.into_message() {
        Ok(message) => message,
        Err(e) => {
            debug!(%tag, error = %e, "dropping malformed payload");
            return Dispatched::Dropped;
        }
    };

    match message {
        InboundMessage::Version(version) => {
            debug!(server_version = ?version.server_version, "controller acknowledged version");
            Dispatched::Version
        }
        InboundMessage::NewDevice(ack) => {
            debug!(ack = %ack.0, "controller registered device");
            Dispatched::NewDevice
        }
        InboundMessage::FillImage(fill) => {
            let Some(event) = FillImageEvent::from_fill(&fill) else {
                debug!(
                    key_index = fill.key_index,
                    page = ?fill.page,
                    bank = ?fill.bank,
                    len = fill.data.data.len(),
                    "dropping fillImage with wrong buffer length"
                );
                return Dispatched::Dropped;
            };
            bus.publish(&event);
            Dispatched::FillImage
        }
        InboundMessage::Unknown { tag } => {
            trace!(%tag, "ignoring unhandled message");
            Dispatched::Ignored
        }
    }
}
