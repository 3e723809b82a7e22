//! Input events sent by the client.

use std::fmt;

use super::codec::{WireReader, WireWriter};
use crate::error::ProtocolError;
use crate::render::Hid;

/// Closed set of well-known events plus a named escape hatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Click,
    DoubleClick,
    Input,
    Change,
    Submit,
    KeyDown,
    KeyUp,
    Focus,
    Blur,
    Custom(String),
}

impl EventKind {
    const CUSTOM_TAG: u8 = 255;

    /// Name used to look up handlers registered with `Element::on`.
    pub fn name(&self) -> &str {
        match self {
            EventKind::Click => "click",
            EventKind::DoubleClick => "dblclick",
            EventKind::Input => "input",
            EventKind::Change => "change",
            EventKind::Submit => "submit",
            EventKind::KeyDown => "keydown",
            EventKind::KeyUp => "keyup",
            EventKind::Focus => "focus",
            EventKind::Blur => "blur",
            EventKind::Custom(name) => name,
        }
    }

    /// Map a handler name back to a kind.
    pub fn from_name(name: &str) -> Self {
        match name {
            "click" => EventKind::Click,
            "dblclick" => EventKind::DoubleClick,
            "input" => EventKind::Input,
            "change" => EventKind::Change,
            "submit" => EventKind::Submit,
            "keydown" => EventKind::KeyDown,
            "keyup" => EventKind::KeyUp,
            "focus" => EventKind::Focus,
            "blur" => EventKind::Blur,
            other => EventKind::Custom(other.to_string()),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            EventKind::Click => 1,
            EventKind::DoubleClick => 2,
            EventKind::Input => 3,
            EventKind::Change => 4,
            EventKind::Submit => 5,
            EventKind::KeyDown => 6,
            EventKind::KeyUp => 7,
            EventKind::Focus => 8,
            EventKind::Blur => 9,
            EventKind::Custom(_) => Self::CUSTOM_TAG,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    /// Strictly increasing per connection, starting at 1.
    pub sequence: u64,
    pub kind: EventKind,
    pub target: Hid,
    pub payload: Vec<u8>,
}

impl EventFrame {
    pub fn new(sequence: u64, kind: EventKind, target: Hid) -> Self {
        Self {
            sequence,
            kind,
            target,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Payload as text, for input and change events.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub(crate) fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.u64(self.sequence);
        w.u8(self.kind.tag());
        if let EventKind::Custom(name) = &self.kind {
            w.str8("event_name", name)?;
        }
        w.str8("target", &self.target.to_string())?;
        w.bytes32("payload", &self.payload)
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let sequence = r.u64()?;
        let kind = match r.u8()? {
            1 => EventKind::Click,
            2 => EventKind::DoubleClick,
            3 => EventKind::Input,
            4 => EventKind::Change,
            5 => EventKind::Submit,
            6 => EventKind::KeyDown,
            7 => EventKind::KeyUp,
            8 => EventKind::Focus,
            9 => EventKind::Blur,
            EventKind::CUSTOM_TAG => EventKind::Custom(r.str8()?),
            other => return Err(ProtocolError::UnknownEventKind(other)),
        };
        let target = r.str8()?.parse()?;
        let payload = r.bytes32()?;
        Ok(Self {
            sequence,
            kind,
            target,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_travels_as_string() {
        let event = EventFrame::new(3, EventKind::Click, Hid::new(12));
        let mut w = WireWriter::new();
        event.encode(&mut w).unwrap();
        let bytes = w.finish();

        // sequence, kind, then str8 "h12"
        assert_eq!(&bytes[9..13], &[3, b'h', b'1', b'2']);
        let decoded = EventFrame::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn custom_event_keeps_name() {
        let event = EventFrame::new(1, EventKind::from_name("drop"), Hid::new(2)).with_payload("x");
        let mut w = WireWriter::new();
        event.encode(&mut w).unwrap();
        let bytes = w.finish();

        let decoded = EventFrame::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(decoded.kind.name(), "drop");
        assert_eq!(decoded.text(), Some("x"));
    }

    #[test]
    fn malformed_target_is_rejected() {
        let mut w = WireWriter::new();
        w.u64(1);
        w.u8(1);
        w.str8("target", "button").unwrap();
        w.bytes32("payload", &[]).unwrap();
        let bytes = w.finish();

        assert_eq!(
            EventFrame::decode(&mut WireReader::new(&bytes)),
            Err(ProtocolError::InvalidHid("button".to_string()))
        );
    }
}
