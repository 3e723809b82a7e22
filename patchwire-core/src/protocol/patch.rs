//! Patch records and serialized subtrees.
//!
//! # Record Layout
//!
//! Each record is an opcode byte followed by the target hid and the fields
//! of that opcode only:
//!
//! | op | name        | fields                                   |
//! |----|-------------|------------------------------------------|
//! | 1  | InsertNode  | parent, before?, node                    |
//! | 2  | RemoveNode  | hid                                      |
//! | 3  | MoveNode    | hid, parent, before?                     |
//! | 4  | SetText     | hid, text (str32)                        |
//! | 5  | SetAttr     | hid, name (str8), value (str32)          |
//! | 6  | RemoveAttr  | hid, name (str8)                         |
//! | 7  | SetValue    | hid, value (str32)                       |
//! | 8  | ReplaceNode | hid, node                                |
//!
//! A serialized node is a kind byte and its hid. Elements follow with the
//! tag (str8), a u32 attribute count with (str8, str32) pairs, and a u32
//! child count with the children. Text and raw nodes carry one str32.
//!
//! `before` is an optional hid: the node is placed before that sibling, or
//! appended when absent. Hid fields use the width declared in the frame
//! header (u32 unless some hid needs more).

use indexmap::IndexMap;

use super::codec::{HidWidth, WireReader, WireWriter};
use super::handshake::Capabilities;
use crate::error::ProtocolError;
use crate::render::Hid;

/// Deepest subtree accepted by the decoder.
pub const MAX_TREE_DEPTH: usize = 256;

const NODE_ELEMENT: u8 = 1;
const NODE_TEXT: u8 = 2;
const NODE_RAW: u8 = 3;

/// A node as the client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireNode {
    Element {
        hid: Hid,
        tag: String,
        /// Compared without regard to order.
        attrs: IndexMap<String, String>,
        children: Vec<WireNode>,
    },
    Text {
        hid: Hid,
        text: String,
    },
    Raw {
        hid: Hid,
        html: String,
    },
}

impl WireNode {
    pub fn hid(&self) -> Hid {
        match self {
            WireNode::Element { hid, .. } | WireNode::Text { hid, .. } | WireNode::Raw { hid, .. } => *hid,
        }
    }

    pub fn children(&self) -> &[WireNode] {
        match self {
            WireNode::Element { children, .. } => children,
            _ => &[],
        }
    }

    /// Raw markup turned into text nodes, for clients that cannot render it.
    fn without_raw(self) -> Self {
        match self {
            WireNode::Raw { hid, html } => WireNode::Text { hid, text: html },
            WireNode::Element {
                hid,
                tag,
                attrs,
                children,
            } => WireNode::Element {
                hid,
                tag,
                attrs,
                children: children.into_iter().map(WireNode::without_raw).collect(),
            },
            text @ WireNode::Text { .. } => text,
        }
    }

    fn max_hid(&self) -> u64 {
        self.children()
            .iter()
            .map(WireNode::max_hid)
            .fold(self.hid().raw(), u64::max)
    }

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        match self {
            WireNode::Element {
                hid,
                tag,
                attrs,
                children,
            } => {
                w.u8(NODE_ELEMENT);
                w.hid(*hid);
                w.str8("tag", tag)?;
                w.count32("attrs", attrs.len())?;
                for (name, value) in attrs {
                    w.str8("attr_name", name)?;
                    w.str32("attr_value", value)?;
                }
                w.count32("children", children.len())?;
                for child in children {
                    child.encode(w)?;
                }
            }
            WireNode::Text { hid, text } => {
                w.u8(NODE_TEXT);
                w.hid(*hid);
                w.str32("text", text)?;
            }
            WireNode::Raw { hid, html } => {
                w.u8(NODE_RAW);
                w.hid(*hid);
                w.str32("html", html)?;
            }
        }
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>, depth: usize) -> Result<Self, ProtocolError> {
        if depth > MAX_TREE_DEPTH {
            return Err(ProtocolError::TooDeep(MAX_TREE_DEPTH));
        }
        match r.u8()? {
            NODE_ELEMENT => {
                let hid = r.hid()?;
                let tag = r.str8()?;
                let attr_count = r.u32()? as usize;
                let mut attrs = IndexMap::with_capacity(attr_count.min(r.remaining() / 2));
                for _ in 0..attr_count {
                    let name = r.str8()?;
                    let value = r.str32()?;
                    attrs.insert(name, value);
                }
                let child_count = r.u32()? as usize;
                let mut children = Vec::with_capacity(child_count.min(r.remaining() / 2));
                for _ in 0..child_count {
                    children.push(Self::decode(r, depth + 1)?);
                }
                Ok(WireNode::Element {
                    hid,
                    tag,
                    attrs,
                    children,
                })
            }
            NODE_TEXT => Ok(WireNode::Text {
                hid: r.hid()?,
                text: r.str32()?,
            }),
            NODE_RAW => Ok(WireNode::Raw {
                hid: r.hid()?,
                html: r.str32()?,
            }),
            other => Err(ProtocolError::UnknownNodeKind(other)),
        }
    }
}

/// One tree mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    InsertNode {
        parent: Hid,
        before: Option<Hid>,
        node: WireNode,
    },
    RemoveNode {
        hid: Hid,
    },
    MoveNode {
        hid: Hid,
        parent: Hid,
        before: Option<Hid>,
    },
    SetText {
        hid: Hid,
        text: String,
    },
    SetAttr {
        hid: Hid,
        name: String,
        value: String,
    },
    RemoveAttr {
        hid: Hid,
        name: String,
    },
    SetValue {
        hid: Hid,
        value: String,
    },
    ReplaceNode {
        hid: Hid,
        node: WireNode,
    },
}

impl Patch {
    pub fn opcode(&self) -> u8 {
        match self {
            Patch::InsertNode { .. } => 1,
            Patch::RemoveNode { .. } => 2,
            Patch::MoveNode { .. } => 3,
            Patch::SetText { .. } => 4,
            Patch::SetAttr { .. } => 5,
            Patch::RemoveAttr { .. } => 6,
            Patch::SetValue { .. } => 7,
            Patch::ReplaceNode { .. } => 8,
        }
    }

    /// The hid the record is addressed to. Inserts address their parent.
    pub fn target(&self) -> Hid {
        match self {
            Patch::InsertNode { parent, .. } => *parent,
            Patch::RemoveNode { hid }
            | Patch::MoveNode { hid, .. }
            | Patch::SetText { hid, .. }
            | Patch::SetAttr { hid, .. }
            | Patch::RemoveAttr { hid, .. }
            | Patch::SetValue { hid, .. }
            | Patch::ReplaceNode { hid, .. } => *hid,
        }
    }

    /// Rewrite the record into one the client advertised support for.
    /// `SetValue` becomes `SetAttr("value")` and raw nodes become text.
    pub fn for_client(self, caps: Capabilities) -> Patch {
        let patch = match self {
            Patch::SetValue { hid, value } if !caps.contains(Capabilities::SET_VALUE) => Patch::SetAttr {
                hid,
                name: "value".to_string(),
                value,
            },
            other => other,
        };
        if caps.contains(Capabilities::RAW_HTML) {
            return patch;
        }
        match patch {
            Patch::InsertNode { parent, before, node } => Patch::InsertNode {
                parent,
                before,
                node: node.without_raw(),
            },
            Patch::ReplaceNode { hid, node } => Patch::ReplaceNode {
                hid,
                node: node.without_raw(),
            },
            other => other,
        }
    }

    fn max_hid(&self) -> u64 {
        let own = self.target().raw();
        match self {
            Patch::InsertNode { before, node, .. } => own
                .max(before.map_or(0, |b| b.raw()))
                .max(node.max_hid()),
            Patch::MoveNode { parent, before, .. } => own
                .max(parent.raw())
                .max(before.map_or(0, |b| b.raw())),
            Patch::ReplaceNode { node, .. } => own.max(node.max_hid()),
            _ => own,
        }
    }

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.u8(self.opcode());
        match self {
            Patch::InsertNode { parent, before, node } => {
                w.hid(*parent);
                w.opt_hid(*before);
                node.encode(w)?;
            }
            Patch::RemoveNode { hid } => w.hid(*hid),
            Patch::MoveNode { hid, parent, before } => {
                w.hid(*hid);
                w.hid(*parent);
                w.opt_hid(*before);
            }
            Patch::SetText { hid, text } => {
                w.hid(*hid);
                w.str32("text", text)?;
            }
            Patch::SetAttr { hid, name, value } => {
                w.hid(*hid);
                w.str8("attr_name", name)?;
                w.str32("attr_value", value)?;
            }
            Patch::RemoveAttr { hid, name } => {
                w.hid(*hid);
                w.str8("attr_name", name)?;
            }
            Patch::SetValue { hid, value } => {
                w.hid(*hid);
                w.str32("value", value)?;
            }
            Patch::ReplaceNode { hid, node } => {
                w.hid(*hid);
                node.encode(w)?;
            }
        }
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(match r.u8()? {
            1 => Patch::InsertNode {
                parent: r.hid()?,
                before: r.opt_hid()?,
                node: WireNode::decode(r, 1)?,
            },
            2 => Patch::RemoveNode { hid: r.hid()? },
            3 => Patch::MoveNode {
                hid: r.hid()?,
                parent: r.hid()?,
                before: r.opt_hid()?,
            },
            4 => Patch::SetText {
                hid: r.hid()?,
                text: r.str32()?,
            },
            5 => Patch::SetAttr {
                hid: r.hid()?,
                name: r.str8()?,
                value: r.str32()?,
            },
            6 => Patch::RemoveAttr {
                hid: r.hid()?,
                name: r.str8()?,
            },
            7 => Patch::SetValue {
                hid: r.hid()?,
                value: r.str32()?,
            },
            8 => Patch::ReplaceNode {
                hid: r.hid()?,
                node: WireNode::decode(r, 1)?,
            },
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Payload of a Patches frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchFrame {
    /// Outbound sequence, strictly increasing per session.
    pub sequence: u64,
    /// Event sequence this frame answers, if any.
    pub ack: Option<u64>,
    pub patches: Vec<Patch>,
}

impl PatchFrame {
    /// Check that `patches` fit the wire format without keeping the bytes.
    pub fn check_encodable(patches: &[Patch]) -> Result<(), ProtocolError> {
        let mut w = WireWriter::new();
        for patch in patches {
            patch.encode(&mut w)?;
        }
        Ok(())
    }

    pub(crate) fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        let max = self.patches.iter().map(Patch::max_hid).max().unwrap_or(0);
        let width = HidWidth::fitting(max);

        w.u64(self.sequence);
        w.opt_u64(self.ack);
        w.u8(width.tag());
        w.count32("patches", self.patches.len())?;
        w.set_hid_width(width);
        for patch in &self.patches {
            patch.encode(w)?;
        }
        Ok(())
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let sequence = r.u64()?;
        let ack = r.opt_u64()?;
        let width = HidWidth::from_tag(r.u8()?)?;
        r.set_hid_width(width);
        let count = r.u32()? as usize;
        // Every record is at least two bytes; don't trust the count blindly.
        let mut patches = Vec::with_capacity(count.min(r.remaining() / 2));
        for _ in 0..count {
            patches.push(Patch::decode(r)?);
        }
        Ok(Self {
            sequence,
            ack,
            patches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: &PatchFrame) -> Vec<u8> {
        let mut w = WireWriter::new();
        frame.encode(&mut w).unwrap();
        w.finish()
    }

    #[test]
    fn set_text_record_is_minimal() {
        let frame = PatchFrame {
            sequence: 2,
            ack: None,
            patches: vec![Patch::SetText {
                hid: Hid::new(3),
                text: "1".to_string(),
            }],
        };
        let bytes = encode(&frame);

        // seq(8) + ack flag(1) + width(1) + count(4) + op(1) + hid(4) + len(4) + "1"
        assert_eq!(bytes.len(), 8 + 1 + 1 + 4 + 1 + 4 + 4 + 1);
        assert_eq!(bytes[9], 4, "u32 hids when everything fits");
        assert_eq!(PatchFrame::decode(&mut WireReader::new(&bytes)).unwrap(), frame);
    }

    #[test]
    fn large_hids_widen_the_frame() {
        let frame = PatchFrame {
            sequence: 1,
            ack: Some(9),
            patches: vec![Patch::RemoveNode {
                hid: Hid::new(u64::from(u32::MAX) + 1),
            }],
        };
        let bytes = encode(&frame);
        assert_eq!(bytes[17], 8);
        assert_eq!(PatchFrame::decode(&mut WireReader::new(&bytes)).unwrap(), frame);
    }

    #[test]
    fn attribute_order_does_not_matter() {
        let mut a = IndexMap::new();
        a.insert("x".to_string(), "1".to_string());
        a.insert("y".to_string(), "2".to_string());
        let mut b = IndexMap::new();
        b.insert("y".to_string(), "2".to_string());
        b.insert("x".to_string(), "1".to_string());

        let left = WireNode::Element {
            hid: Hid::new(1),
            tag: "div".into(),
            attrs: a,
            children: vec![],
        };
        let right = WireNode::Element {
            hid: Hid::new(1),
            tag: "div".into(),
            attrs: b,
            children: vec![],
        };
        assert_eq!(left, right);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut w = WireWriter::new();
        w.u64(1);
        w.u8(0);
        w.u8(4);
        w.u32(1);
        w.u8(42);
        let bytes = w.finish();
        assert_eq!(
            PatchFrame::decode(&mut WireReader::new(&bytes)),
            Err(ProtocolError::UnknownOpcode(42))
        );
    }

    #[test]
    fn nesting_limit_is_enforced() {
        let mut node = WireNode::Text {
            hid: Hid::new(1),
            text: String::new(),
        };
        for _ in 0..MAX_TREE_DEPTH + 1 {
            node = WireNode::Element {
                hid: Hid::new(1),
                tag: "div".into(),
                attrs: IndexMap::new(),
                children: vec![node],
            };
        }
        let frame = PatchFrame {
            sequence: 1,
            ack: None,
            patches: vec![Patch::InsertNode {
                parent: Hid::ROOT,
                before: None,
                node,
            }],
        };
        let bytes = encode(&frame);
        assert_eq!(
            PatchFrame::decode(&mut WireReader::new(&bytes)),
            Err(ProtocolError::TooDeep(MAX_TREE_DEPTH))
        );
    }

    #[test]
    fn wide_elements_encode() {
        let children = (0..70_000u64)
            .map(|i| WireNode::Text {
                hid: Hid::new(i + 2),
                text: String::new(),
            })
            .collect();
        let frame = PatchFrame {
            sequence: 1,
            ack: None,
            patches: vec![Patch::InsertNode {
                parent: Hid::ROOT,
                before: None,
                node: WireNode::Element {
                    hid: Hid::new(1),
                    tag: "ul".into(),
                    attrs: IndexMap::new(),
                    children,
                },
            }],
        };
        assert!(PatchFrame::check_encodable(&frame.patches).is_ok());
        let bytes = encode(&frame);
        assert_eq!(PatchFrame::decode(&mut WireReader::new(&bytes)).unwrap(), frame);
    }

    #[test]
    fn oversized_tag_is_not_encodable() {
        let patches = vec![Patch::ReplaceNode {
            hid: Hid::new(1),
            node: WireNode::Element {
                hid: Hid::new(2),
                tag: "x".repeat(300),
                attrs: IndexMap::new(),
                children: vec![],
            },
        }];
        assert!(matches!(
            PatchFrame::check_encodable(&patches),
            Err(ProtocolError::FieldTooLong { field: "tag", .. })
        ));
    }

    #[test]
    fn patches_follow_client_capabilities() {
        let set_value = Patch::SetValue {
            hid: Hid::new(4),
            value: "x".into(),
        };
        assert_eq!(set_value.clone().for_client(Capabilities::all()), set_value);
        assert_eq!(
            set_value.for_client(Capabilities::empty()),
            Patch::SetAttr {
                hid: Hid::new(4),
                name: "value".into(),
                value: "x".into(),
            }
        );

        let insert = |inner: WireNode| Patch::InsertNode {
            parent: Hid::ROOT,
            before: None,
            node: WireNode::Element {
                hid: Hid::new(1),
                tag: "div".into(),
                attrs: IndexMap::new(),
                children: vec![inner],
            },
        };
        let raw = insert(WireNode::Raw {
            hid: Hid::new(2),
            html: "<b>hi</b>".into(),
        });
        assert_eq!(raw.clone().for_client(Capabilities::RAW_HTML), raw);
        assert_eq!(
            raw.for_client(Capabilities::SET_VALUE),
            insert(WireNode::Text {
                hid: Hid::new(2),
                text: "<b>hi</b>".into(),
            })
        );
    }
}
