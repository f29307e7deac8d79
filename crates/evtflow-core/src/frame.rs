//! The frame: the unit of data moving through the pipeline.
//!
//! A [`Frame`] is an insertion-ordered mapping of unique names to shared,
//! immutable-once-published objects, tagged with a [`Stream`] and an optional
//! sub-stream label. Objects are handed out behind `Arc` and are never mutated
//! in place; replacing a value means rebinding its name to a new object.
//!
//! Each slot remembers where it came from: keys bound by the producer are
//! *native*, keys copied in by the stream mixer carry the metadata stream they
//! were inherited from. Only native keys are serialized; inherited keys are
//! reconstructed by mixing on the read side.

use crate::error::{EvtError, EvtResult};
use crate::stream::Stream;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A polymorphic record stored in a frame.
///
/// The versioned per-field codec (endianness normalization, per-type version
/// tags) lives behind this trait; the pipeline core only moves encoded bytes
/// around. Implementors encode themselves into a byte buffer and are decoded
/// through the object registry of the storage layer.
pub trait FrameObject: fmt::Debug + Send + Sync + 'static {
    /// Registry key identifying the concrete type on disk.
    fn type_tag(&self) -> &'static str;

    /// Append the encoded representation to `buf`.
    fn encode(&self, buf: &mut Vec<u8>);

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

/// Opaque byte payload.
///
/// Carrier for records whose internal layout the core does not interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn decode(bytes: &[u8]) -> EvtResult<Self> {
        Ok(Blob(bytes.to_vec()))
    }
}

impl FrameObject for Blob {
    fn type_tag(&self) -> &'static str {
        "blob"
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Run/event identification record, little-endian on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub run_id: u64,
    pub event_id: u64,
}

impl EventHeader {
    pub fn decode(bytes: &[u8]) -> EvtResult<Self> {
        if bytes.len() != 16 {
            return Err(EvtError::TypeMismatch {
                key: "event_header".into(),
                expected: "16-byte event header",
            });
        }
        let mut run = [0u8; 8];
        let mut event = [0u8; 8];
        run.copy_from_slice(&bytes[..8]);
        event.copy_from_slice(&bytes[8..]);
        Ok(EventHeader {
            run_id: u64::from_le_bytes(run),
            event_id: u64::from_le_bytes(event),
        })
    }
}

impl FrameObject for EventHeader {
    fn type_tag(&self) -> &'static str {
        "event_header"
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.run_id.to_le_bytes());
        buf.extend_from_slice(&self.event_id.to_le_bytes());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
struct Slot {
    name: String,
    object: Arc<dyn FrameObject>,
    /// `None` for keys bound by the producer; `Some(s)` for keys inherited
    /// from the most recent frame of metadata stream `s`.
    mixed_from: Option<Stream>,
}

/// A named, ordered bundle of shared objects tagged with a stream.
#[derive(Debug, Clone)]
pub struct Frame {
    stream: Stream,
    sub_stream: Option<String>,
    slots: Vec<Slot>,
}

impl Frame {
    /// Create an empty frame on `stream`.
    pub fn new(stream: Stream) -> Self {
        Frame {
            stream,
            sub_stream: None,
            slots: Vec::new(),
        }
    }

    /// Attach a sub-stream label distinguishing concurrently produced
    /// sub-events on the same stream.
    pub fn with_sub_stream(mut self, label: impl Into<String>) -> Self {
        self.sub_stream = Some(label.into());
        self
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn sub_stream(&self) -> Option<&str> {
        self.sub_stream.as_deref()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bind `name` to `object`. Names are unique within a frame.
    pub fn put(&mut self, name: impl Into<String>, object: Arc<dyn FrameObject>) -> EvtResult<()> {
        let name = name.into();
        if self.has(&name) {
            return Err(EvtError::DuplicateKey { key: name });
        }
        self.slots.push(Slot {
            name,
            object,
            mixed_from: None,
        });
        Ok(())
    }

    /// Replace-or-insert a binding. The previously bound object is released,
    /// never mutated; the new binding is native to this frame.
    pub fn rebind(&mut self, name: impl Into<String>, object: Arc<dyn FrameObject>) {
        let name = name.into();
        if let Some(slot) = self.slots.iter_mut().find(|s| s.name == name) {
            slot.object = object;
            slot.mixed_from = None;
        } else {
            self.slots.push(Slot {
                name,
                object,
                mixed_from: None,
            });
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.slots.iter().any(|s| s.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn FrameObject>> {
        self.slots.iter().find(|s| s.name == name).map(|s| &s.object)
    }

    /// Typed lookup; errors distinguish a missing key from a type mismatch.
    pub fn get_as<T: FrameObject>(&self, name: &str) -> EvtResult<&T> {
        let object = self.get(name).ok_or_else(|| EvtError::KeyNotFound {
            key: name.to_string(),
        })?;
        object
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| EvtError::TypeMismatch {
                key: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Remove and return a binding.
    pub fn take(&mut self, name: &str) -> Option<Arc<dyn FrameObject>> {
        let pos = self.slots.iter().position(|s| s.name == name)?;
        Some(self.slots.remove(pos).object)
    }

    /// The metadata stream a key was inherited from, if any.
    pub fn mixed_from(&self, name: &str) -> Option<Stream> {
        self.slots
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.mixed_from)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.name.as_str())
    }

    /// All bindings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn FrameObject>)> {
        self.slots.iter().map(|s| (s.name.as_str(), &s.object))
    }

    /// Bindings created by the producer of this frame, excluding inherited
    /// keys. This is what the container writer serializes.
    pub fn native_slots(&self) -> impl Iterator<Item = (&str, &Arc<dyn FrameObject>)> {
        self.slots
            .iter()
            .filter(|s| s.mixed_from.is_none())
            .map(|s| (s.name.as_str(), &s.object))
    }

    /// Copy every key of `other` that this frame does not already bind,
    /// tagging it as inherited from `other`'s stream.
    pub fn merge_from(&mut self, other: &Frame) {
        for slot in &other.slots {
            if !self.has(&slot.name) {
                self.slots.push(Slot {
                    name: slot.name.clone(),
                    object: Arc::clone(&slot.object),
                    mixed_from: Some(other.stream),
                });
            }
        }
    }

    /// Copy every *native* key of `other` that this frame does not already
    /// bind, tagging it as inherited from `other`'s stream. Keys `other`
    /// itself inherited are skipped; an inherited key is only ever copied
    /// from the frame that natively binds it.
    pub fn merge_native_from(&mut self, other: &Frame) {
        for slot in &other.slots {
            if slot.mixed_from.is_none() && !self.has(&slot.name) {
                self.slots.push(Slot {
                    name: slot.name.clone(),
                    object: Arc::clone(&slot.object),
                    mixed_from: Some(other.stream),
                });
            }
        }
    }

    /// Remove every inherited key, keeping only native bindings.
    pub fn drop_mixed(&mut self) {
        self.slots.retain(|s| s.mixed_from.is_none());
    }
}

impl PartialEq for Frame {
    /// Content equality: same stream, sub-stream, and bindings with
    /// byte-identical encodings. Binding order and mixing provenance are
    /// ignored so a frame compares equal to its round-tripped self.
    fn eq(&self, other: &Frame) -> bool {
        if self.stream != other.stream
            || self.sub_stream != other.sub_stream
            || self.slots.len() != other.slots.len()
        {
            return false;
        }
        self.slots.iter().all(|slot| {
            other.get(&slot.name).is_some_and(|theirs| {
                let mut a = Vec::new();
                let mut b = Vec::new();
                slot.object.encode(&mut a);
                theirs.encode(&mut b);
                slot.object.type_tag() == theirs.type_tag() && a == b
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(bytes: &[u8]) -> Arc<dyn FrameObject> {
        Arc::new(Blob(bytes.to_vec()))
    }

    #[test]
    fn put_rejects_duplicates() {
        let mut frame = Frame::new(Stream::PHYSICS);
        frame.put("hits", blob(b"aa")).unwrap();
        let err = frame.put("hits", blob(b"bb")).unwrap_err();
        assert!(matches!(err, EvtError::DuplicateKey { .. }));
    }

    #[test]
    fn rebind_replaces_and_clears_provenance() {
        let mut geo = Frame::new(Stream::GEOMETRY);
        geo.put("geometry", blob(b"g1")).unwrap();

        let mut phys = Frame::new(Stream::PHYSICS);
        phys.merge_from(&geo);
        assert_eq!(phys.mixed_from("geometry"), Some(Stream::GEOMETRY));

        phys.rebind("geometry", blob(b"override"));
        assert_eq!(phys.mixed_from("geometry"), None);
        assert_eq!(phys.get_as::<Blob>("geometry").unwrap().0, b"override");
    }

    #[test]
    fn merge_does_not_clobber_existing_keys() {
        let mut cal = Frame::new(Stream::CALIBRATION);
        cal.put("constants", blob(b"old")).unwrap();
        cal.put("extra", blob(b"e")).unwrap();

        let mut phys = Frame::new(Stream::PHYSICS);
        phys.put("constants", blob(b"mine")).unwrap();
        phys.merge_from(&cal);

        assert_eq!(phys.get_as::<Blob>("constants").unwrap().0, b"mine");
        assert_eq!(phys.get_as::<Blob>("extra").unwrap().0, b"e");
        assert_eq!(phys.len(), 2);
    }

    #[test]
    fn merge_native_skips_inherited_keys() {
        let mut geo = Frame::new(Stream::GEOMETRY);
        geo.put("geometry", blob(b"g")).unwrap();

        let mut status = Frame::new(Stream::DETECTOR_STATUS);
        status.put("status", blob(b"s")).unwrap();
        status.merge_from(&geo);

        let mut phys = Frame::new(Stream::PHYSICS);
        phys.merge_native_from(&status);
        assert!(phys.has("status"));
        assert!(!phys.has("geometry"));
        assert_eq!(phys.mixed_from("status"), Some(Stream::DETECTOR_STATUS));
    }

    #[test]
    fn native_slots_exclude_inherited_keys() {
        let mut geo = Frame::new(Stream::GEOMETRY);
        geo.put("geometry", blob(b"g")).unwrap();

        let mut phys = Frame::new(Stream::PHYSICS);
        phys.put("hits", blob(b"h")).unwrap();
        phys.merge_from(&geo);

        let native: Vec<_> = phys.native_slots().map(|(n, _)| n.to_string()).collect();
        assert_eq!(native, vec!["hits"]);
        assert_eq!(phys.len(), 2);
    }

    #[test]
    fn typed_lookup_errors() {
        let mut frame = Frame::new(Stream::PHYSICS);
        frame
            .put(
                "header",
                Arc::new(EventHeader {
                    run_id: 7,
                    event_id: 1,
                }),
            )
            .unwrap();

        assert!(matches!(
            frame.get_as::<Blob>("missing"),
            Err(EvtError::KeyNotFound { .. })
        ));
        assert!(matches!(
            frame.get_as::<Blob>("header"),
            Err(EvtError::TypeMismatch { .. })
        ));
        assert_eq!(frame.get_as::<EventHeader>("header").unwrap().run_id, 7);
    }

    #[test]
    fn event_header_round_trip() {
        let header = EventHeader {
            run_id: 0x0102_0304_0506_0708,
            event_id: 99,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(EventHeader::decode(&buf).unwrap(), header);
        assert!(EventHeader::decode(&buf[1..]).is_err());
    }
}
