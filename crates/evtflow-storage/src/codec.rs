//! Wire codec for sequential frame containers.
//!
//! A container is a fixed file header followed by self-delimiting frame
//! records. Each record carries a length prefix, its stream tag and
//! sub-stream label up front, then the frame's native slots; this lets the
//! background indexer learn a record's stream and skip the rest without
//! decoding any slot ("fast mode").
//!
//! All primitive fields are little-endian. The internal layout of slot
//! payloads belongs to the objects themselves (see
//! [`FrameObject::encode`]); this codec only frames the bytes.
//!
//! ## Record layout
//!
//! ```text
//! [payload_len: u64]
//!   [stream: u32 (char)] [sub_len: u16] [sub bytes]
//!   [n_slots: u32]
//!   per slot: [name_len: u16][name] [tag_len: u16][tag] [obj_len: u32][obj]
//! ```

use evtflow_core::{Blob, EvtError, EvtResult, EventHeader, Frame, FrameObject, Stream};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// Magic bytes opening every container file.
pub const FILE_MAGIC: [u8; 4] = *b"EVTC";
/// Container format version.
pub const FORMAT_VERSION: u32 = 1;
/// Bytes occupied by the container file header.
pub const HEADER_LEN: u64 = 8;

/// Upper bound on a single record payload; anything larger is treated as a
/// garbled length prefix.
const MAX_PAYLOAD_LEN: u64 = 1 << 30;

type DecodeFn = fn(&[u8]) -> EvtResult<Arc<dyn FrameObject>>;

fn decode_blob(bytes: &[u8]) -> EvtResult<Arc<dyn FrameObject>> {
    Ok(Arc::new(Blob::decode(bytes)?))
}

fn decode_event_header(bytes: &[u8]) -> EvtResult<Arc<dyn FrameObject>> {
    Ok(Arc::new(EventHeader::decode(bytes)?))
}

/// Maps on-disk type tags to decoders.
///
/// Pre-registered for the built-in objects; experiments register their own
/// record types before opening any container. A tag with no registered
/// decoder falls back to an opaque [`Blob`], so containers written by newer
/// code still read cleanly.
pub struct ObjectRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        let mut registry = ObjectRegistry {
            decoders: HashMap::new(),
        };
        registry.register("blob", decode_blob);
        registry.register("event_header", decode_event_header);
        registry
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: &'static str, decode: DecodeFn) {
        self.decoders.insert(tag, decode);
    }

    fn decode(&self, tag: &str, bytes: &[u8]) -> EvtResult<Arc<dyn FrameObject>> {
        match self.decoders.get(tag) {
            Some(decode) => decode(bytes),
            // Unregistered types survive the read as raw bytes.
            None => Ok(Arc::new(Blob(bytes.to_vec()))),
        }
    }
}

/// Stream tag and extent of one record, learned without decoding slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeekedRecord {
    pub stream: Stream,
    pub sub_stream: Option<String>,
    /// Record length including the 8-byte length prefix.
    pub total_len: u64,
}

/// Write the container file header.
pub fn write_header<W: Write>(w: &mut W) -> EvtResult<()> {
    w.write_all(&FILE_MAGIC)?;
    w.write_all(&FORMAT_VERSION.to_le_bytes())?;
    Ok(())
}

/// Read and validate the container file header.
pub fn read_header<R: Read>(r: &mut R, path: &Path) -> EvtResult<()> {
    let mut magic = [0u8; 4];
    let mut version = [0u8; 4];
    r.read_exact(&mut magic)
        .and_then(|()| r.read_exact(&mut version))
        .map_err(|e| decode_err(path, 0, format!("short container header: {e}")))?;
    if magic != FILE_MAGIC {
        return Err(decode_err(path, 0, "bad container magic".to_string()));
    }
    let version = u32::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(decode_err(
            path,
            0,
            format!("unsupported container version {version}"),
        ));
    }
    Ok(())
}

/// Encode a frame's native slots into a record payload.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(frame.stream().id() as u32).to_le_bytes());
    let sub = frame.sub_stream().unwrap_or("");
    payload.extend_from_slice(&(sub.len() as u16).to_le_bytes());
    payload.extend_from_slice(sub.as_bytes());

    let slots: Vec<_> = frame.native_slots().collect();
    payload.extend_from_slice(&(slots.len() as u32).to_le_bytes());
    let mut scratch = Vec::new();
    for (name, object) in slots {
        payload.extend_from_slice(&(name.len() as u16).to_le_bytes());
        payload.extend_from_slice(name.as_bytes());
        let tag = object.type_tag();
        payload.extend_from_slice(&(tag.len() as u16).to_le_bytes());
        payload.extend_from_slice(tag.as_bytes());
        scratch.clear();
        object.encode(&mut scratch);
        payload.extend_from_slice(&(scratch.len() as u32).to_le_bytes());
        payload.extend_from_slice(&scratch);
    }
    payload
}

/// Append one frame record. Returns the total bytes written.
pub fn write_frame<W: Write>(w: &mut W, frame: &Frame) -> EvtResult<u64> {
    let payload = encode_frame(frame);
    w.write_all(&(payload.len() as u64).to_le_bytes())?;
    w.write_all(&payload)?;
    Ok(8 + payload.len() as u64)
}

/// Decode the next frame record. `Ok(None)` on a clean end of file.
pub fn read_frame<R: Read>(
    r: &mut R,
    registry: &ObjectRegistry,
    path: &Path,
    ordinal: u64,
) -> EvtResult<Option<Frame>> {
    let Some(payload_len) = read_record_len(r, path, ordinal)? else {
        return Ok(None);
    };
    let mut payload = vec![0u8; payload_len as usize];
    r.read_exact(&mut payload)
        .map_err(|e| decode_err(path, ordinal, format!("truncated record: {e}")))?;
    decode_payload(&payload, registry, path, ordinal).map(Some)
}

/// Read stream tag and extent of the next record, seeking past its body.
/// `Ok(None)` on a clean end of file.
pub fn peek_frame<R: Read + Seek>(
    r: &mut R,
    path: &Path,
    ordinal: u64,
) -> EvtResult<Option<PeekedRecord>> {
    let Some(payload_len) = read_record_len(r, path, ordinal)? else {
        return Ok(None);
    };
    let mut fixed = [0u8; 6];
    r.read_exact(&mut fixed)
        .map_err(|e| decode_err(path, ordinal, format!("truncated record head: {e}")))?;
    let stream = decode_stream(
        u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]),
        path,
        ordinal,
    )?;
    let sub_len = u16::from_le_bytes([fixed[4], fixed[5]]) as u64;
    if 6 + sub_len > payload_len {
        return Err(decode_err(path, ordinal, "sub-stream overruns record".into()));
    }
    let sub_stream = if sub_len == 0 {
        None
    } else {
        let mut sub = vec![0u8; sub_len as usize];
        r.read_exact(&mut sub)
            .map_err(|e| decode_err(path, ordinal, format!("truncated sub-stream: {e}")))?;
        Some(decode_utf8(sub, path, ordinal)?)
    };
    r.seek(SeekFrom::Current((payload_len - 6 - sub_len) as i64))?;
    Ok(Some(PeekedRecord {
        stream,
        sub_stream,
        total_len: 8 + payload_len,
    }))
}

fn decode_payload(
    payload: &[u8],
    registry: &ObjectRegistry,
    path: &Path,
    ordinal: u64,
) -> EvtResult<Frame> {
    let mut cursor = Cursor {
        bytes: payload,
        pos: 0,
        path,
        ordinal,
    };
    let stream = decode_stream(cursor.u32()?, path, ordinal)?;
    let sub_len = cursor.u16()? as usize;
    let sub = decode_utf8(cursor.bytes(sub_len)?.to_vec(), path, ordinal)?;
    let mut frame = Frame::new(stream);
    if !sub.is_empty() {
        frame = frame.with_sub_stream(sub);
    }
    let n_slots = cursor.u32()?;
    for _ in 0..n_slots {
        let name_len = cursor.u16()? as usize;
        let name = decode_utf8(cursor.bytes(name_len)?.to_vec(), path, ordinal)?;
        let tag_len = cursor.u16()? as usize;
        let tag = decode_utf8(cursor.bytes(tag_len)?.to_vec(), path, ordinal)?;
        let obj_len = cursor.u32()? as usize;
        let object = registry
            .decode(&tag, cursor.bytes(obj_len)?)
            .map_err(|e| decode_err(path, ordinal, e.to_string()))?;
        frame
            .put(name, object)
            .map_err(|e| decode_err(path, ordinal, e.to_string()))?;
    }
    Ok(frame)
}

/// Read a record length prefix, distinguishing clean EOF (no bytes at all)
/// from a truncated prefix.
fn read_record_len<R: Read>(r: &mut R, path: &Path, ordinal: u64) -> EvtResult<Option<u64>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < 8 {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(decode_err(path, ordinal, "truncated record length".into()));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let len = u64::from_le_bytes(buf);
    if len < 10 || len > MAX_PAYLOAD_LEN {
        return Err(decode_err(
            path,
            ordinal,
            format!("unreasonable record length {len}"),
        ));
    }
    Ok(Some(len))
}

fn decode_stream(raw: u32, path: &Path, ordinal: u64) -> EvtResult<Stream> {
    char::from_u32(raw)
        .map(Stream::new)
        .ok_or_else(|| decode_err(path, ordinal, format!("invalid stream tag {raw:#x}")))
}

fn decode_utf8(bytes: Vec<u8>, path: &Path, ordinal: u64) -> EvtResult<String> {
    String::from_utf8(bytes).map_err(|_| decode_err(path, ordinal, "invalid UTF-8".into()))
}

fn decode_err(path: &Path, ordinal: u64, reason: String) -> EvtError {
    EvtError::Decode {
        path: path.to_path_buf(),
        ordinal,
        reason,
    }
}

/// Bounds-checked reader over a record payload.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a Path,
    ordinal: u64,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, len: usize) -> EvtResult<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.bytes.len());
        let Some(end) = end else {
            return Err(decode_err(
                self.path,
                self.ordinal,
                "field overruns record".into(),
            ));
        };
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> EvtResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> EvtResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
