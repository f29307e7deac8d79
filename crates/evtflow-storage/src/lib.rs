//! Sequential frame containers for evtflow: the on-disk record format,
//! asynchronous reader/writer pipeline endpoints, and an indexed
//! random-access view over chains of container files.

pub mod codec;
pub mod reader;
pub mod sequence;
pub mod stager;
pub mod writer;

pub use codec::{ObjectRegistry, PeekedRecord, FILE_MAGIC, FORMAT_VERSION, HEADER_LEN};
pub use reader::FrameReader;
pub use sequence::{FrameSequence, IndexEntry};
pub use stager::{LocalStager, Stager};
pub use writer::FrameWriter;
