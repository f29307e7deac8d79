//! Stream tags classifying frames.
//!
//! A [`Stream`] is a single-character tag attached to every frame. A small set
//! of well-known tags covers the slow-changing metadata record types and the
//! per-event data type; any other printable character is available as an
//! extension tag for experiment-specific sub-detectors or synthetic streams.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification tag on a frame.
///
/// The metadata streams ([`Stream::GEOMETRY`], [`Stream::CALIBRATION`],
/// [`Stream::DETECTOR_STATUS`]) change slowly and are implicitly inherited by
/// the fast-changing data frames that follow them (see
/// [`StreamMixer`](crate::mixer::StreamMixer)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stream(char);

impl Stream {
    /// Detector geometry records.
    pub const GEOMETRY: Stream = Stream('G');
    /// Calibration constants.
    pub const CALIBRATION: Stream = Stream('C');
    /// Detector status / run configuration.
    pub const DETECTOR_STATUS: Stream = Stream('D');
    /// Per-event physics data.
    pub const PHYSICS: Stream = Stream('P');
    /// End-of-run bookkeeping records.
    pub const TRAY_INFO: Stream = Stream('I');

    /// Create a stream tag from its single-character id.
    pub const fn new(id: char) -> Self {
        Stream(id)
    }

    /// The single-character id of this stream.
    pub const fn id(self) -> char {
        self.0
    }

    /// Whether frames of this stream are metadata that later data frames
    /// inherit from.
    pub const fn is_metadata(self) -> bool {
        matches!(self.0, 'G' | 'C' | 'D')
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Stream::GEOMETRY => write!(f, "Geometry"),
            Stream::CALIBRATION => write!(f, "Calibration"),
            Stream::DETECTOR_STATUS => write!(f, "DetectorStatus"),
            Stream::PHYSICS => write!(f, "Physics"),
            Stream::TRAY_INFO => write!(f, "TrayInfo"),
            Stream(c) => write!(f, "Stream('{c}')"),
        }
    }
}
