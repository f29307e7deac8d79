//! Metadata-inheritance bookkeeping ("mixing").
//!
//! The mixer tracks, per metadata stream, the most recently seen frame, in
//! recency order. Data frames produced after a metadata frame implicitly
//! inherit every key of it they do not themselves bind; metadata frames only
//! relate to earlier frames of their own stream. Pure in-memory bookkeeping:
//! no I/O, no blocking, O(1)-ish against the fixed set of metadata streams.

use crate::frame::Frame;
use crate::stream::Stream;

#[derive(Debug, Clone)]
struct MixSlot {
    stream: Stream,
    /// Present when the mixer is fed whole frames ([`StreamMixer::mix`]);
    /// absent under tag-only bookkeeping ([`StreamMixer::observe`]).
    frame: Option<Frame>,
}

/// Tracks the latest frame of each metadata stream for one open sequence.
///
/// Reset whenever the sequence is rewound or all underlying containers are
/// closed.
#[derive(Debug, Clone, Default)]
pub struct StreamMixer {
    /// Most recently updated metadata stream last.
    latest: Vec<MixSlot>,
}

impl StreamMixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Which metadata stream, if any, logically precedes a new frame of
    /// `stream` under the inheritance rule.
    ///
    /// Data frames inherit from the most recently seen metadata stream;
    /// metadata frames inherit only from an earlier frame of the same stream.
    pub fn most_recent_mixed_stream(&self, stream: Stream) -> Option<Stream> {
        if stream.is_metadata() {
            self.latest
                .iter()
                .find(|s| s.stream == stream)
                .map(|s| s.stream)
        } else {
            self.latest.last().map(|s| s.stream)
        }
    }

    /// Tag-only form of [`mix`](Self::mix): updates the recency bookkeeping
    /// and returns the nearest-ancestor stream against the state *before*
    /// this call. Used by the sequence indexer, which never needs the frames
    /// themselves.
    pub fn observe(&mut self, stream: Stream) -> Option<Stream> {
        let ancestor = self.most_recent_mixed_stream(stream);
        if stream.is_metadata() {
            self.latest.retain(|s| s.stream != stream);
            self.latest.push(MixSlot {
                stream,
                frame: None,
            });
        }
        ancestor
    }

    /// Record `frame` as the latest of its stream (metadata streams only) and
    /// augment data frames with every not-yet-superseded metadata key.
    ///
    /// Returns the stream whose most recent frame is `frame`'s nearest
    /// ancestor, evaluated against the mixing state before this call.
    pub fn mix(&mut self, frame: &mut Frame) -> Option<Stream> {
        let stream = frame.stream();
        let ancestor = self.most_recent_mixed_stream(stream);
        if stream.is_metadata() {
            self.latest.retain(|s| s.stream != stream);
            self.latest.push(MixSlot {
                stream,
                frame: Some(frame.clone()),
            });
        } else {
            // Most recent metadata stream wins on conflicting keys.
            for slot in self.latest.iter().rev() {
                if let Some(tracked) = &slot.frame {
                    frame.merge_from(tracked);
                }
            }
        }
        ancestor
    }

    /// Clear all state (sequence rewound or all containers closed).
    pub fn reset(&mut self) {
        self.latest.clear();
    }
}
