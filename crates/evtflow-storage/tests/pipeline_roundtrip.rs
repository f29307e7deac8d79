//! End-to-end pipeline tests: frames pushed through a writer sink come back
//! through a reader source in the same order, with the same payloads, and
//! with metadata inheritance applied on the way out.

use evtflow_core::{
    Blob, EvtError, EvtResult, Frame, FrameObject, Module, ModuleConfig, OutboxSet, SourceOutcome,
    Stream, Tray,
};
use evtflow_storage::{codec, FrameReader, FrameWriter};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct VecSource {
    frames: std::vec::IntoIter<Frame>,
}

impl VecSource {
    fn new(frames: Vec<Frame>) -> Self {
        VecSource {
            frames: frames.into_iter(),
        }
    }
}

impl Module for VecSource {
    fn generate(&mut self, out: &mut OutboxSet) -> EvtResult<SourceOutcome> {
        match self.frames.next() {
            Some(frame) => {
                out.push_to_all(frame);
                Ok(SourceOutcome::Produced)
            }
            None => Ok(SourceOutcome::Exhausted),
        }
    }
}

#[derive(Clone, Default)]
struct CollectSink {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl Module for CollectSink {
    fn process(&mut self, frame: Frame, _out: &mut OutboxSet) -> EvtResult<()> {
        self.frames.lock().push(frame);
        Ok(())
    }
}

fn blob_frame(stream: char, key: &str, payload: &[u8]) -> Frame {
    let mut frame = Frame::new(Stream::new(stream));
    frame
        .put(key, Arc::new(Blob(payload.to_vec())) as Arc<dyn FrameObject>)
        .unwrap();
    frame
}

/// Run `frames` through a writer module into `path`.
fn write_through_pipeline(path: &Path, frames: Vec<Frame>, droppable: Vec<&str>) {
    let mut tray = Tray::new();
    tray.add_module("source", VecSource::new(frames), ModuleConfig::new())
        .unwrap();
    tray.add_module(
        "writer",
        FrameWriter::new(path).with_lookahead(4),
        ModuleConfig::new().set("droppable_streams", droppable),
    )
    .unwrap();
    tray.connect("source", "out", "writer").unwrap();
    tray.execute().unwrap();
}

/// Read `paths` back through a reader module, collecting everything.
fn read_through_pipeline(paths: Vec<PathBuf>, lookahead: usize) -> Vec<Frame> {
    let sink = CollectSink::default();
    let mut tray = Tray::new();
    tray.add_module(
        "reader",
        FrameReader::new(paths).with_lookahead(lookahead),
        ModuleConfig::new(),
    )
    .unwrap();
    tray.add_module("sink", sink.clone(), ModuleConfig::new())
        .unwrap();
    tray.connect("reader", "out", "sink").unwrap();
    tray.execute().unwrap();
    let frames = sink.frames.lock().clone();
    frames
}

/// Decode a container directly, without any mixing.
fn raw_frames(path: &Path) -> Vec<Frame> {
    let mut reader = BufReader::new(File::open(path).unwrap());
    codec::read_header(&mut reader, path).unwrap();
    let registry = codec::ObjectRegistry::new();
    let mut frames = Vec::new();
    let mut ordinal = 0;
    while let Some(frame) = codec::read_frame(&mut reader, &registry, path, ordinal).unwrap() {
        frames.push(frame);
        ordinal += 1;
    }
    frames
}

fn streams_of(frames: &[Frame]) -> String {
    frames.iter().map(|f| f.stream().id()).collect()
}

#[test]
fn roundtrip_preserves_order_and_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.evt");

    let frames = vec![
        blob_frame('G', "geometry", b"geo-1"),
        blob_frame('C', "constants", b"cal-1"),
        blob_frame('P', "hits", b"event-1"),
        blob_frame('P', "hits", b"event-2"),
        blob_frame('C', "constants", b"cal-2"),
        blob_frame('P', "hits", b"event-3"),
    ];
    write_through_pipeline(&path, frames, Vec::new());

    let read = read_through_pipeline(vec![path], 3);
    assert_eq!(streams_of(&read), "GCPPCP");
    assert_eq!(read[2].get_as::<Blob>("hits").unwrap().0, b"event-1");
    assert_eq!(read[5].get_as::<Blob>("hits").unwrap().0, b"event-3");
}

#[test]
fn reader_mixes_metadata_into_data_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.evt");

    write_through_pipeline(
        &path,
        vec![
            blob_frame('G', "geometry", b"geo"),
            blob_frame('C', "constants", b"cal-old"),
            blob_frame('P', "hits", b"e1"),
            blob_frame('C', "constants", b"cal-new"),
            blob_frame('P', "hits", b"e2"),
        ],
        Vec::new(),
    );
    let read = read_through_pipeline(vec![path], 2);

    let first = &read[2];
    assert_eq!(first.get_as::<Blob>("geometry").unwrap().0, b"geo");
    assert_eq!(first.get_as::<Blob>("constants").unwrap().0, b"cal-old");
    assert_eq!(first.mixed_from("geometry"), Some(Stream::GEOMETRY));
    assert_eq!(first.mixed_from("hits"), None);

    // The second physics frame sees the newer calibration.
    let second = &read[4];
    assert_eq!(second.get_as::<Blob>("constants").unwrap().0, b"cal-new");
}

#[test]
fn mixed_keys_are_not_written_back() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.evt");
    let second = dir.path().join("second.evt");

    write_through_pipeline(
        &first,
        vec![
            blob_frame('G', "geometry", b"geo"),
            blob_frame('P', "hits", b"e1"),
        ],
        Vec::new(),
    );

    // Copy through a reader (which mixes) into a second writer.
    let mut tray = Tray::new();
    tray.add_module(
        "reader",
        FrameReader::new(vec![first]),
        ModuleConfig::new(),
    )
    .unwrap();
    tray.add_module("writer", FrameWriter::new(&second), ModuleConfig::new())
        .unwrap();
    tray.connect("reader", "out", "writer").unwrap();
    tray.execute().unwrap();

    let raw = raw_frames(&second);
    assert_eq!(streams_of(&raw), "GP");
    // The physics record on disk holds only its native key.
    assert!(raw[1].has("hits"));
    assert!(!raw[1].has("geometry"));
}

#[test]
fn reader_chains_multiple_files_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.evt");
    let b = dir.path().join("b.evt");
    write_through_pipeline(
        &a,
        vec![blob_frame('P', "hits", b"e1"), blob_frame('P', "hits", b"e2")],
        Vec::new(),
    );
    write_through_pipeline(&b, vec![blob_frame('P', "hits", b"e3")], Vec::new());

    let read = read_through_pipeline(vec![a, b], 5);
    assert_eq!(streams_of(&read), "PPP");
    assert_eq!(read[2].get_as::<Blob>("hits").unwrap().0, b"e3");
}

#[test]
fn lookahead_spanning_file_boundaries_preserves_global_order() {
    let dir = tempfile::tempdir().unwrap();
    let parts = [("p0", "AB"), ("p1", "CDQ"), ("p2", "NNNPRST")];
    let mut paths = Vec::new();
    for (name, streams) in parts {
        let path = dir.path().join(format!("{name}.evt"));
        let frames = streams
            .chars()
            .map(|c| blob_frame(c, "payload", c.to_string().as_bytes()))
            .collect();
        write_through_pipeline(&path, frames, Vec::new());
        paths.push(path);
    }

    // A lookahead deeper than any single file keeps the worker reading
    // ahead across boundaries without reordering anything.
    let read = read_through_pipeline(paths, 5);
    assert_eq!(streams_of(&read), "ABCDQNNNPRST");
}

#[test]
fn orphaned_metadata_is_dropped_or_flushed_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.evt");

    write_through_pipeline(
        &path,
        vec![
            blob_frame('G', "geometry", b"geo-old"),
            blob_frame('G', "geometry", b"geo-new"), // supersedes geo-old
            blob_frame('C', "constants", b"cal"),
            blob_frame('P', "hits", b"e1"), // flushes G then C
            blob_frame('G', "geometry", b"geo-unused"), // no data follows
        ],
        vec!["G", "C"],
    );

    let raw = raw_frames(&path);
    assert_eq!(streams_of(&raw), "GCP");
    // The superseded geometry never reached the file; arrival order among
    // the flushed orphans is preserved.
    assert_eq!(raw[0].get_as::<Blob>("geometry").unwrap().0, b"geo-new");
    assert_eq!(raw[1].get_as::<Blob>("constants").unwrap().0, b"cal");
}

#[test]
fn all_orphans_run_writes_an_empty_container() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.evt");

    write_through_pipeline(
        &path,
        vec![
            blob_frame('G', "geometry", b"geo"),
            blob_frame('C', "constants", b"cal"),
        ],
        vec!["G", "C"],
    );

    assert!(raw_frames(&path).is_empty());
}

#[test]
fn corrupt_record_fails_the_run_with_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.evt");
    {
        let mut file = BufWriter::new(File::create(&path).unwrap());
        codec::write_header(&mut file).unwrap();
        // Length prefix below the minimum record size.
        file.write_all(&5u64.to_le_bytes()).unwrap();
        file.flush().unwrap();
    }

    let mut tray = Tray::new();
    tray.add_module(
        "reader",
        FrameReader::new(vec![path]),
        ModuleConfig::new(),
    )
    .unwrap();
    tray.add_module("sink", CollectSink::default(), ModuleConfig::new())
        .unwrap();
    tray.connect("reader", "out", "sink").unwrap();

    let err = tray.execute().unwrap_err();
    assert!(matches!(err, EvtError::Decode { ordinal: 0, .. }));
}
