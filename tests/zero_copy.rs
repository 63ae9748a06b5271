//! Zero-copy frame lifecycle: recyclers fire exactly once, after the last
//! reference anywhere in the chain is gone.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::CollectSink;
use framepipe::core::{Block, BlockState, FrameInfo, PixelFormat, VideoFrame, VideoSink};

/// Push 100 externally owned frames through a blocking sink with a queue
/// depth of one; every recycler fires exactly once.
#[test]
fn external_buffers_recycled_exactly_once() {
    let sink = Arc::new(CollectSink::new("zc", Duration::ZERO));
    sink.set_parameter("queue_depth", "1").unwrap();
    sink.set_parameter("blocking", "true").unwrap();
    sink.initialize(&sink.configuration()).unwrap();
    sink.start().unwrap();

    let recycled = Arc::new(AtomicU32::new(0));
    let info = FrameInfo::new(320, 240, PixelFormat::Rgb24);
    // One reusable mapping standing in for a camera buffer; it outlives
    // every frame wrapped around it.
    let mut backing = vec![0u8; info.frame_size()];

    for i in 0..100u64 {
        let counter = Arc::clone(&recycled);
        let mut frame = unsafe {
            VideoFrame::wrap_external(backing.as_mut_ptr(), backing.len(), info, move || {
                counter.fetch_add(1, Ordering::AcqRel);
            })
        }
        .unwrap();
        frame.info_mut().sequence_number = i + 1;

        let shared = Arc::new(frame);
        assert!(sink.submit(Arc::clone(&shared)));
        // Producer side drops its reference; the sink queue holds the rest.
        drop(shared);
    }

    // The blocking queue of depth one back-pressures the loop, so at most a
    // couple of frames are still in flight here.
    sink.stop().unwrap();
    assert_eq!(sink.state(), BlockState::Stopped);

    assert_eq!(
        recycled.load(Ordering::Acquire),
        100,
        "every recycler fired exactly once"
    );
    let stats = sink.stats();
    assert_eq!(stats.frames_processed + stats.frames_dropped, 100);

    // The worker is gone: further submits are refused.
    let leftover = unsafe {
        VideoFrame::wrap_external(backing.as_mut_ptr(), backing.len(), info, || {})
    }
    .unwrap();
    assert!(!sink.submit(Arc::new(leftover)));

    sink.shutdown().unwrap();
}

/// A recycler on a heap frame fires when the sink releases the last
/// reference after processing.
#[test]
fn heap_frame_recycler_fires_after_sink_release() {
    let sink = Arc::new(CollectSink::new("heap-rc", Duration::ZERO));
    sink.initialize(&sink.configuration()).unwrap();
    sink.start().unwrap();

    let recycled = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&recycled);

    let mut frame = VideoFrame::alloc(FrameInfo::new(64, 48, PixelFormat::Rgb24)).unwrap();
    frame.set_recycler(move || {
        counter.fetch_add(1, Ordering::AcqRel);
    });

    assert!(sink.submit(Arc::new(frame)));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(recycled.load(Ordering::Acquire), 1);

    sink.stop().unwrap();
    sink.shutdown().unwrap();
}
