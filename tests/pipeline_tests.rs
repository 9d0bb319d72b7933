use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pagepool::pdf::{
    Begin, BackgroundKey, CurrentValue, FaultKind, ImageCache, ImageKey, PageIndex,
    PipelineConfig, RenderEvent, RenderPipeline, RenderRequest, RenderedImage, SourceKey,
    Surface, ZoomLevel,
};
use pagepool::test_utils::{CallCounts, MockBackend, mock_ink};
use url::Url;

const WAIT: Duration = Duration::from_secs(10);

fn pipeline(backend: &Arc<MockBackend>, workers: usize) -> RenderPipeline {
    RenderPipeline::with_config(
        backend.clone(),
        backend.clone(),
        PipelineConfig {
            workers,
            origin: Url::parse("file:///assets/").unwrap(),
        },
    )
}

fn deck() -> Arc<MockBackend> {
    Arc::new(MockBackend::new().with_document("deck.pdf", 3))
}

fn request(page: f64) -> RenderRequest {
    RenderRequest::new("deck.pdf").page(page)
}

fn calls(fetches: usize, decodes: usize, pages: usize, renders: usize) -> CallCounts {
    CallCounts {
        fetches,
        decodes,
        pages,
        renders,
    }
}

#[test]
fn three_page_document_scenario() {
    let backend = deck();
    let pipeline = pipeline(&backend, 2);
    let req = request(1.0).zoom(1.0).background("white");

    // First request: placeholder right away, nothing to show yet.
    let first = pipeline.request_image(&req);
    assert!(!first.is_ready());
    assert!(first.image().is_none());
    let image = first.wait().unwrap();

    assert_eq!(image.dimensions(), backend.page_size_px(1.0));
    assert_eq!(image.pixel(0, 0), Some(mock_ink(1, 0).to_array()));
    let (w, h) = image.dimensions();
    assert_eq!(image.pixel(w - 1, h - 1), Some([255, 255, 255, 255]));
    assert_eq!(backend.calls(), calls(1, 1, 1, 1));

    // Second identical request: the same raster, synchronously, no new work.
    let CurrentValue::Ready(again) = pipeline.request_image(&req) else {
        panic!("second request should hit the cache");
    };
    assert!(Arc::ptr_eq(&image, &again));
    assert_eq!(backend.calls(), calls(1, 1, 1, 1));

    // Invalidation evicts it.
    let evicted = pipeline.invalidate("deck.pdf");
    assert_eq!((evicted.documents, evicted.pages, evicted.images), (1, 1, 1));

    // Next request goes through the whole pipeline again.
    let third = pipeline.request_image(&req);
    assert!(!third.is_ready());
    assert!(third.wait().is_ok());
    assert_eq!(backend.calls(), calls(2, 2, 2, 2));
}

#[test]
fn repeated_hits_do_no_work() {
    let backend = deck();
    let pipeline = pipeline(&backend, 2);
    let image = pipeline.request_image(&request(2.0)).wait().unwrap();

    for _ in 0..50 {
        match pipeline.request_image(&request(2.0)) {
            CurrentValue::Ready(hit) => assert!(Arc::ptr_eq(&hit, &image)),
            CurrentValue::Placeholder { .. } => panic!("expected a cache hit"),
        }
    }
    assert_eq!(backend.calls(), calls(1, 1, 1, 1));
}

#[test]
fn repeated_request_reuses_its_key() {
    let backend = deck();
    let pipeline = pipeline(&backend, 2);
    let bogus = request(1.0).background("definitely-not-a-color");

    let image = pipeline.request_image(&bogus).wait().unwrap();
    assert_eq!(pipeline.key_derivations(), 1);

    for _ in 0..20 {
        let CurrentValue::Ready(hit) = pipeline.request_image(&bogus) else {
            panic!("expected a cache hit");
        };
        assert!(Arc::ptr_eq(&hit, &image));
    }
    assert_eq!(pipeline.key_derivations(), 1);

    // A different request is derived afresh, and so is switching back.
    assert!(!pipeline.request_image(&request(2.0)).is_ready());
    assert!(pipeline.request_image(&bogus).is_ready());
    assert_eq!(pipeline.key_derivations(), 3);
}

#[test]
fn concurrent_identical_requests_share_one_load() {
    let backend = deck();
    let pipeline = Arc::new(pipeline(&backend, 4));
    let hold = backend.hold();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || pipeline.request_image(&request(1.0)))
        })
        .collect();
    let values: Vec<CurrentValue> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Nothing can finish while the backend is held.
    assert!(values.iter().all(|v| !v.is_ready()));
    hold.release();

    let images: Vec<Arc<RenderedImage>> = values.into_iter().map(|v| v.wait().unwrap()).collect();
    assert!(images.iter().all(|image| Arc::ptr_eq(image, &images[0])));
    assert_eq!(backend.calls(), calls(1, 1, 1, 1));
    assert_eq!(pipeline.stats().pending, 0);
}

#[test]
fn distinct_zooms_share_document_and_page() {
    let backend = deck();
    let pipeline = pipeline(&backend, 2);

    let small = pipeline.request_image(&request(1.0).zoom(1.0)).wait().unwrap();
    let large = pipeline.request_image(&request(1.0).zoom(2.0)).wait().unwrap();

    assert_eq!(small.dimensions(), backend.page_size_px(1.0));
    assert_eq!(large.dimensions(), backend.page_size_px(2.0));
    assert_eq!(backend.calls(), calls(1, 1, 1, 2));
    assert_eq!(pipeline.stats().images, 2);
}

#[test]
fn fractional_page_is_floored() {
    let backend = deck();
    let pipeline = pipeline(&backend, 2);

    assert_eq!(
        pipeline.image_key(&request(2.9)),
        pipeline.image_key(&request(2.0))
    );

    let image = pipeline.request_image(&request(2.9)).wait().unwrap();
    let CurrentValue::Ready(same) = pipeline.request_image(&request(2.0)) else {
        panic!("page 2.0 should hit the entry rendered for 2.9");
    };
    assert!(Arc::ptr_eq(&image, &same));
    assert_eq!(image.pixel(0, 0), Some(mock_ink(2, 0).to_array()));
}

#[test]
fn unparseable_background_matches_white() {
    let backend = deck();
    let pipeline = pipeline(&backend, 2);
    let bogus = request(1.0).background("definitely-not-a-color");
    let white = request(1.0).background("white");

    assert_eq!(pipeline.image_key(&bogus), pipeline.image_key(&white));

    let image = pipeline.request_image(&bogus).wait().unwrap();
    let CurrentValue::Ready(same) = pipeline.request_image(&white) else {
        panic!("white should hit the entry rendered for the bogus color");
    };
    assert!(Arc::ptr_eq(&image, &same));
}

#[test]
fn background_fills_uncovered_area() {
    let backend = deck();
    let pipeline = pipeline(&backend, 1);

    let image = pipeline
        .request_image(&request(1.0).background("#102030"))
        .wait()
        .unwrap();
    let (w, h) = image.dimensions();
    assert_eq!(image.pixel(w - 1, h - 1), Some([0x10, 0x20, 0x30, 0xff]));
}

#[test]
fn placeholder_carries_previous_image_of_source() {
    let backend = deck();
    let pipeline = pipeline(&backend, 2);

    let first = pipeline.request_image(&request(1.0)).wait().unwrap();
    // The blocking wait does not record what was shown; a hit does.
    assert!(pipeline.request_image(&request(1.0)).is_ready());

    let next = pipeline.request_image(&request(2.0));
    let CurrentValue::Placeholder { previous, .. } = &next else {
        panic!("page 2 was never rendered");
    };
    assert!(Arc::ptr_eq(previous.as_ref().unwrap(), &first));
    assert!(next.wait().is_ok());
}

#[test]
fn fetch_failure_reverts_and_retries() {
    let backend = Arc::new(MockBackend::new());
    let pipeline = pipeline(&backend, 2);
    let events = pipeline.events();

    let err = pipeline.request_image(&request(1.0)).wait().unwrap_err();
    assert_eq!(err.kind(), FaultKind::Fetch);

    match events.recv_timeout(WAIT).unwrap() {
        RenderEvent::Failed { error, .. } => assert_eq!(error.kind(), FaultKind::Fetch),
        RenderEvent::Ready { .. } => panic!("expected a failure event"),
    }
    let stats = pipeline.stats();
    assert_eq!((stats.documents, stats.images, stats.pending), (0, 0, 0));

    // The document appears; the next request starts from scratch.
    backend.set_document("deck.pdf", 3);
    let placeholder = pipeline.request_image(&request(1.0));
    assert!(!placeholder.is_ready());
    assert!(placeholder.wait().is_ok());
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        RenderEvent::Ready { .. }
    ));
    assert_eq!(backend.calls().fetches, 2);
}

#[test]
fn decode_failure_is_distinguishable() {
    let backend = Arc::new(MockBackend::new().with_corrupt("deck.pdf"));
    let pipeline = pipeline(&backend, 1);

    let err = pipeline.request_image(&request(1.0)).wait().unwrap_err();
    assert_eq!(err.kind(), FaultKind::Decode);
    assert_eq!(pipeline.stats().documents, 0);
}

#[test]
fn out_of_range_pages_fail_with_page_range() {
    let backend = deck();
    let pipeline = pipeline(&backend, 2);

    for page in [0.0, 4.0, -1.0] {
        let err = pipeline.request_image(&request(page)).wait().unwrap_err();
        assert_eq!(err.kind(), FaultKind::PageRange, "page {page}");
    }

    // The document decoded fine and is not affected by the bad pages.
    assert_eq!(pipeline.stats().documents, 1);
    assert!(pipeline.request_image(&request(3.0)).wait().is_ok());
    assert_eq!(backend.calls().decodes, 1);
}

#[test]
fn page_count_is_one_until_loaded() {
    let backend = deck();
    let pipeline = pipeline(&backend, 2);
    let hold = backend.hold();

    assert_eq!(pipeline.page_count("deck.pdf", None), 1);
    hold.release();

    assert_eq!(pipeline.load_page_count("deck.pdf", None).unwrap(), 3);
    assert_eq!(pipeline.page_count("deck.pdf", None), 3);
    assert_eq!(backend.calls().fetches, 1);
}

#[test]
fn render_blocking_uses_the_same_caches() {
    let backend = deck();
    let pipeline = pipeline(&backend, 1);

    let image = pipeline.render_blocking(&request(1.0)).unwrap();
    let CurrentValue::Ready(hit) = pipeline.request_image(&request(1.0)) else {
        panic!("blocking render should populate the image cache");
    };
    assert!(Arc::ptr_eq(&image, &hit));
}

#[test]
fn clear_resets_every_layer() {
    let backend = deck();
    let pipeline = pipeline(&backend, 2);
    pipeline.request_image(&request(1.0)).wait().unwrap();

    pipeline.clear();
    let stats = pipeline.stats();
    assert_eq!((stats.documents, stats.pages, stats.images), (0, 0, 0));

    let after = pipeline.request_image(&request(1.0));
    let CurrentValue::Placeholder { previous, .. } = &after else {
        panic!("cleared cache cannot hit");
    };
    assert!(previous.is_none());
    assert!(after.wait().is_ok());
}

#[test]
fn first_completion_wins_when_single_flight_is_bypassed() {
    let cache = ImageCache::new();
    let key = ImageKey {
        source: SourceKey::opaque("deck.pdf"),
        page: PageIndex::new(1),
        zoom: ZoomLevel::default(),
        background: BackgroundKey::white(),
    };
    let image = |side: u32| {
        let surface = Surface::allocate(side, side).unwrap();
        Arc::new(RenderedImage::from_surface(surface).unwrap())
    };

    let Begin::Started(started_first) = cache.begin(&key) else {
        panic!("empty cache should start a load");
    };
    let started_second = cache.begin_detached();

    // The later-started task completes first and wins.
    let winner = cache.complete(&key, &started_second, Ok(image(2))).unwrap();
    let loser = cache.complete(&key, &started_first, Ok(image(3))).unwrap();

    assert!(Arc::ptr_eq(&winner, &loser));
    assert_eq!(cache.get(&key).unwrap().dimensions(), (2, 2));
    assert_eq!(started_first.wait().unwrap().dimensions(), (2, 2));
}
