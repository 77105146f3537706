//! Scheduler integration tests over synthetic page feeds.
//!
//! Pages are fed through `PageFeed::channel` and processed by stub stage
//! backends, so these run without pdfium or an LLM provider.

use docpipe::export::markdown::parse_markdown_tables;
use docpipe::export::package::{build_archive, AggregateResponse};
use docpipe::pipeline::accelerator::AcceleratorPool;
use docpipe::pipeline::table::GridTableStructure;
use docpipe::{
    document_markdown, Accelerator, BoundingBox, ConversionProgressCallback, ConvertError,
    Converter, Document, FaultPolicy, ItemResult, OcrPolicy, PageFault, PageFeed, PageSeparator, PipelineConfig,
    PipelineConfigBuilder, Provenance, RasterPage, RasterResult, Region, RegionKind,
    StageBackend, StageError, StageItem, StageKind, StageSettings, TextCell,
};
use futures::future::BoxFuture;
use image::{DynamicImage, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn raster(index: usize) -> RasterPage {
    RasterPage {
        index,
        width: 200.0,
        height: 100.0,
        image: Some(Arc::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 4, Rgb([250, 250, 250]))))),
        text_cells: Vec::new(),
        faults: Vec::new(),
    }
}

fn page_box(item: &StageItem) -> BoundingBox {
    BoundingBox::new(0.0, 0.0, item.width, item.height)
}

/// What a stub backend does with one page.
#[derive(Clone, Copy)]
enum Act {
    /// Emit a text region after a page-dependent delay.
    Text,
    /// Emit a 3×2 table region built from text cells.
    Table,
    /// Fault the page.
    Fault,
    /// Never answer.
    Stall,
}

struct Stub {
    name: &'static str,
    source: Provenance,
    plan: Box<dyn Fn(usize) -> Act + Send + Sync>,
    calls: AtomicUsize,
    /// Page numbers handed to this backend, in arrival order.
    seen: Mutex<Vec<usize>>,
}

impl Stub {
    fn new(name: &'static str, source: Provenance, plan: impl Fn(usize) -> Act + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            name,
            source,
            plan: Box::new(plan),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn text(name: &'static str, source: Provenance) -> Arc<Self> {
        Self::new(name, source, |_| Act::Text)
    }

    fn saw(&self, page: usize) -> bool {
        self.seen.lock().unwrap().contains(&page)
    }

    async fn run(&self, item: StageItem) -> Option<ItemResult> {
        let bbox = page_box(&item);
        match (self.plan)(item.page) {
            Act::Text => {
                // Later pages finish first.
                tokio::time::sleep(Duration::from_millis(((12 - item.page % 12) * 2) as u64)).await;
                let mut regions = item.regions;
                regions.push(Region::new(
                    RegionKind::Text,
                    bbox,
                    Some(format!("{} {}", self.name, item.page)),
                    self.source,
                ));
                Some(Ok(regions))
            }
            Act::Table => Some(Ok(vec![table_region()])),
            Act::Fault => Some(Err(format!("{} rejected page {}", self.name, item.page))),
            Act::Stall => None,
        }
    }
}

impl StageBackend for Stub {
    fn name(&self) -> &str {
        self.name
    }

    fn process_batch(&self, items: Vec<StageItem>) -> BoxFuture<'_, Result<Vec<ItemResult>, StageError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().extend(items.iter().map(|i| i.page));
            let mut results = Vec::with_capacity(items.len());
            for item in items {
                match self.run(item).await {
                    Some(result) => results.push(result),
                    None => futures::future::pending::<()>().await,
                }
            }
            Ok(results)
        })
    }
}

/// A backend whose every batch fails outright.
struct Broken;

impl StageBackend for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn process_batch(&self, _items: Vec<StageItem>) -> BoxFuture<'_, Result<Vec<ItemResult>, StageError>> {
        Box::pin(async { Err(StageError::Unavailable("model weights missing".into())) })
    }
}

/// A backend slower than any sensible timeout.
struct Sleepy;

impl StageBackend for Sleepy {
    fn name(&self) -> &str {
        "sleepy"
    }

    fn process_batch(&self, items: Vec<StageItem>) -> BoxFuture<'_, Result<Vec<ItemResult>, StageError>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(items.into_iter().map(|i| Ok(i.regions)).collect())
        })
    }
}

/// Records the highest number of batches it ever ran at once.
#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
    batches: AtomicUsize,
}

impl StageBackend for Gauge {
    fn name(&self) -> &str {
        "gauge"
    }

    fn process_batch(&self, items: Vec<StageItem>) -> BoxFuture<'_, Result<Vec<ItemResult>, StageError>> {
        Box::pin(async move {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.batches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(4)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(items
                .into_iter()
                .map(|item| {
                    let mut regions = item.regions.clone();
                    regions.push(Region::new(
                        RegionKind::Text,
                        page_box(&item),
                        Some(format!("gauge {}", item.page)),
                        Provenance::Layout,
                    ));
                    Ok(regions)
                })
                .collect())
        })
    }
}

const TABLE: [[&str; 2]; 3] = [["Fruit", "Price"], ["Apple", "1.20"], ["Big pear", "2.05"]];

fn table_region() -> Region {
    let mut cells = Vec::new();
    for (r, row) in TABLE.iter().enumerate() {
        for (c, text) in row.iter().enumerate() {
            let x0 = 20.0 + c as f32 * 80.0;
            let y0 = 20.0 + r as f32 * 15.0;
            cells.push(TextCell::new(*text, BoundingBox::new(x0, y0, x0 + 60.0, y0 + 10.0)));
        }
    }
    let bbox = BoundingBox::new(10.0, 10.0, 190.0, 70.0);
    Region::new(RegionKind::Table, bbox, None, Provenance::Layout).with_cells(cells)
}

/// Every stage on, small batches, CPU pool.
fn base() -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .layout(StageSettings::new(3, 2))
        .ocr(StageSettings::new(2, 2))
        .table_structure(StageSettings::new(2, 1))
        .batch_wait_ms(5)
}

fn converter(config: PipelineConfig, backends: Vec<(StageKind, Arc<dyn StageBackend>)>) -> Converter {
    converter_on(Arc::new(AcceleratorPool::new()), config, backends)
}

fn converter_on(
    pool: Arc<AcceleratorPool>,
    config: PipelineConfig,
    backends: Vec<(StageKind, Arc<dyn StageBackend>)>,
) -> Converter {
    let mut builder = Converter::builder(config).accelerators(pool);
    for (kind, backend) in backends {
        builder = builder.backend(kind, backend);
    }
    builder.build().unwrap()
}

/// Feed `pages` in order, each either rendered or a decode fault.
fn spawn_feed(pages: Vec<RasterResult>) -> PageFeed {
    let total = pages.len();
    let (tx, feed) = PageFeed::channel(total, (1..=total).collect(), 2);
    tokio::spawn(feed_all(tx, pages));
    feed
}

async fn feed_all(tx: mpsc::Sender<RasterResult>, pages: Vec<RasterResult>) {
    for page in pages {
        if tx.send(page).await.is_err() {
            return;
        }
    }
}

fn rendered(n: usize) -> Vec<RasterResult> {
    (1..=n).map(|i| Ok(raster(i))).collect()
}

fn indices(doc: &Document) -> Vec<usize> {
    doc.pages.iter().map(|p| p.index).collect()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Ordering ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pages_come_back_in_ascending_order_for_every_stage_subset() {
    let subsets: [&[StageKind]; 4] = [
        &[StageKind::Layout],
        &[StageKind::Layout, StageKind::TableStructure],
        &[StageKind::Layout, StageKind::Ocr],
        &StageKind::ALL,
    ];

    for enabled in subsets {
        let mut builder = base().ocr_policy(OcrPolicy::Force);
        for kind in StageKind::ALL {
            builder = builder.enable(kind, enabled.contains(&kind));
        }
        let layout = Stub::new("layout", Provenance::Layout, |n| {
            if n % 4 == 0 {
                Act::Table
            } else {
                Act::Text
            }
        });
        let conv = converter(
            builder.build().unwrap(),
            vec![
                (StageKind::Layout, layout as Arc<dyn StageBackend>),
                (StageKind::Ocr, Stub::text("ocr", Provenance::Ocr) as Arc<dyn StageBackend>),
                (StageKind::TableStructure, Arc::new(GridTableStructure::default()) as Arc<dyn StageBackend>),
            ],
        );

        let doc = conv.start_pages("ordered.pdf", spawn_feed(rendered(11))).document().await.unwrap();
        assert_eq!(indices(&doc), (1..=11).collect::<Vec<_>>(), "stages {enabled:?}");
        assert!(doc.faulted_pages().next().is_none(), "stages {enabled:?}");

        let ocr_ran = enabled.contains(&StageKind::Ocr);
        assert_eq!(doc.pages[0].markdown.contains("ocr 1"), ocr_ran, "stages {enabled:?}");
    }
}

#[tokio::test]
async fn progress_events_cover_every_page() {
    #[derive(Default)]
    struct Counter {
        done: AtomicUsize,
        faulted: AtomicUsize,
        finished: std::sync::Mutex<Option<(usize, usize)>>,
    }
    impl ConversionProgressCallback for Counter {
        fn on_page_complete(&self, _: usize, _: usize, _: usize) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
        fn on_page_error(&self, _: usize, _: usize, _: &str) {
            self.faulted.fetch_add(1, Ordering::SeqCst);
        }
        fn on_conversion_complete(&self, total: usize, ok: usize) {
            *self.finished.lock().unwrap() = Some((total, ok));
        }
    }

    let counter = Arc::new(Counter::default());
    let config = base()
        .enable(StageKind::Ocr, false)
        .enable(StageKind::TableStructure, false)
        .progress_callback(counter.clone())
        .build()
        .unwrap();
    let layout = Stub::new("layout", Provenance::Layout, |n| if n == 2 { Act::Fault } else { Act::Text });
    let conv = converter(config, vec![(StageKind::Layout, layout as Arc<dyn StageBackend>)]);

    conv.start_pages("progress.pdf", spawn_feed(rendered(6))).document().await.unwrap();
    assert_eq!(counter.done.load(Ordering::SeqCst), 5);
    assert_eq!(counter.faulted.load(Ordering::SeqCst), 1);
    assert_eq!(*counter.finished.lock().unwrap(), Some((6, 5)));
}

// ── Tables ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn table_grid_survives_markdown_export() {
    let config = base().enable(StageKind::Ocr, false).build().unwrap();
    let layout = Stub::new("layout", Provenance::Layout, |_| Act::Table);
    let conv = converter(
        config,
        vec![
            (StageKind::Layout, layout as Arc<dyn StageBackend>),
            (StageKind::TableStructure, Arc::new(GridTableStructure::default()) as Arc<dyn StageBackend>),
        ],
    );

    let doc = conv.start_pages("table.pdf", spawn_feed(rendered(1))).document().await.unwrap();
    let region = &doc.pages[0].regions[0];
    assert_eq!(region.source, Provenance::TableStructure);
    let structure = region.table.as_ref().unwrap();
    assert_eq!((structure.num_rows, structure.num_cols), (3, 2));
    assert!(structure.fits_within(&region.bbox));

    let expected: Vec<Vec<String>> = TABLE
        .iter()
        .map(|row| row.iter().map(|s| s.to_string()).collect())
        .collect();
    let markdown = document_markdown(&doc, &PageSeparator::None);
    assert_eq!(parse_markdown_tables(&markdown), vec![expected]);
}

#[tokio::test]
async fn converting_twice_gives_identical_markdown() {
    let config = base().ocr_policy(OcrPolicy::Force).build().unwrap();
    let layout = Stub::new("layout", Provenance::Layout, |n| {
        if n % 4 == 0 {
            Act::Table
        } else {
            Act::Text
        }
    });
    let conv = converter(
        config,
        vec![
            (StageKind::Layout, layout as Arc<dyn StageBackend>),
            (StageKind::Ocr, Stub::text("ocr", Provenance::Ocr) as Arc<dyn StageBackend>),
            (StageKind::TableStructure, Arc::new(GridTableStructure::default()) as Arc<dyn StageBackend>),
        ],
    );

    let first = conv.start_pages("twice.pdf", spawn_feed(rendered(11))).document().await.unwrap();
    let second = conv.start_pages("twice.pdf", spawn_feed(rendered(11))).document().await.unwrap();

    let separator = PageSeparator::Comment;
    let markdown = document_markdown(&first, &separator);
    assert!(markdown.contains("| Fruit | Price |"), "got: {markdown}");
    assert!(markdown.contains("ocr 11"), "got: {markdown}");
    assert_eq!(markdown, document_markdown(&second, &separator));
}

// ── Faults ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn one_faulting_page_does_not_sink_the_rest() {
    let config = base()
        .enable(StageKind::Ocr, false)
        .enable(StageKind::TableStructure, false)
        .build()
        .unwrap();
    let layout = Stub::new("layout", Provenance::Layout, |n| if n == 3 { Act::Fault } else { Act::Text });
    let conv = converter(config, vec![(StageKind::Layout, layout as Arc<dyn StageBackend>)]);

    let doc = conv.start_pages("faulty.pdf", spawn_feed(rendered(5))).document().await.unwrap();
    assert_eq!(indices(&doc), vec![1, 2, 3, 4, 5]);

    let faulted: Vec<usize> = doc.faulted_pages().map(|p| p.index).collect();
    assert_eq!(faulted, vec![3]);
    let page = doc.page(3).unwrap();
    assert!(matches!(
        page.faults[0],
        PageFault::Stage { page: 3, stage: StageKind::Layout, .. }
    ));
    assert!(page.markdown.contains("<!-- fault:"), "got: {}", page.markdown);
    assert!(doc.page(4).unwrap().markdown.contains("layout 4"));
}

async fn layout_fault_then_ocr(policy: FaultPolicy) -> (Document, Arc<Stub>) {
    let config = base()
        .ocr_policy(OcrPolicy::Force)
        .enable(StageKind::TableStructure, false)
        .fault_policy(policy)
        .build()
        .unwrap();
    let layout = Stub::new("layout", Provenance::Layout, |n| if n == 2 { Act::Fault } else { Act::Text });
    let ocr = Stub::text("ocr", Provenance::Ocr);
    let conv = converter(
        config,
        vec![
            (StageKind::Layout, layout as Arc<dyn StageBackend>),
            (StageKind::Ocr, ocr.clone() as Arc<dyn StageBackend>),
        ],
    );
    let doc = conv.start_pages("policy.pdf", spawn_feed(rendered(4))).document().await.unwrap();
    (doc, ocr)
}

#[tokio::test]
async fn propagated_fault_skips_later_stages() {
    let (doc, ocr) = layout_fault_then_ocr(FaultPolicy::PropagateFault).await;
    assert!(!ocr.saw(2));
    assert!(ocr.saw(1) && ocr.saw(3) && ocr.saw(4));

    let page = doc.page(2).unwrap();
    assert!(page.regions.is_empty());
    assert_eq!(page.faults.len(), 1);
    assert!(doc.page(3).unwrap().markdown.contains("ocr 3"));
}

#[tokio::test]
async fn best_effort_fault_still_reaches_ocr() {
    let (doc, ocr) = layout_fault_then_ocr(FaultPolicy::BestEffort).await;
    assert!(ocr.saw(2));

    let page = doc.page(2).unwrap();
    assert_eq!(page.regions.len(), 1);
    assert_eq!(page.regions[0].text.as_deref(), Some("ocr 2"));
    assert_eq!(page.regions[0].source, Provenance::Ocr);
    assert!(matches!(
        page.faults.as_slice(),
        [PageFault::Stage { stage: StageKind::Layout, .. }]
    ));
    assert!(page.markdown.starts_with("ocr 2\n\n<!-- fault:"), "got: {}", page.markdown);
}

#[tokio::test]
async fn empty_feed_is_unreadable() {
    let conv = converter(
        base().build().unwrap(),
        vec![(StageKind::Layout, Stub::text("layout", Provenance::Layout) as Arc<dyn StageBackend>)],
    );
    let (tx, feed) = PageFeed::channel(0, Vec::new(), 1);
    drop(tx);
    let err = conv.start_pages("empty.pdf", feed).document().await.unwrap_err();
    assert!(matches!(err, ConvertError::DocumentUnreadable { .. }), "got {err:?}");
}

#[tokio::test]
async fn all_decode_failures_are_unreadable() {
    let conv = converter(
        base().build().unwrap(),
        vec![(StageKind::Layout, Stub::text("layout", Provenance::Layout) as Arc<dyn StageBackend>)],
    );
    let pages = (1..=3)
        .map(|page| {
            Err(PageFault::Decode {
                page,
                detail: "corrupt content stream".into(),
            })
        })
        .collect();
    let err = conv.start_pages("broken.pdf", spawn_feed(pages)).document().await.unwrap_err();
    assert!(matches!(err, ConvertError::DocumentUnreadable { .. }), "got {err:?}");
}

#[tokio::test]
async fn unrendered_single_page_fails_json_image_export() {
    let config = base()
        .enable(StageKind::Ocr, false)
        .enable(StageKind::TableStructure, false)
        .generate_page_images(true)
        .build()
        .unwrap();
    let layout = Stub::text("layout", Provenance::Layout);
    let conv = converter(config, vec![(StageKind::Layout, layout.clone() as Arc<dyn StageBackend>)]);
    let mut page = raster(1);
    page.image = None;
    page.faults.push(PageFault::Render {
        page: 1,
        detail: "bitmap allocation failed".into(),
    });

    let doc = conv.start_pages("one.pdf", spawn_feed(vec![Ok(page)])).document().await.unwrap();
    assert!(layout.saw(1));
    let page = doc.page(1).unwrap();
    assert!(!page.decode_failed());
    assert!(page.markdown.contains("layout 1"), "got: {}", page.markdown);

    let err = AggregateResponse::build(&doc, 10, true).unwrap_err();
    assert!(matches!(err, ConvertError::ImageUnavailable { page: 1, .. }), "got {err:?}");
    assert_eq!(
        err.to_string(),
        "Image generation failed for page 1: page failed to rasterize"
    );
}

#[tokio::test]
async fn undecodable_page_fails_image_export() {
    let config = base()
        .enable(StageKind::Ocr, false)
        .enable(StageKind::TableStructure, false)
        .generate_page_images(true)
        .build()
        .unwrap();
    let conv = converter(
        config,
        vec![(StageKind::Layout, Stub::text("layout", Provenance::Layout) as Arc<dyn StageBackend>)],
    );
    let pages = vec![
        Ok(raster(1)),
        Err(PageFault::Decode {
            page: 2,
            detail: "bad xref".into(),
        }),
    ];

    let doc = conv.start_pages("half.pdf", spawn_feed(pages)).document().await.unwrap();
    assert!(doc.page(2).unwrap().decode_failed());

    let err = AggregateResponse::build(&doc, 10, true).unwrap_err();
    assert!(matches!(err, ConvertError::ImageUnavailable { page: 2, .. }), "got {err:?}");
    // Without images the same document still exports.
    assert_eq!(AggregateResponse::build(&doc, 10, false).unwrap().pages.len(), 2);
}

// ── Archive ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn archive_has_two_entries_per_page() {
    let config = PipelineConfig::archive()
        .layout(StageSettings::new(2, 1))
        .batch_wait_ms(5)
        .build()
        .unwrap();
    let conv = converter(
        config,
        vec![(StageKind::Layout, Stub::text("layout", Provenance::Layout) as Arc<dyn StageBackend>)],
    );

    let doc = conv.start_pages("three.pdf", spawn_feed(rendered(3))).document().await.unwrap();
    let bytes = build_archive(&doc).unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    assert_eq!(archive.len(), 6);
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, ["1.jpeg", "1.md", "2.jpeg", "2.md", "3.jpeg", "3.md"]);
}

// ── Accelerators ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn shared_device_runs_one_batch_at_a_time() {
    let pool = Arc::new(AcceleratorPool::new());
    let gauge = Arc::new(Gauge::default());
    let conv = || {
        let config = base()
            .ocr_policy(OcrPolicy::Force)
            .enable(StageKind::TableStructure, false)
            .accelerator(Accelerator::Device("gpu".into()))
            .build()
            .unwrap();
        converter_on(
            Arc::clone(&pool),
            config,
            vec![
                (StageKind::Layout, gauge.clone() as Arc<dyn StageBackend>),
                (StageKind::Ocr, gauge.clone() as Arc<dyn StageBackend>),
            ],
        )
    };
    let (a, b) = (conv(), conv());

    let first = a.start_pages("a.pdf", spawn_feed(rendered(8)));
    let second = b.start_pages("b.pdf", spawn_feed(rendered(8)));
    let (left, right) = tokio::join!(first.document(), second.document());
    assert_eq!(left.unwrap().pages.len(), 8);
    assert_eq!(right.unwrap().pages.len(), 8);

    assert!(gauge.batches.load(Ordering::SeqCst) >= 4);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    assert_eq!(pool.len(), 1);
}

// ── Fatal stage errors ───────────────────────────────────────────────────────

#[tokio::test]
async fn failing_backend_is_stage_unavailable() {
    let config = base().enable(StageKind::Ocr, false).build().unwrap();
    let layout = Stub::new("layout", Provenance::Layout, |_| Act::Table);
    let conv = converter(
        config,
        vec![
            (StageKind::Layout, layout as Arc<dyn StageBackend>),
            (StageKind::TableStructure, Arc::new(Broken) as Arc<dyn StageBackend>),
        ],
    );

    let err = conv.start_pages("down.pdf", spawn_feed(rendered(4))).document().await.unwrap_err();
    match err {
        ConvertError::StageUnavailable { stage, detail } => {
            assert_eq!(stage, StageKind::TableStructure);
            assert!(detail.contains("model weights missing"));
        }
        other => panic!("expected StageUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_batch_times_out() {
    let config = base()
        .enable(StageKind::Ocr, false)
        .enable(StageKind::TableStructure, false)
        .stage_timeout_secs(1)
        .build()
        .unwrap();
    let conv = converter(config, vec![(StageKind::Layout, Arc::new(Sleepy) as Arc<dyn StageBackend>)]);

    let started = std::time::Instant::now();
    let err = conv.start_pages("slow.pdf", spawn_feed(rendered(2))).document().await.unwrap_err();
    assert!(
        matches!(err, ConvertError::StageTimeout { stage: StageKind::Layout, secs: 1, .. }),
        "got {err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(10));
}

// ── Backpressure & cancellation ──────────────────────────────────────────────

#[tokio::test]
async fn stalled_stage_bounds_pages_in_flight() {
    const PAGES: usize = 50;
    const FEED: usize = 1;
    let config = base()
        .layout(StageSettings::new(2, 1))
        .queue_depth(2)
        .enable(StageKind::Ocr, false)
        .enable(StageKind::TableStructure, false)
        .build()
        .unwrap();
    let bound = config.queue_capacity(StageKind::Layout) + 2 * config.layout.batch_size + FEED + 1;
    let layout = Stub::new("layout", Provenance::Layout, |_| Act::Stall);
    let conv = converter(config, vec![(StageKind::Layout, layout.clone() as Arc<dyn StageBackend>)]);

    let sent = Arc::new(AtomicUsize::new(0));
    let (tx, feed) = PageFeed::channel(PAGES, (1..=PAGES).collect(), FEED);
    let producer = {
        let sent = Arc::clone(&sent);
        tokio::spawn(async move {
            for i in 1..=PAGES {
                if tx.send(Ok(raster(i))).await.is_err() {
                    return;
                }
                sent.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let conversion = conv.start_pages("stalled.pdf", feed);
    wait_until(|| layout.calls.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let produced = sent.load(Ordering::SeqCst);
    assert!(produced <= bound, "{produced} pages produced, bound {bound}");
    assert!(produced < PAGES);

    conversion.cancel();
    let err = conversion.document().await.unwrap_err();
    assert!(matches!(err, ConvertError::Cancelled), "got {err:?}");
    tokio::time::timeout(Duration::from_secs(5), producer).await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_mid_document_returns_cancelled() {
    let config = base()
        .layout(StageSettings::new(1, 4))
        .enable(StageKind::Ocr, false)
        .enable(StageKind::TableStructure, false)
        .build()
        .unwrap();
    let layout = Stub::new("layout", Provenance::Layout, |n| if n <= 4 { Act::Text } else { Act::Stall });
    let conv = converter(config, vec![(StageKind::Layout, layout as Arc<dyn StageBackend>)]);

    let conversion = conv.start_pages("long.pdf", spawn_feed(rendered(10)));
    wait_until(|| conversion.completed_pages() >= 4).await;
    assert_eq!(conversion.page(2).await.unwrap().index, 2);

    conversion.cancel();
    assert!(matches!(conversion.document().await, Err(ConvertError::Cancelled)));
    assert!(matches!(conversion.page(1).await, Err(ConvertError::Cancelled)));
    assert_eq!(conversion.completed_pages(), 0);
}

#[tokio::test]
async fn page_outside_selection_is_rejected() {
    let conv = converter(
        base().build().unwrap(),
        vec![(StageKind::Layout, Stub::text("layout", Provenance::Layout) as Arc<dyn StageBackend>)],
    );
    let conversion = conv.start_pages("two.pdf", spawn_feed(rendered(2)));
    let err = conversion.page(7).await.unwrap_err();
    assert!(matches!(err, ConvertError::PageOutOfRange { page: 7, total: 2 }));
    assert_eq!(conversion.document().await.unwrap().pages.len(), 2);
}
