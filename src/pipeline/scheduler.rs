//! Stage scheduler: routes pages through the enabled stages in batches.
//!
//! ## Topology
//!
//! ```text
//!            ┌──────── bounded queue ───────┐
//! PageFeed ─▶ ingest ─▶ [layout] ─▶ [ocr] ─▶ [table_structure] ─▶ assembler
//!                 └──────────┴─────────┴──────────────┴──────────────▲
//!                      (a page skips any stage that does not apply)
//! ```
//!
//! Every enabled stage owns one bounded `mpsc` queue with capacity
//! `queue_depth × batch_size`. A full queue suspends whoever is sending into
//! it, all the way back to the render thread; that is the only backpressure.
//!
//! A stage worker fills a batch greedily up to `batch_size`, waiting at most
//! `batch_wait` after the first item, then takes a permit from its capacity
//! (the stage's CPU pool or the shared accelerator context) and dispatches
//! the batch on its own task. Results flow to the next applicable stage or to
//! the assembler.
//!
//! ## Shutdown
//!
//! Channels close in cascade: the ingest task drops its senders once the feed
//! is exhausted, each worker drains its queue, waits for its in-flight
//! batches and drops its own senders. Cancellation and fatal errors flip one
//! `watch` flag that every await point selects on; dropped receivers release
//! their queued pages.

use crate::config::{Accelerator, FaultPolicy, OcrPolicy, PipelineConfig};
use crate::error::{ConvertError, PageFault, StageError};
use crate::export::markdown::page_markdown;
use crate::model::{Document, DocumentMetadata, Page, Region, RegionKind, TextCell};
use crate::pipeline::accelerator::AcceleratorPool;
use crate::pipeline::assembler::PageAssembler;
use crate::pipeline::rasterize::{PageFeed, RasterPage};
use crate::pipeline::stage::{StageBackend, StageItem, StageKind};
use image::DynamicImage;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

// ── Backends ─────────────────────────────────────────────────────────────

/// The backend for each stage. Only enabled stages need one.
#[derive(Clone, Default)]
pub struct StageBackends {
    slots: [Option<Arc<dyn StageBackend>>; 3],
}

impl StageBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: StageKind, backend: Arc<dyn StageBackend>) -> Self {
        self.slots[kind.ordinal()] = Some(backend);
        self
    }

    pub fn get(&self, kind: StageKind) -> Option<&Arc<dyn StageBackend>> {
        self.slots[kind.ordinal()].as_ref()
    }
}

impl fmt::Debug for StageBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<(StageKind, &str)> = StageKind::ALL
            .iter()
            .filter_map(|&k| self.get(k).map(|b| (k, b.name())))
            .collect();
        f.debug_struct("StageBackends").field("backends", &names).finish()
    }
}

// ── Pages in flight ──────────────────────────────────────────────────────

/// A page travelling between stages.
struct InFlight {
    page: usize,
    width: f32,
    height: f32,
    image: Option<Arc<DynamicImage>>,
    text_cells: Arc<[TextCell]>,
    regions: Vec<Region>,
    faults: Vec<PageFault>,
}

impl From<RasterPage> for InFlight {
    fn from(raster: RasterPage) -> Self {
        Self {
            page: raster.index,
            width: raster.width,
            height: raster.height,
            image: raster.image,
            text_cells: raster.text_cells.into(),
            regions: Vec::new(),
            faults: raster.faults,
        }
    }
}

impl InFlight {
    fn item(&self) -> StageItem {
        StageItem {
            page: self.page,
            width: self.width,
            height: self.height,
            image: self.image.clone(),
            text_cells: Arc::clone(&self.text_cells),
            regions: self.regions.clone(),
        }
    }
}

/// Whether `kind` has work to do on this page.
fn applies(kind: StageKind, flight: &InFlight, config: &PipelineConfig) -> bool {
    match kind {
        StageKind::Layout => true,
        StageKind::Ocr => match config.ocr_policy {
            OcrPolicy::Force => true,
            OcrPolicy::Auto => !flight.regions.iter().any(Region::has_text),
        },
        StageKind::TableStructure => flight.regions.iter().any(|r| r.kind == RegionKind::Table),
    }
}

// ── Shared run state ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running { assembled: usize },
    Finished,
    Failed,
    Cancelled,
}

impl RunState {
    fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running { .. })
    }
}

struct Shared {
    config: Arc<PipelineConfig>,
    selected: usize,
    /// `None` once discarded or taken.
    assembler: Mutex<Option<PageAssembler>>,
    state: watch::Sender<RunState>,
    cancel: watch::Sender<bool>,
    fatal: Mutex<Option<ConvertError>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once the conversion is cancelled or has failed.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}

impl Shared {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Record a fatal error (the first one wins) and stop every task.
    fn fail(&self, err: ConvertError) {
        {
            let mut fatal = lock(&self.fatal);
            if fatal.is_none() {
                error!("Conversion aborted: {}", err);
                *fatal = Some(err);
            }
        }
        self.cancel.send_replace(true);
    }

    fn fatal_error(&self) -> ConvertError {
        match lock(&self.fatal).as_ref() {
            Some(e) => clone_fatal(e),
            None => ConvertError::Internal("conversion failed without an error".into()),
        }
    }

    fn deliver(&self, flight: InFlight) {
        let image = flight.image.filter(|_| self.config.generate_page_images);
        self.store(Page {
            index: flight.page,
            width: flight.width,
            height: flight.height,
            image,
            regions: flight.regions,
            markdown: String::new(),
            faults: flight.faults,
        });
    }

    fn deliver_fault(&self, fault: PageFault) {
        self.store(Page::faulted(fault.page(), fault));
    }

    fn store(&self, mut page: Page) {
        page.markdown = page_markdown(&page);
        let index = page.index;
        let markdown_len = page.markdown.len();
        let first_fault = page.faults.first().map(ToString::to_string);

        let inserted = match lock(&self.assembler).as_mut() {
            Some(assembler) => assembler.insert(page),
            None => return,
        };
        if let Err(e) = inserted {
            self.fail(e);
            return;
        }
        self.state.send_modify(|s| {
            if let RunState::Running { assembled } = s {
                *assembled += 1;
            }
        });

        if let Some(cb) = &self.config.progress_callback {
            match &first_fault {
                None => cb.on_page_complete(index, self.selected, markdown_len),
                Some(fault) => cb.on_page_error(index, self.selected, fault),
            }
        }
    }
}

/// Copy a fatal error for a second reader. Only variants the scheduler
/// raises are reproduced exactly.
fn clone_fatal(e: &ConvertError) -> ConvertError {
    match e {
        ConvertError::StageUnavailable { stage, detail } => ConvertError::StageUnavailable {
            stage: *stage,
            detail: detail.clone(),
        },
        ConvertError::StageTimeout { stage, pages, secs } => ConvertError::StageTimeout {
            stage: *stage,
            pages: pages.clone(),
            secs: *secs,
        },
        ConvertError::DocumentUnreadable { name, reason } => ConvertError::DocumentUnreadable {
            name: name.clone(),
            reason: reason.clone(),
        },
        ConvertError::Cancelled => ConvertError::Cancelled,
        other => ConvertError::Internal(other.to_string()),
    }
}

// ── Routing ──────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Router {
    shared: Arc<Shared>,
    queues: [Option<mpsc::Sender<InFlight>>; 3],
}

impl Router {
    /// A router that can only reach stages after `kind`.
    fn downstream_of(&self, kind: StageKind) -> Router {
        let mut queues = self.queues.clone();
        for slot in queues.iter_mut().take(kind.ordinal() + 1) {
            *slot = None;
        }
        Router {
            shared: Arc::clone(&self.shared),
            queues,
        }
    }

    fn next_stage(&self, flight: &InFlight, after: Option<StageKind>) -> Option<StageKind> {
        let config = &self.shared.config;
        let stage_faulted = flight.faults.iter().any(PageFault::is_stage_fault);
        if stage_faulted && config.fault_policy == FaultPolicy::PropagateFault {
            return None;
        }
        let first = after.map_or(0, |k| k.ordinal() + 1);
        StageKind::ALL[first..]
            .iter()
            .copied()
            .find(|&k| self.queues[k.ordinal()].is_some() && applies(k, flight, config))
    }

    /// Send the page to its next stage or to the assembler.
    /// Returns `false` when the conversion stopped underneath us.
    async fn route(&self, flight: InFlight, after: Option<StageKind>) -> bool {
        let Some(kind) = self.next_stage(&flight, after) else {
            self.shared.deliver(flight);
            return true;
        };
        let Some(tx) = self.queues[kind.ordinal()].as_ref() else {
            return false;
        };
        let mut cancel = self.shared.cancel.subscribe();
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => false,
            sent = tx.send(flight) => sent.is_ok(),
        }
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────

async fn ingest(mut feed: PageFeed, router: Router) {
    let shared = Arc::clone(&router.shared);
    let mut cancel = shared.cancel.subscribe();
    let mut pending: BTreeSet<usize> = feed.expected.iter().copied().collect();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return,
            item = feed.recv() => item,
        };
        let Some(item) = next else { break };
        match item {
            Ok(raster) => {
                if !pending.remove(&raster.index) {
                    warn!("Ignoring unexpected page {} from rasterizer", raster.index);
                    continue;
                }
                if !router.route(InFlight::from(raster), None).await {
                    return;
                }
            }
            Err(fault) => {
                if pending.remove(&fault.page()) {
                    shared.deliver_fault(fault);
                }
            }
        }
    }

    // Pages the rasterizer never produced still need a slot.
    for page in pending {
        shared.deliver_fault(PageFault::Decode {
            page,
            detail: "page was never rendered".into(),
        });
    }
}

/// Fill a batch: block for the first item, then take more until `max` or
/// until `wait` has passed. Empty means the queue is closed and drained.
async fn collect_batch<T>(rx: &mut mpsc::Receiver<T>, max: usize, wait: Duration) -> Vec<T> {
    let Some(first) = rx.recv().await else {
        return Vec::new();
    };
    let mut batch = Vec::with_capacity(max);
    batch.push(first);
    if max <= 1 {
        return batch;
    }

    let deadline = tokio::time::Instant::now() + wait;
    while batch.len() < max {
        match rx.try_recv() {
            Ok(item) => {
                batch.push(item);
                continue;
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(item)) => batch.push(item),
            Ok(None) | Err(_) => break,
        }
    }
    batch
}

fn report_join(kind: StageKind, joined: Result<(), JoinError>, shared: &Shared) {
    if let Err(e) = joined {
        if e.is_panic() {
            shared.fail(ConvertError::Internal(format!(
                "{kind} batch dispatch panicked"
            )));
        }
    }
}

async fn run_stage(
    kind: StageKind,
    backend: Arc<dyn StageBackend>,
    mut rx: mpsc::Receiver<InFlight>,
    router: Router,
    capacity: Arc<Semaphore>,
) {
    let shared = Arc::clone(&router.shared);
    let settings = *shared.config.stage(kind);
    let wait = shared.config.batch_wait();
    let mut cancel = shared.cancel.subscribe();
    let mut inflight = JoinSet::new();

    debug!(
        "{} stage started: backend={}, batch_size={}",
        kind,
        backend.name(),
        settings.batch_size
    );

    loop {
        let batch = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            batch = collect_batch(&mut rx, settings.batch_size, wait) => batch,
        };
        if batch.is_empty() {
            break;
        }

        let permit = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            permit = Arc::clone(&capacity).acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            shared.fail(ConvertError::Internal(format!("{kind} capacity closed")));
            break;
        };

        inflight.spawn(dispatch(
            kind,
            Arc::clone(&backend),
            batch,
            router.clone(),
            permit,
        ));
        while let Some(joined) = inflight.try_join_next() {
            report_join(kind, joined, &shared);
        }
    }

    if shared.is_cancelled() {
        inflight.shutdown().await;
    } else {
        while let Some(joined) = inflight.join_next().await {
            report_join(kind, joined, &shared);
        }
    }
    debug!("{} stage stopped", kind);
}

async fn dispatch(
    kind: StageKind,
    backend: Arc<dyn StageBackend>,
    batch: Vec<InFlight>,
    router: Router,
    permit: OwnedSemaphorePermit,
) {
    let shared = Arc::clone(&router.shared);
    let pages: Vec<usize> = batch.iter().map(|f| f.page).collect();
    let items: Vec<StageItem> = batch.iter().map(InFlight::item).collect();
    let timeout = shared.config.stage_timeout();
    let started = Instant::now();
    debug!("{} stage: dispatching pages {:?} to {}", kind, pages, backend.name());

    let mut cancel = shared.cancel.subscribe();
    let outcome = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => return,
        outcome = tokio::time::timeout(timeout, backend.process_batch(items)) => outcome,
    };
    drop(permit);
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let results = match outcome {
        Err(_) => {
            shared.fail(ConvertError::StageTimeout {
                stage: kind,
                pages,
                secs: timeout.as_secs(),
            });
            return;
        }
        Ok(Err(e)) => {
            shared.fail(ConvertError::StageUnavailable {
                stage: kind,
                detail: e.to_string(),
            });
            return;
        }
        Ok(Ok(results)) => results,
    };
    if results.len() != batch.len() {
        let mismatch = StageError::BatchMismatch {
            expected: batch.len(),
            got: results.len(),
        };
        shared.fail(ConvertError::StageUnavailable {
            stage: kind,
            detail: mismatch.to_string(),
        });
        return;
    }

    debug!("{} stage: pages {:?} done in {}ms", kind, pages, elapsed_ms);
    if let Some(cb) = &shared.config.progress_callback {
        cb.on_batch_complete(kind, batch.len(), elapsed_ms);
    }

    for (mut flight, result) in batch.into_iter().zip(results) {
        match result {
            Ok(regions) => flight.regions = regions,
            Err(detail) => {
                warn!("Page {}: {} stage fault: {}", flight.page, kind, detail);
                flight.faults.push(PageFault::Stage {
                    page: flight.page,
                    stage: kind,
                    detail,
                });
            }
        }
        if !router.route(flight, Some(kind)).await {
            return;
        }
    }
}

async fn supervise(shared: Arc<Shared>, tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            if e.is_panic() {
                shared.fail(ConvertError::Internal("pipeline task panicked".into()));
            }
        }
    }

    let failed = lock(&shared.fatal).is_some();
    let outcome = if failed {
        RunState::Failed
    } else if shared.is_cancelled() {
        RunState::Cancelled
    } else {
        RunState::Finished
    };

    if outcome == RunState::Finished {
        let succeeded = lock(&shared.assembler)
            .as_ref()
            .map(|a| a.ready().filter(|p| !p.is_faulted()).count())
            .unwrap_or(0);
        info!(
            "Pipeline finished: {}/{} pages without faults",
            succeeded, shared.selected
        );
        if let Some(cb) = &shared.config.progress_callback {
            cb.on_conversion_complete(shared.selected, succeeded);
        }
    } else {
        // Partial state is never handed out.
        lock(&shared.assembler).take();
        info!("Pipeline stopped ({:?}); partial pages discarded", outcome);
    }
    shared.state.send_replace(outcome);
}

// ── Scheduler ────────────────────────────────────────────────────────────

/// Runs page feeds through the configured stages.
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: Arc<PipelineConfig>,
    backends: StageBackends,
    accelerators: Arc<AcceleratorPool>,
}

impl Scheduler {
    /// Every enabled stage must have a backend.
    pub fn new(
        config: Arc<PipelineConfig>,
        backends: StageBackends,
        accelerators: Arc<AcceleratorPool>,
    ) -> Result<Self, ConvertError> {
        for kind in StageKind::ALL {
            if config.stage(kind).enabled && backends.get(kind).is_none() {
                return Err(ConvertError::InvalidConfig(format!(
                    "{kind} stage is enabled but has no backend"
                )));
            }
        }
        Ok(Self {
            config,
            backends,
            accelerators,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn capacity(&self, kind: StageKind) -> Arc<Semaphore> {
        match &self.config.accelerator {
            Accelerator::Cpu => Arc::new(Semaphore::new(self.config.stage(kind).workers)),
            Accelerator::Device(name) => self.accelerators.context(name),
        }
    }

    /// Start converting `feed`. Must be called inside a Tokio runtime.
    pub fn run(&self, name: impl Into<String>, feed: PageFeed) -> Conversion {
        let name = name.into();
        let expected: Arc<[usize]> = feed.expected.clone().into();
        let total_pages = feed.total_pages;
        let metadata = feed.metadata.clone();

        let (cancel, _) = watch::channel(false);
        let (state, _) = watch::channel(RunState::Running { assembled: 0 });
        let shared = Arc::new(Shared {
            config: Arc::clone(&self.config),
            selected: expected.len(),
            assembler: Mutex::new(Some(PageAssembler::new(expected.to_vec()))),
            state,
            cancel,
            fatal: Mutex::new(None),
        });

        info!(
            "Converting '{}': {} of {} pages selected",
            name,
            expected.len(),
            total_pages
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_conversion_start(expected.len());
        }

        let mut queues: [Option<mpsc::Sender<InFlight>>; 3] = Default::default();
        let mut workers = Vec::new();
        for kind in StageKind::ALL {
            if !self.config.stage(kind).enabled {
                continue;
            }
            let Some(backend) = self.backends.get(kind) else {
                continue;
            };
            let (tx, rx) = mpsc::channel(self.config.queue_capacity(kind));
            queues[kind.ordinal()] = Some(tx);
            workers.push((kind, Arc::clone(backend), rx));
        }

        let root = Router {
            shared: Arc::clone(&shared),
            queues,
        };
        let mut tasks = Vec::with_capacity(workers.len() + 1);
        for (kind, backend, rx) in workers {
            let router = root.downstream_of(kind);
            tasks.push(tokio::spawn(run_stage(
                kind,
                backend,
                rx,
                router,
                self.capacity(kind),
            )));
        }
        tasks.push(tokio::spawn(ingest(feed, root)));
        tokio::spawn(supervise(Arc::clone(&shared), tasks));

        Conversion {
            shared,
            name,
            total_pages,
            expected,
            metadata,
        }
    }
}

// ── Conversion handle ────────────────────────────────────────────────────

/// A running conversion.
///
/// Query single pages as they finish, cancel, or wait for the document.
pub struct Conversion {
    shared: Arc<Shared>,
    name: String,
    total_pages: usize,
    expected: Arc<[usize]>,
    metadata: Option<DocumentMetadata>,
}

impl fmt::Debug for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversion")
            .field("name", &self.name)
            .field("total_pages", &self.total_pages)
            .field("selected", &self.expected.len())
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}

impl Conversion {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Page count of the source document.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Selected page numbers, ascending.
    pub fn selected_pages(&self) -> &[usize] {
        &self.expected
    }

    pub fn metadata(&self) -> Option<&DocumentMetadata> {
        self.metadata.as_ref()
    }

    /// Pages that have reached the assembler so far.
    pub fn completed_pages(&self) -> usize {
        match *self.shared.state.borrow() {
            RunState::Running { assembled } => assembled,
            RunState::Finished => self.expected.len(),
            RunState::Failed | RunState::Cancelled => 0,
        }
    }

    /// Abandon the conversion. Queued and in-flight pages are dropped and
    /// [`Conversion::document`] returns [`ConvertError::Cancelled`].
    pub fn cancel(&self) {
        if !self.shared.is_cancelled() {
            info!("Cancelling conversion of '{}'", self.name);
        }
        self.shared.cancel.send_replace(true);
    }

    /// One page, as soon as it is assembled.
    pub async fn page(&self, index: usize) -> Result<Page, ConvertError> {
        if self.expected.binary_search(&index).is_err() {
            return Err(ConvertError::PageOutOfRange {
                page: index,
                total: self.expected.len(),
            });
        }
        let mut state_rx = self.shared.state.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                RunState::Cancelled => return Err(ConvertError::Cancelled),
                RunState::Failed => return Err(self.shared.fatal_error()),
                _ => {}
            }
            let found = lock(&self.shared.assembler)
                .as_ref()
                .and_then(|a| a.get(index).cloned());
            if let Some(page) = found {
                return Ok(page);
            }
            if state == RunState::Finished {
                return Err(ConvertError::Internal(format!(
                    "page {index} is no longer available"
                )));
            }
            if state_rx.changed().await.is_err() {
                return Err(ConvertError::Internal("pipeline state dropped".into()));
            }
        }
    }

    /// Wait for every selected page and assemble the document. The document
    /// can be taken once.
    pub async fn document(&self) -> Result<Document, ConvertError> {
        let mut state_rx = self.shared.state.subscribe();
        let state = *state_rx
            .wait_for(RunState::is_terminal)
            .await
            .map_err(|_| ConvertError::Internal("pipeline state dropped".into()))?;

        match state {
            RunState::Finished => {
                let assembler = lock(&self.shared.assembler).take().ok_or_else(|| {
                    ConvertError::Internal("document was already taken".into())
                })?;
                assembler.into_document(&self.name, self.total_pages, self.metadata.clone())
            }
            RunState::Failed => Err(self.shared.fatal_error()),
            RunState::Cancelled | RunState::Running { .. } => Err(ConvertError::Cancelled),
        }
    }
}
