use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, instrument, warn};

/// 1-based page identifier; valid values are `1..=page_count`.
pub type PageIndex = usize;

pub const THUMBNAIL_SCALE: f32 = 0.4;
pub const WIDTH_MARGIN: f32 = 0.95;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub thumbnail_scale: f32,
    pub width_margin: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thumbnail_scale: THUMBNAIL_SCALE,
            width_margin: WIDTH_MARGIN,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum PickError {
    #[error("document bytes could not be parsed")]
    DocumentCorrupt {
        #[source]
        source: anyhow::Error,
    },
    #[error("page {page} outside 1..={page_count}")]
    PageOutOfRange { page: PageIndex, page_count: usize },
    #[error("failed to render page {page}")]
    PageRender {
        page: PageIndex,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to extract text from page {page}")]
    SearchExtraction {
        page: PageIndex,
        #[source]
        source: anyhow::Error,
    },
    #[error("dialog is not in the ready state")]
    NotReady,
}

pub trait DocumentBackend: Send + Sync {
    fn page_count(&self) -> usize;
    /// Native page dimensions in points at scale 1.0.
    fn page_size(&self, page: PageIndex) -> Result<(f32, f32)>;
    fn render_page(&self, page: PageIndex, scale: f32) -> Result<RasterBuffer>;
    fn page_text(&self, page: PageIndex) -> Result<String>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, bytes: Vec<u8>) -> Result<Arc<dyn DocumentBackend>>;
}

/// Identifies one active-page render request. A completion is applied only
/// while its token still equals the engine's current target, so completions
/// arriving after a newer request are discarded instead of overwriting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderToken {
    pub generation: u64,
    pub page: PageIndex,
    pub scale_milli: u32,
}

pub struct ActiveRenderJob {
    pub token: RenderToken,
    pub handle: JoinHandle<Result<RasterBuffer>>,
}

impl ActiveRenderJob {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn finish(self) -> (RenderToken, Result<RasterBuffer>) {
        let result = match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("render task failed: {err}")),
        };
        (self.token, result)
    }
}

fn quantize_scale(scale: f32) -> u32 {
    let scaled = (scale * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    NextPage,
    PrevPage,
    GotoPage { page: PageIndex },
    ToggleSelection { page: PageIndex },
    ClearSelection,
    Resize { width: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DialogOutcome {
    Confirmed(Vec<PageIndex>),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    Loading,
    Ready,
    Closed(DialogOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ThumbnailsReady,
    ActivePageChanged { page: PageIndex },
    ActiveRenderNeeded,
    FilterChanged,
    SelectionChanged,
    ScrollThumbnailIntoView { page: PageIndex },
    Closed(DialogOutcome),
}

pub struct PickerEngine {
    config: EngineConfig,
    backend: Option<Arc<dyn DocumentBackend>>,
    page_count: usize,
    active_page: PageIndex,
    viewport_width: f32,
    thumbnails: HashMap<PageIndex, RasterBuffer>,
    thumbnails_ready: bool,
    active_buffer: Option<RasterBuffer>,
    next_generation: u64,
    current_target: Option<RenderToken>,
    filter: Option<Vec<PageIndex>>,
    selection: BTreeSet<PageIndex>,
    state: EngineState,
    disposed: bool,
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl PickerEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            backend: None,
            page_count: 0,
            active_page: 1,
            viewport_width: 0.0,
            thumbnails: HashMap::new(),
            thumbnails_ready: false,
            active_buffer: None,
            next_generation: 0,
            current_target: None,
            filter: None,
            selection: BTreeSet::new(),
            state: EngineState::Loading,
            disposed: false,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<EngineEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push_event(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, EngineState::Ready)
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn active_page(&self) -> PageIndex {
        self.active_page
    }

    pub fn viewport_width(&self) -> f32 {
        self.viewport_width
    }

    pub fn thumbnails_ready(&self) -> bool {
        self.thumbnails_ready
    }

    pub fn thumbnail(&self, page: PageIndex) -> Option<&RasterBuffer> {
        self.thumbnails.get(&page)
    }

    pub fn active_buffer(&self) -> Option<&RasterBuffer> {
        self.active_buffer.as_ref()
    }

    pub fn filter(&self) -> Option<&[PageIndex]> {
        self.filter.as_deref()
    }

    pub fn is_page_visible(&self, page: PageIndex) -> bool {
        match &self.filter {
            Some(pages) => pages.contains(&page),
            None => true,
        }
    }

    /// Pages currently shown in the navigation rail, ascending. Filtered-out
    /// pages are hidden, not removed; their thumbnails stay allocated.
    pub fn visible_pages(&self) -> Vec<PageIndex> {
        match &self.filter {
            Some(pages) => pages.clone(),
            None => (1..=self.page_count).collect(),
        }
    }

    pub fn is_selected(&self, page: PageIndex) -> bool {
        self.selection.contains(&page)
    }

    pub fn selection_len(&self) -> usize {
        self.selection.len()
    }

    pub fn ordered_selection(&self) -> Vec<PageIndex> {
        self.selection.iter().copied().collect()
    }

    /// Opens the document and rasterizes every page at the thumbnail scale,
    /// all pages concurrently. The engine enters `Ready` only after every
    /// task has settled; a page whose render fails is logged and left without
    /// a thumbnail, siblings are unaffected. Open failure closes the dialog.
    #[instrument(skip(self, provider, bytes))]
    pub async fn load<P: DocumentProvider>(
        &mut self,
        provider: &P,
        bytes: Vec<u8>,
    ) -> Result<(), PickError> {
        if !matches!(self.state, EngineState::Loading) {
            return Err(PickError::NotReady);
        }

        let backend = match provider.open(bytes).await {
            Ok(backend) => backend,
            Err(source) => {
                self.close(DialogOutcome::Cancelled);
                return Err(PickError::DocumentCorrupt { source });
            }
        };

        let page_count = backend.page_count();
        if page_count == 0 {
            self.close(DialogOutcome::Cancelled);
            return Err(PickError::DocumentCorrupt {
                source: anyhow!("document reports zero pages"),
            });
        }

        let thumbnail_scale = self.config.thumbnail_scale;
        let mut tasks = JoinSet::new();
        for page in 1..=page_count {
            let backend = Arc::clone(&backend);
            tasks.spawn_blocking(move || (page, backend.render_page(page, thumbnail_scale)));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((page, Ok(buffer))) => {
                    if self.disposed {
                        debug!(page, "dropping thumbnail for disposed dialog");
                        continue;
                    }
                    self.thumbnails.insert(page, buffer);
                }
                Ok((page, Err(err))) => {
                    warn!(?err, page, "thumbnail render failed");
                }
                Err(err) => {
                    warn!(?err, "thumbnail task panicked");
                }
            }
        }

        self.backend = Some(backend);
        self.page_count = page_count;
        self.active_page = 1;
        self.thumbnails_ready = true;
        self.state = EngineState::Ready;
        self.push_event(EngineEvent::ThumbnailsReady);
        self.push_event(EngineEvent::ActiveRenderNeeded);
        Ok(())
    }

    pub fn apply(&mut self, command: Command) {
        if !self.is_ready() {
            debug!(?command, "command ignored outside ready state");
            return;
        }

        match command {
            Command::NextPage => {
                let next = (self.active_page + 1).min(self.page_count);
                self.set_active_page(next);
            }
            Command::PrevPage => {
                let prev = self.active_page.saturating_sub(1).max(1);
                self.set_active_page(prev);
            }
            Command::GotoPage { page } => {
                let target = page.clamp(1, self.page_count);
                self.set_active_page(target);
            }
            Command::ToggleSelection { page } => {
                if page < 1 || page > self.page_count {
                    let err = PickError::PageOutOfRange {
                        page,
                        page_count: self.page_count,
                    };
                    warn!(%err, "selection toggle rejected");
                    return;
                }
                if !self.selection.remove(&page) {
                    self.selection.insert(page);
                }
                self.push_event(EngineEvent::SelectionChanged);
            }
            Command::ClearSelection => {
                if !self.selection.is_empty() {
                    self.selection.clear();
                    self.push_event(EngineEvent::SelectionChanged);
                }
            }
            Command::Resize { width } => {
                if !width.is_finite() || width <= 0.0 {
                    return;
                }
                if (self.viewport_width - width).abs() > f32::EPSILON {
                    self.viewport_width = width;
                    self.push_event(EngineEvent::ActiveRenderNeeded);
                }
            }
        }
    }

    /// Records the viewport width sampled at mount, before the dialog is
    /// ready. Resizes after that go through `Command::Resize`.
    pub fn set_initial_viewport_width(&mut self, width: f32) {
        if width.is_finite() && width > 0.0 {
            self.viewport_width = width;
        }
    }

    fn set_active_page(&mut self, page: PageIndex) {
        if page != self.active_page {
            self.active_page = page;
            self.push_event(EngineEvent::ActivePageChanged { page });
            self.push_event(EngineEvent::ActiveRenderNeeded);
        }
    }

    /// Starts rendering the active page at the scale implied by the current
    /// viewport width. The returned job carries the token the completion must
    /// present to `commit_active_render`.
    pub fn begin_active_render(&mut self) -> Result<ActiveRenderJob, PickError> {
        if !self.is_ready() {
            return Err(PickError::NotReady);
        }
        let backend = self.backend.clone().ok_or(PickError::NotReady)?;
        let page = self.active_page;

        let (native_width, _) = backend
            .page_size(page)
            .map_err(|source| PickError::PageRender { page, source })?;
        if !native_width.is_finite() || native_width <= 0.0 {
            return Err(PickError::PageRender {
                page,
                source: anyhow!("page {} reports non-positive width", page),
            });
        }

        let mut scale = self.viewport_width / native_width * self.config.width_margin;
        if !scale.is_finite() || scale <= 0.0 {
            scale = 1.0;
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let token = RenderToken {
            generation,
            page,
            scale_milli: quantize_scale(scale),
        };
        self.current_target = Some(token);

        let handle = tokio::task::spawn_blocking(move || backend.render_page(page, scale));
        Ok(ActiveRenderJob { token, handle })
    }

    /// Applies a finished active-page render. Returns `true` if the buffer
    /// was committed; stale tokens and post-disposal completions are dropped.
    pub fn commit_active_render(
        &mut self,
        token: RenderToken,
        result: Result<RasterBuffer>,
    ) -> bool {
        if self.disposed {
            debug!(?token, "dropping render for disposed dialog");
            return false;
        }
        if self.current_target != Some(token) {
            debug!(?token, target = ?self.current_target, "stale render discarded");
            return false;
        }
        match result {
            Ok(buffer) => {
                self.active_buffer = Some(buffer);
                self.push_event(EngineEvent::ScrollThumbnailIntoView { page: token.page });
                true
            }
            Err(source) => {
                let err = PickError::PageRender {
                    page: token.page,
                    source,
                };
                warn!(%err, "active page render failed");
                false
            }
        }
    }

    /// Resolves a query: an integer inside `1..=page_count` jumps straight to
    /// that page and clears any filter without touching page text; anything
    /// else is a case-insensitive substring scan over every page's extracted
    /// text, one page at a time. An empty query clears the filter.
    #[instrument(skip(self))]
    pub async fn search(&mut self, raw: &str) -> Result<(), PickError> {
        if !self.is_ready() {
            return Ok(());
        }

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            self.clear_filter();
            return Ok(());
        }

        if let Ok(page) = trimmed.parse::<usize>() {
            if (1..=self.page_count).contains(&page) {
                self.clear_filter();
                self.set_active_page(page);
                return Ok(());
            }
        }

        let backend = self.backend.clone().ok_or(PickError::NotReady)?;
        let needle = trimmed.to_lowercase();
        let mut matches = Vec::new();
        for page in 1..=self.page_count {
            let task_backend = Arc::clone(&backend);
            let extracted = tokio::task::spawn_blocking(move || task_backend.page_text(page)).await;
            let text = match extracted {
                Ok(Ok(text)) => text,
                Ok(Err(source)) => {
                    let err = PickError::SearchExtraction { page, source };
                    warn!(%err, "treating page as no match");
                    continue;
                }
                Err(err) => {
                    warn!(?err, page, "text extraction task failed");
                    continue;
                }
            };
            if text.to_lowercase().contains(&needle) {
                matches.push(page);
            }
        }

        self.filter = Some(matches);
        self.push_event(EngineEvent::FilterChanged);
        Ok(())
    }

    fn clear_filter(&mut self) {
        if self.filter.take().is_some() {
            self.push_event(EngineEvent::FilterChanged);
        }
    }

    /// Confirms the dialog. Fires only with a non-empty selection; with an
    /// empty one this is a no-op and the dialog stays interactive.
    pub fn confirm(&mut self) -> Option<Vec<PageIndex>> {
        if !self.is_ready() || self.selection.is_empty() {
            return None;
        }
        let pages = self.ordered_selection();
        self.close(DialogOutcome::Confirmed(pages.clone()));
        Some(pages)
    }

    pub fn cancel(&mut self) {
        if !matches!(self.state, EngineState::Closed(_)) {
            self.close(DialogOutcome::Cancelled);
        }
    }

    /// Marks the engine as torn down: render completions and thumbnail
    /// results that arrive afterwards are dropped.
    pub fn dispose(&mut self) {
        self.disposed = true;
    }

    fn close(&mut self, outcome: DialogOutcome) {
        self.backend = None;
        self.thumbnails.clear();
        self.active_buffer = None;
        self.current_target = None;
        self.state = EngineState::Closed(outcome.clone());
        self.push_event(EngineEvent::Closed(outcome));
    }
}

impl Default for PickerEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackend {
        pages: usize,
        native: (f32, f32),
        fail_render: HashSet<PageIndex>,
        fail_text: HashSet<PageIndex>,
        texts: HashMap<PageIndex, String>,
        text_calls: AtomicUsize,
    }

    impl FakeBackend {
        fn new(pages: usize) -> Self {
            Self {
                pages,
                native: (600.0, 800.0),
                fail_render: HashSet::new(),
                fail_text: HashSet::new(),
                texts: HashMap::new(),
                text_calls: AtomicUsize::new(0),
            }
        }
    }

    impl DocumentBackend for FakeBackend {
        fn page_count(&self) -> usize {
            self.pages
        }

        fn page_size(&self, page: PageIndex) -> Result<(f32, f32)> {
            if page < 1 || page > self.pages {
                return Err(anyhow!("page {} out of range", page));
            }
            Ok(self.native)
        }

        fn render_page(&self, page: PageIndex, scale: f32) -> Result<RasterBuffer> {
            if self.fail_render.contains(&page) {
                return Err(anyhow!("render failure injected for page {}", page));
            }
            let width = (self.native.0 * scale).round().max(1.0) as u32;
            let height = (self.native.1 * scale).round().max(1.0) as u32;
            Ok(RasterBuffer {
                width,
                height,
                pixels: vec![page as u8; (width * height * 4) as usize],
            })
        }

        fn page_text(&self, page: PageIndex) -> Result<String> {
            self.text_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_text.contains(&page) {
                return Err(anyhow!("extraction failure injected for page {}", page));
            }
            Ok(self
                .texts
                .get(&page)
                .cloned()
                .unwrap_or_else(|| format!("plain body of page {}", page)))
        }
    }

    struct FakeProvider {
        backend: Mutex<Option<Arc<FakeBackend>>>,
    }

    impl FakeProvider {
        fn with(backend: FakeBackend) -> Self {
            Self {
                backend: Mutex::new(Some(Arc::new(backend))),
            }
        }
    }

    #[async_trait::async_trait]
    impl DocumentProvider for FakeProvider {
        async fn open(&self, _bytes: Vec<u8>) -> Result<Arc<dyn DocumentBackend>> {
            match self.backend.lock().take() {
                Some(backend) => Ok(backend),
                None => Err(anyhow!("corrupt document")),
            }
        }
    }

    struct CorruptProvider;

    #[async_trait::async_trait]
    impl DocumentProvider for CorruptProvider {
        async fn open(&self, _bytes: Vec<u8>) -> Result<Arc<dyn DocumentBackend>> {
            Err(anyhow!("not a document"))
        }
    }

    async fn ready_engine(backend: FakeBackend, viewport: f32) -> PickerEngine {
        let provider = FakeProvider::with(backend);
        let mut engine = PickerEngine::default();
        engine.set_initial_viewport_width(viewport);
        engine.load(&provider, vec![1, 2, 3]).await.unwrap();
        engine.take_events();
        engine
    }

    #[tokio::test]
    async fn load_renders_a_thumbnail_per_page_before_ready() {
        let engine = ready_engine(FakeBackend::new(4), 570.0).await;
        assert!(engine.is_ready());
        assert!(engine.thumbnails_ready());
        assert_eq!(engine.page_count(), 4);
        for page in 1..=4 {
            let thumb = engine.thumbnail(page).expect("thumbnail present");
            assert_eq!(thumb.width, (600.0 * THUMBNAIL_SCALE).round() as u32);
            assert_eq!(thumb.height, (800.0 * THUMBNAIL_SCALE).round() as u32);
        }
    }

    #[tokio::test]
    async fn failed_thumbnail_leaves_slot_empty_without_aborting_siblings() {
        let mut backend = FakeBackend::new(5);
        backend.fail_render.insert(3);
        let engine = ready_engine(backend, 570.0).await;

        assert!(engine.is_ready());
        assert!(engine.thumbnails_ready());
        assert!(engine.thumbnail(3).is_none());
        for page in [1, 2, 4, 5] {
            assert!(engine.thumbnail(page).is_some(), "page {} missing", page);
        }
    }

    #[tokio::test]
    async fn corrupt_document_closes_cancelled() {
        let mut engine = PickerEngine::default();
        let err = engine.load(&CorruptProvider, vec![0]).await.unwrap_err();
        assert!(matches!(err, PickError::DocumentCorrupt { .. }));
        assert_eq!(
            engine.state(),
            &EngineState::Closed(DialogOutcome::Cancelled)
        );
        let events = engine.take_events();
        assert!(events.contains(&EngineEvent::Closed(DialogOutcome::Cancelled)));
    }

    #[tokio::test]
    async fn navigation_clamps_at_both_edges() {
        let mut engine = ready_engine(FakeBackend::new(3), 570.0).await;

        engine.apply(Command::PrevPage);
        assert_eq!(engine.active_page(), 1);
        assert!(engine.take_events().is_empty());

        engine.apply(Command::GotoPage { page: 3 });
        engine.take_events();
        engine.apply(Command::NextPage);
        assert_eq!(engine.active_page(), 3);
        assert!(engine.take_events().is_empty());
    }

    #[tokio::test]
    async fn goto_page_moves_and_requests_render() {
        let mut engine = ready_engine(FakeBackend::new(10), 570.0).await;
        engine.apply(Command::GotoPage { page: 7 });
        assert_eq!(engine.active_page(), 7);
        let events = engine.take_events();
        assert!(events.contains(&EngineEvent::ActivePageChanged { page: 7 }));
        assert!(events.contains(&EngineEvent::ActiveRenderNeeded));
    }

    #[tokio::test]
    async fn toggle_is_an_involution_and_selection_orders_ascending() {
        let mut engine = ready_engine(FakeBackend::new(10), 570.0).await;

        engine.apply(Command::ToggleSelection { page: 9 });
        engine.apply(Command::ToggleSelection { page: 2 });
        engine.apply(Command::ToggleSelection { page: 5 });
        assert_eq!(engine.ordered_selection(), vec![2, 5, 9]);

        engine.apply(Command::ToggleSelection { page: 5 });
        engine.apply(Command::ToggleSelection { page: 5 });
        assert_eq!(engine.ordered_selection(), vec![2, 5, 9]);

        engine.apply(Command::ClearSelection);
        assert!(engine.ordered_selection().is_empty());
    }

    #[tokio::test]
    async fn confirm_with_empty_selection_is_refused() {
        let mut engine = ready_engine(FakeBackend::new(3), 570.0).await;
        assert_eq!(engine.confirm(), None);
        assert!(engine.is_ready());
        assert!(engine.take_events().is_empty());
    }

    #[tokio::test]
    async fn confirm_yields_ascending_pages_regardless_of_toggle_order() {
        let mut engine = ready_engine(FakeBackend::new(10), 570.0).await;
        for page in [2, 5, 9] {
            engine.apply(Command::ToggleSelection { page });
        }
        engine.take_events();

        let pages = engine.confirm().expect("non-empty selection confirms");
        assert_eq!(pages, vec![2, 5, 9]);
        assert_eq!(
            engine.state(),
            &EngineState::Closed(DialogOutcome::Confirmed(vec![2, 5, 9]))
        );
        let events = engine.take_events();
        assert!(events.contains(&EngineEvent::Closed(DialogOutcome::Confirmed(vec![
            2, 5, 9
        ]))));
    }

    #[tokio::test]
    async fn numeric_query_jumps_without_scanning_text() {
        let backend = Arc::new(FakeBackend::new(10));
        let provider = FakeProvider {
            backend: Mutex::new(Some(Arc::clone(&backend))),
        };
        let mut engine = PickerEngine::default();
        engine.set_initial_viewport_width(570.0);
        engine.load(&provider, vec![]).await.unwrap();
        engine.take_events();

        engine.search("5").await.unwrap();
        assert_eq!(engine.active_page(), 5);
        assert!(engine.filter().is_none());
        assert_eq!(backend.text_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn numeric_query_clears_an_existing_filter_without_extraction() {
        let mut backend = FakeBackend::new(10);
        backend.texts.insert(4, "needle".to_string());
        let backend = Arc::new(backend);
        let provider = FakeProvider {
            backend: Mutex::new(Some(Arc::clone(&backend))),
        };
        let mut engine = PickerEngine::default();
        engine.set_initial_viewport_width(570.0);
        engine.load(&provider, vec![]).await.unwrap();
        engine.take_events();

        engine.search("needle").await.unwrap();
        assert_eq!(engine.filter(), Some(&[4][..]));
        let calls_after_text_search = backend.text_calls.load(Ordering::SeqCst);

        engine.search(" 5 ").await.unwrap();
        assert_eq!(engine.active_page(), 5);
        assert!(engine.filter().is_none(), "numeric jump clears the filter");
        assert_eq!(
            backend.text_calls.load(Ordering::SeqCst),
            calls_after_text_search
        );
    }

    #[tokio::test]
    async fn text_query_filters_matching_pages_ascending() {
        let mut backend = FakeBackend::new(10);
        backend.texts.insert(7, "the NEEDLE sits here".to_string());
        backend.texts.insert(3, "a needle in a haystack".to_string());
        for page in [1, 2, 4, 5, 6, 8, 9, 10] {
            backend.texts.insert(page, "nothing of note".to_string());
        }
        let mut engine = ready_engine(backend, 570.0).await;

        engine.search("Needle").await.unwrap();
        assert_eq!(engine.filter(), Some(&[3, 7][..]));
        assert!(engine.is_page_visible(3));
        assert!(engine.is_page_visible(7));
        assert!(!engine.is_page_visible(4));
        assert_eq!(engine.page_count(), 10, "filter does not drop pages");
        assert_eq!(engine.visible_pages(), vec![3, 7]);
        assert!(
            engine.thumbnail(4).is_some(),
            "hidden pages keep their buffers"
        );
    }

    #[tokio::test]
    async fn extraction_failure_degrades_to_no_match() {
        let mut backend = FakeBackend::new(4);
        backend.texts.insert(2, "findable".to_string());
        backend.texts.insert(3, "findable".to_string());
        backend.fail_text.insert(3);
        let mut engine = ready_engine(backend, 570.0).await;

        engine.search("findable").await.unwrap();
        assert_eq!(engine.filter(), Some(&[2][..]));
    }

    #[tokio::test]
    async fn empty_query_clears_the_filter() {
        let mut engine = ready_engine(FakeBackend::new(5), 570.0).await;
        engine.search("nowhere-to-be-found").await.unwrap();
        assert_eq!(engine.filter(), Some(&[][..]));
        engine.take_events();

        engine.search("   ").await.unwrap();
        assert!(engine.filter().is_none());
        assert_eq!(engine.visible_pages(), vec![1, 2, 3, 4, 5]);
        assert!(engine.take_events().contains(&EngineEvent::FilterChanged));
    }

    #[tokio::test]
    async fn out_of_range_numeric_query_is_treated_as_text() {
        let mut engine = ready_engine(FakeBackend::new(4), 570.0).await;
        engine.search("99").await.unwrap();
        assert_eq!(engine.active_page(), 1);
        assert_eq!(engine.filter(), Some(&[][..]));
    }

    #[tokio::test]
    async fn active_render_scale_follows_viewport_width() {
        let mut engine = ready_engine(FakeBackend::new(3), 570.0).await;
        let job = engine.begin_active_render().unwrap();
        let expected_scale = 570.0 / 600.0 * WIDTH_MARGIN;
        assert_eq!(
            job.token.scale_milli,
            (expected_scale * 1000.0).round() as u32
        );

        let (token, result) = job.finish().await;
        assert!(engine.commit_active_render(token, result));
        let buffer = engine.active_buffer().unwrap();
        assert_eq!(buffer.width, (600.0 * expected_scale).round() as u32);
        assert_eq!(buffer.height, (800.0 * expected_scale).round() as u32);
    }

    #[tokio::test]
    async fn rendering_same_page_and_scale_twice_sizes_identically() {
        let mut engine = ready_engine(FakeBackend::new(3), 570.0).await;

        let first = engine.begin_active_render().unwrap();
        let (token, result) = first.finish().await;
        engine.commit_active_render(token, result);
        let first_dims = {
            let buffer = engine.active_buffer().unwrap();
            (buffer.width, buffer.height)
        };

        let second = engine.begin_active_render().unwrap();
        let (token, result) = second.finish().await;
        engine.commit_active_render(token, result);
        let buffer = engine.active_buffer().unwrap();
        assert_eq!((buffer.width, buffer.height), first_dims);
    }

    #[tokio::test]
    async fn resize_rerenders_only_the_active_page() {
        let mut engine = ready_engine(FakeBackend::new(3), 570.0).await;
        let thumb_dims: Vec<_> = (1..=3)
            .map(|page| {
                let thumb = engine.thumbnail(page).unwrap();
                (thumb.width, thumb.height)
            })
            .collect();

        engine.apply(Command::Resize { width: 1140.0 });
        let events = engine.take_events();
        assert!(events.contains(&EngineEvent::ActiveRenderNeeded));

        let job = engine.begin_active_render().unwrap();
        let expected_scale = 1140.0 / 600.0 * WIDTH_MARGIN;
        assert_eq!(
            job.token.scale_milli,
            (expected_scale * 1000.0).round() as u32
        );
        let (token, result) = job.finish().await;
        assert!(engine.commit_active_render(token, result));

        for (page, dims) in (1..=3).zip(thumb_dims) {
            let thumb = engine.thumbnail(page).unwrap();
            assert_eq!(
                (thumb.width, thumb.height),
                dims,
                "thumbnail {} changed",
                page
            );
        }
    }

    #[tokio::test]
    async fn stale_render_completion_is_discarded() {
        let mut engine = ready_engine(FakeBackend::new(5), 570.0).await;

        let stale = engine.begin_active_render().unwrap();
        engine.apply(Command::NextPage);
        let fresh = engine.begin_active_render().unwrap();

        let (stale_token, stale_result) = stale.finish().await;
        assert!(!engine.commit_active_render(stale_token, stale_result));
        assert!(engine.active_buffer().is_none());

        let (fresh_token, fresh_result) = fresh.finish().await;
        assert!(engine.commit_active_render(fresh_token, fresh_result));
        assert!(engine.active_buffer().is_some());

        let events = engine.take_events();
        assert!(events.contains(&EngineEvent::ScrollThumbnailIntoView { page: 2 }));
        assert!(!events.contains(&EngineEvent::ScrollThumbnailIntoView { page: 1 }));
    }

    #[tokio::test]
    async fn disposed_engine_drops_render_completions() {
        let mut engine = ready_engine(FakeBackend::new(3), 570.0).await;
        let job = engine.begin_active_render().unwrap();
        engine.dispose();
        let (token, result) = job.finish().await;
        assert!(!engine.commit_active_render(token, result));
        assert!(engine.active_buffer().is_none());
    }

    #[tokio::test]
    async fn render_failure_keeps_previous_buffer() {
        let mut backend = FakeBackend::new(3);
        backend.fail_render.insert(2);
        let provider = FakeProvider::with(backend);
        let mut engine = PickerEngine::default();
        engine.set_initial_viewport_width(570.0);
        engine.load(&provider, vec![]).await.unwrap();
        engine.take_events();

        let job = engine.begin_active_render().unwrap();
        let (token, result) = job.finish().await;
        assert!(engine.commit_active_render(token, result));
        let kept = engine.active_buffer().cloned().unwrap();

        engine.apply(Command::GotoPage { page: 2 });
        let job = engine.begin_active_render().unwrap();
        let (token, result) = job.finish().await;
        assert!(!engine.commit_active_render(token, result));
        assert_eq!(engine.active_buffer(), Some(&kept));
    }

    #[tokio::test]
    async fn cancel_releases_the_document() {
        let mut engine = ready_engine(FakeBackend::new(3), 570.0).await;
        engine.cancel();
        assert_eq!(
            engine.state(),
            &EngineState::Closed(DialogOutcome::Cancelled)
        );
        assert!(engine.thumbnail(1).is_none());
        assert!(engine.active_buffer().is_none());

        engine.apply(Command::NextPage);
        assert_eq!(engine.active_page(), 1);
    }
}
