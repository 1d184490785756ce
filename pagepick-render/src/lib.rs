use std::convert::TryFrom;
use std::mem;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use pagepick_core::{DocumentBackend, DocumentProvider, PageIndex, RasterBuffer};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{instrument, warn};

pub struct PdfiumPickFactory {
    pdfium: Arc<Pdfium>,
}

impl PdfiumPickFactory {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_build_hint() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumPickFactory {
    async fn open(&self, bytes: Vec<u8>) -> Result<Arc<dyn DocumentBackend>> {
        let document = PdfiumPickDocument::open(Arc::clone(&self.pdfium), bytes)?;
        Ok(Arc::new(document))
    }
}

struct PdfiumPickDocument {
    // Declared first so it drops before the bytes and bindings it borrows.
    document: Mutex<Option<PdfDocument<'static>>>,
    bytes: Vec<u8>,
    pdfium: Arc<Pdfium>,
    page_count: usize,
}

impl PdfiumPickDocument {
    fn open(pdfium: Arc<Pdfium>, bytes: Vec<u8>) -> Result<Self> {
        let instance = Self {
            document: Mutex::new(None),
            bytes,
            pdfium,
            page_count: 0,
        };
        let page_count = instance.with_document(|document| {
            Ok(usize::try_from(document.pages().len()).unwrap_or_default())
        })?;
        if page_count == 0 {
            return Err(anyhow!("document has no pages"));
        }
        Ok(Self {
            page_count,
            ..instance
        })
    }

    fn load_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_byte_slice(&self.bytes, None)
            .context("failed to parse document bytes")?;
        // SAFETY: the returned PdfDocument borrows the Pdfium bindings behind
        // self.pdfium and the heap allocation behind self.bytes. Both live as
        // long as self, self.bytes is never mutated, and struct fields drop in
        // declaration order, so the cached document (declared first) is gone
        // before either borrow target.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        if guard.is_none() {
            let document = self.load_document()?;
            *guard = Some(document);
        }
        let document = guard.as_ref().expect("document must be loaded");
        f(document)
    }

    fn pdf_page_index(&self, page: PageIndex) -> Result<PdfPageIndex> {
        if page < 1 || page > self.page_count {
            return Err(anyhow!(
                "page {} outside 1..={}",
                page,
                self.page_count
            ));
        }
        PdfPageIndex::try_from(page - 1)
            .map_err(|_| anyhow!("page {} is out of supported range", page))
    }
}

impl DocumentBackend for PdfiumPickDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn page_size(&self, page: PageIndex) -> Result<(f32, f32)> {
        let index = self.pdf_page_index(page)?;
        self.with_document(|document| {
            let pdf_page = document
                .pages()
                .get(index)
                .with_context(|| format!("page {} out of range", page))?;
            Ok((pdf_page.width().value, pdf_page.height().value))
        })
    }

    #[instrument(skip(self))]
    fn render_page(&self, page: PageIndex, scale: f32) -> Result<RasterBuffer> {
        let index = self.pdf_page_index(page)?;
        self.with_document(|document| {
            let pdf_page = document
                .pages()
                .get(index)
                .with_context(|| format!("page {} out of range", page))?;

            let config = PdfRenderConfig::new().scale_page_by_factor(scale.max(0.05));
            let bitmap = pdf_page
                .render_with_config(&config)
                .with_context(|| format!("failed to render page {}", page))?;
            let image = bitmap.as_image().to_rgba8();
            let pixels = image.into_raw();

            Ok(RasterBuffer {
                width: u32::try_from(bitmap.width()).unwrap_or_default(),
                height: u32::try_from(bitmap.height()).unwrap_or_default(),
                pixels,
            })
        })
    }

    fn page_text(&self, page: PageIndex) -> Result<String> {
        let index = self.pdf_page_index(page)?;
        self.with_document(|document| {
            let pdf_page = document
                .pages()
                .get(index)
                .with_context(|| format!("page {} out of range", page))?;
            let text = pdf_page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page))?;
            Ok(text.all())
        })
    }
}

fn bind_pdfium_from_build_hint() -> Option<Pdfium> {
    match option_env!("PAGEPICK_PDFIUM_LIBRARY_PATH") {
        Some(path) if !path.is_empty() => match Pdfium::bind_to_library(path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!(
                    "failed to load Pdfium from build-provided path {}: {}",
                    path, err
                );
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
