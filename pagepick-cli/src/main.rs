use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event;
use crossterm::style::{Attribute, Print, SetAttribute};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use pagepick_core::{
    ActiveRenderJob, Command, DialogOutcome, EngineConfig, EngineEvent, PickerEngine, RasterBuffer,
};
use pagepick_render::PdfiumPickFactory;
use pagepick_tty::{
    write_status_line, DrawParams, EventMapper, KittyRenderer, ThumbnailRail, UiEvent,
};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const ACTIVE_IMAGE_ID: u32 = 1;
const RAIL_IMAGE_ID_BASE: u32 = 2;
const RAIL_ROWS: u32 = 6;
const RAIL_SLOT_COLS: u32 = 10;

#[derive(Debug, Parser)]
#[command(
    name = "pagepick",
    version,
    about = "preview a PDF in the terminal and pick a subset of its pages"
)]
struct Args {
    /// Page to open the preview on (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Path to a TOML file overriding the engine defaults
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Path to the PDF file to pick pages from
    file: PathBuf,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "pagepick", "pagepick")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = load_config(&args, &project_dirs)?;

    let bytes =
        fs::read(&args.file).with_context(|| format!("failed to read {:?}", args.file))?;
    let provider = PdfiumPickFactory::new()?;

    let mut engine = PickerEngine::new(config);
    engine.set_initial_viewport_width(sample_viewport_width()?);
    engine
        .load(&provider, bytes)
        .await
        .with_context(|| format!("failed to open {:?}", args.file))?;

    if let Some(page) = args.page {
        engine.apply(Command::GotoPage { page });
    }

    let file_name = args
        .file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("<unknown>")
        .to_string();

    let outcome = run_dialog(&mut engine, &file_name).await?;
    engine.dispose();

    match outcome {
        DialogOutcome::Confirmed(pages) => {
            println!("{}", serde_json::to_string(&pages)?);
            Ok(())
        }
        DialogOutcome::Cancelled => std::process::exit(1),
    }
}

async fn run_dialog(engine: &mut PickerEngine, file_name: &str) -> Result<DialogOutcome> {
    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut renderer = KittyRenderer::new(stdout);
    let mut mapper = EventMapper::new();
    let mut rail = ThumbnailRail::new();
    let mut inflight: Vec<ActiveRenderJob> = Vec::new();
    let mut dirty = true;

    let outcome = 'dialog: loop {
        for ev in engine.take_events() {
            match ev {
                EngineEvent::ActiveRenderNeeded => match engine.begin_active_render() {
                    Ok(job) => inflight.push(job),
                    Err(err) => warn!(?err, "could not start active page render"),
                },
                EngineEvent::Closed(outcome) => break 'dialog outcome,
                _ => dirty = true,
            }
        }

        let mut finished = Vec::new();
        let mut index = 0;
        while index < inflight.len() {
            if inflight[index].is_finished() {
                finished.push(inflight.swap_remove(index));
            } else {
                index += 1;
            }
        }
        for job in finished {
            let (token, result) = job.finish().await;
            if engine.commit_active_render(token, result) {
                dirty = true;
            }
        }

        if dirty {
            redraw(&mut renderer, engine, &mut rail, file_name, &mapper)?;
            dirty = false;
        }

        if event::poll(Duration::from_millis(50))? {
            let ui_event = mapper.map_event(event::read()?);
            match ui_event {
                UiEvent::Command(cmd) => engine.apply(cmd),
                UiEvent::ToggleActive => engine.apply(Command::ToggleSelection {
                    page: engine.active_page(),
                }),
                UiEvent::BeginSearch | UiEvent::SearchQueryChanged { .. } => dirty = true,
                UiEvent::SearchSubmit { query } => {
                    if let Err(err) = engine.search(&query).await {
                        warn!(?err, "search failed");
                    }
                    dirty = true;
                }
                UiEvent::SearchCancel => {
                    if let Err(err) = engine.search("").await {
                        warn!(?err, "failed to clear search filter");
                    }
                    dirty = true;
                }
                UiEvent::Confirm => {
                    engine.confirm();
                }
                UiEvent::Cancel => engine.cancel(),
                UiEvent::Resized => engine.apply(Command::Resize {
                    width: sample_viewport_width()?,
                }),
                UiEvent::None => {}
            }
        }
    };

    renderer.delete_images()?;
    renderer.clear_all()?;
    Ok(outcome)
}

/// Width in pixels the active page may occupy. Kitty-style terminals report
/// the window size in pixels; fall back to an 8px-per-cell estimate.
fn sample_viewport_width() -> Result<f32> {
    let window = terminal::window_size()?;
    let width = if window.width > 0 {
        f32::from(window.width)
    } else {
        f32::from(window.columns.max(1)) * 8.0
    };
    Ok(width)
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    engine: &PickerEngine,
    rail: &mut ThumbnailRail,
    file_name: &str,
    mapper: &EventMapper,
) -> Result<()> {
    let window = terminal::window_size()?;
    let total_cols = u32::from(window.columns).max(1);
    let total_rows = u32::from(window.rows).max(1);
    let pixel_width = u32::from(window.width);
    let pixel_height = u32::from(window.height);

    renderer.begin_sync_update()?;
    renderer.delete_images()?;
    renderer.clear_all()?;

    let status_rows = 1;
    let rail_rows = RAIL_ROWS.min(total_rows.saturating_sub(status_rows + 2));
    let active_rows = total_rows
        .saturating_sub(rail_rows + status_rows)
        .max(1);

    if let Some(buffer) = engine.active_buffer() {
        let (draw_cols, draw_rows) = fit_image(
            buffer,
            total_cols,
            active_rows,
            pixel_width,
            pixel_height,
            total_rows,
        );
        let start_col = (total_cols.saturating_sub(draw_cols)) / 2;
        {
            let mut writer = renderer.writer();
            crossterm::execute!(&mut writer, cursor::MoveTo(start_col as u16, 0))?;
        }
        renderer.draw(buffer, DrawParams::clamped(draw_cols, draw_rows), ACTIVE_IMAGE_ID)?;
    }

    if rail_rows > 0 {
        draw_rail(renderer, engine, rail, total_cols, active_rows, rail_rows)?;
    }

    draw_status_line(renderer, &format_status(engine, file_name, mapper), total_rows)?;
    renderer.end_sync_update()?;
    Ok(())
}

fn draw_rail(
    renderer: &mut KittyRenderer<io::Stdout>,
    engine: &PickerEngine,
    rail: &mut ThumbnailRail,
    total_cols: u32,
    rail_top: u32,
    rail_rows: u32,
) -> Result<()> {
    let slots = (total_cols / RAIL_SLOT_COLS).max(1) as usize;
    let visible = engine.visible_pages();
    let window = rail.window(&visible, engine.active_page(), slots);
    let image_rows = rail_rows.saturating_sub(1).max(1);
    let label_row = (rail_top + image_rows).min(u32::from(u16::MAX)) as u16;

    for (slot, &page) in window.iter().enumerate() {
        let col = (slot as u32 * RAIL_SLOT_COLS) as u16;
        if let Some(thumb) = engine.thumbnail(page) {
            {
                let mut writer = renderer.writer();
                crossterm::execute!(&mut writer, cursor::MoveTo(col, rail_top as u16))?;
            }
            renderer.draw(
                thumb,
                DrawParams::clamped(RAIL_SLOT_COLS - 2, image_rows),
                RAIL_IMAGE_ID_BASE + slot as u32,
            )?;
        }

        let marker = if engine.is_selected(page) { '*' } else { ' ' };
        let pointer = if page == engine.active_page() { '>' } else { ' ' };
        let label = format!("{}{}{:>3}", pointer, marker, page);
        let mut writer = renderer.writer();
        if page == engine.active_page() {
            crossterm::execute!(
                &mut writer,
                cursor::MoveTo(col, label_row),
                SetAttribute(Attribute::Reverse),
                Print(label),
                SetAttribute(Attribute::Reset)
            )?;
        } else {
            crossterm::execute!(&mut writer, cursor::MoveTo(col, label_row), Print(label))?;
        }
    }

    Ok(())
}

fn fit_image(
    image: &RasterBuffer,
    available_cols: u32,
    available_rows: u32,
    pixel_width: u32,
    pixel_height: u32,
    total_rows: u32,
) -> (u32, u32) {
    if image.width == 0 || image.height == 0 {
        return (available_cols.max(1), available_rows.max(1));
    }

    // Prefer real cell metrics when the terminal reports pixel dimensions;
    // otherwise assume cells twice as tall as wide.
    let cell_ratio = if pixel_width > 0 && pixel_height > 0 && total_rows > 0 {
        let cell_width = pixel_width as f32 / available_cols.max(1) as f32;
        let cell_height = pixel_height as f32 / total_rows as f32;
        if cell_width > 0.0 && cell_height > 0.0 {
            cell_height / cell_width
        } else {
            2.0
        }
    } else {
        2.0
    };

    let image_ratio = image.width as f32 / image.height as f32;
    let mut cols = available_cols.max(1) as f32;
    let mut rows = (cols / image_ratio / cell_ratio).round().max(1.0);
    if rows > available_rows as f32 {
        rows = available_rows.max(1) as f32;
        cols = (rows * image_ratio * cell_ratio).round().max(1.0);
    }

    (
        (cols as u32).clamp(1, available_cols.max(1)),
        (rows as u32).clamp(1, available_rows.max(1)),
    )
}

fn format_status(engine: &PickerEngine, file_name: &str, mapper: &EventMapper) -> String {
    let mut status = format!(
        "{} — page {}/{} — {} selected",
        file_name,
        engine.active_page(),
        engine.page_count(),
        engine.selection_len()
    );

    if let Some(filter) = engine.filter() {
        status.push_str(&format!(" — {} matches", filter.len()));
    }

    if let Some(pending) = mapper.pending_input() {
        status.push_str(" | ");
        status.push_str(&pending);
    } else {
        status.push_str(" | space:pick enter:confirm /:search q:cancel");
    }

    status
}

fn draw_status_line(
    renderer: &mut KittyRenderer<io::Stdout>,
    status: &str,
    total_rows: u32,
) -> Result<()> {
    let status_row = total_rows.saturating_sub(1);
    let mut writer = renderer.writer();
    crossterm::execute!(
        &mut writer,
        cursor::MoveTo(0, status_row as u16),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(&mut writer, status)?;
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pagepick.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

fn load_config(args: &Args, project_dirs: &ProjectDirs) -> Result<EngineConfig> {
    if let Some(path) = &args.config {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {:?}", path))?;
        return toml::from_str(&raw).with_context(|| format!("failed to parse config {:?}", path));
    }

    let default_path = project_dirs.config_dir().join("pagepick.toml");
    if default_path.exists() {
        match fs::read_to_string(&default_path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| toml::from_str(&raw).map_err(anyhow::Error::from))
        {
            Ok(config) => return Ok(config),
            Err(err) => warn!(?err, path = ?default_path, "ignoring unreadable config"),
        }
    }

    Ok(EngineConfig::default())
}
