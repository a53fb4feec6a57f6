use std::collections::HashMap;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crossterm::queue;
use crossterm::style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor};
use directories::ProjectDirs;
use gravity_client::{Analysis, AnalysisClient, AnalyzeMode, ExportFormat};
use gravity_core::config::CONFIG_FILE;
use gravity_core::{
    by_recency, clamp_page, AlignmentOrchestrator, AlignmentPhase, DocumentKey, FileLibraryStore,
    FragmentHandle, HighlightSurface, HighlightTarget, LibraryStore, PageSurface, ReaderConfig,
    RenderEvent, TextFragment, ViewState, ViewStateWriter,
};
use gravity_render::{join_document_text, mime_type_for_name, PdfiumTextSource};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "gravity",
    version,
    about = "Document library and highlight alignment for GravityReader"
)]
struct Args {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the document library
    #[arg(long, global = true)]
    library: Option<PathBuf>,

    #[command(subcommand)]
    command: CommandArgs,
}

#[derive(Debug, Subcommand)]
enum CommandArgs {
    /// Add a document to the library
    Add { file: PathBuf },
    /// List documents, most recently read first
    List,
    /// Show a document and optionally record the page being read
    Open {
        id: DocumentKey,
        #[arg(short, long)]
        page: Option<u32>,
    },
    /// Remove a document from the library
    Remove { id: DocumentKey },
    /// Print a page with every occurrence of TEXT highlighted
    Highlight {
        id: DocumentKey,
        #[arg(short, long)]
        text: String,
        #[arg(short, long)]
        page: Option<u32>,
        #[arg(short, long)]
        color: Option<String>,
    },
    /// Translate text from a page and optionally highlight one segment
    Analyze {
        id: DocumentKey,
        #[arg(short, long)]
        page: Option<u32>,
        /// Text to analyze; defaults to the whole page
        #[arg(short, long)]
        text: Option<String>,
        #[arg(short, long, default_value = "sentence")]
        mode: AnalyzeMode,
        /// Highlight the original text of the N-th segment (1-based)
        #[arg(long)]
        pick: Option<usize>,
        #[arg(long, value_enum)]
        export: Option<ExportArg>,
    },
    /// Summarize a whole document
    Summarize {
        id: DocumentKey,
        /// Approximate length of the summary in words
        #[arg(short, long)]
        length: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportArg {
    Zh,
    Bilingual,
}

impl From<ExportArg> for ExportFormat {
    fn from(arg: ExportArg) -> Self {
        match arg {
            ExportArg::Zh => ExportFormat::Chinese,
            ExportArg::Bilingual => ExportFormat::Bilingual,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ReaderConfig::project_dirs()
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join(CONFIG_FILE));
    let config = ReaderConfig::load(&config_path)?;
    let library_dir = args
        .library
        .clone()
        .or_else(|| config.library_dir.clone())
        .unwrap_or_else(|| project_dirs.data_local_dir().join("library"));
    let store = FileLibraryStore::new(library_dir);

    match args.command {
        CommandArgs::Add { file } => add_document(&store, file).await,
        CommandArgs::List => list_documents(&store).await,
        CommandArgs::Open { id, page } => open_document(&store, id, page).await,
        CommandArgs::Remove { id } => {
            store.delete(id).await?;
            println!("removed {id}");
            Ok(())
        }
        CommandArgs::Highlight {
            id,
            text,
            page,
            color,
        } => {
            let color = color.unwrap_or_else(|| config.highlight_color.clone());
            let source = PdfiumTextSource::new()?;
            highlight_page(&store, &source, &config, id, page, HighlightTarget::new(text, color))
                .await
        }
        CommandArgs::Analyze {
            id,
            page,
            text,
            mode,
            pick,
            export,
        } => {
            let source = PdfiumTextSource::new()?;
            let client = AnalysisClient::new(config.api_url.clone())?;
            let request = AnalyzeRequest {
                id,
                page,
                text,
                mode,
                pick,
                export,
            };
            analyze_page(&store, &source, &client, &config, request).await
        }
        CommandArgs::Summarize { id, length } => {
            let source = PdfiumTextSource::new()?;
            let client = AnalysisClient::new(config.api_url.clone())?;
            let record = store.get(id).await?;
            let text = source.document_text(&record.blob)?;
            let summary = client
                .summarize(&text, length.unwrap_or(config.summary_length))
                .await?;
            println!("{summary}");
            Ok(())
        }
    }
}

async fn add_document(store: &dyn LibraryStore, file: PathBuf) -> Result<()> {
    let blob = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read {:?}", file))?;
    let name = file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("untitled")
        .to_string();
    let id = store.save(blob, &name, mime_type_for_name(&name)).await?;
    info!(id, name = %name, "document added");
    println!("{id}");
    Ok(())
}

async fn list_documents(store: &dyn LibraryStore) -> Result<()> {
    let mut documents = store.list().await?;
    by_recency(&mut documents);
    let now = now_millis();
    for doc in documents {
        println!(
            "{:>4}  p.{:<4} {:>10}  {}",
            doc.id,
            doc.last_page,
            format_age(now, doc.timestamp),
            doc.name
        );
    }
    Ok(())
}

async fn open_document(store: &dyn LibraryStore, id: DocumentKey, page: Option<u32>) -> Result<()> {
    if let Some(page) = page {
        store.update_page(id, page.max(1)).await?;
    }
    let record = store.get(id).await?;
    println!(
        "{} ({}, {} bytes), page {}",
        record.name,
        record.mime_type,
        record.blob.len(),
        record.last_page
    );
    Ok(())
}

struct AnalyzeRequest {
    id: DocumentKey,
    page: Option<u32>,
    text: Option<String>,
    mode: AnalyzeMode,
    pick: Option<usize>,
    export: Option<ExportArg>,
}

async fn analyze_page(
    store: &dyn LibraryStore,
    source: &PdfiumTextSource,
    client: &AnalysisClient,
    config: &ReaderConfig,
    request: AnalyzeRequest,
) -> Result<()> {
    let text = match request.text {
        Some(text) => text,
        None => {
            let record = store.get(request.id).await?;
            let page_count = source.page_count(&record.blob)?;
            let page = clamp_page(request.page.unwrap_or(record.last_page), page_count);
            let fragments = source.page_fragments(&record.blob, page)?;
            join_document_text([fragments.into_iter().map(|fragment| fragment.text)])
        }
    };
    if text.trim().is_empty() {
        bail!("nothing to analyze");
    }

    let analysis = client.analyze(&text, request.mode).await?;
    if let Some(format) = request.export {
        match analysis.export(format.into()) {
            Some(exported) => println!("{exported}"),
            None => bail!("no analysis data to export"),
        }
    } else {
        print_analysis(&analysis);
    }

    if let Some(pick) = request.pick {
        let pair = pick
            .checked_sub(1)
            .and_then(|index| analysis.pairs().get(index))
            .ok_or_else(|| anyhow!("segment {} does not exist", pick))?;
        let target = HighlightTarget::new(pair.en.clone(), config.highlight_color.clone());
        highlight_page(store, source, config, request.id, request.page, target).await?;
    }
    Ok(())
}

fn print_analysis(analysis: &Analysis) {
    match analysis {
        Analysis::Pairs(pairs) => {
            for (index, pair) in pairs.iter().enumerate() {
                println!("{:>3}. {}\n     {}", index + 1, pair.en, pair.zh);
            }
        }
        Analysis::Raw(value) => println!("{value}"),
    }
}

/// Renders one page's fragments, lets the orchestrator align the target on
/// them and prints the result. The page shown is recorded as last read.
async fn highlight_page(
    store: &dyn LibraryStore,
    source: &PdfiumTextSource,
    config: &ReaderConfig,
    id: DocumentKey,
    page: Option<u32>,
    target: HighlightTarget,
) -> Result<()> {
    let record = store.get(id).await?;
    let page_count = source.page_count(&record.blob)?;
    let page = clamp_page(page.unwrap_or(record.last_page), page_count);
    let fragments = source.page_fragments(&record.blob, page)?;

    let surface = Arc::new(Mutex::new(TerminalPage::new(fragments)));
    let (writer, view) = ViewStateWriter::new(ViewState {
        page,
        ..ViewState::default()
    });
    let (render_tx, render_rx) = mpsc::channel(4);
    let orchestrator =
        AlignmentOrchestrator::new(Arc::clone(&surface), view, render_rx, config.settle_delay());
    let mut phases = orchestrator.phases();
    let task = tokio::spawn(orchestrator.run());

    writer.select_target(target);
    render_tx.send(RenderEvent { page }).await?;
    wait_until_applied(&mut phases).await?;
    drop(writer);
    drop(render_tx);
    task.await?;

    {
        let terminal = surface.lock();
        let mut stdout = io::stdout();
        let colored = stdout.is_terminal();
        terminal.write_to(&mut stdout, colored)?;
        if terminal.highlighted_count() == 0 {
            warn!(page, "no occurrence found on page");
        }
    }

    if let Err(err) = store.update_page(id, page).await {
        warn!(?err, id, page, "failed to record last read page");
    }
    Ok(())
}

async fn wait_until_applied(phases: &mut watch::Receiver<AlignmentPhase>) -> Result<()> {
    loop {
        phases
            .changed()
            .await
            .map_err(|_| anyhow!("alignment stopped before highlights were applied"))?;
        if *phases.borrow_and_update() == AlignmentPhase::Applied {
            return Ok(());
        }
    }
}

/// A page rendered as terminal text.
struct TerminalPage {
    fragments: Vec<TextFragment<FragmentHandle>>,
    painted: HashMap<usize, String>,
}

impl TerminalPage {
    fn new(fragments: Vec<TextFragment<FragmentHandle>>) -> Self {
        Self {
            fragments,
            painted: HashMap::new(),
        }
    }

    fn highlighted_count(&self) -> usize {
        self.painted.len()
    }

    fn is_live(&self, handle: &FragmentHandle) -> bool {
        self.fragments
            .get(handle.ordinal)
            .is_some_and(|fragment| fragment.handle == *handle)
    }

    fn write_to(&self, out: &mut impl Write, colored: bool) -> Result<()> {
        for (ordinal, fragment) in self.fragments.iter().enumerate() {
            match self.painted.get(&ordinal) {
                Some(color) if colored => queue!(
                    out,
                    SetBackgroundColor(parse_color(color)),
                    SetForegroundColor(Color::Black),
                    Print(&fragment.text),
                    ResetColor
                )?,
                Some(_) => queue!(out, Print(format!("[[{}]]", fragment.text)))?,
                None => queue!(out, Print(&fragment.text))?,
            }
            if let Some(separator) = self.separator_after(ordinal) {
                queue!(out, Print(separator))?;
            }
        }
        queue!(out, Print('\n'))?;
        out.flush()?;
        Ok(())
    }

    fn separator_after(&self, ordinal: usize) -> Option<char> {
        let current = self.fragments.get(ordinal)?;
        let next = self.fragments.get(ordinal + 1)?;
        if current.text.ends_with(char::is_whitespace) {
            return None;
        }
        if next.handle.bounds.top >= current.handle.bounds.bottom {
            Some('\n')
        } else {
            Some(' ')
        }
    }
}

impl HighlightSurface for TerminalPage {
    type Handle = FragmentHandle;

    fn clear(&mut self, handle: &FragmentHandle) -> bool {
        if !self.is_live(handle) {
            return false;
        }
        self.painted.remove(&handle.ordinal);
        true
    }

    fn paint(&mut self, handle: &FragmentHandle, color: &str) -> bool {
        if !self.is_live(handle) {
            return false;
        }
        self.painted.insert(handle.ordinal, color.to_string());
        true
    }
}

impl PageSurface for TerminalPage {
    fn fragments(&self) -> Vec<TextFragment<FragmentHandle>> {
        self.fragments.clone()
    }
}

/// Accepts `#rrggbb` or a color name; anything else falls back to yellow.
fn parse_color(value: &str) -> Color {
    if let Some(hex) = value.strip_prefix('#') {
        if hex.len() == 6 {
            let channel = |range: std::ops::Range<usize>| {
                hex.get(range).and_then(|part| u8::from_str_radix(part, 16).ok())
            };
            if let (Some(r), Some(g), Some(b)) = (channel(0..2), channel(2..4), channel(4..6)) {
                return Color::Rgb { r, g, b };
            }
        }
        return Color::Yellow;
    }
    Color::try_from(value.to_ascii_lowercase().as_str()).unwrap_or(Color::Yellow)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

fn format_age(now: i64, timestamp: i64) -> String {
    let seconds = (now - timestamp).max(0) / 1000;
    match seconds {
        0..=59 => "just now".to_string(),
        60..=3_599 => format!("{}m ago", seconds / 60),
        3_600..=86_399 => format!("{}h ago", seconds / 3_600),
        _ => format!("{}d ago", seconds / 86_400),
    }
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "gravity.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
