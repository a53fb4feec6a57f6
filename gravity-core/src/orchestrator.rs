use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument};

use crate::highlight::{apply_highlights, HighlightSurface, HighlightTarget};
use crate::text::{locate, PageTextIndex, TextFragment};

pub const MIN_SCALE: f32 = 0.5;
pub const MAX_SCALE: f32 = 3.0;

/// A rendered page: the fragments it currently shows and the presentation
/// state of those fragments.
pub trait PageSurface: HighlightSurface {
    fn fragments(&self) -> Vec<TextFragment<Self::Handle>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    /// 1-based page number.
    pub page: u32,
    pub scale: f32,
    pub target: Option<HighlightTarget>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            page: 1,
            scale: 1.0,
            target: None,
        }
    }
}

/// Sole writer of the view state read by [`AlignmentOrchestrator`].
///
/// Every setter only notifies readers when the value actually changes.
#[derive(Debug)]
pub struct ViewStateWriter {
    tx: watch::Sender<ViewState>,
}

impl ViewStateWriter {
    pub fn new(initial: ViewState) -> (Self, watch::Receiver<ViewState>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ViewState {
        self.tx.borrow().clone()
    }

    pub fn select_target(&self, target: HighlightTarget) {
        self.tx.send_if_modified(|state| {
            if state.target.as_ref() == Some(&target) {
                return false;
            }
            state.target = Some(target);
            true
        });
    }

    pub fn set_color(&self, color: &str) {
        self.tx.send_if_modified(|state| match state.target.as_mut() {
            Some(target) if target.color != color => {
                target.color = color.to_string();
                true
            }
            _ => false,
        });
    }

    pub fn set_page(&self, page: u32) {
        let page = page.max(1);
        self.tx.send_if_modified(|state| {
            if state.page == page {
                return false;
            }
            state.page = page;
            true
        });
    }

    pub fn set_scale(&self, scale: f32) {
        let scale = clamp_scale(scale);
        self.tx.send_if_modified(|state| {
            if (state.scale - scale).abs() <= f32::EPSILON {
                return false;
            }
            state.scale = scale;
            true
        });
    }
}

pub fn clamp_scale(scale: f32) -> f32 {
    if scale.is_finite() {
        scale.clamp(MIN_SCALE, MAX_SCALE)
    } else {
        1.0
    }
}

/// Sent by the renderer once a page's fragments are in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderEvent {
    pub page: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentPhase {
    Idle,
    Pending,
    Applied,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Rendered(RenderEvent),
    ViewChanged,
}

/// Re-runs index build, locate and paint whenever the page is re-rendered
/// or the view state changes.
///
/// Each run waits `settle_delay` first and then reads the view state as it
/// is at that moment, so the latest trigger always wins. Renderers that emit
/// [`RenderEvent`] only once fragments are attached can use a zero delay.
pub struct AlignmentOrchestrator<P> {
    surface: Arc<Mutex<P>>,
    view: watch::Receiver<ViewState>,
    renders: mpsc::Receiver<RenderEvent>,
    settle_delay: Duration,
    phase: watch::Sender<AlignmentPhase>,
}

impl<P> AlignmentOrchestrator<P>
where
    P: PageSurface + Send + 'static,
{
    pub fn new(
        surface: Arc<Mutex<P>>,
        view: watch::Receiver<ViewState>,
        renders: mpsc::Receiver<RenderEvent>,
        settle_delay: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(AlignmentPhase::Idle);
        Self {
            surface,
            view,
            renders,
            settle_delay,
            phase,
        }
    }

    pub fn phases(&self) -> watch::Receiver<AlignmentPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> AlignmentPhase {
        *self.phase.borrow()
    }

    /// Runs until the view writer or the render channel is dropped.
    #[instrument(skip(self), fields(settle_ms = self.settle_delay.as_millis() as u64))]
    pub async fn run(mut self) {
        while let Some(trigger) = self.next_trigger().await {
            debug!(?trigger, "alignment pending");
            self.phase.send_replace(AlignmentPhase::Pending);

            if !self.settle_delay.is_zero() {
                tokio::time::sleep(self.settle_delay).await;
            }
            // renders that landed while settling are covered by this run
            while self.renders.try_recv().is_ok() {}

            self.align_now();
            self.phase.send_replace(AlignmentPhase::Applied);
        }
        debug!("alignment orchestrator stopped");
    }

    /// Rebuilds the index from the live fragments and repaints them for the
    /// current target. Returns the number of matches found.
    pub fn align_now(&mut self) -> usize {
        let view = self.view.borrow_and_update().clone();
        let mut surface = self.surface.lock();
        let index = PageTextIndex::build(surface.fragments());

        let (spans, color) = match &view.target {
            Some(target) => (locate(&index, &target.text), target.color.as_str()),
            None => (Vec::new(), ""),
        };
        apply_highlights(&index, &spans, color, &mut *surface);

        debug!(
            page = view.page,
            scale = view.scale,
            fragments = index.spans().len(),
            matches = spans.len(),
            "highlights aligned"
        );
        spans.len()
    }

    async fn next_trigger(&mut self) -> Option<Trigger> {
        tokio::select! {
            changed = self.view.changed() => changed.ok().map(|()| Trigger::ViewChanged),
            event = self.renders.recv() => event.map(Trigger::Rendered),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct FakePage {
        generation: u32,
        fragments: Vec<String>,
        painted: HashMap<(u32, usize), String>,
    }

    impl FakePage {
        fn with_text(parts: &[&str]) -> Self {
            let mut page = Self::default();
            page.rerender(parts);
            page
        }

        fn rerender(&mut self, parts: &[&str]) {
            self.generation += 1;
            self.fragments = parts.iter().map(|s| s.to_string()).collect();
            self.painted.clear();
        }

        fn highlighted(&self) -> Vec<usize> {
            let mut ordinals: Vec<usize> = self.painted.keys().map(|(_, ordinal)| *ordinal).collect();
            ordinals.sort_unstable();
            ordinals
        }
    }

    impl HighlightSurface for FakePage {
        type Handle = (u32, usize);

        fn clear(&mut self, handle: &(u32, usize)) -> bool {
            if handle.0 != self.generation {
                return false;
            }
            self.painted.remove(handle);
            true
        }

        fn paint(&mut self, handle: &(u32, usize), color: &str) -> bool {
            if handle.0 != self.generation {
                return false;
            }
            self.painted.insert(*handle, color.to_string());
            true
        }
    }

    impl PageSurface for FakePage {
        fn fragments(&self) -> Vec<TextFragment<(u32, usize)>> {
            self.fragments
                .iter()
                .enumerate()
                .map(|(ordinal, text)| TextFragment::new(text.clone(), (self.generation, ordinal)))
                .collect()
        }
    }

    struct Harness {
        page: Arc<Mutex<FakePage>>,
        writer: ViewStateWriter,
        renders: mpsc::Sender<RenderEvent>,
        phases: watch::Receiver<AlignmentPhase>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn(parts: &[&str], settle: Duration) -> Harness {
        let page = Arc::new(Mutex::new(FakePage::with_text(parts)));
        let (writer, view) = ViewStateWriter::new(ViewState::default());
        let (renders, render_rx) = mpsc::channel(8);
        let orchestrator = AlignmentOrchestrator::new(Arc::clone(&page), view, render_rx, settle);
        assert_eq!(orchestrator.phase(), AlignmentPhase::Idle);
        let phases = orchestrator.phases();
        let task = tokio::spawn(orchestrator.run());
        Harness {
            page,
            writer,
            renders,
            phases,
            task,
        }
    }

    async fn wait_applied(phases: &mut watch::Receiver<AlignmentPhase>) {
        loop {
            phases.changed().await.unwrap();
            if *phases.borrow_and_update() == AlignmentPhase::Applied {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn render_event_paints_current_target_after_settling() {
        let mut h = spawn(&["Hello ", "  World", "!"], Duration::from_millis(300));
        h.writer
            .select_target(HighlightTarget::new("hello world", "yellow"));
        h.renders.send(RenderEvent { page: 1 }).await.unwrap();

        wait_applied(&mut h.phases).await;

        assert_eq!(h.page.lock().highlighted(), vec![0, 1]);
        h.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn latest_target_wins_while_pending() {
        let mut h = spawn(&["alpha ", "beta ", "gamma"], Duration::from_millis(500));
        h.writer.select_target(HighlightTarget::new("alpha", "yellow"));
        tokio::task::yield_now().await;
        h.writer.select_target(HighlightTarget::new("gamma", "cyan"));

        wait_applied(&mut h.phases).await;

        let page = h.page.lock();
        assert_eq!(page.highlighted(), vec![2]);
        assert_eq!(page.painted.get(&(1, 2)).map(String::as_str), Some("cyan"));
        drop(page);
        h.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn rerender_rebuilds_index_from_fresh_fragments() {
        let mut h = spawn(&["find ", "me"], Duration::ZERO);
        h.writer.select_target(HighlightTarget::new("find me", "yellow"));
        wait_applied(&mut h.phases).await;
        assert_eq!(h.page.lock().highlighted(), vec![0, 1]);

        h.page.lock().rerender(&["intro ", "fi", "nd m", "e"]);
        h.renders.send(RenderEvent { page: 1 }).await.unwrap();
        wait_applied(&mut h.phases).await;

        assert_eq!(h.page.lock().highlighted(), vec![1, 2, 3]);
        h.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn color_change_repaints_with_new_color() {
        let mut h = spawn(&["colored"], Duration::from_millis(100));
        h.writer.select_target(HighlightTarget::new("colored", "yellow"));
        wait_applied(&mut h.phases).await;

        h.writer.set_color("#00ff00");
        wait_applied(&mut h.phases).await;

        assert_eq!(
            h.page.lock().painted.get(&(1, 0)).map(String::as_str),
            Some("#00ff00")
        );
        h.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn zoom_change_realigns_rerendered_page() {
        let mut h = spawn(&["zoom ", "target"], Duration::from_millis(300));
        h.writer.select_target(HighlightTarget::new("target", "yellow"));
        wait_applied(&mut h.phases).await;

        h.page.lock().rerender(&["zo", "om tar", "get"]);
        h.writer.set_scale(2.0);
        wait_applied(&mut h.phases).await;

        let page = h.page.lock();
        assert_eq!(page.highlighted(), vec![1, 2]);
        assert!(page.painted.keys().all(|(generation, _)| *generation == 2));
        drop(page);
        h.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn page_change_realigns_new_page() {
        let mut h = spawn(&["first page"], Duration::from_millis(300));
        h.writer.select_target(HighlightTarget::new("needle", "yellow"));
        wait_applied(&mut h.phases).await;
        assert!(h.page.lock().highlighted().is_empty());

        h.page.lock().rerender(&["hay ", "needle ", "hay"]);
        h.writer.set_page(2);
        wait_applied(&mut h.phases).await;

        assert_eq!(h.page.lock().highlighted(), vec![1]);
        assert_eq!(h.writer.current().page, 2);
        h.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_within_one_settle_window_run_once() {
        let mut h = spawn(&["merge ", "me"], Duration::from_millis(300));
        h.writer.select_target(HighlightTarget::new("merge me", "yellow"));
        wait_applied(&mut h.phases).await;

        h.renders.send(RenderEvent { page: 1 }).await.unwrap();
        h.writer.set_color("magenta");
        wait_applied(&mut h.phases).await;

        // several settle windows later nothing else has run
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!h.phases.has_changed().unwrap());
        assert_eq!(*h.phases.borrow(), AlignmentPhase::Applied);

        let page = h.page.lock();
        assert_eq!(page.highlighted(), vec![0, 1]);
        assert!(page.painted.values().all(|color| color == "magenta"));
        drop(page);
        h.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_when_writer_is_dropped() {
        let h = spawn(&["text"], Duration::ZERO);
        drop(h.writer);
        h.task.await.unwrap();
    }

    #[test]
    fn align_now_without_target_clears_page() {
        let page = Arc::new(Mutex::new(FakePage::with_text(&["stale"])));
        page.lock().painted.insert((1, 0), "yellow".into());
        let (_writer, view) = ViewStateWriter::new(ViewState::default());
        let (_renders, render_rx) = mpsc::channel(1);
        let mut orchestrator =
            AlignmentOrchestrator::new(Arc::clone(&page), view, render_rx, Duration::ZERO);

        assert_eq!(orchestrator.align_now(), 0);
        assert!(page.lock().highlighted().is_empty());
    }

    #[test]
    fn writer_only_notifies_on_real_changes() {
        let (writer, mut view) = ViewStateWriter::new(ViewState::default());
        writer.set_page(1);
        writer.set_scale(1.0);
        writer.set_color("red");
        assert!(!view.has_changed().unwrap());

        writer.set_scale(10.0);
        assert!(view.has_changed().unwrap());
        assert_eq!(view.borrow_and_update().scale, MAX_SCALE);

        writer.set_page(0);
        assert_eq!(writer.current().page, 1);
        assert!(!view.has_changed().unwrap());
    }
}
