use crate::{
    backfill::{BackfillScheduler, FetchPlan, PageOutcome},
    config::EngineConfig,
    session::{Session, SessionContext},
    viewport::{ChartSurface, LogicalRange, ViewportPreserver},
};

use exchange::{
    AdapterError, Bar, BarQuery, HistoryProvider, StreamEvent, TickSource, Ticker, Timeframe,
    resilience,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use std::{sync::Arc, time::Duration};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    VisibleRangeChanged(LogicalRange),
    SwitchSession {
        ticker: Ticker,
        timeframe: Timeframe,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageKind {
    Initial,
    Backfill(Uuid),
}

struct PageResult {
    session_id: Uuid,
    kind: PageKind,
    response: Result<Vec<Bar>, AdapterError>,
}

struct ActiveSession {
    ctx: SessionContext,
    scheduler: BackfillScheduler,
    live: Option<mpsc::Receiver<StreamEvent>>,
}

/// Single-task driver tying the engine to its collaborators.
///
/// All series mutation happens on the task running [`ChartFeed::run`]; page
/// fetches run as spawned tasks and report back over a channel, tagged with the
/// session that issued them.
pub struct ChartFeed<P, T, S> {
    provider: Arc<P>,
    ticks: T,
    surface: S,
    config: EngineConfig,
    active: Option<ActiveSession>,
    pages_tx: mpsc::UnboundedSender<PageResult>,
    pages_rx: mpsc::UnboundedReceiver<PageResult>,
    outstanding: usize,
}

impl<P, T, S> ChartFeed<P, T, S>
where
    P: HistoryProvider,
    T: TickSource,
    S: ChartSurface,
{
    pub fn new(provider: P, ticks: T, surface: S, config: EngineConfig) -> Self {
        let (pages_tx, pages_rx) = mpsc::unbounded_channel();

        Self {
            provider: Arc::new(provider),
            ticks,
            surface,
            config,
            active: None,
            pages_tx,
            pages_rx,
            outstanding: 0,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.active.as_ref().map(|active| &active.ctx)
    }

    pub fn scheduler(&self) -> Option<&BackfillScheduler> {
        self.active.as_ref().map(|active| &active.scheduler)
    }

    pub async fn run(&mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        log::info!("Command channel closed, stopping feed");
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(page) = self.pages_rx.recv() => self.on_page_result(page),
                event = next_live_event(&mut self.active) => match event {
                    Some(event) => self.on_stream_event(event),
                    None => {
                        log::warn!("Live feed ended");
                        if let Some(active) = self.active.as_mut() {
                            active.live = None;
                        }
                    }
                },
            }
        }
    }

    /// Returns false once the feed should stop.
    pub fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::VisibleRangeChanged(range) => self.on_visible_range(range),
            Command::SwitchSession { ticker, timeframe } => self.switch_session(ticker, timeframe),
            Command::Shutdown => {
                log::info!("Shutting down feed");
                return false;
            }
        }
        true
    }

    /// Drops every piece of per-session state and starts loading the new view.
    ///
    /// Re-selecting the loaded view is a no-op. Re-selecting a view whose initial
    /// load has not landed yet restarts it without waiting for the retry delay.
    pub fn switch_session(&mut self, ticker: Ticker, timeframe: Timeframe) {
        if let Some(active) = &self.active
            && active.ctx.session.is_same_view(&ticker, timeframe)
            && active.ctx.is_ready()
        {
            return;
        }

        let session = Session::new(ticker, timeframe);
        log::info!("Switching to {session}");

        let live = self.ticks.subscribe(session.ticker.clone(), timeframe);
        self.spawn_initial_load(&session, None);

        self.active = Some(ActiveSession {
            ctx: SessionContext::new(session.clone(), &self.config),
            scheduler: BackfillScheduler::new(session, &self.config),
            live: Some(live),
        });
        self.surface.set_series(Vec::new());
    }

    pub fn on_visible_range(&mut self, range: LogicalRange) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let now = tokio::time::Instant::now().into_std();
        if let Some(plan) = active
            .scheduler
            .on_visible_range_change(&mut active.ctx, range, now)
        {
            self.spawn_backfill(plan);
        }
    }

    pub fn on_stream_event(&mut self, event: StreamEvent) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        if let Some(merged) = active.ctx.live.on_event(&mut active.ctx.store, event)
            && merged.changed()
        {
            self.surface.set_series(active.ctx.store.render_rows());
        }
    }

    /// Applies completed fetches until none are outstanding.
    pub async fn settle(&mut self) {
        while self.outstanding > 0 {
            let Some(page) = self.pages_rx.recv().await else {
                break;
            };
            self.on_page_result(page);
        }
    }

    fn on_page_result(&mut self, page: PageResult) {
        self.outstanding = self.outstanding.saturating_sub(1);

        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.ctx.id() != page.session_id {
            log::debug!("Discarding page from a previous session");
            return;
        }

        let shift = match page.kind {
            PageKind::Initial => {
                let len_before = active.ctx.store.len() as i64;
                let loaded = match &page.response {
                    Ok(bars) => active.ctx.complete_initial_load(bars),
                    Err(_) => false,
                };

                if !loaded {
                    let session = active.ctx.session.clone();
                    let delay = self.config.live_reconnect_delay();
                    match page.response {
                        Err(err) => log::error!(
                            "[{session}] initial load failed: {err}, retrying in {delay:?}"
                        ),
                        Ok(_) => log::warn!(
                            "[{session}] initial load returned no bars, retrying in {delay:?}"
                        ),
                    }
                    self.spawn_initial_load(&session, Some(delay));
                    return;
                }
                active.ctx.store.len() as i64 - len_before
            }
            PageKind::Backfill(request_id) => {
                match active
                    .scheduler
                    .on_page(&mut active.ctx, request_id, page.response)
                {
                    PageOutcome::Accepted { shift, .. } => shift,
                    _ => return,
                }
            }
        };

        self.surface.set_series(active.ctx.store.render_rows());
        if let Some(range) = ViewportPreserver::shift_after_prepend(&mut self.surface, shift) {
            active.ctx.record_shift(range);
        }
    }

    /// Fetches the newest page for `session`, retrying up to the failure threshold.
    ///
    /// With `first_delay` set the first attempt waits that long. The driver
    /// re-issues the load after a failed round, until the session changes.
    fn spawn_initial_load(&mut self, session: &Session, first_delay: Option<Duration>) {
        let query = BarQuery::latest(
            session.ticker.clone(),
            session.timeframe,
            self.config.initial_limit(),
        );
        let retries = self.config.failure_threshold.saturating_sub(1) as usize;
        let delays: Vec<Duration> =
            resilience::reconnect_backoff(self.config.live_reconnect_delay())
                .take(retries)
                .collect();
        let label = session.to_string();
        let provider = Arc::clone(&self.provider);

        self.spawn_fetch(session.id, PageKind::Initial, async move {
            let mut delays = delays.into_iter();
            if let Some(wait) = first_delay {
                tokio::time::sleep(wait).await;
            }

            loop {
                let response = provider.get_bars(query.clone()).await;
                if response.as_ref().is_ok_and(|bars| !bars.is_empty()) {
                    break response;
                }
                let Some(wait) = delays.next() else {
                    break response;
                };
                log::warn!("[{label}] initial load came back empty, retrying in {wait:?}");
                tokio::time::sleep(wait).await;
            }
        });
    }

    fn spawn_backfill(&mut self, plan: FetchPlan) {
        let FetchPlan {
            session_id,
            request_id,
            query,
            ..
        } = plan;
        let provider = Arc::clone(&self.provider);

        self.spawn_fetch(session_id, PageKind::Backfill(request_id), async move {
            provider.get_bars(query).await
        });
    }

    fn spawn_fetch<F>(&mut self, session_id: Uuid, kind: PageKind, fetch: F)
    where
        F: Future<Output = Result<Vec<Bar>, AdapterError>> + Send + 'static,
    {
        let output = self.pages_tx.clone();
        self.outstanding += 1;

        tokio::spawn(async move {
            let response = fetch.await;
            let _ = output.send(PageResult {
                session_id,
                kind,
                response,
            });
        });
    }
}

async fn next_live_event(active: &mut Option<ActiveSession>) -> Option<StreamEvent> {
    match active.as_mut().and_then(|active| active.live.as_mut()) {
        Some(live) => live.recv().await,
        None => std::future::pending().await,
    }
}
