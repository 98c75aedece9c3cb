use crate::{
    config::EngineConfig,
    cursor::StepPolicy,
    series::SeriesStore,
    session::{Session, SessionContext},
    viewport::LogicalRange,
};

use exchange::{
    AdapterError, Bar, BarQuery, HistoryProvider, Timeframe,
    fetcher::{FetchRange, ReqError, RequestHandler},
};
use uuid::Uuid;

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillState {
    Idle,
    Triggered,
    Fetching,
    Merging,
    Backoff,
    /// Terminal for the session
    HistoryExhausted,
}

/// Consecutive rejected pages.
///
/// Hard failures (empty, ordering) count one each. Pages made only of
/// already-known bars, and gap rejections that pull the cursor back to the known
/// span, are soft misses and add up to one hard failure every `soft_per_failure`
/// occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounter {
    failures: u32,
    soft_misses: u32,
    threshold: u32,
    soft_per_failure: u32,
}

impl FailureCounter {
    pub fn new(threshold: u32, soft_per_failure: u32) -> Self {
        Self {
            failures: 0,
            soft_misses: 0,
            threshold: threshold.max(1),
            soft_per_failure: soft_per_failure.max(1),
        }
    }

    pub fn count(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.threshold
    }

    pub fn record_failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        self.failures
    }

    pub fn record_soft_miss(&mut self) -> u32 {
        self.soft_misses += 1;
        if self.soft_misses >= self.soft_per_failure {
            self.soft_misses = 0;
            self.record_failure();
        }
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.soft_misses = 0;
    }
}

/// A page request the driver should run against the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    pub session_id: Uuid,
    pub request_id: Uuid,
    pub requested_cursor: u64,
    pub query: BarQuery,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PageOutcome {
    /// Merged. `shift` is the net entry growth left of the viewport.
    Accepted {
        inserted: usize,
        shift: i64,
        gap_bars: Option<u64>,
    },
    Empty {
        failures: u32,
    },
    AlreadyKnown {
        failures: u32,
    },
    ViolatedOrdering {
        failures: u32,
    },
    ExcessiveGap {
        failures: u32,
        gap_bars: u64,
    },
    Exhausted,
    /// Response for a request this scheduler no longer tracks
    Stale,
}

/// Classification of a response before any state is touched.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Empty,
    AlreadyKnown,
    ViolatedOrdering { newest: u64, oldest_known: u64 },
    ExcessiveGap { oldest_known: u64, gap_bars: u64 },
    Accept { bars: Vec<Bar>, gap_bars: Option<u64> },
}

/// Runs the validation pipeline on one page.
///
/// Sorts and de-duplicates, drops anything at or after `requested_cursor`, splits
/// off bars the store already holds, then checks ordering and gap size against
/// the oldest known bar. A gap larger than the policy allows is still accepted
/// when the request was already issued from the closest retry position.
pub fn validate_page(
    mut bars: Vec<Bar>,
    requested_cursor: u64,
    store: &SeriesStore,
    policy: &StepPolicy,
) -> Verdict {
    bars.sort_by_key(|bar| bar.time);
    bars.dedup_by_key(|bar| bar.time);
    bars.retain(|bar| bar.time < requested_cursor);

    if bars.is_empty() {
        return Verdict::Empty;
    }

    bars.retain(|bar| !store.contains_bar(bar.time));

    let Some(newest) = bars.last().map(|bar| bar.time) else {
        return Verdict::AlreadyKnown;
    };
    let Some(oldest_known) = store.oldest_bar_time() else {
        return Verdict::Accept {
            bars,
            gap_bars: None,
        };
    };

    if newest >= oldest_known {
        return Verdict::ViolatedOrdering {
            newest,
            oldest_known,
        };
    }

    let step = store.interval().to_seconds();
    let missing = ((oldest_known - newest) / step).saturating_sub(1);

    if missing > policy.max_gap_bars {
        let closest_retry = oldest_known.saturating_sub(policy.gap_step.saturating_mul(step));
        if requested_cursor < closest_retry {
            return Verdict::ExcessiveGap {
                oldest_known,
                gap_bars: missing,
            };
        }
    }

    Verdict::Accept {
        bars,
        gap_bars: (missing > 0).then_some(missing),
    }
}

/// Decides when to page older history in and applies the results.
///
/// One scheduler serves one session and is dropped with it.
#[derive(Debug)]
pub struct BackfillScheduler {
    session: Session,
    proximity_factor: f64,
    edge_epsilon_bars: f64,
    cooldown: Duration,
    max_concurrent: usize,
    page_limit: usize,
    overshoot_bars: u64,
    policy: StepPolicy,
    requests: RequestHandler,
    state: BackfillState,
    last_trigger: Option<Instant>,
}

impl BackfillScheduler {
    pub fn new(session: Session, config: &EngineConfig) -> Self {
        Self {
            policy: config.policy_for(session.timeframe),
            session,
            proximity_factor: config.proximity_factor,
            edge_epsilon_bars: config.edge_epsilon_bars,
            cooldown: config.cooldown(),
            max_concurrent: config.max_concurrent_backfills,
            page_limit: config.page_limit(),
            overshoot_bars: config.overshoot_bars,
            requests: RequestHandler::new(),
            state: BackfillState::Idle,
            last_trigger: None,
        }
    }

    pub fn state(&self) -> BackfillState {
        self.state
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == BackfillState::HistoryExhausted
    }

    pub fn in_flight(&self) -> usize {
        self.requests.pending_count()
    }

    pub fn policy(&self) -> &StepPolicy {
        &self.policy
    }

    fn timeframe(&self) -> Timeframe {
        self.session.timeframe
    }

    /// Trigger test, run on every visible-range change.
    pub fn on_visible_range_change(
        &mut self,
        ctx: &mut SessionContext,
        range: LogicalRange,
        now: Instant,
    ) -> Option<FetchPlan> {
        let previous = ctx.last_range.replace(range);

        if !ctx.is_ready() || self.is_exhausted() {
            return None;
        }

        let width = range.width();
        if width <= 0.0 {
            return None;
        }

        let near_left_edge = range.from < width * self.proximity_factor;
        let moved_left = previous.is_some_and(|prev| range.from < prev.from);
        let at_edge = range.from <= self.edge_epsilon_bars;

        if !near_left_edge || !(moved_left || at_edge) {
            return None;
        }

        if let Some(last) = self.last_trigger
            && now.saturating_duration_since(last) < self.cooldown
        {
            return None;
        }

        self.request_page(ctx, now)
    }

    /// Issues the next page request regardless of viewport geometry.
    ///
    /// Still honors readiness, exhaustion, the concurrency bound and the
    /// duplicate-cursor guard.
    pub fn request_page(&mut self, ctx: &mut SessionContext, now: Instant) -> Option<FetchPlan> {
        if !ctx.is_ready() || self.is_exhausted() {
            return None;
        }
        if self.requests.pending_count() >= self.max_concurrent {
            return None;
        }

        let cursor = ctx.cursor.position()?;
        self.last_trigger = Some(now);

        let overshoot = self.timeframe().to_seconds().saturating_mul(self.overshoot_bars);
        let end_time = cursor.saturating_sub(overshoot);

        let request_id = match self.requests.add_request(FetchRange::Before { cursor, end_time }) {
            Ok(id) => id,
            Err(ReqError::Overlaps) => {
                log::debug!("[{}] page before {cursor} already in flight", self.session);
                return None;
            }
            Err(err) => {
                log::warn!("[{}] could not track page request: {err}", self.session);
                return None;
            }
        };

        self.transition(BackfillState::Triggered);
        self.transition(BackfillState::Fetching);
        log::debug!(
            "[{}] backfill fired: before {end_time} (cursor {cursor}), {} in flight",
            self.session,
            self.requests.pending_count()
        );

        Some(FetchPlan {
            session_id: self.session.id,
            request_id,
            requested_cursor: cursor,
            query: BarQuery::before(
                self.session.ticker.clone(),
                self.timeframe(),
                end_time,
                self.page_limit,
            ),
        })
    }

    /// Validates a completed page and applies it to the session.
    ///
    /// Provider errors are handled like an empty page.
    pub fn on_page(
        &mut self,
        ctx: &mut SessionContext,
        request_id: Uuid,
        response: Result<Vec<Bar>, AdapterError>,
    ) -> PageOutcome {
        let Some(range) = self.requests.get(request_id) else {
            return PageOutcome::Stale;
        };

        if self.is_exhausted() {
            self.settle(request_id, None);
            return PageOutcome::Exhausted;
        }

        let bars = response.unwrap_or_else(|err| {
            log::debug!("[{}] page fetch failed: {err}", self.session);
            Vec::new()
        });

        self.transition(BackfillState::Merging);

        let requested_cursor = range.cursor();
        let verdict = validate_page(bars, requested_cursor, &ctx.store, &self.policy);

        let outcome = match verdict {
            Verdict::Accept { bars, gap_bars } => {
                self.settle(request_id, None);
                return self.accept(ctx, &bars, gap_bars);
            }
            Verdict::Empty => {
                self.settle(request_id, Some("No data received"));
                let failures = ctx.failures.record_failure();
                if !ctx.failures.is_exhausted() {
                    ctx.cursor
                        .step_back(self.policy.empty_step.saturating_mul(u64::from(failures)));
                }
                PageOutcome::Empty { failures }
            }
            Verdict::AlreadyKnown => {
                self.settle(request_id, None);
                let failures = ctx.failures.record_soft_miss();
                ctx.cursor.step_back(1);
                PageOutcome::AlreadyKnown { failures }
            }
            Verdict::ViolatedOrdering {
                newest,
                oldest_known,
            } => {
                self.settle(request_id, Some("Page overlaps known history"));
                log::debug!(
                    "[{}] page reaches {newest}, past oldest known {oldest_known}",
                    self.session
                );
                let failures = ctx.failures.record_failure();
                ctx.cursor.step_back(self.policy.ordering_step);
                PageOutcome::ViolatedOrdering { failures }
            }
            Verdict::ExcessiveGap {
                oldest_known,
                gap_bars,
            } => {
                self.settle(request_id, Some("Page leaves excessive gap"));
                let failures = ctx.failures.record_soft_miss();
                ctx.cursor.step_closer(oldest_known, self.policy.gap_step);
                PageOutcome::ExcessiveGap { failures, gap_bars }
            }
        };

        self.transition(BackfillState::Backoff);

        if ctx.failures.is_exhausted() {
            self.transition(BackfillState::HistoryExhausted);
            log::info!(
                "[{}] no further history after {} failed pages",
                self.session,
                ctx.failures.count()
            );
            return PageOutcome::Exhausted;
        }

        log::debug!(
            "[{}] page rejected: {outcome:?}, cursor now {:?}",
            self.session,
            ctx.cursor.position()
        );
        outcome
    }

    fn accept(
        &mut self,
        ctx: &mut SessionContext,
        bars: &[Bar],
        gap_bars: Option<u64>,
    ) -> PageOutcome {
        let len_before = ctx.store.len() as i64;

        let inserted = ctx.store.merge(bars);
        ctx.placeholders.reconcile(&mut ctx.store);

        if let Some(oldest) = ctx.store.oldest_bar_time() {
            ctx.cursor.advance(oldest);
        }
        ctx.failures.reset();

        let shift = ctx.store.len() as i64 - len_before;

        if let Some(gap) = gap_bars {
            log::info!(
                "[{}] accepted {inserted} bars across a {gap}-bar historical gap",
                self.session
            );
        } else {
            log::info!("[{}] accepted {inserted} older bars", self.session);
        }

        let next = if self.requests.pending_count() > 0 {
            BackfillState::Fetching
        } else {
            BackfillState::Idle
        };
        self.transition(next);

        PageOutcome::Accepted {
            inserted,
            shift,
            gap_bars,
        }
    }

    fn settle(&mut self, request_id: Uuid, failure: Option<&str>) {
        let settled = match failure {
            None => self.requests.mark_completed(request_id),
            Some(reason) => self.requests.mark_failed(request_id, reason),
        };
        if let Err(err) = settled {
            log::warn!("[{}] {err}", self.session);
        }
    }

    fn transition(&mut self, next: BackfillState) {
        if self.state == next {
            return;
        }
        log::debug!("[{}] backfill {:?} -> {:?}", self.session, self.state, next);
        self.state = next;
    }
}

/// Pages history in without viewport involvement, for at most `max_attempts`
/// requests or until history is exhausted.
///
/// Returns the last outcome, or `None` if no request could be issued.
pub async fn backfill_bounded<P: HistoryProvider>(
    provider: &P,
    ctx: &mut SessionContext,
    scheduler: &mut BackfillScheduler,
    max_attempts: usize,
) -> Option<PageOutcome> {
    let mut last = None;

    for _ in 0..max_attempts {
        let now = tokio::time::Instant::now().into_std();
        let Some(plan) = scheduler.request_page(ctx, now) else {
            break;
        };

        let response = provider.get_bars(plan.query).await;
        let outcome = scheduler.on_page(ctx, plan.request_id, response);
        last = Some(outcome);

        if outcome == PageOutcome::Exhausted {
            break;
        }
    }

    last
}
