//! Decision Engine
//!
//! Owns every per-symbol component and the open/closed trade state for the
//! symbols routed to it. Entries are decided on 1-minute candle close, open
//! trades are managed on every tick.
//!
//! All state is keyed by symbol; one engine is driven by one worker so
//! messages for a symbol are applied strictly in arrival order.

use chrono::{DateTime, NaiveDate};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::atr::AtrTracker;
use super::footprint::{FootprintBar, FootprintBuilder};
use super::guards::{AddOnTracker, ConsecutiveLossGuard, CooldownManager, DirectionalBiasGuard};
use super::inference::OrderFlowInferer;
use super::orderbook::OrderBookAnalyzer;
use super::pressure::PressureTracker;
use super::signals::{BarClass, PullbackLevels, SignalGenerator};
use super::stops::StopNormalizer;
use super::timeframe::TimeframeAggregator;
use super::trades::{EntryKind, ExitReason, StructureLevel, Trade};
use super::volume_profile::AuctionContext;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EngineEvent, TradeAction};
use crate::feed::FeedMessage;
use crate::persistence::{retry_with_backoff, StoreError, TradeStore};
use crate::types::{to_ticks, BookSnapshot, Candle, InstrumentKind, Ohlcv, Quote, Side, Tick};

/// A trade-state write that exhausted its retries
#[derive(Debug, Clone)]
enum PendingWrite {
    Save(Trade),
    Close {
        symbol: String,
        exit_price: f64,
        exit_ts: i64,
        reason: ExitReason,
        pnl: f64,
    },
}

impl PendingWrite {
    fn symbol(&self) -> &str {
        match self {
            PendingWrite::Save(t) => &t.symbol,
            PendingWrite::Close { symbol, .. } => symbol,
        }
    }
}

pub struct DecisionEngine {
    config: EngineConfig,
    store: Arc<dyn TradeStore>,
    events: Option<broadcast::Sender<EngineEvent>>,

    inferer: OrderFlowInferer,
    footprint: FootprintBuilder,
    atr: AtrTracker,
    auction: AuctionContext,
    htf: TimeframeAggregator,
    book: OrderBookAnalyzer,
    pressure: PressureTracker,
    signals: SignalGenerator,
    stops: StopNormalizer,

    bias_guard: DirectionalBiasGuard,
    loss_guard: ConsecutiveLossGuard,
    cooldown: CooldownManager,
    adds: AddOnTracker,

    open_trades: HashMap<String, Trade>,
    closed_trades: Vec<Trade>,
    watermarks: HashMap<String, i64>,
    levels: HashMap<String, Vec<StructureLevel>>,
    last_candle: HashMap<String, Ohlcv>,
    registered: HashSet<String>,
    pending: VecDeque<PendingWrite>,
}

impl DecisionEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TradeStore>,
        events: Option<broadcast::Sender<EngineEvent>>,
    ) -> Self {
        let tick = config.tick_size;
        Self {
            inferer: OrderFlowInferer::new(tick),
            footprint: FootprintBuilder::new(config.footprint.clone(), tick),
            atr: AtrTracker::new(config.atr.period),
            auction: AuctionContext::new(config.profile.clone(), tick),
            htf: TimeframeAggregator::new(
                config.timeframe.clone(),
                config.session_timezone,
                config.session_open,
            ),
            book: OrderBookAnalyzer::new(config.orderbook.clone(), tick),
            pressure: PressureTracker::new(config.pressure.clone()),
            signals: SignalGenerator::new(config.entry.pullback_pct),
            stops: StopNormalizer::new(config.stops.clone(), tick),
            bias_guard: DirectionalBiasGuard::new(&config.guards),
            loss_guard: ConsecutiveLossGuard::new(&config.guards),
            cooldown: CooldownManager::new(config.cooldown_ms()),
            adds: AddOnTracker::new(&config.guards),
            open_trades: HashMap::new(),
            closed_trades: Vec::new(),
            watermarks: HashMap::new(),
            levels: HashMap::new(),
            last_candle: HashMap::new(),
            registered: HashSet::new(),
            pending: VecDeque::new(),
            config,
            store,
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn open_trade(&self, symbol: &str) -> Option<&Trade> {
        self.open_trades.get(symbol)
    }

    pub fn open_trades(&self) -> impl Iterator<Item = &Trade> {
        self.open_trades.values()
    }

    /// Trades closed today, oldest first
    pub fn closed_trades(&self) -> &[Trade] {
        &self.closed_trades
    }

    pub fn watermark(&self, symbol: &str) -> Option<i64> {
        self.watermarks.get(symbol).copied()
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// New entries are refused while any trade-state write is outstanding
    pub fn entries_blocked(&self) -> bool {
        !self.pending.is_empty()
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn session_date(&self, ts_ms: i64) -> Option<NaiveDate> {
        DateTime::from_timestamp_millis(ts_ms)
            .map(|utc| utc.with_timezone(&self.config.session_timezone).date_naive())
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    pub fn rehydrate(&mut self, now_ms: i64) -> Result<usize, EngineError> {
        self.rehydrate_where(now_ms, |_| true)
    }

    /// Restore today's open and closed trades plus remembered levels for the
    /// symbols `owns` accepts. Must complete before live messages for those
    /// symbols are processed.
    pub fn rehydrate_where(&mut self, now_ms: i64, owns: impl Fn(&str) -> bool) -> Result<usize, EngineError> {
        let today = self.session_date(now_ms);

        let mut restored: HashMap<String, Trade> = HashMap::new();
        for trade in self.store.load_open_trades()? {
            if !owns(&trade.symbol) || !trade.is_open() {
                continue;
            }
            if self.session_date(trade.entry_ts) != today {
                info!(
                    "REHYDRATE skip {} {} @ {:.2}: opened on a prior session day",
                    trade.symbol, trade.side, trade.entry_price
                );
                continue;
            }
            match restored.get(&trade.symbol) {
                Some(existing) => {
                    error!(
                        "{}",
                        EngineError::invariant(&trade.symbol, "multiple OPEN trades persisted; keeping the latest")
                    );
                    if trade.entry_ts > existing.entry_ts {
                        restored.insert(trade.symbol.clone(), trade);
                    }
                }
                None => {
                    restored.insert(trade.symbol.clone(), trade);
                }
            }
        }

        for (symbol, trade) in restored {
            info!(
                "REHYDRATE {} {} @ {:.2} | stop {:.2} | target {:.2}",
                symbol, trade.side, trade.entry_price, trade.stop_price, trade.take_profit_price
            );
            for _ in 0..trade.adds {
                self.adds.register_add(&symbol);
            }
            self.open_trades.insert(symbol, trade);
        }

        let mut closed: Vec<Trade> = self
            .store
            .load_closed_trades()?
            .into_iter()
            .filter(|t| owns(&t.symbol))
            .filter(|t| t.exit_ts.is_some_and(|ts| self.session_date(ts) == today))
            .collect();
        closed.sort_by_key(|t| t.exit_ts);
        for trade in &closed {
            self.record_outcome(trade);
        }
        if !closed.is_empty() {
            info!("REHYDRATE {} closed trades replayed into guards", closed.len());
        }
        self.closed_trades = closed;

        for level in self.store.load_levels_for_all()? {
            if owns(&level.symbol) {
                self.levels.entry(level.symbol.clone()).or_default().push(level);
            }
        }

        Ok(self.open_trades.len())
    }

    /// Load the watermark and higher-timeframe history for a symbol. Runs
    /// once, before the symbol's first message is applied.
    pub fn register_symbol(&mut self, symbol: &str, kind: InstrumentKind) {
        if !self.registered.insert(symbol.to_string()) {
            return;
        }

        match self.store.get_last_candle_ts(symbol) {
            Ok(Some(ts)) => {
                let mark = self.watermarks.entry(symbol.to_string()).or_insert(ts);
                *mark = (*mark).max(ts);
            }
            Ok(None) => {}
            Err(e) => warn!("{}: watermark load failed: {}", symbol, e),
        }

        let minutes = self.htf.minutes();
        let limit = self.config.timeframe.sma_period + 10;
        match self.store.load_context_candles(symbol, minutes, limit) {
            Ok(candles) => self.htf.seed(symbol, &candles),
            Err(e) => warn!("{}: {}m context load failed: {}", symbol, minutes, e),
        }
        debug!("Registered {} ({:?})", symbol, kind);
    }

    // ------------------------------------------------------------------
    // Message entry points
    // ------------------------------------------------------------------

    pub fn on_message(&mut self, message: FeedMessage) -> Option<TradeAction> {
        match message {
            FeedMessage::Tick(tick) => self.on_tick(&tick),
            FeedMessage::CandleClosed(candle) => self.on_candle_close(&candle),
            FeedMessage::BookSnapshot(snapshot) => {
                self.on_book(snapshot);
                None
            }
        }
    }

    pub fn on_book(&mut self, snapshot: BookSnapshot) {
        self.retry_pending();
        if snapshot.symbol.is_empty() {
            warn!("{}", EngineError::Feed("book snapshot without symbol".into()));
            return;
        }
        if !self.registered.contains(&snapshot.symbol) {
            self.register_symbol(&snapshot.symbol, InstrumentKind::Market);
        }
        self.book.update(snapshot);
    }

    pub fn on_tick(&mut self, tick: &Tick) -> Option<TradeAction> {
        self.retry_pending();
        if !tick.is_valid() {
            warn!("{}", EngineError::Feed(format!("invalid tick for '{}' @ {}", tick.symbol, tick.price)));
            return None;
        }
        let symbol = tick.symbol.as_str();
        if !self.registered.contains(symbol) {
            self.register_symbol(symbol, tick.kind);
        }

        let totals = self.book.totals(symbol);
        if let Some((tbq, tsq)) = totals {
            self.pressure.update(symbol, tbq, tsq);
        }

        let quote = tick.quote.or_else(|| {
            let bid = self.book.best_bid(symbol)?;
            let ask = self.book.best_ask(symbol)?;
            Some(Quote { bid: bid.price, ask: ask.price })
        });
        if let Some(fill) = self.inferer.classify(tick, quote, totals) {
            self.footprint.on_fill(symbol, tick.kind, &fill, tick.ts_ms);
        }

        let vwap = self.auction.vwap(symbol).unwrap_or(tick.price);
        let rotated = self.footprint.check_rotation(symbol, tick.ts_ms, vwap);
        if let Some(bar) = &rotated {
            self.persist_footprint(bar);
        }

        let action = self.manage_open_trade(symbol, tick.price, tick.ts_ms);
        if action.is_some() {
            return action;
        }

        match rotated {
            Some(bar) if self.config.footprint.synthetic_candles && bar.tick_count > 0 => {
                let candle = Ohlcv {
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                    ts_ms: bar.end_ts_ms,
                };
                self.close_candle(symbol, tick.kind, candle)
            }
            _ => None,
        }
    }

    pub fn on_candle_close(&mut self, candle: &Candle) -> Option<TradeAction> {
        self.retry_pending();
        if candle.timeframe != 1 {
            debug!("{}: ignoring {}m candle", candle.symbol, candle.timeframe);
            return None;
        }
        if candle.symbol.is_empty() || !candle.is_valid() {
            warn!("{}", EngineError::Feed(format!("malformed candle for '{}'", candle.symbol)));
            return None;
        }
        if !self.registered.contains(&candle.symbol) {
            self.register_symbol(&candle.symbol, candle.kind);
        }
        self.close_candle(&candle.symbol, candle.kind, candle.bar())
    }

    /// Force-close open footprint bars and retry outstanding trade writes.
    /// Returns the number of writes still pending.
    pub fn flush(&mut self, now_ms: i64) -> usize {
        for bar in self.footprint.drain(now_ms) {
            self.persist_footprint(&bar);
        }

        let retries = self.config.persistence.max_retries;
        let base_ms = self.config.persistence.retry_base_ms;
        while let Some(write) = self.pending.front().cloned() {
            let store = Arc::clone(&self.store);
            let result = retry_with_backoff("pending trade write", retries, base_ms, || apply_write(store.as_ref(), &write));
            match result {
                Ok(()) | Err(StoreError::NoOpenTrade(_)) => {
                    self.pending.pop_front();
                }
                Err(e) => {
                    error!(
                        "CRITICAL: {} trade writes lost at shutdown ({}): {}",
                        self.pending.len(),
                        write.symbol(),
                        e
                    );
                    break;
                }
            }
        }
        self.pending.len()
    }

    // ------------------------------------------------------------------
    // Candle path
    // ------------------------------------------------------------------

    fn close_candle(&mut self, symbol: &str, kind: InstrumentKind, bar: Ohlcv) -> Option<TradeAction> {
        if let Some(mark) = self.watermarks.get(symbol) {
            if bar.ts_ms <= *mark {
                debug!("{}: discarding candle {} at or before watermark {}", symbol, bar.ts_ms, mark);
                return None;
            }
        }
        self.watermarks.insert(symbol.to_string(), bar.ts_ms);
        let store = Arc::clone(&self.store);
        let retries = self.config.persistence.max_retries;
        let base_ms = self.config.persistence.retry_base_ms;
        if let Err(e) = retry_with_backoff("update_last_candle_ts", retries, base_ms, || {
            store.update_last_candle_ts(symbol, bar.ts_ms)
        }) {
            error!("{}: watermark write failed: {}", symbol, e);
        }

        self.process_candle(symbol, kind, &bar)
    }

    fn process_candle(&mut self, symbol: &str, kind: InstrumentKind, bar: &Ohlcv) -> Option<TradeAction> {
        let atr = self.atr.update(symbol, bar);

        let mut hardened = None;
        let trade = self.open_trades.get_mut(symbol);
        if let (Some(atr), Some(trade)) = (atr, trade) {
            if let Some(stop) = self.stops.harden_on_candle(trade, bar.low, bar.high, atr) {
                let snapshot = trade.clone();
                debug!("STOP {} hardened to {:.2} on candle close", symbol, stop);
                self.persist_trade(&snapshot);
                self.emit(EngineEvent::StopUpdated {
                    symbol: symbol.to_string(),
                    trade_id: snapshot.id,
                    stop,
                    ts_ms: bar.ts_ms,
                });
                hardened = Some(TradeAction::UpdateStop {
                    symbol: symbol.to_string(),
                    new_stop: stop,
                });
            }
        }

        if let Some(htf_bar) = self.htf.on_candle(symbol, bar) {
            self.on_htf_close(symbol, &htf_bar);
        }

        let class = self.auction.on_candle(symbol, bar);
        self.last_candle.insert(symbol.to_string(), *bar);
        self.footprint.record_candle_volume(symbol, kind, bar.volume);

        if let Some(trade) = self.open_trades.get_mut(symbol) {
            if !self.adds.can_add(trade, bar.close) {
                return hardened;
            }
            self.adds.register_add(symbol);
            trade.adds += 1;
            let snapshot = trade.clone();
            info!(
                "ADD {} {} @ {:.2} | add #{} | entry {:.2}",
                symbol, snapshot.side, bar.close, snapshot.adds, snapshot.entry_price
            );
            self.persist_trade(&snapshot);
            self.emit(EngineEvent::AddOn {
                symbol: symbol.to_string(),
                trade_id: snapshot.id,
                price: bar.close,
                count: snapshot.adds,
                ts_ms: bar.ts_ms,
            });
            return Some(TradeAction::AddOn {
                symbol: symbol.to_string(),
                side: snapshot.side,
                price: bar.close,
                count: snapshot.adds,
            });
        }

        self.try_entry(symbol, kind, bar, class)
    }

    fn on_htf_close(&mut self, symbol: &str, htf_bar: &Ohlcv) {
        let minutes = self.htf.minutes();
        if let Err(e) = self.store.save_context_candle(symbol, minutes, htf_bar) {
            warn!("{}: {}m context save failed: {}", symbol, minutes, e);
        }

        let Some(levels) = self.htf.levels(symbol) else {
            return;
        };
        for (price, side) in [(levels.high, Side::Short), (levels.low, Side::Long)] {
            let level = StructureLevel {
                symbol: symbol.to_string(),
                price,
                side,
                created_ts: htf_bar.ts_ms,
                last_used_ts: None,
            };
            self.remember_level(level);
        }
    }

    fn remember_level(&mut self, level: StructureLevel) {
        let tick = self.config.tick_size;
        let known = self.levels.entry(level.symbol.clone()).or_default();
        let key = to_ticks(level.price, tick);
        let persisted = match known.iter_mut().find(|l| l.side == level.side && to_ticks(l.price, tick) == key) {
            Some(existing) => {
                existing.last_used_ts = existing.last_used_ts.max(level.last_used_ts);
                existing.clone()
            }
            None => {
                known.push(level.clone());
                level
            }
        };
        if let Err(e) = self.store.upsert_level(&persisted) {
            warn!("{}: level upsert failed: {}", persisted.symbol, e);
        }
    }

    /// Most recent higher-timeframe swing levels, else the most recently
    /// created remembered structure levels
    fn pullback_levels(&self, symbol: &str) -> PullbackLevels {
        if let Some(levels) = self.htf.levels(symbol) {
            return levels.into();
        }
        let latest = |side: Side| {
            self.levels
                .get(symbol)?
                .iter()
                .filter(|l| l.side == side)
                .max_by_key(|l| l.created_ts)
                .map(|l| l.price)
        };
        PullbackLevels {
            support: latest(Side::Long),
            resistance: latest(Side::Short),
        }
    }

    fn try_entry(&mut self, symbol: &str, kind: InstrumentKind, bar: &Ohlcv, class: BarClass) -> Option<TradeAction> {
        if self.entries_blocked() {
            warn!("REJECT {} entry: {} trade writes pending", symbol, self.pending.len());
            return None;
        }

        if kind != InstrumentKind::Index {
            let min_volume = self
                .footprint
                .calibrated_threshold(symbol)
                .map(|t| t * self.config.entry.footprint_volume_fraction)
                .unwrap_or(self.config.entry.min_volume);
            if bar.volume < min_volume {
                return None;
            }
        }

        let side = match class {
            BarClass::Igniting if bar.is_green() => Side::Long,
            BarClass::Igniting if bar.is_red() => Side::Short,
            BarClass::Igniting => return None,
            _ => [Side::Long, Side::Short]
                .into_iter()
                .find(|s| self.auction.allow_trade(symbol, bar, *s, class))?,
        };
        if class == BarClass::Igniting && !self.auction.allow_trade(symbol, bar, side, class) {
            return None;
        }

        if !self.htf.allow_trade(symbol, side) {
            debug!("REJECT {} {}: {}m bias {:?}", symbol, side, self.htf.minutes(), self.htf.bias(symbol));
            return None;
        }

        let mut used_level = None;
        if class != BarClass::Igniting {
            let levels = self.pullback_levels(symbol);
            match self.signals.get_signal(bar, &levels, self.htf.bias(symbol)) {
                Some(signal) if signal.side() == side => {}
                _ => return None,
            }
            used_level = match side {
                Side::Long => levels.support,
                Side::Short => levels.resistance,
            };
        }

        if !self.book.check_entry_imbalance(symbol, side) {
            debug!("REJECT {} {}: no book imbalance", symbol, side);
            return None;
        }
        if !self.loss_guard.allow_trade(symbol, side, bar.ts_ms) {
            info!("REJECT {} {}: consecutive losses", symbol, side);
            return None;
        }
        if !self.bias_guard.allow_trade(symbol, side) {
            info!(
                "REJECT {} {}: loss ratio {:.2}",
                symbol,
                side,
                self.bias_guard.loss_ratio(symbol, side).unwrap_or(0.0)
            );
            return None;
        }
        if self.cooldown.in_cooldown(symbol, bar.ts_ms) {
            info!("REJECT {} {}: cooldown after stop", symbol, side);
            return None;
        }
        let Some(atr) = self.atr.get_atr(symbol) else {
            debug!("REJECT {} {}: ATR warming up", symbol, side);
            return None;
        };

        let entry = bar.close;
        let (stop, entry_kind) = match class {
            BarClass::Igniting => (self.stops.igniting_stop(side, bar.low, bar.high), EntryKind::Igniting),
            _ => {
                let book_stop = self.book.dynamic_stop(symbol, side, bar.low, bar.high);
                (self.stops.combined_stop(entry, side, atr, Some(book_stop)), EntryKind::Standard)
            }
        };
        if (entry - stop) * side.sign() <= 0.0 {
            warn!("REJECT {} {}: stop {:.2} not beyond entry {:.2}", symbol, side, stop, entry);
            return None;
        }
        let target = self.stops.take_profit(entry, stop, side);

        let trade = Trade::open(symbol, side, entry, bar.ts_ms, stop, target, entry_kind);
        if let Err(e) = self.open_position(trade) {
            error!("{}", e);
            return None;
        }
        if let Some(price) = used_level {
            self.remember_level(StructureLevel {
                symbol: symbol.to_string(),
                price,
                side,
                created_ts: bar.ts_ms,
                last_used_ts: Some(bar.ts_ms),
            });
        }

        info!(
            "ENTRY {} {} @ {:.2} | stop {:.2} | target {:.2} | ATR {:.2} | {:?}",
            symbol, side, entry, stop, target, atr, entry_kind
        );
        Some(TradeAction::Enter {
            symbol: symbol.to_string(),
            side,
            price: entry,
            stop,
            target,
        })
    }

    fn open_position(&mut self, trade: Trade) -> Result<(), EngineError> {
        if self.open_trades.get(&trade.symbol).is_some_and(|t| t.is_open()) {
            return Err(EngineError::invariant(&trade.symbol, "entry while a trade is already open"));
        }
        self.persist_trade(&trade);
        self.emit(EngineEvent::TradeOpened(trade.clone()));
        self.open_trades.insert(trade.symbol.clone(), trade);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tick path
    // ------------------------------------------------------------------

    fn manage_open_trade(&mut self, symbol: &str, price: f64, ts_ms: i64) -> Option<TradeAction> {
        let trade = self.open_trades.get(symbol)?;
        let side = trade.side;

        if trade.stop_hit(price) {
            let reason = if trade.stop_tightened() {
                ExitReason::VolStop
            } else {
                ExitReason::StopLoss
            };
            return self.apply_exit(symbol, reason, price, ts_ms);
        }

        let exits = &self.config.exits;
        let early = ts_ms - trade.entry_ts < exits.min_hold_secs * 1000 || trade.pnl_pct_at(price) < exits.min_profit_pct;
        let hl_break = exits.candle_hl_break;
        let target_hit = trade.target_hit(price);
        if !early {
            if let Some(wall) = self.book.near_wall(symbol, side, price) {
                debug!("{}: wall at {:.2}", symbol, wall);
                return self.apply_exit(symbol, ExitReason::OrderBookWall, price, ts_ms);
            }
            if self.pressure.check_exhaustion_aggression(symbol, side) {
                return self.apply_exit(symbol, ExitReason::ExhaustionAggression, price, ts_ms);
            }
            if hl_break {
                let broken = self.last_candle.get(symbol).is_some_and(|c| match side {
                    Side::Long => price < c.low,
                    Side::Short => price > c.high,
                });
                if broken {
                    return self.apply_exit(symbol, ExitReason::CandleHlBreak, price, ts_ms);
                }
            }
            if target_hit && !self.pressure.pressure_supports(symbol, side) {
                return self.apply_exit(symbol, ExitReason::TakeProfit, price, ts_ms);
            }
        }

        self.trail_open_trade(symbol, price, ts_ms)
    }

    fn trail_open_trade(&mut self, symbol: &str, price: f64, ts_ms: i64) -> Option<TradeAction> {
        let atr = self.atr.get_atr(symbol);
        let trending = self.pressure.is_trending(symbol);
        let trade = self.open_trades.get_mut(symbol)?;
        let Some(atr) = atr else {
            trade.mark_price(price);
            return None;
        };
        let stop = self.stops.trail(trade, price, atr, trending)?;
        let snapshot = trade.clone();

        debug!("STOP {} trailed to {:.2} (best {:.2})", symbol, stop, snapshot.best_price);
        self.persist_trade(&snapshot);
        self.emit(EngineEvent::StopUpdated {
            symbol: symbol.to_string(),
            trade_id: snapshot.id,
            stop,
            ts_ms,
        });
        Some(TradeAction::UpdateStop {
            symbol: symbol.to_string(),
            new_stop: stop,
        })
    }

    /// Close the symbol's open trade and apply every consequence in one
    /// step: persisted close, guard outcomes, cooldown for stop-type
    /// reasons, pressure/add-on reset and the closed event. A symbol without
    /// an open trade is left untouched.
    pub fn apply_exit(&mut self, symbol: &str, reason: ExitReason, price: f64, ts_ms: i64) -> Option<TradeAction> {
        let mut trade = self.open_trades.remove(symbol)?;
        trade.close(price, ts_ms, reason);
        let pnl = trade.pnl.unwrap_or(0.0);

        info!(
            "EXIT {} {} @ {:.2} | {} | entry {:.2} | PnL {:+.2}",
            symbol, trade.side, price, reason, trade.entry_price, pnl
        );

        self.persist_write(PendingWrite::Close {
            symbol: symbol.to_string(),
            exit_price: price,
            exit_ts: ts_ms,
            reason,
            pnl,
        });
        self.record_outcome(&trade);
        self.pressure.reset(symbol);
        self.adds.reset(symbol);

        let action = TradeAction::Exit {
            symbol: symbol.to_string(),
            side: trade.side,
            price,
            pnl,
            reason,
        };
        self.emit(EngineEvent::TradeClosed(trade.clone()));
        self.closed_trades.push(trade);
        Some(action)
    }

    fn record_outcome(&mut self, trade: &Trade) {
        self.bias_guard.record_exit(trade);
        self.loss_guard.record_exit(trade);
        if let (Some(reason), Some(ts)) = (trade.reason, trade.exit_ts) {
            if reason.is_stop_type() {
                self.cooldown.record_stop(&trade.symbol, ts);
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn persist_footprint(&self, bar: &FootprintBar) {
        if let Err(e) = self.store.save_footprint(&bar.symbol, bar) {
            warn!("{}: footprint save failed: {}", bar.symbol, e);
        }
        self.emit(EngineEvent::FootprintClosed(bar.clone()));
    }

    fn persist_trade(&mut self, trade: &Trade) {
        self.persist_write(PendingWrite::Save(trade.clone()));
    }

    /// Retry with backoff; on exhaustion queue the write. Writes queue behind
    /// any already pending so the store sees them in order.
    fn persist_write(&mut self, write: PendingWrite) {
        if self.pending.is_empty() {
            let store = Arc::clone(&self.store);
            let retries = self.config.persistence.max_retries;
            let base_ms = self.config.persistence.retry_base_ms;
            match retry_with_backoff("trade write", retries, base_ms, || apply_write(store.as_ref(), &write)) {
                Ok(()) => return,
                Err(StoreError::NoOpenTrade(symbol)) => {
                    error!("{}", EngineError::invariant(&symbol, "close persisted without an open trade"));
                    return;
                }
                Err(e) => error!("CRITICAL: {} trade write failed after retries: {}", write.symbol(), e),
            }
        }
        self.enqueue(write);
    }

    fn enqueue(&mut self, write: PendingWrite) {
        let symbol = write.symbol().to_string();
        let replaces_last = matches!(
            (self.pending.back(), &write),
            (Some(PendingWrite::Save(prev)), PendingWrite::Save(next)) if prev.id == next.id
        );
        if replaces_last {
            self.pending.pop_back();
        }
        self.pending.push_back(write);
        warn!("{}: {} trade writes pending, new entries blocked", symbol, self.pending.len());
        self.emit(EngineEvent::PersistenceDegraded {
            symbol,
            pending: self.pending.len(),
        });
    }

    /// One attempt per queued write, in order, stopping at the first failure
    fn retry_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let before = self.pending.len();
        while let Some(write) = self.pending.front() {
            match apply_write(self.store.as_ref(), write) {
                Ok(()) => {}
                Err(StoreError::NoOpenTrade(symbol)) => {
                    error!("{}", EngineError::invariant(&symbol, "queued close has no open trade"));
                }
                Err(e) => {
                    debug!("Pending write for {} still failing: {}", write.symbol(), e);
                    break;
                }
            }
            self.pending.pop_front();
        }
        if self.pending.is_empty() {
            info!("Persistence restored: {} pending trade writes flushed", before);
        }
    }
}

fn apply_write(store: &dyn TradeStore, write: &PendingWrite) -> Result<(), StoreError> {
    match write {
        PendingWrite::Save(trade) => store.save_open_trade(trade),
        PendingWrite::Close {
            symbol,
            exit_price,
            exit_ts,
            reason,
            pnl,
        } => store.close_trade(symbol, *exit_price, *exit_ts, *reason, *pnl),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::trading_core::trades::TradeStatus;
    use crate::types::BookLevel;
    use chrono::{NaiveDate, TimeZone};

    const SYM: &str = "RELIANCE";

    fn ist_ms(day: u32, h: u32, m: u32) -> i64 {
        chrono_tz::Asia::Kolkata
            .from_local_datetime(&NaiveDate::from_ymd_opt(2025, 3, day).unwrap().and_hms_opt(h, m, 0).unwrap())
            .unwrap()
            .timestamp_millis()
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.profile.lookback = 30;
        config.timeframe.sma_period = 3;
        config.timeframe.confirm_candles = 2;
        config.footprint.calibrate = false;
        config.entry.min_volume = 500.0;
        config.persistence.max_retries = 0;
        config.persistence.retry_base_ms = 0;
        config
    }

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64, ts_ms: i64) -> Candle {
        Candle {
            symbol: SYM.to_string(),
            timeframe: 1,
            open,
            high,
            low,
            close,
            volume,
            ts_ms,
            kind: InstrumentKind::Market,
        }
    }

    fn tick(price: f64, ts_ms: i64) -> Tick {
        Tick {
            symbol: SYM.to_string(),
            price,
            qty: 10,
            ts_ms,
            quote: None,
            kind: InstrumentKind::Market,
        }
    }

    fn book() -> BookSnapshot {
        BookSnapshot {
            symbol: SYM.to_string(),
            ts_ms: 0,
            bids: vec![BookLevel { price: 99.95, qty: 10 }],
            asks: vec![BookLevel { price: 100.0, qty: 10 }],
            total_buy_qty: 3000,
            total_sell_qty: 1000,
        }
    }

    fn snapshot(bids: &[(f64, u64)], asks: &[(f64, u64)], tbq: u64, tsq: u64) -> BookSnapshot {
        BookSnapshot {
            symbol: SYM.to_string(),
            ts_ms: 0,
            bids: bids.iter().map(|&(price, qty)| BookLevel { price, qty }).collect(),
            asks: asks.iter().map(|&(price, qty)| BookLevel { price, qty }).collect(),
            total_buy_qty: tbq,
            total_sell_qty: tsq,
        }
    }

    /// Bullish 60m history in the store (swing low 99.0) and `book` applied
    fn seeded_engine(
        config: EngineConfig,
        book: BookSnapshot,
    ) -> (DecisionEngine, Arc<MemoryStore>, broadcast::Receiver<EngineEvent>) {
        let store = Arc::new(MemoryStore::new());
        for (i, close) in [100.0, 100.0, 100.0, 103.0, 104.0].iter().enumerate() {
            let bar = Ohlcv { open: *close, high: close + 1.0, low: close - 1.0, close: *close, volume: 10.0, ts_ms: i as i64 };
            store.save_context_candle(SYM, 60, &bar).unwrap();
        }
        let (tx, rx) = broadcast::channel(256);
        let mut engine = DecisionEngine::new(config, store.clone(), Some(tx));
        engine.rehydrate(ist_ms(10, 9, 15)).unwrap();
        engine.on_book(book);
        (engine, store, rx)
    }

    /// Bullish 60m history, a buy-heavy book and 29 quiet candles from
    /// 09:16; the next candle at 09:45 decides.
    fn armed_engine() -> (DecisionEngine, Arc<MemoryStore>, broadcast::Receiver<EngineEvent>) {
        armed_engine_with(test_config())
    }

    fn armed_engine_with(config: EngineConfig) -> (DecisionEngine, Arc<MemoryStore>, broadcast::Receiver<EngineEvent>) {
        let (mut engine, store, rx) = seeded_engine(config, book());
        for i in 0..29 {
            let ts = ist_ms(10, 9, 16 + i);
            assert!(engine.on_candle_close(&candle(100.0, 100.2, 99.8, 100.0, 100.0, ts)).is_none());
        }
        (engine, store, rx)
    }

    fn igniting() -> Candle {
        candle(100.0, 101.05, 99.95, 101.0, 5000.0, ist_ms(10, 9, 45))
    }

    fn entered() -> (DecisionEngine, Arc<MemoryStore>, broadcast::Receiver<EngineEvent>) {
        entered_with(test_config())
    }

    /// Long from 101.0, stop 99.9, target 104.3, entered at 09:45
    fn entered_with(config: EngineConfig) -> (DecisionEngine, Arc<MemoryStore>, broadcast::Receiver<EngineEvent>) {
        let (mut engine, store, rx) = armed_engine_with(config);
        assert!(matches!(engine.on_candle_close(&igniting()), Some(TradeAction::Enter { .. })));
        (engine, store, rx)
    }

    #[test]
    fn test_igniting_candle_opens_long() {
        let (mut engine, store, mut rx) = armed_engine();
        let action = engine.on_candle_close(&igniting());
        assert_eq!(
            action,
            Some(TradeAction::Enter {
                symbol: SYM.to_string(),
                side: Side::Long,
                price: 101.0,
                stop: 99.9,
                target: 104.3,
            })
        );

        let trade = engine.open_trade(SYM).unwrap();
        assert_eq!(trade.entry_kind, EntryKind::Igniting);
        assert_eq!(store.load_open_trades().unwrap().len(), 1);
        assert_eq!(store.get_last_candle_ts(SYM).unwrap(), Some(ist_ms(10, 9, 45)));

        let mut opened = false;
        while let Ok(event) = rx.try_recv() {
            opened |= matches!(event, EngineEvent::TradeOpened(_));
        }
        assert!(opened);
    }

    #[test]
    fn test_quiet_candles_do_not_enter() {
        let (mut engine, _store, _rx) = armed_engine();
        let quiet = candle(100.0, 100.2, 99.8, 100.0, 100.0, ist_ms(10, 9, 45));
        assert!(engine.on_candle_close(&quiet).is_none());
        assert!(engine.open_trade(SYM).is_none());
    }

    #[test]
    fn test_replayed_candle_is_discarded() {
        let (mut engine, store, _rx) = entered();
        let before = engine.open_trade(SYM).cloned();

        assert!(engine.on_candle_close(&igniting()).is_none());
        let mut older = igniting();
        older.ts_ms = ist_ms(10, 9, 30);
        assert!(engine.on_candle_close(&older).is_none());

        assert_eq!(engine.open_trade(SYM).cloned(), before);
        assert_eq!(engine.watermark(SYM), Some(ist_ms(10, 9, 45)));
        assert_eq!(store.load_open_trades().unwrap().len(), 1);
    }

    #[test]
    fn test_watermark_survives_restart() {
        let (_engine, store, _rx) = entered();
        let mut restarted = DecisionEngine::new(test_config(), store.clone(), None);
        restarted.rehydrate(ist_ms(10, 9, 50)).unwrap();
        assert!(restarted.open_trade(SYM).is_some());
        assert!(restarted.on_candle_close(&igniting()).is_none());
        assert_eq!(restarted.watermark(SYM), Some(ist_ms(10, 9, 45)));
    }

    #[test]
    fn test_second_signal_with_open_trade_adds_on_instead() {
        let (mut engine, store, _rx) = entered();
        let next = candle(101.0, 102.05, 100.95, 102.0, 5000.0, ist_ms(10, 9, 46));
        let action = engine.on_candle_close(&next);
        assert!(matches!(action, Some(TradeAction::AddOn { count: 1, .. })));

        let open: Vec<Trade> = store.load_open_trades().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].adds, 1);
        assert_eq!(engine.open_trades().count(), 1);

        let duplicate = Trade::open(SYM, Side::Short, 102.0, 0, 103.0, 99.0, EntryKind::Standard);
        assert!(matches!(engine.open_position(duplicate), Err(EngineError::Invariant { .. })));
        assert_eq!(engine.open_trade(SYM).map(|t| t.side), Some(Side::Long));
    }

    #[test]
    fn test_hard_stop_exit_applies_all_side_effects() {
        let (mut engine, store, mut rx) = entered();
        let exit_ts = ist_ms(10, 9, 45) + 10_000;
        let action = engine.on_tick(&tick(99.85, exit_ts));
        assert!(matches!(
            action,
            Some(TradeAction::Exit { reason: ExitReason::StopLoss, side: Side::Long, .. })
        ));

        assert!(engine.open_trade(SYM).is_none());
        assert_eq!(engine.closed_trades().len(), 1);
        let closed = store.load_closed_trades().unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, TradeStatus::Closed);
        assert_eq!(closed[0].reason, Some(ExitReason::StopLoss));
        assert!(store.load_open_trades().unwrap().is_empty());

        assert!(engine.cooldown.in_cooldown(SYM, exit_ts + 60_000));
        assert_eq!(engine.pressure.len(SYM), 0);
        assert_eq!(engine.bias_guard.loss_ratio(SYM, Side::Long), Some(1.0));

        // Exit fires once
        assert!(engine.apply_exit(SYM, ExitReason::StopLoss, 99.0, exit_ts + 1).is_none());
        let closes = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, EngineEvent::TradeClosed(_)))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_early_protection_then_take_profit() {
        let (mut engine, store, _rx) = entered();
        let entry_ts = ist_ms(10, 9, 45);

        // Target reached 30s in: only trailing runs
        let action = engine.on_tick(&tick(104.5, entry_ts + 30_000));
        assert_eq!(
            action,
            Some(TradeAction::UpdateStop { symbol: SYM.to_string(), new_stop: 103.15 })
        );
        assert!(engine.open_trade(SYM).is_some());
        assert_eq!(store.load_open_trades().unwrap()[0].stop_price, 103.15);

        // Past the minimum hold the target exits
        let action = engine.on_tick(&tick(104.5, entry_ts + 200_000));
        assert!(matches!(action, Some(TradeAction::Exit { reason: ExitReason::TakeProfit, .. })));
        assert!(!engine.cooldown.in_cooldown(SYM, entry_ts + 201_000));
    }

    #[test]
    fn test_trailed_stop_hit_is_vol_stop() {
        let (mut engine, _store, _rx) = entered();
        let entry_ts = ist_ms(10, 9, 45);
        engine.on_tick(&tick(104.5, entry_ts + 30_000));
        let action = engine.on_tick(&tick(103.0, entry_ts + 40_000));
        assert!(matches!(action, Some(TradeAction::Exit { reason: ExitReason::VolStop, .. })));
    }

    #[test]
    fn test_store_outage_queues_writes_and_blocks_entries() {
        let (mut engine, store, mut rx) = armed_engine();
        store.set_unavailable(true);

        assert!(matches!(engine.on_candle_close(&igniting()), Some(TradeAction::Enter { .. })));
        assert!(engine.open_trade(SYM).is_some());
        assert_eq!(engine.pending_writes(), 1);
        assert!(engine.entries_blocked());
        let degraded = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|e| matches!(e, EngineEvent::PersistenceDegraded { .. }));
        assert!(degraded);

        store.set_unavailable(false);
        engine.on_tick(&tick(101.0, ist_ms(10, 9, 45) + 1_000));
        assert!(!engine.entries_blocked());
        assert_eq!(store.load_open_trades().unwrap().len(), 1);
    }

    #[test]
    fn test_pending_close_follows_pending_open() {
        let (mut engine, store, _rx) = armed_engine();
        store.set_unavailable(true);
        engine.on_candle_close(&igniting());
        engine.on_tick(&tick(99.0, ist_ms(10, 9, 45) + 5_000));
        assert_eq!(engine.pending_writes(), 2);

        store.set_unavailable(false);
        assert_eq!(engine.flush(ist_ms(10, 9, 50)), 0);
        assert!(store.load_open_trades().unwrap().is_empty());
        assert_eq!(store.load_closed_trades().unwrap().len(), 1);
    }

    #[test]
    fn test_rehydrate_restores_only_todays_trades() {
        let store = Arc::new(MemoryStore::new());
        let today = Trade::open("A", Side::Long, 100.0, ist_ms(10, 10, 0), 98.0, 106.0, EntryKind::Standard);
        let stale = Trade::open("B", Side::Short, 50.0, ist_ms(9, 15, 0), 51.0, 47.0, EntryKind::Standard);
        let older = Trade::open("C", Side::Long, 10.0, ist_ms(10, 9, 30), 9.8, 10.6, EntryKind::Standard);
        let newer = Trade::open("C", Side::Short, 11.0, ist_ms(10, 11, 0), 11.2, 10.4, EntryKind::Standard);
        for t in [&today, &stale, &older, &newer] {
            store.save_open_trade(t).unwrap();
        }

        let mut engine = DecisionEngine::new(test_config(), store, None);
        let restored = engine.rehydrate(ist_ms(10, 12, 0)).unwrap();
        assert_eq!(restored, 2);
        assert_eq!(engine.open_trade("A").map(|t| t.id), Some(today.id));
        assert!(engine.open_trade("B").is_none());
        assert_eq!(engine.open_trade("C").map(|t| t.id), Some(newer.id));
    }

    #[test]
    fn test_rehydrate_replays_todays_losses_into_guards() {
        let store = Arc::new(MemoryStore::new());
        for exit_ts in [ist_ms(10, 10, 0), ist_ms(10, 10, 30)] {
            let t = Trade::open("A", Side::Long, 100.0, exit_ts - 60_000, 99.0, 103.0, EntryKind::Standard);
            store.save_open_trade(&t).unwrap();
            store.close_trade("A", 99.0, exit_ts, ExitReason::StopLoss, -1.0).unwrap();
        }

        let mut engine = DecisionEngine::new(test_config(), store, None);
        engine.rehydrate(ist_ms(10, 10, 31)).unwrap();
        assert_eq!(engine.closed_trades().len(), 2);
        assert!(!engine.loss_guard.allow_trade("A", Side::Long, ist_ms(10, 10, 32)));
        assert!(engine.loss_guard.allow_trade("A", Side::Short, ist_ms(10, 10, 32)));
        assert!(engine.cooldown.in_cooldown("A", ist_ms(10, 10, 32)));
    }

    #[test]
    fn test_other_timeframes_and_bad_candles_are_ignored() {
        let (mut engine, _store, _rx) = armed_engine();
        let mut five = igniting();
        five.timeframe = 5;
        assert!(engine.on_candle_close(&five).is_none());

        let mut broken = igniting();
        broken.high = 100.5;
        assert!(engine.on_candle_close(&broken).is_none());
        assert_eq!(engine.watermark(SYM), Some(ist_ms(10, 9, 44)));
    }

    #[test]
    fn test_non_positive_low_candle_is_rejected() {
        let mut config = test_config();
        config.profile.lookback = 2;
        let (mut engine, store, _rx) = armed_engine_with(config);

        for low in [-1.0e9, -5.0, 0.0] {
            let mut bad = igniting();
            bad.low = low;
            assert!(engine.on_candle_close(&bad).is_none());
        }
        assert_eq!(engine.watermark(SYM), Some(ist_ms(10, 9, 44)));
        assert_eq!(store.get_last_candle_ts(SYM).unwrap(), Some(ist_ms(10, 9, 44)));
        assert!(engine.open_trade(SYM).is_none());

        // Still alive and deciding on the next good candle
        assert!(engine.on_candle_close(&candle(100.0, 100.2, 99.8, 100.0, 100.0, ist_ms(10, 9, 45))).is_none());
        assert_eq!(engine.watermark(SYM), Some(ist_ms(10, 9, 45)));
    }

    #[test]
    fn test_extreme_range_candle_skips_profile() {
        let (mut engine, _store, _rx) = armed_engine();
        let wide = candle(100.0, 50_000.0, 1.0, 100.0, 100.0, ist_ms(10, 9, 45));
        assert!(engine.on_candle_close(&wide).is_none());
        assert_eq!(engine.watermark(SYM), Some(ist_ms(10, 9, 45)));
        // Full window, but a million ticks wide
        assert!(engine.auction.volume_profile(SYM).is_none());
    }

    #[test]
    fn test_wall_exit_takes_priority_over_target() {
        let (mut engine, store, _rx) = entered();
        let entry_ts = ist_ms(10, 9, 45);
        engine.on_book(snapshot(
            &[(104.45, 100)],
            &[(104.5, 100), (104.55, 100), (104.6, 100), (104.65, 100), (104.7, 2000)],
            3000,
            1000,
        ));

        // Past min hold, above target, one tick under the wall
        let action = engine.on_tick(&tick(104.65, entry_ts + 200_000));
        assert!(matches!(action, Some(TradeAction::Exit { reason: ExitReason::OrderBookWall, .. })));
        assert_eq!(store.load_closed_trades().unwrap()[0].reason, Some(ExitReason::OrderBookWall));
        assert!(!engine.cooldown.in_cooldown(SYM, entry_ts + 201_000));
    }

    #[test]
    fn test_wall_is_ignored_during_early_protection() {
        let (mut engine, _store, _rx) = entered();
        let entry_ts = ist_ms(10, 9, 45);
        engine.on_book(snapshot(
            &[(101.45, 100)],
            &[(101.5, 100), (101.55, 100), (101.6, 100), (101.65, 100), (101.7, 2000)],
            3000,
            1000,
        ));
        let action = engine.on_tick(&tick(101.65, entry_ts + 30_000));
        assert!(!matches!(action, Some(TradeAction::Exit { .. })));
        assert!(engine.open_trade(SYM).is_some());
    }

    #[test]
    fn test_exhaustion_exit_takes_priority_over_target() {
        let (mut engine, store, _rx) = entered();
        let entry_ts = ist_ms(10, 9, 45);

        // Sellers add four times what buyers add over ten readings
        for i in 0..10u64 {
            engine.on_book(snapshot(&[(101.45, 10)], &[(101.5, 10)], 3000 + i * 10, 1000 + i * 40));
            let action = engine.on_tick(&tick(101.5, entry_ts + 1_000 * (i as i64 + 1)));
            assert!(!matches!(action, Some(TradeAction::Exit { .. })));
        }

        let action = engine.on_tick(&tick(104.5, entry_ts + 200_000));
        assert!(matches!(
            action,
            Some(TradeAction::Exit { reason: ExitReason::ExhaustionAggression, .. })
        ));
        assert_eq!(store.load_closed_trades().unwrap()[0].reason, Some(ExitReason::ExhaustionAggression));
        assert!(engine.cooldown.in_cooldown(SYM, entry_ts + 201_000));
    }

    #[test]
    fn test_target_held_while_pressure_supports() {
        let (mut engine, _store, _rx) = entered();
        let entry_ts = ist_ms(10, 9, 45);

        // Buy totals keep climbing, sell totals flat
        for i in 0..4u64 {
            engine.on_book(snapshot(&[(101.45, 10)], &[(101.5, 10)], 3000 + i * 100, 1000));
            engine.on_tick(&tick(101.5, entry_ts + 1_000 * (i as i64 + 1)));
        }

        // Target reached but pressure still supports the long: trail (4 x ATR) instead
        let action = engine.on_tick(&tick(104.5, entry_ts + 200_000));
        assert_eq!(
            action,
            Some(TradeAction::UpdateStop { symbol: SYM.to_string(), new_stop: 102.7 })
        );
        assert!(engine.open_trade(SYM).is_some());

        // Sellers take over: the target is released
        engine.on_book(snapshot(&[(104.45, 10)], &[(104.5, 10)], 3300, 1400));
        let action = engine.on_tick(&tick(104.5, entry_ts + 210_000));
        assert!(matches!(action, Some(TradeAction::Exit { reason: ExitReason::TakeProfit, .. })));
        assert!(engine.open_trade(SYM).is_none());
    }

    #[test]
    fn test_candle_hl_break_exit_only_when_enabled() {
        let entry_ts = ist_ms(10, 9, 45);
        // Hardens the stop to 101.9 and becomes the reference candle
        let next = candle(102.0, 102.5, 102.0, 102.4, 500.0, ist_ms(10, 9, 46));
        let late_tick = tick(101.95, entry_ts + 200_000);

        let (mut engine, _store, _rx) = entered();
        engine.on_candle_close(&next);
        assert!(!matches!(engine.on_tick(&late_tick), Some(TradeAction::Exit { .. })));
        assert!(engine.open_trade(SYM).is_some());

        let mut config = test_config();
        config.exits.candle_hl_break = true;
        let (mut engine, store, _rx) = entered_with(config);
        engine.on_candle_close(&next);
        assert_eq!(engine.open_trade(SYM).map(|t| t.stop_price), Some(101.9));

        let action = engine.on_tick(&late_tick);
        assert!(matches!(action, Some(TradeAction::Exit { reason: ExitReason::CandleHlBreak, .. })));
        assert_eq!(store.load_closed_trades().unwrap()[0].reason, Some(ExitReason::CandleHlBreak));
        assert!(engine.cooldown.in_cooldown(SYM, entry_ts + 201_000));
    }

    #[test]
    fn test_hammer_at_htf_support_opens_standard_trade() {
        // Book bid far below the candle so the book stop is the wider one
        let book = snapshot(&[(98.5, 10)], &[(99.35, 10)], 3000, 1000);
        let (mut engine, store, _rx) = seeded_engine(test_config(), book);

        // Alternating wide and narrow quiet candles keep the profile balanced
        for i in 0..29 {
            let ts = ist_ms(10, 9, 16 + i);
            let quiet = if i % 2 == 0 {
                candle(100.0, 100.2, 99.8, 100.0, 100.0, ts)
            } else {
                candle(100.0, 100.05, 99.95, 100.0, 100.0, ts)
            };
            assert!(engine.on_candle_close(&quiet).is_none());
        }

        // Hammer tagging the 60m swing low at 99.0, below value
        let hammer_ts = ist_ms(10, 9, 45);
        let hammer = candle(99.25, 99.3, 99.0, 99.3, 600.0, hammer_ts);
        let action = engine.on_candle_close(&hammer);
        assert_eq!(
            action,
            Some(TradeAction::Enter {
                symbol: SYM.to_string(),
                side: Side::Long,
                price: 99.3,
                stop: 98.45,
                target: 101.85,
            })
        );
        assert_eq!(engine.open_trade(SYM).map(|t| t.entry_kind), Some(EntryKind::Standard));

        let levels = store.load_levels_for_all().unwrap();
        let used = levels
            .iter()
            .find(|l| l.symbol == SYM && l.side == Side::Long && l.price == 99.0)
            .unwrap();
        assert_eq!(used.last_used_ts, Some(hammer_ts));
    }

    #[test]
    fn test_flush_persists_open_footprint() {
        let (mut engine, store, _rx) = armed_engine();
        engine.on_tick(&tick(100.0, ist_ms(10, 9, 45)));
        engine.on_tick(&tick(99.95, ist_ms(10, 9, 45) + 500));
        assert!(store.footprints().is_empty());

        assert_eq!(engine.flush(ist_ms(10, 9, 46)), 0);
        let bars = store.footprints();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].tick_count, 2);
        assert_eq!(bars[0].volume, 20.0);
    }
}
