//! Durable file-backed store
//!
//! Trade state, levels, watermarks and context candles live in a single
//! zstd-compressed JSON snapshot (`state.json.zst`) rewritten through a temp
//! file and rename after every write. Footprint bars are appended to
//! `footprints.jsonl`, one line per (symbol, bar start).
//!
//! Every trade write, trailing-stop updates included, re-encodes and rewrites
//! the whole snapshot while holding the one store lock, so all workers sharing
//! a `FileStore` serialize on it. Write cost grows with the number of stored
//! trades and context candles.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use super::memory::StoreState;
use super::{StoreError, StoreResult, TradeStore};
use crate::trading_core::footprint::FootprintBar;
use crate::trading_core::trades::{ExitReason, StructureLevel, Trade, TradeStatus};
use crate::types::Ohlcv;

const STATE_FILE: &str = "state.json.zst";
const FOOTPRINT_FILE: &str = "footprints.jsonl";
const ZSTD_LEVEL: i32 = 3;

/// Identity of a footprint line; the rest of the bar is ignored
#[derive(Deserialize)]
struct FootprintKey {
    symbol: String,
    ts_ms: i64,
}

fn footprint_key(line: &str) -> Option<(String, i64)> {
    serde_json::from_str::<FootprintKey>(line)
        .ok()
        .map(|k| (k.symbol, k.ts_ms))
}

pub struct FileStore {
    dir: PathBuf,
    state: Mutex<StoreState>,
    /// (symbol, bar start) of every line in the footprint log
    footprints: Mutex<HashSet<(String, i64)>>,
}

impl FileStore {
    /// Open (or create) a store rooted at `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data dir {}", dir.display()))?;

        let path = dir.join(STATE_FILE);
        let state = if path.exists() {
            let compressed = fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let json = zstd::decode_all(&compressed[..])
                .with_context(|| format!("Failed to decompress {}", path.display()))?;
            let state: StoreState = serde_json::from_slice(&json)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            info!(
                "Loaded store: {} trades, {} levels, {} watermarks",
                state.trades.len(),
                state.levels.len(),
                state.watermarks.len()
            );
            state
        } else {
            StoreState::default()
        };

        let footprint_path = dir.join(FOOTPRINT_FILE);
        let footprints: HashSet<(String, i64)> = if footprint_path.exists() {
            fs::read_to_string(&footprint_path)
                .with_context(|| format!("Failed to read {}", footprint_path.display()))?
                .lines()
                .filter_map(footprint_key)
                .collect()
        } else {
            HashSet::new()
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(state),
            footprints: Mutex::new(footprints),
        })
    }

    fn write_snapshot(&self, state: &StoreState) -> StoreResult<()> {
        let json = serde_json::to_vec(state)?;
        let compressed = zstd::encode_all(&json[..], ZSTD_LEVEL)?;
        let tmp = self.dir.join(format!("{}.tmp", STATE_FILE));
        fs::write(&tmp, compressed)?;
        fs::rename(&tmp, self.dir.join(STATE_FILE))?;
        Ok(())
    }

    /// Apply `f` and persist the full snapshot before releasing the lock.
    /// One call is one whole-file rewrite; callers are not batched.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("file store poisoned".into()))?;
        let out = f(&mut state)?;
        self.write_snapshot(&state)?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> StoreResult<T> {
        let state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("file store poisoned".into()))?;
        Ok(f(&state))
    }
}

impl TradeStore for FileStore {
    fn save_open_trade(&self, trade: &Trade) -> StoreResult<()> {
        self.mutate(|s| {
            s.save_open_trade(trade);
            Ok(())
        })
    }

    fn close_trade(
        &self,
        symbol: &str,
        exit_price: f64,
        exit_ts: i64,
        reason: ExitReason,
        pnl: f64,
    ) -> StoreResult<()> {
        self.mutate(|s| s.close_trade(symbol, exit_price, exit_ts, reason, pnl))
    }

    fn load_open_trades(&self) -> StoreResult<Vec<Trade>> {
        self.read(|s| s.trades_with(TradeStatus::Open))
    }

    fn load_closed_trades(&self) -> StoreResult<Vec<Trade>> {
        self.read(|s| s.trades_with(TradeStatus::Closed))
    }

    fn get_last_candle_ts(&self, symbol: &str) -> StoreResult<Option<i64>> {
        self.read(|s| s.watermarks.get(symbol).copied())
    }

    fn update_last_candle_ts(&self, symbol: &str, ts: i64) -> StoreResult<()> {
        self.mutate(|s| {
            s.update_last_candle_ts(symbol, ts);
            Ok(())
        })
    }

    fn upsert_level(&self, level: &StructureLevel) -> StoreResult<()> {
        self.mutate(|s| {
            s.upsert_level(level);
            Ok(())
        })
    }

    fn load_levels_for_all(&self) -> StoreResult<Vec<StructureLevel>> {
        self.read(|s| s.levels.clone())
    }

    fn save_footprint(&self, _symbol: &str, bar: &FootprintBar) -> StoreResult<()> {
        let mut keys = self
            .footprints
            .lock()
            .map_err(|_| StoreError::Unavailable("footprint log poisoned".into()))?;
        let key = (bar.symbol.clone(), bar.ts_ms);
        let path = self.dir.join(FOOTPRINT_FILE);

        // A re-saved bar replaces its earlier line
        if keys.contains(&key) {
            let kept: String = fs::read_to_string(&path)?
                .lines()
                .filter(|l| footprint_key(l).as_ref() != Some(&key))
                .map(|l| format!("{}\n", l))
                .collect();
            let tmp = self.dir.join(format!("{}.tmp", FOOTPRINT_FILE));
            fs::write(&tmp, kept)?;
            fs::rename(&tmp, &path)?;
        }

        let mut line = serde_json::to_vec(bar)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        keys.insert(key);
        Ok(())
    }

    fn save_context_candle(&self, symbol: &str, timeframe: u32, candle: &Ohlcv) -> StoreResult<()> {
        self.mutate(|s| {
            s.save_context_candle(symbol, timeframe, candle);
            Ok(())
        })
    }

    fn load_context_candles(&self, symbol: &str, timeframe: u32, limit: usize) -> StoreResult<Vec<Ohlcv>> {
        self.read(|s| s.load_context_candles(symbol, timeframe, limit))
    }
}
