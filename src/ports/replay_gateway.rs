use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::model::{AccountInfo, Leg, OrderResult, OrderSide, PricePoint};
use crate::trade::execution::gateway::{ExecutionGateway, GatewayError, VenuePosition};

// Data structures that mirror the JSONL dump file
#[derive(Debug, Clone, Deserialize)]
struct DumpedQuote {
    bid: Decimal,
    ask: Decimal,
    #[serde(default)]
    last: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
struct DumpedDataEntry {
    timestamp: i64,
    prices: HashMap<String, DumpedQuote>,
}

#[derive(Debug, Default, Clone)]
struct PaperPosition {
    // signed lots per leg, buys positive
    primary: Decimal,
    secondary: Decimal,
    symbols: (String, String),
}

#[derive(Debug, Default)]
struct PaperBook {
    positions: HashMap<String, PaperPosition>,
    cash: Decimal,
}

/// Paper venue replaying a recorded quote dump. Orders fill completely at the
/// touch of the current cursor.
#[derive(Debug)]
pub struct ReplayGateway {
    data: Vec<DumpedDataEntry>,
    cursor: AtomicUsize,
    initial_balance: Decimal,
    book: Mutex<PaperBook>,
}

impl ReplayGateway {
    pub fn new<P: AsRef<Path>>(path: P, initial_balance: f64) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            GatewayError::Other(format!(
                "failed to open replay file {}: {}",
                path.display(),
                e
            ))
        })?;
        let reader = BufReader::new(file);
        let mut data = Vec::new();

        for line in reader.lines() {
            let line = line
                .map_err(|e| GatewayError::Other(format!("failed to read replay line: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DumpedDataEntry = serde_json::from_str(&line).map_err(|e| {
                GatewayError::Other(format!("failed to parse replay entry '{}': {}", line, e))
            })?;
            data.push(entry);
        }

        if data.is_empty() {
            return Err(GatewayError::Other(
                "Data dump file is empty or invalid".to_string(),
            ));
        }

        Ok(Self {
            data,
            cursor: AtomicUsize::new(0),
            initial_balance: Decimal::try_from(initial_balance).unwrap_or(Decimal::ZERO),
            book: Mutex::new(PaperBook::default()),
        })
    }

    // Advances the simulation by one step. Returns false if the end is reached.
    pub fn tick(&self) -> bool {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        if current_cursor < self.data.len() - 1 {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn current_timestamp(&self) -> Option<DateTime<Utc>> {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        self.data
            .get(current_cursor)
            .and_then(|e| Utc.timestamp_millis_opt(e.timestamp).single())
    }

    fn quote_at_cursor(&self, symbol: &str) -> Result<PricePoint, GatewayError> {
        let current_cursor = self.cursor.load(AtomicOrdering::SeqCst);
        let snapshot = self
            .data
            .get(current_cursor)
            .ok_or_else(|| GatewayError::Other("Cursor out of bounds".to_string()))?;
        let quote = snapshot.prices.get(symbol).ok_or_else(|| {
            GatewayError::Unavailable(format!(
                "Symbol '{}' not found in this data entry at cursor {}",
                symbol, current_cursor
            ))
        })?;
        let timestamp = Utc
            .timestamp_millis_opt(snapshot.timestamp)
            .single()
            .ok_or_else(|| GatewayError::Other(format!("bad timestamp {}", snapshot.timestamp)))?;
        Ok(PricePoint {
            symbol: symbol.to_string(),
            timestamp,
            bid: quote.bid,
            ask: quote.ask,
            last: quote.last.unwrap_or((quote.bid + quote.ask) / Decimal::TWO),
        })
    }

    fn book(&self) -> std::sync::MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ExecutionGateway for ReplayGateway {
    async fn get_quote(&self, symbol: &str) -> Result<PricePoint, GatewayError> {
        self.quote_at_cursor(symbol)
    }

    async fn place_order(
        &self,
        position_id: &str,
        symbol: &str,
        leg: Leg,
        side: OrderSide,
        volume: Decimal,
    ) -> Result<OrderResult, GatewayError> {
        if volume <= Decimal::ZERO {
            return Ok(OrderResult::rejected(format!("invalid volume {}", volume)));
        }
        let quote = self.quote_at_cursor(symbol)?;
        let (fill_price, signed) = match side {
            OrderSide::Buy => (quote.ask, volume),
            OrderSide::Sell => (quote.bid, -volume),
        };

        let mut book = self.book();
        book.cash -= signed * fill_price;
        let position = book.positions.entry(position_id.to_string()).or_default();
        match leg {
            Leg::Primary => {
                position.primary += signed;
                position.symbols.0 = symbol.to_string();
            }
            Leg::Secondary => {
                position.secondary += signed;
                position.symbols.1 = symbol.to_string();
            }
        }
        if position.primary.is_zero() && position.secondary.is_zero() {
            book.positions.remove(position_id);
        }

        log::info!(
            "[BACKTEST_FILL] position={} symbol={} side={:?} size={} price={}",
            position_id,
            symbol,
            side,
            volume,
            fill_price
        );

        Ok(OrderResult::filled(volume, Some(fill_price)))
    }

    async fn get_open_positions(&self) -> Result<Vec<VenuePosition>, GatewayError> {
        let book = self.book();
        let mut out: Vec<VenuePosition> = book
            .positions
            .iter()
            .map(|(id, pos)| VenuePosition {
                position_id: id.clone(),
                primary_lots: pos.primary.abs(),
                secondary_lots: pos.secondary.abs(),
            })
            .collect();
        out.sort_by(|a, b| a.position_id.cmp(&b.position_id));
        Ok(out)
    }

    async fn get_account_info(&self) -> Result<AccountInfo, GatewayError> {
        let (cash, legs): (Decimal, Vec<(String, Decimal)>) = {
            let book = self.book();
            let legs = book
                .positions
                .values()
                .flat_map(|pos| {
                    [
                        (pos.symbols.0.clone(), pos.primary),
                        (pos.symbols.1.clone(), pos.secondary),
                    ]
                })
                .filter(|(_, lots)| !lots.is_zero())
                .collect();
            (book.cash, legs)
        };
        let mut marked = Decimal::ZERO;
        for (symbol, lots) in legs {
            let quote = self.quote_at_cursor(&symbol)?;
            marked += lots * quote.mid();
        }
        let balance = self.initial_balance.to_f64().unwrap_or(0.0);
        let equity = (self.initial_balance + cash + marked).to_f64().unwrap_or(balance);
        Ok(AccountInfo {
            balance,
            equity,
            margin: 0.0,
        })
    }
}
