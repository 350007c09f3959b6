use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;

use tokio::sync::RwLock;

use fleet_api::{EntryFields, PositionStore, StoreError};

// ═══════════════════════════════════════════════════════════════
//  MemoryPositionStore
// ═══════════════════════════════════════════════════════════════

/// One persisted position row.
#[derive(Debug, Clone)]
pub struct PositionRow {
    pub bus_id: String,
    pub timestamp: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kph: f64,
}

/// In-memory ring-buffer position store. Keeps a bounded history
/// plus the last known row per vehicle.
pub struct MemoryPositionStore {
    inner: RwLock<StoreInner>,
    max_rows: usize,
}

struct StoreInner {
    rows: VecDeque<PositionRow>,
    last_known: HashMap<String, PositionRow>,
}

impl MemoryPositionStore {
    pub fn new(max_rows: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                rows: VecDeque::with_capacity(max_rows.min(65536)),
                last_known: HashMap::new(),
            }),
            max_rows,
        }
    }

    pub async fn row_count(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    pub async fn last_known(&self, bus_id: &str) -> Option<PositionRow> {
        self.inner.read().await.last_known.get(bus_id).cloned()
    }
}

impl PositionStore for MemoryPositionStore {
    fn insert_position(
        &self,
        bus_id: &str,
        ts: i64,
        lat: f64,
        lon: f64,
        speed_kph: f64,
        _raw_fields: &EntryFields,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let row = PositionRow {
            bus_id: bus_id.to_string(),
            timestamp: ts,
            latitude: lat,
            longitude: lon,
            speed_kph,
        };
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            if inner.rows.len() >= self.max_rows {
                inner.rows.pop_front();
            }
            inner.last_known.insert(row.bus_id.clone(), row.clone());
            inner.rows.push_back(row);
            Ok(())
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
