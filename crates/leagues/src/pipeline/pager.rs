use anyhow::Context;
use chrono::NaiveDate;
use common::error::PipelineError;
use common::types::HolderRecord;
use futures_util::future::try_join_all;
use std::time::Duration;

use super::store_traits::HolderStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagerSettings {
    pub page_size: u32,
    /// Page reads in flight at once.
    pub concurrency: usize,
    /// Pause between windows of page reads.
    pub delay: Duration,
}

impl From<&common::config::Pager> for PagerSettings {
    fn from(cfg: &common::config::Pager) -> Self {
        Self {
            page_size: cfg.page_size,
            concurrency: cfg.concurrency,
            delay: Duration::from_millis(cfg.delay_ms),
        }
    }
}

/// Drain every holder of `table` on `date`, in exact decimal balance order
/// (descending, address ascending on ties).
///
/// The store's page order is only required to be stable across pages; the
/// drained set is re-sorted here so balances that differ past float precision
/// still come out in order.
///
/// Stops once the declared count is covered or a short page signals the real
/// end of data (a count that went stale mid-drain is accepted). Any page error
/// fails the whole drain: classification never runs on partial data.
pub async fn fetch_all_holders<S: HolderStore + Sync>(
    store: &S,
    table: &str,
    date: NaiveDate,
    settings: PagerSettings,
) -> Result<Vec<HolderRecord>, PipelineError> {
    let declared = store
        .count_holders(table, date)
        .await
        .map_err(|e| PipelineError::fetch("holder count", &e))?;
    if declared == 0 {
        tracing::debug!(table, %date, "no holders for date");
        return Ok(Vec::new());
    }

    let page_size = u64::from(settings.page_size.max(1));
    let window = settings.concurrency.max(1) as u64;
    let mut holders = Vec::with_capacity(usize::try_from(declared).unwrap_or(0));
    let mut offset = 0_u64;
    let mut pages = 0_u64;

    'drain: loop {
        let offsets: Vec<u64> = (0..window)
            .map(|i| offset + i * page_size)
            .take_while(|o| *o < declared)
            .collect();

        let batch = try_join_all(offsets.iter().map(|&o| async move {
            store
                .fetch_holder_page(table, date, o, settings.page_size.max(1))
                .await
                .with_context(|| format!("{table} page at offset {o}"))
        }))
        .await
        .map_err(|e| PipelineError::fetch("holder page", &e))?;

        for page in batch {
            pages += 1;
            offset += page_size;
            let short = (page.len() as u64) < page_size;
            holders.extend(page);
            if short {
                break 'drain;
            }
        }

        if offset >= declared {
            break;
        }
        if !settings.delay.is_zero() {
            tokio::time::sleep(settings.delay).await;
        }
    }

    holders.sort_by(|a, b| {
        b.balance
            .cmp(&a.balance)
            .then_with(|| a.address.cmp(&b.address))
    });

    metrics::counter!("leagues_holder_pages_fetched_total").increment(pages);
    tracing::debug!(
        table,
        %date,
        declared,
        fetched = holders.len(),
        pages,
        "holder drain complete"
    );
    Ok(holders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory holder table with an optional lie in the declared count and
    /// an optional failing offset.
    struct FakeHolders {
        rows: Vec<HolderRecord>,
        declared: u64,
        fail_at: Option<u64>,
        calls: Mutex<Vec<(u64, u32)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeHolders {
        fn new(n: usize) -> Self {
            let rows = (0..n)
                .map(|i| HolderRecord {
                    address: format!("0x{i:04x}"),
                    is_contract: i % 5 == 0,
                    balance: Decimal::from(10_000 - i as i64),
                })
                .collect();
            Self {
                rows,
                declared: n as u64,
                fail_at: None,
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn offsets(&self) -> Vec<u64> {
            self.calls.lock().unwrap().iter().map(|(o, _)| *o).collect()
        }
    }

    impl HolderStore for FakeHolders {
        async fn holder_table_exists(&self, _table: &str) -> Result<bool> {
            Ok(true)
        }

        async fn count_holders(&self, _table: &str, _date: NaiveDate) -> Result<u64> {
            Ok(self.declared)
        }

        async fn fetch_holder_page(
            &self,
            _table: &str,
            _date: NaiveDate,
            offset: u64,
            limit: u32,
        ) -> Result<Vec<HolderRecord>> {
            self.calls.lock().unwrap().push((offset, limit));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_at == Some(offset) {
                anyhow::bail!("upstream 503");
            }
            let start = (offset as usize).min(self.rows.len());
            let end = (start + limit as usize).min(self.rows.len());
            Ok(self.rows[start..end].to_vec())
        }
    }

    fn settings(page_size: u32, concurrency: usize) -> PagerSettings {
        PagerSettings {
            page_size,
            concurrency,
            delay: Duration::ZERO,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()
    }

    #[tokio::test]
    async fn test_zero_count_returns_empty_without_paging() {
        let store = FakeHolders::new(0);
        let holders = fetch_all_holders(&store, "holders_abc", date(), settings(1000, 1))
            .await
            .unwrap();
        assert!(holders.is_empty());
        assert!(store.offsets().is_empty());
    }

    #[tokio::test]
    async fn test_drains_all_pages_in_order() {
        let store = FakeHolders::new(2500);
        let holders = fetch_all_holders(&store, "holders_abc", date(), settings(1000, 1))
            .await
            .unwrap();
        assert_eq!(holders.len(), 2500);
        assert_eq!(store.offsets(), vec![0, 1000, 2000]);
        assert_eq!(holders[0].address, "0x0000");
        assert_eq!(holders[2499].address, format!("0x{:04x}", 2499));
        assert!(holders.windows(2).all(|w| w[0].balance >= w[1].balance));
    }

    #[tokio::test]
    async fn test_exact_multiple_stops_at_declared_count() {
        let store = FakeHolders::new(2000);
        let holders = fetch_all_holders(&store, "holders_abc", date(), settings(1000, 1))
            .await
            .unwrap();
        assert_eq!(holders.len(), 2000);
        assert_eq!(store.offsets(), vec![0, 1000]);
    }

    #[tokio::test]
    async fn test_stale_count_short_page_is_accepted() {
        let mut store = FakeHolders::new(1500);
        store.declared = 3000;
        let holders = fetch_all_holders(&store, "holders_abc", date(), settings(1000, 1))
            .await
            .unwrap();
        assert_eq!(holders.len(), 1500);
        assert_eq!(store.offsets(), vec![0, 1000]);
    }

    #[tokio::test]
    async fn test_page_error_fails_whole_drain() {
        let mut store = FakeHolders::new(2500);
        store.fail_at = Some(1000);
        let err = fetch_all_holders(&store, "holders_abc", date(), settings(1000, 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "transient_fetch");
        assert!(err.to_string().contains("offset 1000"), "{err}");
    }

    #[tokio::test]
    async fn test_concurrent_windows_are_bounded_and_ordered() {
        let store = FakeHolders::new(4500);
        let holders = fetch_all_holders(&store, "holders_abc", date(), settings(500, 3))
            .await
            .unwrap();
        assert_eq!(holders.len(), 4500);
        assert!(store.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(store.max_in_flight.load(Ordering::SeqCst) > 1);
        let addrs: Vec<_> = holders.iter().map(|h| h.address.clone()).collect();
        let expected: Vec<_> = (0..4500).map(|i| format!("0x{i:04x}")).collect();
        assert_eq!(addrs, expected);
    }

    #[tokio::test]
    async fn test_sqlite_drain_orders_balances_past_float_precision() {
        use common::db::{holder_table_ddl, AsyncDb};

        let db = AsyncDb::open(":memory:").await.unwrap();
        db.call(|conn| {
            conn.execute_batch(&holder_table_ddl("holders_abc"))?;
            for (address, balance) in [
                ("0xa", "9007199254740992"),
                ("0xz", "9007199254740993"),
                ("0xb", "1.000000000000000001"),
                ("0xy", "1.000000000000000002"),
                ("0xc", "5"),
            ] {
                conn.execute(
                    "INSERT INTO holders_abc (address, is_contract, balance, date) VALUES (?1, 0, ?2, '2026-03-09')",
                    rusqlite::params![address, balance],
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();

        // Page size 1 puts every near-equal pair on separate pages.
        for page_size in [1, 2, 10] {
            let holders = fetch_all_holders(&db, "holders_abc", date(), settings(page_size, 2))
                .await
                .unwrap();
            let addrs: Vec<_> = holders.iter().map(|h| h.address.as_str()).collect();
            assert_eq!(addrs, vec!["0xz", "0xa", "0xc", "0xy", "0xb"], "page_size {page_size}");
            assert!(holders.windows(2).all(|w| w[0].balance > w[1].balance));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_windows() {
        let store = FakeHolders::new(3000);
        let cfg = PagerSettings {
            page_size: 1000,
            concurrency: 1,
            delay: Duration::from_millis(250),
        };
        let started = tokio::time::Instant::now();
        fetch_all_holders(&store, "holders_abc", date(), cfg).await.unwrap();
        // Two pauses between three windows; none after the last.
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }
}
