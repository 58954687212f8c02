use common::config::Token;
use common::types::CountSource;

use super::store_traits::HolderCounter;

/// TOTAL row counts plus where they came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub all_holders: i64,
    pub user_holders: i64,
    pub source: CountSource,
}

/// Replace the locally summed TOTAL with the explorer's holder count.
///
/// Never fails. Any counter error degrades to the local sums with
/// `CountSource::Fallback`. The explorer has no contract/user split, so an
/// external count is used for both fields.
pub async fn reconcile<C: HolderCounter + Sync>(
    counter: &C,
    token: &Token,
    local_all: i64,
    local_users: i64,
) -> Reconciled {
    let fallback = Reconciled {
        all_holders: local_all,
        user_holders: local_users,
        source: CountSource::Fallback,
    };

    let reconciled = match counter.holder_count(token).await {
        Ok(count) => match i64::try_from(count) {
            Ok(n) => Reconciled {
                all_holders: n,
                user_holders: n,
                source: CountSource::External,
            },
            Err(_) => {
                tracing::warn!(
                    ticker = %token.ticker,
                    count,
                    "external holder count out of range, using local sum"
                );
                fallback
            }
        },
        Err(e) => {
            tracing::warn!(
                ticker = %token.ticker,
                kind = e.kind(),
                error = %e,
                local_all,
                "external holder count unavailable, using local sum"
            );
            fallback
        }
    };
    metrics::counter!("leagues_total_source_total", "source" => reconciled.source.as_str())
        .increment(1);
    reconciled
}
