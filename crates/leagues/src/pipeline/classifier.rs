use common::error::PipelineError;
use common::types::{validate_ladder, HolderRecord, LeagueDefinition, MatchMode};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rung {
    def: LeagueDefinition,
    /// Exclusive upper bound for half-open matching; `None` is unbounded.
    upper: Option<Decimal>,
}

/// Validated league ladder, highest threshold first, catch-all last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeagueLadder {
    rungs: Vec<Rung>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketCounts {
    pub all_holders: i64,
    pub user_holders: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTally {
    pub name: String,
    pub min_percentage: Decimal,
    pub counts: BucketCounts,
}

/// Per-bucket totals in ladder order. Never contains TOTAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub buckets: Vec<BucketTally>,
}

impl Classification {
    pub fn classified_all(&self) -> i64 {
        self.buckets.iter().map(|b| b.counts.all_holders).sum()
    }

    pub fn classified_users(&self) -> i64 {
        self.buckets.iter().map(|b| b.counts.user_holders).sum()
    }
}

fn rung(name: &str, tag: &str, min: Decimal) -> LeagueDefinition {
    LeagueDefinition {
        name: name.to_string(),
        tag: tag.to_string(),
        min_percentage: min,
        max_percentage: None,
    }
}

impl LeagueLadder {
    pub fn new(defs: Vec<LeagueDefinition>) -> Result<Self, PipelineError> {
        validate_ladder(&defs)?;
        Ok(Self::from_ordered(defs))
    }

    /// Upper bound per rung: its explicit max, else the next rung up's min.
    fn from_ordered(defs: Vec<LeagueDefinition>) -> Self {
        let mut rungs = Vec::with_capacity(defs.len());
        let mut previous_min: Option<Decimal> = None;
        for def in defs {
            let upper = def.max_percentage.or(previous_min);
            previous_min = Some(def.min_percentage);
            rungs.push(Rung { def, upper });
        }
        Self { rungs }
    }

    /// Configured ladder, or the built-in one when none is configured.
    pub fn from_config(defs: &[LeagueDefinition]) -> Result<Self, PipelineError> {
        if defs.is_empty() {
            Ok(Self::standard())
        } else {
            Self::new(defs.to_vec())
        }
    }

    /// Built-in ladder: 10%, 1%, 0.1% ... 0.00001%, then everyone else.
    pub fn standard() -> Self {
        Self::from_ordered(vec![
            rung("Titan", "TTN", Decimal::new(10, 0)),
            rung("Leviathan", "LVT", Decimal::new(1, 0)),
            rung("Whale", "WHL", Decimal::new(1, 1)),
            rung("Shark", "SHK", Decimal::new(1, 2)),
            rung("Dolphin", "DLP", Decimal::new(1, 3)),
            rung("Fish", "FSH", Decimal::new(1, 4)),
            rung("Crab", "CRB", Decimal::new(1, 5)),
            rung("Shrimp", "SHR", Decimal::ZERO),
        ])
    }

    pub fn len(&self) -> usize {
        self.rungs.len()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &LeagueDefinition> {
        self.rungs.iter().map(|r| &r.def)
    }

    /// True when some explicit upper bound leaves a range that half-open
    /// matching sends to the catch-all instead of the next bucket down.
    pub fn has_gaps(&self) -> bool {
        self.rungs.windows(2).any(|w| {
            w[1].def
                .max_percentage
                .is_some_and(|max| max < w[0].def.min_percentage)
        }) || self.rungs.first().is_some_and(|r| r.upper.is_some())
    }

    /// Index of the bucket a percentage falls into. Anything that matches no
    /// bucket (negative, undefined, or inside a gap) lands in the last one.
    pub fn bucket_index(&self, percentage: Option<Decimal>, mode: MatchMode) -> usize {
        let catch_all = self.rungs.len().saturating_sub(1);
        let Some(pct) = percentage else {
            return catch_all;
        };
        self.rungs
            .iter()
            .position(|r| match mode {
                MatchMode::LowerBound => pct >= r.def.min_percentage,
                MatchMode::HalfOpen => {
                    pct >= r.def.min_percentage && r.upper.is_none_or(|max| pct < max)
                }
            })
            .unwrap_or(catch_all)
    }
}

/// `balance / supply * 100`, or `None` when the supply is not positive.
pub fn percentage_of_supply(balance: Decimal, supply: Decimal) -> Option<Decimal> {
    if supply <= Decimal::ZERO {
        return None;
    }
    balance
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|scaled| scaled.checked_div(supply))
        .or_else(|| balance.checked_div(supply)?.checked_mul(Decimal::ONE_HUNDRED))
}

/// Fold holders into per-bucket counts. Pure and order-independent; the
/// output follows ladder order and always lists every bucket.
pub fn classify(
    holders: &[HolderRecord],
    total_supply: Decimal,
    ladder: &LeagueLadder,
    mode: MatchMode,
) -> Classification {
    let mut counts = vec![BucketCounts::default(); ladder.len()];
    for holder in holders {
        let idx = ladder.bucket_index(percentage_of_supply(holder.balance, total_supply), mode);
        counts[idx].all_holders += 1;
        if !holder.is_contract {
            counts[idx].user_holders += 1;
        }
    }

    Classification {
        buckets: ladder
            .definitions()
            .zip(counts)
            .map(|(def, counts)| BucketTally {
                name: def.name.clone(),
                min_percentage: def.min_percentage,
                counts,
            })
            .collect(),
    }
}
