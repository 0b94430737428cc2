//! In-process cache of aggregated sufficient statistics.
//!
//! Entries are keyed by a [`RequestSignature`] (data filter plus TRE set) and
//! append-only: once an aggregate is stored for an analysis type under a
//! signature it is never replaced. Lookups can answer a cheaper analysis from
//! a richer aggregate when the components it needs are all present.

use crate::analysis::StatisticalAnalyzer;
use crate::models::{AggregatedResult, AnalysisRequest, AnalysisType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Identity of the data an analysis runs over.
///
/// Two requests share a signature when their queries are equal after
/// whitespace normalization and they target the same set of TREs, in any
/// order. Text inside quotes is never normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestSignature(String);

impl RequestSignature {
    pub fn new(user_query: &str, tre_list: &[String]) -> Self {
        let tres: BTreeSet<&str> = tre_list.iter().map(|t| t.trim()).collect();

        let mut hasher = Sha256::new();
        hasher.update(normalize_query(user_query).as_bytes());
        for tre in tres {
            hasher.update([0u8]);
            hasher.update(tre.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn for_request(request: &AnalysisRequest) -> Self {
        Self::new(&request.user_query, &request.tre_list)
    }

    fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Collapse runs of whitespace outside quoted literals and identifiers, then
/// drop trailing semicolons.
fn normalize_query(query: &str) -> String {
    let mut normalized = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in query.trim().chars() {
        match quote {
            Some(open) => {
                normalized.push(c);
                // '' and "" escapes close and reopen, leaving the text intact
                if c == open {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space {
                    normalized.push(' ');
                    pending_space = false;
                }
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                normalized.push(c);
            }
        }
    }

    normalized
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: Arc<AggregatedResult>,
    stored_at: DateTime<Utc>,
}

/// A cached aggregate able to answer a lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub result: Arc<AggregatedResult>,
    /// Analysis the aggregate was originally computed for.
    pub computed_for: AnalysisType,
    /// True when the hit is a view over another analysis' aggregate.
    pub derived: bool,
}

/// Shared cache of aggregates plus the per-signature single-flight locks.
#[derive(Debug, Default)]
pub struct SufficientStatisticsCache {
    entries: RwLock<HashMap<RequestSignature, Vec<CacheEntry>>>,
    flights: Mutex<HashMap<RequestSignature, Arc<AsyncMutex<()>>>>,
}

impl SufficientStatisticsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an aggregate that can answer `analysis_type` for `signature`.
    ///
    /// An exact entry wins. Otherwise any entry whose components cover the
    /// analysis is returned, complete aggregates before partial ones.
    pub fn lookup(
        &self,
        analysis_type: AnalysisType,
        signature: &RequestSignature,
    ) -> Option<CacheHit> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let candidates = entries.get(signature)?;

        if let Some(entry) = candidates
            .iter()
            .find(|e| e.result.analysis_type == analysis_type)
        {
            info!(
                "Cache hit for {} on {} (stored {})",
                analysis_type,
                signature,
                entry.stored_at.format("%H:%M:%S")
            );
            return Some(CacheHit {
                result: Arc::clone(&entry.result),
                computed_for: analysis_type,
                derived: false,
            });
        }

        let derived = candidates
            .iter()
            .filter(|e| StatisticalAnalyzer::can_finalize(analysis_type, &e.result))
            .min_by_key(|e| (e.result.is_partial(), e.stored_at))?;

        info!(
            "Derived cache hit for {} on {} from {} aggregate",
            analysis_type, signature, derived.result.analysis_type
        );
        Some(CacheHit {
            result: Arc::clone(&derived.result),
            computed_for: derived.result.analysis_type,
            derived: true,
        })
    }

    /// Record an aggregate. Returns `false` and keeps the existing entry when
    /// one is already stored for the same analysis type.
    pub fn store(&self, signature: RequestSignature, result: Arc<AggregatedResult>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let slot = entries.entry(signature.clone()).or_default();

        if slot
            .iter()
            .any(|e| e.result.analysis_type == result.analysis_type)
        {
            warn!(
                "Refusing to overwrite cached {} aggregate for {}",
                result.analysis_type, signature
            );
            return false;
        }

        debug!(
            "Caching {} aggregate for {} ({} contributors, partial: {})",
            result.analysis_type,
            signature,
            result.contributors.len(),
            result.is_partial()
        );
        slot.push(CacheEntry {
            result,
            stored_at: Utc::now(),
        });
        drop(entries);
        debug!("Cache holds {} aggregate(s)", self.len());
        true
    }

    /// Every analysis that cached data for `signature` can answer.
    pub fn runnable_analyses(&self, signature: &RequestSignature) -> Vec<AnalysisType> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let Some(candidates) = entries.get(signature) else {
            return Vec::new();
        };

        AnalysisType::ALL
            .iter()
            .copied()
            .filter(|t| {
                candidates
                    .iter()
                    .any(|e| StatisticalAnalyzer::can_finalize(*t, &e.result))
            })
            .collect()
    }

    /// Serialise work on one signature. Hold the guard across lookup, compute
    /// and store; other signatures are never blocked by it.
    pub async fn lock(&self, signature: &RequestSignature) -> FlightGuard<'_> {
        let flight = {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(flights.entry(signature.clone()).or_default())
        };
        FlightGuard {
            cache: self,
            signature: signature.clone(),
            held: Some(flight.lock_owned().await),
        }
    }

    /// Called with the flight's guard already released. The map's own `Arc`
    /// is the last one once no holder or waiter remains.
    fn release(&self, signature: &RequestSignature) {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if flights
            .get(signature)
            .is_some_and(|flight| Arc::strong_count(flight) == 1)
        {
            flights.remove(signature);
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive hold on one signature, from [`SufficientStatisticsCache::lock`].
pub struct FlightGuard<'a> {
    cache: &'a SufficientStatisticsCache,
    signature: RequestSignature,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        self.cache.release(&self.signature);
    }
}
