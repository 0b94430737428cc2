//! Mergeable t-digest used by the percentile sketch.
//!
//! Each TRE ships its digest as `{"n": .., "delta": .., "K": .., "centroids":
//! [{"m": mean, "c": weight}, ..]}`. Merging takes the union of centroids and
//! compresses it with the size bound `4 * n * delta * q * (1 - q)`, so the
//! merged digest answers quantiles within the usual t-digest error.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

fn default_delta() -> f64 {
    0.01
}

fn default_k() -> u32 {
    25
}

/// A weighted point in the digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    /// Mean of the values absorbed by this centroid.
    #[serde(alias = "mean")]
    pub m: f64,
    /// Number of values absorbed.
    #[serde(alias = "count", alias = "weight")]
    pub c: f64,
}

impl Centroid {
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.m.total_cmp(&other.m).then(self.c.total_cmp(&other.c))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TDigest {
    /// Compression parameter; smaller keeps more centroids.
    #[serde(default = "default_delta")]
    pub delta: f64,
    #[serde(rename = "K", default = "default_k")]
    pub k: u32,
    /// Total weight. Recomputed from the centroids on load.
    #[serde(alias = "count", default)]
    pub n: f64,
    #[serde(default)]
    pub centroids: Vec<Centroid>,
}

impl Default for TDigest {
    fn default() -> Self {
        Self {
            delta: default_delta(),
            k: default_k(),
            n: 0.0,
            centroids: Vec::new(),
        }
    }
}

impl TDigest {
    /// Build a digest from raw values. Non-finite values are skipped, matching
    /// the container's handling of NULL/NaN rows.
    #[cfg(test)]
    pub fn from_values(values: &[f64], delta: f64) -> Self {
        let centroids = values
            .iter()
            .filter(|v| v.is_finite())
            .map(|&m| Centroid { m, c: 1.0 })
            .collect();
        Self::compressed(centroids, delta, default_k())
    }

    /// Validate a digest received from a TRE and put it in canonical form.
    pub fn normalized(mut self) -> Result<Self, String> {
        if !(self.delta > 0.0 && self.delta < 1.0) {
            return Err(format!("delta must be in (0, 1), got {}", self.delta));
        }
        for c in &self.centroids {
            if !c.m.is_finite() || !(c.c > 0.0) || !c.c.is_finite() {
                return Err(format!("invalid centroid {{m: {}, c: {}}}", c.m, c.c));
            }
        }
        self.centroids.sort_by(Centroid::cmp_key);
        self.n = self.centroids.iter().map(|c| c.c).sum();
        Ok(self)
    }

    /// Merge any number of digests. The union is sorted before compression so
    /// the result does not depend on the order of `digests`.
    pub fn merge_all<'a, I>(digests: I) -> Self
    where
        I: IntoIterator<Item = &'a TDigest>,
    {
        let mut delta = f64::INFINITY;
        let mut k = default_k();
        let mut centroids = Vec::new();

        for digest in digests {
            delta = delta.min(digest.delta);
            k = k.max(digest.k);
            centroids.extend(digest.centroids.iter().cloned());
        }

        if !delta.is_finite() {
            delta = default_delta();
        }

        Self::compressed(centroids, delta, k)
    }

    fn compressed(mut centroids: Vec<Centroid>, delta: f64, k: u32) -> Self {
        centroids.sort_by(Centroid::cmp_key);
        let total: f64 = centroids.iter().map(|c| c.c).sum();

        let mut merged: Vec<Centroid> = Vec::with_capacity(centroids.len());
        // Weight strictly to the left of the last merged centroid.
        let mut before = 0.0;

        for next in centroids {
            let absorbed = match merged.last_mut() {
                Some(last) => {
                    let q = (before + (last.c + next.c) / 2.0) / total;
                    let limit = 4.0 * total * delta * q * (1.0 - q);
                    if last.c + next.c <= limit {
                        let weight = last.c + next.c;
                        last.m += (next.m - last.m) * next.c / weight;
                        last.c = weight;
                        true
                    } else {
                        before += last.c;
                        false
                    }
                }
                None => false,
            };
            if !absorbed {
                merged.push(next);
            }
        }

        Self {
            delta,
            k,
            n: total,
            centroids: merged,
        }
    }

    /// Estimate the value at quantile `q` in `[0, 1]`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.centroids.is_empty() || !(0.0..=1.0).contains(&q) {
            return None;
        }
        if self.centroids.len() == 1 {
            return Some(self.centroids[0].m);
        }

        let target = q * self.n;
        let mut cumulative = 0.0;

        for (i, c) in self.centroids.iter().enumerate() {
            let mid = cumulative + c.c / 2.0;
            if target <= mid {
                if i == 0 {
                    return Some(c.m);
                }
                let prev = &self.centroids[i - 1];
                let prev_mid = cumulative - prev.c / 2.0;
                let t = (target - prev_mid) / (mid - prev_mid);
                return Some(prev.m + t * (c.m - prev.m));
            }
            cumulative += c.c;
        }

        self.centroids.last().map(|c| c.m)
    }

    pub fn min(&self) -> Option<f64> {
        self.centroids.first().map(|c| c.m)
    }

    pub fn max(&self) -> Option<f64> {
        self.centroids.last().map(|c| c.m)
    }
}
