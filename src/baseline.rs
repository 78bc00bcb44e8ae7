use std::collections::HashMap;

use crate::funksvd::Rating;

/// Supplies simple non-factorized rating predictions.
///
/// The trainer seeds each rating's residual estimate from baseline scores,
/// and the serving path uses baseline scores both as the starting value of
/// every prediction and as the offsets subtracted from a cold user's ratings
/// at fold-in time.
///
/// `known_ratings` is the requesting user's own `(item id, value)` history.
/// Strategies may consult it (for example to compute a per-user mean offset)
/// or ignore it. One score per entry of `items` is returned, in order.
pub trait BaselinePredictor: Send + Sync {
    fn predict(&self, user_id: i64, known_ratings: &[(i64, f64)], items: &[i64]) -> Vec<f64>;
}

/// Predicts the same fixed value for every user-item pair.
///
/// Mostly useful for tests and for running the factorization against raw
/// ratings (a zero constant).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstantBaseline {
    value: f64,
}

impl ConstantBaseline {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

impl BaselinePredictor for ConstantBaseline {
    fn predict(&self, _user_id: i64, _known_ratings: &[(i64, f64)], items: &[i64]) -> Vec<f64> {
        vec![self.value; items.len()]
    }
}

/// Predicts the global mean rating of the training data for every pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GlobalMeanBaseline {
    mean: f64,
}

impl GlobalMeanBaseline {
    /// Computes the global mean from a training rating slice. An empty slice
    /// yields a mean of zero.
    pub fn fit(ratings: &[Rating]) -> Self {
        let mean = if ratings.is_empty() {
            0.0
        } else {
            ratings.iter().map(|r| r.value).sum::<f64>() / ratings.len() as f64
        };
        Self { mean }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }
}

impl BaselinePredictor for GlobalMeanBaseline {
    fn predict(&self, _user_id: i64, _known_ratings: &[(i64, f64)], items: &[i64]) -> Vec<f64> {
        vec![self.mean; items.len()]
    }
}

/// Predicts `mu + b_i`: the global mean plus a damped per-item offset.
///
/// Each offset is `b_i = sum(r_ui - mu) / (n_i + damping)`, so sparsely rated
/// items are pulled toward the global mean. Items absent from the training
/// data score at the global mean alone.
#[derive(Clone, Debug)]
pub struct ItemMeanBaseline {
    global_mean: f64,
    item_offsets: HashMap<i64, f64>,
}

impl ItemMeanBaseline {
    /// Fits damped item means from a training rating slice.
    ///
    /// `damping` must be non-negative; zero recovers plain per-item means.
    pub fn fit(ratings: &[Rating], damping: f64) -> Self {
        let global_mean = if ratings.is_empty() {
            0.0
        } else {
            ratings.iter().map(|r| r.value).sum::<f64>() / ratings.len() as f64
        };

        let mut sums: HashMap<i64, (f64, usize)> = HashMap::new();
        for r in ratings {
            let entry = sums.entry(r.item_id).or_insert((0.0, 0));
            entry.0 += r.value;
            entry.1 += 1;
        }
        let item_offsets = sums
            .into_iter()
            .map(|(item_id, (sum, count))| {
                let offset = (sum - count as f64 * global_mean) / (count as f64 + damping);
                (item_id, offset)
            })
            .collect();

        Self {
            global_mean,
            item_offsets,
        }
    }

    pub fn global_mean(&self) -> f64 {
        self.global_mean
    }

    fn item_offset(&self, item_id: i64) -> f64 {
        self.item_offsets.get(&item_id).copied().unwrap_or(0.0)
    }
}

impl BaselinePredictor for ItemMeanBaseline {
    fn predict(&self, _user_id: i64, _known_ratings: &[(i64, f64)], items: &[i64]) -> Vec<f64> {
        items
            .iter()
            .map(|&item_id| self.global_mean + self.item_offset(item_id))
            .collect()
    }
}

/// Predicts `mu + b_i + b_u`: damped item means plus a per-call user offset.
///
/// The user offset `b_u = sum(r - mu - b_i) / (n + damping)` is computed from
/// the `known_ratings` passed to each call, so it also works for users the
/// baseline was never fitted on.
#[derive(Clone, Debug)]
pub struct ItemUserMeanBaseline {
    item_mean: ItemMeanBaseline,
    damping: f64,
}

impl ItemUserMeanBaseline {
    pub fn fit(ratings: &[Rating], damping: f64) -> Self {
        Self {
            item_mean: ItemMeanBaseline::fit(ratings, damping),
            damping,
        }
    }
}

impl BaselinePredictor for ItemUserMeanBaseline {
    fn predict(&self, _user_id: i64, known_ratings: &[(i64, f64)], items: &[i64]) -> Vec<f64> {
        let mut deviation = 0.0;
        for &(item_id, value) in known_ratings {
            deviation += value - self.item_mean.global_mean - self.item_mean.item_offset(item_id);
        }
        let user_offset = if known_ratings.is_empty() {
            0.0
        } else {
            deviation / (known_ratings.len() as f64 + self.damping)
        };

        items
            .iter()
            .map(|&item_id| self.item_mean.global_mean + self.item_mean.item_offset(item_id) + user_offset)
            .collect()
    }
}
