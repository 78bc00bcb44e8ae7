use std::time::Instant;

use log::{debug, info, trace};
use ndarray::{Array1, Array2, ArrayViewMut1};

use crate::baseline::BaselinePredictor;
use crate::clamp::ClampingFunction;
use crate::index::IdIndex;
use crate::model::FunkSvdModel;
use crate::{invalid_input, ThreadSafeStdError};

/// The starting value for every feature entry. The precise value is not
/// supposed to matter much, but the trailing-value estimate below assumes
/// every untrained feature still holds it.
const INITIAL_FEATURE_VALUE: f64 = 0.1;
/// Minimum number of epochs to train a feature in threshold mode.
const MIN_EPOCHS: usize = 50;
/// Norms at or below this are treated as zero when normalizing feature
/// vectors, marking the feature as dead.
const MIN_FEATURE_NORM: f64 = 1.0e-10;

/// A single user-item rating observation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rating {
    pub user_id: i64,
    pub item_id: i64,
    pub value: f64,
}

impl Rating {
    pub fn new(user_id: i64, item_id: i64, value: f64) -> Self {
        Self {
            user_id,
            item_id,
            value,
        }
    }
}

/// A rating re-keyed to dense user/item indices for the duration of a build.
#[derive(Clone, Copy, Debug)]
struct IndexedRating {
    user_index: usize,
    item_index: usize,
    value: f64,
}

/// Configuration for FunkSVD gradient-descent training.
///
/// Stopping is controlled by two fields: a positive `iteration_count` trains
/// each feature for exactly that many epochs, ignoring the error trend;
/// otherwise training continues until the epoch RMSE stops improving by at
/// least `training_threshold` (after a fixed minimum number of epochs).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FunkSvdConfig {
    /// Number of latent features to train.
    pub feature_count: usize,
    /// SGD learning rate.
    pub learning_rate: f64,
    /// Regularization term applied to both feature vectors (Funk's K).
    pub regularization: f64,
    /// Threshold-mode stopping: keep training a feature while each epoch
    /// improves the RMSE by at least this much.
    pub training_threshold: f64,
    /// If positive, train each feature for exactly this many epochs.
    pub iteration_count: usize,
    /// Clamp applied after every partial-estimate update.
    pub clamp: ClampingFunction,
}

impl Default for FunkSvdConfig {
    fn default() -> Self {
        FunkSvdConfig {
            feature_count: 100,
            learning_rate: 0.001,
            regularization: 0.015,
            training_threshold: 1.0e-5,
            iteration_count: 0,
            clamp: ClampingFunction::Identity,
        }
    }
}

/// Summary of one latent feature's training run.
#[derive(Clone, Debug)]
pub struct FeatureInfo {
    feature: usize,
    epochs: usize,
    training_errors: Vec<f64>,
    singular_value: f64,
}

impl FeatureInfo {
    /// The feature's index in training order.
    pub fn feature(&self) -> usize {
        self.feature
    }

    /// Number of epochs the feature was trained for.
    pub fn epochs(&self) -> usize {
        self.epochs
    }

    /// The RMSE recorded at the end of each epoch, in order.
    pub fn training_errors(&self) -> &[f64] {
        &self.training_errors
    }

    /// The RMSE of the final epoch.
    pub fn last_rmse(&self) -> f64 {
        self.training_errors.last().copied().unwrap_or(f64::MAX)
    }

    /// The singular value extracted for this feature; 0 marks a dead feature.
    pub fn singular_value(&self) -> f64 {
        self.singular_value
    }
}

/// Trains FunkSVD models: per-feature stochastic gradient descent against
/// baseline residuals, followed by normalization of the learned vectors into
/// unit vectors and singular values.
///
/// Training is single-threaded and deterministic: features train strictly
/// sequentially, and every epoch walks the pre-indexed rating sequence in its
/// original order. Two runs over the same ratings with the same configuration
/// and baseline produce identical models.
pub struct FunkSvdTrainer {
    config: FunkSvdConfig,
}

impl FunkSvdTrainer {
    pub fn new(config: FunkSvdConfig) -> Self {
        Self { config }
    }

    /// Trains a model over `ratings`, seeding residual estimates from
    /// `baseline`. The baseline is moved into the returned model so serving
    /// can keep consulting it.
    ///
    /// # Errors
    /// Fails fast on invalid configuration (zero features, non-positive
    /// learning rate, negative regularization or threshold) and on an empty
    /// rating slice. Rating values are assumed finite; ingestion is expected
    /// to have rejected NaN and infinite values already.
    pub fn train(
        &self,
        ratings: &[Rating],
        baseline: Box<dyn BaselinePredictor>,
    ) -> Result<FunkSvdModel, ThreadSafeStdError> {
        self.validate_config()?;
        if ratings.is_empty() {
            return Err(invalid_input(
                "Cannot train a FunkSVD model on an empty rating set.".to_string(),
            ));
        }

        let config = &self.config;
        debug!(
            "Setting up to build FunkSVD model with {} features",
            config.feature_count
        );
        debug!("Learning rate is {}", config.learning_rate);
        debug!("Regularization term is {}", config.regularization);
        if config.iteration_count > 0 {
            debug!(
                "Training each feature for {} epochs",
                config.iteration_count
            );
        } else {
            debug!("Training threshold is {}", config.training_threshold);
        }

        let build_start = Instant::now();

        let mut user_index = IdIndex::new();
        let mut item_index = IdIndex::new();
        let indexed: Vec<IndexedRating> = ratings
            .iter()
            .map(|r| IndexedRating {
                user_index: user_index.intern(r.user_id),
                item_index: item_index.intern(r.item_id),
                value: r.value,
            })
            .collect();

        debug!(
            "Building FunkSVD with {} features for {} ratings ({} users, {} items)",
            config.feature_count,
            indexed.len(),
            user_index.len(),
            item_index.len()
        );

        let mut estimates =
            initialize_estimates(&indexed, &user_index, &item_index, baseline.as_ref());

        let mut user_features =
            Array2::<f64>::zeros((config.feature_count, user_index.len()));
        let mut item_features =
            Array2::<f64>::zeros((config.feature_count, item_index.len()));

        let mut epoch_records = Vec::with_capacity(config.feature_count);
        for feature in 0..config.feature_count {
            let record = self.train_feature(
                feature,
                &indexed,
                &mut user_features,
                &mut item_features,
                &mut estimates,
            );
            epoch_records.push(record);
        }

        debug!("Extracting singular values");
        let singular_values = normalize_features(&mut user_features, &mut item_features);

        let feature_infos: Vec<FeatureInfo> = epoch_records
            .into_iter()
            .enumerate()
            .map(|(feature, (epochs, training_errors))| FeatureInfo {
                feature,
                epochs,
                training_errors,
                singular_value: singular_values[feature],
            })
            .collect();

        info!(
            "Trained FunkSVD model with {} features over {} ratings in {:?}",
            config.feature_count,
            indexed.len(),
            build_start.elapsed()
        );

        Ok(FunkSvdModel::new(
            config.feature_count,
            user_features,
            item_features,
            singular_values,
            feature_infos,
            config.clamp,
            user_index,
            item_index,
            baseline,
        ))
    }

    fn validate_config(&self) -> Result<(), ThreadSafeStdError> {
        let config = &self.config;
        if config.feature_count == 0 {
            return Err(invalid_input(
                "feature_count must be greater than 0.".to_string(),
            ));
        }
        if !config.learning_rate.is_finite() || config.learning_rate <= 0.0 {
            return Err(invalid_input(format!(
                "learning_rate must be finite and positive, got {}.",
                config.learning_rate
            )));
        }
        if !config.regularization.is_finite() || config.regularization < 0.0 {
            return Err(invalid_input(format!(
                "regularization must be finite and non-negative, got {}.",
                config.regularization
            )));
        }
        if !config.training_threshold.is_finite() || config.training_threshold < 0.0 {
            return Err(invalid_input(format!(
                "training_threshold must be finite and non-negative, got {}.",
                config.training_threshold
            )));
        }
        Ok(())
    }

    /// Trains one feature's user and item vectors by epoch-based gradient
    /// descent, then folds the feature's contribution into every rating's
    /// residual estimate. Returns the epoch count and the per-epoch RMSEs.
    fn train_feature(
        &self,
        feature: usize,
        ratings: &[IndexedRating],
        user_features: &mut Array2<f64>,
        item_features: &mut Array2<f64>,
        estimates: &mut [f64],
    ) -> (usize, Vec<f64>) {
        trace!("Training feature {}", feature);
        let feature_start = Instant::now();

        let mut ufv = user_features.row_mut(feature);
        ufv.fill(INITIAL_FEATURE_VALUE);
        let mut ifv = item_features.row_mut(feature);
        ifv.fill(INITIAL_FEATURE_VALUE);

        // Every not-yet-trained feature still holds the initial constant, so
        // their combined contribution to each prediction is one precomputable
        // value shared by all ratings.
        let trailing_features = self.config.feature_count - feature - 1;
        let trailing_value =
            trailing_features as f64 * INITIAL_FEATURE_VALUE * INITIAL_FEATURE_VALUE;

        let mut rmse = f64::MAX;
        let mut old_rmse = 0.0;
        let mut epoch = 0;
        let mut training_errors = Vec::new();
        while !self.is_done(epoch, rmse, old_rmse) {
            old_rmse = rmse;
            rmse = self.train_feature_epoch(ratings, &mut ufv, &mut ifv, estimates, trailing_value);
            training_errors.push(rmse);
            trace!("Epoch {} of feature {} had RMSE of {}", epoch, feature, rmse);
            epoch += 1;
        }

        debug!(
            "Finished feature {} in {} epochs (rmse={}) in {:?}",
            feature,
            epoch,
            rmse,
            feature_start.elapsed()
        );

        // The next feature trains against residuals that include this one.
        let clamp = self.config.clamp;
        for (r, estimate) in ratings.iter().zip(estimates.iter_mut()) {
            *estimate = clamp.apply(*estimate + ufv[r.user_index] * ifv[r.item_index]);
            debug_assert!(
                estimate.is_finite(),
                "residual estimate diverged while training feature {}",
                feature
            );
        }

        (epoch, training_errors)
    }

    /// One pass over the rating sequence; returns the epoch RMSE.
    fn train_feature_epoch(
        &self,
        ratings: &[IndexedRating],
        ufv: &mut ArrayViewMut1<f64>,
        ifv: &mut ArrayViewMut1<f64>,
        estimates: &[f64],
        trailing_value: f64,
    ) -> f64 {
        let clamp = self.config.clamp;
        let learning_rate = self.config.learning_rate;
        let regularization = self.config.regularization;

        let mut sum_squared_error = 0.0;
        for (r, &estimate) in ratings.iter().zip(estimates) {
            let u = ufv[r.user_index];
            let v = ifv[r.item_index];

            // Predict from the already-trained features plus this one, then
            // fold in the assumed contribution of the untrained remainder,
            // clamping at each step exactly as serving does.
            let mut predicted = clamp.apply(estimate + u * v);
            predicted = clamp.apply(predicted + trailing_value);
            let err = r.value - predicted;

            // Regularized gradient step; both updates use the pre-update
            // values of u and v.
            ufv[r.user_index] = u + (err * v - regularization * u) * learning_rate;
            ifv[r.item_index] = v + (err * u - regularization * v) * learning_rate;

            sum_squared_error += err * err;
        }

        (sum_squared_error / ratings.len() as f64).sqrt()
    }

    /// Whether a feature is sufficiently trained. A positive iteration count
    /// wins; otherwise train at least `MIN_EPOCHS` epochs and stop once the
    /// RMSE improvement falls below the training threshold.
    fn is_done(&self, epoch: usize, rmse: f64, old_rmse: f64) -> bool {
        if self.config.iteration_count > 0 {
            epoch >= self.config.iteration_count
        } else {
            epoch >= MIN_EPOCHS && old_rmse - rmse < self.config.training_threshold
        }
    }
}

/// Seeds each rating's residual estimate with the baseline's prediction,
/// consulting the baseline once per user against that user's own rated items.
fn initialize_estimates(
    ratings: &[IndexedRating],
    user_index: &IdIndex,
    item_index: &IdIndex,
    baseline: &dyn BaselinePredictor,
) -> Vec<f64> {
    let mut positions_by_user: Vec<Vec<usize>> = vec![Vec::new(); user_index.len()];
    for (position, rating) in ratings.iter().enumerate() {
        positions_by_user[rating.user_index].push(position);
    }

    let mut estimates = vec![0.0; ratings.len()];
    for (uidx, positions) in positions_by_user.iter().enumerate() {
        let user_id = user_index.id_of(uidx);
        let known_ratings: Vec<(i64, f64)> = positions
            .iter()
            .map(|&p| (item_index.id_of(ratings[p].item_index), ratings[p].value))
            .collect();
        let items: Vec<i64> = known_ratings.iter().map(|&(item_id, _)| item_id).collect();
        let scores = baseline.predict(user_id, &known_ratings, &items);
        for (&position, score) in positions.iter().zip(scores) {
            estimates[position] = score;
        }
    }
    estimates
}

/// Rescales each feature's user and item vectors to unit L2 norm and returns
/// the singular values `user_norm * item_norm` captured before rescaling.
///
/// A vector whose norm is at or below `MIN_FEATURE_NORM` is left un-rescaled
/// and the feature's singular value is recorded as 0 (a dead feature, an
/// expected outcome under strong regularization or pathological data).
fn normalize_features(
    user_features: &mut Array2<f64>,
    item_features: &mut Array2<f64>,
) -> Array1<f64> {
    let feature_count = user_features.nrows();
    let mut singular_values = Array1::<f64>::zeros(feature_count);

    for feature in 0..feature_count {
        let user_row = user_features.row(feature);
        let user_norm = user_row.dot(&user_row).sqrt();
        let item_row = item_features.row(feature);
        let item_norm = item_row.dot(&item_row).sqrt();

        if user_norm > MIN_FEATURE_NORM {
            user_features
                .row_mut(feature)
                .mapv_inplace(|value| value / user_norm);
        }
        if item_norm > MIN_FEATURE_NORM {
            item_features
                .row_mut(feature)
                .mapv_inplace(|value| value / item_norm);
        }

        singular_values[feature] = if user_norm > MIN_FEATURE_NORM && item_norm > MIN_FEATURE_NORM
        {
            user_norm * item_norm
        } else {
            0.0
        };
    }

    singular_values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::ConstantBaseline;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_ratings() -> Vec<Rating> {
        vec![
            Rating::new(1, 10, 5.0),
            Rating::new(1, 11, 3.0),
            Rating::new(2, 10, 4.0),
            Rating::new(2, 11, 2.0),
        ]
    }

    #[test]
    fn zero_feature_count_is_rejected() {
        let config = FunkSvdConfig {
            feature_count: 0,
            ..FunkSvdConfig::default()
        };
        let result = FunkSvdTrainer::new(config)
            .train(&small_ratings(), Box::new(ConstantBaseline::new(0.0)));
        assert!(result.is_err());
    }

    #[test]
    fn non_positive_learning_rate_is_rejected() {
        for learning_rate in [0.0, -0.1, f64::NAN] {
            let config = FunkSvdConfig {
                learning_rate,
                ..FunkSvdConfig::default()
            };
            let result = FunkSvdTrainer::new(config)
                .train(&small_ratings(), Box::new(ConstantBaseline::new(0.0)));
            assert!(result.is_err(), "learning_rate {} should fail", learning_rate);
        }
    }

    #[test]
    fn negative_regularization_is_rejected() {
        let config = FunkSvdConfig {
            regularization: -0.01,
            ..FunkSvdConfig::default()
        };
        let result = FunkSvdTrainer::new(config)
            .train(&small_ratings(), Box::new(ConstantBaseline::new(0.0)));
        assert!(result.is_err());
    }

    #[test]
    fn negative_training_threshold_is_rejected() {
        let config = FunkSvdConfig {
            training_threshold: -1.0e-5,
            ..FunkSvdConfig::default()
        };
        let result = FunkSvdTrainer::new(config)
            .train(&small_ratings(), Box::new(ConstantBaseline::new(0.0)));
        assert!(result.is_err());
    }

    #[test]
    fn empty_rating_set_is_rejected() {
        let result = FunkSvdTrainer::new(FunkSvdConfig::default())
            .train(&[], Box::new(ConstantBaseline::new(0.0)));
        assert!(result.is_err());
    }

    #[test]
    fn normalization_extracts_singular_values() {
        // Feature 0: user norm 5 (3-4-0), item norm 2 (2-0-0).
        let mut user_features = array![[3.0, 4.0, 0.0], [0.0, 0.0, 0.0]];
        let mut item_features = array![[2.0, 0.0, 0.0], [1.0, 0.0, 0.0]];

        let singular_values = normalize_features(&mut user_features, &mut item_features);

        assert_abs_diff_eq!(singular_values[0], 10.0, epsilon = 1e-12);
        let user_row = user_features.row(0);
        assert_abs_diff_eq!(user_row.dot(&user_row).sqrt(), 1.0, epsilon = 1e-12);
        let item_row = item_features.row(0);
        assert_abs_diff_eq!(item_row.dot(&item_row).sqrt(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn dead_feature_gets_zero_singular_value() {
        let mut user_features = array![[0.0, 0.0, 0.0]];
        let mut item_features = array![[1.0, 2.0, 2.0]];

        let singular_values = normalize_features(&mut user_features, &mut item_features);

        assert_eq!(singular_values[0], 0.0);
        // The zero user vector stays untouched; the live item vector is still
        // rescaled to unit length.
        assert!(user_features.row(0).iter().all(|&v| v == 0.0));
        let item_row = item_features.row(0);
        assert_abs_diff_eq!(item_row.dot(&item_row).sqrt(), 1.0, epsilon = 1e-12);
    }

    /// A baseline that counts how many times it is consulted.
    struct CountingBaseline {
        calls: AtomicUsize,
    }

    impl BaselinePredictor for CountingBaseline {
        fn predict(&self, _user_id: i64, _known: &[(i64, f64)], items: &[i64]) -> Vec<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            vec![0.0; items.len()]
        }
    }

    #[test]
    fn estimates_consult_baseline_once_per_user() {
        let ratings = small_ratings();
        let mut user_index = IdIndex::new();
        let mut item_index = IdIndex::new();
        let indexed: Vec<IndexedRating> = ratings
            .iter()
            .map(|r| IndexedRating {
                user_index: user_index.intern(r.user_id),
                item_index: item_index.intern(r.item_id),
                value: r.value,
            })
            .collect();

        let baseline = CountingBaseline {
            calls: AtomicUsize::new(0),
        };
        let estimates = initialize_estimates(&indexed, &user_index, &item_index, &baseline);

        assert_eq!(baseline.calls.load(Ordering::SeqCst), 2);
        assert_eq!(estimates.len(), 4);
    }

    #[test]
    fn estimates_align_with_rating_positions() {
        let ratings = small_ratings();
        let mut user_index = IdIndex::new();
        let mut item_index = IdIndex::new();
        let indexed: Vec<IndexedRating> = ratings
            .iter()
            .map(|r| IndexedRating {
                user_index: user_index.intern(r.user_id),
                item_index: item_index.intern(r.item_id),
                value: r.value,
            })
            .collect();

        // A baseline that scores every item at its own id value, so each
        // estimate slot is distinguishable.
        struct ItemIdBaseline;
        impl BaselinePredictor for ItemIdBaseline {
            fn predict(&self, _user_id: i64, _known: &[(i64, f64)], items: &[i64]) -> Vec<f64> {
                items.iter().map(|&item_id| item_id as f64).collect()
            }
        }

        let estimates = initialize_estimates(&indexed, &user_index, &item_index, &ItemIdBaseline);
        assert_eq!(estimates, vec![10.0, 11.0, 10.0, 11.0]);
    }

    #[test]
    fn training_is_deterministic_for_fixed_inputs() {
        let config = FunkSvdConfig {
            feature_count: 2,
            learning_rate: 0.01,
            regularization: 0.01,
            iteration_count: 30,
            ..FunkSvdConfig::default()
        };
        let ratings = small_ratings();
        let first = FunkSvdTrainer::new(config)
            .train(&ratings, Box::new(ConstantBaseline::new(0.0)))
            .unwrap();
        let second = FunkSvdTrainer::new(config)
            .train(&ratings, Box::new(ConstantBaseline::new(0.0)))
            .unwrap();

        assert_eq!(first.user_features(), second.user_features());
        assert_eq!(first.item_features(), second.item_features());
        assert_eq!(first.singular_values(), second.singular_values());
    }
}
