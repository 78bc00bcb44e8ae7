use ndarray::{Array1, Array2};

use crate::baseline::BaselinePredictor;
use crate::clamp::ClampingFunction;
use crate::funksvd::FeatureInfo;
use crate::index::IdIndex;

/// An immutable trained FunkSVD model.
///
/// Holds the unit-normalized user and item feature matrices, the singular
/// values extracted at normalization time, the clamping function and id
/// indexes used in training, and the baseline predictor the factorization
/// was trained against. Created once by
/// [`FunkSvdTrainer::train`](crate::FunkSvdTrainer::train) and never mutated,
/// so it can be shared across threads and scored concurrently without
/// locking.
pub struct FunkSvdModel {
    feature_count: usize,
    /// Shape `(feature_count, num_users)`; each row is unit norm unless the
    /// feature is dead.
    user_features: Array2<f64>,
    /// Shape `(feature_count, num_items)`; likewise.
    item_features: Array2<f64>,
    /// `sigma_f = user_norm_f * item_norm_f`, captured before the vectors
    /// were rescaled; 0 marks a dead feature.
    singular_values: Array1<f64>,
    feature_infos: Vec<FeatureInfo>,
    clamp: ClampingFunction,
    user_index: IdIndex,
    item_index: IdIndex,
    baseline: Box<dyn BaselinePredictor>,
}

impl FunkSvdModel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        feature_count: usize,
        user_features: Array2<f64>,
        item_features: Array2<f64>,
        singular_values: Array1<f64>,
        feature_infos: Vec<FeatureInfo>,
        clamp: ClampingFunction,
        user_index: IdIndex,
        item_index: IdIndex,
        baseline: Box<dyn BaselinePredictor>,
    ) -> Self {
        Self {
            feature_count,
            user_features,
            item_features,
            singular_values,
            feature_infos,
            clamp,
            user_index,
            item_index,
            baseline,
        }
    }

    pub fn feature_count(&self) -> usize {
        self.feature_count
    }

    /// Unit-normalized user feature matrix, shape `(feature_count, num_users)`.
    pub fn user_features(&self) -> &Array2<f64> {
        &self.user_features
    }

    /// Unit-normalized item feature matrix, shape `(feature_count, num_items)`.
    pub fn item_features(&self) -> &Array2<f64> {
        &self.item_features
    }

    pub fn singular_values(&self) -> &Array1<f64> {
        &self.singular_values
    }

    /// Per-feature training summaries, in training order.
    pub fn feature_infos(&self) -> &[FeatureInfo] {
        &self.feature_infos
    }

    pub fn clamp(&self) -> ClampingFunction {
        self.clamp
    }

    pub fn user_index(&self) -> &IdIndex {
        &self.user_index
    }

    pub fn item_index(&self) -> &IdIndex {
        &self.item_index
    }

    /// Scores `target_item_ids` for a user, returning one score per target in
    /// order.
    ///
    /// A user present in the training data is scored from their trained
    /// feature vector. An unknown user is folded in: their `item_history`
    /// (`(item id, rating)` pairs) is projected onto the item-feature space
    /// to build a preference vector, with no retraining. Either way, each
    /// score starts from the baseline prediction and adds the features'
    /// contributions one at a time, clamping after each partial addition
    /// exactly as training did.
    ///
    /// Target items absent from the item index score at the (clamped)
    /// baseline value alone; history items absent from the item index are
    /// skipped during fold-in. Neither is an error.
    pub fn score(
        &self,
        user_id: i64,
        item_history: &[(i64, f64)],
        target_item_ids: &[i64],
    ) -> Vec<f64> {
        // One baseline call covers targets and history; the history scores
        // supply the offsets for fold-in.
        let mut baseline_items: Vec<i64> =
            Vec::with_capacity(target_item_ids.len() + item_history.len());
        baseline_items.extend_from_slice(target_item_ids);
        baseline_items.extend(item_history.iter().map(|&(item_id, _)| item_id));
        let baseline_scores = self
            .baseline
            .predict(user_id, item_history, &baseline_items);
        let (target_baselines, history_baselines) =
            baseline_scores.split_at(target_item_ids.len());

        let preferences: Vec<f64> = match self.user_index.index_of(user_id) {
            Some(uidx) => self.user_features.column(uidx).to_vec(),
            None => self.fold_in(item_history, history_baselines),
        };

        target_item_ids
            .iter()
            .zip(target_baselines)
            .map(|(&item_id, &baseline_score)| match self.item_index.index_of(item_id) {
                Some(iidx) => self.score_item(&preferences, iidx, baseline_score),
                None => self.clamp.apply(baseline_score),
            })
            .collect()
    }

    /// Adds each feature's contribution to the baseline score, clamping the
    /// running value after every addition. The singular value is applied
    /// here, exactly once, which is why fold-in divides it out.
    fn score_item(&self, preferences: &[f64], item_index: usize, baseline_score: f64) -> f64 {
        let mut score = baseline_score;
        for feature in 0..self.feature_count {
            score += preferences[feature]
                * self.singular_values[feature]
                * self.item_features[[feature, item_index]];
            score = self.clamp.apply(score);
        }
        score
    }

    /// Projects a user's rating history into the item-feature space (the
    /// fold-in of Sarwar et al. 2002), yielding a preference vector in the
    /// same unit-normalized space as trained user vectors.
    ///
    /// Dead features (singular value 0) contribute nothing, as do history
    /// items the model has never seen.
    fn fold_in(&self, item_history: &[(i64, f64)], history_baselines: &[f64]) -> Vec<f64> {
        let mut preferences = vec![0.0; self.feature_count];
        for (&(item_id, value), &baseline_score) in item_history.iter().zip(history_baselines) {
            let item_index = match self.item_index.index_of(item_id) {
                Some(index) => index,
                None => continue,
            };
            let offset = value - baseline_score;
            for feature in 0..self.feature_count {
                let sigma = self.singular_values[feature];
                if sigma > 0.0 {
                    preferences[feature] +=
                        offset * self.item_features[[feature, item_index]] / sigma;
                }
            }
        }
        preferences
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::ConstantBaseline;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// A hand-built model: one live feature with singular value 2 and one
    /// dead feature; two users, two items, zero baseline, identity clamp.
    fn tiny_model(clamp: ClampingFunction) -> FunkSvdModel {
        let mut user_index = IdIndex::new();
        user_index.intern(1);
        user_index.intern(2);
        let mut item_index = IdIndex::new();
        item_index.intern(10);
        item_index.intern(11);

        let user_features = array![[0.6, 0.8], [0.0, 0.0]];
        let item_features = array![[0.8, 0.6], [0.0, 0.0]];
        let singular_values = array![2.0, 0.0];

        FunkSvdModel::new(
            2,
            user_features,
            item_features,
            singular_values,
            Vec::new(),
            clamp,
            user_index,
            item_index,
            Box::new(ConstantBaseline::new(0.0)),
        )
    }

    #[test]
    fn known_user_scores_from_trained_vector() {
        let model = tiny_model(ClampingFunction::Identity);
        let scores = model.score(1, &[], &[10, 11]);
        // score = sigma * u * v with zero baseline.
        assert_abs_diff_eq!(scores[0], 2.0 * 0.6 * 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(scores[1], 2.0 * 0.6 * 0.6, epsilon = 1e-12);
    }

    #[test]
    fn unknown_target_item_scores_at_baseline() {
        let model = tiny_model(ClampingFunction::Identity);
        let scores = model.score(1, &[], &[999]);
        assert_eq!(scores, vec![0.0]);
    }

    #[test]
    fn unknown_user_without_history_scores_at_baseline() {
        let model = tiny_model(ClampingFunction::Identity);
        let scores = model.score(777, &[], &[10, 11]);
        assert_eq!(scores, vec![0.0, 0.0]);
    }

    #[test]
    fn fold_in_divides_by_singular_value_once() {
        let model = tiny_model(ClampingFunction::Identity);
        // A cold user who rated item 10 at 1.6 with zero baseline:
        // pref = 1.6 * v(10) / sigma = 1.6 * 0.8 / 2 = 0.64,
        // score(11) = pref * sigma * v(11) = 0.64 * 2 * 0.6.
        let scores = model.score(777, &[(10, 1.6)], &[11]);
        assert_abs_diff_eq!(scores[0], 0.64 * 2.0 * 0.6, epsilon = 1e-12);
    }

    #[test]
    fn dead_features_do_not_poison_fold_in() {
        let model = tiny_model(ClampingFunction::Identity);
        let scores = model.score(777, &[(10, 4.0), (11, 2.0)], &[10, 11]);
        for score in scores {
            assert!(score.is_finite());
        }
    }

    #[test]
    fn unknown_history_items_are_skipped_in_fold_in() {
        let model = tiny_model(ClampingFunction::Identity);
        let with_noise = model.score(777, &[(10, 1.6), (555, 4.0)], &[11]);
        let without = model.score(777, &[(10, 1.6)], &[11]);
        assert_abs_diff_eq!(with_noise[0], without[0], epsilon = 1e-12);
    }

    #[test]
    fn range_clamp_bounds_baseline_only_scores() {
        let clamp = ClampingFunction::range(1.0, 5.0).unwrap();
        let model = tiny_model(clamp);
        // Zero baseline would be out of range; the clamp pulls it to min.
        let scores = model.score(1, &[], &[999]);
        assert_eq!(scores, vec![1.0]);
    }

    #[test]
    fn model_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FunkSvdModel>();
    }
}
