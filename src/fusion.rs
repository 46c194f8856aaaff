//! Weighted fusion of the four indices into one tiredness value

use crate::types::{IndexKind, IndexValues, Weightages};

/// Combines indices with learned per-(task, subject) weights
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightedFusion {
    weights: Weightages,
}

impl WeightedFusion {
    /// The weights are normalized on the way in
    pub fn new(weights: Weightages) -> Self {
        Self {
            weights: weights.normalized(),
        }
    }

    pub fn weights(&self) -> &Weightages {
        &self.weights
    }

    pub fn fuse(&self, indices: &IndexValues) -> f64 {
        fuse(indices, &self.weights)
    }
}

/// `Σ index_i × weight_i`. A non-finite index contributes 0; the result is
/// clamped to [0, 1].
pub fn fuse(indices: &IndexValues, weights: &Weightages) -> f64 {
    let total: f64 = IndexKind::ALL
        .iter()
        .map(|&kind| {
            let value = *indices.get(kind);
            let value = if value.is_finite() { value } else { 0.0 };
            value * weights.get(kind)
        })
        .sum();
    total.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PerIndex;
    use proptest::prelude::*;

    #[test]
    fn test_uniform_fusion_is_mean() {
        let indices = PerIndex {
            drowsiness: 0.8,
            slouching: 0.4,
            attention: 0.0,
            yawn: 0.4,
        };
        assert!((fuse(&indices, &Weightages::uniform()) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_undefined_index_contributes_zero() {
        let indices = PerIndex {
            drowsiness: f64::NAN,
            slouching: 1.0,
            attention: 0.0,
            yawn: 0.0,
        };
        let fusion = WeightedFusion::new(Weightages::uniform());
        assert!((fusion.fuse(&indices) - 0.25).abs() < 1e-12);
    }

    fn unit() -> impl Strategy<Value = f64> {
        0.0f64..=1.0
    }

    proptest! {
        #[test]
        fn test_fusion_stays_in_unit_interval(
            d in unit(), s in unit(), a in unit(), y in unit(),
            wd in 0.0f64..10.0, ws in 0.0f64..10.0, wa in 0.0f64..10.0, wy in 0.0f64..10.0,
        ) {
            let indices = PerIndex { drowsiness: d, slouching: s, attention: a, yawn: y };
            let weights = Weightages::new(PerIndex { drowsiness: wd, slouching: ws, attention: wa, yawn: wy });
            let fused = fuse(&indices, &weights);
            prop_assert!((0.0..=1.0).contains(&fused));
        }

        #[test]
        fn test_normalization_is_idempotent(
            wd in 0.0f64..10.0, ws in 0.0f64..10.0, wa in 0.0f64..10.0, wy in 0.0f64..10.0,
        ) {
            let once = Weightages::new(PerIndex { drowsiness: wd, slouching: ws, attention: wa, yawn: wy });
            let twice = once.normalized();
            for kind in IndexKind::ALL {
                prop_assert!((once.get(kind) - twice.get(kind)).abs() < 1e-12);
            }
            prop_assert!((twice.values().sum() - 1.0).abs() < 1e-9);
        }
    }
}
