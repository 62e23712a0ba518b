//! Pruning policies: from a calibrated joint to per-pixel noise decisions.

use std::fmt;
use std::str::FromStr;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::joint::JointEstimator;
use crate::error::{PixelClError, Result};

/// Per-pixel noise decisions, aligned with the accumulation order of the
/// labels and probability rows they were derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoiseMask {
    flags: Vec<bool>,
}

impl NoiseMask {
    pub fn from_vec(flags: Vec<bool>) -> Self {
        Self { flags }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.flags
    }

    pub fn count_noisy(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }

    pub fn union(&self, other: &NoiseMask) -> Result<NoiseMask> {
        self.check_len(other)?;
        Ok(NoiseMask::from_vec(
            self.flags
                .iter()
                .zip(&other.flags)
                .map(|(&a, &b)| a || b)
                .collect(),
        ))
    }

    pub fn intersection(&self, other: &NoiseMask) -> Result<NoiseMask> {
        self.check_len(other)?;
        Ok(NoiseMask::from_vec(
            self.flags
                .iter()
                .zip(&other.flags)
                .map(|(&a, &b)| a && b)
                .collect(),
        ))
    }

    fn check_len(&self, other: &NoiseMask) -> Result<()> {
        if self.len() != other.len() {
            return Err(PixelClError::shape(format!(
                "cannot combine masks of length {} and {}",
                self.len(),
                other.len()
            )));
        }
        Ok(())
    }
}

/// The supported pruning policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PruneMethod {
    /// Per off-diagonal joint cell, flag the most-confidently-other pixels.
    PruneByClass,
    /// Per observed-label row, flag the least self-confident pixels in
    /// proportion to the row's estimated noise rate.
    PruneByNoiseRate,
    /// Union of the two, over the probability-margin joint (the default).
    Both,
    /// `Both`, but over the hard-assignment joint.
    Cij,
    /// `Both` over the probability-margin joint.
    Qij,
    /// Pixels flagged by both the `Qij` and `Cij` decisions.
    Intersection,
    /// Pixels flagged by either decision.
    Union,
}

impl PruneMethod {
    /// Directory-name fragment appended to the confidence-map output dir;
    /// the default policy writes to the unsuffixed directory.
    pub fn dir_suffix(&self) -> Option<String> {
        match self {
            PruneMethod::Both => None,
            other => Some(other.to_string().replace('_', "-")),
        }
    }
}

impl fmt::Display for PruneMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PruneMethod::PruneByClass => "prune_by_class",
            PruneMethod::PruneByNoiseRate => "prune_by_noise_rate",
            PruneMethod::Both => "both",
            PruneMethod::Cij => "Cij",
            PruneMethod::Qij => "Qij",
            PruneMethod::Intersection => "intersection",
            PruneMethod::Union => "union",
        };
        f.write_str(name)
    }
}

impl FromStr for PruneMethod {
    type Err = PixelClError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prune_by_class" => Ok(PruneMethod::PruneByClass),
            "prune_by_noise_rate" => Ok(PruneMethod::PruneByNoiseRate),
            "both" => Ok(PruneMethod::Both),
            "Cij" => Ok(PruneMethod::Cij),
            "Qij" => Ok(PruneMethod::Qij),
            "intersection" => Ok(PruneMethod::Intersection),
            "union" => Ok(PruneMethod::Union),
            other => Err(PixelClError::config(format!(
                "unknown pruning method '{other}'"
            ))),
        }
    }
}

/// Applies a [`PruneMethod`] to one accumulated dataset pass.
pub struct Pruner {
    estimator: JointEstimator,
}

impl Pruner {
    pub fn new(num_classes: usize) -> Self {
        Self {
            estimator: JointEstimator::new(num_classes),
        }
    }

    /// Decide, per pixel, whether its label is noise. Deterministic for
    /// identical inputs: ranking ties resolve to input order.
    pub fn prune(
        &self,
        labels: &[u8],
        probs: &Array2<f32>,
        method: PruneMethod,
    ) -> Result<NoiseMask> {
        match method {
            PruneMethod::PruneByClass => {
                let joint = self.estimator.confident_joint(labels, probs)?;
                Ok(prune_by_class(labels, probs, &joint))
            }
            PruneMethod::PruneByNoiseRate => {
                let joint = self.estimator.confident_joint(labels, probs)?;
                Ok(prune_by_noise_rate(labels, probs, &joint))
            }
            PruneMethod::Both | PruneMethod::Qij => {
                let joint = self.estimator.confident_joint(labels, probs)?;
                prune_both(labels, probs, &joint)
            }
            PruneMethod::Cij => {
                let joint = self.estimator.argmax_joint(labels, probs)?;
                prune_both(labels, probs, &joint)
            }
            PruneMethod::Intersection => {
                let qij = self.prune(labels, probs, PruneMethod::Qij)?;
                let cij = self.prune(labels, probs, PruneMethod::Cij)?;
                qij.intersection(&cij)
            }
            PruneMethod::Union => {
                let qij = self.prune(labels, probs, PruneMethod::Qij)?;
                let cij = self.prune(labels, probs, PruneMethod::Cij)?;
                qij.union(&cij)
            }
        }
    }
}

fn prune_both(labels: &[u8], probs: &Array2<f32>, joint: &Array2<f64>) -> Result<NoiseMask> {
    prune_by_class(labels, probs, joint).union(&prune_by_noise_rate(labels, probs, joint))
}

/// Group pixel indices by their observed label.
fn indices_by_label(labels: &[u8], num_classes: usize) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); num_classes];
    for (pixel, &label) in labels.iter().enumerate() {
        groups[label as usize].push(pixel);
    }
    groups
}

/// For each off-diagonal cell `(i, j)` flag, among pixels observed as `i`,
/// the `round(C[i][j])` most confident in truly being `j`.
pub fn prune_by_class(labels: &[u8], probs: &Array2<f32>, joint: &Array2<f64>) -> NoiseMask {
    let num_classes = joint.nrows();
    let groups = indices_by_label(labels, num_classes);
    let mut flags = vec![false; labels.len()];

    for i in 0..num_classes {
        for j in 0..num_classes {
            if i == j {
                continue;
            }
            let quota = joint[[i, j]].round() as usize;
            if quota == 0 {
                continue;
            }
            // Stable sort keeps input order on probability ties.
            let mut candidates = groups[i].clone();
            candidates.sort_by(|&a, &b| {
                probs[[b, j]]
                    .partial_cmp(&probs[[a, j]])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for &pixel in candidates.iter().take(quota) {
                flags[pixel] = true;
            }
        }
    }

    NoiseMask::from_vec(flags)
}

/// For each observed-label row, flag the least self-confident pixels in
/// proportion to the row's off-diagonal (noise) mass.
pub fn prune_by_noise_rate(labels: &[u8], probs: &Array2<f32>, joint: &Array2<f64>) -> NoiseMask {
    let num_classes = joint.nrows();
    let groups = indices_by_label(labels, num_classes);
    let mut flags = vec![false; labels.len()];

    for i in 0..num_classes {
        let row_sum: f64 = (0..num_classes).map(|j| joint[[i, j]]).sum();
        let quota = (row_sum - joint[[i, i]]).round() as usize;
        if quota == 0 {
            continue;
        }
        let mut candidates = groups[i].clone();
        candidates.sort_by(|&a, &b| {
            probs[[a, i]]
                .partial_cmp(&probs[[b, i]])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for &pixel in candidates.iter().take(quota) {
            flags[pixel] = true;
        }
    }

    NoiseMask::from_vec(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    /// Six pixels observed as class 0, two of which clearly look like
    /// class 1, plus four clean class-1 pixels.
    fn noisy_population() -> (Vec<u8>, Array2<f32>) {
        let labels = vec![0u8, 0, 0, 0, 0, 0, 1, 1, 1, 1];
        let probs = array![
            [0.95f32, 0.05],
            [0.90, 0.10],
            [0.10, 0.90], // mislabeled
            [0.88, 0.12],
            [0.05, 0.95], // mislabeled
            [0.92, 0.08],
            [0.10, 0.90],
            [0.15, 0.85],
            [0.20, 0.80],
            [0.12, 0.88],
        ];
        (labels, probs)
    }

    #[test]
    fn flags_the_planted_noise() {
        let (labels, probs) = noisy_population();
        let mask = Pruner::new(2)
            .prune(&labels, &probs, PruneMethod::Both)
            .unwrap();

        assert_eq!(mask.len(), labels.len());
        assert!(mask.as_slice()[2]);
        assert!(mask.as_slice()[4]);
        // The clean class-1 pixels stay untouched.
        for pixel in 6..10 {
            assert!(!mask.as_slice()[pixel]);
        }
    }

    #[test]
    fn clean_population_yields_no_noise() {
        let labels = vec![0u8, 0, 1, 1];
        let probs = array![[0.9f32, 0.1], [0.8, 0.2], [0.1, 0.9], [0.2, 0.8]];
        for method in [
            PruneMethod::PruneByClass,
            PruneMethod::PruneByNoiseRate,
            PruneMethod::Both,
            PruneMethod::Cij,
            PruneMethod::Intersection,
            PruneMethod::Union,
        ] {
            let mask = Pruner::new(2).prune(&labels, &probs, method).unwrap();
            assert_eq!(mask.count_noisy(), 0, "method {method}");
        }
    }

    #[test]
    fn union_contains_both_intersection_is_contained() {
        let (labels, probs) = noisy_population();
        let pruner = Pruner::new(2);

        let qij = pruner.prune(&labels, &probs, PruneMethod::Qij).unwrap();
        let cij = pruner.prune(&labels, &probs, PruneMethod::Cij).unwrap();
        let union = pruner.prune(&labels, &probs, PruneMethod::Union).unwrap();
        let inter = pruner
            .prune(&labels, &probs, PruneMethod::Intersection)
            .unwrap();

        for pixel in 0..labels.len() {
            let q = qij.as_slice()[pixel];
            let c = cij.as_slice()[pixel];
            assert_eq!(union.as_slice()[pixel], q || c);
            assert_eq!(inter.as_slice()[pixel], q && c);
        }
    }

    #[test]
    fn pruning_is_deterministic() {
        let (labels, probs) = noisy_population();
        let pruner = Pruner::new(2);
        for method in [PruneMethod::Both, PruneMethod::Union, PruneMethod::Cij] {
            let first = pruner.prune(&labels, &probs, method).unwrap();
            let second = pruner.prune(&labels, &probs, method).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn ties_resolve_to_input_order() {
        // Both class-0 pixels look identically like class 1; the joint
        // quota only covers one of them, so the earlier pixel is flagged.
        let labels = vec![0u8, 0, 0, 1];
        let probs = array![
            [0.2f32, 0.8],
            [0.2, 0.8],
            [0.9, 0.1],
            [0.1, 0.9],
        ];
        let joint = array![[2.0f64, 1.0], [0.0, 1.0]];
        let mask = prune_by_class(&labels, &probs, &joint);
        assert!(mask.as_slice()[0]);
        assert!(!mask.as_slice()[1]);
    }

    #[test]
    fn method_names_round_trip() {
        for name in [
            "prune_by_class",
            "prune_by_noise_rate",
            "both",
            "Cij",
            "Qij",
            "intersection",
            "union",
        ] {
            let method: PruneMethod = name.parse().unwrap();
            assert_eq!(method.to_string(), name);
        }
        assert!(matches!(
            "majority_vote".parse::<PruneMethod>(),
            Err(PixelClError::Configuration(_))
        ));
    }

    #[test]
    fn dir_suffix_uses_dashes() {
        assert_eq!(PruneMethod::Both.dir_suffix(), None);
        assert_eq!(
            PruneMethod::PruneByClass.dir_suffix().unwrap(),
            "prune-by-class"
        );
        assert_eq!(PruneMethod::Qij.dir_suffix().unwrap(), "Qij");
    }

    #[test]
    fn mask_length_mismatch_is_rejected() {
        let a = NoiseMask::from_vec(vec![true, false]);
        let b = NoiseMask::from_vec(vec![true]);
        assert!(a.union(&b).is_err());
        assert!(a.intersection(&b).is_err());
    }
}
