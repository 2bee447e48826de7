//! Positive-pair extraction, negative sampling and batch assembly.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::store::GraphSnapshot;

/// One contrastive example: the positive is class 0 among `[positive, negatives..]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContrastiveSample {
    pub anchor: usize,
    pub positive: usize,
    pub negatives: Vec<usize>,
}

/// One labeled pair for the link objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSample {
    pub source: usize,
    pub target: usize,
    pub label: f32,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingBatch {
    pub contrastive: Vec<ContrastiveSample>,
    pub links: Vec<LinkSample>,
}

impl TrainingBatch {
    pub fn is_empty(&self) -> bool {
        self.contrastive.is_empty() && self.links.is_empty()
    }
}

/// Uniform negative sampler with a per-anchor exclusion set.
#[derive(Debug, Clone, Copy)]
pub struct NegativeSampler {
    num_negatives: usize,
    min_weight: f32,
}

impl NegativeSampler {
    pub fn new(num_negatives: usize, min_weight: f32) -> Self {
        Self {
            num_negatives,
            min_weight,
        }
    }

    /// Draw negatives for `anchor`, never the anchor itself or any of its
    /// positive partners.
    ///
    /// Draws with replacement when fewer candidates than requested exist;
    /// `None` when there are no candidates at all.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        snapshot: &GraphSnapshot,
        anchor: usize,
        rng: &mut R,
    ) -> Option<Vec<usize>> {
        let mut excluded: HashSet<usize> = snapshot
            .partners(anchor, self.min_weight)
            .into_iter()
            .collect();
        excluded.insert(anchor);

        let candidates: Vec<usize> = (0..snapshot.num_entities())
            .filter(|i| !excluded.contains(i))
            .collect();
        if candidates.is_empty() || self.num_negatives == 0 {
            return None;
        }

        if candidates.len() >= self.num_negatives {
            Some(
                candidates
                    .choose_multiple(rng, self.num_negatives)
                    .copied()
                    .collect(),
            )
        } else {
            Some(
                (0..self.num_negatives)
                    .map(|_| candidates[rng.gen_range(0..candidates.len())])
                    .collect(),
            )
        }
    }

    /// One entity with no edge at all to `anchor`, if any exists.
    pub fn sample_non_edge<R: Rng + ?Sized>(
        &self,
        snapshot: &GraphSnapshot,
        anchor: usize,
        rng: &mut R,
    ) -> Option<usize> {
        let candidates: Vec<usize> = (0..snapshot.num_entities())
            .filter(|&j| j != anchor && snapshot.weight(anchor, j) == 0.0)
            .collect();
        candidates.choose(rng).copied()
    }
}

/// Turns a snapshot's positive pairs into shuffled training batches.
pub struct BatchBuilder<'a> {
    snapshot: &'a GraphSnapshot,
    sampler: NegativeSampler,
    batch_size: usize,
    soft_labels: bool,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(
        snapshot: &'a GraphSnapshot,
        num_negatives: usize,
        min_weight: f32,
        batch_size: usize,
        soft_labels: bool,
    ) -> Self {
        Self {
            snapshot,
            sampler: NegativeSampler::new(num_negatives, min_weight),
            batch_size: batch_size.max(1),
            soft_labels,
        }
    }

    pub fn positive_pairs(&self) -> Vec<(usize, usize, f32)> {
        self.snapshot.positive_pairs(self.sampler.min_weight)
    }

    /// Shuffle the positive pairs and chunk them into batches.
    pub fn batches<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<TrainingBatch> {
        let mut pairs = self.positive_pairs();
        pairs.shuffle(rng);
        pairs
            .chunks(self.batch_size)
            .map(|chunk| self.build(chunk, rng))
            .filter(|batch| !batch.is_empty())
            .collect()
    }

    /// Build one batch from the given pairs in order.
    ///
    /// Each undirected pair is oriented at random, so either endpoint can
    /// end up as the anchor.
    pub fn build<R: Rng + ?Sized>(
        &self,
        pairs: &[(usize, usize, f32)],
        rng: &mut R,
    ) -> TrainingBatch {
        let mut batch = TrainingBatch::default();
        for &(i, j, weight) in pairs {
            let (anchor, positive) = if rng.gen_bool(0.5) { (i, j) } else { (j, i) };
            if let Some(negatives) = self.sampler.sample(self.snapshot, anchor, rng) {
                batch.contrastive.push(ContrastiveSample {
                    anchor,
                    positive,
                    negatives,
                });
            }

            batch.links.push(LinkSample {
                source: anchor,
                target: positive,
                label: if self.soft_labels { weight } else { 1.0 },
            });
            if let Some(other) = self.sampler.sample_non_edge(self.snapshot, anchor, rng) {
                batch.links.push(LinkSample {
                    source: anchor,
                    target: other,
                    label: 0.0,
                });
            }
        }
        batch
    }
}
