//! Streaming quantile estimation with a merging t-digest.
//!
//! Costs arrive one at a time and we need the quantile of each new cost
//! relative to everything seen so far. Centroids near the tails stay small
//! so extreme quantiles, the ones the reward cares about, stay accurate.

/// A weighted cluster of nearby observations.
#[derive(Debug, Clone, Copy)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// Merging t-digest. `cdf` interpolates between centroid means; `update`
/// buffers points and compresses when the buffer fills.
#[derive(Debug, Clone)]
pub struct Digest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<f64>,
    count: f64,
    min: f64,
    max: f64,
}

impl Default for Digest {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl Digest {
    pub fn new(compression: f64) -> Self {
        Self {
            compression,
            centroids: Vec::new(),
            buffer: Vec::new(),
            count: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn count(&self) -> u64 {
        (self.count + self.buffer.len() as f64) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0.0 && self.buffer.is_empty()
    }

    pub fn update(&mut self, x: f64) {
        self.min = self.min.min(x);
        self.max = self.max.max(x);
        self.buffer.push(x);
        if self.buffer.len() >= 10 * self.compression as usize {
            self.compress();
        }
    }

    /// Fold buffered points into the centroid list, then merge adjacent
    /// centroids while the merged weight respects the size bound
    /// `4·n·q(1−q)/compression` at the merge midpoint.
    fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut all: Vec<Centroid> = self.centroids.drain(..).collect();
        all.extend(self.buffer.drain(..).map(|x| Centroid {
            mean: x,
            weight: 1.0,
        }));
        all.sort_by(|a, b| a.mean.total_cmp(&b.mean));
        let total: f64 = all.iter().map(|c| c.weight).sum();
        self.count = total;

        let mut merged: Vec<Centroid> = Vec::with_capacity(self.compression as usize * 2);
        let mut seen = 0.0;
        for c in all {
            match merged.last_mut() {
                Some(last) => {
                    let proposed = last.weight + c.weight;
                    let q = (seen + proposed / 2.0) / total;
                    let limit = 4.0 * total * q * (1.0 - q) / self.compression;
                    if proposed <= limit.max(1.0) {
                        last.mean = (last.mean * last.weight + c.mean * c.weight) / proposed;
                        last.weight = proposed;
                    } else {
                        seen += last.weight;
                        merged.push(c);
                    }
                }
                None => merged.push(c),
            }
        }
        self.centroids = merged;
    }

    /// Fraction of observations at or below `x`. Empty digest reports 0.
    pub fn cdf(&mut self, x: f64) -> f64 {
        self.compress();
        if self.centroids.is_empty() {
            return 0.0;
        }
        if x < self.min {
            return 0.0;
        }
        if x >= self.max {
            return 1.0;
        }
        if self.centroids.len() == 1 {
            // Single centroid and min <= x < max: call it the middle.
            return 0.5;
        }

        // Weight strictly to the left of each centroid's mean, treating
        // each centroid as half before and half after its mean.
        let mut seen = 0.0;
        for i in 0..self.centroids.len() {
            let c = self.centroids[i];
            let c_left = seen + c.weight / 2.0;
            if x < c.mean {
                if i == 0 {
                    // Between the global min and the first mean.
                    let span = c.mean - self.min;
                    if span <= 0.0 {
                        return c_left / self.count;
                    }
                    return (x - self.min) / span * c_left / self.count;
                }
                let prev = self.centroids[i - 1];
                let prev_left = seen - prev.weight / 2.0;
                let span = c.mean - prev.mean;
                let frac = if span > 0.0 { (x - prev.mean) / span } else { 0.5 };
                return (prev_left + frac * (c_left - prev_left)) / self.count;
            }
            seen += c.weight;
        }
        // x below max but above the last mean.
        let last = self.centroids[self.centroids.len() - 1];
        let last_left = self.count - last.weight / 2.0;
        let span = self.max - last.mean;
        let frac = if span > 0.0 { (x - last.mean) / span } else { 1.0 };
        (last_left + frac * (self.count - last_left)) / self.count
    }
}
