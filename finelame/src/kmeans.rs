//! Lloyd's k-means over standardized fingerprints.
//!
//! Initialization is k-means++; the caller supplies the RNG so runs can be
//! seeded deterministically in tests.

use anyhow::{bail, Result};
use rand::Rng;

pub const MAX_ITERATIONS: usize = 300;
pub const TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct KMeansModel {
    pub centroids: Vec<Vec<f64>>,
    /// Cluster assignment per input row.
    pub labels: Vec<usize>,
    pub iterations: usize,
}

pub fn fit<R: Rng>(
    data: &[Vec<f64>],
    k: usize,
    max_iterations: usize,
    tolerance: f64,
    rng: &mut R,
) -> Result<KMeansModel> {
    if k == 0 {
        bail!("cluster count must be at least 1");
    }
    if data.len() < k {
        bail!("cannot fit {k} clusters to {} samples", data.len());
    }
    let width = data[0].len();
    if data.iter().any(|row| row.len() != width) {
        bail!("training rows have inconsistent widths");
    }

    let mut centroids = init_plus_plus(data, k, rng);
    let mut labels = vec![0usize; data.len()];
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;

        for (i, point) in data.iter().enumerate() {
            labels[i] = nearest_centroid(point, &centroids);
        }

        let mut sums = vec![vec![0.0; width]; k];
        let mut counts = vec![0usize; k];
        for (point, &label) in data.iter().zip(&labels) {
            counts[label] += 1;
            for (acc, value) in sums[label].iter_mut().zip(point) {
                *acc += value;
            }
        }

        let mut movement = 0.0;
        for cluster in 0..k {
            let new_centroid = if counts[cluster] == 0 {
                // reseed an empty cluster to the point farthest from its
                // current assignment
                farthest_point(data, &labels, &centroids).to_vec()
            } else {
                sums[cluster]
                    .iter()
                    .map(|sum| sum / counts[cluster] as f64)
                    .collect()
            };
            movement += squared_distance(&centroids[cluster], &new_centroid).sqrt();
            centroids[cluster] = new_centroid;
        }

        if movement <= tolerance {
            break;
        }
    }

    for (i, point) in data.iter().enumerate() {
        labels[i] = nearest_centroid(point, &centroids);
    }

    Ok(KMeansModel {
        centroids,
        labels,
        iterations,
    })
}

fn init_plus_plus<R: Rng>(data: &[Vec<f64>], k: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(data[rng.gen_range(0..data.len())].clone());

    let mut distances = vec![f64::INFINITY; data.len()];
    while centroids.len() < k {
        let newest = &centroids[centroids.len() - 1];
        for (slot, point) in distances.iter_mut().zip(data) {
            let d = squared_distance(point, newest);
            if d < *slot {
                *slot = d;
            }
        }

        let total: f64 = distances.iter().sum();
        if total <= 0.0 {
            // every point already coincides with a centroid
            centroids.push(data[rng.gen_range(0..data.len())].clone());
            continue;
        }

        let mut target = rng.gen::<f64>() * total;
        let mut chosen = data.len() - 1;
        for (i, d) in distances.iter().enumerate() {
            target -= d;
            if target <= 0.0 {
                chosen = i;
                break;
            }
        }
        centroids.push(data[chosen].clone());
    }
    centroids
}

fn nearest_centroid(point: &[f64], centroids: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let d = squared_distance(point, centroid);
        if d < best_distance {
            best_distance = d;
            best = i;
        }
    }
    best
}

fn farthest_point<'a>(
    data: &'a [Vec<f64>],
    labels: &[usize],
    centroids: &[Vec<f64>],
) -> &'a [f64] {
    let mut best = &data[0];
    let mut best_distance = -1.0;
    for (point, &label) in data.iter().zip(labels) {
        let d = squared_distance(point, &centroids[label]);
        if d > best_distance {
            best_distance = d;
            best = point;
        }
    }
    best
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_blobs() -> Vec<Vec<f64>> {
        let mut data = Vec::new();
        for i in 0..50 {
            let jitter = (i % 5) as f64 * 0.01;
            data.push(vec![0.0 + jitter, 0.0 - jitter]);
            data.push(vec![10.0 - jitter, 10.0 + jitter]);
        }
        data
    }

    #[test]
    fn recovers_two_separated_clusters() {
        let data = two_blobs();
        let mut rng = StdRng::seed_from_u64(7);
        let model = fit(&data, 2, MAX_ITERATIONS, TOLERANCE, &mut rng).unwrap();

        // even rows are the low blob, odd rows the high blob
        let low_label = model.labels[0];
        let high_label = model.labels[1];
        assert_ne!(low_label, high_label);
        for (i, &label) in model.labels.iter().enumerate() {
            let expected = if i % 2 == 0 { low_label } else { high_label };
            assert_eq!(label, expected, "row {i} assigned to the wrong blob");
        }

        let low = &model.centroids[low_label];
        let high = &model.centroids[high_label];
        assert!(low[0] < 1.0 && low[1] < 1.0);
        assert!(high[0] > 9.0 && high[1] > 9.0);
    }

    #[test]
    fn single_cluster_centroid_is_the_mean() {
        let data = vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]];
        let mut rng = StdRng::seed_from_u64(1);
        let model = fit(&data, 1, MAX_ITERATIONS, TOLERANCE, &mut rng).unwrap();
        assert!((model.centroids[0][0] - 2.5).abs() < 1e-9);
        assert!(model.labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn seeded_runs_are_deterministic() {
        let data = two_blobs();
        let a = fit(&data, 2, MAX_ITERATIONS, TOLERANCE, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = fit(&data, 2, MAX_ITERATIONS, TOLERANCE, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn too_few_samples_is_an_error() {
        let data = vec![vec![1.0]];
        let mut rng = StdRng::seed_from_u64(0);
        assert!(fit(&data, 2, MAX_ITERATIONS, TOLERANCE, &mut rng).is_err());
        assert!(fit(&data, 0, MAX_ITERATIONS, TOLERANCE, &mut rng).is_err());
    }

    #[test]
    fn duplicate_points_do_not_stall_initialization() {
        let data = vec![vec![5.0, 5.0]; 10];
        let mut rng = StdRng::seed_from_u64(3);
        let model = fit(&data, 3, MAX_ITERATIONS, TOLERANCE, &mut rng).unwrap();
        assert_eq!(model.centroids.len(), 3);
    }
}
