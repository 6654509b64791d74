//! DBSCAN over cosine distance.

use crate::inference::l2_normalize;

/// Cluster label per point, `None` for noise.
///
/// Points are visited in input order and clusters are numbered in the order
/// their first core point is reached, so the same input always produces the
/// same labels. A point counts as its own neighbor.
pub fn dbscan(points: &[Vec<f32>], eps: f32, min_samples: usize) -> Vec<Option<usize>> {
    let normalized: Vec<Vec<f32>> = points
        .iter()
        .map(|p| {
            let mut v = p.clone();
            l2_normalize(&mut v);
            v
        })
        .collect();

    let neighbors: Vec<Vec<usize>> = (0..normalized.len())
        .map(|i| {
            (0..normalized.len())
                .filter(|&j| cosine_distance(&normalized[i], &normalized[j]) <= eps)
                .collect()
        })
        .collect();

    let mut labels: Vec<Option<usize>> = vec![None; points.len()];
    let mut visited = vec![false; points.len()];
    let mut next_label = 0;

    for start in 0..points.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        if neighbors[start].len() < min_samples {
            // Noise for now; a later core point may still claim it
            continue;
        }

        let label = next_label;
        next_label += 1;
        labels[start] = Some(label);

        let mut queue: Vec<usize> = neighbors[start].clone();
        let mut head = 0;
        while head < queue.len() {
            let point = queue[head];
            head += 1;

            if labels[point].is_none() {
                labels[point] = Some(label);
            }
            if visited[point] {
                continue;
            }
            visited[point] = true;

            if neighbors[point].len() >= min_samples {
                queue.extend(neighbors[point].iter().copied());
            }
        }
    }

    labels
}

/// Both inputs must already be unit length
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    1.0 - dot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(angle_deg: f32) -> Vec<f32> {
        let r = angle_deg.to_radians();
        vec![r.cos(), r.sin()]
    }

    #[test]
    fn test_two_clusters_and_noise() {
        // cos(20°) ≈ 0.94, cos(90°) = 0
        let points = vec![
            unit(0.0),
            unit(10.0),
            unit(90.0),
            unit(100.0),
            unit(5.0),
            unit(225.0),
        ];
        let labels = dbscan(&points, 0.1, 2);
        assert_eq!(
            labels,
            vec![Some(0), Some(0), Some(1), Some(1), Some(0), None]
        );
    }

    #[test]
    fn test_deterministic_labels() {
        let points: Vec<Vec<f32>> = (0..30).map(|i| unit((i * 37 % 360) as f32)).collect();
        let first = dbscan(&points, 0.05, 2);
        for _ in 0..5 {
            assert_eq!(dbscan(&points, 0.05, 2), first);
        }
    }

    #[test]
    fn test_singletons_are_noise_with_min_samples_two() {
        let points = vec![unit(0.0), unit(120.0), unit(240.0)];
        assert_eq!(dbscan(&points, 0.5, 2), vec![None, None, None]);
        // With min_samples 1 every point is its own core
        assert_eq!(dbscan(&points, 0.5, 1), vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_border_point_joins_first_cluster() {
        // 14° is only reachable through 3°
        let points = vec![unit(0.0), unit(3.0), unit(14.0), unit(40.0), unit(43.0)];
        let labels = dbscan(&points, 1.0 - 12f32.to_radians().cos(), 2);
        assert_eq!(labels[0], Some(0));
        assert_eq!(labels[2], Some(0));
        assert_eq!(labels[3], Some(1));
    }

    #[test]
    fn test_empty_input() {
        assert!(dbscan(&[], 0.5, 2).is_empty());
    }
}
