use crate::config::SliceOrder;

/// Acquisition time of each slice (in spatial order) within one TR.
///
/// With multiband factor `mb`, slices `i` and `i + n/mb` share a shot.
pub fn slice_timing(repetition_time: f64, slices: usize, multiband: usize, order: SliceOrder) -> Vec<f64> {
    if slices == 0 {
        return Vec::new();
    }
    let multiband = multiband.clamp(1, slices);
    let shots = slices.div_ceil(multiband);
    let step = repetition_time / shots as f64;
    let rank = shot_ranks(shots, order);

    (0..slices)
        .map(|slice| {
            let time = rank[slice % shots] as f64 * step;
            (time * 1e6).round() / 1e6
        })
        .collect()
}

/// `rank[shot]` is the position of that shot in acquisition order.
fn shot_ranks(shots: usize, order: SliceOrder) -> Vec<usize> {
    let acquisition: Vec<usize> = match order {
        SliceOrder::Ascending => (0..shots).collect(),
        SliceOrder::Descending => (0..shots).rev().collect(),
        SliceOrder::Interleaved => (0..shots).step_by(2).chain((1..shots).step_by(2)).collect(),
    };
    let mut rank = vec![0; shots];
    for (position, shot) in acquisition.into_iter().enumerate() {
        rank[shot] = position;
    }
    rank
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascending() {
        assert_eq!(
            slice_timing(2.0, 4, 1, SliceOrder::Ascending),
            vec![0.0, 0.5, 1.0, 1.5]
        );
    }

    #[test]
    fn test_descending() {
        assert_eq!(
            slice_timing(2.0, 4, 1, SliceOrder::Descending),
            vec![1.5, 1.0, 0.5, 0.0]
        );
    }

    #[test]
    fn test_interleaved() {
        // acquisition order 0, 2, 4, 1, 3
        assert_eq!(
            slice_timing(5.0, 5, 1, SliceOrder::Interleaved),
            vec![0.0, 3.0, 1.0, 4.0, 2.0]
        );
    }

    #[test]
    fn test_multiband_shares_shots() {
        let times = slice_timing(2.0, 6, 2, SliceOrder::Ascending);
        assert_eq!(times.len(), 6);
        assert_eq!(times[0], times[3]);
        assert_eq!(times[2], times[5]);
        assert!((times[1] - 2.0 / 3.0).abs() < 1e-6);
    }
}
