//! Sample layout conversion between device streams and the 24 kHz mono link.

/// Average interleaved frames down to a single channel.
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let channels = usize::from(channels);
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear interpolation between two sample rates.
///
/// Each call is independent, so chunk boundaries are not smoothed.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages_frames() {
        assert_eq!(downmix_to_mono(&[0.25, 0.75, -1.0, 1.0], 2), vec![0.5, 0.0]);
        assert_eq!(downmix_to_mono(&[0.5, 0.25], 1), vec![0.5, 0.25]);
    }

    #[test]
    fn test_resample_changes_length_by_ratio() {
        let input = vec![0.0; 4800];
        assert_eq!(resample_linear(&input, 48000, 24000).len(), 2400);
        assert_eq!(resample_linear(&input, 24000, 48000).len(), 9600);
        assert_eq!(resample_linear(&[], 48000, 24000), Vec::<f32>::new());
    }

    #[test]
    fn test_resample_interpolates() {
        let up = resample_linear(&[0.0, 1.0], 1, 2);
        assert_eq!(up, vec![0.0, 0.5, 1.0, 1.0]);

        let same = resample_linear(&[0.1, 0.2], 24000, 24000);
        assert_eq!(same, vec![0.1, 0.2]);
    }
}
