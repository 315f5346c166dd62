//! # Silence-Based Segmentation
//!
//! Turns a mono audio signal into consecutive time segments, one per track,
//! by looking for sustained quiet regions between tracks.
//!
//! ## Pipeline:
//! 1. **Energy**: short-time RMS over centred, zero-padded frames
//! 2. **Quiet flags**: a frame is quiet iff its energy is *strictly* below the threshold
//! 3. **Edges**: first difference of the quiet flags; `+1` starts a quiet
//!    region at the next frame, `-1` ends one at the next frame
//! 4. **Edge repair**: quiet regions cut off by the start or end of the signal
//!    are closed with implicit edges (see [`adjust_indices`])
//! 5. **Filtering**: quiet regions *strictly* longer than `min_silence_seconds` survive
//! 6. **Markers**: midpoint of each surviving region; first forced to `0.0`,
//!    last forced to the total duration
//! 7. **Segments**: consecutive marker pairs
//!
//! ## Tie convention:
//! Energy equal to the threshold is *not* quiet, and a quiet region whose
//! duration equals `min_silence_seconds` is discarded.
//!
//! Everything here is pure and allocation-local; callers run it on a blocking
//! thread because it is CPU-bound.

use serde::{Deserialize, Serialize};

/// Tunables of the segmentation algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentParams {
    /// Samples per analysis frame
    pub frame_length: usize,

    /// Samples between the starts of consecutive frames
    pub hop_length: usize,

    /// RMS energy below which a frame counts as quiet
    pub energy_threshold: f32,

    /// Quiet regions must be strictly longer than this to mark a boundary
    pub min_silence_seconds: f64,

    /// Edge-repair gap in frames. Empirical: a first start/end pair further
    /// apart than this is read as "the signal began already quiet".
    pub edge_gap_frames: usize,
}

impl Default for SegmentParams {
    fn default() -> Self {
        Self {
            frame_length: 2048,
            hop_length: 1024,
            energy_threshold: 0.005,
            min_silence_seconds: 0.75,
            edge_gap_frames: 100,
        }
    }
}

/// A span of the input, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSegment {
    pub start: f64,
    pub end: f64,
}

impl TimeSegment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Result of a segmentation run.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOutcome {
    /// Three or more markers: contiguous segments covering `[0, total]`
    Split(Vec<TimeSegment>),

    /// At most two markers: the input cannot usefully be split, the only
    /// segment is the whole input
    Undivided(TimeSegment),

    /// No quiet edge or no quiet region long enough to derive anything
    NoSegments,
}

impl SegmentOutcome {
    pub fn segments(&self) -> &[TimeSegment] {
        match self {
            SegmentOutcome::Split(segments) => segments,
            SegmentOutcome::Undivided(whole) => std::slice::from_ref(whole),
            SegmentOutcome::NoSegments => &[],
        }
    }
}

/// Segment a mono signal.
pub fn compute_segments(samples: &[f32], sample_rate: u32, params: &SegmentParams) -> SegmentOutcome {
    if sample_rate == 0 {
        return SegmentOutcome::NoSegments;
    }
    let energy = frame_energy(samples, params.frame_length, params.hop_length);
    let total_duration = samples.len() as f64 / sample_rate as f64;
    segments_from_energy(&energy, sample_rate, total_duration, params)
}

/// Short-time RMS energy with centred framing.
///
/// The signal is padded with `frame_length / 2` zeros on both sides, so frame
/// `t` is centred on sample `t * hop_length`. Uses a prefix sum of squares so
/// the cost is linear in the signal length regardless of frame size.
pub fn frame_energy(samples: &[f32], frame_length: usize, hop_length: usize) -> Vec<f32> {
    if frame_length == 0 || hop_length == 0 {
        return Vec::new();
    }

    let pad = frame_length / 2;
    let padded_len = samples.len() + 2 * pad;
    if padded_len < frame_length {
        return Vec::new();
    }
    let frame_count = 1 + (padded_len - frame_length) / hop_length;

    let mut prefix = Vec::with_capacity(samples.len() + 1);
    prefix.push(0.0f64);
    let mut running = 0.0f64;
    for &sample in samples {
        running += (sample as f64) * (sample as f64);
        prefix.push(running);
    }

    (0..frame_count)
        .map(|t| {
            // Window in padded coordinates is [t*hop, t*hop + frame); shift back by `pad`.
            let lo = (t * hop_length).saturating_sub(pad).min(samples.len());
            let hi = (t * hop_length + frame_length).saturating_sub(pad).min(samples.len());
            let power = (prefix[hi] - prefix[lo]) / frame_length as f64;
            power.max(0.0).sqrt() as f32
        })
        .collect()
}

/// Steps 2–8 on a precomputed energy trace.
pub fn segments_from_energy(
    energy: &[f32],
    sample_rate: u32,
    total_duration: f64,
    params: &SegmentParams,
) -> SegmentOutcome {
    let markers = boundary_markers(energy, sample_rate, total_duration, params);
    if markers.is_empty() {
        return SegmentOutcome::NoSegments;
    }
    if markers.len() <= 2 {
        return SegmentOutcome::Undivided(TimeSegment {
            start: 0.0,
            end: total_duration,
        });
    }

    let segments: Vec<TimeSegment> = markers
        .windows(2)
        .map(|pair| TimeSegment {
            start: pair[0],
            end: pair[1],
        })
        .collect();
    debug_assert!(segments.iter().all(|segment| segment.end > segment.start));
    SegmentOutcome::Split(segments)
}

/// Boundary markers with the first and last already forced to `0` and `total_duration`.
fn boundary_markers(energy: &[f32], sample_rate: u32, total_duration: f64, params: &SegmentParams) -> Vec<f64> {
    if energy.len() < 2 || sample_rate == 0 {
        return Vec::new();
    }

    let quiet: Vec<bool> = energy
        .iter()
        .map(|&value| value < params.energy_threshold)
        .collect();
    let (starts, ends) = quiet_edges(&quiet);
    let last_index = energy.len() - 1;
    let (starts, ends) = adjust_indices(&starts, &ends, last_index, params.edge_gap_frames);

    let frame_seconds = params.hop_length as f64 / sample_rate as f64;
    let mut markers: Vec<f64> = starts
        .iter()
        .zip(ends.iter())
        .map(|(&start, &end)| (start as f64 * frame_seconds, end as f64 * frame_seconds))
        .filter(|(start, end)| end - start > params.min_silence_seconds)
        .map(|(start, end)| (start + end) / 2.0)
        .collect();

    if let Some(first) = markers.first_mut() {
        *first = 0.0;
    }
    if let Some(last) = markers.last_mut() {
        *last = total_duration;
    }
    markers
}

/// Frame indices where quiet regions start and end.
fn quiet_edges(quiet: &[bool]) -> (Vec<usize>, Vec<usize>) {
    let mut starts = Vec::new();
    let mut ends = Vec::new();
    for (i, pair) in quiet.windows(2).enumerate() {
        match (pair[0], pair[1]) {
            (false, true) => starts.push(i + 1),
            (true, false) => ends.push(i + 1),
            _ => {}
        }
    }
    (starts, ends)
}

/// Close quiet regions truncated by either edge of the signal.
///
/// - Equal counts and the first start/end more than `edge_gap` apart: the
///   signal both began and ended quiet, so a start at `0` is prepended and an
///   end at `last_index` appended.
/// - Counts differ and the first pair is more than `edge_gap` apart: the
///   signal began quiet, prepend a start at `0`.
/// - Otherwise, counts differ and the last pair is more than `edge_gap` apart:
///   the signal ended quiet, append an end at `last_index`.
/// - Only ends: quiet from the very start; only starts: quiet until the very end.
///
/// Returns new vectors; the inputs are left untouched.
pub fn adjust_indices(
    starts: &[usize],
    ends: &[usize],
    last_index: usize,
    edge_gap: usize,
) -> (Vec<usize>, Vec<usize>) {
    let mut starts = starts.to_vec();
    let mut ends = ends.to_vec();

    match (starts.first().copied(), ends.first().copied()) {
        (None, None) => {}
        (None, Some(_)) => starts.insert(0, 0),
        (Some(_), None) => ends.push(last_index),
        (Some(first_start), Some(first_end)) => {
            let first_gap = first_start.abs_diff(first_end);
            if starts.len() == ends.len() {
                if first_gap > edge_gap {
                    starts.insert(0, 0);
                    ends.push(last_index);
                }
            } else if first_gap > edge_gap {
                starts.insert(0, 0);
            } else {
                let last_start = starts[starts.len() - 1];
                let last_end = ends[ends.len() - 1];
                if last_start.abs_diff(last_end) > edge_gap {
                    ends.push(last_index);
                }
            }
        }
    }

    (starts, ends)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One frame per "second": hop 1 at 1 Hz, so frame index == seconds.
    fn unit_params(min_silence_seconds: f64, edge_gap_frames: usize) -> SegmentParams {
        SegmentParams {
            frame_length: 1,
            hop_length: 1,
            energy_threshold: 0.5,
            min_silence_seconds,
            edge_gap_frames,
        }
    }

    fn assert_contiguous(segments: &[TimeSegment], total: f64) {
        assert_eq!(segments.first().unwrap().start, 0.0);
        assert_eq!(segments.last().unwrap().end, total);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        for segment in segments {
            assert!(segment.end > segment.start);
        }
    }

    #[test]
    fn test_all_loud_has_no_segments() {
        let energy = vec![1.0f32; 50];
        let outcome = segments_from_energy(&energy, 1, 50.0, &unit_params(0.1, 100));
        assert_eq!(outcome, SegmentOutcome::NoSegments);
        assert!(outcome.segments().is_empty());
    }

    #[test]
    fn test_all_quiet_has_no_segments() {
        let energy = vec![0.0f32; 50];
        let outcome = segments_from_energy(&energy, 1, 50.0, &unit_params(0.1, 100));
        assert_eq!(outcome, SegmentOutcome::NoSegments);
    }

    #[test]
    fn test_tiny_inputs_do_not_fault() {
        let params = unit_params(0.1, 100);
        assert_eq!(segments_from_energy(&[], 1, 0.0, &params), SegmentOutcome::NoSegments);
        assert_eq!(segments_from_energy(&[0.0], 1, 1.0, &params), SegmentOutcome::NoSegments);
        assert_eq!(compute_segments(&[], 16000, &SegmentParams::default()), SegmentOutcome::NoSegments);
        assert_eq!(compute_segments(&[0.1; 10], 0, &SegmentParams::default()), SegmentOutcome::NoSegments);
    }

    #[test]
    fn test_leading_quiet_only_is_one_whole_segment() {
        // First 10 frames quiet, the rest loud: a single boundary.
        let mut energy = vec![0.0f32; 10];
        energy.extend(vec![1.0f32; 30]);
        let outcome = segments_from_energy(&energy, 1, 40.0, &unit_params(0.5, 100));
        assert_eq!(outcome, SegmentOutcome::Undivided(TimeSegment { start: 0.0, end: 40.0 }));
        assert_contiguous(outcome.segments(), 40.0);
    }

    #[test]
    fn test_trailing_quiet_only_is_one_whole_segment() {
        let mut energy = vec![1.0f32; 30];
        energy.extend(vec![0.0f32; 10]);
        let outcome = segments_from_energy(&energy, 1, 40.0, &unit_params(0.5, 100));
        assert_eq!(outcome, SegmentOutcome::Undivided(TimeSegment { start: 0.0, end: 40.0 }));
    }

    #[test]
    fn test_quiet_loud_quiet_trace() {
        // [0,0,0,1,1,1,1,0,0,0]: quiet regions at both edges.
        let energy = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0];

        // With the default edge gap the 4-frame loud run is too short to
        // trigger edge repair; the lone (start=7, end=3) pair is negative.
        let outcome = segments_from_energy(&energy, 1, 10.0, &unit_params(0.5, 100));
        assert_eq!(outcome, SegmentOutcome::NoSegments);

        // A smaller gap repairs both edges: quiet regions [0,3] and [7,9]
        // give two markers, forced to [0, total].
        let outcome = segments_from_energy(&energy, 1, 10.0, &unit_params(0.5, 3));
        assert_eq!(outcome, SegmentOutcome::Undivided(TimeSegment { start: 0.0, end: 10.0 }));
    }

    #[test]
    fn test_three_quiet_regions_give_two_segments() {
        let energy = [0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0];
        let outcome = segments_from_energy(&energy, 1, 12.0, &unit_params(0.5, 2));
        match outcome {
            SegmentOutcome::Split(segments) => {
                assert_eq!(
                    segments,
                    vec![
                        TimeSegment { start: 0.0, end: 6.0 },
                        TimeSegment { start: 6.0, end: 12.0 },
                    ]
                );
                assert_contiguous(&segments, 12.0);
            }
            other => panic!("expected a split, got {:?}", other),
        }
    }

    #[test]
    fn test_energy_equal_to_threshold_is_not_quiet() {
        let trace = |level: f32| {
            let mut energy = vec![1.0f32; 3];
            energy.extend(vec![level; 4]);
            energy.extend(vec![1.0f32; 3]);
            energy
        };
        let params = unit_params(1.0, 100);

        let at_threshold = segments_from_energy(&trace(0.5), 1, 10.0, &params);
        assert_eq!(at_threshold, SegmentOutcome::NoSegments);

        let below_threshold = segments_from_energy(&trace(0.499), 1, 10.0, &params);
        assert_eq!(below_threshold, SegmentOutcome::Undivided(TimeSegment { start: 0.0, end: 10.0 }));
    }

    #[test]
    fn test_duration_equal_to_min_silence_is_discarded() {
        // hop 1 at 4 Hz: 0.25 s per frame. Quiet runs of 3 frames (0.75 s) and 5 frames (1.25 s).
        let mut energy = vec![1.0f32; 4];
        energy.extend(vec![0.0f32; 3]);
        energy.extend(vec![1.0f32; 4]);
        energy.extend(vec![0.0f32; 5]);
        energy.extend(vec![1.0f32; 4]);

        let mut params = unit_params(0.75, 100);
        assert_eq!(boundary_markers(&energy, 4, 5.0, &params).len(), 1);

        params.min_silence_seconds = 0.7499;
        assert_eq!(boundary_markers(&energy, 4, 5.0, &params).len(), 2);
    }

    #[test]
    fn test_markers_forced_to_signal_edges() {
        let energy = [0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0];
        let markers = boundary_markers(&energy, 1, 12.5, &unit_params(0.5, 2));
        assert_eq!(markers.first(), Some(&0.0));
        assert_eq!(markers.last(), Some(&12.5));
        assert_eq!(markers.len(), 3);
    }

    // Characterisation of the empirical edge-gap rule, not a statement that it is right.
    #[test]
    fn test_adjust_indices_equal_counts() {
        // Began and ended quiet: first edge is an end far from the first start.
        let (starts, ends) = adjust_indices(&[150, 400], &[20, 170], 499, 100);
        assert_eq!(starts, vec![0, 150, 400]);
        assert_eq!(ends, vec![20, 170, 499]);

        // Began and ended loud: nothing to repair.
        let (starts, ends) = adjust_indices(&[150, 400], &[170, 420], 499, 100);
        assert_eq!(starts, vec![150, 400]);
        assert_eq!(ends, vec![170, 420]);
    }

    #[test]
    fn test_adjust_indices_unequal_counts() {
        // Began quiet, ended loud.
        let (starts, ends) = adjust_indices(&[150], &[20, 170], 499, 100);
        assert_eq!(starts, vec![0, 150]);
        assert_eq!(ends, vec![20, 170]);

        // Began loud, ended quiet.
        let (starts, ends) = adjust_indices(&[150, 400], &[170], 499, 100);
        assert_eq!(starts, vec![150, 400]);
        assert_eq!(ends, vec![170, 499]);

        // Gaps at or under the threshold leave the edges alone.
        let (starts, ends) = adjust_indices(&[150, 200], &[170], 499, 100);
        assert_eq!(starts, vec![150, 200]);
        assert_eq!(ends, vec![170]);
    }

    #[test]
    fn test_adjust_indices_gap_equal_to_edge_gap_is_not_corrected() {
        let (starts, ends) = adjust_indices(&[120, 400], &[20, 420], 499, 100);
        assert_eq!(starts, vec![120, 400]);
        assert_eq!(ends, vec![20, 420]);

        let (starts, ends) = adjust_indices(&[121, 400], &[20, 420], 499, 100);
        assert_eq!(starts, vec![0, 121, 400]);
        assert_eq!(ends, vec![20, 420, 499]);
    }

    #[test]
    fn test_adjust_indices_one_sided() {
        assert_eq!(adjust_indices(&[], &[], 9, 100), (vec![], vec![]));
        assert_eq!(adjust_indices(&[], &[4], 9, 100), (vec![0], vec![4]));
        assert_eq!(adjust_indices(&[4], &[], 9, 100), (vec![4], vec![9]));
    }

    #[test]
    fn test_adjust_indices_does_not_mutate_inputs() {
        let starts = vec![150usize];
        let ends = vec![20usize, 170];
        let _ = adjust_indices(&starts, &ends, 499, 100);
        assert_eq!(starts, vec![150]);
        assert_eq!(ends, vec![20, 170]);
    }

    #[test]
    fn test_frame_energy_centered_framing() {
        // frame 4, hop 2, pad 2: frame t covers samples [2t-2, 2t+2).
        let samples = [1.0f32, 1.0, 0.0, 0.0, 0.0, 0.0];
        let energy = frame_energy(&samples, 4, 2);
        assert_eq!(energy.len(), 1 + samples.len() / 2);
        assert!((energy[0] - (2.0f32 / 4.0).sqrt()).abs() < 1e-6);
        assert!((energy[1] - (2.0f32 / 4.0).sqrt()).abs() < 1e-6);
        assert_eq!(energy[2], 0.0);
        assert_eq!(energy[3], 0.0);
    }

    #[test]
    fn test_frame_energy_constant_signal() {
        let samples = vec![0.5f32; 10_000];
        let energy = frame_energy(&samples, 2048, 1024);
        assert_eq!(energy.len(), 1 + 10_000 / 1024);
        // Interior frames see the full signal.
        for value in &energy[1..energy.len() - 2] {
            assert!((value - 0.5).abs() < 1e-4);
        }
        // Edge frames are half padding.
        assert!(energy[0] < 0.5);
    }

    #[test]
    fn test_frame_energy_degenerate_lengths() {
        assert!(frame_energy(&[1.0; 10], 0, 4).is_empty());
        assert!(frame_energy(&[1.0; 10], 4, 0).is_empty());
        assert_eq!(frame_energy(&[], 4, 2), vec![0.0]);
    }

    /// Synthetic playlist: 1 s silence, then three 10 s tones separated by
    /// 2 s of silence, then 1 s of silence.
    fn synthetic_playlist(sample_rate: u32) -> Vec<f32> {
        let sr = sample_rate as usize;
        let tone = |seconds: usize| {
            (0..seconds * sr)
                .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sample_rate as f32).sin())
                .collect::<Vec<f32>>()
        };
        let silence = |seconds: usize| vec![0.0f32; seconds * sr];

        let mut samples = silence(1);
        samples.extend(tone(10));
        samples.extend(silence(2));
        samples.extend(tone(10));
        samples.extend(silence(2));
        samples.extend(tone(10));
        samples.extend(silence(1));
        samples
    }

    #[test]
    fn test_compute_segments_on_synthetic_playlist() {
        let sample_rate = 16_000;
        let samples = synthetic_playlist(sample_rate);
        let total = samples.len() as f64 / sample_rate as f64;

        let outcome = compute_segments(&samples, sample_rate, &SegmentParams::default());
        let SegmentOutcome::Split(segments) = outcome else {
            panic!("expected a split, got {:?}", outcome);
        };

        assert_eq!(segments.len(), 3);
        assert_contiguous(&segments, total);
        assert!((segments[0].end - 12.0).abs() < 0.2, "first boundary at {}", segments[0].end);
        assert!((segments[1].end - 24.0).abs() < 0.2, "second boundary at {}", segments[1].end);
    }

    #[test]
    fn test_compute_segments_short_pause_is_not_a_boundary() {
        let sample_rate = 16_000;
        let sr = sample_rate as usize;
        let tone: Vec<f32> = (0..5 * sr).map(|i| if i % 2 == 0 { 0.3 } else { -0.3 }).collect();

        // Half a second of silence is a mid-phrase pause, not a track break.
        let mut samples = tone.clone();
        samples.extend(vec![0.0f32; sr / 2]);
        samples.extend(tone);

        let outcome = compute_segments(&samples, sample_rate, &SegmentParams::default());
        assert_eq!(outcome, SegmentOutcome::NoSegments);
    }
}
