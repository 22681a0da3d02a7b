use std::time::Duration;

/// Median of a set of durations, `None` when empty.
pub fn median(durations: &[Duration]) -> Option<Duration> {
    if durations.is_empty() {
        return None;
    }

    let mut sorted = durations.to_vec();
    sorted.sort();

    let mid = sorted.len() / 2;

    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2)
    } else {
        Some(sorted[mid])
    }
}

pub fn mean(durations: &[Duration]) -> Option<Duration> {
    if durations.is_empty() {
        return None;
    }

    let sum = durations.iter().sum::<Duration>();

    Some(sum / durations.len() as u32)
}

/// Mean absolute difference between consecutive samples.
///
/// Needs at least two samples.
pub fn jitter(durations: &[Duration]) -> Option<Duration> {
    if durations.len() < 2 {
        return None;
    }

    let deltas: Vec<Duration> =
        durations.windows(2).map(|pair| pair[0].abs_diff(pair[1])).collect();

    mean(&deltas)
}

/// Share of unanswered probes as a percentage in `[0, 100]`.
pub fn packet_loss_percent(sent: usize, received: usize) -> f64 {
    if sent == 0 {
        return 0.0;
    }

    let lost = sent.saturating_sub(received);

    lost as f64 / sent as f64 * 100.0
}
