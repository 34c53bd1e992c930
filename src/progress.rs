//! Throughput and remaining time estimates for the leader's progress lines.
//!
//! The tracker only observes, nothing in the training loop depends on it.

use std::{
    cell::Cell,
    collections::VecDeque,
    rc::Rc,
    time::{Duration, Instant},
};

use log::info;

use crate::training::Metrics;

const BAR_CELLS: usize = 30;
const MAX_STEP_TIMES: usize = 100;
const MEDIAN_WINDOW: usize = 50;
const SMOOTHING: f64 = 0.3;
const RULE: &str = "============================================================";

/// A monotonic time source.
pub trait Clock {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

/// The wall clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

/// A throughput estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// Steps per second.
    pub rate: f64,
    /// Seconds left, `None` when nothing is left.
    pub eta: Option<f64>,
}

type Sink = Box<dyn FnMut(&str)>;

/// Tracks step durations and reports progress every few steps.
pub struct ProgressTracker<K: Clock = SystemClock> {
    clock: K,
    sink: Sink,
    report_every: usize,

    training_start: Duration,
    epoch_start: Duration,
    last_step: Option<Duration>,

    step_times: VecDeque<f64>,
    step_time_ema: Option<f64>,
    epoch_time_ema: Option<f64>,

    current_epoch: usize,
    total_epochs: usize,
    current_step: usize,
    total_steps: usize,
}

impl ProgressTracker<SystemClock> {
    /// Creates a tracker that logs its report lines at info level.
    ///
    /// # Arguments
    /// * `report_every` - Report every this many steps, and on the last one.
    pub fn new(report_every: usize) -> Self {
        Self::with_clock(SystemClock::default(), report_every, Box::new(|line: &str| info!("{line}")))
    }
}

impl<K: Clock> ProgressTracker<K> {
    /// Creates a tracker over `clock` writing its lines to `sink`.
    pub fn with_clock(clock: K, report_every: usize, sink: Sink) -> Self {
        let now = clock.now();

        Self {
            clock,
            sink,
            report_every: report_every.max(1),
            training_start: now,
            epoch_start: now,
            last_step: None,
            step_times: VecDeque::with_capacity(MAX_STEP_TIMES),
            step_time_ema: None,
            epoch_time_ema: None,
            current_epoch: 0,
            total_epochs: 0,
            current_step: 0,
            total_steps: 0,
        }
    }

    pub fn start_training(&mut self, total_epochs: usize) {
        self.training_start = self.clock.now();
        self.total_epochs = total_epochs;
        self.epoch_time_ema = None;

        self.emit(format!("Total epochs: {total_epochs}"));
    }

    /// Starts timing an epoch.
    ///
    /// # Arguments
    /// * `epoch_index` - The 0-based index of the epoch.
    /// * `total_steps` - How many steps the epoch runs.
    pub fn start_epoch(&mut self, epoch_index: usize, total_steps: usize) {
        let now = self.clock.now();

        self.current_epoch = epoch_index;
        self.total_steps = total_steps;
        self.current_step = 0;
        self.epoch_start = now;
        self.last_step = Some(now);
        self.step_times.clear();
        self.step_time_ema = None;

        self.emit(RULE.to_string());
        self.emit(format!(
            "STARTING EPOCH {}/{}",
            epoch_index + 1,
            self.total_epochs
        ));
        self.emit(format!("Steps in epoch: {total_steps}"));
        self.emit(RULE.to_string());
    }

    /// Records that step `step_index` (0-based) finished.
    pub fn update_step(&mut self, step_index: usize, metrics: Option<&Metrics>) {
        let now = self.clock.now();
        self.current_step = step_index + 1;

        if let Some(last) = self.last_step {
            let dt = (now - last).as_secs_f64();
            if dt > 0.0 {
                if self.step_times.len() == MAX_STEP_TIMES {
                    self.step_times.pop_front();
                }
                self.step_times.push_back(dt);
                self.step_time_ema = Some(match self.step_time_ema {
                    None => dt,
                    Some(ema) => (1.0 - SMOOTHING) * ema + SMOOTHING * dt,
                });
            }
        }
        self.last_step = Some(now);

        let last = step_index + 1 == self.total_steps;
        if step_index % self.report_every == 0 || last {
            self.report(now, metrics);
        }
    }

    /// Closes the current epoch and estimates the remaining run time.
    pub fn end_epoch(&mut self, final_metrics: Option<&Metrics>) {
        let now = self.clock.now();
        let epoch_time = (now - self.epoch_start).as_secs_f64();
        let total_elapsed = (now - self.training_start).as_secs_f64();

        let ema = match self.epoch_time_ema {
            None => epoch_time,
            Some(ema) => (1.0 - SMOOTHING) * ema + SMOOTHING * epoch_time,
        };
        self.epoch_time_ema = Some(ema);

        let remaining_epochs = self.total_epochs.saturating_sub(self.current_epoch + 1);

        self.emit(format!("EPOCH {} COMPLETED", self.current_epoch + 1));
        let mut line = format!(
            "Epoch time: {} | Total elapsed: {}",
            format_duration(Some(epoch_time)),
            format_duration(Some(total_elapsed))
        );
        if remaining_epochs > 0 {
            let remaining = remaining_epochs as f64 * ema;
            line.push_str(&format!(" | Remaining: {}", format_duration(Some(remaining))));
        }
        self.emit(line);

        if let Some(metrics) = final_metrics.filter(|m| !m.is_empty()) {
            self.emit("EPOCH METRICS:".to_string());
            for (name, value) in metrics {
                self.emit(format!("  {name}: {value:.6}"));
            }
        }

        self.emit(RULE.to_string());
    }

    /// Closes the run.
    ///
    /// # Returns
    /// The time since `start_training`.
    pub fn end_training(&mut self) -> Duration {
        let total = self.clock.now() - self.training_start;

        self.emit("TRAINING COMPLETED".to_string());
        self.emit(format!(
            "Total training time: {}",
            format_duration(Some(total.as_secs_f64()))
        ));

        total
    }

    /// The current estimate for the running epoch.
    pub fn epoch_estimate(&self) -> Option<Estimate> {
        let elapsed = (self.clock.now() - self.epoch_start).as_secs_f64();
        self.estimate(self.current_step, self.total_steps, elapsed)
    }

    /// Blends the recent and the overall rate into an estimate.
    ///
    /// The smoothed step time dominates when there is another signal to blend
    /// it with, otherwise the median of the available rates is used.
    fn estimate(&self, done: usize, total: usize, elapsed: f64) -> Option<Estimate> {
        if elapsed <= 0.0 || done == 0 {
            return None;
        }

        let ema_rate = self.step_time_ema.filter(|t| *t > 0.0).map(|t| 1.0 / t);

        let mut others = Vec::with_capacity(2);
        if self.step_times.len() >= 3 {
            let take = self.step_times.len().min(MEDIAN_WINDOW);
            let recent: Vec<f64> = self.step_times.iter().rev().take(take).copied().collect();
            let med = median(recent);
            if med > 0.0 {
                others.push(1.0 / med);
            }
        }

        let overall = done as f64 / elapsed;
        if overall > 0.0 {
            others.push(overall);
        }

        let rate = match ema_rate {
            Some(ema) if !others.is_empty() => {
                0.7 * ema + 0.3 * others.iter().sum::<f64>() / others.len() as f64
            }
            _ => {
                let mut rates = others;
                rates.extend(ema_rate);
                if rates.is_empty() {
                    return None;
                }
                median(rates)
            }
        };

        let remaining = total.saturating_sub(done);
        let eta = (remaining > 0 && rate > 0.0).then(|| remaining as f64 / rate);
        Some(Estimate { rate, eta })
    }

    /// Remaining run time, extrapolated from the average time per step.
    fn total_eta(&self, now: Duration) -> Option<f64> {
        let completed = self.current_epoch * self.total_steps + self.current_step;
        let total = self.total_epochs * self.total_steps;
        if completed == 0 || total == 0 {
            return None;
        }

        let elapsed = (now - self.training_start).as_secs_f64();
        let per_step = elapsed / completed as f64;
        Some(total.saturating_sub(completed) as f64 * per_step)
    }

    fn report(&mut self, now: Duration, metrics: Option<&Metrics>) {
        let done = self.current_step;
        let total = self.total_steps.max(1);
        let progress = done as f64 / total as f64 * 100.0;
        let filled = ((BAR_CELLS as f64 * progress / 100.0) as usize).min(BAR_CELLS);
        let bar = format!("{}{}", "#".repeat(filled), "-".repeat(BAR_CELLS - filled));

        let elapsed = (now - self.epoch_start).as_secs_f64();
        let estimate = self.estimate(done, self.total_steps, elapsed);

        let rate = match estimate {
            Some(Estimate { rate, .. }) if rate >= 10.0 => format!("{rate:.0} step/sec"),
            Some(Estimate { rate, .. }) if rate >= 1.0 => format!("{rate:.1} step/sec"),
            Some(Estimate { rate, .. }) => format!("{:.1}s/step", 1.0 / rate),
            None => "? step/sec".to_string(),
        };

        let epoch_eta = eta_label(estimate.and_then(|e| e.eta));
        let total_eta = if self.total_epochs <= 1 {
            epoch_eta.clone()
        } else {
            eta_label(self.total_eta(now))
        };

        self.emit(format!(
            "TRAIN: [{bar}] {done:5}/{:5} ({progress:5.1}%) | {rate}",
            self.total_steps
        ));
        self.emit(format!(
            "       Elapsed: {} | Epoch ETA: {epoch_eta} | Total ETA: {total_eta}",
            format_duration(Some(elapsed))
        ));

        if let Some(metrics) = metrics.filter(|m| !m.is_empty()) {
            let line = metrics
                .iter()
                .map(|(name, value)| format!("{name}: {value:.4}"))
                .collect::<Vec<_>>()
                .join(" | ");
            self.emit(format!("       Metrics: {line}"));
        }
    }

    fn emit(&mut self, line: String) {
        (self.sink)(&line);
    }
}

fn eta_label(eta: Option<f64>) -> String {
    match eta {
        Some(seconds) if seconds > 0.0 => format_duration(Some(seconds)),
        _ => "calculating...".to_string(),
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Formats seconds as `42s`, `3m 07s` or `2h 05m`, `?` when unknown.
pub fn format_duration(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds.filter(|s| *s >= 0.0) else {
        return "?".to_string();
    };

    let s = (seconds + 0.5) as u64;
    if s < 60 {
        return format!("{s}s");
    }

    let (m, s) = (s / 60, s % 60);
    if m < 60 {
        return format!("{m}m {s:02}s");
    }

    let (h, m) = (m / 60, m % 60);
    format!("{h}h {m:02}m")
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    fn tracker(report_every: usize) -> (ProgressTracker<ManualClock>, ManualClock, Rc<RefCell<Vec<String>>>) {
        let clock = ManualClock::default();
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink_lines = Rc::clone(&lines);
        let tracker = ProgressTracker::with_clock(
            clock.clone(),
            report_every,
            Box::new(move |line: &str| sink_lines.borrow_mut().push(line.to_string())),
        );
        (tracker, clock, lines)
    }

    #[test]
    fn durations_are_formatted() {
        assert_eq!(format_duration(None), "?");
        assert_eq!(format_duration(Some(-1.0)), "?");
        assert_eq!(format_duration(Some(42.4)), "42s");
        assert_eq!(format_duration(Some(187.0)), "3m 07s");
        assert_eq!(format_duration(Some(7500.0)), "2h 05m");
    }

    #[test]
    fn constant_steps_converge_and_eta_decreases() {
        let (mut tracker, clock, _) = tracker(1000);
        tracker.start_training(1);
        tracker.start_epoch(0, 100);

        let mut last_eta = f64::INFINITY;
        for step in 0..60 {
            clock.advance(Duration::from_millis(250));
            tracker.update_step(step, None);

            let estimate = tracker.epoch_estimate().unwrap();
            let eta = estimate.eta.unwrap();
            assert!(eta < last_eta, "eta {eta} didn't drop below {last_eta}");
            last_eta = eta;
        }

        let rate = tracker.epoch_estimate().unwrap().rate;
        assert!((rate - 4.0).abs() < 1e-9, "rate {rate}");
    }

    #[test]
    fn reports_on_cadence_and_last_step() {
        let (mut tracker, clock, lines) = tracker(2);
        tracker.start_training(2);
        tracker.start_epoch(0, 4);
        lines.borrow_mut().clear();

        let metrics = Metrics::from([("loss".to_string(), 0.5)]);
        for step in 0..4 {
            clock.advance(Duration::from_secs(1));
            tracker.update_step(step, Some(&metrics));
        }

        let lines = lines.borrow();
        let bars: Vec<_> = lines.iter().filter(|l| l.starts_with("TRAIN:")).collect();
        assert_eq!(bars.len(), 3, "steps 0 and 2 plus the last one: {lines:?}");
        assert!(bars[2].contains("100.0%"));
        assert!(lines.iter().any(|l| l.contains("loss: 0.5000")));
    }

    #[test]
    fn end_epoch_estimates_remaining_epochs() {
        let (mut tracker, clock, lines) = tracker(50);
        tracker.start_training(3);
        tracker.start_epoch(0, 1);
        clock.advance(Duration::from_secs(10));
        tracker.update_step(0, None);
        tracker.end_epoch(None);

        assert!(lines.borrow().iter().any(|l| l.ends_with("Remaining: 20s")));

        assert_eq!(tracker.end_training(), Duration::from_secs(10));
    }

    #[test]
    fn total_eta_spans_the_remaining_epochs() {
        let (mut tracker, clock, lines) = tracker(1);
        tracker.start_training(3);

        tracker.start_epoch(0, 4);
        for step in 0..4 {
            clock.advance(Duration::from_secs(10));
            tracker.update_step(step, None);
        }
        tracker.end_epoch(None);

        tracker.start_epoch(1, 4);
        lines.borrow_mut().clear();
        clock.advance(Duration::from_secs(10));
        tracker.update_step(0, None);

        // 7 of 12 steps left at 10s each
        let lines = lines.borrow();
        assert!(
            lines.iter().any(|l| l.ends_with("Total ETA: 1m 10s")),
            "{lines:?}"
        );
        assert!(lines.iter().any(|l| l.contains("Epoch ETA: 30s")), "{lines:?}");
    }
}
