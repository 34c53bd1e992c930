//! Observers of the training loop.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use log::info;
use serde_json::json;

use super::{Metrics, PRIMARY_METRIC};
use crate::Result;

/// Name of the metrics log inside the log directory.
pub const METRICS_LOG_NAME: &str = "log.json";

/// The closed set of moments the loop reports.
pub enum TrainingEvent<'a, M, O> {
    FitStart,
    BatchStart,
    /// An evaluation epoch finished, `metrics` include the training loss.
    EpochEnd {
        epoch: usize,
        metrics: &'a Metrics,
        model: &'a M,
        optimizer: &'a O,
    },
    FitEnd,
}

pub trait Listener<M, O> {
    fn on_event(&mut self, event: &TrainingEvent<'_, M, O>) -> Result<()>;
}

/// Listeners notified in registration order.
pub struct Listeners<M, O> {
    listeners: Vec<Box<dyn Listener<M, O>>>,
}

impl<M, O> Default for Listeners<M, O> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<M, O> Listeners<M, O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<L: Listener<M, O> + 'static>(&mut self, listener: L) {
        self.listeners.push(Box::new(listener));
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Hands `event` to every listener, stopping at the first failure.
    pub fn dispatch(&mut self, event: &TrainingEvent<'_, M, O>) -> Result<()> {
        self.listeners
            .iter_mut()
            .try_for_each(|listener| listener.on_event(event))
    }
}

/// Appends one JSON object per line for the fit boundaries and every
/// evaluation.
pub struct MetricsLogger {
    out: BufWriter<File>,
    path: PathBuf,
    started: Instant,
}

impl MetricsLogger {
    /// Opens `log.json` inside `dir` for appending, creating both if needed.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(METRICS_LOG_NAME);
        let file = OpenOptions::new().append(true).create(true).open(&path)?;

        Ok(Self {
            out: BufWriter::new(file),
            path,
            started: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, line: serde_json::Value) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, &line)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

impl<M, O> Listener<M, O> for MetricsLogger {
    fn on_event(&mut self, event: &TrainingEvent<'_, M, O>) -> Result<()> {
        let elapsed = self.started.elapsed().as_secs_f64();
        let line = match event {
            TrainingEvent::FitStart => json!({ "event": "fit_start", "elapsed": elapsed }),
            TrainingEvent::EpochEnd { epoch, metrics, .. } => json!({
                "event": "epoch_end",
                "elapsed": elapsed,
                "epoch": epoch,
                "metrics": metrics,
            }),
            TrainingEvent::FitEnd => json!({ "event": "fit_end", "elapsed": elapsed }),
            TrainingEvent::BatchStart => return Ok(()),
        };

        Ok(self.write_line(line)?)
    }
}

/// A model that can be written to disk.
pub trait Checkpoint {
    fn save(&self, path: &Path) -> io::Result<()>;
}

/// Saves the model whenever the primary metric improves.
pub struct CheckpointListener {
    path: PathBuf,
    best: Option<f64>,
}

impl CheckpointListener {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            best: None,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

impl<M: Checkpoint, O> Listener<M, O> for CheckpointListener {
    fn on_event(&mut self, event: &TrainingEvent<'_, M, O>) -> Result<()> {
        let TrainingEvent::EpochEnd {
            epoch,
            metrics,
            model,
            ..
        } = event
        else {
            return Ok(());
        };

        let Some(&score) = metrics.get(PRIMARY_METRIC) else {
            return Ok(());
        };

        if self.best.is_some_and(|best| score <= best) {
            return Ok(());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        model.save(&self.path)?;
        self.best = Some(score);
        info!(epoch = *epoch; "{PRIMARY_METRIC} improved to {score:.6}, checkpoint saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    struct Recorder {
        name: &'static str,
        seen: Rc<RefCell<Vec<String>>>,
    }

    impl Listener<(), ()> for Recorder {
        fn on_event(&mut self, event: &TrainingEvent<'_, (), ()>) -> Result<()> {
            let kind = match event {
                TrainingEvent::FitStart => "fit_start",
                TrainingEvent::BatchStart => "batch_start",
                TrainingEvent::EpochEnd { .. } => "epoch_end",
                TrainingEvent::FitEnd => "fit_end",
            };
            self.seen.borrow_mut().push(format!("{}:{kind}", self.name));
            Ok(())
        }
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut listeners = Listeners::new();
        for name in ["a", "b"] {
            listeners.push(Recorder {
                name,
                seen: Rc::clone(&seen),
            });
        }

        listeners.dispatch(&TrainingEvent::FitStart).unwrap();
        listeners.dispatch(&TrainingEvent::FitEnd).unwrap();

        assert_eq!(
            *seen.borrow(),
            ["a:fit_start", "b:fit_start", "a:fit_end", "b:fit_end"]
        );
    }

    struct Saved(Rc<RefCell<usize>>);

    impl Checkpoint for Saved {
        fn save(&self, path: &Path) -> io::Result<()> {
            *self.0.borrow_mut() += 1;
            fs::write(path, b"weights")
        }
    }

    fn unique_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("orchestra-{name}-{}", std::process::id()))
    }

    #[test]
    fn checkpoints_only_on_improvement() {
        let dir = unique_dir("ckpt");
        let saves = Rc::new(RefCell::new(0));
        let model = Saved(Rc::clone(&saves));
        let mut listener = CheckpointListener::new(dir.join("model.ckpt"));

        for score in [0.3, 0.2, 0.5] {
            let metrics = Metrics::from([(PRIMARY_METRIC.to_string(), score)]);
            let event = TrainingEvent::EpochEnd {
                epoch: 1,
                metrics: &metrics,
                model: &model,
                optimizer: &(),
            };
            Listener::<Saved, ()>::on_event(&mut listener, &event).unwrap();
        }

        assert_eq!(*saves.borrow(), 2);
        assert_eq!(listener.best(), Some(0.5));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn metrics_logger_writes_json_lines() {
        let dir = unique_dir("metrics");
        let mut logger = MetricsLogger::create(&dir).unwrap();
        let metrics = Metrics::from([(PRIMARY_METRIC.to_string(), 0.75)]);

        let events = [
            TrainingEvent::FitStart,
            TrainingEvent::BatchStart,
            TrainingEvent::EpochEnd {
                epoch: 3,
                metrics: &metrics,
                model: &(),
                optimizer: &(),
            },
            TrainingEvent::FitEnd,
        ];
        for event in &events {
            logger.on_event(event).unwrap();
        }

        let raw = fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<serde_json::Value> =
            raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1]["epoch"], 3);
        assert_eq!(lines[1]["metrics"][PRIMARY_METRIC], 0.75);
        fs::remove_dir_all(dir).unwrap();
    }
}
