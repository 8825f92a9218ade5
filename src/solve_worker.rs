// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, internal_error};
use log::{debug, error, info, warn};

use crate::image_watcher::ImageEventSource;
use crate::result_channel::ResultChannel;
use crate::solver_trait::PlateSolver;

#[derive(Clone, Debug)]
pub struct SolveWorkerConfig {
    // Where the solver writes its output files.
    pub output_dir: PathBuf,

    // A file is often announced before it is completely written. We wait this
    // long before handing it to the solver.
    pub settle_delay: Duration,

    // Longest wait for an image event before re-checking for shutdown.
    pub poll_interval: Duration,
}

impl Default for SolveWorkerConfig {
    fn default() -> Self {
        SolveWorkerConfig{
            output_dir: PathBuf::from("."),
            settle_delay: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
        }
    }
}

// Plate solves each new image announced by an ImageEventSource, on a dedicated
// thread, and publishes the solutions to a ResultChannel. Solves are slow
// (seconds) and must not hold up the Stellarium server.
pub struct SolveWorker {
    // Executes worker().
    worker_thread: Option<JoinHandle<()>>,
}

impl SolveWorker {
    pub fn start(source: Box<dyn ImageEventSource + Send>,
                 solver: Arc<dyn PlateSolver + Send + Sync>,
                 config: SolveWorkerConfig,
                 results: ResultChannel,
                 got_signal: Arc<AtomicBool>)
                 -> Result<Self, CanonicalError> {
        let worker_thread = std::thread::Builder::new()
            .name("solve_worker".to_string())
            .spawn(move || {
                SolveWorker::worker(source, solver, config, results, got_signal);
            });
        match worker_thread {
            Ok(handle) => Ok(SolveWorker{worker_thread: Some(handle)}),
            Err(e) => Err(internal_error(
                format!("Could not start solve worker: {:?}", e).as_str())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker_thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    // Waits for the worker to exit. The caller must first set `got_signal`.
    // A solve that is in progress runs to completion.
    pub fn join(&mut self) {
        if let Some(handle) = self.worker_thread.take() {
            if handle.join().is_err() {
                error!("Solve worker panicked");
            }
        }
    }

    fn worker(mut source: Box<dyn ImageEventSource + Send>,
              solver: Arc<dyn PlateSolver + Send + Sync>,
              config: SolveWorkerConfig,
              results: ResultChannel,
              got_signal: Arc<AtomicBool>) {
        debug!("Starting solve worker");
        while !got_signal.load(Ordering::Relaxed) {
            let image_path = match source.next_image(config.poll_interval) {
                Ok(Some(path)) => path,
                Ok(None) => continue,
                Err(e) => {
                    error!("Image source failed: {:?}", e);
                    break;
                }
            };
            info!("Found new file: {}", image_path.display());
            if !settle(config.settle_delay, config.poll_interval, &got_signal) {
                break;
            }
            process_image(solver.as_ref(), &image_path, &config.output_dir,
                          &results);
        }
        debug!("Solve worker stopped");
    }
}

// Sleeps for `delay` in steps of at most `step`, checking `got_signal` between
// steps. Returns false, possibly early, if the signal was seen.
fn settle(delay: Duration, step: Duration, got_signal: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if got_signal.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(step.min(deadline - now));
    }
}

/// Solves `image_path` and publishes the solution, if any. Returns true if a
/// solution was published.
pub fn process_image(solver: &dyn PlateSolver, image_path: &Path,
                     output_dir: &Path, results: &ResultChannel) -> bool {
    let center = match solver.solve(image_path, output_dir) {
        Ok(center) => center,
        Err(e) => {
            warn!("No solution for {}: {:?}", image_path.display(), e);
            return false;
        }
    };
    match center.to_solve_result() {
        Some(result) => {
            results.publish(result);
            true
        },
        None => {
            debug!("Skipping unparseable field center {:?}", center);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use canonical_error::aborted_error;

    use super::*;
    use crate::solver_trait::FieldCenter;

    // Hands out a fixed list of images, then reports timeouts.
    struct ScriptedSource {
        images: VecDeque<PathBuf>,
    }

    impl ImageEventSource for ScriptedSource {
        fn next_image(&mut self, timeout: Duration)
                      -> Result<Option<PathBuf>, CanonicalError> {
            match self.images.pop_front() {
                Some(path) => Ok(Some(path)),
                None => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
            }
        }
    }

    // Solves "*good*" images to a fixed position and fails on all others.
    struct FakeSolver {
        solved: Mutex<Vec<PathBuf>>,
    }

    impl FakeSolver {
        fn new() -> Self {
            FakeSolver{solved: Mutex::new(Vec::new())}
        }
    }

    impl PlateSolver for FakeSolver {
        fn solve(&self, image_path: &Path, _output_dir: &Path)
                 -> Result<FieldCenter, CanonicalError> {
            self.solved.lock().unwrap().push(image_path.to_path_buf());
            if image_path.to_string_lossy().contains("good") {
                Ok(FieldCenter::new("12:30:45.6", "+45:10:20.1"))
            } else {
                Err(aborted_error("no stars"))
            }
        }
    }

    #[test]
    fn test_process_image() {
        let solver = FakeSolver::new();
        let results = ResultChannel::new();

        assert!(!process_image(&solver, Path::new("bad.jpg"), Path::new("."),
                               &results));
        assert!(results.take_if_present().is_none());

        assert!(process_image(&solver, Path::new("good.jpg"), Path::new("."),
                              &results));
        let result = results.take_if_present().unwrap();
        assert!((result.ra - 3.275765).abs() < 1e-6);
        assert!((result.dec - 0.788404).abs() < 1e-6);
    }

    #[test]
    fn test_worker_publishes_and_stops() {
        let solver = Arc::new(FakeSolver::new());
        let results = ResultChannel::new();
        let got_signal = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource{images: VecDeque::from([
            PathBuf::from("bad.jpg"), PathBuf::from("good.jpg")])};
        let config = SolveWorkerConfig{
            settle_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };

        let mut worker = SolveWorker::start(
            Box::new(source), solver.clone(), config, results.clone(),
            got_signal.clone()).unwrap();
        assert!(worker.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut published = None;
        while published.is_none() && Instant::now() < deadline {
            published = results.take_if_present();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(published.is_some());

        got_signal.store(true, Ordering::Relaxed);
        worker.join();
        assert!(!worker.is_running());
        assert_eq!(*solver.solved.lock().unwrap(),
                   [PathBuf::from("bad.jpg"), PathBuf::from("good.jpg")]);
    }

    #[test]
    fn test_worker_skips_new_solves_after_signal() {
        let solver = Arc::new(FakeSolver::new());
        let got_signal = Arc::new(AtomicBool::new(true));
        let source = ScriptedSource{images: VecDeque::from([
            PathBuf::from("good.jpg")])};

        let mut worker = SolveWorker::start(
            Box::new(source), solver.clone(), SolveWorkerConfig::default(),
            ResultChannel::new(), got_signal).unwrap();
        worker.join();
        assert!(solver.solved.lock().unwrap().is_empty());
    }

    #[test]
    fn test_settle() {
        let got_signal = AtomicBool::new(false);
        let start = Instant::now();
        assert!(settle(Duration::from_millis(50), Duration::from_millis(10),
                       &got_signal));
        assert!(start.elapsed() >= Duration::from_millis(50));

        // A long delay is cut short by the signal.
        got_signal.store(true, Ordering::Relaxed);
        let start = Instant::now();
        assert!(!settle(Duration::from_secs(30), Duration::from_millis(10),
                        &got_signal));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_signal_during_settle_delay() {
        let solver = Arc::new(FakeSolver::new());
        let got_signal = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource{images: VecDeque::from([
            PathBuf::from("good.jpg")])};
        let config = SolveWorkerConfig{
            settle_delay: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };

        let mut worker = SolveWorker::start(
            Box::new(source), solver.clone(), config, ResultChannel::new(),
            got_signal.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        got_signal.store(true, Ordering::Relaxed);
        worker.join();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(solver.solved.lock().unwrap().is_empty());
    }
}
