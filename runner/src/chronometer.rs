use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChronometerError {
    #[error("Chronometer is already running")]
    AlreadyRunning,
}

/// Pausable elapsed-time accumulator
///
/// `start` refuses to run twice, `resume` silently accepts it. `stop` is safe to call on a
/// chronometer that never started, which is the normal case for phases that may not happen at
/// all (e.g. checkpointing).
#[derive(Debug, Clone, Default)]
pub struct Chronometer {
    accumulated: Duration,
    start_mark: Option<Instant>,
}

impl Chronometer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.start_mark.is_some()
    }

    pub fn start(&mut self) -> Result<(), ChronometerError> {
        if self.is_running() {
            return Err(ChronometerError::AlreadyRunning);
        }

        self.start_mark = Some(Instant::now());

        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mark) = self.start_mark.take() {
            self.accumulated += mark.elapsed();
        }
    }

    /// start again without dropping what was accumulated so far
    pub fn resume(&mut self) {
        if !self.is_running() {
            self.start_mark = Some(Instant::now());
        }
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
        self.start_mark = None;
    }

    pub fn elapsed(&self) -> Duration {
        match self.start_mark {
            Some(mark) => self.accumulated + mark.elapsed(),
            None => self.accumulated,
        }
    }
}

/// One chronometer per job phase, plus the wall clock of the whole job
#[derive(Debug, Clone, Default)]
pub struct PhaseTimers {
    pub setup: Chronometer,
    pub execute: Chronometer,
    pub repair: Chronometer,
    pub checkpoint: Chronometer,
    pub total: Chronometer,
}

impl PhaseTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// stop everything that might still be running, used on every exit path of a job
    pub fn stop_all(&mut self) {
        self.setup.stop();
        self.execute.stop();
        self.repair.stop();
        self.checkpoint.stop();
        self.total.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    const TICK: Duration = Duration::from_millis(20);

    #[test]
    fn start_twice_fails() {
        let mut chronometer = Chronometer::new();

        chronometer.start().unwrap();
        assert_eq!(chronometer.start(), Err(ChronometerError::AlreadyRunning));
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let mut chronometer = Chronometer::new();

        chronometer.stop();
        chronometer.stop();

        assert_eq!(chronometer.elapsed(), Duration::ZERO);
        assert!(!chronometer.is_running());
    }

    #[test]
    fn resume_while_running_keeps_the_mark() {
        let mut chronometer = Chronometer::new();

        chronometer.start().unwrap();
        sleep(TICK);
        chronometer.resume();
        chronometer.stop();

        assert!(chronometer.elapsed() >= TICK);
    }

    #[test]
    fn intervals_add_up_across_cycles() {
        let mut chronometer = Chronometer::new();
        let mut measured = Duration::ZERO;

        for _ in 0..4 {
            let before = Instant::now();
            chronometer.resume();
            sleep(TICK);
            chronometer.stop();
            measured += before.elapsed();

            // idle time between intervals must never be counted
            chronometer.stop();
            sleep(TICK);
        }

        let elapsed = chronometer.elapsed();
        assert!(elapsed >= TICK * 4);
        assert!(elapsed <= measured);
    }

    #[test]
    fn elapsed_includes_live_interval() {
        let mut chronometer = Chronometer::new();

        chronometer.start().unwrap();
        sleep(TICK);

        assert!(chronometer.is_running());
        assert!(chronometer.elapsed() >= TICK);
    }

    #[test]
    fn reset_clears_everything() {
        let mut chronometer = Chronometer::new();

        chronometer.start().unwrap();
        sleep(TICK);
        chronometer.reset();

        assert!(!chronometer.is_running());
        assert_eq!(chronometer.elapsed(), Duration::ZERO);
        assert!(chronometer.start().is_ok());
    }
}
