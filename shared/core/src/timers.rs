use std::time::{Duration, Instant};

/// Pausable, resumable stopwatch.
#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    pub fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
        self.running_since = None;
    }

    /// Total accumulated time, including the in-flight span if running.
    pub fn elapsed(&self) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + since.elapsed(),
            None => self.accumulated,
        }
    }
}

/// A set of named stopwatches covering one measurement window (one epoch).
#[derive(Debug)]
pub struct TimerSet {
    timers: Vec<(&'static str, Stopwatch)>,
}

impl TimerSet {
    pub fn new(names: &[&'static str]) -> Self {
        Self {
            timers: names.iter().map(|n| (*n, Stopwatch::new())).collect(),
        }
    }

    fn timer(&mut self, name: &'static str) -> &mut Stopwatch {
        self.timers
            .iter_mut()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t)
            .unwrap_or_else(|| panic!("unknown timer {name}"))
    }

    pub fn resume(&mut self, name: &'static str) {
        self.timer(name).resume();
    }

    pub fn pause(&mut self, name: &'static str) {
        self.timer(name).pause();
    }

    /// Pause `from` and resume `to` in one step.
    pub fn handoff(&mut self, from: &'static str, to: &'static str) {
        self.pause(from);
        self.resume(to);
    }

    pub fn elapsed(&self, name: &'static str) -> Duration {
        self.timers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t.elapsed())
            .unwrap_or_else(|| panic!("unknown timer {name}"))
    }

    pub fn reset_all(&mut self) {
        for (_, t) in &mut self.timers {
            t.reset();
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.timers.iter().map(|(n, _)| *n)
    }
}
