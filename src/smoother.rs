//! smoother.rs - 3-sample moving average, one window per signal

use std::collections::HashMap;

const WINDOW: usize = 3;

/// Trailing window of the last three inputs, newest first.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Window([f64; WINDOW]);

impl Window {
    /// A fresh window is filled with its first sample.
    fn seeded(value: f64) -> Self {
        Self([value; WINDOW])
    }

    fn push(&mut self, value: f64) {
        self.0.rotate_right(1);
        self.0[0] = value;
    }

    fn mean(&self) -> f64 {
        let [a, b, c] = self.0;
        // a full window of one value comes back bit-exact
        if a == b && b == c {
            return a;
        }
        (a + b + c) / WINDOW as f64
    }
}

/// Independent moving averages keyed by signal name.
#[derive(Debug, Default)]
pub struct Smoother {
    windows: HashMap<&'static str, Window>,
}

impl Smoother {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `value` into the window for `signal` and return the damped value.
    ///
    /// The first call for a signal returns its input unchanged.
    pub fn smooth(&mut self, signal: &'static str, value: f64) -> f64 {
        let window = self
            .windows
            .entry(signal)
            .or_insert_with(|| Window::seeded(value));
        window.push(value);
        window.mean()
    }
}
