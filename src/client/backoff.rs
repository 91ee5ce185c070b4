use std::time::Duration;

/// Reconnect delays following the Fibonacci sequence: 2, 3, 5, 8, … units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fibonacci {
    i: u64,
    j: u64,
}

impl Fibonacci {
    pub fn new() -> Self {
        Self { i: 1, j: 1 }
    }

    pub fn next_duration(&mut self, unit: Duration) -> Duration {
        let factor = self.next().unwrap_or(u64::MAX);
        unit.saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
    }

    pub async fn wait(&mut self, unit: Duration) {
        tokio::time::sleep(self.next_duration(unit)).await;
    }
}

impl Default for Fibonacci {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for Fibonacci {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let next = self.i.saturating_add(self.j);
        self.i = self.j;
        self.j = next;
        Some(next)
    }
}
