use std::sync::Mutex;

use async_trait::async_trait;

use crate::channels::Transport;

/// Transport that fails a fixed number of times before succeeding, and
/// records every attempt.
pub struct ScriptedTransport {
    failures_left: Mutex<u32>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub fn ok() -> Self {
        Self::failing(0)
    }

    pub fn failing(times: u32) -> Self {
        Self {
            failures_left: Mutex::new(times),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn broken() -> Self {
        Self::failing(u32::MAX)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, destination: &str, body: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((destination.to_string(), body.to_string()));
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left = left.saturating_sub(1);
            anyhow::bail!("transport unavailable");
        }
        Ok(())
    }
}
