//! Scripted driver for tests.
//!
//! Outcomes are consumed in order; once the script is empty every send
//! succeeds (or fails, after [`MockDriver::always_fail`]). Every call is
//! recorded so tests can assert what reached the gateway.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use courier_core::{
    CallContext, Channel, ChannelDriver, DriverError, JsonMap, RenderedContent, SendReceipt,
};

/// One recorded send.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub recipient: String,
    pub content: RenderedContent,
    pub payload: JsonMap,
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<Result<(), DriverError>>,
    fallback: Option<DriverError>,
    calls: Vec<MockCall>,
    sent: u64,
}

#[derive(Debug, Clone)]
pub struct MockDriver {
    channel: Channel,
    provider: String,
    delay: Option<Duration>,
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            provider: format!("mock_{}", channel.as_str()),
            delay: None,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Sleep before answering, to exercise deadlines.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next unscripted send with `err`.
    pub fn fail_next(&self, err: DriverError) -> &Self {
        self.fail_times(1, err)
    }

    pub fn fail_times(&self, n: usize, err: DriverError) -> &Self {
        let mut state = self.lock();
        for _ in 0..n {
            state.script.push_back(Err(err.clone()));
        }
        drop(state);
        self
    }

    pub fn succeed_next(&self) -> &Self {
        self.lock().script.push_back(Ok(()));
        self
    }

    /// Fail every send once the script runs out.
    pub fn always_fail(&self, err: DriverError) -> &Self {
        self.lock().fallback = Some(err);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ChannelDriver for MockDriver {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    async fn send(
        &self,
        ctx: &CallContext,
        recipient: &str,
        content: &RenderedContent,
        payload: &JsonMap,
    ) -> Result<SendReceipt, DriverError> {
        if let Some(delay) = self.delay {
            ctx.run::<_, _, DriverError>(async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        } else {
            ctx.check()?;
        }

        let mut state = self.lock();
        state.calls.push(MockCall {
            recipient: recipient.to_string(),
            content: content.clone(),
            payload: payload.clone(),
        });
        let outcome = match state.script.pop_front() {
            Some(scripted) => scripted,
            None => state.fallback.clone().map_or(Ok(()), Err),
        };
        outcome?;
        state.sent += 1;
        Ok(SendReceipt::new(format!(
            "{}-{}",
            self.provider, state.sent
        )))
    }
}
