use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CallError;
use crate::target::{TargetAdapter, TargetRequest, TargetResponse};

type Respond = dyn Fn(&TargetRequest) -> Result<TargetResponse, CallError> + Send + Sync;

/// Target whose answers come from a closure. Counts invocations.
pub(crate) struct FnTarget {
    respond: Box<Respond>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FnTarget {
    pub(crate) fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&TargetRequest) -> Result<TargetResponse, CallError> + Send + Sync + 'static,
    {
        Self::slow(Duration::ZERO, respond)
    }

    pub(crate) fn slow<F>(delay: Duration, respond: F) -> Arc<Self>
    where
        F: Fn(&TargetRequest) -> Result<TargetResponse, CallError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetAdapter for FnTarget {
    fn endpoint(&self) -> &str {
        "http://target.test"
    }

    async fn invoke(&self, request: &TargetRequest) -> Result<TargetResponse, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(request)
    }
}
