//! In-memory runtime for unit tests.

use crate::functions::event::{InvocationError, LambdaResponse};
use crate::functions::runtime::{BuildResult, FunctionRuntime, FunctionSource, Invocation};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Responder = Arc<
    dyn Fn(&FunctionSource, &Invocation) -> Result<Option<LambdaResponse>, InvocationError>
        + Send
        + Sync,
>;

pub(crate) struct FakeRuntime {
    failing: Mutex<HashSet<String>>,
    results: Mutex<HashMap<String, BuildResult>>,
    responder: Mutex<Responder>,
    delay: Mutex<Option<Duration>>,
    builds: AtomicUsize,
    pub invocations: Mutex<Vec<(String, Invocation)>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            failing: Mutex::new(HashSet::new()),
            results: Mutex::new(HashMap::new()),
            responder: Mutex::new(Arc::new(|_, _| Ok(Some(LambdaResponse::new(200).body("ok"))))),
            delay: Mutex::new(None),
            builds: AtomicUsize::new(0),
            invocations: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRuntime {
    pub fn fail_build(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub fn fix_build(&self, name: &str) {
        self.failing.lock().remove(name);
    }

    pub fn build_result(&self, name: &str, result: BuildResult) {
        self.results.lock().insert(name.to_string(), result);
    }

    pub fn respond<F>(&self, responder: F)
    where
        F: Fn(&FunctionSource, &Invocation) -> Result<Option<LambdaResponse>, InvocationError>
            + Send
            + Sync
            + 'static,
    {
        *self.responder.lock() = Arc::new(responder);
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FunctionRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "js"
    }

    async fn build(&self, function: &FunctionSource) -> Result<BuildResult, InvocationError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(&function.name) {
            return Err(InvocationError::new(format!("build failed for {}", function.name)));
        }
        let mut result = self
            .results
            .lock()
            .get(&function.name)
            .cloned()
            .unwrap_or_default();
        if result.src_files.is_empty() {
            result.src_files = vec![function.main_file.clone()];
        }
        Ok(result)
    }

    async fn invoke(
        &self,
        function: &FunctionSource,
        invocation: Invocation,
    ) -> Result<Option<LambdaResponse>, InvocationError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let responder = self.responder.lock().clone();
        let result = responder(function, &invocation);
        self.invocations
            .lock()
            .push((function.name.clone(), invocation));
        result
    }
}
