//! Background function invocations: acknowledged at once, run detached.

use crate::functions::event::{ClientContext, InvocationEvent};
use crate::functions::function::LocalFunction;
use crate::http::{Body, DevResponse};
use hyper::{Response, StatusCode};
use std::sync::Arc;
use tracing::{error, info};

/// Queue a background invocation and answer `202 Accepted`.
///
/// Background functions never receive a client context.
pub fn handle_background(func: Arc<LocalFunction>, event: InvocationEvent) -> Response<Body> {
    info!("Queueing background function {} for execution", func.name());

    tokio::spawn(async move {
        match func.invoke(event, ClientContext::default()).await {
            Ok(_) => info!("Done executing background function {}", func.name()),
            Err(err) => error!(
                "Error during background function {} execution: {}",
                func.name(),
                err
            ),
        }
    });

    DevResponse::new(StatusCode::ACCEPTED).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::packaging::FunctionDescriptor;
    use crate::functions::test_support::FakeRuntime;
    use crate::runtime::FunctionsSettings;
    use std::time::Duration;

    #[tokio::test]
    async fn test_invocation_runs_after_response() {
        let runtime = Arc::new(FakeRuntime::default());
        let descriptor = FunctionDescriptor::new("mail-background", "/site/mail-background.js", "js");
        let func = Arc::new(LocalFunction::new(
            &descriptor,
            runtime.clone(),
            &FunctionsSettings::default(),
            None,
        ));
        runtime.delay(Duration::from_millis(50));

        let response = handle_background(func, InvocationEvent::default());
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(runtime.invocations.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runtime.invocations.lock().len(), 1);
    }
}
