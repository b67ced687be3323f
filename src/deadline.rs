//! Wall-clock deadlines for executions.
//!
//! The execution receives a [`CancellationToken`] that is cancelled when the
//! deadline passes. It is then expected to kill its container and return
//! [`SandboxError::Cancelled`]; the deadline waits for that cleanup rather
//! than abandoning the execution future.

use crate::container::RawOutput;
use crate::error::SandboxError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug)]
pub enum Deadlined {
    Completed(RawOutput),
    TimedOut,
}

pub async fn with_deadline<F, Fut>(timeout: Duration, execution: F) -> Result<Deadlined, SandboxError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<RawOutput, SandboxError>>,
{
    let token = CancellationToken::new();
    let run = execution(token.clone());
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::time::sleep(timeout) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Deadline expired, cancelling execution");
            token.cancel();
            run.await
        }
    };

    match result {
        Ok(output) => Ok(Deadlined::Completed(output)),
        Err(SandboxError::Cancelled) if token.is_cancelled() => Ok(Deadlined::TimedOut),
        Err(e) => Err(e),
    }
}

/// User-facing message for an execution stopped at its deadline.
pub fn timeout_message(timeout: Duration) -> String {
    let millis = timeout.as_millis();
    if millis % 1000 == 0 {
        let secs = millis / 1000;
        let unit = if secs == 1 { "second" } else { "seconds" };
        format!("Error: Execution timed out after {} {}.", secs, unit)
    } else {
        format!("Error: Execution timed out after {} ms.", millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(exit_code: i64) -> RawOutput {
        RawOutput {
            bytes: Vec::new(),
            truncated: false,
            exit_code,
            elapsed: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn fast_execution_completes() {
        let result = with_deadline(Duration::from_secs(5), |_token| async { Ok(raw(0)) }).await;
        assert!(matches!(result, Ok(Deadlined::Completed(r)) if r.exit_code == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_execution_is_cancelled_and_awaited() {
        let result = with_deadline(Duration::from_millis(100), |token| async move {
            token.cancelled().await;
            Err(SandboxError::Cancelled)
        })
        .await;
        assert!(matches!(result, Ok(Deadlined::TimedOut)));
    }

    #[tokio::test]
    async fn infrastructure_errors_pass_through() {
        let result = with_deadline(Duration::from_secs(5), |_token| async {
            Err(SandboxError::Infrastructure(crate::error::EngineError::Other(
                "daemon down".into(),
            )))
        })
        .await;
        assert!(matches!(result, Err(SandboxError::Infrastructure(_))));
    }

    #[test]
    fn message_names_the_duration() {
        assert_eq!(
            timeout_message(Duration::from_secs(10)),
            "Error: Execution timed out after 10 seconds."
        );
        assert_eq!(
            timeout_message(Duration::from_millis(1500)),
            "Error: Execution timed out after 1500 ms."
        );
    }
}
