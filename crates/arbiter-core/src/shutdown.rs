use tokio_util::sync::CancellationToken;

/// Reason the executor must stop enqueueing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    UserInterrupt,
    Converged,
}

/// Run-wide cancellation signal with two independent bits: a user interrupt
/// (SIGINT/SIGTERM) and the monitor's enforcer convergence. The executor
/// polls it at batch boundaries and before every enqueue; inflight backend
/// calls observe it through derived tokens.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    user: CancellationToken,
    converged: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_user_interrupt(&self) {
        self.user.cancel();
    }

    pub fn trip_converged(&self) {
        self.converged.cancel();
    }

    pub fn user_interrupt_requested(&self) -> bool {
        self.user.is_cancelled()
    }

    pub fn converged(&self) -> bool {
        self.converged.is_cancelled()
    }

    /// Token handed to backend calls; fires on user interrupt so inflight
    /// HTTP work is asked to abort.
    pub fn call_token(&self) -> CancellationToken {
        self.user.child_token()
    }

    /// Resolves when either bit fires. User interrupt wins ties.
    pub async fn cancelled(&self) -> StopCause {
        tokio::select! {
            biased;
            _ = self.user.cancelled() => StopCause::UserInterrupt,
            _ = self.converged.cancelled() => StopCause::Converged,
        }
    }

    /// Non-blocking stop oracle. Convergence only halts the run when the
    /// caller is in enforcer mode.
    pub fn stop_cause(&self, enforcer: bool) -> Option<StopCause> {
        if self.user_interrupt_requested() {
            Some(StopCause::UserInterrupt)
        } else if enforcer && self.converged() {
            Some(StopCause::Converged)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_interrupt_always_wins_the_oracle() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.stop_cause(true), None);
        signal.trip_converged();
        assert_eq!(signal.stop_cause(false), None);
        assert_eq!(signal.stop_cause(true), Some(StopCause::Converged));
        signal.request_user_interrupt();
        assert_eq!(signal.stop_cause(false), Some(StopCause::UserInterrupt));
        assert_eq!(signal.stop_cause(true), Some(StopCause::UserInterrupt));
    }

    #[tokio::test]
    async fn cancelled_resolves_on_either_bit() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        signal.trip_converged();
        assert_eq!(handle.await.unwrap(), StopCause::Converged);
    }

    #[test]
    fn call_tokens_follow_the_user_bit() {
        let signal = ShutdownSignal::new();
        let token = signal.call_token();
        assert!(!token.is_cancelled());
        signal.request_user_interrupt();
        assert!(token.is_cancelled());
    }
}
