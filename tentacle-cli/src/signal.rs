//! OS signal handling

use std::fmt;
use tokio::signal;

/// Signal that asked the host to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Interrupt => write!(f, "SIGINT"),
            StopSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Wait for SIGINT or SIGTERM (Ctrl+C on Windows)
pub(crate) async fn wait_for_stop() -> std::io::Result<StopSignal> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => Ok(StopSignal::Terminate),
            _ = sigint.recv() => Ok(StopSignal::Interrupt),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        Ok(StopSignal::Interrupt)
    }
}
