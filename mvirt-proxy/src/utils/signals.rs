//! Signal subscription for the supervision loop.

use log::debug;
use nix::sys::signal::Signal;
use std::io;
use std::pin::Pin;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, SignalStream};
use tokio_stream::{Stream, StreamExt, StreamMap};

/// Signals relayed to the task.
///
/// Fault signals, SIGKILL and SIGSTOP cannot be handled. SIGCHLD and SIGPIPE
/// concern this process only.
pub const FORWARDED: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGALRM,
    Signal::SIGTERM,
    Signal::SIGCONT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGURG,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
    Signal::SIGWINCH,
    Signal::SIGIO,
    Signal::SIGPWR,
];

/// A live subscription to OS signals. Dropping it unsubscribes.
pub struct Signals {
    stream: Pin<Box<dyn Stream<Item = Signal> + Send>>,
}

impl Signals {
    /// Subscribe to `signals`.
    pub fn subscribe(signals: &[Signal]) -> io::Result<Self> {
        let mut map = StreamMap::new();
        for &sig in signals {
            let stream = signal(SignalKind::from_raw(sig as i32))?;
            map.insert(sig, SignalStream::new(stream));
        }
        debug!("Subscribed to {} signals", map.len());
        Ok(Self {
            stream: Box::pin(map.map(|(sig, ())| sig)),
        })
    }

    /// Signals fed from a channel instead of the OS.
    pub fn from_channel(rx: mpsc::Receiver<Signal>) -> Self {
        Self {
            stream: Box::pin(ReceiverStream::new(rx)),
        }
    }

    /// Next signal, `None` once the source is gone.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.stream.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[tokio::test]
    async fn receives_subscribed_signal() {
        let mut signals = Signals::subscribe(&[Signal::SIGUSR2]).unwrap();
        raise(Signal::SIGUSR2).unwrap();
        assert_eq!(signals.recv().await, Some(Signal::SIGUSR2));
    }

    #[tokio::test]
    async fn channel_source() {
        let (tx, rx) = mpsc::channel(1);
        let mut signals = Signals::from_channel(rx);
        tx.send(Signal::SIGTERM).await.unwrap();
        drop(tx);
        assert_eq!(signals.recv().await, Some(Signal::SIGTERM));
        assert_eq!(signals.recv().await, None);
    }
}
