use std::thread;

use log::error;

use super::IpcError;

/// Runs one blocking routine on a dedicated background thread and hands the
/// outcome to `on_finish` on that same thread.
pub(crate) struct Worker;

impl Worker {
    pub(crate) fn spawn<F, C>(name: &str, work: F, on_finish: C)
    where
        F: FnOnce() -> Result<(), IpcError> + Send + 'static,
        C: FnOnce(Result<(), IpcError>) + Send + 'static,
    {
        let label = name.to_string();
        let spawned = thread::Builder::new()
            .name(label.clone())
            .spawn(move || on_finish(work()));
        if let Err(e) = spawned {
            error!("failed to spawn thread {label}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io, sync::mpsc, time::Duration};

    #[test]
    fn reports_success() {
        let (tx, rx) = mpsc::channel();
        Worker::spawn("ok-worker", || Ok(()), move |result| {
            tx.send(result.is_ok()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn reports_failure() {
        let (tx, rx) = mpsc::channel();
        Worker::spawn(
            "failing-worker",
            || Err(io::Error::new(io::ErrorKind::BrokenPipe, "boom").into()),
            move |result| {
                tx.send(result.is_err()).unwrap();
            },
        );
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
}
