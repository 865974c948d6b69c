//! Channel helpers for the advertisement engine.

use tokio::sync::mpsc;

/// Merge two receivers into one: values are forwarded from whichever source
/// is ready, and the merged channel closes once both sources are exhausted.
pub fn merge<T: Send + 'static>(
    mut a: mpsc::Receiver<T>,
    mut b: mpsc::Receiver<T>,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut a_open = true;
        let mut b_open = true;
        while a_open || b_open {
            let value = tokio::select! {
                value = a.recv(), if a_open => match value {
                    Some(value) => value,
                    None => {
                        a_open = false;
                        continue;
                    }
                },
                value = b.recv(), if b_open => match value {
                    Some(value) => value,
                    None => {
                        b_open = false;
                        continue;
                    }
                },
            };
            if tx.send(value).await.is_err() {
                return;
            }
        }
    });
    rx
}
