//! Bounded row channels and the stop signal shared by a pipeline's tasks.

use futures::channel::mpsc;
use futures::stream::{select_all, SelectAll};
use futures::{SinkExt, StreamExt};
use svq_common::{Result, SvqError};
use tokio_util::sync::CancellationToken;

use crate::value::Row;

/// Message carried on every operator edge and on the bridge into an injector.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    /// One data row.
    Row(Row),
    /// No more rows will follow on this edge.
    EndOfRows,
}

/// Create a bounded row channel.
///
/// Backpressure: when the receiver is slow and the buffer fills up,
/// [`RowSender::send`] waits until there is capacity again or the pipeline is
/// stopped.
pub fn bounded_row_channel(capacity: usize) -> (RowSender, mpsc::Receiver<BridgeMessage>) {
    let (tx, rx) = mpsc::channel::<BridgeMessage>(capacity.max(1));
    (RowSender { tx }, rx)
}

/// Stop signal shared by every task of one pipeline; clones observe the
/// same stop.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    /// A signal that has not been stopped yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop; idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once a stop is requested.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/// Sender side of [`bounded_row_channel`].
#[derive(Debug, Clone)]
pub struct RowSender {
    tx: mpsc::Sender<BridgeMessage>,
}

impl RowSender {
    /// Send one message, waiting for capacity; a stop aborts the wait.
    pub async fn send(&mut self, msg: BridgeMessage, stop: &StopSignal) -> Result<()> {
        tokio::select! {
            sent = self.tx.send(msg) => sent.map_err(|_| {
                SvqError::Cancelled("downstream operator is gone".to_string())
            }),
            _ = stop.wait() => Err(SvqError::Cancelled("pipeline stopped".to_string())),
        }
    }
}

/// Merged view over every input edge of one operator.
pub struct RowInputs {
    stream: SelectAll<mpsc::Receiver<BridgeMessage>>,
    open: usize,
}

impl RowInputs {
    /// Merge `inputs`; the merged stream ends once each input sent
    /// [`BridgeMessage::EndOfRows`].
    pub fn new(inputs: Vec<mpsc::Receiver<BridgeMessage>>) -> Self {
        let open = inputs.len();
        Self {
            stream: select_all(inputs),
            open,
        }
    }

    /// Next row from any input, `None` after the last end-of-rows.
    ///
    /// An input that disappears without end-of-rows means its producer
    /// failed or was stopped; that is reported as [`SvqError::Cancelled`].
    pub async fn next(&mut self, stop: &StopSignal) -> Result<Option<Row>> {
        while self.open > 0 {
            let msg = tokio::select! {
                msg = self.stream.next() => msg,
                _ = stop.wait() => {
                    return Err(SvqError::Cancelled("pipeline stopped".to_string()))
                }
            };
            match msg {
                Some(BridgeMessage::Row(row)) => return Ok(Some(row)),
                Some(BridgeMessage::EndOfRows) => self.open -= 1,
                None => {
                    return Err(SvqError::Cancelled(
                        "input closed before end of rows".to_string(),
                    ))
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarValue;

    #[tokio::test]
    async fn merges_inputs_until_every_end_of_rows() {
        let stop = StopSignal::new();
        let (mut a, ra) = bounded_row_channel(4);
        let (mut b, rb) = bounded_row_channel(4);
        let mut inputs = RowInputs::new(vec![ra, rb]);

        a.send(BridgeMessage::Row(vec![ScalarValue::Int64(1)]), &stop)
            .await
            .expect("send");
        a.send(BridgeMessage::EndOfRows, &stop).await.expect("send");
        b.send(BridgeMessage::Row(vec![ScalarValue::Int64(2)]), &stop)
            .await
            .expect("send");
        b.send(BridgeMessage::EndOfRows, &stop).await.expect("send");

        let mut seen = vec![];
        while let Some(row) = inputs.next(&stop).await.expect("next") {
            seen.push(row);
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![vec![ScalarValue::Int64(1)], vec![ScalarValue::Int64(2)]]
        );
    }

    #[tokio::test]
    async fn stop_unblocks_a_full_channel() {
        let stop = StopSignal::new();
        let (mut tx, _rx) = bounded_row_channel(1);
        // futures mpsc admits one message per sender beyond the buffer
        tx.send(BridgeMessage::EndOfRows, &stop).await.expect("first");
        tx.send(BridgeMessage::EndOfRows, &stop).await.expect("second");
        stop.stop();
        let err = tx
            .send(BridgeMessage::EndOfRows, &stop)
            .await
            .expect_err("must not block");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_input_is_cancelled() {
        let stop = StopSignal::new();
        let (tx, rx) = bounded_row_channel(1);
        drop(tx);
        let mut inputs = RowInputs::new(vec![rx]);
        assert!(inputs.next(&stop).await.expect_err("closed").is_cancelled());
    }
}
