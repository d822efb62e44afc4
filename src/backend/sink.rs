use tokio::sync::oneshot;

use crate::error::MuxResult;
use crate::protocol::redis::RespValue;

pub type ResultReceiver = oneshot::Receiver<MuxResult<RespValue>>;

/// Completion handle for one message.
///
/// Completing after the waiter went away (timeout, dropped future) is a
/// no-op.
#[derive(Debug)]
pub struct ResultSink {
    tx: oneshot::Sender<MuxResult<RespValue>>,
}

impl ResultSink {
    pub fn channel() -> (ResultSink, ResultReceiver) {
        let (tx, rx) = oneshot::channel();
        (ResultSink { tx }, rx)
    }

    pub fn complete(self, result: MuxResult<RespValue>) {
        let _ = self.tx.send(result);
    }

    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}
