use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// A request paired with the channel for its reply
pub struct WithReply<T, R> {
    pub data: T,
    reply: oneshot::Sender<R>,
}

impl<T, R> WithReply<T, R> {
    /// Take the request data, keeping the means to answer it
    pub fn into_parts(self) -> (T, ReplyTo<R>) {
        (self.data, ReplyTo(self.reply))
    }
}

/// The answering half of a request
pub struct ReplyTo<R>(oneshot::Sender<R>);

impl<R> ReplyTo<R> {
    /// Answer the request. A sender that stopped waiting is ignored
    pub fn send(self, response: R) {
        let _ = self.0.send(response);
    }
}

/// The sending half of a request channel
pub struct Sender<T, R> {
    inner: mpsc::Sender<WithReply<T, R>>,
}

impl<T, R> Clone for Sender<T, R> {
    fn clone(&self) -> Self {
        Sender {
            inner: self.inner.clone(),
        }
    }
}

impl<T, R> Sender<T, R> {
    pub fn new(inner: mpsc::Sender<WithReply<T, R>>) -> Self {
        Sender { inner }
    }

    /// Sends a request and waits for the reply
    pub async fn send(&self, data: T) -> Result<R, SendError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .send(WithReply {
                data,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SendError::Closed)?;
        reply_rx.await.map_err(|_| SendError::NoReply)
    }
}

/// Possible errors when sending
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("the receiver is closed")]
    Closed,
    #[error("the request was dropped without a reply")]
    NoReply,
}

/// Create a new request channel
pub fn request_channel<T, R>(capacity: usize) -> (Sender<T, R>, mpsc::Receiver<WithReply<T, R>>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Sender::new(tx), rx)
}
