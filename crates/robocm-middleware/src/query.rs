//! Synchronous query channel.
//!
//! Agents ask context queries through a [`QueryClient`]; the context manager
//! answers from the matching [`QueryInbox`].  Every request carries its own
//! [`oneshot`] reply slot, so a caller waits only for its own answer and
//! never for unrelated traffic.
//!
//! ```
//! use robocm_middleware::query;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let (client, mut inbox) = query::channel(8);
//! tokio::spawn(async move {
//!     while let Some(request) = inbox.recv().await {
//!         request.respond(Ok("(result)".to_string()));
//!     }
//! });
//! let answer = client.ask("TaskManager", "(context (triple $S $P $O))").await.unwrap();
//! assert_eq!(answer, "(result)");
//! # });
//! ```

use robocm_types::CmError;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// One pending query.
#[derive(Debug)]
pub struct QueryRequest {
    /// Identity of the asking agent.
    pub sender: String,
    /// Raw `(context …)` text.
    pub pattern: String,
    reply: oneshot::Sender<Result<String, CmError>>,
}

impl QueryRequest {
    /// Deliver the answer.  A caller that stopped waiting is not an error.
    pub fn respond(self, result: Result<String, CmError>) {
        if self.reply.send(result).is_err() {
            debug!(sender = %self.sender, "query caller went away before the answer");
        }
    }
}

/// Cloneable handle for asking queries.
#[derive(Clone, Debug)]
pub struct QueryClient {
    tx: mpsc::Sender<QueryRequest>,
}

impl QueryClient {
    /// Ask `pattern` on behalf of `sender` and wait for the rendered result.
    ///
    /// # Errors
    ///
    /// The answering side's error, or [`CmError::Channel`] when no one is
    /// answering queries any more.
    pub async fn ask(&self, sender: impl Into<String>, pattern: impl Into<String>) -> Result<String, CmError> {
        let (reply, answer) = oneshot::channel();
        let request = QueryRequest {
            sender: sender.into(),
            pattern: pattern.into(),
            reply,
        };
        self.tx
            .send(request)
            .await
            .map_err(|_| CmError::Channel("query inbox closed".into()))?;
        answer
            .await
            .map_err(|_| CmError::Channel("query dropped without an answer".into()))?
    }
}

/// Receiving end of the query channel.
#[derive(Debug)]
pub struct QueryInbox {
    rx: mpsc::Receiver<QueryRequest>,
}

impl QueryInbox {
    /// Next pending query; `None` once every client is dropped.
    pub async fn recv(&mut self) -> Option<QueryRequest> {
        self.rx.recv().await
    }
}

/// Create a query channel buffering up to `capacity` unanswered requests.
pub fn channel(capacity: usize) -> (QueryClient, QueryInbox) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueryClient { tx }, QueryInbox { rx })
}
