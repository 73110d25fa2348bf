//! Structured fan-out of one engine operation across several parties

use std::collections::BTreeMap;
use std::future::{self, Future};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tss_party::{PartyEngine, PartyId};

use crate::error::{ClusterError, Result};

/// Run `op` for every `(id, engine)` concurrently and gather the results.
///
/// Each party gets a child of one root token. The root is cancelled on the
/// first failure or when `deadline` expires, and every task is joined before
/// returning. The first failure wins.
pub async fn scatter_gather<T, F, Fut>(
    parties: Vec<(PartyId, Arc<PartyEngine>)>,
    deadline: Option<Duration>,
    op: F,
) -> Result<BTreeMap<PartyId, T>>
where
    T: Send + 'static,
    F: Fn(Arc<PartyEngine>, CancellationToken) -> Fut,
    Fut: Future<Output = tss_party::Result<T>> + Send + 'static,
{
    let root = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for (id, engine) in parties {
        let work = op(engine, root.child_token());
        tasks.spawn(async move { (id, work.await) });
    }

    let expiry = async {
        match deadline {
            Some(deadline) => tokio::time::sleep(deadline).await,
            None => future::pending().await,
        }
    };
    tokio::pin!(expiry);

    let mut results = BTreeMap::new();
    let mut failure = None;
    loop {
        tokio::select! {
            joined = tasks.join_next() => {
                let error = match joined {
                    None => break,
                    Some(Ok((id, Ok(value)))) => {
                        debug!(party = id, "Party finished");
                        results.insert(id, value);
                        continue;
                    }
                    Some(Ok((id, Err(source)))) => ClusterError::Party { party: id, source },
                    Some(Err(e)) => ClusterError::Join(e.to_string()),
                };
                if failure.is_none() {
                    warn!(error = %error, "Party failed, cancelling the rest");
                    failure = Some(error);
                    root.cancel();
                }
            }
            _ = &mut expiry, if !root.is_cancelled() => {
                warn!(?deadline, "Deadline expired, cancelling all parties");
                root.cancel();
            }
        }
    }

    match failure {
        Some(error) => Err(error),
        None => Ok(results),
    }
}
