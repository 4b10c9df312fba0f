//! Byte-level forwarding between a public connection and a worker.

use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};

use crate::address::WorkerAddress;
use crate::error::Result;

/// Bytes moved by one proxied connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProxyStats {
    pub to_worker: u64,
    pub to_client: u64,
}

/// Connect to `target` and splice `inbound` to it.
///
/// Both connections are dropped when this returns, whichever way it ends.
pub async fn proxy_connection<I>(mut inbound: I, target: &WorkerAddress) -> Result<ProxyStats>
where
    I: AsyncRead + AsyncWrite + Unpin,
{
    let mut outbound = target.connect().await?;
    splice(&mut inbound, &mut outbound).await
}

/// Copy both ways until both directions reach EOF.
///
/// EOF on one side shuts down writing on the other while the opposite
/// direction keeps flowing. An I/O error on either side ends both.
pub async fn splice<A, B>(client: &mut A, worker: &mut B) -> Result<ProxyStats>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (to_worker, to_client) = copy_bidirectional(client, worker).await?;
    Ok(ProxyStats {
        to_worker,
        to_client,
    })
}
