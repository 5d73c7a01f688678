/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-invocation result futures returned by `ordered_send` and `p2p_send`.
//!
//! Every send produces a ([`QueryResults`], [`PendingResults`]) pair over one channel.
//! The pending side is handed to the [RPC manager](super::manager::RpcManager), which
//! fulfills it once per reply routed back from a responding replica. The results side
//! stays with the caller and yields `(NodeId, R)` replies in delivery order.

use borsh::BorshDeserialize;
use std::fmt::{self, Display, Formatter};
use std::marker::PhantomData;
use std::sync::mpsc::{self, Receiver, RecvError, Sender, TryRecvError};
use std::time::Duration;

use crate::types::data_types::{InvocationId, NodeId};

/// Create a linked results/pending pair for the invocation identified by
/// `invocation_id`.
pub(crate) fn results_pair<R>(invocation_id: InvocationId) -> (QueryResults<R>, PendingResults) {
    let (reply_tx, reply_rx) = mpsc::channel();
    (
        QueryResults {
            reply_rx,
            _marker: PhantomData,
        },
        PendingResults {
            invocation_id,
            reply_tx,
        },
    )
}

/// The fulfillment side of one invocation: owned by the RPC manager, fed one reply per
/// responding replica.
pub struct PendingResults {
    invocation_id: InvocationId,
    reply_tx: Sender<(NodeId, Vec<u8>)>,
}

impl PendingResults {
    pub(crate) fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    /// Route one replica's reply into the matching [`QueryResults`]. Returns false if
    /// the caller has dropped its results handle.
    pub(crate) fn fulfill(&self, from: NodeId, reply_bytes: Vec<u8>) -> bool {
        self.reply_tx.send((from, reply_bytes)).is_ok()
    }
}

/// A future-like object that will yield one reply per responding replica.
pub struct QueryResults<R> {
    reply_rx: Receiver<(NodeId, Vec<u8>)>,
    _marker: PhantomData<R>,
}

impl<R> fmt::Debug for QueryResults<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResults").finish_non_exhaustive()
    }
}

impl<R: BorshDeserialize> QueryResults<R> {
    /// Block until the next reply arrives, and decode it.
    ///
    /// Fails with [`ResultsError::Closed`] once every reply has been consumed and the
    /// invocation has been retired by the RPC manager.
    pub fn recv(&self) -> Result<(NodeId, R), ResultsError> {
        let (from, bytes) = self.reply_rx.recv().map_err(|_: RecvError| ResultsError::Closed)?;
        let reply = R::try_from_slice(&bytes).map_err(ResultsError::Decode)?;
        Ok((from, reply))
    }

    /// Like [`recv`](QueryResults::recv), but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<(NodeId, R), ResultsError> {
        let (from, bytes) = self
            .reply_rx
            .recv_timeout(timeout)
            .map_err(|_| ResultsError::TimedOut)?;
        let reply = R::try_from_slice(&bytes).map_err(ResultsError::Decode)?;
        Ok((from, reply))
    }

    /// The next reply if one has already arrived, `None` otherwise.
    pub fn try_recv(&self) -> Result<Option<(NodeId, R)>, ResultsError> {
        match self.reply_rx.try_recv() {
            Ok((from, bytes)) => {
                let reply = R::try_from_slice(&bytes).map_err(ResultsError::Decode)?;
                Ok(Some((from, reply)))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ResultsError::Closed),
        }
    }
}

/// Error when reading from a [`QueryResults`].
#[derive(Debug)]
pub enum ResultsError {
    /// The invocation has been retired and no further replies will arrive.
    Closed,
    /// No reply arrived within the given timeout.
    TimedOut,
    /// A reply arrived but its payload did not decode as the expected return type.
    Decode(std::io::Error),
}

impl Display for ResultsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ResultsError::Closed => write!(f, "the invocation has been retired"),
            ResultsError::TimedOut => write!(f, "timed out waiting for a reply"),
            ResultsError::Decode(source) => write!(f, "cannot decode reply payload: {}", source),
        }
    }
}
