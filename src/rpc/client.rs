use std::sync::Arc;

use tracing::trace;

use crate::common::{Message, PeerId};
use crate::Error;

use super::{Context, Transport, TransportError, PROTOCOL_ID};

/// Sends DHT [Message]s to single peers over a [Transport].
#[derive(Debug, Clone)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    // === Getters ===

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    // === Public Methods ===

    /// Send a request and wait for the reply.
    ///
    /// Blocks until the reply arrives or `ctx` is done, no timeout of its own.
    pub fn send_request(
        &self,
        ctx: &Context,
        peer: &PeerId,
        message: &Message,
    ) -> Result<Message, RpcError> {
        let payload = message.to_bytes()?;

        trace!(context = "rpc_request", ?peer, message_type = %message.message_type, key = ?message.key);

        let reply = self
            .transport
            .request(ctx, peer, PROTOCOL_ID, payload.into())?;

        let reply = Message::from_bytes(reply)?;

        trace!(context = "rpc_response", ?peer, message_type = %reply.message_type, closer_peers = reply.closer_peers.len());

        Ok(reply)
    }

    /// Send a one way notification.
    pub fn send_message(
        &self,
        ctx: &Context,
        peer: &PeerId,
        message: &Message,
    ) -> Result<(), RpcError> {
        let payload = message.to_bytes()?;

        trace!(context = "rpc_message", ?peer, message_type = %message.message_type, key = ?message.key);

        self.transport.send(ctx, peer, PROTOCOL_ID, payload.into())?;

        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
/// Failure of a single request to a single peer.
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encoding the request or decoding the reply failed.
    #[error(transparent)]
    Malformed(#[from] Error),
}

impl RpcError {
    /// See [TransportError::is_cut_off].
    pub fn is_cut_off(&self) -> bool {
        matches!(self, RpcError::Transport(error) if error.is_cut_off())
    }
}
