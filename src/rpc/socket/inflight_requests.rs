use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::Sender;

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub transaction_id: u32,
    pub to: SocketAddr,
    pub sent_at: Instant,
    /// Where to deliver the reply payload.
    pub reply: Sender<Bytes>,
}

impl InflightRequest {
    pub fn does_match(&self, socket: &SocketAddr, tid: u32) -> bool {
        if self.transaction_id != tid {
            return false;
        }

        if self.to.port() != socket.port() {
            return false;
        }

        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == socket.ip()
    }
}

#[derive(Debug, Default)]
pub struct InflightRequests {
    requests: HashMap<u32, InflightRequest>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, transaction_id: u32, to: SocketAddr, reply: Sender<Bytes>) {
        self.requests.insert(
            transaction_id,
            InflightRequest {
                transaction_id,
                to,
                sent_at: Instant::now(),
                reply,
            },
        );
    }

    pub fn contains(&self, transaction_id: u32) -> bool {
        self.requests.contains_key(&transaction_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Remove inflight request by transaction_id if it exists and matches the address.
    pub fn take(&mut self, transaction_id: u32, from: &SocketAddr) -> Option<InflightRequest> {
        match self.requests.get(&transaction_id) {
            Some(request) if request.does_match(from, transaction_id) => {
                self.requests.remove(&transaction_id)
            }
            _ => None,
        }
    }

    /// Forget a request regardless of where it was sent.
    pub fn cancel(&mut self, transaction_id: u32) {
        self.requests.remove(&transaction_id);
    }

    /// Remove requests older than `timeout`, and those nobody waits for anymore.
    pub fn cleanup(&mut self, timeout: Duration) {
        self.requests.retain(|_, request| {
            request.sent_at.elapsed() < timeout && !request.reply.is_disconnected()
        });
    }
}
