//! Web-server side of a connection, for driving a `Multiplexer` in tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use fcgi_backend::protocol::{
    pack_pairs, BeginRequest, ClientMessage, Record, RecordBuffer, Role, ServerMessage,
};
use fcgi_backend::{HandlerFactory, MultiplexerBuilder, RecordWriter};
use tokio::io::{duplex, split, AsyncReadExt, DuplexStream, ReadHalf};
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Plays the web server on the other end of an in-memory connection.
pub struct Peer {
    reader: ReadHalf<DuplexStream>,
    writer: RecordWriter,
    buffer: RecordBuffer,
    pending: VecDeque<ClientMessage>,
}

/// Build a multiplexer, run it on its own task and return the peer.
pub fn serve<F: HandlerFactory>(
    builder: MultiplexerBuilder,
    factory: F,
) -> (Peer, JoinHandle<fcgi_backend::Result<()>>) {
    let (local, remote) = duplex(1 << 20);
    let task = tokio::spawn(builder.build(local, factory).run());
    let (reader, writer) = split(remote);
    let peer = Peer {
        reader,
        writer: RecordWriter::new(writer),
        buffer: RecordBuffer::new(),
        pending: VecDeque::new(),
    };
    (peer, task)
}

impl Peer {
    pub async fn send(&self, message: ServerMessage) {
        self.send_record(message.pack().unwrap()).await;
    }

    pub async fn send_record(&self, record: Record) {
        self.writer.write(&record).await.unwrap();
    }

    pub async fn begin(&self, request_id: u16, role: Role) {
        self.send(ServerMessage::BeginRequest(BeginRequest {
            request_id,
            role,
            keep_alive: false,
        }))
        .await;
    }

    /// Send the whole PARAMS stream, terminated by the empty record.
    pub async fn params(&self, request_id: u16, pairs: &[(&str, &str)]) {
        if !pairs.is_empty() {
            self.send(ServerMessage::Params {
                request_id,
                payload: pack_pairs(pairs.iter().copied()).unwrap(),
            })
            .await;
        }
        self.send(ServerMessage::Params {
            request_id,
            payload: Bytes::new(),
        })
        .await;
    }

    pub async fn stdin(&self, request_id: u16, data: &'static [u8]) {
        self.send(ServerMessage::Stdin {
            request_id,
            payload: Bytes::from_static(data),
        })
        .await;
    }

    /// Next message, or `None` once the backend closed the connection.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }
            let mut chunk = [0u8; 8192];
            let n = tokio::time::timeout(TIMEOUT, self.reader.read(&mut chunk))
                .await
                .expect("timed out waiting for the backend")
                .unwrap();
            if n == 0 {
                return None;
            }
            for record in self.buffer.push(&chunk[..n]).unwrap() {
                self.pending
                    .push_back(ClientMessage::unpack(&record).unwrap());
            }
        }
    }

    /// Messages up to and including the END_REQUEST of `request_id`.
    pub async fn recv_until_end(&mut self, request_id: u16) -> Vec<ClientMessage> {
        let mut messages = Vec::new();
        loop {
            let message = self.recv().await.expect("connection closed early");
            let done = matches!(&message, ClientMessage::EndRequest(end) if end.request_id == request_id);
            messages.push(message);
            if done {
                return messages;
            }
        }
    }

    /// Close our sending side and collect everything until the backend
    /// closes too.
    pub async fn finish(mut self) -> Vec<ClientMessage> {
        self.writer.close().await;
        let mut messages = Vec::new();
        while let Some(message) = self.recv().await {
            messages.push(message);
        }
        messages
    }
}

/// Concatenated STDOUT payloads of one request.
pub fn stdout_of(messages: &[ClientMessage], request_id: u16) -> Vec<u8> {
    messages
        .iter()
        .filter_map(|message| match message {
            ClientMessage::Stdout {
                request_id: id,
                payload,
            } if *id == request_id => Some(payload.as_ref()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}
