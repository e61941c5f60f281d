//! IPC-backed endpoints: length-prefixed bincode frames over unix sockets.
//!
//! This is the second transport behind the endpoint capability traits
//! (the first is the in-process one in `endpoint.rs`). Each accepted
//! socket becomes one connection task that translates frames into handle
//! calls and port callbacks into frames; the controller never sees the
//! difference.
//!
//! The producer data plane (the shared memory mapping itself) is
//! established out of band by the embedding transport - the handshake
//! reply carries the granted geometry, and a peer that has mapped the
//! same bytes attaches with `Smb::from_raw_parts`. Socket framing,
//! authentication and fd passing are deliberately outside this crate.

use crate::config::TraceConfig;
use crate::endpoint::{
    ConsumerPort, DataSourceDescriptor, DataSourceStartup, ProducerPort, ServiceHandle,
};
use crate::{DataSourceId, InstanceId, RequestId, SessionId};
use chunkring::{PageBitmap, ProducerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use trace_collector::Record;

/// Upper bound on one frame; a peer claiming more is broken or hostile.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

// ---------------------------------------------------------------------
// Wire messages (schema-level mirror of the endpoint capability sets)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProducerToService {
    InitializeConnection {
        name: String,
        shmem_size_hint: u64,
    },
    RegisterDataSource {
        descriptor: DataSourceDescriptor,
    },
    UnregisterDataSource {
        data_source_id: DataSourceId,
    },
    NotifyPagesChanged {
        pages: Vec<u64>,
    },
    FlushReply {
        flush_id: RequestId,
    },
    StopDataSourceAck {
        instance_id: InstanceId,
    },
    ActivateTrigger {
        trigger_names: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceToProducer {
    InitializeConnectionReply {
        producer_id: ProducerId,
        granted_size: u64,
        page_size: u64,
        header_word_bits: u8,
    },
    RegisterDataSourceReply {
        result: Result<DataSourceId, String>,
    },
    StartDataSource {
        instance_id: InstanceId,
        startup: DataSourceStartup,
    },
    StopDataSource {
        instance_id: InstanceId,
    },
    FlushRequest {
        flush_id: RequestId,
        instance_ids: Vec<InstanceId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConsumerToService {
    EnableTracing {
        config: TraceConfig,
    },
    DisableTracing {
        session_id: SessionId,
    },
    Flush {
        session_id: SessionId,
        deadline_ms: u32,
        request_id: RequestId,
    },
    ReadBuffers {
        session_id: SessionId,
    },
    FreeBuffers {
        session_id: SessionId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceToConsumer {
    EnableTracingReply {
        result: Result<SessionId, String>,
    },
    Ack {
        result: Result<(), String>,
    },
    FlushReply {
        result: Result<bool, String>,
    },
    ReadBuffersReply {
        records: Vec<Record>,
        has_more: bool,
    },
    TracingDisabled {
        session_id: SessionId,
        reason: Option<String>,
    },
}

// ---------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------

/// Writes one length-prefixed bincode frame.
pub async fn write_frame<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &T,
) -> io::Result<()> {
    let body = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() as u64 > u64::from(MAX_FRAME_LEN) {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Reads one frame; `None` on clean EOF at a frame boundary.
pub async fn read_frame<T: DeserializeOwned, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// ---------------------------------------------------------------------
// Socket serving
// ---------------------------------------------------------------------

/// A [`ProducerPort`] that frames callbacks onto the connection's write
/// half.
struct IpcProducerPort {
    tx: mpsc::UnboundedSender<ServiceToProducer>,
}

impl ProducerPort for IpcProducerPort {
    fn start_data_source(&mut self, instance_id: InstanceId, startup: DataSourceStartup) {
        let _ = self.tx.send(ServiceToProducer::StartDataSource {
            instance_id,
            startup,
        });
    }

    fn stop_data_source(&mut self, instance_id: InstanceId) {
        let _ = self.tx.send(ServiceToProducer::StopDataSource { instance_id });
    }

    fn flush(&mut self, flush_id: RequestId, instance_ids: &[InstanceId]) {
        let _ = self.tx.send(ServiceToProducer::FlushRequest {
            flush_id,
            instance_ids: instance_ids.to_vec(),
        });
    }
}

/// A [`ConsumerPort`] that frames callbacks onto the connection.
struct IpcConsumerPort {
    tx: mpsc::UnboundedSender<ServiceToConsumer>,
}

impl ConsumerPort for IpcConsumerPort {
    fn tracing_disabled(&mut self, session_id: SessionId, reason: Option<String>) {
        let _ = self
            .tx
            .send(ServiceToConsumer::TracingDisabled { session_id, reason });
    }
}

/// Accept loop for the producer socket.
pub async fn serve_producers(listener: UnixListener, handle: ServiceHandle) -> io::Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = producer_connection(stream, handle).await {
                tracing::debug!(error = %e, "producer connection ended with error");
            }
        });
    }
}

async fn producer_connection(stream: UnixStream, handle: ServiceHandle) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    // The first frame must be the handshake.
    let Some(ProducerToService::InitializeConnection {
        name,
        shmem_size_hint,
    }) = read_frame(&mut reader).await?
    else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected InitializeConnection",
        ));
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let port = Box::new(IpcProducerPort { tx: out_tx.clone() });
    let (producer, grant) = handle
        .connect_producer(name, shmem_size_hint as usize, port)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;

    write_frame(
        &mut writer,
        &ServiceToProducer::InitializeConnectionReply {
            producer_id: grant.producer_id,
            granted_size: grant.smb_config.total_len() as u64,
            page_size: grant.smb_config.page_size() as u64,
            header_word_bits: grant.header_word_bits,
        },
    )
    .await?;

    // Writer task: drains port callbacks onto the socket.
    let write_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write_frame(&mut writer, &message).await.is_err() {
                break;
            }
        }
    });

    // Read loop: frames become handle calls. Dropping `producer` at the
    // end (EOF or error) disconnects the peer.
    let result = async {
        while let Some(message) = read_frame::<ProducerToService, _>(&mut reader).await? {
            match message {
                ProducerToService::InitializeConnection { .. } => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "duplicate InitializeConnection",
                    ));
                }
                ProducerToService::RegisterDataSource { descriptor } => {
                    let result = producer
                        .register_data_source(descriptor)
                        .await
                        .map_err(|e| e.to_string());
                    // Replies share the callback stream so the peer sees
                    // one ordered sequence.
                    if out_tx
                        .send(ServiceToProducer::RegisterDataSourceReply { result })
                        .is_err()
                    {
                        break;
                    }
                }
                ProducerToService::UnregisterDataSource { data_source_id } => {
                    producer.unregister_data_source(data_source_id);
                }
                ProducerToService::NotifyPagesChanged { pages } => {
                    producer.notify_pages_changed(PageBitmap::from_words(pages));
                }
                ProducerToService::FlushReply { flush_id } => {
                    producer.flush_reply(flush_id);
                }
                ProducerToService::StopDataSourceAck { instance_id } => {
                    producer.stop_data_source_ack(instance_id);
                }
                ProducerToService::ActivateTrigger { trigger_names } => {
                    producer.activate_trigger(trigger_names);
                }
            }
        }
        Ok(())
    }
    .await;

    drop(producer);
    write_task.abort();
    result
}

/// Accept loop for the consumer socket.
pub async fn serve_consumers(listener: UnixListener, handle: ServiceHandle) -> io::Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = consumer_connection(stream, handle).await {
                tracing::debug!(error = %e, "consumer connection ended with error");
            }
        });
    }
}

async fn consumer_connection(stream: UnixStream, handle: ServiceHandle) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let port = Box::new(IpcConsumerPort { tx: out_tx.clone() });
    let consumer = handle
        .connect_consumer(port)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;

    let write_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write_frame(&mut writer, &message).await.is_err() {
                break;
            }
        }
    });

    let result = async {
        while let Some(message) = read_frame::<ConsumerToService, _>(&mut reader).await? {
            let reply = match message {
                ConsumerToService::EnableTracing { config } => {
                    ServiceToConsumer::EnableTracingReply {
                        result: consumer
                            .enable_tracing(config)
                            .await
                            .map_err(|e| e.to_string()),
                    }
                }
                ConsumerToService::DisableTracing { session_id } => ServiceToConsumer::Ack {
                    result: consumer
                        .disable_tracing(session_id)
                        .await
                        .map_err(|e| e.to_string()),
                },
                ConsumerToService::Flush {
                    session_id,
                    deadline_ms,
                    request_id,
                } => ServiceToConsumer::FlushReply {
                    result: consumer
                        .flush(
                            session_id,
                            Duration::from_millis(u64::from(deadline_ms)),
                            request_id,
                        )
                        .await
                        .map_err(|e| e.to_string()),
                },
                ConsumerToService::ReadBuffers { session_id } => {
                    match consumer.read_buffers(session_id).await {
                        Ok(batch) => ServiceToConsumer::ReadBuffersReply {
                            records: batch.records,
                            has_more: batch.has_more,
                        },
                        Err(e) => ServiceToConsumer::Ack {
                            result: Err(e.to_string()),
                        },
                    }
                }
                ConsumerToService::FreeBuffers { session_id } => ServiceToConsumer::Ack {
                    result: consumer
                        .free_buffers(session_id)
                        .await
                        .map_err(|e| e.to_string()),
                },
            };
            if out_tx.send(reply).is_err() {
                break;
            }
        }
        Ok(())
    }
    .await;

    drop(consumer);
    write_task.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        let msg = ProducerToService::NotifyPagesChanged {
            pages: vec![0b1011, 0],
        };
        write_frame(&mut a, &msg).await.unwrap();
        let back: Option<ProducerToService> = read_frame(&mut b).await.unwrap();
        match back {
            Some(ProducerToService::NotifyPagesChanged { pages }) => {
                assert_eq!(pages, vec![0b1011, 0]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_at_boundary_is_clean() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let got: Option<ConsumerToService> = read_frame(&mut b).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        let err = read_frame::<ConsumerToService, _>(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn config_survives_the_wire_encoding() {
        let config = TraceConfig {
            buffers: vec![crate::config::BufferConfig {
                size_kb: 64,
                fill_policy: crate::config::FillPolicyConfig::RingBuffer,
            }],
            data_sources: Vec::new(),
            duration_ms: Some(5_000),
            write_into_file: false,
            output_path: None,
            file_write_period_ms: None,
            flush_period_ms: None,
            triggers: None,
        };
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        write_frame(&mut a, &ConsumerToService::EnableTracing { config: config.clone() })
            .await
            .unwrap();
        match read_frame::<ConsumerToService, _>(&mut b).await.unwrap() {
            Some(ConsumerToService::EnableTracing { config: back }) => {
                assert_eq!(back, config);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
