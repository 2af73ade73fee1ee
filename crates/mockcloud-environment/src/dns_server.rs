// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authoritative UDP DNS responder.
//!
//! Answers single-question queries from the records of running
//! environments. Each packet is handled independently; malformed packets
//! are dropped without a reply.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use mockcloud_core::Persistence;
use mockcloud_core::persistence::DnsRecordRow;
use mockcloud_protocol::dns::{self, Answer, MAX_UDP_PAYLOAD, Question, Rcode, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Builds responses for query packets.
#[derive(Clone)]
pub struct DnsResponder {
    persistence: Arc<dyn Persistence>,
}

impl DnsResponder {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// The response to `packet`, or `None` when it should be dropped.
    pub async fn respond(&self, packet: &[u8]) -> Option<Bytes> {
        let question = match dns::parse_query(packet) {
            Ok(q) => q,
            Err(e) => {
                debug!(error = %e, len = packet.len(), "Dropping malformed DNS packet");
                return None;
            }
        };
        Some(self.answer(&question).await)
    }

    async fn answer(&self, question: &Question) -> Bytes {
        let Some(record_type) = RecordType::from_code(question.qtype).filter(|t| t.is_answerable())
        else {
            return dns::build_error(question, Rcode::NotImp);
        };

        let rows = match self
            .persistence
            .find_dns_records(&question.name, record_type.as_str())
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(name = %question.name, error = %e, "DNS lookup failed");
                return dns::build_error(question, Rcode::ServFail);
            }
        };
        if rows.is_empty() {
            return dns::build_error(question, Rcode::NxDomain);
        }

        let answers: Vec<Answer> = rows.iter().map(|row| to_answer(row, record_type)).collect();
        match dns::build_response(question, &answers) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(name = %question.name, error = %e, "Stored DNS record cannot be encoded");
                dns::build_error(question, Rcode::ServFail)
            }
        }
    }
}

fn to_answer(row: &DnsRecordRow, record_type: RecordType) -> Answer {
    let narrow = |v: Option<i32>| v.and_then(|v| u16::try_from(v).ok());
    Answer {
        record_type,
        ttl: u32::try_from(row.ttl).unwrap_or(0),
        value: row.value.clone(),
        priority: narrow(row.priority),
        weight: narrow(row.weight),
        port: narrow(row.port),
    }
}

/// UDP listener driving a [`DnsResponder`].
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    responder: DnsResponder,
    shutdown: Arc<Notify>,
}

impl DnsServer {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr, responder: DnsResponder) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            responder,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Serve until shutdown is signalled.
    pub async fn run(&self) {
        info!(addr = ?self.socket.local_addr().ok(), "DNS server started");
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("DNS server received shutdown signal");
                    break;
                }

                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(error = %e, "DNS receive failed");
                            continue;
                        }
                    };
                    let packet = buf[..len].to_vec();
                    let socket = self.socket.clone();
                    let responder = self.responder.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = responder.respond(&packet).await
                            && let Err(e) = socket.send_to(&reply, peer).await
                        {
                            warn!(peer = %peer, error = %e, "DNS send failed");
                        }
                    });
                }
            }
        }

        info!("DNS server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mockcloud_core::SqlitePersistence;
    use mockcloud_core::persistence::EnvironmentRecord;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn persistence() -> Arc<dyn Persistence> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        mockcloud_core::migrations::run_sqlite(&pool).await.unwrap();
        Arc::new(SqlitePersistence::new(pool))
    }

    async fn environment(persistence: &Arc<dyn Persistence>, id: &str, status: &str) {
        let now = Utc::now();
        persistence
            .insert_environment(&EnvironmentRecord {
                id: id.to_string(),
                user_id: "alice".to_string(),
                name: "dns".to_string(),
                status: status.to_string(),
                services: "{}".to_string(),
                endpoints: "{}".to_string(),
                hourly_rate: 0.0,
                total_cost: 0.0,
                auto_shutdown_hours: 0,
                error: None,
                created_at: now,
                started_at: None,
                stopped_at: None,
                last_activity: now,
            })
            .await
            .unwrap();
    }

    async fn record(persistence: &Arc<dyn Persistence>, env: &str, name: &str, kind: &str, value: &str) {
        persistence
            .insert_dns_record(&DnsRecordRow {
                id: uuid::Uuid::new_v4().to_string(),
                environment_id: env.to_string(),
                name: name.to_string(),
                record_type: kind.to_string(),
                value: value.to_string(),
                ttl: 300,
                priority: None,
                weight: None,
                port: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn parse_question_name(reply: &[u8]) -> String {
        assert_eq!(u16::from_be_bytes([reply[4], reply[5]]), 1);
        dns::parse_query(reply).unwrap().name
    }

    fn rcode(reply: &[u8]) -> u16 {
        u16::from_be_bytes([reply[2], reply[3]]) & 0x000F
    }

    #[tokio::test]
    async fn test_a_record_answer() {
        let persistence = persistence().await;
        environment(&persistence, "env-aaaaaaaaaaaa", "running").await;
        record(&persistence, "env-aaaaaaaaaaaa", "api.example.test", "A", "10.1.2.3").await;

        let responder = DnsResponder::new(persistence);
        let query = dns::build_query(0x1234, "API.example.test", 1).unwrap();
        let reply = responder.respond(&query).await.unwrap();

        assert_eq!(&reply[..2], &[0x12, 0x34]);
        assert_eq!(u16::from_be_bytes([reply[2], reply[3]]), dns::FLAGS_ANSWER);
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 1);
        assert_eq!(&reply[reply.len() - 6..reply.len() - 4], &[0, 4]);
        assert_eq!(&reply[reply.len() - 4..], &[10, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_nxdomain_for_missing_or_stopped() {
        let persistence = persistence().await;
        environment(&persistence, "env-bbbbbbbbbbbb", "stopped").await;
        record(&persistence, "env-bbbbbbbbbbbb", "db.example.test", "A", "10.0.0.9").await;

        let responder = DnsResponder::new(persistence);
        for name in ["missing.example.test", "db.example.test"] {
            let reply = responder
                .respond(&dns::build_query(7, name, 1).unwrap())
                .await
                .unwrap();
            assert_eq!(rcode(&reply), 3, "{name}");
            assert_eq!(parse_question_name(&reply), name);
        }
    }

    #[tokio::test]
    async fn test_unsupported_type_and_malformed() {
        let responder = DnsResponder::new(persistence().await);

        let soa = responder
            .respond(&dns::build_query(9, "example.test", 6).unwrap())
            .await
            .unwrap();
        assert_eq!(rcode(&soa), 4);

        let any = responder
            .respond(&dns::build_query(9, "example.test", 255).unwrap())
            .await
            .unwrap();
        assert_eq!(rcode(&any), 4);

        assert!(responder.respond(&[0u8; 5]).await.is_none());
    }

    #[tokio::test]
    async fn test_unencodable_value_is_servfail() {
        let persistence = persistence().await;
        environment(&persistence, "env-cccccccccccc", "running").await;
        record(&persistence, "env-cccccccccccc", "bad.example.test", "A", "not-an-ip").await;

        let responder = DnsResponder::new(persistence);
        let reply = responder
            .respond(&dns::build_query(1, "bad.example.test", 1).unwrap())
            .await
            .unwrap();
        assert_eq!(rcode(&reply), 2);
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let persistence = persistence().await;
        environment(&persistence, "env-dddddddddddd", "running").await;
        record(&persistence, "env-dddddddddddd", "txt.example.test", "TXT", "hello").await;

        let server = DnsServer::bind("127.0.0.1:0".parse().unwrap(), DnsResponder::new(persistence))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(async move { server.run().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&dns::build_query(42, "txt.example.test", 16).unwrap(), addr)
            .await
            .unwrap();
        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(std::time::Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rcode(&buf[..len]), 0);
        assert!(buf[..len].ends_with(b"\x05hello"));

        shutdown.notify_one();
        handle.await.unwrap();
    }
}
