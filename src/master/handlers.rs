//! The master's two connection-handler variants: client-facing request
//! serving and participant registration.

use std::sync::Arc;

use async_trait::async_trait;

use tokio::net::TcpStream;

use crate::master::{Coordinator, ParticipantInfo, ReplicaRing};
use crate::utils::{recv_msg, send_msg, TandemError};
use crate::wire::{ConnHandler, Message};

/// Serves client get/put/del requests by driving the coordinator.
pub struct ClientApiHandler {
    coord: Arc<Coordinator>,
}

impl ClientApiHandler {
    pub fn new(coord: Arc<Coordinator>) -> Self {
        ClientApiHandler { coord }
    }

    /// Computes the reply to one client request message.
    pub async fn process(&self, req: Message) -> Message {
        match req {
            Message::GetReq { key } => {
                match self.coord.handle_read(&key).await {
                    Ok(value) => Message::resp_value(value),
                    Err(error) => Message::resp_err(error),
                }
            }
            Message::PutReq { key, value } => {
                match self.coord.handle_write(&key, Some(&value), true).await
                {
                    Ok(()) => Message::resp_ok(),
                    Err(error) => Message::resp_err(error),
                }
            }
            Message::DelReq { key } => {
                match self.coord.handle_write(&key, None, false).await {
                    Ok(()) => Message::resp_ok(),
                    Err(error) => Message::resp_err(error),
                }
            }
            _ => Message::resp_err(TandemError::InvalidFormat),
        }
    }
}

#[async_trait]
impl ConnHandler for ClientApiHandler {
    async fn handle(&self, mut conn: TcpStream) -> Result<(), TandemError> {
        let reply = match recv_msg(&mut conn).await {
            Ok(req) => {
                pf_trace!("m"; "client request {:?}", req);
                self.process(req).await
            }
            Err(_) => Message::resp_err(TandemError::InvalidFormat),
        };

        if let Err(e) = send_msg(&mut conn, &reply).await {
            pf_warn!("m"; "error sending client reply: {}", e);
        }
        Ok(())
    }
}

/// Admits participants into the replica ring.
pub struct RegistrationHandler {
    ring: Arc<ReplicaRing>,
}

impl RegistrationHandler {
    pub fn new(ring: Arc<ReplicaRing>) -> Self {
        RegistrationHandler { ring }
    }

    /// Computes the reply to one registration message.
    pub fn process(&self, req: Message) -> Message {
        match req {
            Message::Register { info } => {
                match info.parse::<ParticipantInfo>() {
                    Ok(parsed) => {
                        self.ring.register(parsed);
                        Message::resp_value(format!("registered {}", info))
                    }
                    Err(error) => Message::resp_err(error),
                }
            }
            _ => Message::resp_err(TandemError::InvalidFormat),
        }
    }
}

#[async_trait]
impl ConnHandler for RegistrationHandler {
    async fn handle(&self, mut conn: TcpStream) -> Result<(), TandemError> {
        let reply = match recv_msg(&mut conn).await {
            Ok(req) => {
                pf_debug!("m"; "registration request {:?}", req);
                self.process(req)
            }
            Err(_) => Message::resp_err(TandemError::InvalidFormat),
        };

        if let Err(e) = send_msg(&mut conn, &reply).await {
            pf_warn!("m"; "error sending registration reply: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod handlers_tests {
    use super::*;
    use std::path::Path;
    use crate::client::KvClient;
    use crate::master::MasterConfig;
    use crate::server::{KvServer, TxnParticipant};
    use crate::wire::serve;
    use crate::workers::WorkerPool;
    use tokio::fs;
    use tokio::net::TcpListener;
    use tokio::sync::watch;
    use tokio::time::Duration;

    #[test]
    fn malformed_registration_rejected() {
        let ring = Arc::new(ReplicaRing::new(2));
        let handler = RegistrationHandler::new(ring.clone());
        assert_eq!(
            handler.process(Message::Register {
                info: "not-an-info".into(),
            }),
            Message::resp_err(TandemError::InvalidFormat)
        );
        assert_eq!(
            handler.process(Message::Ack),
            Message::resp_err(TandemError::InvalidFormat)
        );
        assert_eq!(ring.registered(), 0);
    }

    #[test]
    fn registration_confirms_with_info_echo() {
        let ring = Arc::new(ReplicaRing::new(2));
        let handler = RegistrationHandler::new(ring.clone());
        assert_eq!(
            handler.process(Message::Register {
                info: "7@localhost:5000".into(),
            }),
            Message::resp_value("registered 7@localhost:5000")
        );
        assert_eq!(ring.registered(), 1);
    }

    /// Boots a full cluster on localhost: master listeners on `cli_port` /
    /// `reg_port`, two participants that register themselves over the wire.
    async fn boot_cluster(
        cli_port: u16,
        reg_port: u16,
        part_ports: (u16, u16),
        wal_tag: &str,
    ) -> Result<Vec<watch::Sender<bool>>, TandemError> {
        let config = MasterConfig::default();
        let ring = Arc::new(ReplicaRing::new(2));
        let coord = Arc::new(Coordinator::new(ring.clone(), &config));
        let mut terms = Vec::new();

        // master listeners
        let cli_listener =
            TcpListener::bind(format!("127.0.0.1:{}", cli_port)).await?;
        let reg_listener =
            TcpListener::bind(format!("127.0.0.1:{}", reg_port)).await?;
        let (tx_term, rx_term) = watch::channel(false);
        let api_pool =
            Arc::new(WorkerPool::new("m-api", config.api_workers));
        let reg_pool =
            Arc::new(WorkerPool::new("m-reg", config.reg_workers));
        let api_handler: Arc<dyn ConnHandler> =
            Arc::new(ClientApiHandler::new(coord.clone()));
        let reg_handler: Arc<dyn ConnHandler> =
            Arc::new(RegistrationHandler::new(ring.clone()));
        tokio::spawn(serve(
            "m-api",
            cli_listener,
            api_handler,
            api_pool,
            rx_term.clone(),
        ));
        tokio::spawn(serve(
            "m-reg",
            reg_listener,
            reg_handler,
            reg_pool,
            rx_term,
        ));
        terms.push(tx_term);

        // participants
        for (i, (id, port)) in
            [(10u64, part_ports.0), (20u64, part_ports.1)]
                .into_iter()
                .enumerate()
        {
            let wal = format!("/tmp/test-tandem-hand-{}-{}.wal", wal_tag, i);
            if fs::try_exists(&wal).await? {
                fs::remove_file(&wal).await?;
            }
            let kv = Arc::new(KvServer::new(8, 2));
            let part = Arc::new(
                TxnParticipant::new_and_recover(id, kv, Path::new(&wal))
                    .await?,
            );
            let listener =
                TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
            let pool = Arc::new(WorkerPool::new(format!("p{}", id), 1));
            let (tx_term, rx_term) = watch::channel(false);
            let handler: Arc<dyn ConnHandler> = part.clone();
            tokio::spawn(serve("p", listener, handler, pool, rx_term));
            part.register_with_master(
                &format!("127.0.0.1:{}", reg_port),
                "localhost",
                port,
                Duration::from_millis(3000),
            )
            .await?;
            terms.push(tx_term);
        }

        Ok(terms)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn end_to_end_put_get_del() -> Result<(), TandemError> {
        let _terms = boot_cluster(57500, 57501, (57502, 57503), "0").await?;
        let client = KvClient::new(
            "127.0.0.1:57500".into(),
            Duration::from_millis(3000),
        );

        client.put("a", "1").await?;
        assert_eq!(client.get("a").await, Ok("1".into()));

        client.del("a").await?;
        assert_eq!(client.get("a").await, Err(TandemError::NoSuchKey));
        assert_eq!(client.del("a").await, Err(TandemError::NoSuchKey));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn end_to_end_validation_errors() -> Result<(), TandemError> {
        let _terms = boot_cluster(57504, 57505, (57506, 57507), "1").await?;
        let client = KvClient::new(
            "127.0.0.1:57504".into(),
            Duration::from_millis(3000),
        );

        assert_eq!(
            client.put("a", "").await,
            Err(TandemError::InvalidValue)
        );
        assert_eq!(
            client.put(&"k".repeat(257), "1").await,
            Err(TandemError::OversizedKey)
        );
        assert_eq!(client.put("", "1").await, Err(TandemError::InvalidKey));
        assert_eq!(
            client.get("never-put").await,
            Err(TandemError::NoSuchKey)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn end_to_end_overwrite_and_many_keys() -> Result<(), TandemError>
    {
        let _terms = boot_cluster(57508, 57509, (57510, 57511), "2").await?;
        let client = KvClient::new(
            "127.0.0.1:57508".into(),
            Duration::from_millis(3000),
        );

        for i in 0..10 {
            client.put(&format!("k{}", i), &format!("v{}", i)).await?;
        }
        client.put("k3", "rewritten").await?;
        for i in 0..10 {
            let expect = if i == 3 {
                "rewritten".to_string()
            } else {
                format!("v{}", i)
            };
            assert_eq!(client.get(&format!("k{}", i)).await, Ok(expect));
        }
        Ok(())
    }
}
