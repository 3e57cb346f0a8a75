//! Certificate refresh through a local daemon over TCP.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::LocalDaemon;
use crate::cert::{CertKeyPair, Certificate};
use crate::error::{TrustError, TrustResult};
use crate::keys::{decode_signing_key, encode_signing_key};
use crate::wire::base64_bytes;

/// Replies larger than this are rejected.
const MAX_REPLY_BYTES: u64 = 64 * 1024;

/// Wire shape used in both directions.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DaemonMessage {
    pub certificate: Certificate,
    #[serde(with = "base64_bytes")]
    pub private_key: Vec<u8>,
}

/// Local daemon reached on a loopback TCP port.
///
/// The client writes its current pair as one JSON document, half-closes the
/// connection and reads the refreshed pair back.
#[derive(Debug, Clone)]
pub struct TcpDaemon {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpDaemon {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    async fn exchange(&self, request: &[u8]) -> TrustResult<Vec<u8>> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.write_all(request).await?;
        stream.shutdown().await?;

        let mut reply = Vec::new();
        (&mut stream)
            .take(MAX_REPLY_BYTES)
            .read_to_end(&mut reply)
            .await?;
        Ok(reply)
    }
}

#[async_trait]
impl LocalDaemon for TcpDaemon {
    async fn refresh(&self, current: &CertKeyPair) -> TrustResult<CertKeyPair> {
        let request = serde_json::to_vec(&DaemonMessage {
            certificate: current.certificate.clone(),
            private_key: encode_signing_key(&current.key)?,
        })?;

        let reply = tokio::time::timeout(self.timeout, self.exchange(&request))
            .await
            .map_err(|_| TrustError::Io {
                message: format!("local daemon at {} timed out", self.addr),
            })??;

        let message: DaemonMessage = serde_json::from_slice(&reply)?;
        let key = decode_signing_key(&message.private_key)?;
        let pair = CertKeyPair::new(message.certificate, key);

        if pair.certificate.public_key()? != pair.key.verifying_key() {
            return Err(TrustError::Signature {
                message: "daemon returned a certificate for a different key".to_string(),
            });
        }
        Ok(pair)
    }
}
