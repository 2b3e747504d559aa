use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Fehler am Hardware-Link. Alles hier ist transient: der Aufrufer
/// markiert das Gerät als getrennt und verbindet nach Cooldown neu.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("E/A-Fehler: {0}")]
    Io(#[from] std::io::Error),
    #[error("Zeitüberschreitung am Link")]
    Timeout,
    #[error("Protokollfehler: {0}")]
    Protocol(String),
}

/// Schlanker Modbus-TCP-Client für Holding-Register: Lesen als Block
/// (Funktion 0x03), Schreiben einzelner Register (Funktion 0x06).
pub struct ModbusLink {
    address: String,
    unit_id: u8,
    io_timeout: Duration,
    stream: Option<TcpStream>,
    txn: u16,
}

impl ModbusLink {
    pub fn new(address: &str, unit_id: u8, io_timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            unit_id,
            io_timeout,
            stream: None,
            txn: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> Result<(), LinkError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = timeout(self.io_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| LinkError::Timeout)??;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Verbindung verwerfen; der nächste Zugriff verbindet neu.
    pub fn reset(&mut self) {
        self.stream = None;
    }

    fn next_txn(&mut self) -> u16 {
        self.txn = self.txn.wrapping_add(1);
        self.txn
    }

    async fn transact(&mut self, pdu: &[u8], expect_fn: u8) -> Result<Vec<u8>, LinkError> {
        let txn = self.next_txn();
        let stream = self.stream.as_mut().ok_or(LinkError::Timeout)?;

        // MBAP-Header: Transaktion, Protokoll 0, Länge, Unit-Id.
        let mut frame = Vec::with_capacity(7 + pdu.len());
        frame.extend_from_slice(&txn.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes()));
        frame.push(self.unit_id);
        frame.extend_from_slice(pdu);

        let io = async {
            stream.write_all(&frame).await?;

            let mut header = [0u8; 7];
            stream.read_exact(&mut header).await?;
            let len = u16::from_be_bytes([header[4], header[5]]) as usize;
            if len < 2 {
                return Ok::<_, std::io::Error>(Err(LinkError::Protocol("leere Antwort".into())));
            }
            let mut body = vec![0u8; len - 1];
            stream.read_exact(&mut body).await?;
            Ok(Ok(body))
        };

        let body = match timeout(self.io_timeout, io).await {
            Ok(Ok(Ok(body))) => body,
            Ok(Ok(Err(e))) => {
                self.reset();
                return Err(e);
            }
            Ok(Err(e)) => {
                self.reset();
                return Err(e.into());
            }
            Err(_) => {
                self.reset();
                return Err(LinkError::Timeout);
            }
        };

        let function = body[0];
        if function == expect_fn | 0x80 {
            let code = body.get(1).copied().unwrap_or(0);
            return Err(LinkError::Protocol(format!("Exception-Code {}", code)));
        }
        if function != expect_fn {
            return Err(LinkError::Protocol(format!("unerwartete Funktion {:#04x}", function)));
        }
        Ok(body)
    }

    /// Liest `count` Holding-Register ab Adresse `start`.
    pub async fn read_holding(&mut self, start: u16, count: u16) -> Result<Vec<u16>, LinkError> {
        self.connect().await?;

        let mut pdu = vec![0x03];
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());

        let body = self.transact(&pdu, 0x03).await?;
        let byte_count = *body.get(1).ok_or_else(|| LinkError::Protocol("Antwort zu kurz".into()))? as usize;
        let data = body.get(2..2 + byte_count).ok_or_else(|| LinkError::Protocol("Antwort zu kurz".into()))?;

        let mut values = Vec::with_capacity(byte_count / 2);
        for chunk in data.chunks_exact(2) {
            values.push(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        if values.len() != count as usize {
            return Err(LinkError::Protocol(format!("{} statt {} Register", values.len(), count)));
        }
        Ok(values)
    }

    /// Schreibt ein einzelnes Holding-Register.
    pub async fn write_single(&mut self, index: u16, value: u16) -> Result<(), LinkError> {
        self.connect().await?;

        let mut pdu = vec![0x06];
        pdu.extend_from_slice(&index.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());

        self.transact(&pdu, 0x06).await.map(|_| ())
    }
}
