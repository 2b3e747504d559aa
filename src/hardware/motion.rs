use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::modbus::LinkError;
use crate::core::types::Robot;

// Kommando-Codes des Fahrzeug-Protokolls.
const CODE_NAVIGATE: u16 = 3051;
const CODE_SET_LIFT: u16 = 3057;
const CODE_SET_VIRTUAL_DI: u16 = 6020;

const SYNC_BYTE: u8 = 0x5A;
const PROTOCOL_VERSION: u8 = 0x01;

/// Kommando-Kanal zum Fahrzeug. Kein Antwort-Handling: ob ein Befehl
/// wirkt, wird über die Roboter-Registry beobachtet.
#[async_trait]
pub trait MotionPort: Send + Sync {
    async fn navigate(&self, robot: &Robot, target_station_id: &str, task_id: &str) -> Result<(), LinkError>;
    async fn set_lift(&self, robot: &Robot, height_m: f64) -> Result<(), LinkError>;
    async fn set_virtual_input(&self, robot: &Robot, index: u16, value: bool) -> Result<(), LinkError>;
}

/// TCP-Implementierung: 16-Byte-Header + UTF-8-JSON-Body, eine
/// Verbindung pro Befehl, nach dem Schreiben geschlossen.
pub struct TcpMotionAdapter {
    port: u16,
    io_timeout: Duration,
    serial: AtomicU16,
}

impl TcpMotionAdapter {
    pub fn new(port: u16, io_timeout: Duration) -> Self {
        Self { port, io_timeout, serial: AtomicU16::new(0) }
    }

    /// Header: Sync, Version, laufende Seriennummer, Body-Länge,
    /// Kommando-Code, 6 Reserve-Bytes.
    fn frame(&self, code: u16, body: &[u8]) -> Vec<u8> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let mut frame = Vec::with_capacity(16 + body.len());
        frame.push(SYNC_BYTE);
        frame.push(PROTOCOL_VERSION);
        frame.extend_from_slice(&serial.to_be_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&code.to_be_bytes());
        frame.extend_from_slice(&[0u8; 6]);
        frame.extend_from_slice(body);
        frame
    }

    async fn send(&self, robot: &Robot, code: u16, body: serde_json::Value) -> Result<(), LinkError> {
        let body = serde_json::to_vec(&body)
            .map_err(|e| LinkError::Protocol(format!("Body nicht serialisierbar: {}", e)))?;
        let frame = self.frame(code, &body);
        let address = format!("{}:{}", robot.address, self.port);

        let io = async {
            let mut stream = TcpStream::connect(&address).await?;
            stream.write_all(&frame).await?;
            stream.shutdown().await?;
            Ok::<_, std::io::Error>(())
        };

        match timeout(self.io_timeout, io).await {
            Ok(Ok(())) => {
                debug!("📤 Befehl {} an {} gesendet ({} Bytes).", code, robot.id, frame.len());
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(LinkError::Timeout),
        }
    }
}

#[async_trait]
impl MotionPort for TcpMotionAdapter {
    async fn navigate(&self, robot: &Robot, target_station_id: &str, task_id: &str) -> Result<(), LinkError> {
        self.send(
            robot,
            CODE_NAVIGATE,
            serde_json::json!({
                "id": target_station_id,
                "source_id": robot.location_station_id,
                "task_id": task_id,
            }),
        )
        .await
    }

    async fn set_lift(&self, robot: &Robot, height_m: f64) -> Result<(), LinkError> {
        self.send(robot, CODE_SET_LIFT, serde_json::json!({ "height": height_m })).await
    }

    async fn set_virtual_input(&self, robot: &Robot, index: u16, value: bool) -> Result<(), LinkError> {
        self.send(
            robot,
            CODE_SET_VIRTUAL_DI,
            serde_json::json!({ "id": index, "status": value }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frame_layout_is_sixteen_bytes_plus_json() {
        let adapter = TcpMotionAdapter::new(19206, Duration::from_millis(200));
        let body = br#"{"height":0.06}"#;
        let frame = adapter.frame(CODE_SET_LIFT, body);

        assert_eq!(frame.len(), 16 + body.len());
        assert_eq!(frame[0], SYNC_BYTE);
        assert_eq!(frame[1], PROTOCOL_VERSION);
        assert_eq!(u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]), body.len() as u32);
        assert_eq!(u16::from_be_bytes([frame[8], frame[9]]), CODE_SET_LIFT);
        assert_eq!(&frame[10..16], &[0u8; 6]);
    }

    #[tokio::test]
    async fn serial_rolls_per_command() {
        let adapter = TcpMotionAdapter::new(19206, Duration::from_millis(200));
        let a = adapter.frame(CODE_NAVIGATE, b"{}");
        let b = adapter.frame(CODE_NAVIGATE, b"{}");
        let sa = u16::from_be_bytes([a[2], a[3]]);
        let sb = u16::from_be_bytes([b[2], b[3]]);
        assert_eq!(sb, sa.wrapping_add(1));
    }

    #[tokio::test]
    async fn navigate_sends_one_shot_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            socket.read_to_end(&mut data).await.unwrap();
            data
        });

        let adapter = TcpMotionAdapter::new(port, Duration::from_millis(500));
        let robot = Robot::new("amr-1", "AMR-1", "127.0.0.1");
        adapter.navigate(&robot, "15", "task-1").await.unwrap();

        let data = server.await.unwrap();
        assert_eq!(data[0], SYNC_BYTE);
        let body: serde_json::Value = serde_json::from_slice(&data[16..]).unwrap();
        assert_eq!(body["id"], "15");
        assert_eq!(body["task_id"], "task-1");
    }

    #[tokio::test]
    async fn unreachable_robot_is_a_transient_error() {
        // Hermetisch: Port reservieren, Listener schließen und gegen den
        // nun geschlossenen Port verbinden (ECONNREFUSED).
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let adapter = TcpMotionAdapter::new(port, Duration::from_millis(50));
        let robot = Robot::new("amr-1", "AMR-1", "127.0.0.1");
        let err = adapter.set_lift(&robot, 0.06).await.unwrap_err();
        assert!(matches!(err, LinkError::Timeout | LinkError::Io(_)));
    }
}
