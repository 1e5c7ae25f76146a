use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::protocol::astm::constants::{
    ACK, ACK_WAIT_TIMEOUT, ENQ, ENQ_WAIT_TIMEOUT, EOT, MAX_FRAME_ATTEMPTS,
    MAX_FRAME_PAYLOAD, NAK, STX,
};
use crate::protocol::astm::frame::Frame;
use crate::protocol::error::{ProtocolError, Result};

/// Outcome of waiting on an idle link.
#[derive(Debug, PartialEq)]
pub enum IdleEvent {
    /// Remote raised ENQ; the link is about to receive a message.
    Enquiry,
    /// Remote closed the connection.
    Disconnected,
}

/// Outcome of one receive cycle.
#[derive(Debug, PartialEq)]
pub enum LinkEvent {
    /// A complete, non-empty ASTM message (CR-delimited records, trimmed).
    Message(String),
    Disconnected,
}

/// ASTM E1381 link engine over one byte stream.
///
/// The link is half-duplex: a connection is either receiving a message or
/// sending one, never both. The receiver role always wins contention; a
/// reply produced for an inbound message is transmitted only after its EOT.
pub struct AstmLink<S> {
    stream: S,
}

impl<S> AstmLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Idle until the remote raises ENQ or hangs up.
    ///
    /// The 15s establishment deadline re-arms on every expiry, so an idle
    /// but healthy connection is kept open indefinitely. Bytes other than
    /// ENQ are line noise and are ignored.
    ///
    /// Cancel-safe: at most one byte is consumed per wakeup, so this can
    /// sit in a `select!` opposite a shutdown or order channel.
    pub async fn wait_for_enquiry(&mut self) -> Result<IdleEvent> {
        loop {
            match timeout(
                Duration::from_secs(ENQ_WAIT_TIMEOUT),
                self.stream.read_u8(),
            )
            .await
            {
                Err(_) => continue,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(IdleEvent::Disconnected);
                }
                Ok(Err(e)) => return Err(ProtocolError::IoError(e)),
                Ok(Ok(ENQ)) => return Ok(IdleEvent::Enquiry),
                Ok(Ok(byte)) => {
                    log::debug!("Ignoring non-ENQ byte 0x{:02X} on idle link", byte);
                }
            }
        }
    }

    /// Receive one logical message: ACK the pending ENQ, then accept frames
    /// until EOT. Frames with a bad checksum are NAKed and retransmitted by
    /// the remote; their payload is not appended.
    pub async fn receive_after_enquiry(&mut self) -> Result<String> {
        self.stream.write_all(&[ACK]).await?;
        log::debug!("ENQ acknowledged, receiving frames");

        let mut payload: Vec<u8> = Vec::new();
        loop {
            let byte = match timeout(
                Duration::from_secs(ENQ_WAIT_TIMEOUT),
                self.stream.read_u8(),
            )
            .await
            {
                Err(_) => return Err(ProtocolError::Timeout),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(ProtocolError::ConnectionClosed);
                }
                Ok(Err(e)) => return Err(ProtocolError::IoError(e)),
                Ok(Ok(b)) => b,
            };

            match byte {
                EOT => break,
                STX => match Frame::read_after_stx(&mut self.stream).await {
                    Ok(frame) => {
                        log::trace!(
                            "Frame {} accepted ({} bytes, {})",
                            frame.sequence,
                            frame.content.len(),
                            if frame.is_last_frame { "ETX" } else { "ETB" }
                        );
                        payload.extend_from_slice(&frame.content);
                        self.stream.write_all(&[ACK]).await?;
                    }
                    Err(ProtocolError::ChecksumMismatch { expected, actual }) => {
                        log::warn!(
                            "Frame checksum mismatch (expected {}, got {}), sending NAK",
                            expected,
                            actual
                        );
                        self.stream.write_all(&[NAK]).await?;
                    }
                    Err(e) => return Err(e),
                },
                other => {
                    log::debug!("Ignoring unexpected byte 0x{:02X} between frames", other);
                }
            }
        }

        let text = String::from_utf8_lossy(&payload).replace("\r\n", "\r");
        Ok(text.trim().to_string())
    }

    /// Full receiver cycle: idle-wait, then assemble one message. Empty
    /// transmissions (ENQ followed by EOT) return the link to idle.
    pub async fn receive_message(&mut self) -> Result<LinkEvent> {
        loop {
            match self.wait_for_enquiry().await? {
                IdleEvent::Disconnected => return Ok(LinkEvent::Disconnected),
                IdleEvent::Enquiry => {
                    let message = self.receive_after_enquiry().await?;
                    if message.is_empty() {
                        log::debug!("Empty transmission, back to idle");
                        continue;
                    }
                    return Ok(LinkEvent::Message(message));
                }
            }
        }
    }

    /// Sender role: transmit a list of records as one logical message.
    ///
    /// ENQ establishment, one frame per record (ETB-continued when a record
    /// exceeds the frame budget), up to six attempts per frame, EOT
    /// termination.
    pub async fn send_message(&mut self, records: &[String]) -> Result<()> {
        self.stream.write_all(&[ENQ]).await?;
        match self.read_reply_byte().await {
            Ok(ACK) => {}
            Ok(NAK) => return Err(ProtocolError::NotReady),
            Ok(other) => {
                return Err(ProtocolError::EstablishmentFailed(format!(
                    "unexpected reply 0x{:02X} to ENQ",
                    other
                )));
            }
            Err(ProtocolError::Timeout) => {
                return Err(ProtocolError::EstablishmentFailed(
                    "no reply to ENQ".to_string(),
                ));
            }
            Err(e) => return Err(e),
        }

        let mut sequence: u8 = 1;
        for record in records {
            // Each record travels with its CR terminator so the receiver
            // can reassemble record boundaries from concatenated payloads.
            let mut body = record.clone().into_bytes();
            body.push(b'\r');

            let chunks: Vec<&[u8]> = body.chunks(MAX_FRAME_PAYLOAD).collect();
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                let frame = Frame::new(sequence, chunk.to_vec(), i == last);
                sequence = (sequence + 1) % 8;
                self.send_frame_with_retry(&frame).await?;
            }
        }

        self.stream.write_all(&[EOT]).await?;
        log::debug!("Message of {} record(s) sent, EOT written", records.len());
        Ok(())
    }

    async fn send_frame_with_retry(&mut self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        for attempt in 1..=MAX_FRAME_ATTEMPTS {
            self.stream.write_all(&encoded).await?;
            match self.read_reply_byte().await {
                Ok(ACK) => return Ok(()),
                Ok(NAK) => {
                    log::warn!(
                        "Frame {} NAKed (attempt {}/{})",
                        frame.sequence,
                        attempt,
                        MAX_FRAME_ATTEMPTS
                    );
                }
                Ok(other) => {
                    log::warn!(
                        "Unexpected reply 0x{:02X} to frame {} (attempt {}/{})",
                        other,
                        frame.sequence,
                        attempt,
                        MAX_FRAME_ATTEMPTS
                    );
                }
                Err(ProtocolError::Timeout) => {
                    log::warn!(
                        "No reply to frame {} (attempt {}/{})",
                        frame.sequence,
                        attempt,
                        MAX_FRAME_ATTEMPTS
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.stream.write_all(&[EOT]).await?;
        Err(ProtocolError::RetryExhausted)
    }

    async fn read_reply_byte(&mut self) -> Result<u8> {
        match timeout(
            Duration::from_secs(ACK_WAIT_TIMEOUT),
            self.stream.read_u8(),
        )
        .await
        {
            Err(_) => Err(ProtocolError::Timeout),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(ProtocolError::ConnectionClosed)
            }
            Ok(Err(e)) => Err(ProtocolError::IoError(e)),
            Ok(Ok(byte)) => Ok(byte),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn read_wire_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Option<Frame> {
        match reader.read_u8().await.ok()? {
            STX => Frame::read_after_stx(reader).await.ok(),
            EOT => None,
            other => panic!("unexpected byte on wire: 0x{:02X}", other),
        }
    }

    #[tokio::test]
    async fn test_receive_single_message() {
        let (host_side, mut analyzer) = duplex(4096);
        let mut link = AstmLink::new(host_side);

        let driver = tokio::spawn(async move {
            analyzer.write_all(&[ENQ]).await.unwrap();
            assert_eq!(analyzer.read_u8().await.unwrap(), ACK);

            for (i, record) in ["H|\\^&", "P|1", "L|1|N"].iter().enumerate() {
                let frame =
                    Frame::new((i + 1) as u8, format!("{}\r", record).into_bytes(), true);
                analyzer.write_all(&frame.encode()).await.unwrap();
                assert_eq!(analyzer.read_u8().await.unwrap(), ACK);
            }
            analyzer.write_all(&[EOT]).await.unwrap();
        });

        let event = link.receive_message().await.unwrap();
        assert_eq!(
            event,
            LinkEvent::Message("H|\\^&\rP|1\rL|1|N".to_string())
        );
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_checksum_is_naked_and_retransmission_accepted() {
        let (host_side, mut analyzer) = duplex(4096);
        let mut link = AstmLink::new(host_side);

        let driver = tokio::spawn(async move {
            analyzer.write_all(&[ENQ]).await.unwrap();
            assert_eq!(analyzer.read_u8().await.unwrap(), ACK);

            let good = Frame::new(1, b"H|\\^&\r".to_vec(), true).encode();
            let mut corrupt = good.clone();
            let idx = corrupt.len() - 4;
            corrupt[idx] = if corrupt[idx] == b'0' { b'1' } else { b'0' };

            analyzer.write_all(&corrupt).await.unwrap();
            assert_eq!(analyzer.read_u8().await.unwrap(), NAK);

            // Retransmit the same frame number
            analyzer.write_all(&good).await.unwrap();
            assert_eq!(analyzer.read_u8().await.unwrap(), ACK);
            analyzer.write_all(&[EOT]).await.unwrap();
        });

        // Accepted payload contains the retransmitted frame exactly once
        let event = link.receive_message().await.unwrap();
        assert_eq!(event, LinkEvent::Message("H|\\^&".to_string()));
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_accepts_etb_continuations() {
        let (host_side, mut analyzer) = duplex(4096);
        let mut link = AstmLink::new(host_side);

        let driver = tokio::spawn(async move {
            analyzer.write_all(&[ENQ]).await.unwrap();
            assert_eq!(analyzer.read_u8().await.unwrap(), ACK);

            let first = Frame::new(1, b"R|1|^^^^W".to_vec(), false);
            let second = Frame::new(2, b"BC^26|6.42\r".to_vec(), true);
            for frame in [first, second] {
                analyzer.write_all(&frame.encode()).await.unwrap();
                assert_eq!(analyzer.read_u8().await.unwrap(), ACK);
            }
            analyzer.write_all(&[EOT]).await.unwrap();
        });

        let event = link.receive_message().await.unwrap();
        assert_eq!(
            event,
            LinkEvent::Message("R|1|^^^^WBC^26|6.42".to_string())
        );
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_message_frames_and_eot() {
        let (host_side, mut analyzer) = duplex(4096);
        let mut link = AstmLink::new(host_side);

        let records: Vec<String> = ["H|\\^&|||||||||||E1394-97", "P|1", "L|1|N"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let driver = tokio::spawn(async move {
            assert_eq!(analyzer.read_u8().await.unwrap(), ENQ);
            analyzer.write_all(&[ACK]).await.unwrap();

            let mut frames = Vec::new();
            while let Some(frame) = read_wire_frame(&mut analyzer).await {
                analyzer.write_all(&[ACK]).await.unwrap();
                frames.push(frame);
            }
            frames
        });

        link.send_message(&records).await.unwrap();
        let frames = driver.await.unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames.iter().map(|f| f.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(frames.iter().all(|f| f.is_last_frame));
        assert_eq!(frames[0].content, b"H|\\^&|||||||||||E1394-97\r");
        assert_eq!(frames[2].content, b"L|1|N\r");
    }

    #[tokio::test]
    async fn test_send_splits_long_record_with_etb() {
        let (host_side, mut analyzer) = duplex(8192);
        let mut link = AstmLink::new(host_side);

        let long_record = format!("C|1|I|{}", "x".repeat(300));
        let records = vec![long_record.clone()];

        let driver = tokio::spawn(async move {
            assert_eq!(analyzer.read_u8().await.unwrap(), ENQ);
            analyzer.write_all(&[ACK]).await.unwrap();

            let mut frames = Vec::new();
            while let Some(frame) = read_wire_frame(&mut analyzer).await {
                analyzer.write_all(&[ACK]).await.unwrap();
                frames.push(frame);
            }
            frames
        });

        link.send_message(&records).await.unwrap();
        let frames = driver.await.unwrap();

        assert_eq!(frames.len(), 2);
        assert!(!frames[0].is_last_frame);
        assert!(frames[1].is_last_frame);
        assert_eq!(frames[0].content.len(), MAX_FRAME_PAYLOAD);

        let mut reassembled = frames[0].content.clone();
        reassembled.extend_from_slice(&frames[1].content);
        assert_eq!(reassembled, format!("{}\r", long_record).into_bytes());
    }

    #[tokio::test]
    async fn test_send_retry_exhaustion_writes_eot() {
        let (host_side, mut analyzer) = duplex(16384);
        let mut link = AstmLink::new(host_side);

        let driver = tokio::spawn(async move {
            assert_eq!(analyzer.read_u8().await.unwrap(), ENQ);
            analyzer.write_all(&[ACK]).await.unwrap();

            for _ in 0..MAX_FRAME_ATTEMPTS {
                let byte = analyzer.read_u8().await.unwrap();
                assert_eq!(byte, STX);
                Frame::read_after_stx(&mut analyzer).await.unwrap();
                analyzer.write_all(&[NAK]).await.unwrap();
            }
            // After the sixth NAK the sender must give up with EOT
            assert_eq!(analyzer.read_u8().await.unwrap(), EOT);
        });

        let result = link.send_message(&["P|1".to_string()]).await;
        assert!(matches!(result, Err(ProtocolError::RetryExhausted)));
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_nak_after_enq_aborts() {
        let (host_side, mut analyzer) = duplex(1024);
        let mut link = AstmLink::new(host_side);

        let driver = tokio::spawn(async move {
            assert_eq!(analyzer.read_u8().await.unwrap(), ENQ);
            analyzer.write_all(&[NAK]).await.unwrap();
        });

        let result = link.send_message(&["P|1".to_string()]).await;
        assert!(matches!(result, Err(ProtocolError::NotReady)));
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_remote_fails_establishment() {
        let (host_side, _analyzer) = duplex(1024);
        let mut link = AstmLink::new(host_side);

        let result = link.send_message(&["P|1".to_string()]).await;
        assert!(matches!(
            result,
            Err(ProtocolError::EstablishmentFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_reports_disconnect() {
        let (host_side, analyzer) = duplex(1024);
        let mut link = AstmLink::new(host_side);
        drop(analyzer);

        let event = link.receive_message().await.unwrap();
        assert_eq!(event, LinkEvent::Disconnected);
    }
}
