use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::astm::constants::{CR, ETB, ETX, LF, STX};
use crate::protocol::error::{ProtocolError, Result};

/// A single ASTM E1381 frame at the data link layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame number, modulo 8 (senders cycle 1,2,..,7,0,1,..)
    pub sequence: u8,
    /// Frame payload (without STX, sequence, terminator, checksum)
    pub content: Vec<u8>,
    /// ETX (last frame of a logical message) vs ETB (continuation)
    pub is_last_frame: bool,
}

impl Frame {
    pub fn new(sequence: u8, content: Vec<u8>, is_last_frame: bool) -> Self {
        Self {
            sequence: sequence % 8,
            content,
            is_last_frame,
        }
    }

    /// Encode the frame to wire bytes:
    /// STX seq payload ETX|ETB checksum(2 hex) CR LF
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.content.len() + 7);

        buffer.push(STX);
        buffer.push(self.sequence + b'0');
        buffer.extend_from_slice(&self.content);
        buffer.push(if self.is_last_frame { ETX } else { ETB });

        // Checksum covers sequence, payload and terminator
        let checksum = Self::calculate_checksum(&buffer[1..]);
        buffer.extend_from_slice(format!("{:02X}", checksum).as_bytes());

        buffer.push(CR);
        buffer.push(LF);

        buffer
    }

    /// Parse a complete frame from a byte slice.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() || data[0] != STX {
            return Err(ProtocolError::MissingStx);
        }
        if data.len() < 7 {
            return Err(ProtocolError::Truncated);
        }

        let sequence = ascii_frame_number(data[1])?;

        let end_position = data[2..]
            .iter()
            .position(|&b| b == ETX || b == ETB)
            .map(|p| p + 2)
            .ok_or(ProtocolError::Truncated)?;
        let is_last_frame = data[end_position] == ETX;

        if data.len() < end_position + 5 {
            return Err(ProtocolError::Truncated);
        }
        if data[end_position + 3] != CR || data[end_position + 4] != LF {
            return Err(ProtocolError::BadTrailer);
        }

        let received = parse_checksum(&data[end_position + 1..end_position + 3])?;
        let computed = Self::calculate_checksum(&data[1..=end_position]);
        if received != computed {
            return Err(ProtocolError::ChecksumMismatch {
                expected: format!("{:02X}", computed),
                actual: format!("{:02X}", received),
            });
        }

        Ok(Self {
            sequence,
            content: data[2..end_position].to_vec(),
            is_last_frame,
        })
    }

    /// Read one frame from the stream, STX already consumed by the caller.
    ///
    /// Checksum mismatches are reported without consuming further bytes so
    /// the link layer can NAK and wait for the retransmission.
    pub async fn read_after_stx<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let sequence = ascii_frame_number(read_byte(reader).await?)?;

        let mut content = Vec::new();
        let terminator = loop {
            let byte = read_byte(reader).await?;
            if byte == ETX || byte == ETB {
                break byte;
            }
            content.push(byte);
        };
        let is_last_frame = terminator == ETX;

        let checksum_bytes = [read_byte(reader).await?, read_byte(reader).await?];
        if read_byte(reader).await? != CR || read_byte(reader).await? != LF {
            return Err(ProtocolError::BadTrailer);
        }

        let received = parse_checksum(&checksum_bytes)?;
        let mut covered = Vec::with_capacity(content.len() + 2);
        covered.push(sequence + b'0');
        covered.extend_from_slice(&content);
        covered.push(terminator);
        let computed = Self::calculate_checksum(&covered);

        if received != computed {
            return Err(ProtocolError::ChecksumMismatch {
                expected: format!("{:02X}", computed),
                actual: format!("{:02X}", received),
            });
        }

        Ok(Self {
            sequence,
            content,
            is_last_frame,
        })
    }

    /// Modulo-256 sum of the covered bytes.
    pub fn calculate_checksum(data: &[u8]) -> u8 {
        let sum: u32 = data.iter().map(|&b| b as u32).sum();
        (sum % 256) as u8
    }
}

fn ascii_frame_number(byte: u8) -> Result<u8> {
    match byte {
        b'0'..=b'7' => Ok(byte - b'0'),
        _ => Err(ProtocolError::BadTrailer),
    }
}

/// Two hex characters, compared case-insensitively.
fn parse_checksum(checksum_bytes: &[u8]) -> Result<u8> {
    let hex_str =
        std::str::from_utf8(checksum_bytes).map_err(|_| ProtocolError::BadTrailer)?;
    u8::from_str_radix(hex_str, 16).map_err(|_| ProtocolError::BadTrailer)
}

async fn read_byte<R>(reader: &mut R) -> Result<u8>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u8().await {
        Ok(byte) => Ok(byte),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::Truncated)
        }
        Err(e) => Err(ProtocolError::IoError(e)),
    }
}
